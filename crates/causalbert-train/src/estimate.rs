//! ATE / ATT reduction over potential-outcome predictions.
//!
//! Effects use the `Q0 - Q1` sign convention. Optional Platt
//! recalibration fits one calibrator per arm against the observed outcomes
//! before reducing.

use causalbert_core::{CausalEstimate, Example, Prediction, Result};

use crate::calibration::PlattCalibrator;

/// Anything that can produce per-example potential-outcome predictions.
pub trait PotentialOutcomeModel {
    /// Predictions in example order. Must not update parameters.
    fn predict(&self, examples: &[Example]) -> Result<Vec<Prediction>>;
}

/// Where ATT takes the treated set from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreatmentSource {
    /// `example.treatment == Some(1)`.
    Observed,
    /// Rounded predicted propensity (`g > 0.5`).
    Inferred,
}

/// Average treatment effect over every example.
pub fn ate(
    model: &dyn PotentialOutcomeModel,
    examples: &[Example],
    recalibrate: bool,
) -> Result<CausalEstimate> {
    let predictions = model.predict(examples)?;
    let (predictions, recalibrated) = maybe_recalibrate(predictions, recalibrate);
    Ok(ate_from_predictions(&predictions, recalibrated))
}

/// Average treatment effect on the treated.
///
/// An empty treated set yields `value: None` rather than an error.
pub fn att(
    model: &dyn PotentialOutcomeModel,
    examples: &[Example],
    source: TreatmentSource,
    recalibrate: bool,
) -> Result<CausalEstimate> {
    let predictions = model.predict(examples)?;
    let treated: Vec<bool> = match source {
        TreatmentSource::Observed => examples.iter().map(|e| e.treatment == Some(1)).collect(),
        TreatmentSource::Inferred => predictions.iter().map(|p| p.propensity > 0.5).collect(),
    };
    let (predictions, recalibrated) = maybe_recalibrate(predictions, recalibrate);
    Ok(att_from_predictions(&predictions, &treated, recalibrated))
}

pub fn ate_from_predictions(predictions: &[Prediction], recalibrated: bool) -> CausalEstimate {
    mean_effect(predictions.iter(), recalibrated)
}

/// ATT over the rows flagged in `treated`; rows beyond its length count as
/// untreated.
pub fn att_from_predictions(
    predictions: &[Prediction],
    treated: &[bool],
    recalibrated: bool,
) -> CausalEstimate {
    let rows = predictions
        .iter()
        .zip(treated)
        .filter(|(_, t)| **t)
        .map(|(p, _)| p);
    mean_effect(rows, recalibrated)
}

fn mean_effect<'a>(
    rows: impl Iterator<Item = &'a Prediction>,
    recalibrated: bool,
) -> CausalEstimate {
    let (sum, n) = rows.fold((0.0, 0usize), |(s, n), p| (s + (p.q0 - p.q1), n + 1));
    CausalEstimate {
        value: (n > 0).then(|| sum / n as f64),
        support: n,
        recalibrated,
    }
}

/// Per-arm Platt calibrators fitted on rows with a known outcome.
#[derive(Debug, Clone, Copy)]
pub struct ArmCalibrators {
    pub control: PlattCalibrator,
    pub treated: PlattCalibrator,
}

impl ArmCalibrators {
    /// Fit `Q0 → Y` and `Q1 → Y` on every prediction with an outcome.
    ///
    /// # Errors
    ///
    /// Fails when the known outcomes are not binary or cover one class.
    pub fn fit(predictions: &[Prediction]) -> Result<Self> {
        let labelled: Vec<(&Prediction, f64)> = predictions
            .iter()
            .filter_map(|p| p.outcome.map(|y| (p, y)))
            .collect();
        let labels: Vec<f64> = labelled.iter().map(|(_, y)| *y).collect();
        let q0: Vec<f64> = labelled.iter().map(|(p, _)| p.q0).collect();
        let q1: Vec<f64> = labelled.iter().map(|(p, _)| p.q1).collect();
        Ok(Self {
            control: PlattCalibrator::fit(&q0, &labels)?,
            treated: PlattCalibrator::fit(&q1, &labels)?,
        })
    }

    pub fn apply(&self, predictions: &[Prediction]) -> Vec<Prediction> {
        predictions
            .iter()
            .map(|p| Prediction {
                q0: self.control.apply(p.q0),
                q1: self.treated.apply(p.q1),
                ..*p
            })
            .collect()
    }
}

/// Recalibrated predictions, or the raw ones with a warning when the
/// calibrators cannot be fitted.
pub fn recalibrate(predictions: Vec<Prediction>) -> (Vec<Prediction>, bool) {
    match ArmCalibrators::fit(&predictions) {
        Ok(cal) => {
            tracing::debug!(
                control_slope = cal.control.slope,
                treated_slope = cal.treated.slope,
                "Platt calibrators fitted"
            );
            (cal.apply(&predictions), true)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Skipping recalibration");
            (predictions, false)
        }
    }
}

fn maybe_recalibrate(predictions: Vec<Prediction>, enabled: bool) -> (Vec<Prediction>, bool) {
    if enabled {
        recalibrate(predictions)
    } else {
        (predictions, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fixed `Q0`, `Q1` for every row; propensity from the text length.
    struct ConstantModel {
        q0: f64,
        q1: f64,
    }

    impl PotentialOutcomeModel for ConstantModel {
        fn predict(&self, examples: &[Example]) -> Result<Vec<Prediction>> {
            Ok(examples
                .iter()
                .map(|e| Prediction {
                    q0: self.q0,
                    q1: self.q1,
                    propensity: if e.text.len() > 3 { 0.9 } else { 0.1 },
                    outcome: e.outcome,
                })
                .collect())
        }
    }

    fn examples() -> Vec<Example> {
        vec![
            Example::new("long text", 0).with_treatment(1).with_outcome(1.0),
            Example::new("ab", 1).with_treatment(0).with_outcome(0.0),
            Example::new("abc", 0).with_treatment(0).with_outcome(1.0),
        ]
    }

    #[test]
    fn test_ate_constant_heads() {
        let model = ConstantModel { q0: 0.3, q1: 0.7 };
        let est = ate(&model, &examples(), false).unwrap();
        assert!((est.value.unwrap() - (-0.4)).abs() < 1e-12);
        assert_eq!(est.support, 3);
        assert!(!est.recalibrated);
    }

    #[test]
    fn test_att_all_control_is_undefined() {
        let model = ConstantModel { q0: 0.3, q1: 0.7 };
        let control: Vec<Example> = (0..4)
            .map(|i| Example::new("ab", 0).with_treatment(0).with_outcome(f64::from(i % 2)))
            .collect();
        let est = att(&model, &control, TreatmentSource::Observed, false).unwrap();
        assert_eq!(est.value, None);
        assert_eq!(est.support, 0);
        assert_eq!(est.to_string(), "undefined (n=0)");
    }

    #[test]
    fn test_att_observed_and_inferred() {
        let model = ConstantModel { q0: 0.3, q1: 0.7 };
        let observed = att(&model, &examples(), TreatmentSource::Observed, false).unwrap();
        assert_eq!(observed.support, 1);
        let inferred = att(&model, &examples(), TreatmentSource::Inferred, false).unwrap();
        assert_eq!(inferred.support, 1);
        assert!((inferred.value.unwrap() + 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_att_from_predictions_selects_treated_rows() {
        let preds = [(0.9, 0.1), (0.2, 0.6), (0.4, 0.4)].map(|(q0, q1)| Prediction {
            q0,
            q1,
            propensity: 0.5,
            outcome: None,
        });
        let est = att_from_predictions(&preds, &[false, true, true], false);
        assert_eq!(est.support, 2);
        assert!((est.value.unwrap() - (-0.2)).abs() < 1e-12);
    }

    #[test]
    fn test_recalibration_skipped_for_single_class() {
        let model = ConstantModel { q0: 0.3, q1: 0.7 };
        let ones: Vec<Example> = (0..3)
            .map(|_| Example::new("ab", 0).with_treatment(1).with_outcome(1.0))
            .collect();
        let est = ate(&model, &ones, true).unwrap();
        assert!(!est.recalibrated);
        assert!((est.value.unwrap() + 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_recalibration_applies_per_arm() {
        let rows = [
            (0.2, 0.6, 0.0),
            (0.3, 0.7, 1.0),
            (0.4, 0.8, 0.0),
            (0.5, 0.9, 1.0),
        ];
        let preds: Vec<Prediction> = rows
            .iter()
            .map(|&(q0, q1, y)| Prediction {
                q0,
                q1,
                propensity: 0.5,
                outcome: Some(y),
            })
            .collect();
        let (out, recalibrated) = recalibrate(preds.clone());
        assert!(recalibrated);
        for w in out.windows(2) {
            assert!(w[0].q0 <= w[1].q0);
            assert!(w[0].q1 <= w[1].q1);
        }
        assert_eq!(out[0].propensity, 0.5);
        assert_eq!(out[3].outcome, Some(1.0));
    }
}
