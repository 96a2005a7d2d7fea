//! Platt recalibration of predicted probabilities.
//!
//! A one-feature logistic regression on `logit(p)` is fitted by Newton's
//! method. The slope is constrained to be non-negative so the calibrated
//! probability is monotone in the raw one.

use causalbert_core::{CausalBertError, Result};

/// Raw probabilities are clipped to `[EPS, 1 - EPS]` before the logit.
const EPS: f64 = 1e-7;

/// Fitting hyperparameters.
#[derive(Debug, Clone, Copy)]
pub struct PlattConfig {
    pub max_iter: usize,
    /// Ridge on both coefficients; keeps separable data finite.
    pub l2_lambda: f64,
    pub tolerance: f64,
}

impl Default for PlattConfig {
    fn default() -> Self {
        Self {
            max_iter: 100,
            l2_lambda: 1e-6,
            tolerance: 1e-10,
        }
    }
}

/// Numerically stable sigmoid.
fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let ez = z.exp();
        ez / (1.0 + ez)
    }
}

fn logit(p: f64) -> f64 {
    let p = p.clamp(EPS, 1.0 - EPS);
    (p / (1.0 - p)).ln()
}

/// `p ↦ σ(slope · logit(p) + intercept)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlattCalibrator {
    pub slope: f64,
    pub intercept: f64,
}

impl PlattCalibrator {
    /// Fit on `(raw probability, binary label)` pairs.
    ///
    /// # Errors
    ///
    /// [`CausalBertError::Data`] when lengths differ, a label is not 0/1, or
    /// only one class is present.
    pub fn fit(probs: &[f64], labels: &[f64]) -> Result<Self> {
        Self::fit_with(probs, labels, &PlattConfig::default())
    }

    pub fn fit_with(probs: &[f64], labels: &[f64], cfg: &PlattConfig) -> Result<Self> {
        if probs.len() != labels.len() {
            return Err(CausalBertError::Data(format!(
                "{} probabilities but {} labels",
                probs.len(),
                labels.len()
            )));
        }
        if labels.iter().any(|&y| y != 0.0 && y != 1.0) {
            return Err(CausalBertError::Data(
                "recalibration labels must be 0 or 1".to_string(),
            ));
        }
        let positives = labels.iter().filter(|&&y| y == 1.0).count();
        if positives == 0 || positives == labels.len() {
            return Err(CausalBertError::Data(
                "recalibration needs both outcome classes".to_string(),
            ));
        }

        let xs: Vec<f64> = probs.iter().map(|&p| logit(p)).collect();
        let loss = |a: f64, b: f64| -> f64 {
            let nll: f64 = xs
                .iter()
                .zip(labels)
                .map(|(&x, &y)| {
                    let z = a * x + b;
                    // log(1 + e^z) - y·z, stable for both signs of z
                    z.max(0.0) + (-z.abs()).exp().ln_1p() - y * z
                })
                .sum();
            nll + 0.5 * cfg.l2_lambda * (a * a + b * b)
        };

        let (mut a, mut b) = (1.0_f64, 0.0_f64);
        let mut current = loss(a, b);
        for _ in 0..cfg.max_iter {
            let (mut ga, mut gb) = (cfg.l2_lambda * a, cfg.l2_lambda * b);
            let (mut haa, mut hab, mut hbb) = (cfg.l2_lambda, 0.0, cfg.l2_lambda);
            for (&x, &y) in xs.iter().zip(labels) {
                let p = sigmoid(a * x + b);
                let w = p * (1.0 - p);
                ga += (p - y) * x;
                gb += p - y;
                haa += w * x * x;
                hab += w * x;
                hbb += w;
            }
            let det = haa * hbb - hab * hab;
            if !det.is_finite() || det.abs() < f64::MIN_POSITIVE {
                break;
            }
            let da = (hbb * ga - hab * gb) / det;
            let db = (haa * gb - hab * ga) / det;

            // Backtrack until the objective does not increase.
            let mut step = 1.0;
            let mut next = loss(a - step * da, b - step * db);
            while next > current && step > 1e-8 {
                step *= 0.5;
                next = loss(a - step * da, b - step * db);
            }
            a -= step * da;
            b -= step * db;
            let moved = step * (da.abs() + db.abs());
            current = next;
            if moved < cfg.tolerance {
                break;
            }
        }

        if a < 0.0 {
            // Anti-correlated scores: the best monotone map is constant.
            let base_rate = positives as f64 / labels.len() as f64;
            tracing::warn!(slope = a, "Platt slope negative; using the base rate");
            return Ok(Self {
                slope: 0.0,
                intercept: logit(base_rate),
            });
        }

        Ok(Self {
            slope: a,
            intercept: b,
        })
    }

    pub fn apply(&self, p: f64) -> f64 {
        sigmoid(self.slope * logit(p) + self.intercept)
    }

    pub fn apply_all(&self, probs: &[f64]) -> Vec<f64> {
        probs.iter().map(|&p| self.apply(p)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preserves_rank_order() {
        let probs = [0.05, 0.2, 0.3, 0.45, 0.5, 0.6, 0.7, 0.8, 0.9, 0.95];
        let labels = [0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0];
        let cal = PlattCalibrator::fit(&probs, &labels).unwrap();
        assert!(cal.slope > 0.0);
        let out = cal.apply_all(&probs);
        for w in out.windows(2) {
            assert!(w[0] < w[1], "calibrated values not increasing: {out:?}");
        }
        assert!(out.iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn test_overconfident_scores_are_softened() {
        // Raw scores are extreme but only right 75% of the time.
        let probs = [0.01, 0.01, 0.01, 0.01, 0.99, 0.99, 0.99, 0.99];
        let labels = [0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 0.0];
        let cal = PlattCalibrator::fit(&probs, &labels).unwrap();
        assert!((cal.apply(0.99) - 0.75).abs() < 1e-3);
        assert!((cal.apply(0.01) - 0.25).abs() < 1e-3);
    }

    #[test]
    fn test_anti_correlated_falls_back_to_constant() {
        let probs = [0.1, 0.2, 0.8, 0.9];
        let labels = [1.0, 1.0, 0.0, 0.0];
        let cal = PlattCalibrator::fit(&probs, &labels).unwrap();
        assert_eq!(cal.slope, 0.0);
        assert!((cal.apply(0.1) - 0.5).abs() < 1e-9);
        assert!((cal.apply(0.9) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_separable_data_stays_finite() {
        let probs = [0.1, 0.2, 0.3, 0.7, 0.8, 0.9];
        let labels = [0.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let cal = PlattCalibrator::fit(&probs, &labels).unwrap();
        assert!(cal.slope.is_finite() && cal.intercept.is_finite());
        assert!(cal.apply(0.9) > cal.apply(0.1));
    }

    #[test]
    fn test_rejects_single_class_and_bad_labels() {
        assert!(PlattCalibrator::fit(&[0.2, 0.4], &[1.0, 1.0]).is_err());
        assert!(PlattCalibrator::fit(&[0.2, 0.4], &[0.0, 0.5]).is_err());
        assert!(PlattCalibrator::fit(&[0.2], &[0.0, 1.0]).is_err());
    }
}
