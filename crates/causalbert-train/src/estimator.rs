//! High-level estimator: examples in, loss histories and effects out.

use std::path::Path;

use candle_core::Device;
use causalbert_core::{
    CausalEstimate, EpochLosses, Example, LossHistory, ModelConfig, Prediction, Result, TrainConfig,
};
use causalbert_model::{from_pretrained, CausalBert, TextTokenizer};

use crate::data::TokenizedDataset;
use crate::estimate::{self, PotentialOutcomeModel, TreatmentSource};
use crate::inference;
use crate::trainer::{Trainer, TrainingReport};

/// A [`CausalBert`] paired with its tokenizer and training settings.
pub struct CausalBertEstimator {
    model: CausalBert,
    tokenizer: Box<dyn TextTokenizer>,
    train_config: TrainConfig,
}

impl CausalBertEstimator {
    pub fn new(
        model: CausalBert,
        tokenizer: Box<dyn TextTokenizer>,
        train_config: TrainConfig,
    ) -> Result<Self> {
        train_config.validate()?;
        Ok(Self {
            model,
            tokenizer,
            train_config,
        })
    }

    /// Download `model_config.model_id` and wrap it.
    pub async fn from_pretrained(
        model_config: ModelConfig,
        train_config: TrainConfig,
        device: &Device,
    ) -> Result<Self> {
        let (model, tokenizer) = from_pretrained(model_config, device).await?;
        Self::new(model, Box::new(tokenizer), train_config)
    }

    pub fn model(&self) -> &CausalBert {
        &self.model
    }

    pub fn train_config(&self) -> &TrainConfig {
        &self.train_config
    }

    fn dataset(&self, examples: &[Example]) -> Result<TokenizedDataset> {
        TokenizedDataset::build(examples, self.tokenizer.as_ref(), self.model.config().max_length)
    }

    /// Train on `train`, evaluating on `dev` after each epoch.
    ///
    /// Writes a checkpoint afterwards when `checkpoint_path` is configured.
    pub fn train(&mut self, train: &[Example], dev: &[Example]) -> Result<TrainingReport> {
        let train_set = self.dataset(train)?;
        let dev_set = self.dataset(dev)?;
        let report = Trainer::new(&mut self.model, self.train_config.clone())?
            .train(&train_set, &dev_set)?;

        if let Some(path) = &self.train_config.checkpoint_path {
            self.model.save(path)?;
            tracing::info!(path = %path.display(), "Checkpoint written");
        }
        Ok(report)
    }

    /// Warm-start on the propensity + MLM objective for `epochs` epochs.
    pub fn pretrain(
        &mut self,
        train: &[Example],
        learning_rate: f64,
        epochs: usize,
    ) -> Result<LossHistory> {
        let train_set = self.dataset(train)?;
        let config = TrainConfig {
            learning_rate,
            epochs,
            ..self.train_config.clone()
        };
        Trainer::new(&mut self.model, config)?.pretrain(&train_set)
    }

    /// Held-out losses with MLM disabled.
    pub fn evaluate_losses(&mut self, dev: &[Example]) -> Result<EpochLosses> {
        let dev_set = self.dataset(dev)?;
        Trainer::new(&mut self.model, self.train_config.clone())?.evaluate_losses(&dev_set)
    }

    /// Per-example `(Q0, Q1, g)`; the hard prediction is
    /// [`Prediction::predicted_arm`].
    pub fn infer(&self, examples: &[Example]) -> Result<Vec<Prediction>> {
        let data = self.dataset(examples)?;
        inference::infer(&self.model, &data, self.train_config.batch_size)
    }

    pub fn ate(&self, examples: &[Example], recalibrate: bool) -> Result<CausalEstimate> {
        estimate::ate(self, examples, recalibrate)
    }

    pub fn att(
        &self,
        examples: &[Example],
        source: TreatmentSource,
        recalibrate: bool,
    ) -> Result<CausalEstimate> {
        estimate::att(self, examples, source, recalibrate)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.model.save(path)
    }

    pub fn load(&self, path: &Path) -> Result<()> {
        self.model.load(path)
    }
}

impl PotentialOutcomeModel for CausalBertEstimator {
    fn predict(&self, examples: &[Example]) -> Result<Vec<Prediction>> {
        self.infer(examples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use causalbert_model::{word_level_tokenizer_json, HfTokenizer};
    use tempfile::TempDir;

    const WORDS: &[&str] = &["cheap", "pricey", "tasty", "bland", "food"];

    fn estimator(checkpoint: Option<std::path::PathBuf>) -> CausalBertEstimator {
        let config = ModelConfig {
            mask_token_id: 4,
            max_length: 8,
            outcome_hidden: 6,
            ..ModelConfig::default()
        };
        let model =
            CausalBert::bag_of_embeddings(config, 5 + WORDS.len(), 6, &Device::Cpu).unwrap();
        let tok = HfTokenizer::from_json(&word_level_tokenizer_json(WORDS)).unwrap();
        let train = TrainConfig {
            epochs: 1,
            batch_size: 2,
            learning_rate: 1e-3,
            checkpoint_path: checkpoint,
            ..TrainConfig::default()
        };
        CausalBertEstimator::new(model, Box::new(tok), train).unwrap()
    }

    fn examples() -> Vec<Example> {
        vec![
            Example::new("cheap tasty food", 0).with_treatment(0).with_outcome(1.0),
            Example::new("pricey bland food", 1).with_treatment(0).with_outcome(0.0),
            Example::new("cheap bland", 0).with_treatment(1).with_outcome(0.0),
            Example::new("pricey tasty food", 1).with_treatment(1).with_outcome(1.0),
        ]
    }

    #[test]
    fn test_train_writes_checkpoint() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ckpt").join("model.safetensors");
        let mut est = estimator(Some(path.clone()));
        let report = est.train(&examples(), &examples()).unwrap();
        assert_eq!(report.train.len(), 1);
        assert!(path.exists());

        // Loading the checkpoint into a fresh estimator reproduces predictions.
        let fresh = estimator(None);
        fresh.load(&path).unwrap();
        let a = est.infer(&examples()).unwrap();
        let b = fresh.infer(&examples()).unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x.q0 - y.q0).abs() < 1e-6);
            assert!((x.propensity - y.propensity).abs() < 1e-6);
        }
    }

    #[test]
    fn test_pretrain_overrides_schedule() {
        let mut est = estimator(None);
        let history = est.pretrain(&examples(), 5e-4, 2).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.epochs.iter().all(|e| e.q == 0.0));
        assert_eq!(est.train_config().epochs, 1);
    }

    #[test]
    fn test_estimates_are_bounded() {
        let est = estimator(None);
        let ate = est.ate(&examples(), false).unwrap();
        assert_eq!(ate.support, 4);
        let v = ate.value.unwrap();
        assert!((-1.0..=1.0).contains(&v));

        let att = est.att(&examples(), TreatmentSource::Observed, false).unwrap();
        assert_eq!(att.support, 2);

        let predictions = est.infer(&examples()).unwrap();
        assert!(predictions.iter().all(|p| p.predicted_arm() <= 1));
        assert_eq!(predictions[1].outcome, Some(0.0));
    }
}
