//! YAML configuration for model construction and training.
//!
//! Every field has a default, so an empty document is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{
    CausalBertError, LossWeights, ResponseType, Result, DEFAULT_MASK_TOKEN_ID, DEFAULT_MAX_LENGTH,
    NUM_LABELS,
};

/// Model architecture and pretrained-source settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// HuggingFace model ID of the pretrained encoder.
    #[serde(default = "default_model_id")]
    pub model_id: String,
    /// Optional cache directory for downloaded models.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    #[serde(default = "default_mask_token_id")]
    pub mask_token_id: u32,
    #[serde(default = "default_num_labels")]
    pub num_labels: usize,
    /// Hidden width of each outcome head.
    #[serde(default = "default_outcome_hidden")]
    pub outcome_hidden: usize,
    #[serde(default)]
    pub response_type: ResponseType,
    /// Keep confounder indicator counts instead of binarizing.
    #[serde(default)]
    pub use_counts: bool,
    #[serde(default)]
    pub loss_weights: LossWeights,
}

fn default_model_id() -> String {
    "bert-base-uncased".to_string()
}

fn default_max_length() -> usize {
    DEFAULT_MAX_LENGTH
}

fn default_mask_token_id() -> u32 {
    DEFAULT_MASK_TOKEN_ID
}

fn default_num_labels() -> usize {
    NUM_LABELS
}

fn default_outcome_hidden() -> usize {
    200
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_id: default_model_id(),
            cache_dir: None,
            max_length: default_max_length(),
            mask_token_id: default_mask_token_id(),
            num_labels: default_num_labels(),
            outcome_hidden: default_outcome_hidden(),
            response_type: ResponseType::default(),
            use_counts: false,
            loss_weights: LossWeights::default(),
        }
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_labels != NUM_LABELS {
            return Err(CausalBertError::Config(format!(
                "num_labels must be {NUM_LABELS} (binary treatment), got {}",
                self.num_labels
            )));
        }
        if self.max_length < 3 {
            return Err(CausalBertError::Config(format!(
                "max_length must leave room for [CLS], one token and [SEP], got {}",
                self.max_length
            )));
        }
        if self.outcome_hidden == 0 {
            return Err(CausalBertError::Config(
                "outcome_hidden must be positive".to_string(),
            ));
        }
        self.loss_weights.validate()
    }
}

/// Optimisation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_adam_eps")]
    pub adam_eps: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Share of total steps spent in linear warmup.
    #[serde(default = "default_warmup_fraction")]
    pub warmup_fraction: f64,
    /// Seed of the shuffling and token-masking random sources.
    #[serde(default)]
    pub seed: u64,
    /// Where to write parameters after training.
    #[serde(default)]
    pub checkpoint_path: Option<PathBuf>,
}

fn default_learning_rate() -> f64 {
    2e-5
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_epochs() -> usize {
    3
}

fn default_batch_size() -> usize {
    32
}

fn default_warmup_fraction() -> f64 {
    0.1
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            adam_eps: default_adam_eps(),
            weight_decay: 0.0,
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            warmup_fraction: default_warmup_fraction(),
            seed: 0,
            checkpoint_path: None,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(CausalBertError::Config(
                "batch_size must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.warmup_fraction) {
            return Err(CausalBertError::Config(format!(
                "warmup_fraction must lie in [0, 1], got {}",
                self.warmup_fraction
            )));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(CausalBertError::Config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        Ok(())
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub train: TrainConfig,
}

/// Load a [`RunConfig`] from a YAML file at `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be read, the YAML is invalid, or a
/// value fails validation.
pub fn load_config(path: &Path) -> Result<RunConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        CausalBertError::Config(format!(
            "Failed to read config file {}: {e}",
            path.display()
        ))
    })?;
    let value: serde_yaml::Value = serde_yaml::from_str(&contents)
        .map_err(|e| CausalBertError::Config(format!("Failed to parse config YAML: {e}")))?;

    // Surface a bad response type as its own error, not a generic parse failure.
    if let Some(rt) = value.get("model").and_then(|m| m.get("response_type")) {
        match rt.as_str() {
            Some(s) => {
                s.parse::<ResponseType>()?;
            }
            None => {
                return Err(CausalBertError::InvalidResponseType(format!("{rt:?}")));
            }
        }
    }

    let config: RunConfig = serde_yaml::from_value(value)
        .map_err(|e| CausalBertError::Config(format!("Invalid config: {e}")))?;
    config.model.validate()?;
    config.train.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_yaml(yaml: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(yaml.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_load_config_empty_uses_defaults() {
        let f = write_yaml("{}\n");
        let config = load_config(f.path()).unwrap();
        assert_eq!(config, RunConfig::default());
        assert_eq!(config.model.max_length, 128);
        assert_eq!(config.model.mask_token_id, 103);
        assert!((config.train.learning_rate - 2e-5).abs() < 1e-12);
    }

    #[test]
    fn test_load_config_overrides() {
        let f = write_yaml(
            r#"
model:
  model_id: "distilbert-base-uncased"
  response_type: continuous
  loss_weights:
    g: 0.1
train:
  epochs: 1
  batch_size: 2
  seed: 7
"#,
        );
        let config = load_config(f.path()).unwrap();
        assert_eq!(config.model.model_id, "distilbert-base-uncased");
        assert_eq!(config.model.response_type, ResponseType::Continuous);
        assert_eq!(config.model.loss_weights.g, 0.1);
        assert_eq!(config.model.loss_weights.q, 0.1);
        assert_eq!(config.train.epochs, 1);
        assert_eq!(config.train.batch_size, 2);
        assert_eq!(config.train.seed, 7);
    }

    #[test]
    fn test_load_config_rejects_unknown_response_type() {
        let f = write_yaml("model:\n  response_type: ordinal\n");
        let err = load_config(f.path()).unwrap_err();
        assert!(matches!(err, CausalBertError::InvalidResponseType(ref s) if s == "ordinal"));

        let f = write_yaml("model:\n  response_type: 3\n");
        let err = load_config(f.path()).unwrap_err();
        assert!(matches!(err, CausalBertError::InvalidResponseType(_)));
    }

    #[test]
    fn test_load_config_rejects_zero_batch() {
        let f = write_yaml("train:\n  batch_size: 0\n");
        let err = load_config(f.path()).unwrap_err();
        assert!(matches!(err, CausalBertError::Config(_)));
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config(Path::new("/nonexistent/causalbert.yaml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
