//! Core types for CausalBert
//!
//! This crate holds the vocabulary shared by the model and training crates:
//! the error taxonomy, the per-example data model, loss weighting, effect
//! estimate results and the serde configuration structs.

pub mod config;

pub use config::{load_config, ModelConfig, RunConfig, TrainConfig};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Number of treatment (and binary outcome) labels.
pub const NUM_LABELS: usize = 2;

/// Reserved MASK token id of the BERT uncased vocabulary.
pub const DEFAULT_MASK_TOKEN_ID: u32 = 103;

/// Default padded sequence length.
pub const DEFAULT_MAX_LENGTH: usize = 128;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Core error type for CausalBert operations.
#[derive(thiserror::Error, Debug)]
pub enum CausalBertError {
    /// Confounder value outside `[0, width)`.
    #[error("Invalid confounder value {value}: expected an integer in [0, {width})")]
    InvalidConfounderValue {
        /// The offending value.
        value: i64,
        /// Encoder width (number of labels).
        width: usize,
    },

    /// Unknown outcome response type.
    #[error("Invalid response type '{0}': expected 'binary' or 'continuous'")]
    InvalidResponseType(String),

    /// Checkpoint parameters do not match the current architecture.
    #[error("Model load mismatch: {0}")]
    ModelLoadMismatch(String),

    /// Tokenizer failure.
    #[error("Tokenization error: {0}")]
    Tokenization(String),

    /// Tensor backend or model construction failure.
    #[error("Model error: {0}")]
    Model(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed input records.
    #[error("Data error: {0}")]
    Data(String),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization / deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience alias for `std::result::Result<T, CausalBertError>`.
pub type Result<T> = std::result::Result<T, CausalBertError>;

// ---------------------------------------------------------------------------
// Response type
// ---------------------------------------------------------------------------

/// How outcome labels are interpreted by the outcome heads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum ResponseType {
    /// `Y ∈ {0, 1}`; heads emit class logits scored with cross-entropy.
    #[default]
    Binary,
    /// Real-valued `Y`; column 1 of each head is regressed with smooth L1.
    Continuous,
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Binary => write!(f, "binary"),
            Self::Continuous => write!(f, "continuous"),
        }
    }
}

impl FromStr for ResponseType {
    type Err = CausalBertError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "binary" => Ok(Self::Binary),
            "continuous" => Ok(Self::Continuous),
            other => Err(CausalBertError::InvalidResponseType(other.to_string())),
        }
    }
}

impl TryFrom<String> for ResponseType {
    type Error = CausalBertError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

/// One unit of analysis.
///
/// `treatment` and `outcome` are `None` when latent (the `-1` sentinel of
/// tabular inputs maps to `None`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub text: String,
    #[serde(default)]
    pub confounder: i64,
    #[serde(default)]
    pub treatment: Option<i64>,
    #[serde(default)]
    pub outcome: Option<f64>,
}

impl Example {
    pub fn new(text: impl Into<String>, confounder: i64) -> Self {
        Self {
            text: text.into(),
            confounder,
            treatment: None,
            outcome: None,
        }
    }

    pub fn with_treatment(mut self, treatment: i64) -> Self {
        self.treatment = Some(treatment);
        self
    }

    pub fn with_outcome(mut self, outcome: f64) -> Self {
        self.outcome = Some(outcome);
        self
    }
}

/// Non-negative weights of the three loss terms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossWeights {
    /// Propensity loss weight.
    #[serde(default = "default_g_weight")]
    pub g: f64,
    /// Outcome loss weight.
    #[serde(default = "default_q_weight")]
    pub q: f64,
    /// Masked-language-model loss weight.
    #[serde(default = "default_mlm_weight")]
    pub mlm: f64,
}

fn default_g_weight() -> f64 {
    1.0
}

fn default_q_weight() -> f64 {
    0.1
}

fn default_mlm_weight() -> f64 {
    1.0
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            g: default_g_weight(),
            q: default_q_weight(),
            mlm: default_mlm_weight(),
        }
    }
}

impl LossWeights {
    pub fn new(g: f64, q: f64, mlm: f64) -> Result<Self> {
        let weights = Self { g, q, mlm };
        weights.validate()?;
        Ok(weights)
    }

    /// Reject negative or non-finite weights.
    pub fn validate(&self) -> Result<()> {
        for (name, w) in [("g", self.g), ("q", self.q), ("mlm", self.mlm)] {
            if !w.is_finite() || w < 0.0 {
                return Err(CausalBertError::Config(format!(
                    "loss weight '{name}' must be a non-negative finite number, got {w}"
                )));
            }
        }
        Ok(())
    }

    /// `g·g_loss + q·q_loss + mlm·mlm_loss`.
    pub fn combine(&self, g_loss: f64, q_loss: f64, mlm_loss: f64) -> f64 {
        self.g * g_loss + self.q * q_loss + self.mlm * mlm_loss
    }
}

/// Mean loss terms of one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EpochLosses {
    pub epoch: usize,
    pub total: f64,
    pub g: f64,
    #[serde(rename = "Q")]
    pub q: f64,
    pub mlm: f64,
}

/// Per-epoch loss history of one training run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LossHistory {
    pub epochs: Vec<EpochLosses>,
}

impl LossHistory {
    pub fn push(&mut self, losses: EpochLosses) {
        self.epochs.push(losses);
    }

    pub fn last(&self) -> Option<&EpochLosses> {
        self.epochs.last()
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    /// True when every recorded term of every epoch is finite.
    pub fn all_finite(&self) -> bool {
        self.epochs
            .iter()
            .all(|e| [e.total, e.g, e.q, e.mlm].iter().all(|v| v.is_finite()))
    }
}

/// Potential-outcome prediction for one example.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Predicted outcome under control.
    pub q0: f64,
    /// Predicted outcome under treatment.
    pub q1: f64,
    /// Propensity `P(T=1 | text, C)`.
    pub propensity: f64,
    /// Observed outcome, when supplied.
    pub outcome: Option<f64>,
}

impl Prediction {
    /// Arm with the larger predicted outcome (0 on ties).
    pub fn predicted_arm(&self) -> usize {
        usize::from(self.q1 > self.q0)
    }
}

/// A reduced causal effect estimate.
///
/// `value` is `None` when the averaging set is empty (e.g. ATT with no
/// treated examples).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CausalEstimate {
    pub value: Option<f64>,
    /// Number of examples averaged over.
    pub support: usize,
    pub recalibrated: bool,
}

impl fmt::Display for CausalEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value {
            Some(v) => write!(f, "{v:.6} (n={})", self.support)?,
            None => write!(f, "undefined (n=0)")?,
        }
        if self.recalibrated {
            write!(f, " [platt]")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
