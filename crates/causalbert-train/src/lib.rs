//! CausalBert training, inference and causal effect estimation.
//!
//! # Modules
//!
//! - [`data`] — tokenised datasets and mini-batch iteration
//! - [`schedule`] — linear warmup / linear decay learning rate
//! - [`trainer`] — joint training, propensity pretraining, held-out losses
//! - [`inference`] — potential-outcome predictions without gradients
//! - [`calibration`] — Platt recalibration
//! - [`estimate`] — ATE / ATT reduction
//! - [`estimator`] — examples-in, estimates-out wrapper
//! - [`records`] — JSON / JSONL record loading for the CLI

pub mod calibration;
pub mod data;
pub mod estimate;
pub mod estimator;
pub mod inference;
pub mod records;
pub mod schedule;
pub mod trainer;

pub use calibration::{PlattCalibrator, PlattConfig};
pub use data::{BatchIterator, Sampling, TokenizedDataset};
pub use estimate::{
    ate, ate_from_predictions, att, att_from_predictions, recalibrate, ArmCalibrators,
    PotentialOutcomeModel, TreatmentSource,
};
pub use estimator::CausalBertEstimator;
pub use inference::infer;
pub use records::{load_split_examples, ColumnSpec, SplitExamples};
pub use schedule::LinearSchedule;
pub use trainer::{Trainer, TrainingReport};
