//! Propensity head and per-arm outcome heads.
//!
//! Both read the joint input `pooled embedding ⧺ confounder encoding`.
//!
//! # Architecture
//!
//! ```text
//! propensity:   Input (h + 2) → Linear(2)
//! outcome[arm]: Input (h + 2) → Linear(200) → ReLU → Linear(2)
//! ```
//!
//! The two outcome heads are separate parameter sets (`outcome_heads.0.*`,
//! `outcome_heads.1.*`) addressed by treatment value.

use candle_core::Tensor;
use candle_nn::{Linear, Module, VarBuilder};

/// Linear map from the joint input to treatment logits.
pub struct PropensityHead {
    linear: Linear,
}

impl PropensityHead {
    pub fn new(input_dim: usize, num_labels: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            linear: candle_nn::linear(input_dim, num_labels, vb)?,
        })
    }

    /// Raw `[batch, num_labels]` logits.
    pub fn forward(&self, inputs: &Tensor) -> candle_core::Result<Tensor> {
        self.linear.forward(inputs)
    }
}

/// Two-layer network predicting the outcome under one arm.
pub struct OutcomeHead {
    fc1: Linear,
    fc2: Linear,
}

impl OutcomeHead {
    pub fn new(
        input_dim: usize,
        hidden: usize,
        num_labels: usize,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let fc1 = candle_nn::linear(input_dim, hidden, vb.pp("fc1"))?;
        let fc2 = candle_nn::linear(hidden, num_labels, vb.pp("fc2"))?;
        Ok(Self { fc1, fc2 })
    }

    pub fn forward(&self, inputs: &Tensor) -> candle_core::Result<Tensor> {
        let h = self.fc1.forward(inputs)?.relu()?;
        self.fc2.forward(&h)
    }
}

/// Outcome heads indexed by treatment value.
pub struct OutcomeHeads {
    arms: [OutcomeHead; 2],
}

impl OutcomeHeads {
    pub fn new(
        input_dim: usize,
        hidden: usize,
        num_labels: usize,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        Ok(Self {
            arms: [
                OutcomeHead::new(input_dim, hidden, num_labels, vb.pp("0"))?,
                OutcomeHead::new(input_dim, hidden, num_labels, vb.pp("1"))?,
            ],
        })
    }

    /// Logits of both heads for every row: factual and counterfactual.
    pub fn forward(&self, inputs: &Tensor) -> candle_core::Result<[Tensor; 2]> {
        Ok([self.arms[0].forward(inputs)?, self.arms[1].forward(inputs)?])
    }
}

/// Prefix of the parameters owned by outcome head `arm`.
pub fn outcome_head_prefix(arm: usize) -> String {
    format!("outcome_heads.{arm}.")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
