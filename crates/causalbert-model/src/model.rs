//! Joint forward pass and loss orchestration.
//!
//! [`CausalBert`] wires an encoder, the MLM head, the propensity head and the
//! two outcome heads over one [`ParameterStore`]. A forward pass:
//!
//! 1. optionally masks one token per example (pure copy, see [`mask_tokens`]),
//! 2. encodes the text,
//! 3. builds the joint input `pooled ⧺ confounder encoding`,
//! 4. runs the propensity head and both outcome heads on every row,
//! 5. when outcome labels are present, computes the three loss terms.

use std::path::Path;

use candle_core::{Device, Tensor, D};
use candle_nn::VarBuilder;
use causalbert_core::{CausalBertError, LossWeights, ModelConfig, ResponseType, Result};
use rand::RngCore;

use crate::confounder::confounder_tensor;
use crate::encoder::{BagOfEmbeddingsEncoder, BertEncoder, TextEncoder};
use crate::heads::{OutcomeHeads, PropensityHead};
use crate::losses::{
    factual_outcome_loss, partition_by_arm, propensity_loss, weighted_total, zero_loss,
};
use crate::mlm::{mask_tokens, MaskedTokens, MlmHead};
use crate::store::ParameterStore;
use crate::tokenizer::TokenizedText;

/// One batch of tokenized examples with their covariates and labels.
///
/// Token buffers are row-major `[len, seq_len]`. `outcomes == None` selects
/// inference mode: no loss is computed.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub token_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    pub lengths: Vec<usize>,
    pub seq_len: usize,
    pub confounders: Vec<i64>,
    pub treatments: Vec<Option<i64>>,
    pub outcomes: Option<Vec<Option<f64>>>,
}

impl Batch {
    /// Assemble a batch from tokenized rows of equal length.
    pub fn from_rows(
        rows: &[&TokenizedText],
        confounders: Vec<i64>,
        treatments: Vec<Option<i64>>,
        outcomes: Option<Vec<Option<f64>>>,
    ) -> Result<Self> {
        let seq_len = rows.first().map_or(0, |r| r.ids.len());
        if rows.iter().any(|r| r.ids.len() != seq_len) {
            return Err(CausalBertError::Data(
                "tokenized rows have different lengths".to_string(),
            ));
        }
        let n = rows.len();
        if confounders.len() != n
            || treatments.len() != n
            || outcomes.as_ref().is_some_and(|y| y.len() != n)
        {
            return Err(CausalBertError::Data(format!(
                "batch of {n} rows has mismatched covariate columns"
            )));
        }
        Ok(Self {
            token_ids: rows.iter().flat_map(|r| r.ids.iter().copied()).collect(),
            attention_mask: rows
                .iter()
                .flat_map(|r| r.attention_mask.iter().copied())
                .collect(),
            lengths: rows.iter().map(|r| r.length).collect(),
            seq_len,
            confounders,
            treatments,
            outcomes,
        })
    }

    pub fn len(&self) -> usize {
        self.lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lengths.is_empty()
    }
}

/// Outputs of one forward pass. Probability tensors are `[batch]`; losses
/// are 0-dim and zero when not computed.
#[derive(Debug)]
pub struct ForwardOutput {
    pub propensity: Tensor,
    pub q0: Tensor,
    pub q1: Tensor,
    pub g_loss: Tensor,
    pub q_loss: Tensor,
    pub mlm_loss: Tensor,
}

impl ForwardOutput {
    pub fn total_loss(&self, weights: &LossWeights) -> Result<Tensor> {
        weighted_total(weights, &self.g_loss, &self.q_loss, &self.mlm_loss)
            .map_err(|e| CausalBertError::Model(format!("Failed to combine losses: {e}")))
    }
}

/// Outputs of one propensity-only pass.
#[derive(Debug)]
pub struct PretrainOutput {
    pub propensity: Tensor,
    pub g_loss: Tensor,
    pub mlm_loss: Tensor,
}

impl PretrainOutput {
    /// `w.g·g_loss + w.mlm·mlm_loss`.
    pub fn total_loss(&self, weights: &LossWeights) -> Result<Tensor> {
        let g = self.g_loss.affine(weights.g, 0.0);
        let mlm = self.mlm_loss.affine(weights.mlm, 0.0);
        g.and_then(|g| mlm.and_then(|mlm| g + mlm))
            .map_err(|e| CausalBertError::Model(format!("Failed to combine losses: {e}")))
    }
}

struct Encoded {
    joint: Tensor,
    mlm_loss: Tensor,
}

/// Text encoder with MLM, propensity and per-arm outcome heads.
pub struct CausalBert {
    store: ParameterStore,
    encoder: Box<dyn TextEncoder>,
    mlm: MlmHead,
    propensity: PropensityHead,
    outcome_heads: OutcomeHeads,
    config: ModelConfig,
}

impl CausalBert {
    /// Build the model around an encoder created by `build_encoder`.
    ///
    /// The encoder must register its parameters through the supplied
    /// [`VarBuilder`] so they are trained and checkpointed with the heads.
    pub fn with_encoder<F>(config: ModelConfig, device: &Device, build_encoder: F) -> Result<Self>
    where
        F: FnOnce(VarBuilder) -> Result<Box<dyn TextEncoder>>,
    {
        config.validate()?;
        let store = ParameterStore::new(device);
        let vb = store.var_builder();

        let encoder = build_encoder(vb.clone())?;
        let hidden = encoder.hidden_size();
        let input_dim = hidden + config.num_labels;

        let mlm = MlmHead::new(
            hidden,
            encoder.vocab_size(),
            vb.pp("cls").pp("predictions"),
        )
        .map_err(|e| CausalBertError::Model(format!("Failed to create MLM head: {e}")))?;
        let propensity = PropensityHead::new(input_dim, config.num_labels, vb.pp("propensity"))
            .map_err(|e| CausalBertError::Model(format!("Failed to create propensity head: {e}")))?;
        let outcome_heads = OutcomeHeads::new(
            input_dim,
            config.outcome_hidden,
            config.num_labels,
            vb.pp("outcome_heads"),
        )
        .map_err(|e| CausalBertError::Model(format!("Failed to create outcome heads: {e}")))?;

        tracing::debug!(
            hidden,
            vocab = encoder.vocab_size(),
            parameters = store.num_parameters(),
            "CausalBert initialised"
        );

        Ok(Self {
            store,
            encoder,
            mlm,
            propensity,
            outcome_heads,
            config,
        })
    }

    /// BERT encoder from a HuggingFace `config.json` value.
    pub fn bert(
        config: ModelConfig,
        bert_config: &serde_json::Value,
        device: &Device,
    ) -> Result<Self> {
        Self::with_encoder(config, device, |vb| {
            let encoder = BertEncoder::from_config_json(bert_config, vb.pp("bert"))?;
            Ok(Box::new(encoder) as Box<dyn TextEncoder>)
        })
    }

    /// Bag-of-embeddings encoder trained from scratch.
    pub fn bag_of_embeddings(
        config: ModelConfig,
        vocab_size: usize,
        hidden_size: usize,
        device: &Device,
    ) -> Result<Self> {
        Self::with_encoder(config, device, |vb| {
            let encoder = BagOfEmbeddingsEncoder::new(vocab_size, hidden_size, vb.pp("encoder"))
                .map_err(|e| CausalBertError::Model(format!("Failed to create encoder: {e}")))?;
            Ok(Box::new(encoder) as Box<dyn TextEncoder>)
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn loss_weights(&self) -> &LossWeights {
        &self.config.loss_weights
    }

    pub fn response_type(&self) -> ResponseType {
        self.config.response_type
    }

    pub fn store(&self) -> &ParameterStore {
        &self.store
    }

    pub fn device(&self) -> &Device {
        self.store.device()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.store.save(path)
    }

    pub fn load(&self, path: &Path) -> Result<()> {
        self.store.load(path)
    }

    /// Joint forward pass.
    ///
    /// `mlm_rng` enables token masking and the MLM loss; `None` disables
    /// both and encodes the ids unmodified. Losses are computed only when
    /// `batch.outcomes` is present.
    pub fn forward(
        &self,
        batch: &Batch,
        mlm_rng: Option<&mut dyn RngCore>,
    ) -> Result<ForwardOutput> {
        let Encoded { joint, mlm_loss } = self.encode_joint(batch, mlm_rng)?;
        let device = self.device();

        let g_logits = self
            .propensity
            .forward(&joint)
            .map_err(|e| CausalBertError::Model(format!("Propensity head failed: {e}")))?;
        let [q0_logits, q1_logits] = self
            .outcome_heads
            .forward(&joint)
            .map_err(|e| CausalBertError::Model(format!("Outcome heads failed: {e}")))?;

        let (g_loss, q_loss) = match &batch.outcomes {
            Some(outcomes) => {
                let g_loss = propensity_loss(&g_logits, &batch.treatments).map_err(|e| {
                    CausalBertError::Model(format!("Propensity loss failed: {e}"))
                })?;
                let partition =
                    partition_by_arm(&batch.treatments, outcomes, self.config.response_type);
                let q_loss = factual_outcome_loss(
                    [&q0_logits, &q1_logits],
                    outcomes,
                    &partition,
                    self.config.response_type,
                )
                .map_err(|e| CausalBertError::Model(format!("Outcome loss failed: {e}")))?;
                (g_loss, q_loss)
            }
            None => (zero(device)?, zero(device)?),
        };

        Ok(ForwardOutput {
            propensity: positive_class(&g_logits)?,
            q0: self.outcome_prediction(&q0_logits)?,
            q1: self.outcome_prediction(&q1_logits)?,
            g_loss,
            q_loss,
            mlm_loss,
        })
    }

    /// Propensity + MLM pass for warm-starting; the outcome heads are not run.
    ///
    /// The propensity loss uses every row with a valid treatment label.
    pub fn pretrain_forward(
        &self,
        batch: &Batch,
        mlm_rng: Option<&mut dyn RngCore>,
    ) -> Result<PretrainOutput> {
        let Encoded { joint, mlm_loss } = self.encode_joint(batch, mlm_rng)?;
        let g_logits = self
            .propensity
            .forward(&joint)
            .map_err(|e| CausalBertError::Model(format!("Propensity head failed: {e}")))?;
        let g_loss = propensity_loss(&g_logits, &batch.treatments)
            .map_err(|e| CausalBertError::Model(format!("Propensity loss failed: {e}")))?;
        Ok(PretrainOutput {
            propensity: positive_class(&g_logits)?,
            g_loss,
            mlm_loss,
        })
    }

    fn encode_joint(&self, batch: &Batch, mlm_rng: Option<&mut dyn RngCore>) -> Result<Encoded> {
        let device = self.device();
        let n = batch.len();
        if n == 0 {
            return Err(CausalBertError::Data("empty batch".to_string()));
        }

        let masked: Option<MaskedTokens> = mlm_rng.map(|rng| {
            mask_tokens(
                &batch.token_ids,
                batch.seq_len,
                &batch.lengths,
                self.config.mask_token_id,
                rng,
            )
        });
        let ids = masked
            .as_ref()
            .map_or(&batch.token_ids, |m| &m.token_ids)
            .clone();

        let ids = Tensor::from_vec(ids, (n, batch.seq_len), device)
            .map_err(|e| CausalBertError::Model(format!("Failed to create id tensor: {e}")))?;
        let mask = Tensor::from_vec(batch.attention_mask.clone(), (n, batch.seq_len), device)
            .map_err(|e| CausalBertError::Model(format!("Failed to create mask tensor: {e}")))?;

        let encoded = self
            .encoder
            .encode(&ids, &mask)
            .map_err(|e| CausalBertError::Model(format!("Encoder forward failed: {e}")))?;

        let mlm_loss = match &masked {
            Some(m) => self
                .mlm
                .loss(&encoded.sequence, m)
                .map_err(|e| CausalBertError::Model(format!("MLM loss failed: {e}")))?,
            None => zero(device)?,
        };

        let confounders = confounder_tensor(
            &batch.confounders,
            self.config.num_labels,
            self.config.use_counts,
            device,
        )?;
        let joint = Tensor::cat(&[&encoded.pooled, &confounders], 1)
            .map_err(|e| CausalBertError::Model(format!("Failed to build joint input: {e}")))?;

        Ok(Encoded { joint, mlm_loss })
    }

    /// Binary: `P(Y=1)`; continuous: raw column 1.
    fn outcome_prediction(&self, logits: &Tensor) -> Result<Tensor> {
        match self.config.response_type {
            ResponseType::Binary => positive_class(logits),
            ResponseType::Continuous => logits
                .narrow(1, 1, 1)
                .and_then(|t| t.squeeze(1))
                .map_err(|e| CausalBertError::Model(format!("Failed to read outcome column: {e}"))),
        }
    }
}

fn zero(device: &Device) -> Result<Tensor> {
    zero_loss(device)
        .map_err(|e| CausalBertError::Model(format!("Failed to create zero loss: {e}")))
}

/// Softmax column 1 of `[batch, 2]` logits.
fn positive_class(logits: &Tensor) -> Result<Tensor> {
    candle_nn::ops::softmax(logits, D::Minus1)
        .and_then(|p| p.narrow(1, 1, 1))
        .and_then(|p| p.squeeze(1))
        .map_err(|e| CausalBertError::Model(format!("Softmax failed: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
