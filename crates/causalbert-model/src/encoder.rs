//! Text encoder adapters.
//!
//! A [`TextEncoder`] turns a padded `[batch, seq_len]` id tensor and its
//! attention mask into per-position embeddings and one pooled embedding per
//! sequence. Two implementations are provided:
//!
//! - [`BertEncoder`]: a BERT-family transformer from `candle-transformers`,
//!   pooled at the `[CLS]` position.
//! - [`BagOfEmbeddingsEncoder`]: a light embedding + projection encoder with
//!   masked mean pooling, for small corpora and tests.

use candle_core::{DType, IndexOp, Tensor};
use candle_nn::{Embedding, Linear, Module, VarBuilder};
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use causalbert_core::{CausalBertError, Result};

/// Encoder output for one batch.
pub struct EncoderOutput {
    /// `[batch, seq_len, hidden]`.
    pub sequence: Tensor,
    /// `[batch, hidden]`.
    pub pooled: Tensor,
}

/// Contextual text encoder.
pub trait TextEncoder {
    fn hidden_size(&self) -> usize;

    fn vocab_size(&self) -> usize;

    /// Encode `token_ids` (u32) under `attention_mask` (1 = real token).
    fn encode(&self, token_ids: &Tensor, attention_mask: &Tensor)
        -> candle_core::Result<EncoderOutput>;
}

/// Compute masked average pooling over the sequence dimension.
///
/// `hidden_states` has shape `[batch, seq_len, hidden_size]`, `attention_mask`
/// `[batch, seq_len]`. Returns `[batch, hidden_size]`.
pub(crate) fn masked_mean_pool(
    hidden_states: &Tensor,
    attention_mask: &Tensor,
) -> candle_core::Result<Tensor> {
    let mask = attention_mask.to_dtype(DType::F32)?.unsqueeze(2)?;
    let summed = hidden_states.broadcast_mul(&mask)?.sum(1)?;
    let counts = (mask.sum(1)? + 1e-9)?;
    summed.broadcast_div(&counts)
}

// ---------------------------------------------------------------------------
// BERT
// ---------------------------------------------------------------------------

/// BERT encoder with `[CLS]` pooling.
pub struct BertEncoder {
    model: BertModel,
    hidden_size: usize,
    vocab_size: usize,
}

impl BertEncoder {
    /// Build from a HuggingFace `config.json` value. Parameters live under
    /// `vb` (conventionally `vb.pp("bert")`).
    pub fn from_config_json(config_json: &serde_json::Value, vb: VarBuilder) -> Result<Self> {
        let config: BertConfig = serde_json::from_value(config_json.clone())
            .map_err(|e| CausalBertError::Config(format!("Invalid BERT config: {e}")))?;
        let hidden_size = config_usize(config_json, "hidden_size")?;
        let vocab_size = config_usize(config_json, "vocab_size")?;

        let model = BertModel::load(vb, &config)
            .map_err(|e| CausalBertError::Model(format!("Failed to build BERT encoder: {e}")))?;

        Ok(Self {
            model,
            hidden_size,
            vocab_size,
        })
    }
}

fn config_usize(config_json: &serde_json::Value, key: &str) -> Result<usize> {
    config_json
        .get(key)
        .and_then(|v| v.as_u64())
        .map(|v| v as usize)
        .ok_or_else(|| CausalBertError::Config(format!("BERT config is missing '{key}'")))
}

impl TextEncoder for BertEncoder {
    fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn encode(
        &self,
        token_ids: &Tensor,
        attention_mask: &Tensor,
    ) -> candle_core::Result<EncoderOutput> {
        let token_type_ids = token_ids.zeros_like()?;
        let sequence = self
            .model
            .forward(token_ids, &token_type_ids, Some(attention_mask))?;
        // [CLS] token is at position 0
        let pooled = sequence.i((.., 0))?.contiguous()?;
        Ok(EncoderOutput { sequence, pooled })
    }
}

// ---------------------------------------------------------------------------
// Bag of embeddings
// ---------------------------------------------------------------------------

/// Token embeddings followed by a tanh projection, mean-pooled over real
/// tokens. Trainable from scratch; no pretrained weights required.
pub struct BagOfEmbeddingsEncoder {
    embeddings: Embedding,
    projection: Linear,
    hidden_size: usize,
    vocab_size: usize,
}

impl BagOfEmbeddingsEncoder {
    pub fn new(vocab_size: usize, hidden_size: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let embeddings = candle_nn::embedding(vocab_size, hidden_size, vb.pp("word_embeddings"))?;
        let projection = candle_nn::linear(hidden_size, hidden_size, vb.pp("projection"))?;
        Ok(Self {
            embeddings,
            projection,
            hidden_size,
            vocab_size,
        })
    }
}

impl TextEncoder for BagOfEmbeddingsEncoder {
    fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn encode(
        &self,
        token_ids: &Tensor,
        attention_mask: &Tensor,
    ) -> candle_core::Result<EncoderOutput> {
        let embedded = self.embeddings.forward(token_ids)?;
        let sequence = self.projection.forward(&embedded)?.tanh()?;
        let pooled = masked_mean_pool(&sequence, attention_mask)?;
        Ok(EncoderOutput { sequence, pooled })
    }
}
