//! Masked-language-model regularizer.
//!
//! One position per example is replaced by the MASK token and the head is
//! trained to reconstruct the original id. Masking is a pure function over
//! the batch buffers: the caller's token ids are never touched.
//!
//! # Architecture
//!
//! ```text
//! hidden (h) → Linear(h) → GELU(erf) → LayerNorm(eps 1e-12) → Linear(vocab)
//! ```
//!
//! Parameter names follow the BERT pretraining checkpoint layout
//! (`cls.predictions.*`) so pretrained weights can seed the head.

use candle_core::{DType, Tensor};
use candle_nn::{Init, LayerNorm, Linear, Module, VarBuilder};
use rand::Rng;

use crate::losses::zero_loss;

/// Layer-norm epsilon of the prediction transform.
const LAYER_NORM_EPS: f64 = 1e-12;

/// Result of masking one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskedTokens {
    /// Row-major `[batch, seq_len]` copy of the ids with MASK written in.
    pub token_ids: Vec<u32>,
    /// Masked position per example, `None` when the example is too short.
    pub positions: Vec<Option<usize>>,
    /// Original id at the masked position.
    pub targets: Vec<Option<u32>>,
    pub seq_len: usize,
}

impl MaskedTokens {
    /// Examples that carry a reconstruction target.
    pub fn masked_count(&self) -> usize {
        self.positions.iter().filter(|p| p.is_some()).count()
    }
}

/// Pick one position per example uniformly from `1..=len-2` and mask it.
///
/// Position 0 (the sequence-start marker) and the last real token are never
/// selected, nor is anything past the true length. Examples with a true
/// length below 3 have no eligible position and are left unmasked.
pub fn mask_tokens<R: Rng + ?Sized>(
    token_ids: &[u32],
    seq_len: usize,
    lengths: &[usize],
    mask_token_id: u32,
    rng: &mut R,
) -> MaskedTokens {
    let mut masked = token_ids.to_vec();
    let mut positions = Vec::with_capacity(lengths.len());
    let mut targets = Vec::with_capacity(lengths.len());

    for (row, &len) in lengths.iter().enumerate() {
        let len = len.min(seq_len);
        if len < 3 {
            positions.push(None);
            targets.push(None);
            continue;
        }
        let pos = rng.gen_range(0..len - 2) + 1;
        let idx = row * seq_len + pos;
        targets.push(Some(masked[idx]));
        masked[idx] = mask_token_id;
        positions.push(Some(pos));
    }

    let short = positions.iter().filter(|p| p.is_none()).count();
    if short > 0 {
        tracing::debug!(short, "examples too short to mask");
    }

    MaskedTokens {
        token_ids: masked,
        positions,
        targets,
        seq_len,
    }
}

/// Token-reconstruction head over per-position encoder output.
pub struct MlmHead {
    transform: Linear,
    layer_norm: LayerNorm,
    decoder: Linear,
    vocab_size: usize,
}

impl MlmHead {
    /// Create the head under `vb` (typically `vb.pp("cls").pp("predictions")`).
    pub fn new(hidden_size: usize, vocab_size: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let transform =
            candle_nn::linear(hidden_size, hidden_size, vb.pp("transform").pp("dense"))?;
        let layer_norm = candle_nn::layer_norm(
            hidden_size,
            LAYER_NORM_EPS,
            vb.pp("transform").pp("LayerNorm"),
        )?;
        let weight = vb.pp("decoder").get_with_hints(
            (vocab_size, hidden_size),
            "weight",
            Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
        )?;
        let bias = vb.get_with_hints(vocab_size, "bias", Init::Const(0.0))?;
        Ok(Self {
            transform,
            layer_norm,
            decoder: Linear::new(weight, Some(bias)),
            vocab_size,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Vocabulary logits for hidden states of shape `[..., hidden]`.
    pub fn logits(&self, hidden: &Tensor) -> candle_core::Result<Tensor> {
        let x = self.transform.forward(hidden)?.gelu_erf()?;
        let x = self.layer_norm.forward(&x)?;
        self.decoder.forward(&x)
    }

    /// Cross-entropy at the masked positions only.
    ///
    /// `sequence` has shape `[batch, seq_len, hidden]`. Only masked rows are
    /// projected to the vocabulary; a batch with nothing masked yields zero.
    pub fn loss(&self, sequence: &Tensor, masked: &MaskedTokens) -> candle_core::Result<Tensor> {
        let (batch, seq_len, hidden) = sequence.dims3()?;
        let mut rows: Vec<u32> = Vec::new();
        let mut targets: Vec<u32> = Vec::new();
        for (i, (pos, target)) in masked.positions.iter().zip(&masked.targets).enumerate() {
            if let (Some(pos), Some(target)) = (pos, target) {
                rows.push((i * seq_len + pos) as u32);
                targets.push(*target);
            }
        }
        if rows.is_empty() || batch == 0 {
            return zero_loss(sequence.device());
        }

        let flat = sequence.reshape((batch * seq_len, hidden))?;
        let idx = Tensor::new(rows.as_slice(), sequence.device())?;
        let picked = flat.index_select(&idx, 0)?;
        let logits = self.logits(&picked)?;
        let targets = Tensor::new(targets.as_slice(), sequence.device())?;
        candle_nn::loss::cross_entropy(&logits.to_dtype(DType::F32)?, &targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    const MASK: u32 = 103;

    #[test]
    fn test_length_five_masks_inside_window() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let ids: Vec<u32> = vec![101, 7, 8, 9, 102, 0, 0, 0];
        let mut seen = [false; 8];
        for _ in 0..500 {
            let m = mask_tokens(&ids, 8, &[5], MASK, &mut rng);
            let pos = m.positions[0].unwrap();
            assert!((1..=3).contains(&pos), "position {pos} outside 1..=3");
            assert_eq!(m.token_ids[pos], MASK);
            assert_eq!(m.targets[0], Some(ids[pos]));
            seen[pos] = true;
        }
        assert!(seen[1] && seen[2] && seen[3]);
    }

    #[test]
    fn test_never_masks_start_or_padding() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let seq_len = 16;
        let lengths = [3_usize, 4, 9, 16];
        let ids: Vec<u32> = (0..lengths.len() * seq_len).map(|i| 200 + i as u32).collect();
        for _ in 0..200 {
            let m = mask_tokens(&ids, seq_len, &lengths, MASK, &mut rng);
            for (pos, &len) in m.positions.iter().zip(&lengths) {
                let pos = pos.unwrap();
                assert!(pos >= 1);
                assert!(pos <= len - 2);
            }
        }
    }

    #[test]
    fn test_input_buffer_untouched() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let ids: Vec<u32> = vec![101, 5, 6, 102];
        let before = ids.clone();
        let m = mask_tokens(&ids, 4, &[4], MASK, &mut rng);
        assert_eq!(ids, before);
        assert_ne!(m.token_ids, before);
        let changed = m
            .token_ids
            .iter()
            .zip(&before)
            .filter(|(a, b)| a != b)
            .count();
        assert_eq!(changed, 1);
    }

    #[test]
    fn test_short_sequences_are_skipped() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let ids: Vec<u32> = vec![101, 102, 0, 0, 101, 102, 0, 0];
        let m = mask_tokens(&ids, 4, &[2, 1], MASK, &mut rng);
        assert_eq!(m.positions, vec![None, None]);
        assert_eq!(m.masked_count(), 0);
        assert_eq!(m.token_ids, ids);
    }

    #[test]
    fn test_head_loss_is_finite_and_zero_when_unmasked() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let head = MlmHead::new(8, 50, vb.pp("cls").pp("predictions")).unwrap();
        let sequence = Tensor::randn(0f32, 1.0, (2, 6, 8), &device).unwrap();

        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let ids: Vec<u32> = vec![1, 10, 11, 12, 2, 0, 1, 20, 21, 22, 23, 2];
        let masked = mask_tokens(&ids, 6, &[5, 6], 3, &mut rng);
        let loss: f32 = head.loss(&sequence, &masked).unwrap().to_scalar().unwrap();
        assert!(loss.is_finite() && loss > 0.0);

        let none = mask_tokens(&ids, 6, &[2, 2], 3, &mut rng);
        let zero: f32 = head.loss(&sequence, &none).unwrap().to_scalar().unwrap();
        assert_eq!(zero, 0.0);
    }

    #[test]
    fn test_parameter_names_match_bert_layout() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        MlmHead::new(4, 10, vb.pp("cls").pp("predictions")).unwrap();
        let data = varmap.data().lock().unwrap();
        for name in [
            "cls.predictions.transform.dense.weight",
            "cls.predictions.transform.dense.bias",
            "cls.predictions.transform.LayerNorm.weight",
            "cls.predictions.transform.LayerNorm.bias",
            "cls.predictions.decoder.weight",
            "cls.predictions.bias",
        ] {
            assert!(data.contains_key(name), "missing {name}");
        }
    }
}
