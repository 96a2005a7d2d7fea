//! Inference-mode prediction of potential outcomes and propensities.

use candle_core::Tensor;
use causalbert_core::{CausalBertError, Prediction, Result};
use causalbert_model::CausalBert;

use crate::data::{BatchIterator, Sampling, TokenizedDataset};

/// Predict `(Q0, Q1, propensity)` for every row, preserving dataset order.
///
/// Runs without masking and without labels; nothing is backpropagated.
/// Each prediction carries the row's observed outcome when one is known.
pub fn infer(
    model: &CausalBert,
    data: &TokenizedDataset,
    batch_size: usize,
) -> Result<Vec<Prediction>> {
    let mut batches = BatchIterator::new(data, batch_size, Sampling::Sequential, false);
    let mut predictions = Vec::with_capacity(data.len());
    let mut offset = 0;

    while let Some(batch) = batches.next_batch()? {
        let out = model.forward(&batch, None)?;
        let q0 = to_vec(&out.q0)?;
        let q1 = to_vec(&out.q1)?;
        let g = to_vec(&out.propensity)?;

        for i in 0..batch.len() {
            predictions.push(Prediction {
                q0: q0[i],
                q1: q1[i],
                propensity: g[i],
                outcome: data.outcomes()[offset + i],
            });
        }
        offset += batch.len();
    }

    tracing::debug!(examples = predictions.len(), "Inference complete");
    Ok(predictions)
}

fn to_vec(t: &Tensor) -> Result<Vec<f64>> {
    let v: Vec<f32> = t
        .detach()
        .to_vec1()
        .map_err(|e| CausalBertError::Model(format!("Failed to extract predictions: {e}")))?;
    Ok(v.into_iter().map(f64::from).collect())
}
