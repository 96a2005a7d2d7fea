//! Fixed-width indicator encoding of the out-of-text confounder.
//!
//! Each confounder value `v` becomes a row of width `width` with a 1 at
//! column `v`. Column 1 is always zeroed afterwards: it is the reserved
//! padding slot of the bag-of-words convention this encoding comes from, so
//! the value 1 encodes as an all-zero row (with `width == 2`, 0 becomes
//! `[1, 0]` and 1 becomes `[0, 0]`). Do not "fix" this without retraining
//! every downstream checkpoint.

use candle_core::{Device, Tensor};
use causalbert_core::{CausalBertError, Result};

/// Column forced to zero in every encoded row.
pub const RESERVED_COLUMN: usize = 1;

/// Encode confounders into a row-major `[values.len(), width]` buffer.
///
/// With `use_counts == false` entries are binarized to `{0, 1}`.
///
/// # Errors
///
/// Returns [`CausalBertError::InvalidConfounderValue`] for any value outside
/// `[0, width)`. Nothing is written in that case.
pub fn encode_confounders(values: &[i64], width: usize, use_counts: bool) -> Result<Vec<f32>> {
    if let Some(&bad) = values
        .iter()
        .find(|&&v| v < 0 || usize::try_from(v).map_or(true, |v| v >= width))
    {
        return Err(CausalBertError::InvalidConfounderValue { value: bad, width });
    }

    let mut rows = vec![0.0_f32; values.len() * width];
    for (row, &v) in values.iter().enumerate() {
        // Range checked above.
        let col = v as usize;
        rows[row * width + col] += 1.0;
    }

    if width > RESERVED_COLUMN {
        for row in rows.chunks_mut(width) {
            row[RESERVED_COLUMN] = 0.0;
        }
    }

    if !use_counts {
        for x in rows.iter_mut() {
            *x = if *x != 0.0 { 1.0 } else { 0.0 };
        }
    }

    Ok(rows)
}

/// Encode confounders straight into a `[batch, width]` f32 tensor.
pub fn confounder_tensor(
    values: &[i64],
    width: usize,
    use_counts: bool,
    device: &Device,
) -> Result<Tensor> {
    let rows = encode_confounders(values, width, use_counts)?;
    Tensor::from_vec(rows, (values.len(), width), device)
        .map_err(|e| CausalBertError::Model(format!("Failed to build confounder tensor: {e}")))
}
