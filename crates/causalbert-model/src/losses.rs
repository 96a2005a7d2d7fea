//! Label filtering, arm partitioning and the supervised loss terms.
//!
//! All selections go through explicit index lists. An empty list never
//! reaches the tensor backend: the corresponding term degrades to zero.

use candle_core::{DType, Device, Tensor};
use causalbert_core::{LossWeights, ResponseType};

/// 0-dim f32 zero on `device`.
pub fn zero_loss(device: &Device) -> candle_core::Result<Tensor> {
    Tensor::zeros((), DType::F32, device)
}

/// Treatment label as an arm index, or `None` when missing or malformed.
pub fn arm_of(treatment: Option<i64>) -> Option<usize> {
    match treatment {
        Some(0) => Some(0),
        Some(1) => Some(1),
        _ => None,
    }
}

/// Whether `y` is a usable outcome label under `response`.
pub fn outcome_is_valid(y: Option<f64>, response: ResponseType) -> bool {
    match (y, response) {
        (Some(y), ResponseType::Binary) => y == 0.0 || y == 1.0,
        (Some(y), ResponseType::Continuous) => y.is_finite(),
        (None, _) => false,
    }
}

/// Batch rows grouped by observed arm.
///
/// Only rows with a valid treatment and a valid outcome are listed; malformed
/// rows are silently excluded from outcome supervision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArmPartition {
    pub control: Vec<usize>,
    pub treated: Vec<usize>,
}

impl ArmPartition {
    pub fn arm(&self, arm: usize) -> &[usize] {
        if arm == 0 {
            &self.control
        } else {
            &self.treated
        }
    }

    pub fn len(&self) -> usize {
        self.control.len() + self.treated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn partition_by_arm(
    treatments: &[Option<i64>],
    outcomes: &[Option<f64>],
    response: ResponseType,
) -> ArmPartition {
    let mut partition = ArmPartition::default();
    for (i, (&t, &y)) in treatments.iter().zip(outcomes).enumerate() {
        if !outcome_is_valid(y, response) {
            continue;
        }
        match arm_of(t) {
            Some(0) => partition.control.push(i),
            Some(_) => partition.treated.push(i),
            None => {}
        }
    }
    partition
}

/// Rows of `t` at `indices`, or `None` when `indices` is empty.
pub fn select_rows(t: &Tensor, indices: &[usize]) -> candle_core::Result<Option<Tensor>> {
    if indices.is_empty() {
        return Ok(None);
    }
    let idx: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
    let idx = Tensor::new(idx.as_slice(), t.device())?;
    Ok(Some(t.contiguous()?.index_select(&idx, 0)?))
}

/// Propensity cross-entropy over rows with a valid treatment label.
pub fn propensity_loss(logits: &Tensor, treatments: &[Option<i64>]) -> candle_core::Result<Tensor> {
    let mut rows = Vec::new();
    let mut labels = Vec::new();
    for (i, &t) in treatments.iter().enumerate() {
        if let Some(arm) = arm_of(t) {
            rows.push(i);
            labels.push(arm as u32);
        }
    }
    match select_rows(logits, &rows)? {
        Some(picked) => {
            let labels = Tensor::new(labels.as_slice(), logits.device())?;
            candle_nn::loss::cross_entropy(&picked, &labels)
        }
        None => zero_loss(logits.device()),
    }
}

/// Mean smooth-L1 (Huber, beta 1) loss.
pub fn smooth_l1(pred: &Tensor, target: &Tensor) -> candle_core::Result<Tensor> {
    let abs = (pred - target)?.abs()?;
    let quad = abs.minimum(&abs.ones_like()?)?;
    let per_row = ((quad.sqr()? * 0.5)? + (abs - quad)?)?;
    per_row.mean_all()
}

/// Single factual loss over both arms.
///
/// `arm_logits[a]` holds head `a`'s `[batch, 2]` output for every row. Rows of
/// `partition.control` are scored only by head 0 and rows of
/// `partition.treated` only by head 1; the two factual subsets are
/// concatenated before one loss is taken, so neither head ever sees a label
/// from the other arm. Binary outcomes use cross-entropy over the logits;
/// continuous outcomes regress column 1 with smooth L1.
pub fn factual_outcome_loss(
    arm_logits: [&Tensor; 2],
    outcomes: &[Option<f64>],
    partition: &ArmPartition,
    response: ResponseType,
) -> candle_core::Result<Tensor> {
    let device = arm_logits[0].device();
    if partition.is_empty() {
        return zero_loss(device);
    }

    let mut preds: Vec<Tensor> = Vec::with_capacity(2);
    let mut labels: Vec<f64> = Vec::with_capacity(partition.len());
    for (arm, logits) in arm_logits.iter().enumerate() {
        let rows = partition.arm(arm);
        let scored = match response {
            ResponseType::Binary => (*logits).clone(),
            ResponseType::Continuous => logits.narrow(1, 1, 1)?.squeeze(1)?,
        };
        if let Some(picked) = select_rows(&scored, rows)? {
            preds.push(picked);
            labels.extend(rows.iter().filter_map(|&i| outcomes[i]));
        }
    }

    let preds = Tensor::cat(&preds, 0)?;
    match response {
        ResponseType::Binary => {
            let labels: Vec<u32> = labels.iter().map(|&y| y as u32).collect();
            let labels = Tensor::new(labels.as_slice(), device)?;
            candle_nn::loss::cross_entropy(&preds, &labels)
        }
        ResponseType::Continuous => {
            let labels: Vec<f32> = labels.iter().map(|&y| y as f32).collect();
            let labels = Tensor::new(labels.as_slice(), device)?;
            smooth_l1(&preds, &labels)
        }
    }
}

/// `w.g·g + w.q·q + w.mlm·mlm` on 0-dim loss tensors.
pub fn weighted_total(
    weights: &LossWeights,
    g_loss: &Tensor,
    q_loss: &Tensor,
    mlm_loss: &Tensor,
) -> candle_core::Result<Tensor> {
    let g = g_loss.affine(weights.g, 0.0)?;
    let q = q_loss.affine(weights.q, 0.0)?;
    let mlm = mlm_loss.affine(weights.mlm, 0.0)?;
    (g + q)? + mlm
}
