//! Training and held-out evaluation loops.

use candle_core::Tensor;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use causalbert_core::{CausalBertError, EpochLosses, LossHistory, Result, TrainConfig};
use causalbert_model::{Batch, CausalBert};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::data::{BatchIterator, Sampling, TokenizedDataset};
use crate::schedule::LinearSchedule;

/// Per-epoch loss histories of one `train` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingReport {
    pub train: LossHistory,
    pub dev: LossHistory,
}

/// Loss tensors of one optimisation step.
struct StepLosses {
    total: Tensor,
    g: Tensor,
    q: Tensor,
    mlm: Tensor,
}

/// Running sums of per-batch loss values.
#[derive(Default)]
struct LossAccumulator {
    total: f64,
    g: f64,
    q: f64,
    mlm: f64,
    batches: usize,
}

impl LossAccumulator {
    fn add(&mut self, step: &StepLosses) -> Result<()> {
        self.total += scalar(&step.total)?;
        self.g += scalar(&step.g)?;
        self.q += scalar(&step.q)?;
        self.mlm += scalar(&step.mlm)?;
        self.batches += 1;
        Ok(())
    }

    fn mean(&self, epoch: usize) -> EpochLosses {
        if self.batches == 0 {
            return EpochLosses {
                epoch,
                ..Default::default()
            };
        }
        let n = self.batches as f64;
        EpochLosses {
            epoch,
            total: self.total / n,
            g: self.g / n,
            q: self.q / n,
            mlm: self.mlm / n,
        }
    }
}

fn scalar(t: &Tensor) -> Result<f64> {
    t.to_scalar::<f32>()
        .map(f64::from)
        .map_err(|e| CausalBertError::Model(format!("Loss scalar failed: {e}")))
}

/// Drives optimisation of a [`CausalBert`].
///
/// Holds the model exclusively for its lifetime: batches are processed
/// strictly one after another and nothing else may touch the parameters.
pub struct Trainer<'m> {
    model: &'m mut CausalBert,
    config: TrainConfig,
}

impl<'m> Trainer<'m> {
    pub fn new(model: &'m mut CausalBert, config: TrainConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { model, config })
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// Train on the joint objective for `config.epochs` epochs.
    ///
    /// After each epoch the dev set is evaluated with MLM disabled. The
    /// datasets are only read.
    pub fn train(
        &mut self,
        train: &TokenizedDataset,
        dev: &TokenizedDataset,
    ) -> Result<TrainingReport> {
        let weights = *self.model.loss_weights();
        let mut report = TrainingReport::default();
        let model: &CausalBert = &*self.model;
        let config = &self.config;

        tracing::info!(
            examples = train.len(),
            dev_examples = dev.len(),
            epochs = config.epochs,
            batch_size = config.batch_size,
            lr = config.learning_rate,
            "Training CausalBert"
        );

        run_epochs(
            model,
            config,
            train,
            |batch, rng| {
                let out = model.forward(batch, Some(rng))?;
                Ok(StepLosses {
                    total: out.total_loss(&weights)?,
                    g: out.g_loss,
                    q: out.q_loss,
                    mlm: out.mlm_loss,
                })
            },
            |epoch, losses| {
                tracing::info!(
                    epoch,
                    total = losses.total,
                    g = losses.g,
                    q = losses.q,
                    mlm = losses.mlm,
                    "train losses"
                );
                report.train.push(losses);

                let dev_losses = evaluate(model, config, dev, epoch)?;
                tracing::info!(
                    epoch,
                    total = dev_losses.total,
                    g = dev_losses.g,
                    q = dev_losses.q,
                    mlm = dev_losses.mlm,
                    "dev losses"
                );
                report.dev.push(dev_losses);
                Ok(())
            },
        )?;

        Ok(report)
    }

    /// Warm-start the propensity head on the propensity + MLM objective.
    pub fn pretrain(&mut self, train: &TokenizedDataset) -> Result<LossHistory> {
        let weights = *self.model.loss_weights();
        let mut history = LossHistory::default();
        let model: &CausalBert = &*self.model;

        tracing::info!(
            examples = train.len(),
            epochs = self.config.epochs,
            "Pretraining propensity"
        );

        run_epochs(
            model,
            &self.config,
            train,
            |batch, rng| {
                let out = model.pretrain_forward(batch, Some(rng))?;
                let q = out.g_loss.zeros_like().map_err(|e| {
                    CausalBertError::Model(format!("Failed to create zero loss: {e}"))
                })?;
                Ok(StepLosses {
                    total: out.total_loss(&weights)?,
                    g: out.g_loss,
                    q,
                    mlm: out.mlm_loss,
                })
            },
            |epoch, losses| {
                tracing::info!(
                    epoch,
                    total = losses.total,
                    g = losses.g,
                    mlm = losses.mlm,
                    "pretrain losses"
                );
                history.push(losses);
                Ok(())
            },
        )?;

        Ok(history)
    }

    /// Mean held-out losses with MLM disabled; no parameter is updated.
    pub fn evaluate_losses(&self, dev: &TokenizedDataset) -> Result<EpochLosses> {
        evaluate(&*self.model, &self.config, dev, 0)
    }
}

/// Shared epoch loop: shuffle, step, schedule, aggregate.
fn run_epochs<S, E>(
    model: &CausalBert,
    config: &TrainConfig,
    data: &TokenizedDataset,
    mut step: S,
    mut end_epoch: E,
) -> Result<()>
where
    S: FnMut(&Batch, &mut dyn RngCore) -> Result<StepLosses>,
    E: FnMut(usize, EpochLosses) -> Result<()>,
{
    let mut batches = BatchIterator::new(data, config.batch_size, Sampling::Random, true);
    let schedule = LinearSchedule::new(
        batches.num_batches() * config.epochs,
        config.warmup_fraction,
    );

    let mut optimizer = AdamW::new(
        model.store().all_vars(),
        ParamsAdamW {
            lr: schedule.learning_rate(config.learning_rate, 0),
            eps: config.adam_eps,
            weight_decay: config.weight_decay,
            ..Default::default()
        },
    )
    .map_err(|e| CausalBertError::Model(format!("Failed to create optimizer: {e}")))?;

    let mut mlm_rng = ChaCha8Rng::seed_from_u64(config.seed);
    let mut global_step = 0usize;

    for epoch in 0..config.epochs {
        batches.reshuffle(config.seed, epoch);
        let mut acc = LossAccumulator::default();

        while let Some(batch) = batches.next_batch()? {
            optimizer.set_learning_rate(schedule.learning_rate(config.learning_rate, global_step));

            let losses = step(&batch, &mut mlm_rng)?;
            optimizer
                .backward_step(&losses.total)
                .map_err(|e| CausalBertError::Model(format!("Backward step failed: {e}")))?;

            acc.add(&losses)?;
            tracing::debug!(
                epoch,
                step = global_step,
                lr = optimizer.learning_rate(),
                loss = scalar(&losses.total)?,
                "batch"
            );
            global_step += 1;
        }

        end_epoch(epoch, acc.mean(epoch))?;
    }
    Ok(())
}

/// Sequential pass over `data` in training mode without MLM or updates.
fn evaluate(
    model: &CausalBert,
    config: &TrainConfig,
    data: &TokenizedDataset,
    epoch: usize,
) -> Result<EpochLosses> {
    let weights = *model.loss_weights();
    let mut batches = BatchIterator::new(data, config.batch_size, Sampling::Sequential, true);
    let mut acc = LossAccumulator::default();

    while let Some(batch) = batches.next_batch()? {
        let out = model.forward(&batch, None)?;
        acc.add(&StepLosses {
            total: out.total_loss(&weights)?.detach(),
            g: out.g_loss.detach(),
            q: out.q_loss.detach(),
            mlm: out.mlm_loss.detach(),
        })?;
    }
    Ok(acc.mean(epoch))
}
