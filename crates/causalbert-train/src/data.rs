//! Tokenized datasets and mini-batch iteration.

use causalbert_core::{Example, Result};
use causalbert_model::{Batch, TextTokenizer, TokenizedText};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Examples tokenized once, with their covariates and labels.
#[derive(Debug, Clone, Default)]
pub struct TokenizedDataset {
    rows: Vec<TokenizedText>,
    confounders: Vec<i64>,
    treatments: Vec<Option<i64>>,
    outcomes: Vec<Option<f64>>,
}

impl TokenizedDataset {
    /// Tokenize every example to `max_length`.
    ///
    /// Tokenizer failures propagate unchanged.
    pub fn build(
        examples: &[Example],
        tokenizer: &dyn TextTokenizer,
        max_length: usize,
    ) -> Result<Self> {
        let rows = examples
            .iter()
            .map(|e| tokenizer.tokenize(&e.text, max_length))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            rows,
            confounders: examples.iter().map(|e| e.confounder).collect(),
            treatments: examples.iter().map(|e| e.treatment).collect(),
            outcomes: examples.iter().map(|e| e.outcome).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn outcomes(&self) -> &[Option<f64>] {
        &self.outcomes
    }

    /// Batch of the rows at `indices`; labels attached when `with_outcomes`.
    pub fn batch(&self, indices: &[usize], with_outcomes: bool) -> Result<Batch> {
        let rows: Vec<&TokenizedText> = indices.iter().map(|&i| &self.rows[i]).collect();
        let outcomes = with_outcomes.then(|| indices.iter().map(|&i| self.outcomes[i]).collect());
        Batch::from_rows(
            &rows,
            indices.iter().map(|&i| self.confounders[i]).collect(),
            indices.iter().map(|&i| self.treatments[i]).collect(),
            outcomes,
        )
    }
}

/// Visiting order of a [`BatchIterator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sampling {
    /// Reshuffled every epoch.
    Random,
    /// Dataset order; used for evaluation and inference.
    Sequential,
}

/// Mini-batch iterator over a [`TokenizedDataset`].
pub struct BatchIterator<'a> {
    dataset: &'a TokenizedDataset,
    indices: Vec<usize>,
    batch_size: usize,
    pos: usize,
    with_outcomes: bool,
    sampling: Sampling,
}

impl<'a> BatchIterator<'a> {
    pub fn new(
        dataset: &'a TokenizedDataset,
        batch_size: usize,
        sampling: Sampling,
        with_outcomes: bool,
    ) -> Self {
        Self {
            dataset,
            indices: (0..dataset.len()).collect(),
            batch_size: batch_size.max(1),
            pos: 0,
            with_outcomes,
            sampling,
        }
    }

    /// Batches per epoch.
    pub fn num_batches(&self) -> usize {
        self.indices.len().div_ceil(self.batch_size)
    }

    /// Restart the epoch. Random sampling reshuffles with a seed derived
    /// from base seed + epoch.
    pub fn reshuffle(&mut self, seed: u64, epoch: usize) {
        if self.sampling == Sampling::Random {
            let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(epoch as u64));
            self.indices.shuffle(&mut rng);
        }
        self.pos = 0;
    }

    /// Returns the next mini-batch, or `None` once the epoch is exhausted.
    pub fn next_batch(&mut self) -> Result<Option<Batch>> {
        let n = self.indices.len();
        if self.pos >= n {
            return Ok(None);
        }
        let end = (self.pos + self.batch_size).min(n);
        let batch = self
            .dataset
            .batch(&self.indices[self.pos..end], self.with_outcomes)?;
        self.pos = end;
        Ok(Some(batch))
    }
}
