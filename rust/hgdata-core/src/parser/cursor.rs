// rust/hgdata-core/src/parser/cursor.rs

//! Epoch cursor: decides which samples go into each batch.
//!
//! The cursor walks a group's samples batch by batch and wraps around to the
//! next epoch forever. A batch never spans two epochs. Without `drop_last`
//! the final batch of an epoch holds the `total % batch_size` leftover
//! samples; with it those samples are skipped.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::{DataError, Result};

/// Seed domain for per-epoch shuffling.
pub(crate) const SHUFFLE_DOMAIN: u64 = 0x5348_5546_464c_4521;
/// Seed domain for per-batch preprocessing randomness.
pub(crate) const PREPROCESS_DOMAIN: u64 = 0x5052_4550_524f_4321;

/// Derives an independent seed for item `index` of `domain` from a base seed.
pub(crate) fn derive_seed(seed: u64, domain: u64, index: u64) -> u64 {
    splitmix64(splitmix64(seed ^ domain).wrapping_add(index))
}

fn splitmix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Number of batches in one epoch.
pub fn steps_per_epoch(total: u64, batch_size: u64, drop_last: bool) -> u64 {
    if batch_size == 0 {
        return 0;
    }
    if drop_last {
        total / batch_size
    } else {
        total.div_ceil(batch_size)
    }
}

/// Samples of one batch, in delivery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPlan {
    /// Position of the batch in the stream, counting across epochs.
    pub seq: u64,
    pub epoch: u64,
    /// Position of the batch within its epoch.
    pub step: u64,
    pub indices: Vec<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// No batch planned yet.
    Idle,
    /// Inside an epoch; `position` is the next unplanned slot of the epoch
    /// order.
    Reading { position: u64 },
    /// The current epoch is exhausted; the next plan starts a new one.
    Wrapped,
}

#[derive(Debug, Clone)]
pub struct EpochCursor {
    total: u64,
    batch_size: u64,
    drop_last: bool,
    shuffle: bool,
    seed: u64,
    state: CursorState,
    epoch: u64,
    step: u64,
    seq: u64,
    order: Option<Vec<u64>>,
}

impl EpochCursor {
    /// # Errors
    ///
    /// Returns a `Config` error if no batch could ever be planned.
    pub fn new(total: u64, batch_size: u64, drop_last: bool, shuffle: bool, seed: u64) -> Result<Self> {
        if batch_size == 0 {
            return Err(DataError::config("batch size must be greater than 0"));
        }
        if total == 0 {
            return Err(DataError::config("cannot iterate over an empty group"));
        }
        if drop_last && total < batch_size {
            return Err(DataError::config(format!(
                "drop_last with {total} samples and batch size {batch_size} leaves no batches"
            )));
        }
        Ok(Self {
            total,
            batch_size,
            drop_last,
            shuffle,
            seed,
            state: CursorState::Idle,
            epoch: 0,
            step: 0,
            seq: 0,
            order: None,
        })
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn steps(&self) -> u64 {
        steps_per_epoch(self.total, self.batch_size, self.drop_last)
    }

    /// Plans the next batch, starting a new epoch when needed.
    pub fn next_plan(&mut self) -> BatchPlan {
        loop {
            match self.state {
                CursorState::Idle => self.begin_epoch(0),
                CursorState::Wrapped => self.begin_epoch(self.epoch + 1),
                CursorState::Reading { position } => {
                    let end = (position + self.batch_size).min(self.total);
                    let indices = match &self.order {
                        Some(order) => order[position as usize..end as usize].to_vec(),
                        None => (position..end).collect(),
                    };
                    let plan = BatchPlan {
                        seq: self.seq,
                        epoch: self.epoch,
                        step: self.step,
                        indices,
                    };

                    self.seq += 1;
                    self.step += 1;
                    self.state = if end >= self.epoch_end() {
                        CursorState::Wrapped
                    } else {
                        CursorState::Reading { position: end }
                    };
                    return plan;
                }
            }
        }
    }

    /// Number of epoch slots that are actually delivered.
    fn epoch_end(&self) -> u64 {
        if self.drop_last {
            self.steps() * self.batch_size
        } else {
            self.total
        }
    }

    fn begin_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
        self.step = 0;
        self.order = self.shuffle.then(|| {
            let mut order: Vec<u64> = (0..self.total).collect();
            let mut rng = StdRng::seed_from_u64(derive_seed(self.seed, SHUFFLE_DOMAIN, epoch));
            order.shuffle(&mut rng);
            order
        });
        self.state = CursorState::Reading { position: 0 };
    }
}
