// rust/hgdata-core/src/parser/stream.rs

use std::sync::Arc;

use tracing::debug;

use crate::error::Result;

use super::batch::{Batch, BatchAssembler};
use super::cursor::EpochCursor;
use super::prefetch::{PrefetchPool, StopSignal};

enum Source {
    Inline {
        cursor: EpochCursor,
        assembler: Arc<BatchAssembler>,
    },
    Prefetch(PrefetchPool),
}

/// An endless stream of batches cycling over the epochs of a group.
///
/// The iterator never runs out on its own: after the last batch of an epoch
/// the next epoch starts. It returns `None` only once the stream or its
/// parser has been closed. A failed batch is reported as `Some(Err(..))`
/// and the following call moves on to the next batch.
pub struct BatchStream {
    source: Option<Source>,
    stop: StopSignal,
    seed: u64,
    steps: u64,
}

impl BatchStream {
    pub(crate) fn inline(
        cursor: EpochCursor,
        assembler: Arc<BatchAssembler>,
        stop: StopSignal,
        seed: u64,
    ) -> Self {
        Self {
            steps: cursor.steps(),
            source: Some(Source::Inline { cursor, assembler }),
            stop,
            seed,
        }
    }

    pub(crate) fn prefetched(
        cursor: EpochCursor,
        assembler: Arc<BatchAssembler>,
        workers: usize,
        depth: usize,
        stop: StopSignal,
        seed: u64,
    ) -> Self {
        let steps = cursor.steps();
        let pool = PrefetchPool::spawn(cursor, assembler, workers, depth, stop.clone());
        Self {
            source: Some(Source::Prefetch(pool)),
            stop,
            seed,
            steps,
        }
    }

    /// Seed used for shuffling and preprocessing randomness.
    ///
    /// Passing it back through `ParserConfig::seed` reproduces the stream.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Number of batches in one epoch.
    pub fn steps_per_epoch(&self) -> u64 {
        self.steps
    }

    /// Stops the stream and joins its worker threads. Idempotent.
    pub fn close(&mut self) {
        self.stop.set();
        if let Some(source) = self.source.take() {
            if let Source::Prefetch(mut pool) = source {
                pool.shutdown();
            }
            debug!("Closed batch stream");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.source.is_none() || self.stop.is_set()
    }

    /// Returns the next batch, or `None` once the stream is closed.
    pub fn next_batch(&mut self) -> Option<Result<Batch>> {
        if self.stop.is_set() {
            self.close();
            return None;
        }
        let next = match self.source.as_mut()? {
            Source::Inline { cursor, assembler } => Some(assembler.assemble(cursor.next_plan())),
            Source::Prefetch(pool) => pool.next(),
        };
        if next.is_none() {
            self.close();
        }
        next
    }
}

impl Iterator for BatchStream {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch()
    }
}

impl Drop for BatchStream {
    fn drop(&mut self) {
        self.close();
    }
}
