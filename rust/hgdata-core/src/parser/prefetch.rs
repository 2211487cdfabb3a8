// rust/hgdata-core/src/parser/prefetch.rs

//! Background batch preparation.
//!
//! A dispatcher thread walks the epoch cursor and hands plans to a pool of
//! worker threads. Every plan needs a credit; the consumer returns one credit
//! per delivered batch, so at most `depth` batches are planned ahead of the
//! consumer. Workers may finish out of order and the consumer puts results
//! back into plan order before delivering them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::error::{DataError, Result};
use crate::store::Store;

use super::batch::{Batch, BatchAssembler};
use super::cursor::{BatchPlan, EpochCursor};

/// How often blocked threads look at the stop signal.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Stop conditions observed by a stream and its threads: the stream's own
/// flag, the flag of the parser that created it, and the store being closed.
#[derive(Clone)]
pub(crate) struct StopSignal {
    stream: Arc<AtomicBool>,
    parser: Arc<AtomicBool>,
    store: Arc<Store>,
}

impl StopSignal {
    pub(crate) fn new(parser: Arc<AtomicBool>, store: Arc<Store>) -> Self {
        Self {
            stream: Arc::new(AtomicBool::new(false)),
            parser,
            store,
        }
    }

    pub(crate) fn is_set(&self) -> bool {
        self.stream.load(Ordering::Relaxed)
            || self.parser.load(Ordering::Relaxed)
            || self.store.is_closed()
    }

    pub(crate) fn set(&self) {
        self.stream.store(true, Ordering::Relaxed);
    }
}

type Prepared = (u64, Result<Batch>);

pub(crate) struct PrefetchPool {
    results: Receiver<Prepared>,
    credits: Sender<()>,
    reorder: BTreeMap<u64, Result<Batch>>,
    next_seq: u64,
    stop: StopSignal,
    threads: Vec<JoinHandle<()>>,
}

impl PrefetchPool {
    pub(crate) fn spawn(
        cursor: EpochCursor,
        assembler: Arc<BatchAssembler>,
        workers: usize,
        depth: usize,
        stop: StopSignal,
    ) -> Self {
        let depth = depth.max(1);
        let (credit_tx, credit_rx) = channel::bounded(depth);
        for _ in 0..depth {
            let _ = credit_tx.try_send(());
        }
        let (plan_tx, plan_rx) = channel::unbounded::<BatchPlan>();
        let (result_tx, result_rx) = channel::unbounded::<Prepared>();

        let mut threads = Vec::with_capacity(workers + 1);

        let dispatcher_stop = stop.clone();
        threads.push(thread::spawn(move || {
            dispatch(cursor, credit_rx, plan_tx, dispatcher_stop)
        }));

        for worker_id in 0..workers.max(1) {
            let plans = plan_rx.clone();
            let results = result_tx.clone();
            let assembler = Arc::clone(&assembler);
            let worker_stop = stop.clone();
            threads.push(thread::spawn(move || {
                work(worker_id, plans, results, assembler, worker_stop)
            }));
        }

        debug!(workers, depth, "Started prefetch pool");

        Self {
            results: result_rx,
            credits: credit_tx,
            reorder: BTreeMap::new(),
            next_seq: 0,
            stop,
            threads,
        }
    }

    /// Waits for the next batch in plan order.
    ///
    /// Returns `None` once the stop signal is set.
    pub(crate) fn next(&mut self) -> Option<Result<Batch>> {
        loop {
            if self.stop.is_set() {
                return None;
            }

            if let Some(result) = self.reorder.remove(&self.next_seq) {
                self.next_seq += 1;
                let _ = self.credits.try_send(());
                return Some(result);
            }

            match self.results.recv_timeout(POLL_INTERVAL) {
                Ok((seq, result)) => {
                    self.reorder.insert(seq, result);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Some(Err(DataError::closed("prefetch workers")));
                }
            }
        }
    }

    /// Signals all threads to stop and waits for them.
    pub(crate) fn shutdown(&mut self) {
        self.stop.set();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("Prefetch thread panicked");
            }
        }
        self.reorder.clear();
    }
}

impl Drop for PrefetchPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dispatch(
    mut cursor: EpochCursor,
    credits: Receiver<()>,
    plans: Sender<BatchPlan>,
    stop: StopSignal,
) {
    while !stop.is_set() {
        match credits.recv_timeout(POLL_INTERVAL) {
            Ok(()) => {
                if plans.send(cursor.next_plan()).is_err() {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!(epoch = cursor.epoch(), "Prefetch dispatcher stopped");
}

fn work(
    worker_id: usize,
    plans: Receiver<BatchPlan>,
    results: Sender<Prepared>,
    assembler: Arc<BatchAssembler>,
    stop: StopSignal,
) {
    while !stop.is_set() {
        let plan = match plans.recv_timeout(POLL_INTERVAL) {
            Ok(plan) => plan,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let seq = plan.seq;
        let result = assembler.assemble(plan);

        if results.send((seq, result)).is_err() {
            break;
        }
    }
    debug!(worker_id, "Prefetch worker stopped");
}
