//! Chunked batch dispatch.
//!
//! [`parallel_gen`] splits the items into one contiguous batch per worker,
//! builds a [`BatchWorker`] inside each worker, and streams every output back
//! through one shared channel as a `(global_index, value)` envelope.
//!
//! Envelopes arrive in completion order, not input order. The stream yields
//! exactly one envelope per item, each tagged with the item's true position;
//! use [`GenResults::into_ordered`] when input order is needed.
//!
//! ```text
//! Idle ─▶ Partitioned ─▶ Spawned ─▶ Draining(k/N) ─▶ Joined ─▶ Done
//!   └──────────┴─────────────┴────────────┴──────────▶ Failed
//! ```

use super::core::ExecutionStrategy;
use super::progress::{IndicatifSink, ProgressSink};
use super::worker::{CancelToken, SpawnContext, WorkerGroup, panic_message};
use crate::platform::{CapabilityProbe, PlatformProbe};
use anyhow::{Context, Result, anyhow, ensure};
use crossbeam::channel::{Receiver, Sender, unbounded};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// An object that processes one contiguous batch of items.
///
/// A fresh instance is built inside every worker, so implementors need not be
/// `Send`. `call` must yield exactly one output per input item.
pub trait BatchWorker {
    type Input: Send + 'static;
    type Output: Send + 'static;

    fn call(&mut self, batch: Vec<Self::Input>) -> impl Iterator<Item = Result<Self::Output>>;
}

/// A contiguous slice of the input and the index of its first item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch<T> {
    pub start: usize,
    pub items: Vec<T>,
}

/// Split `items` into `n_batches` contiguous batches whose sizes differ by at
/// most one. Earlier batches take the remainder.
pub fn partition<T>(items: Vec<T>, n_batches: usize) -> Vec<Batch<T>> {
    let n_batches = n_batches.max(1);
    let base = items.len() / n_batches;
    let remainder = items.len() % n_batches;

    let mut batches = Vec::with_capacity(n_batches);
    let mut items = items.into_iter();
    let mut start = 0;
    for batch in 0..n_batches {
        let len = base + usize::from(batch < remainder);
        batches.push(Batch {
            start,
            items: items.by_ref().take(len).collect(),
        });
        start += len;
    }
    batches
}

/// Lifecycle of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    Partitioned,
    Spawned,
    Draining { collected: usize, total: usize },
    Joined,
    Done,
    Failed,
}

enum Envelope<R> {
    Item(usize, R),
    Failed(anyhow::Error),
}

/// Run one [`BatchWorker`] per batch and stream `(index, output)` envelopes.
pub fn parallel_gen<W, M>(make: M, items: Vec<W::Input>, n_workers: usize) -> Result<GenResults<W::Output>>
where
    W: BatchWorker,
    M: Fn() -> Result<W> + Send + Sync + 'static,
{
    parallel_gen_with(&PlatformProbe, &SpawnContext::platform_default(), make, items, n_workers, false)
}

/// [`parallel_gen`] with an explicit probe and spawn context.
///
/// With `progress` an indicatif bar counts envelopes as they are pulled and
/// is cleared when the stream ends.
pub fn parallel_gen_with<W, M>(
    probe: &dyn CapabilityProbe,
    spawn: &SpawnContext,
    make: M,
    items: Vec<W::Input>,
    n_workers: usize,
    progress: bool,
) -> Result<GenResults<W::Output>>
where
    W: BatchWorker,
    M: Fn() -> Result<W> + Send + Sync + 'static,
{
    let total = items.len();
    let progress = progress.then(|| IndicatifSink::new(Some(total)));

    let workers = match ExecutionStrategy::select(probe, "n_workers", n_workers, false) {
        ExecutionStrategy::Sequential => {
            let mut worker = make().context("failed to construct batch worker")?;
            let outputs = worker.call(items).collect::<Result<Vec<_>>>()?;
            ensure!(
                outputs.len() == total,
                "batch worker produced {} outputs for {total} items",
                outputs.len()
            );
            return Ok(GenResults::sequential(outputs, progress));
        }
        ExecutionStrategy::Parallel { workers } => workers,
    };

    let (result_tx, result_rx) = unbounded();
    let args: Vec<_> = partition(items, workers)
        .into_iter()
        .filter(|batch| !batch.items.is_empty())
        .map(|batch| (batch, result_tx.clone()))
        .collect();
    drop(result_tx);
    tracing::debug!(total, batches = args.len(), "dispatch partitioned");

    let make = Arc::new(make);
    let group = WorkerGroup::start(spawn, args, move |(batch, results), cancel| {
        run_batch::<W, M>(make.as_ref(), batch, &results, cancel)
    })?;
    tracing::debug!(total, workers = group.len(), "dispatch workers spawned");

    Ok(GenResults {
        source: Source::Workers {
            results: result_rx,
            group: Some(group),
        },
        total,
        collected: 0,
        state: DispatchState::Spawned,
        deferred_error: None,
        progress,
    })
}

/// Body of one dispatch worker. Every failure is reported as an envelope.
fn run_batch<W, M>(make: &M, batch: Batch<W::Input>, results: &Sender<Envelope<W::Output>>, cancel: &CancelToken)
where
    W: BatchWorker,
    M: Fn() -> Result<W>,
{
    let Batch { start, items } = batch;
    let expected = items.len();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> Result<()> {
        let mut worker = make().context("failed to construct batch worker")?;
        let mut produced = 0;
        for output in worker.call(items) {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let output = output?;
            ensure!(produced < expected, "produced more than {expected} outputs");
            if results.send(Envelope::Item(start + produced, output)).is_err() {
                // The consumer is gone; nothing left to deliver to.
                return Ok(());
            }
            produced += 1;
        }
        ensure!(produced == expected, "produced {produced} outputs for {expected} items");
        Ok(())
    }))
    .unwrap_or_else(|payload| Err(anyhow!("batch worker panicked: {}", panic_message(payload.as_ref()))));

    if let Err(err) = outcome {
        let err = err.context(format!("batch starting at item {start} failed"));
        let _ = results.send(Envelope::Failed(err));
    }
}

enum Source<R> {
    Sequential(std::iter::Enumerate<std::vec::IntoIter<R>>),
    Workers {
        results: Receiver<Envelope<R>>,
        group: Option<WorkerGroup<()>>,
    },
}

/// Stream of `(global_index, value)` envelopes from [`parallel_gen`].
///
/// Dropping the stream early cancels the outstanding workers and joins them.
pub struct GenResults<R> {
    source: Source<R>,
    total: usize,
    collected: usize,
    state: DispatchState,
    deferred_error: Option<anyhow::Error>,
    progress: Option<IndicatifSink>,
}

impl<R> GenResults<R> {
    fn sequential(outputs: Vec<R>, progress: Option<IndicatifSink>) -> Self {
        Self {
            total: outputs.len(),
            source: Source::Sequential(outputs.into_iter().enumerate()),
            collected: 0,
            state: DispatchState::Idle,
            deferred_error: None,
            progress,
        }
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    /// Number of envelopes this stream yields in total.
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn collected(&self) -> usize {
        self.collected
    }

    /// Drain the stream and reorder the values by their original index.
    pub fn into_ordered(self) -> Result<Vec<R>> {
        let mut slots: Vec<Option<R>> = std::iter::repeat_with(|| None).take(self.total).collect();
        for envelope in self {
            let (index, value) = envelope?;
            let slot = slots
                .get_mut(index)
                .ok_or_else(|| anyhow!("envelope index {index} is out of range"))?;
            ensure!(slot.is_none(), "envelope index {index} was delivered twice");
            *slot = Some(value);
        }
        slots
            .into_iter()
            .collect::<Option<Vec<R>>>()
            .context("dispatch finished with missing envelopes")
    }

    fn transition(&mut self, state: DispatchState) {
        tracing::trace!(from = ?self.state, to = ?state, "dispatch state");
        self.state = state;
        if matches!(state, DispatchState::Done | DispatchState::Failed) {
            self.finish_progress();
        }
    }

    fn finish_progress(&mut self) {
        if let Some(mut sink) = self.progress.take() {
            sink.finish();
        }
    }

    /// A failure a worker reported after its last item was delivered.
    ///
    /// Only meaningful once the workers are joined: every envelope they will
    /// ever send is already in the channel.
    fn late_failure(&self) -> Option<anyhow::Error> {
        let Source::Workers { results, .. } = &self.source else {
            return None;
        };
        results.try_iter().find_map(|envelope| match envelope {
            Envelope::Failed(err) => Some(err),
            Envelope::Item(..) => None,
        })
    }

    /// Join the workers. With `cancel` they are asked to stop first.
    fn join_workers(&mut self, cancel: bool) -> Result<()> {
        if let Source::Workers { group: slot, .. } = &mut self.source
            && let Some(group) = slot.take()
        {
            if cancel {
                group.cancel();
            }
            group.join_all()?;
        }
        Ok(())
    }

    fn fail(&mut self, err: anyhow::Error) -> anyhow::Error {
        if let Err(join_err) = self.join_workers(true) {
            tracing::warn!("{join_err:#}");
        }
        self.transition(DispatchState::Failed);
        err
    }
}

impl<R> Iterator for GenResults<R> {
    type Item = Result<(usize, R)>;

    fn next(&mut self) -> Option<Self::Item> {
        if matches!(self.state, DispatchState::Done | DispatchState::Failed) {
            return None;
        }

        if self.collected == self.total {
            if let Some(err) = self.deferred_error.take() {
                self.transition(DispatchState::Failed);
                return Some(Err(err));
            }
            if let Err(err) = self.join_workers(false) {
                return Some(Err(self.fail(err)));
            }
            self.transition(DispatchState::Done);
            return None;
        }

        let envelope = match &mut self.source {
            Source::Sequential(outputs) => outputs.next().map(|(index, value)| Envelope::Item(index, value)),
            Source::Workers { results, .. } => results.recv().ok(),
        };

        match envelope {
            Some(Envelope::Item(index, value)) => {
                self.collected += 1;
                self.transition(DispatchState::Draining {
                    collected: self.collected,
                    total: self.total,
                });
                if let Some(sink) = self.progress.as_mut() {
                    sink.tick(self.collected, Some(self.total));
                }
                if self.collected == self.total {
                    match self.join_workers(false) {
                        Err(err) => self.deferred_error = Some(err),
                        Ok(()) => match self.late_failure() {
                            Some(err) => self.deferred_error = Some(err),
                            None => self.transition(DispatchState::Joined),
                        },
                    }
                }
                Some(Ok((index, value)))
            }
            Some(Envelope::Failed(err)) => Some(Err(self.fail(err))),
            None => {
                let err = anyhow!(
                    "batch workers stopped after delivering {} of {} results",
                    self.collected,
                    self.total
                );
                Some(Err(self.fail(err)))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if matches!(self.state, DispatchState::Done | DispatchState::Failed) {
            return (0, Some(0));
        }
        // One error may follow the last value.
        let remaining = self.total - self.collected;
        (0, Some(remaining + 1))
    }
}

impl<R> Drop for GenResults<R> {
    fn drop(&mut self) {
        self.finish_progress();
    }
}
