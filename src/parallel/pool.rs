//! Fixed-size pool of non-daemonic workers.
//!
//! Each slot of the pool hosts one live worker at a time. With worker reuse a
//! slot starts a single worker that runs tasks until the queue is closed.
//! Without reuse the slot retires its worker after one task and starts a fresh
//! one, which keeps leaking or state-corrupting tasks from affecting the next.
//!
//! ```text
//!   feeder ──chunks──▶ task queue ──▶ slot 0 ─▶ worker 0.0, 0.1, ...
//!                                 ──▶ slot 1 ─▶ worker 1.0, 1.1, ...
//!                                         │
//!   OrderedResults ◀──(chunk index, values)┘
//! ```

use super::worker::{CancelToken, SpawnContext, Worker, panic_message};
use crate::platform::PLATFORM;
use anyhow::{Context, Result, anyhow, bail, ensure};
use crossbeam::channel::{Receiver, Sender, unbounded};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// A queued chunk. Called with `None` to run it, or with the reason its slot
/// cannot run it.
type Job = Box<dyn FnOnce(Option<&str>) + Send + 'static>;

/// Why a worker stopped.
enum WorkerExit {
    /// Ran its task budget; the slot starts a replacement.
    Retired,
    /// The queue is closed or the pool was terminated.
    Drained,
}

/// Message from a chunk job or the feeder to the ordered consumer.
enum ChunkOutcome<R> {
    Done { index: usize, outcome: Result<Vec<R>> },
    Exhausted { chunks: usize },
}

/// A fixed number of worker slots sharing one task queue.
///
/// Dropping the pool terminates it: queued work is skipped and every worker is
/// joined before the drop returns.
pub struct WorkerPool {
    size: usize,
    reuse_workers: bool,
    spawn: SpawnContext,
    task_tx: Option<Sender<Job>>,
    terminated: CancelToken,
    slots: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start a pool of `worker_count` slots.
    ///
    /// With `reuse_workers` each worker runs any number of tasks; without it
    /// each worker runs exactly one task and is then replaced.
    pub fn new(worker_count: usize, spawn: SpawnContext, reuse_workers: bool) -> Result<Self> {
        ensure!(worker_count > 0, "a worker pool needs at least one worker");

        let (task_tx, task_rx) = unbounded::<Job>();
        let mut pool = Self {
            size: worker_count,
            reuse_workers,
            spawn,
            task_tx: Some(task_tx),
            terminated: CancelToken::new(),
            slots: Vec::with_capacity(worker_count),
        };

        let max_tasks = if reuse_workers { None } else { Some(1) };
        for slot in 0..worker_count {
            let supervisor = Supervisor {
                slot,
                spawn: pool.spawn.clone(),
                task_rx: task_rx.clone(),
                terminated: pool.terminated.clone(),
                max_tasks,
            };
            // On failure `pool` drops here, which joins the slots already running.
            let handle = thread::Builder::new()
                .name(format!("{}-slot-{}", pool.spawn.name_prefix, slot))
                .spawn(move || supervisor.run())
                .with_context(|| format!("failed to start worker slot {slot}"))?;
            pool.slots.push(handle);
        }

        tracing::debug!(workers = worker_count, reuse_workers, "worker pool started");
        Ok(pool)
    }

    /// A reusing pool with one worker per CPU core.
    pub fn with_defaults() -> Result<Self> {
        Self::new(PLATFORM.cpu_count, SpawnContext::platform_default(), true)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn reuses_workers(&self) -> bool {
        self.reuse_workers
    }

    /// Apply `f` to every item and return the results in input order.
    ///
    /// Items are submitted in groups of `chunk_size` (0 is treated as 1). The
    /// first failing task fails the whole call and the remaining queued chunks
    /// are skipped.
    pub fn map<T, R, F, I>(&self, f: F, items: I, chunk_size: usize) -> Result<Vec<R>>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Result<R> + Send + Sync + 'static,
    {
        self.imap(f, items, chunk_size)?.collect()
    }

    /// Lazy form of [`map`](Self::map).
    ///
    /// A feeder thread pulls items and submits chunks while the returned
    /// iterator yields results in input order as soon as they are available.
    pub fn imap<T, R, F, I>(&self, f: F, items: I, chunk_size: usize) -> Result<OrderedResults<'_, R>>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Result<R> + Send + Sync + 'static,
    {
        let task_tx = self
            .task_tx
            .clone()
            .ok_or_else(|| anyhow!("worker pool is already closed"))?;
        let chunk_size = chunk_size.max(1);
        let f = Arc::new(f);
        let abort = CancelToken::new();
        let (result_tx, result_rx) = unbounded();

        let feeder = {
            let abort = abort.clone();
            let mut items = items.into_iter();
            thread::Builder::new()
                .name(format!("{}-feeder", self.spawn.name_prefix))
                .spawn(move || {
                    let mut chunks = 0;
                    while !abort.is_cancelled() {
                        let chunk: Vec<T> = items.by_ref().take(chunk_size).collect();
                        if chunk.is_empty() {
                            break;
                        }
                        let job = chunk_job(
                            chunks,
                            chunks * chunk_size,
                            chunk,
                            Arc::clone(&f),
                            result_tx.clone(),
                            abort.clone(),
                        );
                        if task_tx.send(job).is_err() {
                            break;
                        }
                        tracing::trace!(chunk = chunks, "chunk submitted");
                        chunks += 1;
                    }
                    let _ = result_tx.send(ChunkOutcome::Exhausted { chunks });
                })
                .context("failed to start the feeder thread")?
        };

        Ok(OrderedResults {
            results: result_rx,
            pending: HashMap::new(),
            current: Vec::new().into_iter(),
            next_chunk: 0,
            total_chunks: None,
            abort,
            feeder: Some(feeder),
            failed: false,
            _pool: PhantomData,
        })
    }

    /// Stop accepting work, let queued work finish, and join every worker.
    pub fn close(mut self) -> Result<()> {
        self.shutdown(false)
    }

    /// Skip queued work and join every worker.
    pub fn terminate(mut self) -> Result<()> {
        self.shutdown(true)
    }

    fn shutdown(&mut self, skip_pending: bool) -> Result<()> {
        if skip_pending {
            self.terminated.cancel();
        }
        drop(self.task_tx.take());

        let mut lost = 0;
        for slot in self.slots.drain(..) {
            if slot.join().is_err() {
                lost += 1;
            }
        }
        tracing::debug!(workers = self.size, skip_pending, "worker pool shut down");

        if lost > 0 {
            bail!("{lost} worker slot(s) panicked during shutdown");
        }
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if (self.task_tx.is_some() || !self.slots.is_empty())
            && let Err(err) = self.shutdown(true)
        {
            tracing::warn!("{err:#}");
        }
    }
}

/// Keeps one worker alive in a slot, replacing it whenever it retires.
struct Supervisor {
    slot: usize,
    spawn: SpawnContext,
    task_rx: Receiver<Job>,
    terminated: CancelToken,
    max_tasks: Option<usize>,
}

impl Supervisor {
    fn run(self) {
        let mut serial = 0;
        while !self.terminated.is_cancelled() {
            let task_rx = self.task_rx.clone();
            let terminated = self.terminated.clone();
            let max_tasks = self.max_tasks;
            let worker = match Worker::spawn(&self.spawn, self.slot, serial, move || {
                run_tasks(&task_rx, &terminated, max_tasks)
            }) {
                Ok(worker) => worker,
                Err(err) => {
                    let reason = format!("worker slot {} is lost: {err:#}", self.slot);
                    tracing::error!(slot = self.slot, "{reason}");
                    self.reject_remaining(&reason);
                    return;
                }
            };

            match worker.join() {
                Ok(WorkerExit::Drained) => return,
                Ok(WorkerExit::Retired) => serial += 1,
                Err(err) => {
                    tracing::error!(slot = self.slot, "worker died outside a task: {err:#}");
                    serial += 1;
                }
            }
        }
    }

    /// Fail every job this slot still receives, so no caller waits on it.
    fn reject_remaining(&self, reason: &str) {
        while !self.terminated.is_cancelled() {
            let Ok(job) = self.task_rx.recv() else {
                return;
            };
            job(Some(reason));
        }
    }
}

fn run_tasks(task_rx: &Receiver<Job>, terminated: &CancelToken, max_tasks: Option<usize>) -> WorkerExit {
    let mut completed = 0;
    while max_tasks.is_none_or(|max| completed < max) {
        if terminated.is_cancelled() {
            return WorkerExit::Drained;
        }
        let Ok(job) = task_rx.recv() else {
            return WorkerExit::Drained;
        };
        if !terminated.is_cancelled() {
            job(None);
        }
        completed += 1;
    }
    WorkerExit::Retired
}

/// Build the job that runs one chunk and reports its values.
fn chunk_job<T, R, F>(
    index: usize,
    first_item: usize,
    chunk: Vec<T>,
    f: Arc<F>,
    results: Sender<ChunkOutcome<R>>,
    abort: CancelToken,
) -> Job
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Result<R> + Send + Sync + 'static,
{
    Box::new(move |rejected: Option<&str>| {
        if abort.is_cancelled() {
            return;
        }
        let len = chunk.len();
        let outcome = match rejected {
            Some(reason) => Err(anyhow!("{reason}")),
            None => panic::catch_unwind(AssertUnwindSafe(|| {
                chunk.into_iter().map(|item| f(item)).collect::<Result<Vec<R>>>()
            }))
            .unwrap_or_else(|payload| Err(anyhow!("task panicked: {}", panic_message(payload.as_ref())))),
        }
        .with_context(|| format!("task failed on items {}..{}", first_item, first_item + len));

        let _ = results.send(ChunkOutcome::Done { index, outcome });
    })
}

/// Results of [`WorkerPool::imap`], in input order.
///
/// The first failure is yielded once and ends the iteration. Dropping the
/// iterator early skips the chunks that have not started yet.
pub struct OrderedResults<'pool, R> {
    results: Receiver<ChunkOutcome<R>>,
    pending: HashMap<usize, Vec<R>>,
    current: std::vec::IntoIter<R>,
    next_chunk: usize,
    total_chunks: Option<usize>,
    abort: CancelToken,
    feeder: Option<JoinHandle<()>>,
    failed: bool,
    _pool: PhantomData<&'pool WorkerPool>,
}

impl<R> OrderedResults<'_, R> {
    fn fail(&mut self, err: anyhow::Error) -> anyhow::Error {
        self.failed = true;
        self.abort.cancel();
        err
    }
}

impl<R> Iterator for OrderedResults<'_, R> {
    type Item = Result<R>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(value) = self.current.next() {
                return Some(Ok(value));
            }
            if self.failed || self.total_chunks == Some(self.next_chunk) {
                return None;
            }
            if let Some(values) = self.pending.remove(&self.next_chunk) {
                self.next_chunk += 1;
                self.current = values.into_iter();
                continue;
            }

            match self.results.recv() {
                Ok(ChunkOutcome::Done {
                    index,
                    outcome: Ok(values),
                }) => {
                    self.pending.insert(index, values);
                }
                Ok(ChunkOutcome::Done { outcome: Err(err), .. }) => {
                    return Some(Err(self.fail(err)));
                }
                Ok(ChunkOutcome::Exhausted { chunks }) => {
                    self.total_chunks = Some(chunks);
                }
                Err(_) => {
                    let err = anyhow!(
                        "worker pool stopped after {} chunk(s) before all results arrived",
                        self.next_chunk
                    );
                    return Some(Err(self.fail(err)));
                }
            }
        }
    }
}

impl<R> Drop for OrderedResults<'_, R> {
    fn drop(&mut self) {
        self.abort.cancel();
        if let Some(feeder) = self.feeder.take()
            && feeder.join().is_err()
        {
            tracing::warn!("feeder thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::worker;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn pool(workers: usize, reuse: bool) -> WorkerPool {
        WorkerPool::new(workers, SpawnContext::new("pool-test"), reuse).unwrap()
    }

    fn jittered_double(x: u64) -> Result<u64> {
        thread::sleep(Duration::from_millis((x * 7) % 5));
        Ok(x * 2)
    }

    #[test]
    fn test_map_preserves_order() {
        let pool = pool(4, true);
        let results = pool.map(jittered_double, 0..40u64, 1).unwrap();
        assert_eq!(results, (0..40).map(|x| x * 2).collect::<Vec<_>>());
    }

    #[test]
    fn test_map_with_chunks() {
        let pool = pool(3, true);
        for chunk_size in [0, 1, 3, 7, 100] {
            let results = pool.map(jittered_double, 0..25u64, chunk_size).unwrap();
            assert_eq!(results, (0..25).map(|x| x * 2).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_map_empty() {
        let pool = pool(2, true);
        let results = pool.map(jittered_double, Vec::<u64>::new(), 4).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(WorkerPool::new(0, SpawnContext::new("none"), true).is_err());
    }

    #[test]
    fn test_recycled_workers_are_fresh_per_task() {
        let pool = pool(2, false);
        let ids = pool
            .map(|_| Ok(thread::current().id()), 0..12, 1)
            .unwrap();
        let distinct: HashSet<_> = ids.into_iter().collect();
        assert_eq!(distinct.len(), 12);
    }

    #[test]
    fn test_reused_workers_are_shared() {
        let pool = pool(2, true);
        let ids = pool
            .map(|_| Ok(thread::current().id()), 0..12, 1)
            .unwrap();
        let distinct: HashSet<_> = ids.into_iter().collect();
        assert!(distinct.len() <= 2);
    }

    #[test]
    fn test_tasks_run_on_workers() {
        let pool = pool(2, true);
        let infos = pool.map(|_| Ok(worker::current()), 0..4, 1).unwrap();
        assert!(infos.iter().all(|info| info.is_some_and(|info| info.child_spawn_capable)));
    }

    #[test]
    fn test_failure_is_reported_once() {
        let pool = pool(2, true);
        let mut results = pool
            .imap(
                |x: i32| {
                    if x == 3 {
                        Err(anyhow!("bad item {x}"))
                    } else {
                        Ok(x)
                    }
                },
                1..=5,
                1,
            )
            .unwrap();

        let mut errors = 0;
        for result in results.by_ref() {
            if result.is_err() {
                errors += 1;
            }
        }
        assert_eq!(errors, 1);
        assert!(results.next().is_none());
    }

    #[test]
    fn test_failure_context() {
        let pool = pool(2, true);
        let err = pool
            .map(
                |x: i32| if x == 3 { Err(anyhow!("bad item {x}")) } else { Ok(x) },
                1..=5,
                2,
            )
            .unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("bad item 3"), "{message}");
        assert!(message.contains("items 2..4"), "{message}");
    }

    #[test]
    fn test_panic_becomes_failure() {
        let pool = pool(2, true);
        let err = pool
            .map(
                |x: i32| -> Result<i32> {
                    if x == 2 {
                        panic!("task blew up");
                    }
                    Ok(x)
                },
                0..4,
                1,
            )
            .unwrap_err();
        assert!(format!("{err:#}").contains("task blew up"));

        // The pool survives a panicking task.
        assert_eq!(pool.map(|x: i32| Ok(x + 1), 0..3, 1).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_dropping_results_skips_queued_work() {
        let executed = Arc::new(AtomicUsize::new(0));
        let pool = pool(1, true);
        {
            let executed = executed.clone();
            let mut results = pool
                .imap(
                    move |x: usize| {
                        executed.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(5));
                        Ok(x)
                    },
                    0..200,
                    1,
                )
                .unwrap();
            assert_eq!(results.next().unwrap().unwrap(), 0);
        }
        pool.terminate().unwrap();
        assert!(executed.load(Ordering::SeqCst) < 200);
    }

    #[test]
    fn test_close_finishes_queued_work() {
        let executed = Arc::new(AtomicUsize::new(0));
        let pool = pool(2, true);
        let job_count = executed.clone();
        for _ in 0..10 {
            let job_count = job_count.clone();
            let job: Job = Box::new(move |_: Option<&str>| {
                job_count.fetch_add(1, Ordering::SeqCst);
            });
            pool.task_tx.as_ref().unwrap().send(job).unwrap();
        }
        pool.close().unwrap();
        assert_eq!(executed.load(Ordering::SeqCst), 10);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_lost_slots_fail_the_call() {
        // No address space can hold a stack this large, so every worker spawn fails
        let spawn = SpawnContext::new("doomed").with_stack_size(1 << 60);
        for reuse in [true, false] {
            let pool = WorkerPool::new(2, spawn.clone(), reuse).unwrap();
            let err = pool.map(|x: u32| Ok(x), 0..8, 1).unwrap_err();
            let message = format!("{err:#}");
            assert!(message.contains("failed to spawn worker doomed-"), "{message}");
            pool.terminate().unwrap();
        }
    }

    #[test]
    fn test_nested_pool_inside_worker() {
        let pool = pool(2, true);
        let sums = pool
            .map(
                |x: u64| {
                    let inner = WorkerPool::new(2, SpawnContext::new("inner"), true)?;
                    let values = inner.map(move |y: u64| Ok(x * 10 + y), 0..3, 1)?;
                    Ok(values.into_iter().sum::<u64>())
                },
                0..3u64,
                1,
            )
            .unwrap();
        assert_eq!(sums, vec![3, 33, 63]);
    }
}
