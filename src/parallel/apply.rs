//! Ordered parallel map.
//!
//! [`parallel_apply`] runs a function over a sequence of items on a scoped
//! [`WorkerPool`] and returns the results in input order. With zero workers, or
//! when the capability probe refuses parallel execution, the same work runs on
//! the calling thread instead and produces the same results.

use super::core::ExecutionStrategy;
use super::pool::WorkerPool;
use super::progress::{IndicatifSink, ProgressExt};
use super::worker::SpawnContext;
use crate::platform::{CapabilityProbe, PLATFORM, PlatformProbe};
use anyhow::Result;
use std::thread;
use std::time::{Duration, Instant};

/// Options for one [`parallel_apply`] call.
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Number of workers (0 = run sequentially on the calling thread).
    pub n_workers: usize,
    /// Contiguous items submitted per task round-trip.
    pub chunk_size: usize,
    /// Minimum delay between releasing two items to the workers.
    pub pause: Duration,
    /// Show a progress bar while results complete.
    pub progress: bool,
    /// Item count for the progress bar when the iterator can't tell.
    pub total: Option<usize>,
    /// Keep workers across tasks instead of replacing them after each one.
    pub reuse_workers: bool,
    /// Thread settings (None = the platform default, chosen at call time).
    pub spawn: Option<SpawnContext>,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            n_workers: PLATFORM.cpu_count,
            chunk_size: 1,
            pause: Duration::ZERO,
            progress: false,
            total: None,
            reuse_workers: true,
            spawn: None,
        }
    }
}

impl ApplyOptions {
    pub fn workers(mut self, n_workers: usize) -> Self {
        self.n_workers = n_workers;
        self
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    pub fn progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn total(mut self, total: usize) -> Self {
        self.total = Some(total);
        self
    }

    pub fn reuse_workers(mut self, reuse_workers: bool) -> Self {
        self.reuse_workers = reuse_workers;
        self
    }

    pub fn spawn(mut self, spawn: SpawnContext) -> Self {
        self.spawn = Some(spawn);
        self
    }
}

/// Apply `f` to every item in parallel and return the results in input order.
///
/// # Example
/// ```rust
/// use parapply::{ApplyOptions, parallel_apply};
///
/// let results = parallel_apply(|x: i32| Ok(x + 1), vec![1, 2, 3, 4, 5], &ApplyOptions::default().workers(2))?;
/// assert_eq!(results, vec![2, 3, 4, 5, 6]);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn parallel_apply<T, R, F, I>(f: F, items: I, options: &ApplyOptions) -> Result<Vec<R>>
where
    I: IntoIterator<Item = T>,
    I::IntoIter: Send + 'static,
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Result<R> + Send + Sync + 'static,
{
    parallel_apply_with_probe(&PlatformProbe, f, items, options)
}

/// [`parallel_apply`] for infallible functions.
pub fn parallel_map<T, R, F, I>(f: F, items: I, options: &ApplyOptions) -> Result<Vec<R>>
where
    I: IntoIterator<Item = T>,
    I::IntoIter: Send + 'static,
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> R + Send + Sync + 'static,
{
    parallel_apply(move |item| Ok(f(item)), items, options)
}

/// [`parallel_apply`] with an explicit capability probe.
pub fn parallel_apply_with_probe<T, R, F, I>(
    probe: &dyn CapabilityProbe,
    f: F,
    items: I,
    options: &ApplyOptions,
) -> Result<Vec<R>>
where
    I: IntoIterator<Item = T>,
    I::IntoIter: Send + 'static,
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Result<R> + Send + Sync + 'static,
{
    let items = items.into_iter();
    let total = options.total.or_else(|| exact_len(&items));

    match ExecutionStrategy::select(probe, "n_workers", options.n_workers, true) {
        ExecutionStrategy::Sequential => collect_results(items.map(f), options.progress, total),
        ExecutionStrategy::Parallel { workers } => {
            let spawn = options.spawn.clone().unwrap_or_else(SpawnContext::platform_default);
            let pool = WorkerPool::new(workers, spawn, options.reuse_workers)?;

            // Every result is pulled before the pool leaves this scope.
            let collected = {
                let results = pool.imap(f, Paced::new(items, options.pause), options.chunk_size)?;
                collect_results(results, options.progress, total)
            };

            match collected {
                Ok(values) => {
                    pool.close()?;
                    Ok(values)
                }
                Err(err) => {
                    if let Err(shutdown_err) = pool.terminate() {
                        tracing::warn!("{shutdown_err:#}");
                    }
                    Err(err)
                }
            }
        }
    }
}

fn collect_results<R>(
    results: impl Iterator<Item = Result<R>>,
    progress: bool,
    total: Option<usize>,
) -> Result<Vec<R>> {
    if progress {
        results.with_progress(IndicatifSink::new(total), total).collect()
    } else {
        results.collect()
    }
}

fn exact_len<I: Iterator>(items: &I) -> Option<usize> {
    match items.size_hint() {
        (lower, Some(upper)) if lower == upper => Some(lower),
        _ => None,
    }
}

/// Releases items no faster than one per `pause`.
///
/// Only the release of items is throttled; workers run at full speed.
pub struct Paced<I> {
    inner: I,
    pause: Duration,
    last_release: Option<Instant>,
}

impl<I> Paced<I> {
    pub fn new(inner: I, pause: Duration) -> Self {
        Self {
            inner,
            pause,
            last_release: None,
        }
    }
}

impl<I: Iterator> Iterator for Paced<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.inner.next()?;
        if let Some(last) = self.last_release {
            let elapsed = last.elapsed();
            if elapsed < self.pause {
                thread::sleep(self.pause - elapsed);
            }
        }
        self.last_release = Some(Instant::now());
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
