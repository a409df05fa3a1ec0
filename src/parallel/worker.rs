//! Non-daemonic worker threads.
//!
//! Workers are child-spawn-capable by default: code running inside a worker
//! may build its own pool or run its own dispatch. A [`SpawnContext`] can opt
//! out, which makes nested calls on those workers run sequentially. The daemon
//! flag of a [`Worker`] always reads `false` and there is no way to set it.
//!
//! Workers are joined when their handle is dropped, so a worker can never
//! outlive the value that owns it. The only exception is [`start_thread`],
//! which detaches on purpose.

use anyhow::{Context, Result, anyhow};
use std::any::Any;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

const DEFAULT_NAME_PREFIX: &str = "parapply-worker";

/// Process-wide default, installed at most once at startup.
static DEFAULT_SPAWN_CONTEXT: OnceLock<SpawnContext> = OnceLock::new();

/// Serial numbers for helper threads started through [`threaded`].
static HELPER_SERIAL: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static CURRENT: Cell<Option<WorkerInfo>> = const { Cell::new(None) };
}

/// Thread-creation settings passed through to every worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnContext {
    /// Prefix of every worker thread name.
    pub name_prefix: String,
    /// Stack size in bytes (None = the platform default).
    pub stack_size: Option<usize>,
    /// Whether code on these workers may start workers of its own.
    pub child_spawn: bool,
}

impl Default for SpawnContext {
    fn default() -> Self {
        Self::platform_default()
    }
}

impl SpawnContext {
    pub fn new(name_prefix: impl Into<String>) -> Self {
        Self {
            name_prefix: name_prefix.into(),
            stack_size: None,
            child_spawn: true,
        }
    }

    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    pub fn with_child_spawn(mut self, child_spawn: bool) -> Self {
        self.child_spawn = child_spawn;
        self
    }

    /// The installed process-wide context, or the built-in one.
    pub fn platform_default() -> Self {
        DEFAULT_SPAWN_CONTEXT
            .get()
            .cloned()
            .unwrap_or_else(|| Self::new(DEFAULT_NAME_PREFIX))
    }

    /// Install the process-wide default context.
    ///
    /// This is a one-time startup decision; a second call fails and leaves the
    /// first context in place.
    pub fn install_default(context: SpawnContext) -> Result<()> {
        DEFAULT_SPAWN_CONTEXT.set(context).map_err(|rejected| {
            anyhow!(
                "a default spawn context is already installed (rejected '{}')",
                rejected.name_prefix
            )
        })
    }

    pub(crate) fn builder(&self, name: String) -> thread::Builder {
        let builder = thread::Builder::new().name(name);
        match self.stack_size {
            Some(bytes) => builder.stack_size(bytes),
            None => builder,
        }
    }

    fn worker_name(&self, slot: usize, serial: usize) -> String {
        format!("{}-{}.{}", self.name_prefix, slot, serial)
    }
}

/// Identity of the worker the current code runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerInfo {
    /// Pool slot (or batch number) the worker belongs to.
    pub slot: usize,
    /// How many workers this slot started before this one.
    pub serial: usize,
    /// Whether code on this worker may start workers of its own.
    pub child_spawn_capable: bool,
}

/// The worker the calling thread belongs to, if any.
pub fn current() -> Option<WorkerInfo> {
    CURRENT.with(Cell::get)
}

/// Shared flag that only ever moves from "running" to "cancelled".
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Handle to one worker thread.
pub struct Worker<T> {
    info: WorkerInfo,
    name: String,
    handle: Option<JoinHandle<T>>,
}

impl<T: Send + 'static> Worker<T> {
    /// Start `f` on a new worker thread.
    pub fn spawn<F>(context: &SpawnContext, slot: usize, serial: usize, f: F) -> Result<Self>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let info = WorkerInfo {
            slot,
            serial,
            child_spawn_capable: context.child_spawn,
        };
        let name = context.worker_name(slot, serial);
        let handle = context
            .builder(name.clone())
            .spawn(move || {
                CURRENT.with(|current| current.set(Some(info)));
                f()
            })
            .with_context(|| format!("failed to spawn worker {name}"))?;

        tracing::trace!(worker = %name, "worker started");
        Ok(Self {
            info,
            name,
            handle: Some(handle),
        })
    }
}

impl<T> Worker<T> {
    /// Always `false`: workers are never daemons.
    pub fn is_daemon(&self) -> bool {
        false
    }

    pub fn info(&self) -> WorkerInfo {
        self.info
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Wait for the worker and return its output. A panic becomes an error.
    pub fn join(mut self) -> Result<T> {
        let handle = self
            .handle
            .take()
            .ok_or_else(|| anyhow!("worker {} was already joined", self.name))?;
        handle
            .join()
            .map_err(|payload| anyhow!("worker {} panicked: {}", self.name, panic_message(payload.as_ref())))
    }

    fn detach(mut self) {
        self.handle.take();
    }
}

impl<T> Drop for Worker<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::warn!(worker = %self.name, "worker panicked before teardown");
        }
    }
}

/// A set of workers started together, one per argument.
///
/// All workers are started before anything is awaited. Dropping the group
/// cancels its token and joins every worker that is still running.
pub struct WorkerGroup<T> {
    workers: Vec<Worker<T>>,
    cancel: CancelToken,
}

impl<T: Send + 'static> WorkerGroup<T> {
    /// Start one worker per element of `args`, each running `f(arg, cancel)`.
    ///
    /// If a spawn fails, the workers already started are cancelled and joined
    /// before the error is returned.
    pub fn start<A, F>(context: &SpawnContext, args: Vec<A>, f: F) -> Result<Self>
    where
        A: Send + 'static,
        F: Fn(A, &CancelToken) -> T + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let mut group = Self {
            workers: Vec::with_capacity(args.len()),
            cancel: CancelToken::new(),
        };

        for (slot, arg) in args.into_iter().enumerate() {
            let f = Arc::clone(&f);
            let cancel = group.cancel.clone();
            let worker = Worker::spawn(context, slot, 0, move || f(arg, &cancel))?;
            group.workers.push(worker);
        }

        tracing::debug!(workers = group.workers.len(), "worker group started");
        Ok(group)
    }
}

impl<T> WorkerGroup<T> {
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Ask every worker to stop at its next cancellation check.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Join every worker, then report the first failure if there was one.
    pub fn join_all(mut self) -> Result<Vec<T>> {
        let workers = std::mem::take(&mut self.workers);
        let mut outputs = Vec::with_capacity(workers.len());
        let mut first_error = None;

        for worker in workers {
            match worker.join() {
                Ok(output) => outputs.push(output),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(outputs),
        }
    }
}

impl<T> Drop for WorkerGroup<T> {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.cancel.cancel();
            self.workers.clear();
        }
    }
}

/// Run `f` on a new worker thread and return its handle.
pub fn threaded<T, F>(f: F) -> Result<Worker<T>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let serial = HELPER_SERIAL.fetch_add(1, Ordering::Relaxed);
    Worker::spawn(&SpawnContext::platform_default(), 0, serial, f)
}

/// Like [`threaded`], but detach the thread immediately.
pub fn start_thread<F>(f: F) -> Result<()>
where
    F: FnOnce() + Send + 'static,
{
    threaded(f)?.detach();
    Ok(())
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_worker_is_never_daemon() {
        let worker = Worker::spawn(&SpawnContext::new("test"), 3, 1, || 7).unwrap();
        assert!(!worker.is_daemon());
        assert_eq!(worker.info().slot, 3);
        assert_eq!(worker.name(), "test-3.1");
        assert_eq!(worker.join().unwrap(), 7);
    }

    #[test]
    fn test_worker_sees_its_own_info() {
        assert!(current().is_none());

        let worker = Worker::spawn(&SpawnContext::new("info"), 2, 5, current).unwrap();
        let info = worker.join().unwrap().expect("worker info should be set");
        assert_eq!(info.slot, 2);
        assert_eq!(info.serial, 5);
        assert!(info.child_spawn_capable);
    }

    #[test]
    fn test_child_spawn_opt_out_is_recorded() {
        let context = SpawnContext::new("leaf").with_child_spawn(false);
        let worker = Worker::spawn(&context, 0, 0, current).unwrap();
        assert!(!worker.is_daemon());
        let info = worker.join().unwrap().expect("worker info should be set");
        assert!(!info.child_spawn_capable);
    }

    #[test]
    fn test_worker_can_spawn_children() {
        let worker = Worker::spawn(&SpawnContext::new("parent"), 0, 0, || {
            let child = Worker::spawn(&SpawnContext::new("child"), 0, 0, || 21).unwrap();
            child.join().unwrap() * 2
        })
        .unwrap();
        assert_eq!(worker.join().unwrap(), 42);
    }

    #[test]
    fn test_panic_becomes_error() {
        let worker = Worker::spawn(&SpawnContext::new("boom"), 0, 0, || -> usize {
            panic!("worker exploded")
        })
        .unwrap();
        let err = worker.join().unwrap_err();
        assert!(err.to_string().contains("worker exploded"));
    }

    #[test]
    fn test_drop_joins_worker() {
        let done = Arc::new(AtomicBool::new(false));
        {
            let done = done.clone();
            let _worker = Worker::spawn(&SpawnContext::new("drop"), 0, 0, move || {
                thread::sleep(std::time::Duration::from_millis(20));
                done.store(true, Ordering::SeqCst);
            })
            .unwrap();
        }
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn test_group_starts_one_worker_per_arg() {
        let group = WorkerGroup::start(&SpawnContext::new("group"), vec![1, 2, 3], |x, _| x * 10).unwrap();
        assert_eq!(group.len(), 3);
        assert_eq!(group.join_all().unwrap(), vec![10, 20, 30]);
    }

    #[test]
    fn test_group_drop_cancels_and_joins() {
        let iterations = Arc::new(AtomicUsize::new(0));
        let counter = iterations.clone();
        let (started_tx, started_rx) = unbounded();

        let group = WorkerGroup::start(&SpawnContext::new("cancel"), vec![()], move |_, cancel| {
            started_tx.send(()).unwrap();
            while !cancel.is_cancelled() {
                counter.fetch_add(1, Ordering::Relaxed);
                thread::yield_now();
            }
        })
        .unwrap();

        started_rx.recv().unwrap();
        drop(group);
        let seen = iterations.load(Ordering::Relaxed);
        thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(iterations.load(Ordering::Relaxed), seen);
    }

    #[test]
    fn test_threaded_helpers() {
        let handle = threaded(|| "done").unwrap();
        assert_eq!(handle.join().unwrap(), "done");

        let (tx, rx) = unbounded();
        start_thread(move || tx.send(5).unwrap()).unwrap();
        assert_eq!(rx.recv().unwrap(), 5);
    }
}
