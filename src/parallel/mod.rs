//! Parallel execution layer
//!
//! This module applies a function to a sequence of items on several workers
//! and gives the results back in a form the caller can rely on.
//!
//! # Architecture Responsibilities
//!
//! ## What This Module Does:
//! - **Workers**: Named, joinable threads that are always allowed to start nested workers
//! - **Worker Pool**: A fixed set of slots whose workers are kept or replaced after each task
//! - **Ordered Map**: `parallel_apply` with chunking, pacing and progress, in input order
//! - **Batch Dispatch**: `parallel_gen` streams `(global_index, value)` pairs from one worker per batch
//! - **Execution Strategy**: Sequential vs Parallel, decided once per call by a capability probe
//!
//! ## What This Module Does NOT Do:
//! - **Retries**: A failed task fails the whole call
//! - **Persistence**: Nothing outlives one pool or one dispatch
//! - **Distribution**: Every worker runs inside the current process
//!
//! # Layout
//!
//! ```text
//! ┌──────────────────┐    ┌──────────────────┐    ┌─────────────────┐
//! │  parallel_apply  │───▶│   WorkerPool     │───▶│                 │
//! │  (apply)         │    │   (pool)         │    │   Worker        │
//! └──────────────────┘    └──────────────────┘    │   (worker)      │
//! ┌──────────────────┐    ┌──────────────────┐    │                 │
//! │  parallel_gen    │───▶│   WorkerGroup    │───▶│                 │
//! │  (dispatch)      │    │   (worker)       │    └─────────────────┘
//! └──────────────────┘    └──────────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```rust
//! use parapply::parallel::{ApplyOptions, ExecutionStrategy, parallel_map};
//!
//! // Use at most half of the cores
//! let workers = ExecutionStrategy::calculate_optimal_workers(0, 50);
//! let squares = parallel_map(|x: u64| x * x, 0..10u64, &ApplyOptions::default().workers(workers))?;
//! assert_eq!(squares[3], 9);
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod apply;
pub mod core;
pub mod dispatch;
pub mod pool;
pub mod progress;
pub mod worker;

// Re-export main types for easier access
pub use apply::{ApplyOptions, Paced, parallel_apply, parallel_apply_with_probe, parallel_map};
pub use core::ExecutionStrategy;
pub use dispatch::{Batch, BatchWorker, DispatchState, GenResults, parallel_gen, parallel_gen_with, partition};
pub use pool::{OrderedResults, WorkerPool};
pub use progress::{IndicatifSink, NoProgress, Progress, ProgressExt, ProgressSink};
pub use worker::{CancelToken, SpawnContext, Worker, WorkerGroup, WorkerInfo, start_thread, threaded};
