//! # parapply - ordered parallel map and batch dispatch
//!
//! Apply a function to a sequence of items on several worker threads, keep the
//! results in input order, and fall back to plain sequential execution when
//! parallel execution isn't available.
//!
//! ## Features
//!
//! - **Ordered results**: `parallel_apply` returns results in input order, whatever order workers finish in
//! - **Worker recycling**: Pools can replace each worker after every task
//! - **Nested parallelism**: Code running on a worker can start its own pool
//! - **Batch dispatch**: `parallel_gen` streams `(global_index, value)` pairs from one worker per batch
//! - **Pacing and progress**: Throttle item release and show an indicatif progress bar
//!
//! ## Quick Start
//!
//! ```rust
//! use parapply::{ApplyOptions, parallel_apply};
//!
//! let doubled = parallel_apply(|x: u32| Ok(x * 2), vec![1, 2, 3], &ApplyOptions::default().workers(2))?;
//! assert_eq!(doubled, vec![2, 4, 6]);
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod config;
pub mod logging;
pub mod parallel;
pub mod platform;

pub use config::Settings;
pub use parallel::{
    ApplyOptions, BatchWorker, ExecutionStrategy, GenResults, SpawnContext, WorkerPool, parallel_apply,
    parallel_apply_with_probe, parallel_gen, parallel_map,
};
pub use platform::{CapabilityProbe, PlatformProbe};

/// Result type alias for parapply operations
pub type Result<T> = anyhow::Result<T>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
