//! Layered configuration for parapply.
//!
//! Settings are merged with figment from embedded defaults, the user config,
//! `parapply.toml` in the working directory, an optional custom file and
//! `PARAPPLY_` environment variables.

pub mod core;

// Re-export main types for easier access
pub use core::{ParallelSettings, Settings, SpawnSettings};
