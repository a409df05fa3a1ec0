//! Platform profile and the parallel-capability probe.
//!
//! The profile is computed once on first access and cached for the program
//! lifetime. The probe decides whether a caller may use workers at all; when it
//! says no, callers fall back to sequential execution on the calling thread.

use crate::config::Settings;
use crate::parallel::worker;
use std::sync::LazyLock;

/// Global platform profile - computed once, cached forever
pub static PLATFORM: LazyLock<PlatformProfile> = LazyLock::new(PlatformProfile::detect);

/// Hardware and runtime facts used to size pools and pick a strategy
#[derive(Debug, Clone)]
pub struct PlatformProfile {
    /// Logical CPU cores (including hyperthreading)
    pub cpu_count: usize,

    /// Physical CPU cores
    pub physical_cpu_count: usize,

    /// Operating system name, as reported by the standard library
    pub os_name: &'static str,

    /// Whether this target can run more than one thread
    pub threads_supported: bool,
}

impl PlatformProfile {
    fn detect() -> Self {
        let profile = Self {
            cpu_count: num_cpus::get().max(1),
            physical_cpu_count: num_cpus::get_physical().max(1),
            os_name: std::env::consts::OS,
            threads_supported: cfg!(not(all(target_family = "wasm", not(target_feature = "atomics")))),
        };
        tracing::debug!(?profile, "platform profile detected");
        profile
    }
}

/// Decides whether parallel execution is usable for one call.
pub trait CapabilityProbe {
    /// `param_name` names the caller's worker-count parameter for advisories.
    /// `owner_is_main` tells whether the work function belongs to the program
    /// entry point rather than a library.
    fn parallel_supported(&self, param_name: &str, n_workers: usize, owner_is_main: bool) -> bool;
}

/// The default probe.
///
/// Parallel execution is refused when the target has no threads, when the
/// installed settings force sequential mode, or when the caller runs on a
/// worker that may not start workers of its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlatformProbe;

impl CapabilityProbe for PlatformProbe {
    fn parallel_supported(&self, param_name: &str, n_workers: usize, _owner_is_main: bool) -> bool {
        if n_workers == 0 {
            return true;
        }

        let reason = if !PLATFORM.threads_supported {
            Some("this target cannot run worker threads")
        } else if Settings::installed().is_some_and(|settings| settings.parallel.sequential) {
            Some("sequential execution is forced by configuration")
        } else if worker::current().is_some_and(|info| !info.child_spawn_capable) {
            Some("the calling worker cannot start workers of its own")
        } else {
            None
        };

        match reason {
            Some(reason) => {
                tracing::debug!(param = param_name, n_workers, reason, "parallel execution refused");
                false
            }
            None => true,
        }
    }
}

/// Probe with a fixed answer, for callers that already know.
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe(pub bool);

impl CapabilityProbe for FixedProbe {
    fn parallel_supported(&self, _param_name: &str, _n_workers: usize, _owner_is_main: bool) -> bool {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::{ApplyOptions, SpawnContext, Worker, parallel_apply};

    #[test]
    fn test_profile_has_cores() {
        assert!(PLATFORM.cpu_count >= 1);
        assert!(PLATFORM.physical_cpu_count >= 1);
        assert!(!PLATFORM.os_name.is_empty());
    }

    #[test]
    fn test_platform_probe_allows_threads() {
        assert!(PLATFORM.threads_supported);
        assert!(PlatformProbe.parallel_supported("n_workers", 4, true));
        assert!(PlatformProbe.parallel_supported("n_workers", 0, false));
    }

    #[test]
    fn test_leaf_worker_is_refused() {
        let leaf = SpawnContext::new("leaf").with_child_spawn(false);
        let worker = Worker::spawn(&leaf, 0, 0, || {
            let refused = !PlatformProbe.parallel_supported("n_workers", 2, false);
            let here = std::thread::current().id();
            let options = ApplyOptions::default().workers(2);
            let ids = parallel_apply(|_: u8| Ok(std::thread::current().id()), 0..3u8, &options).unwrap();
            (refused, ids.iter().all(|id| *id == here))
        })
        .unwrap();
        assert_eq!(worker.join().unwrap(), (true, true));

        let nested = Worker::spawn(&SpawnContext::new("branch"), 0, 0, || {
            PlatformProbe.parallel_supported("n_workers", 2, false)
        })
        .unwrap();
        assert!(nested.join().unwrap());
    }

    #[test]
    fn test_fixed_probe() {
        assert!(FixedProbe(true).parallel_supported("n_workers", 2, true));
        assert!(!FixedProbe(false).parallel_supported("n_workers", 2, true));
    }
}
