use crate::platform::{CapabilityProbe, PLATFORM};

/// Execution strategy enum for choosing between parallel and sequential
///
/// The strategy is selected once when a call starts and does not change while
/// the call runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStrategy {
    Sequential,
    Parallel { workers: usize },
}

impl ExecutionStrategy {
    /// Select the strategy for one call.
    ///
    /// # Decision Logic
    /// ```text
    /// n_workers == 0                    → Sequential
    /// probe refuses parallel execution  → Sequential (with a one-line warning)
    /// otherwise                         → Parallel { workers: n_workers }
    /// ```
    ///
    /// # Example
    /// ```rust
    /// use parapply::parallel::ExecutionStrategy;
    /// use parapply::platform::FixedProbe;
    ///
    /// let strategy = ExecutionStrategy::select(&FixedProbe(true), "n_workers", 4, true);
    /// assert_eq!(strategy, ExecutionStrategy::Parallel { workers: 4 });
    ///
    /// let strategy = ExecutionStrategy::select(&FixedProbe(false), "n_workers", 4, true);
    /// assert_eq!(strategy, ExecutionStrategy::Sequential);
    /// ```
    pub fn select(
        probe: &dyn CapabilityProbe,
        param_name: &str,
        n_workers: usize,
        owner_is_main: bool,
    ) -> Self {
        if n_workers == 0 {
            return ExecutionStrategy::Sequential;
        }

        if !probe.parallel_supported(param_name, n_workers, owner_is_main) {
            tracing::warn!(
                "Parallel execution isn't available here, so `{param_name}` has been set to 0 to avoid getting stuck"
            );
            return ExecutionStrategy::Sequential;
        }

        ExecutionStrategy::Parallel { workers: n_workers }
    }

    /// Number of workers this strategy runs (0 for sequential).
    pub fn workers(&self) -> usize {
        match self {
            ExecutionStrategy::Sequential => 0,
            ExecutionStrategy::Parallel { workers } => *workers,
        }
    }

    pub fn is_parallel(&self) -> bool {
        matches!(self, ExecutionStrategy::Parallel { .. })
    }

    /// Calculate optimal workers based on available system resources and configuration limits
    ///
    /// # Algorithm
    /// ```text
    /// 1. Detect available CPU cores: num_cpus::get()
    /// 2. Apply percentage: cores * thread_percentage / 100
    /// 3. Apply config limit: min(max_threads_config, percentage_result) if max_threads_config > 0
    /// 4. Ensure minimum: max(1, final_result)
    /// ```
    ///
    /// # Examples
    /// ```rust
    /// use parapply::parallel::ExecutionStrategy;
    ///
    /// let workers = ExecutionStrategy::calculate_optimal_workers(0, 75);
    /// assert!(workers >= 1); // Always at least 1 worker
    ///
    /// let workers = ExecutionStrategy::calculate_optimal_workers(8, 75);
    /// assert!(workers <= 8); // Respects max limit
    /// ```
    pub fn calculate_optimal_workers(max_threads_config: usize, thread_percentage: u8) -> usize {
        Self::workers_for_cores(PLATFORM.cpu_count, max_threads_config, thread_percentage)
    }

    fn workers_for_cores(cores: usize, max_threads_config: usize, thread_percentage: u8) -> usize {
        // Calculate workers based on percentage of available cores
        let workers_by_percentage = std::cmp::max(1, (cores * thread_percentage as usize) / 100);

        // Apply config limit if specified (0 means use percentage calculation only)
        if max_threads_config > 0 {
            std::cmp::min(max_threads_config, workers_by_percentage)
        } else {
            workers_by_percentage
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::FixedProbe;

    #[test]
    fn test_zero_workers_is_sequential() {
        let strategy = ExecutionStrategy::select(&FixedProbe(true), "n_workers", 0, true);
        assert_eq!(strategy, ExecutionStrategy::Sequential);
        assert_eq!(strategy.workers(), 0);
        assert!(!strategy.is_parallel());
    }

    #[test]
    fn test_probe_refusal_forces_sequential() {
        let strategy = ExecutionStrategy::select(&FixedProbe(false), "n_workers", 8, true);
        assert_eq!(strategy, ExecutionStrategy::Sequential);
    }

    #[test]
    fn test_parallel_keeps_worker_count() {
        let strategy = ExecutionStrategy::select(&FixedProbe(true), "n_workers", 3, false);
        assert_eq!(strategy, ExecutionStrategy::Parallel { workers: 3 });
        assert_eq!(strategy.workers(), 3);
    }

    #[test]
    fn test_workers_for_cores() {
        assert_eq!(ExecutionStrategy::workers_for_cores(8, 0, 75), 6);
        assert_eq!(ExecutionStrategy::workers_for_cores(8, 4, 75), 4);
        assert_eq!(ExecutionStrategy::workers_for_cores(8, 0, 100), 8);
        assert_eq!(ExecutionStrategy::workers_for_cores(1, 0, 10), 1);
    }
}
