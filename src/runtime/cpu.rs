//! CPU worker pool shared by every host-side functor.

use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::{Error, Result};

/// Which cores the worker threads should prefer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AffinityPolicy {
    /// Let the scheduler decide.
    #[default]
    None,
    /// Performance cores only.
    BigOnly,
    /// Efficiency cores only.
    LittleOnly,
}

/// Thread count and placement of the CPU executor.
///
/// A non-empty `cpu_ids` list fixes the thread count to its length.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadPolicy {
    pub num_threads: Option<usize>,
    pub affinity: AffinityPolicy,
    pub cpu_ids: Vec<usize>,
}

impl ThreadPolicy {
    pub fn with_threads(mut self, n: usize) -> Self {
        self.num_threads = Some(n);
        self
    }

    pub fn with_affinity(mut self, affinity: AffinityPolicy) -> Self {
        self.affinity = affinity;
        self
    }

    pub fn with_cpu_ids(mut self, ids: Vec<usize>) -> Self {
        self.cpu_ids = ids;
        self
    }

    /// Thread count to build the pool with; `0` means rayon's default.
    pub fn resolved_threads(&self) -> usize {
        if !self.cpu_ids.is_empty() {
            self.cpu_ids.len()
        } else {
            self.num_threads.unwrap_or(0)
        }
    }
}

/// A dedicated rayon pool. Functors run their parallel loops inside it.
#[derive(Debug)]
pub struct CpuExecutor {
    pool: ThreadPool,
}

impl CpuExecutor {
    /// Builds a pool following `policy`.
    ///
    /// Affinity and CPU ids are not applied to threads; only the resulting
    /// thread count is honored.
    pub fn new(policy: &ThreadPolicy) -> Result<Self> {
        if policy.affinity != AffinityPolicy::None || !policy.cpu_ids.is_empty() {
            tracing::warn!(
                affinity = ?policy.affinity,
                cpu_ids = ?policy.cpu_ids,
                "thread affinity is not applied; only the thread count is used"
            );
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(policy.resolved_threads())
            .thread_name(|i| format!("ferrokern-cpu-{i}"))
            .build()
            .map_err(|e| Error::ThreadPool(e.to_string()))?;
        tracing::debug!(threads = pool.current_num_threads(), "created cpu executor");
        Ok(Self { pool })
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Runs `op` inside the pool so nested rayon iterators use its threads.
    pub fn install<R: Send>(&self, op: impl FnOnce() -> R + Send) -> R {
        self.pool.install(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_id_list_sets_thread_count() {
        let policy = ThreadPolicy::default().with_threads(8).with_cpu_ids(vec![0, 2, 4]);
        assert_eq!(policy.resolved_threads(), 3);
        let exec = CpuExecutor::new(&policy).unwrap();
        assert_eq!(exec.num_threads(), 3);
    }

    #[test]
    fn explicit_thread_count() {
        let exec = CpuExecutor::new(&ThreadPolicy::default().with_threads(2)).unwrap();
        assert_eq!(exec.install(rayon::current_num_threads), 2);
    }
}
