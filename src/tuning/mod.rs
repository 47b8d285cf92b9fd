//! # Launch-Parameter Autotuning
//!
//! The [`Tuner`] owns every [`TuningRecord`] known to a runtime. Functors hand
//! it a kernel, a signature (kernel name plus output dimensions), the global
//! size and a default local size; [`Tuner::run_or_tune`] then does one of:
//!
//! 1. a record exists for the signature, in memory or in the key-value store:
//!    launch with the recorded local size
//! 2. tuning is enabled: time every candidate, keep the cheapest, record and
//!    persist it, then launch with it
//! 3. otherwise: launch with the default, persisting nothing
//!
//! Candidates come from [`local_size_candidates`] in a fixed order, and ties
//! go to the earlier candidate, so a given cost model always picks the same
//! winner.

mod record;

pub use record::TuningRecord;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::Result;
use crate::future::StatsFuture;
use crate::runtime::KernelHandle;
use crate::storage::KvStorage;

/// Tuner settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunerConfig {
    /// Search for a local size when a signature has no record.
    pub enabled: bool,
    /// Launches per candidate; their costs are averaged.
    pub runs_per_candidate: u32,
    /// Upper bound on the candidate list.
    pub max_candidates: usize,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            runs_per_candidate: 1,
            max_candidates: 16,
        }
    }
}

impl TunerConfig {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }
}

/// Shrinks `lws` until it fits the global size, the per-dimension limits and
/// the kernel's work-group ceiling. Largest dimensions are halved first.
pub fn fit_local_size(lws: [u32; 3], gws: [u32; 3], max_wg: u32, max_dims: [u32; 3]) -> [u32; 3] {
    let mut out = [1u32; 3];
    for i in 0..3 {
        let ceiling = gws[i].max(1).min(max_dims[i].max(1));
        out[i] = lws[i].clamp(1, ceiling);
    }
    let max_wg = u64::from(max_wg.max(1));
    let volume = |l: &[u32; 3]| l.iter().fold(1u64, |acc, v| acc.saturating_mul(u64::from(*v)));
    while volume(&out) > max_wg {
        let (i, _) = out
            .iter()
            .enumerate()
            .rev()
            .max_by_key(|(_, v)| **v)
            .unwrap_or((0, &1));
        out[i] = (out[i] / 2).max(1);
    }
    out
}

/// Local sizes worth timing for a launch, in evaluation order.
///
/// The fitted default comes first, followed by power-of-two splits `x * y * z`
/// of the work-group ceiling, with `x` then `y` ascending. Every candidate is
/// fitted to the limits and duplicates are dropped.
pub fn local_size_candidates(
    gws: [u32; 3],
    default_lws: [u32; 3],
    max_wg: u32,
    max_dims: [u32; 3],
    max_candidates: usize,
) -> Vec<[u32; 3]> {
    let max_wg = max_wg.max(1);
    let mut out = vec![fit_local_size(default_lws, gws, max_wg, max_dims)];
    // u64 so doubling past the largest u32 power of two terminates
    let limit = u64::from(max_wg);
    let mut x = 1u64;
    while x <= limit {
        let mut y = 1u64;
        while x * y <= limit {
            let z = limit / (x * y);
            let split = [x, y, z].map(|v| u32::try_from(v).unwrap_or(u32::MAX));
            let candidate = fit_local_size(split, gws, max_wg, max_dims);
            if !out.contains(&candidate) {
                out.push(candidate);
            }
            y *= 2;
        }
        x *= 2;
    }
    out.truncate(max_candidates.max(1));
    out
}

/// Chooses, records and applies local work-group sizes.
pub struct Tuner {
    config: TunerConfig,
    max_dims: [u32; 3],
    records: Mutex<HashMap<String, TuningRecord>>,
    storage: Option<Arc<dyn KvStorage>>,
    searches: AtomicUsize,
}

impl Tuner {
    pub fn new(config: TunerConfig, max_dims: [u32; 3], storage: Option<Arc<dyn KvStorage>>) -> Self {
        Self {
            config,
            max_dims,
            records: Mutex::new(HashMap::new()),
            storage,
            searches: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &TunerConfig {
        &self.config
    }

    /// Record for `signature`, loading it from storage on first use.
    pub fn lookup(&self, signature: &str) -> Result<Option<TuningRecord>> {
        if let Some(rec) = self.records.lock().get(signature) {
            return Ok(Some(rec.clone()));
        }
        let Some(storage) = &self.storage else {
            return Ok(None);
        };
        let Some(bytes) = storage.load(signature)? else {
            return Ok(None);
        };
        match TuningRecord::decode(&bytes) {
            Ok(rec) => {
                tracing::debug!(signature, lws = ?rec.local_size, "loaded tuning record");
                self.records.lock().insert(signature.to_string(), rec.clone());
                Ok(Some(rec))
            }
            Err(err) => {
                tracing::warn!(signature, "ignoring stored tuning record: {err}");
                Ok(None)
            }
        }
    }

    /// Launches `kernel`, tuning its local size first when allowed.
    ///
    /// With a `future`, the launch waits for completion and its timing is
    /// recorded into the future. Tuning launches are never reported.
    pub fn run_or_tune(
        &self,
        kernel: &KernelHandle,
        signature: &str,
        gws: [u32; 3],
        default_lws: [u32; 3],
        future: Option<&mut StatsFuture>,
    ) -> Result<()> {
        let lws = match self.lookup(signature)? {
            Some(rec) => fit_local_size(rec.launch_size(), gws, kernel.max_work_group_size(), self.max_dims),
            None if self.config.enabled => self.tune(kernel, signature, gws, default_lws)?.launch_size(),
            None => fit_local_size(default_lws, gws, kernel.max_work_group_size(), self.max_dims),
        };

        let wait = future.is_some();
        let stats = kernel.enqueue(gws, lws, wait)?;
        if let Some(future) = future {
            future.record(stats);
        }
        Ok(())
    }

    fn tune(&self, kernel: &KernelHandle, signature: &str, gws: [u32; 3], default_lws: [u32; 3]) -> Result<TuningRecord> {
        self.searches.fetch_add(1, Ordering::Relaxed);
        let candidates = local_size_candidates(
            gws,
            default_lws,
            kernel.max_work_group_size(),
            self.max_dims,
            self.config.max_candidates,
        );
        let runs = self.config.runs_per_candidate.max(1);

        let mut best: Option<([u32; 3], Duration)> = None;
        for lws in candidates {
            let mut total = Duration::ZERO;
            for _ in 0..runs {
                total += kernel.enqueue(gws, lws, true)?.elapsed();
            }
            let cost = total / runs;
            tracing::trace!(signature, ?lws, ?cost, "timed candidate");
            if best.is_none_or(|(_, c)| cost < c) {
                best = Some((lws, cost));
            }
        }

        let (lws, cost) = best.unwrap_or((fit_local_size(default_lws, gws, 1, self.max_dims), Duration::ZERO));
        let record = TuningRecord::new(lws.to_vec(), cost);
        tracing::info!(signature, ?lws, ?cost, "tuned kernel");

        self.records.lock().insert(signature.to_string(), record.clone());
        if let Some(storage) = &self.storage {
            storage.insert(signature, record.encode())?;
        }
        Ok(record)
    }

    /// Number of candidate searches performed so far.
    pub fn searches(&self) -> usize {
        self.searches.load(Ordering::Relaxed)
    }

    /// Snapshot of every record in memory.
    pub fn records(&self) -> HashMap<String, TuningRecord> {
        self.records.lock().clone()
    }

    /// Makes persisted records durable.
    pub fn flush(&self) -> Result<()> {
        match &self.storage {
            Some(storage) => storage.flush(),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Tuner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tuner")
            .field("config", &self.config)
            .field("records", &self.records.lock().len())
            .field("persistent", &self.storage.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_respects_every_limit() {
        let lws = fit_local_size([8, 16, 8], [2, 100, 100], 64, [256, 256, 4]);
        assert_eq!(lws[0], 2);
        assert!(lws[2] <= 4);
        assert!(lws.iter().product::<u32>() <= 64);
    }

    #[test]
    fn candidates_start_with_default_and_are_unique() {
        let c = local_size_candidates([64, 64, 64], [8, 4, 8], 256, [256, 256, 64], 64);
        assert_eq!(c[0], [8, 4, 8]);
        for (i, a) in c.iter().enumerate() {
            assert!(a.iter().product::<u32>() <= 256);
            assert!(!c[i + 1..].contains(a));
        }
    }

    #[test]
    fn huge_work_group_ceilings_terminate() {
        let c = local_size_candidates([4, 4, 4], [1, 1, 1], u32::MAX, [u32::MAX; 3], 64);
        assert!(!c.is_empty());
        assert!(c.iter().all(|l| l.iter().all(|v| (1..=4).contains(v))));

        let big = fit_local_size([u32::MAX; 3], [u32::MAX; 3], u32::MAX, [u32::MAX; 3]);
        let volume: u64 = big.iter().map(|v| u64::from(*v)).product();
        assert!(volume <= u64::from(u32::MAX));
    }

    #[test]
    fn candidates_are_deterministic_and_bounded() {
        let a = local_size_candidates([7, 33, 5], [8, 1, 8], 128, [128, 128, 64], 10);
        let b = local_size_candidates([7, 33, 5], [8, 1, 8], 128, [128, 128, 64], 10);
        assert_eq!(a, b);
        assert!(a.len() <= 10);
        assert!(a.iter().all(|l| l[0] <= 7 && l[2] <= 5));
    }
}
