use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Cumulative bytes reported by the transfer process running in `slot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskProgress {
    pub slot: usize,
    pub bytes_transferred: u64,
}

pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, progress: TaskProgress);
}

impl<F> ProgressSink for F
where
    F: Fn(TaskProgress) + Send + Sync,
{
    fn on_progress(&self, progress: TaskProgress) {
        self(progress)
    }
}

/// Highest byte count seen per slot, shared between running tasks and the aggregator.
///
/// One lock covers the whole map. Writes never lower a slot's value, so a late or reordered
/// report cannot make progress go backwards.
#[derive(Debug, Clone, Default)]
pub struct ProgressTable {
    inner: Arc<Mutex<HashMap<usize, u64>>>,
}

impl ProgressTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, slot: usize, bytes_transferred: u64) {
        let mut map = self.lock();
        let value = map.entry(slot).or_insert(0);
        *value = (*value).max(bytes_transferred);
    }

    pub fn get(&self, slot: usize) -> Option<u64> {
        self.lock().get(&slot).copied()
    }

    pub fn total(&self) -> u64 {
        self.lock().values().sum()
    }

    pub fn snapshot(&self) -> HashMap<usize, u64> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<usize, u64>> {
        // Values are plain counters; a panic elsewhere cannot leave them half-written.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ProgressSink for ProgressTable {
    fn on_progress(&self, progress: TaskProgress) {
        self.record(progress.slot, progress.bytes_transferred);
    }
}
