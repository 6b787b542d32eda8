//! Per-category stop signals and run leases.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

/// Cooperative stop flag checked by a growth run between passes and resolver batches.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn same(&self, other: &StopSignal) -> bool {
        Arc::ptr_eq(&self.flag, &other.flag)
    }
}

/// Hands out one live run per category. Stopping one never touches another.
#[derive(Debug, Clone, Default)]
pub struct StopRegistry {
    signals: Arc<Mutex<HashMap<String, StopSignal>>>,
}

/// Exclusive claim on a category for the duration of one growth run.
///
/// Dropping the lease (including while unwinding from a panic) frees the category.
#[derive(Debug)]
pub struct RunLease {
    category_id: String,
    signal: StopSignal,
    registry: StopRegistry,
}

impl RunLease {
    pub fn category_id(&self) -> &str {
        &self.category_id
    }

    pub fn signal(&self) -> &StopSignal {
        &self.signal
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        let mut signals = self.registry.lock();
        if signals
            .get(&self.category_id)
            .map(|s| s.same(&self.signal))
            .unwrap_or(false)
        {
            signals.remove(&self.category_id);
            debug!(category_id = %self.category_id, "run lease released");
        }
    }
}

impl StopRegistry {
    /// Claim `category_id` for a new run with a fresh signal.
    /// Returns `None` while another run of the same category holds a lease.
    pub fn arm(&self, category_id: &str) -> Option<RunLease> {
        let mut signals = self.lock();
        if signals.contains_key(category_id) {
            return None;
        }
        let signal = StopSignal::default();
        signals.insert(category_id.to_string(), signal.clone());
        Some(RunLease {
            category_id: category_id.to_string(),
            signal,
            registry: self.clone(),
        })
    }

    pub fn is_running(&self, category_id: &str) -> bool {
        self.lock().contains_key(category_id)
    }

    /// Signal of the live run of `category_id`, if any.
    pub fn signal(&self, category_id: &str) -> Option<StopSignal> {
        self.lock().get(category_id).cloned()
    }

    /// Returns false when no run for `category_id` is live.
    pub fn stop(&self, category_id: &str) -> bool {
        match self.lock().get(category_id) {
            Some(signal) => {
                info!(category_id, "stop requested");
                signal.stop();
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        let signals = self.lock();
        info!(categories = signals.len(), "stop requested for all categories");
        for signal in signals.values() {
            signal.stop();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StopSignal>> {
        // A panic while holding this lock cannot leave the map half-updated.
        self.signals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopping_one_category_leaves_siblings_running() {
        let registry = StopRegistry::default();
        let shaving = registry.arm("shaving").expect("shaving lease");
        let beard = registry.arm("beard").expect("beard lease");

        assert!(registry.stop("shaving"));
        assert!(shaving.signal().is_stopped());
        assert!(!beard.signal().is_stopped());
        assert!(!registry.stop("deodorants"));
    }

    #[test]
    fn a_live_lease_blocks_a_second_run_of_the_same_category() {
        let registry = StopRegistry::default();
        let first = registry.arm("shaving").expect("first lease");
        assert!(registry.arm("shaving").is_none());
        assert!(registry.is_running("shaving"));

        // The first run stays reachable.
        assert!(registry.stop("shaving"));
        assert!(first.signal().is_stopped());

        drop(first);
        assert!(!registry.is_running("shaving"));
        assert!(registry.signal("shaving").is_none());
        let fresh = registry.arm("shaving").expect("re-armed after release");
        assert!(!fresh.signal().is_stopped());
        assert_eq!(fresh.category_id(), "shaving");
    }

    #[test]
    fn a_panicking_holder_releases_its_lease() {
        let registry = StopRegistry::default();
        let shared = registry.clone();
        let outcome = std::thread::spawn(move || {
            let _lease = shared.arm("beard").expect("lease");
            panic!("run blew up");
        })
        .join();
        assert!(outcome.is_err());
        assert!(registry.arm("beard").is_some());
    }
}
