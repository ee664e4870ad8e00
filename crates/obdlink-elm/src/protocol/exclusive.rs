//! Exclusive multi-command lease on the vehicle channel
//!
//! Single commands are already serialized by the session mutex. Actuator
//! tests additionally run multi-command sequences that must not
//! interleave with live-data polling, so the orchestrator takes this
//! lease for the duration of a test and the poller skips cycles while
//! it is held.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct ExclusiveAccess {
    held: Arc<AtomicBool>,
}

impl ExclusiveAccess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the lease; `None` when it is already held
    pub fn acquire(&self) -> Option<ExclusiveGuard> {
        self.held
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| ExclusiveGuard {
                held: self.held.clone(),
            })
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

/// Releases the lease on drop
pub struct ExclusiveGuard {
    held: Arc<AtomicBool>,
}

impl Drop for ExclusiveGuard {
    fn drop(&mut self) {
        self.held.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_is_single_holder() {
        let access = ExclusiveAccess::new();
        assert!(!access.is_held());

        let guard = access.acquire().unwrap();
        assert!(access.is_held());
        assert!(access.acquire().is_none());

        drop(guard);
        assert!(!access.is_held());
        assert!(access.acquire().is_some());
    }
}
