//! Agent reachability tracking
//!
//! The periodic loop and every delegated-check runner report into one
//! shared flag. Only transitions are interesting: an agent outage spans
//! many ticks and many TTL pushes, and logging each failure would flood the
//! log with copies of the same fact.

use std::sync::atomic::{AtomicBool, Ordering};

/// Shared reachability flag for the discovery agent
#[derive(Debug)]
pub(crate) struct Availability {
    reachable: AtomicBool,
}

impl Availability {
    /// Starts out reachable; the first failed sync flips it
    pub(crate) fn new() -> Self {
        Self {
            reachable: AtomicBool::new(true),
        }
    }

    pub(crate) fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    /// Record the observed state. Returns true when this call changed the
    /// flag, which is the caller's cue to log the transition.
    pub(crate) fn mark(&self, reachable: bool) -> bool {
        self.reachable.swap(reachable, Ordering::SeqCst) != reachable
    }
}
