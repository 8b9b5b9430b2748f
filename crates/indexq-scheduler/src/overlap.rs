//! Overlap control for scheduled runs.
//!
//! A tick that fires while the previous run of the same job is still going
//! is either skipped or allowed to run alongside it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// What to do when a tick arrives while the job is still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OverlapPolicy {
    /// Drop the tick. Both queue jobs use this.
    #[default]
    Skip,

    /// Start another run next to the active one.
    Concurrent,
}

/// Tracks whether a job is running and how many ticks it dropped.
pub struct OverlapGuard {
    running: Arc<AtomicBool>,
    skipped: AtomicU64,
    policy: OverlapPolicy,
}

impl OverlapGuard {
    pub fn new(policy: OverlapPolicy) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            skipped: AtomicU64::new(0),
            policy,
        }
    }

    /// Try to begin a run.
    ///
    /// Under `Skip` this returns `None` while another [`RunGuard`] is alive.
    /// Under `Concurrent` it always succeeds.
    pub fn try_acquire(&self) -> Option<RunGuard> {
        match self.policy {
            OverlapPolicy::Skip => {
                if self
                    .running
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    Some(RunGuard {
                        flag: Some(self.running.clone()),
                    })
                } else {
                    self.skipped.fetch_add(1, Ordering::Relaxed);
                    None
                }
            }
            OverlapPolicy::Concurrent => Some(RunGuard { flag: None }),
        }
    }

    /// Whether a `Skip` run is in flight. Always false under `Concurrent`.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Ticks dropped because a run was still active.
    pub fn skipped_count(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn policy(&self) -> OverlapPolicy {
        self.policy
    }
}

/// Clears the running flag on drop, including when the run panics.
pub struct RunGuard {
    flag: Option<Arc<AtomicBool>>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Some(flag) = &self.flag {
            flag.store(false, Ordering::Release);
        }
    }
}
