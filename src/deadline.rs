//! Deadline Enforcement
//!
//! Every kernel operation takes an optional time budget. Enforcement is
//! cooperative: the evaluator checks the deadline at chunk boundaries during
//! long scans and before external calls, and external handlers receive the
//! remaining budget so they can bound their own I/O.
//!
//! A [`CancelHandle`] lets the host abort an in-flight operation from
//! another thread.

use crate::error::{KernelError, KernelResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cooperative deadline controller for one operation.
#[derive(Clone)]
pub struct Deadline {
    cancelled: Arc<AtomicBool>,
    start: Instant,
    budget: Option<Duration>,
}

impl Deadline {
    pub fn new(budget: Option<Duration>) -> Self {
        Deadline {
            cancelled: Arc::new(AtomicBool::new(false)),
            start: Instant::now(),
            budget,
        }
    }

    /// A deadline that never fires.
    pub fn unbounded() -> Self {
        Deadline::new(None)
    }

    /// Check for cancellation or expiry; called at suspension points.
    pub fn check(&self) -> KernelResult<()> {
        if self.cancelled.load(Ordering::Relaxed) {
            return Err(KernelError::Cancelled {
                budget: self.budget.unwrap_or(Duration::ZERO),
                elapsed: self.start.elapsed(),
            });
        }
        if let Some(budget) = self.budget {
            let elapsed = self.start.elapsed();
            if elapsed > budget {
                self.cancelled.store(true, Ordering::Relaxed);
                return Err(KernelError::Cancelled { budget, elapsed });
            }
        }
        Ok(())
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Remaining budget, if bounded. External handlers receive this.
    pub fn remaining(&self) -> Option<Duration> {
        self.budget.map(|budget| {
            let elapsed = self.start.elapsed();
            if elapsed >= budget {
                Duration::ZERO
            } else {
                budget - elapsed
            }
        })
    }

    /// Handle for cancelling from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            cancelled: Arc::clone(&self.cancelled),
        }
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Deadline::unbounded()
    }
}

/// Cross-thread cancellation handle.
#[derive(Clone)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_unbounded_never_fires() {
        let deadline = Deadline::unbounded();
        assert!(deadline.check().is_ok());
        assert!(deadline.remaining().is_none());
    }

    #[test]
    fn test_expiry_yields_cancelled() {
        let deadline = Deadline::new(Some(Duration::from_millis(5)));
        thread::sleep(Duration::from_millis(20));
        let err = deadline.check().expect_err("expired");
        assert_eq!(err.kind(), "Cancelled");
    }

    #[test]
    fn test_explicit_cancel_via_handle() {
        let deadline = Deadline::new(Some(Duration::from_secs(60)));
        let handle = deadline.cancel_handle();
        handle.cancel();
        assert!(deadline.check().is_err());
        assert!(deadline.is_cancelled());
    }

    #[test]
    fn test_remaining_decreases() {
        let deadline = Deadline::new(Some(Duration::from_secs(10)));
        let remaining = deadline.remaining().expect("bounded");
        assert!(remaining <= Duration::from_secs(10));
        assert!(remaining > Duration::from_secs(9));
    }
}
