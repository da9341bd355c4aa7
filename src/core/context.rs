//! Cancellation and deadlines for long-running operations

use crate::error::{PackageError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cancellation flag plus optional deadline
///
/// Clones share the flag, so one handle can cancel work running on another
/// thread. Operations call [`Context::check`] between entries and chunks.
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Context {
    pub fn new() -> Self {
        Context::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Context {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Some(deadline),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Context::with_deadline(Instant::now() + timeout)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fail with a context error if cancelled or past the deadline
    pub fn check(&self, operation: &'static str) -> Result<()> {
        if self.is_cancelled() {
            return Err(PackageError::Cancelled(operation));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(PackageError::DeadlineExceeded(operation));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_default_context_passes() {
        assert!(Context::new().check("read").is_ok());
    }

    #[test]
    fn test_cancel_is_shared() {
        let ctx = Context::new();
        let handle = ctx.clone();
        handle.cancel();
        let err = ctx.check("write").unwrap_err();
        assert!(matches!(err, PackageError::Cancelled("write")));
        assert_eq!(err.kind(), ErrorKind::Context);
    }

    #[test]
    fn test_expired_deadline() {
        let ctx = Context::with_timeout(Duration::ZERO);
        assert!(matches!(
            ctx.check("compress"),
            Err(PackageError::DeadlineExceeded("compress"))
        ));
    }
}
