// Cooperative cancellation, checked at transaction boundaries and retry points

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use super::error::{Result, ScribblerError};

// Granularity of cancellable sleeps
const SLEEP_SLICE: Duration = Duration::from_millis(20);

/// Shared request-stop flag. Cloning yields a handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the current operation to stop at its next poll point
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Observe and clear the flag in one step
    pub fn take(&self) -> bool {
        self.flag.swap(false, Ordering::SeqCst)
    }

    /// Fail with `UserCancelled` (clearing the flag) if a stop was requested
    pub fn check(&self) -> Result<()> {
        if self.take() {
            Err(ScribblerError::UserCancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, returning early (true) once a stop is requested.
    /// The flag is left set for whoever owns the session to act on.
    pub fn wait(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }

    /// Like `wait`, but consumes the flag and fails with `UserCancelled`.
    /// Motors are not touched, so this is only for waits outside a robot session.
    pub(crate) fn sleep(&self, duration: Duration) -> Result<()> {
        self.wait(duration);
        self.check()
    }
}
