// Fixed-rate background loop around one robot operation
// Each tick still goes through the engine lock, so it interleaves with foreground calls
// one transaction at a time. A stop request (UserCancelled) ends the loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::scribbler::{Result, ScribblerError};

// Granularity at which a sleeping repeater notices `stop`
const STOP_POLL: Duration = Duration::from_millis(20);

/// Why a repeater loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeaterExit {
    Stopped,
    Cancelled,
}

pub struct Repeater {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<RepeaterExit>>,
}

impl Repeater {
    /// Run `task` every `period` on a dedicated thread until stopped
    pub fn spawn<F>(name: &str, period: Duration, mut task: F) -> Result<Self>
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let label = name.to_string();

        let handle = thread::Builder::new()
            .name(format!("repeat-{name}"))
            .spawn(move || {
                info!("Repeater '{}' started: every {}ms", label, period.as_millis());
                let mut failures: u64 = 0;
                loop {
                    if flag.load(Ordering::SeqCst) {
                        return RepeaterExit::Stopped;
                    }
                    let tick = Instant::now();
                    match task() {
                        Ok(()) => {
                            if failures > 0 {
                                debug!("Repeater '{}' recovered after {} failures", label, failures);
                                failures = 0;
                            }
                        }
                        Err(ScribblerError::UserCancelled) => {
                            info!("Repeater '{}' cancelled", label);
                            return RepeaterExit::Cancelled;
                        }
                        Err(e) => {
                            failures += 1;
                            warn!("Repeater '{}' tick failed: {}", label, e);
                        }
                    }

                    // sleep out the rest of the period, watching for stop
                    let deadline = tick + period;
                    while !flag.load(Ordering::SeqCst) {
                        let now = Instant::now();
                        if now >= deadline {
                            break;
                        }
                        thread::sleep((deadline - now).min(STOP_POLL));
                    }
                }
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stop after the current tick and wait for the thread
    pub fn stop(mut self) -> RepeaterExit {
        self.shutdown()
    }

    fn shutdown(&mut self) -> RepeaterExit {
        self.stop.store(true, Ordering::SeqCst);
        match self.handle.take().map(JoinHandle::join) {
            Some(Ok(exit)) => exit,
            Some(Err(_)) => {
                warn!("Repeater thread panicked");
                RepeaterExit::Stopped
            }
            None => RepeaterExit::Stopped,
        }
    }
}

impl Drop for Repeater {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_runs_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let repeater = Repeater::spawn("count", Duration::from_millis(5), move || {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        thread::sleep(Duration::from_millis(60));
        assert_eq!(repeater.stop(), RepeaterExit::Stopped);
        assert!(count.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_errors_do_not_end_loop_but_cancel_does() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let repeater = Repeater::spawn("flaky", Duration::from_millis(1), move || {
            match seen.fetch_add(1, Ordering::SeqCst) {
                0 | 1 => Err(ScribblerError::ProtocolTimeout {
                    expected: 11,
                    received: 0,
                }),
                _ => Err(ScribblerError::UserCancelled),
            }
        })
        .unwrap();
        let started = Instant::now();
        while !repeater.is_finished() && started.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(repeater.stop(), RepeaterExit::Cancelled);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_repeater_against_robot_serializes_with_foreground() {
        use crate::config::LinkConfig;
        use crate::scribbler::cancel::CancelToken;
        use crate::scribbler::link::Link;
        use crate::scribbler::mock::{FakeScribbler, MockPort};
        use crate::scribbler::Scribbler;

        let port = MockPort::with_device(FakeScribbler::default());
        let link = Link::new(Box::new(port.clone()), "COM3", 38_400);
        let config = LinkConfig::new("COM3").with_uniform_delays(Duration::from_millis(1));
        let robot = Arc::new(Scribbler::from_link(link, config, CancelToken::new()).unwrap());

        let background = Arc::clone(&robot);
        let repeater = Repeater::spawn("light", Duration::from_millis(1), move || {
            background.light().map(|_| ())
        })
        .unwrap();
        for _ in 0..50 {
            robot.drive(0.2, 0.0).unwrap();
        }
        assert_eq!(repeater.stop(), RepeaterExit::Stopped);
        assert_eq!(port.state().overlaps, 0);
    }
}
