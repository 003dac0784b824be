use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// One-shot close signal with an interruptible wait.
///
/// Used for backoff sleeps and keepalive ticks: a [`trigger`](Self::trigger)
/// wakes every waiter immediately instead of letting it sleep out its
/// interval.
#[derive(Debug, Default)]
pub struct Shutdown {
    triggered: Mutex<bool>,
    cond: Condvar,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. Returns `false` if it had already been fired.
    pub fn trigger(&self) -> bool {
        let mut triggered = self.triggered.lock();
        if *triggered {
            return false;
        }
        *triggered = true;
        self.cond.notify_all();
        true
    }

    pub fn is_triggered(&self) -> bool {
        *self.triggered.lock()
    }

    /// Sleep for up to `timeout`. Returns `true` if the signal fired
    /// (before or during the wait).
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut triggered = self.triggered.lock();
        while !*triggered {
            if self.cond.wait_until(&mut triggered, deadline).timed_out() {
                break;
            }
        }
        *triggered
    }
}
