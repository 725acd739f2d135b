//! Auto-reset wait primitive used for fence waits

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Auto-reset event
///
/// A fence registers the event with the device, which signals it once the
/// requested value is reached. One event is reused for every wait on a fence.
#[derive(Debug, Default)]
pub struct Event {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl Event {
    /// Create an unsignaled event
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal the event and wake one waiter
    pub fn signal(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.condvar.notify_one();
    }

    /// Clear a pending signal
    pub fn reset(&self) {
        *self.signaled.lock() = false;
    }

    /// Whether a signal is pending
    pub fn is_signaled(&self) -> bool {
        *self.signaled.lock()
    }

    /// Block until signaled, consuming the signal
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.condvar.wait(&mut signaled);
        }
        *signaled = false;
    }

    /// Block until signaled or `timeout` elapses; returns whether a signal was consumed
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut signaled = self.signaled.lock();
        if !*signaled {
            let _ = self.condvar.wait_for(&mut signaled, timeout);
        }
        std::mem::replace(&mut *signaled, false)
    }
}
