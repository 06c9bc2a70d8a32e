//! Cooperative cancellation shared by watcher, worker, and read loops.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// A clonable cancellation flag.
///
/// Cancellation is cooperative: holders check the token before starting new
/// storage operations and between iterator emissions. `wait_timeout` lets
/// poll loops sleep while remaining responsive to shutdown.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    canceled: Mutex<bool>,
    signal: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let mut canceled = self.inner.canceled.lock().unwrap();
        *canceled = true;
        self.inner.signal.notify_all();
    }

    pub fn is_canceled(&self) -> bool {
        *self.inner.canceled.lock().unwrap()
    }

    /// Sleep for up to `timeout`, waking early on cancellation. Returns true
    /// if the token was canceled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut canceled = self.inner.canceled.lock().unwrap();
        let deadline = std::time::Instant::now() + timeout;
        while !*canceled {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .inner
                .signal
                .wait_timeout(canceled, deadline - now)
                .unwrap();
            canceled = guard;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn starts_unset_and_latches() {
        let token = CancelToken::new();
        assert!(!token.is_canceled());
        token.cancel();
        assert!(token.is_canceled());
        assert!(token.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn wait_times_out_when_not_canceled() {
        let token = CancelToken::new();
        assert!(!token.wait_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn cancel_wakes_a_sleeping_waiter() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = thread::spawn(move || waiter.wait_timeout(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(10));
        token.cancel();
        assert!(handle.join().unwrap());
    }
}
