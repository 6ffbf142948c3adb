//! Wait queues and signal delivery for blocking operations.
//!
//! A [`WaitQueue`] is woken from interrupt context; a waiter re-evaluates its
//! condition under the queue lock, so a wake-up issued after the condition
//! became true is never lost. Every wait is interruptible through the
//! caller's [`SignalToken`]; the wait that reports the interruption consumes
//! the signal, so a retried call blocks again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, StcError};

/// Per-caller "signal pending" flag.
#[derive(Debug, Clone, Default)]
pub struct SignalToken {
    pending: Arc<AtomicBool>,
}

impl SignalToken {
    /// Create a token with no signal pending.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a signal; the next wait using this token aborts.
    pub fn raise(&self) {
        self.pending.store(true, Ordering::SeqCst);
    }

    /// Discard the pending signal without delivering it.
    pub fn clear(&self) {
        self.pending.store(false, Ordering::SeqCst);
    }

    /// Consume the pending signal, returning whether there was one.
    pub fn take(&self) -> bool {
        self.pending.swap(false, Ordering::SeqCst)
    }

    /// Whether a signal is pending.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }
}

/// Condition-variable wait queue.
#[derive(Debug)]
pub struct WaitQueue {
    generation: Mutex<u64>,
    cond: Condvar,
    signal_poll: Duration,
}

impl WaitQueue {
    /// `signal_poll` bounds how long a waiter sleeps before re-checking its
    /// signal token.
    pub fn new(signal_poll: Duration) -> Self {
        Self {
            generation: Mutex::new(0),
            cond: Condvar::new(),
            signal_poll,
        }
    }

    /// Wake every waiter. Safe to call from interrupt handlers.
    pub fn wake_up_all(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Sleep until `condition` holds or a signal arrives. The signal is
    /// consumed when it ends the wait.
    pub fn wait_event_interruptible<F>(&self, mut condition: F, signal: &SignalToken) -> Result<()>
    where
        F: FnMut() -> bool,
    {
        let mut generation = self.generation.lock();
        loop {
            if condition() {
                return Ok(());
            }
            if signal.take() {
                return Err(StcError::Interrupted);
            }
            self.cond.wait_for(&mut generation, self.signal_poll);
        }
    }

    /// Like [`Self::wait_event_interruptible`], giving up after `timeout`.
    ///
    /// Returns whether the condition holds.
    pub fn wait_event_timeout<F>(
        &self,
        mut condition: F,
        signal: &SignalToken,
        timeout: Duration,
    ) -> Result<bool>
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut generation = self.generation.lock();
        loop {
            if condition() {
                return Ok(true);
            }
            if signal.take() {
                return Err(StcError::Interrupted);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let slice = (deadline - now).min(self.signal_poll);
            self.cond.wait_for(&mut generation, slice);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_wakeup_releases_waiter() {
        let queue = Arc::new(WaitQueue::new(Duration::from_millis(5)));
        let flag = Arc::new(AtomicBool::new(false));

        let waker = {
            let queue = queue.clone();
            let flag = flag.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                flag.store(true, Ordering::SeqCst);
                queue.wake_up_all();
            })
        };

        let token = SignalToken::new();
        queue
            .wait_event_interruptible(|| flag.load(Ordering::SeqCst), &token)
            .unwrap();
        waker.join().unwrap();
    }

    #[test]
    fn test_signal_interrupts_wait() {
        let queue = WaitQueue::new(Duration::from_millis(5));
        let token = SignalToken::new();
        let raiser = {
            let token = token.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                token.raise();
            })
        };
        let err = queue.wait_event_interruptible(|| false, &token).unwrap_err();
        assert_eq!(err, StcError::Interrupted);
        raiser.join().unwrap();
    }

    #[test]
    fn test_interruption_consumes_signal() {
        let queue = WaitQueue::new(Duration::from_millis(5));
        let token = SignalToken::new();
        token.raise();
        assert_eq!(
            queue.wait_event_interruptible(|| false, &token).unwrap_err(),
            StcError::Interrupted
        );
        assert!(!token.is_pending());

        // The retry sleeps for its full timeout instead of failing at once
        let start = Instant::now();
        let ready = queue
            .wait_event_timeout(|| false, &token, Duration::from_millis(20))
            .unwrap();
        assert!(!ready);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_satisfied_condition_leaves_signal_pending() {
        let queue = WaitQueue::new(Duration::from_millis(5));
        let token = SignalToken::new();
        token.raise();
        queue.wait_event_interruptible(|| true, &token).unwrap();
        assert!(token.is_pending());
        token.clear();
        assert!(!token.take());
    }

    #[test]
    fn test_timeout_expires() {
        let queue = WaitQueue::new(Duration::from_millis(5));
        let ready = queue
            .wait_event_timeout(|| false, &SignalToken::new(), Duration::from_millis(15))
            .unwrap();
        assert!(!ready);
    }
}
