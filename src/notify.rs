//! Readiness notification for done-queue consumers.
//!
//! Blocking waiters park on a condition variable guarded by a generation
//! counter; async waiters use [`tokio::sync::Notify`]. The predicate is always
//! evaluated by the waiter, so a signal only means "look again".

use std::pin::pin;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

/// Wakes everyone waiting for a condition to become true.
#[derive(Debug, Default)]
pub struct WaitChannel {
    generation: Mutex<u64>,
    cond: Condvar,
    notify: Notify,
}

impl WaitChannel {
    /// Channel with no waiters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wakes all current waiters.
    pub fn signal(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
        drop(generation);
        self.notify.notify_waiters();
    }

    /// Blocks until `ready()` holds or `timeout` expires.
    ///
    /// Returns the final value of `ready()`.
    pub fn wait_until(&self, ready: impl Fn() -> bool, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut generation = self.generation.lock();
        loop {
            // Checked under the generation lock: a signal cannot slip in
            // between the check and the park.
            if ready() {
                return true;
            }
            match deadline {
                None => self.cond.wait(&mut generation),
                Some(deadline) => {
                    if self.cond.wait_until(&mut generation, deadline).timed_out() {
                        return ready();
                    }
                }
            }
        }
    }

    /// Async form of [`WaitChannel::wait_until`] without a timeout.
    ///
    /// Wrap in `tokio::time::timeout` to bound it.
    pub async fn wait_until_async(&self, ready: impl Fn() -> bool) {
        loop {
            let mut notified = pin!(self.notify.notified());
            // Register before checking so a signal between the check and the
            // await is not lost.
            notified.as_mut().enable();
            if ready() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_immediate_when_ready() {
        let ch = WaitChannel::new();
        assert!(ch.wait_until(|| true, Some(Duration::ZERO)));
    }

    #[test]
    fn test_timeout() {
        let ch = WaitChannel::new();
        let start = Instant::now();
        assert!(!ch.wait_until(|| false, Some(Duration::from_millis(30))));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_blocking_wake() {
        let ch = Arc::new(WaitChannel::new());
        let flag = Arc::new(AtomicBool::new(false));
        let setter = {
            let (ch, flag) = (Arc::clone(&ch), Arc::clone(&flag));
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                flag.store(true, Ordering::Release);
                ch.signal();
            })
        };
        assert!(ch.wait_until(|| flag.load(Ordering::Acquire), None));
        setter.join().unwrap();
    }

    #[tokio::test]
    async fn test_async_wake() {
        let ch = Arc::new(WaitChannel::new());
        let flag = Arc::new(AtomicBool::new(false));
        {
            let (ch, flag) = (Arc::clone(&ch), Arc::clone(&flag));
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                flag.store(true, Ordering::Release);
                ch.signal();
            });
        }
        tokio::time::timeout(
            Duration::from_secs(2),
            ch.wait_until_async(|| flag.load(Ordering::Acquire)),
        )
        .await
        .unwrap();
    }
}
