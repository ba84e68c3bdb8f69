//! Thread-blocking counting semaphore
//!
//! Every blocking hand-off in the core goes through this type: result slots,
//! the worker's "may proceed" signal and the "fully stopped" acknowledgement.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Counting semaphore that parks the calling OS thread while no permits are
/// available.
///
/// Permits are not tied to a particular waiter; a `post` made before anyone
/// waits is kept and consumed by the next `wait`.
pub struct Semaphore {
    /// Available permits
    permits: Mutex<usize>,

    /// Signalled on every post
    available: Condvar,
}

impl Semaphore {
    /// Create a semaphore holding `permits` permits.
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            available: Condvar::new(),
        }
    }

    /// Release one permit, waking one waiter if any.
    pub fn post(&self) {
        self.post_many(1);
    }

    /// Release `count` permits at once.
    pub fn post_many(&self, count: usize) {
        if count == 0 {
            return;
        }
        let mut permits = self.permits.lock();
        *permits += count;
        if count == 1 {
            self.available.notify_one();
        } else {
            self.available.notify_all();
        }
    }

    /// Block until a permit is available, then take it.
    pub fn wait(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.available.wait(&mut permits);
        }
        *permits -= 1;
    }

    /// Block for at most `timeout`. Returns `false` if no permit was taken.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut permits = self.permits.lock();
        while *permits == 0 {
            if self.available.wait_until(&mut permits, deadline).timed_out() {
                // A post may have raced the timeout.
                break;
            }
        }
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    /// Number of permits currently available.
    pub fn count(&self) -> usize {
        *self.permits.lock()
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new(0)
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("permits", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_post_before_wait() {
        let sem = Semaphore::new(0);
        sem.post();
        sem.wait();
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn test_wait_timeout_expires() {
        let sem = Semaphore::new(0);
        let start = Instant::now();
        assert!(!sem.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_cross_thread_wakeup() {
        let sem = Arc::new(Semaphore::new(0));
        let waiter = {
            let sem = sem.clone();
            thread::spawn(move || sem.wait_timeout(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(10));
        sem.post();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_post_many_wakes_all() {
        let sem = Arc::new(Semaphore::new(0));
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let sem = sem.clone();
                thread::spawn(move || sem.wait_timeout(Duration::from_secs(5)))
            })
            .collect();
        thread::sleep(Duration::from_millis(10));
        sem.post_many(4);
        for waiter in waiters {
            assert!(waiter.join().unwrap());
        }
        assert_eq!(sem.count(), 0);
    }
}
