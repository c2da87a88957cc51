//! Counting semaphore used by the collection rendezvous.
use parking_lot::{Condvar, Mutex};

pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub const fn new(init: usize) -> Self {
        Self {
            count: Mutex::new(init),
            cond: Condvar::new(),
        }
    }

    /// Blocks until a permit is available and takes it.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }

    #[cfg(test)]
    fn try_wait(&self) -> bool {
        let mut count = self.count.lock();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    /// Returns false if no permit became available within `timeout`.
    #[cfg(test)]
    fn wait_timeout(&self, timeout: std::time::Duration) -> bool {
        let mut count = self.count.lock();
        while *count == 0 {
            if self.cond.wait_for(&mut count, timeout).timed_out() {
                return false;
            }
        }
        *count -= 1;
        true
    }

    /// Adds `count` permits.
    pub fn signal(&self, count: usize) {
        if count == 0 {
            return;
        }
        *self.count.lock() += count;
        if count == 1 {
            self.cond.notify_one();
        } else {
            self.cond.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    #[test]
    fn permits_are_counted() {
        let sem = Semaphore::new(1);
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
        sem.signal(2);
        assert!(sem.try_wait());
        assert!(sem.wait_timeout(Duration::from_millis(10)));
        assert!(!sem.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn signal_releases_waiters() {
        let sem = Semaphore::new(0);
        let woke = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    sem.wait();
                    woke.fetch_add(1, Ordering::SeqCst);
                });
            }
            sem.signal(4);
        });
        assert_eq!(woke.load(Ordering::SeqCst), 4);
    }
}
