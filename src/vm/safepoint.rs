//! Stop-the-world rendezvous ("bottleneck").
//!
//! Every thread running script code is registered through [`Runtime::mod_lock`].
//! A thread that needs a collection raises the bottleneck flag and waits on
//! the semaphore; the others notice the flag at their next safepoint
//! (backward jump, pool refill, `mod_lock`) and wait as well. The last one
//! to arrive drains the dead-blocks queue, collects if asked to and lets
//! everybody go.
//!
//! Callers must hold no context lock while they may enter the bottleneck:
//! the collector locks every context to mark it.
//!
//! Registration nests per thread. A thread that enters the runtime again
//! (a native running another context, or calling `Runtime::collect`) is
//! counted once, and while nested it never parks: an outer context lock may
//! still be held. Whatever it asks for is left pending for its next
//! safepoint at the outermost level, or for the moment it leaves.
use std::{cell::RefCell, sync::atomic::Ordering};

use parking_lot::MutexGuard;

use crate::runtime::{Heap, Runtime};

thread_local! {
    /// Registration depth of this thread in each runtime, keyed by address.
    static ENTERED: RefCell<Vec<(usize, usize)>> = RefCell::new(Vec::new());
}

fn runtime_key(rt: &Runtime) -> usize {
    rt as *const Runtime as usize
}

/// Moves this thread's registration depth in `rt` one step and returns the
/// new depth.
fn step_depth(rt: &Runtime, enter: bool) -> usize {
    let key = runtime_key(rt);
    ENTERED.with(|entered| {
        let mut entered = entered.borrow_mut();
        let at = match entered.iter().position(|&(k, _)| k == key) {
            Some(at) => at,
            None => {
                entered.push((key, 0));
                entered.len() - 1
            }
        };
        let depth = &mut entered[at].1;
        if enter {
            *depth += 1;
        } else {
            debug_assert!(*depth > 0, "mod_unlock without mod_lock");
            *depth = depth.saturating_sub(1);
        }
        let depth = *depth;
        if depth == 0 {
            entered.swap_remove(at);
        }
        depth
    })
}

impl Runtime {
    /// How many times the calling thread has entered this runtime.
    pub(crate) fn entered(&self) -> usize {
        let key = runtime_key(self);
        ENTERED.with(|entered| {
            entered
                .borrow()
                .iter()
                .find(|&&(k, _)| k == key)
                .map_or(0, |&(_, depth)| depth)
        })
    }

    /// True when the calling thread may wait in the bottleneck.
    pub(crate) fn may_park(&self) -> bool {
        self.entered() <= 1
    }

    /// Registers the calling thread as running inside the runtime.
    pub fn mod_lock(&self) {
        if step_depth(self, true) > 1 {
            return;
        }
        let mut heap = self.heap.lock();
        heap.n_threads += 1;
        if heap.bottleneck {
            self.bottleneck(&mut heap);
        }
    }

    /// Leaves the runtime. Natives about to block call this through
    /// `Ctx::unlocked`. Leaving is a safepoint.
    pub fn mod_unlock(&self) {
        if step_depth(self, false) > 0 {
            return;
        }
        let mut heap = self.heap.lock();
        debug_assert!(heap.n_threads > 0, "mod_unlock without mod_lock");
        if heap.bottleneck {
            self.bottleneck(&mut heap);
        }
        heap.n_threads -= 1;
        // The waiters may have been waiting on us alone.
        if heap.bottleneck && heap.wait_count > 0 && heap.wait_count == heap.n_threads {
            log::trace!(target: "gc-safepoint", "last straggler left, waking a waiter");
            self.sem.signal(1);
        }
    }

    #[inline]
    pub(crate) fn bottleneck_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Safepoint poll for a registered thread holding no context lock.
    pub(crate) fn check_bottleneck(&self) {
        if !self.bottleneck_pending() || !self.may_park() {
            return;
        }
        let mut heap = self.heap.lock();
        if heap.bottleneck {
            self.bottleneck(&mut heap);
        }
    }

    /// Requests a rendezvous without forcing a collection. Used when the
    /// dead-blocks queue is full.
    pub(crate) fn drain_now(&self) {
        let parks = self.may_park();
        let mut heap = self.heap.lock();
        if parks {
            self.bottleneck(&mut heap);
        } else {
            self.request(&mut heap, false);
        }
    }

    /// Raises the bottleneck without waiting in it; the next registered
    /// thread to reach a safepoint completes it.
    pub(crate) fn request(&self, heap: &mut Heap, gc: bool) {
        heap.need_gc |= gc;
        heap.bottleneck = true;
        self.pending.store(true, Ordering::Release);
    }

    pub(crate) fn bottleneck(&self, heap: &mut MutexGuard<'_, Heap>) {
        debug_assert!(heap.n_threads > 0, "bottleneck entered by an unregistered thread");
        heap.bottleneck = true;
        self.pending.store(true, Ordering::Release);

        while heap.bottleneck && heap.wait_count < heap.n_threads.saturating_sub(1) {
            heap.wait_count += 1;
            log::trace!(
                target: "gc-safepoint",
                "waiting in bottleneck ({}/{})",
                heap.wait_count,
                heap.n_threads
            );
            MutexGuard::unlocked(heap, || self.sem.wait());
            heap.wait_count -= 1;
        }

        if heap.bottleneck && heap.wait_count >= heap.n_threads.saturating_sub(1) {
            self.free_dead(heap);
            if heap.need_gc {
                self.garbage_collect(heap);
            }
            heap.bottleneck = false;
            self.pending.store(false, Ordering::Release);
            let waiting = heap.wait_count;
            self.sem.signal(waiting);
        }
    }
}
