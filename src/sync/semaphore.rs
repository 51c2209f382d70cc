/*
 * Counting semaphore
 *
 * `{count, waiter list, lock, flags}` per spec §4.2. `wait()` decrements if
 * the count is already positive; otherwise it parks the calling thread on
 * the waiter list and blocks. `post()` increments the count and, if
 * threads are waiting, wakes the highest-priority one rather than simply
 * the oldest (the scheduler still decides who actually runs next).
 *
 * The `IRQ_DISABLE` flag mirrors the original's slow-path behavior: when
 * set, `wait()`'s blocking path masks interrupts (raises IRQL to HIGH
 * around the waiter-list mutation) instead of just raising to DISPATCH,
 * for semaphores also touched from interrupt context.
 *
 * A counting semaphore has no single "holder" the way a mutex or rwlock
 * writer does — any number of threads may be holding units at once. CLIMB
 * pressure is therefore attributed to `last_grantee`, whichever thread most
 * recently took a unit, as an indirect contribution; this is exact for the
 * common binary-semaphore (mutex-style, initial=1) case and an approximation
 * for wider counting semaphores, where no single thread is truly at fault.
 */

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::irql;
use crate::sched::climb::{self, PressureHandle};
use crate::sched::{self, SleepReason, ThreadId, WakeReason};
use crate::sync::spinlock::Spinlock;

const NO_GRANTEE: u64 = 0;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SemFlags: u32 {
        const IRQ_DISABLE = 1 << 0;
    }
}

struct Waiter {
    thread: ThreadId,
    priority: u8,
}

struct Inner {
    count: i64,
    waiters: Vec<Waiter>,
}

pub struct Semaphore {
    inner: Spinlock<Inner>,
    last_grantee: AtomicU64,
}

impl Semaphore {
    pub const fn new(initial: i64, flags: SemFlags) -> Self {
        let acquire_irql = if flags.contains(SemFlags::IRQ_DISABLE) { irql::HIGH } else { irql::DISPATCH };
        Self {
            inner: Spinlock::new_at(Inner { count: initial, waiters: Vec::new() }, acquire_irql),
            last_grantee: AtomicU64::new(NO_GRANTEE),
        }
    }

    fn current_grantee(&self) -> Option<ThreadId> {
        match self.last_grantee.load(Ordering::Acquire) {
            NO_GRANTEE => None,
            raw => Some(ThreadId(raw)),
        }
    }

    /// Decrements the count if positive, otherwise blocks the calling
    /// thread until a matching `post()`. Returns the reason the thread was
    /// woken — `Interrupted` only happens when `interruptible` is set and
    /// the thread's sleep is explicitly cancelled by a wake with that
    /// reason elsewhere.
    pub fn wait(&self, interruptible: bool) -> WakeReason {
        let mut pressure: Option<PressureHandle> = None;
        loop {
            let mut guard = self.inner.lock();
            if guard.count > 0 {
                guard.count -= 1;
                drop(guard);
                let me = sched::current_id();
                self.last_grantee.store(me.0, Ordering::Release);
                if let Some(handle) = pressure.take() {
                    climb::release(handle);
                }
                return WakeReason::Signaled;
            }
            if pressure.is_none() {
                if let Some(holder) = self.current_grantee() {
                    pressure = Some(climb::apply(holder, true));
                }
            }
            let me = sched::current_id();
            guard.waiters.push(Waiter { thread: me, priority: sched::priority_of(me) });
            drop(guard);

            let reason = sched::sleep_current(SleepReason::Semaphore, interruptible);
            if interruptible && reason == WakeReason::Interrupted {
                if let Some(handle) = pressure.take() {
                    climb::release(handle);
                }
                return reason;
            }
            // Spurious or non-matching wake: loop and re-check the count.
        }
    }

    /// Increments the count and, if threads are waiting, wakes whichever
    /// waiter has the highest priority.
    pub fn post(&self) {
        let mut guard = self.inner.lock();
        guard.count += 1;
        if guard.waiters.is_empty() {
            return;
        }
        let (idx, _) = guard
            .waiters
            .iter()
            .enumerate()
            .max_by_key(|(_, w)| w.priority)
            .expect("non-empty");
        let waiter = guard.waiters.swap_remove(idx);
        drop(guard);
        sched::wake(waiter.thread, WakeReason::Signaled);
    }

    pub fn count(&self) -> i64 {
        self.inner.lock().count
    }

    pub fn waiter_count(&self) -> usize {
        self.inner.lock().waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_on_positive_count_does_not_block() {
        crate::irql::init_cpu();
        let sem = Semaphore::new(1, SemFlags::empty());
        assert_eq!(sem.wait(false), WakeReason::Signaled);
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn post_increments_count_when_no_waiters() {
        crate::irql::init_cpu();
        let sem = Semaphore::new(0, SemFlags::empty());
        sem.post();
        assert_eq!(sem.count(), 1);
        assert_eq!(sem.waiter_count(), 0);
    }

    #[test]
    fn wait_records_last_grantee_for_climb() {
        crate::irql::init_cpu();
        let sem = Semaphore::new(1, SemFlags::empty());
        assert!(sem.current_grantee().is_none());
        sem.wait(false);
        assert_eq!(sem.current_grantee(), Some(sched::current_id()));
    }
}
