/*
 * Reader/writer lock
 *
 * Ticket-style: readers increment a counter and proceed as long as no
 * writer holds or is waiting; a writer takes a ticket, then waits for
 * all readers admitted before it to drain. Once a writer's ticket is
 * waiting, new readers queue behind it, which bounds reader-starvation
 * of the writer to the readers already in flight.
 *
 * Unlike `Spinlock`, this one does not raise IRQL — acquisition may block
 * the calling thread (spin-wait here; a fuller scheduler integration would
 * park the thread instead), so it must only be taken at PASSIVE/APC level.
 *
 * A thread that has to spin waiting for the current writer contributes
 * CLIMB pressure to it for the duration of the wait (§4.3/§9: "Pressure
 * handles are explicit objects applied and removed by subsystems that
 * cause or release contention"), so a thread holding a hot rwlock gets
 * boosted the same way a contended mutex holder would.
 */

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::sched::climb::{self, PressureHandle};
use crate::sched::{self, ThreadId};

/// Bit layout of the state word: bit 31 is "a writer holds the lock", the
/// low 31 bits count readers currently holding it.
const WRITER_BIT: u32 = 1 << 31;
const READER_MASK: u32 = WRITER_BIT - 1;
const NO_WRITER: u64 = 0;

pub struct RwLock<T: ?Sized> {
    state: AtomicU32,
    /// Ticket handed to the next writer; writers drain in ticket order so a
    /// steady stream of readers cannot starve a waiting writer forever.
    next_writer_ticket: AtomicU32,
    now_serving: AtomicU32,
    /// `ThreadId` of the thread currently holding the write lock, or
    /// `NO_WRITER`. Lets a spinning waiter find who to apply CLIMB
    /// pressure to.
    writer_tid: AtomicU64,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for RwLock<T> {}
unsafe impl<T: ?Sized + Send> Send for RwLock<T> {}

pub struct ReadGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

pub struct WriteGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

impl<T> RwLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            state: AtomicU32::new(0),
            next_writer_ticket: AtomicU32::new(0),
            now_serving: AtomicU32::new(0),
            writer_tid: AtomicU64::new(NO_WRITER),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> RwLock<T> {
    /// The thread currently holding the write lock, if any. Used to apply
    /// CLIMB pressure against while a reader or writer spins waiting for it.
    fn current_writer(&self) -> Option<ThreadId> {
        match self.writer_tid.load(Ordering::Acquire) {
            NO_WRITER => None,
            raw => Some(ThreadId(raw)),
        }
    }

    pub fn read(&self) -> ReadGuard<'_, T> {
        let mut pressure: Option<PressureHandle> = None;
        loop {
            // A writer with an earlier ticket than "now serving" is
            // draining readers; don't pile new ones in behind it.
            let my_turn = self.now_serving.load(Ordering::Acquire);
            if self.next_writer_ticket.load(Ordering::Acquire) != my_turn {
                if pressure.is_none() {
                    if let Some(holder) = self.current_writer() {
                        pressure = Some(climb::apply(holder, false));
                    }
                }
                core::hint::spin_loop();
                continue;
            }
            let state = self.state.load(Ordering::Acquire);
            if state & WRITER_BIT != 0 {
                if pressure.is_none() {
                    if let Some(holder) = self.current_writer() {
                        pressure = Some(climb::apply(holder, false));
                    }
                }
                core::hint::spin_loop();
                continue;
            }
            if self
                .state
                .compare_exchange_weak(state, state + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                if let Some(handle) = pressure {
                    climb::release(handle);
                }
                return ReadGuard { lock: self };
            }
        }
    }

    pub fn write(&self) -> WriteGuard<'_, T> {
        let ticket = self.next_writer_ticket.fetch_add(1, Ordering::AcqRel);
        let mut pressure: Option<PressureHandle> = None;
        while self.now_serving.load(Ordering::Acquire) != ticket {
            if pressure.is_none() {
                if let Some(holder) = self.current_writer() {
                    pressure = Some(climb::apply(holder, false));
                }
            }
            core::hint::spin_loop();
        }
        loop {
            if self
                .state
                .compare_exchange_weak(0, WRITER_BIT, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                if let Some(handle) = pressure {
                    climb::release(handle);
                }
                self.writer_tid.store(sched::current_id().0, Ordering::Release);
                return WriteGuard { lock: self };
            }
            if pressure.is_none() {
                if let Some(holder) = self.current_writer() {
                    pressure = Some(climb::apply(holder, false));
                }
            }
            core::hint::spin_loop();
        }
    }

    pub fn try_read(&self) -> Option<ReadGuard<'_, T>> {
        let state = self.state.load(Ordering::Acquire);
        if state & WRITER_BIT != 0 {
            return None;
        }
        self.state
            .compare_exchange(state, state + 1, Ordering::AcqRel, Ordering::Relaxed)
            .ok()
            .map(|_| ReadGuard { lock: self })
    }

    pub fn reader_count(&self) -> u32 {
        self.state.load(Ordering::Relaxed) & READER_MASK
    }

    pub fn is_write_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) & WRITER_BIT != 0
    }
}

impl<T: ?Sized> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<T: ?Sized> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.writer_tid.store(NO_WRITER, Ordering::Release);
        self.lock.state.store(0, Ordering::Release);
        self.lock.now_serving.fetch_add(1, Ordering::AcqRel);
    }
}

impl<T: ?Sized> Deref for ReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Deref for WriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiple_readers_allowed_concurrently() {
        let lock = RwLock::new(10);
        let a = lock.read();
        let b = lock.read();
        assert_eq!(*a, 10);
        assert_eq!(*b, 10);
        assert_eq!(lock.reader_count(), 2);
    }

    #[test]
    fn writer_excludes_readers_and_vice_versa() {
        let lock = RwLock::new(0);
        {
            let mut w = lock.write();
            *w = 5;
            assert!(lock.is_write_locked());
            assert!(lock.try_read().is_none());
        }
        assert!(!lock.is_write_locked());
        assert_eq!(*lock.read(), 5);
    }

    #[test]
    fn writer_ticket_drains_in_order() {
        let lock = RwLock::new(0);
        {
            let _r = lock.read();
            // A writer queued behind this reader must wait for the ticket,
            // but must not be starved once the reader releases.
        }
        let mut w = lock.write();
        *w += 1;
        drop(w);
        assert_eq!(*lock.read(), 1);
    }

    #[test]
    fn write_acquire_tracks_current_writer_for_climb() {
        crate::irql::init_cpu();
        let lock = RwLock::new(0);
        assert!(lock.current_writer().is_none());
        {
            let _w = lock.write();
            assert!(lock.current_writer().is_some());
        }
        assert!(lock.current_writer().is_none());
    }
}
