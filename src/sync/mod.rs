/*
 * Synchronization primitives
 *
 * Spinlocks raise IRQL; rwlocks and semaphores may block the calling
 * thread. All three sit directly on top of `irql` and (for the blocking
 * ones) `sched`.
 */

pub mod rwlock;
pub mod semaphore;
pub mod spinlock;

pub use rwlock::RwLock;
pub use semaphore::{SemFlags, Semaphore};
pub use spinlock::Spinlock;
