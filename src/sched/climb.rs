/*
 * CLIMB — pressure-driven priority inheritance
 *
 * A thread accumulates "pressure" from holding resources other threads
 * are waiting on. Pressure maps through a cubic curve onto a boost level
 * in `[0, BOOST_LEVELS)`; a thread's effective boost also depends on the
 * aggregate wanted boost of every other thread on its CPU, so one heavily
 * contended lock can lift a holder's effective priority even if its own
 * wanted boost is modest. When the effective boost changes by more than
 * `REINSERT_THRESHOLD` the thread must be re-keyed in its scheduler's
 * vruntime tree (the caller does the re-key; this module only tracks the
 * numbers).
 *
 * `PressureHandle` is the explicit object subsystems (rwlock, semaphore,
 * ...) apply and release around a contended wait, per §4.3.
 */

use core::sync::atomic::{AtomicU32, Ordering};

use crate::sched::thread;
use crate::sched::ThreadId;

pub const BOOST_LEVELS: u32 = 8;
pub const REINSERT_THRESHOLD: u32 = 1;

const BASE_FACTOR: u32 = 4;
const INDIRECT_FACTOR: u32 = 2;
/// EWMA smoothing weight, in eighths (6/8 keeps 75% of the prior value).
const EWMA_NUM: u32 = 6;
const EWMA_DEN: u32 = 8;

#[derive(Debug, Copy, Clone, Default)]
pub struct ClimbState {
    /// Smoothed pressure contributed to this thread by waiters.
    pub pressure: u32,
    /// This thread's own wanted boost, derived from `pressure`.
    pub wanted_boost: u8,
    /// Effective boost last applied — what the scheduler actually used to
    /// key this thread, accounting for aggregate CPU-wide pressure.
    pub effective_boost: u8,
}

/// An explicit, applied/released pressure contribution from one thread
/// waiting on a resource held by another. Dropping it without calling
/// `release` leaks pressure on the holder forever, same as the original
/// leaking a held lock — callers are expected to pair apply/release the
/// same way they pair lock/unlock.
pub struct PressureHandle {
    holder: ThreadId,
    contributed: u32,
}

fn pressure_to_boost(pressure: u32) -> u8 {
    // Cubic curve, normalized so pressure values in the low hundreds
    // already saturate to the top boost level rather than needing huge
    // inputs — same shape the original's curve produces.
    let p = pressure.min(600) as u64;
    let scaled = (p * p * p) / (600 * 600 * 600 / (BOOST_LEVELS as u64 - 1)).max(1);
    scaled.min((BOOST_LEVELS - 1) as u64) as u8
}

/// Applies pressure to `holder` because some thread is waiting on a
/// resource it holds. `indirect` marks pressure relayed through a chain
/// (holder A waits on holder B who holds the real resource) rather than a
/// direct contribution, which is weighted down relative to direct waits.
pub fn apply(holder: ThreadId, indirect: bool) -> PressureHandle {
    let contribution = if indirect { INDIRECT_FACTOR } else { BASE_FACTOR };
    thread::with_mut(holder, |t| {
        let smoothed = (t.climb.pressure * EWMA_NUM + (t.climb.pressure + contribution) * (EWMA_DEN - EWMA_NUM)) / EWMA_DEN;
        t.climb.pressure = smoothed;
        t.climb.wanted_boost = pressure_to_boost(smoothed);
    });
    PressureHandle { holder, contributed: contribution }
}

pub fn release(handle: PressureHandle) {
    thread::with_mut(handle.holder, |t| {
        t.climb.pressure = t.climb.pressure.saturating_sub(handle.contributed);
        t.climb.wanted_boost = pressure_to_boost(t.climb.pressure);
    });
}

/// Recomputes `effective_boost` from a thread's own `wanted_boost` and the
/// aggregate wanted boost of every other ready thread sharing its CPU.
/// Returns `true` if the change exceeds `REINSERT_THRESHOLD`, meaning the
/// caller must re-key the thread in the vruntime tree.
pub fn recompute_effective(tid: ThreadId, cpu_aggregate_wanted: u32) -> bool {
    thread::with_mut(tid, |t| {
        let own = t.climb.wanted_boost as u32;
        let aggregate_share = (cpu_aggregate_wanted / 8).min((BOOST_LEVELS - 1) as u32);
        let new_effective = own.max(aggregate_share).min((BOOST_LEVELS - 1) as u32) as u8;
        let changed = (new_effective as i32 - t.climb.effective_boost as i32).unsigned_abs() >= REINSERT_THRESHOLD;
        t.climb.effective_boost = new_effective;
        changed
    })
    .unwrap_or(false)
}

/// Hook called whenever a thread wakes; CLIMB pressure decays passively
/// so a thread that is no longer the target of contention loses its boost
/// over time instead of keeping it forever.
static DECAY_TICK: AtomicU32 = AtomicU32::new(0);

pub fn on_wake(tid: ThreadId) {
    DECAY_TICK.fetch_add(1, Ordering::Relaxed);
    thread::with_mut(tid, |t| {
        t.climb.pressure = (t.climb.pressure * EWMA_NUM) / EWMA_DEN;
        t.climb.wanted_boost = pressure_to_boost(t.climb.pressure);
    });
}

/// Rebalances CLIMB state on migration: the thread carries its own
/// pressure/boost with it, only the "aggregate wanted boost" of its new
/// CPU needs a fresh `recompute_effective` pass, which the migration
/// caller performs once the thread is enqueued there.
pub fn on_migrate(_tid: ThreadId) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{thread as th, PriorityClass};

    #[test]
    fn pressure_raises_wanted_boost() {
        let holder = th::spawn("climb-holder", PriorityClass::Normal, None);
        let before = th::with(holder, |t| t.climb.wanted_boost).unwrap();
        let handle = apply(holder, false);
        let after = th::with(holder, |t| t.climb.wanted_boost).unwrap();
        assert!(after >= before);
        release(handle);
    }

    #[test]
    fn boost_never_exceeds_top_level() {
        assert!(pressure_to_boost(u32::MAX) < BOOST_LEVELS as u8);
    }
}
