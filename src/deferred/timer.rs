/*
 * Timers
 *
 * A sorted-by-deadline list of pending timers, driven by the HPET/APIC
 * timer tick. Each timer fires either a DPC (stays in interrupt context,
 * can't block) or a workqueue item (runs on a worker thread, can block),
 * matching the two deferred-execution primitives this module sits on top
 * of. `tick()` is called once per timer interrupt and fires (and removes)
 * every timer whose deadline has passed.
 */

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::deferred::{dpc, workqueue};
use crate::sched::CpuId;

/// Monotonic tick counter, incremented once per timer interrupt. Not wall
/// clock time — callers schedule relative to "ticks from now".
static TICKS: AtomicU64 = AtomicU64::new(0);

pub enum Action {
    Dpc(dpc::Dpc),
    Work(workqueue::WorkItem),
}

struct Timer {
    deadline: u64,
    action: Action,
    cpu: CpuId,
}

static TIMERS: spin::Once<spin::Mutex<Vec<Timer>>> = spin::Once::new();

fn timers() -> &'static spin::Mutex<Vec<Timer>> {
    TIMERS.call_once(|| spin::Mutex::new(Vec::new()))
}

pub fn init() {
    timers();
    TICKS.store(0, Ordering::Relaxed);
}

pub fn now() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Schedules `action` to fire `delay_ticks` from now, on `cpu` (only
/// meaningful for `Action::Dpc`; workqueue items run wherever a worker
/// happens to be free).
pub fn schedule(delay_ticks: u64, cpu: CpuId, action: Action) {
    let deadline = now().saturating_add(delay_ticks.max(1));
    let mut guard = timers().lock();
    let idx = guard.partition_point(|t| t.deadline <= deadline);
    guard.insert(idx, Timer { deadline, action, cpu });
}

/// Advances the tick counter by one and fires (removing) every timer
/// whose deadline has now passed. Called from the timer interrupt
/// handler; must not block.
pub fn tick() {
    let now = TICKS.fetch_add(1, Ordering::Relaxed) + 1;
    let mut fired = Vec::new();
    {
        let mut guard = timers().lock();
        while let Some(t) = guard.first() {
            if t.deadline > now {
                break;
            }
            fired.push(guard.remove(0));
        }
    }
    for t in fired {
        match t.action {
            Action::Dpc(d) => dpc::queue_on(t.cpu, d),
            Action::Work(w) => workqueue::submit(w),
        }
    }
}

pub fn pending_count() -> usize {
    timers().lock().len()
}

#[cfg(test)]
fn reset_for_test() {
    timers().lock().clear();
    TICKS.store(0, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering as O};

    #[test]
    fn timer_fires_only_after_deadline() {
        reset_for_test();
        static HITS: AtomicU32 = AtomicU32::new(0);
        schedule(3, CpuId(0), Action::Dpc(dpc::Dpc::new(|| {
            HITS.fetch_add(1, O::SeqCst);
        })));
        tick();
        tick();
        assert_eq!(pending_count(), 1);
        tick();
        assert_eq!(pending_count(), 0);
        dpc::drain_current_cpu();
        assert_eq!(HITS.load(O::SeqCst), 1);
    }

    #[test]
    fn timers_stay_sorted_by_deadline() {
        reset_for_test();
        schedule(10, CpuId(0), Action::Dpc(dpc::Dpc::new(|| {})));
        schedule(1, CpuId(0), Action::Dpc(dpc::Dpc::new(|| {})));
        schedule(5, CpuId(0), Action::Dpc(dpc::Dpc::new(|| {})));
        let guard = timers().lock();
        let deadlines: Vec<u64> = guard.iter().map(|t| t.deadline).collect();
        let mut sorted = deadlines.clone();
        sorted.sort();
        assert_eq!(deadlines, sorted);
    }
}
