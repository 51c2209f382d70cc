/*
 * Per-CPU ready queue
 *
 * Pick-next order, per §4.3: urgent FIFO, then realtime FIFO, then the
 * leftmost (lowest-vruntime) node of the CLIMB/CFS tree, then the
 * background FIFO, and only once all of those are empty the idle thread.
 * `BTreeMap<(u64, ThreadId), ThreadId>` stands in for the original's
 * intrusive red-black tree, same trade the teacher already makes
 * elsewhere in favor of safe containers over hand-rolled trees.
 */

use alloc::collections::BTreeMap;
use alloc::collections::VecDeque;
use spin::Mutex;

use crate::sched::climb;
use crate::sched::thread;
use crate::sched::{PriorityClass, ThreadId};

const MIN_VRUNTIME_GRANULARITY: u64 = 1;

/// Scales a vruntime by a thread's CLIMB effective boost: each boost
/// level pulls the thread's key left (earlier) by one tick's worth of
/// the baseline weight's vruntime accrual, so a heavily-boosted thread
/// is picked sooner without needing a separate priority dimension in the
/// tree's key tuple.
fn climb_adjusted_key(vruntime: u64, effective_boost: u8) -> u64 {
    vruntime.saturating_sub(effective_boost as u64 * crate::sched::NICE_0_WEIGHT)
}

struct Inner {
    /// Keyed by (vruntime, id) so equal vruntimes still order deterministically.
    tree: BTreeMap<(u64, ThreadId), ()>,
    realtime: VecDeque<ThreadId>,
    urgent: VecDeque<ThreadId>,
    background: VecDeque<ThreadId>,
    min_vruntime: u64,
    idle: Option<ThreadId>,
}

pub struct Scheduler {
    inner: Mutex<Inner>,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                tree: BTreeMap::new(),
                realtime: VecDeque::new(),
                urgent: VecDeque::new(),
                background: VecDeque::new(),
                min_vruntime: 0,
                idle: None,
            }),
        }
    }

    pub fn set_idle(&self, id: ThreadId) {
        self.inner.lock().idle = Some(id);
    }

    /// Inserts a READY thread into the appropriate structure for its
    /// priority class. Normal/High/Low share the vruntime tree (their
    /// relative scheduling is governed by weight, not a separate FIFO);
    /// Urgent/Realtime and Background get dedicated FIFOs so they never
    /// starve behind tree churn or, respectively, never starve the tree.
    pub fn enqueue(&self, id: ThreadId) {
        let class = thread::with(id, |t| t.priority_class).unwrap_or(PriorityClass::Normal);
        let mut guard = self.inner.lock();
        match class {
            PriorityClass::Realtime => guard.realtime.push_back(id),
            PriorityClass::Urgent => guard.urgent.push_back(id),
            PriorityClass::Background => guard.background.push_back(id),
            PriorityClass::Idle => guard.idle = Some(id),
            _ => {
                let min_vr = guard.min_vruntime;
                let key = thread::with_mut(id, |t| {
                    if t.vruntime < min_vr {
                        t.vruntime = min_vr;
                    }
                    let key = climb_adjusted_key(t.vruntime, t.climb.effective_boost);
                    t.tree_key = key;
                    key
                })
                .unwrap_or(min_vr);
                guard.tree.insert((key, id), ());
            }
        }
    }

    pub fn remove(&self, id: ThreadId) {
        let mut guard = self.inner.lock();
        guard.urgent.retain(|&x| x != id);
        guard.realtime.retain(|&x| x != id);
        guard.background.retain(|&x| x != id);
        let key = thread::with(id, |t| (t.tree_key, id));
        if let Some(k) = key {
            guard.tree.remove(&k);
        }
    }

    /// Removes and returns the next thread to run, in pick-next order.
    /// Returns the idle thread (without removing it — idle is never
    /// "consumed") if every other structure is empty.
    pub fn pick_next(&self) -> Option<ThreadId> {
        let mut guard = self.inner.lock();
        if let Some(id) = guard.urgent.pop_front() {
            return Some(id);
        }
        if let Some(id) = guard.realtime.pop_front() {
            return Some(id);
        }
        if let Some((&(vr, id), _)) = guard.tree.iter().next() {
            guard.tree.remove(&(vr, id));
            guard.min_vruntime = guard.min_vruntime.max(vr);
            return Some(id);
        }
        if let Some(id) = guard.background.pop_front() {
            return Some(id);
        }
        guard.idle
    }

    pub fn is_empty(&self) -> bool {
        let guard = self.inner.lock();
        guard.urgent.is_empty() && guard.realtime.is_empty() && guard.tree.is_empty() && guard.background.is_empty()
    }

    /// Accrues vruntime for the currently running thread at the end of a
    /// tick, scaled by `NICE_0_WEIGHT / weight` so heavier (higher
    /// priority) threads accrue more slowly, per §4.3's "weighted fair
    /// scheduling" note. Called by the tick handler, not by `pick_next`.
    pub fn accrue(&self, id: ThreadId, ticks: u64) {
        let weight = thread::with(id, |t| t.weight).unwrap_or(crate::sched::NICE_0_WEIGHT);
        let delta = (ticks * crate::sched::NICE_0_WEIGHT / weight).max(MIN_VRUNTIME_GRANULARITY);
        thread::with_mut(id, |t| t.vruntime += delta);
    }

    /// Sum of `wanted_boost` across every thread currently in the tree or
    /// FIFOs, used by `climb::recompute_effective` to derive aggregate
    /// CPU-wide contention pressure.
    pub fn aggregate_wanted_boost(&self) -> u32 {
        let guard = self.inner.lock();
        let ids = guard
            .tree
            .keys()
            .map(|&(_, id)| id)
            .chain(guard.urgent.iter().copied())
            .chain(guard.realtime.iter().copied())
            .chain(guard.background.iter().copied());
        ids.filter_map(|id| thread::with(id, |t| t.climb.wanted_boost as u32)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::PriorityClass;

    #[test]
    fn urgent_and_realtime_preempt_the_tree() {
        crate::irql::init_cpu();
        let sched = Scheduler::new();
        let normal = thread::spawn("q-normal", PriorityClass::Normal, None);
        let urgent = thread::spawn("q-urgent", PriorityClass::Realtime, None);
        sched.enqueue(normal);
        sched.enqueue(urgent);
        assert_eq!(sched.pick_next(), Some(urgent));
        assert_eq!(sched.pick_next(), Some(normal));
    }

    #[test]
    fn urgent_drains_ahead_of_realtime() {
        crate::irql::init_cpu();
        let sched = Scheduler::new();
        let rt = thread::spawn("q-rt", PriorityClass::Realtime, None);
        let urgent = thread::spawn("q-urgent", PriorityClass::Urgent, None);
        sched.enqueue(rt);
        sched.enqueue(urgent);
        assert_eq!(sched.pick_next(), Some(urgent));
        assert_eq!(sched.pick_next(), Some(rt));
    }

    #[test]
    fn lowest_vruntime_picked_first() {
        crate::irql::init_cpu();
        let sched = Scheduler::new();
        let a = thread::spawn("q-a", PriorityClass::Normal, None);
        let b = thread::spawn("q-b", PriorityClass::Normal, None);
        thread::with_mut(a, |t| t.vruntime = 100);
        thread::with_mut(b, |t| t.vruntime = 10);
        sched.enqueue(a);
        sched.enqueue(b);
        assert_eq!(sched.pick_next(), Some(b));
        assert_eq!(sched.pick_next(), Some(a));
    }

    #[test]
    fn falls_back_to_idle_when_empty() {
        let sched = Scheduler::new();
        let idle = ThreadId(999);
        sched.set_idle(idle);
        assert_eq!(sched.pick_next(), Some(idle));
    }
}
