/*
 * Work stealing
 *
 * An idle CPU searches for a victim in `topology::steal_order()` order —
 * SMT siblings first, widening to CORE/LLC/NUMA/PACKAGE — stealing a
 * single thread from the first victim whose ready-queue length exceeds
 * `WORK_STEAL_THRESHOLD` more than the thief's own, per §4.4. Pinned
 * threads and the victim's idle thread are never eligible.
 */

use crate::sched::{self, domain, CpuId};

pub const WORK_STEAL_THRESHOLD: u32 = 2;
/// Minimum ready-count difference (victim - thief) worth the cost of a
/// steal; below this, migrating a thread isn't worth the cache-line churn.
pub const STEAL_MIN_DIFF: u32 = WORK_STEAL_THRESHOLD;
pub const MAX_CONCURRENT_STEALERS: usize = 4;

use core::sync::atomic::{AtomicUsize, Ordering};

static ACTIVE_STEALERS: AtomicUsize = AtomicUsize::new(0);

struct StealPermit;

impl StealPermit {
    fn acquire() -> Option<Self> {
        let prev = ACTIVE_STEALERS.fetch_add(1, Ordering::AcqRel);
        if prev >= MAX_CONCURRENT_STEALERS {
            ACTIVE_STEALERS.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(StealPermit)
    }
}

impl Drop for StealPermit {
    fn drop(&mut self) {
        ACTIVE_STEALERS.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Approximate ready-queue depth for a CPU. `Scheduler` doesn't expose an
/// exact `len()` (its structures are split across the tree and three
/// FIFOs), so this walks `is_empty` plus `aggregate_wanted_boost` as a weak
/// proxy — good enough for "is this CPU busier than me", not for exact
/// accounting.
fn rough_depth(cpu: CpuId) -> u32 {
    let core = sched::core(cpu);
    if core.scheduler().is_empty() {
        0
    } else {
        1 + core.scheduler().aggregate_wanted_boost()
    }
}

/// Called by an idle CPU's loop. Returns the id of a thread it stole and
/// migrated onto itself, or `None` if no eligible victim was found.
pub fn try_steal(thief: CpuId) -> Option<sched::ThreadId> {
    let _permit = StealPermit::acquire()?;
    let thief_depth = rough_depth(thief);

    for level in crate::topology::Topology::steal_order() {
        let Some(group) = domain::at_level(thief.as_usize(), level) else {
            continue;
        };
        for victim_cpu in group.cpus.iter() {
            if victim_cpu == thief.as_usize() {
                continue;
            }
            let victim = CpuId(victim_cpu as u32);
            let victim_depth = rough_depth(victim);
            if victim_depth < thief_depth + STEAL_MIN_DIFF {
                continue;
            }
            if let Some(tid) = sched::core(victim).scheduler().pick_next() {
                if sched::core(victim).idle_thread() == tid {
                    // Don't steal a CPU's idle thread back onto itself.
                    sched::core(victim).scheduler().set_idle(tid);
                    continue;
                }
                let pinned = crate::sched::thread::with(tid, |t| t.pinned).unwrap_or(true);
                if pinned {
                    sched::core(victim).scheduler().enqueue(tid);
                    continue;
                }
                crate::sched::thread::with_mut(tid, |t| t.current_core = thief);
                sched::core(thief).scheduler().enqueue(tid);
                return Some(tid);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permit_caps_concurrent_stealers() {
        let mut permits = alloc::vec::Vec::new();
        for _ in 0..MAX_CONCURRENT_STEALERS {
            permits.push(StealPermit::acquire().expect("under cap"));
        }
        assert!(StealPermit::acquire().is_none());
    }
}
