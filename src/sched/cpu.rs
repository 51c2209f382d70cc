/*
 * Per-CPU core state
 *
 * One `Core` per logical CPU: its own ready-queue `Scheduler`, the
 * currently running thread, a dedicated idle thread, and the handful of
 * atomics every other subsystem pokes at from arbitrary contexts
 * (`needs_resched` from an ISR, `preempt_disable_depth` from spinlock
 * acquire/release, `rcu_seen_gen` from the RCU read side). Per §9's
 * cyclic-reference note, a `Core` never holds an owning reference to its
 * current thread — only the `ThreadId`.
 */

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::sched::queue::Scheduler;
use crate::sched::{thread, CpuId, PriorityClass, ThreadId};

pub struct Core {
    pub id: CpuId,
    scheduler: Scheduler,
    current: AtomicU64,
    idle: AtomicU64,
    needs_resched: AtomicBool,
    preempt_disable_depth: AtomicU32,
    pub rcu_seen_gen: AtomicU64,
    pub domain_index: AtomicU32,
}

impl Core {
    pub fn new(id: CpuId) -> Self {
        let idle_id = thread::spawn_idle(id);
        // A fresh core starts on its idle thread, so it must be counted
        // as idle from the start — otherwise the first transition away
        // from idle would under-run the global idle-core count.
        crate::global::note_cpu_idle(true);
        crate::topology::with(|t| t.mark_cpu_idle(id.as_usize()));
        Self {
            id,
            scheduler: Scheduler::new(),
            current: AtomicU64::new(idle_id.0),
            idle: AtomicU64::new(idle_id.0),
            needs_resched: AtomicBool::new(false),
            preempt_disable_depth: AtomicU32::new(0),
            rcu_seen_gen: AtomicU64::new(0),
            domain_index: AtomicU32::new(0),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn current_thread(&self) -> ThreadId {
        ThreadId(self.current.load(Ordering::Acquire))
    }

    pub fn idle_thread(&self) -> ThreadId {
        ThreadId(self.idle.load(Ordering::Relaxed))
    }

    pub fn is_idle(&self) -> bool {
        self.current_thread() == self.idle_thread()
    }

    pub fn request_resched(&self) {
        self.needs_resched.store(true, Ordering::Release);
    }

    pub fn needs_resched(&self) -> bool {
        self.needs_resched.load(Ordering::Acquire)
    }

    pub fn preempt_disable(&self) {
        self.preempt_disable_depth.fetch_add(1, Ordering::AcqRel);
    }

    pub fn preempt_enable(&self) {
        self.preempt_disable_depth.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn preemptible(&self) -> bool {
        self.preempt_disable_depth.load(Ordering::Acquire) == 0
    }

    /// Picks the next thread (falling back to idle), swaps `current`, and
    /// clears `needs_resched`. Does not perform the architectural context
    /// switch itself — that is `arch`'s `context_switch(old, new)`, which
    /// the caller (`sched::yield_now` or the tick ISR) invokes once this
    /// returns the old/new pair, so `cpu.rs` stays architecture-neutral.
    pub fn reschedule(&self) -> (ThreadId, ThreadId) {
        let old = self.current_thread();
        let was_idle = self.is_idle();
        if !self.is_idle() {
            thread::with_mut(old, |t| {
                if t.state == crate::sched::ThreadState::Running {
                    t.state = crate::sched::ThreadState::Ready;
                }
            });
            // A reader switched off this CPU while still inside a read-side
            // critical section can't rely on this CPU's own quiescent state
            // to cover it — it has to keep being tracked by thread.
            if thread::with(old, |t| t.rcu_nesting > 0).unwrap_or(false) {
                crate::rcu::note_reader_preempted(old);
            }
            if thread::with(old, |t| t.state == crate::sched::ThreadState::Ready).unwrap_or(false) {
                self.scheduler.enqueue(old);
            }
        }

        let next = self.scheduler.pick_next().unwrap_or_else(|| self.idle_thread());
        thread::with_mut(next, |t| t.state = crate::sched::ThreadState::Running);
        self.current.store(next.0, Ordering::Release);
        self.needs_resched.store(false, Ordering::Release);

        if thread::with(next, |t| t.rcu_nesting == 0).unwrap_or(true) {
            crate::rcu::note_cpu_quiescent(self.id);
        }

        let becomes_idle = next == self.idle_thread();
        if was_idle != becomes_idle {
            let transition = if becomes_idle {
                crate::sched::CpuTransition::Idle
            } else {
                crate::sched::CpuTransition::Woke
            };
            crate::sched::on_cpu_transition(self.id, transition);
        }

        (old, next)
    }

    /// Called by the tick ISR: accrues vruntime/decrements the running
    /// thread's quota, and requests a reschedule once it hits zero.
    pub fn tick(&self) {
        let cur = self.current_thread();
        if thread::with(cur, |t| t.rcu_nesting == 0).unwrap_or(true) {
            crate::rcu::note_cpu_quiescent(self.id);
        }
        if self.is_idle() {
            return;
        }
        self.scheduler.accrue(cur, 1);
        let exhausted = thread::with_mut(cur, |t| {
            t.ticks_left = t.ticks_left.saturating_sub(1);
            t.ticks_left == 0
        })
        .unwrap_or(false);
        if exhausted {
            thread::with_mut(cur, |t| t.ticks_left = t.priority_class.tick_quota());
            self.request_resched();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_core_starts_idle() {
        crate::irql::init_cpu();
        let core = Core::new(CpuId(0));
        assert!(core.is_idle());
    }

    #[test]
    fn reschedule_picks_runnable_thread_over_idle() {
        crate::irql::init_cpu();
        let core = Core::new(CpuId(1));
        let t = thread::spawn("cpu-test-thread", PriorityClass::Normal, None);
        core.scheduler().enqueue(t);
        let (_, next) = core.reschedule();
        assert_eq!(next, t);
        assert!(!core.is_idle());
    }

    #[test]
    fn preempt_disable_tracks_depth() {
        crate::irql::init_cpu();
        let core = Core::new(CpuId(2));
        assert!(core.preemptible());
        core.preempt_disable();
        assert!(!core.preemptible());
        core.preempt_enable();
        assert!(core.preemptible());
    }
}
