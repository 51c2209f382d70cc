/*
 * Thread table
 *
 * Threads are owned by value in one process-wide table, indexed by a
 * stable `ThreadId`; everything else (scheduler queues, the CPU's
 * "current thread" slot, wait lists) refers to a thread by id and borrows
 * through the table via refcount, never an owning pointer. This is the
 * cyclic-reference-avoidance scheme §9 asks for.
 */

use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::cpumask::CpuMask;
use crate::deferred::apc::{Apc, ApcType};
use crate::sched::climb::ClimbState;
use crate::sched::{CpuId, PriorityClass, SleepReason, ThreadState, WakeReason};
use crate::sync::spinlock::Spinlock;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u64);

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ThreadFlags: u32 {
        const KERNEL = 1 << 0;
        const IDLE   = 1 << 1;
    }
}

pub struct Thread {
    pub id: ThreadId,
    pub name: String,
    pub state: ThreadState,
    pub priority_class: PriorityClass,
    pub dynamic_priority: i32,
    pub perceived_priority: i32,
    pub weight: u64,
    pub vruntime: u64,
    /// The vruntime-tree key this thread was last inserted under (raw
    /// vruntime discounted by its CLIMB effective boost). Recorded at
    /// insertion so `Scheduler::remove` can find the entry again even if
    /// `climb.effective_boost` has since changed underneath it.
    pub tree_key: u64,
    pub ticks_left: u32,
    pub current_core: CpuId,
    pub affinity: CpuMask,
    pub pinned: bool,
    pub apc_lists: [Vec<Apc>; 3],
    pub apc_pending_mask: u8,
    pub kernel_apc_disable: u32,
    pub special_apc_disable: u32,
    pub climb: ClimbState,
    pub rcu_nesting: u32,
    pub rcu_seen_gen: u64,
    pub wait_cookie: u64,
    pub sleep_reason: Option<SleepReason>,
    pub interruptible: bool,
    pub last_wake_reason: WakeReason,
    pub refcount: AtomicU32,
    pub flags: ThreadFlags,
}

impl Thread {
    fn new(id: ThreadId, name: String, class: PriorityClass, core: CpuId, flags: ThreadFlags) -> Self {
        Self {
            id,
            name,
            state: ThreadState::New,
            priority_class: class,
            dynamic_priority: 0,
            perceived_priority: 0,
            weight: class.weight(),
            vruntime: 0,
            tree_key: 0,
            ticks_left: class.tick_quota(),
            current_core: core,
            affinity: crate::sched::default_affinity(),
            pinned: false,
            apc_lists: [Vec::new(), Vec::new(), Vec::new()],
            apc_pending_mask: 0,
            kernel_apc_disable: 0,
            special_apc_disable: 0,
            climb: ClimbState::default(),
            rcu_nesting: 0,
            rcu_seen_gen: 0,
            wait_cookie: 0,
            sleep_reason: None,
            interruptible: false,
            last_wake_reason: WakeReason::Signaled,
            refcount: AtomicU32::new(1),
            flags,
        }
    }

    pub fn apc_list_mut(&mut self, ty: ApcType) -> &mut Vec<Apc> {
        &mut self.apc_lists[ty as usize]
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static TABLE: spin::Once<Spinlock<Vec<Option<Thread>>>> = spin::Once::new();

fn table() -> &'static Spinlock<Vec<Option<Thread>>> {
    TABLE.call_once(|| Spinlock::new(Vec::new()))
}

/// Creates a new thread in state `New` and places it in the table, but
/// does not enqueue it on any scheduler — callers that want it runnable
/// call `sched::wake` (or enqueue on a specific CPU) afterward.
pub fn spawn(name: &str, class: PriorityClass, affinity: Option<CpuMask>) -> ThreadId {
    let id = ThreadId(NEXT_ID.fetch_add(1, Ordering::Relaxed));
    let mut t = Thread::new(id, String::from(name), class, crate::sched::CpuId::BSP, ThreadFlags::KERNEL);
    if let Some(mask) = affinity {
        t.affinity = mask;
    }
    t.state = ThreadState::Ready;

    let mut guard = table().lock();
    let idx = id.0 as usize;
    if guard.len() <= idx {
        guard.resize_with(idx + 1, || None);
    }
    guard[idx] = Some(t);
    drop(guard);

    crate::sched::core(crate::sched::CpuId::BSP).scheduler().enqueue(id);
    id
}

/// Spawns the dedicated idle thread for a CPU; it never appears in any
/// ready queue — the per-CPU scheduler falls back to it directly.
pub fn spawn_idle(core: CpuId) -> ThreadId {
    let id = ThreadId(NEXT_ID.fetch_add(1, Ordering::Relaxed));
    let mut t = Thread::new(id, alloc::format!("idle/{}", core.0), PriorityClass::Idle, core, ThreadFlags::KERNEL | ThreadFlags::IDLE);
    t.state = ThreadState::IdleThread;
    let mut guard = table().lock();
    let idx = id.0 as usize;
    if guard.len() <= idx {
        guard.resize_with(idx + 1, || None);
    }
    guard[idx] = Some(t);
    id
}

pub fn with<R>(id: ThreadId, f: impl FnOnce(&Thread) -> R) -> Option<R> {
    let guard = table().lock();
    guard.get(id.0 as usize)?.as_ref().map(f)
}

pub fn with_mut<R>(id: ThreadId, f: impl FnOnce(&mut Thread) -> R) -> Option<R> {
    let mut guard = table().lock();
    guard.get_mut(id.0 as usize)?.as_mut().map(f)
}

/// Increments the thread's refcount; the scheduler and wait-queue code
/// call this whenever they hold onto a `ThreadId` beyond a single
/// operation, mirroring `thread_get`/`thread_put` in §6.
pub fn get(id: ThreadId) {
    with(id, |t| t.refcount.fetch_add(1, Ordering::Relaxed));
}

/// Decrements the refcount; reaps (removes from the table) a `Zombie`
/// thread once it reaches zero.
pub fn put(id: ThreadId) {
    let should_reap = with(id, |t| {
        let prev = t.refcount.fetch_sub(1, Ordering::AcqRel);
        prev == 1 && t.state == ThreadState::Zombie
    })
    .unwrap_or(false);
    if should_reap {
        let mut guard = table().lock();
        if let Some(slot) = guard.get_mut(id.0 as usize) {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_places_thread_ready_in_table() {
        let id = spawn("test-thread", PriorityClass::Normal, None);
        let state = with(id, |t| t.state);
        assert_eq!(state, Some(ThreadState::Ready));
    }

    #[test]
    fn refcount_reaps_zombie_on_last_put() {
        let id = spawn("reap-me", PriorityClass::Normal, None);
        with_mut(id, |t| t.state = ThreadState::Zombie);
        put(id);
        assert!(with(id, |t| t.id).is_none());
    }
}
