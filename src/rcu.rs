/*
 * RCU (Read-Copy-Update)
 *
 * A global generation counter advances every time every CPU has passed
 * through at least one quiescent point since the last advance. Callbacks
 * registered with `call` are bucketed by the generation they were
 * registered under (bucket index is the generation modulo a power of two,
 * per §5's "bucketed callback lists" note) and run once the global
 * generation has advanced past their bucket's generation, by a dedicated
 * grace-period worker thread rather than inline in whatever CPU noticed
 * the advance.
 *
 * Readers call `read_lock`/`read_unlock` around a critical section; these
 * just bump the calling thread's nesting counter and, on the outermost
 * unlock, record the generation the thread has now "seen" so the GP
 * worker can tell whether every reader has drained.
 *
 * A grace period needs every CPU to pass through a quiescent state (its
 * current thread outside any read-side critical section) *and* every
 * reader that was preempted mid-critical-section to finish and unlock.
 * `sched::cpu::Core::tick`/`reschedule` call `note_cpu_quiescent` whenever
 * the thread they are currently running has `rcu_nesting == 0`; a reader
 * preempted with `rcu_nesting > 0` is moved onto `blocked_readers` so the
 * grace period can keep tracking it by thread rather than by CPU.
 */

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::sched::{self, CpuId, ThreadId};

const BUCKET_COUNT: usize = 16;

struct Callback {
    registered_gen: u64,
    routine: Box<dyn FnOnce() + Send>,
}

struct Bucket {
    callbacks: spin::Mutex<Vec<Callback>>,
}

struct State {
    generation: AtomicU64,
    buckets: [Bucket; BUCKET_COUNT],
    blocked_readers: spin::Mutex<Vec<crate::sched::ThreadId>>,
}

static STATE: spin::Once<State> = spin::Once::new();

fn state() -> &'static State {
    STATE.call_once(|| State {
        generation: AtomicU64::new(0),
        buckets: core::array::from_fn(|_| Bucket { callbacks: spin::Mutex::new(Vec::new()) }),
        blocked_readers: spin::Mutex::new(Vec::new()),
    })
}

pub fn init() {
    state();
    log::info!(target: "rcu", "RCU subsystem initialized");
}

pub fn current_generation() -> u64 {
    state().generation.load(Ordering::Acquire)
}

fn bucket_of(generation: u64) -> usize {
    (generation as usize) % BUCKET_COUNT
}

/// Enters an RCU read-side critical section. Nests: only the outermost
/// `read_lock` actually matters for quiescent-state tracking.
pub fn read_lock() {
    let tid = crate::sched::current_id();
    crate::sched::thread::with_mut(tid, |t| t.rcu_nesting += 1);
}

/// Leaves an RCU read-side critical section. On the outermost unlock,
/// records the current generation as "seen" so a grace period waiting on
/// this thread can consider it passed through a quiescent state.
pub fn read_unlock() {
    let tid = crate::sched::current_id();
    let gen = current_generation();
    crate::sched::thread::with_mut(tid, |t| {
        t.rcu_nesting = t.rcu_nesting.saturating_sub(1);
        if t.rcu_nesting == 0 {
            t.rcu_seen_gen = gen;
        }
    });
}

/// Registers `routine` to run once every reader active at the moment of
/// this call has left its critical section. Returns immediately; the
/// grace-period worker runs it later (see `grace_period_worker`).
pub fn call(routine: impl FnOnce() + Send + 'static) {
    let registered_gen = current_generation();
    let bucket = &state().buckets[bucket_of(registered_gen)];
    bucket.callbacks.lock().push(Callback { registered_gen, routine: Box::new(routine) });
}

/// Blocks the calling thread until a grace period has elapsed — i.e.
/// until every reader active when `synchronize` was called has left its
/// critical section. Implemented here as advancing the generation and
/// sleeping on the blocked-reader list; a real multi-CPU build also
/// cross-calls every other CPU to force it through a quiescent state.
pub fn synchronize() {
    let target_gen = state().generation.fetch_add(1, Ordering::AcqRel) + 1;
    loop {
        if all_quiescent(target_gen) {
            return;
        }
        crate::sched::yield_now();
    }
}

/// Records that `cpu` passed through a quiescent state at (at least) the
/// current generation. Called from the tick handler and from `reschedule`
/// whenever the thread a CPU is about to run (or already running) has no
/// read-side critical section open.
pub fn note_cpu_quiescent(cpu: CpuId) {
    let gen = current_generation();
    let core = sched::core(cpu);
    let _ = core.rcu_seen_gen.fetch_update(Ordering::AcqRel, Ordering::Acquire, |seen| if seen < gen { Some(gen) } else { None });
}

/// Moves a reader that is being switched off its CPU while still inside a
/// read-side critical section onto the blocked-reader list, so a grace
/// period doesn't assume the CPU it was on is quiescent until this specific
/// thread also finishes and unlocks.
pub fn note_reader_preempted(tid: ThreadId) {
    let mut guard = state().blocked_readers.lock();
    if !guard.contains(&tid) {
        guard.push(tid);
    }
}

/// True once every CPU has observed a quiescent state at `target_gen` and
/// every reader that was preempted mid-critical-section has either exited
/// its critical section at `target_gen` or later. Readers that have since
/// drained are pruned from `blocked_readers` as a side effect.
fn all_quiescent(target_gen: u64) -> bool {
    let every_cpu_quiescent = (0..sched::cpu_count())
        .all(|i| sched::core(CpuId(i as u32)).rcu_seen_gen.load(Ordering::Acquire) >= target_gen);
    if !every_cpu_quiescent {
        return false;
    }

    let mut guard = state().blocked_readers.lock();
    guard.retain(|&tid| {
        let drained = crate::sched::thread::with(tid, |t| t.rcu_nesting == 0 && t.rcu_seen_gen >= target_gen).unwrap_or(true);
        !drained
    });
    guard.is_empty()
}

/// Runs every callback whose bucket generation has been passed by the
/// current global generation. Intended to run on a dedicated GP worker
/// thread, polled or woken whenever `synchronize` advances the counter.
pub fn grace_period_worker_tick() {
    let gen = current_generation();
    for bucket in state().buckets.iter() {
        let mut guard = bucket.callbacks.lock();
        let (ready, pending): (Vec<_>, Vec<_>) = core::mem::take(&mut *guard).into_iter().partition(|cb| cb.registered_gen < gen);
        *guard = pending;
        drop(guard);
        for cb in ready {
            (cb.routine)();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering as O};

    #[test]
    fn read_lock_unlock_tracks_nesting_and_seen_gen() {
        crate::irql::init_cpu();
        init();
        read_lock();
        read_lock();
        read_unlock();
        let tid = crate::sched::current_id();
        let nesting = crate::sched::thread::with(tid, |t| t.rcu_nesting).unwrap();
        assert_eq!(nesting, 1);
        read_unlock();
        let nesting = crate::sched::thread::with(tid, |t| t.rcu_nesting).unwrap();
        assert_eq!(nesting, 0);
    }

    #[test]
    fn call_runs_once_generation_advances() {
        crate::irql::init_cpu();
        init();
        static HITS: AtomicU32 = AtomicU32::new(0);
        let before = current_generation();
        call(|| {
            HITS.fetch_add(1, O::SeqCst);
        });
        state().generation.store(before + 2, Ordering::SeqCst);
        grace_period_worker_tick();
        assert_eq!(HITS.load(O::SeqCst), 1);
    }

    #[test]
    fn all_quiescent_waits_on_every_cpu_and_blocked_reader() {
        crate::irql::init_cpu();
        init();
        let target = current_generation() + 1;
        state().generation.store(target, Ordering::SeqCst);

        assert!(!all_quiescent(target));
        note_cpu_quiescent(crate::sched::current_cpu());

        let reader = crate::sched::thread::spawn("rcu-blocked-reader", crate::sched::PriorityClass::Normal, None);
        crate::sched::thread::with_mut(reader, |t| t.rcu_nesting = 1);
        note_reader_preempted(reader);
        assert!(!all_quiescent(target));

        crate::sched::thread::with_mut(reader, |t| {
            t.rcu_nesting = 0;
            t.rcu_seen_gen = target;
        });
        assert!(all_quiescent(target));
    }
}
