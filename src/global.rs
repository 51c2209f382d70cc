/*
 * Global kernel state
 *
 * One process-wide `Global` struct, populated in order during boot and
 * never freed. A monotonic `bootstage` flag is the only thing that lets
 * other modules tell early bring-up (single CPU, no scheduler, no RCU)
 * apart from late steady-state (SMP up, scheduler running).
 *
 * Mirrors the teacher's single `SchedulerManager` static (one lazily
 * initialized global owning all scheduler state), generalized to own the
 * whole core's cross-cutting state instead of just the scheduler's.
 */

use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use crate::boot::BootInfo;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum BootStage {
    /// Single CPU, no heap-backed subsystems live yet.
    Early = 0,
    /// Memory, topology, scheduler, deferred exec, RCU, TLB all initialized.
    Late = 1,
    /// All APs brought up and running their own schedulers.
    Smp = 2,
}

struct Global {
    bootstage: AtomicU8,
    ncpus: AtomicUsize,
    idle_cpus: AtomicUsize,
    panicked: AtomicBool,
}

static GLOBAL: Global = Global {
    bootstage: AtomicU8::new(BootStage::Early as u8),
    ncpus: AtomicUsize::new(1),
    idle_cpus: AtomicUsize::new(0),
    panicked: AtomicBool::new(false),
};

pub fn init(boot_info: &BootInfo) {
    GLOBAL.ncpus.store(boot_info.cpu_count(), Ordering::Relaxed);
    log::info!(target: "core", "global state initialized for {} cpus", boot_info.cpu_count());
}

pub fn bootstage() -> BootStage {
    match GLOBAL.bootstage.load(Ordering::Acquire) {
        0 => BootStage::Early,
        1 => BootStage::Late,
        _ => BootStage::Smp,
    }
}

/// Advances the boot stage. Panics if called out of order — the stage is
/// monotonic, there is no going back to an earlier one.
pub fn set_bootstage(stage: BootStage) {
    let new = stage as u8;
    let old = GLOBAL.bootstage.swap(new, Ordering::AcqRel);
    assert!(new >= old, "bootstage must advance monotonically ({old} -> {new})");
}

pub fn ncpus() -> usize {
    GLOBAL.ncpus.load(Ordering::Relaxed)
}

/// Called whenever a CPU's idle thread starts/stops running, to maintain
/// the global idle-core count the work-steal controller consults.
pub fn note_cpu_idle(is_idle: bool) {
    if is_idle {
        GLOBAL.idle_cpus.fetch_add(1, Ordering::Relaxed);
    } else {
        // Saturating: a core that was never counted as idle (e.g. the
        // very first reschedule off its initial idle-thread slot, before
        // any transition was recorded) must not wrap the counter.
        let _ = GLOBAL.idle_cpus.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }
}

pub fn idle_cpu_count() -> usize {
    GLOBAL.idle_cpus.load(Ordering::Relaxed)
}

pub fn is_panicked() -> bool {
    GLOBAL.panicked.load(Ordering::SeqCst)
}

/// Marks the system as panicked. Called once from the panic handler before
/// it halts every core; nothing after this point is expected to run the
/// normal subsystem logic again.
pub fn mark_panicked() {
    GLOBAL.panicked.store(true, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    // `GLOBAL` is a process-wide static, so these two share state; keep
    // them in one test to avoid depending on cross-test execution order.
    #[test]
    fn bootstage_advances_but_never_regresses() {
        assert!(bootstage() <= BootStage::Late);
        set_bootstage(BootStage::Late);
        assert_eq!(bootstage(), BootStage::Late);

        let result = std::panic::catch_unwind(|| set_bootstage(BootStage::Early));
        assert!(result.is_err());
        assert_eq!(bootstage(), BootStage::Late);
    }

    #[test]
    fn idle_count_tracks_note_cpu_idle() {
        let before = idle_cpu_count();
        note_cpu_idle(true);
        assert_eq!(idle_cpu_count(), before + 1);
        note_cpu_idle(false);
        assert_eq!(idle_cpu_count(), before);
    }
}
