/*
 * IRQL (Interrupt Request Level)
 *
 * A per-CPU totally-ordered software priority that gates preemption and
 * interrupt/handler delivery. Mirrors the levels and bit layout of the
 * original `irql_t` encoding: the numeric level sits in the low bits, and a
 * "pinned" flag sits at bit 5 so a `lower()` can undo exactly what its
 * matching `raise()` did.
 *
 * `raise`/`lower` never call back into the scheduler or any other subsystem
 * that might itself call `raise`/`lower` — they talk to the raw
 * interrupt-enable primitive directly, so there is no recursion.
 */

use core::sync::atomic::{AtomicU8, Ordering};

use crate::arch;

pub const PASSIVE: u8 = 0;
pub const APC: u8 = 1;
pub const DISPATCH: u8 = 2;
pub const DEVICE: u8 = 2; // reserved, same numeric level as DISPATCH
pub const HIGH: u8 = 3;
/// Pseudo-level used before the IRQL machinery is live on a CPU.
pub const NONE: u8 = 0xff;

const LEVEL_MASK: u8 = 0b0001_1111;
const PINNED_BIT: u8 = 0b0010_0000;

/// One encoded IRQL word (`level | pinned_bit`) per CPU, indexed by
/// `CpuId`, same fixed-size-array-indexed-by-`CpuId` shape
/// `deferred::dpc`'s per-CPU queues use. IRQL is genuinely per-CPU state
/// (§3/§8): two CPUs raising/lowering concurrently must never touch each
/// other's encoded word.
const MAX_CPUS: usize = 256;
static CURRENT: [AtomicU8; MAX_CPUS] = {
    const INIT: AtomicU8 = AtomicU8::new(NONE);
    [INIT; MAX_CPUS]
};

/// The calling CPU's slot in `CURRENT`.
fn slot() -> &'static AtomicU8 {
    &CURRENT[crate::sched::current_cpu().as_usize().min(MAX_CPUS - 1)]
}

fn level_of(encoded: u8) -> u8 {
    encoded & LEVEL_MASK
}

fn was_pinned(encoded: u8) -> bool {
    encoded & PINNED_BIT != 0
}

/// Raises the current CPU's IRQL to `new`, returning the prior encoded
/// value (level + pin bit) so a matching `lower` can restore it exactly.
///
/// Panics if `new < current` — IRQL only ever goes up in a `raise`, symmetry
/// is restored by `lower`.
pub fn raise(new: u8) -> u8 {
    let old = slot().load(Ordering::Acquire);
    let old_level = level_of(old);
    assert!(
        old_level == NONE || new >= old_level,
        "irql::raise to {} below current {}",
        new,
        old_level
    );

    if new >= HIGH {
        arch::x86_64::interrupts::disable();
    }

    let mut pinned_by_us = false;
    if new >= DISPATCH && !was_pinned(old) {
        crate::sched::pin_current_thread();
        pinned_by_us = true;
    }

    let mut encoded = new & LEVEL_MASK;
    if pinned_by_us || was_pinned(old) {
        encoded |= PINNED_BIT;
    }
    slot().store(encoded, Ordering::Release);

    old
}

/// Lowers the current CPU's IRQL back to the level encoded in `old`
/// (as previously returned by `raise`), draining DPCs/APCs and honoring
/// `needs_resched` along the way.
///
/// Panics if `old`'s level is above the current level — lower never raises.
pub fn lower(old: u8) {
    let current = slot().load(Ordering::Acquire);
    let current_level = level_of(current);
    let target_level = level_of(old);
    assert!(
        target_level <= current_level,
        "irql::lower to {} above current {}",
        target_level,
        current_level
    );

    if target_level < DISPATCH && current_level >= DISPATCH {
        crate::deferred::dpc::drain_current_cpu();
    }
    if target_level < APC && current_level >= APC {
        crate::deferred::apc::drain_current_thread();
    }

    let unpin = was_pinned(current) && !was_pinned(old);

    slot().store(old, Ordering::Release);

    if target_level < HIGH && current_level >= HIGH {
        arch::x86_64::interrupts::enable();
    }

    if unpin {
        crate::sched::unpin_current_thread();
    }

    if target_level < DISPATCH {
        crate::sched::check_resched();
    }
}

/// Returns the current IRQL level (without the pin bit).
pub fn get() -> u8 {
    level_of(slot().load(Ordering::Acquire))
}

/// Runs `f` with the IRQL raised to at least `level`, restoring the prior
/// IRQL afterward regardless of how `f` returns.
pub fn with_raised<R>(level: u8, f: impl FnOnce() -> R) -> R {
    let old = raise(level);
    let result = f();
    lower(old);
    result
}

/// Marks the IRQL machinery live on the calling CPU. Must run once per CPU
/// before any `raise`/`lower` pair on that CPU.
pub fn init_cpu() {
    slot().store(PASSIVE, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::Ordering;

    fn reset() {
        slot().store(PASSIVE, Ordering::SeqCst);
    }

    #[test]
    fn raise_then_lower_round_trips() {
        reset();
        let old = raise(DISPATCH);
        assert_eq!(get(), DISPATCH);
        lower(old);
        assert_eq!(get(), PASSIVE);
    }

    #[test]
    #[should_panic]
    fn raise_below_current_panics() {
        reset();
        raise(HIGH);
        raise(PASSIVE);
    }

    #[test]
    #[should_panic]
    fn lower_above_current_panics() {
        reset();
        let _ = raise(DISPATCH);
        lower(HIGH & LEVEL_MASK | PINNED_BIT); // fabricate an "old" above current
    }

    #[test]
    fn nested_raise_preserves_pin_bit_for_matching_lower() {
        reset();
        let old1 = raise(DISPATCH); // pins
        let old2 = raise(HIGH); // already pinned, doesn't re-pin
        assert!(was_pinned(slot().load(Ordering::SeqCst)));
        lower(old2);
        assert!(was_pinned(slot().load(Ordering::SeqCst)));
        lower(old1);
        assert_eq!(get(), PASSIVE);
    }

    #[test]
    fn separate_cpu_slots_do_not_interfere() {
        let a = &CURRENT[0];
        let b = &CURRENT[1];
        a.store(PASSIVE, Ordering::SeqCst);
        b.store(PASSIVE, Ordering::SeqCst);
        a.store(HIGH, Ordering::SeqCst);
        assert_eq!(level_of(b.load(Ordering::SeqCst)), PASSIVE);
    }
}
