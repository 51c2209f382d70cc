/*
 * TLB shootdown
 *
 * Invalidating a page table entry that might be cached in another CPU's
 * TLB requires telling that CPU to flush it. Each CPU owns a small
 * lock-free ring of pending invalidation addresses; the initiator posts
 * into every target CPU's ring, bumps a per-target "request generation",
 * and sends an IPI (left to `arch`); the target's IPI handler drains its
 * ring and bumps its own "done generation" back up to match. `shootdown`
 * blocks (spinning, since it typically runs with IRQL >= DISPATCH and
 * cannot sleep) until every target's done generation has caught up.
 *
 * A ring that overflows falls back to `flush_all` for that CPU rather
 * than losing an invalidation — correctness over precision.
 */

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::sched::CpuId;

const RING_CAPACITY: usize = 32;
const MAX_CPUS: usize = 256;

struct Ring {
    addrs: [AtomicU64; RING_CAPACITY],
    head: AtomicUsize,
    tail: AtomicUsize,
    overflowed: core::sync::atomic::AtomicBool,
}

impl Ring {
    const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            addrs: [ZERO; RING_CAPACITY],
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            overflowed: core::sync::atomic::AtomicBool::new(false),
        }
    }

    fn push(&self, addr: u64) {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= RING_CAPACITY {
            self.overflowed.store(true, Ordering::Release);
            return;
        }
        self.addrs[tail % RING_CAPACITY].store(addr, Ordering::Relaxed);
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
    }

    /// Drains every pending address, invoking `flush_one` for each, or a
    /// single `flush_all` if the ring overflowed since the last drain.
    fn drain(&self, flush_one: impl Fn(u64), flush_all: impl FnOnce()) {
        if self.overflowed.swap(false, Ordering::AcqRel) {
            flush_all();
            self.head.store(self.tail.load(Ordering::Acquire), Ordering::Release);
            return;
        }
        loop {
            let head = self.head.load(Ordering::Relaxed);
            let tail = self.tail.load(Ordering::Acquire);
            if head == tail {
                break;
            }
            let addr = self.addrs[head % RING_CAPACITY].load(Ordering::Relaxed);
            self.head.store(head.wrapping_add(1), Ordering::Release);
            flush_one(addr);
        }
    }
}

struct PerCpu {
    ring: Ring,
    request_gen: AtomicU64,
    done_gen: AtomicU64,
}

impl PerCpu {
    const fn new() -> Self {
        Self { ring: Ring::new(), request_gen: AtomicU64::new(0), done_gen: AtomicU64::new(0) }
    }
}

static PER_CPU: [PerCpu; MAX_CPUS] = {
    const INIT: PerCpu = PerCpu::new();
    [INIT; MAX_CPUS]
};

pub fn init() {
    log::info!(target: "tlb", "TLB shootdown subsystem initialized");
}

fn slot(cpu: CpuId) -> &'static PerCpu {
    &PER_CPU[cpu.as_usize().min(MAX_CPUS - 1)]
}

/// Invalidates `addr` on every CPU in `targets` and blocks until each has
/// acknowledged. `targets` excludes the calling CPU — a single-page
/// invalidation on the local CPU is just `arch::tlb_invalidate(addr)`
/// directly, no shootdown needed.
pub fn shootdown(targets: &[CpuId], addr: u64) {
    let mut waiting: Vec<(CpuId, u64)> = Vec::with_capacity(targets.len());
    for &cpu in targets {
        let s = slot(cpu);
        s.ring.push(addr);
        let gen = s.request_gen.fetch_add(1, Ordering::AcqRel) + 1;
        waiting.push((cpu, gen));
        // A real IPI send lives in `arch`; this module only tracks the
        // generation convergence the handler on the other side drives.
    }
    for (cpu, gen) in waiting {
        let s = slot(cpu);
        while s.done_gen.load(Ordering::Acquire) < gen {
            core::hint::spin_loop();
        }
    }
}

/// Invoked by the IPI handler on the target CPU: drains its own ring,
/// actually invalidating each address (or everything, on overflow), then
/// publishes a matching done generation so shootdown callers waiting on
/// it unblock.
pub fn handle_ipi(cpu: CpuId, flush_one: impl Fn(u64), flush_all: impl FnOnce()) {
    let s = slot(cpu);
    let target_gen = s.request_gen.load(Ordering::Acquire);
    s.ring.drain(flush_one, flush_all);
    s.done_gen.store(target_gen, Ordering::Release);
}

pub fn pending_overflow(cpu: CpuId) -> bool {
    slot(cpu).ring.overflowed.load(Ordering::Acquire)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicU32, Ordering as O};

    #[test]
    fn ring_overflow_falls_back_to_flush_all() {
        let ring = Ring::new();
        for i in 0..(RING_CAPACITY as u64 + 1) {
            ring.push(i);
        }
        assert!(ring.overflowed.load(Ordering::SeqCst));
        static FLUSH_ALL_CALLS: AtomicU32 = AtomicU32::new(0);
        static FLUSH_ONE_CALLS: AtomicU32 = AtomicU32::new(0);
        ring.drain(
            |_| {
                FLUSH_ONE_CALLS.fetch_add(1, O::SeqCst);
            },
            || {
                FLUSH_ALL_CALLS.fetch_add(1, O::SeqCst);
            },
        );
        assert_eq!(FLUSH_ALL_CALLS.load(O::SeqCst), 1);
        assert_eq!(FLUSH_ONE_CALLS.load(O::SeqCst), 0);
    }

    #[test]
    fn shootdown_unblocks_once_ipi_handled() {
        // `shootdown` spins until the target's done generation catches up,
        // so the handler has to run concurrently from another OS thread
        // here (standing in for the real IPI handler running on CPU 5).
        let handler = std::thread::spawn(|| {
            std::thread::sleep(std::time::Duration::from_millis(5));
            handle_ipi(CpuId(5), |_| {}, || {});
        });
        shootdown(&[CpuId(5)], 0x1000);
        handler.join().unwrap();
    }
}
