/*
 * Hugepage sub-allocator
 *
 * Backs sub-2 MiB allocations (the slab/kmalloc path) with 2 MiB hugepages,
 * each carrying a 512-bit bitmap (one bit per 4 KiB page) plus a
 * last-allocated-index hint so the common single-page fast path doesn't
 * rescan the whole bitmap. Each CPU owns a min-heap of its own hugepages
 * keyed by virtual base (`BinaryHeap<Reverse<...>>` standing in for the
 * original's intrusive min-heap, per DESIGN.md's RB/heap-as-safe-container
 * decision): the heap root is always a hugepage with room, so allocation
 * doesn't have to scan every hugepage a CPU owns.
 *
 * When a hugepage empties (`pages_used` hits zero) it moves to a per-CPU
 * GC list instead of being unmapped immediately, up to
 * `HUGEPAGE_GC_LIST_MAX_HUGEPAGES`; past the cap the oldest GC entry is
 * actually unmapped and freed back to the buddy. `gc_sweep` is the named
 * stub §9 asks fidelity reimplementations to preserve explicitly rather
 * than invent a policy for: it only ever does the move described above,
 * never a background reclaim heuristic.
 */

use alloc::collections::BinaryHeap;
use alloc::vec::Vec;
use core::cmp::Reverse;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::mm::{buddy, paging, PhysFrame, HUGEPAGE_SIZE, PAGE_SIZE};
use crate::sched::CpuId;
use crate::sync::spinlock::Spinlock;
use crate::utils::error::MemoryError;

pub const HUGEPAGE_GC_LIST_MAX_HUGEPAGES: usize = 16;
const BITMAP_WORDS: usize = 8; // 8 * 64 = 512 bits, one per 4 KiB page
const PAGES_PER_HUGEPAGE: u32 = 512;
const HUGEPAGE_HEAP_BASE: u64 = 0xFFFF_E000_0000_0000;
const HUGEPAGE_ORDER: usize = 9; // 2^9 * 4 KiB = 2 MiB

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct HugepageFlags: u8 {
        /// Pinned to its owning core; never donated or GC'd away.
        const PINNED    = 1 << 0;
        /// Pulled back out of the GC list rather than freshly carved.
        const RECYCLED  = 1 << 1;
        /// Donated from a domain arena rather than the buddy directly.
        const ARENA     = 1 << 2;
        /// Scratch memory outside the allocator/arena bookkeeping.
        const UNTRACKED = 1 << 3;
    }
}

pub struct Hugepage {
    phys_base: u64,
    virt_base: u64,
    pages_used: u32,
    last_allocated_idx: u32,
    pub flags: HugepageFlags,
    pub owner_core: CpuId,
    bitmap: [u64; BITMAP_WORDS],
}

impl Hugepage {
    fn bit_test(&self, idx: u32) -> bool {
        (self.bitmap[idx as usize / 64] >> (idx % 64)) & 1 != 0
    }

    fn bit_set(&mut self, idx: u32) {
        self.bitmap[idx as usize / 64] |= 1 << (idx % 64);
    }

    fn bit_clear(&mut self, idx: u32) {
        self.bitmap[idx as usize / 64] &= !(1 << (idx % 64));
    }

    fn has_room(&self) -> bool {
        self.pages_used < PAGES_PER_HUGEPAGE
    }

    /// Scans from `last_allocated_idx` for `count` contiguous clear bits;
    /// wraps once if the tail scan finds nothing.
    fn find_free_run(&self, count: u32) -> Option<u32> {
        let start = self.last_allocated_idx;
        for pass in 0..2 {
            let base = if pass == 0 { start } else { 0 };
            let limit = if pass == 0 { PAGES_PER_HUGEPAGE } else { start };
            let mut idx = base;
            while idx + count <= limit {
                if (idx..idx + count).all(|i| !self.bit_test(i)) {
                    return Some(idx);
                }
                idx += 1;
            }
        }
        None
    }

    fn alloc_run(&mut self, idx: u32, count: u32) -> u64 {
        for i in idx..idx + count {
            self.bit_set(i);
        }
        self.pages_used += count;
        self.last_allocated_idx = (idx + count) % PAGES_PER_HUGEPAGE;
        self.virt_base + (idx as u64) * PAGE_SIZE
    }

    fn free_run(&mut self, virt: u64, count: u32) {
        let idx = ((virt - self.virt_base) / PAGE_SIZE) as u32;
        for i in idx..idx + count {
            debug_assert!(self.bit_test(i), "double free inside hugepage");
            self.bit_clear(i);
        }
        self.pages_used = self.pages_used.saturating_sub(count);
    }

    fn contains(&self, virt: u64) -> bool {
        virt >= self.virt_base && virt < self.virt_base + HUGEPAGE_SIZE
    }
}

/// Ordering key for the per-CPU min-heap: lower virtual base sorts first.
struct HeapKey(u64);
impl PartialEq for HeapKey {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for HeapKey {}
impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

struct PerCpuHeap {
    /// `BinaryHeap` is a max-heap; wrapping in `Reverse` with the hugepage
    /// index into `ALL` gives min-by-virt-base ordering over whichever
    /// hugepage is cheapest to reach next.
    heap: BinaryHeap<Reverse<(HeapKey, usize)>>,
    gc_list: Vec<usize>,
}

impl PerCpuHeap {
    fn new() -> Self {
        Self { heap: BinaryHeap::new(), gc_list: Vec::new() }
    }
}

static NEXT_HEAP_OFFSET: AtomicU64 = AtomicU64::new(0);
static ALL: Spinlock<Vec<Hugepage>> = Spinlock::new(Vec::new());
static PER_CPU: spin::Once<spin::Mutex<Vec<PerCpuHeap>>> = spin::Once::new();

fn per_cpu() -> &'static spin::Mutex<Vec<PerCpuHeap>> {
    PER_CPU.call_once(|| spin::Mutex::new(Vec::new()))
}

pub fn init() {
    per_cpu();
    log::info!(target: "mm", "hugepage sub-allocator initialized");
}

fn ensure_cpu_slot(cpus: &mut Vec<PerCpuHeap>, cpu: CpuId) {
    while cpus.len() <= cpu.as_usize() {
        cpus.push(PerCpuHeap::new());
    }
}

/// Carves a fresh 2 MiB hugepage from the buddy and maps it at the next
/// slot in the hugepage heap's fixed virtual range.
fn create_new_hugepage(owner: CpuId) -> Result<usize, MemoryError> {
    let frame = buddy::alloc_order(HUGEPAGE_ORDER)?;
    let offset = NEXT_HEAP_OFFSET.fetch_add(HUGEPAGE_SIZE, Ordering::Relaxed);
    let virt_base = HUGEPAGE_HEAP_BASE + offset;

    paging::map_2m_kernel(virt_base, frame.start_address())?;

    let hp = Hugepage {
        phys_base: frame.start_address(),
        virt_base,
        pages_used: 0,
        last_allocated_idx: 0,
        flags: HugepageFlags::empty(),
        owner_core: owner,
        bitmap: [0; BITMAP_WORDS],
    };

    let mut all = ALL.lock();
    all.push(hp);
    Ok(all.len() - 1)
}

/// Pulls a hugepage from `cpu`'s GC list if one exists (tagging it
/// `RECYCLED`), else carves a fresh one via `create_new_hugepage`.
fn alloc_hugepage(cpu: CpuId) -> Result<usize, MemoryError> {
    let mut cpus = per_cpu().lock();
    ensure_cpu_slot(&mut cpus, cpu);
    if let Some(idx) = cpus[cpu.as_usize()].gc_list.pop() {
        let mut all = ALL.lock();
        all[idx].flags |= HugepageFlags::RECYCLED;
        return Ok(idx);
    }
    drop(cpus);
    create_new_hugepage(cpu)
}

/// Allocates `page_count` contiguous 4 KiB pages from `cpu`'s hugepage
/// heap, pulling the root of its min-heap first and falling further back
/// to a fresh/recycled hugepage only if none currently has room.
pub fn alloc_pages(cpu: CpuId, page_count: u32) -> Result<u64, MemoryError> {
    if page_count == 0 || page_count as u64 > PAGES_PER_HUGEPAGE as u64 {
        return Err(MemoryError::InvalidAlignment);
    }

    loop {
        let candidate_idx = {
            let mut cpus = per_cpu().lock();
            ensure_cpu_slot(&mut cpus, cpu);
            let per_cpu_heap = &mut cpus[cpu.as_usize()];
            let mut parked = Vec::new();
            let mut found = None;
            while let Some(Reverse((key, idx))) = per_cpu_heap.heap.pop() {
                let all = ALL.lock();
                if all[idx].has_room() {
                    found = Some(idx);
                    parked.push(Reverse((key, idx)));
                    break;
                }
                // Emptied out from under the heap (shouldn't normally
                // happen, a full hugepage is removed on the allocating
                // side below) — just drop it from this CPU's heap.
            }
            for entry in parked {
                per_cpu_heap.heap.push(entry);
            }
            found
        };

        let idx = match candidate_idx {
            Some(idx) => idx,
            None => alloc_hugepage(cpu)?,
        };

        let mut all = ALL.lock();
        let hp = &mut all[idx];
        if let Some(start) = hp.find_free_run(page_count) {
            let addr = hp.alloc_run(start, page_count);
            let full = !hp.has_room();
            let virt_base = hp.virt_base;
            drop(all);

            let mut cpus = per_cpu().lock();
            ensure_cpu_slot(&mut cpus, cpu);
            let per_cpu_heap = &mut cpus[cpu.as_usize()];
            if !per_cpu_heap.heap.iter().any(|Reverse((_, i))| *i == idx) && !full {
                per_cpu_heap.heap.push(Reverse((HeapKey(virt_base), idx)));
            }
            return Ok(addr);
        }
        // Raced with another allocator on the same hugepage; try again.
    }
}

pub fn alloc_page(cpu: CpuId) -> Result<u64, MemoryError> {
    alloc_pages(cpu, 1)
}

/// Finds the hugepage owning `virt` (linear scan — the original's
/// hugepage translation buffer is `mm::vas`'s concern for general virtual
/// lookups; this one only ever runs on the free path where the caller
/// already knows it allocated through this sub-allocator).
fn find_owning(virt: u64) -> Option<usize> {
    let all = ALL.lock();
    all.iter().position(|hp| hp.contains(virt))
}

pub fn free_pages(virt: u64, page_count: u32) {
    let Some(idx) = find_owning(virt) else {
        debug_assert!(false, "free_pages: address not owned by any hugepage");
        return;
    };

    let (owner, now_empty) = {
        let mut all = ALL.lock();
        let hp = &mut all[idx];
        hp.free_run(virt, page_count);
        (hp.owner_core, hp.pages_used == 0)
    };

    if now_empty {
        gc_sweep(owner, idx);
    }
}

pub fn free_page(virt: u64) {
    free_pages(virt, 1);
}

/// Moves an emptied hugepage to its owner's GC list, up to the cap; past
/// the cap it is unmapped and its frame returned to the buddy. This is the
/// entire GC policy — no background scan, no heuristic reuse order beyond
/// "most recently emptied first" (a stack, not a queue).
fn gc_sweep(owner: CpuId, idx: usize) {
    let mut cpus = per_cpu().lock();
    ensure_cpu_slot(&mut cpus, owner);
    let per_cpu_heap = &mut cpus[owner.as_usize()];
    per_cpu_heap.heap.retain(|Reverse((_, i))| *i != idx);

    if per_cpu_heap.gc_list.len() < HUGEPAGE_GC_LIST_MAX_HUGEPAGES {
        per_cpu_heap.gc_list.push(idx);
        return;
    }
    drop(cpus);

    let (phys_base, virt_base) = {
        let all = ALL.lock();
        (all[idx].phys_base, all[idx].virt_base)
    };
    paging::unmap_2m(virt_base);
    buddy::free_order(PhysFrame::containing_address(phys_base), HUGEPAGE_ORDER);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_round_trips_alloc_and_free_within_one_hugepage() {
        let mut hp = Hugepage {
            phys_base: 0,
            virt_base: 0x1000_0000,
            pages_used: 0,
            last_allocated_idx: 0,
            flags: HugepageFlags::empty(),
            owner_core: CpuId(0),
            bitmap: [0; BITMAP_WORDS],
        };
        let idx = hp.find_free_run(4).unwrap();
        let addr = hp.alloc_run(idx, 4);
        assert_eq!(hp.pages_used, 4);
        hp.free_run(addr, 4);
        assert_eq!(hp.pages_used, 0);
        assert_eq!(hp.bitmap, [0; BITMAP_WORDS]);
    }

    #[test]
    fn find_free_run_skips_allocated_region() {
        let mut hp = Hugepage {
            phys_base: 0,
            virt_base: 0,
            pages_used: 0,
            last_allocated_idx: 0,
            flags: HugepageFlags::empty(),
            owner_core: CpuId(0),
            bitmap: [0; BITMAP_WORDS],
        };
        hp.alloc_run(0, 10);
        let next = hp.find_free_run(1).unwrap();
        assert_eq!(next, 10);
    }
}
