/*
 * Per-CPU kernel virtual address space allocator
 *
 * The kernel virtual range is split evenly into one sub-range per CPU so
 * the common case (a CPU mapping memory for itself) never contends with
 * any other CPU's allocator. Each sub-range tracks its free spans in a
 * `BTreeMap<start, length>` keyed by start address (standing in for the
 * red-black tree the spec describes, per DESIGN.md's RB-tree decision) so
 * the first-fit search is an ordered walk and adjacent-free-span
 * coalescing on `free` is a pair of neighbor lookups rather than a linear
 * scan.
 *
 * `alloc` tries the calling CPU's own sub-range first; if it's
 * exhausted, it falls back to scanning every other CPU's sub-range
 * (§4.9's "falls back to iterating other CPUs" for the general VAS
 * allocator, distinct from the hugepage heap's own fixed range).
 */

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::sync::spinlock::Spinlock;
use crate::utils::error::MemoryError;

const VAS_BASE: u64 = 0xFFFF_A000_0000_0000;
const VAS_END: u64 = 0xFFFF_AFFF_FFFF_FFFF;

struct SubRange {
    /// Free span start -> length, coalesced on insert.
    free: BTreeMap<u64, u64>,
}

impl SubRange {
    fn new(base: u64, len: u64) -> Self {
        let mut free = BTreeMap::new();
        free.insert(base, len);
        Self { free }
    }

    fn alloc(&mut self, size: u64, align: u64) -> Option<u64> {
        let align = align.max(1);
        let mut found: Option<(u64, u64)> = None;
        for (&start, &len) in self.free.iter() {
            let aligned_start = (start + align - 1) & !(align - 1);
            let pad = aligned_start - start;
            if len >= size + pad {
                found = Some((start, len));
                break;
            }
        }
        let (start, len) = found?;
        self.free.remove(&start);

        let align = align.max(1);
        let aligned_start = (start + align - 1) & !(align - 1);
        let pad = aligned_start - start;
        if pad > 0 {
            self.free.insert(start, pad);
        }
        let remainder_start = aligned_start + size;
        let remainder_len = len - pad - size;
        if remainder_len > 0 {
            self.free.insert(remainder_start, remainder_len);
        }
        Some(aligned_start)
    }

    /// Reinserts `[addr, addr+size)` and merges with whichever neighbor
    /// spans (below and/or above) are directly adjacent.
    fn free(&mut self, addr: u64, size: u64) {
        let mut start = addr;
        let mut len = size;

        if let Some((&prev_start, &prev_len)) = self.free.range(..start).next_back() {
            if prev_start + prev_len == start {
                self.free.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }
        if let Some((&next_start, &next_len)) = self.free.range(start + len..).next() {
            if next_start == start + len {
                self.free.remove(&next_start);
                len += next_len;
            }
        }
        self.free.insert(start, len);
    }
}

struct State {
    ranges: Vec<Spinlock<SubRange>>,
}

static STATE: spin::Once<State> = spin::Once::new();

fn state() -> &'static State {
    STATE.call_once(|| State { ranges: Vec::new() })
}

pub fn init(ncpus: usize) {
    let ncpus = ncpus.max(1);
    let total = VAS_END - VAS_BASE + 1;
    let per_cpu = total / ncpus as u64;

    let ranges: Vec<Spinlock<SubRange>> = (0..ncpus)
        .map(|i| {
            let base = VAS_BASE + i as u64 * per_cpu;
            Spinlock::new(SubRange::new(base, per_cpu))
        })
        .collect();

    STATE.call_once(|| State { ranges });
    log::info!(target: "mm", "vas initialized: {} cpu sub-range(s) of {} bytes each", ncpus, per_cpu);
}

fn owning_sub_range(addr: u64) -> Option<usize> {
    let s = state();
    if s.ranges.is_empty() || addr < VAS_BASE {
        return None;
    }
    let total = VAS_END - VAS_BASE + 1;
    let per_cpu = total / s.ranges.len() as u64;
    let idx = ((addr - VAS_BASE) / per_cpu) as usize;
    if idx < s.ranges.len() {
        Some(idx)
    } else {
        None
    }
}

/// Allocates `size` bytes aligned to `align`, preferring `cpu`'s own
/// sub-range before falling back to every other CPU's.
pub fn alloc(cpu: crate::sched::CpuId, size: u64, align: u64) -> Result<u64, MemoryError> {
    if !align.is_power_of_two() {
        return Err(MemoryError::InvalidAlignment);
    }
    let s = state();
    if s.ranges.is_empty() {
        return Err(MemoryError::OutOfAddressSpace);
    }

    let home = cpu.as_usize() % s.ranges.len();
    if let Some(addr) = s.ranges[home].lock().alloc(size, align) {
        return Ok(addr);
    }
    for (idx, range) in s.ranges.iter().enumerate() {
        if idx == home {
            continue;
        }
        if let Some(addr) = range.lock().alloc(size, align) {
            return Ok(addr);
        }
    }
    Err(MemoryError::OutOfAddressSpace)
}

pub fn free(addr: u64, size: u64) {
    let Some(idx) = owning_sub_range(addr) else {
        debug_assert!(false, "vas::free: address not in the managed range");
        return;
    };
    state().ranges[idx].lock().free(addr, size);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::CpuId;

    #[test]
    fn alloc_then_free_allows_full_reuse() {
        crate::irql::init_cpu();
        let mut r = SubRange::new(0x1000, 0x10000);
        let a = r.alloc(0x100, 0x10).unwrap();
        r.free(a, 0x100);
        assert_eq!(r.free.len(), 1);
        assert_eq!(*r.free.get(&0x1000).unwrap(), 0x10000);
    }

    #[test]
    fn alloc_respects_alignment() {
        let mut r = SubRange::new(0x1003, 0x10000);
        let a = r.alloc(0x40, 0x1000).unwrap();
        assert_eq!(a % 0x1000, 0);
    }

    #[test]
    fn falls_back_to_other_cpu_when_home_exhausted() {
        crate::irql::init_cpu();
        init(2);
        let s = state();
        let home = 0usize;
        // Drain CPU 0's entire sub-range in one allocation.
        let total = (VAS_END - VAS_BASE + 1) / 2;
        let first = s.ranges[home].lock().alloc(total, 1).unwrap();
        assert!(alloc(CpuId(0), 64, 8).is_ok());
        let _ = first;
    }
}
