/*
 * Memory management
 *
 * Three-stage physical allocator (§4.9): a boot-time bitmap (`pmm`) seeds
 * a per-order buddy allocator (`buddy`), which is in turn wrapped per
 * scheduler domain with an arena ring and a NUMA-distance zonelist
 * (`domain_buddy`) once topology is known. Sub-2 MiB allocations go
 * through a hugepage sub-allocator (`hugepage`); kernel virtual address
 * space is handed out per-CPU by `vas`; `heap` wires the whole stack up
 * behind the global `linked_list_allocator`; `paging` owns the page
 * tables everything above ultimately writes through.
 *
 * Bring-up order mirrors the stages above: `pmm` first (it is the only
 * stage that can run before any heap-backed container exists), then
 * `buddy` once the bitmap has handed it enough frames for its free
 * lists, then `domain_buddy`/`hugepage`/`vas`/`heap` which all need
 * `alloc::Vec`/`BTreeMap`.
 */

pub mod buddy;
pub mod domain_buddy;
pub mod heap;
pub mod hugepage;
pub mod paging;
pub mod pmm;
pub mod vas;

use core::sync::atomic::{AtomicU64, Ordering};

use crate::boot::BootInfo;

/// 4 KiB, fixed by the x86-64 page table format.
pub const PAGE_SIZE: u64 = 4096;
/// 2 MiB, the x86-64 PD-level large page size `hugepage` sub-allocates.
pub const HUGEPAGE_SIZE: u64 = 2 * 1024 * 1024;

/// A 4 KiB-aligned physical frame, identified by its base address.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysFrame(u64);

impl PhysFrame {
    pub const SIZE: u64 = PAGE_SIZE;

    pub fn containing_address(addr: u64) -> Self {
        Self(addr & !(Self::SIZE - 1))
    }

    pub fn start_address(self) -> u64 {
        self.0
    }
}

static HHDM_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Physical -> virtual offset of the high-half direct map. Set once from
/// `BootInfo` during `init`; `paging` uses it to reach any physical frame
/// (page tables included) without walking through the page tables it is
/// itself trying to read.
pub fn hhdm_offset() -> u64 {
    HHDM_OFFSET.load(Ordering::Relaxed)
}

pub fn init(boot_info: &BootInfo) {
    HHDM_OFFSET.store(boot_info.hhdm_offset, Ordering::Relaxed);

    pmm::init_from_boot_info(boot_info);
    buddy::init_from_pmm();
    domain_buddy::init(boot_info.cpu_count());
    hugepage::init();
    vas::init(boot_info.cpu_count());
    heap::init();

    log::info!(target: "mm", "memory management initialized");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phys_frame_rounds_down_to_page_boundary() {
        let f = PhysFrame::containing_address(0x1000 + 123);
        assert_eq!(f.start_address(), 0x1000);
    }
}
