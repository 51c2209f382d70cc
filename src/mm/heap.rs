/*
 * Kernel heap
 *
 * Maps a fixed virtual range through `mm::paging`, one 4 KiB page at a
 * time, backed by frames from the buddy allocator, then hands the whole
 * range to the crate's single `#[global_allocator]` (declared in
 * `lib.rs`, reused here rather than redeclared: there is exactly one
 * `linked_list_allocator::LockedHeap` for the whole kernel).
 */

use x86_64::structures::paging::PageTableFlags;

use crate::mm::{buddy, paging};
use crate::ALLOCATOR;

const HEAP_BASE: u64 = 0xFFFF_F000_0000_0000;
const HEAP_SIZE: u64 = 16 * 1024 * 1024; // 16 MiB

pub fn init() {
    let page_count = HEAP_SIZE / crate::mm::PAGE_SIZE;
    for i in 0..page_count {
        let virt = HEAP_BASE + i * crate::mm::PAGE_SIZE;
        let frame = buddy::alloc_order(0).expect("kernel heap: out of physical memory during init");
        paging::map_4k(virt, frame.start_address(), PageTableFlags::WRITABLE)
            .expect("kernel heap: failed to map initial range");
    }

    unsafe {
        ALLOCATOR.lock().init(HEAP_BASE as *mut u8, HEAP_SIZE as usize);
    }

    log::info!(target: "mm", "kernel heap initialized: {} bytes at {:#x}", HEAP_SIZE, HEAP_BASE);
}
