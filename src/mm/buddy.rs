/*
 * Buddy allocator (stage 2)
 *
 * Per-order free lists over power-of-two frame-count blocks, up to
 * `MAX_ORDER`. `alloc` rounds a request up to the smallest sufficient
 * order, splitting a larger free block if no block of the exact order is
 * free; `free` coalesces with the block's buddy (found by flipping the
 * one address bit that distinguishes the two halves of the parent block)
 * repeatedly while the buddy is itself free, walking up toward
 * `MAX_ORDER`.
 *
 * `init_from_pmm` drains the boot-time bitmap one frame at a time and
 * feeds each into `free`, so whatever coalescing the buddy can do happens
 * naturally as frames are handed over; once the bitmap reports no more
 * free frames, the buddy is the sole owner of physical memory.
 */

use alloc::vec::Vec;

use crate::mm::{pmm, PhysFrame};
use crate::utils::error::MemoryError;

pub const MAX_ORDER: usize = 10; // 2^10 * 4 KiB = 4 MiB, largest single block

struct Buddy {
    free_lists: [Vec<u64>; MAX_ORDER + 1],
}

impl Buddy {
    fn new() -> Self {
        Self { free_lists: core::array::from_fn(|_| Vec::new()) }
    }

    fn block_size(order: usize) -> u64 {
        PhysFrame::SIZE << order
    }

    fn buddy_of(addr: u64, order: usize) -> u64 {
        addr ^ Self::block_size(order)
    }

    fn insert_coalescing(&mut self, mut addr: u64, mut order: usize) {
        while order < MAX_ORDER {
            let buddy = Self::buddy_of(addr, order);
            let list = &mut self.free_lists[order];
            if let Some(pos) = list.iter().position(|&a| a == buddy) {
                list.swap_remove(pos);
                addr = addr.min(buddy);
                order += 1;
            } else {
                break;
            }
        }
        self.free_lists[order].push(addr);
    }

    fn alloc(&mut self, order: usize) -> Option<u64> {
        if order > MAX_ORDER {
            return None;
        }
        if let Some(addr) = self.free_lists[order].pop() {
            return Some(addr);
        }
        // No block of this order; split the smallest larger order that has one.
        let mut split_order = order + 1;
        while split_order <= MAX_ORDER {
            if let Some(addr) = self.free_lists[split_order].pop() {
                // Walk back down, keeping one half and freeing the other at
                // each level until we reach the requested order.
                let mut cur_order = split_order;
                let mut cur_addr = addr;
                while cur_order > order {
                    cur_order -= 1;
                    let half_size = Self::block_size(cur_order);
                    let buddy_half = cur_addr + half_size;
                    self.free_lists[cur_order].push(buddy_half);
                }
                return Some(cur_addr);
            }
            split_order += 1;
        }
        None
    }

    fn free(&mut self, addr: u64, order: usize) {
        self.insert_coalescing(addr, order);
    }
}

static BUDDY: spin::Once<spin::Mutex<Buddy>> = spin::Once::new();

fn buddy() -> &'static spin::Mutex<Buddy> {
    BUDDY.call_once(|| spin::Mutex::new(Buddy::new()))
}

/// Smallest order whose block size is >= `size` bytes.
pub fn order_for_size(size: u64) -> usize {
    let pages = size.div_ceil(PhysFrame::SIZE).max(1);
    let mut order = 0;
    while (1u64 << order) < pages {
        order += 1;
    }
    order
}

pub fn init_from_pmm() {
    let b = buddy();
    let mut guard = b.lock();
    let mut transferred = 0usize;
    while let Some(frame) = pmm::alloc_frame() {
        guard.free(frame.start_address(), 0);
        transferred += 1;
    }
    log::info!(target: "mm", "buddy allocator took ownership of {} frames from pmm", transferred);
}

pub fn alloc_order(order: usize) -> Result<PhysFrame, MemoryError> {
    buddy()
        .lock()
        .alloc(order)
        .map(PhysFrame::containing_address)
        .ok_or(MemoryError::OutOfPhysicalMemory)
}

pub fn alloc_pages(page_count: u64) -> Result<PhysFrame, MemoryError> {
    alloc_order(order_for_size(page_count * PhysFrame::SIZE))
}

pub fn free_order(frame: PhysFrame, order: usize) {
    buddy().lock().free(frame.start_address(), order);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Buddy {
        Buddy::new()
    }

    #[test]
    fn alloc_splits_larger_block_when_exact_order_empty() {
        let mut b = fresh();
        b.free(0, 2); // one 16 KiB block
        let addr = b.alloc(0).expect("split should yield order-0 block");
        assert_eq!(addr, 0);
        // the other three order-0-equivalent siblings should now be free
        // at orders 0 and 1 from the split.
        assert!(!b.free_lists[0].is_empty() || !b.free_lists[1].is_empty());
    }

    #[test]
    fn free_coalesces_buddies_back_to_parent_order() {
        let mut b = fresh();
        let block = PhysFrame::containing_address(0).start_address();
        let size = Buddy::block_size(0);
        b.free(block, 0);
        b.free(block + size, 0);
        assert!(b.free_lists[0].is_empty());
        assert_eq!(b.free_lists[1], alloc::vec![block]);
    }

    #[test]
    fn order_for_size_rounds_up_to_power_of_two_pages() {
        assert_eq!(order_for_size(PhysFrame::SIZE), 0);
        assert_eq!(order_for_size(PhysFrame::SIZE + 1), 1);
        assert_eq!(order_for_size(4 * PhysFrame::SIZE), 2);
    }
}
