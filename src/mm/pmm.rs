/*
 * Physical frame allocator (stage 1: boot-time bitmap)
 *
 * One bit per 4 KiB frame, 0 = free / 1 = used. Seeded entirely used, then
 * every USABLE region from the boot memory map is cleared, then the
 * kernel's own load image is re-marked used so the allocator never hands
 * back a frame the kernel itself occupies.
 *
 * This is stage 1 of the three-stage PMM (bitmap -> buddy -> NUMA domain
 * buddy, see `mm::buddy`/`mm::domain_buddy`): it is what `mm::init` uses to
 * carve out the handful of frames the buddy allocator's own free lists
 * need before the buddy stage can become self-hosting.
 */

use crate::boot::{BootInfo, MemRegionKind};
use crate::mm::PhysFrame;

const MAX_FRAMES: usize = 262_144;
const BITMAP_LEN: usize = MAX_FRAMES / 64;

/// IMPORTANT: never take `&`/`&mut` to this static; only touch it via raw
/// pointers obtained from `addr_of!`/`addr_of_mut!`, since it is mutated
/// from frame-allocation fast paths that must stay lock-ordered beneath
/// the allocator spinlock rather than racing the borrow checker's view of
/// a single global `&mut`.
static mut FRAME_BITMAP: [u64; BITMAP_LEN] = [0; BITMAP_LEN];

static ALLOCATOR_LOCK: spin::Mutex<()> = spin::Mutex::new(());

/// Seeds the bitmap from the bootloader's memory map: every frame starts
/// used, USABLE regions are cleared, then the kernel's own image is
/// re-marked used so it's never handed out.
pub fn init_from_boot_info(boot_info: &BootInfo) {
    let _lock = ALLOCATOR_LOCK.lock();

    unsafe {
        let ptr = core::ptr::addr_of_mut!(FRAME_BITMAP) as *mut u64;
        for i in 0..BITMAP_LEN {
            *ptr.add(i) = u64::MAX;
        }
    }

    for region in &boot_info.mmap {
        if region.kind != MemRegionKind::Usable {
            continue;
        }
        let start_frame = region.base / PhysFrame::SIZE;
        let end_frame = (region.base + region.length - 1) / PhysFrame::SIZE;
        for frame_num in start_frame..=end_frame {
            if (frame_num as usize) < MAX_FRAMES {
                mark_frame_free(frame_num as usize);
            }
        }
    }

    let start_frame = boot_info.kernel_phys_base / PhysFrame::SIZE;
    let end_frame = (boot_info.kernel_phys_end + PhysFrame::SIZE - 1) / PhysFrame::SIZE;
    for frame_num in start_frame..end_frame {
        if (frame_num as usize) < MAX_FRAMES {
            mark_frame_used(frame_num as usize);
        }
    }

    log::info!(target: "mm", "pmm bitmap initialized ({} frames managed)", MAX_FRAMES);
}

/// Scans for the first clear bit, sets it, and returns the frame it names.
pub fn alloc_frame() -> Option<PhysFrame> {
    let _lock = ALLOCATOR_LOCK.lock();
    unsafe {
        let ptr = core::ptr::addr_of_mut!(FRAME_BITMAP) as *mut u64;
        for word_idx in 0..BITMAP_LEN {
            let word_val = *ptr.add(word_idx);
            if word_val == u64::MAX {
                continue;
            }
            for bit_idx in 0..64 {
                let mask = 1u64 << bit_idx;
                if word_val & mask == 0 {
                    *ptr.add(word_idx) = word_val | mask;
                    let frame_num = word_idx * 64 + bit_idx;
                    if frame_num >= MAX_FRAMES {
                        return None;
                    }
                    return Some(PhysFrame::containing_address(frame_num as u64 * PhysFrame::SIZE));
                }
            }
        }
    }
    None
}

pub fn free_frame(frame: PhysFrame) {
    let _lock = ALLOCATOR_LOCK.lock();
    let frame_num = (frame.start_address() / PhysFrame::SIZE) as usize;
    if frame_num < MAX_FRAMES {
        mark_frame_free(frame_num);
    }
}

fn mark_frame_free(frame_num: usize) {
    let word_idx = frame_num / 64;
    let mask = 1u64 << (frame_num % 64);
    unsafe {
        let ptr = (core::ptr::addr_of_mut!(FRAME_BITMAP) as *mut u64).add(word_idx);
        *ptr &= !mask;
    }
}

fn mark_frame_used(frame_num: usize) {
    let word_idx = frame_num / 64;
    let mask = 1u64 << (frame_num % 64);
    unsafe {
        let ptr = (core::ptr::addr_of_mut!(FRAME_BITMAP) as *mut u64).add(word_idx);
        *ptr |= mask;
    }
}

/// `(used_frames, total_frames)`.
pub fn stats() -> (usize, usize) {
    let _lock = ALLOCATOR_LOCK.lock();
    let mut used = 0;
    unsafe {
        let ptr = core::ptr::addr_of!(FRAME_BITMAP) as *const u64;
        for i in 0..BITMAP_LEN {
            used += (*ptr.add(i)).count_ones() as usize;
        }
    }
    (used, MAX_FRAMES)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::MemRegion;
    use alloc::vec;

    fn reset() {
        unsafe {
            let ptr = core::ptr::addr_of_mut!(FRAME_BITMAP) as *mut u64;
            for i in 0..BITMAP_LEN {
                *ptr.add(i) = u64::MAX;
            }
        }
    }

    fn test_boot_info(usable_base: u64, usable_len: u64) -> BootInfo {
        BootInfo {
            mmap: vec![MemRegion { base: usable_base, length: usable_len, kind: MemRegionKind::Usable }],
            hhdm_offset: 0,
            rsdp: None,
            cpus: vec![],
            framebuffer: None,
            kernel_phys_base: 0,
            kernel_phys_end: 0,
        }
    }

    #[test]
    fn alloc_then_free_returns_bitmap_to_prior_state() {
        reset();
        let boot_info = test_boot_info(0x10_0000, 16 * PhysFrame::SIZE);
        init_from_boot_info(&boot_info);
        let (used_before, _) = stats();
        let frame = alloc_frame().expect("frame available");
        assert_eq!(stats().0, used_before + 1);
        free_frame(frame);
        assert_eq!(stats().0, used_before);
    }

    #[test]
    fn kernel_frames_are_not_allocatable() {
        reset();
        let mut boot_info = test_boot_info(0x10_0000, 16 * PhysFrame::SIZE);
        boot_info.kernel_phys_base = 0x10_0000;
        boot_info.kernel_phys_end = 0x10_0000 + 4 * PhysFrame::SIZE;
        init_from_boot_info(&boot_info);
        for _ in 0..12 {
            let f = alloc_frame().expect("frame available");
            assert!(f.start_address() >= boot_info.kernel_phys_end || f.start_address() < boot_info.kernel_phys_base);
        }
    }
}
