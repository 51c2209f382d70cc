/*
 * Page tables
 *
 * Walks and edits the 4-level x86-64 page tables using the `x86_64`
 * crate's own `PageTable`/`PageTableFlags`/`PageTableEntry` types (already
 * a dependency for the GDT/IDT, see `arch::x86_64::{gdt,idt}`) rather than
 * hand-rolling the entry format: the bit layout is exactly the CPU's, so
 * there is nothing this crate's own wrapper would add beyond what
 * `x86_64::structures::paging` already gets right.
 *
 * Every physical frame a table entry names is reached through the HHDM
 * (`mm::hhdm_offset`), matching every other stage of `mm` — this module
 * never walks the identity map BOOTBOOT itself sets up past boot.
 *
 * This CORE has no userspace surface (see SPEC_FULL.md's REDESIGN FLAGS),
 * so there is exactly one address space: the kernel's own PML4. There is
 * no `alloc_pml4`/`copy_pml4_entry` pair for spinning up a second,
 * process-owned address space.
 */

use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::{Page, PageTable, PageTableFlags, PhysFrame as X86PhysFrame, Size4KiB};
use x86_64::{PhysAddr, VirtAddr};

use crate::mm::{buddy, hhdm_offset};
use crate::sync::spinlock::Spinlock;
use crate::utils::error::MemoryError;

static TABLE_LOCK: Spinlock<()> = Spinlock::new(());

fn phys_to_virt(phys: u64) -> u64 {
    phys + hhdm_offset()
}

unsafe fn table_at(phys: u64) -> &'static mut PageTable {
    let ptr = phys_to_virt(phys) as *mut PageTable;
    unsafe { &mut *ptr }
}

fn active_pml4_phys() -> u64 {
    Cr3::read().0.start_address().as_u64()
}

fn active_pml4() -> &'static mut PageTable {
    unsafe { table_at(active_pml4_phys()) }
}

/// Returns the next-level table named by `entry`, allocating and zeroing
/// a fresh frame for it first if the entry is unused.
fn next_level(table: &mut PageTable, index: usize, allocate: bool) -> Option<&'static mut PageTable> {
    let entry = &mut table[index];
    if entry.is_unused() {
        if !allocate {
            return None;
        }
        let frame = buddy::alloc_order(0).ok()?;
        let next = unsafe { table_at(frame.start_address()) };
        next.zero();
        entry.set_addr(
            PhysAddr::new(frame.start_address()),
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
        );
    }
    Some(unsafe { table_at(entry.addr().as_u64()) })
}

fn indices(virt: u64) -> (usize, usize, usize, usize) {
    let page = Page::<Size4KiB>::containing_address(VirtAddr::new(virt));
    (
        usize::from(page.p4_index()),
        usize::from(page.p3_index()),
        usize::from(page.p2_index()),
        usize::from(page.p1_index()),
    )
}

/// Walks the active page tables and returns the physical address `virt`
/// maps to, if any level along the way is present.
pub fn translate(virt: u64) -> Option<u64> {
    let _guard = TABLE_LOCK.lock();
    let (p4i, p3i, p2i, p1i) = indices(virt);
    let pml4 = active_pml4();

    let pdpt = next_level(pml4, p4i, false)?;
    let pd = next_level(pdpt, p3i, false)?;

    let pd_entry = &pd[p2i];
    if pd_entry.flags().contains(PageTableFlags::HUGE_PAGE) {
        let base = pd_entry.addr().as_u64();
        return Some(base + (virt & (crate::mm::HUGEPAGE_SIZE - 1)));
    }
    if pd_entry.is_unused() {
        return None;
    }
    let pt = unsafe { table_at(pd_entry.addr().as_u64()) };
    let pt_entry = &pt[p1i];
    if pt_entry.is_unused() {
        return None;
    }
    Some(pt_entry.addr().as_u64() + (virt & (crate::mm::PAGE_SIZE - 1)))
}

/// Maps a single 4 KiB page, allocating any missing intermediate table
/// levels along the way.
pub fn map_4k(virt: u64, phys: u64, flags: PageTableFlags) -> Result<(), MemoryError> {
    let _guard = TABLE_LOCK.lock();
    let (p4i, p3i, p2i, p1i) = indices(virt);
    let pml4 = active_pml4();

    let pdpt = next_level(pml4, p4i, true).ok_or(MemoryError::OutOfPhysicalMemory)?;
    let pd = next_level(pdpt, p3i, true).ok_or(MemoryError::OutOfPhysicalMemory)?;
    let pt = next_level(pd, p2i, true).ok_or(MemoryError::OutOfPhysicalMemory)?;

    pt[p1i].set_addr(PhysAddr::new(phys), flags | PageTableFlags::PRESENT);
    flush_tlb(virt);
    Ok(())
}

pub fn unmap_4k(virt: u64) {
    let _guard = TABLE_LOCK.lock();
    let (p4i, p3i, p2i, p1i) = indices(virt);
    let pml4 = active_pml4();

    if let Some(pdpt) = next_level(pml4, p4i, false) {
        if let Some(pd) = next_level(pdpt, p3i, false) {
            let entry = &mut pd[p2i];
            if !entry.flags().contains(PageTableFlags::HUGE_PAGE) && !entry.is_unused() {
                let pt = unsafe { table_at(entry.addr().as_u64()) };
                pt[p1i].set_unused();
            }
        }
    }
    flush_tlb(virt);
}

/// Maps `count` contiguous 4 KiB pages starting at `virt` to the
/// contiguous physical run starting at `phys`.
pub fn map_range_4k_phys(
    virt_start: u64,
    phys_start: u64,
    count: u64,
    flags: PageTableFlags,
) -> Result<(), MemoryError> {
    for i in 0..count {
        map_4k(
            virt_start + i * crate::mm::PAGE_SIZE,
            phys_start + i * crate::mm::PAGE_SIZE,
            flags,
        )?;
    }
    Ok(())
}

pub fn unmap_range_4k(virt_start: u64, count: u64) {
    for i in 0..count {
        unmap_4k(virt_start + i * crate::mm::PAGE_SIZE);
    }
}

/// Standard kernel page permissions: present, writable, not accessible
/// from ring 3 (there is no ring 3 in this CORE, but the bit costs
/// nothing to set correctly).
pub fn map_page_kernel(virt: u64, phys: u64) -> Result<(), MemoryError> {
    map_4k(virt, phys, PageTableFlags::WRITABLE | PageTableFlags::GLOBAL)
}

/// Maps a single 2 MiB large page at the PD level, used by the hugepage
/// sub-allocator to back one of its slabs.
pub fn map_2m_kernel(virt: u64, phys: u64) -> Result<(), MemoryError> {
    let _guard = TABLE_LOCK.lock();
    let (p4i, p3i, p2i, _p1i) = indices(virt);
    let pml4 = active_pml4();

    let pdpt = next_level(pml4, p4i, true).ok_or(MemoryError::OutOfPhysicalMemory)?;
    let pd = next_level(pdpt, p3i, true).ok_or(MemoryError::OutOfPhysicalMemory)?;

    pd[p2i].set_addr(
        PhysAddr::new(phys),
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::HUGE_PAGE,
    );
    flush_tlb(virt);
    Ok(())
}

pub fn unmap_2m(virt: u64) {
    let _guard = TABLE_LOCK.lock();
    let (p4i, p3i, p2i, _p1i) = indices(virt);
    let pml4 = active_pml4();
    if let Some(pdpt) = next_level(pml4, p4i, false) {
        if let Some(pd) = next_level(pdpt, p3i, false) {
            pd[p2i].set_unused();
        }
    }
    flush_tlb(virt);
}

pub fn flush_tlb(virt: u64) {
    x86_64::instructions::tlb::flush(VirtAddr::new(virt));
}

pub fn flush_tlb_all() {
    let (frame, flags) = Cr3::read();
    unsafe { Cr3::write(frame, flags) };
}

pub fn get_current_cr3() -> u64 {
    active_pml4_phys()
}

/// # Safety
/// `pml4_phys` must name a page frame holding a valid, fully populated
/// PML4 mapping at least the kernel's own half of the address space, or
/// the next instruction fetch after the switch faults.
pub unsafe fn switch_cr3(pml4_phys: u64) {
    let frame = X86PhysFrame::<Size4KiB>::containing_address(PhysAddr::new(pml4_phys));
    unsafe { Cr3::write(frame, Cr3Flags::empty()) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_split_a_canonical_high_half_address() {
        let (p4, p3, p2, p1) = indices(0xFFFF_8000_0010_1000);
        assert!(p4 < 512 && p3 < 512 && p2 < 512 && p1 < 512);
    }
}
