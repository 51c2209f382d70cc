/*
 * Boot input
 *
 * The core never looks at a specific bootloader's on-wire layout outside
 * this module. A thin, protocol-specific shim assembles a `BootInfo` once,
 * early in `kstart`, and everything downstream (PMM, topology, per-CPU
 * bring-up) only ever sees this type.
 *
 * The concrete shim kept here is for BOOTBOOT, since it is what the rest of
 * the low-level boot dance (`_start`, the BSP/AP split in `main.rs`) already
 * assumes. A different loader would add another `BootSource` impl without
 * touching any core module.
 */

use alloc::vec::Vec;

/// One entry of the physical memory map handed to us by the bootloader.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemRegion {
    pub base: u64,
    pub length: u64,
    pub kind: MemRegionKind,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemRegionKind {
    Usable,
    Reserved,
    AcpiReclaimable,
    AcpiNvs,
    BadMemory,
}

/// A CPU entry from the bootloader's MP response: its local APIC id and the
/// wake-up hook the core calls to bring it online.
#[derive(Debug, Copy, Clone)]
pub struct CpuEntry {
    pub lapic_id: u32,
    pub is_bsp: bool,
}

/// Framebuffer handed over for peripheral console code; the core itself
/// never draws into it.
#[derive(Debug, Copy, Clone)]
pub struct FramebufferInfo {
    pub phys_base: u64,
    pub width: u32,
    pub height: u32,
    pub scanline_bytes: u32,
}

/// Protocol-agnostic view of everything the core needs from the bootloader.
pub struct BootInfo {
    pub mmap: Vec<MemRegion>,
    /// Physical -> virtual identity-map offset (High-Half Direct Map).
    pub hhdm_offset: u64,
    pub rsdp: Option<u64>,
    pub cpus: Vec<CpuEntry>,
    pub framebuffer: Option<FramebufferInfo>,
    /// Kernel's own physical load base, used to carve out PMM "used" frames.
    pub kernel_phys_base: u64,
    pub kernel_phys_end: u64,
}

impl BootInfo {
    pub fn bsp(&self) -> Option<&CpuEntry> {
        self.cpus.iter().find(|c| c.is_bsp)
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus.len().max(1)
    }
}

/// Raw BOOTBOOT structure, laid out exactly as the loader places it in
/// memory (see the BOOTBOOT protocol header). Only the fields the core
/// needs are read; everything else is left as padding.
#[repr(C)]
pub struct BOOTBOOT {
    pub magic: [u8; 4],
    pub size: u32,
    pub protocol: u8,
    pub fb_type: u8,
    pub numcores: u16,
    pub bspid: u16,
    pub timezone: i16,
    pub datetime: [u8; 8],
    pub initrd_ptr: u64,
    pub initrd_size: u64,
    pub fb_ptr: u64,
    pub fb_size: u32,
    pub fb_width: u32,
    pub fb_height: u32,
    pub fb_scanline: u32,
    pub arch: BootArch,
    pub mmap: MMapEnt,
}

#[repr(C)]
pub struct BootArch {
    pub acpi_ptr: u64,
    pub smbi_ptr: u64,
    pub efi_ptr: u64,
    pub mp_ptr: u64,
    pub unused0: u64,
    pub unused1: u64,
}

/// One raw BOOTBOOT MMap entry: pointer plus a size whose low 4 bits encode
/// the region type and whose remaining bits are the (16-byte aligned) size.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct MMapEnt {
    pub ptr: u64,
    pub size: u64,
}

pub const MMAP_FREE: u32 = 1;
pub const BOOTBOOT_CORE: u64 = 0xffff_ffff_ffe0_0000;

/// Parses the raw BOOTBOOT header + trailing mmap into a protocol-agnostic
/// `BootInfo`. Mirrors the scanning the PMM bitmap bring-up used to do
/// directly against BOOTBOOT fields, just pulled into its own shim.
///
/// # Safety
/// `bootboot_ptr` must point at a valid BOOTBOOT structure placed by the
/// loader, as BOOTBOOT itself guarantees at `_start` time.
pub unsafe fn from_bootboot(bootboot_ptr: *const BOOTBOOT) -> BootInfo {
    let bb = unsafe { &*bootboot_ptr };
    let bb_size = bb.size;
    let total_bytes = (bb_size as usize).saturating_sub(128);
    let mmap_entries = total_bytes / core::mem::size_of::<MMapEnt>();
    let mmap_base: *const MMapEnt = core::ptr::addr_of!(bb.mmap);

    let mut mmap = Vec::with_capacity(mmap_entries);
    for i in 0..mmap_entries {
        let entry = unsafe { &*mmap_base.add(i) };
        let ptr = entry.ptr;
        let raw_size = entry.size;
        let kind_bits = (raw_size & 0xF) as u32;
        let length = raw_size & !0xF;
        if length == 0 {
            continue;
        }
        let kind = if kind_bits == MMAP_FREE {
            MemRegionKind::Usable
        } else {
            MemRegionKind::Reserved
        };
        mmap.push(MemRegion { base: ptr, length, kind });
    }

    let numcores = bb.numcores.max(1);
    let bspid = bb.bspid;
    let mut cpus = Vec::with_capacity(numcores as usize);
    // BOOTBOOT only hands us the BSP id directly; APs self-identify via
    // CPUID at `_start` and are folded in as they come online (see
    // `main.rs`). We seed the table with the BSP and placeholders here.
    cpus.push(CpuEntry { lapic_id: bspid as u32, is_bsp: true });
    for id in 0..numcores {
        if id == bspid {
            continue;
        }
        cpus.push(CpuEntry { lapic_id: id as u32, is_bsp: false });
    }

    unsafe extern "C" {
        static __text_start: u8;
        static __bss_end: u8;
    }
    let kernel_virt_start = core::ptr::addr_of!(__text_start) as u64;
    let kernel_virt_end = core::ptr::addr_of!(__bss_end) as u64;
    const KERNEL_PHYS_BASE: u64 = 0x0020_0000;
    let kernel_phys_base = kernel_virt_start - BOOTBOOT_CORE + KERNEL_PHYS_BASE;
    let kernel_phys_end = kernel_virt_end - BOOTBOOT_CORE + KERNEL_PHYS_BASE;

    let rsdp = if bb.arch.acpi_ptr != 0 { Some(bb.arch.acpi_ptr) } else { None };
    let framebuffer = if bb.fb_ptr != 0 {
        Some(FramebufferInfo {
            phys_base: bb.fb_ptr,
            width: bb.fb_width,
            height: bb.fb_height,
            scanline_bytes: bb.fb_scanline,
        })
    } else {
        None
    };

    BootInfo {
        mmap,
        hhdm_offset: 0,
        rsdp,
        cpus,
        framebuffer,
        kernel_phys_base,
        kernel_phys_end,
    }
}
