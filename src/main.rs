/*
 * Kernel boot entry point
 *
 * This binary target is deliberately thin. Every core BOOTBOOT loads jumps
 * here first; `_start` sorts the BSP from the APs, gives the BSP its own
 * stack, and hands off into `substrate_kernel::arch::kstart`, which does
 * everything else. Keeping the rest of the kernel in the library crate
 * means it also builds under `cargo test` on the host.
 */

#![no_std]
#![no_main]
#![feature(abi_x86_interrupt)]
#![feature(alloc_error_handler)]
#![allow(dead_code)]

use core::panic::PanicInfo;

#[repr(C, align(16))]
pub struct AlignedBspStack([u8; 64 * 1024]);

#[unsafe(no_mangle)]
pub static mut BSP_STACK: AlignedBspStack = AlignedBspStack([0; 64 * 1024]);

/// Called directly by the BOOTBOOT loader on every core.
///
/// Required to:
///   - Identify the BSP using `bootboot.bspid`
///   - Switch to our own 64 KiB kernel stack
///   - Call into Rust's `kstart`
///   - Park APs
///
/// AP wake-up beyond parking them here is SMP bring-up work that hasn't
/// landed yet; when it does, the AP path below gets its own per-core stack
/// instead of `hlt`-looping forever.
#[unsafe(naked)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn _start() -> ! {
    core::arch::naked_asm!(
        // CPUID leaf 1 -> EBX[31:24] = APIC ID
        "mov eax, 1",
        "cpuid",
        "shr ebx, 24",

        // Load &bootboot into RAX
        "lea rax, [rip + bootboot]",

        // Read bspid (u16 @ offset 0x0C)
        "movzx ecx, word ptr [rax + 0x0C]",

        // Compare APIC ID vs bspid
        "cmp ebx, ecx",
        "jne 2f",

        // BSP path: switch to our 64 KiB stack and jump into Rust
        "lea rax, [rip + BSP_STACK]",
        "add rax, {stack_size}",
        "mov rsp, rax",
        "jmp kstart",

        // AP path: park for now
        "2:",
        "1:",
        "hlt",
        "jmp 1b",

        stack_size = const 64 * 1024,
    );
}

#[unsafe(no_mangle)]
pub extern "C" fn kstart() -> ! {
    substrate_kernel::arch::kstart();
}

/// Logging may fail early, but this is safe once the logger is up.
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    substrate_kernel::arch::x86_64::interrupts::disable();
    substrate_kernel::global::mark_panicked();

    if let Some(location) = info.location() {
        log::error!(
            "PANIC at {}:{}: {}",
            location.file(),
            location.line(),
            info.message()
        );
    } else {
        log::error!("PANIC: {}", info.message());
    }

    loop {
        x86_64::instructions::hlt();
    }
}
