/*
 * Architecture bring-up
 *
 * `kstart` is the first Rust code to run on the BSP (see `main.rs`'s naked
 * `_start`). It is the one place allowed to know this build targets the
 * BOOTBOOT protocol: it reaches for the `bootboot` structure the loader
 * places at a fixed linked address, turns it into a protocol-agnostic
 * `crate::boot::BootInfo` and hands off to `crate::init_core`, per §10.5's
 * boot-input generalization.
 */

#[cfg(target_arch = "x86_64")]
#[macro_use]
pub mod x86_64;

#[cfg(target_arch = "x86_64")]
use self::x86_64::peripheral;

use crate::boot::{self, BOOTBOOT};

unsafe extern "C" {
    static bootboot: BOOTBOOT;
}

/// Entry point called by `_start` on the BSP once it is running on its own
/// stack. Never returns: after core init, this becomes the BSP's emergency
/// idle loop — it only runs when no other thread is ready, since timer
/// interrupts mark `needs_resched` and the next IRQL drop below DISPATCH
/// takes the actual reschedule.
pub fn kstart() -> ! {
    peripheral::init_debug_port();
    crate::irql::init_cpu();
    x86_64::gdt::init();
    x86_64::idt::init();
    peripheral::init_peripherals();

    let boot_info = unsafe { boot::from_bootboot(core::ptr::addr_of!(bootboot)) };
    crate::init_core(&boot_info);

    x86_64::interrupts::enable();
    loop {
        ::x86_64::instructions::hlt();
    }
}
