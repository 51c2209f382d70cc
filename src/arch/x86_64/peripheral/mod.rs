/*
 * Peripheral bring-up
 *
 * Only the two devices the core itself depends on live here: the COM2
 * UART backing the debug log sink, and the legacy 8259 PIC that the IDT's
 * hardware-interrupt vectors assume. Framebuffer/keyboard drivers are
 * outside the core's scope (see SPEC_FULL.md's Non-goals) and are not
 * carried forward.
 */

use spin::Mutex;

use self::uart_16550::SerialPort;

pub mod pic;
pub mod uart_16550;

pub static COM2: Mutex<SerialPort> = Mutex::new(SerialPort::new(0x2F8));

/// Must run before the logger, which writes through `COM2`.
pub fn init_debug_port() {
    COM2.lock().init();
}

pub fn init_peripherals() {
    pic::init_pic();
    log::info!(target: "arch", "PIC initialized");
}
