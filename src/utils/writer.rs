/*
 * Serial console writer
 *
 * Thin `fmt::Write` wrapper over the COM2 UART, used by the `print!`/
 * `serial_println!` macros and the logger backend below.
 */

use core::fmt;
use spin::MutexGuard;

use crate::arch::x86_64::peripheral::uart_16550::SerialPort;
use crate::arch::x86_64::peripheral::COM2;

pub struct Writer<'a> {
    serial: MutexGuard<'a, SerialPort>,
}

impl<'a> Writer<'a> {
    pub fn new() -> Writer<'a> {
        Writer { serial: COM2.lock() }
    }
}

impl<'a> fmt::Write for Writer<'a> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.serial.write_str(s)
    }
}
