/*
 * Ambient support code: the serial console backing the log sink, the
 * `print!`/`serial_println!` macros, and the logger itself.
 */

pub mod writer;
#[macro_use]
pub mod macros;
pub mod error;
pub mod logger;
