//! 16550 UART driver for COM1. This is the only console the kernel has
//! before a real display driver exists, and everything in `printk` and
//! `panic` funnels through it.

use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;

pub const COM1_PORT: u16 = 0x3F8;
pub const COM2_PORT: u16 = 0x2F8;

lazy_static! {
    pub static ref SERIAL1: Mutex<SerialPort> = {
        let mut serial_port = unsafe { SerialPort::new(COM1_PORT) };
        serial_port.init();
        Mutex::new(serial_port)
    };
}

/// # Safety
/// Must run during early boot before any serial output is attempted.
pub unsafe fn init_serial() -> Result<(), &'static str> {
    let _ = &*SERIAL1;
    Ok(())
}

pub fn serial_write_byte(byte: u8) {
    SERIAL1.lock().send(byte);
}

pub fn serial_write(s: &[u8]) {
    for &byte in s {
        serial_write_byte(byte);
    }
}

pub fn serial_read() -> Option<u8> {
    SERIAL1.lock().receive()
}

pub fn _print(args: core::fmt::Arguments) {
    use core::fmt::Write;
    SERIAL1.lock().write_fmt(args).expect("Failed to write to serial");
}

#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::arch::x86_64::serial::_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($fmt:expr) => ($crate::serial_print!(concat!($fmt, "\n")));
    ($fmt:expr, $($arg:tt)*) => ($crate::serial_print!(
        concat!($fmt, "\n"), $($arg)*
    ));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_write() {
        serial_write(b"Test message\n");
    }

    #[test]
    fn test_serial_macros() {
        serial_print!("Test ");
        serial_println!("message");
        serial_println!("Formatted: {} {}", 42, "test");
    }
}
