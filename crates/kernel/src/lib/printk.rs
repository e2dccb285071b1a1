//! Kernel logging. Every formatted line is written straight to the serial
//! console and also mirrored into a fixed-capacity ring buffer so a later
//! `dmesg`-style dump can recover recent history; neither path allocates.

use crate::lib::ringbuf::RingBuffer;
use core::fmt::{self, Write};
use core::sync::atomic::{AtomicU8, Ordering};
use spin::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

static MIN_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

pub fn set_level(level: LogLevel) {
    MIN_LEVEL.store(level as u8, Ordering::Relaxed);
}

fn level_enabled(level: LogLevel) -> bool {
    (level as u8) <= MIN_LEVEL.load(Ordering::Relaxed)
}

const LOG_LINE_CAP: usize = 256;

#[derive(Clone, Copy)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: [u8; LOG_LINE_CAP],
    pub len: usize,
}

impl LogEntry {
    const fn empty() -> Self {
        Self {
            level: LogLevel::Info,
            message: [0; LOG_LINE_CAP],
            len: 0,
        }
    }

    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.message[..self.len]).unwrap_or("<invalid utf8>")
    }
}

/// Fixed-size `core::fmt::Write` sink used to render a log line without
/// any heap allocation.
struct LineBuf {
    buf: [u8; LOG_LINE_CAP],
    len: usize,
}

impl LineBuf {
    const fn new() -> Self {
        Self {
            buf: [0; LOG_LINE_CAP],
            len: 0,
        }
    }
}

impl Write for LineBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let remaining = LOG_LINE_CAP - self.len;
        let bytes = s.as_bytes();
        let n = bytes.len().min(remaining);
        self.buf[self.len..self.len + n].copy_from_slice(&bytes[..n]);
        self.len += n;
        Ok(())
    }
}

const LOG_RING_CAPACITY: usize = 512;

pub static KERNEL_LOG: Mutex<RingBuffer<LogEntry, LOG_RING_CAPACITY>> =
    Mutex::new(RingBuffer::new());

/// Render `args` into a line buffer, push it into the log ring, and echo
/// it to the serial console. Used by the `error!`/`warn!`/`info!`/`debug!`
/// macros; not normally called directly.
pub fn log(level: LogLevel, args: fmt::Arguments) {
    if !level_enabled(level) {
        return;
    }

    let mut line = LineBuf::new();
    let _ = line.write_fmt(args);

    let mut entry = LogEntry::empty();
    entry.level = level;
    entry.len = line.len;
    entry.message[..line.len].copy_from_slice(&line.buf[..line.len]);
    KERNEL_LOG.lock().push(entry);

    let prefix: &[u8] = match level {
        LogLevel::Error => b"[ERROR] ",
        LogLevel::Warn => b"[WARN]  ",
        LogLevel::Info => b"[INFO]  ",
        LogLevel::Debug => b"[DEBUG] ",
    };
    crate::arch::x86_64::serial::serial_write(prefix);
    crate::arch::x86_64::serial::serial_write(&entry.message[..entry.len]);
    crate::arch::x86_64::serial::serial_write(b"\n");
}

/// Drain the in-memory log ring to the serial console (the `dmesg`
/// equivalent for a kernel with no syscall surface of its own yet).
pub fn dump_log() {
    let mut ring = KERNEL_LOG.lock();
    while let Some(entry) = ring.pop() {
        crate::arch::x86_64::serial::serial_write(entry.as_str().as_bytes());
        crate::arch::x86_64::serial::serial_write(b"\n");
    }
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::lib::printk::log($crate::lib::printk::LogLevel::Error, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::lib::printk::log($crate::lib::printk::LogLevel::Warn, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::lib::printk::log($crate::lib::printk::LogLevel::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::lib::printk::log($crate::lib::printk::LogLevel::Debug, format_args!($($arg)*))
    };
}

pub use crate::debug;
pub use crate::error;
pub use crate::info;
pub use crate::warn;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buf_truncates_past_capacity() {
        let mut line = LineBuf::new();
        let long = "x".repeat(LOG_LINE_CAP + 64);
        let _ = line.write_str(&long);
        assert_eq!(line.len, LOG_LINE_CAP);
    }

    #[test]
    fn level_filtering() {
        set_level(LogLevel::Warn);
        assert!(level_enabled(LogLevel::Error));
        assert!(level_enabled(LogLevel::Warn));
        assert!(!level_enabled(LogLevel::Info));
        set_level(LogLevel::Debug);
        assert!(level_enabled(LogLevel::Debug));
    }
}
