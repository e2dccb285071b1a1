//! Before the UART is initialized there is nowhere to send log output.
//! Early boot messages are appended here instead and flushed to the
//! serial console once `serial::init_serial()` has run.

use spin::Mutex;

const BOOTLOG_CAP: usize = 2048;

struct BootLog {
    buf: [u8; BOOTLOG_CAP],
    len: usize,
    flushed: bool,
}

impl BootLog {
    const fn new() -> Self {
        Self {
            buf: [0; BOOTLOG_CAP],
            len: 0,
            flushed: false,
        }
    }

    fn append(&mut self, msg: &[u8]) {
        if self.flushed {
            return;
        }
        let remaining = BOOTLOG_CAP - self.len;
        let n = msg.len().min(remaining);
        self.buf[self.len..self.len + n].copy_from_slice(&msg[..n]);
        self.len += n;
    }
}

static BOOTLOG: Mutex<BootLog> = Mutex::new(BootLog::new());

/// Record a message emitted before the serial port is ready. Silently
/// truncates past capacity; boot-stage messages are short and few.
pub fn record(msg: &[u8]) {
    BOOTLOG.lock().append(msg);
}

/// Write everything recorded so far to serial and stop accepting further
/// entries (the serial path takes over from here).
pub fn flush() {
    let mut log = BOOTLOG.lock();
    crate::arch::x86_64::serial::serial_write(&log.buf[..log.len]);
    log.flushed = true;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_truncates_past_capacity() {
        let mut log = BootLog::new();
        let msg = [b'a'; BOOTLOG_CAP + 100];
        log.append(&msg);
        assert_eq!(log.len, BOOTLOG_CAP);
    }

    #[test]
    fn append_stops_after_flush() {
        let mut log = BootLog::new();
        log.append(b"hello");
        log.flushed = true;
        log.append(b"world");
        assert_eq!(log.len, 5);
    }
}
