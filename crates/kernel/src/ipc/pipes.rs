//! Unix-style pipes over static circular buffers. No pipe ever
//! allocates: the table and every buffer are fixed-size statics.
//!
//! Descriptors encode both the slot and which end they name: reading
//! from slot `idx` is fd `2*idx`, writing is fd `2*idx + 1`.

use spin::Mutex;

use crate::ipc::waitqueue::WaitQueue;
use crate::lib::error::KernelError;
use crate::process::{self, ProcessState};

pub const PIPE_TABLE_SIZE: usize = 128;
pub const PIPE_BUF_SIZE: usize = 4096;
pub const MAX_WAITERS: usize = 8;

const FLAG_READ_OPEN: u32 = 1 << 0;
const FLAG_WRITE_OPEN: u32 = 1 << 1;

struct PipeSlot {
    buffer: [u8; PIPE_BUF_SIZE],
    read_pos: usize,
    count: usize,
    flags: u32,
    id: u32,
    readers: u32,
    writers: u32,
    read_waiters: WaitQueue<MAX_WAITERS>,
    write_waiters: WaitQueue<MAX_WAITERS>,
}

impl PipeSlot {
    const fn empty() -> Self {
        Self {
            buffer: [0; PIPE_BUF_SIZE],
            read_pos: 0,
            count: 0,
            flags: 0,
            id: 0,
            readers: 0,
            writers: 0,
            read_waiters: WaitQueue::empty(),
            write_waiters: WaitQueue::empty(),
        }
    }

    fn free_space(&self) -> usize {
        PIPE_BUF_SIZE - self.count
    }

    fn wake_all_read_waiters(&mut self) {
        while let Some(pid) = self.read_waiters.pop_front() {
            process::set_state(pid, ProcessState::Ready);
        }
    }

    fn wake_all_write_waiters(&mut self) {
        while let Some(pid) = self.write_waiters.pop_front() {
            process::set_state(pid, ProcessState::Ready);
        }
    }
}

static PIPES: [Mutex<PipeSlot>; PIPE_TABLE_SIZE] = [Mutex::new(PipeSlot::empty()); PIPE_TABLE_SIZE];
static TABLE_LOCK: Mutex<()> = Mutex::new(());
static NEXT_ID: core::sync::atomic::AtomicU32 = core::sync::atomic::AtomicU32::new(1);

/// # Safety
/// Must run once before any pipe call.
pub unsafe fn init() {
    crate::printk::info!("IPC: pipe table ready ({} slots)", PIPE_TABLE_SIZE);
}

fn read_fd(idx: usize) -> usize {
    2 * idx
}

fn write_fd(idx: usize) -> usize {
    2 * idx + 1
}

fn slot_index_for_fd(fd: usize) -> usize {
    fd / 2
}

fn is_write_fd(fd: usize) -> bool {
    fd % 2 == 1
}

/// Finds and claims the first free slot, returning its `(read_fd, write_fd)`.
pub fn pipe_create() -> Result<(usize, usize), KernelError> {
    let _table_guard = TABLE_LOCK.lock();

    for (idx, slot_lock) in PIPES.iter().enumerate() {
        let mut slot = slot_lock.lock();
        if slot.flags == 0 {
            *slot = PipeSlot::empty();
            slot.flags = FLAG_READ_OPEN | FLAG_WRITE_OPEN;
            slot.readers = 1;
            slot.writers = 1;
            slot.id = NEXT_ID.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
            return Ok((read_fd(idx), write_fd(idx)));
        }
    }

    Err(KernelError::NoSlotAvailable)
}

/// Blocking read of up to `buf.len()` bytes. Returns 0 at EOF.
pub fn read(fd: usize, buf: &mut [u8]) -> Result<usize, KernelError> {
    read_impl(fd, buf, false)
}

pub fn read_nonblocking(fd: usize, buf: &mut [u8]) -> Result<usize, KernelError> {
    read_impl(fd, buf, true)
}

fn read_impl(fd: usize, buf: &mut [u8], non_blocking: bool) -> Result<usize, KernelError> {
    if is_write_fd(fd) {
        return Err(KernelError::BadFileDescriptor);
    }
    let idx = slot_index_for_fd(fd);
    let self_pid = process::current_pid();

    loop {
        let mut slot = PIPES[idx].lock();
        if slot.flags & FLAG_READ_OPEN == 0 {
            return Err(KernelError::BadFileDescriptor);
        }

        if slot.count == 0 {
            if slot.flags & FLAG_WRITE_OPEN == 0 {
                return Ok(0); // EOF
            }
            if non_blocking {
                return Err(KernelError::WouldBlock);
            }
            slot.read_waiters.push_back(self_pid);
            process::set_state(self_pid, ProcessState::Blocked);
            drop(slot);
            process::yield_now();
            continue;
        }

        let to_copy = core::cmp::min(slot.count, buf.len());
        for i in 0..to_copy {
            let pos = (slot.read_pos + i) % PIPE_BUF_SIZE;
            buf[i] = slot.buffer[pos];
        }
        slot.read_pos = (slot.read_pos + to_copy) % PIPE_BUF_SIZE;
        slot.count -= to_copy;
        slot.wake_all_write_waiters();
        return Ok(to_copy);
    }
}

/// Blocking write of exactly `buf.len()` bytes unless the read end
/// closes partway through, in which case the partial count (or a
/// `BrokenPipe` error if nothing was written) is returned.
pub fn write(fd: usize, buf: &[u8]) -> Result<usize, KernelError> {
    write_impl(fd, buf, false)
}

pub fn write_nonblocking(fd: usize, buf: &[u8]) -> Result<usize, KernelError> {
    write_impl(fd, buf, true)
}

fn write_impl(fd: usize, buf: &[u8], non_blocking: bool) -> Result<usize, KernelError> {
    if !is_write_fd(fd) {
        return Err(KernelError::BadFileDescriptor);
    }
    let idx = slot_index_for_fd(fd);
    let self_pid = process::current_pid();

    let mut written = 0;
    while written < buf.len() {
        let mut slot = PIPES[idx].lock();
        if slot.flags & FLAG_WRITE_OPEN == 0 {
            return Err(KernelError::BadFileDescriptor);
        }
        if slot.flags & FLAG_READ_OPEN == 0 {
            return if written == 0 {
                Err(KernelError::BrokenPipe)
            } else {
                Ok(written)
            };
        }

        if slot.count == PIPE_BUF_SIZE {
            if non_blocking {
                return if written == 0 {
                    Err(KernelError::WouldBlock)
                } else {
                    Ok(written)
                };
            }
            slot.write_waiters.push_back(self_pid);
            process::set_state(self_pid, ProcessState::Blocked);
            drop(slot);
            process::yield_now();
            continue;
        }

        let space = slot.free_space();
        let remaining = buf.len() - written;
        let to_write = core::cmp::min(remaining, space);
        let write_pos = (slot.read_pos + slot.count) % PIPE_BUF_SIZE;
        for i in 0..to_write {
            let pos = (write_pos + i) % PIPE_BUF_SIZE;
            slot.buffer[pos] = buf[written + i];
        }
        slot.count += to_write;
        written += to_write;
        slot.wake_all_read_waiters();
    }

    Ok(written)
}

/// Decrements the appropriate refcount and, when it reaches zero,
/// clears that side's OPEN bit and wakes the opposite side's waiters.
/// Reclaims the slot once both sides are closed.
pub fn close_fd(fd: usize) {
    let idx = slot_index_for_fd(fd);
    let mut slot = PIPES[idx].lock();

    if is_write_fd(fd) {
        if slot.writers > 0 {
            slot.writers -= 1;
        }
        if slot.writers == 0 {
            slot.flags &= !FLAG_WRITE_OPEN;
            slot.wake_all_read_waiters();
        }
    } else {
        if slot.readers > 0 {
            slot.readers -= 1;
        }
        if slot.readers == 0 {
            slot.flags &= !FLAG_READ_OPEN;
            slot.wake_all_write_waiters();
        }
    }

    if slot.flags & (FLAG_READ_OPEN | FLAG_WRITE_OPEN) == 0 {
        slot.flags = 0;
        slot.id = 0;
    }
}

pub fn available(fd: usize) -> usize {
    let idx = slot_index_for_fd(fd);
    PIPES[idx].lock().count
}

pub fn free_space(fd: usize) -> usize {
    let idx = slot_index_for_fd(fd);
    PIPES[idx].lock().free_space()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reset_all() {
        for slot_lock in PIPES.iter() {
            let mut slot = slot_lock.lock();
            *slot = PipeSlot::empty();
        }
    }

    #[test]
    fn test_byte_order_preserved() {
        reset_all();
        let (rfd, wfd) = pipe_create().unwrap();
        write(wfd, b"Hello").unwrap();
        write(wfd, b"World").unwrap();

        let mut buf = [0u8; 10];
        let n = read(rfd, &mut buf).unwrap();
        assert_eq!(n, 10);
        assert_eq!(&buf, b"HelloWorld");
    }

    #[test]
    fn test_wrap_around() {
        reset_all();
        let (rfd, wfd) = pipe_create().unwrap();

        let chunk_a = [b'A'; 3000];
        let chunk_b = [b'B'; 3000];
        let mut out = [0u8; 3000];

        write(wfd, &chunk_a).unwrap();
        let n = read(rfd, &mut out).unwrap();
        assert_eq!(n, 3000);
        assert_eq!(out, chunk_a);

        write(wfd, &chunk_b).unwrap();
        let n = read(rfd, &mut out).unwrap();
        assert_eq!(n, 3000);
        assert_eq!(out, chunk_b);
    }

    #[test]
    fn test_eof_after_write_close() {
        reset_all();
        let (rfd, wfd) = pipe_create().unwrap();
        write(wfd, b"hello").unwrap();
        close_fd(wfd);

        let mut buf = [0u8; 5];
        let n = read(rfd, &mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");

        let n2 = read(rfd, &mut buf).unwrap();
        assert_eq!(n2, 0);
    }

    #[test]
    fn test_broken_pipe_after_read_close() {
        reset_all();
        let (rfd, wfd) = pipe_create().unwrap();
        close_fd(rfd);

        let result = write(wfd, b"x");
        assert!(matches!(result, Err(KernelError::BrokenPipe)));
    }

    #[test]
    fn test_half_close_reclaims_slot() {
        reset_all();
        for _ in 0..PIPE_TABLE_SIZE {
            let (rfd, wfd) = pipe_create().unwrap();
            close_fd(rfd);
            close_fd(wfd);
        }
        // every slot was closed on both ends; the table isn't exhausted.
        assert!(pipe_create().is_ok());
    }

    #[test]
    fn test_introspection_counts() {
        reset_all();
        let (_rfd, wfd) = pipe_create().unwrap();
        write(wfd, b"abc").unwrap();
        assert_eq!(available(wfd), 3);
        assert_eq!(free_space(wfd), PIPE_BUF_SIZE - 3);
    }
}
