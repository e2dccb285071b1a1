//! Inter-process messages: a global slab of fixed-size buffers and one
//! FIFO mailbox per process.
//!
//! The slab's free-list is guarded by one global lock; each mailbox has
//! its own lock so traffic to process A never contends with traffic to
//! process B. When a routine needs both (allocating a slot while
//! appending to a mailbox), the global lock is taken first and the
//! per-entry lock is always dropped before the global one.

use spin::Mutex;

use crate::ipc::waitqueue::WaitQueue;
use crate::lib::error::KernelError;
use crate::process::{self, Pid, ProcessState, PROCESS_MAX};

pub const MSG_MAX_SIZE: usize = 256;
pub const SLAB_CAPACITY: usize = 512;
pub const MAILBOX_CAPACITY: usize = 32;
pub const MAX_WAITERS: usize = 8;

pub const FLAG_BROADCAST: u32 = 1 << 0;

#[derive(Clone, Copy)]
struct Slot {
    src_pid: Pid,
    dest_pid: Pid,
    flags: u32,
    msg_id: u32,
    length: usize,
    timestamp: u64,
    data: [u8; MSG_MAX_SIZE],
    next: Option<usize>,
}

impl Slot {
    const fn empty() -> Self {
        Self {
            src_pid: 0,
            dest_pid: 0,
            flags: 0,
            msg_id: 0,
            length: 0,
            timestamp: 0,
            data: [0; MSG_MAX_SIZE],
            next: None,
        }
    }
}

struct Slab {
    slots: [Slot; SLAB_CAPACITY],
    free_head: Option<usize>,
    in_use: usize,
}

impl Slab {
    const fn new() -> Self {
        Self {
            slots: [Slot::empty(); SLAB_CAPACITY],
            free_head: None,
            in_use: 0,
        }
    }

    fn link_free_list(&mut self) {
        for i in 0..SLAB_CAPACITY - 1 {
            self.slots[i].next = Some(i + 1);
        }
        self.slots[SLAB_CAPACITY - 1].next = None;
        self.free_head = Some(0);
    }

    fn alloc(&mut self) -> Option<usize> {
        let idx = self.free_head?;
        self.free_head = self.slots[idx].next;
        self.slots[idx].next = None;
        self.in_use += 1;
        Some(idx)
    }

    fn free(&mut self, idx: usize) {
        self.slots[idx] = Slot::empty();
        self.slots[idx].next = self.free_head;
        self.free_head = Some(idx);
        self.in_use -= 1;
    }
}

static SLAB: Mutex<Slab> = Mutex::new(Slab::new());
static MSG_ID_COUNTER: core::sync::atomic::AtomicU32 = core::sync::atomic::AtomicU32::new(1);
static MSG_SEQUENCE: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(0);

struct Mailbox {
    head: Option<usize>,
    tail: Option<usize>,
    count: usize,
    waiters: WaitQueue<MAX_WAITERS>,
}

impl Mailbox {
    const fn empty() -> Self {
        Self {
            head: None,
            tail: None,
            count: 0,
            waiters: WaitQueue::empty(),
        }
    }
}

static MAILBOXES: [Mutex<Mailbox>; PROCESS_MAX] = [Mutex::new(Mailbox::empty()); PROCESS_MAX];

/// # Safety
/// Must run once before any send/receive calls.
pub unsafe fn init() {
    SLAB.lock().link_free_list();
    crate::printk::info!("IPC: message slab ready ({} entries)", SLAB_CAPACITY);
}

fn wake_one(mailbox: &mut Mailbox) {
    if let Some(pid) = mailbox.waiters.pop_front() {
        process::set_state(pid, ProcessState::Ready);
    }
}

pub fn send(dest: Pid, buf: &[u8]) -> Result<(), KernelError> {
    send_flags(dest, buf, 0)
}

pub fn send_flags(dest: Pid, buf: &[u8], flags: u32) -> Result<(), KernelError> {
    if buf.len() > MSG_MAX_SIZE {
        return Err(KernelError::InvalidArgument);
    }
    if !process::exists(dest) {
        return Err(KernelError::NotFound);
    }

    // Per the mailbox-lock discipline: the per-entry (mailbox) lock is
    // the outer one here, with the global slab lock taken and dropped
    // inside it for the actual allocation.
    let mut mailbox = MAILBOXES[dest as usize].lock();
    if mailbox.count >= MAILBOX_CAPACITY {
        return Err(KernelError::QueueFull);
    }

    let idx = {
        let mut slab = SLAB.lock();
        let idx = slab.alloc().ok_or(KernelError::OutOfMemory)?;
        let slot = &mut slab.slots[idx];
        slot.src_pid = process::current_pid();
        slot.dest_pid = dest;
        slot.flags = flags;
        slot.msg_id = MSG_ID_COUNTER.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
        slot.length = buf.len();
        slot.timestamp = MSG_SEQUENCE.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
        slot.data[..buf.len()].copy_from_slice(buf);
        slot.next = None;
        idx
    };

    if let Some(tail) = mailbox.tail {
        SLAB.lock().slots[tail].next = Some(idx);
    } else {
        mailbox.head = Some(idx);
    }
    mailbox.tail = Some(idx);
    mailbox.count += 1;

    wake_one(&mut mailbox);

    Ok(())
}

pub struct Received {
    pub length: usize,
    pub src_pid: Pid,
}

/// Receives into `out`, blocking cooperatively until a message arrives
/// unless `non_blocking` is set.
pub fn receive(out: &mut [u8], non_blocking: bool) -> Result<Received, KernelError> {
    let self_pid = process::current_pid();

    loop {
        let mut mailbox = MAILBOXES[self_pid as usize].lock();
        if mailbox.count == 0 {
            if non_blocking {
                return Err(KernelError::WouldBlock);
            }
            mailbox.waiters.push_back(self_pid);
            process::set_state(self_pid, ProcessState::Blocked);
            drop(mailbox);
            process::yield_now();
            continue;
        }

        let idx = mailbox.head.expect("count > 0 implies a head slot");
        let (next, length, src_pid) = {
            let slab = SLAB.lock();
            let slot = &slab.slots[idx];
            (slot.next, slot.length, slot.src_pid)
        };

        mailbox.head = next;
        if mailbox.head.is_none() {
            mailbox.tail = None;
        }
        mailbox.count -= 1;

        let copy_len = core::cmp::min(length, out.len());
        {
            let slab = SLAB.lock();
            out[..copy_len].copy_from_slice(&slab.slots[idx].data[..copy_len]);
        }
        SLAB.lock().free(idx);

        return Ok(Received {
            length: copy_len,
            src_pid,
        });
    }
}

/// Copies the first queued message's payload into `out` without
/// dequeuing it, returning the message's full length (which may exceed
/// `out.len()`, in which case only `out.len()` bytes are copied).
pub fn peek(pid: Pid, out: &mut [u8]) -> Option<usize> {
    let mailbox = MAILBOXES[pid as usize].lock();
    let idx = mailbox.head?;
    let slab = SLAB.lock();
    let slot = &slab.slots[idx];
    let copy_len = core::cmp::min(slot.length, out.len());
    out[..copy_len].copy_from_slice(&slot.data[..copy_len]);
    Some(slot.length)
}

/// Sends to every live process other than the caller; returns the
/// number of successful deliveries. A full destination mailbox is
/// skipped rather than aborting the whole broadcast.
pub fn broadcast(buf: &[u8]) -> usize {
    let self_pid = process::current_pid();
    let mut delivered = 0;

    for pid in 1..PROCESS_MAX as Pid {
        if pid == self_pid {
            continue;
        }
        if !process::exists(pid) || process::state_of(pid) == ProcessState::Terminated {
            continue;
        }
        if send_flags(pid, buf, FLAG_BROADCAST).is_ok() {
            delivered += 1;
        }
    }

    delivered
}

pub fn slab_in_use() -> usize {
    SLAB.lock().in_use
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reset() {
        let mut slab = SLAB.lock();
        *slab = Slab::new();
        slab.link_free_list();
        drop(slab);
        for mailbox in MAILBOXES.iter() {
            let mut m = mailbox.lock();
            *m = Mailbox::empty();
        }
    }

    #[test]
    fn test_fifo_delivery_order() {
        reset();
        process::set_state(2, ProcessState::Ready);
        process::set_current_pid(1);

        send(2, b"m1").unwrap();
        send(2, b"m2").unwrap();
        send(2, b"m3").unwrap();

        process::set_current_pid(2);
        let mut buf = [0u8; MSG_MAX_SIZE];

        let mut peek_buf = [0u8; MSG_MAX_SIZE];
        let peeked_len = peek(2, &mut peek_buf).unwrap();
        assert_eq!(peeked_len, 2);
        assert_eq!(&peek_buf[..peeked_len], b"m1");

        let r1 = receive(&mut buf, true).unwrap();
        assert_eq!(&buf[..r1.length], b"m1");
        let r2 = receive(&mut buf, true).unwrap();
        assert_eq!(&buf[..r2.length], b"m2");
        let r3 = receive(&mut buf, true).unwrap();
        assert_eq!(&buf[..r3.length], b"m3");

        assert!(matches!(receive(&mut buf, true), Err(KernelError::WouldBlock)));
    }

    #[test]
    fn test_queue_full_after_32_sends() {
        reset();
        process::set_state(3, ProcessState::Ready);
        process::set_current_pid(1);

        let before = slab_in_use();
        for _ in 0..MAILBOX_CAPACITY {
            send(3, b"x").unwrap();
        }
        assert_eq!(send(3, b"x"), Err(KernelError::QueueFull));
        assert_eq!(slab_in_use() - before, MAILBOX_CAPACITY);
    }

    #[test]
    fn test_invalid_length_rejected() {
        reset();
        process::set_state(4, ProcessState::Ready);
        let oversized = [0u8; MSG_MAX_SIZE + 1];
        assert_eq!(send(4, &oversized), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn test_unknown_destination_rejected() {
        reset();
        assert_eq!(send(60, b"hi"), Err(KernelError::NotFound));
    }
}
