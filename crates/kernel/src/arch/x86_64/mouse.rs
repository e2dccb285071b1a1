//! PS/2 auxiliary (mouse) driver.
//!
//! Runs entirely off IRQ12: the handler reassembles 3-byte packets and
//! pushes decoded events into a fixed-capacity ring that `get_event`
//! drains from task context. No lock is shared between the ISR and the
//! readers — the ring uses atomic head/tail indices instead, so a
//! reader never blocks an interrupt.

use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicUsize, Ordering};

use x86_64::instructions::interrupts;
use x86_64::instructions::port::Port;

use super::serial;

const DATA_PORT: u16 = 0x60;
const STATUS_PORT: u16 = 0x64;
const COMMAND_PORT: u16 = 0x64;

const CMD_ENABLE_AUX: u8 = 0xA8;
const CMD_TEST_AUX: u8 = 0xA9;
const CMD_READ_CONFIG: u8 = 0x20;
const CMD_WRITE_CONFIG: u8 = 0x60;
const CMD_WRITE_AUX: u8 = 0xD4;

const MOUSE_RESET: u8 = 0xFF;
const MOUSE_SET_DEFAULTS: u8 = 0xF6;
const MOUSE_ENABLE: u8 = 0xF4;

const ACK: u8 = 0xFA;
const RESEND: u8 = 0xFE;
const SELF_TEST_PASS: u8 = 0xAA;

const MAX_RESEND_RETRIES: u32 = 3;
const POLL_ITERATIONS: u32 = 100_000;

const DEFAULT_SCREEN_WIDTH: i32 = 1024;
const DEFAULT_SCREEN_HEIGHT: i32 = 768;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MouseEventKind {
    Move,
    Drag,
    ButtonDown(MouseButton),
    ButtonUp(MouseButton),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MouseEvent {
    pub kind: MouseEventKind,
    pub x: i32,
    pub y: i32,
}

const RING_CAPACITY: usize = 256;
const RING_MASK: usize = RING_CAPACITY - 1;

/// Single-producer (ISR), single-consumer (`get_event`) ring that drops
/// the newest event on overflow rather than overwriting history; the
/// mouse driver favors continuity of old events over freshness.
///
/// `head`/`tail` are free-running counts (never wrapped themselves);
/// only the array index is masked by `RING_MASK`. That keeps "full" and
/// "empty" distinguishable without sacrificing a slot, unlike wrapping
/// the indices directly into `0..RING_CAPACITY`.
struct EventRing {
    slots: [Option<MouseEvent>; RING_CAPACITY],
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl EventRing {
    const fn new() -> Self {
        const NONE: Option<MouseEvent> = None;
        Self {
            slots: [NONE; RING_CAPACITY],
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }
}

static mut RING: EventRing = EventRing::new();

fn ring_push(event: MouseEvent) {
    let tail = unsafe { RING.tail.load(Ordering::Relaxed) };
    let head = unsafe { RING.head.load(Ordering::Acquire) };
    if tail - head >= RING_CAPACITY {
        // ring full: drop the new event, keep what's already queued.
        return;
    }
    unsafe {
        RING.slots[tail & RING_MASK] = Some(event);
        RING.tail.store(tail + 1, Ordering::Release);
    }
}

fn ring_pop() -> Option<MouseEvent> {
    let head = unsafe { RING.head.load(Ordering::Relaxed) };
    let tail = unsafe { RING.tail.load(Ordering::Acquire) };
    if head == tail {
        return None;
    }
    let event = unsafe { RING.slots[head & RING_MASK].take() };
    unsafe {
        RING.head.store(head + 1, Ordering::Release);
    }
    event
}

fn ring_is_empty() -> bool {
    unsafe { RING.head.load(Ordering::Acquire) == RING.tail.load(Ordering::Acquire) }
}

fn ring_flush() {
    while ring_pop().is_some() {}
}

static BOUND_MIN_X: AtomicI32 = AtomicI32::new(0);
static BOUND_MIN_Y: AtomicI32 = AtomicI32::new(0);
static BOUND_MAX_X: AtomicI32 = AtomicI32::new(DEFAULT_SCREEN_WIDTH);
static BOUND_MAX_Y: AtomicI32 = AtomicI32::new(DEFAULT_SCREEN_HEIGHT);

static POS_X: AtomicI32 = AtomicI32::new(DEFAULT_SCREEN_WIDTH / 2);
static POS_Y: AtomicI32 = AtomicI32::new(DEFAULT_SCREEN_HEIGHT / 2);
static PREV_BUTTONS: AtomicU8 = AtomicU8::new(0);

static PACKET_INDEX: AtomicUsize = AtomicUsize::new(0);
static PACKET_BYTES: [AtomicU8; 3] = [AtomicU8::new(0), AtomicU8::new(0), AtomicU8::new(0)];

static INITIALIZED: AtomicBool = AtomicBool::new(false);

fn clamp(value: i32, min: i32, max: i32) -> i32 {
    if value < min {
        min
    } else if value > max {
        max
    } else {
        value
    }
}

fn wait_input_ready() -> Result<(), &'static str> {
    let mut status_port = Port::<u8>::new(STATUS_PORT);
    for _ in 0..POLL_ITERATIONS {
        if unsafe { status_port.read() } & 0x02 == 0 {
            return Ok(());
        }
    }
    Err("PS/2: controller input buffer never drained")
}

fn wait_output_ready() -> Result<(), &'static str> {
    let mut status_port = Port::<u8>::new(STATUS_PORT);
    for _ in 0..POLL_ITERATIONS {
        if unsafe { status_port.read() } & 0x01 != 0 {
            return Ok(());
        }
    }
    Err("PS/2: controller never produced output")
}

fn controller_write_command(cmd: u8) -> Result<(), &'static str> {
    wait_input_ready()?;
    unsafe { Port::<u8>::new(COMMAND_PORT).write(cmd) };
    Ok(())
}

fn controller_write_data(byte: u8) -> Result<(), &'static str> {
    wait_input_ready()?;
    unsafe { Port::<u8>::new(DATA_PORT).write(byte) };
    Ok(())
}

fn controller_read_data() -> Result<u8, &'static str> {
    wait_output_ready()?;
    Ok(unsafe { Port::<u8>::new(DATA_PORT).read() })
}

/// Sends one auxiliary-device command, retrying on RESEND up to
/// `MAX_RESEND_RETRIES` times, and returns the ACK/response byte.
fn send_aux_command(byte: u8) -> Result<u8, &'static str> {
    for _ in 0..=MAX_RESEND_RETRIES {
        controller_write_command(CMD_WRITE_AUX)?;
        controller_write_data(byte)?;
        let response = controller_read_data()?;
        if response == RESEND {
            continue;
        }
        return Ok(response);
    }
    Err("PS/2: mouse command exhausted RESEND retries")
}

/// # Safety
/// Must run after the PIC is initialized but before IRQ12 is unmasked.
pub unsafe fn init() -> Result<(), &'static str> {
    controller_write_command(CMD_ENABLE_AUX)?;

    controller_write_command(CMD_READ_CONFIG)?;
    let mut config = controller_read_data()?;
    config |= 1 << 1; // enable IRQ12
    config &= !(1 << 5); // enable the auxiliary clock
    controller_write_command(CMD_WRITE_CONFIG)?;
    controller_write_data(config)?;

    controller_write_command(CMD_TEST_AUX)?;
    let self_test = controller_read_data()?;
    if self_test != 0x00 {
        #[cfg(not(feature = "mouse-no-selftest"))]
        serial::serial_write(b"[MOUSE] auxiliary self-test reported a fault, continuing anyway\n");
    }

    let ack = send_aux_command(MOUSE_RESET)?;
    if ack == ACK {
        let _self_test_result = controller_read_data().unwrap_or(SELF_TEST_PASS);
        let _device_id = controller_read_data().unwrap_or(0);
    }

    send_aux_command(MOUSE_SET_DEFAULTS)?;
    send_aux_command(MOUSE_ENABLE)?;

    POS_X.store(DEFAULT_SCREEN_WIDTH / 2, Ordering::Relaxed);
    POS_Y.store(DEFAULT_SCREEN_HEIGHT / 2, Ordering::Relaxed);
    PREV_BUTTONS.store(0, Ordering::Relaxed);
    PACKET_INDEX.store(0, Ordering::Relaxed);
    ring_flush();

    INITIALIZED.store(true, Ordering::Release);
    serial::serial_write(b"[MOUSE] PS/2 mouse initialized\n");
    Ok(())
}

/// Called from the IRQ12 handler. Reads one byte and, once three bytes
/// have been reassembled, decodes and enqueues the resulting event(s).
pub fn handle_interrupt() {
    let byte = unsafe { Port::<u8>::new(DATA_PORT).read() };

    let index = PACKET_INDEX.load(Ordering::Relaxed);
    if is_resync_discard(index, byte) {
        // resynchronization: byte 0 of a packet always has bit 3 set.
        return;
    }

    PACKET_BYTES[index].store(byte, Ordering::Relaxed);
    let next_index = index + 1;

    if next_index == 3 {
        let packet = [
            PACKET_BYTES[0].load(Ordering::Relaxed),
            PACKET_BYTES[1].load(Ordering::Relaxed),
            PACKET_BYTES[2].load(Ordering::Relaxed),
        ];
        process_packet(packet);
        PACKET_INDEX.store(0, Ordering::Relaxed);
    } else {
        PACKET_INDEX.store(next_index, Ordering::Relaxed);
    }
}

fn is_resync_discard(index: usize, byte: u8) -> bool {
    index == 0 && byte & 0x08 == 0
}

fn button_from_bit(bit: u8) -> MouseButton {
    match bit {
        0 => MouseButton::Left,
        1 => MouseButton::Right,
        _ => MouseButton::Middle,
    }
}

fn process_packet(packet: [u8; 3]) {
    if packet[0] & 0x08 == 0 {
        PACKET_INDEX.store(0, Ordering::Relaxed);
        return;
    }

    if packet[0] & 0xC0 != 0 {
        // overflow bit set on either axis: discard silently.
        return;
    }

    let mut dx = packet[1] as i32;
    if packet[0] & 0x10 != 0 {
        dx |= !0xFFi32;
    }
    let mut dy = packet[2] as i32;
    if packet[0] & 0x20 != 0 {
        dy |= !0xFFi32;
    }

    // hardware reports Y-up; this kernel models Y-down.
    dy = -dy;

    let min_x = BOUND_MIN_X.load(Ordering::Relaxed);
    let min_y = BOUND_MIN_Y.load(Ordering::Relaxed);
    let max_x = BOUND_MAX_X.load(Ordering::Relaxed);
    let max_y = BOUND_MAX_Y.load(Ordering::Relaxed);

    let new_x = clamp(POS_X.load(Ordering::Relaxed) + dx, min_x, max_x);
    let new_y = clamp(POS_Y.load(Ordering::Relaxed) + dy, min_y, max_y);
    POS_X.store(new_x, Ordering::Relaxed);
    POS_Y.store(new_y, Ordering::Relaxed);

    let new_buttons = packet[0] & 0x07;
    let prev_buttons = PREV_BUTTONS.load(Ordering::Relaxed);
    let pressed = new_buttons & !prev_buttons;
    let released = prev_buttons & !new_buttons;

    for bit in 0..3u8 {
        if pressed & (1 << bit) != 0 {
            ring_push(MouseEvent {
                kind: MouseEventKind::ButtonDown(button_from_bit(bit)),
                x: new_x,
                y: new_y,
            });
        }
    }
    for bit in 0..3u8 {
        if released & (1 << bit) != 0 {
            ring_push(MouseEvent {
                kind: MouseEventKind::ButtonUp(button_from_bit(bit)),
                x: new_x,
                y: new_y,
            });
        }
    }

    if dx != 0 || dy != 0 {
        let kind = if new_buttons != 0 {
            MouseEventKind::Drag
        } else {
            MouseEventKind::Move
        };
        ring_push(MouseEvent { kind, x: new_x, y: new_y });
    }

    PREV_BUTTONS.store(new_buttons, Ordering::Relaxed);
}

/// Pops one event, if any. Never blocks.
pub fn get_event(out: &mut MouseEvent) -> bool {
    match ring_pop() {
        Some(event) => {
            *out = event;
            true
        }
        None => false,
    }
}

pub fn has_event() -> bool {
    !ring_is_empty()
}

pub fn flush() {
    ring_flush();
}

/// Sets the clamping rectangle and re-clamps the current position.
pub fn set_bounds(min_x: i32, min_y: i32, max_x: i32, max_y: i32) {
    interrupts::without_interrupts(|| {
        BOUND_MIN_X.store(min_x, Ordering::Relaxed);
        BOUND_MIN_Y.store(min_y, Ordering::Relaxed);
        BOUND_MAX_X.store(max_x, Ordering::Relaxed);
        BOUND_MAX_Y.store(max_y, Ordering::Relaxed);

        let x = clamp(POS_X.load(Ordering::Relaxed), min_x, max_x);
        let y = clamp(POS_Y.load(Ordering::Relaxed), min_y, max_y);
        POS_X.store(x, Ordering::Relaxed);
        POS_Y.store(y, Ordering::Relaxed);
    });
}

pub fn set_position(x: i32, y: i32) {
    interrupts::without_interrupts(|| {
        let min_x = BOUND_MIN_X.load(Ordering::Relaxed);
        let min_y = BOUND_MIN_Y.load(Ordering::Relaxed);
        let max_x = BOUND_MAX_X.load(Ordering::Relaxed);
        let max_y = BOUND_MAX_Y.load(Ordering::Relaxed);
        POS_X.store(clamp(x, min_x, max_x), Ordering::Relaxed);
        POS_Y.store(clamp(y, min_y, max_y), Ordering::Relaxed);
    });
}

pub fn position() -> (i32, i32) {
    interrupts::without_interrupts(|| {
        (POS_X.load(Ordering::Relaxed), POS_Y.load(Ordering::Relaxed))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reset_state() {
        PACKET_INDEX.store(0, Ordering::Relaxed);
        PREV_BUTTONS.store(0, Ordering::Relaxed);
        BOUND_MIN_X.store(0, Ordering::Relaxed);
        BOUND_MIN_Y.store(0, Ordering::Relaxed);
        BOUND_MAX_X.store(100, Ordering::Relaxed);
        BOUND_MAX_Y.store(100, Ordering::Relaxed);
        POS_X.store(50, Ordering::Relaxed);
        POS_Y.store(50, Ordering::Relaxed);
        ring_flush();
    }

    #[test]
    fn test_resync_discards_invalid_first_byte() {
        assert!(is_resync_discard(0, 0x00));
        assert!(!is_resync_discard(0, 0x08));
        assert!(!is_resync_discard(1, 0x00));
    }

    #[test]
    fn test_button_down_up_ordering() {
        reset_state();
        // 0b001 -> 0b100: left released, middle pressed, no motion.
        PREV_BUTTONS.store(0b001, Ordering::Relaxed);
        process_packet([0x08 | 0b100, 0, 0]);

        let first = ring_pop().expect("button down event");
        assert_eq!(first.kind, MouseEventKind::ButtonDown(MouseButton::Middle));
        let second = ring_pop().expect("button up event");
        assert_eq!(second.kind, MouseEventKind::ButtonUp(MouseButton::Left));
        assert!(ring_pop().is_none());
    }

    #[test]
    fn test_clamping_to_bounds() {
        reset_state();
        // dx=+200 (sign bit clear); dy raw 0x38 with sign bit set sign-extends
        // to -200, then the Y-axis inversion turns it into dy=+200.
        process_packet([0x08 | 0x20, 200, 0x38]);
        assert_eq!(position(), (100, 100));
    }

    #[test]
    fn test_overflow_bit_discards_packet() {
        reset_state();
        let before = position();
        process_packet([0x08 | 0x40, 10, 10]);
        assert_eq!(position(), before);
    }

    #[test]
    fn test_ring_drops_newest_on_overflow() {
        reset_state();
        for i in 0..(RING_CAPACITY as i32 + 1) {
            ring_push(MouseEvent {
                kind: MouseEventKind::Move,
                x: i,
                y: i,
            });
        }
        let mut count = 0;
        let mut last_x = -1;
        while let Some(event) = ring_pop() {
            last_x = event.x;
            count += 1;
        }
        assert_eq!(count, RING_CAPACITY);
        assert_eq!(last_x, RING_CAPACITY as i32 - 1);
    }
}
