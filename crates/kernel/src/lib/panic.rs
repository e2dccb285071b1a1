//! Panic handler. No heap, no recovery: print what we can to serial and
//! halt. Guards against panicking again while already printing a panic
//! (e.g. a broken serial write triggering a second fault).

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, Ordering};

static PANICKING: AtomicBool = AtomicBool::new(false);

/// Writes straight through to the serial port; used only during panic
/// handling where a fixed-size staging buffer isn't worth the complexity.
struct DirectSerial;

impl Write for DirectSerial {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        crate::arch::x86_64::serial::serial_write(s.as_bytes());
        Ok(())
    }
}

pub fn panic_handler(info: &core::panic::PanicInfo) -> ! {
    if PANICKING.swap(true, Ordering::SeqCst) {
        // Already panicking; avoid recursing through the formatter again.
        crate::arch::x86_64::serial::serial_write(b"\n[PANIC] (recursive panic, halting now)\n");
        crate::arch::x86_64::boot::halt_forever();
    }

    let mut out = DirectSerial;

    let _ = out.write_str("\n==================== KERNEL PANIC ====================\n");

    if let Some(location) = info.location() {
        let _ = writeln!(
            out,
            "location: {}:{}:{}",
            location.file(),
            location.line(),
            location.column()
        );
    } else {
        let _ = out.write_str("location: <unknown>\n");
    }

    let _ = writeln!(out, "message:  {}", info.message());

    print_register_dump(&mut out);

    let _ = out.write_str("=======================================================\n");

    crate::arch::x86_64::boot::halt_forever();
}

#[cfg(target_arch = "x86_64")]
fn print_register_dump(out: &mut DirectSerial) {
    use x86_64::registers::control::{Cr0, Cr2, Cr3, Cr4};

    let cr0 = Cr0::read_raw();
    let cr2 = Cr2::read().unwrap_or(x86_64::VirtAddr::zero());
    let (cr3_frame, _) = Cr3::read();
    let cr4 = Cr4::read_raw();

    let _ = writeln!(out, "cr0: {:#x}  cr2: {:#x}", cr0, cr2.as_u64());
    let _ = writeln!(
        out,
        "cr3: {:#x}  cr4: {:#x}",
        cr3_frame.start_address().as_u64(),
        cr4
    );
}

#[cfg(not(target_arch = "x86_64"))]
fn print_register_dump(_out: &mut DirectSerial) {}
