//! Early boot sequence: the first Rust code that runs after the loader
//! hands off control.
//!
//! ```text
//! _start(handoff)
//!     -> early_init()
//!         1. disable interrupts
//!         2. load GDT
//!         3. load TSS
//!         4. load IDT
//!         5. enable CPU features (SSE2/APIC required, rest opportunistic)
//!         6. init serial console, flush bootlog
//!         7. init legacy PIC, enable IRQ12 (mouse)
//!         8. enable interrupts
//! ```
//!
//! ACPI discovery and the PS/2 mouse driver are brought up by the caller
//! once `early_init` returns, since both need the handoff's memory map.

use crate::arch::x86_64::{cpu, gdt, idt, pic, serial, tss};

/// # Safety
/// Must run exactly once during boot, before any other kernel code, with
/// the CPU already in 64-bit long mode with paging enabled (the loader's
/// job) and interrupts not yet relied upon.
pub unsafe fn early_init() -> Result<(), &'static str> {
    x86_64::instructions::interrupts::disable();

    gdt::init_gdt();
    tss::init_tss();
    idt::init_idt_early();
    cpu::enable_cpu_features()?;
    serial::init_serial()?;
    crate::lib::bootlog::flush();

    serial::serial_write(b"\n");
    serial::serial_write(
        b"================================================================================\n",
    );
    serial::serial_write(b"                         SIS Kernel - x86_64 Architecture\n");
    serial::serial_write(
        b"================================================================================\n",
    );
    serial::serial_write(b"\n");
    serial::serial_write(b"[BOOT] Early initialization started\n");
    serial::serial_write(b"[BOOT] GDT loaded\n");
    serial::serial_write(b"[BOOT] TSS loaded\n");
    serial::serial_write(b"[BOOT] IDT loaded\n");
    serial::serial_write(b"[BOOT] CPU features enabled\n");
    serial::serial_write(b"[BOOT] Serial console initialized\n");

    cpu::print_cpu_info();

    #[cfg(debug_assertions)]
    {
        tss::validate_tss()?;
        serial::serial_write(b"[BOOT] TSS validation passed\n");
    }

    pic::init();
    pic::enable_irq(pic::Irq::Mouse);

    serial::serial_write(b"[BOOT] Enabling interrupts...\n");
    x86_64::instructions::interrupts::enable();

    serial::serial_write(b"[BOOT] Interrupts enabled\n");
    serial::serial_write(b"[BOOT] Early initialization complete\n");
    serial::serial_write(b"\n");

    Ok(())
}

/// Checks that the CPU has what this kernel needs before trusting it to
/// run the rest of boot.
pub fn validate_hardware() -> Result<(), &'static str> {
    let features = cpu::detect_cpu_features();

    if !features.has_sse2 {
        return Err("CPU does not support SSE2 (required for Rust)");
    }
    if !features.has_apic {
        return Err("CPU does not support APIC (required for interrupts)");
    }

    Ok(())
}

/// Used when a critical error occurs during boot and recovery isn't
/// possible.
pub fn halt_forever() -> ! {
    serial::serial_write(b"\n[BOOT] FATAL ERROR - System halted\n");

    loop {
        x86_64::instructions::interrupts::disable();
        x86_64::instructions::hlt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_hardware() {
        assert!(validate_hardware().is_ok());
    }
}
