//! x86_64 platform support: boot sequencing, CPU/GDT/IDT/TSS setup, the
//! legacy PIC, serial console, ACPI table discovery and power control, and
//! the PS/2 mouse driver.
//!
//! Context switching, paging, and the scheduler itself live outside this
//! crate; this module assumes an identity-mapped address space handed off
//! by the loader and never allocates.

pub mod acpi;
pub mod boot;
pub mod cpu;
pub mod gdt;
pub mod idt;
pub mod mouse;
pub mod pic;
pub mod power;
pub mod serial;
pub mod tss;

pub use cpu::*;
pub use gdt::init_gdt;
pub use idt::init_idt_early;
pub use serial::{init_serial, serial_read, serial_write};
pub use tss::init_tss;

/// Halt the CPU until the next interrupt.
#[inline]
pub fn halt() {
    x86_64::instructions::hlt();
}
