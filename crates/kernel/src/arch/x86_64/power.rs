//! ACPI power control: SCI enable/disable and the shutdown/reboot
//! fallback chains.
//!
//! Every primitive here degrades gracefully when the FADT is missing or
//! a step doesn't take effect; `acpi_shutdown`/`acpi_reboot` walk their
//! full fallback chain rather than trusting the first method to work.

use x86_64::instructions::port::Port;
use x86_64::structures::DescriptorTablePointer;
use x86_64::VirtAddr;

use super::acpi;
use super::serial;

const SCI_EN: u16 = 1 << 0;
const SLP_EN: u16 = 1 << 13;
const SLP_TYP_SHIFT: u16 = 10;
// Platform S5 sleep type value; real systems read this from the DSDT's
// \_S5 package. AML isn't interpreted here, so this assumes the common
// QEMU/OVMF value of 0.
const SLP_TYP_S5: u16 = 0;

const POLL_ITERATIONS: u32 = 1000;

fn io_delay() {
    unsafe {
        Port::<u8>::new(0x80).write(0u8);
    }
}

fn sci_set(pm1a_cnt: u16) -> bool {
    unsafe { Port::<u16>::new(pm1a_cnt).read() & SCI_EN != 0 }
}

/// Writes `command` to the SMI command port and polls PM1a control for
/// SCI_EN to reach `want_set`, bailing out after `POLL_ITERATIONS`.
/// Shared by `acpi_enable` and `acpi_disable`, which differ only in
/// which command byte they send and which SCI_EN state they wait for.
fn smi_command_and_poll(smi_command_port: u32, command: u8, pm1a_cnt: u16, want_set: bool) -> Result<(), &'static str> {
    unsafe {
        Port::<u8>::new(smi_command_port as u16).write(command);
    }

    for _ in 0..POLL_ITERATIONS {
        if sci_set(pm1a_cnt) == want_set {
            return Ok(());
        }
        io_delay();
    }
    if want_set {
        Err("ACPI: timed out waiting for SCI_EN")
    } else {
        Err("ACPI: timed out waiting for SCI_EN to clear")
    }
}

/// Enables the ACPI SCI via the FADT's SMI command port.
pub fn acpi_enable() -> Result<(), &'static str> {
    let fadt = acpi::fadt().ok_or("ACPI: FADT unavailable")?;
    let pm1a_cnt = fadt.pm1a_control_block as u16;

    if sci_set(pm1a_cnt) {
        return Ok(());
    }
    if fadt.smi_command_port == 0 {
        return Ok(());
    }

    smi_command_and_poll(fadt.smi_command_port, fadt.acpi_enable_value, pm1a_cnt, true)
}

/// Disables the ACPI SCI, symmetric to `acpi_enable`.
pub fn acpi_disable() -> Result<(), &'static str> {
    let fadt = acpi::fadt().ok_or("ACPI: FADT unavailable")?;
    let pm1a_cnt = fadt.pm1a_control_block as u16;

    if !sci_set(pm1a_cnt) {
        return Ok(());
    }
    if fadt.smi_command_port == 0 {
        return Ok(());
    }

    smi_command_and_poll(fadt.smi_command_port, fadt.acpi_disable_value, pm1a_cnt, false)
}

/// Enters ACPI S5 (soft off). Halts forever if the write doesn't take.
pub fn acpi_shutdown() -> ! {
    serial::serial_write(b"[POWER] ACPI shutdown requested\n");
    let _ = acpi_enable();

    if let Some(fadt) = acpi::fadt() {
        let value = (SLP_TYP_S5 << SLP_TYP_SHIFT) | SLP_EN;
        unsafe {
            if fadt.pm1a_control_block != 0 {
                Port::<u16>::new(fadt.pm1a_control_block as u16).write(value);
            }
            if fadt.pm1b_control_block != 0 {
                Port::<u16>::new(fadt.pm1b_control_block as u16).write(value);
            }
        }
    }

    serial::serial_write(b"[POWER] ACPI shutdown did not take effect, halting\n");
    super::boot::halt_forever();
}

/// Resets the system: ACPI reset register, then keyboard controller
/// pulse, then a forced triple fault.
pub fn acpi_reboot() -> ! {
    serial::serial_write(b"[POWER] ACPI reboot requested\n");

    if let Some(fadt) = acpi::fadt() {
        if fadt.revision >= 2 && fadt.reset_reg_address != 0 {
            unsafe {
                match fadt.reset_reg_space_id {
                    0 => core::ptr::write_volatile(fadt.reset_reg_address as *mut u8, fadt.reset_value),
                    1 => Port::<u8>::new(fadt.reset_reg_address as u16).write(fadt.reset_value),
                    _ => {}
                }
            }
        }
    }

    serial::serial_write(b"[POWER] ACPI reset register didn't take, trying keyboard controller\n");
    unsafe {
        Port::<u8>::new(0x64).write(0xFEu8);
    }

    serial::serial_write(b"[POWER] keyboard controller reset didn't take, forcing triple fault\n");
    force_triple_fault();
}

fn force_triple_fault() -> ! {
    let zero_idt = DescriptorTablePointer {
        limit: 0,
        base: VirtAddr::new(0),
    };
    unsafe {
        x86_64::instructions::tables::lidt(&zero_idt);
        core::arch::asm!("int3");
    }
    loop {
        x86_64::instructions::hlt();
    }
}

/// # Safety
/// Must run after `acpi::init` has parsed the FADT.
pub unsafe fn init() {
    serial::serial_write(b"[POWER] power management ready\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_s5_value_composition() {
        let value = (SLP_TYP_S5 << SLP_TYP_SHIFT) | SLP_EN;
        assert_eq!(value & SLP_EN, SLP_EN);
    }
}
