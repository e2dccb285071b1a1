//! ACPI table discovery and parsing: RSDP location, RSDT/XSDT root
//! selection, table lookup by signature, and MADT/FADT extraction.
//!
//! AML is never interpreted; only the fixed-layout tables (MADT, FADT)
//! are read. Tables are assumed identity-mapped, which holds for the
//! low-memory addresses firmware places them at.

use core::mem::size_of;
use spin::Once;

use crate::arch::x86_64::serial;

const EBDA_SEGMENT_PTR: usize = 0x040E;
const EBDA_SEARCH_LEN: usize = 1024;
const LEGACY_SEARCH_START: usize = 0xE0000;
const LEGACY_SEARCH_END: usize = 0x100000;
const RSDP_ALIGN: usize = 16;

pub const MAX_LAPICS: usize = 64;
pub const MAX_IOAPICS: usize = 8;
pub const MAX_OVERRIDES: usize = 16;

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct RsdpV1 {
    signature: [u8; 8],
    checksum: u8,
    oem_id: [u8; 6],
    revision: u8,
    rsdt_address: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct RsdpV2 {
    v1: RsdpV1,
    length: u32,
    xsdt_address: u64,
    extended_checksum: u8,
    reserved: [u8; 3],
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct SdtHeader {
    signature: [u8; 4],
    length: u32,
    revision: u8,
    checksum: u8,
    oem_id: [u8; 6],
    oem_table_id: [u8; 8],
    oem_revision: u32,
    creator_id: u32,
    creator_revision: u32,
}

const SDT_HEADER_SIZE: usize = 36;

#[repr(C, packed)]
struct MadtHeader {
    sdt: SdtHeader,
    local_apic_address: u32,
    flags: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct GenericAddress {
    address_space_id: u8,
    register_bit_width: u8,
    register_bit_offset: u8,
    access_size: u8,
    address: u64,
}

#[repr(C, packed)]
struct FadtRaw {
    sdt: SdtHeader,
    firmware_ctrl: u32,
    dsdt: u32,
    reserved0: u8,
    preferred_pm_profile: u8,
    sci_interrupt: u16,
    smi_command_port: u32,
    acpi_enable: u8,
    acpi_disable: u8,
    s4bios_req: u8,
    pstate_cnt: u8,
    pm1a_event_block: u32,
    pm1b_event_block: u32,
    pm1a_control_block: u32,
    pm1b_control_block: u32,
    pm2_control_block: u32,
    pm_timer_block: u32,
    gpe0_block: u32,
    gpe1_block: u32,
    pm1_event_length: u8,
    pm1_control_length: u8,
    pm2_control_length: u8,
    pm_timer_length: u8,
    gpe0_block_length: u8,
    gpe1_block_length: u8,
    gpe1_base: u8,
    cst_cnt: u8,
    p_level2_latency: u16,
    p_level3_latency: u16,
    flush_size: u16,
    flush_stride: u16,
    duty_offset: u8,
    duty_width: u8,
    day_alarm: u8,
    month_alarm: u8,
    century: u8,
    iapc_boot_arch: u16,
    reserved1: u8,
    flags: u32,
    reset_reg: GenericAddress,
    reset_value: u8,
    reserved2: [u8; 3],
}

/// Cached subset of the FADT used by power management.
#[derive(Clone, Copy, Default)]
pub struct FadtView {
    pub sci_interrupt: u16,
    pub smi_command_port: u32,
    pub acpi_enable_value: u8,
    pub acpi_disable_value: u8,
    pub pm1a_control_block: u32,
    pub pm1b_control_block: u32,
    pub reset_reg_space_id: u8,
    pub reset_reg_address: u64,
    pub reset_value: u8,
    pub revision: u8,
}

#[derive(Clone, Copy, Default)]
pub struct LapicEntry {
    pub processor_id: u8,
    pub apic_id: u8,
    pub enabled: bool,
}

#[derive(Clone, Copy, Default)]
pub struct IoApicEntry {
    pub id: u8,
    pub mmio_address: u32,
    pub gsi_base: u32,
}

#[derive(Clone, Copy, Default)]
pub struct OverrideEntry {
    pub legacy_irq: u8,
    pub gsi: u32,
    pub flags: u16,
}

pub struct Madt {
    pub local_apic_address: u32,
    pub legacy_pic_present: bool,
    pub cpus: [LapicEntry; MAX_LAPICS],
    pub cpu_count: usize,
    pub ioapics: [IoApicEntry; MAX_IOAPICS],
    pub ioapic_count: usize,
    pub overrides: [OverrideEntry; MAX_OVERRIDES],
    pub override_count: usize,
}

enum RootTable {
    Rsdt(u32),
    Xsdt(u64),
}

struct AcpiState {
    root: RootTable,
    madt: Option<Madt>,
    fadt: Option<FadtView>,
}

static ACPI_STATE: Once<AcpiState> = Once::new();

unsafe fn checksum_region(addr: usize, len: usize) -> bool {
    let mut sum: u8 = 0;
    for i in 0..len {
        sum = sum.wrapping_add(core::ptr::read((addr + i) as *const u8));
    }
    sum == 0
}

fn validate_rsdp(addr: usize) -> bool {
    let sig = unsafe { core::slice::from_raw_parts(addr as *const u8, 8) };
    if sig != b"RSD PTR " {
        return false;
    }
    if !unsafe { checksum_region(addr, size_of::<RsdpV1>()) } {
        return false;
    }
    let v1 = unsafe { core::ptr::read_unaligned(addr as *const RsdpV1) };
    if v1.revision >= 2 {
        let v2 = unsafe { core::ptr::read_unaligned(addr as *const RsdpV2) };
        if !unsafe { checksum_region(addr, v2.length as usize) } {
            return false;
        }
    }
    true
}

fn scan_for_rsdp(start: usize, end: usize) -> Option<usize> {
    let mut addr = start;
    while addr + size_of::<RsdpV1>() <= end {
        if validate_rsdp(addr) {
            return Some(addr);
        }
        addr += RSDP_ALIGN;
    }
    None
}

fn find_rsdp() -> Option<usize> {
    let ebda_segment = unsafe { core::ptr::read(EBDA_SEGMENT_PTR as *const u16) };
    if ebda_segment != 0 {
        let ebda_addr = (ebda_segment as usize) << 4;
        if let Some(addr) = scan_for_rsdp(ebda_addr, ebda_addr + EBDA_SEARCH_LEN) {
            return Some(addr);
        }
    }
    scan_for_rsdp(LEGACY_SEARCH_START, LEGACY_SEARCH_END)
}

fn select_root_table(rsdp_addr: usize) -> RootTable {
    let v1 = unsafe { core::ptr::read_unaligned(rsdp_addr as *const RsdpV1) };
    if v1.revision >= 2 {
        let v2 = unsafe { core::ptr::read_unaligned(rsdp_addr as *const RsdpV2) };
        if v2.xsdt_address != 0 && unsafe { checksum_region(v2.xsdt_address as usize, SDT_HEADER_SIZE) } {
            return RootTable::Xsdt(v2.xsdt_address);
        }
    }
    RootTable::Rsdt(v1.rsdt_address)
}

fn find_table_in_root(root: &RootTable, sig: &[u8; 4]) -> Option<usize> {
    let (root_addr, entry_width): (usize, usize) = match *root {
        RootTable::Rsdt(addr) => (addr as usize, 4),
        RootTable::Xsdt(addr) => (addr as usize, 8),
    };

    let header = unsafe { core::ptr::read_unaligned(root_addr as *const SdtHeader) };
    let length = header.length as usize;
    if length < SDT_HEADER_SIZE {
        return None;
    }
    let entry_count = (length - SDT_HEADER_SIZE) / entry_width;
    let entries_addr = root_addr + SDT_HEADER_SIZE;

    for i in 0..entry_count {
        let entry_addr = if entry_width == 4 {
            unsafe { core::ptr::read_unaligned((entries_addr + i * 4) as *const u32) as usize }
        } else {
            unsafe { core::ptr::read_unaligned((entries_addr + i * 8) as *const u64) as usize }
        };
        if entry_addr == 0 {
            continue;
        }

        let entry_header = unsafe { core::ptr::read_unaligned(entry_addr as *const SdtHeader) };
        if &entry_header.signature != sig {
            continue;
        }
        if unsafe { checksum_region(entry_addr, entry_header.length as usize) } {
            return Some(entry_addr);
        }
        serial::serial_write(b"[ACPI] table failed checksum, skipping\n");
    }
    None
}

fn parse_madt(addr: usize) -> Madt {
    let header = unsafe { core::ptr::read_unaligned(addr as *const MadtHeader) };
    let mut madt = Madt {
        local_apic_address: header.local_apic_address,
        legacy_pic_present: header.flags & 1 != 0,
        cpus: [LapicEntry::default(); MAX_LAPICS],
        cpu_count: 0,
        ioapics: [IoApicEntry::default(); MAX_IOAPICS],
        ioapic_count: 0,
        overrides: [OverrideEntry::default(); MAX_OVERRIDES],
        override_count: 0,
    };

    let end = addr + header.sdt.length as usize;
    let mut ptr = addr + size_of::<MadtHeader>();

    while ptr < end {
        let entry_type = unsafe { core::ptr::read(ptr as *const u8) };
        let entry_length = unsafe { core::ptr::read((ptr + 1) as *const u8) } as usize;
        if entry_length < 2 || ptr + entry_length > end {
            break;
        }

        match entry_type {
            0 => {
                if madt.cpu_count < MAX_LAPICS {
                    let processor_id = unsafe { core::ptr::read((ptr + 2) as *const u8) };
                    let apic_id = unsafe { core::ptr::read((ptr + 3) as *const u8) };
                    let flags = unsafe { core::ptr::read_unaligned((ptr + 4) as *const u32) };
                    madt.cpus[madt.cpu_count] = LapicEntry {
                        processor_id,
                        apic_id,
                        enabled: flags & 1 != 0,
                    };
                    madt.cpu_count += 1;
                }
            }
            1 => {
                if madt.ioapic_count < MAX_IOAPICS {
                    let id = unsafe { core::ptr::read((ptr + 2) as *const u8) };
                    let mmio_address = unsafe { core::ptr::read_unaligned((ptr + 4) as *const u32) };
                    let gsi_base = unsafe { core::ptr::read_unaligned((ptr + 8) as *const u32) };
                    madt.ioapics[madt.ioapic_count] = IoApicEntry {
                        id,
                        mmio_address,
                        gsi_base,
                    };
                    madt.ioapic_count += 1;
                }
            }
            2 => {
                if madt.override_count < MAX_OVERRIDES {
                    let legacy_irq = unsafe { core::ptr::read((ptr + 3) as *const u8) };
                    let gsi = unsafe { core::ptr::read_unaligned((ptr + 4) as *const u32) };
                    let flags = unsafe { core::ptr::read_unaligned((ptr + 8) as *const u16) };
                    madt.overrides[madt.override_count] = OverrideEntry {
                        legacy_irq,
                        gsi,
                        flags,
                    };
                    madt.override_count += 1;
                }
            }
            4 => {
                serial::serial_write(b"[ACPI] MADT: LAPIC NMI entry\n");
            }
            5 => {
                // lower 32 bits only; see DESIGN.md on the 64-bit override.
                let lapic_address = unsafe { core::ptr::read_unaligned((ptr + 4) as *const u64) };
                madt.local_apic_address = lapic_address as u32;
            }
            _ => {
                serial::serial_write(b"[ACPI] MADT: unknown entry type\n");
            }
        }

        ptr += entry_length;
    }

    madt
}

fn parse_fadt(addr: usize) -> FadtView {
    let raw = unsafe { core::ptr::read_unaligned(addr as *const FadtRaw) };
    FadtView {
        sci_interrupt: raw.sci_interrupt,
        smi_command_port: raw.smi_command_port,
        acpi_enable_value: raw.acpi_enable,
        acpi_disable_value: raw.acpi_disable,
        pm1a_control_block: raw.pm1a_control_block,
        pm1b_control_block: raw.pm1b_control_block,
        reset_reg_space_id: raw.reset_reg.address_space_id,
        reset_reg_address: raw.reset_reg.address,
        reset_value: raw.reset_value,
        revision: raw.sdt.revision,
    }
}

/// # Safety
/// Must run after the boot console is initialized, with low memory
/// still identity-mapped as handed off by the loader.
pub unsafe fn init() {
    let Some(rsdp_addr) = find_rsdp() else {
        serial::serial_write(b"[ACPI] RSDP not found\n");
        return;
    };

    let root = select_root_table(rsdp_addr);
    let madt = find_table_in_root(&root, b"APIC").map(parse_madt);
    let fadt = find_table_in_root(&root, b"FACP").map(parse_fadt);

    if madt.is_some() {
        serial::serial_write(b"[ACPI] MADT found\n");
    }
    if fadt.is_some() {
        serial::serial_write(b"[ACPI] FADT found\n");
    }

    ACPI_STATE.call_once(|| AcpiState { root, madt, fadt });
    serial::serial_write(b"[ACPI] initialization complete\n");
}

pub fn fadt() -> Option<FadtView> {
    ACPI_STATE.get().and_then(|s| s.fadt)
}

pub fn madt_cpu_count() -> usize {
    ACPI_STATE
        .get()
        .and_then(|s| s.madt.as_ref())
        .map(|m| m.cpu_count)
        .unwrap_or(0)
}

pub fn madt_ioapic_count() -> usize {
    ACPI_STATE
        .get()
        .and_then(|s| s.madt.as_ref())
        .map(|m| m.ioapic_count)
        .unwrap_or(0)
}

pub fn find_table(sig: &[u8; 4]) -> Option<usize> {
    ACPI_STATE.get().and_then(|s| find_table_in_root(&s.root, sig))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sdt_header_size() {
        assert_eq!(size_of::<SdtHeader>(), 36);
    }

    #[test]
    fn test_rsdp_sizes() {
        assert_eq!(size_of::<RsdpV1>(), 20);
        assert_eq!(size_of::<RsdpV2>(), 36);
    }

    #[test]
    fn test_checksum_region_detects_mismatch() {
        let bytes: [u8; 4] = [1, 2, 3, 4];
        let addr = bytes.as_ptr() as usize;
        assert!(!unsafe { checksum_region(addr, 4) });

        let good: [u8; 4] = [0xFC, 2, 3, 4];
        // sum = 0xFC + 2 + 3 + 4 = 0x105, low byte 0x05, not zero: pick values that sum to 0 mod 256
        let zeroed: [u8; 2] = [0x01, 0xFF];
        let addr2 = zeroed.as_ptr() as usize;
        assert!(unsafe { checksum_region(addr2, 2) });
        let _ = good;
    }

    #[test]
    fn test_madt_entry_struct_defaults() {
        let entry = LapicEntry::default();
        assert_eq!(entry.processor_id, 0);
        assert!(!entry.enabled);
    }
}
