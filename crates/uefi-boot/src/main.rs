//! UEFI chainloader: reads the kernel ELF image from the boot filesystem,
//! loads its `PT_LOAD` segments into physical memory, negotiates a linear
//! framebuffer, exits boot services, and jumps to the kernel entry point
//! with a [`boot_protocol::BootHandoff`] pointer in the first argument
//! register.
//!
//! Past `exit_boot_services()` there is no recovery path: any failure
//! there halts the machine rather than returning.

#![no_main]
#![no_std]

extern crate alloc;

use alloc::vec::Vec;
use boot_protocol::{BootHandoff, MemoryMapEntry, MemoryType, HANDOFF_MAGIC};
use core::mem;
use log::{error, info, warn};
use uefi::prelude::*;
use uefi::proto::console::gop::{GraphicsOutput, PixelFormat};
use uefi::proto::loaded_image::LoadedImage;
use uefi::proto::media::file::{File, FileAttribute, FileInfo, FileMode};
use uefi::proto::media::fs::SimpleFileSystem;
use uefi::table::boot::{AllocateType, MemoryMap, MemoryType as UefiMemoryType};
use uefi::CStr16;

const KERNEL_PATH: &CStr16 = cstr16!("\\EFI\\SIS\\KERNEL.ELF");

/// Maximum number of memory-map entries carried in the handoff.
const MAX_MEMORY_MAP_ENTRIES: usize = 256;

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EM_X86_64: u16 = 0x3E;
const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;
const PT_LOAD: u32 = 1;

#[repr(C)]
#[derive(Clone, Copy)]
struct Elf64Ehdr {
    e_ident: [u8; 16],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_shoff: u64,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Elf64Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

#[derive(Debug)]
enum LoaderError {
    FileNotFound,
    InvalidElf(&'static str),
    AllocationFailed,
    ExitBootServicesFailed,
}

/// Translate a firmware memory-descriptor type into the compact semantic
/// vocabulary the kernel understands.
fn translate_memory_type(raw: UefiMemoryType) -> MemoryType {
    match raw {
        UefiMemoryType::LOADER_CODE
        | UefiMemoryType::LOADER_DATA
        | UefiMemoryType::BOOT_SERVICES_CODE
        | UefiMemoryType::BOOT_SERVICES_DATA
        | UefiMemoryType::CONVENTIONAL => MemoryType::Usable,
        UefiMemoryType::ACPI_RECLAIM => MemoryType::AcpiReclaim,
        UefiMemoryType::ACPI_NON_VOLATILE => MemoryType::AcpiNvs,
        UefiMemoryType::UNUSABLE => MemoryType::Bad,
        _ => MemoryType::Reserved,
    }
}

/// Ask firmware for its native memory map and translate + sort it into the
/// compact form the kernel consumes. Returns the translated entries plus
/// the raw map's key (needed unchanged for `ExitBootServices`).
fn get_memory_map(bt: &BootServices) -> Result<(Vec<MemoryMapEntry>, usize), LoaderError> {
    let map_size = bt.memory_map_size();
    // Headroom: firmware allocations below can grow the map between the
    // size query and the fetch.
    let buf_size = map_size.map_size + 8 * map_size.entry_size;
    let mut buffer = alloc::vec![0u8; buf_size];

    let memory_map = bt
        .memory_map(&mut buffer)
        .map_err(|_| LoaderError::AllocationFailed)?;

    let mut entries: Vec<MemoryMapEntry> = memory_map
        .entries()
        .map(|desc| MemoryMapEntry {
            base: desc.phys_start,
            length: desc.page_count * 4096,
            type_: translate_memory_type(desc.ty) as u32,
            attributes: desc.att.bits() as u32,
        })
        .collect();

    entries.sort_by_key(|e| e.base);
    entries.truncate(MAX_MEMORY_MAP_ENTRIES);

    let key = memory_map.meta().map_key.0;
    Ok((entries, key))
}

/// Enumerate GOP modes and pick one with 32-bit RGB/BGR pixel format,
/// width in [800, 1920], height >= 600, maximizing area; ties keep the
/// current mode. Falls back to the legacy VGA text-mode framebuffer
/// description if no GOP handle is present.
fn setup_framebuffer(bt: &BootServices) -> (u64, u32, u32, u32, u32) {
    let gop_handle = match bt.get_handle_for_protocol::<GraphicsOutput>() {
        Ok(h) => h,
        Err(_) => {
            warn!("[BOOT] no GOP handle, falling back to VGA text framebuffer");
            return (0xB8000, 80, 25, 16, 160);
        }
    };

    let mut gop = match bt.open_protocol_exclusive::<GraphicsOutput>(gop_handle) {
        Ok(p) => p,
        Err(_) => return (0xB8000, 80, 25, 16, 160),
    };

    let current = gop.current_mode_info();
    let mut best: Option<(usize, usize, usize)> = None; // (mode_index, area, stride)
    let mut best_is_current = false;

    for mode in gop.modes(bt) {
        let info = mode.info();
        let (w, h) = info.resolution();
        let fmt_ok = matches!(info.pixel_format(), PixelFormat::Rgb | PixelFormat::Bgr);
        if !fmt_ok || w < 800 || w > 1920 || h < 600 {
            continue;
        }
        let area = w * h;
        let is_current = info.resolution() == current.resolution();
        let better = match &best {
            None => true,
            Some((_, best_area, _)) => area > *best_area || (area == *best_area && is_current),
        };
        if better {
            best = Some((mode.index() as usize, area, info.stride()));
            best_is_current = is_current;
        }
    }
    let _ = best_is_current;

    if let Some((mode_index, _, stride)) = best {
        if let Ok(mode) = gop.query_mode(mode_index as u32, bt) {
            let _ = gop.set_mode(&mode);
        }
        let info = gop.current_mode_info();
        let (w, h) = info.resolution();
        let fb = gop.frame_buffer();
        return (
            fb.as_mut_ptr() as u64,
            w as u32,
            h as u32,
            32,
            (stride * 4) as u32,
        );
    }

    let info = gop.current_mode_info();
    let (w, h) = info.resolution();
    let fb = gop.frame_buffer();
    (fb.as_mut_ptr() as u64, w as u32, h as u32, 32, (info.stride() * 4) as u32)
}

/// Open the boot filesystem and read the kernel ELF image fully into a
/// firmware-allocated buffer.
fn read_kernel_file(bt: &BootServices, image: Handle) -> Result<Vec<u8>, LoaderError> {
    let loaded_image = bt
        .open_protocol_exclusive::<LoadedImage>(image)
        .map_err(|_| LoaderError::FileNotFound)?;
    let device = loaded_image.device().ok_or(LoaderError::FileNotFound)?;

    let mut fs = bt
        .open_protocol_exclusive::<SimpleFileSystem>(device)
        .map_err(|_| LoaderError::FileNotFound)?;
    let mut root = fs.open_volume().map_err(|_| LoaderError::FileNotFound)?;

    let handle = root
        .open(KERNEL_PATH, FileMode::Read, FileAttribute::empty())
        .map_err(|_| LoaderError::FileNotFound)?;
    let mut file = handle.into_regular_file().ok_or(LoaderError::FileNotFound)?;

    let info_buf_size = mem::size_of::<FileInfo>() + 256;
    let mut info_buf = alloc::vec![0u8; info_buf_size];
    let info = file
        .get_info::<FileInfo>(&mut info_buf)
        .map_err(|_| LoaderError::FileNotFound)?;
    let file_size = info.file_size() as usize;

    let mut data = alloc::vec![0u8; file_size];
    file.read(&mut data).map_err(|_| LoaderError::FileNotFound)?;
    Ok(data)
}

/// Validate the ELF header, load `PT_LOAD` segments into physical memory,
/// and return the physical entry point.
fn load_kernel(bt: &BootServices, elf_data: &[u8]) -> Result<u64, LoaderError> {
    if elf_data.len() < mem::size_of::<Elf64Ehdr>() {
        return Err(LoaderError::InvalidElf("file too short for ELF header"));
    }
    let ehdr = unsafe { &*(elf_data.as_ptr() as *const Elf64Ehdr) };

    if ehdr.e_ident[0..4] != ELF_MAGIC {
        return Err(LoaderError::InvalidElf("bad magic"));
    }
    if ehdr.e_ident[4] != ELFCLASS64 {
        return Err(LoaderError::InvalidElf("not 64-bit"));
    }
    if ehdr.e_ident[5] != ELFDATA2LSB {
        return Err(LoaderError::InvalidElf("not little-endian"));
    }
    if ehdr.e_machine != EM_X86_64 {
        return Err(LoaderError::InvalidElf("not x86_64"));
    }
    if ehdr.e_type != ET_EXEC && ehdr.e_type != ET_DYN {
        return Err(LoaderError::InvalidElf("not EXEC or DYN"));
    }

    let phoff = ehdr.e_phoff as usize;
    let phnum = ehdr.e_phnum as usize;
    let phentsize = ehdr.e_phentsize as usize;

    // First pass: compute [min_vaddr, max_vaddr) over PT_LOAD segments.
    let mut min_vaddr = u64::MAX;
    let mut max_vaddr = 0u64;
    for i in 0..phnum {
        let off = phoff + i * phentsize;
        if off + phentsize > elf_data.len() {
            return Err(LoaderError::InvalidElf("program header out of bounds"));
        }
        let phdr = unsafe { &*(elf_data.as_ptr().add(off) as *const Elf64Phdr) };
        if phdr.p_type != PT_LOAD {
            continue;
        }
        min_vaddr = min_vaddr.min(phdr.p_vaddr);
        max_vaddr = max_vaddr.max(phdr.p_vaddr + phdr.p_memsz);
    }
    if min_vaddr == u64::MAX {
        return Err(LoaderError::InvalidElf("no PT_LOAD segments"));
    }

    let mut offset = boot_protocol::load_offset(min_vaddr);
    let span = (max_vaddr - min_vaddr) as usize;
    let pages = (span + 4095) / 4096 + 1;

    let target_phys = min_vaddr - offset;
    let phys_base = match bt.allocate_pages(
        AllocateType::Address(target_phys),
        UefiMemoryType::LOADER_DATA,
        pages,
    ) {
        Ok(base) => base,
        Err(_) => {
            info!("[BOOT] fixed-address allocation failed, retrying at any address");
            let base = bt
                .allocate_pages(AllocateType::AnyPages, UefiMemoryType::LOADER_DATA, pages)
                .map_err(|_| LoaderError::AllocationFailed)?;
            offset = min_vaddr - base;
            base
        }
    };

    unsafe {
        core::ptr::write_bytes(phys_base as *mut u8, 0, pages * 4096);
    }

    // Second pass: copy segment contents. Two-pass avoids retaining any
    // parsed pointer into `elf_data` past the point the buffer is freed.
    for i in 0..phnum {
        let off = phoff + i * phentsize;
        let phdr = unsafe { &*(elf_data.as_ptr().add(off) as *const Elf64Phdr) };
        if phdr.p_type != PT_LOAD {
            continue;
        }
        let file_off = phdr.p_offset as usize;
        let filesz = phdr.p_filesz as usize;
        if file_off + filesz > elf_data.len() {
            return Err(LoaderError::InvalidElf("segment out of bounds"));
        }
        let dest_phys = phdr.p_vaddr - offset;
        unsafe {
            core::ptr::copy_nonoverlapping(
                elf_data.as_ptr().add(file_off),
                dest_phys as *mut u8,
                filesz,
            );
        }
        // memsz - filesz (BSS) is already zero from the bulk zero-fill above.
    }

    Ok(ehdr.e_entry - offset)
}

#[entry]
fn efi_main(image: Handle, mut system_table: SystemTable<Boot>) -> Status {
    uefi_services::init(&mut system_table).unwrap();
    info!("SIS UEFI loader starting");

    let status = run(image, &system_table);
    match status {
        Ok(()) => Status::SUCCESS,
        Err(e) => {
            error!("boot aborted: {:?}", e);
            Status::LOAD_ERROR
        }
    }
}

fn run(image: Handle, system_table: &SystemTable<Boot>) -> Result<(), LoaderError> {
    let bt = system_table.boot_services();

    info!("[BOOT] reading kernel image");
    let elf_data = read_kernel_file(bt, image)?;

    info!("[BOOT] loading ELF segments");
    let entry_phys = load_kernel(bt, &elf_data)?;
    drop(elf_data);

    info!("[BOOT] negotiating framebuffer");
    let (fb_addr, fb_width, fb_height, fb_bpp, fb_pitch) = setup_framebuffer(bt);

    info!("[BOOT] building final memory map and exiting boot services");
    let (entries, _first_key) = get_memory_map(bt)?;

    let map_pages = (entries.len() * MemoryMapEntry::SIZE + 4095) / 4096 + 1;
    let map_phys = bt
        .allocate_pages(
            AllocateType::AnyPages,
            UefiMemoryType::ACPI_RECLAIM,
            map_pages.max(1),
        )
        .map_err(|_| LoaderError::AllocationFailed)?;
    unsafe {
        core::ptr::copy_nonoverlapping(
            entries.as_ptr(),
            map_phys as *mut MemoryMapEntry,
            entries.len(),
        );
    }

    let handoff_pages = (BootHandoff::SIZE + 4095) / 4096;
    let handoff_phys = bt
        .allocate_pages(
            AllocateType::AnyPages,
            UefiMemoryType::ACPI_RECLAIM,
            handoff_pages.max(1),
        )
        .map_err(|_| LoaderError::AllocationFailed)?;

    let handoff = BootHandoff {
        magic: HANDOFF_MAGIC,
        reserved: 0,
        memory_map_addr: map_phys,
        memory_map_count: entries.len() as u64,
        framebuffer_addr: fb_addr,
        fb_width,
        fb_height,
        fb_bpp,
        fb_pitch,
    };
    unsafe {
        core::ptr::write(handoff_phys as *mut BootHandoff, handoff);
    }

    // The firmware watchdog would otherwise fire while the kernel is
    // running with no UEFI services left to feed it.
    bt.set_watchdog_timer(0, 0x10000, None)
        .map_err(|_| LoaderError::ExitBootServicesFailed)?;

    // Point of no return: no firmware call or allocation may occur between
    // the last successful GetMemoryMap and a successful ExitBootServices.
    let map_size = bt.memory_map_size();
    let buf_size = map_size.map_size + 8 * map_size.entry_size;
    let mut buffer = alloc::vec![0u8; buf_size];
    let memory_map = bt
        .memory_map(&mut buffer)
        .map_err(|_| LoaderError::ExitBootServicesFailed)?;
    let key = memory_map.meta().map_key;

    let exit_result = unsafe { system_table.boot_services().exit_boot_services(image, key) };
    let exit_result = if exit_result.is_err() {
        // Map changed underneath us; re-fetch once and retry as specified.
        let memory_map = bt
            .memory_map(&mut buffer)
            .map_err(|_| LoaderError::ExitBootServicesFailed)?;
        let key = memory_map.meta().map_key;
        unsafe { system_table.boot_services().exit_boot_services(image, key) }
    } else {
        exit_result
    };
    exit_result.map_err(|_| LoaderError::ExitBootServicesFailed)?;

    unsafe {
        core::arch::asm!("cli");
        let entry: extern "C" fn(*const BootHandoff) -> ! = core::mem::transmute(entry_phys);
        entry(handoff_phys as *const BootHandoff);
    }
}
