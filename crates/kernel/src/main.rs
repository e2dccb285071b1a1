#![no_std]
#![no_main]
#![cfg_attr(target_arch = "x86_64", feature(abi_x86_interrupt))]
// CI lint gate: when built with `--features strict`, fail on any warning
#![cfg_attr(feature = "strict", deny(warnings))]
// During early bringup, suppress warnings to keep logs clean
#![cfg_attr(all(feature = "bringup", not(feature = "strict")), allow(warnings))]

use boot_protocol::BootHandoff;

#[allow(special_module_name)]
pub mod lib;
pub mod ipc;
pub mod process;

#[cfg(target_arch = "x86_64")]
pub mod arch {
    pub mod x86_64;
    pub use x86_64::*;
}

pub use crate::lib::error;
pub use crate::lib::printk;

/// Entry point jumped to by the loader. One argument: a pointer to the
/// handoff record built just before `ExitBootServices`. Interrupts are
/// disabled on entry; this function never returns.
#[no_mangle]
pub extern "C" fn _start(handoff: *const BootHandoff) -> ! {
    let handoff = unsafe { &*handoff };
    if !handoff.is_valid() {
        // Can't trust the framebuffer/memory-map pointers without the
        // magic check; fall back to a serial-only halt message.
        unsafe {
            arch::x86_64::serial::serial_write(b"[BOOT] FATAL: bad handoff magic\n");
        }
        arch::x86_64::boot::halt_forever();
    }

    unsafe {
        arch::x86_64::boot::early_init().unwrap_or_else(|e| {
            arch::x86_64::serial::serial_write(b"[BOOT] FATAL: early_init failed: ");
            arch::x86_64::serial::serial_write(e.as_bytes());
            arch::x86_64::serial::serial_write(b"\n");
            arch::x86_64::boot::halt_forever();
        });
    }

    // Packed fields can't be referenced directly inside a format argument
    // list (the compiler may need a reference to them); copy out first.
    let memory_map_count = handoff.memory_map_count;
    let fb_width = handoff.fb_width;
    let fb_height = handoff.fb_height;
    let fb_bpp = handoff.fb_bpp;
    printk::info!(
        "memory map: {} entries, framebuffer {}x{}@{}bpp",
        memory_map_count,
        fb_width,
        fb_height,
        fb_bpp
    );

    unsafe {
        let memory_map = handoff.memory_map();
        arch::x86_64::acpi::init();
        arch::x86_64::power::init();
        if let Err(e) = arch::x86_64::mouse::init() {
            printk::warn!("mouse init failed: {}", e);
        }
        let _ = memory_map; // retained for future memory manager bring-up

        process::init();
        ipc::messages::init();
        ipc::pipes::init();
    }

    printk::info!("kernel init complete, entering idle loop");

    loop {
        x86_64::instructions::interrupts::enable_and_hlt();
    }
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    lib::panic::panic_handler(info)
}
