//! Global Descriptor Table.
//!
//! Segmentation is flat in long mode, but the GDT is still required for a
//! valid code segment, for SYSCALL/SYSRET-style privilege checks, and to
//! install the TSS selector.
//!
//! ```text
//! Index  Segment          DPL   Usage
//! -----  ---------------  ---   ---------------------------
//! 0      Null Descriptor  -     Required by the CPU
//! 1      Kernel Code      0     Kernel mode code segment
//! 2      Kernel Data      0     Kernel mode data segment
//! 3      User Data        3     User mode data segment
//! 4      User Code        3     User mode code segment
//! 5      TSS              0     Task State Segment
//! ```

use lazy_static::lazy_static;
use x86_64::instructions::segmentation::{Segment, CS, DS, ES, FS, GS, SS};
use x86_64::instructions::tables::load_tss;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();

        let kernel_code_selector = gdt.add_entry(Descriptor::kernel_code_segment());
        let kernel_data_selector = gdt.add_entry(Descriptor::kernel_data_segment());
        // User data must precede user code for SYSRET's selector arithmetic.
        let user_data_selector = gdt.add_entry(Descriptor::user_data_segment());
        let user_code_selector = gdt.add_entry(Descriptor::user_code_segment());
        let tss_selector = gdt.add_entry(Descriptor::tss_segment(unsafe {
            &*(&super::tss::TSS as *const _)
        }));

        (
            gdt,
            Selectors {
                kernel_code_selector,
                kernel_data_selector,
                user_code_selector,
                user_data_selector,
                tss_selector,
            },
        )
    };
}

#[derive(Debug)]
struct Selectors {
    kernel_code_selector: SegmentSelector,
    kernel_data_selector: SegmentSelector,
    user_code_selector: SegmentSelector,
    user_data_selector: SegmentSelector,
    tss_selector: SegmentSelector,
}

/// Load the GDT and point every segment register at it, including the TSS.
///
/// # Safety
/// Must run exactly once during boot, with interrupts disabled.
pub unsafe fn init_gdt() {
    GDT.0.load();

    CS::set_reg(GDT.1.kernel_code_selector);
    DS::set_reg(GDT.1.kernel_data_selector);
    ES::set_reg(GDT.1.kernel_data_selector);
    SS::set_reg(GDT.1.kernel_data_selector);
    FS::set_reg(GDT.1.kernel_data_selector);
    GS::set_reg(GDT.1.kernel_data_selector);

    load_tss(GDT.1.tss_selector);
}

pub fn kernel_code_selector() -> SegmentSelector {
    GDT.1.kernel_code_selector
}

pub fn kernel_data_selector() -> SegmentSelector {
    GDT.1.kernel_data_selector
}

pub fn user_code_selector() -> SegmentSelector {
    GDT.1.user_code_selector
}

pub fn user_data_selector() -> SegmentSelector {
    GDT.1.user_data_selector
}

pub fn tss_selector() -> SegmentSelector {
    GDT.1.tss_selector
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gdt_selectors() {
        assert_eq!(kernel_code_selector().rpl(), 0);
        assert_eq!(kernel_data_selector().rpl(), 0);
        assert_eq!(user_code_selector().rpl(), 3);
        assert_eq!(user_data_selector().rpl(), 3);
        assert_eq!(tss_selector().rpl(), 0);
    }

    #[test]
    fn test_segment_order() {
        let user_data_idx = user_data_selector().index();
        let user_code_idx = user_code_selector().index();
        assert_eq!(user_code_idx, user_data_idx + 1);
    }
}
