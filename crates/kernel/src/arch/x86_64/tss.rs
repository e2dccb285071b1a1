//! Task State Segment.
//!
//! In long mode the TSS is only used for the Interrupt Stack Table (IST)
//! and the privilege stack table (RSP0), not for hardware task switching.
//! Double fault, NMI, and machine check each get a dedicated stack so the
//! handler can run even if the normal kernel stack is corrupted.

use lazy_static::lazy_static;
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

pub const IST_STACK_SIZE: usize = 16 * 1024;
pub const PRIVILEGE_STACK_SIZE: usize = 16 * 1024;

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;
pub const NMI_IST_INDEX: u16 = 1;
pub const MACHINE_CHECK_IST_INDEX: u16 = 2;

#[repr(align(16))]
struct Stack([u8; IST_STACK_SIZE]);

impl Stack {
    const fn new() -> Self {
        Stack([0; IST_STACK_SIZE])
    }
}

static mut DOUBLE_FAULT_STACK: Stack = Stack::new();
static mut NMI_STACK: Stack = Stack::new();
static mut MACHINE_CHECK_STACK: Stack = Stack::new();
/// Boot-time kernel stack for privilege transitions. Single-threaded for
/// now; per-thread RSP0 swapping arrives with the scheduler.
static mut PRIVILEGE_STACK: Stack = Stack::new();

lazy_static! {
    pub static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();

        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
            let stack_start = VirtAddr::from_ptr(unsafe { &DOUBLE_FAULT_STACK });
            stack_start + IST_STACK_SIZE
        };
        tss.interrupt_stack_table[NMI_IST_INDEX as usize] = {
            let stack_start = VirtAddr::from_ptr(unsafe { &NMI_STACK });
            stack_start + IST_STACK_SIZE
        };
        tss.interrupt_stack_table[MACHINE_CHECK_IST_INDEX as usize] = {
            let stack_start = VirtAddr::from_ptr(unsafe { &MACHINE_CHECK_STACK });
            stack_start + IST_STACK_SIZE
        };
        tss.privilege_stack_table[0] = {
            let stack_start = VirtAddr::from_ptr(unsafe { &PRIVILEGE_STACK });
            stack_start + PRIVILEGE_STACK_SIZE
        };

        tss
    };
}

/// Force `TSS` to initialize. Must run after `gdt::init_gdt` has installed
/// the TSS descriptor but logically belongs to boot sequencing, not to the
/// lazy_static machinery.
///
/// # Safety
/// Must run exactly once during boot.
pub unsafe fn init_tss() {
    let _ = &*TSS;
}

/// Update RSP0 for the next privilege-level transition. No-op until the
/// process subsystem assigns each process its own kernel stack.
///
/// # Safety
/// Caller must hold off interrupts while swapping stacks in a real
/// multi-process build.
pub unsafe fn set_kernel_stack(_stack_top: VirtAddr) {}

pub fn get_kernel_stack() -> VirtAddr {
    TSS.privilege_stack_table[0]
}

#[cfg(debug_assertions)]
pub fn validate_tss() -> Result<(), &'static str> {
    let df_stack = TSS.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize];
    if df_stack.is_null() {
        return Err("Double fault IST stack is null");
    }
    if df_stack.as_u64() % 16 != 0 {
        return Err("Double fault IST stack is not 16-byte aligned");
    }

    let nmi_stack = TSS.interrupt_stack_table[NMI_IST_INDEX as usize];
    if nmi_stack.is_null() {
        return Err("NMI IST stack is null");
    }
    if nmi_stack.as_u64() % 16 != 0 {
        return Err("NMI IST stack is not 16-byte aligned");
    }

    let mc_stack = TSS.interrupt_stack_table[MACHINE_CHECK_IST_INDEX as usize];
    if mc_stack.is_null() {
        return Err("Machine check IST stack is null");
    }
    if mc_stack.as_u64() % 16 != 0 {
        return Err("Machine check IST stack is not 16-byte aligned");
    }

    let priv_stack = TSS.privilege_stack_table[0];
    if priv_stack.is_null() {
        return Err("Privilege stack (RSP0) is null");
    }
    if priv_stack.as_u64() % 16 != 0 {
        return Err("Privilege stack (RSP0) is not 16-byte aligned");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_alignment() {
        let stack = Stack::new();
        let addr = &stack as *const _ as usize;
        assert_eq!(addr % 16, 0, "Stack must be 16-byte aligned");
    }

    #[test]
    fn test_stack_size() {
        assert_eq!(core::mem::size_of::<Stack>(), IST_STACK_SIZE);
    }

    #[test]
    fn test_tss_initialization() {
        let tss = &*TSS;
        assert!(!tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize].is_null());
        assert!(!tss.interrupt_stack_table[NMI_IST_INDEX as usize].is_null());
        assert!(!tss.interrupt_stack_table[MACHINE_CHECK_IST_INDEX as usize].is_null());
        assert!(!tss.privilege_stack_table[0].is_null());
    }
}
