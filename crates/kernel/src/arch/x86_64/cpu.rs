//! CPU feature detection and enablement via CPUID.
//!
//! SSE2 and APIC are required; everything else here is enabled opportunistically.

use raw_cpuid::CpuId;
use x86_64::registers::control::{Cr0, Cr0Flags, Cr4, Cr4Flags};

#[derive(Debug, Clone, Copy)]
pub struct CpuFeatures {
    pub vendor: CpuVendor,
    pub model_name: [u8; 48],

    pub has_sse2: bool,
    pub has_apic: bool,

    pub has_sse3: bool,
    pub has_ssse3: bool,
    pub has_sse4_1: bool,
    pub has_sse4_2: bool,
    pub has_avx: bool,
    pub has_avx2: bool,

    pub has_nx: bool,
    pub has_smep: bool,
    pub has_smap: bool,

    pub has_fsgsbase: bool,
    pub has_x2apic: bool,
    pub has_pcid: bool,
    pub has_invpcid: bool,

    pub has_tsc: bool,
    pub has_tsc_deadline: bool,
    pub has_invariant_tsc: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuVendor {
    Intel,
    AMD,
    Unknown,
}

pub fn detect_cpu_features() -> CpuFeatures {
    let cpuid = CpuId::new();

    let vendor = if let Some(vendor_info) = cpuid.get_vendor_info() {
        match vendor_info.as_str() {
            "GenuineIntel" => CpuVendor::Intel,
            "AuthenticAMD" => CpuVendor::AMD,
            _ => CpuVendor::Unknown,
        }
    } else {
        CpuVendor::Unknown
    };

    let features = cpuid.get_feature_info().unwrap();
    let extended_features = cpuid.get_extended_feature_info();
    let extended_proc = cpuid.get_extended_processor_and_feature_identifiers();
    let apm_info = cpuid.get_advanced_power_mgmt_info();

    let mut model_name = [0u8; 48];
    if let Some(brand) = cpuid.get_processor_brand_string() {
        let brand_str = brand.as_str();
        let len = core::cmp::min(brand_str.len(), 48);
        model_name[..len].copy_from_slice(&brand_str.as_bytes()[..len]);
    }

    CpuFeatures {
        vendor,
        model_name,

        has_sse2: features.has_sse2(),
        has_apic: features.has_apic(),

        has_sse3: features.has_sse3(),
        has_ssse3: features.has_ssse3(),
        has_sse4_1: features.has_sse41(),
        has_sse4_2: features.has_sse42(),
        has_avx: features.has_avx(),
        has_avx2: extended_features.as_ref().map_or(false, |f| f.has_avx2()),

        has_nx: extended_proc
            .as_ref()
            .map_or(false, |f| f.has_execute_disable()),
        has_smep: extended_features.as_ref().map_or(false, |f| f.has_smep()),
        has_smap: extended_features.as_ref().map_or(false, |f| f.has_smap()),

        has_fsgsbase: extended_features
            .as_ref()
            .map_or(false, |f| f.has_fsgsbase()),
        has_x2apic: features.has_x2apic(),
        has_pcid: features.has_pcid(),
        has_invpcid: extended_features
            .as_ref()
            .map_or(false, |f| f.has_invpcid()),

        has_tsc: features.has_tsc(),
        has_tsc_deadline: features.has_tsc_deadline(),
        has_invariant_tsc: apm_info.as_ref().map_or(false, |f| f.has_invariant_tsc()),
    }
}

/// Enable the feature bits the kernel relies on. Fails closed if a
/// required feature (SSE2, APIC) is missing.
///
/// # Safety
/// Must run during early boot with interrupts disabled, before any
/// floating-point instruction executes.
pub unsafe fn enable_cpu_features() -> Result<(), &'static str> {
    let features = detect_cpu_features();

    if !features.has_sse2 {
        return Err("CPU does not support SSE2 (required for Rust floating-point)");
    }
    if !features.has_apic {
        return Err("CPU does not support APIC (required for interrupt handling)");
    }

    let mut cr0 = Cr0::read();
    cr0.remove(Cr0Flags::EMULATE_COPROCESSOR);
    cr0.insert(Cr0Flags::MONITOR_COPROCESSOR);
    Cr0::write(cr0);

    let mut cr4 = Cr4::read();
    cr4.insert(Cr4Flags::OSFXSR);
    cr4.insert(Cr4Flags::OSXMMEXCPT_ENABLE);

    if features.has_avx {
        cr4.insert(Cr4Flags::OSXSAVE);
        Cr4::write(cr4);

        let xcr0 = xgetbv(0);
        xsetbv(0, xcr0 | 0x7); // x87 | SSE | AVX state
    } else {
        Cr4::write(cr4);
    }

    if features.has_nx {
        use x86_64::registers::model_specific::{Efer, EferFlags};
        Efer::update(|flags| {
            *flags |= EferFlags::NO_EXECUTE_ENABLE;
        });
    }

    if features.has_fsgsbase {
        let mut cr4 = Cr4::read();
        cr4.insert(Cr4Flags::FSGSBASE);
        Cr4::write(cr4);
    }

    if features.has_smep {
        let mut cr4 = Cr4::read();
        cr4.insert(Cr4Flags::SUPERVISOR_MODE_EXECUTION_PROTECTION);
        Cr4::write(cr4);
    }

    if features.has_smap {
        let mut cr4 = Cr4::read();
        cr4.insert(Cr4Flags::SUPERVISOR_MODE_ACCESS_PREVENTION);
        Cr4::write(cr4);
    }

    if features.has_pcid {
        let mut cr4 = Cr4::read();
        cr4.insert(Cr4Flags::PCID);
        Cr4::write(cr4);
    }

    let mut cr4 = Cr4::read();
    cr4.insert(Cr4Flags::PAGE_GLOBAL);
    Cr4::write(cr4);

    Ok(())
}

pub fn print_cpu_info() {
    let features = detect_cpu_features();

    let vendor_str = match features.vendor {
        CpuVendor::Intel => "Intel",
        CpuVendor::AMD => "AMD",
        CpuVendor::Unknown => "Unknown",
    };

    crate::arch::x86_64::serial::serial_write(b"[CPU] Vendor: ");
    crate::arch::x86_64::serial::serial_write(vendor_str.as_bytes());
    crate::arch::x86_64::serial::serial_write(b"\n");

    crate::arch::x86_64::serial::serial_write(b"[CPU] Model: ");
    crate::arch::x86_64::serial::serial_write(&features.model_name);
    crate::arch::x86_64::serial::serial_write(b"\n");

    crate::arch::x86_64::serial::serial_write(b"[CPU] Features:\n");
    if features.has_sse2 {
        crate::arch::x86_64::serial::serial_write(b"  - SSE2\n");
    }
    if features.has_sse3 {
        crate::arch::x86_64::serial::serial_write(b"  - SSE3\n");
    }
    if features.has_sse4_1 {
        crate::arch::x86_64::serial::serial_write(b"  - SSE4.1\n");
    }
    if features.has_sse4_2 {
        crate::arch::x86_64::serial::serial_write(b"  - SSE4.2\n");
    }
    if features.has_avx {
        crate::arch::x86_64::serial::serial_write(b"  - AVX\n");
    }
    if features.has_avx2 {
        crate::arch::x86_64::serial::serial_write(b"  - AVX2\n");
    }
    if features.has_nx {
        crate::arch::x86_64::serial::serial_write(b"  - NX (No-Execute)\n");
    }
    if features.has_smep {
        crate::arch::x86_64::serial::serial_write(b"  - SMEP\n");
    }
    if features.has_smap {
        crate::arch::x86_64::serial::serial_write(b"  - SMAP\n");
    }
    if features.has_fsgsbase {
        crate::arch::x86_64::serial::serial_write(b"  - FSGSBASE\n");
    }
    if features.has_x2apic {
        crate::arch::x86_64::serial::serial_write(b"  - x2APIC\n");
    }
}

/// # Safety
/// XCR0 can only be read if CR4.OSXSAVE is set.
#[inline]
unsafe fn xgetbv(xcr: u32) -> u64 {
    let (high, low): (u32, u32);
    core::arch::asm!(
        "xgetbv",
        in("ecx") xcr,
        out("eax") low,
        out("edx") high,
        options(nomem, nostack)
    );
    ((high as u64) << 32) | (low as u64)
}

/// # Safety
/// XCR0 can only be written if CR4.OSXSAVE is set; invalid values fault.
#[inline]
unsafe fn xsetbv(xcr: u32, value: u64) {
    let low = value as u32;
    let high = (value >> 32) as u32;
    core::arch::asm!(
        "xsetbv",
        in("ecx") xcr,
        in("eax") low,
        in("edx") high,
        options(nomem, nostack)
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_cpu_features() {
        let features = detect_cpu_features();
        assert!(features.has_sse2, "SSE2 should be available on all x86_64 CPUs");
        assert!(features.has_apic, "APIC should be available on all modern CPUs");
    }

    #[test]
    fn test_vendor_detection() {
        let features = detect_cpu_features();
        assert!(
            features.vendor == CpuVendor::Intel
                || features.vendor == CpuVendor::AMD
                || features.vendor == CpuVendor::Unknown
        );
    }
}
