//! The hardware capability interface consumed by the enablement controller.

pub type VirtAddr = usize;
pub type PhysAddr = usize;

/// Failure of a VMX instruction, following the RFLAGS convention of the
/// Intel SDM (Volume 3C, Section 30.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrFail {
    /// CF was set: the instruction failed without a current VMCS.
    Invalid,
    /// ZF was set: the instruction failed with an error number available.
    Valid,
}

/// Primitive processor operations needed to turn VMX root mode on and off.
///
/// Every operation acts on the calling logical processor only and must not
/// be invoked concurrently for the same processor. Handles are cheap to
/// clone and may be shared by controllers bound to sibling processors.
pub trait VmxHal: Clone {
    /// Whether CPUID reports the VMX extension.
    fn supports_vmx(&self) -> bool;

    /// Raw `IA32_VMX_BASIC`.
    fn read_vmx_basic(&self) -> u64;

    /// Raw `IA32_VMX_CR0_FIXED0` (bits that must be 1 in CR0).
    fn read_cr0_fixed0(&self) -> u64;
    /// Raw `IA32_VMX_CR0_FIXED1` (bits that may be 1 in CR0).
    fn read_cr0_fixed1(&self) -> u64;
    /// Raw `IA32_VMX_CR4_FIXED0` (bits that must be 1 in CR4).
    fn read_cr4_fixed0(&self) -> u64;
    /// Raw `IA32_VMX_CR4_FIXED1` (bits that may be 1 in CR4).
    fn read_cr4_fixed1(&self) -> u64;

    /// Raw `IA32_FEATURE_CONTROL`.
    fn read_feature_control(&self) -> u64;

    /// Whether RFLAGS.VM is set on this logical processor.
    fn v8086_active(&self) -> bool;

    /// Whether the processor is in SMX operation; selects which
    /// feature-control enable bit applies.
    fn smx_active(&self) -> bool;

    /// Read control register `n` (0 or 4).
    fn read_cr(&self, n: usize) -> u64;

    /// Write control register `n` (0 or 4).
    ///
    /// # Safety
    ///
    /// Control registers change processor behavior at once; the caller must
    /// only write values valid for the current operating mode.
    unsafe fn write_cr(&self, n: usize, value: u64);

    /// Allocate one page-aligned page of physically contiguous memory,
    /// returning its virtual handle and physical address. `None` when the
    /// backing pool is exhausted. The contents are unspecified.
    fn alloc_page(&self) -> Option<(VirtAddr, PhysAddr)>;

    /// Release a page obtained from [`alloc_page`](Self::alloc_page).
    ///
    /// # Safety
    ///
    /// `vaddr` must come from `alloc_page` on this interface and must not be
    /// released twice.
    unsafe fn dealloc_page(&self, vaddr: VirtAddr);

    /// Execute VMXON with the physical address of the VMXON region.
    ///
    /// # Safety
    ///
    /// `paddr` must point to a page-aligned region tagged with the current
    /// revision identifier, and all VMXON preconditions must hold.
    unsafe fn vmxon(&self, paddr: PhysAddr) -> Result<(), InstrFail>;

    /// Execute VMXOFF.
    ///
    /// # Safety
    ///
    /// The processor must be in VMX root operation.
    unsafe fn vmxoff(&self) -> Result<(), InstrFail>;
}

#[cfg(target_arch = "x86_64")]
mod hw {
    use alloc::alloc as heap;
    use core::alloc::Layout;

    use raw_cpuid::CpuId;
    use x86::bits64::rflags::{self, RFlags};
    use x86::bits64::vmx;
    use x86::msr::{
        rdmsr, IA32_FEATURE_CONTROL, IA32_VMX_BASIC, IA32_VMX_CR0_FIXED0, IA32_VMX_CR0_FIXED1,
        IA32_VMX_CR4_FIXED0, IA32_VMX_CR4_FIXED1,
    };
    use x86::vmx::VmFail;
    use x86_64::registers::control::{Cr0, Cr4};

    use super::{InstrFail, PhysAddr, VirtAddr, VmxHal};
    use crate::consts::{CR4_SMXE, PAGE_SIZE};

    const PAGE_LAYOUT: Layout =
        unsafe { Layout::from_size_align_unchecked(PAGE_SIZE, PAGE_SIZE) };

    /// The live processor.
    ///
    /// Physical addresses are derived from virtual ones by the constant
    /// offset the embedding hypervisor maps its memory at; an offset of 0
    /// (the [`Default`] construction) means identity-mapped.
    #[derive(Clone, Copy, Default)]
    pub struct HwVmx {
        phys_virt_offset: usize,
    }

    impl HwVmx {
        pub const fn new(phys_virt_offset: usize) -> Self {
            Self { phys_virt_offset }
        }
    }

    impl From<VmFail> for InstrFail {
        fn from(err: VmFail) -> Self {
            match err {
                VmFail::VmFailValid => InstrFail::Valid,
                VmFail::VmFailInvalid => InstrFail::Invalid,
            }
        }
    }

    impl VmxHal for HwVmx {
        fn supports_vmx(&self) -> bool {
            if let Some(feature) = CpuId::new().get_feature_info() {
                feature.has_vmx()
            } else {
                false
            }
        }

        fn read_vmx_basic(&self) -> u64 {
            unsafe { rdmsr(IA32_VMX_BASIC) }
        }

        fn read_cr0_fixed0(&self) -> u64 {
            unsafe { rdmsr(IA32_VMX_CR0_FIXED0) }
        }

        fn read_cr0_fixed1(&self) -> u64 {
            unsafe { rdmsr(IA32_VMX_CR0_FIXED1) }
        }

        fn read_cr4_fixed0(&self) -> u64 {
            unsafe { rdmsr(IA32_VMX_CR4_FIXED0) }
        }

        fn read_cr4_fixed1(&self) -> u64 {
            unsafe { rdmsr(IA32_VMX_CR4_FIXED1) }
        }

        fn read_feature_control(&self) -> u64 {
            unsafe { rdmsr(IA32_FEATURE_CONTROL) }
        }

        fn v8086_active(&self) -> bool {
            rflags::read().contains(RFlags::FLAGS_VM)
        }

        fn smx_active(&self) -> bool {
            self.read_cr(4) & CR4_SMXE != 0
        }

        fn read_cr(&self, n: usize) -> u64 {
            match n {
                0 => Cr0::read_raw(),
                4 => Cr4::read_raw(),
                _ => unreachable!(),
            }
        }

        unsafe fn write_cr(&self, n: usize, value: u64) {
            match n {
                0 => Cr0::write_raw(value),
                4 => Cr4::write_raw(value),
                _ => unreachable!(),
            }
        }

        fn alloc_page(&self) -> Option<(VirtAddr, PhysAddr)> {
            let vaddr = unsafe { heap::alloc(PAGE_LAYOUT) } as usize;
            if vaddr == 0 {
                return None;
            }
            trace!("Allocate VMX page: {:#x}", vaddr);
            Some((vaddr, vaddr - self.phys_virt_offset))
        }

        unsafe fn dealloc_page(&self, vaddr: VirtAddr) {
            trace!("Deallocate VMX page: {:#x}", vaddr);
            heap::dealloc(vaddr as *mut u8, PAGE_LAYOUT);
        }

        unsafe fn vmxon(&self, paddr: PhysAddr) -> Result<(), InstrFail> {
            vmx::vmxon(paddr as u64).map_err(InstrFail::from)
        }

        unsafe fn vmxoff(&self) -> Result<(), InstrFail> {
            vmx::vmxoff().map_err(InstrFail::from)
        }
    }
}

#[cfg(target_arch = "x86_64")]
pub use hw::HwVmx;
