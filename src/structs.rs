//! VMX data structures: capability bitfields and the VMXON region.

use bit_field::BitField;
use bitflags::bitflags;

use crate::consts::{is_aligned, PAGE_SIZE};
use crate::error::VmxResult;
use crate::hal::{PhysAddr, VirtAddr, VmxHal};

bitflags! {
    /// `IA32_FEATURE_CONTROL` bits relevant to VMXON.
    pub struct FeatureControlFlags: u64 {
        /// Writes to the MSR are rejected until the next reset.
        const LOCKED = 1 << 0;
        /// VMXON permitted inside SMX operation.
        const VMXON_ENABLED_INSIDE_SMX = 1 << 1;
        /// VMXON permitted outside SMX operation.
        const VMXON_ENABLED_OUTSIDE_SMX = 1 << 2;
    }
}

/// Decoded `IA32_VMX_BASIC` capability MSR.
#[derive(Debug, Clone, Copy)]
pub struct VmxBasic {
    /// The revision identifier the VMXON region must be tagged with.
    pub revision_id: u32,
    pub region_size: u16,
    /// VMXON/VMCS addresses are limited to 32 bits.
    pub is_32bit_address: bool,
    pub write_back: bool,
    pub io_exit_info: bool,
    pub vmx_flex_controls: bool,
}

impl VmxBasic {
    const VMX_MEMORY_TYPE_WRITE_BACK: u64 = 6;

    pub fn parse(raw: u64) -> Self {
        Self {
            revision_id: raw.get_bits(0..31) as u32,
            region_size: raw.get_bits(32..45) as u16,
            is_32bit_address: raw.get_bit(48),
            write_back: raw.get_bits(50..54) == Self::VMX_MEMORY_TYPE_WRITE_BACK,
            io_exit_info: raw.get_bit(54),
            vmx_flex_controls: raw.get_bit(55),
        }
    }
}

/// An owned, page-aligned VMXON region.
///
/// Holds its own handle to the capability interface so the page goes back
/// through [`VmxHal::dealloc_page`] on every exit path, the rollback one
/// included.
#[derive(Debug)]
pub struct VmxRegion<H: VmxHal> {
    hal: H,
    vaddr: VirtAddr,
    paddr: PhysAddr,
}

impl<H: VmxHal> VmxRegion<H> {
    /// Allocate a zeroed region tagged with `revision_id`, ready for VMXON.
    pub fn new(hal: H, revision_id: u32) -> VmxResult<Self> {
        let (vaddr, paddr) = match hal.alloc_page() {
            Some(page) => page,
            None => return vmx_result_err!(ResourceExhausted),
        };
        debug_assert!(is_aligned(vaddr) && is_aligned(paddr));
        unsafe {
            core::ptr::write_bytes(vaddr as *mut u8, 0, PAGE_SIZE);
            // Bit 31 of the first word must be 0 in a VMXON region.
            core::ptr::write(vaddr as *mut u32, revision_id & 0x7fff_ffff);
        }
        Ok(Self { hal, vaddr, paddr })
    }

    pub fn paddr(&self) -> PhysAddr {
        self.paddr
    }

    #[cfg(test)]
    pub fn revision_id(&self) -> u32 {
        unsafe { core::ptr::read(self.vaddr as *const u32) }
    }

    #[cfg(test)]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.vaddr as *const u8, PAGE_SIZE) }
    }
}

impl<H: VmxHal> Drop for VmxRegion<H> {
    fn drop(&mut self) {
        unsafe { self.hal.dealloc_page(self.vaddr) }
    }
}
