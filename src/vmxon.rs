//! The VMX root-mode enablement state machine.

use crate::consts::CR4_VMXE;
use crate::error::VmxResult;
use crate::hal::VmxHal;
use crate::structs::{FeatureControlFlags, VmxBasic, VmxRegion};

/// Whether this logical processor has been put into VMX root mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxState {
    Disabled,
    Enabled,
}

/// Turns VMX root mode on and off on one logical processor.
///
/// One instance per logical processor, bound to one capability interface at
/// construction and invoked only from code pinned to that processor.
/// [`start`](Self::start) runs the compatibility checks described in the
/// Intel manual, builds the VMXON region and executes VMXON;
/// [`stop`](Self::stop) undoes all of it in inverse order. A failure at any
/// point rolls back to a consistent `Disabled` state.
pub struct Vmxon<H: VmxHal> {
    hal: H,
    state: VmxState,
    region: Option<VmxRegion<H>>,
}

impl<H: VmxHal> Vmxon<H> {
    pub fn new(hal: H) -> Self {
        Self {
            hal,
            state: VmxState::Disabled,
            region: None,
        }
    }

    /// Enter VMX root mode.
    ///
    /// Fails with `AlreadyEnabled` when called twice without an intervening
    /// `stop()`. Until VMXON itself has succeeded, no failure leaves any
    /// hardware state behind: the checks run before the first mutation, and
    /// a VMXON fault clears CR4.VMXE and releases the region before the
    /// error is returned.
    pub fn start(&mut self) -> VmxResult {
        if self.state == VmxState::Enabled {
            return vmx_result_err!(AlreadyEnabled);
        }

        self.check_vmx_supported()?;
        let basic = self.check_vmx_basic()?;
        self.check_cr0_fixed()?;
        self.check_cr4_fixed()?;
        self.check_feature_control()?;
        self.check_v8086_disabled()?;

        let region = VmxRegion::new(self.hal.clone(), basic.revision_id)?;
        self.enable_vmx_operation();
        if let Err(fail) = unsafe { self.hal.vmxon(region.paddr()) } {
            // Roll back: clear CR4.VMXE first, then release the region.
            self.disable_vmx_operation();
            drop(region);
            warn!("VMXON faulted: {:?}", fail);
            return vmx_result_err!(ModeEnterFailed, format!("{:?}", fail));
        }

        self.region = Some(region);
        self.state = VmxState::Enabled;
        info!("VMX root mode enabled");
        Ok(())
    }

    /// Leave VMX root mode.
    ///
    /// Fails with `NotEnabled` when the controller is not enabled. A VMXOFF
    /// fault is reported as `ModeExitFailed`, but CR4.VMXE is still cleared
    /// and the region released; the controller always ends up `Disabled`.
    pub fn stop(&mut self) -> VmxResult {
        if self.state == VmxState::Disabled {
            return vmx_result_err!(NotEnabled);
        }

        let ret = unsafe { self.hal.vmxoff() };
        if let Err(fail) = ret {
            warn!("VMXOFF faulted: {:?}, cleaning up anyway", fail);
        }
        self.disable_vmx_operation();
        self.region = None;
        self.state = VmxState::Disabled;

        match ret {
            Ok(()) => {
                info!("VMX root mode disabled");
                Ok(())
            }
            Err(fail) => vmx_result_err!(ModeExitFailed, format!("{:?}", fail)),
        }
    }

    /// Whether CR4.VMXE is set, read live from the processor.
    ///
    /// The register is read instead of the cached state so interference from
    /// outside the controller is visible; a caller holding a disagreeing
    /// claimed state may treat the mismatch as a consistency fault.
    pub fn is_enabled(&self) -> bool {
        self.hal.read_cr(4) & CR4_VMXE != 0
    }

    fn check_vmx_supported(&self) -> VmxResult {
        if self.hal.supports_vmx() {
            Ok(())
        } else {
            warn!("Feature VMX not supported!");
            vmx_result_err!(UnsupportedProcessor)
        }
    }

    fn check_vmx_basic(&self) -> VmxResult<VmxBasic> {
        let basic = VmxBasic::parse(self.hal.read_vmx_basic());
        if basic.is_32bit_address {
            return vmx_result_err!(
                IncompatibleCapabilities,
                "VMXON region limited to 32-bit addresses"
            );
        }
        if !basic.write_back {
            return vmx_result_err!(IncompatibleCapabilities, "memory type is not write-back");
        }
        Ok(basic)
    }

    fn check_cr0_fixed(&self) -> VmxResult {
        let cr0 = self.hal.read_cr(0);
        if satisfies_fixed_bits(cr0, self.hal.read_cr0_fixed0(), self.hal.read_cr0_fixed1()) {
            Ok(())
        } else {
            vmx_result_err!(
                InvalidControlRegisterState,
                format!("CR0 = {:#x} violates IA32_VMX_CR0_FIXED", cr0)
            )
        }
    }

    fn check_cr4_fixed(&self) -> VmxResult {
        let cr4 = self.hal.read_cr(4);
        // CR4.VMXE is owned by enable/disable below, not a precondition.
        let fixed0 = self.hal.read_cr4_fixed0() & !CR4_VMXE;
        if satisfies_fixed_bits(cr4, fixed0, self.hal.read_cr4_fixed1()) {
            Ok(())
        } else {
            vmx_result_err!(
                InvalidControlRegisterState,
                format!("CR4 = {:#x} violates IA32_VMX_CR4_FIXED", cr4)
            )
        }
    }

    fn check_feature_control(&self) -> VmxResult {
        let ctrl = FeatureControlFlags::from_bits_truncate(self.hal.read_feature_control());
        let enable = if self.hal.smx_active() {
            FeatureControlFlags::VMXON_ENABLED_INSIDE_SMX
        } else {
            FeatureControlFlags::VMXON_ENABLED_OUTSIDE_SMX
        };
        if ctrl.contains(FeatureControlFlags::LOCKED | enable) {
            Ok(())
        } else {
            warn!("VMX disabled by BIOS!");
            vmx_result_err!(FeatureLocked)
        }
    }

    fn check_v8086_disabled(&self) -> VmxResult {
        if self.hal.v8086_active() {
            // VMXON is undefined in virtual-8086 mode.
            vmx_result_err!(IncompatibleProcessorMode)
        } else {
            Ok(())
        }
    }

    fn enable_vmx_operation(&mut self) {
        let cr4 = self.hal.read_cr(4);
        unsafe { self.hal.write_cr(4, cr4 | CR4_VMXE) };
    }

    fn disable_vmx_operation(&mut self) {
        let cr4 = self.hal.read_cr(4);
        unsafe { self.hal.write_cr(4, cr4 & !CR4_VMXE) };
    }
}

#[cfg(target_arch = "x86_64")]
impl Vmxon<crate::hal::HwVmx> {
    /// A controller bound to the live, identity-mapped processor.
    pub fn new_hardware() -> Self {
        Self::new(crate::hal::HwVmx::default())
    }
}

/// `fixed0` holds the bits that must be 1, `fixed1` the bits that may be 1.
fn satisfies_fixed_bits(value: u64, fixed0: u64, fixed1: u64) -> bool {
    value & fixed0 == fixed0 && value & !fixed1 == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::mock::{MockVmx, MOCK_REVISION_ID};
    use crate::VmxErrorKind;

    fn assert_untouched(hal: &MockVmx) {
        let st = hal.0.borrow();
        assert_eq!(st.cr_writes, 0);
        assert_eq!(st.vmxon_count, 0);
        assert!(st.live_pages.is_empty());
    }

    #[test]
    fn round_trip() {
        let hal = MockVmx::healthy();
        let mut vmxon = Vmxon::new(hal.clone());
        assert!(!vmxon.is_enabled());

        vmxon.start().unwrap();
        assert!(vmxon.is_enabled());
        assert_ne!(hal.cr4() & CR4_VMXE, 0);
        assert_eq!(hal.live_pages(), 1);

        vmxon.stop().unwrap();
        assert!(!vmxon.is_enabled());
        assert_eq!(hal.cr4() & CR4_VMXE, 0);
        assert_eq!(hal.live_pages(), 0);
        assert_eq!(hal.0.borrow().vmxoff_count, 1);

        // Region and flag are reusable across cycles.
        vmxon.start().unwrap();
        assert!(vmxon.is_enabled());
        assert_eq!(hal.live_pages(), 1);
    }

    #[test]
    fn start_while_enabled_is_rejected() {
        let hal = MockVmx::healthy();
        let mut vmxon = Vmxon::new(hal.clone());
        vmxon.start().unwrap();

        let err = vmxon.start().unwrap_err();
        assert_eq!(err.kind(), VmxErrorKind::AlreadyEnabled);
        // State, region and hardware are exactly as the first start left them.
        assert!(vmxon.is_enabled());
        assert_eq!(hal.live_pages(), 1);
        assert_eq!(hal.0.borrow().vmxon_count, 1);
    }

    #[test]
    fn stop_while_disabled_is_rejected() {
        let hal = MockVmx::healthy();
        let mut vmxon = Vmxon::new(hal.clone());

        let err = vmxon.stop().unwrap_err();
        assert_eq!(err.kind(), VmxErrorKind::NotEnabled);
        assert_eq!(hal.0.borrow().vmxoff_count, 0);
        assert_untouched(&hal);
    }

    #[test]
    fn unsupported_processor() {
        let hal = MockVmx::with(|st| st.vmx_supported = false);
        let mut vmxon = Vmxon::new(hal.clone());
        let err = vmxon.start().unwrap_err();
        assert_eq!(err.kind(), VmxErrorKind::UnsupportedProcessor);
        assert!(!vmxon.is_enabled());
        assert_untouched(&hal);
    }

    #[test]
    fn capability_msr_32bit_addressing() {
        let hal = MockVmx::with(|st| st.vmx_basic |= 1 << 48);
        let mut vmxon = Vmxon::new(hal.clone());
        let err = vmxon.start().unwrap_err();
        assert_eq!(err.kind(), VmxErrorKind::IncompatibleCapabilities);
        assert_untouched(&hal);
    }

    #[test]
    fn capability_msr_memory_type() {
        let hal = MockVmx::with(|st| st.vmx_basic &= !(0xf << 50));
        let mut vmxon = Vmxon::new(hal.clone());
        let err = vmxon.start().unwrap_err();
        assert_eq!(err.kind(), VmxErrorKind::IncompatibleCapabilities);
        assert_untouched(&hal);
    }

    #[test]
    fn cr0_fixed_bits_violated() {
        // Clear a bit IA32_VMX_CR0_FIXED0 requires (PE).
        let hal = MockVmx::with(|st| st.cr0 &= !0x1);
        let mut vmxon = Vmxon::new(hal.clone());
        let err = vmxon.start().unwrap_err();
        assert_eq!(err.kind(), VmxErrorKind::InvalidControlRegisterState);
        assert_untouched(&hal);
    }

    #[test]
    fn cr4_fixed_bits_violated() {
        // Set a bit IA32_VMX_CR4_FIXED1 does not allow.
        let hal = MockVmx::with(|st| st.cr4 |= 1 << 40);
        let mut vmxon = Vmxon::new(hal.clone());
        let err = vmxon.start().unwrap_err();
        assert_eq!(err.kind(), VmxErrorKind::InvalidControlRegisterState);
        assert_untouched(&hal);
    }

    #[test]
    fn cr4_vmxe_is_not_a_precondition() {
        // IA32_VMX_CR4_FIXED0 demands VMXE once in VMX operation; the check
        // must pass with the bit still clear.
        let hal = MockVmx::healthy();
        assert_eq!(hal.cr4() & CR4_VMXE, 0);
        Vmxon::new(hal).start().unwrap();
    }

    #[test]
    fn feature_control_unlocked() {
        let hal = MockVmx::with(|st| {
            st.feature_control = FeatureControlFlags::VMXON_ENABLED_OUTSIDE_SMX.bits()
        });
        let mut vmxon = Vmxon::new(hal.clone());
        let err = vmxon.start().unwrap_err();
        assert_eq!(err.kind(), VmxErrorKind::FeatureLocked);
        assert_untouched(&hal);
    }

    #[test]
    fn feature_control_locked_without_enable() {
        let hal = MockVmx::with(|st| st.feature_control = FeatureControlFlags::LOCKED.bits());
        let err = Vmxon::new(hal).start().unwrap_err();
        assert_eq!(err.kind(), VmxErrorKind::FeatureLocked);
    }

    #[test]
    fn feature_control_matches_smx_mode() {
        // Inside SMX, the outside-SMX enable bit is not good enough.
        let hal = MockVmx::with(|st| st.smx = true);
        let err = Vmxon::new(hal).start().unwrap_err();
        assert_eq!(err.kind(), VmxErrorKind::FeatureLocked);

        let hal = MockVmx::with(|st| {
            st.smx = true;
            st.feature_control = (FeatureControlFlags::LOCKED
                | FeatureControlFlags::VMXON_ENABLED_INSIDE_SMX)
                .bits();
        });
        Vmxon::new(hal).start().unwrap();
    }

    #[test]
    fn v8086_mode_active() {
        let hal = MockVmx::with(|st| st.v8086 = true);
        let mut vmxon = Vmxon::new(hal.clone());
        let err = vmxon.start().unwrap_err();
        assert_eq!(err.kind(), VmxErrorKind::IncompatibleProcessorMode);
        assert_untouched(&hal);
    }

    #[test]
    fn allocation_exhausted() {
        let hal = MockVmx::with(|st| st.exhausted = true);
        let mut vmxon = Vmxon::new(hal.clone());
        let err = vmxon.start().unwrap_err();
        assert_eq!(err.kind(), VmxErrorKind::ResourceExhausted);
        // All checks passed, but the enable bit was never touched.
        assert_eq!(hal.cr4() & CR4_VMXE, 0);
        assert_eq!(hal.0.borrow().cr_writes, 0);
        assert!(!vmxon.is_enabled());
    }

    #[test]
    fn vmxon_fault_rolls_back() {
        let hal = MockVmx::with(|st| st.fail_vmxon = true);
        let mut vmxon = Vmxon::new(hal.clone());
        let err = vmxon.start().unwrap_err();
        assert_eq!(err.kind(), VmxErrorKind::ModeEnterFailed);

        // Rollback completeness: enable bit cleared, region freed.
        assert_eq!(hal.cr4() & CR4_VMXE, 0);
        assert_eq!(hal.live_pages(), 0);
        assert!(!vmxon.is_enabled());

        // The controller is still usable once the fault cause is gone.
        hal.0.borrow_mut().fail_vmxon = false;
        vmxon.start().unwrap();
        assert!(vmxon.is_enabled());
    }

    #[test]
    fn vmxoff_fault_still_cleans_up() {
        let hal = MockVmx::with(|st| st.fail_vmxoff = true);
        let mut vmxon = Vmxon::new(hal.clone());
        vmxon.start().unwrap();

        let err = vmxon.stop().unwrap_err();
        assert_eq!(err.kind(), VmxErrorKind::ModeExitFailed);
        assert_eq!(hal.cr4() & CR4_VMXE, 0);
        assert_eq!(hal.live_pages(), 0);
        assert!(!vmxon.is_enabled());

        // Back to a consistent Disabled state.
        assert_eq!(
            vmxon.stop().unwrap_err().kind(),
            VmxErrorKind::NotEnabled
        );
        vmxon.start().unwrap();
    }

    #[test]
    fn revision_id_stamped_before_vmxon() {
        let hal = MockVmx::healthy();
        let mut vmxon = Vmxon::new(hal.clone());
        vmxon.start().unwrap();
        assert_eq!(
            hal.0.borrow().vmxon_seen_revision,
            Some(MOCK_REVISION_ID)
        );
    }

    #[test]
    fn is_enabled_reads_live_state() {
        let hal = MockVmx::healthy();
        let mut vmxon = Vmxon::new(hal.clone());
        vmxon.start().unwrap();
        assert!(vmxon.is_enabled());

        // Something outside the controller cleared the bit; the live query
        // reports it even though the controller still claims Enabled.
        let cr4 = hal.cr4();
        unsafe { hal.write_cr(4, cr4 & !CR4_VMXE) };
        assert!(!vmxon.is_enabled());
    }
}
