//! Per-CPU control of VMX root mode.
//!
//! Everything a hypervisor must do before it can touch a VMCS lives here:
//! the capability checks, the VMXON region, and the VMXON/VMXOFF transition
//! itself. Hardware access goes through the [`VmxHal`] trait so the whole
//! sequence can be exercised against a simulated processor.

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate alloc;
#[macro_use]
extern crate log;

#[macro_use]
mod error;

mod consts;
mod hal;
mod structs;
mod vmxon;

pub use consts::PAGE_SIZE;
pub use error::{VmxError, VmxErrorKind, VmxResult};
pub use hal::{InstrFail, PhysAddr, VirtAddr, VmxHal};
pub use structs::{FeatureControlFlags, VmxBasic};
pub use vmxon::{VmxState, Vmxon};

#[cfg(target_arch = "x86_64")]
pub use hal::HwVmx;
