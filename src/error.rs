use alloc::string::String;
use core::fmt::{Debug, Formatter, Result};

/// Reasons a VMX root-mode transition can fail.
#[repr(u32)]
#[allow(dead_code)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmxErrorKind {
    UnsupportedProcessor = 1,
    IncompatibleCapabilities,
    InvalidControlRegisterState,
    FeatureLocked,
    IncompatibleProcessorMode,
    ResourceExhausted,
    ModeEnterFailed,
    ModeExitFailed,
    NotEnabled,
    AlreadyEnabled,
}

pub struct VmxError {
    kind: VmxErrorKind,
    loc_line: u32,
    loc_col: u32,
    loc_file: &'static str,
    msg: Option<String>,
}

pub type VmxResult<T = ()> = core::result::Result<T, VmxError>;

impl VmxErrorKind {
    pub fn as_str(&self) -> &'static str {
        use VmxErrorKind::*;
        match *self {
            UnsupportedProcessor => "Processor does not support VMX",
            IncompatibleCapabilities => "VMX capability MSR constraints not met",
            InvalidControlRegisterState => "Control register violates VMX fixed bits",
            FeatureLocked => "VMX not enabled by feature control MSR",
            IncompatibleProcessorMode => "Processor mode does not allow VMXON",
            ResourceExhausted => "VMXON region allocation failed",
            ModeEnterFailed => "VMXON instruction faulted",
            ModeExitFailed => "VMXOFF instruction faulted",
            NotEnabled => "VMX root mode is off",
            AlreadyEnabled => "VMX root mode is already on",
        }
    }
}

impl VmxError {
    pub fn new(
        kind: VmxErrorKind,
        loc_file: &'static str,
        loc_line: u32,
        loc_col: u32,
        msg: Option<String>,
    ) -> Self {
        Self {
            kind,
            loc_file,
            loc_line,
            loc_col,
            msg,
        }
    }

    pub fn kind(&self) -> VmxErrorKind {
        self.kind
    }
}

impl Debug for VmxError {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(
            f,
            "[{}:{}:{}] {}",
            self.loc_file,
            self.loc_line,
            self.loc_col,
            self.kind.as_str()
        )?;
        if let Some(ref msg) = self.msg {
            write!(f, ": {}", msg)?;
        }
        Ok(())
    }
}

#[macro_export]
macro_rules! vmx_err {
    ($kind: ident) => {{
        use $crate::VmxErrorKind::*;
        $crate::VmxError::new($kind, file!(), line!(), column!(), None)
    }};
    ($kind: ident, $msg: expr) => {{
        use $crate::VmxErrorKind::*;
        $crate::VmxError::new($kind, file!(), line!(), column!(), Some($msg.into()))
    }};
}

#[macro_export]
macro_rules! vmx_result_err {
    ($kind: ident) => {
        Err(vmx_err!($kind))
    };
    ($kind: ident, $msg: expr) => {
        Err(vmx_err!($kind, $msg))
    };
}
