//! Error taxonomy shared by every loader phase.
//!
//! Two layers exist.  Low-level helpers (`ViewError`, `LzmaError`) describe
//! *why* a table or stream could not be processed; `LoaderError` is the
//! fatal kind the lifecycle manager surfaces, and each variant maps onto
//! exactly one user-visible message.

use std::fmt;

use thiserror::Error;

use crate::message::MessageKind;

/// A bounds-checked read or write fell outside the image or file view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("access of {len} bytes at {offset:#x} exceeds view of {size:#x} bytes")]
pub struct ViewError {
    pub offset: u64,
    pub len: usize,
    pub size: usize,
}

/// Failures raised by the LZMA unpacker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LzmaError {
    /// Fewer than five property bytes, or `lc/lp/pb` out of range.
    #[error("invalid LZMA properties")]
    InvalidProperties,
    /// The probability model could not be allocated.
    #[error("cannot allocate {0} probability slots")]
    Allocation(usize),
    /// The range coder ran past the input or referenced data before the
    /// start of the window.
    #[error("corrupt LZMA stream at input offset {0:#x}")]
    Corrupt(usize),
}

/// Numeric codes shown in the "Initialization error" message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum InitCode {
    VirtualProtect = 1,
    Unpacker = 2,
    InternalGpa = 3,
    CpuHash = 5,
}

impl fmt::Display for InitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u32)
    }
}

/// Fatal outcome of `SetupImage`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoaderError {
    #[error("initialization error {0}")]
    Initialization(InitCode),
    #[error("procedure {api} not found in {dll}")]
    ProcNotFound { api: String, dll: String },
    #[error("ordinal {ordinal} not found in {dll}")]
    OrdinalNotFound { ordinal: u16, dll: String },
    #[error("file corrupted")]
    FileCorrupted,
    #[error("debugger found")]
    DebuggerFound,
    #[error("virtual machine found")]
    VirtualMachineFound,
    /// Import resolution failed while the process hard-error mode asks for
    /// no UI.
    #[error("import resolution failed silently")]
    SilentImportFailure,
    /// The wrapped entry point refused the ATTACH notification.
    #[error("runtime entry rejected attach")]
    EntryRejected,
}

impl LoaderError {
    /// The message shown before `SetupImage` fails, if any.
    pub fn message_kind(&self) -> Option<MessageKind> {
        match self {
            LoaderError::Initialization(_) => Some(MessageKind::InitializationError),
            LoaderError::ProcNotFound { .. } => Some(MessageKind::ProcNotFound),
            LoaderError::OrdinalNotFound { .. } => Some(MessageKind::OrdinalNotFound),
            LoaderError::FileCorrupted => Some(MessageKind::FileCorrupted),
            LoaderError::DebuggerFound => Some(MessageKind::DebuggerFound),
            LoaderError::VirtualMachineFound => Some(MessageKind::VirtualMachineFound),
            LoaderError::SilentImportFailure | LoaderError::EntryRejected => None,
        }
    }
}

impl From<ViewError> for LoaderError {
    // A table that points outside the image is indistinguishable from a
    // patched one.
    fn from(_: ViewError) -> Self {
        LoaderError::FileCorrupted
    }
}

impl From<LzmaError> for LoaderError {
    fn from(_: LzmaError) -> Self {
        LoaderError::Initialization(InitCode::Unpacker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_code_renders_numeric() {
        let e = LoaderError::Initialization(InitCode::CpuHash);
        assert_eq!(e.to_string(), "initialization error 5");
    }

    #[test]
    fn silent_failure_has_no_message() {
        assert_eq!(LoaderError::SilentImportFailure.message_kind(), None);
        assert_eq!(
            LoaderError::FileCorrupted.message_kind(),
            Some(MessageKind::FileCorrupted)
        );
    }

    #[test]
    fn lzma_failure_maps_to_unpacker_code() {
        let e: LoaderError = LzmaError::Corrupt(3).into();
        assert_eq!(e, LoaderError::Initialization(InitCode::Unpacker));
    }
}
