//! Process side of the bastion image loader.
//!
//! [`Loader`] drives `SetupImage` and `FreeImage` over a mapped image;
//! [`Platform`] is what it asks of the operating system.  The Windows and
//! Linux providers are the production implementations; tests bring their
//! own.

pub mod imports;
pub mod loader;
pub mod platform;
pub mod syscalls;

#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(windows)]
pub mod windows;

pub use loader::{Loader, EXIT_CODE};
pub use platform::{
    AffinityMasks, EntryReason, HandleClose, KernelDebuggerInfo, Phase, Platform, ProcessInfo, QueryResult,
    TrapProbe,
};
pub use syscalls::{resolve_syscalls, Resolution};

#[cfg(target_os = "linux")]
pub use linux::LinuxPlatform;
#[cfg(windows)]
pub use windows::WindowsPlatform;
