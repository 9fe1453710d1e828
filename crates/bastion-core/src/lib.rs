//! OS-independent half of the bastion image loader.
//!
//! Everything in this crate works on byte slices handed in by the runtime:
//! descriptor tables, CRC tables, packed units, fixup and import records,
//! export directories of loaded modules, syscall stubs.  Nothing here
//! touches the process it runs in, which keeps every decision testable on
//! synthetic images.

pub mod cpu;
pub mod crypto;
pub mod descriptor;
pub mod detect;
pub mod error;
pub mod fixup;
pub mod global;
pub mod integrity;
pub mod layout;
pub mod lzma;
pub mod message;
pub mod pe;
pub mod protect;
pub mod syscall;

pub use cpu::{cpu_hash, cpu_salt, CpuHashSet, CPU_HASH_CAPACITY};
pub use descriptor::{Descriptor, LoaderOptions, TableRef};
pub use detect::{CpuidRegs, Evidence, Finding, HostFamily, ProbeOutcome};
pub use error::{InitCode, LoaderError, LzmaError, ViewError};
pub use fixup::{ImageFlavor, IndirectResolver};
pub use global::{GlobalData, GlobalSlot, LoaderStatus};
pub use integrity::{CrcInfo, CrcReport};
pub use layout::{ImageView, ImageViewMut, PointerWidth};
pub use lzma::{LzmaDecoder, LzmaProperties};
pub use message::{format_message, Message, MessageArg, MessageKind};
pub use pe::{get_proc_address, ModuleResolver, ProcName};
pub use syscall::{OsBuild, Syscall, SyscallArch, SyscallTable};
