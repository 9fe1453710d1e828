//! What the loader needs from the process it runs in.
//!
//! [`Platform`] is the only seam between the pipeline in `loader` and the
//! operating system.  Providers report raw facts (query results, probe
//! outcomes, file bytes) and perform the few side effects the loader cannot
//! do on a byte slice; every decision about those facts is made by
//! `bastion_core` helpers on the loader side.
//!
//! Defaults describe a host with nothing to report: no syscall layer, no
//! debugger, no firmware tables, protections that always succeed.  The
//! Windows and Linux providers override what their OS offers, tests override
//! whatever a scenario needs.

use bastion_core::detect::HostFamily;
use bastion_core::{
    CpuidRegs, ImageFlavor, ImageView, LoaderError, Message, ModuleResolver, PointerWidth,
    ProbeOutcome, SyscallArch, SyscallTable,
};

/// Pipeline steps, reported through [`Platform::on_phase`] as each starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Start,
    ResolveSyscalls,
    DetectAnalysisPre,
    VerifyLoader,
    VerifyFile,
    MakeWritable,
    Unpack,
    Relocate,
    ResolveStaticImports,
    ResolveInternalImports,
    DetectAnalysisPost,
    DetectVm,
    VerifyMemory,
    BindCpu,
    PublishState,
    InvokeEntry,
    ResolveDelayImports,
    RestoreProtections,
    Success,
}

/// Why the wrapped entry point is being called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryReason {
    ProcessAttach,
    ProcessDetach,
}

/// `NtQueryInformationProcess` classes the loader asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ProcessInfo {
    DebugPort = 7,
    DefaultHardErrorMode = 12,
    DebugObjectHandle = 0x1e,
}

/// Raw result of a process query.  `value` is whatever the provider found
/// in the output slot, whether or not the call succeeded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryResult {
    pub succeeded: bool,
    pub value: u64,
}

impl QueryResult {
    pub const fn ok(value: u64) -> Self {
        QueryResult { succeeded: true, value }
    }

    pub const fn failed(value: u64) -> Self {
        QueryResult { succeeded: false, value }
    }
}

/// Result of closing a handle that does not exist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandleClose {
    pub closed: bool,
    pub raised: bool,
}

/// Instruction run under the trap flag, followed by a `nop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapProbe {
    Rdtsc,
    Cpuid,
}

/// `SYSTEM_KERNEL_DEBUGGER_INFORMATION`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelDebuggerInfo {
    pub enabled: bool,
    pub not_present: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AffinityMasks {
    pub process: u64,
    pub system: u64,
}

pub trait Platform: ModuleResolver {
    // ---- identity --------------------------------------------------------

    fn host(&self) -> HostFamily {
        HostFamily::native()
    }

    fn flavor(&self) -> ImageFlavor {
        ImageFlavor::native()
    }

    fn pointer_width(&self) -> PointerWidth {
        PointerWidth::native()
    }

    fn on_phase(&mut self, _phase: Phase) {}

    // ---- syscall layer ---------------------------------------------------

    /// Native-API flavour of the process; `None` where there is no ntdll.
    fn syscall_arch(&self) -> Option<SyscallArch> {
        None
    }

    /// `OSBuildNumber` from the PEB.
    fn peb_build_number(&self) -> u16 {
        0
    }

    fn ntdll_base(&self) -> Option<u64> {
        None
    }

    /// Loaded modules as `(file name, base)`, in load order.
    fn loaded_modules(&mut self) -> Vec<(Vec<u8>, u64)> {
        Vec::new()
    }

    /// Map a fresh, non-executable copy of ntdll from disk and show it to
    /// `visit`.  `Ok(false)` when the file could not be mapped; a missing
    /// export needed to map it is `InternalGpa`.
    fn with_disk_ntdll(&mut self, _visit: &mut dyn FnMut(&ImageView<'_>)) -> Result<bool, LoaderError> {
        Ok(false)
    }

    /// Service numbers settled for this process.  Zero entries go through
    /// the exported stubs.
    fn install_syscalls(&mut self, _table: &SyscallTable) {}

    // ---- debugger facts --------------------------------------------------

    /// `PEB.BeingDebugged`.
    fn being_debugged(&mut self) -> bool {
        false
    }

    /// Drop any instrumentation callback on systems that have them.
    fn clear_instrumentation_callback(&mut self) {}

    fn query_process(&mut self, _class: ProcessInfo) -> QueryResult {
        QueryResult::default()
    }

    /// `ThreadHideFromDebugger` on the calling thread.
    fn hide_thread(&mut self) {}

    /// Contents of `/proc/self/status`.
    fn proc_status(&mut self) -> Option<Vec<u8>> {
        None
    }

    fn kernel_debugger_info(&mut self) -> Option<KernelDebuggerInfo> {
        None
    }

    /// File names of loaded kernel modules.
    fn kernel_modules(&mut self) -> Vec<Vec<u8>> {
        Vec::new()
    }

    fn close_handle(&mut self, _handle: u32) -> HandleClose {
        HandleClose::default()
    }

    fn trap_probe(&mut self, _probe: TrapProbe) -> ProbeOutcome {
        ProbeOutcome::Exception {
            byte_matches: true,
            debug_registers_set: false,
        }
    }

    // ---- virtual machine facts -------------------------------------------

    fn cpuid(&mut self, leaf: u32) -> CpuidRegs {
        native_cpuid(leaf)
    }

    /// Firmware blobs to scan for vendor strings: raw SMBIOS tables, the
    /// BIOS shadow, or the DMI `sys_vendor` file.
    fn firmware_tables(&mut self) -> Vec<Vec<u8>> {
        Vec::new()
    }

    // ---- integrity -------------------------------------------------------

    /// The module's file on disk, read through a channel independent of the
    /// mapped image.  `None` when it cannot be opened.
    fn read_own_file(&mut self) -> Option<Vec<u8>> {
        None
    }

    /// Base of the allocation containing `address`.
    fn allocation_base(&mut self, _address: u64) -> Option<u64> {
        None
    }

    // ---- memory ----------------------------------------------------------

    /// Change the protection of a range and return the previous one.
    /// `None` is a failed call.
    fn protect(&mut self, _address: u64, _size: usize, _protection: u32) -> Option<u32> {
        Some(0)
    }

    // ---- CPU binding -----------------------------------------------------

    fn affinity(&mut self) -> Option<AffinityMasks> {
        None
    }

    fn set_process_affinity(&mut self, _mask: u64) -> bool {
        true
    }

    /// Pin the calling thread and return the mask it had.
    fn pin_thread(&mut self, _mask: u64) -> u64 {
        0
    }

    // ---- calls out of the loader -----------------------------------------

    /// Invoke the wrapped module's entry point.  `false` rejects the load.
    fn call_entry(&mut self, _entry: u64, _image_base: u64, _reason: EntryReason) -> bool {
        true
    }

    fn call_driver_unload(&mut self, _routine: u64) {}

    /// Run an `IRELATIVE` resolver and return the address it picked.
    fn call_indirect(&mut self, function: u64) -> u64 {
        function
    }

    fn timestamp(&mut self) -> u64 {
        native_timestamp()
    }

    fn show_message(&mut self, message: &Message);

    fn exit_process(&mut self, code: u32);
}

/// `CPUID` on the executing core.  Zeroes where the instruction does not
/// exist.
#[allow(unused_unsafe)]
pub fn native_cpuid(leaf: u32) -> CpuidRegs {
    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: CPUID is available on every x86_64 processor.
        let r = unsafe { core::arch::x86_64::__cpuid(leaf) };
        CpuidRegs {
            eax: r.eax,
            ebx: r.ebx,
            ecx: r.ecx,
            edx: r.edx,
        }
    }
    #[cfg(target_arch = "x86")]
    {
        // SAFETY: the loader targets processors with CPUID.
        let r = unsafe { core::arch::x86::__cpuid(leaf) };
        CpuidRegs {
            eax: r.eax,
            ebx: r.ebx,
            ecx: r.ecx,
            edx: r.edx,
        }
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "x86")))]
    {
        let _ = leaf;
        CpuidRegs::default()
    }
}

/// Time-stamp counter, or a random word on targets without one.
pub fn native_timestamp() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: RDTSC has no preconditions in user mode.
        unsafe { core::arch::x86_64::_rdtsc() }
    }
    #[cfg(target_arch = "x86")]
    {
        // SAFETY: as above.
        unsafe { core::arch::x86::_rdtsc() }
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "x86")))]
    {
        rand::random()
    }
}

/// Session key folded out of a time stamp.
pub fn session_key(stamp: u64) -> u32 {
    (stamp ^ (stamp >> 32)) as u32
}

/// Adapter handing `IRELATIVE` calls to the platform.
pub(crate) struct Indirect<'a, P: Platform + ?Sized>(pub &'a mut P);

impl<P: Platform + ?Sized> bastion_core::IndirectResolver for Indirect<'_, P> {
    fn resolve(&mut self, function: u64) -> u64 {
        self.0.call_indirect(function)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_folds_high_word() {
        assert_eq!(session_key(0x0000_0001_0000_0002), 3);
        assert_eq!(session_key(0xFFFF_FFFF_FFFF_FFFF), 0);
        assert_eq!(session_key(0x1234), 0x1234);
    }
}
