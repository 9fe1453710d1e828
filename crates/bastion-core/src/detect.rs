//! Decision logic of the anti-analysis detector.
//!
//! The runtime providers gather raw facts (PEB bytes, query results, CPUID
//! leaves, firmware blobs, the outcome of a trap-flag probe) and this module
//! turns each into a [`Finding`].  Whether a finding aborts the load or only
//! sets `is_debugger_detected` is decided by the lifecycle manager from the
//! option word.

use std::fmt;

/// Host the loader runs on.  Selects the vendor list and the section
/// protection model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostFamily {
    Windows,
    Unix,
}

impl HostFamily {
    pub const fn native() -> Self {
        if cfg!(windows) {
            HostFamily::Windows
        } else {
            HostFamily::Unix
        }
    }
}

/// What made a detector fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evidence {
    BeingDebugged,
    DebugPort,
    DebugObject,
    /// The build number could not be established by any source.
    UnknownBuild,
    KernelDebugger,
    KernelModule,
    /// First byte of a resolved API stub is `int3`.
    ApiBreakpoint,
    /// A page was guard or no-access before the loader touched it.
    MemoryBreakpoint,
    /// `CloseHandle` on a bogus handle succeeded or raised.
    InvalidHandle,
    /// The trap flag did not raise, or raised somewhere unexpected.
    SingleStep,
    HardwareBreakpoint,
    Tracer(u32),
    Hypervisor,
    FirmwareVendor(&'static str),
    Sandbox,
}

impl fmt::Display for Evidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Evidence::Tracer(pid) => write!(f, "traced by pid {pid}"),
            Evidence::FirmwareVendor(v) => write!(f, "firmware vendor {v}"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Uniform detector result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Finding {
    pub found: bool,
    pub evidence: Evidence,
}

impl Finding {
    pub const fn new(found: bool, evidence: Evidence) -> Self {
        Finding { found, evidence }
    }

    pub const fn hit(evidence: Evidence) -> Self {
        Finding { found: true, evidence }
    }
}

/// What a trap-flag probe observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Single-step never raised: something swallowed it.
    NoException,
    Exception {
        /// The byte at the reported exception address is the `nop` that
        /// follows the probed instruction.
        byte_matches: bool,
        /// Any of Dr0-Dr3 was armed in the captured context.
        debug_registers_set: bool,
    },
}

/// Byte every probe places after the probed instruction.
pub const PROBE_NOP: u8 = 0x90;
pub const INT3: u8 = 0xCC;
/// Handle value closed on purpose by the post-relocation pass.
pub const BOGUS_HANDLE: u32 = 0xDEAD_C0DE;

/// `ProcessDebugPort` queried through a direct syscall or the export.
pub fn debug_port_finding(query_succeeded: bool, port: u64) -> Finding {
    Finding::new(query_succeeded && port != 0, Evidence::DebugPort)
}

/// `ProcessDebugObjectHandle` through a direct syscall.  The query is issued
/// with its return-length pointer aimed at the handle slot, so a clean
/// process leaves the slot non-zero and fails the call.
pub fn debug_object_finding_direct(query_succeeded: bool, slot: u64) -> Finding {
    Finding::new(query_succeeded || slot == 0, Evidence::DebugObject)
}

/// `ProcessDebugObjectHandle` through the exported stub.
pub fn debug_object_finding_exported(query_succeeded: bool) -> Finding {
    Finding::new(query_succeeded, Evidence::DebugObject)
}

pub fn stub_breakpoint_finding(first_byte: u8) -> Finding {
    Finding::new(first_byte == INT3, Evidence::ApiBreakpoint)
}

/// `SYSTEM_KERNEL_DEBUGGER_INFORMATION`.
pub fn kernel_debugger_finding(enabled: bool, not_present: bool) -> Finding {
    Finding::new(enabled && !not_present, Evidence::KernelDebugger)
}

// Assembled byte by byte so the names never sit in the image as strings.
const SICE: [u8; 8] = [b's', b'i', b'c', b'e', b'.', b's', b'y', b's'];
const SIWVID: [u8; 10] = [b's', b'i', b'w', b'v', b'i', b'd', b'.', b's', b'y', b's'];
const NTICE: [u8; 9] = [b'n', b't', b'i', b'c', b'e', b'.', b's', b'y', b's'];
const ICEEXT: [u8; 10] = [b'i', b'c', b'e', b'e', b'x', b't', b'.', b's', b'y', b's'];
const SYSER: [u8; 9] = [b's', b'y', b's', b'e', b'r', b'.', b's', b'y', b's'];

/// File name of a loaded kernel module (the part after the last `\`).
pub fn is_kernel_debugger_module(file_name: &[u8]) -> bool {
    let known: [&[u8]; 5] = [&SICE, &SIWVID, &NTICE, &ICEEXT, &SYSER];
    known.iter().any(|k| k.eq_ignore_ascii_case(file_name))
}

pub fn kernel_module_finding<'a>(names: impl IntoIterator<Item = &'a [u8]>) -> Finding {
    let found = names.into_iter().any(is_kernel_debugger_module);
    Finding::new(found, Evidence::KernelModule)
}

/// Closing [`BOGUS_HANDLE`] must fail quietly.  Under a debugger the call
/// raises `EXCEPTION_INVALID_HANDLE` or is made to succeed.
pub fn invalid_handle_finding(closed: bool, raised: bool) -> Finding {
    Finding::new(closed || raised, Evidence::InvalidHandle)
}

/// Post-relocation trap probe.  A missing exception means a debugger ate
/// the single-step; an armed debug register is a hardware breakpoint.
pub fn trap_probe_debugger_finding(outcome: ProbeOutcome) -> Finding {
    match outcome {
        ProbeOutcome::NoException => Finding::hit(Evidence::SingleStep),
        ProbeOutcome::Exception {
            debug_registers_set, ..
        } => Finding::new(debug_registers_set, Evidence::HardwareBreakpoint),
    }
}

/// Verdict of one VM-pass trap probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmProbeVerdict {
    Clean,
    Debugger,
    /// The exception was reported one instruction late: the probed
    /// instruction was emulated.
    VirtualMachine,
}

pub fn vm_probe_verdict(outcome: ProbeOutcome) -> VmProbeVerdict {
    match outcome {
        ProbeOutcome::NoException => VmProbeVerdict::Debugger,
        ProbeOutcome::Exception { byte_matches: false, .. } => VmProbeVerdict::VirtualMachine,
        ProbeOutcome::Exception { byte_matches: true, .. } => VmProbeVerdict::Clean,
    }
}

/// General purpose registers returned by one CPUID leaf.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuidRegs {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

pub const CPUID_HYPERVISOR_BIT: u32 = 1 << 31;
pub const HV_VENDOR_LEAF: u32 = 0x4000_0000;
pub const HV_FEATURES_LEAF: u32 = 0x4000_0003;
const HV_ROOT_PARTITION: u32 = 0x1;

/// "Microsoft Hv" spread over ebx, ecx, edx.
fn is_microsoft_hv(regs: CpuidRegs) -> bool {
    regs.ebx == 0x7263_694d && regs.ecx == 0x666f_736f && regs.edx == 0x7648_2074
}

/// CPUID hypervisor bit.  On Windows a Hyper-V root partition also sets it;
/// that is the host, not a guest, and is let through.
pub fn hypervisor_finding(
    leaf1: CpuidRegs,
    host: HostFamily,
    mut cpuid: impl FnMut(u32) -> CpuidRegs,
) -> Finding {
    if leaf1.ecx & CPUID_HYPERVISOR_BIT == 0 {
        return Finding::new(false, Evidence::Hypervisor);
    }
    if host == HostFamily::Windows
        && is_microsoft_hv(cpuid(HV_VENDOR_LEAF))
        && cpuid(HV_FEATURES_LEAF).ebx & HV_ROOT_PARTITION != 0
    {
        return Finding::new(false, Evidence::Hypervisor);
    }
    Finding::hit(Evidence::Hypervisor)
}

const VMWARE: [u8; 6] = [b'V', b'M', b'w', b'a', b'r', b'e'];
const PARALLELS: [u8; 9] = [b'P', b'a', b'r', b'a', b'l', b'l', b'e', b'l', b's'];
const VIRTUALBOX: [u8; 10] = [b'V', b'i', b'r', b't', b'u', b'a', b'l', b'B', b'o', b'x'];
const QEMU: [u8; 4] = [b'Q', b'E', b'M', b'U'];
const MICROSOFT: [u8; 9] = [b'M', b'i', b'c', b'r', b'o', b's', b'o', b'f', b't'];
const INNOTEK: [u8; 7] = [b'i', b'n', b'n', b'o', b't', b'e', b'k'];

const WINDOWS_VENDORS: &[(&str, &[u8])] = &[
    ("VirtualBox", &VIRTUALBOX),
    ("VMware", &VMWARE),
    ("Parallels", &PARALLELS),
];

const UNIX_VENDORS: &[(&str, &[u8])] = &[
    ("QEMU", &QEMU),
    ("Microsoft", &MICROSOFT),
    ("innotek", &INNOTEK),
    ("VMware", &VMWARE),
    ("Parallels", &PARALLELS),
];

/// Scan a firmware blob (raw SMBIOS, BIOS shadow or the DMI `sys_vendor`
/// file) for a virtualization vendor.  Case-sensitive; the first offset
/// with any match wins.
pub fn find_firmware_vendor(data: &[u8], host: HostFamily) -> Option<&'static str> {
    let vendors = match host {
        HostFamily::Windows => WINDOWS_VENDORS,
        HostFamily::Unix => UNIX_VENDORS,
    };
    (0..data.len()).find_map(|i| {
        vendors
            .iter()
            .find(|(_, pat)| data[i..].starts_with(pat))
            .map(|(name, _)| *name)
    })
}

pub fn firmware_finding(data: &[u8], host: HostFamily) -> Option<Finding> {
    find_firmware_vendor(data, host).map(|v| Finding::hit(Evidence::FirmwareVendor(v)))
}

/// `TracerPid` out of `/proc/self/status`.  Leading blanks are skipped and
/// digits read until the first non-digit; anything other than a line end
/// after the digits makes the value unusable and yields 0.
pub fn parse_tracer_pid(status: &[u8]) -> u32 {
    const KEY: &[u8] = b"TracerPid:";
    let Some(start) = status.windows(KEY.len()).position(|w| w == KEY) else {
        return 0;
    };
    let rest = &status[start + KEY.len()..];
    let rest = match rest.iter().position(|&b| b != b' ' && b != b'\t') {
        Some(p) => &rest[p..],
        None => return 0,
    };
    let digits = rest.iter().take_while(|b| b.is_ascii_digit()).count();
    match rest.get(digits) {
        None | Some(b'\n') | Some(b'\r') => {}
        Some(_) => return 0,
    }
    rest[..digits].iter().fold(0u32, |acc, &b| {
        acc.wrapping_mul(10).wrapping_add(u32::from(b - b'0'))
    })
}

/// PID 1 reparents orphans and shows up as tracer in some containers.
pub fn tracer_finding(pid: u32) -> Finding {
    Finding::new(pid != 0 && pid != 1, Evidence::Tracer(pid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_object_semantics_differ_by_path() {
        // direct: clean process fails and leaves the slot non-zero
        assert!(!debug_object_finding_direct(false, 4).found);
        assert!(debug_object_finding_direct(true, 4).found);
        assert!(debug_object_finding_direct(false, 0).found);
        assert!(debug_object_finding_exported(true).found);
        assert!(!debug_object_finding_exported(false).found);
    }

    #[test]
    fn debug_port_needs_success_and_value() {
        assert!(debug_port_finding(true, 0xFFFF_FFFF).found);
        assert!(!debug_port_finding(true, 0).found);
        assert!(!debug_port_finding(false, 7).found);
    }

    #[test]
    fn kernel_modules_match_case_insensitively() {
        assert!(is_kernel_debugger_module(b"SICE.SYS"));
        assert!(is_kernel_debugger_module(b"Syser.sys"));
        assert!(!is_kernel_debugger_module(b"ntoskrnl.exe"));
        assert!(!is_kernel_debugger_module(b"sice.sy"));

        let loaded: [&[u8]; 3] = [b"ntoskrnl.exe", b"hal.dll", b"iceEXT.sys"];
        assert!(kernel_module_finding(loaded).found);
        let clean: [&[u8]; 1] = [b"ntoskrnl.exe"];
        assert!(!kernel_module_finding(clean).found);
    }

    #[test]
    fn kernel_debugger_flags() {
        assert!(kernel_debugger_finding(true, false).found);
        assert!(!kernel_debugger_finding(true, true).found);
        assert!(!kernel_debugger_finding(false, false).found);
    }

    #[test]
    fn probe_outcomes() {
        let clean = ProbeOutcome::Exception { byte_matches: true, debug_registers_set: false };
        let hw = ProbeOutcome::Exception { byte_matches: true, debug_registers_set: true };
        let late = ProbeOutcome::Exception { byte_matches: false, debug_registers_set: false };

        assert!(trap_probe_debugger_finding(ProbeOutcome::NoException).found);
        assert_eq!(trap_probe_debugger_finding(hw), Finding::hit(Evidence::HardwareBreakpoint));
        assert!(!trap_probe_debugger_finding(clean).found);

        assert_eq!(vm_probe_verdict(ProbeOutcome::NoException), VmProbeVerdict::Debugger);
        assert_eq!(vm_probe_verdict(late), VmProbeVerdict::VirtualMachine);
        assert_eq!(vm_probe_verdict(clean), VmProbeVerdict::Clean);
    }

    fn hyperv(root: bool) -> impl FnMut(u32) -> CpuidRegs {
        move |leaf| match leaf {
            HV_VENDOR_LEAF => CpuidRegs { eax: 0, ebx: 0x7263_694d, ecx: 0x666f_736f, edx: 0x7648_2074 },
            HV_FEATURES_LEAF => CpuidRegs { ebx: u32::from(root), ..Default::default() },
            _ => CpuidRegs::default(),
        }
    }

    #[test]
    fn hypervisor_bit_and_root_partition() {
        let bare = CpuidRegs { ecx: 0x7FFA_F3BF, ..Default::default() };
        let guest = CpuidRegs { ecx: 0xFFFA_3203, ..Default::default() };

        assert!(!hypervisor_finding(bare, HostFamily::Windows, hyperv(false)).found);
        assert!(hypervisor_finding(guest, HostFamily::Windows, hyperv(false)).found);
        assert!(!hypervisor_finding(guest, HostFamily::Windows, hyperv(true)).found);
        // the carve-out is Windows only
        assert!(hypervisor_finding(guest, HostFamily::Unix, hyperv(true)).found);
        // a different hypervisor vendor with bit 0 set is still a guest
        let kvm = |leaf: u32| match leaf {
            HV_VENDOR_LEAF => CpuidRegs { ebx: 0x4b4d_564b, ecx: 0x564b_4d56, edx: 0x4d, eax: 0 },
            _ => CpuidRegs { ebx: 1, ..Default::default() },
        };
        assert!(hypervisor_finding(guest, HostFamily::Windows, kvm).found);
    }

    #[test]
    fn firmware_vendor_lists() {
        let mut smbios = vec![0u8; 64];
        smbios[20..30].copy_from_slice(b"VirtualBox");
        assert_eq!(find_firmware_vendor(&smbios, HostFamily::Windows), Some("VirtualBox"));
        assert_eq!(find_firmware_vendor(&smbios, HostFamily::Unix), None);

        assert_eq!(find_firmware_vendor(b"QEMU\n", HostFamily::Unix), Some("QEMU"));
        assert_eq!(find_firmware_vendor(b"innotek GmbH\n", HostFamily::Unix), Some("innotek"));
        assert_eq!(find_firmware_vendor(b"Microsoft Corporation", HostFamily::Unix), Some("Microsoft"));
        assert_eq!(find_firmware_vendor(b"Microsoft Corporation", HostFamily::Windows), None);
        assert_eq!(find_firmware_vendor(b"xxVMware, Inc.", HostFamily::Windows), Some("VMware"));
        assert_eq!(find_firmware_vendor(b"Parallels", HostFamily::Unix), Some("Parallels"));
        // truncated at the end of the blob
        assert_eq!(find_firmware_vendor(b"Dell Inc. VMwar", HostFamily::Unix), None);
        assert_eq!(find_firmware_vendor(b"vmware", HostFamily::Windows), None);
        assert!(firmware_finding(b"LENOVO", HostFamily::Unix).is_none());
    }

    #[test]
    fn tracer_pid_parsing() {
        let status = b"Name:\tcat\nState:\tR (running)\nTracerPid:\t4242\nUid:\t0\n";
        assert_eq!(parse_tracer_pid(status), 4242);
        assert_eq!(parse_tracer_pid(b"TracerPid:\t0\n"), 0);
        assert_eq!(parse_tracer_pid(b"TracerPid:   17"), 17);
        assert_eq!(parse_tracer_pid(b"TracerPid:\t12x\n"), 0);
        assert_eq!(parse_tracer_pid(b"Name:\tcat\n"), 0);

        assert!(tracer_finding(4242).found);
        assert!(!tracer_finding(1).found);
        assert!(!tracer_finding(0).found);
    }

    #[test]
    fn stub_and_handle_checks() {
        assert!(stub_breakpoint_finding(0xCC).found);
        assert!(!stub_breakpoint_finding(0x4C).found);
        assert!(invalid_handle_finding(true, false).found);
        assert!(invalid_handle_finding(false, true).found);
        assert!(!invalid_handle_finding(false, false).found);
    }
}
