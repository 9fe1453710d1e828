//! Settling the service-number table for this process.
//!
//! The build number comes from the first source that names a known build:
//! the PEB, the version resource of the loaded ntdll, the version resource
//! of a freshly mapped ntdll from disk.  When only the disk copy is left the
//! numbers are also read straight out of its stubs.  A known build then
//! replaces whatever was parsed with the built-in table row.

use log::{debug, warn};

use bastion_core::cpu::cpu_salt;
use bastion_core::pe::{export_stub, has_export};
use bastion_core::syscall::{is_known_build, module_build_number};
use bastion_core::{LoaderError, SyscallArch, SyscallTable};

use crate::platform::Platform;

const WINE_GET_VERSION: [u8; 16] = [
    b'w', b'i', b'n', b'e', b'_', b'g', b'e', b't', b'_', b'v', b'e', b'r', b's', b'i', b'o', b'n',
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Build number stored in `GlobalData`.
    pub build: u16,
    pub table: SyscallTable,
    /// Salt for the CPU hashes; always from the PEB build.
    pub cpu_salt: u64,
    /// No source produced a build number.  Treated as tampering.
    pub unknown_build: bool,
    pub wine: bool,
}

/// Bitness `parse_syscall_stub` decodes a stub of `arch` with.
fn stub_bitness(arch: SyscallArch) -> u32 {
    match arch {
        SyscallArch::X64 => 64,
        SyscallArch::Wow64 | SyscallArch::X86 => 32,
    }
}

pub fn resolve_syscalls<P: Platform + ?Sized>(
    platform: &mut P,
    arch: SyscallArch,
) -> Result<Resolution, LoaderError> {
    let peb_build = platform.peb_build_number();
    let mut out = Resolution {
        cpu_salt: cpu_salt(peb_build),
        ..Resolution::default()
    };

    let ntdll = platform.ntdll_base();
    let view = ntdll.and_then(|base| platform.image(base));
    if view.as_ref().is_some_and(|v| has_export(v, &WINE_GET_VERSION)) {
        debug!("running under wine, syscall layer disabled");
        out.wine = true;
        return Ok(out);
    }

    let mut build = peb_build;
    let mut parsed = SyscallTable::default();
    if !is_known_build(build) {
        build = view.as_ref().map_or(0, module_build_number);
        if !is_known_build(build) {
            let bitness = stub_bitness(arch);
            let mut disk_build = 0u16;
            let mapped = platform.with_disk_ntdll(&mut |disk| {
                disk_build = module_build_number(disk);
                if !is_known_build(disk_build) {
                    parsed = SyscallTable::from_stubs(bitness, |call| export_stub(disk, call.export_name()));
                }
            })?;
            build = if mapped { disk_build } else { 0 };
            if arch == SyscallArch::Wow64 {
                parsed = parsed.truncate_wow64();
            }
        }
        if build == 0 {
            warn!("no source named the OS build");
            out.unknown_build = true;
        }
    }

    out.build = build;
    out.table = SyscallTable::for_build(build, arch).unwrap_or(parsed);
    if arch == SyscallArch::Wow64 && out.table.close != 0 {
        out.table = out.table.wow64_tagged();
    }
    debug!(
        "os build {}, syscall table {}",
        build,
        if out.table.is_resolved() { "resolved" } else { "incomplete" }
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_core::syscall::WOW64_FLAG;
    use bastion_core::{ImageView, Message, ModuleResolver, ProcName};

    struct Host {
        peb_build: u16,
        disk_calls: usize,
    }

    impl ModuleResolver for Host {
        fn image(&self, _base: u64) -> Option<ImageView<'_>> {
            None
        }
        fn find_loaded(&self, _name: &[u8]) -> Option<u64> {
            None
        }
        fn load(&mut self, _name: &[u8]) -> Option<u64> {
            None
        }
        fn native_get_proc_address(&mut self, _base: u64, _name: ProcName<'_>) -> Option<u64> {
            None
        }
    }

    impl Platform for Host {
        fn peb_build_number(&self) -> u16 {
            self.peb_build
        }
        fn with_disk_ntdll(&mut self, _visit: &mut dyn FnMut(&ImageView<'_>)) -> Result<bool, LoaderError> {
            self.disk_calls += 1;
            Ok(false)
        }
        fn show_message(&mut self, _message: &Message) {}
        fn exit_process(&mut self, _code: u32) {}
    }

    fn host(peb_build: u16) -> Host {
        Host { peb_build, disk_calls: 0 }
    }

    #[test]
    fn known_peb_build_uses_the_table() {
        let mut h = host(19045);
        let r = resolve_syscalls(&mut h, SyscallArch::X64).unwrap();
        assert_eq!(r.build, 19045);
        assert!(!r.unknown_build);
        assert_eq!(Some(r.table), SyscallTable::for_build(19045, SyscallArch::X64));
        assert_eq!(r.cpu_salt, cpu_salt(19045));
        assert_eq!(h.disk_calls, 0);
    }

    #[test]
    fn unknown_build_without_any_ntdll_is_flagged() {
        let mut h = host(0);
        let r = resolve_syscalls(&mut h, SyscallArch::X64).unwrap();
        assert!(r.unknown_build);
        assert_eq!(r.build, 0);
        assert_eq!(r.table, SyscallTable::default());
        assert_eq!(h.disk_calls, 1);
    }

    #[test]
    fn windows_11_falls_back_to_disk() {
        let mut h = host(22621);
        let r = resolve_syscalls(&mut h, SyscallArch::X64).unwrap();
        assert_eq!(h.disk_calls, 1);
        // Salt still follows the PEB.
        assert_eq!(r.cpu_salt, cpu_salt(22621));
        assert!(r.unknown_build);
    }

    #[test]
    fn wow64_numbers_are_tagged() {
        let mut h = host(7601);
        let r = resolve_syscalls(&mut h, SyscallArch::Wow64).unwrap();
        assert_ne!(r.table.close & WOW64_FLAG, 0);
    }
}
