//! Syscall-number resolution for the direct `syscall` path.
//!
//! The runtime never calls the `Nt*` exports it needs for the integrity and
//! debugger checks through their (hookable) stubs when it can avoid it.  It
//! needs nine service numbers, which come from one of two places:
//!
//! * a per-build table, once the Windows build number is known;
//! * the `mov eax, imm32` of the stubs in a pristine ntdll mapped from disk,
//!   when the build is not in the table.
//!
//! The build number itself comes from the PEB, then from the `FileVersion`
//! in ntdll's version resource.  Everything here is pure; the runtime does
//! the mapping and the PEB read.

use iced_x86::{Decoder, DecoderOptions, Mnemonic, OpKind, Register};

use crate::layout::ImageView;
use crate::pe::{NtHeaders, IMAGE_DIRECTORY_ENTRY_RESOURCE};

/// Set on WOW64 numbers; the upper byte carries the argument-shape tag the
/// 32-bit stub dispatcher expects.
pub const WOW64_FLAG: u32 = 0x0080_0000;

// ---------------------------------------------------------------------------
// Builds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum OsBuild {
    WindowsXp = 2600,
    Windows2003 = 3790,
    WindowsVista = 6000,
    WindowsVistaSp1 = 6001,
    WindowsVistaSp2 = 6002,
    Windows7 = 7600,
    Windows7Sp1 = 7601,
    Windows8 = 9200,
    Windows81 = 9600,
    Windows10Th1 = 10240,
    Windows10Th2 = 10586,
    Windows10Rs1 = 14393,
    Windows10Rs2 = 15063,
    Windows10Rs3 = 16299,
    Windows10Rs4 = 17134,
    Windows10Rs5 = 17763,
    Windows10_19H1 = 18362,
    Windows10_19H2 = 18363,
    Windows10_20H1 = 19041,
    Windows10_20H2 = 19042,
    Windows10_21H1 = 19043,
    Windows10_21H2 = 19044,
    Windows10_22H2 = 19045,
    Windows11_21H2 = 22000,
    Windows11_22H2 = 22621,
}

impl OsBuild {
    pub const ALL: [OsBuild; 25] = [
        OsBuild::WindowsXp,
        OsBuild::Windows2003,
        OsBuild::WindowsVista,
        OsBuild::WindowsVistaSp1,
        OsBuild::WindowsVistaSp2,
        OsBuild::Windows7,
        OsBuild::Windows7Sp1,
        OsBuild::Windows8,
        OsBuild::Windows81,
        OsBuild::Windows10Th1,
        OsBuild::Windows10Th2,
        OsBuild::Windows10Rs1,
        OsBuild::Windows10Rs2,
        OsBuild::Windows10Rs3,
        OsBuild::Windows10Rs4,
        OsBuild::Windows10Rs5,
        OsBuild::Windows10_19H1,
        OsBuild::Windows10_19H2,
        OsBuild::Windows10_20H1,
        OsBuild::Windows10_20H2,
        OsBuild::Windows10_21H1,
        OsBuild::Windows10_21H2,
        OsBuild::Windows10_22H2,
        OsBuild::Windows11_21H2,
        OsBuild::Windows11_22H2,
    ];

    pub fn from_number(n: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|b| *b as u16 == n)
    }

    pub const fn number(self) -> u16 {
        self as u16
    }

    /// Builds with a service-number table.  Windows 11 is named but always
    /// goes through stub parsing.
    pub const fn is_known(self) -> bool {
        (self as u16) <= OsBuild::Windows10_22H2 as u16
    }
}

pub fn is_known_build(n: u16) -> bool {
    OsBuild::from_number(n).map_or(false, OsBuild::is_known)
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallArch {
    X64,
    /// 32-bit process on a 64-bit kernel.
    Wow64,
    X86,
}

/// The nine services used by the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Syscall {
    Close,
    ProtectVirtualMemory,
    OpenFile,
    CreateSection,
    MapViewOfSection,
    UnmapViewOfSection,
    QueryInformationProcess,
    SetInformationThread,
    QueryVirtualMemory,
}

impl Syscall {
    pub const ALL: [Syscall; 9] = [
        Syscall::Close,
        Syscall::ProtectVirtualMemory,
        Syscall::OpenFile,
        Syscall::CreateSection,
        Syscall::MapViewOfSection,
        Syscall::UnmapViewOfSection,
        Syscall::QueryInformationProcess,
        Syscall::SetInformationThread,
        Syscall::QueryVirtualMemory,
    ];

    /// Name of the ntdll export.
    pub const fn export_name(self) -> &'static [u8] {
        match self {
            Syscall::Close => b"NtClose",
            Syscall::ProtectVirtualMemory => b"NtProtectVirtualMemory",
            Syscall::OpenFile => b"NtOpenFile",
            Syscall::CreateSection => b"NtCreateSection",
            Syscall::MapViewOfSection => b"NtMapViewOfSection",
            Syscall::UnmapViewOfSection => b"NtUnmapViewOfSection",
            Syscall::QueryInformationProcess => b"NtQueryInformationProcess",
            Syscall::SetInformationThread => b"NtSetInformationThread",
            Syscall::QueryVirtualMemory => b"NtQueryVirtualMemory",
        }
    }

    /// WOW64 argument-shape tag, placed in the top byte.
    const fn wow64_tag(self) -> u32 {
        match self {
            Syscall::Close => 0,
            Syscall::ProtectVirtualMemory => 1,
            Syscall::SetInformationThread => 2,
            Syscall::QueryInformationProcess => 3,
            Syscall::MapViewOfSection => 4,
            Syscall::UnmapViewOfSection => 5,
            Syscall::OpenFile => 6,
            Syscall::CreateSection => 7,
            Syscall::QueryVirtualMemory => 8,
        }
    }
}

/// Service numbers, 0 when unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyscallTable {
    pub close: u32,
    pub protect: u32,
    pub open_file: u32,
    pub create_section: u32,
    pub map_view: u32,
    pub unmap_view: u32,
    pub query_information_process: u32,
    pub set_information_thread: u32,
    pub query_virtual_memory: u32,
}

// close, protect, open_file, create_section, map, unmap, qip, sit, qvm
type Row = [u32; 9];

const X64_NT6: Row = [0x0c, 0x4d, 0x30, 0x47, 0x25, 0x27, 0x16, 0x0a, 0x20];
const X64_WIN8: Row = [0x0d, 0x4e, 0x31, 0x48, 0x26, 0x28, 0x17, 0x0b, 0x21];
const X64_WIN81: Row = [0x0e, 0x4f, 0x32, 0x49, 0x27, 0x29, 0x18, 0x0c, 0x22];
const X64_WIN10: Row = [0x0f, 0x50, 0x33, 0x4a, 0x28, 0x2a, 0x19, 0x0d, 0x23];

const X86_XP: Row = [0x19, 0x89, 0x74, 0x32, 0x6c, 0x10b, 0x9a, 0xe5, 0xb2];
const X86_2003: Row = [0x1b, 0x8f, 0x7a, 0x34, 0x71, 0x115, 0xa1, 0xee, 0xba];
const X86_VISTA: Row = [0x30, 0xd2, 0xba, 0x4b, 0xb1, 0x160, 0xe4, 0x136, 0xfd];
const X86_VISTA_SP: Row = [0x30, 0xd2, 0xba, 0x4b, 0xb1, 0x15c, 0xe4, 0x132, 0xfd];
const X86_WIN7: Row = [0x32, 0xd7, 0xb3, 0x54, 0xa8, 0x181, 0xea, 0x14f, 0x10b];
const X86_WIN8: Row = [0x174, 0xc3, 0xe8, 0x150, 0xf3, 0x13, 0xb0, 0x48, 0x8f];
const X86_WIN81: Row = [0x179, 0xc6, 0xeb, 0x154, 0xf6, 0x13, 0xb3, 0x4b, 0x92];
const X86_TH1: Row = [0x180, 0xc8, 0xee, 0x15a, 0xfa, 0x14, 0xb5, 0x4c, 0x94];
const X86_TH2: Row = [0x183, 0xc8, 0xee, 0x15c, 0xfa, 0x14, 0xb5, 0x4c, 0x94];
const X86_RS1: Row = [0x185, 0xca, 0xf0, 0x15e, 0xfc, 0x14, 0xb7, 0x4c, 0x95];
const X86_RS2: Row = [0x18a, 0xcc, 0xf2, 0x161, 0xfe, 0x14, 0xb8, 0x4c, 0x96];
const X86_RS3: Row = [0x18d, 0xce, 0xf4, 0x164, 0x101, 0x14, 0xb9, 0x4d, 0x97];
const X86_RS5: Row = [0x18d, 0xce, 0xf4, 0x163, 0x101, 0x14, 0xb9, 0x4d, 0x97];
const X86_20H1: Row = [0x18e, 0xce, 0xf4, 0x163, 0x101, 0x14, 0xb9, 0x4d, 0x97];

impl SyscallTable {
    fn from_row(r: Row) -> Self {
        SyscallTable {
            close: r[0],
            protect: r[1],
            open_file: r[2],
            create_section: r[3],
            map_view: r[4],
            unmap_view: r[5],
            query_information_process: r[6],
            set_information_thread: r[7],
            query_virtual_memory: r[8],
        }
    }

    /// Table entry for a known build.
    pub fn for_build(build: u16, arch: SyscallArch) -> Option<Self> {
        use OsBuild::*;

        let b = OsBuild::from_number(build).filter(|b| b.is_known())?;
        let row = match arch {
            SyscallArch::X64 | SyscallArch::Wow64 => match b {
                WindowsXp | Windows2003 | WindowsVista | WindowsVistaSp1 | WindowsVistaSp2
                | Windows7 | Windows7Sp1 => X64_NT6,
                Windows8 => X64_WIN8,
                Windows81 => X64_WIN81,
                _ => X64_WIN10,
            },
            SyscallArch::X86 => match b {
                WindowsXp => X86_XP,
                Windows2003 => X86_2003,
                WindowsVista => X86_VISTA,
                WindowsVistaSp1 | WindowsVistaSp2 => X86_VISTA_SP,
                Windows7 | Windows7Sp1 => X86_WIN7,
                Windows8 => X86_WIN8,
                Windows81 => X86_WIN81,
                Windows10Th1 => X86_TH1,
                Windows10Th2 => X86_TH2,
                Windows10Rs1 => X86_RS1,
                Windows10Rs2 => X86_RS2,
                Windows10Rs3 | Windows10Rs4 => X86_RS3,
                Windows10Rs5 | Windows10_19H1 | Windows10_19H2 => X86_RS5,
                _ => X86_20H1,
            },
        };
        Some(Self::from_row(row))
    }

    pub fn get(&self, call: Syscall) -> u32 {
        match call {
            Syscall::Close => self.close,
            Syscall::ProtectVirtualMemory => self.protect,
            Syscall::OpenFile => self.open_file,
            Syscall::CreateSection => self.create_section,
            Syscall::MapViewOfSection => self.map_view,
            Syscall::UnmapViewOfSection => self.unmap_view,
            Syscall::QueryInformationProcess => self.query_information_process,
            Syscall::SetInformationThread => self.set_information_thread,
            Syscall::QueryVirtualMemory => self.query_virtual_memory,
        }
    }

    pub fn set(&mut self, call: Syscall, value: u32) {
        let slot = match call {
            Syscall::Close => &mut self.close,
            Syscall::ProtectVirtualMemory => &mut self.protect,
            Syscall::OpenFile => &mut self.open_file,
            Syscall::CreateSection => &mut self.create_section,
            Syscall::MapViewOfSection => &mut self.map_view,
            Syscall::UnmapViewOfSection => &mut self.unmap_view,
            Syscall::QueryInformationProcess => &mut self.query_information_process,
            Syscall::SetInformationThread => &mut self.set_information_thread,
            Syscall::QueryVirtualMemory => &mut self.query_virtual_memory,
        };
        *slot = value;
    }

    /// The direct path is usable once `NtClose` is known.
    pub fn is_resolved(&self) -> bool {
        self.close != 0
    }

    /// WOW64 stubs keep argument information in the upper half of the
    /// number they load.
    pub fn truncate_wow64(mut self) -> Self {
        for call in Syscall::ALL {
            self.set(call, self.get(call) & 0xFFFF);
        }
        self
    }

    pub fn wow64_tagged(mut self) -> Self {
        for call in Syscall::ALL {
            self.set(call, self.get(call) | WOW64_FLAG | (call.wow64_tag() << 24));
        }
        self
    }

    /// Fill every number from stub bytes.  `stub` returns the first bytes
    /// of an export, or `None` when it does not exist.
    pub fn from_stubs<'a>(bitness: u32, mut stub: impl FnMut(Syscall) -> Option<&'a [u8]>) -> Self {
        let mut t = SyscallTable::default();
        for call in Syscall::ALL {
            let n = stub(call).and_then(|b| parse_syscall_stub(b, bitness)).unwrap_or(0);
            t.set(call, n);
        }
        t
    }
}

// ---------------------------------------------------------------------------
// Stub parsing
// ---------------------------------------------------------------------------

/// Service number loaded by an ntdll stub: an optional `mov r10, rcx`
/// (64-bit only) followed by `mov eax, imm32`.
pub fn parse_syscall_stub(bytes: &[u8], bitness: u32) -> Option<u32> {
    let mut decoder = Decoder::with_ip(bitness, bytes, 0, DecoderOptions::NONE);
    let mut offset = 0usize;

    if !decoder.can_decode() {
        return None;
    }
    let mut ins = decoder.decode();

    if bitness == 64
        && bytes.len() >= 3
        && bytes[0] == 0x4C
        && bytes[1] == 0x8B
        && ins.mnemonic() == Mnemonic::Mov
        && ins.op0_kind() == OpKind::Register
        && ins.op1_kind() == OpKind::Register
    {
        offset = ins.len();
        if !decoder.can_decode() {
            return None;
        }
        ins = decoder.decode();
    }

    let is_mov_eax_imm = bytes.get(offset) == Some(&0xB8)
        && ins.mnemonic() == Mnemonic::Mov
        && ins.op0_kind() == OpKind::Register
        && ins.op0_register() == Register::EAX
        && ins.op1_kind() == OpKind::Immediate32;
    is_mov_eax_imm.then(|| ins.immediate32())
}

// ---------------------------------------------------------------------------
// Version resource
// ---------------------------------------------------------------------------

fn utf16(s: &str) -> Vec<u16> {
    s.encode_utf16().collect()
}

fn u16_at(data: &[u8], byte_offset: usize) -> Option<u16> {
    data.get(byte_offset..byte_offset + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
}

/// Byte offset just past a `FileVersion\0\0` or `ProductVersion\0` key.
pub fn find_file_version(data: &[u8]) -> Option<usize> {
    let keys = [utf16("FileVersion\0\0"), utf16("ProductVersion\0")];
    let units = data.len() / 2;
    for i in 0..units {
        for key in &keys {
            if i + key.len() > units {
                continue;
            }
            let hit = key
                .iter()
                .enumerate()
                .all(|(k, &c)| u16_at(data, (i + k) * 2) == Some(c));
            if hit {
                return Some((i + key.len()) * 2);
            }
        }
    }
    None
}

/// Third dotted component of the first version string naming a known
/// build; the last one parsed when none does.  0 when no version string
/// is present.
pub fn parse_build_from_version_resource(resource: &[u8]) -> u16 {
    let mut build = 0u16;
    let mut start = 0usize;
    while let Some(found) = resource.get(start..).and_then(find_file_version) {
        let mut pos = start + found;
        build = 0;
        let mut dots = 0;
        while let Some(c) = u16_at(resource, pos).filter(|&c| c != 0) {
            pos += 2;
            if c == u16::from(b'.') {
                dots += 1;
            } else if dots == 2 {
                let mut c = c;
                loop {
                    if !(u16::from(b'0')..=u16::from(b'9')).contains(&c) {
                        break;
                    }
                    build = build.wrapping_mul(10).wrapping_add(c - u16::from(b'0'));
                    match u16_at(resource, pos).filter(|&c| c != 0) {
                        Some(next) => {
                            c = next;
                            pos += 2;
                        }
                        None => break,
                    }
                }
                break;
            }
        }
        if is_known_build(build) {
            break;
        }
        start = pos;
    }
    build
}

/// Build number from the version resource of a mapped ntdll image.
pub fn module_build_number(view: &ImageView<'_>) -> u16 {
    let Some(nt) = NtHeaders::parse(view) else {
        return 0;
    };
    let Some((rva, size)) = nt.data_directory(view, IMAGE_DIRECTORY_ENTRY_RESOURCE) else {
        return 0;
    };
    match view.range(u64::from(rva), size as usize) {
        Ok(resource) => parse_build_from_version_resource(resource),
        Err(_) => 0,
    }
}
