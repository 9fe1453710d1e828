//! Page protection arithmetic for the two protection passes.
//!
//! `SECTION_INFO::Type` carries `IMAGE_SCN_MEM_*` bits on Windows images
//! and `PROT_*` bits on POSIX images.  The first pass opens every section
//! for writing; the second puts the final protection back.

use crate::detect::HostFamily;

pub const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
pub const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;
pub const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;

pub const PAGE_NOACCESS: u32 = 0x01;
pub const PAGE_READONLY: u32 = 0x02;
pub const PAGE_READWRITE: u32 = 0x04;
pub const PAGE_EXECUTE_READWRITE: u32 = 0x40;
pub const PAGE_GUARD: u32 = 0x100;

pub const PROT_READ: u32 = 0x1;
pub const PROT_WRITE: u32 = 0x2;
pub const PROT_EXEC: u32 = 0x4;

/// Protection used while the loader patches a section.
pub fn writable_protection(kind: u32, host: HostFamily) -> u32 {
    match host {
        HostFamily::Windows => {
            if kind & IMAGE_SCN_MEM_EXECUTE != 0 {
                PAGE_EXECUTE_READWRITE
            } else {
                PAGE_READWRITE
            }
        }
        HostFamily::Unix => {
            let mut p = PROT_READ | PROT_WRITE;
            if kind & PROT_EXEC != 0 {
                p |= PROT_EXEC;
            }
            p
        }
    }
}

/// Protection a section ends up with.  On Windows the `PAGE_EXECUTE_*`
/// constants are the data constants shifted left by four.
pub fn final_protection(kind: u32, host: HostFamily) -> u32 {
    match host {
        HostFamily::Windows => {
            let mut p = if kind & IMAGE_SCN_MEM_READ != 0 {
                if kind & IMAGE_SCN_MEM_WRITE != 0 {
                    PAGE_READWRITE
                } else {
                    PAGE_READONLY
                }
            } else {
                PAGE_NOACCESS
            };
            if kind & IMAGE_SCN_MEM_EXECUTE != 0 {
                p <<= 4;
            }
            p
        }
        HostFamily::Unix => kind & (PROT_READ | PROT_WRITE | PROT_EXEC),
    }
}

/// Which pass a previous protection was observed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectPass {
    MakeWritable,
    Restore,
}

/// A page the loader itself never marks guard or no-access was found
/// that way: someone set a memory breakpoint.
pub fn old_protection_is_trap(old: u32, pass: ProtectPass) -> bool {
    match pass {
        ProtectPass::MakeWritable => old & PAGE_GUARD != 0,
        ProtectPass::Restore => old & (PAGE_NOACCESS | PAGE_GUARD) != 0,
    }
}
