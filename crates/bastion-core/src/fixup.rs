//! Base relocation and explicit relocation records.
//!
//! `FIXUP_INFO` blocks carry `delta_base` adjustments whose encoding depends
//! on the container format.  `RELOCATION_INFO` records cover the cases a
//! plain delta cannot express: indirect functions, PC-relative slots, and
//! displacements against freshly resolved import slots.
//!
//! Fixups are not idempotent.  The caller applies them once per load and only
//! when the delta is non-zero.

use log::debug;

use crate::descriptor::{fixup_blocks, read_table, IatInfo, RelocationInfo, TableRef};
use crate::error::ViewError;
use crate::layout::{ImageViewMut, PointerWidth};

/// Container format the tables were generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFlavor {
    Pe,
    Elf,
    MachO,
}

impl ImageFlavor {
    pub const fn native() -> Self {
        if cfg!(target_os = "macos") {
            ImageFlavor::MachO
        } else if cfg!(unix) {
            ImageFlavor::Elf
        } else {
            ImageFlavor::Pe
        }
    }
}

// PE base relocation types.
pub const IMAGE_REL_BASED_HIGH: u8 = 1;
pub const IMAGE_REL_BASED_LOW: u8 = 2;
pub const IMAGE_REL_BASED_HIGHLOW: u8 = 3;
pub const IMAGE_REL_BASED_DIR64: u8 = 10;
// ELF
pub const R_386_RELATIVE: u8 = 8;
// Mach-O rebase opcodes.
pub const REBASE_TYPE_POINTER: u8 = 1;
pub const REBASE_TYPE_TEXT_ABSOLUTE32: u8 = 2;

/// Calls an indirect-function resolver inside the image and returns its
/// result.  Only the platform layer can do this.
pub trait IndirectResolver {
    fn resolve(&mut self, function: u64) -> u64;
}

fn add_ptr(image: &mut ImageViewMut<'_>, offset: u64, delta: u64) -> Result<(), ViewError> {
    let v = image.view().read_ptr(offset)?;
    image.write_ptr(offset, v.wrapping_add(delta))
}

/// Apply every `FIXUP_INFO` block with `delta`.  Returns the number of
/// entries that patched something.
pub fn apply_fixups(
    image: &mut ImageViewMut<'_>,
    table: TableRef,
    delta: u64,
    flavor: ImageFlavor,
) -> Result<usize, ViewError> {
    let blocks = fixup_blocks(&image.view(), table)?;
    let mut patched = 0;
    for block in &blocks {
        for (kind, rva) in block.items() {
            let at = u64::from(rva);
            let hit = match (flavor, kind) {
                (ImageFlavor::Pe, IMAGE_REL_BASED_HIGHLOW) => {
                    let v = image.view().read_u32(at)?;
                    image.write_u32(at, v.wrapping_add(delta as u32))?;
                    true
                }
                (ImageFlavor::Pe, IMAGE_REL_BASED_DIR64) => {
                    let v = image.view().read_u64(at)?;
                    image.write_u64(at, v.wrapping_add(delta))?;
                    true
                }
                (ImageFlavor::Pe, IMAGE_REL_BASED_HIGH) => {
                    let v = image.view().read_u16(at)?;
                    image.write_u16(at, v.wrapping_add((delta >> 16) as u16))?;
                    true
                }
                (ImageFlavor::Pe, IMAGE_REL_BASED_LOW) => {
                    let v = image.view().read_u16(at)?;
                    image.write_u16(at, v.wrapping_add(delta as u16))?;
                    true
                }
                (ImageFlavor::Elf, R_386_RELATIVE)
                | (ImageFlavor::MachO, REBASE_TYPE_POINTER | REBASE_TYPE_TEXT_ABSOLUTE32) => {
                    add_ptr(image, at, delta)?;
                    true
                }
                // Padding entries (type 0) and anything foreign.
                _ => false,
            };
            patched += usize::from(hit);
        }
    }
    debug!("applied {} fixups in {} blocks", patched, blocks.len());
    Ok(patched)
}

/// Raw copies described by `IAT_INFO`.
pub fn copy_iat(image: &mut ImageViewMut<'_>, table: TableRef) -> Result<(), ViewError> {
    let records = read_table::<IatInfo>(&image.view(), table)?;
    for r in records {
        image.copy_within(u64::from(r.src), u64::from(r.dst), r.size as usize)?;
    }
    Ok(())
}

/// Read a sign-extended value of `bytes` width.
fn read_signed(image: &ImageViewMut<'_>, at: u64, bytes: usize) -> Result<u64, ViewError> {
    let v = image.view();
    Ok(match bytes {
        1 => v.read_u8(at)? as i8 as i64 as u64,
        2 => v.read_u16(at)? as i16 as i64 as u64,
        4 => v.read_u32(at)? as i32 as i64 as u64,
        _ => v.read_u64(at)?,
    })
}

fn write_truncated(image: &mut ImageViewMut<'_>, at: u64, bytes: usize, value: u64) -> Result<(), ViewError> {
    match bytes {
        1 => image.write_bytes(at, &[value as u8]),
        2 => image.write_u16(at, value as u16),
        4 => image.write_u32(at, value as u32),
        _ => image.write_u64(at, value),
    }
}

/// Apply `RELOCATION_INFO` records in table order.
///
/// On unix images type 0 is `IRELATIVE` (the slot receives the result of
/// calling `source`) and type 1 is `PC32`.  On PE images type 0 adds the raw
/// `Source` field to a pointer, and types 1 to 4 rebase a 1/2/4/8-byte
/// displacement from `source` onto the pointer currently stored there.
pub fn apply_relocations(
    image: &mut ImageViewMut<'_>,
    table: TableRef,
    flavor: ImageFlavor,
    indirect: &mut dyn IndirectResolver,
) -> Result<usize, ViewError> {
    let records = read_table::<RelocationInfo>(&image.view(), table)?;
    let width = image.width();
    for r in &records {
        let at = u64::from(r.address);
        let address = image.view().address_of(at);
        let source = image.view().address_of(u64::from(r.source));

        match flavor {
            ImageFlavor::Elf | ImageFlavor::MachO => match r.kind {
                0 => {
                    let value = indirect.resolve(source);
                    image.write_ptr(at, value)?;
                }
                1 => {
                    let cur = image.view().read_u32(at)?;
                    let src = image.view().read_u32(u64::from(r.source))?;
                    image.write_u32(at, cur.wrapping_add(src.wrapping_sub(address as u32)))?;
                }
                _ => {}
            },
            ImageFlavor::Pe => {
                if r.kind == 0 {
                    add_ptr(image, at, u64::from(r.source))?;
                    continue;
                }
                let bytes = match (r.kind, width) {
                    (1, _) => 1,
                    (2, _) => 2,
                    (3, _) => 4,
                    (4, PointerWidth::U64) => 8,
                    _ => continue,
                };
                let target = image.view().read_ptr(u64::from(r.source))?;
                let data = read_signed(image, at, bytes)?
                    .wrapping_sub(source)
                    .wrapping_add(target);
                write_truncated(image, at, bytes, width.mask(data))?;
            }
        }
    }
    Ok(records.len())
}
