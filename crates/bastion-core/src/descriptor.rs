//! Descriptor table reader.
//!
//! The build-time protector burns a fixed set of constants into the loader:
//! image-relative offsets and sizes of every metadata table plus the option
//! word.  [`Descriptor`] carries them and resolves the few that are indirect
//! (stored in the image rather than in the loader).  Nothing here validates
//! content; that is the integrity verifier's job.  A table with size 0 is
//! absent and every consumer skips it.

use bitflags::bitflags;

use crate::error::ViewError;
use crate::layout::ImageView;
use crate::message::MessageKind;

bitflags! {
    /// Option word burned into the loader.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LoaderOptions: u32 {
        /// Integrity mismatches are fatal instead of recorded.
        const CHECK_PATCH = 0x1;
        /// Debugger findings are fatal instead of recorded.
        const CHECK_DEBUGGER = 0x2;
        const CHECK_KERNEL_DEBUGGER = 0x4;
        /// Terminate the process when teardown follows a failed setup.
        const EXIT_PROCESS = 0x8;
        const CHECK_VIRTUAL_MACHINE = 0x10;
    }
}

impl Default for LoaderOptions {
    fn default() -> Self {
        LoaderOptions::empty()
    }
}

/// Offset and byte size of a table inside the image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableRef {
    pub rva: u32,
    pub size: u32,
}

impl TableRef {
    pub const fn new(rva: u32, size: u32) -> Self {
        TableRef { rva, size }
    }

    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// Offsets of the encrypted message templates.  Zero means "no message".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageTemplates {
    pub initialization_error: u32,
    pub proc_not_found: u32,
    pub ordinal_not_found: u32,
    pub file_corrupted: u32,
    pub debugger_found: u32,
    pub virtual_machine_found: u32,
    pub unregistered_version: u32,
}

impl MessageTemplates {
    pub fn rva(&self, kind: MessageKind) -> u32 {
        match kind {
            MessageKind::InitializationError => self.initialization_error,
            MessageKind::ProcNotFound => self.proc_not_found,
            MessageKind::OrdinalNotFound => self.ordinal_not_found,
            MessageKind::FileCorrupted => self.file_corrupted,
            MessageKind::DebuggerFound => self.debugger_found,
            MessageKind::VirtualMachineFound => self.virtual_machine_found,
            MessageKind::UnregisteredVersion => self.unregistered_version,
        }
    }
}

/// The burned-in constants of one protected image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Descriptor {
    /// Link-time base the tables were generated against.
    pub file_base: u64,
    /// Base the image actually occupies.
    pub image_base: u64,
    pub options: LoaderOptions,
    pub string_key: u32,
    /// Seed of the CRC table keystream.
    pub crc_salt: u32,
    /// Offset of the pointer-sized slot that publishes `GlobalData`.
    pub storage: u32,
    /// Offset of the wrapped module's entry point, 0 if none.
    pub runtime_entry: u32,
    /// Offset of the TLS index slot preserved across unpacking, 0 if none.
    pub tls_index_info: u32,
    /// Offset of a single `SECTION_INFO` applied after restoring
    /// protections (unix only), 0 if none.
    pub relro_info: u32,

    pub file_crc_info: u32,
    /// Offset of the `u32` holding the file CRC table size.
    pub file_crc_info_size: u32,
    pub loader_crc_info: u32,
    /// Offset of the `u32` holding the loader CRC table size.
    pub loader_crc_info_size: u32,
    /// Offset of the `u32` holding the loader CRC table hash.
    pub loader_crc_info_hash: u32,

    pub section_info: TableRef,
    pub packer_info: TableRef,
    pub fixup_info: TableRef,
    pub relocation_info: TableRef,
    pub iat_info: TableRef,
    pub import_info: TableRef,
    pub internal_import_info: TableRef,
    pub delay_import_info: TableRef,
    pub memory_crc_info: TableRef,
    pub memory_crc_info_hash: u32,

    pub messages: MessageTemplates,
}

impl Descriptor {
    /// `image_base - file_base`, as a wrapping two's-complement delta.
    pub fn delta_base(&self) -> u64 {
        self.image_base.wrapping_sub(self.file_base)
    }

    fn indirect(view: &ImageView<'_>, slot: u32) -> u32 {
        if slot == 0 {
            return 0;
        }
        view.read_u32(u64::from(slot)).unwrap_or(0)
    }

    pub fn loader_crc(&self, view: &ImageView<'_>) -> TableRef {
        TableRef::new(
            self.loader_crc_info,
            Self::indirect(view, self.loader_crc_info_size),
        )
    }

    pub fn loader_crc_hash(&self, view: &ImageView<'_>) -> u32 {
        Self::indirect(view, self.loader_crc_info_hash)
    }

    pub fn file_crc(&self, view: &ImageView<'_>) -> TableRef {
        TableRef::new(
            self.file_crc_info,
            Self::indirect(view, self.file_crc_info_size),
        )
    }
}

// ---------------------------------------------------------------------------
// Wire records
// ---------------------------------------------------------------------------

/// A fixed-size little-endian record.
pub trait Record: Sized {
    const SIZE: u32;
    fn read(view: &ImageView<'_>, offset: u64) -> Result<Self, ViewError>;
}

/// Decode every record of a table in order.
pub fn read_table<T: Record>(view: &ImageView<'_>, table: TableRef) -> Result<Vec<T>, ViewError> {
    let mut out = Vec::with_capacity((table.size / T::SIZE) as usize);
    let mut i = 0u64;
    while i < u64::from(table.size) {
        out.push(T::read(view, u64::from(table.rva) + i)?);
        i += u64::from(T::SIZE);
    }
    Ok(out)
}

/// `SECTION_INFO`: a page range and its protection flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionInfo {
    pub address: u32,
    pub size: u32,
    pub kind: u32,
}

impl Record for SectionInfo {
    const SIZE: u32 = 12;
    fn read(view: &ImageView<'_>, offset: u64) -> Result<Self, ViewError> {
        Ok(SectionInfo {
            address: view.read_u32(offset)?,
            size: view.read_u32(offset + 4)?,
            kind: view.read_u32(offset + 8)?,
        })
    }
}

/// `PACKER_INFO`: one compressed unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackerInfo {
    pub src: u32,
    pub dst: u32,
}

impl Record for PackerInfo {
    const SIZE: u32 = 8;
    fn read(view: &ImageView<'_>, offset: u64) -> Result<Self, ViewError> {
        Ok(PackerInfo {
            src: view.read_u32(offset)?,
            dst: view.read_u32(offset + 4)?,
        })
    }
}

/// `IAT_INFO`: raw copy of `size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IatInfo {
    pub src: u32,
    pub dst: u32,
    pub size: u32,
}

impl Record for IatInfo {
    const SIZE: u32 = 12;
    fn read(view: &ImageView<'_>, offset: u64) -> Result<Self, ViewError> {
        Ok(IatInfo {
            src: view.read_u32(offset)?,
            dst: view.read_u32(offset + 4)?,
            size: view.read_u32(offset + 8)?,
        })
    }
}

/// `RELOCATION_INFO`: explicit relocation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocationInfo {
    pub address: u32,
    pub source: u32,
    pub kind: u32,
}

impl Record for RelocationInfo {
    const SIZE: u32 = 12;
    fn read(view: &ImageView<'_>, offset: u64) -> Result<Self, ViewError> {
        Ok(RelocationInfo {
            address: view.read_u32(offset)?,
            source: view.read_u32(offset + 4)?,
            kind: view.read_u32(offset + 8)?,
        })
    }
}

/// Split the packer table into its properties record and the units.
pub fn packer_units(view: &ImageView<'_>, table: TableRef) -> Result<(PackerInfo, Vec<PackerInfo>), ViewError> {
    let mut all = read_table::<PackerInfo>(view, table)?;
    if all.is_empty() {
        return Err(ViewError {
            offset: u64::from(table.rva),
            len: PackerInfo::SIZE as usize,
            size: view.len(),
        });
    }
    let props = all.remove(0);
    Ok((props, all))
}

// ---------------------------------------------------------------------------
// Imports
// ---------------------------------------------------------------------------

/// Set on `IMPORT_INFO::Name` when the import is by ordinal.
pub const IMPORT_ORDINAL_FLAG: u32 = 0x8000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportName {
    Ordinal(u16),
    /// Offset of an encrypted, NUL-terminated name.
    Encrypted(u32),
}

/// `IMPORT_INFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportInfo {
    pub name: u32,
    pub address: u32,
    /// Obfuscation addend removed from the stored address.
    pub key: i32,
}

impl ImportInfo {
    pub fn target(&self) -> ImportName {
        if self.name & IMPORT_ORDINAL_FLAG != 0 {
            ImportName::Ordinal(self.name as u16)
        } else {
            ImportName::Encrypted(self.name)
        }
    }
}

/// Internal-import tables are a flat run of `IMPORT_INFO` whose `name` is an
/// image offset rather than a procedure name.
impl Record for ImportInfo {
    const SIZE: u32 = 12;
    fn read(view: &ImageView<'_>, offset: u64) -> Result<Self, ViewError> {
        Ok(ImportInfo {
            name: view.read_u32(offset)?,
            address: view.read_u32(offset + 4)?,
            key: view.read_u32(offset + 8)? as i32,
        })
    }
}

/// One `DLL_INFO` with its imports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DllImports {
    /// Offset of the encrypted module name.
    pub name: u32,
    pub imports: Vec<ImportInfo>,
}

/// Walk a `DLL_INFO` table.  Each module is a 4-byte name, a run of
/// 12-byte `IMPORT_INFO` records, then a 4-byte zero terminator.
pub fn import_dlls(view: &ImageView<'_>, table: TableRef) -> Result<Vec<DllImports>, ViewError> {
    let base = u64::from(table.rva);
    let mut out = Vec::new();
    let mut i = 0u64;
    while i < u64::from(table.size) {
        let name = view.read_u32(base + i)?;
        i += 4;
        let mut imports = Vec::new();
        loop {
            let entry = view.read_u32(base + i)?;
            if entry == 0 {
                break;
            }
            imports.push(ImportInfo {
                name: entry,
                address: view.read_u32(base + i + 4)?,
                key: view.read_u32(base + i + 8)? as i32,
            });
            i += 12;
        }
        i += 4;
        out.push(DllImports { name, imports });
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Fixups
// ---------------------------------------------------------------------------

/// `FIXUP_INFO` header plus its packed entries: the type sits in the low
/// nibble, the page offset in the upper 12 bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixupBlock {
    pub address: u32,
    pub entries: Vec<u16>,
}

impl FixupBlock {
    pub fn items(&self) -> impl Iterator<Item = (u8, u32)> + '_ {
        self.entries
            .iter()
            .map(move |&e| ((e & 0x0F) as u8, self.address.wrapping_add(u32::from(e >> 4))))
    }
}

pub fn fixup_blocks(view: &ImageView<'_>, table: TableRef) -> Result<Vec<FixupBlock>, ViewError> {
    let base = u64::from(table.rva);
    let mut out = Vec::new();
    let mut i = 0u64;
    while i < u64::from(table.size) {
        let address = view.read_u32(base + i)?;
        let block_size = view.read_u32(base + i + 4)?;
        if block_size < 8 {
            break;
        }
        let count = (block_size - 8) / 2;
        let mut entries = Vec::with_capacity(count as usize);
        for j in 0..u64::from(count) {
            entries.push(view.read_u16(base + i + 8 + j * 2)?);
        }
        out.push(FixupBlock { address, entries });
        i += u64::from(block_size);
    }
    Ok(out)
}
