//! Integrity verification over encrypted CRC tables.
//!
//! Three passes share one routine:
//!
//! * loader + header, run before anything is unpacked;
//! * the on-disk file, whose bytes the caller reads through a channel that
//!   does not go through hookable file APIs;
//! * post-relocation memory, whose covered ranges also size the region the
//!   runtime later guards against `NtProtectVirtualMemory`.
//!
//! Tables are `CRC_INFO {Address, Size, Hash}` records scrambled with
//! [`CrcValueCryptor`]; a table hash guards against wholesale replacement.

use log::debug;

use crate::crypto::{crc32, CrcValueCryptor};
use crate::descriptor::TableRef;
use crate::error::ViewError;
use crate::layout::ImageView;

pub const CRC_INFO_SIZE: u32 = 12;
/// `FILE_CRC_INFO {FileSize}` precedes the file records.
pub const FILE_CRC_HEADER_SIZE: u32 = 4;

/// A decrypted `CRC_INFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrcInfo {
    pub address: u32,
    pub size: u32,
    pub hash: u32,
}

impl CrcInfo {
    /// End of the covered range, saturating.
    pub fn end(&self) -> u32 {
        self.address.saturating_add(self.size)
    }
}

/// Result of one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrcReport {
    pub valid: bool,
    /// Highest `Address + Size` among the records.
    pub crc_image_size: u32,
    pub records: usize,
}

/// Decrypt `count` records starting at `offset`, in table order.
pub fn decrypt_records(
    view: &ImageView<'_>,
    offset: u64,
    count: usize,
    seed: u32,
) -> Result<Vec<CrcInfo>, ViewError> {
    let mut cryptor = CrcValueCryptor::new(seed);
    let mut out = Vec::with_capacity(count);
    for k in 0..count as u64 {
        let at = offset + k * u64::from(CRC_INFO_SIZE);
        let address = cryptor.decrypt(view.read_u32(at)?);
        let size = cryptor.decrypt(view.read_u32(at + 4)?);
        let hash = cryptor.decrypt(view.read_u32(at + 8)?);
        out.push(CrcInfo { address, size, hash });
    }
    Ok(out)
}

/// Encrypt records the way the build-time protector lays them out.
pub fn encrypt_records(records: &[CrcInfo], seed: u32) -> Vec<u8> {
    let mut cryptor = CrcValueCryptor::new(seed);
    let mut out = Vec::with_capacity(records.len() * CRC_INFO_SIZE as usize);
    for r in records {
        for v in [r.address, r.size, r.hash] {
            out.extend_from_slice(&cryptor.encrypt(v).to_le_bytes());
        }
    }
    out
}

/// Check every record against `target`.  A range that leaves `target`
/// counts as a mismatch.
fn check_records(target: &[u8], records: &[CrcInfo]) -> (bool, u32) {
    let mut valid = true;
    let mut image_size = 0u32;
    for r in records {
        image_size = image_size.max(r.end());
        let start = r.address as usize;
        let ok = start
            .checked_add(r.size as usize)
            .and_then(|end| target.get(start..end))
            .map_or(false, |bytes| crc32(bytes) == r.hash);
        if !ok {
            debug!("crc mismatch over {:#x}+{:#x}", r.address, r.size);
            valid = false;
        }
    }
    (valid, image_size)
}

/// Verify a table whose own CRC is known.  Used for the loader and memory
/// passes.
pub fn verify_table(
    view: &ImageView<'_>,
    table: TableRef,
    table_hash: u32,
    seed: u32,
) -> Result<CrcReport, ViewError> {
    let raw = view.range(u64::from(table.rva), table.size as usize)?;
    let mut valid = crc32(raw) == table_hash;
    if !valid {
        debug!("crc table at {:#x} does not match its header hash", table.rva);
    }

    let count = (table.size / CRC_INFO_SIZE) as usize;
    let records = decrypt_records(view, u64::from(table.rva), count, seed)?;
    let (records_ok, crc_image_size) = check_records(view.bytes(), &records);
    valid &= records_ok;

    Ok(CrcReport {
        valid,
        crc_image_size,
        records: records.len(),
    })
}

/// Verify the on-disk file.  `table` lives in the image; `file` is the
/// file content read through the independent channel.
pub fn verify_file(
    view: &ImageView<'_>,
    table: TableRef,
    file: &[u8],
    seed: u32,
) -> Result<CrcReport, ViewError> {
    let declared = view.read_u32(u64::from(table.rva))?;
    if (file.len() as u64) < u64::from(declared) {
        debug!("file is shorter than the {:#x} bytes it was protected with", declared);
        return Ok(CrcReport {
            valid: false,
            crc_image_size: 0,
            records: 0,
        });
    }

    let body = table.size.saturating_sub(FILE_CRC_HEADER_SIZE);
    let count = (body / CRC_INFO_SIZE) as usize;
    let records = decrypt_records(
        view,
        u64::from(table.rva) + u64::from(FILE_CRC_HEADER_SIZE),
        count,
        seed,
    )?;
    let (valid, crc_image_size) = check_records(file, &records);
    Ok(CrcReport {
        valid,
        crc_image_size,
        records: records.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::PointerWidth;
    use rand::{RngCore, SeedableRng};
    use rand_chacha::ChaCha20Rng;

    const SEED: u32 = 0x5A17_C0DE;
    const TABLE_AT: usize = 0x800;

    /// Image with random content and a CRC table covering
    /// `[0x100, 0x300)` and `[0x400, 0x480)`.
    fn build_image() -> (Vec<u8>, TableRef, u32) {
        let mut rng = ChaCha20Rng::seed_from_u64(42);
        let mut img = vec![0u8; 0x1000];
        rng.fill_bytes(&mut img[..TABLE_AT]);

        let records = [
            CrcInfo { address: 0x100, size: 0x200, hash: crc32(&img[0x100..0x300]) },
            CrcInfo { address: 0x400, size: 0x80, hash: crc32(&img[0x400..0x480]) },
        ];
        let table = encrypt_records(&records, SEED);
        img[TABLE_AT..TABLE_AT + table.len()].copy_from_slice(&table);
        let table_hash = crc32(&table);
        (img, TableRef::new(TABLE_AT as u32, table.len() as u32), table_hash)
    }

    #[test]
    fn untouched_image_passes() {
        let (img, table, hash) = build_image();
        let v = ImageView::new(&img, 0x1000_0000, PointerWidth::U64);
        let r = verify_table(&v, table, hash, SEED).unwrap();
        assert!(r.valid);
        assert_eq!(r.records, 2);
        assert_eq!(r.crc_image_size, 0x480);
    }

    #[test]
    fn mutation_inside_range_fails() {
        let (mut img, table, hash) = build_image();
        img[0x2FF] ^= 1;
        let v = ImageView::new(&img, 0, PointerWidth::U64);
        assert!(!verify_table(&v, table, hash, SEED).unwrap().valid);
    }

    #[test]
    fn mutation_outside_ranges_passes() {
        let (mut img, table, hash) = build_image();
        img[0x300] ^= 0xFF;
        img[0x0FF] ^= 0xFF;
        img[0x700] ^= 0xFF;
        let v = ImageView::new(&img, 0, PointerWidth::U64);
        assert!(verify_table(&v, table, hash, SEED).unwrap().valid);
    }

    #[test]
    fn forged_table_fails_on_header_hash() {
        let (img, table, hash) = build_image();
        // Shorten the table to its first record: that range still matches,
        // only the table hash gives the forgery away.
        let v = ImageView::new(&img, 0, PointerWidth::U64);
        let short = TableRef::new(table.rva, CRC_INFO_SIZE);
        let r = verify_table(&v, short, hash, SEED).unwrap();
        assert_eq!(r.records, 1);
        assert!(!r.valid);
        assert!(verify_table(&v, short, crc32(&img[TABLE_AT..TABLE_AT + 12]), SEED).unwrap().valid);
    }

    #[test]
    fn wrong_seed_fails() {
        let (img, table, hash) = build_image();
        let v = ImageView::new(&img, 0, PointerWidth::U64);
        assert!(!verify_table(&v, table, hash, SEED ^ 1).unwrap().valid);
    }

    #[test]
    fn table_outside_view_is_an_error() {
        let (img, _, hash) = build_image();
        let v = ImageView::new(&img, 0, PointerWidth::U64);
        assert!(verify_table(&v, TableRef::new(0xFF8, 24), hash, SEED).is_err());
    }

    #[test]
    fn file_pass_reads_the_file_not_the_image() {
        let mut rng = ChaCha20Rng::seed_from_u64(9);
        let mut file = vec![0u8; 0x600];
        rng.fill_bytes(&mut file);

        let records = [CrcInfo { address: 0x200, size: 0x100, hash: crc32(&file[0x200..0x300]) }];
        let mut table = (file.len() as u32).to_le_bytes().to_vec();
        table.extend(encrypt_records(&records, SEED));

        let mut img = vec![0u8; 0x100];
        img[0x10..0x10 + table.len()].copy_from_slice(&table);
        let tref = TableRef::new(0x10, table.len() as u32);
        let v = ImageView::new(&img, 0, PointerWidth::U32);

        assert!(verify_file(&v, tref, &file, SEED).unwrap().valid);

        let mut patched = file.clone();
        patched[0x250] ^= 0x80;
        assert!(!verify_file(&v, tref, &patched, SEED).unwrap().valid);

        let truncated = &file[..0x5FF];
        let r = verify_file(&v, tref, truncated, SEED).unwrap();
        assert!(!r.valid);
        assert_eq!(r.records, 0);
    }
}
