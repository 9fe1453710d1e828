//! Static, internal and delay import resolution.
//!
//! Every import slot receives `address - Key`; the protected code adds the
//! key back at the call site, so a dumped image never shows real targets.

use log::debug;

use bastion_core::crypto::StringCipher;
use bastion_core::descriptor::{import_dlls, read_table, ImportInfo, ImportName, TableRef};
use bastion_core::pe::{get_proc_address, MAX_PATH};
use bastion_core::{ImageViewMut, LoaderError, ProcName, ViewError};

use crate::platform::{Platform, ProcessInfo};

/// `SEM_FAILCRITICALERRORS`: the process asked for no error dialogs.
pub const SEM_FAILCRITICALERRORS: u64 = 0x1;

fn keyed(address: u64, key: i32) -> u64 {
    address.wrapping_sub(key as i64 as u64)
}

fn decrypt_name(cipher: &StringCipher, encrypted: &[u8]) -> Vec<u8> {
    cipher.decrypt(encrypted, MAX_PATH).unwrap_or_default()
}

/// Module handle for an encrypted module name: already loaded, else loaded
/// now.
fn module_base<P: Platform + ?Sized>(platform: &mut P, name: &[u8]) -> Option<u64> {
    platform.find_loaded(name).or_else(|| platform.load(name))
}

/// Build the fatal error for a failed lookup, honouring the hard-error mode.
fn not_found<P: Platform + ?Sized>(
    platform: &mut P,
    image: &ImageViewMut<'_>,
    cipher: &StringCipher,
    import: &ImportInfo,
    dll: &[u8],
) -> LoaderError {
    let mode = platform.query_process(ProcessInfo::DefaultHardErrorMode);
    if mode.value & SEM_FAILCRITICALERRORS != 0 {
        return LoaderError::SilentImportFailure;
    }
    let dll = String::from_utf8_lossy(dll).into_owned();
    match import.target() {
        ImportName::Ordinal(ordinal) => LoaderError::OrdinalNotFound { ordinal, dll },
        ImportName::Encrypted(offset) => {
            let api = image
                .view()
                .tail(u64::from(offset))
                .map(|enc| decrypt_name(cipher, enc))
                .unwrap_or_default();
            LoaderError::ProcNotFound {
                api: String::from_utf8_lossy(&api).into_owned(),
                dll,
            }
        }
    }
}

/// Address of one import in the module at `base`.
fn lookup<P: Platform + ?Sized>(
    platform: &mut P,
    image: &ImageViewMut<'_>,
    base: u64,
    import: &ImportInfo,
    cipher: &StringCipher,
) -> Result<Option<u64>, ViewError> {
    let view = image.view();
    let name = match import.target() {
        ImportName::Ordinal(o) => ProcName::Ordinal(o),
        ImportName::Encrypted(offset) => ProcName::Encrypted(view.tail(u64::from(offset))?),
    };
    if platform.image(base).is_some() {
        return Ok(get_proc_address(platform, base, name, cipher));
    }
    // No export directory to walk (ELF, Mach-O): ask the OS.
    Ok(match name {
        ProcName::Encrypted(enc) => {
            let plain = decrypt_name(cipher, enc);
            platform.native_get_proc_address(base, ProcName::Plain(&plain))
        }
        other => platform.native_get_proc_address(base, other),
    })
}

/// Resolve a `DLL_INFO` table and fill its slots.  Static and delay imports
/// share this walk.
pub fn resolve_module_imports<P: Platform + ?Sized>(
    platform: &mut P,
    image: &mut ImageViewMut<'_>,
    table: TableRef,
    cipher: &StringCipher,
) -> Result<usize, LoaderError> {
    if table.is_empty() {
        return Ok(0);
    }
    let dlls = import_dlls(&image.view(), table)?;
    let mut filled = 0;
    for dll in &dlls {
        let dll_name = decrypt_name(cipher, image.view().tail(u64::from(dll.name))?);
        let base = module_base(platform, &dll_name);

        for import in &dll.imports {
            let resolved = match base {
                Some(base) => lookup(platform, image, base, import, cipher)?,
                None => None,
            };
            let Some(address) = resolved else {
                return Err(not_found(platform, image, cipher, import, &dll_name));
            };
            image.write_ptr(u64::from(import.address), keyed(address, import.key))?;
            filled += 1;
        }
    }
    debug!("filled {} import slots from {} modules", filled, dlls.len());
    Ok(filled)
}

/// Internal imports point back into the image itself.
pub fn resolve_internal_imports(image: &mut ImageViewMut<'_>, table: TableRef) -> Result<usize, LoaderError> {
    let records = read_table::<ImportInfo>(&image.view(), table)?;
    for r in &records {
        let target = image.view().address_of(u64::from(r.name));
        image.write_ptr(u64::from(r.address), keyed(target, r.key))?;
    }
    Ok(records.len())
}

/// Base of a loaded module whose file name matches `encrypted`, ignoring
/// case.  Never loads anything.
pub fn loader_get_module_handle<P: Platform + ?Sized>(
    platform: &mut P,
    encrypted: &[u8],
    cipher: &StringCipher,
) -> Option<u64> {
    platform
        .loaded_modules()
        .into_iter()
        .find(|(name, _)| cipher.compare_module(encrypted, name).is_eq())
        .map(|(_, base)| base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_core::PointerWidth;

    #[test]
    fn key_is_subtracted_with_sign() {
        assert_eq!(keyed(0x1000, 0x10), 0xFF0);
        assert_eq!(keyed(0x1000, -0x10), 0x1010);
    }

    #[test]
    fn internal_imports_point_into_the_image() {
        let mut bytes = vec![0u8; 0x100];
        let record: Vec<u8> = [0x80u32, 0x40, 8].iter().flat_map(|v| v.to_le_bytes()).collect();
        bytes[0x10..0x1C].copy_from_slice(&record);
        let mut image = ImageViewMut::new(&mut bytes, 0x40_0000, PointerWidth::U32);

        let n = resolve_internal_imports(&mut image, TableRef::new(0x10, 12)).unwrap();
        assert_eq!(n, 1);
        assert_eq!(image.view().read_u32(0x40).unwrap(), 0x40_0080 - 8);
    }

    #[test]
    fn empty_module_table_fills_nothing() {
        let mut bytes = vec![0u8; 0x20];
        let image = ImageViewMut::new(&mut bytes, 0, PointerWidth::U64);
        assert_eq!(import_dlls(&image.view(), TableRef::default()).unwrap().len(), 0);
    }

    struct Modules(Vec<(Vec<u8>, u64)>);

    impl bastion_core::ModuleResolver for Modules {
        fn image(&self, _base: u64) -> Option<bastion_core::ImageView<'_>> {
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

    impl Platform for Modules {
        fn loaded_modules(&mut self) -> Vec<(Vec<u8>, u64)> {
            self.0.clone()
        }
        fn show_message(&mut self, _message: &bastion_core::Message) {}
        fn exit_process(&mut self, _code: u32) {}
    }

    #[test]
    fn module_handle_ignores_case() {
        let cipher = StringCipher::new(0x1234_5678);
        let mut platform = Modules(vec![(b"ntdll.dll".to_vec(), 0x7FF0_0000), (b"KERNEL32.DLL".to_vec(), 0x7FE0_0000)]);

        let wanted = cipher.encrypt(b"kernel32.dll");
        assert_eq!(loader_get_module_handle(&mut platform, &wanted, &cipher), Some(0x7FE0_0000));

        let missing = cipher.encrypt(b"user32.dll");
        assert_eq!(loader_get_module_handle(&mut platform, &missing, &cipher), None);
    }
}
