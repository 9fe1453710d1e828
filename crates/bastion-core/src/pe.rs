//! Export walking over loaded PE modules.
//!
//! This is the loader's own `GetProcAddress`: it reads the export directory
//! through an [`ImageView`], looks names up with an on-the-fly decrypting
//! comparison, and follows forwarders through a [`ModuleResolver`].  Nothing
//! here calls the OS; the resolver is the only way out.

use std::cmp::Ordering;
use std::collections::HashSet;

use log::debug;

use crate::crypto::StringCipher;
use crate::layout::ImageView;

// ---------------------------------------------------------------------------
// Well-known constants
// ---------------------------------------------------------------------------

/// `MZ` -- DOS header magic.
pub const DOS_MAGIC: u16 = 0x5A4D;
/// `PE\0\0` -- PE signature.
pub const PE_SIGNATURE: u32 = 0x0000_4550;
pub const PE32_MAGIC: u16 = 0x010B;
pub const PE32PLUS_MAGIC: u16 = 0x020B;

pub const IMAGE_DIRECTORY_ENTRY_EXPORT: usize = 0;
pub const IMAGE_DIRECTORY_ENTRY_RESOURCE: usize = 2;

/// Longest module name a forwarder may carry.
pub const MAX_PATH: usize = 260;
/// Forwarder chains longer than this are treated as unresolvable.
pub const MAX_FORWARD_DEPTH: usize = 16;

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

/// The few NT header fields the loader needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NtHeaders {
    pub e_lfanew: u32,
    pub magic: u16,
    pub size_of_image: u32,
    data_directories: u64,
    number_of_rva_and_sizes: u32,
}

impl NtHeaders {
    /// Validate `MZ` and `PE\0\0` and locate the data directories.
    pub fn parse(view: &ImageView<'_>) -> Option<Self> {
        if view.read_u16(0).ok()? != DOS_MAGIC {
            return None;
        }
        let e_lfanew = view.read_u32(0x3C).ok()?;
        let nt = u64::from(e_lfanew);
        if view.read_u32(nt).ok()? != PE_SIGNATURE {
            return None;
        }
        let opt = nt + 24;
        let magic = view.read_u16(opt).ok()?;
        let (count_at, dirs_at) = match magic {
            PE32_MAGIC => (opt + 92, opt + 96),
            PE32PLUS_MAGIC => (opt + 108, opt + 112),
            _ => return None,
        };
        Some(NtHeaders {
            e_lfanew,
            magic,
            size_of_image: view.read_u32(opt + 56).ok()?,
            data_directories: dirs_at,
            number_of_rva_and_sizes: view.read_u32(count_at).ok()?,
        })
    }

    /// `(VirtualAddress, Size)` of a data directory; `None` when absent.
    pub fn data_directory(&self, view: &ImageView<'_>, index: usize) -> Option<(u32, u32)> {
        if index as u32 >= self.number_of_rva_and_sizes {
            return None;
        }
        let at = self.data_directories + index as u64 * 8;
        let rva = view.read_u32(at).ok()?;
        let size = view.read_u32(at + 4).ok()?;
        (rva != 0).then_some((rva, size))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExportDirectory {
    rva: u32,
    size: u32,
    base: u32,
    number_of_functions: u32,
    number_of_names: u32,
    address_of_functions: u32,
    address_of_names: u32,
    address_of_name_ordinals: u32,
}

impl ExportDirectory {
    fn parse(view: &ImageView<'_>) -> Option<Self> {
        let nt = NtHeaders::parse(view)?;
        let (rva, size) = nt.data_directory(view, IMAGE_DIRECTORY_ENTRY_EXPORT)?;
        let at = u64::from(rva);
        Some(ExportDirectory {
            rva,
            size,
            base: view.read_u32(at + 16).ok()?,
            number_of_functions: view.read_u32(at + 20).ok()?,
            number_of_names: view.read_u32(at + 24).ok()?,
            address_of_functions: view.read_u32(at + 28).ok()?,
            address_of_names: view.read_u32(at + 32).ok()?,
            address_of_name_ordinals: view.read_u32(at + 36).ok()?,
        })
    }

    fn contains(&self, rva: u32) -> bool {
        rva >= self.rva && u64::from(rva) < u64::from(self.rva) + u64::from(self.size)
    }
}

// ---------------------------------------------------------------------------
// Lookup
// ---------------------------------------------------------------------------

/// How a procedure is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcName<'a> {
    Ordinal(u16),
    Plain(&'a [u8]),
    /// Encrypted with the image's string cipher, terminator included.
    Encrypted(&'a [u8]),
}

impl ProcName<'_> {
    fn compare(&self, cipher: &StringCipher, exported: &[u8]) -> Ordering {
        match *self {
            ProcName::Plain(name) => {
                crate::crypto::string::compare_by(|i| name.get(i).copied().unwrap_or(0), exported)
            }
            ProcName::Encrypted(name) => cipher.compare(name, exported),
            ProcName::Ordinal(_) => Ordering::Less,
        }
    }
}

/// Module lookups the export walker cannot do on its own.
pub trait ModuleResolver {
    /// Image of a loaded module, by base address.
    fn image(&self, base: u64) -> Option<ImageView<'_>>;
    /// Base of an already-loaded module, by plain name.
    fn find_loaded(&self, name: &[u8]) -> Option<u64>;
    /// Load a module by plain name.
    fn load(&mut self, name: &[u8]) -> Option<u64>;
    /// The OS's own lookup, used when a module forwards to itself.  `name`
    /// is never [`ProcName::Encrypted`].
    fn native_get_proc_address(&mut self, base: u64, name: ProcName<'_>) -> Option<u64>;
}

enum ForwardProc {
    Name(Vec<u8>),
    Ordinal(u16),
}

enum Export {
    Address(u64),
    Forward {
        index: u32,
        module: Vec<u8>,
        proc: ForwardProc,
    },
}

fn find_name_index(view: &ImageView<'_>, dir: &ExportDirectory, name: &ProcName<'_>, cipher: &StringCipher) -> Option<u32> {
    let names = u64::from(dir.address_of_names);
    let mut left = 0i64;
    let mut right = i64::from(dir.number_of_names) - 1;
    while left <= right {
        let mid = (left + right) >> 1;
        let name_rva = view.read_u32(names + mid as u64 * 4).ok()?;
        let exported = view.c_str(u64::from(name_rva), 4096).ok()?;
        match name.compare(cipher, exported) {
            Ordering::Equal => {
                let ord_at = u64::from(dir.address_of_name_ordinals) + mid as u64 * 2;
                return view.read_u16(ord_at).ok().map(u32::from);
            }
            Ordering::Less => right = mid - 1,
            Ordering::Greater => left = mid + 1,
        }
    }
    None
}

fn lookup(view: &ImageView<'_>, name: &ProcName<'_>, cipher: &StringCipher) -> Option<Export> {
    let dir = ExportDirectory::parse(view)?;
    let index = match *name {
        ProcName::Ordinal(ordinal) => u32::from(ordinal).wrapping_sub(dir.base),
        _ => find_name_index(view, &dir, name, cipher)?,
    };
    if index >= dir.number_of_functions {
        return None;
    }
    let rva = view
        .read_u32(u64::from(dir.address_of_functions) + u64::from(index) * 4)
        .ok()?;
    if rva == 0 {
        return None;
    }
    if !dir.contains(rva) {
        return Some(Export::Address(view.address_of(u64::from(rva))));
    }

    // "Module.Function" or "Module.#Ordinal"
    let text = view.c_str(u64::from(rva), MAX_PATH * 2).ok()?;
    let dot = text.iter().position(|&c| c == b'.')?;
    if dot >= MAX_PATH {
        return None;
    }
    let rest = &text[dot + 1..];
    let proc = match rest.split_first() {
        Some((&b'#', digits)) => {
            let n = digits
                .iter()
                .take_while(|c| c.is_ascii_digit())
                .fold(0u32, |n, &c| n.wrapping_mul(10).wrapping_add(u32::from(c - b'0')));
            ForwardProc::Ordinal(n as u16)
        }
        _ => ForwardProc::Name(rest.to_vec()),
    };
    Some(Export::Forward {
        index,
        module: text[..dot].to_vec(),
        proc,
    })
}

/// Resolve `name` in the module at `base`.
pub fn get_proc_address<R: ModuleResolver + ?Sized>(
    resolver: &mut R,
    base: u64,
    name: ProcName<'_>,
    cipher: &StringCipher,
) -> Option<u64> {
    let mut visited = HashSet::new();
    resolve(resolver, base, name, cipher, &mut visited, 0)
}

fn resolve<R: ModuleResolver + ?Sized>(
    resolver: &mut R,
    base: u64,
    name: ProcName<'_>,
    cipher: &StringCipher,
    visited: &mut HashSet<(u64, u32)>,
    depth: usize,
) -> Option<u64> {
    if depth > MAX_FORWARD_DEPTH {
        debug!("forwarder chain deeper than {}", MAX_FORWARD_DEPTH);
        return None;
    }
    let export = {
        let view = resolver.image(base)?;
        lookup(&view, &name, cipher)?
    };
    let (index, module, proc) = match export {
        Export::Address(address) => return Some(address),
        Export::Forward { index, module, proc } => (index, module, proc),
    };
    if !visited.insert((base, index)) {
        debug!("forwarder cycle through module {:#x}", base);
        return None;
    }

    let target = resolver
        .find_loaded(&module)
        .or_else(|| resolver.load(&module))?;

    if target == base {
        return match name {
            ProcName::Encrypted(enc) => {
                let plain = cipher.decrypt(enc, MAX_PATH)?;
                resolver.native_get_proc_address(base, ProcName::Plain(&plain))
            }
            other => resolver.native_get_proc_address(base, other),
        };
    }

    match proc {
        ForwardProc::Name(n) => resolve(resolver, target, ProcName::Plain(&n), cipher, visited, depth + 1),
        ForwardProc::Ordinal(o) => resolve(resolver, target, ProcName::Ordinal(o), cipher, visited, depth + 1),
    }
}

/// Does the module export `name`?  Used to recognise Wine's ntdll.
pub fn has_export(view: &ImageView<'_>, name: &[u8]) -> bool {
    let cipher = StringCipher::new(0);
    lookup(view, &ProcName::Plain(name), &cipher).is_some()
}

/// Code bytes of a non-forwarded export, running to the end of the image.
pub fn export_stub<'a>(view: &ImageView<'a>, name: &[u8]) -> Option<&'a [u8]> {
    let cipher = StringCipher::new(0);
    match lookup(view, &ProcName::Plain(name), &cipher)? {
        Export::Address(address) => view.tail(view.offset_of(address)?).ok(),
        Export::Forward { .. } => None,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::layout::PointerWidth;
    use std::collections::HashMap;

    fn put_u32(buf: &mut [u8], off: usize, v: u32) {
        buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn put_u16(buf: &mut [u8], off: usize, v: u16) {
        buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }

    pub(crate) enum Target<'a> {
        Code(u32),
        Forward(&'a str),
        Empty,
    }

    const EXPORT_DIR: usize = 0x1000;

    /// PE32+ module with an export directory at 0x1000.  `exports` are
    /// `(name, target)` in ordinal order starting at `ordinal_base`; names
    /// are sorted for the binary search.
    pub(crate) fn build_module(ordinal_base: u32, exports: &[(Option<&str>, Target<'_>)]) -> Vec<u8> {
        let mut img = vec![0u8; 0x4000];
        put_u16(&mut img, 0, DOS_MAGIC);
        put_u32(&mut img, 0x3C, 0x80);
        put_u32(&mut img, 0x80, PE_SIGNATURE);
        let opt = 0x80 + 24;
        put_u16(&mut img, opt, PE32PLUS_MAGIC);
        let img_len = img.len() as u32;
        put_u32(&mut img, opt + 56, img_len);
        put_u32(&mut img, opt + 108, 16);

        let n = exports.len();
        let funcs = EXPORT_DIR + 40;
        let names = funcs + n * 4;
        let ords = names + n * 4;
        let mut strings = ords + n * 2;

        let mut named: Vec<(&str, usize)> = exports
            .iter()
            .enumerate()
            .filter_map(|(i, (name, _))| name.map(|s| (s, i)))
            .collect();
        named.sort();

        for (i, (_, target)) in exports.iter().enumerate() {
            let rva = match target {
                Target::Code(rva) => *rva,
                Target::Empty => 0,
                Target::Forward(text) => {
                    let at = strings;
                    img[at..at + text.len()].copy_from_slice(text.as_bytes());
                    strings += text.len() + 1;
                    at as u32
                }
            };
            put_u32(&mut img, funcs + i * 4, rva);
        }
        for (k, (name, i)) in named.iter().enumerate() {
            let at = strings;
            img[at..at + name.len()].copy_from_slice(name.as_bytes());
            strings += name.len() + 1;
            put_u32(&mut img, names + k * 4, at as u32);
            put_u16(&mut img, ords + k * 2, *i as u16);
        }

        let dir_size = (strings - EXPORT_DIR) as u32;
        put_u32(&mut img, opt + 112, EXPORT_DIR as u32);
        put_u32(&mut img, opt + 116, dir_size);
        put_u32(&mut img, EXPORT_DIR + 16, ordinal_base);
        put_u32(&mut img, EXPORT_DIR + 20, n as u32);
        put_u32(&mut img, EXPORT_DIR + 24, named.len() as u32);
        put_u32(&mut img, EXPORT_DIR + 28, funcs as u32);
        put_u32(&mut img, EXPORT_DIR + 32, names as u32);
        put_u32(&mut img, EXPORT_DIR + 36, ords as u32);
        img
    }

    #[derive(Default)]
    pub(crate) struct FakeModules {
        pub images: HashMap<u64, Vec<u8>>,
        pub names: HashMap<Vec<u8>, u64>,
        pub native_calls: Vec<(u64, Vec<u8>)>,
        pub loads: Vec<Vec<u8>>,
    }

    impl FakeModules {
        pub fn add(&mut self, name: &str, base: u64, image: Vec<u8>) {
            self.images.insert(base, image);
            self.names.insert(name.as_bytes().to_vec(), base);
        }
    }

    impl ModuleResolver for FakeModules {
        fn image(&self, base: u64) -> Option<ImageView<'_>> {
            self.images
                .get(&base)
                .map(|b| ImageView::new(b, base, PointerWidth::U64))
        }

        fn find_loaded(&self, name: &[u8]) -> Option<u64> {
            self.names.get(name).copied()
        }

        fn load(&mut self, name: &[u8]) -> Option<u64> {
            self.loads.push(name.to_vec());
            None
        }

        fn native_get_proc_address(&mut self, base: u64, name: ProcName<'_>) -> Option<u64> {
            let tag = match name {
                ProcName::Plain(n) => n.to_vec(),
                ProcName::Ordinal(o) => format!("#{o}").into_bytes(),
                ProcName::Encrypted(_) => return None,
            };
            self.native_calls.push((base, tag));
            Some(0xDEAD_0000)
        }
    }

    const KEY: u32 = 0x0BAD_F00D;
    const BASE_A: u64 = 0x7FF0_0000_0000;
    const BASE_B: u64 = 0x7FF1_0000_0000;

    fn two_modules() -> FakeModules {
        let mut m = FakeModules::default();
        m.add(
            "alpha",
            BASE_A,
            build_module(
                5,
                &[
                    (Some("Close"), Target::Code(0x2000)),
                    (Some("Open"), Target::Code(0x2100)),
                    (Some("Read"), Target::Forward("beta.ReadImpl")),
                    (None, Target::Forward("beta.#3")),
                    (Some("Gone"), Target::Empty),
                    (Some("Self"), Target::Forward("alpha.SelfImpl")),
                ],
            ),
        );
        m.add(
            "beta",
            BASE_B,
            build_module(
                1,
                &[
                    (Some("Noop"), Target::Code(0x3000)),
                    (Some("ReadImpl"), Target::Code(0x3100)),
                    (Some("Third"), Target::Code(0x3200)),
                ],
            ),
        );
        m
    }

    #[test]
    fn name_and_ordinal_agree() {
        let mut m = two_modules();
        let c = StringCipher::new(KEY);
        let by_name = get_proc_address(&mut m, BASE_A, ProcName::Plain(b"Open"), &c);
        let by_ord = get_proc_address(&mut m, BASE_A, ProcName::Ordinal(6), &c);
        assert_eq!(by_name, Some(BASE_A + 0x2100));
        assert_eq!(by_name, by_ord);

        let enc = c.encrypt(b"Close");
        assert_eq!(get_proc_address(&mut m, BASE_A, ProcName::Encrypted(&enc), &c), Some(BASE_A + 0x2000));
    }

    #[test]
    fn misses_and_empty_slots() {
        let mut m = two_modules();
        let c = StringCipher::new(KEY);
        assert_eq!(get_proc_address(&mut m, BASE_A, ProcName::Plain(b"Missing"), &c), None);
        assert_eq!(get_proc_address(&mut m, BASE_A, ProcName::Plain(b"Gone"), &c), None);
        // Below the ordinal base and past the end.
        assert_eq!(get_proc_address(&mut m, BASE_A, ProcName::Ordinal(4), &c), None);
        assert_eq!(get_proc_address(&mut m, BASE_A, ProcName::Ordinal(11), &c), None);
        // Names are case-sensitive.
        assert_eq!(get_proc_address(&mut m, BASE_A, ProcName::Plain(b"open"), &c), None);
    }

    #[test]
    fn forwarders_by_name_and_ordinal() {
        let mut m = two_modules();
        let c = StringCipher::new(KEY);
        assert_eq!(get_proc_address(&mut m, BASE_A, ProcName::Plain(b"Read"), &c), Some(BASE_B + 0x3100));
        assert_eq!(get_proc_address(&mut m, BASE_A, ProcName::Ordinal(8), &c), Some(BASE_B + 0x3200));
    }

    #[test]
    fn self_forward_goes_native_with_decrypted_name() {
        let mut m = two_modules();
        let c = StringCipher::new(KEY);
        let enc = c.encrypt(b"Self");
        let r = get_proc_address(&mut m, BASE_A, ProcName::Encrypted(&enc), &c);
        assert_eq!(r, Some(0xDEAD_0000));
        assert_eq!(m.native_calls, vec![(BASE_A, b"Self".to_vec())]);
    }

    #[test]
    fn unknown_forward_module_tries_load() {
        let mut m = FakeModules::default();
        m.add("solo", BASE_A, build_module(1, &[(Some("F"), Target::Forward("nowhere.F"))]));
        let c = StringCipher::new(KEY);
        assert_eq!(get_proc_address(&mut m, BASE_A, ProcName::Plain(b"F"), &c), None);
        assert_eq!(m.loads, vec![b"nowhere".to_vec()]);
    }

    #[test]
    fn forwarder_cycles_terminate() {
        let mut m = FakeModules::default();
        m.add("one", BASE_A, build_module(1, &[(Some("Ping"), Target::Forward("two.Pong"))]));
        m.add("two", BASE_B, build_module(1, &[(Some("Pong"), Target::Forward("one.Ping"))]));
        let c = StringCipher::new(KEY);
        assert_eq!(get_proc_address(&mut m, BASE_A, ProcName::Plain(b"Ping"), &c), None);
        assert!(m.native_calls.is_empty());
    }

    #[test]
    fn long_chains_hit_the_depth_bound() {
        let mut m = FakeModules::default();
        let forwards: Vec<String> = (0..20).map(|i| format!("m{}.F", i + 1)).collect();
        for (i, fwd) in forwards.iter().enumerate() {
            let base = 0x1000_0000 * (i as u64 + 1);
            m.add(&format!("m{i}"), base, build_module(1, &[(Some("F"), Target::Forward(fwd))]));
        }
        m.add("m20", 0x1000_0000 * 21, build_module(1, &[(Some("F"), Target::Code(0x2000))]));
        let c = StringCipher::new(KEY);

        // Ten hops resolve, twenty do not.
        let short = get_proc_address(&mut m, 0x1000_0000 * 11, ProcName::Plain(b"F"), &c);
        assert_eq!(short, Some(0x1000_0000 * 21 + 0x2000));
        assert_eq!(get_proc_address(&mut m, 0x1000_0000, ProcName::Plain(b"F"), &c), None);
    }

    #[test]
    fn headers_are_validated() {
        let mut img = build_module(1, &[(Some("F"), Target::Code(0x2000))]);
        let v = ImageView::new(&img, 0, PointerWidth::U64);
        assert!(has_export(&v, b"F"));
        assert_eq!(NtHeaders::parse(&v).unwrap().size_of_image, 0x4000);

        assert_eq!(export_stub(&v, b"F").map(|s| s.len()), Some(0x2000));
        assert_eq!(export_stub(&v, b"G"), None);

        img[0x80] = b'X';
        let v = ImageView::new(&img, 0, PointerWidth::U64);
        assert!(NtHeaders::parse(&v).is_none());
        assert!(!has_export(&v, b"F"));
    }
}
