//! Position-keyed string cipher used for DLL names, API names and message
//! templates.
//!
//! Byte `i` is masked with `rotl(key, i) + i` truncated to eight bits.  The
//! NUL terminator is encrypted too, so an encrypted string has no visible
//! end; decryption walks until the *plain* byte is zero.

use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StringCipher {
    key: u32,
}

impl StringCipher {
    pub fn new(key: u32) -> Self {
        StringCipher { key }
    }

    #[inline]
    pub fn mask(&self, pos: usize) -> u8 {
        self.key
            .rotate_left(pos as u32)
            .wrapping_add(pos as u32) as u8
    }

    #[inline]
    pub fn decrypt_byte(&self, byte: u8, pos: usize) -> u8 {
        byte ^ self.mask(pos)
    }

    /// Encrypt `plain` and its terminator.
    pub fn encrypt(&self, plain: &[u8]) -> Vec<u8> {
        plain
            .iter()
            .copied()
            .chain(std::iter::once(0))
            .enumerate()
            .map(|(i, b)| b ^ self.mask(i))
            .collect()
    }

    /// Decrypt up to the terminator.  Returns `None` if `data` ends, or
    /// `max` bytes pass, before a NUL is decrypted.
    pub fn decrypt(&self, data: &[u8], max: usize) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        for (i, &b) in data.iter().take(max).enumerate() {
            let c = self.decrypt_byte(b, i);
            if c == 0 {
                return Some(out);
            }
            out.push(c);
        }
        None
    }

    /// `strcmp` of an encrypted name against a plain one.
    pub fn compare(&self, encrypted: &[u8], plain: &[u8]) -> Ordering {
        compare_by(
            |i| encrypted.get(i).map_or(0, |&b| self.decrypt_byte(b, i)),
            plain,
        )
    }

    /// Case-insensitive module-name comparison.  `ntdll` matches
    /// `ntdll.dll` on the encrypted side.
    pub fn compare_module(&self, encrypted: &[u8], plain: &[u8]) -> Ordering {
        compare_module_by(
            |i| encrypted.get(i).map_or(0, |&b| self.decrypt_byte(b, i)),
            plain,
        )
    }
}

/// `strcmp` where the left side is produced byte by byte.
pub fn compare_by(left: impl Fn(usize) -> u8, right: &[u8]) -> Ordering {
    let mut i = 0;
    loop {
        let c1 = left(i);
        let c2 = right.get(i).copied().unwrap_or(0);
        if c1 == 0 || c1 != c2 {
            return c1.cmp(&c2);
        }
        i += 1;
    }
}

pub fn compare_module_by(left: impl Fn(usize) -> u8, right: &[u8]) -> Ordering {
    let mut i = 0;
    loop {
        let c1 = left(i).to_ascii_lowercase();
        let c2 = right.get(i).copied().unwrap_or(0).to_ascii_lowercase();
        if c1 == 0 || c1 != c2 {
            if c1 == b'.' && c2 == 0 {
                return Ordering::Equal;
            }
            return c1.cmp(&c2);
        }
        i += 1;
    }
}
