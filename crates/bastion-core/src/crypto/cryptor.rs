//! Rolling keystream that scrambles every field of a CRC table.
//!
//! The key evolves with each plaintext word (`key' = rotl(key, 7) ^ plain`),
//! so a table has to be walked in the order it was written: Address, Size,
//! Hash, record after record.

/// Stateful cryptor.  One instance per table, seeded with the image salt.
#[derive(Debug, Clone)]
pub struct CrcValueCryptor {
    key: u32,
}

impl CrcValueCryptor {
    pub fn new(seed: u32) -> Self {
        CrcValueCryptor { key: seed }
    }

    pub fn decrypt(&mut self, value: u32) -> u32 {
        let plain = value ^ self.key;
        self.key = self.key.rotate_left(7) ^ plain;
        plain
    }

    pub fn encrypt(&mut self, value: u32) -> u32 {
        let old = self.key;
        self.key = self.key.rotate_left(7) ^ value;
        value ^ old
    }
}
