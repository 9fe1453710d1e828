//! Checksums and the two stream ciphers burned into protected images.

pub mod crc;
pub mod cryptor;
pub mod string;

pub use crc::crc32;
pub use cryptor::CrcValueCryptor;
pub use string::StringCipher;
