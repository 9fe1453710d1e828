//! Per-CPU fingerprints bound to one `GlobalData` allocation.
//!
//! The runtime pins the calling thread to each CPU of the system affinity
//! mask in turn and feeds `CPUID(1)` into [`CpuHashSet::insert`].  The hash
//! folds in the allocation address, so a table copied into another process
//! never matches there.

use crate::error::{InitCode, LoaderError};
use crate::layout::PointerWidth;

/// Slots reserved for CPU hashes in `GlobalData`.
pub const CPU_HASH_CAPACITY: usize = 32;

/// Family/model signature of the Athlon parts that misreport leaf 1.
const ATHLON_SIGNATURE_MASK: u32 = 0xff0;
const ATHLON_SIGNATURE: u32 = 0xfe0;
/// The initial APIC ID lives in bits 24..32 and differs per core.
const APIC_ID_MASK: u32 = 0x00ff_ffff;

/// Per-build salt: the OS build number shifted into the upper bits.
pub fn cpu_salt(os_build_number: u16) -> u64 {
    u64::from(os_build_number) << 7
}

/// Hash one CPU from its `CPUID(1)` eax and ebx.
///
/// eax and ebx are added as signed 32-bit values and the sum widened with
/// sign extension before the salt and anchor are mixed in; the result is
/// truncated to the pointer width of the target.
pub fn cpu_hash(eax: u32, ebx: u32, salt: u64, anchor: u64, width: PointerWidth) -> u64 {
    let mut eax = eax;
    if eax & ATHLON_SIGNATURE_MASK == ATHLON_SIGNATURE {
        eax ^= 0x20;
    }
    let ebx = ebx & APIC_ID_MASK;
    let sum = (eax as i32).wrapping_add(ebx as i32) as i64 as u64;
    width.mask(sum.wrapping_add(salt) ^ anchor)
}

/// Deduplicated, bounded set of CPU hashes in discovery order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuHashSet {
    hashes: Vec<u64>,
}

impl CpuHashSet {
    pub fn new() -> Self {
        CpuHashSet {
            hashes: Vec::with_capacity(CPU_HASH_CAPACITY),
        }
    }

    /// Record `hash` unless already present.  A new hash past the capacity
    /// is fatal.
    pub fn insert(&mut self, hash: u64) -> Result<bool, LoaderError> {
        if self.hashes.contains(&hash) {
            return Ok(false);
        }
        if self.hashes.len() == CPU_HASH_CAPACITY {
            return Err(LoaderError::Initialization(InitCode::CpuHash));
        }
        self.hashes.push(hash);
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.hashes
    }
}

/// Indices of the set bits of an affinity mask, lowest first.
pub fn affinity_bits(mask: u64) -> impl Iterator<Item = u32> {
    (0..64).filter(move |i| mask & (1u64 << i) != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ANCHOR: u64 = 0x0000_01F4_A000_0040;

    #[test]
    fn apic_id_is_ignored() {
        let a = cpu_hash(0x000906EA, 0x0010_0800, cpu_salt(19045), ANCHOR, PointerWidth::U64);
        let b = cpu_hash(0x000906EA, 0x0710_0800, cpu_salt(19045), ANCHOR, PointerWidth::U64);
        assert_eq!(a, b);
    }

    #[test]
    fn athlon_erratum_is_folded() {
        let buggy = cpu_hash(0x00000FE0, 0, 0, 0, PointerWidth::U64);
        let fixed = cpu_hash(0x00000FC0, 0, 0, 0, PointerWidth::U64);
        assert_eq!(buggy, fixed);
        assert_eq!(buggy, 0xFC0);
    }

    #[test]
    fn anchor_and_salt_bind_the_hash() {
        let h1 = cpu_hash(0x000906EA, 0x0010_0800, cpu_salt(19045), ANCHOR, PointerWidth::U64);
        let h2 = cpu_hash(0x000906EA, 0x0010_0800, cpu_salt(19045), ANCHOR + 0x10, PointerWidth::U64);
        let h3 = cpu_hash(0x000906EA, 0x0010_0800, cpu_salt(22000), ANCHOR, PointerWidth::U64);
        assert_ne!(h1, h2);
        assert_ne!(h1, h3);
        assert_eq!(h1, (0x000906EAu64 + 0x0010_0800 + (19045u64 << 7)) ^ ANCHOR);
    }

    #[test]
    fn signed_sum_sign_extends() {
        let h = cpu_hash(0x7FFF_FFFF, 0x0000_0001, 0, 0, PointerWidth::U64);
        assert_eq!(h, 0xFFFF_FFFF_8000_0000);
        assert_eq!(cpu_hash(0x7FFF_FFFF, 1, 0, 0, PointerWidth::U32), 0x8000_0000);
    }

    #[test]
    fn set_deduplicates_and_caps() {
        let mut set = CpuHashSet::new();
        assert!(set.insert(7).unwrap());
        assert!(!set.insert(7).unwrap());
        for h in 100..131 {
            set.insert(h).unwrap();
        }
        assert_eq!(set.len(), CPU_HASH_CAPACITY);
        assert!(!set.insert(100).unwrap());
        assert_eq!(
            set.insert(999),
            Err(LoaderError::Initialization(InitCode::CpuHash))
        );
    }

    #[test]
    fn recomputation_is_stable() {
        let leaves = [(0x000906EAu32, 0x0010_0800u32), (0x000906EA, 0x0110_0800), (0x000906EA, 0x0210_0800)];
        let run = || {
            let mut set = CpuHashSet::new();
            for &(a, b) in &leaves {
                set.insert(cpu_hash(a, b, cpu_salt(19041), ANCHOR, PointerWidth::U64)).unwrap();
            }
            set
        };
        let first = run();
        assert_eq!(first.len(), 1);
        assert_eq!(first, run());
    }

    #[test]
    fn affinity_mask_bits() {
        assert_eq!(affinity_bits(0b1011).collect::<Vec<_>>(), vec![0, 1, 3]);
        assert_eq!(affinity_bits(1 << 63).collect::<Vec<_>>(), vec![63]);
        assert_eq!(affinity_bits(0).count(), 0);
    }
}
