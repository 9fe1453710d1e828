//! The per-image `GlobalData` record and its publication slot.
//!
//! The record is built privately by the bootstrap thread and handed to
//! [`GlobalSlot::commit`] as the last act of initialization.  The release
//! store there is the happens-before edge: any thread that acquire-loads a
//! non-null pointer sees every field written before the commit.  After
//! publication only the two detection flags change, and every field is an
//! atomic word so those late writes cannot tear.
//!
//! Each word is kept XOR a per-field salt so the record never holds a
//! scannable plain value; the accessors undo it.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use crate::cpu::{CpuHashSet, CPU_HASH_CAPACITY};

const SALT_BASE: u64 = 0xFACE_0300;

/// Scalar fields of the record, in storage order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Var {
    LoaderStatus,
    IsPatchDetected,
    IsDebuggerDetected,
    OsBuildNumber,
    SessionKey,
    ServerDate,
    LoaderCrcInfo,
    LoaderCrcSize,
    LoaderCrcHash,
    CrcImageSize,
    CpuCount,
    DriverUnload,
}

const VAR_COUNT: usize = Var::DriverUnload as usize + 1;

impl Var {
    const fn salt(self) -> u64 {
        SALT_BASE | self as u64
    }
}

/// Hash slots share one salt, following the scalar fields.
const CPU_HASH_SALT: u64 = SALT_BASE | VAR_COUNT as u64;

/// Outcome of `SetupImage` as seen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LoaderStatus {
    Error = 0,
    Success = 1,
}

impl LoaderStatus {
    fn from_word(word: u64) -> Self {
        if word == LoaderStatus::Success as u64 {
            LoaderStatus::Success
        } else {
            LoaderStatus::Error
        }
    }

    pub fn is_success(self) -> bool {
        self == LoaderStatus::Success
    }
}

pub struct GlobalData {
    vars: [AtomicU64; VAR_COUNT],
    cpu_hash: [AtomicU64; CPU_HASH_CAPACITY],
}

impl GlobalData {
    /// A fresh record: status `Error`, no findings, everything else zero.
    pub fn new() -> Self {
        let data = GlobalData {
            vars: std::array::from_fn(|i| AtomicU64::new(SALT_BASE | i as u64)),
            cpu_hash: std::array::from_fn(|_| AtomicU64::new(CPU_HASH_SALT)),
        };
        data.set_loader_status(LoaderStatus::Error);
        data
    }

    fn get(&self, var: Var) -> u64 {
        self.vars[var as usize].load(Ordering::Relaxed) ^ var.salt()
    }

    fn set(&self, var: Var, value: u64) {
        self.vars[var as usize].store(value ^ var.salt(), Ordering::Relaxed);
    }

    /// Stored word without the salt removed.
    pub fn raw(&self, var: Var) -> u64 {
        self.vars[var as usize].load(Ordering::Relaxed)
    }

    pub fn loader_status(&self) -> LoaderStatus {
        LoaderStatus::from_word(self.get(Var::LoaderStatus))
    }

    pub fn set_loader_status(&self, status: LoaderStatus) {
        self.set(Var::LoaderStatus, status as u64);
    }

    pub fn is_patch_detected(&self) -> bool {
        self.get(Var::IsPatchDetected) != 0
    }

    pub fn set_is_patch_detected(&self, value: bool) {
        self.set(Var::IsPatchDetected, u64::from(value));
    }

    pub fn is_debugger_detected(&self) -> bool {
        self.get(Var::IsDebuggerDetected) != 0
    }

    pub fn set_is_debugger_detected(&self, value: bool) {
        self.set(Var::IsDebuggerDetected, u64::from(value));
    }

    pub fn os_build_number(&self) -> u16 {
        self.get(Var::OsBuildNumber) as u16
    }

    pub fn set_os_build_number(&self, value: u16) {
        self.set(Var::OsBuildNumber, u64::from(value));
    }

    pub fn session_key(&self) -> u32 {
        self.get(Var::SessionKey) as u32
    }

    pub fn set_session_key(&self, value: u32) {
        self.set(Var::SessionKey, u64::from(value));
    }

    pub fn server_date(&self) -> u32 {
        self.get(Var::ServerDate) as u32
    }

    pub fn set_server_date(&self, value: u32) {
        self.set(Var::ServerDate, u64::from(value));
    }

    pub fn loader_crc_info(&self) -> u32 {
        self.get(Var::LoaderCrcInfo) as u32
    }

    pub fn set_loader_crc_info(&self, value: u32) {
        self.set(Var::LoaderCrcInfo, u64::from(value));
    }

    pub fn loader_crc_size(&self) -> u32 {
        self.get(Var::LoaderCrcSize) as u32
    }

    pub fn set_loader_crc_size(&self, value: u32) {
        self.set(Var::LoaderCrcSize, u64::from(value));
    }

    pub fn loader_crc_hash(&self) -> u32 {
        self.get(Var::LoaderCrcHash) as u32
    }

    pub fn set_loader_crc_hash(&self, value: u32) {
        self.set(Var::LoaderCrcHash, u64::from(value));
    }

    pub fn crc_image_size(&self) -> u32 {
        self.get(Var::CrcImageSize) as u32
    }

    pub fn set_crc_image_size(&self, value: u32) {
        self.set(Var::CrcImageSize, u64::from(value));
    }

    /// Address of the driver unload routine displaced at setup, 0 if none.
    pub fn driver_unload(&self) -> u64 {
        self.get(Var::DriverUnload)
    }

    pub fn set_driver_unload(&self, value: u64) {
        self.set(Var::DriverUnload, value);
    }

    pub fn cpu_count(&self) -> usize {
        self.get(Var::CpuCount) as usize
    }

    pub fn cpu_hash(&self, index: usize) -> Option<u64> {
        if index >= self.cpu_count() {
            return None;
        }
        self.cpu_hash
            .get(index)
            .map(|slot| slot.load(Ordering::Relaxed) ^ CPU_HASH_SALT)
    }

    pub fn cpu_hashes(&self) -> Vec<u64> {
        (0..self.cpu_count()).filter_map(|i| self.cpu_hash(i)).collect()
    }

    pub fn set_cpu_hashes(&self, set: &CpuHashSet) {
        for (slot, &hash) in self.cpu_hash.iter().zip(set.as_slice()) {
            slot.store(hash ^ CPU_HASH_SALT, Ordering::Relaxed);
        }
        self.set(Var::CpuCount, set.len() as u64);
    }

    /// Address used to bind CPU hashes to this allocation.
    pub fn anchor(&self) -> u64 {
        self as *const GlobalData as u64
    }
}

impl Default for GlobalData {
    fn default() -> Self {
        GlobalData::new()
    }
}

impl std::fmt::Debug for GlobalData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalData")
            .field("loader_status", &self.loader_status())
            .field("is_patch_detected", &self.is_patch_detected())
            .field("is_debugger_detected", &self.is_debugger_detected())
            .field("os_build_number", &self.os_build_number())
            .field("cpu_count", &self.cpu_count())
            .finish_non_exhaustive()
    }
}

/// Single-pointer publication slot for a boxed [`GlobalData`].
///
/// Dropping the slot leaks a record that is still published: the image's
/// storage slot may outlive the slot and keeps pointing at it.  `take`
/// releases it.
pub struct GlobalSlot {
    ptr: AtomicPtr<GlobalData>,
}

impl GlobalSlot {
    pub const fn new() -> Self {
        GlobalSlot {
            ptr: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Publish `data`.  Returns the address now visible to readers.  A
    /// record already in the slot is released.
    pub fn commit(&mut self, data: Box<GlobalData>) -> u64 {
        let raw = Box::into_raw(data);
        let old = self.ptr.swap(raw, Ordering::Release);
        if !old.is_null() {
            // SAFETY: every non-null value in the slot came from
            // `Box::into_raw` and `&mut self` rules out live borrows.
            drop(unsafe { Box::from_raw(old) });
        }
        raw as u64
    }

    pub fn load(&self) -> Option<&GlobalData> {
        let raw = self.ptr.load(Ordering::Acquire);
        // SAFETY: non-null values are live boxes owned by the slot; they are
        // only freed through `&mut self`.
        unsafe { raw.as_ref() }
    }

    pub fn is_published(&self) -> bool {
        !self.ptr.load(Ordering::Acquire).is_null()
    }

    /// Unpublish and hand the record back to the caller.
    pub fn take(&mut self) -> Option<Box<GlobalData>> {
        let raw = self.ptr.swap(ptr::null_mut(), Ordering::AcqRel);
        if raw.is_null() {
            None
        } else {
            // SAFETY: see `commit`.
            Some(unsafe { Box::from_raw(raw) })
        }
    }
}

impl Default for GlobalSlot {
    fn default() -> Self {
        GlobalSlot::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fresh_record_defaults() {
        let g = GlobalData::new();
        assert_eq!(g.loader_status(), LoaderStatus::Error);
        assert!(!g.is_patch_detected());
        assert!(!g.is_debugger_detected());
        assert_eq!(g.cpu_count(), 0);
        assert_eq!(g.crc_image_size(), 0);
        assert!(g.cpu_hashes().is_empty());
    }

    #[test]
    fn words_are_salted() {
        let g = GlobalData::new();
        g.set_crc_image_size(0x4000);
        g.set_session_key(0);
        assert_ne!(g.raw(Var::CrcImageSize), 0x4000);
        assert_ne!(g.raw(Var::SessionKey), 0);
        assert_eq!(g.crc_image_size(), 0x4000);
        assert_eq!(g.session_key(), 0);
    }

    #[test]
    fn cpu_hashes_round_trip_in_order() {
        let g = GlobalData::new();
        let mut set = CpuHashSet::new();
        for h in [30, 10, 20] {
            set.insert(h).unwrap();
        }
        g.set_cpu_hashes(&set);
        assert_eq!(g.cpu_hashes(), vec![30, 10, 20]);
        assert_eq!(g.cpu_hash(3), None);
    }

    #[test]
    fn slot_publishes_and_takes_back() {
        let mut slot = GlobalSlot::new();
        assert!(slot.load().is_none());

        let g = Box::new(GlobalData::new());
        g.set_loader_status(LoaderStatus::Success);
        let anchor = g.anchor();
        assert_eq!(slot.commit(g), anchor);

        assert_eq!(slot.load().map(|g| g.loader_status()), Some(LoaderStatus::Success));
        let back = slot.take().unwrap();
        assert_eq!(back.anchor(), anchor);
        assert!(!slot.is_published());
        assert!(slot.take().is_none());
    }

    #[test]
    fn flags_update_after_publication() {
        let mut slot = GlobalSlot::new();
        slot.commit(Box::new(GlobalData::new()));
        let slot = Arc::new(slot);

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let slot = Arc::clone(&slot);
                thread::spawn(move || {
                    let g = slot.load().unwrap();
                    g.set_is_debugger_detected(true);
                    g.is_debugger_detected()
                })
            })
            .collect();
        for r in readers {
            assert!(r.join().unwrap());
        }
        assert!(slot.load().unwrap().is_debugger_detected());
    }
}
