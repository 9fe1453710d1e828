//! Linux provider.
//!
//! Modules are shared objects reached through the dynamic linker; there is
//! no export directory to walk, so imports always take the
//! `native_get_proc_address` path.  Facts come from procfs and sysfs.

use std::ffi::{c_void, CStr, CString};
use std::path::PathBuf;
use std::process::Command;

use log::debug;

use bastion_core::{ImageView, Message, ModuleResolver, ProcName};

use crate::platform::{AffinityMasks, EntryReason, Platform};

const PROC_STATUS: &str = "/proc/self/status";
const OWN_EXE: &str = "/proc/self/exe";
const DMI_SYS_VENDOR: &str = "/sys/devices/virtual/dmi/id/sys_vendor";

/// Signature the wrapped module's entry point is called with.
type RuntimeEntry = unsafe extern "C" fn(*mut c_void, u32, *mut c_void) -> i32;
type IrelativeResolver = unsafe extern "C" fn() -> u64;

pub struct LinuxPlatform {
    image_base: u64,
}

impl LinuxPlatform {
    pub fn new(image_base: u64) -> Self {
        LinuxPlatform { image_base }
    }

    fn page_size() -> u64 {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as u64
        } else {
            0x1000
        }
    }

    /// Path of the object containing the image, via the dynamic linker.
    fn own_path(&self) -> PathBuf {
        let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
        // SAFETY: dladdr only reads the loader's own tables.
        let found = unsafe { libc::dladdr(self.image_base as *const c_void, &mut info) };
        if found != 0 && !info.dli_fname.is_null() {
            // SAFETY: dli_fname is a NUL-terminated string owned by the linker.
            let name = unsafe { CStr::from_ptr(info.dli_fname) };
            if let Ok(name) = name.to_str() {
                if !name.is_empty() {
                    return PathBuf::from(name);
                }
            }
        }
        PathBuf::from(OWN_EXE)
    }

    fn dlopen(name: &[u8], flags: libc::c_int) -> Option<u64> {
        let name = CString::new(name).ok()?;
        // SAFETY: `name` is NUL-terminated and outlives the call.
        let handle = unsafe { libc::dlopen(name.as_ptr(), flags) };
        (!handle.is_null()).then_some(handle as u64)
    }

    fn mask_of(set: &libc::cpu_set_t) -> u64 {
        (0..64usize)
            // SAFETY: `set` is a valid cpu_set_t and every index is in range.
            .filter(|&cpu| unsafe { libc::CPU_ISSET(cpu, set) })
            .fold(0u64, |mask, cpu| mask | (1u64 << cpu))
    }

    fn set_of(mask: u64) -> libc::cpu_set_t {
        let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
        for cpu in 0..64usize {
            if mask & (1u64 << cpu) != 0 {
                // SAFETY: index below CPU_SETSIZE.
                unsafe { libc::CPU_SET(cpu, &mut set) };
            }
        }
        set
    }

    fn current_mask() -> Option<u64> {
        let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
        // SAFETY: the size matches the buffer handed in.
        let rc = unsafe { libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set) };
        (rc == 0).then(|| Self::mask_of(&set))
    }

    fn apply_mask(mask: u64) -> bool {
        let set = Self::set_of(mask);
        // SAFETY: as above.
        unsafe { libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) == 0 }
    }
}

impl ModuleResolver for LinuxPlatform {
    fn image(&self, _base: u64) -> Option<ImageView<'_>> {
        None
    }

    fn find_loaded(&self, name: &[u8]) -> Option<u64> {
        Self::dlopen(name, libc::RTLD_LAZY | libc::RTLD_NOLOAD)
    }

    fn load(&mut self, name: &[u8]) -> Option<u64> {
        Self::dlopen(name, libc::RTLD_NOW)
    }

    fn native_get_proc_address(&mut self, base: u64, name: ProcName<'_>) -> Option<u64> {
        let ProcName::Plain(name) = name else {
            return None;
        };
        let name = CString::new(name).ok()?;
        // SAFETY: `base` is a handle returned by dlopen above.
        let symbol = unsafe { libc::dlsym(base as *mut c_void, name.as_ptr()) };
        (!symbol.is_null()).then_some(symbol as u64)
    }
}

unsafe extern "C" fn collect_module(info: *mut libc::dl_phdr_info, _size: libc::size_t, data: *mut c_void) -> libc::c_int {
    let modules = &mut *(data as *mut Vec<(Vec<u8>, u64)>);
    let info = &*info;
    let path = if info.dlpi_name.is_null() {
        &[][..]
    } else {
        CStr::from_ptr(info.dlpi_name).to_bytes()
    };
    let name = path.rsplit(|&c| c == b'/').next().unwrap_or(path);
    modules.push((name.to_vec(), info.dlpi_addr as u64));
    0
}

impl Platform for LinuxPlatform {
    fn loaded_modules(&mut self) -> Vec<(Vec<u8>, u64)> {
        let mut modules: Vec<(Vec<u8>, u64)> = Vec::new();
        // SAFETY: the callback only touches `modules`, which outlives the walk.
        unsafe { libc::dl_iterate_phdr(Some(collect_module), &mut modules as *mut _ as *mut c_void) };
        modules
    }

    fn proc_status(&mut self) -> Option<Vec<u8>> {
        std::fs::read(PROC_STATUS).ok()
    }

    fn firmware_tables(&mut self) -> Vec<Vec<u8>> {
        std::fs::read(DMI_SYS_VENDOR).into_iter().collect()
    }

    fn read_own_file(&mut self) -> Option<Vec<u8>> {
        let path = self.own_path();
        match std::fs::read(&path) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                debug!("cannot read {}: {}", path.display(), e);
                None
            }
        }
    }

    fn protect(&mut self, address: u64, size: usize, protection: u32) -> Option<u32> {
        let page = Self::page_size();
        let start = address & !(page - 1);
        let len = (address + size as u64 - start) as usize;
        // SAFETY: the range lies inside the mapped image.
        let rc = unsafe { libc::mprotect(start as *mut c_void, len, protection as libc::c_int) };
        (rc == 0).then_some(0)
    }

    // The walk covers the CPUs this thread may run on: online CPUs need not
    // be contiguous and a cpuset may hide some of them.
    fn affinity(&mut self) -> Option<AffinityMasks> {
        let mask = Self::current_mask()?;
        Some(AffinityMasks {
            process: mask,
            system: mask,
        })
    }

    // Linux affinity is per thread; the calling thread stands in for the
    // process.
    fn set_process_affinity(&mut self, mask: u64) -> bool {
        Self::apply_mask(mask)
    }

    fn pin_thread(&mut self, mask: u64) -> u64 {
        let previous = Self::current_mask().unwrap_or(0);
        Self::apply_mask(mask);
        previous
    }

    fn call_entry(&mut self, entry: u64, image_base: u64, reason: EntryReason) -> bool {
        let reason = match reason {
            EntryReason::ProcessAttach => 1,
            EntryReason::ProcessDetach => 0,
        };
        // SAFETY: `entry` is the relocated entry point of the unpacked image.
        let entry: RuntimeEntry = unsafe { std::mem::transmute(entry as usize) };
        unsafe { entry(image_base as *mut c_void, reason, std::ptr::null_mut()) != 0 }
    }

    fn call_indirect(&mut self, function: u64) -> u64 {
        // SAFETY: `function` is an IRELATIVE resolver inside the image.
        let resolver: IrelativeResolver = unsafe { std::mem::transmute(function as usize) };
        unsafe { resolver() }
    }

    fn show_message(&mut self, message: &Message) {
        let flag = if message.kind.is_warning() { "--warning" } else { "--error" };
        let shown = Command::new("zenity")
            .arg(flag)
            .arg("--no-markup")
            .arg("--text")
            .arg(&message.text)
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        if !shown {
            println!("{}", message.text);
        }
    }

    fn exit_process(&mut self, code: u32) {
        std::process::exit(code as i32);
    }
}
