//! Windows provider.
//!
//! Native calls go through the settled service numbers when the process is
//! 64-bit and the number is known, and through the ntdll export otherwise.
//! Trap-flag probes and the invalid-handle check run under a vectored
//! exception handler that only claims exceptions while a probe is armed.

use std::ffi::{c_void, OsString};
use std::os::windows::ffi::OsStringExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;

use windows_sys::Win32::Foundation::{CloseHandle, GENERIC_READ, INVALID_HANDLE_VALUE};
use windows_sys::Win32::Storage::FileSystem::{CreateFileA, FILE_SHARE_READ, OPEN_EXISTING};
use windows_sys::Win32::System::Diagnostics::Debug::{
    AddVectoredExceptionHandler, RemoveVectoredExceptionHandler, EXCEPTION_POINTERS,
};
use windows_sys::Win32::System::LibraryLoader::{
    GetModuleFileNameW, GetModuleHandleA, GetProcAddress, LoadLibraryA,
};
use windows_sys::Win32::System::Memory::{
    CreateFileMappingA, MapViewOfFile, UnmapViewOfFile, VirtualProtect, VirtualQuery, FILE_MAP_READ,
    MEMORY_BASIC_INFORMATION, MEMORY_MAPPED_VIEW_ADDRESS, PAGE_READONLY, SEC_IMAGE_NO_EXECUTE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemDirectoryA, GetSystemFirmwareTable};
use windows_sys::Win32::System::Threading::{
    ExitProcess, GetCurrentProcess, GetCurrentThread, GetProcessAffinityMask, IsWow64Process,
    SetProcessAffinityMask, SetThreadAffinityMask,
};

use bastion_core::detect::PROBE_NOP;
use bastion_core::{
    ImageView, Message, ModuleResolver, PointerWidth, ProbeOutcome, ProcName, SyscallArch, SyscallTable,
};

use crate::platform::{
    AffinityMasks, EntryReason, HandleClose, KernelDebuggerInfo, Platform, ProcessInfo, QueryResult, TrapProbe,
};

const NTDLL: &[u8] = b"ntdll.dll\0";
const CURRENT_PROCESS: u64 = u64::MAX;
const CURRENT_THREAD: u64 = u64::MAX - 1;

const THREAD_HIDE_FROM_DEBUGGER: u32 = 0x11;
const PROCESS_INSTRUMENTATION_CALLBACK: u32 = 40;
const SYSTEM_MODULE_INFORMATION: u32 = 11;
const SYSTEM_KERNEL_DEBUGGER_INFORMATION: u32 = 0x23;
const STATUS_INFO_LENGTH_MISMATCH: i32 = 0xC000_0004_u32 as i32;

const EXCEPTION_SINGLE_STEP: i32 = 0x8000_0004_u32 as i32;
const EXCEPTION_INVALID_HANDLE: i32 = 0xC000_0008_u32 as i32;
const CONTINUE_EXECUTION: i32 = -1;
const CONTINUE_SEARCH: i32 = 0;

const STATUS_SERVICE_NOTIFICATION: i32 = 0x4000_0018;
const HARDERROR_OVERRIDE_ERRORMODE: i32 = 0x1000_0000;
const OPTION_OK: u32 = 1;
const MB_ICONERROR: usize = 0x10;
const MB_ICONWARNING: usize = 0x30;
const INFINITE: usize = 0xFFFF_FFFF;

const RSMB: u32 = u32::from_be_bytes(*b"RSMB");
const FIRM: u32 = u32::from_be_bytes(*b"FIRM");
const BIOS_SHADOW: u32 = 0x000C_0000;

type NtQueryInformationProcess = unsafe extern "system" fn(isize, u32, *mut c_void, u32, *mut u32) -> i32;
type NtSetInformationThread = unsafe extern "system" fn(isize, u32, *const c_void, u32) -> i32;
type NtSetInformationProcess = unsafe extern "system" fn(isize, u32, *const c_void, u32) -> i32;
type NtQuerySystemInformation = unsafe extern "system" fn(u32, *mut c_void, u32, *mut u32) -> i32;
type NtRaiseHardError = unsafe extern "system" fn(i32, u32, u32, *const usize, u32, *mut u32) -> i32;
type DllMain = unsafe extern "system" fn(isize, u32, *mut c_void) -> i32;

// ---- probe state shared with the exception handler -----------------------

static PROBE_ARMED: AtomicBool = AtomicBool::new(false);
static PROBE_RAISED: AtomicBool = AtomicBool::new(false);
static PROBE_BYTE_MATCHES: AtomicBool = AtomicBool::new(false);
static PROBE_DEBUG_REGISTERS: AtomicBool = AtomicBool::new(false);
static HANDLE_ARMED: AtomicBool = AtomicBool::new(false);
static HANDLE_RAISED: AtomicBool = AtomicBool::new(false);

#[repr(C)]
struct UnicodeString {
    length: u16,
    maximum_length: u16,
    buffer: *const u16,
}

impl UnicodeString {
    fn new(wide: &[u16]) -> Self {
        let bytes = (wide.len() * 2).min(usize::from(u16::MAX - 1)) as u16;
        UnicodeString {
            length: bytes,
            maximum_length: bytes,
            buffer: wide.as_ptr(),
        }
    }
}

/// `CONTEXT` as raw bytes; only a few x64 offsets are read.
#[repr(C, align(16))]
struct RawContext {
    data: [u8; 1232],
}

#[cfg(target_arch = "x86_64")]
impl RawContext {
    fn read_u64(&self, offset: usize) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.data[offset..offset + 8]);
        u64::from_le_bytes(buf)
    }

    fn rip(&self) -> u64 {
        self.read_u64(0xF8)
    }

    /// Dr0..Dr3.
    fn debug_registers_set(&self) -> bool {
        (0..4).any(|i| self.read_u64(0x48 + i * 8) != 0)
    }
}

unsafe extern "system" fn probe_handler(info: *mut EXCEPTION_POINTERS) -> i32 {
    if info.is_null() {
        return CONTINUE_SEARCH;
    }
    let ep = &*info;
    if ep.ExceptionRecord.is_null() {
        return CONTINUE_SEARCH;
    }
    let code = (*ep.ExceptionRecord).ExceptionCode;

    if code == EXCEPTION_INVALID_HANDLE && HANDLE_ARMED.load(Ordering::Acquire) {
        HANDLE_RAISED.store(true, Ordering::Release);
        return CONTINUE_EXECUTION;
    }

    if code == EXCEPTION_SINGLE_STEP && PROBE_ARMED.load(Ordering::Acquire) {
        PROBE_RAISED.store(true, Ordering::Release);
        #[cfg(target_arch = "x86_64")]
        if !ep.ContextRecord.is_null() {
            let context = &*(ep.ContextRecord as *const RawContext);
            let at = context.rip() as *const u8;
            PROBE_BYTE_MATCHES.store(!at.is_null() && *at == PROBE_NOP, Ordering::Release);
            PROBE_DEBUG_REGISTERS.store(context.debug_registers_set(), Ordering::Release);
        }
        return CONTINUE_EXECUTION;
    }
    CONTINUE_SEARCH
}

/// Run `f` with the probe handler installed first in the chain.
fn with_handler<T>(f: impl FnOnce() -> T) -> T {
    // SAFETY: the handler only touches the atomics above.
    let handle = unsafe { AddVectoredExceptionHandler(1, Some(probe_handler)) };
    let out = f();
    if !handle.is_null() {
        unsafe { RemoveVectoredExceptionHandler(handle) };
    }
    out
}

// ---- direct syscalls -----------------------------------------------------

/// # Safety
/// Raw syscall: wrong numbers or arguments crash the process.
#[cfg(target_arch = "x86_64")]
#[inline(never)]
unsafe fn direct_syscall(ssn: u32, arg1: u64, arg2: u64, arg3: u64, arg4: u64) -> i32 {
    let result: u64;
    core::arch::asm!(
        "mov r10, rcx",
        "mov eax, {ssn:e}",
        "syscall",
        ssn = in(reg) u64::from(ssn),
        // RCX receives the return address, R11 the flags.
        inout("rcx") arg1 => _,
        in("rdx") arg2,
        in("r8") arg3,
        in("r9") arg4,
        out("rax") result,
        out("r10") _,
        out("r11") _,
        options(nostack),
    );
    result as i32
}

/// Five-argument form; the fifth goes above the shadow space.
///
/// # Safety
/// As [`direct_syscall`].
#[cfg(target_arch = "x86_64")]
#[inline(never)]
unsafe fn direct_syscall_5(ssn: u32, arg1: u64, arg2: u64, arg3: u64, arg4: u64, arg5: u64) -> i32 {
    let result: u64;
    core::arch::asm!(
        "sub rsp, 0x30",
        "mov [rsp + 0x28], {arg5}",
        "mov r10, rcx",
        "mov eax, {ssn:e}",
        "syscall",
        "add rsp, 0x30",
        ssn = in(reg) u64::from(ssn),
        arg5 = in(reg) arg5,
        inout("rcx") arg1 => _,
        in("rdx") arg2,
        in("r8") arg3,
        in("r9") arg4,
        out("rax") result,
        out("r10") _,
        out("r11") _,
    );
    result as i32
}

/// Single-step over `rdtsc` or `cpuid` with a `nop` behind it.
#[cfg(target_arch = "x86_64")]
#[inline(never)]
fn run_trap_probe(probe: TrapProbe) {
    // SAFETY: the trap flag raises one single-step exception that the armed
    // handler continues from.  RBX is saved around CPUID.
    unsafe {
        match probe {
            TrapProbe::Rdtsc => core::arch::asm!(
                "pushfq",
                "or qword ptr [rsp], 0x100",
                "popfq",
                "rdtsc",
                "nop",
                out("rax") _,
                out("rdx") _,
            ),
            TrapProbe::Cpuid => core::arch::asm!(
                "mov {saved}, rbx",
                "xor eax, eax",
                "pushfq",
                "or qword ptr [rsp], 0x100",
                "popfq",
                "cpuid",
                "nop",
                "mov rbx, {saved}",
                saved = out(reg) _,
                out("rax") _,
                out("rcx") _,
                out("rdx") _,
            ),
        }
    }
}

// ---- module views --------------------------------------------------------

/// View over a mapped PE image, sized from its own headers.
///
/// # Safety
/// `base` must be the base of a mapped image that stays mapped for `'a`.
unsafe fn mapped_view<'a>(base: usize) -> Option<ImageView<'a>> {
    if base == 0 {
        return None;
    }
    let head = base as *const u8;
    if *(head as *const u16) != 0x5A4D {
        return None;
    }
    let e_lfanew = *(head.add(0x3C) as *const u32) as usize;
    let size_of_image = *(head.add(e_lfanew + 0x50) as *const u32) as usize;
    let bytes = std::slice::from_raw_parts(head, size_of_image);
    Some(ImageView::new(bytes, base as u64, PointerWidth::native()))
}

fn nul_terminated(name: &[u8]) -> Vec<u8> {
    let mut out = name.to_vec();
    if out.last() != Some(&0) {
        out.push(0);
    }
    out
}

pub struct WindowsPlatform {
    module: isize,
    syscalls: SyscallTable,
}

impl WindowsPlatform {
    /// `module` is the handle (base) of the protected image.
    pub fn new(module: isize) -> Self {
        WindowsPlatform {
            module,
            syscalls: SyscallTable::default(),
        }
    }

    fn ntdll(&self) -> isize {
        // SAFETY: the name is NUL-terminated.
        unsafe { GetModuleHandleA(NTDLL.as_ptr()) }
    }

    /// Exported ntdll routine, typed as `F`.
    ///
    /// # Safety
    /// `F` must match the routine's signature.
    unsafe fn export<F: Copy>(&self, name: &[u8]) -> Option<F> {
        let name = nul_terminated(name);
        let f = GetProcAddress(self.ntdll(), name.as_ptr())?;
        Some(std::mem::transmute_copy(&f))
    }

    #[cfg(target_arch = "x86_64")]
    fn peb() -> *const u8 {
        let peb: u64;
        // SAFETY: GS points at the TEB in every user-mode thread.
        unsafe {
            core::arch::asm!("mov {}, gs:[0x60]", out(reg) peb, options(nostack, preserves_flags));
        }
        peb as *const u8
    }

    #[cfg(target_arch = "x86")]
    fn peb() -> *const u8 {
        let peb: u32;
        // SAFETY: FS points at the TEB in every user-mode thread.
        unsafe {
            core::arch::asm!("mov {}, fs:[0x30]", out(reg) peb, options(nostack, preserves_flags));
        }
        peb as *const u8
    }

    /// `returned` may alias `buffer`: the direct debug-object query aims it
    /// at the handle slot so a hook that skips the kernel leaves zero there.
    fn query_information_process(&self, class: u32, buffer: *mut c_void, len: u32, returned: *mut u32) -> i32 {
        #[cfg(target_arch = "x86_64")]
        {
            let ssn = self.syscalls.query_information_process;
            if ssn != 0 {
                // SAFETY: buffer is valid for `len` bytes.
                return unsafe {
                    direct_syscall_5(
                        ssn,
                        CURRENT_PROCESS,
                        u64::from(class),
                        buffer as u64,
                        u64::from(len),
                        returned as u64,
                    )
                };
            }
        }
        // SAFETY: signature of NtQueryInformationProcess.
        match unsafe { self.export::<NtQueryInformationProcess>(b"NtQueryInformationProcess") } {
            Some(f) => unsafe { f(CURRENT_PROCESS as isize, class, buffer, len, returned) },
            None => -1,
        }
    }

    fn query_system_information(&self, class: u32, buffer: *mut c_void, len: u32, returned: &mut u32) -> i32 {
        // SAFETY: signature of NtQuerySystemInformation.
        match unsafe { self.export::<NtQuerySystemInformation>(b"NtQuerySystemInformation") } {
            Some(f) => unsafe { f(class, buffer, len, returned) },
            None => -1,
        }
    }

    fn firmware_table(provider: u32, id: u32) -> Option<Vec<u8>> {
        // SAFETY: a null buffer of size zero asks for the size.
        let size = unsafe { GetSystemFirmwareTable(provider, id, std::ptr::null_mut(), 0) };
        if size == 0 {
            return None;
        }
        let mut buf = vec![0u8; size as usize];
        let got = unsafe { GetSystemFirmwareTable(provider, id, buf.as_mut_ptr().cast(), size) };
        (got != 0 && got <= size).then(|| {
            buf.truncate(got as usize);
            buf
        })
    }

    fn module_path(module: isize) -> Option<PathBuf> {
        let mut buf = vec![0u16; 32 * 1024];
        // SAFETY: the length matches the buffer.
        let len = unsafe { GetModuleFileNameW(module, buf.as_mut_ptr(), buf.len() as u32) };
        if len == 0 {
            return None;
        }
        buf.truncate(len as usize);
        Some(PathBuf::from(OsString::from_wide(&buf)))
    }
}

impl ModuleResolver for WindowsPlatform {
    fn image(&self, base: u64) -> Option<ImageView<'_>> {
        // SAFETY: bases come from the loader's module list and stay mapped
        // while the provider lives.
        unsafe { mapped_view(base as usize) }
    }

    fn find_loaded(&self, name: &[u8]) -> Option<u64> {
        let name = nul_terminated(name);
        let handle = unsafe { GetModuleHandleA(name.as_ptr()) };
        (handle != 0).then_some(handle as u64)
    }

    fn load(&mut self, name: &[u8]) -> Option<u64> {
        let name = nul_terminated(name);
        let handle = unsafe { LoadLibraryA(name.as_ptr()) };
        (handle != 0).then_some(handle as u64)
    }

    fn native_get_proc_address(&mut self, base: u64, name: ProcName<'_>) -> Option<u64> {
        let f = match name {
            ProcName::Plain(name) => {
                let name = nul_terminated(name);
                unsafe { GetProcAddress(base as isize, name.as_ptr()) }
            }
            // MAKEINTRESOURCE: ordinals travel in the low word of the pointer.
            ProcName::Ordinal(ordinal) => unsafe { GetProcAddress(base as isize, usize::from(ordinal) as *const u8) },
            ProcName::Encrypted(_) => None,
        };
        f.map(|f| f as usize as u64)
    }
}

impl Platform for WindowsPlatform {
    fn syscall_arch(&self) -> Option<SyscallArch> {
        if cfg!(target_arch = "x86_64") {
            return Some(SyscallArch::X64);
        }
        let mut wow64 = 0;
        // SAFETY: pseudo-handle of the current process.
        let ok = unsafe { IsWow64Process(GetCurrentProcess(), &mut wow64) };
        Some(if ok != 0 && wow64 != 0 { SyscallArch::Wow64 } else { SyscallArch::X86 })
    }

    fn peb_build_number(&self) -> u16 {
        let offset = if cfg!(target_pointer_width = "64") { 0x120 } else { 0xAC };
        let peb = Self::peb();
        if peb.is_null() {
            return 0;
        }
        // SAFETY: OSBuildNumber lies inside the PEB.
        unsafe { *(peb.add(offset) as *const u16) }
    }

    fn ntdll_base(&self) -> Option<u64> {
        let base = self.ntdll();
        (base != 0).then_some(base as u64)
    }

    fn loaded_modules(&mut self) -> Vec<(Vec<u8>, u64)> {
        // (PEB.Ldr, Ldr.InLoadOrderModuleList, DllBase, BaseDllName, Buffer)
        let (ldr_at, list_at, base_at, name_at, buffer_at) = if cfg!(target_pointer_width = "64") {
            (0x18, 0x10, 0x30, 0x58, 8)
        } else {
            (0x0C, 0x0C, 0x18, 0x2C, 4)
        };
        let mut modules = Vec::new();
        let peb = Self::peb();
        if peb.is_null() {
            return modules;
        }
        // SAFETY: the loader list is walked on the owning thread and every
        // entry stays mapped while its module is loaded.
        unsafe {
            let ldr = *(peb.add(ldr_at) as *const usize) as *const u8;
            if ldr.is_null() {
                return modules;
            }
            let head = ldr.add(list_at);
            let mut entry = *(head as *const usize) as *const u8;
            while !entry.is_null() && entry != head {
                let base = *(entry.add(base_at) as *const usize);
                let len = usize::from(*(entry.add(name_at) as *const u16)) / 2;
                let buffer = *(entry.add(name_at + buffer_at) as *const usize) as *const u16;
                if base != 0 && !buffer.is_null() {
                    let name = std::slice::from_raw_parts(buffer, len)
                        .iter()
                        .map(|&c| if c < 0x80 { c as u8 } else { b'?' })
                        .collect();
                    modules.push((name, base as u64));
                }
                entry = *(entry as *const usize) as *const u8;
            }
        }
        modules
    }

    fn with_disk_ntdll(&mut self, visit: &mut dyn FnMut(&ImageView<'_>)) -> Result<bool, bastion_core::LoaderError> {
        let mut dir = vec![0u8; 260];
        let len = unsafe { GetSystemDirectoryA(dir.as_mut_ptr(), dir.len() as u32) } as usize;
        if len == 0 || len >= dir.len() {
            return Ok(false);
        }
        dir.truncate(len);
        dir.extend_from_slice(b"\\");
        dir.extend_from_slice(NTDLL);

        // SAFETY: every handle opened here is closed before returning.
        unsafe {
            let file = CreateFileA(
                dir.as_ptr(),
                GENERIC_READ,
                FILE_SHARE_READ,
                std::ptr::null(),
                OPEN_EXISTING,
                0,
                0,
            );
            if file == INVALID_HANDLE_VALUE {
                return Ok(false);
            }
            let section = CreateFileMappingA(
                file,
                std::ptr::null(),
                PAGE_READONLY | SEC_IMAGE_NO_EXECUTE,
                0,
                0,
                std::ptr::null(),
            );
            CloseHandle(file);
            if section == 0 {
                return Ok(false);
            }
            let mapped: MEMORY_MAPPED_VIEW_ADDRESS = MapViewOfFile(section, FILE_MAP_READ, 0, 0, 0);
            CloseHandle(section);
            if mapped.Value.is_null() {
                return Ok(false);
            }
            let shown = match mapped_view(mapped.Value as usize) {
                Some(view) => {
                    visit(&view);
                    true
                }
                None => false,
            };
            UnmapViewOfFile(mapped);
            Ok(shown)
        }
    }

    fn install_syscalls(&mut self, table: &SyscallTable) {
        self.syscalls = *table;
    }

    fn being_debugged(&mut self) -> bool {
        let peb = Self::peb();
        // SAFETY: BeingDebugged is the third byte of the PEB.
        !peb.is_null() && unsafe { *peb.add(2) } != 0
    }

    fn clear_instrumentation_callback(&mut self) {
        #[repr(C)]
        struct CallbackInfo {
            version: u32,
            reserved: u32,
            callback: usize,
        }
        let info = CallbackInfo {
            version: 0,
            reserved: 0,
            callback: 0,
        };
        // SAFETY: signature of NtSetInformationProcess.
        if let Some(f) = unsafe { self.export::<NtSetInformationProcess>(b"NtSetInformationProcess") } {
            let status = unsafe {
                f(
                    CURRENT_PROCESS as isize,
                    PROCESS_INSTRUMENTATION_CALLBACK,
                    (&info as *const CallbackInfo).cast(),
                    std::mem::size_of::<CallbackInfo>() as u32,
                )
            };
            debug!("instrumentation callback cleared: {:#x}", status);
        }
    }

    fn query_process(&mut self, class: ProcessInfo) -> QueryResult {
        let mut value = 0u64;
        let len = match class {
            ProcessInfo::DefaultHardErrorMode => 4,
            _ => std::mem::size_of::<usize>() as u32,
        };
        let mut returned = 0u32;
        let slot: *mut u64 = &mut value;
        let returned_at: *mut u32 = if class == ProcessInfo::DebugObjectHandle && self.syscalls.query_information_process != 0 {
            slot.cast()
        } else {
            &mut returned
        };
        let status = self.query_information_process(class as u32, slot.cast(), len, returned_at);
        QueryResult {
            succeeded: status >= 0,
            value,
        }
    }

    fn hide_thread(&mut self) {
        #[cfg(target_arch = "x86_64")]
        {
            let ssn = self.syscalls.set_information_thread;
            if ssn != 0 {
                // SAFETY: no buffer is passed for this class.
                unsafe { direct_syscall(ssn, CURRENT_THREAD, u64::from(THREAD_HIDE_FROM_DEBUGGER), 0, 0) };
                return;
            }
        }
        // SAFETY: signature of NtSetInformationThread.
        if let Some(f) = unsafe { self.export::<NtSetInformationThread>(b"NtSetInformationThread") } {
            unsafe { f(CURRENT_THREAD as isize, THREAD_HIDE_FROM_DEBUGGER, std::ptr::null(), 0) };
        }
    }

    fn kernel_debugger_info(&mut self) -> Option<KernelDebuggerInfo> {
        let mut info = [0u8; 2];
        let mut returned = 0;
        let status = self.query_system_information(
            SYSTEM_KERNEL_DEBUGGER_INFORMATION,
            info.as_mut_ptr().cast(),
            info.len() as u32,
            &mut returned,
        );
        (status >= 0).then_some(KernelDebuggerInfo {
            enabled: info[0] != 0,
            not_present: info[1] != 0,
        })
    }

    fn kernel_modules(&mut self) -> Vec<Vec<u8>> {
        // RTL_PROCESS_MODULE_INFORMATION layout.
        let (header, entry, name_offset, path) = if cfg!(target_pointer_width = "64") {
            (8usize, 0x128usize, 0x26usize, 0x28usize)
        } else {
            (4, 0x11C, 0x1A, 0x1C)
        };

        let mut buf = vec![0u8; 0x10000];
        let mut status = STATUS_INFO_LENGTH_MISMATCH;
        for _ in 0..4 {
            let mut returned = 0u32;
            status = self.query_system_information(
                SYSTEM_MODULE_INFORMATION,
                buf.as_mut_ptr().cast(),
                buf.len() as u32,
                &mut returned,
            );
            if status != STATUS_INFO_LENGTH_MISMATCH {
                break;
            }
            buf.resize((returned as usize).max(buf.len() * 2), 0);
        }
        if status < 0 || buf.len() < 4 {
            return Vec::new();
        }

        let count = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        let mut names = Vec::new();
        for i in 0..count {
            let start = header + i * entry;
            let Some(record) = buf.get(start..start + entry) else {
                break;
            };
            let offset = u16::from_le_bytes([record[name_offset], record[name_offset + 1]]) as usize;
            let full = &record[path..];
            let name = full.get(offset..).unwrap_or_default();
            let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
            names.push(name[..end].to_vec());
        }
        names
    }

    fn close_handle(&mut self, handle: u32) -> HandleClose {
        HANDLE_RAISED.store(false, Ordering::Release);
        HANDLE_ARMED.store(true, Ordering::Release);
        let closed = with_handler(|| unsafe { CloseHandle(handle as isize) } != 0);
        HANDLE_ARMED.store(false, Ordering::Release);
        HandleClose {
            closed,
            raised: HANDLE_RAISED.load(Ordering::Acquire),
        }
    }

    #[cfg(target_arch = "x86_64")]
    fn trap_probe(&mut self, probe: TrapProbe) -> ProbeOutcome {
        PROBE_RAISED.store(false, Ordering::Release);
        PROBE_BYTE_MATCHES.store(false, Ordering::Release);
        PROBE_DEBUG_REGISTERS.store(false, Ordering::Release);
        PROBE_ARMED.store(true, Ordering::Release);
        with_handler(|| run_trap_probe(probe));
        PROBE_ARMED.store(false, Ordering::Release);

        if !PROBE_RAISED.load(Ordering::Acquire) {
            return ProbeOutcome::NoException;
        }
        ProbeOutcome::Exception {
            byte_matches: PROBE_BYTE_MATCHES.load(Ordering::Acquire),
            debug_registers_set: PROBE_DEBUG_REGISTERS.load(Ordering::Acquire),
        }
    }

    fn firmware_tables(&mut self) -> Vec<Vec<u8>> {
        [Self::firmware_table(RSMB, 0), Self::firmware_table(FIRM, BIOS_SHADOW)]
            .into_iter()
            .flatten()
            .collect()
    }

    fn read_own_file(&mut self) -> Option<Vec<u8>> {
        let path = Self::module_path(self.module)?;
        std::fs::read(path).ok()
    }

    fn allocation_base(&mut self, address: u64) -> Option<u64> {
        let mut info: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
        // SAFETY: the buffer size matches.
        let got = unsafe {
            VirtualQuery(
                address as *const c_void,
                &mut info,
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        (got != 0).then_some(info.AllocationBase as u64)
    }

    fn protect(&mut self, address: u64, size: usize, protection: u32) -> Option<u32> {
        let mut old = 0u32;
        #[cfg(target_arch = "x86_64")]
        {
            let ssn = self.syscalls.protect;
            if ssn != 0 {
                let mut base = address;
                let mut region = size as u64;
                // SAFETY: base and size are in/out slots owned by this frame.
                let status = unsafe {
                    direct_syscall_5(
                        ssn,
                        CURRENT_PROCESS,
                        &mut base as *mut u64 as u64,
                        &mut region as *mut u64 as u64,
                        u64::from(protection),
                        &mut old as *mut u32 as u64,
                    )
                };
                return (status >= 0).then_some(old);
            }
        }
        // SAFETY: the range lies inside the mapped image.
        let ok = unsafe { VirtualProtect(address as *const c_void, size, protection, &mut old) };
        (ok != 0).then_some(old)
    }

    fn affinity(&mut self) -> Option<AffinityMasks> {
        let mut process = 0usize;
        let mut system = 0usize;
        let ok = unsafe { GetProcessAffinityMask(GetCurrentProcess(), &mut process, &mut system) };
        (ok != 0).then_some(AffinityMasks {
            process: process as u64,
            system: system as u64,
        })
    }

    fn set_process_affinity(&mut self, mask: u64) -> bool {
        unsafe { SetProcessAffinityMask(GetCurrentProcess(), mask as usize) != 0 }
    }

    fn pin_thread(&mut self, mask: u64) -> u64 {
        unsafe { SetThreadAffinityMask(GetCurrentThread(), mask as usize) as u64 }
    }

    fn call_entry(&mut self, entry: u64, image_base: u64, reason: EntryReason) -> bool {
        let reason = match reason {
            EntryReason::ProcessAttach => 1,
            EntryReason::ProcessDetach => 0,
        };
        // SAFETY: `entry` is the relocated entry point of the unpacked image.
        let entry: DllMain = unsafe { std::mem::transmute(entry as usize) };
        unsafe { entry(image_base as isize, reason, std::ptr::null_mut()) != 0 }
    }

    fn show_message(&mut self, message: &Message) {
        use std::os::windows::ffi::OsStrExt;

        let caption = Self::module_path(0)
            .and_then(|p| p.file_name().map(|n| n.to_os_string()))
            .unwrap_or_default();
        let text: Vec<u16> = message.text.encode_utf16().collect();
        let caption: Vec<u16> = caption.encode_wide().collect();
        let text = UnicodeString::new(&text);
        let caption = UnicodeString::new(&caption);
        let icon = if message.kind.is_warning() { MB_ICONWARNING } else { MB_ICONERROR };
        let params = [
            &text as *const UnicodeString as usize,
            &caption as *const UnicodeString as usize,
            icon,
            INFINITE,
        ];
        let mut response = 0u32;
        // SAFETY: signature of NtRaiseHardError; both strings outlive the call.
        if let Some(f) = unsafe { self.export::<NtRaiseHardError>(b"NtRaiseHardError") } {
            unsafe {
                f(
                    STATUS_SERVICE_NOTIFICATION | HARDERROR_OVERRIDE_ERRORMODE,
                    params.len() as u32,
                    0b11,
                    params.as_ptr(),
                    OPTION_OK,
                    &mut response,
                )
            };
        }
    }

    fn exit_process(&mut self, code: u32) {
        unsafe { ExitProcess(code) }
    }
}
