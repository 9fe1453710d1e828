//! `SetupImage` / `FreeImage`.
//!
//! [`Loader::setup_image`] runs the bootstrap pipeline over the mapped image
//! once, publishes the `GlobalData` record, and hands control to the wrapped
//! entry point.  Every step is a method on [`Run`], which borrows the
//! platform, the descriptor and the image for the duration of one call.
//! The first error ends the run: its message is shown and the status stays
//! `Error`.

use log::{debug, info, warn};

use bastion_core::cpu::{affinity_bits, cpu_hash, CpuHashSet};
use bastion_core::crypto::StringCipher;
use bastion_core::descriptor::{packer_units, read_table, SectionInfo};
use bastion_core::detect::{
    debug_object_finding_direct, debug_object_finding_exported, debug_port_finding, firmware_finding,
    hypervisor_finding, invalid_handle_finding, kernel_debugger_finding, kernel_module_finding,
    parse_tracer_pid, stub_breakpoint_finding, tracer_finding, trap_probe_debugger_finding,
    vm_probe_verdict, VmProbeVerdict, BOGUS_HANDLE, CPUID_HYPERVISOR_BIT,
};
use bastion_core::fixup::{apply_fixups, apply_relocations, copy_iat};
use bastion_core::integrity::{verify_file, verify_table};
use bastion_core::pe::{export_stub, NtHeaders};
use bastion_core::protect::{final_protection, old_protection_is_trap, writable_protection, ProtectPass};
use bastion_core::{
    format_message, Descriptor, Evidence, Finding, GlobalData, GlobalSlot, HostFamily, ImageViewMut,
    InitCode, LoaderError, LoaderOptions, LoaderStatus, LzmaDecoder, LzmaProperties, MessageArg,
    MessageKind, Syscall, SyscallArch, SyscallTable, TableRef,
};

use crate::imports::{self, resolve_internal_imports, resolve_module_imports};
use crate::platform::{session_key, EntryReason, Indirect, Phase, Platform, ProcessInfo, TrapProbe};
use crate::syscalls::resolve_syscalls;

/// Exit code used when teardown follows a failed setup.
pub const EXIT_CODE: u32 = 0xDEAD_C0DE;

const SECTION_INFO_SIZE: u32 = 12;

const SBIEDLL: [u8; 11] = [b'S', b'b', b'i', b'e', b'D', b'l', b'l', b'.', b'd', b'l', b'l'];

/// Stubs the file pass calls when no service numbers are known.
const FILE_STUBS: [Syscall; 5] = [
    Syscall::Close,
    Syscall::OpenFile,
    Syscall::CreateSection,
    Syscall::MapViewOfSection,
    Syscall::UnmapViewOfSection,
];

/// Owner of one protected image's loader state.
pub struct Loader<P: Platform> {
    platform: P,
    descriptor: Descriptor,
    slot: GlobalSlot,
}

impl<P: Platform> Loader<P> {
    pub fn new(platform: P, descriptor: Descriptor) -> Self {
        Loader {
            platform,
            descriptor,
            slot: GlobalSlot::new(),
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    /// The published record, once setup got that far.
    pub fn global(&self) -> Option<&GlobalData> {
        self.slot.load()
    }

    /// `LoaderGetModuleHandle`: a loaded module by encrypted name.
    pub fn get_module_handle(&mut self, encrypted: &[u8]) -> Option<u64> {
        let cipher = StringCipher::new(self.descriptor.string_key);
        imports::loader_get_module_handle(&mut self.platform, encrypted, &cipher)
    }

    /// Bootstrap the image.  A second call returns the status of the first
    /// without running anything.
    pub fn setup_image(&mut self, image: &mut [u8]) -> LoaderStatus {
        if let Some(data) = self.slot.load() {
            debug!("image already set up");
            return data.loader_status();
        }

        let width = self.platform.pointer_width();
        let image = ImageViewMut::new(image, self.descriptor.image_base, width);
        if let Some(status) = published_status(&image, self.descriptor.storage) {
            debug!("image already set up by an earlier load");
            return status;
        }
        let mut run = Run::new(&mut self.platform, &self.descriptor, image);

        let data = Box::new(GlobalData::new());
        if let Err(err) = run.bootstrap(&data) {
            run.fail(&err);
            return LoaderStatus::Error;
        }

        run.phase(Phase::PublishState);
        let address = self.slot.commit(data);
        info!("loader state published at {:#x}", address);
        let Some(data) = self.slot.load() else {
            return LoaderStatus::Error;
        };

        match run.publish(address).and_then(|()| run.finish(data)) {
            Ok(()) => {
                data.set_loader_status(LoaderStatus::Success);
                LoaderStatus::Success
            }
            Err(err) => {
                run.fail(&err);
                LoaderStatus::Error
            }
        }
    }

    /// Record the driver unload routine displaced by a successful setup.
    /// Ignored before publication or after a failure.
    pub fn set_driver_unload(&self, routine: u64) -> bool {
        match self.slot.load() {
            Some(data) if data.loader_status().is_success() => {
                data.set_driver_unload(routine);
                true
            }
            _ => false,
        }
    }

    /// Tear down: notify the wrapped entry point, release the record, and
    /// terminate the process if setup had failed and the image asks for it.
    pub fn free_image(&mut self, image: &mut [u8]) {
        let image_base = self.descriptor.image_base;
        let mut status = LoaderStatus::Error;

        let published = self
            .slot
            .load()
            .map(|data| (data.driver_unload(), data.loader_status()));
        if let Some((unload, recorded)) = published {
            if unload != 0 {
                self.platform.call_driver_unload(unload);
            }
            if self.descriptor.runtime_entry != 0 {
                let entry = image_base.wrapping_add(u64::from(self.descriptor.runtime_entry));
                self.platform.call_entry(entry, image_base, EntryReason::ProcessDetach);
            }
            status = recorded;

            let width = self.platform.pointer_width();
            let mut view = ImageViewMut::new(image, image_base, width);
            if let Err(e) = view.write_ptr(u64::from(self.descriptor.storage), 0) {
                debug!("cannot clear storage slot: {}", e);
            }
            drop(self.slot.take());
            info!("loader state released");
        }

        let forced = self.platform.host() == HostFamily::Unix;
        if status == LoaderStatus::Error
            && (forced || self.descriptor.options.contains(LoaderOptions::EXIT_PROCESS))
        {
            warn!("terminating after failed setup");
            self.platform.exit_process(EXIT_CODE);
        }
    }
}

/// One pass of `setup_image`.
struct Run<'a, P: Platform> {
    platform: &'a mut P,
    descriptor: &'a Descriptor,
    image: ImageViewMut<'a>,
    cipher: StringCipher,
    host: HostFamily,
    arch: Option<SyscallArch>,
    syscalls: SyscallTable,
    cpu_salt: u64,
    crc_image_size: u32,
}

impl<'a, P: Platform> Run<'a, P> {
    fn new(platform: &'a mut P, descriptor: &'a Descriptor, image: ImageViewMut<'a>) -> Self {
        let host = platform.host();
        let arch = platform.syscall_arch();
        Run {
            platform,
            descriptor,
            image,
            cipher: StringCipher::new(descriptor.string_key),
            host,
            arch,
            syscalls: SyscallTable::default(),
            cpu_salt: 0,
            crc_image_size: 0,
        }
    }

    fn phase(&mut self, phase: Phase) {
        debug!("phase {:?}", phase);
        self.platform.on_phase(phase);
    }

    fn options(&self) -> LoaderOptions {
        self.descriptor.options
    }

    fn strict_debugger(&self) -> bool {
        self.options().contains(LoaderOptions::CHECK_DEBUGGER)
    }

    // ---- policies --------------------------------------------------------

    /// Debugger evidence outside the dedicated passes: fatal when debugger
    /// checks are on, recorded otherwise.
    fn debugger_policy(&self, data: &GlobalData, finding: Finding) -> Result<(), LoaderError> {
        if !finding.found {
            return Ok(());
        }
        if self.strict_debugger() {
            debug!("debugger: {}", finding.evidence);
            return Err(LoaderError::DebuggerFound);
        }
        warn!("debugger evidence recorded: {}", finding.evidence);
        data.set_is_debugger_detected(true);
        Ok(())
    }

    fn patch_policy(&self, data: &GlobalData, valid: bool, what: &str) -> Result<(), LoaderError> {
        if valid {
            return Ok(());
        }
        if self.options().contains(LoaderOptions::CHECK_PATCH) {
            debug!("{} checksum mismatch", what);
            return Err(LoaderError::FileCorrupted);
        }
        warn!("{} checksum mismatch recorded", what);
        data.set_is_patch_detected(true);
        Ok(())
    }

    /// Will `call` go through the exported ntdll stub?
    fn uses_export(&self, call: Syscall) -> bool {
        self.arch.is_some() && self.syscalls.get(call) == 0
    }

    /// Look at the first byte of each exported stub about to be called.
    fn check_stubs(&self, calls: &[Syscall]) -> Result<Finding, LoaderError> {
        let missing = LoaderError::Initialization(InitCode::InternalGpa);
        let base = self.platform.ntdll_base().ok_or_else(|| missing.clone())?;
        let view = self.platform.image(base).ok_or_else(|| missing.clone())?;
        let mut finding = Finding::new(false, Evidence::ApiBreakpoint);
        for call in calls {
            let stub = export_stub(&view, call.export_name()).ok_or_else(|| missing.clone())?;
            let f = stub_breakpoint_finding(stub.first().copied().unwrap_or(0));
            if f.found {
                finding = f;
            }
        }
        Ok(finding)
    }

    fn fail(&mut self, err: &LoaderError) {
        debug!("setup failed: {:?}", err.message_kind());
        let Some(kind) = err.message_kind() else {
            return;
        };
        match err {
            LoaderError::Initialization(code) => self.show(kind, &[MessageArg::Number(u64::from(*code as u32))]),
            LoaderError::ProcNotFound { api, dll } => {
                self.show(kind, &[MessageArg::Plain(api.as_bytes()), MessageArg::Plain(dll.as_bytes())])
            }
            LoaderError::OrdinalNotFound { ordinal, dll } => {
                self.show(kind, &[MessageArg::Number(u64::from(*ordinal)), MessageArg::Plain(dll.as_bytes())])
            }
            _ => self.show(kind, &[]),
        }
    }

    fn show(&mut self, kind: MessageKind, args: &[MessageArg<'_>]) {
        let rva = self.descriptor.messages.rva(kind);
        if rva == 0 {
            return;
        }
        let view = self.image.view();
        let Ok(template) = view.tail(u64::from(rva)) else {
            return;
        };
        if let Some(message) = format_message(&self.cipher, kind, template, args) {
            self.platform.show_message(&message);
        }
    }

    // ---- bootstrap -------------------------------------------------------

    fn bootstrap(&mut self, data: &GlobalData) -> Result<(), LoaderError> {
        self.phase(Phase::Start);
        data.set_loader_crc_info(self.descriptor.loader_crc_info);

        self.phase(Phase::ResolveSyscalls);
        self.settle_syscalls(data)?;

        self.phase(Phase::DetectAnalysisPre);
        if self.strict_debugger() {
            self.debugger_pre_pass()?;
        }
        if self.options().contains(LoaderOptions::CHECK_KERNEL_DEBUGGER) {
            self.kernel_debugger_pass()?;
        }

        self.phase(Phase::VerifyLoader);
        self.verify_loader(data)?;

        self.phase(Phase::VerifyFile);
        self.verify_file(data)?;

        self.phase(Phase::MakeWritable);
        self.make_writable(data)?;

        self.phase(Phase::Unpack);
        self.unpack()?;

        self.phase(Phase::Relocate);
        let delta = self.descriptor.delta_base();
        if delta != 0 {
            apply_fixups(&mut self.image, self.descriptor.fixup_info, delta, self.platform.flavor())?;
        }
        copy_iat(&mut self.image, self.descriptor.iat_info)?;

        self.phase(Phase::ResolveStaticImports);
        resolve_module_imports(&mut *self.platform, &mut self.image, self.descriptor.import_info, &self.cipher)?;

        self.phase(Phase::ResolveInternalImports);
        resolve_internal_imports(&mut self.image, self.descriptor.internal_import_info)?;
        let flavor = self.platform.flavor();
        let mut indirect = Indirect(&mut *self.platform);
        apply_relocations(&mut self.image, self.descriptor.relocation_info, flavor, &mut indirect)?;

        self.phase(Phase::DetectAnalysisPost);
        if self.strict_debugger() && self.host == HostFamily::Windows {
            self.debugger_post_pass()?;
        }

        self.phase(Phase::DetectVm);
        if self.options().contains(LoaderOptions::CHECK_VIRTUAL_MACHINE) {
            self.detect_vm(data)?;
        }

        self.phase(Phase::VerifyMemory);
        self.verify_memory(data)?;

        self.phase(Phase::BindCpu);
        self.bind_cpu(data)?;

        data.set_session_key(session_key(self.platform.timestamp()));
        Ok(())
    }

    fn settle_syscalls(&mut self, data: &GlobalData) -> Result<(), LoaderError> {
        let Some(arch) = self.arch else {
            return Ok(());
        };
        let resolution = resolve_syscalls(&mut *self.platform, arch)?;
        self.cpu_salt = resolution.cpu_salt;
        if resolution.unknown_build {
            self.debugger_policy(data, Finding::hit(Evidence::UnknownBuild))?;
        }
        data.set_os_build_number(resolution.build);
        self.syscalls = resolution.table;
        self.platform.install_syscalls(&resolution.table);
        Ok(())
    }

    fn debugger_pre_pass(&mut self) -> Result<(), LoaderError> {
        fatal(Finding::new(self.platform.being_debugged(), Evidence::BeingDebugged))?;

        if self.arch.is_some() {
            if self.uses_export(Syscall::QueryInformationProcess) {
                fatal(self.check_stubs(&[Syscall::QueryInformationProcess])?)?;
                let port = self.platform.query_process(ProcessInfo::DebugPort);
                fatal(debug_port_finding(port.succeeded, port.value))?;
                let object = self.platform.query_process(ProcessInfo::DebugObjectHandle);
                fatal(debug_object_finding_exported(object.succeeded))?;
            } else {
                self.platform.clear_instrumentation_callback();
                let port = self.platform.query_process(ProcessInfo::DebugPort);
                fatal(debug_port_finding(port.succeeded, port.value))?;
                let object = self.platform.query_process(ProcessInfo::DebugObjectHandle);
                fatal(debug_object_finding_direct(object.succeeded, object.value))?;
            }
            if self.uses_export(Syscall::SetInformationThread) {
                fatal(self.check_stubs(&[Syscall::SetInformationThread])?)?;
            }
            self.platform.hide_thread();
        }

        if let Some(status) = self.platform.proc_status() {
            fatal(tracer_finding(parse_tracer_pid(&status)))?;
        }
        Ok(())
    }

    fn kernel_debugger_pass(&mut self) -> Result<(), LoaderError> {
        if let Some(info) = self.platform.kernel_debugger_info() {
            fatal(kernel_debugger_finding(info.enabled, info.not_present))?;
        }
        let modules = self.platform.kernel_modules();
        fatal(kernel_module_finding(modules.iter().map(Vec::as_slice)))
    }

    fn verify_loader(&mut self, data: &GlobalData) -> Result<(), LoaderError> {
        let view = self.image.view();
        let table = self.descriptor.loader_crc(&view);
        if !table.is_empty() {
            let hash = self.descriptor.loader_crc_hash(&view);
            let report = verify_table(&view, table, hash, self.descriptor.crc_salt)?;
            data.set_loader_crc_size(table.size);
            data.set_loader_crc_hash(hash);
            self.patch_policy(data, report.valid, "loader")?;
        }

        if self.strict_debugger() && self.arch.is_some() {
            let port = self.platform.query_process(ProcessInfo::DebugPort);
            fatal(debug_port_finding(port.succeeded, port.value))?;
            self.platform.hide_thread();
        }
        Ok(())
    }

    fn verify_file(&mut self, data: &GlobalData) -> Result<(), LoaderError> {
        let table = self.descriptor.file_crc(&self.image.view());
        if table.is_empty() {
            return Ok(());
        }
        if self.uses_export(Syscall::OpenFile) {
            let finding = self.check_stubs(&FILE_STUBS)?;
            self.debugger_policy(data, finding)?;
        }
        let Some(file) = self.platform.read_own_file() else {
            debug!("own file unavailable, file check skipped");
            return Ok(());
        };
        let report = verify_file(&self.image.view(), table, &file, self.descriptor.crc_salt)?;
        self.patch_policy(data, report.valid, "file")
    }

    fn sections(&self) -> Result<Vec<SectionInfo>, LoaderError> {
        Ok(read_table::<SectionInfo>(&self.image.view(), self.descriptor.section_info)?)
    }

    /// Apply `protection(kind)` to every section, watching the previous
    /// protection for planted breakpoints.
    fn protect_sections(
        &mut self,
        data: &GlobalData,
        pass: ProtectPass,
        protection: fn(u32, HostFamily) -> u32,
    ) -> Result<(), LoaderError> {
        let sections = self.sections()?;
        if sections.is_empty() {
            return Ok(());
        }
        if self.uses_export(Syscall::ProtectVirtualMemory) {
            let finding = self.check_stubs(&[Syscall::ProtectVirtualMemory])?;
            self.debugger_policy(data, finding)?;
        }
        for s in &sections {
            let address = self.image.view().address_of(u64::from(s.address));
            let old = self
                .platform
                .protect(address, s.size as usize, protection(s.kind, self.host))
                .ok_or(LoaderError::Initialization(InitCode::VirtualProtect))?;
            if self.host == HostFamily::Windows && old_protection_is_trap(old, pass) {
                self.debugger_policy(data, Finding::hit(Evidence::MemoryBreakpoint))?;
            }
        }
        Ok(())
    }

    fn make_writable(&mut self, data: &GlobalData) -> Result<(), LoaderError> {
        self.protect_sections(data, ProtectPass::MakeWritable, writable_protection)
    }

    fn unpack(&mut self) -> Result<(), LoaderError> {
        let table = self.descriptor.packer_info;
        if table.is_empty() {
            return Ok(());
        }
        let tls_slot = u64::from(self.descriptor.tls_index_info);
        let tls_index = if tls_slot != 0 {
            Some(self.image.view().read_u32(tls_slot)?)
        } else {
            None
        };

        let view = self.image.view();
        let (props, units) = packer_units(&view, table)?;
        let props = LzmaProperties::decode(view.range(u64::from(props.src), props.dst as usize)?)?;
        let mut decoder = LzmaDecoder::new(props)?;
        let mut unpacked = 0usize;
        for unit in &units {
            let (bytes, _) = {
                let view = self.image.view();
                let input = view.tail(u64::from(unit.src))?;
                let room = view.len().saturating_sub(unit.dst as usize);
                decoder.decode_unit(input, room)?
            };
            self.image.write_bytes(u64::from(unit.dst), &bytes)?;
            unpacked += bytes.len();
        }
        debug!("unpacked {} units, {} bytes", units.len(), unpacked);

        if let Some(index) = tls_index {
            self.image.write_u32(tls_slot, index)?;
        }
        Ok(())
    }

    fn debugger_post_pass(&mut self) -> Result<(), LoaderError> {
        let close = self.platform.close_handle(BOGUS_HANDLE);
        fatal(invalid_handle_finding(close.closed, close.raised))?;
        fatal(trap_probe_debugger_finding(self.platform.trap_probe(TrapProbe::Rdtsc)))
    }

    fn detect_vm(&mut self, data: &GlobalData) -> Result<(), LoaderError> {
        let host = self.host;
        let leaf1 = self.platform.cpuid(1);
        if leaf1.ecx & CPUID_HYPERVISOR_BIT != 0 {
            // A Hyper-V root partition passes; the probes below would
            // misread its intercepted CPUID.
            let platform = &mut *self.platform;
            if hypervisor_finding(leaf1, host, |leaf| platform.cpuid(leaf)).found {
                debug!("virtual machine: {}", Evidence::Hypervisor);
                return Err(LoaderError::VirtualMachineFound);
            }
            return Ok(());
        }

        if host == HostFamily::Windows {
            for probe in [TrapProbe::Rdtsc, TrapProbe::Cpuid] {
                match vm_probe_verdict(self.platform.trap_probe(probe)) {
                    VmProbeVerdict::Clean => {}
                    VmProbeVerdict::Debugger => self.debugger_policy(data, Finding::hit(Evidence::SingleStep))?,
                    VmProbeVerdict::VirtualMachine => {
                        debug!("virtual machine: {:?} probe faulted late", probe);
                        return Err(LoaderError::VirtualMachineFound);
                    }
                }
            }
        }

        for blob in self.platform.firmware_tables() {
            if let Some(finding) = firmware_finding(&blob, host) {
                debug!("virtual machine: {}", finding.evidence);
                return Err(LoaderError::VirtualMachineFound);
            }
        }

        if host == HostFamily::Windows && self.platform.find_loaded(&SBIEDLL).is_some() {
            debug!("virtual machine: {}", Evidence::Sandbox);
            return Err(LoaderError::VirtualMachineFound);
        }
        Ok(())
    }

    fn verify_memory(&mut self, data: &GlobalData) -> Result<(), LoaderError> {
        let table = self.descriptor.memory_crc_info;
        if table.is_empty() {
            return Ok(());
        }
        let image_base = self.descriptor.image_base;
        let mut valid = true;

        if self.host == HostFamily::Windows {
            // The record and the page after the image must belong to other
            // allocations; a dump re-hosted in one block fails both.
            if self.platform.allocation_base(data.anchor()) == Some(image_base) {
                valid = false;
            }
            let size_of_image = NtHeaders::parse(&self.image.view()).map(|nt| nt.size_of_image);
            if let Some(size) = size_of_image {
                let after = image_base.wrapping_add(u64::from(size));
                if self.platform.allocation_base(after) == Some(image_base) {
                    valid = false;
                }
            }
        }

        let report = verify_table(
            &self.image.view(),
            table,
            self.descriptor.memory_crc_info_hash,
            self.descriptor.crc_salt,
        )?;
        self.crc_image_size = report.crc_image_size;
        self.patch_policy(data, valid && report.valid, "memory")
    }

    fn bind_cpu(&mut self, data: &GlobalData) -> Result<(), LoaderError> {
        let width = self.image.width();
        let anchor = data.anchor();
        let salt = self.cpu_salt;
        let mut set = CpuHashSet::new();

        if let Some(masks) = self.platform.affinity() {
            let widened = masks.process != masks.system;
            if widened && !self.platform.set_process_affinity(masks.system) {
                return Err(LoaderError::Initialization(InitCode::CpuHash));
            }
            for bit in affinity_bits(masks.system) {
                let previous = self.platform.pin_thread(1u64 << bit);
                let leaf = self.platform.cpuid(1);
                let inserted = set.insert(cpu_hash(leaf.eax, leaf.ebx, salt, anchor, width));
                self.platform.pin_thread(previous);
                inserted?;
            }
            if widened {
                self.platform.set_process_affinity(masks.process);
            }
        }
        if set.is_empty() {
            let leaf = self.platform.cpuid(1);
            set.insert(cpu_hash(leaf.eax, leaf.ebx, salt, anchor, width))?;
        }
        debug!("bound to {} cpu signatures", set.len());
        data.set_cpu_hashes(&set);
        Ok(())
    }

    // ---- after publication -----------------------------------------------

    fn publish(&mut self, address: u64) -> Result<(), LoaderError> {
        self.image.write_ptr(u64::from(self.descriptor.storage), address)?;
        Ok(())
    }

    fn finish(&mut self, data: &GlobalData) -> Result<(), LoaderError> {
        let image_base = self.descriptor.image_base;

        self.phase(Phase::InvokeEntry);
        if self.descriptor.runtime_entry != 0 {
            let entry = self.image.view().address_of(u64::from(self.descriptor.runtime_entry));
            if !self.platform.call_entry(entry, image_base, EntryReason::ProcessAttach) {
                return Err(LoaderError::EntryRejected);
            }
        }

        self.phase(Phase::ResolveDelayImports);
        resolve_module_imports(&mut *self.platform, &mut self.image, self.descriptor.delay_import_info, &self.cipher)?;

        self.phase(Phase::RestoreProtections);
        self.protect_sections(data, ProtectPass::Restore, final_protection)?;
        data.set_crc_image_size(self.crc_image_size);

        if self.host == HostFamily::Unix && self.descriptor.relro_info != 0 {
            let relro = read_table::<SectionInfo>(
                &self.image.view(),
                TableRef::new(self.descriptor.relro_info, SECTION_INFO_SIZE),
            )?;
            for s in relro {
                let address = self.image.view().address_of(u64::from(s.address));
                self.platform
                    .protect(address, s.size as usize, s.kind)
                    .ok_or(LoaderError::Initialization(InitCode::VirtualProtect))?;
            }
        }

        self.show(MessageKind::UnregisteredVersion, &[]);
        self.phase(Phase::Success);
        Ok(())
    }
}

/// Status of a record another load already published into the image's
/// storage slot.
fn published_status(image: &ImageViewMut<'_>, storage: u32) -> Option<LoaderStatus> {
    if storage == 0 {
        return None;
    }
    let address = image.view().read_ptr(u64::from(storage)).ok()?;
    if address == 0 {
        return None;
    }
    // SAFETY: the slot is zero until a `GlobalSlot::commit` stores a live
    // record in it, and `free_image` zeroes it before the record is freed.
    let data = unsafe { &*(address as *const GlobalData) };
    Some(data.loader_status())
}

/// Findings of the dedicated debugger passes always abort.
fn fatal(finding: Finding) -> Result<(), LoaderError> {
    if finding.found {
        debug!("debugger: {}", finding.evidence);
        Err(LoaderError::DebuggerFound)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_core::{CpuidRegs, ImageView, Message, ModuleResolver, PointerWidth, ProbeOutcome, ProcName};

    /// Just enough host for the VM pass.
    #[derive(Default)]
    struct VmHost {
        leaves: Vec<(u32, CpuidRegs)>,
        late_cpuid: bool,
        probes: usize,
        firmware_calls: usize,
    }

    impl ModuleResolver for VmHost {
        fn image(&self, _base: u64) -> Option<ImageView<'_>> {
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

    impl Platform for VmHost {
        fn host(&self) -> HostFamily {
            HostFamily::Windows
        }
        fn cpuid(&mut self, leaf: u32) -> CpuidRegs {
            self.leaves
                .iter()
                .find(|(l, _)| *l == leaf)
                .map(|(_, r)| *r)
                .unwrap_or_default()
        }
        fn trap_probe(&mut self, probe: TrapProbe) -> ProbeOutcome {
            self.probes += 1;
            ProbeOutcome::Exception {
                byte_matches: !(self.late_cpuid && probe == TrapProbe::Cpuid),
                debug_registers_set: false,
            }
        }
        fn firmware_tables(&mut self) -> Vec<Vec<u8>> {
            self.firmware_calls += 1;
            Vec::new()
        }
        fn show_message(&mut self, _message: &Message) {}
        fn exit_process(&mut self, _code: u32) {}
    }

    fn detect(host: &mut VmHost) -> Result<(), LoaderError> {
        let descriptor = Descriptor::default();
        let mut bytes = vec![0u8; 0x10];
        let image = ImageViewMut::new(&mut bytes, 0x1000, PointerWidth::U64);
        let data = GlobalData::new();
        Run::new(host, &descriptor, image).detect_vm(&data)
    }

    const HV_BIT: CpuidRegs = CpuidRegs {
        eax: 0,
        ebx: 0,
        ecx: CPUID_HYPERVISOR_BIT,
        edx: 0,
    };

    #[test]
    fn root_partition_ends_the_vm_pass() {
        let mut host = VmHost {
            leaves: vec![
                (1, HV_BIT),
                (0x4000_0000, CpuidRegs { eax: 0, ebx: 0x7263_694d, ecx: 0x666f_736f, edx: 0x7648_2074 }),
                (0x4000_0003, CpuidRegs { ebx: 1, ..CpuidRegs::default() }),
            ],
            late_cpuid: true,
            ..VmHost::default()
        };
        assert_eq!(detect(&mut host), Ok(()));
        assert_eq!(host.probes, 0);
        assert_eq!(host.firmware_calls, 0);
    }

    #[test]
    fn guest_stops_at_the_hypervisor_bit() {
        let mut host = VmHost {
            leaves: vec![(1, HV_BIT)],
            ..VmHost::default()
        };
        assert_eq!(detect(&mut host), Err(LoaderError::VirtualMachineFound));
        assert_eq!(host.probes, 0);
    }

    #[test]
    fn bare_metal_runs_every_probe() {
        let mut host = VmHost::default();
        assert_eq!(detect(&mut host), Ok(()));
        assert_eq!(host.probes, 2);
        assert_eq!(host.firmware_calls, 1);

        let mut host = VmHost {
            late_cpuid: true,
            ..VmHost::default()
        };
        assert_eq!(detect(&mut host), Err(LoaderError::VirtualMachineFound));
    }

    #[test]
    fn storage_slot_names_the_published_record() {
        let mut bytes = vec![0u8; 0x20];
        let record = Box::new(GlobalData::new());
        record.set_loader_status(LoaderStatus::Success);
        let address = &*record as *const GlobalData as u64;

        let mut image = ImageViewMut::new(&mut bytes, 0x1000, PointerWidth::U64);
        assert_eq!(published_status(&image, 0x10), None);
        image.write_ptr(0x10, address).unwrap();
        assert_eq!(published_status(&image, 0x10), Some(LoaderStatus::Success));
        assert_eq!(published_status(&image, 0), None);
        drop(record);
    }
}
