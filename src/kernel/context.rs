//! The kernel core: owns the cores, the MMU, the allocator and the handle
//! database, and routes ioctl commands to them.

use crate::abi::ioctl::{
    Command, HwInfoArgs, IoctlInterface, USER_SIGNAL_CREATE, USER_SIGNAL_DESTROY,
    USER_SIGNAL_SIGNAL, USER_SIGNAL_WAIT, WAIT_INFINITE,
};
use crate::error::{N2dError, N2dResult, result_code};
use crate::kernel::config::KernelConfig;
use crate::kernel::db::{Database, DbObject};
use crate::kernel::event::EventAction;
use crate::kernel::hardware::Hardware;
use crate::kernel::hardware::cmdbuf::{FeMode, UserSpan};
use crate::kernel::memory::{AllocFlags, MapFlags, Pool, VidmemAllocator, VidmemNode, VidmemType};
use crate::kernel::mmu::Mmu;
use crate::kernel::os::Signal;
use crate::kernel::platform::{CacheOp, Platform, RegisterIo};
use crate::kernel::regs;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

// ===============================================================================================
// Kernel
// ===============================================================================================

/// One driver instance. Created when the device is bound, dropped when it is removed.
pub struct Kernel {
    config: KernelConfig,
    allocator: Arc<VidmemAllocator>,
    cores: Vec<Arc<Hardware>>,
    db: Database,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("config", &self.config)
            .field("cores", &self.cores)
            .finish_non_exhaustive()
    }
}

impl Kernel {
    /// Brings up the MMU, the allocator and every core, then starts the
    /// worker threads.
    ///
    /// # Errors
    /// `InvalidArgument` for a bad configuration, plus any MMU, allocation or
    /// power-up failure.
    pub fn new(
        config: KernelConfig,
        io: Arc<dyn RegisterIo>,
        platform: Arc<dyn Platform>,
    ) -> N2dResult<Self> {
        config.validate()?;

        let has_mmu = io.peek(0, regs::CHIP_MINOR_FEATURES0) & regs::MINOR0_MMU != 0;
        let mmu = Arc::new(Mmu::new(platform.clone(), config.mmu_area)?);
        let reserved = (config.contiguous_size > 0)
            .then_some((config.contiguous_base, config.contiguous_size));
        let mut allocator = VidmemAllocator::new(platform, mmu, reserved);
        if !(config.mmu && has_mmu) {
            log::info!("n2d: MMU disabled, GPU addresses are physical");
            allocator = allocator.with_flat_mapping();
        }
        let allocator = Arc::new(allocator);

        let cores = (0..config.cores)
            .map(|core| Hardware::new(core, io.clone(), allocator.clone(), &config).map(Arc::new))
            .collect::<N2dResult<Vec<_>>>()?;

        let kernel = Self {
            config,
            allocator,
            cores,
            db: Database::new(),
            workers: Mutex::new(Vec::new()),
        };

        for hw in &kernel.cores {
            let spawned = hw.spawn_workers(kernel.config.polling)?;
            kernel.workers.lock().extend(spawned);
        }

        log::info!("n2d: {} core(s) ready", kernel.cores.len());
        Ok(kernel)
    }

    #[must_use]
    pub const fn config(&self) -> &KernelConfig {
        &self.config
    }

    #[must_use]
    pub const fn allocator(&self) -> &Arc<VidmemAllocator> {
        &self.allocator
    }

    #[must_use]
    pub const fn db(&self) -> &Database {
        &self.db
    }

    #[must_use]
    pub fn cores(&self) -> &[Arc<Hardware>] {
        &self.cores
    }

    /// # Errors
    /// `InvalidArgument` for an index out of range.
    pub fn core(&self, index: u32) -> N2dResult<&Arc<Hardware>> {
        self.cores
            .get(index as usize)
            .ok_or(N2dError::InvalidArgument)
    }

    /// IRQ entry for `core`. Returns whether the interrupt was ours.
    pub fn interrupt(&self, core: usize) -> bool {
        self.cores.get(core).is_some_and(|hw| hw.interrupt())
    }

    // ===========================================================================================
    // Dispatch
    // ===========================================================================================

    /// Executes one command for `process` and stores the outcome in
    /// `iface.error`.
    pub fn dispatch(&self, process: u32, iface: &mut IoctlInterface) {
        let result = self.handle(process, iface);
        if let Err(e) = &result {
            log::debug!("n2d: command {} for {process} failed: {e}", iface.command);
        }
        iface.error = result_code(&result);
    }

    fn handle(&self, process: u32, iface: &mut IoctlInterface) -> N2dResult<()> {
        let command = Command::try_from(iface.command)?;
        log::trace!("n2d: {command:?} from {process}");

        if command == Command::Open {
            self.db.open_process(process);
            return Ok(());
        }
        if !self.db.is_open(process) {
            return Err(N2dError::NoContext);
        }

        match command {
            Command::Open => Ok(()),
            Command::Close => self.close(process),
            Command::Allocate => {
                let mut args = iface.allocate();
                let size = usize::try_from(args.size).map_err(|_| N2dError::InvalidArgument)?;
                let flags = AllocFlags::from_bits(args.flags).ok_or(N2dError::InvalidArgument)?;
                let node = self.allocator.allocate(
                    size,
                    args.alignment as usize,
                    flags,
                    VidmemType::from(args.type_),
                    Pool::try_from(args.pool)?,
                )?;
                args.handle = self.register_vidmem(process, node)?;
                iface.set_allocate(args);
                Ok(())
            }
            Command::Free => {
                let handle = iface.free().handle;
                let node = self.db.get_vidmem(process, handle)?;
                // The handle stays valid until the node is actually gone.
                self.free_node(process, &node)?;
                self.db.remove(process, handle).map(|_| ())
            }
            Command::Map => {
                let mut args = iface.map();
                let node = self.db.get_vidmem(process, args.handle)?;
                let flags = map_flags(args.flags)?;
                self.allocator.map(process, flags, &node)?;
                // Replies point at the first byte of the range, not its page.
                let offset = node.offset();
                if flags.contains(MapFlags::USER) {
                    args.logical = node
                        .user_map(process)
                        .map_or(0, |u| u.logical + offset as u64);
                }
                if flags.contains(MapFlags::GPU) {
                    args.gpu_address = node.gpu_address().map_or(0, |a| a + offset as u32);
                }
                iface.set_map(args);
                Ok(())
            }
            Command::Unmap => {
                let args = iface.unmap();
                let node = self.db.get_vidmem(process, args.handle)?;
                let flags = map_flags(args.flags)?;
                if args.deferred != 0 {
                    self.defer_unmap(iface.core, process, flags, node)
                } else {
                    self.allocator.unmap(process, flags, &node)
                }
            }
            Command::Commit => {
                let args = iface.commit();
                let hw = self.core(iface.core)?;
                let span = UserSpan {
                    node: self.db.get_vidmem(process, args.handle)?,
                    offset: args.offset as usize,
                    size: args.size as usize,
                };
                hw.commit(&span, args.flush_events != 0)
            }
            Command::UserSignal => self.user_signal(process, iface),
            Command::Signal => {
                let hw = self.core(iface.core)?;
                let signal = self.db.get_signal(process, iface.signal().handle)?;
                hw.events().add(EventAction::Signal(signal));
                Ok(())
            }
            Command::EventCommit => self.core(iface.core)?.event_commit(),
            Command::GetHwInfo => {
                let info = *self.core(iface.core)?.info();
                iface.set_hw_info(HwInfoArgs {
                    chip_id: info.chip_id,
                    chip_rev: info.chip_rev,
                    chip_date: info.chip_date,
                    features: info.features,
                    minor_features0: info.minor_features0,
                    fe_mode: u32::from(info.fe_mode == FeMode::End),
                    mmu: u32::from(info.mmu),
                    cores: self.cores.len() as u32,
                });
                Ok(())
            }
            Command::WrapUserMemory => {
                let mut args = iface.wrap_user_memory();
                let size = usize::try_from(args.size).map_err(|_| N2dError::InvalidArgument)?;
                let node = self
                    .allocator
                    .wrap_user_memory(process, args.logical, size)?;
                args.handle = self.register_vidmem(process, node)?;
                iface.set_wrap_user_memory(args);
                Ok(())
            }
            Command::ExportVidmem => {
                let mut args = iface.export_vidmem();
                let node = self.db.get_vidmem(process, args.handle)?;
                args.fd = self.allocator.export(&node)?;
                iface.set_export_vidmem(args);
                Ok(())
            }
            Command::Cache => {
                let args = iface.cache();
                let node = self.db.get_vidmem(process, args.handle)?;
                self.allocator.cache(&node, CacheOp::try_from(args.op)?)
            }
        }
    }

    fn register_vidmem(&self, process: u32, node: Arc<VidmemNode>) -> N2dResult<u32> {
        match self.db.insert(process, DbObject::Vidmem(node.clone())) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.allocator.release(&node)?;
                Err(e)
            }
        }
    }

    fn user_signal(&self, process: u32, iface: &mut IoctlInterface) -> N2dResult<()> {
        let mut args = iface.user_signal();
        match args.op {
            USER_SIGNAL_CREATE => {
                let signal = Arc::new(Signal::new(args.manual_reset != 0));
                args.handle = self.db.insert(process, DbObject::Signal(signal))?;
                iface.set_user_signal(args);
                Ok(())
            }
            USER_SIGNAL_DESTROY => {
                let signal = self.db.get_signal(process, args.handle)?;
                self.db.remove(process, args.handle)?;
                signal.close();
                Ok(())
            }
            USER_SIGNAL_SIGNAL => {
                self.db
                    .get_signal(process, args.handle)?
                    .signal(args.state != 0);
                Ok(())
            }
            USER_SIGNAL_WAIT => {
                let signal = self.db.get_signal(process, args.handle)?;
                let timeout = (args.wait_ms != WAIT_INFINITE)
                    .then(|| Duration::from_millis(u64::from(args.wait_ms)));
                signal.wait(timeout)
            }
            _ => Err(N2dError::InvalidArgument),
        }
    }

    // ===========================================================================================
    // Memory lifetime
    // ===========================================================================================

    /// Unmaps once the GPU has passed everything committed so far.
    fn defer_unmap(
        &self,
        core: u32,
        process: u32,
        flags: MapFlags,
        node: Arc<VidmemNode>,
    ) -> N2dResult<()> {
        let hw = self.core(core)?;
        if node.ref_count() <= 1 || !node.mapped().contains(flags) {
            return Err(N2dError::InvalidArgument);
        }
        let allocator = self.allocator.clone();
        hw.events().add(EventAction::Callback(Box::new(move || {
            if let Err(e) = allocator.unmap(process, flags, &node) {
                log::warn!("n2d: deferred unmap for {process} failed: {e}");
            }
        })));
        Ok(())
    }

    /// Drops the views `process` still holds, then the creation reference.
    fn free_node(&self, process: u32, node: &VidmemNode) -> N2dResult<()> {
        for flag in [MapFlags::USER, MapFlags::KERNEL, MapFlags::GPU] {
            loop {
                let held = if flag == MapFlags::USER {
                    node.user_map(process).is_some()
                } else {
                    node.mapped().contains(flag)
                };
                if !held || node.ref_count() <= 1 {
                    break;
                }
                self.allocator.unmap(process, flag, node)?;
            }
        }
        self.allocator.release(node)?;

        let left = node.ref_count();
        if left > 0 {
            log::warn!("n2d: node of {process} still holds {left} reference(s) after free");
        }
        Ok(())
    }

    fn close(&self, process: u32) -> N2dResult<()> {
        for (handle, object) in self.db.close_process(process)? {
            log::warn!("n2d: process {process} leaked handle {handle} ({object:?})");
            match object {
                DbObject::Vidmem(node) => {
                    if let Err(e) = self.free_node(process, &node) {
                        log::error!("n2d: freeing leaked handle {handle} failed: {e}");
                    }
                }
                DbObject::Signal(signal) => signal.close(),
            }
        }
        Ok(())
    }
}

fn map_flags(bits: u32) -> N2dResult<MapFlags> {
    match MapFlags::from_bits(bits) {
        Some(flags) if !flags.is_empty() => Ok(flags),
        _ => Err(N2dError::InvalidArgument),
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        for hw in &self.cores {
            hw.shutdown();
        }
        for worker in self.workers.lock().drain(..) {
            if worker.join().is_err() {
                log::error!("n2d: worker thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::ioctl::{AllocateArgs, HandleArgs, MapArgs, UnmapArgs};
    use crate::kernel::sim::{SimulatedGpu, SimulatedPlatform};
    use crate::utils::PAGE_SIZE;

    fn kernel(config: KernelConfig) -> (Arc<SimulatedGpu>, Kernel) {
        let gpu = Arc::new(SimulatedGpu::new(config.cores));
        let platform = Arc::new(SimulatedPlatform::new());
        let kernel = Kernel::new(config, gpu.clone(), platform).unwrap();
        (gpu, kernel)
    }

    fn run(kernel: &Kernel, process: u32, iface: &mut IoctlInterface) -> i32 {
        kernel.dispatch(process, iface);
        iface.error
    }

    fn allocate(kernel: &Kernel, process: u32) -> u32 {
        let mut iface = IoctlInterface::new(Command::Allocate);
        iface.set_allocate(AllocateArgs {
            size: PAGE_SIZE as u64,
            ..AllocateArgs::default()
        });
        assert_eq!(run(kernel, process, &mut iface), 0);
        iface.allocate().handle
    }

    #[test]
    fn commands_need_an_open_context() {
        let (_, k) = kernel(KernelConfig::new().with_recovery(false));
        let mut iface = IoctlInterface::new(Command::Allocate);
        assert_eq!(run(&k, 7, &mut iface), N2dError::NoContext.code());

        let mut bogus = IoctlInterface::default();
        bogus.command = 77;
        assert_eq!(run(&k, 7, &mut bogus), N2dError::InvalidArgument.code());
    }

    #[test]
    fn free_unwinds_remaining_mappings() {
        let (_, k) = kernel(KernelConfig::new().with_recovery(false));
        run(&k, 1, &mut IoctlInterface::new(Command::Open));
        let handle = allocate(&k, 1);
        let node = k.db().get_vidmem(1, handle).unwrap();

        for flags in [MapFlags::GPU, MapFlags::KERNEL | MapFlags::USER] {
            let mut map = IoctlInterface::new(Command::Map);
            map.set_map(MapArgs {
                handle,
                flags: flags.bits(),
                ..MapArgs::default()
            });
            assert_eq!(run(&k, 1, &mut map), 0);
        }
        assert_eq!(node.ref_count(), 3);
        let free_before = k.allocator().mmu().free_page_count().unwrap();

        let mut free = IoctlInterface::new(Command::Free);
        free.set_free(HandleArgs { handle, pad: 0 });
        assert_eq!(run(&k, 1, &mut free), 0);
        assert_eq!(node.ref_count(), 0);
        assert!(node.mapped().is_empty());
        assert_eq!(
            k.allocator().mmu().free_page_count().unwrap(),
            free_before + 1
        );
        assert_eq!(run(&k, 1, &mut free), N2dError::NotFound.code());
    }

    #[test]
    fn failed_free_keeps_the_handle() {
        let (_, k) = kernel(KernelConfig::new().with_recovery(false));
        run(&k, 1, &mut IoctlInterface::new(Command::Open));
        let handle = allocate(&k, 1);
        let node = k.db().get_vidmem(1, handle).unwrap();
        k.allocator().release(&node).unwrap();

        let mut free = IoctlInterface::new(Command::Free);
        free.set_free(HandleArgs { handle, pad: 0 });
        assert_eq!(run(&k, 1, &mut free), N2dError::InvalidArgument.code());
        assert!(k.db().get_vidmem(1, handle).is_ok());
    }

    #[test]
    fn deferred_unmap_waits_for_the_event() {
        let (gpu, k) = kernel(KernelConfig::new().with_recovery(false));
        run(&k, 1, &mut IoctlInterface::new(Command::Open));
        let handle = allocate(&k, 1);
        let node = k.db().get_vidmem(1, handle).unwrap();

        let mut map = IoctlInterface::new(Command::Map);
        map.set_map(MapArgs {
            handle,
            flags: MapFlags::GPU.bits(),
            ..MapArgs::default()
        });
        assert_eq!(run(&k, 1, &mut map), 0);

        let mut unmap = IoctlInterface::new(Command::Unmap);
        unmap.set_unmap(UnmapArgs {
            handle,
            flags: MapFlags::GPU.bits(),
            deferred: 1,
            pad: 0,
        });
        assert_eq!(run(&k, 1, &mut unmap), 0);
        assert!(node.gpu_address().is_some());

        assert_eq!(run(&k, 1, &mut IoctlInterface::new(Command::EventCommit)), 0);
        assert!(node.gpu_address().is_some());

        gpu.raise_interrupt(0, 1);
        assert!(k.interrupt(0));
        // The completion thread runs the callback.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while node.gpu_address().is_some() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(node.gpu_address().is_none());
        assert_eq!(node.ref_count(), 1);
    }

    #[test]
    fn close_frees_leaked_objects() {
        let (_, k) = kernel(KernelConfig::new().with_recovery(false));
        run(&k, 3, &mut IoctlInterface::new(Command::Open));
        let handle = allocate(&k, 3);
        let node = k.db().get_vidmem(3, handle).unwrap();

        assert_eq!(run(&k, 3, &mut IoctlInterface::new(Command::Close)), 0);
        assert_eq!(node.ref_count(), 0);
        assert!(!k.db().is_open(3));
        assert_eq!(
            run(&k, 3, &mut IoctlInterface::new(Command::Close)),
            N2dError::NoContext.code()
        );
    }

    #[test]
    fn hw_info_reports_every_core() {
        let (_, k) = kernel(KernelConfig::new().with_cores(2).with_recovery(false));
        run(&k, 1, &mut IoctlInterface::new(Command::Open));
        let mut info = IoctlInterface::new(Command::GetHwInfo);
        info.core = 1;
        assert_eq!(run(&k, 1, &mut info), 0);
        let args = info.hw_info();
        assert_eq!(args.chip_id, SimulatedGpu::CHIP_ID);
        assert_eq!(args.cores, 2);
        assert_eq!(args.mmu, 1);
        assert_eq!(args.fe_mode, 0);

        info.core = 2;
        assert_eq!(run(&k, 1, &mut info), N2dError::InvalidArgument.code());
    }
}
