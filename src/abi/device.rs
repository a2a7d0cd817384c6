use crate::abi::ioctl::{
    AllocateArgs, CacheArgs, Command, CommitArgs, ExportVidmemArgs, HandleArgs, HwInfoArgs,
    IoctlInterface, MapArgs, N2D_IOC_INTERFACE, USER_SIGNAL_CREATE, USER_SIGNAL_DESTROY,
    USER_SIGNAL_SIGNAL, USER_SIGNAL_WAIT, UnmapArgs, UserSignalArgs, WAIT_INFINITE,
    WrapUserMemoryArgs,
};
use crate::error::{N2dError, N2dResult};
use crate::kernel::context::Kernel;
use crate::kernel::memory::{AllocFlags, MapFlags, Pool, VidmemType};
use crate::kernel::platform::CacheOp;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_DEVICE_PATH: &str = "/dev/nano2d";

/// Carries one `IoctlInterface` to the kernel core and back.
pub trait Transport: Send + Sync {
    /// # Errors
    /// Only transport failures; command errors come back in `iface.error`.
    fn call(&self, iface: &mut IoctlInterface) -> N2dResult<()>;
}

// ===============================================================================================
// Transports
// ===============================================================================================

/// The driver character device.
#[derive(Clone, Debug)]
pub struct DeviceFile {
    pub file: Arc<File>,
}

impl DeviceFile {
    /// # Errors
    /// Returns an error if the device node cannot be opened.
    pub fn open() -> io::Result<Self> {
        Self::open_path(DEFAULT_DEVICE_PATH)
    }

    /// # Errors
    /// Returns an error if `path` cannot be opened read/write.
    pub fn open_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            file: Arc::new(file),
        })
    }

    /// # Safety
    /// `arg` must be the payload type `cmd` encodes.
    unsafe fn ioctl<T>(&self, cmd: u32, arg: &mut T) -> io::Result<()> {
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), cmd as _, arg as *mut T) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Transport for DeviceFile {
    fn call(&self, iface: &mut IoctlInterface) -> N2dResult<()> {
        unsafe { self.ioctl(N2D_IOC_INTERFACE, iface)? };
        Ok(())
    }
}

/// Calls straight into a `Kernel` as process `process`.
#[derive(Debug, Clone)]
pub struct InProcess {
    kernel: Arc<Kernel>,
    process: u32,
}

impl InProcess {
    #[must_use]
    pub const fn new(kernel: Arc<Kernel>, process: u32) -> Self {
        Self { kernel, process }
    }

    #[must_use]
    pub const fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }
}

impl Transport for InProcess {
    fn call(&self, iface: &mut IoctlInterface) -> N2dResult<()> {
        self.kernel.dispatch(self.process, iface);
        Ok(())
    }
}

// ===============================================================================================
// Client
// ===============================================================================================

/// Identification returned by [`Client::hw_info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwInfo {
    pub chip_id: u32,
    pub chip_rev: u32,
    pub chip_date: u32,
    pub features: u32,
    pub minor_features0: u32,
    pub end_front_end: bool,
    pub mmu: bool,
    pub cores: u32,
}

impl From<HwInfoArgs> for HwInfo {
    fn from(args: HwInfoArgs) -> Self {
        Self {
            chip_id: args.chip_id,
            chip_rev: args.chip_rev,
            chip_date: args.chip_date,
            features: args.features,
            minor_features0: args.minor_features0,
            end_front_end: args.fe_mode != 0,
            mmu: args.mmu != 0,
            cores: args.cores,
        }
    }
}

/// User-mode side of the ioctl ABI.
#[derive(Debug)]
pub struct Client<T: Transport> {
    transport: T,
    core: u32,
}

impl<T: Transport> Client<T> {
    pub const fn new(transport: T) -> Self {
        Self { transport, core: 0 }
    }

    /// Targets core-scoped commands (COMMIT, SIGNAL, EVENT_COMMIT, GET_HW_INFO)
    /// at `core`.
    #[must_use]
    pub const fn with_core(mut self, core: u32) -> Self {
        self.core = core;
        self
    }

    pub const fn transport(&self) -> &T {
        &self.transport
    }

    fn call(
        &self,
        command: Command,
        fill: impl FnOnce(&mut IoctlInterface),
    ) -> N2dResult<IoctlInterface> {
        let mut iface = IoctlInterface::new(command);
        iface.core = self.core;
        fill(&mut iface);
        self.transport.call(&mut iface)?;

        let waiting =
            command == Command::UserSignal && iface.user_signal().op == USER_SIGNAL_WAIT;
        match N2dError::from_code(iface.error) {
            None => Ok(iface),
            Some(N2dError::Timeout) if !waiting => {
                log::warn!("n2d: {command:?} reported a timeout");
                Err(N2dError::InvalidArgument)
            }
            Some(e) => Err(e),
        }
    }

    // ===========================================================================================
    // Context
    // ===========================================================================================

    /// # Errors
    /// Transport errors.
    pub fn open(&self) -> N2dResult<()> {
        self.call(Command::Open, |_| {}).map(|_| ())
    }

    /// Closes the process context. Objects still registered are freed by the
    /// kernel.
    ///
    /// # Errors
    /// `NoContext` when the context is not open.
    pub fn close(&self) -> N2dResult<()> {
        self.call(Command::Close, |_| {}).map(|_| ())
    }

    /// # Errors
    /// `InvalidArgument` for a core index out of range.
    pub fn hw_info(&self) -> N2dResult<HwInfo> {
        Ok(self.call(Command::GetHwInfo, |_| {})?.hw_info().into())
    }

    // ===========================================================================================
    // Memory
    // ===========================================================================================

    /// Allocates video memory and returns its handle.
    ///
    /// # Errors
    /// `OutOfMemory` when no allocator can satisfy the request.
    pub fn allocate(
        &self,
        size: u64,
        alignment: u32,
        flags: AllocFlags,
        ty: VidmemType,
        pool: Pool,
    ) -> N2dResult<u32> {
        let iface = self.call(Command::Allocate, |i| {
            i.set_allocate(AllocateArgs {
                size,
                alignment,
                flags: flags.bits(),
                type_: ty as u32,
                pool: pool as u32,
                ..AllocateArgs::default()
            });
        })?;
        Ok(iface.allocate().handle)
    }

    /// # Errors
    /// `NotFound` for an unknown handle.
    pub fn free(&self, handle: u32) -> N2dResult<()> {
        self.call(Command::Free, |i| i.set_free(HandleArgs { handle, pad: 0 }))
            .map(|_| ())
    }

    /// Maps `handle`; returns the user address and the GPU address (0 for
    /// views that were not requested).
    ///
    /// # Errors
    /// `NotSupported` when a GPU view cannot be created for the node.
    pub fn map(&self, handle: u32, flags: MapFlags) -> N2dResult<(u64, u32)> {
        let iface = self.call(Command::Map, |i| {
            i.set_map(MapArgs {
                handle,
                flags: flags.bits(),
                ..MapArgs::default()
            });
        })?;
        let args = iface.map();
        Ok((args.logical, args.gpu_address))
    }

    /// Unmaps now, or after the GPU passes the next event when `deferred`.
    ///
    /// # Errors
    /// `InvalidArgument` for views that are not mapped.
    pub fn unmap(&self, handle: u32, flags: MapFlags, deferred: bool) -> N2dResult<()> {
        self.call(Command::Unmap, |i| {
            i.set_unmap(UnmapArgs {
                handle,
                flags: flags.bits(),
                deferred: u32::from(deferred),
                pad: 0,
            });
        })
        .map(|_| ())
    }

    /// # Errors
    /// The platform's pinning error.
    pub fn wrap_user_memory(&self, logical: u64, size: u64) -> N2dResult<u32> {
        let iface = self.call(Command::WrapUserMemory, |i| {
            i.set_wrap_user_memory(WrapUserMemoryArgs {
                logical,
                size,
                ..WrapUserMemoryArgs::default()
            });
        })?;
        Ok(iface.wrap_user_memory().handle)
    }

    /// # Errors
    /// `NotSupported` without a dma-buf exporter.
    pub fn export(&self, handle: u32) -> N2dResult<i32> {
        let iface = self.call(Command::ExportVidmem, |i| {
            i.set_export_vidmem(ExportVidmemArgs { handle, fd: -1 });
        })?;
        Ok(iface.export_vidmem().fd)
    }

    /// # Errors
    /// The platform's cache-maintenance error.
    pub fn cache(&self, handle: u32, op: CacheOp) -> N2dResult<()> {
        self.call(Command::Cache, |i| {
            i.set_cache(CacheArgs {
                handle,
                op: op as u32,
            });
        })
        .map(|_| ())
    }

    // ===========================================================================================
    // Submission
    // ===========================================================================================

    /// Executes `size` bytes at `offset` of the command buffer `handle`.
    ///
    /// # Errors
    /// `InvalidArgument` for a span outside the buffer or one that is not
    /// GPU-mapped.
    pub fn commit(&self, handle: u32, offset: u32, size: u32, flush_events: bool) -> N2dResult<()> {
        self.call(Command::Commit, |i| {
            i.set_commit(CommitArgs {
                handle,
                offset,
                size,
                flush_events: u32::from(flush_events),
            });
        })
        .map(|_| ())
    }

    /// Submits the pending events without user commands.
    ///
    /// # Errors
    /// `OutOfResources` when no event slot frees up in time.
    pub fn event_commit(&self) -> N2dResult<()> {
        self.call(Command::EventCommit, |_| {}).map(|_| ())
    }

    /// Queues user signal `handle` on the next event.
    ///
    /// # Errors
    /// `NotFound` for an unknown handle.
    pub fn queue_signal(&self, handle: u32) -> N2dResult<()> {
        self.call(Command::Signal, |i| i.set_signal(HandleArgs { handle, pad: 0 }))
            .map(|_| ())
    }

    // ===========================================================================================
    // User signals
    // ===========================================================================================

    fn user_signal(&self, args: UserSignalArgs) -> N2dResult<UserSignalArgs> {
        Ok(self
            .call(Command::UserSignal, |i| i.set_user_signal(args))?
            .user_signal())
    }

    /// # Errors
    /// `OutOfResources` when the handle space is exhausted.
    pub fn signal_create(&self, manual_reset: bool) -> N2dResult<u32> {
        let args = self.user_signal(UserSignalArgs {
            op: USER_SIGNAL_CREATE,
            manual_reset: u32::from(manual_reset),
            ..UserSignalArgs::default()
        })?;
        Ok(args.handle)
    }

    /// # Errors
    /// `NotFound` for an unknown handle.
    pub fn signal_destroy(&self, handle: u32) -> N2dResult<()> {
        self.user_signal(UserSignalArgs {
            op: USER_SIGNAL_DESTROY,
            handle,
            ..UserSignalArgs::default()
        })
        .map(|_| ())
    }

    /// # Errors
    /// `NotFound` for an unknown handle.
    pub fn signal_set(&self, handle: u32, state: bool) -> N2dResult<()> {
        self.user_signal(UserSignalArgs {
            op: USER_SIGNAL_SIGNAL,
            handle,
            state: u32::from(state),
            ..UserSignalArgs::default()
        })
        .map(|_| ())
    }

    /// Waits for signal `handle`; `None` waits forever.
    ///
    /// # Errors
    /// `Timeout` when the wait expires, `Interrupted` when it is broken off.
    pub fn signal_wait(&self, handle: u32, timeout: Option<Duration>) -> N2dResult<()> {
        let wait_ms = timeout.map_or(WAIT_INFINITE, |t| {
            u32::try_from(t.as_millis()).unwrap_or(WAIT_INFINITE - 1)
        });
        self.user_signal(UserSignalArgs {
            op: USER_SIGNAL_WAIT,
            handle,
            wait_ms,
            ..UserSignalArgs::default()
        })
        .map(|_| ())
    }
}
