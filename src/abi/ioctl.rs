//! The single ioctl of the Nano2D device: a command word plus a payload union.

use crate::error::{N2dError, N2dResult};
use crate::utils::iowr;

// ===============================================================================================
// Request
// ===============================================================================================

pub const N2D_IOCTL_BASE: u32 = 0x4E; // 'N'
pub const N2D_IOC_INTERFACE: u32 = iowr::<IoctlInterface>(N2D_IOCTL_BASE, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    Open = 0,
    Close = 1,
    Allocate = 2,
    Free = 3,
    Map = 4,
    Unmap = 5,
    Commit = 6,
    UserSignal = 7,
    Signal = 8,
    EventCommit = 9,
    GetHwInfo = 10,
    WrapUserMemory = 11,
    ExportVidmem = 12,
    Cache = 13,
}

impl TryFrom<u32> for Command {
    type Error = N2dError;

    fn try_from(value: u32) -> N2dResult<Self> {
        Ok(match value {
            0 => Self::Open,
            1 => Self::Close,
            2 => Self::Allocate,
            3 => Self::Free,
            4 => Self::Map,
            5 => Self::Unmap,
            6 => Self::Commit,
            7 => Self::UserSignal,
            8 => Self::Signal,
            9 => Self::EventCommit,
            10 => Self::GetHwInfo,
            11 => Self::WrapUserMemory,
            12 => Self::ExportVidmem,
            13 => Self::Cache,
            _ => return Err(N2dError::InvalidArgument),
        })
    }
}

pub const USER_SIGNAL_CREATE: u32 = 0;
pub const USER_SIGNAL_DESTROY: u32 = 1;
pub const USER_SIGNAL_SIGNAL: u32 = 2;
pub const USER_SIGNAL_WAIT: u32 = 3;

/// `wait_ms` value meaning "no timeout".
pub const WAIT_INFINITE: u32 = u32::MAX;

// ===============================================================================================
// Payloads
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct AllocateArgs {
    pub size: u64,
    pub alignment: u32,
    pub flags: u32,
    pub type_: u32,
    pub pool: u32,
    /// Out: vidmem handle.
    pub handle: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct HandleArgs {
    pub handle: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct MapArgs {
    pub handle: u32,
    pub flags: u32,
    /// Out: user address when `USER` was requested.
    pub logical: u64,
    /// Out: GPU address when `GPU` was requested.
    pub gpu_address: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct UnmapArgs {
    pub handle: u32,
    pub flags: u32,
    /// Non-zero: unmap once the GPU passes the next event.
    pub deferred: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct CommitArgs {
    pub handle: u32,
    pub offset: u32,
    pub size: u32,
    pub flush_events: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct UserSignalArgs {
    pub op: u32,
    /// In for DESTROY/SIGNAL/WAIT, out for CREATE.
    pub handle: u32,
    pub manual_reset: u32,
    pub state: u32,
    pub wait_ms: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct HwInfoArgs {
    pub chip_id: u32,
    pub chip_rev: u32,
    pub chip_date: u32,
    pub features: u32,
    pub minor_features0: u32,
    /// 0 = WAIT-LINK, 1 = END.
    pub fe_mode: u32,
    pub mmu: u32,
    pub cores: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct WrapUserMemoryArgs {
    pub logical: u64,
    pub size: u64,
    pub handle: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct ExportVidmemArgs {
    pub handle: u32,
    pub fd: i32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct CacheArgs {
    pub handle: u32,
    pub op: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union IoctlPayload {
    pub allocate: AllocateArgs,
    pub free: HandleArgs,
    pub map: MapArgs,
    pub unmap: UnmapArgs,
    pub commit: CommitArgs,
    pub user_signal: UserSignalArgs,
    pub signal: HandleArgs,
    pub hw_info: HwInfoArgs,
    pub wrap_user_memory: WrapUserMemoryArgs,
    pub export_vidmem: ExportVidmemArgs,
    pub cache: CacheArgs,
    pub raw: [u64; 4],
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct IoctlInterface {
    pub command: u32,
    pub core: u32,
    /// Out: `N2dError::code()`, 0 on success.
    pub error: i32,
    pub pad: u32,
    pub payload: IoctlPayload,
}

const _: () = assert!(std::mem::size_of::<IoctlPayload>() == 32);
const _: () = assert!(std::mem::size_of::<IoctlInterface>() == 48);

impl Default for IoctlInterface {
    fn default() -> Self {
        Self {
            command: 0,
            core: 0,
            error: 0,
            pad: 0,
            payload: IoctlPayload { raw: [0; 4] },
        }
    }
}

impl std::fmt::Debug for IoctlInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoctlInterface")
            .field("command", &self.command)
            .field("core", &self.core)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

// Every payload variant is plain integers and the union is always fully
// initialised through `raw`, so any view of it is a valid value.
macro_rules! payload_accessors {
    ($($get:ident, $set:ident: $ty:ty;)*) => {
        $(
            #[must_use]
            pub fn $get(&self) -> $ty {
                unsafe { self.payload.$get }
            }

            pub fn $set(&mut self, args: $ty) {
                self.payload.$get = args;
            }
        )*
    };
}

impl IoctlInterface {
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self {
            command: command as u32,
            ..Self::default()
        }
    }

    payload_accessors! {
        allocate, set_allocate: AllocateArgs;
        free, set_free: HandleArgs;
        map, set_map: MapArgs;
        unmap, set_unmap: UnmapArgs;
        commit, set_commit: CommitArgs;
        user_signal, set_user_signal: UserSignalArgs;
        signal, set_signal: HandleArgs;
        hw_info, set_hw_info: HwInfoArgs;
        wrap_user_memory, set_wrap_user_memory: WrapUserMemoryArgs;
        export_vidmem, set_export_vidmem: ExportVidmemArgs;
        cache, set_cache: CacheArgs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_number_carries_the_struct_size() {
        assert_eq!(N2D_IOC_INTERFACE & 0xFF, 0);
        assert_eq!((N2D_IOC_INTERFACE >> 8) & 0xFF, N2D_IOCTL_BASE);
        assert_eq!((N2D_IOC_INTERFACE >> 16) & 0x3FFF, 48);
        assert_eq!(N2D_IOC_INTERFACE >> 30, 3);
    }

    #[test]
    fn payload_views_share_storage() {
        let mut iface = IoctlInterface::new(Command::Free);
        iface.set_free(HandleArgs { handle: 9, pad: 0 });
        assert_eq!(iface.signal().handle, 9);
        assert_eq!(iface.allocate().size, 9);
        assert_eq!(Command::try_from(iface.command).unwrap(), Command::Free);
        assert!(Command::try_from(99).is_err());
    }
}
