//! Video memory nodes: one allocation, whatever allocator backs it.

pub mod manager;
pub mod pool;

use crate::error::{N2dError, N2dResult};
use crate::kernel::platform::Platform;
use crate::utils::PAGE_SIZE;
use bitflags::bitflags;
use parking_lot::Mutex;
use std::sync::Arc;

pub use manager::VidmemAllocator;

bitflags! {
    /// Allocation flags of the ALLOCATE command.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AllocFlags: u32 {
        const CONTIGUOUS = 1 << 0;
        const NON_CONTIGUOUS = 1 << 1;
        const CACHEABLE = 1 << 2;
    }
}

bitflags! {
    /// Which views of a node to create or drop.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MapFlags: u32 {
        const KERNEL = 1 << 0;
        const USER = 1 << 1;
        const GPU = 1 << 2;
    }
}

/// Which physical pool an allocation may come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum Pool {
    #[default]
    Default = 0,
    /// Reserved region only, no fallback.
    Reserved = 1,
    /// Skip the reserved region.
    System = 2,
}

impl TryFrom<u32> for Pool {
    type Error = N2dError;

    fn try_from(value: u32) -> N2dResult<Self> {
        match value {
            0 => Ok(Self::Default),
            1 => Ok(Self::Reserved),
            2 => Ok(Self::System),
            _ => Err(N2dError::InvalidArgument),
        }
    }
}

/// What the allocation is used for. Recorded only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum VidmemType {
    #[default]
    Generic = 0,
    Command = 1,
    Surface = 2,
}

impl From<u32> for VidmemType {
    fn from(value: u32) -> Self {
        match value {
            1 => Self::Command,
            2 => Self::Surface,
            _ => Self::Generic,
        }
    }
}

/// The allocator that actually produced the backing; selects the free path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorKind {
    Reserved,
    DmaCoherent,
    Gfp,
    NonContiguous,
    WrapUser { logical: u64 },
    WrapDmabuf { fd: i32 },
}

#[derive(Debug, Clone)]
pub(crate) enum Backing {
    Contiguous(u64),
    Pages(Vec<u64>),
}

/// A user-space view of a node in one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserMap {
    pub process: u32,
    pub logical: u64,
    pub map_count: u32,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Mapping<A> {
    pub address: A,
    pub count: u32,
}

#[derive(Debug, Default)]
pub(crate) struct NodeState {
    pub ref_count: u32,
    pub kernel: Option<Mapping<u64>>,
    pub gpu: Option<Mapping<u32>>,
    pub user: Vec<UserMap>,
}

impl NodeState {
    pub fn mapped(&self) -> MapFlags {
        let mut flags = MapFlags::empty();
        flags.set(MapFlags::KERNEL, self.kernel.is_some());
        flags.set(MapFlags::GPU, self.gpu.is_some());
        flags.set(MapFlags::USER, !self.user.is_empty());
        flags
    }
}

/// One video-memory allocation.
///
/// The node is shared as `Arc<VidmemNode>` between the handle database and
/// in-flight event actions; `ref_count` (not the `Arc` count) governs when the
/// backing is returned.
pub struct VidmemNode {
    size: usize,
    kind: AllocatorKind,
    backing: Backing,
    cacheable: bool,
    ty: VidmemType,
    pub(crate) state: Mutex<NodeState>,
    platform: Arc<dyn Platform>,
}

impl std::fmt::Debug for VidmemNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VidmemNode")
            .field("size", &self.size)
            .field("kind", &self.kind)
            .field("cacheable", &self.cacheable)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl VidmemNode {
    pub(crate) fn new(
        platform: Arc<dyn Platform>,
        size: usize,
        kind: AllocatorKind,
        backing: Backing,
        cacheable: bool,
        ty: VidmemType,
    ) -> Self {
        Self {
            size,
            kind,
            backing,
            cacheable,
            ty,
            state: Mutex::new(NodeState {
                ref_count: 1,
                ..NodeState::default()
            }),
            platform,
        }
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub const fn kind(&self) -> AllocatorKind {
        self.kind
    }

    #[must_use]
    pub const fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    #[must_use]
    pub const fn vidmem_type(&self) -> VidmemType {
        self.ty
    }

    /// Byte offset of the wrapped user range inside the node's first page;
    /// 0 for every other kind. Views of the node start at the page, so the
    /// range itself is at `view + offset`.
    #[must_use]
    pub const fn offset(&self) -> usize {
        match self.kind {
            AllocatorKind::WrapUser { logical } => (logical as usize) & (PAGE_SIZE - 1),
            _ => 0,
        }
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        self.size / PAGE_SIZE
    }

    /// Physical base of a contiguous node.
    #[must_use]
    pub const fn contiguous_base(&self) -> Option<u64> {
        match self.backing {
            Backing::Contiguous(base) => Some(base),
            Backing::Pages(_) => None,
        }
    }

    /// The page list, expanded for contiguous nodes.
    #[must_use]
    pub fn pages(&self) -> Vec<u64> {
        match &self.backing {
            Backing::Contiguous(base) => (0..self.page_count())
                .map(|i| base + (i * PAGE_SIZE) as u64)
                .collect(),
            Backing::Pages(pages) => pages.clone(),
        }
    }

    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.state.lock().ref_count
    }

    #[must_use]
    pub fn mapped(&self) -> MapFlags {
        self.state.lock().mapped()
    }

    #[must_use]
    pub fn gpu_address(&self) -> Option<u32> {
        self.state.lock().gpu.map(|m| m.address)
    }

    #[must_use]
    pub fn user_map(&self, process: u32) -> Option<UserMap> {
        self.state
            .lock()
            .user
            .iter()
            .find(|u| u.process == process)
            .copied()
    }

    /// Physical address of the byte at `offset`.
    ///
    /// # Errors
    /// `InvalidArgument` past the end of the node.
    pub fn physical_at(&self, offset: usize) -> N2dResult<u64> {
        if offset >= self.size {
            return Err(N2dError::InvalidArgument);
        }
        match &self.backing {
            Backing::Contiguous(base) => Ok(base + offset as u64),
            Backing::Pages(pages) => {
                let page = pages
                    .get(offset / PAGE_SIZE)
                    .ok_or(N2dError::InvalidArgument)?;
                Ok(page + (offset % PAGE_SIZE) as u64)
            }
        }
    }

    /// Writes words at a 4-byte aligned `offset`.
    ///
    /// # Errors
    /// `NotAligned` for an unaligned offset, `InvalidArgument` past the end.
    pub fn write_words(&self, offset: usize, words: &[u32]) -> N2dResult<()> {
        if offset % 4 != 0 {
            return Err(N2dError::NotAligned);
        }
        if offset + words.len() * 4 > self.size {
            return Err(N2dError::InvalidArgument);
        }
        if let Backing::Contiguous(base) = self.backing {
            self.platform.write_words(base + offset as u64, words);
            return Ok(());
        }
        for (i, &w) in words.iter().enumerate() {
            self.platform.write_u32(self.physical_at(offset + i * 4)?, w);
        }
        Ok(())
    }

    /// Reads the word at a 4-byte aligned `offset`.
    ///
    /// # Errors
    /// Same as [`VidmemNode::write_words`].
    pub fn read_word(&self, offset: usize) -> N2dResult<u32> {
        if offset % 4 != 0 {
            return Err(N2dError::NotAligned);
        }
        Ok(self.platform.read_u32(self.physical_at(offset)?))
    }

    pub(crate) const fn backing(&self) -> &Backing {
        &self.backing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::sim::SimulatedPlatform;

    #[test]
    fn scattered_offsets_follow_the_page_list() {
        let platform = Arc::new(SimulatedPlatform::new());
        let node = VidmemNode::new(
            platform,
            2 * PAGE_SIZE,
            AllocatorKind::NonContiguous,
            Backing::Pages(vec![0x9000_0000, 0x9010_0000]),
            false,
            VidmemType::Generic,
        );

        assert_eq!(node.physical_at(8).unwrap(), 0x9000_0008);
        assert_eq!(node.physical_at(PAGE_SIZE + 4).unwrap(), 0x9010_0004);
        assert!(node.physical_at(2 * PAGE_SIZE).is_err());

        node.write_words(PAGE_SIZE - 4, &[0xAA, 0xBB]).unwrap();
        assert_eq!(node.read_word(PAGE_SIZE - 4).unwrap(), 0xAA);
        assert_eq!(node.read_word(PAGE_SIZE).unwrap(), 0xBB);
        assert!(matches!(node.read_word(2), Err(N2dError::NotAligned)));
    }

    #[test]
    fn fresh_node_holds_one_reference() {
        let node = VidmemNode::new(
            Arc::new(SimulatedPlatform::new()),
            PAGE_SIZE,
            AllocatorKind::DmaCoherent,
            Backing::Contiguous(0x4000_0000),
            true,
            VidmemType::Command,
        );
        assert_eq!(node.ref_count(), 1);
        assert!(node.mapped().is_empty());
        assert_eq!(node.pages(), vec![0x4000_0000]);
    }
}
