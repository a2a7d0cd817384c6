#![allow(clippy::cast_possible_truncation)]

use super::pool::ReservedPool;
use super::{
    AllocFlags, AllocatorKind, Backing, MapFlags, Mapping, NodeState, Pool, UserMap, VidmemNode,
    VidmemType,
};
use crate::error::{N2dError, N2dResult};
use crate::kernel::mmu::{Mmu, PageFlags};
use crate::kernel::platform::{CacheOp, Platform};
use crate::utils::{PAGE_SIZE, checked_align_up, is_aligned, page_count};
use parking_lot::Mutex;
use std::sync::Arc;

/// Largest node: the whole 32-bit GPU address space.
pub const MAX_NODE_SIZE: u64 = 1 << 32;

/// `size` rounded up to whole pages.
fn node_size(size: usize) -> N2dResult<usize> {
    let size = u64::try_from(size).map_err(|_| N2dError::InvalidArgument)?;
    match checked_align_up(size, PAGE_SIZE as u64) {
        Some(rounded) if size > 0 && rounded <= MAX_NODE_SIZE => {
            usize::try_from(rounded).map_err(|_| N2dError::InvalidArgument)
        }
        _ => Err(N2dError::InvalidArgument),
    }
}

/// Creates, maps and frees video memory nodes.
pub struct VidmemAllocator {
    platform: Arc<dyn Platform>,
    mmu: Arc<Mmu>,
    reserved: Option<Mutex<ReservedPool>>,
    /// GPU addresses are physical addresses; the MMU is bypassed.
    flat: bool,
}

impl std::fmt::Debug for VidmemAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VidmemAllocator")
            .field("reserved", &self.reserved)
            .finish_non_exhaustive()
    }
}

impl VidmemAllocator {
    /// `reserved` is the `(base, size)` of the contiguous region, if any.
    #[must_use]
    pub fn new(platform: Arc<dyn Platform>, mmu: Arc<Mmu>, reserved: Option<(u64, u64)>) -> Self {
        Self {
            platform,
            mmu,
            reserved: reserved
                .filter(|&(_, size)| size > 0)
                .map(|(base, size)| Mutex::new(ReservedPool::new(base, size))),
            flat: false,
        }
    }

    /// Maps GPU views at their physical address instead of through the MMU.
    #[must_use]
    pub fn with_flat_mapping(mut self) -> Self {
        self.flat = true;
        self
    }

    #[must_use]
    pub const fn is_flat(&self) -> bool {
        self.flat
    }

    #[must_use]
    pub fn mmu(&self) -> &Arc<Mmu> {
        &self.mmu
    }

    #[must_use]
    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    // ===========================================================================================
    // Creation
    // ===========================================================================================

    /// Allocates a node of at least `size` bytes.
    ///
    /// # Errors
    /// `InvalidArgument` for a zero size, conflicting flags or a bad alignment;
    /// `OutOfMemory` when every allowed allocator is exhausted.
    pub fn allocate(
        &self,
        size: usize,
        alignment: usize,
        flags: AllocFlags,
        ty: VidmemType,
        pool: Pool,
    ) -> N2dResult<Arc<VidmemNode>> {
        if size == 0
            || flags.contains(AllocFlags::CONTIGUOUS | AllocFlags::NON_CONTIGUOUS)
            || (alignment != 0 && !alignment.is_power_of_two())
        {
            return Err(N2dError::InvalidArgument);
        }
        let size = node_size(size)?;
        let alignment = alignment.max(PAGE_SIZE);

        let candidates: &[AllocatorKind] = if flags.contains(AllocFlags::NON_CONTIGUOUS) {
            match pool {
                Pool::Reserved => return Err(N2dError::InvalidArgument),
                _ => &[AllocatorKind::NonContiguous],
            }
        } else if flags.contains(AllocFlags::CONTIGUOUS) {
            match pool {
                Pool::Default => &[
                    AllocatorKind::Reserved,
                    AllocatorKind::DmaCoherent,
                    AllocatorKind::Gfp,
                ],
                Pool::Reserved => &[AllocatorKind::Reserved],
                Pool::System => &[AllocatorKind::DmaCoherent, AllocatorKind::Gfp],
            }
        } else {
            match pool {
                Pool::Default => &[AllocatorKind::Reserved, AllocatorKind::NonContiguous],
                Pool::Reserved => &[AllocatorKind::Reserved],
                Pool::System => &[AllocatorKind::NonContiguous],
            }
        };

        for &kind in candidates {
            match self.allocate_backing(kind, size, alignment) {
                Ok(backing) => {
                    log::debug!("vidmem: {size} bytes from {kind:?} ({ty:?})");
                    return Ok(Arc::new(VidmemNode::new(
                        self.platform.clone(),
                        size,
                        kind,
                        backing,
                        flags.contains(AllocFlags::CACHEABLE),
                        ty,
                    )));
                }
                Err(N2dError::OutOfMemory) => {
                    log::trace!("vidmem: {kind:?} exhausted for {size} bytes");
                }
                Err(e) => return Err(e),
            }
        }

        Err(N2dError::OutOfMemory)
    }

    fn allocate_backing(
        &self,
        kind: AllocatorKind,
        size: usize,
        alignment: usize,
    ) -> N2dResult<Backing> {
        match kind {
            AllocatorKind::Reserved => {
                let pool = self.reserved.as_ref().ok_or(N2dError::OutOfMemory)?;
                pool.lock()
                    .allocate(size, alignment)
                    .map(Backing::Contiguous)
                    .ok_or(N2dError::OutOfMemory)
            }
            AllocatorKind::DmaCoherent => {
                let physical = self.platform.alloc_dma_coherent(size)?;
                if !is_aligned(physical, alignment as u64) {
                    self.platform.free_dma_coherent(physical, size);
                    return Err(N2dError::OutOfMemory);
                }
                Ok(Backing::Contiguous(physical))
            }
            AllocatorKind::Gfp => {
                let pages = self.platform.alloc_pages(page_count(size as u64), true)?;
                match pages.first() {
                    Some(&first) if is_aligned(first, alignment as u64) => {
                        Ok(Backing::Contiguous(first))
                    }
                    _ => {
                        self.platform.free_pages(&pages);
                        Err(N2dError::OutOfMemory)
                    }
                }
            }
            AllocatorKind::NonContiguous => self
                .platform
                .alloc_pages(page_count(size as u64), false)
                .map(Backing::Pages),
            AllocatorKind::WrapUser { .. } | AllocatorKind::WrapDmabuf { .. } => {
                Err(N2dError::InvalidArgument)
            }
        }
    }

    /// Wraps a pinned user range in a node. The node covers whole pages;
    /// [`VidmemNode::offset`] locates `logical` inside the first one.
    ///
    /// # Errors
    /// `InvalidArgument` for an empty, wrapping or oversized range, or the
    /// platform's pinning error.
    pub fn wrap_user_memory(
        &self,
        process: u32,
        logical: u64,
        size: usize,
    ) -> N2dResult<Arc<VidmemNode>> {
        let end = u64::try_from(size)
            .ok()
            .and_then(|size| logical.checked_add(size));
        match end {
            Some(end) if logical != 0 && size != 0 => {
                let first = logical & !(PAGE_SIZE as u64 - 1);
                node_size(usize::try_from(end - first).map_err(|_| N2dError::InvalidArgument)?)?;
            }
            _ => return Err(N2dError::InvalidArgument),
        }
        let pages = self.platform.pin_user_pages(process, logical, size)?;
        if pages.is_empty() {
            return Err(N2dError::InvalidArgument);
        }
        log::debug!(
            "vidmem: wrapped {} user pages at 0x{logical:x} for {process}",
            pages.len()
        );
        Ok(Arc::new(VidmemNode::new(
            self.platform.clone(),
            pages.len() * PAGE_SIZE,
            AllocatorKind::WrapUser { logical },
            Backing::Pages(pages),
            true,
            VidmemType::Surface,
        )))
    }

    /// Wraps an imported dma-buf in a node.
    ///
    /// # Errors
    /// The platform's import error.
    pub fn wrap_dmabuf(&self, fd: i32) -> N2dResult<Arc<VidmemNode>> {
        let pages = self.platform.import_dmabuf(fd)?;
        if pages.is_empty() {
            self.platform.release_dmabuf(fd);
            return Err(N2dError::InvalidArgument);
        }
        Ok(Arc::new(VidmemNode::new(
            self.platform.clone(),
            pages.len() * PAGE_SIZE,
            AllocatorKind::WrapDmabuf { fd },
            Backing::Pages(pages),
            false,
            VidmemType::Surface,
        )))
    }

    /// Exports the node as a dma-buf. Returns its fd.
    ///
    /// # Errors
    /// `NotSupported` when the platform has no dma-buf exporter.
    pub fn export(&self, node: &VidmemNode) -> N2dResult<i32> {
        self.platform.export_dmabuf(&node.pages(), node.size())
    }

    /// Cache maintenance; a no-op for uncached nodes.
    ///
    /// # Errors
    /// The platform's cache-maintenance error.
    pub fn cache(&self, node: &VidmemNode, op: CacheOp) -> N2dResult<()> {
        if !node.is_cacheable() {
            return Ok(());
        }
        self.platform.cache_op(op, &node.pages(), node.size())
    }

    // ===========================================================================================
    // Mapping
    // ===========================================================================================

    /// Creates the requested views of `node` and takes a reference.
    ///
    /// Existing kernel and GPU views are shared; a user view is per process.
    /// On failure every view created by this call is torn down again.
    ///
    /// # Errors
    /// `InvalidArgument` for an empty flag set or a released node, plus any
    /// MMU or platform error.
    pub fn map(&self, process: u32, flags: MapFlags, node: &VidmemNode) -> N2dResult<()> {
        if flags.is_empty() {
            return Err(N2dError::InvalidArgument);
        }
        let mut state = node.state.lock();
        if state.ref_count == 0 {
            return Err(N2dError::InvalidArgument);
        }

        let mut created = MapFlags::empty();
        let result = self.map_locked(process, flags, node, &mut state, &mut created);

        if let Err(e) = result {
            log::warn!("vidmem: map {flags:?} failed: {e}");
            self.teardown(process, created, node, &mut state);
            return Err(e);
        }

        // Views that already existed are shared: bump their counts.
        let shared = flags - created;
        if shared.contains(MapFlags::KERNEL) {
            if let Some(m) = state.kernel.as_mut() {
                m.count += 1;
            }
        }
        if shared.contains(MapFlags::GPU) {
            if let Some(m) = state.gpu.as_mut() {
                m.count += 1;
            }
        }
        if shared.contains(MapFlags::USER) {
            if let Some(u) = state.user.iter_mut().find(|u| u.process == process) {
                u.map_count += 1;
            }
        }

        state.ref_count += 1;
        Ok(())
    }

    fn map_locked(
        &self,
        process: u32,
        flags: MapFlags,
        node: &VidmemNode,
        state: &mut NodeState,
        created: &mut MapFlags,
    ) -> N2dResult<()> {
        if flags.contains(MapFlags::USER) && !state.user.iter().any(|u| u.process == process) {
            let logical = self
                .platform
                .map_user(process, &node.pages(), node.is_cacheable())?;
            state.user.push(UserMap {
                process,
                logical,
                map_count: 1,
            });
            created.insert(MapFlags::USER);
        }

        if flags.contains(MapFlags::KERNEL) && state.kernel.is_none() {
            let address = self.platform.map_kernel(&node.pages())?;
            state.kernel = Some(Mapping { address, count: 1 });
            created.insert(MapFlags::KERNEL);
        }

        if flags.contains(MapFlags::GPU) && state.gpu.is_none() && self.flat {
            let Backing::Contiguous(base) = node.backing() else {
                return Err(N2dError::NotSupported);
            };
            let address = u32::try_from(self.platform.cpu_to_gpu_physical(*base))
                .map_err(|_| N2dError::NotSupported)?;
            state.gpu = Some(Mapping { address, count: 1 });
            created.insert(MapFlags::GPU);
        }

        if flags.contains(MapFlags::GPU) && state.gpu.is_none() {
            let pages = node.page_count();
            let address = self.mmu.allocate_pages(pages)?;
            let mapped = match node.backing() {
                Backing::Contiguous(base) => {
                    self.mmu
                        .map_memory(*base, pages, PageFlags::WRITABLE, address)
                }
                Backing::Pages(list) => self.mmu.map_pages(list, PageFlags::WRITABLE, address),
            };
            if let Err(e) = mapped {
                self.mmu.free_pages(address, pages)?;
                return Err(e);
            }
            state.gpu = Some(Mapping { address, count: 1 });
            created.insert(MapFlags::GPU);
        }

        Ok(())
    }

    /// Drops the requested views and one reference.
    ///
    /// # Errors
    /// `InvalidArgument` when only the creation reference is left or a
    /// requested view does not exist.
    pub fn unmap(&self, process: u32, flags: MapFlags, node: &VidmemNode) -> N2dResult<()> {
        if flags.is_empty() {
            return Err(N2dError::InvalidArgument);
        }
        let mut state = node.state.lock();
        if state.ref_count <= 1 {
            return Err(N2dError::InvalidArgument);
        }

        let user = state.user.iter().position(|u| u.process == process);
        if (flags.contains(MapFlags::USER) && user.is_none())
            || (flags.contains(MapFlags::KERNEL) && state.kernel.is_none())
            || (flags.contains(MapFlags::GPU) && state.gpu.is_none())
        {
            return Err(N2dError::InvalidArgument);
        }

        let mut released = MapFlags::empty();
        if let (true, Some(i)) = (flags.contains(MapFlags::USER), user) {
            state.user[i].map_count -= 1;
            if state.user[i].map_count == 0 {
                released.insert(MapFlags::USER);
            }
        }
        if flags.contains(MapFlags::KERNEL) {
            if let Some(m) = state.kernel.as_mut() {
                m.count -= 1;
                if m.count == 0 {
                    released.insert(MapFlags::KERNEL);
                }
            }
        }
        if flags.contains(MapFlags::GPU) {
            if let Some(m) = state.gpu.as_mut() {
                m.count -= 1;
                if m.count == 0 {
                    released.insert(MapFlags::GPU);
                }
            }
        }

        self.teardown(process, released, node, &mut state);
        state.ref_count -= 1;
        Ok(())
    }

    fn teardown(&self, process: u32, flags: MapFlags, node: &VidmemNode, state: &mut NodeState) {
        if flags.contains(MapFlags::GPU) {
            if let Some(m) = state.gpu.take().filter(|_| !self.flat) {
                if let Err(e) = self.mmu.unmap_memory(m.address, node.page_count()) {
                    log::error!("vidmem: GPU unmap of 0x{:08x} failed: {e}", m.address);
                }
            }
        }
        if flags.contains(MapFlags::KERNEL) {
            if let Some(m) = state.kernel.take() {
                self.platform.unmap_kernel(m.address, node.size());
            }
        }
        if flags.contains(MapFlags::USER) {
            if let Some(i) = state.user.iter().position(|u| u.process == process) {
                let u = state.user.swap_remove(i);
                self.platform.unmap_user(u.process, u.logical, node.size());
            }
        }
    }

    // ===========================================================================================
    // Release
    // ===========================================================================================

    /// Drops one reference. The last one tears down every view and frees the
    /// backing through the allocator that produced it.
    ///
    /// # Errors
    /// `InvalidArgument` for a node that is already released.
    pub fn release(&self, node: &VidmemNode) -> N2dResult<()> {
        let mut state = node.state.lock();
        if state.ref_count == 0 {
            return Err(N2dError::InvalidArgument);
        }
        state.ref_count -= 1;
        if state.ref_count > 0 {
            return Ok(());
        }

        self.teardown(0, MapFlags::GPU | MapFlags::KERNEL, node, &mut state);
        for u in std::mem::take(&mut state.user) {
            self.platform.unmap_user(u.process, u.logical, node.size());
        }
        drop(state);

        self.free_backing(node);
        log::debug!(
            "vidmem: released {} bytes of {:?} ({:?})",
            node.size(),
            node.kind(),
            node.vidmem_type()
        );
        Ok(())
    }

    fn free_backing(&self, node: &VidmemNode) {
        match (node.kind(), node.backing()) {
            (AllocatorKind::Reserved, Backing::Contiguous(base)) => {
                if let Some(pool) = &self.reserved {
                    pool.lock().free(*base);
                }
            }
            (AllocatorKind::DmaCoherent, Backing::Contiguous(base)) => {
                self.platform.free_dma_coherent(*base, node.size());
            }
            (AllocatorKind::Gfp, _) | (AllocatorKind::NonContiguous, _) => {
                self.platform.free_pages(&node.pages());
            }
            (AllocatorKind::WrapUser { .. }, Backing::Pages(pages)) => {
                self.platform.unpin_user_pages(pages);
            }
            (AllocatorKind::WrapDmabuf { fd }, _) => self.platform.release_dmabuf(fd),
            (kind, _) => log::error!("vidmem: {kind:?} node with mismatched backing"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::sim::SimulatedPlatform;
    use std::thread;

    const RESERVED_BASE: u64 = 0x1000_0000;

    fn allocator(platform: SimulatedPlatform, reserved_pages: u64) -> VidmemAllocator {
        let platform: Arc<dyn Platform> = Arc::new(platform);
        let mmu = Arc::new(Mmu::new(platform.clone(), 4).unwrap());
        VidmemAllocator::new(
            platform,
            mmu,
            Some((RESERVED_BASE, reserved_pages * PAGE_SIZE as u64)),
        )
    }

    #[test]
    fn default_flags_fall_back_to_scattered_pages() {
        let vm = allocator(SimulatedPlatform::new(), 1);
        let a = vm
            .allocate(100, 0, AllocFlags::empty(), VidmemType::Generic, Pool::Default)
            .unwrap();
        assert_eq!(a.kind(), AllocatorKind::Reserved);
        assert_eq!(a.size(), PAGE_SIZE);

        let b = vm
            .allocate(PAGE_SIZE * 2, 0, AllocFlags::empty(), VidmemType::Generic, Pool::Default)
            .unwrap();
        assert_eq!(b.kind(), AllocatorKind::NonContiguous);
        assert!(b.contiguous_base().is_none());
    }

    #[test]
    fn contiguous_chain_ends_in_gfp() {
        // Room for the MMU tables only.
        let vm = allocator(SimulatedPlatform::new().with_dma_budget(2 * PAGE_SIZE), 0);
        let node = vm
            .allocate(PAGE_SIZE, 0, AllocFlags::CONTIGUOUS, VidmemType::Generic, Pool::Default)
            .unwrap();
        assert_eq!(node.kind(), AllocatorKind::Gfp);

        assert!(matches!(
            vm.allocate(PAGE_SIZE, 0, AllocFlags::CONTIGUOUS, VidmemType::Generic, Pool::Reserved),
            Err(N2dError::OutOfMemory)
        ));
    }

    #[test]
    fn concurrent_contiguous_requests_split_across_allocators() {
        let vm = Arc::new(allocator(SimulatedPlatform::new(), 1));
        let workers: Vec<_> = (0..2)
            .map(|_| {
                let vm = vm.clone();
                thread::spawn(move || {
                    vm.allocate(
                        PAGE_SIZE,
                        0,
                        AllocFlags::CONTIGUOUS,
                        VidmemType::Generic,
                        Pool::Default,
                    )
                    .unwrap()
                    .kind()
                })
            })
            .collect();

        let mut kinds: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
        kinds.sort_by_key(|k| *k == AllocatorKind::DmaCoherent);
        assert_eq!(kinds, [AllocatorKind::Reserved, AllocatorKind::DmaCoherent]);
    }

    #[test]
    fn map_and_unmap_track_references() {
        let vm = allocator(SimulatedPlatform::new(), 4);
        let node = vm
            .allocate(PAGE_SIZE * 2, 0, AllocFlags::CONTIGUOUS, VidmemType::Generic, Pool::Default)
            .unwrap();
        assert_eq!(node.ref_count(), 1);
        assert!(matches!(
            vm.unmap(1, MapFlags::GPU, &node),
            Err(N2dError::InvalidArgument)
        ));

        vm.map(1, MapFlags::GPU, &node).unwrap();
        assert_eq!(node.ref_count(), 2);
        let va = node.gpu_address().unwrap();
        assert_eq!(vm.mmu().get_physical(va + 4).unwrap(), RESERVED_BASE + 4);

        // A second GPU map shares the VA.
        vm.map(2, MapFlags::GPU, &node).unwrap();
        assert_eq!(node.gpu_address(), Some(va));
        assert_eq!(node.ref_count(), 3);

        vm.unmap(2, MapFlags::GPU, &node).unwrap();
        assert_eq!(node.gpu_address(), Some(va));
        vm.unmap(1, MapFlags::GPU, &node).unwrap();
        assert_eq!(node.ref_count(), 1);
        assert!(node.mapped().is_empty());
        assert!(vm.mmu().get_physical(va).is_err());
    }

    #[test]
    fn user_views_are_counted_per_process() {
        let vm = allocator(SimulatedPlatform::new(), 4);
        let node = vm
            .allocate(PAGE_SIZE, 0, AllocFlags::CACHEABLE, VidmemType::Generic, Pool::Default)
            .unwrap();

        vm.map(7, MapFlags::USER, &node).unwrap();
        vm.map(7, MapFlags::USER, &node).unwrap();
        assert_eq!(node.user_map(7).unwrap().map_count, 2);
        assert!(node.user_map(8).is_none());
        assert!(matches!(
            vm.unmap(8, MapFlags::USER, &node),
            Err(N2dError::InvalidArgument)
        ));

        vm.unmap(7, MapFlags::USER, &node).unwrap();
        vm.unmap(7, MapFlags::USER, &node).unwrap();
        assert!(node.user_map(7).is_none());
    }

    #[test]
    fn release_frees_mappings_and_backing() {
        let vm = allocator(SimulatedPlatform::new(), 1);
        let node = vm
            .allocate(PAGE_SIZE, 0, AllocFlags::CONTIGUOUS, VidmemType::Generic, Pool::Reserved)
            .unwrap();
        vm.map(1, MapFlags::GPU | MapFlags::KERNEL, &node).unwrap();
        let free_before = vm.mmu().free_page_count().unwrap();

        vm.release(&node).unwrap();
        assert_eq!(node.ref_count(), 1);
        vm.release(&node).unwrap();
        assert_eq!(node.ref_count(), 0);
        assert_eq!(vm.mmu().free_page_count().unwrap(), free_before + 1);
        assert!(matches!(vm.release(&node), Err(N2dError::InvalidArgument)));

        // The reserved page is available again.
        let again = vm
            .allocate(PAGE_SIZE, 0, AllocFlags::CONTIGUOUS, VidmemType::Generic, Pool::Reserved)
            .unwrap();
        assert_eq!(again.contiguous_base(), Some(RESERVED_BASE));
    }

    #[test]
    fn scattered_nodes_map_their_real_pages() {
        let vm = allocator(SimulatedPlatform::new(), 0);
        let node = vm
            .allocate(PAGE_SIZE * 2, 0, AllocFlags::NON_CONTIGUOUS, VidmemType::Generic, Pool::Default)
            .unwrap();
        vm.map(1, MapFlags::GPU, &node).unwrap();
        let va = node.gpu_address().unwrap();
        let pages = node.pages();
        assert_eq!(vm.mmu().get_physical(va).unwrap(), pages[0]);
        assert_eq!(vm.mmu().get_physical(va + 4096).unwrap(), pages[1]);
        assert_ne!(pages[1], pages[0] + 4096);
    }

    #[test]
    fn wrapped_user_memory_is_unpinned_on_release() {
        let vm = allocator(SimulatedPlatform::new(), 0);
        let node = vm.wrap_user_memory(3, 0x7000_0010, PAGE_SIZE).unwrap();
        assert_eq!(node.page_count(), 2);
        assert!(matches!(node.kind(), AllocatorKind::WrapUser { .. }));
        vm.cache(&node, CacheOp::Flush).unwrap();
        vm.release(&node).unwrap();

        assert!(vm.wrap_user_memory(3, 0, PAGE_SIZE).is_err());
    }

    #[test]
    fn dmabuf_round_trip() {
        let platform = SimulatedPlatform::new();
        let fd = platform.create_dmabuf(3).unwrap();
        let vm = allocator(platform, 0);
        let node = vm.wrap_dmabuf(fd).unwrap();
        assert_eq!(node.size(), 3 * PAGE_SIZE);
        let exported = vm.export(&node).unwrap();
        assert_ne!(exported, fd);
        assert!(vm.wrap_dmabuf(-5).is_err());
    }

    #[test]
    fn flat_mapping_uses_physical_addresses() {
        let platform: Arc<dyn Platform> = Arc::new(SimulatedPlatform::new());
        let mmu = Arc::new(Mmu::new(platform.clone(), 1).unwrap());
        let vm = VidmemAllocator::new(platform, mmu, Some((RESERVED_BASE, 0x10_000)))
            .with_flat_mapping();

        let node = vm
            .allocate(PAGE_SIZE, 0, AllocFlags::CONTIGUOUS, VidmemType::Generic, Pool::Default)
            .unwrap();
        vm.map(1, MapFlags::GPU, &node).unwrap();
        assert_eq!(node.gpu_address(), Some(RESERVED_BASE as u32));
        vm.unmap(1, MapFlags::GPU, &node).unwrap();

        let scattered = vm
            .allocate(PAGE_SIZE, 0, AllocFlags::NON_CONTIGUOUS, VidmemType::Generic, Pool::Default)
            .unwrap();
        assert!(matches!(
            vm.map(1, MapFlags::GPU, &scattered),
            Err(N2dError::NotSupported)
        ));
        assert_eq!(scattered.ref_count(), 1);
    }

    #[test]
    fn rejects_conflicting_flags() {
        let vm = allocator(SimulatedPlatform::new(), 1);
        assert!(matches!(
            vm.allocate(
                PAGE_SIZE,
                0,
                AllocFlags::CONTIGUOUS | AllocFlags::NON_CONTIGUOUS,
                VidmemType::Generic,
                Pool::Default
            ),
            Err(N2dError::InvalidArgument)
        ));
        assert!(vm.allocate(0, 0, AllocFlags::empty(), VidmemType::Generic, Pool::Default).is_err());
        assert!(vm.allocate(PAGE_SIZE, 3, AllocFlags::empty(), VidmemType::Generic, Pool::Default).is_err());
    }
}
