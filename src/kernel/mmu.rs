//! GPU MMU: two-level page tables over a 32-bit GPU virtual address space.
//!
//! Layout: `[MTLB: 10 bits][STLB: 10 bits][Offset: 12 bits]`.
//!
//! The dynamic area covers `mtlb_count` master entries starting at MTLB index 1,
//! so GPU VA 0 is never handed out. Every 4K page of the area has one 32-bit
//! word in `map`. Words of pages that are not allocated double as the free list:
//!
//! - `USED`   (`0x00` in bits [7:4]): allocated; the word is the page entry.
//! - `SINGLE` (`0x10`): one free page, next node index in bits [31:8].
//! - `FREE`   (`0x20`): a free run, length in bits [31:8], next node index in
//!   the following word.
//!
//! Freed runs are pushed on the head of the list without merging; adjacent runs
//! are coalesced lazily by `collect` when an allocation runs off the list.

#![allow(clippy::cast_possible_truncation)]

use crate::error::{N2dError, N2dResult};
use crate::kernel::platform::Platform;
use crate::kernel::regs::{self, CommandWriter};
use crate::utils::{PAGE_SHIFT, PAGE_SIZE, is_aligned};
use bitflags::bitflags;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub const MTLB_SHIFT: u32 = 22;
pub const MTLB_ENTRIES: usize = 1024;
pub const STLB_ENTRIES: usize = 1024;
/// First MTLB index of the dynamic area.
pub const FIRST_MTLB: usize = 1;

pub const ENTRY_PRESENT: u32 = 1 << 0;
pub const ENTRY_WRITABLE: u32 = 1 << 2;

bitflags! {
    /// Access bits written into page entries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PageFlags: u32 {
        const WRITABLE = ENTRY_WRITABLE;
    }
}

const TYPE_MASK: u32 = 0xF0;
const TYPE_USED: u32 = 0x00;
const TYPE_SINGLE: u32 = 0x10;
const TYPE_FREE: u32 = 0x20;

/// End of the free list.
const END: u32 = !0;

const MTLB_ALIGN: u64 = 4096;
const SAFE_ALIGN: u64 = 64;

/// Decoded view of one page-table word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Used,
    Single { next: u32 },
    Free { count: u32, next: u32 },
}

#[derive(Debug)]
struct Area {
    map: Vec<u32>,
    heap_list: u32,
    free_nodes: bool,
    /// One bit per page handed out by `allocate_pages` and not yet freed.
    allocated: Vec<u64>,
    /// Physical address of the STLB backing each MTLB slot of the area.
    stlbs: Vec<Option<u64>>,
}

impl Area {
    fn entries(&self) -> usize {
        self.map.len()
    }

    fn set_allocated(&mut self, start: usize, count: usize, allocated: bool) {
        for i in start..start + count {
            if allocated {
                self.allocated[i / 64] |= 1 << (i % 64);
            } else {
                self.allocated[i / 64] &= !(1 << (i % 64));
            }
        }
    }

    fn is_allocated(&self, start: usize, count: usize) -> bool {
        (start..start + count).all(|i| self.allocated[i / 64] & (1 << (i % 64)) != 0)
    }

    fn is_end(&self, index: u32) -> bool {
        index as usize >= self.entries()
    }

    fn slot(&self, index: u32) -> N2dResult<Slot> {
        let i = index as usize;
        let word = self.map[i];
        match word & TYPE_MASK {
            TYPE_USED => Ok(Slot::Used),
            TYPE_SINGLE => Ok(Slot::Single { next: word >> 8 }),
            TYPE_FREE => match self.map.get(i + 1) {
                Some(&next) => Ok(Slot::Free {
                    count: word >> 8,
                    next,
                }),
                None => Err(corrupted(index)),
            },
            _ => Err(corrupted(index)),
        }
    }

    fn link(&mut self, previous: u32, next: u32) -> N2dResult<()> {
        if self.is_end(previous) {
            self.heap_list = next;
            return Ok(());
        }
        match self.slot(previous)? {
            Slot::Single { .. } => self.map[previous as usize] = (next << 8) | TYPE_SINGLE,
            Slot::Free { .. } => self.map[previous as usize + 1] = next,
            Slot::Used => return Err(corrupted(previous)),
        }
        Ok(())
    }

    fn add_free(&mut self, previous: u32, node: u32, count: u32) -> N2dResult<()> {
        let n = node as usize;
        if count == 1 {
            self.map[n] = (END << 8) | TYPE_SINGLE;
        } else {
            self.map[n] = (count << 8) | TYPE_FREE;
            self.map[n + 1] = END;
        }
        self.link(previous, node)
    }

    /// Rebuilds the free list, merging adjacent free entries.
    fn collect(&mut self) -> N2dResult<()> {
        let mut previous = END;
        let mut start = 0u32;
        let mut count = 0u32;

        self.heap_list = END;
        self.free_nodes = false;

        let mut i = 0u32;
        while (i as usize) < self.entries() {
            match self.slot(i)? {
                Slot::Used => {
                    if count > 0 {
                        self.add_free(previous, start, count)?;
                        previous = start;
                        count = 0;
                    }
                    i += 1;
                }
                Slot::Single { .. } => {
                    if count == 0 {
                        start = i;
                    }
                    count += 1;
                    i += 1;
                }
                Slot::Free { count: run, .. } => {
                    if run < 2 || (i + run) as usize > self.entries() {
                        return Err(corrupted(i));
                    }
                    if count == 0 {
                        start = i;
                    }
                    count += run;
                    i += run;
                }
            }
        }

        if count > 0 {
            self.add_free(previous, start, count)?;
        }

        log::trace!("mmu: collected free list, head {}", self.heap_list);
        Ok(())
    }

    /// First-fit search. Returns `(node, previous)`.
    fn find(&self, page_count: u32) -> N2dResult<Option<(u32, u32)>> {
        let mut previous = END;
        let mut index = self.heap_list;

        while !self.is_end(index) {
            match self.slot(index)? {
                Slot::Single { next } => {
                    if page_count == 1 {
                        return Ok(Some((index, previous)));
                    }
                    previous = index;
                    index = next;
                }
                Slot::Free { count, next } => {
                    if page_count <= count {
                        return Ok(Some((index, previous)));
                    }
                    previous = index;
                    index = next;
                }
                Slot::Used => return Err(corrupted(index)),
            }
        }

        Ok(None)
    }

    /// Takes `page_count` pages out of the node found by `find`. Returns the
    /// first index of the allocated run.
    fn take(&mut self, node: u32, previous: u32, page_count: u32) -> N2dResult<u32> {
        let mut index = node;
        match self.slot(node)? {
            Slot::Single { next } => self.link(previous, next)?,
            Slot::Free { count, next } => match count - page_count {
                0 => self.link(previous, next)?,
                1 => {
                    self.map[node as usize] = (next << 8) | TYPE_SINGLE;
                    index += 1;
                }
                left => {
                    self.map[node as usize] = (left << 8) | TYPE_FREE;
                    index += left;
                }
            },
            Slot::Used => return Err(corrupted(node)),
        }

        let start = index as usize;
        self.map[start..start + page_count as usize].fill(TYPE_USED);
        self.set_allocated(start, page_count as usize, true);
        Ok(index)
    }
}

fn corrupted(index: u32) -> N2dError {
    log::error!("mmu: page table corrupted at index {index}");
    N2dError::HeapCorrupted
}

/// The GPU MMU shared by all cores of a device.
pub struct Mmu {
    platform: Arc<dyn Platform>,
    area: Mutex<Area>,
    mtlb_physical: u64,
    safe_physical: u64,
    page_dirty: AtomicBool,
}

impl std::fmt::Debug for Mmu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mmu")
            .field("mtlb_physical", &format_args!("0x{:x}", self.mtlb_physical))
            .field("safe_physical", &format_args!("0x{:x}", self.safe_physical))
            .field("page_dirty", &self.page_dirty.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Mmu {
    /// Builds the MMU with a dynamic area of `mtlb_count` master entries.
    ///
    /// # Errors
    /// `InvalidArgument` for an area that does not fit the MTLB, `NotAligned`
    /// when the platform returns a misaligned MTLB or safe page, and any
    /// allocation failure of the platform.
    pub fn new(platform: Arc<dyn Platform>, mtlb_count: usize) -> N2dResult<Self> {
        if mtlb_count == 0 || FIRST_MTLB + mtlb_count > MTLB_ENTRIES {
            return Err(N2dError::InvalidArgument);
        }

        let mtlb_physical = platform.alloc_dma_coherent(PAGE_SIZE)?;
        if !is_aligned(mtlb_physical, MTLB_ALIGN) {
            platform.free_dma_coherent(mtlb_physical, PAGE_SIZE);
            return Err(N2dError::NotAligned);
        }

        let safe_physical = match platform.alloc_dma_coherent(PAGE_SIZE) {
            Ok(p) if is_aligned(p, SAFE_ALIGN) => p,
            Ok(p) => {
                platform.free_dma_coherent(p, PAGE_SIZE);
                platform.free_dma_coherent(mtlb_physical, PAGE_SIZE);
                return Err(N2dError::NotAligned);
            }
            Err(e) => {
                platform.free_dma_coherent(mtlb_physical, PAGE_SIZE);
                return Err(e);
            }
        };

        platform.zero(mtlb_physical, PAGE_SIZE);
        platform.zero(safe_physical, PAGE_SIZE);

        let entries = mtlb_count * STLB_ENTRIES;
        let mut area = Area {
            map: vec![TYPE_USED; entries],
            heap_list: END,
            free_nodes: false,
            allocated: vec![0; entries.div_ceil(64)],
            stlbs: vec![None; mtlb_count],
        };
        area.add_free(END, 0, entries as u32)?;

        log::debug!(
            "mmu: {} pages of GPU VA at 0x{:x}, MTLB 0x{:x}",
            entries,
            Self::address_of(0),
            mtlb_physical
        );

        Ok(Self {
            platform,
            area: Mutex::new(area),
            mtlb_physical,
            safe_physical,
            page_dirty: AtomicBool::new(false),
        })
    }

    const fn address_of(index: u32) -> u32 {
        (((FIRST_MTLB * STLB_ENTRIES) as u32) + index) << PAGE_SHIFT
    }

    fn index_of(area: &Area, address: u32, page_count: usize) -> N2dResult<u32> {
        if !is_aligned(u64::from(address), PAGE_SIZE as u64) {
            return Err(N2dError::NotAligned);
        }
        let page = (address >> PAGE_SHIFT) as usize;
        let index = page
            .checked_sub(FIRST_MTLB * STLB_ENTRIES)
            .ok_or(N2dError::InvalidArgument)?;
        if page_count == 0 || index + page_count > area.entries() {
            return Err(N2dError::InvalidArgument);
        }
        Ok(index as u32)
    }

    #[must_use]
    pub fn mtlb_physical(&self) -> u64 {
        self.mtlb_physical
    }

    #[must_use]
    pub fn safe_physical(&self) -> u64 {
        self.safe_physical
    }

    #[must_use]
    pub fn total_pages(&self) -> usize {
        self.area.lock().entries()
    }

    /// Whether page tables changed since the last `take_page_dirty`.
    #[must_use]
    pub fn page_dirty(&self) -> bool {
        self.page_dirty.load(Ordering::Acquire)
    }

    /// Consumes the dirty flag; the caller must emit a TLB flush.
    pub fn take_page_dirty(&self) -> bool {
        self.page_dirty.swap(false, Ordering::AcqRel)
    }

    pub fn mark_dirty(&self) {
        self.page_dirty.store(true, Ordering::Release);
    }

    // ===========================================================================================
    // Virtual address allocation
    // ===========================================================================================

    /// Reserves `page_count` contiguous pages of GPU VA.
    ///
    /// # Errors
    /// `InvalidArgument` for 0 or more pages than the area holds,
    /// `OutOfResources` when no run is large enough even after coalescing,
    /// `HeapCorrupted` on an invalid free-list tag.
    pub fn allocate_pages(&self, page_count: usize) -> N2dResult<u32> {
        let mut area = self.area.lock();
        if page_count == 0 || page_count > area.entries() {
            return Err(N2dError::InvalidArgument);
        }
        let count = page_count as u32;

        let (node, previous) = loop {
            if let Some(found) = area.find(count)? {
                break found;
            }
            if !area.free_nodes {
                return Err(N2dError::OutOfResources);
            }
            area.collect()?;
        };

        let index = area.take(node, previous, count)?;
        let address = Self::address_of(index);
        log::trace!("mmu: allocated {page_count} pages at 0x{address:08x}");
        Ok(address)
    }

    /// Returns a run to the free list. Coalescing is deferred.
    ///
    /// # Errors
    /// `NotAligned` / `InvalidArgument` for an address outside the area, and
    /// `InvalidArgument` for a run that is not allocated.
    pub fn free_pages(&self, address: u32, page_count: usize) -> N2dResult<()> {
        let mut area = self.area.lock();
        Self::free_locked(&mut area, address, page_count)
    }

    fn free_locked(area: &mut Area, address: u32, page_count: usize) -> N2dResult<()> {
        let index = Self::index_of(area, address, page_count)?;
        let start = index as usize;

        if !area.is_allocated(start, page_count) {
            log::warn!("mmu: free of unallocated run 0x{address:08x} ({page_count} pages)");
            return Err(N2dError::InvalidArgument);
        }
        area.set_allocated(start, page_count, false);

        let head = area.heap_list;
        if page_count == 1 {
            area.map[start] = (head << 8) | TYPE_SINGLE;
        } else {
            area.map[start] = ((page_count as u32) << 8) | TYPE_FREE;
            area.map[start + 1] = head;
        }
        area.heap_list = index;
        area.free_nodes = true;
        Ok(())
    }

    // ===========================================================================================
    // Page table updates
    // ===========================================================================================

    /// Maps `page_count` physically sequential pages starting at `physical`.
    ///
    /// # Errors
    /// See [`Mmu::map_pages`].
    pub fn map_memory(
        &self,
        physical: u64,
        page_count: usize,
        flags: PageFlags,
        gpu_address: u32,
    ) -> N2dResult<()> {
        let pages: Vec<u64> = (0..page_count)
            .map(|i| physical + (i * PAGE_SIZE) as u64)
            .collect();
        self.map_pages(&pages, flags, gpu_address)
    }

    /// Maps an explicit page list at `gpu_address`.
    ///
    /// # Errors
    /// `NotAligned` for unaligned addresses, `InvalidArgument` for a range
    /// outside an allocated run, `NotSupported` for GPU physical addresses
    /// above 4 GiB.
    pub fn map_pages(&self, pages: &[u64], flags: PageFlags, gpu_address: u32) -> N2dResult<()> {
        let mut area = self.area.lock();
        let index = Self::index_of(&area, gpu_address, pages.len())? as usize;

        let mut entries = Vec::with_capacity(pages.len());
        for &page in pages {
            if !is_aligned(page, PAGE_SIZE as u64) {
                return Err(N2dError::NotAligned);
            }
            let gpu_physical = self.platform.cpu_to_gpu_physical(page);
            let gpu_physical = u32::try_from(gpu_physical).map_err(|_| N2dError::NotSupported)?;
            entries.push(gpu_physical | flags.bits() | ENTRY_PRESENT);
        }

        if !area.is_allocated(index, pages.len()) {
            return Err(N2dError::InvalidArgument);
        }

        for (i, entry) in entries.iter().enumerate() {
            self.write_entry(&mut area, index + i, *entry)?;
        }

        self.mark_dirty();
        log::trace!(
            "mmu: mapped {} pages at 0x{gpu_address:08x}",
            pages.len()
        );
        Ok(())
    }

    /// Clears the page entries and releases the VA run.
    ///
    /// # Errors
    /// Same as [`Mmu::free_pages`].
    pub fn unmap_memory(&self, gpu_address: u32, page_count: usize) -> N2dResult<()> {
        let mut area = self.area.lock();
        let index = Self::index_of(&area, gpu_address, page_count)? as usize;
        if !area.is_allocated(index, page_count) {
            return Err(N2dError::InvalidArgument);
        }

        for i in index..index + page_count {
            area.map[i] = TYPE_USED;
            let slot = i / STLB_ENTRIES;
            if let Some(stlb) = area.stlbs[slot] {
                self.platform
                    .write_u32(stlb + ((i % STLB_ENTRIES) * 4) as u64, 0);
            }
        }

        Self::free_locked(&mut area, gpu_address, page_count)?;
        self.mark_dirty();
        log::trace!("mmu: unmapped {page_count} pages at 0x{gpu_address:08x}");
        Ok(())
    }

    fn write_entry(&self, area: &mut Area, index: usize, entry: u32) -> N2dResult<()> {
        let slot = index / STLB_ENTRIES;
        let stlb = match area.stlbs[slot] {
            Some(stlb) => stlb,
            None => {
                let stlb = self.allocate_stlb(slot)?;
                area.stlbs[slot] = Some(stlb);
                stlb
            }
        };
        area.map[index] = entry;
        self.platform
            .write_u32(stlb + ((index % STLB_ENTRIES) * 4) as u64, entry);
        Ok(())
    }

    fn allocate_stlb(&self, slot: usize) -> N2dResult<u64> {
        let stlb = self.platform.alloc_dma_coherent(PAGE_SIZE)?;
        if !is_aligned(stlb, PAGE_SIZE as u64) {
            self.platform.free_dma_coherent(stlb, PAGE_SIZE);
            return Err(N2dError::NotAligned);
        }
        let gpu_stlb =
            u32::try_from(self.platform.cpu_to_gpu_physical(stlb)).map_err(|_| {
                self.platform.free_dma_coherent(stlb, PAGE_SIZE);
                N2dError::NotSupported
            })?;
        self.platform.zero(stlb, PAGE_SIZE);
        self.platform.write_u32(
            self.mtlb_physical + ((FIRST_MTLB + slot) * 4) as u64,
            gpu_stlb | ENTRY_PRESENT,
        );
        log::debug!("mmu: STLB {} at 0x{stlb:x}", FIRST_MTLB + slot);
        Ok(stlb)
    }

    /// Translates a GPU VA through the MTLB and STLB in memory.
    ///
    /// # Errors
    /// `NotFound` when either level is not present.
    pub fn get_physical(&self, gpu_address: u32) -> N2dResult<u64> {
        let mtlb_index = (gpu_address >> MTLB_SHIFT) as u64;
        let stlb_index = u64::from((gpu_address >> PAGE_SHIFT) & (STLB_ENTRIES as u32 - 1));

        let mtlb_entry = self.platform.read_u32(self.mtlb_physical + mtlb_index * 4);
        if mtlb_entry & ENTRY_PRESENT == 0 {
            return Err(N2dError::NotFound);
        }
        let stlb = self
            .platform
            .gpu_to_cpu_physical(u64::from(mtlb_entry & !(PAGE_SIZE as u32 - 1)));

        let entry = self.platform.read_u32(stlb + stlb_index * 4);
        if entry & ENTRY_PRESENT == 0 {
            return Err(N2dError::NotFound);
        }
        let page = self
            .platform
            .gpu_to_cpu_physical(u64::from(entry & !(PAGE_SIZE as u32 - 1)));
        Ok(page | u64::from(gpu_address & (PAGE_SIZE as u32 - 1)))
    }

    /// The command sequence that points the front end at this MMU.
    ///
    /// # Errors
    /// `NotSupported` when the tables sit above 4 GiB of GPU physical space.
    pub fn enable_commands(&self) -> N2dResult<CommandWriter> {
        let mtlb = u32::try_from(self.platform.cpu_to_gpu_physical(self.mtlb_physical))
            .map_err(|_| N2dError::NotSupported)?;
        let safe = u32::try_from(self.platform.cpu_to_gpu_physical(self.safe_physical))
            .map_err(|_| N2dError::NotSupported)?;

        let mut w = CommandWriter::new();
        w.load_state(regs::STATE_MMU_CONFIG, mtlb | regs::MMU_CONFIG_MODE_4K)
            .load_state(regs::STATE_MMU_SAFE_ADDRESS, safe)
            .semaphore_stall();
        Ok(w)
    }

    /// Number of free pages in the dynamic area.
    ///
    /// # Errors
    /// `HeapCorrupted` when the table holds an invalid tag.
    pub fn free_page_count(&self) -> N2dResult<usize> {
        self.check_integrity()
    }

    /// Walks the whole table checking every tag. Returns the free page count.
    ///
    /// # Errors
    /// `HeapCorrupted` on the first invalid tag.
    pub fn check_integrity(&self) -> N2dResult<usize> {
        let area = self.area.lock();
        let mut free = 0usize;
        let mut i = 0u32;
        while (i as usize) < area.entries() {
            match area.slot(i)? {
                Slot::Used => i += 1,
                Slot::Single { .. } => {
                    free += 1;
                    i += 1;
                }
                Slot::Free { count, .. } => {
                    if count < 2 {
                        return Err(corrupted(i));
                    }
                    free += count as usize;
                    i += count;
                }
            }
        }
        Ok(free)
    }

    #[cfg(test)]
    fn poke_table(&self, index: usize, word: u32) {
        self.area.lock().map[index] = word;
    }
}

impl Drop for Mmu {
    fn drop(&mut self) {
        for stlb in self.area.get_mut().stlbs.iter().flatten() {
            self.platform.free_dma_coherent(*stlb, PAGE_SIZE);
        }
        self.platform.free_dma_coherent(self.safe_physical, PAGE_SIZE);
        self.platform.free_dma_coherent(self.mtlb_physical, PAGE_SIZE);
    }
}
