//! Simulated platform and GPU register file.
//!
//! Used for bring-up without hardware and as the fixture of the test-suite.
//! Physical memory is sparse: pages materialise on first touch.

#![allow(clippy::cast_possible_truncation)]

use crate::error::{N2dError, N2dResult};
use crate::kernel::platform::{CacheOp, Platform, RegisterIo};
use crate::kernel::regs;
use crate::utils::{PAGE_SHIFT, PAGE_SIZE};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

const WORDS_PER_PAGE: usize = PAGE_SIZE / 4;

/// Base of the simulated DMA-coherent region.
pub const SIM_DMA_BASE: u64 = 0x4000_0000;
/// Base of the simulated page allocator region.
pub const SIM_PAGE_BASE: u64 = 0x8000_0000;
/// Base of simulated user mappings.
pub const SIM_USER_BASE: u64 = 0x7F00_0000_0000;

// ===============================================================================================
// Platform
// ===============================================================================================

/// A host-memory platform with optional allocation budgets.
#[derive(Debug)]
pub struct SimulatedPlatform {
    memory: Mutex<HashMap<u64, Box<[u32; WORDS_PER_PAGE]>>>,
    next_dma: AtomicU64,
    next_page: AtomicU64,
    next_user: AtomicU64,
    next_fd: AtomicU32,
    /// Remaining DMA-coherent bytes; `usize::MAX` means unlimited.
    dma_budget: AtomicUsize,
    /// Remaining pages for `alloc_pages`.
    page_budget: AtomicUsize,
    dmabufs: Mutex<HashMap<i32, Vec<u64>>>,
    power: Mutex<HashMap<usize, bool>>,
    clock: Mutex<HashMap<usize, bool>>,
    pub resets: AtomicU32,
    pub cache_ops: AtomicU32,
    pub dma_allocations: AtomicU32,
}

impl Default for SimulatedPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedPlatform {
    #[must_use]
    pub fn new() -> Self {
        Self {
            memory: Mutex::new(HashMap::new()),
            next_dma: AtomicU64::new(SIM_DMA_BASE),
            next_page: AtomicU64::new(SIM_PAGE_BASE),
            next_user: AtomicU64::new(SIM_USER_BASE),
            next_fd: AtomicU32::new(100),
            dma_budget: AtomicUsize::new(usize::MAX),
            page_budget: AtomicUsize::new(usize::MAX),
            dmabufs: Mutex::new(HashMap::new()),
            power: Mutex::new(HashMap::new()),
            clock: Mutex::new(HashMap::new()),
            resets: AtomicU32::new(0),
            cache_ops: AtomicU32::new(0),
            dma_allocations: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn with_dma_budget(self, bytes: usize) -> Self {
        self.dma_budget.store(bytes, Ordering::Relaxed);
        self
    }

    #[must_use]
    pub fn with_page_budget(self, pages: usize) -> Self {
        self.page_budget.store(pages, Ordering::Relaxed);
        self
    }

    #[must_use]
    pub fn is_powered(&self, core: usize) -> bool {
        self.power.lock().get(&core).copied().unwrap_or(false)
    }

    #[must_use]
    pub fn is_clocked(&self, core: usize) -> bool {
        self.clock.lock().get(&core).copied().unwrap_or(false)
    }

    /// Registers a dma-buf backed by `page_count` fresh pages. Returns its fd.
    ///
    /// # Errors
    /// `OutOfMemory` when the page budget is exhausted.
    pub fn create_dmabuf(&self, page_count: usize) -> N2dResult<i32> {
        let pages = self.alloc_pages(page_count, false)?;
        let fd = self.next_fd.fetch_add(1, Ordering::Relaxed) as i32;
        self.dmabufs.lock().insert(fd, pages);
        Ok(fd)
    }

    fn take_budget(budget: &AtomicUsize, amount: usize) -> N2dResult<()> {
        budget
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| {
                if left == usize::MAX {
                    Some(left)
                } else {
                    left.checked_sub(amount)
                }
            })
            .map(|_| ())
            .map_err(|_| N2dError::OutOfMemory)
    }
}

impl Platform for SimulatedPlatform {
    fn set_power(&self, core: usize, on: bool) -> N2dResult<()> {
        self.power.lock().insert(core, on);
        Ok(())
    }

    fn set_clock(&self, core: usize, on: bool) -> N2dResult<()> {
        self.clock.lock().insert(core, on);
        Ok(())
    }

    fn reset(&self, _core: usize) -> N2dResult<()> {
        self.resets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn alloc_dma_coherent(&self, size: usize) -> N2dResult<u64> {
        let size = size.next_multiple_of(PAGE_SIZE);
        Self::take_budget(&self.dma_budget, size)?;
        self.dma_allocations.fetch_add(1, Ordering::Relaxed);
        Ok(self.next_dma.fetch_add(size as u64, Ordering::Relaxed))
    }

    fn free_dma_coherent(&self, physical: u64, size: usize) {
        let mut memory = self.memory.lock();
        for off in (0..size).step_by(PAGE_SIZE) {
            memory.remove(&((physical + off as u64) >> PAGE_SHIFT));
        }
    }

    fn alloc_pages(&self, count: usize, contiguous: bool) -> N2dResult<Vec<u64>> {
        Self::take_budget(&self.page_budget, count)?;
        // Scattered allocations leave a hole after every page so that they are
        // never accidentally contiguous.
        let stride = if contiguous { 1 } else { 2 };
        let base = self
            .next_page
            .fetch_add((count * stride * PAGE_SIZE) as u64, Ordering::Relaxed);
        Ok((0..count)
            .map(|i| base + (i * stride * PAGE_SIZE) as u64)
            .collect())
    }

    fn free_pages(&self, pages: &[u64]) {
        let mut memory = self.memory.lock();
        for p in pages {
            memory.remove(&(p >> PAGE_SHIFT));
        }
    }

    fn read_u32(&self, physical: u64) -> u32 {
        let memory = self.memory.lock();
        memory
            .get(&(physical >> PAGE_SHIFT))
            .map_or(0, |page| page[(physical as usize & (PAGE_SIZE - 1)) / 4])
    }

    fn write_u32(&self, physical: u64, value: u32) {
        let mut memory = self.memory.lock();
        let page = memory
            .entry(physical >> PAGE_SHIFT)
            .or_insert_with(|| Box::new([0; WORDS_PER_PAGE]));
        page[(physical as usize & (PAGE_SIZE - 1)) / 4] = value;
    }

    fn map_user(&self, _process: u32, pages: &[u64], _cacheable: bool) -> N2dResult<u64> {
        Ok(self
            .next_user
            .fetch_add((pages.len() * PAGE_SIZE) as u64, Ordering::Relaxed))
    }

    fn pin_user_pages(&self, _process: u32, logical: u64, size: usize) -> N2dResult<Vec<u64>> {
        if logical == 0 || size == 0 {
            return Err(N2dError::InvalidArgument);
        }
        let first = logical & !(PAGE_SIZE as u64 - 1);
        let count = (logical + size as u64 - first).div_ceil(PAGE_SIZE as u64) as usize;
        self.alloc_pages(count, false)
    }

    fn unpin_user_pages(&self, pages: &[u64]) {
        self.free_pages(pages);
    }

    fn import_dmabuf(&self, fd: i32) -> N2dResult<Vec<u64>> {
        self.dmabufs.lock().get(&fd).cloned().ok_or(N2dError::NotFound)
    }

    fn export_dmabuf(&self, pages: &[u64], _size: usize) -> N2dResult<i32> {
        let fd = self.next_fd.fetch_add(1, Ordering::Relaxed) as i32;
        self.dmabufs.lock().insert(fd, pages.to_vec());
        Ok(fd)
    }

    fn cache_op(&self, _op: CacheOp, _pages: &[u64], _size: usize) -> N2dResult<()> {
        self.cache_ops.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

// ===============================================================================================
// GPU register file
// ===============================================================================================

/// A register file for one or more cores with just enough behaviour for the
/// driver: read-to-clear interrupts, an FE idle bit and a write counter.
#[derive(Debug)]
pub struct SimulatedGpu {
    registers: Mutex<HashMap<(usize, u32), u32>>,
    interrupts: Vec<AtomicU32>,
    writes: Vec<AtomicU32>,
    fe_hang: AtomicBool,
    pokes: Mutex<Vec<(usize, u32, u32)>>,
}

impl SimulatedGpu {
    /// GC820 identification reported by the simulator.
    pub const CHIP_ID: u32 = 0x0000_0820;
    pub const CHIP_REV: u32 = 0x0000_5541;

    #[must_use]
    pub fn new(cores: usize) -> Self {
        let gpu = Self {
            registers: Mutex::new(HashMap::new()),
            interrupts: (0..cores).map(|_| AtomicU32::new(0)).collect(),
            writes: (0..cores).map(|_| AtomicU32::new(0)).collect(),
            fe_hang: AtomicBool::new(false),
            pokes: Mutex::new(Vec::new()),
        };
        for core in 0..cores {
            gpu.set_register(core, regs::CHIP_ID, Self::CHIP_ID);
            gpu.set_register(core, regs::CHIP_REV, Self::CHIP_REV);
            gpu.set_register(
                core,
                regs::CHIP_MINOR_FEATURES0,
                regs::MINOR0_WAIT_LINK | regs::MINOR0_MMU,
            );
        }
        gpu
    }

    /// Overrides the minor feature word, e.g. to report an END-only front end.
    #[must_use]
    pub fn with_minor_features(self, value: u32) -> Self {
        for core in 0..self.interrupts.len() {
            self.set_register(core, regs::CHIP_MINOR_FEATURES0, value);
        }
        self
    }

    pub fn set_register(&self, core: usize, offset: u32, value: u32) {
        self.registers.lock().insert((core, offset), value);
    }

    #[must_use]
    pub fn register(&self, core: usize, offset: u32) -> u32 {
        self.registers
            .lock()
            .get(&(core, offset))
            .copied()
            .unwrap_or(0)
    }

    /// Latches interrupt bits as the hardware would on an event.
    pub fn raise_interrupt(&self, core: usize, bits: u32) {
        self.interrupts[core].fetch_or(bits, Ordering::AcqRel);
    }

    /// Keeps the front end busy forever.
    pub fn set_fe_hang(&self, hang: bool) {
        self.fe_hang.store(hang, Ordering::Release);
    }

    /// Simulates forward progress of the memory controller.
    pub fn advance_writes(&self, core: usize, bursts: u32) {
        self.writes[core].fetch_add(bursts, Ordering::Relaxed);
    }

    /// Every `(core, offset, value)` written so far.
    #[must_use]
    pub fn pokes(&self) -> Vec<(usize, u32, u32)> {
        self.pokes.lock().clone()
    }

    #[must_use]
    pub fn pokes_to(&self, offset: u32) -> Vec<u32> {
        self.pokes
            .lock()
            .iter()
            .filter(|(_, o, _)| *o == offset)
            .map(|(_, _, v)| *v)
            .collect()
    }
}

impl RegisterIo for SimulatedGpu {
    fn peek(&self, core: usize, offset: u32) -> u32 {
        match offset {
            regs::AQ_INTR_ACKNOWLEDGE => self.interrupts[core].swap(0, Ordering::AcqRel),
            regs::AQ_HI_IDLE => {
                if self.fe_hang.load(Ordering::Acquire) {
                    regs::IDLE_ALL & !regs::IDLE_FE
                } else {
                    regs::IDLE_ALL
                }
            }
            regs::HI_TOTAL_WRITES => self.writes[core].load(Ordering::Relaxed),
            _ => self.register(core, offset),
        }
    }

    fn poke(&self, core: usize, offset: u32, value: u32) {
        self.pokes.lock().push((core, offset, value));
        self.set_register(core, offset, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_memory_reads_back_writes() {
        let p = SimulatedPlatform::new();
        assert_eq!(p.read_u32(0x1234_5000), 0);
        p.write_u32(0x1234_5004, 0xDEAD_BEEF);
        assert_eq!(p.read_u32(0x1234_5004), 0xDEAD_BEEF);
        p.free_pages(&[0x1234_5000]);
        assert_eq!(p.read_u32(0x1234_5004), 0);
    }

    #[test]
    fn scattered_pages_are_not_adjacent() {
        let p = SimulatedPlatform::new();
        let pages = p.alloc_pages(3, false).unwrap();
        assert!(pages.windows(2).all(|w| w[1] - w[0] > PAGE_SIZE as u64));
        let pages = p.alloc_pages(3, true).unwrap();
        assert!(pages.windows(2).all(|w| w[1] - w[0] == PAGE_SIZE as u64));
    }

    #[test]
    fn dma_budget_is_enforced() {
        let p = SimulatedPlatform::new().with_dma_budget(PAGE_SIZE);
        assert!(p.alloc_dma_coherent(100).is_ok());
        assert!(matches!(p.alloc_dma_coherent(100), Err(N2dError::OutOfMemory)));
    }

    #[test]
    fn interrupt_register_clears_on_read() {
        let gpu = SimulatedGpu::new(1);
        gpu.raise_interrupt(0, 0b101);
        assert_eq!(gpu.peek(0, regs::AQ_INTR_ACKNOWLEDGE), 0b101);
        assert_eq!(gpu.peek(0, regs::AQ_INTR_ACKNOWLEDGE), 0);
    }
}
