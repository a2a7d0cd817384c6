//! Collaborator interfaces the kernel core consumes: register access and the
//! platform layer (power, clocks, physical memory, user memory).

use crate::error::{N2dError, N2dResult};

/// Core-indexed MMIO access.
pub trait RegisterIo: Send + Sync {
    fn peek(&self, core: usize, offset: u32) -> u32;
    fn poke(&self, core: usize, offset: u32, value: u32);
}

/// Cache maintenance requested through the CACHE command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CacheOp {
    Clean = 0,
    Invalidate = 1,
    Flush = 2,
    Barrier = 3,
}

impl TryFrom<u32> for CacheOp {
    type Error = N2dError;

    fn try_from(value: u32) -> N2dResult<Self> {
        match value {
            0 => Ok(Self::Clean),
            1 => Ok(Self::Invalidate),
            2 => Ok(Self::Flush),
            3 => Ok(Self::Barrier),
            _ => Err(N2dError::InvalidArgument),
        }
    }
}

/// Power, clock, reset and memory services of the host platform.
///
/// Physical addresses are CPU physical addresses unless stated otherwise; the
/// MMU translates them with [`Platform::cpu_to_gpu_physical`] before writing
/// page entries. The optional hooks default to `NotSupported` or no-ops.
pub trait Platform: Send + Sync {
    // ===========================================================================================
    // Power management
    // ===========================================================================================

    fn set_power(&self, _core: usize, _on: bool) -> N2dResult<()> {
        Ok(())
    }

    fn set_clock(&self, _core: usize, _on: bool) -> N2dResult<()> {
        Ok(())
    }

    fn reset(&self, _core: usize) -> N2dResult<()> {
        Ok(())
    }

    fn cpu_to_gpu_physical(&self, cpu_physical: u64) -> u64 {
        cpu_physical
    }

    fn gpu_to_cpu_physical(&self, gpu_physical: u64) -> u64 {
        gpu_physical
    }

    // ===========================================================================================
    // Memory allocation
    // ===========================================================================================

    /// Allocates physically contiguous, DMA-coherent memory.
    fn alloc_dma_coherent(&self, size: usize) -> N2dResult<u64>;

    fn free_dma_coherent(&self, physical: u64, size: usize);

    /// Allocates `count` pages. With `contiguous` the pages are consecutive.
    fn alloc_pages(&self, count: usize, contiguous: bool) -> N2dResult<Vec<u64>>;

    fn free_pages(&self, pages: &[u64]);

    // ===========================================================================================
    // Kernel access to physical memory
    // ===========================================================================================

    fn read_u32(&self, physical: u64) -> u32;

    fn write_u32(&self, physical: u64, value: u32);

    fn write_words(&self, physical: u64, words: &[u32]) {
        for (i, &w) in words.iter().enumerate() {
            self.write_u32(physical + (i as u64) * 4, w);
        }
    }

    fn zero(&self, physical: u64, size: usize) {
        for off in (0..size).step_by(4) {
            self.write_u32(physical + off as u64, 0);
        }
    }

    /// Establishes a kernel virtual mapping of the pages. Returns its address.
    fn map_kernel(&self, pages: &[u64]) -> N2dResult<u64> {
        pages.first().copied().ok_or(N2dError::InvalidArgument)
    }

    fn unmap_kernel(&self, _logical: u64, _size: usize) {}

    // ===========================================================================================
    // User memory
    // ===========================================================================================

    /// Maps the pages into the address space of `process`.
    fn map_user(&self, _process: u32, _pages: &[u64], _cacheable: bool) -> N2dResult<u64> {
        Err(N2dError::NotSupported)
    }

    fn unmap_user(&self, _process: u32, _logical: u64, _size: usize) {}

    /// Pins the user range and returns its physical pages.
    fn pin_user_pages(&self, _process: u32, _logical: u64, _size: usize) -> N2dResult<Vec<u64>> {
        Err(N2dError::NotSupported)
    }

    fn unpin_user_pages(&self, _pages: &[u64]) {}

    fn import_dmabuf(&self, _fd: i32) -> N2dResult<Vec<u64>> {
        Err(N2dError::NotSupported)
    }

    fn release_dmabuf(&self, _fd: i32) {}

    fn export_dmabuf(&self, _pages: &[u64], _size: usize) -> N2dResult<i32> {
        Err(N2dError::NotSupported)
    }

    fn cache_op(&self, _op: CacheOp, _pages: &[u64], _size: usize) -> N2dResult<()> {
        Ok(())
    }
}
