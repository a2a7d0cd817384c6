use crate::utils::{PAGE_SIZE, align_up};
use std::collections::BTreeMap;

/// First-fit allocator over the reserved contiguous region
/// (`contiguousBase` / `contiguousSize`).
#[derive(Debug)]
pub struct ReservedPool {
    base: u64,
    limit: u64,
    align: u64,

    // Occupied ranges: start -> size. Holes between them are the free space.
    allocations: BTreeMap<u64, u64>,
}

impl ReservedPool {
    #[must_use]
    pub fn new(base: u64, size: u64) -> Self {
        Self {
            base,
            limit: base + size,
            align: PAGE_SIZE as u64,
            allocations: BTreeMap::new(),
        }
    }

    /// Bytes currently handed out.
    #[must_use]
    pub fn used(&self) -> u64 {
        self.allocations.values().sum()
    }

    pub fn allocate(&mut self, size: usize, align: usize) -> Option<u64> {
        let size = align_up(size as u64, self.align);
        let align = std::cmp::max(align as u64, self.align);

        let mut candidate = align_up(self.base, align);

        for (&start, &len) in &self.allocations {
            if start >= candidate && start - candidate >= size {
                break;
            }
            candidate = std::cmp::max(candidate, align_up(start + len, align));
        }

        if candidate + size <= self.limit {
            self.allocations.insert(candidate, size);
            log::trace!("pool: 0x{candidate:x} +0x{size:x}");
            return Some(candidate);
        }

        None
    }

    pub fn free(&mut self, physical: u64) -> bool {
        if self.allocations.remove(&physical).is_none() {
            log::error!("pool: free of untracked address 0x{physical:x}");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_holes_first_fit() {
        let mut pool = ReservedPool::new(0x1000_0000, 0x10_000);
        let a = pool.allocate(0x4000, 0).unwrap();
        let b = pool.allocate(0x4000, 0).unwrap();
        let _c = pool.allocate(0x4000, 0).unwrap();
        assert_eq!(a, 0x1000_0000);
        assert_eq!(b, 0x1000_4000);

        assert!(pool.free(b));
        assert_eq!(pool.allocate(0x1000, 0), Some(b));
        assert_eq!(pool.allocate(0x3000, 0), Some(b + 0x1000));
    }

    #[test]
    fn honours_alignment_and_limit() {
        let mut pool = ReservedPool::new(0x1000_1000, 0x20_000);
        let a = pool.allocate(0x1000, 0x10_000).unwrap();
        assert_eq!(a, 0x1001_0000);
        assert!(pool.allocate(0x20_000, 0).is_none());
        assert_eq!(pool.used(), 0x1000);
    }

    #[test]
    fn rejects_unknown_free() {
        let mut pool = ReservedPool::new(0, 0x1000);
        assert!(!pool.free(0x40));
    }
}
