use super::HeapUsage;
use crate::utils::align_up;
use std::collections::BTreeMap;

/// Strategy for carving address ranges out of a fixed window.
pub trait RangeAllocator {
    /// Reserve `size` bytes whose start is aligned to `align`.
    fn allocate(&mut self, size: u64, align: u64) -> Option<u64>;

    /// Release a range previously returned by `allocate`. Returns false if it was not tracked.
    fn free(&mut self, addr: u64) -> bool;

    /// The window's base and (exclusive) limit.
    fn bounds(&self) -> (u64, u64);
}

/// A managed window of physical or device address space.
///
/// Used both for the contiguous heaps (bus addresses of their storage) and for the
/// IOMMU's device-virtual aperture, where one guard page separates mappings.
#[derive(Debug)]
pub struct Region {
    base: u64,
    limit: u64,
    granularity: u64,
    guard: u64,

    // Tracks occupied ranges, guards included: Start Address -> Size
    allocations: BTreeMap<u64, u64>,
}

impl Region {
    /// `granularity` must be a power of two; every allocation is rounded up to it.
    #[must_use]
    pub fn new(base: u64, limit: u64, granularity: u64, guard: u64) -> Self {
        debug_assert!(granularity.is_power_of_two());
        Self {
            base,
            limit,
            granularity,
            guard,
            allocations: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.limit - self.base
    }

    /// Bytes handed out, guards excluded.
    #[must_use]
    pub fn used(&self) -> u64 {
        self.allocations
            .values()
            .map(|len| len - self.guard * 2)
            .sum()
    }

    /// Size of the biggest hole, ignoring alignment.
    #[must_use]
    pub fn largest_free(&self) -> u64 {
        let mut largest = 0;
        let mut cursor = self.base;
        for (&start, &len) in &self.allocations {
            largest = largest.max(start.saturating_sub(cursor));
            cursor = start + len;
        }
        largest.max(self.limit.saturating_sub(cursor))
    }

    #[must_use]
    pub fn usage(&self) -> HeapUsage {
        HeapUsage {
            total: self.total(),
            used: self.used(),
            largest_free: self.largest_free(),
        }
    }

    /// Start address of the tracked range if `addr + size` (plus trailing guard) fits
    /// before `end`.
    fn fits(&self, cursor: u64, size: u64, align: u64, end: u64) -> Option<u64> {
        let addr = align_up(cursor.checked_add(self.guard)?, align);
        let tail = addr.checked_add(size)?.checked_add(self.guard)?;
        (tail <= end).then_some(addr)
    }
}

impl RangeAllocator for Region {
    fn bounds(&self) -> (u64, u64) {
        (self.base, self.limit)
    }

    fn allocate(&mut self, size: u64, align: u64) -> Option<u64> {
        if size == 0 {
            return None;
        }
        let size = align_up(size, self.granularity);
        let align = align.max(self.granularity);

        let mut cursor = self.base;
        let mut found = None;

        // First fit: walk the holes in address order
        for (&alloc_start, &alloc_size) in &self.allocations {
            if let Some(addr) = self.fits(cursor, size, align, alloc_start) {
                found = Some(addr);
                break;
            }
            cursor = cursor.max(alloc_start + alloc_size);
        }

        // Space after the last allocation (or the whole window if empty)
        let addr = match found {
            Some(addr) => addr,
            None => self.fits(cursor, size, align, self.limit)?,
        };

        self.allocations
            .insert(addr - self.guard, size + self.guard * 2);
        Some(addr)
    }

    fn free(&mut self, addr: u64) -> bool {
        let tracked_start = addr - self.guard;

        if self.allocations.remove(&tracked_start).is_none() {
            log::error!("Tried to free range 0x{addr:x} which was not tracked");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fit_reuses_holes() {
        let mut r = Region::new(0, 0x4000, 0x1000, 0);
        let a = r.allocate(0x1000, 0x1000).unwrap();
        let b = r.allocate(0x1000, 0x1000).unwrap();
        let c = r.allocate(0x1000, 0x1000).unwrap();
        assert_eq!((a, b, c), (0, 0x1000, 0x2000));

        assert!(r.free(b));
        assert_eq!(r.allocate(0x800, 0x1000), Some(0x1000));
        assert_eq!(r.used(), 0x3000);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut r = Region::new(0x1000, 0x3000, 0x100, 0);
        assert!(r.allocate(0x2000, 0x100).is_some());
        assert_eq!(r.allocate(0x100, 0x100), None);
        assert_eq!(r.largest_free(), 0);
    }

    #[test]
    fn honors_alignment_above_granularity() {
        let mut r = Region::new(0, 0x10000, 0x20, 0);
        r.allocate(0x20, 0x20).unwrap();
        let aligned = r.allocate(0x100, 0x1000).unwrap();
        assert_eq!(aligned % 0x1000, 0);
        assert_eq!(aligned, 0x1000);
    }

    #[test]
    fn guard_pages_separate_ranges() {
        let mut r = Region::new(0, 0x10000, 0x1000, 0x1000);
        let a = r.allocate(0x1000, 0x1000).unwrap();
        let b = r.allocate(0x1000, 0x1000).unwrap();
        assert_eq!(a, 0x1000);
        assert!(b >= a + 0x1000 + 0x1000 * 2);
        assert_eq!(r.used(), 0x2000);
        assert!(r.free(a));
        assert!(r.free(b));
        assert_eq!(r.used(), 0);
    }

    #[test]
    fn free_of_untracked_range_is_reported() {
        let mut r = Region::new(0, 0x1000, 0x100, 0);
        assert!(!r.free(0x200));
    }

    #[test]
    fn zero_size_is_rejected() {
        let mut r = Region::new(0, 0x1000, 0x100, 0);
        assert_eq!(r.allocate(0, 0x100), None);
    }
}
