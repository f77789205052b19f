//! On-chip SRAM allocation.
//!
//! This module implements the first-fit span allocator the pass builder uses to
//! place input, output, weight and PLE-code tiles. The allocator is a plain value:
//! speculative probes clone it, mutate the clone, and either adopt the clone or
//! drop it. Because the state derives `PartialEq`, a dropped probe can be checked
//! field-for-field against the base allocator.

use super::error::SramError;
use std::collections::BTreeMap;

/// Where in the free space a new allocation should be placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocationPreference {
    /// Lowest suitable address.
    #[default]
    Start,
    /// Highest suitable address.
    End,
}

/// A contiguous byte range `[offset, offset + size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub offset: u32,
    pub size: u32,
}

impl Span {
    pub const fn new(offset: u32, size: u32) -> Self {
        Self { offset, size }
    }

    pub const fn end(&self) -> u32 {
        self.offset + self.size
    }
}

/// Free-list allocator over a fixed SRAM address range.
///
/// Free spans are kept sorted by offset and coalesced on every free, so two
/// allocators that saw the same sequence of operations compare equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SramAllocator {
    /// Total addressable bytes.
    capacity: u32,
    /// Free spans, sorted by offset, never adjacent.
    free: Vec<Span>,
    /// Live allocations keyed by their start offset.
    used: BTreeMap<u32, u32>,
}

impl SramAllocator {
    /// Create an allocator with every byte in `[0, capacity)` free.
    pub fn new(capacity: u32) -> Self {
        let free = if capacity > 0 { vec![Span::new(0, capacity)] } else { Vec::new() };
        Self {
            capacity,
            free,
            used: BTreeMap::new(),
        }
    }

    /// Allocate `size` bytes, returning the start offset.
    ///
    /// Zero-byte requests reserve one byte so every live allocation has a
    /// unique start offset.
    pub fn allocate(&mut self, size: u32, preference: AllocationPreference) -> Option<u32> {
        let size = size.max(1);

        let index = match preference {
            AllocationPreference::Start => self.free.iter().position(|span| span.size >= size),
            AllocationPreference::End => self.free.iter().rposition(|span| span.size >= size),
        }?;

        let span = self.free[index];
        let offset = match preference {
            AllocationPreference::Start => span.offset,
            AllocationPreference::End => span.end() - size,
        };

        if span.size == size {
            self.free.remove(index);
        } else if offset == span.offset {
            self.free[index] = Span::new(span.offset + size, span.size - size);
        } else {
            self.free[index] = Span::new(span.offset, span.size - size);
        }

        self.used.insert(offset, size);
        log::trace!("sram: allocated {size} bytes at {offset:#x}");
        Some(offset)
    }

    /// Release the allocation starting at `offset`.
    pub fn free(&mut self, offset: u32) -> Result<(), SramError> {
        let size = self
            .used
            .remove(&offset)
            .ok_or(SramError::UnknownOffset { offset })?;

        let index = self.free.partition_point(|span| span.offset < offset);
        self.free.insert(index, Span::new(offset, size));

        // Merge with the following span, then with the preceding one.
        if index + 1 < self.free.len() && self.free[index].end() == self.free[index + 1].offset {
            self.free[index].size += self.free[index + 1].size;
            self.free.remove(index + 1);
        }
        if index > 0 && self.free[index - 1].end() == self.free[index].offset {
            self.free[index - 1].size += self.free[index].size;
            self.free.remove(index);
        }

        log::trace!("sram: freed {size} bytes at {offset:#x}");
        Ok(())
    }

    /// Whether an allocation currently starts at `offset`.
    pub fn is_allocated(&self, offset: u32) -> bool {
        self.used.contains_key(&offset)
    }

    /// Size of the live allocation at `offset`.
    pub fn allocation_size(&self, offset: u32) -> Option<u32> {
        self.used.get(&offset).copied()
    }

    /// Total addressable bytes.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Bytes not currently allocated.
    pub fn free_capacity(&self) -> u32 {
        self.free.iter().map(|span| span.size).sum()
    }

    /// Largest single allocation that would currently succeed.
    pub fn largest_free_span(&self) -> u32 {
        self.free.iter().map(|span| span.size).max().unwrap_or(0)
    }

    /// Live allocations in address order.
    pub fn allocations(&self) -> impl Iterator<Item = Span> + '_ {
        self.used.iter().map(|(&offset, &size)| Span::new(offset, size))
    }

    /// Release everything.
    pub fn reset(&mut self) {
        *self = Self::new(self.capacity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_fit_allocation() {
        let mut sram = SramAllocator::new(1024);
        let a = sram.allocate(100, AllocationPreference::Start).unwrap();
        let b = sram.allocate(200, AllocationPreference::Start).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 100);
        assert_eq!(sram.free_capacity(), 724);
    }

    #[test]
    fn test_allocate_from_end() {
        let mut sram = SramAllocator::new(1024);
        let a = sram.allocate(24, AllocationPreference::End).unwrap();
        assert_eq!(a, 1000);
        let b = sram.allocate(1000, AllocationPreference::Start).unwrap();
        assert_eq!(b, 0);
        assert_eq!(sram.free_capacity(), 0);
        assert_eq!(sram.allocate(1, AllocationPreference::Start), None);
    }

    #[test]
    fn test_free_restores_capacity_and_coalesces() {
        let mut sram = SramAllocator::new(1024);
        let pristine = sram.clone();

        let a = sram.allocate(100, AllocationPreference::Start).unwrap();
        let b = sram.allocate(100, AllocationPreference::Start).unwrap();
        let c = sram.allocate(100, AllocationPreference::Start).unwrap();

        sram.free(b).unwrap();
        assert_eq!(sram.largest_free_span(), 724);
        sram.free(a).unwrap();
        assert_eq!(sram.largest_free_span(), 724);
        assert_eq!(sram.free_capacity(), 924);
        sram.free(c).unwrap();

        assert_eq!(sram, pristine);
    }

    #[test]
    fn test_reuses_hole() {
        let mut sram = SramAllocator::new(300);
        let a = sram.allocate(100, AllocationPreference::Start).unwrap();
        let _b = sram.allocate(100, AllocationPreference::Start).unwrap();
        sram.free(a).unwrap();
        assert_eq!(sram.allocate(50, AllocationPreference::Start), Some(0));
    }

    #[test]
    fn test_free_unknown_offset() {
        let mut sram = SramAllocator::new(64);
        let a = sram.allocate(8, AllocationPreference::Start).unwrap();
        assert_eq!(sram.free(a + 1), Err(SramError::UnknownOffset { offset: a + 1 }));
        sram.free(a).unwrap();
        assert!(sram.free(a).is_err());
    }

    #[test]
    fn test_discarded_probe_leaves_state_identical() {
        let mut sram = SramAllocator::new(4096);
        sram.allocate(512, AllocationPreference::Start).unwrap();
        let before = sram.clone();

        let mut probe = sram.clone();
        probe.allocate(1024, AllocationPreference::Start).unwrap();
        probe.allocate(64, AllocationPreference::End).unwrap();
        drop(probe);

        assert_eq!(sram, before);
    }
}
