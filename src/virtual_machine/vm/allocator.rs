use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::vm::memory::{Memory, Pointer, PointerType};
use std::ops::Range;

/// Rounds a byte count up to a whole number of words.
pub(crate) fn word_align(size: u32) -> Option<u32> {
    size.max(1).checked_add(3).map(|s| s & !3)
}

/// Best-fit allocator over the region `[origin, limit)` of main memory.
///
/// Allocated ranges are kept sorted by start address. A request is served by
/// the first gap of exactly the requested size, otherwise by the smallest gap
/// that is large enough, otherwise after the last allocated byte.
pub struct Allocator {
    origin: u32,
    limit: u32,
    ranges: Vec<Range<u32>>,
}

impl Allocator {
    pub fn new(origin: u32, limit: u32) -> Self {
        Self {
            origin,
            limit,
            ranges: Vec::new(),
        }
    }

    /// Start address a request of `size` bytes would get, without registering it.
    pub fn fit(&self, size: u32) -> Result<u32, VMError> {
        let out_of_memory = VMError::OutOfMemory { requested: size };
        let size = word_align(size).ok_or(out_of_memory)?;

        let mut best: Option<(u32, u32)> = None;
        let mut cursor = self.origin;
        for range in &self.ranges {
            if range.start > cursor {
                let gap = range.start - cursor;
                if gap == size {
                    return Ok(cursor);
                }
                if gap > size && best.is_none_or(|(_, g)| gap < g) {
                    best = Some((cursor, gap));
                }
            }
            cursor = cursor.max(range.end);
        }

        let start = best.map_or(cursor, |(start, _)| start);
        match start.checked_add(size) {
            Some(end) if end <= self.limit => Ok(start),
            _ => Err(VMError::OutOfMemory { requested: size }),
        }
    }

    /// Allocates `size` bytes, rounded up to a whole number of words.
    pub fn malloc(&mut self, size: u32) -> Result<Pointer, VMError> {
        let start = self.fit(size)?;
        let aligned = word_align(size).ok_or(VMError::OutOfMemory { requested: size })?;
        self.insert(start..start + aligned);
        Ok(Pointer::new(start, PointerType::Void))
    }

    /// Like [`malloc`](Self::malloc), with the block zero-filled.
    pub fn calloc(&mut self, memory: &mut Memory, size: u32) -> Result<Pointer, VMError> {
        let ptr = self.malloc(size)?;
        let len = self.block_len(ptr.address());
        memory.fill(ptr.address(), len, 0)?;
        Ok(ptr)
    }

    /// Registers an exact range, e.g. for a program image placed at a fixed origin.
    pub fn claim(&mut self, range: Range<u32>) -> Result<(), VMError> {
        let requested = range.end.saturating_sub(range.start);
        if range.start < self.origin || range.end > self.limit || range.start >= range.end {
            return Err(VMError::OutOfMemory { requested });
        }
        if self
            .ranges
            .iter()
            .any(|r| r.start < range.end && range.start < r.end)
        {
            return Err(VMError::RangeOccupied {
                start: range.start,
                end: range.end,
            });
        }
        self.insert(range);
        Ok(())
    }

    /// Releases a range previously handed out, matched exactly.
    pub fn free(&mut self, range: Range<u32>) -> Result<(), VMError> {
        let index = self.position(&range)?;
        self.ranges.remove(index);
        Ok(())
    }

    /// Trims `shrink_by` bytes off the tail of an allocated range.
    ///
    /// Shrinking by the whole length releases the range. Returns what remains.
    pub fn reduce_allocated_block(
        &mut self,
        range: Range<u32>,
        shrink_by: u32,
    ) -> Result<Range<u32>, VMError> {
        let index = self.position(&range)?;
        let len = range.end - range.start;
        if shrink_by >= len {
            self.ranges.remove(index);
            return Ok(range.start..range.start);
        }
        self.ranges[index].end -= shrink_by;
        Ok(self.ranges[index].clone())
    }

    /// Allocated ranges in address order.
    pub fn ranges(&self) -> &[Range<u32>] {
        &self.ranges
    }

    /// Total bytes currently allocated.
    pub fn used(&self) -> u32 {
        self.ranges.iter().map(|r| r.end - r.start).sum()
    }

    fn block_len(&self, start: u32) -> u32 {
        self.ranges
            .iter()
            .find(|r| r.start == start)
            .map_or(0, |r| r.end - r.start)
    }

    fn position(&self, range: &Range<u32>) -> Result<usize, VMError> {
        self.ranges
            .iter()
            .position(|r| r == range)
            .ok_or(VMError::UnregisteredFree {
                start: range.start,
                end: range.end,
            })
    }

    fn insert(&mut self, range: Range<u32>) {
        let index = self.ranges.partition_point(|r| r.start < range.start);
        self.ranges.insert(index, range);
    }
}
