use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::vm::Interrupt;
use std::ops::{Index, IndexMut, Range};

/// Smallest accepted main memory size in bytes.
pub const MIN_MEMORY_SIZE: usize = 512;
/// Largest accepted main memory size in bytes.
pub const MAX_MEMORY_SIZE: usize = 16 * 1024 * 1024;

/// Validates `width` bytes at `address` against a space of `len` bytes.
///
/// Addresses that are negative as `i32` are segmentation faults; addresses past
/// the end of the space are out-of-memory faults.
pub(crate) fn span(len: usize, address: u32, width: u32) -> Result<Range<usize>, VMError> {
    if (address as i32) < 0 {
        return Err(VMError::Fault(Interrupt::SegmentationFault));
    }
    let end = address as u64 + width as u64;
    if end > len as u64 {
        return Err(VMError::Fault(Interrupt::OutOfMemory));
    }
    Ok(address as usize..end as usize)
}

/// Reads a zero-extended little-endian value of 1, 2 or 4 bytes.
pub(crate) fn load(space: &[u8], address: u32, width: u32) -> Result<u32, VMError> {
    let range = span(space.len(), address, width)?;
    let mut buf = [0u8; 4];
    buf[..width as usize].copy_from_slice(&space[range]);
    Ok(u32::from_le_bytes(buf))
}

/// Writes the low `width` bytes of `value` in little-endian order.
pub(crate) fn store(space: &mut [u8], address: u32, width: u32, value: u32) -> Result<(), VMError> {
    let range = span(space.len(), address, width)?;
    space[range].copy_from_slice(&value.to_le_bytes()[..width as usize]);
    Ok(())
}

/// Flat, byte-addressable main memory.
///
/// Every access is bounds-checked. The first bytes hold the interrupt vector
/// table; everything after it is managed by the allocator.
pub struct Memory {
    bytes: Vec<u8>,
}

impl Memory {
    /// Creates zeroed memory of `size` bytes.
    pub fn new(size: usize) -> Result<Self, VMError> {
        if !(MIN_MEMORY_SIZE..=MAX_MEMORY_SIZE).contains(&size) || size % 4 != 0 {
            return Err(VMError::InvalidMemorySize {
                size,
                min: MIN_MEMORY_SIZE,
                max: MAX_MEMORY_SIZE,
            });
        }
        Ok(Self {
            bytes: vec![0; size],
        })
    }

    /// Size in bytes.
    pub fn len(&self) -> u32 {
        self.bytes.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn read_byte(&self, address: u32) -> Result<u8, VMError> {
        Ok(load(&self.bytes, address, 1)? as u8)
    }

    pub fn read_half(&self, address: u32) -> Result<u16, VMError> {
        Ok(load(&self.bytes, address, 2)? as u16)
    }

    pub fn read_word(&self, address: u32) -> Result<u32, VMError> {
        load(&self.bytes, address, 4)
    }

    pub fn write_byte(&mut self, address: u32, value: u8) -> Result<(), VMError> {
        store(&mut self.bytes, address, 1, value as u32)
    }

    pub fn write_half(&mut self, address: u32, value: u16) -> Result<(), VMError> {
        store(&mut self.bytes, address, 2, value as u32)
    }

    pub fn write_word(&mut self, address: u32, value: u32) -> Result<(), VMError> {
        store(&mut self.bytes, address, 4, value)
    }

    /// Borrows `len` bytes starting at `address`.
    pub fn read(&self, address: u32, len: u32) -> Result<&[u8], VMError> {
        let range = span(self.bytes.len(), address, len)?;
        Ok(&self.bytes[range])
    }

    /// Copies `data` into memory starting at `address`.
    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<(), VMError> {
        let range = span(self.bytes.len(), address, data.len() as u32)?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }

    /// Sets `len` bytes starting at `address` to `value`.
    pub fn fill(&mut self, address: u32, len: u32, value: u8) -> Result<(), VMError> {
        let range = span(self.bytes.len(), address, len)?;
        self.bytes[range].fill(value);
        Ok(())
    }
}

impl Index<usize> for Memory {
    type Output = u8;

    fn index(&self, index: usize) -> &Self::Output {
        &self.bytes[index]
    }
}

impl IndexMut<usize> for Memory {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.bytes[index]
    }
}

/// Element type a [`Pointer`] reads and writes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PointerType {
    Byte,
    HalfWord,
    Word,
    DoubleWord,
    Bool,
    Void,
}

impl PointerType {
    /// Size of one element in bytes.
    pub const fn size(self) -> u32 {
        match self {
            PointerType::Byte | PointerType::Bool | PointerType::Void => 1,
            PointerType::HalfWord => 2,
            PointerType::Word => 4,
            PointerType::DoubleWord => 8,
        }
    }
}

/// Typed view of a main memory address, as handed out by the allocator.
///
/// A cast-locked pointer keeps its element type for its whole lifetime.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Pointer {
    address: u32,
    kind: PointerType,
    cast_locked: bool,
}

impl Pointer {
    pub const fn new(address: u32, kind: PointerType) -> Self {
        Self {
            address,
            kind,
            cast_locked: false,
        }
    }

    /// Creates a pointer whose type cannot be changed.
    pub const fn locked(address: u32, kind: PointerType) -> Self {
        Self {
            address,
            kind,
            cast_locked: true,
        }
    }

    pub const fn address(self) -> u32 {
        self.address
    }

    pub const fn kind(self) -> PointerType {
        self.kind
    }

    pub const fn is_cast_locked(self) -> bool {
        self.cast_locked
    }

    /// Changes the element type.
    pub fn cast(&mut self, kind: PointerType) -> Result<(), VMError> {
        if self.cast_locked && kind != self.kind {
            return Err(VMError::CastLocked {
                address: self.address,
            });
        }
        self.kind = kind;
        Ok(())
    }

    /// Pointer to the element `count` elements away.
    pub fn offset(self, count: i32) -> Self {
        let delta = count.wrapping_mul(self.kind.size() as i32);
        Self {
            address: self.address.wrapping_add_signed(delta),
            ..self
        }
    }

    /// Reads the element at this address.
    pub fn read(self, memory: &Memory) -> Result<u64, VMError> {
        let bytes = memory.read(self.address, self.kind.size())?;
        let mut buf = [0u8; 8];
        buf[..bytes.len()].copy_from_slice(bytes);
        let value = u64::from_le_bytes(buf);
        Ok(match self.kind {
            PointerType::Bool => (value != 0) as u64,
            _ => value,
        })
    }

    /// Writes `value` truncated to the element size.
    pub fn write(self, memory: &mut Memory, value: u64) -> Result<(), VMError> {
        let value = match self.kind {
            PointerType::Bool => (value != 0) as u64,
            _ => value,
        };
        let size = self.kind.size() as usize;
        memory.write(self.address, &value.to_le_bytes()[..size])
    }
}
