use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::vm::Interrupt;
use crate::virtual_machine::vm::registers::Registers;

/// Identifier of an execution context.
pub type ContextId = u32;

/// Context the VM starts in.
pub const MAIN_CONTEXT: ContextId = 0;

/// Context identifiers must be below this bound.
pub const MAX_CONTEXTS: u32 = 256;

/// Extra call-stack slots only interrupt delivery may use, so that a fault
/// raised by a full stack can still push its return address.
pub const INTERRUPT_RESERVE: usize = 2;

/// Fixed-capacity call stack of return addresses and pushed words.
#[derive(Clone, Debug)]
pub struct CallStack {
    slots: Vec<u32>,
    capacity: usize,
}

impl CallStack {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity + INTERRUPT_RESERVE),
            capacity,
        }
    }

    /// Pushes a word, faulting with a stack overflow when full.
    pub fn push(&mut self, value: u32) -> Result<(), VMError> {
        if self.slots.len() >= self.capacity {
            return Err(VMError::Fault(Interrupt::StackOverflow));
        }
        self.slots.push(value);
        Ok(())
    }

    /// Pushes an interrupt return address, dipping into the reserve if needed.
    ///
    /// Returns false if even the reserve is exhausted.
    pub fn push_reserved(&mut self, value: u32) -> bool {
        if self.slots.len() >= self.capacity + INTERRUPT_RESERVE {
            return false;
        }
        self.slots.push(value);
        true
    }

    /// Pops a word; popping an empty stack is reported as a stack overflow.
    pub fn pop(&mut self) -> Result<u32, VMError> {
        self.slots
            .pop()
            .ok_or(VMError::Fault(Interrupt::StackOverflow))
    }

    /// Stack pointer: number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.slots
    }
}

/// One independent thread of execution: registers, flag and call stack.
#[derive(Clone, Debug)]
pub struct Context {
    pub registers: Registers,
    /// Result of the last compare: -1, 0 or 1.
    pub flag: i8,
    /// Byte address of the next instruction.
    pub pc: u32,
    /// Link register written by `POPWORDI` and `RETURN`.
    pub lr: u32,
    /// Start address of the program loaded into this context.
    pub st: u32,
    pub stack: CallStack,
}

impl Context {
    pub fn new(stack_capacity: usize) -> Self {
        Self {
            registers: Registers::new(),
            flag: 0,
            pc: 0,
            lr: 0,
            st: 0,
            stack: CallStack::new(stack_capacity),
        }
    }

    pub fn sp(&self) -> usize {
        self.stack.len()
    }
}

/// All contexts of a VM and which one is running.
///
/// Contexts are created on first switch and never removed, so the active index
/// always points at a live context.
pub struct ContextTable {
    slots: Vec<(ContextId, Context)>,
    active: usize,
    stack_capacity: usize,
}

impl ContextTable {
    /// Creates a table holding only the main context.
    pub fn new(stack_capacity: usize) -> Self {
        Self {
            slots: vec![(MAIN_CONTEXT, Context::new(stack_capacity))],
            active: 0,
            stack_capacity,
        }
    }

    pub fn active_id(&self) -> ContextId {
        self.slots[self.active].0
    }

    #[inline(always)]
    pub fn active(&self) -> &Context {
        &self.slots[self.active].1
    }

    #[inline(always)]
    pub fn active_mut(&mut self) -> &mut Context {
        &mut self.slots[self.active].1
    }

    pub fn get(&self, id: ContextId) -> Option<&Context> {
        self.slots.iter().find(|(i, _)| *i == id).map(|(_, c)| c)
    }

    /// Returns the context `id`, creating a zeroed one if it does not exist.
    pub fn ensure(&mut self, id: ContextId) -> Result<&mut Context, VMError> {
        let index = self.ensure_index(id)?;
        Ok(&mut self.slots[index].1)
    }

    /// Makes `id` the active context. Returns true if it was created.
    pub fn switch(&mut self, id: ContextId) -> Result<bool, VMError> {
        let before = self.slots.len();
        self.active = self.ensure_index(id)?;
        Ok(self.slots.len() > before)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ContextId> + '_ {
        self.slots.iter().map(|(id, _)| *id)
    }

    fn ensure_index(&mut self, id: ContextId) -> Result<usize, VMError> {
        if id >= MAX_CONTEXTS {
            return Err(VMError::InvalidContext { id });
        }
        if let Some(index) = self.slots.iter().position(|(i, _)| *i == id) {
            return Ok(index);
        }
        self.slots.push((id, Context::new(self.stack_capacity)));
        Ok(self.slots.len() - 1)
    }
}
