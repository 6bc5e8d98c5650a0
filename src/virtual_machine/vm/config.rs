use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::vm::interrupt::IVT_END;
use crate::virtual_machine::vm::memory::{MAX_MEMORY_SIZE, MIN_MEMORY_SIZE};
use crate::virtual_machine::vm::rng::DEFAULT_SEED;

/// Main memory size when none is configured (64 KiB).
pub const DEFAULT_MEMORY_SIZE: usize = 64 * 1024;

/// Call-stack capacity when neither the config nor the program names one.
pub const DEFAULT_STACK_SIZE: u32 = 64;

/// Construction parameters for a [`Vm`](super::Vm).
#[derive(Clone, Debug)]
pub struct VmConfig {
    /// Main memory size in bytes; a multiple of 4.
    pub memory_size: usize,
    /// Default call-stack capacity per context, in words.
    pub stack_size: u32,
    /// Install the built-in fault handlers at construction.
    pub default_handlers: bool,
    /// Log every executed instruction at debug level.
    pub trace: bool,
    /// Initial state of the `RND`/`RNDI` generator.
    pub rng_seed: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            memory_size: DEFAULT_MEMORY_SIZE,
            stack_size: DEFAULT_STACK_SIZE,
            default_handlers: true,
            trace: false,
            rng_seed: DEFAULT_SEED,
        }
    }
}

impl VmConfig {
    pub fn with_memory_size(mut self, size: usize) -> Self {
        self.memory_size = size;
        self
    }

    pub fn with_stack_size(mut self, size: u32) -> Self {
        self.stack_size = size;
        self
    }

    pub fn with_default_handlers(mut self, enabled: bool) -> Self {
        self.default_handlers = enabled;
        self
    }

    pub fn with_trace(mut self, enabled: bool) -> Self {
        self.trace = enabled;
        self
    }

    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = seed;
        self
    }

    /// Checks the configuration before any memory is allocated.
    pub fn validate(&self) -> Result<(), VMError> {
        if !(MIN_MEMORY_SIZE..=MAX_MEMORY_SIZE).contains(&self.memory_size)
            || self.memory_size % 4 != 0
        {
            return Err(VMError::InvalidMemorySize {
                size: self.memory_size,
                min: MIN_MEMORY_SIZE,
                max: MAX_MEMORY_SIZE,
            });
        }
        if self.stack_size == 0 {
            return Err(VMError::InvalidConfig(
                "stack size must be at least one word".into(),
            ));
        }
        if self.memory_size as u32 <= IVT_END {
            return Err(VMError::InvalidConfig(
                "memory must extend past the interrupt vector table".into(),
            ));
        }
        Ok(())
    }
}
