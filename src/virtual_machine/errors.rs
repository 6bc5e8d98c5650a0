use crate::virtual_machine::vm::Interrupt;
use thiserror::Error;

/// Errors that can occur during assembly, program decoding, or VM execution.
///
/// Runtime faults that a program can handle travel as [`VMError::Fault`] and are
/// turned into interrupt vector jumps by the execution loop. Every other runtime
/// variant is fatal and stops the VM.
#[derive(Debug, Error)]
pub enum VMError {
    // =========================
    // Assembly
    // =========================
    /// Unrecognized instruction mnemonic during assembly.
    #[error("invalid instruction name: {name}")]
    InvalidInstructionName { name: String },
    /// Wrong number of operands for an instruction.
    #[error("instruction {instruction} expects {expected} operands but got {actual}")]
    ArityMismatch {
        instruction: String,
        expected: usize,
        actual: usize,
    },
    /// Expected a register operand (e.g., `r1`) but got something else.
    #[error("expected register, got {0}")]
    ExpectedRegister(String),
    /// Register number outside `r1..r8` or malformed.
    #[error("invalid register {token}")]
    InvalidRegister { token: String },
    /// The constant-zero literal was used where a register is written.
    #[error("instruction {instruction} cannot write to the constant zero operand")]
    ZeroDestination { instruction: String },
    /// The constant-zero literal was used in a slot that has no zero encoding.
    #[error("instruction {instruction} does not accept 0 as operand {index}")]
    ZeroNotAllowed { instruction: String, index: usize },
    /// Numeric literal could not be parsed.
    #[error("invalid literal {token}")]
    InvalidLiteral { token: String },
    /// Numeric literal used a `0x`/`0b` prefix instead of an `h`/`b` suffix.
    #[error("prefixed literal {token} is not supported, use a trailing h or b instead")]
    PrefixedLiteral { token: String },
    /// Immediate value does not fit in its instruction field.
    #[error("value {token} does not fit in {bits} bits")]
    ImmediateOutOfRange { token: String, bits: u32 },
    /// Label bound twice to different addresses.
    #[error("label {label} redefined: old address {old:#x}, new address {new:#x}")]
    DuplicateLabel { label: String, old: u32, new: u32 },
    /// Reference to undefined label.
    #[error("undefined label: {label}")]
    UndefinedLabel { label: String },
    /// Relative jump whose label lies in the wrong direction.
    #[error("label {label} cannot be reached by {instruction}")]
    UnreachableLabel { label: String, instruction: String },
    /// Unknown data declaration type.
    #[error("invalid data type: {kind}")]
    InvalidDataType { kind: String },
    /// Malformed data declaration.
    #[error("malformed data declaration: {reason}")]
    MalformedData { reason: String },
    /// Unknown section header.
    #[error("invalid section: {name}")]
    InvalidSection { name: String },
    /// Unrecognized escape sequence inside a string literal.
    #[error("invalid escape sequence \\{0}")]
    InvalidEscape(char),
    /// Assembly error with source location.
    #[error("line {line}: {reason}")]
    AssemblyError {
        line: usize,
        column: usize,
        reason: String,
    },
    /// Tokenizer error with source location.
    #[error("line {line}: {message}")]
    ParseError {
        line: usize,
        column: usize,
        message: &'static str,
    },
    /// File I/O error.
    #[error("io error on {path}: {reason}")]
    IoError { path: String, reason: String },

    // =========================
    // Program images
    // =========================
    /// Failed to decode a serialized program.
    #[error("decoding error: {reason}")]
    DecodeError { reason: String },
    /// Instruction word matches no instruction pattern.
    #[error("illegal instruction word {word:#010x}")]
    IllegalInstruction { word: u32 },

    // =========================
    // Memory and allocation
    // =========================
    /// Memory size outside the supported bounds or not word-aligned.
    #[error("invalid memory size {size} (must be a multiple of 4 between {min} and {max})")]
    InvalidMemorySize { size: usize, min: usize, max: usize },
    /// Allocation does not fit in the remaining memory.
    #[error("out of memory: cannot allocate {requested} bytes")]
    OutOfMemory { requested: u32 },
    /// Attempt to free or shrink a range the allocator never handed out.
    #[error("range {start:#x}..{end:#x} is not allocated")]
    UnregisteredFree { start: u32, end: u32 },
    /// Attempt to claim a range that overlaps an existing allocation.
    #[error("range {start:#x}..{end:#x} overlaps an allocated block")]
    RangeOccupied { start: u32, end: u32 },
    /// Attempt to retype a cast-locked pointer.
    #[error("pointer at {address:#x} is cast-locked")]
    CastLocked { address: u32 },

    // =========================
    // Execution
    // =========================
    /// A fault delivered through the interrupt vector table.
    #[error("fault: {0}")]
    Fault(Interrupt),
    /// Fault raised while its vector holds no handler.
    #[error("unhandled {interrupt} at pc {pc:#x}")]
    UnhandledInterrupt { interrupt: Interrupt, pc: u32 },
    /// Fault raised while the call stack had no room for the return address.
    #[error("double fault: {interrupt} at pc {pc:#x} with a full call stack")]
    DoubleFault { interrupt: Interrupt, pc: u32 },
    /// Peripheral slot addressed by CALL, MEMSIZE, or a device operand is empty.
    #[error("no peripheral attached to slot {slot}")]
    UnattachedDevice { slot: u32 },
    /// Peripheral reported a failure from its call entry point.
    #[error("peripheral {slot} failed: {reason}")]
    PeripheralFailure { slot: u32, reason: String },
    /// Context identifier outside the context table bounds.
    #[error("invalid context id {id}")]
    InvalidContext { id: u32 },
    /// Character input or output stream failed.
    #[error("stream error: {0}")]
    StreamError(String),
    /// VM configuration rejected before construction.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
