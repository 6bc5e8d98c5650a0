//! Register operands and operand shapes.
//!
//! A register field in an instruction word is three bits wide and biased by one, so
//! field value `0..=7` names `r1..=r8`. The literal `0` in assembly is not a register:
//! it is [`Operand::ConstantZero`], encoded through a separate zero-mask bit.

use crate::virtual_machine::errors::VMError;
use std::fmt;

/// Number of general-purpose registers per context.
pub const REGISTER_COUNT: usize = 8;

/// One of the general-purpose registers `r1..=r8`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Reg(u8);

impl Reg {
    pub const R1: Reg = Reg(0);
    pub const R2: Reg = Reg(1);
    pub const R3: Reg = Reg(2);
    pub const R4: Reg = Reg(3);
    pub const R5: Reg = Reg(4);
    pub const R6: Reg = Reg(5);
    pub const R7: Reg = Reg(6);
    pub const R8: Reg = Reg(7);

    /// Returns the register with the given assembly number (`1..=8`).
    pub const fn new(number: u8) -> Option<Self> {
        if number >= 1 && number as usize <= REGISTER_COUNT {
            Some(Reg(number - 1))
        } else {
            None
        }
    }

    /// Builds a register from a raw 3-bit instruction field.
    pub const fn from_field(field: u32) -> Self {
        Reg((field & 0b111) as u8)
    }

    /// Returns the assembly number (`1..=8`).
    pub const fn number(self) -> u8 {
        self.0 + 1
    }

    /// Returns the index into a register file.
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Returns the raw 3-bit field value.
    pub const fn field(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.number())
    }
}

/// A readable operand: either a register or the synthetic constant zero.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operand {
    Register(Reg),
    ConstantZero,
}

impl Operand {
    /// Field value written into the instruction word (zero for the constant).
    pub const fn field(self) -> u32 {
        match self {
            Operand::Register(r) => r.field(),
            Operand::ConstantZero => 0,
        }
    }

    /// Returns the register, or `None` for the constant zero.
    pub const fn register(self) -> Option<Reg> {
        match self {
            Operand::Register(r) => Some(r),
            Operand::ConstantZero => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Register(r) => r.fmt(f),
            Operand::ConstantZero => f.write_str("0"),
        }
    }
}

/// Shape of one operand slot in the instruction table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OperandKind {
    /// Register that is written; `0` is rejected.
    Dst,
    /// Register or constant zero that is only read.
    Src,
    /// Register that is only read and has no zero encoding.
    Reg,
    /// 8-bit immediate in bits 7..0.
    Imm8,
    /// 16-bit immediate in bits 15..0.
    Imm16,
    /// 22-bit word offset in bits 21..0.
    Off22,
    /// 8-bit device or interrupt index in bits 7..0.
    Irq,
}

impl OperandKind {
    /// Returns true if this slot occupies a register field.
    pub const fn is_register(self) -> bool {
        matches!(self, OperandKind::Dst | OperandKind::Src | OperandKind::Reg)
    }

    /// Returns the bits occupied by an immediate slot.
    pub const fn immediate_mask(self) -> u32 {
        match self {
            OperandKind::Imm8 | OperandKind::Irq => 0xFF,
            OperandKind::Imm16 => 0xFFFF,
            OperandKind::Off22 => 0x3F_FFFF,
            OperandKind::Dst | OperandKind::Src | OperandKind::Reg => 0,
        }
    }

    /// Returns a human-readable name for error messages.
    pub const fn to_string(self) -> &'static str {
        match self {
            OperandKind::Dst => "destination register",
            OperandKind::Src => "register or 0",
            OperandKind::Reg => "register",
            OperandKind::Imm8 => "byte",
            OperandKind::Imm16 => "halfword",
            OperandKind::Off22 => "word offset",
            OperandKind::Irq => "device index",
        }
    }
}

/// Bit position of the register field for slot `slot` (0 = Rd .. 4 = R5).
pub const fn register_shift(slot: usize) -> u32 {
    22 - 3 * slot as u32
}

/// Parses a register number token like `r1`..`r8` (case-insensitive).
pub(crate) fn parse_register(tok: &str) -> Result<Reg, VMError> {
    let digits = tok
        .strip_prefix('r')
        .or_else(|| tok.strip_prefix('R'))
        .ok_or_else(|| VMError::ExpectedRegister(tok.to_string()))?;
    digits
        .parse::<u8>()
        .ok()
        .and_then(Reg::new)
        .ok_or_else(|| VMError::InvalidRegister {
            token: tok.to_string(),
        })
}
