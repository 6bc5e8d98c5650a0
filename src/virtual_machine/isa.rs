//! Instruction Set Architecture (ISA) definitions.
//!
//! Defines the VM's instruction set. The [`for_each_instruction!`](crate::for_each_instruction) macro holds
//! the canonical instruction definitions and invokes a callback macro for code
//! generation, so the decoder, the assembler and the static table checks all read
//! the same immutable table.
//!
//! This module generates:
//! - The [`Instruction`] enum with mnemonic, selector and operand-shape lookups
//! - [`decode`] for turning instruction words back into [`Decoded`] instructions
//! - The condition-expanded mnemonic map used by the [`assembler`](super::assembler)
//!
//! # Instruction Word Format
//!
//! Every instruction is one little-endian 32-bit word:
//!
//! ```text
//!  31..29  28..25  24..22  21..19  18..16  15..13  12..10  9..0
//!  cond    group   Rd      Rs      Rm      R4      R5      sub-opcode / immediate
//! ```
//!
//! - `cond`: execution condition (see [`Condition`]); the jump group reuses these
//!   bits to select the jump variant
//! - register fields are biased by one (`0..=7` names `r1..=r8`)
//! - the constant-zero operand sets a zero-mask bit instead of a register field
//!   (bits 9..7 in group 0, bits 9..8 for compares)

use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::operand::{Operand, OperandKind, Reg, register_shift};
use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

pub const COND_SHIFT: u32 = 29;
pub const COND_MASK: u32 = 0b111 << COND_SHIFT;
pub const GROUP_SHIFT: u32 = 25;
pub const GROUP_MASK: u32 = 0b1111 << GROUP_SHIFT;

/// Bytes per instruction word.
pub const WORD_SIZE: u32 = 4;

/// Execution condition stored in bits 31..29.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Condition {
    Always = 0,
    Zero = 1,
    NonZero = 2,
    Greater = 3,
    Less = 4,
}

impl Condition {
    pub const ALL: [Condition; 5] = [
        Condition::Always,
        Condition::Zero,
        Condition::NonZero,
        Condition::Greater,
        Condition::Less,
    ];

    /// Mnemonic suffix selecting this condition.
    pub const fn suffix(self) -> &'static str {
        match self {
            Condition::Always => "",
            Condition::Zero => "Z",
            Condition::NonZero => "NZ",
            Condition::Greater => "GT",
            Condition::Less => "LS",
        }
    }

    /// Decodes the 3-bit condition field. Values 5..7 are not conditions.
    pub const fn from_bits(bits: u32) -> Option<Self> {
        match bits & 0b111 {
            0 => Some(Condition::Always),
            1 => Some(Condition::Zero),
            2 => Some(Condition::NonZero),
            3 => Some(Condition::Greater),
            4 => Some(Condition::Less),
            _ => None,
        }
    }

    /// Returns true if the compare flag satisfies this condition.
    pub const fn holds(self, flag: i8) -> bool {
        match self {
            Condition::Always => true,
            Condition::Zero => flag == 0,
            Condition::NonZero => flag != 0,
            Condition::Greater => flag > 0,
            Condition::Less => flag < 0,
        }
    }

    /// Condition bits positioned in an instruction word.
    pub const fn bits(self) -> u32 {
        (self as u32) << COND_SHIFT
    }
}

/// Fixed bits identifying an instruction: `word & mask == value`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Selector {
    pub mask: u32,
    pub value: u32,
}

/// Group 0 register operation selected by a 7-bit sub-opcode.
const fn alu(subop: u32) -> Selector {
    Selector {
        mask: GROUP_MASK | 0x7F,
        value: subop,
    }
}

/// Whole-group instruction with no further selector bits.
const fn group(g: u32) -> Selector {
    Selector {
        mask: GROUP_MASK,
        value: g << GROUP_SHIFT,
    }
}

/// Group 1 compare; `mode` bit 1 marks a float lhs, bit 0 a float rhs.
const fn compare(mode: u32) -> Selector {
    Selector {
        mask: GROUP_MASK | (0b111 << 16) | 0b11,
        value: (1 << GROUP_SHIFT) | mode,
    }
}

/// Group 1 immediate transfer selected by `kind` (bits 18..17) and `m` (bit 16).
const fn immediate(kind: u32, m: u32) -> Selector {
    Selector {
        mask: GROUP_MASK | (0b111 << 16),
        value: (1 << GROUP_SHIFT) | (kind << 17) | (m << 16),
    }
}

/// Group 8 jump whose variant lives in the condition bits.
const fn jump(variant: u32) -> Selector {
    Selector {
        mask: COND_MASK | GROUP_MASK,
        value: (variant << COND_SHIFT) | (8 << GROUP_SHIFT),
    }
}

/// Group 15 system call selected by bits 21..8.
const fn system(select: u32) -> Selector {
    Selector {
        mask: GROUP_MASK | (0x3FFF << 8),
        value: (15 << GROUP_SHIFT) | (select << 8),
    }
}

/// Group 15 system call that also pins the irq byte.
const fn system_irq(select: u32, irq: u32) -> Selector {
    Selector {
        mask: GROUP_MASK | (0x3FFF << 8) | 0xFF,
        value: (15 << GROUP_SHIFT) | (select << 8) | irq,
    }
}

/// Group 15 software interrupt: selector 0x3FFF with the Rd field set to 7.
const fn software_interrupt() -> Selector {
    Selector {
        mask: GROUP_MASK | (0x3FFF << 8) | (0b111 << 22),
        value: (15 << GROUP_SHIFT) | (0x3FFF << 8) | (0b111 << 22),
    }
}

/// Invokes a callback macro with the complete instruction definition list.
///
/// Each entry reads `Name = "MNEMONIC", selector => [operand kinds]`. The
/// doc comment carries the assembly syntax and semantics.
#[macro_export]
macro_rules! for_each_instruction {
    ($callback:ident) => {
        $callback! {
            // =========================
            // Group 0: float arithmetic
            // =========================
            /// HALT ; stop execution
            Halt = "HALT", alu(0) => [],
            /// ADD rd, rs, rm ; rd = rs + rm (float)
            Add = "ADD", alu(1) => [Dst, Src, Src],
            /// SUB rd, rs, rm ; rd = rs - rm (float)
            Sub = "SUB", alu(2) => [Dst, Src, Src],
            /// MUL rd, rs, rm ; rd = rs * rm (float)
            Mul = "MUL", alu(3) => [Dst, Src, Src],
            /// DIV rd, rs, rm ; rd = rs / rm (float, faults on zero divisor)
            Div = "DIV", alu(4) => [Dst, Src, Src],
            /// POW rd, rs, rm ; rd = rs ^ rm (float)
            Pow = "POW", alu(5) => [Dst, Src, Src],
            /// MOD rd, rs, rm ; rd = trunc(rs) floor-mod trunc(rm), as float
            Mod = "MOD", alu(6) => [Dst, Src, Src],
            // =========================
            // Group 0: bitwise
            // =========================
            /// SHL rd, rs, rm ; rd = rs << rm
            Shl = "SHL", alu(7) => [Dst, Src, Src],
            /// SHR rd, rs, rm ; rd = rs >> rm (arithmetic)
            Shr = "SHR", alu(8) => [Dst, Src, Src],
            /// USHR rd, rs, rm ; rd = rs >> rm (logical)
            Ushr = "USHR", alu(9) => [Dst, Src, Src],
            /// AND rd, rs, rm ; rd = rs & rm
            And = "AND", alu(10) => [Dst, Src, Src],
            /// OR rd, rs, rm ; rd = rs | rm
            Or = "OR", alu(11) => [Dst, Src, Src],
            /// XOR rd, rs, rm ; rd = rs ^ rm
            Xor = "XOR", alu(12) => [Dst, Src, Src],
            // =========================
            // Group 0: unary float
            // =========================
            /// ABS rd, rs ; rd = |rs|
            Abs = "ABS", alu(16) => [Dst, Src],
            /// SIN rd, rs ; rd = sin(rs)
            Sin = "SIN", alu(17) => [Dst, Src],
            /// COS rd, rs ; rd = cos(rs)
            Cos = "COS", alu(18) => [Dst, Src],
            /// TAN rd, rs ; rd = tan(rs)
            Tan = "TAN", alu(19) => [Dst, Src],
            /// FLOOR rd, rs ; rd = floor(rs)
            Floor = "FLOOR", alu(20) => [Dst, Src],
            /// CEIL rd, rs ; rd = ceil(rs)
            Ceil = "CEIL", alu(21) => [Dst, Src],
            /// ROUND rd, rs ; rd = round(rs)
            Round = "ROUND", alu(22) => [Dst, Src],
            /// LOG rd, rs ; rd = ln(rs)
            Log = "LOG", alu(23) => [Dst, Src],
            /// RNDI rd ; rd = random integer
            Rndi = "RNDI", alu(24) => [Dst],
            /// RND rd ; rd = random float in [0, 1)
            Rnd = "RND", alu(25) => [Dst],
            /// SGN rd, rs ; rd = signum(rs)
            Sgn = "SGN", alu(26) => [Dst, Src],
            /// SQRT rd, rs ; rd = square root of rs
            Sqrt = "SQRT", alu(27) => [Dst, Src],
            /// CBRT rd, rs ; rd = cube root of rs
            Cbrt = "CBRT", alu(28) => [Dst, Src],
            /// INV rd, rs ; rd = 1 / rs
            Inv = "INV", alu(29) => [Dst, Src],
            /// RAD rd, rs ; rd = rs degrees in radians
            Rad = "RAD", alu(30) => [Dst, Src],
            /// NOT rd, rs ; rd = !rs (bitwise)
            Not = "NOT", alu(31) => [Dst, Src],
            // =========================
            // Group 0: register transfer and allocation
            // =========================
            /// MOV rd, rs ; rd = rs
            Mov = "MOV", alu(32) => [Dst, Src],
            /// XCHG rd, rs ; swap rd and rs
            Xchg = "XCHG", alu(33) => [Dst, Dst],
            /// INC rd ; rd = rd + 1
            Inc = "INC", alu(34) => [Dst],
            /// DEC rd ; rd = rd - 1
            Dec = "DEC", alu(35) => [Dst],
            /// MALLOC rd, rs ; rd = address of rs freshly allocated bytes
            Malloc = "MALLOC", alu(36) => [Dst, Src],
            /// FTOI rd, rs ; rd = rs as integer
            Ftoi = "FTOI", alu(37) => [Dst, Src],
            /// ITOF rd, rs ; rd = rs as float
            Itof = "ITOF", alu(38) => [Dst, Src],
            /// CALLOC rd, rs ; like MALLOC, zero-filled
            Calloc = "CALLOC", alu(39) => [Dst, Src],
            /// FREE rs, rm ; release the range of rm bytes at address rs
            Free = "FREE", alu(40) => [Src, Src],
            // =========================
            // Group 0: integer arithmetic
            // =========================
            /// ADDINT rd, rs, rm ; rd = rs + rm (wrapping)
            AddInt = "ADDINT", alu(41) => [Dst, Src, Src],
            /// SUBINT rd, rs, rm ; rd = rs - rm (wrapping)
            SubInt = "SUBINT", alu(42) => [Dst, Src, Src],
            /// MULINT rd, rs, rm ; rd = rs * rm (wrapping)
            MulInt = "MULINT", alu(43) => [Dst, Src, Src],
            /// DIVINT rd, rs, rm ; rd = rs / rm (faults on zero divisor)
            DivInt = "DIVINT", alu(44) => [Dst, Src, Src],
            /// MODINT rd, rs, rm ; rd = rs floor-mod rm (faults on zero divisor)
            ModInt = "MODINT", alu(45) => [Dst, Src, Src],
            // =========================
            // Group 0: contexts, console and subroutines
            // =========================
            /// CTXSW rs ; switch to the context numbered rs
            Ctxsw = "CTXSW", alu(57) => [Src],
            /// YIELD ; voluntarily suspend when the host enables yielding
            Yield = "YIELD", alu(58) => [],
            /// GETCHAR rd ; rd = next input byte, -1 at end of input (blocking)
            Getchar = "GETCHAR", alu(59) => [Dst],
            /// PUTCHAR rs ; write the low byte of rs to the output
            Putchar = "PUTCHAR", alu(60) => [Src],
            /// JSR rs ; push return address, jump to byte address rs
            Jsr = "JSR", alu(62) => [Src],
            /// RETURN ; pop return address into lr, jump to lr
            Return = "RETURN", alu(63) => [],
            // =========================
            // Group 0: memory access (value, address, device)
            // =========================
            /// LOADBYTE rd, ra, rdev ; rd = byte at ra on device rdev
            LoadByte = "LOADBYTE", alu(64) => [Dst, Src, Src],
            /// STOREBYTE rs, ra, rdev ; byte at ra on device rdev = rs
            StoreByte = "STOREBYTE", alu(65) => [Src, Src, Src],
            /// LOADHWORD rd, ra, rdev ; rd = halfword at ra on device rdev
            LoadHword = "LOADHWORD", alu(66) => [Dst, Src, Src],
            /// STOREHWORD rs, ra, rdev ; halfword at ra on device rdev = rs
            StoreHword = "STOREHWORD", alu(67) => [Src, Src, Src],
            /// LOADWORD rd, ra, rdev ; rd = word at ra on device rdev
            LoadWord = "LOADWORD", alu(68) => [Dst, Src, Src],
            /// STOREWORD rs, ra, rdev ; word at ra on device rdev = rs
            StoreWord = "STOREWORD", alu(69) => [Src, Src, Src],
            /// MEMCPY rdst, rsrc, rlen, rfrom, rto ; copy rlen bytes between devices
            Memcpy = "MEMCPY", alu(72) => [Src, Src, Src, Reg, Reg],
            // =========================
            // Group 1: compare and immediates
            // =========================
            /// CMP rd, rs ; flag = sign(rd - rs) (int, int)
            Cmp = "CMP", compare(0b00) => [Src, Src],
            /// CMPIF rd, rs ; flag = sign(rd - rs) (int, float)
            CmpIf = "CMPIF", compare(0b01) => [Src, Src],
            /// CMPFI rd, rs ; flag = sign(rd - rs) (float, int)
            CmpFi = "CMPFI", compare(0b10) => [Src, Src],
            /// CMPFF rd, rs ; flag = sign(rd - rs) (float, float)
            CmpFf = "CMPFF", compare(0b11) => [Src, Src],
            /// LOADBYTEI rd, imm8 ; rd = imm8
            LoadByteI = "LOADBYTEI", immediate(1, 0) => [Dst, Imm8],
            /// STOREBYTEI ra, imm8 ; byte at ra = imm8
            StoreByteI = "STOREBYTEI", immediate(1, 1) => [Reg, Imm8],
            /// LOADHWORDI rd, imm16 ; rd = imm16 (zero-extended)
            LoadHwordI = "LOADHWORDI", immediate(2, 0) => [Dst, Imm16],
            /// STOREHWORDI ra, imm16 ; halfword at ra = imm16
            StoreHwordI = "STOREHWORDI", immediate(2, 1) => [Reg, Imm16],
            /// LOADWORDILO rd, imm16 ; low half of rd = imm16
            LoadWordILo = "LOADWORDILO", immediate(3, 0) => [Dst, Imm16],
            /// LOADWORDIHI rd, imm16 ; high half of rd = imm16
            LoadWordIHi = "LOADWORDIHI", immediate(3, 1) => [Dst, Imm16],
            // =========================
            // Groups 2-7: absolute words and call stack
            // =========================
            /// LOADWORDIMEM rd, off22 ; rd = word at off22 * 4
            LoadWordIMem = "LOADWORDIMEM", group(2) => [Dst, Off22],
            /// STOREWORDIMEM rs, off22 ; word at off22 * 4 = rs
            StoreWordIMem = "STOREWORDIMEM", group(3) => [Reg, Off22],
            /// PUSH rs ; push rs onto the call stack
            Push = "PUSH", group(4) => [Reg],
            /// POP rd ; pop the call stack into rd
            Pop = "POP", group(5) => [Dst],
            /// PUSHWORDI off22 ; push off22 * 4 onto the call stack
            PushWordI = "PUSHWORDI", group(6) => [Off22],
            /// POPWORDI ; pop the call stack into lr
            PopWordI = "POPWORDI", group(7) => [],
            // =========================
            // Group 8: jumps (variant in the condition bits)
            // =========================
            /// JMP off22 ; pc = off22 * 4
            Jmp = "JMP", jump(0) => [Off22],
            /// JZ off22 ; jump if flag == 0
            Jz = "JZ", jump(1) => [Off22],
            /// JNZ off22 ; jump if flag != 0
            Jnz = "JNZ", jump(2) => [Off22],
            /// JGT off22 ; jump if flag > 0
            Jgt = "JGT", jump(3) => [Off22],
            /// JLS off22 ; jump if flag < 0
            Jls = "JLS", jump(4) => [Off22],
            /// JFW off22 ; pc += off22 * 4
            Jfw = "JFW", jump(5) => [Off22],
            /// JBW off22 ; pc -= off22 * 4
            Jbw = "JBW", jump(6) => [Off22],
            // =========================
            // Group 9: subroutine call
            // =========================
            /// JSRI off22 ; push return address, pc = off22 * 4
            JsrI = "JSRI", group(9) => [Off22],
            // =========================
            // Group 15: peripherals and interrupts
            // =========================
            /// UPTIME rd ; rd = milliseconds since VM start
            Uptime = "UPTIME", system_irq(1, 0xFF) => [Dst],
            /// CALL rs, irq ; invoke peripheral irq (255 = BIOS) with argument rs
            Call = "CALL", system(0) => [Reg, Irq],
            /// MEMSIZE rd, irq ; rd = memory size of device irq (0 = main memory)
            MemSize = "MEMSIZE", system(1) => [Dst, Irq],
            /// INT irq ; raise interrupt irq
            Int = "INT", software_interrupt() => [Irq],
        }
    };
}

#[macro_export]
macro_rules! define_instructions {
    (
        $(
            $(#[$doc:meta])*
            $name:ident = $mnemonic:literal, $selector:expr => [
                $( $kind:ident ),* $(,)?
            ]
        ),* $(,)?
    ) => {
        // =========================
        // VM instruction enum
        // =========================
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
        pub enum Instruction {
            $(
                $(#[$doc])*
                $name,
            )*
        }

        impl Instruction {
            /// Every instruction in table order.
            pub const ALL: &'static [Instruction] = &[ $( Instruction::$name ),* ];

            /// Returns the assembly mnemonic for this instruction.
            pub const fn mnemonic(self) -> &'static str {
                match self {
                    $( Instruction::$name => $mnemonic, )*
                }
            }

            /// Returns the fixed bits identifying this instruction.
            pub const fn selector(self) -> Selector {
                match self {
                    $( Instruction::$name => $selector, )*
                }
            }

            /// Returns the operand shape, registers first.
            pub const fn operands(self) -> &'static [OperandKind] {
                match self {
                    $( Instruction::$name => &[ $( OperandKind::$kind ),* ], )*
                }
            }
        }
    };
}

for_each_instruction!(define_instructions);

impl Instruction {
    /// Instruction group (bits 28..25).
    pub const fn group(self) -> u32 {
        (self.selector().value & GROUP_MASK) >> GROUP_SHIFT
    }

    /// Returns false for instructions that repurpose the condition bits.
    pub const fn is_conditional(self) -> bool {
        self.selector().mask & COND_MASK == 0
    }

    /// Zero-mask bit for a register-or-zero operand in `slot`, if the group has one.
    pub const fn zero_bit(self, slot: usize) -> Option<u32> {
        match (self.group(), slot) {
            (0, 0..=2) => Some(1 << (7 + slot)),
            (1, 0..=1) => Some(1 << (8 + slot)),
            _ => None,
        }
    }

    /// Every bit this instruction may legitimately set.
    pub fn used_bits(self) -> u32 {
        let selector = self.selector();
        let mut bits = COND_MASK | GROUP_MASK | selector.mask;
        for (slot, kind) in self.operands().iter().enumerate() {
            if kind.is_register() {
                bits |= 0b111 << register_shift(slot);
                if *kind == OperandKind::Src {
                    bits |= self.zero_bit(slot).unwrap_or(0);
                }
            } else {
                bits |= kind.immediate_mask();
            }
        }
        bits
    }

    /// Returns the immediate operand kind, if the instruction has one.
    pub fn immediate_kind(self) -> Option<OperandKind> {
        self.operands().iter().copied().find(|k| !k.is_register())
    }

    /// Encodes this instruction with already-validated operands.
    pub fn encode(self, condition: Condition, args: &[Arg]) -> Result<u32, VMError> {
        let kinds = self.operands();
        if args.len() != kinds.len() {
            return Err(VMError::ArityMismatch {
                instruction: self.mnemonic().to_string(),
                expected: kinds.len(),
                actual: args.len(),
            });
        }

        let mut word = self.selector().value;
        if self.is_conditional() {
            word |= condition.bits();
        }

        for (slot, (kind, arg)) in kinds.iter().zip(args).enumerate() {
            match (kind, arg) {
                (_, Arg::Operand(Operand::Register(reg))) if kind.is_register() => {
                    word |= reg.field() << register_shift(slot);
                }
                (OperandKind::Src, Arg::Operand(Operand::ConstantZero)) => {
                    word |= self
                        .zero_bit(slot)
                        .ok_or_else(|| VMError::ZeroNotAllowed {
                            instruction: self.mnemonic().to_string(),
                            index: slot,
                        })?;
                }
                (OperandKind::Dst, Arg::Operand(Operand::ConstantZero)) => {
                    return Err(VMError::ZeroDestination {
                        instruction: self.mnemonic().to_string(),
                    });
                }
                (OperandKind::Reg, Arg::Operand(Operand::ConstantZero)) => {
                    return Err(VMError::ZeroNotAllowed {
                        instruction: self.mnemonic().to_string(),
                        index: slot,
                    });
                }
                (_, Arg::Immediate(value)) if !kind.is_register() => {
                    word |= value & kind.immediate_mask();
                }
                (_, Arg::Immediate(value)) => {
                    return Err(VMError::ExpectedRegister(value.to_string()));
                }
                (_, Arg::Operand(op)) => {
                    return Err(VMError::InvalidLiteral {
                        token: op.to_string(),
                    });
                }
            }
        }
        Ok(word)
    }
}

/// An operand ready for encoding.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Arg {
    Operand(Operand),
    Immediate(u32),
}

/// A decoded instruction word.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Decoded {
    pub instruction: Instruction,
    pub condition: Condition,
    pub word: u32,
}

impl Decoded {
    /// Register in operand slot `slot`.
    #[inline(always)]
    pub fn reg(&self, slot: usize) -> Reg {
        Reg::from_field(self.word >> register_shift(slot))
    }

    /// Register-or-zero operand in slot `slot`.
    #[inline(always)]
    pub fn operand(&self, slot: usize) -> Operand {
        match self.instruction.zero_bit(slot) {
            Some(bit) if self.word & bit != 0 => Operand::ConstantZero,
            _ => Operand::Register(self.reg(slot)),
        }
    }

    /// Immediate operand, masked to its field width.
    #[inline(always)]
    pub fn imm(&self) -> u32 {
        self.instruction
            .immediate_kind()
            .map_or(0, |kind| self.word & kind.immediate_mask())
    }

    /// Decoded operands in table order.
    pub fn args(&self) -> Vec<Arg> {
        self.instruction
            .operands()
            .iter()
            .enumerate()
            .map(|(slot, kind)| match kind {
                OperandKind::Src => Arg::Operand(self.operand(slot)),
                OperandKind::Dst | OperandKind::Reg => {
                    Arg::Operand(Operand::Register(self.reg(slot)))
                }
                _ => Arg::Immediate(self.imm()),
            })
            .collect()
    }
}

impl fmt::Display for Decoded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.instruction.mnemonic())?;
        if self.instruction.is_conditional() {
            f.write_str(self.condition.suffix())?;
        }
        for (i, arg) in self.args().iter().enumerate() {
            f.write_str(if i == 0 { " " } else { ", " })?;
            match arg {
                Arg::Operand(op) => write!(f, "{op}")?,
                Arg::Immediate(v) => write!(f, "{v:X}h")?,
            }
        }
        Ok(())
    }
}

/// Per-group candidate lists, most specific selector first.
static DECODE_TABLE: LazyLock<[Vec<Instruction>; 16]> = LazyLock::new(|| {
    let mut table: [Vec<Instruction>; 16] = Default::default();
    for &instr in Instruction::ALL {
        table[instr.group() as usize].push(instr);
    }
    for candidates in table.iter_mut() {
        candidates.sort_by_key(|i| std::cmp::Reverse(i.selector().mask.count_ones()));
    }
    table
});

/// Decodes one instruction word.
///
/// Returns [`VMError::IllegalInstruction`] if no instruction matches, if the
/// condition bits hold 5..7 outside the jump group, or if any bit outside the
/// matched instruction's fields is set.
pub fn decode(word: u32) -> Result<Decoded, VMError> {
    let group = ((word & GROUP_MASK) >> GROUP_SHIFT) as usize;
    let illegal = VMError::IllegalInstruction { word };

    let instruction = DECODE_TABLE[group]
        .iter()
        .copied()
        .find(|i| word & i.selector().mask == i.selector().value)
        .ok_or(illegal)?;

    if word & !instruction.used_bits() != 0 {
        return Err(VMError::IllegalInstruction { word });
    }

    let condition = if instruction.is_conditional() {
        Condition::from_bits(word >> COND_SHIFT).ok_or(VMError::IllegalInstruction { word })?
    } else {
        Condition::Always
    };

    Ok(Decoded {
        instruction,
        condition,
        word,
    })
}

/// Decodes every word of `bytes` (trailing partial words are ignored).
pub fn disassemble(bytes: &[u8]) -> Vec<Result<Decoded, VMError>> {
    bytes
        .chunks_exact(WORD_SIZE as usize)
        .map(|c| decode(u32::from_le_bytes([c[0], c[1], c[2], c[3]])))
        .collect()
}

/// What an assembler mnemonic stands for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mnemonic {
    /// A table instruction.
    Native(Instruction),
    /// `LOADWORDI rd, value`: one or two words depending on the value.
    LoadWordI,
}

/// Mnemonics that are not instruction names of their own.
const ALIASES: &[(&str, Mnemonic)] = &[
    ("CMPII", Mnemonic::Native(Instruction::Cmp)),
    ("LOADWORDI", Mnemonic::LoadWordI),
];

/// Upper-case mnemonic (with condition suffix) to instruction and condition.
static MNEMONICS: LazyLock<HashMap<String, (Mnemonic, Condition)>> = LazyLock::new(|| {
    let mut map = HashMap::new();
    let natives = Instruction::ALL
        .iter()
        .map(|&i| (i.mnemonic(), Mnemonic::Native(i), i.is_conditional()));
    let aliases = ALIASES.iter().map(|&(name, m)| (name, m, true));

    for (name, mnemonic, conditional) in natives.chain(aliases) {
        if conditional {
            for cond in Condition::ALL {
                map.insert(format!("{name}{}", cond.suffix()), (mnemonic, cond));
            }
        } else {
            map.insert(name.to_string(), (mnemonic, Condition::Always));
        }
    }
    map
});

/// Looks up a mnemonic, case-insensitively, including condition suffixes.
pub fn lookup_mnemonic(name: &str) -> Option<(Mnemonic, Condition)> {
    MNEMONICS.get(&name.to_ascii_uppercase()).copied()
}

/// Number of entries in the expanded mnemonic map.
#[cfg(test)]
pub(crate) fn mnemonic_count() -> usize {
    MNEMONICS.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(n: u8) -> Arg {
        Arg::Operand(Operand::Register(Reg::new(n).unwrap()))
    }

    #[test]
    fn decode_rejects_unknown_subop() {
        assert!(matches!(
            decode(14),
            Err(VMError::IllegalInstruction { word: 14 })
        ));
    }

    #[test]
    fn decode_zero_is_halt() {
        let d = decode(0).unwrap();
        assert_eq!(d.instruction, Instruction::Halt);
        assert_eq!(d.condition, Condition::Always);
    }

    #[test]
    fn decode_rejects_condition_five_outside_jumps() {
        let word = (5 << COND_SHIFT) | 1;
        assert!(matches!(decode(word), Err(VMError::IllegalInstruction { .. })));
    }

    #[test]
    fn decode_rejects_stray_bits() {
        // HALT with a register field set
        assert!(decode(1 << 22).is_err());
        // INC with a zero-mask bit set on a destination slot
        let inc = Instruction::Inc.encode(Condition::Always, &[reg(1)]).unwrap();
        assert!(decode(inc | (1 << 7)).is_err());
    }

    #[test]
    fn encode_add_int_fields() {
        let word = Instruction::AddInt
            .encode(Condition::Always, &[reg(3), reg(1), reg(2)])
            .unwrap();
        assert_eq!(word, (2 << 22) | (0 << 19) | (1 << 16) | 41);
    }

    #[test]
    fn group_zero_subops_keep_legacy_numbers() {
        let expected = [
            (16, Instruction::Abs),
            (23, Instruction::Log),
            (31, Instruction::Not),
            (32, Instruction::Mov),
            (34, Instruction::Inc),
            (36, Instruction::Malloc),
            (38, Instruction::Itof),
            (62, Instruction::Jsr),
            (63, Instruction::Return),
            (64, Instruction::LoadByte),
            (72, Instruction::Memcpy),
        ];
        for (subop, instr) in expected {
            assert_eq!(instr.selector().value, subop, "{instr:?}");
        }
        // ABS r2, r1 and MOV r1, r3 as raw words
        assert_eq!(decode((1 << 22) | 16).unwrap().to_string(), "ABS r2, r1");
        assert_eq!(decode((2 << 19) | 32).unwrap().to_string(), "MOV r1, r3");
    }

    #[test]
    fn encode_constant_zero_sets_mask_bit() {
        let word = Instruction::Mov
            .encode(
                Condition::Always,
                &[reg(1), Arg::Operand(Operand::ConstantZero)],
            )
            .unwrap();
        assert_eq!(word & (1 << 8), 1 << 8);
        let d = decode(word).unwrap();
        assert_eq!(d.operand(1), Operand::ConstantZero);
        assert_eq!(d.reg(0), Reg::R1);
    }

    #[test]
    fn encode_rejects_zero_destination() {
        let err = Instruction::Inc
            .encode(Condition::Always, &[Arg::Operand(Operand::ConstantZero)])
            .unwrap_err();
        assert!(matches!(err, VMError::ZeroDestination { .. }));
    }

    #[test]
    fn encode_condition_bits() {
        let word = Instruction::SubInt
            .encode(Condition::Less, &[reg(1), reg(1), reg(7)])
            .unwrap();
        assert_eq!(word >> COND_SHIFT, 4);
        let d = decode(word).unwrap();
        assert_eq!(d.condition, Condition::Less);
        assert_eq!(d.to_string(), "SUBINTLS r1, r1, r7");
    }

    #[test]
    fn jump_variant_lives_in_condition_bits() {
        let word = Instruction::Jgt
            .encode(Condition::Always, &[Arg::Immediate(0x40)])
            .unwrap();
        assert_eq!(word >> COND_SHIFT, 3);
        assert_eq!((word & GROUP_MASK) >> GROUP_SHIFT, 8);
        let d = decode(word).unwrap();
        assert_eq!(d.instruction, Instruction::Jgt);
        assert_eq!(d.imm(), 0x40);
        assert_eq!(d.to_string(), "JGT 40h");
    }

    #[test]
    fn jump_variant_seven_is_illegal() {
        let word = (7 << COND_SHIFT) | (8 << GROUP_SHIFT);
        assert!(decode(word).is_err());
    }

    #[test]
    fn uptime_and_memsize_share_a_selector() {
        let uptime = Instruction::Uptime.encode(Condition::Always, &[reg(2)]).unwrap();
        let memsize = Instruction::MemSize
            .encode(Condition::Always, &[reg(2), Arg::Immediate(0xFF)])
            .unwrap();
        assert_eq!(uptime, memsize);
        assert_eq!(decode(uptime).unwrap().instruction, Instruction::Uptime);

        let memsize0 = Instruction::MemSize
            .encode(Condition::Always, &[reg(2), Arg::Immediate(0)])
            .unwrap();
        assert_eq!(decode(memsize0).unwrap().instruction, Instruction::MemSize);
    }

    #[test]
    fn software_interrupt_requires_rd_seven() {
        let word = Instruction::Int
            .encode(Condition::Always, &[Arg::Immediate(5)])
            .unwrap();
        assert_eq!((word >> 22) & 0b111, 7);
        assert_eq!(decode(word).unwrap().imm(), 5);
        // Same selector with a different Rd field is not an instruction
        assert!(decode(word & !(1 << 22)).is_err());
    }

    #[test]
    fn memcpy_uses_five_register_fields() {
        let word = Instruction::Memcpy
            .encode(
                Condition::Always,
                &[
                    Arg::Operand(Operand::ConstantZero),
                    reg(2),
                    reg(3),
                    reg(4),
                    reg(5),
                ],
            )
            .unwrap();
        let d = decode(word).unwrap();
        assert_eq!(d.instruction, Instruction::Memcpy);
        assert_eq!(d.operand(0), Operand::ConstantZero);
        assert_eq!(d.reg(3), Reg::R4);
        assert_eq!(d.reg(4), Reg::R5);
    }

    #[test]
    fn lookup_mnemonic_expands_suffixes() {
        assert_eq!(
            lookup_mnemonic("subls"),
            Some((Mnemonic::Native(Instruction::Sub), Condition::Less))
        );
        assert_eq!(
            lookup_mnemonic("JSRIZ"),
            Some((Mnemonic::Native(Instruction::JsrI), Condition::Zero))
        );
        assert_eq!(
            lookup_mnemonic("loadwordigt"),
            Some((Mnemonic::LoadWordI, Condition::Greater))
        );
        assert_eq!(
            lookup_mnemonic("CMPII"),
            Some((Mnemonic::Native(Instruction::Cmp), Condition::Always))
        );
    }

    #[test]
    fn lookup_mnemonic_does_not_suffix_jumps() {
        assert!(lookup_mnemonic("JMPZ").is_none());
        assert_eq!(
            lookup_mnemonic("jz"),
            Some((Mnemonic::Native(Instruction::Jz), Condition::Always))
        );
    }

    #[test]
    fn condition_holds() {
        assert!(Condition::Always.holds(-1));
        assert!(Condition::Zero.holds(0));
        assert!(!Condition::Zero.holds(1));
        assert!(Condition::NonZero.holds(-1));
        assert!(Condition::Greater.holds(1));
        assert!(!Condition::Greater.holds(0));
        assert!(Condition::Less.holds(-1));
    }

    #[test]
    fn disassemble_words() {
        let mut bytes = Vec::new();
        let inc = Instruction::Inc.encode(Condition::NonZero, &[reg(4)]).unwrap();
        bytes.extend_from_slice(&inc.to_le_bytes());
        bytes.extend_from_slice(&((3 << 22) | (4 << 19) | 37u32).to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        let listing: Vec<String> = disassemble(&bytes)
            .into_iter()
            .map(|d| d.unwrap().to_string())
            .collect();
        assert_eq!(listing, vec!["INCNZ r4", "FTOI r4, r5", "HALT"]);
    }
}
