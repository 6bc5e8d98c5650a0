//! Register virtual machine with a fixed-width 32-bit instruction set.
//!
//! Programs are written in a small assembly language, assembled in two passes
//! into word images, and executed against flat byte-addressable memory.
//!
//! # Architecture
//!
//! - **Registers**: eight 32-bit registers `r1..r8`, read as integers or floats
//!   depending on the instruction
//! - **Constant zero**: most source operands accept the literal `0` in place of
//!   a register
//! - **Instruction format**: one little-endian word per instruction with a
//!   3-bit condition, 4-bit group and group-specific operand fields
//! - **Interrupts**: a 24-entry vector table at the bottom of memory; faults
//!   without a handler stop the VM
//! - **Contexts**: independent register files, flags and call stacks sharing one
//!   memory, selected with `CTXSW`
//! - **Peripherals**: up to 255 devices plus a BIOS slot, each with its own
//!   memory and a call entry point
//!
//! # Modules
//!
//! - [`assembler`]: Source parsing, label resolution and diagnostics
//! - [`errors`]: Assembly and execution error types
//! - [`isa`]: Instruction table, encoding and decoding
//! - [`operand`]: Registers and operand kinds
//! - [`program`]: Assembled program images and their file format
//! - [`vm`]: Execution engine, memory, allocator, contexts and host control

pub mod assembler;
pub mod errors;
pub mod isa;
#[cfg(test)]
mod isa_static_check;
pub mod operand;
pub mod program;
pub mod vm;
