//! TerranVM library.
//!
//! Provides the register virtual machine, its assembler and the program image
//! format shared by the `terranvm` runner and the `assembler` tool.

pub mod utils;
pub mod virtual_machine;
