//! Table-wide invariants of the instruction set.
//!
//! Every selector must decode back to its own instruction, operand fields must
//! never overlap selector bits, and mnemonic expansion must not collide.

use crate::virtual_machine::isa::{
    Arg, COND_MASK, Condition, GROUP_MASK, Instruction, decode, mnemonic_count,
};
use crate::virtual_machine::operand::{Operand, OperandKind, Reg, register_shift};
use std::collections::HashSet;

macro_rules! table_mnemonics {
    (
        $( $(#[$doc:meta])* $name:ident = $mnemonic:literal, $selector:expr => [ $( $kind:ident ),* $(,)? ] ),* $(,)?
    ) => {
        [ $( $mnemonic ),* ]
    };
}

/// Every operand at its largest encodable value.
fn saturated_args(instr: Instruction) -> Vec<Arg> {
    instr
        .operands()
        .iter()
        .map(|kind| {
            if kind.is_register() {
                Arg::Operand(Operand::Register(Reg::R8))
            } else {
                Arg::Immediate(kind.immediate_mask())
            }
        })
        .collect()
}

#[test]
fn table_mnemonics_are_unique() {
    let names = crate::for_each_instruction!(table_mnemonics);
    assert_eq!(names.len(), Instruction::ALL.len());
    let unique: HashSet<_> = names.iter().collect();
    assert_eq!(unique.len(), names.len());
}

#[test]
fn expanded_mnemonics_do_not_collide() {
    let natives: usize = Instruction::ALL
        .iter()
        .map(|i| if i.is_conditional() { Condition::ALL.len() } else { 1 })
        .sum();
    // CMPII and LOADWORDI take every condition suffix
    let aliases = 2 * Condition::ALL.len();
    assert_eq!(mnemonic_count(), natives + aliases);
}

#[test]
fn selectors_decode_to_themselves() {
    for &instr in Instruction::ALL {
        let selector = instr.selector();
        assert_eq!(selector.value & !selector.mask, 0, "{instr:?}");
        let decoded = decode(selector.value).unwrap_or_else(|e| panic!("{instr:?}: {e}"));
        assert_eq!(decoded.instruction, instr);
    }
}

#[test]
fn operand_fields_avoid_selector_bits() {
    for &instr in Instruction::ALL {
        let fixed = instr.selector().mask | GROUP_MASK;
        for (slot, kind) in instr.operands().iter().enumerate() {
            let field = if kind.is_register() {
                let mut bits = 0b111 << register_shift(slot);
                if *kind == OperandKind::Src {
                    bits |= instr.zero_bit(slot).unwrap_or(0);
                }
                bits
            } else {
                kind.immediate_mask()
            };
            assert_eq!(field & fixed, 0, "{instr:?} slot {slot}");
            assert_eq!(field & COND_MASK, 0, "{instr:?} slot {slot}");
        }
    }
}

#[test]
fn saturated_operands_keep_their_instruction() {
    for &instr in Instruction::ALL {
        let args = saturated_args(instr);
        let word = instr.encode(Condition::Less, &args).unwrap();
        let decoded = decode(word).unwrap();
        // MEMSIZE of device 255 is the UPTIME encoding
        if instr == Instruction::MemSize {
            assert_eq!(decoded.instruction, Instruction::Uptime);
            continue;
        }
        assert_eq!(decoded.instruction, instr, "{word:#010x}");
        assert_eq!(decoded.args(), args);
        if instr.is_conditional() {
            assert_eq!(decoded.condition, Condition::Less);
        }
    }
}
