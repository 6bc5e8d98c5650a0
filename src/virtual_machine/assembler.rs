//! Assembly language parser and two-pass program assembler.
//!
//! Converts assembly source into a [`Program`] image whose words are exactly
//! what [`isa::decode`](crate::virtual_machine::isa::decode) consumes.
//!
//! # Syntax
//!
//! ```text
//! .data;
//! string greeting "hi\n";     # NUL-terminated, padded to a word
//! int answer 42;
//! .code;
//! :start;
//! LOADWORDI r1, @greeting;    # labels are referenced with @
//! ADDINTNZ r2, r2, 0;         # condition suffix, constant-zero operand
//! JMP @start;
//! ```
//!
//! - Statements end with `;`, comments start with `#` and run to end of line
//! - Mnemonics, registers and labels are case-insensitive
//! - Registers are `r1`..`r8`; the literal `0` in a register slot is the constant zero
//! - Numbers are decimal, floats contain a `.`, hex ends in `h`, binary ends in `b`
//! - `.stack N;` (or `.stack; N;`) sets the call-stack capacity
//!
//! Pass 1 parses every statement, sizes it and fixes every label's address.
//! Pass 2 encodes instructions against the complete label table and back-patches
//! the jump placed at the head of each `.data` section.

use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::isa::{Arg, Condition, Instruction, Mnemonic, lookup_mnemonic};
use crate::virtual_machine::operand::{Operand, OperandKind, parse_register};
use crate::virtual_machine::program::Program;
use crate::virtual_machine::vm::IVT_END;
use std::collections::HashMap;
use std::fmt::Write;
use std::fs;
use std::path::Path;

const COMMENT_CHAR: char = '#';
const STATEMENT_END: char = ';';
const LABEL_PREFIX: char = ':';
const REFERENCE_PREFIX: char = '@';
const SECTION_PREFIX: char = '.';

/// Return the line/column/message triple for assembly-related errors.
fn assembly_error_location(err: &VMError) -> Option<(usize, usize, String)> {
    match err {
        VMError::AssemblyError {
            line,
            column,
            reason,
        } => Some((*line, *column, reason.clone())),
        VMError::ParseError {
            line,
            column,
            message,
        } => Some((*line, *column, message.to_string())),
        _ => None,
    }
}

/// Formats a compiler-style diagnostic for assembly failures.
fn render_assembly_diagnostic(
    file: &str,
    source: &str,
    line: usize,
    column: usize,
    message: &str,
) -> String {
    let mut diag = String::new();
    let _ = writeln!(diag, "error: {message}");
    let _ = writeln!(diag, " --> {file}:{line}:{column}");

    if let Some(raw_line) = source.lines().nth(line.saturating_sub(1)) {
        let line_text = raw_line.trim_end_matches('\r');
        let underline = " ".repeat(column.saturating_sub(1));
        let _ = writeln!(diag, "  |");
        let _ = writeln!(diag, "{:>4} | {}", line, line_text);
        let _ = writeln!(diag, "  | {}^", underline);
    }

    diag
}

/// Emit a helpful diagnostic to stderr for assembly errors.
fn log_assembly_error(file: &str, source: &str, err: &VMError) {
    if cfg!(test) {
        return;
    }
    if let Some((line, column, message)) = assembly_error_location(err) {
        eprintln!(
            "{}",
            render_assembly_diagnostic(file, source, line, column, &message)
        );
    } else {
        eprintln!("error: {err}");
    }
}

/// Attaches a source location to an error that does not carry one yet.
fn located(err: VMError, line: usize, column: usize) -> VMError {
    match err {
        VMError::AssemblyError { .. } | VMError::ParseError { .. } => err,
        other => VMError::AssemblyError {
            line,
            column,
            reason: other.to_string(),
        },
    }
}

/// Label definitions, keyed by lower-cased name.
#[derive(Debug, Default)]
pub struct LabelTable {
    labels: HashMap<String, u32>,
}

impl LabelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `name` to `address`. Rebinding to the same address is tolerated.
    pub fn define(&mut self, name: &str, address: u32) -> Result<(), VMError> {
        let key = name.to_ascii_lowercase();
        match self.labels.get(&key) {
            Some(&old) if old != address => Err(VMError::DuplicateLabel {
                label: name.to_string(),
                old,
                new: address,
            }),
            _ => {
                self.labels.insert(key, address);
                Ok(())
            }
        }
    }

    /// Resolves a label to its byte address.
    pub fn resolve(&self, name: &str) -> Result<u32, VMError> {
        self.labels
            .get(&name.to_ascii_lowercase())
            .copied()
            .ok_or(VMError::UndefinedLabel {
                label: name.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

// ==================== Tokenizer ====================

#[derive(Debug, Clone)]
struct Token {
    text: String,
    line: usize,
    /// 1-based column in the line.
    column: usize,
    /// Came from a `"..."` literal, with escapes already applied.
    quoted: bool,
}

impl Token {
    fn is(&self, prefix: char) -> bool {
        !self.quoted && self.text.starts_with(prefix)
    }
}

/// Character cursor that tracks line and column.
struct Cursor<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    column: usize,
}

impl<'a> Cursor<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().peekable(),
            line: 1,
            column: 0,
        }
    }

    /// Returns the next character with the position it was read at.
    fn next(&mut self) -> Option<(char, usize, usize)> {
        let c = self.chars.next()?;
        self.column += 1;
        let at = (c, self.line, self.column);
        if c == '\n' {
            self.line += 1;
            self.column = 0;
        }
        Some(at)
    }
}

/// Reads the body of a string literal whose opening quote was just consumed.
fn read_string(cursor: &mut Cursor, line: usize, column: usize) -> Result<String, VMError> {
    let mut text = String::new();
    loop {
        let Some((c, l, col)) = cursor.next() else {
            return Err(VMError::ParseError {
                line,
                column,
                message: "unterminated string literal (missing closing quote)",
            });
        };
        match c {
            '"' => return Ok(text),
            '\\' => {
                let escaped = match cursor.next() {
                    Some(('n', ..)) => '\n',
                    Some(('t', ..)) => '\t',
                    Some(('\\', ..)) => '\\',
                    Some(('"', ..)) => '"',
                    Some(('0', ..)) => '\0',
                    Some((other, ..)) => return Err(located(VMError::InvalidEscape(other), l, col)),
                    None => {
                        return Err(VMError::ParseError {
                            line,
                            column,
                            message: "unterminated string literal (missing closing quote)",
                        });
                    }
                };
                text.push(escaped);
            }
            _ => text.push(c),
        }
    }
}

/// Splits source into `;`-terminated statements of tokens.
///
/// Rules:
/// - `#` starts a comment outside string literals
/// - commas and whitespace separate tokens
/// - a string literal is a single token and may span lines
fn tokenize(source: &str) -> Result<Vec<Vec<Token>>, VMError> {
    let mut statements = Vec::new();
    let mut current: Vec<Token> = Vec::new();
    let mut word: Option<Token> = None;
    let mut cursor = Cursor::new(source);

    fn flush(word: &mut Option<Token>, current: &mut Vec<Token>) {
        if let Some(tok) = word.take() {
            current.push(tok);
        }
    }

    while let Some((c, line, column)) = cursor.next() {
        match c {
            COMMENT_CHAR => {
                flush(&mut word, &mut current);
                while let Some((c, ..)) = cursor.next() {
                    if c == '\n' {
                        break;
                    }
                }
            }
            '"' => {
                flush(&mut word, &mut current);
                let text = read_string(&mut cursor, line, column)?;
                current.push(Token {
                    text,
                    line,
                    column,
                    quoted: true,
                });
            }
            STATEMENT_END => {
                flush(&mut word, &mut current);
                if !current.is_empty() {
                    statements.push(std::mem::take(&mut current));
                }
            }
            ',' => flush(&mut word, &mut current),
            c if c.is_whitespace() => flush(&mut word, &mut current),
            c => match &mut word {
                Some(tok) => tok.text.push(c),
                None => {
                    word = Some(Token {
                        text: c.to_string(),
                        line,
                        column,
                        quoted: false,
                    })
                }
            },
        }
    }

    flush(&mut word, &mut current);
    if let Some(first) = current.first() {
        return Err(VMError::ParseError {
            line: first.line,
            column: first.column,
            message: "statement is missing its terminating ';'",
        });
    }
    Ok(statements)
}

// ==================== Literals ====================

/// A parsed numeric literal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f32),
}

impl Literal {
    /// The 32-bit pattern this literal stores in a word.
    pub fn bits(self) -> u32 {
        match self {
            Literal::Int(v) => v as u32,
            Literal::Float(f) => f.to_bits(),
        }
    }
}

/// Parses a numeric literal.
///
/// Hex literals end in `h` and binary literals in `b`; `0x`/`0b` prefixes are
/// rejected, except that a lone `0b` is binary zero and a `0b…h` token is hex.
pub fn parse_literal(tok: &str) -> Result<Literal, VMError> {
    let invalid = || VMError::InvalidLiteral {
        token: tok.to_string(),
    };
    let lower = tok.to_ascii_lowercase();
    let (negative, body) = match lower.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, lower.as_str()),
    };
    if body.is_empty() {
        return Err(invalid());
    }

    if body.starts_with("0x") || (body.starts_with("0b") && body != "0b" && !body.ends_with('h')) {
        return Err(VMError::PrefixedLiteral {
            token: tok.to_string(),
        });
    }

    let magnitude = if let Some(digits) = body.strip_suffix('h') {
        i64::from_str_radix(digits, 16).map_err(|_| invalid())?
    } else if let Some(digits) = body.strip_suffix('b') {
        i64::from_str_radix(digits, 2).map_err(|_| invalid())?
    } else if body.contains('.') {
        let value: f32 = body.parse().map_err(|_| invalid())?;
        return Ok(Literal::Float(if negative { -value } else { value }));
    } else {
        body.parse::<i64>().map_err(|_| invalid())?
    };

    let value = if negative { -magnitude } else { magnitude };
    if !(i32::MIN as i64..=u32::MAX as i64).contains(&value) {
        return Err(VMError::ImmediateOutOfRange {
            token: tok.to_string(),
            bits: 32,
        });
    }
    Ok(Literal::Int(value))
}

/// Parses an integer literal that must fit in an unsigned or signed field of `bits` bits.
fn parse_field(tok: &str, bits: u32) -> Result<u32, VMError> {
    let value = match parse_literal(tok)? {
        Literal::Int(v) => v,
        Literal::Float(_) => {
            return Err(VMError::InvalidLiteral {
                token: tok.to_string(),
            });
        }
    };
    let mask = if bits >= 32 { u32::MAX } else { (1u32 << bits) - 1 };
    let min = -(1i64 << (bits - 1));
    if value < min || value > mask as i64 {
        return Err(VMError::ImmediateOutOfRange {
            token: tok.to_string(),
            bits,
        });
    }
    Ok(value as u32 & mask)
}

// ==================== Pass 1: layout ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Data,
    Code,
    Stack,
}

#[derive(Debug)]
enum Item {
    Instruction {
        mnemonic: Mnemonic,
        condition: Condition,
        name: String,
        operands: Vec<Token>,
    },
    Data(Vec<u8>),
    /// Jump over a `.data` section, patched once the next code address is known.
    DataHead,
    /// Start of a `.code` section.
    CodeStart,
}

#[derive(Debug)]
struct Placed {
    item: Item,
    address: u32,
    line: usize,
    column: usize,
}

struct Layout {
    items: Vec<Placed>,
    labels: LabelTable,
    stack_size: Option<u32>,
    size: u32,
}

fn parse_stack_size(tok: &Token) -> Result<u32, VMError> {
    match parse_literal(&tok.text)? {
        Literal::Int(v) if v >= 1 && v <= u32::MAX as i64 => Ok(v as u32),
        _ => Err(VMError::InvalidLiteral {
            token: tok.text.clone(),
        }),
    }
}

/// Parses a data declaration (`string`, `int`, `float`, `bytes`) into its bytes.
fn parse_data(tokens: &[Token]) -> Result<(String, Vec<u8>), VMError> {
    let kind = tokens[0].text.to_ascii_lowercase();
    let name = tokens.get(1).filter(|t| !t.quoted).ok_or_else(|| VMError::MalformedData {
        reason: format!("{kind} declaration needs a name"),
    })?;
    let values = &tokens[2..];

    let single = |what: &str| -> Result<&Token, VMError> {
        match values {
            [v] => Ok(v),
            _ => Err(VMError::MalformedData {
                reason: format!("{what} {} expects exactly one value", name.text),
            }),
        }
    };

    let mut bytes = match kind.as_str() {
        "string" => {
            let value = single("string")?;
            if !value.quoted {
                return Err(VMError::MalformedData {
                    reason: format!("string {} expects a quoted value", name.text),
                });
            }
            let mut b = value.text.as_bytes().to_vec();
            b.push(0);
            b
        }
        "int" => {
            let value = single("int")?;
            match parse_literal(&value.text)? {
                Literal::Int(v) => (v as u32).to_le_bytes().to_vec(),
                Literal::Float(_) => {
                    return Err(VMError::InvalidLiteral {
                        token: value.text.clone(),
                    });
                }
            }
        }
        "float" => {
            let value = single("float")?;
            let f = match parse_literal(&value.text)? {
                Literal::Int(v) => v as f32,
                Literal::Float(f) => f,
            };
            f.to_bits().to_le_bytes().to_vec()
        }
        "bytes" => {
            if values.is_empty() {
                return Err(VMError::MalformedData {
                    reason: format!("bytes {} expects at least one value", name.text),
                });
            }
            values
                .iter()
                .map(|t| parse_field(&t.text, 8).map(|b| b as u8))
                .collect::<Result<Vec<u8>, VMError>>()?
        }
        _ => return Err(VMError::InvalidDataType { kind }),
    };

    while bytes.len() % 4 != 0 {
        bytes.push(0);
    }
    Ok((name.text.clone(), bytes))
}

/// Number of words a `LOADWORDI` expands to.
fn load_word_size(operands: &[Token]) -> Result<u32, VMError> {
    let [_, value] = operands else {
        return Err(VMError::ArityMismatch {
            instruction: "LOADWORDI".to_string(),
            expected: 2,
            actual: operands.len(),
        });
    };
    if value.is(REFERENCE_PREFIX) {
        return Ok(2);
    }
    Ok(if parse_literal(&value.text)?.bits() <= 0xFFFF {
        1
    } else {
        2
    })
}

/// Pass 1: parses and sizes every statement and binds every label.
fn layout(statements: Vec<Vec<Token>>, origin: u32) -> Result<Layout, VMError> {
    let mut items = Vec::new();
    let mut labels = LabelTable::new();
    let mut stack_size = None;
    let mut section = Section::Code;
    let mut address = origin;

    for stmt in statements {
        let (line, column) = (stmt[0].line, stmt[0].column);
        let at = |e: VMError| located(e, line, column);
        let mut place = |item: Item, size: u32, address: &mut u32| {
            items.push(Placed {
                item,
                address: *address,
                line,
                column,
            });
            *address += size;
        };

        if stmt[0].is(SECTION_PREFIX) {
            let name = stmt[0].text[1..].to_ascii_lowercase();
            match (name.as_str(), stmt.len()) {
                ("data", 1) => {
                    section = Section::Data;
                    place(Item::DataHead, 4, &mut address);
                }
                ("code", 1) => {
                    section = Section::Code;
                    place(Item::CodeStart, 0, &mut address);
                }
                ("stack", 1) => section = Section::Stack,
                ("stack", 2) => stack_size = Some(parse_stack_size(&stmt[1]).map_err(at)?),
                _ => {
                    return Err(at(VMError::InvalidSection {
                        name: stmt[0].text.clone(),
                    }));
                }
            }
            continue;
        }

        if section == Section::Stack {
            if stmt.len() != 1 {
                return Err(at(VMError::MalformedData {
                    reason: "stack section expects a single size".to_string(),
                }));
            }
            stack_size = Some(parse_stack_size(&stmt[0]).map_err(at)?);
            section = Section::Code;
            continue;
        }

        let mut rest = &stmt[..];
        if rest[0].is(LABEL_PREFIX) {
            let name = &rest[0].text[1..];
            if name.is_empty() {
                return Err(VMError::ParseError {
                    line,
                    column,
                    message: "label definition has no name",
                });
            }
            labels.define(name, address).map_err(at)?;
            rest = &rest[1..];
            if rest.is_empty() {
                continue;
            }
        }

        let (line, column) = (rest[0].line, rest[0].column);
        let at = |e: VMError| located(e, line, column);
        match section {
            Section::Data => {
                let (name, bytes) = parse_data(rest).map_err(at)?;
                labels.define(&name, address).map_err(at)?;
                let size = bytes.len() as u32;
                place(Item::Data(bytes), size, &mut address);
            }
            Section::Code | Section::Stack => {
                let name = rest[0].text.clone();
                let (mnemonic, condition) = lookup_mnemonic(&name)
                    .filter(|_| !rest[0].quoted)
                    .ok_or_else(|| at(VMError::InvalidInstructionName { name: name.clone() }))?;
                let operands = rest[1..].to_vec();
                let words = match mnemonic {
                    Mnemonic::Native(_) => 1,
                    Mnemonic::LoadWordI => load_word_size(&operands).map_err(at)?,
                };
                place(
                    Item::Instruction {
                        mnemonic,
                        condition,
                        name,
                        operands,
                    },
                    words * 4,
                    &mut address,
                );
            }
        }
    }

    Ok(Layout {
        items,
        labels,
        stack_size,
        size: address - origin,
    })
}

// ==================== Pass 2: encoding ====================

/// Resolves a label in an immediate slot of `instr` placed at `address`.
fn label_immediate(
    instr: Instruction,
    kind: OperandKind,
    label: &str,
    target: u32,
    address: u32,
) -> Result<u32, VMError> {
    let next = address + 4;
    let unreachable = || VMError::UnreachableLabel {
        label: label.to_string(),
        instruction: instr.mnemonic().to_string(),
    };
    let value = match (instr, kind) {
        (Instruction::Jfw, _) => target.checked_sub(next).ok_or_else(unreachable)? / 4,
        (Instruction::Jbw, _) => next.checked_sub(target).ok_or_else(unreachable)? / 4,
        (_, OperandKind::Off22) => target / 4,
        _ => target,
    };
    if value > kind.immediate_mask() {
        return Err(VMError::ImmediateOutOfRange {
            token: format!("{REFERENCE_PREFIX}{label}"),
            bits: kind.immediate_mask().count_ones(),
        });
    }
    Ok(value)
}

/// Converts one operand token into an encoder argument.
fn operand_arg(
    instr: Instruction,
    kind: OperandKind,
    tok: &Token,
    address: u32,
    labels: &LabelTable,
) -> Result<Arg, VMError> {
    if tok.quoted {
        return Err(VMError::InvalidLiteral {
            token: tok.text.clone(),
        });
    }
    if kind.is_register() {
        return Ok(Arg::Operand(if tok.text == "0" {
            Operand::ConstantZero
        } else {
            Operand::Register(parse_register(&tok.text)?)
        }));
    }
    if let Some(label) = tok.text.strip_prefix(REFERENCE_PREFIX) {
        let target = labels.resolve(label)?;
        return label_immediate(instr, kind, label, target, address).map(Arg::Immediate);
    }
    parse_field(&tok.text, kind.immediate_mask().count_ones()).map(Arg::Immediate)
}

/// Encodes one instruction statement into its words.
fn encode_statement(
    mnemonic: Mnemonic,
    condition: Condition,
    name: &str,
    operands: &[Token],
    address: u32,
    labels: &LabelTable,
) -> Result<Vec<u32>, VMError> {
    match mnemonic {
        Mnemonic::Native(instr) => {
            let kinds = instr.operands();
            if operands.len() != kinds.len() {
                return Err(VMError::ArityMismatch {
                    instruction: name.to_ascii_uppercase(),
                    expected: kinds.len(),
                    actual: operands.len(),
                });
            }
            let args = kinds
                .iter()
                .zip(operands)
                .map(|(&kind, tok)| operand_arg(instr, kind, tok, address, labels))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(vec![instr.encode(condition, &args)?])
        }
        Mnemonic::LoadWordI => {
            let [rd, value] = operands else {
                return Err(VMError::ArityMismatch {
                    instruction: name.to_ascii_uppercase(),
                    expected: 2,
                    actual: operands.len(),
                });
            };
            let rd = operand_arg(Instruction::LoadHwordI, OperandKind::Dst, rd, address, labels)?;
            let (bits, is_label) = match value.text.strip_prefix(REFERENCE_PREFIX) {
                Some(label) if !value.quoted => (labels.resolve(label)?, true),
                _ => (parse_literal(&value.text)?.bits(), false),
            };
            if !is_label && bits <= 0xFFFF {
                return Ok(vec![
                    Instruction::LoadHwordI.encode(condition, &[rd, Arg::Immediate(bits)])?,
                ]);
            }
            Ok(vec![
                Instruction::LoadWordILo.encode(condition, &[rd, Arg::Immediate(bits & 0xFFFF)])?,
                Instruction::LoadWordIHi.encode(condition, &[rd, Arg::Immediate(bits >> 16)])?,
            ])
        }
    }
}

fn jump_word(target: u32) -> Result<u32, VMError> {
    Instruction::Jmp.encode(Condition::Always, &[Arg::Immediate(target / 4)])
}

/// Pass 2: emits bytes for a laid-out program.
fn emit(layout: Layout, origin: u32) -> Result<Program, VMError> {
    let mut bytes: Vec<u8> = Vec::with_capacity(layout.size as usize);
    let mut heads: Vec<usize> = Vec::new();

    fn patch(bytes: &mut [u8], heads: &mut Vec<usize>, target: u32) -> Result<(), VMError> {
        let word = jump_word(target)?.to_le_bytes();
        for at in heads.drain(..) {
            bytes[at..at + 4].copy_from_slice(&word);
        }
        Ok(())
    }

    for placed in &layout.items {
        let at = |e: VMError| located(e, placed.line, placed.column);
        match &placed.item {
            Item::DataHead => {
                heads.push(bytes.len());
                bytes.extend_from_slice(&[0; 4]);
            }
            Item::CodeStart => patch(&mut bytes, &mut heads, placed.address).map_err(at)?,
            Item::Data(data) => bytes.extend_from_slice(data),
            Item::Instruction {
                mnemonic,
                condition,
                name,
                operands,
            } => {
                let words = encode_statement(
                    *mnemonic,
                    *condition,
                    name,
                    operands,
                    placed.address,
                    &layout.labels,
                )
                .map_err(at)?;
                for word in words {
                    bytes.extend_from_slice(&word.to_le_bytes());
                }
            }
        }
    }
    let end = origin + bytes.len() as u32;
    patch(&mut bytes, &mut heads, end)?;

    Ok(Program {
        origin,
        entry: origin,
        stack_size: layout.stack_size,
        bytes,
        labels: layout
            .labels
            .labels
            .into_iter()
            .collect(),
    })
}

/// Returns the image size in bytes `source` assembles to, running pass 1 only.
pub fn measure(source: &str) -> Result<u32, VMError> {
    Ok(layout(tokenize(source)?, IVT_END)?.size)
}

/// Assembles `source` for placement at byte address `origin`.
pub fn assemble_at(source: &str, origin: u32) -> Result<Program, VMError> {
    if origin % 4 != 0 {
        return Err(VMError::InvalidConfig(format!(
            "program origin {origin:#x} is not word-aligned"
        )));
    }
    let layout = layout(tokenize(source)?, origin)?;
    emit(layout, origin)
}

/// Assemble a full source string into a program placed right after the vector table.
///
/// Uses two-pass assembly:
/// 1. First pass: tokenize statements, size every construct, record label addresses
/// 2. Second pass: encode instructions with label resolution and patch data-section jumps
pub fn assemble_source(source: &str) -> Result<Program, VMError> {
    assemble_source_with_name(source, "<source>")
}

/// Assembles source with an associated filename for error diagnostics.
///
/// Logs a compiler-style diagnostic to stderr on failure, including source
/// location information.
fn assemble_source_with_name(source: &str, source_name: &str) -> Result<Program, VMError> {
    let result = assemble_at(source, IVT_END);
    if let Err(err) = &result {
        log_assembly_error(source_name, source, err);
    }
    result
}

/// Convenience: assemble directly from file path
pub fn assemble_file<P: AsRef<Path>>(path: P) -> Result<Program, VMError> {
    let path_ref = path.as_ref();
    let source = fs::read_to_string(path_ref).map_err(|e| VMError::IoError {
        path: path_ref.display().to_string(),
        reason: e.to_string(),
    })?;
    assemble_source_with_name(&source, &path_ref.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_machine::isa::decode;
    use std::io::Write as _;

    fn words(source: &str) -> Vec<u32> {
        assemble_source(source).unwrap().words().collect()
    }

    fn listing(source: &str) -> Vec<String> {
        words(source)
            .into_iter()
            .map(|w| decode(w).unwrap().to_string())
            .collect()
    }

    fn asm_err(source: &str) -> String {
        match assemble_source(source).unwrap_err() {
            VMError::AssemblyError { reason, .. } => reason,
            other => other.to_string(),
        }
    }

    // ==================== Tokenizer ====================

    #[test]
    fn assemble_empty_source() {
        let program = assemble_source("").unwrap();
        assert!(program.is_empty());
        assert_eq!(program.origin, IVT_END);
    }

    #[test]
    fn assemble_comments_and_blank_lines() {
        let source = format!(
            r#"
            {COMMENT_CHAR} this is a comment; with a semicolon

            {COMMENT_CHAR} another comment
        "#
        );
        assert!(assemble_source(&source).unwrap().is_empty());
    }

    #[test]
    fn statements_split_on_semicolons_not_lines() {
        assert_eq!(listing("inc r1; dec r2;\nhalt;"), vec!["INC r1", "DEC r2", "HALT"]);
        assert_eq!(listing("add r1,\n r2,\n r3;"), vec!["ADD r1, r2, r3"]);
    }

    #[test]
    fn missing_semicolon_is_parse_error() {
        assert!(matches!(
            assemble_source("halt"),
            Err(VMError::ParseError { line: 1, column: 1, .. })
        ));
    }

    #[test]
    fn unterminated_string_is_parse_error() {
        assert!(matches!(
            assemble_source(".data;\nstring s \"abc;"),
            Err(VMError::ParseError { line: 2, column: 10, .. })
        ));
    }

    #[test]
    fn invalid_escape_is_reported() {
        assert!(asm_err(".data; string s \"a\\qb\";").contains("invalid escape"));
    }

    // ==================== Literals ====================

    #[test]
    fn parse_literal_forms() {
        assert_eq!(parse_literal("42").unwrap(), Literal::Int(42));
        assert_eq!(parse_literal("-7").unwrap(), Literal::Int(-7));
        assert_eq!(parse_literal("1Fh").unwrap(), Literal::Int(0x1F));
        assert_eq!(parse_literal("101b").unwrap(), Literal::Int(5));
        assert_eq!(parse_literal("0b").unwrap(), Literal::Int(0));
        assert_eq!(parse_literal("0B12h").unwrap(), Literal::Int(0xB12));
        assert_eq!(parse_literal("3.25").unwrap(), Literal::Float(3.25));
        assert_eq!(parse_literal("FFFFFFFFh").unwrap(), Literal::Int(0xFFFF_FFFF));
    }

    #[test]
    fn parse_literal_rejects_prefixes() {
        assert!(matches!(
            parse_literal("0x10"),
            Err(VMError::PrefixedLiteral { .. })
        ));
        assert!(matches!(
            parse_literal("0b101"),
            Err(VMError::PrefixedLiteral { .. })
        ));
    }

    #[test]
    fn parse_literal_rejects_garbage_and_overflow() {
        assert!(matches!(
            parse_literal("12z"),
            Err(VMError::InvalidLiteral { .. })
        ));
        assert!(matches!(
            parse_literal("100000000h"),
            Err(VMError::ImmediateOutOfRange { bits: 32, .. })
        ));
    }

    #[test]
    fn field_ranges() {
        assert_eq!(parse_field("255", 8).unwrap(), 255);
        assert_eq!(parse_field("-1", 8).unwrap(), 0xFF);
        assert!(parse_field("256", 8).is_err());
        assert!(parse_field("-129", 8).is_err());
        assert!(parse_field("1.5", 16).is_err());
    }

    // ==================== Instructions ====================

    #[test]
    fn decode_recovers_source_lines() {
        let lines = [
            "ADD r1, r2, r3",
            "SUBINTLS r1, r1, r7",
            "MOV r4, 0",
            "LOADBYTEI r2, FFh",
            "JGT 40h",
            "CALL r1, 3h",
            "MEMCPY 0, r2, r3, r4, r5",
            "INT 9h",
            "STOREHWORDI r3, 1234h",
            "PUSHWORDI 10h",
            "CMPFF r1, 0",
            "LOADWORDIMEMZ r6, 3Fh",
            "RETURN",
        ];
        let source: String = lines.iter().map(|l| format!("{l};\n")).collect();
        assert_eq!(listing(&source), lines);
    }

    #[test]
    fn mnemonics_and_registers_are_case_insensitive() {
        assert_eq!(words("AddInt R1, r2, R3;"), words("addint r1, R2, r3;"));
    }

    #[test]
    fn invalid_instruction_has_location() {
        let err = assemble_source("halt;\n  bogus r1;").unwrap_err();
        assert!(matches!(
            err,
            VMError::AssemblyError { line: 2, column: 3, ref reason } if reason.contains("invalid instruction name")
        ));
    }

    #[test]
    fn wrong_arity() {
        assert!(asm_err("add r1, r2;").contains("expects 3 operands but got 2"));
    }

    #[test]
    fn zero_destination_rejected() {
        assert!(asm_err("mov 0, r1;").contains("constant zero"));
        assert!(asm_err("push 0;").contains("does not accept 0"));
    }

    #[test]
    fn register_out_of_range() {
        assert!(asm_err("inc r9;").contains("invalid register"));
        assert!(asm_err("inc 5;").contains("expected register"));
    }

    #[test]
    fn immediate_out_of_range() {
        assert!(asm_err("loadbytei r1, 300;").contains("does not fit in 8 bits"));
    }

    // ==================== LOADWORDI ====================

    #[test]
    fn loadwordi_small_value_is_one_word() {
        assert_eq!(listing("loadwordi r1, 4h;"), vec!["LOADHWORDI r1, 4h"]);
        assert_eq!(listing("loadwordi r1, FFFFh;").len(), 1);
    }

    #[test]
    fn loadwordi_large_values_split() {
        assert_eq!(
            listing("loadwordi r2, -1;"),
            vec!["LOADWORDILO r2, FFFFh", "LOADWORDIHI r2, FFFFh"]
        );
        assert_eq!(
            listing("loadwordi r2, 7FFFFFFFh;"),
            vec!["LOADWORDILO r2, FFFFh", "LOADWORDIHI r2, 7FFFh"]
        );
        // 3.25 = 0x40500000
        assert_eq!(
            listing("loadwordi r2, 3.25;"),
            vec!["LOADWORDILO r2, 0h", "LOADWORDIHI r2, 4050h"]
        );
    }

    #[test]
    fn loadwordi_label_is_always_two_words() {
        let p = assemble_source(":here; loadwordinz r3, @here;").unwrap();
        let listing: Vec<String> = p.words().map(|w| decode(w).unwrap().to_string()).collect();
        assert_eq!(
            listing,
            vec!["LOADWORDILONZ r3, 60h", "LOADWORDIHINZ r3, 0h"]
        );
    }

    // ==================== Labels ====================

    #[test]
    fn forward_and_backward_references_agree() {
        let p = assemble_source("jmp @mid;\n:mid;\njmp @mid;").unwrap();
        let w: Vec<u32> = p.words().collect();
        assert_eq!(w[0], w[1]);
        assert_eq!(decode(w[0]).unwrap().imm(), (IVT_END + 4) / 4);
        assert_eq!(p.label("MID"), Some(IVT_END + 4));
    }

    #[test]
    fn duplicate_label_at_other_address_fails() {
        assert!(asm_err(":a; halt; :a;").contains("redefined"));
    }

    #[test]
    fn duplicate_label_at_same_address_is_tolerated() {
        assert!(assemble_source(":a; :A; halt;").is_ok());
    }

    #[test]
    fn undefined_label_error() {
        assert!(asm_err("jmp @nowhere;").contains("undefined label"));
    }

    #[test]
    fn relative_jumps_use_word_distance() {
        // jfw at 96 (next = 100) to 108 -> 2 words; jbw at 108 (next = 112) to 96 -> 4 words
        let source = ":top; jfw @end; halt; halt; :end; jbw @top;";
        assert_eq!(listing(source), vec!["JFW 2h", "HALT", "HALT", "JBW 4h"]);
    }

    #[test]
    fn relative_jump_in_wrong_direction_fails() {
        assert!(asm_err(":top; jfw @top;").contains("cannot be reached"));
        assert!(asm_err("jbw @end; halt; :end;").contains("cannot be reached"));
    }

    #[test]
    fn imm16_label_is_byte_address() {
        assert_eq!(listing(":x; storehwordi r1, @x;"), vec!["STOREHWORDI r1, 60h"]);
    }

    // ==================== Data ====================

    #[test]
    fn data_section_gets_head_jump() {
        let p = assemble_source(".data; int n 7; .code; halt;").unwrap();
        let w: Vec<u32> = p.words().collect();
        // head jump, int, halt
        assert_eq!(w.len(), 3);
        assert_eq!(decode(w[0]).unwrap().to_string(), format!("JMP {:X}h", (IVT_END + 8) / 4));
        assert_eq!(w[1], 7);
        assert_eq!(p.label("n"), Some(IVT_END + 4));
    }

    #[test]
    fn trailing_data_jumps_to_end() {
        let p = assemble_source("halt; .data; bytes b 1 2 3;").unwrap();
        let w: Vec<u32> = p.words().collect();
        assert_eq!(w.len(), 3);
        assert_eq!(decode(w[1]).unwrap().imm(), p.end() / 4);
        assert_eq!(w[2], 0x0003_0201);
    }

    #[test]
    fn string_is_nul_terminated_and_padded() {
        let p = assemble_source(".data; string s \"abcd\\n\";").unwrap();
        assert_eq!(&p.bytes[4..], b"abcd\n\0\0\0");
        let p = assemble_source(".data; string s \"abc\";").unwrap();
        assert_eq!(&p.bytes[4..], b"abc\0");
    }

    #[test]
    fn string_may_span_lines_and_hold_semicolons() {
        let p = assemble_source(".data; string s \"a;\nb\";").unwrap();
        assert_eq!(&p.bytes[4..], b"a;\nb\0\0\0\0");
    }

    #[test]
    fn float_data_stores_bits() {
        let p = assemble_source(".data; float f 1.0; float g 2;").unwrap();
        let w: Vec<u32> = p.words().collect();
        assert_eq!(w[1], 0x3F80_0000);
        assert_eq!(w[2], 2.0f32.to_bits());
    }

    #[test]
    fn invalid_data_type() {
        assert!(asm_err(".data; word w 1;").contains("invalid data type"));
        assert!(asm_err(".data; int;").contains("needs a name"));
        assert!(asm_err(".data; bytes b 256;").contains("does not fit"));
    }

    // ==================== Sections ====================

    #[test]
    fn stack_section_forms() {
        assert_eq!(assemble_source(".stack 32; halt;").unwrap().stack_size, Some(32));
        assert_eq!(
            assemble_source(".stack;\n16;\n.code; halt;").unwrap().stack_size,
            Some(16)
        );
        assert_eq!(assemble_source("halt;").unwrap().stack_size, None);
        assert!(assemble_source(".stack 0;").is_err());
    }

    #[test]
    fn invalid_section() {
        assert!(asm_err(".text;").contains("invalid section"));
    }

    #[test]
    fn measure_matches_image_size() {
        let source = ".data; string s \"hello\"; .code; loadwordi r1, @s; loadwordi r2, 1; halt;";
        assert_eq!(measure(source).unwrap(), assemble_source(source).unwrap().len());
    }

    #[test]
    fn assemble_at_other_origin() {
        let p = assemble_at(":l; jmp @l;", 0x200).unwrap();
        assert_eq!(p.origin, 0x200);
        assert_eq!(decode(p.words().next().unwrap()).unwrap().imm(), 0x200 / 4);
        assert!(assemble_at("halt;", 0x201).is_err());
    }

    // ==================== Diagnostics and files ====================

    #[test]
    fn diagnostic_points_at_column() {
        let diag = render_assembly_diagnostic("prog.asm", "halt;\n  bogus;", 2, 3, "bad");
        assert!(diag.contains("error: bad"));
        assert!(diag.contains(" --> prog.asm:2:3"));
        assert!(diag.contains("   2 |   bogus;"));
        assert!(diag.contains("  |   ^"));
    }

    #[test]
    fn assemble_file_reads_source() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "loadwordi r1, 4h;\nhalt;\n").unwrap();
        let p = assemble_file(file.path()).unwrap();
        assert_eq!(p.len(), 8);
    }

    #[test]
    fn assemble_file_missing_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            assemble_file(dir.path().join("missing.asm")),
            Err(VMError::IoError { .. })
        ));
    }
}
