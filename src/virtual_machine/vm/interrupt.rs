//! Interrupt conditions and the vector table layout.
//!
//! The first [`IVT_END`] bytes of main memory hold [`VECTOR_COUNT`] word
//! entries. Entry `n` stores a word offset (the handler's byte address divided
//! by four). A zero entry means no handler is installed.

use std::fmt;

/// Number of entries in the interrupt vector table.
pub const VECTOR_COUNT: u32 = 24;

/// First byte past the vector table. Programs are placed at or after this address.
pub const IVT_END: u32 = VECTOR_COUNT * 4;

/// Named interrupt conditions and their vector indices.
///
/// Indices `0..=5` are faults: raising one without a handler stops the VM.
/// The rest are signals, which are dropped when their vector is empty.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Interrupt {
    DivideByZero = 0,
    IllegalOpcode = 1,
    OutOfMemory = 2,
    StackOverflow = 3,
    MathError = 4,
    SegmentationFault = 5,
    KeyPress = 6,
    PeripheralInput = 7,
    PeripheralOutput = 8,
    Generic = 9,
    Serial0 = 10,
    Serial1 = 11,
    Raster = 16,
}

impl Interrupt {
    /// Faults that get a default handler.
    pub const FAULTS: [Interrupt; 6] = [
        Interrupt::DivideByZero,
        Interrupt::IllegalOpcode,
        Interrupt::OutOfMemory,
        Interrupt::StackOverflow,
        Interrupt::MathError,
        Interrupt::SegmentationFault,
    ];

    /// Returns the named condition stored at vector `index`, if any.
    pub const fn from_index(index: u32) -> Option<Self> {
        Some(match index {
            0 => Interrupt::DivideByZero,
            1 => Interrupt::IllegalOpcode,
            2 => Interrupt::OutOfMemory,
            3 => Interrupt::StackOverflow,
            4 => Interrupt::MathError,
            5 => Interrupt::SegmentationFault,
            6 => Interrupt::KeyPress,
            7 => Interrupt::PeripheralInput,
            8 => Interrupt::PeripheralOutput,
            9 => Interrupt::Generic,
            10 => Interrupt::Serial0,
            11 => Interrupt::Serial1,
            16 => Interrupt::Raster,
            _ => return None,
        })
    }

    /// Vector table index.
    pub const fn index(self) -> u32 {
        self as u32
    }

    /// Byte address of this condition's vector entry.
    pub const fn vector_address(self) -> u32 {
        self.index() * 4
    }

    /// Returns true for conditions that are fatal when unhandled.
    pub const fn is_fault(self) -> bool {
        is_fault_index(self.index())
    }

    /// Text printed by the default handler.
    pub const fn message(self) -> &'static str {
        match self {
            Interrupt::DivideByZero => "?DIVISION BY ZERO ERROR",
            Interrupt::IllegalOpcode => "?ILLEGAL OPCODE ERROR",
            Interrupt::OutOfMemory => "?OUT OF MEMORY ERROR",
            Interrupt::StackOverflow => "?STACK OVERFLOW ERROR",
            Interrupt::MathError => "?MATH ERROR",
            Interrupt::SegmentationFault => "?SEGMENTATION FAULT",
            _ => "?INTERRUPT",
        }
    }
}

/// Returns true if vector `index` belongs to a fault.
pub const fn is_fault_index(index: u32) -> bool {
    index <= 5
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Interrupt::DivideByZero => "division by zero",
            Interrupt::IllegalOpcode => "illegal opcode",
            Interrupt::OutOfMemory => "out of memory",
            Interrupt::StackOverflow => "stack overflow",
            Interrupt::MathError => "math error",
            Interrupt::SegmentationFault => "segmentation fault",
            Interrupt::KeyPress => "key press",
            Interrupt::PeripheralInput => "peripheral input",
            Interrupt::PeripheralOutput => "peripheral output",
            Interrupt::Generic => "interrupt",
            Interrupt::Serial0 => "serial 0",
            Interrupt::Serial1 => "serial 1",
            Interrupt::Raster => "raster",
        };
        write!(f, "{name} (vector {})", self.index())
    }
}

/// Label of the default handler entry for `interrupt`.
pub(crate) fn handler_label(interrupt: Interrupt) -> String {
    format!("__fault_{}", interrupt.index())
}

/// Assembly source of the default fault handlers.
///
/// Each handler prints its message and halts. The print loop is inlined so a
/// handler entered on a full call stack needs no further stack slots.
pub(crate) fn default_handler_source() -> String {
    let mut src = String::from(".data;\n");
    for fault in Interrupt::FAULTS {
        src.push_str(&format!(
            "string __msg_{} \"{}\\n\";\n",
            fault.index(),
            fault.message()
        ));
    }

    src.push_str(".code;\n");
    for fault in Interrupt::FAULTS {
        let n = fault.index();
        src.push_str(&format!(
            ":{label};\n\
             loadwordi r1, @__msg_{n};\n\
             :__print_{n};\n\
             loadbyte r2, r1, 0;\n\
             cmp r2, 0;\n\
             jz @__done_{n};\n\
             putchar r2;\n\
             inc r1;\n\
             jmp @__print_{n};\n\
             :__done_{n};\n\
             halt;\n",
            label = handler_label(fault)
        ));
    }
    src
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_round_trip_and_gaps_are_empty() {
        for index in 0..VECTOR_COUNT {
            if let Some(irq) = Interrupt::from_index(index) {
                assert_eq!(irq.index(), index);
            }
        }
        assert!(Interrupt::from_index(12).is_none());
        assert_eq!(Interrupt::from_index(16), Some(Interrupt::Raster));
        assert!(Interrupt::from_index(VECTOR_COUNT).is_none());
    }

    #[test]
    fn faults_are_the_first_six_vectors() {
        assert!(Interrupt::FAULTS.iter().all(|f| f.is_fault()));
        assert!(!Interrupt::KeyPress.is_fault());
        assert!(!Interrupt::Raster.is_fault());
        assert_eq!(IVT_END, 96);
        assert_eq!(Interrupt::SegmentationFault.vector_address(), 20);
    }

    #[test]
    fn default_source_has_one_entry_per_fault() {
        let src = default_handler_source();
        for fault in Interrupt::FAULTS {
            assert!(src.contains(&format!(":{};", handler_label(fault))));
        }
        assert!(src.contains("DIVISION BY ZERO"));
    }
}
