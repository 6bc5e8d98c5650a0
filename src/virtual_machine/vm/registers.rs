use crate::virtual_machine::operand::{REGISTER_COUNT, Reg};

/// Register file of one context.
///
/// Each register holds 32 raw bits that instructions read either as a signed
/// integer or as an IEEE-754 single-precision float. Writing one view changes
/// the other.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Registers {
    regs: [u32; REGISTER_COUNT],
}

impl Registers {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline(always)]
    pub fn bits(&self, r: Reg) -> u32 {
        self.regs[r.index()]
    }

    #[inline(always)]
    pub fn set_bits(&mut self, r: Reg, v: u32) {
        self.regs[r.index()] = v;
    }

    #[inline(always)]
    pub fn int(&self, r: Reg) -> i32 {
        self.bits(r) as i32
    }

    #[inline(always)]
    pub fn set_int(&mut self, r: Reg, v: i32) {
        self.set_bits(r, v as u32);
    }

    #[inline(always)]
    pub fn float(&self, r: Reg) -> f32 {
        f32::from_bits(self.bits(r))
    }

    #[inline(always)]
    pub fn set_float(&mut self, r: Reg, v: f32) {
        self.set_bits(r, v.to_bits());
    }

    /// Raw contents of `r1..=r8`.
    pub fn as_array(&self) -> &[u32; REGISTER_COUNT] {
        &self.regs
    }
}
