//! Core virtual machine implementation.
//!
//! The VM fetches one little-endian word at a time from flat main memory,
//! decodes it through the [`isa`](crate::virtual_machine::isa) table and
//! dispatches it to an `op_*` handler. Handlers that hit a recoverable
//! condition return [`VMError::Fault`], which the loop turns into a jump
//! through the interrupt vector table. Every other error stops the VM.

pub mod allocator;
pub mod config;
pub mod context;
pub mod control;
pub mod interrupt;
pub mod io;
pub mod memory;
pub mod peripheral;
pub mod registers;
pub mod rng;


pub use config::VmConfig;
pub use context::{ContextId, MAIN_CONTEXT, MAX_CONTEXTS};
pub use control::VmHandle;
pub use interrupt::{IVT_END, Interrupt, VECTOR_COUNT};
pub use io::{Console, SharedOutput};
pub use memory::{Memory, Pointer, PointerType};
pub use peripheral::{BIOS_SLOT, CallLog, MAIN_MEMORY_DEVICE, MemoryDevice, Peripheral};
pub use registers::Registers;
pub use rng::KnuthLcg;

use crate::virtual_machine::assembler;
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::isa::{Decoded, Instruction, decode};
use crate::virtual_machine::operand::{Operand, Reg};
use crate::virtual_machine::program::Program;
use crate::{debug, error, info, warn};
use allocator::{Allocator, word_align};
use context::{Context, ContextTable};
use control::Checkpoint;
use peripheral::PeripheralTable;
use rand_core::RngCore;
use std::cmp::Ordering;
use std::fmt;
use std::thread::{self, JoinHandle};
use std::time::Instant;

macro_rules! exec_vm {
    // Entry point
    (
        vm = $vm:ident,
        decoded = $d:ident,
        { $( $variant:ident => $handler:ident ( $( $field:ident : $kind:ident $([$slot:literal])? ),* $(,)? ) ),* $(,)? }
    ) => {{
        match $d.instruction {
            $(
                Instruction::$variant => {
                    let instr_name = $d.instruction.mnemonic();
                    $( let $field = exec_vm!(@read $d, $kind $([$slot])?); )*
                    $vm.$handler(instr_name, $( $field ),*)
                }
            ),*
        }
    }};

    // Written register
    (@read $d:ident, Dst[$slot:literal]) => {
        $d.reg($slot)
    };

    // Read-only register without a zero encoding
    (@read $d:ident, Reg[$slot:literal]) => {
        $d.reg($slot)
    };

    // Register or constant zero
    (@read $d:ident, Src[$slot:literal]) => {
        $d.operand($slot)
    };

    // Immediate field, already masked to its width
    (@read $d:ident, Imm) => {
        $d.imm()
    };
}

/// Result of a single [`Vm::step`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    Running,
    Halted,
    Terminated,
}

/// Why [`Vm::run`] returned.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitReason {
    /// A `HALT` instruction (or the zero guard word after a program) executed.
    Halted,
    /// The host called [`VmHandle::terminate`].
    Terminated,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Halted => f.write_str("halted"),
            ExitReason::Terminated => f.write_str("terminated by host"),
        }
    }
}

/// Remainder rounded toward negative infinity; `y` must be non-zero.
fn floor_mod(x: i32, y: i32) -> i32 {
    let r = x.wrapping_rem(y);
    if r != 0 && (r < 0) != (y < 0) { r + y } else { r }
}

/// Register-based virtual machine.
///
/// Owns main memory and its allocator, every execution context, the attached
/// peripherals and the console streams. Host threads steer a running VM
/// through the [`VmHandle`] returned by [`Vm::handle`].
pub struct Vm {
    config: VmConfig,
    memory: Memory,
    allocator: Allocator,
    contexts: ContextTable,
    peripherals: PeripheralTable,
    console: Console,
    rng: KnuthLcg,
    handle: VmHandle,
    started: Instant,
    halted: bool,
}

impl Vm {
    /// Creates a VM wired to the process's standard streams.
    ///
    /// Unless disabled in `config`, the built-in fault handlers are assembled
    /// into the top of memory and their vectors installed.
    pub fn new(config: VmConfig) -> Result<Self, VMError> {
        config.validate()?;
        let memory = Memory::new(config.memory_size)?;
        let allocator = Allocator::new(IVT_END, memory.len());
        let mut vm = Self {
            contexts: ContextTable::new(config.stack_size as usize),
            rng: KnuthLcg::new(config.rng_seed),
            config,
            memory,
            allocator,
            peripherals: PeripheralTable::new(),
            console: Console::stdio(),
            handle: VmHandle::new(),
            started: Instant::now(),
            halted: false,
        };

        if vm.config.default_handlers {
            if let Err(e) = vm.install_default_handlers() {
                warn!("default fault handlers not installed: {e}");
            }
        }
        Ok(vm)
    }

    /// Replaces the streams behind `GETCHAR` and `PUTCHAR`.
    pub fn set_console(&mut self, console: Console) {
        self.console = console;
    }

    /// Handle for pausing, resuming, terminating or interrupting this VM.
    pub fn handle(&self) -> VmHandle {
        self.handle.clone()
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    /// The running context.
    pub fn context(&self) -> &Context {
        self.contexts.active()
    }

    pub fn context_mut(&mut self) -> &mut Context {
        self.contexts.active_mut()
    }

    pub fn context_by_id(&self, id: ContextId) -> Option<&Context> {
        self.contexts.get(id)
    }

    pub fn active_context(&self) -> ContextId {
        self.contexts.active_id()
    }

    /// Registers of the running context.
    pub fn registers(&self) -> &Registers {
        &self.contexts.active().registers
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Milliseconds since the VM was created.
    pub fn uptime_ms(&self) -> u32 {
        self.started.elapsed().as_millis() as u32
    }

    // ==================== Loading ====================

    /// Assembles `source` into the first free region of memory and loads it
    /// into the running context.
    pub fn load_source(&mut self, source: &str) -> Result<Program, VMError> {
        let size = assembler::measure(source)?;
        let origin = self.allocator.fit(size + 4)?;
        let program = assembler::assemble_at(source, origin)?;
        self.load_program(&program)?;
        Ok(program)
    }

    /// Loads `program` into the running context.
    pub fn load_program(&mut self, program: &Program) -> Result<(), VMError> {
        self.load_into_context(self.contexts.active_id(), program)
    }

    /// Copies `program` into memory and resets context `id` to run it.
    ///
    /// The image and the zero guard word after it are claimed from the
    /// allocator, so the region must be free.
    pub fn load_into_context(&mut self, id: ContextId, program: &Program) -> Result<(), VMError> {
        self.contexts.ensure(id)?;
        self.place(program)?;

        let capacity = program.stack_size.unwrap_or(self.config.stack_size) as usize;
        let ctx = self.contexts.ensure(id)?;
        *ctx = Context::new(capacity);
        ctx.pc = program.entry;
        ctx.st = program.origin;
        self.halted = false;

        info!(
            "loaded {} bytes at {:#x} into context {id} (entry {:#x}, stack {capacity})",
            program.len(),
            program.origin,
            program.entry
        );
        Ok(())
    }

    /// Claims the image range plus guard word and copies the image in.
    fn place(&mut self, program: &Program) -> Result<(), VMError> {
        let end = program
            .end()
            .checked_add(4)
            .ok_or(VMError::OutOfMemory {
                requested: program.len(),
            })?;
        self.allocator.claim(program.origin..end)?;
        self.memory.write(program.origin, &program.bytes)?;
        self.memory.write_word(program.end(), 0)
    }

    fn install_default_handlers(&mut self) -> Result<(), VMError> {
        let source = interrupt::default_handler_source();
        let size = assembler::measure(&source)? + 4;
        let origin = self
            .memory
            .len()
            .checked_sub(size)
            .filter(|&origin| origin >= IVT_END)
            .ok_or(VMError::OutOfMemory { requested: size })?;

        let program = assembler::assemble_at(&source, origin)?;
        self.place(&program)?;
        for fault in Interrupt::FAULTS {
            let label = interrupt::handler_label(fault);
            let address = program
                .label(&label)
                .ok_or(VMError::UndefinedLabel { label })?;
            self.set_vector(fault, address / 4)?;
        }
        debug!("default fault handlers installed at {origin:#x}");
        Ok(())
    }

    // ==================== Host control ====================

    /// Makes `id` the running context, creating it zeroed if it is new.
    pub fn switch_context(&mut self, id: ContextId) -> Result<(), VMError> {
        if self.contexts.switch(id)? {
            debug!("created context {id}");
        }
        Ok(())
    }

    /// Word offset stored in the vector of `interrupt` (zero if no handler).
    pub fn vector(&self, interrupt: Interrupt) -> Result<u32, VMError> {
        self.memory.read_word(interrupt.vector_address())
    }

    /// Installs a handler; `handler` is a word offset (byte address / 4).
    pub fn set_vector(&mut self, interrupt: Interrupt, handler: u32) -> Result<(), VMError> {
        self.memory.write_word(interrupt.vector_address(), handler)
    }

    /// Attaches a peripheral to `slot` (0..=254), returning the one it replaced.
    ///
    /// A device in slot 0 is reachable only through `CALL`; device operand 0
    /// of load, store and copy instructions always means main memory.
    pub fn attach_peripheral(
        &mut self,
        slot: u32,
        device: Box<dyn Peripheral>,
    ) -> Result<Option<Box<dyn Peripheral>>, VMError> {
        self.peripherals.attach(slot, device)
    }

    pub fn attach_bios(
        &mut self,
        device: Box<dyn Peripheral>,
    ) -> Result<Option<Box<dyn Peripheral>>, VMError> {
        self.peripherals.attach(BIOS_SLOT, device)
    }

    pub fn detach_peripheral(&mut self, slot: u32) -> Option<Box<dyn Peripheral>> {
        self.peripherals.detach(slot)
    }

    // ==================== Execution loop ====================

    /// Runs until the VM halts or is terminated.
    pub fn run(&mut self) -> Result<ExitReason, VMError> {
        let reason = loop {
            match self.step()? {
                Status::Running => continue,
                Status::Halted => break ExitReason::Halted,
                Status::Terminated => break ExitReason::Terminated,
            }
        };
        self.console.flush().map_err(|e| self.fatal(e))?;
        Ok(reason)
    }

    /// Moves the VM onto a worker thread and runs it there.
    ///
    /// The thread hands the VM back together with the run result.
    pub fn spawn(mut self) -> JoinHandle<(Vm, Result<ExitReason, VMError>)> {
        thread::spawn(move || {
            let result = self.run();
            (self, result)
        })
    }

    /// Executes a single instruction, delivering pending host requests first.
    pub fn step(&mut self) -> Result<Status, VMError> {
        if self.halted {
            return Ok(Status::Halted);
        }

        if self.handle.needs_attention() {
            match self.handle.checkpoint() {
                Checkpoint::Terminate => return Ok(Status::Terminated),
                Checkpoint::Continue(pending) => {
                    for interrupt in pending {
                        self.raise(interrupt).map_err(|e| self.fatal(e))?;
                    }
                }
            }
        }

        match self.fetch().and_then(|d| self.execute(d)) {
            Ok(()) => {}
            Err(VMError::Fault(interrupt)) => self.raise(interrupt).map_err(|e| self.fatal(e))?,
            Err(e) => return Err(self.fatal(e)),
        }

        Ok(if self.halted {
            Status::Halted
        } else {
            Status::Running
        })
    }

    /// Reads and decodes the word at pc, then advances pc past it.
    fn fetch(&mut self) -> Result<Decoded, VMError> {
        let pc = self.contexts.active().pc;
        if (pc as i32) < 0 {
            return Err(VMError::Fault(Interrupt::SegmentationFault));
        }
        if pc >= self.memory.len() {
            return Err(VMError::Fault(Interrupt::OutOfMemory));
        }
        if pc < IVT_END || pc % 4 != 0 {
            return Err(VMError::Fault(Interrupt::SegmentationFault));
        }

        let word = self.memory.read_word(pc)?;
        self.contexts.active_mut().pc = pc + 4;
        let decoded = decode(word).map_err(|_| VMError::Fault(Interrupt::IllegalOpcode))?;
        if self.config.trace {
            debug!("{pc:#08x}: {decoded}");
        }
        Ok(decoded)
    }

    /// Jumps to the handler of `interrupt`, pushing the return address.
    ///
    /// Faults without a handler and deliveries onto an exhausted call stack are
    /// fatal. Signals without a handler are dropped.
    fn raise(&mut self, interrupt: Interrupt) -> Result<(), VMError> {
        let vector = self.vector(interrupt)?;
        let ctx = self.contexts.active_mut();
        let pc = ctx.pc;

        if vector == 0 {
            if interrupt.is_fault() {
                return Err(VMError::UnhandledInterrupt { interrupt, pc });
            }
            debug!("dropped {interrupt}: no handler installed");
            return Ok(());
        }
        if !ctx.stack.push_reserved(pc) {
            return Err(VMError::DoubleFault { interrupt, pc });
        }
        ctx.pc = vector << 2;
        Ok(())
    }

    /// Logs a fatal error with the register dump and hands it back.
    fn fatal(&self, err: VMError) -> VMError {
        error!("{err}");
        error!("{}", self.register_dump());
        err
    }

    /// One-line dump of the running context.
    pub fn register_dump(&self) -> String {
        let ctx = self.contexts.active();
        let mut dump = format!(
            "context {} pc={:#010x} lr={:#010x} st={:#010x} sp={} flag={}",
            self.contexts.active_id(),
            ctx.pc,
            ctx.lr,
            ctx.st,
            ctx.sp(),
            ctx.flag
        );
        for (i, bits) in ctx.registers.as_array().iter().enumerate() {
            dump.push_str(&format!(" r{}={bits:08x}", i + 1));
        }
        dump
    }

    /// Executes one decoded instruction if its condition holds.
    fn execute(&mut self, d: Decoded) -> Result<(), VMError> {
        if !d.condition.holds(self.contexts.active().flag) {
            return Ok(());
        }

        exec_vm! {
            vm = self,
            decoded = d,
            {
                Halt => op_halt(),
                Add => op_add(rd: Dst[0], rs: Src[1], rm: Src[2]),
                Sub => op_sub(rd: Dst[0], rs: Src[1], rm: Src[2]),
                Mul => op_mul(rd: Dst[0], rs: Src[1], rm: Src[2]),
                Div => op_div(rd: Dst[0], rs: Src[1], rm: Src[2]),
                Pow => op_pow(rd: Dst[0], rs: Src[1], rm: Src[2]),
                Mod => op_mod(rd: Dst[0], rs: Src[1], rm: Src[2]),
                Shl => op_shl(rd: Dst[0], rs: Src[1], rm: Src[2]),
                Shr => op_shr(rd: Dst[0], rs: Src[1], rm: Src[2]),
                Ushr => op_ushr(rd: Dst[0], rs: Src[1], rm: Src[2]),
                And => op_and(rd: Dst[0], rs: Src[1], rm: Src[2]),
                Or => op_or(rd: Dst[0], rs: Src[1], rm: Src[2]),
                Xor => op_xor(rd: Dst[0], rs: Src[1], rm: Src[2]),
                AddInt => op_add_int(rd: Dst[0], rs: Src[1], rm: Src[2]),
                SubInt => op_sub_int(rd: Dst[0], rs: Src[1], rm: Src[2]),
                MulInt => op_mul_int(rd: Dst[0], rs: Src[1], rm: Src[2]),
                DivInt => op_div_int(rd: Dst[0], rs: Src[1], rm: Src[2]),
                ModInt => op_mod_int(rd: Dst[0], rs: Src[1], rm: Src[2]),

                Abs => op_abs(rd: Dst[0], rs: Src[1]),
                Sin => op_sin(rd: Dst[0], rs: Src[1]),
                Cos => op_cos(rd: Dst[0], rs: Src[1]),
                Tan => op_tan(rd: Dst[0], rs: Src[1]),
                Floor => op_floor(rd: Dst[0], rs: Src[1]),
                Ceil => op_ceil(rd: Dst[0], rs: Src[1]),
                Round => op_round(rd: Dst[0], rs: Src[1]),
                Log => op_log(rd: Dst[0], rs: Src[1]),
                Rndi => op_rndi(rd: Dst[0]),
                Rnd => op_rnd(rd: Dst[0]),
                Sgn => op_sgn(rd: Dst[0], rs: Src[1]),
                Sqrt => op_sqrt(rd: Dst[0], rs: Src[1]),
                Cbrt => op_cbrt(rd: Dst[0], rs: Src[1]),
                Inv => op_inv(rd: Dst[0], rs: Src[1]),
                Rad => op_rad(rd: Dst[0], rs: Src[1]),
                Not => op_not(rd: Dst[0], rs: Src[1]),

                Mov => op_mov(rd: Dst[0], rs: Src[1]),
                Xchg => op_xchg(ra: Dst[0], rb: Dst[1]),
                Inc => op_inc(rd: Dst[0]),
                Dec => op_dec(rd: Dst[0]),
                Malloc => op_malloc(rd: Dst[0], size: Src[1]),
                Ftoi => op_ftoi(rd: Dst[0], rs: Src[1]),
                Itof => op_itof(rd: Dst[0], rs: Src[1]),
                Calloc => op_calloc(rd: Dst[0], size: Src[1]),
                Free => op_free(addr: Src[0], size: Src[1]),
                Ctxsw => op_ctxsw(id: Src[0]),
                Yield => op_yield(),
                Getchar => op_getchar(rd: Dst[0]),
                Putchar => op_putchar(rs: Src[0]),
                Jsr => op_jsr(target: Src[0]),
                Return => op_return(),

                LoadByte => op_load_byte(rd: Dst[0], addr: Src[1], dev: Src[2]),
                StoreByte => op_store_byte(rs: Src[0], addr: Src[1], dev: Src[2]),
                LoadHword => op_load_hword(rd: Dst[0], addr: Src[1], dev: Src[2]),
                StoreHword => op_store_hword(rs: Src[0], addr: Src[1], dev: Src[2]),
                LoadWord => op_load_word(rd: Dst[0], addr: Src[1], dev: Src[2]),
                StoreWord => op_store_word(rs: Src[0], addr: Src[1], dev: Src[2]),
                Memcpy => op_memcpy(dst_dev: Src[0], src_dev: Src[1], len: Src[2], from: Reg[3], to: Reg[4]),

                Cmp => op_cmp(lhs: Src[0], rhs: Src[1]),
                CmpIf => op_cmp_if(lhs: Src[0], rhs: Src[1]),
                CmpFi => op_cmp_fi(lhs: Src[0], rhs: Src[1]),
                CmpFf => op_cmp_ff(lhs: Src[0], rhs: Src[1]),
                LoadByteI => op_load_imm(rd: Dst[0], imm: Imm),
                StoreByteI => op_store_byte_imm(addr: Reg[0], imm: Imm),
                LoadHwordI => op_load_imm(rd: Dst[0], imm: Imm),
                StoreHwordI => op_store_hword_imm(addr: Reg[0], imm: Imm),
                LoadWordILo => op_load_word_lo(rd: Dst[0], imm: Imm),
                LoadWordIHi => op_load_word_hi(rd: Dst[0], imm: Imm),

                LoadWordIMem => op_load_word_mem(rd: Dst[0], offset: Imm),
                StoreWordIMem => op_store_word_mem(rs: Reg[0], offset: Imm),
                Push => op_push(rs: Reg[0]),
                Pop => op_pop(rd: Dst[0]),
                PushWordI => op_push_word_imm(offset: Imm),
                PopWordI => op_pop_word_imm(),

                Jmp => op_jmp(offset: Imm),
                Jz => op_jz(offset: Imm),
                Jnz => op_jnz(offset: Imm),
                Jgt => op_jgt(offset: Imm),
                Jls => op_jls(offset: Imm),
                Jfw => op_jfw(offset: Imm),
                Jbw => op_jbw(offset: Imm),
                JsrI => op_jsr_imm(offset: Imm),

                Uptime => op_uptime(rd: Dst[0]),
                Call => op_call(arg: Reg[0], slot: Imm),
                MemSize => op_mem_size(rd: Dst[0], device: Imm),
                Int => op_int(irq: Imm),
            }
        }
    }

    // ==================== Operand access ====================

    #[inline(always)]
    fn bits(&self, op: Operand) -> u32 {
        match op {
            Operand::Register(r) => self.contexts.active().registers.bits(r),
            Operand::ConstantZero => 0,
        }
    }

    #[inline(always)]
    fn int(&self, op: Operand) -> i32 {
        self.bits(op) as i32
    }

    #[inline(always)]
    fn float(&self, op: Operand) -> f32 {
        f32::from_bits(self.bits(op))
    }

    #[inline(always)]
    fn reg_bits(&self, r: Reg) -> u32 {
        self.contexts.active().registers.bits(r)
    }

    #[inline(always)]
    fn set_bits(&mut self, r: Reg, v: u32) {
        self.contexts.active_mut().registers.set_bits(r, v);
    }

    #[inline(always)]
    fn set_int(&mut self, r: Reg, v: i32) {
        self.contexts.active_mut().registers.set_int(r, v);
    }

    #[inline(always)]
    fn set_float(&mut self, r: Reg, v: f32) {
        self.contexts.active_mut().registers.set_float(r, v);
    }

    /// Applies a float operation; a NaN produced from non-NaN inputs is a math error.
    fn float_op(
        &mut self,
        rd: Reg,
        rs: Operand,
        rm: Operand,
        f: impl FnOnce(f32, f32) -> f32,
    ) -> Result<(), VMError> {
        let (x, y) = (self.float(rs), self.float(rm));
        let result = f(x, y);
        if result.is_nan() && !x.is_nan() && !y.is_nan() {
            return Err(VMError::Fault(Interrupt::MathError));
        }
        self.set_float(rd, result);
        Ok(())
    }

    fn float_unary(&mut self, rd: Reg, rs: Operand, f: impl FnOnce(f32) -> f32) -> Result<(), VMError> {
        let x = self.float(rs);
        let result = f(x);
        if result.is_nan() && !x.is_nan() {
            return Err(VMError::Fault(Interrupt::MathError));
        }
        self.set_float(rd, result);
        Ok(())
    }

    fn int_op(&mut self, rd: Reg, rs: Operand, rm: Operand, f: impl FnOnce(i32, i32) -> i32) -> Result<(), VMError> {
        let result = f(self.int(rs), self.int(rm));
        self.set_int(rd, result);
        Ok(())
    }

    fn set_flag(&mut self, ordering: Option<Ordering>) -> Result<(), VMError> {
        let flag = match ordering {
            Some(Ordering::Less) => -1,
            Some(Ordering::Equal) => 0,
            Some(Ordering::Greater) => 1,
            None => return Err(VMError::Fault(Interrupt::MathError)),
        };
        self.contexts.active_mut().flag = flag;
        Ok(())
    }

    fn push(&mut self, value: u32) -> Result<(), VMError> {
        self.contexts.active_mut().stack.push(value)
    }

    fn pop(&mut self) -> Result<u32, VMError> {
        self.contexts.active_mut().stack.pop()
    }

    fn jump(&mut self, target: u32) {
        self.contexts.active_mut().pc = target;
    }

    // ==================== Devices ====================

    /// Memory of `device` as seen by load/store/copy (0 = main memory).
    fn device_space(&self, device: u32) -> Result<&[u8], VMError> {
        if device == MAIN_MEMORY_DEVICE {
            Ok(self.memory.as_slice())
        } else {
            Ok(self.peripherals.get(device)?.memory())
        }
    }

    fn device_space_mut(&mut self, device: u32) -> Result<&mut [u8], VMError> {
        if device == MAIN_MEMORY_DEVICE {
            Ok(self.memory.as_mut_slice())
        } else {
            Ok(self.peripherals.get_mut(device)?.memory_mut())
        }
    }

    /// Borrows `len` bytes at `address` on `device`.
    fn device_slice(&self, device: u32, address: u32, len: u32) -> Result<&[u8], VMError> {
        let space = self.device_space(device)?;
        let range = memory::span(space.len(), address, len)?;
        Ok(&space[range])
    }

    fn device_slice_mut(&mut self, device: u32, address: u32, len: u32) -> Result<&mut [u8], VMError> {
        let space = self.device_space_mut(device)?;
        let range = memory::span(space.len(), address, len)?;
        Ok(&mut space[range])
    }

    fn device_load(&self, device: Operand, address: Operand, width: u32) -> Result<u32, VMError> {
        memory::load(self.device_space(self.bits(device))?, self.bits(address), width)
    }

    fn device_store(
        &mut self,
        device: Operand,
        address: Operand,
        width: u32,
        value: u32,
    ) -> Result<(), VMError> {
        let (device, address) = (self.bits(device), self.bits(address));
        memory::store(self.device_space_mut(device)?, address, width, value)
    }

    // ==================== Float arithmetic ====================

    fn op_halt(&mut self, _instr: &'static str) -> Result<(), VMError> {
        self.halted = true;
        Ok(())
    }

    fn op_add(&mut self, _instr: &'static str, rd: Reg, rs: Operand, rm: Operand) -> Result<(), VMError> {
        self.float_op(rd, rs, rm, |x, y| x + y)
    }

    fn op_sub(&mut self, _instr: &'static str, rd: Reg, rs: Operand, rm: Operand) -> Result<(), VMError> {
        self.float_op(rd, rs, rm, |x, y| x - y)
    }

    fn op_mul(&mut self, _instr: &'static str, rd: Reg, rs: Operand, rm: Operand) -> Result<(), VMError> {
        self.float_op(rd, rs, rm, |x, y| x * y)
    }

    fn op_div(&mut self, _instr: &'static str, rd: Reg, rs: Operand, rm: Operand) -> Result<(), VMError> {
        if self.float(rm) == 0.0 {
            return Err(VMError::Fault(Interrupt::DivideByZero));
        }
        self.float_op(rd, rs, rm, |x, y| x / y)
    }

    fn op_pow(&mut self, _instr: &'static str, rd: Reg, rs: Operand, rm: Operand) -> Result<(), VMError> {
        self.float_op(rd, rs, rm, f32::powf)
    }

    /// Both operands are truncated to integers first; the result takes the
    /// sign of the divisor.
    fn op_mod(&mut self, _instr: &'static str, rd: Reg, rs: Operand, rm: Operand) -> Result<(), VMError> {
        let (x, y) = (self.float(rs) as i32, self.float(rm) as i32);
        if y == 0 {
            return Err(VMError::Fault(Interrupt::DivideByZero));
        }
        self.set_float(rd, floor_mod(x, y) as f32);
        Ok(())
    }

    // ==================== Bitwise ====================

    fn op_shl(&mut self, _instr: &'static str, rd: Reg, rs: Operand, rm: Operand) -> Result<(), VMError> {
        self.int_op(rd, rs, rm, |x, y| x.wrapping_shl(y as u32))
    }

    fn op_shr(&mut self, _instr: &'static str, rd: Reg, rs: Operand, rm: Operand) -> Result<(), VMError> {
        self.int_op(rd, rs, rm, |x, y| x.wrapping_shr(y as u32))
    }

    fn op_ushr(&mut self, _instr: &'static str, rd: Reg, rs: Operand, rm: Operand) -> Result<(), VMError> {
        self.int_op(rd, rs, rm, |x, y| (x as u32).wrapping_shr(y as u32) as i32)
    }

    fn op_and(&mut self, _instr: &'static str, rd: Reg, rs: Operand, rm: Operand) -> Result<(), VMError> {
        self.int_op(rd, rs, rm, |x, y| x & y)
    }

    fn op_or(&mut self, _instr: &'static str, rd: Reg, rs: Operand, rm: Operand) -> Result<(), VMError> {
        self.int_op(rd, rs, rm, |x, y| x | y)
    }

    fn op_xor(&mut self, _instr: &'static str, rd: Reg, rs: Operand, rm: Operand) -> Result<(), VMError> {
        self.int_op(rd, rs, rm, |x, y| x ^ y)
    }

    // ==================== Integer arithmetic ====================

    fn op_add_int(&mut self, _instr: &'static str, rd: Reg, rs: Operand, rm: Operand) -> Result<(), VMError> {
        self.int_op(rd, rs, rm, i32::wrapping_add)
    }

    fn op_sub_int(&mut self, _instr: &'static str, rd: Reg, rs: Operand, rm: Operand) -> Result<(), VMError> {
        self.int_op(rd, rs, rm, i32::wrapping_sub)
    }

    fn op_mul_int(&mut self, _instr: &'static str, rd: Reg, rs: Operand, rm: Operand) -> Result<(), VMError> {
        self.int_op(rd, rs, rm, i32::wrapping_mul)
    }

    fn op_div_int(&mut self, _instr: &'static str, rd: Reg, rs: Operand, rm: Operand) -> Result<(), VMError> {
        if self.int(rm) == 0 {
            return Err(VMError::Fault(Interrupt::DivideByZero));
        }
        self.int_op(rd, rs, rm, i32::wrapping_div)
    }

    fn op_mod_int(&mut self, _instr: &'static str, rd: Reg, rs: Operand, rm: Operand) -> Result<(), VMError> {
        if self.int(rm) == 0 {
            return Err(VMError::Fault(Interrupt::DivideByZero));
        }
        self.int_op(rd, rs, rm, floor_mod)
    }

    // ==================== Unary float ====================

    fn op_abs(&mut self, _instr: &'static str, rd: Reg, rs: Operand) -> Result<(), VMError> {
        self.float_unary(rd, rs, f32::abs)
    }

    fn op_sin(&mut self, _instr: &'static str, rd: Reg, rs: Operand) -> Result<(), VMError> {
        self.float_unary(rd, rs, f32::sin)
    }

    fn op_cos(&mut self, _instr: &'static str, rd: Reg, rs: Operand) -> Result<(), VMError> {
        self.float_unary(rd, rs, f32::cos)
    }

    fn op_tan(&mut self, _instr: &'static str, rd: Reg, rs: Operand) -> Result<(), VMError> {
        self.float_unary(rd, rs, f32::tan)
    }

    fn op_floor(&mut self, _instr: &'static str, rd: Reg, rs: Operand) -> Result<(), VMError> {
        self.float_unary(rd, rs, f32::floor)
    }

    fn op_ceil(&mut self, _instr: &'static str, rd: Reg, rs: Operand) -> Result<(), VMError> {
        self.float_unary(rd, rs, f32::ceil)
    }

    fn op_round(&mut self, _instr: &'static str, rd: Reg, rs: Operand) -> Result<(), VMError> {
        self.float_unary(rd, rs, f32::round)
    }

    fn op_log(&mut self, _instr: &'static str, rd: Reg, rs: Operand) -> Result<(), VMError> {
        self.float_unary(rd, rs, f32::ln)
    }

    fn op_rndi(&mut self, _instr: &'static str, rd: Reg) -> Result<(), VMError> {
        let value = self.rng.next_u32();
        self.set_bits(rd, value);
        Ok(())
    }

    fn op_rnd(&mut self, _instr: &'static str, rd: Reg) -> Result<(), VMError> {
        let value = self.rng.next_f32();
        self.set_float(rd, value);
        Ok(())
    }

    fn op_sgn(&mut self, _instr: &'static str, rd: Reg, rs: Operand) -> Result<(), VMError> {
        self.float_unary(rd, rs, |x| if x == 0.0 { 0.0 } else { x.signum() })
    }

    fn op_sqrt(&mut self, _instr: &'static str, rd: Reg, rs: Operand) -> Result<(), VMError> {
        self.float_unary(rd, rs, f32::sqrt)
    }

    fn op_cbrt(&mut self, _instr: &'static str, rd: Reg, rs: Operand) -> Result<(), VMError> {
        self.float_unary(rd, rs, f32::cbrt)
    }

    fn op_inv(&mut self, _instr: &'static str, rd: Reg, rs: Operand) -> Result<(), VMError> {
        if self.float(rs) == 0.0 {
            return Err(VMError::Fault(Interrupt::DivideByZero));
        }
        self.float_unary(rd, rs, f32::recip)
    }

    fn op_rad(&mut self, _instr: &'static str, rd: Reg, rs: Operand) -> Result<(), VMError> {
        self.float_unary(rd, rs, f32::to_radians)
    }

    fn op_not(&mut self, _instr: &'static str, rd: Reg, rs: Operand) -> Result<(), VMError> {
        let value = !self.bits(rs);
        self.set_bits(rd, value);
        Ok(())
    }

    // ==================== Register transfer and system ====================

    fn op_mov(&mut self, _instr: &'static str, rd: Reg, rs: Operand) -> Result<(), VMError> {
        let value = self.bits(rs);
        self.set_bits(rd, value);
        Ok(())
    }

    fn op_xchg(&mut self, _instr: &'static str, ra: Reg, rb: Reg) -> Result<(), VMError> {
        let (a, b) = (self.reg_bits(ra), self.reg_bits(rb));
        self.set_bits(ra, b);
        self.set_bits(rb, a);
        Ok(())
    }

    fn op_inc(&mut self, _instr: &'static str, rd: Reg) -> Result<(), VMError> {
        let value = (self.reg_bits(rd) as i32).wrapping_add(1);
        self.set_int(rd, value);
        Ok(())
    }

    fn op_dec(&mut self, _instr: &'static str, rd: Reg) -> Result<(), VMError> {
        let value = (self.reg_bits(rd) as i32).wrapping_sub(1);
        self.set_int(rd, value);
        Ok(())
    }

    fn op_malloc(&mut self, _instr: &'static str, rd: Reg, size: Operand) -> Result<(), VMError> {
        let ptr = self
            .allocator
            .malloc(self.bits(size))
            .map_err(|_| VMError::Fault(Interrupt::OutOfMemory))?;
        self.set_bits(rd, ptr.address());
        Ok(())
    }

    fn op_ftoi(&mut self, _instr: &'static str, rd: Reg, rs: Operand) -> Result<(), VMError> {
        let x = self.float(rs);
        if x.is_nan() {
            return Err(VMError::Fault(Interrupt::MathError));
        }
        self.set_int(rd, x as i32);
        Ok(())
    }

    fn op_itof(&mut self, _instr: &'static str, rd: Reg, rs: Operand) -> Result<(), VMError> {
        let value = self.int(rs) as f32;
        self.set_float(rd, value);
        Ok(())
    }

    fn op_calloc(&mut self, _instr: &'static str, rd: Reg, size: Operand) -> Result<(), VMError> {
        let size = self.bits(size);
        let ptr = self
            .allocator
            .calloc(&mut self.memory, size)
            .map_err(|_| VMError::Fault(Interrupt::OutOfMemory))?;
        self.set_bits(rd, ptr.address());
        Ok(())
    }

    /// Releases exactly the block a `MALLOC`/`CALLOC` of `size` bytes returned.
    fn op_free(&mut self, _instr: &'static str, addr: Operand, size: Operand) -> Result<(), VMError> {
        let segfault = VMError::Fault(Interrupt::SegmentationFault);
        let start = self.bits(addr);
        let end = word_align(self.bits(size))
            .and_then(|len| start.checked_add(len))
            .ok_or(VMError::Fault(Interrupt::SegmentationFault))?;
        self.allocator.free(start..end).map_err(|_| segfault)
    }

    fn op_ctxsw(&mut self, _instr: &'static str, id: Operand) -> Result<(), VMError> {
        self.switch_context(self.bits(id))
            .map_err(|_| VMError::Fault(Interrupt::IllegalOpcode))
    }

    fn op_yield(&mut self, _instr: &'static str) -> Result<(), VMError> {
        if self.handle.yielded() {
            debug!("context {} yielded", self.contexts.active_id());
        }
        Ok(())
    }

    fn op_getchar(&mut self, _instr: &'static str, rd: Reg) -> Result<(), VMError> {
        let value = self.console.read_char()?.map_or(-1, i32::from);
        self.set_int(rd, value);
        Ok(())
    }

    fn op_putchar(&mut self, _instr: &'static str, rs: Operand) -> Result<(), VMError> {
        self.console.write_char(self.bits(rs) as u8)
    }

    fn op_jsr(&mut self, _instr: &'static str, target: Operand) -> Result<(), VMError> {
        let pc = self.contexts.active().pc;
        self.push(pc)?;
        self.jump(self.bits(target));
        Ok(())
    }

    fn op_return(&mut self, _instr: &'static str) -> Result<(), VMError> {
        let lr = self.pop()?;
        let ctx = self.contexts.active_mut();
        ctx.lr = lr;
        ctx.pc = lr;
        Ok(())
    }

    // ==================== Memory access ====================

    fn op_load_byte(&mut self, _instr: &'static str, rd: Reg, addr: Operand, dev: Operand) -> Result<(), VMError> {
        let value = self.device_load(dev, addr, 1)?;
        self.set_bits(rd, value);
        Ok(())
    }

    fn op_store_byte(&mut self, _instr: &'static str, rs: Operand, addr: Operand, dev: Operand) -> Result<(), VMError> {
        self.device_store(dev, addr, 1, self.bits(rs))
    }

    fn op_load_hword(&mut self, _instr: &'static str, rd: Reg, addr: Operand, dev: Operand) -> Result<(), VMError> {
        let value = self.device_load(dev, addr, 2)?;
        self.set_bits(rd, value);
        Ok(())
    }

    fn op_store_hword(&mut self, _instr: &'static str, rs: Operand, addr: Operand, dev: Operand) -> Result<(), VMError> {
        self.device_store(dev, addr, 2, self.bits(rs))
    }

    fn op_load_word(&mut self, _instr: &'static str, rd: Reg, addr: Operand, dev: Operand) -> Result<(), VMError> {
        let value = self.device_load(dev, addr, 4)?;
        self.set_bits(rd, value);
        Ok(())
    }

    fn op_store_word(&mut self, _instr: &'static str, rs: Operand, addr: Operand, dev: Operand) -> Result<(), VMError> {
        self.device_store(dev, addr, 4, self.bits(rs))
    }

    /// Copies `len` bytes from `from` on the source device to `to` on the destination device.
    fn op_memcpy(
        &mut self,
        _instr: &'static str,
        dst_dev: Operand,
        src_dev: Operand,
        len: Operand,
        from: Reg,
        to: Reg,
    ) -> Result<(), VMError> {
        let len = self.bits(len);
        let (from, to) = (self.reg_bits(from), self.reg_bits(to));
        let data = self.device_slice(self.bits(src_dev), from, len)?.to_vec();
        self.device_slice_mut(self.bits(dst_dev), to, len)?
            .copy_from_slice(&data);
        Ok(())
    }

    // ==================== Compare and immediates ====================

    fn op_cmp(&mut self, _instr: &'static str, lhs: Operand, rhs: Operand) -> Result<(), VMError> {
        self.set_flag(Some(self.int(lhs).cmp(&self.int(rhs))))
    }

    fn op_cmp_if(&mut self, _instr: &'static str, lhs: Operand, rhs: Operand) -> Result<(), VMError> {
        let (x, y) = (self.int(lhs) as f64, self.float(rhs) as f64);
        self.set_flag(x.partial_cmp(&y))
    }

    fn op_cmp_fi(&mut self, _instr: &'static str, lhs: Operand, rhs: Operand) -> Result<(), VMError> {
        let (x, y) = (self.float(lhs) as f64, self.int(rhs) as f64);
        self.set_flag(x.partial_cmp(&y))
    }

    fn op_cmp_ff(&mut self, _instr: &'static str, lhs: Operand, rhs: Operand) -> Result<(), VMError> {
        let (x, y) = (self.float(lhs), self.float(rhs));
        self.set_flag(x.partial_cmp(&y))
    }

    fn op_load_imm(&mut self, _instr: &'static str, rd: Reg, imm: u32) -> Result<(), VMError> {
        self.set_bits(rd, imm);
        Ok(())
    }

    fn op_store_byte_imm(&mut self, _instr: &'static str, addr: Reg, imm: u32) -> Result<(), VMError> {
        self.memory.write_byte(self.reg_bits(addr), imm as u8)
    }

    fn op_store_hword_imm(&mut self, _instr: &'static str, addr: Reg, imm: u32) -> Result<(), VMError> {
        self.memory.write_half(self.reg_bits(addr), imm as u16)
    }

    fn op_load_word_lo(&mut self, _instr: &'static str, rd: Reg, imm: u32) -> Result<(), VMError> {
        let value = (self.reg_bits(rd) & 0xFFFF_0000) | imm;
        self.set_bits(rd, value);
        Ok(())
    }

    fn op_load_word_hi(&mut self, _instr: &'static str, rd: Reg, imm: u32) -> Result<(), VMError> {
        let value = (self.reg_bits(rd) & 0x0000_FFFF) | (imm << 16);
        self.set_bits(rd, value);
        Ok(())
    }

    // ==================== Absolute words and call stack ====================

    fn op_load_word_mem(&mut self, _instr: &'static str, rd: Reg, offset: u32) -> Result<(), VMError> {
        let value = self.memory.read_word(offset << 2)?;
        self.set_bits(rd, value);
        Ok(())
    }

    fn op_store_word_mem(&mut self, _instr: &'static str, rs: Reg, offset: u32) -> Result<(), VMError> {
        self.memory.write_word(offset << 2, self.reg_bits(rs))
    }

    fn op_push(&mut self, _instr: &'static str, rs: Reg) -> Result<(), VMError> {
        self.push(self.reg_bits(rs))
    }

    fn op_pop(&mut self, _instr: &'static str, rd: Reg) -> Result<(), VMError> {
        let value = self.pop()?;
        self.set_bits(rd, value);
        Ok(())
    }

    fn op_push_word_imm(&mut self, _instr: &'static str, offset: u32) -> Result<(), VMError> {
        self.push(offset << 2)
    }

    fn op_pop_word_imm(&mut self, _instr: &'static str) -> Result<(), VMError> {
        let value = self.pop()?;
        self.contexts.active_mut().lr = value;
        Ok(())
    }

    // ==================== Jumps ====================

    fn jump_if(&mut self, offset: u32, taken: impl FnOnce(i8) -> bool) -> Result<(), VMError> {
        if taken(self.contexts.active().flag) {
            self.jump(offset << 2);
        }
        Ok(())
    }

    fn op_jmp(&mut self, _instr: &'static str, offset: u32) -> Result<(), VMError> {
        self.jump_if(offset, |_| true)
    }

    fn op_jz(&mut self, _instr: &'static str, offset: u32) -> Result<(), VMError> {
        self.jump_if(offset, |flag| flag == 0)
    }

    fn op_jnz(&mut self, _instr: &'static str, offset: u32) -> Result<(), VMError> {
        self.jump_if(offset, |flag| flag != 0)
    }

    fn op_jgt(&mut self, _instr: &'static str, offset: u32) -> Result<(), VMError> {
        self.jump_if(offset, |flag| flag > 0)
    }

    fn op_jls(&mut self, _instr: &'static str, offset: u32) -> Result<(), VMError> {
        self.jump_if(offset, |flag| flag < 0)
    }

    fn op_jfw(&mut self, _instr: &'static str, offset: u32) -> Result<(), VMError> {
        let pc = self.contexts.active().pc;
        self.jump(pc.wrapping_add(offset << 2));
        Ok(())
    }

    fn op_jbw(&mut self, _instr: &'static str, offset: u32) -> Result<(), VMError> {
        let pc = self.contexts.active().pc;
        self.jump(pc.wrapping_sub(offset << 2));
        Ok(())
    }

    fn op_jsr_imm(&mut self, _instr: &'static str, offset: u32) -> Result<(), VMError> {
        let pc = self.contexts.active().pc;
        self.push(pc)?;
        self.jump(offset << 2);
        Ok(())
    }

    // ==================== Peripherals and interrupts ====================

    fn op_uptime(&mut self, _instr: &'static str, rd: Reg) -> Result<(), VMError> {
        let ms = self.uptime_ms();
        self.set_bits(rd, ms);
        Ok(())
    }

    /// Invokes the peripheral in `slot`. Faults it reports are raised in the program.
    fn op_call(&mut self, _instr: &'static str, arg: Reg, slot: u32) -> Result<(), VMError> {
        let arg = self.reg_bits(arg);
        match self.peripherals.get_mut(slot)?.call(arg) {
            Ok(()) => Ok(()),
            Err(VMError::Fault(interrupt)) => Err(VMError::Fault(interrupt)),
            Err(e) => Err(VMError::PeripheralFailure {
                slot,
                reason: e.to_string(),
            }),
        }
    }

    fn op_mem_size(&mut self, _instr: &'static str, rd: Reg, device: u32) -> Result<(), VMError> {
        let size = match device {
            MAIN_MEMORY_DEVICE => self.memory.len(),
            BIOS_SLOT => self.uptime_ms(),
            slot => self.peripherals.get(slot)?.memory().len() as u32,
        };
        self.set_bits(rd, size);
        Ok(())
    }

    /// Raises vector `irq`. Vectors without a named condition have nothing to run.
    fn op_int(&mut self, instr: &'static str, irq: u32) -> Result<(), VMError> {
        if irq >= VECTOR_COUNT {
            return Err(VMError::Fault(Interrupt::IllegalOpcode));
        }
        match Interrupt::from_index(irq) {
            Some(interrupt) => Err(VMError::Fault(interrupt)),
            None => {
                debug!("{instr} {irq}: vector has no condition, ignored");
                Ok(())
            }
        }
    }
}
