//! Code buffers
//!
//! A code buffer owns the memory compiled blocks live in. The bytecode
//! buffer is always available: blocks are encoded into a compact byte
//! stream inside one pre-sized allocation and run by a small dispatch loop.
//! Native backends implement the same trait.

use super::{BlockOp, CodegenError, TracedOp};
use crate::cpu::alu;
use crate::cpu::regs::{Registers, ESP};
use crate::memory::{Bus, BusError};

/// Location of a compiled block inside its buffer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CodeHandle {
    pub offset: usize,
    pub len: usize,
}

/// Everything a compiled block may touch
pub struct BlockContext<'a> {
    pub regs: &'a mut Registers,
    pub bus: &'a dyn Bus,
    /// Guest stores performed by the block, as (address, length)
    pub writes: Vec<(u32, u32)>,
    /// Guest bytes `[start, end)` the running block was compiled from
    pub code: (u32, u32),
}

impl<'a> BlockContext<'a> {
    pub fn new(regs: &'a mut Registers, bus: &'a dyn Bus) -> Self {
        BlockContext {
            regs,
            bus,
            writes: Vec::new(),
            code: (0, 0),
        }
    }

    /// True if a store to `[addr, addr + len)` rewrote the running block
    fn hits_code(&self, addr: u32, len: u32) -> bool {
        let (start, end) = (self.code.0 as u64, self.code.1 as u64);
        (addr as u64) < end && start < addr as u64 + len as u64
    }
}

/// How a block finished
#[derive(Debug)]
pub enum BlockExit {
    /// Continue at the given eip
    Continue(u32),
    /// A store rewrote the block itself. The first `retired` ops ran and
    /// execution resumes at `next` outside the stale code.
    SelfModified { next: u32, retired: u32 },
    /// A bus access failed in the instruction at `pc`; state reflects
    /// every instruction before it
    Fault { pc: u32, error: BusError },
}

pub trait CodeBuffer: Send {
    fn name(&self) -> &'static str;
    fn capacity(&self) -> usize;
    fn used(&self) -> usize;
    /// Allocate space for and write one block ending at `exit` (the
    /// fall-through eip when the last op is not a jump or return)
    fn emit(&mut self, ops: &[TracedOp], exit: u32) -> Result<CodeHandle, CodegenError>;
    /// Make freshly written code visible to execution
    fn flush(&mut self) {}
    fn invoke(&self, handle: CodeHandle, ctx: &mut BlockContext<'_>) -> BlockExit;
    /// Drop every block
    fn clear(&mut self);
}

// Bytecode tags
const BC_MOV_RR: u8 = 0x01;
const BC_MOV_LOAD: u8 = 0x02;
const BC_MOV_STORE: u8 = 0x03;
const BC_ADD_RR: u8 = 0x04;
const BC_ADD_LOAD: u8 = 0x05;
const BC_ADD_STORE: u8 = 0x06;
const BC_RET: u8 = 0x07;
const BC_JMP: u8 = 0x08;
const BC_END: u8 = 0x09;
const NO_BASE: u8 = 0xFF;

/// Worst-case encoded size of one op (tag + pc + reg + base + disp)
pub const MAX_OP_BYTES: usize = 11;

pub struct BytecodeBuffer {
    code: Vec<u8>,
    capacity: usize,
}

impl BytecodeBuffer {
    pub fn new(capacity: usize) -> Self {
        BytecodeBuffer {
            code: Vec::with_capacity(capacity.min(1 << 20)),
            capacity,
        }
    }

    fn put_u32(&mut self, v: u32) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    fn put_mem(&mut self, base: Option<u8>, disp: i32) {
        self.code.push(base.unwrap_or(NO_BASE));
        self.put_u32(disp as u32);
    }
}

struct Reader<'a> {
    code: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> u8 {
        let b = self.code[self.pos];
        self.pos += 1;
        b
    }

    fn u32(&mut self) -> u32 {
        let v = self.peek_u32(self.pos);
        self.pos += 4;
        v
    }

    fn peek_u32(&self, at: usize) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.code[at..at + 4]);
        u32::from_le_bytes(b)
    }

    /// Guest eip of whatever follows the current op. Every op and the
    /// end marker store it right after their tag.
    fn next_pc(&self) -> u32 {
        self.peek_u32(self.pos + 1)
    }

    fn mem(&mut self, regs: &Registers) -> u32 {
        let base = self.u8();
        let disp = self.u32();
        if base == NO_BASE {
            disp
        } else {
            regs.get(base).wrapping_add(disp)
        }
    }
}

/// Result of one bytecode op
enum Step {
    Next,
    Exit(u32),
    /// The op stored into the running block; leave before stale ops run
    Patched(u32),
}

/// Execute one bytecode op
fn run_op(r: &mut Reader<'_>, tag: u8, ctx: &mut BlockContext<'_>) -> Result<Step, BusError> {
    let regs = &mut *ctx.regs;
    match tag {
        BC_MOV_RR => {
            let (dst, src) = (r.u8(), r.u8());
            regs.set(dst, regs.get(src));
        }
        BC_ADD_RR => {
            let (dst, src) = (r.u8(), r.u8());
            let (v, f) = alu::add32(regs.get(dst), regs.get(src));
            regs.set(dst, v);
            regs.set_arith_flags(f);
        }
        BC_MOV_LOAD => {
            let dst = r.u8();
            let addr = r.mem(regs);
            let v = ctx.bus.read32(addr)?;
            regs.set(dst, v);
        }
        BC_ADD_LOAD => {
            let dst = r.u8();
            let addr = r.mem(regs);
            let (v, f) = alu::add32(regs.get(dst), ctx.bus.read32(addr)?);
            regs.set(dst, v);
            regs.set_arith_flags(f);
        }
        BC_MOV_STORE => {
            let src = r.u8();
            let addr = r.mem(regs);
            ctx.bus.write32(addr, regs.get(src))?;
            ctx.writes.push((addr, 4));
            if ctx.hits_code(addr, 4) {
                return Ok(Step::Patched(r.next_pc()));
            }
        }
        BC_ADD_STORE => {
            let src = r.u8();
            let addr = r.mem(regs);
            let (v, f) = alu::add32(ctx.bus.read32(addr)?, regs.get(src));
            ctx.bus.write32(addr, v)?;
            ctx.writes.push((addr, 4));
            regs.set_arith_flags(f);
            if ctx.hits_code(addr, 4) {
                return Ok(Step::Patched(r.next_pc()));
            }
        }
        BC_RET => {
            let esp = regs.get(ESP);
            let target = ctx.bus.read32(esp)?;
            regs.set(ESP, esp.wrapping_add(4));
            return Ok(Step::Exit(target));
        }
        _ => return Ok(Step::Exit(r.u32())), // BC_JMP
    }
    Ok(Step::Next)
}

impl CodeBuffer for BytecodeBuffer {
    fn name(&self) -> &'static str {
        "bytecode"
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn used(&self) -> usize {
        self.code.len()
    }

    fn emit(&mut self, ops: &[TracedOp], exit: u32) -> Result<CodeHandle, CodegenError> {
        if ops.is_empty() {
            return Err(CodegenError::Empty);
        }
        if self.code.len() + (ops.len() + 1) * MAX_OP_BYTES > self.capacity {
            return Err(CodegenError::CacheFull);
        }
        let offset = self.code.len();
        for traced in ops {
            let tag = match traced.op {
                BlockOp::MovRegReg { .. } => BC_MOV_RR,
                BlockOp::MovLoad { .. } => BC_MOV_LOAD,
                BlockOp::MovStore { .. } => BC_MOV_STORE,
                BlockOp::AddRegReg { .. } => BC_ADD_RR,
                BlockOp::AddLoad { .. } => BC_ADD_LOAD,
                BlockOp::AddStore { .. } => BC_ADD_STORE,
                BlockOp::Ret => BC_RET,
                BlockOp::Jmp { .. } => BC_JMP,
            };
            self.code.push(tag);
            self.put_u32(traced.pc);
            match traced.op {
                BlockOp::MovRegReg { dst, src } | BlockOp::AddRegReg { dst, src } => {
                    self.code.push(dst);
                    self.code.push(src);
                }
                BlockOp::MovLoad { dst, base, disp } | BlockOp::AddLoad { dst, base, disp } => {
                    self.code.push(dst);
                    self.put_mem(base, disp);
                }
                BlockOp::MovStore { base, disp, src } | BlockOp::AddStore { base, disp, src } => {
                    self.code.push(src);
                    self.put_mem(base, disp);
                }
                BlockOp::Ret => {}
                BlockOp::Jmp { target } => self.put_u32(target),
            }
        }
        if !matches!(ops.last().map(|t| t.op), Some(BlockOp::Ret) | Some(BlockOp::Jmp { .. })) {
            self.code.push(BC_END);
            self.put_u32(exit);
        }
        Ok(CodeHandle {
            offset,
            len: self.code.len() - offset,
        })
    }

    fn invoke(&self, handle: CodeHandle, ctx: &mut BlockContext<'_>) -> BlockExit {
        let mut r = Reader {
            code: &self.code[handle.offset..handle.offset + handle.len],
            pos: 0,
        };
        let mut retired = 0;
        loop {
            let tag = r.u8();
            if tag == BC_END {
                return BlockExit::Continue(r.u32());
            }
            let pc = r.u32();
            let step = run_op(&mut r, tag, ctx);
            retired += 1;
            match step {
                Ok(Step::Next) => {}
                Ok(Step::Exit(next)) => return BlockExit::Continue(next),
                Ok(Step::Patched(next)) => return BlockExit::SelfModified { next, retired },
                Err(error) => return BlockExit::Fault { pc, error },
            }
        }
    }

    fn clear(&mut self) {
        self.code.clear();
    }
}
