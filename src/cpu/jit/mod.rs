//! Basic block JIT
//!
//! Hot guest addresses are scanned forward into a short list of simple
//! ops (register/memory mov and add, ending at a ret, a direct jmp or the
//! first instruction the scanner does not know). The list is emitted into
//! a code buffer: the native dynasm buffer when the block qualifies and the
//! feature is enabled, the bytecode buffer otherwise.
//!
//! Blocks are keyed by start address. Any guest store that lands on a page
//! holding compiled code drops every block on that page.

pub mod buffer;
pub mod dynasm;

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

use thiserror::Error;

use self::buffer::{BlockContext, BlockExit, BytecodeBuffer, CodeBuffer, CodeHandle, MAX_OP_BYTES};
use super::decode::{Cursor, Rm};
use crate::memory::Bus;

/// Executions of an address before it is compiled
pub const JIT_THRESHOLD: u32 = 10;
/// Longest guest byte span scanned into one block
pub const MAX_BLOCK_SIZE: u32 = 256;
/// Default code buffer capacity
pub const JIT_CACHE_SIZE: usize = 16 * 1024 * 1024;

const CODE_PAGE_SHIFT: u32 = 12;

#[derive(Debug, Error)]
pub enum CodegenError {
    #[error("no compilable instructions at block start")]
    Empty,
    #[error("code buffer full")]
    CacheFull,
    #[error("unsupported instruction at {0:#010x}")]
    Unsupported(u32),
    #[error("backend error: {0}")]
    Backend(String),
}

/// One guest instruction in compiler form
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockOp {
    MovRegReg { dst: u8, src: u8 },
    MovLoad { dst: u8, base: Option<u8>, disp: i32 },
    MovStore { base: Option<u8>, disp: i32, src: u8 },
    AddRegReg { dst: u8, src: u8 },
    AddLoad { dst: u8, base: Option<u8>, disp: i32 },
    AddStore { base: Option<u8>, disp: i32, src: u8 },
    Ret,
    Jmp { target: u32 },
}

impl BlockOp {
    fn ends_block(self) -> bool {
        matches!(self, BlockOp::Ret | BlockOp::Jmp { .. })
    }
}

/// A block op tagged with its guest address
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TracedOp {
    pub pc: u32,
    pub op: BlockOp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Bytecode,
    Native,
}

/// A compiled block
#[derive(Clone, Debug)]
pub struct CompiledBlock {
    pub start: u32,
    /// Guest bytes covered by the block
    pub byte_length: u32,
    pub op_count: u32,
    pub backend: Backend,
    pub code: CodeHandle,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JitStats {
    pub hits: u64,
    pub misses: u64,
    pub compiles: u64,
    pub flushes: u64,
    pub invalidations: u64,
}

/// Decode the block starting at `start`. `stop_at` reports addresses
/// (other than the first) where scanning must end, e.g. breakpoints.
pub fn scan_block(bus: &dyn Bus, start: u32, max_span: u32, stop_at: impl Fn(u32) -> bool) -> (Vec<TracedOp>, u32) {
    let mut ops = Vec::new();
    let mut pc = start;
    while pc.wrapping_sub(start) < max_span {
        if pc != start && stop_at(pc) {
            break;
        }
        let mut cur = Cursor::new(bus, pc);
        let op = match decode_op(&mut cur) {
            Some(op) => op,
            None => break,
        };
        ops.push(TracedOp { pc, op });
        pc = cur.pc;
        if op.ends_block() {
            break;
        }
    }
    (ops, pc)
}

fn decode_op(cur: &mut Cursor<'_>) -> Option<BlockOp> {
    let opcode = cur.fetch8().ok()?;
    match opcode {
        0x01 | 0x03 | 0x89 | 0x8B => {
            let m = cur.modrm().ok()?;
            let to_reg = opcode & 2 != 0;
            let is_mov = opcode >= 0x89;
            Some(match m.rm {
                Rm::Reg(rm) => {
                    let (dst, src) = if to_reg { (m.reg, rm) } else { (rm, m.reg) };
                    if is_mov {
                        BlockOp::MovRegReg { dst, src }
                    } else {
                        BlockOp::AddRegReg { dst, src }
                    }
                }
                // Scaled-index operands go through the interpreter
                Rm::Mem(mem) if mem.index.is_some() => return None,
                Rm::Mem(mem) => {
                    let (base, disp) = (mem.base, mem.disp);
                    match (is_mov, to_reg) {
                        (true, true) => BlockOp::MovLoad { dst: m.reg, base, disp },
                        (true, false) => BlockOp::MovStore { base, disp, src: m.reg },
                        (false, true) => BlockOp::AddLoad { dst: m.reg, base, disp },
                        (false, false) => BlockOp::AddStore { base, disp, src: m.reg },
                    }
                }
            })
        }
        0xC3 => Some(BlockOp::Ret),
        0xE9 => {
            let rel = cur.fetch32().ok()?;
            Some(BlockOp::Jmp { target: cur.pc.wrapping_add(rel) })
        }
        0xEB => {
            let rel = cur.fetch_simm8().ok()?;
            Some(BlockOp::Jmp { target: cur.pc.wrapping_add(rel) })
        }
        _ => None,
    }
}

pub struct Jit {
    blocks: HashMap<u32, CompiledBlock>,
    /// Start addresses that produced no block; retried after a flush
    rejected: HashSet<u32>,
    /// Pages (addr >> 12) touched by any compiled block
    code_pages: HashSet<u32>,
    bytecode: BytecodeBuffer,
    native: Option<Box<dyn CodeBuffer>>,
    max_span: u32,
    pub stats: JitStats,
}

impl Jit {
    pub fn new(cache_size: usize, max_span: u32) -> Self {
        Jit {
            blocks: HashMap::with_capacity(1024),
            rejected: HashSet::new(),
            code_pages: HashSet::new(),
            bytecode: BytecodeBuffer::new(cache_size),
            native: Self::native_buffer(cache_size),
            max_span,
            stats: JitStats::default(),
        }
    }

    #[cfg(all(not(target_arch = "wasm32"), feature = "jit-dynasm", target_arch = "x86_64"))]
    fn native_buffer(cache_size: usize) -> Option<Box<dyn CodeBuffer>> {
        Some(Box::new(dynasm::NativeBuffer::new(cache_size)))
    }

    #[cfg(not(all(not(target_arch = "wasm32"), feature = "jit-dynasm", target_arch = "x86_64")))]
    fn native_buffer(_cache_size: usize) -> Option<Box<dyn CodeBuffer>> {
        None
    }

    pub fn contains(&self, start: u32) -> bool {
        self.blocks.contains_key(&start)
    }

    pub fn is_rejected(&self, start: u32) -> bool {
        self.rejected.contains(&start)
    }

    pub fn block(&self, start: u32) -> Option<&CompiledBlock> {
        self.blocks.get(&start)
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn used(&self) -> usize {
        self.bytecode.used() + self.native.as_ref().map_or(0, |n| n.used())
    }

    /// Scan and compile the block at `start`
    pub fn compile(&mut self, bus: &dyn Bus, start: u32, stop_at: impl Fn(u32) -> bool) -> Result<&CompiledBlock, CodegenError> {
        let (ops, end) = scan_block(bus, start, self.max_span, stop_at);
        if ops.is_empty() {
            self.rejected.insert(start);
            return Err(CodegenError::Empty);
        }

        // Whole-cache flush when the worst case for this block does not fit
        let worst = (ops.len() + 1) * MAX_OP_BYTES;
        if self.bytecode.used() + worst > self.bytecode.capacity() {
            self.flush();
        }

        let mut emitted = None;
        if let Some(native) = self.native.as_mut() {
            if dynasm::can_compile(&ops) {
                match native.emit(&ops, end) {
                    Ok(handle) => emitted = Some((handle, Backend::Native)),
                    Err(CodegenError::CacheFull) => {
                        native.clear();
                        self.blocks.retain(|_, b| b.backend != Backend::Native);
                    }
                    Err(e) => tracing::debug!("native emit failed at {:#010x}: {}", start, e),
                }
            }
        }
        if let Some(native) = self.native.as_mut() {
            native.flush();
        }
        let (code, backend) = match emitted {
            Some(e) => e,
            None => match self.bytecode.emit(&ops, end) {
                Ok(handle) => (handle, Backend::Bytecode),
                Err(e) => {
                    // Already flushed above, so this block can never fit
                    self.rejected.insert(start);
                    return Err(e);
                }
            },
        };

        let byte_length = end.wrapping_sub(start).max(1);
        let first_page = start >> CODE_PAGE_SHIFT;
        let last_page = start.wrapping_add(byte_length - 1) >> CODE_PAGE_SHIFT;
        for page in first_page..=last_page.max(first_page) {
            self.code_pages.insert(page);
        }

        self.stats.compiles += 1;
        let block = CompiledBlock {
            start,
            byte_length,
            op_count: ops.len() as u32,
            backend,
            code,
        };
        Ok(self.blocks.entry(start).or_insert(block))
    }

    /// Run the block at `start`. Returns None if no block is cached there.
    pub fn run(&mut self, start: u32, ctx: &mut BlockContext<'_>) -> Option<(BlockExit, u32)> {
        let Some(block) = self.blocks.get(&start) else {
            self.stats.misses += 1;
            return None;
        };
        self.stats.hits += 1;
        ctx.code = (block.start, block.start.wrapping_add(block.byte_length));
        let exit = match block.backend {
            Backend::Native => self.native.as_ref()?.invoke(block.code, ctx),
            Backend::Bytecode => self.bytecode.invoke(block.code, ctx),
        };
        Some((exit, block.op_count))
    }

    /// Drop every block overlapping `[addr, addr + len)`
    pub fn invalidate_range(&mut self, addr: u32, len: u32) {
        let first = addr >> CODE_PAGE_SHIFT;
        let last = addr.wrapping_add(len.max(1) - 1) >> CODE_PAGE_SHIFT;
        if !(first..=last.max(first)).any(|p| self.code_pages.contains(&p)) {
            return;
        }
        let end = addr as u64 + len as u64;
        let before = self.blocks.len();
        self.blocks.retain(|_, b| {
            let b_end = b.start as u64 + b.byte_length as u64;
            (b.start as u64) >= end || b_end <= addr as u64
        });
        let dropped = before - self.blocks.len();
        if dropped > 0 {
            self.stats.invalidations += dropped as u64;
            tracing::trace!("invalidated {} block(s) at {:#010x}+{}", dropped, addr, len);
        }
        self.rejected.retain(|a| *a < addr || *a as u64 >= end);
    }

    /// Drop all blocks and reclaim both code buffers
    pub fn flush(&mut self) {
        self.blocks.clear();
        self.rejected.clear();
        self.code_pages.clear();
        self.bytecode.clear();
        if let Some(native) = self.native.as_mut() {
            native.clear();
        }
        self.stats.flushes += 1;
    }

    /// Human-readable listing of cached blocks
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "JIT cache: {} blocks, {} bytes used, hits={} misses={} compiles={} flushes={}",
            self.blocks.len(),
            self.used(),
            self.stats.hits,
            self.stats.misses,
            self.stats.compiles,
            self.stats.flushes
        );
        let mut starts: Vec<_> = self.blocks.keys().copied().collect();
        starts.sort_unstable();
        for start in starts {
            let b = &self.blocks[&start];
            let _ = writeln!(
                out,
                "  {:#010x}: {} ops, {} bytes, {:?}",
                b.start, b.op_count, b.byte_length, b.backend
            );
        }
        out
    }
}
