//! x86 CPU core
//!
//! 32-bit integer core with x87 and packed-single SSE subsets, plus a block
//! JIT for hot addresses. The CPU never owns memory; every access goes
//! through a `Bus`, so the same core runs against the full `MemoryBus` or a
//! test bus.

pub mod alu;
pub mod decode;
mod execute;
pub mod fpu;
pub mod jit;
pub mod regs;
mod sse;

use std::collections::HashMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::memory::{Bus, BusError};
use jit::buffer::{BlockContext, BlockExit};
use jit::{CodegenError, Jit, JIT_CACHE_SIZE, JIT_THRESHOLD, MAX_BLOCK_SIZE};

pub use fpu::Fpu;
pub use regs::Registers;

#[derive(Debug, Error)]
pub enum CpuError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("invalid opcode {opcode:#04x} at {addr:#010x}")]
    InvalidOpcode { addr: u32, opcode: u8 },
    #[error("invalid opcode 0f {opcode:#04x} at {addr:#010x}")]
    InvalidSse { addr: u32, opcode: u8 },
    #[error("invalid Xbox escape {op:#04x} at {addr:#010x}")]
    InvalidXboxOp { addr: u32, op: u8 },
    #[error("divide error at {addr:#010x}")]
    DivideError { addr: u32 },
}

/// Execution state. Only `Running` makes `execute_step` do work.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuState {
    Running,
    Halted,
    Error,
    DebugBreak,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuConfig {
    pub jit_enabled: bool,
    /// Executions of an address before it is compiled
    pub jit_threshold: u32,
    pub jit_cache_size: usize,
    /// Longest guest byte span in one block
    pub max_block_span: u32,
}

impl Default for CpuConfig {
    fn default() -> Self {
        CpuConfig {
            jit_enabled: true,
            jit_threshold: JIT_THRESHOLD,
            jit_cache_size: JIT_CACHE_SIZE,
            max_block_span: MAX_BLOCK_SIZE,
        }
    }
}

/// A guest kernel call waiting to be serviced by the session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyscallRequest {
    pub number: u32,
    pub args: [u32; 4],
}

pub type BreakpointCallback = Box<dyn FnMut(&Registers) + Send>;
pub type DebugCallback = Box<dyn Fn(u32, &str) + Send>;

/// Serializable CPU state for save states
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuSnapshot {
    pub regs: Registers,
    pub fpu: Fpu,
    pub state: CpuState,
    pub instruction_count: u64,
}

pub struct Cpu {
    pub regs: Registers,
    pub fpu: Fpu,
    state: CpuState,
    config: CpuConfig,
    /// Execution-count histogram keyed by eip
    exec_counts: HashMap<u32, u32>,
    jit: Jit,
    breakpoints: HashMap<u32, BreakpointCallback>,
    /// Breakpoint address to step over once after `resume`
    skip_breakpoint: Option<u32>,
    debug_callback: Option<DebugCallback>,
    tracing: bool,
    pending_syscall: Option<SyscallRequest>,
    pub instruction_count: u64,
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new(CpuConfig::default())
    }
}

impl Cpu {
    pub fn new(config: CpuConfig) -> Self {
        let jit = Jit::new(config.jit_cache_size, config.max_block_span);
        let mut cpu = Cpu {
            regs: Registers::new(),
            fpu: Fpu::new(),
            state: CpuState::Running,
            config,
            exec_counts: HashMap::new(),
            jit,
            breakpoints: HashMap::new(),
            skip_breakpoint: None,
            debug_callback: None,
            tracing: false,
            pending_syscall: None,
            instruction_count: 0,
        };
        cpu.reset();
        cpu
    }

    /// Power-on state: eip at the top of BIOS, real-mode CS, FPU defaults.
    /// Breakpoints, callbacks and configuration survive a reset.
    pub fn reset(&mut self) {
        self.regs = Registers::new();
        self.fpu.reset();
        self.state = CpuState::Running;
        self.exec_counts.clear();
        self.jit.flush();
        self.skip_breakpoint = None;
        self.pending_syscall = None;
        self.instruction_count = 0;
    }

    pub fn state(&self) -> CpuState {
        self.state
    }

    pub fn set_state(&mut self, state: CpuState) {
        self.state = state;
    }

    pub fn config(&self) -> &CpuConfig {
        &self.config
    }

    /// Execute one instruction (or one compiled block)
    pub fn execute_step(&mut self, bus: &dyn Bus) -> Result<(), CpuError> {
        if self.state != CpuState::Running {
            return Ok(());
        }
        let eip = self.regs.eip;

        if self.skip_breakpoint.take() != Some(eip) {
            if let Some(callback) = self.breakpoints.get_mut(&eip) {
                callback(&self.regs);
                self.state = CpuState::DebugBreak;
                self.emit_debug(eip, "breakpoint hit");
                return Ok(());
            }
        }

        let count = {
            let c = self.exec_counts.entry(eip).or_insert(0);
            *c = c.saturating_add(1);
            *c
        };

        if self.config.jit_enabled && count > self.config.jit_threshold {
            match self.run_jit(bus, eip) {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => return Err(self.fail(e)),
            }
        }

        match self.interpret(bus, eip) {
            Ok(()) => {
                self.instruction_count += 1;
                Ok(())
            }
            Err(e) => {
                self.regs.eip = eip;
                Err(self.fail(e))
            }
        }
    }

    /// Run up to `cycles` steps; stops early when the state leaves
    /// `Running` or a syscall is pending. Returns the steps taken.
    pub fn execute(&mut self, cycles: u32, bus: &dyn Bus) -> Result<u32, CpuError> {
        let mut steps = 0;
        while steps < cycles && self.state == CpuState::Running && self.pending_syscall.is_none() {
            self.execute_step(bus)?;
            steps += 1;
        }
        Ok(steps)
    }

    fn fail(&mut self, error: CpuError) -> CpuError {
        self.state = CpuState::Error;
        tracing::error!("CPU error: {}", error);
        error
    }

    /// Look up or compile the block at `eip` and run it. Returns false when
    /// the address has no block and must be interpreted.
    fn run_jit(&mut self, bus: &dyn Bus, eip: u32) -> Result<bool, CpuError> {
        if self.jit.is_rejected(eip) {
            return Ok(false);
        }
        if !self.jit.contains(eip) {
            let breakpoints = &self.breakpoints;
            match self.jit.compile(bus, eip, |addr| breakpoints.contains_key(&addr)) {
                Ok(block) => debug!("compiled block at {:#010x}: {} ops", eip, block.op_count),
                Err(CodegenError::Empty) => return Ok(false),
                Err(e) => {
                    debug!("JIT compile failed at {:#010x}: {}", eip, e);
                    return Ok(false);
                }
            }
        }

        let mut ctx = BlockContext::new(&mut self.regs, bus);
        let Some((exit, ops)) = self.jit.run(eip, &mut ctx) else {
            return Ok(false);
        };
        let writes = std::mem::take(&mut ctx.writes);
        for (addr, len) in writes {
            self.jit.invalidate_range(addr, len);
        }
        match exit {
            BlockExit::Continue(next) => {
                self.regs.eip = next;
                self.instruction_count += ops as u64;
                Ok(true)
            }
            BlockExit::SelfModified { next, retired } => {
                self.regs.eip = next;
                self.instruction_count += retired as u64;
                Ok(true)
            }
            BlockExit::Fault { pc, error } => {
                self.regs.eip = pc;
                Err(error.into())
            }
        }
    }

    pub(crate) fn write_mem8(&mut self, bus: &dyn Bus, addr: u32, value: u8) -> Result<(), CpuError> {
        bus.write8(addr, value)?;
        self.jit.invalidate_range(addr, 1);
        Ok(())
    }

    pub(crate) fn write_mem16(&mut self, bus: &dyn Bus, addr: u32, value: u16) -> Result<(), CpuError> {
        bus.write16(addr, value)?;
        self.jit.invalidate_range(addr, 2);
        Ok(())
    }

    pub(crate) fn write_mem32(&mut self, bus: &dyn Bus, addr: u32, value: u32) -> Result<(), CpuError> {
        bus.write32(addr, value)?;
        self.jit.invalidate_range(addr, 4);
        Ok(())
    }

    pub(crate) fn write_mem64(&mut self, bus: &dyn Bus, addr: u32, value: u64) -> Result<(), CpuError> {
        bus.write64(addr, value)?;
        self.jit.invalidate_range(addr, 8);
        Ok(())
    }

    pub(crate) fn push32(&mut self, bus: &dyn Bus, value: u32) -> Result<(), CpuError> {
        let esp = self.regs.get(regs::ESP).wrapping_sub(4);
        self.write_mem32(bus, esp, value)?;
        self.regs.set(regs::ESP, esp);
        Ok(())
    }

    pub(crate) fn pop32(&mut self, bus: &dyn Bus) -> Result<u32, CpuError> {
        let esp = self.regs.get(regs::ESP);
        let value = bus.read32(esp)?;
        self.regs.set(regs::ESP, esp.wrapping_add(4));
        Ok(value)
    }

    // Breakpoints

    pub fn set_breakpoint(&mut self, addr: u32, callback: BreakpointCallback) {
        self.breakpoints.insert(addr, callback);
        // Blocks spanning the address must be rescanned so they stop there
        self.jit.invalidate_range(addr, 1);
    }

    pub fn clear_breakpoint(&mut self, addr: u32) -> bool {
        self.breakpoints.remove(&addr).is_some()
    }

    /// Leave `DebugBreak`; the breakpoint at eip is stepped over once
    pub fn resume(&mut self) {
        if self.state == CpuState::DebugBreak {
            self.skip_breakpoint = Some(self.regs.eip);
            self.state = CpuState::Running;
        }
    }

    // Syscalls and interrupts

    pub(crate) fn raise_syscall(&mut self) {
        let request = SyscallRequest {
            number: self.regs.get(regs::EAX),
            args: [
                self.regs.get(regs::EBX),
                self.regs.get(regs::ECX),
                self.regs.get(regs::EDX),
                self.regs.get(regs::ESI),
            ],
        };
        if self.tracing {
            self.emit_debug(self.regs.eip, &format!("syscall {:#x}", request.number));
        }
        self.pending_syscall = Some(request);
    }

    pub fn pending_syscall(&self) -> Option<SyscallRequest> {
        self.pending_syscall
    }

    /// Take the pending syscall; the caller writes the result with
    /// `complete_syscall`
    pub fn take_pending_syscall(&mut self) -> Option<SyscallRequest> {
        self.pending_syscall.take()
    }

    pub fn complete_syscall(&mut self, result: u32) {
        self.regs.set(regs::EAX, result);
    }

    /// Deliver an external interrupt. There is no IDT; delivery is logged
    /// and a halted CPU wakes up.
    pub fn handle_interrupt(&mut self, vector: u8) {
        debug!("interrupt {:#04x} at {:#010x}", vector, self.regs.eip);
        if self.tracing {
            self.emit_debug(self.regs.eip, &format!("interrupt {:#04x}", vector));
        }
        if self.state == CpuState::Halted {
            self.state = CpuState::Running;
        }
    }

    // Debugging

    pub fn enable_tracing(&mut self, enabled: bool) {
        self.tracing = enabled;
    }

    pub fn is_tracing(&self) -> bool {
        self.tracing
    }

    pub fn enable_jit(&mut self, enabled: bool) {
        self.config.jit_enabled = enabled;
        if !enabled {
            self.jit.flush();
        }
    }

    pub fn set_jit_threshold(&mut self, threshold: u32) {
        self.config.jit_threshold = threshold;
    }

    pub fn set_debug_callback(&mut self, callback: Option<DebugCallback>) {
        self.debug_callback = callback;
    }

    /// Send a message to the debug sink, or to the log if none is set
    pub fn emit_debug(&self, addr: u32, message: &str) {
        match &self.debug_callback {
            Some(cb) => cb(addr, message),
            None => debug!("[{:#010x}] {}", addr, message),
        }
    }

    pub fn execution_count(&self, addr: u32) -> u32 {
        self.exec_counts.get(&addr).copied().unwrap_or(0)
    }

    pub fn jit(&self) -> &Jit {
        &self.jit
    }

    /// Drop every compiled block, e.g. after a loader rewrote guest code
    pub fn flush_jit(&mut self) {
        self.jit.flush();
    }

    pub fn dump_registers(&self) -> String {
        let r = &self.regs;
        let mut out = String::new();
        for (i, name) in regs::REG_NAMES.iter().enumerate() {
            let _ = write!(out, "{}={:08x} ", name, r.gpr[i]);
            if i % 4 == 3 {
                out.push('\n');
            }
        }
        let _ = writeln!(out, "eip={:08x} eflags={:08x} state={:?}", r.eip, r.eflags, self.state);
        let _ = writeln!(
            out,
            "cs={:04x} ds={:04x} es={:04x} fs={:04x} gs={:04x} ss={:04x}",
            r.seg.cs, r.seg.ds, r.seg.es, r.seg.fs, r.seg.gs, r.seg.ss
        );
        let _ = writeln!(out, "cr0={:08x} cr2={:08x} cr3={:08x} cr4={:08x}", r.cr0, r.cr2, r.cr3, r.cr4);
        let _ = write!(
            out,
            "fpu: control={:04x} status={:04x} tag={:04x}",
            self.fpu.control, self.fpu.status, self.fpu.tag
        );
        out
    }

    pub fn dump_jit_cache(&self) -> String {
        self.jit.dump()
    }

    pub fn snapshot(&self) -> CpuSnapshot {
        CpuSnapshot {
            regs: self.regs.clone(),
            fpu: self.fpu.clone(),
            state: self.state,
            instruction_count: self.instruction_count,
        }
    }

    pub fn restore(&mut self, snapshot: CpuSnapshot) {
        self.regs = snapshot.regs;
        self.fpu = snapshot.fpu;
        self.state = snapshot.state;
        self.instruction_count = snapshot.instruction_count;
        self.exec_counts.clear();
        self.jit.flush();
        self.pending_syscall = None;
        self.skip_breakpoint = None;
        info!("CPU restored at eip={:#010x}", self.regs.eip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBus, MemoryConfig};
    use regs::{EAX, EBX, ECX, ESP, FLAG_CF, FLAG_OF, FLAG_SF, FLAG_ZF};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn setup(code: &[u8]) -> (Cpu, MemoryBus) {
        let bus = MemoryBus::new(MemoryConfig {
            ram_size: 0x10000,
            ..MemoryConfig::default()
        });
        bus.load_binary(code, 0x1000).unwrap();
        let mut cpu = Cpu::new(CpuConfig {
            jit_enabled: false,
            ..CpuConfig::default()
        });
        cpu.regs.eip = 0x1000;
        cpu.regs.set(ESP, 0x8000);
        (cpu, bus)
    }

    #[test]
    fn test_reset_state() {
        let cpu = Cpu::default();
        assert_eq!(cpu.regs.eip, regs::RESET_EIP);
        assert_eq!(cpu.regs.eflags, regs::RESET_EFLAGS);
        assert_eq!(cpu.regs.seg.cs, regs::RESET_CS);
        assert_eq!(cpu.fpu.control, 0x037F);
        assert_eq!(cpu.state(), CpuState::Running);
    }

    #[test]
    fn test_add_flags_through_interpreter() {
        // mov eax, 0x7fffffff; add eax, 1
        let (mut cpu, bus) = setup(&[0xB8, 0xFF, 0xFF, 0xFF, 0x7F, 0x83, 0xC0, 0x01]);
        cpu.execute(2, &bus).unwrap();
        assert_eq!(cpu.regs.get(EAX), 0x8000_0000);
        assert!(cpu.regs.flag(FLAG_OF));
        assert!(cpu.regs.flag(FLAG_SF));
        assert!(!cpu.regs.flag(FLAG_ZF));
        assert!(!cpu.regs.flag(FLAG_CF));
    }

    #[test]
    fn test_invalid_opcode_sets_error() {
        let (mut cpu, bus) = setup(&[0x90, 0x0E]);
        let err = cpu.execute(10, &bus).unwrap_err();
        assert!(matches!(err, CpuError::InvalidOpcode { addr: 0x1001, opcode: 0x0E }));
        assert_eq!(cpu.state(), CpuState::Error);
        assert_eq!(cpu.regs.eip, 0x1001);
        // Other states make stepping a no-op
        cpu.execute_step(&bus).unwrap();
        assert_eq!(cpu.regs.eip, 0x1001);
    }

    #[test]
    fn test_faulting_movups_writes_nothing() {
        // movups [eax], xmm0 with the last lane past the end of RAM
        let (mut cpu, bus) = setup(&[0x0F, 0x11, 0x00]);
        cpu.regs.set(EAX, 0x10000 - 12);
        cpu.regs.xmm[0] = regs::Xmm([0x1111_1111, 0x2222_2222, 0x3333_3333, 0x4444_4444]);
        let err = cpu.execute(1, &bus).unwrap_err();
        assert!(matches!(err, CpuError::Bus(BusError::Unmapped { .. })));
        assert_eq!(cpu.regs.eip, 0x1000);
        assert_eq!(bus.read_bytes(0x10000 - 12, 12).unwrap(), vec![0u8; 12]);
    }

    #[test]
    fn test_breakpoint_and_resume() {
        let (mut cpu, bus) = setup(&[0x90, 0x90, 0x90]);
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        cpu.set_breakpoint(
            0x1001,
            Box::new(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );
        cpu.execute(10, &bus).unwrap();
        assert_eq!(cpu.state(), CpuState::DebugBreak);
        assert_eq!(cpu.regs.eip, 0x1001);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        cpu.resume();
        cpu.execute(2, &bus).unwrap();
        assert_eq!(cpu.regs.eip, 0x1003);
        assert!(cpu.clear_breakpoint(0x1001));
    }

    #[test]
    fn test_syscall_stops_execute() {
        // mov eax, 2; xbox syscall; nop
        let (mut cpu, bus) = setup(&[0xB8, 0x02, 0, 0, 0, 0x0F, 0x3F, 0x01, 0x90]);
        cpu.regs.set(EBX, 0x2000);
        let steps = cpu.execute(100, &bus).unwrap();
        assert_eq!(steps, 2);
        let req = cpu.take_pending_syscall().unwrap();
        assert_eq!(req.number, 2);
        assert_eq!(req.args[0], 0x2000);
        cpu.complete_syscall(0x1234);
        assert_eq!(cpu.regs.get(EAX), 0x1234);
        assert_eq!(cpu.regs.eip, 0x1008);
    }

    #[test]
    fn test_jit_takes_over_hot_loop() {
        // loop: add eax, ecx; jmp loop
        let (mut cpu, bus) = setup(&[0x01, 0xC8, 0xEB, 0xFC]);
        cpu.enable_jit(true);
        cpu.set_jit_threshold(2);
        cpu.regs.set(ECX, 1);
        cpu.execute(40, &bus).unwrap();
        assert!(cpu.jit().contains(0x1000));
        assert!(cpu.jit().stats.hits > 0);
        // Every loop iteration adds one regardless of which path ran it
        let iterations = cpu.execution_count(0x1000);
        assert_eq!(cpu.regs.get(EAX), iterations);
    }

    #[test]
    fn test_store_invalidates_compiled_block() {
        // 0x1000: mov [ebx], eax ; ret
        let (mut cpu, bus) = setup(&[0x89, 0x03, 0xC3]);
        cpu.enable_jit(true);
        cpu.jit.compile(&bus, 0x1000, |_| false).unwrap();
        assert!(cpu.jit().contains(0x1000));
        cpu.write_mem32(&bus, 0x1000, 0x9090_9090).unwrap();
        assert!(!cpu.jit().contains(0x1000));
    }

    #[test]
    fn test_debug_callback_receives_breakpoint() {
        let (mut cpu, bus) = setup(&[0x90]);
        let seen = Arc::new(AtomicU32::new(0));
        let s = seen.clone();
        cpu.set_debug_callback(Some(Box::new(move |addr, _msg| {
            s.store(addr, Ordering::SeqCst);
        })));
        cpu.set_breakpoint(0x1000, Box::new(|_| {}));
        cpu.execute_step(&bus).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 0x1000);
        assert!(cpu.dump_registers().contains("eip=00001000"));
    }
}
