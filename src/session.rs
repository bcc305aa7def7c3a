//! Emulator session
//!
//! Brings together the memory bus, CPU, GPU, APU window and HLE kernel.
//! A frame delivers pending input, runs the CPU for the configured number
//! of steps while servicing syscalls, and then waits for the GPU to finish
//! whatever the CPU kicked.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cpu::{regs, Cpu, CpuConfig, CpuError, CpuState};
use crate::devices::{Apu, GpuConfig, GpuCore};
use crate::input::{InputEvent, InputQueue, InputSender};
use crate::kernel::{Kernel, LoadError, ALLOC_FAILED, PAGE_SIZE};
use crate::memory::{BusError, MemoryBus, MemoryConfig, APU_BASE, APU_SIZE, GPU_BASE, GPU_SIZE};
use crate::snapshot::{self, Snapshot, SnapshotError};

/// Stack given to the executable's main thread
pub const MAIN_STACK_SIZE: u32 = 256 * 1024;
pub const DEFAULT_CYCLES_PER_FRAME: u32 = 100_000;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Cpu(#[from] CpuError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error("no memory for the main thread stack")]
    Stack,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionConfig {
    pub memory: MemoryConfig,
    pub cpu: CpuConfig,
    pub gpu: GpuConfig,
    /// CPU steps per frame
    pub cycles_per_frame: u32,
    /// Stop `run` after this many frames in total
    pub frame_limit: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            memory: MemoryConfig::default(),
            cpu: CpuConfig::default(),
            gpu: GpuConfig::default(),
            cycles_per_frame: DEFAULT_CYCLES_PER_FRAME,
            frame_limit: None,
        }
    }
}

/// What one frame did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameReport {
    pub steps: u32,
    pub syscalls: u32,
    pub interrupts: u32,
    pub cpu_state: CpuState,
}

pub struct EmulatorSession {
    config: SessionConfig,
    bus: Arc<MemoryBus>,
    cpu: Cpu,
    gpu: GpuCore,
    apu: Arc<Apu>,
    kernel: Kernel,
    input: InputQueue,
    frame: u64,
}

impl EmulatorSession {
    pub fn new(config: SessionConfig) -> Result<Self, SessionError> {
        let bus = Arc::new(MemoryBus::new(config.memory.clone()));
        let gpu = GpuCore::new(config.gpu.clone(), Some(bus.clone()));
        bus.map_region(GPU_BASE, GPU_SIZE, gpu.mmio_handler())?;
        let apu = Arc::new(Apu::new());
        bus.map_region(APU_BASE, APU_SIZE, apu.clone())?;

        let kernel = Kernel::new(bus.ram_size());
        let cpu = Cpu::new(config.cpu.clone());
        info!(
            "session ready: {} MiB RAM, {}x{} framebuffer, jit {}",
            bus.ram_size() / (1024 * 1024),
            config.gpu.width,
            config.gpu.height,
            if config.cpu.jit_enabled { "on" } else { "off" }
        );
        Ok(EmulatorSession {
            config,
            bus,
            cpu,
            gpu,
            apu,
            kernel,
            input: InputQueue::new(),
            frame: 0,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<MemoryBus> {
        &self.bus
    }

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut Cpu {
        &mut self.cpu
    }

    pub fn gpu(&self) -> &GpuCore {
        &self.gpu
    }

    pub fn apu(&self) -> &Apu {
        &self.apu
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut Kernel {
        &mut self.kernel
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    // Loading

    /// Load a BIOS image file; it must be exactly the configured BIOS size
    pub fn load_bios(&mut self, path: impl AsRef<Path>) -> bool {
        let ok = self.bus.load_bios(path);
        if ok {
            self.cpu.flush_jit();
        }
        ok
    }

    pub fn load_bios_bytes(&mut self, data: &[u8]) -> Result<(), SessionError> {
        self.bus.load_bios_bytes(data)?;
        self.cpu.flush_jit();
        Ok(())
    }

    /// Load an executable, give it a stack and point the CPU at its entry.
    /// Returns the entry point.
    pub fn load_xbe(&mut self, data: &[u8]) -> Result<u32, SessionError> {
        let entry = self.kernel.load_xbe(&self.bus, data)?;
        let stack = self.kernel.allocate_memory(MAIN_STACK_SIZE, PAGE_SIZE, "Main Stack");
        if stack == ALLOC_FAILED {
            self.kernel.unload_xbe();
            return Err(SessionError::Stack);
        }
        self.cpu.flush_jit();
        self.cpu.regs.eip = entry;
        self.cpu.regs.set(regs::ESP, stack + MAIN_STACK_SIZE);
        self.cpu.set_state(CpuState::Running);
        info!("executable entry {:#010x}, stack top {:#010x}", entry, stack + MAIN_STACK_SIZE);
        Ok(entry)
    }

    /// Copy raw code into RAM; the JIT is flushed
    pub fn load_binary(&mut self, data: &[u8], addr: u32) -> Result<(), SessionError> {
        self.bus.load_binary(data, addr)?;
        self.cpu.flush_jit();
        Ok(())
    }

    // Input

    pub fn input_sender(&self) -> InputSender {
        self.input.sender()
    }

    pub fn push_input(&self, event: InputEvent) {
        self.input.push(event);
    }

    fn deliver_input(&mut self) -> u32 {
        let events = self.input.drain();
        for event in &events {
            self.cpu.handle_interrupt(event.vector());
        }
        events.len() as u32
    }

    // Execution

    /// Run one frame
    pub fn run_frame(&mut self) -> Result<FrameReport, SessionError> {
        let interrupts = self.deliver_input();
        let mut remaining = self.config.cycles_per_frame;
        let mut steps = 0;
        let mut syscalls = 0;

        while remaining > 0 && self.cpu.state() == CpuState::Running {
            let done = self.cpu.execute(remaining, &*self.bus)?;
            remaining -= done;
            steps += done;
            match self.cpu.take_pending_syscall() {
                Some(request) => {
                    let result = self.kernel.handle_syscall(request.number, request.args, &*self.bus);
                    self.cpu.complete_syscall(result);
                    syscalls += 1;
                }
                None if done == 0 => break,
                None => {}
            }
        }

        self.gpu.sync();
        self.frame += 1;
        debug!(frame = self.frame, steps, syscalls, "frame done");
        Ok(FrameReport {
            steps,
            syscalls,
            interrupts,
            cpu_state: self.cpu.state(),
        })
    }

    /// Run up to `frames` frames; stops early at the frame limit or when
    /// the CPU hits an error or breakpoint. A halted CPU keeps frames
    /// ticking so input can wake it. Returns the frames run.
    pub fn run(&mut self, frames: u64) -> Result<u64, SessionError> {
        let mut ran = 0;
        while ran < frames {
            if let Some(limit) = self.config.frame_limit {
                if self.frame >= limit {
                    info!("frame limit {} reached", limit);
                    break;
                }
            }
            if matches!(self.cpu.state(), CpuState::Error | CpuState::DebugBreak) {
                break;
            }
            self.run_frame()?;
            ran += 1;
        }
        Ok(ran)
    }

    /// Power-on reset: RAM cleared, CPU and GPU reset, kernel rebuilt.
    /// BIOS contents and mapped regions persist.
    pub fn reset(&mut self) {
        self.bus.reset();
        self.cpu.reset();
        self.gpu.reset();
        self.apu.reset();
        self.kernel = Kernel::new(self.bus.ram_size());
        self.input.drain();
        self.frame = 0;
        info!("session reset");
    }

    // Presentation

    pub fn framebuffer(&self) -> Vec<u32> {
        self.gpu.framebuffer()
    }

    pub fn framebuffer_size(&self) -> (u32, u32) {
        (self.gpu.width(), self.gpu.height())
    }

    // Save states

    pub fn save_state(&self) -> Snapshot {
        self.gpu.sync();
        Snapshot {
            version: Snapshot::VERSION,
            ram_size: self.bus.ram_size(),
            cpu: self.cpu.snapshot(),
            kernel: self.kernel.snapshot(),
            ram_pages: self.bus.with_ram(snapshot::capture_pages),
            gpu: self.gpu.snapshot(),
            apu: self.apu.snapshot(),
            frame: self.frame,
        }
    }

    pub fn restore_state(&mut self, state: &Snapshot) -> Result<(), SessionError> {
        if state.ram_size != self.bus.ram_size() {
            return Err(SnapshotError::RamSize {
                expected: self.bus.ram_size(),
                found: state.ram_size,
            }
            .into());
        }
        if !self.gpu.restore(&state.gpu) {
            return Err(SnapshotError::Gpu.into());
        }
        self.bus.with_ram_mut(|ram| snapshot::apply_pages(ram, &state.ram_pages));
        self.apu.restore(&state.apu);
        self.kernel.restore(state.kernel.clone());
        self.cpu.restore(state.cpu.clone());
        self.frame = state.frame;
        self.input.drain();
        Ok(())
    }

    pub fn save_state_to(&self, path: impl AsRef<Path>) -> Result<(), SessionError> {
        self.save_state().save(path)?;
        Ok(())
    }

    pub fn load_state_from(&mut self, path: impl AsRef<Path>) -> Result<(), SessionError> {
        let state = Snapshot::load(path)?;
        self.restore_state(&state)
    }
}

impl Drop for EmulatorSession {
    fn drop(&mut self) {
        // The worker holds the bus; stop it before the regions go away
        self.gpu.shutdown();
        if self.cpu.state() == CpuState::Error {
            warn!("session closed with the CPU in error state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::nv2a::renderer::REG_PUT;
    use crate::memory::Bus;
    use crate::input::InputAction;
    use crate::kernel::SYSCALL_ALLOCATE_MEMORY;

    fn small_config() -> SessionConfig {
        SessionConfig {
            memory: MemoryConfig {
                ram_size: 4 * 1024 * 1024,
                ..MemoryConfig::default()
            },
            gpu: GpuConfig {
                width: 8,
                height: 8,
                texture_memory: 0x1000,
                vsync: false,
                queue_depth: 64,
                ..GpuConfig::default()
            },
            cycles_per_frame: 64,
            ..SessionConfig::default()
        }
    }

    #[test]
    fn test_boot_from_zero_bios() {
        let mut s = EmulatorSession::new(small_config()).unwrap();
        s.load_bios_bytes(&vec![0u8; 1024 * 1024]).unwrap();
        assert_eq!(s.cpu().regs.eip, 0xFF00_0000);
        let bus = s.bus().clone();
        s.cpu_mut().execute_step(&*bus).unwrap();
        assert_eq!(s.cpu().regs.eip, 0xFF00_0004);
        assert_eq!(s.cpu().state(), CpuState::Running);
    }

    #[test]
    fn test_syscall_serviced_within_frame() {
        let mut s = EmulatorSession::new(small_config()).unwrap();
        let code = [
            0xB8, 0x02, 0x00, 0x00, 0x00, // mov eax, AllocateMemory
            0xBB, 0x00, 0x20, 0x00, 0x00, // mov ebx, 0x2000
            0xB9, 0x00, 0x10, 0x00, 0x00, // mov ecx, 0x1000
            0x0F, 0x3F, 0x01, // syscall
            0xF4, // hlt
        ];
        s.load_binary(&code, 0x1000).unwrap();
        s.cpu_mut().regs.eip = 0x1000;
        let report = s.run_frame().unwrap();
        assert_eq!(report.syscalls, 1);
        assert_eq!(report.cpu_state, CpuState::Halted);
        let addr = s.cpu().regs.get(regs::EAX);
        assert_ne!(addr, ALLOC_FAILED);
        assert_eq!(s.kernel().allocator().allocation_size(addr), Some(0x2000));
        assert_eq!(SYSCALL_ALLOCATE_MEMORY, 2);
    }

    #[test]
    fn test_input_wakes_halted_cpu() {
        let mut s = EmulatorSession::new(small_config()).unwrap();
        s.load_binary(&[0xF4, 0xF4], 0x1000).unwrap();
        s.cpu_mut().regs.eip = 0x1000;
        s.run_frame().unwrap();
        assert_eq!(s.cpu().state(), CpuState::Halted);

        s.input_sender().send(InputEvent::key(1, InputAction::Press));
        let report = s.run_frame().unwrap();
        assert_eq!(report.interrupts, 1);
        assert_eq!(s.cpu().regs.eip, 0x1002);
    }

    #[test]
    fn test_gpu_window_reachable_from_bus() {
        let s = EmulatorSession::new(small_config()).unwrap();
        s.bus().write32(GPU_BASE + 0x4242 * 4, 9).unwrap();
        s.gpu().sync();
        assert_eq!(s.bus().read32(GPU_BASE + 0x4242 * 4).unwrap(), 9);
        s.bus().write32(GPU_BASE + REG_PUT * 4, 0).unwrap();
        s.gpu().sync();
        assert_eq!(s.gpu().frame_count(), 1);
        s.bus().write32(APU_BASE + 8, 3).unwrap();
        assert_eq!(s.apu().access_count(), 1);
    }

    #[test]
    fn test_ram_size_mismatch_rejected() {
        let s = EmulatorSession::new(small_config()).unwrap();
        let mut state = s.save_state();
        state.ram_size *= 2;
        let mut other = EmulatorSession::new(small_config()).unwrap();
        assert!(matches!(
            other.restore_state(&state),
            Err(SessionError::Snapshot(SnapshotError::RamSize { .. }))
        ));
    }
}
