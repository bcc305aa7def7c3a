//! High-level kernel emulation
//!
//! Owns guest memory allocation, the executable loader, a thread table and
//! the syscall table reached through the `0F 3F 01` escape. Threads are
//! bookkeeping only; there is a single CPU core and no guest scheduler.

pub mod allocator;
pub mod xbe;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::memory::{Bus, BusError, MemoryBus};
pub use allocator::{Allocator, MemoryBlock, ALLOC_FAILED, PAGE_SIZE};
use xbe::{XbeError, XbeImage};

/// Returned in eax for unknown or failed syscalls
pub const SYSCALL_ERROR: u32 = 0xFFFF_FFFF;
pub const MAX_THREADS: usize = 256;
const DEBUG_PRINT_MAX: u32 = 1024;

pub const SYSCALL_DEBUG_PRINT: u32 = 0x0001;
pub const SYSCALL_ALLOCATE_MEMORY: u32 = 0x0002;
pub const SYSCALL_FREE_MEMORY: u32 = 0x0003;
pub const SYSCALL_CREATE_THREAD: u32 = 0x0004;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("invalid executable: {0}")]
    Xbe(#[from] XbeError),
    #[error("no memory for section {section} ({size:#x} bytes at {addr:#010x})")]
    Alloc { section: usize, addr: u32, size: u32 },
    #[error("bus error while copying section: {0}")]
    Bus(#[from] BusError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadStatus {
    Ready,
    Running,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Thread {
    pub id: u32,
    pub entry_point: u32,
    pub stack_pointer: u32,
    /// Stack block owned by the kernel, freed on termination
    pub stack_base: Option<u32>,
    pub priority: u8,
    pub status: ThreadStatus,
}

type SyscallFn = fn(&mut Kernel, [u32; 4], &dyn Bus) -> u32;

struct Syscall {
    name: &'static str,
    handler: SyscallFn,
}

/// A loaded executable's placement in guest memory
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LoadedImage {
    pub entry_point: u32,
    pub section_addrs: Vec<u32>,
}

/// Kernel bookkeeping carried in a save state
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KernelSnapshot {
    pub allocator: Allocator,
    pub threads: Vec<Thread>,
    pub next_thread_id: u32,
    pub image: Option<LoadedImage>,
}

pub struct Kernel {
    allocator: Allocator,
    syscalls: HashMap<u32, Syscall>,
    threads: Vec<Thread>,
    next_thread_id: u32,
    image: Option<LoadedImage>,
    debug_output: Option<Box<dyn Fn(&str) + Send>>,
}

impl Kernel {
    /// Create a kernel whose allocator covers the RAM-backed ranges:
    /// a low reserved window at 64 KiB and main memory from 1 MiB to the end of RAM.
    pub fn new(ram_size: u32) -> Self {
        let mut allocator = Allocator::with_ranges(&[(0x0001_0000, 0x0001_0000, "Reserved")]);
        if ram_size > 0x0010_0000 {
            allocator.add_range(0x0010_0000, ram_size - 0x0010_0000, "Main Memory");
        }
        Self::with_allocator(allocator)
    }

    pub fn with_allocator(allocator: Allocator) -> Self {
        let mut kernel = Kernel {
            allocator,
            syscalls: HashMap::new(),
            threads: Vec::new(),
            next_thread_id: 1,
            image: None,
            debug_output: None,
        };
        kernel.register_syscalls();
        kernel.threads.push(Thread {
            id: kernel.next_thread_id,
            entry_point: 0,
            stack_pointer: 0,
            stack_base: None,
            priority: 8,
            status: ThreadStatus::Running,
        });
        kernel.next_thread_id += 1;
        kernel
    }

    fn register_syscalls(&mut self) {
        let table: [(u32, &'static str, SyscallFn); 4] = [
            (SYSCALL_DEBUG_PRINT, "DebugPrint", sys_debug_print),
            (SYSCALL_ALLOCATE_MEMORY, "AllocateMemory", sys_allocate_memory),
            (SYSCALL_FREE_MEMORY, "FreeMemory", sys_free_memory),
            (SYSCALL_CREATE_THREAD, "CreateThread", sys_create_thread),
        ];
        for (id, name, handler) in table {
            self.syscalls.insert(id, Syscall { name, handler });
        }
    }

    pub fn set_debug_output(&mut self, callback: Option<Box<dyn Fn(&str) + Send>>) {
        self.debug_output = callback;
    }

    /// Dispatch a syscall. Arguments come from ebx, ecx, edx, esi; the
    /// result goes back in eax.
    pub fn handle_syscall(&mut self, call: u32, args: [u32; 4], bus: &dyn Bus) -> u32 {
        match self.syscalls.get(&call) {
            Some(sc) => {
                info!(
                    "Syscall {} ({:#06x}) args: {:#010x}, {:#010x}, {:#010x}, {:#010x}",
                    sc.name, call, args[0], args[1], args[2], args[3]
                );
                let handler = sc.handler;
                handler(self, args, bus)
            }
            None => {
                error!("Unknown syscall: {:#06x} args={:08x?}", call, args);
                SYSCALL_ERROR
            }
        }
    }

    pub fn syscall_name(&self, call: u32) -> Option<&'static str> {
        self.syscalls.get(&call).map(|s| s.name)
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    pub fn allocate_memory(&mut self, size: u32, alignment: u32, purpose: &str) -> u32 {
        self.allocator
            .allocate(size, alignment, purpose)
            .unwrap_or(ALLOC_FAILED)
    }

    pub fn free_memory(&mut self, address: u32) -> bool {
        self.allocator.deallocate(address)
    }

    /// Allocate a stack and register a ready thread. Returns the thread id, 0 on failure.
    pub fn create_thread(&mut self, entry_point: u32, stack_size: u32) -> u32 {
        if self.threads.len() >= MAX_THREADS {
            error!("Thread limit reached ({})", MAX_THREADS);
            return 0;
        }
        let Some(stack) = self.allocator.allocate(stack_size, PAGE_SIZE, "Thread Stack") else {
            error!("Failed to allocate thread stack");
            return 0;
        };
        let size = self.allocator.allocation_size(stack).unwrap_or(stack_size);
        self.push_thread(entry_point, stack + size - 4, Some(stack), 8)
    }

    fn push_thread(&mut self, entry_point: u32, stack_pointer: u32, stack_base: Option<u32>, priority: u8) -> u32 {
        let id = self.next_thread_id;
        self.next_thread_id += 1;
        self.threads.push(Thread {
            id,
            entry_point,
            stack_pointer,
            stack_base,
            priority,
            status: ThreadStatus::Ready,
        });
        id
    }

    /// Remove a thread and free its kernel-owned stack
    pub fn terminate_thread(&mut self, id: u32) -> bool {
        let Some(pos) = self.threads.iter().position(|t| t.id == id) else {
            return false;
        };
        let thread = self.threads.remove(pos);
        if let Some(stack) = thread.stack_base {
            self.allocator.deallocate(stack);
        }
        true
    }

    pub fn threads(&self) -> &[Thread] {
        &self.threads
    }

    /// Parse an executable, claim memory for each loadable section and copy
    /// it into RAM. Sections are placed at their declared virtual address;
    /// if that range is taken they are relocated by first-fit allocation.
    /// Returns the entry point.
    pub fn load_xbe(&mut self, bus: &MemoryBus, data: &[u8]) -> Result<u32, LoadError> {
        let image = XbeImage::parse(data)?;
        self.unload_xbe();

        let mut loaded = LoadedImage {
            entry_point: image.entry_point(),
            section_addrs: Vec::new(),
        };
        for (index, section) in image.sections.iter().enumerate() {
            if !section.is_loaded() || section.virtual_size == 0 {
                continue;
            }
            let page_base = section.virtual_addr & !(PAGE_SIZE - 1);
            let page_offset = section.virtual_addr & (PAGE_SIZE - 1);
            let addr = match self
                .allocator
                .allocate_at(page_base, page_offset + section.virtual_size, "XBE Section")
            {
                Some(base) => base + page_offset,
                None => match self.allocator.allocate(section.virtual_size, PAGE_SIZE, "XBE Section") {
                    Some(relocated) => {
                        warn!(
                            "Section {} relocated from {:#010x} to {:#010x}",
                            index, section.virtual_addr, relocated
                        );
                        relocated
                    }
                    None => {
                        self.release_sections(&loaded.section_addrs);
                        return Err(LoadError::Alloc {
                            section: index,
                            addr: section.virtual_addr,
                            size: section.virtual_size,
                        });
                    }
                },
            };
            loaded.section_addrs.push(addr);

            let raw = image.section_data(section);
            let mut bytes = Vec::with_capacity(section.virtual_size as usize);
            bytes.extend_from_slice(raw);
            bytes.resize(section.virtual_size as usize, 0);
            if let Err(e) = bus.load_binary(&bytes, addr) {
                self.release_sections(&loaded.section_addrs);
                return Err(e.into());
            }
            info!(
                "Loaded section {}: VA={:#010x}, Size={} bytes, Flags={:#010x}",
                index, addr, section.virtual_size, section.flags
            );
        }

        let entry = loaded.entry_point;
        info!("XBE loaded, {} sections, entry {:#010x}", loaded.section_addrs.len(), entry);
        self.image = Some(loaded);
        Ok(entry)
    }

    /// Release the memory of the loaded executable, if any
    pub fn unload_xbe(&mut self) {
        if let Some(image) = self.image.take() {
            self.release_sections(&image.section_addrs);
        }
    }

    fn release_sections(&mut self, addrs: &[u32]) {
        for &addr in addrs {
            self.allocator.deallocate(addr & !(PAGE_SIZE - 1));
        }
    }

    pub fn loaded_image(&self) -> Option<&LoadedImage> {
        self.image.as_ref()
    }

    pub fn snapshot(&self) -> KernelSnapshot {
        KernelSnapshot {
            allocator: self.allocator.clone(),
            threads: self.threads.clone(),
            next_thread_id: self.next_thread_id,
            image: self.image.clone(),
        }
    }

    pub fn restore(&mut self, snapshot: KernelSnapshot) {
        self.allocator = snapshot.allocator;
        self.threads = snapshot.threads;
        self.next_thread_id = snapshot.next_thread_id;
        self.image = snapshot.image;
    }
}

fn sys_debug_print(kernel: &mut Kernel, args: [u32; 4], bus: &dyn Bus) -> u32 {
    let mut bytes = Vec::new();
    for i in 0..DEBUG_PRINT_MAX {
        match bus.read8(args[0].wrapping_add(i)) {
            Ok(0) => break,
            Ok(b) => bytes.push(b),
            Err(e) => {
                warn!("DebugPrint string unreadable: {}", e);
                return SYSCALL_ERROR;
            }
        }
    }
    let message = String::from_utf8_lossy(&bytes);
    if let Some(out) = &kernel.debug_output {
        out(&message);
    }
    info!("Xbox Debug: {}", message);
    0
}

fn sys_allocate_memory(kernel: &mut Kernel, args: [u32; 4], _bus: &dyn Bus) -> u32 {
    kernel.allocate_memory(args[0], args[1], "Syscall Allocation")
}

fn sys_free_memory(kernel: &mut Kernel, args: [u32; 4], _bus: &dyn Bus) -> u32 {
    if kernel.free_memory(args[0]) {
        0
    } else {
        SYSCALL_ERROR
    }
}

/// Register a thread with a caller-provided stack: (entry, stack pointer, priority)
fn sys_create_thread(kernel: &mut Kernel, args: [u32; 4], _bus: &dyn Bus) -> u32 {
    if kernel.threads.len() >= MAX_THREADS {
        error!("Thread limit reached");
        return 0;
    }
    kernel.push_thread(args[0], args[1], None, (args[2] & 0xF) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConfig;

    fn setup() -> (Kernel, MemoryBus) {
        let bus = MemoryBus::new(MemoryConfig {
            ram_size: 4 * 1024 * 1024,
            ..MemoryConfig::default()
        });
        (Kernel::new(4 * 1024 * 1024), bus)
    }

    #[test]
    fn test_allocate_and_free_syscalls() {
        let (mut kernel, bus) = setup();
        let addr = kernel.handle_syscall(SYSCALL_ALLOCATE_MEMORY, [0x2000, 0, 0, 0], &bus);
        assert_ne!(addr, ALLOC_FAILED);
        assert_eq!(kernel.handle_syscall(SYSCALL_FREE_MEMORY, [addr, 0, 0, 0], &bus), 0);
        assert_eq!(
            kernel.handle_syscall(SYSCALL_FREE_MEMORY, [addr, 0, 0, 0], &bus),
            SYSCALL_ERROR
        );
    }

    #[test]
    fn test_unknown_syscall() {
        let (mut kernel, bus) = setup();
        assert_eq!(kernel.handle_syscall(0x99, [0; 4], &bus), SYSCALL_ERROR);
        assert_eq!(kernel.syscall_name(SYSCALL_DEBUG_PRINT), Some("DebugPrint"));
    }

    #[test]
    fn test_debug_print_reads_guest_string() {
        let (mut kernel, bus) = setup();
        bus.load_binary(b"hello\0", 0x2000).unwrap();
        let seen = std::sync::Arc::new(std::sync::Mutex::new(String::new()));
        let sink = seen.clone();
        kernel.set_debug_output(Some(Box::new(move |m| *sink.lock().unwrap() = m.to_string())));
        assert_eq!(kernel.handle_syscall(SYSCALL_DEBUG_PRINT, [0x2000, 0, 0, 0], &bus), 0);
        assert_eq!(&*seen.lock().unwrap(), "hello");
    }

    #[test]
    fn test_threads() {
        let (mut kernel, bus) = setup();
        let before = kernel.allocator().allocated_bytes();
        let tid = kernel.create_thread(0x11000, 0x4000);
        assert_eq!(tid, 2);
        let thread = &kernel.threads()[1];
        assert_eq!(thread.stack_pointer, thread.stack_base.unwrap() + 0x4000 - 4);
        assert!(kernel.terminate_thread(tid));
        assert_eq!(kernel.allocator().allocated_bytes(), before);

        let tid = kernel.handle_syscall(SYSCALL_CREATE_THREAD, [0x11000, 0x8000, 0x13, 0], &bus);
        assert_eq!(tid, 3);
        assert_eq!(kernel.threads()[1].priority, 3);
    }

    #[test]
    fn test_load_xbe_places_sections() {
        let (mut kernel, bus) = setup();
        let code = [0x90u8, 0xC3];
        let image = xbe::build_image(0x10000, 0x1000, &[(0x11000, &code, 0x10)]);
        let entry = kernel.load_xbe(&bus, &image).unwrap();
        assert_eq!(entry, 0x11000);
        assert_eq!(bus.read8(0x11000).unwrap(), 0x90);
        assert_eq!(bus.read8(0x11001).unwrap(), 0xC3);
        assert_eq!(bus.read8(0x11002).unwrap(), 0);
        assert_eq!(kernel.loaded_image().unwrap().section_addrs, vec![0x11000]);

        // Reloading frees the previous placement first
        kernel.load_xbe(&bus, &image).unwrap();
        assert_eq!(kernel.loaded_image().unwrap().section_addrs, vec![0x11000]);
    }

    #[test]
    fn test_load_xbe_rejects_bad_image() {
        let (mut kernel, bus) = setup();
        assert!(matches!(kernel.load_xbe(&bus, b"nope"), Err(LoadError::Xbe(_))));
    }
}
