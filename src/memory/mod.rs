//! Memory subsystem with memory-mapped I/O
//!
//! Physical memory layout:
//! 0x00000000 - 0x07FFFFFF: RAM (128 MiB by default)
//! 0x80000000 - ...:        PCI space (unmapped unless a region is added)
//! 0xFD000000 - 0xFDFFFFFF: GPU register window
//! 0xFE000000 - 0xFEFFFFFF: APU register window
//! 0xFF000000 - 0xFF0FFFFF: BIOS ROM (1 MiB)
//!
//! Lookup order for every access is cache -> RAM -> BIOS -> mapped regions.
//! All state sits behind one mutex; region handlers are called after that
//! lock is released, so a handler may itself touch the bus (the GPU worker
//! reads RAM for texture uploads while the CPU is blocked writing its FIFO).

mod cache;

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use cache::CacheSet;

pub const RAM_BASE: u32 = 0x0000_0000;
pub const RAM_SIZE: u32 = 128 * 1024 * 1024;
pub const BIOS_BASE: u32 = 0xFF00_0000;
pub const BIOS_SIZE: u32 = 1024 * 1024;
pub const GPU_BASE: u32 = 0xFD00_0000;
pub const GPU_SIZE: u32 = 0x0100_0000;
pub const APU_BASE: u32 = 0xFE00_0000;
pub const APU_SIZE: u32 = 0x0100_0000;
pub const PCI_BASE: u32 = 0x8000_0000;

pub const CACHE_BLOCK_SIZE: u32 = 64 * 1024;
pub const CACHE_BLOCK_COUNT: usize = 8;

/// Errors raised by bus accesses and bus management calls
#[derive(Debug, Error)]
pub enum BusError {
    #[error("access violation: {width}-byte access to unmapped address {addr:#010x}")]
    Unmapped { addr: u32, width: u8 },
    #[error("unaligned {width}-byte access at {addr:#010x}")]
    Misaligned { addr: u32, width: u8 },
    #[error("write to read-only BIOS at {addr:#010x}")]
    ReadOnly { addr: u32 },
    #[error("region {base:#010x}+{size:#x} overlaps an existing mapping")]
    Overlap { base: u32, size: u32 },
    #[error("invalid region {base:#010x}+{size:#x}")]
    InvalidRegion { base: u32, size: u32 },
    #[error("BIOS image must be exactly {expected} bytes, got {found}")]
    BiosSize { expected: usize, found: usize },
    #[error("cache block index {0} out of range")]
    CacheIndex(usize),
    #[error("cache window {0:#010x} is not inside RAM")]
    CacheRange(u32),
    #[error("cache window {0:#010x} is not aligned to the block size")]
    CacheAlign(u32),
    #[error("cache window {0:#010x} overlaps another bound block")]
    CacheOverlap(u32),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sizes of the fixed memories
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub ram_size: u32,
    pub bios_size: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            ram_size: RAM_SIZE,
            bios_size: BIOS_SIZE,
        }
    }
}

/// Bus interface for CPU memory access
pub trait Bus: Send + Sync {
    fn read8(&self, addr: u32) -> Result<u8, BusError>;
    fn read16(&self, addr: u32) -> Result<u16, BusError>;
    fn read32(&self, addr: u32) -> Result<u32, BusError>;
    fn read64(&self, addr: u32) -> Result<u64, BusError>;
    fn write8(&self, addr: u32, value: u8) -> Result<(), BusError>;
    fn write16(&self, addr: u32, value: u16) -> Result<(), BusError>;
    fn write32(&self, addr: u32, value: u32) -> Result<(), BusError>;
    fn write64(&self, addr: u32, value: u64) -> Result<(), BusError>;

    /// Check that every dword of `[addr, addr + len)` would accept a write,
    /// without writing. Lets multi-part stores fail before touching memory.
    fn check_writable(&self, _addr: u32, _len: u32) -> Result<(), BusError> {
        Ok(())
    }
}

/// Trait for memory-mapped devices.
///
/// Offsets are relative to the region base. Narrow reads truncate the
/// 32-bit value; narrow writes are merged into the current word first.
/// The bus serializes writes per region, so the merge never loses a
/// concurrent write to the same region.
pub trait MmioHandler: Send + Sync {
    fn read32(&self, offset: u32) -> u32;
    fn write32(&self, offset: u32, value: u32);
}

/// Adapter turning a pair of closures into a region handler
pub struct FnHandler<R, W> {
    read: R,
    write: W,
}

impl<R, W> FnHandler<R, W>
where
    R: Fn(u32) -> u32 + Send + Sync,
    W: Fn(u32, u32) + Send + Sync,
{
    pub fn new(read: R, write: W) -> Self {
        FnHandler { read, write }
    }
}

impl<R, W> MmioHandler for FnHandler<R, W>
where
    R: Fn(u32) -> u32 + Send + Sync,
    W: Fn(u32, u32) + Send + Sync,
{
    fn read32(&self, offset: u32) -> u32 {
        (self.read)(offset)
    }

    fn write32(&self, offset: u32, value: u32) {
        (self.write)(offset, value)
    }
}

/// Observer called once per logical access: (address, value, is_write, width in bytes)
pub type AccessObserver = dyn Fn(u32, u64, bool, u8) + Send + Sync;

/// A memory-mapped device region
struct Region {
    base: u32,
    size: u32,
    handler: Arc<dyn MmioHandler>,
    /// Held across every write, including the read-modify-write of narrow ones
    write_lock: Arc<Mutex<()>>,
}

impl Region {
    #[inline(always)]
    fn contains(&self, addr: u32, width: u32) -> bool {
        addr >= self.base
            && (addr as u64 + width as u64) <= (self.base as u64 + self.size as u64)
    }
}

struct BusState {
    ram: Vec<u8>,
    bios: Vec<u8>,
    caches: CacheSet,
    regions: Vec<Region>,
    observer: Option<Arc<AccessObserver>>,
}

/// Where an access resolved to while the lock was held
enum Route {
    Direct(u64),
    Region(Arc<dyn MmioHandler>, u32),
}

/// Region write resolved under the bus lock, performed after it is released
struct RegionWrite {
    handler: Arc<dyn MmioHandler>,
    offset: u32,
    write_lock: Arc<Mutex<()>>,
}

/// Physical memory bus: RAM, BIOS, caches and mapped regions
pub struct MemoryBus {
    state: Mutex<BusState>,
    config: MemoryConfig,
}

impl MemoryBus {
    pub fn new(config: MemoryConfig) -> Self {
        MemoryBus {
            state: Mutex::new(BusState {
                ram: vec![0u8; config.ram_size as usize],
                bios: vec![0u8; config.bios_size as usize],
                caches: CacheSet::new(),
                regions: Vec::new(),
                observer: None,
            }),
            config,
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn ram_size(&self) -> u32 {
        self.config.ram_size
    }

    pub fn bios_size(&self) -> u32 {
        self.config.bios_size
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a handler for `[base, base + size)`. Fails on any overlap
    /// with RAM, BIOS or an existing region.
    pub fn map_region(&self, base: u32, size: u32, handler: Arc<dyn MmioHandler>) -> Result<(), BusError> {
        let end = base as u64 + size as u64;
        if size == 0 || end > 1u64 << 32 {
            return Err(BusError::InvalidRegion { base, size });
        }
        let mut state = self.lock();
        let overlaps = |b: u64, s: u64| (base as u64) < b + s && b < end;
        let hits_fixed = overlaps(RAM_BASE as u64, state.ram.len() as u64)
            || overlaps(BIOS_BASE as u64, state.bios.len() as u64);
        if hits_fixed || state.regions.iter().any(|r| overlaps(r.base as u64, r.size as u64)) {
            error!(base = format_args!("{:#010x}", base), size, "region overlaps an existing mapping");
            return Err(BusError::Overlap { base, size });
        }
        state.regions.push(Region {
            base,
            size,
            handler,
            write_lock: Arc::new(Mutex::new(())),
        });
        info!("Mapped region {:#010x}-{:#010x}", base, end);
        Ok(())
    }

    /// Convenience wrapper taking closures, like `map_region(base, size, read, write)`
    pub fn map_region_fn<R, W>(&self, base: u32, size: u32, read: R, write: W) -> Result<(), BusError>
    where
        R: Fn(u32) -> u32 + Send + Sync + 'static,
        W: Fn(u32, u32) + Send + Sync + 'static,
    {
        self.map_region(base, size, Arc::new(FnHandler::new(read, write)))
    }

    /// Remove the region starting at `base`. Returns false if none was mapped there.
    pub fn unmap_region(&self, base: u32) -> bool {
        let mut state = self.lock();
        let before = state.regions.len();
        state.regions.retain(|r| r.base != base);
        let removed = state.regions.len() != before;
        if removed {
            info!("Unmapped region {:#010x}", base);
        }
        removed
    }

    pub fn set_access_observer(&self, observer: Option<Arc<AccessObserver>>) {
        self.lock().observer = observer;
    }

    /// Load a BIOS image from disk. Logs and returns false on any failure.
    pub fn load_bios(&self, path: impl AsRef<Path>) -> bool {
        match self.try_load_bios(path.as_ref()) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to load BIOS from {}: {}", path.as_ref().display(), e);
                false
            }
        }
    }

    pub fn try_load_bios(&self, path: &Path) -> Result<(), BusError> {
        let mut data = Vec::with_capacity(self.config.bios_size as usize);
        File::open(path)?.read_to_end(&mut data)?;
        self.load_bios_bytes(&data)
    }

    /// Install a BIOS image; the length must match the BIOS size exactly
    pub fn load_bios_bytes(&self, data: &[u8]) -> Result<(), BusError> {
        let mut state = self.lock();
        if data.len() != state.bios.len() {
            return Err(BusError::BiosSize {
                expected: state.bios.len(),
                found: data.len(),
            });
        }
        state.bios.copy_from_slice(data);
        info!("BIOS ({} KiB) loaded", data.len() / 1024);
        Ok(())
    }

    /// Zero RAM and unbind caches. BIOS and regions persist.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.ram.fill(0);
        state.caches.invalidate_all();
        debug!("memory reset");
    }

    /// Bind cache block `index` to the RAM window at `base`. The window
    /// must be block aligned and no other block may claim any of it.
    pub fn attach_cache(&self, index: usize, base: u32) -> Result<(), BusError> {
        if index >= CACHE_BLOCK_COUNT {
            return Err(BusError::CacheIndex(index));
        }
        if base % CACHE_BLOCK_SIZE != 0 {
            error!("Cache window {:#010x} is not block aligned", base);
            return Err(BusError::CacheAlign(base));
        }
        let mut state = self.lock();
        if base as usize >= state.ram.len() {
            return Err(BusError::CacheRange(base));
        }
        if state.caches.overlaps_other(index, base, CACHE_BLOCK_SIZE) {
            error!("Cache window {:#010x} is already claimed by another block", base);
            return Err(BusError::CacheOverlap(base));
        }
        let BusState { ram, caches, .. } = &mut *state;
        caches.bind(index, base, ram);
        Ok(())
    }

    pub fn flush_caches(&self) {
        let mut state = self.lock();
        let BusState { ram, caches, .. } = &mut *state;
        caches.flush_all(ram);
    }

    pub fn flush_cache_range(&self, addr: u32, size: u32) {
        let mut state = self.lock();
        let BusState { ram, caches, .. } = &mut *state;
        caches.flush_range(addr, size, ram);
    }

    /// Reload cached copies of `[addr, addr + size)` from RAM
    pub fn invalidate_cache_range(&self, addr: u32, size: u32) {
        let mut state = self.lock();
        let BusState { ram, caches, .. } = &mut *state;
        caches.refresh_range(addr, size, ram);
    }

    pub fn bound_caches(&self) -> usize {
        self.lock().caches.bound_count()
    }

    /// Copy `size` bytes from `src` to `dest`.
    ///
    /// RAM to RAM is a single block copy followed by a cache refresh of the
    /// destination. Anything else goes byte by byte through full dispatch
    /// so region side effects fire.
    pub fn dma_transfer(&self, src: u32, dest: u32, size: u32) -> Result<(), BusError> {
        if size == 0 {
            return Ok(());
        }
        {
            let mut state = self.lock();
            let ram_len = state.ram.len() as u64;
            let in_ram = |a: u32| (a as u64 + size as u64) <= ram_len;
            if in_ram(src) && in_ram(dest) {
                let BusState { ram, caches, .. } = &mut *state;
                caches.flush_range(src, size, ram);
                caches.flush_range(dest, size, ram);
                ram.copy_within(src as usize..(src + size) as usize, dest as usize);
                caches.refresh_range(dest, size, ram);
                return Ok(());
            }
        }
        for i in 0..size {
            let value = self.read8(src.wrapping_add(i))?;
            self.write8(dest.wrapping_add(i), value)?;
        }
        Ok(())
    }

    /// Bulk read. RAM ranges bypass the cache after flushing it; other
    /// ranges go through byte dispatch.
    pub fn read_bytes(&self, addr: u32, len: u32) -> Result<Vec<u8>, BusError> {
        {
            let mut state = self.lock();
            if addr as u64 + len as u64 <= state.ram.len() as u64 {
                let BusState { ram, caches, .. } = &mut *state;
                caches.flush_range(addr, len, ram);
                return Ok(ram[addr as usize..(addr + len) as usize].to_vec());
            }
        }
        (0..len).map(|i| self.read8(addr.wrapping_add(i))).collect()
    }

    /// Bulk write, the counterpart of [`MemoryBus::read_bytes`]
    pub fn write_bytes(&self, addr: u32, data: &[u8]) -> Result<(), BusError> {
        let len = data.len() as u32;
        {
            let mut state = self.lock();
            if addr as u64 + data.len() as u64 <= state.ram.len() as u64 {
                let BusState { ram, caches, .. } = &mut *state;
                caches.flush_range(addr, len, ram);
                ram[addr as usize..addr as usize + data.len()].copy_from_slice(data);
                caches.refresh_range(addr, len, ram);
                return Ok(());
            }
        }
        for (i, &b) in data.iter().enumerate() {
            self.write8(addr.wrapping_add(i as u32), b)?;
        }
        Ok(())
    }

    /// Load binary data into RAM
    pub fn load_binary(&self, data: &[u8], addr: u32) -> Result<(), BusError> {
        if addr as u64 + data.len() as u64 > self.config.ram_size as u64 {
            return Err(BusError::Unmapped { addr, width: 1 });
        }
        self.write_bytes(addr, data)
    }

    /// Run `f` over the RAM contents (caches flushed first)
    pub fn with_ram<T>(&self, f: impl FnOnce(&[u8]) -> T) -> T {
        let mut state = self.lock();
        let BusState { ram, caches, .. } = &mut *state;
        caches.flush_all(ram);
        f(ram)
    }

    /// Replace RAM contents wholesale; used by state restore
    pub fn with_ram_mut<T>(&self, f: impl FnOnce(&mut [u8]) -> T) -> T {
        let mut state = self.lock();
        let BusState { ram, caches, .. } = &mut *state;
        caches.flush_all(ram);
        caches.invalidate_all();
        f(ram)
    }

    fn read_sized(&self, addr: u32, width: u8) -> Result<u64, BusError> {
        check_alignment(addr, width)?;
        let (route, observer) = {
            let state = self.lock();
            (state.route_read(addr, width), state.observer.clone())
        };
        let value = match route {
            Some(Route::Direct(v)) => v,
            Some(Route::Region(handler, offset)) => match width {
                8 => {
                    let lo = handler.read32(offset) as u64;
                    let hi = handler.read32(offset + 4) as u64;
                    lo | (hi << 32)
                }
                _ => handler.read32(offset) as u64 & width_mask(width),
            },
            None => {
                error!("Read{} from unmapped address {:#010x}", width as u32 * 8, addr);
                return Err(BusError::Unmapped { addr, width });
            }
        };
        if let Some(observer) = observer {
            observer(addr, value, false, width);
        }
        Ok(value)
    }

    fn write_sized(&self, addr: u32, value: u64, width: u8) -> Result<(), BusError> {
        check_alignment(addr, width)?;
        let (route, observer) = {
            let mut state = self.lock();
            let observer = state.observer.clone();
            (state.route_write(addr, value, width), observer)
        };
        if let Some(RegionWrite { handler, offset, write_lock }) = route? {
            let _guard = write_lock.lock().unwrap_or_else(PoisonError::into_inner);
            match width {
                4 => handler.write32(offset, value as u32),
                8 => {
                    handler.write32(offset, value as u32);
                    handler.write32(offset + 4, (value >> 32) as u32);
                }
                _ => {
                    let mask = width_mask(width) as u32;
                    let current = handler.read32(offset);
                    handler.write32(offset, (current & !mask) | (value as u32 & mask));
                }
            }
        }
        if let Some(observer) = observer {
            observer(addr, value, true, width);
        }
        Ok(())
    }
}

impl BusState {
    fn route_read(&self, addr: u32, width: u8) -> Option<Route> {
        let w = width as u32;
        if let Some(block) = self.caches.lookup(addr, w) {
            let off = (addr - block.base) as usize;
            return Some(Route::Direct(load_le(&block.data[off..off + width as usize])));
        }
        if (addr as u64 + w as u64) <= self.ram.len() as u64 {
            let off = addr as usize;
            return Some(Route::Direct(load_le(&self.ram[off..off + width as usize])));
        }
        if addr >= BIOS_BASE && ((addr - BIOS_BASE) as u64 + w as u64) <= self.bios.len() as u64 {
            let off = (addr - BIOS_BASE) as usize;
            return Some(Route::Direct(load_le(&self.bios[off..off + width as usize])));
        }
        self.find_region(addr, w)
            .map(|r| Route::Region(r.handler.clone(), addr - r.base))
    }

    /// Performs direct writes in place; returns the handler for region writes
    fn route_write(&mut self, addr: u32, value: u64, width: u8) -> Result<Option<RegionWrite>, BusError> {
        let w = width as u32;
        if let Some(block) = self.caches.lookup_mut(addr, w) {
            let off = (addr - block.base) as usize;
            store_le(&mut block.data[off..off + width as usize], value);
            block.dirty = true;
            return Ok(None);
        }
        if (addr as u64 + w as u64) <= self.ram.len() as u64 {
            let off = addr as usize;
            store_le(&mut self.ram[off..off + width as usize], value);
            return Ok(None);
        }
        if addr >= BIOS_BASE && ((addr - BIOS_BASE) as u64) < self.bios.len() as u64 {
            warn!("Write{} to BIOS at {:#010x} ignored", w * 8, addr);
            return Err(BusError::ReadOnly { addr });
        }
        match self.find_region(addr, w) {
            Some(r) => Ok(Some(RegionWrite {
                handler: r.handler.clone(),
                offset: addr - r.base,
                write_lock: r.write_lock.clone(),
            })),
            None => {
                error!("Write{} to unmapped address {:#010x}", w * 8, addr);
                Err(BusError::Unmapped { addr, width })
            }
        }
    }

    /// The error `route_write` would return for this access, if any
    fn check_write_target(&self, addr: u32, width: u32) -> Result<(), BusError> {
        if self.caches.lookup(addr, width).is_some()
            || (addr as u64 + width as u64) <= self.ram.len() as u64
            || self.find_region(addr, width).is_some()
        {
            return Ok(());
        }
        if addr >= BIOS_BASE && ((addr - BIOS_BASE) as u64) < self.bios.len() as u64 {
            return Err(BusError::ReadOnly { addr });
        }
        Err(BusError::Unmapped { addr, width: width as u8 })
    }

    fn find_region(&self, addr: u32, width: u32) -> Option<&Region> {
        self.regions.iter().find(|r| r.contains(addr, width))
    }
}

#[inline(always)]
fn check_alignment(addr: u32, width: u8) -> Result<(), BusError> {
    if width > 1 && addr % width as u32 != 0 {
        error!("Unaligned {}-byte access at {:#010x}", width, addr);
        return Err(BusError::Misaligned { addr, width });
    }
    Ok(())
}

#[inline(always)]
fn width_mask(width: u8) -> u64 {
    if width >= 8 {
        u64::MAX
    } else {
        (1u64 << (width as u32 * 8)) - 1
    }
}

#[inline(always)]
fn load_le(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .rev()
        .fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

#[inline(always)]
fn store_le(bytes: &mut [u8], value: u64) {
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = (value >> (i * 8)) as u8;
    }
}

impl Bus for MemoryBus {
    fn read8(&self, addr: u32) -> Result<u8, BusError> {
        self.read_sized(addr, 1).map(|v| v as u8)
    }

    fn read16(&self, addr: u32) -> Result<u16, BusError> {
        self.read_sized(addr, 2).map(|v| v as u16)
    }

    fn read32(&self, addr: u32) -> Result<u32, BusError> {
        self.read_sized(addr, 4).map(|v| v as u32)
    }

    fn read64(&self, addr: u32) -> Result<u64, BusError> {
        self.read_sized(addr, 8)
    }

    fn write8(&self, addr: u32, value: u8) -> Result<(), BusError> {
        self.write_sized(addr, value as u64, 1)
    }

    fn write16(&self, addr: u32, value: u16) -> Result<(), BusError> {
        self.write_sized(addr, value as u64, 2)
    }

    fn write32(&self, addr: u32, value: u32) -> Result<(), BusError> {
        self.write_sized(addr, value as u64, 4)
    }

    fn write64(&self, addr: u32, value: u64) -> Result<(), BusError> {
        self.write_sized(addr, value, 8)
    }

    fn check_writable(&self, addr: u32, len: u32) -> Result<(), BusError> {
        let state = self.lock();
        for word in (0..len).step_by(4) {
            let a = addr.wrapping_add(word);
            check_alignment(a, 4)?;
            state.check_write_target(a, 4)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn small_bus() -> MemoryBus {
        MemoryBus::new(MemoryConfig {
            ram_size: 1024 * 1024,
            bios_size: BIOS_SIZE,
        })
    }

    #[test]
    fn test_ram_read_write() {
        let bus = small_bus();
        bus.write32(0x100, 0xDEADBEEF).unwrap();
        assert_eq!(bus.read32(0x100).unwrap(), 0xDEADBEEF);
        assert_eq!(bus.read8(0x100).unwrap(), 0xEF);
        assert_eq!(bus.read16(0x102).unwrap(), 0xDEAD);

        bus.write64(0x200, 0x0123_4567_89AB_CDEF).unwrap();
        assert_eq!(bus.read32(0x204).unwrap(), 0x0123_4567);
    }

    #[test]
    fn test_misaligned_access_rejected() {
        let bus = small_bus();
        assert!(matches!(bus.read16(1), Err(BusError::Misaligned { addr: 1, width: 2 })));
        assert!(matches!(bus.read32(2), Err(BusError::Misaligned { .. })));
        assert!(matches!(bus.write64(4, 0), Err(BusError::Misaligned { .. })));
        assert!(bus.read8(3).is_ok());
    }

    #[test]
    fn test_unmapped_access() {
        let bus = small_bus();
        assert!(matches!(bus.read32(0x4000_0000), Err(BusError::Unmapped { .. })));
        assert!(matches!(bus.write8(0x4000_0000, 1), Err(BusError::Unmapped { .. })));
    }

    #[test]
    fn test_bios_is_read_only() {
        let bus = small_bus();
        let mut image = vec![0u8; BIOS_SIZE as usize];
        image[0] = 0x90;
        bus.load_bios_bytes(&image).unwrap();
        assert_eq!(bus.read8(BIOS_BASE).unwrap(), 0x90);
        assert!(matches!(bus.write8(BIOS_BASE, 0), Err(BusError::ReadOnly { .. })));
        assert!(matches!(
            bus.load_bios_bytes(&image[..1000]),
            Err(BusError::BiosSize { found: 1000, .. })
        ));
    }

    #[test]
    fn test_region_overlap_rejected() {
        let bus = small_bus();
        bus.map_region_fn(GPU_BASE, 0x1000, |_| 0, |_, _| {}).unwrap();
        assert!(matches!(
            bus.map_region_fn(GPU_BASE + 0x800, 0x1000, |_| 0, |_, _| {}),
            Err(BusError::Overlap { .. })
        ));
        assert!(matches!(
            bus.map_region_fn(0, 0x1000, |_| 0, |_, _| {}),
            Err(BusError::Overlap { .. })
        ));
        assert!(bus.unmap_region(GPU_BASE));
        assert!(!bus.unmap_region(GPU_BASE));
        bus.map_region_fn(GPU_BASE + 0x800, 0x1000, |_| 0, |_, _| {}).unwrap();
    }

    #[test]
    fn test_region_narrow_write_merges() {
        let bus = small_bus();
        let reg = Arc::new(AtomicU32::new(0xAABB_CCDD));
        let (r, w) = (reg.clone(), reg.clone());
        bus.map_region_fn(
            APU_BASE,
            0x100,
            move |_| r.load(Ordering::SeqCst),
            move |_, v| w.store(v, Ordering::SeqCst),
        )
        .unwrap();
        bus.write8(APU_BASE, 0x11).unwrap();
        assert_eq!(reg.load(Ordering::SeqCst), 0xAABB_CC11);
        bus.write16(APU_BASE, 0x2233).unwrap();
        assert_eq!(reg.load(Ordering::SeqCst), 0xAABB_2233);
        assert_eq!(bus.read8(APU_BASE).unwrap(), 0x33);
    }

    #[test]
    fn test_observer_fires_once_per_access() {
        let bus = small_bus();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        bus.set_access_observer(Some(Arc::new(move |_, _, _, _| {
            c.fetch_add(1, Ordering::SeqCst);
        })));
        bus.write64(0x10, 7).unwrap();
        bus.read64(0x10).unwrap();
        bus.read8(0x11).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_cache_shadows_ram_and_dma_flushes() {
        let bus = small_bus();
        bus.attach_cache(0, 0).unwrap();
        bus.write32(0x40, 0x1234_5678).unwrap();
        // Dirty data must reach the DMA destination
        bus.dma_transfer(0x40, CACHE_BLOCK_SIZE * 2, 4).unwrap();
        assert_eq!(bus.read32(CACHE_BLOCK_SIZE * 2).unwrap(), 0x1234_5678);

        // DMA into a cached window refreshes the cache copy
        bus.write32(CACHE_BLOCK_SIZE * 3, 0xCAFE_F00D).unwrap();
        bus.dma_transfer(CACHE_BLOCK_SIZE * 3, 0x80, 4).unwrap();
        assert_eq!(bus.read32(0x80).unwrap(), 0xCAFE_F00D);
    }

    #[test]
    fn test_reset_zeroes_ram_keeps_bios() {
        let bus = small_bus();
        let image = vec![0x42u8; BIOS_SIZE as usize];
        bus.load_bios_bytes(&image).unwrap();
        bus.attach_cache(1, 0).unwrap();
        bus.write32(0, 5).unwrap();
        bus.reset();
        assert_eq!(bus.read32(0).unwrap(), 0);
        assert_eq!(bus.bound_caches(), 0);
        assert_eq!(bus.read8(BIOS_BASE + 10).unwrap(), 0x42);
    }

    #[test]
    fn test_cache_windows_never_share_addresses() {
        let bus = small_bus();
        bus.attach_cache(0, 0).unwrap();
        assert!(matches!(bus.attach_cache(1, 0x100), Err(BusError::CacheAlign(0x100))));
        assert!(matches!(bus.attach_cache(1, 0), Err(BusError::CacheOverlap(0))));
        // Rebinding the same block elsewhere is fine
        bus.attach_cache(0, CACHE_BLOCK_SIZE).unwrap();
        bus.attach_cache(1, 0).unwrap();
        assert_eq!(bus.bound_caches(), 2);

        bus.write32(0x200, 0xAAAA_AAAA).unwrap();
        bus.write32(CACHE_BLOCK_SIZE, 0xBBBB_BBBB).unwrap();
        bus.flush_caches();
        assert_eq!(bus.read32(0x200).unwrap(), 0xAAAA_AAAA);
        assert_eq!(bus.read_bytes(0x200, 4).unwrap(), vec![0xAA; 4]);
        assert_eq!(bus.read32(CACHE_BLOCK_SIZE).unwrap(), 0xBBBB_BBBB);
    }

    #[test]
    fn test_check_writable() {
        let bus = small_bus();
        let end = bus.ram_size();
        assert!(bus.check_writable(end - 16, 16).is_ok());
        assert!(matches!(bus.check_writable(end - 12, 16), Err(BusError::Unmapped { .. })));
        assert!(matches!(bus.check_writable(BIOS_BASE, 4), Err(BusError::ReadOnly { .. })));
        assert!(matches!(bus.check_writable(2, 16), Err(BusError::Misaligned { .. })));
    }

    #[test]
    fn test_concurrent_narrow_region_writes_merge() {
        let bus = Arc::new(small_bus());
        let reg = Arc::new(AtomicU32::new(0));
        let (r, w) = (reg.clone(), reg.clone());
        bus.map_region_fn(
            APU_BASE,
            0x100,
            move |_| r.load(Ordering::SeqCst),
            move |_, v| w.store(v, Ordering::SeqCst),
        )
        .unwrap();
        let handles: Vec<_> = (0..4u32)
            .map(|lane| {
                let bus = bus.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        bus.write8(APU_BASE + lane, 0x11 * (lane as u8 + 1)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(reg.load(Ordering::SeqCst), 0x4433_2211);
    }

    #[test]
    fn test_dma_through_region_fires_handlers() {
        let bus = small_bus();
        let writes = Arc::new(AtomicU32::new(0));
        let w = writes.clone();
        bus.map_region_fn(GPU_BASE, 0x100, |_| 0, move |_, _| {
            w.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        bus.dma_transfer(0, GPU_BASE, 8).unwrap();
        assert_eq!(writes.load(Ordering::SeqCst), 8);
    }
}
