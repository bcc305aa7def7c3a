//! Direct-mapped write-back cache blocks
//!
//! Each block shadows a window of RAM. Reads and writes that land fully
//! inside a bound block are served from the block; writes mark it dirty.
//! Anything that touches RAM behind the cache's back must call
//! [`CacheSet::flush_range`] first (so RAM sees dirty bytes) and
//! [`CacheSet::refresh_range`] afterwards (so the cache sees new RAM bytes).

use super::{CACHE_BLOCK_COUNT, CACHE_BLOCK_SIZE};

/// One cache block. `size == 0` means the block is unbound.
pub(crate) struct CacheBlock {
    pub base: u32,
    pub size: u32,
    pub dirty: bool,
    pub data: Vec<u8>,
}

impl CacheBlock {
    fn new() -> Self {
        CacheBlock {
            base: 0,
            size: 0,
            dirty: false,
            data: vec![0u8; CACHE_BLOCK_SIZE as usize],
        }
    }

    /// True if `[addr, addr + width)` lies inside the bound window
    #[inline(always)]
    pub fn contains(&self, addr: u32, width: u32) -> bool {
        self.size != 0
            && addr >= self.base
            && (addr as u64 + width as u64) <= (self.base as u64 + self.size as u64)
    }

    /// Intersection of `[addr, addr + len)` with this block's window
    fn overlap(&self, addr: u32, len: u32) -> Option<(u32, u32)> {
        if self.size == 0 || len == 0 {
            return None;
        }
        let start = addr.max(self.base) as u64;
        let end = (addr as u64 + len as u64).min(self.base as u64 + self.size as u64);
        if start < end {
            Some((start as u32, (end - start) as u32))
        } else {
            None
        }
    }
}

/// The fixed set of cache blocks owned by the bus
pub(crate) struct CacheSet {
    blocks: Vec<CacheBlock>,
}

impl CacheSet {
    pub fn new() -> Self {
        CacheSet {
            blocks: (0..CACHE_BLOCK_COUNT).map(|_| CacheBlock::new()).collect(),
        }
    }

    /// Find the block serving `[addr, addr + width)`
    #[inline(always)]
    pub fn lookup(&self, addr: u32, width: u32) -> Option<&CacheBlock> {
        self.blocks.iter().find(|b| b.contains(addr, width))
    }

    #[inline(always)]
    pub fn lookup_mut(&mut self, addr: u32, width: u32) -> Option<&mut CacheBlock> {
        self.blocks.iter_mut().find(|b| b.contains(addr, width))
    }

    /// True if a block other than `index` claims any byte of `[base, base + len)`
    pub fn overlaps_other(&self, index: usize, base: u32, len: u32) -> bool {
        self.blocks
            .iter()
            .enumerate()
            .any(|(i, b)| i != index && b.overlap(base, len).is_some())
    }

    /// Bind block `index` to the RAM window starting at `base`.
    /// The previous binding is written back if dirty. The caller checks
    /// alignment and that no other block claims the window.
    pub fn bind(&mut self, index: usize, base: u32, ram: &mut [u8]) {
        let block = &mut self.blocks[index];
        write_back(block, ram);
        let start = base as usize;
        let len = (CACHE_BLOCK_SIZE as usize).min(ram.len() - start);
        block.data[..len].copy_from_slice(&ram[start..start + len]);
        block.base = base;
        block.size = len as u32;
        block.dirty = false;
    }

    /// Write back every dirty block
    pub fn flush_all(&mut self, ram: &mut [u8]) {
        for block in &mut self.blocks {
            write_back(block, ram);
        }
    }

    /// Write back the dirty bytes of every block overlapping the range.
    /// Blocks stay dirty if only part of their window was written back.
    pub fn flush_range(&mut self, addr: u32, len: u32, ram: &mut [u8]) {
        for block in &mut self.blocks {
            if !block.dirty {
                continue;
            }
            if let Some((start, n)) = block.overlap(addr, len) {
                let off = (start - block.base) as usize;
                let n = n as usize;
                ram[start as usize..start as usize + n].copy_from_slice(&block.data[off..off + n]);
                if n == block.size as usize {
                    block.dirty = false;
                }
            }
        }
    }

    /// Reload the overlapping part of every bound block from RAM
    pub fn refresh_range(&mut self, addr: u32, len: u32, ram: &[u8]) {
        for block in &mut self.blocks {
            if let Some((start, n)) = block.overlap(addr, len) {
                let off = (start - block.base) as usize;
                let n = n as usize;
                block.data[off..off + n].copy_from_slice(&ram[start as usize..start as usize + n]);
            }
        }
    }

    /// Unbind every block without writing anything back
    pub fn invalidate_all(&mut self) {
        for block in &mut self.blocks {
            block.base = 0;
            block.size = 0;
            block.dirty = false;
        }
    }

    pub fn bound_count(&self) -> usize {
        self.blocks.iter().filter(|b| b.size != 0).count()
    }
}

fn write_back(block: &mut CacheBlock, ram: &mut [u8]) {
    if block.dirty && block.size != 0 {
        let start = block.base as usize;
        let len = block.size as usize;
        ram[start..start + len].copy_from_slice(&block.data[..len]);
    }
    block.dirty = false;
}
