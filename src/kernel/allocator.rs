//! Block allocator over the kernel's reserved address ranges
//!
//! The block list is kept sorted by address. Within one reserved range the
//! blocks are consecutive and never overlap; freeing merges a block with
//! free neighbours that touch it.

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// Allocation granularity
pub const PAGE_SIZE: u32 = 0x1000;

/// Address returned to the guest when an allocation fails
pub const ALLOC_FAILED: u32 = 0;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryBlock {
    pub address: u32,
    pub size: u32,
    pub allocated: bool,
    pub purpose: String,
}

impl MemoryBlock {
    fn end(&self) -> u64 {
        self.address as u64 + self.size as u64
    }
}

#[inline]
pub fn align_to_page(size: u32) -> Option<u32> {
    size.checked_add(PAGE_SIZE - 1).map(|s| s & !(PAGE_SIZE - 1))
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Allocator {
    blocks: Vec<MemoryBlock>,
}

impl Allocator {
    pub fn new() -> Self {
        Allocator { blocks: Vec::new() }
    }

    /// Build an allocator owning the given `(base, size)` ranges
    pub fn with_ranges(ranges: &[(u32, u32, &str)]) -> Self {
        let mut alloc = Allocator::new();
        for &(base, size, purpose) in ranges {
            alloc.add_range(base, size, purpose);
        }
        alloc
    }

    /// Hand a new free range to the allocator. Rejects empty or overlapping ranges.
    pub fn add_range(&mut self, base: u32, size: u32, purpose: &str) -> bool {
        let end = base as u64 + size as u64;
        if size == 0 || end > 1u64 << 32 {
            return false;
        }
        if self.blocks.iter().any(|b| (base as u64) < b.end() && (b.address as u64) < end) {
            error!("Reserved range {:#010x}+{:#x} overlaps existing blocks", base, size);
            return false;
        }
        let idx = self.blocks.partition_point(|b| b.address < base);
        self.blocks.insert(
            idx,
            MemoryBlock {
                address: base,
                size,
                allocated: false,
                purpose: purpose.to_string(),
            },
        );
        true
    }

    /// First-fit allocation. Size is rounded up to whole pages and the
    /// alignment is at least one page. Returns `None` when nothing fits.
    pub fn allocate(&mut self, size: u32, alignment: u32, purpose: &str) -> Option<u32> {
        let alignment = alignment.max(PAGE_SIZE);
        if size == 0 || !alignment.is_power_of_two() {
            error!(size, alignment, purpose, "invalid allocation request");
            return None;
        }
        let size = align_to_page(size)?;

        for idx in 0..self.blocks.len() {
            let block = &self.blocks[idx];
            if block.allocated || block.size < size {
                continue;
            }
            let aligned = (block.address as u64 + alignment as u64 - 1) & !(alignment as u64 - 1);
            if aligned + size as u64 <= block.end() {
                let addr = aligned as u32;
                self.carve(idx, addr, size, purpose);
                debug!("allocated {:#010x}+{:#x} for {}", addr, size, purpose);
                return Some(addr);
            }
        }
        error!("Memory allocation failed: size={:#x}, align={:#x}, purpose={}", size, alignment, purpose);
        None
    }

    /// Claim exactly `[addr, addr + size)`; it must lie inside one free block.
    pub fn allocate_at(&mut self, addr: u32, size: u32, purpose: &str) -> Option<u32> {
        if size == 0 || addr % PAGE_SIZE != 0 {
            return None;
        }
        let size = align_to_page(size)?;
        let idx = self.blocks.iter().position(|b| {
            !b.allocated && b.address <= addr && addr as u64 + size as u64 <= b.end()
        })?;
        self.carve(idx, addr, size, purpose);
        Some(addr)
    }

    /// Split free block `idx` so that `[addr, addr + size)` becomes its own
    /// allocated block, with free remainders before and after.
    fn carve(&mut self, idx: usize, addr: u32, size: u32, purpose: &str) {
        let block_start = self.blocks[idx].address;
        let block_end = self.blocks[idx].end();
        let alloc_end = addr as u64 + size as u64;

        let mut idx = idx;
        if addr > block_start {
            self.blocks.insert(
                idx,
                MemoryBlock {
                    address: block_start,
                    size: addr - block_start,
                    allocated: false,
                    purpose: "Free".to_string(),
                },
            );
            idx += 1;
        }
        if alloc_end < block_end {
            self.blocks.insert(
                idx + 1,
                MemoryBlock {
                    address: alloc_end as u32,
                    size: (block_end - alloc_end) as u32,
                    allocated: false,
                    purpose: "Free".to_string(),
                },
            );
        }
        let block = &mut self.blocks[idx];
        block.address = addr;
        block.size = size;
        block.allocated = true;
        block.purpose = purpose.to_string();
    }

    /// Free the allocated block starting at `address`, merging with free
    /// neighbours. Returns false if no allocated block starts there.
    pub fn deallocate(&mut self, address: u32) -> bool {
        let Some(mut idx) = self
            .blocks
            .iter()
            .position(|b| b.allocated && b.address == address)
        else {
            error!("Memory free failed: address {:#010x} not found", address);
            return false;
        };

        self.blocks[idx].allocated = false;
        self.blocks[idx].purpose = "Free".to_string();

        if idx > 0 {
            let prev = &self.blocks[idx - 1];
            if !prev.allocated && prev.end() == address as u64 {
                let size = self.blocks[idx].size;
                self.blocks[idx - 1].size += size;
                self.blocks.remove(idx);
                idx -= 1;
            }
        }
        if idx + 1 < self.blocks.len() {
            let next = &self.blocks[idx + 1];
            if !next.allocated && self.blocks[idx].end() == next.address as u64 {
                let size = next.size;
                self.blocks[idx].size += size;
                self.blocks.remove(idx + 1);
            }
        }
        true
    }

    pub fn blocks(&self) -> &[MemoryBlock] {
        &self.blocks
    }

    /// Size of the allocated block starting at `address`
    pub fn allocation_size(&self, address: u32) -> Option<u32> {
        self.blocks
            .iter()
            .find(|b| b.allocated && b.address == address)
            .map(|b| b.size)
    }

    pub fn free_bytes(&self) -> u64 {
        self.blocks.iter().filter(|b| !b.allocated).map(|b| b.size as u64).sum()
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.blocks.iter().filter(|b| b.allocated).map(|b| b.size as u64).sum()
    }
}
