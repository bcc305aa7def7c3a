//! APU register window
//!
//! Audio generation is not emulated. The window accepts register writes,
//! reads back what was stored and logs the traffic so guest code probing
//! the audio hardware keeps running.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::memory::MmioHandler;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ApuSnapshot {
    pub registers: Vec<(u32, u32)>,
}

#[derive(Default)]
pub struct Apu {
    registers: Mutex<BTreeMap<u32, u32>>,
    accesses: AtomicU64,
}

impl Apu {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register accesses seen since creation
    pub fn access_count(&self) -> u64 {
        self.accesses.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.regs().clear();
    }

    fn regs(&self) -> std::sync::MutexGuard<'_, BTreeMap<u32, u32>> {
        self.registers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> ApuSnapshot {
        ApuSnapshot {
            registers: self.regs().iter().map(|(k, v)| (*k, *v)).collect(),
        }
    }

    pub fn restore(&self, snapshot: &ApuSnapshot) {
        let mut regs = self.regs();
        regs.clear();
        regs.extend(snapshot.registers.iter().copied());
    }
}

impl MmioHandler for Apu {
    fn read32(&self, offset: u32) -> u32 {
        self.accesses.fetch_add(1, Ordering::Relaxed);
        let value = self.regs().get(&offset).copied().unwrap_or(0);
        trace!("apu read {:#08x} -> {:#010x}", offset, value);
        value
    }

    fn write32(&self, offset: u32, value: u32) {
        self.accesses.fetch_add(1, Ordering::Relaxed);
        trace!("apu write {:#08x} <- {:#010x}", offset, value);
        if value == 0 {
            self.regs().remove(&offset);
        } else {
            self.regs().insert(offset, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registers_read_back() {
        let apu = Apu::new();
        apu.write32(0x100, 0x1234);
        assert_eq!(apu.read32(0x100), 0x1234);
        assert_eq!(apu.read32(0x104), 0);
        assert_eq!(apu.access_count(), 3);

        let snap = apu.snapshot();
        apu.reset();
        assert_eq!(apu.read32(0x100), 0);
        apu.restore(&snap);
        assert_eq!(apu.read32(0x100), 0x1234);
    }
}
