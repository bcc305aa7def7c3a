//! Save states
//!
//! A snapshot holds the CPU, kernel bookkeeping, device state and only the
//! non-zero 4 KiB pages of RAM. It is serialized with bincode and
//! compressed with zstd. The version and RAM size are checked on restore.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cpu::CpuSnapshot;
use crate::devices::{ApuSnapshot, GpuSnapshot};
use crate::kernel::KernelSnapshot;

/// Page size for sparse RAM capture (4KB)
pub const PAGE_SIZE: u32 = 4096;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("serialization error: {0}")]
    Encode(bincode::Error),
    #[error("deserialization error: {0}")]
    Decode(bincode::Error),
    #[error("compression error: {0}")]
    Compression(std::io::Error),
    #[error("unsupported snapshot version {found} (expected {expected})")]
    Version { expected: u32, found: u32 },
    #[error("snapshot RAM size {found:#x} does not match {expected:#x}")]
    RamSize { expected: u32, found: u32 },
    #[error("snapshot framebuffer does not match the GPU configuration")]
    Gpu,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    /// Version for compatibility checking
    pub version: u32,
    pub ram_size: u32,
    pub cpu: CpuSnapshot,
    pub kernel: KernelSnapshot,
    /// Non-zero RAM pages as (page address, bytes)
    pub ram_pages: Vec<(u32, Vec<u8>)>,
    pub gpu: GpuSnapshot,
    pub apu: ApuSnapshot,
    pub frame: u64,
}

impl Snapshot {
    /// Current snapshot version
    pub const VERSION: u32 = 1;

    /// Serialize to bytes (compressed with zstd)
    pub fn to_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        let serialized = bincode::serialize(self).map_err(SnapshotError::Encode)?;
        zstd::stream::encode_all(&serialized[..], 3).map_err(SnapshotError::Compression)
    }

    /// Deserialize from bytes (compressed with zstd)
    pub fn from_bytes(data: &[u8]) -> Result<Self, SnapshotError> {
        let decompressed = zstd::stream::decode_all(data).map_err(SnapshotError::Compression)?;
        let snapshot: Snapshot = bincode::deserialize(&decompressed).map_err(SnapshotError::Decode)?;
        if snapshot.version != Self::VERSION {
            return Err(SnapshotError::Version {
                expected: Self::VERSION,
                found: snapshot.version,
            });
        }
        Ok(snapshot)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SnapshotError> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SnapshotError> {
        Self::from_bytes(&std::fs::read(path)?)
    }
}

/// Collect the non-zero pages of `ram`
pub fn capture_pages(ram: &[u8]) -> Vec<(u32, Vec<u8>)> {
    ram.chunks(PAGE_SIZE as usize)
        .enumerate()
        .filter(|(_, page)| page.iter().any(|b| *b != 0))
        .map(|(i, page)| (i as u32 * PAGE_SIZE, page.to_vec()))
        .collect()
}

/// Zero `ram` and write the captured pages back. Pages past the end are ignored.
pub fn apply_pages(ram: &mut [u8], pages: &[(u32, Vec<u8>)]) {
    ram.fill(0);
    for (addr, bytes) in pages {
        let start = *addr as usize;
        if let Some(dst) = ram.get_mut(start..start + bytes.len()) {
            dst.copy_from_slice(bytes);
        }
    }
}
