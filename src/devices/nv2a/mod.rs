//! NV2A-style GPU
//!
//! `GpuCore` owns the renderer behind a mutex and a worker thread that
//! consumes register writes from a bounded queue. The CPU reaches it through
//! the MMIO handler returned by [`GpuCore::mmio_handler`], mapped at
//! `GPU_BASE`. Where threads are unavailable (wasm) the core runs inline:
//! writes land directly and a PUT write is serviced by the next
//! [`GpuCore::sync`].

mod raster;
pub mod renderer;
pub mod texture;
mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{self, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::memory::{MemoryBus, MmioHandler};
pub use raster::{blend_colors, blend_pixels};
pub use renderer::{GpuDebugCallback, PrimitiveType, Renderer, Vertex};
pub use texture::TextureUnit;
use worker::{GpuMessage, GpuShared};
pub use worker::GpuMmio;

/// Texture memory is snapshotted in pages of this size
const TEXTURE_PAGE: usize = 0x1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GpuState {
    Ready,
    Processing,
    /// Terminal: the worker has stopped
    Error,
}

/// Pixel rectangle; `right` and `bottom` are exclusive
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl ClipRect {
    pub fn full(width: u32, height: u32) -> Self {
        ClipRect {
            left: 0,
            top: 0,
            right: width as i32,
            bottom: height as i32,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GpuConfig {
    pub width: u32,
    pub height: u32,
    /// Bytes of texture memory
    pub texture_memory: usize,
    pub vsync: bool,
    pub frame_interval: Duration,
    /// Bound of the register-write queue
    pub queue_depth: usize,
}

impl Default for GpuConfig {
    fn default() -> Self {
        GpuConfig {
            width: 1280,
            height: 720,
            texture_memory: 128 * 1024 * 1024,
            vsync: true,
            frame_interval: Duration::from_millis(16),
            queue_depth: 16384,
        }
    }
}

/// GPU portion of a save state
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GpuSnapshot {
    pub width: u32,
    pub height: u32,
    /// Non-zero register words as (index, value)
    pub registers: Vec<(u32, u32)>,
    pub get: u32,
    pub put: u32,
    pub framebuffer: Vec<u32>,
    /// Non-zero texture memory pages as (page index, bytes)
    pub texture_pages: Vec<(u32, Vec<u8>)>,
    pub texture_units: Vec<TextureUnit>,
    pub clip: ClipRect,
    pub primitive: Option<PrimitiveType>,
    pub current_texture: u32,
    pub depth_test: bool,
    pub alpha_blend: bool,
    pub bilinear: bool,
    pub frame_count: u64,
}

pub struct GpuCore {
    shared: Arc<GpuShared>,
    tx: Option<Sender<GpuMessage>>,
    worker: Option<JoinHandle<()>>,
    ram: Option<Arc<MemoryBus>>,
}

impl GpuCore {
    /// Create the GPU and start its worker. `ram` is the source for
    /// texture uploads.
    pub fn new(config: GpuConfig, ram: Option<Arc<MemoryBus>>) -> Self {
        let shared = Arc::new(GpuShared {
            renderer: Mutex::new(Renderer::new(&config)),
            vsync: AtomicBool::new(config.vsync),
            frame_interval: config.frame_interval,
        });
        let (tx, rx) = channel::bounded(config.queue_depth.max(1));
        let (tx, worker) = match worker::spawn(shared.clone(), rx, ram.clone()) {
            Ok(handle) => (Some(tx), Some(handle)),
            Err(e) => {
                warn!("nv2a worker unavailable ({}), running inline", e);
                (None, None)
            }
        };
        info!(width = config.width, height = config.height, threaded = worker.is_some(), "nv2a ready");
        GpuCore {
            shared,
            tx,
            worker,
            ram,
        }
    }

    /// Handler to map at `GPU_BASE`
    pub fn mmio_handler(&self) -> Arc<dyn MmioHandler> {
        Arc::new(GpuMmio {
            shared: self.shared.clone(),
            tx: self.tx.clone(),
        })
    }

    pub fn is_threaded(&self) -> bool {
        self.worker.is_some()
    }

    /// Write a register-bank word as the CPU would
    pub fn write_word(&self, index: u32, value: u32) {
        GpuMmio {
            shared: self.shared.clone(),
            tx: self.tx.clone(),
        }
        .write32(index * 4, value);
    }

    pub fn read_word(&self, index: u32) -> u32 {
        self.shared.lock().read_register(index)
    }

    /// Block until every write queued so far has been handled, including
    /// any frame it kicked.
    pub fn sync(&self) {
        match &self.tx {
            Some(tx) => {
                let (reply_tx, reply_rx) = channel::bounded(1);
                if tx.send(GpuMessage::Sync(reply_tx)).is_err() || reply_rx.recv().is_err() {
                    debug!("nv2a sync after worker exit");
                }
            }
            None => {
                let mut r = self.shared.lock();
                if r.get != r.put {
                    r.run_frame(self.ram.as_deref());
                }
            }
        }
    }

    pub fn state(&self) -> GpuState {
        self.shared.lock().state()
    }

    /// Copy of the current framebuffer as ARGB pixels
    pub fn framebuffer(&self) -> Vec<u32> {
        self.shared.lock().framebuffer().to_vec()
    }

    pub fn width(&self) -> u32 {
        self.shared.lock().dimensions().0
    }

    pub fn height(&self) -> u32 {
        self.shared.lock().dimensions().1
    }

    pub fn frame_count(&self) -> u64 {
        self.shared.lock().frame_count()
    }

    pub fn texture_unit(&self, unit: usize) -> Option<TextureUnit> {
        self.shared.lock().texture_unit(unit).copied()
    }

    /// Run `f` with the renderer locked
    pub fn with_renderer<T>(&self, f: impl FnOnce(&mut Renderer) -> T) -> T {
        f(&mut self.shared.lock())
    }

    pub fn reset(&self) {
        self.sync();
        let mut r = self.shared.lock();
        if r.state() != GpuState::Error {
            r.reset();
        }
    }

    pub fn enable_depth_test(&self, enabled: bool) {
        self.shared.lock().depth_test = enabled;
    }

    pub fn enable_alpha_blending(&self, enabled: bool) {
        self.shared.lock().alpha_blend = enabled;
    }

    pub fn enable_vsync(&self, enabled: bool) {
        self.shared.vsync.store(enabled, Ordering::Relaxed);
    }

    pub fn set_clip_rect(&self, rect: ClipRect) {
        self.shared.lock().clip = rect;
    }

    pub fn set_debug_callback(&self, callback: Option<GpuDebugCallback>) {
        self.shared.lock().set_debug_callback(callback);
    }

    pub fn snapshot(&self) -> GpuSnapshot {
        self.sync();
        let r = self.shared.lock();
        let registers = r
            .registers
            .iter()
            .enumerate()
            .filter(|(_, v)| **v != 0)
            .map(|(i, v)| (i as u32, *v))
            .collect();
        let texture_pages = r
            .texture_memory
            .chunks(TEXTURE_PAGE)
            .enumerate()
            .filter(|(_, page)| page.iter().any(|b| *b != 0))
            .map(|(i, page)| (i as u32, page.to_vec()))
            .collect();
        GpuSnapshot {
            width: r.width,
            height: r.height,
            registers,
            get: r.get,
            put: r.put,
            framebuffer: r.framebuffer.clone(),
            texture_pages,
            texture_units: r.texture_units.to_vec(),
            clip: r.clip,
            primitive: r.primitive,
            current_texture: r.current_texture as u32,
            depth_test: r.depth_test,
            alpha_blend: r.alpha_blend,
            bilinear: r.bilinear,
            frame_count: r.frame_count,
        }
    }

    /// Restore a snapshot taken from a GPU with the same framebuffer size.
    /// Returns false (leaving state untouched) on a size mismatch.
    pub fn restore(&self, snapshot: &GpuSnapshot) -> bool {
        self.sync();
        let mut r = self.shared.lock();
        if snapshot.width != r.width
            || snapshot.height != r.height
            || snapshot.framebuffer.len() != r.framebuffer.len()
        {
            warn!(
                "nv2a snapshot is {}x{}, expected {}x{}",
                snapshot.width, snapshot.height, r.width, r.height
            );
            return false;
        }
        r.registers.fill(0);
        for &(index, value) in &snapshot.registers {
            if let Some(slot) = r.registers.get_mut(index as usize) {
                *slot = value;
            }
        }
        r.texture_memory.fill(0);
        for (page, bytes) in &snapshot.texture_pages {
            let start = *page as usize * TEXTURE_PAGE;
            if let Some(dst) = r.texture_memory.get_mut(start..start + bytes.len()) {
                dst.copy_from_slice(bytes);
            }
        }
        for (unit, desc) in r.texture_units.iter_mut().zip(&snapshot.texture_units) {
            *unit = *desc;
        }
        r.framebuffer.copy_from_slice(&snapshot.framebuffer);
        r.depth.fill(1.0);
        r.vertices.clear();
        r.get = snapshot.get;
        r.put = snapshot.put;
        r.clip = snapshot.clip;
        r.primitive = snapshot.primitive;
        r.current_texture = snapshot.current_texture as usize % texture::TEXTURE_UNITS;
        r.depth_test = snapshot.depth_test;
        r.alpha_blend = snapshot.alpha_blend;
        r.bilinear = snapshot.bilinear;
        r.frame_count = snapshot.frame_count;
        r.state = GpuState::Ready;
        true
    }

    /// Stop the worker. The GPU is left in the terminal `Error` state.
    pub fn shutdown(&mut self) {
        self.shared.lock().state = GpuState::Error;
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(GpuMessage::Shutdown);
        }
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("nv2a worker panicked");
            }
        }
    }
}

impl Drop for GpuCore {
    fn drop(&mut self) {
        self.shutdown();
    }
}
