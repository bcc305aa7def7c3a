//! GPU worker thread
//!
//! CPU-side register writes are forwarded over a bounded channel; the
//! single consumer applies them in order under the render mutex. A write
//! to PUT runs a frame. Vsync pacing sleeps with the render mutex released
//! so the host can keep reading the framebuffer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender, TrySendError};
use tracing::{debug, warn};

use super::renderer::{Renderer, REG_PUT};
use super::GpuState;
use crate::memory::{MemoryBus, MmioHandler};

pub(super) enum GpuMessage {
    Write { index: u32, value: u32 },
    /// Reply once every earlier message has been handled
    Sync(Sender<()>),
    Shutdown,
}

/// State shared between the host, the MMIO handler and the worker
pub(super) struct GpuShared {
    pub renderer: Mutex<Renderer>,
    pub vsync: AtomicBool,
    pub frame_interval: Duration,
}

impl GpuShared {
    pub fn lock(&self) -> std::sync::MutexGuard<'_, Renderer> {
        self.renderer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(super) fn spawn(
    shared: Arc<GpuShared>,
    rx: Receiver<GpuMessage>,
    ram: Option<Arc<MemoryBus>>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("nv2a".into())
        .spawn(move || run(shared, rx, ram))
}

fn run(shared: Arc<GpuShared>, rx: Receiver<GpuMessage>, ram: Option<Arc<MemoryBus>>) {
    debug!("nv2a worker started");
    while let Ok(message) = rx.recv() {
        match message {
            GpuMessage::Write { index, value } => {
                let frame_start = Instant::now();
                let ran_frame = {
                    let mut r = shared.lock();
                    if r.state() == GpuState::Error {
                        break;
                    }
                    let kick = r.write_word(index, value);
                    if kick {
                        r.run_frame(ram.as_deref());
                    }
                    kick
                };
                if ran_frame && shared.vsync.load(Ordering::Relaxed) {
                    let elapsed = frame_start.elapsed();
                    if elapsed < shared.frame_interval {
                        thread::sleep(shared.frame_interval - elapsed);
                    }
                }
            }
            GpuMessage::Sync(reply) => {
                let _ = reply.send(());
            }
            GpuMessage::Shutdown => break,
        }
    }
    shared.lock().state = GpuState::Error;
    debug!("nv2a worker stopped");
}

/// Bus-facing register window
pub struct GpuMmio {
    pub(super) shared: Arc<GpuShared>,
    /// None when running inline without a worker
    pub(super) tx: Option<Sender<GpuMessage>>,
}

impl MmioHandler for GpuMmio {
    fn read32(&self, offset: u32) -> u32 {
        self.shared.lock().read_register(offset / 4)
    }

    fn write32(&self, offset: u32, value: u32) {
        let index = offset / 4;
        let Some(tx) = &self.tx else {
            let mut r = self.shared.lock();
            if r.state() != GpuState::Error {
                r.write_word(index, value);
            }
            return;
        };
        match tx.try_send(GpuMessage::Write { index, value }) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                // Back-pressure: wait for the worker to catch up
                if index == REG_PUT {
                    debug!("nv2a queue full at kick");
                }
                if tx.send(message).is_err() {
                    warn!("nv2a worker gone, dropped write at {:#x}", offset);
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("nv2a worker gone, dropped write at {:#x}", offset);
            }
        }
    }
}
