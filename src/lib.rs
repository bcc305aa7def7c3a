//! Original Xbox virtual machine substrate
//!
//! An x86 interpreter with a threshold-triggered block JIT, a memory bus
//! with write-back cache blocks and memory-mapped device windows, and an
//! NV2A-style command-stream rasterizer running on its own worker. The
//! [`EmulatorSession`] ties them together; the [`Emulator`] type exposes
//! the session to JavaScript.

use std::fmt::Display;

use wasm_bindgen::prelude::*;

pub mod cpu;
pub mod devices;
pub mod input;
pub mod kernel;
pub mod memory;
pub mod session;
pub mod snapshot;

pub use input::{InputAction, InputEvent, InputKind};
pub use session::{EmulatorSession, FrameReport, SessionConfig, SessionError};
pub use snapshot::Snapshot;

/// Initialize panic hook for better error messages in browser console
#[wasm_bindgen(start)]
pub fn init() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

/// Log an error and turn it into a JS exception value
fn js_error(e: impl Display) -> JsValue {
    let message = e.to_string();
    #[cfg(target_arch = "wasm32")]
    web_sys::console::error_1(&JsValue::from_str(&message));
    #[cfg(not(target_arch = "wasm32"))]
    tracing::error!("{}", message);
    JsValue::from_str(&message)
}

/// Main emulator interface exposed to JavaScript
#[wasm_bindgen]
pub struct Emulator {
    session: EmulatorSession,
}

#[wasm_bindgen]
impl Emulator {
    /// Create a new emulator instance
    #[wasm_bindgen(constructor)]
    pub fn new(memory_size_mb: u32) -> Result<Emulator, JsValue> {
        if memory_size_mb == 0 || memory_size_mb > 1024 {
            return Err(js_error(format!("Invalid RAM size: {}MB", memory_size_mb)));
        }
        let mut config = SessionConfig::default();
        config.memory.ram_size = memory_size_mb * 1024 * 1024;
        // The page drives frames itself
        config.gpu.vsync = false;
        let session = EmulatorSession::new(config).map_err(js_error)?;
        Ok(Emulator { session })
    }

    /// Install a BIOS image; it must be exactly 1 MiB
    pub fn load_bios(&mut self, data: &[u8]) -> Result<(), JsValue> {
        self.session.load_bios_bytes(data).map_err(js_error)
    }

    /// Load an executable and jump to its entry point
    pub fn load_xbe(&mut self, data: &[u8]) -> Result<u32, JsValue> {
        self.session.load_xbe(data).map_err(js_error)
    }

    /// Load raw code into RAM at the specified address
    pub fn load_binary(&mut self, data: &[u8], load_addr: u32) -> Result<(), JsValue> {
        self.session.load_binary(data, load_addr).map_err(js_error)
    }

    /// Run one frame. Returns the CPU steps executed.
    pub fn run_frame(&mut self) -> Result<u32, JsValue> {
        self.session.run_frame().map(|r| r.steps).map_err(js_error)
    }

    pub fn enable_jit(&mut self, enable: bool) {
        self.session.cpu_mut().enable_jit(enable);
    }

    /// ARGB pixels of the current frame
    pub fn framebuffer(&self) -> Vec<u32> {
        self.session.framebuffer()
    }

    pub fn width(&self) -> u32 {
        self.session.framebuffer_size().0
    }

    pub fn height(&self) -> u32 {
        self.session.framebuffer_size().1
    }

    pub fn key_event(&self, code: u32, pressed: bool) {
        let action = if pressed { InputAction::Press } else { InputAction::Release };
        self.session.push_input(InputEvent::key(code, action));
    }

    pub fn joystick_event(&self, port: u32, x: f32, y: f32) {
        self.session.push_input(InputEvent::joystick(port, x, y));
    }

    /// Current eip for debugging
    pub fn get_eip(&self) -> u32 {
        self.session.cpu().regs.eip
    }

    pub fn get_instruction_count(&self) -> f64 {
        self.session.cpu().instruction_count as f64
    }

    /// eax, ecx, edx, ebx, esp, ebp, esi, edi, eip, eflags
    pub fn get_registers(&self) -> Vec<u32> {
        let r = &self.session.cpu().regs;
        let mut out = r.gpr.to_vec();
        out.push(r.eip);
        out.push(r.eflags);
        out
    }

    /// Read guest memory; unreadable bytes come back as zero
    pub fn read_memory(&self, addr: u32, size: u32) -> Vec<u8> {
        match self.session.bus().read_bytes(addr, size) {
            Ok(bytes) => bytes,
            Err(_) => vec![0; size as usize],
        }
    }

    pub fn dump_registers(&self) -> String {
        self.session.cpu().dump_registers()
    }

    pub fn reset(&mut self) {
        self.session.reset();
    }

    /// Save state (bincode, zstd-compressed)
    pub fn get_state(&self) -> Result<Vec<u8>, JsValue> {
        self.session.save_state().to_bytes().map_err(js_error)
    }

    /// Restore a state produced by `get_state` on an emulator with the same RAM size
    pub fn set_state(&mut self, state: &[u8]) -> Result<(), JsValue> {
        let snapshot = Snapshot::from_bytes(state).map_err(js_error)?;
        self.session.restore_state(&snapshot).map_err(js_error)
    }
}

/// Decompress zstd-compressed data
/// Useful for loading compressed images in the browser
#[wasm_bindgen]
pub fn decompress_zstd(data: &[u8]) -> Result<Vec<u8>, JsValue> {
    zstd::stream::decode_all(data).map_err(|e| js_error(format!("Zstd decompression error: {}", e)))
}

/// Decompress gzip-compressed data
#[wasm_bindgen]
pub fn decompress_gzip(data: &[u8]) -> Result<Vec<u8>, JsValue> {
    gunzip(data).map_err(|e| js_error(format!("Gzip decompression error: {}", e)))
}

/// Inflate a gzip stream; used for compressed BIOS and executable images
pub fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    use std::io::Read;

    let mut decoder = flate2::read::GzDecoder::new(data);
    let mut result = Vec::new();
    decoder.read_to_end(&mut result)?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_emulator_creation() {
        let emu = Emulator::new(4).unwrap();
        assert_eq!(emu.get_eip(), 0xFF00_0000);
        assert_eq!(emu.get_registers().len(), 10);
    }

    #[test]
    fn test_state_round_trip() {
        let mut emu = Emulator::new(4).unwrap();
        emu.load_binary(&[0x90, 0x90, 0xF4], 0x1000).unwrap();
        emu.session.cpu_mut().regs.eip = 0x1000;
        emu.run_frame().unwrap();

        let state = emu.get_state().unwrap();
        let mut emu2 = Emulator::new(4).unwrap();
        emu2.set_state(&state).unwrap();
        assert_eq!(emu.get_registers(), emu2.get_registers());
        assert_eq!(emu2.read_memory(0x1000, 3), vec![0x90, 0x90, 0xF4]);
    }

    #[test]
    fn test_gunzip() {
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(b"xbox").unwrap();
        let packed = enc.finish().unwrap();
        assert_eq!(gunzip(&packed).unwrap(), b"xbox");
    }
}
