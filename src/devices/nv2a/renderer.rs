//! NV2A command processor
//!
//! The register bank doubles as the command FIFO: the CPU stores command
//! words at word indices `0..FIFO_WORDS` and then writes the PUT register
//! with the byte offset one past the last word. A frame drains the words
//! between the GET cursor and PUT, rasterizes the vertices they produced
//! and clears the vertex buffer.

use serde::{Deserialize, Serialize};

use super::texture::{TextureUnit, DESCRIPTOR_STRIDE, TEXTURE_UNITS};
use super::{ClipRect, GpuConfig, GpuState};
use crate::memory::MemoryBus;

/// Words in the register bank
pub const REGISTER_COUNT: usize = 0x10000;
/// Leading words of the bank used as command FIFO
pub const FIFO_WORDS: u32 = 0x1000;
/// PUT: byte offset the CPU has written up to (kicks a frame)
pub const REG_PUT: u32 = 0xFFF0;
/// GET: byte offset the GPU has consumed up to (read-only)
pub const REG_GET: u32 = 0xFFF1;

pub const REG_DEPTH_TEST: u32 = 0x1000;
pub const REG_ALPHA_BLEND: u32 = 0x1004;
pub const REG_CLIP_LEFT: u32 = 0x1010;
pub const REG_CLIP_TOP: u32 = 0x1011;
pub const REG_CLIP_RIGHT: u32 = 0x1012;
pub const REG_CLIP_BOTTOM: u32 = 0x1013;
pub const REG_TEXTURE_UNIT: u32 = 0x2000;
pub const REG_TEXTURE_BASE: u32 = 0x2100;
pub const REG_TEXTURE_FILTER: u32 = 0x3000;

// Command opcodes (low byte of the command word)
pub const CMD_NOP: u8 = 0x00;
pub const CMD_PRIMITIVE: u8 = 0x20;
pub const CMD_VERTEX: u8 = 0x40;
pub const CMD_VERTEX_ALT: u8 = 0x60;
pub const CMD_TEXTURE_UPLOAD: u8 = 0x80;
pub const CMD_REGISTER_WRITE: u8 = 0xA0;
pub const CMD_SPECIAL: u8 = 0xE0;

// Vertex format bits (bits 8..16 of a vertex command); position is always present
pub const VERTEX_UV: u32 = 0x02;
pub const VERTEX_COLOR: u32 = 0x04;
pub const VERTEX_FOG: u32 = 0x08;

pub const CLEAR_COLOR: u32 = 0xFF00_0000;

/// Build a vertex command word
pub fn vertex_command(format: u32, count: u32) -> u32 {
    CMD_VERTEX as u32 | (format & 0xFF) << 8 | (count & 0xFFFF) << 16
}

/// Build a register write command word (followed by the value word)
pub fn register_command(reg: u32) -> u32 {
    CMD_REGISTER_WRITE as u32 | (reg & 0xFF_FFFF) << 8
}

/// Build a set-primitive command word
pub fn primitive_command(primitive: PrimitiveType) -> u32 {
    CMD_PRIMITIVE as u32 | (primitive as u32) << 8
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PrimitiveType {
    Points = 0,
    Lines = 1,
    LineStrip = 2,
    Triangles = 3,
    TriangleStrip = 4,
    TriangleFan = 5,
    Quads = 6,
    QuadStrip = 7,
    Polygon = 8,
}

impl PrimitiveType {
    pub fn from_u32(value: u32) -> Option<Self> {
        use PrimitiveType::*;
        Some(match value {
            0 => Points,
            1 => Lines,
            2 => LineStrip,
            3 => Triangles,
            4 => TriangleStrip,
            5 => TriangleFan,
            6 => Quads,
            7 => QuadStrip,
            8 => Polygon,
            _ => return None,
        })
    }
}

/// Positions are normalized to [0, 1] and scaled by the framebuffer size
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Vertex {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub u: f32,
    pub v: f32,
    pub color: u32,
    pub fog: f32,
}

pub type GpuDebugCallback = Box<dyn Fn(&str) + Send>;

pub struct Renderer {
    pub(super) width: u32,
    pub(super) height: u32,
    pub(super) framebuffer: Vec<u32>,
    pub(super) depth: Vec<f32>,
    pub(super) texture_memory: Vec<u8>,
    pub(super) registers: Vec<u32>,
    pub(super) texture_units: [TextureUnit; TEXTURE_UNITS],
    pub(super) vertices: Vec<Vertex>,
    /// Byte offset of the next command word (GET)
    pub(super) get: u32,
    pub(super) put: u32,
    pub(super) clip: ClipRect,
    pub(super) state: GpuState,
    /// None after an unknown primitive type: rasterization is skipped
    pub(super) primitive: Option<PrimitiveType>,
    pub(super) current_texture: usize,
    pub(super) depth_test: bool,
    pub(super) alpha_blend: bool,
    pub(super) bilinear: bool,
    pub(super) frame_count: u64,
    debug_callback: Option<GpuDebugCallback>,
}

impl Renderer {
    pub fn new(config: &GpuConfig) -> Self {
        let pixels = (config.width * config.height) as usize;
        let mut r = Renderer {
            width: config.width,
            height: config.height,
            framebuffer: vec![CLEAR_COLOR; pixels],
            depth: vec![1.0; pixels],
            texture_memory: vec![0; config.texture_memory],
            registers: vec![0; REGISTER_COUNT],
            texture_units: [TextureUnit::default(); TEXTURE_UNITS],
            vertices: Vec::with_capacity(1024),
            get: 0,
            put: 0,
            clip: ClipRect::full(config.width, config.height),
            state: GpuState::Ready,
            primitive: Some(PrimitiveType::Triangles),
            current_texture: 0,
            depth_test: false,
            alpha_blend: false,
            bilinear: true,
            frame_count: 0,
            debug_callback: None,
        };
        r.reset();
        r
    }

    /// Clear registers, cursors, texture descriptors and the framebuffer.
    /// Texture memory is kept.
    pub fn reset(&mut self) {
        self.registers.fill(0);
        self.texture_units = [TextureUnit::default(); TEXTURE_UNITS];
        self.vertices.clear();
        self.get = 0;
        self.put = 0;
        self.clip = ClipRect::full(self.width, self.height);
        self.state = GpuState::Ready;
        self.primitive = Some(PrimitiveType::Triangles);
        self.current_texture = 0;
        self.depth_test = false;
        self.alpha_blend = false;
        self.bilinear = true;
        self.clear(CLEAR_COLOR);
    }

    pub fn clear(&mut self, color: u32) {
        self.framebuffer.fill(color);
        self.depth.fill(1.0);
    }

    pub fn set_debug_callback(&mut self, callback: Option<GpuDebugCallback>) {
        self.debug_callback = callback;
    }

    pub(super) fn log(&self, message: &str) {
        match &self.debug_callback {
            Some(cb) => cb(message),
            None => tracing::debug!("nv2a: {}", message),
        }
    }

    pub(super) fn log_error(&self, message: &str) {
        tracing::error!("nv2a: {}", message);
        if let Some(cb) = &self.debug_callback {
            cb(message);
        }
    }

    pub fn state(&self) -> GpuState {
        self.state
    }

    pub fn framebuffer(&self) -> &[u32] {
        &self.framebuffer
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn texture_unit(&self, unit: usize) -> Option<&TextureUnit> {
        self.texture_units.get(unit)
    }

    /// Read a bank word; GET and PUT reflect the live cursors
    pub fn read_register(&self, index: u32) -> u32 {
        match index {
            REG_GET => self.get,
            REG_PUT => self.put,
            _ => self.registers.get(index as usize).copied().unwrap_or(0),
        }
    }

    /// Store a bank word as the CPU sees it. Returns true if it was a PUT
    /// write, i.e. a frame should run.
    pub fn write_word(&mut self, index: u32, value: u32) -> bool {
        match index {
            REG_PUT => {
                // A PUT behind the cursor restarts the ring at offset 0
                if value < self.get {
                    self.get = 0;
                }
                self.put = value.min(FIFO_WORDS * 4);
                true
            }
            REG_GET => false,
            _ => {
                if let Some(slot) = self.registers.get_mut(index as usize) {
                    *slot = value;
                }
                false
            }
        }
    }

    /// Register write from the command stream, with side effects
    pub fn write_register(&mut self, reg: u32, value: u32) {
        let Some(slot) = self.registers.get_mut(reg as usize) else {
            self.log_error(&format!("register write out of bounds: {:#06x}", reg));
            return;
        };
        *slot = value;
        match reg {
            REG_DEPTH_TEST => self.depth_test = value & 1 != 0,
            REG_ALPHA_BLEND => self.alpha_blend = value & 1 != 0,
            REG_TEXTURE_UNIT => self.current_texture = value as usize % TEXTURE_UNITS,
            REG_TEXTURE_FILTER => self.bilinear = value & 1 != 0,
            REG_CLIP_LEFT => self.clip.left = value as i32,
            REG_CLIP_TOP => self.clip.top = value as i32,
            REG_CLIP_RIGHT => self.clip.right = value as i32,
            REG_CLIP_BOTTOM => self.clip.bottom = value as i32,
            r if (REG_TEXTURE_BASE..REG_TEXTURE_BASE + TEXTURE_UNITS as u32 * DESCRIPTOR_STRIDE).contains(&r) => {
                let unit = ((r - REG_TEXTURE_BASE) / DESCRIPTOR_STRIDE) as usize;
                let field = (r - REG_TEXTURE_BASE) % DESCRIPTOR_STRIDE;
                self.texture_units[unit].set_field(field, value);
            }
            _ => {}
        }
    }

    fn next_word(&mut self) -> u32 {
        let index = (self.get / 4) as usize;
        self.get = self.get.wrapping_add(4);
        if self.get > self.put {
            // Reading past PUT: the command was truncated
            return 0;
        }
        self.registers.get(index).copied().unwrap_or(0)
    }

    fn next_f32(&mut self) -> f32 {
        f32::from_bits(self.next_word())
    }

    /// Consume commands from GET up to PUT
    pub fn process_commands(&mut self, ram: Option<&MemoryBus>) {
        while self.get < self.put {
            let command = self.next_word();
            let opcode = (command & 0xFF) as u8;
            match opcode {
                CMD_NOP => {}
                CMD_PRIMITIVE => {
                    let kind = (command >> 8) & 0xFF;
                    self.primitive = PrimitiveType::from_u32(kind);
                    if self.primitive.is_none() {
                        self.log_error(&format!("unsupported primitive type {}", kind));
                    }
                }
                CMD_VERTEX | CMD_VERTEX_ALT => self.decode_vertices(command),
                CMD_TEXTURE_UPLOAD => {
                    let dest = self.next_word();
                    let size = self.next_word();
                    self.upload_texture(ram, dest, size);
                }
                CMD_REGISTER_WRITE => {
                    let value = self.next_word();
                    self.write_register(command >> 8, value);
                }
                op if op >= CMD_SPECIAL => {
                    self.log(&format!("unhandled special command {:#010x}", command));
                }
                _ => self.log(&format!("unknown command {:#010x}", command)),
            }
        }
        // Never leave the cursor past PUT after a truncated command
        self.get = self.get.min(self.put);
    }

    fn decode_vertices(&mut self, command: u32) {
        let format = (command >> 8) & 0xFF;
        let count = command >> 16;
        for _ in 0..count {
            if self.get >= self.put {
                self.log_error("vertex data truncated");
                break;
            }
            let mut v = Vertex {
                x: self.next_f32(),
                y: self.next_f32(),
                z: self.next_f32(),
                ..Vertex::default()
            };
            if format & VERTEX_UV != 0 {
                v.u = self.next_f32();
                v.v = self.next_f32();
            }
            if format & VERTEX_COLOR != 0 {
                v.color = self.next_word();
            }
            if format & VERTEX_FOG != 0 {
                v.fog = self.next_f32();
            }
            self.vertices.push(v);
        }
    }

    /// Copy `size` bytes of RAM at `dest` into texture memory at `dest`
    pub fn upload_texture(&mut self, ram: Option<&MemoryBus>, dest: u32, size: u32) {
        let end = dest as u64 + size as u64;
        if end > self.texture_memory.len() as u64 {
            self.log_error(&format!("texture upload out of bounds: {:#x}+{:#x}", dest, size));
            return;
        }
        let Some(ram) = ram else {
            self.log_error("no memory attached for texture upload");
            return;
        };
        match ram.read_bytes(dest, size) {
            Ok(data) => {
                self.texture_memory[dest as usize..end as usize].copy_from_slice(&data);
            }
            Err(e) => self.log_error(&format!("texture upload source unreadable: {}", e)),
        }
    }

    /// Drain the FIFO and rasterize the resulting vertices
    pub fn run_frame(&mut self, ram: Option<&MemoryBus>) {
        if self.state == GpuState::Error {
            return;
        }
        self.state = GpuState::Processing;
        self.process_commands(ram);
        self.rasterize();
        self.vertices.clear();
        self.frame_count += 1;
        self.state = GpuState::Ready;
    }
}
