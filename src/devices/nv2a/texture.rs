//! Texture units and sampling
//!
//! Texels are 32-bit ARGB words stored little-endian in texture memory.
//! Linear textures place texel (x, y) at `address + y * pitch + x * 4`.
//! Swizzled textures interleave the coordinate bits (x in the lowest bit)
//! for as long as both dimensions have bits left; the longer side's
//! remaining bits follow. Out-of-range texel reads return 0 rather than
//! touching memory past the end.

use serde::{Deserialize, Serialize};

pub const TEXTURE_UNITS: usize = 32;

/// Register words per descriptor at `REG_TEXTURE_BASE + unit * 8`
pub const DESCRIPTOR_STRIDE: u32 = 8;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextureUnit {
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub address: u32,
    pub pitch: u32,
    pub mip_levels: u32,
    pub swizzled: bool,
}

impl TextureUnit {
    pub fn is_bound(&self) -> bool {
        self.width != 0 && self.height != 0
    }

    /// Program one descriptor field (0 width .. 6 swizzled)
    pub fn set_field(&mut self, field: u32, value: u32) -> bool {
        match field {
            0 => self.width = value,
            1 => self.height = value,
            2 => self.format = value,
            3 => self.address = value,
            4 => self.pitch = value,
            5 => self.mip_levels = value.max(1),
            6 => self.swizzled = value & 1 != 0,
            _ => return false,
        }
        true
    }
}

/// Texel index of (x, y) in a swizzled `width` x `height` texture
pub fn swizzle_index(x: u32, y: u32, width: u32, height: u32) -> u64 {
    let mut index = 0u64;
    let mut out_bit = 0;
    for bit in 0..32 {
        let x_left = (1u64 << bit) < width as u64;
        let y_left = (1u64 << bit) < height as u64;
        if !x_left && !y_left {
            break;
        }
        if x_left {
            index |= (((x >> bit) & 1) as u64) << out_bit;
            out_bit += 1;
        }
        if y_left {
            index |= (((y >> bit) & 1) as u64) << out_bit;
            out_bit += 1;
        }
    }
    index
}

fn texel(memory: &[u8], tex: &TextureUnit, x: u32, y: u32) -> u32 {
    let offset = if tex.swizzled {
        swizzle_index(x, y, tex.width, tex.height) * 4
    } else {
        y as u64 * tex.pitch as u64 + x as u64 * 4
    };
    let Ok(addr) = usize::try_from(tex.address as u64 + offset) else {
        return 0;
    };
    match memory.get(addr..addr.saturating_add(4)) {
        Some(b) => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
        None => 0,
    }
}

/// Sample `tex` at normalized (u, v). Coordinates wrap to their
/// fractional part; an unbound unit samples opaque white.
pub fn sample(memory: &[u8], tex: &TextureUnit, u: f32, v: f32, bilinear: bool) -> u32 {
    if !tex.is_bound() {
        return 0xFFFF_FFFF;
    }
    let u = u.rem_euclid(1.0);
    let v = v.rem_euclid(1.0);
    let x = u * (tex.width - 1) as f32;
    let y = v * (tex.height - 1) as f32;
    if bilinear {
        sample_bilinear(memory, tex, x, y)
    } else {
        sample_nearest(memory, tex, x, y)
    }
}

fn sample_nearest(memory: &[u8], tex: &TextureUnit, x: f32, y: f32) -> u32 {
    let xi = ((x + 0.5) as u32).min(tex.width - 1);
    let yi = ((y + 0.5) as u32).min(tex.height - 1);
    texel(memory, tex, xi, yi)
}

fn sample_bilinear(memory: &[u8], tex: &TextureUnit, x: f32, y: f32) -> u32 {
    let x0 = x as u32;
    let y0 = y as u32;
    let x1 = (x0 + 1).min(tex.width - 1);
    let y1 = (y0 + 1).min(tex.height - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let c00 = texel(memory, tex, x0, y0);
    let c01 = texel(memory, tex, x1, y0);
    let c10 = texel(memory, tex, x0, y1);
    let c11 = texel(memory, tex, x1, y1);
    bilinear_interpolate(c00, c01, c10, c11, fx, fy)
}

pub fn bilinear_interpolate(c00: u32, c01: u32, c10: u32, c11: u32, fx: f32, fy: f32) -> u32 {
    let mut out = 0u32;
    for shift in [0u32, 8, 16, 24] {
        let ch = |c: u32| ((c >> shift) & 0xFF) as f32;
        let top = ch(c00) * (1.0 - fx) + ch(c01) * fx;
        let bottom = ch(c10) * (1.0 - fx) + ch(c11) * fx;
        let value = top * (1.0 - fy) + bottom * fy;
        out |= (value as u32 & 0xFF) << shift;
    }
    out
}
