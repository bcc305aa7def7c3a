//! Software rasterization of the vertex buffer

use super::renderer::{PrimitiveType, Renderer, Vertex};
use super::texture;

/// Per-channel average of two ARGB colors, alpha included
pub fn blend_colors(a: u32, b: u32) -> u32 {
    let mut out = 0u32;
    for shift in [0u32, 8, 16, 24] {
        let ca = (a >> shift) & 0xFF;
        let cb = (b >> shift) & 0xFF;
        out |= ((ca + cb) / 2) << shift;
    }
    out
}

/// Source-over compositing of `src` onto `dst`
pub fn blend_pixels(src: u32, dst: u32) -> u32 {
    let ch = |c: u32, shift: u32| ((c >> shift) & 0xFF) as f32 / 255.0;
    let (sa, da) = (ch(src, 24), ch(dst, 24));
    let a = sa + da * (1.0 - sa);
    if a < 0.001 {
        return 0;
    }
    let mut out = ((a * 255.0 + 0.5) as u32 & 0xFF) << 24;
    for shift in [0u32, 8, 16] {
        let c = (ch(src, shift) * sa + ch(dst, shift) * da * (1.0 - sa)) / a;
        out |= ((c * 255.0 + 0.5) as u32 & 0xFF) << shift;
    }
    out
}

/// Pixel coordinates are clamped to this many pixels either side of the
/// origin, which keeps every edge product well inside i64
const GUARD_BAND: i64 = 1 << 20;

impl Renderer {
    fn to_pixel(&self, v: &Vertex) -> (i64, i64) {
        let scale = |c: f32, size: u32| ((c * size as f32) as i64).clamp(-GUARD_BAND, GUARD_BAND);
        (scale(v.x, self.width), scale(v.y, self.height))
    }

    /// Inclusive pixel bounds of the clip rect intersected with the framebuffer
    fn clip_bounds(&self) -> (i64, i64, i64, i64) {
        (
            (self.clip.left as i64).max(0),
            (self.clip.top as i64).max(0),
            (self.clip.right as i64).min(self.width as i64) - 1,
            (self.clip.bottom as i64).min(self.height as i64) - 1,
        )
    }

    fn in_clip(&self, x: i64, y: i64) -> bool {
        let (left, top, right, bottom) = self.clip_bounds();
        x >= left && y >= top && x <= right && y <= bottom
    }

    fn put_pixel(&mut self, x: i64, y: i64, color: u32) {
        let idx = (y as u32 * self.width + x as u32) as usize;
        self.framebuffer[idx] = if self.alpha_blend {
            blend_pixels(color, self.framebuffer[idx])
        } else {
            color
        };
    }

    /// Rasterize the vertex buffer according to the current primitive
    pub fn rasterize(&mut self) {
        let Some(primitive) = self.primitive else {
            if !self.vertices.is_empty() {
                self.log_error("draw skipped: no valid primitive type");
            }
            return;
        };
        let verts = std::mem::take(&mut self.vertices);
        let n = verts.len();
        match primitive {
            PrimitiveType::Points => {
                for v in &verts {
                    self.draw_point(v);
                }
            }
            PrimitiveType::Lines => {
                for pair in verts.chunks_exact(2) {
                    self.draw_line(&pair[0], &pair[1]);
                }
            }
            PrimitiveType::LineStrip => {
                for i in 1..n {
                    self.draw_line(&verts[i - 1], &verts[i]);
                }
            }
            PrimitiveType::Triangles => {
                for tri in verts.chunks_exact(3) {
                    self.draw_triangle(&tri[0], &tri[1], &tri[2]);
                }
            }
            PrimitiveType::TriangleStrip => {
                for i in 2..n {
                    self.draw_triangle(&verts[i - 2], &verts[i - 1], &verts[i]);
                }
            }
            PrimitiveType::TriangleFan | PrimitiveType::Polygon => {
                for i in 2..n {
                    self.draw_triangle(&verts[0], &verts[i - 1], &verts[i]);
                }
            }
            PrimitiveType::Quads => {
                for q in verts.chunks_exact(4) {
                    self.draw_quad(&q[0], &q[1], &q[2], &q[3]);
                }
            }
            PrimitiveType::QuadStrip => {
                let mut i = 3;
                while i < n {
                    self.draw_quad(&verts[i - 3], &verts[i - 2], &verts[i - 1], &verts[i]);
                    i += 2;
                }
            }
        }
        // Hand the allocation back for the next frame
        self.vertices = verts;
    }

    pub fn draw_point(&mut self, v: &Vertex) {
        let (x, y) = self.to_pixel(v);
        if self.in_clip(x, y) {
            self.put_pixel(x, y, v.color);
        }
    }

    /// Bresenham line in the first vertex's color
    pub fn draw_line(&mut self, v0: &Vertex, v1: &Vertex) {
        let (mut x0, mut y0) = self.to_pixel(v0);
        let (x1, y1) = self.to_pixel(v1);
        let dx = (x1 - x0).abs();
        let dy = (y1 - y0).abs();
        let sx = if x0 < x1 { 1 } else { -1 };
        let sy = if y0 < y1 { 1 } else { -1 };
        let mut err = dx - dy;
        loop {
            if self.in_clip(x0, y0) {
                self.put_pixel(x0, y0, v0.color);
            }
            if x0 == x1 && y0 == y1 {
                break;
            }
            let e2 = 2 * err;
            if e2 > -dy {
                err -= dy;
                x0 += sx;
            }
            if e2 < dx {
                err += dx;
                y0 += sy;
            }
        }
    }

    pub fn draw_quad(&mut self, v0: &Vertex, v1: &Vertex, v2: &Vertex, v3: &Vertex) {
        self.draw_triangle(v0, v1, v2);
        self.draw_triangle(v2, v3, v0);
    }

    /// Edge-function triangle fill. Color is flat (first vertex); depth
    /// and texture coordinates are interpolated.
    pub fn draw_triangle(&mut self, v0: &Vertex, v1: &Vertex, v2: &Vertex) {
        let (x0, y0) = self.to_pixel(v0);
        let (x1, y1) = self.to_pixel(v1);
        let (x2, y2) = self.to_pixel(v2);

        let (left, top, right, bottom) = self.clip_bounds();
        let min_x = x0.min(x1).min(x2).max(left);
        let max_x = x0.max(x1).max(x2).min(right);
        let min_y = y0.min(y1).min(y2).max(top);
        let max_y = y0.max(y1).max(y2).min(bottom);

        let area = ((x1 - x0) * (y2 - y0) - (x2 - x0) * (y1 - y0)) as f32;
        if area.abs() < 0.5 {
            return;
        }
        let inv_area = 1.0 / area;

        let tex = self.texture_units[self.current_texture];
        for y in min_y..=max_y {
            for x in min_x..=max_x {
                let w0 = ((x1 - x) * (y2 - y) - (x2 - x) * (y1 - y)) as f32 * inv_area;
                let w1 = ((x2 - x) * (y0 - y) - (x0 - x) * (y2 - y)) as f32 * inv_area;
                let w2 = ((x0 - x) * (y1 - y) - (x1 - x) * (y0 - y)) as f32 * inv_area;
                if w0 < 0.0 || w1 < 0.0 || w2 < 0.0 {
                    continue;
                }

                let idx = (y as u32 * self.width + x as u32) as usize;
                // Depth stays in [0, 1]; NaN lands on 0 through max
                let z = (w0 * v0.z + w1 * v1.z + w2 * v2.z).max(0.0).min(1.0);
                if self.depth_test {
                    if z > self.depth[idx] {
                        continue;
                    }
                    self.depth[idx] = z;
                }

                let color = if tex.is_bound() {
                    let u = w0 * v0.u + w1 * v1.u + w2 * v2.u;
                    let v = w0 * v0.v + w1 * v1.v + w2 * v2.v;
                    let texel = texture::sample(&self.texture_memory, &tex, u, v, self.bilinear);
                    blend_colors(v0.color, texel)
                } else {
                    v0.color
                };
                self.put_pixel(x, y, color);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::nv2a::renderer::{CLEAR_COLOR, REG_CLIP_LEFT, REG_CLIP_RIGHT};
    use crate::devices::nv2a::GpuConfig;

    fn renderer(w: u32, h: u32) -> Renderer {
        Renderer::new(&GpuConfig {
            width: w,
            height: h,
            texture_memory: 0x1000,
            ..GpuConfig::default()
        })
    }

    fn vtx(x: f32, y: f32, z: f32, color: u32) -> Vertex {
        Vertex { x, y, z, color, ..Vertex::default() }
    }

    #[test]
    fn test_blend_colors_average() {
        assert_eq!(blend_colors(0xFFFF_0000, 0xFFFF_FFFF), 0xFFFF_7F7F);
        assert_eq!(blend_colors(0x0000_0000, 0xFE00_0000), 0x7F00_0000);
    }

    #[test]
    fn test_blend_pixels_opaque_source_wins() {
        assert_eq!(blend_pixels(0xFF12_3456, 0xFFAB_CDEF), 0xFF12_3456);
        assert_eq!(blend_pixels(0x0000_0000, 0x0000_0000), 0);
    }

    #[test]
    fn test_triangle_fill() {
        let mut r = renderer(4, 4);
        let red = 0xFFFF_0000;
        r.draw_triangle(&vtx(0.0, 0.0, 0.0, red), &vtx(1.0, 0.0, 0.0, red), &vtx(0.0, 1.0, 0.0, red));
        for y in 0..4 {
            for x in 0..4 {
                let expected = if x + y <= 4 { red } else { CLEAR_COLOR };
                assert_eq!(r.framebuffer[y * 4 + x], expected, "pixel ({}, {})", x, y);
            }
        }
    }

    #[test]
    fn test_degenerate_triangle_draws_nothing() {
        let mut r = renderer(4, 4);
        let c = 0xFF00_FF00;
        r.draw_triangle(&vtx(0.0, 0.0, 0.0, c), &vtx(0.5, 0.5, 0.0, c), &vtx(1.0, 1.0, 0.0, c));
        assert!(r.framebuffer.iter().all(|p| *p == CLEAR_COLOR));
    }

    #[test]
    fn test_clip_rect_limits_fill() {
        let mut r = renderer(4, 4);
        r.clip.right = 2;
        let c = 0xFF00_00FF;
        r.draw_quad(&vtx(0.0, 0.0, 0.0, c), &vtx(1.0, 0.0, 0.0, c), &vtx(1.0, 1.0, 0.0, c), &vtx(0.0, 1.0, 0.0, c));
        for y in 0..4 {
            assert_eq!(r.framebuffer[y * 4 + 1], c);
            assert_eq!(r.framebuffer[y * 4 + 2], CLEAR_COLOR);
        }
    }

    #[test]
    fn test_huge_coordinates_are_clamped() {
        let mut r = renderer(4, 4);
        let c = 0xFF12_3456;
        r.draw_quad(&vtx(-1e9, -1e9, 0.0, c), &vtx(1e9, -1e9, 0.0, c), &vtx(1e9, 1e9, 0.0, c), &vtx(-1e9, 1e9, 0.0, c));
        assert!(r.framebuffer.iter().all(|p| *p == c));
        r.draw_line(&vtx(-1e9, 0.0, 0.0, 7), &vtx(f32::INFINITY, 0.0, 0.0, 7));
        assert_eq!(&r.framebuffer[..4], &[7; 4]);
    }

    #[test]
    fn test_extreme_clip_rect() {
        let mut r = renderer(4, 4);
        r.write_register(REG_CLIP_RIGHT, 0x8000_0000);
        r.write_register(REG_CLIP_LEFT, 0x8000_0000);
        let c = 0xFF00_FF00;
        r.draw_triangle(&vtx(0.0, 0.0, 0.0, c), &vtx(1.0, 0.0, 0.0, c), &vtx(0.0, 1.0, 0.0, c));
        r.draw_point(&vtx(0.0, 0.0, 0.0, c));
        assert!(r.framebuffer.iter().all(|p| *p == CLEAR_COLOR));
    }

    #[test]
    fn test_depth_is_clamped_to_unit_range() {
        let mut r = renderer(4, 4);
        r.depth_test = true;
        let c = 0xFFFF_FFFF;
        r.draw_quad(&vtx(0.0, 0.0, -5.0, c), &vtx(1.0, 0.0, -5.0, c), &vtx(1.0, 1.0, -5.0, c), &vtx(0.0, 1.0, -5.0, c));
        assert!(r.depth.iter().all(|d| *d == 0.0));
        r.draw_quad(&vtx(0.0, 0.0, 9.0, c), &vtx(1.0, 0.0, 9.0, c), &vtx(1.0, 1.0, 9.0, c), &vtx(0.0, 1.0, 9.0, c));
        assert!(r.depth.iter().all(|d| (0.0..=1.0).contains(d)));
    }

    #[test]
    fn test_line_and_points() {
        let mut r = renderer(4, 4);
        r.draw_line(&vtx(0.0, 0.0, 0.0, 1), &vtx(0.75, 0.75, 0.0, 2));
        for i in 0..4 {
            assert_eq!(r.framebuffer[i * 4 + i], 1);
        }
        r.draw_point(&vtx(0.75, 0.0, 0.0, 9));
        assert_eq!(r.framebuffer[3], 9);
        // Outside the framebuffer: ignored
        r.draw_point(&vtx(1.0, 1.0, 0.0, 5));
    }

    #[test]
    fn test_strip_grouping() {
        let mut r = renderer(8, 8);
        let c = 0xFFFF_FFFF;
        r.primitive = Some(PrimitiveType::TriangleStrip);
        r.vertices = vec![
            vtx(0.0, 0.0, 0.0, c),
            vtx(0.0, 1.0, 0.0, c),
            vtx(1.0, 0.0, 0.0, c),
            vtx(1.0, 1.0, 0.0, c),
        ];
        r.rasterize();
        assert!(r.framebuffer.iter().all(|p| *p == c));
    }
}
