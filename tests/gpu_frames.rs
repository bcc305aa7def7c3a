#![cfg(not(target_arch = "wasm32"))]

use std::sync::{Arc, Mutex};

use xvm::devices::nv2a::renderer::{
    primitive_command, register_command, vertex_command, CLEAR_COLOR, CMD_TEXTURE_UPLOAD, REG_DEPTH_TEST, REG_PUT,
    REG_TEXTURE_BASE, REG_TEXTURE_FILTER, VERTEX_COLOR, VERTEX_UV,
};
use xvm::devices::nv2a::{GpuConfig, GpuCore, GpuState, PrimitiveType};
use xvm::memory::{Bus, MemoryBus, MemoryConfig, GPU_BASE, GPU_SIZE};

const RED: u32 = 0xFFFF_0000;
const BLUE: u32 = 0xFF00_00FF;

struct Rig {
    bus: Arc<MemoryBus>,
    gpu: GpuCore,
    cursor: u32,
}

impl Rig {
    fn new(width: u32, height: u32) -> Self {
        let bus = Arc::new(MemoryBus::new(MemoryConfig {
            ram_size: 0x10_0000,
            ..MemoryConfig::default()
        }));
        let gpu = GpuCore::new(
            GpuConfig {
                width,
                height,
                texture_memory: 0x1_0000,
                vsync: false,
                queue_depth: 256,
                ..GpuConfig::default()
            },
            Some(bus.clone()),
        );
        bus.map_region(GPU_BASE, GPU_SIZE, gpu.mmio_handler()).unwrap();
        Rig { bus, gpu, cursor: 0 }
    }

    /// Store command words through the bus and kick them with PUT
    fn submit(&mut self, words: &[u32]) {
        for w in words {
            self.bus.write32(GPU_BASE + self.cursor, *w).unwrap();
            self.cursor += 4;
        }
        self.bus.write32(GPU_BASE + REG_PUT * 4, self.cursor).unwrap();
        self.gpu.sync();
    }
}

fn f(x: f32) -> u32 {
    x.to_bits()
}

fn triangle(z: f32, color: u32) -> Vec<u32> {
    vec![
        primitive_command(PrimitiveType::Triangles),
        vertex_command(VERTEX_COLOR, 3),
        f(0.0), f(0.0), f(z), color,
        f(1.0), f(0.0), f(z), color,
        f(0.0), f(1.0), f(z), color,
    ]
}

#[test]
fn test_red_triangle_scenario() {
    let mut rig = Rig::new(4, 4);
    rig.submit(&triangle(0.0, RED));
    let fb = rig.gpu.framebuffer();
    for y in 0..4 {
        for x in 0..4 {
            let expected = if x + y <= 4 { RED } else { CLEAR_COLOR };
            assert_eq!(fb[y * 4 + x], expected, "pixel ({}, {})", x, y);
        }
    }
    assert_eq!(rig.gpu.frame_count(), 1);
    assert_eq!(rig.gpu.state(), GpuState::Ready);
}

#[test]
fn test_depth_test_independent_of_draw_order() {
    let render = |first: (f32, u32), second: (f32, u32)| {
        let mut rig = Rig::new(8, 8);
        let mut words = vec![register_command(REG_DEPTH_TEST), 1];
        words.extend(triangle(first.0, first.1));
        words.extend(triangle(second.0, second.1));
        rig.submit(&words);
        rig.gpu.framebuffer()
    };
    let near_first = render((0.2, RED), (0.8, BLUE));
    let far_first = render((0.8, BLUE), (0.2, RED));
    assert_eq!(near_first, far_first);
    assert_eq!(near_first[0], RED);
}

#[test]
fn test_textured_quad_uses_uploaded_texels() {
    let mut rig = Rig::new(4, 4);
    // One white texel at texture address 0x100, staged in RAM at the same address
    rig.bus.write32(0x100, 0xFFFF_FFFF).unwrap();
    let unit0 = |field: u32| register_command(REG_TEXTURE_BASE + field);
    let mut words = vec![
        CMD_TEXTURE_UPLOAD as u32, 0x100, 4,
        unit0(0), 1, // width
        unit0(1), 1, // height
        unit0(3), 0x100, // address
        unit0(4), 4, // pitch
        register_command(REG_TEXTURE_FILTER), 0,
        primitive_command(PrimitiveType::Quads),
        vertex_command(VERTEX_UV | VERTEX_COLOR, 4),
    ];
    for (x, y) in [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)] {
        words.extend([f(x), f(y), f(0.0), f(0.5), f(0.5), RED]);
    }
    rig.submit(&words);
    let fb = rig.gpu.framebuffer();
    // 50/50 blend of red and white
    assert_eq!(fb[5], 0xFFFF_7F7F);
    assert!(rig.gpu.texture_unit(0).unwrap().is_bound());
}

#[test]
fn test_special_commands_are_not_fatal() {
    let mut rig = Rig::new(4, 4);
    let messages = Arc::new(Mutex::new(Vec::new()));
    let sink = messages.clone();
    rig.gpu.set_debug_callback(Some(Box::new(move |m: &str| {
        sink.lock().unwrap().push(m.to_string());
    })));
    rig.submit(&[0xE5, 0x0000_2233]);
    assert_eq!(rig.gpu.state(), GpuState::Ready);
    assert!(!messages.lock().unwrap().is_empty());
}
