#![cfg(not(target_arch = "wasm32"))]

use xvm::cpu::regs::{EAX, EBX, ECX, EDX};
use xvm::cpu::{Cpu, CpuConfig, CpuState};
use xvm::memory::{Bus, MemoryBus, MemoryConfig};

fn bus_with(code: &[(u32, &[u8])]) -> MemoryBus {
    let bus = MemoryBus::new(MemoryConfig {
        ram_size: 0x10_0000,
        ..MemoryConfig::default()
    });
    for (addr, bytes) in code {
        bus.load_binary(bytes, *addr).unwrap();
    }
    bus
}

fn run(bus: &MemoryBus, jit: bool) -> Cpu {
    let mut cpu = Cpu::new(CpuConfig {
        jit_enabled: jit,
        jit_threshold: 1,
        ..CpuConfig::default()
    });
    cpu.regs.eip = 0x1000;
    cpu.regs.set(xvm::cpu::regs::ESP, 0x8000);
    for _ in 0..100 {
        if cpu.state() != CpuState::Running {
            break;
        }
        cpu.execute(1000, bus).unwrap();
    }
    assert_eq!(cpu.state(), CpuState::Halted);
    cpu
}

#[rustfmt::skip]
const LOOP: &[u8] = &[
    0xB8, 0x00, 0x00, 0x00, 0x00,       // mov eax, 0
    0xB9, 0x01, 0x00, 0x00, 0x00,       // mov ecx, 1
    0xBF, 0x20, 0x00, 0x00, 0x00,       // mov edi, 32
    0xBE, 0x03, 0x00, 0x00, 0x00,       // mov esi, 3
    // loop:
    0x01, 0xC8,                         // add eax, ecx
    0x89, 0xC3,                         // mov ebx, eax
    0x01, 0xF1,                         // add ecx, esi
    0x89, 0x05, 0x00, 0x20, 0x00, 0x00, // mov [0x2000], eax
    0x8B, 0x15, 0x00, 0x20, 0x00, 0x00, // mov edx, [0x2000]
    0xE8, 0x04, 0x00, 0x00, 0x00,       // call func
    0x4F,                               // dec edi
    0x75, 0xE6,                         // jnz loop
    0xF4,                               // hlt
    // func:
    0x03, 0xD0,                         // add edx, eax
    0xC3,                               // ret
];

#[test]
fn test_jit_matches_interpreter() {
    let interp_bus = bus_with(&[(0x1000, LOOP)]);
    let jit_bus = bus_with(&[(0x1000, LOOP)]);
    let interp = run(&interp_bus, false);
    let jitted = run(&jit_bus, true);

    assert!(jitted.jit().stats.compiles > 0);
    assert_eq!(interp.jit().stats.compiles, 0);
    assert_eq!(interp.regs, jitted.regs);
    assert_eq!(interp_bus.read32(0x2000).unwrap(), jit_bus.read32(0x2000).unwrap());

    // eax = sum of 1, 4, 7, ... over 32 terms
    let expected: u32 = (0..32).map(|i| 1 + 3 * i).sum();
    assert_eq!(interp.regs.get(EAX), expected);
    assert_eq!(interp.regs.get(EBX), expected);
    assert_eq!(interp.regs.get(EDX), expected * 2);
    assert_eq!(interp.regs.get(ECX), 1 + 3 * 32);
}

#[rustfmt::skip]
const PATCH: &[u8] = &[
    0xBF, 0x05, 0x00, 0x00, 0x00,       // mov edi, 5
    0xB9, 0x02, 0x00, 0x00, 0x00,       // mov ecx, 2
    0xBC, 0x00, 0x80, 0x00, 0x00,       // mov esp, 0x8000
    0xBA, 0x89, 0xD8, 0xC3, 0x00,       // mov edx, bytes of "mov eax, ebx; ret"
    0xBB, 0x07, 0x00, 0x00, 0x00,       // mov ebx, 7
    // loop:
    0xE8, 0xE2, 0x00, 0x00, 0x00,       // call 0x1100
    0x4F,                               // dec edi
    0x75, 0xF8,                         // jnz loop
    0x89, 0x15, 0x00, 0x11, 0x00, 0x00, // mov [0x1100], edx
    0xE8, 0xD4, 0x00, 0x00, 0x00,       // call 0x1100
    0xF4,                               // hlt
];

const FUNC: &[u8] = &[0x89, 0xC8, 0xC3]; // mov eax, ecx; ret

#[test]
fn test_guest_store_invalidates_compiled_block() {
    for jit in [false, true] {
        let bus = bus_with(&[(0x1000, PATCH), (0x1100, FUNC)]);
        let cpu = run(&bus, jit);
        assert_eq!(cpu.regs.get(EAX), 7, "jit = {}", jit);
        if jit {
            assert!(cpu.jit().stats.compiles > 0);
            assert!(cpu.jit().stats.invalidations > 0);
        }
    }
}

#[rustfmt::skip]
const SELF_PATCH_MAIN: &[u8] = &[
    0xBE, 0x89, 0xD1, 0xC3, 0x00,       // mov esi, bytes of "mov ecx, edx; ret"
    0xB8, 0x01, 0xD1, 0xC3, 0x90,       // mov eax, bytes of "add ecx, edx; ret; nop"
    0xBB, 0x04, 0x11, 0x00, 0x00,       // mov ebx, 0x1104
    0xBA, 0x07, 0x00, 0x00, 0x00,       // mov edx, 7
    0xBF, 0x04, 0x00, 0x00, 0x00,       // mov edi, 4
    0xBD, 0x00, 0x00, 0x00, 0x00,       // mov ebp, 0
    // loop:
    0x89, 0x35, 0x04, 0x11, 0x00, 0x00, // mov [0x1104], esi
    0xB9, 0x05, 0x00, 0x00, 0x00,       // mov ecx, 5
    0xE8, 0xD2, 0x00, 0x00, 0x00,       // call 0x1100
    0x01, 0xCD,                         // add ebp, ecx
    0x4F,                               // dec edi
    0x75, 0xEB,                         // jnz loop
    0xF4,                               // hlt
];

#[rustfmt::skip]
const SELF_PATCH_FUNC: &[u8] = &[
    0x89, 0x03,                         // mov [ebx], eax (rewrites the next-but-one op)
    0x89, 0xC0,                         // mov eax, eax
    0x89, 0xD1,                         // mov ecx, edx
    0xC3,                               // ret
];

#[test]
fn test_block_that_rewrites_itself_matches_interpreter() {
    let interp_bus = bus_with(&[(0x1000, SELF_PATCH_MAIN), (0x1100, SELF_PATCH_FUNC)]);
    let jit_bus = bus_with(&[(0x1000, SELF_PATCH_MAIN), (0x1100, SELF_PATCH_FUNC)]);
    let interp = run(&interp_bus, false);
    let jitted = run(&jit_bus, true);

    // Every call ends in the patched "add ecx, edx"
    assert_eq!(interp.regs.get(ECX), 12);
    assert_eq!(interp.regs.get(xvm::cpu::regs::EBP), 48);
    assert!(jitted.jit().stats.compiles > 0);
    assert_eq!(jitted.regs, interp.regs);
}
