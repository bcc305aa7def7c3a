#![cfg(not(target_arch = "wasm32"))]

use std::io::Write;
use std::sync::{Arc, Mutex};

use xvm::cpu::regs::{EAX, ESP};
use xvm::cpu::CpuState;
use xvm::devices::GpuConfig;
use xvm::kernel::xbe::build_image;
use xvm::memory::{MemoryConfig, BIOS_SIZE};
use xvm::session::MAIN_STACK_SIZE;
use xvm::{EmulatorSession, InputEvent, SessionConfig, SessionError};

const CODE_VA: u32 = 0x0011_0000;

fn config() -> SessionConfig {
    SessionConfig {
        memory: MemoryConfig {
            ram_size: 4 * 1024 * 1024,
            ..MemoryConfig::default()
        },
        gpu: GpuConfig {
            width: 16,
            height: 16,
            texture_memory: 0x1000,
            vsync: false,
            queue_depth: 64,
            ..GpuConfig::default()
        },
        cycles_per_frame: 1000,
        ..SessionConfig::default()
    }
}

/// Prints "hello xbox" through the kernel and halts
fn hello_xbe() -> Vec<u8> {
    #[rustfmt::skip]
    let mut section = vec![
        0xB8, 0x01, 0x00, 0x00, 0x00,       // mov eax, DebugPrint
        0xBB, 0x00, 0x01, 0x11, 0x00,       // mov ebx, CODE_VA + 0x100
        0x0F, 0x3F, 0x01,                   // syscall
        0xF4,                               // hlt
    ];
    section.resize(0x100, 0x90);
    section.extend_from_slice(b"hello xbox\0");
    build_image(0x0001_0000, CODE_VA - 0x0001_0000, &[(CODE_VA, &section, 0x1000)])
}

#[test]
fn test_boot_from_bios_file() {
    let mut bios = tempfile::NamedTempFile::new().unwrap();
    bios.write_all(&vec![0u8; BIOS_SIZE as usize]).unwrap();

    let mut session = EmulatorSession::new(config()).unwrap();
    assert!(session.load_bios(bios.path()));
    session.reset();
    assert_eq!(session.cpu().regs.eip, 0xFF00_0000);

    let bus = session.bus().clone();
    session.cpu_mut().execute_step(&*bus).unwrap();
    assert_eq!(session.cpu().regs.eip, 0xFF00_0004);
    assert_eq!(session.cpu().state(), CpuState::Running);
}

#[test]
fn test_xbe_debug_print() {
    let mut session = EmulatorSession::new(config()).unwrap();
    let printed = Arc::new(Mutex::new(Vec::new()));
    let sink = printed.clone();
    session
        .kernel_mut()
        .set_debug_output(Some(Box::new(move |m: &str| sink.lock().unwrap().push(m.to_string()))));

    let entry = session.load_xbe(&hello_xbe()).unwrap();
    assert_eq!(entry, CODE_VA);
    let esp = session.cpu().regs.get(ESP);
    assert_eq!(esp % 0x1000, 0);
    assert!(esp > MAIN_STACK_SIZE);

    let report = session.run_frame().unwrap();
    assert_eq!(report.syscalls, 1);
    assert_eq!(report.cpu_state, CpuState::Halted);
    assert_eq!(session.cpu().regs.get(EAX), 0);
    assert_eq!(printed.lock().unwrap().as_slice(), ["hello xbox".to_string()]);
}

#[test]
fn test_truncated_xbe_rejected() {
    let mut session = EmulatorSession::new(config()).unwrap();
    let image = hello_xbe();
    let err = session.load_xbe(&image[..image.len() - 4]).unwrap_err();
    assert!(matches!(err, SessionError::Load(_)));
    assert!(session.kernel().loaded_image().is_none());
}

#[test]
fn test_save_state_round_trip_through_file() {
    let mut session = EmulatorSession::new(config()).unwrap();
    session.load_xbe(&hello_xbe()).unwrap();
    session.run_frame().unwrap();
    session.push_input(InputEvent::joystick(0, 0.5, 0.5));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.bin");
    session.save_state_to(&path).unwrap();

    let mut restored = EmulatorSession::new(config()).unwrap();
    restored.load_state_from(&path).unwrap();
    assert_eq!(restored.cpu().regs, session.cpu().regs);
    assert_eq!(restored.cpu().state(), CpuState::Halted);
    assert_eq!(restored.frame(), 1);
    assert_eq!(
        restored.bus().read_bytes(CODE_VA + 0x100, 10).unwrap(),
        b"hello xbox".to_vec()
    );
    assert_eq!(
        restored.kernel().loaded_image().map(|i| i.entry_point),
        Some(CODE_VA)
    );
    assert_eq!(restored.framebuffer(), session.framebuffer());

    // A different RAM size is refused
    let mut other = EmulatorSession::new(SessionConfig {
        memory: MemoryConfig {
            ram_size: 8 * 1024 * 1024,
            ..MemoryConfig::default()
        },
        ..config()
    })
    .unwrap();
    assert!(other.load_state_from(&path).is_err());
}

#[test]
fn test_frame_limit_stops_run() {
    let mut session = EmulatorSession::new(SessionConfig {
        frame_limit: Some(3),
        ..config()
    })
    .unwrap();
    session.load_binary(&[0xEB, 0xFE], 0x1000).unwrap(); // jmp $
    session.cpu_mut().regs.eip = 0x1000;
    assert_eq!(session.run(10).unwrap(), 3);
    assert_eq!(session.frame(), 3);
    assert_eq!(session.cpu().state(), CpuState::Running);
}
