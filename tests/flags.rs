use xvm::cpu::alu::{add32, sub32};
use xvm::cpu::regs::{FLAG_AF, FLAG_CF, FLAG_OF, FLAG_PF, FLAG_SF, FLAG_ZF};
use xvm::cpu::{Cpu, CpuConfig, CpuState};
use xvm::memory::{MemoryBus, MemoryConfig};

#[test]
fn test_add_signed_overflow() {
    let (result, flags) = add32(0x7FFF_FFFF, 1);
    assert_eq!(result, 0x8000_0000);
    assert_ne!(flags & FLAG_OF, 0);
    assert_ne!(flags & FLAG_SF, 0);
    assert_eq!(flags & FLAG_ZF, 0);
    assert_eq!(flags & FLAG_CF, 0);
    assert_ne!(flags & FLAG_AF, 0);
}

#[test]
fn test_sub_equal_operands() {
    let (result, flags) = sub32(5, 5);
    assert_eq!(result, 0);
    assert_ne!(flags & FLAG_ZF, 0);
    assert_eq!(flags & FLAG_SF, 0);
    assert_eq!(flags & FLAG_CF, 0);
    // Zero has even parity
    assert_ne!(flags & FLAG_PF, 0);
}

#[test]
fn test_carry_and_borrow() {
    let (result, flags) = add32(0xFFFF_FFFF, 2);
    assert_eq!(result, 1);
    assert_ne!(flags & FLAG_CF, 0);
    assert_eq!(flags & FLAG_OF, 0);

    let (result, flags) = sub32(3, 5);
    assert_eq!(result, 0xFFFF_FFFE);
    assert_ne!(flags & FLAG_CF, 0);
    assert_ne!(flags & FLAG_SF, 0);
}

#[test]
fn test_flags_through_execution() {
    let bus = MemoryBus::new(MemoryConfig {
        ram_size: 0x10_0000,
        ..MemoryConfig::default()
    });
    #[rustfmt::skip]
    let code = [
        0xB8, 0xFF, 0xFF, 0xFF, 0x7F, // mov eax, 0x7fffffff
        0x83, 0xC0, 0x01,             // add eax, 1
        0xF4,                         // hlt
    ];
    bus.load_binary(&code, 0x1000).unwrap();
    let mut cpu = Cpu::new(CpuConfig::default());
    cpu.regs.eip = 0x1000;
    cpu.execute(10, &bus).unwrap();
    assert_eq!(cpu.state(), CpuState::Halted);
    assert!(cpu.regs.flag(FLAG_OF));
    assert!(cpu.regs.flag(FLAG_SF));
    assert!(!cpu.regs.flag(FLAG_ZF));
    assert!(!cpu.regs.flag(FLAG_CF));
}
