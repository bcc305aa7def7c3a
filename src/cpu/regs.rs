//! x86 register file

use serde::{Deserialize, Serialize};

// General purpose register encoding order
pub const EAX: u8 = 0;
pub const ECX: u8 = 1;
pub const EDX: u8 = 2;
pub const EBX: u8 = 3;
pub const ESP: u8 = 4;
pub const EBP: u8 = 5;
pub const ESI: u8 = 6;
pub const EDI: u8 = 7;

pub const REG_NAMES: [&str; 8] = ["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"];

// EFLAGS bits
pub const FLAG_CF: u32 = 1 << 0;
pub const FLAG_RESERVED: u32 = 1 << 1;
pub const FLAG_PF: u32 = 1 << 2;
pub const FLAG_AF: u32 = 1 << 4;
pub const FLAG_ZF: u32 = 1 << 6;
pub const FLAG_SF: u32 = 1 << 7;
pub const FLAG_IF: u32 = 1 << 9;
pub const FLAG_DF: u32 = 1 << 10;
pub const FLAG_OF: u32 = 1 << 11;
/// The six arithmetic status flags
pub const ARITH_FLAGS: u32 = 0x8D5;

/// Power-on values
pub const RESET_EIP: u32 = 0xFF00_0000;
pub const RESET_EFLAGS: u32 = 0x0000_0002;
pub const RESET_CS: u16 = 0xF000;
pub const RESET_CR0: u32 = 0x6000_0011;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segments {
    pub cs: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
    pub ss: u16,
}

/// One 128-bit SSE register viewed as four lanes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Xmm(pub [u32; 4]);

impl Xmm {
    pub fn from_f32(lanes: [f32; 4]) -> Self {
        Xmm(lanes.map(f32::to_bits))
    }

    pub fn as_f32(&self) -> [f32; 4] {
        self.0.map(f32::from_bits)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registers {
    pub gpr: [u32; 8],
    pub eip: u32,
    pub eflags: u32,
    pub seg: Segments,
    pub cr0: u32,
    pub cr2: u32,
    pub cr3: u32,
    pub cr4: u32,
    pub xmm: [Xmm; 8],
}

impl Default for Registers {
    fn default() -> Self {
        Self::new()
    }
}

impl Registers {
    pub fn new() -> Self {
        Registers {
            gpr: [0; 8],
            eip: RESET_EIP,
            eflags: RESET_EFLAGS,
            seg: Segments {
                cs: RESET_CS,
                ..Segments::default()
            },
            cr0: RESET_CR0,
            cr2: 0,
            cr3: 0,
            cr4: 0,
            xmm: [Xmm::default(); 8],
        }
    }

    #[inline(always)]
    pub fn get(&self, reg: u8) -> u32 {
        self.gpr[(reg & 7) as usize]
    }

    #[inline(always)]
    pub fn set(&mut self, reg: u8, value: u32) {
        self.gpr[(reg & 7) as usize] = value;
    }

    #[inline(always)]
    pub fn flag(&self, mask: u32) -> bool {
        self.eflags & mask != 0
    }

    /// Replace the arithmetic flags, leaving system flags untouched
    #[inline(always)]
    pub fn set_arith_flags(&mut self, flags: u32) {
        self.eflags = (self.eflags & !ARITH_FLAGS) | (flags & ARITH_FLAGS) | FLAG_RESERVED;
    }

    /// Evaluate an x86 condition code (low nibble of Jcc/SETcc)
    pub fn condition(&self, cc: u8) -> bool {
        let cf = self.flag(FLAG_CF);
        let zf = self.flag(FLAG_ZF);
        let sf = self.flag(FLAG_SF);
        let of = self.flag(FLAG_OF);
        let pf = self.flag(FLAG_PF);
        let result = match cc >> 1 {
            0 => of,
            1 => cf,
            2 => zf,
            3 => cf || zf,
            4 => sf,
            5 => pf,
            6 => sf != of,
            _ => zf || sf != of,
        };
        // Odd codes are the negated forms
        result ^ (cc & 1 != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_on_values() {
        let regs = Registers::new();
        assert_eq!(regs.eip, 0xFF00_0000);
        assert_eq!(regs.eflags, 0x2);
        assert_eq!(regs.seg.cs, 0xF000);
        assert_eq!(regs.seg.ds, 0);
        assert_eq!(regs.cr0, 0x6000_0011);
    }

    #[test]
    fn test_conditions() {
        let mut regs = Registers::new();
        regs.set_arith_flags(FLAG_ZF);
        assert!(regs.condition(0x4)); // E
        assert!(!regs.condition(0x5)); // NE
        assert!(regs.condition(0x6)); // BE
        assert!(regs.condition(0xE)); // LE

        regs.set_arith_flags(FLAG_SF);
        assert!(regs.condition(0xC)); // L
        assert!(!regs.condition(0xD)); // GE
        regs.set_arith_flags(FLAG_SF | FLAG_OF);
        assert!(regs.condition(0xD));
        assert!(regs.condition(0xF)); // G
    }
}
