//! Instruction byte fetching and ModRM/SIB decoding
//!
//! Decoding is symbolic: a memory operand is returned as base/index/disp so
//! the JIT scanner can reason about it without resolving register values.

use super::regs::Registers;
use crate::memory::{Bus, BusError};

/// A memory operand `[base + index << scale + disp]`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemRef {
    pub base: Option<u8>,
    pub index: Option<(u8, u8)>,
    pub disp: i32,
}

impl MemRef {
    #[inline(always)]
    pub fn resolve(&self, regs: &Registers) -> u32 {
        let mut addr = self.disp as u32;
        if let Some(base) = self.base {
            addr = addr.wrapping_add(regs.get(base));
        }
        if let Some((index, scale)) = self.index {
            addr = addr.wrapping_add(regs.get(index) << scale);
        }
        addr
    }
}

/// The r/m side of a ModRM byte
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rm {
    Reg(u8),
    Mem(MemRef),
}

/// Decoded ModRM: the reg field plus the r/m operand
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModRm {
    pub reg: u8,
    pub rm: Rm,
}

/// Reads instruction bytes from the bus starting at `start`
pub struct Cursor<'a> {
    pub bus: &'a dyn Bus,
    /// Address of the first byte of the current instruction
    pub start: u32,
    /// Next byte to fetch; after execution this is the next eip
    pub pc: u32,
}

impl<'a> Cursor<'a> {
    pub fn new(bus: &'a dyn Bus, start: u32) -> Self {
        Cursor { bus, start, pc: start }
    }

    #[inline(always)]
    pub fn fetch8(&mut self) -> Result<u8, BusError> {
        let b = self.bus.read8(self.pc)?;
        self.pc = self.pc.wrapping_add(1);
        Ok(b)
    }

    pub fn fetch16(&mut self) -> Result<u16, BusError> {
        let lo = self.fetch8()? as u16;
        let hi = self.fetch8()? as u16;
        Ok(lo | (hi << 8))
    }

    pub fn fetch32(&mut self) -> Result<u32, BusError> {
        let mut value = 0u32;
        for i in 0..4 {
            value |= (self.fetch8()? as u32) << (i * 8);
        }
        Ok(value)
    }

    /// Fetch a sign-extended 8-bit immediate
    pub fn fetch_simm8(&mut self) -> Result<u32, BusError> {
        Ok(self.fetch8()? as i8 as i32 as u32)
    }

    /// Decode a ModRM byte (plus SIB and displacement) with 32-bit addressing
    pub fn modrm(&mut self) -> Result<ModRm, BusError> {
        let byte = self.fetch8()?;
        let md = byte >> 6;
        let reg = (byte >> 3) & 7;
        let rm = byte & 7;

        if md == 3 {
            return Ok(ModRm { reg, rm: Rm::Reg(rm) });
        }

        let mut mem = MemRef {
            base: Some(rm),
            index: None,
            disp: 0,
        };

        if rm == 4 {
            let sib = self.fetch8()?;
            let scale = sib >> 6;
            let index = (sib >> 3) & 7;
            let base = sib & 7;
            if index != 4 {
                mem.index = Some((index, scale));
            }
            if base == 5 && md == 0 {
                mem.base = None;
                mem.disp = self.fetch32()? as i32;
            } else {
                mem.base = Some(base);
            }
        } else if rm == 5 && md == 0 {
            mem.base = None;
            mem.disp = self.fetch32()? as i32;
        }

        match md {
            1 => mem.disp = mem.disp.wrapping_add(self.fetch8()? as i8 as i32),
            2 => mem.disp = mem.disp.wrapping_add(self.fetch32()? as i32),
            _ => {}
        }

        Ok(ModRm { reg, rm: Rm::Mem(mem) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBus, MemoryConfig};

    fn bus_with(code: &[u8]) -> MemoryBus {
        let bus = MemoryBus::new(MemoryConfig {
            ram_size: 0x10000,
            ..MemoryConfig::default()
        });
        bus.load_binary(code, 0x100).unwrap();
        bus
    }

    #[test]
    fn test_register_form() {
        let bus = bus_with(&[0xC8]); // mod=3 reg=1 rm=0
        let mut cur = Cursor::new(&bus, 0x100);
        let m = cur.modrm().unwrap();
        assert_eq!(m, ModRm { reg: 1, rm: Rm::Reg(0) });
        assert_eq!(cur.pc, 0x101);
    }

    #[test]
    fn test_disp8_and_disp32() {
        // [ebp - 4]
        let bus = bus_with(&[0x45, 0xFC]);
        let mut cur = Cursor::new(&bus, 0x100);
        let m = cur.modrm().unwrap();
        assert_eq!(
            m.rm,
            Rm::Mem(MemRef { base: Some(5), index: None, disp: -4 })
        );

        // [0x00001234]
        let bus = bus_with(&[0x05, 0x34, 0x12, 0x00, 0x00]);
        let mut cur = Cursor::new(&bus, 0x100);
        let m = cur.modrm().unwrap();
        assert_eq!(m.rm, Rm::Mem(MemRef { base: None, index: None, disp: 0x1234 }));
        assert_eq!(cur.pc, 0x105);
    }

    #[test]
    fn test_sib() {
        // [eax + ecx*4 + 8]
        let bus = bus_with(&[0x44, 0x88, 0x08]);
        let mut cur = Cursor::new(&bus, 0x100);
        let m = cur.modrm().unwrap();
        let Rm::Mem(mem) = m.rm else { panic!("expected memory operand") };
        let mut regs = Registers::new();
        regs.set(0, 0x1000);
        regs.set(1, 3);
        assert_eq!(mem.resolve(&regs), 0x1000 + 12 + 8);
    }
}
