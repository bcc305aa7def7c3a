//! SSE packed single-precision operations (0F xx)

use super::decode::{Cursor, Rm};
use super::regs::Xmm;
use super::{Cpu, CpuError};
use crate::memory::BusError;

impl Cpu {
    fn read_xmm_operand(&self, cur: &Cursor<'_>, rm: Rm, aligned: bool) -> Result<Xmm, CpuError> {
        match rm {
            Rm::Reg(r) => Ok(self.regs.xmm[r as usize]),
            Rm::Mem(m) => {
                let addr = m.resolve(&self.regs);
                if aligned && addr % 16 != 0 {
                    return Err(BusError::Misaligned { addr, width: 16 }.into());
                }
                let mut lanes = [0u32; 4];
                for (i, lane) in lanes.iter_mut().enumerate() {
                    *lane = cur.bus.read32(addr.wrapping_add(i as u32 * 4))?;
                }
                Ok(Xmm(lanes))
            }
        }
    }

    fn write_xmm_operand(&mut self, cur: &Cursor<'_>, rm: Rm, value: Xmm, aligned: bool) -> Result<(), CpuError> {
        match rm {
            Rm::Reg(r) => self.regs.xmm[r as usize] = value,
            Rm::Mem(m) => {
                let addr = m.resolve(&self.regs);
                if aligned && addr % 16 != 0 {
                    return Err(BusError::Misaligned { addr, width: 16 }.into());
                }
                // All four lanes or none
                cur.bus.check_writable(addr, 16)?;
                for (i, lane) in value.0.iter().enumerate() {
                    self.write_mem32(cur.bus, addr.wrapping_add(i as u32 * 4), *lane)?;
                }
            }
        }
        Ok(())
    }

    /// Execute a packed-float instruction. Returns false if `opcode` is not one.
    pub(super) fn exec_sse(&mut self, cur: &mut Cursor<'_>, opcode: u8) -> Result<bool, CpuError> {
        let op: fn(f32, f32) -> f32 = match opcode {
            0x10 | 0x28 => {
                let m = cur.modrm()?;
                let v = self.read_xmm_operand(cur, m.rm, opcode == 0x28)?;
                self.regs.xmm[m.reg as usize] = v;
                return Ok(true);
            }
            0x11 | 0x29 => {
                let m = cur.modrm()?;
                let v = self.regs.xmm[m.reg as usize];
                self.write_xmm_operand(cur, m.rm, v, opcode == 0x29)?;
                return Ok(true);
            }
            0x57 => {
                let m = cur.modrm()?;
                let src = self.read_xmm_operand(cur, m.rm, true)?;
                let dst = &mut self.regs.xmm[m.reg as usize];
                for (d, s) in dst.0.iter_mut().zip(src.0) {
                    *d ^= s;
                }
                return Ok(true);
            }
            0x58 => |a, b| a + b,
            0x59 => |a, b| a * b,
            0x5C => |a, b| a - b,
            0x5E => |a, b| a / b,
            _ => return Ok(false),
        };

        let m = cur.modrm()?;
        let src = self.read_xmm_operand(cur, m.rm, true)?.as_f32();
        let dst = self.regs.xmm[m.reg as usize].as_f32();
        let mut out = [0f32; 4];
        for i in 0..4 {
            out[i] = op(dst[i], src[i]);
        }
        self.regs.xmm[m.reg as usize] = Xmm::from_f32(out);
        Ok(true)
    }
}
