//! Interpreter dispatch
//!
//! One-byte opcodes are dispatched through a 256-entry handler table built
//! on first use. A handler decodes its operands from the cursor, applies
//! the instruction and leaves `cur.pc` at the next eip (branches overwrite
//! it with their target).

use std::sync::OnceLock;

use tracing::warn;

use super::alu::{self, AluOp};
use super::decode::{Cursor, Rm};
use super::regs::{EAX, EDX, ESP, FLAG_CF, FLAG_DF, FLAG_IF, FLAG_OF};
use super::{Cpu, CpuError, CpuState};
use crate::memory::Bus;

type Handler = fn(&mut Cpu, &mut Cursor<'_>, u8) -> Result<(), CpuError>;

fn table() -> &'static [Handler; 256] {
    static TABLE: OnceLock<[Handler; 256]> = OnceLock::new();
    TABLE.get_or_init(build_table)
}

fn build_table() -> [Handler; 256] {
    let mut t: [Handler; 256] = [op_invalid; 256];
    t[0x00] = op_padding;
    for row in 0..8u8 {
        let base = row << 3;
        t[(base | 1) as usize] = op_alu_rm_reg;
        t[(base | 3) as usize] = op_alu_reg_rm;
        t[(base | 5) as usize] = op_alu_eax_imm;
    }
    t[0x0F] = op_two_byte;
    for r in 0..8 {
        t[0x40 + r] = op_inc_reg;
        t[0x48 + r] = op_dec_reg;
        t[0x50 + r] = op_push_reg;
        t[0x58 + r] = op_pop_reg;
        t[0xB8 + r] = op_mov_reg_imm;
    }
    t[0x68] = op_push_imm;
    t[0x6A] = op_push_imm;
    for cc in 0..16 {
        t[0x70 + cc] = op_jcc_rel8;
    }
    t[0x81] = op_group1;
    t[0x83] = op_group1;
    t[0x85] = op_test_rm_reg;
    t[0x89] = op_mov_rm_reg;
    t[0x8B] = op_mov_reg_rm;
    t[0x8D] = op_lea;
    t[0x90] = op_nop;
    for r in 1..8 {
        t[0x90 + r] = op_xchg_eax;
    }
    t[0x99] = op_cdq;
    t[0xA1] = op_mov_eax_moffs;
    t[0xA3] = op_mov_moffs_eax;
    t[0xC1] = op_group2;
    t[0xD1] = op_group2;
    t[0xD3] = op_group2;
    t[0xC2] = op_ret;
    t[0xC3] = op_ret;
    t[0xC7] = op_mov_rm_imm;
    t[0xCC] = op_int3;
    for esc in 0xD8..=0xDF {
        t[esc] = op_x87;
    }
    t[0xE8] = op_call_rel32;
    t[0xE9] = op_jmp_rel;
    t[0xEB] = op_jmp_rel;
    t[0xF4] = op_hlt;
    t[0xF7] = op_group3;
    t[0xFA] = op_flag;
    t[0xFB] = op_flag;
    t[0xFC] = op_flag;
    t[0xFD] = op_flag;
    t[0xFF] = op_group5;
    t
}

impl Cpu {
    /// Decode and execute the instruction at `eip`
    pub(super) fn interpret(&mut self, bus: &dyn Bus, eip: u32) -> Result<(), CpuError> {
        let mut cur = Cursor::new(bus, eip);
        let opcode = cur.fetch8()?;
        if self.tracing {
            self.emit_debug(eip, &format!("opcode {:02x}", opcode));
        }
        table()[opcode as usize](self, &mut cur, opcode)?;
        self.regs.eip = cur.pc;
        Ok(())
    }

    fn read_rm32(&self, bus: &dyn Bus, rm: Rm) -> Result<u32, CpuError> {
        Ok(match rm {
            Rm::Reg(r) => self.regs.get(r),
            Rm::Mem(m) => bus.read32(m.resolve(&self.regs))?,
        })
    }

    fn write_rm32(&mut self, bus: &dyn Bus, rm: Rm, value: u32) -> Result<(), CpuError> {
        match rm {
            Rm::Reg(r) => self.regs.set(r, value),
            Rm::Mem(m) => {
                let addr = m.resolve(&self.regs);
                self.write_mem32(bus, addr, value)?;
            }
        }
        Ok(())
    }

    /// 8-bit register file view: AL, CL, DL, BL, AH, CH, DH, BH
    fn read_rm8(&self, bus: &dyn Bus, rm: Rm) -> Result<u8, CpuError> {
        Ok(match rm {
            Rm::Reg(r) if r < 4 => self.regs.get(r) as u8,
            Rm::Reg(r) => (self.regs.get(r - 4) >> 8) as u8,
            Rm::Mem(m) => bus.read8(m.resolve(&self.regs))?,
        })
    }

    fn read_rm16(&self, bus: &dyn Bus, rm: Rm) -> Result<u16, CpuError> {
        Ok(match rm {
            Rm::Reg(r) => self.regs.get(r) as u16,
            Rm::Mem(m) => bus.read16(m.resolve(&self.regs))?,
        })
    }

    fn alu_to_rm(&mut self, bus: &dyn Bus, op: AluOp, rm: Rm, src: u32) -> Result<(), CpuError> {
        let dest = self.read_rm32(bus, rm)?;
        let (result, flags) = alu::apply(op, dest, src, self.regs.eflags);
        if op.writes_result() {
            self.write_rm32(bus, rm, result)?;
        }
        self.regs.set_arith_flags(flags);
        Ok(())
    }
}

fn op_invalid(cpu: &mut Cpu, cur: &mut Cursor<'_>, opcode: u8) -> Result<(), CpuError> {
    cpu.emit_debug(cur.start, &format!("unknown opcode {:02x}", opcode));
    Err(CpuError::InvalidOpcode {
        addr: cur.start,
        opcode,
    })
}

/// A zero dword is boot padding and skipped as a 4-byte no-op
fn op_padding(_cpu: &mut Cpu, cur: &mut Cursor<'_>, opcode: u8) -> Result<(), CpuError> {
    for _ in 0..3 {
        if cur.fetch8()? != 0 {
            return Err(CpuError::InvalidOpcode {
                addr: cur.start,
                opcode,
            });
        }
    }
    Ok(())
}

fn op_nop(_cpu: &mut Cpu, _cur: &mut Cursor<'_>, _opcode: u8) -> Result<(), CpuError> {
    Ok(())
}

fn op_alu_rm_reg(cpu: &mut Cpu, cur: &mut Cursor<'_>, opcode: u8) -> Result<(), CpuError> {
    let m = cur.modrm()?;
    let src = cpu.regs.get(m.reg);
    cpu.alu_to_rm(cur.bus, AluOp::from_index(opcode >> 3), m.rm, src)
}

fn op_alu_reg_rm(cpu: &mut Cpu, cur: &mut Cursor<'_>, opcode: u8) -> Result<(), CpuError> {
    let m = cur.modrm()?;
    let src = cpu.read_rm32(cur.bus, m.rm)?;
    cpu.alu_to_rm(cur.bus, AluOp::from_index(opcode >> 3), Rm::Reg(m.reg), src)
}

fn op_alu_eax_imm(cpu: &mut Cpu, cur: &mut Cursor<'_>, opcode: u8) -> Result<(), CpuError> {
    let imm = cur.fetch32()?;
    cpu.alu_to_rm(cur.bus, AluOp::from_index(opcode >> 3), Rm::Reg(EAX), imm)
}

fn op_group1(cpu: &mut Cpu, cur: &mut Cursor<'_>, opcode: u8) -> Result<(), CpuError> {
    let m = cur.modrm()?;
    let imm = if opcode == 0x83 {
        cur.fetch_simm8()?
    } else {
        cur.fetch32()?
    };
    cpu.alu_to_rm(cur.bus, AluOp::from_index(m.reg), m.rm, imm)
}

fn op_test_rm_reg(cpu: &mut Cpu, cur: &mut Cursor<'_>, _opcode: u8) -> Result<(), CpuError> {
    let m = cur.modrm()?;
    let v = cpu.read_rm32(cur.bus, m.rm)? & cpu.regs.get(m.reg);
    cpu.regs.set_arith_flags(alu::logic32(v).1);
    Ok(())
}

fn op_inc_reg(cpu: &mut Cpu, _cur: &mut Cursor<'_>, opcode: u8) -> Result<(), CpuError> {
    let r = opcode & 7;
    let (v, f) = alu::inc32(cpu.regs.get(r), cpu.regs.eflags);
    cpu.regs.set(r, v);
    cpu.regs.set_arith_flags(f);
    Ok(())
}

fn op_dec_reg(cpu: &mut Cpu, _cur: &mut Cursor<'_>, opcode: u8) -> Result<(), CpuError> {
    let r = opcode & 7;
    let (v, f) = alu::dec32(cpu.regs.get(r), cpu.regs.eflags);
    cpu.regs.set(r, v);
    cpu.regs.set_arith_flags(f);
    Ok(())
}

fn op_push_reg(cpu: &mut Cpu, cur: &mut Cursor<'_>, opcode: u8) -> Result<(), CpuError> {
    // PUSH ESP stores the value before the decrement
    let v = cpu.regs.get(opcode & 7);
    cpu.push32(cur.bus, v)
}

fn op_pop_reg(cpu: &mut Cpu, cur: &mut Cursor<'_>, opcode: u8) -> Result<(), CpuError> {
    let v = cpu.pop32(cur.bus)?;
    cpu.regs.set(opcode & 7, v);
    Ok(())
}

fn op_push_imm(cpu: &mut Cpu, cur: &mut Cursor<'_>, opcode: u8) -> Result<(), CpuError> {
    let v = if opcode == 0x6A {
        cur.fetch_simm8()?
    } else {
        cur.fetch32()?
    };
    cpu.push32(cur.bus, v)
}

fn op_mov_reg_imm(cpu: &mut Cpu, cur: &mut Cursor<'_>, opcode: u8) -> Result<(), CpuError> {
    let v = cur.fetch32()?;
    cpu.regs.set(opcode & 7, v);
    Ok(())
}

fn op_mov_rm_reg(cpu: &mut Cpu, cur: &mut Cursor<'_>, _opcode: u8) -> Result<(), CpuError> {
    let m = cur.modrm()?;
    let v = cpu.regs.get(m.reg);
    cpu.write_rm32(cur.bus, m.rm, v)
}

fn op_mov_reg_rm(cpu: &mut Cpu, cur: &mut Cursor<'_>, _opcode: u8) -> Result<(), CpuError> {
    let m = cur.modrm()?;
    let v = cpu.read_rm32(cur.bus, m.rm)?;
    cpu.regs.set(m.reg, v);
    Ok(())
}

fn op_mov_rm_imm(cpu: &mut Cpu, cur: &mut Cursor<'_>, opcode: u8) -> Result<(), CpuError> {
    let m = cur.modrm()?;
    if m.reg != 0 {
        return Err(CpuError::InvalidOpcode { addr: cur.start, opcode });
    }
    let imm = cur.fetch32()?;
    cpu.write_rm32(cur.bus, m.rm, imm)
}

fn op_lea(cpu: &mut Cpu, cur: &mut Cursor<'_>, opcode: u8) -> Result<(), CpuError> {
    let m = cur.modrm()?;
    match m.rm {
        Rm::Mem(mem) => {
            cpu.regs.set(m.reg, mem.resolve(&cpu.regs));
            Ok(())
        }
        Rm::Reg(_) => Err(CpuError::InvalidOpcode { addr: cur.start, opcode }),
    }
}

fn op_xchg_eax(cpu: &mut Cpu, _cur: &mut Cursor<'_>, opcode: u8) -> Result<(), CpuError> {
    let r = opcode & 7;
    let (a, b) = (cpu.regs.get(EAX), cpu.regs.get(r));
    cpu.regs.set(EAX, b);
    cpu.regs.set(r, a);
    Ok(())
}

fn op_cdq(cpu: &mut Cpu, _cur: &mut Cursor<'_>, _opcode: u8) -> Result<(), CpuError> {
    let sign = ((cpu.regs.get(EAX) as i32) >> 31) as u32;
    cpu.regs.set(EDX, sign);
    Ok(())
}

fn op_mov_eax_moffs(cpu: &mut Cpu, cur: &mut Cursor<'_>, _opcode: u8) -> Result<(), CpuError> {
    let addr = cur.fetch32()?;
    let v = cur.bus.read32(addr)?;
    cpu.regs.set(EAX, v);
    Ok(())
}

fn op_mov_moffs_eax(cpu: &mut Cpu, cur: &mut Cursor<'_>, _opcode: u8) -> Result<(), CpuError> {
    let addr = cur.fetch32()?;
    let v = cpu.regs.get(EAX);
    cpu.write_mem32(cur.bus, addr, v)
}

fn op_jcc_rel8(cpu: &mut Cpu, cur: &mut Cursor<'_>, opcode: u8) -> Result<(), CpuError> {
    let rel = cur.fetch_simm8()?;
    if cpu.regs.condition(opcode & 0xF) {
        cur.pc = cur.pc.wrapping_add(rel);
    }
    Ok(())
}

fn op_jmp_rel(_cpu: &mut Cpu, cur: &mut Cursor<'_>, opcode: u8) -> Result<(), CpuError> {
    let rel = if opcode == 0xEB {
        cur.fetch_simm8()?
    } else {
        cur.fetch32()?
    };
    cur.pc = cur.pc.wrapping_add(rel);
    Ok(())
}

fn op_call_rel32(cpu: &mut Cpu, cur: &mut Cursor<'_>, _opcode: u8) -> Result<(), CpuError> {
    let rel = cur.fetch32()?;
    cpu.push32(cur.bus, cur.pc)?;
    cur.pc = cur.pc.wrapping_add(rel);
    Ok(())
}

fn op_ret(cpu: &mut Cpu, cur: &mut Cursor<'_>, opcode: u8) -> Result<(), CpuError> {
    let release = if opcode == 0xC2 { cur.fetch16()? as u32 } else { 0 };
    let target = cpu.pop32(cur.bus)?;
    let esp = cpu.regs.get(ESP).wrapping_add(release);
    cpu.regs.set(ESP, esp);
    cur.pc = target;
    Ok(())
}

fn op_int3(cpu: &mut Cpu, cur: &mut Cursor<'_>, _opcode: u8) -> Result<(), CpuError> {
    cpu.emit_debug(cur.start, "int3");
    cpu.state = CpuState::DebugBreak;
    Ok(())
}

fn op_hlt(cpu: &mut Cpu, cur: &mut Cursor<'_>, _opcode: u8) -> Result<(), CpuError> {
    cpu.emit_debug(cur.start, "hlt");
    cpu.state = CpuState::Halted;
    Ok(())
}

/// CLI/STI/CLD/STD
fn op_flag(cpu: &mut Cpu, _cur: &mut Cursor<'_>, opcode: u8) -> Result<(), CpuError> {
    let (mask, set) = match opcode {
        0xFA => (FLAG_IF, false),
        0xFB => (FLAG_IF, true),
        0xFC => (FLAG_DF, false),
        _ => (FLAG_DF, true),
    };
    if set {
        cpu.regs.eflags |= mask;
    } else {
        cpu.regs.eflags &= !mask;
    }
    Ok(())
}

fn op_group2(cpu: &mut Cpu, cur: &mut Cursor<'_>, opcode: u8) -> Result<(), CpuError> {
    let m = cur.modrm()?;
    let count = match opcode {
        0xC1 => cur.fetch8()? as u32,
        0xD1 => 1,
        _ => cpu.regs.get(1) & 0xFF, // CL
    };
    let dest = cpu.read_rm32(cur.bus, m.rm)?;
    let Some((result, flags)) = alu::shift32(m.reg, dest, count, cpu.regs.eflags) else {
        return Err(CpuError::InvalidOpcode { addr: cur.start, opcode });
    };
    cpu.write_rm32(cur.bus, m.rm, result)?;
    cpu.regs.set_arith_flags(flags);
    Ok(())
}

fn op_group3(cpu: &mut Cpu, cur: &mut Cursor<'_>, opcode: u8) -> Result<(), CpuError> {
    let m = cur.modrm()?;
    match m.reg {
        0 => {
            let imm = cur.fetch32()?;
            let v = cpu.read_rm32(cur.bus, m.rm)? & imm;
            cpu.regs.set_arith_flags(alu::logic32(v).1);
        }
        2 => {
            let v = !cpu.read_rm32(cur.bus, m.rm)?;
            cpu.write_rm32(cur.bus, m.rm, v)?;
        }
        3 => {
            let (v, f) = alu::neg32(cpu.read_rm32(cur.bus, m.rm)?);
            cpu.write_rm32(cur.bus, m.rm, v)?;
            cpu.regs.set_arith_flags(f);
        }
        4 => {
            let wide = cpu.regs.get(EAX) as u64 * cpu.read_rm32(cur.bus, m.rm)? as u64;
            cpu.regs.set(EAX, wide as u32);
            cpu.regs.set(EDX, (wide >> 32) as u32);
            let mut f = cpu.regs.eflags & !(FLAG_CF | FLAG_OF);
            if wide >> 32 != 0 {
                f |= FLAG_CF | FLAG_OF;
            }
            cpu.regs.set_arith_flags(f);
        }
        6 => {
            let divisor = cpu.read_rm32(cur.bus, m.rm)? as u64;
            let dividend = ((cpu.regs.get(EDX) as u64) << 32) | cpu.regs.get(EAX) as u64;
            if divisor == 0 || dividend / divisor > u32::MAX as u64 {
                return Err(CpuError::DivideError { addr: cur.start });
            }
            cpu.regs.set(EAX, (dividend / divisor) as u32);
            cpu.regs.set(EDX, (dividend % divisor) as u32);
        }
        _ => return Err(CpuError::InvalidOpcode { addr: cur.start, opcode }),
    }
    Ok(())
}

fn op_group5(cpu: &mut Cpu, cur: &mut Cursor<'_>, opcode: u8) -> Result<(), CpuError> {
    let m = cur.modrm()?;
    match m.reg {
        0 | 1 => {
            let dest = cpu.read_rm32(cur.bus, m.rm)?;
            let (v, f) = if m.reg == 0 {
                alu::inc32(dest, cpu.regs.eflags)
            } else {
                alu::dec32(dest, cpu.regs.eflags)
            };
            cpu.write_rm32(cur.bus, m.rm, v)?;
            cpu.regs.set_arith_flags(f);
        }
        2 => {
            let target = cpu.read_rm32(cur.bus, m.rm)?;
            cpu.push32(cur.bus, cur.pc)?;
            cur.pc = target;
        }
        4 => cur.pc = cpu.read_rm32(cur.bus, m.rm)?,
        6 => {
            let v = cpu.read_rm32(cur.bus, m.rm)?;
            cpu.push32(cur.bus, v)?;
        }
        _ => return Err(CpuError::InvalidOpcode { addr: cur.start, opcode }),
    }
    Ok(())
}

fn op_x87(cpu: &mut Cpu, cur: &mut Cursor<'_>, opcode: u8) -> Result<(), CpuError> {
    cpu.exec_x87(cur, opcode)
}

fn op_two_byte(cpu: &mut Cpu, cur: &mut Cursor<'_>, _opcode: u8) -> Result<(), CpuError> {
    let op = cur.fetch8()?;
    match op {
        0x3F => xbox_escape(cpu, cur),
        0x31 => {
            // RDTSC: retired instruction count stands in for the cycle counter
            let tsc = cpu.instruction_count;
            cpu.regs.set(EAX, tsc as u32);
            cpu.regs.set(EDX, (tsc >> 32) as u32);
            Ok(())
        }
        0x80..=0x8F => {
            let rel = cur.fetch32()?;
            if cpu.regs.condition(op & 0xF) {
                cur.pc = cur.pc.wrapping_add(rel);
            }
            Ok(())
        }
        0xAF => {
            let m = cur.modrm()?;
            let src = cpu.read_rm32(cur.bus, m.rm)? as i32 as i64;
            let wide = cpu.regs.get(m.reg) as i32 as i64 * src;
            cpu.regs.set(m.reg, wide as u32);
            let mut f = cpu.regs.eflags & !(FLAG_CF | FLAG_OF);
            if wide != wide as i32 as i64 {
                f |= FLAG_CF | FLAG_OF;
            }
            cpu.regs.set_arith_flags(f);
            Ok(())
        }
        0xB6 => {
            let m = cur.modrm()?;
            let v = cpu.read_rm8(cur.bus, m.rm)?;
            cpu.regs.set(m.reg, v as u32);
            Ok(())
        }
        0xB7 => {
            let m = cur.modrm()?;
            let v = cpu.read_rm16(cur.bus, m.rm)?;
            cpu.regs.set(m.reg, v as u32);
            Ok(())
        }
        _ => {
            if cpu.exec_sse(cur, op)? {
                return Ok(());
            }
            cpu.emit_debug(cur.start, &format!("unknown opcode 0f {:02x}", op));
            Err(CpuError::InvalidSse {
                addr: cur.start,
                opcode: op,
            })
        }
    }
}

/// Xbox escape `0F 3F xx`. Only 01 (syscall) has an effect.
fn xbox_escape(cpu: &mut Cpu, cur: &mut Cursor<'_>) -> Result<(), CpuError> {
    let op = cur.fetch8()?;
    match op {
        0x01 => cpu.raise_syscall(),
        0x02 => warn!("memory protection escape not implemented at {:#010x}", cur.start),
        0x03 => warn!("cache control escape not implemented at {:#010x}", cur.start),
        0x04 => warn!("performance counter escape not implemented at {:#010x}", cur.start),
        _ => {
            return Err(CpuError::InvalidXboxOp {
                addr: cur.start,
                op,
            })
        }
    }
    Ok(())
}
