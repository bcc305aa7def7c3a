//! x87 Floating-Point Unit
//!
//! The register stack holds 80-bit extended values; arithmetic is carried
//! out in f64 and converted on every load/store of a stack slot.

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::decode::{Cursor, Rm};
use super::{Cpu, CpuError};

/// Status word bits
pub const FSW_IE: u16 = 1 << 0;
pub const FSW_SF: u16 = 1 << 6;
pub const FSW_C0: u16 = 1 << 8;
pub const FSW_C1: u16 = 1 << 9;
pub const FSW_C2: u16 = 1 << 10;
pub const FSW_C3: u16 = 1 << 14;
const FSW_TOP_SHIFT: u16 = 11;
const FSW_TOP_MASK: u16 = 7 << FSW_TOP_SHIFT;

/// Tag values (two bits per physical register)
const TAG_VALID: u16 = 0;
const TAG_ZERO: u16 = 1;
const TAG_SPECIAL: u16 = 2;
const TAG_EMPTY: u16 = 3;

pub const RESET_CONTROL: u16 = 0x037F;
pub const RESET_TAG: u16 = 0xFFFF;

/// Convert a double to the 80-bit extended format (little-endian bytes)
pub fn f64_to_f80(value: f64) -> [u8; 10] {
    let bits = value.to_bits();
    let sign = ((bits >> 63) as u16) << 15;
    let exp = ((bits >> 52) & 0x7FF) as i32;
    let frac = bits & ((1u64 << 52) - 1);

    let (exp80, mant): (u16, u64) = if exp == 0 && frac == 0 {
        (0, 0)
    } else if exp == 0x7FF {
        (0x7FFF, (1 << 63) | (frac << 11))
    } else if exp == 0 {
        // Subnormal double: normalize into the explicit-integer-bit format
        let lz = frac.leading_zeros() as i32;
        ((16383 - 1011 - lz) as u16, frac << lz)
    } else {
        ((exp - 1023 + 16383) as u16, (1 << 63) | (frac << 11))
    };

    let mut out = [0u8; 10];
    out[..8].copy_from_slice(&mant.to_le_bytes());
    out[8..].copy_from_slice(&(sign | exp80).to_le_bytes());
    out
}

/// Convert an 80-bit extended value to the nearest double
pub fn f80_to_f64(bytes: &[u8; 10]) -> f64 {
    let mut m = [0u8; 8];
    m.copy_from_slice(&bytes[..8]);
    let mant = u64::from_le_bytes(m);
    let se = u16::from_le_bytes([bytes[8], bytes[9]]);
    let negative = se & 0x8000 != 0;
    let exp = (se & 0x7FFF) as i32;

    let magnitude = if exp == 0 && mant == 0 {
        0.0
    } else if exp == 0x7FFF {
        if mant << 1 == 0 {
            f64::INFINITY
        } else {
            f64::NAN
        }
    } else {
        // value = mant * 2^(exp - 16383 - 63); split the scale to avoid
        // intermediate underflow
        let e = exp - 16383 - 63;
        let half = e / 2;
        (mant as f64) * 2f64.powi(half) * 2f64.powi(e - half)
    };
    if negative {
        -magnitude
    } else {
        magnitude
    }
}

/// x87 register and control state
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fpu {
    pub control: u16,
    pub status: u16,
    pub tag: u16,
    pub last_ip: u32,
    pub last_dp: u32,
    pub last_opcode: u16,
    /// Physical registers R0-R7
    pub stack: [[u8; 10]; 8],
}

impl Default for Fpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Fpu {
    pub fn new() -> Self {
        Fpu {
            control: RESET_CONTROL,
            status: 0,
            tag: RESET_TAG,
            last_ip: 0,
            last_dp: 0,
            last_opcode: 0,
            stack: [[0u8; 10]; 8],
        }
    }

    pub fn reset(&mut self) {
        *self = Fpu::new();
    }

    #[inline]
    pub fn top(&self) -> usize {
        ((self.status & FSW_TOP_MASK) >> FSW_TOP_SHIFT) as usize
    }

    fn set_top(&mut self, top: usize) {
        self.status = (self.status & !FSW_TOP_MASK) | (((top & 7) as u16) << FSW_TOP_SHIFT);
    }

    fn phys(&self, i: usize) -> usize {
        (self.top() + i) & 7
    }

    fn tag_of(&self, phys: usize) -> u16 {
        (self.tag >> (phys * 2)) & 3
    }

    fn set_tag(&mut self, phys: usize, tag: u16) {
        self.tag = (self.tag & !(3 << (phys * 2))) | (tag << (phys * 2));
    }

    fn classify(value: f64) -> u16 {
        if value == 0.0 {
            TAG_ZERO
        } else if value.is_finite() {
            TAG_VALID
        } else {
            TAG_SPECIAL
        }
    }

    pub fn is_empty(&self, i: usize) -> bool {
        self.tag_of(self.phys(i)) == TAG_EMPTY
    }

    /// Read ST(i). Reading an empty slot is a stack underflow and yields NaN.
    pub fn st(&mut self, i: usize) -> f64 {
        let p = self.phys(i);
        if self.tag_of(p) == TAG_EMPTY {
            self.status |= FSW_IE | FSW_SF;
            self.status &= !FSW_C1;
            return f64::NAN;
        }
        f80_to_f64(&self.stack[p])
    }

    pub fn set_st(&mut self, i: usize, value: f64) {
        let p = self.phys(i);
        self.stack[p] = f64_to_f80(value);
        self.set_tag(p, Self::classify(value));
    }

    pub fn push(&mut self, value: f64) {
        let top = (self.top() + 7) & 7;
        if self.tag_of(top) != TAG_EMPTY {
            self.status |= FSW_IE | FSW_SF | FSW_C1;
        }
        self.set_top(top);
        self.set_st(0, value);
    }

    pub fn pop(&mut self) -> f64 {
        let value = self.st(0);
        let top = self.top();
        self.set_tag(top, TAG_EMPTY);
        self.set_top(top + 1);
        value
    }

    /// Set C0/C2/C3 from an ordered or unordered comparison of a and b
    pub fn compare(&mut self, a: f64, b: f64) {
        self.status &= !(FSW_C0 | FSW_C2 | FSW_C3);
        if a.is_nan() || b.is_nan() {
            self.status |= FSW_C0 | FSW_C2 | FSW_C3;
            self.status |= FSW_IE;
        } else if a < b {
            self.status |= FSW_C0;
        } else if a == b {
            self.status |= FSW_C3;
        }
    }
}

/// Arithmetic selected by the reg field of D8/DC
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ArithOp {
    Add,
    Mul,
    Com,
    Comp,
    Sub,
    SubR,
    Div,
    DivR,
}

impl ArithOp {
    fn from_reg(reg: u8) -> Self {
        match reg & 7 {
            0 => ArithOp::Add,
            1 => ArithOp::Mul,
            2 => ArithOp::Com,
            3 => ArithOp::Comp,
            4 => ArithOp::Sub,
            5 => ArithOp::SubR,
            6 => ArithOp::Div,
            _ => ArithOp::DivR,
        }
    }

    /// `dst op src`; returns None for the compare forms
    fn eval(self, dst: f64, src: f64) -> Option<f64> {
        match self {
            ArithOp::Add => Some(dst + src),
            ArithOp::Mul => Some(dst * src),
            ArithOp::Sub => Some(dst - src),
            ArithOp::SubR => Some(src - dst),
            ArithOp::Div => Some(dst / src),
            ArithOp::DivR => Some(src / dst),
            ArithOp::Com | ArithOp::Comp => None,
        }
    }
}

impl Cpu {
    /// Execute an escape opcode D8-DF
    pub(super) fn exec_x87(&mut self, cur: &mut Cursor<'_>, opcode: u8) -> Result<(), CpuError> {
        let modrm = cur.modrm()?;
        self.fpu.last_ip = cur.start;
        self.fpu.last_opcode = ((opcode as u16 & 7) << 8) | modrm.reg as u16;

        match (opcode, modrm.rm) {
            (0xD8, Rm::Mem(m)) => {
                let addr = m.resolve(&self.regs);
                self.fpu.last_dp = addr;
                let src = f32::from_bits(cur.bus.read32(addr)?) as f64;
                self.fpu_arith_st0(ArithOp::from_reg(modrm.reg), src);
            }
            (0xD8, Rm::Reg(i)) => {
                let src = self.fpu.st(i as usize);
                self.fpu_arith_st0(ArithOp::from_reg(modrm.reg), src);
            }
            (0xDC, Rm::Mem(m)) => {
                let addr = m.resolve(&self.regs);
                self.fpu.last_dp = addr;
                let src = f64::from_bits(cur.bus.read64(addr)?);
                self.fpu_arith_st0(ArithOp::from_reg(modrm.reg), src);
            }
            (0xDC, Rm::Reg(i)) | (0xDE, Rm::Reg(i)) => {
                if opcode == 0xDE && modrm.reg == 3 && i == 1 {
                    // FCOMPP
                    let (a, b) = (self.fpu.st(0), self.fpu.st(1));
                    self.fpu.compare(a, b);
                    self.fpu.pop();
                    self.fpu.pop();
                    return Ok(());
                }
                self.fpu_arith_sti(modrm.reg, i as usize);
                if opcode == 0xDE {
                    self.fpu.pop();
                }
            }
            (0xD9, Rm::Mem(m)) => {
                let addr = m.resolve(&self.regs);
                self.fpu.last_dp = addr;
                match modrm.reg {
                    0 => {
                        let v = f32::from_bits(cur.bus.read32(addr)?) as f64;
                        self.fpu.push(v);
                    }
                    2 | 3 => {
                        let v = self.fpu.st(0) as f32;
                        self.write_mem32(cur.bus, addr, v.to_bits())?;
                        if modrm.reg == 3 {
                            self.fpu.pop();
                        }
                    }
                    5 => self.fpu.control = cur.bus.read16(addr)?,
                    7 => self.write_mem16(cur.bus, addr, self.fpu.control)?,
                    _ => self.fpu_unimplemented(cur.start, opcode, modrm.reg),
                }
            }
            (0xD9, Rm::Reg(i)) => {
                let i = i as usize;
                match modrm.reg {
                    0 => {
                        let v = self.fpu.st(i);
                        self.fpu.push(v);
                    }
                    1 => {
                        let (a, b) = (self.fpu.st(0), self.fpu.st(i));
                        self.fpu.set_st(0, b);
                        self.fpu.set_st(i, a);
                    }
                    4 if i == 0 => {
                        let v = self.fpu.st(0);
                        self.fpu.set_st(0, -v);
                    }
                    4 if i == 1 => {
                        let v = self.fpu.st(0);
                        self.fpu.set_st(0, v.abs());
                    }
                    5 => match i {
                        0 => self.fpu.push(1.0),
                        3 => self.fpu.push(std::f64::consts::PI),
                        6 => self.fpu.push(0.0),
                        _ => self.fpu_unimplemented(cur.start, opcode, modrm.reg),
                    },
                    _ => self.fpu_unimplemented(cur.start, opcode, modrm.reg),
                }
            }
            (0xDD, Rm::Mem(m)) => {
                let addr = m.resolve(&self.regs);
                self.fpu.last_dp = addr;
                match modrm.reg {
                    0 => {
                        let v = f64::from_bits(cur.bus.read64(addr)?);
                        self.fpu.push(v);
                    }
                    2 | 3 => {
                        let v = self.fpu.st(0);
                        self.write_mem64(cur.bus, addr, v.to_bits())?;
                        if modrm.reg == 3 {
                            self.fpu.pop();
                        }
                    }
                    _ => self.fpu_unimplemented(cur.start, opcode, modrm.reg),
                }
            }
            (0xDD, Rm::Reg(i)) if modrm.reg == 3 => {
                // FSTP ST(i)
                let v = self.fpu.st(0);
                self.fpu.set_st(i as usize, v);
                self.fpu.pop();
            }
            (0xDB, Rm::Mem(m)) if modrm.reg == 0 => {
                let v = cur.bus.read32(m.resolve(&self.regs))? as i32 as f64;
                self.fpu.push(v);
            }
            (0xDB, Rm::Mem(m)) if modrm.reg == 3 => {
                let v = self.fpu.pop();
                let int = if v.is_finite() && v.abs() < 2_147_483_648.0 {
                    v.round_ties_even() as i32
                } else {
                    self.fpu.status |= FSW_IE;
                    i32::MIN
                };
                self.write_mem32(cur.bus, m.resolve(&self.regs), int as u32)?;
            }
            (0xDB, Rm::Reg(2)) if modrm.reg == 4 => {
                // FNCLEX
                self.fpu.status &= !0x80FF;
            }
            (0xDB, Rm::Reg(3)) if modrm.reg == 4 => {
                // FNINIT
                self.fpu.reset();
            }
            _ => self.fpu_unimplemented(cur.start, opcode, modrm.reg),
        }
        Ok(())
    }

    /// ST(0) = ST(0) op src, or compare ST(0) with src
    fn fpu_arith_st0(&mut self, op: ArithOp, src: f64) {
        let dst = self.fpu.st(0);
        match op.eval(dst, src) {
            Some(result) => self.fpu.set_st(0, result),
            None => {
                self.fpu.compare(dst, src);
                if op == ArithOp::Comp {
                    self.fpu.pop();
                }
            }
        }
    }

    /// ST(i) = ST(i) op ST(0) for the DC/DE register forms, where the
    /// reversed and plain subtract/divide encodings are swapped.
    fn fpu_arith_sti(&mut self, reg: u8, i: usize) {
        let st0 = self.fpu.st(0);
        let sti = self.fpu.st(i);
        let result = match reg & 7 {
            0 => sti + st0,
            1 => sti * st0,
            2 | 3 => {
                self.fpu.compare(st0, sti);
                if reg == 3 {
                    self.fpu.pop();
                }
                return;
            }
            4 => st0 - sti,
            5 => sti - st0,
            6 => st0 / sti,
            _ => sti / st0,
        };
        self.fpu.set_st(i, result);
    }

    fn fpu_unimplemented(&self, addr: u32, opcode: u8, reg: u8) {
        warn!("FPU instruction {:02X} /{} not implemented at {:#010x}", opcode, reg, addr);
    }
}
