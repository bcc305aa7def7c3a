//! Integer ALU with EFLAGS computation
//!
//! Every function returns the result and the new arithmetic flag bits
//! (masked by `ARITH_FLAGS`); callers merge them into EFLAGS.

use super::regs::{FLAG_AF, FLAG_CF, FLAG_OF, FLAG_PF, FLAG_SF, FLAG_ZF};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
}

impl AluOp {
    /// Operation selected by the reg field of the 80/81/83 group, or by
    /// bits 3-5 of the classic two-operand opcodes.
    pub fn from_index(index: u8) -> Self {
        match index & 7 {
            0 => AluOp::Add,
            1 => AluOp::Or,
            2 => AluOp::Adc,
            3 => AluOp::Sbb,
            4 => AluOp::And,
            5 => AluOp::Sub,
            6 => AluOp::Xor,
            _ => AluOp::Cmp,
        }
    }

    /// Cmp computes flags without writing back
    pub fn writes_result(self) -> bool {
        self != AluOp::Cmp
    }
}

#[inline(always)]
fn parity(result: u32) -> u32 {
    if (result as u8).count_ones() % 2 == 0 {
        FLAG_PF
    } else {
        0
    }
}

#[inline(always)]
fn szp(result: u32) -> u32 {
    let mut flags = parity(result);
    if result == 0 {
        flags |= FLAG_ZF;
    }
    if result & 0x8000_0000 != 0 {
        flags |= FLAG_SF;
    }
    flags
}

pub fn add32(dest: u32, src: u32) -> (u32, u32) {
    adc32(dest, src, false)
}

pub fn adc32(dest: u32, src: u32, carry_in: bool) -> (u32, u32) {
    let wide = dest as u64 + src as u64 + carry_in as u64;
    let result = wide as u32;
    let mut flags = szp(result);
    if wide > u32::MAX as u64 {
        flags |= FLAG_CF;
    }
    if (dest ^ result) & (src ^ result) & 0x8000_0000 != 0 {
        flags |= FLAG_OF;
    }
    if (dest ^ src ^ result) & 0x10 != 0 {
        flags |= FLAG_AF;
    }
    (result, flags)
}

pub fn sub32(dest: u32, src: u32) -> (u32, u32) {
    sbb32(dest, src, false)
}

pub fn sbb32(dest: u32, src: u32, borrow_in: bool) -> (u32, u32) {
    let result = dest.wrapping_sub(src).wrapping_sub(borrow_in as u32);
    let mut flags = szp(result);
    if (dest as u64) < src as u64 + borrow_in as u64 {
        flags |= FLAG_CF;
    }
    if (dest ^ src) & (dest ^ result) & 0x8000_0000 != 0 {
        flags |= FLAG_OF;
    }
    if (dest ^ src ^ result) & 0x10 != 0 {
        flags |= FLAG_AF;
    }
    (result, flags)
}

/// AND/OR/XOR/TEST: CF and OF cleared
pub fn logic32(result: u32) -> (u32, u32) {
    (result, szp(result))
}

/// INC/DEC leave CF alone; the caller keeps the old CF bit
pub fn inc32(dest: u32, old_flags: u32) -> (u32, u32) {
    let (result, flags) = add32(dest, 1);
    (result, (flags & !FLAG_CF) | (old_flags & FLAG_CF))
}

pub fn dec32(dest: u32, old_flags: u32) -> (u32, u32) {
    let (result, flags) = sub32(dest, 1);
    (result, (flags & !FLAG_CF) | (old_flags & FLAG_CF))
}

pub fn neg32(dest: u32) -> (u32, u32) {
    let (result, flags) = sub32(0, dest);
    let cf = if dest != 0 { FLAG_CF } else { 0 };
    (result, (flags & !FLAG_CF) | cf)
}

/// Apply a group-1 operation. `old_flags` supplies the carry for ADC/SBB.
pub fn apply(op: AluOp, dest: u32, src: u32, old_flags: u32) -> (u32, u32) {
    let carry = old_flags & FLAG_CF != 0;
    match op {
        AluOp::Add => add32(dest, src),
        AluOp::Adc => adc32(dest, src, carry),
        AluOp::Sub | AluOp::Cmp => sub32(dest, src),
        AluOp::Sbb => sbb32(dest, src, carry),
        AluOp::And => logic32(dest & src),
        AluOp::Or => logic32(dest | src),
        AluOp::Xor => logic32(dest ^ src),
    }
}

/// Group-2 rotate/shift selected by the ModRM reg field (0 ROL, 1 ROR,
/// 4 SHL, 5 SHR, 7 SAR). The count is masked to 5 bits; a zero count
/// leaves the flags as they were. Returns None for RCL/RCR/SAL-alias.
pub fn shift32(kind: u8, dest: u32, count: u32, old_flags: u32) -> Option<(u32, u32)> {
    let count = count & 31;
    if count == 0 {
        return Some((dest, old_flags));
    }
    let msb = |v: u32| v >> 31 != 0;
    let (result, cf, of, rotate) = match kind {
        0 => {
            let r = dest.rotate_left(count);
            (r, r & 1 != 0, msb(r) ^ (r & 1 != 0), true)
        }
        1 => {
            let r = dest.rotate_right(count);
            (r, msb(r), msb(r) ^ ((r >> 30) & 1 != 0), true)
        }
        4 => {
            let r = dest << count;
            let cf = (dest >> (32 - count)) & 1 != 0;
            (r, cf, msb(r) ^ cf, false)
        }
        5 => (dest >> count, (dest >> (count - 1)) & 1 != 0, msb(dest), false),
        7 => {
            let r = ((dest as i32) >> count) as u32;
            (r, ((dest as i32) >> (count - 1)) & 1 != 0, false, false)
        }
        _ => return None,
    };
    // Rotates only touch CF and OF
    let mut flags = if rotate {
        old_flags & !(FLAG_CF | FLAG_OF)
    } else {
        szp(result) | (old_flags & FLAG_AF)
    };
    if cf {
        flags |= FLAG_CF;
    }
    if of {
        flags |= FLAG_OF;
    }
    Some((result, flags))
}
