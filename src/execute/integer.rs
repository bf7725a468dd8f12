// Integer / logical / shift / multiply executors (§4.2). Operate-format
// instructions on opcodes 0x10-0x13, grounded in
// examples/original_source/AEJ/constants/constOpCodeOperateFormat.h and
// ABA/integerlogical/assemblerAddExtension.h for the function-code table.
// Longword variants sign-extend the 32-bit result to 64 bits; `/V` variants
// raise Arithmetic Trap on signed overflow; compare instructions set Rc to 0
// or 1. All writes are atomic with respect to same-CPU observers (they run
// to completion on this CPU's own thread before the next instruction is
// fetched).

use super::illegal;
use crate::conversions::sign_extend_long;
use crate::cpu::Cpu;
use crate::decode::DecodedInstruction;
use crate::error::{CoreResult, ExceptionKind, GuestException};

fn operand_b(cpu: &Cpu, decoded: &DecodedInstruction) -> u64 {
    if decoded.literal_flag {
        decoded.literal as u64
    } else {
        cpu.state.read_gpr(decoded.rb as usize)
    }
}

fn write_rc(cpu: &mut Cpu, decoded: &DecodedInstruction, value: u64) {
    cpu.state.write_gpr(decoded.rc as usize, value);
}

fn overflow_trap(cpu: &Cpu, decoded: &DecodedInstruction) -> crate::error::CoreError {
    GuestException::new(ExceptionKind::IntegerOverflow, decoded.pc).into()
}

pub fn execute(cpu: &mut Cpu, decoded: &DecodedInstruction) -> CoreResult<()> {
    match decoded.opcode {
        0x10 => execute_inta(cpu, decoded),
        0x11 => execute_intl(cpu, decoded),
        0x12 => execute_ints(cpu, decoded),
        0x13 => execute_intm(cpu, decoded),
        _ => Err(illegal(cpu, decoded)),
    }
}

fn execute_inta(cpu: &mut Cpu, decoded: &DecodedInstruction) -> CoreResult<()> {
    let a = cpu.state.read_gpr(decoded.ra as usize);
    let b = operand_b(cpu, decoded);
    match decoded.function {
        0x00 => write_rc(cpu, decoded, sign_extend_long((a as u32).wrapping_add(b as u32))),
        0x40 => {
            let (result, overflow) = (a as u32).overflowing_add(b as u32);
            if signed_overflow_add32(a as u32, b as u32, result) {
                let _ = overflow;
                return Err(overflow_trap(cpu, decoded));
            }
            write_rc(cpu, decoded, sign_extend_long(result));
        }
        0x20 => write_rc(cpu, decoded, a.wrapping_add(b)),
        0x60 => {
            let (result, _) = a.overflowing_add(b);
            if signed_overflow_add64(a, b, result) {
                return Err(overflow_trap(cpu, decoded));
            }
            write_rc(cpu, decoded, result);
        }
        0x09 => write_rc(cpu, decoded, sign_extend_long((a as u32).wrapping_sub(b as u32))),
        0x49 => {
            let result = (a as u32).wrapping_sub(b as u32);
            if signed_overflow_sub32(a as u32, b as u32, result) {
                return Err(overflow_trap(cpu, decoded));
            }
            write_rc(cpu, decoded, sign_extend_long(result));
        }
        0x29 => write_rc(cpu, decoded, a.wrapping_sub(b)),
        0x69 => {
            let result = a.wrapping_sub(b);
            if signed_overflow_sub64(a, b, result) {
                return Err(overflow_trap(cpu, decoded));
            }
            write_rc(cpu, decoded, result);
        }
        0x02 => write_rc(cpu, decoded, sign_extend_long((a as u32).wrapping_mul(4).wrapping_add(b as u32))),
        0x22 => write_rc(cpu, decoded, a.wrapping_mul(4).wrapping_add(b)),
        0x12 => write_rc(cpu, decoded, sign_extend_long((a as u32).wrapping_mul(8).wrapping_add(b as u32))),
        0x32 => write_rc(cpu, decoded, a.wrapping_mul(8).wrapping_add(b)),
        0x0b => write_rc(cpu, decoded, sign_extend_long((a as u32).wrapping_mul(4).wrapping_sub(b as u32))),
        0x2b => write_rc(cpu, decoded, a.wrapping_mul(4).wrapping_sub(b)),
        0x1b => write_rc(cpu, decoded, sign_extend_long((a as u32).wrapping_mul(8).wrapping_sub(b as u32))),
        0x3b => write_rc(cpu, decoded, a.wrapping_mul(8).wrapping_sub(b)),
        0x2d => write_rc(cpu, decoded, (a == b) as u64),
        0x4d => write_rc(cpu, decoded, ((a as i64) < (b as i64)) as u64),
        0x6d => write_rc(cpu, decoded, ((a as i64) <= (b as i64)) as u64),
        0x1d => write_rc(cpu, decoded, (a < b) as u64),
        0x3d => write_rc(cpu, decoded, (a <= b) as u64),
        0x0f => write_rc(cpu, decoded, cmpbge(a, b)),
        _ => return Err(illegal(cpu, decoded)),
    }
    Ok(())
}

fn cmpbge(a: u64, b: u64) -> u64 {
    let mut result = 0u64;
    for byte in 0..8 {
        let av = (a >> (byte * 8)) as u8;
        let bv = (b >> (byte * 8)) as u8;
        if av >= bv {
            result |= 1 << byte;
        }
    }
    result
}

fn signed_overflow_add32(a: u32, b: u32, r: u32) -> bool {
    let (a, b, r) = (a as i32, b as i32, r as i32);
    (a >= 0 && b >= 0 && r < 0) || (a < 0 && b < 0 && r >= 0)
}
fn signed_overflow_add64(a: u64, b: u64, r: u64) -> bool {
    let (a, b, r) = (a as i64, b as i64, r as i64);
    (a >= 0 && b >= 0 && r < 0) || (a < 0 && b < 0 && r >= 0)
}
fn signed_overflow_sub32(a: u32, b: u32, r: u32) -> bool {
    let (a, b, r) = (a as i32, b as i32, r as i32);
    (a >= 0 && b < 0 && r < 0) || (a < 0 && b >= 0 && r >= 0)
}
fn signed_overflow_sub64(a: u64, b: u64, r: u64) -> bool {
    let (a, b, r) = (a as i64, b as i64, r as i64);
    (a >= 0 && b < 0 && r < 0) || (a < 0 && b >= 0 && r >= 0)
}

fn execute_intl(cpu: &mut Cpu, decoded: &DecodedInstruction) -> CoreResult<()> {
    let a = cpu.state.read_gpr(decoded.ra as usize);
    let b = operand_b(cpu, decoded);
    match decoded.function {
        0x00 => write_rc(cpu, decoded, a & b),
        0x08 => write_rc(cpu, decoded, a & !b),
        0x20 => write_rc(cpu, decoded, a | b),
        0x28 => write_rc(cpu, decoded, a | !b),
        0x40 => write_rc(cpu, decoded, a ^ b),
        0x48 => write_rc(cpu, decoded, !(a ^ b)),
        // conditional moves: Rc <- b iff the condition on `a` holds, else
        // Rc keeps its current value (read back and rewritten, matching the
        // "suppressed when Rc=31" semantics for a no-op CMOV on R31).
        0x14 => cmov(cpu, decoded, a & 1 != 0, b),
        0x16 => cmov(cpu, decoded, a & 1 == 0, b),
        0x24 => cmov(cpu, decoded, a == 0, b),
        0x26 => cmov(cpu, decoded, a != 0, b),
        0x44 => cmov(cpu, decoded, (a as i64) < 0, b),
        0x46 => cmov(cpu, decoded, (a as i64) >= 0, b),
        0x64 => cmov(cpu, decoded, (a as i64) <= 0, b),
        0x66 => cmov(cpu, decoded, (a as i64) > 0, b),
        _ => return Err(illegal(cpu, decoded)),
    }
    Ok(())
}

fn cmov(cpu: &mut Cpu, decoded: &DecodedInstruction, condition: bool, b: u64) {
    if condition {
        write_rc(cpu, decoded, b);
    }
}

fn execute_ints(cpu: &mut Cpu, decoded: &DecodedInstruction) -> CoreResult<()> {
    let a = cpu.state.read_gpr(decoded.ra as usize);
    let b = operand_b(cpu, decoded);
    let shift = (b & 0x3f) as u32;
    match decoded.function {
        0x39 => write_rc(cpu, decoded, a.wrapping_shl(shift)),
        0x34 => write_rc(cpu, decoded, a.wrapping_shr(shift)),
        0x3c => write_rc(cpu, decoded, ((a as i64).wrapping_shr(shift)) as u64),
        0x30 => write_rc(cpu, decoded, zap(a, b, false)),
        0x31 => write_rc(cpu, decoded, zap(a, b, true)),
        _ => return Err(illegal(cpu, decoded)),
    }
    Ok(())
}

fn zap(value: u64, mask: u64, invert: bool) -> u64 {
    let mut result = value;
    for byte in 0..8u64 {
        let bit_set = mask & (1 << byte) != 0;
        let clear = if invert { !bit_set } else { bit_set };
        if clear {
            result &= !(0xffu64 << (byte * 8));
        }
    }
    result
}

fn execute_intm(cpu: &mut Cpu, decoded: &DecodedInstruction) -> CoreResult<()> {
    let a = cpu.state.read_gpr(decoded.ra as usize);
    let b = operand_b(cpu, decoded);
    match decoded.function {
        0x00 => write_rc(cpu, decoded, sign_extend_long((a as u32).wrapping_mul(b as u32))),
        0x20 => write_rc(cpu, decoded, a.wrapping_mul(b)),
        0x30 => write_rc(cpu, decoded, (((a as u128) * (b as u128)) >> 64) as u64),
        0x40 => {
            let result = (a as u32).wrapping_mul(b as u32);
            let full = a.wrapping_mul(b);
            if full != sign_extend_long(result) {
                return Err(overflow_trap(cpu, decoded));
            }
            write_rc(cpu, decoded, sign_extend_long(result));
        }
        0x60 => {
            let (result, overflow_hi) = ((a as i128) * (b as i128)).overflowing_div(1);
            let _ = overflow_hi;
            let result = result as u64;
            let extended = ((result as i64) as i128) == (a as i64 as i128) * (b as i64 as i128);
            if !extended {
                return Err(overflow_trap(cpu, decoded));
            }
            write_rc(cpu, decoded, result);
        }
        _ => return Err(illegal(cpu, decoded)),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fixture_cpu;

    #[test]
    fn addq_adds_registers_and_advances_pc() {
        let mut cpu = fixture_cpu();
        cpu.state.write_gpr(1, 0x1);
        cpu.state.write_gpr(2, 0x2);
        // ADDQ R1,R2,R3: opcode 0x10, function 0x20
        let decoded = crate::decode::decode(0x4022_0403, cpu.state.pc);
        super::execute(&mut cpu, &decoded).unwrap();
        assert_eq!(cpu.state.read_gpr(3), 0x3);
    }

    #[test]
    fn addl_overflow_sign_extends_past_2_31() {
        let mut cpu = fixture_cpu();
        cpu.state.write_gpr(1, 0x7fff_ffff);
        cpu.state.write_gpr(2, 0x7fff_ffff);
        // ADDL R1,R2,R3: opcode 0x10, function 0x00
        let decoded = crate::decode::decode(0x4022_0003, cpu.state.pc);
        super::execute(&mut cpu, &decoded).unwrap();
        assert_eq!(cpu.state.read_gpr(3), 0xffff_ffff_ffff_fffe);
    }

    #[test]
    fn cmpeq_sets_rc_to_zero_or_one() {
        let mut cpu = fixture_cpu();
        cpu.state.write_gpr(1, 5);
        cpu.state.write_gpr(2, 5);
        // CMPEQ R1,R2,R3: opcode 0x10, function 0x2d
        let decoded = crate::decode::decode(0x4022_05a3, cpu.state.pc);
        super::execute(&mut cpu, &decoded).unwrap();
        assert_eq!(cpu.state.read_gpr(3), 1);
    }
}
