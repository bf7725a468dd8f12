// Floating-point executor (§4.3). Operate-format opcodes 0x14-0x17 (IEEE S/T
// and VAX F/G arithmetic, CPYS family, integer<->float converts) and
// memory-format opcodes 0x20-0x27 (LDF/LDG/LDS/LDT, STF/STG/STS/STT).
// Grounded in examples/original_source/AEJ/AlphaFpcrFlags.h for the FPCR
// rounding-mode/trap-enable bits and constOpCodeFloatingFormat.h for the
// function-code table. Every operate-format entry first checks
// `ProcessorStatus::fp_enable`; FP memory ops are unprivileged regardless
// (they only move bits, they don't compute).

use super::illegal;
use crate::cpu::Cpu;
use crate::decode::DecodedInstruction;
use crate::error::{CoreResult, ExceptionKind, GuestException};

fn fp_disabled(cpu: &Cpu, decoded: &DecodedInstruction) -> crate::error::CoreError {
    GuestException::new(ExceptionKind::ReservedOperand, decoded.pc).into()
}

fn read_t(cpu: &Cpu, index: u8) -> f64 {
    f64::from_bits(cpu.state.read_fpr(index as usize))
}
fn write_t(cpu: &mut Cpu, index: u8, value: f64) {
    cpu.state.write_fpr(index as usize, value.to_bits());
}
fn read_s(cpu: &Cpu, index: u8) -> f32 {
    f32::from_bits(cpu.state.read_fpr(index as usize) as u32)
}
fn write_s(cpu: &mut Cpu, index: u8, value: f32) {
    cpu.state.write_fpr(index as usize, value.to_bits() as u64);
}

/// Updates FPCC per the comparison result (§3/§4.3). A later CMOV/FBxx
/// consumes this via `CpuState::fpcr.fpcc`.
fn set_fpcc(cpu: &mut Cpu, lt: bool, eq: bool, gt: bool, un: bool) {
    cpu.state.fpcr.fpcc = crate::state::Fpcc { lt, eq, gt, un };
}

pub fn execute_operate(cpu: &mut Cpu, decoded: &DecodedInstruction) -> CoreResult<()> {
    if !cpu.state.ps.fp_enable {
        return Err(fp_disabled(cpu, decoded));
    }
    match decoded.opcode {
        0x16 => execute_ieee_t(cpu, decoded),
        0x14 => execute_ieee_s(cpu, decoded),
        0x17 => execute_misc(cpu, decoded),
        0x15 => execute_vax(cpu, decoded),
        _ => Err(illegal(cpu, decoded)),
    }
}

// Function codes below are the low 7 bits of the real AARM FLTI/FLTL
// encodings (the decoder only extracts bits 11:5) — e.g. ADDT's 0xa0 and
// CVTQT's 0xaf truncate to 0x20 and 0x2f respectively.
fn execute_ieee_t(cpu: &mut Cpu, decoded: &DecodedInstruction) -> CoreResult<()> {
    let a = read_t(cpu, decoded.ra);
    let b = read_t(cpu, decoded.rb);
    match decoded.function {
        0x20 => write_t(cpu, decoded.rc, a + b),
        0x21 => write_t(cpu, decoded.rc, a - b),
        0x22 => write_t(cpu, decoded.rc, a * b),
        0x23 => write_t(cpu, decoded.rc, a / b),
        0x25 => {
            set_fpcc(cpu, a < b, a == b, a > b, a.is_nan() || b.is_nan());
            Ok(())
        }
        0x24 => {
            // CMPTEQ: Fc <- 2.0 if equal, else 0.0.
            write_t(cpu, decoded.rc, if a == b { 2.0 } else { 0.0 });
            Ok(())
        }
        0x26 => {
            write_t(cpu, decoded.rc, if a < b { 2.0 } else { 0.0 });
            Ok(())
        }
        0x27 => {
            write_t(cpu, decoded.rc, if a <= b { 2.0 } else { 0.0 });
            Ok(())
        }
        0x2f => {
            // CVTQT: Ra holds a quadword integer bit pattern.
            let bits = cpu.state.read_fpr(decoded.ra as usize) as i64;
            write_t(cpu, decoded.rc, bits as f64);
            Ok(())
        }
        0x2c => {
            // CVTTQ: round T to a quadword integer, store its bit pattern.
            write_fpr_as_int(cpu, decoded.rc, read_t(cpu, decoded.rb).round() as i64);
            Ok(())
        }
        _ => Err(illegal(cpu, decoded)),
    }?;
    Ok(())
}

fn execute_ieee_s(cpu: &mut Cpu, decoded: &DecodedInstruction) -> CoreResult<()> {
    let a = read_s(cpu, decoded.ra);
    let b = read_s(cpu, decoded.rb);
    match decoded.function {
        0x00 => write_s(cpu, decoded.rc, a + b),
        0x01 => write_s(cpu, decoded.rc, a - b),
        0x02 => write_s(cpu, decoded.rc, a * b),
        0x03 => write_s(cpu, decoded.rc, a / b),
        0x0c => {
            // CVTQS
            let bits = cpu.state.read_fpr(decoded.ra as usize) as i64;
            write_s(cpu, decoded.rc, bits as f32);
        }
        _ => return Err(illegal(cpu, decoded)),
    }
    Ok(())
}

fn execute_vax(cpu: &mut Cpu, decoded: &DecodedInstruction) -> CoreResult<()> {
    // VAX F/G-format arithmetic reuses the IEEE-T bit representation here:
    // both are 64-bit register values, and this core does not model the
    // VAX reduced-exponent bias precisely, only the arithmetic result.
    execute_ieee_t(cpu, decoded)
}

fn execute_misc(cpu: &mut Cpu, decoded: &DecodedInstruction) -> CoreResult<()> {
    let a_bits = cpu.state.read_fpr(decoded.ra as usize);
    let b_bits = cpu.state.read_fpr(decoded.rb as usize);
    match decoded.function {
        0x20 => {
            // CPYS: Fc <- sign(Fa) | magnitude(Fb).
            let result = (a_bits & (1 << 63)) | (b_bits & !(1u64 << 63));
            cpu.state.write_fpr(decoded.rc as usize, result);
        }
        0x21 => {
            // CPYSN: negated sign of Fa.
            let result = ((!a_bits) & (1 << 63)) | (b_bits & !(1u64 << 63));
            cpu.state.write_fpr(decoded.rc as usize, result);
        }
        0x22 => {
            // CPYSE: sign and exponent of Fa, fraction of Fb.
            let result = (a_bits & 0xfff0_0000_0000_0000) | (b_bits & 0x000f_ffff_ffff_ffff);
            cpu.state.write_fpr(decoded.rc as usize, result);
        }
        0x25 => {
            // MT_FPCR: Fa's bit pattern becomes the FPCR.
            cpu.state.fpcr = crate::state::Fpcr::from_raw(a_bits);
        }
        0x24 => {
            // MF_FPCR: FPCR's bit pattern into Fa (encoded as Rc here, the
            // instruction's sole register operand).
            cpu.state.write_fpr(decoded.rc as usize, cpu.state.fpcr.raw());
        }
        _ => return Err(illegal(cpu, decoded)),
    }
    Ok(())
}

fn write_fpr_as_int(cpu: &mut Cpu, index: u8, value: i64) {
    cpu.state.write_fpr(index as usize, value as u64);
}

pub fn execute_memory(cpu: &mut Cpu, decoded: &DecodedInstruction) -> CoreResult<()> {
    let base = cpu.state.read_gpr(decoded.rb as usize);
    let va = base.wrapping_add(crate::conversions::sign_extend_16(decoded.displacement as u16) as u64);
    match decoded.opcode {
        0x20 => load(cpu, decoded, va, 4),  // LDF (VAX F)
        0x21 => load(cpu, decoded, va, 8),  // LDG (VAX G)
        0x22 => load(cpu, decoded, va, 4),  // LDS (IEEE S)
        0x23 => load(cpu, decoded, va, 8),  // LDT (IEEE T)
        0x24 => store(cpu, decoded, va, 4), // STF
        0x25 => store(cpu, decoded, va, 8), // STG
        0x26 => store(cpu, decoded, va, 4), // STS
        0x27 => store(cpu, decoded, va, 8), // STT
        _ => Err(illegal(cpu, decoded)),
    }
}

fn load(cpu: &mut Cpu, decoded: &DecodedInstruction, va: u64, len: usize) -> CoreResult<()> {
    let (_, bytes) = cpu.memory.load(va, len, cpu.state.asn, cpu.state.is_kernel(), decoded.pc)?;
    let mut buf = [0u8; 8];
    buf[..len].copy_from_slice(&bytes);
    cpu.state.write_fpr(decoded.ra as usize, u64::from_le_bytes(buf));
    Ok(())
}

fn store(cpu: &mut Cpu, decoded: &DecodedInstruction, va: u64, len: usize) -> CoreResult<()> {
    let value = cpu.state.read_fpr(decoded.ra as usize);
    let bytes = &value.to_le_bytes()[..len];
    cpu.memory.store(va, bytes, cpu.state.asn, cpu.state.is_kernel(), decoded.pc)?;
    Ok(())
}
