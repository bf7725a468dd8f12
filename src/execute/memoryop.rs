// Memory executor (§4.4). Opcodes 0x08-0x0f and 0x28-0x2f (integer loads and
// stores, plus LDx_L/STx_C), and opcode 0x1a (Jump format, which shares the
// Memory word layout per AEJ/constants/constOpCodeJumpFormat.h — Ra is the
// link register, Rb holds the target address). Steps follow §4.4: compute
// effective address, translate, probe/fill the cache path, update or check
// the lock reservation, write back.

use super::illegal;
use crate::conversions::sign_extend_16;
use crate::cpu::{Cpu, LockReservation};
use crate::decode::DecodedInstruction;
use crate::error::CoreResult;

fn effective_address(cpu: &Cpu, decoded: &DecodedInstruction) -> u64 {
    let base = cpu.state.read_gpr(decoded.rb as usize);
    base.wrapping_add(sign_extend_16(decoded.displacement as u16) as u64)
}

pub fn execute(cpu: &mut Cpu, decoded: &DecodedInstruction) -> CoreResult<()> {
    match decoded.opcode {
        0x08 => {
            let value = effective_address(cpu, decoded);
            cpu.state.write_gpr(decoded.ra as usize, value);
            Ok(())
        }
        0x09 => {
            let base = cpu.state.read_gpr(decoded.rb as usize);
            let value = base.wrapping_add((sign_extend_16(decoded.displacement as u16) as u64) << 16);
            cpu.state.write_gpr(decoded.ra as usize, value);
            Ok(())
        }
        0x0a => load(cpu, decoded, 1, false, false),
        0x0c => load(cpu, decoded, 2, false, false),
        0x0b => load(cpu, decoded, 8, false, true), // LDQ_U: mask to an 8-byte boundary
        0x0d => store(cpu, decoded, 2, false),
        0x0e => store(cpu, decoded, 1, false),
        0x0f => store(cpu, decoded, 8, true), // STQ_U: mask to an 8-byte boundary
        0x28 => load(cpu, decoded, 4, true, false),
        0x29 => load(cpu, decoded, 8, false, false),
        0x2a => load_locked(cpu, decoded, 4, true),
        0x2b => load_locked(cpu, decoded, 8, false),
        0x2c => store(cpu, decoded, 4, false),
        0x2d => store(cpu, decoded, 8, false),
        0x2e => store_conditional(cpu, decoded, 4),
        0x2f => store_conditional(cpu, decoded, 8),
        0x1a => jump(cpu, decoded),
        _ => Err(illegal(cpu, decoded)),
    }
}

fn load(cpu: &mut Cpu, decoded: &DecodedInstruction, len: usize, sign_extended: bool, mask_align: bool) -> CoreResult<()> {
    let mut va = effective_address(cpu, decoded);
    if mask_align {
        va &= !0x7;
    }
    let (_, bytes) = cpu.memory.load(va, len, cpu.state.asn, cpu.state.is_kernel(), decoded.pc)?;
    let value = assemble(&bytes, sign_extended);
    cpu.state.write_gpr(decoded.ra as usize, value);
    Ok(())
}

fn store(cpu: &mut Cpu, decoded: &DecodedInstruction, len: usize, mask_align: bool) -> CoreResult<()> {
    let mut va = effective_address(cpu, decoded);
    if mask_align {
        va &= !0x7;
    }
    let value = cpu.state.read_gpr(decoded.ra as usize);
    let bytes = &value.to_le_bytes()[..len];
    // `CpuMemoryPort::store` itself breaks any CPU's reservation on the
    // written line (§3); nothing further to do here.
    cpu.memory.store(va, bytes, cpu.state.asn, cpu.state.is_kernel(), decoded.pc)?;
    invalidate_overlapping_compiled_block(cpu, va, len as u64);
    Ok(())
}

/// A store that lands inside a live compiled block's PC range must evict it
/// (§4.9 self-modifying code), or the JIT would keep replaying the stale
/// decode of the overwritten word.
fn invalidate_overlapping_compiled_block(cpu: &Cpu, va: u64, len: u64) {
    if let Some(cache) = &cpu.jit_cache {
        cache.invalidate_range(va, len);
    }
}

fn load_locked(cpu: &mut Cpu, decoded: &DecodedInstruction, len: usize, sign_extended: bool) -> CoreResult<()> {
    let va = effective_address(cpu, decoded);
    let (pa, bytes) = cpu.memory.load(va, len, cpu.state.asn, cpu.state.is_kernel(), decoded.pc)?;
    cpu.memory.reserve(pa, cpu.cpu_id());
    cpu.reservation = Some(LockReservation { va, pa, asn: cpu.state.asn, cpu_id: cpu.cpu_id(), valid: true });
    let value = assemble(&bytes, sign_extended);
    cpu.state.write_gpr(decoded.ra as usize, value);
    Ok(())
}

/// STx_C: the store only takes effect if the shared reservation table still
/// credits this CPU with the target line's reservation; either way Ra is
/// overwritten with the 1/0 success flag (§4.4, §8 scenario 2/3). The local
/// `cpu.reservation` record guards the VA/ASN match a stale PC-local LDx_L
/// left behind; the shared table is the source of truth for whether another
/// CPU wrote the line in between.
fn store_conditional(cpu: &mut Cpu, decoded: &DecodedInstruction, len: usize) -> CoreResult<()> {
    let va = effective_address(cpu, decoded);
    let local_reservation = cpu
        .reservation
        .filter(|r| r.valid && r.va == va && r.asn == cpu.state.asn && r.cpu_id == cpu.cpu_id());
    let still_reserved = match local_reservation {
        Some(r) => cpu.memory.check_and_clear_reservation(r.pa, cpu.cpu_id()),
        None => false,
    };
    cpu.clear_reservation();
    if still_reserved {
        let value = cpu.state.read_gpr(decoded.ra as usize);
        let bytes = &value.to_le_bytes()[..len];
        cpu.memory.store(va, bytes, cpu.state.asn, cpu.state.is_kernel(), decoded.pc)?;
        invalidate_overlapping_compiled_block(cpu, va, len as u64);
        cpu.state.write_gpr(decoded.ra as usize, 1);
    } else {
        cpu.state.write_gpr(decoded.ra as usize, 0);
    }
    Ok(())
}

/// Jump format (opcode 0x1a): Ra <- PC+4 (the return address), target <-
/// Rb's value with the low two bits cleared. The hint bits in 15:14 (JMP,
/// JSR, RET, JSR_COROUTINE) only affect branch-prediction hints on real
/// hardware, not the architectural outcome modeled here.
fn jump(cpu: &mut Cpu, decoded: &DecodedInstruction) -> CoreResult<()> {
    let target = cpu.state.read_gpr(decoded.rb as usize) & !0x3;
    cpu.state.write_gpr(decoded.ra as usize, decoded.pc.wrapping_add(4));
    cpu.branch_target = Some(target);
    Ok(())
}

fn assemble(bytes: &[u8], sign_extended: bool) -> u64 {
    let mut buf = [0u8; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    let raw = u64::from_le_bytes(buf);
    if sign_extended && bytes.len() == 4 {
        (raw as u32 as i32) as i64 as u64
    } else {
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fixture_cpu;

    #[test]
    fn lda_computes_effective_address_without_touching_memory() {
        let mut cpu = fixture_cpu();
        cpu.state.write_gpr(2, 0x1000);
        let decoded = crate::decode::decode(0x2042_0010, cpu.state.pc); // LDA R2,0x10(R2)
        super::execute(&mut cpu, &decoded).unwrap();
        assert_eq!(cpu.state.read_gpr(2), 0x1010);
    }

    #[test]
    fn store_then_load_quadword_round_trips() {
        let mut cpu = fixture_cpu();
        cpu.state.write_gpr(1, 0x4242_4242_4242_4242);
        cpu.state.write_gpr(2, 0x2000);
        let store_word = crate::decode::decode(0xb422_0000, cpu.state.pc); // STQ R1,0(R2)
        super::execute(&mut cpu, &store_word).unwrap();
        let load_word = crate::decode::decode(0xa462_0000, cpu.state.pc); // LDQ R3,0(R2)
        super::execute(&mut cpu, &load_word).unwrap();
        assert_eq!(cpu.state.read_gpr(3), 0x4242_4242_4242_4242);
    }

    #[test]
    fn store_conditional_fails_without_a_live_reservation() {
        let mut cpu = fixture_cpu();
        cpu.state.write_gpr(2, 0x3000);
        cpu.state.write_gpr(1, 7);
        let stc = crate::decode::decode(0xb822_0000, cpu.state.pc); // STL_C R1,0(R2)
        super::execute(&mut cpu, &stc).unwrap();
        assert_eq!(cpu.state.read_gpr(1), 0);
    }
}
