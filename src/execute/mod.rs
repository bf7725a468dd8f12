// Execution dispatcher (§4.2-4.4, §4.8, layer L5). Dynamic dispatch over
// sub-executors keyed by (opcode, function) through a dense match, per the
// DESIGN NOTES in spec.md §9 ("avoid deep inheritance; each executor is a
// pure function over (decoded record, mutable CPU state, memory handle)").

pub mod branch;
pub mod float;
pub mod integer;
pub mod memoryop;
pub mod pal;

use crate::barrier::BarrierType;
use crate::cpu::Cpu;
use crate::decode::{DecodedInstruction, Format};
use crate::error::{CoreResult, ExceptionKind, GuestException};

/// Executes one decoded instruction against `cpu`, dispatching by format.
pub fn dispatch(cpu: &mut Cpu, decoded: &DecodedInstruction) -> CoreResult<()> {
    match decoded.format {
        Format::Operate => integer::execute(cpu, decoded).or_else(|e| float_fallback(cpu, decoded, e)),
        Format::Memory if decoded.opcode == 0x18 => execute_barrier(cpu, decoded),
        Format::Memory if is_float_memory(decoded.opcode) => float::execute_memory(cpu, decoded),
        Format::Memory => memoryop::execute(cpu, decoded),
        Format::Branch => branch::execute(cpu, decoded),
        Format::Pal => pal::execute(cpu, decoded),
        Format::Unknown => Err(illegal(cpu, decoded)),
    }
}

fn is_float_memory(opcode: u8) -> bool {
    (0x20..=0x27).contains(&opcode)
}

fn float_fallback(
    cpu: &mut Cpu,
    decoded: &DecodedInstruction,
    integer_err: crate::error::CoreError,
) -> CoreResult<()> {
    if (0x14..=0x17).contains(&decoded.opcode) {
        float::execute_operate(cpu, decoded)
    } else {
        Err(integer_err)
    }
}

fn execute_barrier(cpu: &mut Cpu, decoded: &DecodedInstruction) -> CoreResult<()> {
    match BarrierType::from_function(decoded.function) {
        Some(kind) => cpu.execute_barrier(kind, decoded),
        None => Err(illegal(cpu, decoded)),
    }
}

pub(crate) fn illegal(_cpu: &Cpu, decoded: &DecodedInstruction) -> crate::error::CoreError {
    GuestException::new(ExceptionKind::IllegalInstruction, decoded.pc).into()
}
