// Basic-block tracer (§4.9). Follows straight-line code from a hot PC until
// control flow leaves the block (branch, jump, PAL call, barrier) or a
// safety limit is hit, grounded in
// examples/original_source/AEJ/pipeline_jitcompiler.h's `alphaBlockProfiler`
// (`identifyBasicBlock`/`traceBasicBlock`/`isBlockTerminator`) — barriers
// and PAL calls always end a block even though they don't redirect PC,
// matching that class's terminator check alongside its branch/jump/return
// checks.

use crate::cpu::Cpu;
use crate::decode::{DecodedInstruction, Format};
use crate::error::CoreResult;

pub const MAX_BLOCK_LENGTH: usize = 64;

#[derive(Debug, Clone)]
pub struct TracedBlock {
    pub start_pc: u64,
    pub instructions: Vec<DecodedInstruction>,
}

impl TracedBlock {
    /// Complexity score driving the compiler's tier selection (§4.9):
    /// memory and floating-point instructions weigh more than simple integer
    /// ops since they touch more of the core's state.
    pub fn complexity(&self) -> u32 {
        self.instructions
            .iter()
            .map(|d| match d.format {
                Format::Memory => 3,
                Format::Operate if (0x14..=0x17).contains(&d.opcode) => 2,
                Format::Pal => 4,
                _ => 1,
            })
            .sum()
    }

    fn ends_block(d: &DecodedInstruction) -> bool {
        matches!(d.format, Format::Branch | Format::Pal)
            || (d.format == Format::Memory && d.opcode == 0x1a) // JMP/JSR/RET
            || (d.format == Format::Memory && d.opcode == 0x18) // barrier
    }
}

/// Traces the block starting at `pc` by decoding (never executing) up to
/// `MAX_BLOCK_LENGTH` instructions, stopping at the first control-flow or
/// barrier boundary (inclusive).
pub fn trace(cpu: &Cpu, pc: u64) -> CoreResult<TracedBlock> {
    let mut instructions = Vec::new();
    let mut cursor = pc;
    for _ in 0..MAX_BLOCK_LENGTH {
        let decoded = cpu.decoded_at(cursor)?;
        let boundary = TracedBlock::ends_block(&decoded);
        instructions.push(decoded);
        if boundary {
            break;
        }
        cursor = cursor.wrapping_add(4);
    }
    Ok(TracedBlock { start_pc: pc, instructions })
}
