// JIT translation pipeline (§4.9, layer L6). Ties the profiler, tracer,
// compiler, and translation cache together behind a single `step` the
// top-level engine calls instead of `Cpu::clock_cycle` directly when JIT
// elimination is enabled. Grounded in
// examples/original_source/AEJ_retain/alphajitexecutionengine.cpp's
// engine-owns-a-profiler-and-a-compiler shape, with the worker-pool/channel
// plumbing generalized from the teacher's thread+channel idiom used
// throughout barrier.rs and smp.rs.

pub mod cache;
pub mod compiler;
pub mod profiler;
pub mod tracer;

use crate::cpu::Cpu;
use crate::error::CoreResult;
use cache::TranslationCache;
use compiler::{CompiledBlock, JitCompiler, TraceSource};
use profiler::Profiler;
use std::sync::Arc;

/// Traces basic blocks through a CPU's (thread-safe) memory port, without
/// touching its register state — the seam that lets compilation run on a
/// background worker while the CPU keeps executing (§4.9, §5).
pub struct MemoryTraceSource {
    memory: Arc<crate::memory_system::CpuMemoryPort>,
    asn: u32,
    is_kernel: bool,
}

impl MemoryTraceSource {
    pub fn new(memory: Arc<crate::memory_system::CpuMemoryPort>, asn: u32, is_kernel: bool) -> Self {
        Self { memory, asn, is_kernel }
    }
}

impl TraceSource for MemoryTraceSource {
    fn trace_block(&self, pc: u64) -> CoreResult<tracer::TracedBlock> {
        let mut instructions = Vec::new();
        let mut cursor = pc;
        for _ in 0..tracer::MAX_BLOCK_LENGTH {
            let bytes = self.memory.fetch(cursor, self.asn, self.is_kernel, cursor)?;
            let raw = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            let decoded = crate::decode::decode(raw, cursor);
            let boundary = matches!(decoded.format, crate::decode::Format::Branch | crate::decode::Format::Pal)
                || (decoded.format == crate::decode::Format::Memory && (decoded.opcode == 0x1a || decoded.opcode == 0x18));
            instructions.push(decoded);
            if boundary {
                break;
            }
            cursor = cursor.wrapping_add(4);
        }
        Ok(tracer::TracedBlock { start_pc: pc, instructions })
    }
}

pub struct JitConfig {
    pub initial_hot_threshold: u64,
    pub cache_capacity: usize,
    pub worker_count: usize,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self { initial_hot_threshold: 1000, cache_capacity: 4096, worker_count: 2 }
    }
}

pub struct JitEngine {
    profiler: Profiler,
    compiler: JitCompiler,
    cache: Arc<TranslationCache>,
    enabled: bool,
}

impl JitEngine {
    pub fn new(config: JitConfig) -> Self {
        Self {
            profiler: Profiler::new(config.initial_hot_threshold),
            compiler: JitCompiler::new(config.worker_count),
            cache: Arc::new(TranslationCache::new(config.cache_capacity)),
            enabled: true,
        }
    }

    pub fn cache(&self) -> Arc<TranslationCache> {
        Arc::clone(&self.cache)
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Runs one step: replays a cached compiled block if one covers the
    /// current PC, otherwise falls through to the ordinary fetch-decode-
    /// dispatch cycle and records the execution for profiling.
    pub fn step(&self, cpu: &mut Cpu) -> CoreResult<()> {
        self.drain_compiled_results();
        let pc = cpu.state.pc;

        if self.enabled {
            if let Some(block) = self.cache.lookup(pc) {
                return self.replay(cpu, &block);
            }
        }

        cpu.clock_cycle()?;
        if self.enabled {
            self.profiler.record_execution(pc);
            self.drain_hot_pcs(cpu);
            self.profiler.adjust_threshold(self.compiler.success_rate(), self.cache.hit_rate(), self.cache.is_near_capacity());
        }
        Ok(())
    }

    /// Replays a cached block one instruction at a time through the same
    /// vectored-entry path `Cpu::clock_cycle` uses, so a guest exception
    /// raised mid-block (a compiled block isn't guaranteed fault-free) is
    /// delivered to the guest instead of escaping `step`.
    fn replay(&self, cpu: &mut Cpu, block: &CompiledBlock) -> CoreResult<()> {
        match block.instructions() {
            Some(instructions) => {
                for decoded in instructions {
                    let fallthrough = decoded.pc.wrapping_add(4);
                    cpu.dispatch_vectored(decoded, fallthrough)?;
                    // a redirect out of the traced straight-line path (taken
                    // branch, or an exception's vectored entry) ends replay
                    // early even if more instructions remain cached.
                    if cpu.state.pc != fallthrough {
                        break;
                    }
                }
                Ok(())
            }
            None => cpu.clock_cycle(),
        }
    }

    fn drain_hot_pcs(&self, cpu: &Cpu) {
        let events = self.profiler.hot_events();
        while let Ok(pc) = events.try_recv() {
            let source = Arc::new(MemoryTraceSource::new(Arc::clone(&cpu.memory), cpu.state.asn, cpu.state.is_kernel()));
            let _ = self.compiler.submit(pc, source);
        }
    }

    fn drain_compiled_results(&self) {
        let results = self.compiler.results();
        while let Ok((pc, block)) = results.try_recv() {
            let end_pc = match block.instructions() {
                Some(instrs) => pc + 4 * instrs.len() as u64,
                None => pc + 4,
            };
            self.cache.insert(pc, end_pc, block);
        }
    }
}
