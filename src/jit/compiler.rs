// Compile task (§4.9). Complexity-tiered: blocks under 10 compile to a
// direct "interpreted" tier (decode is cached, dispatch still goes through
// the ordinary per-instruction executors), 10-50 compile to an "optimized"
// lowered form (decode is cached and re-validated less strictly), anything
// above 50 falls back to the plain interpreter permanently. Grounded in
// examples/original_source/AEJ/pipeline_jitcompiler.h's `alphaJitCompileTask`
// (`compileInterpreted`/`compileOptimized` split off `alphaBasicBlock`'s
// `getComplexityScore`) and its background worker pool (`QThreadPool`
// draining a bounded request queue, one in-flight compile per PC, mirrored
// here with a fixed `std::thread` pool over a bounded channel).

use super::tracer::{trace, TracedBlock};
use crate::decode::DecodedInstruction;
use crate::error::{CoreError, CoreResult, HostFault};
use crossbeam_channel::{Receiver, Sender};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;

pub const SIMPLE_TIER_MAX: u32 = 10;
pub const OPTIMIZED_TIER_MAX: u32 = 50;

#[derive(Debug, Clone)]
pub enum CompiledBlock {
    Interpreted(Vec<DecodedInstruction>),
    Optimized(Vec<DecodedInstruction>),
    Fallback,
}

impl CompiledBlock {
    pub fn from_trace(block: &TracedBlock) -> Self {
        let complexity = block.complexity();
        if complexity < SIMPLE_TIER_MAX {
            Self::Interpreted(block.instructions.clone())
        } else if complexity <= OPTIMIZED_TIER_MAX {
            Self::Optimized(block.instructions.clone())
        } else {
            Self::Fallback
        }
    }

    pub fn instructions(&self) -> Option<&[DecodedInstruction]> {
        match self {
            Self::Interpreted(i) | Self::Optimized(i) => Some(i),
            Self::Fallback => None,
        }
    }
}

/// Anything that can trace a basic block starting at a given PC. The real
/// implementation is `Cpu::decoded_at` chained through `jit::tracer::trace`;
/// kept behind this narrow seam so compile workers never touch live CPU
/// register state, only the (thread-safe) memory path.
pub trait TraceSource: Send + Sync {
    fn trace_block(&self, pc: u64) -> CoreResult<TracedBlock>;
}

struct CompileRequest {
    pc: u64,
    source: Arc<dyn TraceSource>,
}

pub struct JitCompiler {
    tx: Sender<CompileRequest>,
    results_rx: Receiver<(u64, CompiledBlock)>,
    in_flight: Arc<Mutex<HashSet<u64>>>,
    attempted: Arc<std::sync::atomic::AtomicU64>,
    succeeded: Arc<std::sync::atomic::AtomicU64>,
}

impl JitCompiler {
    pub fn new(worker_count: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded::<CompileRequest>(256);
        let (results_tx, results_rx) = crossbeam_channel::bounded(256);
        let in_flight = Arc::new(Mutex::new(HashSet::new()));
        let attempted = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let succeeded = Arc::new(std::sync::atomic::AtomicU64::new(0));

        for _ in 0..worker_count.max(1) {
            let rx = rx.clone();
            let results_tx = results_tx.clone();
            let in_flight = Arc::clone(&in_flight);
            let attempted = Arc::clone(&attempted);
            let succeeded = Arc::clone(&succeeded);
            thread::spawn(move || {
                while let Ok(request) = rx.recv() {
                    attempted.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    let outcome = request.source.trace_block(request.pc).map(|block| CompiledBlock::from_trace(&block));
                    in_flight.lock().unwrap().remove(&request.pc);
                    match outcome {
                        Ok(block) => {
                            succeeded.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            let _ = results_tx.try_send((request.pc, block));
                        }
                        Err(e) => {
                            log::warn!("jit compile failed for pc={:#018x}: {}", request.pc, e);
                        }
                    }
                }
            });
        }

        Self { tx, results_rx, in_flight, attempted, succeeded }
    }

    /// Submits `pc` for background compilation; a no-op if a compile for
    /// this PC is already in flight (at-most-once, §4.9).
    pub fn submit(&self, pc: u64, source: Arc<dyn TraceSource>) -> CoreResult<()> {
        let mut in_flight = self.in_flight.lock().unwrap();
        if !in_flight.insert(pc) {
            return Ok(());
        }
        drop(in_flight);
        self.tx.try_send(CompileRequest { pc, source }).map_err(|_| {
            CoreError::Host(HostFault::JitCompile { pc, reason: "compile queue full".into() })
        })
    }

    pub fn results(&self) -> Receiver<(u64, CompiledBlock)> {
        self.results_rx.clone()
    }

    pub fn success_rate(&self) -> f64 {
        let attempted = self.attempted.load(std::sync::atomic::Ordering::Relaxed) as f64;
        let succeeded = self.succeeded.load(std::sync::atomic::Ordering::Relaxed) as f64;
        if attempted == 0.0 {
            1.0
        } else {
            succeeded / attempted
        }
    }
}

/// Direct (non-worker-pool) compile, used by tests and by the engine when it
/// wants a synchronous result instead of polling `results()`.
pub fn compile_now(pc: u64, source: &dyn TraceSource) -> CoreResult<CompiledBlock> {
    let block = source.trace_block(pc)?;
    Ok(CompiledBlock::from_trace(&block))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{DecodedInstruction, Format};

    struct FixedSource {
        len: usize,
    }
    impl TraceSource for FixedSource {
        fn trace_block(&self, pc: u64) -> CoreResult<TracedBlock> {
            let instructions = (0..self.len)
                .map(|_| DecodedInstruction {
                    pc,
                    raw: 0,
                    format: Format::Operate,
                    opcode: 0x10,
                    ra: 0,
                    rb: 0,
                    rc: 0,
                    function: 0x20,
                    displacement: 0,
                    literal: 0,
                    literal_flag: false,
                    branch_displacement: 0,
                    pal_function: 0,
                })
                .collect();
            Ok(TracedBlock { start_pc: pc, instructions })
        }
    }

    #[test]
    fn short_block_compiles_to_interpreted_tier() {
        let source = FixedSource { len: 3 };
        let compiled = compile_now(0x400, &source).unwrap();
        assert!(matches!(compiled, CompiledBlock::Interpreted(_)));
    }

    #[test]
    fn long_block_falls_back() {
        let source = FixedSource { len: 60 };
        let compiled = compile_now(0x400, &source).unwrap();
        assert!(matches!(compiled, CompiledBlock::Fallback));
    }

    #[test]
    fn duplicate_submit_for_same_pc_is_a_no_op() {
        let compiler = JitCompiler::new(1);
        let source: Arc<dyn TraceSource> = Arc::new(FixedSource { len: 2 });
        compiler.submit(0x800, Arc::clone(&source)).unwrap();
        compiler.submit(0x800, source).unwrap();
        let (pc, _) = compiler.results().recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        assert_eq!(pc, 0x800);
        assert!(compiler.results().recv_timeout(std::time::Duration::from_millis(50)).is_err());
    }
}
