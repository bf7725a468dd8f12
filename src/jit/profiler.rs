// Hot-PC profiler (§4.9). Per-PC execution/branch-taken/memory-access
// counters behind relaxed atomics — profiling never blocks the interpreter
// loop it's measuring, grounded in
// examples/original_source/AEJ/pipeline_jitcompiler.h's `alphaBlockProfiler`
// (`ProfileData`'s atomic counters; "profiling is advisory, read by the
// tuner and the compiler, never gating interpretation"). A PC crossing the
// adaptive threshold emits a hot-PC event on a bounded channel for the
// compiler worker to pick up; the threshold itself adapts the way
// `pipeline_jitcompiler.cpp`'s `alphaJitCompiler::adjustThresholds` does.

use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
struct Counters {
    executions: AtomicU64,
    branches_taken: AtomicU64,
    memory_accesses: AtomicU64,
}

pub struct Profiler {
    counters: RwLock<HashMap<u64, Counters>>,
    hot_threshold: AtomicU64,
    hot_tx: Sender<u64>,
    hot_rx: Receiver<u64>,
}

impl Profiler {
    pub fn new(initial_threshold: u64) -> Self {
        let (hot_tx, hot_rx) = crossbeam_channel::bounded(1024);
        Self { counters: RwLock::new(HashMap::new()), hot_threshold: AtomicU64::new(initial_threshold), hot_tx, hot_rx }
    }

    pub fn hot_events(&self) -> Receiver<u64> {
        self.hot_rx.clone()
    }

    /// Records one interpreted execution of the block starting at `pc`;
    /// emits a hot-PC event the first time this PC crosses the threshold.
    pub fn record_execution(&self, pc: u64) {
        let count = self.bump(pc, |c| &c.executions);
        if count == self.hot_threshold.load(Ordering::Relaxed) {
            let _ = self.hot_tx.try_send(pc);
        }
    }

    pub fn record_branch_taken(&self, pc: u64) {
        self.bump(pc, |c| &c.branches_taken);
    }

    pub fn record_memory_access(&self, pc: u64) {
        self.bump(pc, |c| &c.memory_accesses);
    }

    fn bump(&self, pc: u64, select: impl Fn(&Counters) -> &AtomicU64) -> u64 {
        {
            let counters = self.counters.read();
            if let Some(entry) = counters.get(&pc) {
                return select(entry).fetch_add(1, Ordering::Relaxed) + 1;
            }
        }
        let mut counters = self.counters.write();
        let entry = counters.entry(pc).or_default();
        select(entry).fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn execution_count(&self, pc: u64) -> u64 {
        self.counters.read().get(&pc).map(|c| c.executions.load(Ordering::Relaxed)).unwrap_or(0)
    }

    pub fn hot_threshold(&self) -> u64 {
        self.hot_threshold.load(Ordering::Relaxed)
    }

    /// Adaptive tuning (§4.9, mirroring `alphaJitCompiler::adjustThresholds`):
    /// a poor compile success rate raises the bar (fewer, more-worthwhile
    /// compiles), as does a cache near capacity with a poor hit rate
    /// (thrashing — compiling more blocks in would only evict others sooner).
    /// A sustained high success rate lowers the bar so more of the working
    /// set gets compiled.
    pub fn adjust_threshold(&self, compile_success_rate: f64, cache_hit_rate: f64, cache_near_capacity: bool) {
        let current = self.hot_threshold.load(Ordering::Relaxed);
        if compile_success_rate < 0.5 || (cache_near_capacity && cache_hit_rate < 0.5) {
            self.hot_threshold.store(current.saturating_mul(2).max(1), Ordering::Relaxed);
        } else if compile_success_rate > 0.9 {
            self.hot_threshold.store((current / 2).max(1), Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crossing_threshold_emits_exactly_one_hot_event() {
        let profiler = Profiler::new(3);
        let events = profiler.hot_events();
        for _ in 0..5 {
            profiler.record_execution(0x400);
        }
        assert_eq!(events.try_recv().unwrap(), 0x400);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn distinct_pcs_have_independent_counters() {
        let profiler = Profiler::new(100);
        profiler.record_execution(0x400);
        profiler.record_execution(0x400);
        profiler.record_execution(0x800);
        assert_eq!(profiler.execution_count(0x400), 2);
        assert_eq!(profiler.execution_count(0x800), 1);
    }
}
