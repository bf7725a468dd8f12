//! Core execution engine for a DEC Alpha AXP (EV4-EV7) emulator: per-CPU
//! architectural state, instruction decode and dispatch, the TLB and cache
//! hierarchy, the memory-barrier coordinator, SMP coordination, and the JIT
//! translation pipeline. This crate models the CORE only — it has no
//! display, storage, or terminal surface; a host binary supplies the
//! `PhysicalMemory`/`PageTableWalker`/`DeviceBus` collaborators from
//! `external` and drives `CoreEngine::step_cpu` in its own loop.

pub mod barrier;
pub mod cache;
pub mod config;
pub mod conversions;
pub mod cpu;
pub mod decode;
pub mod error;
pub mod exception;
pub mod execute;
pub mod external;
pub mod fields;
pub mod jit;
pub mod memory_system;
pub mod platform;
pub mod smp;
pub mod state;
pub mod tlb;

#[cfg(test)]
mod test_support;

use cache::CacheGeometry;
use config::CoreConfig;
use cpu::Cpu;
use error::CoreResult;
use exception::ExceptionChannel;
use external::{DeviceBus, PageTableWalker, PhysicalMemory};
use jit::{JitConfig, JitEngine};
use memory_system::{CpuMemoryPort, MemorySystem};
use platform::PlatformProfile;
use smp::SmpManager;
use std::sync::Arc;
use std::time::Duration;
use tlb::TlbConfig;

/// The barrier coordinator's bounded wait for SMP acknowledgement (§4.7).
/// Not presently exposed through `CoreConfig`; revisit if a deployment needs
/// a tighter or looser bound than this default.
const DEFAULT_BARRIER_TIMEOUT: Duration = Duration::from_millis(200);

/// Ties one engine's worth of CPUs, the shared memory system, the SMP
/// manager, and per-CPU JIT engines together (§2's layer table, layer L8).
pub struct CoreEngine {
    pub cpus: Vec<Cpu>,
    pub exceptions: Arc<ExceptionChannel>,
    smp: Arc<SmpManager>,
    jit_engines: Vec<Option<JitEngine>>,
}

impl CoreEngine {
    pub fn new(
        config: CoreConfig,
        generation: platform::Generation,
        memory: Arc<dyn PhysicalMemory>,
        walker: Arc<dyn PageTableWalker>,
        devices: Arc<dyn DeviceBus>,
    ) -> CoreResult<Self> {
        config.validate()?;
        let platform = Arc::new(PlatformProfile::new(generation, config.system.processor_count));
        let l3_geometry = geometry_of(&config.cache.l3);
        let system = Arc::new(MemorySystem::new(Arc::clone(&platform), l3_geometry, memory, walker, devices));

        let cpu_ids: Vec<u32> = (0..config.system.processor_count as u32).collect();
        let smp = Arc::new(SmpManager::new(&cpu_ids));
        let exceptions = Arc::new(ExceptionChannel::new(1024));
        let barrier_policy = config.barrier_timeout_policy.into_policy();

        let l1i = geometry_of(&config.cache.l1_inst);
        let l1d = geometry_of(&config.cache.l1_data);
        let l2 = geometry_of(&config.cache.l2);

        let mut cpus = Vec::with_capacity(cpu_ids.len());
        let mut jit_engines = Vec::with_capacity(cpu_ids.len());
        for &id in &cpu_ids {
            let tlb_config = TlbConfig {
                sets: tlb::DEFAULT_SETS,
                ways: tlb::DEFAULT_WAYS,
                max_sets: tlb::DEFAULT_SETS * 4,
                max_ways: tlb::DEFAULT_WAYS * 2,
            };
            let port = CpuMemoryPort::new(Arc::clone(&system), tlb_config, l1i, l1d, l2);
            let state = state::CpuState::new(id, &platform);
            let view = smp.view(id);
            let mut cpu = Cpu::new(state, port, view, Arc::clone(&exceptions), DEFAULT_BARRIER_TIMEOUT, barrier_policy);

            let jit = if config.system.jit_enabled {
                let engine = JitEngine::new(JitConfig {
                    initial_hot_threshold: config.system.jit_threshold,
                    ..JitConfig::default()
                });
                cpu = cpu.with_jit_cache(engine.cache());
                Some(engine)
            } else {
                None
            };
            cpus.push(cpu);
            jit_engines.push(jit);
        }

        Ok(Self { cpus, exceptions, smp, jit_engines })
    }

    /// Advances `cpu_id` by one step: through the JIT engine if enabled for
    /// that CPU, otherwise directly through `Cpu::clock_cycle`. Either path
    /// may have written through this CPU's cache hierarchy; forward any
    /// resulting coherency invalidations to peers before returning.
    pub fn step_cpu(&mut self, cpu_id: usize) -> CoreResult<()> {
        let result = match &self.jit_engines[cpu_id] {
            Some(jit) => jit.step(&mut self.cpus[cpu_id]),
            None => self.cpus[cpu_id].clock_cycle(),
        };
        self.cpus[cpu_id].propagate_coherency();
        result
    }

    /// Round-robins every CPU for `cycles` steps each, pumping SMP mailboxes
    /// between rounds so barrier acknowledgements, IPIs, and cache-coherency
    /// invalidations are delivered promptly (§5's cooperative scheduling
    /// note).
    pub fn run_cycles(&mut self, cycles: usize) -> CoreResult<()> {
        for _ in 0..cycles {
            for id in 0..self.cpus.len() {
                self.step_cpu(id)?;
                let memory = Arc::clone(&self.cpus[id].memory);
                self.smp.pump(id as u32, move |pa| memory.observe_peer_invalidate(pa))?;
            }
            self.exceptions.dispatch_pending();
        }
        // Dynamic TLB sizing (§4.5, §1): re-check hit rate/contention once per
        // batch rather than on every cycle, matching the original's
        // once-every-few-seconds tuning cadence at a coarser granularity.
        for cpu in &self.cpus {
            cpu.memory.tlb.auto_tune();
        }
        Ok(())
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    /// This CPU's JIT translation cache, if JIT is enabled for it. Exposed
    /// for introspection (e.g. confirming IMB invalidated a cached block).
    pub fn jit_cache(&self, cpu_id: usize) -> Option<Arc<jit::cache::TranslationCache>> {
        self.jit_engines[cpu_id].as_ref().map(|e| e.cache())
    }
}

fn geometry_of(level: &config::CacheLevelConfig) -> CacheGeometry {
    CacheGeometry { num_sets: level.num_sets, associativity: level.associativity, line_size: level.line_size }
}
