// Configuration collaborator (§6, ambient per SPEC_FULL §4.0). Deserializes
// the recognized keys via `serde` + `toml`, grounded in
// examples/original_source/AEJ/alphasystemconfigurator.h for the key names
// and defaults, and in examples/amoljassal-sis-kernel-showcase's workspace
// dependency table for the serde/toml/thiserror combination this crate
// otherwise has no reason to reach for on its own.

use crate::barrier::BarrierTimeoutPolicy;
use crate::error::{CoreError, CoreResult};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfig {
    #[serde(rename = "MemorySize", default = "default_memory_size")]
    pub memory_size_gib: u64,
    #[serde(rename = "Processor-Count", default = "default_processor_count")]
    pub processor_count: usize,
    #[serde(rename = "JIT", default = "default_true")]
    pub jit_enabled: bool,
    #[serde(rename = "JIT-Threshold", default = "default_jit_threshold")]
    pub jit_threshold: u64,
    #[serde(rename = "Coherency-Cache", default = "default_true")]
    pub coherency_cache: bool,
}

fn default_memory_size() -> u64 {
    4
}
fn default_processor_count() -> usize {
    1
}
fn default_jit_threshold() -> u64 {
    1000
}
fn default_true() -> bool {
    true
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            memory_size_gib: default_memory_size(),
            processor_count: default_processor_count(),
            jit_enabled: true,
            jit_threshold: default_jit_threshold(),
            coherency_cache: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheLevelConfig {
    #[serde(default = "default_num_sets")]
    pub num_sets: usize,
    #[serde(default = "default_associativity")]
    pub associativity: usize,
    #[serde(default = "default_line_size")]
    pub line_size: usize,
    #[serde(default = "default_true")]
    pub enable_prefetch: bool,
    #[serde(default = "default_true")]
    pub enable_statistics: bool,
    #[serde(default = "default_true")]
    pub enable_coherency: bool,
    #[serde(default = "default_protocol")]
    pub coherency_protocol: String,
}

fn default_num_sets() -> usize {
    256
}
fn default_associativity() -> usize {
    4
}
fn default_line_size() -> usize {
    64
}
fn default_protocol() -> String {
    "MESI".to_string()
}

impl Default for CacheLevelConfig {
    fn default() -> Self {
        Self {
            num_sets: default_num_sets(),
            associativity: default_associativity(),
            line_size: default_line_size(),
            enable_prefetch: true,
            enable_statistics: true,
            enable_coherency: true,
            coherency_protocol: default_protocol(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CacheConfig {
    #[serde(rename = "Cache-L1Data", default)]
    pub l1_data: CacheLevelConfig,
    #[serde(rename = "Cache-L1Inst", default)]
    pub l1_inst: CacheLevelConfig,
    #[serde(rename = "Cache-L2", default)]
    pub l2: CacheLevelConfig,
    #[serde(rename = "Cache-L3", default)]
    pub l3: CacheLevelConfig,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum ReplacementPolicy {
    Lru,
    Random,
    Fifo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlbSystemConfig {
    #[serde(rename = "entriesPerCpu", default = "default_entries_per_cpu")]
    pub entries_per_cpu: usize,
    #[serde(rename = "maxCpus", default = "default_max_cpus")]
    pub max_cpus: usize,
    #[serde(rename = "replacementPolicy", default = "default_replacement_policy")]
    pub replacement_policy: ReplacementPolicy,
}

fn default_entries_per_cpu() -> usize {
    crate::tlb::DEFAULT_SETS * crate::tlb::DEFAULT_WAYS
}
fn default_max_cpus() -> usize {
    64
}
fn default_replacement_policy() -> ReplacementPolicy {
    ReplacementPolicy::Lru
}

impl Default for TlbSystemConfig {
    fn default() -> Self {
        Self {
            entries_per_cpu: default_entries_per_cpu(),
            max_cpus: default_max_cpus(),
            replacement_policy: default_replacement_policy(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlbCacheIntegrationConfig {
    #[serde(rename = "prefetchDepth", default)]
    pub prefetch_depth: usize,
    #[serde(rename = "prefetchDistance", default)]
    pub prefetch_distance: usize,
    #[serde(rename = "cacheLineSize", default = "default_line_size")]
    pub cache_line_size: usize,
    #[serde(rename = "pageSize", default = "default_page_size")]
    pub page_size: u64,
    #[serde(rename = "efficiencyTarget", default = "default_efficiency_target")]
    pub efficiency_target: f64,
    #[serde(rename = "coherencyEnabled", default = "default_true")]
    pub coherency_enabled: bool,
    #[serde(rename = "prefetchEnabled", default = "default_true")]
    pub prefetch_enabled: bool,
    #[serde(rename = "writebackEnabled", default = "default_true")]
    pub writeback_enabled: bool,
}

fn default_page_size() -> u64 {
    crate::tlb::PAGE_SIZE
}
fn default_efficiency_target() -> f64 {
    0.9
}

impl Default for TlbCacheIntegrationConfig {
    fn default() -> Self {
        Self {
            prefetch_depth: 0,
            prefetch_distance: 0,
            cache_line_size: default_line_size(),
            page_size: default_page_size(),
            efficiency_target: default_efficiency_target(),
            coherency_enabled: true,
            prefetch_enabled: true,
            writeback_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CoreConfig {
    #[serde(rename = "System", default)]
    pub system: SystemConfig,
    #[serde(flatten)]
    pub cache: CacheConfig,
    #[serde(rename = "TlbSystem", default)]
    pub tlb: TlbSystemConfig,
    #[serde(rename = "TlbCacheIntegration", default)]
    pub tlb_cache_integration: TlbCacheIntegrationConfig,
    #[serde(skip)]
    pub barrier_timeout_policy: BarrierTimeoutPolicySetting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BarrierTimeoutPolicySetting {
    #[default]
    Reset,
    Escalate,
}

impl BarrierTimeoutPolicySetting {
    pub fn into_policy(self) -> BarrierTimeoutPolicy {
        match self {
            Self::Reset => BarrierTimeoutPolicy::Reset,
            Self::Escalate => BarrierTimeoutPolicy::Escalate { after_consecutive: 3 },
        }
    }
}

impl CoreConfig {
    pub fn from_toml_str(text: &str) -> CoreResult<Self> {
        toml::from_str(text).map_err(|e| CoreError::Config(e.to_string()))
    }

    /// Enforces the invariants named in spec.md §6: `MemorySize >= 4` GiB,
    /// `coherencyProtocol == "MESI"`.
    pub fn validate(&self) -> CoreResult<()> {
        if self.system.memory_size_gib < 4 {
            return Err(CoreError::Config(format!(
                "MemorySize must be at least 4 GiB, got {}",
                self.system.memory_size_gib
            )));
        }
        for level in [&self.cache.l1_data, &self.cache.l1_inst, &self.cache.l2, &self.cache.l3] {
            if level.coherency_protocol != "MESI" {
                return Err(CoreError::Config(format!(
                    "unsupported coherency protocol: {}",
                    level.coherency_protocol
                )));
            }
        }
        if self.system.processor_count == 0 {
            return Err(CoreError::Config("Processor-Count must be at least 1".into()));
        }
        Ok(())
    }
}
