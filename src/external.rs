// Narrow interfaces to the surrounding subsystems named in spec.md §6.
// The core never holds a strong owning reference to these collaborators'
// implementations; callers provide `&dyn Trait` (or an `Arc<dyn Trait>`)
// at construction, matching the teacher's `Bus`/`Device` seam in memory.rs.

use crate::error::CoreResult;
use crate::fields::Permissions;

/// `read(PA, len) -> bytes` / `write(PA, bytes) -> ok`, 8-byte granularity
/// preferred; the cache hierarchy assembles sub-line accesses.
pub trait PhysicalMemory: Send + Sync {
    fn read(&self, pa: u64, len: usize) -> CoreResult<Vec<u8>>;
    fn write(&self, pa: u64, bytes: &[u8]) -> CoreResult<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct Translation {
    pub pa: u64,
    pub perms: Permissions,
}

/// Invoked on TLB miss; may itself fault (translation-not-valid, access
/// violation) per spec.md §4.5/§6.
pub trait PageTableWalker: Send + Sync {
    fn walk(
        &self,
        va: u64,
        asn: u32,
        is_kernel: bool,
        is_write: bool,
        is_instruction: bool,
    ) -> CoreResult<Translation>;
}

/// A message broadcast or unicast between CPUs by the barrier coordinator or
/// the cache coherency machinery — the only two callers per spec.md §6.
#[derive(Debug, Clone)]
pub struct SmpMessage {
    pub payload: SmpPayload,
}

#[derive(Debug, Clone)]
pub enum SmpPayload {
    Invalidate { pa: u64 },
    BarrierRequest { sequence: u64, kind: crate::barrier::BarrierType },
    BarrierAck { sequence: u64 },
    TlbShootdown { asn: Option<u32>, va: Option<u64> },
}

pub trait SmpCollaborator: Send + Sync {
    fn broadcast(&self, sender: u32, msg: SmpMessage, targets: &[u32]) -> CoreResult<()>;
    fn send(&self, sender: u32, target: u32, msg: SmpMessage) -> CoreResult<()>;
    fn cpu_count(&self) -> usize;
    fn this_cpu_id(&self) -> u32;
}

/// Addresses above the physical-memory region are routed here by
/// `PlatformProfile::is_mmio`.
pub trait DeviceBus: Send + Sync {
    fn mmio_read(&self, pa: u64, len: usize) -> CoreResult<Vec<u8>>;
    fn mmio_write(&self, pa: u64, bytes: &[u8]) -> CoreResult<()>;
}
