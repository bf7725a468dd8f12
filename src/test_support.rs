// Shared fixtures for the sub-executor unit tests in `src/execute/*`. Not
// part of the public API: only compiled under `#[cfg(test)]`.

use crate::barrier::BarrierTimeoutPolicy;
use crate::cache::CacheGeometry;
use crate::cpu::Cpu;
use crate::error::CoreResult;
use crate::exception::ExceptionChannel;
use crate::external::{DeviceBus, PageTableWalker, PhysicalMemory, Translation};
use crate::fields::Permissions;
use crate::memory_system::{CpuMemoryPort, MemorySystem};
use crate::platform::PlatformProfile;
use crate::smp::SmpManager;
use crate::state::CpuState;
use crate::tlb::TlbConfig;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

struct FlatMemory {
    bytes: Mutex<Vec<u8>>,
}

impl PhysicalMemory for FlatMemory {
    fn read(&self, pa: u64, len: usize) -> CoreResult<Vec<u8>> {
        let bytes = self.bytes.lock();
        let start = pa as usize;
        Ok(bytes[start..start + len].to_vec())
    }
    fn write(&self, pa: u64, data: &[u8]) -> CoreResult<()> {
        let mut bytes = self.bytes.lock();
        let start = pa as usize;
        bytes[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}

struct IdentityWalker;
impl PageTableWalker for IdentityWalker {
    fn walk(&self, va: u64, _asn: u32, _is_kernel: bool, _is_write: bool, _is_instruction: bool) -> CoreResult<Translation> {
        Ok(Translation { pa: va, perms: Permissions::rwx() })
    }
}

struct NoDevices;
impl DeviceBus for NoDevices {
    fn mmio_read(&self, _pa: u64, len: usize) -> CoreResult<Vec<u8>> {
        Ok(vec![0; len])
    }
    fn mmio_write(&self, _pa: u64, _bytes: &[u8]) -> CoreResult<()> {
        Ok(())
    }
}

/// A single-CPU harness wired end-to-end (state, memory port, barrier, SMP,
/// exceptions) against flat zero-initialized physical memory and an identity
/// page-table walker, for exercising one decoded instruction at a time.
pub fn fixture_cpu() -> Cpu {
    let profile = Arc::new(PlatformProfile::default());
    let memory: Arc<dyn PhysicalMemory> = Arc::new(FlatMemory { bytes: Mutex::new(vec![0u8; 1 << 20]) });
    let walker: Arc<dyn PageTableWalker> = Arc::new(IdentityWalker);
    let devices: Arc<dyn DeviceBus> = Arc::new(NoDevices);
    let system = Arc::new(MemorySystem::new(Arc::clone(&profile), CacheGeometry::default(), memory, walker, devices));
    let port = CpuMemoryPort::new(system, TlbConfig::default(), CacheGeometry::default(), CacheGeometry::default(), CacheGeometry::default());

    let smp = Arc::new(SmpManager::new(&[0]));
    let view = smp.view(0);
    let exceptions = Arc::new(ExceptionChannel::new(64));
    let state = CpuState::new(0, &profile);

    Cpu::new(state, port, view, exceptions, Duration::from_millis(50), BarrierTimeoutPolicy::Reset)
}
