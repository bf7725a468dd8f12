// Glues the TLB (§4.5), the cache hierarchy (§4.6), and the external
// physical-memory / page-table-walker / device-bus collaborators (§6) behind
// the single seam the memory executor (§4.4) and the I-fetch path use. The
// shared L3 lives here once per `MemorySystem`; every CPU's `Tlb` and
// per-CPU L1/L2 levels are constructed separately and registered.

use crate::cache::{CacheGeometry, CacheHierarchy, CacheLevel, LineState};
use crate::error::{CoreResult, ExceptionKind, GuestException};
use crate::external::{DeviceBus, PageTableWalker, PhysicalMemory};
use crate::fields::Permissions;
use crate::platform::PlatformProfile;
use crate::tlb::{Tlb, TlbConfig};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Lock-reservation granules (§3), keyed by physical address and shared by
/// every CPU: LDx_L records the reserving CPU here, and a store to that PA
/// from *any* CPU — including a plain store from the reserving CPU itself —
/// clears it, so STx_C can tell a reservation was broken by another CPU
/// rather than just trusting its own CPU-local bookkeeping.
struct ReservationTable {
    owners: Mutex<HashMap<u64, u32>>,
}

impl ReservationTable {
    fn new() -> Self {
        Self { owners: Mutex::new(HashMap::new()) }
    }

    fn reserve(&self, pa: u64, cpu_id: u32) {
        self.owners.lock().insert(pa, cpu_id);
    }

    /// STx_C: true iff `cpu_id` still holds the reservation on `pa`. Clears
    /// the entry either way — a failed conditional store also ends the
    /// reservation (§3).
    fn check_and_clear(&self, pa: u64, cpu_id: u32) -> bool {
        let mut owners = self.owners.lock();
        match owners.remove(&pa) {
            Some(owner) => owner == cpu_id,
            None => false,
        }
    }

    fn invalidate(&self, pa: u64) {
        self.owners.lock().remove(&pa);
    }
}

pub struct MemorySystem {
    pub platform: Arc<PlatformProfile>,
    pub l3: CacheLevel,
    pub memory: Arc<dyn PhysicalMemory>,
    pub walker: Arc<dyn PageTableWalker>,
    pub devices: Arc<dyn DeviceBus>,
    reservations: ReservationTable,
}

impl MemorySystem {
    pub fn new(
        platform: Arc<PlatformProfile>,
        l3_geometry: CacheGeometry,
        memory: Arc<dyn PhysicalMemory>,
        walker: Arc<dyn PageTableWalker>,
        devices: Arc<dyn DeviceBus>,
    ) -> Self {
        Self {
            platform,
            l3: CacheLevel::new("L3", l3_geometry),
            memory,
            walker,
            devices,
            reservations: ReservationTable::new(),
        }
    }
}

/// The per-CPU slice of the memory system: owns the TLB and L1/L2 levels,
/// shares the `MemorySystem`'s L3/memory/device collaborators.
pub struct CpuMemoryPort {
    pub tlb: Arc<Tlb>,
    pub caches: CacheHierarchy,
    system: Arc<MemorySystem>,
}

impl CpuMemoryPort {
    pub fn new(system: Arc<MemorySystem>, tlb_config: TlbConfig, l1i: CacheGeometry, l1d: CacheGeometry, l2: CacheGeometry) -> Self {
        Self { tlb: Arc::new(Tlb::new(tlb_config)), caches: CacheHierarchy::new(l1i, l1d, l2), system }
    }

    fn translate(
        &self,
        va: u64,
        asn: u32,
        is_kernel: bool,
        is_write: bool,
        is_instruction: bool,
        pc: u64,
    ) -> CoreResult<(u64, Permissions)> {
        if let Some(hit) = self.tlb.lookup(va, asn, is_kernel, is_write, is_instruction) {
            return Ok(hit);
        }
        let translation = self.system.walker.walk(va, asn, is_kernel, is_write, is_instruction).map_err(|_| {
            GuestException::with_address(ExceptionKind::PageFault, pc, va)
        })?;
        self.tlb.insert(va, translation.pa, asn, translation.perms, is_instruction, self.system.walker.as_ref())?;
        if !translation.perms.allows(is_write, is_instruction, is_kernel) {
            let kind = if is_instruction {
                ExceptionKind::ExecuteFault
            } else if is_write {
                ExceptionKind::WriteFault
            } else {
                ExceptionKind::ReadFault
            };
            return Err(GuestException::with_address(kind, pc, va).into());
        }
        Ok((translation.pa, translation.perms))
    }

    /// Fetches `len` bytes from `va` through the I-TLB and I-cache path.
    pub fn fetch(&self, va: u64, asn: u32, is_kernel: bool, pc: u64) -> CoreResult<Vec<u8>> {
        let (pa, _) = self.translate(va, asn, is_kernel, false, true, pc)?;
        if self.system.platform.is_mmio(pa) {
            return self.system.devices.mmio_read(pa, 4);
        }
        self.caches.read(pa, 4, &self.system.l3, self.system.memory.as_ref(), true)
    }

    /// Reads `len` bytes from `va` through the D-TLB and D-cache path (§4.4).
    pub fn load(
        &self,
        va: u64,
        len: usize,
        asn: u32,
        is_kernel: bool,
        pc: u64,
    ) -> CoreResult<(u64, Vec<u8>)> {
        let (pa, _) = self.translate(va, asn, is_kernel, false, false, pc)?;
        if self.system.platform.is_mmio(pa) {
            return Ok((pa, self.system.devices.mmio_read(pa, len)?));
        }
        Ok((pa, self.caches.read(pa, len, &self.system.l3, self.system.memory.as_ref(), false)?))
    }

    /// Writes `bytes` at `va` through the D-TLB and D-cache path (§4.4). Any
    /// store, from any CPU, breaks a live LDx_L reservation on the written
    /// physical line (§3).
    pub fn store(&self, va: u64, bytes: &[u8], asn: u32, is_kernel: bool, pc: u64) -> CoreResult<u64> {
        let (pa, _) = self.translate(va, asn, is_kernel, true, false, pc)?;
        if self.system.platform.is_mmio(pa) {
            self.system.devices.mmio_write(pa, bytes)?;
            self.system.reservations.invalidate(pa);
            return Ok(pa);
        }
        self.caches.write(pa, bytes, &self.system.l3);
        self.system.reservations.invalidate(pa);
        Ok(pa)
    }

    /// Records a lock reservation for `pa`, owned by `cpu_id` (LDx_L, §3).
    pub fn reserve(&self, pa: u64, cpu_id: u32) {
        self.system.reservations.reserve(pa, cpu_id);
    }

    /// STx_C's reservation check: true iff `cpu_id` still owns the
    /// reservation on `pa`. Clears it either way.
    pub fn check_and_clear_reservation(&self, pa: u64, cpu_id: u32) -> bool {
        self.system.reservations.check_and_clear(pa, cpu_id)
    }

    pub fn invalidate_line(&self, pa: u64) {
        self.caches.invalidate_line(pa, &self.system.l3);
    }

    /// Drains this CPU's own pending coherency-invalidate events, for the
    /// caller to forward to peers as an SMP message (§4.6/§9).
    pub fn drain_coherency_invalidations(&self) -> Vec<u64> {
        self.caches.drain_invalidations()
    }

    /// Applies a peer CPU's write to this CPU's own L1i/L1d/L2 (§4.6): called
    /// when this CPU's SMP mailbox is pumped and yields an Invalidate message.
    pub fn observe_peer_invalidate(&self, pa: u64) {
        self.caches.observe_peer_invalidate(pa);
    }

    pub fn invalidate_instruction_entries(&self) {
        self.tlb.invalidate_instruction_entries();
    }

    /// IMB's cache-side half (§4.8): the I-TLB shootdown above doesn't touch
    /// anything already fetched into L1-I, so a self-modified line one
    /// instruction away from the barrier would otherwise still serve stale
    /// bytes on the next fetch.
    pub fn invalidate_instruction_cache(&self) {
        self.caches.l1i.invalidate_all();
    }

    pub fn flush(&self) {
        self.caches.flush(self.system.memory.as_ref(), &self.system.l3);
    }

    /// Physical-address access bypassing translation, for PALcode's HW_LD/
    /// HW_ST (§4.8). Alpha's privileged hardware instructions address
    /// memory directly; the TLB and cache hierarchy play no part.
    pub fn system_read_physical(&self, pa: u64, len: usize) -> CoreResult<Vec<u8>> {
        self.system.memory.read(pa, len)
    }

    pub fn system_write_physical(&self, pa: u64, bytes: &[u8]) -> CoreResult<()> {
        self.system.memory.write(pa, bytes)
    }

    pub fn prefetch(&self, va: u64, len: usize, asn: u32, is_kernel: bool, pc: u64, exclusive: bool) {
        if let Ok((pa, _)) = self.translate(va, asn, is_kernel, exclusive, false, pc) {
            if let Ok(bytes) = self.system.memory.read(pa, len) {
                let state = if exclusive { LineState::Exclusive } else { LineState::Shared };
                self.caches.l1d.fill(pa, &bytes, state);
            }
        }
    }
}
