// Translation Buffer (§4.5, layer L2). A per-CPU set-associative cache with
// configurable geometry, grounded in examples/original_source/AEJ/TLBEntryFactory.h
// for the entry shape and constTBLPipeline.h for the default 512x8 geometry.
// `lookup` only ever takes the `parking_lot::RwLock` in read mode — its LRU
// timestamp bump is a per-way `AtomicU64` store instead, so concurrent
// lookups never serialize against each other. `insert`/`invalidate_*` take
// the write lock, via `sets_write`, which notes contention (for `auto_tune`)
// whenever it has to wait rather than acquiring immediately.

use crate::error::{CoreError, CoreResult, HostFault};
use crate::external::PageTableWalker;
use crate::fields::Permissions;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

pub const DEFAULT_SETS: usize = 512;
pub const DEFAULT_WAYS: usize = 8;
pub const PAGE_SIZE: u64 = 8 * 1024;

#[derive(Debug)]
pub struct TlbEntry {
    pub vpn: u64,
    pub ppn: u64,
    pub asn: u32,
    pub perms: Permissions,
    pub is_instruction: bool,
    pub valid: bool,
    /// Bumped by `lookup` under only a read lock on the owning `Set`, so it
    /// has to be an atomic rather than a plain field (§4.5, §5).
    pub last_access: AtomicU64,
}

impl TlbEntry {
    fn empty() -> Self {
        Self {
            vpn: 0,
            ppn: 0,
            asn: 0,
            perms: Permissions::default(),
            is_instruction: false,
            valid: false,
            last_access: AtomicU64::new(0),
        }
    }
}

impl Clone for TlbEntry {
    fn clone(&self) -> Self {
        Self {
            vpn: self.vpn,
            ppn: self.ppn,
            asn: self.asn,
            perms: self.perms,
            is_instruction: self.is_instruction,
            valid: self.valid,
            last_access: AtomicU64::new(self.last_access.load(Ordering::Relaxed)),
        }
    }
}

struct Set {
    ways: Vec<TlbEntry>,
}

impl Set {
    fn new(ways: usize) -> Self {
        Self { ways: vec![TlbEntry::empty(); ways] }
    }
}

pub struct TlbConfig {
    pub sets: usize,
    pub ways: usize,
    pub max_sets: usize,
    pub max_ways: usize,
}

impl Default for TlbConfig {
    fn default() -> Self {
        Self { sets: DEFAULT_SETS, ways: DEFAULT_WAYS, max_sets: 2048, max_ways: 16 }
    }
}

pub struct Tlb {
    sets: RwLock<Vec<Set>>,
    config: RwLock<TlbConfig>,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    contention: AtomicU64,
}

fn set_index(vpn: u64, num_sets: usize) -> usize {
    (vpn as usize) & (num_sets - 1)
}

impl Tlb {
    pub fn new(config: TlbConfig) -> Self {
        let sets = (0..config.sets).map(|_| Set::new(config.ways)).collect();
        Self {
            sets: RwLock::new(sets),
            config: RwLock::new(config),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            contention: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Write-locks `sets`, noting contention (for `auto_tune`) whenever the
    /// lock isn't free to take immediately. Used by every mutating path;
    /// `lookup` never calls this — it only ever reads.
    fn sets_write(&self) -> parking_lot::RwLockWriteGuard<'_, Vec<Set>> {
        match self.sets.try_write() {
            Some(guard) => guard,
            None => {
                self.note_contention();
                self.sets.write()
            }
        }
    }

    /// `lookup(VA, ASN, isKernel, isInstruction) -> (hit, PA, perms)`. Global
    /// entries match regardless of ASN. Takes the read lock only (§4.5:
    /// "lock-free for readers"); the LRU timestamp bump on a hit is an
    /// atomic store on the matched way, not a write-lock upgrade.
    pub fn lookup(
        &self,
        va: u64,
        asn: u32,
        is_kernel: bool,
        is_write: bool,
        is_instruction: bool,
    ) -> Option<(u64, Permissions)> {
        let vpn = va / PAGE_SIZE;
        let offset = va % PAGE_SIZE;
        let guard = self.sets.read();
        let idx = set_index(vpn, guard.len());
        let set = &guard[idx];
        let stamp = self.tick();
        for way in set.ways.iter() {
            if !way.valid || way.vpn != vpn || way.is_instruction != is_instruction {
                continue;
            }
            if !way.perms.global && way.asn != asn {
                continue;
            }
            if !way.perms.allows(is_write, is_instruction, is_kernel) {
                continue;
            }
            way.last_access.store(stamp, Ordering::Relaxed);
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(((way.ppn * PAGE_SIZE) + offset, way.perms));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// `insert(VA, PA, ASN, perms, flags)`: choose replacement way via LRU,
    /// evict, install. Dirty/referenced bits of an evicted entry are written
    /// back via `walker` before the slot is reused (§4.5 invariant).
    pub fn insert(
        &self,
        va: u64,
        pa: u64,
        asn: u32,
        perms: Permissions,
        is_instruction: bool,
        walker: &dyn PageTableWalker,
    ) -> CoreResult<()> {
        let vpn = va / PAGE_SIZE;
        let ppn = pa / PAGE_SIZE;
        let num_sets = self.sets.read().len();
        let idx = set_index(vpn, num_sets);
        let mut guard = self.sets_write();
        let set = &mut guard[idx];
        let stamp = self.tick();

        if let Some(existing) = set
            .ways
            .iter_mut()
            .find(|w| w.valid && w.vpn == vpn && w.asn == asn && w.is_instruction == is_instruction)
        {
            existing.ppn = ppn;
            existing.perms = perms;
            existing.last_access.store(stamp, Ordering::Relaxed);
            return Ok(());
        }

        let victim_pos = set
            .ways
            .iter()
            .enumerate()
            .min_by_key(|(_, w)| if w.valid { w.last_access.load(Ordering::Relaxed) } else { 0 })
            .map(|(i, _)| i)
            .unwrap_or(0);

        let victim_valid = set.ways[victim_pos].valid;
        let victim_dirty = set.ways[victim_pos].perms.dirty;
        let victim_vpn = set.ways[victim_pos].vpn;
        let victim_asn = set.ways[victim_pos].asn;
        let victim_is_instruction = set.ways[victim_pos].is_instruction;
        if victim_valid && victim_dirty {
            walker.walk(victim_vpn * PAGE_SIZE, victim_asn, true, true, victim_is_instruction).map_err(|_| {
                CoreError::Host(HostFault::TlbWalker {
                    va: victim_vpn * PAGE_SIZE,
                    reason: "writeback of dirty entry before eviction failed".into(),
                })
            })?;
        }

        set.ways[victim_pos] =
            TlbEntry { vpn, ppn, asn, perms, is_instruction, valid: true, last_access: AtomicU64::new(stamp) };
        Ok(())
    }

    pub fn invalidate_all(&self) {
        let mut guard = self.sets_write();
        for set in guard.iter_mut() {
            for way in set.ways.iter_mut() {
                way.valid = false;
            }
        }
    }

    pub fn invalidate_asn(&self, asn: u32) {
        let mut guard = self.sets_write();
        for set in guard.iter_mut() {
            for way in set.ways.iter_mut() {
                if way.valid && !way.perms.global && way.asn == asn {
                    way.valid = false;
                }
            }
        }
    }

    pub fn invalidate_address(&self, va: u64, asn: u32) {
        let vpn = va / PAGE_SIZE;
        let num_sets = self.sets.read().len();
        let idx = set_index(vpn, num_sets);
        let mut guard = self.sets_write();
        let set = &mut guard[idx];
        for way in set.ways.iter_mut() {
            if way.valid && way.vpn == vpn && (way.perms.global || way.asn == asn) {
                way.valid = false;
            }
        }
    }

    pub fn invalidate_instruction_entries(&self) {
        let mut guard = self.sets_write();
        for set in guard.iter_mut() {
            for way in set.ways.iter_mut() {
                if way.is_instruction {
                    way.valid = false;
                }
            }
        }
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let misses = self.misses.load(Ordering::Relaxed) as f64;
        if hits + misses == 0.0 {
            1.0
        } else {
            hits / (hits + misses)
        }
    }

    /// Periodically inspect hit rate and contention; expand sets/ways up to
    /// the configured maxima when the cache is thrashing (§4.5). Driven once
    /// per `CoreEngine::run_cycles` batch rather than on a wall-clock timer
    /// (see DESIGN.md).
    pub fn auto_tune(&self) {
        let contention = self.contention.swap(0, Ordering::Relaxed);
        let hit_rate = self.hit_rate();
        if hit_rate < 0.85 || contention > 1000 {
            let mut config = self.config.write();
            if config.ways < config.max_ways {
                config.ways *= 2;
                let ways = config.ways;
                drop(config);
                let mut sets = self.sets_write();
                for set in sets.iter_mut() {
                    while set.ways.len() < ways {
                        set.ways.push(TlbEntry::empty());
                    }
                }
            } else if config.sets < config.max_sets {
                let new_sets = config.sets * 2;
                let ways = config.ways;
                config.sets = new_sets;
                drop(config);
                let mut sets = self.sets_write();
                while sets.len() < new_sets {
                    sets.push(Set::new(ways));
                }
            }
        }
    }

    pub fn note_contention(&self) {
        self.contention.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a handle that resolves on a worker thread, for the JIT
    /// pipeline's overlapped fetch (§4.5). `self` must be shared via `Arc`
    /// since the lookup may outlive the calling stack frame.
    pub fn lookup_async(
        self: &Arc<Self>,
        va: u64,
        asn: u32,
        is_kernel: bool,
        is_write: bool,
        is_instruction: bool,
    ) -> PendingLookup {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let tlb = Arc::clone(self);
        thread::spawn(move || {
            let result = tlb.lookup(va, asn, is_kernel, is_write, is_instruction);
            let _ = tx.send(result);
        });
        PendingLookup { rx }
    }
}

pub struct PendingLookup {
    rx: crossbeam_channel::Receiver<Option<(u64, Permissions)>>,
}

impl PendingLookup {
    pub fn resolve(self) -> Option<(u64, Permissions)> {
        self.rx.recv().ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullWalker;
    impl PageTableWalker for NullWalker {
        fn walk(
            &self,
            va: u64,
            _asn: u32,
            _is_kernel: bool,
            _is_write: bool,
            _is_instruction: bool,
        ) -> CoreResult<crate::external::Translation> {
            Ok(crate::external::Translation { pa: va, perms: Permissions::rwx() })
        }
    }

    #[test]
    fn insert_then_lookup_returns_same_pa_and_perms() {
        let tlb = Tlb::new(TlbConfig::default());
        let walker = NullWalker;
        tlb.insert(0x1000, 0x9000, 7, Permissions::rwx(), false, &walker).unwrap();
        let (pa, perms) = tlb.lookup(0x1000, 7, true, false, false).unwrap();
        assert_eq!(pa, 0x9000);
        assert_eq!(perms, Permissions::rwx());
    }

    #[test]
    fn asn_mismatch_misses_even_if_va_matches() {
        let tlb = Tlb::new(TlbConfig::default());
        let walker = NullWalker;
        tlb.insert(0x2000, 0xa000, 7, Permissions::rwx(), false, &walker).unwrap();
        assert!(tlb.lookup(0x2000, 8, true, false, false).is_none());
    }

    #[test]
    fn invalidate_all_misses_for_every_entry() {
        let tlb = Tlb::new(TlbConfig::default());
        let walker = NullWalker;
        tlb.insert(0x3000, 0xb000, 1, Permissions::rwx(), false, &walker).unwrap();
        tlb.invalidate_all();
        assert!(tlb.lookup(0x3000, 1, true, false, false).is_none());
    }

    #[test]
    fn at_most_one_valid_entry_per_va_asn_kind() {
        let tlb = Tlb::new(TlbConfig::default());
        let walker = NullWalker;
        tlb.insert(0x4000, 0xc000, 2, Permissions::rwx(), false, &walker).unwrap();
        tlb.insert(0x4000, 0xd000, 2, Permissions::rwx(), false, &walker).unwrap();
        let (pa, _) = tlb.lookup(0x4000, 2, true, false, false).unwrap();
        assert_eq!(pa, 0xd000);
    }
}
