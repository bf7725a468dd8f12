// Multi-level cache hierarchy (§4.6, layer L3). Each level is a unified
// set-associative cache parameterized by (numSets, associativity, lineSize),
// grounded in examples/original_source/AEJ/AlphaInstructionCache.cpp for the
// fill/evict bookkeeping and aec/constants for the MESI transition table.
// Per-set locking (`parking_lot::Mutex`) gives the L3 its many-readers/
// many-writers concurrency per §5.

use crate::external::PhysicalMemory;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineState {
    Invalid,
    Shared,
    Exclusive,
    Modified,
}

#[derive(Debug, Clone)]
pub struct CacheLine {
    pub tag: u64,
    pub base: u64,
    pub data: Vec<u8>,
    pub state: LineState,
    pub last_access: u64,
    pub dirty: bool,
}

impl CacheLine {
    fn empty(line_size: usize) -> Self {
        Self { tag: 0, base: 0, data: vec![0; line_size], state: LineState::Invalid, last_access: 0, dirty: false }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CacheGeometry {
    pub num_sets: usize,
    pub associativity: usize,
    pub line_size: usize,
}

impl Default for CacheGeometry {
    fn default() -> Self {
        Self { num_sets: 256, associativity: 4, line_size: 64 }
    }
}

/// Coherency event broadcast by a cache level to its peers, consumed by the
/// SMP manager (§9 "re-architect signals/slots as explicit event channels").
#[derive(Debug, Clone)]
pub enum CoherencyEvent {
    Invalidate { pa: u64 },
    Writeback { pa: u64, data: Vec<u8> },
}

struct Set {
    lines: Vec<CacheLine>,
}

pub struct CacheLevel {
    name: &'static str,
    geometry: CacheGeometry,
    sets: Vec<Mutex<Set>>,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    coherency_tx: Sender<CoherencyEvent>,
    coherency_rx: Receiver<CoherencyEvent>,
}

fn line_index(pa: u64, geometry: &CacheGeometry) -> (usize, u64) {
    let line = pa / geometry.line_size as u64;
    let set = (line as usize) & (geometry.num_sets - 1);
    (set, line)
}

impl CacheLevel {
    pub fn new(name: &'static str, geometry: CacheGeometry) -> Self {
        let sets = (0..geometry.num_sets)
            .map(|_| {
                Mutex::new(Set {
                    lines: (0..geometry.associativity).map(|_| CacheLine::empty(geometry.line_size)).collect(),
                })
            })
            .collect();
        let (coherency_tx, coherency_rx) = crossbeam_channel::bounded(256);
        Self { name, geometry, sets, clock: AtomicU64::new(0), hits: AtomicU64::new(0), misses: AtomicU64::new(0), coherency_tx, coherency_rx }
    }

    pub fn coherency_events(&self) -> Receiver<CoherencyEvent> {
        self.coherency_rx.clone()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// `read(PA, len) -> bytes`: probes this level; on miss the caller fills
    /// from the next level down and calls `fill`.
    pub fn probe(&self, pa: u64, len: usize) -> Option<Vec<u8>> {
        let (set_idx, line) = line_index(pa, &self.geometry);
        let mut set = self.sets[set_idx].lock();
        let stamp = self.tick();
        let offset = (pa % self.geometry.line_size as u64) as usize;
        for l in set.lines.iter_mut() {
            if l.state != LineState::Invalid && l.tag == line {
                l.last_access = stamp;
                if offset + len <= l.data.len() {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(l.data[offset..offset + len].to_vec());
                }
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Fills a line from a lower level or physical memory, choosing an LRU
    /// victim. Broadcasts a writeback event for an evicted dirty MODIFIED
    /// line before reuse.
    pub fn fill(&self, pa: u64, data: &[u8], state: LineState) {
        let (set_idx, line) = line_index(pa, &self.geometry);
        let mut set = self.sets[set_idx].lock();
        let stamp = self.tick();
        let line_size = self.geometry.line_size;
        let base = line * line_size as u64;

        if let Some(existing) = set.lines.iter_mut().find(|l| l.state != LineState::Invalid && l.tag == line) {
            existing.data = data.to_vec();
            existing.state = state;
            existing.last_access = stamp;
            return;
        }

        let victim_pos = set
            .lines
            .iter()
            .enumerate()
            .min_by_key(|(_, l)| if l.state == LineState::Invalid { 0 } else { l.last_access + 1 })
            .map(|(i, _)| i)
            .unwrap_or(0);

        let victim = set.lines[victim_pos].clone();
        if victim.state == LineState::Modified && victim.dirty {
            let _ = self.coherency_tx.try_send(CoherencyEvent::Writeback { pa: victim.base, data: victim.data.clone() });
        }

        set.lines[victim_pos] = CacheLine { tag: line, base, data: data.to_vec(), state, last_access: stamp, dirty: false };
    }

    /// `write(PA, bytes)`: write-allocate. Transitions the line to MODIFIED,
    /// broadcasting INVALIDATE to peers holding SHARED copies (§4.6).
    pub fn write_allocate(&self, pa: u64, bytes: &[u8]) {
        let (set_idx, line) = line_index(pa, &self.geometry);
        let mut set = self.sets[set_idx].lock();
        let stamp = self.tick();
        let offset = (pa % self.geometry.line_size as u64) as usize;
        let line_size = self.geometry.line_size;
        let base = line * line_size as u64;

        let existing = set.lines.iter_mut().find(|l| l.state != LineState::Invalid && l.tag == line);
        match existing {
            Some(l) => {
                if matches!(l.state, LineState::Shared) {
                    let _ = self.coherency_tx.try_send(CoherencyEvent::Invalidate { pa: base });
                }
                l.data[offset..offset + bytes.len()].copy_from_slice(bytes);
                l.state = LineState::Modified;
                l.dirty = true;
                l.last_access = stamp;
            }
            None => {
                let mut data = vec![0u8; line_size];
                data[offset..offset + bytes.len()].copy_from_slice(bytes);
                self.fill(base, &data, LineState::Modified);
                if let Some(l) = set.lines.iter_mut().find(|l| l.tag == line && l.state != LineState::Invalid) {
                    l.dirty = true;
                }
                let _ = self.coherency_tx.try_send(CoherencyEvent::Invalidate { pa: base });
            }
        }
    }

    /// Peer notified another CPU wrote a line this cache holds SHARED or
    /// MODIFIED: transition to INVALID (writing back first if MODIFIED).
    pub fn observe_peer_write(&self, pa: u64) -> Option<Vec<u8>> {
        let (set_idx, line) = line_index(pa, &self.geometry);
        let mut set = self.sets[set_idx].lock();
        for l in set.lines.iter_mut() {
            if l.tag == line && l.state != LineState::Invalid {
                let writeback = if l.state == LineState::Modified && l.dirty { Some(l.data.clone()) } else { None };
                l.state = LineState::Invalid;
                l.dirty = false;
                return writeback;
            }
        }
        None
    }

    pub fn invalidate_line(&self, pa: u64) {
        let (set_idx, line) = line_index(pa, &self.geometry);
        let mut set = self.sets[set_idx].lock();
        for l in set.lines.iter_mut() {
            if l.tag == line {
                l.state = LineState::Invalid;
            }
        }
    }

    /// Invalidates every line in this level, ignoring dirty state: used for
    /// IMB, which has no target address and must not trust any stale fetch.
    pub fn invalidate_all(&self) {
        for set in self.sets.iter() {
            let mut set = set.lock();
            for l in set.lines.iter_mut() {
                l.state = LineState::Invalid;
            }
        }
    }

    /// Drain all dirty lines to memory and transition to INVALID.
    pub fn flush(&self, memory: &dyn PhysicalMemory) {
        for set in self.sets.iter() {
            let mut set = set.lock();
            for l in set.lines.iter_mut() {
                if l.state != LineState::Invalid && l.dirty {
                    let _ = memory.write(l.base, &l.data);
                }
                l.state = LineState::Invalid;
                l.dirty = false;
            }
        }
    }

    pub fn stats(&self) -> (u64, u64) {
        (self.hits.load(Ordering::Relaxed), self.misses.load(Ordering::Relaxed))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Per-CPU L1-I (read-mostly), L1-D, L2, all backed by a shared L3 which is
/// the coherency authority (§4.6).
pub struct CacheHierarchy {
    pub l1i: CacheLevel,
    pub l1d: CacheLevel,
    pub l2: CacheLevel,
}

impl CacheHierarchy {
    pub fn new(l1i: CacheGeometry, l1d: CacheGeometry, l2: CacheGeometry) -> Self {
        Self {
            l1i: CacheLevel::new("L1-I", l1i),
            l1d: CacheLevel::new("L1-D", l1d),
            l2: CacheLevel::new("L2", l2),
        }
    }

    /// `read(PA, len) -> bytes`: walk L1 -> L2 -> L3 -> physical memory;
    /// each level fills upwards on miss.
    pub fn read(
        &self,
        pa: u64,
        len: usize,
        l3: &CacheLevel,
        memory: &dyn PhysicalMemory,
        instruction_fetch: bool,
    ) -> crate::error::CoreResult<Vec<u8>> {
        let l1 = if instruction_fetch { &self.l1i } else { &self.l1d };
        if let Some(bytes) = l1.probe(pa, len) {
            return Ok(bytes);
        }
        if let Some(bytes) = self.l2.probe(pa, len) {
            l1.fill(pa, &bytes, LineState::Shared);
            return Ok(bytes);
        }
        if let Some(bytes) = l3.probe(pa, len) {
            self.l2.fill(pa, &bytes, LineState::Shared);
            l1.fill(pa, &bytes, LineState::Shared);
            return Ok(bytes);
        }
        let bytes = memory.read(pa, self.l2_line_len(len))?;
        l3.fill(pa, &bytes, LineState::Shared);
        self.l2.fill(pa, &bytes, LineState::Shared);
        l1.fill(pa, &bytes, LineState::Shared);
        Ok(bytes[..len].to_vec())
    }

    fn l2_line_len(&self, requested: usize) -> usize {
        requested.max(self.l2.geometry.line_size)
    }

    pub fn write(&self, pa: u64, bytes: &[u8], l3: &CacheLevel) {
        self.l1d.write_allocate(pa, bytes);
        self.l2.write_allocate(pa, bytes);
        l3.write_allocate(pa, bytes);
    }

    pub fn invalidate_line(&self, pa: u64, l3: &CacheLevel) {
        self.l1i.invalidate_line(pa);
        self.l1d.invalidate_line(pa);
        self.l2.invalidate_line(pa);
        l3.invalidate_line(pa);
    }

    /// Drains pending INVALIDATE coherency events from the private levels
    /// (§4.6/§9 "cache emits coherency events onto a bounded channel
    /// consumed by the SMP manager"). L3 is shared and already holds the
    /// writer's data, so only L1d/L2 — the levels that can hold a now-stale
    /// SHARED copy on a peer CPU — are drained. WRITEBACK events are pure
    /// internal eviction bookkeeping and aren't forwarded. L1d and L2 each
    /// track SHARED/MODIFIED independently, so a single store can yield the
    /// same `pa` twice here; a peer invalidating the same line twice is
    /// harmless.
    pub fn drain_invalidations(&self) -> Vec<u64> {
        let mut pas = Vec::new();
        let l1d_rx = self.l1d.coherency_events();
        while let Ok(event) = l1d_rx.try_recv() {
            if let CoherencyEvent::Invalidate { pa } = event {
                pas.push(pa);
            }
        }
        let l2_rx = self.l2.coherency_events();
        while let Ok(event) = l2_rx.try_recv() {
            if let CoherencyEvent::Invalidate { pa } = event {
                pas.push(pa);
            }
        }
        pas
    }

    /// Applies a peer's write to this CPU's own private levels (§4.6): any
    /// SHARED or MODIFIED copy of `pa` here is stale once another CPU has
    /// written it, regardless of what this CPU's own L3 view says.
    pub fn observe_peer_invalidate(&self, pa: u64) {
        self.l1i.observe_peer_write(pa);
        self.l1d.observe_peer_write(pa);
        self.l2.observe_peer_write(pa);
    }

    pub fn flush(&self, memory: &dyn PhysicalMemory, l3: &CacheLevel) {
        self.l1d.flush(memory);
        self.l2.flush(memory);
        l3.flush(memory);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeMemory {
        data: Mutex<Vec<u8>>,
    }

    impl PhysicalMemory for FakeMemory {
        fn read(&self, pa: u64, len: usize) -> crate::error::CoreResult<Vec<u8>> {
            let data = self.data.lock();
            Ok(data[pa as usize..pa as usize + len].to_vec())
        }
        fn write(&self, pa: u64, bytes: &[u8]) -> crate::error::CoreResult<()> {
            let mut data = self.data.lock();
            data[pa as usize..pa as usize + bytes.len()].copy_from_slice(bytes);
            Ok(())
        }
    }

    #[test]
    fn write_allocate_on_a_shared_line_emits_an_invalidate_event() {
        let hierarchy = CacheHierarchy::new(CacheGeometry::default(), CacheGeometry::default(), CacheGeometry::default());
        let l3 = CacheLevel::new("L3", CacheGeometry::default());
        let memory = FakeMemory { data: Mutex::new(vec![0u8; 4096]) };

        // Cold read fills L1d/L2/L3 as SHARED; a plain fill never invalidates.
        hierarchy.read(0x300, 4, &l3, &memory, false).unwrap();
        assert!(hierarchy.drain_invalidations().is_empty());

        // Writing the now-SHARED line transitions it to MODIFIED locally and
        // reports it as stale for any peer holding a SHARED copy. Both L1d
        // and L2 independently held the line SHARED, so each emits its own
        // event; `drain_invalidations` pools both levels' channels.
        hierarchy.write(0x300, &[9, 9, 9, 9], &l3);
        assert_eq!(hierarchy.drain_invalidations(), vec![0x300, 0x300]);
    }

    #[test]
    fn observe_peer_invalidate_drops_a_peers_shared_copy() {
        let peer = CacheHierarchy::new(CacheGeometry::default(), CacheGeometry::default(), CacheGeometry::default());
        let l3 = CacheLevel::new("L3", CacheGeometry::default());
        let memory = FakeMemory { data: Mutex::new(vec![0u8; 4096]) };

        peer.read(0x300, 4, &l3, &memory, false).unwrap();
        assert!(peer.l1d.probe(0x300, 4).is_some());

        peer.observe_peer_invalidate(0x300);
        assert!(peer.l1d.probe(0x300, 4).is_none());
    }

    #[test]
    fn flush_then_read_reaches_physical_memory() {
        let hierarchy = CacheHierarchy::new(CacheGeometry::default(), CacheGeometry::default(), CacheGeometry::default());
        let l3 = CacheLevel::new("L3", CacheGeometry::default());
        let memory = FakeMemory { data: Mutex::new(vec![0u8; 4096]) };
        hierarchy.write(0x100, &[0xaa, 0xbb], &l3);
        hierarchy.flush(&memory, &l3);
        let bytes = memory.read(0x100, 2).unwrap();
        assert_eq!(bytes, vec![0xaa, 0xbb]);
    }

    #[test]
    fn read_fills_upward_on_miss() {
        let hierarchy = CacheHierarchy::new(CacheGeometry::default(), CacheGeometry::default(), CacheGeometry::default());
        let l3 = CacheLevel::new("L3", CacheGeometry::default());
        let memory = FakeMemory { data: Mutex::new(vec![0u8; 4096]) };
        memory.write(0x200, &[1, 2, 3, 4]).unwrap();
        let bytes = hierarchy.read(0x200, 4, &l3, &memory, false).unwrap();
        assert_eq!(bytes, vec![1, 2, 3, 4]);
        assert!(hierarchy.l1d.probe(0x200, 4).is_some());
    }
}
