// Translation cache (§4.9). A bounded PC -> CompiledBlock map, LRU eviction
// by (access count, last-access time) per
// examples/original_source/AEJ/pipeline_jitcompiler.h's `alphaTranslationCache`
// (`CacheEntry{lastAccessTime, accessCount}`, `evictLRU`, `invalidateRange`),
// with range invalidation for self-modifying code: a store through the
// ordinary memory executor that lands inside `[start, start+len)` of a
// cached block must evict it before the next fetch of that PC, or the
// interpreter would run stale compiled code.

use super::compiler::CompiledBlock;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

struct Entry {
    block: CompiledBlock,
    /// Byte span `[start_pc, end_pc)` the block covers, for self-modifying
    /// code invalidation.
    end_pc: u64,
    access_count: u64,
    last_access: u64,
}

pub struct TranslationCache {
    capacity: usize,
    entries: RwLock<HashMap<u64, Entry>>,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

impl TranslationCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: RwLock::new(HashMap::new()),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    pub fn lookup(&self, pc: u64) -> Option<CompiledBlock> {
        let stamp = self.tick();
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(&pc) {
            entry.access_count += 1;
            entry.last_access = stamp;
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry.block.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn insert(&self, start_pc: u64, end_pc: u64, block: CompiledBlock) {
        let stamp = self.tick();
        let mut entries = self.entries.write();
        if entries.len() >= self.capacity && !entries.contains_key(&start_pc) {
            if let Some((&victim, _)) = entries.iter().min_by_key(|(_, e)| (e.access_count, e.last_access)) {
                entries.remove(&victim);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        entries.insert(start_pc, Entry { block, end_pc, access_count: 0, last_access: stamp });
    }

    /// Evicts every cached block unconditionally. IMB (§4.8) has no address
    /// range to work from, so it invalidates the whole translation cache the
    /// same conservative way it invalidates the whole instruction TLB.
    pub fn invalidate_all(&self) {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.clear();
        self.invalidations.fetch_add(before as u64, Ordering::Relaxed);
    }

    /// Evicts every cached block whose byte span overlaps `[start, start+len)`
    /// (§4.9 self-modifying-code invalidation).
    pub fn invalidate_range(&self, start: u64, len: u64) {
        let end = start + len;
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|&pc, entry| entry.end_pc <= start || pc >= end);
        self.invalidations.fetch_add((before - entries.len()) as u64, Ordering::Relaxed);
    }

    pub fn stats(&self) -> TranslationCacheStats {
        TranslationCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
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

    /// True once the cache is filled close to `capacity`, the other half of
    /// `adjustThresholds`'s `hitRate < 50 && compiledBlocks > 100` capacity
    /// gate (§5): a poor hit rate while there's still headroom just means
    /// the working set hasn't been traced yet, not that compiling earlier
    /// would help.
    pub fn is_near_capacity(&self) -> bool {
        let entries = self.entries.read().len() as f64;
        entries >= self.capacity as f64 * 0.9
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TranslationCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_lookup_hits() {
        let cache = TranslationCache::new(4);
        cache.insert(0x400, 0x410, CompiledBlock::Fallback);
        assert!(cache.lookup(0x400).is_some());
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn eviction_prefers_least_recently_used_when_full() {
        let cache = TranslationCache::new(2);
        cache.insert(0x100, 0x110, CompiledBlock::Fallback);
        cache.insert(0x200, 0x210, CompiledBlock::Fallback);
        cache.lookup(0x200);
        cache.insert(0x300, 0x310, CompiledBlock::Fallback);
        assert!(cache.lookup(0x100).is_none());
        assert!(cache.lookup(0x200).is_some());
    }

    #[test]
    fn store_inside_a_cached_block_invalidates_it() {
        let cache = TranslationCache::new(4);
        cache.insert(0x400, 0x420, CompiledBlock::Fallback);
        cache.invalidate_range(0x408, 4);
        assert!(cache.lookup(0x400).is_none());
        assert_eq!(cache.stats().invalidations, 1);
    }
}
