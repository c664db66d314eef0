use std::{
    num::NonZeroUsize,
    sync::{Arc, Mutex},
};

use lru::LruCache;

use crate::{frame::Frame, time::Ticks};

/// Bounded frame cache keyed by quantized timestamp with LRU eviction.
///
/// Quantizing the key makes "duplicate within tolerance" an O(1) key
/// collision and keeps the per-lookup scan bounded: a lookup only visits
/// the bins overlapping `[target − tolerance, target + tolerance]`.
/// All mutation is serialized under one lock; promotion and insertion are
/// O(1) inside it.
pub struct FrameCache {
    quantum: Ticks,
    entries: Mutex<LruCache<i64, Arc<Frame>>>,
}

impl FrameCache {
    pub fn new(quantum: Ticks, max_size: usize) -> FrameCache {
        assert!(quantum > Ticks::ZERO, "quantum must be positive");
        let max_size = NonZeroUsize::new(max_size).expect("cache size must be positive");
        FrameCache {
            quantum,
            entries: Mutex::new(LruCache::new(max_size)),
        }
    }

    pub fn quantum(&self) -> Ticks {
        self.quantum
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Best entry within `tolerance` of `target`, by smallest
    /// `|frame.time − target|`; on a tie the bin scanned first wins. A hit
    /// promotes the entry to most-recently-used. The cache keeps its
    /// reference; the caller shares ownership.
    pub fn try_get(&self, target: Ticks, tolerance: Ticks) -> Option<Arc<Frame>> {
        let mut entries = self.entries.lock().unwrap();
        let best = self.scan(&entries, target, tolerance)?;
        entries.get(&best).cloned()
    }

    /// Same scan as [`try_get`](Self::try_get), without promotion.
    pub fn contains(&self, target: Ticks, tolerance: Ticks) -> bool {
        let entries = self.entries.lock().unwrap();
        self.scan(&entries, target, tolerance).is_some()
    }

    /// Inserts as most-recently-used, evicting the least-recently-used
    /// entry when full. Returns false when the quantized key is already
    /// present; the caller keeps (and should drop) its duplicate.
    pub fn add(&self, frame: Arc<Frame>) -> bool {
        let key = frame.time().quantize(self.quantum).get();
        let mut entries = self.entries.lock().unwrap();
        if entries.contains(&key) {
            return false;
        }
        entries.push(key, frame);
        true
    }

    /// Drops every entry; their buffers drain back to the pool.
    pub fn dispose(&self) {
        self.entries.lock().unwrap().clear();
    }

    /// Key of the best matching bin, or None. Scans at most
    /// `⌈2·tolerance / quantum⌉ + 1` bins.
    fn scan(
        &self,
        entries: &LruCache<i64, Arc<Frame>>,
        target: Ticks,
        tolerance: Ticks,
    ) -> Option<i64> {
        debug_assert!(tolerance >= Ticks::ZERO);
        let q = self.quantum.get();
        let lo_bin = target.saturating_sub(tolerance).get().div_euclid(q);
        let hi_bin = target.saturating_add(tolerance).get().div_euclid(q);
        let mut best: Option<(i64, Ticks)> = None;
        for bin in lo_bin..=hi_bin {
            let key = bin.saturating_mul(q);
            if let Some(frame) = entries.peek(&key) {
                let distance = frame.time().abs_diff(target);
                if distance <= tolerance && best.map_or(true, |(_, d)| distance < d) {
                    best = Some((key, distance));
                }
            }
        }
        best.map(|(key, _)| key)
    }
}

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, sync::Arc};

    use super::*;
    use crate::pool::BitmapPool;

    fn test_frame(pool: &BitmapPool, millis: i64) -> Arc<Frame> {
        let path = Arc::new(PathBuf::from("test.mp4"));
        Arc::new(Frame::new(path, Ticks::from_millis(millis), pool.rent()))
    }

    fn cache_with_pool(quantum_ms: i64, max_size: usize) -> (FrameCache, BitmapPool) {
        let cache = FrameCache::new(Ticks::from_millis(quantum_ms), max_size);
        let pool = BitmapPool::new(2, 2, max_size + 4);
        (cache, pool)
    }

    #[test]
    fn test_hit_within_tolerance_after_seed() {
        let (cache, pool) = cache_with_pool(10, 4);
        assert!(cache.add(test_frame(&pool, 100)));

        let hit = cache.try_get(Ticks::from_millis(101), Ticks::from_millis(5));
        assert_eq!(hit.unwrap().time(), Ticks::from_millis(100));
        assert!(cache
            .try_get(Ticks::from_millis(120), Ticks::from_millis(5))
            .is_none());
    }

    #[test]
    fn test_best_match_wins() {
        let (cache, pool) = cache_with_pool(1, 8);
        for millis in [100, 105, 110] {
            assert!(cache.add(test_frame(&pool, millis)));
        }

        let hit = cache.try_get(Ticks::from_millis(104), Ticks::from_millis(5));
        assert_eq!(hit.unwrap().time(), Ticks::from_millis(105));
    }

    #[test]
    fn test_lru_eviction_respects_promotion() {
        let (cache, pool) = cache_with_pool(10, 2);
        assert!(cache.add(test_frame(&pool, 0)));
        assert!(cache.add(test_frame(&pool, 10)));
        // Touch 0 so 10 becomes the eviction candidate.
        assert!(cache.try_get(Ticks::ZERO, Ticks::from_millis(1)).is_some());
        assert!(cache.add(test_frame(&pool, 20)));

        assert!(cache.try_get(Ticks::ZERO, Ticks::from_millis(1)).is_some());
        assert!(cache
            .try_get(Ticks::from_millis(20), Ticks::from_millis(1))
            .is_some());
        assert!(cache
            .try_get(Ticks::from_millis(10), Ticks::from_millis(1))
            .is_none());
    }

    #[test]
    fn test_duplicate_add_keeps_first() {
        let (cache, pool) = cache_with_pool(10, 4);
        let first = test_frame(&pool, 100);
        let second = test_frame(&pool, 102); // same 10 ms bin
        assert!(cache.add(first.clone()));
        assert!(!cache.add(second));

        let hit = cache
            .try_get(Ticks::from_millis(100), Ticks::from_millis(5))
            .unwrap();
        assert!(Arc::ptr_eq(&hit, &first));
    }

    #[test]
    fn test_size_stays_bounded() {
        let (cache, pool) = cache_with_pool(10, 8);
        for i in 0..100 {
            assert!(cache.add(test_frame(&pool, i * 10)));
            assert!(cache.len() <= 8);
        }
        // With no lookups in between, exactly the most recent 8 remain.
        for i in 92..100 {
            assert!(cache.contains(Ticks::from_millis(i * 10), Ticks::from_millis(1)));
        }
        assert!(!cache.contains(Ticks::from_millis(91 * 10), Ticks::from_millis(1)));
    }

    #[test]
    fn test_returned_frame_within_tolerance_and_closest() {
        let (cache, pool) = cache_with_pool(10, 32);
        for i in 0..20 {
            assert!(cache.add(test_frame(&pool, i * 25)));
        }
        for target_ms in (0..500).step_by(7) {
            let target = Ticks::from_millis(target_ms);
            let tolerance = Ticks::from_millis(12);
            if let Some(frame) = cache.try_get(target, tolerance) {
                assert!(frame.time().abs_diff(target) <= tolerance);
                // No cached entry is strictly closer.
                let best = (0..20)
                    .map(|i| Ticks::from_millis(i * 25).abs_diff(target))
                    .min()
                    .unwrap();
                assert_eq!(frame.time().abs_diff(target), best);
            }
        }
    }

    #[test]
    fn test_eviction_returns_buffers_to_pool() {
        let (cache, pool) = cache_with_pool(10, 2);
        for i in 0..4 {
            assert!(cache.add(test_frame(&pool, i * 10)));
        }
        // Two evictions happened, two buffers went back.
        assert_eq!(pool.idle(), 2);
        cache.dispose();
        assert_eq!(pool.idle(), 4);
        assert!(cache.is_empty());
    }
}
