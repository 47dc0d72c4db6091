//! Live aggregate cache with idle eviction.
//!
//! Not thread-safe on purpose: a single owner (the dispatcher) mutates and
//! reads it, so no locking is involved.

use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, error, warn};

use crate::plane::PlaneAggregate;
use crate::store::PlaneStore;
use crate::types::*;

/// Map of aircraft key to live aggregate.
#[derive(Debug, Default)]
pub struct AggregateCache {
    planes: HashMap<Icao, PlaneAggregate>,
}

impl AggregateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.planes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.planes.is_empty()
    }

    pub fn contains(&self, icao: &Icao) -> bool {
        self.planes.contains_key(icao)
    }

    pub fn get(&self, icao: &Icao) -> Option<&PlaneAggregate> {
        self.planes.get(icao)
    }

    /// Cached aggregate for `icao`, loading it from `store` on a miss.
    ///
    /// A store miss or store error yields a fresh key-only aggregate; either
    /// way the result is inserted before it is returned.
    pub fn get_or_create(&mut self, icao: Icao, store: &dyn PlaneStore) -> &mut PlaneAggregate {
        self.planes.entry(icao).or_insert_with(|| match store.load(&icao) {
            Ok(Some(plane)) => {
                debug!(icao = %icao_to_string(&icao), "loaded aggregate from store");
                plane
            }
            Ok(None) => PlaneAggregate::new(icao),
            Err(e) => {
                warn!(icao = %icao_to_string(&icao), "store load failed, starting fresh: {e}");
                PlaneAggregate::new(icao)
            }
        })
    }

    /// Remove every aggregate idle since `now - window` and return them.
    ///
    /// `now = None` is the shutdown flush: the whole cache is drained.
    pub fn evict_due(&mut self, now: Option<DateTime<Utc>>, window: TimeDelta) -> Vec<PlaneAggregate> {
        let Some(now) = now else {
            return self.planes.drain().map(|(_, plane)| plane).collect();
        };

        // Only never-seen aggregates are due when the window reaches past the calendar.
        let cutoff = now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let due: Vec<Icao> = self
            .planes
            .iter()
            .filter(|(_, plane)| plane.is_idle_since(cutoff))
            .map(|(icao, _)| *icao)
            .collect();

        due.iter().filter_map(|icao| self.planes.remove(icao)).collect()
    }

    /// Drain the whole cache.
    pub fn drain_all(&mut self) -> Vec<PlaneAggregate> {
        self.evict_due(None, TimeDelta::zero())
    }

    /// Aggregates seen after `since` (all when `None`), most recent first.
    pub fn active_since(&self, since: Option<DateTime<Utc>>) -> Vec<&PlaneAggregate> {
        let mut active: Vec<_> = self.planes.values().filter(|p| p.seen_after(since)).collect();
        active.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        active
    }
}

/// Hand evicted aggregates to the store. Returns how many were written.
///
/// Aggregates that never received a report are dropped. A failed batch is
/// logged and discarded; it is never retried or put back in the cache.
pub fn persist(store: &dyn PlaneStore, staged: Vec<PlaneAggregate>) -> usize {
    let total = staged.len();
    let seen: Vec<PlaneAggregate> = staged.into_iter().filter(|p| p.last_seen.is_some()).collect();
    if seen.len() < total {
        debug!("dropping {} never-seen aggregates", total - seen.len());
    }
    if seen.is_empty() {
        return 0;
    }

    match store.save(&seen) {
        Ok(()) => {
            debug!("persisted {} aggregates", seen.len());
            seen.len()
        }
        Err(e) => {
            error!("failed to persist {} aggregates, discarding: {e}", seen.len());
            0
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap() + TimeDelta::seconds(secs)
    }

    fn seen_at(cache: &mut AggregateCache, store: &dyn PlaneStore, icao: Icao, at: i64) {
        let mut report = TrackingReport::new(icao, 7, t(at));
        report.altitude_ft = Some(1000 + at as i32);
        cache.get_or_create(icao, store).apply(&report);
    }

    #[test]
    fn test_get_or_create_inserts_fresh() {
        let store = MemoryStore::new();
        let mut cache = AggregateCache::new();
        let plane = cache.get_or_create([0xAB, 0xCD, 0xEF], &store);
        assert!(plane.last_seen.is_none());
        assert!(cache.contains(&[0xAB, 0xCD, 0xEF]));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_get_or_create_seeds_from_store() {
        let store = MemoryStore::new();
        let mut plane = PlaneAggregate::new([1, 2, 3]);
        plane.set_callsign("DLH4AB");
        plane.last_seen = Some(t(0));
        store.save(&[plane]).unwrap();

        let mut cache = AggregateCache::new();
        let cached = cache.get_or_create([1, 2, 3], &store);
        assert_eq!(cached.callsign.as_deref(), Some("DLH4AB"));
    }

    #[test]
    fn test_get_or_create_survives_store_error() {
        let store = MemoryStore::failing();
        let mut cache = AggregateCache::new();
        let plane = cache.get_or_create([1, 2, 3], &store);
        assert_eq!(plane.icao(), [1, 2, 3]);
        assert!(cache.contains(&[1, 2, 3]));
    }

    #[test]
    fn test_get_or_create_does_not_reload() {
        let store = MemoryStore::new();
        let mut cache = AggregateCache::new();
        seen_at(&mut cache, &store, [1, 2, 3], 0);
        seen_at(&mut cache, &store, [1, 2, 3], 5);
        let plane = cache.get(&[1, 2, 3]).unwrap();
        assert_eq!(plane.last_seen, Some(t(5)));
        assert_eq!(plane.history.len(), 2);
    }

    #[test]
    fn test_evict_due_exact_set() {
        let store = MemoryStore::new();
        let mut cache = AggregateCache::new();
        seen_at(&mut cache, &store, [1, 1, 1], 0);
        seen_at(&mut cache, &store, [2, 2, 2], 40);
        seen_at(&mut cache, &store, [3, 3, 3], 60);
        cache.get_or_create([4, 4, 4], &store);
        let untouched = cache.get(&[3, 3, 3]).unwrap().clone();

        // cutoff = 100 - 60 = 40: strictly older than 40 goes, plus the never-seen one.
        let evicted = cache.evict_due(Some(t(100)), TimeDelta::seconds(60));
        let mut keys: Vec<Icao> = evicted.iter().map(|p| p.icao()).collect();
        keys.sort();
        assert_eq!(keys, vec![[1, 1, 1], [4, 4, 4]]);

        assert_eq!(cache.len(), 2);
        assert!(cache.contains(&[2, 2, 2]));
        assert_eq!(cache.get(&[3, 3, 3]), Some(&untouched));
    }

    #[test]
    fn test_evict_due_huge_window() {
        let store = MemoryStore::new();
        let mut cache = AggregateCache::new();
        seen_at(&mut cache, &store, [1, 1, 1], 0);
        cache.get_or_create([2, 2, 2], &store);

        let window = TimeDelta::try_seconds(i64::MAX / 1000).unwrap();
        let evicted = cache.evict_due(Some(t(100)), window);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].icao(), [2, 2, 2]);
        assert!(cache.contains(&[1, 1, 1]));
    }

    #[test]
    fn test_evict_due_shutdown_drains_everything() {
        let store = MemoryStore::new();
        let mut cache = AggregateCache::new();
        seen_at(&mut cache, &store, [1, 1, 1], 0);
        seen_at(&mut cache, &store, [2, 2, 2], 1_000_000);

        let evicted = cache.evict_due(None, TimeDelta::seconds(60));
        assert_eq!(evicted.len(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_active_since() {
        let store = MemoryStore::new();
        let mut cache = AggregateCache::new();
        seen_at(&mut cache, &store, [1, 1, 1], 0);
        seen_at(&mut cache, &store, [2, 2, 2], 50);
        cache.get_or_create([3, 3, 3], &store);

        let all = cache.active_since(None);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].icao(), [2, 2, 2]);

        let recent = cache.active_since(Some(t(10)));
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].icao(), [2, 2, 2]);
    }

    #[test]
    fn test_persist_skips_never_seen() {
        let store = MemoryStore::new();
        let mut cache = AggregateCache::new();
        seen_at(&mut cache, &store, [1, 1, 1], 0);
        cache.get_or_create([2, 2, 2], &store);

        assert_eq!(persist(&store, cache.drain_all()), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_persist_failure_discards() {
        let store = MemoryStore::failing();
        let mut cache = AggregateCache::new();
        seen_at(&mut cache, &store, [1, 1, 1], 0);

        assert_eq!(persist(&store, cache.drain_all()), 0);
        assert!(cache.is_empty());
    }
}
