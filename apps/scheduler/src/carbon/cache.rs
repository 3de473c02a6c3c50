use crate::carbon::CarbonRecord;
use crate::clock::Clock;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration as StdDuration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// age <= TTL
    Fresh,
    /// TTL < age <= MaxAge; callers may opt in to serve-stale.
    Stale,
    Miss,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    record: CarbonRecord,
    inserted_at: DateTime<Utc>,
}

/// Region -> record cache with two horizons: entries are fresh up to `ttl`
/// and usable up to `max_age`; beyond that they are dropped. The cache never
/// fetches; the data source hydrates it.
pub struct CarbonCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
    max_age: Duration,
    clock: Arc<dyn Clock>,
}

impl CarbonCache {
    pub fn new(ttl: StdDuration, max_age: StdDuration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::seconds(300)),
            max_age: Duration::from_std(max_age).unwrap_or_else(|_| Duration::seconds(1800)),
            clock,
        }
    }

    pub fn get(&self, region: &str) -> (Option<CarbonRecord>, Freshness) {
        let now = self.clock.now();
        let expired = {
            let entries = self.entries.read().expect("carbon cache poisoned");
            match entries.get(region) {
                None => return (None, Freshness::Miss),
                Some(entry) => {
                    let age = now - entry.inserted_at;
                    if age <= self.ttl {
                        return (Some(entry.record.clone()), Freshness::Fresh);
                    }
                    if age <= self.max_age {
                        return (Some(entry.record.clone()), Freshness::Stale);
                    }
                    true
                }
            }
        };
        if expired {
            let mut entries = self.entries.write().expect("carbon cache poisoned");
            if let Some(entry) = entries.get(region) {
                if now - entry.inserted_at > self.max_age {
                    entries.remove(region);
                }
            }
        }
        (None, Freshness::Miss)
    }

    pub fn set(&self, record: CarbonRecord) {
        let mut entries = self.entries.write().expect("carbon cache poisoned");
        entries.insert(
            record.region.clone(),
            CacheEntry {
                record,
                inserted_at: self.clock.now(),
            },
        );
    }

    pub fn regions(&self) -> Vec<String> {
        let entries = self.entries.read().expect("carbon cache poisoned");
        entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("carbon cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops all entries. The cleanup ticker is stopped by the shared
    /// cancellation token at shutdown.
    pub fn close(&self) {
        self.entries.write().expect("carbon cache poisoned").clear();
    }

    fn evict_expired(&self) {
        let now = self.clock.now();
        let victims: Vec<String> = {
            let entries = self.entries.read().expect("carbon cache poisoned");
            entries
                .iter()
                .filter(|(_, entry)| now - entry.inserted_at > self.max_age)
                .map(|(region, _)| region.clone())
                .collect()
        };
        if victims.is_empty() {
            return;
        }
        let mut entries = self.entries.write().expect("carbon cache poisoned");
        for region in &victims {
            if let Some(entry) = entries.get(region) {
                if now - entry.inserted_at > self.max_age {
                    entries.remove(region);
                }
            }
        }
        debug!(evicted = victims.len(), "carbon cache cleanup");
    }
}

/// Periodic eviction of entries past MaxAge; ends with the shared
/// cancellation token, which is the cache's close().
pub struct CacheCleanupService {
    cache: Arc<CarbonCache>,
    interval: StdDuration,
}

impl CacheCleanupService {
    pub fn new(cache: Arc<CarbonCache>, interval: StdDuration) -> Self {
        Self { cache, interval }
    }

    pub fn start(self, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => self.cache.evict_expired(),
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn record(region: &str, intensity: f64, at: DateTime<Utc>) -> CarbonRecord {
        CarbonRecord {
            region: region.to_string(),
            intensity,
            observed_at: at,
        }
    }

    fn cache_with_clock() -> (CarbonCache, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap());
        let cache = CarbonCache::new(
            StdDuration::from_secs(300),
            StdDuration::from_secs(1800),
            Arc::new(clock.clone()),
        );
        (cache, clock)
    }

    #[test]
    fn fresh_until_ttl() {
        let (cache, clock) = cache_with_clock();
        cache.set(record("DE", 250.0, clock.now()));

        let (found, freshness) = cache.get("DE");
        assert_eq!(freshness, Freshness::Fresh);
        assert_eq!(found.unwrap().intensity, 250.0);

        clock.advance(Duration::seconds(300));
        let (_, freshness) = cache.get("DE");
        assert_eq!(freshness, Freshness::Fresh);
    }

    #[test]
    fn stale_between_ttl_and_max_age() {
        let (cache, clock) = cache_with_clock();
        cache.set(record("DE", 250.0, clock.now()));

        clock.advance(Duration::seconds(301));
        let (found, freshness) = cache.get("DE");
        assert_eq!(freshness, Freshness::Stale);
        assert!(found.is_some());
    }

    #[test]
    fn miss_and_discard_past_max_age() {
        let (cache, clock) = cache_with_clock();
        cache.set(record("DE", 250.0, clock.now()));

        clock.advance(Duration::seconds(1801));
        let (found, freshness) = cache.get("DE");
        assert_eq!(freshness, Freshness::Miss);
        assert!(found.is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn unknown_region_is_miss() {
        let (cache, _clock) = cache_with_clock();
        let (found, freshness) = cache.get("FR");
        assert_eq!(freshness, Freshness::Miss);
        assert!(found.is_none());
    }

    #[test]
    fn cleanup_evicts_only_expired() {
        let (cache, clock) = cache_with_clock();
        cache.set(record("DE", 250.0, clock.now()));
        clock.advance(Duration::seconds(1700));
        cache.set(record("FR", 40.0, clock.now()));
        clock.advance(Duration::seconds(200));

        cache.evict_expired();
        let mut regions = cache.regions();
        regions.sort();
        assert_eq!(regions, vec!["FR".to_string()]);
    }
}
