use crate::clock::Clock;
use crate::telemetry::downsample::DownsamplingStrategy;
use crate::telemetry::{PodIdentity, PodMetricsHistory, PodMetricsRecord, PodMetricsStorage};
use chrono::Duration;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration as StdDuration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Shrink below the cap with room to spare so a busy pod does not
/// re-trigger the downsampler on every append.
const SHRINK_FACTOR: f64 = 0.8;

/// In-memory pod histories. Appends are monotonic in time, completed
/// histories are frozen, and every history stays within `max_records`.
pub struct InMemoryStore {
    histories: RwLock<HashMap<String, PodMetricsHistory>>,
    max_records: usize,
    retention: Duration,
    downsampler: Box<dyn DownsamplingStrategy>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    pub fn new(
        max_records: usize,
        retention: StdDuration,
        downsampler: Box<dyn DownsamplingStrategy>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            histories: RwLock::new(HashMap::new()),
            max_records,
            retention: Duration::from_std(retention).unwrap_or_else(|_| Duration::hours(1)),
            downsampler,
            clock,
        }
    }

    fn shrink_target(&self) -> usize {
        ((self.max_records as f64 * SHRINK_FACTOR) as usize).max(2)
    }
}

impl PodMetricsStorage for InMemoryStore {
    fn add_record(&self, identity: &PodIdentity, record: PodMetricsRecord) {
        let mut histories = self.histories.write().expect("metrics store poisoned");
        let history = histories
            .entry(identity.uid.clone())
            .or_insert_with(|| PodMetricsHistory {
                pod_uid: identity.uid.clone(),
                pod_name: identity.name.clone(),
                namespace: identity.namespace.clone(),
                node_name: identity.node.clone(),
                records: Vec::new(),
                start: record.timestamp,
                last_seen: record.timestamp,
                completed: false,
            });

        if history.completed {
            return;
        }
        if let Some(last) = history.records.last() {
            if record.timestamp <= last.timestamp {
                debug!(
                    pod = %identity.name,
                    "dropping out-of-order sample"
                );
                return;
            }
        }

        history.node_name = identity.node.clone();
        history.records.push(record);
        history.last_seen = record.timestamp;

        if history.records.len() > self.max_records {
            let target = self.shrink_target();
            history.records = self.downsampler.downsample(&history.records, target);
            debug!(
                pod = %identity.name,
                strategy = self.downsampler.name(),
                kept = history.records.len(),
                "downsampled pod history"
            );
        }
    }

    fn mark_completed(&self, uid: &str) -> bool {
        let mut histories = self.histories.write().expect("metrics store poisoned");
        match histories.get_mut(uid) {
            Some(history) if !history.completed => {
                history.completed = true;
                history.last_seen = self.clock.now();
                true
            }
            _ => false,
        }
    }

    fn get(&self, uid: &str) -> Option<PodMetricsHistory> {
        let histories = self.histories.read().expect("metrics store poisoned");
        histories.get(uid).cloned()
    }

    fn for_each(&self, visit: &mut dyn FnMut(&PodMetricsHistory)) {
        let histories = self.histories.read().expect("metrics store poisoned");
        for history in histories.values() {
            visit(history);
        }
    }

    /// Two-phase eviction: victims are collected under the read lock so the
    /// write lock is held only for the removals themselves.
    fn cleanup(&self) {
        let now = self.clock.now();
        let victims: Vec<String> = {
            let histories = self.histories.read().expect("metrics store poisoned");
            histories
                .values()
                .filter(|history| history.completed && now - history.last_seen > self.retention)
                .map(|history| history.pod_uid.clone())
                .collect()
        };
        if victims.is_empty() {
            return;
        }
        let mut histories = self.histories.write().expect("metrics store poisoned");
        for uid in &victims {
            if let Some(history) = histories.get(uid) {
                if history.completed && now - history.last_seen > self.retention {
                    histories.remove(uid);
                }
            }
        }
        debug!(evicted = victims.len(), "evicted retired pod histories");
    }

    fn size(&self) -> usize {
        self.histories.read().expect("metrics store poisoned").len()
    }

    fn close(&self) {
        self.histories
            .write()
            .expect("metrics store poisoned")
            .clear();
    }
}

/// Periodic eviction of retired histories.
pub struct StoreCleanupService {
    store: Arc<dyn PodMetricsStorage>,
    interval: StdDuration,
}

impl StoreCleanupService {
    pub fn new(store: Arc<dyn PodMetricsStorage>, interval: StdDuration) -> Self {
        Self { store, interval }
    }

    pub fn start(self, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.store.cleanup();
                        crate::metrics::METRICS_CACHE_SIZE.set(self.store.size() as f64);
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::telemetry::downsample::{make_records, Lttb};
    use chrono::{TimeZone, Utc};

    fn identity(uid: &str) -> PodIdentity {
        PodIdentity {
            uid: uid.to_string(),
            name: format!("pod-{uid}"),
            namespace: "default".to_string(),
            node: "node-1".to_string(),
        }
    }

    fn store_with_clock(max_records: usize) -> (InMemoryStore, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap());
        let store = InMemoryStore::new(
            max_records,
            StdDuration::from_secs(3600),
            Box::new(Lttb),
            Arc::new(clock.clone()),
        );
        (store, clock)
    }

    #[test]
    fn appends_stay_bounded() {
        let (store, _clock) = store_with_clock(50);
        let id = identity("uid-1");
        for record in make_records(200) {
            store.add_record(&id, record);
        }
        let history = store.get("uid-1").expect("history");
        assert!(history.records.len() <= 50);
        for pair in history.records.windows(2) {
            assert!(pair[0].timestamp < pair[1].timestamp);
        }
    }

    #[test]
    fn out_of_order_appends_are_dropped() {
        let (store, _clock) = store_with_clock(50);
        let id = identity("uid-1");
        let records = make_records(3);
        store.add_record(&id, records[0]);
        store.add_record(&id, records[2]);
        store.add_record(&id, records[1]);

        let history = store.get("uid-1").expect("history");
        assert_eq!(history.records.len(), 2);
    }

    #[test]
    fn completed_histories_are_frozen() {
        let (store, _clock) = store_with_clock(50);
        let id = identity("uid-1");
        let records = make_records(5);
        for record in &records[..3] {
            store.add_record(&id, *record);
        }
        assert!(store.mark_completed("uid-1"));
        assert!(!store.mark_completed("uid-1"));

        store.add_record(&id, records[3]);
        let history = store.get("uid-1").expect("history");
        assert_eq!(history.records.len(), 3);
        assert!(history.completed);
    }

    #[test]
    fn mark_completed_unknown_uid_is_noop() {
        let (store, _clock) = store_with_clock(50);
        assert!(!store.mark_completed("missing"));
    }

    #[test]
    fn cleanup_waits_for_retention() {
        let (store, clock) = store_with_clock(50);
        let id = identity("uid-1");
        store.add_record(&id, make_records(1)[0]);
        store.mark_completed("uid-1");

        clock.advance(Duration::minutes(30));
        store.cleanup();
        assert_eq!(store.size(), 1);

        clock.advance(Duration::minutes(31));
        store.cleanup();
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn cleanup_spares_live_histories() {
        let (store, clock) = store_with_clock(50);
        store.add_record(&identity("live"), make_records(1)[0]);
        clock.advance(Duration::hours(2));
        store.cleanup();
        assert_eq!(store.size(), 1);
    }
}
