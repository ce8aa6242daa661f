//! Impression pipeline: bounded queue, optimized-mode deduplication,
//! per-feature counters, unique-keys tracking, and the listener hook.
//!
//! Producers are evaluation calls and must never block: the queue is bounded
//! with drop-oldest overflow, and the listener runs on its own worker fed
//! through a channel so a slow hook cannot touch evaluation latency.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::telemetry::Telemetry;
use crate::types::Impression;

const HOUR_MS: i64 = 3_600_000;
/// Capacity of the channel feeding the listener worker; a full channel
/// drops the delivery, never the evaluation.
const LISTENER_CHANNEL_CAPACITY: usize = 1024;

/// How evaluation outcomes are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImpressionsMode {
    /// Every impression is queued verbatim.
    Debug,
    /// Duplicates within an hour are suppressed into per-feature counters.
    #[default]
    Optimized,
    /// Nothing is queued; only unique keys per feature are tracked.
    None,
}

/// Synchronous hook receiving each emitted impression, invoked on a
/// dedicated worker. Panics are caught and counted.
pub trait ImpressionListener: Send + Sync {
    fn log(&self, impression: &Impression);
}

pub(crate) struct ImpressionsManager {
    mode: ImpressionsMode,
    capacity: usize,
    queue: Mutex<VecDeque<Impression>>,
    /// (feature, key, treatment, change-number) hash → last emission millis.
    observer: DashMap<u64, i64>,
    /// (feature, hour bucket millis) → suppressed duplicate count.
    counts: DashMap<(String, i64), u64>,
    /// feature → matching keys seen this window (NONE mode).
    unique_keys: DashMap<String, HashSet<String>>,
    listener_tx: Option<mpsc::Sender<Impression>>,
    telemetry: Arc<Telemetry>,
}

impl ImpressionsManager {
    pub(crate) fn new(
        mode: ImpressionsMode,
        capacity: usize,
        telemetry: Arc<Telemetry>,
        listener_tx: Option<mpsc::Sender<Impression>>,
    ) -> Self {
        Self {
            mode,
            capacity,
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            observer: DashMap::new(),
            counts: DashMap::new(),
            unique_keys: DashMap::new(),
            listener_tx,
            telemetry,
        }
    }

    /// Feed one evaluation outcome through the configured mode.
    pub(crate) fn process(&self, mut impression: Impression) {
        match self.mode {
            ImpressionsMode::Debug => self.emit(impression),
            ImpressionsMode::Optimized => {
                let key = observer_key(&impression);
                let now = impression.time;
                let mut suppress = false;
                match self.observer.entry(key) {
                    dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                        let last = *entry.get();
                        if now.saturating_sub(last) < HOUR_MS {
                            suppress = true;
                        } else {
                            impression.previous_time = Some(last);
                            entry.insert(now);
                        }
                    }
                    dashmap::mapref::entry::Entry::Vacant(entry) => {
                        entry.insert(now);
                    }
                }
                if suppress {
                    Telemetry::bump(&self.telemetry.impressions_deduped);
                    *self
                        .counts
                        .entry((impression.feature.clone(), hour_bucket(now)))
                        .or_insert(0) += 1;
                } else {
                    self.emit(impression);
                }
            }
            ImpressionsMode::None => {
                self.unique_keys
                    .entry(impression.feature.clone())
                    .or_default()
                    .insert(impression.key_name.clone());
            }
        }
    }

    fn emit(&self, impression: Impression) {
        {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            if queue.len() >= self.capacity {
                queue.pop_front();
                Telemetry::bump(&self.telemetry.impressions_dropped);
            }
            queue.push_back(impression.clone());
        }
        Telemetry::bump(&self.telemetry.impressions_queued);
        if let Some(tx) = &self.listener_tx {
            if tx.try_send(impression).is_err() {
                Telemetry::bump(&self.telemetry.listener_failures);
            }
        }
    }

    /// Take everything queued, preserving insertion order.
    pub(crate) fn drain(&self) -> Vec<Impression> {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.drain(..).collect()
    }

    /// Take the per-feature suppressed-duplicate counters.
    pub(crate) fn drain_counts(&self) -> Vec<ImpressionCount> {
        let mut counts = Vec::new();
        self.counts.retain(|(feature, time_frame), count| {
            counts.push(ImpressionCount {
                feature: feature.clone(),
                time_frame: *time_frame,
                count: *count,
            });
            false
        });
        counts
    }

    /// Take the unique-keys window (NONE mode).
    pub(crate) fn drain_unique_keys(&self) -> Vec<UniqueKeys> {
        let mut out = Vec::new();
        self.unique_keys.retain(|feature, keys| {
            let mut keys: Vec<String> = keys.drain().collect();
            keys.sort();
            out.push(UniqueKeys {
                feature: feature.clone(),
                keys,
            });
            false
        });
        out
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Worker loop draining the listener channel. Spawned by the factory when a
/// listener is configured; exits when every sender is dropped.
pub(crate) async fn listener_worker(
    mut rx: mpsc::Receiver<Impression>,
    listener: Arc<dyn ImpressionListener>,
    telemetry: Arc<Telemetry>,
) {
    while let Some(impression) = rx.recv().await {
        let result = catch_unwind(AssertUnwindSafe(|| listener.log(&impression)));
        if result.is_err() {
            Telemetry::bump(&telemetry.listener_failures);
            tracing::warn!(feature = %impression.feature, "impression listener panicked");
        }
    }
}

pub(crate) fn listener_channel() -> (mpsc::Sender<Impression>, mpsc::Receiver<Impression>) {
    mpsc::channel(LISTENER_CHANNEL_CAPACITY)
}

fn observer_key(impression: &Impression) -> u64 {
    let mut hasher = DefaultHasher::new();
    impression.feature.hash(&mut hasher);
    impression.key_name.hash(&mut hasher);
    impression.treatment.hash(&mut hasher);
    impression.change_number.hash(&mut hasher);
    hasher.finish()
}

fn hour_bucket(millis: i64) -> i64 {
    millis - millis.rem_euclid(HOUR_MS)
}

/// Flush payload: impressions grouped per feature.
#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FeatureImpressions {
    pub feature: String,
    pub impressions: Vec<Impression>,
}

pub(crate) fn group_by_feature(impressions: Vec<Impression>) -> Vec<FeatureImpressions> {
    let mut grouped: Vec<FeatureImpressions> = Vec::new();
    for impression in impressions {
        match grouped.iter_mut().find(|g| g.feature == impression.feature) {
            Some(group) => group.impressions.push(impression),
            None => grouped.push(FeatureImpressions {
                feature: impression.feature.clone(),
                impressions: vec![impression],
            }),
        }
    }
    grouped
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ImpressionCount {
    pub feature: String,
    pub time_frame: i64,
    pub count: u64,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub(crate) struct UniqueKeys {
    pub feature: String,
    pub keys: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    fn impression(feature: &str, key: &str, treatment: &str, time: i64) -> Impression {
        Impression {
            feature: feature.to_string(),
            key_name: key.to_string(),
            bucketing_key: None,
            treatment: treatment.to_string(),
            label: "default rule".to_string(),
            change_number: 42,
            time,
            previous_time: None,
        }
    }

    fn manager(mode: ImpressionsMode, capacity: usize) -> ImpressionsManager {
        ImpressionsManager::new(mode, capacity, Arc::new(Telemetry::new()), None)
    }

    #[test]
    fn debug_mode_queues_everything_verbatim() {
        let manager = manager(ImpressionsMode::Debug, 100);
        for _ in 0..3 {
            manager.process(impression("f", "alice", "on", 1_000));
        }
        let drained = manager.drain();
        assert_eq!(drained.len(), 3);
        assert!(drained.iter().all(|i| i.previous_time.is_none()));
        assert!(manager.drain_counts().is_empty());
    }

    #[test]
    fn optimized_mode_dedupes_within_an_hour() {
        let manager = manager(ImpressionsMode::Optimized, 100);
        let base = 10 * HOUR_MS;

        // Three calls inside one hour: one queued, two suppressed.
        manager.process(impression("f", "alice", "on", base));
        manager.process(impression("f", "alice", "on", base + 10_000));
        manager.process(impression("f", "alice", "on", base + 20_000));

        let drained = manager.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].previous_time, None);

        let counts = manager.drain_counts();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0].count, 2);
        assert_eq!(counts[0].time_frame, base);

        // After the hour boundary the next call is emitted again, carrying
        // the first emission's timestamp as its previous time.
        manager.process(impression("f", "alice", "on", base + HOUR_MS + 1_000));
        let drained = manager.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].previous_time, Some(base));
    }

    #[test]
    fn optimized_mode_distinguishes_treatment_and_change_number() {
        let manager = manager(ImpressionsMode::Optimized, 100);
        manager.process(impression("f", "alice", "on", 1_000));
        manager.process(impression("f", "alice", "off", 2_000));
        let mut changed = impression("f", "alice", "on", 3_000);
        changed.change_number = 43;
        manager.process(changed);
        assert_eq!(manager.drain().len(), 3);
        assert!(manager.drain_counts().is_empty());
    }

    #[test]
    fn none_mode_tracks_unique_keys_only() {
        let manager = manager(ImpressionsMode::None, 100);
        manager.process(impression("f", "alice", "on", 1_000));
        manager.process(impression("f", "alice", "on", 2_000));
        manager.process(impression("f", "bob", "off", 3_000));
        manager.process(impression("g", "alice", "on", 4_000));

        assert_eq!(manager.queued(), 0);
        let mut uniques = manager.drain_unique_keys();
        uniques.sort_by(|a, b| a.feature.cmp(&b.feature));
        assert_eq!(uniques.len(), 2);
        assert_eq!(uniques[0].feature, "f");
        assert_eq!(uniques[0].keys, vec!["alice".to_string(), "bob".to_string()]);
        assert_eq!(uniques[1].keys, vec!["alice".to_string()]);
    }

    #[test]
    fn overflow_drops_the_oldest_entry() {
        let manager = manager(ImpressionsMode::Debug, 2);
        manager.process(impression("f", "k1", "on", 1));
        manager.process(impression("f", "k2", "on", 2));
        manager.process(impression("f", "k3", "on", 3));

        let drained = manager.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].key_name, "k2");
        assert_eq!(drained[1].key_name, "k3");
    }

    #[test]
    fn grouping_preserves_queue_order_per_feature() {
        let impressions = vec![
            impression("a", "k1", "on", 1),
            impression("b", "k2", "on", 2),
            impression("a", "k3", "on", 3),
        ];
        let grouped = group_by_feature(impressions);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].feature, "a");
        assert_eq!(grouped[0].impressions.len(), 2);
        assert_eq!(grouped[0].impressions[1].key_name, "k3");
    }

    #[tokio::test]
    async fn listener_worker_survives_panicking_listener() {
        struct Exploding;
        impl ImpressionListener for Exploding {
            fn log(&self, _: &Impression) {
                panic!("listener bug");
            }
        }

        let telemetry = Arc::new(Telemetry::new());
        let (tx, rx) = listener_channel();
        let worker = tokio::spawn(listener_worker(rx, Arc::new(Exploding), telemetry.clone()));

        tx.send(impression("f", "k", "on", 1)).await.expect("send");
        tx.send(impression("f", "k", "on", 2)).await.expect("send");
        drop(tx);
        worker.await.expect("worker exits cleanly");

        assert_eq!(telemetry.listener_failures.load(Ordering::Relaxed), 2);
    }
}
