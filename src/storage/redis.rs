//! Interface of the external (Redis-backed) storage adapter.
//!
//! In adapter mode the SDK holds no in-process cache: flag and segment reads
//! go straight to the external store, the sync pollers are disabled, and an
//! out-of-process synchronizer keeps the store populated. Only the contract
//! lives here — the in-memory storage in the parent module is the normative
//! implementation, and this crate takes no Redis client dependency.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::types::{Event, Impression, Split};

/// Key layout used by the external synchronizer. All keys are namespaced
/// under a configurable prefix so several SDK deployments can share one
/// store.
#[derive(Debug, Clone)]
pub struct KeySchema {
    prefix: String,
}

impl KeySchema {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Serialized flag definition, one key per flag.
    pub fn split(&self, name: &str) -> String {
        format!("{}.split.{name}", self.prefix)
    }

    /// Feed change number for the flag feed.
    pub fn splits_till(&self) -> String {
        format!("{}.splits.till", self.prefix)
    }

    /// Member set for one segment.
    pub fn segment(&self, name: &str) -> String {
        format!("{}.segment.{name}", self.prefix)
    }

    pub fn segment_till(&self, name: &str) -> String {
        format!("{}.segment.{name}.till", self.prefix)
    }

    /// List key full impressions are RPUSH'd onto.
    pub fn impressions(&self) -> String {
        format!("{}.impressions", self.prefix)
    }

    /// Hash key per-feature impression counts are HINCRBY'd into; fields
    /// are `{feature}::{hour-bucket-millis}`.
    pub fn impression_counts(&self) -> String {
        format!("{}.impressions.count", self.prefix)
    }

    pub fn events(&self) -> String {
        format!("{}.events", self.prefix)
    }

    pub fn unique_keys(&self) -> String {
        format!("{}.uniquekeys", self.prefix)
    }
}

/// Operations the SDK needs from an external store.
///
/// Read methods replace the in-memory caches; write methods replace the
/// in-process impression/event queues (counts via `HINCRBY`, full
/// impressions via `RPUSH`).
#[async_trait]
pub trait ExternalCache: Send + Sync {
    async fn split(&self, name: &str) -> Option<Split>;
    async fn split_names(&self) -> Vec<String>;
    async fn change_number(&self) -> i64;
    async fn segment_contains(&self, segment: &str, key: &str) -> bool;

    async fn push_impressions(&self, impressions: &[Impression]);
    async fn increment_counts(&self, counts: &HashMap<String, u64>);
    async fn push_events(&self, events: &[Event]);
    async fn record_unique_keys(&self, feature: &str, keys: &[String]);
}
