//! Public client and manager handles.
//!
//! Both are thin facades over the factory's shared state: clients evaluate
//! against a storage snapshot and feed the telemetry pipelines, managers
//! expose a read-only view of the cached definitions. Neither owns
//! anything; destroying the factory invalidates every handle at once.
//!
//! No call here ever panics or returns an error to the host application:
//! invalid input, an unknown flag, a not-ready SDK, or a destroyed factory
//! all degrade to the `control` treatment with a descriptive label.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value as JsonValue;

use crate::evaluator::{self, LABEL_DESTROYED, LABEL_EXCEPTION, LABEL_NOT_FOUND, LABEL_NOT_READY};
use crate::events;
use crate::factory::FactoryInner;
use crate::telemetry::{CallKind, Telemetry};
use crate::types::{Attributes, Evaluation, Impression, Key, SplitView, CONTROL};

const MAX_KEY_LENGTH: usize = 250;

/// Treatment plus the flag's configuration payload for that treatment.
pub type TreatmentWithConfig = (String, Option<String>);

/// Evaluation handle obtained from [`crate::SplitFactory::client`].
#[derive(Clone)]
pub struct SplitClient {
    inner: Arc<FactoryInner>,
}

impl SplitClient {
    pub(crate) fn new(inner: Arc<FactoryInner>) -> Self {
        Self { inner }
    }

    /// Treatment for one feature flag.
    pub fn get_treatment(
        &self,
        key: impl Into<Key>,
        feature: &str,
        attributes: Option<&Attributes>,
    ) -> String {
        self.evaluate_single(CallKind::Treatment, key.into(), feature, attributes)
            .treatment
    }

    /// Treatment plus configuration payload for one feature flag.
    pub fn get_treatment_with_config(
        &self,
        key: impl Into<Key>,
        feature: &str,
        attributes: Option<&Attributes>,
    ) -> TreatmentWithConfig {
        let evaluation =
            self.evaluate_single(CallKind::TreatmentWithConfig, key.into(), feature, attributes);
        (evaluation.treatment, evaluation.config)
    }

    /// Treatments for several flags, evaluated against one storage
    /// snapshot for atomicity.
    pub fn get_treatments(
        &self,
        key: impl Into<Key>,
        features: &[&str],
        attributes: Option<&Attributes>,
    ) -> HashMap<String, String> {
        self.evaluate_many(CallKind::Treatments, key.into(), features, attributes)
            .into_iter()
            .map(|(feature, evaluation)| (feature, evaluation.treatment))
            .collect()
    }

    pub fn get_treatments_with_config(
        &self,
        key: impl Into<Key>,
        features: &[&str],
        attributes: Option<&Attributes>,
    ) -> HashMap<String, TreatmentWithConfig> {
        self.evaluate_many(CallKind::TreatmentsWithConfig, key.into(), features, attributes)
            .into_iter()
            .map(|(feature, evaluation)| (feature, (evaluation.treatment, evaluation.config)))
            .collect()
    }

    /// Treatments for every flag tagged with the given flag set.
    pub fn get_treatments_by_flag_set(
        &self,
        key: impl Into<Key>,
        flag_set: &str,
        attributes: Option<&Attributes>,
    ) -> HashMap<String, String> {
        self.evaluate_by_sets(CallKind::TreatmentsByFlagSet, key.into(), &[flag_set], attributes)
            .into_iter()
            .map(|(feature, evaluation)| (feature, evaluation.treatment))
            .collect()
    }

    pub fn get_treatments_by_flag_sets(
        &self,
        key: impl Into<Key>,
        flag_sets: &[&str],
        attributes: Option<&Attributes>,
    ) -> HashMap<String, String> {
        self.evaluate_by_sets(CallKind::TreatmentsByFlagSets, key.into(), flag_sets, attributes)
            .into_iter()
            .map(|(feature, evaluation)| (feature, evaluation.treatment))
            .collect()
    }

    pub fn get_treatments_by_flag_set_with_config(
        &self,
        key: impl Into<Key>,
        flag_set: &str,
        attributes: Option<&Attributes>,
    ) -> HashMap<String, TreatmentWithConfig> {
        self.evaluate_by_sets(CallKind::TreatmentsByFlagSet, key.into(), &[flag_set], attributes)
            .into_iter()
            .map(|(feature, evaluation)| (feature, (evaluation.treatment, evaluation.config)))
            .collect()
    }

    pub fn get_treatments_by_flag_sets_with_config(
        &self,
        key: impl Into<Key>,
        flag_sets: &[&str],
        attributes: Option<&Attributes>,
    ) -> HashMap<String, TreatmentWithConfig> {
        self.evaluate_by_sets(CallKind::TreatmentsByFlagSets, key.into(), flag_sets, attributes)
            .into_iter()
            .map(|(feature, evaluation)| (feature, (evaluation.treatment, evaluation.config)))
            .collect()
    }

    /// Queue one tracking event. Returns whether the event was accepted.
    pub fn track(
        &self,
        key: &str,
        traffic_type: &str,
        event_type: &str,
        value: Option<f64>,
        properties: Option<HashMap<String, JsonValue>>,
    ) -> bool {
        let started = Instant::now();
        if self.inner.destroyed.load(Ordering::SeqCst) {
            tracing::warn!("track called on a destroyed factory");
            return false;
        }
        let Some(event) = events::build_event(
            key,
            traffic_type,
            event_type,
            value,
            properties,
            chrono::Utc::now().timestamp_millis(),
        ) else {
            self.inner.telemetry.record_exception(CallKind::Track);
            return false;
        };
        if self.inner.is_ready() && !self.inner.storage.traffic_type_exists(&event.traffic_type_name)
        {
            tracing::warn!(
                traffic_type = %event.traffic_type_name,
                "track: traffic type does not match any flag definition; event will be queued anyway"
            );
        }
        self.inner.events.push(event);
        self.inner.telemetry.record_call(CallKind::Track, started.elapsed());
        true
    }

    /// Whether the first full sync has completed.
    pub fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }

    // ── Evaluation plumbing ─────────────────────────────────────────────

    fn evaluate_single(
        &self,
        kind: CallKind,
        key: Key,
        feature: &str,
        attributes: Option<&Attributes>,
    ) -> Evaluation {
        let started = Instant::now();
        let Some((key, feature)) = self.gate(kind, &key, Some(feature)) else {
            return self.degraded(kind);
        };
        let snapshot = self.inner.storage.snapshot();
        let evaluation = evaluator::evaluate(&snapshot, &feature, &key, attributes, 0);
        drop(snapshot);
        self.emit(&feature, &key, &evaluation);
        self.inner.telemetry.record_call(kind, started.elapsed());
        evaluation
    }

    fn evaluate_many(
        &self,
        kind: CallKind,
        key: Key,
        features: &[&str],
        attributes: Option<&Attributes>,
    ) -> Vec<(String, Evaluation)> {
        let started = Instant::now();
        let Some((key, _)) = self.gate(kind, &key, None) else {
            return features
                .iter()
                .filter_map(|f| {
                    let name = f.trim();
                    (!name.is_empty()).then(|| (name.to_string(), self.degraded(kind)))
                })
                .collect();
        };
        let snapshot = self.inner.storage.snapshot();
        let results: Vec<(String, Evaluation)> = features
            .iter()
            .filter_map(|f| {
                let feature = validate_feature_name(f)?;
                let evaluation = evaluator::evaluate(&snapshot, &feature, &key, attributes, 0);
                Some((feature, evaluation))
            })
            .collect();
        drop(snapshot);
        for (feature, evaluation) in &results {
            self.emit(feature, &key, evaluation);
        }
        self.inner.telemetry.record_call(kind, started.elapsed());
        results
    }

    fn evaluate_by_sets(
        &self,
        kind: CallKind,
        key: Key,
        flag_sets: &[&str],
        attributes: Option<&Attributes>,
    ) -> Vec<(String, Evaluation)> {
        let started = Instant::now();
        let Some((key, _)) = self.gate(kind, &key, None) else {
            return Vec::new();
        };
        let snapshot = self.inner.storage.snapshot();
        let sets: Vec<&str> = flag_sets.iter().map(|s| s.trim()).filter(|s| !s.is_empty()).collect();
        let results: Vec<(String, Evaluation)> = snapshot
            .splits_for_sets(&sets)
            .into_iter()
            .map(|split| {
                let evaluation =
                    evaluator::evaluate_split(&snapshot, &split, &key, attributes, 0);
                (split.name.clone(), evaluation)
            })
            .collect();
        drop(snapshot);
        for (feature, evaluation) in &results {
            self.emit(feature, &key, evaluation);
        }
        self.inner.telemetry.record_call(kind, started.elapsed());
        results
    }

    /// Shared lifecycle/input gate. Returns the validated key (and feature
    /// name when given), or records why the call degrades to control.
    fn gate(&self, kind: CallKind, key: &Key, feature: Option<&str>) -> Option<(Key, String)> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            tracing::warn!("evaluation called on a destroyed factory");
            return None;
        }
        if !self.inner.is_ready() {
            Telemetry::bump(&self.inner.telemetry.not_ready_usages);
            tracing::warn!("evaluation called before the sdk is ready, returning control");
            return None;
        }
        if !valid_key_part(&key.matching)
            || key.bucketing.as_deref().is_some_and(|b| !valid_key_part(b))
        {
            tracing::warn!("evaluation key must be a non-empty string of at most 250 characters");
            self.inner.telemetry.record_exception(kind);
            return None;
        }
        let feature = match feature {
            Some(raw) => match validate_feature_name(raw) {
                Some(name) => name,
                None => {
                    tracing::warn!("feature flag name must not be empty");
                    self.inner.telemetry.record_exception(kind);
                    return None;
                }
            },
            None => String::new(),
        };
        Some((key.clone(), feature))
    }

    /// Control result for gated-out calls with the most specific label.
    fn degraded(&self, _kind: CallKind) -> Evaluation {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            Evaluation::control(LABEL_DESTROYED)
        } else if !self.inner.is_ready() {
            Evaluation::control(LABEL_NOT_READY)
        } else {
            Evaluation::control(LABEL_EXCEPTION)
        }
    }

    /// Every evaluation that resolved a definition produces exactly one
    /// impression; unknown flags do not.
    fn emit(&self, feature: &str, key: &Key, evaluation: &Evaluation) {
        if evaluation.treatment == CONTROL && evaluation.label == LABEL_NOT_FOUND {
            tracing::warn!(%feature, "feature flag not found, returning control");
            return;
        }
        self.inner.impressions.process(Impression {
            feature: feature.to_string(),
            key_name: key.matching.clone(),
            bucketing_key: key.bucketing.clone(),
            treatment: evaluation.treatment.clone(),
            label: evaluation.label.clone(),
            change_number: evaluation.change_number,
            time: chrono::Utc::now().timestamp_millis(),
            previous_time: None,
        });
    }
}

fn valid_key_part(part: &str) -> bool {
    !part.trim().is_empty() && part.len() <= MAX_KEY_LENGTH
}

fn validate_feature_name(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.len() != raw.len() {
        tracing::warn!(feature = %trimmed, "feature flag name has leading/trailing whitespace");
    }
    Some(trimmed.to_string())
}

/// Introspection handle obtained from [`crate::SplitFactory::manager`].
#[derive(Clone)]
pub struct SplitManager {
    inner: Arc<FactoryInner>,
}

impl SplitManager {
    pub(crate) fn new(inner: Arc<FactoryInner>) -> Self {
        Self { inner }
    }

    /// Names of every cached flag.
    pub fn split_names(&self) -> Vec<String> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Vec::new();
        }
        let mut names = self.inner.storage.snapshot().split_names();
        names.sort();
        names
    }

    /// Read-only views of every cached flag.
    pub fn splits(&self) -> Vec<SplitView> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Vec::new();
        }
        let mut views: Vec<SplitView> = self
            .inner
            .storage
            .snapshot()
            .all_splits()
            .iter()
            .map(|split| SplitView::from_split(split))
            .collect();
        views.sort_by(|a, b| a.name.cmp(&b.name));
        views
    }

    /// Read-only view of one cached flag.
    pub fn split(&self, name: &str) -> Option<SplitView> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return None;
        }
        let snapshot = self.inner.storage.snapshot();
        snapshot
            .split(name.trim())
            .map(|split| SplitView::from_split(&split))
    }
}
