//! The deterministic rule interpreter.
//!
//! Walks a flag's conditions in order against one storage snapshot, resolves
//! matchers, and assigns a treatment through the hash/splitter pair. Every
//! outcome carries the label surfaced in impressions.

use crate::hashing::{self, murmur3_32};
use crate::matchers::{self, MatchContext, MatcherError};
use crate::splitter;
use crate::storage::Snapshot;
use crate::types::{Attributes, Evaluation, Key, Split};

/// Bound on dependency-matcher recursion; past it the matcher is no match.
pub(crate) const MAX_DEPENDENCY_DEPTH: usize = 50;

pub(crate) const LABEL_NOT_FOUND: &str = "definition not found";
pub(crate) const LABEL_KILLED: &str = "killed";
pub(crate) const LABEL_NOT_IN_SPLIT: &str = "not in split";
pub(crate) const LABEL_DEFAULT_RULE: &str = "default rule";
pub(crate) const LABEL_UNSUPPORTED: &str = "targeting rule type unsupported by sdk";
pub(crate) const LABEL_EXCEPTION: &str = "exception";
pub(crate) const LABEL_NOT_READY: &str = "sdk not ready";
pub(crate) const LABEL_DESTROYED: &str = "sdk destroyed";

/// Evaluate `feature` for `key` against one snapshot. A missing definition
/// yields control with [`LABEL_NOT_FOUND`]; that outcome is the one result
/// the caller must not turn into an impression.
pub(crate) fn evaluate(
    snapshot: &Snapshot<'_>,
    feature: &str,
    key: &Key,
    attributes: Option<&Attributes>,
    depth: usize,
) -> Evaluation {
    match snapshot.split(feature) {
        Some(split) => evaluate_split(snapshot, &split, key, attributes, depth),
        None => Evaluation::control(LABEL_NOT_FOUND),
    }
}

pub(crate) fn evaluate_split(
    snapshot: &Snapshot<'_>,
    split: &Split,
    key: &Key,
    attributes: Option<&Attributes>,
    depth: usize,
) -> Evaluation {
    if split.killed {
        return outcome(split, split.default_treatment.clone(), LABEL_KILLED);
    }

    // Traffic allocation gates rollout before any condition is consulted.
    if split.traffic_allocation < 100 {
        let ta_bucket = i64::from(
            murmur3_32(key.bucketing_key(), split.traffic_allocation_seed as u32) % 100,
        ) + 1;
        if ta_bucket > split.traffic_allocation {
            return outcome(split, split.default_treatment.clone(), LABEL_NOT_IN_SPLIT);
        }
    }

    let ctx = MatchContext {
        key,
        attributes,
        snapshot,
        depth,
    };

    for condition in &split.conditions {
        let mut all_matched = true;
        for matcher in &condition.matcher_group.matchers {
            match matchers::evaluate(matcher, &ctx) {
                Ok(true) => {}
                Ok(false) => {
                    all_matched = false;
                    break;
                }
                Err(MatcherError::Unsupported(tag)) => {
                    tracing::warn!(
                        split = %split.name,
                        matcher = %tag,
                        "flag uses a matcher type unsupported by this sdk"
                    );
                    return outcome(split, split.default_treatment.clone(), LABEL_UNSUPPORTED);
                }
            }
        }
        if all_matched {
            let bucket = hashing::bucket(split.algo, key.bucketing_key(), split.seed);
            return match splitter::treatment_for_bucket(bucket, &condition.partitions) {
                Some(treatment) => outcome(split, treatment.to_string(), condition.label.clone()),
                None => outcome(split, split.default_treatment.clone(), LABEL_DEFAULT_RULE),
            };
        }
    }

    outcome(split, split.default_treatment.clone(), LABEL_DEFAULT_RULE)
}

fn outcome(split: &Split, treatment: String, label: impl Into<String>) -> Evaluation {
    let config = split.config_for(&treatment).map(str::to_string);
    Evaluation {
        treatment,
        label: label.into(),
        change_number: split.change_number,
        config,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use crate::types::CONTROL;

    fn storage_with(raw: &str) -> InMemoryStorage {
        let storage = InMemoryStorage::new(None);
        let split: Split = serde_json::from_str(raw).expect("test split");
        let till = split.change_number;
        storage.update_splits(vec![split], till);
        storage
    }

    fn simple_flag(extra: &str) -> String {
        format!(
            r#"{{
                "name":"flag","defaultTreatment":"off","seed":12345,
                "changeNumber":42,{extra}
                "conditions":[{{"label":"in rule",
                    "matcherGroup":{{"combiner":"AND","matchers":[{{"matcherType":"ALL_KEYS"}}]}},
                    "partitions":[{{"treatment":"on","size":100}}]}}]
            }}"#
        )
    }

    #[test]
    fn missing_definition_is_control() {
        let storage = InMemoryStorage::new(None);
        let result = evaluate(&storage.snapshot(), "ghost", &Key::new("u"), None, 0);
        assert_eq!(result.treatment, CONTROL);
        assert_eq!(result.label, LABEL_NOT_FOUND);
        assert_eq!(result.change_number, -1);
    }

    #[test]
    fn killed_flag_short_circuits_to_default() {
        let storage = storage_with(&simple_flag(r#""killed":true,"#));
        let result = evaluate(&storage.snapshot(), "flag", &Key::new("u"), None, 0);
        assert_eq!(result.treatment, "off");
        assert_eq!(result.label, LABEL_KILLED);
        assert_eq!(result.change_number, 42);
    }

    #[test]
    fn zero_traffic_allocation_excludes_everyone() {
        let storage = storage_with(&simple_flag(
            r#""trafficAllocation":0,"trafficAllocationSeed":77,"#,
        ));
        for key in ["a", "b", "c", "user-123"] {
            let result = evaluate(&storage.snapshot(), "flag", &Key::new(key), None, 0);
            assert_eq!(result.treatment, "off");
            assert_eq!(result.label, LABEL_NOT_IN_SPLIT);
        }
    }

    #[test]
    fn full_allocation_skips_the_gate() {
        let storage = storage_with(&simple_flag(r#""trafficAllocation":100,"#));
        let result = evaluate(&storage.snapshot(), "flag", &Key::new("u"), None, 0);
        assert_eq!(result.treatment, "on");
        assert_eq!(result.label, "in rule");
    }

    #[test]
    fn no_condition_matching_falls_through_to_default_rule() {
        let storage = storage_with(
            r#"{
                "name":"flag","defaultTreatment":"off","seed":1,"changeNumber":7,
                "conditions":[{"label":"vips",
                    "matcherGroup":{"combiner":"AND","matchers":[
                        {"matcherType":"WHITELIST","whitelistMatcherData":{"whitelist":["vip-1"]}}]},
                    "partitions":[{"treatment":"on","size":100}]}]
            }"#,
        );
        let result = evaluate(&storage.snapshot(), "flag", &Key::new("pleb"), None, 0);
        assert_eq!(result.treatment, "off");
        assert_eq!(result.label, LABEL_DEFAULT_RULE);
    }

    #[test]
    fn unsupported_matcher_degrades_with_specific_label() {
        let storage = storage_with(
            r#"{
                "name":"flag","defaultTreatment":"off","seed":1,"changeNumber":7,
                "conditions":[{"label":"future",
                    "matcherGroup":{"combiner":"AND","matchers":[{"matcherType":"QUANTUM_MATCH"}]},
                    "partitions":[{"treatment":"on","size":100}]}]
            }"#,
        );
        let result = evaluate(&storage.snapshot(), "flag", &Key::new("u"), None, 0);
        assert_eq!(result.treatment, "off");
        assert_eq!(result.label, LABEL_UNSUPPORTED);
    }

    #[test]
    fn config_payload_follows_the_returned_treatment() {
        let storage = storage_with(
            r#"{
                "name":"flag","defaultTreatment":"off","seed":1,"changeNumber":7,
                "configurations":{"on":"{\"cta\":true}","off":"{\"cta\":false}"},
                "conditions":[{"label":"everyone",
                    "matcherGroup":{"combiner":"AND","matchers":[{"matcherType":"ALL_KEYS"}]},
                    "partitions":[{"treatment":"on","size":100}]}]
            }"#,
        );
        let snapshot = storage.snapshot();
        let result = evaluate(&snapshot, "flag", &Key::new("u"), None, 0);
        assert_eq!(result.treatment, "on");
        assert_eq!(result.config.as_deref(), Some("{\"cta\":true}"));
    }

    #[test]
    fn bucketing_key_drives_hashing_not_matching() {
        // The matching key stays fixed while a separate bucketing key is
        // supplied; repeated evaluations must be deterministic in it.
        let storage = storage_with(&simple_flag(""));
        let snapshot = storage.snapshot();
        let a = evaluate(
            &snapshot,
            "flag",
            &Key::with_bucketing("user", "bk-1"),
            None,
            0,
        );
        let b = evaluate(
            &snapshot,
            "flag",
            &Key::with_bucketing("user", "bk-1"),
            None,
            0,
        );
        assert_eq!(a, b, "same bucketing key must be deterministic");
    }
}
