//! Data model shared by the evaluator, storage, and sync layers.
//!
//! Everything here is plain serde-friendly data: flag definitions arrive as
//! JSON from the flag feed and are stored verbatim, so matchers are literal
//! parameters dispatched by tag rather than linked code.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;

/// The sentinel treatment returned when no evaluation can be performed.
pub const CONTROL: &str = "control";

/// Hashing algorithm selector carried by each flag definition.
///
/// On the wire this is an integer: `1` for the legacy checksum, `2` for
/// murmur3 32-bit. Unknown values fall back to legacy, matching the oldest
/// deployed definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashAlgorithm {
    Legacy,
    #[default]
    Murmur3,
}

impl Serialize for HashAlgorithm {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let code: u8 = match self {
            HashAlgorithm::Legacy => 1,
            HashAlgorithm::Murmur3 => 2,
        };
        serializer.serialize_u8(code)
    }
}

impl<'de> Deserialize<'de> for HashAlgorithm {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        Ok(match code {
            2 => HashAlgorithm::Murmur3,
            _ => HashAlgorithm::Legacy,
        })
    }
}

/// Lifecycle status of a flag definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SplitStatus {
    Active,
    Archived,
}

/// A feature flag definition as stored and evaluated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Split {
    pub name: String,
    #[serde(default)]
    pub traffic_type_name: Option<String>,
    #[serde(default = "Split::default_status")]
    pub status: SplitStatus,
    #[serde(default)]
    pub killed: bool,
    pub default_treatment: String,
    /// Percentage of traffic eligible for rollout conditions, 0..=100.
    #[serde(default = "Split::default_traffic_allocation")]
    pub traffic_allocation: i64,
    #[serde(default)]
    pub traffic_allocation_seed: i64,
    #[serde(default)]
    pub algo: HashAlgorithm,
    pub seed: i64,
    pub change_number: i64,
    /// Flag-set tags this flag belongs to.
    #[serde(default)]
    pub sets: Vec<String>,
    pub conditions: Vec<Condition>,
    /// Per-treatment opaque configuration payloads.
    #[serde(default)]
    pub configurations: Option<HashMap<String, String>>,
}

impl Split {
    fn default_status() -> SplitStatus {
        SplitStatus::Active
    }

    fn default_traffic_allocation() -> i64 {
        100
    }

    /// Configuration payload for a treatment, if the flag defines one.
    pub fn config_for(&self, treatment: &str) -> Option<&str> {
        self.configurations
            .as_ref()
            .and_then(|c| c.get(treatment))
            .map(String::as_str)
    }

    /// Names of the segments referenced by this flag's matchers.
    pub fn referenced_segments(&self) -> impl Iterator<Item = &str> {
        self.conditions
            .iter()
            .flat_map(|c| c.matcher_group.matchers.iter())
            .filter_map(|m| m.segment_name())
    }
}

/// One targeting rule: an AND-combined matcher group plus the partitions
/// that split matching traffic into treatments.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub label: String,
    pub matcher_group: MatcherGroup,
    pub partitions: Vec<Partition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatcherGroup {
    #[serde(default)]
    pub combiner: Combiner,
    pub matchers: Vec<MatcherDef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Combiner {
    #[default]
    #[serde(rename = "AND")]
    And,
}

/// (treatment, weight) pair. Weights within a condition sum to 100.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Partition {
    pub treatment: String,
    pub size: i64,
}

/// Which value a matcher reads: the key itself, or a named attribute.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySelector {
    #[serde(default)]
    pub traffic_type: Option<String>,
    #[serde(default)]
    pub attribute: Option<String>,
}

/// A matcher definition: a tag plus whichever literal-parameter block the
/// tag uses. The tag stays a plain string so definitions with matcher types
/// this SDK does not know survive deserialization and can degrade cleanly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatcherDef {
    #[serde(default)]
    pub key_selector: Option<KeySelector>,
    pub matcher_type: String,
    #[serde(default)]
    pub negate: bool,
    #[serde(default)]
    pub user_defined_segment_matcher_data: Option<SegmentMatcherData>,
    #[serde(default)]
    pub whitelist_matcher_data: Option<WhitelistMatcherData>,
    #[serde(default)]
    pub unary_numeric_matcher_data: Option<UnaryNumericMatcherData>,
    #[serde(default)]
    pub between_matcher_data: Option<BetweenMatcherData>,
    #[serde(default)]
    pub dependency_matcher_data: Option<DependencyMatcherData>,
    #[serde(default)]
    pub boolean_matcher_data: Option<bool>,
    #[serde(default)]
    pub string_matcher_data: Option<String>,
    #[serde(default)]
    pub between_string_matcher_data: Option<BetweenStringMatcherData>,
}

impl MatcherDef {
    /// Attribute this matcher reads, when it targets one instead of the key.
    pub fn attribute(&self) -> Option<&str> {
        self.key_selector
            .as_ref()
            .and_then(|s| s.attribute.as_deref())
    }

    /// Segment name for segment-membership matchers.
    pub fn segment_name(&self) -> Option<&str> {
        self.user_defined_segment_matcher_data
            .as_ref()
            .map(|d| d.segment_name.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentMatcherData {
    pub segment_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhitelistMatcherData {
    pub whitelist: Vec<String>,
}

/// Value type tag for numeric/date matcher literals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataType {
    #[default]
    Number,
    Datetime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnaryNumericMatcherData {
    #[serde(default)]
    pub data_type: DataType,
    pub value: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BetweenMatcherData {
    #[serde(default)]
    pub data_type: DataType,
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyMatcherData {
    pub split: String,
    pub treatments: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BetweenStringMatcherData {
    pub start: String,
    pub end: String,
}

/// Evaluation key: the matching key drives matcher evaluation, the bucketing
/// key drives hash-to-bucket assignment. When no bucketing key is given the
/// matching key is used for both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key {
    pub matching: String,
    pub bucketing: Option<String>,
}

impl Key {
    pub fn new(matching: impl Into<String>) -> Self {
        Self {
            matching: matching.into(),
            bucketing: None,
        }
    }

    pub fn with_bucketing(matching: impl Into<String>, bucketing: impl Into<String>) -> Self {
        Self {
            matching: matching.into(),
            bucketing: Some(bucketing.into()),
        }
    }

    pub fn bucketing_key(&self) -> &str {
        self.bucketing.as_deref().unwrap_or(&self.matching)
    }
}

impl From<&str> for Key {
    fn from(matching: &str) -> Self {
        Key::new(matching)
    }
}

impl From<String> for Key {
    fn from(matching: String) -> Self {
        Key::new(matching)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.matching)
    }
}

/// Attribute map supplied alongside an evaluation key.
pub type Attributes = HashMap<String, JsonValue>;

/// Outcome of a single flag evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub treatment: String,
    pub label: String,
    pub change_number: i64,
    pub config: Option<String>,
}

impl Evaluation {
    pub fn control(label: impl Into<String>) -> Self {
        Self {
            treatment: CONTROL.to_string(),
            label: label.into(),
            change_number: -1,
            config: None,
        }
    }
}

/// Record of one evaluation outcome, queued for delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Impression {
    pub feature: String,
    pub key_name: String,
    #[serde(default)]
    pub bucketing_key: Option<String>,
    pub treatment: String,
    pub label: String,
    pub change_number: i64,
    /// Unix epoch millis at evaluation time.
    pub time: i64,
    /// Last time the same (feature, key) pair produced the same treatment.
    #[serde(default)]
    pub previous_time: Option<i64>,
}

/// Value types permitted inside event properties.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

/// Application-emitted tracking record, unrelated to flag evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub key: String,
    pub traffic_type_name: String,
    pub event_type_id: String,
    #[serde(default)]
    pub value: Option<f64>,
    pub timestamp: i64,
    #[serde(default)]
    pub properties: Option<HashMap<String, PropertyValue>>,
}

/// Read-only view of one flag definition, exposed through the manager.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SplitView {
    pub name: String,
    pub traffic_type: Option<String>,
    pub killed: bool,
    pub treatments: Vec<String>,
    pub change_number: i64,
    pub has_configurations: bool,
    pub default_treatment: String,
    pub sets: Vec<String>,
}

impl SplitView {
    pub fn from_split(split: &Split) -> Self {
        let mut treatments: Vec<String> = Vec::new();
        for condition in &split.conditions {
            for partition in &condition.partitions {
                if !treatments.contains(&partition.treatment) {
                    treatments.push(partition.treatment.clone());
                }
            }
        }
        Self {
            name: split.name.clone(),
            traffic_type: split.traffic_type_name.clone(),
            killed: split.killed,
            treatments,
            change_number: split.change_number,
            has_configurations: split
                .configurations
                .as_ref()
                .is_some_and(|c| !c.is_empty()),
            default_treatment: split.default_treatment.clone(),
            sets: split.sets.clone(),
        }
    }
}

// ── Wire DTOs for the sync feeds ────────────────────────────────────────

/// Response body of `GET /splitChanges?since={cn}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitChanges {
    pub ff: FeatureFlagChanges,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlagChanges {
    /// Flag definitions changed since `s`.
    #[serde(default)]
    pub d: Vec<Split>,
    /// The `since` this delta was computed from.
    pub s: i64,
    /// New change number; resend as the next `since`.
    pub t: i64,
}

/// Response body of `GET /segmentChanges/{name}?since={cn}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentChanges {
    pub name: String,
    #[serde(default)]
    pub added: Vec<String>,
    #[serde(default)]
    pub removed: Vec<String>,
    pub since: i64,
    pub till: i64,
}
