//! Matcher evaluation: predicates over (key, attributes, storage view).
//!
//! Matchers arrive as data — a tag plus literal parameters — and are
//! dispatched here by tag. Evaluation is a pure function of the context;
//! negation is applied after the underlying predicate, and a missing or
//! uncoercible attribute makes the underlying predicate false.

use std::collections::HashSet;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use semver::{BuildMetadata, Version};
use serde_json::Value as JsonValue;

use crate::evaluator;
use crate::storage::Snapshot;
use crate::types::{Attributes, DataType, Key, MatcherDef};

/// Everything a matcher may consult.
pub(crate) struct MatchContext<'a> {
    pub key: &'a Key,
    pub attributes: Option<&'a Attributes>,
    pub snapshot: &'a Snapshot<'a>,
    /// Dependency-matcher recursion depth of the enclosing evaluation.
    pub depth: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum MatcherError {
    /// The definition carries a matcher tag this SDK does not implement.
    Unsupported(String),
}

/// Evaluate one matcher definition, negation included.
pub(crate) fn evaluate(def: &MatcherDef, ctx: &MatchContext<'_>) -> Result<bool, MatcherError> {
    let raw = evaluate_inner(def, ctx)?;
    Ok(raw != def.negate)
}

fn evaluate_inner(def: &MatcherDef, ctx: &MatchContext<'_>) -> Result<bool, MatcherError> {
    let matched = match def.matcher_type.as_str() {
        "ALL_KEYS" => true,
        "IN_SEGMENT" | "IN_LARGE_SEGMENT" => match (def.segment_name(), operand_string(def, ctx))
        {
            (Some(segment), Some(value)) => ctx.snapshot.segment_contains(segment, &value),
            _ => false,
        },
        "WHITELIST" => match operand_string(def, ctx) {
            Some(value) => whitelist(def).iter().any(|w| *w == value),
            None => false,
        },
        "EQUAL_TO" => unary_numeric(def, ctx, |value, literal| value == literal),
        "GREATER_THAN_OR_EQUAL_TO" => unary_numeric(def, ctx, |value, literal| value >= literal),
        "LESS_THAN_OR_EQUAL_TO" => unary_numeric(def, ctx, |value, literal| value <= literal),
        "BETWEEN" => match (&def.between_matcher_data, operand_number(def, ctx)) {
            (Some(data), Some(value)) => {
                let value = coerce_datetime(value, data.data_type);
                value >= coerce_datetime(data.start, data.data_type)
                    && value <= coerce_datetime(data.end, data.data_type)
            }
            _ => false,
        },
        "STARTS_WITH" => string_any(def, ctx, |value, lit| value.starts_with(lit)),
        "ENDS_WITH" => string_any(def, ctx, |value, lit| value.ends_with(lit)),
        "CONTAINS_STRING" => string_any(def, ctx, |value, lit| value.contains(lit)),
        "CONTAINS_ANY_OF_SET" => set_compare(def, ctx, |value, lit| !value.is_disjoint(lit)),
        "CONTAINS_ALL_OF_SET" => set_compare(def, ctx, |value, lit| lit.is_subset(value)),
        "EQUAL_TO_SET" => set_compare(def, ctx, |value, lit| value == lit),
        "PART_OF_SET" => set_compare(def, ctx, |value, lit| !value.is_empty() && value.is_subset(lit)),
        "MATCHES_STRING" => match (&def.string_matcher_data, operand_string(def, ctx)) {
            (Some(pattern), Some(value)) => regex_matches(pattern, &value),
            _ => false,
        },
        "EQUAL_TO_BOOLEAN" => match (def.boolean_matcher_data, operand_bool(def, ctx)) {
            (Some(literal), Some(value)) => value == literal,
            _ => false,
        },
        "EQUAL_TO_SEMVER" => semver_compare(def, ctx, |value, lit| value == lit),
        "GREATER_THAN_OR_EQUAL_TO_SEMVER" => semver_compare(def, ctx, |value, lit| value >= lit),
        "LESS_THAN_OR_EQUAL_TO_SEMVER" => semver_compare(def, ctx, |value, lit| value <= lit),
        "BETWEEN_SEMVER" => match (&def.between_string_matcher_data, operand_semver(def, ctx)) {
            (Some(data), Some(value)) => match (parse_semver(&data.start), parse_semver(&data.end))
            {
                (Some(start), Some(end)) => value >= start && value <= end,
                _ => false,
            },
            _ => false,
        },
        "IN_LIST_SEMVER" => match operand_semver(def, ctx) {
            Some(value) => whitelist(def)
                .iter()
                .filter_map(|raw| parse_semver(raw))
                .any(|lit| lit == value),
            None => false,
        },
        "IN_SPLIT_TREATMENT" => in_split_treatment(def, ctx),
        other => return Err(MatcherError::Unsupported(other.to_string())),
    };
    Ok(matched)
}

// ── Operand resolution ──────────────────────────────────────────────────

fn operand<'a>(def: &MatcherDef, ctx: &'a MatchContext<'_>) -> Option<Operand<'a>> {
    match def.attribute() {
        None => Some(Operand::Key(&ctx.key.matching)),
        Some(name) => ctx
            .attributes
            .and_then(|attrs| attrs.get(name))
            .map(Operand::Attr),
    }
}

enum Operand<'a> {
    Key(&'a str),
    Attr(&'a JsonValue),
}

fn operand_string(def: &MatcherDef, ctx: &MatchContext<'_>) -> Option<String> {
    match operand(def, ctx)? {
        Operand::Key(key) => Some(key.to_string()),
        Operand::Attr(JsonValue::String(s)) => Some(s.clone()),
        Operand::Attr(JsonValue::Number(n)) => n.as_i64().map(|v| v.to_string()),
        Operand::Attr(_) => None,
    }
}

fn operand_number(def: &MatcherDef, ctx: &MatchContext<'_>) -> Option<i64> {
    match operand(def, ctx)? {
        Operand::Attr(JsonValue::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        // Keys are strings; numeric matchers only apply to numeric attributes.
        Operand::Key(_) | Operand::Attr(_) => None,
    }
}

fn operand_bool(def: &MatcherDef, ctx: &MatchContext<'_>) -> Option<bool> {
    match operand(def, ctx)? {
        Operand::Attr(JsonValue::Bool(b)) => Some(*b),
        Operand::Attr(JsonValue::String(s)) => match s.to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        Operand::Key(key) => match key.to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        Operand::Attr(_) => None,
    }
}

fn operand_set(def: &MatcherDef, ctx: &MatchContext<'_>) -> Option<HashSet<String>> {
    match operand(def, ctx)? {
        Operand::Attr(JsonValue::Array(items)) => items
            .iter()
            .map(|item| match item {
                JsonValue::String(s) => Some(s.clone()),
                _ => None,
            })
            .collect(),
        Operand::Attr(JsonValue::String(s)) => Some(HashSet::from([s.clone()])),
        _ => None,
    }
}

fn operand_semver(def: &MatcherDef, ctx: &MatchContext<'_>) -> Option<Version> {
    operand_string(def, ctx).and_then(|raw| parse_semver(&raw))
}

// ── Predicate helpers ───────────────────────────────────────────────────

fn whitelist(def: &MatcherDef) -> &[String] {
    match &def.whitelist_matcher_data {
        Some(data) => data.whitelist.as_slice(),
        None => &[],
    }
}

fn unary_numeric(def: &MatcherDef, ctx: &MatchContext<'_>, cmp: fn(i64, i64) -> bool) -> bool {
    let (Some(data), Some(value)) = (&def.unary_numeric_matcher_data, operand_number(def, ctx))
    else {
        return false;
    };
    cmp(
        coerce_datetime(value, data.data_type),
        coerce_datetime(data.value, data.data_type),
    )
}

/// Date comparisons are standardized to minute boundaries by the backend.
fn coerce_datetime(millis: i64, data_type: DataType) -> i64 {
    match data_type {
        DataType::Number => millis,
        DataType::Datetime => (millis / 60_000) * 60_000,
    }
}

fn string_any(def: &MatcherDef, ctx: &MatchContext<'_>, pred: fn(&str, &str) -> bool) -> bool {
    let Some(value) = operand_string(def, ctx) else {
        return false;
    };
    whitelist(def).iter().any(|lit| pred(&value, lit))
}

fn set_compare(
    def: &MatcherDef,
    ctx: &MatchContext<'_>,
    pred: fn(&HashSet<String>, &HashSet<String>) -> bool,
) -> bool {
    let Some(value) = operand_set(def, ctx) else {
        return false;
    };
    let literal: HashSet<String> = whitelist(def).iter().cloned().collect();
    pred(&value, &literal)
}

/// Build metadata is ignored in semver ordering; strip it before any
/// comparison. Unparseable versions make the matcher false.
fn parse_semver(raw: &str) -> Option<Version> {
    Version::parse(raw.trim()).ok().map(|mut version| {
        version.build = BuildMetadata::EMPTY;
        version
    })
}

fn semver_compare(
    def: &MatcherDef,
    ctx: &MatchContext<'_>,
    cmp: fn(&Version, &Version) -> bool,
) -> bool {
    let (Some(raw), Some(value)) = (&def.string_matcher_data, operand_semver(def, ctx)) else {
        return false;
    };
    match parse_semver(raw) {
        Some(literal) => cmp(&value, &literal),
        None => false,
    }
}

fn in_split_treatment(def: &MatcherDef, ctx: &MatchContext<'_>) -> bool {
    let Some(data) = &def.dependency_matcher_data else {
        return false;
    };
    if ctx.depth >= evaluator::MAX_DEPENDENCY_DEPTH {
        tracing::warn!(
            split = %data.split,
            "dependency matcher recursion limit reached, returning no match"
        );
        return false;
    }
    let result = evaluator::evaluate(
        ctx.snapshot,
        &data.split,
        ctx.key,
        ctx.attributes,
        ctx.depth + 1,
    );
    data.treatments.iter().any(|t| *t == result.treatment)
}

// Compiled patterns are cached per process; a pattern that fails to compile
// is remembered as broken so the warning fires once.
static REGEX_CACHE: Lazy<DashMap<String, Option<Regex>>> = Lazy::new(DashMap::new);

fn regex_matches(pattern: &str, value: &str) -> bool {
    let compiled = REGEX_CACHE
        .entry(pattern.to_string())
        .or_insert_with(|| match Regex::new(pattern) {
            Ok(regex) => Some(regex),
            Err(error) => {
                tracing::warn!(%pattern, %error, "unparseable regex in matcher, treating as no match");
                None
            }
        });
    compiled
        .value()
        .as_ref()
        .is_some_and(|regex| regex.is_match(value))
}
