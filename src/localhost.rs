//! Offline (localhost) mode: no network I/O, flag definitions come from a
//! local file.
//!
//! Three formats are accepted, chosen by file extension:
//! - plain text (the default `$HOME/.split`): `# comment` lines and
//!   `feature treatment` pairs, one per line;
//! - YAML: a list of `feature: {treatment, keys?, config?}` entries where
//!   keyed entries become whitelists ahead of the catch-all;
//! - JSON: full flag definitions, optionally with segment member lists.
//!
//! The file is re-read on every refresh tick whose mtime differs from the
//! last load.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Deserialize;
use tokio::sync::watch;

use crate::config::SdkConfig;
use crate::error::SdkError;
use crate::storage::InMemoryStorage;
use crate::types::{
    Condition, HashAlgorithm, MatcherDef, MatcherGroup, Partition, Split, SplitStatus,
    WhitelistMatcherData, CONTROL,
};

/// Flag file location: explicit config wins, then `$HOME/.split`.
pub(crate) fn resolve_path(config: &SdkConfig) -> PathBuf {
    match &config.localhost_file {
        Some(path) => PathBuf::from(path),
        None => std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_default()
            .join(".split"),
    }
}

/// Parsed content of a localhost flag file.
#[derive(Debug, Default)]
pub(crate) struct LocalhostData {
    pub splits: Vec<Split>,
    pub segments: Vec<(String, Vec<String>)>,
}

/// Replace storage contents with the file's definitions.
pub(crate) async fn load_into_storage(
    path: &Path,
    storage: &InMemoryStorage,
) -> Result<(), SdkError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| SdkError::LocalhostFile {
            path: path.display().to_string(),
            source,
        })?;
    let mut data = parse_file(path, &content)?;

    let stamp = chrono::Utc::now().timestamp_millis();
    for split in &mut data.splits {
        split.change_number = stamp;
    }
    storage.clear();
    for (name, keys) in data.segments {
        storage.update_segment(&name, &keys, &[], stamp);
    }
    storage.update_splits(data.splits, stamp);
    Ok(())
}

/// Reload the file whenever its mtime moves.
pub(crate) async fn file_watcher(
    path: PathBuf,
    storage: Arc<InMemoryStorage>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut last_mtime = mtime_of(&path).await;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }
        let mtime = mtime_of(&path).await;
        if mtime == last_mtime {
            continue;
        }
        last_mtime = mtime;
        match load_into_storage(&path, &storage).await {
            Ok(()) => tracing::info!(path = %path.display(), "localhost flag file reloaded"),
            Err(error) => {
                tracing::warn!(%error, "localhost flag file reload failed, keeping previous flags")
            }
        }
    }
}

async fn mtime_of(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

pub(crate) fn parse_file(path: &Path, content: &str) -> Result<LocalhostData, SdkError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => parse_yaml(content),
        Some("json") => parse_json(content),
        _ => parse_plain(content),
    }
}

// ── Plain `feature treatment` format ────────────────────────────────────

fn parse_plain(content: &str) -> Result<LocalhostData, SdkError> {
    let mut splits = Vec::new();
    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(feature), Some(treatment)) = (fields.next(), fields.next()) else {
            tracing::warn!(line = number + 1, "ignoring malformed localhost line");
            continue;
        };
        if fields.next().is_some() {
            tracing::warn!(line = number + 1, "ignoring trailing fields on localhost line");
        }
        splits.push(offline_split(
            feature,
            treatment.to_string(),
            vec![all_keys_condition(treatment.to_string())],
            None,
        ));
    }
    Ok(LocalhostData {
        splits,
        segments: Vec::new(),
    })
}

// ── YAML format ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct YamlEntry {
    treatment: String,
    #[serde(default)]
    keys: Option<YamlKeys>,
    #[serde(default)]
    config: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum YamlKeys {
    One(String),
    Many(Vec<String>),
}

impl YamlKeys {
    fn into_vec(self) -> Vec<String> {
        match self {
            YamlKeys::One(key) => vec![key],
            YamlKeys::Many(keys) => keys,
        }
    }
}

fn parse_yaml(content: &str) -> Result<LocalhostData, SdkError> {
    let entries: Vec<HashMap<String, YamlEntry>> =
        serde_yaml::from_str(content).map_err(|e| SdkError::LocalhostParse(e.to_string()))?;

    struct Builder {
        whitelists: Vec<Condition>,
        catch_all: Option<Condition>,
        default_treatment: String,
        configs: HashMap<String, String>,
    }

    let mut order: Vec<String> = Vec::new();
    let mut builders: HashMap<String, Builder> = HashMap::new();
    for entry in entries {
        for (feature, rule) in entry {
            let builder = builders.entry(feature.clone()).or_insert_with(|| {
                order.push(feature.clone());
                Builder {
                    whitelists: Vec::new(),
                    catch_all: None,
                    default_treatment: CONTROL.to_string(),
                    configs: HashMap::new(),
                }
            });
            if let Some(config) = rule.config {
                builder.configs.insert(rule.treatment.clone(), config);
            }
            match rule.keys {
                Some(keys) => builder
                    .whitelists
                    .push(whitelist_condition(keys.into_vec(), rule.treatment)),
                None => {
                    builder.default_treatment = rule.treatment.clone();
                    builder.catch_all = Some(all_keys_condition(rule.treatment));
                }
            }
        }
    }

    let splits = order
        .into_iter()
        .map(|feature| {
            let builder = builders.remove(&feature).expect("builder exists");
            let mut conditions = builder.whitelists;
            conditions.extend(builder.catch_all);
            let configs = (!builder.configs.is_empty()).then_some(builder.configs);
            offline_split(&feature, builder.default_treatment, conditions, configs)
        })
        .collect();
    Ok(LocalhostData {
        splits,
        segments: Vec::new(),
    })
}

// ── JSON format: full definitions ───────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JsonFile {
    Bare(Vec<Split>),
    Wrapped {
        splits: Vec<Split>,
        #[serde(default)]
        segments: Vec<JsonSegment>,
    },
}

#[derive(Debug, Deserialize)]
struct JsonSegment {
    name: String,
    #[serde(default)]
    keys: Vec<String>,
}

fn parse_json(content: &str) -> Result<LocalhostData, SdkError> {
    let file: JsonFile =
        serde_json::from_str(content).map_err(|e| SdkError::LocalhostParse(e.to_string()))?;
    Ok(match file {
        JsonFile::Bare(splits) => LocalhostData {
            splits,
            segments: Vec::new(),
        },
        JsonFile::Wrapped { splits, segments } => LocalhostData {
            splits,
            segments: segments.into_iter().map(|s| (s.name, s.keys)).collect(),
        },
    })
}

// ── Definition builders ─────────────────────────────────────────────────

fn offline_split(
    name: &str,
    default_treatment: String,
    conditions: Vec<Condition>,
    configurations: Option<HashMap<String, String>>,
) -> Split {
    Split {
        name: name.to_string(),
        traffic_type_name: Some("user".to_string()),
        status: SplitStatus::Active,
        killed: false,
        default_treatment,
        traffic_allocation: 100,
        traffic_allocation_seed: 0,
        algo: HashAlgorithm::Murmur3,
        seed: 0,
        change_number: 0,
        sets: Vec::new(),
        conditions,
        configurations,
    }
}

fn all_keys_condition(treatment: String) -> Condition {
    Condition {
        label: "default rule".to_string(),
        matcher_group: MatcherGroup {
            combiner: Default::default(),
            matchers: vec![MatcherDef {
                matcher_type: "ALL_KEYS".to_string(),
                ..Default::default()
            }],
        },
        partitions: vec![Partition {
            treatment,
            size: 100,
        }],
    }
}

fn whitelist_condition(keys: Vec<String>, treatment: String) -> Condition {
    Condition {
        label: "whitelisted".to_string(),
        matcher_group: MatcherGroup {
            combiner: Default::default(),
            matchers: vec![MatcherDef {
                matcher_type: "WHITELIST".to_string(),
                whitelist_matcher_data: Some(WhitelistMatcherData { whitelist: keys }),
                ..Default::default()
            }],
        },
        partitions: vec![Partition {
            treatment,
            size: 100,
        }],
    }
}
