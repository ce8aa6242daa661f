//! End-to-end evaluation behavior through the public API.
//!
//! Factories are built in localhost mode against a JSON flag file carrying
//! full definitions, so the whole path — storage, matchers, splitter,
//! impressions — is the production one, without network I/O.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

use flagkit::{build_factory, Impression, ImpressionListener, ImpressionsMode, Key, SdkConfig};
use tempfile::NamedTempFile;

#[derive(Default)]
struct Recorder(Mutex<Vec<Impression>>);

impl ImpressionListener for Recorder {
    fn log(&self, impression: &Impression) {
        self.0.lock().unwrap().push(impression.clone());
    }
}

impl Recorder {
    fn labels_for(&self, feature: &str) -> Vec<String> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.feature == feature)
            .map(|i| i.label.clone())
            .collect()
    }
}

const FLAGS: &str = r#"{
    "splits": [
        {
            "name": "whitelist_wins",
            "trafficTypeName": "user",
            "defaultTreatment": "off",
            "seed": 1833641400,
            "changeNumber": 100,
            "sets": ["checkout"],
            "conditions": [
                {
                    "label": "vip whitelist",
                    "matcherGroup": {
                        "combiner": "AND",
                        "matchers": [{
                            "matcherType": "WHITELIST",
                            "whitelistMatcherData": {"whitelist": ["alice"]}
                        }]
                    },
                    "partitions": [{"treatment": "on", "size": 100}]
                },
                {
                    "label": "default rule",
                    "matcherGroup": {
                        "combiner": "AND",
                        "matchers": [{"matcherType": "ALL_KEYS"}]
                    },
                    "partitions": [{"treatment": "off", "size": 100}]
                }
            ]
        },
        {
            "name": "killed_flag",
            "trafficTypeName": "user",
            "defaultTreatment": "off",
            "killed": true,
            "seed": 77,
            "changeNumber": 100,
            "conditions": [
                {
                    "label": "everyone on",
                    "matcherGroup": {
                        "combiner": "AND",
                        "matchers": [{"matcherType": "ALL_KEYS"}]
                    },
                    "partitions": [{"treatment": "on", "size": 100}]
                }
            ]
        },
        {
            "name": "one_percent_rollout",
            "trafficTypeName": "user",
            "defaultTreatment": "off",
            "trafficAllocation": 1,
            "trafficAllocationSeed": -1667452163,
            "seed": 1833641400,
            "changeNumber": 100,
            "conditions": [
                {
                    "label": "in rollout",
                    "matcherGroup": {
                        "combiner": "AND",
                        "matchers": [{"matcherType": "ALL_KEYS"}]
                    },
                    "partitions": [{"treatment": "on", "size": 100}]
                }
            ]
        },
        {
            "name": "base_flag",
            "trafficTypeName": "user",
            "defaultTreatment": "off",
            "seed": 12,
            "changeNumber": 100,
            "conditions": [
                {
                    "label": "whitelist",
                    "matcherGroup": {
                        "combiner": "AND",
                        "matchers": [{
                            "matcherType": "WHITELIST",
                            "whitelistMatcherData": {"whitelist": ["alice"]}
                        }]
                    },
                    "partitions": [{"treatment": "on", "size": 100}]
                }
            ]
        },
        {
            "name": "dependent_flag",
            "trafficTypeName": "user",
            "defaultTreatment": "off",
            "seed": 13,
            "changeNumber": 100,
            "sets": ["checkout"],
            "conditions": [
                {
                    "label": "parent is on",
                    "matcherGroup": {
                        "combiner": "AND",
                        "matchers": [{
                            "matcherType": "IN_SPLIT_TREATMENT",
                            "dependencyMatcherData": {"split": "base_flag", "treatments": ["on"]}
                        }]
                    },
                    "partitions": [{"treatment": "on", "size": 100}]
                }
            ]
        },
        {
            "name": "segment_gate",
            "trafficTypeName": "user",
            "defaultTreatment": "off",
            "seed": 14,
            "changeNumber": 100,
            "configurations": {"on": "{\"banner\":\"beta\"}"},
            "conditions": [
                {
                    "label": "in beta segment",
                    "matcherGroup": {
                        "combiner": "AND",
                        "matchers": [{
                            "matcherType": "IN_SEGMENT",
                            "userDefinedSegmentMatcherData": {"segmentName": "beta_testers"}
                        }]
                    },
                    "partitions": [{"treatment": "on", "size": 100}]
                }
            ]
        }
    ],
    "segments": [{"name": "beta_testers", "keys": ["alice", "dave"]}]
}"#;

struct Setup {
    factory: flagkit::SplitFactory,
    recorder: Arc<Recorder>,
    _file: NamedTempFile,
}

async fn setup() -> Setup {
    let mut file = tempfile::Builder::new()
        .suffix(".json")
        .tempfile()
        .expect("temp flag file");
    file.write_all(FLAGS.as_bytes()).expect("write flags");

    let recorder = Arc::new(Recorder::default());
    let config = SdkConfig {
        localhost_file: Some(file.path().display().to_string()),
        impressions_mode: ImpressionsMode::Debug,
        impression_listener: Some(recorder.clone()),
        ..SdkConfig::default()
    };
    let factory = build_factory("localhost", config).await.expect("factory");
    factory.block_until_ready(1_000).await.expect("ready");
    Setup {
        factory,
        recorder,
        _file: file,
    }
}

async fn drain_listener() {
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
}

#[tokio::test]
async fn whitelist_wins_over_percentage_rule() {
    let setup = setup().await;
    let client = setup.factory.client();

    assert_eq!(client.get_treatment("alice", "whitelist_wins", None), "on");
    assert_eq!(client.get_treatment("bob", "whitelist_wins", None), "off");

    drain_listener().await;
    let labels = setup.recorder.labels_for("whitelist_wins");
    assert_eq!(labels, vec!["vip whitelist".to_string(), "default rule".to_string()]);
    setup.factory.destroy().await;
}

#[tokio::test]
async fn killed_flag_returns_default_with_killed_label() {
    let setup = setup().await;
    let client = setup.factory.client();

    assert_eq!(client.get_treatment("alice", "killed_flag", None), "off");

    drain_listener().await;
    assert_eq!(setup.recorder.labels_for("killed_flag"), vec!["killed".to_string()]);
    setup.factory.destroy().await;
}

#[tokio::test]
async fn traffic_allocation_excludes_out_of_rollout_keys() {
    let setup = setup().await;
    let client = setup.factory.client();

    assert_eq!(client.get_treatment("aaaaa", "one_percent_rollout", None), "off");

    drain_listener().await;
    assert_eq!(
        setup.recorder.labels_for("one_percent_rollout"),
        vec!["not in split".to_string()]
    );

    // With a 1% allocation, a spread of keys must land overwhelmingly on
    // the default side; every returned treatment stays within the flag's
    // treatment set.
    let mut on_count = 0;
    for i in 0..200 {
        let treatment = client.get_treatment(format!("user-{i}"), "one_percent_rollout", None);
        assert!(treatment == "on" || treatment == "off");
        if treatment == "on" {
            on_count += 1;
        }
    }
    assert!(on_count < 20, "1% rollout admitted {on_count}/200 keys");
    setup.factory.destroy().await;
}

#[tokio::test]
async fn dependency_matcher_follows_parent_flag() {
    let setup = setup().await;
    let client = setup.factory.client();

    assert_eq!(client.get_treatment("alice", "dependent_flag", None), "on");
    assert_eq!(client.get_treatment("bob", "dependent_flag", None), "off");
    setup.factory.destroy().await;
}

#[tokio::test]
async fn segment_membership_gates_with_config_payload() {
    let setup = setup().await;
    let client = setup.factory.client();

    let (treatment, config) = client.get_treatment_with_config("alice", "segment_gate", None);
    assert_eq!(treatment, "on");
    assert_eq!(config.as_deref(), Some("{\"banner\":\"beta\"}"));

    let (treatment, config) = client.get_treatment_with_config("mallory", "segment_gate", None);
    assert_eq!(treatment, "off");
    assert_eq!(config, None);
    setup.factory.destroy().await;
}

#[tokio::test]
async fn unknown_flag_returns_control_without_impression() {
    let setup = setup().await;
    let client = setup.factory.client();

    assert_eq!(client.get_treatment("alice", "no_such_flag", None), "control");

    drain_listener().await;
    assert!(setup.recorder.labels_for("no_such_flag").is_empty());
    setup.factory.destroy().await;
}

#[tokio::test]
async fn invalid_keys_return_control_without_impression() {
    let setup = setup().await;
    let client = setup.factory.client();

    assert_eq!(client.get_treatment("", "whitelist_wins", None), "control");
    assert_eq!(client.get_treatment("   ", "whitelist_wins", None), "control");
    assert_eq!(
        client.get_treatment("k".repeat(251), "whitelist_wins", None),
        "control"
    );
    assert_eq!(client.get_treatment("alice", "   ", None), "control");

    drain_listener().await;
    assert!(setup.recorder.0.lock().unwrap().is_empty());
    setup.factory.destroy().await;
}

#[tokio::test]
async fn multi_flag_calls_match_single_flag_results() {
    let setup = setup().await;
    let client = setup.factory.client();

    let features = ["whitelist_wins", "killed_flag", "dependent_flag", "segment_gate"];
    let many = client.get_treatments("alice", &features, None);
    assert_eq!(many.len(), features.len());
    for feature in features {
        assert_eq!(
            many[feature],
            client.get_treatment("alice", feature, None),
            "mismatch for {feature}"
        );
    }
    setup.factory.destroy().await;
}

#[tokio::test]
async fn flag_set_evaluation_covers_tagged_flags() {
    let setup = setup().await;
    let client = setup.factory.client();

    let by_set = client.get_treatments_by_flag_set("alice", "checkout", None);
    let mut names: Vec<&str> = by_set.keys().map(String::as_str).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["dependent_flag", "whitelist_wins"]);
    assert_eq!(by_set["whitelist_wins"], "on");
    assert_eq!(by_set["dependent_flag"], "on");

    assert!(client
        .get_treatments_by_flag_set("alice", "no_such_set", None)
        .is_empty());

    let by_sets = client.get_treatments_by_flag_sets("bob", &["checkout"], None);
    assert_eq!(by_sets["whitelist_wins"], "off");
    setup.factory.destroy().await;
}

#[tokio::test]
async fn bucketing_key_changes_hashing_but_not_matching() {
    let setup = setup().await;
    let client = setup.factory.client();

    // Whitelist matching uses the matching key even when a separate
    // bucketing key is supplied.
    let key = Key::with_bucketing("alice", "some-account");
    assert_eq!(client.get_treatment(key, "whitelist_wins", None), "on");
    setup.factory.destroy().await;
}

#[tokio::test]
async fn attributes_drive_attribute_matchers() {
    // Attribute matchers through the public API, with a numeric rule added
    // on the fly via a second flag file.
    let mut file = tempfile::Builder::new()
        .suffix(".json")
        .tempfile()
        .expect("temp flag file");
    file.write_all(
        br#"{"splits": [{
            "name": "adults_only",
            "trafficTypeName": "user",
            "defaultTreatment": "off",
            "seed": 9,
            "changeNumber": 1,
            "conditions": [{
                "label": "of age",
                "matcherGroup": {
                    "combiner": "AND",
                    "matchers": [{
                        "matcherType": "GREATER_THAN_OR_EQUAL_TO",
                        "keySelector": {"attribute": "age"},
                        "unaryNumericMatcherData": {"dataType": "NUMBER", "value": 18}
                    }]
                },
                "partitions": [{"treatment": "on", "size": 100}]
            }]
        }]}"#,
    )
    .expect("write");

    let config = SdkConfig {
        localhost_file: Some(file.path().display().to_string()),
        ..SdkConfig::default()
    };
    let factory = build_factory("localhost", config).await.expect("factory");

    let client = factory.client();
    let mut attrs: HashMap<String, serde_json::Value> = HashMap::new();
    attrs.insert("age".to_string(), serde_json::json!(21));
    assert_eq!(client.get_treatment("u", "adults_only", Some(&attrs)), "on");

    attrs.insert("age".to_string(), serde_json::json!(15));
    assert_eq!(client.get_treatment("u", "adults_only", Some(&attrs)), "off");
    assert_eq!(client.get_treatment("u", "adults_only", None), "off");
    factory.destroy().await;
}
