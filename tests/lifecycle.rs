//! Factory lifecycle: readiness gating, duplicate registration, destroy
//! semantics, and track validation through the public API.

use std::io::Write;
use std::sync::{Arc, Mutex};

use flagkit::{
    build_factory, Impression, ImpressionListener, ImpressionsMode, SdkConfig, SdkError,
};

fn localhost_config(file: &tempfile::NamedTempFile) -> SdkConfig {
    SdkConfig {
        localhost_file: Some(file.path().display().to_string()),
        ..SdkConfig::default()
    }
}

fn flag_file(lines: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".split")
        .tempfile()
        .expect("temp file");
    file.write_all(lines.as_bytes()).expect("write");
    file
}

#[tokio::test]
async fn destroyed_factory_degrades_every_call() {
    let file = flag_file("feature on\n");
    let factory = build_factory("localhost", localhost_config(&file))
        .await
        .expect("factory");
    let client = factory.client();
    let manager = factory.manager();
    assert_eq!(client.get_treatment("u", "feature", None), "on");

    factory.destroy().await;

    assert_eq!(client.get_treatment("u", "feature", None), "control");
    assert!(client.get_treatments("u", &["feature"], None)["feature"] == "control");
    assert!(!client.track("u", "user", "click", None, None));
    assert!(manager.split_names().is_empty());
    assert!(manager.split("feature").is_none());
    assert!(matches!(
        factory.block_until_ready(10).await,
        Err(SdkError::Destroyed)
    ));

    // Destroy is idempotent.
    factory.destroy().await;
}

#[tokio::test]
async fn not_ready_factory_returns_control_and_ready_times_out() {
    // Network mode against a dead endpoint: the first sync can never
    // complete, so the readiness gate must hold.
    let config = SdkConfig {
        sdk_api_base_url: "http://127.0.0.1:1/api".to_string(),
        events_api_base_url: "http://127.0.0.1:1/api".to_string(),
        auth_api_base_url: "http://127.0.0.1:1/api/v2/auth".to_string(),
        streaming_api_base_url: "http://127.0.0.1:1/sse".to_string(),
        streaming_enabled: false,
        connection_timeout_ms: 100,
        read_timeout_ms: 100,
        ..SdkConfig::default()
    };
    let factory = build_factory("sdk-key-unreachable", config)
        .await
        .expect("factory builds in background");

    assert!(!factory.is_ready());
    let client = factory.client();
    assert_eq!(client.get_treatment("u", "anything", None), "control");
    assert!(matches!(
        factory.block_until_ready(200).await,
        Err(SdkError::ReadyTimeout(200))
    ));

    factory.destroy().await;
}

#[tokio::test]
async fn ready_config_failure_surfaces_from_build() {
    let config = SdkConfig {
        sdk_api_base_url: "http://127.0.0.1:1/api".to_string(),
        events_api_base_url: "http://127.0.0.1:1/api".to_string(),
        auth_api_base_url: "http://127.0.0.1:1/api/v2/auth".to_string(),
        streaming_api_base_url: "http://127.0.0.1:1/sse".to_string(),
        streaming_enabled: false,
        connection_timeout_ms: 100,
        read_timeout_ms: 100,
        ready_ms: 150,
        ..SdkConfig::default()
    };
    let result = build_factory("sdk-key-ready-gate", config).await;
    assert!(matches!(result, Err(SdkError::ReadyTimeout(150))));
}

#[tokio::test]
async fn empty_api_key_is_rejected() {
    let result = build_factory("", SdkConfig::default()).await;
    assert!(matches!(result, Err(SdkError::EmptyApiKey)));
    let result = build_factory("   ", SdkConfig::default()).await;
    assert!(matches!(result, Err(SdkError::EmptyApiKey)));
}

#[tokio::test]
async fn duplicate_factories_coexist() {
    let file = flag_file("feature on\n");
    let first = build_factory("localhost", localhost_config(&file))
        .await
        .expect("first");
    // Duplicate instantiation warns but still works.
    let second = build_factory("localhost", localhost_config(&file))
        .await
        .expect("second");

    assert_eq!(first.client().get_treatment("u", "feature", None), "on");
    assert_eq!(second.client().get_treatment("u", "feature", None), "on");

    first.destroy().await;
    assert_eq!(second.client().get_treatment("u", "feature", None), "on");
    second.destroy().await;
}

#[tokio::test]
async fn impression_listener_sees_each_emitted_outcome() {
    #[derive(Default)]
    struct Recorder(Mutex<Vec<Impression>>);
    impl ImpressionListener for Recorder {
        fn log(&self, impression: &Impression) {
            self.0.lock().unwrap().push(impression.clone());
        }
    }

    let file = flag_file("feature on\n");
    let recorder = Arc::new(Recorder::default());
    let config = SdkConfig {
        impressions_mode: ImpressionsMode::Debug,
        impression_listener: Some(recorder.clone()),
        ..localhost_config(&file)
    };
    let factory = build_factory("localhost", config).await.expect("factory");
    let client = factory.client();

    client.get_treatment("alice", "feature", None);
    client.get_treatment("bob", "feature", None);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let seen = recorder.0.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].feature, "feature");
    assert_eq!(seen[0].key_name, "alice");
    assert_eq!(seen[0].treatment, "on");
    assert_eq!(seen[0].label, "default rule");
    assert!(seen[0].time > 0);
    drop(seen);

    factory.destroy().await;
}

#[tokio::test]
async fn track_validates_and_accepts_events() {
    let file = flag_file("feature on\n");
    let factory = build_factory("localhost", localhost_config(&file))
        .await
        .expect("factory");
    let client = factory.client();

    assert!(client.track("user-1", "user", "page.view", Some(1.5), None));
    assert!(client.track("user-1", "user", "click", None, None));

    assert!(!client.track("", "user", "click", None, None));
    assert!(!client.track("user-1", "", "click", None, None));
    assert!(!client.track("user-1", "user", "bad event!", None, None));

    let mut properties = std::collections::HashMap::new();
    properties.insert("nested".to_string(), serde_json::json!({"a": 1}));
    assert!(!client.track("user-1", "user", "click", None, Some(properties)));

    factory.destroy().await;
}
