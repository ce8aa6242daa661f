//! HTTP transport to the backend: conditional change fetches and the
//! delivery posts used by the flushers.
//!
//! Errors are classed by what the caller should do with them: a `Fatal`
//! response ends the current sync cycle until the next tick, anything
//! `Retryable` (408, 429, 5xx, transport) is retried under exponential
//! backoff capped at the poll interval.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::SdkConfig;
use crate::error::SdkError;
use crate::telemetry::{Endpoint, Telemetry};
use crate::types::{SegmentChanges, SplitChanges};

pub(crate) const SDK_VERSION: &str = concat!("flagkit-rust-", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub(crate) enum FetchError {
    /// Client-side rejection; do not retry until the next tick.
    #[error("request rejected with status {status}")]
    Fatal { status: u16 },
    /// Server or transport trouble worth retrying with backoff.
    #[error("retryable failure (status {status:?})")]
    Retryable { status: Option<u16> },
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl FetchError {
    pub(crate) fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Retryable { .. })
    }

    fn from_status(status: StatusCode) -> Self {
        let code = status.as_u16();
        if status.is_server_error()
            || status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
        {
            FetchError::Retryable { status: Some(code) }
        } else {
            FetchError::Fatal { status: code }
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(_: reqwest::Error) -> Self {
        FetchError::Retryable { status: None }
    }
}

/// Source of flag and segment deltas. The HTTP implementation below is the
/// production one; tests drive the sync layer through stub implementations.
#[async_trait]
pub(crate) trait ChangeFetcher: Send + Sync {
    async fn split_changes(&self, since: i64) -> Result<SplitChanges, FetchError>;
    async fn segment_changes(&self, name: &str, since: i64) -> Result<SegmentChanges, FetchError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AuthResponse {
    pub push_enabled: bool,
    #[serde(default)]
    pub token: String,
}

/// One shared HTTP client per factory, carrying auth and SDK metadata
/// headers on every request.
pub(crate) struct BackendApi {
    http: reqwest::Client,
    sdk_base: String,
    events_base: String,
    auth_url: String,
    streaming_url: String,
    sets_csv: Option<String>,
    telemetry: Arc<Telemetry>,
}

impl BackendApi {
    pub(crate) fn new(
        api_key: &str,
        config: &SdkConfig,
        telemetry: Arc<Telemetry>,
    ) -> Result<Self, SdkError> {
        let mut headers = HeaderMap::new();
        let bearer = format!("Bearer {api_key}");
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&bearer)
                .map_err(|_| SdkError::InvalidConfig("api key contains invalid characters".into()))?,
        );
        headers.insert("x-sdk-version", HeaderValue::from_static(SDK_VERSION));
        if config.ip_addresses_enabled {
            if let Some(name) = machine_name() {
                if let Ok(value) = HeaderValue::from_str(&name) {
                    headers.insert("x-sdk-machine-name", value);
                }
            }
            if let Some(ip) = machine_ip() {
                if let Ok(value) = HeaderValue::from_str(&ip) {
                    headers.insert("x-sdk-machine-ip", value);
                }
            }
        }

        let http = reqwest::Client::builder()
            .connect_timeout(config.connection_timeout())
            .timeout(config.read_timeout())
            .default_headers(headers)
            .build()?;

        Ok(Self {
            http,
            sdk_base: config.sdk_api_base_url.trim_end_matches('/').to_string(),
            events_base: config.events_api_base_url.trim_end_matches('/').to_string(),
            auth_url: config.auth_api_base_url.clone(),
            streaming_url: config.streaming_api_base_url.clone(),
            sets_csv: config.flag_sets_csv(),
            telemetry,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        endpoint: Endpoint,
    ) -> Result<T, FetchError> {
        let response = self.http.get(url).send().await.map_err(|e| {
            tracing::debug!(%url, error = %e, "request failed");
            FetchError::from(e)
        })?;
        let status = response.status();
        if !status.is_success() {
            self.telemetry.record_http_error(endpoint, status.as_u16());
            return Err(FetchError::from_status(status));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))
    }

    async fn post_json<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
        endpoint: Endpoint,
    ) -> Result<(), FetchError> {
        let response = self.http.post(url).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            self.telemetry.record_http_error(endpoint, status.as_u16());
            return Err(FetchError::from_status(status));
        }
        Ok(())
    }

    /// Obtain a short-lived streaming token.
    pub(crate) async fn authenticate(&self) -> Result<AuthResponse, FetchError> {
        self.get_json(&self.auth_url, Endpoint::Auth).await
    }

    /// Open the SSE stream for the given channels and token.
    pub(crate) async fn open_stream(
        &self,
        channels: &str,
        token: &str,
    ) -> Result<reqwest::Response, FetchError> {
        let response = self
            .http
            .get(&self.streaming_url)
            .query(&[("v", "1.1"), ("channels", channels), ("accessToken", token)])
            .header(ACCEPT, "text/event-stream")
            // The stream stays open indefinitely; keep-alive supervision
            // happens above this call, not via the client read timeout.
            .timeout(std::time::Duration::from_secs(u64::MAX >> 16))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            self.telemetry
                .record_http_error(Endpoint::Streaming, status.as_u16());
            return Err(FetchError::from_status(status));
        }
        Ok(response)
    }

    pub(crate) async fn post_impressions(
        &self,
        bulk: &[crate::impressions::FeatureImpressions],
    ) -> Result<(), FetchError> {
        let url = format!("{}/impressions/bulk", self.events_base);
        self.post_json(&url, bulk, Endpoint::Impressions).await
    }

    pub(crate) async fn post_impression_counts(
        &self,
        counts: &[crate::impressions::ImpressionCount],
    ) -> Result<(), FetchError> {
        let url = format!("{}/impressions/count", self.events_base);
        self.post_json(&url, counts, Endpoint::ImpressionCounts)
            .await
    }

    pub(crate) async fn post_unique_keys(
        &self,
        uniques: &[crate::impressions::UniqueKeys],
    ) -> Result<(), FetchError> {
        let url = format!("{}/uniqueKeys", self.events_base);
        self.post_json(&url, uniques, Endpoint::UniqueKeys).await
    }

    pub(crate) async fn post_events(
        &self,
        events: &[crate::types::Event],
    ) -> Result<(), FetchError> {
        let url = format!("{}/events/bulk", self.events_base);
        self.post_json(&url, events, Endpoint::Events).await
    }

    pub(crate) async fn post_usage(
        &self,
        usage: &crate::telemetry::UsageSnapshot,
    ) -> Result<(), FetchError> {
        let url = format!("{}/metrics/usage", self.events_base);
        self.post_json(&url, usage, Endpoint::Telemetry).await
    }

    pub(crate) async fn post_config_echo(
        &self,
        echo: &crate::telemetry::ConfigEcho,
    ) -> Result<(), FetchError> {
        let url = format!("{}/metrics/config", self.events_base);
        self.post_json(&url, echo, Endpoint::Telemetry).await
    }
}

#[async_trait]
impl ChangeFetcher for BackendApi {
    async fn split_changes(&self, since: i64) -> Result<SplitChanges, FetchError> {
        let mut url = format!("{}/splitChanges?since={since}", self.sdk_base);
        if let Some(sets) = &self.sets_csv {
            url.push_str("&sets=");
            url.push_str(sets);
        }
        self.get_json(&url, Endpoint::SplitChanges).await
    }

    async fn segment_changes(&self, name: &str, since: i64) -> Result<SegmentChanges, FetchError> {
        let url = format!("{}/segmentChanges/{name}?since={since}", self.sdk_base);
        self.get_json(&url, Endpoint::SegmentChanges).await
    }
}

fn machine_name() -> Option<String> {
    hostname::get().ok()?.into_string().ok()
}

// Routing-table trick: no packet is sent, the OS just picks the interface
// it would use for an external address.
fn machine_ip() -> Option<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification_matches_retry_policy() {
        assert!(FetchError::from_status(StatusCode::INTERNAL_SERVER_ERROR).is_retryable());
        assert!(FetchError::from_status(StatusCode::BAD_GATEWAY).is_retryable());
        assert!(FetchError::from_status(StatusCode::REQUEST_TIMEOUT).is_retryable());
        assert!(FetchError::from_status(StatusCode::TOO_MANY_REQUESTS).is_retryable());
        assert!(!FetchError::from_status(StatusCode::UNAUTHORIZED).is_retryable());
        assert!(!FetchError::from_status(StatusCode::NOT_FOUND).is_retryable());
        assert!(!FetchError::from_status(StatusCode::BAD_REQUEST).is_retryable());
    }
}
