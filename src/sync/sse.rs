//! Streaming notification channel.
//!
//! A server-sent-events stream carries flag/segment change notifications
//! and channel-health messages. The client authenticates for a short-lived
//! JWT, keeps the stream alive (70 s keep-alive window), refreshes the
//! token ahead of expiry, and reconnects under exponential backoff. All
//! interpretation of the notifications happens in the sync manager; this
//! module only parses and forwards.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use futures::StreamExt;
use serde::{Deserialize, Deserializer};
use tokio::sync::{mpsc, watch};

use super::fetcher::BackendApi;
use super::Backoff;
use crate::telemetry::Telemetry;
use crate::types::Split;

/// Force a reconnect when no frame (data or keep-alive) arrives in time.
const KEEP_ALIVE_WINDOW: Duration = Duration::from_secs(70);
/// Token refresh is scheduled this long before the JWT expires.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(600);
const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(60);

/// What the channel tells the sync manager.
#[derive(Debug)]
pub(crate) enum SseEvent {
    /// Stream established (first response accepted).
    Connected,
    /// Stream lost; the client is reconnecting on its own.
    Disconnected,
    /// Streaming is not available for this session; fall back to polling
    /// permanently.
    StreamingUnavailable,
    Notification(Notification),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub(crate) enum ControlType {
    #[serde(rename = "STREAMING_PAUSED")]
    StreamingPaused,
    #[serde(rename = "STREAMING_RESUMED")]
    StreamingResumed,
    #[serde(rename = "STREAMING_DISABLED")]
    StreamingDisabled,
}

/// Notification payloads carried in SSE `data:` fields.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub(crate) enum Notification {
    #[serde(rename = "SPLIT_UPDATE", rename_all = "camelCase")]
    SplitUpdate {
        change_number: i64,
        #[serde(default)]
        previous_change_number: Option<i64>,
        #[serde(default)]
        definition: Option<Split>,
    },
    #[serde(rename = "SPLIT_KILL", rename_all = "camelCase")]
    SplitKill {
        change_number: i64,
        split_name: String,
        default_treatment: String,
    },
    #[serde(rename = "SEGMENT_UPDATE", rename_all = "camelCase")]
    SegmentUpdate {
        change_number: i64,
        segment_name: String,
    },
    #[serde(rename = "CONTROL", rename_all = "camelCase")]
    Control { control_type: ControlType },
    #[serde(rename = "OCCUPANCY")]
    Occupancy {
        #[serde(rename = "metrics", deserialize_with = "publishers_from_metrics")]
        publishers: u32,
    },
}

fn publishers_from_metrics<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    #[derive(Deserialize)]
    struct Metrics {
        publishers: u32,
    }
    Ok(Metrics::deserialize(deserializer)?.publishers)
}

// ── SSE framing ─────────────────────────────────────────────────────────

/// One parsed `text/event-stream` frame.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct SseFrame {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

impl SseFrame {
    /// Decode the data payload into a notification, if it carries one.
    pub(crate) fn notification(&self) -> Option<Notification> {
        if self.data.is_empty() {
            return None;
        }
        match serde_json::from_str(&self.data) {
            Ok(notification) => Some(notification),
            Err(error) => {
                tracing::debug!(
                    event = ?self.event,
                    id = ?self.id,
                    %error,
                    "ignoring unrecognized streaming payload"
                );
                None
            }
        }
    }
}

/// Incremental frame assembler: frames are terminated by a blank line and
/// may arrive split across arbitrary chunk boundaries.
#[derive(Default)]
pub(crate) struct FrameParser {
    buffer: String,
}

impl FrameParser {
    pub(crate) fn push(&mut self, chunk: &str) -> Vec<SseFrame> {
        self.buffer.push_str(chunk);
        let mut frames = Vec::new();
        while let Some(end) = self.buffer.find("\n\n") {
            let raw: String = self.buffer.drain(..end + 2).collect();
            if let Some(frame) = parse_frame(raw.trim_end_matches('\n')) {
                frames.push(frame);
            }
        }
        frames
    }
}

fn parse_frame(raw: &str) -> Option<SseFrame> {
    let mut frame = SseFrame::default();
    let mut saw_field = false;
    for line in raw.lines() {
        if line.starts_with(':') {
            // Comment line; servers use these as keep-alives.
            saw_field = true;
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => frame.event = Some(value.to_string()),
            "data" => {
                if !frame.data.is_empty() {
                    frame.data.push('\n');
                }
                frame.data.push_str(value);
            }
            "id" => frame.id = Some(value.to_string()),
            _ => continue,
        }
        saw_field = true;
    }
    saw_field.then_some(frame)
}

// ── Streaming token ─────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct StreamingToken {
    pub token: String,
    pub channels: Vec<String>,
    /// Unix epoch seconds.
    pub expires_at: i64,
}

/// Extract channels and expiry from the JWT payload. The signature is the
/// backend's concern; the client only reads its own claims.
pub(crate) fn decode_token(raw: &str) -> Option<StreamingToken> {
    #[derive(Deserialize)]
    struct Claims {
        exp: i64,
        capability: String,
    }

    let payload = raw.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let claims: Claims = serde_json::from_slice(&bytes).ok()?;
    let channels: BTreeMap<String, serde_json::Value> =
        serde_json::from_str(&claims.capability).ok()?;
    Some(StreamingToken {
        token: raw.to_string(),
        channels: channels.into_keys().collect(),
        expires_at: claims.exp,
    })
}

fn refresh_delay(expires_at: i64) -> Duration {
    let now = chrono::Utc::now().timestamp();
    let refresh_in = expires_at - now - TOKEN_REFRESH_MARGIN.as_secs() as i64;
    Duration::from_secs(refresh_in.max(0) as u64)
}

// ── Client task ─────────────────────────────────────────────────────────

enum ReadEnd {
    Shutdown,
    TokenExpiring,
    Disconnected,
}

/// Long-lived streaming task: authenticate, connect, pump frames, recover.
pub(crate) async fn sse_client(
    api: Arc<BackendApi>,
    events_tx: mpsc::Sender<SseEvent>,
    telemetry: Arc<Telemetry>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(RECONNECT_BASE, RECONNECT_MAX);
    loop {
        if *shutdown.borrow() {
            return;
        }
        let auth = tokio::select! {
            result = api.authenticate() => result,
            _ = shutdown.changed() => return,
        };
        let token = match auth {
            Ok(response) if response.push_enabled => match decode_token(&response.token) {
                Some(token) => token,
                None => {
                    tracing::warn!("streaming token could not be decoded, disabling streaming");
                    let _ = events_tx.send(SseEvent::StreamingUnavailable).await;
                    return;
                }
            },
            Ok(_) => {
                tracing::info!("streaming not enabled for this api key");
                let _ = events_tx.send(SseEvent::StreamingUnavailable).await;
                return;
            }
            Err(error) if error.is_retryable() => {
                let delay = backoff.next();
                tracing::debug!(%error, ?delay, "streaming auth failed, backing off");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => continue,
                    _ = shutdown.changed() => return,
                }
            }
            Err(error) => {
                tracing::warn!(%error, "streaming auth rejected, disabling streaming");
                let _ = events_tx.send(SseEvent::StreamingUnavailable).await;
                return;
            }
        };
        Telemetry::bump(&telemetry.token_refreshes);

        let channels = token.channels.join(",");
        match api.open_stream(&channels, &token.token).await {
            Ok(response) => {
                backoff.reset();
                if events_tx.send(SseEvent::Connected).await.is_err() {
                    return;
                }
                match read_stream(response, &events_tx, refresh_delay(token.expires_at), &mut shutdown)
                    .await
                {
                    ReadEnd::Shutdown => return,
                    // Reconnect straight away with a fresh token.
                    ReadEnd::TokenExpiring => continue,
                    ReadEnd::Disconnected => {
                        if events_tx.send(SseEvent::Disconnected).await.is_err() {
                            return;
                        }
                        let delay = backoff.next();
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown.changed() => return,
                        }
                    }
                }
            }
            Err(error) if error.is_retryable() => {
                let _ = events_tx.send(SseEvent::Disconnected).await;
                let delay = backoff.next();
                tracing::debug!(%error, ?delay, "stream connect failed, backing off");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => return,
                }
            }
            Err(error) => {
                tracing::warn!(%error, "stream connect rejected, disabling streaming");
                let _ = events_tx.send(SseEvent::StreamingUnavailable).await;
                return;
            }
        }
    }
}

async fn read_stream(
    response: reqwest::Response,
    events_tx: &mpsc::Sender<SseEvent>,
    refresh_in: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> ReadEnd {
    let mut stream = response.bytes_stream();
    let mut parser = FrameParser::default();
    let refresh = tokio::time::sleep(refresh_in);
    tokio::pin!(refresh);

    loop {
        tokio::select! {
            next = tokio::time::timeout(KEEP_ALIVE_WINDOW, stream.next()) => match next {
                Err(_) => {
                    tracing::debug!("keep-alive window expired, forcing reconnect");
                    return ReadEnd::Disconnected;
                }
                Ok(None) => return ReadEnd::Disconnected,
                Ok(Some(Err(error))) => {
                    tracing::debug!(%error, "stream read error");
                    return ReadEnd::Disconnected;
                }
                Ok(Some(Ok(bytes))) => {
                    let text = String::from_utf8_lossy(&bytes);
                    for frame in parser.push(&text) {
                        if let Some(notification) = frame.notification() {
                            if events_tx
                                .send(SseEvent::Notification(notification))
                                .await
                                .is_err()
                            {
                                return ReadEnd::Shutdown;
                            }
                        }
                    }
                }
            },
            _ = &mut refresh => return ReadEnd::TokenExpiring,
            _ = shutdown.changed() => return ReadEnd::Shutdown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_survive_arbitrary_chunk_boundaries() {
        let mut parser = FrameParser::default();
        assert!(parser.push("event: message\ndata: {\"a\"").is_empty());
        let frames = parser.push(":1}\nid: 7\n\nevent: message\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("message"));
        assert_eq!(frames[0].data, "{\"a\":1}");
        assert_eq!(frames[0].id.as_deref(), Some("7"));

        let frames = parser.push("data: second\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "second");
    }

    #[test]
    fn multi_line_data_joins_with_newlines() {
        let mut parser = FrameParser::default();
        let frames = parser.push("data: line1\ndata: line2\n\n");
        assert_eq!(frames[0].data, "line1\nline2");
    }

    #[test]
    fn comment_frames_count_as_keep_alives() {
        let mut parser = FrameParser::default();
        let frames = parser.push(":keepalive\n\n");
        assert_eq!(frames.len(), 1);
        assert!(frames[0].data.is_empty());
        assert!(frames[0].notification().is_none());
    }

    #[test]
    fn notification_payloads_decode_by_type() {
        let frame = SseFrame {
            event: Some("message".to_string()),
            data: r#"{"type":"SPLIT_KILL","changeNumber":12,"splitName":"f","defaultTreatment":"off"}"#
                .to_string(),
            id: None,
        };
        match frame.notification() {
            Some(Notification::SplitKill {
                change_number,
                split_name,
                default_treatment,
            }) => {
                assert_eq!(change_number, 12);
                assert_eq!(split_name, "f");
                assert_eq!(default_treatment, "off");
            }
            other => panic!("unexpected notification: {other:?}"),
        }

        let data = r#"{"type":"SPLIT_UPDATE","changeNumber":10,"previousChangeNumber":9}"#;
        match serde_json::from_str::<Notification>(data) {
            Ok(Notification::SplitUpdate {
                change_number,
                previous_change_number,
                definition,
            }) => {
                assert_eq!(change_number, 10);
                assert_eq!(previous_change_number, Some(9));
                assert!(definition.is_none());
            }
            other => panic!("unexpected: {other:?}"),
        }

        let data = r#"{"type":"SEGMENT_UPDATE","changeNumber":4,"segmentName":"beta"}"#;
        assert!(matches!(
            serde_json::from_str::<Notification>(data),
            Ok(Notification::SegmentUpdate { change_number: 4, ref segment_name }) if segment_name == "beta"
        ));

        let data = r#"{"type":"CONTROL","controlType":"STREAMING_PAUSED"}"#;
        assert!(matches!(
            serde_json::from_str::<Notification>(data),
            Ok(Notification::Control {
                control_type: ControlType::StreamingPaused
            })
        ));

        let data = r#"{"type":"OCCUPANCY","metrics":{"publishers":2}}"#;
        assert!(matches!(
            serde_json::from_str::<Notification>(data),
            Ok(Notification::Occupancy { publishers: 2 })
        ));
    }

    #[test]
    fn garbage_payloads_are_ignored() {
        let frame = SseFrame {
            event: None,
            data: r#"{"type":"SOMETHING_NEW","x":1}"#.to_string(),
            id: None,
        };
        assert!(frame.notification().is_none());
    }

    #[test]
    fn token_claims_decode_channels_and_expiry() {
        let claims = serde_json::json!({
            "exp": 1_700_000_000_i64,
            "capability": "{\"control_pri\":[\"subscribe\"],\"splits\":[\"subscribe\"]}"
        });
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        let jwt = format!("eyJhbGciOiJIUzI1NiJ9.{payload}.c2ln");

        let token = decode_token(&jwt).expect("decodes");
        assert_eq!(token.expires_at, 1_700_000_000);
        assert_eq!(
            token.channels,
            vec!["control_pri".to_string(), "splits".to_string()]
        );
        assert_eq!(token.token, jwt);
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        assert!(decode_token("not-a-jwt").is_none());
        assert!(decode_token("a.!!!.c").is_none());
        let payload = URL_SAFE_NO_PAD.encode("{\"exp\":1}");
        assert!(decode_token(&format!("h.{payload}.s")).is_none());
    }
}
