//! Runtime telemetry: evaluation counters, latency histograms, transport
//! error counts, and the one-time config echo.
//!
//! Recording is lock-free (atomics + dashmap) so the evaluation hot path
//! never contends with the hourly flusher. Flush failures are logged and
//! swallowed; telemetry must never affect the host application.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

use crate::config::SdkConfig;

/// Public API call kinds tracked individually.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallKind {
    Treatment,
    Treatments,
    TreatmentWithConfig,
    TreatmentsWithConfig,
    TreatmentsByFlagSet,
    TreatmentsByFlagSets,
    Track,
}

impl CallKind {
    pub(crate) const ALL: [CallKind; 7] = [
        CallKind::Treatment,
        CallKind::Treatments,
        CallKind::TreatmentWithConfig,
        CallKind::TreatmentsWithConfig,
        CallKind::TreatmentsByFlagSet,
        CallKind::TreatmentsByFlagSets,
        CallKind::Track,
    ];

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            CallKind::Treatment => "treatment",
            CallKind::Treatments => "treatments",
            CallKind::TreatmentWithConfig => "treatment_with_config",
            CallKind::TreatmentsWithConfig => "treatments_with_config",
            CallKind::TreatmentsByFlagSet => "treatments_by_flag_set",
            CallKind::TreatmentsByFlagSets => "treatments_by_flag_sets",
            CallKind::Track => "track",
        }
    }

    fn index(self) -> usize {
        Self::ALL.iter().position(|k| *k == self).unwrap_or(0)
    }
}

/// Backend endpoints tracked for transport errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Endpoint {
    SplitChanges,
    SegmentChanges,
    Auth,
    Streaming,
    Impressions,
    ImpressionCounts,
    UniqueKeys,
    Events,
    Telemetry,
}

impl Endpoint {
    fn as_str(self) -> &'static str {
        match self {
            Endpoint::SplitChanges => "split_changes",
            Endpoint::SegmentChanges => "segment_changes",
            Endpoint::Auth => "auth",
            Endpoint::Streaming => "streaming",
            Endpoint::Impressions => "impressions",
            Endpoint::ImpressionCounts => "impression_counts",
            Endpoint::UniqueKeys => "unique_keys",
            Endpoint::Events => "events",
            Endpoint::Telemetry => "telemetry",
        }
    }
}

/// Upper bounds (micros) of the exponential latency buckets: 1 ms growing
/// by 1.5× per bucket, final bucket open-ended.
const LATENCY_BUCKET_BOUNDS: [u64; 22] = [
    1_000, 1_500, 2_250, 3_375, 5_063, 7_594, 11_391, 17_086, 25_629, 38_443, 57_665, 86_498,
    129_746, 194_620, 291_929, 437_894, 656_841, 985_261, 1_477_892, 2_216_838, 3_325_257,
    4_987_885,
];
pub(crate) const LATENCY_BUCKETS: usize = LATENCY_BUCKET_BOUNDS.len() + 1;

fn latency_bucket(latency: Duration) -> usize {
    let micros = latency.as_micros() as u64;
    LATENCY_BUCKET_BOUNDS
        .iter()
        .position(|bound| micros <= *bound)
        .unwrap_or(LATENCY_BUCKETS - 1)
}

struct CallStats {
    calls: AtomicU64,
    exceptions: AtomicU64,
    latencies: [AtomicU64; LATENCY_BUCKETS],
}

impl CallStats {
    fn new() -> Self {
        Self {
            calls: AtomicU64::new(0),
            exceptions: AtomicU64::new(0),
            latencies: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

/// Process-local runtime stats for one factory.
pub(crate) struct Telemetry {
    per_call: [CallStats; 7],
    http_errors: DashMap<(Endpoint, u16), u64>,
    pub(crate) impressions_queued: AtomicU64,
    pub(crate) impressions_dropped: AtomicU64,
    pub(crate) impressions_deduped: AtomicU64,
    pub(crate) events_queued: AtomicU64,
    pub(crate) events_dropped: AtomicU64,
    pub(crate) listener_failures: AtomicU64,
    pub(crate) token_refreshes: AtomicU64,
    pub(crate) streaming_reconnects: AtomicU64,
    pub(crate) not_ready_usages: AtomicU64,
    config_echoed: AtomicBool,
}

impl Telemetry {
    pub(crate) fn new() -> Self {
        Self {
            per_call: std::array::from_fn(|_| CallStats::new()),
            http_errors: DashMap::new(),
            impressions_queued: AtomicU64::new(0),
            impressions_dropped: AtomicU64::new(0),
            impressions_deduped: AtomicU64::new(0),
            events_queued: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            listener_failures: AtomicU64::new(0),
            token_refreshes: AtomicU64::new(0),
            streaming_reconnects: AtomicU64::new(0),
            not_ready_usages: AtomicU64::new(0),
            config_echoed: AtomicBool::new(false),
        }
    }

    pub(crate) fn record_call(&self, kind: CallKind, latency: Duration) {
        let stats = &self.per_call[kind.index()];
        stats.calls.fetch_add(1, Ordering::Relaxed);
        stats.latencies[latency_bucket(latency)].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_exception(&self, kind: CallKind) {
        self.per_call[kind.index()]
            .exceptions
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_http_error(&self, endpoint: Endpoint, status: u16) {
        *self.http_errors.entry((endpoint, status)).or_insert(0) += 1;
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Drain counters into a wire snapshot; recording continues from zero.
    pub(crate) fn usage_snapshot(&self) -> UsageSnapshot {
        let methods = CallKind::ALL
            .iter()
            .map(|kind| {
                let stats = &self.per_call[kind.index()];
                MethodUsage {
                    method: kind.as_str(),
                    calls: stats.calls.swap(0, Ordering::Relaxed),
                    exceptions: stats.exceptions.swap(0, Ordering::Relaxed),
                    latency_buckets: stats
                        .latencies
                        .iter()
                        .map(|bucket| bucket.swap(0, Ordering::Relaxed))
                        .collect(),
                }
            })
            .collect();

        let mut http_errors = Vec::new();
        self.http_errors.retain(|(endpoint, status), count| {
            http_errors.push(HttpErrorCount {
                endpoint: endpoint.as_str(),
                status: *status,
                count: *count,
            });
            false
        });

        UsageSnapshot {
            methods,
            http_errors,
            impressions_queued: self.impressions_queued.swap(0, Ordering::Relaxed),
            impressions_dropped: self.impressions_dropped.swap(0, Ordering::Relaxed),
            impressions_deduped: self.impressions_deduped.swap(0, Ordering::Relaxed),
            events_queued: self.events_queued.swap(0, Ordering::Relaxed),
            events_dropped: self.events_dropped.swap(0, Ordering::Relaxed),
            listener_failures: self.listener_failures.swap(0, Ordering::Relaxed),
            token_refreshes: self.token_refreshes.swap(0, Ordering::Relaxed),
            streaming_reconnects: self.streaming_reconnects.swap(0, Ordering::Relaxed),
            not_ready_usages: self.not_ready_usages.swap(0, Ordering::Relaxed),
        }
    }

    /// The config echo is sent once per factory lifetime.
    pub(crate) fn config_echo(&self, config: &SdkConfig, ready_ms: u64) -> Option<ConfigEcho> {
        if self.config_echoed.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(ConfigEcho {
            sdk_version: concat!("flagkit-rust-", env!("CARGO_PKG_VERSION")),
            streaming_enabled: config.streaming_enabled,
            features_refresh_rate_secs: config.features_refresh_rate_secs,
            segments_refresh_rate_secs: config.segments_refresh_rate_secs,
            impressions_refresh_rate_secs: config.impressions_refresh_rate_secs,
            events_push_rate_secs: config.events_push_rate_secs,
            impressions_mode: format!("{:?}", config.impressions_mode).to_lowercase(),
            impressions_queue_size: config.impressions_queue_size,
            events_queue_size: config.events_queue_size,
            flag_sets_count: config.flag_sets_filter.as_ref().map_or(0, Vec::len),
            time_until_ready_ms: ready_ms,
        })
    }
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub(crate) struct MethodUsage {
    pub method: &'static str,
    pub calls: u64,
    pub exceptions: u64,
    pub latency_buckets: Vec<u64>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub(crate) struct HttpErrorCount {
    pub endpoint: &'static str,
    pub status: u16,
    pub count: u64,
}

/// Hourly usage payload.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub(crate) struct UsageSnapshot {
    pub methods: Vec<MethodUsage>,
    pub http_errors: Vec<HttpErrorCount>,
    pub impressions_queued: u64,
    pub impressions_dropped: u64,
    pub impressions_deduped: u64,
    pub events_queued: u64,
    pub events_dropped: u64,
    pub listener_failures: u64,
    pub token_refreshes: u64,
    pub streaming_reconnects: u64,
    pub not_ready_usages: u64,
}

/// Startup payload describing the effective configuration.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub(crate) struct ConfigEcho {
    pub sdk_version: &'static str,
    pub streaming_enabled: bool,
    pub features_refresh_rate_secs: u64,
    pub segments_refresh_rate_secs: u64,
    pub impressions_refresh_rate_secs: u64,
    pub events_push_rate_secs: u64,
    pub impressions_mode: String,
    pub impressions_queue_size: usize,
    pub events_queue_size: usize,
    pub flag_sets_count: usize,
    pub time_until_ready_ms: u64,
}
