//! Synchronization subsystem: keeps local storage consistent with the
//! backend feeds.
//!
//! The [`Synchronizer`] performs catch-up fetch loops against a
//! [`fetcher::ChangeFetcher`]; pollers drive it on a cadence and the
//! [`SyncManager`] coordinates polling with the streaming channel,
//! downgrading to polling whenever streaming degrades and issuing an
//! immediate fetch on every such transition.

pub(crate) mod fetcher;
pub(crate) mod poller;
pub(crate) mod sse;

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch};

use crate::storage::InMemoryStorage;
use crate::telemetry::Telemetry;
use fetcher::{ChangeFetcher, FetchError};
use poller::PollerMode;
use sse::{ControlType, Notification, SseEvent};

/// Exponential backoff with ±50% jitter.
pub(crate) struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub(crate) fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }

    pub(crate) fn next(&mut self) -> Duration {
        let exp = self
            .base
            .saturating_mul(1u32 << self.attempt.min(16))
            .min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        let jitter = rand::thread_rng().gen_range(0.5..=1.5);
        exp.mul_f64(jitter).min(self.max)
    }
}

/// Catch-up fetch loops shared by pollers, the sync manager, and the
/// readiness path.
pub(crate) struct Synchronizer {
    fetcher: Arc<dyn ChangeFetcher>,
    storage: Arc<InMemoryStorage>,
}

impl Synchronizer {
    pub(crate) fn new(fetcher: Arc<dyn ChangeFetcher>, storage: Arc<InMemoryStorage>) -> Self {
        Self { fetcher, storage }
    }

    pub(crate) fn storage(&self) -> &InMemoryStorage {
        &self.storage
    }

    /// Fetch flag deltas until the feed reports nothing newer. Segments
    /// referenced by newly received flags are fetched immediately.
    pub(crate) async fn sync_splits(&self) -> Result<(), FetchError> {
        loop {
            let since = self.storage.change_number();
            let changes = self.fetcher.split_changes(since).await?;
            let till = changes.ff.t;
            let applied = self.storage.update_splits(changes.ff.d, till);
            for segment in &applied.new_segments {
                self.sync_segment(segment).await?;
            }
            if till <= since {
                return Ok(());
            }
        }
    }

    /// Fetch one segment until current.
    pub(crate) async fn sync_segment(&self, name: &str) -> Result<(), FetchError> {
        loop {
            let since = self.storage.segment_change_number(name);
            let changes = self.fetcher.segment_changes(name, since).await?;
            self.storage.register_segment(name);
            self.storage
                .update_segment(name, &changes.added, &changes.removed, changes.till);
            if changes.till <= since {
                return Ok(());
            }
        }
    }

    /// Fetch every segment referenced by any stored flag.
    pub(crate) async fn sync_segments(&self) -> Result<(), FetchError> {
        for segment in self.storage.referenced_segments() {
            self.sync_segment(&segment).await?;
        }
        Ok(())
    }

    /// Full catch-up: flags first, then every referenced segment.
    pub(crate) async fn sync_all(&self) -> Result<(), FetchError> {
        self.sync_splits().await?;
        self.sync_segments().await
    }
}

/// Sync-fabric states. Transitions into a polling state always issue an
/// immediate fetch to cover any gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SyncState {
    Idle,
    Polling,
    StreamingStarting,
    StreamingReady,
    FallbackPolling,
}

/// Coordinates the pollers with the streaming channel.
pub(crate) struct SyncManager {
    synchronizer: Arc<Synchronizer>,
    telemetry: Arc<Telemetry>,
    state: SyncState,
    poller_mode: watch::Sender<PollerMode>,
    split_kick: mpsc::Sender<()>,
    segment_kick: mpsc::Sender<()>,
    /// Streaming was disabled for the rest of this session.
    streaming_disabled: bool,
}

impl SyncManager {
    pub(crate) fn new(
        synchronizer: Arc<Synchronizer>,
        telemetry: Arc<Telemetry>,
        streaming_enabled: bool,
        poller_mode: watch::Sender<PollerMode>,
        split_kick: mpsc::Sender<()>,
        segment_kick: mpsc::Sender<()>,
    ) -> Self {
        Self {
            synchronizer,
            telemetry,
            state: if streaming_enabled {
                SyncState::StreamingStarting
            } else {
                SyncState::Polling
            },
            poller_mode,
            split_kick,
            segment_kick,
            streaming_disabled: !streaming_enabled,
        }
    }

    pub(crate) fn state(&self) -> SyncState {
        self.state
    }

    /// React to one streaming-channel event.
    pub(crate) async fn handle_event(&mut self, event: SseEvent) {
        match event {
            SseEvent::Connected => {
                if self.streaming_disabled {
                    return;
                }
                self.state = SyncState::StreamingReady;
                let _ = self.poller_mode.send(PollerMode::StreamingActive);
                // Anything published while the channel was down is only
                // reachable through an immediate catch-up fetch.
                self.catch_up();
            }
            SseEvent::Disconnected => {
                Telemetry::bump(&self.telemetry.streaming_reconnects);
                self.enter_polling(SyncState::FallbackPolling);
            }
            SseEvent::StreamingUnavailable => {
                self.streaming_disabled = true;
                self.enter_polling(SyncState::Polling);
            }
            SseEvent::Notification(notification) => self.handle_notification(notification).await,
        }
    }

    pub(crate) async fn handle_notification(&mut self, notification: Notification) {
        match notification {
            Notification::SplitUpdate {
                change_number,
                previous_change_number,
                definition,
            } => {
                let current = self.synchronizer.storage().change_number();
                if change_number <= current {
                    return;
                }
                match (previous_change_number, definition) {
                    (Some(pcn), Some(split)) if pcn == current => {
                        self.synchronizer
                            .storage()
                            .update_splits(vec![split], change_number);
                    }
                    _ => {
                        if let Err(error) = self.synchronizer.sync_splits().await {
                            tracing::warn!(%error, "catch-up fetch after split update failed");
                        }
                    }
                }
            }
            Notification::SplitKill {
                change_number,
                split_name,
                default_treatment,
            } => {
                self.synchronizer
                    .storage()
                    .kill_split(&split_name, &default_treatment, change_number);
                if let Err(error) = self.synchronizer.sync_splits().await {
                    tracing::warn!(%error, "catch-up fetch after split kill failed");
                }
            }
            Notification::SegmentUpdate {
                change_number,
                segment_name,
            } => {
                if self.synchronizer.storage().segment_change_number(&segment_name) >= change_number
                {
                    return;
                }
                if let Err(error) = self.synchronizer.sync_segment(&segment_name).await {
                    tracing::warn!(%error, segment = %segment_name, "segment catch-up fetch failed");
                }
            }
            Notification::Control { control_type } => match control_type {
                ControlType::StreamingPaused => {
                    self.enter_polling(SyncState::FallbackPolling);
                }
                ControlType::StreamingResumed => self.resume_streaming(),
                ControlType::StreamingDisabled => {
                    self.streaming_disabled = true;
                    self.enter_polling(SyncState::Polling);
                }
            },
            Notification::Occupancy { publishers } => {
                if publishers == 0 {
                    self.enter_polling(SyncState::FallbackPolling);
                } else {
                    self.resume_streaming();
                }
            }
        }
    }

    fn resume_streaming(&mut self) {
        if self.streaming_disabled || self.state != SyncState::FallbackPolling {
            return;
        }
        self.state = SyncState::StreamingReady;
        let _ = self.poller_mode.send(PollerMode::StreamingActive);
        self.catch_up();
    }

    fn enter_polling(&mut self, state: SyncState) {
        self.state = state;
        let _ = self.poller_mode.send(PollerMode::Normal);
        self.catch_up();
    }

    /// Kick both pollers for an immediate off-cadence fetch.
    fn catch_up(&self) {
        let _ = self.split_kick.try_send(());
        let _ = self.segment_kick.try_send(());
    }
}

/// Event loop tying the streaming channel to the manager.
pub(crate) async fn run_manager(
    mut manager: SyncManager,
    mut events_rx: mpsc::Receiver<SseEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = events_rx.recv() => match event {
                Some(event) => manager.handle_event(event).await,
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }
    manager.state = SyncState::Idle;
    tracing::debug!("sync manager stopped");
}
