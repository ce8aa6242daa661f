//! Periodic tick tasks driving the fetch → apply path.
//!
//! One task per feed. Each tick runs a catch-up sync; retryable failures
//! are retried under exponential backoff capped so a tick never bleeds past
//! its own interval. A kick channel forces an off-cadence tick, which the
//! manager uses whenever a transition requires an immediate fetch.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch};

use super::{Backoff, Synchronizer};

/// How pollers behave relative to the streaming channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollerMode {
    /// Both feeds poll at their configured cadence.
    Normal,
    /// Streaming carries flag updates; the flag poller idles and the
    /// segment poller drops to a slow safety-net cadence.
    StreamingActive,
}

/// Segment cadence multiplier while streaming is healthy.
const STREAMING_SEGMENT_SLOWDOWN: u32 = 10;
const MAX_RETRIES_PER_TICK: u32 = 5;

fn tick_delay(base: Duration, randomize: bool) -> Duration {
    if randomize {
        base.mul_f64(rand::thread_rng().gen_range(0.5..=2.0))
    } else {
        base
    }
}

enum Feed {
    Splits,
    Segments,
}

async fn sync_with_retries(synchronizer: &Synchronizer, feed: &Feed, interval: Duration) {
    let mut backoff = Backoff::new(Duration::from_millis(500), interval);
    for _ in 0..MAX_RETRIES_PER_TICK {
        let result = match feed {
            Feed::Splits => synchronizer.sync_splits().await,
            Feed::Segments => synchronizer.sync_segments().await,
        };
        match result {
            Ok(()) => return,
            Err(error) if error.is_retryable() => {
                let delay = backoff.next();
                tracing::debug!(%error, ?delay, "retryable sync failure, backing off");
                tokio::time::sleep(delay).await;
            }
            Err(error) => {
                tracing::warn!(%error, "sync cycle failed, waiting for next tick");
                return;
            }
        }
    }
}

pub(crate) async fn split_poller(
    synchronizer: Arc<Synchronizer>,
    interval: Duration,
    randomize: bool,
    mode_rx: watch::Receiver<PollerMode>,
    mut kick_rx: mpsc::Receiver<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let mut kicked = false;
        tokio::select! {
            _ = tokio::time::sleep(tick_delay(interval, randomize)) => {}
            Some(()) = kick_rx.recv() => kicked = true,
            _ = shutdown.changed() => break,
        }
        // While streaming is healthy the flag feed arrives over the
        // channel; only forced ticks fetch.
        if *mode_rx.borrow() == PollerMode::StreamingActive && !kicked {
            continue;
        }
        sync_with_retries(&synchronizer, &Feed::Splits, interval).await;
    }
    tracing::debug!("split poller stopped");
}

pub(crate) async fn segment_poller(
    synchronizer: Arc<Synchronizer>,
    interval: Duration,
    randomize: bool,
    mode_rx: watch::Receiver<PollerMode>,
    mut kick_rx: mpsc::Receiver<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let base = match *mode_rx.borrow() {
            PollerMode::Normal => interval,
            PollerMode::StreamingActive => interval * STREAMING_SEGMENT_SLOWDOWN,
        };
        tokio::select! {
            _ = tokio::time::sleep(tick_delay(base, randomize)) => {}
            Some(()) = kick_rx.recv() => {}
            _ = shutdown.changed() => break,
        }
        sync_with_retries(&synchronizer, &Feed::Segments, interval).await;
    }
    tracing::debug!("segment poller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::storage::InMemoryStorage;
    use crate::sync::fetcher::{ChangeFetcher, FetchError};
    use crate::types::{FeatureFlagChanges, SegmentChanges, SplitChanges};

    struct CountingFetcher {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl ChangeFetcher for CountingFetcher {
        async fn split_changes(&self, since: i64) -> Result<SplitChanges, FetchError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(FetchError::Retryable { status: Some(503) });
            }
            Ok(SplitChanges {
                ff: FeatureFlagChanges {
                    d: vec![],
                    s: since,
                    t: since,
                },
            })
        }

        async fn segment_changes(&self, name: &str, since: i64) -> Result<SegmentChanges, FetchError> {
            Ok(SegmentChanges {
                name: name.to_string(),
                added: vec![],
                removed: vec![],
                since,
                till: since,
            })
        }
    }

    #[tokio::test]
    async fn retryable_failures_are_retried_within_the_tick() {
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicU32::new(0),
            fail_first: 2,
        });
        let storage = Arc::new(InMemoryStorage::new(None));
        let synchronizer = Synchronizer::new(fetcher.clone(), storage);

        sync_with_retries(&synchronizer, &Feed::Splits, Duration::from_millis(50)).await;
        // Two failures plus the success.
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn split_poller_reacts_to_kick_and_shutdown() {
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicU32::new(0),
            fail_first: 0,
        });
        let storage = Arc::new(InMemoryStorage::new(None));
        let synchronizer = Arc::new(Synchronizer::new(fetcher.clone(), storage));

        let (mode_tx, mode_rx) = watch::channel(PollerMode::Normal);
        let (kick_tx, kick_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(split_poller(
            synchronizer,
            Duration::from_secs(3600),
            false,
            mode_rx,
            kick_rx,
            shutdown_rx,
        ));

        kick_tx.send(()).await.expect("kick");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        shutdown_tx.send(true).expect("shutdown signal");
        handle.await.expect("poller exits");
        drop(mode_tx);
    }

    #[test]
    fn randomized_delay_stays_within_bounds() {
        let base = Duration::from_secs(30);
        for _ in 0..100 {
            let delay = tick_delay(base, true);
            assert!(delay >= base / 2 && delay <= base * 2, "delay {delay:?}");
        }
        assert_eq!(tick_delay(base, false), base);
    }
}
