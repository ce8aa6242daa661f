//! Factory construction and lifecycle.
//!
//! The factory is the sole owner of storage, the telemetry pipelines, and
//! every long-lived task; clients and managers hold shared read handles.
//! `destroy` signals all tasks, attempts one final flush within a grace
//! window, then drops whatever work remains.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::client::{SplitClient, SplitManager};
use crate::config::SdkConfig;
use crate::error::{Result, SdkError};
use crate::events::EventsManager;
use crate::impressions::{self, ImpressionsManager};
use crate::localhost;
use crate::storage::InMemoryStorage;
use crate::sync::fetcher::{BackendApi, ChangeFetcher, FetchError};
use crate::sync::poller::{self, PollerMode};
use crate::sync::sse;
use crate::sync::{self, Backoff, SyncManager, Synchronizer};
use crate::telemetry::Telemetry;

/// API key sentinel that switches the factory into offline mode.
pub const LOCALHOST_API_KEY: &str = "localhost";

/// Active api keys, for the duplicate-instantiation warning.
static ACTIVE_FACTORIES: Lazy<DashMap<String, usize>> = Lazy::new(DashMap::new);

fn register_api_key(api_key: &str) {
    let mut entry = ACTIVE_FACTORIES.entry(api_key.to_string()).or_insert(0);
    *entry += 1;
    if *entry == 2 {
        tracing::warn!(
            "a factory was already instantiated for this api key; reuse the existing \
             factory instead of building another one"
        );
    }
}

fn unregister_api_key(api_key: &str) {
    let drained = match ACTIVE_FACTORIES.get_mut(api_key) {
        Some(mut count) => {
            *count = count.saturating_sub(1);
            *count == 0
        }
        None => return,
    };
    if drained {
        ACTIVE_FACTORIES.remove_if(api_key, |_, count| *count == 0);
    }
}

/// State shared between the factory and every handle it gives out.
pub(crate) struct FactoryInner {
    pub(crate) config: SdkConfig,
    pub(crate) storage: Arc<InMemoryStorage>,
    pub(crate) impressions: Arc<ImpressionsManager>,
    pub(crate) events: Arc<EventsManager>,
    pub(crate) telemetry: Arc<Telemetry>,
    pub(crate) destroyed: AtomicBool,
    ready: Arc<watch::Sender<bool>>,
}

impl FactoryInner {
    pub(crate) fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }
}

/// Entry point of the SDK.
///
/// Requires a tokio runtime: background sync and flusher tasks are spawned
/// during construction. When `config.ready_ms` is non-zero the call also
/// waits that long for the first full sync and fails with
/// [`SdkError::ReadyTimeout`] if it does not complete in time.
pub async fn build_factory(api_key: &str, config: SdkConfig) -> Result<SplitFactory> {
    if api_key.trim().is_empty() {
        return Err(SdkError::EmptyApiKey);
    }
    config.validate()?;

    let factory = SplitFactory::start(api_key, config).await?;
    let ready_ms = factory.inner.config.ready_ms;
    if ready_ms > 0 {
        if let Err(error) = factory.block_until_ready(ready_ms).await {
            factory.destroy().await;
            return Err(error);
        }
    }
    Ok(factory)
}

/// Owner of the SDK runtime; see [`build_factory`].
pub struct SplitFactory {
    inner: Arc<FactoryInner>,
    api: Option<Arc<BackendApi>>,
    api_key: String,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SplitFactory {
    async fn start(api_key: &str, config: SdkConfig) -> Result<Self> {
        register_api_key(api_key);
        match Self::init(api_key, config).await {
            Ok(factory) => Ok(factory),
            Err(error) => {
                unregister_api_key(api_key);
                Err(error)
            }
        }
    }

    async fn init(api_key: &str, config: SdkConfig) -> Result<Self> {
        let telemetry = Arc::new(Telemetry::new());
        let storage = Arc::new(InMemoryStorage::new(config.flag_sets_filter.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ready = Arc::new(watch::channel(false).0);
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        let listener_tx = match config.impression_listener.clone() {
            Some(listener) => {
                let (tx, rx) = impressions::listener_channel();
                tasks.push(tokio::spawn(impressions::listener_worker(
                    rx,
                    listener,
                    telemetry.clone(),
                )));
                Some(tx)
            }
            None => None,
        };
        let impressions = Arc::new(ImpressionsManager::new(
            config.impressions_mode,
            config.impressions_queue_size,
            telemetry.clone(),
            listener_tx,
        ));
        let events = Arc::new(EventsManager::new(config.events_queue_size, telemetry.clone()));

        let api = if api_key == LOCALHOST_API_KEY {
            let path = localhost::resolve_path(&config);
            localhost::load_into_storage(&path, &storage).await?;
            ready.send_replace(true);
            tasks.push(tokio::spawn(localhost::file_watcher(
                path,
                storage.clone(),
                config.features_refresh_rate(),
                shutdown_rx.clone(),
            )));
            None
        } else {
            let api = Arc::new(BackendApi::new(api_key, &config, telemetry.clone())?);
            let synchronizer = Arc::new(Synchronizer::new(
                api.clone() as Arc<dyn ChangeFetcher>,
                storage.clone(),
            ));

            let (mode_tx, mode_rx) = watch::channel(PollerMode::Normal);
            let (split_kick_tx, split_kick_rx) = mpsc::channel(4);
            let (segment_kick_tx, segment_kick_rx) = mpsc::channel(4);

            tasks.push(tokio::spawn(poller::split_poller(
                synchronizer.clone(),
                config.features_refresh_rate(),
                config.randomize_intervals,
                mode_rx.clone(),
                split_kick_rx,
                shutdown_rx.clone(),
            )));
            tasks.push(tokio::spawn(poller::segment_poller(
                synchronizer.clone(),
                config.segments_refresh_rate(),
                config.randomize_intervals,
                mode_rx,
                segment_kick_rx,
                shutdown_rx.clone(),
            )));

            if config.streaming_enabled {
                let (events_tx, events_rx) = mpsc::channel(64);
                tasks.push(tokio::spawn(sse::sse_client(
                    api.clone(),
                    events_tx,
                    telemetry.clone(),
                    shutdown_rx.clone(),
                )));
                let manager = SyncManager::new(
                    synchronizer.clone(),
                    telemetry.clone(),
                    true,
                    mode_tx,
                    split_kick_tx,
                    segment_kick_tx,
                );
                tasks.push(tokio::spawn(sync::run_manager(
                    manager,
                    events_rx,
                    shutdown_rx.clone(),
                )));
            }

            tasks.push(tokio::spawn(initial_sync(
                synchronizer,
                api.clone(),
                telemetry.clone(),
                config.clone(),
                ready.clone(),
                shutdown_rx.clone(),
            )));
            spawn_flushers(
                &mut tasks,
                api.clone(),
                impressions.clone(),
                events.clone(),
                telemetry.clone(),
                &config,
                shutdown_rx,
            );
            Some(api)
        };

        let inner = Arc::new(FactoryInner {
            config,
            storage,
            impressions,
            events,
            telemetry,
            destroyed: AtomicBool::new(false),
            ready,
        });

        Ok(Self {
            inner,
            api,
            api_key: api_key.to_string(),
            shutdown_tx,
            tasks: Mutex::new(tasks),
        })
    }

    /// Evaluation handle sharing this factory's storage and pipelines.
    pub fn client(&self) -> SplitClient {
        SplitClient::new(self.inner.clone())
    }

    /// Introspection handle over the cached definitions.
    pub fn manager(&self) -> SplitManager {
        SplitManager::new(self.inner.clone())
    }

    /// Whether the first full sync has completed.
    pub fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }

    /// Wait up to `ms` milliseconds for the first full sync.
    pub async fn block_until_ready(&self, ms: u64) -> Result<()> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(SdkError::Destroyed);
        }
        let mut ready_rx = self.inner.ready.subscribe();
        tokio::time::timeout(Duration::from_millis(ms), ready_rx.wait_for(|ready| *ready))
            .await
            .map_err(|_| SdkError::ReadyTimeout(ms))?
            .map_err(|_| SdkError::ReadyTimeout(ms))?;
        Ok(())
    }

    /// Shut the factory down: stop every task, attempt one final flush
    /// within the configured grace window, and invalidate all handles.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_tx.send_replace(true);

        if let Some(api) = &self.api {
            let grace = self.inner.config.shutdown_grace();
            let final_flush = async {
                flush_impressions_once(api, &self.inner.impressions, true).await;
                flush_counts_once(api, &self.inner.impressions).await;
                flush_unique_keys_once(api, &self.inner.impressions).await;
                flush_events_once(api, &self.inner.events, true).await;
                flush_usage_once(api, &self.inner.telemetry).await;
            };
            if tokio::time::timeout(grace, final_flush).await.is_err() {
                tracing::warn!("shutdown grace window expired before final flush completed");
            }
        }

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
        }
        unregister_api_key(&self.api_key);
        tracing::info!("factory destroyed");
    }
}

/// First full sync with retry; flips the readiness gate and sends the
/// config echo once it lands.
async fn initial_sync(
    synchronizer: Arc<Synchronizer>,
    api: Arc<BackendApi>,
    telemetry: Arc<Telemetry>,
    config: SdkConfig,
    ready: Arc<watch::Sender<bool>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let started = Instant::now();
    let mut backoff = Backoff::new(Duration::from_millis(500), config.features_refresh_rate());
    loop {
        tokio::select! {
            result = synchronizer.sync_all() => match result {
                Ok(()) => break,
                Err(error) => {
                    let delay = backoff.next();
                    tracing::warn!(%error, ?delay, "initial sync failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => return,
                    }
                }
            },
            _ = shutdown.changed() => return,
        }
    }
    ready.send_replace(true);
    tracing::info!(elapsed = ?started.elapsed(), "sdk ready");

    if let Some(echo) = telemetry.config_echo(&config, started.elapsed().as_millis() as u64) {
        if let Err(error) = api.post_config_echo(&echo).await {
            tracing::debug!(%error, "config echo delivery failed");
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_flushers(
    tasks: &mut Vec<JoinHandle<()>>,
    api: Arc<BackendApi>,
    impressions: Arc<ImpressionsManager>,
    events: Arc<EventsManager>,
    telemetry: Arc<Telemetry>,
    config: &SdkConfig,
    shutdown: watch::Receiver<bool>,
) {
    let secs = Duration::from_secs;
    {
        let api = api.clone();
        let impressions = impressions.clone();
        tasks.push(tokio::spawn(periodic(
            secs(config.impressions_refresh_rate_secs),
            shutdown.clone(),
            move || {
                let api = api.clone();
                let impressions = impressions.clone();
                async move { flush_impressions_once(&api, &impressions, false).await }
            },
        )));
    }
    {
        let api = api.clone();
        let impressions = impressions.clone();
        tasks.push(tokio::spawn(periodic(
            secs(config.impression_counts_refresh_rate_secs),
            shutdown.clone(),
            move || {
                let api = api.clone();
                let impressions = impressions.clone();
                async move { flush_counts_once(&api, &impressions).await }
            },
        )));
    }
    {
        let api = api.clone();
        tasks.push(tokio::spawn(periodic(
            secs(config.unique_keys_refresh_rate_secs),
            shutdown.clone(),
            move || {
                let api = api.clone();
                let impressions = impressions.clone();
                async move { flush_unique_keys_once(&api, &impressions).await }
            },
        )));
    }
    {
        let api = api.clone();
        tasks.push(tokio::spawn(periodic(
            secs(config.events_push_rate_secs),
            shutdown.clone(),
            move || {
                let api = api.clone();
                let events = events.clone();
                async move { flush_events_once(&api, &events, false).await }
            },
        )));
    }
    tasks.push(tokio::spawn(periodic(
        secs(config.metrics_refresh_rate_secs),
        shutdown,
        move || {
            let api = api.clone();
            let telemetry = telemetry.clone();
            async move { flush_usage_once(&api, &telemetry).await }
        },
    )));
}

/// Run `tick` on a cadence until shutdown.
async fn periodic<F, Fut>(interval: Duration, mut shutdown: watch::Receiver<bool>, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => tick().await,
            _ = shutdown.changed() => return,
        }
    }
}

/// Delivery policy shared by the flushers: a 4xx drops the batch, 5xx and
/// transport errors retry briefly, a final failure drops the batch too
/// (capacity counters already recorded the work).
async fn deliver<F, Fut>(payload: &str, single_attempt: bool, mut post: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<(), FetchError>>,
{
    let mut attempt = 0u32;
    loop {
        match post().await {
            Ok(()) => return,
            Err(error) if error.is_retryable() && attempt < 2 && !single_attempt => {
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(250 * u64::from(attempt))).await;
            }
            Err(error) => {
                tracing::warn!(%error, payload, "dropping delivery batch");
                return;
            }
        }
    }
}

async fn flush_impressions_once(
    api: &BackendApi,
    impressions: &ImpressionsManager,
    final_flush: bool,
) {
    let drained = impressions.drain();
    if drained.is_empty() {
        return;
    }
    let bulk = impressions::group_by_feature(drained);
    deliver("impressions", final_flush, || api.post_impressions(&bulk)).await;
}

async fn flush_counts_once(api: &BackendApi, impressions: &ImpressionsManager) {
    let counts = impressions.drain_counts();
    if counts.is_empty() {
        return;
    }
    deliver("impression counts", true, || {
        api.post_impression_counts(&counts)
    })
    .await;
}

async fn flush_unique_keys_once(api: &BackendApi, impressions: &ImpressionsManager) {
    let uniques = impressions.drain_unique_keys();
    if uniques.is_empty() {
        return;
    }
    deliver("unique keys", true, || api.post_unique_keys(&uniques)).await;
}

async fn flush_events_once(api: &BackendApi, events: &EventsManager, final_flush: bool) {
    let batch = events.drain();
    if batch.is_empty() {
        return;
    }
    deliver("events", final_flush, || api.post_events(&batch)).await;
}

async fn flush_usage_once(api: &BackendApi, telemetry: &Telemetry) {
    let usage = telemetry.usage_snapshot();
    deliver("telemetry", true, || api.post_usage(&usage)).await;
}
