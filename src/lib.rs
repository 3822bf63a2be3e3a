//! # adc-dl
//!
//! Highly configurable backend library for ADC/NMDC file-sharing clients.
//!
//! ## Design Philosophy
//!
//! adc-dl is designed to be:
//! - **Highly configurable** - Almost every behavior can be customized
//! - **Sensible defaults** - Works out of the box with zero configuration
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Event-driven** - Consumers subscribe to events, no polling required
//!
//! The core is four subsystems: the download queue and bundle engine, the
//! upload slot manager, the hub connection state machine, and the shared
//! content index with Tiger-tree verification. Hosts drive them through
//! [`AdcDownloader`] and the typed [`api`] boundary.
//!
//! ## Quick Start
//!
//! ```no_run
//! use adc_dl::{AdcDownloader, Config};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config {
//!         download_dir: "/data/downloads".into(),
//!         ..Default::default()
//!     };
//!
//!     let downloader = AdcDownloader::new(config).await?;
//!
//!     // Subscribe to events
//!     let mut events = downloader.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let hub = downloader.connect_hub("adc://hub.example.org:1511").await?;
//!     let _ = hub;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Typed API boundary for host web layers
pub mod api;
/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Per-IP sliding-window flood counting
pub mod flood;
/// File hashing worker and pause guard
pub mod hasher;
/// First-class extension hooks
pub mod hooks;
/// Hub connection state machine and protocol adaptors
pub mod hub;
/// Download queue and bundle engine
pub mod queue;
/// Recent hubs
pub mod recents;
/// Byte-range segments
pub mod segment;
/// Content index and refresh pipeline
pub mod share;
/// Periodic tick service
pub mod timer;
/// Tiger tree hashes
pub mod tth;
/// Core types and events
pub mod types;
/// Upload slot manager
pub mod upload;
/// Utility functions
pub mod utils;
/// XML persistence helpers
pub(crate) mod xml;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast, mpsc};
use tokio_util::sync::CancellationToken;

// Re-export commonly used types
pub use api::{ApiOutcome, ApiRequest, ApiResponse, ApiRouter, RequestHandler};
pub use config::{AutoPriorityMode, Config, HubConfig, QueueConfig, ShareConfig, UploadConfig};
pub use error::{ApiError, Error, HookRejection, QueueError, Result, ShareError, ToHttpStatus};
pub use hub::{HubRequest, HubSession};
pub use queue::{BundleAddInfo, BundleFileInfo, QueueManager};
pub use segment::{Segment, SegmentSet};
pub use share::{SearchQuery, ShareManager};
pub use timer::TimerService;
pub use tth::Tth;
pub use types::{BundleStatus, Event, HintedUser, Priority, QueueItemStatus, QueueToken};
pub use upload::UploadManager;

use hasher::Hasher;
use recents::RecentManager;

struct CoreInner {
    config: Arc<Config>,
    event_tx: broadcast::Sender<Event>,
    timer: TimerService,
    share: ShareManager,
    queue: QueueManager,
    uploads: UploadManager,
    recents: RecentManager,
    hubs: RwLock<HashMap<String, HubSession>>,
    /// Hub requests (CTM, RCM, PBD, searches) for the host's connection manager
    hub_requests_tx: mpsc::UnboundedSender<(String, HubRequest)>,
    hub_requests_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<(String, HubRequest)>>>,
    started_at: chrono::DateTime<chrono::Utc>,
    cancel: CancellationToken,
}

/// Main library instance (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct AdcDownloader {
    inner: Arc<CoreInner>,
}

impl AdcDownloader {
    /// Create an instance: validates the configuration, loads persisted
    /// bundles, shares and recents, and starts the background services.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.state_dir).await?;
        tokio::fs::create_dir_all(&config.download_dir).await?;
        tokio::fs::create_dir_all(config.effective_temp_dir()).await?;

        let config = Arc::new(config);
        let (event_tx, _) = broadcast::channel(1024);
        let hasher = Hasher::new();

        let share = ShareManager::new(&config, event_tx.clone(), hasher.clone()).await?;
        let queue = QueueManager::new(config.clone(), event_tx.clone(), hasher.clone()).await?;
        queue.set_share(share.clone());
        let uploads = UploadManager::new(config.upload.clone(), share.clone(), event_tx.clone());
        let recents = RecentManager::new(&config.state_dir, event_tx.clone()).await?;

        let (hub_requests_tx, hub_requests_rx) = mpsc::unbounded_channel();
        let downloader = Self {
            inner: Arc::new(CoreInner {
                config,
                event_tx,
                timer: TimerService::new(),
                share,
                queue,
                uploads,
                recents,
                hubs: RwLock::new(HashMap::new()),
                hub_requests_tx,
                hub_requests_rx: tokio::sync::Mutex::new(Some(hub_requests_rx)),
                started_at: chrono::Utc::now(),
                cancel: CancellationToken::new(),
            }),
        };
        downloader.start().await;
        Ok(downloader)
    }

    async fn start(&self) {
        self.inner.timer.spawn();
        self.inner.share.spawn().await;

        // Second tick: hub pacing, upload delay expiry, queue search rotation
        // and the periodic bundle flush.
        let core = self.clone();
        let mut second = self.inner.timer.subscribe_second();
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            let save_every = core.inner.config.queue.save_interval_secs.max(1);
            let autoprio_every = core.inner.config.queue.auto_priority_interval_secs.max(1);
            let mut ticks = 0u64;
            loop {
                let now = tokio::select! {
                    _ = cancel.cancelled() => return,
                    tick = second.recv() => match tick {
                        Ok(now) => now,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                };
                ticks += 1;

                for hub in core.inner.hubs.read().await.values() {
                    hub.tick(now).await;
                }
                core.inner.uploads.tick(now).await;
                core.run_search_rotation(now).await;

                if ticks.is_multiple_of(save_every)
                    && let Err(e) = core.inner.queue.flush_dirty().await
                {
                    tracing::warn!(error = %e, "bundle flush failed");
                }
                if ticks.is_multiple_of(autoprio_every) {
                    core.inner.queue.run_auto_priority().await;
                }
            }
        });

        // Minute tick: disk-space recovery.
        let core = self.clone();
        let mut minute = self.inner.timer.subscribe_minute();
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    tick = minute.recv() => {
                        if tick.is_err() {
                            return;
                        }
                        core.inner.queue.resume_space_errors().await;
                    }
                }
            }
        });

        // Completed bundles become Shared once a refresh indexes them.
        let core = self.clone();
        let mut events = self.inner.event_tx.subscribe();
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = events.recv() => match event {
                        Ok(Event::RefreshCompleted { .. }) => {
                            core.inner.queue.promote_shared_bundles().await;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                }
            }
        });
    }

    /// One search-rotation pass: the due bundle's representative files go out
    /// as TTH searches through every connected hub.
    async fn run_search_rotation(&self, now: u64) {
        let Some((bundle, items)) = self.inner.queue.next_search(now).await else {
            return;
        };
        tracing::debug!(bundle = bundle.get(), files = items.len(), "searching for alternates");
        let hubs = self.inner.hubs.read().await;
        for item in items {
            for hub in hubs.values() {
                let _ = hub
                    .queue_search(hub::search_queue::PendingSearch {
                        priority: 0,
                        token: format!("as{}", item.item),
                        query: SearchQuery {
                            tth: Some(item.tth),
                            ..SearchQuery::default()
                        },
                    })
                    .await;
            }
        }
    }

    /// Subscribe to core events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.event_tx.subscribe()
    }

    /// The download queue and bundle engine
    pub fn queue(&self) -> &QueueManager {
        &self.inner.queue
    }

    /// The content index
    pub fn share(&self) -> &ShareManager {
        &self.inner.share
    }

    /// The upload slot manager
    pub fn uploads(&self) -> &UploadManager {
        &self.inner.uploads
    }

    /// The recent-hubs list
    pub fn recents(&self) -> &RecentManager {
        &self.inner.recents
    }

    /// Take the hub-request stream (CTM, RCM, PBD, searches) once; the host's
    /// connection manager consumes it.
    pub async fn take_hub_requests(
        &self,
    ) -> Option<mpsc::UnboundedReceiver<(String, HubRequest)>> {
        self.inner.hub_requests_rx.lock().await.take()
    }

    /// Open a session to a hub and start connecting
    pub async fn connect_hub(&self, url: &str) -> Result<HubSession> {
        {
            let hubs = self.inner.hubs.read().await;
            if let Some(existing) = hubs.get(url) {
                return Ok(existing.clone());
            }
        }
        let session = HubSession::new(url, self.inner.config.hub.clone(), self.inner.event_tx.clone())?;

        // Searches feed the content index and the partial-bundle exchange;
        // everything is also forwarded to the host's connection manager.
        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
        session.set_request_sink(sink_tx);
        let core = self.clone();
        let hub_url = url.to_string();
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            loop {
                let request = tokio::select! {
                    _ = cancel.cancelled() => return,
                    req = sink_rx.recv() => match req {
                        Some(r) => r,
                        None => return,
                    },
                };
                match &request {
                    HubRequest::Search { query, .. } => {
                        let hits = core.inner.share.search(query, share::DEFAULT_PROFILE).await;
                        if hits.is_empty()
                            && let Some(tth) = &query.tth
                            && let Some(notify) = core.inner.queue.pbd_for_search(tth).await
                        {
                            tracing::debug!(
                                bundle = notify.bundle.get(),
                                "search matched a queued item, partial-bundle answer"
                            );
                        }
                    }
                    HubRequest::SearchResult {
                        user, tth: Some(tth), ..
                    } => {
                        // A response for queued content contributes a source.
                        let touched = core
                            .inner
                            .queue
                            .on_search_result(tth, user.clone(), false)
                            .await;
                        if !touched.is_empty() {
                            tracing::debug!(
                                items = touched.len(),
                                nick = user.nick,
                                "search result added a source"
                            );
                        }
                    }
                    _ => {}
                }
                let _ = core.inner.hub_requests_tx.send((hub_url.clone(), request));
            }
        });

        session.connect().await;
        self.inner.recents.touch(url, url).await;
        self.inner
            .hubs
            .write()
            .await
            .insert(url.to_string(), session.clone());
        Ok(session)
    }

    /// Close and drop a hub session
    pub async fn disconnect_hub(&self, url: &str) -> Result<()> {
        let session = self
            .inner
            .hubs
            .write()
            .await
            .remove(url)
            .ok_or_else(|| Error::NotFound(format!("hub {url}")))?;
        session.shutdown().await;
        Ok(())
    }

    /// Build the router exposing the core over the API boundary
    pub fn api_router(&self) -> ApiRouter {
        let mut router = ApiRouter::new();
        router.mount(
            "system",
            Arc::new(api::StatusHandler {
                started_at: self.inner.started_at,
            }),
        );
        router.mount(
            "queue",
            Arc::new(api::QueueHandler {
                queue: self.inner.queue.clone(),
            }),
        );
        router
    }

    /// Graceful shutdown: stop services, drain hubs, persist state
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("shutting down");
        let _ = self.inner.event_tx.send(Event::Shutdown);
        self.inner.cancel.cancel();
        self.inner.timer.stop();

        let hubs: Vec<HubSession> = self.inner.hubs.write().await.drain().map(|(_, s)| s).collect();
        for hub in hubs {
            hub.shutdown().await;
        }
        self.inner.share.shutdown().await?;
        self.inner.queue.shutdown().await?;
        self.inner.recents.save().await?;
        Ok(())
    }
}

/// Helper function to run the downloader with graceful signal handling.
///
/// Waits for a termination signal and then calls the downloader's
/// `shutdown()` method.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal
///   registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
pub async fn run_with_shutdown(downloader: AdcDownloader) -> Result<()> {
    wait_for_signal().await;
    downloader.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Signal registration may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
            } else {
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
            } else {
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
