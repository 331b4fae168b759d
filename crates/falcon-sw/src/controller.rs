//! The offline controller: one object per worker instance, built over
//! injected capabilities, with one entry point per platform event.

use std::sync::Arc;

use falcon_common::RetryConfig;
use falcon_net::Request;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::CacheStore;
use crate::clients::ClientHost;
use crate::config::ControllerConfig;
use crate::fetch::Fetcher;
use crate::lifecycle::{self, ActivateReport, InstallReport, Lifecycle, WorkerState};
use crate::push::{self, ClickOutcome, Notification, PushPayload};
use crate::route::{Router, Strategy};
use crate::strategy::{self, BackgroundTasks, FetchOutcome, StrategyContext};
use crate::sync::{self, PendingSyncItem, SyncQueue, SyncReport};
use crate::Result;

/// Events broadcast to pages.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    /// Worker state changed.
    StateChange { state: WorkerState },
    /// Install finished with missing app-shell entries.
    InstallFailed { failed: usize },
    /// A stale bucket was deleted.
    CacheDeleted { name: String },
    /// Open pages are now controlled.
    ControllerChange { claimed: usize },
    /// A sync drain finished.
    SyncCompleted { report: SyncReport },
    /// A notification was displayed.
    NotificationShown { tag: String },
}

/// Control messages pages may post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControllerMessage {
    /// Activate a waiting update now.
    #[serde(rename = "SKIP_WAITING")]
    SkipWaiting,
    #[serde(other)]
    Unknown,
}

/// Offline cache controller.
pub struct OfflineController {
    config: ControllerConfig,
    router: Router,
    ctx: StrategyContext,
    clients: Arc<dyn ClientHost>,
    queue: Arc<dyn SyncQueue>,
    sync_retry: RetryConfig,
    precache: Vec<Url>,
    open_url: Url,
    lifecycle: RwLock<Lifecycle>,
    event_tx: mpsc::UnboundedSender<ControllerEvent>,
}

impl OfflineController {
    /// Build a controller. The configuration is validated first.
    pub fn new(
        config: ControllerConfig,
        store: Arc<dyn CacheStore>,
        fetcher: Arc<dyn Fetcher>,
        clients: Arc<dyn ClientHost>,
        queue: Arc<dyn SyncQueue>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ControllerEvent>)> {
        config.validate()?;

        let precache = config
            .precache
            .iter()
            .map(|entry| config.resolve(entry))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let open_url = config.resolve(&config.notification.open_url)?;

        let ctx = StrategyContext {
            store,
            fetcher,
            buckets: config.bucket_names(),
            root_document: config.root_document_url()?,
            fetch_timeout: config.fetch_timeout(),
            background: Arc::new(BackgroundTasks::default()),
        };

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        info!(
            version = %config.version,
            static_bucket = %ctx.buckets.static_name,
            dynamic_bucket = %ctx.buckets.dynamic_name,
            "Offline controller created"
        );

        Ok((
            Self {
                router: Router::with_network_first_patterns(config.network_first_patterns.clone()),
                sync_retry: RetryConfig::attempts(config.sync.max_attempts),
                config,
                ctx,
                clients,
                queue,
                precache,
                open_url,
                lifecycle: RwLock::new(Lifecycle::default()),
                event_tx,
            },
            event_rx,
        ))
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Current worker state.
    pub async fn state(&self) -> WorkerState {
        self.lifecycle.read().await.state()
    }

    fn emit(&self, event: ControllerEvent) {
        let _ = self.event_tx.send(event);
    }

    async fn transition<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Lifecycle) -> Result<()>,
    {
        let mut lifecycle = self.lifecycle.write().await;
        let before = lifecycle.state();
        f(&mut lifecycle)?;
        let after = lifecycle.state();
        drop(lifecycle);

        if before != after {
            self.emit(ControllerEvent::StateChange { state: after });
        }
        Ok(())
    }

    // ==================== Lifecycle ====================

    /// Precache the app shell into the static bucket.
    ///
    /// A failed manifest entry does not fail the call: it is logged, counted
    /// in the report, and the worker still becomes `Installed` with
    /// skip-waiting requested.
    pub async fn install(&self) -> Result<InstallReport> {
        info!("Installing offline controller");
        self.transition(|l| l.begin_install()).await?;

        let report = match lifecycle::precache(&self.ctx, &self.precache).await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Error caching static assets");
                InstallReport {
                    bucket: self.ctx.buckets.static_name.clone(),
                    failed: vec![(self.ctx.buckets.static_name.clone(), e.to_string())],
                    ..Default::default()
                }
            }
        };

        if !report.is_complete() {
            self.emit(ControllerEvent::InstallFailed {
                failed: report.failed.len(),
            });
        }

        self.transition(|l| {
            l.request_skip_waiting();
            l.install_complete();
            Ok(())
        })
        .await?;

        Ok(report)
    }

    /// Delete stale buckets and claim open pages. Idempotent.
    pub async fn activate(&self) -> Result<ActivateReport> {
        info!("Activating offline controller");
        self.transition(|l| l.begin_activate()).await?;

        let (deleted, kept) = match lifecycle::prune(&self.ctx, &self.ctx.buckets).await {
            Ok(pruned) => pruned,
            Err(e) => {
                // leave the worker usable; the next activation retries
                self.transition(|l| {
                    l.activate_complete();
                    Ok(())
                })
                .await?;
                return Err(e);
            }
        };
        for name in &deleted {
            self.emit(ControllerEvent::CacheDeleted { name: name.clone() });
        }

        self.transition(|l| {
            l.activate_complete();
            Ok(())
        })
        .await?;

        let clients_claimed = self.clients.claim().await?;
        self.emit(ControllerEvent::ControllerChange {
            claimed: clients_claimed,
        });

        Ok(ActivateReport {
            deleted,
            kept,
            clients_claimed,
        })
    }

    /// Install, then activate straight away if skip-waiting was requested.
    pub async fn start(&self) -> Result<(InstallReport, Option<ActivateReport>)> {
        let install = self.install().await?;
        let activate = if self.lifecycle.read().await.should_activate() {
            Some(self.activate().await?)
        } else {
            None
        };
        Ok((install, activate))
    }

    /// Retire this worker once a newer one has taken over.
    pub async fn mark_redundant(&self) -> Result<()> {
        info!("Offline controller replaced");
        self.transition(|l| {
            l.mark_redundant();
            Ok(())
        })
        .await
    }

    // ==================== Fetch ====================

    /// Which strategy a request would get.
    pub fn classify(&self, request: &Request) -> Strategy {
        self.router.classify_request(request)
    }

    /// Intercept a request. Non-HTTP schemes are not handled (`Ok(None)`);
    /// the host performs them itself.
    pub async fn handle_fetch(&self, request: Request) -> Result<Option<FetchOutcome>> {
        if !matches!(request.url.scheme(), "http" | "https") {
            debug!(url = %request.url, "Ignoring non-HTTP request");
            return Ok(None);
        }
        self.resolve(request).await.map(Some)
    }

    /// Classify and resolve a request.
    pub async fn resolve(&self, request: Request) -> Result<FetchOutcome> {
        let strategy = self.classify(&request);
        debug!(url = %request.url, ?strategy, "Resolving request");
        strategy::resolve(&self.ctx, strategy, request).await
    }

    /// Wait for background revalidations to finish.
    pub async fn settle(&self) {
        self.ctx.background.settle().await;
    }

    // ==================== Sync ====================

    /// Queue a submission that could not reach the server.
    pub async fn enqueue_submission(&self, body: JsonValue) -> Result<PendingSyncItem> {
        let url = self.config.resolve(&self.config.sync.endpoint)?;
        let item = PendingSyncItem::post(url, body);
        self.queue.push(item.clone()).await?;
        debug!(id = %item.id, "Queued submission for background sync");
        Ok(item)
    }

    /// React to a background-sync trigger. Tags other than the configured
    /// one are ignored (`Ok(None)`).
    pub async fn handle_sync(&self, tag: &str) -> Result<Option<SyncReport>> {
        info!(tag, "Background sync");
        if tag != self.config.sync.tag {
            debug!(tag, "Unknown sync tag");
            return Ok(None);
        }

        let report = sync::drain(self.queue.as_ref(), &self.ctx, &self.sync_retry).await?;
        self.emit(ControllerEvent::SyncCompleted {
            report: report.clone(),
        });
        Ok(Some(report))
    }

    // ==================== Push ====================

    /// Show a notification for a push. No payload, or one that does not
    /// decode, shows nothing.
    pub async fn handle_push(&self, data: Option<&[u8]>) -> Result<Option<Notification>> {
        info!("Push received");
        let Some(payload) = PushPayload::decode(data) else {
            return Ok(None);
        };

        let notification = Notification::from_payload(payload, &self.config.notification);
        self.clients.show_notification(&notification).await?;
        self.emit(ControllerEvent::NotificationShown {
            tag: notification.tag.clone(),
        });
        Ok(Some(notification))
    }

    /// Handle a click on a notification or one of its actions.
    pub async fn handle_notification_click(
        &self,
        tag: &str,
        action: Option<&str>,
    ) -> Result<ClickOutcome> {
        info!(tag, ?action, "Notification clicked");
        push::handle_click(self.clients.as_ref(), tag, action, &self.open_url).await
    }

    // ==================== Messages ====================

    /// Handle a control message posted by a page.
    pub async fn handle_message(&self, raw: &str) -> Result<ControllerMessage> {
        let message: ControllerMessage = serde_json::from_str(raw)
            .map_err(|e| crate::SwError::Message(e.to_string()))?;

        match message {
            ControllerMessage::SkipWaiting => {
                let waiting = {
                    let mut lifecycle = self.lifecycle.write().await;
                    lifecycle.request_skip_waiting();
                    lifecycle.should_activate()
                };
                if waiting {
                    self.activate().await?;
                }
            }
            ControllerMessage::Unknown => warn!(raw, "Ignoring unknown message"),
        }
        Ok(message)
    }
}
