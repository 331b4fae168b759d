//! Host harness for the FalconTruck offline controller.
//!
//! Runs the controller against the real network and keeps its buckets and
//! pending submissions in a JSON state file between runs.
//!
//! ## Usage
//!
//! ```bash
//! # Precache the app shell and drop stale buckets
//! falcon-sw-host --scope http://localhost:3000/ install
//!
//! # Resolve requests the way an installed worker would
//! falcon-sw-host resolve /catalogo --navigate
//! falcon-sw-host resolve /icons/icon-192x192.png /api/cotacao
//!
//! # Inspect buckets
//! falcon-sw-host buckets
//!
//! # Queue a quotation and replay the queue
//! falcon-sw-host submit '{"cliente":"Transportes Silva","itens":[]}'
//! falcon-sw-host sync
//!
//! # Preview the notification for a push payload
//! falcon-sw-host push '{"title":"Cotação aprovada"}'
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use falcon_common::logging::{init_logging, LogConfig, LogFormat};
use falcon_net::{Destination, LoaderConfig, Request, RequestMode, ResourceLoader};
use falcon_sw::{
    CacheSnapshot, Clients, ControllerConfig, ControllerEvent, MemoryCacheStore, MemorySyncQueue,
    OfflineController, PendingSyncItem,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::info;
use url::Url;

#[derive(Parser)]
#[command(name = "falcon-sw-host")]
#[command(about = "Run the FalconTruck offline controller outside the browser")]
struct Cli {
    /// Controller configuration (JSON); built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured scope
    #[arg(long)]
    scope: Option<Url>,

    /// State file holding buckets and pending submissions
    #[arg(long)]
    state: Option<PathBuf>,

    /// Log format (pretty, compact, json)
    #[arg(long, default_value = "compact")]
    log_format: LogFormat,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install and activate: precache the app shell, prune old buckets
    Install,

    /// Resolve URLs through the controller
    Resolve {
        /// URLs, absolute or relative to the scope
        #[arg(required = true)]
        urls: Vec<String>,
        /// Treat as top-level navigations
        #[arg(long)]
        navigate: bool,
        /// Declared destination; guessed from the extension when omitted
        #[arg(long, value_enum)]
        destination: Option<DestinationArg>,
    },

    /// List buckets and their entry counts
    Buckets,

    /// Queue a submission for background sync
    Submit {
        /// Submission JSON
        payload: String,
    },

    /// Replay queued submissions
    Sync {
        /// Sync tag; the configured one when omitted
        #[arg(long)]
        tag: Option<String>,
    },

    /// Show the notification a push payload would produce
    Push {
        /// Payload JSON
        payload: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum DestinationArg {
    Document,
    Image,
    Script,
    Style,
    Font,
    Manifest,
}

impl From<DestinationArg> for Destination {
    fn from(arg: DestinationArg) -> Self {
        match arg {
            DestinationArg::Document => Destination::Document,
            DestinationArg::Image => Destination::Image,
            DestinationArg::Script => Destination::Script,
            DestinationArg::Style => Destination::Style,
            DestinationArg::Font => Destination::Font,
            DestinationArg::Manifest => Destination::Manifest,
        }
    }
}

/// What survives between runs.
#[derive(Debug, Default, Serialize, Deserialize)]
struct HostState {
    caches: CacheSnapshot,
    #[serde(default)]
    queue: Vec<PendingSyncItem>,
}

impl HostState {
    fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading state file {}", path.display()))?;
        serde_json::from_str(&json).with_context(|| format!("parsing state file {}", path.display()))
    }

    fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("writing state file {}", path.display()))
    }
}

fn default_state_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("falcontruck")
        .join("sw-state.json")
}

/// Controller plus the concrete stores it was built over.
struct Host {
    controller: OfflineController,
    events: UnboundedReceiver<ControllerEvent>,
    store: Arc<MemoryCacheStore>,
    queue: Arc<MemorySyncQueue>,
}

impl Host {
    fn new(config: ControllerConfig, state: HostState) -> Result<Self> {
        let store = Arc::new(MemoryCacheStore::from_snapshot(state.caches));
        let queue = Arc::new(MemorySyncQueue::from_items(state.queue));
        let loader = ResourceLoader::new(LoaderConfig::default()).context("building HTTP client")?;

        let (controller, events) = OfflineController::new(
            config,
            store.clone(),
            Arc::new(loader),
            Arc::new(Clients::new()),
            queue.clone(),
        )?;

        Ok(Self {
            controller,
            events,
            store,
            queue,
        })
    }

    fn log_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            info!(?event, "Controller event");
        }
    }

    async fn state(&self) -> HostState {
        HostState {
            caches: self.store.snapshot().await,
            queue: self.queue.snapshot().await,
        }
    }
}

fn load_config(cli: &Cli) -> Result<ControllerConfig> {
    let mut config = match &cli.config {
        Some(path) => ControllerConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ControllerConfig::default(),
    };
    if let Some(scope) = &cli.scope {
        config.scope = scope.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::debug()
    } else {
        LogConfig::default()
    };
    init_logging(log_config.with_format(cli.log_format))?;

    let config = load_config(&cli)?;
    let state_path = cli.state.clone().unwrap_or_else(default_state_path);
    let mut host = Host::new(config, HostState::load(&state_path)?)?;

    match cli.command {
        Commands::Install => {
            let (install, activate) = host.controller.start().await?;

            println!("Installed into {}", install.bucket);
            println!("  Cached: {}", install.cached.len());
            for (url, reason) in &install.failed {
                println!("  Failed: {url} ({reason})");
            }
            if let Some(activate) = activate {
                for name in &activate.deleted {
                    println!("  Deleted stale bucket: {name}");
                }
            }
        }

        Commands::Resolve {
            urls,
            navigate,
            destination,
        } => {
            for raw in urls {
                let url = host.controller.config().resolve(&raw)?;
                let destination = destination
                    .map(Destination::from)
                    .unwrap_or_else(|| Destination::guess(&url));
                let mut request = Request::get(url.clone()).destination(destination);
                if navigate {
                    request = request.mode(RequestMode::Navigate);
                }

                match host.controller.handle_fetch(request).await {
                    Ok(Some(outcome)) => println!(
                        "{url} {} {:?}/{:?} {} bytes",
                        outcome.response.status,
                        outcome.strategy,
                        outcome.source,
                        outcome.response.body().len()
                    ),
                    Ok(None) => println!("{url} not handled"),
                    Err(e) => println!("{url} failed: {e}"),
                }
            }
            host.controller.settle().await;
        }

        Commands::Buckets => {
            let buckets = host.controller.config().bucket_names();
            for cache in host.store.snapshot().await.caches {
                let marker = if buckets.is_current(&cache.name) {
                    "current"
                } else {
                    "stale"
                };
                println!("{} ({} entries, {marker})", cache.name, cache.len());
            }
        }

        Commands::Submit { payload } => {
            let body: serde_json::Value =
                serde_json::from_str(&payload).context("parsing submission JSON")?;
            let item = host.controller.enqueue_submission(body).await?;
            println!("Queued {} for {} (key {})", item.id, item.url, item.idempotency_key);
        }

        Commands::Sync { tag } => {
            let tag = tag.unwrap_or_else(|| host.controller.config().sync.tag.clone());
            match host.controller.handle_sync(&tag).await? {
                Some(report) => {
                    println!("Delivered {}/{}", report.delivered, report.attempted);
                    for (id, reason) in &report.failed {
                        println!("  Still queued: {id} ({reason})");
                    }
                }
                None => println!("Unknown sync tag '{tag}'"),
            }
        }

        Commands::Push { payload } => match host.controller.handle_push(Some(payload.as_bytes())).await? {
            Some(notification) => println!("{}", serde_json::to_string_pretty(&notification)?),
            None => println!("No notification (payload did not decode)"),
        },
    }

    host.log_events();
    host.state().await.save(&state_path)?;
    Ok(())
}
