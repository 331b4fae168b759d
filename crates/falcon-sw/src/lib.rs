//! # Falcon SW
//!
//! Offline cache controller for the FalconTruck catalog. This is the
//! service worker of the web app, expressed as an explicit controller object
//! over injected capabilities so it can run (and be tested) without a browser.
//!
//! ## Features
//!
//! - **Lifecycle**: install (precache the app shell), activate (drop stale
//!   buckets, claim clients), skip-waiting on request
//! - **Fetch interception**: rule-table routing into cache-first,
//!   network-first, or stale-while-revalidate
//! - **Background sync**: replay of queued quotation submissions
//! - **Push**: notification display and click handling
//!
//! ## Architecture
//!
//! ```text
//! OfflineController
//!     ├── Router ──────────── (url, destination, mode) → Strategy
//!     ├── StrategyContext
//!     │       ├── CacheStore   (falcontruck-static-v1.0.0, falcontruck-dynamic-v1.0.0)
//!     │       └── Fetcher      (network)
//!     ├── Lifecycle            (Parsed → Installing → Installed → Activating → Activated)
//!     ├── SyncQueue            (pending submissions)
//!     └── ClientHost           (pages, windows, notifications)
//! ```

use falcon_common::FalconError;
use thiserror::Error;

pub mod cache;
pub mod clients;
pub mod config;
pub mod controller;
pub mod fetch;
pub mod lifecycle;
pub mod push;
pub mod route;
pub mod strategy;
pub mod sync;

pub use cache::{CacheEntry, CacheSnapshot, CacheStore, MemoryCacheStore};
pub use clients::{Client, ClientHost, ClientType, Clients};
pub use config::{BucketNames, ControllerConfig, NotificationConfig, SyncConfig};
pub use controller::{ControllerEvent, ControllerMessage, OfflineController};
pub use fetch::Fetcher;
pub use lifecycle::{ActivateReport, InstallReport, WorkerState};
pub use push::{ClickOutcome, Notification, NotificationAction, PushPayload};
pub use route::{Predicate, RouteRule, Router, Strategy};
pub use strategy::{FetchOutcome, ResponseSource};
pub use sync::{MemorySyncQueue, PendingSyncItem, SyncQueue, SyncReport};

// ==================== Errors ====================

/// Errors that can occur in offline controller operations.
#[derive(Error, Debug)]
pub enum SwError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Client error: {0}")]
    Client(String),

    #[error("Invalid message: {0}")]
    Message(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Common(#[from] FalconError),
}

impl SwError {
    /// Whether the error came from the network (including timeouts).
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            SwError::Network(_) | SwError::Common(FalconError::Timeout(_))
        )
    }
}

impl From<falcon_net::NetError> for SwError {
    fn from(err: falcon_net::NetError) -> Self {
        SwError::Network(err.to_string())
    }
}

/// Result type alias for controller operations.
pub type Result<T> = std::result::Result<T, SwError>;
