//! Controller configuration

use std::path::Path;
use std::time::Duration;

use falcon_common::FalconError;
use serde::{Deserialize, Serialize};
use url::Url;

/// Offline controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Deployed asset-set version, suffixed onto bucket names
    pub version: String,

    /// Bucket name prefix; empty for bare `static-<version>` names
    pub cache_prefix: String,

    /// Origin and base path the controller serves
    pub scope: Url,

    /// Document served when a navigation cannot be satisfied
    pub root_document: String,

    /// App shell fetched into the static bucket at install time
    pub precache: Vec<String>,

    /// URL fragments that always go to the network first
    pub network_first_patterns: Vec<String>,

    /// Network deadline in milliseconds; `None` waits forever
    pub fetch_timeout_ms: Option<u64>,

    /// Background sync settings
    pub sync: SyncConfig,

    /// Push notification settings
    pub notification: NotificationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Tag the page registers when a submission fails offline
    pub tag: String,

    /// Endpoint queued submissions are replayed to
    pub endpoint: String,

    /// Attempts per queued item on each drain
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub default_title: String,
    pub default_body: String,
    pub icon: String,
    pub badge: String,
    pub action_icon: String,
    pub vibrate: Vec<u32>,
    pub tag: String,
    pub open_label: String,
    pub close_label: String,

    /// Window focused or opened by the `open` action
    pub open_url: String,
}

/// Names of the two buckets that are current for a version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketNames {
    pub static_name: String,
    pub dynamic_name: String,
}

impl BucketNames {
    /// Build the bucket names for a prefix and version.
    pub fn new(prefix: &str, version: &str) -> Self {
        let name = |role: &str| {
            if prefix.is_empty() {
                format!("{role}-{version}")
            } else {
                format!("{prefix}-{role}-{version}")
            }
        };

        Self {
            static_name: name("static"),
            dynamic_name: name("dynamic"),
        }
    }

    /// Whether a bucket name belongs to the current version.
    pub fn is_current(&self, name: &str) -> bool {
        name == self.static_name || name == self.dynamic_name
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            version: "v1.0.0".to_string(),
            cache_prefix: "falcontruck".to_string(),
            scope: Url::parse("http://localhost:3000/").expect("static scope URL is valid"),
            root_document: "/index.html".to_string(),
            precache: [
                "/",
                "/index.html",
                "/src/main.jsx",
                "/src/App.jsx",
                "/src/index.css",
                "/src/App.css",
                "/manifest.json",
                "/icons/icon-192x192.png",
                "/icons/icon-512x512.png",
                "https://fonts.googleapis.com/css2?family=Inter:wght@300;400;500;600;700&display=swap",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            network_first_patterns: ["/api/", "supabase.co", "googleapis.com"]
                .into_iter()
                .map(String::from)
                .collect(),
            fetch_timeout_ms: Some(30_000),
            sync: SyncConfig::default(),
            notification: NotificationConfig::default(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tag: "sync-cotacao".to_string(),
            endpoint: "/api/cotacao".to_string(),
            max_attempts: 1,
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            default_title: "FalconTruck".to_string(),
            default_body: "Nova atualização disponível".to_string(),
            icon: "/icons/icon-192x192.png".to_string(),
            badge: "/icons/icon-72x72.png".to_string(),
            action_icon: "/icons/icon-72x72.png".to_string(),
            vibrate: vec![200, 100, 200],
            tag: "falcontruck-notification".to_string(),
            open_label: "Abrir App".to_string(),
            close_label: "Fechar".to_string(),
            open_url: "/".to_string(),
        }
    }
}

impl ControllerConfig {
    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, FalconError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), version = %config.version, "Loaded controller config");
        Ok(config)
    }

    /// Check that the configuration is usable.
    pub fn validate(&self) -> Result<(), FalconError> {
        if self.version.trim().is_empty() {
            return Err(FalconError::config("version must not be empty"));
        }
        if !matches!(self.scope.scheme(), "http" | "https") {
            return Err(FalconError::config(format!(
                "scope must be http(s), got '{}'",
                self.scope.scheme()
            )));
        }
        if self.sync.tag.is_empty() {
            return Err(FalconError::config("sync tag must not be empty"));
        }
        self.resolve(&self.root_document)?;
        self.resolve(&self.sync.endpoint)?;
        self.resolve(&self.notification.open_url)?;
        for entry in &self.precache {
            self.resolve(entry)?;
        }
        Ok(())
    }

    /// Current bucket names.
    pub fn bucket_names(&self) -> BucketNames {
        BucketNames::new(&self.cache_prefix, &self.version)
    }

    /// Network deadline, if any.
    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout_ms.map(Duration::from_millis)
    }

    /// Resolve a path or absolute URL against the scope.
    pub fn resolve(&self, path: &str) -> Result<Url, FalconError> {
        self.scope
            .join(path)
            .map_err(|e| FalconError::config_with_source(format!("cannot resolve '{path}'"), e))
    }

    /// Absolute URL of the root document.
    pub fn root_document_url(&self) -> Result<Url, FalconError> {
        self.resolve(&self.root_document)
    }
}
