//! Install/activate lifecycle: the versioned hand-off from one deployed
//! asset set to the next.

use falcon_net::Request;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use url::Url;

use crate::cache::CacheEntry;
use crate::config::BucketNames;
use crate::strategy::StrategyContext;
use crate::{Result, SwError};

/// Worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WorkerState {
    /// Constructed, nothing run yet.
    #[default]
    Parsed,
    /// Precaching the app shell.
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Pruning stale buckets.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Replaced by a newer worker.
    Redundant,
}

/// Lifecycle state machine.
#[derive(Debug, Clone, Default)]
pub struct Lifecycle {
    state: WorkerState,
    skip_waiting: bool,
}

impl Lifecycle {
    pub fn state(&self) -> WorkerState {
        self.state
    }

    fn set_state(&mut self, state: WorkerState) {
        debug!(from = ?self.state, to = ?state, "Worker state change");
        self.state = state;
    }

    /// Enter `Installing`. Only a fresh or already-installed worker may install.
    pub fn begin_install(&mut self) -> Result<()> {
        match self.state {
            WorkerState::Parsed | WorkerState::Installed => {
                self.set_state(WorkerState::Installing);
                Ok(())
            }
            other => Err(SwError::State(format!("cannot install from {other:?}"))),
        }
    }

    /// Installing → Installed.
    pub fn install_complete(&mut self) {
        if self.state == WorkerState::Installing {
            self.set_state(WorkerState::Installed);
        }
    }

    /// Enter `Activating`. Re-activating an active worker is allowed.
    pub fn begin_activate(&mut self) -> Result<()> {
        match self.state {
            WorkerState::Parsed | WorkerState::Installed | WorkerState::Activated => {
                self.set_state(WorkerState::Activating);
                Ok(())
            }
            other => Err(SwError::State(format!("cannot activate from {other:?}"))),
        }
    }

    /// Activating → Activated.
    pub fn activate_complete(&mut self) {
        if self.state == WorkerState::Activating {
            self.set_state(WorkerState::Activated);
        }
    }

    /// Ask to activate as soon as installed.
    pub fn request_skip_waiting(&mut self) {
        self.skip_waiting = true;
    }

    /// Whether activation should run now.
    pub fn should_activate(&self) -> bool {
        self.skip_waiting && self.state == WorkerState::Installed
    }

    /// Mark as replaced.
    pub fn mark_redundant(&mut self) {
        self.set_state(WorkerState::Redundant);
    }
}

/// Outcome of the install step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallReport {
    /// Bucket the app shell went into.
    pub bucket: String,
    /// URLs stored.
    pub cached: Vec<String>,
    /// URLs that could not be stored, with the reason.
    pub failed: Vec<(String, String)>,
}

impl InstallReport {
    /// True when every manifest entry was stored.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Outcome of the activate step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActivateReport {
    /// Stale buckets removed.
    pub deleted: Vec<String>,
    /// Buckets left in place.
    pub kept: Vec<String>,
    /// Pages claimed.
    pub clients_claimed: usize,
}

/// Fetch every manifest URL concurrently and store the 2xx responses in the
/// static bucket. Failures are collected, not returned.
pub async fn precache(ctx: &StrategyContext, urls: &[Url]) -> Result<InstallReport> {
    let bucket = ctx.buckets.static_name.clone();
    ctx.store.open(&bucket).await?;

    let fetches = urls.iter().map(|url| async move {
        let request = Request::get(url.clone());
        let outcome = match ctx.network(request).await {
            Ok(response) if response.ok() => {
                let entry = CacheEntry::capture(url, &http::Method::GET, &response);
                ctx.store.put(&ctx.buckets.static_name, entry).await
            }
            Ok(response) => Err(SwError::Network(format!("status {}", response.status))),
            Err(e) => Err(e),
        };
        (url.to_string(), outcome)
    });

    let mut report = InstallReport {
        bucket,
        ..Default::default()
    };
    for (url, outcome) in join_all(fetches).await {
        match outcome {
            Ok(()) => report.cached.push(url),
            Err(e) => {
                error!(url = %url, error = %e, "Error caching static asset");
                report.failed.push((url, e.to_string()));
            }
        }
    }

    info!(
        bucket = %report.bucket,
        cached = report.cached.len(),
        failed = report.failed.len(),
        "Precache finished"
    );
    Ok(report)
}

/// Delete every bucket that is not current. Idempotent.
pub async fn prune(ctx: &StrategyContext, buckets: &BucketNames) -> Result<(Vec<String>, Vec<String>)> {
    let mut deleted = Vec::new();
    let mut kept = Vec::new();

    for name in ctx.store.keys().await? {
        if buckets.is_current(&name) {
            kept.push(name);
            continue;
        }
        info!(bucket = %name, "Deleting old cache");
        if ctx.store.delete(&name).await? {
            deleted.push(name);
        }
    }

    Ok((deleted, kept))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_happy_path() {
        let mut lifecycle = Lifecycle::default();
        assert_eq!(lifecycle.state(), WorkerState::Parsed);

        lifecycle.begin_install().unwrap();
        lifecycle.request_skip_waiting();
        assert!(!lifecycle.should_activate());

        lifecycle.install_complete();
        assert_eq!(lifecycle.state(), WorkerState::Installed);
        assert!(lifecycle.should_activate());

        lifecycle.begin_activate().unwrap();
        lifecycle.activate_complete();
        assert_eq!(lifecycle.state(), WorkerState::Activated);
        assert!(!lifecycle.should_activate());
    }

    #[test]
    fn test_cannot_install_once_active() {
        let mut lifecycle = Lifecycle::default();
        lifecycle.begin_activate().unwrap();
        lifecycle.activate_complete();

        assert!(matches!(lifecycle.begin_install(), Err(SwError::State(_))));
        // re-activation is fine
        assert!(lifecycle.begin_activate().is_ok());
    }

    #[test]
    fn test_redundant_is_terminal() {
        let mut lifecycle = Lifecycle::default();
        lifecycle.mark_redundant();
        assert!(lifecycle.begin_install().is_err());
        assert!(lifecycle.begin_activate().is_err());
    }

    #[test]
    fn test_install_report_complete() {
        let mut report = InstallReport::default();
        assert!(report.is_complete());
        report.failed.push(("/x".to_string(), "offline".to_string()));
        assert!(!report.is_complete());
    }
}
