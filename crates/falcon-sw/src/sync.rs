//! Background sync: submissions that failed offline, replayed once
//! connectivity returns.
//!
//! Delivery is at-least-once. Every item carries a client-generated
//! idempotency key, sent as `Idempotency-Key`, so the server can drop
//! duplicates when a drain is interrupted and re-run.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use falcon_common::{retry_with_backoff, RetryConfig};
use falcon_net::Request;
use http::{header, HeaderName, HeaderValue, Method};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;
use tracing::{info, warn};
use url::Url;

use crate::strategy::StrategyContext;
use crate::{Result, SwError};

/// Header carrying the per-item deduplication key.
pub const IDEMPOTENCY_KEY: HeaderName = HeaderName::from_static("idempotency-key");

/// A submission waiting to be replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSyncItem {
    pub id: String,
    pub idempotency_key: String,
    pub url: Url,
    pub method: String,
    pub body: JsonValue,
    /// Queued at (ms since epoch).
    pub created_at: u64,
}

impl PendingSyncItem {
    /// A JSON POST to `url` with fresh identifiers.
    pub fn post(url: Url, body: JsonValue) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        Self {
            id: format!("{:x}-{:08x}", created_at, rand::random::<u32>()),
            idempotency_key: format!("{:032x}", rand::random::<u128>()),
            url,
            method: Method::POST.to_string(),
            body,
            created_at,
        }
    }

    fn to_request(&self) -> Result<Request> {
        let method = Method::from_bytes(self.method.as_bytes())
            .map_err(|e| SwError::Message(format!("bad method '{}': {e}", self.method)))?;
        let key = HeaderValue::from_str(&self.idempotency_key)
            .map_err(|e| SwError::Message(format!("bad idempotency key: {e}")))?;
        let body = serde_json::to_vec(&self.body).map_err(falcon_common::FalconError::from)?;

        let mut request = Request::post(self.url.clone(), Bytes::from(body))
            .header(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .header(IDEMPOTENCY_KEY, key);
        request.method = method;
        Ok(request)
    }
}

/// Durable list of pending submissions.
#[async_trait]
pub trait SyncQueue: Send + Sync {
    /// Append an item.
    async fn push(&self, item: PendingSyncItem) -> Result<()>;

    /// Every pending item, oldest first.
    async fn pending(&self) -> Result<Vec<PendingSyncItem>>;

    /// Remove a delivered item. Returns whether it was present.
    async fn remove(&self, id: &str) -> Result<bool>;
}

/// In-memory queue.
#[derive(Debug, Default)]
pub struct MemorySyncQueue {
    items: RwLock<Vec<PendingSyncItem>>,
}

impl MemorySyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore from previously saved items.
    pub fn from_items(items: Vec<PendingSyncItem>) -> Self {
        Self {
            items: RwLock::new(items),
        }
    }

    /// Copy out the queue for persisting.
    pub async fn snapshot(&self) -> Vec<PendingSyncItem> {
        self.items.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }
}

#[async_trait]
impl SyncQueue for MemorySyncQueue {
    async fn push(&self, item: PendingSyncItem) -> Result<()> {
        self.items.write().await.push(item);
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<PendingSyncItem>> {
        Ok(self.items.read().await.clone())
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        let mut items = self.items.write().await;
        let before = items.len();
        items.retain(|item| item.id != id);
        Ok(items.len() != before)
    }
}

/// Outcome of one drain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub attempted: usize,
    pub delivered: usize,
    /// Item id and reason, for items left in the queue.
    pub failed: Vec<(String, String)>,
}

/// Replay every pending item. Delivered items are removed one by one;
/// failures are logged and left for the next trigger.
pub async fn drain(queue: &dyn SyncQueue, ctx: &StrategyContext, retry: &RetryConfig) -> Result<SyncReport> {
    let items = queue.pending().await?;
    let mut report = SyncReport {
        attempted: items.len(),
        ..Default::default()
    };

    for item in items {
        match deliver(ctx, &item, retry).await {
            Ok(()) => {
                queue.remove(&item.id).await?;
                report.delivered += 1;
            }
            Err(e) => {
                warn!(id = %item.id, url = %item.url, error = %e, "Sync item failed");
                report.failed.push((item.id.clone(), e.to_string()));
            }
        }
    }

    info!(
        attempted = report.attempted,
        delivered = report.delivered,
        failed = report.failed.len(),
        "Sync drain finished"
    );
    Ok(report)
}

async fn deliver(ctx: &StrategyContext, item: &PendingSyncItem, retry: &RetryConfig) -> Result<()> {
    let request = item.to_request()?;
    retry_with_backoff(retry, || {
        let request = request.clone();
        async move {
            let response = ctx.network(request).await?;
            if response.ok() {
                Ok(())
            } else {
                Err(SwError::Network(format!("server answered {}", response.status)))
            }
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_items_get_distinct_keys() {
        let url = Url::parse("http://localhost:3000/api/cotacao").unwrap();
        let a = PendingSyncItem::post(url.clone(), serde_json::json!({"itens": []}));
        let b = PendingSyncItem::post(url, serde_json::json!({"itens": []}));

        assert_ne!(a.idempotency_key, b.idempotency_key);
        assert_ne!(a.id, b.id);
        assert_eq!(a.idempotency_key.len(), 32);
        assert_eq!(a.method, "POST");
    }

    #[test]
    fn test_item_request_carries_key() {
        let url = Url::parse("http://localhost:3000/api/cotacao").unwrap();
        let item = PendingSyncItem::post(url, serde_json::json!({"cliente": "Transportes Silva"}));
        let request = item.to_request().unwrap();

        assert_eq!(request.method, Method::POST);
        assert_eq!(
            request.headers.get(IDEMPOTENCY_KEY).unwrap(),
            item.idempotency_key.as_str()
        );
        let body: JsonValue = serde_json::from_slice(request.body.as_ref().unwrap()).unwrap();
        assert_eq!(body["cliente"], "Transportes Silva");
    }

    #[tokio::test]
    async fn test_memory_queue_remove() {
        let queue = MemorySyncQueue::new();
        let url = Url::parse("http://localhost:3000/api/cotacao").unwrap();
        let item = PendingSyncItem::post(url, JsonValue::Null);
        queue.push(item.clone()).await.unwrap();

        assert_eq!(queue.len().await, 1);
        assert!(queue.remove(&item.id).await.unwrap());
        assert!(!queue.remove(&item.id).await.unwrap());
        assert!(queue.is_empty().await);
    }
}
