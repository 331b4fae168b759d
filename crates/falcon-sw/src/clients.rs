//! Pages and windows the controller can reach, and the notification surface.
//!
//! The controller never touches a page directly; everything goes through a
//! [`ClientHost`] supplied by the hosting runtime.

use async_trait::async_trait;
use hashbrown::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use url::Url;

use crate::push::Notification;
use crate::{Result, SwError};

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
}

/// A page (or worker) the controller may control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    pub id: String,
    pub url: Url,
    pub client_type: ClientType,
    pub focused: bool,
    /// Whether this controller has claimed it.
    pub controlled: bool,
}

/// Host-side capabilities.
#[async_trait]
pub trait ClientHost: Send + Sync {
    /// Take control of every open page. Returns how many were claimed.
    async fn claim(&self) -> Result<usize>;

    /// Window clients, controlled or not.
    async fn windows(&self) -> Result<Vec<Client>>;

    /// Focus an existing window.
    async fn focus(&self, id: &str) -> Result<Client>;

    /// Open a new window.
    async fn open_window(&self, url: &Url) -> Result<Client>;

    /// Display a system notification.
    async fn show_notification(&self, notification: &Notification) -> Result<()>;

    /// Close a displayed notification by tag.
    async fn close_notification(&self, tag: &str) -> Result<()>;
}

/// In-memory host used by tools and tests.
#[derive(Debug, Default)]
pub struct Clients {
    clients: RwLock<HashMap<String, Client>>,
    notifications: RwLock<Vec<Notification>>,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an open window.
    pub async fn add_window(&self, url: Url) -> Client {
        let client = Client {
            id: client_id(),
            url,
            client_type: ClientType::Window,
            focused: false,
            controlled: false,
        };
        self.clients
            .write()
            .await
            .insert(client.id.clone(), client.clone());
        client
    }

    /// Get a client by ID.
    pub async fn get(&self, id: &str) -> Option<Client> {
        self.clients.read().await.get(id).cloned()
    }

    /// Remove a client.
    pub async fn remove(&self, id: &str) -> Option<Client> {
        self.clients.write().await.remove(id)
    }

    /// Notifications currently displayed.
    pub async fn notifications(&self) -> Vec<Notification> {
        self.notifications.read().await.clone()
    }
}

#[async_trait]
impl ClientHost for Clients {
    async fn claim(&self) -> Result<usize> {
        let mut clients = self.clients.write().await;
        let mut claimed = 0;
        for client in clients.values_mut().filter(|c| !c.controlled) {
            client.controlled = true;
            claimed += 1;
        }
        debug!(claimed, "Claimed clients");
        Ok(claimed)
    }

    async fn windows(&self) -> Result<Vec<Client>> {
        Ok(self
            .clients
            .read()
            .await
            .values()
            .filter(|c| c.client_type == ClientType::Window)
            .cloned()
            .collect())
    }

    async fn focus(&self, id: &str) -> Result<Client> {
        let mut clients = self.clients.write().await;
        let client = clients
            .get_mut(id)
            .ok_or_else(|| SwError::NotFound(format!("client {id}")))?;
        if client.client_type != ClientType::Window {
            return Err(SwError::Client(
                "Can only focus window clients".to_string(),
            ));
        }
        client.focused = true;
        Ok(client.clone())
    }

    async fn open_window(&self, url: &Url) -> Result<Client> {
        let client = Client {
            id: client_id(),
            url: url.clone(),
            client_type: ClientType::Window,
            focused: true,
            controlled: true,
        };
        self.clients
            .write()
            .await
            .insert(client.id.clone(), client.clone());
        Ok(client)
    }

    async fn show_notification(&self, notification: &Notification) -> Result<()> {
        let mut shown = self.notifications.write().await;
        // same tag replaces
        shown.retain(|n| n.tag != notification.tag);
        shown.push(notification.clone());
        Ok(())
    }

    async fn close_notification(&self, tag: &str) -> Result<()> {
        self.notifications.write().await.retain(|n| n.tag != tag);
        Ok(())
    }
}

fn client_id() -> String {
    format!("client-{:016x}", rand::random::<u64>())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> Url {
        Url::parse("http://localhost:3000/").unwrap()
    }

    #[tokio::test]
    async fn test_open_window() {
        let clients = Clients::new();
        let client = clients.open_window(&root()).await.unwrap();

        assert_eq!(client.client_type, ClientType::Window);
        assert!(client.focused);
        assert!(clients.get(&client.id).await.is_some());
    }

    #[tokio::test]
    async fn test_claim_counts_uncontrolled_only() {
        let clients = Clients::new();
        clients.add_window(root()).await;
        clients.add_window(root().join("catalogo").unwrap()).await;

        assert_eq!(clients.claim().await.unwrap(), 2);
        assert_eq!(clients.claim().await.unwrap(), 0);
        assert!(clients.windows().await.unwrap().iter().all(|c| c.controlled));
    }

    #[tokio::test]
    async fn test_focus_unknown_client() {
        let clients = Clients::new();
        assert!(matches!(
            clients.focus("client-missing").await,
            Err(SwError::NotFound(_))
        ));
    }
}
