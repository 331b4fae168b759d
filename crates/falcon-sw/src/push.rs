//! Push payload decoding, notification building, and click handling.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};
use url::Url;

use crate::clients::{Client, ClientHost};
use crate::config::NotificationConfig;
use crate::Result;

/// Action identifier that opens the app.
pub const ACTION_OPEN: &str = "open";
/// Action identifier that only dismisses.
pub const ACTION_CLOSE: &str = "close";

/// Inbound push payload. Unknown fields are kept for `Notification::data`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, JsonValue>,
}

impl PushPayload {
    /// Decode a payload. Missing or unparseable data yields `None`.
    pub fn decode(data: Option<&[u8]>) -> Option<Self> {
        let Some(data) = data else {
            debug!("Push without payload");
            return None;
        };
        match serde_json::from_slice(data) {
            Ok(payload) => Some(payload),
            Err(e) => {
                warn!(error = %e, "Undecodable push payload");
                None
            }
        }
    }
}

/// A button on a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
    pub icon: String,
}

/// A system notification ready to show.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub vibrate: Vec<u32>,
    pub tag: String,
    pub actions: Vec<NotificationAction>,
    pub data: JsonValue,
}

impl Notification {
    /// Build a notification, filling gaps from the configured defaults.
    pub fn from_payload(payload: PushPayload, config: &NotificationConfig) -> Self {
        let action = |action: &str, title: &str| NotificationAction {
            action: action.to_string(),
            title: title.to_string(),
            icon: config.action_icon.clone(),
        };

        let title = payload
            .title
            .clone()
            .unwrap_or_else(|| config.default_title.clone());
        let body = payload
            .body
            .clone()
            .unwrap_or_else(|| config.default_body.clone());
        let data = serde_json::to_value(&payload).unwrap_or(JsonValue::Null);

        Self {
            title,
            body,
            icon: config.icon.clone(),
            badge: config.badge.clone(),
            vibrate: config.vibrate.clone(),
            tag: config.tag.clone(),
            actions: vec![
                action(ACTION_OPEN, &config.open_label),
                action(ACTION_CLOSE, &config.close_label),
            ],
            data,
        }
    }
}

/// What a notification click resulted in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
    /// Notification closed, nothing else.
    Dismissed,
    /// An existing window was focused.
    Focused(Client),
    /// A new window was opened.
    Opened(Client),
}

/// Close the notification, then run its action. A click on the body (no
/// action) behaves like `open`; unknown actions only dismiss.
pub async fn handle_click(
    host: &dyn ClientHost,
    tag: &str,
    action: Option<&str>,
    open_url: &Url,
) -> Result<ClickOutcome> {
    host.close_notification(tag).await?;

    match action {
        None | Some(ACTION_OPEN) => {}
        Some(other) => {
            debug!(action = other, "Notification dismissed");
            return Ok(ClickOutcome::Dismissed);
        }
    }

    let existing = host
        .windows()
        .await?
        .into_iter()
        .find(|client| client.url == *open_url);

    match existing {
        Some(client) => Ok(ClickOutcome::Focused(host.focus(&client.id).await?)),
        None => Ok(ClickOutcome::Opened(host.open_window(open_url).await?)),
    }
}
