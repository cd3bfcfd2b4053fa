//! Push notifications, click routing and dashboard update relay.
//!
//! Lifecycle of a notification:
//! `Pushed -> Displayed -> { Clicked(view) -> Focused | Opened, Clicked(dismiss) -> Closed, Ignored }`

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::WorkerConfig;
use crate::host::Host;
use crate::http::Request;
use crate::network::Network;

pub const ACTION_VIEW: &str = "view";
pub const ACTION_DISMISS: &str = "dismiss";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
}

/// A notification ready to display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  /// Deep-link data; `data.url` is opened on click
  pub data: Value,
  pub actions: Vec<NotificationAction>,
}

impl Notification {
  /// Deep-link target, if the notification carries one.
  pub fn target(&self) -> Option<&str> {
    self.data.get("url").and_then(Value::as_str)
  }
}

/// Fields a push payload may override.
#[derive(Debug, Default)]
struct PushPayload {
  title: Option<String>,
  body: Option<String>,
  icon: Option<String>,
  badge: Option<String>,
  vibrate: Option<Vec<u32>>,
  data: Option<Value>,
}

impl PushPayload {
  /// Take each well-typed field of a JSON object; fields of the wrong type
  /// fall back to the template. Anything but a JSON object becomes the body.
  fn parse(bytes: &[u8]) -> Self {
    match serde_json::from_slice::<Value>(bytes) {
      Ok(Value::Object(fields)) => Self {
        title: string_field(&fields, "title"),
        body: string_field(&fields, "body"),
        icon: string_field(&fields, "icon"),
        badge: string_field(&fields, "badge"),
        vibrate: fields
          .get("vibrate")
          .and_then(|v| Vec::<u32>::deserialize(v).ok()),
        data: fields.get("data").filter(|v| !v.is_null()).cloned(),
      },
      _ => {
        debug!("push payload is not a JSON object, using it as text");
        Self {
          body: Some(String::from_utf8_lossy(bytes).into_owned()),
          ..Self::default()
        }
      }
    }
  }
}

fn string_field(fields: &Map<String, Value>, name: &str) -> Option<String> {
  fields.get(name).and_then(Value::as_str).map(str::to_string)
}

/// How a click was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
  Dismissed,
  /// An existing application window was focused
  Focused(String),
  /// A new window was opened at this URL
  Opened(String),
}

pub struct NotificationDispatcher {
  config: Arc<WorkerConfig>,
  network: Arc<dyn Network>,
  host: Arc<dyn Host>,
}

impl NotificationDispatcher {
  pub fn new(config: Arc<WorkerConfig>, network: Arc<dyn Network>, host: Arc<dyn Host>) -> Self {
    Self {
      config,
      network,
      host,
    }
  }

  /// Merge a push payload over the default template.
  ///
  /// A payload that is not a JSON object is used verbatim as the body.
  pub fn compose(&self, payload: Option<&[u8]>) -> Notification {
    let template = &self.config.notifications;
    let parsed = payload.map(PushPayload::parse).unwrap_or_default();

    Notification {
      title: parsed.title.unwrap_or_else(|| template.title.clone()),
      body: parsed.body.unwrap_or_else(|| template.body.clone()),
      icon: parsed.icon.unwrap_or_else(|| template.icon.clone()),
      badge: parsed.badge.unwrap_or_else(|| template.badge.clone()),
      vibrate: parsed.vibrate.unwrap_or_else(|| template.vibrate.clone()),
      data: parsed
        .data
        .unwrap_or_else(|| json!({ "url": template.default_url })),
      actions: vec![
        NotificationAction {
          action: ACTION_VIEW.to_string(),
          title: "View".to_string(),
        },
        NotificationAction {
          action: ACTION_DISMISS.to_string(),
          title: "Dismiss".to_string(),
        },
      ],
    }
  }

  /// Compose and display a pushed notification.
  pub async fn push(&self, payload: Option<&[u8]>) -> Result<Notification> {
    let notification = self.compose(payload);
    self.host.show_notification(&notification).await?;
    Ok(notification)
  }

  /// Route a click. Anything but `dismiss` (including a click on the body,
  /// `None`) brings the application forward.
  pub async fn click(
    &self,
    notification: &Notification,
    action: Option<&str>,
  ) -> Result<ClickOutcome> {
    if let Err(e) = self.host.close_notification(notification).await {
      warn!(error = %e, "failed to close notification");
    }

    if action == Some(ACTION_DISMISS) {
      return Ok(ClickOutcome::Dismissed);
    }

    let windows = self.host.window_clients().await?;
    if let Some(window) = windows
      .iter()
      .find(|w| w.url.host_str() == Some(self.config.app_domain.as_str()))
    {
      self.host.focus(window).await?;
      return Ok(ClickOutcome::Focused(window.id.clone()));
    }

    let target = notification
      .target()
      .unwrap_or(self.config.notifications.default_url.as_str());
    let url = self.config.url(target)?;
    self.host.open_window(&url).await?;
    Ok(ClickOutcome::Opened(url.to_string()))
  }

  /// Fetch dashboard updates and post them to every open window.
  /// Returns the number of windows notified.
  pub async fn relay_dashboard_update(&self) -> Result<usize> {
    let request = Request::get(self.config.url(&self.config.periodic.endpoint)?)
      .with_header("accept", "application/json");

    let response = self.network.fetch(&request).await?;
    if !response.is_success() {
      return Err(eyre!(
        "Dashboard updates returned HTTP {}",
        response.status
      ));
    }
    let data = response.body_json()?;
    let message = json!({ "type": "dashboard-update", "data": data });

    let windows = self.host.window_clients().await?;
    for window in &windows {
      if let Err(e) = self.host.post_message(window, &message).await {
        warn!(client = %window.id, error = %e, "failed to post dashboard update");
      }
    }

    Ok(windows.len())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Config;
  use crate::testing::{MockNetwork, RecordingHost};

  fn dispatcher() -> (NotificationDispatcher, Arc<MockNetwork>, Arc<RecordingHost>) {
    let config = Arc::new(WorkerConfig::from_config(&Config::default()).unwrap());
    let network = MockNetwork::new();
    let host = RecordingHost::new();
    (
      NotificationDispatcher::new(config, network.clone(), host.clone()),
      network,
      host,
    )
  }

  #[test]
  fn test_missing_body_uses_template() {
    let (dispatcher, _, _) = dispatcher();
    let notification = dispatcher.compose(Some(br#"{"title":"X"}"#));

    assert_eq!(notification.title, "X");
    assert_eq!(notification.body, "You have a new notification");
    assert_eq!(notification.vibrate, vec![100, 50, 100]);
    assert_eq!(notification.target(), Some("/dashboard"));
    let actions: Vec<_> = notification.actions.iter().map(|a| a.action.as_str()).collect();
    assert_eq!(actions, vec!["view", "dismiss"]);
  }

  #[test]
  fn test_plain_text_payload_becomes_body() {
    let (dispatcher, _, _) = dispatcher();
    let notification = dispatcher.compose(Some(b"Quote Q-17 approved"));

    assert_eq!(notification.title, "Solar Platform");
    assert_eq!(notification.body, "Quote Q-17 approved");
  }

  #[test]
  fn test_payload_fields_override_template() {
    let (dispatcher, _, _) = dispatcher();
    let payload = br#"{"body":"Install scheduled","vibrate":[200],"data":{"url":"/projects/9"}}"#;
    let notification = dispatcher.compose(Some(payload));

    assert_eq!(notification.body, "Install scheduled");
    assert_eq!(notification.vibrate, vec![200]);
    assert_eq!(notification.target(), Some("/projects/9"));
  }

  #[test]
  fn test_mistyped_field_keeps_the_rest() {
    let (dispatcher, _, _) = dispatcher();
    let payload = br#"{"title":5,"body":"Install scheduled","vibrate":"long","data":{"url":"/projects/9"}}"#;
    let notification = dispatcher.compose(Some(payload));

    assert_eq!(notification.title, "Solar Platform");
    assert_eq!(notification.body, "Install scheduled");
    assert_eq!(notification.vibrate, vec![100, 50, 100]);
    assert_eq!(notification.target(), Some("/projects/9"));
  }

  #[tokio::test]
  async fn test_push_displays_notification() {
    let (dispatcher, _, host) = dispatcher();
    dispatcher.push(None).await.unwrap();

    let shown = host.shown.lock().unwrap();
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0].title, "Solar Platform");
  }

  #[tokio::test]
  async fn test_dismiss_only_closes() {
    let (dispatcher, _, host) = dispatcher();
    host.add_window("w1", "http://localhost:3000/dashboard");
    let notification = dispatcher.compose(None);

    let outcome = dispatcher.click(&notification, Some("dismiss")).await.unwrap();

    assert_eq!(outcome, ClickOutcome::Dismissed);
    assert_eq!(*host.closed.lock().unwrap(), 1);
    assert!(host.focused.lock().unwrap().is_empty());
    assert!(host.opened.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_view_focuses_existing_app_window() {
    let (dispatcher, _, host) = dispatcher();
    host.add_window("other", "https://example.org/");
    host.add_window("app", "http://localhost:3000/quotes");
    let notification = dispatcher.compose(None);

    let outcome = dispatcher.click(&notification, Some("view")).await.unwrap();

    assert_eq!(outcome, ClickOutcome::Focused("app".to_string()));
    assert_eq!(*host.focused.lock().unwrap(), vec!["app".to_string()]);
  }

  #[tokio::test]
  async fn test_click_without_window_opens_deep_link() {
    let (dispatcher, _, host) = dispatcher();
    let notification = dispatcher.compose(Some(br#"{"data":{"url":"/projects/9"}}"#));

    let outcome = dispatcher.click(&notification, None).await.unwrap();

    assert_eq!(
      outcome,
      ClickOutcome::Opened("http://localhost:3000/projects/9".to_string())
    );
    assert_eq!(*host.closed.lock().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_click_without_deep_link_opens_dashboard() {
    let (dispatcher, _, host) = dispatcher();
    let notification = dispatcher.compose(Some(br#"{"data":{"kind":"reminder"}}"#));

    dispatcher.click(&notification, Some("view")).await.unwrap();

    assert_eq!(
      *host.opened.lock().unwrap(),
      vec!["http://localhost:3000/dashboard".to_string()]
    );
  }

  #[tokio::test]
  async fn test_dashboard_update_is_broadcast() {
    let (dispatcher, network, host) = dispatcher();
    host.add_window("w1", "http://localhost:3000/dashboard");
    host.add_window("w2", "http://localhost:3000/quotes");
    network.respond_json("/api/dashboard/updates", json!({ "openQuotes": 4 }));

    assert_eq!(dispatcher.relay_dashboard_update().await.unwrap(), 2);

    let messages = host.messages.lock().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(
      messages[0].1,
      json!({ "type": "dashboard-update", "data": { "openQuotes": 4 } })
    );
  }

  #[tokio::test]
  async fn test_dashboard_update_offline_fails() {
    let (dispatcher, _, host) = dispatcher();
    host.add_window("w1", "http://localhost:3000/dashboard");

    assert!(dispatcher.relay_dashboard_update().await.is_err());
    assert!(host.messages.lock().unwrap().is_empty());
  }
}
