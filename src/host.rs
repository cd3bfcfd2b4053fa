//! Platform facilities the worker relies on: lifecycle control, periodic
//! task registration, application windows and notifications.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};
use url::Url;

use crate::notify::Notification;

/// An open application window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowClient {
  pub id: String,
  pub url: Url,
}

pub trait Host: Send + Sync + 'static {
  /// Activate a waiting worker version immediately.
  fn skip_waiting(&self) -> BoxFuture<'_, Result<()>>;

  /// Take control of already-open windows.
  fn claim(&self) -> BoxFuture<'_, Result<()>>;

  /// Fails when the platform has no periodic background sync.
  fn register_periodic_sync<'a>(
    &'a self,
    tag: &'a str,
    min_interval: Duration,
  ) -> BoxFuture<'a, Result<()>>;

  fn window_clients(&self) -> BoxFuture<'_, Result<Vec<WindowClient>>>;

  fn focus<'a>(&'a self, client: &'a WindowClient) -> BoxFuture<'a, Result<()>>;

  fn open_window<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<()>>;

  fn post_message<'a>(
    &'a self,
    client: &'a WindowClient,
    message: &'a Value,
  ) -> BoxFuture<'a, Result<()>>;

  fn show_notification<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, Result<()>>;

  fn close_notification<'a>(&'a self, notification: &'a Notification)
    -> BoxFuture<'a, Result<()>>;
}

/// A periodic task registered by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodicRegistration {
  pub tag: String,
  pub min_interval: Duration,
}

/// Host for the command line and the proxy.
///
/// Windows are pages holding the proxy's event stream open; messages posted
/// to a window are queued on its stream. Notifications are logged, and
/// opening a window launches the system browser.
#[derive(Default)]
pub struct LocalHost {
  periodic: Mutex<Vec<PeriodicRegistration>>,
  windows: Mutex<Vec<ConnectedWindow>>,
  next_window: AtomicU64,
}

struct ConnectedWindow {
  client: WindowClient,
  tx: mpsc::UnboundedSender<Value>,
}

impl LocalHost {
  pub fn new() -> Self {
    Self::default()
  }

  /// Periodic tasks the scheduler should drive.
  pub fn periodic_registrations(&self) -> Vec<PeriodicRegistration> {
    self
      .periodic
      .lock()
      .map(|registrations| registrations.clone())
      .unwrap_or_default()
  }

  /// Register a page at `url`. The window is dropped once the receiver is.
  pub fn connect_window(&self, url: Url) -> Result<(WindowClient, mpsc::UnboundedReceiver<Value>)> {
    let id = format!("window-{}", self.next_window.fetch_add(1, Ordering::Relaxed) + 1);
    let client = WindowClient { id, url };
    let (tx, rx) = mpsc::unbounded_channel();

    self
      .windows
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .push(ConnectedWindow {
        client: client.clone(),
        tx,
      });
    info!(client = %client.id, url = %client.url, "window connected");
    Ok((client, rx))
  }

  fn send(&self, client: &WindowClient, message: Value) -> Result<()> {
    let windows = self
      .windows
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let window = windows
      .iter()
      .find(|w| w.client.id == client.id)
      .ok_or_else(|| eyre!("Window {} is not connected", client.id))?;
    window
      .tx
      .send(message)
      .map_err(|_| eyre!("Window {} disconnected", client.id))
  }
}

impl Host for LocalHost {
  fn skip_waiting(&self) -> BoxFuture<'_, Result<()>> {
    Box::pin(async {
      info!("skip waiting: new version takes over on next activation");
      Ok(())
    })
  }

  fn claim(&self) -> BoxFuture<'_, Result<()>> {
    Box::pin(async { Ok(()) })
  }

  fn register_periodic_sync<'a>(
    &'a self,
    tag: &'a str,
    min_interval: Duration,
  ) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
      let mut registrations = self
        .periodic
        .lock()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?;

      registrations.retain(|r| r.tag != tag);
      registrations.push(PeriodicRegistration {
        tag: tag.to_string(),
        min_interval,
      });
      Ok(())
    })
  }

  fn window_clients(&self) -> BoxFuture<'_, Result<Vec<WindowClient>>> {
    Box::pin(async move {
      let mut windows = self
        .windows
        .lock()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?;
      windows.retain(|w| !w.tx.is_closed());
      Ok(windows.iter().map(|w| w.client.clone()).collect())
    })
  }

  fn focus<'a>(&'a self, client: &'a WindowClient) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
      info!(client = %client.id, "focus window");
      self.send(client, json!({ "type": "focus" }))
    })
  }

  fn open_window<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
      let target = url.to_string();
      tokio::task::spawn_blocking(move || open::that(&target))
        .await
        .map_err(|e| eyre!("Window opener task failed: {}", e))?
        .map_err(|e| eyre!("Failed to open {}: {}", url, e))
    })
  }

  fn post_message<'a>(
    &'a self,
    client: &'a WindowClient,
    message: &'a Value,
  ) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
      debug!(client = %client.id, %message, "message to window");
      self.send(client, message.clone())
    })
  }

  fn show_notification<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
      info!(
        title = %notification.title,
        body = %notification.body,
        "notification"
      );
      Ok(())
    })
  }

  fn close_notification<'a>(
    &'a self,
    notification: &'a Notification,
  ) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
      info!(title = %notification.title, "notification closed");
      Ok(())
    })
  }
}
