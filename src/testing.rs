//! Test doubles for the network and the host platform.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use url::Url;

use crate::host::{Host, WindowClient};
use crate::http::{Request, Response};
use crate::network::Network;
use crate::notify::Notification;

pub const ORIGIN: &str = "http://localhost:3000";

pub fn url(path: &str) -> Url {
  Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

#[derive(Clone)]
enum Reply {
  Respond(Response),
  Fail,
  Gate(Arc<Notify>, Response),
}

/// Scripted network. Unknown URLs fail as if offline.
///
/// Replies queued for a URL are consumed in order; the last one sticks.
#[derive(Default)]
pub struct MockNetwork {
  replies: Mutex<HashMap<String, VecDeque<Reply>>>,
  calls: Mutex<Vec<Request>>,
}

impl MockNetwork {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  fn push(&self, path: &str, reply: Reply) {
    self
      .replies
      .lock()
      .unwrap()
      .entry(url(path).to_string())
      .or_default()
      .push_back(reply);
  }

  pub fn respond(&self, path: &str, status: u16, body: &str) {
    self.push(path, Reply::Respond(Response::new(status, body)));
  }

  pub fn respond_json(&self, path: &str, value: Value) {
    self.push(path, Reply::Respond(Response::json(&value).unwrap()));
  }

  pub fn fail(&self, path: &str) {
    self.push(path, Reply::Fail);
  }

  /// Respond only once the returned handle is notified.
  pub fn gate(&self, path: &str, status: u16, body: &str) -> Arc<Notify> {
    let notify = Arc::new(Notify::new());
    self.push(
      path,
      Reply::Gate(notify.clone(), Response::new(status, body)),
    );
    notify
  }

  pub fn calls(&self) -> Vec<Request> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self, path: &str) -> usize {
    let target = url(path);
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.url == target)
      .count()
  }

  fn next_reply(&self, key: &str) -> Option<Reply> {
    let mut replies = self.replies.lock().unwrap();
    let queue = replies.get_mut(key)?;
    if queue.len() > 1 {
      queue.pop_front()
    } else {
      queue.front().cloned()
    }
  }
}

impl Network for MockNetwork {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response>> {
    self.calls.lock().unwrap().push(request.clone());
    let reply = self.next_reply(request.url.as_str());
    let target = request.url.clone();

    Box::pin(async move {
      match reply {
        Some(Reply::Respond(response)) => Ok(response),
        Some(Reply::Gate(notify, response)) => {
          notify.notified().await;
          Ok(response)
        }
        Some(Reply::Fail) | None => Err(eyre!("network unreachable: {}", target)),
      }
    })
  }
}

/// Host that records every call.
#[derive(Default)]
pub struct RecordingHost {
  pub windows: Mutex<Vec<WindowClient>>,
  pub skip_waiting_calls: Mutex<usize>,
  pub claimed: Mutex<bool>,
  pub periodic: Mutex<Vec<(String, Duration)>>,
  pub periodic_unsupported: Mutex<bool>,
  pub focused: Mutex<Vec<String>>,
  pub opened: Mutex<Vec<String>>,
  pub messages: Mutex<Vec<(String, Value)>>,
  pub shown: Mutex<Vec<Notification>>,
  pub closed: Mutex<usize>,
}

impl RecordingHost {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn add_window(&self, id: &str, address: &str) {
    self.windows.lock().unwrap().push(WindowClient {
      id: id.to_string(),
      url: Url::parse(address).unwrap(),
    });
  }
}

impl Host for RecordingHost {
  fn skip_waiting(&self) -> BoxFuture<'_, Result<()>> {
    *self.skip_waiting_calls.lock().unwrap() += 1;
    Box::pin(async { Ok(()) })
  }

  fn claim(&self) -> BoxFuture<'_, Result<()>> {
    *self.claimed.lock().unwrap() = true;
    Box::pin(async { Ok(()) })
  }

  fn register_periodic_sync<'a>(
    &'a self,
    tag: &'a str,
    min_interval: Duration,
  ) -> BoxFuture<'a, Result<()>> {
    let unsupported = *self.periodic_unsupported.lock().unwrap();
    if !unsupported {
      self
        .periodic
        .lock()
        .unwrap()
        .push((tag.to_string(), min_interval));
    }
    Box::pin(async move {
      if unsupported {
        Err(eyre!("periodic background sync is not supported"))
      } else {
        Ok(())
      }
    })
  }

  fn window_clients(&self) -> BoxFuture<'_, Result<Vec<WindowClient>>> {
    let windows = self.windows.lock().unwrap().clone();
    Box::pin(async move { Ok(windows) })
  }

  fn focus<'a>(&'a self, client: &'a WindowClient) -> BoxFuture<'a, Result<()>> {
    self.focused.lock().unwrap().push(client.id.clone());
    Box::pin(async { Ok(()) })
  }

  fn open_window<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<()>> {
    self.opened.lock().unwrap().push(url.to_string());
    Box::pin(async { Ok(()) })
  }

  fn post_message<'a>(
    &'a self,
    client: &'a WindowClient,
    message: &'a Value,
  ) -> BoxFuture<'a, Result<()>> {
    self
      .messages
      .lock()
      .unwrap()
      .push((client.id.clone(), message.clone()));
    Box::pin(async { Ok(()) })
  }

  fn show_notification<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, Result<()>> {
    self.shown.lock().unwrap().push(notification.clone());
    Box::pin(async { Ok(()) })
  }

  fn close_notification<'a>(
    &'a self,
    _notification: &'a Notification,
  ) -> BoxFuture<'a, Result<()>> {
    *self.closed.lock().unwrap() += 1;
    Box::pin(async { Ok(()) })
  }
}
