use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::cache::CacheStorage;
use crate::host::PeriodicRegistration;
use crate::notify::Notification;
use crate::worker::Worker;

/// Events delivered to the worker outside of request handling
#[derive(Debug, Clone)]
pub enum Event {
  /// Connectivity is back for a `sync-<type>` queue
  Sync { tag: String },
  /// A registered periodic task is due
  PeriodicSync { tag: String },
  /// Push message with an optional payload
  Push { data: Option<Vec<u8>> },
  NotificationClick {
    notification: Notification,
    action: Option<String>,
  },
  /// Message posted by a page
  Message(Value),
}

/// Event queue fed by timers and the proxy
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl Default for EventHandler {
  fn default() -> Self {
    Self::new()
  }
}

impl EventHandler {
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self { tx, rx }
  }

  pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
    self.tx.clone()
  }

  /// Emit a sync event for every tag on each retry tick. Flushing an empty
  /// queue does nothing, so there is no need to check first.
  pub fn schedule_sync(&self, tags: Vec<String>, every: Duration) {
    let tx = self.tx.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(every);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      // First tick completes immediately
      ticker.tick().await;
      loop {
        ticker.tick().await;
        for tag in &tags {
          if tx.send(Event::Sync { tag: tag.clone() }).is_err() {
            return;
          }
        }
      }
    });
  }

  /// Emit periodic sync events at each registration's minimum interval.
  pub fn schedule_periodic(&self, registrations: Vec<PeriodicRegistration>) {
    for registration in registrations {
      let tx = self.tx.clone();
      tokio::spawn(async move {
        let mut ticker = tokio::time::interval(registration.min_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
          ticker.tick().await;
          let event = Event::PeriodicSync {
            tag: registration.tag.clone(),
          };
          if tx.send(event).is_err() {
            return;
          }
        }
      });
    }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

impl<S: CacheStorage> Worker<S> {
  /// Run the handler for one event. Failures are logged, never returned.
  pub async fn dispatch(&self, event: Event) {
    match event {
      Event::Sync { tag } => match self.sync(&tag).await {
        Ok(report) => debug!(tag, ?report, "sync handled"),
        Err(e) => warn!(tag, error = %e, "sync failed"),
      },
      Event::PeriodicSync { tag } => match self.periodic_sync(&tag).await {
        Ok(windows) => debug!(tag, ?windows, "periodic sync handled"),
        Err(e) => warn!(tag, error = %e, "periodic sync failed"),
      },
      Event::Push { data } => {
        if let Err(e) = self.push(data.as_deref()).await {
          warn!(error = %e, "failed to show notification");
        }
      }
      Event::NotificationClick {
        notification,
        action,
      } => match self.notification_click(&notification, action.as_deref()).await {
        Ok(outcome) => debug!(?outcome, "notification click handled"),
        Err(e) => warn!(error = %e, "notification click failed"),
      },
      Event::Message(message) => {
        if let Err(e) = self.message(&message).await {
          warn!(error = %e, "message handling failed");
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheStore, SqliteStorage};
  use crate::config::{Config, WorkerConfig};
  use crate::testing::{MockNetwork, RecordingHost};
  use serde_json::json;

  #[tokio::test]
  async fn test_events_arrive_in_send_order() {
    let mut events = EventHandler::new();
    let tx = events.sender();
    tx.send(Event::Sync {
      tag: "sync-quotes".to_string(),
    })
    .unwrap();
    tx.send(Event::Message(json!({ "type": "skip-waiting" })))
      .unwrap();

    assert!(matches!(events.next().await, Some(Event::Sync { tag }) if tag == "sync-quotes"));
    assert!(matches!(events.next().await, Some(Event::Message(_))));
  }

  #[tokio::test]
  async fn test_sync_schedule_fires_after_interval() {
    let mut events = EventHandler::new();
    events.schedule_sync(vec!["sync-quotes".to_string()], Duration::from_millis(20));

    let event = tokio::time::timeout(Duration::from_secs(5), events.next())
      .await
      .unwrap();
    assert!(matches!(event, Some(Event::Sync { tag }) if tag == "sync-quotes"));
  }

  #[tokio::test]
  async fn test_periodic_schedule_uses_registration_tag() {
    let mut events = EventHandler::new();
    events.schedule_periodic(vec![PeriodicRegistration {
      tag: "update-dashboard".to_string(),
      min_interval: Duration::from_millis(20),
    }]);

    let event = tokio::time::timeout(Duration::from_secs(5), events.next())
      .await
      .unwrap();
    assert!(matches!(event, Some(Event::PeriodicSync { tag }) if tag == "update-dashboard"));
  }

  #[tokio::test]
  async fn test_dispatch_routes_to_handlers() {
    let network = MockNetwork::new();
    let host = RecordingHost::new();
    let worker = Worker::new(
      WorkerConfig::from_config(&Config::default()).unwrap(),
      CacheStore::new(SqliteStorage::open_in_memory().unwrap()),
      network.clone(),
      host.clone(),
    );
    network.respond("/api/quotes/sync", 200, "");
    worker.enqueue("quotes", &json!({ "quoteNumber": "Q-9" }));

    worker
      .dispatch(Event::Sync {
        tag: "sync-quotes".to_string(),
      })
      .await;
    worker.dispatch(Event::Push { data: None }).await;
    // Offline: logged, not propagated
    worker
      .dispatch(Event::PeriodicSync {
        tag: "update-dashboard".to_string(),
      })
      .await;

    let notification = host.shown.lock().unwrap()[0].clone();
    worker
      .dispatch(Event::NotificationClick {
        notification,
        action: None,
      })
      .await;

    assert_eq!(worker.pending_submissions("quotes").unwrap(), 0);
    assert_eq!(host.shown.lock().unwrap().len(), 1);
    assert_eq!(*host.closed.lock().unwrap(), 1);
    assert_eq!(
      *host.opened.lock().unwrap(),
      vec!["http://localhost:3000/dashboard".to_string()]
    );
  }
}
