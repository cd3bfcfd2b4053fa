//! The worker: one handler per lifecycle, fetch, sync, push and message event.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{CacheStorage, CacheStore, Fetched};
use crate::config::{PartitionKind, WorkerConfig};
use crate::host::Host;
use crate::http::{Request, Response};
use crate::network::Network;
use crate::notify::{ClickOutcome, Notification, NotificationDispatcher};
use crate::router::{Route, Router};
use crate::strategy::Strategies;
use crate::sync::{FlushReport, SyncQueue};
use crate::tasks::BackgroundTasks;

/// Messages pages send to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum InboundMessage {
  /// Activate a waiting version right away
  SkipWaiting,
  /// Add these URLs to the dynamic partition
  CacheUpdate { urls: Vec<String> },
}

pub struct Worker<S: CacheStorage> {
  config: Arc<WorkerConfig>,
  store: CacheStore<S>,
  network: Arc<dyn Network>,
  host: Arc<dyn Host>,
  router: Router,
  strategies: Strategies<S>,
  sync: SyncQueue<S>,
  notifications: NotificationDispatcher,
  tasks: BackgroundTasks,
}

impl<S: CacheStorage> Worker<S> {
  pub fn new(
    config: WorkerConfig,
    store: CacheStore<S>,
    network: Arc<dyn Network>,
    host: Arc<dyn Host>,
  ) -> Self {
    let config = Arc::new(config);
    let tasks = BackgroundTasks::new();

    Self {
      router: Router::new(&config),
      strategies: Strategies::new(
        Arc::clone(&config),
        store.clone(),
        Arc::clone(&network),
        tasks.clone(),
      ),
      sync: SyncQueue::new(Arc::clone(&config), store.clone(), Arc::clone(&network)),
      notifications: NotificationDispatcher::new(
        Arc::clone(&config),
        Arc::clone(&network),
        Arc::clone(&host),
      ),
      config,
      store,
      network,
      host,
      tasks,
    }
  }

  pub fn config(&self) -> &WorkerConfig {
    &self.config
  }

  pub fn store(&self) -> &CacheStore<S> {
    &self.store
  }

  /// Pre-warm the static partition. All-or-nothing: if any precache URL
  /// fails, nothing is stored and installation fails.
  pub async fn install(&self) -> Result<usize> {
    let partition = self.config.partition_name(PartitionKind::Static);
    let added = self
      .add_all(&partition, None, &self.config.precache)
      .await
      .map_err(|e| eyre!("Install failed: {}", e))?;

    self.host.skip_waiting().await?;
    info!(partition = %partition, entries = added, "installed");
    Ok(added)
  }

  /// Delete partitions from previous versions, take over open windows and
  /// register the periodic dashboard refresh. Returns the deleted partitions.
  pub async fn activate(&self) -> Result<Vec<String>> {
    let deleted = self.store.purge_stale(&self.config.active_partitions())?;

    if let Err(e) = self.host.claim().await {
      warn!(error = %e, "failed to claim clients");
    }

    let periodic = &self.config.periodic;
    if let Err(e) = self
      .host
      .register_periodic_sync(&periodic.tag, periodic.min_interval())
      .await
    {
      warn!(tag = %periodic.tag, error = %e, "periodic sync unavailable");
    }

    info!(deleted = deleted.len(), "activated");
    Ok(deleted)
  }

  /// Answer an intercepted request.
  pub async fn fetch(&self, request: &Request) -> Result<Fetched> {
    let (rule, route) = self.router.route(request);
    debug!(method = %request.method, url = %request.url, rule, "routed request");

    match route {
      Route::Passthrough => Ok(Fetched::passthrough(self.network.fetch(request).await?)),
      Route::Handle {
        strategy,
        partition,
      } => self.strategies.run(strategy, request, partition).await,
    }
  }

  /// Queue a submission made while offline.
  pub fn enqueue(&self, entity_type: &str, payload: &Value) -> Option<Request> {
    self.sync.enqueue(entity_type, payload)
  }

  pub fn pending_submissions(&self, entity_type: &str) -> Result<usize> {
    self.sync.pending(entity_type)
  }

  /// Handle a background sync event. Unknown tags are ignored.
  pub async fn sync(&self, tag: &str) -> Result<Option<FlushReport>> {
    match self.sync.tag_type(tag) {
      Some(entity_type) => self.sync.flush(entity_type).await.map(Some),
      None => {
        debug!(tag, "ignoring unknown sync tag");
        Ok(None)
      }
    }
  }

  /// Handle a periodic sync event. Returns the number of windows updated,
  /// or `None` for tags this worker does not own.
  pub async fn periodic_sync(&self, tag: &str) -> Result<Option<usize>> {
    if tag != self.config.periodic.tag {
      debug!(tag, "ignoring unknown periodic sync tag");
      return Ok(None);
    }
    self.notifications.relay_dashboard_update().await.map(Some)
  }

  pub fn router(&self) -> &Router {
    &self.router
  }

  /// Build the notification a push with this payload would show.
  pub fn compose_notification(&self, payload: Option<&[u8]>) -> Notification {
    self.notifications.compose(payload)
  }

  pub async fn push(&self, payload: Option<&[u8]>) -> Result<Notification> {
    self.notifications.push(payload).await
  }

  pub async fn notification_click(
    &self,
    notification: &Notification,
    action: Option<&str>,
  ) -> Result<ClickOutcome> {
    self.notifications.click(notification, action).await
  }

  /// Handle a message from a page. Unrecognized messages are ignored.
  pub async fn message(&self, message: &Value) -> Result<()> {
    let message = match InboundMessage::deserialize(message) {
      Ok(message) => message,
      Err(e) => {
        debug!(error = %e, "ignoring unrecognized message");
        return Ok(());
      }
    };

    match message {
      InboundMessage::SkipWaiting => self.host.skip_waiting().await,
      InboundMessage::CacheUpdate { urls } => {
        let urls = urls
          .iter()
          .map(|u| self.config.url(u))
          .collect::<Result<Vec<_>>>()?;
        let partition = self.config.partition_name(PartitionKind::Dynamic);
        let added = self
          .add_all(&partition, self.config.limit(PartitionKind::Dynamic), &urls)
          .await?;
        info!(entries = added, "cache updated on request");
        Ok(())
      }
    }
  }

  /// Wait for background work (revalidations) to finish.
  pub async fn settle(&self) {
    debug!(pending = self.tasks.pending(), "settling background work");
    self.tasks.settle().await;
  }

  /// Fetch every URL, then store them all. Any failed fetch or non-2xx
  /// response aborts before anything is stored.
  async fn add_all(
    &self,
    partition: &str,
    limit: Option<usize>,
    urls: &[url::Url],
  ) -> Result<usize> {
    self.store.open(partition)?;

    let fetched: Vec<(Request, Response)> = try_join_all(urls.iter().map(|url| async move {
      let request = Request::get(url.clone());
      let response = self
        .network
        .fetch(&request)
        .await
        .map_err(|e| eyre!("Failed to fetch {}: {}", url, e))?;
      if !response.is_success() {
        return Err(eyre!("Failed to fetch {}: HTTP {}", url, response.status));
      }
      Ok::<_, color_eyre::Report>((request, response))
    }))
    .await?;

    for (request, response) in &fetched {
      self
        .store
        .put_bounded(partition, limit, request, response)
        .await?;
    }

    Ok(fetched.len())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{ResponseSource, SqliteStorage};
  use crate::config::Config;
  use crate::http::RequestMode;
  use crate::testing::{url, MockNetwork, RecordingHost};
  use serde_json::json;
  use std::time::Duration;

  struct Fixture {
    worker: Worker<SqliteStorage>,
    network: Arc<MockNetwork>,
    host: Arc<RecordingHost>,
  }

  fn fixture_on(config: Config, store: CacheStore<SqliteStorage>) -> Fixture {
    let network = MockNetwork::new();
    let host = RecordingHost::new();
    let worker = Worker::new(
      WorkerConfig::from_config(&config).unwrap(),
      store,
      network.clone(),
      host.clone(),
    );
    Fixture {
      worker,
      network,
      host,
    }
  }

  fn fixture() -> Fixture {
    fixture_on(
      Config::default(),
      CacheStore::new(SqliteStorage::open_in_memory().unwrap()),
    )
  }

  fn serve_precache(network: &MockNetwork) {
    serve_precache_except(network, &[]);
  }

  fn serve_precache_except(network: &MockNetwork, missing: &[&str]) {
    for path in Config::default().precache {
      if missing.contains(&path.as_str()) {
        network.respond(&path, 404, "");
      } else {
        network.respond(&path, 200, &format!("precached {}", path));
      }
    }
  }

  #[tokio::test]
  async fn test_install_precaches_static_partition() {
    let f = fixture();
    serve_precache(&f.network);

    assert_eq!(f.worker.install().await.unwrap(), 5);
    assert_eq!(f.worker.store().len("solar-static-v2").unwrap(), 5);
    assert_eq!(*f.host.skip_waiting_calls.lock().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_install_is_all_or_nothing() {
    let f = fixture();
    serve_precache_except(&f.network, &["/manifest.json"]);

    assert!(f.worker.install().await.is_err());
    assert_eq!(f.worker.store().len("solar-static-v2").unwrap(), 0);
    assert_eq!(*f.host.skip_waiting_calls.lock().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_activate_evicts_previous_version() {
    let store = CacheStore::new(SqliteStorage::open_in_memory().unwrap());
    let old = fixture_on(Config::default(), store.clone());
    serve_precache(&old.network);
    old.worker.install().await.unwrap();
    old.worker.enqueue("quotes", &json!({ "quoteNumber": "Q-1" }));

    let mut config = Config::default();
    config.cache.version = "v3".to_string();
    let new = fixture_on(config, store);
    serve_precache(&new.network);
    new.worker.install().await.unwrap();

    let deleted = new.worker.activate().await.unwrap();

    assert_eq!(deleted, vec!["solar-static-v2".to_string()]);
    assert_eq!(new.worker.store().len("solar-static-v3").unwrap(), 5);
    assert_eq!(new.worker.pending_submissions("quotes").unwrap(), 1);
    assert!(*new.host.claimed.lock().unwrap());
    assert_eq!(
      *new.host.periodic.lock().unwrap(),
      vec![("update-dashboard".to_string(), Duration::from_secs(24 * 60 * 60))]
    );
  }

  #[tokio::test]
  async fn test_activate_survives_missing_periodic_sync() {
    let f = fixture();
    *f.host.periodic_unsupported.lock().unwrap() = true;
    f.worker.store().open("solar-api-v1").unwrap();

    let deleted = f.worker.activate().await.unwrap();

    assert_eq!(deleted, vec!["solar-api-v1".to_string()]);
    assert!(f.host.periodic.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_image_is_served_from_cache_on_second_request() {
    let f = fixture();
    f.network.respond("/icons/icon-192x192.png", 200, "png");
    let req = Request::get(url("/icons/icon-192x192.png"));

    let first = f.worker.fetch(&req).await.unwrap();
    let second = f.worker.fetch(&req).await.unwrap();

    assert_eq!(first.source, ResponseSource::Network);
    assert_eq!(second.source, ResponseSource::Cache);
    assert_eq!(f.network.call_count("/icons/icon-192x192.png"), 1);
    assert_eq!(f.worker.store().len("solar-images-v2").unwrap(), 1);
  }

  #[tokio::test]
  async fn test_read_only_api_serves_cache_over_server_error() {
    let f = fixture();
    let req = Request::get(url("/api/dashboard/overview"));
    f.worker
      .store()
      .put("solar-api-v2", &req, &Response::new(200, "cached"))
      .unwrap();
    f.network.respond("/api/dashboard/overview", 500, "");

    let fetched = f.worker.fetch(&req).await.unwrap();
    f.worker.settle().await;

    assert_eq!(fetched.response.status, 200);
    assert_eq!(fetched.response.text(), "cached");
  }

  #[tokio::test]
  async fn test_mutable_api_offline_uses_cached_copy() {
    let f = fixture();
    f.network.respond("/api/quotes", 200, "[\"Q-1\"]");
    f.network.fail("/api/quotes");
    let req = Request::get(url("/api/quotes"));

    f.worker.fetch(&req).await.unwrap();
    let fetched = f.worker.fetch(&req).await.unwrap();

    assert_eq!(fetched.source, ResponseSource::Cache);
    assert_eq!(fetched.response.text(), "[\"Q-1\"]");
  }

  #[tokio::test]
  async fn test_offline_navigation_gets_offline_page() {
    let f = fixture();
    serve_precache(&f.network);
    f.worker.install().await.unwrap();

    let req = Request::get(url("/customers")).with_mode(RequestMode::Navigate);
    f.network.fail("/customers");
    let fetched = f.worker.fetch(&req).await.unwrap();

    assert_eq!(fetched.source, ResponseSource::OfflinePage);
    assert_eq!(fetched.response.text(), "precached /offline.html");
  }

  #[tokio::test]
  async fn test_post_passes_through_uncached() {
    let f = fixture();
    f.network.respond("/api/quotes", 201, "created");
    let req = Request::post_json(url("/api/quotes"), &json!({ "total": 1200 })).unwrap();

    let fetched = f.worker.fetch(&req).await.unwrap();

    assert_eq!(fetched.source, ResponseSource::Passthrough);
    assert_eq!(fetched.response.status, 201);
    assert!(f.worker.store().partition_names().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_sync_event_flushes_matching_queue() {
    let f = fixture();
    f.network.respond("/api/quotes/sync", 200, "");
    f.worker.enqueue("quotes", &json!({ "quoteNumber": "Q-1" }));

    let report = f.worker.sync("sync-quotes").await.unwrap().unwrap();
    assert_eq!(report.replayed, 1);
    assert_eq!(f.worker.pending_submissions("quotes").unwrap(), 0);

    assert_eq!(f.worker.sync("sync-unknown").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_periodic_sync_relays_dashboard_update() {
    let f = fixture();
    f.host.add_window("w1", "http://localhost:3000/dashboard");
    f.network
      .respond_json("/api/dashboard/updates", json!({ "installs": 3 }));

    assert_eq!(f.worker.periodic_sync("update-dashboard").await.unwrap(), Some(1));
    assert_eq!(f.worker.periodic_sync("something-else").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_skip_waiting_message() {
    let f = fixture();
    f.worker
      .message(&json!({ "type": "skip-waiting" }))
      .await
      .unwrap();
    assert_eq!(*f.host.skip_waiting_calls.lock().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_cache_update_message_fills_dynamic_partition() {
    let f = fixture();
    f.network.respond("/projects", 200, "projects");
    f.network.respond("/customers", 200, "customers");

    f.worker
      .message(&json!({ "type": "cache-update", "urls": ["/projects", "/customers"] }))
      .await
      .unwrap();

    assert_eq!(f.worker.store().len("solar-dynamic-v2").unwrap(), 2);
  }

  #[tokio::test]
  async fn test_unknown_message_is_ignored() {
    let f = fixture();
    f.worker
      .message(&json!({ "type": "reload-everything" }))
      .await
      .unwrap();
    f.worker.message(&json!("hello")).await.unwrap();
    assert_eq!(*f.host.skip_waiting_calls.lock().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_push_then_click_opens_deep_link() {
    let f = fixture();
    let notification = f
      .worker
      .push(Some(br#"{"title":"Quote approved","data":{"url":"/quotes/17"}}"#))
      .await
      .unwrap();

    let outcome = f
      .worker
      .notification_click(&notification, Some("view"))
      .await
      .unwrap();

    assert_eq!(
      outcome,
      ClickOutcome::Opened("http://localhost:3000/quotes/17".to_string())
    );
    assert_eq!(f.host.shown.lock().unwrap().len(), 1);
  }
}
