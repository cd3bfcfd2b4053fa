//! Offline submission queue with replay on background sync.
//!
//! Each entity type gets its own `offline-<type>` partition. A queued
//! submission is a synthetic `GET /offline/<type>/<stamp>` request whose
//! cached response body is the JSON payload. Replay POSTs each payload to
//! `/api/<type>/sync` and drops entries the origin accepted; anything else
//! stays queued for the next sync event. There is no internal backoff.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStorage, CacheStore};
use crate::config::WorkerConfig;
use crate::http::{Request, Response};
use crate::network::Network;

/// Outcome of one flush pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
  pub attempted: usize,
  pub replayed: usize,
  pub failed: usize,
}

pub struct SyncQueue<S: CacheStorage> {
  config: Arc<WorkerConfig>,
  store: CacheStore<S>,
  network: Arc<dyn Network>,
  /// Last stamp handed out, keeps keys unique within a process
  last_stamp: AtomicI64,
}

impl<S: CacheStorage> SyncQueue<S> {
  pub fn new(config: Arc<WorkerConfig>, store: CacheStore<S>, network: Arc<dyn Network>) -> Self {
    Self {
      config,
      store,
      network,
      last_stamp: AtomicI64::new(0),
    }
  }

  /// Entity type for a `sync-<type>` tag, if it names a configured queue.
  pub fn tag_type<'a>(&self, tag: &'a str) -> Option<&'a str> {
    let entity_type = tag.strip_prefix("sync-")?;
    self
      .config
      .sync_types
      .iter()
      .any(|t| t == entity_type)
      .then_some(entity_type)
  }

  /// Queue a payload for later replay. Failures are logged, not returned.
  pub fn enqueue(&self, entity_type: &str, payload: &Value) -> Option<Request> {
    match self.try_enqueue(entity_type, payload) {
      Ok(request) => {
        info!(entity_type, key = %request.url, "queued offline submission");
        Some(request)
      }
      Err(e) => {
        warn!(entity_type, error = %e, "failed to queue offline submission");
        None
      }
    }
  }

  fn try_enqueue(&self, entity_type: &str, payload: &Value) -> Result<Request> {
    let partition = self.store.open(&self.config.offline_partition(entity_type))?;
    let key = self
      .config
      .url(&format!("/offline/{}/{}", entity_type, self.next_stamp()))?;
    let request = Request::get(key);

    partition.put(&request, &Response::json(payload)?)?;
    Ok(request)
  }

  /// Microsecond timestamp, bumped when the clock has not moved since the
  /// previous call.
  fn next_stamp(&self) -> i64 {
    let now = Utc::now().timestamp_micros();
    let mut last = self.last_stamp.load(Ordering::SeqCst);
    loop {
      let next = now.max(last + 1);
      match self
        .last_stamp
        .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
      {
        Ok(_) => return next,
        Err(actual) => last = actual,
      }
    }
  }

  /// Replay every queued submission of `entity_type`, one at a time.
  ///
  /// A failing entry is logged and left queued; it never stops the rest of
  /// the pass.
  pub async fn flush(&self, entity_type: &str) -> Result<FlushReport> {
    let partition = self.store.open(&self.config.offline_partition(entity_type))?;
    let endpoint = self.config.sync_endpoint(entity_type)?;
    let mut report = FlushReport::default();

    for key in partition.keys()? {
      report.attempted += 1;

      let outcome = match partition.get(&key) {
        Ok(Some(stored)) => self.replay(&stored, &endpoint).await,
        Ok(None) => Err(eyre!("Queued entry vanished")),
        Err(e) => Err(e),
      };

      match outcome.and_then(|()| partition.delete(&key)) {
        Ok(_) => {
          report.replayed += 1;
          debug!(entity_type, key = %key.url, "replayed offline submission");
        }
        Err(e) => {
          report.failed += 1;
          warn!(entity_type, key = %key.url, error = %e, "replay failed, keeping entry queued");
        }
      }
    }

    if report.attempted > 0 {
      info!(
        entity_type,
        replayed = report.replayed,
        failed = report.failed,
        "offline queue flushed"
      );
    }
    Ok(report)
  }

  async fn replay(&self, stored: &Response, endpoint: &Url) -> Result<()> {
    let payload = stored.body_json()?;
    let request = Request::post_json(endpoint.clone(), &payload)?;

    let response = self.network.fetch(&request).await?;
    if !response.is_success() {
      return Err(eyre!("{} answered HTTP {}", endpoint, response.status));
    }
    Ok(())
  }

  /// Number of submissions waiting in a queue.
  pub fn pending(&self, entity_type: &str) -> Result<usize> {
    self.store.len(&self.config.offline_partition(entity_type))
  }
}
