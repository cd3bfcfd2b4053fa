//! Fetch strategies that orchestrate the cache store with network fetching.
//!
//! Caching failures never fail a fetch: they are logged and the network
//! response is still returned. Only a network failure with nothing to fall
//! back on reaches the caller.

use color_eyre::{Report, Result};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{CacheStorage, CacheStore, Fetched};
use crate::config::{PartitionKind, WorkerConfig};
use crate::http::{Request, Response};
use crate::network::Network;
use crate::router::Strategy;
use crate::tasks::BackgroundTasks;

pub struct Strategies<S: CacheStorage> {
  config: Arc<WorkerConfig>,
  store: CacheStore<S>,
  network: Arc<dyn Network>,
  tasks: BackgroundTasks,
}

impl<S: CacheStorage> Strategies<S> {
  pub fn new(
    config: Arc<WorkerConfig>,
    store: CacheStore<S>,
    network: Arc<dyn Network>,
    tasks: BackgroundTasks,
  ) -> Self {
    Self {
      config,
      store,
      network,
      tasks,
    }
  }

  pub async fn run(
    &self,
    strategy: Strategy,
    request: &Request,
    partition: PartitionKind,
  ) -> Result<Fetched> {
    match strategy {
      Strategy::CacheFirst => self.cache_first(request, partition).await,
      Strategy::NetworkFirst => self.network_first(request, partition).await,
      Strategy::StaleWhileRevalidate => self.stale_while_revalidate(request, partition).await,
    }
  }

  /// Serve from cache without touching the network; fetch and store on a miss.
  pub async fn cache_first(&self, request: &Request, kind: PartitionKind) -> Result<Fetched> {
    let partition = self.config.partition_name(kind);

    if let Some(cached) = self.lookup(&partition, request) {
      return Ok(Fetched::from_cache(cached));
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          self.store_response(&partition, kind, request, &response).await;
        }
        Ok(Fetched::from_network(response))
      }
      Err(err) => self.offline_fallback(request, err),
    }
  }

  /// Prefer the network; fall back to the cache only when the fetch itself fails.
  ///
  /// A non-2xx response is returned as-is and not cached.
  pub async fn network_first(&self, request: &Request, kind: PartitionKind) -> Result<Fetched> {
    let partition = self.config.partition_name(kind);

    match self.network.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          self.store_response(&partition, kind, request, &response).await;
        }
        Ok(Fetched::from_network(response))
      }
      Err(err) => {
        debug!(url = %request.url, error = %err, "network failed, trying cache");
        if let Some(cached) = self.lookup(&partition, request) {
          return Ok(Fetched::from_cache(cached));
        }
        self.offline_fallback(request, err)
      }
    }
  }

  /// Answer from cache immediately and refresh it in the background.
  ///
  /// Without a cached entry the network result is awaited: a non-2xx
  /// response is returned as-is, a network error propagates.
  pub async fn stale_while_revalidate(
    &self,
    request: &Request,
    kind: PartitionKind,
  ) -> Result<Fetched> {
    let partition = self.config.partition_name(kind);
    let cached = self.lookup(&partition, request);

    let revalidate = revalidate(
      Arc::clone(&self.network),
      self.store.clone(),
      partition,
      self.config.limit(kind),
      request.clone(),
    );

    match cached {
      Some(cached) => {
        let url = request.url.clone();
        self.tasks.spawn(async move {
          if let Err(e) = revalidate.await {
            debug!(%url, error = %e, "background revalidation failed");
          }
        });
        Ok(Fetched::from_cache(cached))
      }
      None => revalidate.await.map(Fetched::from_network),
    }
  }

  /// Cache read errors count as a miss.
  fn lookup(&self, partition: &str, request: &Request) -> Option<Response> {
    match self.store.match_in(partition, request) {
      Ok(found) => found,
      Err(e) => {
        warn!(partition, url = %request.url, error = %e, "cache lookup failed");
        None
      }
    }
  }

  async fn store_response(
    &self,
    partition: &str,
    kind: PartitionKind,
    request: &Request,
    response: &Response,
  ) {
    if let Err(e) = self
      .store
      .put_bounded(partition, self.config.limit(kind), request, response)
      .await
    {
      warn!(partition, url = %request.url, error = %e, "failed to cache response");
    }
  }

  /// Serve the offline page to requests that want HTML, otherwise give up
  /// with the network error.
  fn offline_fallback(&self, request: &Request, err: Report) -> Result<Fetched> {
    if request.wants_html() {
      let offline = Request::get(self.config.offline_page.clone());
      match self.store.match_any(&offline) {
        Ok(Some(page)) => return Ok(Fetched::offline_page(page)),
        Ok(None) => warn!(page = %offline.url, "offline page is not cached"),
        Err(e) => warn!(error = %e, "offline page lookup failed"),
      }
    }
    Err(err)
  }
}

/// Fetch and, on success, refresh the cached copy.
async fn revalidate<S: CacheStorage>(
  network: Arc<dyn Network>,
  store: CacheStore<S>,
  partition: String,
  limit: Option<usize>,
  request: Request,
) -> Result<Response> {
  let response = network.fetch(&request).await?;
  if response.is_success() {
    if let Err(e) = store
      .put_bounded(&partition, limit, &request, &response)
      .await
    {
      warn!(partition = %partition, url = %request.url, error = %e, "failed to cache response");
    }
  }
  Ok(response)
}
