//! Named, bounded partitions over a storage backend.

use color_eyre::Result;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use super::storage::CacheStorage;
use super::traits::CachedEntry;
use crate::http::{Request, Response};

/// Handle to a single partition.
pub struct Partition<S: CacheStorage> {
  name: String,
  storage: Arc<S>,
}

impl<S: CacheStorage> Partition<S> {
  pub fn put(&self, request: &Request, response: &Response) -> Result<()> {
    self.storage.put(&self.name, request, response)
  }

  pub fn get(&self, request: &Request) -> Result<Option<Response>> {
    Ok(
      self
        .storage
        .get(&self.name, request.cache_key())?
        .map(|entry| entry.response),
    )
  }

  pub fn keys(&self) -> Result<Vec<Request>> {
    self.storage.keys(&self.name)
  }

  pub fn delete(&self, request: &Request) -> Result<bool> {
    self.storage.delete(&self.name, request.cache_key())
  }
}

/// Cache store manager.
///
/// Eviction is oldest-first by insertion order, an approximation of LRU: the
/// backend does not track access time.
pub struct CacheStore<S: CacheStorage> {
  storage: Arc<S>,
  /// One writer lock per bounded partition
  write_locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl<S: CacheStorage> CacheStore<S> {
  pub fn new(storage: S) -> Self {
    Self {
      storage: Arc::new(storage),
      write_locks: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  /// Open a partition, creating it on first use.
  pub fn open(&self, name: &str) -> Result<Partition<S>> {
    self.storage.open_partition(name)?;
    Ok(Partition {
      name: name.to_string(),
      storage: Arc::clone(&self.storage),
    })
  }

  #[cfg(test)]
  pub fn put(&self, partition: &str, request: &Request, response: &Response) -> Result<()> {
    self.storage.put(partition, request, response)
  }

  /// Look up a request in one partition.
  pub fn match_in(&self, partition: &str, request: &Request) -> Result<Option<Response>> {
    Ok(
      self
        .storage
        .get(partition, request.cache_key())?
        .map(|entry| entry.response),
    )
  }

  /// Look up a request in any partition.
  pub fn match_any(&self, request: &Request) -> Result<Option<Response>> {
    Ok(
      self
        .storage
        .find(request.cache_key())?
        .map(|entry| entry.response),
    )
  }

  /// Make room for one more entry: when the partition holds `max_size` or
  /// more entries, delete the oldest `count - max_size + 1`.
  pub fn enforce_limit(&self, partition: &str, max_size: usize) -> Result<usize> {
    let keys = self.storage.keys(partition)?;
    if keys.len() < max_size {
      return Ok(0);
    }

    let excess = keys.len() - max_size + 1;
    for request in keys.iter().take(excess) {
      self.storage.delete(partition, request.cache_key())?;
    }

    debug!(partition, evicted = excess, "trimmed partition");
    Ok(excess)
  }

  /// Enforce the bound (if any) and store, holding the partition's writer
  /// lock so concurrent puts cannot overshoot the bound.
  pub async fn put_bounded(
    &self,
    partition: &str,
    limit: Option<usize>,
    request: &Request,
    response: &Response,
  ) -> Result<()> {
    let lock = self.write_lock(partition)?;
    let _guard = lock.lock().await;

    if let Some(max_size) = limit {
      self.enforce_limit(partition, max_size)?;
    }
    self.storage.put(partition, request, response)
  }

  /// Delete every partition not named in `active`. Returns the deleted names.
  pub fn purge_stale(&self, active: &[String]) -> Result<Vec<String>> {
    let active: HashSet<&str> = active.iter().map(String::as_str).collect();
    let mut deleted = Vec::new();

    for name in self.storage.partition_names()? {
      if !active.contains(name.as_str()) {
        self.storage.delete_partition(&name)?;
        info!(partition = %name, "deleted stale partition");
        deleted.push(name);
      }
    }

    Ok(deleted)
  }

  pub fn partition_names(&self) -> Result<Vec<String>> {
    self.storage.partition_names()
  }

  pub fn len(&self, partition: &str) -> Result<usize> {
    self.storage.count(partition)
  }

  /// Every entry of a partition, oldest first.
  pub fn entries(&self, partition: &str) -> Result<Vec<CachedEntry>> {
    let mut entries = Vec::new();
    for request in self.storage.keys(partition)? {
      if let Some(entry) = self.storage.get(partition, request.cache_key())? {
        entries.push(entry);
      }
    }
    Ok(entries)
  }

  fn write_lock(&self, partition: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
    let mut locks = self
      .write_locks
      .lock()
      .map_err(|e| color_eyre::eyre::eyre!("Lock poisoned: {}", e))?;
    Ok(Arc::clone(locks.entry(partition.to_string()).or_default()))
  }
}

impl<S: CacheStorage> Clone for CacheStore<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      write_locks: Arc::clone(&self.write_locks),
    }
  }
}
