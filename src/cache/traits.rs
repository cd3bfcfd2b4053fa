//! Core types shared by the cache store and the fetch strategies.

use chrono::{DateTime, Utc};

use crate::http::{Request, Response};

/// A stored (request, response) pair.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub request: Request,
  pub response: Response,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// Result of handling an intercepted request, including where the response came from.
#[derive(Debug, Clone)]
pub struct Fetched {
  /// The response handed back to the page
  pub response: Response,
  pub source: ResponseSource,
}

impl Fetched {
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Network,
    }
  }

  pub fn from_cache(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Cache,
    }
  }

  pub fn offline_page(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::OfflinePage,
    }
  }

  pub fn passthrough(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Passthrough,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Fresh from the origin
  Network,
  /// Served from a cache partition
  Cache,
  /// Network failed with nothing cached; the offline page was served
  OfflinePage,
  /// Not eligible for caching, forwarded untouched
  Passthrough,
}

impl std::fmt::Display for ResponseSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let label = match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::OfflinePage => "offline-page",
      Self::Passthrough => "passthrough",
    };
    f.write_str(label)
  }
}
