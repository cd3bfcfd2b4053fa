//! Request and response values exchanged between pages, the worker and the origin.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use url::Url;

/// How the page issued a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
  /// Top-level page navigation
  Navigate,
  SameOrigin,
  NoCors,
  #[default]
  Cors,
}

/// An intercepted (or synthetic) request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
  pub method: String,
  pub url: Url,
  /// Header names are stored lowercased
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  #[serde(default)]
  pub mode: RequestMode,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn get(url: Url) -> Self {
    Self {
      method: "GET".to_string(),
      url,
      headers: BTreeMap::new(),
      mode: RequestMode::default(),
      body: None,
    }
  }

  /// A page navigation to `url`, accepting HTML.
  pub fn navigate(url: Url) -> Self {
    Self::get(url)
      .with_mode(RequestMode::Navigate)
      .with_header("accept", "text/html,application/xhtml+xml")
  }

  /// A JSON POST, as used to replay queued submissions.
  pub fn post_json(url: Url, body: &serde_json::Value) -> Result<Self> {
    let body =
      serde_json::to_vec(body).map_err(|e| eyre!("Failed to serialize request body: {}", e))?;
    Ok(Self {
      method: "POST".to_string(),
      url,
      headers: BTreeMap::new(),
      mode: RequestMode::default(),
      body: Some(body),
    }
    .with_header("content-type", "application/json"))
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  pub fn with_mode(mut self, mode: RequestMode) -> Self {
    self.mode = mode;
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
  }

  pub fn is_get(&self) -> bool {
    self.method.eq_ignore_ascii_case("GET")
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  /// Whether a failed request should be answered with the offline page.
  pub fn wants_html(&self) -> bool {
    self.is_navigation()
      || self
        .header("accept")
        .is_some_and(|accept| accept.contains("text/html"))
  }

  /// The lookup key for this request. Entries are matched by full URL.
  pub fn cache_key(&self) -> &str {
    self.url.as_str()
  }

  /// Fixed-length hash of the cache key, used as the storage primary key.
  pub fn key_hash(&self) -> String {
    hash_key(self.cache_key())
  }
}

/// SHA256 of a cache key, hex encoded.
pub fn hash_key(key: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(key.as_bytes());
  hex::encode(hasher.finalize())
}

/// A response from the origin or from a cache partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  #[serde(default)]
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: BTreeMap::new(),
      body: body.into(),
    }
  }

  pub fn json(value: &serde_json::Value) -> Result<Self> {
    let body =
      serde_json::to_vec(value).map_err(|e| eyre!("Failed to serialize response body: {}", e))?;
    Ok(Self::new(200, body).with_header("content-type", "application/json"))
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  /// HTTP 2xx
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }

  pub fn body_json(&self) -> Result<serde_json::Value> {
    serde_json::from_slice(&self.body).map_err(|e| eyre!("Response body is not JSON: {}", e))
  }
}
