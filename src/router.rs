//! Request classification.
//!
//! An ordered table of rules; the first rule whose predicate matches decides
//! how a request is handled. Order matters: `/api/` rules sit above the
//! extension rules, so `/api/reports/chart.png` is an API request.

use crate::config::{PartitionKind, RoutesConfig, WorkerConfig};
use crate::http::Request;

/// Fetch policy applied to a routed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  CacheFirst,
  NetworkFirst,
  StaleWhileRevalidate,
}

/// What the worker does with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Forward to the network untouched
  Passthrough,
  Handle {
    strategy: Strategy,
    partition: PartitionKind,
  },
}

type Predicate = Box<dyn Fn(&Request) -> bool + Send + Sync>;

/// One row of the routing table.
pub struct Rule {
  pub name: &'static str,
  pub route: Route,
  matches: Predicate,
}

impl Rule {
  fn new(
    name: &'static str,
    route: Route,
    matches: impl Fn(&Request) -> bool + Send + Sync + 'static,
  ) -> Self {
    Self {
      name,
      route,
      matches: Box::new(matches),
    }
  }

  pub fn matches(&self, request: &Request) -> bool {
    (self.matches)(request)
  }
}

impl std::fmt::Debug for Rule {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Rule")
      .field("name", &self.name)
      .field("route", &self.route)
      .finish_non_exhaustive()
  }
}

#[derive(Debug)]
pub struct Router {
  rules: Vec<Rule>,
}

impl Router {
  pub fn new(config: &WorkerConfig) -> Self {
    Self::from_routes(&config.routes)
  }

  pub fn from_routes(routes: &RoutesConfig) -> Self {
    let read_only = routes.read_only_api.clone();
    let images = routes.image_extensions.clone();
    let statics = routes.static_extensions.clone();
    let build_prefixes = routes.build_prefixes.clone();

    let rules = vec![
      Rule::new("passthrough", Route::Passthrough, |req: &Request| {
        !req.is_get() || !matches!(req.url.scheme(), "http" | "https")
      }),
      Rule::new(
        "read-only-api",
        handle(Strategy::StaleWhileRevalidate, PartitionKind::Api),
        move |req: &Request| {
          let path = req.url.path();
          path.starts_with("/api/")
            && read_only.iter().any(|prefix| path.starts_with(prefix.as_str()))
        },
      ),
      Rule::new(
        "api",
        handle(Strategy::NetworkFirst, PartitionKind::Api),
        |req: &Request| req.url.path().starts_with("/api/"),
      ),
      Rule::new(
        "image",
        handle(Strategy::CacheFirst, PartitionKind::Images),
        move |req: &Request| extension(req).is_some_and(|ext| images.contains(&ext)),
      ),
      Rule::new(
        "static-asset",
        handle(Strategy::CacheFirst, PartitionKind::Dynamic),
        move |req: &Request| {
          let path = req.url.path();
          extension(req).is_some_and(|ext| statics.contains(&ext))
            || build_prefixes
              .iter()
              .any(|prefix| path.starts_with(prefix.as_str()))
        },
      ),
      Rule::new(
        "navigation",
        handle(Strategy::NetworkFirst, PartitionKind::Dynamic),
        Request::is_navigation,
      ),
      Rule::new(
        "default",
        handle(Strategy::StaleWhileRevalidate, PartitionKind::Dynamic),
        |_: &Request| true,
      ),
    ];

    Self { rules }
  }

  /// Classify a request. The last rule matches everything.
  pub fn route(&self, request: &Request) -> (&'static str, Route) {
    self
      .rules
      .iter()
      .find(|rule| rule.matches(request))
      .map(|rule| (rule.name, rule.route))
      .unwrap_or(("default", handle(Strategy::StaleWhileRevalidate, PartitionKind::Dynamic)))
  }

  pub fn rules(&self) -> &[Rule] {
    &self.rules
  }
}

fn handle(strategy: Strategy, partition: PartitionKind) -> Route {
  Route::Handle {
    strategy,
    partition,
  }
}

/// Lowercased extension of the last path segment.
fn extension(request: &Request) -> Option<String> {
  let segment = request.url.path().rsplit('/').next()?;
  let (_, ext) = segment.rsplit_once('.')?;
  (!ext.is_empty()).then(|| ext.to_ascii_lowercase())
}
