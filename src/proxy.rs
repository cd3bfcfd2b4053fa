//! Local intercepting proxy: every request is answered by the worker.

use axum::body::{to_bytes, Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::{get, post};
use axum::Json;
use color_eyre::{eyre::eyre, Result};
use futures::stream::{self, Stream};
use serde::Deserialize;
use serde_json::Value;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};
use url::Url;

use crate::cache::{CacheStorage, Fetched};
use crate::event::Event;
use crate::host::LocalHost;
use crate::http::{Request, RequestMode};
use crate::notify::Notification;
use crate::worker::Worker;

pub const MESSAGE_PATH: &str = "/__offgrid/message";
pub const PUSH_PATH: &str = "/__offgrid/push";
pub const CLICK_PATH: &str = "/__offgrid/click";
/// Server-sent events stream; each open stream is a window client
pub const EVENTS_PATH: &str = "/__offgrid/events";

/// Largest request body forwarded to the worker
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Headers that describe the client connection, not the request
const HOP_HEADERS: [&str; 5] = [
  "host",
  "connection",
  "content-length",
  "transfer-encoding",
  "keep-alive",
];

struct ProxyState<S: CacheStorage> {
  worker: Arc<Worker<S>>,
  host: Arc<LocalHost>,
  events: UnboundedSender<Event>,
}

#[derive(Debug, Deserialize)]
struct ClickRequest {
  notification: Notification,
  #[serde(default)]
  action: Option<String>,
}

pub fn router<S: CacheStorage>(
  worker: Arc<Worker<S>>,
  host: Arc<LocalHost>,
  events: UnboundedSender<Event>,
) -> axum::Router {
  let state = Arc::new(ProxyState {
    worker,
    host,
    events,
  });
  axum::Router::new()
    .route(MESSAGE_PATH, post(message::<S>))
    .route(PUSH_PATH, post(push::<S>))
    .route(CLICK_PATH, post(click::<S>))
    .route(EVENTS_PATH, get(window_events::<S>))
    .fallback(intercept::<S>)
    .with_state(state)
}

pub async fn serve<S: CacheStorage>(
  worker: Arc<Worker<S>>,
  host: Arc<LocalHost>,
  events: UnboundedSender<Event>,
  listen: SocketAddr,
) -> Result<()> {
  let origin = worker.config().origin.clone();
  let app = router(worker, host, events);

  let listener = TcpListener::bind(listen)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", listen, e))?;
  info!(%listen, %origin, "proxy listening");

  axum::serve(listener, app)
    .with_graceful_shutdown(async {
      let _ = tokio::signal::ctrl_c().await;
      info!("shutting down");
    })
    .await
    .map_err(|e| eyre!("Proxy server failed: {}", e))
}

fn queue_event<S: CacheStorage>(state: &ProxyState<S>, event: Event) -> StatusCode {
  match state.events.send(event) {
    Ok(()) => StatusCode::ACCEPTED,
    Err(_) => StatusCode::SERVICE_UNAVAILABLE,
  }
}

async fn message<S: CacheStorage>(
  State(state): State<Arc<ProxyState<S>>>,
  Json(body): Json<Value>,
) -> StatusCode {
  queue_event(&state, Event::Message(body))
}

/// The raw body is the push payload; an empty body means no payload.
async fn push<S: CacheStorage>(State(state): State<Arc<ProxyState<S>>>, body: Bytes) -> StatusCode {
  let data = (!body.is_empty()).then(|| body.to_vec());
  queue_event(&state, Event::Push { data })
}

async fn click<S: CacheStorage>(
  State(state): State<Arc<ProxyState<S>>>,
  Json(click): Json<ClickRequest>,
) -> StatusCode {
  queue_event(
    &state,
    Event::NotificationClick {
      notification: click.notification,
      action: click.action,
    },
  )
}

/// Hold a window open. The window's URL is the page that opened the stream
/// (its `Referer`), mapped onto the origin.
async fn window_events<S: CacheStorage>(
  State(state): State<Arc<ProxyState<S>>>,
  headers: HeaderMap,
) -> std::result::Result<
  Sse<impl Stream<Item = std::result::Result<SseEvent, Infallible>>>,
  (StatusCode, String),
> {
  let origin = &state.worker.config().origin;
  let url = headers
    .get("referer")
    .and_then(|v| v.to_str().ok())
    .and_then(|v| Url::parse(v).ok())
    .map(|page| upstream_url(origin, page.path(), page.query()))
    .unwrap_or_else(|| origin.clone());

  let (_, rx) = state
    .host
    .connect_window(url)
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

  let messages = stream::unfold(rx, |mut rx| async move {
    let message = rx.recv().await?;
    Some((Ok(SseEvent::default().data(message.to_string())), rx))
  });
  Ok(Sse::new(messages).keep_alive(KeepAlive::default()))
}

async fn intercept<S: CacheStorage>(
  State(state): State<Arc<ProxyState<S>>>,
  request: axum::extract::Request,
) -> HttpResponse {
  let request = match to_worker_request(&state.worker, request).await {
    Ok(request) => request,
    Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
  };

  match state.worker.fetch(&request).await {
    Ok(fetched) => into_http_response(fetched),
    Err(e) => {
      warn!(method = %request.method, url = %request.url, error = %e, "request failed");
      (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
    }
  }
}

async fn to_worker_request<S: CacheStorage>(
  worker: &Worker<S>,
  request: axum::extract::Request,
) -> Result<Request> {
  let (parts, body) = request.into_parts();
  let url = upstream_url(&worker.config().origin, parts.uri.path(), parts.uri.query());

  let mut converted = Request::get(url);
  converted.method = parts.method.as_str().to_string();
  converted.headers = forwarded_headers(&parts.headers);
  if converted.header("sec-fetch-mode") == Some("navigate") {
    converted.mode = RequestMode::Navigate;
  }

  let body = to_bytes(body, MAX_BODY_BYTES)
    .await
    .map_err(|e| eyre!("Failed to read request body: {}", e))?;
  if !body.is_empty() {
    converted.body = Some(body.to_vec());
  }

  Ok(converted)
}

/// The origin with the request's path and query. The path is never resolved
/// as a reference, so `//host/...` stays on the origin.
fn upstream_url(origin: &Url, path: &str, query: Option<&str>) -> Url {
  let mut url = origin.clone();
  url.set_path(path);
  url.set_query(query);
  url
}

fn forwarded_headers(headers: &HeaderMap) -> std::collections::BTreeMap<String, String> {
  headers
    .iter()
    .filter(|(name, _)| !HOP_HEADERS.contains(&name.as_str()))
    .filter_map(|(name, value)| {
      value
        .to_str()
        .ok()
        .map(|v| (name.as_str().to_string(), v.to_string()))
    })
    .collect()
}

fn into_http_response(fetched: Fetched) -> HttpResponse {
  let status = StatusCode::from_u16(fetched.response.status).unwrap_or(StatusCode::BAD_GATEWAY);
  let mut response = (status, Body::from(fetched.response.body)).into_response();

  let headers = response.headers_mut();
  for (name, value) in &fetched.response.headers {
    if HOP_HEADERS.contains(&name.as_str()) {
      continue;
    }
    if let (Ok(name), Ok(value)) = (
      HeaderName::from_bytes(name.as_bytes()),
      HeaderValue::from_str(value),
    ) {
      headers.insert(name, value);
    }
  }
  if let Ok(source) = HeaderValue::from_str(&fetched.source.to_string()) {
    headers.insert("x-offgrid-source", source);
  }

  response
}
