use crate::failover::{FailoverController, HealthMonitorHandle};
use crate::mirror::MirrorService;
use crate::server::guards::{auth::RequireAdminKey, gate};
use crate::server::routes::{health, mirror};

use axum::{
    Router,
    extract::Request,
    http::{HeaderName, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::Response,
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::timeout::TimeoutLayer;
use tracing::{Instrument, error, info, info_span, warn};

/// Header echoed back on every response so operators can correlate log lines.
const REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
const REQUEST_ID_MAX: usize = 128;

/// Accepts the caller's id when it is a sane header value, otherwise mints a 16-char one.
fn request_id(req: &Request) -> String {
    req.headers()
        .get(&REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= REQUEST_ID_MAX)
        .map(str::to_owned)
        .unwrap_or_else(|| URL_SAFE_NO_PAD.encode(rand::random::<[u8; 12]>()))
}

#[derive(Clone)]
pub struct CastorState {
    pub failover: FailoverController,
    pub mirror: MirrorService,
    /// Absent when no monitor runs (tests); the gate then only reports.
    pub monitor: Option<HealthMonitorHandle>,
    pub admin_key: Arc<str>,
}

impl CastorState {
    pub fn new(
        failover: FailoverController,
        mirror: MirrorService,
        monitor: Option<HealthMonitorHandle>,
        admin_key: Arc<str>,
    ) -> Self {
        Self {
            failover,
            mirror,
            monitor,
            admin_key,
        }
    }
}

async fn not_found_handler() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Runs each request inside a `request` span so handler logs (failover, gate, auth) carry the
/// same id; the outcome is recorded once the response is known.
async fn access_log(req: Request, next: Next) -> Response {
    let id = request_id(&req);
    let span = info_span!(
        "request",
        id = %id,
        method = %req.method(),
        path = %req.uri().path(),
        version = ?req.version(),
    );

    let started = Instant::now();
    let mut resp = next.run(req).instrument(span.clone()).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        resp.headers_mut().insert(REQUEST_ID, value);
    }

    let status = resp.status().as_u16();
    let elapsed_ms = started.elapsed().as_millis() as u64;
    span.in_scope(|| match resp.status() {
        s if s.is_server_error() => error!(status, elapsed_ms, "request failed"),
        s if s.is_client_error() => warn!(status, elapsed_ms, "request rejected"),
        _ => info!(status, elapsed_ms, "request served"),
    });
    resp
}

pub fn castor_router(state: CastorState, request_timeout: Duration) -> Router {
    // Mirror reads need a live database; health and operator routes must stay reachable.
    let mirror = mirror::router()
        .layer(middleware::from_fn_with_state(
            state.clone(),
            gate::require_database,
        ))
        .layer(middleware::from_extractor_with_state::<RequireAdminKey, _>(
            state.clone(),
        ));

    let operator = health::admin_router().layer(middleware::from_extractor_with_state::<
        RequireAdminKey,
        _,
    >(state.clone()));

    Router::new()
        .merge(health::public_router())
        .merge(operator)
        .merge(mirror)
        .fallback(not_found_handler)
        .with_state(state)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(middleware::from_fn(access_log))
}
