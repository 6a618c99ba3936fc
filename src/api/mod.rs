//! HTTP surfaces of the proxy
//!
//! Three routers are served on separate ports:
//!
//! - the API router faces clients: versions and WHIP/WHEP signaling;
//! - the stream router faces players: HTTP-FLV, HTTP-TS and HLS;
//! - the system router faces backends: versions and registration.

pub mod stream;
pub mod system;
pub mod whip;

use std::sync::Arc;

use axum::{
    extract::Request,
    http::{header, response, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};

use self::stream::{HlsSessions, HLS_ALIVE};
use crate::error::Error;
use crate::registry::BackendRegistry;
use crate::rtc::RtcServer;
use crate::stream_url::{WHEP_PATH, WHIP_PATH};

/// Shared state of every router
#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<BackendRegistry>,
    pub rtc: Arc<RtcServer>,
    pub hls: Arc<HlsSessions>,
    pub http: reqwest::Client,

    /// UDP port advertised to WebRTC clients in rewritten answers
    pub rtc_public_port: u16,
}

impl ApiState {
    pub fn new(registry: Arc<BackendRegistry>, rtc: Arc<RtcServer>, rtc_public_port: u16) -> Self {
        Self {
            registry,
            rtc,
            hls: Arc::new(HlsSessions::new(HLS_ALIVE)),
            http: reqwest::Client::new(),
            rtc_public_port,
        }
    }
}

/// Client-facing router
pub fn api_router(state: ApiState) -> Router {
    let whip = post(whip::handle_offer).options(preflight);
    Router::new()
        .route("/api/v1/versions", get(system::versions))
        .route(WHIP_PATH, whip.clone())
        .route(&format!("{WHIP_PATH}{{*rest}}"), whip.clone())
        .route(WHEP_PATH, whip.clone())
        .route(&format!("{WHEP_PATH}{{*rest}}"), whip)
        .layer(middleware::from_fn(cors))
        .with_state(state)
}

/// Player-facing router for HTTP streaming
pub fn stream_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/v1/versions", get(system::versions))
        .fallback(stream::handle_stream)
        .layer(middleware::from_fn(cors))
        .with_state(state)
}

/// Backend-facing router
pub fn system_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/v1/versions", get(system::versions))
        .route("/api/v1/srs/register", post(system::register))
        .layer(middleware::from_fn(cors))
        .with_state(state)
}

async fn preflight() -> StatusCode {
    StatusCode::OK
}

/// Allow any origin on every response
async fn cors(request: Request, next: Next) -> Response {
    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::OK.into_response()
    } else {
        next.run(request).await
    };

    let headers = response.headers_mut();
    let any = HeaderValue::from_static("*");
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, any.clone());
    headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, any.clone());
    headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, any);
    response
}

/// Headers a relayed response recomputes itself
const SKIPPED_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "content-length",
    "content-encoding",
    "upgrade",
];

/// Copy backend response headers, minus hop-by-hop and framing ones
pub(crate) fn copy_headers(mut builder: response::Builder, headers: &HeaderMap) -> response::Builder {
    for (name, value) in headers {
        if SKIPPED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        tracing::warn!(error = %self, "HTTP request failed");
        (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
    }
}
