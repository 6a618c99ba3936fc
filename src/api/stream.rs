//! HTTP-FLV, HTTP-TS and HLS proxying
//!
//! FLV and TS requests are streamed from the backend that owns the stream.
//! HLS needs more care: segment names do not carry the stream name, so
//! each playlist is tied to an [`HlsSession`] and every `.ts` URL in it is
//! tagged with `spbhid={session id}`. Segment requests carrying the tag are
//! served by the backend of that session's stream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use crc::{Crc, CRC_32_ISO_HDLC};
use dashmap::DashMap;
use tokio::task::JoinHandle;

use super::{copy_headers, ApiState};
use crate::error::{Error, Result, ResultExt};
use crate::registry::BackendServer;
use crate::stream_url::{request_stream_url, resolve};

/// HLS sessions not requested for this long are forgotten
pub const HLS_ALIVE: Duration = Duration::from_secs(120);

/// Query parameter tagging HLS segment URLs
pub const SPBHID: &str = "spbhid";

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// One HLS viewer stream, shared by every client of the same stream URL
#[derive(Debug, Clone)]
pub struct HlsSession {
    pub id: String,
    pub stream_url: String,
    last_used: Instant,
}

/// HLS sessions by stream URL and by `spbhid`
pub struct HlsSessions {
    by_stream: DashMap<String, HlsSession>,
    by_id: DashMap<String, String>,
    seed: u32,
    next_id: AtomicU64,
    alive: Duration,
}

impl HlsSessions {
    pub fn new(alive: Duration) -> Self {
        let started = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let mut digest = CRC32.digest();
        digest.update(&started.to_be_bytes());
        digest.update(&std::process::id().to_be_bytes());

        Self {
            by_stream: DashMap::new(),
            by_id: DashMap::new(),
            seed: digest.finalize(),
            next_id: AtomicU64::new(1),
            alive,
        }
    }

    /// Session of `stream_url`, created on first use
    pub fn load_or_store(&self, stream_url: &str) -> HlsSession {
        let mut entry = self
            .by_stream
            .entry(stream_url.to_string())
            .or_insert_with(|| {
                let id = format!(
                    "{:08x}{:x}",
                    self.seed,
                    self.next_id.fetch_add(1, Ordering::Relaxed)
                );
                tracing::debug!(stream = %stream_url, spbhid = %id, "HLS session created");
                HlsSession {
                    id,
                    stream_url: stream_url.to_string(),
                    last_used: Instant::now(),
                }
            });
        entry.last_used = Instant::now();
        let session = entry.clone();
        drop(entry);

        self.by_id
            .insert(session.id.clone(), session.stream_url.clone());
        session
    }

    /// Session a tagged segment URL belongs to
    pub fn load_by_id(&self, id: &str) -> Option<HlsSession> {
        let stream_url = self.by_id.get(id)?.value().clone();
        let mut session = self.by_stream.get_mut(&stream_url)?;
        if session.id != id {
            return None;
        }
        session.last_used = Instant::now();
        Some(session.clone())
    }

    pub fn len(&self) -> usize {
        self.by_stream.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_stream.is_empty()
    }

    /// Forget sessions idle longer than the alive window
    pub fn cleanup(&self) {
        let alive = self.alive;
        self.by_stream.retain(|stream_url, session| {
            let keep = session.last_used.elapsed() < alive;
            if !keep {
                tracing::debug!(stream = %stream_url, spbhid = %session.id, "HLS session expired");
            }
            keep
        });
        self.by_id.retain(|id, stream_url| {
            self.by_stream
                .get(stream_url)
                .is_some_and(|session| session.id == *id)
        });
    }

    /// Spawn a background task that runs [`cleanup`](Self::cleanup)
    pub fn spawn_cleanup_task(self: &Arc<Self>) -> JoinHandle<()> {
        let sessions = Arc::clone(self);
        let interval = (sessions.alive / 4).max(Duration::from_millis(100));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                sessions.cleanup();
            }
        })
    }
}

/// Tag every `.ts` URL of a playlist with the session id
pub fn tag_segments(playlist: &str, id: &str) -> String {
    if playlist.contains(".ts?") {
        playlist.replace(".ts?", &format!(".ts?{SPBHID}={id}&"))
    } else {
        playlist.replace(".ts", &format!(".ts?{SPBHID}={id}"))
    }
}

/// Fallback handler of the stream router
pub async fn handle_stream(
    State(state): State<ApiState>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response> {
    let path = uri.path();
    if path.ends_with(".m3u8") {
        return serve_playlist(&state, &uri, &headers).await;
    }
    if !path.ends_with(".flv") && !path.ends_with(".ts") {
        return Ok(StatusCode::NOT_FOUND.into_response());
    }

    let spbhid = url::form_urlencoded::parse(uri.query().unwrap_or_default().as_bytes())
        .find(|(k, _)| k == SPBHID)
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty());
    match spbhid {
        Some(id) => serve_segment(&state, &uri, &id).await,
        None => serve_http_stream(&state, &uri, &headers).await,
    }
}

/// Stream URL of a request, or a 400 response
fn stream_url_of(uri: &Uri, headers: &HeaderMap) -> std::result::Result<(String, String), Response> {
    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();
    let full_url = request_stream_url("http", host, uri.path(), uri.query());
    match resolve(&full_url) {
        Ok(stream_url) => Ok((stream_url, full_url)),
        Err(e) => Err((
            StatusCode::BAD_REQUEST,
            format!("build stream url from {full_url}: {e}"),
        )
            .into_response()),
    }
}

async fn serve_http_stream(state: &ApiState, uri: &Uri, headers: &HeaderMap) -> Result<Response> {
    let (stream_url, full_url) = match stream_url_of(uri, headers) {
        Ok(urls) => urls,
        Err(response) => return Ok(response),
    };
    let backend = state
        .registry
        .pick(&stream_url)
        .await
        .stage(format!("pick backend for {stream_url}"))?;

    let response = fetch(state, &backend, uri.path())
        .await
        .stage(format!("serve {full_url} by backend {backend}"))?;
    tracing::info!(stream = %stream_url, backend = %backend, path = %uri.path(), "HTTP stream started");

    streamed(response)
}

async fn serve_playlist(state: &ApiState, uri: &Uri, headers: &HeaderMap) -> Result<Response> {
    let (stream_url, full_url) = match stream_url_of(uri, headers) {
        Ok(urls) => urls,
        Err(response) => return Ok(response),
    };
    let session = state.hls.load_or_store(&stream_url);
    let backend = state
        .registry
        .pick(&session.stream_url)
        .await
        .stage(format!("pick backend for {stream_url}"))?;

    let response = fetch(state, &backend, &path_and_query(uri))
        .await
        .stage(format!("serve {full_url} by backend {backend}"))?;
    let status = response.status();
    let backend_headers = response.headers().clone();
    let playlist = response
        .text()
        .await
        .stage(format!("read playlist {full_url}"))?;

    tracing::debug!(stream = %stream_url, spbhid = %session.id, "HLS playlist served");
    copy_headers(Response::builder().status(status), &backend_headers)
        .body(Body::from(tag_segments(&playlist, &session.id)))
        .map_err(|e| Error::Parse(format!("build playlist response: {e}")))
}

async fn serve_segment(state: &ApiState, uri: &Uri, id: &str) -> Result<Response> {
    let session = match state.hls.load_by_id(id) {
        Some(session) => session,
        None => {
            return Ok((StatusCode::BAD_REQUEST, format!("load stream by {SPBHID} {id}")).into_response())
        }
    };
    let backend = state
        .registry
        .pick(&session.stream_url)
        .await
        .stage(format!("pick backend for {}", session.stream_url))?;

    let response = fetch(state, &backend, &path_and_query(uri))
        .await
        .stage(format!("serve segment {} by backend {backend}", uri.path()))?;
    streamed(response)
}

/// Relay a backend response body as it arrives
fn streamed(response: reqwest::Response) -> Result<Response> {
    let builder = copy_headers(Response::builder().status(response.status()), response.headers());
    builder
        .body(Body::from_stream(response.bytes_stream()))
        .map_err(|e| Error::Parse(format!("build stream response: {e}")))
}

fn path_and_query(uri: &Uri) -> String {
    match uri.query().filter(|q| !q.is_empty()) {
        Some(query) => format!("{}?{query}", uri.path()),
        None => uri.path().to_string(),
    }
}

/// GET `path` from the backend's HTTP stream server; only 200 is accepted
async fn fetch(state: &ApiState, backend: &BackendServer, path: &str) -> Result<reqwest::Response> {
    let port = backend.http_port()?;
    let url = format!("http://{}:{port}{path}", backend.ip);
    let response = state
        .http
        .get(&url)
        .send()
        .await
        .map_err(|e| Error::BackendUnavailable(format!("request to {url}: {e}")))?;

    if response.status() != StatusCode::OK {
        return Err(Error::BackendUnavailable(format!(
            "proxy stream to {url} failed, status={}",
            response.status()
        )));
    }
    Ok(response)
}
