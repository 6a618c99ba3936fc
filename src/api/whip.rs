//! WHIP/WHEP signaling relay
//!
//! The offer is forwarded unchanged to the backend's HTTP API. The answer
//! comes back with its host candidates pointing at the proxy's WebRTC port,
//! and the session's ICE username is registered so media can be routed.

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::Response,
};

use super::{copy_headers, ApiState};
use crate::error::{Error, Result, ResultExt};
use crate::registry::BackendServer;
use crate::rtc::{ice_username, parse_ice_credentials, rewrite_candidates};
use crate::stream_url::{request_stream_url, resolve};

/// POST handler shared by WHIP and WHEP
pub async fn handle_offer(
    State(state): State<ApiState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    offer: String,
) -> Result<Response> {
    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();
    let full_url = request_stream_url("http", host, uri.path(), uri.query());
    let stream_url = resolve(&full_url).stage(format!("build stream url {full_url}"))?;

    tracing::debug!(
        path = %uri.path(),
        stream = %stream_url,
        offer_size = offer.len(),
        "WebRTC offer received"
    );

    let backend = state
        .registry
        .pick(&stream_url)
        .await
        .stage(format!("pick backend for {stream_url}"))?;

    proxy_offer(&state, &method, &uri, &backend, offer, &stream_url)
        .await
        .stage(format!("serve {full_url} by backend {backend}"))
}

/// Forward an SDP offer to `backend` and relay its answer
pub async fn proxy_offer(
    state: &ApiState,
    method: &Method,
    uri: &Uri,
    backend: &BackendServer,
    offer: String,
    stream_url: &str,
) -> Result<Response> {
    let api_port = backend.api_port()?;
    let mut backend_url = format!("http://{}:{}{}", backend.ip, api_port, uri.path());
    if let Some(query) = uri.query().filter(|q| !q.is_empty()) {
        backend_url.push('?');
        backend_url.push_str(query);
    }

    let response = state
        .http
        .request(method.clone(), &backend_url)
        .body(offer.clone())
        .send()
        .await
        .map_err(|e| Error::BackendUnavailable(format!("request to {backend_url}: {e}")))?;

    let status = response.status();
    if status != StatusCode::OK && status != StatusCode::CREATED {
        return Err(Error::BackendUnavailable(format!(
            "proxy api to {backend_url} failed, status={status}"
        )));
    }

    let backend_headers = response.headers().clone();
    let answer = response
        .text()
        .await
        .stage(format!("read answer from {backend_url}"))?;

    let answer = rewrite_candidates(&answer, &backend.rtc_ports()?, state.rtc_public_port);
    let offer_creds = parse_ice_credentials(&offer).stage("parse remote sdp offer")?;
    let answer_creds = parse_ice_credentials(&answer).stage("parse local sdp answer")?;

    let username = ice_username(&answer_creds.ufrag, &offer_creds.ufrag);
    state.rtc.register(stream_url, &username);

    tracing::info!(
        stream = %stream_url,
        backend = %backend,
        ufrag = %username,
        status = status.as_u16(),
        "WebRTC session negotiated"
    );

    copy_headers(Response::builder().status(status), &backend_headers)
        .body(Body::from(answer))
        .map_err(|e| Error::Parse(format!("build answer response: {e}")))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::{body::to_bytes, extract::Request, routing::post, Router};
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use super::*;
    use crate::api::api_router;
    use crate::registry::BackendRegistry;
    use crate::rtc::RtcServer;

    const OFFER: &str = "v=0\r\na=ice-ufrag:offer1\r\na=ice-pwd:offerpwd\r\n";
    const ANSWER: &str = "v=0\r\n\
        a=ice-ufrag:answer1\r\n\
        a=ice-pwd:answerpwd\r\n\
        a=candidate:0 1 udp 2130706431 10.0.0.5 8000 typ host generation 0\r\n";

    /// A fake SRS HTTP API answering every offer with [`ANSWER`].
    async fn spawn_backend(status: StatusCode) -> u16 {
        let app = Router::new().route(
            "/rtc/v1/whip/",
            post(move |uri: Uri, body: String| async move {
                assert_eq!(uri.query(), Some("app=live&stream=livestream"));
                assert_eq!(body, OFFER);
                (
                    status,
                    [
                        (header::CONTENT_TYPE, "application/sdp"),
                        (header::LOCATION, "/rtc/v1/whip/?token=abc"),
                    ],
                    ANSWER,
                )
            }),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        port
    }

    async fn state_with_backend(api_port: Option<u16>) -> ApiState {
        let registry = Arc::new(BackendRegistry::new());
        if let Some(port) = api_port {
            let mut backend = BackendServer::new("127.0.0.1", "srv", "svc", "1");
            backend.rtmp = vec!["1935".into()];
            backend.api = vec![port.to_string()];
            backend.rtc = vec!["udp://0.0.0.0:8000".into()];
            registry.update(backend).await;
        }

        let rtc = RtcServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::clone(&registry),
            Duration::from_secs(60),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        ApiState::new(registry, Arc::new(rtc), 9000)
    }

    fn offer_request() -> Request {
        Request::builder()
            .method(Method::POST)
            .uri("/rtc/v1/whip/?app=live&stream=livestream")
            .header(header::HOST, "localhost:11985")
            .body(Body::from(OFFER))
            .unwrap()
    }

    #[tokio::test]
    async fn test_whip_answer_rewritten_and_session_registered() {
        let port = spawn_backend(StatusCode::CREATED).await;
        let state = state_with_backend(Some(port)).await;
        let rtc = Arc::clone(&state.rtc);

        let response = api_router(state).oneshot(offer_request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "/rtc/v1/whip/?token=abc"
        );
        assert_eq!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "*"
        );

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("10.0.0.5 9000 typ host"));
        assert!(!body.contains(" 8000 typ host"));
        assert_eq!(rtc.session_count(), 1);
    }

    #[tokio::test]
    async fn test_backend_error_status_is_500() {
        let port = spawn_backend(StatusCode::BAD_REQUEST).await;
        let state = state_with_backend(Some(port)).await;

        let response = api_router(state).oneshot(offer_request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("status=400"));
    }

    #[tokio::test]
    async fn test_no_backend_is_500() {
        let state = state_with_backend(None).await;
        let response = api_router(state).oneshot(offer_request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_offer_without_ice_is_forwarded_then_rejected() {
        let (tx, mut offers) = tokio::sync::mpsc::unbounded_channel();
        let app = Router::new().route(
            "/rtc/v1/whip/",
            post(move |body: String| async move {
                tx.send(body).unwrap();
                (StatusCode::CREATED, ANSWER)
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let state = state_with_backend(Some(port)).await;
        let rtc = Arc::clone(&state.rtc);

        let request = Request::builder()
            .method(Method::POST)
            .uri("/rtc/v1/whip/?app=live&stream=livestream")
            .body(Body::from("v=0\r\n"))
            .unwrap();
        let response = api_router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(offers.recv().await.unwrap(), "v=0\r\n");
        assert_eq!(rtc.session_count(), 0);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("parse remote sdp offer"));
    }

    #[tokio::test]
    async fn test_preflight() {
        let state = state_with_backend(None).await;
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/rtc/v1/whep/")
            .body(Body::empty())
            .unwrap();

        let response = api_router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_METHODS).unwrap(),
            "*"
        );
    }
}
