//! Version and backend registration endpoints

use axum::{extract::State, Json};
use serde::Serialize;

use super::ApiState;
use crate::error::{Error, Result};
use crate::registry::BackendServer;

/// Version block of the versions response
#[derive(Debug, Clone, Serialize)]
pub struct VersionInfo {
    pub major: u32,
    pub minor: u32,
    pub revision: u32,
    pub version: String,
    pub signature: String,
}

impl VersionInfo {
    pub fn current() -> Self {
        Self {
            major: env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or_default(),
            minor: env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or_default(),
            revision: env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or_default(),
            version: crate::VERSION.to_string(),
            signature: crate::signature(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    pub pid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    fn ok(data: Option<T>) -> Self {
        Self {
            code: 0,
            pid: std::process::id().to_string(),
            data,
        }
    }
}

pub async fn versions() -> Json<ApiResponse<VersionInfo>> {
    Json(ApiResponse::ok(Some(VersionInfo::current())))
}

/// A backend announcing itself, or refreshing its announcement
pub async fn register(
    State(state): State<ApiState>,
    body: String,
) -> Result<Json<ApiResponse<()>>> {
    let server: BackendServer =
        serde_json::from_str(&body).map_err(|e| Error::Parse(format!("register body: {e}")))?;
    server.validate()?;

    tracing::debug!(backend = %server, id = %server.id(), "Backend registered");
    state.registry.update(server).await;

    Ok(Json(ApiResponse::ok(None)))
}
