//! JSON directory routes.

use axum::body::{Body, to_bytes};
use axum::extract::{Path, State};
use axum::http::{Method, Request as HttpRequest, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower::ServiceExt;

use super::response::status_for;
use crate::BridgeError;
use crate::channel::ChannelInfo;
use crate::lifecycle::ChannelManager;

pub fn router(manager: ChannelManager) -> Router {
    Router::new()
        .route("/channels", get(list_channels))
        .route("/metadata/{id}", get(channel_metadata))
        .fallback(not_found)
        .with_state(manager)
}

async fn list_channels(State(manager): State<ChannelManager>) -> Json<Vec<ChannelInfo>> {
    Json(manager.list_channels())
}

async fn channel_metadata(
    State(manager): State<ChannelManager>,
    Path(id): Path<String>,
) -> Result<Json<ChannelInfo>, ApiError> {
    Ok(Json(manager.channel_info(&id)?))
}

async fn not_found() -> ApiError {
    ApiError(BridgeError::NotFound("no such resource".to_string()))
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    status: u16,
}

pub struct ApiError(BridgeError);

impl From<BridgeError> for ApiError {
    fn from(error: BridgeError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let body = Json(ErrorResponse {
            error: self.0.to_string(),
            status: status.as_u16(),
        });
        (status, body).into_response()
    }
}

/// Run a GET for `path` through `router` and collect the whole response
pub async fn dispatch(
    router: &Router,
    path: &str,
) -> Result<(StatusCode, Vec<(String, String)>, Vec<u8>), BridgeError> {
    let request = HttpRequest::builder()
        .method(Method::GET)
        .uri(path)
        .body(Body::empty())
        .map_err(|e| BridgeError::ProtocolHandshake(format!("Invalid request path: {e}")))?;

    let response = match router.clone().oneshot(request).await {
        Ok(response) => response,
        Err(never) => match never {},
    };
    let (parts, body) = response.into_parts();
    let body = to_bytes(body, usize::MAX)
        .await
        .map_err(|e| BridgeError::Transport(format!("Failed to render response: {e}")))?;
    let headers = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect();
    Ok((parts.status, headers, body.to_vec()))
}
