// Admission failures for the picture editing upgrade, rendered as the relay's
// JSON error envelope, plus the request id plumbing the middleware scopes.

use std::future::Future;

use axum::{
    http::{header::HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use picsync_common::types::PictureId;
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static REQUEST_ID: String;
}

/// Why a caller was refused before the WebSocket upgrade.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("pictureId must be a positive integer")]
    InvalidPictureId,
    #[error("missing access token")]
    MissingToken,
    #[error("invalid access token")]
    InvalidToken,
    #[error("picture {0} not found")]
    PictureNotFound(PictureId),
    #[error("caller lacks access to this picture")]
    Forbidden,
    #[error("picture access could not be resolved")]
    AccessUnavailable,
}

impl AdmissionError {
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidPictureId => "VALIDATION_FAILED",
            Self::MissingToken | Self::InvalidToken => "AUTH_INVALID_TOKEN",
            Self::PictureNotFound(_) => "NOT_FOUND",
            Self::Forbidden => "AUTH_FORBIDDEN",
            Self::AccessUnavailable => "INTERNAL_ERROR",
        }
    }

    pub const fn status(&self) -> StatusCode {
        match self {
            Self::InvalidPictureId => StatusCode::BAD_REQUEST,
            Self::MissingToken | Self::InvalidToken => StatusCode::UNAUTHORIZED,
            Self::PictureNotFound(_) => StatusCode::NOT_FOUND,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::AccessUnavailable => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Only collaborator outages are worth retrying unchanged.
    pub const fn retryable(&self) -> bool {
        matches!(self, Self::AccessUnavailable)
    }

    fn details(&self) -> Value {
        match self {
            Self::InvalidPictureId => json!({ "field": "pictureId" }),
            Self::PictureNotFound(picture_id) => json!({ "pictureId": picture_id }),
            _ => json!({}),
        }
    }
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        let request_id = current_request_id();

        let mut response = (
            self.status(),
            Json(json!({
                "error": {
                    "code": self.code(),
                    "message": self.to_string(),
                    "retryable": self.retryable(),
                    "request_id": request_id.clone(),
                    "details": self.details(),
                }
            })),
        )
            .into_response();

        if let Some(request_id) = request_id {
            attach_request_id_header(&mut response, &request_id);
        }

        response
    }
}

pub async fn with_request_id_scope<F>(request_id: String, future: F) -> F::Output
where
    F: Future,
{
    REQUEST_ID.scope(request_id, future).await
}

pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}

pub fn request_id_from_headers_or_generate(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub fn attach_request_id_header(response: &mut Response, request_id: &str) {
    if let Ok(header) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header);
    }
}
