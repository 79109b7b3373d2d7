use crate::{render::RenderError, upstream::UpstreamError};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Request failures. Callers only ever see a fixed message per class; the
/// cause goes to the log.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    MissingParams(&'static str),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("image fetch failed: {0}")]
    Image(#[source] UpstreamError),

    #[error(transparent)]
    Render(#[from] RenderError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::MissingParams(msg) => {
                tracing::warn!("rejected request: {msg}");
                (StatusCode::BAD_REQUEST, *msg)
            }
            ApiError::Upstream(err) => {
                tracing::error!(error = %err, "activity fetch failed");
                let msg = match err {
                    UpstreamError::Unreachable(_) => "Failed to connect to Tautulli",
                    UpstreamError::Unparseable(_) => "Failed to parse Tautulli response",
                    UpstreamError::Status(_) | UpstreamError::Rejected(_) => {
                        "Tautulli returned an error"
                    }
                };
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
            ApiError::Image(err) => {
                tracing::error!(error = %err, "image proxy failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to fetch image from Tautulli",
                )
            }
            ApiError::Render(err) => {
                tracing::error!(error = %err, "render failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Failed to render template")
            }
        };
        (status, message).into_response()
    }
}
