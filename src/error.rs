//! Error types and HTTP response conversion

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias used throughout the engine
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the multiplexer
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration failed to load or validate
    #[error("configuration error: {0}")]
    Config(String),

    /// A backend's `/auth/login` call returned a non-200 status or failed transport
    #[error("backend auth failure: {0}")]
    BackendAuth(String),

    /// A backend request failed at the transport layer
    #[error("backend transport error: {0}")]
    BackendTransport(String),

    /// Try-All fan-out produced zero or more than one successful response
    #[error("try-all ambiguity: {0}")]
    TryAllAmbiguity(String),

    /// A backend response body could not be parsed as JSON
    #[error("malformed JSON from backend: {0}")]
    MalformedJson(String),

    /// One or more backends reported an error during a fan-out
    #[error("fan-out error: {0}")]
    FanOut(String),

    /// Generic bad request from the client
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Catch-all internal error
    #[error("internal error: {0}")]
    Internal(String),
}

/// Error response body returned to clients
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub status: u16,
}

impl ErrorResponse {
    fn new(status: StatusCode, code: &str, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: Some(code.to_string()),
            status: status.as_u16(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Every path here is "errors that occur before a response can be
        // formed" (spec §7 propagation policy) — always a 500 except where
        // the caller made a malformed request.
        let (status, code) = match &self {
            Error::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR"),
            Error::BackendAuth(_) => (StatusCode::INTERNAL_SERVER_ERROR, "BACKEND_AUTH"),
            Error::BackendTransport(_) => (StatusCode::INTERNAL_SERVER_ERROR, "BACKEND_TRANSPORT"),
            Error::TryAllAmbiguity(_) => (StatusCode::INTERNAL_SERVER_ERROR, "TRY_ALL_AMBIGUITY"),
            Error::MalformedJson(_) => (StatusCode::INTERNAL_SERVER_ERROR, "MALFORMED_JSON"),
            Error::FanOut(_) => (StatusCode::INTERNAL_SERVER_ERROR, "FAN_OUT"),
            Error::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            Error::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
        };

        tracing::error!(error = %self, code, "request failed");

        let body = ErrorResponse::new(status, code, self.to_string());
        (status, Json(body)).into_response()
    }
}

impl From<figment::Error> for Error {
    fn from(e: figment::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::BackendTransport(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::MalformedJson(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_all_ambiguity_maps_to_500() {
        let err = Error::TryAllAmbiguity("more than one successful response".into());
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn bad_request_maps_to_400() {
        let err = Error::BadRequest("missing hash".into());
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
