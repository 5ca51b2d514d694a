//! Crate-wide error type. Every fallible boundary (HTTP, XML, geometry, store) converges
//! here so the query API can render one consistent error envelope.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum CapcastError {
    #[error("source not found: {0}")]
    SourceNotFound(String),

    #[error("alert not found: {0}")]
    AlertNotFound(String),

    #[error("config conflict: {0}")]
    ConfigConflict(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("transport error fetching {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("xml parse failed: {0}")]
    XmlParse(String),

    #[error("identifier missing from feed item")]
    IdentifierMissing,
}

impl CapcastError {
    fn status(&self) -> StatusCode {
        match self {
            CapcastError::SourceNotFound(_) | CapcastError::AlertNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            CapcastError::ConfigConflict(_) | CapcastError::Validation(_) => {
                StatusCode::BAD_REQUEST
            }
            CapcastError::StoreUnavailable(_)
            | CapcastError::Transport { .. }
            | CapcastError::XmlParse(_)
            | CapcastError::IdentifierMissing => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for CapcastError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "success": false,
            "error": self.to_string(),
        }));
        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, CapcastError>;
