//! Error types for the mantle proxy

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Main error type for mantle operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Request URL does not match the model path grammar
    #[error("Not found")]
    RouteNotFound,

    /// Model version missing from the request path
    #[error("Model version must be provided")]
    MissingVersion,

    /// Model version is not a valid integer
    #[error("invalid model version: {0}")]
    InvalidVersion(String),

    /// The membership ring is empty
    #[error("no members in cluster")]
    NoMembers,

    /// A member string on the wire did not parse
    #[error("invalid member: {0}")]
    InvalidMember(String),

    /// Cluster connection used in the wrong state
    #[error("illegal cluster state: {0}")]
    ClusterState(&'static str),

    /// The model does not exist in the backing store
    #[error("model not found in provider: {0}")]
    ProviderMiss(String),

    /// Transient provider failure (I/O, network)
    #[error("provider error: {0}")]
    Provider(String),

    /// The backend refused the config reload
    #[error("backend reload failed: {0}")]
    Reload(String),

    /// The model did not reach AVAILABLE within the fetch timeout
    #[error("Timeout: Model did not load in time")]
    LoadTimeout,

    /// Backend status/management RPC failure
    #[error("backend error: {0}")]
    Backend(String),

    /// Forwarding to a replica or the backend failed
    #[error("transport error: {0}")]
    Transport(String),

    /// Service discovery failure
    #[error("discovery error: {0}")]
    Discovery(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem error
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a provider error with the given message
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    /// Create a transport error with the given message
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a discovery error with the given message
    pub fn discovery(msg: impl Into<String>) -> Self {
        Self::Discovery(msg.into())
    }
}

/// Wire shape of REST error bodies: `{"Status":"Error","Message":"..."}`
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Always `"Error"`
    #[serde(rename = "Status")]
    pub status: &'static str,
    /// Human-readable message
    #[serde(rename = "Message")]
    pub message: String,
}

impl ErrorBody {
    /// Build the standard error body for a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: "Error",
            message: message.into(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::RouteNotFound | Error::ProviderMiss(_) => StatusCode::NOT_FOUND,
            Error::MissingVersion | Error::InvalidVersion(_) => StatusCode::BAD_REQUEST,
            Error::NoMembers => StatusCode::SERVICE_UNAVAILABLE,
            Error::LoadTimeout => StatusCode::GATEWAY_TIMEOUT,
            Error::Transport(_) | Error::Backend(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::to_string(&ErrorBody::new(self.to_string())).unwrap_or_default();
        (
            status,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response()
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        match &err {
            Error::RouteNotFound | Error::ProviderMiss(_) => {
                tonic::Status::not_found(err.to_string())
            }
            Error::MissingVersion | Error::InvalidVersion(_) => {
                tonic::Status::invalid_argument(err.to_string())
            }
            Error::NoMembers => tonic::Status::unavailable(err.to_string()),
            Error::LoadTimeout => tonic::Status::deadline_exceeded(err.to_string()),
            Error::Transport(_) | Error::Backend(_) => tonic::Status::unavailable(err.to_string()),
            _ => tonic::Status::internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rest_error_bodies_use_wire_field_names() {
        let body = serde_json::to_value(ErrorBody::new("Not found")).unwrap();
        assert_eq!(body["Status"], "Error");
        assert_eq!(body["Message"], "Not found");
    }

    #[test]
    fn load_timeout_message_is_stable() {
        // Clients match on this message; it is part of the external contract.
        assert_eq!(
            Error::LoadTimeout.to_string(),
            "Timeout: Model did not load in time"
        );
    }

    #[test]
    fn status_codes_follow_error_kinds() {
        assert_eq!(
            Error::RouteNotFound.into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::MissingVersion.into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::NoMembers.into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::LoadTimeout.into_response().status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            Error::transport("boom").into_response().status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn grpc_status_mapping() {
        let status: tonic::Status = Error::NoMembers.into();
        assert_eq!(status.code(), tonic::Code::Unavailable);
        let status: tonic::Status = Error::LoadTimeout.into();
        assert_eq!(status.code(), tonic::Code::DeadlineExceeded);
    }
}
