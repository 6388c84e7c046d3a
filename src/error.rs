//! Error types and JSON error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Failure to turn one configuration file into an application definition
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed application config {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("malformed package metadata {path}: {source}")]
    Package {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("application config {path} has no {field} and no package.json provides one")]
    MissingField { path: PathBuf, field: &'static str },

    #[error("application config {path} yields an invalid name: {source}")]
    InvalidName {
        path: PathBuf,
        #[source]
        source: crate::app::InvalidAppName,
    },

    #[error("failed to walk {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

/// Raised when an application needs a port and none is left
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no more available ports in range {start}-{end}")]
pub struct PortExhausted {
    pub start: u16,
    pub end: u16,
}

/// Failure reported by a process supervisor
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to start {name}: {reason}")]
    Start { name: String, reason: String },

    #[error("failed to restart {name}: {reason}")]
    Restart { name: String, reason: String },

    #[error("failed to stop {name}: {reason}")]
    Stop { name: String, reason: String },

    #[error("failed to describe {name}: {reason}")]
    Describe { name: String, reason: String },

    #[error("unknown process: {0}")]
    UnknownProcess(String),
}

/// Failure of a runtime registration
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("App conflicts with existing app: {0}")]
    Conflict(String),

    #[error("Invalid app definition: {0}")]
    Invalid(String),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

/// Error codes for gateway errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// No registered route matches the request path
    RouteNotFound,
    /// The supervisor could not report the backend's status
    SupervisorUnavailable,
    /// Request timed out waiting for backend
    RequestTimeout,
    /// Failed to connect to backend
    ConnectionFailed,
}

impl GatewayErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::RouteNotFound => StatusCode::NOT_FOUND,
            GatewayErrorCode::SupervisorUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::RouteNotFound => "ROUTE_NOT_FOUND",
            GatewayErrorCode::SupervisorUnavailable => "SUPERVISOR_UNAVAILABLE",
            GatewayErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            GatewayErrorCode::ConnectionFailed => "CONNECTION_FAILED",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: GatewayErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Gateway-Error header
pub fn json_error_response(
    code: GatewayErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Gateway-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
