//! Error types and JSON error responses for the gateway

use crate::target::Provenance;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Boxed error used by response bodies
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type returned by every handler
pub type GatewayBody = UnsyncBoxBody<Bytes, BoxError>;

/// Error codes reported to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed or incomplete client request
    InvalidRequest,
    /// No handler for the requested path
    UnknownRoute,
    /// No cluster registered under the requested name
    UnknownCluster,
    /// Cluster exists but was not added at runtime
    ClusterNotRemovable,
    /// Cluster name is held by a static or discovered cluster
    ClusterConflict,
    /// Cluster definition could not be turned into a proxy
    InvalidCluster,
    /// No port-forward session with the requested id
    SessionNotFound,
    /// Requested URL is not on the external proxy allow-list
    ProxyDenied,
    /// Upstream request failed at the transport level
    UpstreamFailed,
    /// Login flow failed after the provider redirect
    AuthFlowFailed,
    /// Port-forward could not be established
    TunnelFailed,
    /// Internal gateway error
    InternalError,
}

impl ErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorCode::UnknownRoute => StatusCode::NOT_FOUND,
            ErrorCode::UnknownCluster => StatusCode::NOT_FOUND,
            ErrorCode::ClusterNotRemovable => StatusCode::FORBIDDEN,
            ErrorCode::ClusterConflict => StatusCode::CONFLICT,
            ErrorCode::InvalidCluster => StatusCode::BAD_REQUEST,
            ErrorCode::SessionNotFound => StatusCode::NOT_FOUND,
            ErrorCode::ProxyDenied => StatusCode::BAD_REQUEST,
            ErrorCode::UpstreamFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::AuthFlowFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::TunnelFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::UnknownRoute => "UNKNOWN_ROUTE",
            ErrorCode::UnknownCluster => "UNKNOWN_CLUSTER",
            ErrorCode::ClusterNotRemovable => "CLUSTER_NOT_REMOVABLE",
            ErrorCode::ClusterConflict => "CLUSTER_CONFLICT",
            ErrorCode::InvalidCluster => "INVALID_CLUSTER",
            ErrorCode::SessionNotFound => "SESSION_NOT_FOUND",
            ErrorCode::ProxyDenied => "PROXY_DENIED",
            ErrorCode::UpstreamFailed => "UPSTREAM_FAILED",
            ErrorCode::AuthFlowFailed => "AUTH_FLOW_FAILED",
            ErrorCode::TunnelFailed => "TUNNEL_FAILED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::with_status(code.status_code(), code, message)
    }

    pub fn with_status(status: StatusCode, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: status.as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
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

/// Wrap bytes in a response body
pub fn full_body(body: impl Into<Bytes>) -> GatewayBody {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// An empty response body
pub fn empty_body() -> GatewayBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Create a JSON error response with X-Gateway-Error header
pub fn json_error_response(code: ErrorCode, message: impl Into<String>) -> Response<GatewayBody> {
    json_error_with_status(code.status_code(), code, message)
}

/// Create a JSON error response with an explicit status
pub fn json_error_with_status(
    status: StatusCode,
    code: ErrorCode,
    message: impl Into<String>,
) -> Response<GatewayBody> {
    let error = ErrorResponse::with_status(status, code, message);

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Gateway-Error", code.as_header_value())
        .body(full_body(error.to_json()))
        .expect("valid response with StatusCode enum and static headers")
}

/// A cluster definition that cannot be turned into a working proxy
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cluster '{name}': invalid server URL '{server}': {reason}")]
    InvalidServerUrl {
        name: String,
        server: String,
        reason: String,
    },

    #[error("cluster '{name}': found a client certificate entry, but not a client key")]
    MissingClientKey { name: String },

    #[error("cluster '{name}': found a client key entry, but not a client certificate")]
    MissingClientCertificate { name: String },

    #[error("cluster '{name}': both a {what} file and inline {what} data were given")]
    ConflictingSources { name: String, what: &'static str },

    #[error("cluster '{name}': cannot read {path}: {source}")]
    ReadFile {
        name: String,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cluster '{name}': invalid {what}: {reason}")]
    InvalidPem {
        name: String,
        what: &'static str,
        reason: String,
    },

    #[error("cluster '{name}': field '{field}' is not valid base64: {reason}")]
    InvalidBase64 {
        name: String,
        field: &'static str,
        reason: String,
    },

    #[error("cluster '{name}': invalid proxy URL '{url}': {reason}")]
    InvalidProxyUrl {
        name: String,
        url: String,
        reason: String,
    },

    #[error("cluster '{name}': TLS setup failed: {reason}")]
    Tls { name: String, reason: String },
}

/// Registry mutation failures
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("cluster '{0}' not found")]
    NotFound(String),

    #[error("cluster '{name}' is a {provenance} cluster and cannot be deleted")]
    NotRemovable { name: String, provenance: Provenance },

    #[error("cluster '{name}' is a {provenance} cluster and cannot be replaced")]
    Conflict { name: String, provenance: Provenance },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl RegistryError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RegistryError::NotFound(_) => ErrorCode::UnknownCluster,
            RegistryError::NotRemovable { .. } => ErrorCode::ClusterNotRemovable,
            RegistryError::Conflict { .. } => ErrorCode::ClusterConflict,
            RegistryError::Config(_) => ErrorCode::InvalidCluster,
        }
    }
}

/// Failures talking to a workload through a cluster's API server
#[derive(Debug, Clone, Error)]
pub enum WorkloadError {
    /// API server refused the TCP connection; transient for the watchdog
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("API server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("port-forward protocol error: {0}")]
    Protocol(String),
}

/// Port-forward failures
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("invalid request {0}")]
    Validation(String),

    #[error("cluster {0} not found")]
    TargetNotFound(String),

    #[error("can't find any available port: {0}")]
    NoFreePort(#[source] std::io::Error),

    #[error("failed to listen on local port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("portforward failed: {0}")]
    Workload(#[from] WorkloadError),

    #[error("portforward was not ready after {0:?}")]
    ReadyTimeout(Duration),

    #[error("portforward ended before becoming ready")]
    Aborted,

    #[error("PortForward not found")]
    SessionNotFound,
}

impl TunnelError {
    pub fn code(&self) -> ErrorCode {
        match self {
            TunnelError::Validation(_) => ErrorCode::InvalidRequest,
            TunnelError::TargetNotFound(_) => ErrorCode::UnknownCluster,
            TunnelError::SessionNotFound => ErrorCode::SessionNotFound,
            _ => ErrorCode::TunnelFailed,
        }
    }
}

/// Delegated login failures
#[derive(Debug, Error)]
pub enum AuthFlowError {
    #[error("cluster is required")]
    MissingCluster,

    #[error("cluster {0} not found")]
    UnknownCluster(String),

    #[error("no OIDC provider configured for cluster {0}")]
    NoProvider(String),

    #[error("failed to discover provider at {issuer}: {reason}")]
    Discovery { issuer: String, reason: String },

    #[error("invalid request state is empty")]
    MissingState,

    #[error("wrong state set, invalid request {0}")]
    MalformedState(String),

    #[error("invalid request")]
    UnknownState,

    #[error("Failed to exchange token: {0}")]
    Exchange(String),

    #[error("No id_token field in oauth2 token.")]
    MissingIdToken,

    #[error("Failed to verify ID Token: {0}")]
    Verification(String),
}

impl AuthFlowError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AuthFlowError::MissingCluster
            | AuthFlowError::MissingState
            | AuthFlowError::MalformedState(_)
            | AuthFlowError::UnknownState => ErrorCode::InvalidRequest,
            AuthFlowError::UnknownCluster(_) => ErrorCode::UnknownCluster,
            AuthFlowError::NoProvider(_) | AuthFlowError::Discovery { .. } => {
                ErrorCode::InternalError
            }
            AuthFlowError::Exchange(_)
            | AuthFlowError::MissingIdToken
            | AuthFlowError::Verification(_) => ErrorCode::AuthFlowFailed,
        }
    }
}
