//! Error types for the gateway.
//!
//! The taxonomy mirrors what callers can act on: misconfiguration is
//! operator-actionable (503), bad credentials are reported uniformly (401),
//! policy-gated routes look absent (404), sandbox trouble is retryable (503),
//! and a supervisor start/wait failure is a server error (500).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Authorization failures. Client-facing bodies are uniform regardless of
/// the underlying reason; the specifics only ever reach tracing.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The presented identity assertion failed verification. Collapses
    /// malformed / expired / bad-signature / wrong-audience into one opaque
    /// kind so rejections cannot be used as a verification oracle.
    #[error("invalid token")]
    InvalidToken,

    /// No credential was presented where one is required.
    #[error("missing credential")]
    MissingCredential,

    /// The server side is missing required secret material.
    #[error("authorization is not configured")]
    Misconfigured,
}

/// Errors from the sandbox process-execution interface.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The sandbox control API could not be reached at all.
    #[error("sandbox unreachable: {0}")]
    Unreachable(String),

    /// The sandbox refused a start command. The message is kept verbatim so
    /// the supervisor can recognize "already running" rejections.
    #[error("sandbox rejected start: {message}")]
    StartRejected { message: String },

    /// A port readiness wait ran out of time.
    #[error("port {port} not reachable within {waited_ms}ms")]
    PortTimeout { port: u16, waited_ms: u64 },

    /// The control API answered with something other than success.
    #[error("sandbox control API error: {0}")]
    Api(String),
}

/// Errors surfaced by the process supervisor. Never retried internally;
/// retry policy belongs to the calling handler.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("sandbox unreachable: {0}")]
    SandboxUnreachable(#[source] SandboxError),

    /// The control API was reachable but answered with an error. Not a
    /// transport failure, so not in the retryable 503 bucket.
    #[error("sandbox control API failure: {0}")]
    ControlApi(#[source] SandboxError),

    /// The agent process did not become port-ready in time and is still in
    /// the process table. Distinct from `ProcessExited`.
    #[error("agent process not ready within {waited_ms}ms")]
    ReadyTimeout { waited_ms: u64 },

    /// The agent process left the process table (or entered a terminal
    /// status) while we were waiting for it to become ready.
    #[error("agent process exited during startup (exit code {exit_code:?})")]
    ProcessExited {
        exit_code: Option<i64>,
        stderr: String,
    },

    /// A killed process did not leave the process table in time during
    /// restart.
    #[error("previous agent process did not terminate within {waited_ms}ms")]
    ShutdownTimeout { waited_ms: u64 },

    #[error("failed to start agent process: {0}")]
    StartFailed(#[source] SandboxError),
}

impl SupervisorError {
    /// Wrap a sandbox error from a list/kill/wait call, keeping transport
    /// failures distinct from control API ones.
    pub(crate) fn from_sandbox(e: SandboxError) -> Self {
        match e {
            SandboxError::Api(_) => Self::ControlApi(e),
            other => Self::SandboxUnreachable(other),
        }
    }
}

/// Configuration resolution errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    Invalid { key: String, message: String },

    #[error("invalid verification material: {0}")]
    BadVerificationMaterial(String),
}

/// Top-level error for request handlers; owns the HTTP status mapping.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    /// Forwarding a request to the agent process failed after the process
    /// was confirmed ready.
    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("not found")]
    NotFound,
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Auth(AuthError::InvalidToken | AuthError::MissingCredential) => {
                StatusCode::UNAUTHORIZED
            }
            Self::Auth(AuthError::Misconfigured) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Supervisor(SupervisorError::SandboxUnreachable(_)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Supervisor(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::NotFound => StatusCode::NOT_FOUND,
        }
    }

    /// Client-facing message. Unauthenticated responses share one body so
    /// the reason for rejection is not observable from outside.
    fn client_message(&self) -> String {
        match self {
            Self::Auth(AuthError::InvalidToken | AuthError::MissingCredential) => {
                "unauthorized".to_string()
            }
            Self::Auth(AuthError::Misconfigured) => "authorization is not configured".to_string(),
            Self::NotFound => "not found".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, status = %status, "request failed");
        }
        (status, Json(json!({ "error": self.client_message() }))).into_response()
    }
}
