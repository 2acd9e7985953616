//! The crate-wide error taxonomy.
//!
//! One flat enum covering every kind the gateway's error handling needs to
//! distinguish, rather than a tree of per-module error types. Built with
//! `thiserror`: the narrower error surface here doesn't need a blanket
//! `From`-generation macro across dozens of third-party error types, just
//! the handful of `#[from]` conversions below.

use std::fmt;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// The error kinds every caller needs to distinguish, plus the external
/// error conversions the transports and store actually need.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("bad input: {0}")]
    BadInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not ready: {0}")]
    NotReady(String),

    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("not connected: {0}")]
    NotConnected(String),

    #[error("request timeout: {0}")]
    RequestTimeout(String),

    #[error("stage timeout: {0}")]
    StageTimeout(String),

    #[error("canceled: {0}")]
    Canceled(String),

    #[error("upstream error {code}: {message}")]
    Upstream {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("internal error ({tag}): {detail}")]
    Internal { tag: &'static str, detail: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Regex(#[from] regex::Error),

    #[error("{0}")]
    Elapsed(#[from] tokio::time::error::Elapsed),
}

impl GatewayError {
    pub fn internal(tag: &'static str, detail: impl fmt::Display) -> Self {
        GatewayError::Internal {
            tag,
            detail: detail.to_string(),
        }
    }

    pub fn invariant_violation(detail: impl fmt::Display) -> Self {
        Self::internal("invariant-violation", detail)
    }

    /// Whether a caller retrying the same operation might plausibly succeed.
    /// Mirrors the `recoverable` flag the façade's error envelope carries.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            GatewayError::NotReady(_)
                | GatewayError::RequestTimeout(_)
                | GatewayError::StageTimeout(_)
                | GatewayError::Elapsed(_)
                | GatewayError::ConnectionClosed(_)
        )
    }

    /// The stable `kind` tag used in the façade's `{error:{code,message}}`
    /// envelope mapping. The core never builds the envelope itself (that's
    /// the façade's job) but it does guarantee this name is stable.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::BadInput(_) => "BadInput",
            GatewayError::NotFound(_) => "NotFound",
            GatewayError::NotReady(_) => "NotReady",
            GatewayError::PolicyViolation(_) => "PolicyViolation",
            GatewayError::ConnectionClosed(_) => "ConnectionClosed",
            GatewayError::NotConnected(_) => "NotConnected",
            GatewayError::RequestTimeout(_) => "Timeout",
            GatewayError::StageTimeout(_) => "Timeout",
            GatewayError::Canceled(_) => "Canceled",
            GatewayError::Upstream { .. } => "Upstream",
            GatewayError::Internal { .. } => "Internal",
            GatewayError::Io(_) => "Internal",
            GatewayError::Json(_) => "Internal",
            GatewayError::Regex(_) => "Internal",
            GatewayError::Elapsed(_) => "Timeout",
        }
    }
}
