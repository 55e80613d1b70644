use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde_json::{Value, json};

/// Sub-kind for validation failures, carried in the error `data.details`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationKind {
    Domain,
    Field,
    Schema,
    Aggregation,
    Generic,
}

impl ValidationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationKind::Domain => "domain",
            ValidationKind::Field => "field",
            ValidationKind::Schema => "schema",
            ValidationKind::Aggregation => "aggregation",
            ValidationKind::Generic => "generic",
        }
    }
}

/// Gateway-wide error taxonomy. Every variant maps to a JSON-RPC error code:
/// the standard -327xx range for protocol-level failures plus the gateway's
/// reserved -320xx range.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("method not found: {0}")]
    McpMethodNotFound(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("connection pool timeout after {0:?}")]
    PoolTimeout(Duration),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("rate limit exceeded, retry in {retry_after:.1}s")]
    RateLimit { retry_after: f64 },

    #[error("validation error ({}): {message}", .kind.as_str())]
    Validation {
        kind: ValidationKind,
        message: String,
    },

    #[error("record not found: {0}")]
    RecordNotFound(String),

    #[error("method '{method}' is not available on model '{model}'")]
    MethodNotFoundOnModel { model: String, method: String },

    #[error("the method '{method}' does not exist on the model '{model}'")]
    OdooMethodNotFound { model: String, method: String },

    #[error("resource error: {0}")]
    Resource(String),

    #[error("tool error: {0}")]
    Tool(String),
}

impl GatewayError {
    pub fn validation(kind: ValidationKind, message: impl Into<String>) -> Self {
        GatewayError::Validation {
            kind,
            message: message.into(),
        }
    }

    /// JSON-RPC error code for this kind.
    pub fn code(&self) -> i64 {
        match self {
            GatewayError::Parse(_) => -32700,
            GatewayError::InvalidRequest(_) => -32600,
            GatewayError::McpMethodNotFound(_) => -32601,
            GatewayError::InvalidParams(_) => -32602,
            GatewayError::Internal(_) => -32603,
            GatewayError::PoolTimeout(_) => -32000,
            GatewayError::Auth(_) => -32001,
            GatewayError::Network(_) => -32002,
            GatewayError::Protocol(_) => -32003,
            GatewayError::Config(_) => -32004,
            GatewayError::ConnectionFailed(_) => -32005,
            GatewayError::Session(_) => -32006,
            GatewayError::Validation { .. } => -32007,
            GatewayError::RecordNotFound(_) => -32008,
            GatewayError::MethodNotFoundOnModel { .. } => -32009,
            GatewayError::RateLimit { .. } => -32010,
            GatewayError::Resource(_) => -32011,
            GatewayError::Tool(_) => -32012,
            GatewayError::OdooMethodNotFound { .. } => -32016,
        }
    }

    /// Stable kind string surfaced in `error.data.kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Parse(_) => "parse",
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::McpMethodNotFound(_) => "method_not_found",
            GatewayError::InvalidParams(_) => "invalid_params",
            GatewayError::Internal(_) => "internal",
            GatewayError::Config(_) => "configuration",
            GatewayError::Network(_) => "network",
            GatewayError::Protocol(_) => "protocol",
            GatewayError::Auth(_) => "auth",
            GatewayError::Session(_) => "session",
            GatewayError::PoolTimeout(_) => "pool_timeout",
            GatewayError::ConnectionFailed(_) => "connection",
            GatewayError::RateLimit { .. } => "rate_limit",
            GatewayError::Validation { .. } => "validation",
            GatewayError::RecordNotFound(_) => "record_not_found",
            GatewayError::MethodNotFoundOnModel { .. } => "method_not_found_on_model",
            GatewayError::OdooMethodNotFound { .. } => "odoo_method_not_found",
            GatewayError::Resource(_) => "resource",
            GatewayError::Tool(_) => "tool",
        }
    }

    /// Sanitized detail payload for `error.data.details`.
    pub fn details(&self) -> Value {
        match self {
            GatewayError::RateLimit { retry_after } => json!({ "retry_after": retry_after }),
            GatewayError::Validation { kind, message } => {
                json!({ "kind": kind.as_str(), "message": message })
            }
            GatewayError::MethodNotFoundOnModel { model, method }
            | GatewayError::OdooMethodNotFound { model, method } => {
                json!({ "model": model, "method": method })
            }
            GatewayError::PoolTimeout(d) => json!({ "timeout_secs": d.as_secs_f64() }),
            other => json!(other.to_string()),
        }
    }

    /// JSON-RPC error member.
    pub fn to_error_object(&self) -> Value {
        json!({
            "code": self.code(),
            "message": self.to_string(),
            "data": {
                "kind": self.kind(),
                "details": self.details(),
            }
        })
    }
}

static METHOD_NOT_EXIST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[Tt]he method '(?P<method>[^']+)' does not exist on the model '(?P<model>[^']+)'")
        .expect("method-not-exist regex")
});

static RECORD_NOT_EXIST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)record\b.*\bdoes not exist").expect("record-not-exist regex")
});

/// Normalize a wire fault string from Odoo into the common taxonomy.
///
/// Both RPC variants feed their fault messages through here so the
/// dispatcher sees one vocabulary regardless of protocol.
pub fn classify_odoo_fault(message: &str) -> GatewayError {
    if let Some(caps) = METHOD_NOT_EXIST.captures(message) {
        return GatewayError::OdooMethodNotFound {
            model: caps["model"].to_string(),
            method: caps["method"].to_string(),
        };
    }

    if message.contains("Funzione di aggregazione")
        || message.contains("Invalid aggregation function")
    {
        return GatewayError::Validation {
            kind: ValidationKind::Aggregation,
            message: message.to_string(),
        };
    }

    if message.contains("UserError") || message.contains("ValidationError") {
        return GatewayError::Validation {
            kind: ValidationKind::Generic,
            message: message.to_string(),
        };
    }

    if RECORD_NOT_EXIST.is_match(message) {
        return GatewayError::RecordNotFound(message.to_string());
    }

    if message.contains("AccessDenied")
        || message.contains("Access Denied")
        || message.contains("AccessError")
        || message.contains("Invalid credentials")
        || message.contains("Session expired")
    {
        return GatewayError::Auth(message.to_string());
    }

    GatewayError::Protocol(message.to_string())
}

pub type GatewayResult<T> = Result<T, GatewayError>;
