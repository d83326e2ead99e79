//! # Transport error taxonomy & failure attribution
//!
//! These are data, not Rust `Error` types that propagate — they're carried
//! inside an [`crate::transport::outcome::OperationOutcome`] and read by
//! reporting. See [`crate::error`] for the split rationale.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Dns,
    Connect,
    Tls,
    Timeout,
    Http,
    Protocol,
    JsonRpc,
    Mcp,
    Tool,
    Cancelled,
    Unknown,
}

/// A classified operation error, carried as data inside `OperationOutcome`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationError {
    pub kind: ErrorKind,
    /// A short machine-facing subcode, e.g. "404", "-32601", "handshake_failed".
    pub code: String,
    pub message: String,
}

impl OperationError {
    pub fn new(kind: ErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn dns(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Dns, "lookup_failed", message)
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connect, "connect_failed", message)
    }

    pub fn tls(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Tls, "handshake_failed", message)
    }

    pub fn timeout(phase: &str) -> Self {
        Self::new(ErrorKind::Timeout, phase, format!("{phase} exceeded"))
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "cancelled", "operation cancelled")
    }

    /// Map an HTTP status code to an [`OperationError`]. `None` for 2xx (the
    /// caller should treat those as success, not construct an error at all).
    pub fn from_http_status(status: u16) -> Option<Self> {
        match status {
            200..=299 => None,
            400 => Some(Self::new(ErrorKind::Http, "400", "bad request")),
            401 => Some(Self::new(ErrorKind::Http, "401", "unauthorized")),
            403 => Some(Self::new(ErrorKind::Http, "403", "forbidden")),
            404 => Some(Self::new(ErrorKind::Http, "404", "not found")),
            429 => Some(Self::new(ErrorKind::Http, "429", "rate limited")),
            500..=599 => Some(Self::new(
                ErrorKind::Http,
                status.to_string(),
                "server error",
            )),
            other => Some(Self::new(ErrorKind::Http, other.to_string(), "http error")),
        }
    }

    /// Translate a JSON-RPC `error` subobject's numeric code into the
    /// taxonomy. Unknown codes pass through as their literal code string.
    pub fn from_jsonrpc_code(code: i64, message: impl Into<String>) -> Self {
        let subcode = match code {
            -32700 => "parse_error",
            -32600 => "invalid_request",
            -32601 => "method_not_found",
            -32602 => "invalid_params",
            -32603 => "internal_error",
            _ => return Self::new(ErrorKind::JsonRpc, code.to_string(), message),
        };
        Self::new(ErrorKind::JsonRpc, subcode, message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureBucket {
    ClientNetwork,
    Gateway,
    McpServer,
    UpstreamApi,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attribution {
    pub bucket: FailureBucket,
    pub confidence: f64,
    pub rationale: String,
}

/// Map an [`OperationError`] to a human-facing bucket with a confidence
/// score, via case-insensitive substring matching on kind/code.
pub fn attribute(error: &OperationError) -> Attribution {
    match error.kind {
        ErrorKind::Dns | ErrorKind::Connect | ErrorKind::Tls => Attribution {
            bucket: FailureBucket::ClientNetwork,
            confidence: 0.9,
            rationale: format!("{:?} failure before an application response was received", error.kind),
        },
        ErrorKind::Timeout => Attribution {
            bucket: FailureBucket::ClientNetwork,
            confidence: 0.6,
            rationale: "timeout could originate on either side of the connection".into(),
        },
        ErrorKind::Http => {
            let code = error.code.as_str();
            if code == "429" {
                Attribution {
                    bucket: FailureBucket::UpstreamApi,
                    confidence: 0.7,
                    rationale: "rate limiting is an upstream policy decision".into(),
                }
            } else if code.starts_with('5') {
                Attribution {
                    bucket: FailureBucket::Gateway,
                    confidence: 0.8,
                    rationale: "5xx status typically indicates a gateway or origin failure".into(),
                }
            } else {
                Attribution {
                    bucket: FailureBucket::Gateway,
                    confidence: 0.5,
                    rationale: "4xx status may reflect either a client or gateway misconfiguration".into(),
                }
            }
        }
        ErrorKind::Protocol | ErrorKind::JsonRpc | ErrorKind::Mcp => Attribution {
            bucket: FailureBucket::McpServer,
            confidence: 0.85,
            rationale: "malformed or error-carrying response from the MCP server".into(),
        },
        ErrorKind::Tool => Attribution {
            bucket: FailureBucket::McpServer,
            confidence: 0.95,
            rationale: "tool call completed but reported isError=true".into(),
        },
        ErrorKind::Cancelled => Attribution {
            bucket: FailureBucket::Unknown,
            confidence: 0.3,
            rationale: "operation was cancelled by the caller, not a service failure".into(),
        },
        ErrorKind::Unknown => Attribution {
            bucket: FailureBucket::Unknown,
            confidence: 0.1,
            rationale: "unclassified error".into(),
        },
    }
}
