//! Error taxonomy for stubgate.
//!
//! Every failure surfaces as a typed, descriptive error. The groups mirror how
//! failures propagate:
//!
//! - [`ValidationError`]: bad declarations, raised synchronously at registration
//!   (or by [`crate::handler::HandlerRegistry::check_times`]).
//! - [`AuthError`]: a client connection presented a missing or unknown token.
//! - [`TimeoutError`]: a bounded operation did not finish in time. Never retried here.
//! - [`RpcError`]: a remote resolution failed (closed channel, cancellation, timeout).
//! - [`ConnectionError`]: prefix ownership conflicts and unknown connections.
//! - [`WireError`]: a peer sent a frame that does not decode.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, InterceptorError>;

/// Umbrella error for every fallible stubgate operation.
#[derive(Debug, Error)]
pub enum InterceptorError {
    /// A declaration or configuration value was rejected.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A client connection failed authentication.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// A bounded operation exceeded its time limit.
    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    /// A remote resolution failed.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// A connection-level conflict or lookup failure.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// No handler matched and the unhandled-request policy rejected the request.
    #[error("Unhandled request: {method} {url}")]
    UnhandledRequest {
        /// Request method
        method: String,
        /// Full request URL
        url: String,
    },

    /// The gateway was asked to handle traffic while stopped.
    #[error("Interceptor is not running")]
    NotRunning,

    /// Token store or listener I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Forwarding a request to the real network failed.
    #[error("Passthrough request failed: {0}")]
    Passthrough(#[from] reqwest::Error),

    /// A wire message could not be decoded or converted.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The WebSocket channel failed.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),
}

impl From<tokio_tungstenite::tungstenite::Error> for InterceptorError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        InterceptorError::WebSocket(Box::new(err))
    }
}

/// Declaration and configuration errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A path template names the same parameter twice.
    #[error("Duplicate path parameter '{name}' in '{template}'")]
    DuplicateParameter {
        /// Repeated parameter name
        name: String,
        /// Offending template
        template: String,
    },

    /// A template produced an unusable matcher.
    #[error("Invalid path pattern '{template}': {details}")]
    InvalidPattern {
        /// Offending template
        template: String,
        /// Compiler message
        details: String,
    },

    /// Usage bounds where `min > max`.
    #[error("Invalid usage bounds: min {min} is greater than max {max}")]
    InvalidTimes {
        /// Declared minimum
        min: usize,
        /// Declared maximum
        max: usize,
    },

    /// A base URL or fallback target could not be parsed.
    #[error("Invalid URL '{url}': {details}")]
    InvalidUrl {
        /// Raw input
        url: String,
        /// Parser message
        details: String,
    },

    /// A path prefix that cannot be claimed (empty or root).
    #[error("Invalid path prefix '{prefix}'")]
    InvalidPrefix {
        /// Raw prefix
        prefix: String,
    },

    /// One or more handlers were matched fewer times than declared.
    #[error("{}", render_times_failures(.failures))]
    TimesNotSatisfied {
        /// Each under-satisfied declaration
        failures: Vec<TimesFailure>,
    },
}

/// A single handler that did not reach its minimum call count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimesFailure {
    /// `METHOD /template` of the declaration
    pub handler: String,
    /// `file:line:column` where the bounds were declared
    pub declared_at: String,
    /// Declared minimum
    pub min: usize,
    /// Declared maximum, `None` when unbounded
    pub max: Option<usize>,
    /// Calls actually matched
    pub actual: usize,
}

fn render_times_failures(failures: &[TimesFailure]) -> String {
    let mut out = format!(
        "{} handler(s) did not receive the expected number of requests:",
        failures.len()
    );
    for failure in failures {
        let expected = match failure.max {
            Some(max) if max == failure.min => format!("exactly {max}"),
            Some(max) => format!("between {} and {max}", failure.min),
            None => format!("at least {}", failure.min),
        };
        out.push_str(&format!(
            "\n  - {} declared at {}: expected {expected}, got {}",
            failure.handler, failure.declared_at, failure.actual
        ));
    }
    out
}

/// Client authentication failures. Any of these closes the connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The handshake carried no token but the server requires one.
    #[error("Authentication token is missing")]
    MissingToken,

    /// The token is not in `<id>.<secret>` form.
    #[error("Authentication token is malformed")]
    MalformedToken,

    /// The token is unknown or was revoked.
    #[error("Authentication token is invalid or revoked")]
    InvalidToken,

    /// The first message on a new channel was not an auth control message.
    #[error("Expected authentication handshake, got {received}")]
    UnexpectedHandshake {
        /// Shape of the message that arrived instead
        received: String,
    },

    /// The server refused the handshake.
    #[error("Server rejected authentication: {reason}")]
    Rejected {
        /// Reason reported by the server
        reason: String,
    },
}

/// Which bounded operation timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Binding and starting the listener
    ServerStart,
    /// Graceful listener shutdown
    ServerStop,
    /// Waiting for a remote reply
    RpcReply,
    /// Client handshake (either side)
    Handshake,
    /// Reading an inbound request body
    BodyRead,
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TimeoutKind::ServerStart => "server start",
            TimeoutKind::ServerStop => "server stop",
            TimeoutKind::RpcReply => "rpc reply",
            TimeoutKind::Handshake => "handshake",
            TimeoutKind::BodyRead => "body read",
        };
        f.write_str(name)
    }
}

/// A bounded operation exceeded its limit.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Timed out waiting for {kind} after {elapsed:?}")]
pub struct TimeoutError {
    /// Operation that timed out
    pub kind: TimeoutKind,
    /// Time spent before giving up
    pub elapsed: Duration,
}

/// Failure to buffer an inbound request body.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BodyReadError {
    /// The sender stalled past the read timeout.
    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    /// The body exceeded the size limit.
    #[error("Request body exceeds {limit} bytes")]
    TooLarge {
        /// Configured limit in bytes
        limit: usize,
    },

    /// The body stream failed before completing.
    #[error("Request body stream failed: {details}")]
    Stream {
        /// Underlying error message
        details: String,
    },
}

/// Remote resolution failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// The channel closed before a reply arrived.
    #[error("Connection {connection_id} closed: {reason}")]
    ConnectionClosed {
        /// Owning connection
        connection_id: String,
        /// Why the channel closed
        reason: String,
    },

    /// The originating request was aborted.
    #[error("RPC {id} cancelled")]
    Cancelled {
        /// Correlation id
        id: u64,
    },

    /// The peer answered with a reply that does not decode.
    #[error("Malformed reply to RPC {id}: {details}")]
    MalformedReply {
        /// Correlation id
        id: u64,
        /// Decoder message
        details: String,
    },

    /// No reply within the per-request timeout.
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
}

/// Prefix ownership errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The prefix is owned by another active connection.
    #[error("Path prefix '{prefix}' is already owned by connection {owner}")]
    PrefixConflict {
        /// Contested prefix
        prefix: String,
        /// Current owner
        owner: String,
    },

    /// No active connection with this id.
    #[error("Unknown connection {connection_id}")]
    UnknownConnection {
        /// Requested id
        connection_id: String,
    },

    /// The server refused a prefix claimed after the handshake.
    #[error("Claim of '{prefix}' rejected: {reason}")]
    ClaimRejected {
        /// Requested prefix
        prefix: String,
        /// Reason reported by the server
        reason: String,
    },
}

/// Malformed wire traffic.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// The frame is not a valid protocol message.
    #[error("Malformed message: {details}")]
    Malformed {
        /// Decoder message
        details: String,
    },

    /// A field decoded but holds an unusable value.
    #[error("Invalid {field} in message: {details}")]
    InvalidField {
        /// Field name
        field: &'static str,
        /// Why it was rejected
        details: String,
    },
}
