//! Interceptor server configuration.
//!
//! Every field has a default; the binary overrides them from flags and
//! `STUBGATE_*` environment variables.

use crate::timeout::BodyLimits;
use http::StatusCode;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Directory holding per-project stubgate state.
pub const CONFIG_DIR: &str = ".stubgate";

/// Token file name inside [`CONFIG_DIR`].
pub const TOKEN_FILE: &str = "tokens";

/// Default listener port.
pub const DEFAULT_PORT: u16 = 7070;

/// Path clients upgrade on. Upgrades anywhere else are ordinary traffic.
pub const DEFAULT_CONNECT_PATH: &str = "/_stubgate/connect";

/// `<project_root>/.stubgate/tokens`.
pub fn default_token_path(project_root: &Path) -> PathBuf {
    project_root.join(CONFIG_DIR).join(TOKEN_FILE)
}

/// Headers sent in answer to CORS preflights.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorsConfig {
    /// `Access-Control-Allow-Origin`; `None` echoes the request `Origin` (or `*` without one)
    pub allow_origin: Option<String>,
    /// `Access-Control-Allow-Methods`
    pub allow_methods: String,
    /// `Access-Control-Allow-Headers`; `None` echoes the requested headers (or `*`)
    pub allow_headers: Option<String>,
    /// Send `Access-Control-Allow-Credentials: true`
    pub allow_credentials: bool,
    /// `Access-Control-Max-Age`
    pub max_age: Option<Duration>,
    /// Status of the preflight answer
    pub status: StatusCode,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allow_origin: None,
            allow_methods: "GET, POST, PUT, PATCH, DELETE, HEAD, OPTIONS".to_string(),
            allow_headers: None,
            allow_credentials: true,
            max_age: Some(Duration::from_secs(86_400)),
            status: StatusCode::NO_CONTENT,
        }
    }
}

/// What the server does with requests no client handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackPolicy {
    /// Answer with a fixed status and an explanatory body.
    NotIntercepted {
        /// Status to answer with
        status: StatusCode,
    },
    /// Forward to a real upstream.
    Forward {
        /// Upstream origin (and optional base path)
        target: Url,
    },
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        FallbackPolicy::NotIntercepted {
            status: StatusCode::NOT_FOUND,
        }
    }
}

/// Interceptor server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface to bind
    pub hostname: String,
    /// Port to bind; `0` picks a free one
    pub port: u16,
    /// Path on which WebSocket upgrades are client connections
    pub connect_path: String,
    /// Token file; `None` accepts every client
    pub token_file: Option<PathBuf>,
    /// Warn about requests that fall back
    pub log_unhandled: bool,
    /// Time a client has to answer one request
    pub rpc_timeout: Duration,
    /// Bound on binding the listener
    pub start_timeout: Duration,
    /// Bound on graceful shutdown
    pub stop_timeout: Duration,
    /// Time a client has to send its `auth` frame
    pub handshake_timeout: Duration,
    /// Preflight answer
    pub cors: CorsConfig,
    /// Add `Access-Control-Allow-Origin` to intercepted responses lacking it
    pub cors_on_responses: bool,
    /// Unrouted and bypassed requests
    pub fallback: FallbackPolicy,
    /// Status for requests a client rejected
    pub reject_status: StatusCode,
    /// Request body limits
    pub body_limits: BodyLimits,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            connect_path: DEFAULT_CONNECT_PATH.to_string(),
            token_file: None,
            log_unhandled: true,
            rpc_timeout: Duration::from_secs(10),
            start_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            cors: CorsConfig::default(),
            cors_on_responses: true,
            fallback: FallbackPolicy::default(),
            reject_status: StatusCode::INTERNAL_SERVER_ERROR,
            body_limits: BodyLimits::default(),
        }
    }
}

impl ServerConfig {
    /// `hostname:port`.
    pub fn bind_address(&self) -> String {
        if self.hostname.contains(':') && !self.hostname.starts_with('[') {
            format!("[{}]:{}", self.hostname, self.port)
        } else {
            format!("{}:{}", self.hostname, self.port)
        }
    }
}
