//! Local interception gateway.
//!
//! A gateway binds a base URL to a [`HandlerRegistry`] and owns the policy for
//! requests no handler answers. It turns the registry's "response or
//! unhandled" into a [`Decision`], and can act on that decision itself through
//! a [`Passthrough`] capability.
//!
//! The physical interception of outgoing calls is not done here: whatever
//! captures a request (a test HTTP client wrapper, the remote client) hands it
//! to [`InterceptionGateway::decide`] or [`InterceptionGateway::handle`].

use crate::decision::Decision;
use crate::error::{InterceptorError, Result, ValidationError};
use crate::handler::HandlerRegistry;
use crate::message::{InterceptedRequest, MockResponse};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};
use url::Url;

// ============================================================================
// Unhandled-request policy
// ============================================================================

/// What happens to a request no handler matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnhandledAction {
    /// Forward it to the real network.
    #[default]
    Bypass,
    /// Fail it synthetically.
    Reject,
}

impl fmt::Display for UnhandledAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnhandledAction::Bypass => f.write_str("bypass"),
            UnhandledAction::Reject => f.write_str("reject"),
        }
    }
}

/// Unhandled-request policy: an action plus whether to log the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnhandledPolicy {
    /// Bypass or reject
    pub action: UnhandledAction,
    /// Emit a warning for every unhandled request
    pub log: bool,
}

impl Default for UnhandledPolicy {
    fn default() -> Self {
        Self::log_only()
    }
}

impl UnhandledPolicy {
    /// Log the request and let it through.
    pub fn log_only() -> Self {
        Self {
            action: UnhandledAction::Bypass,
            log: true,
        }
    }

    /// Log the request and fail it.
    pub fn log_and_reject() -> Self {
        Self {
            action: UnhandledAction::Reject,
            log: true,
        }
    }

    /// Let the request through silently.
    pub fn passthrough() -> Self {
        Self {
            action: UnhandledAction::Bypass,
            log: false,
        }
    }
}

// ============================================================================
// Passthrough capability
// ============================================================================

/// Sends a request to the real network.
#[async_trait]
pub trait Passthrough: Send + Sync {
    /// Perform `request` and buffer the real response.
    async fn forward(&self, request: &InterceptedRequest) -> Result<MockResponse>;
}

/// [`Passthrough`] backed by a `reqwest` client.
///
/// With a target set, the request's scheme, host and port are replaced by the
/// target's and the target path is prepended; otherwise the request goes to
/// its own URL.
#[derive(Debug, Clone)]
pub struct ReqwestPassthrough {
    client: reqwest::Client,
    target: Option<Url>,
}

impl Default for ReqwestPassthrough {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl ReqwestPassthrough {
    /// Forward to each request's own URL.
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            target: None,
        }
    }

    /// Forward every request to `target`.
    pub fn with_target(client: reqwest::Client, target: Url) -> Self {
        Self {
            client,
            target: Some(target),
        }
    }

    /// URL a request is sent to.
    pub fn destination(&self, request: &InterceptedRequest) -> Url {
        let Some(target) = &self.target else {
            return request.url.clone();
        };
        let mut url = target.clone();
        let base = target.path().trim_end_matches('/');
        url.set_path(&format!("{base}{}", request.url.path()));
        url.set_query(request.url.query());
        url
    }
}

#[async_trait]
impl Passthrough for ReqwestPassthrough {
    async fn forward(&self, request: &InterceptedRequest) -> Result<MockResponse> {
        let destination = self.destination(request);
        debug!(method = %request.method, url = %destination, "Forwarding request");

        let response = self
            .client
            .request(request.method.clone(), destination)
            .headers(strip_hop_headers(&request.headers, true))
            .body(request.body.clone())
            .send()
            .await?;

        let status = response.status();
        let headers = strip_hop_headers(response.headers(), false);
        let body = response.bytes().await?;
        Ok(MockResponse {
            status,
            headers,
            body,
        })
    }
}

/// Drop headers that describe one hop rather than the message.
fn strip_hop_headers(headers: &HeaderMap, outbound: bool) -> HeaderMap {
    let hop: [HeaderName; 4] = [
        CONNECTION,
        TRANSFER_ENCODING,
        CONTENT_LENGTH,
        HeaderName::from_static("keep-alive"),
    ];
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if hop.contains(name) || (outbound && name == HOST) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

// ============================================================================
// Gateway
// ============================================================================

/// Binds a base URL to a handler registry.
pub struct InterceptionGateway {
    base_url: Url,
    registry: HandlerRegistry,
    policy: ArcSwap<UnhandledPolicy>,
    passthrough: Arc<dyn Passthrough>,
    running: AtomicBool,
}

impl fmt::Debug for InterceptionGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptionGateway")
            .field("base_url", &self.base_url.as_str())
            .field("policy", &**self.policy.load())
            .field("running", &self.is_running())
            .finish()
    }
}

impl InterceptionGateway {
    /// Create a stopped gateway for `base_url`.
    ///
    /// # Errors
    ///
    /// [`ValidationError::InvalidUrl`] when `base_url` is not an absolute URL.
    pub fn new(base_url: &str, registry: HandlerRegistry) -> std::result::Result<Self, ValidationError> {
        let base_url = Url::parse(base_url).map_err(|err| ValidationError::InvalidUrl {
            url: base_url.to_string(),
            details: err.to_string(),
        })?;
        if base_url.cannot_be_a_base() {
            return Err(ValidationError::InvalidUrl {
                url: base_url.to_string(),
                details: "not a hierarchical URL".to_string(),
            });
        }
        Ok(Self {
            base_url,
            registry,
            policy: ArcSwap::from_pointee(UnhandledPolicy::default()),
            passthrough: Arc::new(ReqwestPassthrough::default()),
            running: AtomicBool::new(false),
        })
    }

    /// Set the initial unhandled-request policy.
    #[must_use]
    pub fn with_unhandled_policy(self, policy: UnhandledPolicy) -> Self {
        self.policy.store(Arc::new(policy));
        self
    }

    /// Replace the network capability used for bypassed requests.
    #[must_use]
    pub fn with_passthrough(mut self, passthrough: Arc<dyn Passthrough>) -> Self {
        self.passthrough = passthrough;
        self
    }

    /// Start intercepting. Returns `false` if already running.
    pub fn start(&self) -> bool {
        let started = !self.running.swap(true, Ordering::AcqRel);
        if started {
            info!(base_url = %self.base_url, "Interception started");
        }
        started
    }

    /// Stop intercepting. Returns `false` if already stopped.
    pub fn stop(&self) -> bool {
        let stopped = self.running.swap(false, Ordering::AcqRel);
        if stopped {
            info!(base_url = %self.base_url, "Interception stopped");
        }
        stopped
    }

    /// Whether the gateway is intercepting.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Base URL this gateway intercepts.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// The bound registry.
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Current unhandled-request policy.
    pub fn unhandled_policy(&self) -> UnhandledPolicy {
        **self.policy.load()
    }

    /// Swap the unhandled-request policy; takes effect for the next request.
    pub fn set_unhandled_policy(&self, policy: UnhandledPolicy) {
        debug!(action = %policy.action, log = policy.log, "Unhandled policy updated");
        self.policy.store(Arc::new(policy));
    }

    /// Path of `url` relative to the base URL, or `None` when `url` is outside it.
    ///
    /// Origins must be equal and the base path must be a whole-segment prefix.
    pub fn relative_path(&self, url: &Url) -> Option<String> {
        let base = &self.base_url;
        if url.scheme() != base.scheme()
            || url.host_str() != base.host_str()
            || url.port_or_known_default() != base.port_or_known_default()
        {
            return None;
        }
        let base_path = base.path().trim_end_matches('/');
        let rest = url.path().strip_prefix(base_path)?;
        if rest.is_empty() {
            Some("/".to_string())
        } else if rest.starts_with('/') {
            Some(rest.to_string())
        } else {
            None
        }
    }

    /// Length of the base path, used to prefer more specific gateways.
    pub(crate) fn specificity(&self) -> usize {
        self.base_url.path().trim_end_matches('/').len()
    }

    /// Decide what happens to `request`.
    ///
    /// # Errors
    ///
    /// [`InterceptorError::NotRunning`] when the gateway is stopped.
    pub async fn decide(&self, request: &InterceptedRequest) -> Result<Decision> {
        if !self.is_running() {
            return Err(InterceptorError::NotRunning);
        }
        let Some(path) = self.relative_path(&request.url) else {
            debug!(url = %request.url, "Request outside base URL, not intercepted");
            return Ok(Decision::Bypass);
        };

        if let Some(response) = self.registry.match_request(request, &path).await {
            return Ok(Decision::Respond(response));
        }

        let policy = self.unhandled_policy();
        if policy.log {
            warn!(
                method = %request.method,
                url = %request.url,
                action = %policy.action,
                "Unhandled request"
            );
        }
        Ok(match policy.action {
            UnhandledAction::Bypass => Decision::Bypass,
            UnhandledAction::Reject => Decision::Reject {
                reason: format!("No handler matched {} {}", request.method, request.url),
            },
        })
    }

    /// Decide and act: answer, forward, or fail.
    ///
    /// # Errors
    ///
    /// [`InterceptorError::UnhandledRequest`] for rejected requests, or the
    /// passthrough's error for bypassed ones.
    pub async fn handle(&self, request: &InterceptedRequest) -> Result<MockResponse> {
        match self.decide(request).await? {
            Decision::Respond(response) => Ok(response),
            Decision::Bypass => self.passthrough.forward(request).await,
            Decision::Reject { .. } => Err(InterceptorError::UnhandledRequest {
                method: request.method.to_string(),
                url: request.url.to_string(),
            }),
        }
    }
}
