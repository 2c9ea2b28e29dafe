//! Client side of remote interception.
//!
//! A [`RemoteClient`] holds one WebSocket to an interceptor server. Every
//! `rpc` frame it receives is resolved against a local
//! [`InterceptorContext`] on its own task, so a slow handler never delays
//! the others, and answered with a `reply` frame.

use super::connections::normalize_prefix;
use super::send_frame;
use super::wire::{ControlMessage, ReplyPayload, RequestPayload, WireMessage};
use crate::config::DEFAULT_CONNECT_PATH;
use crate::context::InterceptorContext;
use crate::error::{AuthError, ConnectionError, InterceptorError, Result, TimeoutKind, ValidationError};
use crate::timeout::bounded;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use url::Url;

type ClaimResult = std::result::Result<String, String>;

struct ClientInner {
    connection_id: String,
    context: InterceptorContext,
    outbound: mpsc::UnboundedSender<WireMessage>,
    // claim request id -> waiter
    claims: DashMap<u64, oneshot::Sender<ClaimResult>>,
    next_claim: AtomicU64,
    in_flight: DashMap<u64, CancellationToken>,
    shutdown: CancellationToken,
    request_timeout: Duration,
}

/// An authenticated connection to an [`InterceptorServer`](super::InterceptorServer).
pub struct RemoteClient {
    inner: Arc<ClientInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteClient")
            .field("connection_id", &self.inner.connection_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl RemoteClient {
    /// Connect, authenticate and claim `prefixes`.
    ///
    /// `server_url` may use `ws`, `wss`, `http` or `https`. `timeout` bounds
    /// the connect plus handshake, and later each [`claim`](Self::claim).
    ///
    /// # Errors
    ///
    /// - [`AuthError::Rejected`] when the server refuses the token or a prefix
    /// - [`InterceptorError::Timeout`] when the handshake is not answered in time
    /// - [`InterceptorError::WebSocket`] when the connection fails
    pub async fn connect(
        server_url: &str,
        token: Option<&str>,
        prefixes: Vec<String>,
        context: InterceptorContext,
        timeout: Duration,
    ) -> Result<Self> {
        let url = websocket_url(server_url)?;
        let (socket, _) = bounded(TimeoutKind::Handshake, timeout, connect_async(url.as_str())).await??;
        let (mut sink, mut stream) = socket.split();

        let auth: WireMessage = ControlMessage::Auth {
            token: token.map(str::to_string),
            prefixes,
        }
        .into();
        send_frame(&mut sink, &auth).await?;

        let answer = bounded(TimeoutKind::Handshake, timeout, stream.next()).await?;
        let connection_id = match answer {
            Some(Ok(Message::Text(text))) => match WireMessage::decode(text.as_str())? {
                WireMessage::Control(ControlMessage::AuthAccepted { connection_id }) => connection_id,
                WireMessage::Control(ControlMessage::AuthRejected { reason }) => {
                    return Err(AuthError::Rejected { reason }.into());
                }
                other => {
                    return Err(AuthError::UnexpectedHandshake {
                        received: other.kind().to_string(),
                    }
                    .into());
                }
            },
            Some(Ok(Message::Close(frame))) => {
                return Err(AuthError::Rejected {
                    reason: frame.map(|f| f.reason.as_str().to_string()).unwrap_or_else(|| "connection closed".to_string()),
                }
                .into());
            }
            Some(Ok(_)) => {
                return Err(AuthError::UnexpectedHandshake {
                    received: "non-text frame".to_string(),
                }
                .into());
            }
            Some(Err(err)) => return Err(err.into()),
            None => {
                return Err(AuthError::UnexpectedHandshake {
                    received: "end of stream".to_string(),
                }
                .into());
            }
        };
        info!(connection = %connection_id, server = %url, "Connected to interceptor server");

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ClientInner {
            connection_id: connection_id.clone(),
            context,
            outbound,
            claims: DashMap::new(),
            next_claim: AtomicU64::new(1),
            in_flight: DashMap::new(),
            shutdown: CancellationToken::new(),
            request_timeout: timeout,
        });
        let span = info_span!("remote_client", connection = %connection_id);

        let writer = {
            let shutdown = inner.shutdown.clone();
            tokio::spawn(
                async move {
                    loop {
                        tokio::select! {
                            message = outbound_rx.recv() => {
                                let Some(message) = message else { break };
                                if let Err(err) = send_frame(&mut sink, &message).await {
                                    debug!(error = %err, "Write to server failed");
                                    break;
                                }
                            }
                            _ = shutdown.cancelled() => break,
                        }
                    }
                    shutdown.cancel();
                    let _ = sink.close().await;
                }
                .instrument(span.clone()),
            )
        };

        let reader = {
            let inner = inner.clone();
            tokio::spawn(
                async move {
                    let reason = loop {
                        tokio::select! {
                            _ = inner.shutdown.cancelled() => break "closed locally",
                            frame = stream.next() => match frame {
                                Some(Ok(Message::Text(text))) => on_frame(&inner, text.as_str()),
                                Some(Ok(Message::Close(_))) | None => break "server closed the connection",
                                Some(Ok(_)) => {}
                                Some(Err(err)) => {
                                    debug!(error = %err, "Read from server failed");
                                    break "socket error";
                                }
                            },
                        }
                    };
                    inner.shutdown.cancel();
                    // dropping the senders fails every outstanding claim
                    inner.claims.clear();
                    info!(reason, "Disconnected from interceptor server");
                }
                .instrument(span),
            )
        };

        Ok(Self {
            inner,
            tasks: Mutex::new(vec![writer, reader]),
        })
    }

    /// Server-assigned connection id.
    pub fn connection_id(&self) -> &str {
        &self.inner.connection_id
    }

    /// Context requests are resolved against.
    pub fn context(&self) -> &InterceptorContext {
        &self.inner.context
    }

    /// Whether the connection has ended.
    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Claim another prefix. Returns the normalized prefix.
    ///
    /// # Errors
    ///
    /// - [`ValidationError::InvalidPrefix`] for a malformed prefix
    /// - [`ConnectionError::ClaimRejected`] when the server refuses it
    /// - [`InterceptorError::NotRunning`] when the connection is closed
    pub async fn claim(&self, prefix: &str) -> Result<String> {
        let prefix = normalize_prefix(prefix)?;
        if self.is_closed() {
            return Err(InterceptorError::NotRunning);
        }
        let request_id = self.inner.next_claim.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.claims.insert(request_id, tx);
        let claim = ControlMessage::Claim {
            prefix: prefix.clone(),
            request_id: Some(request_id),
        };
        if !self.notify(claim) {
            self.inner.claims.remove(&request_id);
            return Err(InterceptorError::NotRunning);
        }

        let answer = bounded(TimeoutKind::RpcReply, self.inner.request_timeout, rx).await;
        match answer {
            Ok(Ok(Ok(accepted))) => Ok(accepted),
            Ok(Ok(Err(reason))) => Err(ConnectionError::ClaimRejected { prefix, reason }.into()),
            Ok(Err(_)) => Err(InterceptorError::NotRunning),
            Err(timeout) => {
                self.inner.claims.remove(&request_id);
                Err(timeout.into())
            }
        }
    }

    /// Give a prefix back. The server does not acknowledge releases.
    ///
    /// # Errors
    ///
    /// [`InterceptorError::NotRunning`] when the connection is closed.
    pub fn release(&self, prefix: &str) -> Result<()> {
        let prefix = normalize_prefix(prefix)?;
        if self.notify(ControlMessage::Release { prefix }) {
            Ok(())
        } else {
            Err(InterceptorError::NotRunning)
        }
    }

    /// Close the connection and wait for its tasks. Idempotent.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    fn notify(&self, message: ControlMessage) -> bool {
        !self.is_closed() && self.inner.outbound.send(message.into()).is_ok()
    }
}

impl Drop for RemoteClient {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

fn websocket_url(raw: &str) -> std::result::Result<Url, ValidationError> {
    let invalid = |details: String| ValidationError::InvalidUrl {
        url: raw.to_string(),
        details,
    };
    let mut url = Url::parse(raw).map_err(|err| invalid(err.to_string()))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(invalid(format!("unsupported scheme '{other}'"))),
    };
    url.set_scheme(scheme)
        .map_err(|()| invalid("cannot change scheme".to_string()))?;
    if url.path().is_empty() || url.path() == "/" {
        url.set_path(DEFAULT_CONNECT_PATH);
    }
    Ok(url)
}

fn on_frame(inner: &Arc<ClientInner>, text: &str) {
    let message = match WireMessage::decode(text) {
        Ok(message) => message,
        Err(err) => {
            warn!(error = %err, "Ignoring malformed frame from server");
            return;
        }
    };
    match message {
        WireMessage::Rpc { id, payload } => spawn_rpc(inner.clone(), id, payload),
        WireMessage::Control(ControlMessage::Cancel { id }) => {
            if let Some((_, token)) = inner.in_flight.remove(&id) {
                debug!(rpc = id, "Server cancelled request");
                token.cancel();
            }
        }
        WireMessage::Control(ControlMessage::ClaimAccepted { prefix, request_id }) => {
            if let Some((_, waiter)) = request_id.and_then(|id| inner.claims.remove(&id)) {
                let _ = waiter.send(Ok(prefix));
            }
        }
        WireMessage::Control(ControlMessage::ClaimRejected {
            prefix,
            reason,
            request_id,
        }) => {
            if let Some((_, waiter)) = request_id.and_then(|id| inner.claims.remove(&id)) {
                let _ = waiter.send(Err(reason));
            }
        }
        other => debug!(kind = other.kind(), "Ignoring unexpected frame from server"),
    }
}

fn spawn_rpc(inner: Arc<ClientInner>, id: u64, payload: RequestPayload) {
    let cancel = inner.shutdown.child_token();
    inner.in_flight.insert(id, cancel.clone());
    tokio::spawn(
        async move {
            let reply = tokio::select! {
                reply = resolve(&inner.context, payload) => reply,
                _ = cancel.cancelled() => return,
            };
            inner.in_flight.remove(&id);
            if inner.outbound.send(WireMessage::Reply { id, payload: reply }).is_err() {
                debug!(rpc = id, "Connection closed before reply could be sent");
            }
        }
        .in_current_span(),
    );
}

async fn resolve(context: &InterceptorContext, payload: RequestPayload) -> ReplyPayload {
    let request = match payload.into_request() {
        Ok(request) => request,
        Err(err) => {
            return ReplyPayload::Reject {
                reason: err.to_string(),
            };
        }
    };
    debug!(method = %request.method, url = %request.url, "Resolving remote request");
    match context.dispatch(&request).await {
        Ok(decision) => ReplyPayload::from_decision(&decision),
        Err(err) => ReplyPayload::Reject {
            reason: err.to_string(),
        },
    }
}
