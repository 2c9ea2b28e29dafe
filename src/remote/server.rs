//! The remote interception server.
//!
//! One listener serves two kinds of traffic:
//!
//! - WebSocket upgrades on the connect path (`/_stubgate/connect` by
//!   default) are client connections. The first frame must be `auth`; after
//!   that the socket carries `rpc`/`reply` and `control` frames.
//! - Everything else, upgrades on other paths included, is interceptable. CORS preflights are answered
//!   directly; other requests are routed by path prefix to the owning client
//!   and answered with its decision, or handed to the fallback policy.
//!
//! A failed, slow or malformed client never takes the server down: every
//! outcome maps to a fixed status (504 on RPC timeout, 502 on a malformed
//! reply or a closed connection).

use super::connections::{ClientConnection, ConnectionInfo, ConnectionManager};
use super::rpc::RpcChannel;
use super::send_frame;
use super::tokens::TokenStore;
use super::wire::{ControlMessage, ReplyPayload, RequestPayload, WireMessage};
use crate::config::{CorsConfig, FallbackPolicy, ServerConfig};
use crate::error::{AuthError, BodyReadError, InterceptorError, Result, RpcError, TimeoutKind};
use crate::gateway::{Passthrough, ReqwestPassthrough};
use crate::logging::redact_headers;
use crate::message::{InterceptedRequest, MockResponse};
use crate::timeout::{bounded, collect_body};
use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::Response;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE, ACCESS_CONTROL_REQUEST_HEADERS,
    ACCESS_CONTROL_REQUEST_METHOD, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, ORIGIN,
    SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, TRANSFER_ENCODING, UPGRADE, VARY,
};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use hyper_util::rt::TokioIo;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

/// Listen backlog for the interceptor socket.
const LISTEN_BACKLOG: i32 = 1024;

// ============================================================================
// Request state machine
// ============================================================================

/// Where an inbound HTTP request is in its handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Accepted by the listener
    Received,
    /// Answered as a CORS preflight (terminal)
    PreflightAnswered,
    /// Looking up the owning client
    Routing,
    /// Serialized and handed to the client's channel
    Forwarded,
    /// Waiting for the client's reply
    AwaitingReply,
    /// Answered with the client's response or reject (terminal)
    Responded,
    /// No client owns the path
    NoRoute,
    /// Answered by the fallback policy (terminal)
    Fallback,
    /// Answered with a server error (terminal)
    Error,
}

impl RequestState {
    /// Returns `true` for states that end handling.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::PreflightAnswered
                | RequestState::Responded
                | RequestState::Fallback
                | RequestState::Error
        )
    }

    /// Whether `next` is a legal successor.
    pub fn can_advance_to(self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (Received, PreflightAnswered | Routing | Error)
                | (Routing, Forwarded | NoRoute | Error)
                | (Forwarded, AwaitingReply | Error)
                | (AwaitingReply, Responded | Fallback | Error)
                | (NoRoute, Fallback | Error)
        )
    }
}

struct RequestTrace {
    state: RequestState,
    started: Instant,
}

impl RequestTrace {
    fn new() -> Self {
        Self {
            state: RequestState::Received,
            started: Instant::now(),
        }
    }

    fn advance(&mut self, next: RequestState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {:?} -> {next:?}",
            self.state
        );
        trace!(from = ?self.state, to = ?next, "Request state");
        self.state = next;
    }
}

// ============================================================================
// Server
// ============================================================================

enum Fallback {
    Status(StatusCode),
    Forward(ReqwestPassthrough),
}

struct ServerState {
    config: Arc<ServerConfig>,
    manager: ConnectionManager,
    fallback: Fallback,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

struct Running {
    state: Arc<ServerState>,
    task: JoinHandle<std::io::Result<()>>,
}

/// HTTP + WebSocket interception server.
pub struct InterceptorServer {
    config: Arc<ServerConfig>,
    tokens: TokenStore,
    running: Mutex<Option<Running>>,
}

impl InterceptorServer {
    /// Stopped server.
    pub fn new(config: ServerConfig, tokens: TokenStore) -> Self {
        Self {
            config: Arc::new(config),
            tokens,
            running: Mutex::new(None),
        }
    }

    /// Server settings.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind and start serving. Returns the bound address.
    ///
    /// Idempotent: a running server returns its current address.
    ///
    /// # Errors
    ///
    /// [`InterceptorError::Timeout`] if binding exceeds `start_timeout`,
    /// [`InterceptorError::Io`] if the address cannot be bound.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            return Ok(current.state.local_addr);
        }

        let address = self.config.bind_address();
        let listener = bounded(
            TimeoutKind::ServerStart,
            self.config.start_timeout,
            bind_listener(&address),
        )
        .await??;
        let local_addr = listener.local_addr()?;

        let fallback = match &self.config.fallback {
            FallbackPolicy::NotIntercepted { status } => Fallback::Status(*status),
            FallbackPolicy::Forward { target } => {
                Fallback::Forward(ReqwestPassthrough::with_target(reqwest::Client::new(), target.clone()))
            }
        };
        let state = Arc::new(ServerState {
            config: self.config.clone(),
            manager: ConnectionManager::new(self.tokens.clone()),
            fallback,
            local_addr,
            shutdown: CancellationToken::new(),
        });

        let app = Router::new().fallback(handle).with_state(state.clone());
        let shutdown = state.shutdown.clone();
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
        });

        info!(
            addr = %local_addr,
            token_checks = self.tokens.is_enabled(),
            "Interceptor server listening"
        );
        *running = Some(Running { state, task });
        Ok(local_addr)
    }

    /// Stop serving: disconnect clients, then shut the listener down gracefully.
    ///
    /// Idempotent: stopping a stopped server succeeds.
    ///
    /// # Errors
    ///
    /// [`InterceptorError::Timeout`] if shutdown exceeds `stop_timeout`; the
    /// serving task is aborted in that case.
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        let Some(Running { state, mut task }) = running.take() else {
            return Ok(());
        };

        state.shutdown.cancel();
        state.manager.detach_all("server stopping").await;

        match bounded(TimeoutKind::ServerStop, self.config.stop_timeout, &mut task).await {
            Ok(Ok(Ok(()))) => {
                info!(addr = %state.local_addr, "Interceptor server stopped");
                Ok(())
            }
            Ok(Ok(Err(err))) => Err(err.into()),
            Ok(Err(join_err)) => Err(std::io::Error::other(join_err).into()),
            Err(timeout) => {
                task.abort();
                warn!(elapsed = ?timeout.elapsed, "Interceptor server did not stop in time");
                Err(timeout.into())
            }
        }
    }

    /// Whether the listener is up.
    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Bound address while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.state.local_addr)
    }

    /// Snapshot of connected clients.
    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        let state = self.running.lock().await.as_ref().map(|r| r.state.clone());
        match state {
            Some(state) => state.manager.connections().await,
            None => Vec::new(),
        }
    }
}

async fn bind_listener(address: &str) -> std::io::Result<TcpListener> {
    let addr = tokio::net::lookup_host(address).await?.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("{address} did not resolve"),
        )
    })?;
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

async fn handle(State(state): State<Arc<ServerState>>, request: Request) -> Response {
    if request.uri().path() == state.config.connect_path && is_websocket_upgrade(request.headers()) {
        return accept_client(state, request);
    }
    let span = info_span!("request", method = %request.method(), path = %request.uri().path());
    intercept(state, request).instrument(span).await
}

// ============================================================================
// Interceptable traffic
// ============================================================================

async fn intercept(state: Arc<ServerState>, request: Request) -> Response {
    let mut trace = RequestTrace::new();

    if is_preflight(&request) {
        trace.advance(RequestState::PreflightAnswered);
        debug!("Answering CORS preflight");
        return preflight_response(&state.config.cors, request.headers());
    }

    let origin = request.headers().get(ORIGIN).cloned();
    let (parts, body) = request.into_parts();
    let body = match collect_body(body, state.config.body_limits).await {
        Ok(body) => body,
        Err(err) => {
            trace.advance(RequestState::Error);
            let status = body_error_status(&err);
            warn!(status = status.as_u16(), error = ?err, "Failed to read request body");
            return error_response(status, "request body could not be read");
        }
    };
    let request = match InterceptedRequest::from_parts(&parts, body, &state.local_addr.to_string()) {
        Ok(request) => request,
        Err(err) => {
            trace.advance(RequestState::Error);
            return error_response(StatusCode::BAD_REQUEST, &err.to_string());
        }
    };
    debug!(headers = ?redact_headers(&request.headers), "Request received");

    trace.advance(RequestState::Routing);
    let path = request.path().to_string();
    let mut response = match state.manager.route(&path).await {
        Some((connection, prefix)) => {
            trace.advance(RequestState::Forwarded);
            debug!(connection = %connection.id(), prefix = %prefix, "Routing to client");
            forward_to_client(&state, &connection, &request, &mut trace).await
        }
        None => {
            trace.advance(RequestState::NoRoute);
            if state.config.log_unhandled {
                warn!("No client owns this path, applying fallback");
            }
            trace.advance(RequestState::Fallback);
            fallback(&state, &request).await
        }
    };

    if state.config.cors_on_responses {
        add_cors_origin(response.headers_mut(), &state.config.cors, origin.as_ref());
    }
    info!(
        status = response.status().as_u16(),
        state = ?trace.state,
        elapsed_ms = trace.started.elapsed().as_millis() as u64,
        "Request completed"
    );
    response
}

async fn forward_to_client(
    state: &Arc<ServerState>,
    connection: &ClientConnection,
    request: &InterceptedRequest,
    trace: &mut RequestTrace,
) -> Response {
    // Aborting the inbound request drops this future and the guard with it,
    // which cancels the waiting task and sends `cancel` to the client.
    let cancel = state.shutdown.child_token();
    let abort_on_drop = cancel.clone().drop_guard();
    let channel: Arc<RpcChannel> = connection.channel().clone();
    let payload = RequestPayload::from_request(request);
    let timeout = state.config.rpc_timeout;

    trace.advance(RequestState::AwaitingReply);
    let waiter = tokio::spawn(
        async move { channel.send_and_wait(payload, timeout, &cancel).await }.in_current_span(),
    );
    let reply = match waiter.await {
        Ok(reply) => reply,
        Err(err) => {
            error!(error = %err, "RPC task failed");
            Err(RpcError::ConnectionClosed {
                connection_id: connection.id().to_string(),
                reason: "rpc task failed".to_string(),
            })
        }
    };
    let _ = abort_on_drop.disarm();

    match reply {
        Ok(ReplyPayload::Respond { response }) => match response.into_response() {
            Ok(response) => {
                trace.advance(RequestState::Responded);
                into_axum(response)
            }
            Err(err) => {
                trace.advance(RequestState::Error);
                warn!(error = %err, "Client sent an unusable response");
                error_response(StatusCode::BAD_GATEWAY, &format!("malformed reply: {err}"))
            }
        },
        Ok(ReplyPayload::Bypass) => {
            trace.advance(RequestState::Fallback);
            fallback(state, request).await
        }
        Ok(ReplyPayload::Reject { reason }) => {
            trace.advance(RequestState::Responded);
            debug!(reason = %reason, "Client rejected request");
            error_response(state.config.reject_status, &reason)
        }
        Err(err) => {
            trace.advance(RequestState::Error);
            let status = match &err {
                RpcError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                RpcError::Cancelled { .. } => StatusCode::SERVICE_UNAVAILABLE,
                RpcError::MalformedReply { .. } | RpcError::ConnectionClosed { .. } => StatusCode::BAD_GATEWAY,
            };
            warn!(status = status.as_u16(), error = %err, "Remote resolution failed");
            error_response(status, &err.to_string())
        }
    }
}

async fn fallback(state: &ServerState, request: &InterceptedRequest) -> Response {
    match &state.fallback {
        Fallback::Status(status) => error_response(*status, "request not intercepted"),
        Fallback::Forward(passthrough) => match passthrough.forward(request).await {
            Ok(response) => into_axum(response),
            Err(err) => {
                warn!(error = %err, "Fallback forward failed");
                error_response(StatusCode::BAD_GATEWAY, "fallback target unreachable")
            }
        },
    }
}

fn into_axum(response: MockResponse) -> Response {
    let mut response = response.into_http().map(Body::from);
    // the body is re-framed by the server
    response.headers_mut().remove(CONTENT_LENGTH);
    response.headers_mut().remove(TRANSFER_ENCODING);
    response
}

fn body_error_status(err: &BodyReadError) -> StatusCode {
    match err {
        BodyReadError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
        BodyReadError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        BodyReadError::Stream { .. } => StatusCode::BAD_REQUEST,
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    let mut response = Response::new(Body::from(message.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

// ============================================================================
// CORS
// ============================================================================

fn is_preflight(request: &Request) -> bool {
    request.method() == Method::OPTIONS && request.headers().contains_key(ACCESS_CONTROL_REQUEST_METHOD)
}

fn preflight_response(cors: &CorsConfig, request_headers: &HeaderMap) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = cors.status;
    let headers = response.headers_mut();

    add_cors_origin(headers, cors, request_headers.get(ORIGIN));
    insert_header(headers, ACCESS_CONTROL_ALLOW_METHODS, &cors.allow_methods);
    match &cors.allow_headers {
        Some(allowed) => insert_header(headers, ACCESS_CONTROL_ALLOW_HEADERS, allowed),
        None => {
            let requested = request_headers
                .get(ACCESS_CONTROL_REQUEST_HEADERS)
                .cloned()
                .unwrap_or(HeaderValue::from_static("*"));
            headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, requested);
        }
    }
    if let Some(max_age) = cors.max_age {
        headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from(max_age.as_secs()));
    }
    headers.insert(
        VARY,
        HeaderValue::from_static("Origin, Access-Control-Request-Method, Access-Control-Request-Headers"),
    );
    response
}

fn add_cors_origin(headers: &mut HeaderMap, cors: &CorsConfig, origin: Option<&HeaderValue>) {
    if headers.contains_key(ACCESS_CONTROL_ALLOW_ORIGIN) {
        return;
    }
    match (&cors.allow_origin, origin) {
        (Some(allowed), _) => insert_header(headers, ACCESS_CONTROL_ALLOW_ORIGIN, allowed),
        (None, Some(origin)) => {
            headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
        }
        (None, None) => {
            headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        }
    }
    if cors.allow_credentials && !headers.contains_key(ACCESS_CONTROL_ALLOW_CREDENTIALS) {
        headers.insert(ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
    }
}

fn insert_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => warn!(header = %name, "Skipping invalid configured header value"),
    }
}

// ============================================================================
// Client connections
// ============================================================================

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let upgrade = headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    let connection = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    upgrade && connection
}

fn accept_client(state: Arc<ServerState>, mut request: Request) -> Response {
    let Some(key) = request.headers().get(SEC_WEBSOCKET_KEY) else {
        return error_response(StatusCode::BAD_REQUEST, "missing sec-websocket-key");
    };
    let Ok(accept) = HeaderValue::from_str(&derive_accept_key(key.as_bytes())) else {
        return error_response(StatusCode::BAD_REQUEST, "invalid sec-websocket-key");
    };

    let on_upgrade = hyper::upgrade::on(&mut request);
    let span = info_span!("client", connection = tracing::field::Empty);
    tokio::spawn(
        async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let socket =
                        WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
                    serve_client(state, socket).await;
                }
                Err(err) => warn!(error = %err, "WebSocket upgrade failed"),
            }
        }
        .instrument(span),
    );

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(SEC_WEBSOCKET_ACCEPT, accept);
    response
}

type ClientSink<S> = SplitSink<WebSocketStream<S>, Message>;
type ClientStream<S> = SplitStream<WebSocketStream<S>>;

async fn serve_client<S>(state: Arc<ServerState>, socket: WebSocketStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = socket.split();

    let (token, prefixes) = match read_auth(&state, &mut stream).await {
        Ok(auth) => auth,
        Err(err) => return refuse(&mut sink, &err).await,
    };
    let record = match state.manager.authenticate(token.as_deref()) {
        Ok(record) => record,
        Err(err) => return refuse(&mut sink, &InterceptorError::from(err)).await,
    };

    let connection_id = uuid::Uuid::new_v4().to_string();
    tracing::Span::current().record("connection", connection_id.as_str());
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel();
    let channel = Arc::new(RpcChannel::new(connection_id.clone(), outbound));
    let connection = Arc::new(ClientConnection::new(connection_id.clone(), record, channel.clone()));
    if let Err(err) = state.manager.attach(connection, &prefixes).await {
        return refuse(&mut sink, &err).await;
    }

    let accepted: WireMessage = ControlMessage::AuthAccepted {
        connection_id: connection_id.clone(),
    }
    .into();
    if let Err(err) = send_frame(&mut sink, &accepted).await {
        debug!(error = %err, "Client left during handshake");
        state.manager.detach(&connection_id, "handshake write failed").await;
        return;
    }

    let closing = CancellationToken::new();
    let writer = {
        let closing = closing.clone();
        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        message = outbound_rx.recv() => {
                            let Some(message) = message else { break };
                            if let Err(err) = send_frame(&mut sink, &message).await {
                                debug!(error = %err, "Client write failed");
                                break;
                            }
                        }
                        _ = closing.cancelled() => break,
                    }
                }
                // wakes the reader when the writer stops on its own
                closing.cancel();
                let _ = sink.close().await;
            }
            .in_current_span(),
        )
    };

    let reason = loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break "server stopping",
            _ = closing.cancelled() => break "client write failed",
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_frame(&state, &channel, &connection_id, text.as_str()).await,
                Some(Ok(Message::Close(_))) | None => break "client disconnected",
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(error = %err, "Client socket error");
                    break "socket error";
                }
            },
        }
    };

    state.manager.detach(&connection_id, reason).await;
    closing.cancel();
    let _ = writer.await;
}

async fn read_auth<S>(
    state: &ServerState,
    stream: &mut ClientStream<S>,
) -> Result<(Option<String>, Vec<String>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = bounded(TimeoutKind::Handshake, state.config.handshake_timeout, stream.next()).await?;
    let text = match frame {
        Some(Ok(Message::Text(text))) => text,
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
    match WireMessage::decode(text.as_str()) {
        Ok(WireMessage::Control(ControlMessage::Auth { token, prefixes })) => Ok((token, prefixes)),
        Ok(other) => Err(AuthError::UnexpectedHandshake {
            received: other.kind().to_string(),
        }
        .into()),
        Err(err) => Err(AuthError::UnexpectedHandshake {
            received: err.to_string(),
        }
        .into()),
    }
}

async fn refuse<S>(sink: &mut ClientSink<S>, err: &InterceptorError)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    warn!(error = %err, "Refusing client");
    let rejected: WireMessage = ControlMessage::AuthRejected {
        reason: err.to_string(),
    }
    .into();
    let _ = send_frame(sink, &rejected).await;
    let _ = sink.close().await;
}

async fn handle_frame(state: &ServerState, channel: &RpcChannel, connection_id: &str, text: &str) {
    let message = match WireMessage::decode(text) {
        Ok(message) => message,
        Err(err) => {
            // a reply we cannot decode still fails its RPC if the id is readable
            if let Some(id) = reply_id(text) {
                channel.reject(
                    id,
                    RpcError::MalformedReply {
                        id,
                        details: err.to_string(),
                    },
                );
            }
            warn!(error = %err, "Ignoring malformed frame");
            return;
        }
    };

    match message {
        WireMessage::Reply { id, payload } => {
            channel.resolve(id, payload);
        }
        WireMessage::Control(ControlMessage::Claim { prefix, request_id }) => {
            let answer = match state.manager.claim(connection_id, &prefix).await {
                Ok(prefix) => ControlMessage::ClaimAccepted { prefix, request_id },
                Err(err) => ControlMessage::ClaimRejected {
                    prefix,
                    reason: err.to_string(),
                    request_id,
                },
            };
            channel.notify(answer.into());
        }
        WireMessage::Control(ControlMessage::Release { prefix }) => {
            state.manager.release(connection_id, &prefix).await;
        }
        other => debug!(kind = other.kind(), "Ignoring unexpected frame"),
    }
}

fn reply_id(text: &str) -> Option<u64> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    if value.get("type")?.as_str()? != "reply" {
        return None;
    }
    value.get("id")?.as_u64()
}
