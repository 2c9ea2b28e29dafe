//! End-to-end tests: a real interceptor server on an ephemeral port, real
//! WebSocket clients, and plain HTTP requests through reqwest.

use futures_util::{SinkExt, StreamExt};
use http::StatusCode;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use stubgate::config::{DEFAULT_CONNECT_PATH, ServerConfig};
use stubgate::context::InterceptorContext;
use stubgate::error::{AuthError, ConnectionError, InterceptorError};
use stubgate::gateway::{InterceptionGateway, UnhandledPolicy};
use stubgate::handler::{HandlerDeclaration, HandlerRegistry};
use stubgate::message::MockResponse;
use stubgate::remote::{ControlMessage, InterceptorServer, RemoteClient, TokenStore, WireMessage};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

async fn start_server(config: ServerConfig, tokens: TokenStore) -> (InterceptorServer, SocketAddr) {
    let server = InterceptorServer::new(
        ServerConfig {
            hostname: "127.0.0.1".to_string(),
            port: 0,
            ..config
        },
        tokens,
    );
    let addr = server.start().await.unwrap();
    (server, addr)
}

/// Context with one running gateway at `http://{addr}{prefix}`.
async fn context_for(addr: SocketAddr, prefix: &str, registry: HandlerRegistry) -> InterceptorContext {
    context_with_policy(addr, prefix, registry, UnhandledPolicy::log_only()).await
}

async fn context_with_policy(
    addr: SocketAddr,
    prefix: &str,
    registry: HandlerRegistry,
    policy: UnhandledPolicy,
) -> InterceptorContext {
    let gateway = InterceptionGateway::new(&format!("http://{addr}{prefix}"), registry)
        .unwrap()
        .with_unhandled_policy(policy);
    gateway.start();
    let context = InterceptorContext::new();
    context.register(Arc::new(gateway)).await;
    context
}

async fn connect(addr: SocketAddr, prefix: &str, context: InterceptorContext) -> RemoteClient {
    RemoteClient::connect(
        &format!("ws://{addr}"),
        None,
        vec![prefix.to_string()],
        context,
        CLIENT_TIMEOUT,
    )
    .await
    .unwrap()
}

async fn wait_for_pending(server: &InterceptorServer, expected: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let pending: usize = server.connections().await.iter().map(|c| c.pending_rpcs).sum();
        if pending == expected {
            return;
        }
        assert!(Instant::now() < deadline, "pending RPCs stuck at {pending}, wanted {expected}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_no_connections(server: &InterceptorServer) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !server.connections().await.is_empty() {
        assert!(Instant::now() < deadline, "connection was never detached");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_matched_request_is_answered_by_client() {
    let (server, addr) = start_server(ServerConfig::default(), TokenStore::disabled()).await;

    let registry = HandlerRegistry::new();
    let handle = registry
        .register(
            HandlerDeclaration::get("/users/:id")
                .unwrap()
                .respond_with_fn(|matched| {
                    MockResponse::ok()
                        .with_header("x-mock", "yes")
                        .with_json(&json!({ "id": matched.param("id") }))
                }),
        )
        .await;
    let client = connect(addr, "/run-1", context_for(addr, "/run-1", registry).await).await;

    let response = reqwest::Client::new()
        .get(format!("http://{addr}/run-1/users/42"))
        .header("origin", "http://app.test")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-mock"], "yes");
    assert_eq!(response.headers()["access-control-allow-origin"], "http://app.test");
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body, json!({ "id": "42" }));
    assert_eq!(handle.call_count().await, 1);

    client.close().await;
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_preflight_is_answered_without_a_client() {
    let (server, addr) = start_server(ServerConfig::default(), TokenStore::disabled()).await;

    let response = reqwest::Client::new()
        .request(reqwest::Method::OPTIONS, format!("http://{addr}/anything"))
        .header("origin", "http://app.test")
        .header("access-control-request-method", "POST")
        .header("access-control-request-headers", "content-type")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(response.headers()["access-control-allow-origin"], "http://app.test");
    assert_eq!(response.headers()["access-control-allow-headers"], "content-type");
    assert!(response.bytes().await.unwrap().is_empty());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_unrouted_request_gets_fallback_status() {
    let (server, addr) = start_server(ServerConfig::default(), TokenStore::disabled()).await;

    let response = reqwest::get(format!("http://{addr}/nobody/home")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_bypass_and_reject_decisions() {
    let (server, addr) = start_server(ServerConfig::default(), TokenStore::disabled()).await;

    let bypassing = connect(addr, "/bypass", context_for(addr, "/bypass", HandlerRegistry::new()).await).await;
    let rejecting = connect(
        addr,
        "/reject",
        context_with_policy(addr, "/reject", HandlerRegistry::new(), UnhandledPolicy::log_and_reject()).await,
    )
    .await;

    let bypassed = reqwest::get(format!("http://{addr}/bypass/x")).await.unwrap();
    assert_eq!(bypassed.status(), StatusCode::NOT_FOUND);

    let rejected = reqwest::get(format!("http://{addr}/reject/x")).await.unwrap();
    assert_eq!(rejected.status(), StatusCode::INTERNAL_SERVER_ERROR);

    bypassing.close().await;
    rejecting.close().await;
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_unanswered_rpc_times_out_with_gateway_timeout() {
    let rpc_timeout = Duration::from_millis(300);
    let (server, addr) = start_server(
        ServerConfig {
            rpc_timeout,
            ..Default::default()
        },
        TokenStore::disabled(),
    )
    .await;

    let registry = HandlerRegistry::new();
    registry
        .register(
            HandlerDeclaration::any("/slow")
                .unwrap()
                .respond_with(MockResponse::ok())
                .delay(Duration::from_secs(30)),
        )
        .await;
    let client = connect(addr, "/run-1", context_for(addr, "/run-1", registry).await).await;

    let started = Instant::now();
    let response = reqwest::get(format!("http://{addr}/run-1/slow")).await.unwrap();
    let elapsed = started.elapsed();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert!(elapsed >= rpc_timeout);
    assert!(elapsed < rpc_timeout + Duration::from_secs(2), "took {elapsed:?}");

    client.close().await;
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_prefixes_never_cross_route() {
    let (server, addr) = start_server(ServerConfig::default(), TokenStore::disabled()).await;

    let mut clients = Vec::new();
    for run in ["run-1", "run-2"] {
        let registry = HandlerRegistry::new();
        registry
            .register(
                HandlerDeclaration::get("/who")
                    .unwrap()
                    .respond_with(MockResponse::ok().with_text(run)),
            )
            .await;
        let prefix = format!("/{run}");
        clients.push(connect(addr, &prefix, context_for(addr, &prefix, registry).await).await);
    }

    let http = reqwest::Client::new();
    for _ in 0..5 {
        for run in ["run-1", "run-2"] {
            let text = http
                .get(format!("http://{addr}/{run}/who"))
                .send()
                .await
                .unwrap()
                .text()
                .await
                .unwrap();
            assert_eq!(text, run);
        }
    }
    // segment boundary: /run-10 is not under /run-1
    let unowned = http.get(format!("http://{addr}/run-10/who")).send().await.unwrap();
    assert_eq!(unowned.status(), StatusCode::NOT_FOUND);

    for client in &clients {
        client.close().await;
    }
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_prefix_conflict_and_release_on_disconnect() {
    let (server, addr) = start_server(ServerConfig::default(), TokenStore::disabled()).await;

    let first = connect(addr, "/run-1", InterceptorContext::new()).await;
    let conflict = RemoteClient::connect(
        &format!("ws://{addr}"),
        None,
        vec!["/run-1".to_string()],
        InterceptorContext::new(),
        CLIENT_TIMEOUT,
    )
    .await
    .unwrap_err();
    assert!(matches!(conflict, InterceptorError::Auth(AuthError::Rejected { .. })));

    first.close().await;
    assert!(first.is_closed());
    wait_for_no_connections(&server).await;

    let second = connect(addr, "/run-1", InterceptorContext::new()).await;
    assert_eq!(server.connections().await.len(), 1);

    second.close().await;
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_nested_prefixes_of_other_clients_are_rejected() {
    let (server, addr) = start_server(ServerConfig::default(), TokenStore::disabled()).await;
    let bystander = connect(addr, "/elsewhere", InterceptorContext::new()).await;

    // ancestor connected first, descendant refused
    let registry = HandlerRegistry::new();
    registry
        .register(
            HandlerDeclaration::get("/users")
                .unwrap()
                .respond_with(MockResponse::ok().with_text("outer")),
        )
        .await;
    let outer = connect(addr, "/run", context_for(addr, "/run", registry).await).await;

    let err = RemoteClient::connect(
        &format!("ws://{addr}"),
        None,
        vec!["/run/users".to_string()],
        InterceptorContext::new(),
        CLIENT_TIMEOUT,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, InterceptorError::Auth(AuthError::Rejected { .. })), "{err}");
    let err = bystander.claim("/run/users").await.unwrap_err();
    assert!(matches!(err, InterceptorError::Connection(ConnectionError::ClaimRejected { .. })));

    let text = reqwest::get(format!("http://{addr}/run/users")).await.unwrap().text().await.unwrap();
    assert_eq!(text, "outer");

    // descendant connected first, ancestor refused
    let registry = HandlerRegistry::new();
    registry
        .register(
            HandlerDeclaration::get("/list")
                .unwrap()
                .respond_with(MockResponse::ok().with_text("inner")),
        )
        .await;
    let inner = connect(addr, "/deep/users", context_for(addr, "/deep/users", registry).await).await;

    let err = RemoteClient::connect(
        &format!("ws://{addr}"),
        None,
        vec!["/deep".to_string()],
        InterceptorContext::new(),
        CLIENT_TIMEOUT,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, InterceptorError::Auth(AuthError::Rejected { .. })), "{err}");
    let err = bystander.claim("/deep").await.unwrap_err();
    assert!(matches!(err, InterceptorError::Connection(ConnectionError::ClaimRejected { .. })));

    let text = reqwest::get(format!("http://{addr}/deep/users/list")).await.unwrap().text().await.unwrap();
    assert_eq!(text, "inner");
    let unowned = reqwest::get(format!("http://{addr}/deep/other")).await.unwrap();
    assert_eq!(unowned.status(), StatusCode::NOT_FOUND);
    assert_eq!(server.connections().await.len(), 3);

    for client in [&bystander, &outer, &inner] {
        client.close().await;
    }
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_aborted_request_cancels_client_work() {
    let (server, addr) = start_server(ServerConfig::default(), TokenStore::disabled()).await;

    let answered = Arc::new(AtomicBool::new(false));
    let registry = HandlerRegistry::new();
    let handle = registry
        .register(
            HandlerDeclaration::get("/slow")
                .unwrap()
                .respond_with_fn({
                    let answered = answered.clone();
                    move |_| {
                        answered.store(true, Ordering::SeqCst);
                        MockResponse::ok().with_text("late")
                    }
                })
                .delay(Duration::from_millis(500)),
        )
        .await;
    let client = connect(addr, "/run-1", context_for(addr, "/run-1", registry).await).await;

    let request = tokio::spawn(reqwest::get(format!("http://{addr}/run-1/slow")));
    wait_for_pending(&server, 1).await;
    let deadline = Instant::now() + Duration::from_secs(5);
    while handle.call_count().await == 0 {
        assert!(Instant::now() < deadline, "client never picked up the request");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    request.abort();
    wait_for_pending(&server, 0).await;

    // past the handler delay: the response was never produced or sent
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert!(!answered.load(Ordering::SeqCst));
    assert_eq!(handle.call_count().await, 1);
    let saved = handle.requests().await;
    assert_eq!(saved.len(), 1);
    assert!(saved[0].response.is_none());
    assert!(!client.is_closed());

    client.close().await;
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_pending_request_fails_when_client_disconnects() {
    let (server, addr) = start_server(ServerConfig::default(), TokenStore::disabled()).await;

    let registry = HandlerRegistry::new();
    registry
        .register(
            HandlerDeclaration::any("/slow")
                .unwrap()
                .respond_with(MockResponse::ok())
                .delay(Duration::from_secs(30)),
        )
        .await;
    let client = connect(addr, "/run-1", context_for(addr, "/run-1", registry).await).await;

    let request = tokio::spawn(reqwest::get(format!("http://{addr}/run-1/slow")));
    tokio::time::sleep(Duration::from_millis(200)).await;
    client.close().await;

    let response = request.await.unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_claim_and_release_after_connect() {
    let (server, addr) = start_server(ServerConfig::default(), TokenStore::disabled()).await;

    let owner = connect(addr, "/taken", InterceptorContext::new()).await;
    let client = connect(addr, "/run-1", InterceptorContext::new()).await;

    assert_eq!(client.claim("run-2/").await.unwrap(), "/run-2");
    let err = client.claim("/taken").await.unwrap_err();
    assert!(matches!(
        err,
        InterceptorError::Connection(ConnectionError::ClaimRejected { .. })
    ));

    client.release("/run-2").unwrap();
    // releases are not acknowledged; the owner can claim once the server applied it
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match owner.claim("/run-2").await {
            Ok(prefix) => {
                assert_eq!(prefix, "/run-2");
                break;
            }
            Err(_) if Instant::now() < deadline => tokio::time::sleep(Duration::from_millis(20)).await,
            Err(err) => panic!("prefix was never released: {err}"),
        }
    }

    owner.close().await;
    client.close().await;
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_claims_resolve_independently() {
    let (server, addr) = start_server(ServerConfig::default(), TokenStore::disabled()).await;
    let owner = connect(addr, "/taken", InterceptorContext::new()).await;
    let client = connect(addr, "/run-1", InterceptorContext::new()).await;

    let (first, second) = tokio::join!(client.claim("/run-2"), client.claim("run-2/"));
    assert_eq!(first.unwrap(), "/run-2");
    assert_eq!(second.unwrap(), "/run-2");

    let (accepted, rejected) = tokio::join!(client.claim("/run-3"), client.claim("/taken"));
    assert_eq!(accepted.unwrap(), "/run-3");
    assert!(matches!(
        rejected,
        Err(InterceptorError::Connection(ConnectionError::ClaimRejected { .. }))
    ));

    let connections = server.connections().await;
    let mine = connections.iter().find(|c| c.id == client.connection_id()).unwrap();
    assert_eq!(mine.prefixes, ["/run-1", "/run-2", "/run-3"]);

    owner.close().await;
    client.close().await;
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_upgrade_outside_connect_path_is_ordinary_traffic() {
    let (server, addr) = start_server(ServerConfig::default(), TokenStore::disabled()).await;

    for path in ["/", "/run-1/socket"] {
        match tokio_tungstenite::connect_async(format!("ws://{addr}{path}")).await {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), StatusCode::NOT_FOUND, "{path}");
            }
            Err(err) => panic!("unexpected error on {path}: {err}"),
            Ok(_) => panic!("upgrade on {path} was accepted"),
        }
    }
    assert!(server.connections().await.is_empty());

    let client = connect(addr, "/run-1", InterceptorContext::new()).await;
    assert_eq!(server.connections().await.len(), 1);

    client.close().await;
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_token_authentication() {
    let dir = tempfile::tempdir().unwrap();
    let tokens = TokenStore::open(dir.path().join("tokens")).unwrap();
    let (record, plaintext) = tokens.create("ci").unwrap();
    let (server, addr) = start_server(ServerConfig::default(), tokens.clone()).await;
    let url = format!("ws://{addr}");

    let client = RemoteClient::connect(
        &url,
        Some(&plaintext),
        vec!["/run-1".to_string()],
        InterceptorContext::new(),
        CLIENT_TIMEOUT,
    )
    .await
    .unwrap();
    let connections = server.connections().await;
    assert_eq!(connections[0].token_id.as_deref(), Some(record.id.as_str()));
    client.close().await;

    for token in [None, Some("not-a-token"), Some("abc.def")] {
        let err = RemoteClient::connect(&url, token, Vec::new(), InterceptorContext::new(), CLIENT_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, InterceptorError::Auth(AuthError::Rejected { .. })), "{err}");
    }

    assert!(tokens.revoke(&record.id).unwrap());
    let err = RemoteClient::connect(&url, Some(&plaintext), Vec::new(), InterceptorContext::new(), CLIENT_TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, InterceptorError::Auth(AuthError::Rejected { .. })));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_malformed_reply_is_bad_gateway() {
    let (server, addr) = start_server(ServerConfig::default(), TokenStore::disabled()).await;

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}{DEFAULT_CONNECT_PATH}"))
        .await
        .unwrap();
    let auth: WireMessage = ControlMessage::Auth {
        token: None,
        prefixes: vec!["/raw".to_string()],
    }
    .into();
    socket.send(Message::text(auth.encode().unwrap())).await.unwrap();
    let accepted = socket.next().await.unwrap().unwrap();
    assert!(accepted.to_text().unwrap().contains("auth-accepted"));

    let request = tokio::spawn(reqwest::get(format!("http://{addr}/raw/thing")));
    let rpc = socket.next().await.unwrap().unwrap();
    let id = match WireMessage::decode(rpc.to_text().unwrap()).unwrap() {
        WireMessage::Rpc { id, payload } => {
            assert!(payload.url.ends_with("/raw/thing"));
            id
        }
        other => panic!("expected rpc, got {other:?}"),
    };
    let bogus = json!({ "type": "reply", "id": id, "payload": { "decision": "maybe" } });
    socket.send(Message::text(bogus.to_string())).await.unwrap();

    let response = request.await.unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    socket.close(None).await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_disconnects_clients() {
    let (server, addr) = start_server(ServerConfig::default(), TokenStore::disabled()).await;
    let client = connect(addr, "/run-1", InterceptorContext::new()).await;

    server.stop().await.unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !client.is_closed() {
        assert!(Instant::now() < deadline, "client never noticed the shutdown");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(reqwest::get(format!("http://{addr}/run-1/x")).await.is_err());
}
