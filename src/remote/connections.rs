//! Client connections and prefix ownership.
//!
//! A prefix maps to at most one active connection, and no connection may
//! own a prefix nested (at a segment boundary) inside another connection's
//! prefix or enclosing it. One connection may own nested prefixes of its
//! own. Claims are checked and applied under one write lock, so a handshake that asks for several
//! prefixes gets all of them or none. Detaching a connection frees its
//! prefixes and closes its RPC channel, failing whatever was still pending.

use super::rpc::RpcChannel;
use super::tokens::{TokenRecord, TokenStore};
use crate::error::{AuthError, ConnectionError, Result, ValidationError};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Normalise a prefix: leading slash, no trailing slash, not the root.
///
/// # Errors
///
/// [`ValidationError::InvalidPrefix`] for empty, root, or query-bearing prefixes.
pub fn normalize_prefix(raw: &str) -> std::result::Result<String, ValidationError> {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() || trimmed.contains(['?', '#']) || trimmed.contains("//") {
        return Err(ValidationError::InvalidPrefix {
            prefix: raw.to_string(),
        });
    }
    Ok(format!("/{trimmed}"))
}

// `path` is `prefix` itself or lies below it at a segment boundary.
fn is_within(path: &str, prefix: &str) -> bool {
    path.strip_prefix(prefix).is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

fn overlaps(a: &str, b: &str) -> bool {
    is_within(a, b) || is_within(b, a)
}

// First prefix held by another connection that overlaps `prefix`.
fn conflicting_owner(owners: &BTreeMap<String, String>, connection_id: &str, prefix: &str) -> Option<ConnectionError> {
    owners
        .iter()
        .find(|(owned, owner)| owner.as_str() != connection_id && overlaps(owned, prefix))
        .map(|(owned, owner)| ConnectionError::PrefixConflict {
            prefix: owned.clone(),
            owner: owner.clone(),
        })
}

/// One authenticated client.
#[derive(Debug)]
pub struct ClientConnection {
    id: String,
    token: Option<TokenRecord>,
    channel: Arc<RpcChannel>,
    connected_at: DateTime<Utc>,
}

impl ClientConnection {
    /// Connection that authenticated with `token` (`None` when tokens are disabled).
    pub fn new(id: impl Into<String>, token: Option<TokenRecord>, channel: Arc<RpcChannel>) -> Self {
        Self {
            id: id.into(),
            token,
            channel,
            connected_at: Utc::now(),
        }
    }

    /// Connection id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Token the connection presented.
    pub fn token(&self) -> Option<&TokenRecord> {
        self.token.as_ref()
    }

    /// The connection's RPC channel.
    pub fn channel(&self) -> &Arc<RpcChannel> {
        &self.channel
    }
}

/// Diagnostic snapshot of one connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    /// Connection id
    pub id: String,
    /// Id of the token used, if any
    pub token_id: Option<String>,
    /// Label of the token used, if any
    pub token_name: Option<String>,
    /// Owned prefixes
    pub prefixes: Vec<String>,
    /// RPCs awaiting a reply
    pub pending_rpcs: usize,
    /// Handshake time
    pub connected_at: DateTime<Utc>,
}

/// Authenticates clients and maps prefixes to them.
#[derive(Debug)]
pub struct ConnectionManager {
    tokens: TokenStore,
    connections: DashMap<String, Arc<ClientConnection>>,
    // prefix -> connection id
    owners: RwLock<BTreeMap<String, String>>,
}

impl ConnectionManager {
    /// Manager checking tokens against `tokens`.
    pub fn new(tokens: TokenStore) -> Self {
        Self {
            tokens,
            connections: DashMap::new(),
            owners: RwLock::new(BTreeMap::new()),
        }
    }

    /// Validate a presented token.
    pub fn authenticate(&self, token: Option<&str>) -> std::result::Result<Option<TokenRecord>, AuthError> {
        let result = self.tokens.verify(token);
        match &result {
            Ok(Some(record)) => debug!(token = %record.id, "Client authenticated"),
            Ok(None) => debug!("Client accepted, token checks disabled"),
            Err(err) => warn!(error = %err, "Client authentication failed"),
        }
        result
    }

    /// Register a connection together with its initial prefixes.
    ///
    /// Either every prefix is claimed and the connection registered, or
    /// nothing changes. Returns the normalised prefixes.
    ///
    /// # Errors
    ///
    /// [`ValidationError::InvalidPrefix`] or [`ConnectionError::PrefixConflict`].
    pub async fn attach(&self, connection: Arc<ClientConnection>, prefixes: &[String]) -> Result<Vec<String>> {
        let normalized = prefixes
            .iter()
            .map(|p| normalize_prefix(p))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut owners = self.owners.write().await;
        for prefix in &normalized {
            if let Some(conflict) = conflicting_owner(&owners, &connection.id, prefix) {
                return Err(conflict.into());
            }
        }
        for prefix in &normalized {
            owners.insert(prefix.clone(), connection.id.clone());
        }
        self.connections.insert(connection.id.clone(), connection.clone());
        info!(connection = %connection.id, prefixes = ?normalized, "Client attached");
        Ok(normalized)
    }

    /// Claim one more prefix for an attached connection.
    ///
    /// Claiming a prefix the connection already owns is a no-op. A prefix
    /// that equals, encloses or sits under another connection's prefix is
    /// refused.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::UnknownConnection`], [`ValidationError::InvalidPrefix`]
    /// or [`ConnectionError::PrefixConflict`].
    pub async fn claim(&self, connection_id: &str, prefix: &str) -> Result<String> {
        let prefix = normalize_prefix(prefix)?;
        let mut owners = self.owners.write().await;
        if !self.connections.contains_key(connection_id) {
            return Err(ConnectionError::UnknownConnection {
                connection_id: connection_id.to_string(),
            }
            .into());
        }
        if let Some(conflict) = conflicting_owner(&owners, connection_id, &prefix) {
            return Err(conflict.into());
        }
        if !owners.contains_key(&prefix) {
            owners.insert(prefix.clone(), connection_id.to_string());
            info!(connection = %connection_id, prefix = %prefix, "Prefix claimed");
        }
        Ok(prefix)
    }

    /// Give up a prefix. Returns `false` if the connection did not own it.
    pub async fn release(&self, connection_id: &str, prefix: &str) -> bool {
        let Ok(prefix) = normalize_prefix(prefix) else {
            return false;
        };
        let mut owners = self.owners.write().await;
        if owners.get(&prefix).is_some_and(|owner| owner == connection_id) {
            owners.remove(&prefix);
            info!(connection = %connection_id, prefix = %prefix, "Prefix released");
            true
        } else {
            false
        }
    }

    /// Connection owning the longest prefix of `path`, with that prefix.
    ///
    /// Prefixes match whole segments: `/run-1` owns `/run-1/users` but not
    /// `/run-10`.
    pub async fn route(&self, path: &str) -> Option<(Arc<ClientConnection>, String)> {
        let owners = self.owners.read().await;
        let mut candidate = path.trim_end_matches('/');
        while !candidate.is_empty() {
            if let Some(owner) = owners.get(candidate) {
                let connection = self.connections.get(owner)?.value().clone();
                return Some((connection, candidate.to_string()));
            }
            candidate = match candidate.rfind('/') {
                Some(index) => &candidate[..index],
                None => "",
            };
        }
        None
    }

    /// Remove a connection: free its prefixes and fail its pending RPCs.
    pub async fn detach(&self, connection_id: &str, reason: &str) -> Option<Arc<ClientConnection>> {
        let mut owners = self.owners.write().await;
        let (_, connection) = self.connections.remove(connection_id)?;
        let before = owners.len();
        owners.retain(|_, owner| owner != connection_id);
        let released = before - owners.len();
        drop(owners);

        connection.channel.close(reason);
        info!(connection = %connection_id, released, reason, "Client detached");
        Some(connection)
    }

    /// Detach every connection.
    pub async fn detach_all(&self, reason: &str) {
        let ids: Vec<String> = self.connections.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            self.detach(&id, reason).await;
        }
    }

    /// Prefixes owned by a connection, sorted.
    pub async fn prefixes_of(&self, connection_id: &str) -> Vec<String> {
        self.owners
            .read()
            .await
            .iter()
            .filter(|(_, owner)| owner.as_str() == connection_id)
            .map(|(prefix, _)| prefix.clone())
            .collect()
    }

    /// Active connection by id.
    pub fn get(&self, connection_id: &str) -> Option<Arc<ClientConnection>> {
        self.connections.get(connection_id).map(|entry| entry.value().clone())
    }

    /// Snapshot of every active connection.
    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        let owners = self.owners.read().await;
        let mut infos: Vec<ConnectionInfo> = self
            .connections
            .iter()
            .map(|entry| {
                let connection = entry.value();
                ConnectionInfo {
                    id: connection.id.clone(),
                    token_id: connection.token.as_ref().map(|t| t.id.clone()),
                    token_name: connection.token.as_ref().map(|t| t.name.clone()),
                    prefixes: owners
                        .iter()
                        .filter(|(_, owner)| **owner == connection.id)
                        .map(|(prefix, _)| prefix.clone())
                        .collect(),
                    pending_rpcs: connection.channel.pending_count(),
                    connected_at: connection.connected_at,
                }
            })
            .collect();
        infos.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InterceptorError;
    use crate::remote::wire::{RequestPayload, WireMessage};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn connection(id: &str) -> (Arc<ClientConnection>, mpsc::UnboundedReceiver<WireMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(RpcChannel::new(id, tx));
        (Arc::new(ClientConnection::new(id, None, channel)), rx)
    }

    fn prefixes(list: &[&str]) -> Vec<String> {
        list.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix("run-1").unwrap(), "/run-1");
        assert_eq!(normalize_prefix("/run-1/").unwrap(), "/run-1");
        assert_eq!(normalize_prefix("/a/b").unwrap(), "/a/b");
        for bad in ["", "/", "//", "/a?b", "/a//b"] {
            assert!(normalize_prefix(bad).is_err(), "{bad}");
        }
    }

    #[tokio::test]
    async fn test_route_uses_longest_segment_prefix() {
        let manager = ConnectionManager::new(TokenStore::disabled());
        let (a, _rx_a) = connection("a");
        manager.attach(a, &prefixes(&["/run"])).await.unwrap();
        manager.claim("a", "/run/deep").await.unwrap();

        let (owner, prefix) = manager.route("/run/deep/users").await.unwrap();
        assert_eq!((owner.id(), prefix.as_str()), ("a", "/run/deep"));

        let (_, prefix) = manager.route("/run/other").await.unwrap();
        assert_eq!(prefix, "/run");
        let (_, prefix) = manager.route("/run").await.unwrap();
        assert_eq!(prefix, "/run");

        assert!(manager.route("/runner").await.is_none());
        assert!(manager.route("/").await.is_none());
    }

    #[tokio::test]
    async fn test_second_claim_of_owned_prefix_is_rejected() {
        let manager = ConnectionManager::new(TokenStore::disabled());
        let (a, _rx_a) = connection("a");
        let (b, _rx_b) = connection("b");
        manager.attach(a, &prefixes(&["/run-1"])).await.unwrap();

        let err = manager
            .attach(b.clone(), &prefixes(&["/run-2", "/run-1"]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InterceptorError::Connection(ConnectionError::PrefixConflict { ref owner, .. }) if owner == "a"
        ));
        // all-or-nothing: /run-2 was not taken and b is not registered
        assert!(manager.route("/run-2").await.is_none());
        assert!(manager.get("b").is_none());

        manager.attach(b, &prefixes(&["/run-2"])).await.unwrap();
        let err = manager.claim("b", "/run-1").await.unwrap_err();
        assert!(matches!(err, InterceptorError::Connection(ConnectionError::PrefixConflict { .. })));
        assert_eq!(manager.claim("b", "run-3/").await.unwrap(), "/run-3");
        assert_eq!(manager.prefixes_of("b").await, prefixes(&["/run-2", "/run-3"]));
    }

    #[tokio::test]
    async fn test_nested_prefix_of_another_connection_is_rejected() {
        let manager = ConnectionManager::new(TokenStore::disabled());
        let (a, _rx_a) = connection("a");
        let (b, _rx_b) = connection("b");
        let (c, _rx_c) = connection("c");
        manager.attach(a, &prefixes(&["/run/users"])).await.unwrap();
        manager.attach(b, &prefixes(&["/other"])).await.unwrap();

        // ancestor of a's prefix, at handshake and as a later claim
        let err = manager.attach(c, &prefixes(&["/run"])).await.unwrap_err();
        assert!(matches!(
            err,
            InterceptorError::Connection(ConnectionError::PrefixConflict { ref prefix, ref owner })
                if prefix == "/run/users" && owner == "a"
        ));
        assert!(manager.claim("b", "/run").await.is_err());

        // descendant of a's prefix
        let err = manager.claim("b", "/run/users/7").await.unwrap_err();
        assert!(matches!(err, InterceptorError::Connection(ConnectionError::PrefixConflict { ref owner, .. }) if owner == "a"));

        // shared text but not a shared segment
        assert_eq!(manager.claim("b", "/run/users-archive").await.unwrap(), "/run/users-archive");
        assert_eq!(manager.claim("b", "/ru").await.unwrap(), "/ru");

        assert_eq!(manager.route("/run/users/7").await.unwrap().0.id(), "a");
        assert_eq!(manager.route("/run/users-archive/1").await.unwrap().0.id(), "b");
        assert!(manager.route("/run").await.is_none());
    }

    #[test]
    fn test_overlap_respects_segment_boundaries() {
        assert!(overlaps("/a", "/a"));
        assert!(overlaps("/a", "/a/b"));
        assert!(overlaps("/a/b", "/a"));
        assert!(!overlaps("/a", "/ab"));
        assert!(!overlaps("/a/b", "/a/c"));
    }

    #[tokio::test]
    async fn test_claim_and_release_require_ownership() {
        let manager = ConnectionManager::new(TokenStore::disabled());
        let (a, _rx) = connection("a");
        manager.attach(a, &[]).await.unwrap();

        let err = manager.claim("ghost", "/x").await.unwrap_err();
        assert!(matches!(err, InterceptorError::Connection(ConnectionError::UnknownConnection { .. })));

        manager.claim("a", "/x").await.unwrap();
        manager.claim("a", "/x").await.unwrap();
        assert!(!manager.release("other", "/x").await);
        assert!(manager.release("a", "/x").await);
        assert!(manager.route("/x").await.is_none());
    }

    #[tokio::test]
    async fn test_detach_fails_pending_and_frees_prefixes() {
        let manager = ConnectionManager::new(TokenStore::disabled());
        let (a, mut rx) = connection("a");
        let channel = a.channel().clone();
        manager.attach(a, &prefixes(&["/run-1"])).await.unwrap();

        let waiter = tokio::spawn(async move {
            channel
                .send_and_wait(
                    RequestPayload {
                        method: "GET".to_string(),
                        url: "http://api.test/run-1".to_string(),
                        headers: Vec::new(),
                        body: String::new(),
                    },
                    Duration::from_secs(5),
                    &CancellationToken::new(),
                )
                .await
        });
        assert!(matches!(rx.recv().await, Some(WireMessage::Rpc { .. })));

        assert!(manager.detach("a", "socket closed").await.is_some());
        assert!(manager.detach("a", "socket closed").await.is_none());
        assert!(waiter.await.unwrap().is_err());
        assert!(manager.route("/run-1/x").await.is_none());

        let (b, _rx_b) = connection("b");
        manager.attach(b, &prefixes(&["/run-1"])).await.unwrap();
        assert_eq!(manager.route("/run-1/x").await.unwrap().0.id(), "b");
    }

    #[tokio::test]
    async fn test_connections_snapshot() {
        let manager = ConnectionManager::new(TokenStore::disabled());
        let (a, _rx) = connection("a");
        manager.attach(a, &prefixes(&["/p1", "/p2"])).await.unwrap();

        let infos = manager.connections().await;
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].id, "a");
        assert_eq!(infos[0].prefixes, prefixes(&["/p1", "/p2"]));
        assert_eq!(infos[0].pending_rpcs, 0);
        assert!(infos[0].token_id.is_none());
    }

    #[test]
    fn test_authenticate_delegates_to_store() {
        let manager = ConnectionManager::new(TokenStore::disabled());
        assert_eq!(manager.authenticate(None), Ok(None));
    }
}
