//! Correlated request/reply over one client connection.
//!
//! [`RpcChannel`] hands outbound frames to the connection's writer task and
//! keeps a pending table keyed by correlation id. Every pending entry is
//! resolved exactly once: by [`RpcChannel::resolve`], by timeout, by
//! cancellation, or by [`RpcChannel::close`]. Whichever comes first removes
//! the entry, so anything arriving later for that id is ignored.

use super::wire::{ControlMessage, ReplyPayload, RequestPayload, WireMessage};
use crate::error::{RpcError, TimeoutKind};
use crate::timeout::bounded;
use dashmap::DashMap;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

type ReplySlot = oneshot::Sender<Result<ReplyPayload, RpcError>>;

/// The RPC side of one client connection.
#[derive(Debug)]
pub struct RpcChannel {
    connection_id: String,
    outbound: mpsc::UnboundedSender<WireMessage>,
    pending: DashMap<u64, ReplySlot>,
    next_id: AtomicU64,
    closed: OnceLock<String>,
}

impl RpcChannel {
    /// Channel writing frames into `outbound`.
    pub fn new(connection_id: impl Into<String>, outbound: mpsc::UnboundedSender<WireMessage>) -> Self {
        Self {
            connection_id: connection_id.into(),
            outbound,
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            closed: OnceLock::new(),
        }
    }

    /// Owning connection.
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// RPCs currently awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.get().is_some()
    }

    /// Queue a frame that expects no reply (control frames).
    ///
    /// Returns `false` when the writer is gone.
    pub fn notify(&self, message: WireMessage) -> bool {
        self.outbound.send(message).is_ok()
    }

    /// Send `payload` and wait for the matching reply.
    ///
    /// Dropping the returned future before it completes removes the pending
    /// entry and sends a best-effort `cancel` to the peer.
    ///
    /// # Errors
    ///
    /// - [`RpcError::Timeout`] when no reply arrives within `timeout`
    /// - [`RpcError::Cancelled`] when `cancel` fires first
    /// - [`RpcError::ConnectionClosed`] when the channel is or becomes closed
    pub async fn send_and_wait(
        &self,
        payload: RequestPayload,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ReplyPayload, RpcError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        let guard = PendingGuard { channel: self, id };

        // close() may have drained the table between the check and the insert
        if self.is_closed() {
            guard.discard();
            return Err(self.closed_error());
        }
        if self.outbound.send(WireMessage::Rpc { id, payload }).is_err() {
            guard.discard();
            return Err(self.closed_error());
        }
        trace!(connection = %self.connection_id, rpc = id, "RPC sent");

        let outcome = tokio::select! {
            reply = bounded(TimeoutKind::RpcReply, timeout, rx) => match reply {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(self.closed_error()),
                Err(timeout) => Err(RpcError::Timeout(timeout)),
            },
            _ = cancel.cancelled() => Err(RpcError::Cancelled { id }),
        };

        match &outcome {
            // timed out or cancelled: the entry is still ours, the guard cancels it
            Err(RpcError::Timeout(_)) | Err(RpcError::Cancelled { .. }) => drop(guard),
            _ => guard.discard(),
        }
        outcome
    }

    /// Deliver a reply. Returns `false` when no RPC with `id` is pending.
    pub fn resolve(&self, id: u64, payload: ReplyPayload) -> bool {
        match self.pending.remove(&id) {
            Some((_, slot)) => slot.send(Ok(payload)).is_ok(),
            None => {
                debug!(connection = %self.connection_id, rpc = id, "Ignoring reply for unknown or expired RPC");
                false
            }
        }
    }

    /// Fail one pending RPC. Returns `false` when no RPC with `id` is pending.
    pub fn reject(&self, id: u64, error: RpcError) -> bool {
        match self.pending.remove(&id) {
            Some((_, slot)) => slot.send(Err(error)).is_ok(),
            None => false,
        }
    }

    /// Close the channel: every pending RPC fails and later sends fail at once.
    ///
    /// Only the first reason is kept.
    pub fn close(&self, reason: &str) {
        let _ = self.closed.set(reason.to_string());
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        let rejected = ids.len();
        for id in ids {
            if let Some((_, slot)) = self.pending.remove(&id) {
                let _ = slot.send(Err(self.closed_error()));
            }
        }
        debug!(connection = %self.connection_id, rejected, reason, "RPC channel closed");
    }

    fn closed_error(&self) -> RpcError {
        RpcError::ConnectionClosed {
            connection_id: self.connection_id.clone(),
            reason: self
                .closed
                .get()
                .cloned()
                .unwrap_or_else(|| "writer stopped".to_string()),
        }
    }
}

/// Removes a pending entry when the waiting future goes away.
struct PendingGuard<'a> {
    channel: &'a RpcChannel,
    id: u64,
}

impl PendingGuard<'_> {
    /// Drop the entry without notifying the peer.
    fn discard(self) {
        self.channel.pending.remove(&self.id);
        std::mem::forget(self);
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.channel.pending.remove(&self.id).is_some() {
            trace!(connection = %self.channel.connection_id, rpc = self.id, "Cancelling RPC");
            let _ = self
                .channel
                .outbound
                .send(ControlMessage::Cancel { id: self.id }.into());
        }
    }
}
