//! Remote interception.
//!
//! An [`InterceptorServer`] accepts real HTTP traffic and WebSocket clients.
//! Each client authenticates, claims one or more path prefixes, and from then
//! on receives every request under those prefixes as an `rpc` frame, which it
//! answers with a decision from its own handlers. [`RemoteClient`] is that
//! client, driving an [`InterceptorContext`](crate::context::InterceptorContext).

pub mod client;
pub mod connections;
pub mod rpc;
pub mod server;
pub mod tokens;
pub mod wire;

pub use client::RemoteClient;
pub use connections::{ClientConnection, ConnectionInfo, ConnectionManager, normalize_prefix};
pub use rpc::RpcChannel;
pub use server::{InterceptorServer, RequestState};
pub use tokens::{TokenRecord, TokenStore};
pub use wire::{ControlMessage, HeaderEncoding, HeaderEntry, ReplyPayload, RequestPayload, ResponsePayload, WireMessage};

use crate::error::Result;
use futures_util::{Sink, SinkExt};
use tokio_tungstenite::tungstenite::{self, Message};

/// Write one frame to a WebSocket sink.
pub(crate) async fn send_frame<W>(sink: &mut W, message: &WireMessage) -> Result<()>
where
    W: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    sink.send(Message::text(message.encode()?)).await?;
    Ok(())
}
