//! Bounded operations.
//!
//! Every wait in stubgate that depends on something outside the process
//! (listener transitions, remote replies, handshakes, slow request bodies)
//! goes through [`bounded`], so the resulting [`TimeoutError`] always carries
//! the operation kind and the time actually spent.

use crate::error::{BodyReadError, TimeoutError, TimeoutKind};
use bytes::Bytes;
use http_body::Body;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Run `fut` to completion or fail with a [`TimeoutError`] of the given kind.
pub async fn bounded<F, T>(kind: TimeoutKind, limit: Duration, fut: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    let started = Instant::now();
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| TimeoutError {
            kind,
            elapsed: started.elapsed(),
        })
}

/// Limits applied when buffering an inbound request body.
#[derive(Debug, Clone, Copy)]
pub struct BodyLimits {
    /// Largest accepted body
    pub max_bytes: usize,
    /// Total time allowed to receive it
    pub read_timeout: Duration,
}

impl Default for BodyLimits {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024,
            read_timeout: Duration::from_secs(30),
        }
    }
}

/// Buffer a request body under both a size and a time limit.
///
/// Intercepted requests are matched as a whole, so bodies are always buffered;
/// the limits keep a slow or oversized sender from pinning a task forever.
pub async fn collect_body<B>(body: B, limits: BodyLimits) -> Result<Bytes, BodyReadError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let limited = Limited::new(body, limits.max_bytes);
    match bounded(TimeoutKind::BodyRead, limits.read_timeout, limited.collect()).await {
        Ok(Ok(collected)) => Ok(collected.to_bytes()),
        Ok(Err(err)) if err.downcast_ref::<LengthLimitError>().is_some() => Err(BodyReadError::TooLarge {
            limit: limits.max_bytes,
        }),
        Ok(Err(err)) => Err(BodyReadError::Stream {
            details: err.to_string(),
        }),
        Err(timeout) => Err(timeout.into()),
    }
}
