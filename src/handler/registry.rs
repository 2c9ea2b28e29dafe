//! The handler registry and matcher.
//!
//! Handlers live in a flat store keyed by a monotonically increasing
//! [`HandlerId`]; a higher id means a newer declaration. Matching walks the
//! store newest-first. Saved exchanges carry the id of the handler that
//! produced them rather than a reference to it.
//!
//! Call accounting is reserved under the handler's own lock before the
//! (possibly delayed) response is produced, so concurrent matches can never
//! push a handler past `max`.

use super::declaration::HandlerDeclaration;
use super::MatchedRequest;
use crate::error::{TimesFailure, ValidationError};
use crate::message::{InterceptedRequest, MockResponse};
use crate::path_pattern::PathParams;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, trace};

/// Identifier of a registered handler. Newer handlers have larger ids.
pub type HandlerId = u64;

/// A request matched by a handler, with its response once produced.
#[derive(Debug, Clone)]
pub struct SavedExchange {
    /// Handler that matched
    pub handler: HandlerId,
    /// The matched request
    pub request: InterceptedRequest,
    /// Path parameters captured for it
    pub params: PathParams,
    /// The response, set after any delay elapsed
    pub response: Option<MockResponse>,
}

#[derive(Debug, Default)]
struct HandlerState {
    call_count: usize,
    saved: Vec<SavedExchange>,
}

#[derive(Debug)]
struct HandlerEntry {
    id: HandlerId,
    declaration: HandlerDeclaration,
    state: Mutex<HandlerState>,
}

impl HandlerEntry {
    /// Reserve one use. Returns the saved-exchange slot when saving is on.
    async fn reserve(&self, matched: &MatchedRequest, save: bool) -> Option<Option<usize>> {
        let mut state = self.state.lock().await;
        if self.declaration.usage.is_exhausted(state.call_count) {
            return None;
        }
        state.call_count += 1;
        if !save {
            return Some(None);
        }
        state.saved.push(SavedExchange {
            handler: self.id,
            request: matched.request.clone(),
            params: matched.params.clone(),
            response: None,
        });
        Some(Some(state.saved.len() - 1))
    }
}

#[derive(Debug)]
struct RegistryInner {
    handlers: RwLock<BTreeMap<HandlerId, Arc<HandlerEntry>>>,
    next_id: AtomicU64,
    save_requests: bool,
}

/// Stores handler declarations and selects one per request.
///
/// Cloning is cheap and clones share the same store.
#[derive(Debug, Clone)]
pub struct HandlerRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    /// Empty registry that saves matched requests.
    pub fn new() -> Self {
        Self::with_save_requests(true)
    }

    /// Empty registry; `save_requests` controls whether matches are recorded.
    pub fn with_save_requests(save_requests: bool) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                handlers: RwLock::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
                save_requests,
            }),
        }
    }

    /// Add a handler. It takes priority over every handler registered before it.
    pub async fn register(&self, declaration: HandlerDeclaration) -> HandlerHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(
            handler = id,
            route = %declaration.describe(),
            declared_at = %declaration.declared_at,
            "Registered handler"
        );
        let entry = Arc::new(HandlerEntry {
            id,
            declaration,
            state: Mutex::new(HandlerState::default()),
        });
        self.inner.handlers.write().await.insert(id, entry);
        HandlerHandle {
            id,
            registry: self.clone(),
        }
    }

    /// Find the newest handler matching `request` at `path` and produce its response.
    ///
    /// `path` is the request path relative to the interceptor's base URL.
    /// Returns `None` when the request is unhandled. Any declared delay is
    /// awaited here; dropping the future abandons it.
    pub async fn match_request(
        &self,
        request: &InterceptedRequest,
        path: &str,
    ) -> Option<MockResponse> {
        let candidates: Vec<Arc<HandlerEntry>> =
            self.inner.handlers.read().await.values().rev().cloned().collect();

        for entry in candidates {
            let declaration = &entry.declaration;
            if !declaration.method.matches(&request.method) {
                continue;
            }
            let Some(params) = declaration.pattern.match_path(path) else {
                continue;
            };
            let Some(response_spec) = &declaration.response else {
                trace!(handler = entry.id, "Skipping handler without a response");
                continue;
            };

            let matched = MatchedRequest {
                request: request.clone(),
                params,
            };
            if !declaration.restrictions.is_satisfied_by(&matched) {
                continue;
            }
            let Some(slot) = entry.reserve(&matched, self.inner.save_requests).await else {
                trace!(handler = entry.id, "Skipping exhausted handler");
                continue;
            };

            let delay = declaration.delay.resolve(&matched);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let response = response_spec.compute(&matched);

            if let Some(index) = slot {
                let mut state = entry.state.lock().await;
                if let Some(saved) = state.saved.get_mut(index) {
                    saved.response = Some(response.clone());
                }
            }

            debug!(
                handler = entry.id,
                method = %request.method,
                path = %path,
                status = response.status.as_u16(),
                "Request matched handler"
            );
            return Some(response);
        }
        None
    }

    /// Verify every handler reached its minimum call count.
    ///
    /// Intended to run once at the end of a test.
    ///
    /// # Errors
    ///
    /// [`ValidationError::TimesNotSatisfied`] naming every under-satisfied handler.
    pub async fn check_times(&self) -> Result<(), ValidationError> {
        let handlers = self.inner.handlers.read().await;
        let mut failures = Vec::new();
        for entry in handlers.values() {
            let usage = entry.declaration.usage;
            let actual = entry.state.lock().await.call_count;
            if actual < usage.min {
                failures.push(TimesFailure {
                    handler: entry.declaration.describe(),
                    declared_at: entry.declaration.declared_at.to_string(),
                    min: usage.min,
                    max: usage.max,
                    actual,
                });
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::TimesNotSatisfied { failures })
        }
    }

    /// Remove every handler and its saved exchanges.
    pub async fn clear(&self) {
        let mut handlers = self.inner.handlers.write().await;
        debug!(count = handlers.len(), "Cleared handlers");
        handlers.clear();
    }

    /// Remove one handler. Returns `false` if it was already gone.
    pub async fn remove(&self, id: HandlerId) -> bool {
        self.inner.handlers.write().await.remove(&id).is_some()
    }

    /// Number of registered handlers.
    pub async fn len(&self) -> usize {
        self.inner.handlers.read().await.len()
    }

    /// `true` when no handler is registered.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Calls matched by a handler, `None` if it is not registered.
    pub async fn call_count(&self, id: HandlerId) -> Option<usize> {
        let entry = self.inner.handlers.read().await.get(&id).cloned()?;
        let count = entry.state.lock().await.call_count;
        Some(count)
    }

    /// Exchanges saved for a handler, oldest first.
    pub async fn requests(&self, id: HandlerId) -> Vec<SavedExchange> {
        let Some(entry) = self.inner.handlers.read().await.get(&id).cloned() else {
            return Vec::new();
        };
        let saved = entry.state.lock().await.saved.clone();
        saved
    }
}

/// Handle to a registered handler.
#[derive(Debug, Clone)]
pub struct HandlerHandle {
    id: HandlerId,
    registry: HandlerRegistry,
}

impl HandlerHandle {
    /// Handler id.
    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Calls matched so far (0 once removed).
    pub async fn call_count(&self) -> usize {
        self.registry.call_count(self.id).await.unwrap_or(0)
    }

    /// Exchanges saved so far, oldest first.
    pub async fn requests(&self) -> Vec<SavedExchange> {
        self.registry.requests(self.id).await
    }

    /// Unregister the handler.
    pub async fn remove(self) -> bool {
        self.registry.remove(self.id).await
    }
}
