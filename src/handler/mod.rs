//! Handler declarations and the matching registry.
//!
//! A handler maps method + path template + restrictions to a response. The
//! [`HandlerRegistry`] owns every handler in a flat, id-keyed store and picks
//! the newest handler that matches a request and still has uses left, so
//! test-local overrides shadow suite defaults until they are exhausted.
//!
//! The registry only answers "this response" or "unhandled"; what happens to
//! unhandled requests is the caller's policy (see [`crate::gateway`]).

pub mod declaration;
pub mod registry;
pub mod response;
pub mod restriction;

pub use declaration::{HandlerDeclaration, MethodFilter, UsageBounds};
pub use registry::{HandlerHandle, HandlerId, HandlerRegistry, SavedExchange};
pub use response::{DelaySpec, ResponseSpec};
pub use restriction::Restrictions;

use crate::message::InterceptedRequest;
use crate::path_pattern::PathParams;

/// A request together with the path parameters its handler extracted.
///
/// This is what response factories, computed delays and predicates see.
#[derive(Debug, Clone)]
pub struct MatchedRequest {
    /// The intercepted request
    pub request: InterceptedRequest,
    /// Parameters captured by the handler's path pattern
    pub params: PathParams,
}

impl MatchedRequest {
    /// Captured path parameter by name.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name)
    }
}
