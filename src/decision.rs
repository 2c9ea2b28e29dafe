//! Interception decisions.
//!
//! Every intercepted request ends in exactly one of three outcomes:
//!
//! - **Respond**: a handler matched; answer with its response
//! - **Bypass**: send the request to the real network instead
//! - **Reject**: answer with a synthetic failure
//!
//! The local gateway acts on the decision itself; in remote mode the decision
//! travels back over the wire and the server acts on it.

use crate::message::MockResponse;

/// Outcome of intercepting one request.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// A handler matched.
    Respond(MockResponse),

    /// No handler matched; forward to the real network.
    Bypass,

    /// No handler matched; fail the request.
    Reject {
        /// Reason for rejection (safe for logging)
        reason: String,
    },
}

impl Decision {
    /// Returns `true` if a handler produced the response.
    pub fn is_respond(&self) -> bool {
        matches!(self, Decision::Respond(_))
    }

    /// Returns `true` if the request goes to the real network.
    pub fn is_bypass(&self) -> bool {
        matches!(self, Decision::Bypass)
    }

    /// Returns `true` if the request is failed synthetically.
    pub fn is_reject(&self) -> bool {
        matches!(self, Decision::Reject { .. })
    }

    /// The matched response, if any.
    pub fn response(&self) -> Option<&MockResponse> {
        match self {
            Decision::Respond(response) => Some(response),
            _ => None,
        }
    }
}
