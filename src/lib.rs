//! stubgate - Declarative HTTP interception for tests.
//!
//! Tests declare handlers (method, path pattern, restrictions, response,
//! delay, expected call counts) against a base URL. Requests are then
//! resolved either in-process, through an [`InterceptorContext`], or by a
//! separate [`InterceptorServer`] that routes real HTTP traffic to the
//! client owning the request's path prefix.
//!
//! # Resolution
//!
//! Every intercepted request ends in one [`Decision`]:
//!
//! - **Respond:** the newest matching handler's response.
//! - **Bypass:** let the request through to the real network (or the
//!   server's fallback).
//! - **Reject:** fail the request with a reason.
//!
//! ```
//! use std::sync::Arc;
//! use stubgate::context::InterceptorContext;
//! use stubgate::gateway::InterceptionGateway;
//! use stubgate::handler::{HandlerDeclaration, HandlerRegistry};
//! use stubgate::message::{InterceptedRequest, MockResponse};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let registry = HandlerRegistry::new();
//! registry
//!     .register(
//!         HandlerDeclaration::get("/users/:id")
//!             .unwrap()
//!             .respond_with(MockResponse::ok().with_text("hi")),
//!     )
//!     .await;
//! let gateway = InterceptionGateway::new("http://api.test", registry).unwrap();
//! gateway.start();
//!
//! let context = InterceptorContext::new();
//! context.register(Arc::new(gateway)).await;
//!
//! let request = InterceptedRequest::new(http::Method::GET, "http://api.test/users/7").unwrap();
//! let decision = context.dispatch(&request).await.unwrap();
//! assert_eq!(decision.response().unwrap().text(), Some("hi"));
//! # }
//! ```

pub mod config;
pub mod context;
pub mod decision;
pub mod error;
pub mod gateway;
pub mod handler;
pub mod logging;
pub mod message;
pub mod path_pattern;
pub mod remote;
pub mod timeout;

pub use context::InterceptorContext;
pub use decision::Decision;
pub use error::{InterceptorError, Result};
pub use gateway::{InterceptionGateway, UnhandledPolicy};
pub use handler::{HandlerDeclaration, HandlerRegistry};
pub use message::{InterceptedRequest, MockResponse};
pub use remote::{InterceptorServer, RemoteClient};
