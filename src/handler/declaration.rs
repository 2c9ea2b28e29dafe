//! Handler declarations.
//!
//! A declaration is built fluently and then handed to
//! [`HandlerRegistry::register`](super::HandlerRegistry::register):
//!
//! ```
//! use stubgate::handler::HandlerDeclaration;
//! use stubgate::message::MockResponse;
//! use serde_json::json;
//!
//! let declaration = HandlerDeclaration::get("/users/:id")
//!     .unwrap()
//!     .with_header("accept", "application/json")
//!     .respond_with(MockResponse::ok().with_json(&json!({"id": 1})))
//!     .times(2);
//! assert_eq!(declaration.usage().min, 2);
//! ```
//!
//! The usage bounds remember where they were declared (`#[track_caller]`) so
//! an unmet `times` names the test line that asked for it.

use super::restriction::{BodyRestriction, Restrictions};
use super::response::{DelaySpec, ResponseSpec};
use super::MatchedRequest;
use crate::error::ValidationError;
use crate::message::{InterceptedRequest, MockResponse};
use crate::path_pattern::PathPattern;
use http::{HeaderName, HeaderValue, Method};
use std::fmt;
use std::panic::Location;
use std::sync::Arc;
use std::time::Duration;

/// Which request methods a handler accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodFilter {
    /// Every method.
    Any,
    /// Exactly this method.
    Only(Method),
}

impl MethodFilter {
    /// `true` when the filter accepts `method`.
    pub fn matches(&self, method: &Method) -> bool {
        match self {
            MethodFilter::Any => true,
            MethodFilter::Only(expected) => expected == method,
        }
    }
}

impl From<Method> for MethodFilter {
    fn from(method: Method) -> Self {
        MethodFilter::Only(method)
    }
}

impl fmt::Display for MethodFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodFilter::Any => f.write_str("ANY"),
            MethodFilter::Only(method) => f.write_str(method.as_str()),
        }
    }
}

/// Usage bounds `{min, max}`; `max: None` is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsageBounds {
    /// Calls required by [`check_times`](super::HandlerRegistry::check_times)
    pub min: usize,
    /// Calls after which the handler stops matching
    pub max: Option<usize>,
}

impl UsageBounds {
    /// `true` once `call_count` reached `max`.
    pub fn is_exhausted(&self, call_count: usize) -> bool {
        self.max.is_some_and(|max| call_count >= max)
    }
}

/// One declared handler.
#[derive(Debug, Clone)]
pub struct HandlerDeclaration {
    pub(crate) method: MethodFilter,
    pub(crate) pattern: PathPattern,
    pub(crate) restrictions: Restrictions,
    pub(crate) response: Option<ResponseSpec>,
    pub(crate) delay: DelaySpec,
    pub(crate) usage: UsageBounds,
    pub(crate) declared_at: &'static Location<'static>,
}

impl HandlerDeclaration {
    /// Declare a handler for `method` requests to `template`.
    ///
    /// # Errors
    ///
    /// [`ValidationError`] when the template does not compile.
    #[track_caller]
    pub fn new(method: impl Into<MethodFilter>, template: &str) -> Result<Self, ValidationError> {
        Ok(Self {
            method: method.into(),
            pattern: PathPattern::compile(template)?,
            restrictions: Restrictions::default(),
            response: None,
            delay: DelaySpec::None,
            usage: UsageBounds::default(),
            declared_at: Location::caller(),
        })
    }

    /// Handler accepting any method.
    #[track_caller]
    pub fn any(template: &str) -> Result<Self, ValidationError> {
        Self::new(MethodFilter::Any, template)
    }

    /// `GET` handler.
    #[track_caller]
    pub fn get(template: &str) -> Result<Self, ValidationError> {
        Self::new(Method::GET, template)
    }

    /// `POST` handler.
    #[track_caller]
    pub fn post(template: &str) -> Result<Self, ValidationError> {
        Self::new(Method::POST, template)
    }

    /// `PUT` handler.
    #[track_caller]
    pub fn put(template: &str) -> Result<Self, ValidationError> {
        Self::new(Method::PUT, template)
    }

    /// `PATCH` handler.
    #[track_caller]
    pub fn patch(template: &str) -> Result<Self, ValidationError> {
        Self::new(Method::PATCH, template)
    }

    /// `DELETE` handler.
    #[track_caller]
    pub fn delete(template: &str) -> Result<Self, ValidationError> {
        Self::new(Method::DELETE, template)
    }

    /// Require a header value. Invalid names or values never match.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            (Ok(name), Ok(value)) => self.restrictions.headers.push((name, value)),
            _ => {
                tracing::warn!(header = %name, "Invalid header restriction, handler will not match");
                self.restrictions.predicates.push(Arc::new(|_: &MatchedRequest| false));
            }
        }
        self
    }

    /// Require a single-valued search param.
    pub fn with_search_param(self, key: &str, value: &str) -> Self {
        self.with_search_params(key, [value])
    }

    /// Require a search param to carry exactly these values, in order.
    pub fn with_search_params<I, S>(mut self, key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.restrictions
            .search_params
            .push((key.to_string(), values.into_iter().map(Into::into).collect()));
        self
    }

    /// Require a JSON body containing (or, with [`exact`](Self::exact), equal to) `value`.
    pub fn with_json_body(mut self, value: serde_json::Value) -> Self {
        self.restrictions.body = Some(BodyRestriction::Json(value));
        self
    }

    /// Require a text body.
    pub fn with_text_body(mut self, text: impl Into<String>) -> Self {
        self.restrictions.body = Some(BodyRestriction::Text(text.into()));
        self
    }

    /// Require the request to satisfy a body predicate.
    pub fn with_body_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&InterceptedRequest) -> bool + Send + Sync + 'static,
    {
        self.restrictions.body = Some(BodyRestriction::Predicate(Arc::new(predicate)));
        self
    }

    /// Require a custom predicate over the matched request.
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&MatchedRequest) -> bool + Send + Sync + 'static,
    {
        self.restrictions.predicates.push(Arc::new(predicate));
        self
    }

    /// Search params must not carry undeclared keys and JSON bodies must be equal.
    pub fn exact(mut self) -> Self {
        self.restrictions.exact = true;
        self
    }

    /// Answer with a fixed response.
    pub fn respond_with(mut self, response: MockResponse) -> Self {
        self.response = Some(ResponseSpec::Static(response));
        self
    }

    /// Answer with a response computed from the request.
    pub fn respond_with_fn<F>(mut self, factory: F) -> Self
    where
        F: Fn(&MatchedRequest) -> MockResponse + Send + Sync + 'static,
    {
        self.response = Some(ResponseSpec::Factory(Arc::new(factory)));
        self
    }

    /// Wait a fixed duration before answering.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = DelaySpec::Fixed(delay);
        self
    }

    /// Wait a uniformly random duration before answering.
    pub fn delay_between(mut self, min: Duration, max: Duration) -> Self {
        self.delay = DelaySpec::range(min, max);
        self
    }

    /// Wait a duration computed from the request.
    pub fn delay_with<F>(mut self, delay: F) -> Self
    where
        F: Fn(&MatchedRequest) -> Duration + Send + Sync + 'static,
    {
        self.delay = DelaySpec::Computed(Arc::new(delay));
        self
    }

    /// Match exactly `n` requests.
    #[track_caller]
    pub fn times(mut self, n: usize) -> Self {
        self.usage = UsageBounds {
            min: n,
            max: Some(n),
        };
        self.declared_at = Location::caller();
        self
    }

    /// Match one request.
    #[track_caller]
    pub fn once(self) -> Self {
        self.times(1)
    }

    /// Match between `min` and `max` requests.
    ///
    /// # Errors
    ///
    /// [`ValidationError::InvalidTimes`] when `min > max`.
    #[track_caller]
    pub fn times_between(mut self, min: usize, max: usize) -> Result<Self, ValidationError> {
        if min > max {
            return Err(ValidationError::InvalidTimes { min, max });
        }
        self.usage = UsageBounds {
            min,
            max: Some(max),
        };
        self.declared_at = Location::caller();
        Ok(self)
    }

    /// Require at least `min` requests, with no upper bound.
    #[track_caller]
    pub fn times_at_least(mut self, min: usize) -> Self {
        self.usage = UsageBounds { min, max: None };
        self.declared_at = Location::caller();
        self
    }

    /// Method filter.
    pub fn method(&self) -> &MethodFilter {
        &self.method
    }

    /// Compiled path pattern.
    pub fn pattern(&self) -> &PathPattern {
        &self.pattern
    }

    /// Declared usage bounds.
    pub fn usage(&self) -> UsageBounds {
        self.usage
    }

    /// Where the declaration (or its usage bounds) was written.
    pub fn declared_at(&self) -> &'static Location<'static> {
        self.declared_at
    }

    /// `METHOD /template`, used in diagnostics.
    pub fn describe(&self) -> String {
        format!("{} {}", self.method, self.pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_times_records_caller_location() {
        let declaration = HandlerDeclaration::get("/a").unwrap();
        let created_line = declaration.declared_at().line();

        let line = line!() + 1;
        let declaration = declaration.times(2);
        assert_eq!(declaration.declared_at().line(), line);
        assert_ne!(declaration.declared_at().line(), created_line);
        assert!(declaration.declared_at().file().ends_with("declaration.rs"));
    }

    #[test]
    fn test_times_between_validates_bounds() {
        let err = HandlerDeclaration::get("/a")
            .unwrap()
            .times_between(3, 1)
            .unwrap_err();
        assert_eq!(err, ValidationError::InvalidTimes { min: 3, max: 1 });
    }

    #[test]
    fn test_usage_bounds_exhaustion() {
        let unbounded = UsageBounds::default();
        assert!(!unbounded.is_exhausted(1_000));

        let bounded = UsageBounds { min: 0, max: Some(2) };
        assert!(!bounded.is_exhausted(1));
        assert!(bounded.is_exhausted(2));
    }

    #[test]
    fn test_method_filter() {
        assert!(MethodFilter::Any.matches(&Method::DELETE));
        assert!(MethodFilter::from(Method::GET).matches(&Method::GET));
        assert!(!MethodFilter::from(Method::GET).matches(&Method::POST));
        assert_eq!(
            HandlerDeclaration::any("/x").unwrap().describe(),
            "ANY /x"
        );
    }

    #[test]
    fn test_invalid_template_surfaces_at_declaration() {
        let err = HandlerDeclaration::post("/a/:id/:id").unwrap_err();
        assert!(matches!(err, ValidationError::DuplicateParameter { .. }));
    }
}
