//! Request restrictions beyond method and path.
//!
//! Checked in a fixed order: headers, search params, body, then custom
//! predicates. The first failing check short-circuits.

use super::MatchedRequest;
use crate::message::InterceptedRequest;
use http::{HeaderName, HeaderValue};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub(crate) type BodyPredicate = Arc<dyn Fn(&InterceptedRequest) -> bool + Send + Sync>;
pub(crate) type RequestPredicate = Arc<dyn Fn(&MatchedRequest) -> bool + Send + Sync>;

#[derive(Clone)]
pub(crate) enum BodyRestriction {
    Json(Value),
    Text(String),
    Predicate(BodyPredicate),
}

/// The restriction set of one handler.
#[derive(Clone, Default)]
pub struct Restrictions {
    pub(crate) headers: Vec<(HeaderName, HeaderValue)>,
    pub(crate) search_params: Vec<(String, Vec<String>)>,
    pub(crate) body: Option<BodyRestriction>,
    pub(crate) predicates: Vec<RequestPredicate>,
    pub(crate) exact: bool,
}

impl fmt::Debug for Restrictions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = match &self.body {
            None => "none",
            Some(BodyRestriction::Json(_)) => "json",
            Some(BodyRestriction::Text(_)) => "text",
            Some(BodyRestriction::Predicate(_)) => "predicate",
        };
        f.debug_struct("Restrictions")
            .field("headers", &self.headers)
            .field("search_params", &self.search_params)
            .field("body", &body)
            .field("predicates", &self.predicates.len())
            .field("exact", &self.exact)
            .finish()
    }
}

impl Restrictions {
    /// `true` when no restriction was declared.
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
            && self.search_params.is_empty()
            && self.body.is_none()
            && self.predicates.is_empty()
    }

    /// Check every restriction against a request.
    pub fn is_satisfied_by(&self, matched: &MatchedRequest) -> bool {
        self.headers_match(&matched.request)
            && self.search_params_match(&matched.request)
            && self.body_matches(&matched.request)
            && self.predicates.iter().all(|predicate| predicate(matched))
    }

    fn headers_match(&self, request: &InterceptedRequest) -> bool {
        self.headers.iter().all(|(name, expected)| {
            request
                .headers
                .get_all(name)
                .iter()
                .any(|actual| actual == expected)
        })
    }

    fn search_params_match(&self, request: &InterceptedRequest) -> bool {
        if self.search_params.is_empty() && !self.exact {
            return true;
        }
        let mut actual: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (key, value) in request.search_params() {
            actual.entry(key).or_default().push(value);
        }
        let declared_match = self
            .search_params
            .iter()
            .all(|(key, values)| actual.get(key) == Some(values));
        if !declared_match {
            return false;
        }
        !self.exact
            || actual
                .keys()
                .all(|key| self.search_params.iter().any(|(k, _)| k == key))
    }

    fn body_matches(&self, request: &InterceptedRequest) -> bool {
        match &self.body {
            None => true,
            Some(BodyRestriction::Text(expected)) => request.body_text() == Some(expected.as_str()),
            Some(BodyRestriction::Predicate(predicate)) => predicate(request),
            Some(BodyRestriction::Json(expected)) => match request.body_json() {
                Some(actual) if self.exact => actual == *expected,
                Some(actual) => json_contains(&actual, expected),
                None => false,
            },
        }
    }
}

/// Structural containment: every key of `expected` objects must be present in
/// `actual` with a containing value. Arrays and scalars compare element-wise.
fn json_contains(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Object(actual), Value::Object(expected)) => expected
            .iter()
            .all(|(key, value)| actual.get(key).is_some_and(|a| json_contains(a, value))),
        (Value::Array(actual), Value::Array(expected)) => {
            actual.len() == expected.len()
                && actual.iter().zip(expected).all(|(a, e)| json_contains(a, e))
        }
        _ => actual == expected,
    }
}
