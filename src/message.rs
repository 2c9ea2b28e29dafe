//! Request and response model shared by the matcher, the gateway and the wire.
//!
//! Intercepted traffic is always fully buffered: handlers match on bodies and
//! the remote protocol ships whole messages, so both types own their bytes.

use crate::error::ValidationError;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::Serialize;
use url::Url;

/// A buffered HTTP request seen by an interceptor.
#[derive(Debug, Clone)]
pub struct InterceptedRequest {
    /// Request method
    pub method: Method,
    /// Absolute request URL
    pub url: Url,
    /// Request headers
    pub headers: HeaderMap,
    /// Buffered body
    pub body: Bytes,
}

impl InterceptedRequest {
    /// Build a request with no headers and an empty body.
    ///
    /// # Errors
    ///
    /// [`ValidationError::InvalidUrl`] when `url` is not absolute.
    pub fn new(method: Method, url: &str) -> Result<Self, ValidationError> {
        let url = Url::parse(url).map_err(|err| ValidationError::InvalidUrl {
            url: url.to_string(),
            details: err.to_string(),
        })?;
        Ok(Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        })
    }

    /// Rebuild an absolute request from server-side parts.
    ///
    /// The authority comes from the URI when present, then the `Host` header,
    /// then `fallback_authority` (the listener address).
    pub fn from_parts(
        parts: &http::request::Parts,
        body: Bytes,
        fallback_authority: &str,
    ) -> Result<Self, ValidationError> {
        let authority = parts
            .uri
            .authority()
            .map(|a| a.as_str().to_string())
            .or_else(|| {
                parts
                    .headers
                    .get(HOST)
                    .and_then(|h| h.to_str().ok())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| fallback_authority.to_string());
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let raw = format!("http://{authority}{path_and_query}");
        let url = Url::parse(&raw).map_err(|err| ValidationError::InvalidUrl {
            url: raw.clone(),
            details: err.to_string(),
        })?;
        Ok(Self {
            method: parts.method.clone(),
            url,
            headers: parts.headers.clone(),
            body,
        })
    }

    /// Add a header. Names or values that are not valid HTTP are dropped.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            (Ok(name), Ok(value)) => {
                self.headers.append(name, value);
            }
            _ => tracing::warn!(header = %name, "Dropping invalid header on intercepted request"),
        }
        self
    }

    /// Replace the body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Replace the body with JSON and set `content-type`.
    pub fn with_json<T: Serialize>(self, value: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(value)?;
        Ok(self
            .with_header(CONTENT_TYPE.as_str(), "application/json")
            .with_body(body))
    }

    /// URL path, percent-encoded as received.
    ///
    /// Handler patterns and server prefix routing both compare this encoded
    /// form; only captured parameter values are decoded.
    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// First value of a header, if it is valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Decoded query pairs in request order.
    pub fn search_params(&self) -> Vec<(String, String)> {
        self.url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    /// Body as UTF-8 text.
    pub fn body_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Body parsed as JSON.
    pub fn body_json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

/// A synthetic or forwarded HTTP response.
#[derive(Debug, Clone, PartialEq)]
pub struct MockResponse {
    /// Status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: Bytes,
}

impl Default for MockResponse {
    fn default() -> Self {
        Self::new(StatusCode::OK)
    }
}

impl MockResponse {
    /// Empty response with the given status.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Empty `200 OK`.
    pub fn ok() -> Self {
        Self::new(StatusCode::OK)
    }

    /// Add a header. Names or values that are not valid HTTP are dropped.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            (Ok(name), Ok(value)) => {
                self.headers.append(name, value);
            }
            _ => tracing::warn!(header = %name, "Dropping invalid header on mock response"),
        }
        self
    }

    /// Replace the body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Text body; sets `content-type: text/plain` unless already set.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.headers
            .entry(CONTENT_TYPE)
            .or_insert(HeaderValue::from_static("text/plain; charset=utf-8"));
        self.body = Bytes::from(text.into());
        self
    }

    /// JSON body; sets `content-type: application/json` unless already set.
    pub fn with_json(mut self, value: &serde_json::Value) -> Self {
        self.headers
            .entry(CONTENT_TYPE)
            .or_insert(HeaderValue::from_static("application/json"));
        self.body = Bytes::from(value.to_string());
        self
    }

    /// First value of a header, if it is valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Body as UTF-8 text.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Body parsed as JSON.
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.body).ok()
    }

    /// Convert into an `http` response.
    pub fn into_http(self) -> http::Response<Bytes> {
        let mut response = http::Response::new(self.body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}
