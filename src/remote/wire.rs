//! Wire protocol between the interceptor server and its clients.
//!
//! Every frame is a WebSocket text message holding one JSON object with a
//! `type` field: `rpc` (server asks a client to decide a request), `reply`
//! (the client's decision, same `id`), or `control` (everything else,
//! discriminated by `name`). Bodies travel base64-encoded.
//!
//! Headers are `[name, value]` pairs. A value that is not valid UTF-8 is
//! sent as `[name, base64, "base64"]` so its bytes arrive unchanged.

use crate::decision::Decision;
use crate::error::WireError;
use crate::message::{InterceptedRequest, MockResponse};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WireMessage {
    /// A request the receiving client must decide.
    Rpc {
        /// Correlation id
        id: u64,
        /// The serialized request
        payload: RequestPayload,
    },
    /// The decision for an earlier `rpc` frame.
    Reply {
        /// Correlation id of the `rpc` frame
        id: u64,
        /// The decision
        payload: ReplyPayload,
    },
    /// A control frame.
    Control(ControlMessage),
}

impl WireMessage {
    /// Encode as a JSON text frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, WireError> {
        serde_json::from_str(text).map_err(|err| WireError::Malformed {
            details: err.to_string(),
        })
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Rpc { .. } => "rpc",
            WireMessage::Reply { .. } => "reply",
            WireMessage::Control(control) => control.name(),
        }
    }
}

impl From<ControlMessage> for WireMessage {
    fn from(control: ControlMessage) -> Self {
        WireMessage::Control(control)
    }
}

/// Control frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// First client frame: credentials and the prefixes to own.
    Auth {
        /// Plaintext token, if the client has one
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        /// Prefixes to claim atomically
        #[serde(default)]
        prefixes: Vec<String>,
    },
    /// Handshake accepted.
    AuthAccepted {
        /// Id assigned to the connection
        connection_id: String,
    },
    /// Handshake refused; the server closes right after.
    AuthRejected {
        /// Why
        reason: String,
    },
    /// Claim another prefix on an established connection.
    Claim {
        /// Prefix to claim
        prefix: String,
        /// Echoed in the answer so concurrent claims resolve independently
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
    },
    /// A `claim` succeeded.
    ClaimAccepted {
        /// Claimed prefix, normalised
        prefix: String,
        /// `request_id` of the claim
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
    },
    /// A `claim` failed.
    ClaimRejected {
        /// Requested prefix
        prefix: String,
        /// Why
        reason: String,
        /// `request_id` of the claim
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
    },
    /// Give up a prefix.
    Release {
        /// Prefix to release
        prefix: String,
    },
    /// The request behind an `rpc` frame was abandoned.
    Cancel {
        /// Correlation id
        id: u64,
    },
}

impl ControlMessage {
    /// Wire name of the control frame.
    pub fn name(&self) -> &'static str {
        match self {
            ControlMessage::Auth { .. } => "auth",
            ControlMessage::AuthAccepted { .. } => "auth-accepted",
            ControlMessage::AuthRejected { .. } => "auth-rejected",
            ControlMessage::Claim { .. } => "claim",
            ControlMessage::ClaimAccepted { .. } => "claim-accepted",
            ControlMessage::ClaimRejected { .. } => "claim-rejected",
            ControlMessage::Release { .. } => "release",
            ControlMessage::Cancel { .. } => "cancel",
        }
    }
}

/// A serialized request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPayload {
    /// Method name
    pub method: String,
    /// Absolute URL
    pub url: String,
    /// Header pairs in order; repeated names are repeated pairs
    #[serde(default)]
    pub headers: Vec<HeaderEntry>,
    /// Base64 body
    #[serde(default)]
    pub body: String,
}

impl RequestPayload {
    /// Serialize an intercepted request.
    pub fn from_request(request: &InterceptedRequest) -> Self {
        Self {
            method: request.method.to_string(),
            url: request.url.to_string(),
            headers: header_pairs(&request.headers),
            body: encode_body(&request.body),
        }
    }

    /// Rebuild the intercepted request.
    pub fn into_request(self) -> Result<InterceptedRequest, WireError> {
        let method = Method::from_bytes(self.method.as_bytes()).map_err(|err| WireError::InvalidField {
            field: "method",
            details: err.to_string(),
        })?;
        let mut request = InterceptedRequest::new(method, &self.url).map_err(|err| WireError::InvalidField {
            field: "url",
            details: err.to_string(),
        })?;
        request.headers = header_map(&self.headers)?;
        request.body = decode_body(&self.body)?;
        Ok(request)
    }
}

/// A serialized response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponsePayload {
    /// Status code
    pub status: u16,
    /// Header pairs in order
    #[serde(default)]
    pub headers: Vec<HeaderEntry>,
    /// Base64 body
    #[serde(default)]
    pub body: String,
}

impl ResponsePayload {
    /// Serialize a response.
    pub fn from_response(response: &MockResponse) -> Self {
        Self {
            status: response.status.as_u16(),
            headers: header_pairs(&response.headers),
            body: encode_body(&response.body),
        }
    }

    /// Rebuild the response.
    pub fn into_response(self) -> Result<MockResponse, WireError> {
        let status = StatusCode::from_u16(self.status).map_err(|err| WireError::InvalidField {
            field: "status",
            details: err.to_string(),
        })?;
        Ok(MockResponse {
            status,
            headers: header_map(&self.headers)?,
            body: decode_body(&self.body)?,
        })
    }
}

/// How a binary header value is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderEncoding {
    /// Standard base64 with padding
    Base64,
}

/// One header on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderEntry {
    /// `[name, value, encoding]` for values that are not UTF-8.
    Binary(String, String, HeaderEncoding),
    /// `[name, value]`
    Text(String, String),
}

impl HeaderEntry {
    /// A plain text header.
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        HeaderEntry::Text(name.into(), value.into())
    }

    fn from_header(name: &HeaderName, value: &HeaderValue) -> Self {
        match std::str::from_utf8(value.as_bytes()) {
            Ok(text) => HeaderEntry::Text(name.as_str().to_string(), text.to_string()),
            Err(_) => HeaderEntry::Binary(
                name.as_str().to_string(),
                STANDARD.encode(value.as_bytes()),
                HeaderEncoding::Base64,
            ),
        }
    }

    fn to_header(&self) -> Result<(HeaderName, HeaderValue), WireError> {
        let (name, value) = match self {
            HeaderEntry::Text(name, value) => (name, HeaderValue::from_str(value)),
            HeaderEntry::Binary(name, encoded, HeaderEncoding::Base64) => {
                let bytes = STANDARD.decode(encoded).map_err(|err| WireError::InvalidField {
                    field: "header value",
                    details: err.to_string(),
                })?;
                (name, HeaderValue::from_bytes(&bytes))
            }
        };
        let name = HeaderName::try_from(name.as_str()).map_err(|err| WireError::InvalidField {
            field: "header name",
            details: err.to_string(),
        })?;
        let value = value.map_err(|err| WireError::InvalidField {
            field: "header value",
            details: err.to_string(),
        })?;
        Ok((name, value))
    }
}

/// A client's decision for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum ReplyPayload {
    /// Answer with this response.
    Respond {
        /// The response
        response: ResponsePayload,
    },
    /// Apply the server's fallback.
    Bypass,
    /// Answer with the server's reject status.
    Reject {
        /// Why
        reason: String,
    },
}

impl ReplyPayload {
    /// Serialize a decision.
    pub fn from_decision(decision: &Decision) -> Self {
        match decision {
            Decision::Respond(response) => ReplyPayload::Respond {
                response: ResponsePayload::from_response(response),
            },
            Decision::Bypass => ReplyPayload::Bypass,
            Decision::Reject { reason } => ReplyPayload::Reject {
                reason: reason.clone(),
            },
        }
    }

    /// Rebuild the decision.
    pub fn into_decision(self) -> Result<Decision, WireError> {
        Ok(match self {
            ReplyPayload::Respond { response } => Decision::Respond(response.into_response()?),
            ReplyPayload::Bypass => Decision::Bypass,
            ReplyPayload::Reject { reason } => Decision::Reject { reason },
        })
    }
}

fn header_pairs(headers: &HeaderMap) -> Vec<HeaderEntry> {
    headers
        .iter()
        .map(|(name, value)| HeaderEntry::from_header(name, value))
        .collect()
}

fn header_map(entries: &[HeaderEntry]) -> Result<HeaderMap, WireError> {
    let mut headers = HeaderMap::with_capacity(entries.len());
    for entry in entries {
        let (name, value) = entry.to_header()?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn encode_body(body: &Bytes) -> String {
    STANDARD.encode(body)
}

fn decode_body(body: &str) -> Result<Bytes, WireError> {
    STANDARD
        .decode(body)
        .map(Bytes::from)
        .map_err(|err| WireError::InvalidField {
            field: "body",
            details: err.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[test]
    fn test_frames_use_documented_shape() {
        let rpc = WireMessage::Rpc {
            id: 7,
            payload: RequestPayload {
                method: "GET".to_string(),
                url: "http://api.test/run-1/users".to_string(),
                headers: vec![HeaderEntry::text("accept", "text/plain")],
                body: String::new(),
            },
        };
        let value: Value = serde_json::from_str(&rpc.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "rpc");
        assert_eq!(value["id"], 7);
        assert_eq!(value["payload"]["headers"][0], json!(["accept", "text/plain"]));

        let cancel = WireMessage::from(ControlMessage::Cancel { id: 7 });
        let value: Value = serde_json::from_str(&cancel.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "control", "name": "cancel", "id": 7}));

        let bypass = WireMessage::Reply {
            id: 3,
            payload: ReplyPayload::Bypass,
        };
        let value: Value = serde_json::from_str(&bypass.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "reply", "id": 3, "payload": {"decision": "bypass"}}));
    }

    #[test]
    fn test_decodes_handwritten_frames() {
        let auth = WireMessage::decode(r#"{"type":"control","name":"auth","token":"abc.def","prefixes":["/run-1"]}"#)
            .unwrap();
        assert_eq!(
            auth,
            WireMessage::Control(ControlMessage::Auth {
                token: Some("abc.def".to_string()),
                prefixes: vec!["/run-1".to_string()],
            })
        );

        let anonymous = WireMessage::decode(r#"{"type":"control","name":"auth"}"#).unwrap();
        assert_eq!(
            anonymous,
            WireMessage::Control(ControlMessage::Auth {
                token: None,
                prefixes: Vec::new(),
            })
        );

        let claim = WireMessage::decode(r#"{"type":"control","name":"claim","prefix":"/run-2","request_id":4}"#).unwrap();
        assert_eq!(
            claim,
            WireMessage::Control(ControlMessage::Claim {
                prefix: "/run-2".to_string(),
                request_id: Some(4),
            })
        );
        let accepted = WireMessage::from(ControlMessage::ClaimAccepted {
            prefix: "/run-2".to_string(),
            request_id: Some(4),
        });
        let value: Value = serde_json::from_str(&accepted.encode().unwrap()).unwrap();
        assert_eq!(value["request_id"], 4);

        let reject = WireMessage::decode(
            r#"{"type":"reply","id":9,"payload":{"decision":"reject","reason":"nope"}}"#,
        )
        .unwrap();
        assert_eq!(reject.kind(), "reply");
    }

    #[test]
    fn test_malformed_frames_are_errors() {
        for text in [
            "not json",
            r#"{"type":"bogus"}"#,
            r#"{"type":"control","name":"unknown"}"#,
            r#"{"type":"reply","id":1,"payload":{"decision":"maybe"}}"#,
        ] {
            assert!(matches!(WireMessage::decode(text), Err(WireError::Malformed { .. })), "{text}");
        }
    }

    #[test]
    fn test_request_payload_preserves_body_and_repeated_headers() {
        let request = InterceptedRequest::new(Method::POST, "http://api.test/upload?x=1")
            .unwrap()
            .with_header("x-tag", "a")
            .with_header("x-tag", "b")
            .with_body(vec![0u8, 159, 146, 150]);

        let payload = RequestPayload::from_request(&request);
        assert_eq!(payload.body, "AJ+Slg==");

        let rebuilt = payload.into_request().unwrap();
        assert_eq!(rebuilt.method, Method::POST);
        assert_eq!(rebuilt.url.as_str(), "http://api.test/upload?x=1");
        assert_eq!(rebuilt.body.as_ref(), &[0u8, 159, 146, 150]);
        let tags: Vec<_> = rebuilt.headers.get_all("x-tag").iter().collect();
        assert_eq!(tags, ["a", "b"]);
    }

    #[test]
    fn test_non_utf8_header_bytes_survive_transit() {
        let mut response = MockResponse::ok();
        response
            .headers
            .append("x-name", HeaderValue::from_bytes(&[99, 97, 102, 233]).unwrap());
        response.headers.append("x-name", HeaderValue::from_static("plain"));

        let payload = ResponsePayload::from_response(&response);
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["headers"][0], json!(["x-name", "Y2Fm6Q==", "base64"]));
        assert_eq!(value["headers"][1], json!(["x-name", "plain"]));

        let decoded: ResponsePayload = serde_json::from_value(value).unwrap();
        let rebuilt = decoded.into_response().unwrap();
        let values: Vec<&[u8]> = rebuilt.headers.get_all("x-name").iter().map(|v| v.as_bytes()).collect();
        assert_eq!(values, [&[99u8, 97, 102, 233][..], b"plain"]);
    }

    #[test]
    fn test_invalid_fields_are_reported() {
        let bad_status = ResponsePayload {
            status: 42,
            headers: Vec::new(),
            body: String::new(),
        };
        assert!(matches!(
            bad_status.into_response(),
            Err(WireError::InvalidField { field: "status", .. })
        ));

        let bad_body = ReplyPayload::Respond {
            response: ResponsePayload {
                status: 200,
                headers: Vec::new(),
                body: "***".to_string(),
            },
        };
        assert!(matches!(
            bad_body.into_decision(),
            Err(WireError::InvalidField { field: "body", .. })
        ));

        let bad_header = ResponsePayload {
            status: 200,
            headers: vec![HeaderEntry::Binary("x-raw".to_string(), "***".to_string(), HeaderEncoding::Base64)],
            body: String::new(),
        };
        assert!(matches!(
            bad_header.into_response(),
            Err(WireError::InvalidField { field: "header value", .. })
        ));
    }

    #[test]
    fn test_decision_conversion() {
        let decision = Decision::Respond(MockResponse::new(StatusCode::CREATED).with_text("made"));
        let back = ReplyPayload::from_decision(&decision).into_decision().unwrap();
        assert_eq!(back, decision);
    }
}
