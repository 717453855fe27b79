// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire formats.
//!
//! | Channel | Frames |
//! |---------|--------|
//! | Feed | `[topic, "PUBLISH" \| "HEARTBEAT", nonce, payload]` |
//! | Request / response | `[sender_id, nonce, payload]` |
//! | Recovery request payload | JSON `[topic, n1, n2, ...]` |
//! | Recovery response payload | JSON `[[topic, kind, nonce, payload] \| [CACHE_EXPIRED], ...]` |
//!
//! Nonces travel as decimal strings inside frames and as JSON numbers inside
//! recovery requests.

use crate::transport::Multipart;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Reserved payload: the requested nonce is no longer cached.
pub const CACHE_EXPIRED_SENTINEL: &str = "\u{0}relpub:cache-expired\u{0}";

/// Reserved payload prefix: the request was rejected by the responder.
pub const REJECTED_PREFIX: &str = "\u{0}relpub:rejected\u{0}";

/// Protocol errors (malformed frames or payloads).
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Expected {expected} frames, got {actual}")]
    FrameCount { expected: usize, actual: usize },

    #[error("Unknown message kind: {0}")]
    UnknownKind(String),

    #[error("Invalid nonce: {0}")]
    InvalidNonce(String),

    #[error("Malformed recovery payload: {0}")]
    Malformed(String),

    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    #[error("Request nonce {0} too far ahead of the sender's window")]
    NonceOutOfWindow(u64),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Kind of a feed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Application payload.
    Publish,
    /// Empty payload re-asserting the latest nonce.
    Heartbeat,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Publish => "PUBLISH",
            MessageKind::Heartbeat => "HEARTBEAT",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PUBLISH" => Ok(MessageKind::Publish),
            "HEARTBEAT" => Ok(MessageKind::Heartbeat),
            other => Err(ProtocolError::UnknownKind(other.to_string())),
        }
    }
}

fn parse_nonce(s: &str) -> Result<u64, ProtocolError> {
    s.parse::<u64>()
        .map_err(|_| ProtocolError::InvalidNonce(s.to_string()))
}

/// One feed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub topic: String,
    pub kind: MessageKind,
    pub nonce: u64,
    pub payload: String,
}

impl Envelope {
    /// Build a PUBLISH envelope.
    pub fn publish(topic: impl Into<String>, nonce: u64, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            kind: MessageKind::Publish,
            nonce,
            payload: payload.into(),
        }
    }

    /// Build a HEARTBEAT envelope for the latest nonce of `topic`.
    pub fn heartbeat(topic: impl Into<String>, nonce: u64) -> Self {
        Self {
            topic: topic.into(),
            kind: MessageKind::Heartbeat,
            nonce,
            payload: String::new(),
        }
    }

    /// Encode as feed frames.
    pub fn to_frames(&self) -> Multipart {
        vec![
            self.topic.clone(),
            self.kind.as_str().to_string(),
            self.nonce.to_string(),
            self.payload.clone(),
        ]
    }

    /// Decode feed frames.
    pub fn from_frames(frames: &[String]) -> Result<Self, ProtocolError> {
        let [topic, kind, nonce, payload] = frames else {
            return Err(ProtocolError::FrameCount {
                expected: 4,
                actual: frames.len(),
            });
        };

        Ok(Self {
            topic: topic.clone(),
            kind: kind.parse()?,
            nonce: parse_nonce(nonce)?,
            payload: payload.clone(),
        })
    }

    fn to_json(&self) -> Value {
        Value::Array(self.to_frames().into_iter().map(Value::String).collect())
    }
}

/// One request or response on the request/response channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    /// Client id of the requester (echoed in responses).
    pub sender_id: String,
    /// Per-client request nonce; responses correlate on it.
    pub nonce: u64,
    pub payload: String,
}

impl RequestFrame {
    pub fn new(sender_id: impl Into<String>, nonce: u64, payload: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            nonce,
            payload: payload.into(),
        }
    }

    pub fn to_frames(&self) -> Multipart {
        vec![
            self.sender_id.clone(),
            self.nonce.to_string(),
            self.payload.clone(),
        ]
    }

    pub fn from_frames(frames: &[String]) -> Result<Self, ProtocolError> {
        let [sender_id, nonce, payload] = frames else {
            return Err(ProtocolError::FrameCount {
                expected: 3,
                actual: frames.len(),
            });
        };

        Ok(Self {
            sender_id: sender_id.clone(),
            nonce: parse_nonce(nonce)?,
            payload: payload.clone(),
        })
    }
}

/// Encode a rejection reply payload.
pub fn encode_rejection(reason: &str) -> String {
    format!("{REJECTED_PREFIX}{reason}")
}

/// Reason carried by a rejection reply payload, if it is one.
pub fn decode_rejection(payload: &str) -> Option<&str> {
    payload.strip_prefix(REJECTED_PREFIX)
}

/// Request for retransmission of specific nonces of one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryRequest {
    pub topic: String,
    pub nonces: Vec<u64>,
}

impl RecoveryRequest {
    pub fn new(topic: impl Into<String>, nonces: Vec<u64>) -> Self {
        Self {
            topic: topic.into(),
            nonces,
        }
    }

    /// Encode as JSON `[topic, n1, n2, ...]`.
    pub fn encode(&self) -> String {
        let mut items = Vec::with_capacity(self.nonces.len() + 1);
        items.push(Value::String(self.topic.clone()));
        items.extend(self.nonces.iter().map(|n| Value::from(*n)));
        Value::Array(items).to_string()
    }

    pub fn decode(payload: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(payload)?;
        let Value::Array(items) = value else {
            return Err(ProtocolError::Malformed("expected a JSON array".into()));
        };

        let mut items = items.into_iter();
        let topic = match items.next() {
            Some(Value::String(topic)) => topic,
            _ => {
                return Err(ProtocolError::Malformed(
                    "first element must be the topic".into(),
                ))
            }
        };

        let nonces = items
            .map(|item| {
                item.as_u64()
                    .ok_or_else(|| ProtocolError::InvalidNonce(item.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { topic, nonces })
    }
}

/// Outcome of one requested nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveredItem {
    /// The cached envelope.
    Found(Envelope),
    /// The nonce expired from the publisher's cache.
    Expired,
}

/// Encode a recovery response, positionally aligned with its request.
pub fn encode_recovery_response(items: &[RecoveredItem]) -> String {
    let values = items
        .iter()
        .map(|item| match item {
            RecoveredItem::Found(envelope) => envelope.to_json(),
            RecoveredItem::Expired => {
                Value::Array(vec![Value::String(CACHE_EXPIRED_SENTINEL.to_string())])
            }
        })
        .collect();
    Value::Array(values).to_string()
}

/// Decode a recovery response.
pub fn decode_recovery_response(payload: &str) -> Result<Vec<RecoveredItem>, ProtocolError> {
    let outer: Vec<Vec<String>> = serde_json::from_str(payload)?;
    outer
        .into_iter()
        .map(|frames| match frames.as_slice() {
            [sentinel] if sentinel == CACHE_EXPIRED_SENTINEL => Ok(RecoveredItem::Expired),
            _ => Envelope::from_frames(&frames).map(RecoveredItem::Found),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_frames() {
        let envelope = Envelope::publish("prices", 42, "{\"px\":1}");
        let frames = envelope.to_frames();
        assert_eq!(frames, vec!["prices", "PUBLISH", "42", "{\"px\":1}"]);
        assert_eq!(Envelope::from_frames(&frames).expect("decode"), envelope);
    }

    #[test]
    fn test_heartbeat_has_empty_payload() {
        let hb = Envelope::heartbeat("prices", 7);
        assert_eq!(hb.kind, MessageKind::Heartbeat);
        assert!(hb.payload.is_empty());
        assert_eq!(hb.to_frames()[1], "HEARTBEAT");
    }

    #[test]
    fn test_envelope_rejects_bad_frames() {
        let short = vec!["t".to_string(), "PUBLISH".to_string()];
        assert!(matches!(
            Envelope::from_frames(&short),
            Err(ProtocolError::FrameCount {
                expected: 4,
                actual: 2
            })
        ));

        let bad_kind: Vec<String> = ["t", "DATA", "1", ""].iter().map(|s| s.to_string()).collect();
        assert!(matches!(
            Envelope::from_frames(&bad_kind),
            Err(ProtocolError::UnknownKind(_))
        ));

        let bad_nonce: Vec<String> = ["t", "PUBLISH", "-1", ""].iter().map(|s| s.to_string()).collect();
        assert!(matches!(
            Envelope::from_frames(&bad_nonce),
            Err(ProtocolError::InvalidNonce(_))
        ));
    }

    #[test]
    fn test_request_frame_decode() {
        let frames: Vec<String> = ["client-a", "3", "body"].iter().map(|s| s.to_string()).collect();
        let frame = RequestFrame::from_frames(&frames).expect("decode");
        assert_eq!(frame.sender_id, "client-a");
        assert_eq!(frame.nonce, 3);
        assert_eq!(frame.to_frames(), frames);
    }

    #[test]
    fn test_recovery_request_layout() {
        let request = RecoveryRequest::new("prices", vec![3, 4]);
        assert_eq!(request.encode(), r#"["prices",3,4]"#);
        assert_eq!(RecoveryRequest::decode(r#"["prices",3,4]"#).expect("decode"), request);
    }

    #[test]
    fn test_recovery_request_malformed() {
        assert!(matches!(
            RecoveryRequest::decode(r#"{"topic":"x"}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            RecoveryRequest::decode(r#"[1,2]"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            RecoveryRequest::decode(r#"["t","x"]"#),
            Err(ProtocolError::InvalidNonce(_))
        ));
        assert!(matches!(
            RecoveryRequest::decode("not json"),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn test_recovery_response_mixed() {
        let items = vec![
            RecoveredItem::Found(Envelope::publish("t", 3, "three")),
            RecoveredItem::Expired,
        ];
        let encoded = encode_recovery_response(&items);
        assert!(encoded.starts_with(r#"[["t","PUBLISH","3","three"],"#));
        assert_eq!(decode_recovery_response(&encoded).expect("decode"), items);
    }

    #[test]
    fn test_rejection_payload() {
        let payload = encode_rejection("unknown topic");
        assert_eq!(decode_rejection(&payload), Some("unknown topic"));
        assert_eq!(decode_rejection("plain"), None);
        assert_ne!(payload, CACHE_EXPIRED_SENTINEL);
    }
}
