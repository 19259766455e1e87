// # Peer wire protocol
//
// Messages travel between nodes as JSON envelopes, one envelope per
// websocket text frame:
//
// ```text
// { "type": <int>, "data": <object> }
// ```
//
// Type codes: 1 = JOIN, 2 = WELCOME, 3 = READY_TO_ADD. The envelope is kept
// as-is on the wire, but decoding immediately produces a tagged variant so
// handlers never touch untyped payloads.

use crate::error::{NodeError, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const MSG_JOIN: u8 = 1;
pub const MSG_WELCOME: u8 = 2;
pub const MSG_READY_TO_ADD: u8 = 3;

/// Payload of a JOIN request, sent by a prospective follower.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinPayload {
    pub uuid: Uuid,
    pub hostname: String,
    pub address: String,
    pub token: String,
}

/// Payload of a WELCOME reply, sent by the leader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WelcomePayload {
    pub cluster_uuid: Uuid,
    pub pubkey: String,
}

/// A decoded peer message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Join(JoinPayload),
    Welcome(WelcomePayload),
    ReadyToAdd,
}

// Raw wire shape; `data` stays opaque until the type code picks a payload.
#[derive(Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: u8,
    data: serde_json::Value,
}

impl Message {
    pub fn join(uuid: Uuid, hostname: String, address: String, token: String) -> Self {
        Message::Join(JoinPayload {
            uuid,
            hostname,
            address,
            token,
        })
    }

    pub fn welcome(cluster_uuid: Uuid, pubkey: String) -> Self {
        Message::Welcome(WelcomePayload {
            cluster_uuid,
            pubkey,
        })
    }

    /// Message kind as a short name, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Join(_) => "join",
            Message::Welcome(_) => "welcome",
            Message::ReadyToAdd => "ready_to_add",
        }
    }

    /// Serialize to the canonical envelope text for one websocket frame.
    pub fn encode(&self) -> Result<String> {
        let envelope = match self {
            Message::Join(payload) => Envelope {
                kind: MSG_JOIN,
                data: serde_json::to_value(payload)?,
            },
            Message::Welcome(payload) => Envelope {
                kind: MSG_WELCOME,
                data: serde_json::to_value(payload)?,
            },
            Message::ReadyToAdd => Envelope {
                kind: MSG_READY_TO_ADD,
                data: serde_json::json!({}),
            },
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    /// Parse one websocket text frame into a typed message.
    pub fn decode(raw: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(raw)
            .map_err(|e| NodeError::MalformedMessage(e.to_string()))?;
        match envelope.kind {
            MSG_JOIN => {
                let payload: JoinPayload = serde_json::from_value(envelope.data)
                    .map_err(|e| NodeError::MalformedMessage(format!("join payload: {}", e)))?;
                Ok(Message::Join(payload))
            }
            MSG_WELCOME => {
                let payload: WelcomePayload = serde_json::from_value(envelope.data)
                    .map_err(|e| NodeError::MalformedMessage(format!("welcome payload: {}", e)))?;
                Ok(Message::Welcome(payload))
            }
            MSG_READY_TO_ADD => Ok(Message::ReadyToAdd),
            other => Err(NodeError::MalformedMessage(format!(
                "unknown message type {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_roundtrip() {
        let msg = Message::join(
            Uuid::new_v4(),
            "node-2".into(),
            "10.0.0.6".into(),
            "a1b2-c3d4-e5f6-0011".into(),
        );
        let raw = msg.encode().unwrap();
        assert_eq!(Message::decode(&raw).unwrap(), msg);
    }

    #[test]
    fn test_welcome_roundtrip() {
        let msg = Message::welcome(Uuid::new_v4(), "ssh-ed25519 AAAA... root@leader".into());
        let raw = msg.encode().unwrap();
        assert_eq!(Message::decode(&raw).unwrap(), msg);
    }

    #[test]
    fn test_ready_to_add_roundtrip() {
        let raw = Message::ReadyToAdd.encode().unwrap();
        assert_eq!(Message::decode(&raw).unwrap(), Message::ReadyToAdd);
    }

    #[test]
    fn test_wire_format() {
        let uuid = Uuid::new_v4();
        let msg = Message::join(uuid, "h".into(), "a".into(), "t".into());
        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], 1);
        assert_eq!(value["data"]["uuid"], uuid.to_string());
        assert_eq!(value["data"]["hostname"], "h");

        let welcome = Message::welcome(uuid, "k".into()).encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&welcome).unwrap();
        assert_eq!(value["type"], 2);

        let ready = Message::ReadyToAdd.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&ready).unwrap();
        assert_eq!(value["type"], 3);
    }

    #[test]
    fn test_reencode_preserves_frame() {
        // serialize(deserialize(frame)) must reproduce the frame contents
        let frame = Message::welcome(Uuid::new_v4(), "key".into()).encode().unwrap();
        let reencoded = Message::decode(&frame).unwrap().encode().unwrap();
        let a: serde_json::Value = serde_json::from_str(&frame).unwrap();
        let b: serde_json::Value = serde_json::from_str(&reencoded).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = Message::decode(r#"{"type": 9, "data": {}}"#).unwrap_err();
        assert!(matches!(err, NodeError::MalformedMessage(_)));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            Message::decode("not json at all"),
            Err(NodeError::MalformedMessage(_))
        ));
        // valid envelope, payload missing required fields
        assert!(matches!(
            Message::decode(r#"{"type": 1, "data": {"hostname": "x"}}"#),
            Err(NodeError::MalformedMessage(_))
        ));
    }
}
