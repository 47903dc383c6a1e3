//! Wire protocol for the crosstalk signaling fabric.
//!
//! Signaling sessions exchange JSON text frames. Every frame is an envelope
//! carrying an optional correlation `id`, a `type` discriminator and the
//! payload field matching that type. The envelopes keep payload fields they
//! do not model in a flattened map, so a component that proxies traffic can
//! relay message types verbatim without understanding them.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Maximum size in bytes of a single signaling frame.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Upgrade-response header advertising a server's feature set as a
/// comma-separated list.
pub const FEATURES_HEADER: &str = "X-Spreed-Signaling-Features";

/// Feature token a server must advertise to accept federated sessions.
pub const FEATURE_FEDERATION: &str = "federation";

/// Protocol version sent in the hello handshake.
pub const HELLO_VERSION: &str = "2.0";

/// Auth type for hellos authenticated by a federation bearer token.
pub const HELLO_AUTH_TYPE_FEDERATION: &str = "federation";

/// Error code for peers that do not accept federated sessions.
pub const ERROR_FEDERATION_UNSUPPORTED: &str = "federation_unsupported";

/// Catch-all error code for federation tunnel failures.
pub const ERROR_FEDERATION_ERROR: &str = "federation_error";

/// A frame sent by a client to a signaling server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hello: Option<HelloClientMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<RoomClientMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<MessageClientMessage>,
    /// Payload fields of message types this crate does not model.
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

/// A frame sent by a signaling server to a client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SignalingError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub welcome: Option<WelcomeServerMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hello: Option<HelloServerMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<RoomServerMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<MessageServerMessage>,
    /// Payload fields of message types this crate does not model.
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl ServerMessage {
    /// Build an in-band `error` frame.
    pub fn error(id: Option<String>, error: SignalingError) -> Self {
        Self {
            id,
            kind: "error".into(),
            error: Some(error),
            ..Default::default()
        }
    }
}

/// The authenticated hello a client opens its session with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloClientMessage {
    pub version: String,
    pub auth: HelloClientAuth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloClientAuth {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

/// Auth params carried by a federation-type hello.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationAuthParams {
    pub token: String,
}

/// A room join (or switch) request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomClientMessage {
    pub room_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub federation: Option<RoomFederationMessage>,
}

/// Descriptor a client attaches to a room join when the room is homed on a
/// peer signaling server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomFederationMessage {
    /// Signaling endpoint of the peer server.
    pub signaling_url: String,
    /// Backend URL the peer authenticates the bearer token against.
    pub nextcloud_url: String,
    /// Id of the room on the peer server, when it differs from the locally
    /// visible room id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    pub token: String,
}

/// How a targeted message is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipientKind {
    Session,
    User,
    Room,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecipient {
    #[serde(rename = "type")]
    pub kind: RecipientKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSender {
    #[serde(rename = "type")]
    pub kind: RecipientKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// A targeted payload sent by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageClientMessage {
    pub recipient: MessageRecipient,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

/// A targeted payload delivered to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageServerMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<MessageSender>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<MessageRecipient>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

/// First frame a server sends after the transport upgrade.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WelcomeServerMessage {
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl WelcomeServerMessage {
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }
}

/// The identity a server assigns to a session in its hello response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloServerMessage {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Acknowledgement of a room join.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomServerMessage {
    pub room_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Value>,
}

/// In-band error payload (`type = "error"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl SignalingError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }
}

impl fmt::Display for SignalingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for SignalingError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unmodeled_payloads_round_trip() {
        let raw = json!({
            "type": "event",
            "event": {
                "target": "room",
                "type": "join",
                "join": [{"sessionId": "abc", "userId": "user-one"}],
            },
        });

        let msg: ServerMessage = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(msg.kind, "event");
        assert!(msg.rest.contains_key("event"));
        assert_eq!(serde_json::to_value(&msg).unwrap(), raw);
    }

    #[test]
    fn recipient_uses_wire_names() {
        let recipient = MessageRecipient {
            kind: RecipientKind::Session,
            session_id: Some("abc".into()),
            user_id: None,
        };
        assert_eq!(
            serde_json::to_value(&recipient).unwrap(),
            json!({"type": "session", "sessionId": "abc"})
        );
    }

    #[test]
    fn federation_descriptor_uses_wire_names() {
        let raw = json!({
            "signalingUrl": "https://peer.example.org/signaling",
            "nextcloudUrl": "https://peer.example.org",
            "roomId": "remote-room",
            "token": "secret",
        });
        let federation: RoomFederationMessage = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(federation.room_id.as_deref(), Some("remote-room"));
        assert_eq!(serde_json::to_value(&federation).unwrap(), raw);
    }

    #[test]
    fn welcome_feature_lookup() {
        let welcome = WelcomeServerMessage {
            features: vec!["audio-video-permissions".into(), FEATURE_FEDERATION.into()],
            version: None,
        };
        assert!(welcome.has_feature(FEATURE_FEDERATION));
        assert!(!welcome.has_feature("dialout"));
    }

    #[test]
    fn error_frame_carries_correlation_id() {
        let msg = ServerMessage::error(
            Some("join-1".into()),
            SignalingError::new(ERROR_FEDERATION_ERROR, "broken"),
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["id"], "join-1");
        assert_eq!(value["type"], "error");
        assert_eq!(value["error"]["code"], ERROR_FEDERATION_ERROR);
    }
}
