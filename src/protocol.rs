//! Wire protocol for control-plane connections
//!
//! Every message is a typed object `{ "type": ..., ...fields }`.
//! Client and server directions are separate enums so neither side
//! can accidentally emit the other's messages.

use serde::{Deserialize, Serialize};

/// Messages sent by a connected client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Subscribe to one or more topics
    Subscribe { channels: Vec<String> },
    /// Unsubscribe from one or more topics
    Unsubscribe { channels: Vec<String> },
    /// Submit a privileged command
    Command {
        command: String,
        #[serde(default)]
        payload: serde_json::Value,
        request_id: String,
        /// One-time step-up confirmation code, when the command needs one
        #[serde(default, skip_serializing_if = "Option::is_none")]
        confirmation_code: Option<String>,
    },
    /// Liveness heartbeat
    Heartbeat,
    /// Application-level ping
    Ping,
}

/// Messages sent by the server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake acknowledgement with the server's capability set
    Connected {
        session_id: String,
        capabilities: Vec<String>,
    },
    /// Acknowledges a subscribe call with the session's full topic set
    SubscriptionConfirmed { channels: Vec<String> },
    /// Result of a submitted command, sent only to the requester
    CommandResult {
        command: String,
        request_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// Set when the command was rejected for lacking step-up
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        requires_step_up: bool,
    },
    /// Topic event fan-out
    Event {
        event: String,
        data: serde_json::Value,
    },
    /// Suspicious-activity or operational alert
    SystemAlert { alert: serde_json::Value },
    /// The session was superseded or administratively closed
    ForceLogout { user_id: String },
    /// Reply to `ping`
    Pong,
}

/// Capability names advertised in the `connected` handshake
pub fn capabilities() -> Vec<String> {
    ["subscribe", "unsubscribe", "command", "heartbeat", "ping"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_command_roundtrip() {
        let msg = ClientMessage::Command {
            command: "ban_user".to_string(),
            payload: serde_json::json!({"userId": "u-1", "reason": "fraud"}),
            request_id: "req-42".to_string(),
            confirmation_code: Some("123456".to_string()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"command\""));
        assert!(json.contains("\"request_id\":\"req-42\""));

        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, ClientMessage::Command { .. }));
    }

    #[test]
    fn test_command_without_confirmation_omits_field() {
        let msg = ClientMessage::Command {
            command: "platform_stats".to_string(),
            payload: serde_json::Value::Null,
            request_id: "req-1".to_string(),
            confirmation_code: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("confirmation_code"));
    }

    #[test]
    fn test_heartbeat_is_bare_tag() {
        let json = serde_json::to_string(&ClientMessage::Heartbeat).unwrap();
        assert_eq!(json, r#"{"type":"heartbeat"}"#);
        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, ClientMessage::Heartbeat));
    }

    #[test]
    fn test_connected_message() {
        let msg = ServerMessage::Connected {
            session_id: "sess-1".to_string(),
            capabilities: capabilities(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"connected\""));
        assert!(json.contains("subscribe"));
    }

    #[test]
    fn test_command_result_step_up_flag() {
        let rejected = ServerMessage::CommandResult {
            command: "ban_user".to_string(),
            request_id: "req-1".to_string(),
            success: false,
            data: None,
            error: Some("Command 'ban_user' requires step-up confirmation".to_string()),
            requires_step_up: true,
        };
        let json = serde_json::to_string(&rejected).unwrap();
        assert!(json.contains("\"requires_step_up\":true"));

        let ok = ServerMessage::CommandResult {
            command: "platform_stats".to_string(),
            request_id: "req-2".to_string(),
            success: true,
            data: Some(serde_json::json!({"orders": 12})),
            error: None,
            requires_step_up: false,
        };
        let json = serde_json::to_string(&ok).unwrap();
        // False is the default and is omitted from the wire
        assert!(!json.contains("requires_step_up"));
    }

    #[test]
    fn test_malformed_message_fails_parse() {
        let result = serde_json::from_str::<ClientMessage>(r#"{"type":"warp_core_breach"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_event_message() {
        let msg = ServerMessage::Event {
            event: "order_updated".to_string(),
            data: serde_json::json!({"orderId": "o-9", "status": "refunded"}),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: ServerMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            ServerMessage::Event { event, data } => {
                assert_eq!(event, "order_updated");
                assert_eq!(data["orderId"], "o-9");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
