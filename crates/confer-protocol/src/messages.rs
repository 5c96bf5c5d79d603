//! Message types for the Confer signaling protocol.
//!
//! All messages are JSON text frames with a `type` discriminant and
//! camelCase field names, matching what the browser clients send.

use serde::{Deserialize, Serialize};

/// Per-user media track flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTracks {
    /// Whether the user's microphone track is enabled.
    pub audio_enabled: bool,
    /// Whether the user has no usable audio device.
    pub audio_unavailable: bool,
    /// Whether the user's camera track is enabled.
    pub video_enabled: bool,
    /// Whether the user is sharing their screen.
    pub screen_share_enabled: bool,
}

/// A meeting participant as seen by every client.
///
/// `id` always equals the owning channel's identifier. Records persist in
/// storage independent of the live channel so reconnecting with the same
/// channel id recovers prior state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Channel identifier owning this record.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Whether the user has completed the join flow.
    pub joined: bool,
    /// Whether the user's hand is raised.
    pub raised_hand: bool,
    /// Whether the user is currently speaking.
    pub speaking: bool,
    /// Media track flags.
    pub tracks: UserTracks,
}

impl User {
    /// Construct a default user for a freshly connected channel.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            joined: false,
            raised_hand: false,
            speaking: false,
            tracks: UserTracks::default(),
        }
    }
}

/// The broadcastable snapshot of meeting id + roster.
///
/// Recomputed on demand from storage; never stored itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomState {
    /// The current meeting id.
    pub meeting_id: String,
    /// Every currently registered user.
    pub users: Vec<User>,
}

/// A message from a client to the room coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// The sender is leaving the meeting.
    UserLeft,

    /// Overwrite the sender's stored user record.
    UserUpdate {
        /// The full replacement record.
        user: User,
    },

    /// Diagnostic telemetry from WebRTC negotiation; recorded, no state change.
    #[serde(rename_all = "camelCase")]
    NegotiationRecordLog {
        /// Opaque telemetry entry.
        entry: serde_json::Value,
        /// The media session the entry belongs to.
        session_id: String,
    },

    /// Deliver a message to one specific channel.
    DirectMessage {
        /// Target channel id.
        to: String,
        /// Message body, relayed verbatim.
        message: String,
    },

    /// Ask the coordinator to mute another user's microphone.
    MuteUser {
        /// Target channel id.
        id: String,
    },

    /// Liveness ping; refreshes the sender's heartbeat timestamp.
    Heartbeat,

    /// Reserved keepalive tag; clients should never legitimately send this.
    Ping,
}

/// A message from the room coordinator to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Full roster broadcast, sent after every roster-affecting event.
    RoomState {
        /// The current snapshot.
        state: RoomState,
    },

    /// A structured error surfaced to the sender.
    Error {
        /// Human-readable diagnostic detail.
        error: String,
    },

    /// A relayed direct message.
    DirectMessage {
        /// Display name of the sender.
        from: String,
        /// Message body.
        message: String,
    },

    /// Instruction to the receiving client to mute its microphone.
    MuteMic,

    /// Notification that a user departed.
    UserLeftNotification {
        /// Channel id of the departed user.
        id: String,
    },

    /// Reserved keepalive response tag.
    Pong,
}

impl ServerMessage {
    /// Create a roster broadcast.
    #[must_use]
    pub fn room_state(state: RoomState) -> Self {
        ServerMessage::RoomState { state }
    }

    /// Create an error message.
    #[must_use]
    pub fn error(error: impl Into<String>) -> Self {
        ServerMessage::Error {
            error: error.into(),
        }
    }

    /// Create a relayed direct message.
    #[must_use]
    pub fn direct_message(from: impl Into<String>, message: impl Into<String>) -> Self {
        ServerMessage::DirectMessage {
            from: from.into(),
            message: message.into(),
        }
    }

    /// Create a departure notification.
    #[must_use]
    pub fn user_left_notification(id: impl Into<String>) -> Self {
        ServerMessage::UserLeftNotification { id: id.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_user_flags() {
        let user = User::new("c1", "Alice");
        assert!(!user.joined);
        assert!(!user.raised_hand);
        assert!(!user.speaking);
        assert!(!user.tracks.audio_enabled);
        assert!(!user.tracks.screen_share_enabled);
    }

    #[test]
    fn test_client_message_tags() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"userLeft"}"#).unwrap();
        assert_eq!(msg, ClientMessage::UserLeft);

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"muteUser","id":"c2"}"#).unwrap();
        assert_eq!(msg, ClientMessage::MuteUser { id: "c2".into() });

        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"directMessage","to":"c2","message":"hi"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::DirectMessage {
                to: "c2".into(),
                message: "hi".into()
            }
        );
    }

    #[test]
    fn test_user_wire_shape_is_camel_case() {
        let user = User::new("c1", "Alice");
        let value = serde_json::to_value(&user).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "c1",
                "name": "Alice",
                "joined": false,
                "raisedHand": false,
                "speaking": false,
                "tracks": {
                    "audioEnabled": false,
                    "audioUnavailable": false,
                    "videoEnabled": false,
                    "screenShareEnabled": false,
                }
            })
        );
    }

    #[test]
    fn test_room_state_wire_shape() {
        let msg = ServerMessage::room_state(RoomState {
            meeting_id: "m-1".into(),
            users: vec![User::new("c1", "Alice")],
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "roomState");
        assert_eq!(value["state"]["meetingId"], "m-1");
        assert_eq!(value["state"]["users"][0]["name"], "Alice");
    }

    #[test]
    fn test_user_update_round_trip() {
        let mut user = User::new("c1", "Alice");
        user.joined = true;
        user.tracks.video_enabled = true;

        let text = serde_json::to_string(&ClientMessage::UserUpdate { user: user.clone() }).unwrap();
        let parsed: ClientMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, ClientMessage::UserUpdate { user });
    }

    #[test]
    fn test_negotiation_record_log_session_id() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"negotiationRecordLog","entry":{"kind":"offer"},"sessionId":"s-9"}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::NegotiationRecordLog { session_id, .. } => {
                assert_eq!(session_id, "s-9");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
