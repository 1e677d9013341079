//! Event types broadcast by the live engine and the turn player.
//!
//! All types serialise camelCase so a UI layer can forward them verbatim.
//!
//! | Event | Source |
//! |-------|--------|
//! | `SessionStatusEvent` | `LiveEngine::subscribe_status` |
//! | `TranscriptEvent` | `LiveEngine::subscribe_transcripts` |
//! | `AudioActivityEvent` | `LiveEngine::subscribe_activity` |
//! | `PlaybackStatusEvent` | `TurnPlayer::subscribe` |

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Session lifecycle
// ---------------------------------------------------------------------------

/// Live session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// No session. `start()` may be called.
    Closed,
    /// Credential accepted; microphone and transport are being opened.
    Opening,
    /// Transport open, microphone streaming, playback scheduling.
    Open,
    /// Teardown in progress.
    Closing,
    /// The session failed; teardown to `Closed` follows immediately.
    Error,
}

impl SessionStatus {
    pub fn is_active(self) -> bool {
        matches!(self, SessionStatus::Opening | SessionStatus::Open)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusEvent {
    pub status: SessionStatus,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

// ---------------------------------------------------------------------------
// Transcripts
// ---------------------------------------------------------------------------

/// Which side of the conversation a transcript belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptDirection {
    /// What the user said (input transcription).
    Input,
    /// What the model said (output transcription).
    Output,
}

/// A transcript delta plus the running text of the current turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    pub direction: TranscriptDirection,
    pub delta: String,
    /// Accumulated text for this direction in the current turn.
    pub text: String,
}

// ---------------------------------------------------------------------------
// Input level
// ---------------------------------------------------------------------------

/// Emitted for each chunk the capture pipeline drains.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioActivityEvent {
    pub seq: u64,
    /// Root-mean-square level of the chunk in [0.0, 1.0].
    pub rms: f32,
}

// ---------------------------------------------------------------------------
// Chat history entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One finalized chat-history entry handed to the message bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEntry {
    pub id: String,
    pub role: ChatRole,
    pub content: String,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
}

impl ChatEntry {
    /// Build the user/assistant pair for one completed voice turn.
    ///
    /// Ids are millisecond timestamps; the assistant entry uses `user + 1`
    /// so the pair stays ordered and unique.
    pub fn turn_pair(user_text: String, assistant_text: String) -> (ChatEntry, ChatEntry) {
        let now = chrono::Utc::now().timestamp_millis();
        (
            ChatEntry {
                id: now.to_string(),
                role: ChatRole::User,
                content: user_text,
                timestamp: now,
            },
            ChatEntry {
                id: (now + 1).to_string(),
                role: ChatRole::Assistant,
                content: assistant_text,
                timestamp: now,
            },
        )
    }
}

// ---------------------------------------------------------------------------
// Turn playback
// ---------------------------------------------------------------------------

/// Turn-based playback state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnState {
    Idle,
    Playing,
    Paused,
}

impl TurnState {
    pub fn as_str(self) -> &'static str {
        match self {
            TurnState::Idle => "idle",
            TurnState::Playing => "playing",
            TurnState::Paused => "paused",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackStatusEvent {
    pub state: TurnState,
    /// Played time of the current buffer in seconds.
    pub position_secs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_event_serializes_with_camel_case_and_lowercase_direction() {
        let event = TranscriptEvent {
            seq: 7,
            direction: TranscriptDirection::Output,
            delta: "lo".into(),
            text: "hello".into(),
        };

        let json = serde_json::to_value(&event).expect("serialize transcript event");
        assert_eq!(json["seq"], 7);
        assert_eq!(json["direction"], "output");
        assert_eq!(json["delta"], "lo");
        assert_eq!(json["text"], "hello");

        let round_trip: TranscriptEvent =
            serde_json::from_value(json).expect("deserialize transcript event");
        assert_eq!(round_trip.direction, TranscriptDirection::Output);
    }

    #[test]
    fn session_status_event_serializes_lowercase() {
        let event = SessionStatusEvent {
            status: SessionStatus::Closing,
            detail: Some("user stop".into()),
        };
        let json = serde_json::to_value(&event).expect("serialize status event");
        assert_eq!(json["status"], "closing");
        assert_eq!(json["detail"], "user stop");
    }

    #[test]
    fn direction_rejects_non_lowercase_values() {
        assert!(serde_json::from_str::<TranscriptDirection>(r#""Input""#).is_err());
    }

    #[test]
    fn turn_pair_ids_are_consecutive() {
        let (user, assistant) = ChatEntry::turn_pair("hi".into(), "hello".into());
        let u: i64 = user.id.parse().unwrap();
        let a: i64 = assistant.id.parse().unwrap();
        assert_eq!(a, u + 1);
        assert_eq!(user.role, ChatRole::User);
        assert_eq!(assistant.role, ChatRole::Assistant);
    }

    #[test]
    fn playback_status_uses_camel_case_position() {
        let event = PlaybackStatusEvent {
            state: TurnState::Paused,
            position_secs: 1.5,
        };
        let json = serde_json::to_value(&event).expect("serialize playback status");
        assert_eq!(json["state"], "paused");
        assert_eq!(json["positionSecs"], 1.5);
    }
}
