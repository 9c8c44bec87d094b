//! Voice channel wire protocol
//!
//! JSON messages exchanged with the voice server over WebSocket. Every
//! message carries a `type` tag; field names keep the casing the server
//! expects (participant flags are camelCase, audio metadata snake_case).
//!
//! Unknown tags deserialize to [`VoiceMessage::Unrecognized`] so a newer
//! server can add message types without breaking older clients.

use serde::{Deserialize, Serialize};

// =============================================================================
// Close Codes
// =============================================================================

/// Clean closure requested by either side
pub const CLOSE_NORMAL: u16 = 1000;

/// Abnormal closure (connection dropped without a close frame)
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Authentication failed (bad or expired token)
pub const CLOSE_AUTH_FAILED: u16 = 4000;

/// Channel does not exist
pub const CLOSE_INVALID_CHANNEL: u16 = 4001;

/// User is not a member of the channel
pub const CLOSE_NOT_MEMBER: u16 = 4002;

/// User account not found
pub const CLOSE_USER_NOT_FOUND: u16 = 4003;

/// Interpreted WebSocket close code
///
/// Splits closures into the three behaviors the session cares about:
/// clean shutdown, terminal rejection, and transient loss worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Clean closure, no recovery needed
    Normal,
    /// Token rejected; reconnecting with the same credential is pointless
    AuthFailed,
    /// Channel does not exist
    InvalidChannel,
    /// Local user is not a member of the channel
    NotMember,
    /// Local user account not found
    UserNotFound,
    /// Anything else, including 1006; candidate for reconnect
    Transient(u16),
}

impl CloseReason {
    /// Interpret a raw close code
    pub fn from_code(code: u16) -> Self {
        match code {
            CLOSE_NORMAL => CloseReason::Normal,
            CLOSE_AUTH_FAILED => CloseReason::AuthFailed,
            CLOSE_INVALID_CHANNEL => CloseReason::InvalidChannel,
            CLOSE_NOT_MEMBER => CloseReason::NotMember,
            CLOSE_USER_NOT_FOUND => CloseReason::UserNotFound,
            other => CloseReason::Transient(other),
        }
    }

    /// Whether this closure permanently ends the membership
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CloseReason::AuthFailed
                | CloseReason::InvalidChannel
                | CloseReason::NotMember
                | CloseReason::UserNotFound
        )
    }

    /// Whether the session should schedule a reconnect attempt
    pub fn should_reconnect(self) -> bool {
        matches!(self, CloseReason::Transient(_))
    }
}

// =============================================================================
// Participants
// =============================================================================

/// A member of the voice channel as reported by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    /// Stable user id (roster key)
    pub id: String,
    /// Display name
    pub username: String,
    /// Whether the user has muted their microphone
    #[serde(default)]
    pub is_muted: bool,
    /// Whether the user has deafened incoming audio
    #[serde(default)]
    pub is_deafened: bool,
    /// Whether the user's camera is on
    #[serde(default)]
    pub is_video_enabled: bool,
    /// Whether the user is sharing their screen
    #[serde(default)]
    pub is_screen_sharing: bool,
}

// =============================================================================
// Wire Messages
// =============================================================================

/// Messages exchanged with the voice server
///
/// The same enum covers both directions; the session only ever sends a
/// subset (join, leave, ping/pong, state changes, audio).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VoiceMessage {
    /// Announce membership after the socket opens
    Join,
    /// Announce departure before closing the socket
    Leave,
    /// Keepalive request (sent by either side)
    Ping,
    /// Keepalive response
    Pong,
    /// Microphone mute state changed
    MuteState {
        /// Present on inbound messages about other users
        #[serde(rename = "userId", skip_serializing_if = "Option::is_none", default)]
        user_id: Option<String>,
        #[serde(rename = "isMuted")]
        is_muted: bool,
    },
    /// Deafen state changed
    DeafenState {
        #[serde(rename = "userId", skip_serializing_if = "Option::is_none", default)]
        user_id: Option<String>,
        #[serde(rename = "isDeafened")]
        is_deafened: bool,
    },
    /// Camera state changed
    VideoState {
        #[serde(rename = "userId", skip_serializing_if = "Option::is_none", default)]
        user_id: Option<String>,
        #[serde(rename = "isEnabled")]
        is_enabled: bool,
    },
    /// Camera turned on (sent alongside VideoState)
    VideoStart {
        #[serde(rename = "userId", skip_serializing_if = "Option::is_none", default)]
        user_id: Option<String>,
    },
    /// Camera turned off
    VideoStop {
        #[serde(rename = "userId", skip_serializing_if = "Option::is_none", default)]
        user_id: Option<String>,
    },
    /// Screen share state changed
    ScreenShareState {
        #[serde(rename = "userId", skip_serializing_if = "Option::is_none", default)]
        user_id: Option<String>,
        #[serde(rename = "isEnabled")]
        is_enabled: bool,
    },
    /// Screen share started (sent alongside ScreenShareState)
    ScreenShareStart {
        #[serde(rename = "userId", skip_serializing_if = "Option::is_none", default)]
        user_id: Option<String>,
    },
    /// Screen share stopped
    ScreenShareStop {
        #[serde(rename = "userId", skip_serializing_if = "Option::is_none", default)]
        user_id: Option<String>,
    },
    /// Full roster snapshot
    Participants { participants: Vec<Participant> },
    /// A user joined the channel
    ParticipantJoined { participant: Participant },
    /// A user left the channel
    ParticipantLeft {
        #[serde(rename = "userId")]
        user_id: String,
    },
    /// One frame of PCM audio, base64-encoded i16 LE samples
    Audio {
        data: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        channel_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        timestamp: Option<u64>,
    },
    /// Server echo of a message this client sent (loopback testing)
    Echo { original_message: serde_json::Value },
    /// Server-reported connection status
    ConnectionStatus { status: String },
    /// Server pushed a fresh credential for subsequent reconnects
    TokenRefresh { token: String },
    /// Unknown message type (logged and dropped)
    #[serde(other)]
    Unrecognized,
}

impl VoiceMessage {
    /// Parse a text frame from the wire
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Parse an embedded message (the payload of an echo)
    pub fn from_value(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Serialize for sending over the socket
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// =============================================================================
// Tests
// =============================================================================
