//! Voice session error taxonomy
//!
//! Every fault surfaced to the operator is one of these variants. The
//! session runner logs and recovers where it can; what reaches the notice
//! channel is already classified.

use chorus_common::codec::CodecError;
use thiserror::Error;

/// Errors surfaced by a voice channel session
#[derive(Debug, Error)]
pub enum VoiceError {
    /// Audio device could not be opened or failed mid-stream
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// A connect attempt did not complete within the timeout
    #[error("connection attempt timed out")]
    ConnectionTimeout,

    /// Server rejected the credential (close 4000); never retried
    #[error("authentication rejected: {0}")]
    AuthenticationFailure(String),

    /// Server rejected the membership (close 4001/4002/4003); never retried
    #[error("channel membership rejected: {0}")]
    MembershipRejected(String),

    /// Connection lost and reconnect attempts exhausted
    #[error("connection lost: {0}")]
    TransientDisconnect(String),

    /// Inbound audio frame could not be decoded (frame dropped)
    #[error("audio frame rejected: {0}")]
    EncodeDecode(#[from] CodecError),

    /// Credential refresh failed; aborts the pending connect attempt only
    #[error("credential refresh failed: {0}")]
    CredentialRefresh(String),

    /// REST collaborator request failed
    #[error("api request failed: {0}")]
    Api(String),
}

impl VoiceError {
    /// Whether this error permanently ends the membership.
    ///
    /// Terminal errors mean the session will not reconnect on its own;
    /// the operator has to address the cause and join again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VoiceError::AuthenticationFailure(_) | VoiceError::MembershipRejected(_)
        )
    }
}
