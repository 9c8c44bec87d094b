//! Chorus voice channel client
//!
//! Client-side session for a real-time voice channel: WebSocket signaling
//! with automatic reconnect, PCM audio capture and playback, a live
//! participant roster, and a controller wrapping the operator-facing
//! operations (join, leave, mute, deafen, volume, device selection).
//!
//! The signaling logic lives in a pure state machine ([`state`]) driven by
//! an async runner ([`session`]) that owns the socket, timers, and audio
//! devices. Most callers only need [`controller::VoiceChannelController`].

pub mod api;
pub mod audio;
pub mod capture;
pub mod conditioner;
pub mod controller;
pub mod error;
pub mod playback;
pub mod roster;
pub mod session;
pub mod state;

pub use api::{AuthClient, CredentialSource};
pub use audio::{DeviceKind, DeviceSelection};
pub use conditioner::ConditioningSettings;
pub use controller::{ControllerConfig, VoiceChannelController};
pub use error::VoiceError;
pub use session::{SessionConfig, SessionHandle, SessionNotice};
pub use state::{SessionSnapshot, SessionState};
