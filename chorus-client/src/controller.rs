//! Voice channel controller
//!
//! Operator-facing wrapper around one voice session at a time. Owns the
//! preferences that outlive any single session (devices, volume, mute and
//! deafen flags, conditioning settings) and applies them when a session
//! starts. Joining a second channel leaves the first; changing devices
//! rejoins the current channel so the new devices take effect.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::info;

use crate::api::AuthClient;
use crate::audio::{
    AudioDevice, DeviceKind, DeviceSelection, list_input_devices, list_output_devices,
};
use crate::conditioner::ConditioningSettings;
use crate::error::VoiceError;
use crate::session::{SessionConfig, SessionHandle, SessionNotice};
use crate::state::{SessionSnapshot, SessionState};

use chorus_common::protocol::Participant;

/// How long leave() waits for the previous session to release its socket
/// and audio devices before a new session may claim them
const TEARDOWN_WAIT: Duration = Duration::from_secs(2);

/// Configuration for a controller
pub struct ControllerConfig {
    /// Base WebSocket URL of the voice server (e.g. `wss://chorus.example`)
    pub server_url: String,
    /// Local user id
    pub user_id: String,
    /// API client holding the bearer credential
    pub auth: AuthClient,
}

struct ActiveSession {
    channel_id: String,
    handle: SessionHandle,
    notice_rx: mpsc::UnboundedReceiver<SessionNotice>,
}

// =============================================================================
// Controller
// =============================================================================

/// Manages voice channel membership and session preferences
pub struct VoiceChannelController {
    server_url: String,
    user_id: String,
    auth: AuthClient,
    session: Option<ActiveSession>,
    devices: DeviceSelection,
    conditioning: ConditioningSettings,
    muted: bool,
    deafened: bool,
    volume: u8,
}

impl VoiceChannelController {
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            server_url: config.server_url,
            user_id: config.user_id,
            auth: config.auth,
            session: None,
            devices: DeviceSelection::default(),
            conditioning: ConditioningSettings::default(),
            muted: false,
            deafened: false,
            volume: 100,
        }
    }

    // -------------------------------------------------------------------------
    // Membership
    // -------------------------------------------------------------------------

    /// Join a voice channel
    ///
    /// Joining while in another channel leaves that channel first; joining
    /// the channel already joined is a no-op.
    pub fn join(&mut self, channel_id: &str) {
        if let Some(active) = &self.session {
            if active.channel_id == channel_id {
                return;
            }
            self.leave();
        }

        info!("Joining voice channel {}", channel_id);

        let config = SessionConfig {
            server_url: self.server_url.clone(),
            channel_id: channel_id.to_string(),
            user_id: self.user_id.clone(),
            input_device: self.devices.input.clone(),
            output_device: self.devices.output.clone(),
            conditioning: self.conditioning,
            start_muted: self.muted,
            start_deafened: self.deafened,
            volume: self.volume,
            credentials: Arc::new(self.auth.clone()),
        };

        let (handle, notice_rx) = SessionHandle::start(config);
        self.session = Some(ActiveSession {
            channel_id: channel_id.to_string(),
            handle,
            notice_rx,
        });
    }

    /// Leave the current channel (no-op when not in one)
    ///
    /// Waits up to [`TEARDOWN_WAIT`] for the session thread to finish so
    /// the devices and socket are free before the next join; a session
    /// wedged in a device driver is abandoned instead.
    pub fn leave(&mut self) {
        if let Some(mut active) = self.session.take() {
            info!("Leaving voice channel {}", active.channel_id);
            if !active.handle.leave_and_wait(TEARDOWN_WAIT) {
                info!(
                    "Voice session for {} still shutting down; continuing without it",
                    active.channel_id
                );
            }
        }
    }

    /// The channel currently joined, if any
    pub fn current_channel(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.channel_id.as_str())
    }

    // -------------------------------------------------------------------------
    // Session preferences
    // -------------------------------------------------------------------------

    pub fn toggle_mute(&mut self) {
        self.muted = !self.muted;
        if let Some(active) = &self.session {
            active.handle.toggle_mute();
        }
    }

    pub fn toggle_deafen(&mut self) {
        self.deafened = !self.deafened;
        if let Some(active) = &self.session {
            active.handle.toggle_deafen();
        }
    }

    pub fn toggle_video(&mut self) {
        if let Some(active) = &self.session {
            active.handle.toggle_video();
        }
    }

    pub fn toggle_screen_share(&mut self) {
        if let Some(active) = &self.session {
            active.handle.toggle_screen_share();
        }
    }

    /// Set playback volume (0-100, clamped); persists across sessions
    pub fn set_volume(&mut self, volume: u8) {
        self.volume = volume.min(100);
        if let Some(active) = &self.session {
            active.handle.set_volume(self.volume);
        }
    }

    pub fn volume(&self) -> u8 {
        self.volume
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn is_deafened(&self) -> bool {
        self.deafened
    }

    /// Update conditioning stages; applies immediately when in a session
    pub fn set_conditioning(&mut self, settings: ConditioningSettings) {
        self.conditioning = settings;
        if let Some(active) = &self.session {
            active.handle.set_conditioning(settings);
        }
    }

    pub fn conditioning(&self) -> ConditioningSettings {
        self.conditioning
    }

    // -------------------------------------------------------------------------
    // Devices
    // -------------------------------------------------------------------------

    /// Select audio devices (empty names mean system default)
    ///
    /// When in a session this rejoins the channel so the new devices take
    /// effect; an active socket cannot swap streams in place.
    pub fn select_devices(&mut self, selection: DeviceSelection) {
        if self.devices == selection {
            return;
        }
        self.devices = selection;

        if let Some(channel_id) = self.current_channel().map(str::to_string) {
            self.leave();
            self.join(&channel_id);
        }
    }

    /// Select one device, leaving the other side of the selection alone
    pub fn select_device(&mut self, kind: DeviceKind, name: &str) {
        let mut selection = self.devices.clone();
        match kind {
            DeviceKind::Input => selection.input = name.to_string(),
            DeviceKind::Output => selection.output = name.to_string(),
        }
        self.select_devices(selection);
    }

    pub fn devices(&self) -> &DeviceSelection {
        &self.devices
    }

    pub fn input_devices(&self) -> Vec<AudioDevice> {
        list_input_devices()
    }

    pub fn output_devices(&self) -> Vec<AudioDevice> {
        list_output_devices()
    }

    // -------------------------------------------------------------------------
    // Observation
    // -------------------------------------------------------------------------

    /// Current session state, or the default (disconnected) snapshot
    pub fn snapshot(&self) -> SessionSnapshot {
        self.session
            .as_ref()
            .map(|s| s.handle.snapshot())
            .unwrap_or_default()
    }

    pub fn is_in_session(&self) -> bool {
        self.session.is_some()
    }

    /// Drain the next session notice, if one is pending
    ///
    /// Server-pushed credential refreshes are absorbed into the API client
    /// here; everything else is returned to the caller. Also reaps a
    /// session that has ended on its own.
    pub fn poll_notice(&mut self) -> Option<VoiceError> {
        let active = self.session.as_mut()?;

        while let Ok(notice) = active.notice_rx.try_recv() {
            match notice {
                SessionNotice::CredentialUpdated(token) => {
                    self.auth.store_bearer(&token);
                }
                SessionNotice::Fault(error) => return Some(error),
            }
        }

        // A session that reached Disconnected without a leave() has shut
        // itself down (terminal close or exhausted reconnects)
        if active.handle.snapshot().state == SessionState::Disconnected {
            self.session = None;
        }

        None
    }

    /// Fetch the participant list for a channel without joining it
    pub async fn preview_participants(
        &self,
        channel_id: &str,
    ) -> Result<Vec<Participant>, VoiceError> {
        self.auth.channel_participants(channel_id).await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> VoiceChannelController {
        VoiceChannelController::new(ControllerConfig {
            server_url: "wss://chorus.example".to_string(),
            user_id: "me".to_string(),
            auth: AuthClient::new("https://chorus.example", "tok"),
        })
    }

    #[test]
    fn test_starts_with_defaults() {
        let c = controller();
        assert!(!c.is_in_session());
        assert!(c.current_channel().is_none());
        assert_eq!(c.volume(), 100);
        assert!(!c.is_muted());
        assert!(!c.is_deafened());
        assert_eq!(c.conditioning(), ConditioningSettings::default());
    }

    #[test]
    fn test_toggles_persist_outside_session() {
        let mut c = controller();
        c.toggle_mute();
        c.toggle_deafen();
        assert!(c.is_muted());
        assert!(c.is_deafened());
        c.toggle_mute();
        assert!(!c.is_muted());
    }

    #[test]
    fn test_volume_clamped() {
        let mut c = controller();
        c.set_volume(250);
        assert_eq!(c.volume(), 100);
        c.set_volume(30);
        assert_eq!(c.volume(), 30);
    }

    #[test]
    fn test_device_selection_stored() {
        let mut c = controller();
        let selection = DeviceSelection {
            input: "USB Microphone".to_string(),
            output: String::new(),
        };
        c.select_devices(selection.clone());
        assert_eq!(c.devices(), &selection);
    }

    #[test]
    fn test_select_device_updates_one_side() {
        let mut c = controller();
        c.select_devices(DeviceSelection {
            input: "USB Microphone".to_string(),
            output: "Headphones".to_string(),
        });

        c.select_device(DeviceKind::Output, "Speakers");
        assert_eq!(c.devices().input, "USB Microphone");
        assert_eq!(c.devices().output, "Speakers");

        c.select_device(DeviceKind::Input, "");
        assert_eq!(c.devices().input, "");
        assert_eq!(c.devices().output, "Speakers");
    }

    #[test]
    fn test_conditioning_stored() {
        let mut c = controller();
        let settings = ConditioningSettings {
            echo_cancellation: false,
            noise_suppression: true,
            auto_gain: false,
        };
        c.set_conditioning(settings);
        assert_eq!(c.conditioning(), settings);
    }

    #[test]
    fn test_leave_without_session_is_noop() {
        let mut c = controller();
        c.leave();
        assert!(!c.is_in_session());
    }

    #[test]
    fn test_snapshot_defaults_when_disconnected() {
        let c = controller();
        let snapshot = c.snapshot();
        assert_eq!(snapshot.state, SessionState::Disconnected);
        assert!(snapshot.participants.is_empty());
    }
}
