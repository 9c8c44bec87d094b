//! Signaling session state machine
//!
//! Pure transition core of the voice session: events in, effects out.
//! Owns the session state, the roster, local flags, the reconnect
//! counter, and the armed-timer bookkeeping. The async runner in
//! [`crate::session`] feeds it socket/timer/operator events and
//! interprets the returned effects; nothing here touches a socket,
//! a clock, or an audio device, which is what makes the ordering and
//! cancellation behavior testable without either.

use chorus_common::codec::{decode_base64, decode_frame, encode_base64};
use chorus_common::protocol::{CloseReason, Participant, VoiceMessage};
use chorus_common::MAX_RECONNECT_ATTEMPTS;

use crate::error::VoiceError;
use crate::roster::{FlagPatch, ParticipantRoster};

// =============================================================================
// States, Timers, Events, Effects
// =============================================================================

/// Lifecycle state of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    /// A connect or reconnect attempt is in flight
    Connecting,
    Connected,
}

/// The session's timers, modeled as arm/cancel effects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Aborts a connect attempt that takes too long
    ConnectTimeout,
    /// Outbound keepalive ping
    Ping,
    /// Periodic liveness check while in a session
    HealthCheck,
    /// Delay before the next reconnect attempt
    ReconnectBackoff,
}

/// Which timers are currently armed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimerSet {
    connect_timeout: bool,
    ping: bool,
    health_check: bool,
    reconnect_backoff: bool,
}

impl TimerSet {
    fn set(&mut self, kind: TimerKind, armed: bool) {
        match kind {
            TimerKind::ConnectTimeout => self.connect_timeout = armed,
            TimerKind::Ping => self.ping = armed,
            TimerKind::HealthCheck => self.health_check = armed,
            TimerKind::ReconnectBackoff => self.reconnect_backoff = armed,
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        match kind {
            TimerKind::ConnectTimeout => self.connect_timeout,
            TimerKind::Ping => self.ping,
            TimerKind::HealthCheck => self.health_check,
            TimerKind::ReconnectBackoff => self.reconnect_backoff,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.connect_timeout || self.ping || self.health_check || self.reconnect_backoff)
    }
}

/// Inputs to the state machine
#[derive(Debug)]
pub enum SessionEvent {
    /// Operator asked to join the channel
    ConnectRequested,
    /// The WebSocket opened
    SocketOpened,
    /// The WebSocket closed (or a connect attempt failed; the runner
    /// synthesizes code 1006 for those)
    SocketClosed { code: u16 },
    /// Credential refresh failed before the socket was opened
    CredentialRefreshFailed { detail: String },
    /// Audio capture came up
    CaptureStarted,
    /// Audio capture could not start or died mid-stream
    CaptureFailed { detail: String },
    /// A parsed JSON message arrived
    MessageReceived(VoiceMessage),
    /// An opaque binary audio frame arrived
    BinaryReceived(Vec<u8>),
    /// A conditioned capture frame is ready to transmit
    LocalFrame { samples: Vec<f32>, timestamp_ms: u64 },
    /// An armed timer fired
    Timer(TimerKind),
    ToggleMute,
    ToggleDeafen,
    ToggleVideo,
    ToggleScreenShare,
    /// Set playback volume (0-100, clamped)
    SetVolume(u8),
    /// Operator asked to leave (idempotent from any state)
    LeaveRequested,
}

/// Outputs of the state machine, interpreted by the runner
#[derive(Debug)]
pub enum Effect {
    /// Refresh the credential and open the WebSocket
    OpenSocket,
    /// Send a message on the socket (best-effort)
    Send(VoiceMessage),
    /// Close the socket (or abort a pending connect)
    CloseSocket,
    /// Bring up capture, conditioning, and the playback sink
    StartCapture,
    /// Tear down the capture side only; playback keeps running
    StopCapture,
    /// Tear down the playback sink
    StopPlayback,
    /// Render a decoded frame with the gain frozen at decode time
    PlayFrame { samples: Vec<f32>, gain: f32 },
    ArmTimer(TimerKind),
    CancelTimer(TimerKind),
    CancelAllTimers,
    /// Remember a server-pushed credential for later REST use
    StoreCredential(String),
    /// Report a fault to the notice channel (codec faults are log-only)
    SurfaceError(VoiceError),
    /// The session is over; the runner should exit its loop
    Shutdown,
}

/// Read-only view of the session published through a watch channel
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub muted: bool,
    pub deafened: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
    pub volume: u8,
    pub participants: Vec<Participant>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: SessionState::Disconnected,
            muted: false,
            deafened: false,
            video_enabled: false,
            screen_sharing: false,
            volume: 100,
            participants: Vec::new(),
        }
    }
}

// =============================================================================
// Session Machine
// =============================================================================

/// Pure signaling state machine for one channel membership
pub struct SessionMachine {
    state: SessionState,
    channel_id: String,
    socket_open: bool,
    capture_running: bool,
    muted: bool,
    deafened: bool,
    video_enabled: bool,
    screen_sharing: bool,
    volume: u8,
    reconnect_attempts: u32,
    roster: ParticipantRoster,
    armed: TimerSet,
}

impl SessionMachine {
    pub fn new(channel_id: String, local_user_id: String) -> Self {
        Self {
            state: SessionState::Disconnected,
            channel_id,
            socket_open: false,
            capture_running: false,
            muted: false,
            deafened: false,
            video_enabled: false,
            screen_sharing: false,
            volume: 100,
            reconnect_attempts: 0,
            roster: ParticipantRoster::new(local_user_id),
            armed: TimerSet::default(),
        }
    }

    /// Carry operator flags over from a previous session (device rejoin)
    pub fn restore_flags(&mut self, muted: bool, deafened: bool, volume: u8) {
        self.muted = muted;
        self.deafened = deafened;
        self.volume = volume.min(100);
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn armed_timers(&self) -> TimerSet {
        self.armed
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Current view for the watch channel
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            muted: self.muted,
            deafened: self.deafened,
            video_enabled: self.video_enabled,
            screen_sharing: self.screen_sharing,
            volume: self.volume,
            participants: self.roster.participants().to_vec(),
        }
    }

    /// Feed one event through the machine
    pub fn handle(&mut self, event: SessionEvent) -> Vec<Effect> {
        let mut effects = Vec::new();

        match event {
            SessionEvent::ConnectRequested => self.on_connect_requested(&mut effects),
            SessionEvent::SocketOpened => self.on_socket_opened(&mut effects),
            SessionEvent::SocketClosed { code } => self.on_socket_closed(code, &mut effects),
            SessionEvent::CredentialRefreshFailed { detail } => {
                self.on_credential_refresh_failed(detail, &mut effects)
            }
            SessionEvent::CaptureStarted => {
                self.capture_running = true;
            }
            SessionEvent::CaptureFailed { detail } => {
                self.on_capture_failed(detail, &mut effects)
            }
            SessionEvent::MessageReceived(msg) => self.on_message(msg, &mut effects),
            SessionEvent::BinaryReceived(bytes) => self.on_binary(&bytes, &mut effects),
            SessionEvent::LocalFrame {
                samples,
                timestamp_ms,
            } => self.on_local_frame(samples, timestamp_ms, &mut effects),
            SessionEvent::Timer(kind) => self.on_timer(kind, &mut effects),
            SessionEvent::ToggleMute => self.on_toggle_mute(&mut effects),
            SessionEvent::ToggleDeafen => self.on_toggle_deafen(&mut effects),
            SessionEvent::ToggleVideo => self.on_toggle_video(&mut effects),
            SessionEvent::ToggleScreenShare => self.on_toggle_screen_share(&mut effects),
            SessionEvent::SetVolume(volume) => {
                self.volume = volume.min(100);
            }
            SessionEvent::LeaveRequested => self.on_leave_requested(&mut effects),
        }

        effects
    }

    // -------------------------------------------------------------------------
    // Connection lifecycle
    // -------------------------------------------------------------------------

    fn on_connect_requested(&mut self, effects: &mut Vec<Effect>) {
        // One socket per membership; a second connect is rejected
        if self.state != SessionState::Disconnected {
            return;
        }

        self.state = SessionState::Connecting;
        self.reconnect_attempts = 0;
        effects.push(Effect::OpenSocket);
        self.arm(TimerKind::ConnectTimeout, effects);
    }

    fn on_socket_opened(&mut self, effects: &mut Vec<Effect>) {
        // A stale connect result after teardown is ignored
        if self.state == SessionState::Disconnected {
            effects.push(Effect::CloseSocket);
            return;
        }

        self.socket_open = true;
        self.state = SessionState::Connected;
        // A successful open resets the retry budget for the next outage
        self.reconnect_attempts = 0;

        self.cancel(TimerKind::ConnectTimeout, effects);
        effects.push(Effect::Send(VoiceMessage::Join));

        // Re-announce non-default flags so the server picks up where a
        // previous socket left off
        if self.muted {
            effects.push(Effect::Send(VoiceMessage::MuteState {
                user_id: None,
                is_muted: true,
            }));
        }
        if self.deafened {
            effects.push(Effect::Send(VoiceMessage::DeafenState {
                user_id: None,
                is_deafened: true,
            }));
        }

        effects.push(Effect::StartCapture);
        self.arm(TimerKind::Ping, effects);
        if !self.armed.is_armed(TimerKind::HealthCheck) {
            self.arm(TimerKind::HealthCheck, effects);
        }
    }

    fn on_socket_closed(&mut self, code: u16, effects: &mut Vec<Effect>) {
        self.socket_open = false;

        // Already torn down (leave in progress); nothing to do
        if self.state == SessionState::Disconnected {
            return;
        }

        let reason = CloseReason::from_code(code);
        match reason {
            CloseReason::Normal => self.teardown(None, effects),
            CloseReason::AuthFailed => self.teardown(
                Some(VoiceError::AuthenticationFailure(format!("close {}", code))),
                effects,
            ),
            CloseReason::InvalidChannel => self.teardown(
                Some(VoiceError::MembershipRejected("channel not found".to_string())),
                effects,
            ),
            CloseReason::NotMember => self.teardown(
                Some(VoiceError::MembershipRejected(
                    "not a member of this channel".to_string(),
                )),
                effects,
            ),
            CloseReason::UserNotFound => self.teardown(
                Some(VoiceError::MembershipRejected("user not found".to_string())),
                effects,
            ),
            CloseReason::Transient(code) => self.begin_reconnect(code, effects),
        }
    }

    fn on_credential_refresh_failed(&mut self, detail: String, effects: &mut Vec<Effect>) {
        if self.state != SessionState::Connecting {
            return;
        }

        self.cancel(TimerKind::ConnectTimeout, effects);

        if self.reconnect_attempts == 0 {
            // Initial join: the attempt is aborted and surfaced
            self.teardown(Some(VoiceError::CredentialRefresh(detail)), effects);
        } else {
            // Reconnect attempt: counts against the retry budget
            self.schedule_retry(effects);
        }
    }

    /// Schedule the next reconnect attempt, or give up if the budget
    /// for this outage is spent
    fn begin_reconnect(&mut self, code: u16, effects: &mut Vec<Effect>) {
        self.state = SessionState::Connecting;
        self.cancel(TimerKind::Ping, effects);
        self.cancel(TimerKind::ConnectTimeout, effects);
        if self.capture_running {
            self.capture_running = false;
            effects.push(Effect::StopCapture);
        }

        if self.reconnect_attempts >= MAX_RECONNECT_ATTEMPTS {
            self.teardown(
                Some(VoiceError::TransientDisconnect(format!(
                    "gave up after {} reconnect attempts (close {})",
                    MAX_RECONNECT_ATTEMPTS, code
                ))),
                effects,
            );
        } else {
            // Full audio teardown between attempts; a successful reopen
            // rebuilds both sides (the exhausted branch stops playback
            // through teardown)
            effects.push(Effect::StopPlayback);
            self.reconnect_attempts += 1;
            self.arm(TimerKind::ReconnectBackoff, effects);
        }
    }

    /// Like [`Self::begin_reconnect`] but for attempts that failed before
    /// a socket ever existed (refresh failure, connect timeout)
    fn schedule_retry(&mut self, effects: &mut Vec<Effect>) {
        if self.reconnect_attempts >= MAX_RECONNECT_ATTEMPTS {
            self.teardown(
                Some(VoiceError::TransientDisconnect(format!(
                    "gave up after {} reconnect attempts",
                    MAX_RECONNECT_ATTEMPTS
                ))),
                effects,
            );
        } else {
            self.reconnect_attempts += 1;
            self.arm(TimerKind::ReconnectBackoff, effects);
        }
    }

    fn on_timer(&mut self, kind: TimerKind, effects: &mut Vec<Effect>) {
        // The deadline fired; it is no longer armed
        self.armed.set(kind, false);

        match kind {
            TimerKind::ConnectTimeout => {
                if self.state != SessionState::Connecting {
                    return;
                }
                effects.push(Effect::CloseSocket);
                if self.reconnect_attempts == 0 {
                    self.teardown(Some(VoiceError::ConnectionTimeout), effects);
                } else {
                    self.schedule_retry(effects);
                }
            }
            TimerKind::Ping => {
                if self.state == SessionState::Connected && self.socket_open {
                    effects.push(Effect::Send(VoiceMessage::Ping));
                    self.arm(TimerKind::Ping, effects);
                }
            }
            TimerKind::HealthCheck => {
                if self.state == SessionState::Disconnected {
                    return;
                }
                // Connected but the socket is gone: force a reconnect.
                // Normally close handling gets there first; this catches
                // a socket that silently died.
                if self.state == SessionState::Connected && !self.socket_open {
                    self.begin_reconnect(0, effects);
                }
                if self.state != SessionState::Disconnected {
                    self.arm(TimerKind::HealthCheck, effects);
                }
            }
            TimerKind::ReconnectBackoff => {
                if self.state == SessionState::Connecting {
                    effects.push(Effect::OpenSocket);
                    self.arm(TimerKind::ConnectTimeout, effects);
                }
            }
        }
    }

    fn on_leave_requested(&mut self, effects: &mut Vec<Effect>) {
        // Idempotent from any state
        if self.state == SessionState::Disconnected {
            return;
        }

        if self.socket_open {
            effects.push(Effect::Send(VoiceMessage::Leave));
        }
        self.teardown(None, effects);
    }

    /// Full teardown: cancel timers, stop capture and playback, close
    /// the socket, land in Disconnected. The effect order is the
    /// teardown order.
    fn teardown(&mut self, error: Option<VoiceError>, effects: &mut Vec<Effect>) {
        self.armed = TimerSet::default();
        effects.push(Effect::CancelAllTimers);

        if self.capture_running {
            self.capture_running = false;
        }
        effects.push(Effect::StopCapture);
        effects.push(Effect::StopPlayback);
        effects.push(Effect::CloseSocket);

        self.state = SessionState::Disconnected;
        self.socket_open = false;
        self.roster.clear();

        if let Some(error) = error {
            effects.push(Effect::SurfaceError(error));
        }
        effects.push(Effect::Shutdown);
    }

    // -------------------------------------------------------------------------
    // Audio
    // -------------------------------------------------------------------------

    fn on_capture_failed(&mut self, detail: String, effects: &mut Vec<Effect>) {
        if self.capture_running {
            // Mid-session: capture stops but the session stays up so the
            // operator keeps hearing the channel
            self.capture_running = false;
            effects.push(Effect::StopCapture);
            effects.push(Effect::SurfaceError(VoiceError::DeviceUnavailable(detail)));
        } else {
            // At join time the connect is all-or-nothing
            if self.socket_open {
                effects.push(Effect::Send(VoiceMessage::Leave));
            }
            self.teardown(Some(VoiceError::DeviceUnavailable(detail)), effects);
        }
    }

    fn on_local_frame(&mut self, samples: Vec<f32>, timestamp_ms: u64, effects: &mut Vec<Effect>) {
        // Muted means captured but never transmitted
        if self.muted || self.state != SessionState::Connected || !self.socket_open {
            return;
        }

        effects.push(Effect::Send(VoiceMessage::Audio {
            data: encode_base64(&samples),
            channel_id: Some(self.channel_id.clone()),
            timestamp: Some(timestamp_ms),
        }));
    }

    fn on_binary(&mut self, bytes: &[u8], effects: &mut Vec<Effect>) {
        // Deafened drops inbound audio before decoding
        if self.deafened {
            return;
        }

        match decode_frame(bytes) {
            Ok(samples) => effects.push(Effect::PlayFrame {
                samples,
                gain: self.gain(),
            }),
            Err(e) => effects.push(Effect::SurfaceError(VoiceError::EncodeDecode(e))),
        }
    }

    fn gain(&self) -> f32 {
        self.volume as f32 / 100.0
    }

    // -------------------------------------------------------------------------
    // Inbound messages
    // -------------------------------------------------------------------------

    fn on_message(&mut self, msg: VoiceMessage, effects: &mut Vec<Effect>) {
        match msg {
            VoiceMessage::Participants { participants } => {
                self.roster.replace(participants);
            }
            VoiceMessage::ParticipantJoined { participant } => {
                self.roster.add(participant);
            }
            VoiceMessage::ParticipantLeft { user_id } => {
                self.roster.remove(&user_id);
            }
            VoiceMessage::Audio {
                data, channel_id, ..
            } => {
                if self.deafened {
                    return;
                }
                // Ignore frames addressed to another channel
                if let Some(cid) = channel_id
                    && cid != self.channel_id
                {
                    return;
                }
                match decode_base64(&data) {
                    Ok(samples) => effects.push(Effect::PlayFrame {
                        samples,
                        gain: self.gain(),
                    }),
                    Err(e) => effects.push(Effect::SurfaceError(VoiceError::EncodeDecode(e))),
                }
            }
            VoiceMessage::Ping => {
                if self.socket_open {
                    effects.push(Effect::Send(VoiceMessage::Pong));
                }
            }
            VoiceMessage::Pong => {
                // Keepalive acknowledged; liveness is tracked through the
                // socket itself
            }
            VoiceMessage::TokenRefresh { token } => {
                effects.push(Effect::StoreCredential(token));
            }
            VoiceMessage::ConnectionStatus { .. } => {
                // Informational; the runner logs it
            }
            VoiceMessage::Echo { original_message } => {
                // Unwrap and handle the embedded message as if it had
                // arrived directly
                if let Ok(inner) = VoiceMessage::from_value(original_message) {
                    self.on_message(inner, effects);
                }
            }
            VoiceMessage::MuteState { user_id, is_muted } => {
                if let Some(id) = user_id {
                    self.roster.update_flags(&id, FlagPatch::muted(is_muted));
                }
            }
            VoiceMessage::DeafenState {
                user_id,
                is_deafened,
            } => {
                if let Some(id) = user_id {
                    self.roster
                        .update_flags(&id, FlagPatch::deafened(is_deafened));
                }
            }
            VoiceMessage::VideoState {
                user_id,
                is_enabled,
            } => {
                if let Some(id) = user_id {
                    self.roster
                        .update_flags(&id, FlagPatch::video_enabled(is_enabled));
                }
            }
            VoiceMessage::VideoStart { user_id } => {
                if let Some(id) = user_id {
                    self.roster.update_flags(&id, FlagPatch::video_enabled(true));
                }
            }
            VoiceMessage::VideoStop { user_id } => {
                if let Some(id) = user_id {
                    self.roster
                        .update_flags(&id, FlagPatch::video_enabled(false));
                }
            }
            VoiceMessage::ScreenShareState {
                user_id,
                is_enabled,
            } => {
                if let Some(id) = user_id {
                    self.roster
                        .update_flags(&id, FlagPatch::screen_sharing(is_enabled));
                }
            }
            VoiceMessage::ScreenShareStart { user_id } => {
                if let Some(id) = user_id {
                    self.roster
                        .update_flags(&id, FlagPatch::screen_sharing(true));
                }
            }
            VoiceMessage::ScreenShareStop { user_id } => {
                if let Some(id) = user_id {
                    self.roster
                        .update_flags(&id, FlagPatch::screen_sharing(false));
                }
            }
            VoiceMessage::Join | VoiceMessage::Leave => {
                // Client-to-server only; ignore if echoed back
            }
            VoiceMessage::Unrecognized => {
                // Already logged by the runner at parse time
            }
        }
    }

    // -------------------------------------------------------------------------
    // Operator toggles
    // -------------------------------------------------------------------------

    fn on_toggle_mute(&mut self, effects: &mut Vec<Effect>) {
        self.muted = !self.muted;
        if self.socket_open {
            effects.push(Effect::Send(VoiceMessage::MuteState {
                user_id: None,
                is_muted: self.muted,
            }));
        }
    }

    fn on_toggle_deafen(&mut self, effects: &mut Vec<Effect>) {
        self.deafened = !self.deafened;
        if self.socket_open {
            effects.push(Effect::Send(VoiceMessage::DeafenState {
                user_id: None,
                is_deafened: self.deafened,
            }));
        }
    }

    fn on_toggle_video(&mut self, effects: &mut Vec<Effect>) {
        self.video_enabled = !self.video_enabled;
        if self.socket_open {
            effects.push(Effect::Send(VoiceMessage::VideoState {
                user_id: None,
                is_enabled: self.video_enabled,
            }));
            effects.push(Effect::Send(if self.video_enabled {
                VoiceMessage::VideoStart { user_id: None }
            } else {
                VoiceMessage::VideoStop { user_id: None }
            }));
        }
    }

    fn on_toggle_screen_share(&mut self, effects: &mut Vec<Effect>) {
        self.screen_sharing = !self.screen_sharing;
        if self.socket_open {
            effects.push(Effect::Send(VoiceMessage::ScreenShareState {
                user_id: None,
                is_enabled: self.screen_sharing,
            }));
            effects.push(Effect::Send(if self.screen_sharing {
                VoiceMessage::ScreenShareStart { user_id: None }
            } else {
                VoiceMessage::ScreenShareStop { user_id: None }
            }));
        }
    }

    // -------------------------------------------------------------------------
    // Timer bookkeeping
    // -------------------------------------------------------------------------

    fn arm(&mut self, kind: TimerKind, effects: &mut Vec<Effect>) {
        self.armed.set(kind, true);
        effects.push(Effect::ArmTimer(kind));
    }

    fn cancel(&mut self, kind: TimerKind, effects: &mut Vec<Effect>) {
        if self.armed.is_armed(kind) {
            self.armed.set(kind, false);
            effects.push(Effect::CancelTimer(kind));
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_common::codec::encode_frame;

    fn machine() -> SessionMachine {
        SessionMachine::new("general".to_string(), "me".to_string())
    }

    fn connected_machine() -> SessionMachine {
        let mut m = machine();
        m.handle(SessionEvent::ConnectRequested);
        m.handle(SessionEvent::SocketOpened);
        m.handle(SessionEvent::CaptureStarted);
        m
    }

    fn participant(id: &str) -> Participant {
        Participant {
            id: id.to_string(),
            username: format!("user-{id}"),
            is_muted: false,
            is_deafened: false,
            is_video_enabled: false,
            is_screen_sharing: false,
        }
    }

    fn has_send(effects: &[Effect], want: &VoiceMessage) -> bool {
        effects
            .iter()
            .any(|e| matches!(e, Effect::Send(msg) if msg == want))
    }

    // ---- Join happy path -----------------------------------------------------

    #[test]
    fn test_connect_opens_socket_and_arms_timeout() {
        let mut m = machine();
        let effects = m.handle(SessionEvent::ConnectRequested);

        assert_eq!(m.state(), SessionState::Connecting);
        assert!(effects.iter().any(|e| matches!(e, Effect::OpenSocket)));
        assert!(m.armed_timers().is_armed(TimerKind::ConnectTimeout));
    }

    #[test]
    fn test_socket_open_joins_and_starts_session() {
        let mut m = machine();
        m.handle(SessionEvent::ConnectRequested);
        let effects = m.handle(SessionEvent::SocketOpened);

        assert_eq!(m.state(), SessionState::Connected);
        assert!(has_send(&effects, &VoiceMessage::Join));
        assert!(effects.iter().any(|e| matches!(e, Effect::StartCapture)));
        assert!(!m.armed_timers().is_armed(TimerKind::ConnectTimeout));
        assert!(m.armed_timers().is_armed(TimerKind::Ping));
        assert!(m.armed_timers().is_armed(TimerKind::HealthCheck));
    }

    #[test]
    fn test_second_connect_rejected() {
        let mut m = connected_machine();
        let effects = m.handle(SessionEvent::ConnectRequested);
        assert!(effects.is_empty());
        assert_eq!(m.state(), SessionState::Connected);
    }

    // ---- Terminal closures ---------------------------------------------------

    #[test]
    fn test_membership_rejection_is_terminal() {
        let mut m = connected_machine();
        let effects = m.handle(SessionEvent::SocketClosed { code: 4002 });

        assert_eq!(m.state(), SessionState::Disconnected);
        assert!(m.armed_timers().is_empty());
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::SurfaceError(VoiceError::MembershipRejected(_))
        )));
        assert!(effects.iter().any(|e| matches!(e, Effect::Shutdown)));
        // No reconnect scheduled
        assert!(!m.armed_timers().is_armed(TimerKind::ReconnectBackoff));
    }

    #[test]
    fn test_auth_failure_is_terminal() {
        let mut m = connected_machine();
        let effects = m.handle(SessionEvent::SocketClosed { code: 4000 });

        assert_eq!(m.state(), SessionState::Disconnected);
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::SurfaceError(VoiceError::AuthenticationFailure(_))
        )));
    }

    #[test]
    fn test_clean_close_tears_down_without_error() {
        let mut m = connected_machine();
        let effects = m.handle(SessionEvent::SocketClosed { code: 1000 });

        assert_eq!(m.state(), SessionState::Disconnected);
        assert!(!effects.iter().any(|e| matches!(e, Effect::SurfaceError(_))));
        assert!(effects.iter().any(|e| matches!(e, Effect::Shutdown)));
    }

    // ---- Reconnect -----------------------------------------------------------

    #[test]
    fn test_abnormal_close_schedules_single_reconnect() {
        let mut m = connected_machine();
        let effects = m.handle(SessionEvent::SocketClosed { code: 1006 });

        assert_eq!(m.state(), SessionState::Connecting);
        assert_eq!(m.reconnect_attempts(), 1);
        assert!(m.armed_timers().is_armed(TimerKind::ReconnectBackoff));
        assert!(effects.iter().any(|e| matches!(e, Effect::StopCapture)));
        assert!(effects.iter().any(|e| matches!(e, Effect::StopPlayback)));
        // Exactly one backoff armed, no immediate reconnect
        assert!(!effects.iter().any(|e| matches!(e, Effect::OpenSocket)));
        assert_eq!(
            effects
                .iter()
                .filter(|e| matches!(e, Effect::ArmTimer(TimerKind::ReconnectBackoff)))
                .count(),
            1
        );
    }

    #[test]
    fn test_backoff_fires_reconnect_attempt() {
        let mut m = connected_machine();
        m.handle(SessionEvent::SocketClosed { code: 1006 });
        let effects = m.handle(SessionEvent::Timer(TimerKind::ReconnectBackoff));

        assert!(effects.iter().any(|e| matches!(e, Effect::OpenSocket)));
        assert!(m.armed_timers().is_armed(TimerKind::ConnectTimeout));
    }

    #[test]
    fn test_successful_reopen_resets_attempt_counter() {
        let mut m = connected_machine();
        m.handle(SessionEvent::SocketClosed { code: 1006 });
        m.handle(SessionEvent::Timer(TimerKind::ReconnectBackoff));
        m.handle(SessionEvent::SocketOpened);
        assert_eq!(m.reconnect_attempts(), 0);
        assert_eq!(m.state(), SessionState::Connected);
    }

    #[test]
    fn test_reconnect_attempts_capped() {
        let mut m = connected_machine();

        for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
            m.handle(SessionEvent::SocketClosed { code: 1006 });
            assert_eq!(m.reconnect_attempts(), attempt);
            m.handle(SessionEvent::Timer(TimerKind::ReconnectBackoff));
            assert_eq!(m.state(), SessionState::Connecting);
        }

        // One more failure exhausts the budget
        let effects = m.handle(SessionEvent::SocketClosed { code: 1006 });
        assert_eq!(m.state(), SessionState::Disconnected);
        assert!(m.armed_timers().is_empty());
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::SurfaceError(VoiceError::TransientDisconnect(_))
        )));
    }

    #[test]
    fn test_reconnect_reannounces_flags() {
        let mut m = connected_machine();
        m.handle(SessionEvent::ToggleMute);
        m.handle(SessionEvent::SocketClosed { code: 1006 });
        m.handle(SessionEvent::Timer(TimerKind::ReconnectBackoff));
        let effects = m.handle(SessionEvent::SocketOpened);

        assert!(has_send(&effects, &VoiceMessage::Join));
        assert!(has_send(
            &effects,
            &VoiceMessage::MuteState {
                user_id: None,
                is_muted: true
            }
        ));
    }

    #[test]
    fn test_connect_timeout_on_initial_join_surfaces() {
        let mut m = machine();
        m.handle(SessionEvent::ConnectRequested);
        let effects = m.handle(SessionEvent::Timer(TimerKind::ConnectTimeout));

        assert_eq!(m.state(), SessionState::Disconnected);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::SurfaceError(VoiceError::ConnectionTimeout))));
    }

    #[test]
    fn test_credential_refresh_failure_aborts_initial_join() {
        let mut m = machine();
        m.handle(SessionEvent::ConnectRequested);
        let effects = m.handle(SessionEvent::CredentialRefreshFailed {
            detail: "401".to_string(),
        });

        assert_eq!(m.state(), SessionState::Disconnected);
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::SurfaceError(VoiceError::CredentialRefresh(_))
        )));
    }

    #[test]
    fn test_credential_refresh_failure_during_reconnect_retries() {
        let mut m = connected_machine();
        m.handle(SessionEvent::SocketClosed { code: 1006 });
        m.handle(SessionEvent::Timer(TimerKind::ReconnectBackoff));
        m.handle(SessionEvent::CredentialRefreshFailed {
            detail: "timeout".to_string(),
        });

        assert_eq!(m.state(), SessionState::Connecting);
        assert_eq!(m.reconnect_attempts(), 2);
        assert!(m.armed_timers().is_armed(TimerKind::ReconnectBackoff));
    }

    // ---- Keepalive -----------------------------------------------------------

    #[test]
    fn test_ping_timer_sends_and_rearms() {
        let mut m = connected_machine();
        let effects = m.handle(SessionEvent::Timer(TimerKind::Ping));

        assert!(has_send(&effects, &VoiceMessage::Ping));
        assert!(m.armed_timers().is_armed(TimerKind::Ping));
    }

    #[test]
    fn test_inbound_ping_answered_with_pong() {
        let mut m = connected_machine();
        let effects = m.handle(SessionEvent::MessageReceived(VoiceMessage::Ping));
        assert!(has_send(&effects, &VoiceMessage::Pong));
    }

    #[test]
    fn test_health_check_rearms_while_in_session() {
        let mut m = connected_machine();
        m.handle(SessionEvent::Timer(TimerKind::HealthCheck));
        assert!(m.armed_timers().is_armed(TimerKind::HealthCheck));
    }

    // ---- Outbound audio gating -----------------------------------------------

    #[test]
    fn test_local_frame_transmitted_when_unmuted() {
        let mut m = connected_machine();
        let effects = m.handle(SessionEvent::LocalFrame {
            samples: vec![0.5; 1024],
            timestamp_ms: 42,
        });

        let sent = effects.iter().any(|e| {
            matches!(
                e,
                Effect::Send(VoiceMessage::Audio {
                    channel_id: Some(cid),
                    timestamp: Some(42),
                    ..
                }) if cid == "general"
            )
        });
        assert!(sent);
    }

    #[test]
    fn test_mute_gates_outbound_frames() {
        let mut m = connected_machine();
        m.handle(SessionEvent::ToggleMute);

        let effects = m.handle(SessionEvent::LocalFrame {
            samples: vec![0.5; 1024],
            timestamp_ms: 1,
        });
        assert!(effects.is_empty());

        // Unmute resumes transmission
        m.handle(SessionEvent::ToggleMute);
        let effects = m.handle(SessionEvent::LocalFrame {
            samples: vec![0.5; 1024],
            timestamp_ms: 2,
        });
        assert!(!effects.is_empty());
    }

    #[test]
    fn test_toggle_mute_announces_state() {
        let mut m = connected_machine();
        let effects = m.handle(SessionEvent::ToggleMute);
        assert!(has_send(
            &effects,
            &VoiceMessage::MuteState {
                user_id: None,
                is_muted: true
            }
        ));
    }

    #[test]
    fn test_toggle_video_sends_state_and_start() {
        let mut m = connected_machine();
        let effects = m.handle(SessionEvent::ToggleVideo);
        assert!(has_send(
            &effects,
            &VoiceMessage::VideoState {
                user_id: None,
                is_enabled: true
            }
        ));
        assert!(has_send(&effects, &VoiceMessage::VideoStart { user_id: None }));

        let effects = m.handle(SessionEvent::ToggleVideo);
        assert!(has_send(&effects, &VoiceMessage::VideoStop { user_id: None }));
    }

    #[test]
    fn test_toggle_screen_share_sends_state_and_start() {
        let mut m = connected_machine();
        let effects = m.handle(SessionEvent::ToggleScreenShare);
        assert!(has_send(
            &effects,
            &VoiceMessage::ScreenShareState {
                user_id: None,
                is_enabled: true
            }
        ));
        assert!(has_send(
            &effects,
            &VoiceMessage::ScreenShareStart { user_id: None }
        ));
    }

    // ---- Inbound audio gating ------------------------------------------------

    #[test]
    fn test_binary_frame_plays_at_current_volume() {
        let mut m = connected_machine();
        m.handle(SessionEvent::SetVolume(50));

        let bytes = encode_frame(&vec![0.25; 1024]);
        let effects = m.handle(SessionEvent::BinaryReceived(bytes));

        let played = effects
            .iter()
            .any(|e| matches!(e, Effect::PlayFrame { gain, .. } if (*gain - 0.5).abs() < 0.001));
        assert!(played);
    }

    #[test]
    fn test_deafen_drops_binary_pre_decode() {
        let mut m = connected_machine();
        m.handle(SessionEvent::ToggleDeafen);

        // Even a malformed frame produces no decode error while deafened,
        // which is what "dropped before decoding" means
        let effects = m.handle(SessionEvent::BinaryReceived(vec![0, 1, 2]));
        assert!(effects.is_empty());
    }

    #[test]
    fn test_deafen_drops_json_audio() {
        let mut m = connected_machine();
        m.handle(SessionEvent::ToggleDeafen);

        let effects = m.handle(SessionEvent::MessageReceived(VoiceMessage::Audio {
            data: chorus_common::codec::encode_base64(&[0.5; 64]),
            channel_id: Some("general".to_string()),
            timestamp: None,
        }));
        assert!(effects.is_empty());
    }

    #[test]
    fn test_audio_for_other_channel_dropped() {
        let mut m = connected_machine();
        let effects = m.handle(SessionEvent::MessageReceived(VoiceMessage::Audio {
            data: chorus_common::codec::encode_base64(&[0.5; 64]),
            channel_id: Some("other".to_string()),
            timestamp: None,
        }));
        assert!(effects.is_empty());
    }

    #[test]
    fn test_volume_zero_still_decodes_and_plays() {
        let mut m = connected_machine();
        m.handle(SessionEvent::SetVolume(0));

        let bytes = encode_frame(&vec![0.25; 64]);
        let effects = m.handle(SessionEvent::BinaryReceived(bytes));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::PlayFrame { gain, .. } if *gain == 0.0)));
    }

    #[test]
    fn test_volume_clamped_to_100() {
        let mut m = connected_machine();
        m.handle(SessionEvent::SetVolume(200));
        assert_eq!(m.snapshot().volume, 100);
    }

    #[test]
    fn test_malformed_binary_surfaces_codec_fault() {
        let mut m = connected_machine();
        let effects = m.handle(SessionEvent::BinaryReceived(vec![0, 1, 2]));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::SurfaceError(VoiceError::EncodeDecode(_)))));
    }

    // ---- Roster --------------------------------------------------------------

    #[test]
    fn test_roster_tracks_membership_messages() {
        let mut m = connected_machine();
        m.handle(SessionEvent::MessageReceived(VoiceMessage::Participants {
            participants: vec![participant("u1"), participant("u2")],
        }));
        assert_eq!(m.snapshot().participants.len(), 2);

        m.handle(SessionEvent::MessageReceived(
            VoiceMessage::ParticipantJoined {
                participant: participant("u3"),
            },
        ));
        assert_eq!(m.snapshot().participants.len(), 3);

        m.handle(SessionEvent::MessageReceived(
            VoiceMessage::ParticipantLeft {
                user_id: "u1".to_string(),
            },
        ));
        assert_eq!(m.snapshot().participants.len(), 2);
    }

    #[test]
    fn test_roster_never_contains_local_user() {
        let mut m = connected_machine();
        m.handle(SessionEvent::MessageReceived(VoiceMessage::Participants {
            participants: vec![participant("me"), participant("u1")],
        }));
        let snapshot = m.snapshot();
        assert_eq!(snapshot.participants.len(), 1);
        assert_eq!(snapshot.participants[0].id, "u1");
    }

    #[test]
    fn test_inbound_flag_change_updates_roster() {
        let mut m = connected_machine();
        m.handle(SessionEvent::MessageReceived(VoiceMessage::Participants {
            participants: vec![participant("u1")],
        }));

        m.handle(SessionEvent::MessageReceived(VoiceMessage::MuteState {
            user_id: Some("u1".to_string()),
            is_muted: true,
        }));
        assert!(m.snapshot().participants[0].is_muted);

        m.handle(SessionEvent::MessageReceived(VoiceMessage::VideoStart {
            user_id: Some("u1".to_string()),
        }));
        assert!(m.snapshot().participants[0].is_video_enabled);
    }

    #[test]
    fn test_echo_unwraps_to_inner_message() {
        let mut m = connected_machine();
        let inner = serde_json::json!({
            "type": "participant_joined",
            "participant": {"id": "u5", "username": "echoed"}
        });
        m.handle(SessionEvent::MessageReceived(VoiceMessage::Echo {
            original_message: inner,
        }));
        assert_eq!(m.snapshot().participants.len(), 1);
    }

    #[test]
    fn test_token_refresh_stores_credential() {
        let mut m = connected_machine();
        let effects = m.handle(SessionEvent::MessageReceived(VoiceMessage::TokenRefresh {
            token: "fresh".to_string(),
        }));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::StoreCredential(t) if t == "fresh")));
    }

    // ---- Capture faults ------------------------------------------------------

    #[test]
    fn test_capture_failure_at_join_is_all_or_nothing() {
        let mut m = machine();
        m.handle(SessionEvent::ConnectRequested);
        m.handle(SessionEvent::SocketOpened);
        // Capture never started; the failure aborts the whole join
        let effects = m.handle(SessionEvent::CaptureFailed {
            detail: "no mic".to_string(),
        });

        assert_eq!(m.state(), SessionState::Disconnected);
        assert!(has_send(&effects, &VoiceMessage::Leave));
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::SurfaceError(VoiceError::DeviceUnavailable(_))
        )));
        assert!(effects.iter().any(|e| matches!(e, Effect::Shutdown)));
    }

    #[test]
    fn test_capture_failure_mid_session_is_non_fatal() {
        let mut m = connected_machine();
        let effects = m.handle(SessionEvent::CaptureFailed {
            detail: "mic unplugged".to_string(),
        });

        // Session stays up; only capture stops
        assert_eq!(m.state(), SessionState::Connected);
        assert!(effects.iter().any(|e| matches!(e, Effect::StopCapture)));
        assert!(!effects.iter().any(|e| matches!(e, Effect::StopPlayback)));
        assert!(!effects.iter().any(|e| matches!(e, Effect::Shutdown)));
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::SurfaceError(VoiceError::DeviceUnavailable(_))
        )));
    }

    #[test]
    fn test_playback_continues_after_capture_failure() {
        let mut m = connected_machine();
        m.handle(SessionEvent::CaptureFailed {
            detail: "mic unplugged".to_string(),
        });

        // The operator keeps hearing the channel: inbound frames still
        // decode and play after the microphone died
        let bytes = encode_frame(&vec![0.25; 64]);
        let effects = m.handle(SessionEvent::BinaryReceived(bytes));
        assert!(effects.iter().any(|e| matches!(e, Effect::PlayFrame { .. })));
    }

    // ---- Leave ---------------------------------------------------------------

    #[test]
    fn test_leave_sends_leave_and_tears_down_in_order() {
        let mut m = connected_machine();
        let effects = m.handle(SessionEvent::LeaveRequested);

        assert_eq!(m.state(), SessionState::Disconnected);
        assert!(has_send(&effects, &VoiceMessage::Leave));

        // Teardown order: timers, capture, playback, socket, shutdown
        let positions: Vec<usize> = [
            effects
                .iter()
                .position(|e| matches!(e, Effect::CancelAllTimers)),
            effects.iter().position(|e| matches!(e, Effect::StopCapture)),
            effects
                .iter()
                .position(|e| matches!(e, Effect::StopPlayback)),
            effects.iter().position(|e| matches!(e, Effect::CloseSocket)),
            effects.iter().position(|e| matches!(e, Effect::Shutdown)),
        ]
        .into_iter()
        .map(|p| p.unwrap())
        .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_double_leave_is_idempotent() {
        let mut m = connected_machine();
        m.handle(SessionEvent::LeaveRequested);
        let effects = m.handle(SessionEvent::LeaveRequested);

        assert!(effects.is_empty());
        assert_eq!(m.state(), SessionState::Disconnected);
        assert!(m.armed_timers().is_empty());
    }

    #[test]
    fn test_close_after_leave_is_ignored() {
        let mut m = connected_machine();
        m.handle(SessionEvent::LeaveRequested);
        let effects = m.handle(SessionEvent::SocketClosed { code: 1006 });

        assert!(effects.is_empty());
        assert_eq!(m.state(), SessionState::Disconnected);
        assert!(!m.armed_timers().is_armed(TimerKind::ReconnectBackoff));
    }

    #[test]
    fn test_leave_clears_roster() {
        let mut m = connected_machine();
        m.handle(SessionEvent::MessageReceived(VoiceMessage::Participants {
            participants: vec![participant("u1")],
        }));
        m.handle(SessionEvent::LeaveRequested);
        assert!(m.snapshot().participants.is_empty());
    }
}
