//! Voice session runner
//!
//! Drives the [`SessionMachine`] with real I/O: the WebSocket connection,
//! the four session timers, and the audio pipeline (capture, conditioning,
//! frame assembly, playback). Runs on a dedicated OS thread because cpal
//! streams are not Send; the thread hosts its own current-thread tokio
//! runtime.
//!
//! Session state is published through a watch channel as
//! [`SessionSnapshot`]s; faults and server-pushed credentials arrive on a
//! notice channel.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use chorus_common::protocol::VoiceMessage;
use chorus_common::{
    CONNECT_TIMEOUT_SECS, HEALTH_CHECK_INTERVAL_SECS, PING_INTERVAL_SECS, RECONNECT_BACKOFF_SECS,
};

use crate::api::CredentialSource;
use crate::capture::{AudioCapture, FrameAssembler};
use crate::conditioner::{BLOCK_SAMPLES, Conditioner, ConditioningSettings};
use crate::error::VoiceError;
use crate::playback::PlaybackSink;
use crate::state::{Effect, SessionEvent, SessionMachine, SessionSnapshot, SessionState, TimerKind};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Interval for draining capture and checking device errors (10ms blocks)
const AUDIO_TICK_MS: u64 = 10;

// =============================================================================
// Session Configuration
// =============================================================================

/// Configuration for starting a voice session
pub struct SessionConfig {
    /// Base WebSocket URL of the voice server (e.g. `wss://chorus.example`)
    pub server_url: String,
    /// Channel to join
    pub channel_id: String,
    /// Local user id (kept out of the roster)
    pub user_id: String,
    /// Input device name (empty for system default)
    pub input_device: String,
    /// Output device name (empty for system default)
    pub output_device: String,
    /// Capture conditioning stages
    pub conditioning: ConditioningSettings,
    /// Start the session muted (carried over from a previous session)
    pub start_muted: bool,
    /// Start the session deafened
    pub start_deafened: bool,
    /// Playback volume 0-100
    pub volume: u8,
    /// Supplies a fresh credential for each connect attempt
    pub credentials: Arc<dyn CredentialSource>,
}

/// Commands accepted by a running session
#[derive(Debug)]
enum SessionCommand {
    ToggleMute,
    ToggleDeafen,
    ToggleVideo,
    ToggleScreenShare,
    SetVolume(u8),
    SetConditioning(ConditioningSettings),
    Leave,
}

/// Out-of-band notifications from a running session
#[derive(Debug)]
pub enum SessionNotice {
    /// A classified fault reached the operator
    Fault(VoiceError),
    /// The server pushed a refreshed credential
    CredentialUpdated(String),
}

/// Result of a spawned connect attempt
enum ConnectOutcome {
    Opened(Box<WsStream>),
    RefreshFailed(String),
    Failed(String),
}

// =============================================================================
// Timers
// =============================================================================

const TIMER_COUNT: usize = 4;

const TIMERS: [TimerKind; TIMER_COUNT] = [
    TimerKind::ConnectTimeout,
    TimerKind::Ping,
    TimerKind::HealthCheck,
    TimerKind::ReconnectBackoff,
];

fn timer_index(kind: TimerKind) -> usize {
    match kind {
        TimerKind::ConnectTimeout => 0,
        TimerKind::Ping => 1,
        TimerKind::HealthCheck => 2,
        TimerKind::ReconnectBackoff => 3,
    }
}

fn timer_duration(kind: TimerKind) -> Duration {
    let secs = match kind {
        TimerKind::ConnectTimeout => CONNECT_TIMEOUT_SECS,
        TimerKind::Ping => PING_INTERVAL_SECS,
        TimerKind::HealthCheck => HEALTH_CHECK_INTERVAL_SECS,
        TimerKind::ReconnectBackoff => RECONNECT_BACKOFF_SECS,
    };
    Duration::from_secs(secs)
}

/// Wait for the earliest armed deadline, pending forever when none is armed
async fn next_due_timer(deadlines: &[Option<Instant>; TIMER_COUNT]) -> TimerKind {
    let mut due: Option<(TimerKind, Instant)> = None;
    for (i, deadline) in deadlines.iter().enumerate() {
        if let Some(at) = deadline
            && due.is_none_or(|(_, current)| *at < current)
        {
            due = Some((TIMERS[i], *at));
        }
    }

    match due {
        Some((kind, at)) => {
            tokio::time::sleep_until(at).await;
            kind
        }
        None => std::future::pending().await,
    }
}

/// Read the next socket message, pending forever when no socket is open
async fn next_ws_message(
    ws: &mut Option<WsStream>,
) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>> {
    match ws {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Build the signaling URL for a channel, with the credential as a query
/// parameter
fn session_url(server_url: &str, channel_id: &str, token: &str) -> String {
    format!(
        "{}/ws/voice/{}?token={}",
        server_url.trim_end_matches('/'),
        utf8_percent_encode(channel_id, NON_ALPHANUMERIC),
        utf8_percent_encode(token, NON_ALPHANUMERIC),
    )
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// =============================================================================
// Audio Pipeline
// =============================================================================

/// The capture side of the audio path: input stream, conditioning,
/// frame assembly
///
/// Held separately from the playback sink so a dead microphone stops
/// transmission without silencing the channel.
struct CaptureChain {
    capture: AudioCapture,
    /// None when the processor failed to initialize (raw capture)
    conditioner: Option<Conditioner>,
    assembler: FrameAssembler,
}

impl CaptureChain {
    fn stop(&mut self) {
        self.capture.stop();
        self.assembler.clear();
    }

    /// Drain captured audio through conditioning into wire frames
    fn drain_frames(&mut self) -> Vec<Vec<f32>> {
        let mut frames = Vec::new();

        while let Some(mut block) = self.capture.take_block(BLOCK_SAMPLES) {
            if let Some(conditioner) = &mut self.conditioner
                && let Err(e) = conditioner.process_capture_block(&mut block)
            {
                debug!("Capture conditioning error: {}", e);
            }
            self.assembler.push(&block);
        }

        while let Some(frame) = self.assembler.pop_frame() {
            frames.push(frame);
        }

        frames
    }

    /// Feed a frame about to be played to the echo canceller
    fn analyze_render(&mut self, samples: &[f32]) {
        if let Some(conditioner) = &mut self.conditioner {
            for block in samples.chunks_exact(BLOCK_SAMPLES) {
                if let Err(e) = conditioner.analyze_render_block(block) {
                    debug!("Render analysis error: {}", e);
                }
            }
        }
    }
}

/// Bring up both sides of the audio path
///
/// All-or-nothing: if either device fails, neither is kept.
fn start_audio(config: &SessionConfig) -> Result<(CaptureChain, PlaybackSink), VoiceError> {
    let capture = AudioCapture::new(&config.input_device)?;
    let playback = PlaybackSink::new(&config.output_device)?;

    capture.start()?;
    playback.start()?;

    // Conditioning is best-effort; a processor failure downgrades to
    // raw capture instead of failing the join
    let conditioner = match Conditioner::new(config.conditioning) {
        Ok(c) => Some(c),
        Err(e) => {
            warn!("Audio conditioning disabled: {}", e);
            None
        }
    };

    Ok((
        CaptureChain {
            capture,
            conditioner,
            assembler: FrameAssembler::new(),
        },
        playback,
    ))
}

// =============================================================================
// Session Runner
// =============================================================================

/// Run a voice session to completion
///
/// Feeds socket, timer, audio, and command events through the state
/// machine and interprets the effects it returns. Returns when the
/// machine emits [`Effect::Shutdown`].
async fn run_session(
    config: SessionConfig,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    notice_tx: mpsc::UnboundedSender<SessionNotice>,
    mut command_rx: mpsc::UnboundedReceiver<SessionCommand>,
) {
    let mut machine = SessionMachine::new(config.channel_id.clone(), config.user_id.clone());
    machine.restore_flags(config.start_muted, config.start_deafened, config.volume);

    let (connect_tx, mut connect_rx) = mpsc::unbounded_channel::<ConnectOutcome>();

    let mut ws: Option<WsStream> = None;
    let mut deadlines: [Option<Instant>; TIMER_COUNT] = [None; TIMER_COUNT];
    let mut capture_chain: Option<CaptureChain> = None;
    let mut playback: Option<PlaybackSink> = None;
    let mut pending_connect: Option<tokio::task::JoinHandle<()>> = None;
    let mut done = false;

    let mut audio_tick = tokio::time::interval(Duration::from_millis(AUDIO_TICK_MS));

    let mut queue: VecDeque<SessionEvent> = VecDeque::new();
    queue.push_back(SessionEvent::ConnectRequested);

    'outer: loop {
        // Drain queued events through the machine before waiting for I/O
        while let Some(event) = queue.pop_front() {
            let effects = machine.handle(event);
            let followups = apply_effects(
                effects,
                &config,
                &mut ws,
                &mut deadlines,
                &mut capture_chain,
                &mut playback,
                &mut pending_connect,
                &connect_tx,
                &notice_tx,
                &mut done,
            )
            .await;
            queue.extend(followups);

            let _ = snapshot_tx.send(machine.snapshot());

            if done {
                break 'outer;
            }
        }

        tokio::select! {
            cmd = command_rx.recv() => {
                match cmd {
                    Some(SessionCommand::ToggleMute) => queue.push_back(SessionEvent::ToggleMute),
                    Some(SessionCommand::ToggleDeafen) => queue.push_back(SessionEvent::ToggleDeafen),
                    Some(SessionCommand::ToggleVideo) => queue.push_back(SessionEvent::ToggleVideo),
                    Some(SessionCommand::ToggleScreenShare) => {
                        queue.push_back(SessionEvent::ToggleScreenShare)
                    }
                    Some(SessionCommand::SetVolume(volume)) => {
                        queue.push_back(SessionEvent::SetVolume(volume))
                    }
                    Some(SessionCommand::SetConditioning(settings)) => {
                        if let Some(chain) = &mut capture_chain
                            && let Some(conditioner) = &mut chain.conditioner
                        {
                            conditioner.update_settings(settings);
                        }
                    }
                    // A dropped handle means the session should end
                    Some(SessionCommand::Leave) | None => {
                        queue.push_back(SessionEvent::LeaveRequested)
                    }
                }
            }

            outcome = connect_rx.recv() => {
                match outcome {
                    Some(ConnectOutcome::Opened(stream)) => {
                        ws = Some(*stream);
                        queue.push_back(SessionEvent::SocketOpened);
                    }
                    Some(ConnectOutcome::RefreshFailed(detail)) => {
                        warn!("Credential refresh failed: {}", detail);
                        queue.push_back(SessionEvent::CredentialRefreshFailed { detail });
                    }
                    Some(ConnectOutcome::Failed(detail)) => {
                        warn!("Connect attempt failed: {}", detail);
                        // A failed connect looks like an abnormal closure
                        queue.push_back(SessionEvent::SocketClosed { code: 1006 });
                    }
                    None => {}
                }
            }

            msg = next_ws_message(&mut ws) => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match VoiceMessage::parse(&text) {
                            Ok(VoiceMessage::Unrecognized) => {
                                warn!("Unrecognized message: {}", text);
                            }
                            Ok(msg) => queue.push_back(SessionEvent::MessageReceived(msg)),
                            Err(e) => warn!("Malformed message: {}", e),
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        queue.push_back(SessionEvent::BinaryReceived(bytes.to_vec()));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.map(|f| u16::from(f.code)).unwrap_or(1006);
                        info!("Socket closed with code {}", code);
                        ws = None;
                        queue.push_back(SessionEvent::SocketClosed { code });
                    }
                    Some(Ok(_)) => {
                        // WebSocket-level ping/pong, handled by tungstenite
                    }
                    Some(Err(e)) => {
                        warn!("Socket error: {}", e);
                        ws = None;
                        queue.push_back(SessionEvent::SocketClosed { code: 1006 });
                    }
                    None => {
                        ws = None;
                        queue.push_back(SessionEvent::SocketClosed { code: 1006 });
                    }
                }
            }

            kind = next_due_timer(&deadlines) => {
                deadlines[timer_index(kind)] = None;
                queue.push_back(SessionEvent::Timer(kind));
            }

            _ = audio_tick.tick() => {
                if let Some(chain) = &mut capture_chain {
                    if let Some(err) = chain.capture.check_error() {
                        queue.push_back(SessionEvent::CaptureFailed { detail: err });
                    } else {
                        let timestamp_ms = now_ms();
                        for samples in chain.drain_frames() {
                            queue.push_back(SessionEvent::LocalFrame { samples, timestamp_ms });
                        }
                    }
                }
                // Playback outlives capture, so its errors are checked
                // independently
                if let Some(sink) = &playback
                    && let Some(err) = sink.check_error()
                {
                    warn!("Playback error: {}", err);
                    let _ = notice_tx.send(SessionNotice::Fault(
                        VoiceError::DeviceUnavailable(err),
                    ));
                }
            }
        }
    }

    if let Some(task) = pending_connect.take() {
        task.abort();
    }
    let _ = snapshot_tx.send(machine.snapshot());
    info!("Voice session ended");
}

/// Interpret the machine's effects, returning any follow-up events they
/// produce (a capture failure during StartCapture, for example)
#[allow(clippy::too_many_arguments)]
async fn apply_effects(
    effects: Vec<Effect>,
    config: &SessionConfig,
    ws: &mut Option<WsStream>,
    deadlines: &mut [Option<Instant>; TIMER_COUNT],
    capture_chain: &mut Option<CaptureChain>,
    playback: &mut Option<PlaybackSink>,
    pending_connect: &mut Option<tokio::task::JoinHandle<()>>,
    connect_tx: &mpsc::UnboundedSender<ConnectOutcome>,
    notice_tx: &mpsc::UnboundedSender<SessionNotice>,
    done: &mut bool,
) -> Vec<SessionEvent> {
    let mut followups = Vec::new();

    for effect in effects {
        match effect {
            Effect::OpenSocket => {
                if let Some(task) = pending_connect.take() {
                    task.abort();
                }
                let credentials = config.credentials.clone();
                let server_url = config.server_url.clone();
                let channel_id = config.channel_id.clone();
                let tx = connect_tx.clone();
                *pending_connect = Some(tokio::spawn(async move {
                    let token = match credentials.refresh().await {
                        Ok(token) => token,
                        Err(e) => {
                            let _ = tx.send(ConnectOutcome::RefreshFailed(e.to_string()));
                            return;
                        }
                    };
                    let url = session_url(&server_url, &channel_id, &token);
                    match connect_async(url).await {
                        Ok((stream, _)) => {
                            let _ = tx.send(ConnectOutcome::Opened(Box::new(stream)));
                        }
                        Err(e) => {
                            let _ = tx.send(ConnectOutcome::Failed(e.to_string()));
                        }
                    }
                }));
            }

            Effect::Send(msg) => {
                if let Some(stream) = ws {
                    match msg.to_json() {
                        Ok(json) => {
                            if let Err(e) = stream.send(Message::Text(json.into())).await {
                                // The closure will arrive through the read side
                                debug!("Send failed: {}", e);
                            }
                        }
                        Err(e) => warn!("Failed to serialize message: {}", e),
                    }
                }
            }

            Effect::CloseSocket => {
                if let Some(task) = pending_connect.take() {
                    task.abort();
                }
                if let Some(mut stream) = ws.take() {
                    let _ = stream.close(None).await;
                }
            }

            Effect::StartCapture => {
                // Drop any leftovers from a previous attempt first
                if let Some(mut chain) = capture_chain.take() {
                    chain.stop();
                }
                if let Some(sink) = playback.take() {
                    sink.stop();
                }
                match start_audio(config) {
                    Ok((chain, sink)) => {
                        *capture_chain = Some(chain);
                        *playback = Some(sink);
                        followups.push(SessionEvent::CaptureStarted);
                    }
                    Err(e) => {
                        followups.push(SessionEvent::CaptureFailed {
                            detail: e.to_string(),
                        });
                    }
                }
            }

            Effect::StopCapture => {
                if let Some(mut chain) = capture_chain.take() {
                    chain.stop();
                }
            }

            Effect::StopPlayback => {
                if let Some(sink) = playback.take() {
                    sink.stop();
                }
            }

            Effect::PlayFrame { samples, gain } => {
                if let Some(chain) = capture_chain {
                    chain.analyze_render(&samples);
                }
                if let Some(sink) = playback {
                    sink.enqueue_frame(&samples, gain);
                }
            }

            Effect::ArmTimer(kind) => {
                deadlines[timer_index(kind)] = Some(Instant::now() + timer_duration(kind));
            }

            Effect::CancelTimer(kind) => {
                deadlines[timer_index(kind)] = None;
            }

            Effect::CancelAllTimers => {
                *deadlines = [None; TIMER_COUNT];
            }

            Effect::StoreCredential(token) => {
                let _ = notice_tx.send(SessionNotice::CredentialUpdated(token));
            }

            Effect::SurfaceError(error) => {
                // Codec faults are per-frame noise; log without notifying
                if matches!(error, VoiceError::EncodeDecode(_)) {
                    debug!("Dropped inbound frame: {}", error);
                } else {
                    warn!("Session fault: {}", error);
                    let _ = notice_tx.send(SessionNotice::Fault(error));
                }
            }

            Effect::Shutdown => {
                *done = true;
            }
        }
    }

    followups
}

// =============================================================================
// Session Handle
// =============================================================================

/// Handle for controlling a running voice session
///
/// Dropping the handle ends the session.
pub struct SessionHandle {
    command_tx: mpsc::UnboundedSender<SessionCommand>,
    snapshot_rx: watch::Receiver<SessionSnapshot>,
    /// Dedicated thread because cpal streams are not Send
    handle: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// Start a voice session on its own thread
    ///
    /// Returns the handle and the notice receiver. Session state is read
    /// through [`SessionHandle::snapshot`].
    pub fn start(config: SessionConfig) -> (Self, mpsc::UnboundedReceiver<SessionNotice>) {
        // Published as Connecting from the first instant so observers never
        // see a fresh session as Disconnected before the thread runs
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot {
            state: SessionState::Connecting,
            ..SessionSnapshot::default()
        });
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        // The thread runs its own runtime so the session can await the
        // socket while owning non-Send audio streams
        let handle = std::thread::spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    warn!("Failed to create voice session runtime: {}", e);
                    return;
                }
            };

            rt.block_on(run_session(config, snapshot_tx, notice_tx, command_rx));
        });

        (
            Self {
                command_tx,
                snapshot_rx,
                handle: Some(handle),
            },
            notice_rx,
        )
    }

    /// Current session state
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// A receiver that can be watched for state changes
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_rx.clone()
    }

    pub fn toggle_mute(&self) {
        let _ = self.command_tx.send(SessionCommand::ToggleMute);
    }

    pub fn toggle_deafen(&self) {
        let _ = self.command_tx.send(SessionCommand::ToggleDeafen);
    }

    pub fn toggle_video(&self) {
        let _ = self.command_tx.send(SessionCommand::ToggleVideo);
    }

    pub fn toggle_screen_share(&self) {
        let _ = self.command_tx.send(SessionCommand::ToggleScreenShare);
    }

    /// Set playback volume (0-100, clamped)
    pub fn set_volume(&self, volume: u8) {
        let _ = self.command_tx.send(SessionCommand::SetVolume(volume));
    }

    /// Update conditioning stages without rejoining
    pub fn set_conditioning(&self, settings: ConditioningSettings) {
        let _ = self
            .command_tx
            .send(SessionCommand::SetConditioning(settings));
    }

    /// Leave the channel
    ///
    /// The session thread sends the leave message and tears down devices
    /// on its own; we do not join it, so an unresponsive audio driver
    /// cannot block the caller.
    pub fn leave(&mut self) {
        let _ = self.command_tx.send(SessionCommand::Leave);
        self.handle.take();
    }

    /// Leave the channel and wait for the session thread to finish
    ///
    /// Blocks until the thread has released its socket and devices, or
    /// until `timeout` elapses. Returns true if teardown completed. A
    /// session stuck in a device driver is abandoned rather than joined
    /// so the caller can proceed.
    pub fn leave_and_wait(&mut self, timeout: Duration) -> bool {
        let _ = self.command_tx.send(SessionCommand::Leave);

        let Some(handle) = self.handle.take() else {
            return true;
        };

        let deadline = std::time::Instant::now() + timeout;
        while !handle.is_finished() {
            if std::time::Instant::now() >= deadline {
                warn!("Voice session thread did not stop within {:?}", timeout);
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let _ = handle.join();
        true
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.leave();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_url_encodes_components() {
        let url = session_url("wss://chorus.example", "general", "tok en+1");
        assert_eq!(
            url,
            "wss://chorus.example/ws/voice/general?token=tok%20en%2B1"
        );
    }

    #[test]
    fn test_session_url_strips_trailing_slash() {
        let url = session_url("wss://chorus.example/", "general", "abc");
        assert_eq!(url, "wss://chorus.example/ws/voice/general?token=abc");
    }

    #[test]
    fn test_timer_index_roundtrip() {
        for kind in TIMERS {
            assert_eq!(TIMERS[timer_index(kind)], kind);
        }
    }

    #[test]
    fn test_timer_durations_are_positive() {
        for kind in TIMERS {
            assert!(timer_duration(kind) > Duration::ZERO);
        }
    }

    /// Credential source that always fails, so a session started with it
    /// tears down without ever touching a socket or an audio device.
    struct RejectedCredentials;

    #[async_trait::async_trait]
    impl CredentialSource for RejectedCredentials {
        async fn refresh(&self) -> Result<String, VoiceError> {
            Err(VoiceError::CredentialRefresh("revoked".to_string()))
        }
    }

    /// Credential source that never resolves, pinning the session in
    /// Connecting for as long as the test needs.
    struct StalledCredentials;

    #[async_trait::async_trait]
    impl CredentialSource for StalledCredentials {
        async fn refresh(&self) -> Result<String, VoiceError> {
            std::future::pending().await
        }
    }

    fn test_config(credentials: Arc<dyn CredentialSource>) -> SessionConfig {
        SessionConfig {
            server_url: "wss://chorus.example".to_string(),
            channel_id: "general".to_string(),
            user_id: "u1".to_string(),
            input_device: String::new(),
            output_device: String::new(),
            conditioning: ConditioningSettings::default(),
            start_muted: false,
            start_deafened: false,
            volume: 100,
            credentials,
        }
    }

    #[test]
    fn test_fresh_session_snapshot_is_connecting() {
        let (mut handle, _notices) =
            SessionHandle::start(test_config(Arc::new(StalledCredentials)));
        // Observable immediately, before the session thread has run
        assert_eq!(handle.snapshot().state, SessionState::Connecting);
        assert!(handle.leave_and_wait(Duration::from_secs(5)));
    }

    #[test]
    fn test_leave_and_wait_joins_session_thread() {
        let (mut handle, _notices) =
            SessionHandle::start(test_config(Arc::new(RejectedCredentials)));
        assert!(handle.leave_and_wait(Duration::from_secs(5)));
        assert_eq!(handle.snapshot().state, SessionState::Disconnected);
        // Idempotent once the thread is gone
        assert!(handle.leave_and_wait(Duration::from_millis(10)));
    }
}
