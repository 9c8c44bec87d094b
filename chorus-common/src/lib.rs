//! Chorus Common Library
//!
//! Shared wire protocol and PCM frame codec for the Chorus voice-channel
//! client. Contains no I/O; everything here is pure data handling shared
//! between the session runner and its tests.

pub mod codec;
pub mod protocol;

/// Sample rate for voice audio (48kHz)
pub const SAMPLE_RATE: u32 = 48000;

/// Number of samples per wire frame (~21.3ms at 48kHz)
pub const FRAME_SAMPLES: usize = 1024;

/// Number of audio channels (mono)
pub const CHANNELS: u16 = 1;

/// Timeout for a single WebSocket connect attempt (5 seconds)
pub const CONNECT_TIMEOUT_SECS: u64 = 5;

/// Interval between outbound keepalive pings (15 seconds)
pub const PING_INTERVAL_SECS: u64 = 15;

/// Interval between connection health checks (30 seconds)
pub const HEALTH_CHECK_INTERVAL_SECS: u64 = 30;

/// Delay before a reconnect attempt after an abnormal closure (3 seconds)
pub const RECONNECT_BACKOFF_SECS: u64 = 3;

/// Maximum reconnect attempts per channel membership.
///
/// The counter resets on a successful socket open, so an unstable link
/// gets five tries per outage rather than five for the session lifetime.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_duration_roughly_21ms() {
        // 1024 samples at 48kHz is ~21.3ms per frame
        let ms = FRAME_SAMPLES as f64 * 1000.0 / SAMPLE_RATE as f64;
        assert!(ms > 21.0 && ms < 22.0);
    }

    #[test]
    fn test_mono_audio() {
        assert_eq!(CHANNELS, 1);
    }

    #[test]
    fn test_timer_ordering() {
        // A connect attempt must resolve before the first keepalive is
        // due, and pings must outpace the health check that watches them.
        assert!(CONNECT_TIMEOUT_SECS < PING_INTERVAL_SECS);
        assert!(PING_INTERVAL_SECS < HEALTH_CHECK_INTERVAL_SECS);
    }
}
