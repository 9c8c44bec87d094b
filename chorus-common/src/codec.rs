//! PCM audio frame codec
//!
//! Converts between f32 samples (what the audio stack works with), i16
//! little-endian bytes (the wire sample format), and base64 text (how
//! frames ride inside JSON audio messages).
//!
//! Encoding clamps to ±0.99 before scaling so a hot microphone can never
//! wrap around the i16 range.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;

/// Clamp limit applied before i16 scaling
const CLAMP_LIMIT: f32 = 0.99;

/// Errors from decoding inbound audio payloads
#[derive(Debug, Error)]
pub enum CodecError {
    /// Payload length is not a whole number of i16 samples
    #[error("audio payload of {0} bytes is not i16-aligned")]
    Misaligned(usize),
    /// Payload is not valid base64
    #[error("invalid base64 audio payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Encode f32 samples to i16 little-endian bytes
///
/// Samples are clamped to ±0.99 and scaled by 32767.
pub fn encode_frame(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let clamped = sample.clamp(-CLAMP_LIMIT, CLAMP_LIMIT);
        let value = (clamped * 32767.0) as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Decode i16 little-endian bytes to f32 samples in [-1.0, 1.0)
pub fn decode_frame(bytes: &[u8]) -> Result<Vec<f32>, CodecError> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::Misaligned(bytes.len()));
    }

    let samples = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect();
    Ok(samples)
}

/// Encode a frame for the JSON audio message
pub fn encode_base64(samples: &[f32]) -> String {
    BASE64.encode(encode_frame(samples))
}

/// Decode the payload of a JSON audio message
pub fn decode_base64(data: &str) -> Result<Vec<f32>, CodecError> {
    let bytes = BASE64.decode(data)?;
    decode_frame(&bytes)
}

// =============================================================================
// Tests
// =============================================================================
