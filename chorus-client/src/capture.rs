//! Microphone capture and frame assembly
//!
//! Captures audio at 48kHz mono through cpal, buffering f32 samples from
//! the device callback. The session drains the buffer in conditioning
//! blocks and a [`FrameAssembler`] regroups conditioned samples into
//! 1024-sample wire frames.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, Stream, StreamConfig};

use chorus_common::{FRAME_SAMPLES, SAMPLE_RATE};

use crate::audio::find_input_device;
use crate::error::VoiceError;

/// Maximum capture buffer size in frames (prevents unbounded growth if processing stalls)
const MAX_CAPTURE_BUFFER_FRAMES: usize = 10;

// =============================================================================
// Audio Capture
// =============================================================================

/// Audio capture from microphone
///
/// Captures audio at 48kHz mono for voice encoding. Uses f32 samples
/// internally; stereo devices are downmixed in the callback.
pub struct AudioCapture {
    /// The cpal input stream
    _stream: Stream,
    /// Buffer for captured audio samples (f32 normalized to -1.0..1.0)
    buffer: Arc<Mutex<Vec<f32>>>,
    /// Flag indicating if capture is active
    active: Arc<AtomicBool>,
    /// Receiver for audio stream errors
    error_rx: std_mpsc::Receiver<String>,
}

impl AudioCapture {
    /// Create a new audio capture from the specified device
    ///
    /// # Arguments
    /// * `device_name` - Device name, or empty string for system default
    pub fn new(device_name: &str) -> Result<Self, VoiceError> {
        let device = find_input_device(device_name)
            .ok_or_else(|| VoiceError::DeviceUnavailable("Input device not found".to_string()))?;

        let buffer = Arc::new(Mutex::new(Vec::with_capacity(FRAME_SAMPLES * 4)));
        let buffer_clone = buffer.clone();
        let active = Arc::new(AtomicBool::new(false));
        let active_clone = active.clone();

        // Create channel for error reporting from audio callback
        let (error_tx, error_rx) = std_mpsc::channel();

        // Check supported formats - must support 48kHz and a format we can handle
        let supported_formats = [SampleFormat::F32, SampleFormat::I16, SampleFormat::U16];

        // First try mono at 48kHz
        let mono_config = device
            .supported_input_configs()
            .map_err(|e| {
                VoiceError::DeviceUnavailable(format!("Failed to get supported configs: {}", e))
            })?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SAMPLE_RATE
                    && c.max_sample_rate() >= SAMPLE_RATE
                    && supported_formats.contains(&c.sample_format())
            });

        // If mono not available, try stereo (we'll downmix)
        let (channels, sample_format) = if let Some(cfg) = mono_config {
            (1u16, cfg.sample_format())
        } else {
            let stereo_config = device
                .supported_input_configs()
                .map_err(|e| {
                    VoiceError::DeviceUnavailable(format!(
                        "Failed to get supported configs: {}",
                        e
                    ))
                })?
                .find(|c| {
                    c.channels() == 2
                        && c.min_sample_rate() <= SAMPLE_RATE
                        && c.max_sample_rate() >= SAMPLE_RATE
                        && supported_formats.contains(&c.sample_format())
                });

            if let Some(cfg) = stereo_config {
                (2u16, cfg.sample_format())
            } else {
                return Err(VoiceError::DeviceUnavailable(
                    "Input device doesn't support 48kHz (required for voice)".to_string(),
                ));
            }
        };

        let config = StreamConfig {
            channels,
            sample_rate: SAMPLE_RATE,
            buffer_size: cpal::BufferSize::Default,
        };

        // Build stream based on sample format and channel count
        let stream = match (sample_format, channels) {
            (SampleFormat::I16, 1) => build_input_stream_mono::<i16>(
                &device,
                &config,
                buffer_clone,
                active_clone,
                error_tx,
            ),
            (SampleFormat::F32, 1) => build_input_stream_mono::<f32>(
                &device,
                &config,
                buffer_clone,
                active_clone,
                error_tx,
            ),
            (SampleFormat::U16, 1) => build_input_stream_mono::<u16>(
                &device,
                &config,
                buffer_clone,
                active_clone,
                error_tx,
            ),
            (SampleFormat::I16, 2) => build_input_stream_stereo::<i16>(
                &device,
                &config,
                buffer_clone,
                active_clone,
                error_tx,
            ),
            (SampleFormat::F32, 2) => build_input_stream_stereo::<f32>(
                &device,
                &config,
                buffer_clone,
                active_clone,
                error_tx,
            ),
            (SampleFormat::U16, 2) => build_input_stream_stereo::<u16>(
                &device,
                &config,
                buffer_clone,
                active_clone,
                error_tx,
            ),
            _ => {
                return Err(VoiceError::DeviceUnavailable(format!(
                    "Unsupported sample format: {:?}",
                    sample_format
                )));
            }
        }?;

        Ok(Self {
            _stream: stream,
            buffer,
            active,
            error_rx,
        })
    }

    /// Start capturing audio
    pub fn start(&self) -> Result<(), VoiceError> {
        self.active.store(true, Ordering::SeqCst);
        self._stream
            .play()
            .map_err(|e| VoiceError::DeviceUnavailable(format!("Failed to start capture: {}", e)))
    }

    /// Stop capturing audio
    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        // Clear the buffer when stopping
        if let Ok(mut buf) = self.buffer.lock() {
            buf.clear();
        }
    }

    /// Check if capture is currently active
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Take a block of samples for conditioning
    ///
    /// Returns `count` samples if that many have been captured, or None.
    /// Samples are f32 normalized to [-1.0, 1.0].
    pub fn take_block(&self, count: usize) -> Option<Vec<f32>> {
        let mut buffer = self.buffer.lock().ok()?;

        if buffer.len() >= count {
            let block: Vec<f32> = buffer.drain(..count).collect();
            Some(block)
        } else {
            None
        }
    }

    /// Check for audio stream errors (non-blocking)
    ///
    /// Returns the first error if one has occurred, or None if no errors.
    pub fn check_error(&self) -> Option<String> {
        self.error_rx.try_recv().ok()
    }
}

/// Build a mono input stream for the given sample type
fn build_input_stream_mono<T>(
    device: &Device,
    config: &StreamConfig,
    buffer: Arc<Mutex<Vec<f32>>>,
    active: Arc<AtomicBool>,
    error_tx: std_mpsc::Sender<String>,
) -> Result<Stream, VoiceError>
where
    T: Sample + cpal::SizedSample,
    f32: FromSample<T>,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if active.load(Ordering::SeqCst)
                    && let Ok(mut buf) = buffer.lock()
                {
                    for sample in data {
                        buf.push(f32::from_sample(*sample));
                    }
                    // Limit buffer size to prevent unbounded growth
                    let max_size = FRAME_SAMPLES * MAX_CAPTURE_BUFFER_FRAMES;
                    if buf.len() > max_size {
                        let drain_count = buf.len() - max_size;
                        buf.drain(..drain_count);
                    }
                }
            },
            {
                let error_tx = error_tx.clone();
                move |err| {
                    // Send error to session (ignore if receiver dropped)
                    let _ = error_tx.send(format!("Audio capture error: {}", err));
                }
            },
            None,
        )
        .map_err(|e| VoiceError::DeviceUnavailable(format!("Failed to build input stream: {}", e)))
}

/// Build a stereo input stream that downmixes to mono
fn build_input_stream_stereo<T>(
    device: &Device,
    config: &StreamConfig,
    buffer: Arc<Mutex<Vec<f32>>>,
    active: Arc<AtomicBool>,
    error_tx: std_mpsc::Sender<String>,
) -> Result<Stream, VoiceError>
where
    T: Sample + cpal::SizedSample,
    f32: FromSample<T>,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if active.load(Ordering::SeqCst)
                    && let Ok(mut buf) = buffer.lock()
                {
                    // Downmix stereo to mono by averaging L+R channels
                    for chunk in data.chunks_exact(2) {
                        let left = f32::from_sample(chunk[0]);
                        let right = f32::from_sample(chunk[1]);
                        let mono = (left + right) * 0.5;
                        buf.push(mono);
                    }
                    // Limit buffer size to prevent unbounded growth
                    let max_size = FRAME_SAMPLES * MAX_CAPTURE_BUFFER_FRAMES;
                    if buf.len() > max_size {
                        let drain_count = buf.len() - max_size;
                        buf.drain(..drain_count);
                    }
                }
            },
            {
                let error_tx = error_tx.clone();
                move |err| {
                    // Send error to session (ignore if receiver dropped)
                    let _ = error_tx.send(format!("Audio capture error: {}", err));
                }
            },
            None,
        )
        .map_err(|e| {
            VoiceError::DeviceUnavailable(format!("Failed to build stereo input stream: {}", e))
        })
}

// =============================================================================
// Frame Assembler
// =============================================================================

/// Regroups conditioned samples into wire frames
///
/// The conditioner works on 480-sample blocks but the wire carries
/// 1024-sample frames, so conditioned audio accumulates here until a
/// full frame is available.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self {
            pending: Vec::with_capacity(FRAME_SAMPLES * 2),
        }
    }

    /// Append conditioned samples
    pub fn push(&mut self, samples: &[f32]) {
        self.pending.extend_from_slice(samples);
    }

    /// Take the next complete wire frame, if one has accumulated
    pub fn pop_frame(&mut self) -> Option<Vec<f32>> {
        if self.pending.len() >= FRAME_SAMPLES {
            let frame: Vec<f32> = self.pending.drain(..FRAME_SAMPLES).collect();
            Some(frame)
        } else {
            None
        }
    }

    /// Discard buffered samples (capture stopped)
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assembler_empty_has_no_frame() {
        let mut assembler = FrameAssembler::new();
        assert!(assembler.pop_frame().is_none());
    }

    #[test]
    fn test_assembler_accumulates_blocks_into_frames() {
        let mut assembler = FrameAssembler::new();

        // 480-sample blocks: two blocks (960) are not enough for a frame
        assembler.push(&vec![0.1; 480]);
        assembler.push(&vec![0.2; 480]);
        assert!(assembler.pop_frame().is_none());

        // Third block crosses the 1024 threshold
        assembler.push(&vec![0.3; 480]);
        let frame = assembler.pop_frame().unwrap();
        assert_eq!(frame.len(), FRAME_SAMPLES);
        assert_eq!(frame[0], 0.1);
        assert_eq!(frame[500], 0.2);
        assert_eq!(frame[1000], 0.3);

        // Remainder (416 samples) carries over to the next frame
        assert!(assembler.pop_frame().is_none());
        assembler.push(&vec![0.4; 480]);
        assembler.push(&vec![0.4; 480]);
        assert!(assembler.pop_frame().is_some());
    }

    #[test]
    fn test_assembler_clear_discards_pending() {
        let mut assembler = FrameAssembler::new();
        assembler.push(&vec![0.5; 1000]);
        assembler.clear();
        assembler.push(&vec![0.5; 1000]);
        assert!(assembler.pop_frame().is_none());
    }
}
