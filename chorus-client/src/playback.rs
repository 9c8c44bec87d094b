//! Audio playback sink
//!
//! Renders decoded voice frames through a persistent cpal output stream.
//! Each frame becomes an independent one-shot voice with the volume gain
//! baked in at enqueue time, so a volume change only affects frames that
//! arrive afterwards and overlapping frames stay isolated. The output
//! callback sums active voices with soft clipping and drops finished ones.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, Stream, StreamConfig};

use chorus_common::SAMPLE_RATE;

use crate::audio::find_output_device;
use crate::error::VoiceError;

/// Maximum simultaneously playing voices (oldest dropped beyond this)
const MAX_ACTIVE_VOICES: usize = 32;

// =============================================================================
// Voices
// =============================================================================

/// One enqueued frame being played out
struct Voice {
    /// Gain-scaled samples
    samples: Vec<f32>,
    /// Playback position within `samples`
    pos: usize,
}

/// Shared sink state (accessed from the audio callback)
struct SinkState {
    voices: Vec<Voice>,
}

impl SinkState {
    fn new() -> Self {
        Self { voices: Vec::new() }
    }
}

/// Scale samples by a gain factor
fn apply_gain(samples: &[f32], gain: f32) -> Vec<f32> {
    samples.iter().map(|&s| s * gain).collect()
}

/// Soft clip function to prevent harsh digital clipping
///
/// Uses tanh-based soft clipping which smoothly limits the signal as it
/// approaches the maximum, so several loud speakers summed together
/// saturate instead of wrapping.
fn soft_clip(sample: f32) -> f32 {
    (sample * 0.7).tanh() / 0.7_f32.tanh()
}

/// Sum all active voices into a mono output buffer
///
/// Advances each voice's position by the buffer length and removes
/// voices that finished playing.
fn mix_into(voices: &mut Vec<Voice>, out: &mut [f32]) {
    for (i, dst) in out.iter_mut().enumerate() {
        let mut mixed: f32 = 0.0;
        let mut has_audio = false;

        for voice in voices.iter() {
            let idx = voice.pos + i;
            if idx < voice.samples.len() {
                mixed += voice.samples[idx];
                has_audio = true;
            }
        }

        *dst = if has_audio { soft_clip(mixed) } else { 0.0 };
    }

    let consumed = out.len();
    for voice in voices.iter_mut() {
        voice.pos = (voice.pos + consumed).min(voice.samples.len());
    }
    voices.retain(|v| v.pos < v.samples.len());
}

// =============================================================================
// Playback Sink
// =============================================================================

/// Plays decoded voice frames through the output device
pub struct PlaybackSink {
    /// The cpal output stream
    _stream: Stream,
    /// Shared sink state (accessed from audio callback and session)
    state: Arc<Mutex<SinkState>>,
    /// Flag indicating if playback is active
    active: Arc<AtomicBool>,
    /// Receiver for audio stream errors
    error_rx: std_mpsc::Receiver<String>,
}

impl PlaybackSink {
    /// Create a new playback sink on the specified output device
    pub fn new(device_name: &str) -> Result<Self, VoiceError> {
        let device = find_output_device(device_name)
            .ok_or_else(|| VoiceError::DeviceUnavailable("Output device not found".to_string()))?;

        let state = Arc::new(Mutex::new(SinkState::new()));
        let state_clone = state.clone();
        let active = Arc::new(AtomicBool::new(false));
        let active_clone = active.clone();

        // Create channel for error reporting from audio callback
        let (error_tx, error_rx) = std_mpsc::channel();

        // Check supported formats
        let supported_formats = [SampleFormat::F32, SampleFormat::I16, SampleFormat::U16];

        // First try mono at 48kHz
        let mono_config = device
            .supported_output_configs()
            .map_err(|e| {
                VoiceError::DeviceUnavailable(format!("Failed to get supported configs: {}", e))
            })?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SAMPLE_RATE
                    && c.max_sample_rate() >= SAMPLE_RATE
                    && supported_formats.contains(&c.sample_format())
            });

        // If mono not available, try stereo
        let (channels, sample_format) = if let Some(cfg) = mono_config {
            (1u16, cfg.sample_format())
        } else {
            let stereo_config = device
                .supported_output_configs()
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
                    "Output device doesn't support 48kHz (required for voice)".to_string(),
                ));
            }
        };

        let config = StreamConfig {
            channels,
            sample_rate: SAMPLE_RATE,
            buffer_size: cpal::BufferSize::Default,
        };

        // Build the appropriate stream based on channel count and sample format
        let stream = match (channels, sample_format) {
            (1, SampleFormat::F32) => build_sink_stream_mono::<f32>(
                &device,
                &config,
                state_clone,
                active_clone,
                error_tx,
            ),
            (1, SampleFormat::I16) => build_sink_stream_mono::<i16>(
                &device,
                &config,
                state_clone,
                active_clone,
                error_tx,
            ),
            (1, SampleFormat::U16) => build_sink_stream_mono::<u16>(
                &device,
                &config,
                state_clone,
                active_clone,
                error_tx,
            ),
            (2, SampleFormat::F32) => build_sink_stream_stereo::<f32>(
                &device,
                &config,
                state_clone,
                active_clone,
                error_tx,
            ),
            (2, SampleFormat::I16) => build_sink_stream_stereo::<i16>(
                &device,
                &config,
                state_clone,
                active_clone,
                error_tx,
            ),
            (2, SampleFormat::U16) => build_sink_stream_stereo::<u16>(
                &device,
                &config,
                state_clone,
                active_clone,
                error_tx,
            ),
            _ => {
                return Err(VoiceError::DeviceUnavailable(
                    "Unsupported audio format".to_string(),
                ));
            }
        }?;

        Ok(Self {
            _stream: stream,
            state,
            active,
            error_rx,
        })
    }

    /// Start playback
    pub fn start(&self) -> Result<(), VoiceError> {
        self.active.store(true, Ordering::SeqCst);
        self._stream
            .play()
            .map_err(|e| VoiceError::DeviceUnavailable(format!("Failed to start playback: {}", e)))
    }

    /// Stop playback and drop queued voices
    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        let _ = self._stream.pause();
        if let Ok(mut state) = self.state.lock() {
            state.voices.clear();
        }
    }

    /// Enqueue a decoded frame for playback
    ///
    /// The gain is applied here, so later volume changes do not affect
    /// frames already queued. A gain of 0.0 still enqueues (silence).
    pub fn enqueue_frame(&self, samples: &[f32], gain: f32) {
        if let Ok(mut state) = self.state.lock() {
            if state.voices.len() >= MAX_ACTIVE_VOICES {
                state.voices.remove(0);
            }
            state.voices.push(Voice {
                samples: apply_gain(samples, gain),
                pos: 0,
            });
        }
    }

    /// Check for audio stream errors (non-blocking)
    pub fn check_error(&self) -> Option<String> {
        self.error_rx.try_recv().ok()
    }
}

/// Build a mono sink output stream
fn build_sink_stream_mono<T>(
    device: &Device,
    config: &StreamConfig,
    state: Arc<Mutex<SinkState>>,
    active: Arc<AtomicBool>,
    error_tx: std_mpsc::Sender<String>,
) -> Result<Stream, VoiceError>
where
    T: Sample + cpal::SizedSample + FromSample<f32>,
{
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                if active.load(Ordering::SeqCst)
                    && let Ok(mut state) = state.lock()
                {
                    let mut mono = vec![0.0f32; data.len()];
                    mix_into(&mut state.voices, &mut mono);
                    for (dst, src) in data.iter_mut().zip(mono.iter()) {
                        *dst = T::from_sample(*src);
                    }
                } else {
                    // Not active or couldn't lock state - output silence
                    for sample in data.iter_mut() {
                        *sample = T::from_sample(0.0f32);
                    }
                }
            },
            {
                let error_tx = error_tx.clone();
                move |err| {
                    let _ = error_tx.send(format!("Playback error: {}", err));
                }
            },
            None,
        )
        .map_err(|e| VoiceError::DeviceUnavailable(format!("Failed to build sink stream: {}", e)))
}

/// Build a stereo sink output stream (upmixes from mono)
fn build_sink_stream_stereo<T>(
    device: &Device,
    config: &StreamConfig,
    state: Arc<Mutex<SinkState>>,
    active: Arc<AtomicBool>,
    error_tx: std_mpsc::Sender<String>,
) -> Result<Stream, VoiceError>
where
    T: Sample + cpal::SizedSample + FromSample<f32>,
{
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                if active.load(Ordering::SeqCst)
                    && let Ok(mut state) = state.lock()
                {
                    let mut mono = vec![0.0f32; data.len() / 2];
                    mix_into(&mut state.voices, &mut mono);
                    for (chunk, src) in data.chunks_exact_mut(2).zip(mono.iter()) {
                        let sample = T::from_sample(*src);
                        chunk[0] = sample;
                        chunk[1] = sample;
                    }
                } else {
                    // Not active or couldn't lock state - output silence
                    for sample in data.iter_mut() {
                        *sample = T::from_sample(0.0f32);
                    }
                }
            },
            {
                let error_tx = error_tx.clone();
                move |err| {
                    let _ = error_tx.send(format!("Playback error: {}", err));
                }
            },
            None,
        )
        .map_err(|e| {
            VoiceError::DeviceUnavailable(format!("Failed to build stereo sink stream: {}", e))
        })
}

// =============================================================================
// Tests
// =============================================================================
