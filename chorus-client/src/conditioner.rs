//! Capture audio conditioning
//!
//! Wraps the webrtc-audio-processing crate to clean up microphone input:
//! echo cancellation, noise suppression, and automatic gain control. The
//! processor works on 480-sample (10ms) blocks at 48kHz, so the session
//! drains capture in blocks of [`BLOCK_SAMPLES`] and reassembles wire
//! frames afterwards.
//!
//! Conditioning is best-effort: if the processor fails to initialize the
//! session runs with raw capture instead of failing the join.

use chorus_common::CHANNELS;
use webrtc_audio_processing::{
    Config, EchoCancellation, EchoCancellationSuppressionLevel, GainControl, GainControlMode,
    InitializationConfig, NoiseSuppression, NoiseSuppressionLevel, Processor,
};

/// Samples per conditioning block (10ms at 48kHz, fixed by the processor)
pub const BLOCK_SAMPLES: usize = 480;

// =============================================================================
// Conditioning Settings
// =============================================================================

/// Which conditioning stages are enabled
///
/// Defaults mirror the constraint set the voice server expects from
/// browser clients: everything on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConditioningSettings {
    /// Remove speaker output leaking back into the microphone
    pub echo_cancellation: bool,
    /// Remove steady-state background noise (fans, AC, etc.)
    pub noise_suppression: bool,
    /// Normalize microphone volume to consistent levels
    pub auto_gain: bool,
}

impl Default for ConditioningSettings {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain: true,
        }
    }
}

// =============================================================================
// Conditioner
// =============================================================================

/// Conditions capture audio before encoding
pub struct Conditioner {
    /// The WebRTC audio processor instance
    processor: Processor,
    /// Current settings
    settings: ConditioningSettings,
}

impl Conditioner {
    /// Create a new conditioner with the given settings
    pub fn new(settings: ConditioningSettings) -> Result<Self, String> {
        // The processor is hardcoded to 48kHz, 10ms frames (480 samples)
        let init_config = InitializationConfig {
            num_capture_channels: CHANNELS as i32,
            num_render_channels: CHANNELS as i32,
            ..InitializationConfig::default()
        };

        let mut processor =
            Processor::new(&init_config).map_err(|e| format!("Failed to create processor: {e}"))?;

        let config = Self::build_config(&settings);
        processor.set_config(config);

        Ok(Self {
            processor,
            settings,
        })
    }

    /// Build a Config from our settings
    fn build_config(settings: &ConditioningSettings) -> Config {
        Config {
            echo_cancellation: if settings.echo_cancellation {
                Some(EchoCancellation {
                    suppression_level: EchoCancellationSuppressionLevel::Moderate,
                    enable_extended_filter: true,
                    enable_delay_agnostic: true,
                    stream_delay_ms: None,
                })
            } else {
                None
            },
            gain_control: if settings.auto_gain {
                Some(GainControl {
                    mode: GainControlMode::AdaptiveDigital,
                    target_level_dbfs: 3,
                    compression_gain_db: 9,
                    enable_limiter: true,
                })
            } else {
                None
            },
            noise_suppression: if settings.noise_suppression {
                Some(NoiseSuppression {
                    suppression_level: NoiseSuppressionLevel::Moderate,
                })
            } else {
                None
            },
            enable_high_pass_filter: true,
            ..Config::default()
        }
    }

    /// Update settings dynamically
    pub fn update_settings(&mut self, settings: ConditioningSettings) {
        if settings != self.settings {
            let config = Self::build_config(&settings);
            self.processor.set_config(config);
            self.settings = settings;
        }
    }

    /// Get current settings
    pub fn settings(&self) -> ConditioningSettings {
        self.settings
    }

    /// Condition one capture (microphone) block in place
    ///
    /// The block must be exactly [`BLOCK_SAMPLES`] samples.
    pub fn process_capture_block(&mut self, block: &mut [f32]) -> Result<(), String> {
        if block.len() != BLOCK_SAMPLES {
            return Err(format!(
                "Expected {} samples, got {}",
                BLOCK_SAMPLES,
                block.len()
            ));
        }

        self.processor
            .process_capture_frame(block)
            .map_err(|e| format!("Capture processing error: {e}"))
    }

    /// Feed a render (playback) block for the echo canceller's reference
    ///
    /// Called with audio about to be played so the processor can subtract
    /// it from the microphone signal. The input is not modified.
    pub fn analyze_render_block(&mut self, block: &[f32]) -> Result<(), String> {
        if block.len() != BLOCK_SAMPLES {
            return Err(format!(
                "Expected {} samples, got {}",
                BLOCK_SAMPLES,
                block.len()
            ));
        }

        let mut copy = block.to_vec();
        self.processor
            .process_render_frame(&mut copy)
            .map_err(|e| format!("Render processing error: {e}"))
    }
}

// =============================================================================
// Tests
// =============================================================================
