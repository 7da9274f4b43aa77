//! Audio capture: microphone input, block assembly, and speech-energy
//! tracking.

/// Microphone capture via CPAL
pub mod capture;
/// Energy-based speech classification and the shared speech clock
pub mod vad;

use std::time::{Duration, Instant};
use thiserror::Error;

pub use capture::{AudioBackend, CaptureChain, CaptureHandle, CpalBackend};
pub use vad::{classify_speech, SpeechClock, SPEECH_ENERGY_THRESHOLD};

/// Errors opening or driving the audio input device
#[derive(Debug, Error)]
pub enum DeviceError {
    /// No input device matches the configured selector
    #[error("audio input device not found: {0}")]
    NotFound(String),

    /// The device rejected the requested stream parameters
    #[error("failed to open audio input stream: {0}")]
    Open(String),

    /// The capture thread did not report readiness in time
    #[error("timed out waiting for audio stream to start")]
    OpenTimeout,
}

/// One fixed-size chunk of captured mono samples.
///
/// Immutable once produced; ownership moves from the capture callback to
/// the draining worker through the session ring buffer.
#[derive(Debug, Clone)]
pub struct AudioBlock {
    /// Normalized mono samples
    pub samples: Vec<f32>,
    /// When the block was assembled
    pub captured_at: Instant,
}

impl AudioBlock {
    /// Creates a block captured now
    #[must_use]
    pub fn new(samples: Vec<f32>) -> Self {
        Self {
            samples,
            captured_at: Instant::now(),
        }
    }

    /// Playback duration of the block at the given rate
    #[must_use]
    pub fn duration(&self, sample_rate: u32) -> Duration {
        if sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(sample_rate))
    }
}
