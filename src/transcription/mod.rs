//! Speech-to-text capability: the trait consumed by the dictation service
//! and its Whisper-backed implementation.

/// Whisper engine implementation
pub mod engine;

use thiserror::Error;

use crate::config::Config;

pub use engine::WhisperEngine;

/// Errors that can occur while loading the model or transcribing
#[derive(Debug, Error)]
pub enum TranscriptionError {
    /// Failed to load the Whisper model
    #[error("failed to load whisper model from {path}: {source}")]
    ModelLoad {
        /// Path to model file
        path: String,
        /// Underlying error
        source: anyhow::Error,
    },

    /// Failed to create a Whisper inference state
    #[error("failed to create whisper state")]
    StateCreation,

    /// Inference failed
    #[error("failed to transcribe audio")]
    Transcription(#[from] anyhow::Error),
}

/// Per-session transcription parameters, snapshotted from config
#[derive(Debug, Clone)]
pub struct TranscribeOptions {
    /// Language code, `None` for autodetection
    pub language: Option<String>,
    /// Beam search width; 1 selects greedy decoding
    pub beam_size: usize,
    /// Trim non-speech spans before inference
    pub vad_filter: bool,
    /// Context prompt fed to the decoder, empty for none
    pub initial_prompt: String,
}

impl TranscribeOptions {
    /// Builds the per-session snapshot from a config
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            language: config.language_option(),
            beam_size: config.whisper.beam_size,
            vad_filter: config.whisper.use_vad_filter,
            initial_prompt: config.whisper.initial_prompt.clone(),
        }
    }
}

/// Transcribes buffered audio to text.
///
/// Implemented by [`WhisperEngine`] in production; mocked in tests so the
/// pipeline can be exercised without a model file. Calls may take seconds
/// and are only ever made from the draining worker.
#[cfg_attr(test, mockall::automock)]
pub trait SpeechToText: Send + Sync {
    /// Transcribe 16 kHz mono samples to text
    ///
    /// # Errors
    /// Returns error if inference fails.
    fn transcribe(
        &self,
        samples: &[f32],
        options: &TranscribeOptions,
    ) -> Result<String, TranscriptionError>;
}
