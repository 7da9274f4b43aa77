//! Push-to-talk dictation pipeline: captures microphone audio, transcribes
//! it with Whisper, and types the recognized text into the focused window.

pub mod audio;
pub mod config;
pub mod insert;
pub mod service;
pub mod status;
pub mod telemetry;
pub mod transcription;
