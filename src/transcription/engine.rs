use anyhow::{Context, Result};
use hound::{WavSpec, WavWriter};
use std::path::Path;
use std::sync::{Arc, Mutex};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use crate::audio::{classify_speech, SPEECH_ENERGY_THRESHOLD};
use crate::config::{Config, ModelConfig};
use crate::transcription::{SpeechToText, TranscribeOptions, TranscriptionError};

/// Window size used by the energy VAD pre-filter (100 ms at 16 kHz)
const VAD_WINDOW_SAMPLES: usize = 1600;

/// Directory for debug WAV dumps of each transcribed buffer, if set
const DEBUG_WAV_ENV: &str = "WHISPER_DICTATE_DEBUG_WAV";

/// Whisper transcription engine.
///
/// Loaded lazily by the dictation service and cached across sessions; the
/// context is invalidated only when model-relevant config fields change.
pub struct WhisperEngine {
    /// Whisper context (exclusive access via the mutex)
    ctx: Arc<Mutex<WhisperContext>>,
    /// Number of CPU threads for inference
    threads: i32,
}

impl WhisperEngine {
    /// Determines sampling strategy based on beam size (pure, testable)
    const fn sampling_strategy(beam_size: i32) -> SamplingStrategy {
        if beam_size > 1 {
            SamplingStrategy::BeamSearch {
                beam_size,
                patience: -1.0,
            }
        } else {
            SamplingStrategy::Greedy { best_of: 1 }
        }
    }

    /// Loads the model described by `config`
    ///
    /// # Errors
    /// Returns [`TranscriptionError::ModelLoad`] if the path is invalid, the
    /// model file is missing or corrupt, or `threads` is out of range.
    pub fn load(config: &ModelConfig) -> Result<Self, TranscriptionError> {
        let model_path =
            Config::expand_path(&config.path).map_err(|e| TranscriptionError::ModelLoad {
                path: config.path.clone(),
                source: e,
            })?;

        if config.threads == 0 {
            return Err(TranscriptionError::ModelLoad {
                path: model_path.display().to_string(),
                source: anyhow::anyhow!("threads must be > 0"),
            });
        }
        let threads = i32::try_from(config.threads).map_err(|_| TranscriptionError::ModelLoad {
            path: model_path.display().to_string(),
            source: anyhow::anyhow!("threads value too large (max: {})", i32::MAX),
        })?;

        tracing::info!(
            path = %model_path.display(),
            threads = config.threads,
            use_gpu = config.use_gpu,
            "loading whisper model"
        );

        let path_str = model_path
            .to_str()
            .ok_or_else(|| TranscriptionError::ModelLoad {
                path: model_path.display().to_string(),
                source: anyhow::anyhow!("model path contains invalid UTF-8"),
            })?;

        let mut ctx_params = WhisperContextParameters::default();
        ctx_params.use_gpu(config.use_gpu);
        let ctx = WhisperContext::new_with_params(path_str, ctx_params).map_err(|e| {
            TranscriptionError::ModelLoad {
                path: model_path.display().to_string(),
                source: anyhow::anyhow!("{e:?}"),
            }
        })?;

        tracing::info!("whisper model loaded");

        Ok(Self {
            ctx: Arc::new(Mutex::new(ctx)),
            threads,
        })
    }

    fn transcribe_impl(
        &self,
        samples: &[f32],
        options: &TranscribeOptions,
    ) -> Result<String, TranscriptionError> {
        let _span = tracing::debug_span!("transcription", samples = samples.len()).entered();

        let trimmed;
        let samples = if options.vad_filter {
            trimmed = strip_silence(samples, SPEECH_ENERGY_THRESHOLD);
            if trimmed.is_empty() {
                tracing::debug!("vad filter found no speech, skipping inference");
                return Ok(String::new());
            }
            trimmed.as_slice()
        } else {
            samples
        };

        if let Ok(dir) = std::env::var(DEBUG_WAV_ENV) {
            if let Err(e) = save_wav_debug(samples, Path::new(&dir)) {
                tracing::warn!("failed to save debug WAV: {e:#}");
            }
        }

        let mut state = self
            .ctx
            .lock()
            .map_err(|e| anyhow::anyhow!("mutex poisoned: {e}"))?
            .create_state()
            .map_err(|_| TranscriptionError::StateCreation)?;

        let beam_size = i32::try_from(options.beam_size)
            .map_err(|_| anyhow::anyhow!("beam_size value too large (max: {})", i32::MAX))?;
        let strategy = Self::sampling_strategy(beam_size);
        let mut params = FullParams::new(strategy);
        params.set_n_threads(self.threads);
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);
        params.set_language(options.language.as_deref());
        params.set_translate(false);
        if !options.initial_prompt.is_empty() {
            params.set_initial_prompt(&options.initial_prompt);
        }

        let start = std::time::Instant::now();
        state
            .full(params, samples)
            .context("whisper inference failed")?;
        let inference_duration = start.elapsed();

        let mut result = String::new();
        for segment in state.as_iter() {
            result.push_str(&segment.to_string());
        }

        let result = result.trim().to_owned();

        tracing::info!(
            segments = state.full_n_segments(),
            text_len = result.len(),
            inference_ms = inference_duration.as_millis(),
            "transcription completed"
        );

        Ok(result)
    }
}

impl SpeechToText for WhisperEngine {
    fn transcribe(
        &self,
        samples: &[f32],
        options: &TranscribeOptions,
    ) -> Result<String, TranscriptionError> {
        self.transcribe_impl(samples, options)
    }
}

// SAFETY: WhisperEngine is thread-safe because:
// 1. WhisperContext is wrapped in Arc<Mutex<>>, ensuring exclusive access
// 2. All methods require acquiring the mutex lock before accessing the context
// 3. No shared mutable state exists outside the mutex
#[allow(unsafe_code)]
unsafe impl Send for WhisperEngine {}
#[allow(unsafe_code)]
unsafe impl Sync for WhisperEngine {}

/// Trims leading and trailing non-speech windows from a buffer, keeping one
/// window of padding on each side so word onsets survive the cut. Returns
/// an empty vec when no window carries speech energy.
#[must_use]
pub fn strip_silence(samples: &[f32], threshold: f32) -> Vec<f32> {
    let windows: Vec<&[f32]> = samples.chunks(VAD_WINDOW_SAMPLES).collect();
    let first = windows.iter().position(|w| classify_speech(w, threshold));
    let Some(first) = first else {
        return Vec::new();
    };
    let last = windows
        .iter()
        .rposition(|w| classify_speech(w, threshold))
        .unwrap_or(first);

    let start = first.saturating_sub(1) * VAD_WINDOW_SAMPLES;
    let end = ((last + 2) * VAD_WINDOW_SAMPLES).min(samples.len());
    samples[start..end].to_vec()
}

/// Saves samples to a timestamped WAV file under `dir` for debugging
///
/// # Errors
/// Returns error if directory creation or file write fails.
pub fn save_wav_debug(samples: &[f32], dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).context("failed to create debug directory")?;

    let stamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let path = dir.join(format!("flush-{stamp}.wav"));

    let spec = WavSpec {
        channels: 1,
        sample_rate: 16000,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };

    let mut writer = WavWriter::create(&path, spec).context("failed to create WAV file")?;
    for &sample in samples {
        writer
            .write_sample(sample)
            .context("failed to write sample")?;
    }
    writer.finalize().context("failed to finalize WAV file")?;

    tracing::debug!("saved debug WAV: {} ({} samples)", path.display(), samples.len());
    Ok(())
}
