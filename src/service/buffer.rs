use std::time::Duration;

use crate::audio::AudioBlock;

/// Buffered duration at which a mid-session flush happens
pub const PROCESS_THRESHOLD: Duration = Duration::from_secs(1);

/// Minimum buffered duration worth a final flush when stopping
pub const MIN_FLUSH_ON_STOP: Duration = Duration::from_millis(200);

/// Accumulates captured blocks until the flush policy hands them to the
/// transcription engine.
///
/// Owned exclusively by the draining worker, so the flush decision and the
/// reset in [`take`](Self::take) are atomic with respect to appends: no
/// block can land between them.
pub struct TranscriptionBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl TranscriptionBuffer {
    /// Creates an empty buffer for samples at `sample_rate`
    #[must_use]
    pub fn new(sample_rate: u32) -> Self {
        Self {
            samples: Vec::new(),
            sample_rate,
        }
    }

    /// Appends one captured block
    pub fn append(&mut self, block: AudioBlock) {
        self.samples.extend(block.samples);
    }

    /// Duration of audio currently buffered
    #[must_use]
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Whether the accumulated audio should be handed to the engine now.
    ///
    /// Mid-session: once a full second is buffered. When the session is
    /// stopping (user toggle or silence timeout alike), anything over the
    /// small minimum is worth one final flush; below it the residue is
    /// discarded.
    #[must_use]
    pub fn should_flush(&self, stopping: bool) -> bool {
        let buffered = self.duration();
        buffered >= PROCESS_THRESHOLD || (stopping && buffered > MIN_FLUSH_ON_STOP)
    }

    /// Hands off the accumulated samples and resets the buffer to empty
    #[must_use]
    pub fn take(&mut self) -> Vec<f32> {
        std::mem::take(&mut self.samples)
    }
}
