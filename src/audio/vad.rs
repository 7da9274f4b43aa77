use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Energy threshold for speech classification, as a ratio of full-scale
/// amplitude (raw threshold 500 over the i16 range).
pub const SPEECH_ENERGY_THRESHOLD: f32 = 500.0 / 32768.0;

/// Classifies one block of normalized samples as speech by RMS energy.
///
/// Pure function of the block; the stateful side of speech tracking lives
/// in [`SpeechClock`].
#[must_use]
pub fn classify_speech(samples: &[f32], threshold: f32) -> bool {
    if samples.is_empty() {
        return false;
    }
    let sum_sq: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    let mean = sum_sq / samples.len() as f64;
    // RMS of f32 samples fits comfortably in f32 range
    #[allow(clippy::cast_possible_truncation)]
    let rms = mean.sqrt() as f32;
    rms > threshold
}

/// Time of last detected speech, shared between the capture callback and
/// the draining worker.
///
/// Stored as whole milliseconds since the clock's epoch in a single
/// `AtomicU64`, so readers always see a complete timestamp, never a torn
/// one. Updates use `fetch_max`, which keeps the value monotonically
/// non-decreasing even if callback and worker race. Ordering is `Relaxed`:
/// the value is a timing heuristic, and a slightly stale read only delays
/// a silence timeout by one poll interval.
pub struct SpeechClock {
    epoch: Instant,
    last_speech_ms: AtomicU64,
}

impl SpeechClock {
    /// Creates a clock whose "last speech" starts at now
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_speech_ms: AtomicU64::new(0),
        }
    }

    /// Records that speech energy was just observed
    pub fn record_speech(&self) {
        let ms = u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_speech_ms.fetch_max(ms, Ordering::Relaxed);
    }

    /// Duration since the last recorded speech
    #[must_use]
    pub fn time_since_last_speech(&self) -> Duration {
        let last = Duration::from_millis(self.last_speech_ms.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }
}

impl Default for SpeechClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_classify_silence() {
        let silence = vec![0.0_f32; 8000];
        assert!(!classify_speech(&silence, SPEECH_ENERGY_THRESHOLD));
    }

    #[test]
    fn test_classify_quiet_noise_below_threshold() {
        // Amplitude well under 500/32768 ≈ 0.0153
        let quiet = vec![0.005_f32; 8000];
        assert!(!classify_speech(&quiet, SPEECH_ENERGY_THRESHOLD));
    }

    #[test]
    fn test_classify_speech_level_energy() {
        let loud = vec![0.1_f32; 8000];
        assert!(classify_speech(&loud, SPEECH_ENERGY_THRESHOLD));
    }

    #[test]
    fn test_classify_empty_block() {
        assert!(!classify_speech(&[], SPEECH_ENERGY_THRESHOLD));
    }

    #[test]
    fn test_classify_sine_rms() {
        // 0.1-amplitude sine has RMS ≈ 0.0707, above the default threshold
        let sine: Vec<f32> = (0..8000)
            .map(|i| {
                #[allow(clippy::cast_precision_loss)]
                let t = i as f32 / 16000.0;
                (2.0 * std::f32::consts::PI * 440.0 * t).sin() * 0.1
            })
            .collect();
        assert!(classify_speech(&sine, SPEECH_ENERGY_THRESHOLD));
    }

    #[test]
    fn test_clock_starts_near_zero() {
        let clock = SpeechClock::new();
        assert!(clock.time_since_last_speech() < Duration::from_millis(100));
    }

    #[test]
    fn test_clock_record_resets_elapsed() {
        let clock = SpeechClock::new();
        std::thread::sleep(Duration::from_millis(30));
        clock.record_speech();
        assert!(clock.time_since_last_speech() < Duration::from_millis(20));
    }

    #[test]
    fn test_clock_monotonic_under_stale_record() {
        let clock = SpeechClock::new();
        clock.record_speech();
        let first = clock.last_speech_ms.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(15));
        clock.record_speech();
        let second = clock.last_speech_ms.load(Ordering::Relaxed);
        assert!(second >= first);

        // A racing writer storing an older value must not move the clock back
        clock.last_speech_ms.fetch_max(first, Ordering::Relaxed);
        assert!(clock.last_speech_ms.load(Ordering::Relaxed) >= second);
    }

    #[test]
    fn test_clock_shared_across_threads() {
        use std::sync::Arc;

        let clock = Arc::new(SpeechClock::new());
        let writer = Arc::clone(&clock);
        let handle = std::thread::spawn(move || {
            for _ in 0..100 {
                writer.record_speech();
            }
        });
        for _ in 0..100 {
            let _ = clock.time_since_last_speech();
        }
        handle.join().unwrap();
        assert!(clock.time_since_last_speech() < Duration::from_secs(1));
    }
}
