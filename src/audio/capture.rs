use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;
use ringbuf::{traits::Producer, HeapProd};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::audio::{classify_speech, AudioBlock, DeviceError, SpeechClock};
use crate::config::AudioConfig;
use crate::status::{DictationState, StatusBus};

/// How long `open` waits for the capture thread to report a running stream
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Callback-side consumer of raw device frames.
///
/// Runs entirely inside the audio driver callback: downmixes interleaved
/// frames to mono, assembles fixed-size blocks, classifies each block for
/// speech energy, and pushes it into the session ring buffer. No locking,
/// no allocation beyond the block being assembled.
pub struct CaptureChain {
    producer: HeapProd<AudioBlock>,
    clock: Arc<SpeechClock>,
    threshold: f32,
    block_size: usize,
    pending: Vec<f32>,
    status: StatusBus,
    overrun_reported: bool,
}

impl CaptureChain {
    /// Creates a chain producing blocks of `block_size` mono samples
    #[must_use]
    pub fn new(
        producer: HeapProd<AudioBlock>,
        clock: Arc<SpeechClock>,
        threshold: f32,
        block_size: usize,
        status: StatusBus,
    ) -> Self {
        Self {
            producer,
            clock,
            threshold,
            block_size,
            pending: Vec::with_capacity(block_size),
            status,
            overrun_reported: false,
        }
    }

    /// Bus carrying capture-side warnings to external observers
    #[must_use]
    pub fn status(&self) -> StatusBus {
        self.status.clone()
    }

    /// Feeds one driver callback's worth of interleaved frames
    pub fn deliver(&mut self, interleaved: &[f32], channels: u16) {
        if channels <= 1 {
            self.pending.extend_from_slice(interleaved);
        } else {
            let channels_f64 = f64::from(channels);
            for frame in interleaved.chunks(channels as usize) {
                let sum: f64 = frame.iter().map(|&s| f64::from(s)).sum();
                // Downmix average of f32 samples fits in f32
                #[allow(clippy::cast_possible_truncation)]
                self.pending.push((sum / channels_f64) as f32);
            }
        }

        while self.pending.len() >= self.block_size {
            let rest = self.pending.split_off(self.block_size);
            let samples = std::mem::replace(&mut self.pending, rest);
            self.emit(samples);
        }
    }

    fn emit(&mut self, samples: Vec<f32>) {
        if classify_speech(&samples, self.threshold) {
            self.clock.record_speech();
        }

        if let Err(block) = self.producer.try_push(AudioBlock::new(samples)) {
            warn!(
                dropped_samples = block.samples.len(),
                "capture ring buffer full, block dropped"
            );
            if !self.overrun_reported {
                self.overrun_reported = true;
                self.status.publish(
                    DictationState::Listening,
                    "audio overrun: transcription is falling behind capture",
                );
            }
        }
    }
}

/// Opens capture streams; swapped for a scripted backend in tests
pub trait AudioBackend: Send + Sync {
    /// Opens the configured device and starts delivering blocks into `chain`
    ///
    /// # Errors
    /// Returns [`DeviceError`] if the device is missing or rejects the
    /// requested parameters.
    fn open(
        &self,
        config: &AudioConfig,
        chain: CaptureChain,
    ) -> Result<Box<dyn CaptureHandle>, DeviceError>;
}

/// A running capture stream
pub trait CaptureHandle: Send {
    /// Stops the stream and releases the device handle.
    ///
    /// Idempotent, and safe to call from a different thread than `open`.
    fn close(&mut self);
}

/// CPAL-backed capture.
///
/// `cpal::Stream` is not `Send`, so the stream is built and owned by a
/// dedicated thread; `open` hands it the chain and waits for a readiness
/// report, and `close` signals the thread and joins it.
pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    fn open(
        &self,
        config: &AudioConfig,
        chain: CaptureChain,
    ) -> Result<Box<dyn CaptureHandle>, DeviceError> {
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), DeviceError>>();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let device_selector = config.device.clone();
        let sample_rate = config.sample_rate;

        let thread = std::thread::Builder::new()
            .name("audio-capture".to_owned())
            .spawn(move || {
                run_capture_thread(&device_selector, sample_rate, chain, &ready_tx, &shutdown_rx);
            })
            .map_err(|e| DeviceError::Open(format!("failed to spawn capture thread: {e}")))?;

        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(())) => Ok(Box::new(CpalCaptureHandle {
                shutdown: Some(shutdown_tx),
                thread: Some(thread),
            })),
            Ok(Err(e)) => {
                // Thread reported failure and is exiting; reap it.
                drop(shutdown_tx);
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                drop(shutdown_tx);
                Err(DeviceError::OpenTimeout)
            }
        }
    }
}

/// Body of the stream-owner thread: build, play, park until shutdown
fn run_capture_thread(
    device_selector: &str,
    sample_rate: u32,
    mut chain: CaptureChain,
    ready_tx: &mpsc::Sender<Result<(), DeviceError>>,
    shutdown_rx: &mpsc::Receiver<()>,
) {
    let host = cpal::default_host();

    let device = if device_selector.is_empty() {
        host.default_input_device()
    } else {
        host.input_devices().ok().and_then(|mut devices| {
            devices.find(|d| d.name().map(|n| n == device_selector).unwrap_or(false))
        })
    };
    let Some(device) = device else {
        let selector = if device_selector.is_empty() {
            "(default)".to_owned()
        } else {
            device_selector.to_owned()
        };
        let _ = ready_tx.send(Err(DeviceError::NotFound(selector)));
        return;
    };

    let device_name = device.name().unwrap_or_else(|_| "unknown".to_owned());

    let supported = match device.default_input_config() {
        Ok(c) => c,
        Err(e) => {
            let _ = ready_tx.send(Err(DeviceError::Open(format!(
                "no default input config for {device_name}: {e}"
            ))));
            return;
        }
    };
    let channels = supported.channels();
    let sample_format = supported.sample_format();

    info!(
        device = %device_name,
        sample_rate,
        channels,
        format = ?sample_format,
        "opening audio input stream"
    );

    let stream_config = cpal::StreamConfig {
        channels,
        sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    // Driver-reported stream errors are transient: warn through the
    // status path and keep streaming
    let status = chain.status();
    let error_cb = move |err: cpal::StreamError| {
        warn!("audio stream error: {}", err);
        status.publish(DictationState::Listening, format!("audio stream error: {err}"));
    };

    let stream = match sample_format {
        SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                chain.deliver(data, channels);
            },
            error_cb,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let converted: Vec<f32> =
                    data.iter().map(|&s| f32::from(s) / 32768.0).collect();
                chain.deliver(&converted, channels);
            },
            error_cb,
            None,
        ),
        other => {
            let _ = ready_tx.send(Err(DeviceError::Open(format!(
                "unsupported sample format: {other:?}"
            ))));
            return;
        }
    };

    let stream = match stream {
        Ok(s) => s,
        Err(e) => {
            let _ = ready_tx.send(Err(DeviceError::Open(e.to_string())));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(DeviceError::Open(e.to_string())));
        return;
    }

    let _ = ready_tx.send(Ok(()));

    // Park until the handle is closed; the stream stays alive on this
    // thread and is dropped (releasing the device) when we return.
    let _ = shutdown_rx.recv();
    debug!("audio capture thread shutting down");
}

struct CpalCaptureHandle {
    shutdown: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureHandle for CpalCaptureHandle {
    fn close(&mut self) {
        // Dropping the sender unblocks the owner thread's recv
        if self.shutdown.take().is_none() {
            return;
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("audio capture thread panicked during shutdown");
            }
        }
        info!("audio input stream closed");
    }
}

impl Drop for CpalCaptureHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SPEECH_ENERGY_THRESHOLD;
    use ringbuf::{
        traits::{Consumer, Split},
        HeapRb,
    };

    fn test_chain(capacity: usize, block_size: usize) -> (CaptureChain, ringbuf::HeapCons<AudioBlock>) {
        let (prod, cons) = HeapRb::<AudioBlock>::new(capacity).split();
        let (status, _rx) = StatusBus::channel();
        let clock = Arc::new(SpeechClock::new());
        (
            CaptureChain::new(prod, clock, SPEECH_ENERGY_THRESHOLD, block_size, status),
            cons,
        )
    }

    #[test]
    fn test_chain_assembles_fixed_blocks() {
        let (mut chain, mut cons) = test_chain(16, 4);

        chain.deliver(&[0.1, 0.2, 0.3], 1);
        assert!(cons.try_pop().is_none(), "partial block must not be emitted");

        chain.deliver(&[0.4, 0.5], 1);
        let block = cons.try_pop().expect("block after 4 samples");
        assert_eq!(block.samples, vec![0.1, 0.2, 0.3, 0.4]);

        // Remainder carries over to the next block
        chain.deliver(&[0.6, 0.7, 0.8], 1);
        let block = cons.try_pop().expect("second block");
        assert_eq!(block.samples, vec![0.5, 0.6, 0.7, 0.8]);
    }

    #[test]
    fn test_chain_emits_multiple_blocks_per_callback() {
        let (mut chain, mut cons) = test_chain(16, 2);
        chain.deliver(&[0.1, 0.2, 0.3, 0.4, 0.5, 0.6], 1);
        assert_eq!(cons.try_pop().unwrap().samples, vec![0.1, 0.2]);
        assert_eq!(cons.try_pop().unwrap().samples, vec![0.3, 0.4]);
        assert_eq!(cons.try_pop().unwrap().samples, vec![0.5, 0.6]);
        assert!(cons.try_pop().is_none());
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_chain_downmixes_stereo() {
        let (mut chain, mut cons) = test_chain(16, 2);
        // Frames: (1.0, 0.0), (0.5, 0.5) -> mono [0.5, 0.5]
        chain.deliver(&[1.0, 0.0, 0.5, 0.5], 2);
        let block = cons.try_pop().unwrap();
        assert_eq!(block.samples, vec![0.5, 0.5]);
    }

    #[test]
    fn test_chain_records_speech_on_loud_block() {
        let (prod, mut cons) = HeapRb::<AudioBlock>::new(8).split();
        let (status, _rx) = StatusBus::channel();
        let clock = Arc::new(SpeechClock::new());
        let mut chain = CaptureChain::new(
            prod,
            Arc::clone(&clock),
            SPEECH_ENERGY_THRESHOLD,
            4,
            status,
        );

        std::thread::sleep(Duration::from_millis(25));
        let stale = clock.time_since_last_speech();
        assert!(stale >= Duration::from_millis(20));

        chain.deliver(&[0.2, 0.2, 0.2, 0.2], 1);
        assert!(cons.try_pop().is_some());
        assert!(clock.time_since_last_speech() < stale);
    }

    #[test]
    fn test_chain_silence_does_not_touch_clock() {
        let (prod, _cons) = HeapRb::<AudioBlock>::new(8).split();
        let (status, _rx) = StatusBus::channel();
        let clock = Arc::new(SpeechClock::new());
        let mut chain = CaptureChain::new(
            prod,
            Arc::clone(&clock),
            SPEECH_ENERGY_THRESHOLD,
            4,
            status,
        );

        std::thread::sleep(Duration::from_millis(25));
        chain.deliver(&[0.0, 0.0, 0.0, 0.0], 1);
        assert!(clock.time_since_last_speech() >= Duration::from_millis(20));
    }

    #[test]
    fn test_chain_overrun_reports_once_and_keeps_capturing() {
        let (prod, mut cons) = HeapRb::<AudioBlock>::new(1).split();
        let (status, status_rx) = StatusBus::channel();
        let clock = Arc::new(SpeechClock::new());
        let mut chain =
            CaptureChain::new(prod, clock, SPEECH_ENERGY_THRESHOLD, 2, status);

        // First block fills the ring; the next two overflow it
        chain.deliver(&[0.1, 0.1, 0.2, 0.2, 0.3, 0.3], 1);

        let overruns: Vec<_> = status_rx.try_iter().collect();
        assert_eq!(overruns.len(), 1, "overrun reported once per session");
        assert!(overruns[0].message.contains("overrun"));

        // The ring still holds the first block; capture continued
        assert!(cons.try_pop().is_some());
    }

    #[test]
    fn test_chain_status_reaches_observer() {
        // The stream error callback warns through the chain's bus; events
        // published on the clone must land at the session observer
        let (prod, _cons) = HeapRb::<AudioBlock>::new(4).split();
        let (status, status_rx) = StatusBus::channel();
        let chain = CaptureChain::new(
            prod,
            Arc::new(SpeechClock::new()),
            SPEECH_ENERGY_THRESHOLD,
            4,
            status,
        );

        chain
            .status()
            .publish(DictationState::Listening, "audio stream error: device gone");
        let event = status_rx.try_recv().expect("event delivered");
        assert_eq!(event.state, DictationState::Listening);
        assert!(event.message.contains("audio stream error"));
    }

    #[test]
    #[ignore = "requires audio hardware"]
    fn test_cpal_open_and_close() {
        let config = AudioConfig {
            sample_rate: 16000,
            block_size: 1600,
            device: String::new(),
        };
        let (prod, _cons) = HeapRb::<AudioBlock>::new(64).split();
        let (status, _rx) = StatusBus::channel();
        let chain = CaptureChain::new(
            prod,
            Arc::new(SpeechClock::new()),
            SPEECH_ENERGY_THRESHOLD,
            1600,
            status,
        );

        let mut handle = CpalBackend.open(&config, chain).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        handle.close();
        // close is idempotent
        handle.close();
    }

    #[test]
    fn test_cpal_unknown_device_is_not_found() {
        let config = AudioConfig {
            sample_rate: 16000,
            block_size: 1600,
            device: "no-such-device-9f2a".to_owned(),
        };
        let (prod, _cons) = HeapRb::<AudioBlock>::new(4).split();
        let (status, _rx) = StatusBus::channel();
        let chain = CaptureChain::new(
            prod,
            Arc::new(SpeechClock::new()),
            SPEECH_ENERGY_THRESHOLD,
            1600,
            status,
        );

        let result = CpalBackend.open(&config, chain);
        assert!(matches!(result, Err(DeviceError::NotFound(_))));
    }
}
