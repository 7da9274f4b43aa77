//! The dictation pipeline orchestrator: session lifecycle, the draining
//! worker that feeds the transcription engine, and the insertion worker
//! that types recognized text.

/// Audio accumulation and flush policy
pub mod buffer;

use anyhow::{Context, Result};
use ringbuf::{
    traits::{Consumer, Split},
    HeapCons, HeapRb,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::audio::{
    AudioBackend, AudioBlock, CaptureChain, CaptureHandle, CpalBackend, SpeechClock,
    SPEECH_ENERGY_THRESHOLD,
};
use crate::config::{Config, ModelConfig};
use crate::insert::{build_sink, insert_text_safe, TextSink};
use crate::service::buffer::TranscriptionBuffer;
use crate::status::{DictationState, StatusBus};
use crate::transcription::{SpeechToText, TranscribeOptions, TranscriptionError, WhisperEngine};

/// Bounded wait for the next audio block in the draining worker
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Bounded wait for the next segment in the insertion worker
const TEXT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How long shutdown waits for a worker before detaching it
const JOIN_GRACE: Duration = Duration::from_secs(5);

/// Capture ring capacity in blocks (about two minutes of audio)
fn ring_capacity(sample_rate: u32, block_size: usize) -> usize {
    ((sample_rate as usize * 120) / block_size.max(1)).max(16)
}

/// Lazily loads the speech-to-text capability; swapped for a scripted
/// loader in tests
pub type EngineLoader =
    Box<dyn Fn(&ModelConfig) -> Result<Arc<dyn SpeechToText>, TranscriptionError> + Send + Sync>;

/// One listening-to-idle dictation attempt
struct SessionState {
    /// Open capture stream; taken when the stop path closes it
    handle: Option<Box<dyn CaptureHandle>>,
    /// Read by the draining worker's loop condition
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    done_rx: Option<Receiver<()>>,
}

struct InsertionWorker {
    thread: Option<JoinHandle<()>>,
    done_rx: Receiver<()>,
}

struct StateInner {
    state: DictationState,
    config: Config,
    /// Cached across sessions; invalidated when model config changes
    engine: Option<Arc<dyn SpeechToText>>,
    sink: Arc<dyn TextSink>,
    session: Option<SessionState>,
    /// Sender side of the text delivery channel; present while running
    text_tx: Option<Sender<String>>,
    running: bool,
}

/// State shared with the worker threads
struct Shared {
    state: Mutex<StateInner>,
    status: StatusBus,
}

impl Shared {
    /// A worker panic must not take the whole service down with a poisoned
    /// lock, so poison is stripped.
    fn lock_state(&self) -> MutexGuard<'_, StateInner> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Flips the stop flag and starts the Listening → Processing leg.
    ///
    /// Returns the capture handle for the caller to close outside the
    /// lock. Idempotent: a second stop request (user toggle racing the
    /// silence timeout) returns `None`.
    fn begin_stop(&self, inner: &mut StateInner) -> Option<Box<dyn CaptureHandle>> {
        let session = inner.session.as_mut()?;
        if session.stop.swap(true, Ordering::AcqRel) {
            return None;
        }
        inner.state = DictationState::Processing;
        self.status
            .publish(DictationState::Processing, "Finishing transcription...");
        session.handle.take()
    }

    /// Stop request issued by the draining worker on silence timeout
    fn request_stop(&self) {
        let handle = {
            let mut inner = self.lock_state();
            if inner.state != DictationState::Listening {
                return;
            }
            self.begin_stop(&mut inner)
        };
        if let Some(mut handle) = handle {
            handle.close();
        }
    }

    /// Terminal leg of a session, owned by the draining worker: the toggle
    /// caller only initiates the stop, the worker completes Processing →
    /// Idle once its buffer is drained.
    fn finish_session(&self) {
        let mut inner = self.lock_state();
        let leftover = inner
            .session
            .take()
            .and_then(|mut session| session.handle.take());
        if inner.state == DictationState::Processing && inner.running {
            inner.state = DictationState::Idle;
            self.status
                .publish(DictationState::Idle, "Dictation stopped");
        }
        drop(inner);
        // A worker-side error exit can leave the stream open; release it.
        if let Some(mut handle) = leftover {
            handle.close();
        }
    }
}

/// The dictation pipeline: owns session lifecycle, the cached engine
/// handle, and both worker threads.
///
/// All state transitions serialize through one internal lock; at most one
/// session is active at any time.
pub struct DictationService {
    shared: Arc<Shared>,
    /// Serializes the public operations so multi-step transitions
    /// (stop-then-apply in reload) cannot interleave
    ops: Mutex<()>,
    backend: Arc<dyn AudioBackend>,
    loader: EngineLoader,
    insertion: Mutex<Option<InsertionWorker>>,
}

impl DictationService {
    /// Creates a service with the CPAL backend and Whisper engine
    ///
    /// # Errors
    /// Returns error if the config is invalid.
    pub fn new(config: Config, status: StatusBus) -> Result<Self> {
        let sink: Arc<dyn TextSink> = Arc::from(build_sink(&config.general.text_inserter)?);
        Ok(Self::with_parts(
            config,
            status,
            Arc::new(CpalBackend),
            Box::new(|model| {
                WhisperEngine::load(model).map(|e| Arc::new(e) as Arc<dyn SpeechToText>)
            }),
            sink,
        ))
    }

    /// Creates a service from explicit collaborators (used by tests to
    /// substitute scripted audio, engine, and sink)
    #[must_use]
    pub fn with_parts(
        config: Config,
        status: StatusBus,
        backend: Arc<dyn AudioBackend>,
        loader: EngineLoader,
        sink: Arc<dyn TextSink>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(StateInner {
                    state: DictationState::Offline,
                    config,
                    engine: None,
                    sink,
                    session: None,
                    text_tx: None,
                    running: false,
                }),
                status,
            }),
            ops: Mutex::new(()),
            backend,
            loader,
            insertion: Mutex::new(None),
        }
    }

    /// Current pipeline state
    pub fn state(&self) -> DictationState {
        self.shared.lock_state().state
    }

    /// Starts the background services (insertion worker); audio stays
    /// closed until the first toggle
    ///
    /// # Errors
    /// Returns error if the worker thread cannot be spawned.
    pub fn start(&self) -> Result<()> {
        let _ops = self.lock_ops();
        let mut inner = self.shared.lock_state();
        if inner.running {
            debug!("start called while already running");
            return Ok(());
        }
        info!("starting dictation service");

        let (text_tx, text_rx) = mpsc::channel::<String>();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let shared = Arc::clone(&self.shared);
        let thread = std::thread::Builder::new()
            .name("text-insert".to_owned())
            .spawn(move || {
                run_insertion_worker(&shared, &text_rx);
                let _ = done_tx.send(());
            })
            .context("failed to spawn insertion worker")?;

        inner.text_tx = Some(text_tx);
        inner.running = true;
        *self.lock_insertion() = Some(InsertionWorker {
            thread: Some(thread),
            done_rx,
        });

        if inner.config.model.preload && inner.engine.is_none() {
            match (self.loader)(&inner.config.model) {
                Ok(engine) => inner.engine = Some(engine),
                Err(e) => {
                    // Preload failure is not fatal; the next toggle retries
                    error!("model preload failed: {e}");
                    self.shared
                        .status
                        .publish(DictationState::Error, format!("Model load failed: {e}"));
                }
            }
        }

        inner.state = DictationState::Idle;
        self.shared.status.publish(DictationState::Idle, "Ready");
        Ok(())
    }

    /// Starts a session if idle, or requests a stop if listening.
    ///
    /// A stop request returns as soon as capture is closed; the draining
    /// worker finishes the remaining buffer and completes the transition
    /// to Idle on its own.
    ///
    /// # Errors
    /// Returns error if the service is not running, the model fails to
    /// load, or the audio device cannot be opened. After an error the
    /// state is `Error` and another toggle may retry.
    pub fn toggle_dictation(&self) -> Result<()> {
        let _ops = self.lock_ops();
        let mut inner = self.shared.lock_state();

        if !inner.running {
            anyhow::bail!("service not started");
        }

        match inner.state {
            DictationState::Listening => {
                info!("stopping dictation");
                let handle = self.shared.begin_stop(&mut inner);
                drop(inner);
                if let Some(mut handle) = handle {
                    handle.close();
                }
                return Ok(());
            }
            DictationState::Processing => {
                anyhow::bail!("previous session is still finishing");
            }
            DictationState::Idle | DictationState::Error => {}
            DictationState::Offline => anyhow::bail!("service not started"),
        }

        info!("starting dictation");

        // Lazy-load the engine; on failure audio is never opened
        if inner.engine.is_none() {
            self.shared
                .status
                .publish(DictationState::Processing, "Loading speech model...");
            match (self.loader)(&inner.config.model) {
                Ok(engine) => inner.engine = Some(engine),
                Err(e) => {
                    inner.state = DictationState::Error;
                    self.shared
                        .status
                        .publish(DictationState::Error, format!("Model load failed: {e}"));
                    return Err(e.into());
                }
            }
        }
        let engine = inner
            .engine
            .clone()
            .context("engine missing after load")?;

        let clock = Arc::new(SpeechClock::new());
        let capacity = ring_capacity(inner.config.audio.sample_rate, inner.config.audio.block_size);
        let (producer, blocks) = HeapRb::<AudioBlock>::new(capacity).split();
        let chain = CaptureChain::new(
            producer,
            Arc::clone(&clock),
            SPEECH_ENERGY_THRESHOLD,
            inner.config.audio.block_size,
            self.shared.status.clone(),
        );

        let handle = match self.backend.open(&inner.config.audio, chain) {
            Ok(handle) => handle,
            Err(e) => {
                inner.state = DictationState::Error;
                self.shared
                    .status
                    .publish(DictationState::Error, format!("Audio start failed: {e}"));
                return Err(e.into());
            }
        };

        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let ctx = WorkerCtx {
            blocks,
            stop: Arc::clone(&stop),
            clock,
            engine,
            options: TranscribeOptions::from_config(&inner.config),
            sample_rate: inner.config.audio.sample_rate,
            silence_timeout: Duration::from_secs_f64(inner.config.general.silence_timeout),
            text_tx: inner
                .text_tx
                .clone()
                .context("text channel missing while running")?,
            status: self.shared.status.clone(),
            shared: Arc::clone(&self.shared),
        };

        let worker = std::thread::Builder::new()
            .name("stt-drain".to_owned())
            .spawn(move || {
                run_draining_worker(ctx);
                let _ = done_tx.send(());
            });
        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                // Session never became live; release the stream we opened
                let mut handle = handle;
                handle.close();
                inner.state = DictationState::Error;
                self.shared
                    .status
                    .publish(DictationState::Error, format!("Worker spawn failed: {e}"));
                return Err(e).context("failed to spawn draining worker");
            }
        };

        inner.session = Some(SessionState {
            handle: Some(handle),
            stop,
            worker: Some(worker),
            done_rx: Some(done_rx),
        });
        inner.state = DictationState::Listening;
        self.shared
            .status
            .publish(DictationState::Listening, "Listening...");
        Ok(())
    }

    /// Full shutdown: stops any session, terminates both workers with a
    /// bounded wait, force-releases the audio handle, transitions Offline
    ///
    /// # Errors
    /// Currently infallible; kept fallible for interface symmetry.
    pub fn stop(&self) -> Result<()> {
        let _ops = self.lock_ops();
        info!("stopping dictation service");

        let (handle, session_wait) = {
            let mut inner = self.shared.lock_state();
            if inner.state == DictationState::Offline {
                return Ok(());
            }
            let handle = self.shared.begin_stop(&mut inner);
            let session_wait = inner
                .session
                .as_mut()
                .map(|s| (s.done_rx.take(), s.worker.take()));
            inner.running = false;
            // Dropping the service's sender lets the insertion worker see
            // a disconnect once in-flight segments are delivered
            inner.text_tx = None;
            (handle, session_wait)
        };

        if let Some(mut handle) = handle {
            handle.close();
        }

        if let Some((done_rx, worker)) = session_wait {
            wait_for_worker("draining", done_rx, worker);
        }

        if let Some(mut insertion) = self.lock_insertion().take() {
            if insertion.done_rx.recv_timeout(JOIN_GRACE).is_ok() {
                if let Some(thread) = insertion.thread.take() {
                    let _ = thread.join();
                }
            } else {
                warn!("insertion worker did not finish in time, detaching");
            }
        }

        let mut inner = self.shared.lock_state();
        // Force-release anything a detached worker left behind
        let leftover = inner
            .session
            .take()
            .and_then(|mut session| session.handle.take());
        if let Some(mut handle) = leftover {
            handle.close();
        }
        inner.state = DictationState::Offline;
        self.shared
            .status
            .publish(DictationState::Offline, "Stopped");
        Ok(())
    }

    /// Applies a new configuration.
    ///
    /// A listening session is fully stopped first; dictation does not
    /// resume on its own. The cached engine is unloaded only when
    /// model-relevant fields changed, and the text sink is rebuilt only
    /// when its id changed.
    ///
    /// # Errors
    /// Returns [`crate::config::ConfigError`] if the new config is
    /// invalid; the current config stays untouched in that case.
    pub fn reload_config(&self, new: Config) -> Result<()> {
        new.validate()?;
        let _ops = self.lock_ops();
        info!("reloading configuration");

        let (handle, session_wait) = {
            let mut inner = self.shared.lock_state();
            let handle = self.shared.begin_stop(&mut inner);
            let session_wait = inner
                .session
                .as_mut()
                .map(|s| (s.done_rx.take(), s.worker.take()));
            (handle, session_wait)
        };
        if let Some(mut handle) = handle {
            handle.close();
        }
        if let Some((done_rx, worker)) = session_wait {
            wait_for_worker("draining", done_rx, worker);
        }

        let mut inner = self.shared.lock_state();

        // Diff the snapshots before mutating anything behind the guard
        let model_changed = inner.config.model.path != new.model.path
            || inner.config.model.threads != new.model.threads
            || inner.config.model.use_gpu != new.model.use_gpu;
        let sink_changed = inner.config.general.text_inserter != new.general.text_inserter;

        if model_changed && inner.engine.is_some() {
            info!("model configuration changed, unloading engine");
            inner.engine = None;
        }

        if sink_changed {
            info!(inserter = %new.general.text_inserter, "re-acquiring text sink");
            inner.sink = Arc::from(build_sink(&new.general.text_inserter)?);
        }

        inner.config = new;
        if inner.running {
            inner.state = DictationState::Idle;
            self.shared
                .status
                .publish(DictationState::Idle, "Config reloaded");
        }
        Ok(())
    }

    fn lock_ops(&self) -> MutexGuard<'_, ()> {
        self.ops.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_insertion(&self) -> MutexGuard<'_, Option<InsertionWorker>> {
        self.insertion.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for DictationService {
    fn drop(&mut self) {
        if self.state() != DictationState::Offline {
            let _ = self.stop();
        }
    }
}

fn wait_for_worker(name: &str, done_rx: Option<Receiver<()>>, worker: Option<JoinHandle<()>>) {
    let finished = match done_rx {
        Some(done_rx) => done_rx.recv_timeout(JOIN_GRACE).is_ok(),
        None => true,
    };
    if finished {
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    } else {
        warn!("{name} worker did not finish in time, detaching");
    }
}

/// Everything the draining worker owns for one session
struct WorkerCtx {
    blocks: HeapCons<AudioBlock>,
    stop: Arc<AtomicBool>,
    clock: Arc<SpeechClock>,
    engine: Arc<dyn SpeechToText>,
    options: TranscribeOptions,
    sample_rate: u32,
    silence_timeout: Duration,
    text_tx: Sender<String>,
    status: StatusBus,
    shared: Arc<Shared>,
}

/// One session's draining loop: consume blocks in capture order, flush per
/// policy, watch for silence timeout, and complete the session when the
/// stop flag is observed and the buffer is empty.
fn run_draining_worker(mut ctx: WorkerCtx) {
    debug!("draining worker started");
    let mut buffer = TranscriptionBuffer::new(ctx.sample_rate);

    loop {
        if let Some(block) = ctx.blocks.try_pop() {
            buffer.append(block);
            if buffer.should_flush(ctx.stop.load(Ordering::Acquire)) {
                flush(&mut ctx, &mut buffer);
            }
            continue;
        }

        if ctx.stop.load(Ordering::Acquire) {
            // Capture is closed and the ring is drained; one final flush
            // if the residue clears the minimum, otherwise discard it
            if buffer.should_flush(true) {
                flush(&mut ctx, &mut buffer);
            } else if !buffer.is_empty() {
                debug!(
                    buffered_ms = buffer.duration().as_millis(),
                    "discarding residue below stop threshold"
                );
            }
            break;
        }

        if ctx.silence_timeout > Duration::ZERO
            && ctx.clock.time_since_last_speech() > ctx.silence_timeout
        {
            info!(
                timeout_s = ctx.silence_timeout.as_secs_f64(),
                "silence timeout reached, stopping session"
            );
            ctx.shared.request_stop();
            continue;
        }

        std::thread::sleep(POLL_INTERVAL);
    }

    debug!("draining worker finished");
    ctx.shared.finish_session();
}

/// Hands the buffer to the engine; non-empty text becomes one segment and
/// counts as heard speech for the silence clock
fn flush(ctx: &mut WorkerCtx, buffer: &mut TranscriptionBuffer) {
    ctx.status
        .publish(DictationState::Processing, "Transcribing...");
    let samples = buffer.take();

    match ctx.engine.transcribe(&samples, &ctx.options) {
        Ok(text) => {
            if !text.trim().is_empty() {
                // Text coming back counts as speech, so a slow inference
                // does not immediately trip the silence timeout
                ctx.clock.record_speech();
                // Whisper tends to prefix a space; keep trailing spacing
                let _ = ctx.text_tx.send(text.trim_start().to_owned());
            }
        }
        Err(e) => {
            error!("transcription failed: {e}");
            ctx.status
                .publish(DictationState::Error, format!("Transcription failed: {e}"));
        }
    }

    if !ctx.stop.load(Ordering::Acquire) {
        ctx.status
            .publish(DictationState::Listening, "Listening...");
    }
}

/// Process-lifetime loop delivering segments to the text sink in FIFO
/// order; sink failures are reported and skipped, never fatal
fn run_insertion_worker(shared: &Arc<Shared>, text_rx: &Receiver<String>) {
    debug!("insertion worker started");
    loop {
        match text_rx.recv_timeout(TEXT_POLL_INTERVAL) {
            Ok(text) => {
                let sink = Arc::clone(&shared.lock_state().sink);
                if let Err(e) = insert_text_safe(sink.as_ref(), &text) {
                    shared
                        .status
                        .publish(DictationState::Error, format!("Text insert failed: {e}"));
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if !shared.lock_state().running {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("insertion worker finished");
}
