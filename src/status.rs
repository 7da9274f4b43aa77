use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};

/// Pipeline state as reported to external observers (tray/GUI)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DictationState {
    /// Service not started or shut down
    Offline,
    /// Service running, no active session
    Idle,
    /// Session active, capturing audio
    Listening,
    /// Transcribing buffered audio or finishing a stopped session
    Processing,
    /// A failure occurred; cleared by the next toggle
    Error,
}

impl fmt::Display for DictationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Offline => "offline",
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// One `(state, message)` notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub state: DictationState,
    pub message: String,
}

/// Append-only notification stream for external observers.
///
/// Backed by an unbounded channel so `publish` never blocks the pipeline.
/// Events are observed in emission order; a missing observer just means
/// events accumulate until the receiver is dropped, at which point
/// publishes become no-ops.
#[derive(Clone)]
pub struct StatusBus {
    tx: Sender<StatusEvent>,
}

impl StatusBus {
    /// Creates a bus and the receiving end for one observer
    #[must_use]
    pub fn channel() -> (Self, Receiver<StatusEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }

    /// Publishes one event, never blocking the caller
    pub fn publish(&self, state: DictationState, message: impl Into<String>) {
        let event = StatusEvent {
            state,
            message: message.into(),
        };
        tracing::debug!(state = %event.state, message = %event.message, "status");
        // Send only fails when the observer is gone; nothing to do then.
        let _ = self.tx.send(event);
    }
}
