use std::process::Command;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::ConfigError;

/// Text insertion errors
#[derive(Debug, Error)]
pub enum InsertionError {
    /// Text is empty
    #[error("text is empty")]
    EmptyText,

    /// The typing tool could not be spawned (missing binary, permissions)
    #[error("failed to run {tool}: {source}")]
    ToolSpawn {
        /// Tool binary name
        tool: &'static str,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// The typing tool exited with a failure status
    #[error("{tool} exited with {status}")]
    ToolFailed {
        /// Tool binary name
        tool: &'static str,
        /// Exit status description
        status: String,
    },
}

/// Injects recognized text into the active input target.
///
/// A sink failure is never fatal to the pipeline: the insertion worker
/// reports it as a status event and moves on to the next segment.
pub trait TextSink: Send + Sync {
    /// Types `text` at the current cursor position
    ///
    /// # Errors
    /// Returns [`InsertionError`] if the text is empty or the underlying
    /// tool fails.
    fn insert(&self, text: &str) -> Result<(), InsertionError>;
}

impl std::fmt::Debug for dyn TextSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn TextSink")
    }
}

/// Builds the sink named by the config's `text_inserter` id
///
/// # Errors
/// Returns [`ConfigError::UnknownInserter`] for an unrecognized id.
pub fn build_sink(id: &str) -> Result<Box<dyn TextSink>, ConfigError> {
    match id {
        "ydotool" => Ok(Box::new(YdotoolSink)),
        "wtype" => Ok(Box::new(WtypeSink)),
        other => Err(ConfigError::UnknownInserter(other.to_owned())),
    }
}

/// Runs a typing tool and maps its outcome to `InsertionError`
fn run_tool(tool: &'static str, args: &[&str]) -> Result<(), InsertionError> {
    let status = Command::new(tool)
        .args(args)
        .status()
        .map_err(|source| InsertionError::ToolSpawn { tool, source })?;

    if status.success() {
        Ok(())
    } else {
        Err(InsertionError::ToolFailed {
            tool,
            status: status.to_string(),
        })
    }
}

/// Types text through the `ydotool` daemon (works on X11 and Wayland)
pub struct YdotoolSink;

impl TextSink for YdotoolSink {
    fn insert(&self, text: &str) -> Result<(), InsertionError> {
        if text.is_empty() {
            return Err(InsertionError::EmptyText);
        }
        info!(
            text_len = text.len(),
            text_preview = %text_preview(text),
            "inserting text via ydotool"
        );
        run_tool("ydotool", &["type", "--", text])
    }
}

/// Types text through `wtype` (Wayland virtual keyboard)
pub struct WtypeSink;

impl TextSink for WtypeSink {
    fn insert(&self, text: &str) -> Result<(), InsertionError> {
        if text.is_empty() {
            return Err(InsertionError::EmptyText);
        }
        info!(
            text_len = text.len(),
            text_preview = %text_preview(text),
            "inserting text via wtype"
        );
        run_tool("wtype", &["--", text])
    }
}

/// Generate preview of text for logging (pure, testable)
///
/// Truncates text >50 chars with "..." suffix. Respects UTF-8 char boundaries.
#[must_use]
pub fn text_preview(text: &str) -> String {
    if text.len() > 50 {
        let mut end = 47.min(text.len());
        while end > 0 && !text.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            return "...".to_owned();
        }
        format!("{}...", &text[..end])
    } else {
        text.to_owned()
    }
}

/// Attempts insertion, logging errors without propagating them
pub fn insert_text_safe(sink: &dyn TextSink, text: &str) -> Result<(), InsertionError> {
    debug!(text_len = text.len(), "handing segment to sink");
    sink.insert(text).inspect_err(|e| {
        error!(error = %e, text_len = text.len(), "text insertion failed");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_preview_short() {
        assert_eq!(text_preview("hello"), "hello");
        assert_eq!(text_preview(""), "");
    }

    #[test]
    fn test_text_preview_exactly_50_chars() {
        let text_50 = "a".repeat(50);
        assert_eq!(text_preview(&text_50), text_50);
    }

    #[test]
    fn test_text_preview_long() {
        let text_100 = "a".repeat(100);
        let preview = text_preview(&text_100);
        assert!(preview.len() <= 50);
        assert!(preview.ends_with("..."));
        assert!(preview.starts_with(&text_100[..preview.len() - 3]));
    }

    #[test]
    fn test_text_preview_unicode_boundary() {
        let long_unicode = "👋".repeat(30);
        let preview = text_preview(&long_unicode);
        assert!(preview.ends_with("..."));
        assert!(preview.len() < long_unicode.len());
    }

    #[test]
    fn test_build_sink_known_ids() {
        assert!(build_sink("ydotool").is_ok());
        assert!(build_sink("wtype").is_ok());
    }

    #[test]
    fn test_build_sink_unknown_id() {
        let err = build_sink("xdotool").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownInserter(_)));
    }

    #[test]
    fn test_empty_text_rejected() {
        let result = YdotoolSink.insert("");
        assert!(matches!(result, Err(InsertionError::EmptyText)));
        let result = WtypeSink.insert("");
        assert!(matches!(result, Err(InsertionError::EmptyText)));
    }

    #[test]
    fn test_missing_tool_is_spawn_error() {
        let result = run_tool("no-such-typing-tool-9f2a", &["hello"]);
        assert!(matches!(result, Err(InsertionError::ToolSpawn { .. })));
    }

    #[test]
    fn test_insert_text_safe_surfaces_error() {
        struct FailingSink;
        impl TextSink for FailingSink {
            fn insert(&self, _text: &str) -> Result<(), InsertionError> {
                Err(InsertionError::ToolFailed {
                    tool: "ydotool",
                    status: "exit status: 1".to_owned(),
                })
            }
        }
        assert!(insert_text_safe(&FailingSink, "hello").is_err());
    }

    #[test]
    #[ignore = "requires ydotool and a focused text input"]
    fn test_ydotool_insert() {
        assert!(YdotoolSink.insert("hello from whisper-dictate").is_ok());
    }
}
