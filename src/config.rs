use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

/// Invalid configuration field, surfaced to `reload_config` callers.
///
/// A config that fails validation is rejected wholesale; the running
/// service keeps its previous snapshot.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A numeric field is out of its valid range
    #[error("invalid value for {field}: {reason}")]
    InvalidField {
        /// Field name in `section.key` form
        field: &'static str,
        /// Why the value was rejected
        reason: String,
    },

    /// The text inserter id does not name a known sink
    #[error("unknown text inserter: {0} (expected \"ydotool\" or \"wtype\")")]
    UnknownInserter(String),
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Config {
    pub general: GeneralConfig,
    pub model: ModelConfig,
    pub whisper: WhisperConfig,
    pub audio: AudioConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct GeneralConfig {
    /// Seconds of continuous silence after which a session auto-stops (0 disables)
    pub silence_timeout: f64,
    /// Text sink id: "ydotool" or "wtype"
    pub text_inserter: String,
}

/// Fields that identify the loaded Whisper model. A reload that changes
/// any of these unloads the cached engine, forcing a lazy reload on the
/// next toggle.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ModelConfig {
    pub path: String,
    pub threads: usize,
    pub use_gpu: bool,
    /// Load the model at service start instead of on first toggle
    pub preload: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct WhisperConfig {
    /// Language code, or "auto" for autodetection
    pub language: String,
    pub beam_size: usize,
    pub use_vad_filter: bool,
    pub initial_prompt: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct AudioConfig {
    pub sample_rate: u32,
    /// Samples per capture block
    pub block_size: usize,
    /// Input device name, empty for the system default
    pub device: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub log_path: String,
}

impl Config {
    /// Load config from ~/.whisper-dictate.toml, creating a default on first run
    ///
    /// # Errors
    /// Returns error if the file cannot be read/written, fails to parse, or
    /// fails validation.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            Self::create_default(&config_path).context("failed to create default config")?;
        }

        let contents = fs::read_to_string(&config_path).context("failed to read config file")?;

        let config: Config = toml::from_str(&contents).context("failed to parse config TOML")?;
        config.validate()?;

        Ok(config)
    }

    /// Validates field ranges and the sink id
    ///
    /// # Errors
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.audio.sample_rate == 0 {
            return Err(ConfigError::InvalidField {
                field: "audio.sample_rate",
                reason: "must be > 0".to_owned(),
            });
        }
        if self.audio.block_size == 0 {
            return Err(ConfigError::InvalidField {
                field: "audio.block_size",
                reason: "must be > 0".to_owned(),
            });
        }
        if self.whisper.beam_size == 0 {
            return Err(ConfigError::InvalidField {
                field: "whisper.beam_size",
                reason: "must be > 0".to_owned(),
            });
        }
        if self.model.threads == 0 {
            return Err(ConfigError::InvalidField {
                field: "model.threads",
                reason: "must be > 0".to_owned(),
            });
        }
        if !self.general.silence_timeout.is_finite() || self.general.silence_timeout < 0.0 {
            return Err(ConfigError::InvalidField {
                field: "general.silence_timeout",
                reason: "must be >= 0".to_owned(),
            });
        }
        match self.general.text_inserter.as_str() {
            "ydotool" | "wtype" => Ok(()),
            other => Err(ConfigError::UnknownInserter(other.to_owned())),
        }
    }

    /// Language option for transcription: `None` means autodetect
    #[must_use]
    pub fn language_option(&self) -> Option<String> {
        if self.whisper.language == "auto" || self.whisper.language.is_empty() {
            None
        } else {
            Some(self.whisper.language.clone())
        }
    }

    fn config_path() -> Result<PathBuf> {
        let home = std::env::var("HOME").context("HOME environment variable not set")?;
        Ok(PathBuf::from(home).join(".whisper-dictate.toml"))
    }

    fn create_default(path: &PathBuf) -> Result<()> {
        let default_config = r#"[general]
silence_timeout = 6.0
text_inserter = "ydotool"

[model]
path = "~/.whisper-dictate/models/ggml-small.bin"
threads = 4
use_gpu = false
preload = false

[whisper]
language = "auto"
beam_size = 5
use_vad_filter = true
initial_prompt = ""

[audio]
sample_rate = 16000
block_size = 8000
device = ""

[telemetry]
enabled = false
log_path = "~/.whisper-dictate/dictate.log"
"#;
        fs::write(path, default_config).context("failed to write default config")?;
        Ok(())
    }

    /// Expand ~ in paths to home directory
    ///
    /// # Errors
    /// Returns error if HOME is unset and the path starts with `~/`.
    pub fn expand_path(path: &str) -> Result<PathBuf> {
        if let Some(stripped) = path.strip_prefix("~/") {
            let home = std::env::var("HOME").context("HOME environment variable not set")?;
            Ok(PathBuf::from(home).join(stripped))
        } else {
            Ok(PathBuf::from(path))
        }
    }
}

#[cfg(test)]
#[allow(clippy::float_cmp)] // Test assertions with known exact values
mod tests {
    use super::*;

    fn sample_config() -> Config {
        toml::from_str(
            r#"
            [general]
            silence_timeout = 4.0
            text_inserter = "ydotool"

            [model]
            path = "/tmp/model.bin"
            threads = 4
            use_gpu = false
            preload = false

            [whisper]
            language = "en"
            beam_size = 5
            use_vad_filter = true
            initial_prompt = ""

            [audio]
            sample_rate = 16000
            block_size = 8000
            device = ""

            [telemetry]
            enabled = false
            log_path = "/tmp/dictate.log"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_parse_and_validate() {
        let config = sample_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.general.silence_timeout, 4.0);
        assert_eq!(config.audio.block_size, 8000);
        assert_eq!(config.language_option(), Some("en".to_owned()));
    }

    #[test]
    fn test_language_auto_is_none() {
        let mut config = sample_config();
        config.whisper.language = "auto".to_owned();
        assert_eq!(config.language_option(), None);

        config.whisper.language = String::new();
        assert_eq!(config.language_option(), None);
    }

    #[test]
    fn test_validate_zero_sample_rate() {
        let mut config = sample_config();
        config.audio.sample_rate = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidField {
                field: "audio.sample_rate",
                ..
            }
        ));
    }

    #[test]
    fn test_validate_zero_block_size() {
        let mut config = sample_config();
        config.audio.block_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_negative_timeout() {
        let mut config = sample_config();
        config.general.silence_timeout = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_timeout_allowed() {
        // 0 disables the silence timeout, it is not an error
        let mut config = sample_config();
        config.general.silence_timeout = 0.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_unknown_inserter() {
        let mut config = sample_config();
        config.general.text_inserter = "pynput".to_owned();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownInserter(_)));
        assert!(err.to_string().contains("pynput"));
    }

    #[test]
    fn test_expand_path_with_tilde() {
        let home = std::env::var("HOME").expect("HOME not set");
        let result = Config::expand_path("~/models/ggml-small.bin").unwrap();
        assert_eq!(result, PathBuf::from(home).join("models/ggml-small.bin"));
    }

    #[test]
    fn test_expand_path_without_tilde() {
        let result = Config::expand_path("/opt/models/ggml-small.bin").unwrap();
        assert_eq!(result, PathBuf::from("/opt/models/ggml-small.bin"));
    }
}
