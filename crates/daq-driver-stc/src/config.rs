//! Driver configuration.
//!
//! Deserialised from TOML, either standalone or as the `[driver]` table of
//! the application configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dma::MAX_BUFFER_SAMPLES;
use crate::error::{Result, StcError};

/// Top-level driver configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverConfig {
    /// One entry per board; the index is the minor device number
    #[serde(default = "default_boards")]
    pub boards: Vec<BoardSettings>,
    /// Live counter read policy
    #[serde(default)]
    pub counter_read: CounterReadPolicy,
    /// How often a blocked caller re-checks for a pending signal
    #[serde(default = "default_signal_poll_interval")]
    pub signal_poll_interval_ms: u64,
}

/// Per-board settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardSettings {
    /// Board name used in logs
    pub name: String,
    /// AI DMA buffer size in samples (rounded up to a power of two, at most
    /// [`MAX_BUFFER_SAMPLES`])
    #[serde(default = "default_ai_buffer")]
    pub ai_buffer_samples: usize,
    /// AO DMA buffer size in samples (rounded up to a power of two)
    #[serde(default = "default_ao_buffer")]
    pub ao_buffer_samples: usize,
}

/// How a free-running counter's save register is sampled.
///
/// The save register is not latched atomically with respect to the running
/// counter. Consecutive reads are taken until two agree or `max_save_reads`
/// reads have been made, in which case the last one is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterReadPolicy {
    /// Upper bound on save register reads per count query (>= 2)
    #[serde(default = "default_max_save_reads")]
    pub max_save_reads: u8,
}

fn default_boards() -> Vec<BoardSettings> {
    vec![BoardSettings::named("pci-mio-16e-1")]
}

fn default_ai_buffer() -> usize {
    16384
}

fn default_ao_buffer() -> usize {
    4096
}

fn default_max_save_reads() -> u8 {
    3
}

fn default_signal_poll_interval() -> u64 {
    10
}

impl Default for CounterReadPolicy {
    fn default() -> Self {
        Self {
            max_save_reads: default_max_save_reads(),
        }
    }
}

impl BoardSettings {
    /// Settings with default buffer sizes.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ai_buffer_samples: default_ai_buffer(),
            ao_buffer_samples: default_ao_buffer(),
        }
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            boards: default_boards(),
            counter_read: CounterReadPolicy::default(),
            signal_poll_interval_ms: default_signal_poll_interval(),
        }
    }
}

impl DriverConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(text: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Check semantic constraints that parsing cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.boards.is_empty() {
            return Err(StcError::invalid("at least one board must be configured"));
        }
        for board in &self.boards {
            if board.name.trim().is_empty() {
                return Err(StcError::invalid("board name must not be empty"));
            }
            if board.ai_buffer_samples == 0 || board.ao_buffer_samples == 0 {
                return Err(StcError::invalid(format!(
                    "board '{}': buffer sizes must be non-zero",
                    board.name
                )));
            }
            if board.ai_buffer_samples > MAX_BUFFER_SAMPLES
                || board.ao_buffer_samples > MAX_BUFFER_SAMPLES
            {
                return Err(StcError::invalid(format!(
                    "board '{}': buffer sizes must not exceed {MAX_BUFFER_SAMPLES} samples",
                    board.name
                )));
            }
        }
        if self.counter_read.max_save_reads < 2 {
            return Err(StcError::invalid(format!(
                "counter_read.max_save_reads is {}, must be at least 2",
                self.counter_read.max_save_reads
            )));
        }
        if self.signal_poll_interval_ms == 0 {
            return Err(StcError::invalid("signal_poll_interval_ms must be non-zero"));
        }
        Ok(())
    }

    /// Signal re-check interval for blocked callers.
    pub fn signal_poll_interval(&self) -> Duration {
        Duration::from_millis(self.signal_poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = DriverConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.counter_read.max_save_reads, 3);
    }

    #[test]
    fn test_parse_partial_document() {
        let config = DriverConfig::from_toml_str(
            r#"
            [[boards]]
            name = "pci-6035e"
            ai_buffer_samples = 1000

            [counter_read]
            max_save_reads = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.boards.len(), 1);
        assert_eq!(config.boards[0].ai_buffer_samples, 1000);
        assert_eq!(config.boards[0].ao_buffer_samples, 4096);
        assert_eq!(config.counter_read.max_save_reads, 4);
        assert_eq!(config.signal_poll_interval_ms, 10);
    }

    #[test]
    fn test_rejects_single_save_read() {
        let mut config = DriverConfig::default();
        config.counter_read.max_save_reads = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_oversized_buffers() {
        let mut config = DriverConfig::default();
        config.boards[0].ai_buffer_samples = MAX_BUFFER_SAMPLES;
        assert!(config.validate().is_ok());

        config.boards[0].ai_buffer_samples = usize::MAX / 2 + 2;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("must not exceed"));

        config.boards[0].ai_buffer_samples = 1024;
        config.boards[0].ao_buffer_samples = MAX_BUFFER_SAMPLES + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_no_boards() {
        let config = DriverConfig {
            boards: vec![],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
