//! Application configuration using Figment.
//!
//! Sources, later ones overriding earlier ones:
//! 1. `config/stc_daq.toml` (or the path given with `--config`)
//! 2. Environment variables prefixed with `STC_DAQ_`, with `__` separating
//!    nested keys (e.g. `STC_DAQ_APPLICATION__LOG_LEVEL=debug`,
//!    `STC_DAQ_DRIVER__COUNTER_READ__MAX_SAVE_READS=4`)
//!
//! A missing file is not an error; every field has a default.
//!
//! ```no_run
//! use stc_daq::config::AppConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load()?;
//! config.validate()?;
//! println!("{} boards", config.driver.boards.len());
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use daq_driver_stc::DriverConfig;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/stc_daq.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "STC_DAQ_";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: [&str; 3] = ["pretty", "compact", "json"];

/// Complete application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Front-end settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Driver core settings, passed straight to [`daq_driver_stc::Driver`]
    #[serde(default)]
    pub driver: DriverConfig,
}

/// Front-end settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Name used in the startup banner
    #[serde(default = "default_name")]
    pub name: String,
    /// Default log level (trace, debug, info, warn, error); `RUST_LOG` wins
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_name() -> String {
    "stc-daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl AppConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific TOML file and the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Self::figment(path.as_ref())
            .extract()
            .map_err(AppError::from)
    }

    fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Check constraints that deserialisation cannot express.
    pub fn validate(&self) -> AppResult<()> {
        let level = self.application.log_level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(AppError::Validation(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.application.log_level,
                LOG_LEVELS.join(", ")
            )));
        }

        let format = self.application.log_format.to_lowercase();
        if !LOG_FORMATS.contains(&format.as_str()) {
            return Err(AppError::Validation(format!(
                "Invalid log format '{}'. Must be one of: {}",
                self.application.log_format,
                LOG_FORMATS.join(", ")
            )));
        }

        self.driver
            .validate()
            .map_err(|err| AppError::Validation(err.to_string()))
    }
}
