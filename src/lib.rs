//! `stc-daq`: command-line front end for the DAQ-STC driver core.
//!
//! The driver itself lives in the `daq-driver-stc` crate. This crate adds
//! the application layer around it:
//!
//! - [`config`]: layered configuration (TOML file + `STC_DAQ_*` environment)
//! - [`logging`]: tracing subscriber setup
//! - [`scenarios`]: counting, pulse and acquisition runs on simulated boards
//! - [`error`]: application error type

pub mod config;
pub mod error;
pub mod logging;
pub mod scenarios;

pub use config::AppConfig;
pub use error::{AppError, AppResult};
