//! Userspace port of the National Instruments DAQ-STC driver core.
//!
//! The DAQ-STC ("System Timing Controller") is the ASIC behind the E-series
//! data acquisition boards. This crate implements the parts of the driver
//! that carry real protocol state:
//!
//! - [`pfi`]: ownership arbitration of the shared PFI trigger pins
//! - [`irq`]: the 16-slot interrupt enable/acknowledge/dispatch table
//! - [`subsystem::gpct`]: the two general-purpose counters
//! - [`subsystem::ai`] / [`subsystem::ao`]: buffered acquisition and output
//! - [`fops`]: the character-device protocol (open/read/write/poll/ioctl)
//!
//! Register access goes through the [`registers::RegisterBus`] trait; the
//! [`sim`] module provides a simulated board for tests and demos.
//!
//! # Example
//!
//! ```no_run
//! use daq_driver_stc::config::DriverConfig;
//! use daq_driver_stc::driver::Driver;
//! use daq_driver_stc::fops::OpenFlags;
//! use daq_driver_stc::ioctl::{Command, GpctArg, IoctlArg};
//! use daq_driver_stc::signals::InputSignal;
//! use daq_driver_stc::wait::SignalToken;
//!
//! # fn main() -> daq_driver_stc::Result<()> {
//! let (driver, _buses) = Driver::simulated(DriverConfig::default())?;
//! let file = driver.open(0, OpenFlags::nonblocking(), &SignalToken::new())?;
//!
//! let mut arg = IoctlArg::Gpct(GpctArg {
//!     counter: 0,
//!     source: InputSignal::Pfi(0).code(),
//!     gate: GpctArg::NO_GATE,
//!     ..Default::default()
//! });
//! file.ioctl(Command::GpctStartCounting.code(), &mut arg)?;
//! # Ok(())
//! # }
//! ```

pub mod board;
pub mod config;
pub mod dma;
pub mod driver;
pub mod error;
pub mod fops;
pub mod ioctl;
pub mod irq;
pub mod pfi;
pub mod registers;
pub mod signals;
pub mod sim;
pub mod subsystem;
pub mod wait;

pub use board::Board;
pub use config::DriverConfig;
pub use driver::Driver;
pub use error::{Result, StcError};
pub use fops::{DeviceFile, OpenFlags, PollMask};
pub use registers::CounterId;
pub use signals::InputSignal;
