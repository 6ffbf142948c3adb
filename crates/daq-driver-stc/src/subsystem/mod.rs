//! Per-board subsystems of the DAQ-STC.
//!
//! Each subsystem owns its registers and interrupt sources. Shared resources
//! (PFI pins, the DMA channels, the interrupt table) are passed in by the
//! [`crate::board::Board`] that owns them.

pub mod ai;
pub mod ao;
pub mod dio;
pub mod gpct;
pub mod msc;

pub use ai::{Acquisition, AcquisitionState, AiSetup};
pub use ao::{AnalogOutput, AoSetup, OutputState};
pub use dio::Dio;
pub use gpct::{CounterPhase, CountingSetup, Gpct, PulseSetup};
pub use msc::{FoutTimebase, Msc};
