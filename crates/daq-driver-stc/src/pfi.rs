//! PFI pin ownership arbitration.
//!
//! The ten PFI lines are shared by every subsystem on a board. A pin claimed
//! by one subsystem cannot be reconfigured by another until it is released.
//! A conflict is a configuration error on the caller's side and is never
//! retried.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{Result, StcError};
use crate::registers::{Register, RegisterFile};
use crate::signals::{InputSignal, PFI_COUNT};

/// Subsystems that can own shared board resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subsystem {
    /// Miscellaneous: clocks, triggers, PFI
    Msc,
    /// Analog input
    Ai,
    /// Analog output
    Ao,
    /// General-purpose counter G0
    Gpct0,
    /// General-purpose counter G1
    Gpct1,
    /// Static digital I/O
    Dio,
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Msc => "MSC",
            Self::Ai => "AI",
            Self::Ao => "AO",
            Self::Gpct0 => "GPCT0",
            Self::Gpct1 => "GPCT1",
            Self::Dio => "DIO",
        };
        f.write_str(name)
    }
}

/// Logical state of a PFI pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PinState {
    /// Free
    #[default]
    Unused,
    /// Claimed as an input
    Input,
    /// Claimed and driven as an output
    Output,
}

/// Which pins a setup request refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinSelect {
    /// Every pin owned by the requesting subsystem (release only)
    All,
    /// The pin carrying this signal; non-PFI signals are accepted as no-ops
    Line(InputSignal),
}

impl From<InputSignal> for PinSelect {
    fn from(signal: InputSignal) -> Self {
        Self::Line(signal)
    }
}

/// Ownership record of one pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PinEntry {
    /// Owning subsystem, if claimed
    pub owner: Option<Subsystem>,
    /// Logical state
    pub state: PinState,
}

/// Per-board PFI ownership table.
#[derive(Debug)]
pub struct PfiTable {
    regs: Arc<RegisterFile>,
    pins: [PinEntry; PFI_COUNT as usize],
}

impl PfiTable {
    /// Create a table with every pin unused.
    pub fn new(regs: Arc<RegisterFile>) -> Self {
        Self {
            regs,
            pins: [PinEntry::default(); PFI_COUNT as usize],
        }
    }

    /// Check whether a setup request would succeed, without changing anything.
    pub fn check(&self, subsystem: Subsystem, select: PinSelect, state: PinState) -> Result<()> {
        match select {
            PinSelect::All => {
                if state != PinState::Unused {
                    return Err(StcError::invalid(
                        "only release (unused) may be applied to all pins",
                    ));
                }
                Ok(())
            }
            PinSelect::Line(signal) => {
                let Some(pin) = signal.pfi_pin() else {
                    return Ok(());
                };
                match self.pins[pin as usize].owner {
                    Some(owner) if owner != subsystem && state != PinState::Unused => {
                        Err(StcError::PinConflict {
                            pin,
                            owner,
                            requester: subsystem,
                        })
                    }
                    _ => Ok(()),
                }
            }
        }
    }

    /// Claim, reconfigure or release pins for `subsystem`.
    pub fn setup(&mut self, subsystem: Subsystem, select: PinSelect, state: PinState) -> Result<()> {
        if let Err(err) = self.check(subsystem, select, state) {
            warn!(subsystem = %subsystem, error = %err, "PFI setup rejected");
            return Err(err);
        }

        match select {
            PinSelect::All => {
                for (pin, entry) in self.pins.iter_mut().enumerate() {
                    if entry.owner == Some(subsystem) {
                        debug!(pin, subsystem = %subsystem, "PFI released");
                        *entry = PinEntry::default();
                    }
                }
            }
            PinSelect::Line(signal) => {
                let Some(pin) = signal.pfi_pin() else {
                    return Ok(());
                };
                let entry = &mut self.pins[pin as usize];
                *entry = match state {
                    PinState::Unused => PinEntry::default(),
                    _ => PinEntry {
                        owner: Some(subsystem),
                        state,
                    },
                };
                debug!(pin, subsystem = %subsystem, state = ?state, "PFI configured");
            }
        }

        self.sync_directions();
        Ok(())
    }

    /// Release every pin regardless of owner.
    pub fn release_all(&mut self) {
        self.pins = [PinEntry::default(); PFI_COUNT as usize];
        self.sync_directions();
    }

    /// Ownership record of one pin.
    pub fn entry(&self, pin: u8) -> Option<PinEntry> {
        self.pins.get(pin as usize).copied()
    }

    /// Pins currently owned by `subsystem`.
    pub fn owned_by(&self, subsystem: Subsystem) -> Vec<u8> {
        self.pins
            .iter()
            .enumerate()
            .filter(|(_, e)| e.owner == Some(subsystem))
            .map(|(pin, _)| pin as u8)
            .collect()
    }

    /// Bitmask of pins configured as outputs.
    pub fn output_mask(&self) -> u32 {
        self.pins
            .iter()
            .enumerate()
            .filter(|(_, e)| e.state == PinState::Output)
            .fold(0, |mask, (pin, _)| mask | (1 << pin))
    }

    fn sync_directions(&self) {
        self.regs.write(Register::IoBidirectionPin, self.output_mask());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedBus;

    fn table() -> PfiTable {
        PfiTable::new(Arc::new(RegisterFile::new(Arc::new(SimulatedBus::new()))))
    }

    #[test]
    fn test_conflicting_claim_is_rejected_until_release() {
        let mut pfi = table();
        let pin = InputSignal::Pfi(3);
        pfi.setup(Subsystem::Gpct0, pin.into(), PinState::Input).unwrap();

        let err = pfi
            .setup(Subsystem::Ai, pin.into(), PinState::Output)
            .unwrap_err();
        assert_eq!(
            err,
            StcError::PinConflict {
                pin: 3,
                owner: Subsystem::Gpct0,
                requester: Subsystem::Ai
            }
        );

        pfi.setup(Subsystem::Gpct0, PinSelect::All, PinState::Unused)
            .unwrap();
        pfi.setup(Subsystem::Ai, pin.into(), PinState::Output).unwrap();
        assert_eq!(pfi.entry(3).unwrap().owner, Some(Subsystem::Ai));
    }

    #[test]
    fn test_bulk_claim_is_illegal() {
        let mut pfi = table();
        assert!(pfi
            .setup(Subsystem::Ai, PinSelect::All, PinState::Input)
            .is_err());
        assert!(pfi
            .setup(Subsystem::Ai, PinSelect::All, PinState::Output)
            .is_err());
    }

    #[test]
    fn test_non_pfi_lines_are_no_ops() {
        let mut pfi = table();
        pfi.setup(Subsystem::Gpct1, InputSignal::Rtsi(2).into(), PinState::Output)
            .unwrap();
        pfi.setup(Subsystem::Gpct1, InputSignal::Timebase1.into(), PinState::Input)
            .unwrap();
        assert!(pfi.owned_by(Subsystem::Gpct1).is_empty());
    }

    #[test]
    fn test_direction_register_reflects_outputs() {
        let mut pfi = table();
        pfi.setup(Subsystem::Gpct0, InputSignal::Pfi(1).into(), PinState::Output)
            .unwrap();
        pfi.setup(Subsystem::Ai, InputSignal::Pfi(4).into(), PinState::Input)
            .unwrap();
        pfi.setup(Subsystem::Ao, InputSignal::Pfi(6).into(), PinState::Output)
            .unwrap();
        assert_eq!(pfi.output_mask(), (1 << 1) | (1 << 6));
        assert_eq!(
            pfi.regs.mirrored(Register::IoBidirectionPin),
            (1 << 1) | (1 << 6)
        );

        pfi.setup(Subsystem::Ao, PinSelect::All, PinState::Unused)
            .unwrap();
        assert_eq!(pfi.regs.mirrored(Register::IoBidirectionPin), 1 << 1);
    }

    #[test]
    fn test_owner_may_reconfigure_its_own_pin() {
        let mut pfi = table();
        let pin = InputSignal::Pfi(0);
        pfi.setup(Subsystem::Dio, pin.into(), PinState::Input).unwrap();
        pfi.setup(Subsystem::Dio, pin.into(), PinState::Output).unwrap();
        assert_eq!(pfi.entry(0).unwrap().state, PinState::Output);
    }
}
