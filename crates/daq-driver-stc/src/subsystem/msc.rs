//! Miscellaneous subsystem: frequency output, analog trigger levels and the
//! board-wide PFI reset.

use std::sync::Arc;

use tracing::debug;

use crate::error::{Result, StcError};
use crate::pfi::PfiTable;
use crate::registers::bits::clock_and_fout;
use crate::registers::{Register, RegisterFile};

/// Timebase feeding the FOUT divider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoutTimebase {
    /// 20 MHz
    Fast,
    /// 100 kHz
    Slow,
}

impl FoutTimebase {
    /// Timebase frequency in Hz.
    pub fn hz(self) -> u32 {
        match self {
            Self::Fast => 20_000_000,
            Self::Slow => 100_000,
        }
    }
}

/// Largest FOUT divider.
pub const MAX_FOUT_DIVIDER: u8 = 16;

/// MSC subsystem of one board.
#[derive(Debug)]
pub struct Msc {
    regs: Arc<RegisterFile>,
}

impl Msc {
    /// Create the subsystem; call [`Msc::reset_all`] before use.
    pub fn new(regs: Arc<RegisterFile>) -> Self {
        Self { regs }
    }

    /// Program the FOUT pin to emit `timebase / divider`.
    ///
    /// Returns the resulting frequency in Hz (0 when disabled).
    pub fn set_clock_output(
        &self,
        timebase: FoutTimebase,
        divider: u8,
        enable: bool,
    ) -> Result<u32> {
        if !(1..=MAX_FOUT_DIVIDER).contains(&divider) {
            return Err(StcError::invalid(format!(
                "FOUT divider {divider} outside 1..={MAX_FOUT_DIVIDER}"
            )));
        }

        // A divider field of 0 divides by 16
        let mut value = u32::from(divider) & clock_and_fout::FOUT_DIVIDER_MASK;
        if timebase == FoutTimebase::Slow {
            value |= clock_and_fout::FOUT_TIMEBASE_SELECT;
        }
        if enable {
            value |= clock_and_fout::FOUT_ENABLE;
        }
        let mask = clock_and_fout::FOUT_DIVIDER_MASK
            | clock_and_fout::FOUT_TIMEBASE_SELECT
            | clock_and_fout::FOUT_ENABLE;
        self.regs.update(Register::ClockAndFout, mask, value);

        let hz = if enable {
            timebase.hz() / u32::from(divider)
        } else {
            0
        };
        debug!(timebase = ?timebase, divider, enable, hz, "FOUT programmed");
        Ok(hz)
    }

    /// Set the analog trigger window.
    pub fn set_trigger_levels(&self, high: u8, low: u8) -> Result<()> {
        if low > high {
            return Err(StcError::invalid(format!(
                "trigger low level {low} above high level {high}"
            )));
        }
        self.regs.write(
            Register::TriggerLevels,
            (u32::from(high) << 8) | u32::from(low),
        );
        debug!(high, low, "analog trigger levels set");
        Ok(())
    }

    /// FOUT off, trigger levels zero, every PFI pin released.
    pub fn reset_all(&self, pfi: &mut PfiTable) {
        self.regs.clear_bits(
            Register::ClockAndFout,
            clock_and_fout::FOUT_ENABLE
                | clock_and_fout::FOUT_TIMEBASE_SELECT
                | clock_and_fout::FOUT_DIVIDER_MASK,
        );
        self.regs.write(Register::TriggerLevels, 0);
        pfi.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pfi::{PinState, Subsystem};
    use crate::sim::SimulatedBus;
    use crate::signals::InputSignal;

    fn msc() -> (Arc<RegisterFile>, Msc) {
        let regs = Arc::new(RegisterFile::new(Arc::new(SimulatedBus::new())));
        (regs.clone(), Msc::new(regs))
    }

    #[test]
    fn test_clock_output() {
        let (regs, msc) = msc();
        assert_eq!(msc.set_clock_output(FoutTimebase::Slow, 4, true).unwrap(), 25_000);
        let value = regs.mirrored(Register::ClockAndFout);
        assert_eq!(value & clock_and_fout::FOUT_DIVIDER_MASK, 4);
        assert_ne!(value & clock_and_fout::FOUT_ENABLE, 0);

        assert_eq!(msc.set_clock_output(FoutTimebase::Fast, 16, false).unwrap(), 0);
        assert_eq!(
            regs.mirrored(Register::ClockAndFout) & clock_and_fout::FOUT_DIVIDER_MASK,
            0
        );
    }

    #[test]
    fn test_bad_divider_leaves_register() {
        let (regs, msc) = msc();
        assert!(msc.set_clock_output(FoutTimebase::Fast, 0, true).is_err());
        assert!(msc.set_clock_output(FoutTimebase::Fast, 17, true).is_err());
        assert!(!regs.mirror().contains(Register::ClockAndFout));
    }

    #[test]
    fn test_trigger_levels() {
        let (regs, msc) = msc();
        msc.set_trigger_levels(200, 50).unwrap();
        assert_eq!(regs.mirrored(Register::TriggerLevels), (200 << 8) | 50);
        assert!(msc.set_trigger_levels(10, 11).is_err());
    }

    #[test]
    fn test_reset_releases_all_pins() {
        let (regs, msc) = msc();
        let mut pfi = PfiTable::new(regs.clone());
        pfi.setup(Subsystem::Ao, InputSignal::Pfi(5).into(), PinState::Output)
            .unwrap();
        msc.set_clock_output(FoutTimebase::Fast, 2, true).unwrap();
        msc.reset_all(&mut pfi);
        assert!(pfi.owned_by(Subsystem::Ao).is_empty());
        assert_eq!(regs.mirrored(Register::IoBidirectionPin), 0);
        assert_eq!(regs.mirrored(Register::ClockAndFout), 0);
    }
}
