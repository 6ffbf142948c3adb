//! Register access layer and hardware mirror.
//!
//! Most DAQ-STC registers are write-only or have side effects when read, so
//! the driver keeps a [`HardwareMirror`] holding the last value written to
//! every register. [`RegisterFile`] couples the mirror with a
//! [`RegisterBus`] under a single lock: every bus write updates the mirror in
//! the same critical section, and read-modify-write sequences operate on the
//! mirrored value instead of reading the hardware back.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::error::{Result, StcError};

/// One of the two general-purpose counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CounterId {
    /// Counter G0
    G0,
    /// Counter G1
    G1,
}

impl CounterId {
    /// Both counters, in index order.
    pub const ALL: [CounterId; 2] = [CounterId::G0, CounterId::G1];

    /// Convert a raw counter number (as passed through ioctl) to a counter.
    pub fn from_index(counter: u32) -> Result<Self> {
        match counter {
            0 => Ok(Self::G0),
            1 => Ok(Self::G1),
            _ => Err(StcError::InvalidCounter { counter }),
        }
    }

    /// Counter index (0 or 1).
    pub fn index(self) -> usize {
        match self {
            Self::G0 => 0,
            Self::G1 => 1,
        }
    }

    /// The partner counter.
    pub fn other(self) -> Self {
        match self {
            Self::G0 => Self::G1,
            Self::G1 => Self::G0,
        }
    }
}

impl fmt::Display for CounterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "G{}", self.index())
    }
}

/// Symbolic register names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Register {
    /// Group A/B master interrupt enables
    InterruptControl,
    /// Per-source enables, group A
    InterruptAEnable,
    /// Per-source enables, group B
    InterruptBEnable,
    /// Acknowledge strobes, group A
    InterruptAAck,
    /// Acknowledge strobes, group B
    InterruptBAck,
    /// Interrupt status, group A
    AiStatus1,
    /// Interrupt status, group B
    AoStatus1,
    /// Counter reset strobes
    JointReset,
    /// Counter armed status
    JointStatus1,
    /// Counter command (arm/disarm/load/save-trace)
    GCommand(CounterId),
    /// Counter mode
    GMode(CounterId),
    /// Source and gate multiplexer
    GInputSelect(CounterId),
    /// Load register A (24 bit)
    GLoadA(CounterId),
    /// Load register B (24 bit)
    GLoadB(CounterId),
    /// Live save register, latched by save-trace
    GSave(CounterId),
    /// Save-on-halt register, stable after disarm
    GHwSave(CounterId),
    /// Auto-increment value
    GAutoIncrement(CounterId),
    /// DMA association
    GDmaConfig(CounterId),
    /// Timebase division and FOUT
    ClockAndFout,
    /// GPFO output enables
    AnalogTriggerEtc,
    /// Analog trigger high/low levels
    TriggerLevels,
    /// PFI pin directions
    IoBidirectionPin,
    /// AI arm/start/disarm strobes
    AiCommand1,
    /// AI mode
    AiMode1,
    /// Number of channels in the scan list
    AiChannelCount,
    /// Scan interval in timebase ticks
    AiScanInterval,
    /// Scans per acquisition (0 = continuous)
    AiScanCount,
    /// AI start trigger selector
    AiTriggerSelect,
    /// AO arm/start/disarm strobes
    AoCommand1,
    /// AO mode
    AoMode1,
    /// Update interval in timebase ticks
    AoUpdateInterval,
    /// DIO line directions
    DioControl,
    /// DIO output latch
    DioOutput,
    /// DIO live input
    DioParallelInput,
}

impl Register {
    /// Whether the register is accessed with 32-bit cycles.
    pub fn is_wide(self) -> bool {
        matches!(
            self,
            Self::GLoadA(_)
                | Self::GLoadB(_)
                | Self::GSave(_)
                | Self::GHwSave(_)
                | Self::AiScanInterval
                | Self::AiScanCount
                | Self::AoUpdateInterval
        )
    }
}

/// Bit patterns for the registers the driver programs.
pub mod bits {
    /// InterruptControl
    pub mod interrupt_control {
        /// Group A master enable
        pub const GROUP_A_ENABLE: u32 = 1 << 8;
        /// Group B master enable
        pub const GROUP_B_ENABLE: u32 = 1 << 9;
    }

    /// GCommand
    pub mod g_command {
        /// Arm the counter
        pub const ARM: u32 = 1 << 0;
        /// With ARM: arm the partner counter in the same cycle
        pub const ARM_COPY: u32 = 1 << 1;
        /// Latch the live count into the save register while set
        pub const SAVE_TRACE: u32 = 1 << 2;
        /// Load the count from the selected load register
        pub const LOAD: u32 = 1 << 3;
        /// Disarm the counter
        pub const DISARM: u32 = 1 << 4;
    }

    /// JointReset
    pub mod joint_reset {
        /// Reset counter G0
        pub const G0_RESET: u32 = 1 << 2;
        /// Reset counter G1
        pub const G1_RESET: u32 = 1 << 3;
    }

    /// JointStatus1
    pub mod joint_status {
        /// Counter G0 armed
        pub const G0_ARMED: u32 = 1 << 8;
        /// Counter G1 armed
        pub const G1_ARMED: u32 = 1 << 9;
    }

    /// AnalogTriggerEtc
    pub mod analog_trigger_etc {
        /// Drive the G0 output pin
        pub const GPFO_0_OUTPUT_ENABLE: u32 = 1 << 14;
        /// Drive the G1 output pin
        pub const GPFO_1_OUTPUT_ENABLE: u32 = 1 << 15;
    }

    /// ClockAndFout
    pub mod clock_and_fout {
        /// Divide the counter source timebase by two
        pub const G_SOURCE_DIVIDE_BY_2: u32 = 1 << 11;
        /// Select the 100 kHz timebase for FOUT
        pub const FOUT_TIMEBASE_SELECT: u32 = 1 << 14;
        /// Enable the FOUT pin
        pub const FOUT_ENABLE: u32 = 1 << 15;
        /// FOUT divider field (0 means divide by 16)
        pub const FOUT_DIVIDER_MASK: u32 = 0x000F;
    }

    /// AiCommand1 / AoCommand1
    pub mod acq_command {
        /// Arm the subsystem
        pub const ARM: u32 = 1 << 0;
        /// Software start
        pub const START: u32 = 1 << 1;
        /// Disarm the subsystem
        pub const DISARM: u32 = 1 << 2;
    }
}

/// Collaborator interface for raw register access.
///
/// Implemented by the bus glue for a real board (port or memory mapped I/O)
/// and by [`crate::sim::SimulatedBus`].
pub trait RegisterBus: Send + Sync {
    /// 16-bit register write.
    fn write16(&self, reg: Register, value: u16);
    /// 32-bit register write.
    fn write32(&self, reg: Register, value: u32);
    /// 16-bit register read.
    fn read16(&self, reg: Register) -> u16;
    /// 32-bit register read.
    fn read32(&self, reg: Register) -> u32;
}

/// Shadow copies of every register value the driver has written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HardwareMirror {
    values: BTreeMap<Register, u32>,
}

impl HardwareMirror {
    /// Last written value (0 if never written).
    pub fn get(&self, reg: Register) -> u32 {
        self.values.get(&reg).copied().unwrap_or(0)
    }

    fn set(&mut self, reg: Register, value: u32) {
        self.values.insert(reg, value);
    }

    /// Whether the driver ever wrote this register.
    pub fn contains(&self, reg: Register) -> bool {
        self.values.contains_key(&reg)
    }
}

/// Register access with an atomically maintained [`HardwareMirror`].
pub struct RegisterFile {
    bus: Arc<dyn RegisterBus>,
    mirror: Mutex<HardwareMirror>,
}

impl RegisterFile {
    /// Wrap a bus with an empty mirror.
    pub fn new(bus: Arc<dyn RegisterBus>) -> Self {
        Self {
            bus,
            mirror: Mutex::new(HardwareMirror::default()),
        }
    }

    fn put(&self, reg: Register, value: u32) {
        trace!(register = ?reg, value = format_args!("{value:#x}"), "register write");
        if reg.is_wide() {
            self.bus.write32(reg, value);
        } else {
            self.bus.write16(reg, value as u16);
        }
    }

    /// Write a register and record the value in the mirror.
    pub fn write(&self, reg: Register, value: u32) {
        let mut mirror = self.mirror.lock();
        mirror.set(reg, value);
        self.put(reg, value);
    }

    /// Set bits in a mirrored register.
    pub fn set_bits(&self, reg: Register, bits: u32) {
        self.update(reg, bits, bits);
    }

    /// Clear bits in a mirrored register.
    pub fn clear_bits(&self, reg: Register, bits: u32) {
        self.update(reg, bits, 0);
    }

    /// Replace the bits selected by `mask` with `value`.
    pub fn update(&self, reg: Register, mask: u32, value: u32) {
        let mut mirror = self.mirror.lock();
        let new = (mirror.get(reg) & !mask) | (value & mask);
        mirror.set(reg, new);
        self.put(reg, new);
    }

    /// Write the mirrored value plus `bits` without retaining `bits`.
    ///
    /// Used for command and acknowledge registers whose bits act as
    /// one-shot strobes.
    pub fn strobe(&self, reg: Register, bits: u32) {
        let mirror = self.mirror.lock();
        self.put(reg, mirror.get(reg) | bits);
    }

    /// Live hardware read.
    pub fn read(&self, reg: Register) -> u32 {
        let _mirror = self.mirror.lock();
        if reg.is_wide() {
            self.bus.read32(reg)
        } else {
            u32::from(self.bus.read16(reg))
        }
    }

    /// Mirrored value of a register.
    pub fn mirrored(&self, reg: Register) -> u32 {
        self.mirror.lock().get(reg)
    }

    /// Snapshot of the whole mirror.
    pub fn mirror(&self) -> HardwareMirror {
        self.mirror.lock().clone()
    }
}

impl fmt::Debug for RegisterFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterFile")
            .field("mirrored", &self.mirror.lock().values.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedBus;

    fn file() -> (Arc<SimulatedBus>, RegisterFile) {
        let bus = Arc::new(SimulatedBus::new());
        let file = RegisterFile::new(bus.clone());
        (bus, file)
    }

    #[test]
    fn test_counter_from_index() {
        assert_eq!(CounterId::from_index(0).unwrap(), CounterId::G0);
        assert_eq!(CounterId::from_index(1).unwrap(), CounterId::G1);
        assert_eq!(
            CounterId::from_index(2).unwrap_err(),
            StcError::InvalidCounter { counter: 2 }
        );
        assert_eq!(CounterId::G0.other(), CounterId::G1);
    }

    #[test]
    fn test_mirror_tracks_bit_updates() {
        let (bus, regs) = file();
        regs.set_bits(Register::DioControl, 0x0F);
        regs.set_bits(Register::DioControl, 0x30);
        regs.clear_bits(Register::DioControl, 0x01);
        assert_eq!(regs.mirrored(Register::DioControl), 0x3E);
        assert_eq!(bus.last_write(Register::DioControl), Some(0x3E));
    }

    #[test]
    fn test_strobe_is_not_retained() {
        let (bus, regs) = file();
        regs.set_bits(Register::GCommand(CounterId::G0), bits::g_command::SAVE_TRACE);
        regs.strobe(Register::GCommand(CounterId::G0), bits::g_command::ARM);
        assert_eq!(
            bus.last_write(Register::GCommand(CounterId::G0)),
            Some(bits::g_command::SAVE_TRACE | bits::g_command::ARM)
        );
        assert_eq!(
            regs.mirrored(Register::GCommand(CounterId::G0)),
            bits::g_command::SAVE_TRACE
        );
    }

    #[test]
    fn test_wide_registers_keep_24_bits() {
        let (bus, regs) = file();
        regs.write(Register::GLoadA(CounterId::G1), 0x00AB_CDEF);
        assert_eq!(bus.last_write(Register::GLoadA(CounterId::G1)), Some(0x00AB_CDEF));
        assert!(regs.mirror().contains(Register::GLoadA(CounterId::G1)));
    }
}
