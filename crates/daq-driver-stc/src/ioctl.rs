//! ioctl command words and argument layouts.
//!
//! Command word (low 16 bits; the direction/size bits above are ignored):
//!
//! ```text
//!  15        8 7    4 3    0
//! ┌───────────┬──────┬──────┐
//! │ magic 'n' │ sub- │ op   │
//! │           │system│      │
//! └───────────┴──────┴──────┘
//! ```
//!
//! Subsystem nibble: 0 MSC, 1 AI, 2 AO, 3 GPCT, 4 DIO. Arguments are
//! fixed-layout `#[repr(C)]` structs; output fields are written back into
//! the argument.

use bitflags::bitflags;
use tracing::debug;

use crate::board::BoardState;
use crate::error::{Result, StcError};
use crate::registers::CounterId;
use crate::signals::{InputSignal, Polarity};
use crate::subsystem::{AiSetup, AoSetup, CountingSetup, FoutTimebase, PulseSetup};
use crate::wait::SignalToken;

/// ioctl magic byte.
pub const STC_MAGIC: u8 = b'n';

/// Decoded ioctl command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Program the FOUT pin ([`MscArg`])
    MscSetClock = 0x00,
    /// Set analog trigger levels ([`MscArg`])
    MscSetTriggerLevels = 0x01,
    /// Configure an acquisition ([`AiArg`])
    AiSetup = 0x10,
    /// Start the acquisition
    AiStart = 0x11,
    /// Stop the acquisition
    AiStop = 0x12,
    /// Configure waveform output ([`AoArg`])
    AoSetup = 0x20,
    /// Start output
    AoStart = 0x21,
    /// Stop output
    AoStop = 0x22,
    /// Event counting ([`GpctArg`])
    GpctStartCounting = 0x30,
    /// Pulse generation ([`GpctArg`])
    GpctStartPulses = 0x31,
    /// Arm, optionally both counters ([`GpctArg`])
    GpctArm = 0x32,
    /// Disarm ([`GpctArg`])
    GpctDisarm = 0x33,
    /// Read the count into `count` ([`GpctArg`])
    GpctGetCount = 0x34,
    /// Read the armed status into `armed` ([`GpctArg`])
    GpctIsBusy = 0x35,
    /// Reset both counters
    GpctResetAll = 0x36,
    /// Set line directions ([`DioArg`])
    DioConfigure = 0x40,
    /// Write output lines ([`DioArg`])
    DioWrite = 0x41,
    /// Read lines into `value` ([`DioArg`])
    DioRead = 0x42,
}

const SUBSYSTEM_OPS: [&[Command]; 5] = [
    &[Command::MscSetClock, Command::MscSetTriggerLevels],
    &[Command::AiSetup, Command::AiStart, Command::AiStop],
    &[Command::AoSetup, Command::AoStart, Command::AoStop],
    &[
        Command::GpctStartCounting,
        Command::GpctStartPulses,
        Command::GpctArm,
        Command::GpctDisarm,
        Command::GpctGetCount,
        Command::GpctIsBusy,
        Command::GpctResetAll,
    ],
    &[Command::DioConfigure, Command::DioWrite, Command::DioRead],
];

impl Command {
    /// Command word for this command.
    pub fn code(self) -> u32 {
        (u32::from(STC_MAGIC) << 8) | self as u32
    }

    /// Validate magic and number range of a raw command word.
    pub fn decode(cmd: u32) -> Result<Self> {
        let bad = |message: String| StcError::BadIoctl { cmd, message };

        let magic = ((cmd >> 8) & 0xFF) as u8;
        if magic != STC_MAGIC {
            return Err(bad(format!("magic {magic:#04x}, expected {STC_MAGIC:#04x}")));
        }
        let subsystem = ((cmd >> 4) & 0xF) as usize;
        let op = (cmd & 0xF) as usize;
        let ops = SUBSYSTEM_OPS
            .get(subsystem)
            .ok_or_else(|| bad(format!("unknown subsystem {subsystem}")))?;
        ops.get(op)
            .copied()
            .ok_or_else(|| bad(format!("operation {op} out of range for subsystem {subsystem}")))
    }
}

bitflags! {
    /// [`GpctArg::flags`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct GpctFlags: u32 {
        /// Count on the falling source edge
        const INVERT_SOURCE = 1 << 0;
        /// Active-low gate
        const INVERT_GATE = 1 << 1;
        /// Inverted counter output
        const INVERT_OUTPUT = 1 << 2;
        /// Free-running pulse train
        const CONTINUOUS = 1 << 3;
        /// Program without arming
        const DELAY_START = 1 << 4;
        /// get_count: wait for the partner counter to stop
        const WAIT_FOR_END = 1 << 5;
        /// arm: arm both counters at once
        const ARM_BOTH = 1 << 6;
    }
}

impl GpctFlags {
    fn polarity(self) -> Polarity {
        Polarity::from_bits_truncate(self.bits() & 0b111)
    }
}

/// GPCT argument.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GpctArg {
    /// Counter number, 0 or 1
    pub counter: u32,
    /// Source multiplexer code
    pub source: u32,
    /// Gate multiplexer code, [`GpctArg::NO_GATE`] for none
    pub gate: u32,
    /// [`GpctFlags`] bits
    pub flags: u32,
    /// Pulse low phase in ticks
    pub low_ticks: u32,
    /// Pulse high phase in ticks
    pub high_ticks: u32,
    /// Delay before the first pulse in ticks
    pub delay_ticks: u32,
    /// Out: count
    pub count: u32,
    /// Out: 1 if armed
    pub armed: u32,
}

impl GpctArg {
    /// Gate selector meaning "ungated".
    pub const NO_GATE: u32 = u32::MAX;

    fn counter(&self) -> Result<CounterId> {
        CounterId::from_index(self.counter)
    }

    fn flags(&self) -> GpctFlags {
        GpctFlags::from_bits_truncate(self.flags)
    }

    fn source(&self) -> Result<InputSignal> {
        InputSignal::from_code(self.source).ok_or(StcError::InvalidSignal {
            role: "source",
            code: self.source,
        })
    }

    fn gate(&self) -> Result<Option<InputSignal>> {
        if self.gate == Self::NO_GATE {
            return Ok(None);
        }
        InputSignal::from_code(self.gate)
            .map(Some)
            .ok_or(StcError::InvalidSignal {
                role: "gate",
                code: self.gate,
            })
    }

    /// Decode an event counting request.
    pub fn counting_setup(&self) -> Result<(CounterId, CountingSetup)> {
        Ok((
            self.counter()?,
            CountingSetup {
                source: self.source()?,
                gate: self.gate()?,
                polarity: self.flags().polarity(),
            },
        ))
    }

    /// Decode a pulse generation request.
    pub fn pulse_setup(&self) -> Result<(CounterId, PulseSetup)> {
        let flags = self.flags();
        Ok((
            self.counter()?,
            PulseSetup {
                source: self.source()?,
                gate: self.gate()?,
                low_ticks: self.low_ticks,
                high_ticks: self.high_ticks,
                delay_ticks: self.delay_ticks,
                polarity: flags.polarity(),
                continuous: flags.contains(GpctFlags::CONTINUOUS),
                delay_start: flags.contains(GpctFlags::DELAY_START),
            },
        ))
    }
}

/// AI argument.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AiArg {
    /// Used entries of `channels`
    pub num_channels: u32,
    /// Channel numbers in scan order
    pub channels: [u8; 16],
    /// 0 = continuous
    pub num_scans: u32,
    /// Ticks between scan starts
    pub scan_interval_ticks: u32,
    /// Trigger multiplexer code, [`AiArg::NO_TRIGGER`] for software start
    pub trigger: u32,
}

impl AiArg {
    /// Trigger selector meaning "software start".
    pub const NO_TRIGGER: u32 = u32::MAX;

    /// Decode into an [`AiSetup`].
    pub fn setup(&self) -> Result<AiSetup> {
        let n = self.num_channels as usize;
        if n > self.channels.len() {
            return Err(StcError::invalid(format!("{n} AI channels requested")));
        }
        let start_trigger = if self.trigger == Self::NO_TRIGGER {
            None
        } else {
            Some(
                InputSignal::from_code(self.trigger).ok_or(StcError::InvalidSignal {
                    role: "AI start trigger",
                    code: self.trigger,
                })?,
            )
        };
        Ok(AiSetup {
            channels: self.channels[..n].to_vec(),
            num_scans: self.num_scans,
            scan_interval_ticks: self.scan_interval_ticks,
            start_trigger,
        })
    }
}

/// AO argument.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AoArg {
    /// Channels updated per sample (1 or 2)
    pub channels: u32,
    /// Ticks between updates
    pub update_interval_ticks: u32,
    /// Non-zero for continuous regeneration
    pub continuous: u32,
}

impl AoArg {
    /// Decode into an [`AoSetup`].
    pub fn setup(&self) -> Result<AoSetup> {
        Ok(AoSetup {
            channels: narrow("AO channel count", self.channels)?,
            update_interval_ticks: self.update_interval_ticks,
            continuous: self.continuous != 0,
        })
    }
}

/// DIO argument.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DioArg {
    /// Direction mask for configure
    pub mask: u32,
    /// Output value for write, input value for read
    pub value: u32,
}

/// MSC argument.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MscArg {
    /// 0 = 20 MHz, 1 = 100 kHz
    pub timebase: u32,
    /// FOUT divider, 1..=16
    pub divider: u32,
    /// Non-zero enables the FOUT pin
    pub enable: u32,
    /// Trigger high level
    pub high: u32,
    /// Trigger low level
    pub low: u32,
    /// Out: resulting FOUT frequency in Hz
    pub frequency: u32,
}

/// Argument passed with an ioctl.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlArg {
    /// No argument
    None,
    /// Clock output and trigger commands
    Msc(MscArg),
    /// Analog input commands
    Ai(AiArg),
    /// Analog output commands
    Ao(AoArg),
    /// Counter commands
    Gpct(GpctArg),
    /// Static digital I/O commands
    Dio(DioArg),
}

fn narrow(what: &str, value: u32) -> Result<u8> {
    u8::try_from(value).map_err(|_| StcError::invalid(format!("{what} {value} out of range")))
}

fn wrong_arg(command: Command) -> StcError {
    StcError::BadIoctl {
        cmd: command.code(),
        message: format!("wrong argument kind for {command:?}"),
    }
}

/// Execute `command` against a locked board.
pub(crate) fn dispatch(
    state: &mut BoardState,
    command: Command,
    arg: &mut IoctlArg,
    signal: &SignalToken,
) -> Result<()> {
    debug!(command = ?command, "ioctl");
    let BoardState {
        pfi,
        msc,
        ai,
        ao,
        gpct,
        dio,
    } = state;

    match (command, arg) {
        (Command::MscSetClock, IoctlArg::Msc(a)) => {
            let timebase = match a.timebase {
                0 => FoutTimebase::Fast,
                1 => FoutTimebase::Slow,
                other => return Err(StcError::invalid(format!("FOUT timebase {other}"))),
            };
            a.frequency =
                msc.set_clock_output(timebase, narrow("FOUT divider", a.divider)?, a.enable != 0)?;
            Ok(())
        }
        (Command::MscSetTriggerLevels, IoctlArg::Msc(a)) => msc.set_trigger_levels(
            narrow("trigger high level", a.high)?,
            narrow("trigger low level", a.low)?,
        ),

        (Command::AiSetup, IoctlArg::Ai(a)) => ai.setup(pfi, a.setup()?),
        (Command::AiStart, IoctlArg::None) => ai.start(),
        (Command::AiStop, IoctlArg::None) => {
            ai.stop();
            Ok(())
        }

        (Command::AoSetup, IoctlArg::Ao(a)) => ao.setup(a.setup()?),
        (Command::AoStart, IoctlArg::None) => ao.start(),
        (Command::AoStop, IoctlArg::None) => {
            ao.stop();
            Ok(())
        }

        (Command::GpctStartCounting, IoctlArg::Gpct(a)) => {
            let (counter, setup) = a.counting_setup()?;
            gpct.start_counting(pfi, counter, setup)
        }
        (Command::GpctStartPulses, IoctlArg::Gpct(a)) => {
            let (counter, setup) = a.pulse_setup()?;
            gpct.start_pulses(pfi, counter, setup)
        }
        (Command::GpctArm, IoctlArg::Gpct(a)) => {
            let both = a.flags().contains(GpctFlags::ARM_BOTH);
            gpct.arm(a.counter()?, both)
        }
        (Command::GpctDisarm, IoctlArg::Gpct(a)) => {
            gpct.disarm(a.counter()?);
            Ok(())
        }
        (Command::GpctGetCount, IoctlArg::Gpct(a)) => {
            let wait = a.flags().contains(GpctFlags::WAIT_FOR_END);
            a.count = gpct.get_count(a.counter()?, wait, signal)?;
            Ok(())
        }
        (Command::GpctIsBusy, IoctlArg::Gpct(a)) => {
            a.armed = u32::from(gpct.is_busy(a.counter()?));
            Ok(())
        }
        (Command::GpctResetAll, IoctlArg::None) => {
            gpct.reset_all(pfi);
            Ok(())
        }

        (Command::DioConfigure, IoctlArg::Dio(a)) => {
            dio.configure(narrow("DIO mask", a.mask)?);
            Ok(())
        }
        (Command::DioWrite, IoctlArg::Dio(a)) => {
            dio.write(narrow("DIO value", a.value)?);
            Ok(())
        }
        (Command::DioRead, IoctlArg::Dio(a)) => {
            a.value = u32::from(dio.read());
            Ok(())
        }

        (command, _) => Err(wrong_arg(command)),
    }
}
