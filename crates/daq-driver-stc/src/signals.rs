//! Input signal selectors shared by the counter and acquisition multiplexers.

use std::fmt;

use bitflags::bitflags;

/// Number of PFI lines on the board.
pub const PFI_COUNT: u8 = 10;
/// Number of RTSI trigger lines.
pub const RTSI_COUNT: u8 = 7;

/// A signal routable to a counter source, counter gate or trigger input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputSignal {
    /// 20 MHz internal timebase
    Timebase1,
    /// 100 kHz internal timebase
    Timebase2,
    /// Programmable function input 0..=9
    Pfi(u8),
    /// RTSI bus line 0..=6
    Rtsi(u8),
    /// Terminal count of the partner counter
    OtherTc,
    /// Output of the partner counter
    OtherGout,
    /// Constant low
    LogicLow,
}

impl InputSignal {
    /// Decode a raw multiplexer code. Returns `None` for codes with no
    /// corresponding signal.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Timebase1),
            1..=10 => Some(Self::Pfi((code - 1) as u8)),
            11..=17 => Some(Self::Rtsi((code - 11) as u8)),
            18 => Some(Self::Timebase2),
            19 => Some(Self::OtherTc),
            20 => Some(Self::OtherGout),
            31 => Some(Self::LogicLow),
            _ => None,
        }
    }

    /// Raw multiplexer code.
    pub fn code(self) -> u32 {
        match self {
            Self::Timebase1 => 0,
            Self::Pfi(n) => 1 + u32::from(n),
            Self::Rtsi(n) => 11 + u32::from(n),
            Self::Timebase2 => 18,
            Self::OtherTc => 19,
            Self::OtherGout => 20,
            Self::LogicLow => 31,
        }
    }

    /// PFI pin carried by this signal, if any.
    pub fn pfi_pin(self) -> Option<u8> {
        match self {
            Self::Pfi(n) if n < PFI_COUNT => Some(n),
            _ => None,
        }
    }

    /// Whether the line number is within the physical range.
    pub fn is_wired(self) -> bool {
        match self {
            Self::Pfi(n) => n < PFI_COUNT,
            Self::Rtsi(n) => n < RTSI_COUNT,
            _ => true,
        }
    }
}

impl fmt::Display for InputSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timebase1 => write!(f, "TIMEBASE1"),
            Self::Timebase2 => write!(f, "TIMEBASE2"),
            Self::Pfi(n) => write!(f, "PFI{n}"),
            Self::Rtsi(n) => write!(f, "RTSI{n}"),
            Self::OtherTc => write!(f, "OTHER_TC"),
            Self::OtherGout => write!(f, "OTHER_GOUT"),
            Self::LogicLow => write!(f, "LOGIC_LOW"),
        }
    }
}

bitflags! {
    /// Signal polarity selection for counter programming.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Polarity: u32 {
        /// Count on falling source edges
        const INVERT_SOURCE = 1 << 0;
        /// Gate is active low
        const INVERT_GATE = 1 << 1;
        /// Output idles high
        const INVERT_OUTPUT = 1 << 2;
    }
}
