//! Error types for DAQ-STC board operations.
//!
//! Every error maps onto the negative errno the character-device surface
//! reports to user space (see [`StcError::errno`]). The variants fall into the
//! four classes the driver distinguishes: caller misuse, resource contention,
//! transient interruption and programming errors.

use thiserror::Error;

use crate::pfi::Subsystem;

/// Result type alias for STC operations.
pub type Result<T> = std::result::Result<T, StcError>;

/// `EINTR`
pub const EINTR: i32 = 4;
/// `ENODEV`
pub const ENODEV: i32 = 19;
/// `EAGAIN`
pub const EAGAIN: i32 = 11;
/// `EBUSY`
pub const EBUSY: i32 = 16;
/// `EINVAL`
pub const EINVAL: i32 = 22;
/// `ERESTARTSYS` (kernel-internal, never seen by a libc caller)
pub const ERESTARTSYS: i32 = 512;

/// Errors that can occur when working with a DAQ-STC board.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StcError {
    /// No board exists for the requested minor number
    #[error("No board for minor device {minor}")]
    NoDevice {
        /// Requested minor number
        minor: u32,
    },

    /// Board is already opened by another caller
    #[error("Board '{board}' is busy (opened by another caller)")]
    Busy {
        /// Board name
        board: String,
    },

    /// Non-blocking operation would have to wait
    #[error("Operation would block")]
    WouldBlock,

    /// A blocking wait was interrupted by a signal
    #[error("Interrupted by signal")]
    Interrupted,

    /// A blocking open was interrupted; the caller should restart the call
    #[error("Interrupted by signal, restart the system call")]
    RestartSys,

    /// Counter index outside 0..=1
    #[error("Invalid counter {counter}: board has 2 general-purpose counters")]
    InvalidCounter {
        /// Requested counter index
        counter: u32,
    },

    /// Source/gate/trigger selector not legal for this use
    #[error("Invalid {role} signal selector {code:#x}")]
    InvalidSignal {
        /// Source, gate or trigger
        role: &'static str,
        /// Rejected selector
        code: u32,
    },

    /// Tick count outside the 24-bit load register range
    #[error("Invalid {what} tick count {ticks}: must be in 2..={max}")]
    InvalidTicks {
        /// Which phase was out of range
        what: &'static str,
        /// Requested tick count
        ticks: u32,
        /// Largest accepted value
        max: u32,
    },

    /// Generic parameter validation failure
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// What was wrong
        message: String,
    },

    /// read()/write() before any acquisition or output was configured
    #[error("{subsystem} has not been configured")]
    NotConfigured {
        /// Subsystem that was used
        subsystem: Subsystem,
    },

    /// PFI pin already claimed by another subsystem
    #[error("PFI{pin} is owned by {owner}, cannot be claimed by {requester}")]
    PinConflict {
        /// PFI pin number
        pin: u8,
        /// Subsystem holding the pin
        owner: Subsystem,
        /// Subsystem that asked for it
        requester: Subsystem,
    },

    /// Subsystem is busy with a running operation
    #[error("{subsystem} is busy")]
    SubsystemBusy {
        /// Busy subsystem
        subsystem: Subsystem,
    },

    /// ioctl command word or argument could not be decoded
    #[error("Invalid ioctl command {cmd:#06x}: {message}")]
    BadIoctl {
        /// Raw command word
        cmd: u32,
        /// Decode failure
        message: String,
    },

    /// Symbolic IRQ id outside the dispatch table
    #[error("IRQ id {id} is outside the 16-entry dispatch table")]
    IrqOutOfRange {
        /// Rejected id
        id: usize,
    },
}

impl StcError {
    /// Shorthand for [`StcError::InvalidArgument`].
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Negative errno reported through the device-file surface.
    pub fn errno(&self) -> i32 {
        let code = match self {
            Self::NoDevice { .. } => ENODEV,
            Self::Busy { .. } | Self::PinConflict { .. } | Self::SubsystemBusy { .. } => EBUSY,
            Self::WouldBlock => EAGAIN,
            Self::Interrupted => EINTR,
            Self::RestartSys => ERESTARTSYS,
            Self::InvalidCounter { .. }
            | Self::InvalidSignal { .. }
            | Self::InvalidTicks { .. }
            | Self::InvalidArgument { .. }
            | Self::NotConfigured { .. }
            | Self::BadIoctl { .. }
            | Self::IrqOutOfRange { .. } => EINVAL,
        };
        -code
    }

    /// Check whether the caller may simply retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Interrupted | Self::RestartSys | Self::WouldBlock)
    }

    /// Check if the board or a resource on it is busy.
    pub fn is_busy(&self) -> bool {
        self.errno() == -EBUSY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(StcError::WouldBlock.errno(), -EAGAIN);
        assert_eq!(StcError::Interrupted.errno(), -EINTR);
        assert_eq!(StcError::RestartSys.errno(), -ERESTARTSYS);
        assert_eq!(StcError::NoDevice { minor: 3 }.errno(), -ENODEV);
        assert_eq!(StcError::InvalidCounter { counter: 2 }.errno(), -EINVAL);
        assert_eq!(
            StcError::NotConfigured {
                subsystem: Subsystem::Ai
            }
            .errno(),
            -EINVAL
        );
    }

    #[test]
    fn test_pin_conflict_is_busy() {
        let err = StcError::PinConflict {
            pin: 3,
            owner: Subsystem::Gpct0,
            requester: Subsystem::Ai,
        };
        assert!(err.is_busy());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("PFI3"));
    }

    #[test]
    fn test_retryable() {
        assert!(StcError::Interrupted.is_retryable());
        assert!(StcError::RestartSys.is_retryable());
        assert!(!StcError::invalid("x").is_retryable());
    }
}
