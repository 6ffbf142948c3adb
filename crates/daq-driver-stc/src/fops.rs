//! Character-device protocol: one [`DeviceFile`] per open handle.
//!
//! Every data and configuration call takes the board's use lock for its
//! whole duration, including any blocking wait; interrupts are serviced
//! without it.
//!
//! Readers that must block enable the STOP interrupt only for the duration of
//! the wait and always disable it again, also when the wait is interrupted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use tracing::{debug, trace};

use crate::board::{Board, BoardState};
use crate::error::{Result, StcError};
use crate::ioctl::{self, Command, IoctlArg};
use crate::irq::IrqId;
use crate::pfi::Subsystem;
use crate::subsystem::AcquisitionState;
use crate::wait::SignalToken;

bitflags! {
    /// Readiness reported by [`DeviceFile::poll`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PollMask: u32 {
        /// AI data ready
        const POLLIN = 0x0001;
        /// AO space ready
        const POLLOUT = 0x0004;
        /// Nothing to wait for
        const POLLHUP = 0x0010;
        /// Same as POLLIN
        const POLLRDNORM = 0x0040;
        /// Same as POLLOUT
        const POLLWRNORM = 0x0100;
    }
}

/// Flags given at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags {
    /// `O_NONBLOCK`
    pub nonblocking: bool,
}

impl OpenFlags {
    /// Blocking open.
    pub fn blocking() -> Self {
        Self { nonblocking: false }
    }

    /// Non-blocking open.
    pub fn nonblocking() -> Self {
        Self { nonblocking: true }
    }
}

const SAMPLE_BYTES: usize = std::mem::size_of::<u16>();

/// An open board handle.
///
/// Dropping the handle releases the board exactly like [`DeviceFile::release`].
#[derive(Debug)]
pub struct DeviceFile {
    board: Arc<Board>,
    flags: OpenFlags,
    signal: SignalToken,
    released: AtomicBool,
}

impl DeviceFile {
    pub(crate) fn new(board: Arc<Board>, flags: OpenFlags, signal: SignalToken) -> Self {
        Self {
            board,
            flags,
            signal,
            released: AtomicBool::new(false),
        }
    }

    /// Board behind this handle.
    pub fn board(&self) -> &Arc<Board> {
        &self.board
    }

    /// Signal token interrupting this handle's blocking calls.
    pub fn signal(&self) -> &SignalToken {
        &self.signal
    }

    /// Flags the handle was opened with.
    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    /// Read AI samples as native-endian 16-bit words.
    ///
    /// Starts a configured acquisition on first use. Returns 0 once a finite
    /// acquisition has completed and every sample has been read; the
    /// acquisition is torn down at that point.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut guard = self.board.lock();
        let state = &mut *guard;

        if !state.ai.is_configured() {
            return Err(StcError::NotConfigured {
                subsystem: Subsystem::Ai,
            });
        }
        if state.ai.state() == AcquisitionState::Configured {
            state.ai.start()?;
        }

        let wanted = buf.len() / SAMPLE_BYTES;
        if wanted == 0 {
            return Ok(0);
        }

        let dma = state.ai.dma().clone();
        while dma.available() == 0 {
            if state.ai.check_complete() {
                debug!(board = self.board.name(), "acquisition drained");
                state.ai.teardown(&mut state.pfi);
                return Ok(0);
            }
            if self.flags.nonblocking {
                return Err(StcError::WouldBlock);
            }
            self.wait_for_scan(state, None)?;
        }

        let mut samples = vec![0u16; wanted];
        let n = dma.get(&mut samples);
        for (chunk, sample) in buf.chunks_exact_mut(SAMPLE_BYTES).zip(&samples[..n]) {
            chunk.copy_from_slice(&sample.to_ne_bytes());
        }

        if dma.available() == 0 && state.ai.check_complete() {
            debug!(board = self.board.name(), "final read, tearing down acquisition");
            state.ai.teardown(&mut state.pfi);
        }
        trace!(samples = n, "AI read");
        Ok(n * SAMPLE_BYTES)
    }

    /// Block until STOP or SC_TC is raised, samples arrive, or `timeout`
    /// expires. Returns whether the wait ended before the timeout.
    fn wait_for_scan(&self, state: &BoardState, timeout: Option<Duration>) -> Result<bool> {
        let irq = self.board.irq().clone();
        let dma = state.ai.dma().clone();
        let queue = state.ai.queue().clone();

        let wake = queue.clone();
        irq.enable(IrqId::AiStop, Arc::new(move || wake.wake_up_all()));

        let condition = || {
            irq.is_raised(IrqId::AiStop) || irq.is_raised(IrqId::AiScTc) || dma.available() > 0
        };
        let result = match timeout {
            None => queue
                .wait_event_interruptible(condition, &self.signal)
                .map(|()| true),
            Some(timeout) => queue.wait_event_timeout(condition, &self.signal, timeout),
        };

        irq.disable(IrqId::AiStop);
        result
    }

    /// Queue AO samples (native-endian 16-bit words).
    ///
    /// Returns the number of bytes accepted. A trailing odd byte is ignored.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let guard = self.board.lock();
        if !guard.ao.is_configured() {
            return Err(StcError::NotConfigured {
                subsystem: Subsystem::Ao,
            });
        }

        let samples: Vec<u16> = buf
            .chunks_exact(SAMPLE_BYTES)
            .map(|c| u16::from_ne_bytes([c[0], c[1]]))
            .collect();
        if samples.is_empty() {
            return Ok(0);
        }

        let dma = guard.ao.dma().clone();
        if dma.space() == 0 {
            if self.flags.nonblocking {
                return Err(StcError::WouldBlock);
            }
            let irq = self.board.irq().clone();
            let queue = guard.ao.queue().clone();
            let wake = queue.clone();
            irq.enable(IrqId::AoUpdate, Arc::new(move || wake.wake_up_all()));
            let result = queue.wait_event_interruptible(|| dma.space() > 0, &self.signal);
            irq.disable(IrqId::AoUpdate);
            result?;
        }

        let n = dma.put(&samples);
        trace!(samples = n, "AO write");
        Ok(n * SAMPLE_BYTES)
    }

    /// Report readiness, waiting up to `timeout` for AI data.
    ///
    /// A zero timeout only samples the current state.
    pub fn poll(&self, timeout: Duration) -> Result<PollMask> {
        let mut guard = self.board.lock();
        let state = &mut *guard;

        let ai = state.ai.is_configured();
        let ao = state.ao.is_configured();
        if !ai && !ao {
            return Ok(PollMask::POLLHUP);
        }

        let mut mask = PollMask::empty();
        if ao && state.ao.dma().space() > 0 {
            mask |= PollMask::POLLOUT | PollMask::POLLWRNORM;
        }
        if !ai {
            return Ok(mask);
        }

        if state.ai.state() == AcquisitionState::Configured {
            state.ai.start()?;
        }
        let readable = PollMask::POLLIN | PollMask::POLLRDNORM;
        if state.ai.dma().available() > 0 {
            return Ok(mask | readable);
        }
        if state.ai.check_complete() {
            // Finished and drained: the next read reports end of data
            return Ok(mask | readable);
        }
        if mask.is_empty() && !timeout.is_zero() {
            self.wait_for_scan(state, Some(timeout))?;
            if state.ai.dma().available() > 0 || state.ai.check_complete() {
                mask |= readable;
            }
        }
        Ok(mask)
    }

    /// Decode and execute an ioctl under the use lock.
    pub fn ioctl(&self, cmd: u32, arg: &mut IoctlArg) -> Result<()> {
        let command = Command::decode(cmd)?;
        let mut state = self.board.lock();
        ioctl::dispatch(&mut state, command, arg, &self.signal)
    }

    /// Close the handle: reset the board and drop the open claim.
    pub fn release(self) {
        self.release_once();
    }

    fn release_once(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.board.release_claim();
        }
    }
}

impl Drop for DeviceFile {
    fn drop(&mut self) {
        self.release_once();
    }
}
