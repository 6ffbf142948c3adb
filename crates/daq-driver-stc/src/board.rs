//! One DAQ-STC board.
//!
//! A board carries two independent locks:
//!
//! - the *open* lock guards only the exclusive-open flag;
//! - the *use* lock ([`Board::lock`]) serialises every configuration and data
//!   operation on the subsystems.
//!
//! The interrupt path ([`Board::service_interrupt`]) takes neither.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::config::{BoardSettings, DriverConfig};
use crate::dma::DmaChannel;
use crate::error::{Result, StcError};
use crate::irq::IrqDispatch;
use crate::pfi::{PfiTable, Subsystem};
use crate::registers::{RegisterBus, RegisterFile};
use crate::subsystem::{Acquisition, AnalogOutput, Dio, Gpct, Msc};
use crate::wait::SignalToken;

/// Subsystem state guarded by the use lock.
#[derive(Debug)]
pub struct BoardState {
    /// PFI pin ownership
    pub pfi: PfiTable,
    /// Clocks and triggers
    pub msc: Msc,
    /// Analog input
    pub ai: Acquisition,
    /// Analog output
    pub ao: AnalogOutput,
    /// Counters
    pub gpct: Gpct,
    /// Digital I/O
    pub dio: Dio,
}

impl BoardState {
    /// Return every subsystem to its power-on state.
    pub fn reset_all(&mut self) {
        self.gpct.reset_all(&mut self.pfi);
        self.ai.reset_all(&mut self.pfi);
        self.ao.reset_all();
        self.dio.reset_all();
        self.msc.reset_all(&mut self.pfi);
    }
}

/// A board and its subsystems.
pub struct Board {
    name: String,
    minor: u32,
    regs: Arc<RegisterFile>,
    irq: Arc<IrqDispatch>,
    ai_dma: Arc<DmaChannel>,
    ao_dma: Arc<DmaChannel>,
    in_use: Mutex<bool>,
    released: Condvar,
    signal_poll: Duration,
    state: Mutex<BoardState>,
}

impl Board {
    /// Bring up a board on `bus` and reset it to the known state.
    pub fn new(
        minor: u32,
        settings: &BoardSettings,
        config: &DriverConfig,
        bus: Arc<dyn RegisterBus>,
    ) -> Self {
        let signal_poll = config.signal_poll_interval();
        let regs = Arc::new(RegisterFile::new(bus));
        let irq = Arc::new(IrqDispatch::new(regs.clone()));
        let ai_dma = Arc::new(DmaChannel::new(Subsystem::Ai));
        let ao_dma = Arc::new(DmaChannel::new(Subsystem::Ao));

        let mut state = BoardState {
            pfi: PfiTable::new(regs.clone()),
            msc: Msc::new(regs.clone()),
            ai: Acquisition::new(
                regs.clone(),
                irq.clone(),
                ai_dma.clone(),
                settings.ai_buffer_samples,
                signal_poll,
            ),
            ao: AnalogOutput::new(
                regs.clone(),
                irq.clone(),
                ao_dma.clone(),
                settings.ao_buffer_samples,
                signal_poll,
            ),
            gpct: Gpct::new(regs.clone(), irq.clone(), config.counter_read, signal_poll),
            dio: Dio::new(regs.clone()),
        };
        state.reset_all();
        debug!(board = %settings.name, minor, "board initialised");

        Self {
            name: settings.name.clone(),
            minor,
            regs,
            irq,
            ai_dma,
            ao_dma,
            in_use: Mutex::new(false),
            released: Condvar::new(),
            signal_poll,
            state: Mutex::new(state),
        }
    }

    /// Take the exclusive-open claim.
    ///
    /// Non-blocking callers get [`StcError::Busy`] while another handle is
    /// open. Blocking callers wait for the release; a signal ends the wait
    /// with [`StcError::RestartSys`] and is consumed, so the open can be
    /// retried.
    pub fn claim(&self, nonblocking: bool, signal: &SignalToken) -> Result<()> {
        let mut in_use = self.in_use.lock();
        while *in_use {
            if nonblocking {
                return Err(StcError::Busy {
                    board: self.name.clone(),
                });
            }
            if signal.take() {
                return Err(StcError::RestartSys);
            }
            self.released.wait_for(&mut in_use, self.signal_poll);
        }
        *in_use = true;
        info!(board = %self.name, minor = self.minor, "board opened");
        Ok(())
    }

    /// Reset the whole board, then drop the exclusive-open claim.
    pub fn release_claim(&self) {
        self.lock().reset_all();
        let mut in_use = self.in_use.lock();
        *in_use = false;
        self.released.notify_one();
        info!(board = %self.name, minor = self.minor, "board released");
    }

    /// Whether a handle is open.
    pub fn is_open(&self) -> bool {
        *self.in_use.lock()
    }

    /// Acquire the use lock.
    pub fn lock(&self) -> MutexGuard<'_, BoardState> {
        self.state.lock()
    }

    /// Reset every subsystem.
    pub fn reset_all(&self) {
        self.lock().reset_all();
    }

    /// Interrupt service routine; call when the board raises its interrupt
    /// line. Returns the number of conditions handled.
    pub fn service_interrupt(&self) -> usize {
        self.irq.service()
    }

    /// Board name from the configuration.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Minor device number.
    pub fn minor(&self) -> u32 {
        self.minor
    }

    /// Register file with the hardware mirror.
    pub fn registers(&self) -> &Arc<RegisterFile> {
        &self.regs
    }

    /// Interrupt dispatch table.
    pub fn irq(&self) -> &Arc<IrqDispatch> {
        &self.irq
    }

    /// AI sample buffer.
    pub fn ai_dma(&self) -> &Arc<DmaChannel> {
        &self.ai_dma
    }

    /// AO sample buffer.
    pub fn ao_dma(&self) -> &Arc<DmaChannel> {
        &self.ao_dma
    }
}

impl std::fmt::Debug for Board {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Board")
            .field("name", &self.name)
            .field("minor", &self.minor)
            .field("in_use", &*self.in_use.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::Register;
    use crate::sim::SimulatedBus;
    use std::thread;

    fn board() -> (Arc<SimulatedBus>, Arc<Board>) {
        let bus = Arc::new(SimulatedBus::new());
        let config = DriverConfig::default();
        let board = Board::new(0, &config.boards[0], &config, bus.clone());
        (bus, Arc::new(board))
    }

    #[test]
    fn test_new_board_is_reset() {
        let (bus, board) = board();
        assert_eq!(bus.register_value(Register::InterruptControl), 0);
        assert_eq!(bus.register_value(Register::IoBidirectionPin), 0);
        assert!(!board.is_open());
    }

    #[test]
    fn test_nonblocking_claim_is_exclusive() {
        let (_bus, board) = board();
        let signal = SignalToken::new();
        board.claim(true, &signal).unwrap();
        assert!(matches!(
            board.claim(true, &signal),
            Err(StcError::Busy { .. })
        ));
        board.release_claim();
        board.claim(true, &signal).unwrap();
    }

    #[test]
    fn test_blocking_claim_waits_for_release() {
        let (_bus, board) = board();
        board.claim(true, &SignalToken::new()).unwrap();

        let releaser = {
            let board = board.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                board.release_claim();
            })
        };
        board.claim(false, &SignalToken::new()).unwrap();
        releaser.join().unwrap();
        assert!(board.is_open());
    }

    #[test]
    fn test_blocking_claim_interrupted() {
        let (_bus, board) = board();
        board.claim(false, &SignalToken::new()).unwrap();
        let signal = SignalToken::new();
        signal.raise();
        assert_eq!(
            board.claim(false, &signal).unwrap_err(),
            StcError::RestartSys
        );
        assert!(!signal.is_pending());
    }
}
