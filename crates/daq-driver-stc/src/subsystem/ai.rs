//! Analog input acquisition.
//!
//! ```text
//! Unconfigured ──setup──▶ Configured ──start / first read──▶ Running
//!      ▲                                                      │ SC_TC or stop
//!      └──────────── final read drains the buffer ◀── Finished ┘
//! ```
//!
//! Scans land in the AI [`DmaChannel`]; the SC_TC interrupt marks the end of
//! a finite acquisition. The STOP interrupt (one per scan) is only enabled by
//! readers while they are blocked, see [`crate::fops`].

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::dma::DmaChannel;
use crate::error::{Result, StcError};
use crate::irq::{IrqDispatch, IrqId};
use crate::pfi::{PfiTable, PinSelect, PinState, Subsystem};
use crate::registers::bits::acq_command;
use crate::registers::{Register, RegisterFile};
use crate::signals::InputSignal;
use crate::subsystem::gpct::{MAX_TICKS, MIN_TICKS};
use crate::wait::WaitQueue;

/// Entries in the scan list.
pub const MAX_AI_CHANNELS: usize = 16;

/// AiMode1: run until stopped instead of for a fixed scan count.
const MODE_CONTINUOUS: u32 = 1 << 1;
/// AiMode1: wait for an external start trigger.
const MODE_EXTERNAL_TRIGGER: u32 = 1 << 2;

/// Acquisition parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AiSetup {
    /// Scan list, channel numbers 0..=15
    pub channels: Vec<u8>,
    /// Scans to acquire; 0 runs until stopped
    pub num_scans: u32,
    /// Scan interval in 20 MHz ticks
    pub scan_interval_ticks: u32,
    /// External start trigger; `None` starts on the software command
    pub start_trigger: Option<InputSignal>,
}

impl AiSetup {
    fn validate(&self) -> Result<()> {
        if self.channels.is_empty() || self.channels.len() > MAX_AI_CHANNELS {
            return Err(StcError::invalid(format!(
                "scan list must hold 1..={MAX_AI_CHANNELS} channels, got {}",
                self.channels.len()
            )));
        }
        if let Some(&bad) = self
            .channels
            .iter()
            .find(|&&c| usize::from(c) >= MAX_AI_CHANNELS)
        {
            return Err(StcError::invalid(format!("AI channel {bad} does not exist")));
        }
        if !(MIN_TICKS..=MAX_TICKS).contains(&self.scan_interval_ticks) {
            return Err(StcError::InvalidTicks {
                what: "scan interval",
                ticks: self.scan_interval_ticks,
                max: MAX_TICKS,
            });
        }
        match self.start_trigger {
            Some(trigger)
                if !trigger.is_wired()
                    || matches!(
                        trigger,
                        InputSignal::Timebase1 | InputSignal::Timebase2 | InputSignal::OtherTc
                    ) =>
            {
                Err(StcError::InvalidSignal {
                    role: "AI start trigger",
                    code: trigger.code(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Samples one full acquisition produces (`None` when continuous).
    pub fn total_samples(&self) -> Option<u64> {
        (self.num_scans != 0).then(|| u64::from(self.num_scans) * self.channels.len() as u64)
    }
}

/// Acquisition lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    /// No setup, or torn down after completion
    Unconfigured,
    /// Set up, not started
    Configured,
    /// Started, scans in progress
    Running,
    /// Completed or stopped; buffered data still readable
    Finished,
}

/// AI subsystem of one board.
#[derive(Debug)]
pub struct Acquisition {
    regs: Arc<RegisterFile>,
    irq: Arc<IrqDispatch>,
    dma: Arc<DmaChannel>,
    buffer_samples: usize,
    queue: Arc<WaitQueue>,
    setup: Option<AiSetup>,
    state: AcquisitionState,
}

impl Acquisition {
    /// `buffer_samples` is the DMA ring size requested at setup.
    pub fn new(
        regs: Arc<RegisterFile>,
        irq: Arc<IrqDispatch>,
        dma: Arc<DmaChannel>,
        buffer_samples: usize,
        signal_poll: Duration,
    ) -> Self {
        Self {
            regs,
            irq,
            dma,
            buffer_samples,
            queue: Arc::new(WaitQueue::new(signal_poll)),
            setup: None,
            state: AcquisitionState::Unconfigured,
        }
    }

    /// Program an acquisition. Replaces any finished or unstarted one.
    pub fn setup(&mut self, pfi: &mut PfiTable, setup: AiSetup) -> Result<()> {
        if self.state == AcquisitionState::Running {
            return Err(StcError::SubsystemBusy {
                subsystem: Subsystem::Ai,
            });
        }
        setup.validate()?;
        if let Some(trigger) = setup.start_trigger {
            pfi.check(Subsystem::Ai, trigger.into(), PinState::Input)?;
        }
        self.dma.allocate(self.buffer_samples)?;

        self.irq.disable(IrqId::AiScTc);
        self.irq.disable(IrqId::AiStop);
        pfi.setup(Subsystem::Ai, PinSelect::All, PinState::Unused)?;
        if let Some(trigger) = setup.start_trigger {
            pfi.setup(Subsystem::Ai, trigger.into(), PinState::Input)?;
        }

        let mut mode = 0;
        if setup.num_scans == 0 {
            mode |= MODE_CONTINUOUS;
        }
        if setup.start_trigger.is_some() {
            mode |= MODE_EXTERNAL_TRIGGER;
        }
        self.regs.write(Register::AiMode1, mode);
        self.regs
            .write(Register::AiChannelCount, setup.channels.len() as u32);
        self.regs
            .write(Register::AiScanInterval, setup.scan_interval_ticks);
        self.regs.write(Register::AiScanCount, setup.num_scans);
        self.regs.write(
            Register::AiTriggerSelect,
            setup.start_trigger.map_or(0, InputSignal::code),
        );

        debug!(
            channels = setup.channels.len(),
            scans = setup.num_scans,
            interval = setup.scan_interval_ticks,
            trigger = ?setup.start_trigger,
            "AI configured"
        );
        self.setup = Some(setup);
        self.state = AcquisitionState::Configured;
        Ok(())
    }

    /// Start the configured acquisition. A no-op while running.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            AcquisitionState::Unconfigured => {
                return Err(StcError::NotConfigured {
                    subsystem: Subsystem::Ai,
                })
            }
            AcquisitionState::Running => return Ok(()),
            AcquisitionState::Configured | AcquisitionState::Finished => {}
        }

        let queue = self.queue.clone();
        self.irq
            .enable(IrqId::AiScTc, Arc::new(move || queue.wake_up_all()));
        self.regs.strobe(
            Register::AiCommand1,
            acq_command::ARM | acq_command::START,
        );
        self.state = AcquisitionState::Running;
        info!(
            scans = self.setup.as_ref().map_or(0, |s| s.num_scans),
            "AI acquisition started"
        );
        Ok(())
    }

    /// Stop a running acquisition. Buffered samples remain readable.
    pub fn stop(&mut self) {
        if self.state != AcquisitionState::Running {
            return;
        }
        self.regs
            .strobe(Register::AiCommand1, acq_command::DISARM);
        self.irq.disable(IrqId::AiStop);
        self.irq.disable(IrqId::AiScTc);
        self.state = AcquisitionState::Finished;
        self.queue.wake_up_all();
        info!(buffered = self.dma.available(), "AI acquisition stopped");
    }

    /// Fold a latched SC_TC into the state and report whether the
    /// acquisition has ended.
    pub fn check_complete(&mut self) -> bool {
        if self.state == AcquisitionState::Running && self.irq.is_raised(IrqId::AiScTc) {
            self.irq.disable(IrqId::AiScTc);
            self.state = AcquisitionState::Finished;
            info!(buffered = self.dma.available(), "AI acquisition complete");
        }
        self.state == AcquisitionState::Finished
    }

    /// Release everything the acquisition holds and return to
    /// [`AcquisitionState::Unconfigured`].
    pub fn teardown(&mut self, pfi: &mut PfiTable) {
        if self.state == AcquisitionState::Running {
            self.regs
                .strobe(Register::AiCommand1, acq_command::DISARM);
        }
        self.irq.disable(IrqId::AiStop);
        self.irq.disable(IrqId::AiScTc);
        self.dma.shutdown();
        if let Err(err) = pfi.setup(Subsystem::Ai, PinSelect::All, PinState::Unused) {
            debug!(error = %err, "AI pin release failed");
        }
        self.setup = None;
        self.state = AcquisitionState::Unconfigured;
        debug!("AI torn down");
    }

    /// Return to the power-on state.
    pub fn reset_all(&mut self, pfi: &mut PfiTable) {
        self.teardown(pfi);
        self.regs
            .strobe(Register::AiCommand1, acq_command::DISARM);
        self.regs.write(Register::AiMode1, 0);
        self.regs.write(Register::AiScanCount, 0);
        self.regs.write(Register::AiTriggerSelect, 0);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    /// Whether a read has something to work with.
    pub fn is_configured(&self) -> bool {
        self.state != AcquisitionState::Unconfigured
    }

    /// Active setup.
    pub fn current_setup(&self) -> Option<&AiSetup> {
        self.setup.as_ref()
    }

    /// Queue woken by SC_TC and STOP.
    pub fn queue(&self) -> &Arc<WaitQueue> {
        &self.queue
    }

    /// Sample buffer.
    pub fn dma(&self) -> &Arc<DmaChannel> {
        &self.dma
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedBus;

    struct Fixture {
        bus: Arc<SimulatedBus>,
        pfi: PfiTable,
        ai: Acquisition,
    }

    fn fixture() -> Fixture {
        let bus = Arc::new(SimulatedBus::new());
        let regs = Arc::new(RegisterFile::new(bus.clone()));
        let irq = Arc::new(IrqDispatch::new(regs.clone()));
        let dma = Arc::new(DmaChannel::new(Subsystem::Ai));
        Fixture {
            bus,
            pfi: PfiTable::new(regs.clone()),
            ai: Acquisition::new(regs, irq, dma, 64, Duration::from_millis(5)),
        }
    }

    fn scans(n: u32) -> AiSetup {
        AiSetup {
            channels: vec![0, 3],
            num_scans: n,
            scan_interval_ticks: 2000,
            start_trigger: None,
        }
    }

    #[test]
    fn test_setup_programs_scan_engine() {
        let mut f = fixture();
        f.ai.setup(&mut f.pfi, scans(10)).unwrap();
        assert_eq!(f.ai.state(), AcquisitionState::Configured);
        assert_eq!(f.bus.register_value(Register::AiChannelCount), 2);
        assert_eq!(f.bus.register_value(Register::AiScanCount), 10);
        assert_eq!(f.ai.dma().capacity(), 64);
        assert_eq!(scans(10).total_samples(), Some(20));
        assert_eq!(scans(0).total_samples(), None);
    }

    #[test]
    fn test_invalid_setups_rejected() {
        let mut f = fixture();
        let mut bad = scans(1);
        bad.channels = vec![];
        assert!(f.ai.setup(&mut f.pfi, bad).is_err());

        let mut bad = scans(1);
        bad.channels = vec![16];
        assert!(f.ai.setup(&mut f.pfi, bad).is_err());

        let mut bad = scans(1);
        bad.scan_interval_ticks = 1;
        assert!(matches!(
            f.ai.setup(&mut f.pfi, bad),
            Err(StcError::InvalidTicks { .. })
        ));

        let mut bad = scans(1);
        bad.start_trigger = Some(InputSignal::Timebase1);
        assert!(f.ai.setup(&mut f.pfi, bad).is_err());

        assert!(f.bus.writes().is_empty());
        assert!(!f.ai.is_configured());
    }

    #[test]
    fn test_trigger_pin_is_claimed() {
        let mut f = fixture();
        let mut setup = scans(1);
        setup.start_trigger = Some(InputSignal::Pfi(0));
        f.ai.setup(&mut f.pfi, setup).unwrap();
        assert_eq!(f.pfi.owned_by(Subsystem::Ai), vec![0]);

        f.ai.teardown(&mut f.pfi);
        assert!(f.pfi.owned_by(Subsystem::Ai).is_empty());
        assert!(!f.ai.dma().is_allocated());
    }

    #[test]
    fn test_setup_while_running_is_busy() {
        let mut f = fixture();
        f.ai.setup(&mut f.pfi, scans(5)).unwrap();
        f.ai.start().unwrap();
        assert!(f.bus.ai_running());
        let err = f.ai.setup(&mut f.pfi, scans(5)).unwrap_err();
        assert!(err.is_busy());
    }

    #[test]
    fn test_oversized_buffer_is_einval() {
        let bus = Arc::new(SimulatedBus::new());
        let regs = Arc::new(RegisterFile::new(bus.clone()));
        let irq = Arc::new(IrqDispatch::new(regs.clone()));
        let dma = Arc::new(DmaChannel::new(Subsystem::Ai));
        let mut pfi = PfiTable::new(regs.clone());
        let mut ai = Acquisition::new(regs, irq, dma, usize::MAX / 2 + 2, Duration::from_millis(5));

        let err = ai.setup(&mut pfi, scans(3)).unwrap_err();
        assert_eq!(err.errno(), -crate::error::EINVAL);
        assert_eq!(ai.state(), AcquisitionState::Unconfigured);
        assert!(!ai.dma().is_allocated());
        assert_eq!(bus.last_write(Register::AiScanCount), None);
    }

    #[test]
    fn test_sc_tc_completes() {
        let mut f = fixture();
        f.ai.setup(&mut f.pfi, scans(1)).unwrap();
        f.ai.start().unwrap();
        assert!(!f.ai.check_complete());

        f.bus.ai_complete_scan();
        f.ai.irq.service();
        assert!(f.ai.check_complete());
        assert_eq!(f.ai.state(), AcquisitionState::Finished);
        assert!(!f.ai.irq.is_enabled(IrqId::AiScTc));
    }

    #[test]
    fn test_start_requires_setup() {
        let mut f = fixture();
        assert_eq!(
            f.ai.start().unwrap_err(),
            StcError::NotConfigured {
                subsystem: Subsystem::Ai
            }
        );
    }

    #[test]
    fn test_stop_keeps_buffered_data() {
        let mut f = fixture();
        f.ai.setup(&mut f.pfi, scans(0)).unwrap();
        f.ai.start().unwrap();
        f.ai.dma().put(&[1, 2, 3]);
        f.ai.stop();
        assert!(!f.bus.ai_running());
        assert_eq!(f.ai.state(), AcquisitionState::Finished);
        assert_eq!(f.ai.dma().available(), 3);
    }
}
