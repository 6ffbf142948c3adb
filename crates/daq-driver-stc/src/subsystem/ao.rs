//! Analog output waveform generation.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::dma::DmaChannel;
use crate::error::{Result, StcError};
use crate::irq::{IrqDispatch, IrqId};
use crate::pfi::Subsystem;
use crate::registers::bits::acq_command;
use crate::registers::{Register, RegisterFile};
use crate::subsystem::gpct::{MAX_TICKS, MIN_TICKS};
use crate::wait::WaitQueue;

/// Number of DAC channels.
pub const AO_CHANNELS: u8 = 2;

const MODE_CONTINUOUS: u32 = 1 << 2;

/// Output parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AoSetup {
    /// Channels updated per update tick (1 or 2)
    pub channels: u8,
    /// Update interval in 20 MHz ticks
    pub update_interval_ticks: u32,
    /// Regenerate until stopped instead of stopping when the buffer drains
    pub continuous: bool,
}

/// Output lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    /// No setup
    Unconfigured,
    /// Buffer allocated, output idle
    Configured,
    /// Updating the DACs
    Running,
}

/// AO subsystem of one board.
#[derive(Debug)]
pub struct AnalogOutput {
    regs: Arc<RegisterFile>,
    irq: Arc<IrqDispatch>,
    dma: Arc<DmaChannel>,
    buffer_samples: usize,
    queue: Arc<WaitQueue>,
    setup: Option<AoSetup>,
    state: OutputState,
}

impl AnalogOutput {
    /// Create the subsystem; no buffer is allocated until setup.
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
            state: OutputState::Unconfigured,
        }
    }

    /// Program the update engine and allocate the output buffer.
    pub fn setup(&mut self, setup: AoSetup) -> Result<()> {
        if self.state == OutputState::Running {
            return Err(StcError::SubsystemBusy {
                subsystem: Subsystem::Ao,
            });
        }
        if !(1..=AO_CHANNELS).contains(&setup.channels) {
            return Err(StcError::invalid(format!(
                "AO channel count {} outside 1..={AO_CHANNELS}",
                setup.channels
            )));
        }
        if !(MIN_TICKS..=MAX_TICKS).contains(&setup.update_interval_ticks) {
            return Err(StcError::InvalidTicks {
                what: "update interval",
                ticks: setup.update_interval_ticks,
                max: MAX_TICKS,
            });
        }

        self.dma.allocate(self.buffer_samples)?;

        let mut mode = u32::from(setup.channels - 1);
        if setup.continuous {
            mode |= MODE_CONTINUOUS;
        }
        self.regs.write(Register::AoMode1, mode);
        self.regs
            .write(Register::AoUpdateInterval, setup.update_interval_ticks);

        debug!(channels = setup.channels, interval = setup.update_interval_ticks, "AO configured");
        self.setup = Some(setup);
        self.state = OutputState::Configured;
        Ok(())
    }

    /// Start updating the DACs from the buffer.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            OutputState::Unconfigured => Err(StcError::NotConfigured {
                subsystem: Subsystem::Ao,
            }),
            OutputState::Running => Ok(()),
            OutputState::Configured => {
                self.regs.strobe(
                    Register::AoCommand1,
                    acq_command::ARM | acq_command::START,
                );
                self.state = OutputState::Running;
                info!(buffered = self.dma.available(), "AO output started");
                Ok(())
            }
        }
    }

    /// Stop updating. The buffer and setup are kept.
    pub fn stop(&mut self) {
        if self.state == OutputState::Running {
            self.regs
                .strobe(Register::AoCommand1, acq_command::DISARM);
            self.irq.disable(IrqId::AoUpdate);
            self.state = OutputState::Configured;
            self.queue.wake_up_all();
            info!("AO output stopped");
        }
    }

    /// Stop output, free the buffer and forget the setup.
    pub fn reset_all(&mut self) {
        self.stop();
        self.irq.disable(IrqId::AoUpdate);
        self.regs
            .strobe(Register::AoCommand1, acq_command::DISARM);
        self.regs.write(Register::AoMode1, 0);
        self.dma.shutdown();
        self.setup = None;
        self.state = OutputState::Unconfigured;
    }

    /// Current output state.
    pub fn state(&self) -> OutputState {
        self.state
    }

    /// Whether a setup is in effect.
    pub fn is_configured(&self) -> bool {
        self.state != OutputState::Unconfigured
    }

    /// The setup in effect, if any.
    pub fn current_setup(&self) -> Option<AoSetup> {
        self.setup
    }

    /// Queue woken by AO_UPDATE while a writer waits for space.
    pub fn queue(&self) -> &Arc<WaitQueue> {
        &self.queue
    }

    /// Output sample buffer.
    pub fn dma(&self) -> &Arc<DmaChannel> {
        &self.dma
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedBus;

    fn output() -> (Arc<SimulatedBus>, AnalogOutput) {
        let bus = Arc::new(SimulatedBus::new());
        let regs = Arc::new(RegisterFile::new(bus.clone()));
        let irq = Arc::new(IrqDispatch::new(regs.clone()));
        let dma = Arc::new(DmaChannel::new(Subsystem::Ao));
        (
            bus,
            AnalogOutput::new(regs, irq, dma, 8, Duration::from_millis(5)),
        )
    }

    #[test]
    fn test_setup_and_start() {
        let (bus, mut ao) = output();
        ao.setup(AoSetup {
            channels: 2,
            update_interval_ticks: 200,
            continuous: true,
        })
        .unwrap();
        assert_eq!(bus.register_value(Register::AoMode1), 1 | MODE_CONTINUOUS);
        ao.start().unwrap();
        assert!(bus.ao_running());
        assert_eq!(ao.state(), OutputState::Running);

        ao.reset_all();
        assert!(!bus.ao_running());
        assert!(!ao.dma().is_allocated());
        assert!(!ao.is_configured());
    }

    #[test]
    fn test_rejects_bad_channels() {
        let (_bus, mut ao) = output();
        for channels in [0, 3] {
            assert!(ao
                .setup(AoSetup {
                    channels,
                    update_interval_ticks: 200,
                    continuous: false,
                })
                .is_err());
        }
        assert!(ao.start().is_err());
    }
}
