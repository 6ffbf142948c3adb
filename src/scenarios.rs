//! Canned measurements against simulated boards.
//!
//! Each scenario talks to the driver exactly as a userspace client would:
//! open the device file, program it via ioctl, read samples, release. The
//! [`SimulatedBus`] stands in for the hardware side (edges, terminal counts,
//! scan completions).
//!
//! All scenarios block; call them from `spawn_blocking` in async code.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use daq_driver_stc::fops::{DeviceFile, OpenFlags};
use daq_driver_stc::ioctl::{AiArg, Command, GpctArg, GpctFlags, IoctlArg};
use daq_driver_stc::sim::{sample_value, AcquisitionSimulator, SimulatedBus};
use daq_driver_stc::subsystem::ai::MAX_AI_CHANNELS;
use daq_driver_stc::subsystem::msc::FoutTimebase;
use daq_driver_stc::subsystem::CounterPhase;
use daq_driver_stc::wait::SignalToken;
use daq_driver_stc::{CounterId, Driver, DriverConfig, InputSignal, StcError};
use tracing::{debug, info, instrument};

use crate::error::{AppError, AppResult};

/// Longest real-time wait used to stand in for a gate pulse.
const MAX_SIMULATED_GATE: Duration = Duration::from_millis(200);

/// A driver whose boards all sit on simulated buses.
#[derive(Debug)]
pub struct SimulatedRig {
    driver: Driver,
    buses: Vec<Arc<SimulatedBus>>,
    signal: SignalToken,
}

impl SimulatedRig {
    /// Load a driver with one simulated bus per configured board.
    pub fn new(config: DriverConfig) -> AppResult<Self> {
        let (driver, buses) = Driver::simulated(config)?;
        Ok(Self {
            driver,
            buses,
            signal: SignalToken::new(),
        })
    }

    /// The driver under test.
    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    /// Bus behind board `minor`.
    pub fn bus(&self, minor: u32) -> AppResult<&Arc<SimulatedBus>> {
        self.buses
            .get(minor as usize)
            .ok_or(AppError::Driver(StcError::NoDevice { minor }))
    }

    /// Token that interrupts blocked scenario calls when raised.
    pub fn signal(&self) -> &SignalToken {
        &self.signal
    }

    fn open(&self, minor: u32, flags: OpenFlags) -> AppResult<DeviceFile> {
        Ok(self.driver.open(minor, flags, &self.signal)?)
    }
}

fn gpct_ioctl(file: &DeviceFile, command: Command, arg: GpctArg) -> AppResult<GpctArg> {
    let mut wrapped = IoctlArg::Gpct(arg);
    file.ioctl(command.code(), &mut wrapped)?;
    match wrapped {
        IoctlArg::Gpct(out) => Ok(out),
        other => Err(AppError::scenario(
            "gpct",
            format!("ioctl returned {other:?}"),
        )),
    }
}

fn counter_arg(counter: CounterId) -> GpctArg {
    GpctArg {
        counter: counter.index() as u32,
        source: InputSignal::Timebase1.code(),
        gate: GpctArg::NO_GATE,
        ..Default::default()
    }
}

/// Wall-clock stand-in for `ticks` of the 20 MHz timebase.
fn simulated_duration(ticks: u32) -> Duration {
    let nanos = u64::from(ticks) * 1_000_000_000 / u64::from(FoutTimebase::Fast.hz());
    Duration::from_nanos(nanos).min(MAX_SIMULATED_GATE)
}

// =============================================================================
// Event counting
// =============================================================================

/// Event counting request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountRequest {
    /// Board minor number
    pub minor: u32,
    /// Counter to use
    pub counter: CounterId,
    /// PFI pin carrying the edges
    pub source_pfi: u8,
    /// Edges the simulated signal produces
    pub edges: u32,
    /// Gate the count with a single pulse of this many ticks from the
    /// partner counter, then wait for it to end
    pub gate_ticks: Option<u32>,
}

/// Result of an event count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountReport {
    /// Counter that was read
    pub counter: CounterId,
    /// Edges counted
    pub count: u32,
    /// Whether the count was taken over a gate window
    pub gated: bool,
}

/// Count edges on a PFI pin, optionally over a gate window.
#[instrument(skip(rig), fields(counter = %request.counter))]
pub fn count_events(rig: &SimulatedRig, request: &CountRequest) -> AppResult<CountReport> {
    let bus = rig.bus(request.minor)?.clone();
    let file = rig.open(request.minor, OpenFlags::blocking())?;
    let counter = request.counter;
    let partner = counter.other();

    let counting = GpctArg {
        source: InputSignal::Pfi(request.source_pfi).code(),
        gate: if request.gate_ticks.is_some() {
            InputSignal::OtherGout.code()
        } else {
            GpctArg::NO_GATE
        },
        ..counter_arg(counter)
    };
    gpct_ioctl(&file, Command::GpctStartCounting, counting)?;
    bus.set_count(counter, request.edges);

    let count = match request.gate_ticks {
        None => {
            let out = gpct_ioctl(&file, Command::GpctGetCount, counter_arg(counter))?;
            gpct_ioctl(&file, Command::GpctDisarm, counter_arg(counter))?;
            out.count
        }
        Some(ticks) => {
            let gate = GpctArg {
                low_ticks: 2,
                high_ticks: ticks,
                ..counter_arg(partner)
            };
            gpct_ioctl(&file, Command::GpctStartPulses, gate)?;

            // First TC opens the gate, second closes it
            let board = file.board().clone();
            let window = simulated_duration(ticks);
            let hardware = {
                let bus = bus.clone();
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(1));
                    bus.counter_terminal_count(partner);
                    board.service_interrupt();
                    thread::sleep(window);
                    bus.counter_terminal_count(partner);
                    board.service_interrupt();
                })
            };

            let arg = GpctArg {
                flags: GpctFlags::WAIT_FOR_END.bits(),
                ..counter_arg(counter)
            };
            let result = gpct_ioctl(&file, Command::GpctGetCount, arg);
            if hardware.join().is_err() {
                return Err(AppError::scenario("count", "gate thread panicked"));
            }
            result?.count
        }
    };

    info!(count, gated = request.gate_ticks.is_some(), "count complete");
    file.release();
    Ok(CountReport {
        counter,
        count,
        gated: request.gate_ticks.is_some(),
    })
}

// =============================================================================
// Pulse generation
// =============================================================================

/// Pulse generation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulseRequest {
    /// Board minor number
    pub minor: u32,
    /// Counter to use
    pub counter: CounterId,
    /// Low phase in ticks
    pub low_ticks: u32,
    /// High phase in ticks
    pub high_ticks: u32,
    /// Delay before the first pulse
    pub delay_ticks: u32,
    /// Free-running train instead of a single pulse
    pub continuous: bool,
    /// Program disarmed, then arm explicitly
    pub delay_start: bool,
    /// Terminal counts to simulate after arming
    pub tc_events: u32,
}

/// Phases observed while generating pulses.
#[derive(Debug, Clone, PartialEq)]
pub struct PulseReport {
    /// Counter that generated the pulses
    pub counter: CounterId,
    /// Pulse train frequency on the 20 MHz timebase
    pub frequency_hz: f64,
    /// Phase after programming, after arming, then after each TC
    pub phases: Vec<CounterPhase>,
    /// Load registers as programmed (A = high - 1, B = low - 1)
    pub load_registers: (u32, u32),
    /// Whether the counter was still armed after the last TC
    pub armed_at_end: bool,
}

/// Program a pulse train and step it through simulated terminal counts.
#[instrument(skip(rig), fields(counter = %request.counter))]
pub fn generate_pulses(rig: &SimulatedRig, request: &PulseRequest) -> AppResult<PulseReport> {
    let bus = rig.bus(request.minor)?;
    let file = rig.open(request.minor, OpenFlags::nonblocking())?;
    let counter = request.counter;
    let phase = |file: &DeviceFile| file.board().lock().gpct.phase(counter);

    let mut flags = GpctFlags::empty();
    flags.set(GpctFlags::CONTINUOUS, request.continuous);
    flags.set(GpctFlags::DELAY_START, request.delay_start);
    let arg = GpctArg {
        low_ticks: request.low_ticks,
        high_ticks: request.high_ticks,
        delay_ticks: request.delay_ticks,
        flags: flags.bits(),
        ..counter_arg(counter)
    };
    gpct_ioctl(&file, Command::GpctStartPulses, arg)?;

    let mut phases = vec![phase(&file)];
    if request.delay_start {
        gpct_ioctl(&file, Command::GpctArm, counter_arg(counter))?;
    }
    phases.push(phase(&file));

    for _ in 0..request.tc_events {
        bus.counter_terminal_count(counter);
        file.board().service_interrupt();
        phases.push(phase(&file));
    }
    debug!(?phases, "pulse phases");

    let load_registers = file.board().lock().gpct.load_registers(counter);
    let armed_at_end = gpct_ioctl(&file, Command::GpctIsBusy, counter_arg(counter))?.armed != 0;
    file.release();

    let period = u64::from(request.low_ticks) + u64::from(request.high_ticks);
    Ok(PulseReport {
        counter,
        frequency_hz: f64::from(FoutTimebase::Fast.hz()) / period as f64,
        phases,
        load_registers,
        armed_at_end,
    })
}

// =============================================================================
// Buffered acquisition
// =============================================================================

/// Buffered analog acquisition request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireRequest {
    /// Board minor number
    pub minor: u32,
    /// Channel numbers in scan order
    pub channels: Vec<u8>,
    /// Must be non-zero; a continuous acquisition never ends
    pub scans: u32,
    /// Ticks between scan starts
    pub scan_interval_ticks: u32,
    /// Simulated time between scans
    pub period: Duration,
    /// Bytes requested per read call
    pub read_chunk: usize,
}

/// Samples collected from an acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireReport {
    /// Samples in read order
    pub samples: Vec<u16>,
    /// Scans the simulated hardware completed
    pub scans_produced: u32,
    /// Read calls made, including the end-of-data read
    pub reads: usize,
}

/// Run a finite acquisition and read it back through the device file.
#[instrument(skip(rig, request), fields(minor = request.minor, scans = request.scans))]
pub fn acquire(rig: &SimulatedRig, request: &AcquireRequest) -> AppResult<AcquireReport> {
    if request.scans == 0 {
        return Err(AppError::Validation("scan count must be non-zero".into()));
    }
    if request.channels.is_empty() || request.channels.len() > MAX_AI_CHANNELS {
        return Err(AppError::Validation(format!(
            "between 1 and {MAX_AI_CHANNELS} channels required, got {}",
            request.channels.len()
        )));
    }
    if request.read_chunk < 2 {
        return Err(AppError::Validation("read chunk must hold a sample".into()));
    }

    let bus = rig.bus(request.minor)?.clone();
    let file = rig.open(request.minor, OpenFlags::blocking())?;

    let mut arg = AiArg {
        num_channels: request.channels.len() as u32,
        num_scans: request.scans,
        scan_interval_ticks: request.scan_interval_ticks,
        trigger: AiArg::NO_TRIGGER,
        ..Default::default()
    };
    arg.channels[..request.channels.len()].copy_from_slice(&request.channels);
    file.ioctl(Command::AiSetup.code(), &mut IoctlArg::Ai(arg))?;

    let simulator = AcquisitionSimulator::spawn(file.board().clone(), bus, request.period);
    let total = request.scans as usize * request.channels.len();
    let mut samples = Vec::with_capacity(total);
    let mut buf = vec![0u8; request.read_chunk & !1];
    let mut reads = 0;

    while samples.len() < total {
        let n = file.read(&mut buf)?;
        reads += 1;
        if n == 0 {
            break;
        }
        samples.extend(
            buf[..n]
                .chunks_exact(2)
                .map(|pair| u16::from_ne_bytes([pair[0], pair[1]])),
        );
    }
    // Drain the end-of-data read unless the last data read already tore down
    if file.board().ai_dma().is_allocated() {
        file.read(&mut buf)?;
        reads += 1;
    }
    let scans_produced = simulator.stop();
    file.release();

    if samples.len() != total {
        return Err(AppError::scenario(
            "acquire",
            format!("expected {total} samples, read {}", samples.len()),
        ));
    }
    let channels = request.channels.len() as u32;
    let mismatch = samples.iter().enumerate().find(|(i, &value)| {
        let i = *i as u32;
        value != sample_value(i / channels, i % channels, channels)
    });
    if let Some((index, value)) = mismatch {
        return Err(AppError::scenario(
            "acquire",
            format!("sample {index} out of sequence: {value}"),
        ));
    }

    info!(samples = samples.len(), reads, "acquisition complete");
    Ok(AcquireReport {
        samples,
        scans_produced,
        reads,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_duration_is_capped() {
        assert_eq!(simulated_duration(20_000), Duration::from_millis(1));
        assert_eq!(simulated_duration(u32::MAX), MAX_SIMULATED_GATE);
    }

    #[test]
    fn test_bad_minor() {
        let rig = SimulatedRig::new(DriverConfig::default()).unwrap();
        assert_eq!(rig.bus(4).unwrap_err().errno(), Some(-daq_driver_stc::error::ENODEV));
    }

    #[test]
    fn test_acquire_rejects_continuous() {
        let rig = SimulatedRig::new(DriverConfig::default()).unwrap();
        let request = AcquireRequest {
            minor: 0,
            channels: vec![0],
            scans: 0,
            scan_interval_ticks: 1000,
            period: Duration::from_millis(1),
            read_chunk: 64,
        };
        assert!(matches!(
            acquire(&rig, &request),
            Err(AppError::Validation(_))
        ));
    }
}
