//! General-purpose counter/timer subsystem.
//!
//! Two 24-bit counters, G0 and G1, used for event counting, gated counting
//! and single or continuous pulse generation.
//!
//! ```text
//! Disarmed ──start_counting──▶ Counting ──disarm / TC stop──▶ Disarmed
//! Disarmed ──start_pulses────▶ PulsingDelay ──first TC──▶ PulsingSteady ──▶ Disarmed
//!              (delay_start: stays Disarmed until arm())
//! ```
//!
//! All parameters are validated before the first register write, so a
//! rejected request leaves the hardware untouched.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use tracing::{debug, info, trace, warn};

use crate::config::CounterReadPolicy;
use crate::error::{Result, StcError};
use crate::irq::{IrqDispatch, IrqHandler, IrqId};
use crate::pfi::{PfiTable, PinSelect, PinState, Subsystem};
use crate::registers::bits::{analog_trigger_etc, clock_and_fout, g_command, joint_reset, joint_status};
use crate::registers::{CounterId, Register, RegisterFile};
use crate::signals::{InputSignal, Polarity};
use crate::wait::{SignalToken, WaitQueue};

/// Smallest legal high/low/delay period in ticks.
pub const MIN_TICKS: u32 = 2;
/// Largest value a 24-bit load register holds.
pub const MAX_TICKS: u32 = 0x00FF_FFFF;

bitflags! {
    /// Counter mode register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct GMode: u32 {
        /// Count only while the gate is active
        const GATING_LEVEL = 1 << 0;
        /// Synchronise the gate to the source
        const GATE_SYNC = 1 << 1;
        /// Count up instead of down
        const COUNT_UP = 1 << 2;
        /// Load the count on the first gate/source edge
        const LOAD_ON_FIRST = 1 << 3;
        /// Reload from the load register on terminal count
        const LOADING_ON_TC = 1 << 4;
        /// Alternate between load registers A and B on each reload
        const RELOAD_SOURCE_SWITCHING = 1 << 5;
        /// Toggle the output on terminal count
        const OUTPUT_TOGGLE_ON_TC = 1 << 6;
        /// Disarm on the second terminal count
        const STOP_ON_SECOND_TC = 1 << 7;
        /// Load from register B instead of A
        const LOAD_SOURCE_B = 1 << 8;
        /// Count falling source edges
        const INVERT_SOURCE = 1 << 9;
        /// Gate is active low
        const INVERT_GATE = 1 << 10;
        /// Output idles high
        const INVERT_OUTPUT = 1 << 11;
    }
}

impl GMode {
    fn from_polarity(polarity: Polarity) -> Self {
        let mut mode = GMode::empty();
        mode.set(GMode::INVERT_SOURCE, polarity.contains(Polarity::INVERT_SOURCE));
        mode.set(GMode::INVERT_GATE, polarity.contains(Polarity::INVERT_GATE));
        mode.set(GMode::INVERT_OUTPUT, polarity.contains(Polarity::INVERT_OUTPUT));
        mode
    }
}

/// Observable counter phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterPhase {
    /// Not armed
    Disarmed,
    /// Armed as an event counter
    Counting,
    /// Armed as a pulse generator, initial delay still running
    PulsingDelay,
    /// Armed as a pulse generator, emitting pulses
    PulsingSteady,
}

/// What a counter was last programmed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CounterKind {
    /// Not configured since the last reset
    #[default]
    Idle,
    /// Event counting
    Counting,
    /// Pulse generation
    Pulsing {
        /// Free-running (true) or single pulse (false)
        continuous: bool,
    },
}

/// Shadow state of one counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterState {
    /// Programmed function
    pub kind: CounterKind,
    /// Last mode written
    pub mode: GMode,
    /// Last value written to load register A
    pub load_a: u32,
    /// Last value written to load register B
    pub load_b: u32,
    /// Whether the driver armed the counter and has not disarmed it since
    pub armed: bool,
}

/// Event counting request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountingSetup {
    /// Signal whose edges are counted
    pub source: InputSignal,
    /// Optional level gate
    pub gate: Option<InputSignal>,
    /// Source/gate polarity
    pub polarity: Polarity,
}

/// Pulse generation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PulseSetup {
    /// Timebase the tick counts refer to
    pub source: InputSignal,
    /// Optional level gate
    pub gate: Option<InputSignal>,
    /// Low phase in ticks
    pub low_ticks: u32,
    /// High phase in ticks
    pub high_ticks: u32,
    /// Delay before the first edge (raised to 2 if smaller)
    pub delay_ticks: u32,
    /// Polarities
    pub polarity: Polarity,
    /// Free-running pulse train instead of a single pulse
    pub continuous: bool,
    /// Leave the counter disarmed until an explicit [`Gpct::arm`]
    pub delay_start: bool,
}

impl PulseSetup {
    /// Continuous train on the 20 MHz timebase, starting immediately.
    pub fn new(low_ticks: u32, high_ticks: u32) -> Self {
        Self {
            source: InputSignal::Timebase1,
            gate: None,
            low_ticks,
            high_ticks,
            delay_ticks: MIN_TICKS,
            polarity: Polarity::empty(),
            continuous: true,
            delay_start: false,
        }
    }
}

struct CounterSlot {
    state: CounterState,
    queue: Arc<WaitQueue>,
    tc_events: Arc<AtomicU32>,
}

/// The GPCT subsystem of one board.
pub struct Gpct {
    regs: Arc<RegisterFile>,
    irq: Arc<IrqDispatch>,
    slots: [CounterSlot; 2],
    read_policy: CounterReadPolicy,
}

fn owner(counter: CounterId) -> Subsystem {
    match counter {
        CounterId::G0 => Subsystem::Gpct0,
        CounterId::G1 => Subsystem::Gpct1,
    }
}

fn armed_bit(counter: CounterId) -> u32 {
    match counter {
        CounterId::G0 => joint_status::G0_ARMED,
        CounterId::G1 => joint_status::G1_ARMED,
    }
}

fn output_enable_bit(counter: CounterId) -> u32 {
    match counter {
        CounterId::G0 => analog_trigger_etc::GPFO_0_OUTPUT_ENABLE,
        CounterId::G1 => analog_trigger_etc::GPFO_1_OUTPUT_ENABLE,
    }
}

fn validate_source(source: InputSignal) -> Result<InputSignal> {
    match source {
        InputSignal::OtherGout => Err(StcError::InvalidSignal {
            role: "source",
            code: source.code(),
        }),
        s if !s.is_wired() => Err(StcError::InvalidSignal {
            role: "source",
            code: s.code(),
        }),
        s => Ok(s),
    }
}

fn validate_gate(gate: InputSignal) -> Result<InputSignal> {
    match gate {
        // The 20 MHz timebase cannot be routed to a gate input
        InputSignal::Timebase1 => Err(StcError::InvalidSignal {
            role: "gate",
            code: gate.code(),
        }),
        g if !g.is_wired() => Err(StcError::InvalidSignal {
            role: "gate",
            code: g.code(),
        }),
        g => Ok(g),
    }
}

fn validate_ticks(what: &'static str, ticks: u32) -> Result<u32> {
    if (MIN_TICKS..=MAX_TICKS).contains(&ticks) {
        Ok(ticks)
    } else {
        Err(StcError::InvalidTicks {
            what,
            ticks,
            max: MAX_TICKS,
        })
    }
}

fn input_select(source: InputSignal, gate: Option<InputSignal>) -> u32 {
    (source.code() << 2) | (gate.map_or(0, InputSignal::code) << 7)
}

impl Gpct {
    /// Create the subsystem; call [`Gpct::reset_all`] before use.
    pub fn new(
        regs: Arc<RegisterFile>,
        irq: Arc<IrqDispatch>,
        read_policy: CounterReadPolicy,
        signal_poll: Duration,
    ) -> Self {
        let slot = || CounterSlot {
            state: CounterState::default(),
            queue: Arc::new(WaitQueue::new(signal_poll)),
            tc_events: Arc::new(AtomicU32::new(0)),
        };
        Self {
            regs,
            irq,
            slots: [slot(), slot()],
            read_policy,
        }
    }

    fn slot(&self, counter: CounterId) -> &CounterSlot {
        &self.slots[counter.index()]
    }

    fn slot_mut(&mut self, counter: CounterId) -> &mut CounterSlot {
        &mut self.slots[counter.index()]
    }

    fn tc_handler(&self, counter: CounterId) -> IrqHandler {
        let slot = self.slot(counter);
        let queue = slot.queue.clone();
        let events = slot.tc_events.clone();
        Arc::new(move || {
            events.fetch_add(1, Ordering::AcqRel);
            queue.wake_up_all();
        })
    }

    fn check_pins(
        pfi: &PfiTable,
        counter: CounterId,
        source: InputSignal,
        gate: Option<InputSignal>,
    ) -> Result<()> {
        pfi.check(owner(counter), source.into(), PinState::Input)?;
        if let Some(gate) = gate {
            pfi.check(owner(counter), gate.into(), PinState::Input)?;
        }
        Ok(())
    }

    fn claim_pins(
        pfi: &mut PfiTable,
        counter: CounterId,
        source: InputSignal,
        gate: Option<InputSignal>,
    ) -> Result<()> {
        pfi.setup(owner(counter), PinSelect::All, PinState::Unused)?;
        pfi.setup(owner(counter), source.into(), PinState::Input)?;
        if let Some(gate) = gate {
            pfi.setup(owner(counter), gate.into(), PinState::Input)?;
        }
        Ok(())
    }

    fn disarm_hw(&mut self, counter: CounterId) {
        self.regs
            .strobe(Register::GCommand(counter), g_command::DISARM);
        self.slot_mut(counter).state.armed = false;
    }

    fn arm_hw(&mut self, counter: CounterId, synchronize: bool) {
        let copy = if synchronize { g_command::ARM_COPY } else { 0 };
        self.regs
            .strobe(Register::GCommand(counter), g_command::ARM | copy);
        self.slot_mut(counter).state.armed = true;
        if synchronize {
            self.slot_mut(counter.other()).state.armed = true;
        }
    }

    /// Program `counter` as an up-counting event counter and arm it.
    pub fn start_counting(
        &mut self,
        pfi: &mut PfiTable,
        counter: CounterId,
        setup: CountingSetup,
    ) -> Result<()> {
        let source = validate_source(setup.source)?;
        let gate = setup.gate.map(validate_gate).transpose()?;
        Self::check_pins(pfi, counter, source, gate)?;

        self.irq.disable(IrqId::counter_tc(counter));
        self.disarm_hw(counter);
        Self::claim_pins(pfi, counter, source, gate)?;

        self.regs
            .write(Register::GInputSelect(counter), input_select(source, gate));
        self.regs.write(Register::GLoadA(counter), 0);
        self.regs.strobe(Register::GCommand(counter), g_command::LOAD);

        let mut mode = GMode::COUNT_UP | GMode::LOAD_ON_FIRST | GMode::from_polarity(setup.polarity);
        if gate.is_some() {
            mode |= GMode::GATING_LEVEL | GMode::GATE_SYNC;
        }
        self.regs.write(Register::GMode(counter), mode.bits());

        {
            let slot = self.slot_mut(counter);
            slot.state = CounterState {
                kind: CounterKind::Counting,
                mode,
                load_a: 0,
                load_b: 0,
                armed: false,
            };
            slot.tc_events.store(0, Ordering::Release);
        }
        self.arm_hw(counter, false);

        info!(counter = %counter, source = %source, gate = ?gate, "counter armed for counting");
        Ok(())
    }

    /// Program `counter` as a pulse generator.
    ///
    /// The delay count is loaded first so the first edge follows the initial
    /// delay; afterwards the counter alternates between load registers A
    /// (high phase) and B (low phase) on every terminal count.
    pub fn start_pulses(
        &mut self,
        pfi: &mut PfiTable,
        counter: CounterId,
        setup: PulseSetup,
    ) -> Result<()> {
        let low = validate_ticks("low", setup.low_ticks)?;
        let high = validate_ticks("high", setup.high_ticks)?;
        let delay = setup.delay_ticks.max(MIN_TICKS);
        validate_ticks("delay", delay)?;
        let source = validate_source(setup.source)?;
        let gate = setup.gate.map(validate_gate).transpose()?;
        Self::check_pins(pfi, counter, source, gate)?;

        self.irq.disable(IrqId::counter_tc(counter));
        self.disarm_hw(counter);
        Self::claim_pins(pfi, counter, source, gate)?;

        self.regs
            .write(Register::GInputSelect(counter), input_select(source, gate));

        self.regs.write(Register::GLoadA(counter), delay - 1);
        self.regs.strobe(Register::GCommand(counter), g_command::LOAD);
        self.regs.write(Register::GLoadA(counter), high - 1);
        self.regs.write(Register::GLoadB(counter), low - 1);

        let mut mode = GMode::LOADING_ON_TC
            | GMode::RELOAD_SOURCE_SWITCHING
            | GMode::OUTPUT_TOGGLE_ON_TC
            | GMode::from_polarity(setup.polarity);
        if !setup.continuous {
            mode |= GMode::STOP_ON_SECOND_TC;
        }
        if gate.is_some() {
            mode |= GMode::GATING_LEVEL | GMode::GATE_SYNC;
        }
        self.regs.write(Register::GMode(counter), mode.bits());
        self.regs
            .set_bits(Register::AnalogTriggerEtc, output_enable_bit(counter));

        {
            let slot = self.slot_mut(counter);
            slot.state = CounterState {
                kind: CounterKind::Pulsing {
                    continuous: setup.continuous,
                },
                mode,
                load_a: high - 1,
                load_b: low - 1,
                armed: false,
            };
            slot.tc_events.store(0, Ordering::Release);
        }
        self.irq
            .enable(IrqId::counter_tc(counter), self.tc_handler(counter));

        if setup.delay_start {
            debug!(counter = %counter, "pulse train programmed, waiting for arm");
        } else {
            self.arm_hw(counter, false);
            info!(counter = %counter, low, high, delay, continuous = setup.continuous, "pulse train armed");
        }
        Ok(())
    }

    /// Arm a programmed counter. With `synchronize_both` the partner counter
    /// is armed in the same register write.
    pub fn arm(&mut self, counter: CounterId, synchronize_both: bool) -> Result<()> {
        let mut targets = vec![counter];
        if synchronize_both {
            targets.push(counter.other());
        }
        for target in &targets {
            if self.slot(*target).state.kind == CounterKind::Idle {
                return Err(StcError::invalid(format!(
                    "counter {target} has not been programmed"
                )));
            }
        }
        for target in targets {
            self.slot(target).tc_events.store(0, Ordering::Release);
        }
        self.arm_hw(counter, synchronize_both);
        info!(counter = %counter, synchronize_both, "counter armed");
        Ok(())
    }

    /// Stop a counter and return its shadow state to the defaults.
    ///
    /// The counter must be programmed again before it can be re-armed.
    pub fn disarm(&mut self, counter: CounterId) {
        self.disarm_hw(counter);
        self.irq.disable(IrqId::counter_tc(counter));
        self.clear_slot(counter);
        debug!(counter = %counter, "counter disarmed");
    }

    fn clear_slot(&mut self, counter: CounterId) {
        let slot = self.slot_mut(counter);
        slot.state = CounterState {
            mode: GMode::GATE_SYNC,
            ..CounterState::default()
        };
        slot.tc_events.store(0, Ordering::Release);
    }

    /// Read the count of `counter`.
    ///
    /// With `wait_for_end` the counter is assumed to be gated by a single
    /// pulse from the partner counter: the call sleeps until the partner has
    /// stopped, disarms both counters and reads the save-on-halt register.
    /// Otherwise the live save register is sampled according to the
    /// [`CounterReadPolicy`].
    pub fn get_count(
        &mut self,
        counter: CounterId,
        wait_for_end: bool,
        signal: &SignalToken,
    ) -> Result<u32> {
        if !wait_for_end {
            return Ok(self.read_live(counter));
        }

        let other = counter.other();
        let tc = IrqId::counter_tc(other);
        let installed_here = !self.irq.is_enabled(tc);
        if installed_here {
            self.irq.enable(tc, self.tc_handler(other));
        }

        let queue = self.slot(other).queue.clone();
        let regs = self.regs.clone();
        let result = queue.wait_event_interruptible(
            || regs.read(Register::JointStatus1) & armed_bit(other) == 0,
            signal,
        );

        if installed_here {
            self.irq.disable(tc);
        }
        result?;

        self.disarm(counter);
        self.disarm(other);
        let count = self.regs.read(Register::GHwSave(counter));
        debug!(counter = %counter, count, "count read after halt");
        Ok(count)
    }

    fn read_live(&self, counter: CounterId) -> u32 {
        let command = Register::GCommand(counter);
        self.regs.clear_bits(command, g_command::SAVE_TRACE);
        self.regs.set_bits(command, g_command::SAVE_TRACE);

        let save = Register::GSave(counter);
        let mut last = self.regs.read(save);
        for _ in 1..self.read_policy.max_save_reads {
            let next = self.regs.read(save);
            if next == last {
                return next;
            }
            warn!(counter = %counter, first = last, second = next, "save register reads disagreed");
            last = next;
        }
        last
    }

    /// Hardware armed status of `counter`.
    pub fn is_busy(&self, counter: CounterId) -> bool {
        self.regs.read(Register::JointStatus1) & armed_bit(counter) != 0
    }

    /// Current phase of `counter`.
    pub fn phase(&self, counter: CounterId) -> CounterPhase {
        if !self.is_busy(counter) {
            return CounterPhase::Disarmed;
        }
        let slot = self.slot(counter);
        match slot.state.kind {
            CounterKind::Counting => CounterPhase::Counting,
            CounterKind::Pulsing { .. } if slot.tc_events.load(Ordering::Acquire) == 0 => {
                CounterPhase::PulsingDelay
            }
            CounterKind::Pulsing { .. } => CounterPhase::PulsingSteady,
            CounterKind::Idle => CounterPhase::Disarmed,
        }
    }

    /// Shadow state of `counter`.
    pub fn state(&self, counter: CounterId) -> CounterState {
        self.slot(counter).state
    }

    /// Shadow values of load registers A and B.
    pub fn load_registers(&self, counter: CounterId) -> (u32, u32) {
        let state = &self.slot(counter).state;
        (state.load_a, state.load_b)
    }

    /// Return both counters to the power-on state.
    pub fn reset_all(&mut self, pfi: &mut PfiTable) {
        self.regs.strobe(
            Register::JointReset,
            joint_reset::G0_RESET | joint_reset::G1_RESET,
        );

        for counter in CounterId::ALL {
            for id in [IrqId::counter_gate(counter), IrqId::counter_tc(counter)] {
                self.irq.disable(id);
                self.irq.acknowledge(id);
            }
            self.regs
                .write(Register::GMode(counter), GMode::GATE_SYNC.bits());
            self.regs.write(Register::GInputSelect(counter), 0);
            self.regs.write(Register::GDmaConfig(counter), 0);
            self.regs.write(Register::GAutoIncrement(counter), 0);
            self.regs
                .clear_bits(Register::GCommand(counter), g_command::SAVE_TRACE);

            if let Err(err) = pfi.setup(owner(counter), PinSelect::All, PinState::Unused) {
                trace!(counter = %counter, error = %err, "PFI release during reset");
            }

            self.clear_slot(counter);
        }

        self.regs.clear_bits(
            Register::AnalogTriggerEtc,
            analog_trigger_etc::GPFO_0_OUTPUT_ENABLE | analog_trigger_etc::GPFO_1_OUTPUT_ENABLE,
        );
        self.regs
            .clear_bits(Register::ClockAndFout, clock_and_fout::G_SOURCE_DIVIDE_BY_2);
        debug!("GPCT reset");
    }
}

impl std::fmt::Debug for Gpct {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gpct")
            .field("g0", &self.slots[0].state)
            .field("g1", &self.slots[1].state)
            .field("read_policy", &self.read_policy)
            .finish()
    }
}
