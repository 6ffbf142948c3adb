//! In-memory register bus with a minimal DAQ-STC hardware model.
//!
//! [`SimulatedBus`] stands in for a real board in tests and in the CLI. It
//! models just enough of the ASIC for the driver's protocols to be
//! observable: counters arm and disarm on command writes, acknowledge writes
//! clear latched interrupt conditions, and the AI/AO command registers start
//! and stop the acquisition engines. The most recent
//! [`WRITE_LOG_CAPACITY`] writes are logged.
//!
//! [`AcquisitionSimulator`] is the "hardware" side of an analog input
//! acquisition: a thread that produces scans into the AI DMA buffer and calls
//! the board's interrupt service routine, the way a notifier thread would
//! forward real interrupts in a userspace port.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::board::Board;
use crate::irq::{IrqGroup, IrqId};
use crate::registers::bits::{acq_command, g_command, joint_reset, joint_status};
use crate::registers::{CounterId, Register, RegisterBus};
use crate::subsystem::gpct::GMode;

/// Writes retained by the bus log; older entries are dropped first.
pub const WRITE_LOG_CAPACITY: usize = 4096;

#[derive(Debug, Default, Clone, Copy)]
struct SimCounter {
    armed: bool,
    value: u32,
    tc_events: u32,
}

#[derive(Debug, Default)]
struct SimState {
    regs: HashMap<Register, u32>,
    log: VecDeque<(Register, u32)>,
    scripted: HashMap<Register, VecDeque<u32>>,
    status: [u32; 2],
    counters: [SimCounter; 2],
    ai_running: bool,
    ai_scans: u32,
    ao_running: bool,
    dio_input: u32,
}

fn group_index(group: IrqGroup) -> usize {
    match group {
        IrqGroup::A => 0,
        IrqGroup::B => 1,
    }
}

impl SimState {
    fn apply(&mut self, reg: Register, value: u32) {
        match reg {
            Register::GCommand(counter) => {
                let i = counter.index();
                if value & g_command::DISARM != 0 {
                    self.counters[i].armed = false;
                }
                if value & g_command::LOAD != 0 {
                    self.counters[i].value =
                        self.regs.get(&Register::GLoadA(counter)).copied().unwrap_or(0);
                }
                if value & g_command::ARM != 0 {
                    let mut targets = vec![i];
                    if value & g_command::ARM_COPY != 0 {
                        targets.push(counter.other().index());
                    }
                    for t in targets {
                        self.counters[t].armed = true;
                        self.counters[t].tc_events = 0;
                    }
                }
            }
            Register::JointReset => {
                for (counter, bit) in [
                    (CounterId::G0, joint_reset::G0_RESET),
                    (CounterId::G1, joint_reset::G1_RESET),
                ] {
                    if value & bit != 0 {
                        self.counters[counter.index()] = SimCounter::default();
                    }
                }
            }
            Register::InterruptAAck | Register::InterruptBAck => {
                let group = if reg == Register::InterruptAAck {
                    IrqGroup::A
                } else {
                    IrqGroup::B
                };
                let cleared = IrqId::ALL
                    .iter()
                    .filter(|id| id.group() == group && value & id.bits().ack != 0)
                    .fold(0, |mask, id| mask | id.bits().status);
                self.status[group_index(group)] &= !cleared;
            }
            Register::AiCommand1 => {
                if value & acq_command::DISARM != 0 {
                    self.ai_running = false;
                }
                if value & acq_command::START != 0 {
                    self.ai_running = true;
                    self.ai_scans = 0;
                }
            }
            Register::AoCommand1 => {
                if value & acq_command::DISARM != 0 {
                    self.ao_running = false;
                }
                if value & acq_command::START != 0 {
                    self.ao_running = true;
                }
            }
            _ => {}
        }
    }

    fn read(&mut self, reg: Register) -> u32 {
        if let Some(value) = self.scripted.get_mut(&reg).and_then(VecDeque::pop_front) {
            return value;
        }
        match reg {
            Register::AiStatus1 => self.status[0],
            Register::AoStatus1 => self.status[1],
            Register::JointStatus1 => {
                let mut status = 0;
                if self.counters[0].armed {
                    status |= joint_status::G0_ARMED;
                }
                if self.counters[1].armed {
                    status |= joint_status::G1_ARMED;
                }
                status
            }
            Register::GSave(counter) | Register::GHwSave(counter) => {
                self.counters[counter.index()].value
            }
            Register::DioParallelInput => self.dio_input,
            other => self.regs.get(&other).copied().unwrap_or(0),
        }
    }

    fn assert_irq(&mut self, id: IrqId) {
        self.status[group_index(id.group())] |= id.bits().status;
    }
}

/// Simulated DAQ-STC register bus.
#[derive(Debug, Default)]
pub struct SimulatedBus {
    state: Mutex<SimState>,
}

impl SimulatedBus {
    /// A board in its power-on state.
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, reg: Register, value: u32) {
        let mut state = self.state.lock();
        if state.log.len() == WRITE_LOG_CAPACITY {
            state.log.pop_front();
        }
        state.log.push_back((reg, value));
        state.regs.insert(reg, value);
        state.apply(reg, value);
    }

    fn fetch(&self, reg: Register) -> u32 {
        self.state.lock().read(reg)
    }

    /// Last value written to `reg`, if any.
    pub fn last_write(&self, reg: Register) -> Option<u32> {
        self.state
            .lock()
            .log
            .iter()
            .rev()
            .find(|(r, _)| *r == reg)
            .map(|(_, v)| *v)
    }

    /// Logged writes since creation or the last [`Self::clear_log`], oldest
    /// first, bounded by [`WRITE_LOG_CAPACITY`].
    pub fn writes(&self) -> Vec<(Register, u32)> {
        self.state.lock().log.iter().copied().collect()
    }

    /// Number of logged writes to `reg`.
    pub fn write_count(&self, reg: Register) -> usize {
        self.state
            .lock()
            .log
            .iter()
            .filter(|(r, _)| *r == reg)
            .count()
    }

    /// Forget logged writes. Register contents are kept.
    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    /// Latch the status bit of `id`, as the hardware does when the condition
    /// occurs.
    pub fn assert_irq(&self, id: IrqId) {
        trace!(irq = ?id, "simulated condition asserted");
        self.state.lock().assert_irq(id);
    }

    /// Queue values returned by the next reads of `reg`, ahead of the model.
    pub fn script_reads(&self, reg: Register, values: &[u32]) {
        self.state
            .lock()
            .scripted
            .entry(reg)
            .or_default()
            .extend(values.iter().copied());
    }

    /// Set the live count of a counter.
    pub fn set_count(&self, counter: CounterId, value: u32) {
        self.state.lock().counters[counter.index()].value = value;
    }

    /// Hardware armed state of a counter.
    pub fn is_armed(&self, counter: CounterId) -> bool {
        self.state.lock().counters[counter.index()].armed
    }

    /// Simulate a terminal count on an armed counter.
    ///
    /// Latches the TC condition. A counter programmed to stop on the second
    /// TC disarms itself when that TC occurs.
    pub fn counter_terminal_count(&self, counter: CounterId) {
        let mut state = self.state.lock();
        let i = counter.index();
        if !state.counters[i].armed {
            return;
        }
        state.counters[i].tc_events += 1;
        state.assert_irq(IrqId::counter_tc(counter));

        let mode = GMode::from_bits_truncate(
            state.regs.get(&Register::GMode(counter)).copied().unwrap_or(0),
        );
        if mode.contains(GMode::STOP_ON_SECOND_TC) && state.counters[i].tc_events >= 2 {
            state.counters[i].armed = false;
            debug!(counter = %counter, "simulated counter stopped on second TC");
        }
    }

    /// Whether the AI start command is active.
    pub fn ai_running(&self) -> bool {
        self.state.lock().ai_running
    }

    /// Whether the AO start command is active.
    pub fn ao_running(&self) -> bool {
        self.state.lock().ao_running
    }

    /// Complete one AI scan: latches STOP, and SC_TC when the programmed scan
    /// count is reached (which also stops the engine).
    ///
    /// Returns the index of the completed scan and whether it was the last.
    pub fn ai_complete_scan(&self) -> (u32, bool) {
        let mut state = self.state.lock();
        let index = state.ai_scans;
        state.ai_scans += 1;
        state.assert_irq(IrqId::AiStop);

        let target = state.regs.get(&Register::AiScanCount).copied().unwrap_or(0);
        let finished = target != 0 && state.ai_scans >= target;
        if finished {
            state.ai_running = false;
            state.assert_irq(IrqId::AiScTc);
        }
        (index, finished)
    }

    /// Drive the DIO parallel input lines.
    pub fn set_dio_input(&self, value: u8) {
        self.state.lock().dio_input = u32::from(value);
    }

    /// Current register contents as the hardware sees them.
    pub fn register_value(&self, reg: Register) -> u32 {
        self.state.lock().regs.get(&reg).copied().unwrap_or(0)
    }

    /// Latch `id` and run the board's interrupt service routine.
    pub fn fire(&self, board: &Board, id: IrqId) -> usize {
        self.assert_irq(id);
        board.service_interrupt()
    }
}

impl RegisterBus for SimulatedBus {
    fn write16(&self, reg: Register, value: u16) {
        self.record(reg, u32::from(value));
    }

    fn write32(&self, reg: Register, value: u32) {
        self.record(reg, value);
    }

    fn read16(&self, reg: Register) -> u16 {
        self.fetch(reg) as u16
    }

    fn read32(&self, reg: Register) -> u32 {
        self.fetch(reg)
    }
}

/// Deterministic sample value for scan `scan`, channel slot `slot`.
pub fn sample_value(scan: u32, slot: u32, channels: u32) -> u16 {
    (scan.wrapping_mul(channels).wrapping_add(slot) & 0xFFFF) as u16
}

/// Background producer feeding a board's AI buffer from a [`SimulatedBus`].
#[derive(Debug)]
pub struct AcquisitionSimulator {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<u32>>,
}

impl AcquisitionSimulator {
    /// Start producing one scan every `period` while the AI engine runs.
    ///
    /// The board's service routine runs only when a scan latches a condition
    /// that has a handler installed, as a masked condition does not raise the
    /// interrupt line.
    ///
    /// AO samples are drained at the same rate while the AO engine runs.
    pub fn spawn(board: Arc<Board>, bus: Arc<SimulatedBus>, period: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::spawn(move || {
            let mut produced = 0u32;
            while !flag.load(Ordering::Acquire) {
                if bus.ai_running() {
                    let channels = bus.register_value(Register::AiChannelCount).max(1);
                    let (scan, finished) = bus.ai_complete_scan();
                    let samples: Vec<u16> = (0..channels)
                        .map(|slot| sample_value(scan, slot, channels))
                        .collect();
                    let stored = board.ai_dma().put(&samples);
                    if stored < samples.len() {
                        debug!(board = board.name(), scan, "simulated AI buffer overflow");
                    }
                    if board.irq().pending() {
                        board.service_interrupt();
                    }
                    produced += 1;
                    if finished {
                        debug!(board = board.name(), scans = produced, "simulated acquisition finished");
                    }
                }
                if bus.ao_running() {
                    let mut sink = [0u16; 2];
                    if board.ao_dma().get(&mut sink) > 0
                        && board.irq().is_enabled(IrqId::AoUpdate)
                    {
                        bus.fire(&board, IrqId::AoUpdate);
                    }
                }
                thread::sleep(period);
            }
            produced
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Stop the producer; returns the number of scans produced.
    pub fn stop(mut self) -> u32 {
        self.shutdown()
    }

    fn shutdown(&mut self) -> u32 {
        self.stop.store(true, Ordering::Release);
        self.handle
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or(0)
    }
}

impl Drop for AcquisitionSimulator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arm_copy_arms_partner() {
        let bus = SimulatedBus::new();
        bus.write16(
            Register::GCommand(CounterId::G1),
            (g_command::ARM | g_command::ARM_COPY) as u16,
        );
        assert!(bus.is_armed(CounterId::G0));
        assert!(bus.is_armed(CounterId::G1));
        assert_eq!(
            bus.read16(Register::JointStatus1) as u32,
            joint_status::G0_ARMED | joint_status::G1_ARMED
        );
    }

    #[test]
    fn test_ack_clears_status() {
        let bus = SimulatedBus::new();
        bus.assert_irq(IrqId::AiStop);
        bus.assert_irq(IrqId::G0Tc);
        bus.write16(Register::InterruptAAck, IrqId::AiStop.bits().ack as u16);
        assert_eq!(
            u32::from(bus.read16(Register::AiStatus1)),
            IrqId::G0Tc.bits().status
        );
    }

    #[test]
    fn test_scripted_reads_take_precedence() {
        let bus = SimulatedBus::new();
        bus.set_count(CounterId::G0, 50);
        bus.script_reads(Register::GSave(CounterId::G0), &[1, 2]);
        assert_eq!(bus.read32(Register::GSave(CounterId::G0)), 1);
        assert_eq!(bus.read32(Register::GSave(CounterId::G0)), 2);
        assert_eq!(bus.read32(Register::GSave(CounterId::G0)), 50);
    }

    #[test]
    fn test_single_shot_stops_after_two_tcs() {
        let bus = SimulatedBus::new();
        bus.write16(
            Register::GMode(CounterId::G0),
            GMode::STOP_ON_SECOND_TC.bits() as u16,
        );
        bus.write16(Register::GCommand(CounterId::G0), g_command::ARM as u16);
        bus.counter_terminal_count(CounterId::G0);
        assert!(bus.is_armed(CounterId::G0));
        bus.counter_terminal_count(CounterId::G0);
        assert!(!bus.is_armed(CounterId::G0));
    }

    #[test]
    fn test_scan_count_finishes_acquisition() {
        let bus = SimulatedBus::new();
        bus.write32(Register::AiScanCount, 2);
        bus.write16(Register::AiCommand1, (acq_command::ARM | acq_command::START) as u16);
        assert_eq!(bus.ai_complete_scan(), (0, false));
        assert_eq!(bus.ai_complete_scan(), (1, true));
        assert!(!bus.ai_running());
        assert_ne!(
            u32::from(bus.read16(Register::AiStatus1)) & IrqId::AiScTc.bits().status,
            0
        );
    }

    #[test]
    fn test_write_log_is_bounded() {
        let bus = SimulatedBus::new();
        for value in 0..(WRITE_LOG_CAPACITY as u32 + 10) {
            bus.write32(Register::AiScanInterval, value);
        }
        let writes = bus.writes();
        assert_eq!(writes.len(), WRITE_LOG_CAPACITY);
        assert_eq!(writes[0], (Register::AiScanInterval, 10));
        assert_eq!(
            bus.last_write(Register::AiScanInterval),
            Some(WRITE_LOG_CAPACITY as u32 + 9)
        );
        assert_eq!(bus.register_value(Register::AiScanInterval), WRITE_LOG_CAPACITY as u32 + 9);
    }
}
