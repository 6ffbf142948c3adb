//! Interrupt enable/disable bookkeeping and dispatch.
//!
//! The board has sixteen interrupt sources split into two groups of eight.
//! Each group has its own enable, acknowledge and status register plus one
//! master enable bit in [`Register::InterruptControl`]. The master bit is set
//! while at least one handler in the group is installed.
//!
//! Ordering rules:
//! - a stale condition is acknowledged *before* the source is unmasked;
//! - on disable the condition is acknowledged before masking;
//! - a slot's handler is installed iff its source is unmasked.
//!
//! Handlers run in interrupt context (the thread calling
//! [`IrqDispatch::service`]) and must not block.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::error::{Result, StcError};
use crate::registers::bits::interrupt_control;
use crate::registers::{CounterId, Register, RegisterFile};

/// Number of dispatch slots.
pub const IRQ_COUNT: usize = 16;

/// Interrupt completion callback.
pub type IrqHandler = Arc<dyn Fn() + Send + Sync>;

/// Symbolic interrupt ids. Ids 0..=7 are group A, 8..=15 group B.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum IrqId {
    /// AI scan counter terminal count (acquisition complete)
    AiScTc = 0,
    /// AI START1 trigger
    AiStart1 = 1,
    /// AI START2 trigger
    AiStart2 = 2,
    /// AI scan start
    AiStart = 3,
    /// AI scan complete
    AiStop = 4,
    /// AI FIFO overrun
    AiError = 5,
    /// G0 terminal count
    G0Tc = 6,
    /// G0 gate edge
    G0Gate = 7,
    /// AO buffer counter terminal count
    AoBcTc = 8,
    /// AO update counter terminal count
    AoUcTc = 9,
    /// AO START1 trigger
    AoStart1 = 10,
    /// AO update
    AoUpdate = 11,
    /// AO start
    AoStart = 12,
    /// AO FIFO underrun
    AoError = 13,
    /// G1 terminal count
    G1Tc = 14,
    /// G1 gate edge
    G1Gate = 15,
}

/// Interrupt group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqGroup {
    /// Ids 0..=7
    A,
    /// Ids 8..=15
    B,
}

impl IrqGroup {
    /// Per-source enable register.
    pub fn enable_register(self) -> Register {
        match self {
            Self::A => Register::InterruptAEnable,
            Self::B => Register::InterruptBEnable,
        }
    }

    /// Acknowledge register.
    pub fn ack_register(self) -> Register {
        match self {
            Self::A => Register::InterruptAAck,
            Self::B => Register::InterruptBAck,
        }
    }

    /// Status register read by the ISR.
    pub fn status_register(self) -> Register {
        match self {
            Self::A => Register::AiStatus1,
            Self::B => Register::AoStatus1,
        }
    }

    /// Master enable bit in [`Register::InterruptControl`].
    pub fn master_bit(self) -> u32 {
        match self {
            Self::A => interrupt_control::GROUP_A_ENABLE,
            Self::B => interrupt_control::GROUP_B_ENABLE,
        }
    }

    fn ids(self) -> &'static [IrqId] {
        match self {
            Self::A => &IrqId::ALL[..8],
            Self::B => &IrqId::ALL[8..],
        }
    }
}

/// Register bit patterns of one interrupt source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqBits {
    /// Bit in the group enable register
    pub enable: u32,
    /// Bit in the group acknowledge register
    pub ack: u32,
    /// Bit in the group status register
    pub status: u32,
}

const IRQ_BITS: [IrqBits; IRQ_COUNT] = [
    IrqBits { enable: 0x0001, ack: 0x2000, status: 0x0040 },
    IrqBits { enable: 0x0002, ack: 0x0800, status: 0x0080 },
    IrqBits { enable: 0x0004, ack: 0x0400, status: 0x0100 },
    IrqBits { enable: 0x0008, ack: 0x1000, status: 0x0200 },
    IrqBits { enable: 0x0010, ack: 0x0200, status: 0x0400 },
    IrqBits { enable: 0x0020, ack: 0x4000, status: 0x0800 },
    IrqBits { enable: 0x0040, ack: 0x0080, status: 0x0008 },
    IrqBits { enable: 0x0080, ack: 0x0100, status: 0x0004 },
    IrqBits { enable: 0x0001, ack: 0x2000, status: 0x0040 },
    IrqBits { enable: 0x0002, ack: 0x0800, status: 0x0080 },
    IrqBits { enable: 0x0004, ack: 0x0400, status: 0x0100 },
    IrqBits { enable: 0x0008, ack: 0x1000, status: 0x0200 },
    IrqBits { enable: 0x0010, ack: 0x0200, status: 0x0400 },
    IrqBits { enable: 0x0020, ack: 0x4000, status: 0x0800 },
    IrqBits { enable: 0x0040, ack: 0x0080, status: 0x0008 },
    IrqBits { enable: 0x0080, ack: 0x0100, status: 0x0004 },
];

impl IrqId {
    /// Every id, in table order.
    pub const ALL: [IrqId; IRQ_COUNT] = [
        IrqId::AiScTc,
        IrqId::AiStart1,
        IrqId::AiStart2,
        IrqId::AiStart,
        IrqId::AiStop,
        IrqId::AiError,
        IrqId::G0Tc,
        IrqId::G0Gate,
        IrqId::AoBcTc,
        IrqId::AoUcTc,
        IrqId::AoStart1,
        IrqId::AoUpdate,
        IrqId::AoStart,
        IrqId::AoError,
        IrqId::G1Tc,
        IrqId::G1Gate,
    ];

    /// Look up an id by table index.
    pub fn from_index(id: usize) -> Result<Self> {
        Self::ALL.get(id).copied().ok_or_else(|| {
            error!(id, "IRQ id outside dispatch table");
            StcError::IrqOutOfRange { id }
        })
    }

    /// Table index.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Group the id belongs to.
    pub fn group(self) -> IrqGroup {
        if self.index() < 8 {
            IrqGroup::A
        } else {
            IrqGroup::B
        }
    }

    /// Enable/ack/status bit patterns.
    pub fn bits(self) -> IrqBits {
        IRQ_BITS[self.index()]
    }

    /// Terminal count interrupt of a counter.
    pub fn counter_tc(counter: CounterId) -> Self {
        match counter {
            CounterId::G0 => Self::G0Tc,
            CounterId::G1 => Self::G1Tc,
        }
    }

    /// Gate interrupt of a counter.
    pub fn counter_gate(counter: CounterId) -> Self {
        match counter {
            CounterId::G0 => Self::G0Gate,
            CounterId::G1 => Self::G1Gate,
        }
    }
}

#[derive(Default)]
struct IrqSlot {
    handler: Option<IrqHandler>,
    enabled: bool,
}

/// Per-board interrupt dispatch table.
pub struct IrqDispatch {
    regs: Arc<RegisterFile>,
    slots: Mutex<[IrqSlot; IRQ_COUNT]>,
    raised: [AtomicBool; IRQ_COUNT],
    spurious: AtomicUsize,
}

impl IrqDispatch {
    /// Create a table with every source masked.
    pub fn new(regs: Arc<RegisterFile>) -> Self {
        Self {
            regs,
            slots: Mutex::new(Default::default()),
            raised: Default::default(),
            spurious: AtomicUsize::new(0),
        }
    }

    /// Install `handler` for `id` and unmask the source.
    ///
    /// If a handler is already installed only the handler is replaced; the
    /// hardware enable and acknowledge bits are left untouched.
    pub fn enable(&self, id: IrqId, handler: IrqHandler) {
        let mut slots = self.slots.lock();
        let group = id.group();
        let bits = id.bits();

        if slots[id.index()].handler.is_some() {
            trace!(irq = ?id, "IRQ handler replaced");
            slots[id.index()].handler = Some(handler);
            return;
        }

        let first_in_group = !group.ids().iter().any(|other| slots[other.index()].enabled);

        self.raised[id.index()].store(false, Ordering::Release);
        self.regs.strobe(group.ack_register(), bits.ack);
        self.regs.set_bits(group.enable_register(), bits.enable);
        if first_in_group {
            self.regs
                .set_bits(Register::InterruptControl, group.master_bit());
        }

        let slot = &mut slots[id.index()];
        slot.handler = Some(handler);
        slot.enabled = true;
        debug!(irq = ?id, first_in_group, "IRQ enabled");
    }

    /// Mask `id` and remove its handler. Disabling a masked source is a no-op.
    pub fn disable(&self, id: IrqId) {
        let mut slots = self.slots.lock();
        let group = id.group();
        let bits = id.bits();

        if slots[id.index()].handler.is_none() {
            return;
        }

        self.regs.strobe(group.ack_register(), bits.ack);
        self.regs.clear_bits(group.enable_register(), bits.enable);

        let slot = &mut slots[id.index()];
        slot.handler = None;
        slot.enabled = false;
        self.raised[id.index()].store(false, Ordering::Release);

        let last_in_group = !group.ids().iter().any(|other| slots[other.index()].enabled);
        if last_in_group {
            self.regs
                .clear_bits(Register::InterruptControl, group.master_bit());
        }
        debug!(irq = ?id, last_in_group, "IRQ disabled");
    }

    /// Acknowledge a pending condition without touching the enable state.
    pub fn acknowledge(&self, id: IrqId) {
        let _slots = self.slots.lock();
        self.regs.strobe(id.group().ack_register(), id.bits().ack);
    }

    /// Whether a handler is installed for `id`.
    pub fn is_enabled(&self, id: IrqId) -> bool {
        self.slots.lock()[id.index()].enabled
    }

    /// Whether the ISR has seen `id` since it was last enabled.
    pub fn is_raised(&self, id: IrqId) -> bool {
        self.raised[id.index()].load(Ordering::Acquire)
    }

    /// Service calls that found no enabled condition asserted.
    pub fn spurious_count(&self) -> usize {
        self.spurious.load(Ordering::Relaxed)
    }

    /// Clear the raised flag of `id`.
    pub fn clear_raised(&self, id: IrqId) {
        self.raised[id.index()].store(false, Ordering::Release);
    }

    /// State of the board's interrupt line: whether any condition with an
    /// installed handler is latched in a status register.
    ///
    /// Masked conditions latch in the status registers without raising the
    /// line, so a forwarder should only call [`IrqDispatch::service`] when
    /// this is true.
    pub fn pending(&self) -> bool {
        let slots = self.slots.lock();
        [IrqGroup::A, IrqGroup::B].into_iter().any(|group| {
            let status = self.regs.read(group.status_register());
            status != 0
                && group.ids().iter().any(|&id| {
                    slots[id.index()].enabled && status & id.bits().status != 0
                })
        })
    }

    /// Interrupt service routine.
    ///
    /// Reads both status registers; for every asserted condition with an
    /// installed handler, marks it raised, acknowledges it and invokes the
    /// handler. Handlers are invoked after the table lock is released.
    /// Returns the number of conditions serviced.
    pub fn service(&self) -> usize {
        let mut pending: Vec<IrqHandler> = Vec::new();
        let mut serviced = 0;
        {
            let slots = self.slots.lock();
            for group in [IrqGroup::A, IrqGroup::B] {
                let status = self.regs.read(group.status_register());
                if status == 0 {
                    continue;
                }
                for &id in group.ids() {
                    let bits = id.bits();
                    if status & bits.status == 0 {
                        continue;
                    }
                    let slot = &slots[id.index()];
                    match &slot.handler {
                        Some(handler) if slot.enabled => {
                            self.raised[id.index()].store(true, Ordering::Release);
                            self.regs.strobe(group.ack_register(), bits.ack);
                            pending.push(handler.clone());
                            serviced += 1;
                        }
                        _ => trace!(irq = ?id, "condition asserted while masked"),
                    }
                }
            }
        }
        if serviced == 0 {
            self.spurious.fetch_add(1, Ordering::Relaxed);
            warn!("spurious interrupt: no enabled condition asserted");
        }
        for handler in pending {
            handler();
        }
        serviced
    }
}

impl fmt::Debug for IrqDispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.lock();
        let enabled: Vec<IrqId> = IrqId::ALL
            .iter()
            .copied()
            .filter(|id| slots[id.index()].enabled)
            .collect();
        f.debug_struct("IrqDispatch")
            .field("enabled", &enabled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedBus;
    use std::sync::atomic::AtomicUsize;

    fn dispatch() -> (Arc<SimulatedBus>, Arc<RegisterFile>, IrqDispatch) {
        let bus = Arc::new(SimulatedBus::new());
        let regs = Arc::new(RegisterFile::new(bus.clone()));
        let irq = IrqDispatch::new(regs.clone());
        (bus, regs, irq)
    }

    fn counting_handler(counter: &Arc<AtomicUsize>) -> IrqHandler {
        let counter = counter.clone();
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_from_index_rejects_out_of_range() {
        assert_eq!(IrqId::from_index(4).unwrap(), IrqId::AiStop);
        assert_eq!(
            IrqId::from_index(16).unwrap_err(),
            StcError::IrqOutOfRange { id: 16 }
        );
    }

    #[test]
    fn test_groups_partition_the_table() {
        assert!(IrqId::ALL[..8].iter().all(|id| id.group() == IrqGroup::A));
        assert!(IrqId::ALL[8..].iter().all(|id| id.group() == IrqGroup::B));
    }

    #[test]
    fn test_enable_acks_before_unmask_and_sets_master() {
        let (bus, regs, irq) = dispatch();
        irq.enable(IrqId::AiStop, Arc::new(|| {}));

        let writes = bus.writes();
        let ack = writes
            .iter()
            .position(|(r, _)| *r == Register::InterruptAAck)
            .unwrap();
        let unmask = writes
            .iter()
            .position(|(r, _)| *r == Register::InterruptAEnable)
            .unwrap();
        assert!(ack < unmask);
        assert_eq!(
            regs.mirrored(Register::InterruptAEnable),
            IrqId::AiStop.bits().enable
        );
        assert_ne!(
            regs.mirrored(Register::InterruptControl) & interrupt_control::GROUP_A_ENABLE,
            0
        );
        assert_eq!(
            regs.mirrored(Register::InterruptControl) & interrupt_control::GROUP_B_ENABLE,
            0
        );
    }

    #[test]
    fn test_reenable_swaps_handler_without_touching_hardware() {
        let (bus, _regs, irq) = dispatch();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        irq.enable(IrqId::G0Tc, counting_handler(&first));
        irq.enable(IrqId::G0Tc, counting_handler(&second));
        assert_eq!(bus.write_count(Register::InterruptAEnable), 1);
        assert_eq!(bus.write_count(Register::InterruptAAck), 1);

        bus.assert_irq(IrqId::G0Tc);
        assert_eq!(irq.service(), 1);
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert!(irq.is_raised(IrqId::G0Tc));
    }

    #[test]
    fn test_master_bit_cleared_with_last_handler() {
        let (_bus, regs, irq) = dispatch();
        irq.enable(IrqId::AoUpdate, Arc::new(|| {}));
        irq.enable(IrqId::G1Tc, Arc::new(|| {}));
        irq.disable(IrqId::AoUpdate);
        assert_ne!(
            regs.mirrored(Register::InterruptControl) & interrupt_control::GROUP_B_ENABLE,
            0
        );
        irq.disable(IrqId::G1Tc);
        assert_eq!(regs.mirrored(Register::InterruptControl), 0);
        assert_eq!(regs.mirrored(Register::InterruptBEnable), 0);
    }

    #[test]
    fn test_masked_condition_is_not_dispatched() {
        let (bus, _regs, irq) = dispatch();
        let hits = Arc::new(AtomicUsize::new(0));
        irq.enable(IrqId::AiScTc, counting_handler(&hits));
        bus.assert_irq(IrqId::AiStop);
        assert_eq!(irq.service(), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(!irq.is_raised(IrqId::AiStop));
        assert_eq!(irq.spurious_count(), 1);
    }

    #[test]
    fn test_line_pending_only_for_enabled_conditions() {
        let (bus, _regs, irq) = dispatch();
        assert!(!irq.pending());

        bus.assert_irq(IrqId::AiStop);
        assert!(!irq.pending());

        irq.enable(IrqId::AiScTc, Arc::new(|| {}));
        assert!(!irq.pending());
        bus.assert_irq(IrqId::AiScTc);
        assert!(irq.pending());

        assert_eq!(irq.service(), 1);
        assert!(!irq.pending());
        assert_eq!(irq.spurious_count(), 0);
    }

    #[test]
    fn test_service_acknowledges_condition() {
        let (bus, _regs, irq) = dispatch();
        irq.enable(IrqId::AiStop, Arc::new(|| {}));
        bus.assert_irq(IrqId::AiStop);
        assert_eq!(irq.service(), 1);
        // Acknowledged by the ISR, nothing left to service
        assert_eq!(irq.service(), 0);
    }
}
