//! Recording stand-in for the chip, used by the driver tests.

use core::cell::{Cell, RefCell};
use std::collections::VecDeque;

use tock_registers::fields::FieldValue;

use crate::gpio::{self, Pin, PinControl, PinMode, PIN_COUNT};
use crate::interrupt::{Interrupt, InterruptController, Priority};
use crate::pac::{Reg, RegisterBlock, DMA_INTERRUPT, INTERRUPT};
use crate::peripheral::Hardware;
use crate::rcc::{ClockGate, PeripheralClock};

use super::{Events, SpiId};

/// One SPI register block. Every write is logged in order.
///
/// The RX FIFO is a queue fed by the test, TX FIFO writes are captured,
/// and the interrupt and DMA status registers are write-one-to-clear.
pub struct MockRegs {
    values: RefCell<[u32; Reg::COUNT]>,
    log: RefCell<Vec<(Reg, u32)>>,
    tx: RefCell<Vec<u8>>,
    rx: RefCell<VecDeque<u8>>,
    dma_rx: Cell<(*mut u8, usize)>,
    dma_tx: Cell<*const u8>,
}

impl MockRegs {
    fn new() -> Self {
        Self {
            values: RefCell::new([0; Reg::COUNT]),
            log: RefCell::new(Vec::new()),
            tx: RefCell::new(Vec::new()),
            rx: RefCell::new(VecDeque::new()),
            dma_rx: Cell::new((core::ptr::null_mut(), 0)),
            dma_tx: Cell::new(core::ptr::null()),
        }
    }

    /// Last value written to `reg`, or set by the test.
    pub fn value(&self, reg: Reg) -> u32 {
        self.values.borrow()[reg.index()]
    }

    /// Set a register without logging a write.
    pub fn set(&self, reg: Reg, value: u32) {
        self.values.borrow_mut()[reg.index()] = value;
    }

    pub fn raise(&self, fields: FieldValue<u32, INTERRUPT::Register>) {
        self.values.borrow_mut()[Reg::InterruptStatus.index()] |= fields.value;
    }

    pub fn raise_dma(&self, fields: FieldValue<u32, DMA_INTERRUPT::Register>) {
        self.values.borrow_mut()[Reg::DmaInterruptStatus.index()] |= fields.value;
    }

    pub fn feed_rx(&self, bytes: &[u8]) {
        self.rx.borrow_mut().extend(bytes.iter().copied());
    }

    /// Write `bytes` into the RX DMA buffer after the ones delivered so far.
    pub fn dma_deliver(&self, bytes: &[u8]) {
        let (ptr, at) = self.dma_rx.get();
        assert!(!ptr.is_null(), "no RX DMA buffer programmed");
        let len = self.value(Reg::DmaRxLen) as usize;
        assert!(at + bytes.len() <= len, "RX DMA buffer overrun");
        for (i, &b) in bytes.iter().enumerate() {
            unsafe { ptr.add(at + i).write_volatile(b) };
        }
        self.dma_rx.set((ptr, at + bytes.len()));
        self.set(Reg::DmaRxRemaining, (len - at - bytes.len()) as u32);
    }

    pub fn dma_tx_ptr(&self) -> *const u8 {
        self.dma_tx.get()
    }

    /// Bytes pushed into the TX FIFO since the last [`clear_log`](Self::clear_log).
    pub fn tx_bytes(&self) -> Vec<u8> {
        self.tx.borrow().clone()
    }

    pub fn writes(&self) -> Vec<(Reg, u32)> {
        self.log.borrow().clone()
    }

    pub fn writes_to(&self, reg: Reg) -> Vec<u32> {
        self.log
            .borrow()
            .iter()
            .filter(|(r, _)| *r == reg)
            .map(|&(_, v)| v)
            .collect()
    }

    pub fn clear_log(&self) {
        self.log.borrow_mut().clear();
        self.tx.borrow_mut().clear();
    }
}

impl RegisterBlock for MockRegs {
    fn read(&self, reg: Reg) -> u32 {
        match reg {
            Reg::RxFifoLevel => self.rx.borrow().len() as u32,
            Reg::RxData => self.rx.borrow_mut().pop_front().map_or(0, u32::from),
            _ => self.value(reg),
        }
    }

    fn write(&self, reg: Reg, value: u32) {
        self.log.borrow_mut().push((reg, value));
        let mut values = self.values.borrow_mut();
        match reg {
            Reg::TxData => self.tx.borrow_mut().push(value as u8),
            Reg::InterruptClear => values[Reg::InterruptStatus.index()] &= !value,
            Reg::DmaInterruptStatus => values[reg.index()] &= !value,
            _ => values[reg.index()] = value,
        }
    }

    fn write_address(&self, reg: Reg, addr: *const u8) {
        match reg {
            Reg::DmaRxAddr => self.dma_rx.set((addr as *mut u8, 0)),
            Reg::DmaTxAddr => self.dma_tx.set(addr),
            _ => {}
        }
        self.write(reg, addr as usize as u32);
    }
}

fn line(irq: Interrupt) -> usize {
    match irq {
        Interrupt::Spi0 => 0,
        Interrupt::Spi1 => 1,
    }
}

fn gate(clock: PeripheralClock) -> usize {
    match clock {
        PeripheralClock::Spi0 => 0,
        PeripheralClock::Spi1 => 1,
    }
}

pub struct MockHardware {
    pub spi: [MockRegs; 2],
    pins: RefCell<[Option<PinMode>; PIN_COUNT as usize]>,
    pin_log: RefCell<Vec<(u8, PinMode)>>,
    reject: Cell<Option<u8>>,
    irq_enabled: Cell<[bool; 2]>,
    priorities: Cell<[Priority; 2]>,
    unpends: Cell<[u32; 2]>,
    clocks: Cell<[bool; 2]>,
}

impl MockHardware {
    pub fn new() -> Self {
        Self {
            spi: [MockRegs::new(), MockRegs::new()],
            pins: RefCell::new([None; PIN_COUNT as usize]),
            pin_log: RefCell::new(Vec::new()),
            reject: Cell::new(None),
            irq_enabled: Cell::new([false; 2]),
            priorities: Cell::new([Priority::P0; 2]),
            unpends: Cell::new([0; 2]),
            clocks: Cell::new([false; 2]),
        }
    }

    /// Mode last given to `pin`, `None` if never touched.
    pub fn pin_mode(&self, pin: u8) -> Option<PinMode> {
        self.pins.borrow().get(pin as usize).copied().flatten()
    }

    pub fn pin_log(&self) -> Vec<(u8, PinMode)> {
        self.pin_log.borrow().clone()
    }

    /// Make the pin mux refuse any non-GPIO mode for `pin`.
    pub fn reject_pin(&self, pin: u8) {
        self.reject.set(Some(pin));
    }

    pub fn clear_logs(&self) {
        self.pin_log.borrow_mut().clear();
        for regs in &self.spi {
            regs.clear_log();
        }
    }

    pub fn irq_enabled(&self, id: SpiId) -> bool {
        self.irq_enabled.get()[line(id.interrupt())]
    }

    pub fn unpend_count(&self, id: SpiId) -> u32 {
        self.unpends.get()[line(id.interrupt())]
    }

    pub fn clock_enabled(&self, clock: PeripheralClock) -> bool {
        self.clocks.get()[gate(clock)]
    }
}

impl PinControl for MockHardware {
    fn set_mode(&self, pin: Pin, mode: PinMode) -> Result<(), gpio::Error> {
        if !pin.is_available() || (self.reject.get() == Some(pin.number()) && mode != PinMode::Gpio) {
            return Err(gpio::Error::PinNotAvailable(pin));
        }
        self.pins.borrow_mut()[pin.number() as usize] = Some(mode);
        self.pin_log.borrow_mut().push((pin.number(), mode));
        Ok(())
    }
}

impl InterruptController for MockHardware {
    fn set_priority(&self, irq: Interrupt, prio: Priority) {
        let mut p = self.priorities.get();
        p[line(irq)] = prio;
        self.priorities.set(p);
    }

    fn priority(&self, irq: Interrupt) -> Priority {
        self.priorities.get()[line(irq)]
    }

    fn enable(&self, irq: Interrupt) {
        let mut e = self.irq_enabled.get();
        e[line(irq)] = true;
        self.irq_enabled.set(e);
    }

    fn disable(&self, irq: Interrupt) {
        let mut e = self.irq_enabled.get();
        e[line(irq)] = false;
        self.irq_enabled.set(e);
    }

    fn unpend(&self, irq: Interrupt) {
        let mut u = self.unpends.get();
        u[line(irq)] += 1;
        self.unpends.set(u);
    }
}

impl ClockGate for MockHardware {
    fn enable(&self, clock: PeripheralClock) {
        let mut c = self.clocks.get();
        c[gate(clock)] = true;
        self.clocks.set(c);
    }

    fn disable(&self, clock: PeripheralClock) {
        let mut c = self.clocks.get();
        c[gate(clock)] = false;
        self.clocks.set(c);
    }

    fn is_enabled(&self, clock: PeripheralClock) -> bool {
        self.clock_enabled(clock)
    }
}

impl Hardware for MockHardware {
    type Registers = MockRegs;

    fn registers(&self, id: SpiId) -> &MockRegs {
        &self.spi[id.index()]
    }
}

std::thread_local! {
    static RECEIVED: RefCell<Vec<Vec<u8>>> = const { RefCell::new(Vec::new()) };
    static EVENTS: RefCell<Vec<(SpiId, Events)>> = const { RefCell::new(Vec::new()) };
}

/// Receive callback that records every slice it is given.
pub fn record_rx(bytes: &[u8]) {
    RECEIVED.with(|r| r.borrow_mut().push(bytes.to_vec()));
}

pub fn take_received() -> Vec<Vec<u8>> {
    RECEIVED.with(|r| core::mem::take(&mut *r.borrow_mut()))
}

/// Event callback that records every call.
pub fn record_event(id: SpiId, events: Events) {
    EVENTS.with(|e| e.borrow_mut().push((id, events)));
}

pub fn take_events() -> Vec<(SpiId, Events)> {
    EVENTS.with(|e| core::mem::take(&mut *e.borrow_mut()))
}
