use crate::gpio::{self, Pin, PinControl, PinMode};
use crate::interrupt::{Interrupt, InterruptController, Nvic, Priority};
use crate::pac::{self, Mmio, RegisterBlock, SpiRegisters};
use crate::rcc::{ClockGate, PeripheralClock};
use crate::spi::SpiId;

/// Everything a driver needs from the chip: register blocks, pin mux,
/// interrupt controller and clock gates.
pub trait Hardware: PinControl + InterruptController + ClockGate {
    type Registers: RegisterBlock;

    fn registers(&self, id: SpiId) -> &Self::Registers;
}

/// The T32CM11 chip.
#[derive(Debug)]
pub struct T32cm11 {
    spi0: Mmio<SpiRegisters>,
    spi1: Mmio<SpiRegisters>,
    sys: pac::SysCtrl,
    nvic: Nvic,
}

impl T32cm11 {
    /// # Safety
    ///
    /// Only one `T32cm11` may exist at a time.
    pub const unsafe fn steal() -> Self {
        Self {
            spi0: Mmio::new(pac::SPI0_BASE as *const SpiRegisters),
            spi1: Mmio::new(pac::SPI1_BASE as *const SpiRegisters),
            sys: pac::SysCtrl::new(),
            nvic: Nvic::steal(),
        }
    }
}

impl PinControl for T32cm11 {
    fn set_mode(&self, pin: Pin, mode: PinMode) -> Result<(), gpio::Error> {
        self.sys.set_mode(pin, mode)
    }
}

impl InterruptController for T32cm11 {
    fn set_priority(&self, irq: Interrupt, prio: Priority) {
        self.nvic.set_priority(irq, prio)
    }

    fn priority(&self, irq: Interrupt) -> Priority {
        self.nvic.priority(irq)
    }

    fn enable(&self, irq: Interrupt) {
        self.nvic.enable(irq)
    }

    fn disable(&self, irq: Interrupt) {
        self.nvic.disable(irq)
    }

    fn unpend(&self, irq: Interrupt) {
        self.nvic.unpend(irq)
    }
}

impl ClockGate for T32cm11 {
    fn enable(&self, clock: PeripheralClock) {
        ClockGate::enable(&self.sys, clock)
    }

    fn disable(&self, clock: PeripheralClock) {
        ClockGate::disable(&self.sys, clock)
    }

    fn is_enabled(&self, clock: PeripheralClock) -> bool {
        self.sys.is_enabled(clock)
    }
}

impl Hardware for T32cm11 {
    type Registers = SpiRegisters;

    fn registers(&self, id: SpiId) -> &SpiRegisters {
        match id {
            SpiId::Spi0 => &self.spi0,
            SpiId::Spi1 => &self.spi1,
        }
    }
}
