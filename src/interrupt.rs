//! Interrupt lines and the interrupt controller.

use core::sync::atomic::{compiler_fence, Ordering};

use cortex_m::interrupt::InterruptNumber;
use cortex_m::peripheral::NVIC;

/// Number of priority bits implemented by the NVIC.
pub const PRIO_BITS: u8 = 3;

/// Interrupt priority, `P0` being the most urgent.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Priority {
    P0 = 0,
    P1 = 1,
    P2 = 2,
    P3 = 3,
    P4 = 4,
    P5 = 5,
    P6 = 6,
    P7 = 7,
}

impl From<u8> for Priority {
    /// Only the low [`PRIO_BITS`] bits are significant.
    fn from(value: u8) -> Self {
        match value & 0x07 {
            0 => Priority::P0,
            1 => Priority::P1,
            2 => Priority::P2,
            3 => Priority::P3,
            4 => Priority::P4,
            5 => Priority::P5,
            6 => Priority::P6,
            _ => Priority::P7,
        }
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> Self {
        p as u8
    }
}

/// Peripheral interrupt lines used by this crate.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
pub enum Interrupt {
    Spi0 = 25,
    Spi1 = 26,
}

unsafe impl InterruptNumber for Interrupt {
    #[inline]
    fn number(self) -> u16 {
        self as u16
    }
}

/// Interrupt controller operations drivers need.
pub trait InterruptController {
    fn set_priority(&self, irq: Interrupt, prio: Priority);

    fn priority(&self, irq: Interrupt) -> Priority;

    /// Enable the interrupt.
    fn enable(&self, irq: Interrupt);

    /// Disable the interrupt.
    fn disable(&self, irq: Interrupt);

    /// Unset interrupt pending.
    fn unpend(&self, irq: Interrupt);
}

/// Cortex-M33 NVIC.
#[derive(Debug)]
pub struct Nvic {
    _private: (),
}

impl Nvic {
    /// # Safety
    ///
    /// The NVIC is shared by every driver; callers must only touch lines
    /// they own.
    pub const unsafe fn steal() -> Self {
        Self { _private: () }
    }
}

// Priorities live in the top PRIO_BITS of each IPR byte.
const fn to_hw(prio: Priority) -> u8 {
    (prio as u8) << (8 - PRIO_BITS)
}

const fn from_hw(raw: u8) -> u8 {
    raw >> (8 - PRIO_BITS)
}

impl InterruptController for Nvic {
    fn set_priority(&self, irq: Interrupt, prio: Priority) {
        unsafe {
            let mut nvic = cortex_m::Peripherals::steal().NVIC;
            nvic.set_priority(irq, to_hw(prio));
        }
    }

    fn priority(&self, irq: Interrupt) -> Priority {
        Priority::from(from_hw(NVIC::get_priority(irq)))
    }

    fn enable(&self, irq: Interrupt) {
        compiler_fence(Ordering::SeqCst);
        unsafe { NVIC::unmask(irq) }
    }

    fn disable(&self, irq: Interrupt) {
        NVIC::mask(irq);
        compiler_fence(Ordering::SeqCst);
    }

    fn unpend(&self, irq: Interrupt) {
        NVIC::unpend(irq)
    }
}
