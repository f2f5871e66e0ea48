//! Peripheral clock gating.

use tock_registers::fields::Field;
use tock_registers::interfaces::{ReadWriteable, Readable};

use crate::pac::{self, CLOCK_CONTROL};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PeripheralClock {
    Spi0,
    Spi1,
}

impl PeripheralClock {
    pub fn field(self) -> Field<u32, CLOCK_CONTROL::Register> {
        match self {
            PeripheralClock::Spi0 => CLOCK_CONTROL::SPI0,
            PeripheralClock::Spi1 => CLOCK_CONTROL::SPI1,
        }
    }
}

pub trait ClockGate {
    fn enable(&self, clock: PeripheralClock);
    fn disable(&self, clock: PeripheralClock);
    fn is_enabled(&self, clock: PeripheralClock) -> bool;
}

impl ClockGate for pac::SysCtrl {
    fn enable(&self, clock: PeripheralClock) {
        critical_section::with(|_| self.clock_control().modify(clock.field().val(1)))
    }

    fn disable(&self, clock: PeripheralClock) {
        critical_section::with(|_| self.clock_control().modify(clock.field().val(0)))
    }

    fn is_enabled(&self, clock: PeripheralClock) -> bool {
        self.clock_control().is_set(clock.field())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gates_are_independent() {
        let mut mem = [0u32; 8];
        mem[1] = 0x0000_00A5;
        let base = mem.as_mut_ptr();
        let sys = unsafe { pac::SysCtrl::at(base as *const pac::SysCtrlRegisters) };

        ClockGate::enable(&sys, PeripheralClock::Spi1);
        assert!(sys.is_enabled(PeripheralClock::Spi1));
        assert!(!sys.is_enabled(PeripheralClock::Spi0));
        assert_eq!(unsafe { base.add(1).read_volatile() }, 0x0020_00A5);

        ClockGate::enable(&sys, PeripheralClock::Spi0);
        ClockGate::disable(&sys, PeripheralClock::Spi1);
        assert_eq!(unsafe { base.add(1).read_volatile() }, 0x0010_00A5);
    }
}
