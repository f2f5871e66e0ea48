//! GPIO pin identifiers and the pin multiplexer.
//!
//! Only the part of the GPIO driver that peripheral drivers need lives here:
//! assigning a pin to a function.

use tock_registers::interfaces::{Readable, Writeable};

use crate::pac::{self, pin_map};

/// Highest pin number plus one.
pub const PIN_COUNT: u8 = 32;

/// A GPIO pin number.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Pin(u8);

impl Pin {
    #[inline]
    pub const fn new(number: u8) -> Self {
        Self(number)
    }

    #[inline]
    pub const fn number(self) -> u8 {
        self.0
    }

    /// Whether the pin is bonded out and usable on this package.
    pub const fn is_available(self) -> bool {
        match self.0 {
            10..=13 | 18..=19 | 24..=27 => false,
            n => n < PIN_COUNT,
        }
    }
}

impl From<u8> for Pin {
    fn from(number: u8) -> Self {
        Self(number)
    }
}

/// Pin function, encoded as the 4-bit pin-mux field value.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum PinMode {
    Gpio = 0,
    Spi0 = 1,
    Spi0Cs1 = 2,
    Spi0Cs2 = 3,
    Spi1 = 5,
    Spi0Cs3 = 6,
}

impl PinMode {
    #[inline]
    pub const fn bits(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u8> for PinMode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PinMode::Gpio),
            1 => Ok(PinMode::Spi0),
            2 => Ok(PinMode::Spi0Cs1),
            3 => Ok(PinMode::Spi0Cs2),
            5 => Ok(PinMode::Spi1),
            6 => Ok(PinMode::Spi0Cs3),
            _ => Err(Error::InvalidMode),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The pin does not exist on this package.
    PinNotAvailable(Pin),
    InvalidMode,
}

/// Pin multiplexer.
pub trait PinControl {
    fn set_mode(&self, pin: Pin, mode: PinMode) -> Result<(), Error>;
}

// Register index and field shift for a pin in the pin-map array.
fn map_slot(pin: Pin) -> (usize, u32) {
    let reg = (pin.number() / pin_map::PINS_PER_REG) as usize;
    let shift = (pin.number() % pin_map::PINS_PER_REG) as u32 * 4;
    (reg, shift)
}

impl PinControl for pac::SysCtrl {
    fn set_mode(&self, pin: Pin, mode: PinMode) -> Result<(), Error> {
        if !pin.is_available() {
            return Err(Error::PinNotAvailable(pin));
        }
        let (index, shift) = map_slot(pin);
        let reg = self.pin_map(index);
        critical_section::with(|_| {
            let v = (reg.get() & !(pin_map::FIELD_MASK << shift)) | (mode.bits() << shift);
            reg.set(v);
        });
        Ok(())
    }
}
