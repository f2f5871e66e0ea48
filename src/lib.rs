#![cfg_attr(not(test), no_std)]
#![doc = "Hardware abstraction layer for the Trident T32CM11 SPI controllers."]

// This must go FIRST so that all the other modules see its macros.
mod fmt;

pub mod gpio;
pub mod interrupt;
pub mod pac;
mod peripheral;
pub use peripheral::*;
pub mod rcc;
pub mod spi;
