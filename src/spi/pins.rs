use crate::gpio::{Pin, PinControl, PinMode};

use super::{Error, Settings, SpiId, MAX_CHIP_SELECTS};

/// Pins used by one instance.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PinConfig {
    pub clock: Pin,
    /// SDO
    pub io0: Pin,
    /// SDI
    pub io1: Pin,
    /// Quad mode only.
    pub io2: Option<Pin>,
    /// Quad mode only.
    pub io3: Option<Pin>,
    pub chip_select_count: u8,
    pub chip_selects: [Option<Pin>; MAX_CHIP_SELECTS],
}

impl PinConfig {
    pub const SPI0_OPTION1: PinConfig = PinConfig::single_cs(6, 8, 9, 7);
    pub const SPI0_OPTION2: PinConfig = PinConfig::single_cs(28, 30, 31, 29);
    pub const SPI1: PinConfig = PinConfig::single_cs(28, 30, 31, 29);

    const fn single_cs(clock: u8, io0: u8, io1: u8, cs0: u8) -> Self {
        Self {
            clock: Pin::new(clock),
            io0: Pin::new(io0),
            io1: Pin::new(io1),
            io2: None,
            io3: None,
            chip_select_count: 1,
            chip_selects: [Some(Pin::new(cs0)), None, None, None],
        }
    }
}

const SPI0_CLOCK: [u8; 2] = [6, 28];
const SPI0_CS0: [u8; 2] = [7, 29];
const SPI0_IO0: [u8; 2] = [8, 30];
const SPI0_IO1: [u8; 2] = [9, 31];
// Chip selects 1 to 3 share the same options.
const SPI0_CS_EXTRA: [u8; 4] = [1, 2, 3, 4];
const SPI0_CS_EXTRA_MODE: [PinMode; 3] = [PinMode::Spi0Cs1, PinMode::Spi0Cs2, PinMode::Spi0Cs3];

const SPI1_CLOCK: [u8; 1] = [28];
const SPI1_CS0: [u8; 1] = [29];
const SPI1_IO0: [u8; 1] = [30];
const SPI1_IO1: [u8; 1] = [31];

/// Pin-mux assignments for an instance, in the order they are applied.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct PinPlan {
    entries: [Option<(Pin, PinMode)>; 4 + MAX_CHIP_SELECTS - 1],
}

impl PinPlan {
    pub fn iter(&self) -> impl Iterator<Item = (Pin, PinMode)> + '_ {
        self.entries.iter().flatten().copied()
    }
}

fn allowed(pin: Pin, options: &[u8]) -> bool {
    options.contains(&pin.number())
}

/// Check every pin of `settings` against the instance's options and build
/// the pin-mux plan. Nothing is written.
pub(crate) fn validate(id: SpiId, settings: &Settings) -> Result<PinPlan, Error> {
    let pins = &settings.pins;
    let (clock, cs0, io0, io1): (&[u8], &[u8], &[u8], &[u8]) = match id {
        SpiId::Spi0 => (&SPI0_CLOCK, &SPI0_CS0, &SPI0_IO0, &SPI0_IO1),
        SpiId::Spi1 => (&SPI1_CLOCK, &SPI1_CS0, &SPI1_IO0, &SPI1_IO1),
    };

    if pins.chip_select_count == 0 || pins.chip_select_count > id.max_chip_selects() {
        return Err(Error::InvalidChipSelectCount);
    }
    if !allowed(pins.clock, clock) {
        return Err(Error::InvalidClockPin);
    }
    let first_cs = pins.chip_selects[0].ok_or(Error::InvalidCsPin(0))?;
    if !allowed(first_cs, cs0) {
        return Err(Error::InvalidCsPin(0));
    }
    if !allowed(pins.io0, io0) {
        return Err(Error::InvalidIoPin(0));
    }
    if !allowed(pins.io1, io1) {
        return Err(Error::InvalidIoPin(1));
    }

    let mode = id.pin_mode();
    let mut entries = [None; 4 + MAX_CHIP_SELECTS - 1];
    entries[0] = Some((pins.clock, mode));
    entries[1] = Some((first_cs, mode));
    entries[2] = Some((pins.io0, mode));
    entries[3] = Some((pins.io1, mode));

    for n in 1..pins.chip_select_count as usize {
        let cs = pins.chip_selects[n].ok_or(Error::InvalidCsPin(n as u8))?;
        let duplicate = pins.chip_selects[1..n].contains(&Some(cs));
        if !allowed(cs, &SPI0_CS_EXTRA) || duplicate {
            return Err(Error::InvalidCsPin(n as u8));
        }
        entries[3 + n] = Some((cs, SPI0_CS_EXTRA_MODE[n - 1]));
    }

    for (pin, _) in entries.iter().flatten() {
        if !pin.is_available() {
            return Err(Error::Gpio(crate::gpio::Error::PinNotAvailable(*pin)));
        }
    }

    Ok(PinPlan { entries })
}

/// Apply `plan`. On failure the pins already switched go back to GPIO.
pub(crate) fn apply<P: PinControl>(pc: &P, plan: &PinPlan) -> Result<(), Error> {
    for (done, (pin, mode)) in plan.iter().enumerate() {
        if let Err(e) = pc.set_mode(pin, mode) {
            error!("pin {} rejected by pin mux, rolling back", pin.number());
            for (pin, _) in plan.iter().take(done) {
                let _ = pc.set_mode(pin, PinMode::Gpio);
            }
            return Err(e.into());
        }
    }
    Ok(())
}

/// Return every pin of `plan` to GPIO.
pub(crate) fn release<P: PinControl>(pc: &P, plan: &PinPlan) {
    for (pin, _) in plan.iter() {
        let _ = pc.set_mode(pin, PinMode::Gpio);
    }
}

#[cfg(test)]
mod tests {
    use core::cell::RefCell;

    use super::*;
    use crate::gpio;

    struct Recorder {
        calls: RefCell<Vec<(u8, PinMode)>>,
        reject: Option<u8>,
    }

    impl PinControl for Recorder {
        fn set_mode(&self, pin: Pin, mode: PinMode) -> Result<(), gpio::Error> {
            if self.reject == Some(pin.number()) && mode != PinMode::Gpio {
                return Err(gpio::Error::PinNotAvailable(pin));
            }
            self.calls.borrow_mut().push((pin.number(), mode));
            Ok(())
        }
    }

    fn settings(pins: PinConfig) -> Settings {
        Settings {
            pins,
            ..Default::default()
        }
    }

    #[test]
    fn default_pins_plan() {
        let plan = validate(SpiId::Spi0, &settings(PinConfig::SPI0_OPTION1)).unwrap();
        let got: Vec<_> = plan.iter().map(|(p, m)| (p.number(), m)).collect();
        assert_eq!(
            got,
            vec![(6, PinMode::Spi0), (7, PinMode::Spi0), (8, PinMode::Spi0), (9, PinMode::Spi0)]
        );
    }

    #[test]
    fn spi1_has_one_option() {
        assert!(validate(SpiId::Spi1, &settings(PinConfig::SPI1)).is_ok());
        assert_eq!(
            validate(SpiId::Spi1, &settings(PinConfig::SPI0_OPTION1)),
            Err(Error::InvalidClockPin)
        );
    }

    #[test]
    fn wrong_data_and_cs_pins() {
        let mut pins = PinConfig::SPI0_OPTION1;
        pins.io1 = Pin::new(30);
        assert_eq!(validate(SpiId::Spi0, &settings(pins)), Err(Error::InvalidIoPin(1)));

        let mut pins = PinConfig::SPI0_OPTION1;
        pins.chip_selects[0] = Some(Pin::new(8));
        assert_eq!(validate(SpiId::Spi0, &settings(pins)), Err(Error::InvalidCsPin(0)));
    }

    #[test]
    fn chip_select_count_limits() {
        let mut pins = PinConfig::SPI1;
        pins.chip_select_count = 2;
        pins.chip_selects[1] = Some(Pin::new(1));
        assert_eq!(validate(SpiId::Spi1, &settings(pins)), Err(Error::InvalidChipSelectCount));

        let mut pins = PinConfig::SPI0_OPTION1;
        pins.chip_select_count = 0;
        assert_eq!(validate(SpiId::Spi0, &settings(pins)), Err(Error::InvalidChipSelectCount));
    }

    #[test]
    fn extra_chip_selects() {
        let mut pins = PinConfig::SPI0_OPTION1;
        pins.chip_select_count = 3;
        pins.chip_selects[1] = Some(Pin::new(2));
        pins.chip_selects[2] = Some(Pin::new(4));
        let plan = validate(SpiId::Spi0, &settings(pins)).unwrap();
        let got: Vec<_> = plan.iter().skip(4).map(|(p, m)| (p.number(), m)).collect();
        assert_eq!(got, vec![(2, PinMode::Spi0Cs1), (4, PinMode::Spi0Cs2)]);

        pins.chip_selects[2] = Some(Pin::new(2));
        assert_eq!(validate(SpiId::Spi0, &settings(pins)), Err(Error::InvalidCsPin(2)));

        pins.chip_selects[2] = None;
        assert_eq!(validate(SpiId::Spi0, &settings(pins)), Err(Error::InvalidCsPin(2)));
    }

    #[test]
    fn apply_rolls_back_on_failure() {
        let plan = validate(SpiId::Spi0, &settings(PinConfig::SPI0_OPTION1)).unwrap();
        let pc = Recorder {
            calls: RefCell::new(Vec::new()),
            reject: Some(8),
        };
        assert!(matches!(apply(&pc, &plan), Err(Error::Gpio(_))));
        assert_eq!(
            *pc.calls.borrow(),
            vec![
                (6, PinMode::Spi0),
                (7, PinMode::Spi0),
                (6, PinMode::Gpio),
                (7, PinMode::Gpio)
            ]
        );
    }
}
