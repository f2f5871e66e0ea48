//! SPI, Serial Peripheral Interface
//!
//! Interrupt-driven driver for the two SPI controllers of the T32CM11.
//!
//! One [`SpiDriver`] owns the state of both instances and is shared by
//! reference between application code and the interrupt vectors, which must
//! call [`SpiDriver::on_interrupt`]. [`bind_spi_interrupts!`](crate::bind_spi_interrupts)
//! defines those vectors:
//!
//! ```ignore
//! static SPI: SpiDriver<'static, T32cm11> = SpiDriver::new(unsafe { T32cm11::steal() });
//!
//! tr_hal::bind_spi_interrupts!(SPI; qspi0_handler => Spi0, qspi1_handler => Spi1);
//! ```
//!
//! Transmits shorter than the TX FIFO are pushed directly. Longer ones are
//! copied into the raw TX buffer given at init and fed to the FIFO one chunk
//! per TX-empty interrupt. With TX DMA enabled the caller's buffer is
//! handed to the DMA engine instead.

use bitflags::bitflags;
use embedded_hal::spi::{Mode, Phase, Polarity, MODE_0};
use tock_registers::fields::FieldValue;
use tock_registers::LocalRegisterCopy;

use crate::gpio::{self, PinMode};
use crate::interrupt::{Interrupt, Priority};
use crate::pac::{AUX_CONTROL, CONTROL};
use crate::peripheral::Hardware;
use crate::rcc::PeripheralClock;

mod irq;
mod lifecycle;
mod pins;
mod state;
mod transfer;

#[cfg(test)]
mod mock;

pub use pins::PinConfig;
use state::State;

pub const TX_FIFO_SIZE: usize = 32;
pub const RX_FIFO_SIZE: usize = 32;
/// Smallest RX DMA buffer accepted.
pub const DMA_RX_BUFFER_MIN: usize = 16;
pub const MAX_CHIP_SELECTS: usize = 4;
#[cfg(feature = "embassy")]
pub const EVENT_QUEUE_DEPTH: usize = 8;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    InvalidInstanceId,
    AlreadyInitialized,
    NotInitialized,
    /// Dual and quad line modes are not supported.
    UnsupportedMode,
    UnsupportedWatermark,
    DmaRxBufferMissing,
    DmaRxBufferTooSmall,
    InvalidClockPin,
    /// Chip-select pin `n` is not a valid option for the instance.
    InvalidCsPin(u8),
    /// Data pin `n` is not a valid option for the instance.
    InvalidIoPin(u8),
    InvalidChipSelectCount,
    Gpio(gpio::Error),
    TransmitterBusy,
    InvalidCsIndex,
    /// TX DMA is enabled, raw transmits are not allowed.
    DmaHandlesTx,
    /// RX DMA is enabled, polled receive is not allowed.
    DmaHandlesRx,
    DmaNotEnabled,
    RawTxBufferMissing,
    TxBufferTooLong,
    /// A receive callback is registered and consumes incoming bytes.
    ReceiveFunctionHandlesRx,
    EmptyBuffer,
}

impl From<gpio::Error> for Error {
    fn from(e: gpio::Error) -> Self {
        Error::Gpio(e)
    }
}

impl embedded_hal::spi::Error for Error {
    fn kind(&self) -> embedded_hal::spi::ErrorKind {
        match *self {
            Self::InvalidCsIndex | Self::InvalidCsPin(_) => embedded_hal::spi::ErrorKind::ChipSelectFault,
            _ => embedded_hal::spi::ErrorKind::Other,
        }
    }
}

/// SPI instance.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpiId {
    Spi0 = 0,
    Spi1 = 1,
}

impl SpiId {
    pub const ALL: [SpiId; 2] = [SpiId::Spi0, SpiId::Spi1];

    #[inline]
    pub const fn number(self) -> u8 {
        self as u8
    }

    #[inline]
    pub(crate) const fn index(self) -> usize {
        self as usize
    }

    pub const fn interrupt(self) -> Interrupt {
        match self {
            SpiId::Spi0 => Interrupt::Spi0,
            SpiId::Spi1 => Interrupt::Spi1,
        }
    }

    pub const fn clock(self) -> PeripheralClock {
        match self {
            SpiId::Spi0 => PeripheralClock::Spi0,
            SpiId::Spi1 => PeripheralClock::Spi1,
        }
    }

    /// Pin-mux function for the clock, data and first chip-select pins.
    pub const fn pin_mode(self) -> PinMode {
        match self {
            SpiId::Spi0 => PinMode::Spi0,
            SpiId::Spi1 => PinMode::Spi1,
        }
    }

    pub const fn max_chip_selects(self) -> u8 {
        match self {
            SpiId::Spi0 => MAX_CHIP_SELECTS as u8,
            SpiId::Spi1 => 1,
        }
    }
}

impl TryFrom<u8> for SpiId {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SpiId::Spi0),
            1 => Ok(SpiId::Spi1),
            _ => Err(Error::InvalidInstanceId),
        }
    }
}

/// Number of data lines.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LineMode {
    Normal,
    Dual,
    Quad,
}

impl LineMode {
    pub(crate) fn field(self) -> FieldValue<u32, AUX_CONTROL::Register> {
        match self {
            LineMode::Normal => AUX_CONTROL::MODE::Normal,
            LineMode::Dual => AUX_CONTROL::MODE::Dual,
            LineMode::Quad => AUX_CONTROL::MODE::Quad,
        }
    }

    pub(crate) fn from_aux(aux: LocalRegisterCopy<u32, AUX_CONTROL::Register>) -> Self {
        match aux.read_as_enum(AUX_CONTROL::MODE) {
            Some(AUX_CONTROL::MODE::Value::Dual) => LineMode::Dual,
            Some(AUX_CONTROL::MODE::Value::Quad) => LineMode::Quad,
            _ => LineMode::Normal,
        }
    }
}

/// FIFO word size.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BitSize {
    Bits8,
    Bits32,
}

impl BitSize {
    pub(crate) fn field(self) -> FieldValue<u32, AUX_CONTROL::Register> {
        match self {
            BitSize::Bits8 => AUX_CONTROL::BIT_SIZE::Bits8,
            BitSize::Bits32 => AUX_CONTROL::BIT_SIZE::Bits32,
        }
    }

    pub(crate) fn from_aux(aux: LocalRegisterCopy<u32, AUX_CONTROL::Register>) -> Option<Self> {
        match aux.read_as_enum(AUX_CONTROL::BIT_SIZE)? {
            AUX_CONTROL::BIT_SIZE::Value::Bits8 => Some(BitSize::Bits8),
            AUX_CONTROL::BIT_SIZE::Value::Bits32 => Some(BitSize::Bits32),
        }
    }
}

/// TX FIFO level, in bytes, that raises the TX-watermark interrupt.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxWatermark {
    Level8,
    Level16,
    Level24,
}

impl TxWatermark {
    pub(crate) fn field(self) -> FieldValue<u32, CONTROL::Register> {
        match self {
            TxWatermark::Level8 => CONTROL::TX_WMARK::Level8,
            TxWatermark::Level16 => CONTROL::TX_WMARK::Level16,
            TxWatermark::Level24 => CONTROL::TX_WMARK::Level24,
        }
    }

    pub(crate) fn from_control(ctrl: LocalRegisterCopy<u32, CONTROL::Register>) -> Option<Self> {
        match ctrl.read_as_enum(CONTROL::TX_WMARK)? {
            CONTROL::TX_WMARK::Value::Level8 => Some(TxWatermark::Level8),
            CONTROL::TX_WMARK::Value::Level16 => Some(TxWatermark::Level16),
            CONTROL::TX_WMARK::Value::Level24 => Some(TxWatermark::Level24),
        }
    }
}

impl TryFrom<u32> for TxWatermark {
    type Error = Error;

    fn try_from(level: u32) -> Result<Self, Self::Error> {
        match level {
            8 => Ok(TxWatermark::Level8),
            16 => Ok(TxWatermark::Level16),
            24 => Ok(TxWatermark::Level24),
            _ => Err(Error::UnsupportedWatermark),
        }
    }
}

/// RX FIFO level, in bytes, that raises the RX-watermark interrupt.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RxWatermark {
    Level8,
    Level16,
    Level24,
}

impl RxWatermark {
    pub(crate) fn field(self) -> FieldValue<u32, CONTROL::Register> {
        match self {
            RxWatermark::Level8 => CONTROL::RX_WMARK::Level8,
            RxWatermark::Level16 => CONTROL::RX_WMARK::Level16,
            RxWatermark::Level24 => CONTROL::RX_WMARK::Level24,
        }
    }

    pub(crate) fn from_control(ctrl: LocalRegisterCopy<u32, CONTROL::Register>) -> Option<Self> {
        match ctrl.read_as_enum(CONTROL::RX_WMARK)? {
            CONTROL::RX_WMARK::Value::Level8 => Some(RxWatermark::Level8),
            CONTROL::RX_WMARK::Value::Level16 => Some(RxWatermark::Level16),
            CONTROL::RX_WMARK::Value::Level24 => Some(RxWatermark::Level24),
        }
    }
}

impl TryFrom<u32> for RxWatermark {
    type Error = Error;

    fn try_from(level: u32) -> Result<Self, Self::Error> {
        match level {
            8 => Ok(RxWatermark::Level8),
            16 => Ok(RxWatermark::Level16),
            24 => Ok(RxWatermark::Level24),
            _ => Err(Error::UnsupportedWatermark),
        }
    }
}

/// Controller clock, derived from the 32 MHz peripheral clock.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClockRate {
    Mhz32,
    Mhz16,
    Mhz8,
    Mhz4,
    Mhz2,
    Mhz1,
    Khz500,
    Khz250,
    Khz125,
}

impl ClockRate {
    /// Clock divider register value.
    pub const fn divider(self) -> u32 {
        match self {
            ClockRate::Mhz32 => 0x000,
            ClockRate::Mhz16 => 0x100,
            ClockRate::Mhz8 => 0x101,
            ClockRate::Mhz4 => 0x103,
            ClockRate::Mhz2 => 0x107,
            ClockRate::Mhz1 => 0x10F,
            ClockRate::Khz500 => 0x11F,
            ClockRate::Khz250 => 0x13F,
            ClockRate::Khz125 => 0x17F,
        }
    }

    pub const fn from_divider(div: u32) -> Option<Self> {
        match div {
            0x000 => Some(ClockRate::Mhz32),
            0x100 => Some(ClockRate::Mhz16),
            0x101 => Some(ClockRate::Mhz8),
            0x103 => Some(ClockRate::Mhz4),
            0x107 => Some(ClockRate::Mhz2),
            0x10F => Some(ClockRate::Mhz1),
            0x11F => Some(ClockRate::Khz500),
            0x13F => Some(ClockRate::Khz250),
            0x17F => Some(ClockRate::Khz125),
            _ => None,
        }
    }

    pub const fn hz(self) -> u32 {
        match self {
            ClockRate::Mhz32 => 32_000_000,
            ClockRate::Mhz16 => 16_000_000,
            ClockRate::Mhz8 => 8_000_000,
            ClockRate::Mhz4 => 4_000_000,
            ClockRate::Mhz2 => 2_000_000,
            ClockRate::Mhz1 => 1_000_000,
            ClockRate::Khz500 => 500_000,
            ClockRate::Khz250 => 250_000,
            ClockRate::Khz125 => 125_000,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BitOrder {
    LsbFirst,
    MsbFirst,
}

/// Called with received bytes, from interrupt context.
pub type ReceiveCallback = fn(&[u8]);
/// Called once per interrupt with the combined events.
pub type EventCallback = fn(SpiId, Events);

bitflags! {
    /// Events reported by the interrupt dispatcher.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Events: u16 {
        const TX_EMPTY = 1 << 0;
        const TX_WATERMARK = 1 << 1;
        const RX_WATERMARK = 1 << 2;
        const RX_FULL = 1 << 3;
        const RX_HAS_MORE_DATA = 1 << 4;
        const TRANSFER_DONE = 1 << 5;
        /// Received bytes were handed to the receive callback.
        const RX_TO_USER_FX = 1 << 6;
        /// Received bytes are waiting to be polled.
        const RX_READY = 1 << 7;
        const DMA_RX_TO_USER_FX = 1 << 8;
        const DMA_RX_READY = 1 << 9;
        const DMA_TX_COMPLETE = 1 << 10;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Events {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "Events({=u16:#x})", self.bits())
    }
}

/// Record pushed to the event queue once per interrupt.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SpiEvent {
    pub id: SpiId,
    pub events: Events,
}

#[cfg(feature = "embassy")]
pub type EventQueue = embassy_sync::channel::Channel<
    embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex,
    SpiEvent,
    EVENT_QUEUE_DEPTH,
>;

/// Outcome of a successful receive.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RxStatus {
    /// More bytes are waiting in the RX FIFO.
    MoreBytes,
    Done,
}

/// Per-instance settings, copied into the driver at init.
#[derive(Debug, Copy, Clone)]
pub struct Settings {
    /// `true` runs as bus controller, `false` as peripheral.
    pub controller: bool,
    pub line_mode: LineMode,
    pub pins: PinConfig,
    /// SDO wired to SDI between the devices. Only affects peripherals.
    pub pins_crossed: bool,
    pub mode: Mode,
    /// Only used as controller.
    pub clock_rate: ClockRate,
    pub bit_size: BitSize,
    /// Keep chip select asserted for the whole transfer (controller only).
    pub continuous_transfer: bool,
    pub byte_swap: bool,
    pub bit_order: BitOrder,
    pub inter_transfer_delay: bool,
    pub delay_cycles: u16,
    pub rx_dma_enabled: bool,
    pub tx_dma_enabled: bool,
    pub rx_callback: Option<ReceiveCallback>,
    pub event_callback: Option<EventCallback>,
    pub enable_interrupts: bool,
    pub interrupt_priority: Priority,
    /// Leave interrupts running across `power_off`.
    pub wake_on_interrupt: bool,
    pub tx_watermark: TxWatermark,
    pub rx_watermark: RxWatermark,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            controller: true,
            line_mode: LineMode::Normal,
            pins: PinConfig::SPI0_OPTION1,
            pins_crossed: false,
            mode: MODE_0,
            clock_rate: ClockRate::Mhz1,
            bit_size: BitSize::Bits8,
            continuous_transfer: true,
            byte_swap: false,
            bit_order: BitOrder::MsbFirst,
            inter_transfer_delay: false,
            delay_cycles: 0,
            rx_dma_enabled: false,
            tx_dma_enabled: false,
            rx_callback: None,
            event_callback: None,
            enable_interrupts: true,
            interrupt_priority: Priority::P5,
            wake_on_interrupt: false,
            tx_watermark: TxWatermark::Level8,
            rx_watermark: RxWatermark::Level8,
        }
    }
}

impl Settings {
    // CPHA
    fn raw_phase(&self) -> bool {
        match self.mode.phase {
            Phase::CaptureOnSecondTransition => true,
            Phase::CaptureOnFirstTransition => false,
        }
    }

    // CPOL
    fn raw_polarity(&self) -> bool {
        match self.mode.polarity {
            Polarity::IdleLow => false,
            Polarity::IdleHigh => true,
        }
    }

    fn msb_first(&self) -> bool {
        match self.bit_order {
            BitOrder::LsbFirst => false,
            BitOrder::MsbFirst => true,
        }
    }

    pub(crate) fn control_fields(&self) -> FieldValue<u32, CONTROL::Register> {
        let controller = self.controller;
        CONTROL::CONTINUOUS_TRANSFER.val((controller && self.continuous_transfer) as u32)
            + CONTROL::BYTE_SWAP.val(self.byte_swap as u32)
            + CONTROL::MSB_FIRST.val(self.msb_first() as u32)
            + CONTROL::CPHA.val(self.raw_phase() as u32)
            + CONTROL::CPOL.val(self.raw_polarity() as u32)
            + CONTROL::CONTROLLER.val(controller as u32)
            + CONTROL::INTER_TRANSFER_DELAY.val((controller && self.inter_transfer_delay) as u32)
            // Peripheral only.
            + CONTROL::SDATA_NOT_CROSSED.val((!controller && !self.pins_crossed) as u32)
            + self.tx_watermark.field()
            + self.rx_watermark.field()
    }

    pub(crate) fn aux_control_fields(&self) -> FieldValue<u32, AUX_CONTROL::Register> {
        self.line_mode.field() + self.bit_size.field()
    }
}

/// Configuration handed to [`SpiDriver::init`].
pub struct Config<'d> {
    pub settings: Settings,
    /// Required when `settings.rx_dma_enabled`.
    pub rx_dma_buffer: Option<&'d mut [u8]>,
    /// Staging buffer for raw transmits longer than the TX FIFO.
    pub raw_tx_buffer: Option<&'d mut [u8]>,
    #[cfg(feature = "embassy")]
    pub event_queue: Option<&'d EventQueue>,
}

impl<'d> Default for Config<'d> {
    fn default() -> Self {
        Self {
            settings: Settings::default(),
            rx_dma_buffer: None,
            raw_tx_buffer: None,
            #[cfg(feature = "embassy")]
            event_queue: None,
        }
    }
}

/// Active configuration as reported by [`SpiDriver::settings_read`].
///
/// Protocol fields are decoded from the registers; a register holding a
/// value the driver never programs falls back to the cached setting.
#[derive(Debug, Copy, Clone)]
pub struct ConfigReadback {
    pub settings: Settings,
    pub rx_dma_buffer_addr: u32,
    pub rx_dma_buffer_len: u32,
    pub raw_tx_buffer_len: usize,
    pub event_queue: bool,
}

/// Transfer statistics since init.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Stats {
    pub tx_started: u32,
    pub tx_finished: u32,
    pub rx_bytes: u32,
    /// Times a stale busy flag was cleared by a new transfer.
    pub busy_recoveries: u32,
}

/// Buffers handed back by [`SpiDriver::uninit`].
#[derive(Debug)]
pub struct Released<'d> {
    pub raw_tx_buffer: Option<&'d mut [u8]>,
    pub rx_dma_buffer: Option<&'d mut [u8]>,
}

/// SPI driver for both instances.
pub struct SpiDriver<'d, H: Hardware> {
    hw: H,
    states: [State<'d>; 2],
}

impl<'d, H: Hardware> SpiDriver<'d, H> {
    pub const fn new(hw: H) -> Self {
        Self {
            hw,
            states: [State::new(), State::new()],
        }
    }

    pub fn hardware(&self) -> &H {
        &self.hw
    }

    #[inline]
    fn state(&self, id: SpiId) -> &State<'d> {
        &self.states[id.index()]
    }

    #[inline]
    fn regs(&self, id: SpiId) -> &H::Registers {
        self.hw.registers(id)
    }

    pub fn is_initialized(&self, id: SpiId) -> bool {
        self.state(id).is_initialized()
    }

    /// Non-blocking full-duplex handle on one chip select.
    pub fn device(&self, id: SpiId, cs: u8) -> SpiDevice<'_, 'd, H> {
        SpiDevice { driver: self, id, cs }
    }
}

/// [`embedded_hal_nb::spi::FullDuplex`] over one instance and chip select.
///
/// A transfer still in flight is reported as `WouldBlock`.
pub struct SpiDevice<'a, 'd, H: Hardware> {
    driver: &'a SpiDriver<'d, H>,
    id: SpiId,
    cs: u8,
}

impl<'a, 'd, H: Hardware> embedded_hal::spi::ErrorType for SpiDevice<'a, 'd, H> {
    type Error = Error;
}

impl<'a, 'd, H: Hardware> embedded_hal_nb::spi::FullDuplex<u8> for SpiDevice<'a, 'd, H> {
    fn read(&mut self) -> nb::Result<u8, Error> {
        match self.driver.raw_rx_one_byte(self.id) {
            Ok((byte, _)) => Ok(byte),
            Err(nb::Error::Other(Error::TransmitterBusy)) => Err(nb::Error::WouldBlock),
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, word: u8) -> nb::Result<(), Error> {
        match self.driver.raw_tx_one_byte(self.id, self.cs, word, true) {
            Ok(()) => Ok(()),
            Err(Error::TransmitterBusy) => Err(nb::Error::WouldBlock),
            Err(e) => Err(nb::Error::Other(e)),
        }
    }
}
