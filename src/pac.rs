//! Register maps and fields for the T32CM11 SPI controllers and the system
//! control block.
//!
//! Drivers never touch memory directly. They go through [`RegisterBlock`],
//! which the chip implements on [`SpiRegisters`] and tests implement with a
//! recording mock.

use core::ops::Deref;

use tock_registers::fields::FieldValue;
use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::registers::{ReadOnly, ReadWrite, WriteOnly};
use tock_registers::{register_bitfields, register_structs, LocalRegisterCopy, RegisterLongName};

/// Base address of the SPI0 controller.
pub const SPI0_BASE: usize = 0xB000_0000;
/// Base address of the SPI1 controller.
pub const SPI1_BASE: usize = 0x8000_0000;
/// Base address of the system control block (clock gates, pin mux).
pub const SYS_CTRL_BASE: usize = 0x4080_0000;

register_structs! {
    pub SpiRegisters {
        (0x00 => tx_data: WriteOnly<u32>),
        (0x04 => rx_data: ReadOnly<u32>),
        (0x08 => _reserved0),
        (0x0C => control: ReadWrite<u32, CONTROL::Register>),
        (0x10 => aux_control: ReadWrite<u32, AUX_CONTROL::Register>),
        (0x14 => status: ReadOnly<u32>),
        (0x18 => peripheral_select: ReadWrite<u32, SELECT::Register>),
        (0x1C => peripheral_select_polarity: ReadWrite<u32, SELECT::Register>),
        (0x20 => interrupt_enable: ReadWrite<u32, INTERRUPT::Register>),
        (0x24 => interrupt_status: ReadOnly<u32, INTERRUPT::Register>),
        (0x28 => interrupt_clear: WriteOnly<u32, INTERRUPT::Register>),
        (0x2C => tx_fifo_level: ReadOnly<u32>),
        (0x30 => rx_fifo_level: ReadOnly<u32>),
        (0x34 => _reserved1),
        (0x38 => controller_delay: ReadWrite<u32>),
        (0x3C => enable: ReadWrite<u32, ENABLE::Register>),
        (0x40 => _reserved2),
        (0x50 => clock_divider: ReadWrite<u32>),
        (0x54 => _reserved3),
        (0x60 => dma_rx_addr: ReadWrite<u32>),
        (0x64 => dma_rx_len: ReadWrite<u32>),
        (0x68 => dma_tx_addr: ReadWrite<u32>),
        (0x6C => dma_tx_len: ReadWrite<u32>),
        (0x70 => dma_rx_remaining: ReadOnly<u32>),
        (0x74 => dma_tx_remaining: ReadOnly<u32>),
        (0x78 => dma_interrupt_enable: ReadWrite<u32, DMA_INTERRUPT::Register>),
        /// Write one to clear.
        (0x7C => dma_interrupt_status: ReadWrite<u32, DMA_INTERRUPT::Register>),
        (0x80 => dma_rx_enable: ReadWrite<u32, ENABLE::Register>),
        (0x84 => dma_tx_enable: ReadWrite<u32, ENABLE::Register>),
        (0x88 => @END),
    }
}

register_structs! {
    pub SysCtrlRegisters {
        (0x00 => _reserved0),
        (0x04 => clock_control: ReadWrite<u32, CLOCK_CONTROL::Register>),
        (0x08 => _reserved1),
        /// Four pin-mux registers, 8 pins per register, 4 bits per pin.
        (0x10 => pin_map: [ReadWrite<u32>; 4]),
        (0x20 => @END),
    }
}

register_bitfields![u32,
    pub CONTROL [
        CONTINUOUS_TRANSFER OFFSET(0) NUMBITS(1) [],
        BYTE_SWAP OFFSET(1) NUMBITS(1) [],
        MSB_FIRST OFFSET(2) NUMBITS(1) [],
        CPHA OFFSET(3) NUMBITS(1) [],
        CPOL OFFSET(4) NUMBITS(1) [],
        CONTROLLER OFFSET(5) NUMBITS(1) [],
        /// Data line selection used as peripheral when SDO/SDI are wired straight.
        SDATA_NOT_CROSSED OFFSET(6) NUMBITS(1) [],
        INTER_TRANSFER_DELAY OFFSET(11) NUMBITS(1) [],
        RX_WMARK OFFSET(12) NUMBITS(2) [
            Level8 = 1,
            Level16 = 2,
            Level24 = 3
        ],
        TX_WMARK OFFSET(14) NUMBITS(2) [
            Level8 = 1,
            Level16 = 2,
            Level24 = 3
        ]
    ],
    pub AUX_CONTROL [
        MODE OFFSET(0) NUMBITS(2) [
            Normal = 0,
            Dual = 2,
            Quad = 3
        ],
        PREVENT_TX OFFSET(2) NUMBITS(1) [],
        PREVENT_RX OFFSET(3) NUMBITS(1) [],
        BIT_SIZE OFFSET(4) NUMBITS(3) [
            Bits8 = 1,
            Bits32 = 7
        ],
        TRANSFER_EXTEND OFFSET(7) NUMBITS(1) []
    ],
    /// Peripheral select and its polarity, one bit per chip select.
    pub SELECT [
        CS OFFSET(0) NUMBITS(4) []
    ],
    /// Interrupt enable, status and clear.
    pub INTERRUPT [
        TX_EMPTY OFFSET(0) NUMBITS(1) [],
        TX_WMARK OFFSET(1) NUMBITS(1) [],
        RX_WMARK OFFSET(2) NUMBITS(1) [],
        RX_FULL OFFSET(3) NUMBITS(1) [],
        TRANSFER_DONE OFFSET(4) NUMBITS(1) [],
        RX_NOT_EMPTY OFFSET(5) NUMBITS(1) []
    ],
    pub DMA_INTERRUPT [
        RX OFFSET(0) NUMBITS(1) [],
        TX OFFSET(1) NUMBITS(1) []
    ],
    /// Controller enable and the two DMA channel enables.
    pub ENABLE [
        ON OFFSET(0) NUMBITS(1) []
    ],
    pub CLOCK_CONTROL [
        SPI0 OFFSET(20) NUMBITS(1) [],
        SPI1 OFFSET(21) NUMBITS(1) []
    ]
];

/// Every SPI interrupt source.
pub fn all_interrupts() -> FieldValue<u32, INTERRUPT::Register> {
    INTERRUPT::TX_EMPTY::SET
        + INTERRUPT::TX_WMARK::SET
        + INTERRUPT::RX_WMARK::SET
        + INTERRUPT::RX_FULL::SET
        + INTERRUPT::TRANSFER_DONE::SET
        + INTERRUPT::RX_NOT_EMPTY::SET
}

/// Select field value for chip-select `index` (0..=3).
pub fn chip_select(index: u8) -> FieldValue<u32, SELECT::Register> {
    SELECT::CS.val(1 << index)
}

/// SPI controller registers, as named by the driver.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Reg {
    TxData,
    RxData,
    Control,
    AuxControl,
    Status,
    PeripheralSelect,
    PeripheralSelectPolarity,
    InterruptEnable,
    InterruptStatus,
    InterruptClear,
    TxFifoLevel,
    RxFifoLevel,
    ControllerDelay,
    Enable,
    ClockDivider,
    DmaRxAddr,
    DmaRxLen,
    DmaTxAddr,
    DmaTxLen,
    DmaRxRemaining,
    DmaTxRemaining,
    DmaInterruptEnable,
    DmaInterruptStatus,
    DmaRxEnable,
    DmaTxEnable,
}

impl Reg {
    pub const COUNT: usize = 25;

    /// Dense index, used by register mocks.
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Access to one SPI register block.
pub trait RegisterBlock {
    fn read(&self, reg: Reg) -> u32;

    fn write(&self, reg: Reg, value: u32);

    fn modify(&self, reg: Reg, f: impl FnOnce(u32) -> u32) {
        self.write(reg, f(self.read(reg)));
    }

    /// Write `fields`; every field not named is written as zero.
    fn write_fields<R: RegisterLongName>(&self, reg: Reg, fields: FieldValue<u32, R>) {
        self.write(reg, fields.value);
    }

    /// Snapshot of `reg` for decoding its fields.
    fn snapshot<R: RegisterLongName>(&self, reg: Reg) -> LocalRegisterCopy<u32, R> {
        LocalRegisterCopy::new(self.read(reg))
    }

    /// Program a DMA address register with a buffer address.
    fn write_address(&self, reg: Reg, addr: *const u8) {
        self.write(reg, addr as usize as u32);
    }
}

impl RegisterBlock for SpiRegisters {
    fn read(&self, reg: Reg) -> u32 {
        match reg {
            Reg::TxData | Reg::InterruptClear => 0,
            Reg::RxData => self.rx_data.get(),
            Reg::Control => self.control.get(),
            Reg::AuxControl => self.aux_control.get(),
            Reg::Status => self.status.get(),
            Reg::PeripheralSelect => self.peripheral_select.get(),
            Reg::PeripheralSelectPolarity => self.peripheral_select_polarity.get(),
            Reg::InterruptEnable => self.interrupt_enable.get(),
            Reg::InterruptStatus => self.interrupt_status.get(),
            Reg::TxFifoLevel => self.tx_fifo_level.get(),
            Reg::RxFifoLevel => self.rx_fifo_level.get(),
            Reg::ControllerDelay => self.controller_delay.get(),
            Reg::Enable => self.enable.get(),
            Reg::ClockDivider => self.clock_divider.get(),
            Reg::DmaRxAddr => self.dma_rx_addr.get(),
            Reg::DmaRxLen => self.dma_rx_len.get(),
            Reg::DmaTxAddr => self.dma_tx_addr.get(),
            Reg::DmaTxLen => self.dma_tx_len.get(),
            Reg::DmaRxRemaining => self.dma_rx_remaining.get(),
            Reg::DmaTxRemaining => self.dma_tx_remaining.get(),
            Reg::DmaInterruptEnable => self.dma_interrupt_enable.get(),
            Reg::DmaInterruptStatus => self.dma_interrupt_status.get(),
            Reg::DmaRxEnable => self.dma_rx_enable.get(),
            Reg::DmaTxEnable => self.dma_tx_enable.get(),
        }
    }

    fn write(&self, reg: Reg, value: u32) {
        match reg {
            Reg::TxData => self.tx_data.set(value),
            Reg::Control => self.control.set(value),
            Reg::AuxControl => self.aux_control.set(value),
            Reg::PeripheralSelect => self.peripheral_select.set(value),
            Reg::PeripheralSelectPolarity => self.peripheral_select_polarity.set(value),
            Reg::InterruptEnable => self.interrupt_enable.set(value),
            Reg::InterruptClear => self.interrupt_clear.set(value),
            Reg::ControllerDelay => self.controller_delay.set(value),
            Reg::Enable => self.enable.set(value),
            Reg::ClockDivider => self.clock_divider.set(value),
            Reg::DmaRxAddr => self.dma_rx_addr.set(value),
            Reg::DmaRxLen => self.dma_rx_len.set(value),
            Reg::DmaTxAddr => self.dma_tx_addr.set(value),
            Reg::DmaTxLen => self.dma_tx_len.set(value),
            Reg::DmaInterruptEnable => self.dma_interrupt_enable.set(value),
            Reg::DmaInterruptStatus => self.dma_interrupt_status.set(value),
            Reg::DmaRxEnable => self.dma_rx_enable.set(value),
            Reg::DmaTxEnable => self.dma_tx_enable.set(value),
            Reg::RxData
            | Reg::Status
            | Reg::InterruptStatus
            | Reg::TxFifoLevel
            | Reg::RxFifoLevel
            | Reg::DmaRxRemaining
            | Reg::DmaTxRemaining => {}
        }
    }
}

/// Pointer to a register block at a fixed address.
pub struct Mmio<T> {
    ptr: *const T,
}

impl<T> Mmio<T> {
    /// # Safety
    ///
    /// `ptr` must be the address of a register block of layout `T`, and the
    /// caller must not create aliasing drivers for it.
    pub const unsafe fn new(ptr: *const T) -> Self {
        Self { ptr }
    }
}

impl<T> Deref for Mmio<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.ptr }
    }
}

impl<T> core::fmt::Debug for Mmio<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Mmio({:p})", self.ptr)
    }
}

// The pointee is device memory accessed through volatile cells only.
unsafe impl<T> Send for Mmio<T> {}
unsafe impl<T> Sync for Mmio<T> {}

/// Pin-mux layout inside [`SysCtrlRegisters::pin_map`].
pub mod pin_map {
    pub const PINS_PER_REG: u8 = 8;
    pub const FIELD_MASK: u32 = 0x0F;
}

/// System control block: peripheral clock gates and the pin mux.
#[derive(Debug)]
pub struct SysCtrl {
    regs: Mmio<SysCtrlRegisters>,
}

impl SysCtrl {
    /// # Safety
    ///
    /// Only one instance may exist; see [`Mmio::new`].
    pub const unsafe fn new() -> Self {
        Self::at(SYS_CTRL_BASE as *const SysCtrlRegisters)
    }

    pub(crate) const unsafe fn at(ptr: *const SysCtrlRegisters) -> Self {
        Self { regs: Mmio::new(ptr) }
    }

    pub(crate) fn clock_control(&self) -> &ReadWrite<u32, CLOCK_CONTROL::Register> {
        &self.regs.clock_control
    }

    /// Pin-mux register `index` (0..=3).
    pub(crate) fn pin_map(&self, index: usize) -> &ReadWrite<u32> {
        &self.regs.pin_map[index]
    }
}
