use tock_registers::fields::FieldValue;
use tock_registers::LocalRegisterCopy;

use crate::gpio::{PinControl, PinMode};
use crate::interrupt::InterruptController;
use crate::pac::{self, Reg, RegisterBlock, CONTROL, DMA_INTERRUPT, ENABLE, SELECT};
use crate::peripheral::Hardware;
use crate::rcc::ClockGate;

use super::pins;
use super::state::{Chunk, DmaRxBuffer, Slot};
use super::{
    BitSize, ClockRate, Config, ConfigReadback, Error, LineMode, Released, RxWatermark, Settings, SpiDriver, SpiId,
    Stats, TxWatermark, DMA_RX_BUFFER_MIN,
};

fn dma_interrupts(settings: &Settings) -> FieldValue<u32, DMA_INTERRUPT::Register> {
    DMA_INTERRUPT::TX.val(settings.tx_dma_enabled as u32) + DMA_INTERRUPT::RX.val(settings.rx_dma_enabled as u32)
}

impl<'d, H: Hardware> SpiDriver<'d, H> {
    /// Configure and start an instance.
    ///
    /// Every setting is checked before anything is written. The buffers in
    /// `config` stay with the driver until [`uninit`](Self::uninit).
    pub fn init(&self, id: SpiId, config: Config<'d>) -> Result<(), Error> {
        let state = self.state(id);
        let reservation = state.reserve()?;

        let settings = config.settings;
        if settings.line_mode != LineMode::Normal {
            return Err(Error::UnsupportedMode);
        }
        if settings.rx_dma_enabled {
            match config.rx_dma_buffer.as_deref() {
                None => return Err(Error::DmaRxBufferMissing),
                Some(buf) if buf.len() < DMA_RX_BUFFER_MIN => return Err(Error::DmaRxBufferTooSmall),
                Some(_) => {}
            }
        }
        let plan = pins::validate(id, &settings)?;

        pins::apply(&self.hw, &plan)?;

        let regs = self.regs(id);
        regs.write(Reg::ControllerDelay, settings.delay_cycles as u32);
        regs.write_fields(Reg::Control, settings.control_fields());
        let aux = LocalRegisterCopy::new(settings.aux_control_fields().value);
        regs.write(Reg::AuxControl, aux.get());
        if settings.controller {
            regs.write(Reg::ClockDivider, settings.clock_rate.divider());
        }

        regs.write_fields(Reg::DmaTxEnable, ENABLE::ON::CLEAR);
        regs.write_fields(Reg::DmaRxEnable, ENABLE::ON::CLEAR);
        let rx_dma = config.rx_dma_buffer.map(DmaRxBuffer::new);
        if settings.rx_dma_enabled {
            if let Some(buf) = &rx_dma {
                regs.write_address(Reg::DmaRxAddr, buf.as_ptr());
                regs.write(Reg::DmaRxLen, buf.hw_len());
                regs.write_fields(Reg::DmaRxEnable, ENABLE::ON::SET);
            }
        }
        if settings.enable_interrupts {
            regs.write_fields(Reg::DmaInterruptEnable, dma_interrupts(&settings));
        }

        state.reset();

        let irq_line = id.interrupt();
        if settings.enable_interrupts {
            regs.write_fields(Reg::InterruptEnable, pac::all_interrupts());
        } else {
            regs.write(Reg::InterruptEnable, 0);
        }
        ClockGate::enable(&self.hw, id.clock());
        if settings.enable_interrupts {
            self.hw.set_priority(irq_line, settings.interrupt_priority);
            InterruptController::enable(&self.hw, irq_line);
        }

        regs.write_fields(Reg::PeripheralSelectPolarity, SELECT::CS::CLEAR);
        regs.write_fields(Reg::PeripheralSelect, SELECT::CS::CLEAR);
        regs.write_fields(Reg::Enable, ENABLE::ON::SET);

        reservation.install(Slot {
            settings,
            raw_tx_buffer: config.raw_tx_buffer,
            rx_dma,
            dma_tx: None,
            #[cfg(feature = "embassy")]
            event_queue: config.event_queue,
            aux_ctrl_shadow: aux,
            chunk: Chunk::default(),
            dma_rx_index: 0,
        });

        debug!("spi{}: initialized", id.number());
        Ok(())
    }

    /// Stop an instance, return its pins to GPIO and hand back its buffers.
    ///
    /// Statistics stay as they were until the next `init`.
    pub fn uninit(&self, id: SpiId) -> Result<Released<'d>, Error> {
        let state = self.state(id);
        let regs = self.regs(id);

        let slot = critical_section::with(|cs| {
            state.with_cs(cs, |_| ())?;
            regs.write_fields(Reg::Enable, ENABLE::ON::CLEAR);
            regs.write_fields(Reg::DmaRxEnable, ENABLE::ON::CLEAR);
            regs.write_fields(Reg::DmaTxEnable, ENABLE::ON::CLEAR);
            state.take().ok_or(Error::NotInitialized)
        })?;

        // Validated at init, so rebuilding the plan cannot fail.
        if let Ok(plan) = pins::validate(id, &slot.settings) {
            pins::release(&self.hw, &plan);
        }
        if let (Some(io2), Some(io3)) = (slot.settings.pins.io2, slot.settings.pins.io3) {
            if slot.settings.line_mode == LineMode::Quad {
                let _ = self.hw.set_mode(io2, PinMode::Gpio);
                let _ = self.hw.set_mode(io3, PinMode::Gpio);
            }
        }

        let irq_line = id.interrupt();
        self.hw.unpend(irq_line);
        InterruptController::disable(&self.hw, irq_line);
        ClockGate::disable(&self.hw, id.clock());
        state.release();
        state.vacate();

        debug!("spi{}: uninitialized", id.number());
        Ok(Released {
            raw_tx_buffer: slot.raw_tx_buffer,
            rx_dma_buffer: slot.rx_dma.map(DmaRxBuffer::into_inner),
        })
    }

    /// Active configuration: protocol fields read back from the hardware,
    /// the rest from the copy kept at init.
    pub fn settings_read(&self, id: SpiId) -> Result<ConfigReadback, Error> {
        let regs = self.regs(id);
        let (cached, raw_tx_buffer_len, event_queue) = self.state(id).with(|slot| {
            #[cfg(feature = "embassy")]
            let queue = slot.event_queue.is_some();
            #[cfg(not(feature = "embassy"))]
            let queue = false;
            (
                slot.settings,
                slot.raw_tx_buffer.as_deref().map_or(0, <[u8]>::len),
                queue,
            )
        })?;

        let ctrl = regs.snapshot::<CONTROL::Register>(Reg::Control);
        let aux = regs.snapshot(Reg::AuxControl);
        let controller = ctrl.is_set(CONTROL::CONTROLLER);
        let rx_dma_enabled = regs.snapshot::<ENABLE::Register>(Reg::DmaRxEnable).is_set(ENABLE::ON);

        let mut settings = cached;
        settings.controller = controller;
        settings.mode = embedded_hal::spi::Mode {
            polarity: if ctrl.is_set(CONTROL::CPOL) {
                embedded_hal::spi::Polarity::IdleHigh
            } else {
                embedded_hal::spi::Polarity::IdleLow
            },
            phase: if ctrl.is_set(CONTROL::CPHA) {
                embedded_hal::spi::Phase::CaptureOnSecondTransition
            } else {
                embedded_hal::spi::Phase::CaptureOnFirstTransition
            },
        };
        settings.byte_swap = ctrl.is_set(CONTROL::BYTE_SWAP);
        settings.bit_order = if ctrl.is_set(CONTROL::MSB_FIRST) {
            super::BitOrder::MsbFirst
        } else {
            super::BitOrder::LsbFirst
        };
        if controller {
            settings.continuous_transfer = ctrl.is_set(CONTROL::CONTINUOUS_TRANSFER);
            settings.inter_transfer_delay = ctrl.is_set(CONTROL::INTER_TRANSFER_DELAY);
            settings.clock_rate = ClockRate::from_divider(regs.read(Reg::ClockDivider)).unwrap_or(cached.clock_rate);
        } else {
            settings.pins_crossed = !ctrl.is_set(CONTROL::SDATA_NOT_CROSSED);
        }
        settings.tx_watermark = TxWatermark::from_control(ctrl).unwrap_or(cached.tx_watermark);
        settings.rx_watermark = RxWatermark::from_control(ctrl).unwrap_or(cached.rx_watermark);
        settings.line_mode = LineMode::from_aux(aux);
        settings.bit_size = BitSize::from_aux(aux).unwrap_or(cached.bit_size);
        settings.rx_dma_enabled = rx_dma_enabled;
        settings.interrupt_priority = self.hw.priority(id.interrupt());
        settings.enable_interrupts = regs.read(Reg::InterruptEnable) != 0;
        settings.delay_cycles = regs.read(Reg::ControllerDelay) as u16;

        let (rx_dma_buffer_addr, rx_dma_buffer_len) = if rx_dma_enabled {
            (regs.read(Reg::DmaRxAddr), regs.read(Reg::DmaRxLen))
        } else {
            (0, 0)
        };

        Ok(ConfigReadback {
            settings,
            rx_dma_buffer_addr,
            rx_dma_buffer_len,
            raw_tx_buffer_len,
            event_queue,
        })
    }

    /// Prepare an instance for sleep.
    ///
    /// Unless `wake_on_interrupt` is set, interrupts and the peripheral
    /// clock are turned off. A DMA transmit in flight is abandoned.
    pub fn power_off(&self, id: SpiId) -> Result<(), Error> {
        let settings = self.state(id).with(|slot| slot.settings)?;
        if settings.wake_on_interrupt {
            return Ok(());
        }

        let regs = self.regs(id);
        regs.write(Reg::DmaInterruptEnable, 0);
        regs.write(Reg::InterruptEnable, 0);
        let irq_line = id.interrupt();
        self.hw.unpend(irq_line);
        InterruptController::disable(&self.hw, irq_line);
        ClockGate::disable(&self.hw, id.clock());

        debug!("spi{}: powered off", id.number());
        Ok(())
    }

    /// Undo [`power_off`](Self::power_off).
    pub fn power_on(&self, id: SpiId) -> Result<(), Error> {
        let settings = self.state(id).with(|slot| slot.settings)?;
        if settings.wake_on_interrupt || !settings.enable_interrupts {
            return Ok(());
        }

        let regs = self.regs(id);
        regs.write_fields(Reg::InterruptEnable, pac::all_interrupts());
        regs.write_fields(Reg::DmaInterruptEnable, dma_interrupts(&settings));
        ClockGate::enable(&self.hw, id.clock());
        let irq_line = id.interrupt();
        self.hw.set_priority(irq_line, settings.interrupt_priority);
        InterruptController::enable(&self.hw, irq_line);

        debug!("spi{}: powered on", id.number());
        Ok(())
    }

    pub fn read_stats(&self, id: SpiId) -> Result<Stats, Error> {
        let state = self.state(id);
        if !state.is_initialized() {
            return Err(Error::NotInitialized);
        }
        Ok(state.stats())
    }

    /// Clear a stuck transmitter-busy condition.
    ///
    /// Forces the transmit phase to idle and raises `tx_finished` to
    /// `tx_started` when it lags behind.
    pub fn clear_tx_busy(&self, id: SpiId) -> Result<(), Error> {
        let state = self.state(id);
        critical_section::with(|cs| {
            state.clear_busy();
            let _ = state.with_cs(cs, |slot| slot.chunk = Chunk::default());
        });
        Ok(())
    }
}
