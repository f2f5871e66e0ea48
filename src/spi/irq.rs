use core::sync::atomic::Ordering;

use critical_section::CriticalSection;

use crate::pac::{Reg, RegisterBlock, DMA_INTERRUPT, ENABLE, INTERRUPT};
use crate::peripheral::Hardware;

use super::state::{Chunk, TxPhase};
use super::transfer::chunk_continue;
use super::{Events, ReceiveCallback, SpiDriver, SpiId};

impl<'d, H: Hardware> SpiDriver<'d, H> {
    /// Interrupt handler body for instance `id`.
    ///
    /// Call it from the SPI interrupt vector. Does nothing while the
    /// instance is not initialized.
    pub fn on_interrupt(&self, id: SpiId) {
        let regs = self.regs(id);
        critical_section::with(|cs| {
            let Ok(slot) = self.state(id).with_cs(cs, |slot| {
                #[cfg(feature = "embassy")]
                let queue = slot.event_queue;
                #[cfg(not(feature = "embassy"))]
                let queue = ();
                (
                    slot.settings.rx_callback,
                    slot.settings.event_callback,
                    slot.settings.rx_dma_enabled,
                    queue,
                )
            }) else {
                return;
            };
            let (rx_callback, event_callback, rx_dma_enabled, _queue) = slot;

            let dma_status = regs.snapshot::<DMA_INTERRUPT::Register>(Reg::DmaInterruptStatus);
            let status = regs.snapshot::<INTERRUPT::Register>(Reg::InterruptStatus);
            let mut events = Events::empty();

            if status.is_set(INTERRUPT::TX_EMPTY) {
                self.tx_empty(id, cs);
                regs.write_fields(Reg::InterruptClear, INTERRUPT::TX_EMPTY::SET);
                events |= Events::TX_EMPTY;
            }
            if status.is_set(INTERRUPT::TX_WMARK) {
                regs.write_fields(Reg::InterruptClear, INTERRUPT::TX_WMARK::SET);
                events |= Events::TX_WATERMARK;
            }
            if status.is_set(INTERRUPT::RX_WMARK) {
                events |= Events::RX_WATERMARK | self.fifo_rx(id, rx_callback);
                regs.write_fields(Reg::InterruptClear, INTERRUPT::RX_WMARK::SET);
            }
            if status.is_set(INTERRUPT::TRANSFER_DONE) {
                events |= Events::TRANSFER_DONE;
                events |= if rx_dma_enabled {
                    self.dma_rx(id, cs, rx_callback)
                } else {
                    self.fifo_rx(id, rx_callback)
                };
                regs.write_fields(Reg::InterruptClear, INTERRUPT::TRANSFER_DONE::SET);
            }
            if status.is_set(INTERRUPT::RX_FULL) {
                events |= Events::RX_FULL | self.fifo_rx(id, rx_callback);
                regs.write_fields(Reg::InterruptClear, INTERRUPT::RX_FULL::SET);
            }
            if status.is_set(INTERRUPT::RX_NOT_EMPTY) {
                regs.write_fields(Reg::InterruptClear, INTERRUPT::RX_NOT_EMPTY::SET);
                events |= Events::RX_HAS_MORE_DATA;
            }

            if dma_status.is_set(DMA_INTERRUPT::RX) {
                regs.write_fields(Reg::DmaInterruptStatus, DMA_INTERRUPT::RX::SET);
                events |= self.dma_rx(id, cs, rx_callback);
            }
            if dma_status.is_set(DMA_INTERRUPT::TX) {
                regs.write_fields(Reg::DmaInterruptStatus, DMA_INTERRUPT::TX::SET);
                events |= Events::DMA_TX_COMPLETE;
            }

            // Reported once per interrupt, even when nothing was pending.
            if let Some(callback) = event_callback {
                callback(id, events);
            }
            #[cfg(feature = "embassy")]
            if let Some(queue) = _queue {
                if queue.try_send(super::SpiEvent { id, events }).is_err() {
                    warn!("spi{}: event queue full, dropped {}", id.number(), events.bits());
                }
            }
        });
    }

    // Continue a chunked transmit, or finish the one in flight.
    fn tx_empty(&self, id: SpiId, cs: CriticalSection) {
        let state = self.state(id);
        if !state.is_transmitting() {
            return;
        }
        let regs = self.regs(id);
        let _ = state.with_cs(cs, |slot| {
            if slot.chunk.remaining > 0 {
                chunk_continue(regs, slot);
                return;
            }
            slot.chunk = Chunk::default();
            if state.release() == TxPhase::Dma {
                regs.write_fields(Reg::DmaTxEnable, ENABLE::ON::CLEAR);
                if let Some(buf) = slot.dma_tx.take() {
                    trace!("spi{}: dma tx of {} bytes done", id.number(), buf.len());
                }
            }
            state.tx_finished.fetch_add(1, Ordering::Relaxed);
            regs.write(Reg::AuxControl, slot.aux_ctrl_shadow.get());
        });
    }

    fn fifo_rx(&self, id: SpiId, callback: Option<ReceiveCallback>) -> Events {
        match callback {
            Some(callback) if self.drain_fifo(id, callback) > 0 => Events::RX_TO_USER_FX,
            Some(_) => Events::empty(),
            None => Events::RX_READY,
        }
    }

    fn dma_rx(&self, id: SpiId, cs: CriticalSection, callback: Option<ReceiveCallback>) -> Events {
        match callback {
            Some(callback) => {
                self.drain_dma(id, cs, callback);
                Events::DMA_RX_TO_USER_FX
            }
            None => Events::DMA_RX_READY,
        }
    }
}

/// Define interrupt vectors that forward to [`SpiDriver::on_interrupt`].
///
/// ```ignore
/// static SPI: SpiDriver<'static, T32cm11> = SpiDriver::new(unsafe { T32cm11::steal() });
///
/// tr_hal::bind_spi_interrupts!(SPI; qspi0_handler => Spi0, qspi1_handler => Spi1);
/// ```
#[macro_export]
macro_rules! bind_spi_interrupts {
    ($driver:expr; $($vector:ident => $id:ident),* $(,)?) => {
        $(
            #[allow(non_snake_case)]
            #[no_mangle]
            unsafe extern "C" fn $vector() {
                $driver.on_interrupt($crate::spi::SpiId::$id);
            }
        )*
    };
}

#[cfg(test)]
mod tests {
    use embedded_hal_nb::spi::FullDuplex;

    use super::super::mock::{record_event, record_rx, take_events, take_received, MockHardware};
    use super::super::{Config, Error, PinConfig, RxStatus, Settings};
    use super::*;
    use crate::pac::all_interrupts;

    fn with_callbacks() -> Config<'static> {
        Config {
            settings: Settings {
                rx_callback: Some(record_rx),
                event_callback: Some(record_event),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn uninitialized_instance_is_ignored() {
        let drv = SpiDriver::new(MockHardware::new());
        drv.hardware().spi[0].raise(all_interrupts());
        drv.on_interrupt(SpiId::Spi0);
        assert!(drv.hardware().spi[0].writes().is_empty());
    }

    #[test]
    fn events_reported_once_combined() {
        let drv = SpiDriver::new(MockHardware::new());
        drv.init(SpiId::Spi0, with_callbacks()).unwrap();
        take_events();
        let regs = &drv.hardware().spi[0];

        regs.feed_rx(&[7, 8, 9]);
        regs.raise(INTERRUPT::TX_EMPTY::SET + INTERRUPT::RX_WMARK::SET + INTERRUPT::RX_NOT_EMPTY::SET);
        drv.on_interrupt(SpiId::Spi0);

        assert_eq!(
            take_events(),
            vec![(
                SpiId::Spi0,
                Events::TX_EMPTY | Events::RX_WATERMARK | Events::RX_TO_USER_FX | Events::RX_HAS_MORE_DATA
            )]
        );
        assert_eq!(take_received(), vec![vec![7, 8, 9]]);
        assert_eq!(regs.value(Reg::InterruptStatus), 0);
        assert_eq!(drv.read_stats(SpiId::Spi0).unwrap().rx_bytes, 3);
    }

    #[test]
    fn idle_interrupt_still_reports_once() {
        let drv = SpiDriver::new(MockHardware::new());
        drv.init(SpiId::Spi0, with_callbacks()).unwrap();
        take_events();
        drv.hardware().clear_logs();

        drv.on_interrupt(SpiId::Spi0);
        assert_eq!(take_events(), vec![(SpiId::Spi0, Events::empty())]);
        assert!(drv.hardware().spi[0].writes().is_empty());
    }

    #[test]
    fn empty_fifo_is_not_handed_to_callback() {
        let drv = SpiDriver::new(MockHardware::new());
        drv.init(SpiId::Spi0, with_callbacks()).unwrap();
        take_events();
        take_received();

        drv.hardware().spi[0].raise(INTERRUPT::RX_FULL::SET);
        drv.on_interrupt(SpiId::Spi0);
        assert!(take_received().is_empty());
        assert_eq!(take_events(), vec![(SpiId::Spi0, Events::RX_FULL)]);
    }

    #[test]
    fn without_callback_bytes_wait_for_polling() {
        let drv = SpiDriver::new(MockHardware::new());
        drv.init(SpiId::Spi0, Config::default()).unwrap();
        let regs = &drv.hardware().spi[0];

        regs.feed_rx(&[0x33]);
        regs.raise(INTERRUPT::TRANSFER_DONE::SET);
        drv.on_interrupt(SpiId::Spi0);
        assert_eq!(drv.raw_rx_one_byte(SpiId::Spi0), Ok((0x33, RxStatus::Done)));
    }

    #[test]
    fn dma_rx_interrupt_drains_buffer() {
        let mut rx = [0u8; 32];
        let drv = SpiDriver::new(MockHardware::new());
        let config = Config {
            settings: Settings {
                rx_dma_enabled: true,
                rx_callback: Some(record_rx),
                event_callback: Some(record_event),
                ..Default::default()
            },
            rx_dma_buffer: Some(&mut rx),
            ..Default::default()
        };
        drv.init(SpiId::Spi0, config).unwrap();
        take_events();
        take_received();
        let regs = &drv.hardware().spi[0];

        regs.dma_deliver(&[1, 2, 3, 4]);
        regs.raise_dma(DMA_INTERRUPT::RX::SET);
        drv.on_interrupt(SpiId::Spi0);
        assert_eq!(take_received(), vec![vec![1, 2, 3, 4]]);
        assert_eq!(take_events(), vec![(SpiId::Spi0, Events::DMA_RX_TO_USER_FX)]);
        assert_eq!(regs.value(Reg::DmaInterruptStatus), 0);

        regs.dma_deliver(&[5]);
        regs.raise_dma(DMA_INTERRUPT::RX::SET + DMA_INTERRUPT::TX::SET);
        drv.on_interrupt(SpiId::Spi0);
        assert_eq!(take_received(), vec![vec![5]]);
        assert_eq!(
            take_events(),
            vec![(SpiId::Spi0, Events::DMA_RX_TO_USER_FX | Events::DMA_TX_COMPLETE)]
        );
        assert_eq!(drv.state(SpiId::Spi0).with(|s| s.dma_rx_index).unwrap(), 5);
    }

    #[test]
    fn dma_rx_without_callback_reports_ready() {
        let mut rx = [0u8; 16];
        let drv = SpiDriver::new(MockHardware::new());
        let config = Config {
            settings: Settings {
                pins: PinConfig::SPI1,
                rx_dma_enabled: true,
                event_callback: Some(record_event),
                ..Default::default()
            },
            rx_dma_buffer: Some(&mut rx),
            ..Default::default()
        };
        drv.init(SpiId::Spi1, config).unwrap();
        take_events();

        drv.hardware().spi[1].raise(INTERRUPT::TRANSFER_DONE::SET);
        drv.on_interrupt(SpiId::Spi1);
        assert_eq!(
            take_events(),
            vec![(SpiId::Spi1, Events::TRANSFER_DONE | Events::DMA_RX_READY)]
        );
    }

    #[cfg(feature = "embassy")]
    #[test]
    fn events_are_queued() {
        let queue = super::super::EventQueue::new();
        let drv = SpiDriver::new(MockHardware::new());
        let config = Config {
            event_queue: Some(&queue),
            ..Default::default()
        };
        drv.init(SpiId::Spi0, config).unwrap();
        let regs = &drv.hardware().spi[0];

        regs.raise(INTERRUPT::TX_WMARK::SET);
        drv.on_interrupt(SpiId::Spi0);
        assert_eq!(
            queue.try_receive().ok(),
            Some(super::super::SpiEvent {
                id: SpiId::Spi0,
                events: Events::TX_WATERMARK,
            })
        );

        for _ in 0..super::super::EVENT_QUEUE_DEPTH + 2 {
            regs.raise(INTERRUPT::TX_WMARK::SET);
            drv.on_interrupt(SpiId::Spi0);
        }
        let mut queued = 0;
        while queue.try_receive().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, super::super::EVENT_QUEUE_DEPTH);

        drv.on_interrupt(SpiId::Spi0);
        assert_eq!(
            queue.try_receive().ok(),
            Some(super::super::SpiEvent {
                id: SpiId::Spi0,
                events: Events::empty(),
            })
        );
        assert!(queue.try_receive().is_err());
    }

    #[test]
    fn full_duplex_adapter() {
        let drv = SpiDriver::new(MockHardware::new());
        drv.init(SpiId::Spi0, Config::default()).unwrap();
        let mut dev = drv.device(SpiId::Spi0, 0);

        assert_eq!(dev.read(), Err(nb::Error::WouldBlock));
        assert_eq!(dev.write(0x5A), Ok(()));
        assert_eq!(dev.write(0x5B), Err(nb::Error::WouldBlock));
        drv.hardware().spi[0].feed_rx(&[0x99]);
        assert_eq!(dev.read(), Err(nb::Error::WouldBlock));

        drv.hardware().spi[0].raise(INTERRUPT::TX_EMPTY::SET);
        drv.on_interrupt(SpiId::Spi0);
        assert_eq!(dev.read(), Ok(0x99));
        assert_eq!(drv.hardware().spi[0].tx_bytes(), vec![0x5A]);

        let mut other = drv.device(SpiId::Spi0, 1);
        assert_eq!(other.write(0), Err(nb::Error::Other(Error::InvalidCsIndex)));
    }

    std::thread_local! {
        static BOUND: &'static SpiDriver<'static, MockHardware> =
            Box::leak(Box::new(SpiDriver::new(MockHardware::new())));
    }

    fn bound() -> &'static SpiDriver<'static, MockHardware> {
        BOUND.with(|d| *d)
    }

    crate::bind_spi_interrupts!(bound(); tr_hal_test_spi0_vector => Spi0, tr_hal_test_spi1_vector => Spi1,);

    #[test]
    fn bound_vectors_dispatch_to_their_instance() {
        let drv = bound();
        drv.init(SpiId::Spi1, Config {
            settings: Settings {
                pins: PinConfig::SPI1,
                event_callback: Some(record_event),
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();
        take_events();

        drv.hardware().spi[1].raise(INTERRUPT::TX_EMPTY::SET);
        unsafe { tr_hal_test_spi0_vector() };
        assert!(take_events().is_empty());
        unsafe { tr_hal_test_spi1_vector() };
        assert_eq!(take_events(), vec![(SpiId::Spi1, Events::TX_EMPTY)]);
        assert_eq!(drv.hardware().spi[1].value(Reg::InterruptStatus), 0);
    }
}
