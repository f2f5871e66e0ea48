use critical_section::CriticalSection;

use crate::pac::{self, Reg, RegisterBlock, AUX_CONTROL, ENABLE};
use crate::peripheral::Hardware;

use super::state::{Chunk, DmaRxBuffer, Slot, TxPhase};
use super::{Error, ReceiveCallback, RxStatus, SpiDriver, SpiId, DMA_RX_BUFFER_MIN, RX_FIFO_SIZE, TX_FIFO_SIZE};

fn check_cs(id: SpiId, slot: &Slot<'_>, cs: u8) -> Result<(), Error> {
    let count = slot.settings.pins.chip_select_count.min(id.max_chip_selects());
    if cs >= count {
        return Err(Error::InvalidCsIndex);
    }
    Ok(())
}

// Suppress RX for the transfer if asked, then select the peripheral.
fn select_target<R: RegisterBlock>(regs: &R, slot: &Slot<'_>, cs: u8, also_receive: bool) {
    if !also_receive {
        let mut aux = slot.aux_ctrl_shadow;
        aux.modify(AUX_CONTROL::PREVENT_RX::SET);
        regs.write(Reg::AuxControl, aux.get());
    }
    if slot.settings.controller {
        regs.write_fields(Reg::PeripheralSelect, pac::chip_select(cs));
    }
}

fn push<R: RegisterBlock>(regs: &R, bytes: &[u8]) {
    for &b in bytes {
        regs.write(Reg::TxData, b as u32);
    }
}

/// Feed the next FIFO-sized chunk of a long raw transmit. Chip select is
/// left as it is.
pub(super) fn chunk_continue<R: RegisterBlock>(regs: &R, slot: &mut Slot<'_>) {
    let Chunk { sent, remaining } = slot.chunk;
    let n = remaining.min(TX_FIFO_SIZE as u16);
    if let Some(buf) = slot.raw_tx_buffer.as_deref() {
        let start = sent as usize;
        let end = (start + n as usize).min(buf.len());
        push(regs, &buf[start.min(end)..end]);
    }
    slot.chunk = Chunk {
        sent: sent + n,
        remaining: remaining - n,
    };
    trace!("chunk pushed, {} sent, {} remaining", slot.chunk.sent, slot.chunk.remaining);
}

impl<'d, H: Hardware> SpiDriver<'d, H> {
    /// Transmit one byte on chip select `cs`.
    ///
    /// With `also_receive` false the receiver is suppressed for the
    /// duration of the transfer.
    pub fn raw_tx_one_byte(&self, id: SpiId, cs: u8, byte: u8, also_receive: bool) -> Result<(), Error> {
        let state = self.state(id);
        let regs = self.regs(id);
        state.try_with(|slot| {
            state.check_busy(id)?;
            check_cs(id, slot, cs)?;
            if slot.settings.tx_dma_enabled {
                return Err(Error::DmaHandlesTx);
            }

            state.claim(TxPhase::Raw)?;
            slot.chunk = Chunk::default();
            select_target(regs, slot, cs, also_receive);
            regs.write(Reg::TxData, byte as u32);
            trace!("spi{}: tx 1 byte on cs {}", id.number(), cs);
            Ok(())
        })
    }

    /// Transmit `bytes` on chip select `cs`.
    ///
    /// Up to [`TX_FIFO_SIZE`] bytes go straight to the FIFO. Longer
    /// transmits are copied into the raw TX buffer and continued from the
    /// TX-empty interrupt.
    pub fn raw_tx_buffer(&self, id: SpiId, cs: u8, bytes: &[u8], also_receive: bool) -> Result<(), Error> {
        let state = self.state(id);
        let regs = self.regs(id);
        state.try_with(|slot| {
            state.check_busy(id)?;
            check_cs(id, slot, cs)?;
            if slot.settings.tx_dma_enabled {
                return Err(Error::DmaHandlesTx);
            }
            if bytes.is_empty() {
                return Err(Error::EmptyBuffer);
            }

            let chunk = if bytes.len() > TX_FIFO_SIZE {
                let staging = slot.raw_tx_buffer.as_deref_mut().ok_or(Error::RawTxBufferMissing)?;
                if bytes.len() > staging.len() || bytes.len() > u16::MAX as usize {
                    return Err(Error::TxBufferTooLong);
                }
                staging[..bytes.len()].copy_from_slice(bytes);
                Chunk {
                    sent: TX_FIFO_SIZE as u16,
                    remaining: (bytes.len() - TX_FIFO_SIZE) as u16,
                }
            } else {
                Chunk::default()
            };

            state.claim(TxPhase::Raw)?;
            slot.chunk = chunk;
            select_target(regs, slot, cs, also_receive);
            push(regs, &bytes[..bytes.len().min(TX_FIFO_SIZE)]);
            trace!("spi{}: tx {} bytes on cs {}", id.number(), bytes.len(), cs);
            Ok(())
        })
    }

    /// Transmit `bytes` with the DMA engine. The buffer stays borrowed by
    /// the driver until the transfer completes.
    pub fn dma_tx(&self, id: SpiId, cs: u8, bytes: &'d [u8], also_receive: bool) -> Result<(), Error> {
        let state = self.state(id);
        let regs = self.regs(id);
        state.try_with(|slot| {
            state.check_busy(id)?;
            check_cs(id, slot, cs)?;
            if !slot.settings.tx_dma_enabled {
                return Err(Error::DmaNotEnabled);
            }
            if bytes.is_empty() {
                return Err(Error::EmptyBuffer);
            }
            if bytes.len() > u16::MAX as usize {
                return Err(Error::TxBufferTooLong);
            }

            state.claim(TxPhase::Dma)?;
            slot.chunk = Chunk::default();
            slot.dma_tx = Some(bytes);
            select_target(regs, slot, cs, also_receive);
            regs.write_address(Reg::DmaTxAddr, bytes.as_ptr());
            regs.write(Reg::DmaTxLen, bytes.len() as u32);
            regs.write_fields(Reg::DmaTxEnable, ENABLE::ON::SET);
            trace!("spi{}: dma tx {} bytes on cs {}", id.number(), bytes.len(), cs);
            Ok(())
        })
    }

    // Shared gate of the polled receive paths.
    fn check_polled_rx(&self, id: SpiId, slot: &Slot<'_>) -> Result<(), Error> {
        self.state(id).check_busy(id)?;
        if slot.settings.rx_callback.is_some() {
            return Err(Error::ReceiveFunctionHandlesRx);
        }
        if slot.settings.rx_dma_enabled {
            return Err(Error::DmaHandlesRx);
        }
        Ok(())
    }

    /// Read one byte from the RX FIFO.
    ///
    /// `WouldBlock` when the FIFO is empty.
    pub fn raw_rx_one_byte(&self, id: SpiId) -> nb::Result<(u8, RxStatus), Error> {
        let state = self.state(id);
        let regs = self.regs(id);
        let received = state.try_with(|slot| {
            self.check_polled_rx(id, slot)?;
            let level = regs.read(Reg::RxFifoLevel);
            if level == 0 {
                return Ok(None);
            }
            let byte = regs.read(Reg::RxData) as u8;
            state.count_rx(1);
            let status = if level > 1 { RxStatus::MoreBytes } else { RxStatus::Done };
            Ok(Some((byte, status)))
        });
        match received {
            Ok(Some(v)) => Ok(v),
            Ok(None) => Err(nb::Error::WouldBlock),
            Err(e) => Err(nb::Error::Other(e)),
        }
    }

    /// Read as many bytes as the RX FIFO holds, up to `buf.len()`.
    pub fn raw_rx_available_bytes(&self, id: SpiId, buf: &mut [u8]) -> Result<(usize, RxStatus), Error> {
        let state = self.state(id);
        let regs = self.regs(id);
        state.try_with(|slot| {
            self.check_polled_rx(id, slot)?;
            let level = regs.read(Reg::RxFifoLevel) as usize;
            let n = level.min(buf.len());
            for b in &mut buf[..n] {
                *b = regs.read(Reg::RxData) as u8;
            }
            state.count_rx(n);
            let status = if level > buf.len() { RxStatus::MoreBytes } else { RxStatus::Done };
            Ok((n, status))
        })
    }

    /// Bytes the RX DMA engine can still write into the current buffer.
    pub fn dma_receive_bytes_left(&self, id: SpiId) -> Result<u32, Error> {
        let enabled = self.state(id).with(|slot| slot.settings.rx_dma_enabled)?;
        if !enabled {
            return Err(Error::DmaNotEnabled);
        }
        Ok(self.regs(id).read(Reg::DmaRxRemaining))
    }

    /// Point RX DMA at `new` and return the buffer it was filling.
    ///
    /// Bytes still pending in the old buffer go to the receive callback
    /// first, if there is one. On error `new` is handed back untouched.
    pub fn dma_change_rx_buffer(&self, id: SpiId, new: &'d mut [u8]) -> Result<&'d mut [u8], (Error, &'d mut [u8])> {
        let state = self.state(id);
        let regs = self.regs(id);
        critical_section::with(|cs| {
            let callback = {
                let mut guard = state.slot_mut(cs);
                let Some(slot) = guard.as_mut() else {
                    return Err((Error::NotInitialized, new));
                };
                if let Err(e) = state.check_busy(id) {
                    return Err((e, new));
                }
                if !slot.settings.rx_dma_enabled {
                    return Err((Error::DmaNotEnabled, new));
                }
                if new.len() < DMA_RX_BUFFER_MIN {
                    return Err((Error::DmaRxBufferTooSmall, new));
                }
                slot.settings.rx_callback
            };

            if let Some(callback) = callback {
                self.drain_dma(id, cs, callback);
            }

            let mut guard = state.slot_mut(cs);
            let Some(slot) = guard.as_mut() else {
                return Err((Error::NotInitialized, new));
            };
            let fresh = DmaRxBuffer::new(new);
            regs.write_fields(Reg::DmaRxEnable, ENABLE::ON::CLEAR);
            regs.write_address(Reg::DmaRxAddr, fresh.as_ptr());
            regs.write(Reg::DmaRxLen, fresh.hw_len());
            regs.write_fields(Reg::DmaRxEnable, ENABLE::ON::SET);
            slot.dma_rx_index = 0;
            let old = slot.rx_dma.replace(fresh);
            debug!("spi{}: rx dma buffer swapped", id.number());
            // RX DMA cannot be enabled without a buffer, so `old` is always set.
            Ok(old.map_or_else(Default::default, DmaRxBuffer::into_inner))
        })
    }

    /// Hand everything waiting in the RX FIFO to `callback`. Returns the
    /// number of bytes read; the callback is skipped when there are none.
    pub(super) fn drain_fifo(&self, id: SpiId, callback: ReceiveCallback) -> usize {
        let regs = self.regs(id);
        let level = (regs.read(Reg::RxFifoLevel) as usize).min(RX_FIFO_SIZE);
        if level == 0 {
            return 0;
        }
        let mut buf = [0u8; RX_FIFO_SIZE];
        for b in &mut buf[..level] {
            *b = regs.read(Reg::RxData) as u8;
        }
        self.state(id).count_rx(level);
        callback(&buf[..level]);
        level
    }

    /// Hand the bytes written by RX DMA since the last drain to `callback`.
    ///
    /// The run ends at the first zero byte. The callback is invoked even
    /// when the run is empty. While it runs the buffer is out of the slot,
    /// so a callback that swaps or releases it cannot alias the run.
    pub(super) fn drain_dma(&self, id: SpiId, cs: CriticalSection, callback: ReceiveCallback) {
        let state = self.state(id);
        let (buf, start, end) = {
            let mut guard = state.slot_mut(cs);
            let Some(slot) = guard.as_mut() else {
                return;
            };
            let Some(buf) = slot.rx_dma.take() else {
                return;
            };
            let start = slot.dma_rx_index;
            let limit = buf.hw_len() as usize;
            let mut end = start;
            while end < limit && buf.get(end).is_some_and(|b| b != 0) {
                end += 1;
            }
            slot.dma_rx_index = end;
            state.count_rx(end - start);
            (buf, start, end)
        };

        // SAFETY: `start..end` lies within the buffer and was already
        // written by the DMA engine, which only moves forward.
        callback(unsafe { buf.slice(start, end - start) });

        let mut guard = state.slot_mut(cs);
        match guard.as_mut() {
            Some(slot) if slot.rx_dma.is_none() => slot.rx_dma = Some(buf),
            _ => warn!("spi{}: rx dma buffer changed during receive callback", id.number()),
        }
    }
}
