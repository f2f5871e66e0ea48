use core::cell::{RefCell, RefMut};
use core::marker::PhantomData;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use critical_section::{CriticalSection, Mutex};
use tock_registers::LocalRegisterCopy;

use crate::pac::AUX_CONTROL;

#[cfg(feature = "embassy")]
use super::EventQueue;
use super::{Error, Settings, SpiId, Stats};

/// Transmit phase of one instance.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum TxPhase {
    Idle = 0,
    Raw = 1,
    Dma = 2,
}

impl TxPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => TxPhase::Raw,
            2 => TxPhase::Dma,
            _ => TxPhase::Idle,
        }
    }
}

/// Progress of a raw transmit longer than the TX FIFO.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub(crate) struct Chunk {
    pub sent: u16,
    pub remaining: u16,
}

/// RX DMA buffer lent to the hardware.
///
/// The DMA engine writes into the memory behind the driver's back, so the
/// buffer is held as a raw pointer and only read with volatile loads until
/// it is handed back.
pub(crate) struct DmaRxBuffer<'d> {
    ptr: NonNull<u8>,
    len: usize,
    _marker: PhantomData<&'d mut [u8]>,
}

unsafe impl Send for DmaRxBuffer<'_> {}

impl<'d> DmaRxBuffer<'d> {
    pub fn new(buf: &'d mut [u8]) -> Self {
        Self {
            ptr: NonNull::from(&mut *buf).cast(),
            len: buf.len(),
            _marker: PhantomData,
        }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Length programmed into the DMA length register.
    pub fn hw_len(&self) -> u32 {
        self.len().min(u16::MAX as usize) as u32
    }

    pub fn get(&self, index: usize) -> Option<u8> {
        if index < self.len {
            Some(unsafe { self.ptr.as_ptr().add(index).read_volatile() })
        } else {
            None
        }
    }

    /// # Safety
    ///
    /// `start + len` must be within the buffer and the hardware must not be
    /// writing that range while the slice is alive.
    pub unsafe fn slice(&self, start: usize, len: usize) -> &[u8] {
        core::slice::from_raw_parts(self.ptr.as_ptr().add(start), len)
    }

    /// Hand the buffer back. RX DMA must no longer target it.
    pub fn into_inner(self) -> &'d mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

/// Everything that exists only while an instance is initialized.
pub(crate) struct Slot<'d> {
    pub settings: Settings,
    pub raw_tx_buffer: Option<&'d mut [u8]>,
    pub rx_dma: Option<DmaRxBuffer<'d>>,
    pub dma_tx: Option<&'d [u8]>,
    #[cfg(feature = "embassy")]
    pub event_queue: Option<&'d EventQueue>,
    pub aux_ctrl_shadow: LocalRegisterCopy<u32, AUX_CONTROL::Register>,
    pub chunk: Chunk,
    pub dma_rx_index: usize,
}

const VACANT: u8 = 0;
const RESERVED: u8 = 1;
const OCCUPIED: u8 = 2;

pub(crate) struct State<'d> {
    occupancy: AtomicU8,
    phase: AtomicU8,
    pub tx_started: AtomicU32,
    pub tx_finished: AtomicU32,
    pub rx_bytes: AtomicU32,
    pub busy_recoveries: AtomicU32,
    slot: Mutex<RefCell<Option<Slot<'d>>>>,
}

// `finished >= started`, tolerant of counter wrap.
fn caught_up(started: u32, finished: u32) -> bool {
    (finished.wrapping_sub(started) as i32) >= 0
}

impl<'d> State<'d> {
    pub const fn new() -> Self {
        Self {
            occupancy: AtomicU8::new(VACANT),
            phase: AtomicU8::new(TxPhase::Idle as u8),
            tx_started: AtomicU32::new(0),
            tx_finished: AtomicU32::new(0),
            rx_bytes: AtomicU32::new(0),
            busy_recoveries: AtomicU32::new(0),
            slot: Mutex::new(RefCell::new(None)),
        }
    }

    pub fn is_initialized(&self) -> bool {
        critical_section::with(|cs| self.slot.borrow_ref(cs).is_some())
    }

    /// Claim the instance for `init`.
    ///
    /// Fails while the instance is initialized or another `init` holds the
    /// claim. Dropping the reservation without installing gives it back.
    pub fn reserve(&self) -> Result<Reservation<'_, 'd>, Error> {
        self.occupancy
            .compare_exchange(VACANT, RESERVED, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::AlreadyInitialized)?;
        Ok(Reservation { state: self })
    }

    /// Give the instance back after `uninit` has finished with it.
    pub fn vacate(&self) {
        self.occupancy.store(VACANT, Ordering::Release);
    }

    pub fn take(&self) -> Option<Slot<'d>> {
        critical_section::with(|cs| self.slot.borrow_ref_mut(cs).take())
    }

    /// Run `f` on the slot, or fail with `NotInitialized`.
    pub fn with<R>(&self, f: impl FnOnce(&mut Slot<'d>) -> R) -> Result<R, Error> {
        critical_section::with(|cs| self.with_cs(cs, f))
    }

    pub fn with_cs<R>(&self, cs: CriticalSection, f: impl FnOnce(&mut Slot<'d>) -> R) -> Result<R, Error> {
        let mut s = self.slot.borrow_ref_mut(cs);
        match s.as_mut() {
            Some(slot) => Ok(f(slot)),
            None => Err(Error::NotInitialized),
        }
    }

    pub fn try_with<R>(&self, f: impl FnOnce(&mut Slot<'d>) -> Result<R, Error>) -> Result<R, Error> {
        critical_section::with(|cs| self.with_cs(cs, f)?)
    }

    pub fn slot_mut<'a>(&'a self, cs: CriticalSection<'a>) -> RefMut<'a, Option<Slot<'d>>> {
        self.slot.borrow_ref_mut(cs)
    }

    pub fn phase(&self) -> TxPhase {
        TxPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn is_transmitting(&self) -> bool {
        self.phase() != TxPhase::Idle
    }

    /// Move from idle to `phase` and count the transmit as started.
    pub fn claim(&self, phase: TxPhase) -> Result<(), Error> {
        self.phase
            .compare_exchange(TxPhase::Idle as u8, phase as u8, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::TransmitterBusy)?;
        self.tx_started.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Return to idle, yielding the phase that was active.
    pub fn release(&self) -> TxPhase {
        TxPhase::from_u8(self.phase.swap(TxPhase::Idle as u8, Ordering::AcqRel))
    }

    /// Fail with `TransmitterBusy` while a transmit is in flight.
    ///
    /// A busy flag whose transmit has already been counted as finished is
    /// stale: it is cleared, counted and logged instead of failing.
    pub fn check_busy(&self, id: SpiId) -> Result<(), Error> {
        if !self.is_transmitting() {
            return Ok(());
        }
        let started = self.tx_started.load(Ordering::Relaxed);
        let finished = self.tx_finished.load(Ordering::Relaxed);
        if !caught_up(started, finished) {
            return Err(Error::TransmitterBusy);
        }
        self.release();
        self.busy_recoveries.fetch_add(1, Ordering::Relaxed);
        warn!(
            "spi{}: stale busy flag cleared (started {}, finished {})",
            id.number(),
            started,
            finished
        );
        Ok(())
    }

    /// Force idle and bring `tx_finished` up to `tx_started`.
    pub fn clear_busy(&self) {
        self.release();
        let started = self.tx_started.load(Ordering::Relaxed);
        let finished = self.tx_finished.load(Ordering::Relaxed);
        if !caught_up(started, finished) {
            self.tx_finished.store(started, Ordering::Relaxed);
        }
    }

    pub fn reset(&self) {
        self.phase.store(TxPhase::Idle as u8, Ordering::Release);
        self.tx_started.store(0, Ordering::Relaxed);
        self.tx_finished.store(0, Ordering::Relaxed);
        self.rx_bytes.store(0, Ordering::Relaxed);
        self.busy_recoveries.store(0, Ordering::Relaxed);
    }

    pub fn count_rx(&self, n: usize) {
        self.rx_bytes.fetch_add(n as u32, Ordering::Relaxed);
    }

    pub fn stats(&self) -> Stats {
        Stats {
            tx_started: self.tx_started.load(Ordering::Relaxed),
            tx_finished: self.tx_finished.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            busy_recoveries: self.busy_recoveries.load(Ordering::Relaxed),
        }
    }
}

/// Exclusive right to initialize one instance.
pub(crate) struct Reservation<'a, 'd> {
    state: &'a State<'d>,
}

impl<'a, 'd> Reservation<'a, 'd> {
    /// Install the slot, marking the instance initialized.
    pub fn install(self, slot: Slot<'d>) {
        let state = self.state;
        core::mem::forget(self);
        critical_section::with(|cs| *state.slot.borrow_ref_mut(cs) = Some(slot));
        state.occupancy.store(OCCUPIED, Ordering::Release);
    }
}

impl Drop for Reservation<'_, '_> {
    fn drop(&mut self) {
        self.state.vacate();
    }
}
