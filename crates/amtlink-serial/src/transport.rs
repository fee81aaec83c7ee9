//! Interrupt-driven buffered serial transport. The hardware moves one
//! byte at a time; this layer queues whole buffers so the application
//! never waits on a single byte, and the interrupt handlers never wait
//! at all.

use core::cell::UnsafeCell;

use amtlink_common::serial::{SerialDevice, SerialEvent, SerialFormat};
use amtlink_common::util::ByteQueue;
use amtlink_common::{dev_trace, dev_warn};
use critical_section::Mutex;
use enumflags2::BitFlags;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    /// The transmit queue does not have room for the whole buffer.
    /// Nothing was enqueued.
    BufferFull,
}

struct Inner<S: SerialDevice, const N: usize> {
    serial: S,
    tx: ByteQueue<N>,
    rx: ByteQueue<N>,
    /// True from the moment a byte is handed to the hardware until the
    /// transmit interrupt finds the queue empty.
    sending: bool,
    rx_dropped: u32,
}

impl<S: SerialDevice, const N: usize> Inner<S, N> {
    /// Event mask matching the current transfer state: receive always,
    /// transmit only while a transmission is in flight.
    fn apply_event_mask(&mut self) {
        let mut mask: BitFlags<SerialEvent> = SerialEvent::RxNotEmpty.into();
        if self.sending {
            mask |= SerialEvent::TxEmpty;
        }
        self.serial.set_event_mask(mask);
    }
}

/// Buffered transport over a [`SerialDevice`].
///
/// All state shared with interrupt context (both queues and the
/// `sending` flag) lives behind a critical-section mutex, and every
/// public method takes `&self`, so one instance can be placed in a
/// `static` and referenced both from the main flow of control and from
/// the interrupt handlers.
///
/// The transmit queue has a single producer ([`write`](Self::write),
/// normal context) and a single consumer ([`handle_tx_intr`]
/// (Self::handle_tx_intr), interrupt context); the receive queue is the
/// mirror image. The critical sections only ever guard a handful of
/// index updates, so the time interrupts stay masked is bounded and
/// small.
pub struct AsyncSerial<S: SerialDevice, const N: usize = 256> {
    inner: Mutex<UnsafeCell<Inner<S, N>>>,
}

impl<S: SerialDevice, const N: usize> AsyncSerial<S, N> {
    pub fn new(mut serial: S) -> Self {
        serial.set_event_mask(SerialEvent::RxNotEmpty.into());

        Self {
            inner: Mutex::new(UnsafeCell::new(Inner {
                serial,
                tx: ByteQueue::new(),
                rx: ByteQueue::new(),
                sending: false,
                rx_dropped: 0,
            })),
        }
    }

    fn with_inner<R>(&self, f: impl FnOnce(&mut Inner<S, N>) -> R) -> R {
        critical_section::with(|cs| {
            // SAFETY: the critical section guarantees exclusive access,
            // and this is the only place a reference into the cell is
            // created. `with_inner` is never re-entered.
            let inner = unsafe { &mut *self.inner.borrow(cs).get() };
            f(inner)
        })
    }

    /// Appends the whole buffer to the transmit queue and, if no
    /// transmission is in flight, starts one by handing the first byte
    /// to the hardware. Never blocks.
    ///
    /// All-or-nothing: if the queue cannot take every byte, nothing is
    /// enqueued and [`TransferError::BufferFull`] is returned, so a
    /// protocol frame never reaches the wire truncated.
    pub fn write(&self, buf: &[u8]) -> Result<(), TransferError> {
        self.with_inner(|inner| {
            if inner.tx.free() < buf.len() {
                return Err(TransferError::BufferFull);
            }

            for &byte in buf {
                let _ = inner.tx.enqueue(byte);
            }
            dev_trace!("--> TX {:02x?}", buf);

            if !inner.sending {
                if let Some(first) = inner.tx.dequeue() {
                    inner.sending = true;
                    inner.apply_event_mask();
                    inner.serial.write_byte(first);
                }
            }

            Ok(())
        })
    }

    /// Transmit interrupt entry point: sends the next queued byte, or
    /// ends the transmission when the queue has drained. Runs once per
    /// byte shifted out; does nothing if the hardware is not actually
    /// ready (shared interrupt vectors fire for receive events too).
    pub fn handle_tx_intr(&self) {
        self.with_inner(|inner| {
            if !inner.serial.tx_ready() {
                return;
            }

            match inner.tx.dequeue() {
                Some(byte) => inner.serial.write_byte(byte),
                None => {
                    inner.sending = false;
                    inner.apply_event_mask();
                }
            }
        })
    }

    /// Receive interrupt entry point: drains every byte the hardware
    /// currently holds into the receive queue. When the queue is full
    /// the newest byte is dropped and counted; stored bytes are never
    /// disturbed.
    pub fn handle_rx_intr(&self) {
        self.with_inner(|inner| {
            while inner.serial.rx_ready() {
                let Some(byte) = inner.serial.read_byte() else {
                    break;
                };
                if !inner.rx.enqueue(byte) {
                    inner.rx_dropped = inner.rx_dropped.wrapping_add(1);
                    dev_warn!("rx queue full, dropped byte {:#04x}", byte);
                }
            }
        })
    }

    /// Number of received bytes waiting to be consumed.
    pub fn readable(&self) -> usize {
        self.with_inner(|inner| inner.rx.len())
    }

    /// Takes the oldest received byte, if any.
    pub fn getc(&self) -> Option<u8> {
        self.with_inner(|inner| inner.rx.dequeue())
    }

    /// Looks at the oldest received byte without consuming it.
    pub fn peekc(&self) -> Option<u8> {
        self.with_inner(|inner| inner.rx.peek())
    }

    /// True while queued bytes are still being shifted out. The flag
    /// clears when the last byte has been handed to the hardware; its
    /// stop bit may still be on the wire at that point.
    pub fn is_sending(&self) -> bool {
        self.with_inner(|inner| inner.sending)
    }

    /// Number of bytes still waiting in the transmit queue.
    pub fn tx_pending(&self) -> usize {
        self.with_inner(|inner| inner.tx.len())
    }

    /// Number of received bytes dropped because the queue was full.
    pub fn rx_dropped(&self) -> u32 {
        self.with_inner(|inner| inner.rx_dropped)
    }

    /// Discards everything in the receive queue. Used to resynchronize
    /// after a timeout or a protocol error.
    pub fn abort_read(&self) {
        self.with_inner(|inner| inner.rx.clear())
    }

    /// Discards everything still waiting in the transmit queue. A byte
    /// already handed to the hardware completes normally.
    pub fn abort_write(&self) {
        self.with_inner(|inner| inner.tx.clear())
    }

    /// Changes the baud rate. Serial events are masked while the
    /// hardware timing is rewritten so no handler can observe an
    /// inconsistent line configuration, then restored.
    pub fn set_baud(&self, baud: u32) {
        self.with_inner(|inner| {
            inner.serial.set_event_mask(BitFlags::EMPTY);
            inner.serial.set_baud(baud);
            inner.apply_event_mask();
        })
    }

    /// Changes the character framing, with the same event masking
    /// discipline as [`set_baud`](Self::set_baud).
    pub fn set_format(&self, format: SerialFormat) {
        self.with_inner(|inner| {
            inner.serial.set_event_mask(BitFlags::EMPTY);
            inner.serial.set_format(format);
            inner.apply_event_mask();
        })
    }
}

impl<S: SerialDevice, const N: usize> Drop for AsyncSerial<S, N> {
    fn drop(&mut self) {
        // The interrupt bindings must be gone before the queues are.
        self.with_inner(|inner| inner.serial.set_event_mask(BitFlags::EMPTY));
    }
}
