//! Single-master half-duplex bus discipline on top of the buffered
//! transport. One wire pair is shared by both directions; a
//! transmit-enable line selects who drives it, and the timing rules in
//! here make sure the master never walks over a reply and always leaves
//! the line idle long enough for the remote device to detect frame end.

use core::marker::PhantomData;
use core::time::Duration;

use amtlink_common::serial::{SerialDevice, TxEnable};
use amtlink_common::time::Clock;

use crate::transport::{AsyncSerial, TransferError};

/// Compile-time timing policy of the bus master.
pub trait Rs485Timings {
    /// Factor applied over the theoretical minimum reception time to
    /// obtain the read deadline. The default of 3 is an empirical
    /// margin that tolerates device turnaround and scheduling jitter.
    const READ_DEADLINE_FACTOR: u32;
}

pub struct DefaultRs485Timings;

impl Rs485Timings for DefaultRs485Timings {
    const READ_DEADLINE_FACTOR: u32 = 3;
}

/// Synchronous request/response surface of the bus, the seam between
/// the device protocol layer and the wire.
pub trait Rs485Bus {
    /// Transmits the buffer and returns once the line has been turned
    /// around to listen again. Blocks for the duration of the transfer
    /// plus one silence interval.
    fn write(&mut self, buf: &[u8]) -> Result<(), TransferError>;

    /// Collects exactly `buf.len()` reply bytes. Returns `false` when
    /// the deadline elapses first; the receive queue is left in
    /// whatever partial state it had, and the caller must call
    /// [`abort_read`](Self::abort_read) before issuing a new request.
    fn read(&mut self, buf: &mut [u8]) -> bool;

    /// Number of reply bytes already waiting.
    fn readable(&self) -> usize;

    /// Discards any partially received reply.
    fn abort_read(&self);
}

/// The single master of a direction-switched RS-485 line.
///
/// The transport is borrowed rather than owned because the very same
/// instance must also be reachable from the interrupt handlers; the
/// firmware places it in a `static` and hands a reference here.
pub struct Rs485Master<
    's,
    S: SerialDevice,
    D: TxEnable,
    C: Clock,
    Ts: Rs485Timings = DefaultRs485Timings,
    const N: usize = 256,
> {
    serial: &'s AsyncSerial<S, N>,
    dir: D,
    clock: C,
    byte_time: Duration,
    silence: Duration,
    _timings: PhantomData<Ts>,
}

impl<'s, S: SerialDevice, D: TxEnable, C: Clock, Ts: Rs485Timings, const N: usize>
    Rs485Master<'s, S, D, C, Ts, N>
{
    pub fn new(serial: &'s AsyncSerial<S, N>, mut dir: D, clock: C, baud: u32) -> Self {
        dir.set_receive();
        let (byte_time, silence) = Self::timings_for_baud(baud);

        Self {
            serial,
            dir,
            clock,
            byte_time,
            silence,
            _timings: PhantomData,
        }
    }

    /// One byte on the wire is ten bit times (start, eight data, stop).
    /// The silence interval is the inter-frame idle the remote device
    /// needs to recognize frame end: one and a half byte times.
    fn timings_for_baud(baud: u32) -> (Duration, Duration) {
        let byte_us = 10_000_000u64 / baud as u64;
        (
            Duration::from_micros(byte_us),
            Duration::from_micros(byte_us + byte_us / 2),
        )
    }

    /// Time to receive one byte at the configured baud rate.
    pub fn byte_time(&self) -> Duration {
        self.byte_time
    }

    /// Minimum inter-frame idle time on the bus.
    pub fn silence_interval(&self) -> Duration {
        self.silence
    }

    pub fn serial(&self) -> &'s AsyncSerial<S, N> {
        self.serial
    }

    /// Changes the baud rate of the line and recomputes the derived
    /// timing constants.
    pub fn change_baud(&mut self, baud: u32) {
        self.serial.set_baud(baud);
        let (byte_time, silence) = Self::timings_for_baud(baud);
        self.byte_time = byte_time;
        self.silence = silence;
    }

    /// Overrides the derived timing constants. The next
    /// [`change_baud`](Self::change_baud) recomputes them again.
    pub fn set_timing(&mut self, byte_time: Duration, silence: Duration) {
        self.byte_time = byte_time;
        self.silence = silence;
    }

    fn read_deadline(&self, len: usize) -> Duration {
        (self.byte_time * len as u32 + self.silence) * Ts::READ_DEADLINE_FACTOR
    }

    /// Busy-waits with a deadline. Interrupts keep servicing the
    /// transfer while we spin here; there is no scheduler to yield to.
    fn wait_for(&self, duration: Duration) {
        let start = self.clock.current_instant();
        while self.clock.elapsed_since(start) < duration {
            core::hint::spin_loop();
        }
    }
}

impl<S: SerialDevice, D: TxEnable, C: Clock, Ts: Rs485Timings, const N: usize> Rs485Bus
    for Rs485Master<'_, S, D, C, Ts, N>
{
    fn write(&mut self, buf: &[u8]) -> Result<(), TransferError> {
        self.dir.set_transmit();
        let res = self.serial.write(buf);

        if res.is_ok() {
            while self.serial.is_sending() {
                core::hint::spin_loop();
            }
        }

        // The sending flag clears when the last byte is handed to the
        // hardware; its stop bit may still be on the wire, and the
        // remote device needs line-idle time to recognize frame end.
        self.wait_for(self.silence);
        self.serial.abort_write();
        // Anything that accumulated while we were driving the line is
        // our own echo, or noise from the turnaround.
        self.serial.abort_read();
        self.dir.set_receive();
        res
    }

    fn read(&mut self, buf: &mut [u8]) -> bool {
        if buf.is_empty() {
            return true;
        }

        let deadline = self.read_deadline(buf.len());
        let start = self.clock.current_instant();
        let mut collected = 0;

        while self.clock.elapsed_since(start) < deadline {
            let Some(byte) = self.serial.getc() else {
                continue;
            };

            buf[collected] = byte;
            collected += 1;
            if collected == buf.len() {
                // Let any trailing byte or device-side processing
                // settle before the caller fires the next request.
                self.wait_for(self.silence * 2);
                return true;
            }
        }

        false
    }

    fn readable(&self) -> usize {
        self.serial.readable()
    }

    fn abort_read(&self) {
        self.serial.abort_read();
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::vec::Vec;

    use amtlink_common::serial::{SerialDevice, SerialEvent, SerialFormat, TxEnable};
    use amtlink_common::time::{Clock, TimeDiff};
    use core::time::Duration;
    use enumflags2::BitFlags;

    use super::{DefaultRs485Timings, Rs485Bus, Rs485Master};
    use crate::transport::AsyncSerial;

    const BAUD: u32 = 2_000_000;

    #[derive(Default)]
    struct WireState {
        written: Vec<u8>,
        rx: Vec<u8>,
        baud_calls: Vec<u32>,
    }

    #[derive(Clone, Default)]
    struct SharedSerial(Arc<StdMutex<WireState>>);

    impl SharedSerial {
        fn feed(&self, bytes: &[u8]) {
            self.0.lock().unwrap().rx.extend_from_slice(bytes);
        }
    }

    impl SerialDevice for SharedSerial {
        fn write_byte(&mut self, byte: u8) {
            self.0.lock().unwrap().written.push(byte);
        }

        fn tx_ready(&self) -> bool {
            true
        }

        fn rx_ready(&self) -> bool {
            !self.0.lock().unwrap().rx.is_empty()
        }

        fn read_byte(&mut self) -> Option<u8> {
            let mut state = self.0.lock().unwrap();
            if state.rx.is_empty() {
                None
            } else {
                Some(state.rx.remove(0))
            }
        }

        fn set_event_mask(&mut self, _events: BitFlags<SerialEvent>) {}

        fn set_baud(&mut self, baud: u32) {
            self.0.lock().unwrap().baud_calls.push(baud);
        }

        fn set_format(&mut self, _format: SerialFormat) {}
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum PinEvent {
        Transmit,
        Receive,
    }

    #[derive(Clone, Default)]
    struct SharedPin(Arc<StdMutex<Vec<PinEvent>>>);

    impl TxEnable for SharedPin {
        fn set_transmit(&mut self) {
            self.0.lock().unwrap().push(PinEvent::Transmit);
        }

        fn set_receive(&mut self) {
            self.0.lock().unwrap().push(PinEvent::Receive);
        }
    }

    /// A clock that advances by a fixed step on every read, so the
    /// busy-wait loops make progress deterministically.
    struct StepClock {
        now_nanos: AtomicU64,
        step_nanos: u64,
    }

    impl StepClock {
        fn new(step: Duration) -> Self {
            Self {
                now_nanos: AtomicU64::new(0),
                step_nanos: step.as_nanos() as u64,
            }
        }
    }

    impl Clock for StepClock {
        type TInstant = u64;

        fn current_instant(&self) -> u64 {
            self.now_nanos.fetch_add(self.step_nanos, Ordering::Relaxed)
        }

        fn diff(&self, newer: u64, older: u64) -> TimeDiff {
            if newer >= older {
                TimeDiff::Forward(Duration::from_nanos(newer - older))
            } else {
                TimeDiff::Backward(Duration::from_nanos(older - newer))
            }
        }
    }

    #[test]
    fn test_timing_constants_from_baud() {
        let serial = AsyncSerial::new(SharedSerial::default());
        let master: Rs485Master<_, _, _> = Rs485Master::new(
            &serial,
            SharedPin::default(),
            StepClock::new(Duration::from_nanos(500)),
            BAUD,
        );

        // 2 Mbaud: 5 us per byte, 7 us (1.5x, truncated) of silence.
        assert_eq!(master.byte_time(), Duration::from_micros(5));
        assert_eq!(master.silence_interval(), Duration::from_micros(7));
    }

    #[test]
    fn test_change_baud_recomputes_timings() {
        let shared = SharedSerial::default();
        let serial = AsyncSerial::new(shared.clone());
        let mut master: Rs485Master<_, _, _> = Rs485Master::new(
            &serial,
            SharedPin::default(),
            StepClock::new(Duration::from_nanos(500)),
            BAUD,
        );

        master.change_baud(115_200);
        assert_eq!(master.byte_time(), Duration::from_micros(86));
        assert_eq!(master.silence_interval(), Duration::from_micros(129));
        assert_eq!(shared.0.lock().unwrap().baud_calls, [115_200]);
    }

    #[test]
    fn test_set_timing_overrides() {
        let serial = AsyncSerial::new(SharedSerial::default());
        let mut master: Rs485Master<_, _, _> = Rs485Master::new(
            &serial,
            SharedPin::default(),
            StepClock::new(Duration::from_nanos(500)),
            BAUD,
        );

        master.set_timing(Duration::from_micros(100), Duration::from_micros(150));
        assert_eq!(master.byte_time(), Duration::from_micros(100));
        assert_eq!(master.silence_interval(), Duration::from_micros(150));
    }

    #[test]
    fn test_write_turnaround_discipline() {
        let shared = SharedSerial::default();
        let pin = SharedPin::default();
        let serial = AsyncSerial::new(shared.clone());
        let mut master: Rs485Master<_, _, _> = Rs485Master::new(
            &serial,
            pin.clone(),
            StepClock::new(Duration::from_nanos(500)),
            BAUD,
        );

        // Echo noise sitting in the receive queue from a previous turn.
        shared.feed(&[0xEE]);
        serial.handle_rx_intr();
        assert_eq!(serial.readable(), 1);

        let done = AtomicBool::new(false);
        thread::scope(|s| {
            // Plays the role of the transmit interrupt.
            s.spawn(|| {
                while !done.load(Ordering::Relaxed) {
                    serial.handle_tx_intr();
                    thread::yield_now();
                }
            });

            let res = master.write(&[0x54, 0xA5]);
            done.store(true, Ordering::Relaxed);
            assert!(res.is_ok());
        });

        let state = shared.0.lock().unwrap();
        assert_eq!(state.written, [0x54, 0xA5]);
        assert!(!serial.is_sending());
        // The echo was discarded before dropping into listen mode.
        assert_eq!(serial.readable(), 0);
        // Enable line raised for the transfer, lowered afterwards.
        assert_eq!(
            *pin.0.lock().unwrap(),
            [PinEvent::Receive, PinEvent::Transmit, PinEvent::Receive]
        );
    }

    #[test]
    fn test_read_collects_exact_count() {
        let shared = SharedSerial::default();
        let serial = AsyncSerial::new(shared.clone());
        let clock = StepClock::new(Duration::from_nanos(500));
        let mut master: Rs485Master<_, _, _> =
            Rs485Master::new(&serial, SharedPin::default(), clock, BAUD);

        shared.feed(&[0xA0, 0x0F]);
        serial.handle_rx_intr();

        let mut buf = [0u8; 2];
        assert!(master.read(&mut buf));
        assert_eq!(buf, [0xA0, 0x0F]);
    }

    #[test]
    fn test_read_success_does_not_wait_out_the_deadline() {
        let shared = SharedSerial::default();
        let serial = AsyncSerial::new(shared.clone());
        let step = Duration::from_nanos(500);
        let clock = StepClock::new(step);
        let mut master: Rs485Master<_, _, _> =
            Rs485Master::new(&serial, SharedPin::default(), clock, BAUD);

        shared.feed(&[1, 2]);
        serial.handle_rx_intr();

        // Deadline for 2 bytes: 3 * (2 * 5us + 7us) = 51 us of virtual
        // time. With both bytes already buffered the read spends two
        // polls collecting plus the trailing double silence (14 us).
        let mut buf = [0u8; 2];
        assert!(master.read(&mut buf));
        let spent = Duration::from_nanos(master.clock.now_nanos.load(Ordering::Relaxed));
        assert!(spent < Duration::from_micros(51), "spent {spent:?}");
    }

    #[test]
    fn test_read_times_out_on_partial_reply() {
        let shared = SharedSerial::default();
        let serial = AsyncSerial::new(shared.clone());
        let mut master: Rs485Master<_, _, _> = Rs485Master::new(
            &serial,
            SharedPin::default(),
            StepClock::new(Duration::from_nanos(500)),
            BAUD,
        );

        shared.feed(&[0x55]);
        serial.handle_rx_intr();

        let mut buf = [0u8; 2];
        assert!(!master.read(&mut buf));
        // The deadline was fully consumed.
        let spent = Duration::from_nanos(master.clock.now_nanos.load(Ordering::Relaxed));
        assert!(spent >= Duration::from_micros(51), "spent {spent:?}");
    }

    #[test]
    fn test_read_times_out_on_silent_bus() {
        let serial = AsyncSerial::new(SharedSerial::default());
        let mut master: Rs485Master<_, _, _> = Rs485Master::new(
            &serial,
            SharedPin::default(),
            StepClock::new(Duration::from_nanos(500)),
            BAUD,
        );

        let mut buf = [0u8; 2];
        assert!(!master.read(&mut buf));
    }

    #[test]
    fn test_abort_read_resynchronizes() {
        let shared = SharedSerial::default();
        let serial = AsyncSerial::new(shared.clone());
        let mut master: Rs485Master<_, _, _> = Rs485Master::new(
            &serial,
            SharedPin::default(),
            StepClock::new(Duration::from_nanos(500)),
            BAUD,
        );

        shared.feed(&[0x55, 0x66]);
        serial.handle_rx_intr();
        // Only drain one of the two stale bytes.
        let mut buf = [0u8; 1];
        assert!(master.read(&mut buf));
        assert_eq!(master.readable(), 1);

        master.abort_read();
        assert_eq!(master.readable(), 0);
    }

    #[test]
    fn test_write_reports_overflow_and_restores_line() {
        let shared = SharedSerial::default();
        let pin = SharedPin::default();
        let serial = AsyncSerial::<_, 4>::new(shared.clone());
        let mut master: Rs485Master<_, _, _, DefaultRs485Timings, 4> = Rs485Master::new(
            &serial,
            pin.clone(),
            StepClock::new(Duration::from_nanos(500)),
            BAUD,
        );

        let res = master.write(&[1, 2, 3, 4, 5]);
        assert!(res.is_err());
        // Even a rejected transfer must leave the line in listen mode.
        assert_eq!(*pin.0.lock().unwrap().last().unwrap(), PinEvent::Receive);
        assert!(shared.0.lock().unwrap().written.is_empty());
    }
}
