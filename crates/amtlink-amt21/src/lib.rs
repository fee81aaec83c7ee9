/*! Client for an absolute rotary encoder polled over a half-duplex
RS-485 bus. One command byte out, a two byte checksum-protected reply
back; the heavy lifting (turnaround, deadlines, buffering) lives in the
bus layer underneath.
*/

#![no_std]

pub mod frame;

use core::time::Duration;

use amtlink_common::{dev_debug, dev_trace};
use amtlink_serial::{Rs485Bus, TransferError};

/// Single-turn position read command.
pub const READ_POSITION: u8 = 0x54;

/// Sets the current position as the zero reference and restarts the
/// device. No reply is sent.
pub const SET_ZERO: [u8; 3] = [0x35, 0xA5, 0x7E];

/// Time the encoder is unavailable after a zero-set while it restarts.
/// Waiting it out is the caller's responsibility.
pub const ZERO_SETTLE: Duration = Duration::from_millis(200);

/// Why a position read produced no value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    /// The encoder did not answer within the bus deadline.
    NoResponse,
    /// A reply arrived but failed the parity check: the device is
    /// alive, the data was corrupted on the wire.
    Checksum,
}

impl ReadError {
    /// Numeric error code as reported upwards; 0 means no error.
    pub const fn code(self) -> u8 {
        match self {
            ReadError::NoResponse => 1,
            ReadError::Checksum => 2,
        }
    }
}

pub struct Amt21<B: Rs485Bus> {
    bus: B,
}

impl<B: Rs485Bus> Amt21<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Reads the current position. Sends the read command, waits for
    /// the two byte reply, validates the interleaved parity and decodes
    /// the value.
    pub fn read_angle(&mut self) -> Result<i16, ReadError> {
        let reply = self.request_position()?;

        if !frame::check_parity(reply) {
            dev_debug!("position reply {:02x?} failed the parity check", reply);
            return Err(ReadError::Checksum);
        }

        Ok(frame::decode(reply))
    }

    /// Reads the current position without validating the reply, the
    /// way callers that cannot act on an error poll the device. A
    /// missing reply reads as 0.
    pub fn read_angle_lossy(&mut self) -> i16 {
        match self.request_position() {
            Ok(reply) => frame::decode(reply),
            Err(_) => 0,
        }
    }

    fn request_position(&mut self) -> Result<[u8; 2], ReadError> {
        if self.bus.write(&[READ_POSITION]).is_err() {
            // The command never reached the wire, so nothing will
            // answer.
            return Err(ReadError::NoResponse);
        }

        let mut reply = [0u8; 2];
        if !self.bus.read(&mut reply) {
            self.bus.abort_read();
            return Err(ReadError::NoResponse);
        }

        dev_trace!("<-- position reply {:02x?}", reply);
        Ok(reply)
    }

    /// Declares the current position to be zero. Fire and forget: the
    /// device answers nothing and restarts internally; it must be left
    /// alone for [`ZERO_SETTLE`] before the next command.
    pub fn set_zero_position(&mut self) -> Result<(), TransferError> {
        self.bus.write(&SET_ZERO)
    }
}
