use enumflags2::{BitFlags, bitflags};

/// Interrupt sources a serial channel can raise. The transport enables
/// and disables these as a whole mask rather than one by one, so that a
/// reconfiguration can atomically detach every handler.
#[bitflags]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SerialEvent {
    /// The transmit data register is ready to accept the next byte.
    TxEmpty = 1 << 0,
    /// At least one received byte is waiting in the hardware.
    RxNotEmpty = 1 << 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Odd,
}

/// Character framing of the serial line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SerialFormat {
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
}

impl Default for SerialFormat {
    /// 8N1, the framing every device on this bus speaks.
    fn default() -> Self {
        Self {
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
        }
    }
}

/// Byte-level serial channel as exposed by the hardware: single-byte
/// transmit and receive plus event mask and line configuration. All the
/// buffering lives above this trait.
///
/// `set_baud` and `set_format` must only be called while the event mask
/// is empty; the caller is responsible for masking events around the
/// call so no handler observes half-applied timing state.
pub trait SerialDevice {
    /// Hands one byte to the transmit register. Only valid when
    /// [`tx_ready`](Self::tx_ready) reports true.
    fn write_byte(&mut self, byte: u8);

    /// True when the transmit register can accept a byte.
    fn tx_ready(&self) -> bool;

    /// True when at least one received byte is waiting.
    fn rx_ready(&self) -> bool;

    /// Takes one byte out of the receive register, if any.
    fn read_byte(&mut self) -> Option<u8>;

    fn set_event_mask(&mut self, events: BitFlags<SerialEvent>);

    fn set_baud(&mut self, baud: u32);

    fn set_format(&mut self, format: SerialFormat);
}

/// Transmit-enable line of a half-duplex transceiver. Exactly one
/// writer drives this line: the bus master.
pub trait TxEnable {
    fn set_transmit(&mut self);
    fn set_receive(&mut self);
}

/// A serial channel that goes nowhere. Transmitted bytes are discarded
/// and nothing is ever received.
pub struct NullSerial;

impl SerialDevice for NullSerial {
    fn write_byte(&mut self, _byte: u8) {}

    fn tx_ready(&self) -> bool {
        true
    }

    fn rx_ready(&self) -> bool {
        false
    }

    fn read_byte(&mut self) -> Option<u8> {
        None
    }

    fn set_event_mask(&mut self, _events: BitFlags<SerialEvent>) {}

    fn set_baud(&mut self, _baud: u32) {}

    fn set_format(&mut self, _format: SerialFormat) {}
}
