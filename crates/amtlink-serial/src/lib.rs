#![no_std]

pub mod rs485;
pub mod transport;

pub use rs485::{DefaultRs485Timings, Rs485Bus, Rs485Master, Rs485Timings};
pub use transport::{AsyncSerial, TransferError};
