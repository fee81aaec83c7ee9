mod bytequeue;
pub mod bytes;

pub use bytequeue::*;
