use amtlink_common::serial::TxEnable;
use stm32f4xx_hal::gpio::{Output, Pin, PushPull};

/// Transceiver direction control over a push-pull output pin: high
/// selects the driver, low the receiver.
pub struct DirPin<const P: char, const N: u8> {
    pin: Pin<P, N, Output<PushPull>>,
}

impl<const P: char, const N: u8> DirPin<P, N> {
    pub fn new(pin: Pin<P, N, Output<PushPull>>) -> Self {
        Self { pin }
    }
}

impl<const P: char, const N: u8> TxEnable for DirPin<P, N> {
    fn set_transmit(&mut self) {
        self.pin.set_high();
    }

    fn set_receive(&mut self) {
        self.pin.set_low();
    }
}
