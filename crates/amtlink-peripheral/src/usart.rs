//! Register-level USART backend for the buffered transport. The HAL's
//! `Serial` wrapper fixes the line configuration at construction time;
//! this driver needs to rewrite baud rate and framing at runtime, so it
//! drives the registers directly.

use amtlink_common::serial::{Parity, SerialDevice, SerialEvent, SerialFormat};
use enumflags2::BitFlags;
use stm32f4xx_hal::Ptr;
use stm32f4xx_hal::gpio::PushPull;
use stm32f4xx_hal::pac::usart1::RegisterBlock;
use stm32f4xx_hal::rcc::Clocks;
use stm32f4xx_hal::serial::Instance;

/// One USART channel bound to its pins. The pins are only held so the
/// alternate-function routing stays alive as long as the device does.
pub struct UsartDevice<U: Instance + Ptr<RB = RegisterBlock>> {
    usart: U,
    pclk_freq: u32,
    _pins: (U::Tx<PushPull>, U::Rx<PushPull>),
}

impl<U: Instance + Ptr<RB = RegisterBlock>> UsartDevice<U> {
    pub fn init(
        usart: U,
        pins: (
            impl Into<U::Tx<PushPull>>,
            impl Into<U::Rx<PushPull>>,
        ),
        baud: u32,
        clocks: &Clocks,
    ) -> Self {
        unsafe {
            U::enable_unchecked();
            U::reset_unchecked();
        }

        let pclk_freq = U::clock(clocks).raw();
        let dev = Self {
            usart,
            pclk_freq,
            _pins: (pins.0.into(), pins.1.into()),
        };

        dev.apply_baud(baud);
        dev.usart.cr2().write(|w| w.stop().stop1());
        dev.usart.cr1().write(|w| {
            w.ue().set_bit()
                .m().clear_bit() // 8 bit word
                .pce().clear_bit() // no hardware parity
                .te().set_bit()
                .re().set_bit()
        });

        dev
    }

    fn apply_baud(&self, baud: u32) {
        let (over8, div) = calculate_brr(self.pclk_freq, baud);
        self.usart.cr1().modify(|_, w| w.over8().bit(over8));
        self.usart.brr().write(|w| unsafe { w.bits(div) });
    }
}

impl<U: Instance + Ptr<RB = RegisterBlock>> SerialDevice for UsartDevice<U> {
    fn write_byte(&mut self, byte: u8) {
        self.usart
            .dr()
            .write(|w| unsafe { w.dr().bits(byte as u16) });
    }

    fn tx_ready(&self) -> bool {
        self.usart.sr().read().txe().bit_is_set()
    }

    fn rx_ready(&self) -> bool {
        self.usart.sr().read().rxne().bit_is_set()
    }

    fn read_byte(&mut self) -> Option<u8> {
        if !self.rx_ready() {
            return None;
        }
        Some(self.usart.dr().read().dr().bits() as u8)
    }

    fn set_event_mask(&mut self, events: BitFlags<SerialEvent>) {
        self.usart.cr1().modify(|_, w| {
            w.txeie().bit(events.contains(SerialEvent::TxEmpty))
                .rxneie().bit(events.contains(SerialEvent::RxNotEmpty))
        });
    }

    fn set_baud(&mut self, baud: u32) {
        self.apply_baud(baud);
    }

    fn set_format(&mut self, format: SerialFormat) {
        self.usart.cr2().modify(|_, w| match format.stop_bits {
            2 => w.stop().stop2(),
            _ => w.stop().stop1(),
        });

        // The M bit counts the parity bit as part of the word, so eight
        // data bits with parity need the nine bit word length.
        let nine_bit_word =
            format.data_bits == 9 || (format.data_bits == 8 && format.parity != Parity::None);
        self.usart.cr1().modify(|_, w| {
            w.m().bit(nine_bit_word)
                .pce().bit(format.parity != Parity::None)
                .ps().bit(format.parity == Parity::Odd)
        });
    }
}

fn calculate_brr(pclk_freq: u32, baud: u32) -> (bool, u32) {
    // USARTDIV = pclk / (8 * (2 - OVER8) * baud), carried with 4
    // fractional bits, of which only 3 are usable when OVER8 is set.
    // (STM32F411xC/E Reference Manual, section 19.3.4.)
    if (pclk_freq / 16) >= baud {
        // 16x oversampling fits. `baud / 2` rounds to the closest
        // divisor instead of flooring.
        let div = (pclk_freq + (baud / 2)) / baud;
        (false, div)
    } else if (pclk_freq / 8) >= baud {
        // Too fast for 16x; fall back to 8x oversampling and
        // right-align the three usable fractional bits.
        let div = ((pclk_freq * 2) + (baud / 2)) / baud;
        let frac = div & 0xF;
        let div = (div & !0xF) | (frac >> 1);
        (true, div)
    } else {
        panic!("baud rate {} not reachable from pclk {}", baud, pclk_freq);
    }
}
