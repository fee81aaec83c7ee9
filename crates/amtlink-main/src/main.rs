//! Polls an absolute encoder over RS-485 and reports the angle through
//! the ITM. USART1 on PB6/PB7, transmit-enable on PA8, wired for a
//! WeAct BlackPill (25 MHz HSE).

#![no_std]
#![no_main]
#![allow(static_mut_refs)]

use core::mem::MaybeUninit;

use amtlink_amt21::{Amt21, ZERO_SETTLE};
use amtlink_common::{dev_info, dev_warn};
use amtlink_peripheral::clock::DwtClock;
use amtlink_peripheral::dir::DirPin;
use amtlink_peripheral::usart::UsartDevice;
use amtlink_serial::rs485::Rs485Master;
use amtlink_serial::transport::AsyncSerial;
use cortex_m::delay::Delay;
use cortex_m_rt::entry;
#[allow(unused_imports)]
use panic_itm as _;
use stm32f4xx_hal::interrupt;
use stm32f4xx_hal::pac::{self, Interrupt, NVIC};
use stm32f4xx_hal::prelude::*;

const BAUD_RATE: u32 = 2_000_000;
const QUEUE_LEN: usize = 256;

type Serial = AsyncSerial<UsartDevice<pac::USART1>, QUEUE_LEN>;

/// The transport is reached both from the main flow of control (through
/// the bus master) and from the USART1 interrupt below.
static mut SERIAL: MaybeUninit<Serial> = MaybeUninit::uninit();

#[entry]
fn main() -> ! {
    let dp = pac::Peripherals::take().unwrap();
    let mut cortex = cortex_m::Peripherals::take().unwrap();

    let rcc = dp.RCC.constrain();
    let clocks = rcc
        .cfgr
        .use_hse(25.MHz())
        .sysclk(96.MHz())
        .pclk1(48.MHz())
        .pclk2(48.MHz())
        .freeze();

    itm_logger::init_with_level(log::Level::Info).unwrap();
    dev_info!("Device startup");

    let gpioa = dp.GPIOA.split();
    let gpiob = dp.GPIOB.split();

    let tx = gpiob.pb6.into_alternate();
    let rx = gpiob.pb7.into_alternate();
    let dir = DirPin::new(gpioa.pa8.into_push_pull_output());

    let clock = DwtClock::new(&clocks, &mut cortex.DCB, &mut cortex.DWT);
    let mut delay = Delay::new(cortex.SYST, clocks.sysclk().raw());

    let device = UsartDevice::init(dp.USART1, (tx, rx), BAUD_RATE, &clocks);
    let serial: &'static Serial = unsafe { SERIAL.write(AsyncSerial::new(device)) };

    unsafe {
        NVIC::unmask(Interrupt::USART1);
    }

    let master: Rs485Master<_, _, _> = Rs485Master::new(serial, dir, clock, BAUD_RATE);
    let mut encoder = Amt21::new(master);

    if encoder.set_zero_position().is_err() {
        dev_warn!("zero-set command could not be queued");
    }
    delay.delay_ms(ZERO_SETTLE.as_millis() as u32);

    loop {
        match encoder.read_angle() {
            Ok(angle) => dev_info!("ang:{} error:0", angle),
            Err(e) => dev_info!("ang:0 error:{}", e.code()),
        }
        delay.delay_ms(100);
    }
}

#[interrupt]
fn USART1() {
    let serial = unsafe { SERIAL.assume_init_ref() };
    serial.handle_rx_intr();
    serial.handle_tx_intr();
}
