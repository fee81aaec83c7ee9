#![no_std]

#[cfg(feature = "stm32f411")]
pub mod clock;
#[cfg(feature = "stm32f411")]
pub mod dir;
#[cfg(feature = "stm32f411")]
pub mod usart;
