//! Emulates the encoder side of the bus on a host serial port, so the
//! firmware (or a USB-RS485 dongle wired to it) can be exercised
//! without the real device. Replies to every position read with a
//! sweeping angle; fault modes let the master's error paths be poked
//! from the command line.

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use amtlink_amt21::{READ_POSITION, SET_ZERO, frame};
use clap::Parser;
use log::{LevelFilter, debug, info, warn};
use serialport::{DataBits, Parity, StopBits};

#[derive(Parser, Debug)]
struct Args {
    /// Serial port to listen on
    port: String,

    #[arg(default_value_t = 2_000_000)]
    baud_rate: u32,

    /// Angle increment applied after every position reply
    #[arg(long, default_value_t = 16)]
    sweep_step: i16,

    /// Never answer position reads (exercises the no-response path)
    #[arg(long)]
    silent: bool,

    /// Corrupt a check bit in every reply (exercises the checksum path)
    #[arg(long)]
    corrupt: bool,
}

fn main() {
    env_logger::builder()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = Args::parse();
    let mut port = serialport::new(&args.port, args.baud_rate)
        .parity(Parity::None)
        .data_bits(DataBits::Eight)
        .stop_bits(StopBits::One)
        .timeout(Duration::from_millis(10))
        .open()
        .unwrap();

    info!("emulated encoder on {} at {} baud", args.port, args.baud_rate);

    let mut angle: i16 = 0;
    let mut pending: Vec<u8> = Vec::new();
    loop {
        let mut buf = [0u8; 64];
        let n = match port.read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::TimedOut => continue,
            Err(e) => panic!("serial read failed: {e:?}"),
        };
        pending.extend_from_slice(&buf[..n]);

        while !pending.is_empty() {
            if pending[0] == READ_POSITION {
                pending.remove(0);
                if args.silent {
                    debug!("position read ignored (silent mode)");
                    continue;
                }

                let mut reply = frame::encode(angle);
                if args.corrupt {
                    reply[1] ^= 0x80;
                }
                port.write_all(&reply).unwrap();
                debug!("position {} -> {:02x?}", angle, reply);
                angle = (angle + args.sweep_step) & 0x0FFF;
            } else if pending.starts_with(&SET_ZERO) {
                pending.drain(..SET_ZERO.len());
                angle = 0;
                info!("zero set, position reference cleared");
            } else if SET_ZERO.starts_with(&pending) {
                // Partial zero sequence; wait for the rest.
                break;
            } else {
                warn!("unrecognized byte {:#04x}", pending[0]);
                pending.remove(0);
            }
        }
    }
}
