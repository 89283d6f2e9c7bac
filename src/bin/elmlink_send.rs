//! One-shot low-level sender: opens the UART, serializes exactly one
//! packet, writes it out fully, and exits. Has no event loop, so unlike the
//! daemon it's allowed to just retry on `EAGAIN`.

use std::io::Write;
use std::process::ExitCode;

use clap::Parser;

use elmlinkd::codec::packet;
use elmlinkd::config::SendArgs;
use elmlinkd::serial;

fn main() -> ExitCode {
    let args = SendArgs::parse();

    let baud_flag = match serial::baud::flag_for(args.baud) {
        Ok(flag) => flag,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut uart = match serial::open_uart(&args.uart_path, baud_flag) {
        Ok(uart) => uart,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let frame = match packet::serialize(args.channel, &args.bytes) {
        Ok(frame) => frame,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut written = 0;
    while written < frame.len() {
        match uart.write(&frame[written..]) {
            Ok(n) => written += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => {
                eprintln!("write failed: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }

    ExitCode::SUCCESS
}
