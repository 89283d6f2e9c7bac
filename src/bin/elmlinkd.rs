//! The daemon: opens the UART, binds the channel directory, and runs the
//! multiplex engine until a fatal error occurs.

use std::process::ExitCode;

use clap::Parser;

use elmlinkd::config::DaemonArgs;
use elmlinkd::engine::Engine;
use elmlinkd::error::StartupError;
use elmlinkd::serial;

fn run(args: DaemonArgs) -> Result<(), StartupError> {
    // Resolve symlinks/relative components before it's opened or recorded in
    // `.index`, falling back to the argument as given if that fails (mirrors
    // the original daemon's `realpath`-then-fallback behavior).
    let uart_path = std::fs::canonicalize(&args.uart_path).unwrap_or(args.uart_path);

    let baud_flag = serial::baud::flag_for(args.baud)?;
    let uart = serial::open_uart(&uart_path, baud_flag)?;

    elmlinkd::directory::ensure_socket_dir(&args.socket_dir)?;

    let mut engine = Engine::new(
        uart,
        uart_path.to_string_lossy().into_owned(),
        args.baud,
        args.socket_dir,
    );

    if let Err(e) = engine.run() {
        log::error!("multiplex engine terminated: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

fn main() -> ExitCode {
    let args = DaemonArgs::parse();

    if let Err(e) = elmlinkd::logging::init_log(args.debug) {
        eprintln!("failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
