//! Logging setup: a `fern` dispatch backing the `log` facade, the same
//! pairing the teacher crate's `Cargo.toml` pulls in (`log` + `fern` +,
//! there, `time`). `time` 0.1 is long unmaintained, so timestamps here come
//! from `chrono::Local::now()` instead.

use std::convert::Infallible;

use log::LevelFilter;

/// Initializes the global logger at `level`, writing to stderr with a
/// `[time LEVEL target] message` line format.
pub fn init_log(level: LevelFilter) -> Result<(), fern::InitError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr())
        .apply()?;

    Ok(())
}

/// Parses the `-d/--debug` CLI value into a `log::LevelFilter`. Unrecognized
/// strings fall back to `Error`, matching the teacher console's fallback.
/// Infallible, but returns `Result` so it satisfies clap's `value_parser`
/// (its derive only recognizes `Fn(&str) -> Result<T, E>`).
pub fn parse_level(s: &str) -> Result<LevelFilter, Infallible> {
    Ok(match s.to_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_level_recognizes_all_named_levels() {
        assert_eq!(parse_level("Off"), Ok(LevelFilter::Off));
        assert_eq!(parse_level("ERROR"), Ok(LevelFilter::Error));
        assert_eq!(parse_level("warn"), Ok(LevelFilter::Warn));
        assert_eq!(parse_level("Info"), Ok(LevelFilter::Info));
        assert_eq!(parse_level("debug"), Ok(LevelFilter::Debug));
        assert_eq!(parse_level("Trace"), Ok(LevelFilter::Trace));
    }

    #[test]
    fn parse_level_falls_back_to_error_on_garbage() {
        assert_eq!(parse_level("garbage"), Ok(LevelFilter::Error));
    }
}
