//! Console logging setup: a colored, timestamped `fern` dispatch to stdout.
//! `-v` raises the default filter to `debug`; `RUST_LOG` (a bare level name,
//! not a full directive string) can override it, layered on top the way
//! Rust CLIs commonly do.

use colored::Color;
use fern::colors::ColoredLevelConfig;

pub fn init(verbose: bool) {
    let colors_line = ColoredLevelConfig::new()
        .error(Color::Red)
        .warn(Color::Yellow)
        .info(Color::White)
        .debug(Color::Green)
        .trace(Color::Blue);

    let default_level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|v| v.parse::<log::LevelFilter>().ok())
        .unwrap_or(default_level);

    let result = fern::Dispatch::new()
        .level(level)
        .format(move |out, message, record| {
            out.finish(format_args!(
                "{}{}[{}][{}] {}",
                format_args!("\x1B[{}m", colors_line.get_color(&record.level()).to_fg_str()),
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .chain(std::io::stdout())
        .apply();

    if let Err(e) = result {
        eprintln!("Failed to initialize logging: {e}");
    }
}
