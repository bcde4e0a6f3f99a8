use env_logger::fmt::style::{AnsiColor, RgbColor, Style};
use std::io::Write;

/// Set up `env_logger` with millisecond timestamps and colored levels. `RUST_LOG` controls the
/// filter. Calling it more than once is harmless, tests call it at the start of every case.
pub fn setup_logger() {
    let mut builder = env_logger::Builder::from_default_env();

    let _ = builder
        .format_timestamp_millis()
        .format(|buf, record| {
            let lvl: Style = match record.level() {
                log::Level::Error => AnsiColor::Red.on_default(),
                log::Level::Warn => AnsiColor::Yellow.on_default(),
                log::Level::Info => AnsiColor::Green.on_default(),
                log::Level::Debug => RgbColor(192, 192, 192).on_default(),
                log::Level::Trace => RgbColor(96, 96, 96).on_default(),
            }
            .bold();

            writeln!(
                buf,
                "{} - [{lvl}{:5}{lvl:#}] {}:{} - {}",
                buf.timestamp_millis(),
                record.level(),
                record.file().unwrap_or_default(),
                record.line().unwrap_or_default(),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Always)
        .try_init();
}
