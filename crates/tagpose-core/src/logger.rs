//! Operator console logger.
//!
//! The pipeline runs headless; the operator reads calibration guidance and
//! degraded-mode warnings from stderr, one line per record:
//! `[  12.345s  WARN tagpose] message`.
//!
//! Records from the tagpose crates pass at the configured level. Everything
//! else (corner detector, image codecs) is capped at `warn` so that a
//! `debug` session stays readable.

use std::fmt::Arguments;
use std::io::Write;
use std::sync::OnceLock;
use std::time::Instant;

use log::{Level, LevelFilter, Log, Metadata, Record};

#[cfg(feature = "tracing")]
use tracing_subscriber::fmt::format::FmtSpan;
#[cfg(feature = "tracing")]
use tracing_subscriber::util::SubscriberInitExt;
#[cfg(feature = "tracing")]
use tracing_subscriber::{fmt, EnvFilter};

const OWN_PREFIX: &str = "tagpose";
const FOREIGN_CAP: LevelFilter = LevelFilter::Warn;

struct OperatorConsole {
    level: LevelFilter,
    epoch: Instant,
}

impl OperatorConsole {
    fn threshold(&self, target: &str) -> LevelFilter {
        if target.starts_with(OWN_PREFIX) {
            self.level
        } else {
            self.level.min(FOREIGN_CAP)
        }
    }
}

fn format_line(elapsed_s: f64, level: Level, target: &str, args: &Arguments<'_>) -> String {
    let krate = target.split("::").next().unwrap_or(target);
    format!("[{elapsed_s:8.3}s {level:>5} {krate}] {args}")
}

impl Log for OperatorConsole {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.threshold(metadata.target())
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format_line(
            self.epoch.elapsed().as_secs_f64(),
            record.level(),
            record.target(),
            record.args(),
        );
        let _ = writeln!(std::io::stderr().lock(), "{line}");
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

static CONSOLE: OnceLock<OperatorConsole> = OnceLock::new();

/// Install the operator console at `level`.
///
/// Only the first call installs anything; later calls return `Ok(())`.
pub fn init_with_level(level: LevelFilter) -> Result<(), log::SetLoggerError> {
    if CONSOLE.get().is_some() {
        return Ok(());
    }
    let console = CONSOLE.get_or_init(|| OperatorConsole {
        level,
        epoch: Instant::now(),
    });
    log::set_logger(console)?;
    log::set_max_level(level);
    Ok(())
}

/// Install a `tracing` subscriber that reports span timings on close.
///
/// The filter comes from `RUST_LOG` and defaults to `info`.
#[cfg(feature = "tracing")]
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        let _ = fmt()
            .with_env_filter(filter)
            .with_span_events(FmtSpan::CLOSE)
            .json()
            .flatten_event(true)
            .finish()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(filter)
            .with_span_events(FmtSpan::CLOSE)
            .with_timer(fmt::time::Uptime::default())
            .finish()
            .try_init();
    }
}
