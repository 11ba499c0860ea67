//! stderr logger for the simulator.
//!
//! Pipeline log lines already carry a `[SUBSYS]` prefix, so only the level
//! is added.

use log::{LevelFilter, Metadata, Record};

static LOGGER: SimLogger = SimLogger;

struct SimLogger;

impl log::Log for SimLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("{:<5} {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Install the logger. Fails if another logger is already set.
pub fn init(max_level: LevelFilter) -> anyhow::Result<()> {
    log::set_logger(&LOGGER).map_err(|e| anyhow::anyhow!("logger: {e}"))?;
    log::set_max_level(max_level);
    Ok(())
}
