//! `log` crate façade. Renders records through [`crate::console`] instead of
//! the ad hoc `print!` macros older kernels in this lineage used.

use log::{Level, LevelFilter, Metadata, Record};

/// Compile-time ceiling, mirroring upstream's `log/max_level_*` cargo
/// features: everything is captured in debug builds, `Info` and above in
/// release.
#[cfg(debug_assertions)]
const MAX_LEVEL: LevelFilter = LevelFilter::Trace;
#[cfg(not(debug_assertions))]
const MAX_LEVEL: LevelFilter = LevelFilter::Info;

struct KernelLogger;

impl log::Log for KernelLogger {
	fn enabled(&self, metadata: &Metadata<'_>) -> bool {
		metadata.level() <= MAX_LEVEL
	}

	fn log(&self, record: &Record<'_>) {
		if !self.enabled(record.metadata()) {
			return;
		}

		let color = match record.level() {
			Level::Error => "\x1b[31m",
			Level::Warn => "\x1b[33m",
			Level::Info => "\x1b[32m",
			Level::Debug => "\x1b[34m",
			Level::Trace => "\x1b[90m",
		};

		crate::console::write_fmt(format_args!(
			"{color}[{:5}][{}] {}\x1b[0m\n",
			record.level(),
			record.target(),
			record.args()
		));
	}

	fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// Installs the `log` backend. Safe to call multiple times; only the first
/// call takes effect, matching `log::set_logger`'s own contract.
pub fn init() {
	log::set_max_level(MAX_LEVEL);
	let _ = log::set_logger(&LOGGER);
}
