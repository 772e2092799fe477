//! Narrow seam to the text-mode VGA terminal and serial UART drivers, which
//! are out of scope for this crate (see the crate-level docs) but which the
//! logging and panic paths need to write through.

use core::fmt;

use hermit_sync::OnceCell;

/// A byte sink the boot trampoline's environment provides before this crate
/// runs any code of its own. Implemented by the external VGA/serial drivers;
/// this crate only ever writes to it.
pub trait Console: Send + Sync {
	fn write_str(&self, s: &str);
}

static CONSOLE: OnceCell<&'static dyn Console> = OnceCell::new();

/// Installs the console sink. Must be called once, before interrupts are
/// enabled on the bootstrap processor; a second call is a bug.
pub fn set_console(console: &'static dyn Console) {
	CONSOLE
		.set(console)
		.unwrap_or_else(|_| panic!("console already installed"));
}

pub(crate) fn write_fmt(args: fmt::Arguments<'_>) {
	struct Writer;
	impl fmt::Write for Writer {
		fn write_str(&mut self, s: &str) -> fmt::Result {
			if let Some(console) = CONSOLE.get() {
				console.write_str(s);
			}
			Ok(())
		}
	}

	let _ = fmt::Write::write_fmt(&mut Writer, args);
}
