//! Build- and boot-time tunables (spec §6 "Command line") plus the
//! kernel-internal constants the other modules key off of.

use core::sync::atomic::{AtomicBool, Ordering};

use hermit_sync::OnceCell;

/// Size of a physical page frame / page-table leaf.
pub const PAGE_SIZE: usize = 0x1000;

/// Number of pages backing one task's stack (spec §3 "Task").
pub const TASK_STACK_PAGES: usize = 8;

/// Upper bound on the number of CPUs the per-core scheduler and the
/// affinity/online-core masks track (spec §3's "bitset of CPU indices").
pub const MAX_CORES: usize = 256;

/// Number of slots in the temp-map window (spec §4.2).
pub const TEMP_MAP_SLOTS: usize = 512;

/// Maximum number of handlers sharing one interrupt vector (spec §4.4).
pub const MAX_SHARED_HANDLERS: usize = 8;

/// Maximum frames `alloc_contiguous` will ever be asked for in one call
/// (spec §4.1).
pub const MAX_CONTIGUOUS_FRAMES: usize = 16;

/// Maximum virtio block/SCSI requests in flight per device (spec §4.10).
pub const MAX_VIRTIO_SLOTS: usize = 64;

/// IO-APIC vector assignments (spec §6).
pub const VECTOR_PIT: u8 = 0x20;
pub const VECTOR_KEYBOARD: u8 = 0x21;
pub const VECTOR_SERIAL: u8 = 0x24;
pub const VECTOR_VIRTIO_BLK_BASE: u8 = 0x25;
pub const VECTOR_VIRTIO_NET_BASE: u8 = 0x30;
pub const VECTOR_VIRTIO_SCSI_BASE: u8 = 0x35;
pub const VECTOR_TLB_SHOOTDOWN: u8 = 0xFE - 1;
pub const VECTOR_IPI: u8 = 0xFE;

/// Sent by the first CPU to enter [`crate::arch::x86_64::kernel::panic::report`]
/// to every other CPU, asking it to stop scheduling and spin forever (spec
/// §4.5: "pulses an IPI to all other CPUs requesting them to halt").
pub const VECTOR_PANIC_HALT: u8 = 0xFC;

/// Spinlock hold time above which the out-of-scope watchdog collaborator
/// (spec §5) traces the offending lock's call site. Exported so that
/// collaborator can key off the same threshold this core documents.
pub const WATCHDOG_THRESHOLD_MS: u64 = 25;

/// PIT tick period, matching the classic 100 Hz kernel tick.
pub const TIMER_FREQ_HZ: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleTarget {
	Serial,
	Vga,
	Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpPolicy {
	On,
	Auto,
	Off,
}

#[derive(Debug, Clone, Copy)]
struct CmdLine {
	trace_vga: bool,
	panic_vga: bool,
	smp_off: bool,
	console: ConsoleTarget,
	dhcp: DhcpPolicy,
}

impl Default for CmdLine {
	fn default() -> Self {
		Self {
			trace_vga: false,
			panic_vga: false,
			smp_off: false,
			console: ConsoleTarget::Serial,
			dhcp: DhcpPolicy::Auto,
		}
	}
}

static CMDLINE: OnceCell<CmdLine> = OnceCell::new();
static PARSED: AtomicBool = AtomicBool::new(false);

/// Parses the whitespace-separated `key=value` command line handed to us by
/// the boot loader (the Multiboot2 "boot command line" tag). Unknown keys
/// and malformed tokens are ignored, matching the "recognized keys" table in
/// spec §6 — this is a hint line, not a strict grammar.
pub fn parse(cmdline: &str) {
	let mut parsed = CmdLine::default();

	for token in cmdline.split_whitespace() {
		let Some((key, value)) = token.split_once('=') else {
			continue;
		};

		match key {
			"trace" => parsed.trace_vga = value == "vga",
			"panic" => parsed.panic_vga = value == "vga",
			"smp" => parsed.smp_off = value == "off",
			"console" => {
				parsed.console = match value {
					"vga" => ConsoleTarget::Vga,
					"both" => ConsoleTarget::Both,
					_ => ConsoleTarget::Serial,
				}
			}
			"dhcp" => {
				parsed.dhcp = match value {
					"on" => DhcpPolicy::On,
					"off" => DhcpPolicy::Off,
					_ => DhcpPolicy::Auto,
				}
			}
			_ => {}
		}
	}

	let _ = CMDLINE.set(parsed);
	PARSED.store(true, Ordering::SeqCst);
}

fn cmdline() -> CmdLine {
	CMDLINE.get().copied().unwrap_or_default()
}

pub fn trace_to_vga() -> bool {
	cmdline().trace_vga
}

pub fn panic_to_vga() -> bool {
	cmdline().panic_vga
}

pub fn smp_enabled() -> bool {
	!cmdline().smp_off
}

pub fn console_target() -> ConsoleTarget {
	cmdline().console
}

pub fn dhcp_policy() -> DhcpPolicy {
	cmdline().dhcp
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn unknown_tokens_are_ignored_not_fatal() {
		let mut c = CmdLine::default();
		for token in "smp=off frobnicate garbage=1=2 console=both".split_whitespace() {
			if let Some((key, value)) = token.split_once('=') {
				match key {
					"smp" => c.smp_off = value == "off",
					"console" => {
						c.console = match value {
							"both" => ConsoleTarget::Both,
							_ => ConsoleTarget::Serial,
						}
					}
					_ => {}
				}
			}
		}
		assert!(c.smp_off);
		assert_eq!(c.console, ConsoleTarget::Both);
	}
}
