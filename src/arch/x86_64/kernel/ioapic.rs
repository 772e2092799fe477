//! IO-APIC redirection-table programming (spec §4.4): routes a global
//! system interrupt (GSI) to a vector delivered to a chosen CPU's LAPIC,
//! with the trigger mode and polarity the platform layer's ACPI/MADT
//! parser reports through [`super::acpi::AcpiPlatformInfo`]. The boot
//! processor maps every IO-APIC found there once, in [`init`]; after that,
//! [`super::irq::install_handler_for_gsi`] programs one redirection entry
//! per GSI the first time a handler registers for it.

use core::sync::atomic::{AtomicU64, Ordering};

use hermit_sync::InterruptTicketMutex;

use super::acpi::AcpiPlatformInfo;
use crate::arch::x86_64::mm::{virtualmem, PhysAddr};

const REG_ID: u32 = 0x00;
const REG_VERSION: u32 = 0x01;
const REDIR_TABLE_BASE: u32 = 0x10;

const IOREGSEL_OFFSET: usize = 0x00;
const IOWIN_OFFSET: usize = 0x10;

/// Redirection-entry low dword bits (Intel 82093AA datasheet, §3.2.4).
const DELIVERY_FIXED: u32 = 0b000 << 8;
const DEST_MODE_PHYSICAL: u32 = 0 << 11;
const POLARITY_ACTIVE_LOW: u32 = 1 << 13;
const TRIGGER_LEVEL: u32 = 1 << 15;
const MASKED: u32 = 1 << 16;

const MAX_IOAPICS: usize = 8;

#[derive(Clone, Copy)]
struct MappedIoApic {
	gsi_base: u32,
	gsi_count: u32,
	va: u64,
}

struct IoApicTable {
	entries: [Option<MappedIoApic>; MAX_IOAPICS],
	count: usize,
}

impl IoApicTable {
	const fn empty() -> Self {
		Self {
			entries: [None; MAX_IOAPICS],
			count: 0,
		}
	}
}

static TABLE: InterruptTicketMutex<IoApicTable> = InterruptTicketMutex::new(IoApicTable::empty());
static OVERRIDES: InterruptTicketMutex<heapless_overrides::OverrideSet> =
	InterruptTicketMutex::new(heapless_overrides::OverrideSet::new());
static INITIALIZED: AtomicU64 = AtomicU64::new(0);

mod heapless_overrides {
	/// Legacy ISA IRQ -> GSI remaps (spec §4.4's "IRQ source overrides"),
	/// at most one per ISA line.
	pub struct OverrideSet {
		gsi_for_irq: [Option<u32>; 16],
	}

	impl OverrideSet {
		pub const fn new() -> Self {
			Self { gsi_for_irq: [None; 16] }
		}

		pub fn set(&mut self, irq: u8, gsi: u32) {
			if (irq as usize) < self.gsi_for_irq.len() {
				self.gsi_for_irq[irq as usize] = Some(gsi);
			}
		}

		pub fn get(&self, irq: u8) -> Option<u32> {
			self.gsi_for_irq.get(irq as usize).copied().flatten()
		}
	}
}

fn read_reg(va: u64, reg: u32) -> u32 {
	unsafe {
		core::ptr::write_volatile((va as usize + IOREGSEL_OFFSET) as *mut u32, reg);
		core::ptr::read_volatile((va as usize + IOWIN_OFFSET) as *const u32)
	}
}

fn write_reg(va: u64, reg: u32, value: u32) {
	unsafe {
		core::ptr::write_volatile((va as usize + IOREGSEL_OFFSET) as *mut u32, reg);
		core::ptr::write_volatile((va as usize + IOWIN_OFFSET) as *mut u32, value);
	}
}

/// Maps every IO-APIC `platform` reports and records its GSI source
/// overrides. Idempotent; the second and later calls (one per AP bring-up
/// path that happens to run this) are no-ops.
pub fn init(platform: &dyn AcpiPlatformInfo) {
    if INITIALIZED.swap(1, Ordering::AcqRel) != 0 {
        return;
    }

	let mut table = TABLE.lock();
	for info in platform.io_apics() {
		if table.count >= MAX_IOAPICS {
			log::warn!("ioapic: more IO-APICs reported than this core tracks, dropping id {}", info.id);
			continue;
		}
		let phys = PhysAddr::new(info.address);
		let va = virtualmem::map_mmio(phys, 1).expect("failed to map an IO-APIC MMIO page");
		let version = read_reg(va.as_u64(), REG_VERSION);
		let max_redir = (version >> 16) & 0xFF;
		table.entries[table.count] = Some(MappedIoApic {
			gsi_base: info.gsi_base,
			gsi_count: max_redir + 1,
			va: va.as_u64(),
		});
		table.count += 1;
	}
	drop(table);

	let mut overrides = OVERRIDES.lock();
	for &(irq, gsi) in platform.irq_source_overrides() {
		overrides.set(irq, gsi);
	}
}

/// Resolves a legacy ISA IRQ line (0..=15) to the GSI it is actually wired
/// to, applying any override the MADT reported; identity when none exists.
pub fn gsi_for_legacy_irq(irq: u8) -> u32 {
	OVERRIDES.lock().get(irq).unwrap_or(irq as u32)
}

fn find_ioapic_for_gsi(gsi: u32) -> Option<MappedIoApic> {
	let table = TABLE.lock();
	table.entries[..table.count]
		.iter()
		.flatten()
		.find(|e| gsi >= e.gsi_base && gsi < e.gsi_base + e.gsi_count)
		.copied()
}

/// Programs `gsi`'s redirection entry to deliver `vector` to `dest_apic_id`,
/// with the trigger mode/polarity the caller already resolved from the
/// MADT's (or this line's default) flags. No-ops with a warning if `gsi`
/// does not fall inside any IO-APIC [`init`] mapped.
pub fn route_gsi(gsi: u32, vector: u8, dest_apic_id: u8, level_triggered: bool, active_low: bool) {
	let Some(ioapic) = find_ioapic_for_gsi(gsi) else {
		log::warn!("ioapic: no IO-APIC owns gsi {gsi}, dropping route to vector {vector}");
		return;
	};
	let index = gsi - ioapic.gsi_base;
	let low_reg = REDIR_TABLE_BASE + index * 2;
	let high_reg = low_reg + 1;

	let mut low = DELIVERY_FIXED | DEST_MODE_PHYSICAL | vector as u32;
	if level_triggered {
		low |= TRIGGER_LEVEL;
	}
	if active_low {
		low |= POLARITY_ACTIVE_LOW;
	}

	write_reg(ioapic.va, high_reg, (dest_apic_id as u32) << 24);
	write_reg(ioapic.va, low_reg, low);
}

/// Masks (disables delivery for) `gsi`'s redirection entry without clearing
/// the rest of its configuration, letting a driver quiesce its interrupt
/// line temporarily without forgetting its routing.
pub fn mask_gsi(gsi: u32) {
	let Some(ioapic) = find_ioapic_for_gsi(gsi) else {
		return;
	};
	let index = gsi - ioapic.gsi_base;
	let low_reg = REDIR_TABLE_BASE + index * 2;
	let current = read_reg(ioapic.va, low_reg);
	write_reg(ioapic.va, low_reg, current | MASKED);
}

pub fn unmask_gsi(gsi: u32) {
	let Some(ioapic) = find_ioapic_for_gsi(gsi) else {
		return;
	};
	let index = gsi - ioapic.gsi_base;
	let low_reg = REDIR_TABLE_BASE + index * 2;
	let current = read_reg(ioapic.va, low_reg);
	write_reg(ioapic.va, low_reg, current & !MASKED);
}

/// `(id, version register)` for every mapped IO-APIC, exposed for
/// diagnostics only.
pub fn ids_and_versions() -> alloc::vec::Vec<(u8, u32)> {
	let table = TABLE.lock();
	table.entries[..table.count]
		.iter()
		.flatten()
		.map(|e| ((read_reg(e.va, REG_ID) >> 24) as u8, read_reg(e.va, REG_VERSION)))
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn legacy_irq_defaults_to_identity_gsi_without_an_override() {
		assert_eq!(gsi_for_legacy_irq(4), 4);
	}

	#[test]
	fn override_set_remaps_a_specific_irq() {
		let mut set = heapless_overrides::OverrideSet::new();
		set.set(0, 2);
		assert_eq!(set.get(0), Some(2));
		assert_eq!(set.get(1), None);
	}
}
