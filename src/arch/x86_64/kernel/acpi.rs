//! Narrow seam the (external) ACPI/MADT table parser implements against.
//! This crate never parses ACPI tables itself; it only consumes the
//! processor-local-APIC and IO-APIC topology a platform layer hands it
//! through [`AcpiPlatformInfo`], matching the "narrow trait seams" split
//! called out in the crate root documentation.

/// One IO-APIC's base address and the first GSI it owns.
#[derive(Debug, Clone, Copy)]
pub struct IoApicInfo {
	pub id: u8,
	pub address: u64,
	pub gsi_base: u32,
}

/// One processor-local-APIC entry from the MADT.
#[derive(Debug, Clone, Copy)]
pub struct LocalApicInfo {
	pub processor_id: u8,
	pub apic_id: u8,
	pub enabled: bool,
}

/// Implemented by the platform layer that owns ACPI table parsing. The
/// kernel core only ever reads topology through this trait, never the raw
/// tables, so it stays testable with a hand-built fake in unit tests.
pub trait AcpiPlatformInfo {
	fn local_apics(&self) -> &[LocalApicInfo];
	fn io_apics(&self) -> &[IoApicInfo];
	/// Source IRQ overrides (legacy ISA IRQ -> GSI remaps), empty on most
	/// modern QEMU/KVM machine types but present on real hardware.
	fn irq_source_overrides(&self) -> &[(u8, u32)];
}

static PLATFORM: hermit_sync::OnceCell<&'static dyn AcpiPlatformInfo> = hermit_sync::OnceCell::new();

/// Registers the platform layer's parsed MADT topology. Must be called, at
/// most once, before [`super::boot_processor_init`] reaches
/// [`super::apic::start_application_processors`] if `smp` is wanted, and
/// before [`super::ioapic::init`] — both consult [`platform`] to decide
/// whether ACPI topology is available at all. A single-CPU, single-IO-APIC
/// boot with no external ACPI parser simply never calls this, and both
/// [`super::apic::discover_ap_ids`] and [`super::ioapic::init`] degrade to
/// their placeholder/no-op behavior.
pub fn set_platform(info: &'static dyn AcpiPlatformInfo) {
	let _ = PLATFORM.set(info);
}

pub fn platform() -> Option<&'static dyn AcpiPlatformInfo> {
	PLATFORM.get().copied()
}

#[cfg(test)]
mod tests {
	use super::*;

	struct Fake {
		local: [LocalApicInfo; 1],
		io: [IoApicInfo; 1],
	}

	impl AcpiPlatformInfo for Fake {
		fn local_apics(&self) -> &[LocalApicInfo] {
			&self.local
		}
		fn io_apics(&self) -> &[IoApicInfo] {
			&self.io
		}
		fn irq_source_overrides(&self) -> &[(u8, u32)] {
			&[]
		}
	}

	#[test]
	fn fake_platform_info_satisfies_the_trait() {
		let fake = Fake {
			local: [LocalApicInfo {
				processor_id: 0,
				apic_id: 0,
				enabled: true,
			}],
			io: [IoApicInfo {
				id: 0,
				address: 0xFEC0_0000,
				gsi_base: 0,
			}],
		};
		assert_eq!(fake.local_apics().len(), 1);
		assert_eq!(fake.io_apics()[0].gsi_base, 0);
	}
}
