//! Per-CPU bring-up and the collaborators that live at the architecture
//! boundary: the GDT/IDT, the LAPIC/IO-APIC driver, the legacy PIT used to
//! calibrate the TSC, PCI configuration space access, and the narrow ACPI
//! trait seam the platform table parser implements against.

pub mod acpi;
pub mod apic;
pub mod backtrace;
pub mod gdt;
pub mod interrupts;
pub mod ioapic;
pub mod irq;
pub mod panic;
pub mod pci;
pub mod percore;
pub mod pit;
pub mod processor;
pub mod switch;
pub mod symbols;
pub mod systemtime;

use multiboot2::BootInformation;

use crate::arch::x86_64::mm::PhysAddr;

/// Runs once, on CPU 0, before any other CPU is started. Parses the
/// Multiboot2 info block, brings up the GDT/IDT, the physical and virtual
/// memory managers, the LAPIC/IO-APIC, and the PIT-calibrated time source,
/// then starts application processors if SMP is enabled.
///
/// # Safety
///
/// See [`crate::kernel_init`].
pub unsafe fn boot_processor_init(multiboot_info_addr: usize) {
	gdt::init();
	interrupts::install();

	let boot_info = unsafe {
		BootInformation::load(multiboot_info_addr as *const multiboot2::BootInformationHeader)
			.expect("malformed Multiboot2 information block")
	};

	if let Some(cmdline) = boot_info.command_line_tag().and_then(|t| t.cmdline().ok()) {
		crate::config::parse(cmdline);
	}

	let regions: alloc::vec::Vec<(u64, u64)> = boot_info
		.memory_map_tag()
		.map(|tag| {
			tag.memory_areas()
				.iter()
				.filter(|area| area.typ() == multiboot2::MemoryAreaType::Available)
				.map(|area| (area.start_address(), area.end_address()))
				.collect()
		})
		.unwrap_or_default();

	let (kernel_start, kernel_end) = kernel_image_bounds(&boot_info);
	crate::mm::init(&regions, kernel_start, kernel_end, 256);
	symbols::init(&boot_info);

	percore::init(0);
	apic::init_boot_processor();
	if let Some(platform) = acpi::platform() {
		ioapic::init(platform);
	}
	pit::calibrate();
	systemtime::init_wall_clock();
	apic::calibrate_timer();
	apic::start_periodic_timer();

	if crate::config::smp_enabled() {
		apic::start_application_processors();
	}

	crate::softirq::spawn_worker();
	crate::drivers::virtio::init();

	let devices = crate::drivers::virtio::devices().expect("virtio::init just ran").lock();
	log::info!(
		"boot processor up: {} / {} frames free, {} block + {} net + {} scsi virtio device(s)",
		crate::mm::free_frames(),
		crate::mm::total_frames(),
		devices.block.len(),
		devices.net.len(),
		devices.scsi.len(),
	);
	drop(devices);

	x86_64::instructions::interrupts::enable();
}

/// Runs on every CPU other than CPU 0, after the AP trampoline has switched
/// it into long mode on the shared bootstrap page table.
///
/// # Safety
///
/// See [`crate::kernel_init`].
pub unsafe fn application_processor_init() {
	gdt::init();
	interrupts::install();
	let core_id = apic::local_apic_id();
	percore::init(core_id);
	apic::init_application_processor();
	apic::start_periodic_timer();
	crate::softirq::spawn_worker();

	x86_64::instructions::interrupts::enable();
}

fn kernel_image_bounds(boot_info: &BootInformation<'_>) -> (u64, u64) {
	boot_info
		.elf_sections_tag()
		.map(|tag| {
			let start = tag
				.sections()
				.filter(|s| s.size() > 0)
				.map(|s| s.start_address())
				.min()
				.unwrap_or(0);
			let end = tag
				.sections()
				.filter(|s| s.size() > 0)
				.map(|s| s.start_address() + s.size())
				.max()
				.unwrap_or(0);
			(start, end)
		})
		.unwrap_or((0, 0))
}

/// Physical address of the Multiboot2-reported ACPI RSDP, if present. Feeds
/// [`acpi::AcpiPlatformInfo`] implementors.
pub fn acpi_rsdp(boot_info: &BootInformation<'_>) -> Option<PhysAddr> {
	boot_info
		.rsdp_v2_tag()
		.map(|t| PhysAddr::new(t as *const _ as u64))
		.or_else(|| boot_info.rsdp_v1_tag().map(|t| PhysAddr::new(t as *const _ as u64)))
}
