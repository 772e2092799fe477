//! LAPIC and IO-APIC programming: per-CPU timer/IPI delivery, GSI routing
//! for level-triggered device interrupts, and INIT/SIPI application
//! processor bring-up (spec §4.4, §5).

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use hermit_sync::InterruptTicketMutex;
use x86_64::registers::model_specific::Msr;

use crate::arch::x86_64::mm::PhysAddr;

const IA32_APIC_BASE: u32 = 0x1B;
const APIC_BASE_ENABLE: u64 = 1 << 11;

// LAPIC register offsets (Intel SDM vol. 3A, table 10-1), in 32-bit words
// from the LAPIC's mapped base.
mod reg {
	pub const ID: usize = 0x020;
	pub const EOI: usize = 0x0B0;
	pub const SPURIOUS: usize = 0x0F0;
	pub const ICR_LOW: usize = 0x300;
	pub const ICR_HIGH: usize = 0x310;
	pub const LVT_TIMER: usize = 0x320;
	pub const TIMER_INITIAL_COUNT: usize = 0x380;
	pub const TIMER_CURRENT_COUNT: usize = 0x390;
	pub const TIMER_DIVIDE: usize = 0x3E0;
}

/// LVT timer mode bit: periodic instead of one-shot (Intel SDM vol. 3A,
/// table 10-7).
const LVT_TIMER_PERIODIC: u32 = 1 << 17;
/// LVT mask bit: the vector is suppressed while set.
const LVT_MASKED: u32 = 1 << 16;
/// Divide-by-1 encoding for [`reg::TIMER_DIVIDE`].
const TIMER_DIVIDE_BY_1: u32 = 0b1011;

/// Bus-clock ticks per [`crate::config::TIMER_FREQ_HZ`] period, measured by
/// [`calibrate_timer`]. Shared across every CPU: the bus clock feeding the
/// LAPIC timer is common to the whole package, so one measurement on the
/// boot processor covers every AP's [`start_periodic_timer`] call too.
static TIMER_COUNT: AtomicU32 = AtomicU32::new(0);

const SPURIOUS_VECTOR: u32 = 0xFF;

/// Physical address the AP trampoline (`trampoline.s`) is assembled to run
/// at; must sit below 1 MiB and on a page boundary so the `SIPI` vector
/// (`addr >> 12`) is exact.
pub const SMP_BOOT_CODE_ADDRESS: u64 = 0x8000;

static LAPIC_VIRT_BASE: AtomicU64 = AtomicU64::new(0);
static ONLINE_APIC_IDS: InterruptTicketMutex<heapless_ids::IdSet> = InterruptTicketMutex::new(heapless_ids::IdSet::new());

mod heapless_ids {
	/// Fixed-capacity set of online LAPIC IDs; 256 covers every possible
	/// xAPIC ID.
	pub struct IdSet {
		present: [bool; 256],
	}

	impl IdSet {
		pub const fn new() -> Self {
			Self { present: [false; 256] }
		}

		pub fn insert(&mut self, id: u8) {
			self.present[id as usize] = true;
		}

		pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
			self.present
				.iter()
				.enumerate()
				.filter(|(_, present)| **present)
				.map(|(id, _)| id as u8)
		}
	}
}

fn mmio_read(offset: usize) -> u32 {
	let base = LAPIC_VIRT_BASE.load(Ordering::Acquire);
	unsafe { core::ptr::read_volatile((base as *const u32).byte_add(offset)) }
}

fn mmio_write(offset: usize, value: u32) {
	let base = LAPIC_VIRT_BASE.load(Ordering::Acquire);
	unsafe { core::ptr::write_volatile((base as *mut u32).byte_add(offset), value) };
}

/// Maps the LAPIC's MMIO page (read from `IA32_APIC_BASE`) and enables the
/// LAPIC globally. Called once, by CPU 0.
fn map_lapic() {
	if LAPIC_VIRT_BASE.load(Ordering::Acquire) != 0 {
		return;
	}
	let apic_base = unsafe { Msr::new(IA32_APIC_BASE).read() };
	let phys = PhysAddr::new(apic_base & 0xFFFF_F000);
	let va = crate::arch::x86_64::mm::virtualmem::map_mmio(phys, 1).expect("failed to map the LAPIC MMIO page");
	LAPIC_VIRT_BASE.store(va.as_u64(), Ordering::Release);

	unsafe {
		Msr::new(IA32_APIC_BASE).write(apic_base | APIC_BASE_ENABLE);
	}
}

pub fn local_apic_id() -> u32 {
	mmio_read(reg::ID) >> 24
}

/// Signals end-of-interrupt to the LAPIC. Must run after a level-triggered
/// device handler has read the interrupt cause out of the device (spec
/// §4.4's EOI-after-ISR-read discipline); edge-triggered vectors (IPIs,
/// the timer) may EOI immediately.
pub fn eoi() {
	mmio_write(reg::EOI, 0);
}

/// Brings the LAPIC up on CPU 0: maps it, programs the spurious-interrupt
/// vector, and registers this CPU's ID as online.
pub fn init_boot_processor() {
	map_lapic();
	mmio_write(reg::SPURIOUS, SPURIOUS_VECTOR | 0x100);
	ONLINE_APIC_IDS.lock().insert(local_apic_id() as u8);
}

/// Brings the LAPIC up on an application processor. The LAPIC MMIO page is
/// already mapped (shared across CPUs); this just enables it locally.
pub fn init_application_processor() {
	mmio_write(reg::SPURIOUS, SPURIOUS_VECTOR | 0x100);
	ONLINE_APIC_IDS.lock().insert(local_apic_id() as u8);
}

/// Sends a fixed-delivery-mode IPI carrying `vector` to `apic_id`.
fn send_ipi_to(apic_id: u8, vector: u8) {
	mmio_write(reg::ICR_HIGH, (apic_id as u32) << 24);
	mmio_write(reg::ICR_LOW, vector as u32);
	wait_for_icr_idle();
}

fn wait_for_icr_idle() {
	const DELIVERY_PENDING: u32 = 1 << 12;
	while mmio_read(reg::ICR_LOW) & DELIVERY_PENDING != 0 {
		core::hint::spin_loop();
	}
}

/// Broadcasts `vector` to every online CPU except this one. Used by
/// [`crate::arch::x86_64::mm::tlb::shootdown`].
pub fn send_ipi_all_but_self(vector: u8) {
	let self_id = local_apic_id() as u8;
	for id in ONLINE_APIC_IDS.lock().iter() {
		if id != self_id {
			send_ipi_to(id, vector);
		}
	}
}

/// Wakes every AP found in the Multiboot2/ACPI MADT with an INIT-SIPI-SIPI
/// sequence pointed at [`SMP_BOOT_CODE_ADDRESS`], where `trampoline.s` has
/// been copied by the loader. Blocks until every AP has bumped
/// [`crate::cpus_online`] or a fixed number of SIPI retries has elapsed.
pub fn start_application_processors() {
	let vector = (SMP_BOOT_CODE_ADDRESS >> 12) as u8;

	for id in discover_ap_ids() {
		send_init(id);
		spin_microseconds(10_000);
		send_sipi(id, vector);
		spin_microseconds(200);
		send_sipi(id, vector);

		let target = crate::cpus_online() + 1;
		for _ in 0..1_000_000 {
			if crate::cpus_online() >= target {
				break;
			}
			core::hint::spin_loop();
		}
	}
}

/// Enabled AP LAPIC ids from the platform layer's MADT parse
/// ([`super::acpi::platform`]), excluding this (the boot) CPU's own id.
/// Falls back to an empty list — single-CPU boot — when no platform layer
/// has called [`super::acpi::set_platform`].
fn discover_ap_ids() -> alloc::vec::Vec<u8> {
	let self_id = local_apic_id() as u8;
	match super::acpi::platform() {
		Some(platform) => platform
			.local_apics()
			.iter()
			.filter(|cpu| cpu.enabled && cpu.apic_id != self_id)
			.map(|cpu| cpu.apic_id)
			.collect(),
		None => alloc::vec::Vec::new(),
	}
}

fn send_init(apic_id: u8) {
	const INIT: u32 = 0b101 << 8;
	const LEVEL_ASSERT: u32 = 1 << 14;
	mmio_write(reg::ICR_HIGH, (apic_id as u32) << 24);
	mmio_write(reg::ICR_LOW, INIT | LEVEL_ASSERT);
	wait_for_icr_idle();
}

fn send_sipi(apic_id: u8, vector: u8) {
	const STARTUP: u32 = 0b110 << 8;
	mmio_write(reg::ICR_HIGH, (apic_id as u32) << 24);
	mmio_write(reg::ICR_LOW, STARTUP | vector as u32);
	wait_for_icr_idle();
}

fn spin_microseconds(count: u64) {
	for _ in 0..count * 100 {
		core::hint::spin_loop();
	}
}

/// Programs the local timer for periodic countdown at `count` bus cycles
/// per period and arms it on `vector` so it keeps re-firing without
/// software reloading the initial count each time.
pub fn arm_timer(vector: u8, count: u32) {
	mmio_write(reg::TIMER_DIVIDE, TIMER_DIVIDE_BY_1);
	mmio_write(reg::LVT_TIMER, LVT_TIMER_PERIODIC | vector as u32);
	mmio_write(reg::TIMER_INITIAL_COUNT, count);
}

/// Measures this CPU's LAPIC timer frequency against the TSC (already
/// calibrated by [`super::pit::calibrate`]): arms a free-running one-shot
/// countdown from `u32::MAX`, busy-waits a fixed window, and scales the
/// observed decrement to one [`crate::config::TIMER_FREQ_HZ`] period. Must
/// run on the boot processor after [`super::pit::calibrate`] and before
/// [`start_periodic_timer`]; every other CPU reuses the result (spec §4.6's
/// "Timer tick").
pub fn calibrate_timer() {
	const CALIBRATION_MS: u64 = 10;

	mmio_write(reg::TIMER_DIVIDE, TIMER_DIVIDE_BY_1);
	mmio_write(reg::LVT_TIMER, LVT_MASKED);
	mmio_write(reg::TIMER_INITIAL_COUNT, u32::MAX);

	let start = super::systemtime::monotonic_ns();
	while super::systemtime::monotonic_ns().saturating_sub(start) < CALIBRATION_MS * 1_000_000 {
		core::hint::spin_loop();
	}

	let elapsed_ticks = u32::MAX - mmio_read(reg::TIMER_CURRENT_COUNT);
	let ticks_per_ms = u64::from(elapsed_ticks) / CALIBRATION_MS;
	let ticks_per_period = (ticks_per_ms * 1000 / u64::from(crate::config::TIMER_FREQ_HZ)).max(1);
	TIMER_COUNT.store(ticks_per_period.min(u64::from(u32::MAX)) as u32, Ordering::Release);
}

/// Arms this CPU's timer in periodic mode on [`crate::config::VECTOR_PIT`]
/// using the count [`calibrate_timer`] measured, so [`crate::scheduler::tick`]
/// fires at [`crate::config::TIMER_FREQ_HZ`] without relying on the legacy
/// PIT's own (single-destination) IRQ line. Called once per CPU, after
/// [`calibrate_timer`] has run at least once anywhere in the system.
pub fn start_periodic_timer() {
	let count = TIMER_COUNT.load(Ordering::Acquire).max(1);
	arm_timer(crate::config::VECTOR_PIT, count);
}
