//! Shared-vector IRQ dispatch (spec §4.4) and the nested interrupt-disable
//! primitive [`crate::collections::AvoidInterrupts`] is built on.
//!
//! Up to [`crate::config::MAX_SHARED_HANDLERS`] handlers can register
//! against the same vector; [`dispatch`] runs all of them in registration
//! order and leaves end-of-interrupt signalling to the caller (a
//! level-triggered device's handler must read the cause out of the device
//! before EOI, matching the "EOI-after-ISR-read" discipline of spec §4.4).

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use hermit_sync::InterruptTicketMutex;

use crate::config::MAX_SHARED_HANDLERS;

pub type HandlerFn = fn();

struct VectorSlot {
	handlers: [Option<HandlerFn>; MAX_SHARED_HANDLERS],
	count: usize,
	name: Option<&'static str>,
}

impl VectorSlot {
	const fn empty() -> Self {
		Self {
			handlers: [None; MAX_SHARED_HANDLERS],
			count: 0,
			name: None,
		}
	}
}

const VECTOR_COUNT: usize = 256;

static TABLE: InterruptTicketMutex<[VectorSlot; VECTOR_COUNT]> =
	InterruptTicketMutex::new([const { VectorSlot::empty() }; VECTOR_COUNT]);

static COUNTERS: [AtomicU64; VECTOR_COUNT] = [const { AtomicU64::new(0) }; VECTOR_COUNT];

/// Registers `handler` against `vector`. Fails silently past
/// [`MAX_SHARED_HANDLERS`] registrations on one vector; callers are expected
/// to route shared IRQ lines across the vector range the device class
/// reserves (spec §6's `VECTOR_VIRTIO_*_BASE` spacing) rather than pile
/// every instance onto one vector.
pub fn install_handler(vector: u8, handler: HandlerFn, name: &'static str) -> crate::errno::Result<()> {
	install_handler_counted(vector, handler, name).map(|_| ())
}

/// As [`install_handler`], but also reports whether `handler` became the
/// first registration for `vector` — the signal [`install_handler_for_gsi`]
/// uses to decide whether the IO-APIC redirection entry still needs
/// programming.
fn install_handler_counted(vector: u8, handler: HandlerFn, name: &'static str) -> crate::errno::Result<bool> {
	let mut table = TABLE.lock();
	let slot = &mut table[vector as usize];
	if slot.count >= MAX_SHARED_HANDLERS {
		return Err(crate::errno::Error::BufTooBig);
	}
	let was_first = slot.count == 0;
	slot.handlers[slot.count] = Some(handler);
	slot.count += 1;
	if slot.name.is_none() {
		slot.name = Some(name);
	}
	Ok(was_first)
}

/// Registers `handler` on `vector` and, the first time any handler is
/// registered for `vector`, programs `gsi`'s IO-APIC redirection entry to
/// deliver it here (spec §4.4: "first handler for a GSI: program the
/// IO-APIC redirection entry"). `level_triggered`/`active_low` come from
/// the ACPI MADT's interrupt source override flags (edge/active-high when
/// the platform layer reports none for this line). Subsequent handlers
/// sharing the vector reuse the entry already in place.
pub fn install_handler_for_gsi(
	gsi: u32,
	vector: u8,
	handler: HandlerFn,
	name: &'static str,
	level_triggered: bool,
	active_low: bool,
) -> crate::errno::Result<()> {
	let was_first = install_handler_counted(vector, handler, name)?;
	if was_first {
		let dest = super::apic::local_apic_id() as u8;
		super::ioapic::route_gsi(gsi, vector, dest, level_triggered, active_low);
	}
	Ok(())
}

pub fn name_of(vector: u8) -> Option<&'static str> {
	TABLE.lock()[vector as usize].name
}

pub fn count_of(vector: u8) -> u64 {
	COUNTERS[vector as usize].load(Ordering::Relaxed)
}

/// Runs every handler registered for `vector` and bumps its counter. Called
/// from [`super::interrupts::generic_device_handler`] for vectors 32..=255.
pub fn dispatch(vector: u8) {
	COUNTERS[vector as usize].fetch_add(1, Ordering::Relaxed);

	if vector == crate::config::VECTOR_PIT {
		super::apic::eoi();
		crate::scheduler::tick();
		return;
	}
	if vector == crate::config::VECTOR_TLB_SHOOTDOWN {
		crate::arch::x86_64::mm::tlb::handle_ipi();
		super::apic::eoi();
		return;
	}
	if vector == crate::config::VECTOR_IPI {
		super::apic::eoi();
		crate::scheduler::tick();
		return;
	}
	if vector == crate::config::VECTOR_PANIC_HALT {
		// Another CPU is already past the compare-and-swap in
		// `panic::report`; join it in spinning forever rather than EOI and
		// return to whatever this CPU was doing.
		x86_64::instructions::interrupts::disable();
		loop {
			super::processor::halt();
		}
	}

	let handlers = {
		let table = TABLE.lock();
		let slot = &table[vector as usize];
		let mut buf = [None; MAX_SHARED_HANDLERS];
		buf[..slot.count].copy_from_slice(&slot.handlers[..slot.count]);
		buf
	};

	for handler in handlers.into_iter().flatten() {
		handler();
	}

	super::apic::eoi();
}

/// Disables interrupts and returns whether they were previously enabled, so
/// the caller can nest correctly with [`nested_enable`].
#[inline]
pub fn nested_disable() -> bool {
	let was_enabled = x86_64::instructions::interrupts::are_enabled();
	x86_64::instructions::interrupts::disable();
	was_enabled
}

/// Restores the interrupt-enable state captured by [`nested_disable`].
#[inline]
pub fn nested_enable(was_enabled: bool) {
	if was_enabled {
		x86_64::instructions::interrupts::enable();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn noop() {}

	#[test]
	fn install_handler_rejects_past_the_shared_limit() {
		for _ in 0..MAX_SHARED_HANDLERS {
			install_handler(200, noop, "test").unwrap();
		}
		assert!(install_handler(200, noop, "test").is_err());
	}
}
