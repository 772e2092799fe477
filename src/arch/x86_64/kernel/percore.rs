//! Per-CPU data block, reached through `GS_BASE` rather than an indexed
//! lookup table so [`current`] is a single `rdmsr`/pointer load even from
//! an interrupt handler.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU32, Ordering};

use x86_64::registers::model_specific::Msr;

const IA32_GS_BASE: u32 = 0xC000_0101;

static NEXT_SLOT: AtomicU32 = AtomicU32::new(0);

/// Fields the scheduler and IRQ subsystem read every timer tick;
/// deliberately small and `repr(C)` so its layout is a stable ABI for the
/// naked-asm context switch in [`super::switch`].
#[repr(C)]
pub struct CoreData {
	pub core_id: u32,
	pub lapic_id: u32,
	/// Incremented by [`crate::collections::AvoidInterrupts`]; the
	/// scheduler only preempts when this is zero.
	pub preempt_disable_count: core::sync::atomic::AtomicU32,
}

/// Allocates and installs this CPU's [`CoreData`] block. Must run after
/// [`super::apic::init_boot_processor`]/`init_application_processor` so
/// `lapic_id` is accurate.
pub fn init(core_id: u32) {
	let lapic_id = super::apic::local_apic_id();
	let data = Box::leak(Box::new(CoreData {
		core_id,
		lapic_id,
		preempt_disable_count: core::sync::atomic::AtomicU32::new(0),
	}));
	unsafe {
		Msr::new(IA32_GS_BASE).write(data as *mut CoreData as u64);
	}
	NEXT_SLOT.fetch_max(core_id + 1, Ordering::SeqCst);
}

/// Returns the calling CPU's [`CoreData`]. Panics if [`init`] has not run on
/// this CPU yet.
pub fn current() -> &'static CoreData {
	let base = unsafe { Msr::new(IA32_GS_BASE).read() };
	assert_ne!(base, 0, "percore::init was not called on this CPU");
	unsafe { &*(base as *const CoreData) }
}

pub fn core_id() -> u32 {
	current().core_id
}
