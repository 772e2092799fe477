//! Soft-IRQ deferred work (spec §4's "C9"). Device interrupt handlers run
//! with interrupts disabled and must stay short; anything that can wait
//! (completing a virtqueue's used-ring entries, draining a receive queue)
//! sets a pending bit here instead and lets the soft-IRQ worker task pick
//! it up with interrupts back on.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::scheduler::task::Priority;

pub type SoftIrqId = u8;

const MAX_SOFTIRQS: usize = 64;

static PENDING: AtomicU64 = AtomicU64::new(0);

/// Table of registered soft-IRQ callbacks, mutated once per device at init
/// time.
static REGISTRY: hermit_sync::InterruptTicketMutex<[Option<fn()>; MAX_SOFTIRQS]> =
	hermit_sync::InterruptTicketMutex::new([None; MAX_SOFTIRQS]);

/// Registers `handler` under `id`. Called once per device during driver
/// init; re-registering the same id replaces the previous handler.
pub fn register(id: SoftIrqId, handler: fn()) {
	REGISTRY.lock()[id as usize] = Some(handler);
}

/// Marks `id` pending. Safe to call from an interrupt handler; does not
/// itself run the handler.
#[inline]
pub fn raise(id: SoftIrqId) {
	PENDING.fetch_or(1 << id, Ordering::Release);
}

/// Runs every pending handler once, clearing each bit just before its
/// handler runs (so a handler that re-raises its own bit is not lost).
fn run_pending() {
	let pending = PENDING.swap(0, Ordering::AcqRel);
	if pending == 0 {
		return;
	}
	let registry = REGISTRY.lock();
	for id in 0..MAX_SOFTIRQS {
		if pending & (1 << id) != 0 {
			if let Some(handler) = registry[id] {
				handler();
			}
		}
	}
}

fn worker_entry(_arg: usize) {
	loop {
		run_pending();
		crate::scheduler::yield_now();
	}
}

/// Spawns the soft-IRQ worker task on the calling CPU. Run once per CPU
/// during bring-up, after [`crate::scheduler::per_core`] is usable.
pub fn spawn_worker() {
	crate::scheduler::spawn(worker_entry, 0, Priority::High);
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn raise_sets_exactly_one_bit() {
		PENDING.store(0, Ordering::SeqCst);
		raise(3);
		assert_eq!(PENDING.load(Ordering::SeqCst), 1 << 3);
	}
}
