//! Small cross-cutting collection helpers.

use core::sync::atomic::Ordering;

use crate::arch::x86_64::kernel::{irq, percore};

/// RAII guard that disables interrupts on construction and restores whatever
/// the previous state was on drop. Nests correctly: an inner guard dropped
/// first leaves interrupts exactly as the outer guard found them.
///
/// Also bumps [`percore::CoreData::preempt_disable_count`] for its lifetime
/// (spec §5's "scope-guard counters"), so [`crate::scheduler::tick`] skips
/// rescheduling even if it fires after interrupts have already been
/// restored by a nested guard's drop but before the outermost one runs.
pub struct AvoidInterrupts(bool);

impl AvoidInterrupts {
	#[inline]
	pub fn new() -> Self {
		percore::current().preempt_disable_count.fetch_add(1, Ordering::AcqRel);
		Self(irq::nested_disable())
	}
}

impl Default for AvoidInterrupts {
	fn default() -> Self {
		Self::new()
	}
}

impl Drop for AvoidInterrupts {
	#[inline]
	fn drop(&mut self) {
		irq::nested_enable(self.0);
		percore::current().preempt_disable_count.fetch_sub(1, Ordering::AcqRel);
	}
}
