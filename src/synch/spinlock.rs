//! Ticket lock: fair, FIFO ordering under contention, unlike a naive
//! compare-and-swap spinlock where an unlucky CPU can starve. Two tickets
//! -- `next` handed out to arriving waiters, `owner` announcing whose turn
//! it is -- are all the state a lock needs.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};

#[cfg(not(test))]
use crate::arch::x86_64::kernel::percore;

/// Bumps this CPU's preempt-disable count so [`crate::scheduler::tick`]
/// leaves the current task running until every held [`Spinlock`] is
/// dropped (spec §5: "a task is never suspended while holding a
/// spinlock"). Interrupts stay enabled, unlike [`SpinlockIrqSave`] — a
/// plain `Spinlock` only needs to survive a missed reschedule, not an
/// interrupt handler re-entering the same lock.
///
/// Under `#[cfg(test)]` this is a no-op: the unit tests below run on the
/// host, with no `percore::init` and no `GS_BASE` to read.
#[cfg(not(test))]
#[inline]
fn preempt_disable() {
	percore::current().preempt_disable_count.fetch_add(1, Ordering::AcqRel);
}

#[cfg(not(test))]
#[inline]
fn preempt_enable() {
	percore::current().preempt_disable_count.fetch_sub(1, Ordering::AcqRel);
}

#[cfg(test)]
#[inline]
fn preempt_disable() {}

#[cfg(test)]
#[inline]
fn preempt_enable() {}

pub struct Spinlock<T> {
	next_ticket: AtomicUsize,
	now_serving: AtomicUsize,
	data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Spinlock<T> {}
unsafe impl<T: Send> Sync for Spinlock<T> {}

pub struct SpinlockGuard<'a, T> {
	lock: &'a Spinlock<T>,
}

impl<T> Spinlock<T> {
	pub const fn new(value: T) -> Self {
		Self {
			next_ticket: AtomicUsize::new(0),
			now_serving: AtomicUsize::new(0),
			data: UnsafeCell::new(value),
		}
	}

	pub fn lock(&self) -> SpinlockGuard<'_, T> {
		preempt_disable();
		let my_ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
		while self.now_serving.load(Ordering::Acquire) != my_ticket {
			core::hint::spin_loop();
		}
		SpinlockGuard { lock: self }
	}

	pub fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
		preempt_disable();
		let ticket = self.now_serving.load(Ordering::Acquire);
		let guard = self
			.next_ticket
			.compare_exchange(ticket, ticket + 1, Ordering::Acquire, Ordering::Relaxed)
			.ok()
			.map(|_| SpinlockGuard { lock: self });
		if guard.is_none() {
			preempt_enable();
		}
		guard
	}

	/// # Safety
	/// Only valid when the caller holds exclusive access by some other
	/// means (e.g. single-threaded boot code before SMP starts).
	pub unsafe fn force_unlock(&self) {
		self.now_serving.fetch_add(1, Ordering::Release);
	}
}

impl<T> Deref for SpinlockGuard<'_, T> {
	type Target = T;
	fn deref(&self) -> &T {
		unsafe { &*self.lock.data.get() }
	}
}

impl<T> DerefMut for SpinlockGuard<'_, T> {
	fn deref_mut(&mut self) -> &mut T {
		unsafe { &mut *self.lock.data.get() }
	}
}

impl<T> Drop for SpinlockGuard<'_, T> {
	fn drop(&mut self) {
		self.lock.now_serving.fetch_add(1, Ordering::Release);
		preempt_enable();
	}
}

/// Spinlock variant that also suppresses local interrupts for the
/// duration of the critical section, so code that can also run from an
/// interrupt handler cannot deadlock against itself.
pub struct SpinlockIrqSave<T>(Spinlock<T>);

pub struct SpinlockIrqSaveGuard<'a, T> {
	inner: SpinlockGuard<'a, T>,
	was_enabled: bool,
}

impl<T> SpinlockIrqSave<T> {
	pub const fn new(value: T) -> Self {
		Self(Spinlock::new(value))
	}

	pub fn lock(&self) -> SpinlockIrqSaveGuard<'_, T> {
		let was_enabled = crate::arch::x86_64::kernel::irq::nested_disable();
		SpinlockIrqSaveGuard {
			inner: self.0.lock(),
			was_enabled,
		}
	}
}

impl<T> Deref for SpinlockIrqSaveGuard<'_, T> {
	type Target = T;
	fn deref(&self) -> &T {
		&self.inner
	}
}

impl<T> DerefMut for SpinlockIrqSaveGuard<'_, T> {
	fn deref_mut(&mut self) -> &mut T {
		&mut self.inner
	}
}

impl<T> Drop for SpinlockIrqSaveGuard<'_, T> {
	fn drop(&mut self) {
		crate::arch::x86_64::kernel::irq::nested_enable(self.was_enabled);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn lock_serializes_mutation_in_ticket_order() {
		let lock = Spinlock::new(0u32);
		{
			let mut guard = lock.lock();
			*guard += 1;
		}
		assert_eq!(*lock.lock(), 1);
	}

	#[test]
	fn try_lock_fails_while_held() {
		let lock = Spinlock::new(());
		let _guard = lock.lock();
		assert!(lock.try_lock().is_none());
	}
}
