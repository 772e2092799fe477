//! Seqlock: writers never block, readers retry if they raced a write.
//! Suited to data a single writer updates far more often than it is
//! contended (e.g. the TSC calibration/epoch pair in
//! [`crate::arch::x86_64::kernel::systemtime`]), where blocking readers on
//! a spinlock would serialize a read-mostly hot path for no reason.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

pub struct SeqLock<T: Copy> {
	sequence: AtomicUsize,
	data: UnsafeCell<T>,
}

unsafe impl<T: Copy + Send> Send for SeqLock<T> {}
unsafe impl<T: Copy + Send> Sync for SeqLock<T> {}

impl<T: Copy> SeqLock<T> {
	pub const fn new(value: T) -> Self {
		Self {
			sequence: AtomicUsize::new(0),
			data: UnsafeCell::new(value),
		}
	}

	/// Replaces the value. Only ever called by the single designated
	/// writer; concurrent writers would race each other's sequence bumps.
	pub fn write(&self, value: T) {
		self.sequence.fetch_add(1, Ordering::Release);
		unsafe {
			core::ptr::write_volatile(self.data.get(), value);
		}
		self.sequence.fetch_add(1, Ordering::Release);
	}

	/// Reads the value, retrying until it observes an even sequence number
	/// both before and after the read (an odd number means a write was in
	/// progress).
	pub fn read(&self) -> T {
		loop {
			let before = self.sequence.load(Ordering::Acquire);
			if before & 1 != 0 {
				core::hint::spin_loop();
				continue;
			}
			let value = unsafe { core::ptr::read_volatile(self.data.get()) };
			let after = self.sequence.load(Ordering::Acquire);
			if before == after {
				return value;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn read_after_write_observes_the_new_value() {
		let lock = SeqLock::new(1u32);
		lock.write(42);
		assert_eq!(lock.read(), 42);
	}
}
