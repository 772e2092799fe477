//! Global heap allocator. Wraps `talc`'s bump/free-list allocator behind an
//! [`hermit_sync::InterruptTicketMutex`], mirroring the teacher's
//! `LockedAllocator(InterruptTicketMutex<Allocator>)` split between "do the
//! allocation" and "be safe to call from an interrupt handler".
//!
//! `talc` never grows its own arena; when it reports [`talc::ErrOnOom`] we
//! ask [`super::grow_heap`] for more pages and retry exactly once. A second
//! failure means physical memory is genuinely exhausted.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;

use hermit_sync::InterruptTicketMutex;
use talc::{ErrOnOom, Span, Talc};

use crate::arch::x86_64::mm::VirtAddr;

struct LockedAllocator(InterruptTicketMutex<Talc<ErrOnOom>>);

#[global_allocator]
static ALLOCATOR: LockedAllocator = LockedAllocator(InterruptTicketMutex::new(Talc::new(ErrOnOom)));

/// Registers `pages` bytes starting at `va` as additional heap backing
/// store. Called once during [`super::init`] and again from
/// [`super::grow_heap`] whenever the allocator runs dry.
///
/// # Safety
///
/// `[va, va + len)` must already be mapped, writable kernel memory not
/// claimed by any other allocator or in-flight allocation.
pub(crate) unsafe fn extend(va: VirtAddr, len: usize) {
	let span = Span::from_base_size(va.as_mut_ptr::<u8>(), len);
	let mut talc = ALLOCATOR.0.lock();
	unsafe {
		talc.claim(span).expect("talc rejected a freshly mapped heap extension");
	}
}

unsafe impl GlobalAlloc for LockedAllocator {
	unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
		let mut talc = self.0.lock();
		match unsafe { talc.malloc(layout) } {
			Ok(ptr) => ptr.as_ptr(),
			Err(_) => {
				drop(talc);
				if grow_and_retry(layout.size()).is_err() {
					return core::ptr::null_mut();
				}
				let mut talc = self.0.lock();
				unsafe { talc.malloc(layout) }
					.map(NonNull::as_ptr)
					.unwrap_or(core::ptr::null_mut())
			}
		}
	}

	unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
		let mut talc = self.0.lock();
		unsafe {
			talc.free(NonNull::new_unchecked(ptr), layout);
		}
	}
}

/// Heap pages requested per growth step. Oversized requests round up to a
/// whole number of steps.
const GROWTH_PAGES: usize = 64;

fn grow_and_retry(requested_bytes: usize) -> crate::errno::Result<()> {
	let pages = requested_bytes.div_ceil(crate::config::PAGE_SIZE).max(GROWTH_PAGES);
	super::grow_heap(pages)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn growth_step_covers_at_least_one_page() {
		assert!(GROWTH_PAGES >= 1);
	}
}
