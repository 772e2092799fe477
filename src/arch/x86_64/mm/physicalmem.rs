//! Physical frame allocator (spec §4.1, data model "Frame").
//!
//! Every RAM page gets a dense [`Page`] descriptor indexed by
//! `phys >> PAGE_SHIFT`. A frame is either on the free list, mapped at one
//! or more virtual addresses, or reserved (occupied by the kernel image or
//! a BIOS/ACPI region); `Page::list_link` self-points when the frame is not
//! on the free list, which lets [`alloc_contiguous`] recognise "still free"
//! without a separate bitmap.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use hermit_sync::InterruptTicketMutex;

use super::{virtualmem, PhysAddr};
use crate::config::{MAX_CONTIGUOUS_FRAMES, PAGE_SIZE};
use crate::errno::{Error, Result};

const PAGE_SHIFT: u32 = 12;

/// `list_link` value marking the tail of the free list: "on the free list,
/// no successor." Distinct from self-pointing, which marks "off the free
/// list" — conflating the two made a lone free frame (head and tail at
/// once) indistinguishable from a reserved one.
const END_OF_LIST: usize = usize::MAX;

/// Per-frame bookkeeping. `list_link` holds the frame number of the next
/// free frame, [`END_OF_LIST`] at the tail of the free list, or this frame's
/// own number when the frame is not free (spec's "self-pointing iff not on
/// the free list" invariant).
pub struct Page {
	refcount: AtomicU32,
	list_link: AtomicUsize,
}

impl Page {
	const fn new() -> Self {
		Self {
			refcount: AtomicU32::new(0),
			list_link: AtomicUsize::new(0),
		}
	}

	pub fn phys_addr(&self, frame_no: usize) -> PhysAddr {
		PhysAddr::new((frame_no as u64) << PAGE_SHIFT)
	}

	pub fn refcount(&self) -> u32 {
		self.refcount.load(Ordering::Acquire)
	}

	/// Takes one reference. Called by [`crate::arch::x86_64::mm::paging::map`].
	pub fn get(&self) -> u32 {
		self.refcount.fetch_add(1, Ordering::AcqRel) + 1
	}

	/// Releases one reference, returning the count after release. Called by
	/// [`crate::arch::x86_64::mm::paging::unmap`].
	pub fn put(&self) -> u32 {
		let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
		debug_assert!(prev > 0, "Page refcount underflow");
		prev - 1
	}

	fn is_on_freelist(&self, frame_no: usize) -> bool {
		self.list_link.load(Ordering::Acquire) != frame_no
	}
}

struct Allocator {
	/// Dense descriptor array, one entry per frame in managed RAM.
	pages: Vec<Page>,
	/// Physical address of frame #0 in `pages` (RAM rarely starts at 0 once
	/// the kernel image and BIOS/ACPI holes are excluded).
	base: PhysAddr,
	free_head: Option<usize>,
	free_count: usize,
	total_count: usize,
}

impl Allocator {
	fn frame_no(&self, phys: PhysAddr) -> usize {
		((phys.as_u64() - self.base.as_u64()) >> PAGE_SHIFT) as usize
	}

	fn push_free(&mut self, frame_no: usize) {
		let next = self.free_head.unwrap_or(END_OF_LIST);
		self.pages[frame_no].list_link.store(next, Ordering::Release);
		self.free_head = Some(frame_no);
		self.free_count += 1;
	}

	fn pop_free(&mut self) -> Option<usize> {
		let head = self.free_head?;
		let next = self.pages[head].list_link.load(Ordering::Acquire);
		self.free_head = if next == END_OF_LIST { None } else { Some(next) };
		self.free_count -= 1;
		// Mark removed: self-pointing.
		self.pages[head].list_link.store(head, Ordering::Release);
		Some(head)
	}

	/// Scans the free list for `n` descriptors that are simultaneously
	/// still-free and physically consecutive. O(F·n) in the freelist
	/// length `F`; acceptable because `n <= MAX_CONTIGUOUS_FRAMES` and this
	/// path is only used by device DMA bootstrap (spec §4.1).
	fn pop_contiguous(&mut self, n: usize) -> Option<usize> {
		debug_assert!(n >= 1 && n <= MAX_CONTIGUOUS_FRAMES);
		'candidates: for start in 0..self.total_count.saturating_sub(n - 1) {
			for offset in 0..n {
				if !self.pages[start + offset].is_on_freelist(start + offset) {
					continue 'candidates;
				}
			}
			// Unlink all n descriptors from wherever they sit in the list.
			self.remove_from_list(start, n);
			return Some(start);
		}
		None
	}

	fn remove_from_list(&mut self, start: usize, n: usize) {
		let in_range = |f: usize| f >= start && f < start + n;
		// Rebuild the free list skipping frames in [start, start+n).
		let mut rebuilt_head = None;
		let mut rebuilt_tail: Option<usize> = None;
		let mut cursor = self.free_head;
		let mut visited = 0;
		while let Some(f) = cursor {
			visited += 1;
			let next_raw = self.pages[f].list_link.load(Ordering::Acquire);
			let next = if next_raw == END_OF_LIST { None } else { Some(next_raw) };
			if !in_range(f) {
				if rebuilt_head.is_none() {
					rebuilt_head = Some(f);
				}
				if let Some(tail) = rebuilt_tail {
					self.pages[tail].list_link.store(f, Ordering::Release);
				}
				rebuilt_tail = Some(f);
			}
			cursor = next;
			if visited > self.total_count {
				break;
			}
		}
		if let Some(tail) = rebuilt_tail {
			self.pages[tail].list_link.store(END_OF_LIST, Ordering::Release);
		}
		self.free_head = rebuilt_head;
		self.free_count -= n;
		for offset in 0..n {
			self.pages[start + offset]
				.list_link
				.store(start + offset, Ordering::Release);
		}
	}
}

static ALLOCATOR: InterruptTicketMutex<Option<Allocator>> = InterruptTicketMutex::new(None);

/// Builds the frame arena from the free RAM regions the Multiboot2 memory
/// map reports, after excluding everything occupied by the loaded kernel
/// image. `regions` are `(start, end)` physical address pairs, already
/// filtered to `MemoryAreaType::Available` by the caller.
pub fn init(regions: &[(u64, u64)], kernel_start: u64, kernel_end: u64) {
	let base = PhysAddr::new(regions.iter().map(|(s, _)| *s).min().unwrap_or(0));
	let end = regions.iter().map(|(_, e)| *e).max().unwrap_or(0);
	let total_count = ((end - base.as_u64()) >> PAGE_SHIFT) as usize;

	let mut pages = Vec::with_capacity(total_count);
	pages.resize_with(total_count, Page::new);
	// All frames start reserved (self-pointing, refcount 0 = "neither free
	// nor mapped" which the allocator below treats as off-limits until
	// explicitly freed).
	for (i, page) in pages.iter().enumerate() {
		page.list_link.store(i, Ordering::Relaxed);
		page.refcount.store(1, Ordering::Relaxed);
	}

	let mut allocator = Allocator {
		pages,
		base,
		free_head: None,
		free_count: 0,
		total_count,
	};

	for &(start, region_end) in regions {
		let start = start.max(base.as_u64());
		let start = if start < kernel_end && kernel_start < region_end {
			kernel_end.max(start)
		} else {
			start
		};
		let start = crate::util::align_up(start as usize, PAGE_SIZE) as u64;
		let region_end = crate::util::align_down(region_end as usize, PAGE_SIZE) as u64;
		let mut frame = allocator.frame_no(PhysAddr::new(start));
		let last = allocator.frame_no(PhysAddr::new(region_end));
		while frame < last {
			allocator.pages[frame].refcount.store(0, Ordering::Relaxed);
			allocator.push_free(frame);
			frame += 1;
		}
	}

	*ALLOCATOR.lock() = Some(allocator);
}

/// Removes the head of the freelist, zeroes it through a temp-map, and
/// returns its physical address with refcount initialized to 1.
pub fn alloc_page() -> Result<PhysAddr> {
	let mut guard = ALLOCATOR.lock();
	let allocator = guard.as_mut().expect("physicalmem::init was not called");
	let frame = allocator.pop_free().ok_or(Error::NoMemory)?;
	allocator.pages[frame].refcount.store(1, Ordering::Release);
	let phys = allocator.pages[frame].phys_addr(frame);
	drop(guard);
	zero_frame(phys);
	Ok(phys)
}

/// Returns `n` (1..=[`MAX_CONTIGUOUS_FRAMES`]) physically consecutive
/// frames, zeroed, with refcount 1 each. Used only by device DMA
/// bootstrap (spec §4.1).
pub fn alloc_contiguous(n: usize) -> Result<PhysAddr> {
	if n == 0 || n > MAX_CONTIGUOUS_FRAMES {
		return Err(Error::InvalidValue);
	}
	let mut guard = ALLOCATOR.lock();
	let allocator = guard.as_mut().expect("physicalmem::init was not called");
	let start = allocator.pop_contiguous(n).ok_or(Error::NoMemory)?;
	for offset in 0..n {
		allocator.pages[start + offset]
			.refcount
			.store(1, Ordering::Release);
	}
	let phys = allocator.pages[start].phys_addr(start);
	drop(guard);
	for i in 0..n {
		zero_frame(PhysAddr::new(phys.as_u64() + (i as u64) * PAGE_SIZE as u64));
	}
	Ok(phys)
}

/// Inserts a frame at the head of the free list. The frame's refcount must
/// already be 0 (callers go through [`Page::put`] via
/// [`crate::arch::x86_64::mm::paging::unmap`]).
pub fn free_page(phys: PhysAddr) {
	let mut guard = ALLOCATOR.lock();
	let allocator = guard.as_mut().expect("physicalmem::init was not called");
	let frame = allocator.frame_no(phys);
	debug_assert_eq!(allocator.pages[frame].refcount(), 0);
	allocator.push_free(frame);
}

pub fn refcount(phys: PhysAddr) -> u32 {
	let guard = ALLOCATOR.lock();
	let allocator = guard.as_ref().expect("physicalmem::init was not called");
	allocator.pages[allocator.frame_no(phys)].refcount()
}

pub fn free_frame_count() -> usize {
	ALLOCATOR
		.lock()
		.as_ref()
		.map(|a| a.free_count)
		.unwrap_or(0)
}

pub fn total_frame_count() -> usize {
	ALLOCATOR
		.lock()
		.as_ref()
		.map(|a| a.total_count)
		.unwrap_or(0)
}

/// Returns a [`Page`] descriptor reference. `refcount`/`get`/`put` on it are
/// the "shared pointer" operations the design notes ask for (an arena index
/// plus atomic refcount, rather than a heap-allocated `Rc`).
pub(crate) fn page_at(phys: PhysAddr) -> Result<&'static Page> {
	let guard = ALLOCATOR.lock();
	let allocator = guard.as_ref().expect("physicalmem::init was not called");
	let frame = allocator.frame_no(phys);
	if frame >= allocator.total_count {
		return Err(Error::InvalidValue);
	}
	// SAFETY: `pages` is append-only for the process lifetime once `init`
	// runs, so this reference outlives the lock guard.
	Ok(unsafe { &*(&allocator.pages[frame] as *const Page) })
}

fn zero_frame(phys: PhysAddr) {
	let va = virtualmem::tmp_map(phys).expect("temp-map slots exhausted while zeroing a frame");
	unsafe {
		core::ptr::write_bytes(va.as_mut_ptr::<u8>(), 0, PAGE_SIZE);
	}
	virtualmem::tmp_unmap(va);
}

#[cfg(test)]
mod tests {
	use super::*;

	fn fresh(total: usize) -> Allocator {
		let mut pages = Vec::with_capacity(total);
		pages.resize_with(total, Page::new);
		for (i, p) in pages.iter().enumerate() {
			p.list_link.store(i, Ordering::Relaxed);
		}
		let mut a = Allocator {
			pages,
			base: PhysAddr::new(0),
			free_head: None,
			free_count: 0,
			total_count: total,
		};
		for i in 0..total {
			a.push_free(i);
		}
		a
	}

	#[test]
	fn pop_and_push_round_trips_free_count() {
		let mut a = fresh(8);
		assert_eq!(a.free_count, 8);
		let f = a.pop_free().unwrap();
		assert_eq!(a.free_count, 7);
		a.push_free(f);
		assert_eq!(a.free_count, 8);
	}

	#[test]
	fn contiguous_allocation_reduces_free_count_by_exactly_n() {
		let mut a = fresh(32);
		let before = a.free_count;
		let start = a.pop_contiguous(4).unwrap();
		assert_eq!(a.free_count, before - 4);
		for i in start..start + 4 {
			assert!(!a.pages[i].is_on_freelist(i));
		}
	}

	#[test]
	fn contiguous_allocation_over_capacity_fails() {
		let mut a = fresh(4);
		assert!(a.pop_contiguous(8).is_none());
	}

	#[test]
	fn lone_free_frame_is_reported_on_the_list() {
		let mut a = fresh(1);
		assert!(a.pages[0].is_on_freelist(0));
		let f = a.pop_free().unwrap();
		assert_eq!(f, 0);
		assert!(a.pop_free().is_none());
	}
}
