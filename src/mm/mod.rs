//! Architecture-neutral memory management facade. The real work happens in
//! [`crate::arch::x86_64::mm`]; this module owns the kernel heap and the
//! bookkeeping ([`kernel_start`]/[`kernel_end`]) that init needs before any
//! other subsystem can allocate.

mod allocator;

use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::x86_64::mm::{paging::PageTableEntryFlags, physicalmem, virtualmem, PhysAddr, VirtAddr};
use crate::config::PAGE_SIZE;
use crate::errno::Result;

static KERNEL_START: AtomicU64 = AtomicU64::new(0);
static KERNEL_END: AtomicU64 = AtomicU64::new(0);

pub fn kernel_start() -> VirtAddr {
	VirtAddr::new(KERNEL_START.load(Ordering::Relaxed))
}

pub fn kernel_end() -> VirtAddr {
	VirtAddr::new(KERNEL_END.load(Ordering::Relaxed))
}

/// Brings up the physical frame allocator from the Multiboot2-reported
/// available memory regions, then grows the kernel heap by `initial_pages`
/// pages so `alloc::vec!`/`Box` etc. work for every subsystem initialized
/// after this call returns.
pub fn init(regions: &[(u64, u64)], kernel_start_addr: u64, kernel_end_addr: u64, initial_heap_pages: usize) {
	KERNEL_START.store(kernel_start_addr, Ordering::Relaxed);
	KERNEL_END.store(kernel_end_addr, Ordering::Relaxed);

	physicalmem::init(regions, kernel_start_addr, kernel_end_addr);

	grow_heap(initial_heap_pages).expect("not enough memory to bring up the initial kernel heap");
}

/// Maps `pages` freshly allocated physical frames into a new virtual range
/// and hands the range to the global allocator. Called during [`init`] and
/// again whenever [`allocator`] reports exhaustion.
pub fn grow_heap(pages: usize) -> Result<()> {
	let va = virtualmem::alloc_range(pages);
	for i in 0..pages {
		let page_va = VirtAddr::new(va.as_u64() + (i as u64) * PAGE_SIZE as u64);
		let phys = physicalmem::alloc_page()?;
		crate::arch::x86_64::mm::paging::map(page_va, phys, PageTableEntryFlags::KERNEL_DATA)?;
	}
	unsafe { allocator::extend(va, pages * PAGE_SIZE) };
	Ok(())
}

/// Maps `pages` pages of `phys` as device memory and returns the virtual
/// base address. Thin re-export so drivers don't need to reach into
/// `arch::x86_64::mm` directly (spec's narrow-seam convention).
pub fn map_mmio(phys: PhysAddr, pages: usize) -> Result<VirtAddr> {
	virtualmem::map_mmio(phys, pages)
}

pub fn free_frames() -> usize {
	physicalmem::free_frame_count()
}

pub fn total_frames() -> usize {
	physicalmem::total_frame_count()
}
