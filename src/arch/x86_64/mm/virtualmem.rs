//! Kernel virtual address space allocator and the temp-map slot ring
//! (spec §4.2 "Temp-map window", §4.1's zero-on-alloc dependency on it).
//!
//! Two disjoint ranges live above [`super::KERNEL_VIRT_BASE`]: a bump-style
//! range handed out to [`alloc_range`] callers (MMIO BARs, virtqueue rings,
//! heap expansion), and a fixed-size ring of [`crate::config::TEMP_MAP_SLOTS`]
//! single-page windows used to briefly map one physical frame at a time
//! (e.g. to zero it) without growing the bump range.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use hermit_sync::InterruptTicketMutex;

use super::paging::PageTableEntryFlags;
use super::{paging, tlb, PhysAddr, VirtAddr, KERNEL_VIRT_BASE};
use crate::config::{PAGE_SIZE, TEMP_MAP_SLOTS};
use crate::errno::{Error, Result};

/// Start of the bump-allocated MMIO/heap-expansion range.
const RANGE_BASE: u64 = KERNEL_VIRT_BASE + (64 << 30);
/// Start of the temp-map slot ring, placed well past any plausible
/// `RANGE_BASE` growth.
const TEMP_MAP_BASE: u64 = KERNEL_VIRT_BASE + (128 << 30);

static RANGE_NEXT: AtomicU64 = AtomicU64::new(RANGE_BASE);

struct TempSlot {
	occupied: bool,
}

static TEMP_SLOTS: InterruptTicketMutex<[bool; TEMP_MAP_SLOTS]> =
	InterruptTicketMutex::new([false; TEMP_MAP_SLOTS]);
static TEMP_CURSOR: AtomicUsize = AtomicUsize::new(0);

fn temp_slot_addr(index: usize) -> VirtAddr {
	VirtAddr::new(TEMP_MAP_BASE + (index as u64) * PAGE_SIZE as u64)
}

/// Reserves `pages` contiguous, unmapped virtual pages from the bump range.
/// The range never shrinks; callers that need the space back should instead
/// `unmap` individual pages within it and leave the range reserved, which is
/// what long-lived MMIO BARs and virtqueue rings do in practice.
pub fn alloc_range(pages: usize) -> VirtAddr {
	let size = (pages as u64) * PAGE_SIZE as u64;
	let base = RANGE_NEXT.fetch_add(size, Ordering::SeqCst);
	VirtAddr::new(base)
}

/// Maps `phys` (rounded down to a page boundary by the caller) into a fresh
/// virtual range with [`PageTableEntryFlags::MMIO`] and returns the window's
/// virtual address.
pub fn map_mmio(phys: PhysAddr, pages: usize) -> Result<VirtAddr> {
	let base = alloc_range(pages);
	for i in 0..pages {
		let va = VirtAddr::new(base.as_u64() + (i as u64) * PAGE_SIZE as u64);
		let pa = PhysAddr::new(phys.as_u64() + (i as u64) * PAGE_SIZE as u64);
		paging::map_mmio_page(va, pa)?;
	}
	Ok(base)
}

/// Binds the next free temp-map slot to `phys` and returns its virtual
/// address. Slots are found by a circular scan starting after the last
/// allocated slot, matching the ring-buffer behaviour the name implies.
pub fn tmp_map(phys: PhysAddr) -> Result<VirtAddr> {
	let mut slots = TEMP_SLOTS.lock();
	let start = TEMP_CURSOR.load(Ordering::Relaxed);
	for offset in 0..TEMP_MAP_SLOTS {
		let index = (start + offset) % TEMP_MAP_SLOTS;
		if !slots[index] {
			slots[index] = true;
			TEMP_CURSOR.store((index + 1) % TEMP_MAP_SLOTS, Ordering::Relaxed);
			let va = temp_slot_addr(index);
			drop(slots);
			match paging::map_mmio_page(va, phys) {
				Ok(()) => return Ok(va),
				Err(Error::AlreadyExists) => {
					// Stale mapping from a previous tenant that skipped
					// tmp_unmap; tear it down and retry once.
					let _ = paging::unmap(va);
					paging::map_mmio_page(va, phys)?;
					return Ok(va);
				}
				Err(e) => return Err(e),
			}
		}
	}
	Err(Error::NoMemory)
}

/// Releases a temp-map slot obtained from [`tmp_map`].
pub fn tmp_unmap(va: VirtAddr) {
	debug_assert!(va.as_u64() >= TEMP_MAP_BASE);
	let index = ((va.as_u64() - TEMP_MAP_BASE) / PAGE_SIZE as u64) as usize;
	let _ = paging::unmap(va);
	TEMP_SLOTS.lock()[index] = false;
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn alloc_range_hands_out_disjoint_non_overlapping_windows() {
		let a = alloc_range(4);
		let b = alloc_range(2);
		assert!(b.as_u64() >= a.as_u64() + 4 * PAGE_SIZE as u64);
	}

	#[test]
	fn temp_slot_addr_stays_within_the_slot_ring() {
		let first = temp_slot_addr(0);
		let last = temp_slot_addr(TEMP_MAP_SLOTS - 1);
		assert_eq!(
			last.as_u64() - first.as_u64(),
			((TEMP_MAP_SLOTS - 1) * PAGE_SIZE) as u64
		);
	}
}
