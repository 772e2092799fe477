//! virtio-blk driver (spec §4.10). Exposes a single multi-sector
//! read/write API (spec §9's Open Question: the multi-sector contract is
//! the sole block interface this core offers — no separate
//! single-sector convenience wrapper) and leaves partitioning/filesystems
//! to layers above this crate.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::arch::x86_64::kernel::pci::Bdf;
use crate::errno::{Error, Result};

use super::transport::pci::PciTransport;
use super::transport::{negotiate, VirtioTransport};
use super::virtqueue::VirtQueue;
use super::{features, DeviceKind};

pub const SECTOR_SIZE: usize = 512;

const VIRTIO_BLK_T_IN: u32 = 0;
const VIRTIO_BLK_T_OUT: u32 = 1;
const VIRTIO_BLK_T_FLUSH: u32 = 4;

const STATUS_OK: u8 = 0;

#[repr(C)]
struct RequestHeader {
	req_type: u32,
	reserved: u32,
	sector: u64,
}

/// One virtio-blk device. Owns a single request queue (`queue 0`); the
/// multi-queue block feature is a Non-goal.
pub struct BlockDevice {
	transport: PciTransport,
	queue: VirtQueue,
	capacity_sectors: u64,
	supports_flush: bool,
}

impl BlockDevice {
	/// Probes, resets, negotiates features with, and sets up the request
	/// queue for the virtio-blk device at `bdf`.
	pub fn init(bdf: Bdf) -> Result<Self> {
		let mut transport = super::transport::pci::init_device(bdf)?;

		let wanted = features::VIRTIO_F_VERSION_1 | features::VIRTIO_BLK_F_FLUSH | features::VIRTIO_BLK_F_SIZE_MAX;
		let negotiated = negotiate(&mut transport, wanted)?;

		transport.select_queue(0);
		let size = transport.queue_size();
		let queue = if transport.is_legacy() {
			VirtQueue::new_legacy(0, size)?
		} else {
			VirtQueue::new(0, size)?
		};
		queue.attach(&mut transport);

		let capacity_sectors = transport.read_config_u64(0);

		Ok(Self {
			transport,
			queue,
			capacity_sectors,
			supports_flush: negotiated & features::VIRTIO_BLK_F_FLUSH != 0,
		})
	}

	pub fn capacity_sectors(&self) -> u64 {
		self.capacity_sectors
	}

	/// Reads `sectors.len() * SECTOR_SIZE` bytes starting at `lba` into
	/// `sectors`. Blocking: polls the used ring until the device completes
	/// the request (the soft-IRQ-driven async path is layered on top of
	/// this by the block subsystem above this crate).
	pub fn read(&mut self, lba: u64, sectors: &mut [u8]) -> Result<()> {
		self.request(VIRTIO_BLK_T_IN, lba, sectors, true)
	}

	pub fn write(&mut self, lba: u64, sectors: &[u8]) -> Result<()> {
		// SAFETY: the device only reads this buffer; the mutable slice
		// requirement of `request` is an artifact of sharing one code path
		// for both directions, not evidence of a write into caller memory.
		let sectors = unsafe { core::slice::from_raw_parts_mut(sectors.as_ptr() as *mut u8, sectors.len()) };
		self.request(VIRTIO_BLK_T_OUT, lba, sectors, false)
	}

	pub fn flush(&mut self) -> Result<()> {
		if !self.supports_flush {
			return Ok(());
		}
		let mut empty = [];
		self.request(VIRTIO_BLK_T_FLUSH, 0, &mut empty, false)
	}

	fn request(&mut self, req_type: u32, lba: u64, buf: &mut [u8], device_writes: bool) -> Result<()> {
		if buf.len() % SECTOR_SIZE != 0 && req_type != VIRTIO_BLK_T_FLUSH {
			return Err(Error::InvalidValue);
		}

		let header = Box::new(RequestHeader {
			req_type,
			reserved: 0,
			sector: lba,
		});
		let header_phys = self.virt_to_phys(header.as_ref() as *const _ as u64);
		let status = Box::new(0xFFu8);
		let status_phys = self.virt_to_phys(status.as_ref() as *const _ as u64);

		let mut chain = Vec::with_capacity(3);
		chain.push((header_phys, core::mem::size_of::<RequestHeader>() as u32, false));
		if !buf.is_empty() {
			let buf_phys = self.virt_to_phys(buf.as_ptr() as u64);
			chain.push((buf_phys, buf.len() as u32, device_writes));
		}
		chain.push((status_phys, 1, true));

		let head = self.queue.push(&chain)?;
		self.transport.notify_queue(0);

		loop {
			if let Some((completed_head, _len)) = self.queue.pop() {
				if completed_head == head {
					break;
				}
			}
			core::hint::spin_loop();
		}

		if *status != STATUS_OK {
			return Err(Error::Io);
		}
		Ok(())
	}

	fn virt_to_phys(&self, va: u64) -> u64 {
		crate::arch::x86_64::mm::paging::virt_to_phys(crate::arch::x86_64::mm::VirtAddr::new(va))
			.expect("request buffer is not mapped")
			.as_u64()
	}
}

pub fn device_kind() -> DeviceKind {
	DeviceKind::Block
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn sector_size_matches_virtio_blk_convention() {
		assert_eq!(SECTOR_SIZE, 512);
	}
}
