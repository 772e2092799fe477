//! virtio-scsi driver (spec §4.10). Only command passthrough on the
//! control queue is implemented; multi-queue request distribution and the
//! event queue are Non-goals.
//!
//! virtio-scsi's `cdb_size`/`sense_size` device-config fields are optional
//! (virtio spec §5.6.4): a device that does not report them gets the
//! fallback of `19` (legacy CDB length) / `12` (legacy sense length) plus
//! whatever the negotiated feature bits call for, per the decision in
//! this crate's design notes.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::arch::x86_64::kernel::pci::Bdf;
use crate::errno::{Error, Result};

use super::transport::{negotiate, VirtioTransport};
use super::virtqueue::VirtQueue;
use super::{features, DeviceKind};

const DEFAULT_CDB_SIZE: usize = 32;
const DEFAULT_SENSE_SIZE: usize = 96;
const FALLBACK_CDB_SIZE: usize = 19;
const FALLBACK_SENSE_SIZE: usize = 12;

#[repr(C)]
struct ReqHeader {
	lun: [u8; 8],
	id: u64,
	task_attr: u8,
	prio: u8,
	crn: u8,
}

#[repr(C)]
struct RespHeader {
	sense_len: u32,
	residual: u32,
	status_qualifier: u16,
	status: u8,
	response: u8,
}

const SCSI_S_OK: u8 = 0;

pub struct ScsiDevice {
	transport: super::transport::pci::PciTransport,
	control_queue: VirtQueue,
	cdb_size: usize,
	sense_size: usize,
	next_id: u64,
}

impl ScsiDevice {
	pub fn init(bdf: Bdf) -> Result<Self> {
		let mut transport = super::transport::pci::init_device(bdf)?;
		let wanted = features::VIRTIO_F_VERSION_1;
		negotiate(&mut transport, wanted)?;

		transport.select_queue(0);
		let size = transport.queue_size();
		let control_queue = if transport.is_legacy() {
			VirtQueue::new_legacy(0, size)?
		} else {
			VirtQueue::new(0, size)?
		};
		control_queue.attach(&mut transport);

		// Offsets per the virtio-scsi config layout (virtio spec §5.6.4):
		// num_queues(4) seg_max(4) max_sectors(4) cmd_per_lun(4)
		// event_info_size(4) sense_size(4) cdb_size(4) ...
		let sense_size = transport.read_config_u32(20);
		let cdb_size = transport.read_config_u32(24);

		Ok(Self {
			transport,
			control_queue,
			cdb_size: if cdb_size == 0 { FALLBACK_CDB_SIZE } else { cdb_size as usize },
			sense_size: if sense_size == 0 {
				FALLBACK_SENSE_SIZE
			} else {
				sense_size as usize
			},
			next_id: 0,
		})
	}

	/// Issues `cdb` against `lun`, reading/writing through `data` according
	/// to `data_in` (device writes into `data` when `true`, reads from it
	/// otherwise). Returns the SCSI status byte's sense data on a non-good
	/// status.
	pub fn execute(&mut self, lun: [u8; 8], cdb: &[u8], data: &mut [u8], data_in: bool) -> Result<()> {
		if cdb.len() > self.cdb_size.max(DEFAULT_CDB_SIZE) {
			return Err(Error::BufTooBig);
		}

		let id = self.next_id;
		self.next_id += 1;

		let mut cdb_buf = alloc::vec![0u8; self.cdb_size.max(DEFAULT_CDB_SIZE)];
		cdb_buf[..cdb.len()].copy_from_slice(cdb);

		let header = Box::new(ReqHeader {
			lun,
			id,
			task_attr: 0,
			prio: 0,
			crn: 0,
		});

		let resp = Box::new(RespHeader {
			sense_len: 0,
			residual: 0,
			status_qualifier: 0,
			status: 0xFF,
			response: 0xFF,
		});
		let mut sense_buf = alloc::vec![0u8; self.sense_size.max(DEFAULT_SENSE_SIZE)];

		let header_phys = self.virt_to_phys(header.as_ref() as *const _ as u64);
		let cdb_phys = self.virt_to_phys(cdb_buf.as_ptr() as u64);
		let resp_phys = self.virt_to_phys(resp.as_ref() as *const _ as u64);
		let sense_phys = self.virt_to_phys(sense_buf.as_ptr() as u64);

		let mut chain = Vec::with_capacity(5);
		chain.push((header_phys, core::mem::size_of::<ReqHeader>() as u32, false));
		chain.push((cdb_phys, cdb_buf.len() as u32, false));
		if !data.is_empty() && !data_in {
			let data_phys = self.virt_to_phys(data.as_ptr() as u64);
			chain.push((data_phys, data.len() as u32, false));
		}
		chain.push((resp_phys, core::mem::size_of::<RespHeader>() as u32, true));
		chain.push((sense_phys, sense_buf.len() as u32, true));
		if !data.is_empty() && data_in {
			let data_phys = self.virt_to_phys(data.as_mut_ptr() as u64);
			chain.push((data_phys, data.len() as u32, true));
		}

		let head = self.control_queue.push(&chain)?;
		self.transport.notify_queue(0);

		loop {
			if let Some((completed, _len)) = self.control_queue.pop() {
				if completed == head {
					break;
				}
			}
			core::hint::spin_loop();
		}

		if resp.status != SCSI_S_OK {
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
	DeviceKind::Scsi
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fallback_sizes_match_the_legacy_scsi_constants() {
		assert_eq!(FALLBACK_CDB_SIZE, 19);
		assert_eq!(FALLBACK_SENSE_SIZE, 12);
	}
}
