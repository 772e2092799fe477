//! virtio-net driver (spec §4.10). Exposes raw frame send/receive on the
//! first receive/transmit queue pair; multi-queue, checksum offload and TSO
//! are Non-goals, matching this crate's "transport and queue engine" scope
//! rather than a full network stack.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::arch::x86_64::kernel::pci::Bdf;
use crate::errno::{Error, Result};

use super::transport::{negotiate, VirtioTransport};
use super::virtqueue::VirtQueue;
use super::{features, DeviceKind};

/// `virtio_net_hdr` without the optional mergeable-buffer `num_buffers`
/// field (that feature is not negotiated).
#[repr(C)]
#[derive(Clone, Copy)]
struct NetHeader {
	flags: u8,
	gso_type: u8,
	hdr_len: u16,
	gso_size: u16,
	csum_start: u16,
	csum_offset: u16,
}

const NET_HEADER_LEN: usize = core::mem::size_of::<NetHeader>();
const MAX_FRAME_LEN: usize = 1514;
const RX_QUEUE: u16 = 0;
const TX_QUEUE: u16 = 1;
const RX_RING_DEPTH: usize = 32;

pub struct NetDevice {
	transport: super::transport::pci::PciTransport,
	rx: VirtQueue,
	tx: VirtQueue,
	rx_buffers: Vec<Box<[u8]>>,
	mac: [u8; 6],
}

impl NetDevice {
	pub fn init(bdf: Bdf) -> Result<Self> {
		let mut transport = super::transport::pci::init_device(bdf)?;
		let wanted = features::VIRTIO_F_VERSION_1 | features::VIRTIO_NET_F_MAC | features::VIRTIO_NET_F_STATUS;
		let negotiated = negotiate(&mut transport, wanted)?;

		let legacy = transport.is_legacy();

		transport.select_queue(RX_QUEUE);
		let rx_size = transport.queue_size();
		let rx = if legacy {
			VirtQueue::new_legacy(RX_QUEUE, rx_size)?
		} else {
			VirtQueue::new(RX_QUEUE, rx_size)?
		};
		rx.attach(&mut transport);

		transport.select_queue(TX_QUEUE);
		let tx_size = transport.queue_size();
		let tx = if legacy {
			VirtQueue::new_legacy(TX_QUEUE, tx_size)?
		} else {
			VirtQueue::new(TX_QUEUE, tx_size)?
		};
		tx.attach(&mut transport);

		let mut mac = [0u8; 6];
		if negotiated & features::VIRTIO_NET_F_MAC != 0 {
			for (i, byte) in mac.iter_mut().enumerate() {
				*byte = transport.read_config_u8(i as u16);
			}
		}

		let mut device = Self {
			transport,
			rx,
			tx,
			rx_buffers: Vec::new(),
			mac,
		};
		device.fill_rx_ring();
		Ok(device)
	}

	pub fn mac_address(&self) -> [u8; 6] {
		self.mac
	}

	fn fill_rx_ring(&mut self) {
		for _ in 0..RX_RING_DEPTH.min(self.rx.size() as usize) {
			let mut buf = alloc::vec![0u8; NET_HEADER_LEN + MAX_FRAME_LEN].into_boxed_slice();
			let phys = self.virt_to_phys(buf.as_mut_ptr() as u64);
			if self.rx.push(&[(phys, buf.len() as u32, true)]).is_err() {
				break;
			}
			self.rx_buffers.push(buf);
		}
		self.transport.notify_queue(RX_QUEUE);
	}

	/// Sends one ethernet frame. `frame` must not exceed
	/// [`MAX_FRAME_LEN`].
	pub fn send(&mut self, frame: &[u8]) -> Result<()> {
		if frame.len() > MAX_FRAME_LEN {
			return Err(Error::BufTooBig);
		}
		let header = NetHeader {
			flags: 0,
			gso_type: 0,
			hdr_len: 0,
			gso_size: 0,
			csum_start: 0,
			csum_offset: 0,
		};
		let mut packet = alloc::vec![0u8; NET_HEADER_LEN + frame.len()];
		unsafe {
			core::ptr::write(packet.as_mut_ptr() as *mut NetHeader, header);
		}
		packet[NET_HEADER_LEN..].copy_from_slice(frame);

		let phys = self.virt_to_phys(packet.as_ptr() as u64);
		let head = self.tx.push(&[(phys, packet.len() as u32, false)])?;
		self.transport.notify_queue(TX_QUEUE);

		loop {
			if let Some((completed, _)) = self.tx.pop() {
				if completed == head {
					break;
				}
			}
			core::hint::spin_loop();
		}
		drop(packet);
		Ok(())
	}

	/// Polls the receive queue once, returning the next completed frame's
	/// payload (header stripped) if one is ready, and re-arms that
	/// descriptor's buffer back onto the ring.
	pub fn try_receive(&mut self) -> Option<Vec<u8>> {
		let (head, len) = self.rx.pop()?;
		let buf = self.rx_buffers.get(head as usize)?;
		let payload_len = (len as usize).saturating_sub(NET_HEADER_LEN);
		let payload = buf[NET_HEADER_LEN..NET_HEADER_LEN + payload_len].to_vec();

		let phys = self.virt_to_phys(buf.as_ptr() as u64);
		let cap = buf.len() as u32;
		let _ = self.rx.push(&[(phys, cap, true)]);
		self.transport.notify_queue(RX_QUEUE);

		Some(payload)
	}

	fn virt_to_phys(&self, va: u64) -> u64 {
		crate::arch::x86_64::mm::paging::virt_to_phys(crate::arch::x86_64::mm::VirtAddr::new(va))
			.expect("network buffer is not mapped")
			.as_u64()
	}
}

pub fn device_kind() -> DeviceKind {
	DeviceKind::Network
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn net_header_matches_the_non_mergeable_virtio_net_layout() {
		assert_eq!(NET_HEADER_LEN, 10);
	}
}
