//! Virtio transport and queue engine shared by the block, SCSI and network
//! drivers (spec §4.10-§4.12).

pub mod blk;
pub mod net;
pub mod scsi;
pub mod transport;
pub mod virtqueue;

use alloc::vec::Vec;

use crate::arch::x86_64::kernel::pci;
use crate::errno::{Error, Result};

/// PCI vendor id every virtio device uses.
pub const VIRTIO_PCI_VENDOR_ID: u16 = 0x1AF4;

/// Device ids are `0x1040 + subsystem id` for modern (virtio 1.0+)
/// devices; legacy devices use `0x1000 + subsystem id` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
	Network,
	Block,
	Scsi,
}

impl DeviceKind {
	pub fn from_pci_device_id(id: u16) -> Result<Self> {
		let subsystem = if (0x1040..0x1058).contains(&id) {
			id - 0x1040
		} else if (0x1000..0x1010).contains(&id) {
			id - 0x1000
		} else {
			return Err(Error::NotFound);
		};
		match subsystem {
			1 => Ok(Self::Network),
			2 => Ok(Self::Block),
			8 => Ok(Self::Scsi),
			_ => Err(Error::NotFound),
		}
	}
}

/// Device status register bits (virtio spec §2.1).
pub mod status {
	pub const ACKNOWLEDGE: u8 = 1;
	pub const DRIVER: u8 = 2;
	pub const DRIVER_OK: u8 = 4;
	pub const FEATURES_OK: u8 = 8;
	pub const DEVICE_NEEDS_RESET: u8 = 64;
	pub const FAILED: u8 = 128;
}

/// Transport-independent feature bits every device class negotiates.
pub mod features {
	pub const VIRTIO_F_VERSION_1: u64 = 1 << 32;
	pub const VIRTIO_F_RING_EVENT_IDX: u64 = 1 << 29;
	pub const VIRTIO_BLK_F_FLUSH: u64 = 1 << 9;
	pub const VIRTIO_BLK_F_SIZE_MAX: u64 = 1 << 1;
	pub const VIRTIO_BLK_F_SEG_MAX: u64 = 1 << 2;
	pub const VIRTIO_NET_F_MAC: u64 = 1 << 5;
	pub const VIRTIO_NET_F_STATUS: u64 = 1 << 16;
}

/// Holds the result of the one-time boot-time [`discover`] call so the
/// out-of-scope filesystem/network-stack collaborators above this crate
/// can reach the devices it found, the same narrow-registry shape
/// [`crate::arch::x86_64::kernel::acpi::platform`] uses for the reverse
/// direction (platform info flowing *into* this crate instead of devices
/// flowing *out*).
static DEVICES: hermit_sync::OnceCell<hermit_sync::InterruptTicketMutex<DiscoveredDevices>> =
	hermit_sync::OnceCell::new();

/// Runs [`discover`] and publishes the result for [`devices`] to hand out.
/// Called once, from the boot processor, after the scheduler and soft-IRQ
/// worker are up.
pub fn init() {
	DEVICES
		.set(hermit_sync::InterruptTicketMutex::new(discover()))
		.unwrap_or_else(|_| panic!("drivers::virtio::init called more than once"));
}

/// The devices found by the boot-time [`init`] call, if it has run yet.
pub fn devices() -> Option<&'static hermit_sync::InterruptTicketMutex<DiscoveredDevices>> {
	DEVICES.get()
}

/// Every virtio device this core brought up during boot, grouped by class
/// (spec §2's "device discovery (PCI scan, virtio probe)" control-flow
/// step). Devices whose handshake fails are skipped — spec §7's "Device
/// handshake failure" policy is "set `FAILED`, do not register the
/// device, continue boot" — so a single broken device never blocks the
/// rest of discovery.
#[derive(Default)]
pub struct DiscoveredDevices {
	pub block: Vec<blk::BlockDevice>,
	pub net: Vec<net::NetDevice>,
	pub scsi: Vec<scsi::ScsiDevice>,
}

/// Scans every PCI function (spec §4.9's "PCI scan enumerates all
/// functions") for a virtio vendor id, classifies it by device id, and
/// brings up the matching driver. Called once, from the boot processor,
/// after the scheduler and soft-IRQ worker are available so a driver's
/// blocking requests (which poll the used ring) never starve forward
/// progress.
pub fn discover() -> DiscoveredDevices {
	let mut found = DiscoveredDevices::default();
	let mut candidates = Vec::new();
	pci::scan(|bdf, config| {
		if config.vendor_id() == VIRTIO_PCI_VENDOR_ID {
			candidates.push((bdf, config.device_id()));
		}
	});

	for (bdf, device_id) in candidates {
		let Ok(kind) = DeviceKind::from_pci_device_id(device_id) else {
			continue;
		};
		match kind {
			DeviceKind::Block => match blk::BlockDevice::init(bdf) {
				Ok(dev) => found.block.push(dev),
				Err(err) => log::trace!("virtio-blk at {bdf:?} failed handshake: {err}"),
			},
			DeviceKind::Network => match net::NetDevice::init(bdf) {
				Ok(dev) => found.net.push(dev),
				Err(err) => log::trace!("virtio-net at {bdf:?} failed handshake: {err}"),
			},
			DeviceKind::Scsi => match scsi::ScsiDevice::init(bdf) {
				Ok(dev) => found.scsi.push(dev),
				Err(err) => log::trace!("virtio-scsi at {bdf:?} failed handshake: {err}"),
			},
		}
	}

	found
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn modern_block_device_id_resolves_to_block() {
		assert_eq!(DeviceKind::from_pci_device_id(0x1042).unwrap(), DeviceKind::Block);
	}

	#[test]
	fn legacy_network_device_id_resolves_to_network() {
		assert_eq!(DeviceKind::from_pci_device_id(0x1000).unwrap(), DeviceKind::Network);
	}

	#[test]
	fn unknown_device_id_is_not_found() {
		assert!(DeviceKind::from_pci_device_id(0x9999).is_err());
	}
}
