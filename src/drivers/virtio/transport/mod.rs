//! Virtio transports. Both modern (1.0+) and legacy (0.9.5) virtio-PCI are
//! implemented (spec §4.9); virtio-MMIO is a Non-goal (spec §4.11) since
//! this core only targets PCI-attached devices.

pub mod pci;

use crate::errno::Result;

/// What a device-class driver needs from its transport, independent of
/// whether the underlying device generation is modern or legacy: common
/// config access, a notification path per virtqueue, and interrupt status.
/// [`pci::PciTransport`] is the only implementor and dispatches to whichever
/// generation `pci::init_device` found, so [`super::blk`]/[`super::scsi`]/
/// [`super::net`] never match on transport kind themselves.
pub trait VirtioTransport {
	fn read_device_feature_bits(&self) -> u64;
	fn write_driver_feature_bits(&mut self, bits: u64);
	fn set_status(&mut self, status: u8);
	fn status(&self) -> u8;
	fn queue_count(&self) -> u16;
	fn select_queue(&mut self, index: u16);
	fn queue_size(&self) -> u16;
	fn set_queue_size(&mut self, size: u16);
	fn set_queue_addresses(&mut self, desc: u64, avail: u64, used: u64);
	fn enable_queue(&mut self);
	fn notify_queue(&mut self, index: u16);
	fn read_isr(&mut self) -> u8;
	fn read_config_u8(&self, offset: u16) -> u8;
	fn read_config_u16(&self, offset: u16) -> u16;
	fn read_config_u32(&self, offset: u16) -> u32;
	fn read_config_u64(&self, offset: u16) -> u64;
}

/// Runs the common status-register handshake (spec §4.11): ACKNOWLEDGE,
/// DRIVER, feature negotiation against `wanted`, FEATURES_OK, then
/// DRIVER_OK. Returns the feature subset both driver and device agreed on.
pub fn negotiate(transport: &mut dyn VirtioTransport, wanted: u64) -> Result<u64> {
	use super::status;

	transport.set_status(0);
	transport.set_status(status::ACKNOWLEDGE);
	transport.set_status(status::ACKNOWLEDGE | status::DRIVER);

	let device_features = transport.read_device_feature_bits();
	let negotiated = device_features & wanted;
	transport.write_driver_feature_bits(negotiated);

	transport.set_status(status::ACKNOWLEDGE | status::DRIVER | status::FEATURES_OK);
	if transport.status() & status::FEATURES_OK == 0 {
		transport.set_status(status::FAILED);
		return Err(crate::errno::Error::FeatureNegotiation);
	}

	transport.set_status(status::ACKNOWLEDGE | status::DRIVER | status::FEATURES_OK | status::DRIVER_OK);
	Ok(negotiated)
}
