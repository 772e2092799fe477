//! Device drivers built on the virtio transport/queue engine (spec §4's
//! "C11"/"C12"). Block, SCSI and network devices share everything below
//! [`virtio::blk`]/[`virtio::scsi`]/[`virtio::net`]: PCI capability
//! discovery, feature negotiation, and the split-ring virtqueue.

pub mod virtio;
