//! Virtqueue engine (spec §4.12). Only the split-ring layout is
//! implemented; packed rings are a virtio 1.1 feature this core does not
//! negotiate.

pub mod split;

pub use split::VirtQueue;
