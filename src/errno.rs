//! Error taxonomy (spec §7). Every fallible public operation in this crate
//! returns one of these variants; invariant violations (`Bug`) never travel
//! through `Result` and instead go through [`crate::macros::bug_on`], which
//! panics.

use thiserror::Error;

/// Errors surfaced across the memory manager, scheduler, interrupt
/// subsystem and virtio stack.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
	/// The physical frame allocator's freelist was empty.
	#[error("out of memory")]
	NoMemory,
	/// An argument was outside the domain the callee accepts.
	#[error("invalid value")]
	InvalidValue,
	/// The requested resource (GSI handler, task, virtqueue) does not exist.
	#[error("not found")]
	NotFound,
	/// The resource is already present (e.g. `map` on an already-mapped `va`).
	#[error("already exists")]
	AlreadyExists,
	/// A request exceeded a fixed-size buffer (descriptor chain, DMA slot).
	#[error("buffer too big")]
	BufTooBig,
	/// A device or transport operation failed without more specific detail.
	#[error("operation unsuccessful")]
	Unsuccessful,
	/// Low-level I/O failure reported by a device (e.g. non-zero virtio
	/// block status byte).
	#[error("I/O error")]
	Io,
	/// A fixed-format header failed structural validation.
	#[error("corrupt header")]
	HeaderCorrupt,
	/// Payload data failed a checksum or length check.
	#[error("corrupt data")]
	DataCorrupt,
	/// A magic number did not match what the format requires.
	#[error("bad magic number")]
	BadMagic,
	/// A virtqueue had no free descriptors for the requested chain length.
	#[error("virtqueue full")]
	QueueFull,
	/// The device rejected `FEATURES_OK`, or offered no common feature
	/// subset with the driver.
	#[error("feature negotiation failed")]
	FeatureNegotiation,
}

pub type Result<T> = core::result::Result<T, Error>;
