//! Monotonic and wall-clock time (spec §4.8), delegating the
//! architecture-specific calibration to
//! [`crate::arch::x86_64::kernel::systemtime`].

use crate::arch::x86_64::kernel::systemtime;

/// Nanoseconds since boot. Always monotonically increasing, backed by
/// either kvmclock or TSC-against-PIT calibration.
pub fn monotonic_ns() -> u64 {
	systemtime::monotonic_ns()
}

/// Unix epoch nanoseconds, computed by adding [`monotonic_ns`] to the RTC
/// CMOS reading latched once at boot.
pub fn wall_clock_ns() -> u64 {
	systemtime::wall_clock_ns()
}
