//! CPU primitives (spec §4's "C1"): feature detection, halt/pause, and the
//! TSC read both [`super::systemtime`] and the scheduler's preemption
//! accounting build on.

use raw_cpuid::CpuId;

/// Reads the time-stamp counter.
#[inline]
pub fn rdtsc() -> u64 {
	unsafe { core::arch::x86_64::_rdtsc() }
}

/// Halts the CPU until the next interrupt. The scheduler's idle task calls
/// this in a loop rather than busy-spinning.
#[inline]
pub fn halt() {
	x86_64::instructions::hlt();
}

#[inline]
pub fn pause() {
	core::hint::spin_loop();
}

/// `true` if the CPU advertises the invariant TSC (CPUID leaf
/// 0x8000_0007, EDX bit 8) used by [`super::systemtime`] to decide whether
/// the TSC is safe to use as the monotonic time source across P-state and
/// C-state transitions.
pub fn has_invariant_tsc() -> bool {
	CpuId::new()
		.get_advanced_power_mgmt_info()
		.is_some_and(|info| info.has_invariant_tsc())
}

/// `true` if `rdtscp`/`FSGSBASE` are available, gating the `fsgsbase`
/// feature's per-CPU-base-via-`GS` fast path.
pub fn has_fsgsbase() -> bool {
	CpuId::new()
		.get_extended_feature_info()
		.is_some_and(|info| info.has_fsgsbase())
}

/// Number of logical CPUs the topology leaf reports, used only as a sanity
/// check against the ACPI MADT's processor-local-APIC count.
pub fn cpuid_logical_cpu_count() -> Option<u32> {
	CpuId::new()
		.get_feature_info()
		.map(|info| info.max_logical_processor_ids() as u32)
}
