//! x86-64 address types and the three memory subsystems that share them:
//! the physical frame allocator ([`physicalmem`]), the 4-level page-table
//! manager ([`paging`]) and the kernel virtual-address-space allocator
//! together with temp-map slots ([`virtualmem`]). [`tlb`] implements the
//! cross-CPU shootdown protocol that `paging` calls into on every
//! structural edit of a mapping another CPU could have cached.

pub mod paging;
pub mod physicalmem;
pub mod tlb;
pub mod virtualmem;

pub use memory_addresses::{PhysAddr, VirtAddr};

/// Base of the kernel half of the address space (spec §6 "Memory layout").
/// `phys = va - KERNEL_VIRT_BASE` for every page the kernel direct-maps.
pub const KERNEL_VIRT_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Upper bound of the (unused by this core) user half.
pub const USER_VIRT_MAX: u64 = 0x0000_7FFF_FFFF_FFFF;

/// Translates a direct-mapped kernel virtual address back to its physical
/// address. Only valid for addresses obtained from [`physicalmem`] or
/// [`virtualmem::map_mmio`]; walking-based translation for arbitrary
/// addresses is [`paging::virt_to_phys`].
pub fn phys_to_virt(phys: PhysAddr) -> VirtAddr {
	VirtAddr::new(phys.as_u64() + KERNEL_VIRT_BASE)
}

pub fn virt_to_phys_direct(virt: VirtAddr) -> PhysAddr {
	PhysAddr::new(virt.as_u64() - KERNEL_VIRT_BASE)
}
