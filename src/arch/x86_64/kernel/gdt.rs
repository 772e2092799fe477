//! Per-CPU GDT and TSS (spec §4.4's IST stacks for double-fault and NMI).
//!
//! Every CPU gets its own [`GlobalDescriptorTable`], [`TaskStateSegment`]
//! and IST stacks, since the TSS carries the per-CPU `RSP0`/IST stack
//! pointers the hardware consults on a privilege-level change or a fault
//! that uses an IST slot. Each CPU's tables are heap-allocated once and
//! leaked to `'static`: a CPU never tears its GDT back down for the
//! lifetime of the kernel.

use alloc::boxed::Box;

use x86_64::instructions::segmentation::{Segment, CS, DS, ES, SS};
use x86_64::instructions::tables::load_tss;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr as X86VirtAddr;

use crate::config::TASK_STACK_PAGES;

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;
pub const NMI_IST_INDEX: u16 = 1;
pub const MACHINE_CHECK_IST_INDEX: u16 = 2;

const IST_STACK_SIZE: usize = TASK_STACK_PAGES * crate::config::PAGE_SIZE;

struct Selectors {
	kernel_code: SegmentSelector,
	kernel_data: SegmentSelector,
	tss: SegmentSelector,
}

/// Allocates fresh IST stacks and a TSS/GDT for the calling CPU, loads them,
/// and reloads the segment registers to point at the new kernel code/data
/// selectors. Must run before [`super::interrupts::install`] so the IDT's
/// IST indices refer to a live TSS.
pub fn init() {
	let mut tss = TaskStateSegment::new();
	tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = alloc_ist_stack();
	tss.interrupt_stack_table[NMI_IST_INDEX as usize] = alloc_ist_stack();
	tss.interrupt_stack_table[MACHINE_CHECK_IST_INDEX as usize] = alloc_ist_stack();

	let tss_ref: &'static TaskStateSegment = Box::leak(Box::new(tss));

	let mut gdt = GlobalDescriptorTable::new();
	let kernel_code = gdt.append(Descriptor::kernel_code_segment());
	let kernel_data = gdt.append(Descriptor::kernel_data_segment());
	let tss_selector = gdt.append(Descriptor::tss_segment(tss_ref));

	let selectors = Selectors {
		kernel_code,
		kernel_data,
		tss: tss_selector,
	};

	let gdt_ref: &'static GlobalDescriptorTable = Box::leak(Box::new(gdt));

	unsafe {
		gdt_ref.load_unsafe();
		CS::set_reg(selectors.kernel_code);
		DS::set_reg(selectors.kernel_data);
		ES::set_reg(selectors.kernel_data);
		SS::set_reg(selectors.kernel_data);
		load_tss(selectors.tss);
	}
}

fn alloc_ist_stack() -> X86VirtAddr {
	let stack = Box::leak(alloc::vec![0u8; IST_STACK_SIZE].into_boxed_slice());
	X86VirtAddr::new(stack.as_ptr() as u64 + IST_STACK_SIZE as u64)
}
