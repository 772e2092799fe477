//! IDT installation: CPU exception handlers plus the shared-vector device
//! dispatch table (spec §4.4).
//!
//! The IDT is built once (its 256 entries are identical on every CPU) and
//! reloaded by each CPU's `install()` call. Vectors 32..=255 all point at
//! one general handler installed through [`x86_64::set_general_handler!`],
//! which forwards to [`irq::dispatch`] instead of needing 224 hand-written
//! naked stubs.

use hermit_sync::OnceCell;
use x86_64::set_general_handler;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use super::backtrace;
use super::gdt::{DOUBLE_FAULT_IST_INDEX, MACHINE_CHECK_IST_INDEX, NMI_IST_INDEX};
use super::irq;
use super::panic;

static IDT: OnceCell<InterruptDescriptorTable> = OnceCell::new();

/// Builds the IDT on first call (from CPU 0) and loads it. Subsequent
/// callers (the other CPUs) just load the already-built table.
pub fn install() {
	let idt = IDT.get_or_init(build_idt);
	idt.load();
}

fn build_idt() -> InterruptDescriptorTable {
	let mut idt = InterruptDescriptorTable::new();

	set_general_handler!(&mut idt, generic_device_handler, 32..=255);

	idt.divide_error.set_handler_fn(divide_error);
	idt.debug.set_handler_fn(debug);
	idt.breakpoint.set_handler_fn(breakpoint);
	idt.overflow.set_handler_fn(overflow);
	idt.bound_range_exceeded.set_handler_fn(bound_range_exceeded);
	idt.invalid_opcode.set_handler_fn(invalid_opcode);
	idt.device_not_available.set_handler_fn(device_not_available);
	idt.invalid_tss.set_handler_fn(invalid_tss);
	idt.segment_not_present.set_handler_fn(segment_not_present);
	idt.stack_segment_fault.set_handler_fn(stack_segment_fault);
	idt.general_protection_fault.set_handler_fn(general_protection_fault);
	idt.page_fault.set_handler_fn(page_fault);
	idt.x87_floating_point.set_handler_fn(x87_floating_point);
	idt.alignment_check.set_handler_fn(alignment_check);
	idt.simd_floating_point.set_handler_fn(simd_floating_point);

	unsafe {
		idt.non_maskable_interrupt
			.set_handler_fn(non_maskable_interrupt)
			.set_stack_index(NMI_IST_INDEX);
		idt.double_fault
			.set_handler_fn(double_fault)
			.set_stack_index(DOUBLE_FAULT_IST_INDEX);
		idt.machine_check
			.set_handler_fn(machine_check)
			.set_stack_index(MACHINE_CHECK_IST_INDEX);
	}

	idt
}

fn generic_device_handler(_frame: InterruptStackFrame, index: u8, _error_code: Option<u64>) {
	irq::dispatch(index);
}

extern "x86-interrupt" fn divide_error(frame: InterruptStackFrame) {
	panic_on_exception("divide error", &frame, None);
}

extern "x86-interrupt" fn debug(_frame: InterruptStackFrame) {}

extern "x86-interrupt" fn breakpoint(frame: InterruptStackFrame) {
	log::warn!("breakpoint at {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn overflow(frame: InterruptStackFrame) {
	panic_on_exception("overflow", &frame, None);
}

extern "x86-interrupt" fn bound_range_exceeded(frame: InterruptStackFrame) {
	panic_on_exception("bound range exceeded", &frame, None);
}

extern "x86-interrupt" fn invalid_opcode(frame: InterruptStackFrame) {
	panic_on_exception("invalid opcode", &frame, None);
}

extern "x86-interrupt" fn device_not_available(frame: InterruptStackFrame) {
	panic_on_exception("device not available", &frame, None);
}

extern "x86-interrupt" fn invalid_tss(frame: InterruptStackFrame, error_code: u64) {
	panic_on_exception("invalid TSS", &frame, Some(error_code));
}

extern "x86-interrupt" fn segment_not_present(frame: InterruptStackFrame, error_code: u64) {
	panic_on_exception("segment not present", &frame, Some(error_code));
}

extern "x86-interrupt" fn stack_segment_fault(frame: InterruptStackFrame, error_code: u64) {
	panic_on_exception("stack segment fault", &frame, Some(error_code));
}

extern "x86-interrupt" fn general_protection_fault(frame: InterruptStackFrame, error_code: u64) {
	panic_on_exception("general protection fault", &frame, Some(error_code));
}

extern "x86-interrupt" fn page_fault(frame: InterruptStackFrame, error_code: PageFaultErrorCode) {
	let addr = x86_64::registers::control::Cr2::read();
	panic::report(
		"PageFault",
		frame.instruction_pointer.as_u64(),
		frame.stack_pointer.as_u64(),
		backtrace::current_rbp(),
		Some(addr.as_u64()),
		Some(error_code.bits()),
	);
}

extern "x86-interrupt" fn x87_floating_point(frame: InterruptStackFrame) {
	panic_on_exception("x87 floating point", &frame, None);
}

extern "x86-interrupt" fn alignment_check(frame: InterruptStackFrame, error_code: u64) {
	panic_on_exception("alignment check", &frame, Some(error_code));
}

extern "x86-interrupt" fn simd_floating_point(frame: InterruptStackFrame) {
	panic_on_exception("SIMD floating point", &frame, None);
}

extern "x86-interrupt" fn non_maskable_interrupt(_frame: InterruptStackFrame) {
	log::error!("non-maskable interrupt");
}

extern "x86-interrupt" fn double_fault(frame: InterruptStackFrame, error_code: u64) -> ! {
	panic::report(
		"DoubleFault",
		frame.instruction_pointer.as_u64(),
		frame.stack_pointer.as_u64(),
		backtrace::current_rbp(),
		None,
		Some(error_code),
	);
}

extern "x86-interrupt" fn machine_check(frame: InterruptStackFrame) -> ! {
	panic::report(
		"MachineCheck",
		frame.instruction_pointer.as_u64(),
		frame.stack_pointer.as_u64(),
		backtrace::current_rbp(),
		None,
		None,
	);
}

/// Shared tail for every CPU exception whose only useful context is its
/// faulting `rip`/`rsp` and, for the handful of vectors that push one, an
/// error code (spec §4.5's "produces panic with backtrace" row).
fn panic_on_exception(name: &str, frame: &InterruptStackFrame, error_code: Option<u64>) {
	panic::report(
		name,
		frame.instruction_pointer.as_u64(),
		frame.stack_pointer.as_u64(),
		backtrace::current_rbp(),
		None,
		error_code,
	);
}
