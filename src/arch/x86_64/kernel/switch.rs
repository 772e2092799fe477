//! Context switch: save the callee-saved registers of the outgoing task
//! onto its own stack, swap `rsp`, restore the incoming task's registers
//! from its stack (spec §4's "C7"/"C8" task switch contract).
//!
//! The System V ABI only requires a callee to preserve `rbx`, `rbp`,
//! `r12`-`r15` and the stack pointer across a call, so that is exactly what
//! gets pushed/popped here; everything else is caller-saved and already
//! spilled by the compiler before this function is reached.

use core::arch::naked_asm;

/// Switches from the current stack to `new_rsp`, first writing the current
/// `rsp` (after pushing callee-saved registers) to `*old_rsp`. When another
/// CPU later switches back to `*old_rsp`, execution resumes right after the
/// `call switch_context` that got us here, with the registers restored.
///
/// # Safety
///
/// `new_rsp` must point at a stack previously saved by this same function
/// (or prepared by [`crate::scheduler::task::Task::new`] to look like one),
/// and `old_rsp` must be a valid pointer the outgoing task owns exclusively
/// until it is scheduled again.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(old_rsp: *mut u64, new_rsp: u64) {
	naked_asm!(
		"push rbp",
		"push rbx",
		"push r12",
		"push r13",
		"push r14",
		"push r15",
		"mov [rdi], rsp",
		"mov rsp, rsi",
		"pop r15",
		"pop r14",
		"pop r13",
		"pop r12",
		"pop rbx",
		"pop rbp",
		"ret",
	);
}

/// Bootstrap stub a freshly created task's stack is primed to "return" into
/// on its first switch-in: pops the six callee-saved slots (garbage, since
/// the task never pushed them) and jumps to the task's entry trampoline in
/// `rbx`, matching the layout [`switch_context`] expects to unwind.
#[unsafe(naked)]
pub unsafe extern "C" fn task_entry_trampoline() {
	naked_asm!(
		"mov rdi, rbx", // argument pointer stashed in rbx by Task::new
		"call {entry}",
		"ud2",
		entry = sym crate::scheduler::task::run_entry,
	);
}
