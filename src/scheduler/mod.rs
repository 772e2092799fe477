//! Per-CPU preemptive scheduler (spec §4's "C7"/"C8").
//!
//! Each CPU owns one [`PerCoreScheduler`]: a ready [`VecDeque`] it alone
//! pushes/pops from (cross-CPU task moves go through [`migrate`], which
//! takes the target CPU's lock), plus the currently-running task found
//! through [`task::current`]. The timer IRQ calls [`tick`], which only
//! actually reschedules when [`percore::CoreData::preempt_disable_count`]
//! is zero, so a held [`crate::synch::spinlock::Spinlock`] can
//! temporarily suppress preemption the same way
//! [`crate::collections::AvoidInterrupts`] suppresses interrupts.

pub mod task;

use alloc::collections::VecDeque;
use core::sync::atomic::Ordering;

use hermit_sync::InterruptTicketMutex;

use crate::arch::x86_64::kernel::{percore, switch};
use crate::config::MAX_CORES;
use task::{AtomicCoreMask, CoreMask, EntryFn, Priority, Task, TaskStatus};

struct ReadyQueue {
	queue: VecDeque<&'static Task>,
}

impl ReadyQueue {
	const fn new() -> Self {
		Self { queue: VecDeque::new() }
	}
}

/// One entry per possible core id; unused entries are simply never locked
/// since no task is ever pushed onto a queue for a CPU that never calls
/// [`init`].
static QUEUES: [InterruptTicketMutex<ReadyQueue>; MAX_CORES] =
	[const { InterruptTicketMutex::new(ReadyQueue::new()) }; MAX_CORES];

/// Per-CPU scheduler handle, obtained through [`per_core`].
pub struct PerCoreScheduler {
	core_id: u32,
}

pub fn per_core() -> PerCoreScheduler {
	PerCoreScheduler {
		core_id: percore::core_id(),
	}
}

impl PerCoreScheduler {
	/// Creates an idle task for this CPU (so `current()` is always valid)
	/// and enters the scheduling loop. Never returns: when the ready queue
	/// is empty the CPU halts until the next timer tick.
	pub fn run(&self) -> ! {
		let idle = Task::spawn(idle_entry, 0, Priority::Idle);
		idle.core_id.store(self.core_id, Ordering::Relaxed);
		mark_core_online(self.core_id);
		unsafe { enter_idle_task(idle) }
	}
}

fn idle_entry(_arg: usize) {
	loop {
		crate::arch::x86_64::kernel::processor::halt();
		yield_now();
	}
}

/// Transfers control to `task` without expecting to return (used only once,
/// by [`PerCoreScheduler::run`], to get the bootstrap CPU stack out of the
/// picture).
unsafe fn enter_idle_task(task: &'static Task) -> ! {
	let mut discard: u64 = 0;
	task.set_status(TaskStatus::Running);
	task.record_switched_in();
	unsafe {
		switch::switch_context(&mut discard, *task.saved_rsp.get());
	}
	unreachable!("idle task must never return to the bootstrap stack")
}

/// Creates a new task and places it on the least-loaded online CPU within
/// `affinity_mask` (spec §4.6: "select next task queue picks the
/// least-loaded CPU within the mask, based on context-switch counters").
/// Ties (including the all-idle case at boot) fall to the calling CPU.
pub fn spawn(entry: EntryFn, arg: usize, priority: Priority) -> task::TaskId {
	spawn_with_affinity(entry, arg, priority, CoreMask::all())
}

pub fn spawn_with_affinity(entry: EntryFn, arg: usize, priority: Priority, affinity_mask: CoreMask) -> task::TaskId {
	let task = Task::spawn(entry, arg, priority);
	task.affinity.store(affinity_mask);
	let core_id = least_loaded_core(affinity_mask).unwrap_or_else(percore::core_id);
	task.core_id.store(core_id, Ordering::Relaxed);
	let id = task.id;
	QUEUES[core_id as usize].lock().queue.push_back(task);
	id
}

/// Picks the CPU, among those [`ONLINE_CORES`] has seen and `affinity_mask`
/// allows, with the fewest context switches summed across its ready queue
/// — a proxy for "least loaded" cheap enough to compute on every spawn,
/// grounded on the same context-switch counters [`task::Task::context_switches`]
/// already tracks for accounting.
fn least_loaded_core(affinity_mask: CoreMask) -> Option<u32> {
	(0..MAX_CORES as u32)
		.filter(|&core_id| ONLINE_CORES.contains(core_id) && affinity_mask.contains(core_id))
		.min_by_key(|&core_id| {
			QUEUES[core_id as usize]
				.lock()
				.queue
				.iter()
				.map(|t| t.context_switches())
				.sum::<u64>()
		})
}

/// Bitmask of CPUs that have called [`per_core`]'s first-use registration
/// ([`mark_core_online`]); consulted by [`least_loaded_core`] so spawns
/// before SMP bring-up completes never target a CPU that has not run
/// [`PerCoreScheduler::run`] yet.
static ONLINE_CORES: AtomicCoreMask = AtomicCoreMask::new(CoreMask::empty());

fn mark_core_online(core_id: u32) {
	ONLINE_CORES.set(core_id);
}

/// Moves a ready task from its current CPU's queue onto `target_core`'s, if
/// its affinity mask allows it (spec §3's affinity field).
pub fn migrate(task: &'static Task, target_core: u32) -> crate::errno::Result<()> {
	if !task.can_run_on(target_core) {
		return Err(crate::errno::Error::InvalidValue);
	}
	task.core_id.store(target_core, Ordering::Relaxed);
	QUEUES[target_core as usize].lock().queue.push_back(task);
	Ok(())
}

/// Voluntarily gives up the CPU. Re-enqueues the current task (unless it
/// just finished) and switches to the next ready task, or the idle loop if
/// none is ready.
pub fn yield_now() {
	reschedule(true);
}

/// Called from the timer interrupt handler. Only reschedules when
/// preemption is currently allowed.
pub fn tick() {
	if percore::current().preempt_disable_count.load(Ordering::Acquire) != 0 {
		return;
	}
	reschedule(true);
}

fn reschedule(requeue_current: bool) {
	let core_id = percore::core_id();
	let current = task::current();

	if current.is_stopping() && current.status() != TaskStatus::Finished {
		current.set_status(TaskStatus::Finished);
	}

	let next = {
		let mut queue = QUEUES[core_id as usize].lock();
		if requeue_current && current.status() != TaskStatus::Finished {
			current.set_status(TaskStatus::Ready);
			queue.queue.push_back(current);
		}
		queue.queue.pop_front()
	};

	let Some(next) = next else {
		return;
	};
	if core::ptr::eq(next, current) {
		current.set_status(TaskStatus::Running);
		return;
	}

	current.record_switched_out();
	next.set_status(TaskStatus::Running);
	next.record_switched_in();
	unsafe {
		switch::switch_context(current.saved_rsp.get(), *next.saved_rsp.get());
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn queues_array_covers_every_possible_core_id() {
		assert_eq!(QUEUES.len(), MAX_CORES);
	}
}
