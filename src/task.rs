//! Cooperative kernel tasks under a preemptive timer.
//!
//! Task control blocks live in an arena and link into a circular ready ring
//! by index, so the scheduler walks the ring without ownership cycles. The
//! only preemption point is the timer interrupt: the entry stub hands
//! `schedule` the frame it built on the outgoing task's kernel stack, and
//! the returned pointer becomes the stack the stub resumes on.

use alloc::vec::Vec;
use spin::Mutex;

use crate::idt::Registers;
use crate::pmm::PAGE_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    #[allow(dead_code)]
    Sleeping,
    #[allow(dead_code)]
    Dead,
}

pub struct Task {
    /// Saved kernel stack pointer: the address of the registers frame the
    /// entry stub pushed when this task was suspended.
    kernel_stack_ptr: u64,
    /// Physical address of the task's kernel stack page.
    #[allow(dead_code)]
    stack_phys: u64,
    #[allow(dead_code)]
    pid: u64,
    state: TaskState,
    /// Page map this task runs under. Kernel tasks all share the kernel
    /// PML4; the switch path does not reload CR3.
    #[allow(dead_code)]
    pml4_phys: u64,
    /// Ring link: arena index of the next task.
    next: usize,
}

pub struct TaskTable {
    tasks: Vec<Task>,
    current: usize,
    next_pid: u64,
}

impl TaskTable {
    pub const fn new() -> Self {
        TaskTable {
            tasks: Vec::new(),
            current: 0,
            next_pid: 0,
        }
    }

    fn insert(&mut self, mut task: Task) -> usize {
        let handle = self.tasks.len();
        if self.tasks.is_empty() {
            task.next = handle;
            self.current = handle;
        } else {
            // Splice in right after the current task.
            task.next = self.tasks[self.current].next;
            self.tasks[self.current].next = handle;
        }
        self.tasks.push(task);
        handle
    }

    /// Round-robin selection, called with the outgoing frame's address.
    /// Returns the stack pointer of the task to resume.
    fn schedule(&mut self, old_rsp: u64) -> u64 {
        if self.tasks.is_empty() {
            // Timer fired before task_init; keep the interrupted stack.
            return old_rsp;
        }

        self.tasks[self.current].kernel_stack_ptr = old_rsp;

        // Walk the ring for the next Ready task, falling back to the
        // current one if the circuit comes up empty.
        let mut next = self.tasks[self.current].next;
        while self.tasks[next].state != TaskState::Ready && next != self.current {
            next = self.tasks[next].next;
        }

        if self.tasks[self.current].state == TaskState::Running {
            self.tasks[self.current].state = TaskState::Ready;
        }
        self.tasks[next].state = TaskState::Running;
        self.current = next;

        self.tasks[next].kernel_stack_ptr
    }

    fn mark_current_running(&mut self) {
        if let Some(task) = self.tasks.get_mut(self.current) {
            task.state = TaskState::Running;
        }
    }
}

static TASKS: Mutex<TaskTable> = Mutex::new(TaskTable::new());

/// The task every scheduler pass can fall back to: wait for the next
/// interrupt, forever.
extern "C" fn idle_task() -> ! {
    loop {
        x86_64::instructions::interrupts::enable_and_hlt();
    }
}

/// Create a new kernel task that will start at `entry` on its first slice.
///
/// A fresh PMM page becomes the kernel stack; a fake interrupt frame at its
/// top makes the first `iretq` look like a return to `entry`.
pub fn spawn(entry: extern "C" fn() -> !) -> Option<u64> {
    let stack_phys = crate::pmm::alloc_page()?;
    let stack_top = crate::vmm::phys_to_virt(stack_phys) as u64 + PAGE_SIZE;

    let frame_addr = stack_top - core::mem::size_of::<Registers>() as u64;
    let frame = frame_addr as *mut Registers;
    unsafe {
        core::ptr::write(frame, Registers::ZERO);
        (*frame).rip = entry as usize as u64;
        (*frame).cs = crate::gdt::KERNEL_CODE_SELECTOR as u64;
        (*frame).rflags = 0x202; // IF set
        (*frame).rsp = stack_top;
        (*frame).ss = crate::gdt::KERNEL_DATA_SELECTOR as u64;
    }

    let mut table = TASKS.lock();
    let pid = table.next_pid;
    table.next_pid += 1;
    table.insert(Task {
        kernel_stack_ptr: frame_addr,
        stack_phys,
        pid,
        state: TaskState::Ready,
        pml4_phys: crate::vmm::kernel_pml4(),
        next: 0,
    });
    Some(pid)
}

/// Create the idle task and mark it running. Must run before the PIT is
/// unleashed.
pub fn init() {
    if spawn(idle_task).is_none() {
        crate::log_error!("task: failed to create the idle task");
        crate::hcf();
    }
    TASKS.lock().mark_current_running();
    crate::log!("Multitasking initialised (idle task ready)");
}

/// Timer-interrupt entry: pick the next task and hand its stack back to the
/// assembly stub.
pub fn schedule(old_frame: *mut Registers) -> u64 {
    crate::pit::tick();
    TASKS.lock().schedule(old_frame as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(rsp: u64, state: TaskState) -> Task {
        Task {
            kernel_stack_ptr: rsp,
            stack_phys: 0,
            pid: 0,
            state,
            pml4_phys: 0,
            next: 0,
        }
    }

    fn table_with(rsps: &[u64]) -> TaskTable {
        let mut table = TaskTable::new();
        for (i, &rsp) in rsps.iter().enumerate() {
            let state = if i == 0 {
                TaskState::Running
            } else {
                TaskState::Ready
            };
            table.insert(task(rsp, state));
        }
        table
    }

    #[test]
    fn lone_task_keeps_its_stack() {
        let mut table = table_with(&[0xA000]);
        assert_eq!(table.schedule(0xAAA0), 0xAAA0);
        assert_eq!(table.tasks[0].state, TaskState::Running);
    }

    #[test]
    fn round_robin_visits_everyone() {
        // Ring after splicing: 0 -> 2 -> 1 -> 0
        let mut table = table_with(&[0xA000, 0xB000, 0xC000]);

        let mut seen = vec![table.current];
        let mut rsp = 0xAAA0;
        for _ in 0..2 {
            rsp = table.schedule(rsp);
            seen.push(table.current);
        }
        seen.sort_unstable();
        // With k ready tasks, k - 1 ticks reach every other task once.
        assert_eq!(seen, vec![0, 1, 2]);

        // One more tick closes the circle back to the first task with the
        // stack pointer it was suspended with.
        let back = table.schedule(rsp);
        assert_eq!(table.current, 0);
        assert_eq!(back, 0xAAA0);
    }

    #[test]
    fn saved_rsp_round_trips() {
        let mut table = table_with(&[0xA000, 0xB000]);
        let next_rsp = table.schedule(0x1234);
        assert_eq!(next_rsp, 0xB000);
        // The outgoing task resumes exactly where the stub left its frame.
        assert_eq!(table.schedule(0xB000), 0x1234);
    }

    #[test]
    fn dead_tasks_are_skipped() {
        let mut table = table_with(&[0xA000, 0xB000, 0xC000]);
        // Ring: 0 -> 2 -> 1; kill task 2.
        table.tasks[2].state = TaskState::Dead;

        table.schedule(0xAAA0);
        assert_eq!(table.current, 1);
        assert_eq!(table.tasks[2].state, TaskState::Dead);
    }

    #[test]
    fn falls_back_to_current_when_nothing_is_ready() {
        let mut table = table_with(&[0xA000, 0xB000]);
        table.tasks[1].state = TaskState::Sleeping;

        assert_eq!(table.schedule(0xAAA0), 0xAAA0);
        assert_eq!(table.current, 0);
        assert_eq!(table.tasks[0].state, TaskState::Running);
    }
}
