//! Thread/task subsystem: task control blocks and the scheduler.

pub mod scheduler;
pub mod task;

pub use scheduler::{
    init, print_task_list, schedule, thread_block, thread_exit, thread_unblock, thread_yield,
};
pub use task::{fork_pid, running_thread, thread_start, TaskControlBlock, TaskStatus};
