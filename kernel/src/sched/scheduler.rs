//! Run-queue scheduler.
//!
//! One global FIFO ready queue; priority buys a longer time slice, never
//! a better position in line. `schedule()` runs with interrupts masked;
//! its callers are the tick handler and the blocking primitives, both of
//! which already hold that guarantee.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicPtr, Ordering};

use super::task::{
    self, running_thread, TaskControlBlock, TaskStatus, IDLE_THREAD_PRIORITY,
    MAIN_THREAD_PRIORITY,
};
use crate::arch::interrupts::{self, IntrState};
use crate::list::List;

struct ListCell(UnsafeCell<List>);

// SAFETY: the lists are only touched through List's interrupt-masked
// operations on a single CPU.
unsafe impl Sync for ListCell {}

/// Tasks waiting for the CPU, linked through `general_tag`.
static READY_LIST: ListCell = ListCell(UnsafeCell::new(List::new()));
/// Every live task, linked through `all_tag`.
static ALL_LIST: ListCell = ListCell(UnsafeCell::new(List::new()));

#[allow(dead_code)]
static MAIN_THREAD: AtomicPtr<TaskControlBlock> = AtomicPtr::new(core::ptr::null_mut());
#[allow(dead_code)]
static IDLE_THREAD: AtomicPtr<TaskControlBlock> = AtomicPtr::new(core::ptr::null_mut());

fn ready_list() -> &'static mut List {
    // SAFETY: mutation goes through interrupt-masked list operations;
    // see ListCell.
    let list = unsafe { &mut *READY_LIST.0.get() };
    if list.needs_init() {
        interrupts::without_interrupts(|| {
            if list.needs_init() {
                list.init();
            }
        });
    }
    list
}

fn all_list() -> &'static mut List {
    // SAFETY: see ready_list.
    let list = unsafe { &mut *ALL_LIST.0.get() };
    if list.needs_init() {
        interrupts::without_interrupts(|| {
            if list.needs_init() {
                list.init();
            }
        });
    }
    list
}

/// Put a freshly created task on both global lists.
pub(super) fn enqueue_new_task(task: &mut TaskControlBlock) {
    debug_assert_eq!(task.status, TaskStatus::Ready);
    debug_assert!(!ready_list().contains(&task.general_tag));
    debug_assert!(!all_list().contains(&task.all_tag));
    // SAFETY: both tags belong to a live TCB and are unlinked.
    unsafe {
        ready_list().push_back(&mut task.general_tag);
        all_list().push_back(&mut task.all_tag);
    }
}

/// Adopt the boot flow of control as task "main".
///
/// The loader parked ESP at the top of a reserved page, so
/// `running_thread()` already points at usable TCB storage; it only
/// needs its fields filled in and a seat on the all-tasks list.
#[allow(dead_code)]
fn make_main_thread() {
    let main = running_thread();
    task::init_thread(main, "main", MAIN_THREAD_PRIORITY, true);
    debug_assert!(!all_list().contains(&main.all_tag));
    // SAFETY: the tag belongs to the adopted main TCB and is unlinked.
    unsafe { all_list().push_back(&mut main.all_tag) };
    MAIN_THREAD.store(main, Ordering::Release);
}

/// The idle task: parked until the scheduler wakes it on an empty run
/// queue, then halts until the next interrupt supplies work.
#[allow(dead_code)]
fn idle(_arg: usize) {
    loop {
        thread_block(TaskStatus::Blocked);
        crate::arch::enable_and_halt();
    }
}

/// Pick the next task and switch to it. Interrupts must be off.
pub fn schedule() {
    assert_eq!(interrupts::get(), IntrState::Off);

    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    unimplemented!("context switching requires bare metal");

    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        let cur = running_thread();
        if cur.status == TaskStatus::Running {
            // Quantum ran out: refill it and rejoin the back of the line.
            debug_assert!(!ready_list().contains(&cur.general_tag));
            // SAFETY: cur is live and its general_tag unlinked.
            unsafe { ready_list().push_back(&mut cur.general_tag) };
            cur.ticks = cur.priority;
            cur.status = TaskStatus::Ready;
        }

        if ready_list().is_empty() {
            let idle_task = IDLE_THREAD.load(Ordering::Acquire);
            debug_assert!(!idle_task.is_null());
            // SAFETY: idle is spawned during init and never exits.
            thread_unblock(unsafe { &mut *idle_task });
        }
        debug_assert!(!ready_list().is_empty());

        let node = ready_list().pop_front();
        // SAFETY: only general_tags of live TCBs enter the ready list.
        let next = unsafe { TaskControlBlock::from_general_tag(node) };
        next.status = TaskStatus::Running;

        activate_address_space(next);

        // SAFETY: both TCBs are live; switch_to's contract is exactly
        // this call shape.
        unsafe { crate::arch::x86::context::switch_to(cur, next) };
    }
}

/// Load the next task's address space and ring 0 stack slot.
#[cfg(all(target_arch = "x86", target_os = "none"))]
fn activate_address_space(task: &TaskControlBlock) {
    let pgdir = task.pgdir.unwrap_or(crate::mm::KERNEL_PGDIR_PHYS);
    // SAFETY: kernel threads use the boot directory; user tasks carry a
    // directory whose kernel half mirrors it.
    unsafe { crate::arch::x86::load_page_directory(pgdir) };
    if task.pgdir.is_some() {
        // Ring 3 tasks re-enter the kernel on their own TCB page's stack.
        crate::arch::x86::tss::set_kernel_stack(task.kstack_top());
    }
}

/// Take the current task off the CPU in a non-runnable state.
///
/// Resumes (with the caller's interrupt state restored) only after
/// someone calls [`thread_unblock`] on it.
pub fn thread_block(status: TaskStatus) {
    assert!(matches!(
        status,
        TaskStatus::Blocked | TaskStatus::Waiting | TaskStatus::Hanging
    ));
    let old = interrupts::disable();
    let cur = running_thread();
    cur.status = status;
    schedule();
    interrupts::set(old);
}

/// Make a blocked task runnable again, at the *front* of the queue so it
/// runs soon.
pub fn thread_unblock(task: &mut TaskControlBlock) {
    let old = interrupts::disable();
    debug_assert!(matches!(
        task.status,
        TaskStatus::Blocked | TaskStatus::Waiting | TaskStatus::Hanging
    ));
    if task.status != TaskStatus::Ready {
        assert!(
            !ready_list().contains(&task.general_tag),
            "blocked task already in ready list"
        );
        // SAFETY: task is live and its general_tag unlinked.
        unsafe { ready_list().push_front(&mut task.general_tag) };
        task.status = TaskStatus::Ready;
    }
    interrupts::set(old);
}

/// Give up the CPU but stay runnable: rotate to the back of the queue.
pub fn thread_yield() {
    let old = interrupts::disable();
    let cur = running_thread();
    debug_assert!(!ready_list().contains(&cur.general_tag));
    // SAFETY: cur is live and its general_tag unlinked.
    unsafe { ready_list().push_back(&mut cur.general_tag) };
    cur.status = TaskStatus::Ready;
    schedule();
    interrupts::set(old);
}

/// Terminate the current task. The TCB stays on no queue but remains
/// allocated; reclaiming it is the (external) reaper's job.
pub fn thread_exit() -> ! {
    interrupts::disable();
    let cur = running_thread();
    // SAFETY: cur was placed on the all list at creation.
    unsafe { List::remove(&mut cur.all_tag) };
    cur.status = TaskStatus::Died;
    schedule();
    unreachable!("dead task was scheduled");
}

/// Print one row per task: pid, ppid, state, elapsed ticks, name.
pub fn print_task_list() {
    crate::println!(
        "{:<8}{:<8}{:<10}{:<8}{}",
        "PID",
        "PPID",
        "STAT",
        "TICKS",
        "COMMAND"
    );
    all_list().find(|node| {
        // SAFETY: only all_tags of live TCBs enter the all list.
        let t = unsafe { TaskControlBlock::from_all_tag(node) };
        crate::println!(
            "{:<8}{:<8}{:<10}{:<8}{}",
            t.pid,
            t.parent_pid,
            status_name(t.status),
            t.elapsed_ticks,
            t.name()
        );
        false
    });
}

fn status_name(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Running => "RUNNING",
        TaskStatus::Ready => "READY",
        TaskStatus::Blocked => "BLOCKED",
        TaskStatus::Waiting => "WAITING",
        TaskStatus::Hanging => "HANGING",
        TaskStatus::Died => "DIED",
    }
}

/// Bring up threading: adopt the boot thread and start `idle`.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn init() -> crate::error::KernelResult<()> {
    ready_list();
    all_list();
    make_main_thread();
    let idle_task = task::thread_start("idle", IDLE_THREAD_PRIORITY, idle, 0)?;
    IDLE_THREAD.store(idle_task, Ordering::Release);
    log::info!("scheduler ready (main adopted, idle spawned)");
    Ok(())
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn init() -> crate::error::KernelResult<()> {
    ready_list();
    all_list();
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mm::PAGE_SIZE;

    /// The ready/all lists are process-global; tests touching them take
    /// this guard so they cannot interleave.
    pub(crate) fn serial() -> std::sync::MutexGuard<'static, ()> {
        static GUARD: std::sync::Mutex<()> = std::sync::Mutex::new(());
        GUARD.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pop everything off the global ready list (test cleanup).
    pub(crate) fn drain_ready_list() {
        while !ready_list().is_empty() {
            ready_list().pop_front();
        }
    }

    #[repr(C, align(4096))]
    struct TcbPage([u8; PAGE_SIZE]);

    pub(crate) fn fabricated_task(name: &str, status: TaskStatus) -> &'static mut TaskControlBlock {
        let page = std::boxed::Box::leak(std::boxed::Box::new(TcbPage([0; PAGE_SIZE])));
        // SAFETY: page-aligned, page-sized, zeroed, exclusively ours.
        let task = unsafe { &mut *(page as *mut TcbPage as *mut TaskControlBlock) };
        task::init_thread(task, name, 5, false);
        task.status = status;
        task
    }

    #[test]
    fn unblock_moves_task_to_ready_front() {
        let _guard = serial();
        let a = fabricated_task("blocked-a", TaskStatus::Blocked);
        let b = fabricated_task("blocked-b", TaskStatus::Waiting);

        thread_unblock(a);
        thread_unblock(b);

        // Front-of-queue wakeups: b was unblocked last, so it runs first.
        assert_eq!(a.status, TaskStatus::Ready);
        assert_eq!(b.status, TaskStatus::Ready);
        assert!(ready_list().contains(&a.general_tag));
        assert!(ready_list().contains(&b.general_tag));
        let first = ready_list().pop_front();
        // SAFETY: the node came off the ready list.
        assert_eq!(unsafe { TaskControlBlock::from_general_tag(first) }.pid, b.pid);
        let second = ready_list().pop_front();
        // SAFETY: the node came off the ready list.
        assert_eq!(
            unsafe { TaskControlBlock::from_general_tag(second) }.pid,
            a.pid
        );
    }

    #[test]
    fn unblock_accepts_every_parked_state() {
        let _guard = serial();
        for state in [TaskStatus::Blocked, TaskStatus::Waiting, TaskStatus::Hanging] {
            let t = fabricated_task("parked", state);
            thread_unblock(t);
            assert_eq!(t.status, TaskStatus::Ready);
        }
        drain_ready_list();
    }

    #[test]
    fn ready_list_membership_tracks_status() {
        let _guard = serial();
        let t = fabricated_task("tracked", TaskStatus::Blocked);
        assert!(!ready_list().contains(&t.general_tag));
        thread_unblock(t);
        assert!(ready_list().contains(&t.general_tag) == (t.status == TaskStatus::Ready));
        ready_list().pop_front();
    }
}
