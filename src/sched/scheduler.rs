//! Priority-with-aging preemptive scheduler (`spec.md` §4.2, component H):
//! selection, block/unblock, sleep, fork/exit/wait, user-mode entry.
//!
//! Grounded on the teacher's `sched::scheduler`, a single-core run-queue
//! walker with the same shape (global task table behind one lock, intrusive
//! list nodes storing table indices rather than pointers since this is safe
//! Rust rather than C).

use core::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};
use spin::Mutex;

use crate::config::{MAX_PRIORITY, MAX_TASKS, PRIORITY_AGING_STEP, USER_STACK_TOP};
use crate::mm::paging::PteFlags;
use crate::sched::task::{ListNode, TaskState, Tcb, TaskTable, TCB_MAGIC, KERNEL_USER};

static TASK_TABLE: Mutex<TaskTable> = Mutex::new(TaskTable::new());
static CURRENT: AtomicUsize = AtomicUsize::new(0);
static JIFFIES: AtomicU64 = AtomicU64::new(0);
static NEXT_PID: AtomicI32 = AtomicI32::new(1);

/// An intrusive, table-index-based doubly-linked list with sentinel
/// head/tail (`spec.md` §3: "global block list and a global sleep list,
/// both doubly-linked with sentinel head/tail").
pub struct WaitList {
    state: Mutex<ListState>,
}

struct ListState {
    head: Option<usize>,
    tail: Option<usize>,
    sorted_by_wake_tick: bool,
}

impl WaitList {
    pub const fn new() -> Self {
        Self { state: Mutex::new(ListState { head: None, tail: None, sorted_by_wake_tick: false }) }
    }

    const fn new_sorted() -> Self {
        Self { state: Mutex::new(ListState { head: None, tail: None, sorted_by_wake_tick: true }) }
    }
}

static BLOCK_LIST: WaitList = WaitList::new();
static SLEEP_LIST: WaitList = WaitList::new_sorted();

fn node_mut(table: &mut TaskTable, idx: usize) -> &mut ListNode {
    &mut table.slots[idx].node
}

/// Appends `idx` to the tail of `list` (or, for the sleep list, inserts in
/// ascending wake-tick order — `spec.md` §4.2: "inserts into the sleep list
/// in ascending order of wake-tick").
fn list_insert(table: &mut TaskTable, list: &WaitList, idx: usize) {
    let mut state = list.state.lock();
    debug_assert!(!node_mut(table, idx).is_queued(), "task already on a list");

    if state.sorted_by_wake_tick {
        let wake_tick = table.slots[idx].ticks as i64;
        let mut cursor = state.head;
        let mut insert_after: Option<usize> = None;
        while let Some(c) = cursor {
            if (table.slots[c].ticks as i64) > wake_tick {
                break;
            }
            insert_after = Some(c);
            cursor = table.slots[c].node.next;
        }
        match insert_after {
            None => {
                node_mut(table, idx).next = state.head;
                node_mut(table, idx).prev = None;
                if let Some(h) = state.head {
                    table.slots[h].node.prev = Some(idx);
                }
                state.head = Some(idx);
                if state.tail.is_none() {
                    state.tail = Some(idx);
                }
            }
            Some(after) => {
                let next = table.slots[after].node.next;
                node_mut(table, idx).prev = Some(after);
                node_mut(table, idx).next = next;
                table.slots[after].node.next = Some(idx);
                match next {
                    Some(n) => table.slots[n].node.prev = Some(idx),
                    None => state.tail = Some(idx),
                }
            }
        }
        return;
    }

    node_mut(table, idx).prev = state.tail;
    node_mut(table, idx).next = None;
    if let Some(t) = state.tail {
        table.slots[t].node.next = Some(idx);
    } else {
        state.head = Some(idx);
    }
    state.tail = Some(idx);
}

/// Removes `idx` from whichever list holds it. No-op if untracked; callers
/// must know which list `idx` is queued on (there's only ever one, per
/// `spec.md` §8's single-list invariant).
fn list_remove(table: &mut TaskTable, list: &WaitList, idx: usize) {
    let mut state = list.state.lock();
    let (prev, next) = {
        let node = node_mut(table, idx);
        (node.prev, node.next)
    };
    match prev {
        Some(p) => table.slots[p].node.next = next,
        None => state.head = next,
    }
    match next {
        Some(n) => table.slots[n].node.prev = prev,
        None => state.tail = prev,
    }
    *node_mut(table, idx) = ListNode::detached();
}

fn list_pop_head(table: &mut TaskTable, list: &WaitList) -> Option<usize> {
    let head = list.state.lock().head;
    if let Some(h) = head {
        list_remove(table, list, h);
    }
    head
}

/// The bounds `idt::handle_page_fault` needs to classify a fault for the
/// currently running task.
pub struct TaskBounds {
    pub kernel_end: u32,
    pub brk: u32,
    pub stack_bottom: u32,
    pub stack_top: u32,
}

/// Snapshot of the current task's demand-paging bounds. The user stack is
/// fixed-size and grows down from [`USER_STACK_TOP`] (`spec.md` doesn't
/// specify a stack size; `config::USER_STACK_SIZE` fixes one).
pub fn current_task_bounds() -> TaskBounds {
    let table = TASK_TABLE.lock();
    let cur = &table.slots[CURRENT.load(Ordering::Acquire)];
    TaskBounds {
        kernel_end: crate::boot::kernel_end(),
        brk: cur.brk,
        stack_bottom: USER_STACK_TOP - crate::config::USER_STACK_SIZE as u32,
        stack_top: USER_STACK_TOP,
    }
}

pub fn current_pid() -> i32 {
    TASK_TABLE.lock().slots[CURRENT.load(Ordering::Acquire)].pid as i32
}

pub fn current_ppid() -> i32 {
    TASK_TABLE.lock().slots[CURRENT.load(Ordering::Acquire)].ppid as i32
}

pub fn current_brk() -> u32 {
    TASK_TABLE.lock().slots[CURRENT.load(Ordering::Acquire)].brk
}

pub fn set_current_brk(new_brk: u32) {
    TASK_TABLE.lock().slots[CURRENT.load(Ordering::Acquire)].brk = new_brk;
}

fn current_index() -> usize {
    CURRENT.load(Ordering::Acquire)
}

/// Selects the next task to run: among READY tasks (excluding current),
/// the largest `ticks`, ties broken by smaller `jiffies` (`spec.md` §4.2
/// "Selection"). Returns `None` if no other READY task exists (caller
/// falls back to the idle task, index 0 by convention).
fn pick_next(table: &TaskTable, exclude: usize) -> Option<usize> {
    table
        .slots
        .iter()
        .enumerate()
        .filter(|(i, t)| *i != exclude && t.in_use() && t.state == TaskState::Ready)
        .max_by(|(_, a), (_, b)| {
            a.ticks.cmp(&b.ticks).then_with(|| b.jiffies.cmp(&a.jiffies))
        })
        .map(|(i, _)| i)
}

/// Re-enters the scheduler: picks a new task, flips RUNNING -> READY on the
/// outgoing task (unless it already left RUNNING, e.g. it just blocked),
/// flips the incoming task READY -> RUNNING, and performs the register-save
/// context switch.
///
/// # Safety
/// Must be called with interrupts already in the state the caller intends
/// to resume with; performs a raw stack switch.
pub unsafe fn schedule() {
    let outgoing = current_index();
    let incoming = {
        let mut table = TASK_TABLE.lock();
        if table.slots[outgoing].state == TaskState::Running {
            table.slots[outgoing].state = TaskState::Ready;
        }
        let next = pick_next(&table, outgoing).unwrap_or(IDLE_TASK_INDEX);
        table.slots[next].state = TaskState::Running;
        next
    };
    if incoming == outgoing {
        return;
    }
    CURRENT.store(incoming, Ordering::Release);
    let (old_stack_ptr, new_stack, new_pde, new_esp0) = {
        let table = TASK_TABLE.lock();
        (
            &table.slots[outgoing].stack as *const u32 as *mut u32,
            table.slots[incoming].stack,
            table.slots[incoming].pde,
            table.slots[incoming].tcb_page + crate::config::KERNEL_STACK_SIZE as u32,
        )
    };
    crate::arch::cpu::load_cr3(new_pde);
    crate::arch::tss::set_kernel_stack(new_esp0);
    context_switch(old_stack_ptr, new_stack);
}

/// Saves `ebx, esi, edi, ebp, eip` onto the outgoing stack, stores the
/// resulting SP into `*old_stack_slot`, loads SP from `new_stack`, and pops
/// the same frame to resume (`spec.md` §4.2: "Per-task stack discipline").
///
/// # Safety
/// `old_stack_slot` must point at the outgoing TCB's `stack` field;
/// `new_stack` must be a value previously saved the same way (or built by
/// `task_to_user_mode`/`fork`'s child-stack setup).
unsafe fn context_switch(old_stack_slot: *mut u32, new_stack: u32) {
    core::arch::asm!(
        "pushfd",
        "push ebp",
        "push ebx",
        "push esi",
        "push edi",
        "mov [{old}], esp",
        "mov esp, {new}",
        "pop edi",
        "pop esi",
        "pop ebx",
        "pop ebp",
        "popfd",
        old = in(reg) old_stack_slot,
        new = in(reg) new_stack,
        options(nostack),
    );
}

/// Index of the idle task, always slot 0, installed at bring-up.
const IDLE_TASK_INDEX: usize = 0;

/// Installs the idle task into slot 0. Called once from `boot::start`.
pub fn install_idle_task(tcb_page: u32, kernel_pde: u32) {
    let mut table = TASK_TABLE.lock();
    table.slots[IDLE_TASK_INDEX] = Tcb {
        magic: TCB_MAGIC,
        pid: 0,
        ppid: 0,
        uid: KERNEL_USER,
        state: TaskState::Running,
        priority: 0,
        ticks: 0,
        jiffies: 0,
        pde: kernel_pde,
        vmap_base_page: 0,
        brk: 0,
        stack: 0,
        node: ListNode::detached(),
        waitpid: -1,
        status: 0,
        tcb_page,
    };
}

/// Blocks the current task onto `list` with the given state (must not be
/// READY/RUNNING, `spec.md` §4.2) and re-enters the scheduler. Caller must
/// already have interrupts disabled.
pub fn task_block(idx: usize, list: &'static WaitList, state: TaskState) {
    debug_assert!(state != TaskState::Ready && state != TaskState::Running);
    {
        let mut table = TASK_TABLE.lock();
        table.slots[idx].state = state;
        list_insert(&mut table, list, idx);
    }
    if idx == current_index() {
        unsafe { schedule() };
    }
}

/// Convenience for the common case: block the running task on `list` as
/// BLOCKED (`spec.md`'s default list/state for mutex contention).
pub fn task_block_current(list: &'static WaitList) {
    task_block(current_index(), list, TaskState::Blocked);
}

/// Removes `idx` from whatever list it sits on and flips it READY
/// (`spec.md` §4.2: "task_unlock"). Caller must already have interrupts
/// disabled.
pub fn task_unblock(idx: usize, list: &'static WaitList) {
    let mut table = TASK_TABLE.lock();
    list_remove(&mut table, list, idx);
    table.slots[idx].state = TaskState::Ready;
}

/// Pops and unblocks the head of `list`, if any.
pub fn task_unblock_head(list: &'static WaitList) {
    let mut table = TASK_TABLE.lock();
    if let Some(idx) = list_pop_head(&mut table, list) {
        table.slots[idx].state = TaskState::Ready;
    }
}

/// Voluntarily re-enters the scheduler without changing state (syscall
/// `YIELD`, and the tail of `RawMutex::unlock`).
pub fn yield_now() {
    unsafe { schedule() };
}

/// Converts `ms` to ticks at the configured timer frequency, at least 1.
fn ms_to_ticks(ms: u32) -> i32 {
    let ticks = (ms as u64 * crate::config::TIMER_HZ as u64) / 1000;
    ticks.max(1) as i32
}

/// Blocks the current task until at least `ms` milliseconds have elapsed
/// (`spec.md` §4.2 "Sleep").
pub fn task_sleep(ms: u32) {
    let idx = current_index();
    let restore = crate::arch::interrupt_disable();
    let wake_tick = JIFFIES.load(Ordering::Acquire) as i64 + ms_to_ticks(ms) as i64;
    {
        let mut table = TASK_TABLE.lock();
        table.slots[idx].ticks = wake_tick as i32;
        table.slots[idx].state = TaskState::Sleeping;
        list_insert(&mut table, &SLEEP_LIST, idx);
    }
    unsafe { schedule() };
    crate::arch::set_interrupt_state(restore);
}

/// Walks the sleep list from the head, unblocking every task whose
/// wake-tick has passed (`spec.md` §4.2 "task_wakeup", called from the
/// clock handler).
fn task_wakeup() {
    let now = JIFFIES.load(Ordering::Acquire) as i64;
    let mut table = TASK_TABLE.lock();
    loop {
        let head = SLEEP_LIST.state.lock().head;
        match head {
            Some(idx) if (table.slots[idx].ticks as i64) <= now => {
                list_remove(&mut table, &SLEEP_LIST, idx);
                table.slots[idx].state = TaskState::Ready;
            }
            _ => break,
        }
    }
}

/// Called from the PIT IRQ handler: wakes sleepers, advances `jiffies`,
/// decrements the current task's quantum, and re-enters the scheduler once
/// it expires (`spec.md` §4.8 "Clock").
pub fn on_timer_tick() {
    task_wakeup();
    JIFFIES.fetch_add(1, Ordering::AcqRel);
    let idx = current_index();
    let expired = {
        let mut table = TASK_TABLE.lock();
        table.slots[idx].ticks -= 1;
        if table.slots[idx].ticks <= 0 {
            table.slots[idx].ticks = table.slots[idx].priority as i32;
            true
        } else {
            false
        }
    };
    if expired {
        unsafe { schedule() };
    }
}

/// Current jiffies (`spec.md` glossary: "global tick counter").
pub fn jiffies() -> u64 {
    JIFFIES.load(Ordering::Acquire)
}

/// Allocates a child TCB slot, clones the parent's address space via
/// `copy_pde`, and copies the parent TCB verbatim before fixing up
/// identity/scheduling fields (`spec.md` §4.2 "Fork"). Returns the child's
/// pid (parent's return value) — the child resumes separately via its own
/// saved stack, returning 0 from the same syscall site.
pub fn task_fork() -> i32 {
    let parent_idx = current_index();

    // Address-space clone happens outside any lock since it may allocate
    // (and thus, per `spec.md` §5, may yield).
    let parent_pde = TASK_TABLE.lock().slots[parent_idx].pde;
    let child_pde = unsafe { crate::mm::fork_address_space(parent_pde) };

    let child_tcb_page = crate::mm::alloc_kpage(1).unwrap_or_else(|_| crate::panic_fatal!("fork: out of kernel VA for TCB"));

    let restore = crate::arch::interrupt_disable();
    let child_idx = {
        let mut table = TASK_TABLE.lock();
        let idx = table.find_free_slot().unwrap_or_else(|| crate::panic_fatal!("fork: no free task slot"));
        let mut child = table.slots[parent_idx];
        let child_pid = NEXT_PID.fetch_add(1, Ordering::AcqRel) as u32;
        child.magic = TCB_MAGIC;
        child.pid = child_pid;
        child.ppid = table.slots[parent_idx].pid;
        child.state = TaskState::Ready;
        child.ticks = child.priority as i32;
        child.pde = child_pde;
        child.tcb_page = child_tcb_page;
        child.node = ListNode::detached();
        child.waitpid = -1;
        // Child's first resume must return 0 from the syscall site with a
        // fresh kernel stack built the same shape `context_switch` expects.
        child.stack = unsafe {
            build_child_entry_stack(child_tcb_page, table.slots[parent_idx].stack)
        };
        table.slots[idx] = child;
        idx
    };
    crate::arch::set_interrupt_state(restore);
    TASK_TABLE.lock().slots[child_idx].pid as i32
}

/// Builds a kernel stack for a freshly forked child so that the next
/// `context_switch` into it resumes at a small trampoline that returns 0 in
/// EAX from the syscall path rather than replaying the parent's saved EIP
/// (which would re-fork infinitely). The trampoline address is the
/// assembly label `fork_child_trampoline`, defined alongside the syscall
/// return path in `syscall::mod`.
///
/// # Safety
/// `tcb_page` must be a freshly allocated, mapped page at least
/// `config::KERNEL_STACK_SIZE` bytes.
unsafe fn build_child_entry_stack(tcb_page: u32, _parent_stack: u32) -> u32 {
    let top = tcb_page + crate::config::KERNEL_STACK_SIZE as u32;
    let mut sp = top;
    sp -= 4;
    core::ptr::write(sp as *mut u32, crate::syscall::fork_child_trampoline as usize as u32); // eip
    sp -= 4;
    core::ptr::write(sp as *mut u32, 0); // ebx
    sp -= 4;
    core::ptr::write(sp as *mut u32, 0); // esi
    sp -= 4;
    core::ptr::write(sp as *mut u32, 0); // edi
    sp -= 4;
    core::ptr::write(sp as *mut u32, 0); // ebp
    sp -= 4;
    core::ptr::write(sp as *mut u32, 0x0000_0200); // eflags, IF set
    sp
}

/// Tears down the current task's user address space and frames, reparents
/// its children, wakes a waiting parent if any, and never returns
/// (`spec.md` §4.2 "Exit").
pub fn task_exit(status: i32) -> ! {
    let idx = current_index();
    let restore = crate::arch::interrupt_disable();
    let (pde, ppid, pid) = {
        let table = TASK_TABLE.lock();
        (table.slots[idx].pde, table.slots[idx].ppid, table.slots[idx].pid)
    };
    unsafe { crate::mm::teardown_address_space(pde) };
    {
        let mut table = TASK_TABLE.lock();
        table.reparent_children(pid, table.slots[idx].ppid);
        table.slots[idx].state = TaskState::Died;
        table.slots[idx].status = status;
    }
    // If the parent is WAITING on this pid (or any), wake it.
    {
        let mut table = TASK_TABLE.lock();
        if let Some(parent_idx) = table.index_by_pid(ppid) {
            let waiting_for_this = table.slots[parent_idx].state == TaskState::Waiting
                && (table.slots[parent_idx].waitpid == -1 || table.slots[parent_idx].waitpid as u32 == pid);
            if waiting_for_this {
                list_remove(&mut table, &BLOCK_LIST, parent_idx);
                table.slots[parent_idx].state = TaskState::Ready;
            }
        }
    }
    crate::arch::set_interrupt_state(restore);
    unsafe { schedule() };
    unreachable!("task_exit: schedule() returned into a DIED task");
}

/// Scans for a DIED child matching `pid` (`-1` = any); reclaims it if
/// found, else blocks WAITING and restarts the scan on resume; returns `-1`
/// if no matching child exists at all (`spec.md` §4.2 "Wait").
pub fn task_waitpid(pid: i32, status_out: &mut i32) -> i32 {
    loop {
        let idx = current_index();
        let restore = crate::arch::interrupt_disable();
        let outcome = {
            let mut table = TASK_TABLE.lock();
            let ppid = table.slots[idx].pid;
            if let Some(child_idx) = table.find_died_child(ppid, pid) {
                let reaped_pid = table.slots[child_idx].pid as i32;
                *status_out = table.slots[child_idx].status;
                crate::mm::free_kpage(table.slots[child_idx].tcb_page, 1);
                table.slots[child_idx] = Tcb::empty();
                Some(reaped_pid)
            } else if table.has_live_child(ppid, pid) {
                table.slots[idx].waitpid = pid;
                table.slots[idx].state = TaskState::Waiting;
                list_insert(&mut table, &BLOCK_LIST, idx);
                None
            } else {
                Some(-1)
            }
        };
        match outcome {
            Some(result) => {
                crate::arch::set_interrupt_state(restore);
                return result;
            }
            None => {
                unsafe { schedule() };
                crate::arch::set_interrupt_state(restore);
            }
        }
    }
}

/// Builds an interrupt-return frame on the current kernel stack describing
/// a fresh user context and jumps to the shared interrupt-exit path
/// (`spec.md` §4.2 "task_to_user_mode"). Never returns to its caller in the
/// ordinary sense: control resumes in ring 3 at `entry`.
///
/// # Safety
/// `entry` must be a valid ring-3-executable address in the task's own
/// (just `copy_pde`'d / freshly mapped) address space; `user_stack_top`
/// must already be backed (demand-paged on first touch is fine).
pub unsafe fn task_to_user_mode(entry: u32, user_stack_top: u32) -> ! {
    use crate::arch::gdt::{USER_CODE_SEL, USER_DATA_SEL};
    const EFLAGS_IF: u32 = 1 << 9;
    core::arch::asm!(
        "push {ss}",
        "push {esp}",
        "push {eflags}",
        "push {cs}",
        "push {eip}",
        "mov ax, {ds}",
        "mov ds, ax",
        "mov es, ax",
        "mov fs, ax",
        "mov gs, ax",
        "iretd",
        ss = in(reg) USER_DATA_SEL as u32,
        esp = in(reg) user_stack_top,
        eflags = in(reg) EFLAGS_IF,
        cs = in(reg) USER_CODE_SEL as u32,
        eip = in(reg) entry,
        ds = in(reg) USER_DATA_SEL as u32,
        options(noreturn),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ms_to_ticks_rounds_down_but_never_zero() {
        assert_eq!(ms_to_ticks(1), 1);
        assert_eq!(ms_to_ticks(500), 50);
        assert_eq!(ms_to_ticks(10), 1);
    }

    #[test]
    fn pick_next_prefers_larger_ticks_then_older_jiffies() {
        let mut table = TaskTable::new();
        table.slots[0].magic = TCB_MAGIC;
        table.slots[0].state = TaskState::Running;
        table.slots[1].magic = TCB_MAGIC;
        table.slots[1].state = TaskState::Ready;
        table.slots[1].ticks = 5;
        table.slots[1].jiffies = 10;
        table.slots[2].magic = TCB_MAGIC;
        table.slots[2].state = TaskState::Ready;
        table.slots[2].ticks = 5;
        table.slots[2].jiffies = 3;
        // Tie on ticks: task 2 has smaller jiffies (older), so it wins.
        assert_eq!(pick_next(&table, 0), Some(2));
    }

    #[test]
    fn pick_next_excludes_current_and_non_ready() {
        let mut table = TaskTable::new();
        table.slots[0].magic = TCB_MAGIC;
        table.slots[0].state = TaskState::Running;
        table.slots[0].ticks = 99;
        assert_eq!(pick_next(&table, 0), None);
    }
}
