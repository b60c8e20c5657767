//! Task Control Block (`spec.md` §3/§4's component H): one page per task,
//! TCB at the base, kernel stack growing down inside the same page.
//!
//! Grounded on the teacher's `sched::task` TCB layout, generalized from its
//! cooperative green-thread model to the priority-with-aging preemptive
//! model `spec.md` §4.2 describes.

use crate::config::MAX_TASKS;

pub const TCB_MAGIC: u32 = 0x7A5C_71CB;
pub const KERNEL_USER: u32 = 0;

/// Lifecycle state of a task (`spec.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Blocked,
    Sleeping,
    Waiting,
    Died,
}

/// Intrusive doubly-linked list node embedded in the TCB. `next == prev ==
/// None` means "not queued" (`spec.md` §8: "Single-list invariant").
#[derive(Debug, Clone, Copy, Default)]
pub struct ListNode {
    pub next: Option<usize>,
    pub prev: Option<usize>,
}

impl ListNode {
    pub const fn detached() -> Self {
        Self { next: None, prev: None }
    }

    pub fn is_queued(&self) -> bool {
        self.next.is_some() || self.prev.is_some()
    }
}

/// One task's control block. Lives at the base of its own page; identified
/// by its index into the global task table (`spec.md` §3: "fixed-size
/// table").
#[derive(Debug, Clone, Copy)]
pub struct Tcb {
    pub magic: u32,
    pub pid: u32,
    pub ppid: u32,
    pub uid: u32,
    pub state: TaskState,
    pub priority: u8,
    pub ticks: i32,
    pub jiffies: u64,
    pub pde: u32,
    pub vmap_base_page: usize,
    pub brk: u32,
    pub stack: u32,
    pub node: ListNode,
    pub waitpid: i32,
    pub status: i32,
    pub tcb_page: u32,
}

impl Tcb {
    /// A zeroed, unused slot. `magic` is 0 rather than [`TCB_MAGIC`] so a
    /// corrupted live TCB (whose magic was stomped) is distinguishable from
    /// a slot that was never allocated.
    pub const fn empty() -> Self {
        Self {
            magic: 0,
            pid: 0,
            ppid: 0,
            uid: KERNEL_USER,
            state: TaskState::Died,
            priority: 0,
            ticks: 0,
            jiffies: 0,
            pde: 0,
            vmap_base_page: 0,
            brk: 0,
            stack: 0,
            node: ListNode::detached(),
            waitpid: -1,
            status: 0,
            tcb_page: 0,
        }
    }

    /// Whether this slot holds a live (possibly DIED-but-unreaped) task.
    pub fn in_use(&self) -> bool {
        self.magic == TCB_MAGIC
    }
}

/// The global, fixed-capacity task table (`spec.md` §3: "Lifecycle: TCBs are
/// allocated from a fixed-size table at fork, freed only when the parent
/// reaps via wait").
pub struct TaskTable {
    pub slots: [Tcb; MAX_TASKS],
}

impl TaskTable {
    pub const fn new() -> Self {
        Self { slots: [Tcb::empty(); MAX_TASKS] }
    }

    /// Finds the first unused slot, for `fork`. `spec.md` §4.1: "allocation
    /// failure (out of frames / no free task slot)" is fatal, so callers
    /// convert `None` via [`crate::panic_fatal`] themselves.
    pub fn find_free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|t| !t.in_use())
    }

    /// Finds a DIED child of `ppid` matching `pid` (`-1` matches any child).
    pub fn find_died_child(&self, ppid: u32, pid: i32) -> Option<usize> {
        self.slots.iter().position(|t| {
            t.in_use() && t.ppid == ppid && t.state == TaskState::Died && (pid == -1 || t.pid as i32 == pid)
        })
    }

    /// Whether any live (non-DIED) child of `ppid` matches `pid`.
    pub fn has_live_child(&self, ppid: u32, pid: i32) -> bool {
        self.slots
            .iter()
            .any(|t| t.in_use() && t.ppid == ppid && t.state != TaskState::Died && (pid == -1 || t.pid as i32 == pid))
    }

    /// Reparents every child of `old_ppid` to `new_ppid` (`spec.md` §4.2:
    /// "Exit: Reparent children to grandparent").
    pub fn reparent_children(&mut self, old_ppid: u32, new_ppid: u32) {
        for t in self.slots.iter_mut() {
            if t.in_use() && t.ppid == old_ppid {
                t.ppid = new_ppid;
            }
        }
    }

    pub fn index_by_pid(&self, pid: u32) -> Option<usize> {
        self.slots.iter().position(|t| t.in_use() && t.pid == pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_slot_is_not_in_use() {
        assert!(!Tcb::empty().in_use());
    }

    #[test]
    fn find_free_slot_skips_live_tasks() {
        let mut table = TaskTable::new();
        table.slots[0].magic = TCB_MAGIC;
        assert_eq!(table.find_free_slot(), Some(1));
    }

    #[test]
    fn died_child_lookup_matches_pid_or_wildcard() {
        let mut table = TaskTable::new();
        table.slots[2].magic = TCB_MAGIC;
        table.slots[2].ppid = 1;
        table.slots[2].pid = 42;
        table.slots[2].state = TaskState::Died;
        assert_eq!(table.find_died_child(1, 42), Some(2));
        assert_eq!(table.find_died_child(1, -1), Some(2));
        assert_eq!(table.find_died_child(1, 7), None);
    }

    #[test]
    fn reparent_moves_children_to_grandparent() {
        let mut table = TaskTable::new();
        table.slots[0].magic = TCB_MAGIC;
        table.slots[0].ppid = 5;
        table.reparent_children(5, 1);
        assert_eq!(table.slots[0].ppid, 1);
    }
}
