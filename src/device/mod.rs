//! Device abstraction and block-request serialization (`spec.md` §4.5,
//! component K).
//!
//! The device table replaces an object hierarchy with function-pointer
//! records (`spec.md` §9 "Inheritance/dispatch"); grounded on the teacher's
//! `device::table`, which uses the same flat-array-of-op-records pattern for
//! its block/char device split.

use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

use crate::config::MAX_DEVICES;
use crate::error::Errno;
use crate::sched::scheduler::WaitList;

/// `spec.md` §3: "type ∈ {NULL, BLOCK, CHAR}".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceType {
    #[default]
    Null,
    Block,
    Char,
}

/// What a `device_find` subtype search matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSubtype {
    IdeDisk,
    IdePartition,
    NvmeNamespace,
    NvmePartition,
    Console,
    Keyboard,
    Rtc,
}

/// Kind of block transfer (`spec.md` §3 "Block request").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    Write,
}

/// ioctl op codes the device layer itself understands (driver-specific ops
/// are out of scope for `spec.md`'s core).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ioctl {
    SectorStart,
}

/// Function-pointer record one driver installs per device, in place of a
/// vtable/trait object (`spec.md` §9).
#[derive(Clone, Copy)]
pub struct DeviceOps {
    pub read: Option<fn(dev: usize, buf: &mut [u8], sector: u64, count: u32) -> Result<(), Errno>>,
    pub write: Option<fn(dev: usize, buf: &[u8], sector: u64, count: u32) -> Result<(), Errno>>,
    pub ioctl: Option<fn(dev: usize, op: Ioctl, arg: u64) -> u64>,
}

impl DeviceOps {
    pub const NONE: Self = Self { read: None, write: None, ioctl: None };
}

/// One slot in the global device table (`spec.md` §3 "Device table").
#[derive(Clone, Copy)]
pub struct Device {
    pub in_use: bool,
    pub dev_type: DeviceType,
    pub subtype: Option<DeviceSubtype>,
    pub parent_dev: Option<usize>,
    pub ops: DeviceOps,
    pub driver_private: usize,
}

impl Device {
    const fn empty() -> Self {
        Self {
            in_use: false,
            dev_type: DeviceType::Null,
            subtype: None,
            parent_dev: None,
            ops: DeviceOps::NONE,
            driver_private: 0,
        }
    }
}

static DEVICES: Mutex<[Device; MAX_DEVICES]> = Mutex::new([Device::empty(); MAX_DEVICES]);

/// Per-device outstanding-request queue state: just enough to serialize
/// completions in FIFO order (`spec.md` §4.5 invariants). Each device's
/// queue is a single `WaitList`; whichever task is at its head either holds
/// the in-flight request or is waiting for its turn.
struct DeviceQueue {
    waiters: WaitList,
    depth: AtomicUsize,
}

impl DeviceQueue {
    const fn new() -> Self {
        Self { waiters: WaitList::new(), depth: AtomicUsize::new(0) }
    }
}

static QUEUES: [DeviceQueue; MAX_DEVICES] = {
    const INIT: DeviceQueue = DeviceQueue::new();
    [INIT; MAX_DEVICES]
};

/// Claims the first empty slot and installs `ops` (`spec.md` §4.5
/// "device_install claims an empty slot"). Fatal if the table is full —
/// `spec.md` §7 treats "unknown device"/impossible-state conditions as
/// fatal assertions, and a full device table at bring-up is the same class
/// of misconfiguration.
pub fn device_install(dev_type: DeviceType, subtype: DeviceSubtype, parent_dev: Option<usize>, ops: DeviceOps) -> usize {
    let mut devices = DEVICES.lock();
    let slot = devices
        .iter()
        .position(|d| !d.in_use)
        .unwrap_or_else(|| crate::panic_fatal!("device table full"));
    devices[slot] = Device { in_use: true, dev_type, subtype: Some(subtype), parent_dev, ops, driver_private: 0 };
    slot
}

/// Walks the table by subtype, returning the `nth` match (0-based).
pub fn device_find(subtype: DeviceSubtype, nth: usize) -> Option<usize> {
    DEVICES.lock().iter().enumerate().filter(|(_, d)| d.in_use && d.subtype == Some(subtype)).nth(nth).map(|(i, _)| i)
}

pub fn device_parent(dev: usize) -> Option<usize> {
    DEVICES.lock()[dev].parent_dev
}

fn device_ops(dev: usize) -> DeviceOps {
    DEVICES.lock()[dev].ops
}

/// Serializes one block transfer through `dev`'s queue (`spec.md` §4.5
/// "Block request serialization"):
/// 1. Resolve partitions to their parent device, translating the sector
///    offset via `ioctl(SectorStart)`.
/// 2. Enqueue (logically — there is no heap-allocated request record here
///    since the calling task's own stack frame holds the buffer; the
///    queue tracks task ordering, not allocated records, while preserving
///    the same FIFO/blocking behavior `spec.md` specifies).
/// 3. Block if the queue wasn't empty.
/// 4. Call the driver synchronously.
/// 5. Dequeue and unblock the new head, if any.
pub fn device_request(dev: usize, buf: &mut [u8], sector: u64, count: u32, kind: RequestKind) -> Result<(), Errno> {
    let (resolved_dev, resolved_sector) = resolve_partition(dev, sector);
    let queue = &QUEUES[resolved_dev];

    let restore = crate::arch::interrupt_disable();
    let was_empty = queue.depth.fetch_add(1, Ordering::AcqRel) == 0;
    if !was_empty {
        // Still disabled: a concurrent completion can't dequeue and unblock
        // the new head before we've registered on `queue.waiters`.
        crate::sched::scheduler::task_block_current(&queue.waiters);
    }
    crate::arch::set_interrupt_state(restore);

    let ops = device_ops(resolved_dev);
    let result = match kind {
        RequestKind::Read => {
            ops.read.ok_or(Errno::EINVAL).and_then(|f| f(resolved_dev, buf, resolved_sector, count))
        }
        RequestKind::Write => {
            ops.write.ok_or(Errno::EINVAL).and_then(|f| f(resolved_dev, buf, resolved_sector, count))
        }
    };

    queue.depth.fetch_sub(1, Ordering::AcqRel);
    crate::sched::scheduler::task_unblock_head(&queue.waiters);
    result
}

fn resolve_partition(dev: usize, sector: u64) -> (usize, u64) {
    match device_parent(dev) {
        Some(parent) => {
            let offset = device_ops(dev).ioctl.map(|f| f(dev, Ioctl::SectorStart, 0)).unwrap_or(0);
            (parent, sector + offset)
        }
        None => (dev, sector),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_read(_: usize, _: &mut [u8], _: u64, _: u32) -> Result<(), Errno> {
        Ok(())
    }

    #[test]
    fn install_then_find_round_trips() {
        let ops = DeviceOps { read: Some(noop_read), write: None, ioctl: None };
        let idx = device_install(DeviceType::Block, DeviceSubtype::IdeDisk, None, ops);
        assert_eq!(device_find(DeviceSubtype::IdeDisk, 0), Some(idx));
    }

    #[test]
    fn resolve_partition_passes_through_when_no_parent() {
        let ops = DeviceOps { read: Some(noop_read), write: None, ioctl: None };
        let idx = device_install(DeviceType::Block, DeviceSubtype::NvmeNamespace, None, ops);
        assert_eq!(resolve_partition(idx, 5), (idx, 5));
    }
}
