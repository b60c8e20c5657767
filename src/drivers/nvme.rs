//! NVMe driver (`spec.md` §4.7, component M): PCI discovery, controller
//! bring-up, the admin/IO submission-and-completion-queue protocol, and
//! bounce-buffered namespace I/O.
//!
//! Grounded on the teacher's `arch::x86_64::pci` + `drivers::nvme` pair: PCI
//! discovery is a near-verbatim reuse of [`crate::arch::pci`], while the
//! queue/doorbell/phase-bit bookkeeping follows the teacher's own NVMe
//! module, adapted from its 64-bit PRP-list-capable transfers down to this
//! kernel's simpler one-page-per-command bounce-buffer scheme.

use spin::Mutex;

use crate::arch::pci::{self, PciAddress};
use crate::config::MAX_DEVICES;
use crate::device::{device_install, DeviceOps, DeviceSubtype, DeviceType, Ioctl};
use crate::drivers::mbr;
use crate::error::Errno;
use crate::mm::paging::PteFlags;
use crate::sched::mutex::RawMutex;

const NVME_MMIO_VA: u32 = 0xFFA0_2000;
const MMIO_PAGES: u32 = 4; // 16 KiB identity window (`spec.md` §4.7 step 1)

const REG_CAP_LO: u32 = 0x00;
const REG_CAP_HI: u32 = 0x04;
const REG_CC: u32 = 0x14;
const REG_CSTS: u32 = 0x1C;
const REG_AQA: u32 = 0x24;
const REG_ASQ: u32 = 0x28;
const REG_ACQ: u32 = 0x30;
const DOORBELL_BASE: u32 = 0x1000;

const CC_EN: u32 = 1 << 0;
const CSTS_RDY: u32 = 1 << 0;

const ADMIN_QUEUE_DEPTH: u16 = 16;
const IO_QUEUE_DEPTH: u16 = 16;

const OPC_ADMIN_CREATE_IO_SQ: u8 = 0x01;
const OPC_ADMIN_CREATE_IO_CQ: u8 = 0x05;
const OPC_ADMIN_IDENTIFY: u8 = 0x06;
const OPC_NVM_WRITE: u8 = 0x01;
const OPC_NVM_READ: u8 = 0x02;

const SECTOR_SIZE: usize = 512;
const SECTORS_PER_COMMAND: usize = 8; // one 4 KiB bounce page

/// One 64-byte submission queue entry, laid out per the NVMe base spec
/// (`spec.md` §4.7: "submission entries 64 B").
#[repr(C)]
#[derive(Clone, Copy)]
struct SqEntry {
    dw: [u32; 16],
}

impl SqEntry {
    const fn zeroed() -> Self {
        Self { dw: [0; 16] }
    }

    fn set_opcode_cid(&mut self, opcode: u8, cid: u16) {
        self.dw[0] = opcode as u32 | ((cid as u32) << 16);
    }

    fn set_nsid(&mut self, nsid: u32) {
        self.dw[1] = nsid;
    }

    fn set_prp1(&mut self, addr: u32) {
        self.dw[6] = addr;
        self.dw[7] = 0;
    }

    fn set_prp2(&mut self, addr: u32) {
        self.dw[8] = addr;
        self.dw[9] = 0;
    }

    fn set_cdw10(&mut self, v: u32) {
        self.dw[10] = v;
    }

    fn set_cdw11(&mut self, v: u32) {
        self.dw[11] = v;
    }

    fn set_slba(&mut self, lba: u64) {
        self.dw[10] = lba as u32;
        self.dw[11] = (lba >> 32) as u32;
    }
}

/// One 16-byte completion queue entry (`spec.md` §4.7: "completion entries
/// 16 B").
#[repr(C)]
#[derive(Clone, Copy)]
struct CqEntry {
    dw: [u32; 4],
}

impl CqEntry {
    fn cid(&self) -> u16 {
        (self.dw[3] & 0xFFFF) as u16
    }

    fn phase(&self) -> bool {
        (self.dw[3] >> 16) & 1 != 0
    }

    /// Status code, bits 1..9 of the status field (`spec.md` §4.7 step 4).
    fn status_code(&self) -> u8 {
        ((self.dw[3] >> 17) & 0xFF) as u8
    }

    /// Status type, bits 9..12 of the status field.
    fn status_type(&self) -> u8 {
        ((self.dw[3] >> 25) & 0x7) as u8
    }
}

/// One command queue pair's head/tail/phase bookkeeping (`spec.md` §3
/// "NVMe controller"). Admin and IO queues each get one.
struct Queue {
    sq_va: u32,
    cq_va: u32,
    depth: u16,
    sq_tail: u16,
    cq_head: u16,
    phase: bool,
    next_cid: u16,
}

impl Queue {
    fn sq_entry_mut(&mut self, idx: u16) -> &mut SqEntry {
        unsafe { &mut *((self.sq_va as *mut SqEntry).add(idx as usize)) }
    }

    fn cq_entry(&self, idx: u16) -> &CqEntry {
        unsafe { &*((self.cq_va as *const CqEntry).add(idx as usize)) }
    }

    fn alloc_cid(&mut self) -> u16 {
        let mut cid = self.next_cid.wrapping_add(1);
        if cid == 0 {
            cid = 1; // `spec.md` §4.7: "monotonic CID (skip 0 on wrap)"
        }
        self.next_cid = cid;
        cid
    }
}

struct Controller {
    mmio_va: u32,
    doorbell_stride: u32,
    admin: Mutex<Queue>,
    io: Mutex<Queue>,
    lock: RawMutex,
    bounce_page: u32,
    namespace_id: u32,
}

unsafe fn reg_read(ctrl_va: u32, offset: u32) -> u32 {
    core::ptr::read_volatile((ctrl_va + offset) as *const u32)
}

unsafe fn reg_write(ctrl_va: u32, offset: u32, value: u32) {
    core::ptr::write_volatile((ctrl_va + offset) as *mut u32, value);
}

unsafe fn sq_doorbell(ctrl_va: u32, stride: u32, qid: u16) -> u32 {
    ctrl_va + DOORBELL_BASE + (2 * qid as u32) * stride
}

unsafe fn cq_doorbell(ctrl_va: u32, stride: u32, qid: u16) -> u32 {
    ctrl_va + DOORBELL_BASE + (2 * qid as u32 + 1) * stride
}

/// Submits `entry` on `queue` as `qid`, polls for its completion by phase,
/// and returns the completion entry's status fields. This is the shared
/// protocol for both admin (qid 0) and IO (qid 1) queues (`spec.md` §4.7
/// "Command submission protocol").
unsafe fn submit_and_wait(
    ctrl_va: u32,
    stride: u32,
    qid: u16,
    queue: &mut Queue,
    mut entry: SqEntry,
) -> Result<(), Errno> {
    let cid = queue.alloc_cid();
    entry.dw[0] = (entry.dw[0] & 0xFFFF) | ((cid as u32) << 16);

    let tail = queue.sq_tail;
    *queue.sq_entry_mut(tail) = entry;
    queue.sq_tail = (tail + 1) % queue.depth;
    reg_write(ctrl_va, sq_doorbell(ctrl_va, stride, qid), queue.sq_tail as u32);

    let mut spins: u64 = 0;
    loop {
        let cqe = queue.cq_entry(queue.cq_head);
        if cqe.phase() == queue.phase {
            let (code, typ) = (cqe.status_code(), cqe.status_type());
            let head = (queue.cq_head + 1) % queue.depth;
            if head == 0 {
                queue.phase = !queue.phase;
            }
            queue.cq_head = head;
            reg_write(ctrl_va, cq_doorbell(ctrl_va, stride, qid), head as u32);
            if code != 0 || typ != 0 {
                log::warn!("nvme: command cid={} failed sc={} sct={}", cid, code, typ);
                return Err(Errno::EIO);
            }
            return Ok(());
        }
        spins += 1;
        if spins > 10_000_000 {
            log::warn!("nvme: command cid={} timed out", cid);
            return Err(Errno::EIO);
        }
        core::hint::spin_loop();
    }
}

/// Brings one discovered controller up per `spec.md` §4.7's seven-step
/// sequence, IDENTIFYs its first namespace, and installs partition devices.
///
/// # Safety
/// Must run with paging active; allocates and maps the controller's MMIO
/// window and queue pages itself.
unsafe fn bring_up(address: PciAddress, bar_phys: u32) -> Result<(), Errno> {
    for page in 0..MMIO_PAGES {
        crate::mm::map_page_fixed(NVME_MMIO_VA + page * 4096, bar_phys + page * 4096, PteFlags::WRITE);
    }
    let mmio_va = NVME_MMIO_VA;

    let cap_lo = reg_read(mmio_va, REG_CAP_LO);
    let cap_hi = reg_read(mmio_va, REG_CAP_HI);
    let dstrd = (cap_hi >> 4) & 0xF;
    let stride = 4u32 << dstrd;
    let _ = cap_lo;

    reg_write(mmio_va, REG_CC, 0);
    let mut spins = 0u64;
    while reg_read(mmio_va, REG_CSTS) & CSTS_RDY != 0 {
        spins += 1;
        if spins > 10_000_000 {
            return Err(Errno::EIO);
        }
        core::hint::spin_loop();
    }

    let admin_sq = crate::mm::alloc_kpage(1).unwrap_or_else(|_| crate::panic_fatal!("nvme: out of kernel VA for admin SQ"));
    let admin_cq = crate::mm::alloc_kpage(1).unwrap_or_else(|_| crate::panic_fatal!("nvme: out of kernel VA for admin CQ"));

    let aqa = ((ADMIN_QUEUE_DEPTH as u32 - 1) << 16) | (ADMIN_QUEUE_DEPTH as u32 - 1);
    reg_write(mmio_va, REG_AQA, aqa);
    reg_write(mmio_va, REG_ASQ, admin_sq);
    reg_write(mmio_va, REG_ACQ, admin_cq);

    // CC: EN=1, MPS=0 (4 KiB pages), IOSQES=6 (64 B), IOCQES=4 (16 B).
    let cc = CC_EN | (0 << 7) | (6 << 16) | (4 << 20);
    reg_write(mmio_va, REG_CC, cc);
    spins = 0;
    while reg_read(mmio_va, REG_CSTS) & CSTS_RDY == 0 {
        spins += 1;
        if spins > 10_000_000 {
            return Err(Errno::EIO);
        }
        core::hint::spin_loop();
    }

    let mut admin = Queue {
        sq_va: admin_sq,
        cq_va: admin_cq,
        depth: ADMIN_QUEUE_DEPTH,
        sq_tail: 0,
        cq_head: 0,
        phase: true,
        next_cid: 0,
    };

    let io_sq = crate::mm::alloc_kpage(1).unwrap_or_else(|_| crate::panic_fatal!("nvme: out of kernel VA for IO SQ"));
    let io_cq = crate::mm::alloc_kpage(1).unwrap_or_else(|_| crate::panic_fatal!("nvme: out of kernel VA for IO CQ"));

    let mut create_cq = SqEntry::zeroed();
    create_cq.set_opcode_cid(OPC_ADMIN_CREATE_IO_CQ, 0);
    create_cq.set_prp1(io_cq);
    create_cq.set_cdw10(1 | ((IO_QUEUE_DEPTH as u32 - 1) << 16));
    create_cq.set_cdw11(1); // PC=1, IEN=0
    submit_and_wait(mmio_va, stride, 0, &mut admin, create_cq)?;

    let mut create_sq = SqEntry::zeroed();
    create_sq.set_opcode_cid(OPC_ADMIN_CREATE_IO_SQ, 0);
    create_sq.set_prp1(io_sq);
    create_sq.set_cdw10(1 | ((IO_QUEUE_DEPTH as u32 - 1) << 16));
    create_sq.set_cdw11(1 | (1 << 16)); // PC=1, CQID=1
    submit_and_wait(mmio_va, stride, 0, &mut admin, create_sq)?;

    let io = Queue { sq_va: io_sq, cq_va: io_cq, depth: IO_QUEUE_DEPTH, sq_tail: 0, cq_head: 0, phase: true, next_cid: 0 };

    let identify_buf =
        crate::mm::alloc_kpage(1).unwrap_or_else(|_| crate::panic_fatal!("nvme: out of kernel VA for identify buffer"));
    let mut identify = SqEntry::zeroed();
    identify.set_opcode_cid(OPC_ADMIN_IDENTIFY, 0);
    identify.set_nsid(1);
    identify.set_prp1(identify_buf);
    identify.set_cdw10(0); // CNS=0: identify namespace
    submit_and_wait(mmio_va, stride, 0, &mut admin, identify)?;

    let nsze_hi = core::ptr::read_volatile((identify_buf + 4) as *const u32);
    if nsze_hi != 0 {
        log::warn!("nvme: namespace larger than 2^32 sectors, rejecting");
        crate::mm::free_kpage(identify_buf, 1);
        return Err(Errno::EIO);
    }
    let flbas = core::ptr::read_volatile((identify_buf + 26) as *const u8) & 0xF;
    let lbads = core::ptr::read_volatile((identify_buf + 128 + flbas as u32 * 4 + 2) as *const u8);
    let sector_size = 1usize << lbads;
    crate::mm::free_kpage(identify_buf, 1);
    if sector_size != SECTOR_SIZE {
        log::warn!("nvme: rejecting namespace with {}-byte sectors", sector_size);
        return Err(Errno::EIO);
    }

    let bounce_page =
        crate::mm::alloc_kpage(1).unwrap_or_else(|_| crate::panic_fatal!("nvme: out of kernel VA for bounce buffer"));

    let ctrl = Controller {
        mmio_va,
        doorbell_stride: stride,
        admin: Mutex::new(admin),
        io: Mutex::new(io),
        lock: RawMutex::new(),
        bounce_page,
        namespace_id: 1,
    };

    let ctrl_idx = {
        let mut table = CONTROLLERS.lock();
        let idx = table.len();
        table.push(ctrl).map_err(|_| Errno::EIO)?;
        idx
    };

    let ns_ops = DeviceOps { read: Some(ns_read), write: Some(ns_write), ioctl: None };
    let ns_dev = device_install(DeviceType::Block, DeviceSubtype::NvmeNamespace, None, ns_ops);
    NS_LOCATIONS.lock()[ns_dev] = ctrl_idx;

    let mut sector0 = [0u8; mbr::SECTOR_SIZE];
    if transfer(ctrl_idx, false, &mut sector0, 0, 1).is_ok() {
        if let Some(entries) = mbr::parse(&sector0) {
            for entry in entries.into_iter().flatten() {
                if entry.partition_type == mbr::PARTITION_TYPE_EXTENDED {
                    continue;
                }
                let part_ops = DeviceOps { read: Some(ns_read), write: Some(ns_write), ioctl: Some(part_ioctl) };
                let part_dev =
                    device_install(DeviceType::Block, DeviceSubtype::NvmePartition, Some(ns_dev), part_ops);
                NS_LOCATIONS.lock()[part_dev] = ctrl_idx;
                PARTITION_STARTS.lock()[part_dev] = entry.lba_start;
            }
        }
    }

    Ok(())
}

/// One command per call, bounded to one page (`spec.md` §4.7: "Transfers are
/// bounded to one page (8 × 512-byte sectors) per command").
fn transfer(ctrl_idx: usize, write: bool, buf: &mut [u8], lba: u64, sectors: u32) -> Result<(), Errno> {
    if sectors as usize > SECTORS_PER_COMMAND || buf.len() < sectors as usize * SECTOR_SIZE {
        return Err(Errno::EINVAL);
    }
    let table = CONTROLLERS.lock();
    let ctrl = table.get(ctrl_idx).ok_or(Errno::EIO)?;

    ctrl.lock.lock();
    let result = unsafe {
        if write {
            core::ptr::copy_nonoverlapping(
                buf.as_ptr(),
                ctrl.bounce_page as *mut u8,
                sectors as usize * SECTOR_SIZE,
            );
        }
        let mut entry = SqEntry::zeroed();
        entry.set_opcode_cid(if write { OPC_NVM_WRITE } else { OPC_NVM_READ }, 0);
        entry.set_nsid(ctrl.namespace_id);
        entry.set_prp1(ctrl.bounce_page);
        entry.set_slba(lba);
        entry.dw[12] = sectors.saturating_sub(1);
        let mut io = ctrl.io.lock();
        submit_and_wait(ctrl.mmio_va, ctrl.doorbell_stride, 1, &mut io, entry)
    };
    if result.is_ok() && !write {
        unsafe {
            core::ptr::copy_nonoverlapping(
                ctrl.bounce_page as *const u8,
                buf.as_mut_ptr(),
                sectors as usize * SECTOR_SIZE,
            );
        }
    }
    ctrl.lock.unlock();
    result
}

fn ns_read(dev: usize, buf: &mut [u8], sector: u64, count: u32) -> Result<(), Errno> {
    let ctrl_idx = NS_LOCATIONS.lock()[dev];
    transfer(ctrl_idx, false, buf, sector, count)
}

fn ns_write(dev: usize, buf: &[u8], sector: u64, count: u32) -> Result<(), Errno> {
    let ctrl_idx = NS_LOCATIONS.lock()[dev];
    let mut scratch = [0u8; SECTORS_PER_COMMAND * SECTOR_SIZE];
    scratch[..buf.len()].copy_from_slice(buf);
    transfer(ctrl_idx, true, &mut scratch, sector, count)
}

fn part_ioctl(dev: usize, op: Ioctl, _arg: u64) -> u64 {
    match op {
        Ioctl::SectorStart => PARTITION_STARTS.lock()[dev] as u64,
    }
}

const MAX_CONTROLLERS: usize = 4;

struct ControllerVec {
    items: [Option<Controller>; MAX_CONTROLLERS],
    len: usize,
}

impl ControllerVec {
    const fn new() -> Self {
        const NONE: Option<Controller> = None;
        Self { items: [NONE; MAX_CONTROLLERS], len: 0 }
    }

    fn len(&self) -> usize {
        self.len
    }

    fn push(&mut self, ctrl: Controller) -> Result<(), ()> {
        if self.len >= MAX_CONTROLLERS {
            return Err(());
        }
        self.items[self.len] = Some(ctrl);
        self.len += 1;
        Ok(())
    }

    fn get(&self, idx: usize) -> Option<&Controller> {
        self.items.get(idx).and_then(|c| c.as_ref())
    }
}

static CONTROLLERS: Mutex<ControllerVec> = Mutex::new(ControllerVec::new());
static NS_LOCATIONS: Mutex<[usize; MAX_DEVICES]> = Mutex::new([0; MAX_DEVICES]);
static PARTITION_STARTS: Mutex<[u32; MAX_DEVICES]> = Mutex::new([0; MAX_DEVICES]);

/// Walks PCI config space for a class `0x01/0x08/0x02` match, computes the
/// 64-bit BAR0 MMIO base (rejecting anything above 4 GiB on this 32-bit
/// target), enables Memory Space + Bus Master, and brings each match up
/// (`spec.md` §4.7 "Discovery").
///
/// # Safety
/// Must run once during device bring-up, with paging active.
pub unsafe fn init() {
    let mut matches: [Option<(PciAddress, u32)>; MAX_CONTROLLERS] = [None; MAX_CONTROLLERS];
    let mut found = 0usize;
    pci::scan(|dev| {
        if found >= MAX_CONTROLLERS {
            return;
        }
        if dev.class == pci::CLASS_MASS_STORAGE && dev.subclass == pci::SUBCLASS_NVME && dev.prog_if == pci::PROG_IF_NVME {
            matches[found] = Some((dev.address, 0));
            found += 1;
        }
    });

    for slot in matches.into_iter().take(found) {
        let Some((address, _)) = slot else { continue };
        let bar0 = address.read_u32(0x10);
        let bar1 = address.read_u32(0x14);
        let mem_type = (bar0 >> 1) & 0x3;
        let bar_phys: u64 = if mem_type == 0b10 {
            ((bar1 as u64) << 32) | (bar0 & 0xFFFF_FFF0) as u64
        } else {
            (bar0 & 0xFFFF_FFF0) as u64
        };
        if bar_phys > u32::MAX as u64 {
            log::warn!("nvme: controller BAR above 4 GiB, rejecting");
            continue;
        }

        let command = address.read_u32(0x04);
        address.write_u32(0x04, command | 0x1 | 0x4); // Memory Space + Bus Master

        if let Err(e) = bring_up(address, bar_phys as u32) {
            log::warn!("nvme: controller bring-up failed: {:?}", e);
        }
    }
}
