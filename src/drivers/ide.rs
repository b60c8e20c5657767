//! ATA PIO (IDE) driver (`spec.md` §4.6, component L): two controllers, two
//! drives each, up to four MBR partitions per drive.
//!
//! Grounded on the teacher's `drivers::ata`, a PIO-only driver with the same
//! per-controller lock + wait-task shape; this kernel has no DMA engine in
//! scope, so bus-mastering is intentionally absent, matching the teacher's
//! own PIO-only implementation.

use spin::Mutex;

use crate::arch::cpu::{inb, inw, outb, outw};
use crate::device::{device_install, Device, DeviceOps, DeviceSubtype, DeviceType, Ioctl};
use crate::drivers::mbr;
use crate::error::Errno;
use crate::sched::mutex::RawMutex;
use crate::sched::scheduler::{self, WaitList};

const PRIMARY_IO_BASE: u16 = 0x1F0;
const PRIMARY_CTRL_BASE: u16 = 0x3F6;
const SECONDARY_IO_BASE: u16 = 0x170;
const SECONDARY_CTRL_BASE: u16 = 0x376;

const REG_DATA: u16 = 0;
const REG_ERROR: u16 = 1;
const REG_SECTOR_COUNT: u16 = 2;
const REG_LBA_LOW: u16 = 3;
const REG_LBA_MID: u16 = 4;
const REG_LBA_HIGH: u16 = 5;
const REG_DRIVE_HEAD: u16 = 6;
const REG_STATUS: u16 = 7;
const REG_COMMAND: u16 = 7;

const STATUS_ERR: u8 = 1 << 0;
const STATUS_DRQ: u8 = 1 << 3;
const STATUS_DRDY: u8 = 1 << 6;
const STATUS_BSY: u8 = 1 << 7;

const CMD_READ_SECTORS: u8 = 0x20;
const CMD_WRITE_SECTORS: u8 = 0x30;
const CMD_IDENTIFY: u8 = 0xEC;

const DRIVE_MASTER: u8 = 0xE0;
const DRIVE_SLAVE: u8 = 0xF0;

/// Per-controller state (`spec.md` §4.6: "Per-controller state includes
/// `{io_base, lock, wait_task, selected_disk}`").
struct Controller {
    io_base: u16,
    ctrl_base: u16,
    lock: RawMutex,
    irq_waiters: WaitList,
    selected_disk: Mutex<u8>,
}

impl Controller {
    const fn new(io_base: u16, ctrl_base: u16) -> Self {
        Self { io_base, ctrl_base, lock: RawMutex::new(), irq_waiters: WaitList::new(), selected_disk: Mutex::new(0) }
    }
}

static CONTROLLERS: [Controller; 2] =
    [Controller::new(PRIMARY_IO_BASE, PRIMARY_CTRL_BASE), Controller::new(SECONDARY_IO_BASE, SECONDARY_CTRL_BASE)];

struct DriveInfo {
    sectors: u64,
}

unsafe fn wait_not_busy(ctrl: &Controller) {
    while inb(ctrl.io_base + REG_STATUS) & STATUS_BSY != 0 {
        core::hint::spin_loop();
    }
}

unsafe fn wait_drdy(ctrl: &Controller) {
    while inb(ctrl.io_base + REG_STATUS) & STATUS_DRDY == 0 {
        core::hint::spin_loop();
    }
}

unsafe fn select_drive(ctrl: &Controller, drive: u8) {
    let mut selected = ctrl.selected_disk.lock();
    if *selected != drive {
        outb(ctrl.io_base + REG_DRIVE_HEAD, if drive == 0 { DRIVE_MASTER } else { DRIVE_SLAVE });
        crate::arch::cpu::io_wait();
        *selected = drive;
    }
}

/// Sends IDENTIFY and decodes the sector count (word 60/61 of the 256-word
/// response), or `None` if no drive answers.
unsafe fn identify(ctrl: &Controller, drive: u8) -> Option<DriveInfo> {
    select_drive(ctrl, drive);
    outb(ctrl.io_base + REG_SECTOR_COUNT, 0);
    outb(ctrl.io_base + REG_LBA_LOW, 0);
    outb(ctrl.io_base + REG_LBA_MID, 0);
    outb(ctrl.io_base + REG_LBA_HIGH, 0);
    outb(ctrl.io_base + REG_COMMAND, CMD_IDENTIFY);

    if inb(ctrl.io_base + REG_STATUS) == 0 {
        return None;
    }
    wait_not_busy(ctrl);
    if inb(ctrl.io_base + REG_LBA_MID) != 0 || inb(ctrl.io_base + REG_LBA_HIGH) != 0 {
        return None; // not ATA (likely ATAPI)
    }
    loop {
        let status = inb(ctrl.io_base + REG_STATUS);
        if status & STATUS_ERR != 0 {
            return None;
        }
        if status & STATUS_DRQ != 0 {
            break;
        }
    }
    let mut words = [0u16; 256];
    for w in words.iter_mut() {
        *w = inw(ctrl.io_base + REG_DATA);
    }
    let sectors = (words[61] as u64) << 16 | words[60] as u64;
    Some(DriveInfo { sectors })
}

unsafe fn program_lba28(ctrl: &Controller, drive: u8, lba: u32, count: u8) {
    outb(ctrl.io_base + REG_DRIVE_HEAD, (if drive == 0 { DRIVE_MASTER } else { DRIVE_SLAVE }) | ((lba >> 24) & 0x0F) as u8);
    outb(ctrl.io_base + REG_SECTOR_COUNT, count);
    outb(ctrl.io_base + REG_LBA_LOW, (lba & 0xFF) as u8);
    outb(ctrl.io_base + REG_LBA_MID, ((lba >> 8) & 0xFF) as u8);
    outb(ctrl.io_base + REG_LBA_HIGH, ((lba >> 16) & 0xFF) as u8);
}

/// Reads `count` sectors starting at `lba` into `buf` (`spec.md` §4.6
/// "Read/write protocol"): acquire the controller lock, select, wait DRDY,
/// program LBA/count, issue the command, then for each sector block on the
/// completion IRQ before pulling 256 words.
fn read_sectors(ctrl_idx: usize, drive: u8, lba: u32, count: u8, buf: &mut [u8]) -> Result<(), Errno> {
    let ctrl = &CONTROLLERS[ctrl_idx];
    ctrl.lock.lock();
    unsafe {
        select_drive(ctrl, drive);
        wait_drdy(ctrl);
        program_lba28(ctrl, drive, lba, count);
        outb(ctrl.io_base + REG_COMMAND, CMD_READ_SECTORS);

        for s in 0..count as usize {
            let restore = crate::arch::interrupt_disable();
            scheduler::task_block_current(&ctrl.irq_waiters);
            crate::arch::set_interrupt_state(restore);
            let status = inb(ctrl.io_base + REG_STATUS);
            if status & STATUS_ERR != 0 {
                let _ = inb(ctrl.io_base + REG_ERROR); // read but not propagated, spec.md §9
                log::warn!("ide: read error on controller {} drive {}", ctrl_idx, drive);
                ctrl.lock.unlock();
                return Err(Errno::EIO);
            }
            while inb(ctrl.io_base + REG_STATUS) & STATUS_DRQ == 0 {
                core::hint::spin_loop();
            }
            let sector_buf = &mut buf[s * mbr::SECTOR_SIZE..(s + 1) * mbr::SECTOR_SIZE];
            for chunk in sector_buf.chunks_mut(2) {
                let word = inw(ctrl.io_base + REG_DATA);
                chunk[0] = (word & 0xFF) as u8;
                chunk[1] = (word >> 8) as u8;
            }
        }
    }
    ctrl.lock.unlock();
    Ok(())
}

fn write_sectors(ctrl_idx: usize, drive: u8, lba: u32, count: u8, buf: &[u8]) -> Result<(), Errno> {
    let ctrl = &CONTROLLERS[ctrl_idx];
    ctrl.lock.lock();
    unsafe {
        select_drive(ctrl, drive);
        wait_drdy(ctrl);
        program_lba28(ctrl, drive, lba, count);
        outb(ctrl.io_base + REG_COMMAND, CMD_WRITE_SECTORS);

        for s in 0..count as usize {
            while inb(ctrl.io_base + REG_STATUS) & STATUS_DRQ == 0 {
                core::hint::spin_loop();
            }
            let sector_buf = &buf[s * mbr::SECTOR_SIZE..(s + 1) * mbr::SECTOR_SIZE];
            for chunk in sector_buf.chunks(2) {
                outw(ctrl.io_base + REG_DATA, u16::from_le_bytes([chunk[0], chunk[1]]));
            }
            let restore = crate::arch::interrupt_disable();
            scheduler::task_block_current(&ctrl.irq_waiters);
            crate::arch::set_interrupt_state(restore);
            if inb(ctrl.io_base + REG_STATUS) & STATUS_ERR != 0 {
                let _ = inb(ctrl.io_base + REG_ERROR);
                log::warn!("ide: write error on controller {} drive {}", ctrl_idx, drive);
                ctrl.lock.unlock();
                return Err(Errno::EIO);
            }
        }
    }
    ctrl.lock.unlock();
    Ok(())
}

/// Completion IRQ handler: acknowledges status, EOIs, and unblocks the
/// recorded waiter (`spec.md` §4.6). Registered once per controller against
/// IRQ14/IRQ15.
fn irq_handler(ctrl_idx: usize) {
    let ctrl = &CONTROLLERS[ctrl_idx];
    unsafe {
        let _ = inb(ctrl.io_base + REG_STATUS);
    }
    scheduler::task_unblock_head(&ctrl.irq_waiters);
}

pub fn irq14_handler(_frame: &mut crate::arch::TrapFrame) {
    irq_handler(0);
}

pub fn irq15_handler(_frame: &mut crate::arch::TrapFrame) {
    irq_handler(1);
}

fn disk_read(dev: usize, buf: &mut [u8], sector: u64, count: u32) -> Result<(), Errno> {
    let (ctrl_idx, drive) = DISK_LOCATIONS.lock()[dev];
    read_sectors(ctrl_idx, drive, sector as u32, count as u8, buf)
}

fn disk_write(dev: usize, buf: &[u8], sector: u64, count: u32) -> Result<(), Errno> {
    let (ctrl_idx, drive) = DISK_LOCATIONS.lock()[dev];
    write_sectors(ctrl_idx, drive, sector as u32, count as u8, buf)
}

fn partition_ioctl(dev: usize, op: Ioctl, _arg: u64) -> u64 {
    match op {
        Ioctl::SectorStart => PARTITION_STARTS.lock()[dev] as u64,
    }
}

use crate::config::MAX_DEVICES;
static DISK_LOCATIONS: Mutex<[(usize, u8); MAX_DEVICES]> = Mutex::new([(0, 0); MAX_DEVICES]);
static PARTITION_STARTS: Mutex<[u32; MAX_DEVICES]> = Mutex::new([0; MAX_DEVICES]);

/// Probes both controllers' master/slave drives, IDENTIFYs each that
/// responds, reads LBA 0, parses the MBR, and installs one device per live
/// partition parented to the disk device (`spec.md` §4.6).
///
/// # Safety
/// Must run once during device bring-up, with interrupts enabled (IDENTIFY
/// is polled, not IRQ-driven, so this part is safe either way, but reads
/// LBA 0 via the normal IRQ-driven path).
pub unsafe fn init() {
    crate::arch::idt::set_irq_handler(crate::arch::idt::IRQ_BASE + 14, irq14_handler);
    crate::arch::idt::set_irq_handler(crate::arch::idt::IRQ_BASE + 15, irq15_handler);
    crate::arch::apic::unmask_irq(14);
    crate::arch::apic::unmask_irq(15);

    for ctrl_idx in 0..2 {
        for drive in 0..2u8 {
            let Some(info) = identify(&CONTROLLERS[ctrl_idx], drive) else { continue };
            log::info!("ide: ctrl{} drive{}: {} sectors", ctrl_idx, drive, info.sectors);

            let disk_ops = DeviceOps { read: Some(disk_read), write: Some(disk_write), ioctl: None };
            let disk_dev = device_install(DeviceType::Block, DeviceSubtype::IdeDisk, None, disk_ops);
            DISK_LOCATIONS.lock()[disk_dev] = (ctrl_idx, drive);

            let mut sector0 = [0u8; mbr::SECTOR_SIZE];
            if read_sectors(ctrl_idx, drive, 0, 1, &mut sector0).is_err() {
                continue;
            }
            let Some(entries) = mbr::parse(&sector0) else { continue };
            for entry in entries.into_iter().flatten() {
                if entry.partition_type == mbr::PARTITION_TYPE_EXTENDED {
                    continue;
                }
                let part_ops =
                    DeviceOps { read: Some(disk_read), write: Some(disk_write), ioctl: Some(partition_ioctl) };
                let part_dev = device_install(DeviceType::Block, DeviceSubtype::IdePartition, Some(disk_dev), part_ops);
                DISK_LOCATIONS.lock()[part_dev] = (ctrl_idx, drive);
                PARTITION_STARTS.lock()[part_dev] = entry.lba_start;
            }
        }
    }
}
