//! CMOS real-time clock driver (`spec.md` §4.8, component Q): BCD time
//! readout and a one-shot alarm via register B's alarm-interrupt bit.
//!
//! Grounded on the teacher's `drivers::rtc`, which accesses the same
//! address/data port pair and preserves the NMI-disable bit on every write;
//! kept verbatim since CMOS access has no architecture dependence beyond
//! port I/O.

use spin::Mutex;

use crate::arch::cpu::{inb, outb};
use crate::device::{device_install, DeviceOps, DeviceSubtype, DeviceType};

const ADDRESS_PORT: u16 = 0x70;
const DATA_PORT: u16 = 0x71;
const NMI_DISABLE_BIT: u8 = 1 << 7;

const REG_SECONDS: u8 = 0x00;
const REG_MINUTES: u8 = 0x02;
const REG_HOURS: u8 = 0x04;
const REG_SECONDS_ALARM: u8 = 0x01;
const REG_MINUTES_ALARM: u8 = 0x03;
const REG_HOURS_ALARM: u8 = 0x05;
const REG_STATUS_A: u8 = 0x0A;
const REG_STATUS_B: u8 = 0x0B;
const REG_STATUS_C: u8 = 0x0C;

const STATUS_A_UPDATE_IN_PROGRESS: u8 = 1 << 7;
const STATUS_B_ALARM_INTERRUPT_ENABLE: u8 = 1 << 5;

/// Reads CMOS register `reg`, preserving whatever the NMI-disable bit was
/// already set to in the address port (`spec.md` §4.8: "NMI bit
/// preserved").
unsafe fn cmos_read(reg: u8) -> u8 {
    let nmi_bit = inb(ADDRESS_PORT) & NMI_DISABLE_BIT;
    outb(ADDRESS_PORT, nmi_bit | (reg & 0x7F));
    inb(DATA_PORT)
}

unsafe fn cmos_write(reg: u8, value: u8) {
    let nmi_bit = inb(ADDRESS_PORT) & NMI_DISABLE_BIT;
    outb(ADDRESS_PORT, nmi_bit | (reg & 0x7F));
    outb(DATA_PORT, value);
}

fn bcd_to_bin(v: u8) -> u8 {
    (v & 0x0F) + (v >> 4) * 10
}

fn bin_to_bcd(v: u8) -> u8 {
    ((v / 10) << 4) | (v % 10)
}

/// Wall-clock time read from the CMOS clock registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmosTime {
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
}

/// Reads the current time, retrying while register A's update-in-progress
/// bit is set so a read never straddles the CMOS's internal tick.
///
/// # Safety
/// Port I/O shared with every other CMOS access; no concurrent access from
/// another core exists on this single-core kernel.
pub unsafe fn read_time() -> CmosTime {
    loop {
        if cmos_read(REG_STATUS_A) & STATUS_A_UPDATE_IN_PROGRESS == 0 {
            break;
        }
        core::hint::spin_loop();
    }
    CmosTime {
        seconds: bcd_to_bin(cmos_read(REG_SECONDS)),
        minutes: bcd_to_bin(cmos_read(REG_MINUTES)),
        hours: bcd_to_bin(cmos_read(REG_HOURS)),
    }
}

/// Notification hook invoked from the alarm IRQ handler; `None` until a
/// caller installs one via [`set_alarm_hook`].
static ALARM_HOOK: Mutex<Option<fn()>> = Mutex::new(None);

pub fn set_alarm_hook(hook: fn()) {
    *ALARM_HOOK.lock() = Some(hook);
}

/// Reads the current time, advances it by `secs`, writes the three alarm
/// registers, and enables the alarm interrupt in register B (`spec.md`
/// §4.8: "`set_alarm(secs)`").
///
/// # Safety
/// Same as [`read_time`].
pub unsafe fn set_alarm(secs: u32) {
    let now = read_time();
    let total = now.hours as u32 * 3600 + now.minutes as u32 * 60 + now.seconds as u32 + secs;
    let hours = ((total / 3600) % 24) as u8;
    let minutes = ((total / 60) % 60) as u8;
    let seconds = (total % 60) as u8;

    cmos_write(REG_SECONDS_ALARM, bin_to_bcd(seconds));
    cmos_write(REG_MINUTES_ALARM, bin_to_bcd(minutes));
    cmos_write(REG_HOURS_ALARM, bin_to_bcd(hours));

    let status_b = cmos_read(REG_STATUS_B);
    cmos_write(REG_STATUS_B, status_b | STATUS_B_ALARM_INTERRUPT_ENABLE);
    // Reading register C acknowledges any pending interrupt and re-arms the
    // next one (`spec.md` §4.8: "reads register C to allow further
    // interrupts").
    let _ = cmos_read(REG_STATUS_C);
}

/// IRQ8 handler: acknowledges the interrupt by reading register C (which
/// also distinguishes an alarm from a periodic/update-ended interrupt via
/// its own status bits, not consulted further here) and calls the
/// registered hook, if any.
pub fn irq8_handler(_frame: &mut crate::arch::TrapFrame) {
    let _status_c = unsafe { cmos_read(REG_STATUS_C) };
    if let Some(hook) = *ALARM_HOOK.lock() {
        hook();
    }
}

fn char_read(_dev: usize, buf: &mut [u8], _sector: u64, _count: u32) -> Result<(), crate::error::Errno> {
    let time = unsafe { read_time() };
    if !buf.is_empty() {
        buf[0] = time.hours;
    }
    if buf.len() > 1 {
        buf[1] = time.minutes;
    }
    if buf.len() > 2 {
        buf[2] = time.seconds;
    }
    Ok(())
}

fn char_write(_dev: usize, _buf: &[u8], _sector: u64, _count: u32) -> Result<(), crate::error::Errno> {
    Err(crate::error::Errno::EPERM)
}

/// Registers the IRQ8 handler and installs the character device node.
///
/// # Safety
/// Must run once during device bring-up, after `arch::init`.
pub unsafe fn init() {
    crate::arch::idt::set_irq_handler(crate::arch::idt::IRQ_BASE + 8, irq8_handler);
    crate::arch::apic::unmask_irq(8);
    let ops = DeviceOps { read: Some(char_read), write: Some(char_write), ioctl: None };
    device_install(DeviceType::Char, DeviceSubtype::Rtc, None, ops);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bcd_round_trips() {
        assert_eq!(bcd_to_bin(0x59), 59);
        assert_eq!(bin_to_bcd(59), 0x59);
        assert_eq!(bcd_to_bin(bin_to_bcd(42)), 42);
    }
}
