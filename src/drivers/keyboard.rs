//! PS/2 keyboard driver (`spec.md` §4.8, component O): scan-code decoding,
//! modifier/lock state, and a blocking 64-byte ASCII FIFO.
//!
//! Grounded on the teacher's `drivers::keyboard`, a set-1 scan-code decoder
//! feeding a fixed-size ring buffer; kept nearly verbatim since this layer
//! has no dependency on the teacher's 64-bit specifics.

use spin::Mutex;

use crate::arch::cpu::inb;
use crate::device::{device_install, DeviceOps, DeviceSubtype, DeviceType};
use crate::error::Errno;
use crate::sched::scheduler::{self, WaitList};

const DATA_PORT: u16 = 0x60;
const STATUS_PORT: u16 = 0x64;
const OUTPUT_FULL: u8 = 1 << 0;

const FIFO_CAPACITY: usize = 64;

const SCANCODE_LEFT_SHIFT: u8 = 0x2A;
const SCANCODE_RIGHT_SHIFT: u8 = 0x36;
const SCANCODE_LEFT_CTRL: u8 = 0x1D;
const SCANCODE_LEFT_ALT: u8 = 0x38;
const SCANCODE_CAPS_LOCK: u8 = 0x3A;
const RELEASE_BIT: u8 = 0x80;

const LOWER: &[u8; 128] = &build_lower_table();
const UPPER: &[u8; 128] = &build_upper_table();

const fn build_lower_table() -> [u8; 128] {
    let mut t = [0u8; 128];
    let row1 = b"\x001234567890-=";
    let mut i = 0;
    while i < row1.len() {
        t[i] = row1[i];
        i += 1;
    }
    t[0x0E] = 0x08; // backspace
    t[0x0F] = b'\t';
    let qwerty = b"qwertyuiop[]";
    let mut j = 0;
    while j < qwerty.len() {
        t[0x10 + j] = qwerty[j];
        j += 1;
    }
    t[0x1C] = b'\n';
    let home = b"asdfghjkl;'`";
    let mut k = 0;
    while k < home.len() {
        t[0x1E + k] = home[k];
        k += 1;
    }
    let bottom = b"\\zxcvbnm,./";
    let mut m = 0;
    while m < bottom.len() {
        t[0x2C + m] = bottom[m];
        m += 1;
    }
    t[0x39] = b' ';
    t
}

const fn build_upper_table() -> [u8; 128] {
    let lower = build_lower_table();
    let mut t = lower;
    let mut i = 0;
    while i < 128 {
        let c = lower[i];
        if c.is_ascii_lowercase() {
            t[i] = c - 32;
        }
        i += 1;
    }
    let row1_shifted = b"\x00!@#$%^&*()_+";
    let mut j = 0;
    while j < row1_shifted.len() {
        t[j] = row1_shifted[j];
        j += 1;
    }
    t
}

struct Modifiers {
    shift: bool,
    ctrl: bool,
    alt: bool,
    caps_lock: bool,
}

impl Modifiers {
    const fn new() -> Self {
        Self { shift: false, ctrl: false, alt: false, caps_lock: false }
    }
}

struct Fifo {
    buf: [u8; FIFO_CAPACITY],
    head: usize,
    len: usize,
}

impl Fifo {
    const fn new() -> Self {
        Self { buf: [0; FIFO_CAPACITY], head: 0, len: 0 }
    }

    fn push(&mut self, byte: u8) {
        if self.len == FIFO_CAPACITY {
            return; // full: drop, matching the teacher's overrun policy
        }
        let tail = (self.head + self.len) % FIFO_CAPACITY;
        self.buf[tail] = byte;
        self.len += 1;
    }

    fn pop(&mut self) -> Option<u8> {
        if self.len == 0 {
            return None;
        }
        let byte = self.buf[self.head];
        self.head = (self.head + 1) % FIFO_CAPACITY;
        self.len -= 1;
        Some(byte)
    }
}

static MODIFIERS: Mutex<Modifiers> = Mutex::new(Modifiers::new());
static FIFO: Mutex<Fifo> = Mutex::new(Fifo::new());
static READERS: WaitList = WaitList::new();

/// IRQ1 handler: decodes one scan code, updates modifier/lock state, and
/// pushes the resulting ASCII byte (if any) into the FIFO, then unblocks one
/// waiting reader (`spec.md` §4.8).
pub fn irq1_handler(_frame: &mut crate::arch::TrapFrame) {
    let status = unsafe { inb(STATUS_PORT) };
    if status & OUTPUT_FULL == 0 {
        return;
    }
    let code = unsafe { inb(DATA_PORT) };
    let released = code & RELEASE_BIT != 0;
    let key = code & !RELEASE_BIT;

    let mut mods = MODIFIERS.lock();
    match key {
        SCANCODE_LEFT_SHIFT | SCANCODE_RIGHT_SHIFT => mods.shift = !released,
        SCANCODE_LEFT_CTRL => mods.ctrl = !released,
        SCANCODE_LEFT_ALT => mods.alt = !released,
        SCANCODE_CAPS_LOCK if !released => mods.caps_lock = !mods.caps_lock,
        _ => {
            if !released {
                let shifted = mods.shift ^ mods.caps_lock;
                let table = if shifted { UPPER } else { LOWER };
                let ascii = table.get(key as usize).copied().unwrap_or(0);
                if ascii != 0 {
                    FIFO.lock().push(ascii);
                }
            }
        }
    }
    drop(mods);
    scheduler::task_unblock_head(&READERS);
}

/// Blocks the caller until a byte is available, then pops and returns it
/// (`spec.md` §4.8: "`keyboard_read` blocks the caller on the FIFO when
/// empty").
fn keyboard_read_blocking() -> u8 {
    loop {
        let restore = crate::arch::interrupt_disable();
        if let Some(byte) = FIFO.lock().pop() {
            crate::arch::set_interrupt_state(restore);
            return byte;
        }
        // Still disabled: the IRQ1 handler can't push a byte and unblock us
        // between this check and registering on `READERS`.
        scheduler::task_block_current(&READERS);
        crate::arch::set_interrupt_state(restore);
    }
}

fn char_read(_dev: usize, buf: &mut [u8], _sector: u64, _count: u32) -> Result<(), Errno> {
    for slot in buf.iter_mut() {
        *slot = keyboard_read_blocking();
    }
    Ok(())
}

fn char_write(_dev: usize, _buf: &[u8], _sector: u64, _count: u32) -> Result<(), Errno> {
    Err(Errno::EPERM)
}

/// Registers the IRQ1 handler and installs the character device node.
///
/// # Safety
/// Must run once during device bring-up, after `arch::init`.
pub unsafe fn init() {
    crate::arch::idt::set_irq_handler(crate::arch::idt::VECTOR_KEYBOARD, irq1_handler);
    let ops = DeviceOps { read: Some(char_read), write: Some(char_write), ioctl: None };
    device_install(DeviceType::Char, DeviceSubtype::Keyboard, None, ops);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_wraps_and_drops_when_full() {
        let mut fifo = Fifo::new();
        for i in 0..FIFO_CAPACITY {
            fifo.push(i as u8);
        }
        fifo.push(0xFF); // dropped, FIFO is full
        assert_eq!(fifo.len, FIFO_CAPACITY);
        assert_eq!(fifo.pop(), Some(0));
    }

    #[test]
    fn lower_table_decodes_qwerty_row() {
        assert_eq!(LOWER[0x10], b'q');
        assert_eq!(UPPER[0x10], b'Q');
    }

    #[test]
    fn shifted_digit_row_uses_symbols() {
        assert_eq!(UPPER[0x02], b'!');
        assert_eq!(LOWER[0x02], b'1');
    }
}
