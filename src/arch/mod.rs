//! Architecture layer: x86 32-bit protected mode (`spec.md` §4's hardware
//! components F/G/N/P plus the trap/context types §3 defines).
//!
//! Grounded on the teacher's `arch::x86_64` module tree, re-targeted to
//! 32-bit via the `x86` crate (the `x86_64` crate is long-mode only and
//! cannot express this target — see DESIGN.md).

pub mod apic;
pub mod cpu;
pub mod gdt;
pub mod idt;
pub mod pci;
pub mod pic;
pub mod pit;
pub mod serial;
pub mod tss;

use core::sync::atomic::{AtomicBool, Ordering};

/// Mirrors the CPU state pushed by the common interrupt stub before
/// dispatch, in push order (`spec.md` §3: "Trap Frame"). `#[repr(C)]` so its
/// layout matches what `idt.rs`'s assembly stub actually pushes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TrapFrame {
    // Pushed by `pusha`-equivalent software save, reverse order.
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp_dummy: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    // Pushed by the stub itself.
    pub vector: u32,
    pub error_code: u32,
    // Pushed by the CPU on interrupt entry.
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    // Present only when entry crossed a privilege level (ring 3 -> ring 0).
    pub user_esp: u32,
    pub user_ss: u32,
}

/// Saved integer-register context for a blocked/preempted task (`spec.md`
/// §3: "CPU Context"), used by the scheduler's context switch rather than
/// the interrupt entry path.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuContext {
    pub edi: u32,
    pub esi: u32,
    pub ebx: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eip: u32,
}

static INTERRUPTS_ENABLED: AtomicBool = AtomicBool::new(false);

/// Halts the core forever with interrupts disabled. The last resort for
/// unrecoverable kernel errors (`spec.md` §4.1/§7: fatal conditions), called
/// through [`crate::panic_fatal`].
pub fn halt_forever() -> ! {
    unsafe {
        x86::irq::disable();
    }
    loop {
        unsafe {
            x86::halt();
        }
    }
}

/// Returns whether interrupts are currently enabled, tracked in software
/// alongside `eflags.IF` so nested `interrupt_disable`/restore pairs
/// (`spec.md` §4's mutex/scheduler critical sections) can be queried cheaply.
pub fn get_interrupt_state() -> bool {
    INTERRUPTS_ENABLED.load(Ordering::SeqCst)
}

/// Disables interrupts and returns the previous state, for the
/// save-then-restore pattern raw mutexes and the scheduler's critical
/// sections use.
pub fn interrupt_disable() -> bool {
    let prev = INTERRUPTS_ENABLED.swap(false, Ordering::SeqCst);
    unsafe {
        x86::irq::disable();
    }
    prev
}

/// Restores a previously saved interrupt-enable state.
pub fn set_interrupt_state(enabled: bool) {
    INTERRUPTS_ENABLED.store(enabled, Ordering::SeqCst);
    unsafe {
        if enabled {
            x86::irq::enable();
        } else {
            x86::irq::disable();
        }
    }
}

/// Brings up the architecture layer in the order `spec.md` §9 requires:
/// GDT/TSS first (so `lgdt`/`ltr` land before any interrupt can fire), then
/// the IDT, then the legacy PIC masked off in favor of APIC, then the local
/// APIC and IOAPIC, then the PIT as the timer tick source.
///
/// # Safety
/// Must run once, very early in `boot::start`, on the bootstrap processor.
pub unsafe fn init() {
    gdt::init();
    tss::init();
    idt::init();
    pic::disable_legacy();
    apic::init();
    pit::init(crate::config::TIMER_HZ);
    set_interrupt_state(true);
}
