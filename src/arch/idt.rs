//! Interrupt Descriptor Table (`spec.md` §4's component F): 256 gates,
//! vector 14 wired to the page-fault handler, 0x20-0x2F to the legacy IRQ
//! range remapped behind the APIC, and 0x80 as the syscall gate reachable
//! from ring 3.
//!
//! The teacher builds its IDT with the `x86_64` crate's
//! `InterruptDescriptorTable` type and `extern "x86-interrupt"` handlers;
//! the 32-bit `x86` crate has no equivalent builder, so this module
//! composes raw gate descriptors by hand in the same `lazy_static!` +
//! `spin::Mutex` shape the teacher uses for its GDT/IDT statics.

use core::arch::global_asm;

use lazy_static::lazy_static;
use spin::Mutex;
use x86::dtables::{lidt, DescriptorTablePointer};

use crate::arch::gdt::KERNEL_CODE_SEL;
use crate::mm::paging::FaultAction;

pub const VECTOR_DIVIDE_ERROR: u8 = 0;
pub const VECTOR_BREAKPOINT: u8 = 3;
pub const VECTOR_INVALID_OPCODE: u8 = 6;
pub const VECTOR_DOUBLE_FAULT: u8 = 8;
pub const VECTOR_GENERAL_PROTECTION: u8 = 13;
pub const VECTOR_PAGE_FAULT: u8 = 14;
pub const IRQ_BASE: u8 = 0x20;
pub const VECTOR_TIMER: u8 = IRQ_BASE; // IRQ0, routed through the APIC timer in this build
pub const VECTOR_KEYBOARD: u8 = IRQ_BASE + 1; // IRQ1
pub const VECTOR_SYSCALL: u8 = 0x80;

const IDT_ENTRIES: usize = 256;

const GATE_PRESENT: u8 = 1 << 7;
const GATE_TYPE_INTERRUPT32: u8 = 0xE;
const GATE_TYPE_TRAP32: u8 = 0xF;

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    zero: u8,
    type_attr: u8,
    offset_high: u16,
}

impl IdtEntry {
    const MISSING: Self = Self { offset_low: 0, selector: 0, zero: 0, type_attr: 0, offset_high: 0 };

    fn new(handler: u32, dpl: u8, gate_type: u8) -> Self {
        Self {
            offset_low: (handler & 0xFFFF) as u16,
            selector: KERNEL_CODE_SEL,
            zero: 0,
            type_attr: GATE_PRESENT | ((dpl & 0b11) << 5) | gate_type,
            offset_high: (handler >> 16) as u16,
        }
    }
}

struct IdtTable {
    entries: [IdtEntry; IDT_ENTRIES],
}

unsafe impl Send for IdtTable {}
unsafe impl Sync for IdtTable {}

lazy_static! {
    static ref IDT: Mutex<IdtTable> = Mutex::new(IdtTable { entries: [IdtEntry::MISSING; IDT_ENTRIES] });
}

/// Per-vector dispatch hooks the rest of the kernel installs into, so this
/// module only owns gate plumbing, not policy (`spec.md` §4's device table
/// philosophy applied to interrupts too).
type IrqHandler = fn(&mut crate::arch::TrapFrame);
static IRQ_HANDLERS: Mutex<[Option<IrqHandler>; IDT_ENTRIES]> = Mutex::new([None; IDT_ENTRIES]);

/// Registers a handler for a given IRQ vector (0x20-0x2F range). Called by
/// `pit::init`/`keyboard::init` during device bring-up.
pub fn set_irq_handler(vector: u8, handler: IrqHandler) {
    IRQ_HANDLERS.lock()[vector as usize] = Some(handler);
}

/// Builds the gate table and installs it with `lidt`.
///
/// # Safety
/// Must run after [`super::gdt::init`] (gates reference `KERNEL_CODE_SEL`)
/// and before interrupts are enabled.
pub unsafe fn init() {
    extern "x86-interrupt" fn divide_error(_frame: *const u8) {
        crate::panic_fatal!("divide error");
    }
    extern "x86-interrupt" fn invalid_opcode(_frame: *const u8) {
        crate::panic_fatal!("invalid opcode");
    }
    extern "x86-interrupt" fn double_fault(_frame: *const u8, _code: u32) -> ! {
        crate::panic_fatal!("double fault");
    }
    extern "x86-interrupt" fn general_protection(_frame: *const u8, code: u32) {
        crate::panic_fatal!("general protection fault, code {:#x}", code);
    }
    extern "x86-interrupt" fn breakpoint(_frame: *const u8) {
        log::debug!("breakpoint");
    }
    extern "x86-interrupt" fn page_fault(_frame: *const u8, error_code: u32) {
        handle_page_fault(error_code);
    }

    let mut idt = IDT.lock();
    idt.entries[VECTOR_DIVIDE_ERROR as usize] =
        IdtEntry::new(divide_error as usize as u32, 0, GATE_TYPE_INTERRUPT32);
    idt.entries[VECTOR_INVALID_OPCODE as usize] =
        IdtEntry::new(invalid_opcode as usize as u32, 0, GATE_TYPE_INTERRUPT32);
    idt.entries[VECTOR_DOUBLE_FAULT as usize] =
        IdtEntry::new(double_fault as usize as u32, 0, GATE_TYPE_INTERRUPT32);
    idt.entries[VECTOR_GENERAL_PROTECTION as usize] =
        IdtEntry::new(general_protection as usize as u32, 0, GATE_TYPE_INTERRUPT32);
    idt.entries[VECTOR_BREAKPOINT as usize] =
        IdtEntry::new(breakpoint as usize as u32, 3, GATE_TYPE_TRAP32);
    idt.entries[VECTOR_PAGE_FAULT as usize] =
        IdtEntry::new(page_fault as usize as u32, 0, GATE_TYPE_INTERRUPT32);
    for (i, stub) in IRQ_STUBS.into_iter().enumerate() {
        idt.entries[(IRQ_BASE as usize) + i] = IdtEntry::new(stub as usize as u32, 0, GATE_TYPE_INTERRUPT32);
    }
    // Syscall gate: DPL 3 so ring-3 `int 0x80` is permitted, interrupt gate
    // (not trap gate) so IF stays clear until the kernel explicitly
    // re-enables it (`spec.md` §4's component J).
    idt.entries[VECTOR_SYSCALL as usize] = IdtEntry::new(__syscall_isr as usize as u32, 3, GATE_TYPE_INTERRUPT32);

    let ptr = DescriptorTablePointer::new_from_slice(&idt.entries);
    lidt(&ptr);
}

fn dispatch_irq(vector: u8) {
    let handler = IRQ_HANDLERS.lock()[vector as usize];
    if let Some(h) = handler {
        let mut dummy = crate::arch::TrapFrame::default();
        h(&mut dummy);
    }
    crate::arch::apic::send_eoi();
}

/// Generates one `extern "x86-interrupt"` stub per ISA IRQ line, each closing
/// over its own vector constant so `dispatch_irq` can tell IRQ8's RTC tick
/// from IRQ14's IDE completion rather than every line aliasing IRQ0's.
macro_rules! irq_stub {
    ($name:ident, $irq:expr) => {
        extern "x86-interrupt" fn $name(_frame: *const u8) {
            dispatch_irq(IRQ_BASE + $irq);
        }
    };
}

irq_stub!(irq_stub_0, 0);
irq_stub!(irq_stub_1, 1);
irq_stub!(irq_stub_2, 2);
irq_stub!(irq_stub_3, 3);
irq_stub!(irq_stub_4, 4);
irq_stub!(irq_stub_5, 5);
irq_stub!(irq_stub_6, 6);
irq_stub!(irq_stub_7, 7);
irq_stub!(irq_stub_8, 8);
irq_stub!(irq_stub_9, 9);
irq_stub!(irq_stub_10, 10);
irq_stub!(irq_stub_11, 11);
irq_stub!(irq_stub_12, 12);
irq_stub!(irq_stub_13, 13);
irq_stub!(irq_stub_14, 14);
irq_stub!(irq_stub_15, 15);

const IRQ_STUBS: [extern "x86-interrupt" fn(*const u8); 16] = [
    irq_stub_0, irq_stub_1, irq_stub_2, irq_stub_3, irq_stub_4, irq_stub_5, irq_stub_6, irq_stub_7, irq_stub_8,
    irq_stub_9, irq_stub_10, irq_stub_11, irq_stub_12, irq_stub_13, irq_stub_14, irq_stub_15,
];

/// Hand-written syscall gate (`spec.md` §4's component J). `extern
/// "x86-interrupt"` functions are given a frame-pointer-only view of the
/// stack and never expose the caller's real EAX/EBX/ECX/EDX, so the only way
/// to read a syscall's arguments (or write its return value back into EAX)
/// is a trampoline written directly in assembly, in the same style as
/// `syscall::fork_child_trampoline`'s hand-rolled `iretd` path.
///
/// Builds a full [`crate::arch::TrapFrame`] on the kernel stack (placeholder
/// `error_code`, then `vector`, then `pusha` — which pushes EAX/ECX/EDX/EBX/
/// ESP/EBP/ESI/EDI in exactly the struct's field order), hands ESP to
/// [`crate::syscall::dispatch_from_interrupt`], then unwinds the frame with
/// `popa` (reloading the real EAX with the syscall's return value) before
/// `iretd`.
global_asm!(
    ".global __syscall_isr",
    "__syscall_isr:",
    "push 0",
    "push 0x80",
    "pusha",
    "push esp",
    "call {dispatch}",
    "add esp, 4",
    "popa",
    "add esp, 8",
    "iretd",
    dispatch = sym crate::syscall::dispatch_from_interrupt,
);

extern "C" {
    fn __syscall_isr();
}

/// Reads `cr2`, consults the faulting task's heap/stack bounds and the
/// faulting PTE, classifies the fault per [`crate::mm::paging::classify_fault`],
/// and acts on it (`spec.md` §4.1/§7).
fn handle_page_fault(error_code: u32) {
    let vaddr = unsafe { crate::arch::cpu::read_cr2() };
    let is_write = error_code & 0b10 != 0;
    let present = error_code & 0b1 != 0;

    let task = crate::sched::scheduler::current_task_bounds();
    let (pte_present, pte_writable, refcount) = crate::mm::paging_lookup(vaddr);

    let action = crate::mm::paging::classify_fault(
        is_write,
        pte_present,
        pte_writable,
        refcount,
        vaddr,
        task.kernel_end,
        task.brk,
        task.stack_bottom,
        task.stack_top,
    );

    match action {
        FaultAction::CowInPlace => unsafe { crate::mm::paging_cow_in_place(vaddr) },
        FaultAction::CowCopy => unsafe { crate::mm::paging_cow_copy(vaddr) },
        FaultAction::DemandPage => unsafe {
            let flags = crate::mm::paging::PteFlags::PRESENT
                | crate::mm::paging::PteFlags::WRITE
                | crate::mm::paging::PteFlags::USER;
            crate::mm::link_page(vaddr & !0xFFF, flags);
        },
        FaultAction::Fatal => {
            let _ = present;
            crate::panic_fatal!("page fault: unrecoverable at {:#x} (write={})", vaddr, is_write);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_entry_encodes_dpl_and_selector() {
        let g = IdtEntry::new(0x1234_5678, 3, GATE_TYPE_TRAP32);
        assert_eq!(g.offset_low, 0x5678);
        assert_eq!(g.offset_high, 0x1234);
        assert_eq!(g.selector, KERNEL_CODE_SEL);
        assert_eq!(g.type_attr & 0b0110_0000, 0b0110_0000); // dpl=3
        assert_ne!(g.type_attr & GATE_PRESENT, 0);
    }
}
