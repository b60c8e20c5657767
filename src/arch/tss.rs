//! Task State Segment: one static TSS used only for its `esp0` field, the
//! ring-3-to-ring-0 stack-switch mechanism (`spec.md` §4's component G).
//!
//! 32-bit protected mode still does hardware task switching through the
//! TSS even though this kernel performs software context switches
//! ([`crate::sched::scheduler`]); the only field that matters here is
//! `esp0`, updated on every switch to a task so a ring-3 interrupt lands on
//! that task's kernel stack.

use spin::Mutex;

/// Hardware TSS layout (`spec.md` doesn't need the I/O bitmap or the
/// task-link fields; they're present only because the CPU reads a
/// fixed-offset structure).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct Tss {
    pub link: u16,
    _res0: u16,
    pub esp0: u32,
    pub ss0: u16,
    _res1: u16,
    pub esp1: u32,
    pub ss1: u16,
    _res2: u16,
    pub esp2: u32,
    pub ss2: u16,
    _res3: u16,
    pub cr3: u32,
    pub eip: u32,
    pub eflags: u32,
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
    pub es: u16,
    _res4: u16,
    pub cs: u16,
    _res5: u16,
    pub ss: u16,
    _res6: u16,
    pub ds: u16,
    _res7: u16,
    pub fs: u16,
    _res8: u16,
    pub gs: u16,
    _res9: u16,
    pub ldt: u16,
    _res10: u16,
    _trap: u16,
    pub iomap_base: u16,
}

impl Tss {
    const fn zeroed() -> Self {
        Self {
            link: 0,
            _res0: 0,
            esp0: 0,
            ss0: 0,
            _res1: 0,
            esp1: 0,
            ss1: 0,
            _res2: 0,
            esp2: 0,
            ss2: 0,
            _res3: 0,
            cr3: 0,
            eip: 0,
            eflags: 0,
            eax: 0,
            ecx: 0,
            edx: 0,
            ebx: 0,
            esp: 0,
            ebp: 0,
            esi: 0,
            edi: 0,
            es: 0,
            _res4: 0,
            cs: 0,
            _res5: 0,
            ss: 0,
            _res6: 0,
            ds: 0,
            _res7: 0,
            fs: 0,
            _res8: 0,
            gs: 0,
            _res9: 0,
            ldt: 0,
            _res10: 0,
            _trap: 0,
            iomap_base: core::mem::size_of::<Tss>() as u16,
        }
    }
}

static TSS: Mutex<Tss> = Mutex::new(Tss::zeroed());

/// Builds the TSS's GDT descriptor (its address is `'static`, fixed for the
/// kernel's lifetime) and loads `tr`.
///
/// # Safety
/// Must run after [`super::gdt::init`] and before interrupts are enabled.
pub unsafe fn init() {
    let tss = TSS.lock();
    let base = &*tss as *const Tss as u32;
    let limit = core::mem::size_of::<Tss>() as u32 - 1;
    drop(tss);
    super::gdt::set_tss_descriptor(base, limit);
    super::gdt::load_tr();
}

/// Updates `esp0`, the ring-0 stack the CPU switches to on a privilege-level
/// change into the kernel. Called by the scheduler on every context switch
/// (`spec.md` §4.2).
pub fn set_kernel_stack(esp0: u32) {
    TSS.lock().esp0 = esp0;
}
