//! Global Descriptor Table (`spec.md` §4's component G): flat kernel/user
//! code and data segments plus the single TSS descriptor.
//!
//! Grounded on the teacher's `arch::x86_64::gdt`, which builds its table
//! with `lazy_static!` and installs it with the `x86_64` crate's
//! `GlobalDescriptorTable`; the 32-bit `x86` crate has no equivalent builder,
//! so this module composes raw `SegmentDescriptor`s the way `x86`'s own
//! examples do and installs them with `x86::dtables::lgdt`.

use lazy_static::lazy_static;
use spin::Mutex;
use x86::dtables::{lgdt, DescriptorTablePointer};
use x86::segmentation::{
    BuildDescriptor, CodeSegmentType, DataSegmentType, Descriptor as SegmentDescriptor,
    SegmentDescriptorBuilder, SegmentSelector,
};
use x86::Ring;

pub const NULL_SEL: u16 = 0;
pub const KERNEL_CODE_SEL: u16 = 1 << 3;
pub const KERNEL_DATA_SEL: u16 = 2 << 3;
pub const USER_CODE_SEL: u16 = (3 << 3) | 3;
pub const USER_DATA_SEL: u16 = (4 << 3) | 3;
pub const TSS_SEL: u16 = 5 << 3;

const GDT_ENTRIES: usize = 6;

struct GdtTable {
    entries: [u64; GDT_ENTRIES],
}

unsafe impl Send for GdtTable {}
unsafe impl Sync for GdtTable {}

lazy_static! {
    static ref GDT: Mutex<GdtTable> = Mutex::new(GdtTable { entries: [0; GDT_ENTRIES] });
}

/// Installs the TSS descriptor's base/limit once the TSS's static address is
/// known (`tss::init` calls this after building the TSS structure).
pub fn set_tss_descriptor(base: u32, limit: u32) {
    let desc: SegmentDescriptor = <SegmentDescriptor as BuildDescriptor<_>>::tss_descriptor(
        SegmentDescriptorBuilder::tss_descriptor(base as u64, limit as u64, true),
    )
    .unwrap_or_else(|| SegmentDescriptor::NULL);
    GDT.lock().entries[5] = desc.as_u64();
}

/// Builds the flat kernel/user segments, installs the table with `lgdt`,
/// and reloads every segment register, including a far jump to reload `cs`.
///
/// # Safety
/// Must run before any other code relies on segment selectors matching this
/// layout (i.e. first in `arch::init`), and must run on the bootstrap
/// processor only.
pub unsafe fn init() {
    {
        let mut gdt = GDT.lock();
        gdt.entries[1] = SegmentDescriptor::builder()
            .limit(0xFFFFF)
            .base(0)
            .ring(Ring::Ring0)
            .code_segment(CodeSegmentType::ExecuteRead)
            .present()
            .limit_granularity_4kb()
            .db()
            .finish()
            .as_u64();
        gdt.entries[2] = SegmentDescriptor::builder()
            .limit(0xFFFFF)
            .base(0)
            .ring(Ring::Ring0)
            .data_segment(DataSegmentType::ReadWrite)
            .present()
            .limit_granularity_4kb()
            .db()
            .finish()
            .as_u64();
        gdt.entries[3] = SegmentDescriptor::builder()
            .limit(0xFFFFF)
            .base(0)
            .ring(Ring::Ring3)
            .code_segment(CodeSegmentType::ExecuteRead)
            .present()
            .limit_granularity_4kb()
            .db()
            .finish()
            .as_u64();
        gdt.entries[4] = SegmentDescriptor::builder()
            .limit(0xFFFFF)
            .base(0)
            .ring(Ring::Ring3)
            .data_segment(DataSegmentType::ReadWrite)
            .present()
            .limit_granularity_4kb()
            .db()
            .finish()
            .as_u64();
    }

    let gdt = GDT.lock();
    let ptr = DescriptorTablePointer::new_from_slice(&gdt.entries);
    lgdt(&ptr);
    drop(gdt);

    reload_segments();
}

/// Reloads `cs` via a far jump and all data-segment registers to the flat
/// kernel selectors just installed.
///
/// # Safety
/// Selectors must already be loaded via `lgdt`.
unsafe fn reload_segments() {
    core::arch::asm!(
        "push {sel}",
        "lea {tmp}, [1f]",
        "push {tmp}",
        "retf",
        "1:",
        sel = in(reg) KERNEL_CODE_SEL as u32,
        tmp = out(reg) _,
        options(nostack, preserves_flags),
    );
    let ds = SegmentSelector::new((KERNEL_DATA_SEL >> 3) as u16, Ring::Ring0);
    x86::segmentation::load_ds(ds);
    x86::segmentation::load_es(ds);
    x86::segmentation::load_fs(ds);
    x86::segmentation::load_gs(ds);
    x86::segmentation::load_ss(ds);
}

/// Loads the task register with the TSS selector. Called once, after
/// [`set_tss_descriptor`].
///
/// # Safety
/// The TSS descriptor must already be installed in the GDT.
pub unsafe fn load_tr() {
    x86::task::load_tr(SegmentSelector::new((TSS_SEL >> 3) as u16, Ring::Ring0));
}
