//! Legacy 8259A PIC pair: masked off entirely once the APIC takes over
//! interrupt routing (`spec.md` §4's component F note on legacy PIC
//! handling).
//!
//! Grounded on the teacher's `arch::x86_64::pic`, which uses the same
//! `pic8259` crate to remap the PIC's vectors out of the CPU exception range
//! before masking it — this kernel never dispatches through it, but an
//! unmasked, unremapped PIC left alive after APIC bring-up is a classic
//! source of spurious double interrupts, so the remap-then-mask sequence is
//! kept rather than skipped.

use pic8259::ChainedPics;
use spin::Mutex;

/// Remapped vector base for the master PIC, chosen safely out of the CPU
/// exception range even though nothing is ever dispatched through it.
const PIC_1_OFFSET: u8 = 0x20;
const PIC_2_OFFSET: u8 = 0x28;

static PICS: Mutex<ChainedPics> = Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

/// Remaps both PICs' vectors, then masks every line on both.
///
/// # Safety
/// Must run once during `arch::init`, before the APIC is programmed.
pub unsafe fn disable_legacy() {
    let mut pics = PICS.lock();
    pics.initialize();
    pics.write_masks(0xFF, 0xFF);
}
