//! Physical and virtual memory management (`spec.md` §4.1, components A/C/D/E).
//!
//! Bring-up order (enforced by `init()`'s caller, `boot::start`, per
//! `spec.md` §9's "Globals" ordering: GDT → memory → paging → IDT → APIC →
//! devices → task):
//! 1. [`frame`] is seeded from the bootloader-reported memory map.
//! 2. The kernel virtual-address [`bitmap::Bitmap`] is seeded starting at
//!    the first kernel page.
//! 3. [`paging`] identity-maps the kernel image and installs the self-map.
//! 4. [`heap`] becomes usable once `alloc_kpage` can hand out pages.

pub mod frame;
pub mod heap;
pub mod paging;

use crate::bitmap::Bitmap;
use crate::error::KernelError;
use frame::{FrameMap, PAGE_SIZE};
use paging::PteFlags;
use spin::Mutex;

/// One MiB, the base address `spec.md` §4.1 asserts the usable region
/// starts at.
pub const ONE_MIB: u32 = 1 << 20;

/// Global physical frame map. `'static` storage is a boxed leak obtained
/// once at bring-up from an identity-mapped region, never reallocated.
static FRAME_MAP: Mutex<Option<FrameMap<'static>>> = Mutex::new(None);

/// Global kernel virtual-address bitmap, separate from the physical map per
/// `spec.md` §3.
static KERNEL_VA_BITMAP: Mutex<Option<KernelVaState>> = Mutex::new(None);

struct KernelVaState {
    storage: &'static mut [u8],
    base_page: usize,
}

/// A memory region as reported by the bootloader handoff (`spec.md` §6).
#[derive(Debug, Clone, Copy)]
pub struct MemRegion {
    pub base: u64,
    pub size: u64,
    pub usable: bool,
}

/// Picks the largest usable region starting at `ONE_MIB`, asserting the
/// base/alignment invariant `spec.md` §4.1 requires. Returns `(base, size)`
/// in bytes.
pub fn pick_usable_region(regions: &[MemRegion]) -> Option<(u64, u64)> {
    regions
        .iter()
        .filter(|r| r.usable && r.base == ONE_MIB as u64)
        .map(|r| (r.base, r.size))
        .max_by_key(|&(_, size)| size)
        .filter(|&(base, size)| base % PAGE_SIZE as u64 == 0 && size % PAGE_SIZE as u64 == 0)
}

/// Initializes the physical frame map over `refcounts` (a `'static` byte
/// slice sized to cover `total_pages`), reserves the frames occupied by the
/// kernel image and the map itself, then initializes the kernel VA bitmap.
///
/// # Safety
/// Must run exactly once, early in boot, before any other `mm::` function.
pub unsafe fn init(
    refcounts: &'static mut [u8],
    start_page: usize,
    total_pages: usize,
    kernel_image_pages: usize,
    kernel_va_bitmap_storage: &'static mut [u8],
    kernel_va_base_page: usize,
) {
    let mut map = FrameMap::new(refcounts, start_page, total_pages);
    map.mark_reserved(start_page, kernel_image_pages);
    *FRAME_MAP.lock() = Some(map);
    *KERNEL_VA_BITMAP.lock() =
        Some(KernelVaState { storage: kernel_va_bitmap_storage, base_page: kernel_va_base_page });
}

/// Claims one physical frame. Fatal (per `spec.md` §4.1) if none remain.
pub fn get_page() -> u32 {
    let mut guard = FRAME_MAP.lock();
    let map = guard.as_mut().expect("frame map not initialized");
    match map.get_page() {
        Some(page) => (page as u32) * PAGE_SIZE as u32,
        None => crate::panic_fatal!("mm: out of physical frames"),
    }
}

/// Fallible variant used by `sys_brk` growth checks, which must return `-1`
/// to userspace rather than halt the kernel.
pub fn try_get_page() -> Result<u32, KernelError> {
    let mut guard = FRAME_MAP.lock();
    let map = guard.as_mut().expect("frame map not initialized");
    map.try_get_page().map(|p| (p as u32) * PAGE_SIZE as u32)
}

/// Releases one mapping onto the frame at physical address `addr`.
pub fn put_page(addr: u32) {
    let mut guard = FRAME_MAP.lock();
    let map = guard.as_mut().expect("frame map not initialized");
    map.put_page((addr / PAGE_SIZE as u32) as usize);
}

/// Increments a frame's refcount without allocating (fork sharing a page).
pub fn get_page_ref(addr: u32) {
    let mut guard = FRAME_MAP.lock();
    let map = guard.as_mut().expect("frame map not initialized");
    map.get_page_ref((addr / PAGE_SIZE as u32) as usize);
}

/// Current refcount of the frame at `addr` (for COW classification).
pub fn refcount(addr: u32) -> u8 {
    let guard = FRAME_MAP.lock();
    guard.as_ref().expect("frame map not initialized").refcount((addr / PAGE_SIZE as u32) as usize)
}

/// Number of free physical pages, for `spec.md` §8's frame-conservation
/// property and `sys_brk`'s growth check.
pub fn free_pages() -> usize {
    FRAME_MAP.lock().as_ref().expect("frame map not initialized").free_pages()
}

/// Scans the kernel bitmap for `n` consecutive free pages, marks them used,
/// and returns the virtual base address. Kernel pages are identity-mapped at
/// bring-up, so the returned VA also names its backing physical frame
/// (`spec.md` §4.1: "physical = virtual for kernel pages").
pub fn alloc_kpage(n: usize) -> Result<u32, KernelError> {
    let mut guard = KERNEL_VA_BITMAP.lock();
    let state = guard.as_mut().expect("kernel VA bitmap not initialized");
    let mut bm = Bitmap::new(state.storage, state.base_page);
    let idx = bm.scan_and_set(n).ok_or(KernelError::OutOfKernelVa)?;
    Ok((bm.to_absolute(idx) as u32) * PAGE_SIZE as u32)
}

/// Reverses [`alloc_kpage`]: clears the `n` bits covering `[addr, addr+n*4096)`.
pub fn free_kpage(addr: u32, n: usize) {
    let mut guard = KERNEL_VA_BITMAP.lock();
    let state = guard.as_mut().expect("kernel VA bitmap not initialized");
    let mut bm = Bitmap::new(state.storage, state.base_page);
    let page = (addr / PAGE_SIZE as u32) as usize;
    let idx = bm.to_relative(page).expect("free_kpage: address outside kernel VA range");
    bm.reset(idx, n);
}

/// Reads the page directory entry at self-map address `0xFFFFF000`,
/// obtaining (creating on demand via [`get_page`]) the page table backing
/// `vaddr`'s directory slot, then writes its PTE with a fresh frame and the
/// given flags, and invalidates the TLB for `vaddr`. `spec.md` §4.1:
/// "link_page".
///
/// # Safety
/// Caller's page directory must already be loaded in `cr3` and its
/// self-map slot must be valid.
pub unsafe fn link_page(vaddr: u32, flags: PteFlags) -> u32 {
    let pde_ptr = paging::SELF_MAP_PDE_ADDR as *mut u32;
    let didx = paging::dir_index(vaddr);
    let pde_entry_ptr = pde_ptr.add(didx);
    let mut pde_entry = core::ptr::read_volatile(pde_entry_ptr);
    let (mut pt_phys, mut pde_flags) = paging::split_entry(pde_entry);
    if !pde_flags.contains(PteFlags::PRESENT) {
        pt_phys = get_page();
        pde_flags = PteFlags::PRESENT | PteFlags::WRITE | PteFlags::USER;
        pde_entry = paging::make_entry(pt_phys, pde_flags);
        core::ptr::write_volatile(pde_entry_ptr, pde_entry);
        // The page table's own backing frame is only reachable through the
        // self-map once the PDE write above lands; zero it via that window.
        let table_va = paging::self_map_table_addr(didx) as *mut u32;
        for i in 0..paging::ENTRIES_PER_TABLE {
            core::ptr::write_volatile(table_va.add(i), 0);
        }
    }
    let frame = get_page();
    let pte_va = paging::self_map_pte_addr(vaddr) as *mut u32;
    core::ptr::write_volatile(pte_va, paging::make_entry(frame, flags | PteFlags::PRESENT));
    invalidate_tlb(vaddr);
    frame
}

/// Clears the PTE for `vaddr` and drops one reference on its frame via
/// [`put_page`] (which only actually frees it once no mapping remains).
///
/// # Safety
/// Same preconditions as [`link_page`].
pub unsafe fn unlink_page(vaddr: u32) {
    let pte_va = paging::self_map_pte_addr(vaddr) as *mut u32;
    let entry = core::ptr::read_volatile(pte_va);
    let (phys, flags) = paging::split_entry(entry);
    if flags.contains(PteFlags::PRESENT) {
        core::ptr::write_volatile(pte_va, 0);
        invalidate_tlb(vaddr);
        put_page(phys);
    }
}

/// Installs a specific physical address at a specific virtual address with
/// `PCD` set, for MMIO windows (LAPIC, IOAPIC, NVMe BARs — `spec.md` §4.1).
///
/// # Safety
/// `vaddr`'s directory slot must already have a page table (callers use this
/// only for fixed, pre-reserved kernel windows).
pub unsafe fn map_page_fixed(vaddr: u32, paddr: u32, flags: PteFlags) {
    let pte_va = paging::self_map_pte_addr(vaddr) as *mut u32;
    core::ptr::write_volatile(
        pte_va,
        paging::make_entry(paddr, flags | PteFlags::PRESENT | PteFlags::PCD),
    );
    invalidate_tlb(vaddr);
}

/// Reads the PTE backing `vaddr` through the self-map and returns
/// `(present, writable, frame_refcount)` for the page-fault classifier.
/// `frame_refcount` is `0` when the PTE is absent.
///
/// # Safety
/// Caller's page directory must be loaded and have a valid self-map slot.
pub unsafe fn paging_lookup(vaddr: u32) -> (bool, bool, u8) {
    let pte_va = paging::self_map_pte_addr(vaddr) as *const u32;
    let entry = core::ptr::read_volatile(pte_va);
    let (phys, flags) = paging::split_entry(entry);
    if !flags.contains(PteFlags::PRESENT) {
        return (false, false, 0);
    }
    (true, flags.contains(PteFlags::WRITE), refcount(phys))
}

/// Flips `write=1` on an already-sole-owner COW page (`spec.md` §4.1's
/// `CowInPlace` branch) and invalidates the TLB.
///
/// # Safety
/// `vaddr`'s PTE must be present with refcount 1.
pub unsafe fn paging_cow_in_place(vaddr: u32) {
    let pte_va = paging::self_map_pte_addr(vaddr) as *mut u32;
    let entry = core::ptr::read_volatile(pte_va);
    let (phys, flags) = paging::split_entry(entry);
    core::ptr::write_volatile(pte_va, paging::make_entry(phys, flags | PteFlags::WRITE));
    invalidate_tlb(vaddr);
}

/// Allocates a fresh frame, copies the shared page's contents into it,
/// repoints the PTE at the copy with `write=1`, and drops the old frame's
/// refcount (`spec.md` §4.1's `CowCopy` branch).
///
/// # Safety
/// `vaddr`'s PTE must be present with refcount > 1. Requires a scratch
/// window (the last kernel page below the self-map) to bounce the copy
/// through, since the new frame isn't mapped anywhere yet.
pub unsafe fn paging_cow_copy(vaddr: u32) {
    let page_base = vaddr & !0xFFF;
    let pte_va = paging::self_map_pte_addr(page_base) as *mut u32;
    let entry = core::ptr::read_volatile(pte_va);
    let (old_phys, flags) = paging::split_entry(entry);

    let new_phys = get_page();
    const SCRATCH_VA: u32 = 0xFFBF_F000;
    map_page_fixed(SCRATCH_VA, new_phys, PteFlags::WRITE);
    core::ptr::copy_nonoverlapping(
        page_base as *const u8,
        SCRATCH_VA as *mut u8,
        PAGE_SIZE as usize,
    );
    // Clear the scratch PTE directly rather than via `unlink_page`: the
    // mapping being torn down here never went through `get_page_ref`, so
    // decrementing the frame's refcount would free the page we're about to
    // keep.
    let scratch_pte = paging::self_map_pte_addr(SCRATCH_VA) as *mut u32;
    core::ptr::write_volatile(scratch_pte, 0);
    invalidate_tlb(SCRATCH_VA);

    core::ptr::write_volatile(
        pte_va,
        paging::make_entry(new_phys, (flags | PteFlags::WRITE) | PteFlags::PRESENT),
    );
    invalidate_tlb(page_base);
    put_page(old_phys);
}

/// Directory index below which entries are the kernel's own (identity-
/// mapped image, frame map, kernel heap) and are shared verbatim between
/// every address space; at or above it, entries belong to the task's user
/// heap/stack and are COW-cloned by [`fork_address_space`]. Chosen to match
/// `kernel_end` rounded up to a 4 MiB directory-entry boundary (Open
/// Question resolution, see DESIGN.md).
pub fn kernel_pde_split() -> usize {
    paging::dir_index(crate::boot::kernel_end() + 0x3FFFFF)
}

/// Scratch virtual windows used only transiently inside
/// [`fork_address_space`], to poke at directory/table frames that aren't
/// mapped anywhere yet. Chosen just below the COW bounce page used by
/// [`paging_cow_copy`] so the two never alias.
const FORK_SCRATCH_PDE_VA: u32 = 0xFFBF_E000;
const FORK_SCRATCH_PT_VA: u32 = 0xFFBF_D000;

/// Clones `parent_pde` (the physical address of the *currently loaded*
/// directory — fork always runs in the forking task's own context) into a
/// fresh directory, sharing the kernel half verbatim and COW-sharing every
/// present user PTE (`spec.md` §4.1 "Fork semantics"). Returns the new
/// directory's physical address.
///
/// # Safety
/// `parent_pde` must equal the currently loaded `cr3` so the parent's self-
/// map window is valid to read through.
pub unsafe fn fork_address_space(parent_pde: u32) -> u32 {
    let new_pde_phys = get_page();
    map_page_fixed(FORK_SCRATCH_PDE_VA, new_pde_phys, PteFlags::WRITE);
    let new_pde = FORK_SCRATCH_PDE_VA as *mut u32;
    let parent_pde_view = paging::SELF_MAP_PDE_ADDR as *const u32;

    let split = kernel_pde_split();
    for didx in 0..paging::ENTRIES_PER_TABLE {
        let entry = core::ptr::read_volatile(parent_pde_view.add(didx));
        let (_, flags) = paging::split_entry(entry);
        if didx >= split && didx != paging::SELF_MAP_SLOT {
            // User half: clone the table, not the data pages.
            if !flags.contains(PteFlags::PRESENT) {
                core::ptr::write_volatile(new_pde.add(didx), 0);
                continue;
            }
            let clone_pt_phys = get_page();
            map_page_fixed(FORK_SCRATCH_PT_VA, clone_pt_phys, PteFlags::WRITE);
            let clone_pt = FORK_SCRATCH_PT_VA as *mut u32;
            let parent_pt_view = paging::self_map_table_addr(didx) as *mut u32;

            for tidx in 0..paging::ENTRIES_PER_TABLE {
                let pte = core::ptr::read_volatile(parent_pt_view.add(tidx));
                let (phys, pte_flags) = paging::split_entry(pte);
                if !pte_flags.contains(PteFlags::PRESENT) {
                    core::ptr::write_volatile(clone_pt.add(tidx), 0);
                    continue;
                }
                let shared = paging::cow_share_entry(pte);
                core::ptr::write_volatile(parent_pt_view.add(tidx), shared);
                get_page_ref(phys);
                core::ptr::write_volatile(clone_pt.add(tidx), shared);
            }

            core::ptr::write_volatile(
                new_pde.add(didx),
                paging::make_entry(clone_pt_phys, flags | PteFlags::PRESENT),
            );
            clear_fixed_map(FORK_SCRATCH_PT_VA);
        } else if didx == paging::SELF_MAP_SLOT {
            core::ptr::write_volatile(
                new_pde.add(didx),
                paging::make_entry(new_pde_phys, PteFlags::PRESENT | PteFlags::WRITE),
            );
        } else {
            // Kernel half: shared verbatim, same backing frame for every
            // address space.
            core::ptr::write_volatile(new_pde.add(didx), entry);
        }
    }

    clear_fixed_map(FORK_SCRATCH_PDE_VA);
    new_pde_phys
}

/// Clears a PTE installed by [`map_page_fixed`] without touching the
/// target frame's refcount, since `map_page_fixed` never incremented it.
unsafe fn clear_fixed_map(vaddr: u32) {
    let pte_va = paging::self_map_pte_addr(vaddr) as *mut u32;
    core::ptr::write_volatile(pte_va, 0);
    invalidate_tlb(vaddr);
}

/// Tears down a dying task's user half: every present user PTE is unlinked
/// (dropping its frame reference), its page tables freed, and finally the
/// directory itself (`spec.md` §4.2 "Exit: Free user PDE/PTEs and user
/// frames").
///
/// # Safety
/// `pde` must be the currently loaded directory (exit always runs in the
/// exiting task's own context, before the final `schedule()` switches away).
pub unsafe fn teardown_address_space(pde: u32) {
    let split = kernel_pde_split();
    let pde_view = paging::SELF_MAP_PDE_ADDR as *mut u32;
    for didx in split..paging::ENTRIES_PER_TABLE {
        if didx == paging::SELF_MAP_SLOT {
            continue;
        }
        let entry = core::ptr::read_volatile(pde_view.add(didx));
        let (pt_phys, flags) = paging::split_entry(entry);
        if !flags.contains(PteFlags::PRESENT) {
            continue;
        }
        let base_vaddr = (didx as u32) << 22;
        for tidx in 0..paging::ENTRIES_PER_TABLE {
            let vaddr = base_vaddr | ((tidx as u32) << 12);
            let pte_va = paging::self_map_pte_addr(vaddr) as *mut u32;
            let pte = core::ptr::read_volatile(pte_va);
            if paging::split_entry(pte).1.contains(PteFlags::PRESENT) {
                unlink_page(vaddr);
            }
        }
        core::ptr::write_volatile(pde_view.add(didx), 0);
        put_page(pt_phys);
    }
    put_page(pde);
}

/// `sys_brk(addr)`: adjusts the current task's heap top (`spec.md` §4.1).
/// Shrinking unmaps every page in `[new, old)` immediately; growing only
/// validates the request (page-aligned, fits in `free_pages`) and records
/// the new top — the pages themselves are demand-paged on first touch.
pub fn adjust_brk(new_brk: u32) -> Result<(), KernelError> {
    if new_brk % PAGE_SIZE as u32 != 0 {
        return Err(KernelError::OutOfKernelVa);
    }
    let old_brk = crate::sched::scheduler::current_brk();
    if new_brk < old_brk {
        let mut addr = new_brk;
        while addr < old_brk {
            unsafe { unlink_page(addr) };
            addr += PAGE_SIZE as u32;
        }
    } else if new_brk > old_brk {
        let grow_pages = ((new_brk - old_brk) / PAGE_SIZE as u32) as usize;
        if grow_pages > free_pages() {
            return Err(KernelError::OutOfFrames);
        }
    }
    crate::sched::scheduler::set_current_brk(new_brk);
    Ok(())
}

/// Invalidates the TLB entry for `vaddr` via `invlpg`.
///
/// # Safety
/// `vaddr` must be a valid kernel- or user-space address in the current
/// address space.
pub unsafe fn invalidate_tlb(vaddr: u32) {
    core::arch::asm!("invlpg [{}]", in(reg) vaddr, options(nostack, preserves_flags));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_largest_region_at_one_mib() {
        let regions = [
            MemRegion { base: 0, size: 0x9_0000, usable: true },
            MemRegion { base: ONE_MIB as u64, size: 0x0100_0000, usable: true },
            MemRegion { base: 0x0200_0000, size: 0x1000_0000, usable: true },
        ];
        assert_eq!(pick_usable_region(&regions), Some((ONE_MIB as u64, 0x0100_0000)));
    }

    #[test]
    fn rejects_unaligned_region() {
        let regions = [MemRegion { base: ONE_MIB as u64, size: 0x0100_0001, usable: true }];
        assert_eq!(pick_usable_region(&regions), None);
    }
}
