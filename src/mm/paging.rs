//! Two-level x86 paging: page directory / page table, self-mapping, COW
//! fork (`copy_pde`), and the page-fault decision logic (`spec.md` §4.1).
//!
//! The hardware-facing half of this module (installing `cr3`, invalidating
//! the TLB with `invlpg`) is `unsafe` and lives behind `cfg(not(test))`
//! callers; the bit-twiddling and decision logic — PTE flag composition,
//! self-map address arithmetic, and the present/absent/COW classification a
//! page fault falls into — are pure functions with host-runnable tests,
//! grounded the same way `other_examples`'s `maestro` 32-bit `vmem-x86.rs`
//! keeps its flag/entry arithmetic free of hardware access.

use bitflags::bitflags;

pub const ENTRIES_PER_TABLE: usize = 1024;
pub const PAGE_SIZE: u32 = 4096;

bitflags! {
    /// Page-directory/page-table entry flags (`spec.md` §3: "present, write,
    /// user, PWT, PCD, global bits").
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITE   = 1 << 1;
        const USER    = 1 << 2;
        const PWT     = 1 << 3;
        const PCD     = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY   = 1 << 6;
        const GLOBAL  = 1 << 8;
    }
}

const FLAGS_MASK: u32 = 0xFFF;
const ADDR_MASK: u32 = !FLAGS_MASK;

/// Composes a page-table entry from a page-aligned physical address and a
/// flag set. Low 12 bits of `phys` are discarded.
pub const fn make_entry(phys: u32, flags: PteFlags) -> u32 {
    (phys & ADDR_MASK) | (flags.bits() & FLAGS_MASK)
}

/// Splits an entry back into `(physical_address, flags)`.
pub fn split_entry(entry: u32) -> (u32, PteFlags) {
    (entry & ADDR_MASK, PteFlags::from_bits_truncate(entry & FLAGS_MASK))
}

/// Directory index (bits 31:22) for a virtual address.
pub const fn dir_index(vaddr: u32) -> usize {
    (vaddr >> 22) as usize
}

/// Table index (bits 21:12) for a virtual address.
pub const fn table_index(vaddr: u32) -> usize {
    ((vaddr >> 12) & 0x3FF) as usize
}

/// The directory slot that self-maps (the last one, `spec.md` §4.1).
pub const SELF_MAP_SLOT: usize = ENTRIES_PER_TABLE - 1;

/// Virtual address of the page directory itself, via the self-map
/// (`0xFFFFF000`, `spec.md` §4.1).
pub const SELF_MAP_PDE_ADDR: u32 = 0xFFFF_F000;

/// Virtual address at which the PTE for `vaddr` is visible through the
/// self-map window: `0xFFC00000 | (didx << 12) | (tidx << 2)`.
pub const fn self_map_pte_addr(vaddr: u32) -> u32 {
    0xFFC0_0000 | ((dir_index(vaddr) as u32) << 12) | ((table_index(vaddr) as u32) << 2)
}

/// Virtual address at which an arbitrary page table (not necessarily the one
/// backing `vaddr`) is visible through the self-map, given its directory
/// index: `0xFFC00000 | (didx << 12)`.
pub const fn self_map_table_addr(didx: usize) -> u32 {
    0xFFC0_0000 | ((didx as u32) << 12)
}

/// Outcome of classifying a page fault per `spec.md` §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    /// Present, write fault, PTE read-only, frame refcount 1: flip write=1
    /// in place, no copy needed.
    CowInPlace,
    /// Present, write fault, PTE read-only, frame refcount > 1: allocate a
    /// fresh frame, copy contents, repoint the PTE, drop the old refcount.
    CowCopy,
    /// Absent, address within `[kernel_end, brk) ∪ [stack_bottom, stack_top)`:
    /// demand-link the page.
    DemandPage,
    /// Anything else: fatal per `spec.md` §4.1/§7.
    Fatal,
}

/// Whether `vaddr` falls in one of the two ranges eligible for demand
/// paging: the heap `[kernel_end, brk)` or the user stack
/// `[user_stack_bottom, user_stack_top)`.
pub fn in_demand_range(vaddr: u32, kernel_end: u32, brk: u32, stack_bottom: u32, stack_top: u32) -> bool {
    (vaddr >= kernel_end && vaddr < brk) || (vaddr >= stack_bottom && vaddr < stack_top)
}

/// Classifies a page fault from its raw ingredients. `present`/`is_write`
/// come from the CPU error code; `pte_present`/`pte_writable`/`refcount`
/// describe the faulting PTE (when `pte_present` is true); the range
/// parameters describe the faulting task's heap/stack bounds.
#[allow(clippy::too_many_arguments)]
pub fn classify_fault(
    is_write: bool,
    pte_present: bool,
    pte_writable: bool,
    refcount: u8,
    vaddr: u32,
    kernel_end: u32,
    brk: u32,
    stack_bottom: u32,
    stack_top: u32,
) -> FaultAction {
    if pte_present && is_write && !pte_writable {
        return if refcount <= 1 { FaultAction::CowInPlace } else { FaultAction::CowCopy };
    }
    if !pte_present && in_demand_range(vaddr, kernel_end, brk, stack_bottom, stack_top) {
        return FaultAction::DemandPage;
    }
    FaultAction::Fatal
}

/// Decides, for one present user PTE during `copy_pde`, the flags the
/// parent's entry must be rewritten with (read-only so both sides fault on
/// write) and the flags the child's cloned entry should carry (same
/// physical frame, same read-only restriction — `spec.md` §4.1 "Fork
/// semantics").
pub fn cow_share_entry(original: u32) -> u32 {
    let (phys, flags) = split_entry(original);
    make_entry(phys, (flags & !PteFlags::WRITE) | PteFlags::PRESENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_round_trip() {
        let e = make_entry(0x1234_5000, PteFlags::PRESENT | PteFlags::WRITE | PteFlags::USER);
        let (addr, flags) = split_entry(e);
        assert_eq!(addr, 0x1234_5000);
        assert!(flags.contains(PteFlags::PRESENT | PteFlags::WRITE | PteFlags::USER));
    }

    #[test]
    fn self_map_addresses_match_spec_constants() {
        // didx = 0x3FF (last slot), tidx = 0x3FF -> well-known PDE address.
        let vaddr = 0xFFFF_F000u32;
        assert_eq!(dir_index(vaddr), SELF_MAP_SLOT);
        assert_eq!(table_index(vaddr), SELF_MAP_SLOT);
        assert_eq!(self_map_pte_addr(vaddr), SELF_MAP_PDE_ADDR);
    }

    #[test]
    fn cow_in_place_when_sole_owner() {
        let action = classify_fault(true, true, false, 1, 0x9000, 0x1000, 0x10000, 0x7000_0000, 0x8000_0000);
        assert_eq!(action, FaultAction::CowInPlace);
    }

    #[test]
    fn cow_copy_when_shared() {
        let action = classify_fault(true, true, false, 2, 0x9000, 0x1000, 0x10000, 0x7000_0000, 0x8000_0000);
        assert_eq!(action, FaultAction::CowCopy);
    }

    #[test]
    fn demand_page_within_heap() {
        let action = classify_fault(false, false, false, 0, 0x5000, 0x1000, 0x10000, 0x7000_0000, 0x8000_0000);
        assert_eq!(action, FaultAction::DemandPage);
    }

    #[test]
    fn demand_page_within_stack() {
        let action = classify_fault(true, false, false, 0, 0x7FFF_F000, 0x1000, 0x10000, 0x7000_0000, 0x8000_0000);
        assert_eq!(action, FaultAction::DemandPage);
    }

    #[test]
    fn anything_else_is_fatal() {
        // Write to a present, already-writable page: not a COW case at all.
        let action = classify_fault(true, true, true, 1, 0x9000, 0x1000, 0x10000, 0x7000_0000, 0x8000_0000);
        assert_eq!(action, FaultAction::Fatal);
        // Absent but outside heap/stack.
        let action2 = classify_fault(false, false, false, 0, 0x2_0000_0000u32 as u32, 0x1000, 0x10000, 0x7000_0000, 0x8000_0000);
        assert_eq!(action2, FaultAction::Fatal);
    }

    #[test]
    fn cow_share_entry_clears_write_keeps_present() {
        let e = make_entry(0xA000, PteFlags::PRESENT | PteFlags::WRITE | PteFlags::USER);
        let shared = cow_share_entry(e);
        let (addr, flags) = split_entry(shared);
        assert_eq!(addr, 0xA000);
        assert!(flags.contains(PteFlags::PRESENT | PteFlags::USER));
        assert!(!flags.contains(PteFlags::WRITE));
    }
}
