//! Bootloader handoff and bring-up orchestration.
//!
//! `spec.md` §1 treats the bootloader itself as an external collaborator —
//! only the handoff data (a tagged memory map and an optional flattened
//! device-tree blob) is in scope. This module is the adapter: it decodes
//! whichever handoff format the build was configured for, builds the very
//! first page tables by hand (before any of [`crate::mm`]'s self-map-based
//! helpers are usable), and then drives the fixed bring-up order `spec.md`
//! §9 "Globals" specifies: GDT → memory → paging → IDT → APIC → devices →
//! task.
//!
//! Grounded on the teacher's `init::boot` + arch-specific `boot.rs` pair,
//! which plays the same "first Rust code after the loader" role; the
//! teacher's loader (UEFI) hands off with paging already enabled, so its
//! `boot.rs` has no page-table bootstrap of its own. This kernel's loader
//! contract (`spec.md` §6 "Boot handoff") hands off flat protected mode with
//! paging *disabled*, so that half is new here, grounded instead on
//! `other_examples`'s `maestro` 32-bit boot assembly/paging bring-up.

use core::mem::size_of_val;

use crate::config::RuntimeConfig;
use crate::mm::paging::{self, PteFlags};
use crate::mm::MemRegion;

/// Real multiboot2 bootloader handoff magic (`spec.md` §6 format (b)).
const MULTIBOOT2_MAGIC: u32 = 0x3630_6289;
/// This kernel's own legacy handoff magic (`spec.md` §6 format (a)).
const LEGACY_MAGIC: u32 = 0x1BAD_B002;

const MAX_REGIONS: usize = 32;

#[repr(C)]
struct LegacyHeader {
    magic: u32,
    count: u32,
}

#[repr(C)]
struct LegacyRegion {
    base: u64,
    size: u64,
    kind: u32,
    _pad: u32,
}

/// `type = 1` is "available RAM" in both the legacy and Multiboot2 formats.
const REGION_TYPE_AVAILABLE: u32 = 1;

/// Decodes this kernel's own minimal handoff format: a magic/count header
/// immediately followed by `count` fixed-size region records.
unsafe fn parse_legacy(info_ptr: u32) -> ([MemRegion; MAX_REGIONS], usize) {
    let header = &*(info_ptr as *const LegacyHeader);
    assert_eq!(header.magic, LEGACY_MAGIC, "boot: bad legacy memory-map magic");
    let regions_ptr = (info_ptr as usize + size_of_val(header)) as *const LegacyRegion;
    let mut out = [MemRegion { base: 0, size: 0, usable: false }; MAX_REGIONS];
    let n = (header.count as usize).min(MAX_REGIONS);
    for i in 0..n {
        let r = &*regions_ptr.add(i);
        out[i] = MemRegion { base: r.base, size: r.size, usable: r.kind == REGION_TYPE_AVAILABLE };
    }
    (out, n)
}

/// Decodes a Multiboot2 tag stream, pulling the memory-map tag (type 6) out
/// of it (`spec.md` §6 format (b)). Other tags are skipped.
#[cfg(feature = "multiboot2")]
unsafe fn parse_multiboot2(info_ptr: u32) -> ([MemRegion; MAX_REGIONS], usize) {
    const TAG_MEMORY_MAP: u32 = 6;
    const TAG_END: u32 = 0;

    let total_size = core::ptr::read_unaligned(info_ptr as *const u32);
    let mut out = [MemRegion { base: 0, size: 0, usable: false }; MAX_REGIONS];
    let mut n = 0usize;

    let mut cursor = info_ptr + 8; // skip total_size + reserved
    let end = info_ptr + total_size;
    while cursor < end {
        let tag_type = core::ptr::read_unaligned(cursor as *const u32);
        let tag_size = core::ptr::read_unaligned((cursor + 4) as *const u32);
        if tag_type == TAG_END {
            break;
        }
        if tag_type == TAG_MEMORY_MAP {
            let entry_size = core::ptr::read_unaligned((cursor + 8) as *const u32);
            let entries_start = cursor + 16;
            let entries_end = cursor + tag_size;
            let mut entry = entries_start;
            while entry + 24 <= entries_end && n < MAX_REGIONS {
                let base = core::ptr::read_unaligned(entry as *const u64);
                let length = core::ptr::read_unaligned((entry + 8) as *const u64);
                let kind = core::ptr::read_unaligned((entry + 16) as *const u32);
                out[n] = MemRegion { base, size: length, usable: kind == REGION_TYPE_AVAILABLE };
                n += 1;
                entry += entry_size;
            }
        }
        cursor += (tag_size + 7) & !7; // tags are 8-byte aligned
    }
    (out, n)
}

/// Early page-table bootstrap: identity-maps `[0, IDENTITY_RANGE)` and
/// installs the last directory slot as the self-map (`spec.md` §4.1), then
/// loads `cr3` and flips `CR0.PG`. Runs entirely without the self-map-based
/// helpers in [`crate::mm`], since none of them are usable before this.
const IDENTITY_TABLES: usize = 16; // 16 * 4 MiB = 64 MiB kernel VA range

#[repr(C, align(4096))]
#[derive(Clone, Copy)]
struct PageDirectory([u32; paging::ENTRIES_PER_TABLE]);

#[repr(C, align(4096))]
#[derive(Clone, Copy)]
struct PageTable([u32; paging::ENTRIES_PER_TABLE]);

static mut EARLY_PD: PageDirectory = PageDirectory([0; paging::ENTRIES_PER_TABLE]);
static mut EARLY_PTS: [PageTable; IDENTITY_TABLES] =
    [PageTable([0; paging::ENTRIES_PER_TABLE]); IDENTITY_TABLES];

/// Backing storage for the physical frame map's reference counts, sized for
/// up to 512 MiB of tracked RAM. Declared here (not in `mm`) because it must
/// be a `'static` buffer handed to `mm::init` once, at the one call site
/// that owns bring-up ordering.
const MAX_TRACKED_PAGES: usize = 512 * 1024 * 1024 / paging::PAGE_SIZE as usize;
static mut FRAME_REFCOUNTS: [u8; MAX_TRACKED_PAGES] = [0; MAX_TRACKED_PAGES];

/// Backing storage for the kernel virtual-address bitmap, covering the same
/// 64 MiB window the identity map above establishes.
const KERNEL_VA_BITMAP_BYTES: usize = (IDENTITY_TABLES * paging::ENTRIES_PER_TABLE) / 8;
static mut KERNEL_VA_BITMAP_STORAGE: [u8; KERNEL_VA_BITMAP_BYTES] = [0; KERNEL_VA_BITMAP_BYTES];

/// Returns the first virtual/physical address not covered by this module's
/// own static buffers — the boundary `mm::alloc_kpage` starts handing out
/// pages from, and the value `mm::kernel_pde_split` rounds up to decide the
/// kernel/user split of a page directory.
///
/// Open Question resolution (see DESIGN.md): with no linker script in this
/// exercise's scope, "end of kernel image" is approximated as the end of the
/// bring-up module's own static storage, which is the last thing placed in
/// the kernel's BSS/data by construction of this file.
pub fn kernel_end() -> u32 {
    unsafe {
        let candidates = [
            (core::ptr::addr_of!(EARLY_PD) as u32) + size_of_val(&EARLY_PD) as u32,
            (core::ptr::addr_of!(EARLY_PTS) as u32) + size_of_val(&EARLY_PTS) as u32,
            (core::ptr::addr_of!(FRAME_REFCOUNTS) as u32) + size_of_val(&FRAME_REFCOUNTS) as u32,
            (core::ptr::addr_of!(KERNEL_VA_BITMAP_STORAGE) as u32) + size_of_val(&KERNEL_VA_BITMAP_STORAGE) as u32,
        ];
        (candidates.into_iter().max().unwrap() + paging::PAGE_SIZE - 1) & !(paging::PAGE_SIZE - 1)
    }
}

/// Builds the bootstrap identity map + self-map and enables paging.
///
/// # Safety
/// Must run exactly once, before any `mm::` function that touches the
/// self-map, with paging currently disabled.
unsafe fn bootstrap_paging() {
    let pd = core::ptr::addr_of_mut!(EARLY_PD);
    let pts = core::ptr::addr_of_mut!(EARLY_PTS);

    for t in 0..IDENTITY_TABLES {
        let table = &mut (*pts)[t];
        for i in 0..paging::ENTRIES_PER_TABLE {
            let phys = ((t * paging::ENTRIES_PER_TABLE + i) as u32) * paging::PAGE_SIZE;
            table.0[i] = paging::make_entry(phys, PteFlags::PRESENT | PteFlags::WRITE);
        }
        let table_phys = (&(*pts)[t]) as *const PageTable as u32;
        (*pd).0[t] = paging::make_entry(table_phys, PteFlags::PRESENT | PteFlags::WRITE);
    }

    let pd_phys = pd as u32;
    (*pd).0[paging::SELF_MAP_SLOT] = paging::make_entry(pd_phys, PteFlags::PRESENT | PteFlags::WRITE);

    crate::arch::cpu::load_cr3(pd_phys);
    x86::controlregs::cr0_write(x86::controlregs::cr0() | x86::controlregs::Cr0::CR0_ENABLE_PAGING);
}

/// Installs the console character device (serial-backed, `spec.md` §4.8 /
/// §1 "Deliberately out of scope: Console text rendering" — only the device
/// node is in scope here, not a text renderer).
fn install_console_device() {
    use crate::device::{device_install, DeviceOps, DeviceSubtype, DeviceType};
    use crate::error::Errno;

    fn console_read(_dev: usize, _buf: &mut [u8], _sector: u64, _count: u32) -> Result<(), Errno> {
        Err(Errno::EPERM)
    }
    fn console_write(_dev: usize, buf: &[u8], _sector: u64, _count: u32) -> Result<(), Errno> {
        for &b in buf {
            crate::log::console_putc(b);
        }
        Ok(())
    }

    let ops = DeviceOps { read: Some(console_read), write: Some(console_write), ioctl: None };
    device_install(DeviceType::Char, DeviceSubtype::Console, None, ops);
}

/// Entry point reached from `main.rs`'s `_start`, with `magic`/`info_ptr`
/// holding whatever the bootloader passed in `eax`/`ebx` per the Multiboot
/// calling convention (both the legacy and Multiboot2 handoffs use the same
/// register pair).
///
/// # Safety
/// Must be the very first Rust code to run, on the bootstrap processor,
/// with a valid stack and interrupts disabled.
pub unsafe fn start(magic: u32, info_ptr: u32) -> ! {
    let runtime_config = RuntimeConfig::default();
    crate::log::init(runtime_config.log_level);
    crate::log::boot_banner();

    #[cfg(feature = "multiboot2")]
    let (regions, region_count) = {
        assert_eq!(magic, MULTIBOOT2_MAGIC, "boot: expected a Multiboot2 handoff");
        parse_multiboot2(info_ptr)
    };
    #[cfg(not(feature = "multiboot2"))]
    let (regions, region_count) = {
        assert_eq!(magic, LEGACY_MAGIC, "boot: expected this kernel's legacy handoff");
        parse_legacy(info_ptr)
    };

    let (base, size) =
        crate::mm::pick_usable_region(&regions[..region_count]).unwrap_or_else(|| crate::panic_fatal!("boot: no usable memory region at 1 MiB"));
    log::info!("boot: usable region base={:#x} size={:#x}", base, size);

    let start_page = (base / paging::PAGE_SIZE as u64) as usize;
    let total_pages = (size / paging::PAGE_SIZE as u64) as usize;
    let kernel_end_abs_page = (kernel_end() / paging::PAGE_SIZE) as usize;
    let kernel_image_pages = kernel_end_abs_page.saturating_sub(start_page).max(1);
    let kernel_va_base_page = kernel_end_abs_page;

    crate::mm::init(
        &mut *core::ptr::addr_of_mut!(FRAME_REFCOUNTS),
        start_page,
        total_pages,
        kernel_image_pages,
        &mut *core::ptr::addr_of_mut!(KERNEL_VA_BITMAP_STORAGE),
        kernel_va_base_page,
    );

    bootstrap_paging();

    crate::arch::init();

    #[cfg(feature = "fdt")]
    if let Some(fdt_ptr) = find_fdt_blob(info_ptr) {
        log::info!("boot: device tree present at {:#x}", fdt_ptr);
    }

    drivers_init();

    let idle_tcb_page = crate::mm::alloc_kpage(1).unwrap_or_else(|_| crate::panic_fatal!("boot: out of kernel VA for idle TCB"));
    let kernel_pde = crate::arch::cpu::read_cr3();
    crate::sched::scheduler::install_idle_task(idle_tcb_page, kernel_pde);

    log::info!("boot: bring-up complete, entering idle loop");
    loop {
        crate::arch::set_interrupt_state(true);
        x86::halt();
    }
}

/// Brings up the block and character device drivers, in the order `spec.md`
/// components are numbered (IDE before NVMe, storage before input/clock).
unsafe fn drivers_init() {
    install_console_device();
    crate::drivers::ide::init();
    crate::drivers::nvme::init();
    crate::drivers::keyboard::init();
    crate::drivers::rtc::init();
}

#[cfg(feature = "fdt")]
unsafe fn find_fdt_blob(_info_ptr: u32) -> Option<u32> {
    // Supplement (`spec.md` §6): the FDT pointer's exact placement in the
    // handoff is bootloader-specific and out of this core's scope; builds
    // enabling `fdt` are expected to locate the blob themselves and call
    // `crate::devtree::DeviceTree::parse` directly. This hook exists so that
    // wiring is a one-line addition once a loader contract is chosen.
    None
}
