//! `talon-kernel`: a small x86 32-bit protected-mode teaching kernel.
//!
//! Built as both a library (exercised by the host-runnable `#[cfg(test)]`
//! modules scattered through its submodules) and a `no_std`/`no_main` binary
//! (`src/main.rs`) for the actual target. Module layout mirrors the
//! teacher's phase-numbered `pub mod` list in its kernel crate root, minus
//! the phases (graphics, shell, AI, SMP, ...) this kernel doesn't implement.

#![cfg_attr(not(test), no_std)]

pub mod arch;
pub mod bitmap;
pub mod boot;
pub mod config;
pub mod device;
pub mod devtree;
pub mod drivers;
pub mod error;
pub mod log;
pub mod mm;
pub mod sched;
pub mod syscall;

#[cfg(not(test))]
#[global_allocator]
static ALLOCATOR: mm::heap::KernelHeap = mm::heap::KernelHeap::new();

/// Halts the core after printing whatever `core::fmt` can recover from the
/// panic payload. The teacher's panic handler walks a recent-log ring buffer
/// and prints a register dump; this kernel has neither (`spec.md` keeps no
/// panic-time forensics beyond the one log line `panic_fatal!` already
/// emits before a deliberate halt), so the only path left uninstrumented is
/// an `unwrap`/`expect`/arithmetic panic reaching here directly rather than
/// through `panic_fatal!`.
#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    ::log::error!("panic: {}", info);
    arch::halt_forever()
}
