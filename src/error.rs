//! Kernel-wide error types.
//!
//! `spec.md` §7 distinguishes three error kinds: fatal assertions (print and
//! halt), hardware errors (logged, surfaced as an EOF-like sentinel), and
//! user errors (returned as `-1`/`-errno` to userspace, never fatal). `Errno`
//! covers the latter two; [`panic_fatal`] covers the first.

/// POSIX-flavored error codes returned by kernel-internal calls and, via the
/// syscall gate (§6), negated into EAX for userspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Errno {
    /// Operation not permitted / not supported for this object.
    EPERM = 1,
    /// No such process (bad pid to waitpid/kill).
    ESRCH = 3,
    /// Interrupted (reserved; no signals in this core).
    EINTR = 4,
    /// I/O error: a driver observed a hardware fault.
    EIO = 5,
    /// Bad file descriptor.
    EBADF = 9,
    /// Out of memory (frame or kernel-VA exhaustion reported non-fatally,
    /// e.g. from `sys_brk` growth checks).
    ENOMEM = 12,
    /// Bad address (faulting access outside any valid region).
    EFAULT = 14,
    /// Invalid argument.
    EINVAL = 22,
    /// No child processes match a `waitpid` request.
    ECHILD = 10,
    /// Resource temporarily unavailable.
    EAGAIN = 11,
}

impl Errno {
    /// The value placed in EAX for a failing syscall: `-errno`.
    pub const fn to_retval(self) -> i32 {
        -(self as i32)
    }
}

/// Errors from allocator-adjacent subsystems that the caller cannot recover
/// from locally; callers of these APIs are expected to `panic_fatal!` rather
/// than propagate further, per `spec.md` §7's "Fatal assertion" kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// The physical frame map has no free frames (`spec.md` §4.1: "Out of
    /// memory is fatal").
    OutOfFrames,
    /// The kernel virtual-address bitmap has no run of `n` free pages.
    OutOfKernelVa,
    /// The fixed-size task table has no free slot for a new fork.
    OutOfTaskSlots,
    /// A heap arena allocation failed (size-class exhausted and no new
    /// arena could be obtained from the frame allocator).
    HeapExhausted,
}

/// Logs `reason` with the calling subsystem's context and halts the core.
///
/// This is the only sanctioned response to a violated invariant (corrupt
/// TCB magic, double-release, allocator exhaustion, unknown device, an
/// impossible state transition) per `spec.md` §7. It never returns.
#[macro_export]
macro_rules! panic_fatal {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        $crate::arch::halt_forever()
    }};
}
