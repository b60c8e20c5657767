//! Device drivers (`spec.md` §4.6-§4.8): block storage (IDE, NVMe) and the
//! fixed character devices (keyboard, RTC). The console device lives in
//! [`crate::log`] since it shares the serial port logging already opens.

pub mod ide;
pub mod keyboard;
pub mod mbr;
pub mod nvme;
pub mod rtc;
