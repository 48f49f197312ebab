// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fatal-condition handling.
//!
//! Conditions like tasklet queue overflow or an implausible callback
//! address indicate a build or sizing bug, not a runtime situation worth
//! recovering from. The kernel records a short reason where a debugger can
//! find it and parks the CPU; the watchdog or the developer takes it from
//! there.
//!
//! Binary interface for tooling: `KERNEL_HAS_FAILED` is a `bool` cleared
//! before kernel main and set on the way down; `KERNEL_EPITAPH` holds the
//! truncated UTF-8 reason, NUL-padded.

use core::fmt::Display;
#[cfg(not(test))]
use core::fmt::Write;

/// One-stop flag for kernel triage tools.
#[cfg(not(test))]
#[used]
static mut KERNEL_HAS_FAILED: bool = false;

#[cfg(not(test))]
const EPITAPH_LEN: usize = 128;

#[cfg(not(test))]
#[used]
static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

#[cfg(not(test))]
fn begin_epitaph() -> &'static mut [u8; EPITAPH_LEN] {
    // Safety: only reached from `die`, which runs at most once with
    // interrupts implicitly irrelevant; a second entry spins below instead
    // of aliasing the buffer.
    let previous_fail = unsafe {
        core::ptr::replace(core::ptr::addr_of_mut!(KERNEL_HAS_FAILED), true)
    };
    if previous_fail {
        // Recursive failure; parking without another epitaph write is the
        // only safe move.
        loop {
            core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
        }
    }
    unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH) }
}

/// Records `msg` and halts.
///
/// In host test builds this panics instead, so a failing invariant shows up
/// as a test failure rather than a hung test binary.
#[inline(always)]
pub fn die(msg: impl Display) -> ! {
    die_impl(&msg)
}

#[cfg(not(test))]
#[inline(never)]
fn die_impl(msg: &dyn Display) -> ! {
    let buf = begin_epitaph();
    let mut writer = Eulogist { dest: buf };
    write!(writer, "{msg}").ok();
    crate::klog!("kernel died: see epitaph");

    loop {
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
fn die_impl(msg: &dyn Display) -> ! {
    // The epitaph machinery is once-only; tests exercise fatal paths
    // repeatedly, so just panic.
    panic!("kernel died: {msg}");
}

#[cfg(not(test))]
struct Eulogist {
    dest: &'static mut [u8],
}

#[cfg(not(test))]
impl Write for Eulogist {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let s = s.as_bytes();
        let n = s.len().min(self.dest.len());
        let (dest, leftovers) = {
            let taken = core::mem::take(&mut self.dest);
            taken.split_at_mut(n)
        };
        dest.copy_from_slice(&s[..n]);
        self.dest = leftovers;
        Ok(())
    }
}

#[cfg(all(target_os = "none", not(test)))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    die(info)
}
