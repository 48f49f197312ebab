// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Non-secure kernel for a TrustZone-M split system.
//!
//! This is the privileged, application-independent half of the
//! non-secure world: a preemptive round-robin scheduler with a realtime
//! override, POSIX-shaped syscalls (processes, signals, file
//! descriptors, semaphores, threads), and kernel timers. Memory is the
//! one thing it does *not* own: all stack and heap backing is granted by
//! the secure image through a narrow gate, so a compromised kernel still
//! cannot reach another world's extents.
//!
//! Everything outside `arch` is portable and runs under the host test
//! harness against the real secure-side allocator, so the ownership
//! rules exercised by the tests are the ones that ship.
//!
//! # Design principles
//!
//! 1. Simple, bounded algorithms over clever ones. Task, timer, and
//!    descriptor tables are fixed arrays sized in `limits`; search is
//!    linear and the timer queue is a small binary heap.
//! 2. Safe code wherever the borrow checker can see the whole story;
//!    `unsafe` is confined to `arch` and the failure machinery.
//! 3. Blocking is always expressed as "park the task, return the retry
//!    sentinel, replay the call later." No handler ever spins.

#![cfg_attr(not(test), no_std)]

/// Kernel diagnostic logging. Compiled to an ITM or semihosting write on
/// the target depending on the `klog-*` feature, and to nothing on the
/// host (the arguments are still type-checked).
#[cfg(all(
    target_arch = "arm",
    feature = "klog-itm",
    not(feature = "klog-semihosting")
))]
#[macro_export]
macro_rules! klog {
    ($s:expr) => {
        {
            let itm = cortex_m::peripheral::ITM::PTR
                as *mut cortex_m::peripheral::itm::RegisterBlock;
            // Safety: stim 0 is reserved for the kernel by convention.
            let stim = unsafe { &mut (*itm).stim[0] };
            cortex_m::iprintln!(stim, $s);
        }
    };
    ($s:expr, $($tt:tt)*) => {
        {
            let itm = cortex_m::peripheral::ITM::PTR
                as *mut cortex_m::peripheral::itm::RegisterBlock;
            let stim = unsafe { &mut (*itm).stim[0] };
            cortex_m::iprintln!(stim, $s, $($tt)*);
        }
    };
}

#[cfg(all(target_arch = "arm", feature = "klog-semihosting"))]
#[macro_export]
macro_rules! klog {
    ($s:expr) => {
        { let _ = cortex_m_semihosting::hprintln!($s); }
    };
    ($s:expr, $($tt:tt)*) => {
        { let _ = cortex_m_semihosting::hprintln!($s, $($tt)*); }
    };
}

#[cfg(any(
    not(target_arch = "arm"),
    all(
        target_arch = "arm",
        not(feature = "klog-itm"),
        not(feature = "klog-semihosting")
    )
))]
#[macro_export]
macro_rules! klog {
    ($($tt:tt)*) => {
        { let _ = format_args!($($tt)*); }
    };
}

pub mod arch;
pub mod fail;
pub mod gate;
pub mod ktimer;
pub mod limits;
pub mod locks;
pub mod sched;
pub mod signal;
pub mod startup;
pub mod syscalls;
pub mod task;
pub mod tasklet;
pub mod time;
pub mod umem;
pub mod vfs;
