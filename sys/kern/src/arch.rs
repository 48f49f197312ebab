// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support.
//!
//! The portable kernel sees one surface: a `SavedState` implementing
//! [`crate::task::ArchState`], context initialization, user-memory copy
//! primitives, the interrupt mask guard, the code-region plausibility
//! check, and the signal-frame splice. On ARMv8-M that surface is backed
//! by real exception frames and PRIMASK; everywhere else a fake backs it
//! so the kernel's logic runs under the host test harness.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "arm")] {
        mod arm_m;
        pub use arm_m::*;
    } else {
        mod fake;
        pub use fake::*;
    }
}
