// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel time.
//!
//! Time is counted in scheduler ticks from boot. The tick source is the
//! architecture layer (SysTick on hardware, the test driver on the host);
//! everything above it deals only in this `Timestamp` type.

/// Monotonic in-kernel timestamp, in ticks since boot.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd,
)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Self = Timestamp(0);

    /// Advances by one tick.
    pub fn advance(&mut self) {
        self.0 += 1;
    }

    /// The absolute deadline `ticks` from now.
    pub fn deadline(self, ticks: u32) -> Timestamp {
        Timestamp(self.0 + u64::from(ticks))
    }
}

impl From<u64> for Timestamp {
    fn from(v: u64) -> Self {
        Timestamp(v)
    }
}

impl From<Timestamp> for u64 {
    fn from(v: Timestamp) -> Self {
        v.0
    }
}
