// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Secure-world memory authority.
//!
//! This crate is the half of the system that lives behind the TrustZone
//! boundary. It tracks which task owns which extents of physical RAM and
//! hands memory out to the non-secure kernel through a small set of gated
//! entry points. Nothing here trusts the caller: every request names the
//! task it acts for, and every address-typed argument is checked before
//! use.
//!
//! The crate is deliberately dependency-light and free of hardware access
//! so the ownership logic can be tested exhaustively on the host; the gate
//! veneers in [`gate`] are the only target-specific pieces.

#![cfg_attr(not(test), no_std)]
#![forbid(clippy::wildcard_imports)]

pub mod gate;
pub mod limits;
pub mod mempool;
pub mod task;

pub use mempool::{Extent, Pool};
pub use task::Authority;
