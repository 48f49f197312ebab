// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Static sizing for the secure world's fixed tables.
//!
//! These are compile-time limits in the same spirit as the rest of the
//! system's static configuration: if a workload exceeds them, the right
//! response is to rebuild with bigger tables, not to grow at runtime.

/// Number of task capability records, including the kernel's slot 0.
pub const MAX_TASKS: usize = 16;

/// Heap extents a single task may own at once, beyond its main and stack
/// segments.
pub const EXTENTS_PER_TASK: usize = 8;

/// Free-pool extent records. Worst-case fragmentation of the managed RAM
/// must fit here; `Pool::release` reports no-space if it cannot.
pub const MAX_FREE_EXTENTS: usize = 32;

/// Default memory budget, in bytes, for lazily registered tasks.
pub const DEFAULT_MEM_MAX: u32 = 32 * 1024;

/// Allocation granule. Every extent base and size is a multiple of this.
pub const GRANULE: u32 = 32;
