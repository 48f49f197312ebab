// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Static sizing for kernel tables.
//!
//! Everything here is a compile-time constant; the kernel allocates nothing
//! at runtime. Overflowing one of these under a correct configuration is a
//! build sizing bug, and the affected subsystem says so loudly rather than
//! degrading.

/// Task control block arena size, including the init task.
pub const MAX_TASKS: usize = 16;

/// File descriptors per process.
pub const FD_MAX: usize = 16;

/// File-descriptor tables available for sharing across thread groups.
pub const FD_TABLES: usize = MAX_TASKS;

/// Semaphore/mutex records.
pub const MAX_SEMS: usize = 16;

/// Listener slots per semaphore wait-set.
pub const SEM_LISTENERS: usize = 8;

/// Kernel timer heap capacity.
pub const MAX_TIMERS: usize = 16;

/// Tasklet queue depth. Enqueueing past this halts the kernel.
pub const MAX_TASKLETS: usize = 16;

/// Deferred kernel work items (child-exit notifications, teardown).
pub const MAX_DEFERRED: usize = 16;

/// Registered VFS modules.
pub const MAX_MODULES: usize = 8;

/// Default stack allocation for spawned tasks, in bytes.
pub const DEFAULT_STACK_SIZE: u32 = 2048;

/// Threads per thread group.
pub const MAX_THREADS: usize = 8;

/// Thread group records.
pub const MAX_GROUPS: usize = 8;

/// Longest path accepted by the open/creat/unlink syscalls.
pub const PATH_MAX: usize = 64;
