// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Safely(ish) handling user memory.
//!
//! Syscall arguments that name memory are checked before the kernel
//! touches them. The check has two legs: a range within the caller's own
//! stack is verified kernel-side, and anything else must be the base of an
//! extent the secure authority records for the caller. A vfork child that
//! has not execed yet still runs in its parent's address space, so its
//! checks also accept the parent's extents.
//!
//! The base-equality rule is deliberate: the authority answers "is this
//! the base of one of your extents", not "is this inside one of your
//! extents", so a task can hand the kernel a buffer it allocated but not
//! an interior pointer into it. Interior pointers into the stack are fine.

use abi::{Sysret, EACCES, EINVAL};

use crate::gate::MemoryAuthority;
use crate::sched::Sched;

/// A user-supplied byte range, unverified until [`validate`] passes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct USlice {
    base: u32,
    len: u32,
}

impl USlice {
    /// Rejects ranges that wrap the address space.
    pub fn new(base: u32, len: u32) -> Result<Self, Sysret> {
        base.checked_add(len).ok_or(EINVAL)?;
        Ok(USlice { base, len })
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Materializes the range for reading.
    ///
    /// # Safety
    ///
    /// Caller must have run [`validate`] for the task whose memory this
    /// is, and the task must not run while the slice is live.
    #[cfg(target_arch = "arm")]
    pub unsafe fn assume_readable(&self) -> &[u8] {
        core::slice::from_raw_parts(self.base as *const u8, self.len as usize)
    }

    /// Materializes the range for writing.
    ///
    /// # Safety
    ///
    /// Same conditions as [`Self::assume_readable`], plus exclusivity:
    /// no other live reference to this range.
    #[cfg(target_arch = "arm")]
    pub unsafe fn assume_writable(&self) -> &mut [u8] {
        core::slice::from_raw_parts_mut(self.base as *mut u8, self.len as usize)
    }
}

/// Checks that the task at arena index `caller` may hand the kernel the
/// range `slice`. Empty ranges are trivially fine.
pub fn validate<A: MemoryAuthority>(
    sched: &Sched,
    auth: &mut A,
    caller: usize,
    slice: &USlice,
) -> Result<(), Sysret> {
    if slice.is_empty() {
        return Ok(());
    }

    let t = sched.task(caller);
    if t.stack_contains(slice.base, slice.len) {
        return Ok(());
    }
    if auth.owner(slice.base, t.pid()) {
        return Ok(());
    }

    // Pre-exec vfork children share the parent's address space.
    if let Some(p) = t.vfork_parent {
        let parent = sched.task(p);
        if parent.stack_contains(slice.base, slice.len)
            || auth.owner(slice.base, parent.pid())
        {
            return Ok(());
        }
    }

    Err(EACCES)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::FdPool;
    use abi::{ExecInfo, MapFlags};
    use secure::mempool::Extent;

    fn auth() -> secure::gate::Gate {
        let ns = Extent {
            base: 0x2000_0000,
            size: 0x10_0000,
        };
        secure::gate::Gate::new(0x2001_0000, 0x2_0000, ns, 1)
    }

    fn setup() -> (Sched, secure::gate::Gate, usize) {
        let mut s = Sched::new();
        let mut a = auth();
        let mut fds = FdPool::new();
        let exec = ExecInfo {
            entry: 0x0800_1000,
            text_size: 0x1000,
            data_size: 0,
            got_base: 0,
        };
        let idx = s.task_create(&mut a, &mut fds, exec, 0, 0).unwrap();
        (s, a, idx)
    }

    #[test]
    fn stack_interior_pointers_pass() {
        let (s, mut a, idx) = setup();
        let t = s.task(idx);
        let inside = USlice::new(t.stack_base + 16, 32).unwrap();
        assert_eq!(validate(&s, &mut a, idx, &inside), Ok(()));

        // Running off the end of the stack does not.
        let spill =
            USlice::new(t.stack_base + t.stack_size - 4, 8).unwrap();
        assert_eq!(validate(&s, &mut a, idx, &spill), Err(EACCES));
    }

    #[test]
    fn heap_checks_are_base_equality() {
        let (s, mut a, idx) = setup();
        let pid = s.task(idx).pid();
        let base = a.mmap(0x100, pid, MapFlags::empty()).unwrap();

        let whole = USlice::new(base, 0x100).unwrap();
        assert_eq!(validate(&s, &mut a, idx, &whole), Ok(()));

        let interior = USlice::new(base + 4, 8).unwrap();
        assert_eq!(validate(&s, &mut a, idx, &interior), Err(EACCES));
    }

    #[test]
    fn foreign_memory_is_refused() {
        let (mut s, mut a, idx) = setup();
        let mut fds = FdPool::new();
        let exec = s.task(idx).exec;
        let other = s.task_create(&mut a, &mut fds, exec, 0, 1).unwrap();
        let theirs = a
            .mmap(0x100, s.task(other).pid(), MapFlags::empty())
            .unwrap();

        let slice = USlice::new(theirs, 0x100).unwrap();
        assert_eq!(validate(&s, &mut a, idx, &slice), Err(EACCES));
    }

    #[test]
    fn vfork_child_may_use_parent_memory() {
        let (mut s, mut a, parent) = setup();
        let mut fds = FdPool::new();
        let ppid = s.task(parent).pid();
        let heap = a.mmap(0x100, ppid, MapFlags::empty()).unwrap();

        let child = s.vfork(&mut a, &mut fds, parent).unwrap();

        let slice = USlice::new(heap, 0x100).unwrap();
        assert_eq!(validate(&s, &mut a, child, &slice), Ok(()));
    }

    #[test]
    fn wrapping_range_is_invalid() {
        assert_eq!(USlice::new(u32::MAX - 4, 16), Err(EINVAL));
    }
}
