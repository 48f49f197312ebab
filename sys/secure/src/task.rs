// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-task capability and ownership records.
//!
//! [`Authority`] pairs the free pool with a slot array of task records and
//! implements the whole cross-domain memory contract: allocation, free,
//! stack management, ownership transfer, and the ownership query the
//! kernel's pointer validation relies on.
//!
//! Records are keyed by task id, not slot index; [`abi::FREE_OWNER`] marks
//! an empty slot, and id 0 is the kernel's own record, created at
//! construction with maximal capabilities and no budget ceiling. Unknown
//! ids become known lazily, with default capabilities, the first time a
//! stack is allocated for them or an extent is chowned to them.
//!
//! Every operation either succeeds or returns a negative status; nothing
//! in here panics on bad input, because the inputs arrive from the far
//! side of the trust boundary.

use abi::{Sysret, TaskCaps, EACCES, ENOMEM, ENOSPC, ESRCH, FREE_OWNER};

use crate::limits::{DEFAULT_MEM_MAX, EXTENTS_PER_TASK, MAX_TASKS};
use crate::mempool::{round_up, Extent, Pool};

/// Ownership record for one task id.
#[derive(Copy, Clone, Debug)]
struct TaskRecord {
    owner: u16,
    caps: TaskCaps,
    mem_max: u32,
    mem_used: u32,
    /// Static data/bss segment, placed by the loader via chown.
    main: Option<Extent>,
    /// The task's single stack extent.
    stack: Option<Extent>,
    heap: [Option<Extent>; EXTENTS_PER_TASK],
    /// Index into `heap` of the most recent allocation, for in-place
    /// extension.
    last_heap: Option<usize>,
}

impl TaskRecord {
    const FREE: TaskRecord = TaskRecord {
        owner: FREE_OWNER,
        caps: TaskCaps::empty(),
        mem_max: 0,
        mem_used: 0,
        main: None,
        stack: None,
        heap: [None; EXTENTS_PER_TASK],
        last_heap: None,
    };

    fn reset_as(&mut self, id: u16, caps: TaskCaps, mem_max: u32) {
        *self = TaskRecord::FREE;
        self.owner = id;
        self.caps = caps;
        self.mem_max = mem_max;
    }
}

/// The secure world's view of who owns what.
#[derive(Debug)]
pub struct Authority {
    pool: Pool,
    records: [TaskRecord; MAX_TASKS],
}

impl Authority {
    /// Creates an authority managing one region of RAM. Slot 0 becomes
    /// the kernel's record.
    pub fn new(base: u32, size: u32) -> Self {
        let mut records = [TaskRecord::FREE; MAX_TASKS];
        records[0].reset_as(abi::KERNEL_PID, TaskCaps::KERNEL, u32::MAX);
        Authority {
            pool: Pool::new(base, size),
            records,
        }
    }

    fn find(&self, id: u16) -> Option<usize> {
        self.records.iter().position(|r| r.owner == id)
    }

    /// Looks up `id`, registering it with default capabilities if the
    /// secure world has not seen it before.
    fn find_or_register(&mut self, id: u16) -> Result<usize, Sysret> {
        if id == FREE_OWNER {
            return Err(ESRCH);
        }
        if let Some(i) = self.find(id) {
            return Ok(i);
        }
        let i = self
            .records
            .iter()
            .position(|r| r.owner == FREE_OWNER)
            .ok_or(ENOSPC)?;
        self.records[i].reset_as(id, TaskCaps::DEFAULT, DEFAULT_MEM_MAX);
        Ok(i)
    }

    /// Heap allocation for `id`. Returns the base address of the new
    /// memory.
    ///
    /// Without `MapFlags::NEW_EXTENT` this first tries to grow the task's
    /// most recent heap extent in place, which keeps repeated small
    /// allocations from burning extent slots.
    pub fn mmap(&mut self, size: u32, id: u16, flags: abi::MapFlags) -> Result<u32, Sysret> {
        let size = round_up(size);
        if size == 0 {
            return Err(ENOMEM);
        }
        let ri = self.find(id).ok_or(ESRCH)?;
        let r = &self.records[ri];
        if !r.caps.contains(TaskCaps::MALLOC) {
            return Err(EACCES);
        }
        if r.mem_used.checked_add(size).map_or(true, |u| u > r.mem_max) {
            return Err(ENOMEM);
        }

        if !flags.contains(abi::MapFlags::NEW_EXTENT) {
            if let Some(li) = r.last_heap {
                if let Some(last) = self.records[ri].heap[li] {
                    if self.pool.carve_at(last.end(), size) {
                        let r = &mut self.records[ri];
                        let grown = r.heap[li].as_mut().ok_or(ENOMEM)?;
                        let base = grown.end();
                        grown.size += size;
                        r.mem_used += size;
                        return Ok(base);
                    }
                }
            }
        }

        let slot = self.records[ri]
            .heap
            .iter()
            .position(|h| h.is_none())
            .ok_or(ENOSPC)?;
        let ext = self.pool.carve(size).ok_or(ENOMEM)?;
        let r = &mut self.records[ri];
        r.heap[slot] = Some(ext);
        r.last_heap = Some(slot);
        r.mem_used += ext.size;
        Ok(ext.base)
    }

    /// Frees the extent whose base is `ptr`, wherever it lives in the
    /// task's record.
    pub fn munmap(&mut self, ptr: u32, id: u16) -> Result<(), Sysret> {
        let ri = self.find(id).ok_or(ESRCH)?;
        let ext = self.detach(ri, ptr).ok_or(ESRCH)?;
        self.records[ri].mem_used -= ext.size;
        self.pool.release(ext)
    }

    /// Removes the extent based at `ptr` from record `ri`, returning it.
    /// Accounting is left to the caller.
    fn detach(&mut self, ri: usize, ptr: u32) -> Option<Extent> {
        let r = &mut self.records[ri];
        if r.main.map_or(false, |e| e.base == ptr) {
            return r.main.take();
        }
        if r.stack.map_or(false, |e| e.base == ptr) {
            return r.stack.take();
        }
        for (i, h) in r.heap.iter_mut().enumerate() {
            if h.map_or(false, |e| e.base == ptr) {
                if r.last_heap == Some(i) {
                    r.last_heap = None;
                }
                return h.take();
            }
        }
        None
    }

    /// Allocates the task's stack, replacing (and freeing) any previous
    /// one. Registers the task lazily.
    pub fn mmap_stack(&mut self, size: u32, id: u16) -> Result<u32, Sysret> {
        let size = round_up(size);
        let ri = self.find_or_register(id)?;
        if let Some(old) = self.records[ri].stack.take() {
            self.records[ri].mem_used -= old.size;
            self.pool.release(old)?;
        }
        let r = &self.records[ri];
        if r.mem_used.checked_add(size).map_or(true, |u| u > r.mem_max) {
            return Err(ENOMEM);
        }
        let ext = self.pool.carve(size).ok_or(ENOMEM)?;
        let r = &mut self.records[ri];
        r.stack = Some(ext);
        r.mem_used += ext.size;
        Ok(ext.base)
    }

    /// Exchanges the stack extents of two tasks. This is how vfork hands
    /// the physical stack to the child and takes it back later; neither
    /// extent moves in memory, only the ownership records swap.
    pub fn swap_stack(&mut self, a: u16, b: u16) -> Result<(), Sysret> {
        let ai = self.find_or_register(a)?;
        let bi = self.find_or_register(b)?;
        if ai == bi {
            return Ok(());
        }
        let sa = self.records[ai].stack;
        let sb = self.records[bi].stack;
        self.records[ai].mem_used = self.records[ai].mem_used
            - sa.map_or(0, |e| e.size)
            + sb.map_or(0, |e| e.size);
        self.records[bi].mem_used = self.records[bi].mem_used
            - sb.map_or(0, |e| e.size)
            + sa.map_or(0, |e| e.size);
        self.records[ai].stack = sb;
        self.records[bi].stack = sa;
        Ok(())
    }

    /// Transfers the extent based at `ptr` from `caller` to `new_owner`,
    /// registering the destination lazily.
    ///
    /// Placement in the destination record, in order: merge into an
    /// adjacent existing extent; become the main segment if the
    /// destination has none; otherwise take a fresh heap slot. The
    /// placement is chosen before the source record is touched, so a
    /// full destination leaves the source intact.
    pub fn chown(&mut self, ptr: u32, new_owner: u16, caller: u16) -> Result<(), Sysret> {
        let si = self.find(caller).ok_or(ESRCH)?;
        let ext = match self.peek(si, ptr) {
            Some(e) => e,
            None => return Err(ESRCH),
        };
        let di = self.find_or_register(new_owner)?;
        if si == di {
            return Ok(());
        }

        let d = &self.records[di];
        if d.mem_used
            .checked_add(ext.size)
            .map_or(true, |u| u > d.mem_max)
        {
            return Err(ENOMEM);
        }

        enum Place {
            MergeMain,
            MergeHeap(usize),
            NewMain,
            NewHeap(usize),
        }
        let place = if d.main.map_or(false, |m| m.adjacent(&ext)) {
            Place::MergeMain
        } else if let Some(i) = d
            .heap
            .iter()
            .position(|h| h.map_or(false, |e| e.adjacent(&ext)))
        {
            Place::MergeHeap(i)
        } else if d.main.is_none() {
            Place::NewMain
        } else {
            match d.heap.iter().position(|h| h.is_none()) {
                Some(i) => Place::NewHeap(i),
                None => return Err(ENOSPC),
            }
        };

        // Placement is guaranteed now; safe to mutate the source.
        let ext = self.detach(si, ptr).ok_or(ESRCH)?;
        self.records[si].mem_used -= ext.size;

        let d = &mut self.records[di];
        match place {
            Place::MergeMain => {
                let m = d.main.as_mut().ok_or(ESRCH)?;
                m.base = m.base.min(ext.base);
                m.size += ext.size;
            }
            Place::MergeHeap(i) => {
                let h = d.heap[i].as_mut().ok_or(ESRCH)?;
                h.base = h.base.min(ext.base);
                h.size += ext.size;
            }
            Place::NewMain => d.main = Some(ext),
            Place::NewHeap(i) => d.heap[i] = Some(ext),
        }
        d.mem_used += ext.size;
        Ok(())
    }

    fn peek(&self, ri: usize, ptr: u32) -> Option<Extent> {
        let r = &self.records[ri];
        [r.main, r.stack]
            .into_iter()
            .chain(r.heap)
            .flatten()
            .find(|e| e.base == ptr)
    }

    /// Ownership query: does `ptr` name the base of the task's main
    /// segment or one of its heap extents? The stack is deliberately not
    /// part of this answer; stack membership is a range check the kernel
    /// performs itself.
    pub fn owner(&self, ptr: u32, id: u16) -> bool {
        let Some(ri) = self.find(id) else {
            return false;
        };
        let r = &self.records[ri];
        r.main.map_or(false, |e| e.base == ptr)
            || r.heap.iter().flatten().any(|e| e.base == ptr)
    }

    /// The task's stack extent, if any. Used by the kernel for stack
    /// range checks and MPU programming.
    pub fn stack_extent(&self, id: u16) -> Option<Extent> {
        self.records[self.find(id)?].stack
    }

    /// Drops the task's record entirely, releasing everything it still
    /// owns back to the pool.
    pub fn retire(&mut self, id: u16) -> Result<(), Sysret> {
        let ri = self.find(id).ok_or(ESRCH)?;
        let r = self.records[ri];
        for ext in [r.main, r.stack].into_iter().chain(r.heap).flatten() {
            self.pool.release(ext)?;
        }
        self.records[ri] = TaskRecord::FREE;
        Ok(())
    }

    /// Accounting cross-check: bytes owned across every record plus
    /// bytes free in the pool.
    pub fn total_bytes(&self) -> u64 {
        let owned: u64 = self
            .records
            .iter()
            .filter(|r| r.owner != FREE_OWNER)
            .map(|r| u64::from(r.mem_used))
            .sum();
        owned + self.pool.total_free()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::MapFlags;

    const POOL_BASE: u32 = 0x3000_0000;
    const POOL_SIZE: u32 = 0x1_0000;

    fn authority() -> Authority {
        Authority::new(POOL_BASE, POOL_SIZE)
    }

    fn conserved(a: &Authority) {
        assert_eq!(a.total_bytes(), u64::from(POOL_SIZE));
    }

    #[test]
    fn lazy_registration_via_stack_alloc() {
        let mut a = authority();
        assert!(!a.owner(POOL_BASE, 7));
        let sp = a.mmap_stack(0x400, 7).unwrap();
        assert_eq!(a.stack_extent(7).unwrap().base, sp);
        conserved(&a);
    }

    #[test]
    fn mmap_requires_capability_and_budget() {
        let mut a = authority();
        // Unknown task cannot allocate.
        assert_eq!(a.mmap(0x100, 9, MapFlags::empty()), Err(ESRCH));
        // Register, then blow the budget.
        a.mmap_stack(0x400, 9).unwrap();
        assert_eq!(
            a.mmap(DEFAULT_MEM_MAX, 9, MapFlags::empty()),
            Err(ENOMEM)
        );
        conserved(&a);
    }

    #[test]
    fn mmap_extends_last_extent_in_place() {
        let mut a = authority();
        a.mmap_stack(0x400, 3).unwrap();
        let p1 = a.mmap(0x100, 3, MapFlags::empty()).unwrap();
        // Second allocation lands right after the first and merges into
        // the same extent.
        let p2 = a.mmap(0x100, 3, MapFlags::empty()).unwrap();
        assert_eq!(p2, p1 + 0x100);
        assert!(a.owner(p1, 3));
        assert!(!a.owner(p2, 3)); // not a base, part of p1's extent
        // A forced new page takes its own slot.
        let p3 = a.mmap(0x100, 3, MapFlags::NEW_EXTENT).unwrap();
        assert!(a.owner(p3, 3));
        conserved(&a);
    }

    #[test]
    fn munmap_returns_bytes_to_pool() {
        let mut a = authority();
        a.mmap_stack(0x400, 4).unwrap();
        let p = a.mmap(0x200, 4, MapFlags::empty()).unwrap();
        conserved(&a);
        a.munmap(p, 4).unwrap();
        assert!(!a.owner(p, 4));
        conserved(&a);
        // Freeing it again is an error, not a panic.
        assert_eq!(a.munmap(p, 4), Err(ESRCH));
    }

    #[test]
    fn stack_replacement_frees_old_stack() {
        let mut a = authority();
        let s1 = a.mmap_stack(0x400, 5).unwrap();
        // Pin an allocation after the stack so the freed stack cannot
        // coalesce away.
        a.mmap(0x200, 5, MapFlags::NEW_EXTENT).unwrap();
        let s2 = a.mmap_stack(0x800, 5).unwrap();
        assert_eq!(a.stack_extent(5).unwrap().base, s2);
        assert_ne!(s1, s2);
        // Old stack went back to the pool; a fresh carve reuses it.
        let p = a.mmap(0x400, 5, MapFlags::NEW_EXTENT).unwrap();
        assert_eq!(p, s1);
        conserved(&a);
    }

    #[test]
    fn swap_stack_exchanges_records() {
        let mut a = authority();
        let sp = a.mmap_stack(0x400, 1).unwrap();
        let sc = a.mmap_stack(0x200, 2).unwrap();
        a.swap_stack(1, 2).unwrap();
        assert_eq!(a.stack_extent(1).unwrap().base, sc);
        assert_eq!(a.stack_extent(2).unwrap().base, sp);
        a.swap_stack(1, 2).unwrap();
        assert_eq!(a.stack_extent(1).unwrap().base, sp);
        assert_eq!(a.stack_extent(2).unwrap().base, sc);
        conserved(&a);
    }

    #[test]
    fn chown_round_trip_restores_records() {
        let mut a = authority();
        a.mmap_stack(0x400, 1).unwrap();
        a.mmap_stack(0x400, 2).unwrap();
        let p = a.mmap(0x200, 1, MapFlags::NEW_EXTENT).unwrap();
        let before = a.total_bytes();

        a.chown(p, 2, 1).unwrap();
        assert!(!a.owner(p, 1));
        assert!(a.owner(p, 2));

        a.chown(p, 1, 2).unwrap();
        assert!(a.owner(p, 1));
        assert!(!a.owner(p, 2));
        assert_eq!(a.total_bytes(), before);
        conserved(&a);
    }

    #[test]
    fn chown_to_unknown_task_creates_main_segment() {
        let mut a = authority();
        // Kernel carves a segment and hands it to a task the secure
        // world has never heard of. That is the loader's normal path.
        let p = a.mmap(0x800, 0, MapFlags::NEW_EXTENT).unwrap();
        a.chown(p, 11, 0).unwrap();
        assert!(a.owner(p, 11));
        conserved(&a);
    }

    #[test]
    fn chown_failure_leaves_source_intact() {
        let mut a = authority();
        a.mmap_stack(0x400, 1).unwrap();
        a.mmap_stack(0x400, 2).unwrap();
        // Give task 2 a main segment plus a full heap of extents, with
        // every pair separated by an extent owned by task 3 so nothing
        // can merge. No placement exists for a further transfer.
        let m = a.mmap(0x40, 0, MapFlags::NEW_EXTENT).unwrap();
        a.chown(m, 2, 0).unwrap();
        let g0 = a.mmap(0x40, 0, MapFlags::NEW_EXTENT).unwrap();
        a.chown(g0, 3, 0).unwrap();
        for _ in 0..EXTENTS_PER_TASK {
            let h = a.mmap(0x40, 0, MapFlags::NEW_EXTENT).unwrap();
            a.chown(h, 2, 0).unwrap();
            let gap = a.mmap(0x40, 0, MapFlags::NEW_EXTENT).unwrap();
            a.chown(gap, 3, 0).unwrap();
        }
        let p = a.mmap(0x200, 1, MapFlags::NEW_EXTENT).unwrap();
        assert_eq!(a.chown(p, 2, 1), Err(ENOSPC));
        // Source still owns it and can free it.
        assert!(a.owner(p, 1));
        a.munmap(p, 1).unwrap();
        conserved(&a);
    }

    #[test]
    fn retire_releases_everything() {
        let mut a = authority();
        a.mmap_stack(0x400, 6).unwrap();
        a.mmap(0x100, 6, MapFlags::empty()).unwrap();
        a.mmap(0x100, 6, MapFlags::NEW_EXTENT).unwrap();
        a.retire(6).unwrap();
        assert!(a.stack_extent(6).is_none());
        assert_eq!(a.total_bytes(), u64::from(POOL_SIZE));
        assert_eq!(a.pool.total_free(), u64::from(POOL_SIZE));
    }

    #[test]
    fn conservation_over_mixed_sequence() {
        let mut a = authority();
        a.mmap_stack(0x400, 1).unwrap();
        a.mmap_stack(0x400, 2).unwrap();
        let mut live = [(0u32, 0u16); 8];
        for (i, slot) in live.iter_mut().enumerate() {
            let id = if i % 2 == 0 { 1 } else { 2 };
            let p = a
                .mmap(0x40 + i as u32 * 0x20, id, MapFlags::NEW_EXTENT)
                .unwrap();
            *slot = (p, id);
            conserved(&a);
        }
        // Transfer one to a task the authority has never seen, then free
        // everything from wherever it ended up.
        let (p0, _) = live[0];
        a.chown(p0, 9, 1).unwrap();
        assert!(a.owner(p0, 9));
        live[0].1 = 9;
        conserved(&a);
        for (p, id) in live {
            a.munmap(p, id).unwrap();
            conserved(&a);
        }
    }
}
