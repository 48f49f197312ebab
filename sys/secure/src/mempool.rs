// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Free memory pool.
//!
//! A flat, fixed-capacity list of `(base, size)` extents describing the
//! unallocated portion of secure-managed RAM. The pool knows nothing about
//! tasks; ownership bookkeeping lives in [`crate::task`]. The one structural
//! promise made here is mergeability: releasing an extent coalesces it with
//! every adjacent free extent before it is allowed to occupy a slot of its
//! own, so fragmentation of the slot table only reflects genuine
//! fragmentation of the address space.

use abi::{Sysret, EINVAL, ENOSPC};

use crate::limits::{GRANULE, MAX_FREE_EXTENTS};

/// A contiguous memory range. `base` and `size` are byte-granular at the
/// type level but always multiples of [`GRANULE`] in practice.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Extent {
    pub base: u32,
    pub size: u32,
}

impl Extent {
    /// First address past the end of the extent.
    pub fn end(&self) -> u32 {
        self.base + self.size
    }

    /// Checks whether `addr` falls inside this extent.
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Checks whether `other` starts exactly where this extent ends or
    /// vice versa, i.e. the two could merge into one extent.
    pub fn adjacent(&self, other: &Extent) -> bool {
        self.end() == other.base || other.end() == self.base
    }

    fn overlaps(&self, other: &Extent) -> bool {
        self.base < other.end() && other.base < self.end()
    }
}

/// Rounds a requested size up to the allocation granule.
pub fn round_up(size: u32) -> u32 {
    (size + GRANULE - 1) & !(GRANULE - 1)
}

/// The free pool itself: a slot array of unallocated extents.
#[derive(Debug)]
pub struct Pool {
    free: [Option<Extent>; MAX_FREE_EXTENTS],
}

impl Pool {
    /// Creates a pool covering one initial region of RAM.
    pub fn new(base: u32, size: u32) -> Self {
        let mut free = [None; MAX_FREE_EXTENTS];
        free[0] = Some(Extent { base, size });
        Pool { free }
    }

    /// Total unallocated bytes. Used by accounting checks; O(slots).
    pub fn total_free(&self) -> u64 {
        self.free
            .iter()
            .flatten()
            .map(|e| u64::from(e.size))
            .sum()
    }

    /// Takes `size` bytes (rounded up to the granule) out of the
    /// lowest-addressed free extent large enough to supply them, so freed
    /// low memory is reused before the pool's untouched tail. Returns the
    /// carved extent, or `None` if no single free extent can satisfy the
    /// request.
    pub fn carve(&mut self, size: u32) -> Option<Extent> {
        let size = round_up(size);
        if size == 0 {
            return None;
        }
        let (i, e) = self
            .free
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.map(|e| (i, e)))
            .filter(|(_, e)| e.size >= size)
            .min_by_key(|(_, e)| e.base)?;
        let carved = Extent { base: e.base, size };
        self.free[i] = if e.size == size {
            None
        } else {
            Some(Extent {
                base: e.base + size,
                size: e.size - size,
            })
        };
        Some(carved)
    }

    /// Takes `size` bytes from the free extent that begins exactly at
    /// `at`, if one exists and is large enough. This is the growth path
    /// for extending a task's most recent heap extent in place.
    pub fn carve_at(&mut self, at: u32, size: u32) -> bool {
        let size = round_up(size);
        for slot in self.free.iter_mut() {
            let Some(e) = slot else { continue };
            if e.base != at || e.size < size {
                continue;
            }
            if e.size == size {
                *slot = None;
            } else {
                e.base += size;
                e.size -= size;
            }
            return true;
        }
        false
    }

    /// Returns an extent to the pool.
    ///
    /// The extent is first grown by absorbing every free extent adjacent to
    /// it -- iterating, so a release that bridges two free neighbors
    /// collapses all three into one record. Only then does it occupy a
    /// slot. Overlap with any free extent indicates a double free and is
    /// rejected before any mutation.
    pub fn release(&mut self, ext: Extent) -> Result<(), Sysret> {
        if ext.size == 0 {
            return Err(EINVAL);
        }
        if self.free.iter().flatten().any(|e| e.overlaps(&ext)) {
            return Err(EINVAL);
        }

        let mut merged = ext;
        loop {
            let mut grew = false;
            for slot in self.free.iter_mut() {
                let Some(e) = *slot else { continue };
                if e.adjacent(&merged) {
                    merged = Extent {
                        base: merged.base.min(e.base),
                        size: merged.size + e.size,
                    };
                    *slot = None;
                    grew = true;
                }
            }
            if !grew {
                break;
            }
        }

        match self.free.iter_mut().find(|s| s.is_none()) {
            Some(slot) => {
                *slot = Some(merged);
                Ok(())
            }
            // Can only happen if MAX_FREE_EXTENTS undersizes worst-case
            // fragmentation; surfaced, not hidden, so the caller can halt.
            None => Err(ENOSPC),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Pool {
        Pool::new(0x2000_0000, 0x1_0000)
    }

    #[test]
    fn carve_and_accounting() {
        let mut p = pool();
        let total = p.total_free();
        let a = p.carve(100).unwrap();
        assert_eq!(a.base, 0x2000_0000);
        assert_eq!(a.size, round_up(100));
        assert_eq!(p.total_free(), total - u64::from(a.size));
    }

    #[test]
    fn carve_prefers_lowest_base() {
        let mut p = pool();
        let a = p.carve(0x400).unwrap();
        let _pin = p.carve(0x100).unwrap();
        p.release(a).unwrap();

        // Both the freed hole and the pool tail could satisfy this; the
        // hole is lower, so it is reused.
        let c = p.carve(0x400).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn release_coalesces_forward_and_backward() {
        let mut p = pool();
        let a = p.carve(0x100).unwrap();
        let b = p.carve(0x100).unwrap();
        let c = p.carve(0x100).unwrap();
        assert_eq!(b.base, a.end());
        assert_eq!(c.base, b.end());

        // Free the outer two, leaving a hole where b was. c touches the
        // pool remainder and merges with it on the spot.
        p.release(a).unwrap();
        p.release(c).unwrap();
        let slots_used =
            p.free.iter().filter(|s| s.is_some()).count();
        assert_eq!(slots_used, 2); // a, c + remainder

        // Releasing b must bridge all three into the original single
        // extent covering the whole pool.
        p.release(b).unwrap();
        let mut live = p.free.iter().flatten();
        let only = live.next().unwrap();
        assert!(live.next().is_none());
        assert_eq!(only.base, 0x2000_0000);
        assert_eq!(only.size, 0x1_0000);
    }

    #[test]
    fn double_free_rejected() {
        let mut p = pool();
        let a = p.carve(0x100).unwrap();
        p.release(a).unwrap();
        assert_eq!(p.release(a), Err(EINVAL));
    }

    #[test]
    fn carve_at_extends_in_place() {
        let mut p = pool();
        let a = p.carve(0x100).unwrap();
        // The free space starts right at a.end(), so in-place growth works.
        assert!(p.carve_at(a.end(), 0x40));
        // A bogus address does not.
        assert!(!p.carve_at(a.end() + 0x1000_0000, 0x40));
    }

    #[test]
    fn carve_whole_pool_then_exhausted() {
        let mut p = pool();
        let a = p.carve(0x1_0000).unwrap();
        assert_eq!(a.size, 0x1_0000);
        assert!(p.carve(GRANULE).is_none());
        p.release(a).unwrap();
        assert!(p.carve(GRANULE).is_some());
    }
}
