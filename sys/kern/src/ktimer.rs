// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel timers.
//!
//! A binary min-heap keyed on absolute expire tick, with stable handles so
//! a timer can be cancelled before it fires. Mutation masks interrupts
//! unless the caller is already inside a syscall, where masking is implied.
//!
//! Expiry is two-phase: the tick interrupt only observes that the minimum
//! has passed, force-preempts the runnable tasks, and latches a drain
//! request; the drain itself runs once per scheduler tick outside
//! interrupt context and fires every expired entry. Raw callbacks are
//! checked for a plausible code address first; a corrupted entry is
//! skipped and logged rather than jumped to.

use abi::{Sysret, ENOSPC};

use crate::limits::MAX_TIMERS;
use crate::sched::Sched;
use crate::time::Timestamp;

/// What to do when a timer fires.
#[derive(Copy, Clone, Debug)]
pub enum TimerAction {
    /// Resume the named thread, marking its timed wait as expired.
    Wake { pid: u16, tid: u16 },
    /// Invoke a raw callback (driver deferred work).
    Call { f: fn(u32), arg: u32 },
}

#[derive(Copy, Clone, Debug)]
pub struct Entry {
    pub expire: Timestamp,
    pub handle: u32,
    pub action: TimerAction,
}

/// The timer heap. `heap[0]` is always the soonest entry.
pub struct Timers {
    heap: [Option<Entry>; MAX_TIMERS],
    len: usize,
    next_handle: u32,
    /// Latched when the tick path sees an expired minimum; cleared by the
    /// drain. Keeps the drain queued at most once.
    pub(crate) drain_queued: bool,
}

impl Timers {
    pub const fn new() -> Self {
        Timers {
            heap: [None; MAX_TIMERS],
            len: 0,
            next_handle: 1,
            drain_queued: false,
        }
    }

    fn entry(&self, i: usize) -> &Entry {
        match &self.heap[i] {
            Some(e) => e,
            None => crate::fail::die("timer heap hole"),
        }
    }

    /// Inserts a timer, returning its cancellation handle.
    ///
    /// `in_syscall` suppresses the interrupt mask around the heap
    /// bookkeeping when the caller already holds it by context.
    pub fn add(
        &mut self,
        in_syscall: bool,
        expire: Timestamp,
        action: TimerAction,
    ) -> Result<u32, Sysret> {
        let _mask = crate::arch::IrqMask::new(!in_syscall);
        if self.len == MAX_TIMERS {
            return Err(ENOSPC);
        }
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1).max(1);
        let i = self.len;
        self.heap[i] = Some(Entry {
            expire,
            handle,
            action,
        });
        self.len += 1;
        self.sift_up(i);
        Ok(handle)
    }

    /// Cancels a not-yet-fired timer. Returns whether anything was
    /// removed.
    pub fn del(&mut self, in_syscall: bool, handle: u32) -> bool {
        let _mask = crate::arch::IrqMask::new(!in_syscall);
        let Some(pos) =
            (0..self.len).find(|&i| self.entry(i).handle == handle)
        else {
            return false;
        };
        self.remove_at(pos);
        true
    }

    fn remove_at(&mut self, pos: usize) -> Entry {
        self.len -= 1;
        self.heap.swap(pos, self.len);
        let removed = match self.heap[self.len].take() {
            Some(e) => e,
            None => crate::fail::die("timer heap hole"),
        };
        if pos < self.len {
            self.sift_down(pos);
            self.sift_up(pos);
        }
        removed
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.entry(parent).expire <= self.entry(i).expire {
                break;
            }
            self.heap.swap(parent, i);
            i = parent;
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        loop {
            let l = 2 * i + 1;
            let r = 2 * i + 2;
            let mut least = i;
            if l < self.len && self.entry(l).expire < self.entry(least).expire
            {
                least = l;
            }
            if r < self.len && self.entry(r).expire < self.entry(least).expire
            {
                least = r;
            }
            if least == i {
                break;
            }
            self.heap.swap(i, least);
            i = least;
        }
    }

    /// Has the soonest timer already passed `now`?
    pub fn expired(&self, now: Timestamp) -> bool {
        self.len > 0 && self.entry(0).expire <= now
    }

    /// Removes and returns the soonest entry if it has expired.
    pub fn pop_expired(&mut self, now: Timestamp) -> Option<Entry> {
        if self.expired(now) {
            Some(self.remove_at(0))
        } else {
            None
        }
    }

    /// Fires one entry. Returns `false` when a raw callback was skipped
    /// because its address fails the code-region plausibility check.
    pub fn fire(sched: &mut Sched, entry: Entry) -> bool {
        match entry.action {
            TimerAction::Wake { pid, tid } => {
                if let Some(idx) = sched.find_thread(pid, tid) {
                    let t = sched.task_mut(idx);
                    t.timed_out = true;
                    t.ktimer = None;
                    let _ = sched.resume(idx);
                }
                true
            }
            TimerAction::Call { f, arg } => {
                if !crate::arch::code_plausible(f as usize as u32) {
                    crate::klog!("skipping implausible timer callback");
                    return false;
                }
                f(arg);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nop(_: u32) {}

    fn call() -> TimerAction {
        TimerAction::Call { f: nop, arg: 0 }
    }

    #[test]
    fn fires_in_nondecreasing_order() {
        let mut t = Timers::new();
        for ticks in [50u64, 10, 30, 10] {
            t.add(true, ticks.into(), call()).unwrap();
        }
        let mut fired = Vec::new();
        while let Some(e) = t.pop_expired(100.into()) {
            fired.push(u64::from(e.expire));
        }
        assert_eq!(fired, [10, 10, 30, 50]);
    }

    #[test]
    fn delete_prevents_firing() {
        let mut t = Timers::new();
        let keep = t.add(true, 10.into(), call()).unwrap();
        let gone = t.add(true, 5.into(), call()).unwrap();
        assert!(t.del(true, gone));
        assert!(!t.del(true, gone));

        let e = t.pop_expired(100.into()).unwrap();
        assert_eq!(e.handle, keep);
        assert!(t.pop_expired(100.into()).is_none());
    }

    #[test]
    fn not_expired_stays_put() {
        let mut t = Timers::new();
        t.add(true, 10.into(), call()).unwrap();
        assert!(!t.expired(9.into()));
        assert!(t.pop_expired(9.into()).is_none());
        assert!(t.expired(10.into()));
    }

    #[test]
    fn heap_capacity_is_an_error_not_a_panic() {
        let mut t = Timers::new();
        for i in 0..MAX_TIMERS {
            t.add(true, (i as u64).into(), call()).unwrap();
        }
        assert_eq!(t.add(true, 99.into(), call()), Err(ENOSPC));
    }
}
