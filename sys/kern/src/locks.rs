// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Semaphores and mutexes.
//!
//! The counter is an atomic updated by compare-exchange loops, which the
//! target compiles down to LL/SC pairs; contention retries transparently
//! and is never surfaced as an error. Blocking works through a listener
//! slot array per primitive: a task that cannot acquire registers itself,
//! parks in Waiting, and has its syscall replayed after a post wakes it.
//! Wakes scan round-robin from just past the last-served slot, so over
//! time every waiter is served before any is served twice.
//!
//! Handles carry a signature tag so lookups against destroyed or
//! corrupted handles fail with `EINVAL` instead of touching a recycled
//! record.

use core::sync::atomic::{AtomicI32, Ordering};

use abi::{Sysret, TaskState, EAGAIN, EINVAL, ENOSPC, SYSCALL_RETRY};

use crate::limits::{MAX_SEMS, SEM_LISTENERS};
use crate::sched::{NextTask, Sched};

/// One semaphore or mutex record.
#[derive(Debug)]
pub struct Sem {
    sig: u32,
    count: AtomicI32,
    /// Ceiling for posts: 1 for a mutex, effectively unbounded for a
    /// counting semaphore.
    limit: i32,
    /// Waiting tasks, by arena index.
    listeners: [Option<usize>; SEM_LISTENERS],
    /// Slot just served; the next wake scan starts after it.
    last: usize,
}

impl Sem {
    /// Attempts one atomic decrement. `false` means the count was zero.
    pub fn try_acquire(&self) -> bool {
        self.count
            .fetch_update(Ordering::Acquire, Ordering::Relaxed, |v| {
                if v > 0 {
                    Some(v - 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    /// Atomic increment, capped at the record's limit. `false` means the
    /// primitive was already at its ceiling (double unlock of a mutex).
    fn bump(&self) -> bool {
        self.count
            .fetch_update(Ordering::Release, Ordering::Relaxed, |v| {
                if v < self.limit {
                    Some(v + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    fn add_listener(&mut self, idx: usize) -> Result<(), Sysret> {
        let slot = self
            .listeners
            .iter()
            .position(|l| l.is_none())
            .ok_or(ENOSPC)?;
        self.listeners[slot] = Some(idx);
        Ok(())
    }

    /// Round-robin pick of the next waiter: scan `[last+1..)` then wrap.
    /// The served slot becomes the new `last`.
    fn take_listener(&mut self) -> Option<usize> {
        for off in 1..=SEM_LISTENERS {
            let slot = (self.last + off) % SEM_LISTENERS;
            if let Some(idx) = self.listeners[slot].take() {
                self.last = slot;
                return Some(idx);
            }
        }
        None
    }

    /// Any tasks currently parked on this primitive?
    pub fn has_listeners(&self) -> bool {
        self.listeners.iter().any(|l| l.is_some())
    }

    /// Drops a waiter that is going away (killed while blocked).
    pub fn forget_listener(&mut self, idx: usize) {
        for l in self.listeners.iter_mut() {
            if *l == Some(idx) {
                *l = None;
            }
        }
    }

    #[cfg(test)]
    fn value(&self) -> i32 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Fixed pool of semaphore records, addressed by tagged handles.
#[derive(Debug)]
pub struct SemTable {
    sems: [Option<Sem>; MAX_SEMS],
    next_sig: u32,
}

impl SemTable {
    pub const fn new() -> Self {
        const EMPTY: Option<Sem> = None;
        SemTable {
            sems: [EMPTY; MAX_SEMS],
            next_sig: 1,
        }
    }

    /// Creates a record. `limit` 1 makes a mutex; `i32::MAX` a counting
    /// semaphore.
    pub fn create(&mut self, initial: i32, limit: i32) -> Result<u32, Sysret> {
        if initial < 0 || limit < 1 || initial > limit {
            return Err(EINVAL);
        }
        let i = self
            .sems
            .iter()
            .position(|s| s.is_none())
            .ok_or(ENOSPC)?;
        let sig = self.next_sig;
        self.next_sig = self.next_sig.wrapping_add(1).max(1);
        self.sems[i] = Some(Sem {
            sig,
            count: AtomicI32::new(initial),
            limit,
            listeners: [None; SEM_LISTENERS],
            last: SEM_LISTENERS - 1,
        });
        Ok(Self::encode(i, sig))
    }

    fn encode(i: usize, sig: u32) -> u32 {
        (sig << 8) | i as u32
    }

    /// Validates a handle against the live record's signature.
    pub fn get(&mut self, handle: u32) -> Result<&mut Sem, Sysret> {
        let i = (handle & 0xFF) as usize;
        let sig = handle >> 8;
        match self.sems.get_mut(i).and_then(|s| s.as_mut()) {
            Some(s) if s.sig == sig && sig != 0 => Ok(s),
            _ => Err(EINVAL),
        }
    }

    pub fn destroy(&mut self, handle: u32) -> Result<(), Sysret> {
        let i = (handle & 0xFF) as usize;
        self.get(handle)?;
        self.sems[i] = None;
        Ok(())
    }

    /// Removes a dying task from every wait-set.
    pub fn forget_task(&mut self, idx: usize) {
        for s in self.sems.iter_mut().flatten() {
            s.forget_listener(idx);
        }
    }
}

/// The blocking acquire path.
///
/// With no task context (early bring-up) this spins until the exclusive
/// operation succeeds. With a task, failure registers the caller as a
/// listener, parks it Waiting, and reports the retry sentinel; the
/// dispatcher replays the same syscall after a post resumes the task.
pub fn wait(
    table: &mut SemTable,
    sched: &mut Sched,
    caller: Option<usize>,
    handle: u32,
) -> Sysret {
    let sem = match table.get(handle) {
        Ok(s) => s,
        Err(e) => return e,
    };
    if sem.try_acquire() {
        return 0;
    }
    let Some(idx) = caller else {
        // Bring-up path: no scheduler to yield to yet.
        while !sem.try_acquire() {
            core::hint::spin_loop();
        }
        return 0;
    };
    if let Err(e) = sem.add_listener(idx) {
        return e;
    }
    sched.suspend(idx, TaskState::Waiting);
    SYSCALL_RETRY
}

/// Non-blocking acquire.
pub fn trywait(table: &mut SemTable, handle: u32) -> Sysret {
    match table.get(handle) {
        Ok(s) => {
            if s.try_acquire() {
                0
            } else {
                EAGAIN
            }
        }
        Err(e) => e,
    }
}

/// Post/unlock: bumps the counter and wakes at most one waiter.
pub fn post(
    table: &mut SemTable,
    sched: &mut Sched,
    handle: u32,
) -> (Sysret, NextTask) {
    let sem = match table.get(handle) {
        Ok(s) => s,
        Err(e) => return (e, NextTask::Same),
    };
    if !sem.bump() {
        return (EINVAL, NextTask::Same);
    }
    match sem.take_listener() {
        Some(idx) => (0, sched.resume(idx)),
        None => (0, NextTask::Same),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::FdPool;
    use abi::ExecInfo;
    use secure::mempool::Extent;

    fn sched_with_tasks(n: usize) -> (Sched, Vec<usize>) {
        let ns = Extent {
            base: 0x2000_0000,
            size: 0x10_0000,
        };
        let mut a = secure::gate::Gate::new(0x2001_0000, 0x2_0000, ns, 1);
        let mut s = Sched::new();
        let mut fds = FdPool::new();
        let exec = ExecInfo {
            entry: 0x0800_1000,
            text_size: 0x1000,
            data_size: 0,
            got_base: 0,
        };
        let mut idxs = Vec::new();
        for i in 0..n {
            let ppid = if i == 0 { 0 } else { 1 };
            idxs.push(s.task_create(&mut a, &mut fds, exec, 0, ppid).unwrap());
        }
        (s, idxs)
    }

    #[test]
    fn handle_signature_rejects_stale_lookups() {
        let mut t = SemTable::new();
        let h = t.create(1, 1).unwrap();
        assert!(t.get(h).is_ok());
        t.destroy(h).unwrap();
        assert_eq!(t.get(h).err(), Some(EINVAL));
        // A new record in the same slot has a different signature.
        let h2 = t.create(1, 1).unwrap();
        assert_ne!(h, h2);
        assert_eq!(t.get(h).err(), Some(EINVAL));
    }

    #[test]
    fn mutex_exclusion_model() {
        let (mut s, tasks) = sched_with_tasks(3);
        let mut table = SemTable::new();
        let m = table.create(1, 1).unwrap();

        // Model state: who currently owns the critical section.
        let mut owners = 0u32;

        assert_eq!(wait(&mut table, &mut s, Some(tasks[0]), m), 0);
        owners += 1;
        assert_eq!(owners, 1);

        // Both contenders block and park exactly once.
        assert_eq!(
            wait(&mut table, &mut s, Some(tasks[1]), m),
            SYSCALL_RETRY
        );
        assert_eq!(
            wait(&mut table, &mut s, Some(tasks[2]), m),
            SYSCALL_RETRY
        );
        assert_eq!(s.task(tasks[1]).state(), TaskState::Waiting);
        assert_eq!(s.task(tasks[2]).state(), TaskState::Waiting);

        // Unlock wakes exactly one waiter, no double-wake.
        owners -= 1;
        let (r, _) = post(&mut table, &mut s, m);
        assert_eq!(r, 0);
        let woke1 = s.task(tasks[1]).state() == TaskState::Runnable;
        let woke2 = s.task(tasks[2]).state() == TaskState::Runnable;
        assert!(woke1 ^ woke2);

        // The woken task replays and acquires.
        let woken = if woke1 { tasks[1] } else { tasks[2] };
        assert_eq!(wait(&mut table, &mut s, Some(woken), m), 0);
        owners += 1;
        assert_eq!(owners, 1);

        // Second unlock reaches the other waiter exactly once.
        owners -= 1;
        let (r, _) = post(&mut table, &mut s, m);
        assert_eq!(r, 0);
        let other = if woke1 { tasks[2] } else { tasks[1] };
        assert_eq!(s.task(other).state(), TaskState::Runnable);
        assert_eq!(wait(&mut table, &mut s, Some(other), m), 0);
        owners += 1;
        assert_eq!(owners, 1);
    }

    #[test]
    fn post_without_waiters_only_bumps() {
        let (mut s, _tasks) = sched_with_tasks(1);
        let mut table = SemTable::new();
        let sem = table.create(0, i32::MAX).unwrap();
        let (r, hint) = post(&mut table, &mut s, sem);
        assert_eq!(r, 0);
        assert_eq!(hint, NextTask::Same);
        assert_eq!(table.get(sem).unwrap().value(), 1);
    }

    #[test]
    fn double_unlock_of_mutex_rejected() {
        let (mut s, _tasks) = sched_with_tasks(1);
        let mut table = SemTable::new();
        let m = table.create(1, 1).unwrap();
        let (r, _) = post(&mut table, &mut s, m);
        assert_eq!(r, EINVAL);
    }

    #[test]
    fn wake_order_is_round_robin() {
        let (mut s, tasks) = sched_with_tasks(4);
        let mut table = SemTable::new();
        let sem = table.create(1, i32::MAX).unwrap();

        assert_eq!(wait(&mut table, &mut s, Some(tasks[0]), sem), 0);
        for &t in &tasks[1..4] {
            assert_eq!(
                wait(&mut table, &mut s, Some(t), sem),
                SYSCALL_RETRY
            );
        }

        // Wakes proceed by slot order relative to the last served.
        let mut order = Vec::new();
        for _ in 0..3 {
            let (r, hint) = post(&mut table, &mut s, sem);
            assert_eq!(r, 0);
            match hint {
                NextTask::Other | NextTask::Specific(_) => {}
                NextTask::Same => panic!("lost wake"),
            }
            for (slot, &t) in tasks[1..4].iter().enumerate() {
                if s.task(t).state() == TaskState::Runnable
                    && !order.contains(&slot)
                {
                    order.push(slot);
                }
            }
        }
        assert_eq!(order, [0, 1, 2]);
    }
}
