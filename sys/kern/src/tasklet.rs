// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deferred-work queue.
//!
//! A bounded array of `(callback, argument)` pairs queued from interrupt
//! context and drained once per scheduler tick. Overflow is a sizing bug
//! and halts the kernel; the queue is dimensioned so that a correct
//! configuration can never fill it.
//!
//! Interrupts are masked only around the list bookkeeping. Callbacks run
//! unmasked: the pending entries are copied out first, so a callback that
//! queues further work does not deadlock or run twice in one drain.

use heapless::Vec;

use crate::fail;
use crate::limits::MAX_TASKLETS;

pub type TaskletFn = fn(u32);

pub struct Tasklets {
    pending: Vec<(TaskletFn, u32), MAX_TASKLETS>,
}

impl Tasklets {
    pub const fn new() -> Self {
        Tasklets {
            pending: Vec::new(),
        }
    }

    /// Queues one callback. A full queue is fatal.
    pub fn add(&mut self, f: TaskletFn, arg: u32) {
        let _mask = crate::arch::IrqMask::new(true);
        if self.pending.push((f, arg)).is_err() {
            fail::die("tasklet queue full");
        }
    }

    /// Runs every currently pending entry once. Entries are checked
    /// against the code-region plausibility test like timer callbacks;
    /// a corrupted entry halts, since the queue memory itself is suspect.
    pub fn drain(&mut self) {
        let batch = {
            let _mask = crate::arch::IrqMask::new(true);
            core::mem::take(&mut self.pending)
        };
        for (f, arg) in batch {
            if !crate::arch::code_plausible(f as usize as u32) {
                fail::die("implausible tasklet callback");
            }
            f(arg);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    static RAN: AtomicU32 = AtomicU32::new(0);

    fn bump(arg: u32) {
        RAN.fetch_add(arg, Ordering::Relaxed);
    }

    #[test]
    fn drain_runs_each_entry_once() {
        RAN.store(0, Ordering::Relaxed);
        let mut q = Tasklets::new();
        q.add(bump, 1);
        q.add(bump, 10);
        q.drain();
        assert_eq!(RAN.load(Ordering::Relaxed), 11);
        assert!(q.is_empty());
        q.drain();
        assert_eq!(RAN.load(Ordering::Relaxed), 11);
    }

    #[test]
    #[should_panic(expected = "tasklet queue full")]
    fn overflow_is_fatal() {
        let mut q = Tasklets::new();
        for _ in 0..=MAX_TASKLETS {
            q.add(bump, 0);
        }
    }
}
