// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Task control blocks and the per-task resources they own.
//!
//! The fields of `Task` are mostly private so the scheduler can maintain
//! its invariants; state changes go through the methods here or through
//! `sched`, never by poking fields.

use abi::{
    ExecInfo, SigSet, Signal, TaskState, DEFAULT_TIMESLICE, NSIG,
    SYSCALL_ARGS,
};

use crate::limits::{FD_MAX, FD_TABLES, MAX_GROUPS, MAX_THREADS};
use crate::vfs::FileDesc;

/// Access to a task's saved register context. Implemented by each
/// architecture's `SavedState`; everything the portable kernel knows about
/// saved registers goes through this trait, including the debugger's
/// peek/poke.
pub trait ArchState: Default + Clone {
    /// The syscall number the task trapped with.
    fn syscall_number(&self) -> u32;
    /// The five marshaled argument words: three from the stacked
    /// registers, two captured from the caller's stack at trap entry.
    fn args(&self) -> [u32; SYSCALL_ARGS];
    /// Writes the return-value slot (the first return register in the
    /// stacked frame).
    fn set_return(&mut self, v: u32);
    /// Reads back the return-value slot.
    fn return_slot(&self) -> u32;

    fn stack_pointer(&self) -> u32;
    fn set_stack_pointer(&mut self, sp: u32);
    fn pc(&self) -> u32;
    fn set_pc(&mut self, pc: u32);
    fn set_lr(&mut self, lr: u32);
    /// The register holding the position-independent data segment base.
    fn got_base(&self) -> u32;
    fn set_got_base(&mut self, base: u32);
}

/// A syscall waiting to be replayed after its wakeup fires.
#[derive(Copy, Clone, Debug)]
pub struct PendingCall {
    pub nr: u32,
    pub args: [u32; SYSCALL_ARGS],
}

/// Internal representation of a schedulable thread of control.
#[derive(Debug)]
pub struct Task {
    /// Saved machine state of the user program.
    save: crate::arch::SavedState,

    pid: u16,
    tid: u16,
    ppid: u16,

    state: TaskState,
    pub(crate) timeslice: u32,
    pub(crate) nice: i8,

    /// Base and size of the task's stack extent, as granted by the secure
    /// authority.
    pub(crate) stack_base: u32,
    pub(crate) stack_size: u32,
    pub(crate) exec: ExecInfo,

    /// Opaque working-directory token, inherited across spawn.
    pub(crate) cwd: u32,
    /// Index of the shared descriptor table in the [`FdPool`], if open.
    pub(crate) fd_table: Option<usize>,
    /// Thread-group record index, present once a process goes
    /// multi-threaded.
    pub(crate) group: Option<usize>,

    /// Userland handler addresses, indexed by signal number. `None` means
    /// default disposition; `abi::SIG_IGN` is stored as a handler value.
    pub(crate) handlers: [Option<u32>; NSIG],
    pub(crate) pending: SigSet,
    pub(crate) blocked: SigSet,
    /// Context saved when a signal trampoline is spliced; restored by the
    /// sigreturn trap.
    pub(crate) sig_backup: Option<crate::arch::SavedState>,
    /// Attached debugger, if any, as an arena index.
    pub(crate) tracer: Option<usize>,
    /// Mask to restore when a `sigsuspend` wait ends.
    pub(crate) saved_mask: Option<SigSet>,

    /// One-shot kernel timer owned by this task (sleep, timed wait).
    pub(crate) ktimer: Option<u32>,
    /// Set by a timer wakeup so a replayed timed wait reports timeout
    /// instead of re-arming.
    pub(crate) timed_out: bool,

    /// Arena index of the parent suspended in FORKED, when this task is a
    /// vfork child that has not yet execed or exited.
    pub(crate) vfork_parent: Option<usize>,

    pub(crate) exit_status: i32,
    /// A detached thread is torn down on exit instead of waiting for a
    /// join.
    pub(crate) detached: bool,

    /// Set while a syscall handler runs; timer code uses it to skip
    /// redundant interrupt masking.
    pub(crate) in_syscall: bool,
    /// Blocked syscall to re-execute when next scheduled.
    pub(crate) replay: Option<PendingCall>,
}

impl Task {
    pub fn new(pid: u16, ppid: u16, exec: ExecInfo, nice: i8) -> Self {
        Task {
            save: crate::arch::SavedState::default(),
            pid,
            tid: 1,
            ppid,
            state: TaskState::Runnable,
            timeslice: DEFAULT_TIMESLICE,
            nice,
            stack_base: 0,
            stack_size: 0,
            exec,
            cwd: 0,
            fd_table: None,
            group: None,
            handlers: [None; NSIG],
            pending: SigSet::EMPTY,
            blocked: SigSet::EMPTY,
            sig_backup: None,
            tracer: None,
            saved_mask: None,
            ktimer: None,
            timed_out: false,
            vfork_parent: None,
            exit_status: 0,
            detached: false,
            in_syscall: false,
            replay: None,
        }
    }

    pub fn pid(&self) -> u16 {
        self.pid
    }

    pub fn tid(&self) -> u16 {
        self.tid
    }

    pub(crate) fn set_tid(&mut self, tid: u16) {
        self.tid = tid;
    }

    pub fn ppid(&self) -> u16 {
        self.ppid
    }

    pub(crate) fn set_ppid(&mut self, ppid: u16) {
        self.ppid = ppid;
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// State changes stay inside the crate; the scheduler keeps list
    /// membership in sync with them.
    pub(crate) fn set_state(&mut self, state: TaskState) {
        self.state = state;
    }

    /// Is this task on the running list (as opposed to idling)?
    pub fn is_on_run_list(&self) -> bool {
        matches!(self.state, TaskState::Runnable | TaskState::Running)
    }

    pub fn save(&self) -> &crate::arch::SavedState {
        &self.save
    }

    pub fn save_mut(&mut self) -> &mut crate::arch::SavedState {
        &mut self.save
    }

    /// Registered handler for `sig`, if any.
    pub fn handler(&self, sig: Signal) -> Option<u32> {
        self.handlers[sig.number() as usize]
    }

    /// True if the task is a vfork child still borrowing its parent's
    /// stack.
    pub fn is_vforked(&self) -> bool {
        self.vfork_parent.is_some()
    }

    /// Checks whether `addr..addr+len` lies within this task's stack
    /// extent.
    pub fn stack_contains(&self, addr: u32, len: u32) -> bool {
        let end = self.stack_base.wrapping_add(self.stack_size);
        addr >= self.stack_base
            && addr < end
            && len <= end - addr
    }
}

/// A process's file-descriptor table. Shared by reference count among the
/// threads of one process; child processes take a snapshot copy.
#[derive(Clone, Debug)]
pub struct FdTable {
    refs: u32,
    pub(crate) fds: [Option<FileDesc>; FD_MAX],
}

/// Fixed pool of descriptor tables.
#[derive(Debug)]
pub struct FdPool {
    tables: [Option<FdTable>; FD_TABLES],
}

impl FdPool {
    pub const fn new() -> Self {
        const EMPTY: Option<FdTable> = None;
        FdPool {
            tables: [EMPTY; FD_TABLES],
        }
    }

    /// Allocates a fresh, empty table with one reference.
    pub fn alloc(&mut self) -> Option<usize> {
        let i = self.tables.iter().position(|t| t.is_none())?;
        self.tables[i] = Some(FdTable {
            refs: 1,
            fds: [None; FD_MAX],
        });
        Some(i)
    }

    /// Adds a reference for a thread sharing the table.
    pub fn share(&mut self, i: usize) {
        if let Some(t) = self.tables.get_mut(i).and_then(|t| t.as_mut()) {
            t.refs += 1;
        }
    }

    /// Snapshot-copies a table for a spawned child.
    pub fn dup(&mut self, i: usize) -> Option<usize> {
        let src = self.tables.get(i)?.clone()?;
        let j = self.tables.iter().position(|t| t.is_none())?;
        self.tables[j] = Some(FdTable { refs: 1, ..src });
        Some(j)
    }

    /// Drops one reference; returns the table's descriptors when the last
    /// reference goes away, so the caller can close them with the modules.
    pub fn release(&mut self, i: usize) -> Option<[Option<FileDesc>; FD_MAX]> {
        let t = self.tables.get_mut(i).and_then(|t| t.as_mut())?;
        t.refs -= 1;
        if t.refs == 0 {
            self.tables[i].take().map(|t| t.fds)
        } else {
            None
        }
    }

    pub fn get(&self, i: usize) -> Option<&FdTable> {
        self.tables.get(i).and_then(|t| t.as_ref())
    }

    pub fn get_mut(&mut self, i: usize) -> Option<&mut FdTable> {
        self.tables.get_mut(i).and_then(|t| t.as_mut())
    }
}

impl FdTable {
    /// Installs `fd` in the lowest free slot.
    pub fn add(&mut self, fd: FileDesc) -> Option<usize> {
        let i = self.fds.iter().position(|f| f.is_none())?;
        self.fds[i] = Some(fd);
        Some(i)
    }

    /// Removes a descriptor. Removing an empty slot is tolerated and
    /// reported as success.
    pub fn del(&mut self, i: usize) -> Result<(), ()> {
        if i >= FD_MAX {
            return Err(());
        }
        self.fds[i] = None;
        Ok(())
    }

    pub fn get(&self, i: usize) -> Option<&FileDesc> {
        self.fds.get(i).and_then(|f| f.as_ref())
    }

    pub fn get_mut(&mut self, i: usize) -> Option<&mut FileDesc> {
        self.fds.get_mut(i).and_then(|f| f.as_mut())
    }
}

/// Sibling bookkeeping for a multi-threaded process, lazily created on the
/// first `thread_create`.
#[derive(Copy, Clone, Debug)]
pub struct ThreadGroup {
    /// Bitmap of arena indices belonging to this group.
    pub(crate) members: u16,
    pub(crate) active: u8,
    pub(crate) next_tid: u16,
}

/// Fixed pool of thread-group records.
#[derive(Debug)]
pub struct GroupPool {
    groups: [Option<ThreadGroup>; MAX_GROUPS],
}

impl GroupPool {
    pub const fn new() -> Self {
        GroupPool {
            groups: [None; MAX_GROUPS],
        }
    }

    pub fn alloc(&mut self, leader_idx: usize) -> Option<usize> {
        let i = self.groups.iter().position(|g| g.is_none())?;
        self.groups[i] = Some(ThreadGroup {
            members: 1 << leader_idx,
            active: 1,
            next_tid: 2,
        });
        Some(i)
    }

    pub fn get_mut(&mut self, i: usize) -> Option<&mut ThreadGroup> {
        self.groups.get_mut(i).and_then(|g| g.as_mut())
    }

    /// Adds a member task, returning its new tid. Fails when the group is
    /// at its sibling limit.
    pub fn join(&mut self, i: usize, member_idx: usize) -> Option<u16> {
        let g = self.get_mut(i)?;
        if usize::from(g.active) >= MAX_THREADS {
            return None;
        }
        g.members |= 1 << member_idx;
        g.active += 1;
        let tid = g.next_tid;
        g.next_tid += 1;
        Some(tid)
    }

    /// Removes a member; frees the record when the last thread leaves.
    pub fn leave(&mut self, i: usize, member_idx: usize) {
        if let Some(g) = self.get_mut(i) {
            g.members &= !(1 << member_idx);
            g.active = g.active.saturating_sub(1);
            if g.active == 0 {
                self.groups[i] = None;
            }
        }
    }
}
