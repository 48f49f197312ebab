// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the non-secure kernel, the secure
//! supervisor, and applications.
//!
//! Everything in this crate is plain old data: types that can cross the
//! syscall boundary or the TrustZone gate without carrying pointers into
//! either side's private memory.

#![cfg_attr(not(test), no_std)]

use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Reserved process id for the kernel's own pseudo-task. It can never be
/// suspended and owns maximal capabilities in the secure world.
pub const KERNEL_PID: u16 = 0;

/// First pid handed out to ordinary processes. Pid 1 is init; children of
/// init and later processes inherit working directories and duplicate file
/// descriptors, init itself does not.
pub const INIT_PID: u16 = 1;

/// Owner value marking a free slot in the secure capability table.
pub const FREE_OWNER: u16 = 0xFFFF;

/// The nice value reserved for real-time dispatch. A task resumed with this
/// nice value preempts every other runnable task immediately.
pub const NICE_RT: i8 = -128;

/// Default nice value for new tasks.
pub const NICE_DEFAULT: i8 = 0;

/// Scheduler quantum, in timer ticks.
pub const DEFAULT_TIMESLICE: u32 = 5;

/// Scheduling state of a task, as visible to debuggers and the supervisor.
///
/// A task is a member of the running list iff its state is `Runnable` or
/// `Running`; every other state lives on the idling list.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum TaskState {
    /// Ready to be picked by the scheduler.
    #[default]
    Runnable = 0,
    /// Currently executing. At most one task is in this state at a time.
    Running = 1,
    /// Blocked on a lock, I/O, sleep, or join, with a wakeup armed.
    Waiting = 2,
    /// Stopped by job control or a debugger; orthogonal to blocking.
    Stopped = 3,
    /// Terminated, holding an exit status for the parent to reap.
    Zombie = 4,
    /// Reaped; queued for deferred resource teardown.
    Over = 5,
    /// A vfork caller, suspended until the child execs or exits.
    Forked = 6,
}

/// Syscall return/status type. Success values are non-negative; errors are
/// the negated POSIX-style codes below.
pub type Sysret = i32;

pub const EPERM: Sysret = -1;
pub const ENOENT: Sysret = -2;
pub const ESRCH: Sysret = -3;
pub const EINTR: Sysret = -4;
pub const EBADF: Sysret = -9;
pub const ECHILD: Sysret = -10;
pub const EAGAIN: Sysret = -11;
pub const ENOMEM: Sysret = -12;
pub const EACCES: Sysret = -13;
pub const EBUSY: Sysret = -16;
pub const EINVAL: Sysret = -22;
pub const ENFILE: Sysret = -23;
pub const ENOSPC: Sysret = -28;
pub const ENOSYS: Sysret = -38;
pub const ETIMEDOUT: Sysret = -110;

/// Reserved sentinel meaning "the calling task is now blocked; replay this
/// exact syscall after it wakes." This value never reaches userland: the
/// dispatcher intercepts it and defers the return until the replay
/// completes (or a signal converts it into `EINTR`).
pub const SYSCALL_RETRY: Sysret = i32::MIN;

/// Reserved syscall number used by the signal trampoline to request
/// restoration of the pre-signal context. Deliberately outside the dense
/// handler table.
pub const SYSCALL_SIGRETURN: u32 = 0xFFFF_FFFF;

/// Number of argument slots marshaled per syscall, not counting the syscall
/// number itself.
pub const SYSCALL_ARGS: usize = 5;

/// Dense syscall number assignments. The kernel's handler table is indexed
/// directly by these values; holes resume the caller without effect.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Sysnum {
    Exit = 0,
    GetPid = 1,
    GetPpid = 2,
    Sleep = 3,
    Vfork = 4,
    Exec = 5,
    Waitpid = 6,
    Kill = 7,
    Sigaction = 8,
    Sigprocmask = 9,
    Sigsuspend = 10,
    Open = 11,
    Close = 12,
    Read = 13,
    Write = 14,
    Seek = 15,
    Ioctl = 16,
    Poll = 17,
    Mmap = 18,
    Munmap = 19,
    SemInit = 20,
    SemWait = 21,
    SemTrywait = 22,
    SemPost = 23,
    SemDestroy = 24,
    MutexInit = 25,
    MutexLock = 26,
    MutexUnlock = 27,
    ThreadCreate = 28,
    ThreadJoin = 29,
    ThreadDetach = 30,
    PtracePeek = 31,
    PtracePoke = 32,
}

/// Size of the kernel's syscall handler table.
pub const SYSCALL_TABLE_SIZE: usize = 96;

impl TryFrom<u32> for Sysnum {
    type Error = ();

    fn try_from(v: u32) -> Result<Self, ()> {
        Ok(match v {
            0 => Sysnum::Exit,
            1 => Sysnum::GetPid,
            2 => Sysnum::GetPpid,
            3 => Sysnum::Sleep,
            4 => Sysnum::Vfork,
            5 => Sysnum::Exec,
            6 => Sysnum::Waitpid,
            7 => Sysnum::Kill,
            8 => Sysnum::Sigaction,
            9 => Sysnum::Sigprocmask,
            10 => Sysnum::Sigsuspend,
            11 => Sysnum::Open,
            12 => Sysnum::Close,
            13 => Sysnum::Read,
            14 => Sysnum::Write,
            15 => Sysnum::Seek,
            16 => Sysnum::Ioctl,
            17 => Sysnum::Poll,
            18 => Sysnum::Mmap,
            19 => Sysnum::Munmap,
            20 => Sysnum::SemInit,
            21 => Sysnum::SemWait,
            22 => Sysnum::SemTrywait,
            23 => Sysnum::SemPost,
            24 => Sysnum::SemDestroy,
            25 => Sysnum::MutexInit,
            26 => Sysnum::MutexLock,
            27 => Sysnum::MutexUnlock,
            28 => Sysnum::ThreadCreate,
            29 => Sysnum::ThreadJoin,
            30 => Sysnum::ThreadDetach,
            31 => Sysnum::PtracePeek,
            32 => Sysnum::PtracePoke,
            _ => return Err(()),
        })
    }
}

/// Signal numbers. Only the subset the kernel actually dispatches on is
/// defined; the numbering matches the classic assignments so userland
/// tooling isn't surprised.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Signal {
    Hup = 1,
    Int = 2,
    Quit = 3,
    Ill = 4,
    Trap = 5,
    Kill = 9,
    Usr1 = 10,
    Segv = 11,
    Usr2 = 12,
    Pipe = 13,
    Alrm = 14,
    Term = 15,
    Chld = 17,
    Cont = 18,
    Stop = 19,
}

/// Highest representable signal number plus one; sizes handler tables and
/// masks.
pub const NSIG: usize = 32;

impl Signal {
    pub fn from_number(n: u32) -> Option<Self> {
        Some(match n {
            1 => Signal::Hup,
            2 => Signal::Int,
            3 => Signal::Quit,
            4 => Signal::Ill,
            5 => Signal::Trap,
            9 => Signal::Kill,
            10 => Signal::Usr1,
            11 => Signal::Segv,
            12 => Signal::Usr2,
            13 => Signal::Pipe,
            14 => Signal::Alrm,
            15 => Signal::Term,
            17 => Signal::Chld,
            18 => Signal::Cont,
            19 => Signal::Stop,
            _ => return None,
        })
    }

    pub fn number(self) -> u32 {
        self as u32
    }
}

/// A set of signals, one bit per signal number.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Default, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct SigSet(pub u32);

impl SigSet {
    pub const EMPTY: Self = SigSet(0);

    pub fn add(&mut self, sig: Signal) {
        self.0 |= 1 << sig.number();
    }

    pub fn remove(&mut self, sig: Signal) {
        self.0 &= !(1 << sig.number());
    }

    pub fn contains(&self, sig: Signal) -> bool {
        self.0 & (1 << sig.number()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Returns the lowest-numbered signal in the set, if any.
    pub fn first(&self) -> Option<Signal> {
        if self.0 == 0 {
            return None;
        }
        Signal::from_number(self.0.trailing_zeros())
    }
}

/// Option bit for `waitpid`: return 0 instead of blocking when no
/// qualifying child has exited yet.
pub const WNOHANG: u32 = 1;

/// Reserved handler values for `sigaction`. Any other value is the address
/// of a userland handler function.
pub const SIG_DFL: u32 = 0;
pub const SIG_IGN: u32 = 1;

/// `sigprocmask` operations.
pub const SIG_BLOCK: u32 = 0;
pub const SIG_UNBLOCK: u32 = 1;
pub const SIG_SETMASK: u32 = 2;

/// Poll interest/event bits, shared with the module operation table.
pub const POLLIN: u16 = 1 << 0;
pub const POLLOUT: u16 = 1 << 2;
pub const POLLERR: u16 = 1 << 3;
pub const POLLHUP: u16 = 1 << 4;

/// Whence values for the seek syscall.
pub const SEEK_SET: i32 = 0;
pub const SEEK_CUR: i32 = 1;
pub const SEEK_END: i32 = 2;

/// Why the kernel forcibly faulted a task. Faults are delivered as the
/// corresponding synchronous signal where one exists; a task that cannot
/// handle its fault is terminated.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum FaultInfo {
    /// Escape attempt: a memory access outside the task's owned extents.
    /// The faulting address is included when the hardware reported one.
    MemoryAccess { address: Option<u32> },
    /// Undefined or privileged instruction in user mode.
    IllegalInstruction,
    /// The stack pointer left the task's stack extent.
    StackOverflow { address: u32 },
}

impl FaultInfo {
    /// The signal a fault is delivered as.
    pub fn signal(self) -> Signal {
        match self {
            FaultInfo::MemoryAccess { .. }
            | FaultInfo::StackOverflow { .. } => Signal::Segv,
            FaultInfo::IllegalInstruction => Signal::Ill,
        }
    }
}

bitflags::bitflags! {
    /// Capability bits held by a task in the secure world's table.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct TaskCaps: u32 {
        /// May allocate heap extents through `mmap`.
        const MALLOC = 1 << 0;
        /// May map peripheral address ranges.
        const PERIPHERAL = 1 << 1;
        /// May establish new memory mappings beyond its budget class.
        const MEMMAP = 1 << 2;
    }
}

impl TaskCaps {
    /// Capabilities granted to lazily registered tasks.
    pub const DEFAULT: Self = Self::MALLOC;

    /// Capabilities held by the kernel pseudo-task.
    pub const KERNEL: Self = Self::all();
}

bitflags::bitflags! {
    /// Flags for the secure `mmap` entry point.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    pub struct MapFlags: u32 {
        /// Do not extend the previous heap extent even if the adjacent free
        /// block allows it; always consume a fresh extent slot.
        const NEW_EXTENT = 1 << 0;
    }
}

/// Argument record for the secure `mmap` entry point.
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct MmapReq {
    pub size: u32,
    pub task: u16,
    pub _pad: u16,
    pub flags: u32,
}

/// Argument record for the secure `chown` entry point.
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ChownReq {
    pub base: u32,
    pub new_owner: u16,
    pub caller: u16,
}

/// Request kinds accepted at the non-secure-callable gate. Each variant
/// corresponds to exactly one entry point; the gate validates every
/// address-typed argument against the non-secure address map before
/// touching it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum SecureReq {
    Mmap = 0,
    Munmap = 1,
    MmapStack = 2,
    SwapStack = 3,
    Chown = 4,
    Owner = 5,
    Random = 6,
    FlashWrite = 7,
    Retire = 8,
}

/// Description of an executable image, produced by the (external) loader
/// and consumed by the spawn path.
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ExecInfo {
    /// Entry point address, in non-secure flash or RAM.
    pub entry: u32,
    /// Size of the text segment, in bytes.
    pub text_size: u32,
    /// Size of the initialized-data segment, in bytes.
    pub data_size: u32,
    /// Base of the position-independent data segment; lands in the GOT
    /// base register of the initial context.
    pub got_base: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sysnum_round_trip() {
        for n in 0..=Sysnum::PtracePoke as u32 {
            let s = Sysnum::try_from(n).unwrap();
            assert_eq!(s as u32, n);
        }
        assert!(Sysnum::try_from(Sysnum::PtracePoke as u32 + 1).is_err());
        assert!(Sysnum::try_from(SYSCALL_SIGRETURN).is_err());
    }

    #[test]
    fn sigset_ops() {
        let mut s = SigSet::EMPTY;
        assert!(s.is_empty());
        s.add(Signal::Chld);
        s.add(Signal::Kill);
        assert!(s.contains(Signal::Chld));
        assert_eq!(s.first(), Some(Signal::Kill));
        s.remove(Signal::Kill);
        assert_eq!(s.first(), Some(Signal::Chld));
    }

    #[test]
    fn retry_sentinel_is_not_an_errno() {
        for e in [
            EPERM, ENOENT, ESRCH, EINTR, EBADF, ECHILD, EAGAIN, ENOMEM,
            EACCES, EBUSY, EINVAL, ENFILE, ENOSPC, ENOSYS, ETIMEDOUT,
        ] {
            assert_ne!(e, SYSCALL_RETRY);
        }
    }
}
