// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Syscall dispatch.
//!
//! `Kernel` owns every subsystem and a dense handler table indexed by
//! syscall number. Handlers return a [`SysOutcome`]; `Done` writes the
//! caller's return slot, `Retry` parks the exact call for replay when the
//! task next runs, and `NoReturn` leaves the saved context alone (exit,
//! exec, vfork, and the table's numbering holes, which resume the caller
//! untouched).
//!
//! The retry protocol is the backbone of all blocking: a handler that
//! cannot complete arms a wakeup, parks the caller, and reports `Retry`.
//! The dispatcher records the number and argument words; `schedule`
//! re-runs the recorded call before handing the CPU back, so from
//! userland's perspective the syscall simply took a while. Handlers are
//! written to be idempotent under this replay: per-descriptor `progress`
//! and the task's `timed_out` flag carry whatever state must survive it.

use abi::{
    ExecInfo, MapFlags, Signal, Sysnum, Sysret, TaskState, EAGAIN, EBADF,
    EINTR, EINVAL, ENFILE, ENOMEM, EPERM, ESRCH, ETIMEDOUT, SIG_BLOCK,
    SIG_DFL, SIG_SETMASK, SIG_UNBLOCK, SYSCALL_ARGS, SYSCALL_RETRY,
    SYSCALL_SIGRETURN, SYSCALL_TABLE_SIZE,
};

use crate::gate::MemoryAuthority;
use crate::ktimer::{TimerAction, Timers};
use crate::limits::{DEFAULT_STACK_SIZE, MAX_TASKS, PATH_MAX};
use crate::locks::{self, SemTable};
use crate::sched::{Deferred, NextTask, Sched};
use crate::signal;
use crate::task::{ArchState, FdPool, GroupPool, PendingCall, Task};
use crate::tasklet::Tasklets;
use crate::time::Timestamp;
use crate::umem::{self, USlice};
use crate::vfs::{FileDesc, Vfs};

/// Bytes moved per bounce-buffer pass between user memory and a module.
const IO_CHUNK: usize = 64;

/// What a syscall handler decided.
pub enum SysOutcome {
    /// Write this value into the caller's return slot.
    Done(Sysret),
    /// The caller is parked; replay this call when it next runs.
    Retry,
    /// Do not touch the caller's saved context.
    NoReturn,
}

type Handler<A> =
    fn(&mut Kernel<A>, usize, [u32; SYSCALL_ARGS]) -> SysOutcome;

/// The kernel: every subsystem, threaded through one struct built at boot.
pub struct Kernel<A: MemoryAuthority> {
    pub auth: A,
    pub sched: Sched,
    pub fds: FdPool,
    pub groups: GroupPool,
    pub timers: Timers,
    pub tasklets: Tasklets,
    pub sems: SemTable,
    pub vfs: Vfs,
    pub now: Timestamp,
    resched: NextTask,
    handlers: [Option<Handler<A>>; SYSCALL_TABLE_SIZE],
}

impl<A: MemoryAuthority> Kernel<A> {
    pub fn new(auth: A) -> Self {
        let mut handlers: [Option<Handler<A>>; SYSCALL_TABLE_SIZE] =
            [None; SYSCALL_TABLE_SIZE];
        let table: &[(Sysnum, Handler<A>)] = &[
            (Sysnum::Exit, sys_exit),
            (Sysnum::GetPid, sys_getpid),
            (Sysnum::GetPpid, sys_getppid),
            (Sysnum::Sleep, sys_sleep),
            (Sysnum::Vfork, sys_vfork),
            (Sysnum::Exec, sys_exec),
            (Sysnum::Waitpid, sys_waitpid),
            (Sysnum::Kill, sys_kill),
            (Sysnum::Sigaction, sys_sigaction),
            (Sysnum::Sigprocmask, sys_sigprocmask),
            (Sysnum::Sigsuspend, sys_sigsuspend),
            (Sysnum::Open, sys_open),
            (Sysnum::Close, sys_close),
            (Sysnum::Read, sys_read),
            (Sysnum::Write, sys_write),
            (Sysnum::Seek, sys_seek),
            (Sysnum::Ioctl, sys_ioctl),
            (Sysnum::Poll, sys_poll),
            (Sysnum::Mmap, sys_mmap),
            (Sysnum::Munmap, sys_munmap),
            (Sysnum::SemInit, sys_sem_init),
            (Sysnum::SemWait, sys_sem_wait),
            (Sysnum::SemTrywait, sys_sem_trywait),
            (Sysnum::SemPost, sys_sem_post),
            (Sysnum::SemDestroy, sys_sem_destroy),
            (Sysnum::MutexInit, sys_mutex_init),
            // Mutex lock/unlock share the semaphore paths; a mutex is a
            // binary semaphore with a post ceiling of one.
            (Sysnum::MutexLock, sys_sem_wait),
            (Sysnum::MutexUnlock, sys_sem_post),
            (Sysnum::ThreadCreate, sys_thread_create),
            (Sysnum::ThreadJoin, sys_thread_join),
            (Sysnum::ThreadDetach, sys_thread_detach),
            (Sysnum::PtracePeek, sys_ptrace_peek),
            (Sysnum::PtracePoke, sys_ptrace_poke),
        ];
        for &(n, f) in table {
            handlers[n as usize] = Some(f);
        }
        Kernel {
            auth,
            sched: Sched::new(),
            fds: FdPool::new(),
            groups: GroupPool::new(),
            timers: Timers::new(),
            tasklets: Tasklets::new(),
            sems: SemTable::new(),
            vfs: Vfs::new(),
            now: Timestamp::ZERO,
            resched: NextTask::Same,
            handlers,
        }
    }

    /// Spawns a process from a loaded image description.
    pub fn spawn(
        &mut self,
        exec: ExecInfo,
        nice: i8,
        ppid: u16,
    ) -> Result<usize, Sysret> {
        self.sched.task_create(&mut self.auth, &mut self.fds, exec, nice, ppid)
    }

    /// Accumulates a scheduling hint from a handler.
    fn note(&mut self, hint: NextTask) {
        self.resched = self.resched.combine(hint);
    }

    /// Entry from the trap path: dispatch whatever syscall the task at
    /// arena index `caller` trapped with.
    pub fn syscall(&mut self, caller: usize) -> NextTask {
        let save = self.sched.task(caller).save();
        let nr = save.syscall_number();
        if nr == SYSCALL_SIGRETURN {
            signal::sigreturn(&mut self.sched, caller);
            return NextTask::Same;
        }
        let args = save.args();
        self.run(caller, nr, args)
    }

    fn run(
        &mut self,
        caller: usize,
        nr: u32,
        args: [u32; SYSCALL_ARGS],
    ) -> NextTask {
        self.sched.task_mut(caller).in_syscall = true;
        let outcome = match self
            .handlers
            .get(nr as usize)
            .copied()
            .flatten()
        {
            Some(h) => h(self, caller, args),
            None => SysOutcome::NoReturn,
        };
        match outcome {
            SysOutcome::Done(v) => {
                self.sched.task_mut(caller).save_mut().set_return(v as u32);
            }
            SysOutcome::Retry => {
                self.sched.task_mut(caller).replay =
                    Some(PendingCall { nr, args });
            }
            SysOutcome::NoReturn => {}
        }
        self.sched.task_mut(caller).in_syscall = false;
        core::mem::replace(&mut self.resched, NextTask::Same)
    }

    /// One timer tick, callable from interrupt context: advances time,
    /// charges the current task's quantum, and latches (but does not run)
    /// the expiry drain when the soonest timer has passed.
    pub fn tick(&mut self) -> NextTask {
        self.now.advance();
        let mut hint = self.sched.tick_current();
        if self.timers.expired(self.now) && !self.timers.drain_queued {
            self.timers.drain_queued = true;
            self.sched.preempt_all();
            hint = hint.combine(NextTask::Other);
        }
        hint
    }

    /// Runs everything that was latched for execution outside interrupt
    /// context: the timer drain, the tasklet queue, child-exit
    /// notifications, and resource teardown.
    pub fn run_deferred(&mut self) -> NextTask {
        let mut hint = NextTask::Same;
        if self.timers.drain_queued {
            self.timers.drain_queued = false;
            while let Some(e) = self.timers.pop_expired(self.now) {
                let _ = Timers::fire(&mut self.sched, e);
            }
            hint = hint.combine(NextTask::Other);
        }
        self.tasklets.drain();
        while let Some(d) = self.sched.pop_deferred() {
            match d {
                Deferred::ChildExit { parent, child: _ } => {
                    if let Some(pi) = self.sched.find_pid(parent) {
                        hint = hint.combine(signal::deliver(
                            &mut self.sched,
                            &mut self.auth,
                            pi,
                            Signal::Chld,
                        ));
                    }
                }
                Deferred::Teardown { idx } => self.teardown(idx),
            }
        }
        hint
    }

    /// Picks the next task to run, replaying its parked syscall first.
    /// A replay that blocks again re-parks the task and the search
    /// continues; `None` means idle.
    pub fn schedule(&mut self) -> Option<usize> {
        loop {
            let next = self.sched.pick_next()?;
            if let Some(call) = self.sched.task_mut(next).replay.take() {
                let _ = self.run(next, call.nr, call.args);
                if self.sched.current() != Some(next) {
                    continue;
                }
            }
            return Some(next);
        }
    }

    /// Releases everything a reaped task held. Memory goes back to the
    /// secure pool only when no sibling thread still shares the pid.
    fn teardown(&mut self, idx: usize) {
        let task = match self.sched.remove(idx) {
            Ok(t) => t,
            Err(_) => {
                crate::klog!("teardown of non-reaped task");
                return;
            }
        };
        if let Some(h) = task.ktimer {
            self.timers.del(true, h);
        }
        self.sems.forget_task(idx);
        if let Some(ti) = task.fd_table {
            if let Some(fds) = self.fds.release(ti) {
                for fd in fds.iter().flatten() {
                    let _ = self.vfs.close(fd);
                }
            }
        }
        if let Some(g) = task.group {
            self.groups.leave(g, idx);
        }
        let pid = task.pid();
        let shared = (0..MAX_TASKS)
            .any(|i| self.sched.get(i).map_or(false, |t| t.pid() == pid));
        if !shared && self.auth.retire(pid).is_err() {
            crate::klog!("secure retire failed");
        }
    }

    /// Cancels any armed wakeup timer and clears the expiry flag; replayed
    /// handlers call this when the wait they were parked in is over.
    fn clear_wakeup(&mut self, caller: usize) {
        let t = self.sched.task_mut(caller);
        t.timed_out = false;
        if let Some(h) = t.ktimer.take() {
            self.timers.del(true, h);
        }
    }
}

// ---- process lifecycle ----

fn sys_exit<A: MemoryAuthority>(
    k: &mut Kernel<A>,
    caller: usize,
    args: [u32; SYSCALL_ARGS],
) -> SysOutcome {
    let status = args[0] as i32;
    if k.sched.task(caller).tid() != 1 {
        return thread_exit(k, caller, status);
    }
    // Group leader exit takes the sibling threads down with it.
    if let Some(g) = k.sched.task(caller).group {
        let members = k.groups.get_mut(g).map_or(0, |g| g.members);
        for i in 0..MAX_TASKS {
            if i != caller && members & (1 << i) != 0 {
                k.sched.mark_over(i);
            }
        }
    }
    k.sched.exit(&mut k.auth, caller, status);
    k.note(NextTask::Other);
    SysOutcome::NoReturn
}

fn thread_exit<A: MemoryAuthority>(
    k: &mut Kernel<A>,
    caller: usize,
    status: i32,
) -> SysOutcome {
    let (pid, tid) = (k.sched.task(caller).pid(), k.sched.task(caller).tid());
    k.sched.task_mut(caller).exit_status = status;

    // Wake any sibling parked in a join aimed at this thread.
    for i in 0..MAX_TASKS {
        let Some(t) = k.sched.get(i) else { continue };
        if t.pid() != pid || t.state() != TaskState::Waiting {
            continue;
        }
        let joined = t.replay.map_or(false, |c| {
            c.nr == Sysnum::ThreadJoin as u32 && c.args[0] == u32::from(tid)
        });
        if joined {
            let h = k.sched.resume(i);
            k.note(h);
        }
    }

    if k.sched.task(caller).detached {
        k.sched.mark_over(caller);
    } else {
        k.sched.suspend(caller, TaskState::Zombie);
    }
    k.note(NextTask::Other);
    SysOutcome::NoReturn
}

fn sys_getpid<A: MemoryAuthority>(
    k: &mut Kernel<A>,
    caller: usize,
    _args: [u32; SYSCALL_ARGS],
) -> SysOutcome {
    SysOutcome::Done(i32::from(k.sched.task(caller).pid()))
}

fn sys_getppid<A: MemoryAuthority>(
    k: &mut Kernel<A>,
    caller: usize,
    _args: [u32; SYSCALL_ARGS],
) -> SysOutcome {
    SysOutcome::Done(i32::from(k.sched.task(caller).ppid()))
}

fn sys_sleep<A: MemoryAuthority>(
    k: &mut Kernel<A>,
    caller: usize,
    args: [u32; SYSCALL_ARGS],
) -> SysOutcome {
    if k.sched.task(caller).timed_out {
        k.clear_wakeup(caller);
        return SysOutcome::Done(0);
    }
    let ticks = args[0];
    if ticks == 0 {
        return SysOutcome::Done(0);
    }
    let (pid, tid) = (k.sched.task(caller).pid(), k.sched.task(caller).tid());
    match k.timers.add(
        true,
        k.now.deadline(ticks),
        TimerAction::Wake { pid, tid },
    ) {
        Ok(h) => {
            k.sched.task_mut(caller).ktimer = Some(h);
            k.sched.suspend(caller, TaskState::Waiting);
            k.note(NextTask::Other);
            SysOutcome::Retry
        }
        Err(e) => SysOutcome::Done(e),
    }
}

fn sys_vfork<A: MemoryAuthority>(
    k: &mut Kernel<A>,
    caller: usize,
    _args: [u32; SYSCALL_ARGS],
) -> SysOutcome {
    match k.sched.vfork(&mut k.auth, &mut k.fds, caller) {
        // The parent's return slot was pre-written with the child pid and
        // the parent parked; the child's copy of the context returns 0.
        Ok(_) => {
            k.note(NextTask::Other);
            SysOutcome::NoReturn
        }
        Err(e) => SysOutcome::Done(e),
    }
}

fn sys_exec<A: MemoryAuthority>(
    k: &mut Kernel<A>,
    caller: usize,
    args: [u32; SYSCALL_ARGS],
) -> SysOutcome {
    let exec = ExecInfo {
        entry: args[0],
        text_size: args[1],
        data_size: args[2],
        got_base: args[3],
    };
    if !crate::arch::code_plausible(exec.entry) {
        return SysOutcome::Done(EINVAL);
    }
    match k.sched.exec(&mut k.auth, caller, exec) {
        Ok(()) => {
            // The argv pointer rides into the fresh image in its first
            // argument register, which aliases the return slot.
            k.sched.task_mut(caller).save_mut().set_return(args[4]);
            SysOutcome::NoReturn
        }
        Err(e) => SysOutcome::Done(e),
    }
}

fn sys_waitpid<A: MemoryAuthority>(
    k: &mut Kernel<A>,
    caller: usize,
    args: [u32; SYSCALL_ARGS],
) -> SysOutcome {
    let status_ptr = args[1];
    if status_ptr != 0 {
        let slice = match USlice::new(status_ptr, 4) {
            Ok(s) => s,
            Err(e) => return SysOutcome::Done(e),
        };
        if let Err(e) = umem::validate(&k.sched, &mut k.auth, caller, &slice)
        {
            return SysOutcome::Done(e);
        }
    }
    match k.sched.waitpid(caller, args[0] as i32, args[2]) {
        Ok(Some((pid, status))) => {
            if status_ptr != 0 {
                crate::arch::write_user_word(status_ptr, status as u32);
            }
            SysOutcome::Done(i32::from(pid))
        }
        Ok(None) => SysOutcome::Done(0),
        Err(SYSCALL_RETRY) => {
            k.sched.suspend(caller, TaskState::Waiting);
            k.note(NextTask::Other);
            SysOutcome::Retry
        }
        Err(e) => SysOutcome::Done(e),
    }
}

// ---- signals ----

fn sys_kill<A: MemoryAuthority>(
    k: &mut Kernel<A>,
    caller: usize,
    args: [u32; SYSCALL_ARGS],
) -> SysOutcome {
    let _ = caller;
    let Some(sig) = Signal::from_number(args[1]) else {
        return SysOutcome::Done(EINVAL);
    };
    let Some(idx) = k.sched.find_pid(args[0] as u16) else {
        return SysOutcome::Done(ESRCH);
    };
    let h = signal::deliver(&mut k.sched, &mut k.auth, idx, sig);
    k.note(h);
    SysOutcome::Done(0)
}

fn sys_sigaction<A: MemoryAuthority>(
    k: &mut Kernel<A>,
    caller: usize,
    args: [u32; SYSCALL_ARGS],
) -> SysOutcome {
    let Some(sig) = Signal::from_number(args[0]) else {
        return SysOutcome::Done(EINVAL);
    };
    if matches!(sig, Signal::Kill | Signal::Stop) {
        return SysOutcome::Done(EINVAL);
    }
    let t = k.sched.task_mut(caller);
    let slot = &mut t.handlers[sig.number() as usize];
    let old = slot.unwrap_or(SIG_DFL);
    *slot = match args[1] {
        SIG_DFL => None,
        h => Some(h),
    };
    SysOutcome::Done(old as i32)
}

fn unmaskable() -> u32 {
    (1 << Signal::Kill.number()) | (1 << Signal::Stop.number())
}

fn sys_sigprocmask<A: MemoryAuthority>(
    k: &mut Kernel<A>,
    caller: usize,
    args: [u32; SYSCALL_ARGS],
) -> SysOutcome {
    let req = args[1] & !unmaskable();
    let t = k.sched.task_mut(caller);
    let old = t.blocked.0;
    t.blocked.0 = match args[0] {
        SIG_BLOCK => old | req,
        SIG_UNBLOCK => old & !req,
        SIG_SETMASK => req,
        _ => return SysOutcome::Done(EINVAL),
    };
    // Anything the new mask uncovered is deliverable right now.
    let h = signal::drain_pending(&mut k.sched, &mut k.auth, caller);
    k.note(h);
    SysOutcome::Done(old as i32)
}

fn sys_sigsuspend<A: MemoryAuthority>(
    k: &mut Kernel<A>,
    caller: usize,
    args: [u32; SYSCALL_ARGS],
) -> SysOutcome {
    let t = k.sched.task_mut(caller);
    if let Some(old) = t.saved_mask.take() {
        // Replay after a signal woke us: restore and report interruption.
        t.blocked = old;
        return SysOutcome::Done(EINTR);
    }
    t.saved_mask = Some(t.blocked);
    t.blocked.0 = args[0] & !unmaskable();
    // The replay record is armed here, not by the dispatcher: a handler
    // delivered in the drain below consumes it (converting this call to
    // EINTR under the trampoline), and the dispatcher must not re-park
    // the task behind the handler's back.
    t.replay = Some(PendingCall {
        nr: Sysnum::Sigsuspend as u32,
        args,
    });
    k.sched.suspend(caller, TaskState::Waiting);
    let h = signal::drain_pending(&mut k.sched, &mut k.auth, caller);
    k.note(h);
    k.note(NextTask::Other);
    SysOutcome::NoReturn
}

// ---- files ----

/// Writes a descriptor copy back into its table slot.
fn put_fd<A: MemoryAuthority>(
    k: &mut Kernel<A>,
    ti: usize,
    i: usize,
    fd: FileDesc,
) {
    if let Some(t) = k.fds.get_mut(ti) {
        if let Some(slot) = t.get_mut(i) {
            *slot = fd;
        }
    }
}

fn caller_fd<A: MemoryAuthority>(
    k: &Kernel<A>,
    caller: usize,
    i: usize,
) -> Result<(usize, FileDesc), Sysret> {
    let ti = k.sched.task(caller).fd_table.ok_or(EBADF)?;
    let fd = *k.fds.get(ti).and_then(|t| t.get(i)).ok_or(EBADF)?;
    Ok((ti, fd))
}

fn sys_open<A: MemoryAuthority>(
    k: &mut Kernel<A>,
    caller: usize,
    args: [u32; SYSCALL_ARGS],
) -> SysOutcome {
    let (module, path_ptr, path_len, flags) =
        (args[0] as usize, args[1], args[2], args[3]);
    if path_len as usize > PATH_MAX {
        return SysOutcome::Done(EINVAL);
    }
    let slice = match USlice::new(path_ptr, path_len) {
        Ok(s) => s,
        Err(e) => return SysOutcome::Done(e),
    };
    if let Err(e) = umem::validate(&k.sched, &mut k.auth, caller, &slice) {
        return SysOutcome::Done(e);
    }
    let mut path = [0u8; PATH_MAX];
    let path = &mut path[..path_len as usize];
    crate::arch::read_user(path_ptr, path);

    let open = match k.vfs.module(module).and_then(|m| m.ops.open) {
        Some(f) => f,
        None => return SysOutcome::Done(abi::ENOSYS),
    };
    let fno = match open(path, flags) {
        Ok(fno) => fno,
        Err(e) => return SysOutcome::Done(e),
    };

    let Some(ti) = k.sched.task(caller).fd_table else {
        return SysOutcome::Done(EBADF);
    };
    let installed = k.fds.get_mut(ti).and_then(|t| {
        t.add(FileDesc {
            module,
            fno,
            flags,
            pos: 0,
            progress: 0,
        })
    });
    match installed {
        Some(i) => SysOutcome::Done(i as i32),
        None => {
            let _ = k.vfs.close(&FileDesc {
                module,
                fno,
                flags,
                pos: 0,
                progress: 0,
            });
            SysOutcome::Done(ENFILE)
        }
    }
}

fn sys_close<A: MemoryAuthority>(
    k: &mut Kernel<A>,
    caller: usize,
    args: [u32; SYSCALL_ARGS],
) -> SysOutcome {
    let i = args[0] as usize;
    let Ok((ti, fd)) = caller_fd(k, caller, i) else {
        // Closing an empty slot is tolerated.
        return SysOutcome::Done(0);
    };
    let r = k.vfs.close(&fd);
    if let Some(t) = k.fds.get_mut(ti) {
        let _ = t.del(i);
    }
    SysOutcome::Done(if r < 0 { r } else { 0 })
}

fn sys_read<A: MemoryAuthority>(
    k: &mut Kernel<A>,
    caller: usize,
    args: [u32; SYSCALL_ARGS],
) -> SysOutcome {
    do_io(k, caller, args, false)
}

fn sys_write<A: MemoryAuthority>(
    k: &mut Kernel<A>,
    caller: usize,
    args: [u32; SYSCALL_ARGS],
) -> SysOutcome {
    do_io(k, caller, args, true)
}

/// Shared read/write engine: bounce-buffered transfer between user memory
/// and the module, chunk by chunk. `EAGAIN` from the module parks the
/// caller on a one-tick retry timer; `fd.progress` preserves whatever was
/// already transferred across those replays, so the transfer resumes
/// mid-buffer rather than restarting.
fn do_io<A: MemoryAuthority>(
    k: &mut Kernel<A>,
    caller: usize,
    args: [u32; SYSCALL_ARGS],
    writing: bool,
) -> SysOutcome {
    k.clear_wakeup(caller);
    let (i, base, total) = (args[0] as usize, args[1], args[2]);
    let slice = match USlice::new(base, total) {
        Ok(s) => s,
        Err(e) => return SysOutcome::Done(e),
    };
    if let Err(e) = umem::validate(&k.sched, &mut k.auth, caller, &slice) {
        return SysOutcome::Done(e);
    }
    let (ti, mut fd) = match caller_fd(k, caller, i) {
        Ok(v) => v,
        Err(e) => return SysOutcome::Done(e),
    };

    let mut buf = [0u8; IO_CHUNK];
    loop {
        let remaining = (total - fd.progress) as usize;
        if remaining == 0 {
            break;
        }
        let chunk = remaining.min(IO_CHUNK);
        let addr = base + fd.progress;
        let pos = fd.pos + fd.progress;
        let r = if writing {
            crate::arch::read_user(addr, &mut buf[..chunk]);
            k.vfs.write(&fd, &buf[..chunk], pos)
        } else {
            let r = k.vfs.read(&fd, &mut buf[..chunk], pos);
            if r > 0 {
                crate::arch::write_user(addr, &buf[..r as usize]);
            }
            r
        };
        match r {
            r if r > 0 => {
                fd.progress += r as u32;
                if (r as usize) < chunk {
                    break;
                }
            }
            0 => break,
            EAGAIN => {
                let (pid, tid) =
                    (k.sched.task(caller).pid(), k.sched.task(caller).tid());
                match k.timers.add(
                    true,
                    k.now.deadline(1),
                    TimerAction::Wake { pid, tid },
                ) {
                    Ok(h) => k.sched.task_mut(caller).ktimer = Some(h),
                    Err(_) => {
                        // No timer slot to wait on; hand back whatever
                        // already moved, or EAGAIN if nothing did.
                        let done = fd.progress;
                        fd.pos += done;
                        fd.progress = 0;
                        put_fd(k, ti, i, fd);
                        return SysOutcome::Done(if done > 0 {
                            done as i32
                        } else {
                            EAGAIN
                        });
                    }
                }
                k.sched.suspend(caller, TaskState::Waiting);
                put_fd(k, ti, i, fd);
                k.note(NextTask::Other);
                return SysOutcome::Retry;
            }
            e => {
                fd.progress = 0;
                put_fd(k, ti, i, fd);
                return SysOutcome::Done(e);
            }
        }
    }

    let done = fd.progress;
    fd.pos += done;
    fd.progress = 0;
    put_fd(k, ti, i, fd);
    SysOutcome::Done(done as i32)
}

fn sys_seek<A: MemoryAuthority>(
    k: &mut Kernel<A>,
    caller: usize,
    args: [u32; SYSCALL_ARGS],
) -> SysOutcome {
    let (ti, mut fd) = match caller_fd(k, caller, args[0] as usize) {
        Ok(v) => v,
        Err(e) => return SysOutcome::Done(e),
    };
    let r = k.vfs.seek(&fd, args[1] as i32, args[2] as i32);
    if r >= 0 {
        fd.pos = r as u32;
        put_fd(k, ti, args[0] as usize, fd);
    }
    SysOutcome::Done(r)
}

fn sys_ioctl<A: MemoryAuthority>(
    k: &mut Kernel<A>,
    caller: usize,
    args: [u32; SYSCALL_ARGS],
) -> SysOutcome {
    let (_ti, fd) = match caller_fd(k, caller, args[0] as usize) {
        Ok(v) => v,
        Err(e) => return SysOutcome::Done(e),
    };
    SysOutcome::Done(k.vfs.ioctl(&fd, args[1], args[2]))
}

/// Single-descriptor poll: returns the satisfied events, 0 on timeout.
/// The wait granularity is the armed timeout; a task resumed early for
/// any reason re-checks readiness on replay.
fn sys_poll<A: MemoryAuthority>(
    k: &mut Kernel<A>,
    caller: usize,
    args: [u32; SYSCALL_ARGS],
) -> SysOutcome {
    let (_ti, fd) = match caller_fd(k, caller, args[0] as usize) {
        Ok(v) => v,
        Err(e) => return SysOutcome::Done(e),
    };
    let mut revents = 0u16;
    if k.vfs.poll(&fd, args[1] as u16, &mut revents) {
        k.clear_wakeup(caller);
        return SysOutcome::Done(i32::from(revents));
    }
    if k.sched.task(caller).timed_out {
        k.clear_wakeup(caller);
        return SysOutcome::Done(0);
    }
    let timeout = args[2];
    if timeout == 0 {
        return SysOutcome::Done(0);
    }
    let (pid, tid) = (k.sched.task(caller).pid(), k.sched.task(caller).tid());
    match k.timers.add(
        true,
        k.now.deadline(timeout),
        TimerAction::Wake { pid, tid },
    ) {
        Ok(h) => {
            k.sched.task_mut(caller).ktimer = Some(h);
            k.sched.suspend(caller, TaskState::Waiting);
            k.note(NextTask::Other);
            SysOutcome::Retry
        }
        Err(e) => SysOutcome::Done(e),
    }
}

// ---- memory ----

fn sys_mmap<A: MemoryAuthority>(
    k: &mut Kernel<A>,
    caller: usize,
    args: [u32; SYSCALL_ARGS],
) -> SysOutcome {
    let pid = k.sched.task(caller).pid();
    let flags = MapFlags::from_bits_truncate(args[1]);
    match k.auth.mmap(args[0], pid, flags) {
        Ok(base) => SysOutcome::Done(base as i32),
        Err(e) => SysOutcome::Done(e),
    }
}

fn sys_munmap<A: MemoryAuthority>(
    k: &mut Kernel<A>,
    caller: usize,
    args: [u32; SYSCALL_ARGS],
) -> SysOutcome {
    let pid = k.sched.task(caller).pid();
    match k.auth.munmap(args[0], pid) {
        Ok(()) => SysOutcome::Done(0),
        Err(e) => SysOutcome::Done(e),
    }
}

// ---- semaphores and mutexes ----

fn sys_sem_init<A: MemoryAuthority>(
    k: &mut Kernel<A>,
    _caller: usize,
    args: [u32; SYSCALL_ARGS],
) -> SysOutcome {
    let limit = if args[1] == 0 { i32::MAX } else { args[1] as i32 };
    match k.sems.create(args[0] as i32, limit) {
        Ok(h) => SysOutcome::Done(h as i32),
        Err(e) => SysOutcome::Done(e),
    }
}

fn sys_mutex_init<A: MemoryAuthority>(
    k: &mut Kernel<A>,
    _caller: usize,
    _args: [u32; SYSCALL_ARGS],
) -> SysOutcome {
    match k.sems.create(1, 1) {
        Ok(h) => SysOutcome::Done(h as i32),
        Err(e) => SysOutcome::Done(e),
    }
}

/// Also the mutex lock path. `args[1]` is an optional timeout in ticks.
fn sys_sem_wait<A: MemoryAuthority>(
    k: &mut Kernel<A>,
    caller: usize,
    args: [u32; SYSCALL_ARGS],
) -> SysOutcome {
    if k.sched.task(caller).timed_out {
        k.clear_wakeup(caller);
        if let Ok(s) = k.sems.get(args[0]) {
            s.forget_listener(caller);
        }
        return SysOutcome::Done(ETIMEDOUT);
    }
    let r = locks::wait(&mut k.sems, &mut k.sched, Some(caller), args[0]);
    if r != SYSCALL_RETRY {
        k.clear_wakeup(caller);
        return SysOutcome::Done(r);
    }
    if args[1] != 0 && k.sched.task(caller).ktimer.is_none() {
        let (pid, tid) =
            (k.sched.task(caller).pid(), k.sched.task(caller).tid());
        match k.timers.add(
            true,
            k.now.deadline(args[1]),
            TimerAction::Wake { pid, tid },
        ) {
            Ok(h) => k.sched.task_mut(caller).ktimer = Some(h),
            Err(_) => {
                if let Ok(s) = k.sems.get(args[0]) {
                    s.forget_listener(caller);
                }
                let h = k.sched.resume(caller);
                k.note(h);
                return SysOutcome::Done(EAGAIN);
            }
        }
    }
    k.note(NextTask::Other);
    SysOutcome::Retry
}

fn sys_sem_trywait<A: MemoryAuthority>(
    k: &mut Kernel<A>,
    _caller: usize,
    args: [u32; SYSCALL_ARGS],
) -> SysOutcome {
    SysOutcome::Done(locks::trywait(&mut k.sems, args[0]))
}

/// Also the mutex unlock path.
fn sys_sem_post<A: MemoryAuthority>(
    k: &mut Kernel<A>,
    _caller: usize,
    args: [u32; SYSCALL_ARGS],
) -> SysOutcome {
    let (r, hint) = locks::post(&mut k.sems, &mut k.sched, args[0]);
    k.note(hint);
    SysOutcome::Done(r)
}

fn sys_sem_destroy<A: MemoryAuthority>(
    k: &mut Kernel<A>,
    _caller: usize,
    args: [u32; SYSCALL_ARGS],
) -> SysOutcome {
    match k.sems.get(args[0]) {
        Ok(s) if s.has_listeners() => SysOutcome::Done(abi::EBUSY),
        Ok(_) => match k.sems.destroy(args[0]) {
            Ok(()) => SysOutcome::Done(0),
            Err(e) => SysOutcome::Done(e),
        },
        Err(e) => SysOutcome::Done(e),
    }
}

// ---- threads ----

fn sys_thread_create<A: MemoryAuthority>(
    k: &mut Kernel<A>,
    caller: usize,
    args: [u32; SYSCALL_ARGS],
) -> SysOutcome {
    let (entry, arg, stack_req, detached) =
        (args[0], args[1], args[2], args[3] != 0);
    if !crate::arch::code_plausible(entry) {
        return SysOutcome::Done(EINVAL);
    }
    let g = match k.sched.task(caller).group {
        Some(g) => g,
        None => {
            let Some(g) = k.groups.alloc(caller) else {
                return SysOutcome::Done(ENOMEM);
            };
            k.sched.task_mut(caller).group = Some(g);
            g
        }
    };
    if k.groups.get_mut(g).map_or(true, |g| {
        usize::from(g.active) >= crate::limits::MAX_THREADS
    }) {
        return SysOutcome::Done(EAGAIN);
    }

    let leader = k.sched.task(caller);
    let (pid, ppid, nice, cwd, exec, fd_table) = (
        leader.pid(),
        leader.ppid(),
        leader.nice,
        leader.cwd,
        leader.exec,
        leader.fd_table,
    );
    let size = if stack_req == 0 { DEFAULT_STACK_SIZE } else { stack_req };
    // Thread stacks are heap extents of the process; they go back to the
    // pool with everything else at retire.
    let base = match k.auth.mmap(size, pid, MapFlags::NEW_EXTENT) {
        Ok(b) => b,
        Err(e) => return SysOutcome::Done(e),
    };

    let mut task = Task::new(pid, ppid, exec, nice);
    task.cwd = cwd;
    task.group = Some(g);
    task.detached = detached;
    task.stack_base = base;
    task.stack_size = size;
    if let Some(ti) = fd_table {
        k.fds.share(ti);
        task.fd_table = Some(ti);
    }
    let thread_exec = ExecInfo { entry, ..exec };
    crate::arch::init_context(task.save_mut(), base + size, &thread_exec);
    // The thread argument lands in the first argument register.
    task.save_mut().set_return(arg);

    let idx = match k.sched.adopt(task) {
        Ok(i) => i,
        Err(e) => {
            let _ = k.auth.munmap(base, pid);
            return SysOutcome::Done(e);
        }
    };
    let Some(tid) = k.groups.join(g, idx) else {
        crate::fail::die("thread group join after capacity check");
    };
    k.sched.task_mut(idx).set_tid(tid);
    SysOutcome::Done(i32::from(tid))
}

fn sys_thread_join<A: MemoryAuthority>(
    k: &mut Kernel<A>,
    caller: usize,
    args: [u32; SYSCALL_ARGS],
) -> SysOutcome {
    let tid = args[0] as u16;
    let status_ptr = args[1];
    let pid = k.sched.task(caller).pid();
    if tid == k.sched.task(caller).tid() {
        return SysOutcome::Done(EINVAL);
    }
    if status_ptr != 0 {
        let slice = match USlice::new(status_ptr, 4) {
            Ok(s) => s,
            Err(e) => return SysOutcome::Done(e),
        };
        if let Err(e) = umem::validate(&k.sched, &mut k.auth, caller, &slice)
        {
            return SysOutcome::Done(e);
        }
    }
    let Some(idx) = k.sched.find_thread(pid, tid) else {
        return SysOutcome::Done(ESRCH);
    };
    if k.sched.task(idx).detached {
        return SysOutcome::Done(EINVAL);
    }
    if k.sched.task(idx).state() == TaskState::Zombie {
        let status = k.sched.task(idx).exit_status;
        k.sched.mark_over(idx);
        if status_ptr != 0 {
            crate::arch::write_user_word(status_ptr, status as u32);
        }
        return SysOutcome::Done(0);
    }
    k.sched.suspend(caller, TaskState::Waiting);
    k.note(NextTask::Other);
    SysOutcome::Retry
}

fn sys_thread_detach<A: MemoryAuthority>(
    k: &mut Kernel<A>,
    caller: usize,
    args: [u32; SYSCALL_ARGS],
) -> SysOutcome {
    let pid = k.sched.task(caller).pid();
    let Some(idx) = k.sched.find_thread(pid, args[0] as u16) else {
        return SysOutcome::Done(ESRCH);
    };
    k.sched.task_mut(idx).detached = true;
    if k.sched.task(idx).state() == TaskState::Zombie {
        k.sched.mark_over(idx);
    }
    SysOutcome::Done(0)
}

// ---- debugger ----

/// Register selectors for the ptrace peek/poke window into a child's
/// saved context.
const PT_PC: u32 = 0;
const PT_SP: u32 = 1;
const PT_RET: u32 = 2;
const PT_GOT: u32 = 3;

fn trace_target<A: MemoryAuthority>(
    k: &mut Kernel<A>,
    caller: usize,
    pid: u32,
) -> Result<usize, Sysret> {
    let idx = k.sched.find_pid(pid as u16).ok_or(ESRCH)?;
    if k.sched.task(idx).ppid() != k.sched.task(caller).pid() {
        return Err(EPERM);
    }
    // First touch attaches: from here on, signals stop the target and
    // wake us instead of running its handlers.
    k.sched.task_mut(idx).tracer = Some(caller);
    Ok(idx)
}

fn sys_ptrace_peek<A: MemoryAuthority>(
    k: &mut Kernel<A>,
    caller: usize,
    args: [u32; SYSCALL_ARGS],
) -> SysOutcome {
    let idx = match trace_target(k, caller, args[0]) {
        Ok(i) => i,
        Err(e) => return SysOutcome::Done(e),
    };
    let save = k.sched.task(idx).save();
    let v = match args[1] {
        PT_PC => save.pc(),
        PT_SP => save.stack_pointer(),
        PT_RET => save.return_slot(),
        PT_GOT => save.got_base(),
        _ => return SysOutcome::Done(EINVAL),
    };
    SysOutcome::Done(v as i32)
}

fn sys_ptrace_poke<A: MemoryAuthority>(
    k: &mut Kernel<A>,
    caller: usize,
    args: [u32; SYSCALL_ARGS],
) -> SysOutcome {
    let idx = match trace_target(k, caller, args[0]) {
        Ok(i) => i,
        Err(e) => return SysOutcome::Done(e),
    };
    let save = k.sched.task_mut(idx).save_mut();
    match args[1] {
        PT_PC => save.set_pc(args[2]),
        PT_SP => save.set_stack_pointer(args[2]),
        PT_RET => save.set_return(args[2]),
        PT_GOT => save.set_got_base(args[2]),
        _ => return SysOutcome::Done(EINVAL),
    }
    SysOutcome::Done(0)
}
