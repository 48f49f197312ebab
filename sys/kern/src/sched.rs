// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The scheduler state machine.
//!
//! `Sched` owns the task arena and two index-linked lists, `running`
//! (Runnable/Running tasks) and `idling` (everything else). A task is on
//! exactly one list at any instant; every state change here moves list
//! membership in the same step. The struct is built once at kernel init and
//! threaded through every entry point; there is no file-scope task state.
//!
//! Discipline is round-robin off the running list, with one override: a
//! task resumed with the reserved real-time nice value is force-selected
//! next and every other runnable task's timeslice is zeroed so the
//! switch happens at the first opportunity.

use abi::{
    ExecInfo, Sysret, TaskState, DEFAULT_TIMESLICE, ECHILD, EINVAL, ENOMEM,
    ESRCH, INIT_PID, NICE_RT, SYSCALL_RETRY, WNOHANG,
};
use heapless::Deque;

use crate::fail;
use crate::gate::MemoryAuthority;
use crate::limits::{DEFAULT_STACK_SIZE, MAX_DEFERRED, MAX_TASKS};
use crate::task::{ArchState, FdPool, Task};

/// Scheduling hint returned by operations that may unblock or demote
/// tasks. Forgetting to act on one would strand a wakeup.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum NextTask {
    /// Keep running the task we were running.
    Same,
    /// Switch, scheduler's choice.
    Other,
    /// Switch to this specific task.
    Specific(usize),
}

impl NextTask {
    pub fn combine(self, other: Self) -> Self {
        use NextTask::*; // shorthand for patterns

        match (self, other) {
            (x, y) if x == y => x,
            (Specific(_), Specific(_)) => Other,
            (Specific(x), _) | (_, Specific(x)) => Specific(x),
            (Other, _) | (_, Other) => Other,
            (Same, Same) => Same,
        }
    }
}

/// Work that must run outside the current trap: child-exit notification to
/// the parent, and resource teardown after a reap.
#[derive(Copy, Clone, Debug)]
pub enum Deferred {
    ChildExit { parent: u16, child: u16 },
    Teardown { idx: usize },
}

/// Which list a task is linked on.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Queue {
    Run,
    Idle,
}

#[derive(Copy, Clone, Debug, Default)]
struct Link {
    prev: Option<usize>,
    next: Option<usize>,
    on: Option<Queue>,
}

pub struct Sched {
    tasks: [Option<Task>; MAX_TASKS],
    links: [Link; MAX_TASKS],
    run_head: Option<usize>,
    idle_head: Option<usize>,
    current: Option<usize>,
    next_pid: u16,
    deferred: Deque<Deferred, MAX_DEFERRED>,
}

impl Sched {
    pub fn new() -> Self {
        const NO_TASK: Option<Task> = None;
        Sched {
            tasks: [NO_TASK; MAX_TASKS],
            links: [Link::default(); MAX_TASKS],
            run_head: None,
            idle_head: None,
            current: None,
            next_pid: INIT_PID,
            deferred: Deque::new(),
        }
    }

    pub fn task(&self, idx: usize) -> &Task {
        self.tasks[idx]
            .as_ref()
            .unwrap_or_else(|| fail::die("stale task index"))
    }

    pub fn task_mut(&mut self, idx: usize) -> &mut Task {
        self.tasks[idx]
            .as_mut()
            .unwrap_or_else(|| fail::die("stale task index"))
    }

    pub fn get(&self, idx: usize) -> Option<&Task> {
        self.tasks.get(idx).and_then(|t| t.as_ref())
    }

    /// Index of the task currently in the Running state, if the kernel is
    /// not running its own context.
    pub fn current(&self) -> Option<usize> {
        self.current
    }

    /// Finds the group-leader task of process `pid`.
    pub fn find_pid(&self, pid: u16) -> Option<usize> {
        self.tasks.iter().position(|t| {
            t.as_ref().map_or(false, |t| t.pid() == pid && t.tid() == 1)
        })
    }

    /// Finds a thread by pid and tid.
    pub fn find_thread(&self, pid: u16, tid: u16) -> Option<usize> {
        self.tasks.iter().position(|t| {
            t.as_ref()
                .map_or(false, |t| t.pid() == pid && t.tid() == tid)
        })
    }

    // ---- list plumbing ----

    fn head(&mut self, q: Queue) -> &mut Option<usize> {
        match q {
            Queue::Run => &mut self.run_head,
            Queue::Idle => &mut self.idle_head,
        }
    }

    /// Appends `idx` at the list tail.
    fn enqueue(&mut self, q: Queue, idx: usize) {
        if self.links[idx].on.is_some() {
            fail::die("task already queued");
        }
        self.links[idx] = Link {
            prev: None,
            next: None,
            on: Some(q),
        };
        match *self.head(q) {
            None => *self.head(q) = Some(idx),
            Some(h) => {
                let mut tail = h;
                while let Some(n) = self.links[tail].next {
                    tail = n;
                }
                self.links[tail].next = Some(idx);
                self.links[idx].prev = Some(tail);
            }
        }
    }

    fn unlink(&mut self, idx: usize) {
        let Link { prev, next, on } = self.links[idx];
        let Some(q) = on else {
            fail::die("task on no queue");
        };
        match prev {
            Some(p) => self.links[p].next = next,
            None => *self.head(q) = next,
        }
        if let Some(n) = next {
            self.links[n].prev = prev;
        }
        self.links[idx] = Link::default();
    }

    /// Moves a task between lists to match a state change.
    fn transition(&mut self, idx: usize, state: TaskState) {
        let was_run = self.task(idx).is_on_run_list();
        self.task_mut(idx).set_state(state);
        let is_run = self.task(idx).is_on_run_list();
        if was_run != is_run {
            self.unlink(idx);
            self.enqueue(if is_run { Queue::Run } else { Queue::Idle }, idx);
        }
    }

    /// List membership probe, used by invariant checks.
    pub fn on_run_list(&self, idx: usize) -> bool {
        self.links[idx].on == Some(Queue::Run)
    }

    pub fn on_idle_list(&self, idx: usize) -> bool {
        self.links[idx].on == Some(Queue::Idle)
    }

    // ---- pid allocation ----

    /// Finds an unused pid by monotonic search, wrapping and skipping any
    /// pid still alive. Pid 0 stays reserved for the kernel.
    fn alloc_pid(&mut self) -> Option<u16> {
        for _ in 0..=u16::MAX as u32 {
            let cand = self.next_pid;
            self.next_pid = match self.next_pid.checked_add(1) {
                Some(n) => n,
                None => INIT_PID,
            };
            let live = self.tasks.iter().any(|t| {
                t.as_ref().map_or(false, |t| t.pid() == cand)
            });
            if !live {
                return Some(cand);
            }
        }
        None
    }

    fn free_slot(&self) -> Option<usize> {
        self.tasks.iter().position(|t| t.is_none())
    }

    // ---- creation ----

    /// Spawns a new process: fresh pid, new stack from the secure
    /// authority, initial two-frame context aimed at the image's entry
    /// point with the task-end trampoline as return address.
    pub fn task_create<A: MemoryAuthority>(
        &mut self,
        auth: &mut A,
        fds: &mut FdPool,
        exec: ExecInfo,
        nice: i8,
        ppid: u16,
    ) -> Result<usize, Sysret> {
        let idx = self.free_slot().ok_or(ENOMEM)?;
        let pid = self.alloc_pid().ok_or(ENOMEM)?;

        let mut task = Task::new(pid, ppid, exec, nice);
        let base = auth.mmap_stack(DEFAULT_STACK_SIZE, pid)?;
        task.stack_base = base;
        task.stack_size = DEFAULT_STACK_SIZE;

        // Children of processes past the init range inherit cwd and a
        // snapshot of the descriptor table.
        if pid > INIT_PID {
            if let Some(pi) = self.find_pid(ppid) {
                let parent = self.task(pi);
                task.cwd = parent.cwd;
                if let Some(pt) = parent.fd_table {
                    task.fd_table = fds.dup(pt);
                }
            }
        }
        if task.fd_table.is_none() {
            task.fd_table = fds.alloc();
        }

        crate::arch::init_context(
            task.save_mut(),
            base + DEFAULT_STACK_SIZE,
            &exec,
        );

        self.tasks[idx] = Some(task);
        self.enqueue(Queue::Run, idx);
        if nice == NICE_RT {
            self.expedite(idx);
        }
        Ok(idx)
    }

    /// Inserts a fully built task (thread spawn path) on the run list.
    pub(crate) fn adopt(&mut self, task: Task) -> Result<usize, Sysret> {
        let idx = self.free_slot().ok_or(ENOMEM)?;
        self.tasks[idx] = Some(task);
        self.enqueue(Queue::Run, idx);
        Ok(idx)
    }

    /// Zeroes every other runnable task's timeslice so `idx` is dispatched
    /// at the next scheduling point.
    fn expedite(&mut self, idx: usize) {
        for (i, t) in self.tasks.iter_mut().enumerate() {
            if i == idx {
                continue;
            }
            if let Some(t) = t {
                if t.is_on_run_list() {
                    t.timeslice = 0;
                }
            }
        }
    }

    // ---- dispatch ----

    /// Demotes the current task (if still Running) and picks the next
    /// runnable task round-robin, starting just after the old current.
    /// Returns `None` when nothing is runnable and the kernel should idle.
    pub fn pick_next(&mut self) -> Option<usize> {
        let prev = self.current.take();
        if let Some(p) = prev {
            if self.task(p).state() == TaskState::Running {
                self.transition(p, TaskState::Runnable);
            }
        }

        // Real-time override beats queue order.
        let rt = self.tasks.iter().position(|t| {
            t.as_ref().map_or(false, |t| {
                t.nice == NICE_RT && t.state() == TaskState::Runnable
            })
        });

        let next = rt.or_else(|| {
            let start = prev
                .filter(|&p| self.on_run_list(p))
                .and_then(|p| self.links[p].next)
                .or(self.run_head);
            let mut cursor = start;
            let mut seen_wrap = false;
            while let Some(i) = cursor {
                if self.task(i).state() == TaskState::Runnable {
                    return Some(i);
                }
                cursor = self.links[i].next;
                if cursor.is_none() && !seen_wrap {
                    cursor = self.run_head;
                    seen_wrap = true;
                }
                if cursor == start && seen_wrap {
                    break;
                }
            }
            None
        })?;

        self.transition(next, TaskState::Running);
        self.task_mut(next).timeslice = DEFAULT_TIMESLICE;
        self.current = Some(next);
        Some(next)
    }

    /// One tick against the current task's timeslice.
    pub fn tick_current(&mut self) -> NextTask {
        let Some(idx) = self.current else {
            return NextTask::Same;
        };
        let t = self.task_mut(idx);
        t.timeslice = t.timeslice.saturating_sub(1);
        if t.timeslice == 0 {
            NextTask::Other
        } else {
            NextTask::Same
        }
    }

    /// Force-preempts all runnable tasks (timer expiry path).
    pub fn preempt_all(&mut self) {
        for t in self.tasks.iter_mut().flatten() {
            if t.is_on_run_list() {
                t.timeslice = 0;
            }
        }
    }

    /// Self-suspension into a blocked state. The caller must have armed a
    /// wakeup before calling this; there is no unconditional block.
    pub fn suspend(&mut self, idx: usize, state: TaskState) {
        debug_assert!(!matches!(
            state,
            TaskState::Runnable | TaskState::Running
        ));
        self.transition(idx, state);
        if self.current == Some(idx) {
            self.current = None;
        }
    }

    /// Wakes a blocked or stopped task.
    pub fn resume(&mut self, idx: usize) -> NextTask {
        match self.task(idx).state() {
            TaskState::Waiting | TaskState::Stopped | TaskState::Forked => {}
            // Resuming a dead or already-runnable task is a no-op.
            _ => return NextTask::Same,
        }
        self.transition(idx, TaskState::Runnable);
        if self.task(idx).nice == NICE_RT {
            self.expedite(idx);
            NextTask::Specific(idx)
        } else {
            NextTask::Other
        }
    }

    // ---- vfork / exec ----

    /// Creates a vfork child. The child borrows the parent's physical
    /// stack (contents backed up into a fresh extent, ownership swapped at
    /// the secure layer); the parent is parked in Forked with the child's
    /// pid pre-written into its saved return slot.
    pub fn vfork<A: MemoryAuthority>(
        &mut self,
        auth: &mut A,
        fds: &mut FdPool,
        caller: usize,
    ) -> Result<usize, Sysret> {
        let idx = self.free_slot().ok_or(ENOMEM)?;
        let pid = self.alloc_pid().ok_or(ENOMEM)?;

        let parent = self.task(caller);
        let (ppid, pexec, pnice, pcwd, pstack_base, pstack_size, pfds) = (
            parent.pid(),
            parent.exec,
            parent.nice,
            parent.cwd,
            parent.stack_base,
            parent.stack_size,
            parent.fd_table,
        );

        // Back the parent's stack contents up into a new extent owned by
        // the child, then swap records: the child ends up owning (and
        // running on) the physical stack, the parent holds the backup.
        let backup = auth.mmap_stack(pstack_size, pid)?;
        crate::arch::copy_user(backup, pstack_base, pstack_size);
        auth.swap_stack(ppid, pid)?;

        let mut child = Task::new(pid, ppid, pexec, pnice);
        child.cwd = pcwd;
        child.stack_base = pstack_base;
        child.stack_size = pstack_size;
        child.vfork_parent = Some(caller);
        if let Some(t) = pfds {
            fds.share(t);
            child.fd_table = Some(t);
        }
        *child.save_mut() = self.task(caller).save().clone();
        child.save_mut().set_return(0);

        self.tasks[idx] = Some(child);
        self.enqueue(Queue::Run, idx);

        let parent = self.task_mut(caller);
        parent.stack_base = backup;
        parent.save_mut().set_return(u32::from(pid));
        self.suspend(caller, TaskState::Forked);
        Ok(idx)
    }

    /// Ends a vfork borrow: restores the parent's stack contents from the
    /// backup, swaps ownership records back, and resumes the parent. On
    /// return the child's secure stack record is the backup extent, which
    /// the caller either replaces (exec) or leaves for teardown (exit).
    fn vfork_release<A: MemoryAuthority>(
        &mut self,
        auth: &mut A,
        child_idx: usize,
    ) -> Result<(), Sysret> {
        let Some(parent_idx) = self.task(child_idx).vfork_parent else {
            return Ok(());
        };
        let child = self.task(child_idx);
        let (cpid, original, size) =
            (child.pid(), child.stack_base, child.stack_size);
        let parent = self.task(parent_idx);
        let (ppid, backup) = (parent.pid(), parent.stack_base);

        crate::arch::copy_user(original, backup, size);
        auth.swap_stack(ppid, cpid)?;

        self.task_mut(parent_idx).stack_base = original;
        self.task_mut(child_idx).stack_base = backup;
        self.task_mut(child_idx).vfork_parent = None;
        let _ = self.resume(parent_idx);
        Ok(())
    }

    /// Replaces the caller's image. A vforked caller first releases its
    /// parent and gets a stack of its own; every caller gets a fresh
    /// initial context aimed at the new entry point.
    pub fn exec<A: MemoryAuthority>(
        &mut self,
        auth: &mut A,
        caller: usize,
        exec: ExecInfo,
    ) -> Result<(), Sysret> {
        if self.task(caller).is_vforked() {
            self.vfork_release(auth, caller)?;
            // The backup extent became the child's stack record; replace
            // it with a real allocation.
            let pid = self.task(caller).pid();
            let base = auth.mmap_stack(DEFAULT_STACK_SIZE, pid)?;
            let t = self.task_mut(caller);
            t.stack_base = base;
            t.stack_size = DEFAULT_STACK_SIZE;
        }
        let t = self.task_mut(caller);
        t.exec = exec;
        let (base, size) = (t.stack_base, t.stack_size);
        *t.save_mut() = crate::arch::SavedState::default();
        crate::arch::init_context(t.save_mut(), base + size, &exec);
        Ok(())
    }

    // ---- termination ----

    /// Terminates a task: Zombie state, vfork stack restoration, orphan
    /// reparenting, and exactly one child-exit notification queued to the
    /// parent (or init when the parent is gone).
    pub fn exit<A: MemoryAuthority>(
        &mut self,
        auth: &mut A,
        caller: usize,
        status: i32,
    ) {
        if self.task(caller).is_vforked() {
            // Ignore secure-side failure here; the task is dying either
            // way and the parent must not stay wedged.
            if self.vfork_release(auth, caller).is_err() {
                crate::klog!("vfork release failed on exit");
            }
        }
        let (pid, ppid) = (self.task(caller).pid(), self.task(caller).ppid());
        self.task_mut(caller).exit_status = status;
        self.suspend(caller, TaskState::Zombie);

        // Orphans get re-parented to init.
        for t in self.tasks.iter_mut().flatten() {
            if t.ppid() == pid {
                t.set_ppid(INIT_PID);
            }
        }

        let parent = if self.find_pid(ppid).is_some() {
            ppid
        } else {
            INIT_PID
        };
        if self
            .deferred
            .push_back(Deferred::ChildExit { parent, child: pid })
            .is_err()
        {
            fail::die("deferred queue full");
        }
    }

    /// The wait filter: does a zombie child match what the caller asked
    /// for?
    fn wait_match(child: &Task, caller_pid: u16, filter: i32) -> bool {
        child.ppid() == caller_pid
            && child.tid() == 1
            && child.state() == TaskState::Zombie
            && (filter <= 0 || child.pid() == u16::try_from(filter).unwrap_or(0))
    }

    /// The waitpid state machine. Returns the reaped child's pid and exit
    /// status, `Ok(None)` when `WNOHANG` applies, or the retry sentinel
    /// path: the caller is parked Waiting and must be replayed when a
    /// child exits.
    pub fn waitpid(
        &mut self,
        caller: usize,
        filter: i32,
        options: u32,
    ) -> Result<Option<(u16, i32)>, Sysret> {
        let caller_pid = self.task(caller).pid();
        let found = self.tasks.iter().position(|t| {
            t.as_ref()
                .map_or(false, |t| Self::wait_match(t, caller_pid, filter))
        });
        if let Some(ci) = found {
            let (cpid, status) =
                (self.task(ci).pid(), self.task(ci).exit_status);
            self.mark_over(ci);
            return Ok(Some((cpid, status)));
        }

        // Reaped children awaiting teardown no longer count; blocking on
        // them would never end.
        let any_children = self.tasks.iter().any(|t| {
            t.as_ref().map_or(false, |t| {
                t.ppid() == caller_pid
                    && t.tid() == 1
                    && t.state() != TaskState::Over
            })
        });
        if !any_children {
            return Err(ECHILD);
        }
        if options & WNOHANG != 0 {
            return Ok(None);
        }
        // Block until a child-exit notification resumes us; the syscall
        // layer parks the caller and replays.
        Err(SYSCALL_RETRY)
    }

    /// Marks a task reaped and queues its deferred resource teardown.
    pub(crate) fn mark_over(&mut self, idx: usize) {
        self.transition(idx, TaskState::Over);
        if self.current == Some(idx) {
            self.current = None;
        }
        if self
            .deferred
            .push_back(Deferred::Teardown { idx })
            .is_err()
        {
            fail::die("deferred queue full");
        }
    }

    /// Removes a reaped task from the arena, returning it so the caller
    /// can release its resources.
    pub fn remove(&mut self, idx: usize) -> Result<Task, Sysret> {
        match self.tasks.get(idx) {
            Some(Some(t)) if t.state() == TaskState::Over => {
                self.unlink(idx);
                self.tasks[idx].take().ok_or(ESRCH)
            }
            _ => Err(EINVAL),
        }
    }

    pub fn pop_deferred(&mut self) -> Option<Deferred> {
        self.deferred.pop_front()
    }

    /// Number of live tasks, across both lists.
    pub fn live_tasks(&self) -> usize {
        self.tasks.iter().flatten().count()
    }
}

impl Default for Sched {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secure::mempool::Extent;

    fn auth() -> secure::gate::Gate {
        let ns = Extent {
            base: 0x2000_0000,
            size: 0x10_0000,
        };
        secure::gate::Gate::new(0x2001_0000, 0x2_0000, ns, 1)
    }

    fn exec_info() -> ExecInfo {
        ExecInfo {
            entry: 0x0800_1000,
            text_size: 0x1000,
            data_size: 0x100,
            got_base: 0x2000_0100,
        }
    }

    fn spawn(
        s: &mut Sched,
        a: &mut secure::gate::Gate,
        fds: &mut FdPool,
        ppid: u16,
    ) -> usize {
        s.task_create(a, fds, exec_info(), 0, ppid).unwrap()
    }

    /// Every live task is on exactly one list, and the Running task is on
    /// the run list.
    fn check_disjoint(s: &Sched) {
        for i in 0..MAX_TASKS {
            let Some(t) = s.get(i) else { continue };
            let run = s.on_run_list(i);
            let idle = s.on_idle_list(i);
            assert!(run ^ idle, "task {i} on {run}/{idle}");
            assert_eq!(run, t.is_on_run_list());
            if t.state() == TaskState::Running {
                assert!(run);
            }
        }
    }

    #[test]
    fn list_disjointness_over_random_lifecycle() {
        let mut s = Sched::new();
        let mut a = auth();
        let mut fds = FdPool::new();
        let init = spawn(&mut s, &mut a, &mut fds, 0);
        check_disjoint(&s);

        // A scripted mix of create/suspend/resume/terminate, checking the
        // invariant at every step.
        let mut live = [init, 0, 0, 0];
        for (i, slot) in live.iter_mut().enumerate().skip(1) {
            *slot = spawn(&mut s, &mut a, &mut fds, 1);
            check_disjoint(&s);
            assert_ne!(s.task(*slot).pid(), 0);
            let _ = i;
        }
        let picked = s.pick_next().unwrap();
        check_disjoint(&s);
        s.suspend(picked, TaskState::Waiting);
        check_disjoint(&s);
        let _ = s.resume(picked);
        check_disjoint(&s);
        s.exit(&mut a, live[3], 0);
        check_disjoint(&s);
        let _ = s.pick_next().unwrap();
        check_disjoint(&s);
    }

    #[test]
    fn round_robin_rotates() {
        let mut s = Sched::new();
        let mut a = auth();
        let mut fds = FdPool::new();
        let t1 = spawn(&mut s, &mut a, &mut fds, 0);
        let t2 = spawn(&mut s, &mut a, &mut fds, 1);
        let t3 = spawn(&mut s, &mut a, &mut fds, 1);

        let first = s.pick_next().unwrap();
        let second = s.pick_next().unwrap();
        let third = s.pick_next().unwrap();
        let fourth = s.pick_next().unwrap();
        assert_eq!(first, t1);
        assert_eq!(second, t2);
        assert_eq!(third, t3);
        assert_eq!(fourth, t1);
    }

    #[test]
    fn realtime_override_preempts() {
        let mut s = Sched::new();
        let mut a = auth();
        let mut fds = FdPool::new();
        let t1 = spawn(&mut s, &mut a, &mut fds, 0);
        let _t2 = spawn(&mut s, &mut a, &mut fds, 1);
        let rt = s
            .task_create(&mut a, &mut fds, exec_info(), NICE_RT, 1)
            .unwrap();

        assert_eq!(s.pick_next(), Some(rt));
        // Everyone else's timeslice got zeroed on the way in.
        assert_eq!(s.task(t1).timeslice, 0);
    }

    #[test]
    fn pid_allocation_skips_live_pids() {
        let mut s = Sched::new();
        let mut a = auth();
        let mut fds = FdPool::new();
        let t1 = spawn(&mut s, &mut a, &mut fds, 0);
        assert_eq!(s.task(t1).pid(), 1);
        let t2 = spawn(&mut s, &mut a, &mut fds, 1);
        assert_eq!(s.task(t2).pid(), 2);
        // Force the cursor to wrap onto a live pid.
        s.next_pid = 1;
        let t3 = spawn(&mut s, &mut a, &mut fds, 1);
        assert_eq!(s.task(t3).pid(), 3);
    }

    #[test]
    fn vfork_parks_parent_with_child_pid() {
        let mut s = Sched::new();
        let mut a = auth();
        let mut fds = FdPool::new();
        let parent = spawn(&mut s, &mut a, &mut fds, 0);
        assert_eq!(s.pick_next(), Some(parent));
        let original_stack = s.task(parent).stack_base;

        let child = s.vfork(&mut a, &mut fds, parent).unwrap();
        let cpid = s.task(child).pid();
        assert_eq!(s.task(parent).state(), TaskState::Forked);
        assert!(s.on_idle_list(parent));
        assert_eq!(s.task(parent).save().return_slot(), u32::from(cpid));
        assert_eq!(s.task(child).save().return_slot(), 0);
        // Child borrowed the parent's physical stack; the parent's record
        // now names the backup extent.
        assert_eq!(s.task(child).stack_base, original_stack);
        assert_ne!(s.task(parent).stack_base, original_stack);
        assert!(s.task(child).is_vforked());
    }

    #[test]
    fn vfork_exec_returns_stack_and_resumes_parent() {
        let mut s = Sched::new();
        let mut a = auth();
        let mut fds = FdPool::new();
        let parent = spawn(&mut s, &mut a, &mut fds, 0);
        assert_eq!(s.pick_next(), Some(parent));
        let original_stack = s.task(parent).stack_base;

        let child = s.vfork(&mut a, &mut fds, parent).unwrap();
        let cpid = s.task(child).pid();
        s.exec(&mut a, child, exec_info()).unwrap();

        assert_eq!(s.task(parent).state(), TaskState::Runnable);
        assert_eq!(s.task(parent).stack_base, original_stack);
        assert_eq!(s.task(parent).save().return_slot(), u32::from(cpid));
        // Child has a stack of its own now, owned in the secure table.
        let cstack = s.task(child).stack_base;
        assert_ne!(cstack, original_stack);
        assert_eq!(
            a.authority().stack_extent(cpid).map(|e| e.base),
            Some(cstack)
        );
        assert!(!s.task(child).is_vforked());
    }

    #[test]
    fn vfork_exit_restores_parent() {
        let mut s = Sched::new();
        let mut a = auth();
        let mut fds = FdPool::new();
        let parent = spawn(&mut s, &mut a, &mut fds, 0);
        assert_eq!(s.pick_next(), Some(parent));
        let original_stack = s.task(parent).stack_base;

        let child = s.vfork(&mut a, &mut fds, parent).unwrap();
        s.exit(&mut a, child, 7);

        assert_eq!(s.task(parent).state(), TaskState::Runnable);
        assert_eq!(s.task(parent).stack_base, original_stack);
        assert_eq!(s.task(child).state(), TaskState::Zombie);
    }

    #[test]
    fn waitpid_reaps_and_blocks() {
        let mut s = Sched::new();
        let mut a = auth();
        let mut fds = FdPool::new();
        let init = spawn(&mut s, &mut a, &mut fds, 0);
        let child = spawn(&mut s, &mut a, &mut fds, 1);
        let cpid = s.task(child).pid();

        // Nothing dead yet: WNOHANG reports "no change", plain wait
        // blocks.
        assert_eq!(s.waitpid(init, -1, WNOHANG), Ok(None));
        assert_eq!(s.waitpid(init, -1, 0), Err(SYSCALL_RETRY));

        s.exit(&mut a, child, 42);
        assert_eq!(s.waitpid(init, -1, 0), Ok(Some((cpid, 42))));
        assert_eq!(s.task(child).state(), TaskState::Over);

        // Child gone; nothing left to wait for.
        assert_eq!(s.waitpid(init, -1, 0), Err(ECHILD));
    }
}
