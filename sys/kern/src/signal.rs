// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signal delivery.
//!
//! Delivery walks a fixed decision chain: a masked signal is parked in the
//! pending set; a traced task stops and its tracer wakes; a registered
//! handler runs through a trampoline spliced onto the target's saved
//! context (or synchronously if the target is the caller itself); anything
//! else gets the default disposition. The trampoline ends in the reserved
//! sigreturn trap, which restores the context saved here.
//!
//! One subtlety: if the target was blocked inside a syscall that returned
//! the retry sentinel, delivering a handled signal converts the pending
//! replay into `EINTR` rather than silently replaying the syscall under
//! the handler's feet.

use abi::{FaultInfo, Signal, TaskState, EINTR, SIG_IGN};

use crate::gate::MemoryAuthority;
use crate::sched::{NextTask, Sched};
use crate::task::ArchState;

/// Delivers `sig` to the task at arena index `target`.
pub fn deliver<A: MemoryAuthority>(
    sched: &mut Sched,
    auth: &mut A,
    target: usize,
    sig: Signal,
) -> NextTask {
    let t = sched.task(target);
    if matches!(t.state(), TaskState::Zombie | TaskState::Over) {
        return NextTask::Same;
    }

    if t.blocked.contains(sig) {
        sched.task_mut(target).pending.add(sig);
        return NextTask::Same;
    }

    if let Some(tracer) = t.tracer {
        // Debugger intercepts before any handler runs.
        sched.task_mut(target).pending.add(sig);
        if sched.task(target).state() != TaskState::Stopped {
            sched.suspend(target, TaskState::Stopped);
        }
        return sched.resume(tracer);
    }

    match t.handler(sig) {
        Some(SIG_IGN) => NextTask::Same,
        Some(handler) => invoke_handler(sched, target, sig, handler),
        None => default_disposition(sched, auth, target, sig),
    }
}

/// Splices the signal trampoline onto the target's saved context. The
/// original context is stashed for the sigreturn trap; an in-flight
/// syscall replay becomes `EINTR` first, so the interrupted call reports
/// interruption instead of restarting behind the handler's back.
fn invoke_handler(
    sched: &mut Sched,
    target: usize,
    sig: Signal,
    handler: u32,
) -> NextTask {
    let t = sched.task_mut(target);
    if t.replay.take().is_some() {
        t.save_mut().set_return(EINTR as u32);
        // A sigsuspend wait ends here; its mask promise is honored now,
        // since the parked call will never replay.
        if let Some(m) = t.saved_mask.take() {
            t.blocked = m;
        }
    }
    t.sig_backup = Some(t.save().clone());
    crate::arch::push_signal_frame(t.save_mut(), handler, sig);

    // A blocked target wakes to run its handler.
    if sched.task(target).state() == TaskState::Waiting {
        sched.resume(target)
    } else {
        NextTask::Same
    }
}

fn default_disposition<A: MemoryAuthority>(
    sched: &mut Sched,
    auth: &mut A,
    target: usize,
    sig: Signal,
) -> NextTask {
    match sig {
        Signal::Stop => {
            sched.suspend(target, TaskState::Stopped);
            NextTask::Other
        }
        Signal::Cont => {
            if sched.task(target).state() == TaskState::Stopped {
                sched.resume(target)
            } else {
                NextTask::Same
            }
        }
        Signal::Chld => {
            // Default SIGCHLD wakes a parent parked in wait so its
            // pending waitpid replays; otherwise it is ignored.
            if sched.task(target).state() == TaskState::Waiting {
                sched.resume(target)
            } else {
                NextTask::Same
            }
        }
        _ => {
            // Terminate. Exit status records the killing signal.
            crate::klog!("task killed by signal");
            sched.exit(auth, target, sig.number() as i32);
            NextTask::Other
        }
    }
}

/// Handles the reserved sigreturn trap: restores the context stashed at
/// delivery time. A sigreturn with no delivery in flight is a userland
/// protocol violation and leaves the context untouched.
pub fn sigreturn(sched: &mut Sched, caller: usize) {
    let t = sched.task_mut(caller);
    if let Some(saved) = t.sig_backup.take() {
        *t.save_mut() = saved;
    }
}

/// Hardware faults are delivered as their synchronous signal.
pub fn fault<A: MemoryAuthority>(
    sched: &mut Sched,
    auth: &mut A,
    target: usize,
    fault: FaultInfo,
) -> NextTask {
    crate::klog!("fault in task");
    deliver(sched, auth, target, fault.signal())
}

/// Re-examines the pending set after the blocked mask shrank, delivering
/// anything newly deliverable.
pub fn drain_pending<A: MemoryAuthority>(
    sched: &mut Sched,
    auth: &mut A,
    target: usize,
) -> NextTask {
    let mut hint = NextTask::Same;
    loop {
        let t = sched.task(target);
        let ready = abi::SigSet(t.pending.0 & !t.blocked.0);
        let Some(sig) = ready.first() else { break };
        sched.task_mut(target).pending.remove(sig);
        hint = hint.combine(deliver(sched, auth, target, sig));
    }
    hint
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::Deferred;
    use crate::task::FdPool;
    use abi::{ExecInfo, SigSet};
    use secure::mempool::Extent;

    fn auth() -> secure::gate::Gate {
        let ns = Extent {
            base: 0x2000_0000,
            size: 0x10_0000,
        };
        secure::gate::Gate::new(0x2001_0000, 0x2_0000, ns, 1)
    }

    fn setup() -> (Sched, secure::gate::Gate, FdPool, usize, usize) {
        let mut s = Sched::new();
        let mut a = auth();
        let mut fds = FdPool::new();
        let exec = ExecInfo {
            entry: 0x0800_1000,
            text_size: 0x1000,
            data_size: 0,
            got_base: 0,
        };
        let init = s.task_create(&mut a, &mut fds, exec, 0, 0).unwrap();
        let child = s.task_create(&mut a, &mut fds, exec, 0, 1).unwrap();
        (s, a, fds, init, child)
    }

    #[test]
    fn unhandled_kill_terminates_and_notifies_once() {
        let (mut s, mut a, _fds, _init, child) = setup();
        let cpid = s.task(child).pid();

        let _ = deliver(&mut s, &mut a, child, Signal::Kill);
        assert_eq!(s.task(child).state(), TaskState::Zombie);
        assert_eq!(s.task(child).exit_status, 9);

        // Exactly one child-exit notification, aimed at the parent.
        match s.pop_deferred() {
            Some(Deferred::ChildExit { parent, child: c }) => {
                assert_eq!(parent, 1);
                assert_eq!(c, cpid);
            }
            other => panic!("unexpected deferred item: {other:?}"),
        }
        assert!(s.pop_deferred().is_none());
    }

    #[test]
    fn masked_signal_parks_as_pending() {
        let (mut s, mut a, _fds, _init, child) = setup();
        let mut mask = SigSet::EMPTY;
        mask.add(Signal::Usr1);
        s.task_mut(child).blocked = mask;

        let _ = deliver(&mut s, &mut a, child, Signal::Usr1);
        assert_eq!(s.task(child).state(), TaskState::Runnable);
        assert!(s.task(child).pending.contains(Signal::Usr1));

        // Unblocking delivers it; with no handler, USR1 terminates.
        s.task_mut(child).blocked = SigSet::EMPTY;
        let _ = drain_pending(&mut s, &mut a, child);
        assert_eq!(s.task(child).state(), TaskState::Zombie);
    }

    #[test]
    fn handler_splices_trampoline_and_saves_context() {
        let (mut s, mut a, _fds, _init, child) = setup();
        let handler = 0x0800_2000;
        s.task_mut(child).handlers[Signal::Usr1.number() as usize] =
            Some(handler);
        let pc_before = s.task(child).save().pc();

        let _ = deliver(&mut s, &mut a, child, Signal::Usr1);
        assert_eq!(s.task(child).save().pc(), handler);
        assert!(s.task(child).sig_backup.is_some());

        sigreturn(&mut s, child);
        assert_eq!(s.task(child).save().pc(), pc_before);
        assert!(s.task(child).sig_backup.is_none());
    }

    #[test]
    fn handled_signal_interrupts_blocked_syscall() {
        let (mut s, mut a, _fds, init, child) = setup();
        s.task_mut(child).handlers[Signal::Int.number() as usize] =
            Some(0x0800_2000);
        // Pretend the task blocked in a syscall with a replay armed.
        s.task_mut(child).replay = Some(crate::task::PendingCall {
            nr: 21,
            args: [0; 5],
        });
        assert_eq!(s.pick_next(), Some(init));
        s.suspend(child, TaskState::Waiting);

        let _ = deliver(&mut s, &mut a, child, Signal::Int);
        let t = s.task(child);
        assert!(t.replay.is_none());
        assert_eq!(t.state(), TaskState::Runnable);

        // The interrupted syscall reports EINTR under the handler frame.
        sigreturn(&mut s, child);
        assert_eq!(s.task(child).save().return_slot(), EINTR as u32);
    }

    #[test]
    fn stop_and_cont_round_trip() {
        let (mut s, mut a, _fds, _init, child) = setup();
        let _ = deliver(&mut s, &mut a, child, Signal::Stop);
        assert_eq!(s.task(child).state(), TaskState::Stopped);
        let _ = deliver(&mut s, &mut a, child, Signal::Cont);
        assert_eq!(s.task(child).state(), TaskState::Runnable);
    }
}
