// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup and the trap-to-kernel plumbing.
//!
//! The board's reset code does hardware bring-up (clocks, the secure
//! image's own init has already run) and then calls [`start_kernel`] with
//! the init process image description. From that point the kernel is
//! entirely trap-driven: SVCall carries syscalls, SysTick carries time,
//! PendSV carries nothing and exists so interrupt handlers can request a
//! scheduling pass on exception return.
//!
//! The application must include a process that is always runnable (an
//! idle loop at the weakest priority); the scheduler treats an empty run
//! list as a fatal sizing bug rather than parking the core in a handler.

#[cfg(target_arch = "arm")]
pub use self::target::start_kernel;

#[cfg(target_arch = "arm")]
mod target {
    use abi::{ExecInfo, KERNEL_PID};
    use cortex_m::peripheral::scb::SystemHandler;
    use cortex_m::peripheral::syst::SystClkSource;

    use crate::fail;
    use crate::gate::SecureGate;
    use crate::syscalls::Kernel;
    use crate::task::ArchState;

    /// The one kernel instance. Written once in `start_kernel` before any
    /// trap can fire; traps never nest (one priority level), so the
    /// mutable borrows handed out below are serialized by hardware.
    static mut KERNEL: Option<Kernel<SecureGate>> = None;

    fn with_kernel<R>(f: impl FnOnce(&mut Kernel<SecureGate>) -> R) -> R {
        let k = unsafe { &mut *core::ptr::addr_of_mut!(KERNEL) };
        match k {
            Some(k) => f(k),
            None => fail::die("trap before start_kernel"),
        }
    }

    /// Runs the scheduler and aims the trap save area at the winner. All
    /// three trap bodies end here, so replayed syscalls and deferred work
    /// happen before any task gets the CPU back.
    fn dispatch(k: &mut Kernel<SecureGate>) {
        let _ = k.run_deferred();
        let Some(next) = k.schedule() else {
            fail::die("nothing runnable: application lacks an idle loop");
        };
        let t = k.sched.task_mut(next);
        crate::arch::apply_memory_protection(
            t.stack_base,
            t.stack_size,
            &t.exec,
        );
        // Safety: the task arena lives inside KERNEL, which is never
        // dropped; the pointer stays good until the next dispatch.
        unsafe {
            crate::arch::set_current_save(t.save_mut());
        }
    }

    #[no_mangle]
    extern "C" fn svcall_entry() {
        with_kernel(|k| {
            let Some(caller) = k.sched.current() else {
                fail::die("syscall with no current task");
            };
            let _ = k.syscall(caller);
            dispatch(k);
        })
    }

    #[no_mangle]
    extern "C" fn systick_entry() {
        with_kernel(|k| {
            let _ = k.tick();
            dispatch(k);
        })
    }

    #[no_mangle]
    extern "C" fn pendsv_entry() {
        with_kernel(dispatch)
    }

    /// Brings the kernel up and drops into the init process. Never
    /// returns; all further kernel execution happens in trap handlers.
    ///
    /// `tick_divisor` is core cycles per kernel tick (one millisecond on
    /// the reference board).
    ///
    /// # Safety
    ///
    /// Must be called exactly once, from the main stack in privileged
    /// Thread mode, after the secure image has initialized its side.
    pub unsafe fn start_kernel(init: ExecInfo, tick_divisor: u32) -> ! {
        let mut k = Kernel::new(SecureGate);
        if let Err(e) = k.spawn(init, 0, KERNEL_PID) {
            fail::die(format_args!("init spawn failed: {e}"));
        }

        let mut p = cortex_m::Peripherals::steal();

        // Traps all share one priority so they never nest; PendSV is
        // still set weakest so a pended pass runs after real interrupts.
        p.SCB.set_priority(SystemHandler::SVCall, 0xFF);
        p.SCB.set_priority(SystemHandler::SysTick, 0xFF);
        p.SCB.set_priority(SystemHandler::PendSV, 0xFF);

        p.SYST.set_clock_source(SystClkSource::Core);
        p.SYST.set_reload(tick_divisor - 1);
        p.SYST.clear_current();
        p.SYST.enable_counter();
        p.SYST.enable_interrupt();

        // The kernel must reach its final address before any pointer into
        // the task arena is taken; the save pointer survives until the
        // next dispatch.
        KERNEL = Some(k);

        let (pc, sp, arg, got) = with_kernel(|k| {
            dispatch(k);
            let Some(idx) = k.sched.current() else {
                fail::die("scheduler chose nothing at boot");
            };
            let save = k.sched.task(idx).save();
            // Consume the initial frame by hand; every later entry to
            // Thread mode goes through hardware unstacking instead.
            (
                ArchState::pc(save) | 1,
                ArchState::stack_pointer(save) + 32,
                ArchState::return_slot(save),
                ArchState::got_base(save),
            )
        });

        // CONTROL = 3: unprivileged Thread mode on the process stack.
        // The frame consumed above would have delivered r0 and r9 via
        // unstacking; hand them over explicitly instead.
        core::arch::asm!(
            "msr PSP, {sp}",
            "mov r9, {got}",
            "msr CONTROL, {ctl}",
            "isb",
            "bx {pc}",
            sp = in(reg) sp,
            got = in(reg) got,
            ctl = in(reg) 3u32,
            pc = in(reg) pc,
            in("r0") arg,
            options(noreturn),
        )
    }
}
