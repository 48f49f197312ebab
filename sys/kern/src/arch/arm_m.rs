// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ARMv8-M (non-secure side) support.
//!
//! Tasks run unprivileged in Thread mode on the process stack. On any
//! trap the hardware stacks `r0-r3, r12, lr, pc, xPSR` onto the task's stack; the
//! handlers below save the callee-saved half (`r4-r11`), PSP, and the
//! exception-return word into the current task's `SavedState`, so between
//! traps the full user context is split across the two.
//!
//! Syscall convention: number in stacked `r3`, arguments in stacked
//! `r0-r2` plus two words the caller pushed immediately above the
//! hardware frame.

use core::arch::global_asm;
use core::ptr::addr_of;

use abi::{ExecInfo, Signal, SYSCALL_ARGS};

use crate::task::ArchState;

/// The hardware-stacked exception frame, as pushed on trap entry.
#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct ExceptionFrame {
    pub r0: u32,
    pub r1: u32,
    pub r2: u32,
    pub r3: u32,
    pub r12: u32,
    pub lr: u32,
    pub pc: u32,
    pub xpsr: u32,
}

/// Thumb state bit; required in any frame the hardware will unstack.
const INITIAL_XPSR: u32 = 1 << 24;

/// Return to Thread mode, non-secure, process stack, standard frame.
const EXC_RETURN_THREAD_PSP: u32 = 0xFFFF_FFBC;

// Provided by the application link: the stub a task's entry function
// returns into (issues the exit syscall), the stub spliced under signal
// handlers (issues the sigreturn trap), and the text window bounds.
extern "C" {
    static __task_return_stub: u32;
    static __signal_return_stub: u32;
    static __stext: u32;
    static __etext: u32;
}

/// Kernel-saved half of a task's context. The layout is fixed; the trap
/// assembly stores into it field by field.
#[derive(Clone, Debug, Default)]
#[repr(C)]
pub struct SavedState {
    r4: u32,
    r5: u32,
    r6: u32,
    r7: u32,
    r8: u32,
    r9: u32,
    r10: u32,
    r11: u32,
    psp: u32,
    exc_return: u32,
}

impl SavedState {
    fn frame(&self) -> *mut ExceptionFrame {
        self.psp as *mut ExceptionFrame
    }

    fn frame_word(&self, n: u32) -> u32 {
        // Safety: PSP was range-checked against the task's stack extent
        // at trap entry before the kernel ran.
        unsafe { core::ptr::read_volatile((self.psp + 4 * n) as *const u32) }
    }
}

impl ArchState for SavedState {
    fn syscall_number(&self) -> u32 {
        unsafe { (*self.frame()).r3 }
    }

    fn args(&self) -> [u32; SYSCALL_ARGS] {
        let f = unsafe { &*self.frame() };
        // Two extra argument words sit just above the hardware frame.
        // When entry stacking inserted an aligner word, xPSR bit 9 is
        // set and the caller's pushes sit one word higher.
        let pad = (f.xpsr >> 9) & 1;
        [
            f.r0,
            f.r1,
            f.r2,
            self.frame_word(8 + pad),
            self.frame_word(9 + pad),
        ]
    }

    fn set_return(&mut self, v: u32) {
        unsafe { (*self.frame()).r0 = v }
    }

    fn return_slot(&self) -> u32 {
        unsafe { (*self.frame()).r0 }
    }

    fn stack_pointer(&self) -> u32 {
        self.psp
    }

    fn set_stack_pointer(&mut self, sp: u32) {
        self.psp = sp;
    }

    fn pc(&self) -> u32 {
        unsafe { (*self.frame()).pc }
    }

    fn set_pc(&mut self, pc: u32) {
        unsafe { (*self.frame()).pc = pc }
    }

    fn set_lr(&mut self, lr: u32) {
        unsafe { (*self.frame()).lr = lr }
    }

    fn got_base(&self) -> u32 {
        self.r9
    }

    fn set_got_base(&mut self, base: u32) {
        self.r9 = base;
    }
}

/// Builds the initial context: one hardware frame at the stack top aimed
/// at the entry point, with the task-return stub as the return path.
pub fn init_context(save: &mut SavedState, stack_top: u32, exec: &ExecInfo) {
    let frame_base = (stack_top - 32) & !7;
    let frame = frame_base as *mut ExceptionFrame;
    // Safety: the stack extent was just granted to this task and nothing
    // else references it yet.
    unsafe {
        frame.write(ExceptionFrame {
            lr: addr_of!(__task_return_stub) as u32,
            pc: exec.entry & !1,
            xpsr: INITIAL_XPSR,
            ..ExceptionFrame::default()
        });
    }
    save.psp = frame_base;
    save.exc_return = EXC_RETURN_THREAD_PSP;
    save.r9 = exec.got_base;
}

/// Splices a signal frame under the saved context: a fresh hardware frame
/// below the current one, entering the handler with the signal number in
/// `r0` and returning through the sigreturn stub. The original frame is
/// left intact above it for restoration.
pub fn push_signal_frame(save: &mut SavedState, handler: u32, sig: Signal) {
    let frame_base = (save.psp - 32) & !7;
    let frame = frame_base as *mut ExceptionFrame;
    unsafe {
        frame.write(ExceptionFrame {
            r0: sig.number(),
            lr: addr_of!(__signal_return_stub) as u32,
            pc: handler & !1,
            xpsr: INITIAL_XPSR,
            ..ExceptionFrame::default()
        });
    }
    save.psp = frame_base;
}

/// Is `addr` inside the non-secure text window? Raw callbacks are checked
/// against this before the kernel jumps to them.
pub fn code_plausible(addr: u32) -> bool {
    let start = addr_of!(__stext) as u32;
    let end = addr_of!(__etext) as u32;
    addr >= start && addr < end
}

pub fn copy_user(dst: u32, src: u32, len: u32) {
    // Safety: both extents were granted by the secure authority to the
    // tasks involved; callers pass extents, not user-supplied pointers.
    unsafe {
        core::ptr::copy_nonoverlapping(
            src as *const u8,
            dst as *mut u8,
            len as usize,
        );
    }
}

pub fn read_user(src: u32, dst: &mut [u8]) {
    // Safety: range validated by umem before this is reached.
    unsafe {
        core::ptr::copy_nonoverlapping(
            src as *const u8,
            dst.as_mut_ptr(),
            dst.len(),
        );
    }
}

pub fn write_user(dst: u32, src: &[u8]) {
    unsafe {
        core::ptr::copy_nonoverlapping(
            src.as_ptr(),
            dst as *mut u8,
            src.len(),
        );
    }
}

pub fn read_user_word(addr: u32) -> u32 {
    unsafe { core::ptr::read_volatile(addr as *const u32) }
}

pub fn write_user_word(addr: u32, v: u32) {
    unsafe { core::ptr::write_volatile(addr as *mut u32, v) }
}

// ARMv8-M MPU registers. The cortex-m peripheral block exposes the v7
// layout, so these go through raw addresses.
const MPU_CTRL: *mut u32 = 0xE000_ED94 as *mut u32;
const MPU_RNR: *mut u32 = 0xE000_ED98 as *mut u32;
const MPU_RBAR: *mut u32 = 0xE000_ED9C as *mut u32;
const MPU_RLAR: *mut u32 = 0xE000_EDA0 as *mut u32;
const MPU_MAIR0: *mut u32 = 0xE000_EDC0 as *mut u32;

/// Attribute index 0: normal memory, write-back, read/write-allocate.
const MAIR_NORMAL: u32 = 0xFF;

// RBAR low bits: SH=00, AP, XN. AP=01 is read-write at any privilege,
// AP=11 read-only at any privilege.
const ATTR_RW_XN: u32 = 0b011;
const ATTR_RO_EXEC: u32 = 0b110;

/// Programs one region, or disables it when the span is empty.
unsafe fn region(n: u32, base: u32, end: u32, attr: u32) {
    MPU_RNR.write_volatile(n);
    if end <= base {
        MPU_RLAR.write_volatile(0);
        return;
    }
    MPU_RBAR.write_volatile((base & !31) | attr);
    MPU_RLAR.write_volatile(((end - 1) & !31) | 1);
}

/// Re-arms the MPU for the incoming task: its stack read-write, the
/// non-secure text window read-only executable (shared; the return
/// stubs live there too), and its data/GOT extent read-write. Tasks run
/// unprivileged, so anything outside these regions faults; PRIVDEFENA
/// keeps the default map for the kernel itself. Runs with interrupts
/// implicitly masked (handler mode), so the switch is atomic with the
/// context restore.
pub fn apply_memory_protection(
    stack_base: u32,
    stack_size: u32,
    exec: &ExecInfo,
) {
    let text_start = addr_of!(__stext) as u32;
    let text_end = addr_of!(__etext) as u32;
    unsafe {
        MPU_CTRL.write_volatile(0);
        MPU_MAIR0.write_volatile(MAIR_NORMAL);
        region(0, stack_base, stack_base + stack_size, ATTR_RW_XN);
        region(1, text_start, text_end, ATTR_RO_EXEC);
        region(
            2,
            exec.got_base,
            exec.got_base + exec.data_size,
            ATTR_RW_XN,
        );
        // ENABLE | PRIVDEFENA.
        MPU_CTRL.write_volatile(5);
    }
    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

/// RAII PRIMASK guard. `new(false)` is a no-op for paths already running
/// with interrupts implicitly masked (syscall context).
pub struct IrqMask {
    engaged: bool,
    was_active: bool,
}

impl IrqMask {
    pub fn new(engage: bool) -> Self {
        let was_active = cortex_m::register::primask::read().is_active();
        if engage && was_active {
            cortex_m::interrupt::disable();
        }
        IrqMask {
            engaged: engage,
            was_active,
        }
    }
}

impl Drop for IrqMask {
    fn drop(&mut self) {
        if self.engaged && self.was_active {
            // Safety: we are undoing our own disable.
            unsafe { cortex_m::interrupt::enable() }
        }
    }
}

/// Where the trap assembly finds the current task's `SavedState`.
/// Startup points this at the chosen task before dropping to Thread mode.
#[no_mangle]
static mut CURRENT_TASK_SAVE: *mut SavedState = core::ptr::null_mut();

/// Retargets the trap save area. Caller must ensure the pointee outlives
/// the next trap.
pub unsafe fn set_current_save(save: *mut SavedState) {
    CURRENT_TASK_SAVE = save;
}

// Trap entries. Each saves the callee-saved half into the current task's
// SavedState, runs the Rust handler (provided by startup), and restores
// whatever SavedState the handler left current.
global_asm!(
    "
    .section .text.traps
    .balign 4

    .global SVCall
    .thumb_func
    SVCall:
        ldr r0, =CURRENT_TASK_SAVE
        ldr r0, [r0]
        mrs r1, PSP
        stm r0!, {{r4-r11}}
        stm r0!, {{r1, lr}}
        bl svcall_entry
        b .Lrestore

    .global SysTick
    .thumb_func
    SysTick:
        ldr r0, =CURRENT_TASK_SAVE
        ldr r0, [r0]
        mrs r1, PSP
        stm r0!, {{r4-r11}}
        stm r0!, {{r1, lr}}
        bl systick_entry
        b .Lrestore

    .global PendSV
    .thumb_func
    PendSV:
        ldr r0, =CURRENT_TASK_SAVE
        ldr r0, [r0]
        mrs r1, PSP
        stm r0!, {{r4-r11}}
        stm r0!, {{r1, lr}}
        bl pendsv_entry

    .Lrestore:
        ldr r0, =CURRENT_TASK_SAVE
        ldr r0, [r0]
        ldm r0!, {{r4-r11}}
        ldm r0!, {{r1, r2}}
        msr PSP, r1
        mov lr, r2
        bx lr
    "
);

extern "C" {
    // Rust-side trap bodies, provided by startup.
    fn svcall_entry();
    fn systick_entry();
    fn pendsv_entry();
}
