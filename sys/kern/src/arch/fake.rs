// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Stand-in architecture for host builds.
//!
//! `SavedState` is a plain record instead of an exception frame, and user
//! memory is a per-thread RAM window covering the same addresses the
//! secure pool hands out, so the whole syscall surface (including
//! buffer-moving calls) runs under the ordinary test harness.

use abi::{ExecInfo, Signal, SYSCALL_ARGS};

use crate::task::ArchState;

/// Where a task ends up if its entry function returns.
pub const TASK_RETURN_STUB: u32 = 0x0800_0020;

/// Return path spliced under signal handlers; the real one issues the
/// sigreturn trap.
pub const SIGNAL_RETURN_STUB: u32 = 0x0800_0040;

#[derive(Clone, Debug, Default)]
pub struct SavedState {
    nr: u32,
    args: [u32; SYSCALL_ARGS],
    ret: u32,
    sp: u32,
    pc: u32,
    lr: u32,
    got: u32,
}

impl SavedState {
    /// Test hook: stages a trap as if the task had issued this syscall.
    pub fn load_syscall(&mut self, nr: u32, args: [u32; SYSCALL_ARGS]) {
        self.nr = nr;
        self.args = args;
    }
}

impl ArchState for SavedState {
    fn syscall_number(&self) -> u32 {
        self.nr
    }

    fn args(&self) -> [u32; SYSCALL_ARGS] {
        self.args
    }

    fn set_return(&mut self, v: u32) {
        self.ret = v;
    }

    fn return_slot(&self) -> u32 {
        self.ret
    }

    fn stack_pointer(&self) -> u32 {
        self.sp
    }

    fn set_stack_pointer(&mut self, sp: u32) {
        self.sp = sp;
    }

    fn pc(&self) -> u32 {
        self.pc
    }

    fn set_pc(&mut self, pc: u32) {
        self.pc = pc;
    }

    fn set_lr(&mut self, lr: u32) {
        self.lr = lr;
    }

    fn got_base(&self) -> u32 {
        self.got
    }

    fn set_got_base(&mut self, base: u32) {
        self.got = base;
    }
}

pub fn init_context(save: &mut SavedState, stack_top: u32, exec: &ExecInfo) {
    save.sp = stack_top;
    save.pc = exec.entry;
    save.lr = TASK_RETURN_STUB;
    save.got = exec.got_base;
}

pub fn push_signal_frame(save: &mut SavedState, handler: u32, sig: Signal) {
    save.set_return(sig.number());
    save.pc = handler;
    save.lr = SIGNAL_RETURN_STUB;
}

/// Host stand-in for the flash text window.
pub fn code_plausible(addr: u32) -> bool {
    addr > 0xFF
}

/// No MPU on the host.
pub fn apply_memory_protection(
    _stack_base: u32,
    _stack_size: u32,
    _exec: &ExecInfo,
) {
}

/// No interrupts to mask on the host.
pub struct IrqMask;

impl IrqMask {
    pub fn new(_engage: bool) -> Self {
        IrqMask
    }
}

#[cfg(test)]
mod ram {
    use std::cell::RefCell;

    pub const BASE: u32 = 0x2000_0000;
    pub const SIZE: usize = 0x10_0000;

    thread_local! {
        static WINDOW: RefCell<Vec<u8>> = RefCell::new(vec![0; SIZE]);
    }

    fn span(addr: u32, len: usize) -> Option<usize> {
        let off = addr.checked_sub(BASE)? as usize;
        if off + len <= SIZE {
            Some(off)
        } else {
            None
        }
    }

    pub fn read(src: u32, dst: &mut [u8]) {
        if let Some(off) = span(src, dst.len()) {
            WINDOW.with(|w| {
                dst.copy_from_slice(&w.borrow()[off..off + dst.len()]);
            });
        }
    }

    pub fn write(dst: u32, src: &[u8]) {
        if let Some(off) = span(dst, src.len()) {
            WINDOW.with(|w| {
                w.borrow_mut()[off..off + src.len()].copy_from_slice(src);
            });
        }
    }

    pub fn copy(dst: u32, src: u32, len: u32) {
        let len = len as usize;
        if let (Some(s), Some(d)) = (span(src, len), span(dst, len)) {
            WINDOW.with(|w| {
                w.borrow_mut().copy_within(s..s + len, d);
            });
        }
    }
}

#[cfg(test)]
pub fn read_user(src: u32, dst: &mut [u8]) {
    ram::read(src, dst);
}

#[cfg(test)]
pub fn write_user(dst: u32, src: &[u8]) {
    ram::write(dst, src);
}

#[cfg(test)]
pub fn copy_user(dst: u32, src: u32, len: u32) {
    ram::copy(dst, src, len);
}

// Outside the test harness there is no RAM window; the stubs keep
// non-target builds of the portable kernel checking cleanly.

#[cfg(not(test))]
pub fn read_user(_src: u32, _dst: &mut [u8]) {}

#[cfg(not(test))]
pub fn write_user(_dst: u32, _src: &[u8]) {}

#[cfg(not(test))]
pub fn copy_user(_dst: u32, _src: u32, _len: u32) {}

pub fn read_user_word(addr: u32) -> u32 {
    let mut b = [0u8; 4];
    read_user(addr, &mut b);
    u32::from_le_bytes(b)
}

pub fn write_user_word(addr: u32, v: u32) {
    write_user(addr, &v.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_window_round_trip() {
        write_user(0x2000_1000, &[1, 2, 3, 4]);
        let mut b = [0u8; 4];
        read_user(0x2000_1000, &mut b);
        assert_eq!(b, [1, 2, 3, 4]);

        copy_user(0x2000_2000, 0x2000_1000, 4);
        read_user(0x2000_2000, &mut b);
        assert_eq!(b, [1, 2, 3, 4]);

        write_user_word(0x2000_3000, 0xDEAD_BEEF);
        assert_eq!(read_user_word(0x2000_3000), 0xDEAD_BEEF);
    }

    #[test]
    fn out_of_window_access_is_ignored() {
        write_user(0x1000_0000, &[9; 4]);
        let mut b = [7u8; 4];
        read_user(0x1000_0000, &mut b);
        assert_eq!(b, [7; 4]);
    }
}
