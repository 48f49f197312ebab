// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The module operation-table contract.
//!
//! Drivers and filesystems are external collaborators; the kernel sees
//! them only as a registered table of optional function pointers keyed by
//! a small module index, plus opaque file-node ids (`fno`) that the module
//! mints and interprets. Any unset entry reports `ENOSYS`. Blocking I/O is
//! built on the syscall retry mechanism: a module's read/write returns
//! `EAGAIN` when it cannot progress, and the per-descriptor `progress`
//! field remembers bytes already transferred across replays, so partial
//! I/O is never lost to a restarted handler.
//!
//! The flash-backed file store behind some modules persists each file as
//! one or more fixed-size flash pages: page 0 carries a header (name
//! length, content length), the file name, then content; continuation
//! pages carry a shorter synthetic header; the partition's reserved final
//! page holds an inverted-logic allocation bitmap (bit clear = page
//! allocated) rewritten via erase/reprogram on every allocation change.
//! None of that layout is interpreted here; it is the collaborator's
//! contract.

use abi::{Sysret, ENOSYS};

use crate::limits::MAX_MODULES;

/// Opaque file-node id, minted by a module.
pub type Fno = u32;

pub type OpenFn = fn(path: &[u8], flags: u32) -> Result<Fno, Sysret>;
pub type CloseFn = fn(fno: Fno) -> Sysret;
pub type ReadFn = fn(fno: Fno, buf: &mut [u8], pos: u32) -> Sysret;
pub type WriteFn = fn(fno: Fno, buf: &[u8], pos: u32) -> Sysret;
pub type SeekFn = fn(fno: Fno, offset: i32, whence: i32) -> Sysret;
/// Poll: given an interest mask, reports via the out-parameter which
/// events are currently satisfied and returns whether any are.
pub type PollFn = fn(fno: Fno, interest: u16, revents: &mut u16) -> bool;
pub type IoctlFn = fn(fno: Fno, cmd: u32, arg: u32) -> Sysret;
pub type CreatFn = fn(path: &[u8]) -> Result<Fno, Sysret>;
pub type UnlinkFn = fn(path: &[u8]) -> Sysret;
pub type TruncateFn = fn(fno: Fno, len: u32) -> Sysret;
pub type MountFn = fn(source: &[u8], target: &[u8], flags: u32) -> Sysret;
pub type SockFn = fn(fno: Fno, addr: u32, len: u32) -> Sysret;
pub type SendRecvFn = fn(fno: Fno, buf: u32, len: u32, flags: u32) -> Sysret;
pub type SockOptFn =
    fn(fno: Fno, level: u32, name: u32, value: u32, len: u32) -> Sysret;
pub type ListenFn = fn(fno: Fno, backlog: u32) -> Sysret;
pub type TtyAttachFn = fn(fno: Fno, pid: u16) -> Sysret;

/// A module's capability table. Every entry is optional; the dispatch
/// helpers below turn an unset entry into `ENOSYS`.
#[derive(Copy, Clone, Default)]
pub struct ModuleOps {
    pub open: Option<OpenFn>,
    pub close: Option<CloseFn>,
    pub read: Option<ReadFn>,
    pub write: Option<WriteFn>,
    pub seek: Option<SeekFn>,
    pub poll: Option<PollFn>,
    pub ioctl: Option<IoctlFn>,
    pub creat: Option<CreatFn>,
    pub unlink: Option<UnlinkFn>,
    pub truncate: Option<TruncateFn>,
    pub mount: Option<MountFn>,
    pub bind: Option<SockFn>,
    pub connect: Option<SockFn>,
    pub accept: Option<SockFn>,
    pub listen: Option<ListenFn>,
    pub send: Option<SendRecvFn>,
    pub recv: Option<SendRecvFn>,
    pub setsockopt: Option<SockOptFn>,
    pub getsockopt: Option<SockOptFn>,
    pub tty_attach: Option<TtyAttachFn>,
}

/// One open descriptor. `pos` is the seek position; `progress` counts
/// bytes already transferred by a blocking transfer in flight, surviving
/// syscall replays.
#[derive(Copy, Clone, Debug)]
pub struct FileDesc {
    pub module: usize,
    pub fno: Fno,
    pub flags: u32,
    pub pos: u32,
    pub progress: u32,
}

pub struct Module {
    pub name: &'static str,
    pub ops: ModuleOps,
}

/// The registry. Module indices are stable for the life of the system;
/// module teardown is not supported.
pub struct Vfs {
    modules: [Option<Module>; MAX_MODULES],
}

impl Vfs {
    pub const fn new() -> Self {
        const EMPTY: Option<Module> = None;
        Vfs {
            modules: [EMPTY; MAX_MODULES],
        }
    }

    pub fn register(&mut self, module: Module) -> Result<usize, Sysret> {
        let i = self
            .modules
            .iter()
            .position(|m| m.is_none())
            .ok_or(abi::ENOSPC)?;
        self.modules[i] = Some(module);
        Ok(i)
    }

    /// Module removal has no sound teardown story for in-flight
    /// descriptors and is reported as unsupported.
    pub fn unregister(&mut self, _index: usize) -> Sysret {
        ENOSYS
    }

    pub fn module(&self, i: usize) -> Option<&Module> {
        self.modules.get(i).and_then(|m| m.as_ref())
    }

    fn ops(&self, i: usize) -> Result<&ModuleOps, Sysret> {
        self.module(i).map(|m| &m.ops).ok_or(ENOSYS)
    }

    // Dispatch helpers. Each maps an unset entry to ENOSYS.

    /// Position bookkeeping stays with the caller: the syscall layer
    /// tracks progress across replays and advances `pos` once the whole
    /// transfer completes.
    pub fn read(&self, fd: &FileDesc, buf: &mut [u8], pos: u32) -> Sysret {
        match self.ops(fd.module).map(|o| o.read) {
            Ok(Some(f)) => f(fd.fno, buf, pos),
            _ => ENOSYS,
        }
    }

    pub fn write(&self, fd: &FileDesc, buf: &[u8], pos: u32) -> Sysret {
        match self.ops(fd.module).map(|o| o.write) {
            Ok(Some(f)) => f(fd.fno, buf, pos),
            _ => ENOSYS,
        }
    }

    pub fn seek(&self, fd: &FileDesc, offset: i32, whence: i32) -> Sysret {
        match self.ops(fd.module).map(|o| o.seek) {
            Ok(Some(f)) => f(fd.fno, offset, whence),
            _ => ENOSYS,
        }
    }

    pub fn ioctl(&self, fd: &FileDesc, cmd: u32, arg: u32) -> Sysret {
        match self.ops(fd.module).map(|o| o.ioctl) {
            Ok(Some(f)) => f(fd.fno, cmd, arg),
            _ => ENOSYS,
        }
    }

    pub fn close(&self, fd: &FileDesc) -> Sysret {
        match self.ops(fd.module).map(|o| o.close) {
            Ok(Some(f)) => f(fd.fno),
            _ => ENOSYS,
        }
    }

    /// Poll one descriptor. Unset poll reports no satisfiable interest.
    pub fn poll(
        &self,
        fd: &FileDesc,
        interest: u16,
        revents: &mut u16,
    ) -> bool {
        match self.ops(fd.module).map(|o| o.poll) {
            Ok(Some(f)) => f(fd.fno, interest, revents),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::POLLIN;

    fn null_module() -> Module {
        Module {
            name: "null",
            ops: ModuleOps::default(),
        }
    }

    fn echo_read(_fno: Fno, buf: &mut [u8], _pos: u32) -> Sysret {
        for b in buf.iter_mut() {
            *b = b'x';
        }
        buf.len() as Sysret
    }

    fn ready_poll(_fno: Fno, interest: u16, revents: &mut u16) -> bool {
        *revents = interest & POLLIN;
        *revents != 0
    }

    fn fd(module: usize) -> FileDesc {
        FileDesc {
            module,
            fno: 7,
            flags: 0,
            pos: 0,
            progress: 0,
        }
    }

    #[test]
    fn unset_entry_reports_enosys() {
        let mut vfs = Vfs::new();
        let m = vfs.register(null_module()).unwrap();
        let d = fd(m);
        assert_eq!(vfs.read(&d, &mut [0; 4], 0), ENOSYS);
        assert_eq!(vfs.seek(&d, 0, abi::SEEK_SET), ENOSYS);
        assert_eq!(vfs.unregister(m), ENOSYS);
    }

    #[test]
    fn read_dispatches_to_the_module() {
        let mut vfs = Vfs::new();
        let m = vfs
            .register(Module {
                name: "echo",
                ops: ModuleOps {
                    read: Some(echo_read),
                    ..ModuleOps::default()
                },
            })
            .unwrap();
        let d = fd(m);
        let mut buf = [0u8; 8];
        assert_eq!(vfs.read(&d, &mut buf, 0), 8);
        assert_eq!(buf, [b'x'; 8]);
    }

    #[test]
    fn poll_reports_satisfied_interest() {
        let mut vfs = Vfs::new();
        let m = vfs
            .register(Module {
                name: "tty",
                ops: ModuleOps {
                    poll: Some(ready_poll),
                    ..ModuleOps::default()
                },
            })
            .unwrap();
        let d = fd(m);
        let mut revents = 0;
        assert!(vfs.poll(&d, POLLIN, &mut revents));
        assert_eq!(revents, POLLIN);
    }
}
