// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel-side view of the secure memory authority.
//!
//! All stack and heap backing comes from the secure world; the kernel never
//! touches an allocator of its own. This module defines the trait the rest
//! of the kernel programs against and the implementation that crosses the
//! TrustZone gate on hardware. Host tests substitute the real secure crate
//! behind the same trait, so the ownership semantics under test are the
//! ones that ship.

use abi::{MapFlags, Sysret};

/// The cross-domain memory contract. One implementor per world: the veneer
/// caller on the target, the in-process secure crate in tests.
pub trait MemoryAuthority {
    /// Heap allocation for `task`; returns the base address.
    fn mmap(&mut self, size: u32, task: u16, flags: MapFlags)
        -> Result<u32, Sysret>;
    /// Frees the extent based at `ptr`.
    fn munmap(&mut self, ptr: u32, task: u16) -> Result<(), Sysret>;
    /// Allocates (or replaces) the task's stack; returns the base.
    fn mmap_stack(&mut self, size: u32, task: u16) -> Result<u32, Sysret>;
    /// Exchanges the stack records of two tasks.
    fn swap_stack(&mut self, a: u16, b: u16) -> Result<(), Sysret>;
    /// Moves the extent based at `ptr` from `caller` to `new_owner`.
    fn chown(&mut self, ptr: u32, new_owner: u16, caller: u16)
        -> Result<(), Sysret>;
    /// Does `ptr` name the base of one of the task's main/heap extents?
    fn owner(&mut self, ptr: u32, task: u16) -> bool;
    /// Entropy from the secure side.
    fn random(&mut self) -> u32;
    /// Releases every extent the task still holds; called at teardown.
    fn retire(&mut self, task: u16) -> Result<(), Sysret>;
}

#[cfg(target_arch = "arm")]
pub use self::veneer::SecureGate;

/// On hardware, every trait method funnels into the secure image's
/// non-secure-callable dispatch veneer. Arguments are plain words; the
/// multiword requests use the POD layouts from `abi`.
#[cfg(target_arch = "arm")]
mod veneer {
    use super::MemoryAuthority;
    use abi::{ChownReq, MapFlags, MmapReq, SecureReq, Sysret, EINVAL};

    extern "C" {
        /// Secure gateway entry, provided by the secure image's import
        /// library at link time.
        fn __secure_dispatch(req: u32, a0: u32, a1: u32, a2: u32) -> i32;
    }

    pub struct SecureGate;

    fn call(req: SecureReq, args: [u32; 3]) -> Sysret {
        // Safety: the veneer is a hardware-enforced gate; by contract it
        // accepts any argument words and returns a status.
        unsafe { __secure_dispatch(req as u32, args[0], args[1], args[2]) }
    }

    fn status(r: Sysret) -> Result<(), Sysret> {
        if r < 0 {
            Err(r)
        } else {
            Ok(())
        }
    }

    fn address(r: Sysret) -> Result<u32, Sysret> {
        if r < 0 {
            Err(r)
        } else if r == 0 {
            Err(EINVAL)
        } else {
            Ok(r as u32)
        }
    }

    impl MemoryAuthority for SecureGate {
        fn mmap(
            &mut self,
            size: u32,
            task: u16,
            flags: MapFlags,
        ) -> Result<u32, Sysret> {
            let req = MmapReq {
                size,
                task,
                _pad: 0,
                flags: flags.bits(),
            };
            address(call(SecureReq::Mmap, zerocopy::transmute!(req)))
        }

        fn munmap(&mut self, ptr: u32, task: u16) -> Result<(), Sysret> {
            status(call(SecureReq::Munmap, [ptr, u32::from(task), 0]))
        }

        fn mmap_stack(&mut self, size: u32, task: u16) -> Result<u32, Sysret> {
            address(call(SecureReq::MmapStack, [size, u32::from(task), 0]))
        }

        fn swap_stack(&mut self, a: u16, b: u16) -> Result<(), Sysret> {
            status(call(SecureReq::SwapStack, [u32::from(a), u32::from(b), 0]))
        }

        fn chown(
            &mut self,
            ptr: u32,
            new_owner: u16,
            caller: u16,
        ) -> Result<(), Sysret> {
            let req = ChownReq {
                base: ptr,
                new_owner,
                caller,
            };
            let w: [u32; 2] = zerocopy::transmute!(req);
            status(call(SecureReq::Chown, [w[0], w[1], 0]))
        }

        fn owner(&mut self, ptr: u32, task: u16) -> bool {
            call(SecureReq::Owner, [ptr, u32::from(task), 0]) == 1
        }

        fn random(&mut self) -> u32 {
            call(SecureReq::Random, [0; 3]) as u32
        }

        fn retire(&mut self, task: u16) -> Result<(), Sysret> {
            status(call(SecureReq::Retire, [u32::from(task), 0, 0]))
        }
    }
}

/// Host tests run the kernel against the real secure-world logic, crossing
/// its register-level dispatch just like the veneer does.
#[cfg(test)]
mod host {
    use super::MemoryAuthority;
    use abi::{ChownReq, MapFlags, MmapReq, SecureReq, Sysret, EINVAL};

    impl MemoryAuthority for secure::gate::Gate {
        fn mmap(
            &mut self,
            size: u32,
            task: u16,
            flags: MapFlags,
        ) -> Result<u32, Sysret> {
            let req = MmapReq {
                size,
                task,
                _pad: 0,
                flags: flags.bits(),
            };
            let r = self.dispatch(SecureReq::Mmap, zerocopy::transmute!(req));
            if r <= 0 {
                Err(if r == 0 { EINVAL } else { r })
            } else {
                Ok(r as u32)
            }
        }

        fn munmap(&mut self, ptr: u32, task: u16) -> Result<(), Sysret> {
            match self.dispatch(SecureReq::Munmap, [ptr, u32::from(task), 0]) {
                0 => Ok(()),
                e => Err(e),
            }
        }

        fn mmap_stack(&mut self, size: u32, task: u16) -> Result<u32, Sysret> {
            let r = self
                .dispatch(SecureReq::MmapStack, [size, u32::from(task), 0]);
            if r <= 0 {
                Err(if r == 0 { EINVAL } else { r })
            } else {
                Ok(r as u32)
            }
        }

        fn swap_stack(&mut self, a: u16, b: u16) -> Result<(), Sysret> {
            match self
                .dispatch(SecureReq::SwapStack, [u32::from(a), u32::from(b), 0])
            {
                0 => Ok(()),
                e => Err(e),
            }
        }

        fn chown(
            &mut self,
            ptr: u32,
            new_owner: u16,
            caller: u16,
        ) -> Result<(), Sysret> {
            let req = ChownReq {
                base: ptr,
                new_owner,
                caller,
            };
            let w: [u32; 2] = zerocopy::transmute!(req);
            match self.dispatch(SecureReq::Chown, [w[0], w[1], 0]) {
                0 => Ok(()),
                e => Err(e),
            }
        }

        fn owner(&mut self, ptr: u32, task: u16) -> bool {
            self.dispatch(SecureReq::Owner, [ptr, u32::from(task), 0]) == 1
        }

        fn random(&mut self) -> u32 {
            self.dispatch(SecureReq::Random, [0; 3]) as u32
        }

        fn retire(&mut self, task: u16) -> Result<(), Sysret> {
            match self.dispatch(SecureReq::Retire, [u32::from(task), 0, 0]) {
                0 => Ok(()),
                e => Err(e),
            }
        }
    }
}
