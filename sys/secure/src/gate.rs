// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The non-secure-callable boundary.
//!
//! On hardware each entry point here sits behind a secure-gateway veneer
//! (`SG` + `cmse_nonsecure_entry`); the non-secure kernel reaches the
//! authority only through these. The veneers themselves are target
//! assembly glue in the build's secure image; this module holds the
//! dispatch and validation logic they land in, which is exactly the code
//! host tests call directly.
//!
//! Two rules hold at this boundary. First, no address-typed argument is
//! used before it is checked against the non-secure address window; a
//! caller handing us a secure-side address gets a refusal, not a
//! dereference. Second, nothing that crosses here is a reference into
//! secure state; results are plain values.

use abi::{ChownReq, MapFlags, MmapReq, SecureReq, Sysret, EACCES, EINVAL, ENOSYS};

use crate::mempool::Extent;
use crate::task::Authority;

/// Gate state: the authority plus the non-secure address window used to
/// vet incoming addresses.
pub struct Gate {
    auth: Authority,
    ns: Extent,
    rng: u32,
}

impl Gate {
    /// `ns_base`/`ns_size` describe the non-secure-addressable RAM
    /// window; the pool managed by the authority must lie inside it.
    /// `seed` feeds the random service.
    pub fn new(pool_base: u32, pool_size: u32, ns: Extent, seed: u32) -> Self {
        Gate {
            auth: Authority::new(pool_base, pool_size),
            ns,
            rng: seed | 1,
        }
    }

    /// Direct access for the kernel-side test harness.
    pub fn authority(&mut self) -> &mut Authority {
        &mut self.auth
    }

    fn vet(&self, addr: u32) -> Result<(), Sysret> {
        if self.ns.contains(addr) {
            Ok(())
        } else {
            Err(EACCES)
        }
    }

    /// Register-level entry: the veneer passes the request selector and
    /// up to three argument words straight from the caller's registers.
    ///
    /// Success values are non-negative (a base address in the positive
    /// half of the address space, a boolean, or zero); failures are
    /// negative status codes, never a trap back into the caller.
    pub fn dispatch(&mut self, req: SecureReq, args: [u32; 3]) -> Sysret {
        match self.run(req, args) {
            Ok(v) => v,
            Err(e) => e,
        }
    }

    fn run(&mut self, req: SecureReq, args: [u32; 3]) -> Result<Sysret, Sysret> {
        match req {
            SecureReq::Mmap => {
                let r: MmapReq = zerocopy::transmute!(args);
                let base = self.auth.mmap(
                    r.size,
                    r.task,
                    MapFlags::from_bits_truncate(r.flags),
                )?;
                Ok(base as Sysret)
            }
            SecureReq::Munmap => {
                self.vet(args[0])?;
                self.auth.munmap(args[0], args[1] as u16)?;
                Ok(0)
            }
            SecureReq::MmapStack => {
                let base = self.auth.mmap_stack(args[0], args[1] as u16)?;
                Ok(base as Sysret)
            }
            SecureReq::SwapStack => {
                self.auth.swap_stack(args[0] as u16, args[1] as u16)?;
                Ok(0)
            }
            SecureReq::Chown => {
                let r: ChownReq = zerocopy::transmute!([args[0], args[1]]);
                self.vet(r.base)?;
                self.auth.chown(r.base, r.new_owner, r.caller)?;
                Ok(0)
            }
            SecureReq::Owner => {
                if self.vet(args[0]).is_err() {
                    return Ok(0);
                }
                Ok(Sysret::from(self.auth.owner(args[0], args[1] as u16)))
            }
            SecureReq::Random => Ok(self.random() as Sysret),
            SecureReq::Retire => {
                self.auth.retire(args[0] as u16)?;
                Ok(0)
            }
            SecureReq::FlashWrite => {
                self.vet(args[1])?;
                if args[0] == 0 {
                    return Err(EINVAL);
                }
                // Flash programming belongs to the secure image's driver
                // layer, outside this crate.
                Err(ENOSYS)
            }
        }
    }

    /// xorshift32. A stand-in on the host; the secure image wires this
    /// to the TRNG.
    fn random(&mut self) -> u32 {
        let mut x = self.rng;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.rng = x;
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> Gate {
        let ns = Extent {
            base: 0x2000_0000,
            size: 0x10_0000,
        };
        Gate::new(0x2004_0000, 0x1_0000, ns, 0xDEAD_BEEF)
    }

    #[test]
    fn secure_address_refused() {
        let mut g = gate();
        let sp = g.dispatch(SecureReq::MmapStack, [0x400, 1, 0]);
        assert!(sp > 0);
        // An address outside the non-secure window never reaches the
        // authority.
        assert_eq!(
            g.dispatch(SecureReq::Munmap, [0xF000_0000, 1, 0]),
            EACCES
        );
        assert_eq!(g.dispatch(SecureReq::Owner, [0xF000_0000, 1, 0]), 0);
    }

    #[test]
    fn mmap_args_cross_as_pod() {
        let mut g = gate();
        g.dispatch(SecureReq::MmapStack, [0x400, 6, 0]);
        let req = MmapReq {
            size: 0x100,
            task: 6,
            _pad: 0,
            flags: MapFlags::NEW_EXTENT.bits(),
        };
        let words: [u32; 3] = zerocopy::transmute!(req);
        let base = g.dispatch(SecureReq::Mmap, words);
        assert!(base > 0);
        assert_eq!(g.dispatch(SecureReq::Owner, [base as u32, 6, 0]), 1);
    }

    #[test]
    fn chown_via_gate() {
        let mut g = gate();
        g.dispatch(SecureReq::MmapStack, [0x400, 1, 0]);
        g.dispatch(SecureReq::MmapStack, [0x400, 2, 0]);
        let req = MmapReq {
            size: 0x100,
            task: 1,
            _pad: 0,
            flags: MapFlags::NEW_EXTENT.bits(),
        };
        let words: [u32; 3] = zerocopy::transmute!(req);
        let base = g.dispatch(SecureReq::Mmap, words) as u32;
        let ch = ChownReq {
            base,
            new_owner: 2,
            caller: 1,
        };
        let w: [u32; 2] = zerocopy::transmute!(ch);
        assert_eq!(g.dispatch(SecureReq::Chown, [w[0], w[1], 0]), 0);
        assert_eq!(g.dispatch(SecureReq::Owner, [base, 2, 0]), 1);
        assert_eq!(g.dispatch(SecureReq::Owner, [base, 1, 0]), 0);
    }

    #[test]
    fn random_changes_and_flash_is_stubbed() {
        let mut g = gate();
        let a = g.dispatch(SecureReq::Random, [0; 3]);
        let b = g.dispatch(SecureReq::Random, [0; 3]);
        assert_ne!(a, b);
        assert_eq!(
            g.dispatch(SecureReq::FlashWrite, [1, 0x2000_0000, 0]),
            ENOSYS
        );
    }
}
