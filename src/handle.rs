// Copyright 2026 The skein Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The handle table: small integer-like names for every runtime object,
//! backed by a slab arena with per-slot generations so a stale handle is
//! caught instead of reaching a recycled object.

use log::warn;
use slab::Slab;

use crate::error::{Error, Result};
use crate::runtime::{BundleId, ChanId, CoroId, Runtime};
use crate::sock::Sock;

/// A name for a runtime object: coroutine, bundle, channel endpoint or
/// socket. Plain data; copying it does not duplicate the reference.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Handle {
    pub(crate) slot: u32,
    pub(crate) gen: u32,
}

impl Handle {
    pub(crate) fn to_bits(self) -> u64 {
        (self.slot as u64) << 32 | self.gen as u64
    }

    pub(crate) fn from_bits(bits: u64) -> Handle {
        Handle { slot: (bits >> 32) as u32, gen: bits as u32 }
    }
}

pub(crate) enum Object {
    Coro(CoroId),
    Bundle(BundleId),
    Chan(ChanId),
    Sock(Box<dyn Sock>),
}

pub(crate) struct HEntry {
    gen: u32,
    pub(crate) owner: bool,
    /// Set when the handle was closed while a socket operation was in
    /// flight; the teardown happens when the operation checks back in.
    closing: bool,
    /// `None` while a socket operation has the object checked out.
    pub(crate) obj: Option<Object>,
}

pub(crate) struct HandleTable {
    slab: Slab<HEntry>,
    gen: u32,
}

impl HandleTable {
    pub fn new() -> HandleTable {
        HandleTable { slab: Slab::new(), gen: 0 }
    }

    pub fn insert(&mut self, obj: Object, owner: bool) -> Handle {
        self.gen += 1;
        let gen = self.gen;
        let slot = self.slab.insert(HEntry { gen, owner, closing: false, obj: Some(obj) }) as u32;
        Handle { slot, gen }
    }

    pub fn get(&self, h: Handle) -> Result<&HEntry> {
        self.slab
            .get(h.slot as usize)
            .filter(|e| e.gen == h.gen)
            .ok_or(Error::BadHandle)
    }

    pub fn get_mut(&mut self, h: Handle) -> Result<&mut HEntry> {
        self.slab
            .get_mut(h.slot as usize)
            .filter(|e| e.gen == h.gen)
            .ok_or(Error::BadHandle)
    }

    pub fn remove(&mut self, h: Handle) -> Result<HEntry> {
        self.get(h)?;
        Ok(self.slab.remove(h.slot as usize))
    }
}

impl Runtime {
    /// Transfer ownership: the old handle stops working, the new handle
    /// names the same object.
    pub(crate) fn hown(&mut self, h: Handle) -> Result<Handle> {
        if self.table.get(h)?.obj.is_none() {
            return Err(Error::Busy);
        }
        let entry = self.table.remove(h)?;
        Ok(self.table.insert(entry.obj.unwrap(), entry.owner))
    }

    /// Drop one reference to an object; the owner reference destroys it.
    pub(crate) fn hclose(&mut self, h: Handle) -> Result<()> {
        {
            let e = self.table.get(h)?;
            if e.obj.is_none() {
                // A socket operation is in flight on another coroutine.
                warn!("handle {}: closed mid-operation, teardown deferred", h.slot);
                self.table.get_mut(h)?.closing = true;
                return Ok(());
            }
            // Refuse a coroutine closing its own owner handle; the wait
            // for termination could never finish.
            if let Some(Object::Coro(id)) = &e.obj {
                if e.owner && *id == self.current {
                    return Err(Error::InvalidArgument);
                }
            }
        }
        let entry = self.table.remove(h)?;
        match entry.obj.unwrap() {
            Object::Coro(id) => {
                if entry.owner {
                    self.coro_close(id)?;
                }
            }
            Object::Bundle(id) => {
                if entry.owner {
                    self.bundle_close(id);
                }
            }
            Object::Chan(id) => self.chan_unref(id),
            Object::Sock(mut s) => s.close(),
        }
        Ok(())
    }

    /// Borrow a socket out of the table for the duration of one blocking
    /// operation. A second concurrent operation finds the slot empty and
    /// fails with `Busy`.
    pub(crate) fn checkout_sock(&mut self, h: Handle) -> Result<Box<dyn Sock>> {
        let e = self.table.get_mut(h)?;
        if e.obj.is_none() {
            return Err(Error::Busy);
        }
        if !matches!(&e.obj, Some(Object::Sock(_))) {
            return Err(Error::NotSupported);
        }
        match e.obj.take() {
            Some(Object::Sock(s)) => Ok(s),
            _ => unreachable!(),
        }
    }

    pub(crate) fn checkin_sock(&mut self, h: Handle, mut s: Box<dyn Sock>) {
        let closing = match self.table.get(h) {
            Ok(e) => e.closing,
            // The entry itself cannot vanish while checked out, but be
            // lenient and tear the socket down if it somehow did.
            Err(_) => true,
        };
        if closing {
            let _ = self.table.remove(h);
            s.close();
        } else if let Ok(e) = self.table.get_mut(h) {
            e.obj = Some(Object::Sock(s));
        }
    }

    /// Consume a checked-out socket's table entry (detach committed).
    pub(crate) fn discard_sock_entry(&mut self, h: Handle) {
        let _ = self.table.remove(h);
    }

    /// Take a socket out of the table entirely, invalidating the handle.
    /// Used by `*_attach` to assume ownership of the underlier.
    pub(crate) fn take_sock(&mut self, h: Handle) -> Result<Box<dyn Sock>> {
        {
            let e = self.table.get(h)?;
            match &e.obj {
                None => return Err(Error::Busy),
                Some(Object::Sock(_)) => {}
                Some(_) => return Err(Error::NotSupported),
            }
        }
        let entry = self.table.remove(h)?;
        match entry.obj.unwrap() {
            Object::Sock(s) => Ok(s),
            _ => unreachable!(),
        }
    }

    pub(crate) fn insert_sock(&mut self, s: Box<dyn Sock>) -> Handle {
        self.table.insert(Object::Sock(s), true)
    }
}
