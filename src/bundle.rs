// Copyright 2026 The skein Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Bundles: groups of coroutines sharing one lifetime. Closing the
//! bundle cancels every member and waits for each to unwind.

use log::trace;

use crate::coroutine::Owner;
use crate::error::{Error, Result};
use crate::handle::Object;
use crate::runtime::{BundleId, CoroId, Runtime, Wake, WaitSet};
use crate::stack::DEFAULT_STACK_SIZE;
use crate::Handle;

pub(crate) struct Bundle {
    pub(crate) gen: u32,
    members: Vec<CoroId>,
    /// At most one coroutine may wait on a bundle at a time.
    pub(crate) waiter: Option<CoroId>,
}

impl Runtime {
    pub(crate) fn bundle_make(&mut self) -> Handle {
        let gen = self.fresh_gen();
        let slot = self.bundles.insert(Bundle { gen, members: Vec::new(), waiter: None }) as u32;
        trace!("bundle {}: created", slot);
        self.table.insert(Object::Bundle(BundleId { slot, gen }), true)
    }

    fn bundle_resolve(&self, h: Handle) -> Result<BundleId> {
        match &self.table.get(h)?.obj {
            Some(Object::Bundle(id)) => Ok(*id),
            _ => Err(Error::BadHandle),
        }
    }

    pub(crate) fn bundle_get_mut(&mut self, id: BundleId) -> Option<&mut Bundle> {
        self.bundles.get_mut(id.slot as usize).filter(|b| b.gen == id.gen)
    }

    pub(crate) fn bundle_add_member(&mut self, id: BundleId, m: CoroId) {
        if let Some(b) = self.bundle_get_mut(id) {
            b.members.push(m);
        }
    }

    /// Called from the epilogue of a member: leave the bundle and, if it
    /// was the last one out, release the waiter.
    pub(crate) fn bundle_drop_member(&mut self, id: BundleId, m: CoroId) {
        let waiter = match self.bundle_get_mut(id) {
            Some(b) => {
                b.members.retain(|&x| x != m);
                if b.members.is_empty() {
                    b.waiter.take()
                } else {
                    None
                }
            }
            None => None,
        };
        if let Some(w) = waiter {
            self.wake(w, Wake::Ready);
        }
    }

    /// Launch a member. The bundle owns the coroutine; the returned
    /// handle is only a reference to it.
    pub(crate) fn bundle_go(&mut self, h: Handle, f: Box<dyn FnOnce()>) -> Result<Handle> {
        let b = self.bundle_resolve(h)?;
        let stack = self.stacks.take(DEFAULT_STACK_SIZE)?;
        let id = self.spawn(f, stack, Owner::Bundle(b))?;
        Ok(self.table.insert(Object::Coro(id), false))
    }

    pub(crate) fn bundle_wait(&mut self, h: Handle, deadline: i64) -> Result<()> {
        self.check_cancel()?;
        let b = self.bundle_resolve(h)?;
        loop {
            let rec = self.bundle_get_mut(b).ok_or(Error::BadHandle)?;
            if rec.members.is_empty() {
                return Ok(());
            }
            if deadline == 0 {
                return Err(Error::TimedOut);
            }
            if rec.waiter.is_some() {
                return Err(Error::Busy);
            }
            let me = self.current;
            self.bundle_get_mut(b).unwrap().waiter = Some(me);
            match self.suspend(WaitSet::Bundle(b), deadline) {
                Wake::Ready => continue,
                Wake::Timeout => return Err(Error::TimedOut),
                Wake::Canceled => return Err(Error::Canceled),
                w => unreachable!("bundle_wait woken with {:?}", w),
            }
        }
    }

    /// Owner-close: cancel all members, wait for every one of them, then
    /// drop the group. Runs to completion even if the closer itself got
    /// canceled meanwhile.
    pub(crate) fn bundle_close(&mut self, id: BundleId) {
        let members = match self.bundle_get_mut(id) {
            Some(b) => b.members.clone(),
            None => return,
        };
        trace!("bundle {}: closing, canceling {} members", id.slot, members.len());
        for m in members {
            self.cancel(m);
        }
        loop {
            let rec = match self.bundle_get_mut(id) {
                Some(b) => b,
                None => return,
            };
            if rec.members.is_empty() {
                break;
            }
            // A bystander stuck in bundle_wait would never see the group
            // die; evict it with the close.
            if let Some(w) = rec.waiter.take() {
                self.wake(w, Wake::Canceled);
            }
            let me = self.current;
            self.bundle_get_mut(id).unwrap().waiter = Some(me);
            self.suspend(WaitSet::Bundle(id), -1);
        }
        self.bundles.remove(id.slot as usize);
        trace!("bundle {}: destroyed", id.slot);
    }
}
