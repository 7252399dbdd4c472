// Copyright 2026 The skein Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Coroutine records, the spawn prologue, the entry trampoline and the
//! epilogue. A coroutine is nothing more than a (saved context, stack)
//! pair plus the scheduler bookkeeping hanging off it.

use std::panic::{self, AssertUnwindSafe};

use context::{Context, Transfer};
use log::{error, trace};

use crate::error::Result;
use crate::handle::Object;
use crate::runtime::{BundleId, CoroId, Runtime, Wake, WaitSet};
use crate::stack::{Stack, DEFAULT_STACK_SIZE};
use crate::timer::TimerKey;
use crate::Handle;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Status {
    Ready,
    Running,
    Waiting,
    Finished,
}

/// Who destroys the coroutine: the owner handle in the table, or the
/// bundle it was launched into.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Owner {
    Table,
    Bundle(BundleId),
}

pub(crate) struct CoroRecord {
    pub(crate) gen: u32,
    pub(crate) stack: Option<Stack>,
    pub(crate) ctx: Option<Context>,
    pub(crate) entry: Option<Box<dyn FnOnce()>>,
    pub(crate) status: Status,
    pub(crate) canceled: bool,
    pub(crate) wake: Wake,
    pub(crate) waiting: WaitSet,
    pub(crate) timer: Option<TimerKey>,
    pub(crate) owner: Owner,
    /// A coroutine blocked in `hclose` waiting for this one to finish.
    pub(crate) closer: Option<CoroId>,
}

impl CoroRecord {
    /// The record for the thread itself. It runs on the thread's own
    /// stack and has a saved context only while suspended.
    pub(crate) fn main(gen: u32) -> CoroRecord {
        CoroRecord {
            gen,
            stack: None,
            ctx: None,
            entry: None,
            status: Status::Running,
            canceled: false,
            wake: Wake::Ready,
            waiting: WaitSet::None,
            timer: None,
            owner: Owner::Table,
            closer: None,
        }
    }

    #[inline]
    pub(crate) fn bundle_owned(&self) -> bool {
        matches!(self.owner, Owner::Bundle(_))
    }
}

extern "C" fn trampoline(t: Transfer) -> ! {
    let rt = Runtime::current();
    rt.postswitch(t);
    let me = rt.current;
    let f = rt.rec_mut(me).entry.take().expect("coroutine entry already taken");
    trace!("coroutine {}: started", me.slot);
    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!("coroutine {}: panicked", me.slot);
    }
    Runtime::current().epilogue()
}

impl Runtime {
    /// Prologue: install a new coroutine in the arena and put it at the
    /// tail of the ready queue. The caller keeps running.
    pub(crate) fn spawn(
        &mut self,
        f: Box<dyn FnOnce()>,
        stack: Stack,
        owner: Owner,
    ) -> Result<CoroId> {
        let ctx = unsafe { Context::new(stack.region(), trampoline) };
        let gen = self.fresh_gen();
        let slot = self.coros.insert(CoroRecord {
            gen,
            stack: Some(stack),
            ctx: Some(ctx),
            entry: Some(f),
            status: Status::Ready,
            canceled: false,
            wake: Wake::Ready,
            waiting: WaitSet::None,
            timer: None,
            owner,
            closer: None,
        }) as u32;
        let id = CoroId { slot, gen };
        if let Owner::Bundle(b) = owner {
            self.bundle_add_member(b, id);
        }
        trace!("coroutine {}: spawned", slot);
        self.ready.push_back(id);
        Ok(id)
    }

    /// Epilogue: mark the coroutine finished, notify whoever is waiting
    /// for it, and leave this stack for good. The stack itself is
    /// recycled by the next coroutine to run.
    pub(crate) fn epilogue(&mut self) -> ! {
        let me = self.current;
        trace!("coroutine {}: finished", me.slot);
        self.rec_mut(me).status = Status::Finished;
        if let Owner::Bundle(b) = self.rec(me).owner {
            self.bundle_drop_member(b, me);
        }
        if let Some(closer) = self.rec_mut(me).closer.take() {
            self.wake(closer, Wake::Ready);
        }
        loop {
            self.schedule_away();
        }
    }

    pub(crate) fn go(&mut self, f: Box<dyn FnOnce()>) -> Result<Handle> {
        let stack = self.stacks.take(DEFAULT_STACK_SIZE)?;
        self.go_with_stack(f, stack)
    }

    pub(crate) fn go_with_stack(&mut self, f: Box<dyn FnOnce()>, stack: Stack) -> Result<Handle> {
        let id = self.spawn(f, stack, Owner::Table)?;
        Ok(self.table.insert(Object::Coro(id), true))
    }

    /// Owner-close of a coroutine: cancel it, wait for it to finish, then
    /// reap the record. The wait always runs to completion; cancellation
    /// of the closer stays sticky but does not abort the teardown.
    pub(crate) fn coro_close(&mut self, id: CoroId) -> Result<()> {
        if self.coro_get(id).is_none() {
            // Already reaped; the handle was just a stale reference.
            return Ok(());
        }
        self.cancel(id);
        while !matches!(self.rec(id).status, Status::Finished) {
            debug_assert!(self.rec(id).closer.is_none());
            let me = self.current;
            self.rec_mut(id).closer = Some(me);
            self.suspend(WaitSet::Join(id), -1);
        }
        self.reap(id);
        Ok(())
    }

    pub(crate) fn reap(&mut self, id: CoroId) {
        debug_assert!(matches!(self.rec(id).status, Status::Finished));
        self.coros.remove(id.slot as usize);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use crate::timer::now;
    use crate::Error;

    #[test]
    fn runs_to_completion() {
        let done = Rc::new(Cell::new(false));
        let d = done.clone();
        let h = crate::go(move || d.set(true)).unwrap();
        crate::yield_now().unwrap();
        assert!(done.get());
        crate::hclose(h).unwrap();
    }

    #[test]
    fn close_cancels_a_sleeper() {
        let observed = Rc::new(Cell::new(None));
        let o = observed.clone();
        let h = crate::go(move || {
            o.set(Some(crate::msleep(now() + 10_000)));
        })
        .unwrap();
        // Let it reach the sleep first.
        crate::msleep(now() + 10).unwrap();
        let start = now();
        crate::hclose(h).unwrap();
        assert!(now() - start < 1_000);
        assert_eq!(observed.get(), Some(Err(Error::Canceled)));
    }

    #[test]
    fn cancellation_is_sticky() {
        let tally = Rc::new(Cell::new(0));
        let t = tally.clone();
        let h = crate::go(move || {
            if crate::msleep(now() + 10_000) == Err(Error::Canceled) {
                t.set(t.get() + 1);
            }
            // Every further suspension keeps failing immediately.
            if crate::msleep(now() + 10_000) == Err(Error::Canceled) {
                t.set(t.get() + 1);
            }
            if crate::yield_now() == Err(Error::Canceled) {
                t.set(t.get() + 1);
            }
        })
        .unwrap();
        crate::msleep(now() + 10).unwrap();
        crate::hclose(h).unwrap();
        assert_eq!(tally.get(), 3);
    }

    #[test]
    fn close_of_a_finished_coroutine_reaps_it() {
        let h = crate::go(|| {}).unwrap();
        crate::msleep(now() + 5).unwrap();
        crate::hclose(h).unwrap();
        assert_eq!(crate::hclose(h), Err(Error::BadHandle));
    }

    #[test]
    fn panicking_coroutine_is_reaped_not_fatal() {
        let h = crate::go(|| panic!("inside a coroutine")).unwrap();
        crate::msleep(now() + 5).unwrap();
        crate::hclose(h).unwrap();
    }

    #[test]
    fn go_mem_uses_the_callers_stack() {
        let mut stack = vec![0u8; 64 * 1024];
        let done = Rc::new(Cell::new(false));
        let d = done.clone();
        let h = unsafe {
            crate::go_mem(move || d.set(true), stack.as_mut_ptr(), stack.len()).unwrap()
        };
        crate::yield_now().unwrap();
        assert!(done.get());
        crate::hclose(h).unwrap();
        drop(stack);
    }
}
