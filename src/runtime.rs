// Copyright 2026 The skein Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The per-thread cooperative scheduler.
//!
//! One runtime exists per OS thread, created lazily on first use. The
//! thread itself is registered as coroutine 0, so ordinary code can block
//! in any primitive without an explicit entry point. Suspending switches
//! directly to the next runnable coroutine; when nothing is runnable the
//! suspending coroutine drives the poller inline until something is.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::mem;
use std::os::unix::io::RawFd;
use std::time::Duration;

use context::Transfer;
use log::trace;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use slab::Slab;

use crate::bundle::Bundle;
use crate::chan::Chan;
use crate::coroutine::{CoroRecord, Status};
use crate::error::{Error, Result};
use crate::handle::HandleTable;
use crate::poller::Poller;
use crate::stack::StackPool;
use crate::timer::{now, TimerTree};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct CoroId {
    pub(crate) slot: u32,
    pub(crate) gen: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct ChanId {
    pub(crate) slot: u32,
    pub(crate) gen: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct BundleId {
    pub(crate) slot: u32,
    pub(crate) gen: u32,
}

/// Why a suspended coroutine was resumed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Wake {
    /// The thing waited for happened.
    Ready,
    /// The deadline expired first.
    Timeout,
    /// The coroutine was canceled while suspended.
    Canceled,
    /// The fd under the wait was forcibly cleaned.
    Badf,
    /// A `choose` clause fired.
    Chosen { index: usize, error: Option<Error> },
}

/// Which wait set a suspended coroutine sits in. A coroutine is in at
/// most one of these at any time; a deadline may accompany any of them.
pub(crate) enum WaitSet {
    None,
    /// `msleep`: nothing but the deadline.
    Sleep,
    Fd { fd: RawFd, dir: Dir },
    /// Clauses queued on each of these channels.
    Choose(Vec<ChanId>),
    /// Waiting for the bundle's members to finish.
    Bundle(BundleId),
    /// Waiting in `hclose` for this coroutine to finish.
    Join(CoroId),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Dir {
    In,
    Out,
}

pub(crate) struct Runtime {
    pub(crate) coros: Slab<CoroRecord>,
    pub(crate) chans: Slab<Chan>,
    pub(crate) bundles: Slab<Bundle>,
    pub(crate) table: HandleTable,
    pub(crate) ready: VecDeque<CoroId>,
    pub(crate) current: CoroId,
    /// The coroutine we are switching away from; the resumed side stores
    /// its continuation (or recycles its stack) based on this.
    prev: CoroId,
    pub(crate) timers: TimerTree,
    pub(crate) poller: Poller,
    pub(crate) stacks: StackPool,
    pub(crate) rng: SmallRng,
    gen: u32,
    switches: u32,
}

thread_local!(static RUNTIME: UnsafeCell<Option<Runtime>> = UnsafeCell::new(None));

impl Runtime {
    fn new() -> Runtime {
        let mut coros = Slab::new();
        let gen = 1;
        let slot = coros.insert(CoroRecord::main(gen)) as u32;
        let main = CoroId { slot, gen };
        trace!("runtime: initialized, main coroutine is {}", slot);
        Runtime {
            coros,
            chans: Slab::new(),
            bundles: Slab::new(),
            table: HandleTable::new(),
            ready: VecDeque::new(),
            current: main,
            prev: main,
            timers: TimerTree::new(),
            poller: Poller::new(),
            stacks: StackPool::new(),
            rng: SmallRng::from_entropy(),
            gen,
            switches: 0,
        }
    }

    /// The calling thread's runtime, created on first use.
    ///
    /// The runtime is strictly per-thread and control is handed between
    /// coroutines sequentially, so the reference never aliases a live
    /// mutable borrow on another stack frame that is actually running.
    pub(crate) fn current() -> &'static mut Runtime {
        RUNTIME.with(|rt| unsafe {
            let rt = &mut *rt.get();
            if rt.is_none() {
                *rt = Some(Runtime::new());
            }
            &mut *(rt.as_mut().unwrap() as *mut Runtime)
        })
    }

    pub(crate) fn fresh_gen(&mut self) -> u32 {
        self.gen += 1;
        self.gen
    }

    /// Trusted lookup for ids the runtime itself produced.
    pub(crate) fn rec(&self, id: CoroId) -> &CoroRecord {
        let rec = &self.coros[id.slot as usize];
        debug_assert_eq!(rec.gen, id.gen);
        rec
    }

    pub(crate) fn rec_mut(&mut self, id: CoroId) -> &mut CoroRecord {
        let rec = &mut self.coros[id.slot as usize];
        debug_assert_eq!(rec.gen, id.gen);
        rec
    }

    /// Checked lookup for ids that may have been reaped.
    pub(crate) fn coro_get(&self, id: CoroId) -> Option<&CoroRecord> {
        self.coros.get(id.slot as usize).filter(|r| r.gen == id.gen)
    }

    #[inline]
    pub(crate) fn check_cancel(&self) -> Result<()> {
        if self.rec(self.current).canceled {
            Err(Error::Canceled)
        } else {
            Ok(())
        }
    }

    /// Mark a coroutine canceled. If it is suspended it is woken at once
    /// with `Wake::Canceled`; if it is merely ready or running the sticky
    /// flag makes its next suspension fail.
    pub(crate) fn cancel(&mut self, id: CoroId) {
        let rec = self.rec_mut(id);
        if rec.canceled {
            return;
        }
        rec.canceled = true;
        trace!("coroutine {}: canceled", id.slot);
        if matches!(rec.status, Status::Waiting) {
            self.wake(id, Wake::Canceled);
        }
    }

    /// Remove a coroutine from whatever wait set it sits in, including its
    /// deadline node. Safe to call for coroutines that are not waiting.
    fn unlink(&mut self, id: CoroId) {
        let waiting = mem::replace(&mut self.rec_mut(id).waiting, WaitSet::None);
        if let Some(key) = self.rec_mut(id).timer.take() {
            self.timers.remove(key);
        }
        match waiting {
            WaitSet::None | WaitSet::Sleep => {}
            WaitSet::Fd { fd, dir } => self.poller.clear_waiter(fd, dir, id),
            WaitSet::Choose(chans) => {
                for ch in chans {
                    self.chan_unlink_clauses(ch, id);
                }
            }
            WaitSet::Bundle(b) => {
                if let Some(rec) = self.bundle_get_mut(b) {
                    if rec.waiter == Some(id) {
                        rec.waiter = None;
                    }
                }
            }
            WaitSet::Join(target) => {
                if let Some(rec) = self.coro_get(target) {
                    if rec.closer == Some(id) {
                        self.rec_mut(target).closer = None;
                    }
                }
            }
        }
    }

    /// Unlink a suspended coroutine and put it on the ready queue with the
    /// given wake reason.
    pub(crate) fn wake(&mut self, id: CoroId, wake: Wake) {
        debug_assert!(matches!(self.rec(id).status, Status::Waiting));
        self.unlink(id);
        let rec = self.rec_mut(id);
        rec.wake = wake;
        rec.status = Status::Ready;
        trace!("coroutine {}: woken ({:?})", id.slot, wake);
        self.ready.push_back(id);
    }

    /// Park the current coroutine in `waiting` until woken. The returned
    /// reason tells the primitive how its wait ended.
    pub(crate) fn suspend(&mut self, waiting: WaitSet, deadline: i64) -> Wake {
        let me = self.current;
        {
            let rec = self.rec_mut(me);
            debug_assert!(matches!(rec.waiting, WaitSet::None));
            rec.waiting = waiting;
            rec.status = Status::Waiting;
            rec.wake = Wake::Ready;
        }
        if deadline >= 0 {
            let key = self.timers.insert(deadline, me);
            self.rec_mut(me).timer = Some(key);
        }
        trace!("coroutine {}: parking", me.slot);
        self.schedule_away();
        let rec = self.rec_mut(me);
        rec.status = Status::Running;
        debug_assert!(matches!(rec.waiting, WaitSet::None));
        rec.wake
    }

    /// Hand the processor to the next runnable coroutine. Returns once the
    /// current coroutine is resumed (or turns out to be the head of the
    /// ready queue itself).
    pub(crate) fn schedule_away(&mut self) {
        let me = self.current;
        // Harvest expired deadlines and pending I/O even while the ready
        // queue stays hot, so busy yield loops cannot starve timers or
        // fd waiters.
        self.switches = self.switches.wrapping_add(1);
        if self.switches % 61 == 0 || self.timers.has_expired(now()) {
            self.poll_once(false);
        }
        loop {
            match self.ready.pop_front() {
                Some(next) if next == me => return,
                Some(next) => {
                    self.switch_to(next);
                    return;
                }
                None => self.poll_once(true),
            }
        }
    }

    fn switch_to(&mut self, next: CoroId) {
        trace!("coroutine {}: switching to {}", self.current.slot, next.slot);
        let ctx = self.rec_mut(next).ctx.take().expect("coroutine has no saved context");
        self.prev = self.current;
        self.current = next;
        self.rec_mut(next).status = Status::Running;
        let t = unsafe { ctx.resume(0) };
        // Back on this coroutine's stack: whoever resumed us handed over
        // their own continuation in the transfer.
        Runtime::current().postswitch(t);
    }

    /// First thing executed after every switch, on the resumed side: file
    /// the switcher's continuation, or dispose of it if it finished.
    pub(crate) fn postswitch(&mut self, t: Transfer) {
        let from = self.prev;
        if matches!(self.rec(from).status, Status::Finished) {
            // The finished coroutine's stack is no longer in use; this is
            // the earliest point where it can be recycled.
            drop(t.context);
            if let Some(stack) = self.rec_mut(from).stack.take() {
                self.stacks.give(stack);
            }
            if self.rec(from).bundle_owned() {
                self.coros.remove(from.slot as usize);
            }
        } else {
            self.rec_mut(from).ctx = Some(t.context);
        }
    }

    /// Run the poller once. With `block` set it sleeps until the earliest
    /// deadline or an I/O event; otherwise it only harvests what is
    /// already pending.
    fn poll_once(&mut self, block: bool) {
        let now_ms = now();
        let timeout = if block {
            let t = self.timers.timeout(now_ms);
            if t.is_none() && self.poller.is_idle() {
                panic!("all coroutines are blocked with nothing left to wake them");
            }
            t
        } else {
            Some(Duration::ZERO)
        };
        for (fd, readable, writable) in self.poller.wait(timeout) {
            if readable {
                if let Some(c) = self.poller.waiter(fd, Dir::In) {
                    self.wake(c, Wake::Ready);
                }
            }
            if writable {
                if let Some(c) = self.poller.waiter(fd, Dir::Out) {
                    self.wake(c, Wake::Ready);
                }
            }
        }
        let now_ms = now();
        while let Some((_, coro)) = self.timers.pop_expired(now_ms) {
            self.wake(coro, Wake::Timeout);
        }
    }

    /// `yield`: move to the tail of the ready queue and resume the head.
    pub(crate) fn yield_now(&mut self) -> Result<()> {
        self.check_cancel()?;
        if self.ready.is_empty() {
            self.poll_once(false);
        }
        if self.ready.is_empty() {
            return Ok(());
        }
        let me = self.current;
        self.rec_mut(me).status = Status::Ready;
        self.ready.push_back(me);
        self.schedule_away();
        self.rec_mut(me).status = Status::Running;
        // Cancellation may have landed while queued; yield is a suspension
        // point, so report it.
        if self.rec(me).canceled {
            return Err(Error::Canceled);
        }
        Ok(())
    }

    pub(crate) fn msleep(&mut self, deadline: i64) -> Result<()> {
        self.check_cancel()?;
        if deadline == 0 || (deadline > 0 && deadline <= now()) {
            return Ok(());
        }
        match self.suspend(WaitSet::Sleep, deadline) {
            Wake::Timeout => Ok(()),
            Wake::Canceled => Err(Error::Canceled),
            w => unreachable!("msleep woken with {:?}", w),
        }
    }
}
