// Copyright 2026 The skein Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Readiness multiplexer: one waiting coroutine per (fd, direction),
//! integrated with the scheduler's deadline tree.
//!
//! Semantics are edge-triggered: an event is delivered for a readiness
//! *transition*. Every consumer in this crate attempts the syscall first
//! and waits only after `EWOULDBLOCK`, so no wakeup can be lost.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use log::debug;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::error::{Error, Result};
use crate::runtime::{CoroId, Dir, Runtime, Wake, WaitSet};

#[derive(Default)]
struct FdEntry {
    reader: Option<CoroId>,
    writer: Option<CoroId>,
    registered: bool,
}

pub(crate) struct Poller {
    poll: Poll,
    events: Events,
    fds: HashMap<RawFd, FdEntry>,
}

impl Poller {
    pub fn new() -> Poller {
        Poller {
            poll: Poll::new().expect("failed to create the OS poller"),
            events: Events::with_capacity(256),
            fds: HashMap::new(),
        }
    }

    /// True when no coroutine waits on any fd.
    pub fn is_idle(&self) -> bool {
        self.fds.values().all(|e| e.reader.is_none() && e.writer.is_none())
    }

    pub fn waiter(&self, fd: RawFd, dir: Dir) -> Option<CoroId> {
        let e = self.fds.get(&fd)?;
        match dir {
            Dir::In => e.reader,
            Dir::Out => e.writer,
        }
    }

    /// Claim the (fd, dir) slot for `coro`. The fd is registered with the
    /// OS poller on first use and stays registered until `clean`.
    pub fn set_waiter(&mut self, fd: RawFd, dir: Dir, coro: CoroId) -> Result<()> {
        let e = self.fds.entry(fd).or_default();
        let slot = match dir {
            Dir::In => &mut e.reader,
            Dir::Out => &mut e.writer,
        };
        if slot.is_some() {
            return Err(Error::Busy);
        }
        if !e.registered {
            self.poll
                .registry()
                .register(
                    &mut SourceFd(&fd),
                    Token(fd as usize),
                    Interest::READABLE.add(Interest::WRITABLE),
                )
                .map_err(Error::from)?;
            e.registered = true;
            debug!("poller: registered fd {}", fd);
        }
        let slot = match dir {
            Dir::In => &mut e.reader,
            Dir::Out => &mut e.writer,
        };
        *slot = Some(coro);
        Ok(())
    }

    pub fn clear_waiter(&mut self, fd: RawFd, dir: Dir, coro: CoroId) {
        if let Some(e) = self.fds.get_mut(&fd) {
            let slot = match dir {
                Dir::In => &mut e.reader,
                Dir::Out => &mut e.writer,
            };
            if *slot == Some(coro) {
                *slot = None;
            }
        }
    }

    /// Drop all state for `fd` and hand back whoever was waiting on it.
    pub fn clean(&mut self, fd: RawFd) -> (Option<CoroId>, Option<CoroId>) {
        match self.fds.remove(&fd) {
            Some(e) => {
                if e.registered {
                    // The fd may already be closed; deregistration is
                    // best-effort.
                    let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
                    debug!("poller: deregistered fd {}", fd);
                }
                (e.reader, e.writer)
            }
            None => (None, None),
        }
    }

    /// Block until an event or the timeout, and report readiness per fd
    /// in poller order.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Vec<(RawFd, bool, bool)> {
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => panic!("poller failed: {}", e),
            }
        }
        self.events
            .iter()
            .map(|ev| {
                let fd = ev.token().0 as RawFd;
                let r = ev.is_readable() || ev.is_read_closed() || ev.is_error();
                let w = ev.is_writable() || ev.is_write_closed() || ev.is_error();
                (fd, r, w)
            })
            .collect()
    }
}

impl Runtime {
    /// Suspend until `fd` reports a readiness edge for `dir`.
    pub(crate) fn fdwait(&mut self, fd: RawFd, dir: Dir, deadline: i64) -> Result<()> {
        self.check_cancel()?;
        if fd < 0 {
            return Err(Error::InvalidArgument);
        }
        let me = self.current;
        self.poller.set_waiter(fd, dir, me)?;
        match self.suspend(WaitSet::Fd { fd, dir }, deadline) {
            Wake::Ready => Ok(()),
            Wake::Timeout => Err(Error::TimedOut),
            Wake::Canceled => Err(Error::Canceled),
            Wake::Badf => Err(Error::BadHandle),
            w => unreachable!("fd wait woken with {:?}", w),
        }
    }

    /// Forget everything about `fd`. Waiters are evicted with a fatal
    /// `BadHandle`. Must be called before an fd the runtime has seen is
    /// closed, so a recycled fd number cannot inherit stale state.
    pub(crate) fn fdclean(&mut self, fd: RawFd) {
        let (r, w) = self.poller.clean(fd);
        for c in [r, w].into_iter().flatten() {
            self.wake(c, Wake::Badf);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    use crate::timer::now;
    use crate::Error;

    fn pair() -> (UnixStream, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        (a, b)
    }

    #[test]
    fn fdin_wakes_on_data() {
        let (mut a, mut b) = pair();
        let fd = a.as_raw_fd();
        // Drain-first discipline: nothing to read yet, so wait.
        let h = crate::go(move || {
            b.write_all(&[1]).unwrap();
        })
        .unwrap();
        crate::fdin(fd, now() + 1_000).unwrap();
        let mut buf = [0u8; 1];
        a.read_exact(&mut buf).unwrap();
        assert_eq!(buf[0], 1);
        crate::hclose(h).unwrap();
        crate::fdclean(fd);
    }

    #[test]
    fn fdin_times_out() {
        let (a, _b) = pair();
        let start = now();
        assert_eq!(crate::fdin(a.as_raw_fd(), start + 40), Err(Error::TimedOut));
        assert!(now() - start >= 40);
        crate::fdclean(a.as_raw_fd());
    }

    #[test]
    fn second_waiter_for_a_direction_is_busy() {
        let (a, _b) = pair();
        let fd = a.as_raw_fd();
        let observed = std::rc::Rc::new(std::cell::Cell::new(None));
        let o = observed.clone();
        let h = crate::go(move || {
            o.set(Some(crate::fdin(fd, now() + 5_000)));
        })
        .unwrap();
        crate::yield_now().unwrap();
        assert_eq!(crate::fdin(fd, now() + 50), Err(Error::Busy));
        crate::fdclean(fd);
        crate::yield_now().unwrap();
        assert_eq!(observed.get(), Some(Err(Error::BadHandle)));
        crate::hclose(h).unwrap();
    }

    #[test]
    fn writable_side_reports_readiness() {
        let (a, _b) = pair();
        // A fresh socket's send buffer has room: the edge arrives with the
        // first poll after registration.
        crate::fdout(a.as_raw_fd(), now() + 1_000).unwrap();
        crate::fdclean(a.as_raw_fd());
    }
}
