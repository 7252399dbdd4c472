// Copyright 2026 The skein Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Terminal handshake over any message socket: both peers send an agreed
//! terminator message when they are finished, and `detach` completes the
//! handshake so the underlying socket can be reused cleanly.

use std::any::Any;

use log::debug;

use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::sock::{iol_gather, Caps, Sock};
use crate::Handle;

struct TermSock {
    under: Box<dyn Sock>,
    terminator: Vec<u8>,
    tx_done: bool,
    rx_done: bool,
}

impl TermSock {
    /// Complete the handshake: make sure our terminator went out, then
    /// drain incoming messages until the peer's terminator arrives.
    fn finish(&mut self, deadline: i64) -> Result<()> {
        if !self.tx_done {
            self.done(deadline)?;
        }
        let mut scratch = vec![0u8; self.terminator.len().max(256)];
        while !self.rx_done {
            let mut dst = [&mut scratch[..]];
            match self.mrecvl(&mut dst, deadline) {
                Ok(_) => {} // drop whatever the peer still had in flight
                Err(Error::Pipe) => break, // terminator, or the peer closed
                Err(Error::MessageSize) => {
                    let len = scratch.len() * 2;
                    scratch = vec![0u8; len];
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl Sock for TermSock {
    fn caps(&self) -> Caps {
        Caps { bytestream: false, message: true }
    }

    fn msendl(&mut self, bufs: &[&[u8]], deadline: i64) -> Result<()> {
        if self.tx_done {
            return Err(Error::Pipe);
        }
        self.under.msendl(bufs, deadline)
    }

    fn mrecvl(&mut self, bufs: &mut [&mut [u8]], deadline: i64) -> Result<usize> {
        if self.rx_done {
            return Err(Error::Pipe);
        }
        let n = self.under.mrecvl(bufs, deadline)?;
        if n == self.terminator.len() && iol_gather(bufs, n) == self.terminator {
            self.rx_done = true;
            return Err(Error::Pipe);
        }
        Ok(n)
    }

    fn done(&mut self, deadline: i64) -> Result<()> {
        if self.tx_done {
            return Err(Error::Pipe);
        }
        self.under.msendl(&[&self.terminator], deadline)?;
        self.tx_done = true;
        Ok(())
    }

    fn close(&mut self) {
        self.under.close();
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Layer the terminal handshake over a message socket, taking ownership
/// of it. `terminator` must be distinguishable from real traffic.
pub fn attach(h: Handle, terminator: &[u8]) -> Result<Handle> {
    if terminator.is_empty() || terminator.len() > 128 {
        return Err(Error::InvalidArgument);
    }
    crate::sock::require_caps(h, false, true)?;
    let rt = Runtime::current();
    let under = rt.take_sock(h)?;
    debug!("term: attached");
    Ok(rt.insert_sock(Box::new(TermSock {
        under,
        terminator: terminator.to_vec(),
        tx_done: false,
        rx_done: false,
    })))
}

/// Announce the end of outgoing traffic by sending the terminator.
pub fn done(h: Handle, deadline: i64) -> Result<()> {
    crate::sock::sock_done(h, deadline)
}

/// Finish the handshake within the deadline and return the underlying
/// message socket. On timeout the adapter handle stays valid, so the
/// detach may be retried.
pub fn detach(h: Handle, deadline: i64) -> Result<Handle> {
    let rt = Runtime::current();
    rt.check_cancel()?;
    let mut s = rt.checkout_sock(h)?;
    let t = match s.as_any().downcast_mut::<TermSock>() {
        Some(t) => t,
        None => {
            Runtime::current().checkin_sock(h, s);
            return Err(Error::NotSupported);
        }
    };
    match t.finish(deadline) {
        Ok(()) => {
            Runtime::current().discard_sock_entry(h);
            let sock = match s.into_any().downcast::<TermSock>() {
                Ok(b) => b,
                Err(_) => unreachable!(),
            };
            debug!("term: detached");
            Ok(Runtime::current().insert_sock(sock.under))
        }
        Err(e) => {
            Runtime::current().checkin_sock(h, s);
            Err(e)
        }
    }
}
