// Copyright 2026 The skein Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Delimiter-suffix framing: every message ends with a fixed byte
//! sequence (CRLF being the classic). Messages must not contain the
//! delimiter; the framing cannot tell such a message from two.
//!
//! Receive works a byte at a time so the adapter never reads past the
//! frame it returns, which keeps `detach` exact.

use std::any::Any;

use log::debug;

use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::sock::{iol_cap, iol_scatter, Caps, Sock};
use crate::Handle;

/// Refuse to buffer messages beyond this; a peer that never sends the
/// delimiter would otherwise grow the buffer without bound.
const MAX_MESSAGE: usize = 1 << 20;

pub(crate) struct SuffixSock {
    under: Box<dyn Sock>,
    suffix: Vec<u8>,
    tx_done: bool,
    rx_done: bool,
    broken: bool,
    /// A fully parsed message that did not fit the caller's buffer.
    pending: Option<Vec<u8>>,
}

impl SuffixSock {
    pub(crate) fn new(under: Box<dyn Sock>, suffix: &[u8]) -> SuffixSock {
        SuffixSock {
            under,
            suffix: suffix.to_vec(),
            tx_done: false,
            rx_done: false,
            broken: false,
            pending: None,
        }
    }

    pub(crate) fn into_inner(self) -> Box<dyn Sock> {
        self.under
    }

    fn deliver(&mut self, msg: Vec<u8>, bufs: &mut [&mut [u8]]) -> Result<usize> {
        if msg.len() > iol_cap(bufs) {
            self.pending = Some(msg);
            return Err(Error::MessageSize);
        }
        iol_scatter(&msg, bufs);
        Ok(msg.len())
    }
}

impl Sock for SuffixSock {
    fn caps(&self) -> Caps {
        Caps { bytestream: false, message: true }
    }

    fn msendl(&mut self, bufs: &[&[u8]], deadline: i64) -> Result<()> {
        if self.broken || self.tx_done {
            return Err(Error::Pipe);
        }
        let mut iol: Vec<&[u8]> = Vec::with_capacity(bufs.len() + 1);
        iol.extend_from_slice(bufs);
        iol.push(&self.suffix);
        self.under.bsendl(&iol, deadline).map_err(|e| {
            self.broken = true;
            e
        })
    }

    fn mrecvl(&mut self, bufs: &mut [&mut [u8]], deadline: i64) -> Result<usize> {
        if self.broken || self.rx_done {
            return Err(Error::Pipe);
        }
        if let Some(msg) = self.pending.take() {
            return self.deliver(msg, bufs);
        }
        let mut msg: Vec<u8> = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            {
                let mut dst = [&mut byte[..]];
                match self.under.brecvl(&mut dst, deadline) {
                    Ok(()) => {}
                    Err(Error::Pipe) => {
                        // End of stream is clean only between frames.
                        if !msg.is_empty() {
                            self.broken = true;
                        }
                        self.rx_done = true;
                        return Err(Error::Pipe);
                    }
                    Err(e) => {
                        self.broken = true;
                        return Err(e);
                    }
                }
            }
            msg.push(byte[0]);
            if msg.ends_with(&self.suffix) {
                msg.truncate(msg.len() - self.suffix.len());
                return self.deliver(msg, bufs);
            }
            if msg.len() > MAX_MESSAGE {
                self.broken = true;
                return Err(Error::MessageSize);
            }
        }
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

/// Layer delimiter framing over a bytestream socket, taking ownership of
/// it. The delimiter must be 1 to 128 bytes.
pub fn attach(h: Handle, suffix: &[u8]) -> Result<Handle> {
    if suffix.is_empty() || suffix.len() > 128 {
        return Err(Error::InvalidArgument);
    }
    crate::sock::require_caps(h, true, false)?;
    let rt = Runtime::current();
    let under = rt.take_sock(h)?;
    debug!("suffix: attached with {}-byte delimiter", suffix.len());
    Ok(rt.insert_sock(Box::new(SuffixSock::new(under, suffix))))
}

/// Remove the framing and return the underlying bytestream handle.
pub fn detach(h: Handle) -> Result<Handle> {
    let rt = Runtime::current();
    let mut s = rt.checkout_sock(h)?;
    if !s.as_any().is::<SuffixSock>() {
        Runtime::current().checkin_sock(h, s);
        return Err(Error::NotSupported);
    }
    Runtime::current().discard_sock_entry(h);
    let sock = match s.into_any().downcast::<SuffixSock>() {
        Ok(b) => b,
        Err(_) => unreachable!(),
    };
    debug!("suffix: detached");
    Ok(Runtime::current().insert_sock(sock.into_inner()))
}
