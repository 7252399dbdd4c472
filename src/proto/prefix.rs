// Copyright 2026 The skein Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Size-prefix framing: turns a bytestream into a message socket by
//! putting an N-byte length in front of every message. A prefix of all
//! ones marks the sender's end-of-stream.

use std::any::Any;

use log::debug;

use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::sock::{iol_cap, iol_len, require_caps, Caps, Sock};
use crate::Handle;

/// Options for `attach_opts`. The default prefix is big-endian.
#[derive(Clone, Copy, Default)]
pub struct Opts {
    pub little_endian: bool,
}

struct PrefixSock {
    under: Box<dyn Sock>,
    hdrlen: usize,
    little_endian: bool,
    tx_done: bool,
    rx_done: bool,
    /// Set once the stream state is unknown (an interrupted transfer);
    /// everything afterwards reports a broken pipe.
    broken: bool,
    /// Length already decoded for a message that did not fit the
    /// caller's buffer yet.
    pending: Option<u64>,
}

impl PrefixSock {
    /// The all-ones prefix value, reserved as the end-of-stream mark.
    fn eos(&self) -> u64 {
        if self.hdrlen == 8 {
            u64::MAX
        } else {
            (1u64 << (8 * self.hdrlen)) - 1
        }
    }

    fn encode(&self, len: u64) -> [u8; 8] {
        if self.little_endian {
            len.to_le_bytes()
        } else {
            let mut out = [0u8; 8];
            out[..self.hdrlen].copy_from_slice(&len.to_be_bytes()[8 - self.hdrlen..]);
            out
        }
    }

    fn decode(&self, hdr: &[u8; 8]) -> u64 {
        let mut full = [0u8; 8];
        if self.little_endian {
            full[..self.hdrlen].copy_from_slice(&hdr[..self.hdrlen]);
            u64::from_le_bytes(full)
        } else {
            full[8 - self.hdrlen..].copy_from_slice(&hdr[..self.hdrlen]);
            u64::from_be_bytes(full)
        }
    }
}

impl Sock for PrefixSock {
    fn caps(&self) -> Caps {
        Caps { bytestream: false, message: true }
    }

    fn msendl(&mut self, bufs: &[&[u8]], deadline: i64) -> Result<()> {
        if self.broken || self.tx_done {
            return Err(Error::Pipe);
        }
        let len = iol_len(bufs) as u64;
        if len >= self.eos() {
            return Err(Error::InvalidArgument);
        }
        let hdr = self.encode(len);
        let mut iol: Vec<&[u8]> = Vec::with_capacity(bufs.len() + 1);
        iol.push(&hdr[..self.hdrlen]);
        iol.extend_from_slice(bufs);
        self.under.bsendl(&iol, deadline).map_err(|e| {
            // A half-written frame cannot be resynchronized.
            self.broken = true;
            e
        })
    }

    fn mrecvl(&mut self, bufs: &mut [&mut [u8]], deadline: i64) -> Result<usize> {
        if self.broken || self.rx_done {
            return Err(Error::Pipe);
        }
        let len = match self.pending.take() {
            Some(len) => len,
            None => {
                let mut hdr = [0u8; 8];
                {
                    let mut dst = [&mut hdr[..self.hdrlen]];
                    match self.under.brecvl(&mut dst, deadline) {
                        Ok(()) => {}
                        Err(Error::Pipe) => {
                            self.rx_done = true;
                            return Err(Error::Pipe);
                        }
                        Err(e) => {
                            self.broken = true;
                            return Err(e);
                        }
                    }
                }
                self.decode(&hdr)
            }
        };
        if len == self.eos() {
            self.rx_done = true;
            return Err(Error::Pipe);
        }
        if len as usize > iol_cap(bufs) {
            // Non-destructive: remember the frame for a bigger buffer.
            self.pending = Some(len);
            return Err(Error::MessageSize);
        }
        let mut remaining = len as usize;
        let mut windows: Vec<&mut [u8]> = Vec::new();
        for b in bufs.iter_mut() {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(b.len());
            windows.push(&mut b[..take]);
            remaining -= take;
        }
        if !windows.is_empty() {
            if let Err(e) = self.under.brecvl(&mut windows, deadline) {
                self.broken = true;
                return Err(e);
            }
        }
        Ok(len as usize)
    }

    fn done(&mut self, deadline: i64) -> Result<()> {
        if self.tx_done {
            return Err(Error::Pipe);
        }
        let hdr = [0xffu8; 8];
        self.under.bsendl(&[&hdr[..self.hdrlen]], deadline).map_err(|e| {
            self.broken = true;
            e
        })?;
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

/// Layer size-prefix framing (big-endian, `hdrlen` bytes) over a
/// bytestream socket, taking ownership of it.
pub fn attach(h: Handle, hdrlen: usize) -> Result<Handle> {
    attach_opts(h, hdrlen, Opts::default())
}

pub fn attach_opts(h: Handle, hdrlen: usize, opts: Opts) -> Result<Handle> {
    if hdrlen == 0 || hdrlen > 8 {
        return Err(Error::InvalidArgument);
    }
    require_caps(h, true, false)?;
    let rt = Runtime::current();
    let under = rt.take_sock(h)?;
    debug!("prefix: attached with {}-byte header", hdrlen);
    Ok(rt.insert_sock(Box::new(PrefixSock {
        under,
        hdrlen,
        little_endian: opts.little_endian,
        tx_done: false,
        rx_done: false,
        broken: false,
        pending: None,
    })))
}

/// Peel the framing off and get the underlying bytestream back. No
/// handshake is involved; the adapter handle is invalidated.
pub fn detach(h: Handle) -> Result<Handle> {
    let rt = Runtime::current();
    let mut s = rt.checkout_sock(h)?;
    if !s.as_any().is::<PrefixSock>() {
        Runtime::current().checkin_sock(h, s);
        return Err(Error::NotSupported);
    }
    Runtime::current().discard_sock_entry(h);
    let sock = match s.into_any().downcast::<PrefixSock>() {
        Ok(b) => b,
        Err(_) => unreachable!(),
    };
    debug!("prefix: detached");
    Ok(Runtime::current().insert_sock(sock.under))
}

/// Half-close: send the end-of-stream mark.
pub fn done(h: Handle, deadline: i64) -> Result<()> {
    crate::sock::sock_done(h, deadline)
}
