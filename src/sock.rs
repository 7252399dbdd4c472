// Copyright 2026 The skein Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The virtual socket framework.
//!
//! A socket implements `Sock`, the vtable behind every handle of kind
//! socket. Two capabilities exist: bytestream (`bsendl`/`brecvl`,
//! byte-exact, no boundaries) and message (`msendl`/`mrecvl`, boundaries
//! preserved). Protocol adapters implement one of them on top of a
//! `Box<dyn Sock>` they own, which is how adapter stacks form; attaching
//! consumes the underlier's handle, detaching returns a fresh one.

use std::any::Any;

use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::Handle;

/// Which of the two I/O shapes a socket supports.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Caps {
    pub bytestream: bool,
    pub message: bool,
}

/// The socket vtable. Unimplemented operations report `NotSupported`,
/// mirroring a vtable slot that is absent.
pub trait Sock {
    fn caps(&self) -> Caps;

    /// Send exactly the bytes of `bufs`, in order.
    fn bsendl(&mut self, bufs: &[&[u8]], deadline: i64) -> Result<()> {
        let _ = (bufs, deadline);
        Err(Error::NotSupported)
    }

    /// Fill every buffer in `bufs` completely.
    fn brecvl(&mut self, bufs: &mut [&mut [u8]], deadline: i64) -> Result<()> {
        let _ = (bufs, deadline);
        Err(Error::NotSupported)
    }

    /// Send one message assembled from `bufs`.
    fn msendl(&mut self, bufs: &[&[u8]], deadline: i64) -> Result<()> {
        let _ = (bufs, deadline);
        Err(Error::NotSupported)
    }

    /// Receive one message into `bufs`, returning its length. An
    /// undersized buffer fails with `MessageSize` and leaves the message
    /// pending.
    fn mrecvl(&mut self, bufs: &mut [&mut [u8]], deadline: i64) -> Result<usize> {
        let _ = (bufs, deadline);
        Err(Error::NotSupported)
    }

    /// Half-close: signal end-of-stream to the peer. Further sends fail
    /// with `Pipe`; receives keep working until the peer closes too.
    fn done(&mut self, deadline: i64) -> Result<()> {
        let _ = deadline;
        Err(Error::NotSupported)
    }

    /// Hard teardown without a protocol handshake. Must not block.
    fn close(&mut self);

    fn as_any(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

pub(crate) fn iol_len(bufs: &[&[u8]]) -> usize {
    bufs.iter().map(|b| b.len()).sum()
}

pub(crate) fn iol_cap(bufs: &[&mut [u8]]) -> usize {
    bufs.iter().map(|b| b.len()).sum()
}

/// Scatter `msg` across `bufs`. The caller has checked capacity.
pub(crate) fn iol_scatter(msg: &[u8], bufs: &mut [&mut [u8]]) {
    let mut off = 0;
    for b in bufs.iter_mut() {
        if off == msg.len() {
            break;
        }
        let n = (msg.len() - off).min(b.len());
        b[..n].copy_from_slice(&msg[off..off + n]);
        off += n;
    }
}

/// Gather the first `len` bytes spread across `bufs`.
pub(crate) fn iol_gather(bufs: &[&mut [u8]], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    for b in bufs.iter() {
        if out.len() == len {
            break;
        }
        let n = (len - out.len()).min(b.len());
        out.extend_from_slice(&b[..n]);
    }
    out
}

fn with_sock<T>(h: Handle, f: impl FnOnce(&mut dyn Sock) -> Result<T>) -> Result<T> {
    let rt = Runtime::current();
    rt.check_cancel()?;
    let mut s = rt.checkout_sock(h)?;
    let r = f(&mut *s);
    Runtime::current().checkin_sock(h, s);
    r
}

/// Send bytes on a bytestream socket.
pub fn bsend(h: Handle, buf: &[u8], deadline: i64) -> Result<()> {
    bsendl(h, &[buf], deadline)
}

/// Gather-send bytes on a bytestream socket.
pub fn bsendl(h: Handle, bufs: &[&[u8]], deadline: i64) -> Result<()> {
    with_sock(h, |s| s.bsendl(bufs, deadline))
}

/// Receive exactly `buf.len()` bytes from a bytestream socket.
pub fn brecv(h: Handle, buf: &mut [u8], deadline: i64) -> Result<()> {
    let mut bufs = [buf];
    brecvl(h, &mut bufs, deadline)
}

/// Scatter-receive: fill every buffer completely.
pub fn brecvl(h: Handle, bufs: &mut [&mut [u8]], deadline: i64) -> Result<()> {
    with_sock(h, |s| s.brecvl(bufs, deadline))
}

/// Send one message on a message socket.
pub fn msend(h: Handle, buf: &[u8], deadline: i64) -> Result<()> {
    msendl(h, &[buf], deadline)
}

pub fn msendl(h: Handle, bufs: &[&[u8]], deadline: i64) -> Result<()> {
    with_sock(h, |s| s.msendl(bufs, deadline))
}

/// Receive one message; returns its length. `MessageSize` leaves the
/// message pending for a retry with a larger buffer.
pub fn mrecv(h: Handle, buf: &mut [u8], deadline: i64) -> Result<usize> {
    let mut bufs = [buf];
    mrecvl(h, &mut bufs, deadline)
}

pub fn mrecvl(h: Handle, bufs: &mut [&mut [u8]], deadline: i64) -> Result<usize> {
    with_sock(h, |s| s.mrecvl(bufs, deadline))
}

/// Half-close any socket that supports it.
pub(crate) fn sock_done(h: Handle, deadline: i64) -> Result<()> {
    with_sock(h, |s| s.done(deadline))
}

/// Capability pre-check used by the attach functions, without disturbing
/// the underlier's handle on failure.
pub(crate) fn require_caps(h: Handle, bytestream: bool, message: bool) -> Result<()> {
    let caps = with_sock(h, |s| Ok(s.caps()))?;
    if (bytestream && !caps.bytestream) || (message && !caps.message) {
        return Err(Error::NotSupported);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scatter_and_gather_are_inverses() {
        let msg = b"0123456789";
        let mut a = [0u8; 3];
        let mut b = [0u8; 4];
        let mut c = [0u8; 5];
        let mut bufs: [&mut [u8]; 3] = [&mut a, &mut b, &mut c];
        iol_scatter(msg, &mut bufs);
        assert_eq!(iol_gather(&bufs, msg.len()), msg);
    }

    #[test]
    fn byte_ops_on_a_channel_handle_are_not_supported() {
        let (a, b) = crate::chmake().unwrap();
        assert_eq!(bsend(a, &[1], -1), Err(Error::NotSupported));
        assert_eq!(mrecv(a, &mut [0], -1), Err(Error::NotSupported));
        crate::hclose(a).unwrap();
        crate::hclose(b).unwrap();
    }
}
