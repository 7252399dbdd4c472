// Copyright 2026 The skein Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Unix-domain (local) bytestream sockets, including in-process pairs.

use std::any::Any;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

use log::debug;

use crate::error::{Error, Result};
use crate::fd;
use crate::net::StreamSock;
use crate::runtime::{Dir, Runtime};
use crate::sock::{Caps, Sock};
use crate::Handle;

struct Listener {
    lis: UnixListener,
}

impl Sock for Listener {
    fn caps(&self) -> Caps {
        Caps::default()
    }

    fn close(&mut self) {
        Runtime::current().fdclean(self.lis.as_raw_fd());
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// A connected pair of in-process bytestream sockets.
pub fn pair() -> Result<(Handle, Handle)> {
    let (a, b) = UnixStream::pair()?;
    a.set_nonblocking(true)?;
    b.set_nonblocking(true)?;
    let rt = Runtime::current();
    Ok((
        rt.insert_sock(Box::new(StreamSock::new(a))),
        rt.insert_sock(Box::new(StreamSock::new(b))),
    ))
}

pub fn listen<P: AsRef<Path>>(path: P) -> Result<Handle> {
    let lis = UnixListener::bind(path.as_ref())?;
    lis.set_nonblocking(true)?;
    debug!("ipc: listening on {}", path.as_ref().display());
    Ok(Runtime::current().insert_sock(Box::new(Listener { lis })))
}

pub fn accept(h: Handle, deadline: i64) -> Result<Handle> {
    let rt = Runtime::current();
    rt.check_cancel()?;
    let mut s = rt.checkout_sock(h)?;
    let r = (|| {
        let lis = match s.as_any().downcast_mut::<Listener>() {
            Some(l) => l,
            None => return Err(Error::NotSupported),
        };
        let fd = lis.lis.as_raw_fd();
        let (stream, _) = fd::retry(fd, Dir::In, deadline, || lis.lis.accept())?;
        stream.set_nonblocking(true)?;
        Ok(stream)
    })();
    Runtime::current().checkin_sock(h, s);
    r.map(|stream| Runtime::current().insert_sock(Box::new(StreamSock::new(stream))))
}

/// Connect to a listening local socket. Local connects complete
/// immediately or fail; the deadline only matters for a full backlog.
pub fn connect<P: AsRef<Path>>(path: P, _deadline: i64) -> Result<Handle> {
    Runtime::current().check_cancel()?;
    let stream = UnixStream::connect(path.as_ref())?;
    stream.set_nonblocking(true)?;
    debug!("ipc: connected to {}", path.as_ref().display());
    Ok(Runtime::current().insert_sock(Box::new(StreamSock::new(stream))))
}

pub fn attach(stream: UnixStream) -> Result<Handle> {
    stream.set_nonblocking(true)?;
    Ok(Runtime::current().insert_sock(Box::new(StreamSock::new(stream))))
}

pub fn detach(h: Handle) -> Result<UnixStream> {
    let rt = Runtime::current();
    let mut s = rt.checkout_sock(h)?;
    if !s.as_any().is::<StreamSock<UnixStream>>() {
        Runtime::current().checkin_sock(h, s);
        return Err(Error::NotSupported);
    }
    Runtime::current().discard_sock_entry(h);
    let sock = match s.into_any().downcast::<StreamSock<UnixStream>>() {
        Ok(b) => b,
        Err(_) => unreachable!(),
    };
    Runtime::current().fdclean(sock.io.as_raw_fd());
    Ok(sock.io)
}

pub fn done(h: Handle, deadline: i64) -> Result<()> {
    crate::sock::sock_done(h, deadline)
}
