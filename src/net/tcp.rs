// Copyright 2026 The skein Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! TCP bytestream sockets.

use std::any::Any;
use std::net::{self, SocketAddr};
use std::os::unix::io::AsRawFd;

use log::debug;

use crate::error::{Error, Result};
use crate::fd;
use crate::net::StreamSock;
use crate::runtime::{Dir, Runtime};
use crate::sock::{Caps, Sock};
use crate::Handle;

struct Listener {
    lis: net::TcpListener,
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

/// Start listening on `addr`. Use port 0 to let the OS pick one; `addr`
/// reports the effective address.
pub fn listen(addr: SocketAddr) -> Result<Handle> {
    let lis = net::TcpListener::bind(addr)?;
    lis.set_nonblocking(true)?;
    debug!("tcp: listening on {}", lis.local_addr()?);
    Ok(Runtime::current().insert_sock(Box::new(Listener { lis })))
}

/// Accept one connection, waiting until the deadline.
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
        let (stream, peer) = fd::retry(fd, Dir::In, deadline, || lis.lis.accept())?;
        stream.set_nonblocking(true)?;
        debug!("tcp: accepted connection from {}", peer);
        Ok(stream)
    })();
    Runtime::current().checkin_sock(h, s);
    r.map(|stream| Runtime::current().insert_sock(Box::new(StreamSock::new(stream))))
}

/// Connect to `addr`, waiting until the deadline.
pub fn connect(addr: SocketAddr, deadline: i64) -> Result<Handle> {
    Runtime::current().check_cancel()?;
    let stream = fd::connect_tcp(&addr, deadline)?;
    debug!("tcp: connected to {}", addr);
    Ok(Runtime::current().insert_sock(Box::new(StreamSock::new(stream))))
}

/// Wrap an already-connected stream in a bytestream socket.
pub fn attach(stream: net::TcpStream) -> Result<Handle> {
    stream.set_nonblocking(true)?;
    Ok(Runtime::current().insert_sock(Box::new(StreamSock::new(stream))))
}

/// Tear the socket apart and hand the raw stream back. The handle is
/// invalidated.
pub fn detach(h: Handle) -> Result<net::TcpStream> {
    let rt = Runtime::current();
    let mut s = rt.checkout_sock(h)?;
    if !s.as_any().is::<StreamSock<net::TcpStream>>() {
        Runtime::current().checkin_sock(h, s);
        return Err(Error::NotSupported);
    }
    Runtime::current().discard_sock_entry(h);
    let sock = match s.into_any().downcast::<StreamSock<net::TcpStream>>() {
        Ok(b) => b,
        Err(_) => unreachable!(),
    };
    Runtime::current().fdclean(sock.io.as_raw_fd());
    Ok(sock.io)
}

/// Half-close the sending side.
pub fn done(h: Handle, deadline: i64) -> Result<()> {
    crate::sock::sock_done(h, deadline)
}

/// Local address of a listener or stream.
pub fn addr(h: Handle) -> Result<SocketAddr> {
    let rt = Runtime::current();
    let mut s = rt.checkout_sock(h)?;
    let r = if let Some(l) = s.as_any().downcast_mut::<Listener>() {
        l.lis.local_addr().map_err(Error::from)
    } else if let Some(st) = s.as_any().downcast_mut::<StreamSock<net::TcpStream>>() {
        st.io.local_addr().map_err(Error::from)
    } else {
        Err(Error::NotSupported)
    };
    Runtime::current().checkin_sock(h, s);
    r
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::now;

    #[test]
    fn listen_connect_accept_roundtrip() {
        let lis = listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let at = addr(lis).unwrap();
        let client = crate::go(move || {
            let c = connect(at, now() + 2_000).unwrap();
            crate::bsend(c, b"ping", now() + 2_000).unwrap();
            let mut buf = [0u8; 4];
            crate::brecv(c, &mut buf, now() + 2_000).unwrap();
            assert_eq!(&buf, b"pong");
            crate::hclose(c).unwrap();
        })
        .unwrap();
        let srv = accept(lis, now() + 2_000).unwrap();
        let mut buf = [0u8; 4];
        crate::brecv(srv, &mut buf, now() + 2_000).unwrap();
        assert_eq!(&buf, b"ping");
        crate::bsend(srv, b"pong", now() + 2_000).unwrap();
        crate::hclose(client).unwrap();
        crate::hclose(srv).unwrap();
        crate::hclose(lis).unwrap();
    }

    #[test]
    fn done_makes_the_peer_see_eof() {
        let lis = listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let at = addr(lis).unwrap();
        let client = crate::go(move || {
            let c = connect(at, now() + 2_000).unwrap();
            done(c, -1).unwrap();
            // Sending after done fails locally.
            assert_eq!(crate::bsend(c, b"x", -1), Err(Error::Pipe));
            crate::hclose(c).unwrap();
        })
        .unwrap();
        let srv = accept(lis, now() + 2_000).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(crate::brecv(srv, &mut buf, now() + 2_000), Err(Error::Pipe));
        crate::hclose(client).unwrap();
        crate::hclose(srv).unwrap();
        crate::hclose(lis).unwrap();
    }

    #[test]
    fn detach_returns_a_working_stream() {
        use std::io::{Read, Write};
        let lis = listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let at = addr(lis).unwrap();
        let client = crate::go(move || {
            let c = connect(at, now() + 2_000).unwrap();
            crate::bsend(c, b"raw", now() + 2_000).unwrap();
            crate::hclose(c).unwrap();
        })
        .unwrap();
        let srv = accept(lis, now() + 2_000).unwrap();
        let mut stream = detach(srv).unwrap();
        assert_eq!(crate::hclose(srv), Err(Error::BadHandle));
        stream.set_nonblocking(false).unwrap();
        let mut buf = [0u8; 3];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"raw");
        let _ = stream.flush();
        crate::hclose(client).unwrap();
        crate::hclose(lis).unwrap();
    }
}
