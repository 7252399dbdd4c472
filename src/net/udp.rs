// Copyright 2026 The skein Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! UDP message sockets. Each datagram is one message.

use std::any::Any;
use std::io;
use std::net::{self, SocketAddr};
use std::os::unix::io::AsRawFd;
use std::ptr;

use crate::error::{Error, Result};
use crate::fd;
use crate::runtime::{Dir, Runtime};
use crate::sock::{iol_len, iol_scatter, Caps, Sock};
use crate::Handle;

struct UdpSock {
    sock: net::UdpSocket,
    remote: Option<SocketAddr>,
}

impl UdpSock {
    /// Size of the next queued datagram without consuming it, so an
    /// undersized receive can fail non-destructively.
    fn probe(&self, deadline: i64) -> Result<usize> {
        let fd = self.sock.as_raw_fd();
        fd::retry(fd, Dir::In, deadline, || {
            let n = unsafe {
                libc::recv(fd, ptr::null_mut(), 0, libc::MSG_PEEK | libc::MSG_TRUNC)
            };
            if n < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(n as usize)
            }
        })
    }

    fn recv_message(
        &mut self,
        bufs: &mut [&mut [u8]],
        deadline: i64,
    ) -> Result<(usize, SocketAddr)> {
        let size = self.probe(deadline)?;
        if size > bufs.iter().map(|b| b.len()).sum::<usize>() {
            return Err(Error::MessageSize);
        }
        let fd = self.sock.as_raw_fd();
        if bufs.len() == 1 {
            let (n, from) = fd::retry(fd, Dir::In, deadline, || self.sock.recv_from(&mut *bufs[0]))?;
            Ok((n, from))
        } else {
            let mut tmp = vec![0u8; size];
            let (n, from) = fd::retry(fd, Dir::In, deadline, || self.sock.recv_from(&mut tmp))?;
            iol_scatter(&tmp[..n], bufs);
            Ok((n, from))
        }
    }

    fn send_message(&mut self, to: SocketAddr, bufs: &[&[u8]], deadline: i64) -> Result<()> {
        let fd = self.sock.as_raw_fd();
        let sent = if bufs.len() == 1 {
            fd::retry(fd, Dir::Out, deadline, || self.sock.send_to(bufs[0], to))?
        } else {
            // A datagram must leave in one piece; coalesce the list.
            let mut flat = Vec::with_capacity(iol_len(bufs));
            for b in bufs {
                flat.extend_from_slice(b);
            }
            fd::retry(fd, Dir::Out, deadline, || self.sock.send_to(&flat, to))?
        };
        debug_assert_eq!(sent, iol_len(bufs));
        Ok(())
    }
}

impl Sock for UdpSock {
    fn caps(&self) -> Caps {
        Caps { bytestream: false, message: true }
    }

    fn msendl(&mut self, bufs: &[&[u8]], deadline: i64) -> Result<()> {
        let to = self.remote.ok_or(Error::InvalidArgument)?;
        self.send_message(to, bufs, deadline)
    }

    fn mrecvl(&mut self, bufs: &mut [&mut [u8]], deadline: i64) -> Result<usize> {
        self.recv_message(bufs, deadline).map(|(n, _)| n)
    }

    fn close(&mut self) {
        Runtime::current().fdclean(self.sock.as_raw_fd());
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Open a UDP socket. `local` defaults to an OS-assigned port on the
/// wildcard address of `remote`'s family; `remote`, when given, is the
/// default destination for `msend`.
pub fn open(local: Option<SocketAddr>, remote: Option<SocketAddr>) -> Result<Handle> {
    let bind_to = local.unwrap_or_else(|| match remote {
        Some(SocketAddr::V6(_)) => "[::]:0".parse().unwrap(),
        _ => "0.0.0.0:0".parse().unwrap(),
    });
    let sock = net::UdpSocket::bind(bind_to)?;
    sock.set_nonblocking(true)?;
    Ok(Runtime::current().insert_sock(Box::new(UdpSock { sock, remote })))
}

/// Send one datagram to an explicit destination.
pub fn sendto(h: Handle, to: SocketAddr, buf: &[u8]) -> Result<()> {
    let rt = Runtime::current();
    rt.check_cancel()?;
    let mut s = rt.checkout_sock(h)?;
    let r = match s.as_any().downcast_mut::<UdpSock>() {
        Some(u) => u.send_message(to, &[buf], -1),
        None => Err(Error::NotSupported),
    };
    Runtime::current().checkin_sock(h, s);
    r
}

/// Receive one datagram along with its source address.
pub fn recvfrom(h: Handle, buf: &mut [u8], deadline: i64) -> Result<(usize, SocketAddr)> {
    let rt = Runtime::current();
    rt.check_cancel()?;
    let mut s = rt.checkout_sock(h)?;
    let r = match s.as_any().downcast_mut::<UdpSock>() {
        Some(u) => {
            let mut bufs = [buf];
            u.recv_message(&mut bufs, deadline)
        }
        None => Err(Error::NotSupported),
    };
    Runtime::current().checkin_sock(h, s);
    r
}

/// The socket's effective local address.
pub fn addr(h: Handle) -> Result<SocketAddr> {
    let rt = Runtime::current();
    let mut s = rt.checkout_sock(h)?;
    let r = match s.as_any().downcast_mut::<UdpSock>() {
        Some(u) => u.sock.local_addr().map_err(Error::from),
        None => Err(Error::NotSupported),
    };
    Runtime::current().checkin_sock(h, s);
    r
}
