// Copyright 2026 The skein Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Non-blocking fd plumbing shared by the stream adapters: the
//! try-the-syscall-then-wait loop, vectored send/receive, and the
//! non-blocking TCP connect dance.

use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::mem;
use std::net::{self, SocketAddr};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::error::{Error, Result};
use crate::runtime::{Dir, Runtime};

/// Run a non-blocking operation, parking on the poller whenever it
/// reports `EWOULDBLOCK`.
pub(crate) fn retry<T, F>(fd: RawFd, dir: Dir, deadline: i64, mut op: F) -> Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) => match e.kind() {
                io::ErrorKind::WouldBlock => Runtime::current().fdwait(fd, dir, deadline)?,
                io::ErrorKind::Interrupted => {}
                _ => return Err(e.into()),
            },
        }
    }
}

/// Advance an (index, offset) cursor over `bufs` by `n` bytes.
fn advance(lens: impl Fn(usize) -> usize, count: usize, idx: &mut usize, off: &mut usize, mut n: usize) {
    while n > 0 {
        let rem = lens(*idx) - *off;
        if n >= rem {
            n -= rem;
            *idx += 1;
            *off = 0;
            if *idx == count {
                debug_assert_eq!(n, 0);
                return;
            }
        } else {
            *off += n;
            return;
        }
    }
}

/// Write every byte of `bufs` to `s`, in order.
pub(crate) fn write_all_vectored<S>(s: &mut S, bufs: &[&[u8]], deadline: i64) -> Result<()>
where
    S: Write + AsRawFd,
{
    let fd = s.as_raw_fd();
    let mut idx = 0;
    let mut off = 0;
    while idx < bufs.len() {
        if bufs[idx].len() == off {
            idx += 1;
            off = 0;
            continue;
        }
        let n = {
            let mut slices = Vec::with_capacity(bufs.len() - idx);
            slices.push(IoSlice::new(&bufs[idx][off..]));
            for b in &bufs[idx + 1..] {
                slices.push(IoSlice::new(b));
            }
            retry(fd, Dir::Out, deadline, || s.write_vectored(&slices))?
        };
        if n == 0 {
            return Err(Error::Pipe);
        }
        advance(|i| bufs[i].len(), bufs.len(), &mut idx, &mut off, n);
    }
    Ok(())
}

/// Fill every buffer of `bufs` completely. A clean end-of-stream before
/// the first byte, or any end-of-stream mid-fill, reports `Pipe`.
pub(crate) fn read_exact_vectored<S>(s: &mut S, bufs: &mut [&mut [u8]], deadline: i64) -> Result<()>
where
    S: Read + AsRawFd,
{
    let fd = s.as_raw_fd();
    let count = bufs.len();
    let mut idx = 0;
    let mut off = 0;
    while idx < count {
        if bufs[idx].len() == off {
            idx += 1;
            off = 0;
            continue;
        }
        let n = {
            let (first, rest) = bufs[idx..].split_first_mut().expect("cursor past the end");
            let mut slices = Vec::with_capacity(rest.len() + 1);
            slices.push(IoSliceMut::new(&mut first[off..]));
            for b in rest {
                slices.push(IoSliceMut::new(b));
            }
            retry(fd, Dir::In, deadline, || s.read_vectored(&mut slices))?
        };
        if n == 0 {
            return Err(Error::Pipe);
        }
        let lens: Vec<usize> = bufs.iter().map(|b| b.len()).collect();
        advance(|i| lens[i], count, &mut idx, &mut off, n);
    }
    Ok(())
}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

pub(crate) fn set_nonblock(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(Error::from_errno(last_errno()));
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(Error::from_errno(last_errno()));
    }
    Ok(())
}

fn sockaddr_of(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(a) => {
            let sin = &mut storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = a.port().to_be();
                (*sin).sin_addr.s_addr = u32::from(*a.ip()).to_be();
            }
            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(a) => {
            let sin6 = &mut storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = a.port().to_be();
                (*sin6).sin6_addr.s6_addr = a.ip().octets();
                (*sin6).sin6_scope_id = a.scope_id();
            }
            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

/// Non-blocking TCP connect: initiate, wait for writability within the
/// deadline, then surface `SO_ERROR`.
pub(crate) fn connect_tcp(addr: &SocketAddr, deadline: i64) -> Result<net::TcpStream> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let raw = unsafe { libc::socket(family, libc::SOCK_STREAM, 0) };
    if raw < 0 {
        return Err(Error::from_errno(last_errno()));
    }
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    let r = connect_nonblocking(&fd, addr, deadline);
    match r {
        Ok(()) => Ok(net::TcpStream::from(fd)),
        Err(e) => {
            Runtime::current().fdclean(fd.as_raw_fd());
            Err(e)
        }
    }
}

fn connect_nonblocking(fd: &OwnedFd, addr: &SocketAddr, deadline: i64) -> Result<()> {
    set_nonblock(fd.as_raw_fd())?;
    let (storage, len) = sockaddr_of(addr);
    let rc = unsafe {
        libc::connect(fd.as_raw_fd(), &storage as *const _ as *const libc::sockaddr, len)
    };
    if rc == 0 {
        return Ok(());
    }
    let errno = last_errno();
    if errno != libc::EINPROGRESS {
        return Err(Error::from_errno(errno));
    }
    Runtime::current().fdwait(fd.as_raw_fd(), Dir::Out, deadline)?;
    let mut err: libc::c_int = 0;
    let mut errlen = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut errlen,
        )
    };
    if rc < 0 {
        return Err(Error::from_errno(last_errno()));
    }
    if err != 0 {
        return Err(Error::from_errno(err));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    #[test]
    fn vectored_roundtrip_over_a_socketpair() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        let tx = crate::go(move || {
            write_all_vectored(&mut a, &[b"hello ", b"vectored ", b"world"], -1).unwrap();
        })
        .unwrap();
        let mut x = [0u8; 10];
        let mut y = [0u8; 10];
        let mut bufs: [&mut [u8]; 2] = [&mut x, &mut y];
        read_exact_vectored(&mut b, &mut bufs, crate::now() + 1_000).unwrap();
        assert_eq!(&x, b"hello vect");
        assert_eq!(&y, b"ored world");
        crate::hclose(tx).unwrap();
    }

    #[test]
    fn read_reports_eof_as_pipe() {
        let (a, mut b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        drop(a);
        let mut buf = [0u8; 4];
        let mut bufs: [&mut [u8]; 1] = [&mut buf];
        assert_eq!(
            read_exact_vectored(&mut b, &mut bufs, crate::now() + 1_000),
            Err(Error::Pipe)
        );
    }

    #[test]
    fn connect_to_a_dead_port_fails() {
        // Bind a listener, grab its port, close it: connecting there must
        // surface a refusal, not hang.
        let lis = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = lis.local_addr().unwrap();
        drop(lis);
        assert!(connect_tcp(&addr, crate::now() + 2_000).is_err());
    }
}
