// Copyright 2026 The skein Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! TCPMUX (RFC 1078): many services behind one TCP port, selected by a
//! service-name line. A connecting client sends `service CRLF`; the
//! listener answers `+` and hands the connection over, or `-` and drops
//! it. The listener here serves one service name in-process; the
//! original's standalone mux daemon hands sockets between processes,
//! which needs Unix fd passing and is out of scope.

use std::any::Any;
use std::net::SocketAddr;

use log::debug;

use crate::error::{Error, Result};
use crate::net::tcp;
use crate::runtime::Runtime;
use crate::sock::{Caps, Sock};
use crate::Handle;

const MAX_LINE: usize = 256;

struct MuxListener {
    lis: Handle,
    service: String,
}

impl Sock for MuxListener {
    fn caps(&self) -> Caps {
        Caps::default()
    }

    fn close(&mut self) {
        let _ = crate::hclose(self.lis);
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

fn valid_service(service: &str) -> bool {
    !service.is_empty()
        && service.len() <= 255
        && service.bytes().all(|b| b.is_ascii_graphic() || b == b' ')
}

fn recv_line(conn: Handle, deadline: i64) -> Result<String> {
    let mut line: Vec<u8> = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        crate::brecv(conn, &mut byte, deadline)?;
        line.push(byte[0]);
        if line.ends_with(b"\r\n") {
            line.truncate(line.len() - 2);
            return String::from_utf8(line).map_err(|_| Error::Protocol);
        }
        if line.len() > MAX_LINE {
            return Err(Error::Protocol);
        }
    }
}

/// Listen on `addr` for one multiplexed service. Service names compare
/// case-insensitively, per the RFC.
pub fn listen(addr: SocketAddr, service: &str) -> Result<Handle> {
    if !valid_service(service) {
        return Err(Error::InvalidArgument);
    }
    let lis = tcp::listen(addr)?;
    debug!("tcpmux: listening for service {:?}", service);
    Ok(Runtime::current().insert_sock(Box::new(MuxListener {
        lis,
        service: service.to_string(),
    })))
}

/// The listener's effective local address.
pub fn addr(h: Handle) -> Result<SocketAddr> {
    let rt = Runtime::current();
    let mut s = rt.checkout_sock(h)?;
    let r = match s.as_any().downcast_mut::<MuxListener>() {
        Some(m) => tcp::addr(m.lis),
        None => Err(Error::NotSupported),
    };
    Runtime::current().checkin_sock(h, s);
    r
}

/// Accept one connection that asked for this listener's service.
/// Connections asking for anything else get the negative reply and are
/// dropped; the accept keeps waiting within the deadline.
pub fn accept(h: Handle, deadline: i64) -> Result<Handle> {
    let rt = Runtime::current();
    rt.check_cancel()?;
    let mut s = rt.checkout_sock(h)?;
    let r = (|| {
        let mux = match s.as_any().downcast_mut::<MuxListener>() {
            Some(m) => m,
            None => return Err(Error::NotSupported),
        };
        loop {
            let conn = tcp::accept(mux.lis, deadline)?;
            match recv_line(conn, deadline) {
                Ok(service) if service.eq_ignore_ascii_case(&mux.service) => {
                    if let Err(e) = crate::bsend(conn, b"+\r\n", deadline) {
                        let _ = crate::hclose(conn);
                        return Err(e);
                    }
                    debug!("tcpmux: accepted connection for {:?}", service);
                    return Ok(conn);
                }
                Ok(service) => {
                    debug!("tcpmux: turning away request for {:?}", service);
                    let _ = crate::bsend(conn, b"-service not available\r\n", deadline);
                    let _ = crate::hclose(conn);
                }
                Err(e @ (Error::TimedOut | Error::Canceled)) => {
                    let _ = crate::hclose(conn);
                    return Err(e);
                }
                Err(_) => {
                    // Malformed greeting; drop it and keep listening.
                    let _ = crate::hclose(conn);
                }
            }
        }
    })();
    Runtime::current().checkin_sock(h, s);
    r
}

/// Connect to `service` behind the mux at `addr`. Returns the TCP
/// bytestream once the listener says `+`; a `-` reply surfaces as
/// `ECONNREFUSED`.
pub fn connect(addr: SocketAddr, service: &str, deadline: i64) -> Result<Handle> {
    if !valid_service(service) {
        return Err(Error::InvalidArgument);
    }
    let conn = tcp::connect(addr, deadline)?;
    let mut request = Vec::with_capacity(service.len() + 2);
    request.extend_from_slice(service.as_bytes());
    request.extend_from_slice(b"\r\n");
    let outcome = (|| {
        crate::bsend(conn, &request, deadline)?;
        let reply = recv_line(conn, deadline)?;
        match reply.as_bytes().first() {
            Some(b'+') => Ok(()),
            Some(b'-') => Err(Error::Os(libc::ECONNREFUSED)),
            _ => Err(Error::Protocol),
        }
    })();
    match outcome {
        Ok(()) => {
            debug!("tcpmux: connected to service {:?}", service);
            Ok(conn)
        }
        Err(e) => {
            let _ = crate::hclose(conn);
            Err(e)
        }
    }
}
