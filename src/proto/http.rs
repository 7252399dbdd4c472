// Copyright 2026 The skein Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! HTTP/1.1 start-line and header exchange over any bytestream. The
//! adapter is line-oriented: it stacks CRLF delimiter framing on the
//! underlier and parses the pieces, leaving bodies to the caller (who
//! can `detach` and read them off the returned bytestream).

use std::any::Any;

use log::debug;

use crate::error::{Error, Result};
use crate::proto::suffix::SuffixSock;
use crate::runtime::Runtime;
use crate::sock::{Caps, Sock};
use crate::Handle;

const MAX_LINE: usize = 4096;

struct HttpSock {
    lines: SuffixSock,
}

impl HttpSock {
    fn send_line(&mut self, line: &str, deadline: i64) -> Result<()> {
        self.lines.msendl(&[line.as_bytes()], deadline)
    }

    fn recv_line(&mut self, deadline: i64) -> Result<String> {
        let mut buf = vec![0u8; MAX_LINE];
        let n = {
            let mut dst = [&mut buf[..]];
            self.lines.mrecvl(&mut dst, deadline)?
        };
        buf.truncate(n);
        String::from_utf8(buf).map_err(|_| Error::Protocol)
    }
}

impl Sock for HttpSock {
    fn caps(&self) -> Caps {
        Caps::default()
    }

    fn done(&mut self, deadline: i64) -> Result<()> {
        // A blank line ends the header block.
        self.send_line("", deadline)
    }

    fn close(&mut self) {
        self.lines.close();
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
        })
}

fn with_http<T>(h: Handle, f: impl FnOnce(&mut HttpSock) -> Result<T>) -> Result<T> {
    let rt = Runtime::current();
    rt.check_cancel()?;
    let mut s = rt.checkout_sock(h)?;
    let r = match s.as_any().downcast_mut::<HttpSock>() {
        Some(hs) => f(hs),
        None => Err(Error::NotSupported),
    };
    Runtime::current().checkin_sock(h, s);
    r
}

/// Layer HTTP/1.1 exchange over a bytestream socket, taking ownership of
/// it.
pub fn attach(h: Handle) -> Result<Handle> {
    crate::sock::require_caps(h, true, false)?;
    let rt = Runtime::current();
    let under = rt.take_sock(h)?;
    debug!("http: attached");
    Ok(rt.insert_sock(Box::new(HttpSock { lines: SuffixSock::new(under, b"\r\n") })))
}

/// Return the underlying bytestream, e.g. to transfer a body after the
/// headers were exchanged.
pub fn detach(h: Handle, _deadline: i64) -> Result<Handle> {
    let rt = Runtime::current();
    let mut s = rt.checkout_sock(h)?;
    if !s.as_any().is::<HttpSock>() {
        Runtime::current().checkin_sock(h, s);
        return Err(Error::NotSupported);
    }
    Runtime::current().discard_sock_entry(h);
    let sock = match s.into_any().downcast::<HttpSock>() {
        Ok(b) => b,
        Err(_) => unreachable!(),
    };
    debug!("http: detached");
    Ok(Runtime::current().insert_sock(sock.lines.into_inner()))
}

/// End the header block with a blank line.
pub fn done(h: Handle, deadline: i64) -> Result<()> {
    crate::sock::sock_done(h, deadline)
}

/// Send `"<command> <resource> HTTP/1.1"`.
pub fn send_request(h: Handle, command: &str, resource: &str, deadline: i64) -> Result<()> {
    if !is_token(command) || resource.is_empty() || resource.contains(|c: char| c.is_whitespace()) {
        return Err(Error::InvalidArgument);
    }
    with_http(h, |s| s.send_line(&format!("{} {} HTTP/1.1", command, resource), deadline))
}

/// Receive the peer's request line as `(command, resource)`.
pub fn recv_request(h: Handle, deadline: i64) -> Result<(String, String)> {
    with_http(h, |s| {
        let line = s.recv_line(deadline)?;
        let mut parts = line.split(' ');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(cmd), Some(res), Some("HTTP/1.1"), None) if is_token(cmd) => {
                Ok((cmd.to_string(), res.to_string()))
            }
            _ => Err(Error::Protocol),
        }
    })
}

/// Send `"HTTP/1.1 <status> <reason>"`.
pub fn send_status(h: Handle, status: u16, reason: &str, deadline: i64) -> Result<()> {
    if !(100..=599).contains(&status) || reason.contains(['\r', '\n']) {
        return Err(Error::InvalidArgument);
    }
    with_http(h, |s| s.send_line(&format!("HTTP/1.1 {} {}", status, reason), deadline))
}

/// Receive the peer's status line as `(status, reason)`.
pub fn recv_status(h: Handle, deadline: i64) -> Result<(u16, String)> {
    with_http(h, |s| {
        let line = s.recv_line(deadline)?;
        let mut parts = line.splitn(3, ' ');
        let proto = parts.next().unwrap_or("");
        if !proto.starts_with("HTTP/1.") {
            return Err(Error::Protocol);
        }
        let status: u16 = parts.next().unwrap_or("").parse().map_err(|_| Error::Protocol)?;
        if !(100..=599).contains(&status) {
            return Err(Error::Protocol);
        }
        Ok((status, parts.next().unwrap_or("").to_string()))
    })
}

/// Send one `"Name: value"` header field.
pub fn send_field(h: Handle, name: &str, value: &str, deadline: i64) -> Result<()> {
    if !is_token(name) || value.contains(['\r', '\n']) {
        return Err(Error::InvalidArgument);
    }
    with_http(h, |s| s.send_line(&format!("{}: {}", name, value.trim()), deadline))
}

/// Receive one header field. The blank line ending the block reports
/// `Pipe`.
pub fn recv_field(h: Handle, deadline: i64) -> Result<(String, String)> {
    with_http(h, |s| {
        let line = s.recv_line(deadline)?;
        if line.is_empty() {
            return Err(Error::Pipe);
        }
        let (name, value) = line.split_once(':').ok_or(Error::Protocol)?;
        if !is_token(name) {
            return Err(Error::Protocol);
        }
        Ok((name.to_string(), value.trim().to_string()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::ipc;
    use crate::timer::now;

    fn http_pair() -> (Handle, Handle) {
        let (a, b) = ipc::pair().unwrap();
        (attach(a).unwrap(), attach(b).unwrap())
    }

    #[test]
    fn request_and_response_exchange() {
        let (client, server) = http_pair();
        let h = crate::go(move || {
            send_request(client, "GET", "/index.html", now() + 1_000).unwrap();
            send_field(client, "Host", "example.org", now() + 1_000).unwrap();
            done(client, now() + 1_000).unwrap();
            let (status, reason) = recv_status(client, now() + 1_000).unwrap();
            assert_eq!(status, 200);
            assert_eq!(reason, "OK");
            let (name, value) = recv_field(client, now() + 1_000).unwrap();
            assert_eq!((name.as_str(), value.as_str()), ("Content-Length", "0"));
            assert_eq!(recv_field(client, now() + 1_000), Err(Error::Pipe));
            crate::hclose(client).unwrap();
        })
        .unwrap();
        let (cmd, resource) = recv_request(server, now() + 1_000).unwrap();
        assert_eq!((cmd.as_str(), resource.as_str()), ("GET", "/index.html"));
        let (name, value) = recv_field(server, now() + 1_000).unwrap();
        assert_eq!((name.as_str(), value.as_str()), ("Host", "example.org"));
        assert_eq!(recv_field(server, now() + 1_000), Err(Error::Pipe));
        send_status(server, 200, "OK", now() + 1_000).unwrap();
        send_field(server, "Content-Length", "0", now() + 1_000).unwrap();
        done(server, now() + 1_000).unwrap();
        crate::hclose(h).unwrap();
        crate::hclose(server).unwrap();
    }

    #[test]
    fn malformed_request_line_is_a_protocol_error() {
        let (raw, server) = ipc::pair().unwrap();
        let server = attach(server).unwrap();
        let h = crate::go(move || {
            crate::bsend(raw, b"not http at all\r\n", now() + 1_000).unwrap();
            crate::hclose(raw).unwrap();
        })
        .unwrap();
        assert_eq!(recv_request(server, now() + 1_000), Err(Error::Protocol));
        crate::hclose(h).unwrap();
        crate::hclose(server).unwrap();
    }

    #[test]
    fn field_names_are_validated() {
        let (client, server) = http_pair();
        assert_eq!(
            send_field(client, "Bad Name", "v", now() + 1_000),
            Err(Error::InvalidArgument)
        );
        assert_eq!(
            send_request(client, "GET", "/a b", now() + 1_000),
            Err(Error::InvalidArgument)
        );
        crate::hclose(client).unwrap();
        crate::hclose(server).unwrap();
    }

    #[test]
    fn detach_hands_back_the_bytestream() {
        let (client, server) = http_pair();
        let h = crate::go(move || {
            send_request(client, "PUT", "/data", now() + 1_000).unwrap();
            done(client, now() + 1_000).unwrap();
            let body = detach(client, now() + 1_000).unwrap();
            crate::bsend(body, b"0123", now() + 1_000).unwrap();
            crate::hclose(body).unwrap();
        })
        .unwrap();
        recv_request(server, now() + 1_000).unwrap();
        assert_eq!(recv_field(server, now() + 1_000), Err(Error::Pipe));
        let body = detach(server, now() + 1_000).unwrap();
        let mut buf = [0u8; 4];
        crate::brecv(body, &mut buf, now() + 1_000).unwrap();
        assert_eq!(&buf, b"0123");
        crate::hclose(h).unwrap();
        crate::hclose(body).unwrap();
    }
}
