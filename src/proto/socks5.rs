// Copyright 2026 The skein Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! SOCKS5 (RFC 1928, RFC 1929) message exchange over a bytestream
//! socket that is already connected to the proxy. Both roles are
//! covered: the client handshake, and the proxy-side primitives a
//! server loop needs (authenticate, receive the command, send the
//! reply). The socket itself is left alone; after a successful
//! exchange it carries the proxied stream.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use log::debug;

use crate::error::{Error, Result};
use crate::{brecv, bsend, Handle};

/// Client commands.
pub const CONNECT: u8 = 0x01;
pub const BIND: u8 = 0x02;
pub const UDP_ASSOCIATE: u8 = 0x03;

/// Server reply codes.
pub const SUCCESS: u8 = 0x00;
pub const GENERAL_FAILURE: u8 = 0x01;
pub const CONNECTION_NOT_ALLOWED: u8 = 0x02;
pub const NETWORK_UNREACHABLE: u8 = 0x03;
pub const HOST_UNREACHABLE: u8 = 0x04;
pub const CONNECTION_REFUSED: u8 = 0x05;
pub const TTL_EXPIRED: u8 = 0x06;
pub const COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

const VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_USERPASS: u8 = 0x02;
const AUTH_UNACCEPTABLE: u8 = 0xff;
const ATYP_IPV4: u8 = 0x01;
const ATYP_NAME: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// What a client asked the proxy to reach: a literal address, or a name
/// the proxy resolves itself.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Target {
    Addr(SocketAddr),
    Name(String, u16),
}

fn reply_error(code: u8) -> Error {
    match code {
        CONNECTION_NOT_ALLOWED => Error::Os(libc::EACCES),
        NETWORK_UNREACHABLE => Error::Os(libc::ENETUNREACH),
        HOST_UNREACHABLE => Error::Os(libc::EHOSTUNREACH),
        CONNECTION_REFUSED => Error::Os(libc::ECONNREFUSED),
        TTL_EXPIRED => Error::Os(libc::ETIMEDOUT),
        COMMAND_NOT_SUPPORTED | ADDRESS_TYPE_NOT_SUPPORTED => Error::NotSupported,
        _ => Error::Os(libc::EIO),
    }
}

/// `[ver, code, rsv, atyp, addr..., port]` for requests and replies.
fn encode_message(code: u8, target: &Target) -> Result<Vec<u8>> {
    let mut out = vec![VERSION, code, 0x00];
    match target {
        Target::Addr(SocketAddr::V4(a)) => {
            out.push(ATYP_IPV4);
            out.extend_from_slice(&a.ip().octets());
            out.extend_from_slice(&a.port().to_be_bytes());
        }
        Target::Addr(SocketAddr::V6(a)) => {
            out.push(ATYP_IPV6);
            out.extend_from_slice(&a.ip().octets());
            out.extend_from_slice(&a.port().to_be_bytes());
        }
        Target::Name(name, port) => {
            let nb = name.as_bytes();
            if nb.is_empty() || nb.len() > 255 {
                return Err(Error::InvalidArgument);
            }
            out.push(ATYP_NAME);
            out.push(nb.len() as u8);
            out.extend_from_slice(nb);
            out.extend_from_slice(&port.to_be_bytes());
        }
    }
    Ok(out)
}

/// Read one request or reply; returns its code byte and the address.
fn recv_message(s: Handle, deadline: i64) -> Result<(u8, Target)> {
    let mut head = [0u8; 4];
    brecv(s, &mut head, deadline)?;
    if head[0] != VERSION || head[2] != 0x00 {
        return Err(Error::Protocol);
    }
    let target = match head[3] {
        ATYP_IPV4 => {
            let mut b = [0u8; 6];
            brecv(s, &mut b, deadline)?;
            Target::Addr(SocketAddr::from((
                Ipv4Addr::new(b[0], b[1], b[2], b[3]),
                u16::from_be_bytes([b[4], b[5]]),
            )))
        }
        ATYP_IPV6 => {
            let mut b = [0u8; 18];
            brecv(s, &mut b, deadline)?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&b[..16]);
            Target::Addr(SocketAddr::from((
                Ipv6Addr::from(octets),
                u16::from_be_bytes([b[16], b[17]]),
            )))
        }
        ATYP_NAME => {
            let mut len = [0u8; 1];
            brecv(s, &mut len, deadline)?;
            let mut name = vec![0u8; len[0] as usize];
            brecv(s, &mut name, deadline)?;
            let mut port = [0u8; 2];
            brecv(s, &mut port, deadline)?;
            let name = String::from_utf8(name).map_err(|_| Error::Protocol)?;
            Target::Name(name, u16::from_be_bytes(port))
        }
        _ => return Err(Error::Protocol),
    };
    Ok((head[1], target))
}

fn valid_credentials(user: &str, pass: &str) -> bool {
    (1..=255).contains(&user.len()) && (1..=255).contains(&pass.len())
}

fn client_auth(s: Handle, auth: Option<(&str, &str)>, deadline: i64) -> Result<()> {
    let methods: &[u8] = match auth {
        Some(_) => &[AUTH_NONE, AUTH_USERPASS],
        None => &[AUTH_NONE],
    };
    let mut greeting = vec![VERSION, methods.len() as u8];
    greeting.extend_from_slice(methods);
    bsend(s, &greeting, deadline)?;
    let mut choice = [0u8; 2];
    brecv(s, &mut choice, deadline)?;
    if choice[0] != VERSION {
        return Err(Error::Protocol);
    }
    match choice[1] {
        AUTH_NONE => Ok(()),
        AUTH_USERPASS => {
            let (user, pass) = auth.ok_or(Error::Protocol)?;
            let mut msg = vec![0x01, user.len() as u8];
            msg.extend_from_slice(user.as_bytes());
            msg.push(pass.len() as u8);
            msg.extend_from_slice(pass.as_bytes());
            bsend(s, &msg, deadline)?;
            let mut status = [0u8; 2];
            brecv(s, &mut status, deadline)?;
            if status[1] != 0x00 {
                return Err(Error::Os(libc::EACCES));
            }
            Ok(())
        }
        AUTH_UNACCEPTABLE => Err(Error::Os(libc::EACCES)),
        _ => Err(Error::Protocol),
    }
}

fn client_request(s: Handle, auth: Option<(&str, &str)>, target: &Target, deadline: i64) -> Result<()> {
    if let Some((user, pass)) = auth {
        if !valid_credentials(user, pass) {
            return Err(Error::InvalidArgument);
        }
    }
    let request = encode_message(CONNECT, target)?;
    client_auth(s, auth, deadline)?;
    bsend(s, &request, deadline)?;
    let (code, _bound) = recv_message(s, deadline)?;
    if code != SUCCESS {
        return Err(reply_error(code));
    }
    debug!("socks5: proxy accepted {:?}", target);
    Ok(())
}

/// Ask the proxy on `s` to connect to `addr`. On success `s` carries
/// the proxied stream.
pub fn client_connect(
    s: Handle,
    auth: Option<(&str, &str)>,
    addr: SocketAddr,
    deadline: i64,
) -> Result<()> {
    client_request(s, auth, &Target::Addr(addr), deadline)
}

/// Like [`client_connect`], but the proxy resolves `name` itself.
pub fn client_connect_by_name(
    s: Handle,
    auth: Option<(&str, &str)>,
    name: &str,
    port: u16,
    deadline: i64,
) -> Result<()> {
    client_request(s, auth, &Target::Name(name.to_string(), port), deadline)
}

/// Proxy side of the method negotiation. With `auth` set, the client
/// must offer username/password and the callback decides; without it,
/// anonymous access is granted. Fails with `EACCES` when no acceptable
/// method exists or the credentials are rejected.
pub fn proxy_auth(
    s: Handle,
    auth: Option<&mut dyn FnMut(&str, &str) -> bool>,
    deadline: i64,
) -> Result<()> {
    let mut head = [0u8; 2];
    brecv(s, &mut head, deadline)?;
    if head[0] != VERSION || head[1] == 0 {
        return Err(Error::Protocol);
    }
    let mut methods = vec![0u8; head[1] as usize];
    brecv(s, &mut methods, deadline)?;
    match auth {
        None => {
            if !methods.contains(&AUTH_NONE) {
                bsend(s, &[VERSION, AUTH_UNACCEPTABLE], deadline)?;
                return Err(Error::Os(libc::EACCES));
            }
            bsend(s, &[VERSION, AUTH_NONE], deadline)
        }
        Some(check) => {
            if !methods.contains(&AUTH_USERPASS) {
                bsend(s, &[VERSION, AUTH_UNACCEPTABLE], deadline)?;
                return Err(Error::Os(libc::EACCES));
            }
            bsend(s, &[VERSION, AUTH_USERPASS], deadline)?;
            let mut hdr = [0u8; 2];
            brecv(s, &mut hdr, deadline)?;
            if hdr[0] != 0x01 {
                return Err(Error::Protocol);
            }
            let mut user = vec![0u8; hdr[1] as usize];
            brecv(s, &mut user, deadline)?;
            let mut plen = [0u8; 1];
            brecv(s, &mut plen, deadline)?;
            let mut pass = vec![0u8; plen[0] as usize];
            brecv(s, &mut pass, deadline)?;
            let user = String::from_utf8(user).map_err(|_| Error::Protocol)?;
            let pass = String::from_utf8(pass).map_err(|_| Error::Protocol)?;
            if check(&user, &pass) {
                debug!("socks5: authenticated {:?}", user);
                bsend(s, &[0x01, 0x00], deadline)
            } else {
                bsend(s, &[0x01, 0x01], deadline)?;
                Err(Error::Os(libc::EACCES))
            }
        }
    }
}

/// Receive the client's command and target. Runs after [`proxy_auth`].
pub fn proxy_recv_command(s: Handle, deadline: i64) -> Result<(u8, Target)> {
    let (cmd, target) = recv_message(s, deadline)?;
    if !(CONNECT..=UDP_ASSOCIATE).contains(&cmd) {
        return Err(Error::Protocol);
    }
    Ok((cmd, target))
}

/// Send the proxy's reply; `addr` is the locally bound address of the
/// outgoing connection (any address for error replies).
pub fn proxy_send_reply(s: Handle, reply: u8, addr: SocketAddr, deadline: i64) -> Result<()> {
    bsend(s, &encode_message(reply, &Target::Addr(addr))?, deadline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::ipc;
    use crate::timer::now;

    fn bound() -> SocketAddr {
        "0.0.0.0:0".parse().unwrap()
    }

    #[test]
    fn anonymous_connect_roundtrip() {
        let (c, p) = ipc::pair().unwrap();
        let target: SocketAddr = "1.2.3.4:80".parse().unwrap();
        let client = crate::go(move || {
            client_connect(c, None, target, now() + 1_000).unwrap();
            crate::bsend(c, b"proxied", now() + 1_000).unwrap();
            crate::hclose(c).unwrap();
        })
        .unwrap();
        proxy_auth(p, None, now() + 1_000).unwrap();
        let (cmd, got) = proxy_recv_command(p, now() + 1_000).unwrap();
        assert_eq!(cmd, CONNECT);
        assert_eq!(got, Target::Addr(target));
        proxy_send_reply(p, SUCCESS, bound(), now() + 1_000).unwrap();
        // The same socket now carries the stream.
        let mut buf = [0u8; 7];
        crate::brecv(p, &mut buf, now() + 1_000).unwrap();
        assert_eq!(&buf, b"proxied");
        crate::hclose(client).unwrap();
        crate::hclose(p).unwrap();
    }

    #[test]
    fn username_password_and_by_name_target() {
        let (c, p) = ipc::pair().unwrap();
        let client = crate::go(move || {
            client_connect_by_name(c, Some(("user", "secret")), "example.org", 443, now() + 1_000)
                .unwrap();
            crate::hclose(c).unwrap();
        })
        .unwrap();
        let mut check = |u: &str, pw: &str| u == "user" && pw == "secret";
        proxy_auth(p, Some(&mut check), now() + 1_000).unwrap();
        let (cmd, got) = proxy_recv_command(p, now() + 1_000).unwrap();
        assert_eq!(cmd, CONNECT);
        assert_eq!(got, Target::Name("example.org".to_string(), 443));
        proxy_send_reply(p, SUCCESS, bound(), now() + 1_000).unwrap();
        crate::hclose(client).unwrap();
        crate::hclose(p).unwrap();
    }

    #[test]
    fn rejected_credentials_fail_both_sides() {
        let (c, p) = ipc::pair().unwrap();
        let client = crate::go(move || {
            assert_eq!(
                client_connect_by_name(c, Some(("user", "wrong")), "example.org", 80, now() + 1_000),
                Err(Error::Os(libc::EACCES))
            );
            crate::hclose(c).unwrap();
        })
        .unwrap();
        let mut check = |u: &str, pw: &str| u == "user" && pw == "secret";
        assert_eq!(
            proxy_auth(p, Some(&mut check), now() + 1_000),
            Err(Error::Os(libc::EACCES))
        );
        crate::hclose(client).unwrap();
        crate::hclose(p).unwrap();
    }

    #[test]
    fn refused_reply_maps_to_econnrefused() {
        let (c, p) = ipc::pair().unwrap();
        let target: SocketAddr = "[::1]:9".parse().unwrap();
        let client = crate::go(move || {
            assert_eq!(
                client_connect(c, None, target, now() + 1_000),
                Err(Error::Os(libc::ECONNREFUSED))
            );
            crate::hclose(c).unwrap();
        })
        .unwrap();
        proxy_auth(p, None, now() + 1_000).unwrap();
        let (_, got) = proxy_recv_command(p, now() + 1_000).unwrap();
        assert_eq!(got, Target::Addr(target));
        proxy_send_reply(p, CONNECTION_REFUSED, bound(), now() + 1_000).unwrap();
        crate::hclose(client).unwrap();
        crate::hclose(p).unwrap();
    }

    #[test]
    fn oversized_name_is_invalid() {
        let (c, p) = ipc::pair().unwrap();
        let long = "x".repeat(256);
        assert_eq!(
            client_connect_by_name(c, None, &long, 80, now() + 1_000),
            Err(Error::InvalidArgument)
        );
        crate::hclose(c).unwrap();
        crate::hclose(p).unwrap();
    }
}
