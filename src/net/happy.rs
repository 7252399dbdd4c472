// Copyright 2026 The skein Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Happy Eyeballs (RFC 8305): race staggered TCP connect attempts across
//! address families and keep whichever wins. Built entirely from the
//! crate's own primitives: a bundle of attempt coroutines and a
//! rendezvous channel carrying the winner.

use std::net::{SocketAddr, ToSocketAddrs};

use log::debug;

use crate::error::{Error, Result};
use crate::net::tcp;
use crate::timer::now;
use crate::Handle;

/// Delay between consecutive connection attempts, per RFC 8305 §5.
const ATTEMPT_DELAY_MS: i64 = 300;

/// Interleave address families, IPv6 first, per RFC 8305 §4.
fn interleave(addrs: Vec<SocketAddr>) -> Vec<SocketAddr> {
    let mut v6: Vec<SocketAddr> = addrs.iter().copied().filter(|a| a.is_ipv6()).collect();
    let mut v4: Vec<SocketAddr> = addrs.iter().copied().filter(|a| a.is_ipv4()).collect();
    let mut out = Vec::with_capacity(addrs.len());
    loop {
        match (v6.is_empty(), v4.is_empty()) {
            (true, true) => return out,
            (false, _) => {
                out.push(v6.remove(0));
                if !v4.is_empty() {
                    out.push(v4.remove(0));
                }
            }
            (true, false) => out.push(v4.remove(0)),
        }
    }
}

/// Connect to `name:port`, racing all of the name's addresses. Returns a
/// TCP bytestream handle for the first attempt to succeed; every other
/// attempt is canceled and its socket closed.
pub fn connect(name: &str, port: u16, deadline: i64) -> Result<Handle> {
    let addrs: Vec<SocketAddr> = (name, port)
        .to_socket_addrs()
        .map_err(|_| Error::Os(libc::EADDRNOTAVAIL))?
        .collect();
    if addrs.is_empty() {
        return Err(Error::Os(libc::EADDRNOTAVAIL));
    }
    let ordered = interleave(addrs);
    debug!("happy: {} attempts for {}:{}", ordered.len(), name, port);

    let (tx, rx) = crate::chmake()?;
    let b = crate::bundle()?;
    let mut refs = Vec::with_capacity(ordered.len());
    let base = now();
    for (i, addr) in ordered.into_iter().enumerate() {
        refs.push(crate::bundle_go(b, move || {
            if i > 0 && crate::msleep(base + ATTEMPT_DELAY_MS * i as i64).is_err() {
                return;
            }
            if let Ok(h) = tcp::connect(addr, -1) {
                // A second winner finds nobody listening and cleans up
                // after itself.
                if crate::chsend(tx, &h.to_bits().to_le_bytes(), -1).is_err() {
                    let _ = crate::hclose(h);
                }
            }
        })?);
    }

    let mut buf = [0u8; 8];
    let won = crate::chrecv(rx, &mut buf, deadline);
    let _ = crate::hclose(b);
    for r in refs {
        let _ = crate::hclose(r);
    }
    let _ = crate::hclose(tx);
    let _ = crate::hclose(rx);
    won.map(|()| Handle::from_bits(u64::from_le_bytes(buf)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::tcp;
    use crate::timer::now;

    #[test]
    fn interleave_prefers_v6_and_alternates() {
        let v: Vec<SocketAddr> = vec![
            "1.1.1.1:1".parse().unwrap(),
            "2.2.2.2:1".parse().unwrap(),
            "[::1]:1".parse().unwrap(),
            "[::2]:1".parse().unwrap(),
        ];
        let out = interleave(v);
        assert!(out[0].is_ipv6());
        assert!(out[1].is_ipv4());
        assert!(out[2].is_ipv6());
        assert!(out[3].is_ipv4());
    }

    #[test]
    fn connects_to_a_local_listener() {
        let lis = tcp::listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let port = tcp::addr(lis).unwrap().port();
        let server = crate::go(move || {
            let c = tcp::accept(lis, now() + 5_000).unwrap();
            let mut buf = [0u8; 5];
            crate::brecv(c, &mut buf, now() + 5_000).unwrap();
            assert_eq!(&buf, b"happy");
            crate::hclose(c).unwrap();
        })
        .unwrap();
        let h = connect("localhost", port, now() + 5_000).unwrap();
        crate::bsend(h, b"happy", now() + 5_000).unwrap();
        crate::hclose(h).unwrap();
        crate::hclose(server).unwrap();
        crate::hclose(lis).unwrap();
    }

    #[test]
    fn reports_failure_when_nothing_listens() {
        let lis = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = lis.local_addr().unwrap().port();
        drop(lis);
        assert!(connect("127.0.0.1", port, now() + 2_000).is_err());
    }
}
