// Copyright 2026 The skein Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Structured concurrency on a single thread: stackful coroutines with a
//! cooperative scheduler, unbuffered rendezvous channels with multi-way
//! selection, deadline-aware fd waiting, and a stack of composable
//! protocol sockets (TCP, IPC, UDP, framing, HTTP, SOCKS5, TCPMUX,
//! Happy Eyeballs).
//!
//! Every runtime object is named by a [`Handle`]; closing the owner
//! handle destroys the object, and for coroutines that means
//! cancellation. All blocking calls take a deadline in monotonic
//! milliseconds as returned by [`now`]: negative never expires, zero
//! means non-blocking, positive is an absolute moment.
//!
//! ```
//! use skein::{chmake, chrecv, chsend, go, hclose, now};
//!
//! let (s, r) = chmake().unwrap();
//! let h = go(move || {
//!     chsend(s, &42i64.to_ne_bytes(), -1).unwrap();
//! })
//! .unwrap();
//! let mut buf = [0u8; 8];
//! chrecv(r, &mut buf, now() + 1000).unwrap();
//! assert_eq!(i64::from_ne_bytes(buf), 42);
//! hclose(h).unwrap();
//! hclose(s).unwrap();
//! hclose(r).unwrap();
//! ```
//!
//! The runtime is strictly single-threaded: each OS thread that touches
//! the API gets its own independent instance, and no object may cross
//! threads.

mod bundle;
mod chan;
mod coroutine;
mod error;
mod fd;
mod handle;
mod poller;
mod runtime;
mod sock;
mod stack;
mod timer;

pub mod net;
pub mod proto;

use std::os::unix::io::RawFd;

pub use chan::{Chosen, Clause};
pub use error::{Error, Result};
pub use handle::Handle;
pub use sock::{
    brecv, brecvl, bsend, bsendl, mrecv, mrecvl, msend, msendl, Caps, Sock,
};
pub use stack::{DEFAULT_STACK_SIZE, MIN_STACK_SIZE};
pub use timer::now;

use runtime::{Dir, Runtime};

/// Launch `f` as a new coroutine and return its owner handle. The
/// coroutine starts running once the caller yields or blocks.
pub fn go<F>(f: F) -> Result<Handle>
where
    F: FnOnce() + 'static,
{
    Runtime::current().go(Box::new(f))
}

/// Like [`go`], but running on caller-provided stack memory, which is
/// never freed by the runtime.
///
/// # Safety
///
/// `base..base + len` must stay valid and unused by anything else for
/// the coroutine's whole lifetime.
pub unsafe fn go_mem<F>(f: F, base: *mut u8, len: usize) -> Result<Handle>
where
    F: FnOnce() + 'static,
{
    let stack = stack::Stack::from_raw(base, len)?;
    Runtime::current().go_with_stack(Box::new(f), stack)
}

/// Voluntarily give up the processor; round-robin across the ready
/// queue. Reports `Canceled` once the coroutine has been canceled.
pub fn yield_now() -> Result<()> {
    Runtime::current().yield_now()
}

/// Sleep until `deadline`. Returns `Ok` on expiry, `Canceled` if the
/// coroutine was canceled first.
pub fn msleep(deadline: i64) -> Result<()> {
    Runtime::current().msleep(deadline)
}

/// Wait until `fd` reports a readable edge. One waiter per direction;
/// a second one gets `Busy`.
pub fn fdin(fd: RawFd, deadline: i64) -> Result<()> {
    Runtime::current().fdwait(fd, Dir::In, deadline)
}

/// Wait until `fd` reports a writable edge.
pub fn fdout(fd: RawFd, deadline: i64) -> Result<()> {
    Runtime::current().fdwait(fd, Dir::Out, deadline)
}

/// Drop all runtime state attached to `fd`, evicting waiters with
/// `BadHandle`. Call before closing an fd the runtime has polled.
pub fn fdclean(fd: RawFd) {
    Runtime::current().fdclean(fd)
}

/// Transfer ownership of an object to a fresh handle, invalidating `h`.
pub fn hown(h: Handle) -> Result<Handle> {
    Runtime::current().hown(h)
}

/// Drop one reference to the object named by `h`. Closing the owner
/// reference destroys the object; for a coroutine that means canceling
/// it and waiting for it to unwind, for an adapter stack it tears down
/// everything beneath.
pub fn hclose(h: Handle) -> Result<()> {
    Runtime::current().hclose(h)
}

/// Create a bundle: a group of coroutines sharing one lifetime.
pub fn bundle() -> Result<Handle> {
    Ok(Runtime::current().bundle_make())
}

/// Launch `f` as a member of bundle `b`. The bundle owns the coroutine;
/// the returned handle is a non-owning reference to it.
pub fn bundle_go<F>(b: Handle, f: F) -> Result<Handle>
where
    F: FnOnce() + 'static,
{
    Runtime::current().bundle_go(b, Box::new(f))
}

/// Wait until every member of the bundle has finished.
pub fn bundle_wait(b: Handle, deadline: i64) -> Result<()> {
    Runtime::current().bundle_wait(b, deadline)
}

/// Create an unbuffered channel; both returned handles refer to the same
/// object and either may send or receive.
pub fn chmake() -> Result<(Handle, Handle)> {
    Ok(Runtime::current().chmake())
}

/// Send `buf` on the channel, blocking until a receiver takes it.
pub fn chsend(ch: Handle, buf: &[u8], deadline: i64) -> Result<()> {
    Runtime::current().chsend(ch, buf, deadline)
}

/// Receive into `buf`, blocking until a sender provides exactly
/// `buf.len()` bytes. A length mismatch fails both peers with
/// `InvalidArgument`.
pub fn chrecv(ch: Handle, buf: &mut [u8], deadline: i64) -> Result<()> {
    Runtime::current().chrecv(ch, buf, deadline)
}

/// Close the channel for further communication: queued and future peers
/// fail with `Pipe`. A second call reports `Pipe` as well.
pub fn chdone(ch: Handle) -> Result<()> {
    Runtime::current().chdone(ch)
}

/// Wait on several send/receive clauses at once; the first satisfiable
/// one fires. Ties among immediately ready clauses are broken uniformly
/// at random (fair, not cryptographically so). With deadline 0 the call
/// polls: `TimedOut` when nothing is ready.
pub fn choose(clauses: &mut [Clause<'_>], deadline: i64) -> Result<Chosen> {
    Runtime::current().choose(clauses, deadline)
}
