// Copyright 2026 The skein Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Errno-style failure codes shared by every blocking primitive.

use std::io;

/// The failure codes of the runtime.
///
/// Every blocking operation reports exactly one of these; none of them is
/// ever turned into a panic. `Os` carries an OS errno the runtime has no
/// better name for (e.g. `ECONNREFUSED` out of a connect).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The calling coroutine has been canceled. Sticky: once a coroutine is
    /// canceled every subsequent blocking call fails with this code.
    #[error("coroutine canceled")]
    Canceled,
    /// The deadline expired before the operation could complete.
    #[error("deadline expired")]
    TimedOut,
    /// The handle does not name a live object, or names one of the wrong kind.
    #[error("bad handle")]
    BadHandle,
    /// The resource already has a waiter or an operation in flight.
    #[error("resource busy")]
    Busy,
    /// Malformed argument; never retried.
    #[error("invalid argument")]
    InvalidArgument,
    /// The peer closed the stream, the channel was done-d, or the sending
    /// side of the object has been shut down.
    #[error("broken pipe")]
    Pipe,
    /// The receive buffer is too small for the pending message. The message
    /// is left pending; retrying with a larger buffer succeeds.
    #[error("message too long")]
    MessageSize,
    /// Stack or buffer allocation failed.
    #[error("out of memory")]
    OutOfMemory,
    /// The object does not implement the requested capability.
    #[error("not supported")]
    NotSupported,
    /// The peer violated the protocol in use on the socket.
    #[error("protocol violation")]
    Protocol,
    /// Any other OS-level error, by errno.
    #[error("os error {0}")]
    Os(i32),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof => Error::Pipe,
            io::ErrorKind::TimedOut => Error::TimedOut,
            io::ErrorKind::InvalidInput => Error::InvalidArgument,
            io::ErrorKind::OutOfMemory => Error::OutOfMemory,
            _ => Error::Os(e.raw_os_error().unwrap_or(libc::EIO)),
        }
    }
}

impl Error {
    /// Translate a raw errno from a syscall.
    pub(crate) fn from_errno(errno: i32) -> Error {
        match errno {
            libc::ECANCELED => Error::Canceled,
            libc::ETIMEDOUT => Error::TimedOut,
            libc::EBADF => Error::BadHandle,
            libc::EBUSY => Error::Busy,
            libc::EINVAL => Error::InvalidArgument,
            libc::EPIPE | libc::ECONNRESET => Error::Pipe,
            libc::EMSGSIZE => Error::MessageSize,
            libc::ENOMEM => Error::OutOfMemory,
            libc::ENOTSUP => Error::NotSupported,
            libc::EPROTO => Error::Protocol,
            e => Error::Os(e),
        }
    }
}
