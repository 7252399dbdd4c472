// Copyright 2026 The skein Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Unbuffered rendezvous channels and multi-way selection.
//!
//! A channel never stores data: a send and a receive meet, the bytes are
//! copied straight from the sender's buffer into the receiver's, and both
//! continue. `choose` waits on any number of send/receive clauses at
//! once; ties among immediately ready clauses are broken uniformly at
//! random (fair, not cryptographic).

use std::collections::VecDeque;
use std::ptr;

use log::trace;
use rand::Rng;

use crate::error::{Error, Result};
use crate::handle::Object;
use crate::runtime::{ChanId, CoroId, Runtime, Wake, WaitSet};
use crate::Handle;

/// One arm of a `choose` call.
pub enum Clause<'a> {
    /// Offer `len` bytes to a receiver on this channel.
    Send(Handle, &'a [u8]),
    /// Take a message from a sender on this channel.
    Recv(Handle, &'a mut [u8]),
}

/// Outcome of `choose`: which clause fired, and the error the underlying
/// operation completed with, if any. A clause on a channel that was
/// `chdone`-d wins with `error == Some(Error::Pipe)`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Chosen {
    pub index: usize,
    pub error: Option<Error>,
}

/// A suspended clause: who waits, which clause of theirs this is, and
/// where their bytes live. The buffer stays valid for as long as the
/// owner is suspended, which is exactly as long as the record is queued.
struct ClauseRec {
    coro: CoroId,
    index: usize,
    buf: *mut u8,
    len: usize,
}

pub(crate) struct Chan {
    pub(crate) gen: u32,
    refs: u32,
    done: bool,
    sendq: VecDeque<ClauseRec>,
    recvq: VecDeque<ClauseRec>,
}

struct Resolved {
    id: ChanId,
    send: bool,
    buf: *mut u8,
    len: usize,
}

impl Runtime {
    pub(crate) fn chmake(&mut self) -> (Handle, Handle) {
        let gen = self.fresh_gen();
        let slot = self.chans.insert(Chan {
            gen,
            refs: 2,
            done: false,
            sendq: VecDeque::new(),
            recvq: VecDeque::new(),
        }) as u32;
        let id = ChanId { slot, gen };
        trace!("channel {}: created", slot);
        (
            self.table.insert(Object::Chan(id), true),
            self.table.insert(Object::Chan(id), true),
        )
    }

    fn chan_resolve(&self, h: Handle) -> Result<ChanId> {
        match &self.table.get(h)?.obj {
            Some(Object::Chan(id)) => Ok(*id),
            _ => Err(Error::BadHandle),
        }
    }

    fn chan(&self, id: ChanId) -> &Chan {
        let c = &self.chans[id.slot as usize];
        debug_assert_eq!(c.gen, id.gen);
        c
    }

    fn chan_mut(&mut self, id: ChanId) -> &mut Chan {
        let c = &mut self.chans[id.slot as usize];
        debug_assert_eq!(c.gen, id.gen);
        c
    }

    /// Remove every clause `coro` has queued on `id`. Tolerates channels
    /// that are already gone.
    pub(crate) fn chan_unlink_clauses(&mut self, id: ChanId, coro: CoroId) {
        if let Some(c) = self.chans.get_mut(id.slot as usize) {
            if c.gen == id.gen {
                c.sendq.retain(|cl| cl.coro != coro);
                c.recvq.retain(|cl| cl.coro != coro);
            }
        }
    }

    /// One endpoint handle closed. The object dies with its last handle,
    /// failing whoever is still queued on it.
    pub(crate) fn chan_unref(&mut self, id: ChanId) {
        let c = self.chan_mut(id);
        c.refs -= 1;
        if c.refs > 0 {
            return;
        }
        let mut pending: Vec<ClauseRec> = c.sendq.drain(..).collect();
        pending.extend(c.recvq.drain(..));
        self.chans.remove(id.slot as usize);
        trace!("channel {}: destroyed", id.slot);
        for cl in pending {
            self.wake(cl.coro, Wake::Chosen { index: cl.index, error: Some(Error::Pipe) });
        }
    }

    pub(crate) fn chdone(&mut self, h: Handle) -> Result<()> {
        let id = self.chan_resolve(h)?;
        let c = self.chan_mut(id);
        if c.done {
            return Err(Error::Pipe);
        }
        c.done = true;
        trace!("channel {}: done", id.slot);
        let mut pending: Vec<ClauseRec> = c.sendq.drain(..).collect();
        pending.extend(c.recvq.drain(..));
        for cl in pending {
            self.wake(cl.coro, Wake::Chosen { index: cl.index, error: Some(Error::Pipe) });
        }
        Ok(())
    }

    pub(crate) fn chsend(&mut self, h: Handle, buf: &[u8], deadline: i64) -> Result<()> {
        let mut clauses = [Clause::Send(h, buf)];
        match self.choose(&mut clauses, deadline)? {
            Chosen { error: None, .. } => Ok(()),
            Chosen { error: Some(e), .. } => Err(e),
        }
    }

    pub(crate) fn chrecv(&mut self, h: Handle, buf: &mut [u8], deadline: i64) -> Result<()> {
        let mut clauses = [Clause::Recv(h, buf)];
        match self.choose(&mut clauses, deadline)? {
            Chosen { error: None, .. } => Ok(()),
            Chosen { error: Some(e), .. } => Err(e),
        }
    }

    pub(crate) fn choose(&mut self, clauses: &mut [Clause<'_>], deadline: i64) -> Result<Chosen> {
        self.check_cancel()?;
        let mut rs = Vec::with_capacity(clauses.len());
        for cl in clauses.iter_mut() {
            rs.push(match cl {
                Clause::Send(h, buf) => Resolved {
                    id: self.chan_resolve(*h)?,
                    send: true,
                    buf: buf.as_ptr() as *mut u8,
                    len: buf.len(),
                },
                Clause::Recv(h, buf) => Resolved {
                    id: self.chan_resolve(*h)?,
                    send: false,
                    buf: buf.as_mut_ptr(),
                    len: buf.len(),
                },
            });
        }
        // A send and a receive on the same channel in one call could pair
        // with each other and would break the one-empty-queue invariant.
        for i in 0..rs.len() {
            for j in i + 1..rs.len() {
                if rs[i].id == rs[j].id && rs[i].send != rs[j].send {
                    return Err(Error::InvalidArgument);
                }
            }
        }

        let mut ready = Vec::new();
        for (i, r) in rs.iter().enumerate() {
            let c = self.chan(r.id);
            let satisfiable = c.done
                || (r.send && !c.recvq.is_empty())
                || (!r.send && !c.sendq.is_empty());
            if satisfiable {
                ready.push(i);
            }
        }
        if !ready.is_empty() {
            let pick = ready[self.rng.gen_range(0..ready.len())];
            let r = &rs[pick];
            return Ok(self.fire_immediate(pick, r.id, r.send, r.buf, r.len));
        }
        if deadline == 0 {
            return Err(Error::TimedOut);
        }

        let me = self.current;
        let mut chans = Vec::with_capacity(rs.len());
        for (i, r) in rs.iter().enumerate() {
            let rec = ClauseRec { coro: me, index: i, buf: r.buf, len: r.len };
            let c = self.chan_mut(r.id);
            if r.send {
                c.sendq.push_back(rec);
            } else {
                c.recvq.push_back(rec);
            }
            chans.push(r.id);
        }
        match self.suspend(WaitSet::Choose(chans), deadline) {
            Wake::Chosen { index, error } => Ok(Chosen { index, error }),
            Wake::Timeout => Err(Error::TimedOut),
            Wake::Canceled => Err(Error::Canceled),
            w => unreachable!("choose woken with {:?}", w),
        }
    }

    /// Complete a clause against a peer that is already queued. The peer
    /// is woken; the caller continues without suspending.
    fn fire_immediate(
        &mut self,
        index: usize,
        id: ChanId,
        send: bool,
        buf: *mut u8,
        len: usize,
    ) -> Chosen {
        if self.chan(id).done {
            return Chosen { index, error: Some(Error::Pipe) };
        }
        let peer = if send {
            self.chan_mut(id).recvq.pop_front()
        } else {
            self.chan_mut(id).sendq.pop_front()
        }
        .expect("satisfiable clause lost its peer");
        if peer.len != len {
            // Length mismatch fails both sides.
            self.wake(
                peer.coro,
                Wake::Chosen { index: peer.index, error: Some(Error::InvalidArgument) },
            );
            return Chosen { index, error: Some(Error::InvalidArgument) };
        }
        if len > 0 {
            unsafe {
                if send {
                    ptr::copy_nonoverlapping(buf as *const u8, peer.buf, len);
                } else {
                    ptr::copy_nonoverlapping(peer.buf as *const u8, buf, len);
                }
            }
        }
        self.wake(peer.coro, Wake::Chosen { index: peer.index, error: None });
        Chosen { index, error: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::now;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn rendezvous_roundtrip() {
        let (a, b) = crate::chmake().unwrap();
        let h = crate::go(move || {
            crate::chsend(a, &42i64.to_ne_bytes(), -1).unwrap();
        })
        .unwrap();
        let mut buf = [0u8; 8];
        crate::chrecv(b, &mut buf, now() + 1_000).unwrap();
        assert_eq!(i64::from_ne_bytes(buf), 42);
        crate::hclose(h).unwrap();
        crate::hclose(a).unwrap();
        crate::hclose(b).unwrap();
    }

    #[test]
    fn either_end_may_send() {
        let (a, b) = crate::chmake().unwrap();
        let h = crate::go(move || {
            let mut buf = [0u8; 1];
            crate::chrecv(a, &mut buf, -1).unwrap();
            assert_eq!(buf[0], 7);
        })
        .unwrap();
        crate::chsend(b, &[7], now() + 1_000).unwrap();
        crate::hclose(h).unwrap();
        crate::hclose(a).unwrap();
        crate::hclose(b).unwrap();
    }

    #[test]
    fn send_times_out_without_a_receiver() {
        let (a, b) = crate::chmake().unwrap();
        let start = now();
        assert_eq!(crate::chsend(a, &[1, 2, 3, 4], start + 50), Err(crate::Error::TimedOut));
        assert!(now() - start >= 50);
        // The channel stays usable afterwards.
        let h = crate::go(move || {
            let mut buf = [0u8; 4];
            crate::chrecv(b, &mut buf, -1).unwrap();
            assert_eq!(buf, [1, 2, 3, 4]);
        })
        .unwrap();
        crate::chsend(a, &[1, 2, 3, 4], now() + 1_000).unwrap();
        crate::hclose(h).unwrap();
        crate::hclose(a).unwrap();
        crate::hclose(b).unwrap();
    }

    #[test]
    fn zero_deadline_polls() {
        let (a, b) = crate::chmake().unwrap();
        assert_eq!(crate::chsend(a, &[0], 0), Err(crate::Error::TimedOut));
        assert_eq!(crate::chrecv(a, &mut [0], 0), Err(crate::Error::TimedOut));
        crate::hclose(a).unwrap();
        crate::hclose(b).unwrap();
    }

    #[test]
    fn length_mismatch_fails_both_sides() {
        let (a, b) = crate::chmake().unwrap();
        let peer = Rc::new(Cell::new(None));
        let p = peer.clone();
        let h = crate::go(move || {
            let mut buf = [0u8; 2];
            p.set(Some(crate::chrecv(a, &mut buf, -1)));
        })
        .unwrap();
        crate::yield_now().unwrap();
        assert_eq!(crate::chsend(b, &[0u8; 3], -1), Err(crate::Error::InvalidArgument));
        crate::yield_now().unwrap();
        assert_eq!(peer.get(), Some(Err(crate::Error::InvalidArgument)));
        crate::hclose(h).unwrap();
        crate::hclose(a).unwrap();
        crate::hclose(b).unwrap();
    }

    #[test]
    fn chdone_fails_queued_and_future_peers() {
        let (a, b) = crate::chmake().unwrap();
        let blocked = Rc::new(Cell::new(None));
        let obs = blocked.clone();
        let h = crate::go(move || {
            obs.set(Some(crate::chsend(a, &[9], -1)));
        })
        .unwrap();
        crate::yield_now().unwrap();
        crate::chdone(b).unwrap();
        crate::yield_now().unwrap();
        assert_eq!(blocked.get(), Some(Err(crate::Error::Pipe)));
        assert_eq!(crate::chsend(b, &[9], -1), Err(crate::Error::Pipe));
        assert_eq!(crate::chrecv(b, &mut [0], -1), Err(crate::Error::Pipe));
        // Done is not idempotent: the second call reports the pipe.
        assert_eq!(crate::chdone(b), Err(crate::Error::Pipe));
        crate::hclose(h).unwrap();
        crate::hclose(a).unwrap();
        crate::hclose(b).unwrap();
    }

    #[test]
    fn closing_the_last_handle_fails_blocked_peers() {
        let (a, b) = crate::chmake().unwrap();
        let blocked = Rc::new(Cell::new(None));
        let obs = blocked.clone();
        let h = crate::go(move || {
            obs.set(Some(crate::chrecv(a, &mut [0u8; 1], -1)));
        })
        .unwrap();
        crate::yield_now().unwrap();
        crate::hclose(a).unwrap();
        assert!(blocked.get().is_none());
        crate::hclose(b).unwrap();
        crate::yield_now().unwrap();
        assert_eq!(blocked.get(), Some(Err(crate::Error::Pipe)));
        crate::hclose(h).unwrap();
    }

    #[test]
    fn choose_takes_the_ready_clause() {
        let (a1, _b1) = crate::chmake().unwrap();
        let (a2, b2) = crate::chmake().unwrap();
        let h = crate::go(move || {
            crate::chsend(b2, &[5], -1).unwrap();
        })
        .unwrap();
        crate::yield_now().unwrap();
        let mut m1 = [0u8; 1];
        let mut m2 = [0u8; 1];
        let mut clauses = [Clause::Recv(a1, &mut m1), Clause::Recv(a2, &mut m2)];
        let won = crate::choose(&mut clauses, now() + 1_000).unwrap();
        assert_eq!(won, Chosen { index: 1, error: None });
        assert_eq!(m2[0], 5);
        crate::hclose(h).unwrap();
    }

    #[test]
    fn choose_done_clause_wins_with_pipe() {
        let (a, b) = crate::chmake().unwrap();
        crate::chdone(b).unwrap();
        let mut m = [0u8; 1];
        let mut clauses = [Clause::Recv(a, &mut m)];
        let won = crate::choose(&mut clauses, -1).unwrap();
        assert_eq!(won, Chosen { index: 0, error: Some(crate::Error::Pipe) });
        crate::hclose(a).unwrap();
        crate::hclose(b).unwrap();
    }

    #[test]
    fn choose_rejects_send_and_recv_on_one_channel() {
        let (a, b) = crate::chmake().unwrap();
        let mut m = [0u8; 1];
        let mut clauses = [Clause::Send(a, &[1]), Clause::Recv(b, &mut m)];
        assert_eq!(crate::choose(&mut clauses, -1), Err(crate::Error::InvalidArgument));
        crate::hclose(a).unwrap();
        crate::hclose(b).unwrap();
    }

    #[test]
    fn selection_is_roughly_fair() {
        const ROUNDS: usize = 300;
        let (a1, b1) = crate::chmake().unwrap();
        let (a2, b2) = crate::chmake().unwrap();
        let (a3, b3) = crate::chmake().unwrap();
        let h = crate::go(move || {
            for _ in 0..ROUNDS {
                let mut clauses = [
                    Clause::Send(b1, &[1]),
                    Clause::Send(b2, &[2]),
                    Clause::Send(b3, &[3]),
                ];
                // All three receivers are queued; the pick is random.
                let won = crate::choose(&mut clauses, -1).unwrap();
                assert!(won.error.is_none());
            }
        })
        .unwrap();
        let mut counts = [0usize; 3];
        for _ in 0..ROUNDS {
            let mut m1 = [0u8; 1];
            let mut m2 = [0u8; 1];
            let mut m3 = [0u8; 1];
            let mut clauses = [
                Clause::Recv(a1, &mut m1),
                Clause::Recv(a2, &mut m2),
                Clause::Recv(a3, &mut m3),
            ];
            let won = crate::choose(&mut clauses, now() + 5_000).unwrap();
            assert!(won.error.is_none());
            counts[won.index] += 1;
        }
        crate::hclose(h).unwrap();
        for &c in &counts {
            // Each of the K=3 clauses must win Omega(N/K) of N rounds.
            assert!(c >= ROUNDS / 12, "unfair selection: {:?}", counts);
        }
        for h in [a1, b1, a2, b2, a3, b3] {
            crate::hclose(h).unwrap();
        }
    }
}
