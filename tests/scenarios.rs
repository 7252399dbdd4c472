// Copyright 2026 The skein Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! End-to-end behavior of the runtime as a whole: coroutines, channels,
//! bundles, deadlines and adapter stacking working together.

use std::cell::Cell;
use std::rc::Rc;

use skein::{
    bundle, bundle_go, bundle_wait, chmake, choose, chrecv, chsend, go, hclose, mrecv, msend,
    msleep, now, yield_now, Chosen, Clause, Error,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn send_and_receive_an_integer() {
    init_logging();
    let (s, r) = chmake().unwrap();
    let sender = go(move || {
        chsend(s, &42i64.to_ne_bytes(), -1).unwrap();
    })
    .unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(chrecv(r, &mut buf, now() + 1_000), Ok(()));
    assert_eq!(i64::from_ne_bytes(buf), 42);
    hclose(sender).unwrap();
    hclose(s).unwrap();
    hclose(r).unwrap();
}

#[test]
fn unmatched_send_times_out_and_the_channel_survives() {
    init_logging();
    let (s, r) = chmake().unwrap();
    let start = now();
    assert_eq!(chsend(s, &[0u8; 4], start + 100), Err(Error::TimedOut));
    assert!(now() - start >= 100);
    let receiver = go(move || {
        let mut buf = [0u8; 4];
        chrecv(r, &mut buf, -1).unwrap();
        assert_eq!(buf, [9, 9, 9, 9]);
    })
    .unwrap();
    chsend(s, &[9, 9, 9, 9], now() + 1_000).unwrap();
    hclose(receiver).unwrap();
    hclose(s).unwrap();
    hclose(r).unwrap();
}

#[test]
fn closing_a_sleeper_cancels_it_promptly() {
    init_logging();
    let outcome = Rc::new(Cell::new(None));
    let seen = outcome.clone();
    let h = go(move || {
        seen.set(Some(msleep(now() + 10_000)));
    })
    .unwrap();
    // Let the coroutine reach its sleep.
    msleep(now() + 10).unwrap();
    let start = now();
    hclose(h).unwrap();
    assert!(now() - start < 100, "cancellation should be prompt");
    assert_eq!(outcome.get(), Some(Err(Error::Canceled)));
}

#[test]
fn bundle_collects_yielding_workers() {
    init_logging();
    let yields = Rc::new(Cell::new(0u32));
    let b = bundle().unwrap();
    for _ in 0..3 {
        let yields = yields.clone();
        bundle_go(b, move || {
            for _ in 0..5 {
                yields.set(yields.get() + 1);
                yield_now().unwrap();
            }
        })
        .unwrap();
    }
    assert_eq!(bundle_wait(b, now() + 1_000), Ok(()));
    assert!(yields.get() >= 15);
    hclose(b).unwrap();
}

#[test]
fn choose_picks_the_channel_that_speaks() {
    init_logging();
    let (s1, r1) = chmake().unwrap();
    let (s2, r2) = chmake().unwrap();
    let (s3, r3) = chmake().unwrap();
    let producer = go(move || {
        msleep(now() + 50).unwrap();
        chsend(s2, &[7], -1).unwrap();
    })
    .unwrap();
    let mut b1 = [0u8; 1];
    let mut b2 = [0u8; 1];
    let mut b3 = [0u8; 1];
    let mut clauses = [
        Clause::Recv(r1, &mut b1),
        Clause::Recv(r2, &mut b2),
        Clause::Recv(r3, &mut b3),
    ];
    let won = choose(&mut clauses, now() + 1_000).unwrap();
    assert_eq!(won, Chosen { index: 1, error: None });
    assert_eq!(b2[0], 7);
    hclose(producer).unwrap();
    for h in [s1, r1, s2, r2, s3, r3] {
        hclose(h).unwrap();
    }
}

#[test]
fn prefix_framing_over_an_ipc_pair_stacks_and_unstacks() {
    init_logging();
    let (raw_a, raw_b) = skein::net::ipc::pair().unwrap();
    let a = skein::proto::prefix::attach(raw_a, 1).unwrap();
    let b = skein::proto::prefix::attach(raw_b, 1).unwrap();
    // The consumed underliers are gone for good.
    assert_eq!(hclose(raw_a), Err(Error::BadHandle));

    let payload: Vec<u8> = (0..200u8).collect();
    let expected = payload.clone();
    let peer = go(move || {
        msend(a, &payload, now() + 1_000).unwrap();
        let a = skein::proto::prefix::detach(a).unwrap();
        // Back to a plain bytestream.
        skein::bsend(a, b"bye!", now() + 1_000).unwrap();
        hclose(a).unwrap();
    })
    .unwrap();

    let mut buf = [0u8; 256];
    let n = mrecv(b, &mut buf, now() + 1_000).unwrap();
    assert_eq!(n, 200);
    assert_eq!(&buf[..n], &expected[..]);

    let b = skein::proto::prefix::detach(b).unwrap();
    let mut tail = [0u8; 4];
    skein::brecv(b, &mut tail, now() + 1_000).unwrap();
    assert_eq!(&tail, b"bye!");
    hclose(peer).unwrap();
    hclose(b).unwrap();
}

#[test]
fn deadlines_are_lower_bounds() {
    init_logging();
    for wait in [10i64, 30, 60] {
        let start = now();
        assert_eq!(msleep(start + wait), Ok(()));
        assert!(now() - start >= wait);
    }
}

#[test]
fn now_never_decreases() {
    init_logging();
    let mut last = now();
    for _ in 0..1_000 {
        let t = now();
        assert!(t >= last);
        last = t;
    }
}

#[test]
fn owner_close_is_idempotent_in_failure() {
    init_logging();
    let h = go(|| {}).unwrap();
    assert_eq!(hclose(h), Ok(()));
    assert_eq!(hclose(h), Err(Error::BadHandle));
}

#[test]
fn a_full_stack_tears_down_recursively() {
    init_logging();
    // tcp -> prefix -> term, closed from the top with one hclose.
    let lis = skein::net::tcp::listen("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = skein::net::tcp::addr(lis).unwrap();
    let server = go(move || {
        let c = skein::net::tcp::accept(lis, now() + 2_000).unwrap();
        let c = skein::proto::prefix::attach(c, 2).unwrap();
        let c = skein::proto::term::attach(c, b"DONE").unwrap();
        let mut buf = [0u8; 32];
        let n = mrecv(c, &mut buf, now() + 2_000).unwrap();
        assert_eq!(&buf[..n], b"over the full stack");
        hclose(c).unwrap();
        hclose(lis).unwrap();
    })
    .unwrap();
    let c = skein::net::tcp::connect(addr, now() + 2_000).unwrap();
    let c = skein::proto::prefix::attach(c, 2).unwrap();
    let c = skein::proto::term::attach(c, b"DONE").unwrap();
    msend(c, b"over the full stack", now() + 2_000).unwrap();
    hclose(server).unwrap();
    hclose(c).unwrap();
}
