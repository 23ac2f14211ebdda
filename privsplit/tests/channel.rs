//! Channel engine tests over in-process socket pairs.

use nix::unistd::{pipe, read, write};
use privsplit::{Channel, Error, Fd, MAX_PAYLOAD, RESERVED};
use serde_derive::{Deserialize, Serialize};
use std::{os::unix::io::AsRawFd, time::Duration};
use tokio::sync::mpsc;

const PING: u32 = 100;
const PONG: u32 = 101;
const TAKE_PIPE: u32 = 102;
const SILENT: u32 = 103;

#[derive(Debug, Serialize, Deserialize)]
struct Counter {
    value: u64,
}

#[tokio::test(flavor = "multi_thread")]
async fn messages_arrive_in_order() {
    let (a, b) = Channel::pair("a<->b", "b<->a").unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    b.register_handler(PING, move |msg| {
        let tx = tx.clone();
        async move {
            tx.send(msg.payload().to_vec()).ok();
            Ok(())
        }
    });
    a.start();
    b.start();

    for i in 0..64u32 {
        a.send(PING, format!("msg-{}", i).as_bytes(), None)
            .await
            .unwrap();
    }

    for i in 0..64u32 {
        let payload = rx.recv().await.unwrap();
        assert_eq!(payload, format!("msg-{}", i).as_bytes());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn query_reply_correlation_over_many_iterations() {
    let (a, b) = Channel::pair("a<->b", "b<->a").unwrap();

    b.register_handler(PING, |msg| async move {
        let counter: Counter = msg.decode()?;
        msg.reply_data(
            PONG,
            &Counter {
                value: counter.value + 1,
            },
            None,
        )
        .await
    });
    a.start();
    b.start();

    for value in 0..10_000u64 {
        let reply = a.query_data(PING, &Counter { value }, None).await.unwrap();
        assert_eq!(reply.id(), PONG);
        let counter: Counter = reply.decode().unwrap();
        assert_eq!(counter.value, value + 1);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn descriptor_passes_through_a_message() {
    let (a, b) = Channel::pair("a<->b", "b<->a").unwrap();

    b.register_handler(TAKE_PIPE, |mut msg| async move {
        let fd = msg.take_fd().ok_or(Error::Protocol("missing descriptor"))?;
        write(fd.as_raw_fd(), b"hello\n")?;
        Ok(())
    });
    a.start();
    b.start();

    let (rx_end, tx_end) = pipe().unwrap();
    let rx_end = Fd::from(rx_end);

    a.send(TAKE_PIPE, b"", Some(Fd::from(tx_end)))
        .await
        .unwrap();

    let mut buf = [0u8; 16];
    let greeting = tokio::task::spawn_blocking(move || {
        let n = read(rx_end.as_raw_fd(), &mut buf).unwrap();
        buf[..n].to_vec()
    })
    .await
    .unwrap();
    assert_eq!(greeting, b"hello\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn unconsumed_descriptor_is_closed() {
    let (a, b) = Channel::pair("a<->b", "b<->a").unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    b.register_handler(TAKE_PIPE, move |msg| {
        // The descriptor stays inside the message and must close with it.
        let tx = tx.clone();
        async move {
            tx.send(msg.payload().to_vec()).ok();
            Ok(())
        }
    });
    a.start();
    b.start();

    let (rx_end, tx_end) = pipe().unwrap();
    let rx_end = Fd::from(rx_end);

    a.send(TAKE_PIPE, b"dropped", Some(Fd::from(tx_end)))
        .await
        .unwrap();
    rx.recv().await.unwrap();

    // All write ends are gone once the handler dropped the message, so
    // the read end sees EOF instead of blocking.
    let eof = tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 8];
        read(rx_end.as_raw_fd(), &mut buf).unwrap()
    })
    .await
    .unwrap();
    assert_eq!(eof, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn pending_query_fails_when_peer_goes_away() {
    let (a, b) = Channel::pair("a<->b", "b<->a").unwrap();
    a.start();

    // The peer never starts and is dropped: its socket closes and the
    // pending query resolves instead of hanging.
    drop(b);

    let err = a.query(PING, b"anyone there", None).await.unwrap_err();
    assert!(matches!(err, Error::PeerClosed), "got {:?}", err);

    let err = a.send(PING, b"still there?", None).await.unwrap_err();
    assert!(matches!(err, Error::PeerClosed), "got {:?}", err);
    assert!(a.is_closed());
}

#[tokio::test(flavor = "multi_thread")]
async fn query_deadline_expires_and_channel_survives() {
    let (a, b) = Channel::pair("a<->b", "b<->a").unwrap();

    b.register_handler(SILENT, |_msg| async move { Ok(()) });
    b.register_handler(PING, |msg| async move {
        msg.reply(PONG, msg.payload(), None).await
    });
    a.start();
    b.start();

    let err = a
        .query_timeout(SILENT, b"", None, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout), "got {:?}", err);

    // The channel is still usable after the expired query.
    let reply = a.query(PING, b"after-timeout", None).await.unwrap();
    assert_eq!(reply.payload(), b"after-timeout");
}

#[tokio::test(flavor = "multi_thread")]
async fn late_reply_after_deadline_is_discarded() {
    let (a, b) = Channel::pair("a<->b", "b<->a").unwrap();

    b.register_handler(PING, |msg| async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        msg.reply(PONG, msg.payload(), None).await
    });
    a.start();
    b.start();

    let err = a
        .query_timeout(PING, b"slow", None, Duration::from_millis(20))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout));

    // The stale reply for the abandoned correlation id is dropped; a
    // fresh query still gets its own answer.
    let reply = a.query(PING, b"fresh", None).await.unwrap();
    assert_eq!(reply.payload(), b"fresh");
}

#[tokio::test(flavor = "multi_thread")]
async fn reserved_tags_are_rejected() {
    let (a, _b) = Channel::pair("a<->b", "b<->a").unwrap();

    let err = a.send(RESERVED, b"", None).await.unwrap_err();
    assert!(matches!(err, Error::ReservedTag(tag) if tag == RESERVED));

    let err = a.query(1, b"", None).await.unwrap_err();
    assert!(matches!(err, Error::ReservedTag(1)));
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_payload_is_rejected_before_sending() {
    let (a, _b) = Channel::pair("a<->b", "b<->a").unwrap();

    let payload = vec![0u8; MAX_PAYLOAD + 1];
    let err = a.send(PING, &payload, None).await.unwrap_err();
    assert!(matches!(err, Error::Frame(_)), "got {:?}", err);
}

#[tokio::test(flavor = "multi_thread")]
async fn payload_at_cap_roundtrips() {
    let (a, b) = Channel::pair("a<->b", "b<->a").unwrap();

    b.register_handler(PING, |msg| async move {
        msg.reply(PONG, msg.payload(), None).await
    });
    a.start();
    b.start();

    let payload = vec![0xa5u8; MAX_PAYLOAD];
    let reply = a.query(PING, &payload, None).await.unwrap();
    assert_eq!(reply.payload(), payload.as_slice());
}

#[tokio::test(flavor = "multi_thread")]
async fn unhandled_tag_is_dropped_without_killing_the_channel() {
    let (a, b) = Channel::pair("a<->b", "b<->a").unwrap();

    b.register_handler(PING, |msg| async move {
        msg.reply(PONG, msg.payload(), None).await
    });
    a.start();
    b.start();

    a.send(SILENT, b"nobody listens", None).await.unwrap();

    let reply = a.query(PING, b"still alive", None).await.unwrap();
    assert_eq!(reply.payload(), b"still alive");
}

#[tokio::test(flavor = "multi_thread")]
async fn close_hook_runs_once_on_teardown() {
    let (a, b) = Channel::pair("a<->b", "b<->a").unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    a.on_close(move || {
        tx.send(()).ok();
    });
    a.start();

    drop(b);

    // Force the reader to notice the closed socket.
    let _ = a.query(PING, b"", None).await;
    rx.recv().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn handler_error_does_not_tear_down_the_channel() {
    let (a, b) = Channel::pair("a<->b", "b<->a").unwrap();

    b.register_handler(SILENT, |_msg| async move {
        Err(Error::Cancelled)
    });
    b.register_handler(PING, |msg| async move {
        msg.reply(PONG, msg.payload(), None).await
    });
    a.start();
    b.start();

    a.send(SILENT, b"boom", None).await.unwrap();

    let reply = a.query(PING, b"survived", None).await.unwrap();
    assert_eq!(reply.payload(), b"survived");
}
