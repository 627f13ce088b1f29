//! Two plaintext nodes over loopback.

use std::net::SocketAddr;
use std::time::Duration;

use chirp_session::{Chirp, ChirpConfig, ChirpError, Delivery};
use chirp_wire::{Identity, Message};
use tokio::sync::mpsc;

fn config() -> ChirpConfig {
    ChirpConfig {
        port: 0,
        bind: "127.0.0.1".parse().unwrap(),
        timeout: 2.0,
        ..Default::default()
    }
}

fn ping() -> Message {
    Message::new(Identity::from_slice(b"A").unwrap())
        .with_actor(vec![1u8])
        .with_data("ping")
}

async fn node() -> (Chirp, mpsc::UnboundedReceiver<(SocketAddr, Message)>) {
    let node = Chirp::start(config()).await.unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    node.on_message(move |from, msg| {
        let _ = tx.send((from, msg));
    })
    .unwrap();
    (node, rx)
}

async fn within<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), fut)
        .await
        .expect("timed out")
}

#[tokio::test]
async fn test_round_trip_with_ack() {
    let (x, _) = node().await;
    let (y, mut inbox) = node().await;

    let outcome = within(x.send(y.local_addr(), ping(), true)).await;
    assert_eq!(outcome, Ok(Delivery::Acked));

    let (from, msg) = within(inbox.recv()).await.unwrap();
    assert_eq!(from, x.local_addr());
    assert_eq!(msg.identity, ping().identity);
    assert!(msg.header.is_empty());
    assert_eq!(&msg.actor[..], &[1u8]);
    assert_eq!(&msg.data[..], b"ping");
    assert!(msg.requires_ack());

    x.shutdown().await;
    y.shutdown().await;
}

#[tokio::test]
async fn test_send_without_ack_reports_sent() {
    let (x, _) = node().await;
    let (y, mut inbox) = node().await;

    for i in 0..10u8 {
        let msg = ping().with_data(vec![i]);
        assert_eq!(
            within(x.send(y.local_addr(), msg, false)).await,
            Ok(Delivery::Sent)
        );
    }
    // Same connection, so arrival order matches send order
    for i in 0..10u8 {
        let (_, msg) = within(inbox.recv()).await.unwrap();
        assert_eq!(&msg.data[..], &[i]);
        assert!(!msg.requires_ack());
    }

    x.shutdown().await;
    y.shutdown().await;
}

#[tokio::test]
async fn test_reply_reaches_sender() {
    let (x, mut x_inbox) = node().await;
    let (y, mut y_inbox) = node().await;

    within(x.send(y.local_addr(), ping(), true)).await.unwrap();
    let (from, _) = within(y_inbox.recv()).await.unwrap();

    let pong = ping().with_data("pong");
    assert_eq!(within(y.send(from, pong, true)).await, Ok(Delivery::Acked));
    let (from, msg) = within(x_inbox.recv()).await.unwrap();
    assert_eq!(from, y.local_addr());
    assert_eq!(&msg.data[..], b"pong");

    x.shutdown().await;
    y.shutdown().await;
}

#[tokio::test]
async fn test_cannot_connect() {
    let closed = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let (x, _) = node().await;
    let outcome = within(x.send(closed, ping(), true)).await;
    assert!(matches!(outcome, Err(ChirpError::CannotConnect(_))));
    x.shutdown().await;
}

#[tokio::test]
async fn test_send_after_shutdown() {
    let (x, _) = node().await;
    let (y, _) = node().await;
    let target = y.local_addr();
    x.shutdown().await;
    assert!(matches!(
        x.send(target, ping(), true).await,
        Err(ChirpError::Shutdown(_))
    ));
    y.shutdown().await;
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let bad = ChirpConfig {
        timeout: 90.0,
        ..config()
    };
    assert!(matches!(
        Chirp::start(bad).await,
        Err(ChirpError::Value(_))
    ));
}
