//! Integration tests: sessions, ACK flow and the display pipeline over
//! a real TCP connection on localhost.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use framelink_core::{
    AckTracker, Admission, BackpressureConfig, CloseReason, Connection, ConnectionInfo,
    ConnectionState, DisplayConfig, DisplayMode, DisplayPipeline, Envelope, EnvelopeKind,
    FrameGeometry, FrameSink, FramelinkError, Role, SendMode, Waiter,
};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

// ── Helpers ──────────────────────────────────────────────────────

async fn ephemeral_listener() -> (TcpListener, ConnectionInfo) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let info = ConnectionInfo::new(addr.ip().to_string(), addr.port());
    (listener, info)
}

/// Producer and receiver ends of one session, each with its own waiter.
async fn session_pair() -> ((Connection, Waiter), (Connection, Waiter)) {
    let (listener, info) = ephemeral_listener().await;
    let producer_waiter = Waiter::new();
    let receiver_waiter = Waiter::new();

    let (producer, receiver) = tokio::join!(
        Connection::connect(&info, Some(producer_waiter.clone())),
        Connection::accept_from(&listener, Some(receiver_waiter.clone())),
    );
    (
        (producer.unwrap(), producer_waiter),
        (receiver.unwrap(), receiver_waiter),
    )
}

/// Collect `n` envelopes from the inbox, waking on the waiter.
async fn receive_n(conn: &Connection, waiter: &Waiter, n: usize) -> Vec<Envelope> {
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while out.len() < n {
            out.extend(conn.drain_received());
            if out.len() < n {
                waiter.wait().await;
            }
        }
    })
    .await
    .expect("timed out waiting for envelopes");
    out
}

async fn wait_closed(conn: &Connection, waiter: &Waiter) -> ConnectionState {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !conn.is_closed() {
            waiter.wait_for(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("connection never closed");
    conn.state()
}

// ── Sessions ─────────────────────────────────────────────────────

#[tokio::test]
async fn envelopes_arrive_in_send_order() {
    let ((producer, _), (receiver, rwaiter)) = session_pair().await;

    for i in 0..10u8 {
        producer
            .send_image(format!("img{i}"), vec![i; 256], SendMode::NonBlocking)
            .await
            .unwrap();
    }
    producer.send_display_now("img9").await.unwrap();

    let got = receive_n(&receiver, &rwaiter, 11).await;
    for (i, env) in got.iter().take(10).enumerate() {
        assert_eq!(env.kind(), EnvelopeKind::Image);
        assert_eq!(env.name(), format!("img{i}"));
        assert_eq!(env.payload().as_ref(), vec![i as u8; 256].as_slice());
    }
    assert_eq!(got[10].kind(), EnvelopeKind::DisplayNow);
    assert_eq!(got[10].name(), "img9");
}

#[tokio::test]
async fn blocking_send_completes_and_delivers() {
    let ((producer, _), (receiver, rwaiter)) = session_pair().await;

    let payload = vec![0xAB; 1024 * 1024];
    producer
        .send_image("big", payload.clone(), SendMode::Blocking)
        .await
        .unwrap();

    let got = receive_n(&receiver, &rwaiter, 1).await;
    assert_eq!(got[0].name(), "big");
    assert_eq!(got[0].payload().len(), payload.len());
}

#[tokio::test]
async fn start_timer_has_empty_name_and_payload() {
    let ((producer, _), (receiver, rwaiter)) = session_pair().await;
    producer.send_start_timer().await.unwrap();

    let got = receive_n(&receiver, &rwaiter, 1).await;
    assert_eq!(got[0].kind(), EnvelopeKind::StartTimer);
    assert!(got[0].name().is_empty());
    assert!(got[0].payload().is_empty());
}

#[tokio::test]
async fn waiter_times_out_without_traffic() {
    let ((_producer, pwaiter), _receiver) = session_pair().await;
    let result = pwaiter.wait_for(Duration::from_millis(50)).await;
    assert!(result.is_timed_out());
}

// ── ACK flow ─────────────────────────────────────────────────────

#[tokio::test]
async fn acks_clear_tracked_frames_over_the_wire() {
    let ((producer, pwaiter), (receiver, rwaiter)) = session_pair().await;
    let mut tracker = AckTracker::new(BackpressureConfig::default());

    for (seq, name) in ["a", "b", "c"].into_iter().enumerate() {
        assert_eq!(tracker.admit(), Admission::Send);
        producer
            .send_image(name, vec![1u8; 8], SendMode::NonBlocking)
            .await
            .unwrap();
        tracker.track(name, seq as u64);
    }
    assert_eq!(tracker.len(), 3);

    // Receiver acknowledges a and c only.
    let images = receive_n(&receiver, &rwaiter, 3).await;
    for env in images.iter().filter(|e| e.name() != "b") {
        receiver.send_ack(env.name()).await.unwrap();
    }

    let acks = receive_n(&producer, &pwaiter, 2).await;
    for ack in &acks {
        assert_eq!(ack.kind(), EnvelopeKind::Ack);
        tracker.acknowledge(ack.name()).unwrap();
    }
    let pending: Vec<_> = tracker.pending().collect();
    assert_eq!(pending, vec![("b", 1)]);
}

// ── Teardown / errors ────────────────────────────────────────────

#[tokio::test]
async fn ack_after_peer_half_close_is_delivered() {
    let ((mut producer, pwaiter), (receiver, rwaiter)) = session_pair().await;

    producer
        .send_image("last", vec![7u8; 64], SendMode::NonBlocking)
        .await
        .unwrap();
    producer.shutdown().await;

    let got = receive_n(&receiver, &rwaiter, 1).await;
    assert_eq!(got[0].name(), "last");
    assert_eq!(
        wait_closed(&receiver, &rwaiter).await,
        ConnectionState::Closed(CloseReason::PeerClosed)
    );
    assert!(receiver.can_send());

    receiver.send_ack("last").await.unwrap();
    let acks = receive_n(&producer, &pwaiter, 1).await;
    assert_eq!(acks[0].kind(), EnvelopeKind::Ack);
    assert_eq!(acks[0].name(), "last");
}

#[tokio::test]
async fn sends_fail_once_peer_is_gone() {
    let ((producer, pwaiter), (receiver, _)) = session_pair().await;
    receiver.close();
    drop(receiver);

    assert_eq!(
        wait_closed(&producer, &pwaiter).await,
        ConnectionState::Closed(CloseReason::PeerClosed)
    );

    // The first write may still land in the kernel buffer; the reset
    // it provokes fails a later one.
    let err = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match producer
                .send_image("late", vec![0u8; 4], SendMode::Blocking)
                .await
            {
                Ok(()) => tokio::time::sleep(Duration::from_millis(20)).await,
                Err(e) => break e,
            }
        }
    })
    .await
    .expect("sends kept succeeding after the peer went away");
    assert!(matches!(
        err,
        FramelinkError::ConnectionClosed | FramelinkError::Io(_)
    ));
    assert!(!producer.can_send());
}

#[tokio::test]
async fn local_close_rejects_sends() {
    let ((producer, _), _receiver) = session_pair().await;
    producer.close();
    assert_eq!(producer.state(), ConnectionState::Closed(CloseReason::Local));
    let err = producer.send_ack("x").await.unwrap_err();
    assert!(matches!(err, FramelinkError::ConnectionClosed));
}

#[tokio::test]
async fn unknown_tag_closes_session() {
    let (listener, info) = ephemeral_listener().await;
    let waiter = Waiter::new();
    let (raw, conn) = tokio::join!(
        TcpStream::connect(info.to_string()),
        Connection::accept_from(&listener, Some(waiter.clone())),
    );
    let mut raw = raw.unwrap();
    let conn = conn.unwrap();

    raw.write_all(&[9, 0, 0, 0, 0, 0, 0, 0, 0]).await.unwrap();

    let state = wait_closed(&conn, &waiter).await;
    assert!(matches!(state, ConnectionState::Closed(CloseReason::Framing(_))));
    assert!(conn.try_pop_received().is_none());
}

#[tokio::test]
async fn truncated_envelope_then_eof_closes_with_framing_error() {
    let (listener, info) = ephemeral_listener().await;
    let waiter = Waiter::new();
    let (raw, conn) = tokio::join!(
        TcpStream::connect(info.to_string()),
        Connection::accept_from(&listener, Some(waiter.clone())),
    );
    let mut raw = raw.unwrap();
    let conn = conn.unwrap();

    // One complete ACK, then an IMAGE header promising more bytes than follow.
    let ack = Envelope::ack("ok").encode().unwrap();
    raw.write_all(&ack).await.unwrap();
    raw.write_all(&[1, 1, 0, 0, 0, b'x', 100, 0, 0, 0, 1, 2])
        .await
        .unwrap();
    raw.shutdown().await.unwrap();

    let state = wait_closed(&conn, &waiter).await;
    assert!(matches!(state, ConnectionState::Closed(CloseReason::Framing(_))));
    // The complete envelope before the damage is still delivered.
    assert_eq!(conn.try_pop_received().unwrap().name(), "ok");
    assert!(conn.try_pop_received().is_none());
}

#[tokio::test]
async fn connect_to_closed_port_fails() {
    let (listener, info) = ephemeral_listener().await;
    drop(listener);
    let err = Connection::connect(&info, None).await.unwrap_err();
    assert!(matches!(err, FramelinkError::Connect { .. }));
}

#[tokio::test]
async fn accept_binds_and_serves_one_session() {
    let (listener, info) = ephemeral_listener().await;
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let rwaiter = Waiter::new();
    let accepting = tokio::spawn(Connection::accept(addr, Some(rwaiter.clone())));

    let producer = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match Connection::connect(&info, None).await {
                Ok(conn) => break conn,
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
    })
    .await
    .expect("listener never came up");
    let receiver = accepting.await.unwrap().unwrap();
    assert_eq!(receiver.role(), Role::Inbound);

    producer
        .send_image("hello", vec![1u8, 2, 3], SendMode::Blocking)
        .await
        .unwrap();
    let got = receive_n(&receiver, &rwaiter, 1).await;
    assert_eq!(got[0].name(), "hello");
    assert_eq!(got[0].payload().as_ref(), &[1u8, 2, 3]);
}

#[tokio::test]
async fn accept_on_taken_address_is_connect_error() {
    let (listener, _) = ephemeral_listener().await;
    let addr = listener.local_addr().unwrap();

    let err = Connection::accept(addr, None).await.unwrap_err();
    assert!(matches!(err, FramelinkError::Connect { .. }));
    drop(listener);
}

// ── Display pipeline ─────────────────────────────────────────────

struct RecordingSink {
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), FramelinkError> {
        self.frames.lock().unwrap().push(frame.to_vec());
        Ok(())
    }
}

#[tokio::test]
async fn display_now_presents_received_frame() {
    let ((producer, _), (receiver, rwaiter)) = session_pair().await;

    let pipeline = DisplayPipeline::new(DisplayConfig {
        capacity: 2,
        fps: 120.0,
        mode: DisplayMode::Signal,
        geometry: FrameGeometry {
            width: 4,
            height: 4,
            bits_per_pixel: 8,
        },
    })
    .unwrap();
    let frames = Arc::new(Mutex::new(Vec::new()));
    let handle = pipeline.spawn(RecordingSink {
        frames: Arc::clone(&frames),
    });
    let mut stats = handle.stats_receiver();

    producer
        .send_image("f1", vec![1u8; 16], SendMode::NonBlocking)
        .await
        .unwrap();
    producer
        .send_image("f2", vec![2u8; 16], SendMode::NonBlocking)
        .await
        .unwrap();
    producer.send_display_now("f2").await.unwrap();

    // Minimal receive loop: ACK and queue images, forward display requests.
    for env in receive_n(&receiver, &rwaiter, 3).await {
        match env.kind() {
            EnvelopeKind::Image => {
                receiver.send_ack(env.name()).await.unwrap();
                pipeline.enqueue(env);
            }
            EnvelopeKind::DisplayNow => pipeline.signal_display(Some(env.name())),
            other => panic!("unexpected {other}"),
        }
    }

    tokio::time::timeout(Duration::from_secs(2), stats.changed())
        .await
        .expect("nothing presented")
        .unwrap();

    assert_eq!(*frames.lock().unwrap(), vec![vec![2u8; 16]]);
    assert_eq!(handle.stats().last_frame.as_deref(), Some("f2"));
    let counters = pipeline.counters();
    assert_eq!(counters.presented, 1);
    assert_eq!(counters.superseded, 1);

    handle.stop();
}
