//! End-to-end overlay tests over real sockets on 127.0.0.1.

use std::sync::OnceLock;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use ringnet_crypto::{sign_public_key, Identity};
use ringnet_overlay::{
    Candidate, FrameType, Overlay, OverlayConfig, OverlayEvent,
};
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

// Small keys keep the suite fast; production generation uses 2048 bits.
const TEST_BITS: usize = 1024;
const RING_SIZE: usize = 12;

struct Ring {
    members: Vec<Identity>,
}

static RING: OnceLock<Ring> = OnceLock::new();

/// One shared ring for the whole suite; each test takes its own members.
fn ring() -> &'static Ring {
    RING.get_or_init(|| {
        let authority = RsaPrivateKey::new(&mut OsRng, TEST_BITS).expect("authority keygen");
        let members = (0..RING_SIZE)
            .map(|_| {
                let private = RsaPrivateKey::new(&mut OsRng, TEST_BITS).expect("member keygen");
                let pem = RsaPublicKey::from(&private)
                    .to_public_key_pem(LineEnding::LF)
                    .expect("pem");
                let signature = sign_public_key(&authority, &pem);
                Identity::from_parts(private, RsaPublicKey::from(&authority), signature)
                    .expect("identity")
            })
            .collect();
        Ring { members }
    })
}

fn member(index: usize) -> Identity {
    ring().members[index].clone()
}

fn test_config() -> OverlayConfig {
    OverlayConfig {
        port: 0,
        discovery_range: None,
        default_scheme: "ws".to_string(),
        confirm_retry: Duration::from_millis(500),
        reconnect_delay: Duration::from_millis(800),
        ..OverlayConfig::default()
    }
}

fn seed(port: u16) -> Candidate {
    Candidate::new(format!("ws://127.0.0.1:{}", port), None)
}

async fn start(
    identity: Identity,
    config: OverlayConfig,
) -> (Overlay, mpsc::Receiver<OverlayEvent>) {
    let mut overlay = Overlay::new(config, identity);
    let events = overlay.take_events().expect("events taken once");
    overlay.start().await.expect("start");
    (overlay, events)
}

/// Wait for the first event matching the predicate, failing after `within`.
async fn wait_for_event(
    events: &mut mpsc::Receiver<OverlayEvent>,
    within: Duration,
    mut predicate: impl FnMut(&OverlayEvent) -> bool,
) -> OverlayEvent {
    timeout(within, async {
        loop {
            let event = events.recv().await.expect("event channel open");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Poll a condition until it holds, failing after `within`.
async fn wait_until(within: Duration, mut condition: impl FnMut() -> bool) {
    timeout(within, async {
        while !condition() {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("timed out waiting for condition");
}

fn is_connection(event: &OverlayEvent) -> bool {
    matches!(event, OverlayEvent::Connection { .. })
}

#[tokio::test]
async fn self_connect_is_rejected() {
    let (overlay, mut events) = start(member(0), test_config()).await;
    let port = overlay.listen_port();

    overlay.discover(vec![seed(port)]).await;
    wait_for_event(&mut events, Duration::from_secs(5), |e| {
        matches!(e, OverlayEvent::Discovered)
    })
    .await;

    // Give the HELO exchange time to complete and close the loop.
    sleep(Duration::from_millis(500)).await;
    assert_eq!(overlay.peer_count(), 0);
    assert!(overlay.peer_list(&[]).is_empty());

    overlay.close().await;
}

#[tokio::test]
async fn two_peer_handshake() {
    let (a, mut events_a) = start(member(1), test_config()).await;

    let config_b = OverlayConfig {
        discovery_addresses: vec![seed(a.listen_port())],
        ..test_config()
    };
    let (b, mut events_b) = start(member(2), config_b).await;

    wait_for_event(&mut events_a, Duration::from_secs(5), is_connection).await;
    wait_for_event(&mut events_b, Duration::from_secs(5), is_connection).await;

    let list_a = a.peer_list(&[]);
    let list_b = b.peer_list(&[]);
    assert_eq!(list_a.len(), 1);
    assert_eq!(list_b.len(), 1);
    assert_eq!(list_a[0].signature, BASE64.encode(b.signature()));
    assert_eq!(list_b[0].signature, BASE64.encode(a.signature()));
    assert!(list_a[0].trusted);

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn three_peer_transitive_discovery() {
    let (a, mut events_a) = start(member(3), test_config()).await;

    let config_b = OverlayConfig {
        discovery_addresses: vec![seed(a.listen_port())],
        ..test_config()
    };
    let (b, mut events_b) = start(member(4), config_b).await;

    wait_for_event(&mut events_a, Duration::from_secs(5), is_connection).await;
    wait_for_event(&mut events_b, Duration::from_secs(5), is_connection).await;

    // C knows only B; it must learn A through B's gossip.
    let config_c = OverlayConfig {
        discovery_addresses: vec![seed(b.listen_port())],
        ..test_config()
    };
    let (c, _events_c) = start(member(5), config_c).await;

    wait_until(Duration::from_secs(10), || {
        a.peer_count() == 2 && b.peer_count() == 2 && c.peer_count() == 2
    })
    .await;

    for (overlay, others) in [
        (&a, [&b, &c]),
        (&b, [&a, &c]),
        (&c, [&a, &b]),
    ] {
        let list = overlay.peer_list(&[]);
        for other in others {
            let expected = BASE64.encode(other.signature());
            assert!(
                list.iter().any(|record| record.signature == expected),
                "peer list missing a member"
            );
        }
    }

    a.close().await;
    b.close().await;
    c.close().await;
}

#[tokio::test]
async fn custom_typed_message_is_delivered() {
    let (a, mut events_a) = start(member(6), test_config()).await;

    let config_b = OverlayConfig {
        discovery_addresses: vec![seed(a.listen_port())],
        ..test_config()
    };
    let (b, mut events_b) = start(member(7), config_b).await;

    wait_for_event(&mut events_a, Duration::from_secs(5), is_connection).await;
    wait_for_event(&mut events_b, Duration::from_secs(5), is_connection).await;

    a.broadcast(FrameType::Custom("CustomX".into()), json!("hello"))
        .await
        .unwrap();

    let event = wait_for_event(&mut events_b, Duration::from_secs(5), |e| {
        matches!(e, OverlayEvent::Message(_))
    })
    .await;
    let OverlayEvent::Message(delivery) = event else {
        unreachable!();
    };
    assert_eq!(delivery.kind, FrameType::Custom("CustomX".into()));
    assert_eq!(delivery.body, json!("hello"));
    assert_eq!(delivery.from, a.signature());

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn confirmation_suppresses_retry() {
    let config_a = OverlayConfig {
        require_confirmation: true,
        ..test_config()
    };
    let (a, mut events_a) = start(member(8), config_a).await;

    let config_b = OverlayConfig {
        discovery_addresses: vec![seed(a.listen_port())],
        ..test_config()
    };
    let (b, mut events_b) = start(member(9), config_b).await;

    wait_for_event(&mut events_a, Duration::from_secs(5), is_connection).await;
    wait_for_event(&mut events_b, Duration::from_secs(5), is_connection).await;

    a.broadcast(FrameType::Message, json!({"seq": 1}))
        .await
        .unwrap();

    // The CONFIRM lands well inside the retry window and clears the entry.
    let b_signature = b.signature();
    wait_until(Duration::from_secs(2), || a.unconfirmed_to(&b_signature) == 0).await;

    // Sit out the retry window and count deliveries on B: exactly one.
    sleep(Duration::from_millis(900)).await;
    let mut deliveries = 0;
    while let Ok(event) = events_b.try_recv() {
        if matches!(event, OverlayEvent::Message(_)) {
            deliveries += 1;
        }
    }
    assert_eq!(deliveries, 1);

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn reconnect_after_abnormal_close() {
    let (a, mut events_a) = start(member(10), test_config()).await;

    let config_b = OverlayConfig {
        discovery_addresses: vec![seed(a.listen_port())],
        ..test_config()
    };
    let (b, mut events_b) = start(member(11), config_b).await;

    wait_for_event(&mut events_a, Duration::from_secs(5), is_connection).await;
    wait_for_event(&mut events_b, Duration::from_secs(5), is_connection).await;
    let b_port = b.listen_port();

    // Crash B: no close frames, so A sees an abnormal closure.
    b.halt();
    wait_until(Duration::from_secs(5), || a.peer_count() == 0).await;

    // Restart B on the same port before A's backoff elapses.
    let mut b2 = None;
    for _ in 0..20 {
        let config = OverlayConfig {
            port: b_port,
            ..test_config()
        };
        let mut overlay = Overlay::new(config, member(11));
        let events = overlay.take_events().unwrap();
        match overlay.start().await {
            Ok(()) => {
                b2 = Some((overlay, events));
                break;
            }
            Err(_) => sleep(Duration::from_millis(100)).await,
        }
    }
    let (b2, _events_b2) = b2.expect("rebind B's port");

    wait_until(Duration::from_secs(10), || {
        a.peer_count() == 1 && b2.peer_count() == 1
    })
    .await;
    assert_eq!(
        a.peer_list(&[])[0].signature,
        BASE64.encode(b2.signature())
    );

    a.close().await;
    b2.close().await;
}
