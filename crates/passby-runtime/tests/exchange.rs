//! End-to-end exchange scenarios over the in-memory relay

use std::sync::Arc;

use core::time::Duration;
use rand_core::OsRng;
use tokio::sync::Mutex;
use x25519_dalek::{PublicKey, StaticSecret};

use passby_core::config::{CoreConfig, ExchangeConfig, FusionConfig, IdentityConfig, RetryPolicy};
use passby_core::envelope::{seal, SessionKey};
use passby_core::errors::PassbyError;
use passby_core::fusion::{Confidence, FusionEngine, Sighting, SignalKind};
use passby_core::identity::{IdentityManager, TemporaryIdentity};
use passby_core::relay::{DeleteOutcome, EphemeralMessage, Relay};
use passby_core::types::{IdentityToken, MessageId, Timestamp};
use passby_runtime::coordinator::{ExchangeCoordinator, OutboundState};
use passby_runtime::{MemoryRelay, RuntimeBuilder};

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

struct Device {
    coordinator: ExchangeCoordinator<MemoryRelay>,
    identity: Arc<Mutex<IdentityManager>>,
    fusion: Arc<Mutex<FusionEngine>>,
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 4,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(10),
        backoff_multiplier: 2.0,
        call_timeout: Duration::from_millis(200),
    }
}

fn device(relay: Arc<MemoryRelay>) -> Device {
    let identity = Arc::new(Mutex::new(IdentityManager::new(IdentityConfig::default())));
    let fusion = Arc::new(Mutex::new(FusionEngine::new(FusionConfig::default())));
    Device {
        coordinator: ExchangeCoordinator::new(
            relay,
            identity.clone(),
            fusion.clone(),
            ExchangeConfig::default(),
            fast_retry(),
        ),
        identity,
        fusion,
    }
}

async fn issue(device: &Device, now: Timestamp) -> TemporaryIdentity {
    device.identity.lock().await.issue(now).unwrap()
}

async fn sight_radio(device: &Device, peer: &TemporaryIdentity, now: Timestamp) {
    device.fusion.lock().await.observe(Sighting {
        identity: peer.token,
        kind: SignalKind::Radio,
        strength: -42.0,
        observed_at: now,
        identity_expires_at: peer.expires_at,
    });
}

/// Relay whose fetch is down for one specific token, as if the shard holding
/// that mailbox were unreachable
struct TokenOutageRelay {
    inner: MemoryRelay,
    failing: IdentityToken,
}

#[async_trait::async_trait]
impl Relay for TokenOutageRelay {
    async fn put(&self, message: EphemeralMessage) -> passby_core::Result<MessageId> {
        self.inner.put(message).await
    }

    async fn fetch(
        &self,
        to: &IdentityToken,
    ) -> passby_core::Result<Vec<(MessageId, EphemeralMessage)>> {
        if *to == self.failing {
            return Err(PassbyError::relay_unavailable("mailbox shard down"));
        }
        self.inner.fetch(to).await
    }

    async fn delete(&self, id: MessageId) -> passby_core::Result<DeleteOutcome> {
        self.inner.delete(id).await
    }

    async fn fetched(&self, id: MessageId) -> passby_core::Result<bool> {
        self.inner.fetched(id).await
    }
}

/// Agree one session key per side via X25519, as the proximity handshake would
fn pair_keys() -> (SessionKey, SessionKey) {
    let a_secret = StaticSecret::random_from_rng(OsRng);
    let b_secret = StaticSecret::random_from_rng(OsRng);
    let a_key = SessionKey::derive(&a_secret, &PublicKey::from(&b_secret));
    let b_key = SessionKey::derive(&b_secret, &PublicKey::from(&a_secret));
    (a_key, b_key)
}

// ----------------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------------

#[tokio::test]
async fn end_to_end_delivery_with_delete_on_read() {
    let relay = Arc::new(MemoryRelay::new());
    let alice = device(relay.clone());
    let bob = device(relay.clone());

    let now = Timestamp::new(1_000);
    let a1 = issue(&alice, now).await;
    let b1 = issue(&bob, now).await;

    // Radio sighting of B1 arrives at A: nearby with medium confidence
    sight_radio(&alice, &b1, now).await;
    let snapshot = alice.coordinator.nearby(now).await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].identity, b1.token);
    assert_eq!(snapshot[0].confidence, Confidence::Medium);

    let (a_key, b_key) = pair_keys();
    alice.coordinator.register_session_key(b1.token, a_key);
    bob.coordinator.register_session_key(a1.token, b_key);

    let id = alice.coordinator.submit(b1.token, b"hi", now).await.unwrap();
    assert_eq!(
        alice.coordinator.outbound_state(&id),
        Some(OutboundState::Submitted)
    );
    assert_eq!(relay.stored_count().await, 1);

    // B polls: plaintext surfaces and the relay copy is gone
    let outcome = bob.coordinator.poll(now.add_secs(1)).await.unwrap();
    assert_eq!(outcome.plaintexts, vec![b"hi".to_vec()]);
    assert_eq!(outcome.integrity_drops, 0);
    assert_eq!(relay.stored_count().await, 0);

    // A repeated fetch never returns the same message id again
    let again = relay.fetch(&b1.token).await.unwrap();
    assert!(again.is_empty());

    // The sender's sweep observes the delivery receipt
    alice.coordinator.sweep(now.add_secs(2)).await;
    assert_eq!(
        alice.coordinator.outbound_state(&id),
        Some(OutboundState::Delivered)
    );
}

#[tokio::test]
async fn submit_to_absent_identity_fails_for_all_proximity_states() {
    let relay = Arc::new(MemoryRelay::new());
    let alice = device(relay.clone());
    let now = Timestamp::new(1_000);
    issue(&alice, now).await;

    let stranger = IdentityToken::new([0x55; 16]);
    assert!(matches!(
        alice.coordinator.submit(stranger, b"hi", now).await,
        Err(PassbyError::NotNearby { .. })
    ));

    // A decayed sighting is as good as none
    let bob_identity = TemporaryIdentity {
        token: stranger,
        created_at: now,
        expires_at: now.add_secs(60),
    };
    sight_radio(&alice, &bob_identity, now).await;
    let later = now.add_secs(30);
    assert!(matches!(
        alice.coordinator.submit(stranger, b"hi", later).await,
        Err(PassbyError::NotNearby { .. })
    ));
}

#[tokio::test]
async fn tampered_envelope_is_dropped_not_surfaced() {
    let relay = Arc::new(MemoryRelay::new());
    let bob = device(relay.clone());

    let now = Timestamp::new(1_000);
    let b1 = issue(&bob, now).await;

    let sender = IdentityToken::new([0xaa; 16]);
    let key = SessionKey::from_bytes([3; 32]);
    bob.coordinator.register_session_key(sender, key.clone());

    // Flip one bit in the tag region before handing it to the relay
    let mut envelope = seal(b"hi", &key).unwrap();
    let last = envelope.ciphertext.len() - 1;
    envelope.ciphertext[last] ^= 0x01;
    relay
        .put(EphemeralMessage {
            envelope,
            to: b1.token,
            from: sender,
            sent_at: now,
        })
        .await
        .unwrap();

    // Zero plaintexts, one integrity drop, no error past the coordinator
    let outcome = bob.coordinator.poll(now).await.unwrap();
    assert!(outcome.plaintexts.is_empty());
    assert_eq!(outcome.integrity_drops, 1);

    // The corrupt ciphertext is cleaned up, not retried
    assert_eq!(relay.stored_count().await, 0);
    assert!(bob.coordinator.poll(now).await.unwrap().plaintexts.is_empty());
}

#[tokio::test]
async fn message_to_pre_rotation_token_arrives_within_grace_window() {
    let relay = Arc::new(MemoryRelay::new());
    let alice = device(relay.clone());
    let bob = device(relay.clone());

    let now = Timestamp::new(1_000);
    let a1 = issue(&alice, now).await;
    let b1 = issue(&bob, now).await;

    sight_radio(&alice, &b1, now).await;
    let (a_key, b_key) = pair_keys();
    alice.coordinator.register_session_key(b1.token, a_key);
    bob.coordinator.register_session_key(a1.token, b_key);

    // B rotates; a message addressed to the old token is already in flight
    let rotated_at = now.add_secs(2);
    bob.identity.lock().await.rotate(rotated_at).unwrap();
    alice.coordinator.submit(b1.token, b"hi", now.add_secs(1)).await.unwrap();

    // Inside the grace window the old token is still fetched
    let outcome = bob.coordinator.poll(rotated_at.add_secs(3)).await.unwrap();
    assert_eq!(outcome.plaintexts, vec![b"hi".to_vec()]);

    // Past the grace window the old token no longer participates
    let bob_mgr = bob.identity.lock().await;
    assert!(!bob_mgr.is_usable(&b1.token, rotated_at.add_secs(6)));
    assert!(matches!(
        bob_mgr.require_usable(&b1.token, rotated_at.add_secs(6)),
        Err(PassbyError::IdentityExpired { .. })
    ));
}

#[tokio::test]
async fn unfetched_message_expires_and_is_deleted() {
    let relay = Arc::new(MemoryRelay::new());
    let alice = device(relay.clone());
    let bob = device(relay.clone());

    let now = Timestamp::new(1_000);
    issue(&alice, now).await;
    let b1 = issue(&bob, now).await;

    sight_radio(&alice, &b1, now).await;
    alice
        .coordinator
        .register_session_key(b1.token, SessionKey::from_bytes([4; 32]));

    let id = alice.coordinator.submit(b1.token, b"hi", now).await.unwrap();
    assert_eq!(relay.stored_count().await, 1);

    // Before the deadline nothing changes
    alice.coordinator.sweep(now.add_secs(10)).await;
    assert_eq!(
        alice.coordinator.outbound_state(&id),
        Some(OutboundState::Submitted)
    );

    // Past the 30s message ttl: expired and no orphaned ciphertext remains
    alice.coordinator.sweep(now.add_secs(31)).await;
    assert_eq!(
        alice.coordinator.outbound_state(&id),
        Some(OutboundState::Expired)
    );
    assert_eq!(relay.stored_count().await, 0);
}

#[tokio::test]
async fn transient_relay_faults_are_retried_then_surfaced() {
    let relay = Arc::new(MemoryRelay::new());
    let alice = device(relay.clone());
    let bob = device(relay.clone());

    let now = Timestamp::new(1_000);
    issue(&alice, now).await;
    let b1 = issue(&bob, now).await;
    sight_radio(&alice, &b1, now).await;
    alice
        .coordinator
        .register_session_key(b1.token, SessionKey::from_bytes([5; 32]));

    // Two transient faults are absorbed by backoff
    relay.fail_next(2).await;
    alice.coordinator.submit(b1.token, b"hi", now).await.unwrap();

    // A persistent outage exhausts the attempt budget and surfaces
    relay.fail_next(100).await;
    assert!(matches!(
        alice.coordinator.submit(b1.token, b"again", now).await,
        Err(PassbyError::Relay(_))
    ));
    relay.fail_next(0).await;
}

#[tokio::test]
async fn stalled_relay_calls_count_as_failures_not_successes() {
    let relay = Arc::new(MemoryRelay::new());
    let alice = device(relay.clone());
    let bob = device(relay.clone());

    let now = Timestamp::new(1_000);
    issue(&alice, now).await;
    let b1 = issue(&bob, now).await;
    sight_radio(&alice, &b1, now).await;
    alice
        .coordinator
        .register_session_key(b1.token, SessionKey::from_bytes([6; 32]));

    // Every attempt stalls past the call timeout
    relay.stall_next(100).await;
    assert!(matches!(
        alice.coordinator.submit(b1.token, b"hi", now).await,
        Err(PassbyError::Relay(_))
    ));
    relay.stall_next(0).await;
}

#[tokio::test]
async fn partial_fetch_failure_does_not_lose_harvested_plaintexts() {
    let now = Timestamp::new(1_000);

    // Bob rotated, so his poll covers the current token plus the grace one;
    // the grace token's mailbox is unreachable this cycle
    let identity = Arc::new(Mutex::new(IdentityManager::new(IdentityConfig::default())));
    let b1 = identity.lock().await.issue(now).unwrap();
    let b2 = identity.lock().await.rotate(now.add_secs(1)).unwrap();

    let relay = Arc::new(TokenOutageRelay {
        inner: MemoryRelay::new(),
        failing: b1.token,
    });
    let fusion = Arc::new(Mutex::new(FusionEngine::new(FusionConfig::default())));
    let bob = ExchangeCoordinator::new(
        relay.clone(),
        identity,
        fusion,
        ExchangeConfig::default(),
        fast_retry(),
    );

    let sender = IdentityToken::new([0xaa; 16]);
    let key = SessionKey::from_bytes([8; 32]);
    bob.register_session_key(sender, key.clone());
    relay
        .put(EphemeralMessage {
            envelope: seal(b"hi", &key).unwrap(),
            to: b2.token,
            from: sender,
            sent_at: now,
        })
        .await
        .unwrap();

    // The current token's plaintext was read and deleted from the relay; the
    // grace token's outage must not turn the cycle into an error that drops it
    let outcome = bob.poll(now.add_secs(2)).await.unwrap();
    assert_eq!(outcome.plaintexts, vec![b"hi".to_vec()]);
    assert_eq!(relay.inner.stored_count().await, 0);

    // With nothing harvested the outage does surface
    assert!(matches!(
        bob.poll(now.add_secs(3)).await,
        Err(PassbyError::Relay(_))
    ));
}

#[tokio::test]
async fn message_without_session_key_waits_for_registration() {
    let relay = Arc::new(MemoryRelay::new());
    let bob = device(relay.clone());

    let now = Timestamp::new(1_000);
    let b1 = issue(&bob, now).await;

    let sender = IdentityToken::new([0xbb; 16]);
    let key = SessionKey::from_bytes([7; 32]);
    relay
        .put(EphemeralMessage {
            envelope: seal(b"early", &key).unwrap(),
            to: b1.token,
            from: sender,
            sent_at: now,
        })
        .await
        .unwrap();

    // Handshake result not registered yet: not an integrity drop, and the
    // message must survive on the relay
    let outcome = bob.coordinator.poll(now).await.unwrap();
    assert!(outcome.plaintexts.is_empty());
    assert_eq!(outcome.integrity_drops, 0);
    assert_eq!(relay.stored_count().await, 1);

    // Once the key lands the message is still there to read
    bob.coordinator.register_session_key(sender, key);
    let outcome = bob.coordinator.poll(now.add_secs(1)).await.unwrap();
    assert_eq!(outcome.plaintexts, vec![b"early".to_vec()]);
    assert_eq!(relay.stored_count().await, 0);
}

#[tokio::test]
async fn terminal_outbound_entries_are_pruned_after_retention() {
    let relay = Arc::new(MemoryRelay::new());
    let alice = device(relay.clone());
    let bob = device(relay.clone());

    let now = Timestamp::new(1_000);
    let a1 = issue(&alice, now).await;
    let b1 = issue(&bob, now).await;

    sight_radio(&alice, &b1, now).await;
    let (a_key, b_key) = pair_keys();
    alice.coordinator.register_session_key(b1.token, a_key);
    bob.coordinator.register_session_key(a1.token, b_key);

    let id = alice.coordinator.submit(b1.token, b"hi", now).await.unwrap();
    bob.coordinator.poll(now.add_secs(1)).await.unwrap();

    let delivered_at = now.add_secs(2);
    alice.coordinator.sweep(delivered_at).await;
    assert_eq!(
        alice.coordinator.outbound_state(&id),
        Some(OutboundState::Delivered)
    );

    // Queryable through the retention window, gone afterwards
    alice.coordinator.sweep(delivered_at.add_secs(29)).await;
    assert_eq!(
        alice.coordinator.outbound_state(&id),
        Some(OutboundState::Delivered)
    );
    alice.coordinator.sweep(delivered_at.add_secs(31)).await;
    assert_eq!(alice.coordinator.outbound_state(&id), None);
}

#[tokio::test]
async fn runtime_handle_delivers_via_wake_hint() {
    let relay = Arc::new(MemoryRelay::new());

    let mut config = CoreConfig::default();
    config.retry = fast_retry();
    // Long fallback so the test proves the wake hint path
    config.poll.fallback_interval = Duration::from_secs(300);

    let (alice, _alice_inbound) = RuntimeBuilder::new(relay.clone())
        .config(config.clone())
        .build()
        .unwrap();
    let (bob, mut bob_inbound) = RuntimeBuilder::new(relay.clone())
        .config(config)
        .build()
        .unwrap();

    let a1 = alice.issue_identity().await.unwrap();
    let b1 = bob.issue_identity().await.unwrap();

    let (a_key, b_key) = pair_keys();
    alice.register_session_key(b1.token, a_key);
    bob.register_session_key(a1.token, b_key);

    // Sensing producer pushes a sighting of B into A's ingest channel
    alice
        .sighting_sender()
        .send(Sighting {
            identity: b1.token,
            kind: SignalKind::Radio,
            strength: -40.0,
            observed_at: Timestamp::now(),
            identity_expires_at: b1.expires_at,
        })
        .await
        .unwrap();

    // Wait for the ingest task to fold it in
    let mut seen = false;
    for _ in 0..50 {
        if !alice.snapshot().await.is_empty() {
            seen = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(seen, "sighting never reached the fusion engine");

    alice.submit(b1.token, b"hello from passby").await.unwrap();
    bob.wake_sender().send(passby_runtime::WakeHint).await.unwrap();

    let plaintext = tokio::time::timeout(Duration::from_secs(5), bob_inbound.recv())
        .await
        .expect("poll loop never delivered")
        .expect("inbound channel closed");
    assert_eq!(plaintext, b"hello from passby");
    assert_eq!(relay.stored_count().await, 0);

    alice.shutdown().await;
    bob.shutdown().await;
}
