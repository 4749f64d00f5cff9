//! Passby demo binary
//!
//! Runs two in-process devices against the in-memory relay: Alice sights Bob
//! over simulated radio, submits one sealed message, and Bob's poll loop
//! delivers it delete-on-read. Real deployments swap in concrete sensing
//! sources and a relay transport behind the same traits.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use rand_core::OsRng;
use tracing::info;
use tracing_subscriber::EnvFilter;
use x25519_dalek::{PublicKey, StaticSecret};

use passby_core::envelope::SessionKey;
use passby_core::fusion::{Sighting, SignalKind};
use passby_core::types::Timestamp;
use passby_runtime::{MemoryRelay, RuntimeBuilder, WakeHint};

/// Two-device Passby exchange over an in-memory relay
#[derive(Debug, Parser)]
#[command(name = "passby", version)]
struct Args {
    /// Message Alice sends to Bob
    #[arg(long, default_value = "hi, you're nearby")]
    message: String,

    /// Log filter (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log)),
        )
        .init();

    let relay = Arc::new(MemoryRelay::new());

    let (alice, _alice_inbound) = RuntimeBuilder::new(relay.clone())
        .build()
        .context("building alice's runtime")?;
    let (bob, mut bob_inbound) = RuntimeBuilder::new(relay.clone())
        .build()
        .context("building bob's runtime")?;

    // Each device mints a fresh anonymous identity for this session
    let alice_id = alice.issue_identity().await?;
    let bob_id = bob.issue_identity().await?;
    info!(alice = %alice_id.token, bob = %bob_id.token, "identities issued");

    // Proximity handshake: swap X25519 public keys, derive one session key
    let alice_secret = StaticSecret::random_from_rng(OsRng);
    let bob_secret = StaticSecret::random_from_rng(OsRng);
    alice.register_session_key(
        bob_id.token,
        SessionKey::derive(&alice_secret, &PublicKey::from(&bob_secret)),
    );
    bob.register_session_key(
        alice_id.token,
        SessionKey::derive(&bob_secret, &PublicKey::from(&alice_secret)),
    );

    // A simulated radio scanner reports Bob's advertisement to Alice
    alice
        .sighting_sender()
        .send(Sighting {
            identity: bob_id.token,
            kind: SignalKind::Radio,
            strength: -38.0,
            observed_at: Timestamp::now(),
            identity_expires_at: bob_id.expires_at,
        })
        .await
        .context("sighting channel closed")?;

    // Wait for the ingest task to surface Bob in the nearby set
    loop {
        let snapshot = alice.snapshot().await;
        if let Some(entry) = snapshot.first() {
            info!(peer = %entry.identity, confidence = ?entry.confidence, "peer is nearby");
            break;
        }
        tokio::time::sleep(core::time::Duration::from_millis(10)).await;
    }

    let id = alice.submit(bob_id.token, args.message.as_bytes()).await?;
    info!(message_id = %id, "message submitted");

    // Push side channel nudges Bob to fetch now instead of waiting for the
    // fallback poll cadence
    bob.wake_sender()
        .send(WakeHint)
        .await
        .context("wake channel closed")?;

    let plaintext = tokio::time::timeout(core::time::Duration::from_secs(10), bob_inbound.recv())
        .await
        .context("timed out waiting for delivery")?
        .context("inbound channel closed")?;
    info!(
        message = %String::from_utf8_lossy(&plaintext),
        "bob received and deleted-on-read"
    );

    info!(stored = relay.stored_count().await, "relay is empty again");

    alice.shutdown().await;
    bob.shutdown().await;
    Ok(())
}
