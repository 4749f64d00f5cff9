//! Ephemeral exchange coordinator
//!
//! Binds identities, fused proximity and the envelope codec together against
//! the relay. Outbound messages walk a per-message state machine
//! (`Submitted -> Delivered | Expired`, with compose/seal as the synchronous
//! prefix of `submit`); the inbound path enforces delete-on-read so a message
//! exists at most once in a deliverable state.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use passby_core::config::{ExchangeConfig, RetryPolicy};
use passby_core::envelope::{self, SessionKey};
use passby_core::errors::{PassbyError, Result};
use passby_core::fusion::{FusionEngine, NearbyEntry};
use passby_core::identity::IdentityManager;
use passby_core::relay::{EphemeralMessage, Relay};
use passby_core::types::{IdentityToken, MessageId, Timestamp};

use crate::retry;

// ----------------------------------------------------------------------------
// Outbound State
// ----------------------------------------------------------------------------

/// State of one tracked outbound message.
///
/// Composing and sealing happen synchronously inside `submit`; a message is
/// tracked from the moment the relay accepts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundState {
    /// Accepted by the relay, awaiting the recipient's fetch
    Submitted,
    /// The relay reported the recipient fetched it
    Delivered,
    /// Never fetched before its deadline; deleted from the relay
    Expired,
}

#[derive(Debug, Clone)]
struct OutboundMessage {
    to: IdentityToken,
    state: OutboundState,
    /// Earlier of the message ttl and the sender identity's expiry
    deadline: Timestamp,
    /// When the entry reached a terminal state; pruned after a retention
    /// window so the table stays bounded over the device's lifetime
    terminal_at: Option<Timestamp>,
}

// ----------------------------------------------------------------------------
// Poll Outcome
// ----------------------------------------------------------------------------

/// Result of one inbound poll cycle
#[derive(Debug, Default)]
pub struct PollOutcome {
    /// Decrypted bodies in arrival order
    pub plaintexts: Vec<Vec<u8>>,
    /// Messages dropped for failing authentication (or missing a session
    /// key); deleted from the relay, never surfaced as mangled text
    pub integrity_drops: usize,
}

// ----------------------------------------------------------------------------
// Exchange Coordinator
// ----------------------------------------------------------------------------

/// Orchestrates send/receive against the relay.
///
/// Outbound state is per message, so `submit` calls need no cross-message
/// locking; relay deletes are serialized per message by an in-flight guard.
pub struct ExchangeCoordinator<R: Relay> {
    relay: Arc<R>,
    identity: Arc<Mutex<IdentityManager>>,
    fusion: Arc<Mutex<FusionEngine>>,
    keys: DashMap<IdentityToken, SessionKey>,
    outbound: DashMap<MessageId, OutboundMessage>,
    /// Per-message delete guard against double-delete races
    deleting: DashMap<MessageId, ()>,
    config: ExchangeConfig,
    retry: RetryPolicy,
}

impl<R: Relay> ExchangeCoordinator<R> {
    pub fn new(
        relay: Arc<R>,
        identity: Arc<Mutex<IdentityManager>>,
        fusion: Arc<Mutex<FusionEngine>>,
        config: ExchangeConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            relay,
            identity,
            fusion,
            keys: DashMap::new(),
            outbound: DashMap::new(),
            deleting: DashMap::new(),
            config,
            retry,
        }
    }

    // ------------------------------------------------------------------
    // Session keys
    // ------------------------------------------------------------------

    /// Register the session key agreed with a peer out of band
    pub fn register_session_key(&self, peer: IdentityToken, key: SessionKey) {
        self.keys.insert(peer, key);
    }

    /// Forget the session key for a peer (e.g. once its identity lapses)
    pub fn drop_session_key(&self, peer: &IdentityToken) {
        self.keys.remove(peer);
    }

    // ------------------------------------------------------------------
    // Outbound path
    // ------------------------------------------------------------------

    /// Seal and submit a message to a nearby peer.
    ///
    /// Fails with `IdentityExpired`/`NoIdentity` when the local identity is
    /// not usable, `NotNearby` when the target is absent from the fusion
    /// snapshot (the proximity precondition, not an addressing nicety), and
    /// `NoSessionKey` when no key was registered for the target.
    pub async fn submit(
        &self,
        to: IdentityToken,
        plaintext: &[u8],
        now: Timestamp,
    ) -> Result<MessageId> {
        let local = self.identity.lock().await.current(now)?;

        if !self.fusion.lock().await.is_nearby(&to, now) {
            return Err(PassbyError::NotNearby { identity: to });
        }

        let key = self
            .keys
            .get(&to)
            .map(|entry| entry.value().clone())
            .ok_or(PassbyError::NoSessionKey { identity: to })?;

        let message = EphemeralMessage {
            envelope: envelope::seal(plaintext, &key)?,
            to,
            from: local.token,
            sent_at: now,
        };

        let relay = self.relay.as_ref();
        let id = retry::call(&self.retry, "relay.put", || {
            let message = message.clone();
            async move { relay.put(message).await }
        })
        .await?;

        let deadline = now.add_duration(self.config.message_ttl).min(local.expires_at);
        self.outbound.insert(
            id,
            OutboundMessage {
                to,
                state: OutboundState::Submitted,
                deadline,
                terminal_at: None,
            },
        );
        debug!(message_id = %id, to = %to, deadline = deadline.as_millis(), "submitted message");
        Ok(id)
    }

    /// Current state of a tracked outbound message
    pub fn outbound_state(&self, id: &MessageId) -> Option<OutboundState> {
        self.outbound.get(id).map(|entry| entry.state)
    }

    /// Drive submitted messages forward: mark delivered ones, expire and
    /// clean up the rest once their deadline passes. Terminal entries stay
    /// queryable for one message ttl, then drop out of the table.
    pub async fn sweep(&self, now: Timestamp) {
        self.outbound.retain(|_, entry| match entry.terminal_at {
            Some(at) => now < at.add_duration(self.config.message_ttl),
            None => true,
        });

        let submitted: Vec<(MessageId, Timestamp)> = self
            .outbound
            .iter()
            .filter(|entry| entry.state == OutboundState::Submitted)
            .map(|entry| (*entry.key(), entry.deadline))
            .collect();

        for (id, deadline) in submitted {
            match tokio::time::timeout(self.retry.call_timeout, self.relay.fetched(id)).await {
                Ok(Ok(true)) => {
                    if let Some(mut entry) = self.outbound.get_mut(&id) {
                        entry.state = OutboundState::Delivered;
                        entry.terminal_at = Some(now);
                    }
                    debug!(message_id = %id, "message delivered");
                    continue;
                }
                Ok(Ok(false)) => {}
                // Receipt unavailable this cycle; the next sweep retries
                Ok(Err(error)) => {
                    debug!(message_id = %id, %error, "delivery receipt check failed");
                    continue;
                }
                Err(_) => {
                    debug!(message_id = %id, "delivery receipt check timed out");
                    continue;
                }
            }

            if now >= deadline {
                if let Some(mut entry) = self.outbound.get_mut(&id) {
                    entry.state = OutboundState::Expired;
                    entry.terminal_at = Some(now);
                    warn!(message_id = %id, to = %entry.to, "message expired undelivered");
                }
                // No orphaned ciphertext may outlive the message
                self.delete_guarded(id).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound path
    // ------------------------------------------------------------------

    /// Fetch, decrypt and delete-on-read everything addressed to the local
    /// identity (grace-window tokens included).
    ///
    /// A message that decrypts is deleted from the relay before it is
    /// surfaced; if cleanup keeps failing the plaintext is surfaced anyway.
    /// A message that fails authentication is deleted without being surfaced
    /// and reported through `integrity_drops`. A message whose sender has no
    /// registered session key yet stays on the relay for a later cycle.
    ///
    /// One token's fetch failing must not sink plaintexts already harvested
    /// (and deleted from the relay) under another token, so per-token fetch
    /// errors only surface when the whole cycle came up empty.
    pub async fn poll(&self, now: Timestamp) -> Result<PollOutcome> {
        let tokens = self.identity.lock().await.usable_tokens(now);
        if tokens.is_empty() {
            debug!("poll skipped: no usable local identity");
            return Ok(PollOutcome::default());
        }

        let relay = self.relay.as_ref();
        let mut outcome = PollOutcome::default();
        let mut fetch_error: Option<PassbyError> = None;

        for token in tokens {
            let batch =
                match retry::call(&self.retry, "relay.fetch", || relay.fetch(&token)).await {
                    Ok(batch) => batch,
                    Err(error) => {
                        warn!(token = %token, %error, "fetch failed; trying remaining tokens");
                        fetch_error.get_or_insert(error);
                        continue;
                    }
                };

            for (id, message) in batch {
                match self.open_incoming(&message) {
                    Ok(plaintext) => {
                        self.delete_guarded(id).await;
                        outcome.plaintexts.push(plaintext);
                    }
                    Err(PassbyError::NoSessionKey { identity }) => {
                        // The handshake result may simply not be registered
                        // yet; unlike a bad ciphertext this is fixable, so
                        // the message must survive for a later cycle
                        debug!(
                            message_id = %id,
                            from = %identity,
                            "no session key yet; leaving message on relay"
                        );
                    }
                    Err(error) => {
                        // Retrying cannot fix a bad ciphertext
                        warn!(
                            message_id = %id,
                            from = %message.from,
                            %error,
                            "integrity drop: discarding undecryptable message"
                        );
                        self.delete_guarded(id).await;
                        outcome.integrity_drops += 1;
                    }
                }
            }
        }

        match fetch_error {
            Some(error) if outcome.plaintexts.is_empty() && outcome.integrity_drops == 0 => {
                Err(error)
            }
            _ => Ok(outcome),
        }
    }

    fn open_incoming(&self, message: &EphemeralMessage) -> Result<Vec<u8>> {
        let key = self
            .keys
            .get(&message.from)
            .map(|entry| entry.value().clone())
            .ok_or(PassbyError::NoSessionKey {
                identity: message.from,
            })?;
        envelope::open(&message.envelope, &key)
    }

    /// Current fused nearby set
    pub async fn nearby(&self, now: Timestamp) -> Vec<NearbyEntry> {
        self.fusion.lock().await.snapshot(now)
    }

    // ------------------------------------------------------------------
    // Relay cleanup
    // ------------------------------------------------------------------

    /// Delete a relay message with bounded retries, serialized per message.
    /// `NotFound` counts as success; deletes are idempotent.
    async fn delete_guarded(&self, id: MessageId) {
        if self.deleting.insert(id, ()).is_some() {
            return;
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match tokio::time::timeout(self.retry.call_timeout, self.relay.delete(id)).await {
                Ok(Ok(_)) => break,
                Ok(Err(error)) if !error.is_retriable() => {
                    warn!(message_id = %id, %error, "relay delete failed");
                    break;
                }
                _ if attempt >= self.config.delete_retries => {
                    warn!(
                        message_id = %id,
                        attempts = attempt,
                        "relay cleanup failed; ciphertext may linger until relay ttl"
                    );
                    break;
                }
                _ => tokio::time::sleep(self.retry.delay_after(attempt)).await,
            }
        }

        self.deleting.remove(&id);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
