//! Relay contract
//!
//! The relay is an untrusted store-and-forward collaborator: it holds sealed
//! envelopes addressed to identity tokens, never sees plaintext or keys, and
//! must honor delete-after-fetch. Concrete transports implement this trait;
//! the runtime ships an in-memory one for tests and demos.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;
use crate::errors::Result;
use crate::types::{IdentityToken, MessageId, Timestamp};

// ----------------------------------------------------------------------------
// Ephemeral Message
// ----------------------------------------------------------------------------

/// One sealed message in flight between two identities.
///
/// Exists at most once in a deliverable state: the recipient's coordinator
/// deletes it from the relay immediately after consuming it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EphemeralMessage {
    pub envelope: Envelope,
    pub to: IdentityToken,
    pub from: IdentityToken,
    pub sent_at: Timestamp,
}

// ----------------------------------------------------------------------------
// Delete Outcome
// ----------------------------------------------------------------------------

/// Result of a relay delete request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The message was present and is now gone
    Deleted,
    /// The message was already gone; deletes are idempotent
    NotFound,
}

// ----------------------------------------------------------------------------
// Relay Trait
// ----------------------------------------------------------------------------

/// Store-and-forward contract the exchange coordinator runs against.
///
/// Implementations must be safe to call concurrently; every method is a
/// single bounded network round trip (the coordinator adds timeouts and
/// retries on top).
#[async_trait]
pub trait Relay: Send + Sync {
    /// Store a sealed message, returning its relay-assigned id
    async fn put(&self, message: EphemeralMessage) -> Result<MessageId>;

    /// Fetch all deliverable messages addressed to `to`.
    ///
    /// Fetching does not delete; the recipient issues explicit deletes after
    /// reading so cleanup failures never lose plaintext.
    async fn fetch(&self, to: &IdentityToken) -> Result<Vec<(MessageId, EphemeralMessage)>>;

    /// Delete a stored message
    async fn delete(&self, id: MessageId) -> Result<DeleteOutcome>;

    /// Delivery receipt: whether the recipient has fetched this message.
    /// Must keep answering `true` after the delete-on-read removed it.
    async fn fetched(&self, id: MessageId) -> Result<bool>;
}
