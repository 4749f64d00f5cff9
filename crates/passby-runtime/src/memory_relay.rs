//! In-memory relay
//!
//! Implements the relay contract over a mutex-guarded map for tests and the
//! demo binary. Fetch records a delivery receipt that survives the
//! delete-on-read, and faults can be injected to exercise the retry path.

use std::collections::HashSet;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::trace;

use passby_core::errors::{PassbyError, Result};
use passby_core::relay::{DeleteOutcome, EphemeralMessage, Relay};
use passby_core::types::{IdentityToken, MessageId};

// ----------------------------------------------------------------------------
// Memory Relay
// ----------------------------------------------------------------------------

#[derive(Default)]
struct RelayState {
    /// Stored messages in arrival order
    stored: Vec<(MessageId, EphemeralMessage)>,
    /// Ids the recipient has fetched at least once
    fetched: HashSet<MessageId>,
    /// Fail this many upcoming calls with `RelayUnavailable`
    fail_next: u32,
    /// Stall this many upcoming calls past any call timeout
    stall_next: u32,
}

/// In-process relay backed by a mutex-guarded map
#[derive(Default)]
pub struct MemoryRelay {
    state: Mutex<RelayState>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject `calls` transport failures into upcoming relay calls
    pub async fn fail_next(&self, calls: u32) {
        self.state.lock().await.fail_next = calls;
    }

    /// Stall `calls` upcoming relay calls until the caller's timeout fires
    pub async fn stall_next(&self, calls: u32) {
        self.state.lock().await.stall_next = calls;
    }

    /// Number of messages currently stored
    pub async fn stored_count(&self) -> usize {
        self.state.lock().await.stored.len()
    }

    /// Whether a message is still stored
    pub async fn contains(&self, id: MessageId) -> bool {
        self.state
            .lock()
            .await
            .stored
            .iter()
            .any(|(stored_id, _)| *stored_id == id)
    }

    /// Apply any injected fault before serving a call
    async fn gate(&self) -> Result<()> {
        let stall = {
            let mut state = self.state.lock().await;
            if state.fail_next > 0 {
                state.fail_next -= 1;
                return Err(PassbyError::relay_unavailable("injected fault"));
            }
            if state.stall_next > 0 {
                state.stall_next -= 1;
                true
            } else {
                false
            }
        };

        if stall {
            // The caller's timeout drops this future long before it completes
            tokio::time::sleep(core::time::Duration::from_secs(3600)).await;
        }
        Ok(())
    }
}

#[async_trait]
impl Relay for MemoryRelay {
    async fn put(&self, message: EphemeralMessage) -> Result<MessageId> {
        self.gate().await?;
        let id = MessageId::random();
        trace!(message_id = %id, to = %message.to, "relay: stored message");
        self.state.lock().await.stored.push((id, message));
        Ok(id)
    }

    async fn fetch(&self, to: &IdentityToken) -> Result<Vec<(MessageId, EphemeralMessage)>> {
        self.gate().await?;
        let mut state = self.state.lock().await;
        let batch: Vec<(MessageId, EphemeralMessage)> = state
            .stored
            .iter()
            .filter(|(_, message)| message.to == *to)
            .cloned()
            .collect();

        for (id, _) in &batch {
            state.fetched.insert(*id);
        }
        trace!(to = %to, count = batch.len(), "relay: fetch");
        Ok(batch)
    }

    async fn delete(&self, id: MessageId) -> Result<DeleteOutcome> {
        self.gate().await?;
        let mut state = self.state.lock().await;
        let before = state.stored.len();
        state.stored.retain(|(stored_id, _)| *stored_id != id);

        if state.stored.len() < before {
            trace!(message_id = %id, "relay: deleted message");
            Ok(DeleteOutcome::Deleted)
        } else {
            Ok(DeleteOutcome::NotFound)
        }
    }

    async fn fetched(&self, id: MessageId) -> Result<bool> {
        self.gate().await?;
        Ok(self.state.lock().await.fetched.contains(&id))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use passby_core::envelope::{seal, SessionKey};
    use passby_core::types::Timestamp;

    fn message(to: u8) -> EphemeralMessage {
        let key = SessionKey::from_bytes([7; 32]);
        EphemeralMessage {
            envelope: seal(b"payload", &key).unwrap(),
            to: IdentityToken::new([to; 16]),
            from: IdentityToken::new([0xee; 16]),
            sent_at: Timestamp::new(1_000),
        }
    }

    #[tokio::test]
    async fn test_put_fetch_delete_cycle() {
        let relay = MemoryRelay::new();
        let to = IdentityToken::new([1; 16]);

        let id = relay.put(message(1)).await.unwrap();
        assert!(!relay.fetched(id).await.unwrap());

        let batch = relay.fetch(&to).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].0, id);

        // Receipt survives the delete-on-read
        assert!(relay.fetched(id).await.unwrap());
        assert_eq!(relay.delete(id).await.unwrap(), DeleteOutcome::Deleted);
        assert!(relay.fetched(id).await.unwrap());

        assert!(relay.fetch(&to).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let relay = MemoryRelay::new();
        let id = relay.put(message(1)).await.unwrap();

        assert_eq!(relay.delete(id).await.unwrap(), DeleteOutcome::Deleted);
        assert_eq!(relay.delete(id).await.unwrap(), DeleteOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_fetch_is_scoped_to_recipient() {
        let relay = MemoryRelay::new();
        relay.put(message(1)).await.unwrap();
        relay.put(message(2)).await.unwrap();

        let batch = relay.fetch(&IdentityToken::new([1; 16])).await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_injected_faults_fire_once_per_call() {
        let relay = MemoryRelay::new();
        relay.fail_next(1).await;

        assert!(relay.put(message(1)).await.is_err());
        assert!(relay.put(message(1)).await.is_ok());
    }
}
