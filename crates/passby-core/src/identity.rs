//! Temporary identity lifecycle
//!
//! Identities are unlinkable 128-bit tokens with an explicit expiry. The
//! manager owns exactly the current identity plus (after a rotation) one
//! superseded identity kept usable for a short grace window so in-flight
//! sends and receives can finish. Nothing is persisted: a process restart
//! starts with no identity at all.

use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::IdentityConfig;
use crate::errors::{PassbyError, Result};
use crate::types::{IdentityToken, Timestamp};

// ----------------------------------------------------------------------------
// Temporary Identity
// ----------------------------------------------------------------------------

/// A short-lived anonymous identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporaryIdentity {
    /// Random unlinkable token
    pub token: IdentityToken,
    /// When the identity was issued
    pub created_at: Timestamp,
    /// When the identity stops being valid
    pub expires_at: Timestamp,
}

impl TemporaryIdentity {
    fn mint(ttl: core::time::Duration, now: Timestamp) -> Result<Self> {
        let mut bytes = [0u8; 16];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|_| PassbyError::EntropyExhausted)?;

        Ok(Self {
            token: IdentityToken::new(bytes),
            created_at: now,
            expires_at: now.add_duration(ttl),
        })
    }

    /// Pure validity check against `created_at`/`expires_at`
    pub fn is_valid(&self, at: Timestamp) -> bool {
        at >= self.created_at && at < self.expires_at
    }
}

// ----------------------------------------------------------------------------
// Identity Manager
// ----------------------------------------------------------------------------

/// A superseded identity held through its rotation grace window
#[derive(Debug, Clone)]
struct GraceSlot {
    identity: TemporaryIdentity,
    usable_until: Timestamp,
}

/// Issues, rotates and expires the local temporary identity
#[derive(Debug)]
pub struct IdentityManager {
    config: IdentityConfig,
    current: Option<TemporaryIdentity>,
    superseded: Option<GraceSlot>,
}

impl IdentityManager {
    /// Create a manager with no identity issued yet
    pub fn new(config: IdentityConfig) -> Self {
        Self {
            config,
            current: None,
            superseded: None,
        }
    }

    /// Issue a fresh identity with the configured ttl, replacing any state
    pub fn issue(&mut self, now: Timestamp) -> Result<TemporaryIdentity> {
        self.issue_with_ttl(self.config.default_ttl, now)
    }

    /// Issue a fresh identity with an explicit ttl
    pub fn issue_with_ttl(
        &mut self,
        ttl: core::time::Duration,
        now: Timestamp,
    ) -> Result<TemporaryIdentity> {
        let identity = TemporaryIdentity::mint(ttl, now)?;
        debug!(token = %identity.token, expires_at = identity.expires_at.as_millis(), "issued identity");
        self.current = Some(identity.clone());
        self.superseded = None;
        Ok(identity)
    }

    /// Rotate to a replacement identity.
    ///
    /// The superseded identity stays usable for the grace window so that
    /// operations already bound to it can complete; no new operation may
    /// start against it once the window closes.
    pub fn rotate(&mut self, now: Timestamp) -> Result<TemporaryIdentity> {
        let previous = self.current.take().ok_or(PassbyError::NoIdentity)?;
        let replacement = TemporaryIdentity::mint(self.config.default_ttl, now)?;
        debug!(
            old = %previous.token,
            new = %replacement.token,
            grace_ms = self.config.grace_window.as_millis() as u64,
            "rotated identity"
        );

        self.superseded = Some(GraceSlot {
            identity: previous,
            usable_until: now.add_duration(self.config.grace_window),
        });
        self.current = Some(replacement.clone());
        Ok(replacement)
    }

    /// The current identity, if one is issued and unexpired
    pub fn current(&self, at: Timestamp) -> Result<TemporaryIdentity> {
        match &self.current {
            Some(identity) if identity.is_valid(at) => Ok(identity.clone()),
            Some(identity) => Err(PassbyError::IdentityExpired {
                identity: identity.token,
            }),
            None => Err(PassbyError::NoIdentity),
        }
    }

    /// Whether `token` may be used at `at`: the live current identity, or the
    /// superseded one inside its grace window.
    pub fn is_usable(&self, token: &IdentityToken, at: Timestamp) -> bool {
        if let Some(current) = &self.current {
            if current.token == *token {
                return current.is_valid(at);
            }
        }
        if let Some(slot) = &self.superseded {
            if slot.identity.token == *token {
                return at < slot.usable_until;
            }
        }
        false
    }

    /// Like [`is_usable`](Self::is_usable) but returning the error taxonomy
    pub fn require_usable(&self, token: &IdentityToken, at: Timestamp) -> Result<()> {
        if self.is_usable(token, at) {
            Ok(())
        } else {
            Err(PassbyError::IdentityExpired { identity: *token })
        }
    }

    /// All tokens messages may currently be addressed to (current identity
    /// plus the grace-window slot), used by the inbound fetch path.
    pub fn usable_tokens(&self, at: Timestamp) -> Vec<IdentityToken> {
        let mut tokens = Vec::with_capacity(2);
        if let Some(current) = &self.current {
            if current.is_valid(at) {
                tokens.push(current.token);
            }
        }
        if let Some(slot) = &self.superseded {
            if at < slot.usable_until {
                tokens.push(slot.identity.token);
            }
        }
        tokens
    }

    /// Drop all identity state
    pub fn reset(&mut self) {
        self.current = None;
        self.superseded = None;
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
