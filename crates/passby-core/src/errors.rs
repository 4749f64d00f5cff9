//! Error types for the Passby protocol
//!
//! One crate-level error enum covers the whole taxonomy. Relay failures are
//! the only retriable class; cryptographic and identity-validity failures are
//! temporal or cryptographic facts that retrying cannot change.

use crate::types::IdentityToken;

// ----------------------------------------------------------------------------
// Relay Errors
// ----------------------------------------------------------------------------

/// Transport-level failures talking to the relay
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("relay call timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
    #[error("relay unavailable: {reason}")]
    Unavailable { reason: String },
}

// ----------------------------------------------------------------------------
// Protocol Errors
// ----------------------------------------------------------------------------

/// Core error types for the Passby protocol
#[derive(Debug, thiserror::Error)]
pub enum PassbyError {
    /// The OS entropy source failed; the process cannot mint identities.
    #[error("entropy source exhausted, cannot mint identity tokens")]
    EntropyExhausted,

    /// The referenced identity is expired (or past its rotation grace window).
    #[error("identity {identity} has expired")]
    IdentityExpired { identity: IdentityToken },

    /// No local identity has been issued yet.
    #[error("no local identity has been issued")]
    NoIdentity,

    /// The target identity is absent from the current nearby snapshot.
    #[error("identity {identity} is not currently nearby")]
    NotNearby { identity: IdentityToken },

    /// No session key has been registered for the peer.
    #[error("no session key registered for {identity}")]
    NoSessionKey { identity: IdentityToken },

    /// AEAD tag verification failed: tampered ciphertext or wrong key.
    #[error("envelope failed authentication")]
    Authentication,

    /// The AEAD itself refused to seal the plaintext.
    #[error("envelope encryption failed")]
    Encryption,

    /// Plaintext exceeds the envelope size limit.
    #[error("payload of {size} bytes exceeds the {max} byte envelope limit")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    /// Channel communication error (internal task plumbing)
    #[error("channel error: {message}")]
    Channel { message: String },

    /// Configuration error
    #[error("configuration error: {reason}")]
    Configuration { reason: String },
}

// ----------------------------------------------------------------------------
// Convenience Constructors
// ----------------------------------------------------------------------------

impl PassbyError {
    /// Create a relay-unavailable error with a reason
    pub fn relay_unavailable<T: Into<String>>(reason: T) -> Self {
        PassbyError::Relay(RelayError::Unavailable {
            reason: reason.into(),
        })
    }

    /// Create a channel error with a message
    pub fn channel_error<T: Into<String>>(message: T) -> Self {
        PassbyError::Channel {
            message: message.into(),
        }
    }

    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        PassbyError::Configuration {
            reason: reason.into(),
        }
    }

    /// Whether this failure may be retried with backoff.
    ///
    /// Only transport failures qualify: a timeout or partition says nothing
    /// about the next attempt, while crypto and identity failures are final.
    pub fn is_retriable(&self) -> bool {
        matches!(self, PassbyError::Relay(_))
    }
}

// ----------------------------------------------------------------------------
// Type Alias
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, PassbyError>;

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(PassbyError::relay_unavailable("down").is_retriable());
        assert!(PassbyError::Relay(RelayError::Timeout { duration_ms: 500 }).is_retriable());

        assert!(!PassbyError::Authentication.is_retriable());
        assert!(!PassbyError::Encryption.is_retriable());
        assert!(!PassbyError::EntropyExhausted.is_retriable());
        assert!(!PassbyError::IdentityExpired {
            identity: crate::types::IdentityToken::new([0; 16])
        }
        .is_retriable());
    }
}
