//! Configuration for the Passby protocol
//!
//! Each component carries its own small config struct with validated
//! defaults; `CoreConfig` bundles them for the runtime builder.

use core::time::Duration;
use serde::{Deserialize, Serialize};

use crate::errors::{PassbyError, Result};
use crate::fusion::SignalKind;

// ----------------------------------------------------------------------------
// Identity Configuration
// ----------------------------------------------------------------------------

/// Configuration for the identity lifecycle manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Lifetime of a freshly issued identity
    pub default_ttl: Duration,
    /// How long a superseded identity stays usable after rotation
    pub grace_window: Duration,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(60),
            grace_window: Duration::from_secs(5),
        }
    }
}

// ----------------------------------------------------------------------------
// Fusion Configuration
// ----------------------------------------------------------------------------

/// Decay windows for the proximity fusion engine.
///
/// Radio sightings arrive at advertisement cadence, so their window is short;
/// geolocation fixes come in far slower, so theirs is longer. An entry whose
/// sources have all decayed is evicted at the next snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionConfig {
    /// Decay window for radio-advertisement sightings
    pub radio_decay: Duration,
    /// Decay window for geolocation-fix sightings
    pub geo_decay: Duration,
}

impl FusionConfig {
    /// Decay window for one signal kind
    pub fn decay_for(&self, kind: SignalKind) -> Duration {
        match kind {
            SignalKind::Radio => self.radio_decay,
            SignalKind::Geo => self.geo_decay,
        }
    }
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            radio_decay: Duration::from_secs(10),
            geo_decay: Duration::from_secs(45),
        }
    }
}

// ----------------------------------------------------------------------------
// Retry Policy
// ----------------------------------------------------------------------------

/// Bounded exponential backoff for relay calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Cap on the backoff delay
    pub max_delay: Duration,
    /// Exponential backoff multiplier
    pub backoff_multiplier: f32,
    /// Timeout applied to every individual relay call
    pub call_timeout: Duration,
}

impl RetryPolicy {
    /// Backoff delay after the given 1-based attempt number
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f32;
        let exponent = attempt.saturating_sub(1) as i32;
        let delay_ms = (base * self.backoff_multiplier.powi(exponent)) as u64;
        let delay = Duration::from_millis(delay_ms);
        delay.min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            call_timeout: Duration::from_secs(2),
        }
    }
}

// ----------------------------------------------------------------------------
// Exchange Configuration
// ----------------------------------------------------------------------------

/// Configuration for the exchange coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// How long a submitted message may wait to be fetched before expiring
    pub message_ttl: Duration,
    /// Bounded attempts for delete-after-read cleanup
    pub delete_retries: u32,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            message_ttl: Duration::from_secs(30),
            delete_retries: 3,
        }
    }
}

// ----------------------------------------------------------------------------
// Poll Configuration
// ----------------------------------------------------------------------------

/// Configuration for the inbound poll loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Fallback poll cadence when no wake hints arrive
    pub fallback_interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            fallback_interval: Duration::from_secs(15),
        }
    }
}

// ----------------------------------------------------------------------------
// Bundled Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for one Passby device
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    pub identity: IdentityConfig,
    pub fusion: FusionConfig,
    pub retry: RetryPolicy,
    pub exchange: ExchangeConfig,
    pub poll: PollConfig,
}

impl CoreConfig {
    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.identity.default_ttl.is_zero() {
            return Err(PassbyError::config_error("identity ttl must be non-zero"));
        }
        if self.identity.grace_window >= self.identity.default_ttl {
            return Err(PassbyError::config_error(
                "grace window must be shorter than the identity ttl",
            ));
        }
        if self.fusion.radio_decay.is_zero() || self.fusion.geo_decay.is_zero() {
            return Err(PassbyError::config_error("decay windows must be non-zero"));
        }
        if self.retry.max_attempts == 0 {
            return Err(PassbyError::config_error("retry attempts must be at least 1"));
        }
        if self.retry.call_timeout.is_zero() {
            return Err(PassbyError::config_error("relay call timeout must be non-zero"));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
