//! Passby Core Protocol Implementation
//!
//! This crate provides the protocol state for Passby, an ephemeral
//! proximity-messaging protocol: short-lived anonymous identities, fusion of
//! noisy proximity sightings into a single nearby set, authenticated
//! encryption for message bodies, and the typed contract an untrusted relay
//! must satisfy. Orchestration (tasks, retries, the exchange coordinator)
//! lives in `passby-runtime`.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod envelope;
pub mod errors;
pub mod fusion;
pub mod identity;
pub mod relay;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{CoreConfig, ExchangeConfig, FusionConfig, IdentityConfig, PollConfig, RetryPolicy};
pub use envelope::{open, seal, Envelope, SessionKey};
pub use errors::{PassbyError, RelayError, Result};
pub use fusion::{Confidence, FusionEngine, NearbyEntry, Sighting, SignalKind, SourceSet};
pub use identity::{IdentityManager, TemporaryIdentity};
pub use relay::{DeleteOutcome, EphemeralMessage, Relay};
pub use types::{IdentityToken, MessageId, Timestamp};
