//! Passby Runtime Engine
//!
//! This crate orchestrates the protocol state defined in `passby-core`:
//! - `ExchangeCoordinator`: the per-message outbound state machine and the
//!   delete-on-read inbound path against an untrusted relay
//! - Long-lived tasks: the sighting-ingest loop (sole writer of the fusion
//!   engine) and the poll loop (wake hints plus a periodic fallback)
//! - `RuntimeBuilder` / `RuntimeHandle`: wiring and lifecycle
//! - `MemoryRelay`: an in-process relay for tests and demos

pub mod builder;
pub mod coordinator;
pub mod memory_relay;
pub mod retry;
pub mod tasks;

pub use builder::{RuntimeBuilder, RuntimeHandle};
pub use coordinator::{ExchangeCoordinator, OutboundState, PollOutcome};
pub use memory_relay::MemoryRelay;
pub use tasks::WakeHint;

// Re-export core types for convenience
pub use passby_core::{
    CoreConfig, Envelope, EphemeralMessage, FusionEngine, IdentityManager, IdentityToken,
    MessageId, NearbyEntry, PassbyError, Relay, Result, SessionKey, Sighting, SignalKind,
    TemporaryIdentity, Timestamp,
};
