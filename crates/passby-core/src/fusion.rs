//! Proximity fusion engine
//!
//! Converts a stream of unordered, duplicate-prone sightings from
//! heterogeneous sources (radio advertisements, geolocation fixes) into one
//! deduplicated, confidence-ranked nearby set. The engine is a plain
//! synchronous state machine; the runtime gives it a single writer fed from
//! a channel so `observe` never blocks a sensing producer.

use std::collections::HashMap;

use core::fmt;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::FusionConfig;
use crate::types::{IdentityToken, Timestamp};

// ----------------------------------------------------------------------------
// Signal Kind
// ----------------------------------------------------------------------------

/// Sensing modality that produced a sighting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalKind {
    /// Short-range radio advertisement (tight physical proximity)
    Radio,
    /// Coarse geolocation fix
    Geo,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKind::Radio => write!(f, "radio"),
            SignalKind::Geo => write!(f, "geo"),
        }
    }
}

// ----------------------------------------------------------------------------
// Sighting
// ----------------------------------------------------------------------------

/// One raw observation of another identity's presence.
///
/// `identity_expires_at` travels with the presence announcement the sighting
/// was decoded from, so the engine can drop sightings of expired identities
/// without calling back into anyone's identity manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sighting {
    pub identity: IdentityToken,
    pub kind: SignalKind,
    /// Raw signal strength as reported by the sensing source
    pub strength: f32,
    pub observed_at: Timestamp,
    pub identity_expires_at: Timestamp,
}

// ----------------------------------------------------------------------------
// Confidence
// ----------------------------------------------------------------------------

/// Confidence that an identity is genuinely nearby right now.
///
/// Radio implies tighter physical closeness than a geolocation fix, and
/// agreement across independent sources reduces false positives, hence:
/// geo-only is `Low`, radio-only is `Medium`, both is `High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Confidence {
    Low,
    Medium,
    High,
}

// ----------------------------------------------------------------------------
// Source Set
// ----------------------------------------------------------------------------

/// Set of signal kinds currently vouching for an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceSet(u8);

impl SourceSet {
    const RADIO: u8 = 0b01;
    const GEO: u8 = 0b10;

    fn bit(kind: SignalKind) -> u8 {
        match kind {
            SignalKind::Radio => Self::RADIO,
            SignalKind::Geo => Self::GEO,
        }
    }

    /// Add a kind to the set
    pub fn insert(&mut self, kind: SignalKind) {
        self.0 |= Self::bit(kind);
    }

    /// Whether the set contains a kind
    pub fn contains(&self, kind: SignalKind) -> bool {
        self.0 & Self::bit(kind) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Confidence implied by this source agreement
    pub fn confidence(&self) -> Confidence {
        match (self.contains(SignalKind::Radio), self.contains(SignalKind::Geo)) {
            (true, true) => Confidence::High,
            (true, false) => Confidence::Medium,
            _ => Confidence::Low,
        }
    }
}

// ----------------------------------------------------------------------------
// Nearby Entry
// ----------------------------------------------------------------------------

/// Fused, read-only view of one nearby identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearbyEntry {
    pub identity: IdentityToken,
    pub last_seen_at: Timestamp,
    pub confidence: Confidence,
    pub sources: SourceSet,
}

// ----------------------------------------------------------------------------
// Fusion Engine
// ----------------------------------------------------------------------------

/// Per-identity fused state
#[derive(Debug, Clone)]
struct FusedEntry {
    last_radio: Option<Timestamp>,
    last_geo: Option<Timestamp>,
    /// Latest announced expiry for the identity
    expires_at: Timestamp,
}

impl FusedEntry {
    fn last_seen(&self, kind: SignalKind) -> Option<Timestamp> {
        match kind {
            SignalKind::Radio => self.last_radio,
            SignalKind::Geo => self.last_geo,
        }
    }

    fn observe(&mut self, kind: SignalKind, at: Timestamp) {
        let slot = match kind {
            SignalKind::Radio => &mut self.last_radio,
            SignalKind::Geo => &mut self.last_geo,
        };
        *slot = Some(slot.map_or(at, |existing| existing.max(at)));
    }

    /// Source kinds still inside their decay window
    fn live_sources(&self, config: &FusionConfig, now: Timestamp) -> SourceSet {
        let mut sources = SourceSet::default();
        for kind in [SignalKind::Radio, SignalKind::Geo] {
            if let Some(seen) = self.last_seen(kind) {
                if now.duration_since(seen) <= config.decay_for(kind) {
                    sources.insert(kind);
                }
            }
        }
        sources
    }

    /// Most recent live observation, any kind
    fn freshest(&self, config: &FusionConfig, now: Timestamp) -> Option<Timestamp> {
        [SignalKind::Radio, SignalKind::Geo]
            .into_iter()
            .filter(|kind| self.live_sources(config, now).contains(*kind))
            .filter_map(|kind| self.last_seen(kind))
            .max()
    }
}

/// Merges sightings into a single consistent nearby set.
///
/// `observe` is an idempotent synchronous upsert; `snapshot` evicts decayed
/// and expired entries before returning the ranked view.
#[derive(Debug)]
pub struct FusionEngine {
    config: FusionConfig,
    entries: HashMap<IdentityToken, FusedEntry>,
}

impl FusionEngine {
    /// Create an engine with the given decay windows
    pub fn new(config: FusionConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
        }
    }

    /// Fold one sighting into the nearby set.
    ///
    /// Sightings of identities already expired per their announcement are
    /// dropped outright: a stale identity must not inflate confidence or
    /// reappear nearby.
    pub fn observe(&mut self, sighting: Sighting) {
        if sighting.identity_expires_at <= sighting.observed_at {
            debug!(identity = %sighting.identity, kind = %sighting.kind, "dropped sighting of expired identity");
            return;
        }

        trace!(
            identity = %sighting.identity,
            kind = %sighting.kind,
            strength = sighting.strength,
            "observed sighting"
        );

        let entry = self
            .entries
            .entry(sighting.identity)
            .or_insert_with(|| FusedEntry {
                last_radio: None,
                last_geo: None,
                expires_at: sighting.identity_expires_at,
            });
        entry.expires_at = entry.expires_at.max(sighting.identity_expires_at);
        entry.observe(sighting.kind, sighting.observed_at);
    }

    /// Whether an identity is live in the nearby set right now
    pub fn is_nearby(&self, identity: &IdentityToken, now: Timestamp) -> bool {
        self.entries.get(identity).is_some_and(|entry| {
            now < entry.expires_at && !entry.live_sources(&self.config, now).is_empty()
        })
    }

    /// Evict decayed and expired entries, then return the nearby set ordered
    /// by confidence (desc) and recency (desc).
    pub fn snapshot(&mut self, now: Timestamp) -> Vec<NearbyEntry> {
        let config = self.config.clone();
        self.entries.retain(|_, entry| {
            now < entry.expires_at && !entry.live_sources(&config, now).is_empty()
        });

        let mut snapshot: Vec<NearbyEntry> = self
            .entries
            .iter()
            .filter_map(|(identity, entry)| {
                let sources = entry.live_sources(&self.config, now);
                let last_seen_at = entry.freshest(&self.config, now)?;
                Some(NearbyEntry {
                    identity: *identity,
                    last_seen_at,
                    confidence: sources.confidence(),
                    sources,
                })
            })
            .collect();

        snapshot.sort_by(|a, b| {
            b.confidence
                .cmp(&a.confidence)
                .then(b.last_seen_at.cmp(&a.last_seen_at))
        });
        snapshot
    }

    /// Number of tracked identities (including not-yet-evicted ones)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all fused state
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
