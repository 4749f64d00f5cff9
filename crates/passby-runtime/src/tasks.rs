//! Long-lived runtime tasks
//!
//! Sensing producers and the push side channel never call into the core;
//! they hand events to channels owned here. The ingest task is the sole
//! writer of the fusion engine, and the poll loop runs on wake hints plus a
//! periodic fallback so a silent push channel only delays delivery.

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};

use passby_core::fusion::{FusionEngine, Sighting};
use passby_core::relay::Relay;
use passby_core::types::Timestamp;

use crate::coordinator::ExchangeCoordinator;

// ----------------------------------------------------------------------------
// Wake Hint
// ----------------------------------------------------------------------------

/// Hint from the push-delivery side channel that a fetch is worth attempting
/// soon. Purely an accelerant; losing every hint never breaks correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeHint;

// ----------------------------------------------------------------------------
// Sighting Ingest
// ----------------------------------------------------------------------------

/// Drain the sighting channel into the fusion engine.
///
/// Exits when every sender is dropped or shutdown is signalled.
pub async fn run_sighting_ingest(
    mut sightings: mpsc::Receiver<Sighting>,
    fusion: Arc<Mutex<FusionEngine>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            next = sightings.recv() => match next {
                Some(sighting) => fusion.lock().await.observe(sighting),
                None => {
                    debug!("sighting channel closed; ingest task exiting");
                    return;
                }
            },
            _ = shutdown.changed() => {
                debug!("ingest task shutting down");
                return;
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Poll Loop
// ----------------------------------------------------------------------------

/// Run the inbound poll cycle on wake hints and a fallback interval,
/// forwarding decrypted plaintexts to `inbound` and sweeping outbound state.
pub async fn run_poll_loop<R: Relay>(
    coordinator: Arc<ExchangeCoordinator<R>>,
    mut hints: mpsc::Receiver<WakeHint>,
    fallback_interval: core::time::Duration,
    inbound: mpsc::Sender<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(fallback_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            hint = hints.recv() => {
                if hint.is_none() {
                    debug!("wake hint channel closed; falling back to periodic polling");
                    // Hints are gone but the fallback cadence still applies
                    ticker.tick().await;
                }
            }
            _ = shutdown.changed() => {
                debug!("poll loop shutting down");
                return;
            }
        }

        let now = Timestamp::now();
        match coordinator.poll(now).await {
            Ok(outcome) => {
                for plaintext in outcome.plaintexts {
                    if inbound.send(plaintext).await.is_err() {
                        debug!("inbound receiver dropped; poll loop exiting");
                        return;
                    }
                }
            }
            Err(error) => warn!(%error, "poll cycle failed"),
        }

        coordinator.sweep(now).await;
    }
}
