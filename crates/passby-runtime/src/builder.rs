//! Runtime builder and handle
//!
//! Wires the identity manager, fusion engine and exchange coordinator to
//! their tasks and channels, and hands back a `RuntimeHandle` plus the
//! inbound plaintext receiver for the presentation layer.

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use passby_core::config::CoreConfig;
use passby_core::envelope::SessionKey;
use passby_core::errors::Result;
use passby_core::fusion::{FusionEngine, NearbyEntry, Sighting};
use passby_core::identity::{IdentityManager, TemporaryIdentity};
use passby_core::relay::Relay;
use passby_core::types::{IdentityToken, MessageId, Timestamp};

use crate::coordinator::{ExchangeCoordinator, OutboundState, PollOutcome};
use crate::tasks::{self, WakeHint};

// ----------------------------------------------------------------------------
// Runtime Builder
// ----------------------------------------------------------------------------

/// Builds one device's runtime over a relay
pub struct RuntimeBuilder<R: Relay + 'static> {
    relay: Arc<R>,
    config: CoreConfig,
    sighting_capacity: usize,
    inbound_capacity: usize,
}

impl<R: Relay + 'static> RuntimeBuilder<R> {
    pub fn new(relay: Arc<R>) -> Self {
        Self {
            relay,
            config: CoreConfig::default(),
            sighting_capacity: 256,
            inbound_capacity: 64,
        }
    }

    pub fn config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn sighting_capacity(mut self, capacity: usize) -> Self {
        self.sighting_capacity = capacity;
        self
    }

    /// Validate configuration, spawn the ingest and poll tasks, and return
    /// the handle plus the inbound plaintext receiver.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<(RuntimeHandle<R>, mpsc::Receiver<Vec<u8>>)> {
        self.config.validate()?;

        let identity = Arc::new(Mutex::new(IdentityManager::new(self.config.identity.clone())));
        let fusion = Arc::new(Mutex::new(FusionEngine::new(self.config.fusion.clone())));
        let coordinator = Arc::new(ExchangeCoordinator::new(
            self.relay,
            identity.clone(),
            fusion.clone(),
            self.config.exchange.clone(),
            self.config.retry.clone(),
        ));

        let (sighting_tx, sighting_rx) = mpsc::channel(self.sighting_capacity);
        let (wake_tx, wake_rx) = mpsc::channel(8);
        let (inbound_tx, inbound_rx) = mpsc::channel(self.inbound_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ingest = tokio::spawn(tasks::run_sighting_ingest(
            sighting_rx,
            fusion.clone(),
            shutdown_rx.clone(),
        ));
        let poll_loop = tokio::spawn(tasks::run_poll_loop(
            coordinator.clone(),
            wake_rx,
            self.config.poll.fallback_interval,
            inbound_tx,
            shutdown_rx,
        ));

        let handle = RuntimeHandle {
            coordinator,
            identity,
            fusion,
            sighting_tx,
            wake_tx,
            shutdown_tx,
            task_handles: vec![ingest, poll_loop],
        };
        Ok((handle, inbound_rx))
    }
}

// ----------------------------------------------------------------------------
// Runtime Handle
// ----------------------------------------------------------------------------

/// Handle to one running Passby device
pub struct RuntimeHandle<R: Relay> {
    coordinator: Arc<ExchangeCoordinator<R>>,
    identity: Arc<Mutex<IdentityManager>>,
    fusion: Arc<Mutex<FusionEngine>>,
    sighting_tx: mpsc::Sender<Sighting>,
    wake_tx: mpsc::Sender<WakeHint>,
    shutdown_tx: watch::Sender<bool>,
    task_handles: Vec<JoinHandle<()>>,
}

impl<R: Relay> RuntimeHandle<R> {
    /// Issue a fresh local identity
    pub async fn issue_identity(&self) -> Result<TemporaryIdentity> {
        self.identity.lock().await.issue(Timestamp::now())
    }

    /// Rotate the local identity, leaving the old one in its grace window
    pub async fn rotate_identity(&self) -> Result<TemporaryIdentity> {
        self.identity.lock().await.rotate(Timestamp::now())
    }

    /// The current local identity
    pub async fn current_identity(&self) -> Result<TemporaryIdentity> {
        self.identity.lock().await.current(Timestamp::now())
    }

    /// Register a session key agreed with a peer out of band
    pub fn register_session_key(&self, peer: IdentityToken, key: SessionKey) {
        self.coordinator.register_session_key(peer, key);
    }

    pub fn drop_session_key(&self, peer: &IdentityToken) {
        self.coordinator.drop_session_key(peer);
    }

    /// Seal and submit a message to a nearby peer
    pub async fn submit(&self, to: IdentityToken, plaintext: &[u8]) -> Result<MessageId> {
        self.coordinator.submit(to, plaintext, Timestamp::now()).await
    }

    /// State of a previously submitted message
    pub fn outbound_state(&self, id: &MessageId) -> Option<OutboundState> {
        self.coordinator.outbound_state(id)
    }

    /// Ranked nearby set as of now
    pub async fn snapshot(&self) -> Vec<NearbyEntry> {
        self.fusion.lock().await.snapshot(Timestamp::now())
    }

    /// Run one poll cycle immediately instead of waiting for the loop
    pub async fn poll_now(&self) -> Result<PollOutcome> {
        let now = Timestamp::now();
        let outcome = self.coordinator.poll(now).await?;
        self.coordinator.sweep(now).await;
        Ok(outcome)
    }

    /// Sender for sensing producers to push sightings into
    pub fn sighting_sender(&self) -> mpsc::Sender<Sighting> {
        self.sighting_tx.clone()
    }

    /// Sender for the push side channel's wake hints
    pub fn wake_sender(&self) -> mpsc::Sender<WakeHint> {
        self.wake_tx.clone()
    }

    /// Stop the tasks and wait for them to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.task_handles {
            let _ = task.await;
        }
        debug!("runtime shut down");
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
