use anyhow::{Result, anyhow};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use super::listener::TopologyListener;
use super::transport::{PeerTransport, send_with_retry};
use crate::agreement::belief::{Decision, FailureBelief, ForwardedBelief, NO_SAFE_TXN};
use crate::agreement::engine::{AgreementEngine, EngineOutput, EngineStatus};
use crate::agreement::error::{AgreementError, FatalCondition};
use crate::agreement::gossip::InboundBelief;
use crate::agreement::protocol::{HeartbeatMessage, WireMessage, decode, encode};
use crate::config::AgreementConfig;
use crate::membership::types::SiteId;
use crate::retry::Backoff;
use crate::topology::publisher::{Published, TopologyPublisher};
use crate::topology::types::TopologyEpoch;

const EVENT_QUEUE_CAPACITY: usize = 1024;
const SEND_ATTEMPTS: u32 = 3;
const SEND_RETRY_INITIAL_MS: u64 = 10;
const SEND_RETRY_MAX_MS: u64 = 80;
const SEND_RETRY_JITTER_MS: u64 = 10;

/// Everything the agreement loop reacts to besides its own timers.
#[derive(Debug)]
pub enum NodeEvent {
    /// Raw frame received from a peer.
    Inbound(Vec<u8>),
    FaultReported(SiteId),
    Recovering(bool),
    Published(Result<Published, AgreementError>),
    /// A newer epoch found in the coordination store.
    EpochObserved(TopologyEpoch, u64),
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub agreement: EngineStatus,
    pub topology_epoch: i64,
    pub topology_version: u64,
    pub publishing: bool,
    /// Epoch of a decision still waiting to be written to the coordination store.
    pub pending_publish: Option<i64>,
    pub last_error: Option<String>,
    pub fatal: Option<String>,
}

/// Cloneable entry point into a running [`AgreementService`].
#[derive(Clone)]
pub struct AgreementHandle {
    events: mpsc::Sender<NodeEvent>,
    status: watch::Receiver<NodeStatus>,
    safe_txn: Arc<AtomicI64>,
}

impl AgreementHandle {
    /// Queues a received frame; `false` when the loop is gone or saturated.
    pub fn deliver(&self, frame: Vec<u8>) -> bool {
        self.events.try_send(NodeEvent::Inbound(frame)).is_ok()
    }

    pub async fn report_fault(&self, site: SiteId) -> Result<()> {
        self.events
            .send(NodeEvent::FaultReported(site))
            .await
            .map_err(|_| anyhow!("agreement loop stopped"))
    }

    pub async fn set_recovering(&self, recovering: bool) -> Result<()> {
        self.events
            .send(NodeEvent::Recovering(recovering))
            .await
            .map_err(|_| anyhow!("agreement loop stopped"))
    }

    /// Advertises the newest locally safe transaction id in outgoing heartbeats.
    pub fn set_safe_txn_id(&self, txn_id: i64) {
        self.safe_txn.fetch_max(txn_id, Ordering::Relaxed);
    }

    pub fn status(&self) -> NodeStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<NodeStatus> {
        self.status.clone()
    }
}

/// Single-threaded driver of one site's [`AgreementEngine`].
///
/// Network input, fault reports and publish completions arrive through one queue; sends and
/// store writes run in spawned tasks so the loop never waits on I/O.
pub struct AgreementService {
    engine: AgreementEngine,
    config: AgreementConfig,
    transport: Arc<dyn PeerTransport>,
    publisher: Arc<TopologyPublisher>,
    listeners: Vec<Arc<dyn TopologyListener>>,
    topology: TopologyEpoch,
    topology_version: u64,
    publishing: bool,
    // Decided but not yet published; retried until it lands or a newer epoch shows up.
    pending: Option<Decision>,
    publish_backoff: Backoff,
    retry_publish_at: Option<u64>,
    last_error: Option<String>,
    events_tx: mpsc::Sender<NodeEvent>,
    events_rx: mpsc::Receiver<NodeEvent>,
    status_tx: watch::Sender<NodeStatus>,
    safe_txn: Arc<AtomicI64>,
    started: Instant,
}

impl AgreementService {
    pub fn new(
        local: SiteId,
        config: AgreementConfig,
        topology: TopologyEpoch,
        topology_version: u64,
        transport: Arc<dyn PeerTransport>,
        publisher: Arc<TopologyPublisher>,
    ) -> (Self, AgreementHandle) {
        let engine = AgreementEngine::new(
            local,
            topology.epoch,
            topology.members.clone(),
            &config,
            0,
        );
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (status_tx, status_rx) = watch::channel(NodeStatus {
            agreement: engine.status(),
            topology_epoch: topology.epoch,
            topology_version,
            publishing: false,
            pending_publish: None,
            last_error: None,
            fatal: None,
        });
        let safe_txn = Arc::new(AtomicI64::new(NO_SAFE_TXN));

        let handle = AgreementHandle {
            events: events_tx.clone(),
            status: status_rx,
            safe_txn: safe_txn.clone(),
        };
        let service = Self {
            engine,
            config,
            transport,
            publisher,
            listeners: Vec::new(),
            topology,
            topology_version,
            publishing: false,
            pending: None,
            publish_backoff: Backoff::store(),
            retry_publish_at: None,
            last_error: None,
            events_tx,
            events_rx,
            status_tx,
            safe_txn,
            started: Instant::now(),
        };
        (service, handle)
    }

    pub fn add_listener(&mut self, listener: Arc<dyn TopologyListener>) {
        self.listeners.push(listener);
    }

    /// Runs until a fatal condition stops agreement on this site.
    pub async fn run(mut self) -> FatalCondition {
        tracing::info!(
            "Agreement loop started for site {} at epoch {}",
            self.engine.local(),
            self.topology.epoch
        );
        for listener in &self.listeners {
            listener.on_topology_changed(&self.topology);
        }

        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let outputs = tokio::select! {
                _ = tick.tick() => {
                    let now = self.now();
                    self.retry_publish(now);
                    self.engine.tick(now)
                }
                _ = heartbeat.tick() => {
                    self.send_heartbeats();
                    Vec::new()
                }
                Some(event) = self.events_rx.recv() => self.handle_event(event),
            };

            if let Some(fatal) = self.apply(outputs) {
                tracing::error!("Stopping agreement on site {}: {}", self.engine.local(), fatal);
                self.publish_status(Some(fatal.to_string()));
                return fatal;
            }
            self.publish_status(None);
        }
    }

    fn now(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn handle_event(&mut self, event: NodeEvent) -> Vec<EngineOutput> {
        let now = self.now();
        match event {
            NodeEvent::Inbound(frame) => self.handle_frame(&frame, now),
            NodeEvent::FaultReported(site) => self.engine.report_fault(site, now),
            NodeEvent::Recovering(recovering) => {
                tracing::info!("Recovering: {}", recovering);
                self.engine.set_recovering(recovering);
                Vec::new()
            }
            NodeEvent::Published(Ok(published)) => {
                self.publishing = false;
                self.pending = None;
                self.retry_publish_at = None;
                for error in &published.errors {
                    tracing::error!("{}", error);
                }
                self.install(published.epoch, published.version, now)
            }
            NodeEvent::Published(Err(e)) => {
                self.publishing = false;
                tracing::error!("Failed to publish topology: {}", e);
                self.last_error = Some(e.to_string());
                if let Some(decision) = &self.pending {
                    let delay = self.publish_backoff.next_delay();
                    tracing::warn!("Retrying publish of epoch {} in {:?}", decision.epoch, delay);
                    self.retry_publish_at = Some(now + delay.as_millis() as u64);
                }
                self.catch_up();
                Vec::new()
            }
            NodeEvent::EpochObserved(epoch, version) => self.install(epoch, version, now),
        }
    }

    fn handle_frame(&mut self, frame: &[u8], now: u64) -> Vec<EngineOutput> {
        let message = match decode(frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Dropping frame: {}", AgreementError::from(e));
                return Vec::new();
            }
        };

        match message {
            WireMessage::Heartbeat(heartbeat) => self.engine.on_heartbeat(
                SiteId(heartbeat.source_site_id),
                heartbeat.timestamp_ms,
                heartbeat.last_safe_txn_id,
                now,
            ),
            WireMessage::SiteFailure(msg) => match FailureBelief::try_from(&msg) {
                Ok(belief) => self.engine.on_belief(InboundBelief::Direct(belief), now),
                Err(e) => {
                    tracing::warn!("Dropping belief: {}", e);
                    Vec::new()
                }
            },
            WireMessage::SiteFailureForward(msg) => match ForwardedBelief::try_from(&msg) {
                Ok(forwarded) => self
                    .engine
                    .on_belief(InboundBelief::Forwarded(forwarded), now),
                Err(e) => {
                    tracing::warn!("Dropping forwarded belief: {}", e);
                    Vec::new()
                }
            },
        }
    }

    fn apply(&mut self, outputs: Vec<EngineOutput>) -> Option<FatalCondition> {
        for output in outputs {
            match output {
                EngineOutput::Send(msg) => self.send(msg.to, &msg.to_wire()),
                EngineOutput::Decided(decision) => {
                    self.pending = Some(decision);
                    self.publish_backoff.reset();
                    self.retry_publish_at = None;
                    self.start_publish();
                }
                EngineOutput::Retracted(site) => {
                    tracing::info!("Site {} is alive again", site);
                }
                EngineOutput::Ambiguous(e) => {
                    tracing::warn!("{}", e);
                    self.last_error = Some(e.to_string());
                    self.catch_up();
                }
                EngineOutput::Fatal(condition) => return Some(condition),
            }
        }
        None
    }

    fn install(&mut self, epoch: TopologyEpoch, version: u64, now: u64) -> Vec<EngineOutput> {
        if epoch.epoch <= self.topology.epoch {
            tracing::debug!(
                "Ignoring topology epoch {} (have {})",
                epoch.epoch,
                self.topology.epoch
            );
            return Vec::new();
        }

        tracing::info!("Installing topology epoch {} (v{})", epoch.epoch, version);
        self.topology = epoch;
        self.topology_version = version;
        self.last_error = None;
        self.pending = None;
        self.retry_publish_at = None;
        for listener in &self.listeners {
            listener.on_topology_changed(&self.topology);
        }
        self.engine
            .on_epoch_advanced(self.topology.epoch, self.topology.members.clone(), now)
    }

    fn send(&self, to: SiteId, message: &WireMessage) {
        let frame = match encode(message) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("Failed to encode message for {}: {}", to, e);
                return;
            }
        };

        let transport = self.transport.clone();
        tokio::spawn(async move {
            let backoff = Backoff::new(
                Duration::from_millis(SEND_RETRY_INITIAL_MS),
                Duration::from_millis(SEND_RETRY_MAX_MS),
                SEND_RETRY_JITTER_MS,
            );
            if let Err(e) =
                send_with_retry(transport.as_ref(), to, frame, SEND_ATTEMPTS, backoff).await
            {
                tracing::debug!("{}", e);
            }
        });
    }

    fn send_heartbeats(&self) {
        let local = self.engine.local();
        let message = WireMessage::Heartbeat(HeartbeatMessage {
            source_site_id: local.0,
            timestamp_ms: wall_clock_ms(),
            last_safe_txn_id: self.safe_txn.load(Ordering::Relaxed),
        });
        for peer in self.engine.members().iter().filter(|site| **site != local) {
            self.send(*peer, &message);
        }
    }

    fn start_publish(&mut self) {
        let Some(decision) = self.pending.clone() else {
            return;
        };
        if self.publishing {
            tracing::debug!("Publish already running for epoch {}", decision.epoch);
            return;
        }
        self.publishing = true;

        let publisher = self.publisher.clone();
        let prior = self.topology.clone();
        let version = self.topology_version;
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = publisher.publish(&prior, version, &decision).await;
            if events.send(NodeEvent::Published(result)).await.is_err() {
                tracing::debug!("Agreement loop gone before publish completed");
            }
        });
    }

    /// Starts the next attempt once the backoff after a failed publish has elapsed.
    fn retry_publish(&mut self, now: u64) {
        if self.publishing || self.pending.is_none() {
            return;
        }
        if self.retry_publish_at.is_some_and(|at| now >= at) {
            self.retry_publish_at = None;
            self.start_publish();
        }
    }

    /// Looks for an epoch other sites already published.
    fn catch_up(&self) {
        let publisher = self.publisher.clone();
        let known = self.topology.epoch;
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            match publisher.current().await {
                Ok(Some((epoch, version))) if epoch.epoch > known => {
                    let _ = events.send(NodeEvent::EpochObserved(epoch, version)).await;
                }
                Ok(_) => {}
                Err(e) => tracing::debug!("Catch-up read failed: {}", e),
            }
        });
    }

    fn publish_status(&self, fatal: Option<String>) {
        self.status_tx.send_replace(NodeStatus {
            agreement: self.engine.status(),
            topology_epoch: self.topology.epoch,
            topology_version: self.topology_version,
            publishing: self.publishing,
            pending_publish: self.pending.as_ref().map(|decision| decision.epoch),
            last_error: self.last_error.clone(),
            fatal,
        });
    }
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
