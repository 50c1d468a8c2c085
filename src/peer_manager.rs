// ===================================================================================================
// Peer Manager - Actor-Based Peer and Channel Ownership
// ===================================================================================================
//
// The peer manager is the only subsystem that touches the transport. It owns every `PeerRecord`
// and every open `PeerChannel`, serializes outbound frames, and fans inbound frames out to the
// orchestrator. All other subsystems talk to it through `PeerManagerHandle`, a cloneable wrapper
// around a typed command channel - the actor processes one command at a time, so peer state
// never needs a lock that spans subsystems.
//
// ## Lifecycle per peer
//
// Disconnected -> Connecting -> Connected -> { Disconnected | Failed }
//
// Connect attempts retry with exponential backoff and give up after the configured attempt
// count with `ConnectAttemptsExhausted`. Peers silent for longer than the stale timeout are
// evicted and their channels closed.
//
// ## Liveness
//
// Every connected peer is pinged on the ping interval. Pong replies echo the originating
// timestamp, which is the only latency measurement the fabric takes. Probes (used by the
// routing layer for LRU eviction decisions) ride the same ping machinery with a nonce
// correlation map.
//
// ===================================================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::error::{MeshError, MeshResult};
use crate::events::{EventBus, MeshEvent};
use crate::identity::{NodeId, NodeIdentity};
use crate::messages::{FrameKind, NetworkFrame, PingPayload, PongPayload};
use crate::telemetry::{CapabilitySnapshot, TelemetrySource};
use crate::transport::{PeerChannel, Transport};

/// Connection status of a known peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

/// Everything the fabric knows about one peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub node_id: NodeId,
    pub public_key: Option<Vec<u8>>,
    pub capabilities: Option<CapabilitySnapshot>,
    pub reputation: f64,
    pub last_seen_ms: i64,
    pub latency_ms: Option<u64>,
    pub status: PeerStatus,
}

impl PeerRecord {
    fn new(node_id: NodeId) -> Self {
        PeerRecord {
            node_id,
            public_key: None,
            capabilities: None,
            reputation: 0.5,
            last_seen_ms: chrono::Utc::now().timestamp_millis(),
            latency_ms: None,
            status: PeerStatus::Disconnected,
        }
    }
}

/// Snapshot of peer-layer counters.
#[derive(Debug, Clone)]
pub struct NetworkStats {
    pub local_node: NodeId,
    pub connected_peers: usize,
    pub known_peers: usize,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub parse_failures: u64,
}

/// Items fanned out to the orchestrator from the inbound loop.
#[derive(Debug)]
pub enum Inbound {
    /// A decoded frame for an upper layer (Ping/Pong are absorbed here).
    Frame(NetworkFrame),
    /// A signed frame that failed verification against the sender's known key.
    InvalidSignature { from: NodeId },
}

/// Fields an upper layer may learn about a peer out-of-band (discovery, advertisements).
#[derive(Debug, Clone, Default)]
pub struct PeerUpdate {
    pub public_key: Option<Vec<u8>>,
    pub capabilities: Option<CapabilitySnapshot>,
    pub reputation: Option<f64>,
}

/// Typed commands processed by the peer manager actor.
enum PeerCommand {
    Connect {
        peer: NodeId,
        resp: oneshot::Sender<MeshResult<()>>,
    },
    FinishConnect {
        peer: NodeId,
        outcome: MeshResult<PeerChannel>,
        attempts_failed: u32,
        resp: oneshot::Sender<MeshResult<()>>,
    },
    Disconnect {
        peer: NodeId,
        resp: oneshot::Sender<MeshResult<()>>,
    },
    Send {
        to: NodeId,
        kind: FrameKind,
        payload: Vec<u8>,
        signed: bool,
        resp: oneshot::Sender<MeshResult<()>>,
    },
    Broadcast {
        kind: FrameKind,
        payload: Vec<u8>,
        signed: bool,
        resp: oneshot::Sender<usize>,
    },
    Probe {
        peer: NodeId,
        resp: oneshot::Sender<bool>,
    },
    PeerInfo {
        peer: NodeId,
        resp: oneshot::Sender<Option<PeerRecord>>,
    },
    ConnectedPeers {
        resp: oneshot::Sender<Vec<NodeId>>,
    },
    AllPeers {
        resp: oneshot::Sender<Vec<PeerRecord>>,
    },
    UpsertPeer {
        peer: NodeId,
        update: PeerUpdate,
    },
    SetReputation {
        peer: NodeId,
        score: f64,
    },
    FrameRates {
        resp: oneshot::Sender<HashMap<NodeId, f64>>,
    },
    Stats {
        resp: oneshot::Sender<NetworkStats>,
    },
    Shutdown,
}

/// Cloneable handle to the peer manager actor. This is the narrow command channel every
/// other subsystem holds; no subsystem reaches the transport or the peer table directly.
#[derive(Clone)]
pub struct PeerManagerHandle {
    tx: mpsc::UnboundedSender<PeerCommand>,
    local: NodeId,
    telemetry: Arc<dyn TelemetrySource>,
}

impl PeerManagerHandle {
    pub fn local_id(&self) -> NodeId {
        self.local
    }

    /// Open a channel to the peer. No-op success when already open.
    pub async fn connect(&self, peer: NodeId) -> MeshResult<()> {
        let (resp, rx) = oneshot::channel();
        self.send_command(PeerCommand::Connect { peer, resp })?;
        rx.await
            .map_err(|_| MeshError::ChannelClosed("peer manager".to_string()))?
    }

    pub async fn disconnect(&self, peer: NodeId) -> MeshResult<()> {
        let (resp, rx) = oneshot::channel();
        self.send_command(PeerCommand::Disconnect { peer, resp })?;
        rx.await
            .map_err(|_| MeshError::ChannelClosed("peer manager".to_string()))?
    }

    /// Send one frame. Succeeds iff a channel to the peer is open.
    pub async fn send_frame(
        &self,
        to: NodeId,
        kind: FrameKind,
        payload: Vec<u8>,
        signed: bool,
    ) -> MeshResult<()> {
        let (resp, rx) = oneshot::channel();
        self.send_command(PeerCommand::Send {
            to,
            kind,
            payload,
            signed,
            resp,
        })?;
        rx.await
            .map_err(|_| MeshError::ChannelClosed("peer manager".to_string()))?
    }

    /// Send to every connected peer; returns the count actually sent.
    pub async fn broadcast(
        &self,
        kind: FrameKind,
        payload: Vec<u8>,
        signed: bool,
    ) -> MeshResult<usize> {
        let (resp, rx) = oneshot::channel();
        self.send_command(PeerCommand::Broadcast {
            kind,
            payload,
            signed,
            resp,
        })?;
        rx.await
            .map_err(|_| MeshError::ChannelClosed("peer manager".to_string()))
    }

    /// Ping the peer and wait up to `timeout` for the matching pong.
    pub async fn probe(&self, peer: NodeId, timeout: Duration) -> bool {
        let (resp, rx) = oneshot::channel();
        if self.send_command(PeerCommand::Probe { peer, resp }).is_err() {
            return false;
        }
        matches!(tokio::time::timeout(timeout, rx).await, Ok(Ok(true)))
    }

    pub async fn peer_info(&self, peer: NodeId) -> Option<PeerRecord> {
        let (resp, rx) = oneshot::channel();
        self.send_command(PeerCommand::PeerInfo { peer, resp }).ok()?;
        rx.await.ok().flatten()
    }

    pub async fn connected_peers(&self) -> Vec<NodeId> {
        let (resp, rx) = oneshot::channel();
        if self.send_command(PeerCommand::ConnectedPeers { resp }).is_err() {
            return vec![];
        }
        rx.await.unwrap_or_default()
    }

    pub async fn all_peers(&self) -> Vec<PeerRecord> {
        let (resp, rx) = oneshot::channel();
        if self.send_command(PeerCommand::AllPeers { resp }).is_err() {
            return vec![];
        }
        rx.await.unwrap_or_default()
    }

    /// Merge out-of-band knowledge (keys, capabilities, reputation) into a peer record,
    /// creating the record if the peer is new.
    pub fn upsert_peer(&self, peer: NodeId, update: PeerUpdate) {
        let _ = self.send_command(PeerCommand::UpsertPeer { peer, update });
    }

    /// Reputation pushed by the verification layer at finalization.
    pub fn set_reputation(&self, peer: NodeId, score: f64) {
        let _ = self.send_command(PeerCommand::SetReputation { peer, score });
    }

    /// Per-peer inbound frame rates over the last second, for the spam monitor.
    pub async fn frame_rates(&self) -> HashMap<NodeId, f64> {
        let (resp, rx) = oneshot::channel();
        if self.send_command(PeerCommand::FrameRates { resp }).is_err() {
            return HashMap::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn network_stats(&self) -> MeshResult<NetworkStats> {
        let (resp, rx) = oneshot::channel();
        self.send_command(PeerCommand::Stats { resp })?;
        rx.await
            .map_err(|_| MeshError::ChannelClosed("peer manager".to_string()))
    }

    /// Current capability snapshot from the external telemetry source.
    pub fn local_capabilities(&self) -> MeshResult<CapabilitySnapshot> {
        self.telemetry
            .capabilities()
            .ok_or(MeshError::TelemetryUnavailable)
    }

    pub fn shutdown(&self) {
        let _ = self.send_command(PeerCommand::Shutdown);
    }

    fn send_command(&self, command: PeerCommand) -> MeshResult<()> {
        self.tx
            .send(command)
            .map_err(|_| MeshError::ChannelClosed("peer manager".to_string()))
    }
}

struct PendingProbe {
    resp: oneshot::Sender<bool>,
    started: Instant,
}

struct FrameRateWindow {
    window_start: Instant,
    count: u32,
    last_rate: f64,
}

/// The actor that owns the transport, the peer table, and the channel table.
pub struct PeerManager {
    identity: Arc<NodeIdentity>,
    transport: Arc<dyn Transport>,
    events: EventBus,
    config: NetworkConfig,
    rx: mpsc::UnboundedReceiver<PeerCommand>,
    self_tx: mpsc::UnboundedSender<PeerCommand>,
    fanout: mpsc::UnboundedSender<Inbound>,
    peers: HashMap<NodeId, PeerRecord>,
    channels: HashMap<NodeId, PeerChannel>,
    connect_failures: HashMap<NodeId, u32>,
    pending_probes: HashMap<u64, PendingProbe>,
    frame_rates: HashMap<NodeId, FrameRateWindow>,
    next_frame_id: u64,
    next_nonce: u64,
    frames_sent: u64,
    frames_received: u64,
    parse_failures: u64,
    cancel: CancellationToken,
}

impl PeerManager {
    /// Spawn the actor. Returns the command handle and the inbound fan-out receiver
    /// consumed by the orchestrator.
    pub fn spawn(
        identity: Arc<NodeIdentity>,
        transport: Arc<dyn Transport>,
        telemetry: Arc<dyn TelemetrySource>,
        events: EventBus,
        config: NetworkConfig,
        cancel: CancellationToken,
    ) -> (PeerManagerHandle, mpsc::UnboundedReceiver<Inbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (fanout_tx, fanout_rx) = mpsc::unbounded_channel();
        let local = identity.node_id();

        let actor = PeerManager {
            identity,
            transport,
            events,
            config,
            rx,
            self_tx: tx.clone(),
            fanout: fanout_tx,
            peers: HashMap::new(),
            channels: HashMap::new(),
            connect_failures: HashMap::new(),
            pending_probes: HashMap::new(),
            frame_rates: HashMap::new(),
            next_frame_id: 0,
            next_nonce: 0,
            frames_sent: 0,
            frames_received: 0,
            parse_failures: 0,
            cancel,
        };

        tokio::spawn(async move {
            actor.run().await;
        });

        let handle = PeerManagerHandle {
            tx,
            local,
            telemetry,
        };
        (handle, fanout_rx)
    }

    async fn run(mut self) {
        info!("peer manager starting for node {}", self.identity.node_id());
        let mut ping_timer =
            tokio::time::interval(Duration::from_millis(self.config.ping_interval_ms.max(1)));
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut maintenance_timer = tokio::time::interval(Duration::from_secs(5));
        maintenance_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("peer manager cancelled");
                    break;
                }
                command = self.rx.recv() => {
                    match command {
                        Some(PeerCommand::Shutdown) | None => break,
                        Some(command) => self.handle_command(command).await,
                    }
                }
                inbound = self.transport.next_inbound() => {
                    match inbound {
                        Some((from, bytes)) => self.handle_inbound(from, bytes),
                        None => {
                            warn!("transport closed, peer manager stopping");
                            break;
                        }
                    }
                }
                _ = ping_timer.tick() => {
                    self.ping_connected();
                }
                _ = maintenance_timer.tick() => {
                    self.evict_stale_peers();
                    self.expire_probes();
                }
            }
        }

        self.channels.clear();
        info!("peer manager stopped");
    }

    async fn handle_command(&mut self, command: PeerCommand) {
        match command {
            PeerCommand::Connect { peer, resp } => self.start_connect(peer, resp),
            PeerCommand::FinishConnect {
                peer,
                outcome,
                attempts_failed,
                resp,
            } => self.finish_connect(peer, outcome, attempts_failed, resp),
            PeerCommand::Disconnect { peer, resp } => {
                let _ = resp.send(self.disconnect_peer(peer, "requested"));
            }
            PeerCommand::Send {
                to,
                kind,
                payload,
                signed,
                resp,
            } => {
                let _ = resp.send(self.send_frame(to, kind, payload, signed));
            }
            PeerCommand::Broadcast {
                kind,
                payload,
                signed,
                resp,
            } => {
                let targets: Vec<NodeId> = self.channels.keys().copied().collect();
                let mut sent = 0;
                for to in targets {
                    if self.send_frame(to, kind, payload.clone(), signed).is_ok() {
                        sent += 1;
                    }
                }
                let _ = resp.send(sent);
            }
            PeerCommand::Probe { peer, resp } => self.start_probe(peer, resp),
            PeerCommand::PeerInfo { peer, resp } => {
                let _ = resp.send(self.peers.get(&peer).cloned());
            }
            PeerCommand::ConnectedPeers { resp } => {
                let _ = resp.send(self.channels.keys().copied().collect());
            }
            PeerCommand::AllPeers { resp } => {
                let _ = resp.send(self.peers.values().cloned().collect());
            }
            PeerCommand::UpsertPeer { peer, update } => self.upsert_peer(peer, update),
            PeerCommand::SetReputation { peer, score } => {
                if let Some(record) = self.peers.get_mut(&peer) {
                    record.reputation = score.clamp(0.0, 1.0);
                }
            }
            PeerCommand::FrameRates { resp } => {
                let now = Instant::now();
                let rates = self
                    .frame_rates
                    .iter()
                    .map(|(peer, window)| (*peer, window.rate_at(now)))
                    .collect();
                let _ = resp.send(rates);
            }
            PeerCommand::Stats { resp } => {
                let _ = resp.send(NetworkStats {
                    local_node: self.identity.node_id(),
                    connected_peers: self.channels.len(),
                    known_peers: self.peers.len(),
                    frames_sent: self.frames_sent,
                    frames_received: self.frames_received,
                    parse_failures: self.parse_failures,
                });
            }
            PeerCommand::Shutdown => unreachable!("handled in run loop"),
        }
    }

    fn start_connect(&mut self, peer: NodeId, resp: oneshot::Sender<MeshResult<()>>) {
        if peer == self.identity.node_id() {
            let _ = resp.send(Err(MeshError::Internal(
                "refusing to connect to self".to_string(),
            )));
            return;
        }
        if self.channels.contains_key(&peer) {
            let _ = resp.send(Ok(()));
            return;
        }

        let record = self.peers.entry(peer).or_insert_with(|| PeerRecord::new(peer));
        record.status = PeerStatus::Connecting;

        let transport = Arc::clone(&self.transport);
        let self_tx = self.self_tx.clone();
        let attempts = self.config.connect_attempts.max(1);
        tokio::spawn(async move {
            let mut failed = 0u32;
            let mut outcome = Err(MeshError::ConnectAttemptsExhausted(peer));
            for attempt in 0..attempts {
                match transport.open(peer).await {
                    Ok(channel) => {
                        outcome = Ok(channel);
                        break;
                    }
                    Err(e) => {
                        failed += 1;
                        debug!("connect attempt {} to {} failed: {}", attempt + 1, peer, e);
                        if attempt + 1 < attempts {
                            let backoff = Duration::from_millis(200 * (1 << attempt));
                            tokio::time::sleep(backoff).await;
                        }
                    }
                }
            }
            let _ = self_tx.send(PeerCommand::FinishConnect {
                peer,
                outcome,
                attempts_failed: failed,
                resp,
            });
        });
    }

    fn finish_connect(
        &mut self,
        peer: NodeId,
        outcome: MeshResult<PeerChannel>,
        attempts_failed: u32,
        resp: oneshot::Sender<MeshResult<()>>,
    ) {
        match outcome {
            Ok(channel) => {
                self.channels.insert(peer, channel);
                self.connect_failures.remove(&peer);
                let record = self.peers.entry(peer).or_insert_with(|| PeerRecord::new(peer));
                record.status = PeerStatus::Connected;
                record.last_seen_ms = chrono::Utc::now().timestamp_millis();
                self.events.publish(MeshEvent::PeerConnected { peer });
                let _ = resp.send(Ok(()));
            }
            Err(_) => {
                *self.connect_failures.entry(peer).or_insert(0) += attempts_failed;
                if let Some(record) = self.peers.get_mut(&peer) {
                    record.status = PeerStatus::Failed;
                }
                let _ = resp.send(Err(MeshError::ConnectAttemptsExhausted(peer)));
            }
        }
    }

    fn disconnect_peer(&mut self, peer: NodeId, reason: &str) -> MeshResult<()> {
        let had_channel = self.channels.remove(&peer).is_some();
        if let Some(record) = self.peers.get_mut(&peer) {
            record.status = PeerStatus::Disconnected;
        }
        if had_channel {
            self.events.publish(MeshEvent::PeerDisconnected {
                peer,
                reason: reason.to_string(),
            });
        }
        Ok(())
    }

    fn send_frame(
        &mut self,
        to: NodeId,
        kind: FrameKind,
        payload: Vec<u8>,
        signed: bool,
    ) -> MeshResult<()> {
        let channel = self.channels.get(&to).ok_or(MeshError::NotConnected(to))?;

        self.next_frame_id += 1;
        let mut frame = NetworkFrame::new(
            self.next_frame_id,
            kind,
            self.identity.node_id(),
            to,
            payload,
        );
        if signed {
            frame.sign(&self.identity)?;
        }
        let bytes = frame.encode()?;
        match channel.send(bytes) {
            Ok(()) => {
                self.frames_sent += 1;
                Ok(())
            }
            Err(e) => {
                if matches!(e, MeshError::NotConnected(_)) {
                    self.disconnect_peer(to, "channel closed")?;
                }
                Err(e)
            }
        }
    }

    fn start_probe(&mut self, peer: NodeId, resp: oneshot::Sender<bool>) {
        if !self.channels.contains_key(&peer) {
            let _ = resp.send(false);
            return;
        }
        self.next_nonce += 1;
        let nonce = self.next_nonce;
        let payload = PingPayload {
            nonce,
            sent_at_ms: chrono::Utc::now().timestamp_millis(),
        };
        let encoded = match bincode::serialize(&payload) {
            Ok(bytes) => bytes,
            Err(_) => {
                let _ = resp.send(false);
                return;
            }
        };
        if self.send_frame(peer, FrameKind::Ping, encoded, false).is_ok() {
            self.pending_probes.insert(
                nonce,
                PendingProbe {
                    resp,
                    started: Instant::now(),
                },
            );
        } else {
            let _ = resp.send(false);
        }
    }

    fn ping_connected(&mut self) {
        let targets: Vec<NodeId> = self.channels.keys().copied().collect();
        for peer in targets {
            self.next_nonce += 1;
            let payload = PingPayload {
                nonce: self.next_nonce,
                sent_at_ms: chrono::Utc::now().timestamp_millis(),
            };
            if let Ok(encoded) = bincode::serialize(&payload) {
                let _ = self.send_frame(peer, FrameKind::Ping, encoded, false);
            }
        }
    }

    fn evict_stale_peers(&mut self) {
        let now = chrono::Utc::now().timestamp_millis();
        let stale_after = self.config.peer_stale_timeout_ms as i64;
        let stale: Vec<NodeId> = self
            .peers
            .values()
            .filter(|record| now.saturating_sub(record.last_seen_ms) > stale_after)
            .map(|record| record.node_id)
            .collect();
        for peer in stale {
            debug!("evicting stale peer {}", peer);
            let _ = self.disconnect_peer(peer, "stale");
            self.peers.remove(&peer);
            self.frame_rates.remove(&peer);
        }
    }

    fn expire_probes(&mut self) {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .pending_probes
            .iter()
            .filter(|(_, probe)| now.duration_since(probe.started) > Duration::from_secs(5))
            .map(|(nonce, _)| *nonce)
            .collect();
        for nonce in expired {
            if let Some(probe) = self.pending_probes.remove(&nonce) {
                let _ = probe.resp.send(false);
            }
        }
    }

    fn handle_inbound(&mut self, from: NodeId, bytes: Vec<u8>) {
        let frame = match NetworkFrame::decode(&bytes) {
            Ok(frame) => frame,
            Err(_) => {
                self.parse_failures += 1;
                debug!("dropping unparseable frame from {}", from);
                return;
            }
        };
        if frame.from != from {
            self.parse_failures += 1;
            debug!("dropping frame with mismatched sender from {}", from);
            return;
        }

        self.frames_received += 1;
        self.note_frame_rate(from);

        let record = self.peers.entry(from).or_insert_with(|| PeerRecord::new(from));
        record.last_seen_ms = chrono::Utc::now().timestamp_millis();
        if self.channels.contains_key(&from) {
            record.status = PeerStatus::Connected;
        } else {
            // A remote opened a channel to us; establish the reverse link so replies work.
            self.open_reverse_channel(from);
        }

        // Signed frames from peers with a known key must verify.
        if frame.signature.is_some() {
            if let Some(public_key) = self
                .peers
                .get(&from)
                .and_then(|record| record.public_key.clone())
            {
                if !frame.verify(&public_key) {
                    warn!("invalid signature on {:?} frame from {}", frame.kind, from);
                    let _ = self.fanout.send(Inbound::InvalidSignature { from });
                    return;
                }
            }
        }

        match frame.kind {
            FrameKind::Ping => self.answer_ping(frame),
            FrameKind::Pong => self.absorb_pong(frame),
            _ => {
                let _ = self.fanout.send(Inbound::Frame(frame));
            }
        }
    }

    fn open_reverse_channel(&mut self, peer: NodeId) {
        if let Some(record) = self.peers.get(&peer) {
            if record.status == PeerStatus::Connecting {
                return;
            }
        }
        let (resp, _rx) = oneshot::channel();
        self.start_connect(peer, resp);
    }

    fn answer_ping(&mut self, frame: NetworkFrame) {
        let Ok(ping) = bincode::deserialize::<PingPayload>(&frame.payload) else {
            self.parse_failures += 1;
            return;
        };
        let pong = PongPayload {
            nonce: ping.nonce,
            echoed_at_ms: ping.sent_at_ms,
        };
        if let Ok(encoded) = bincode::serialize(&pong) {
            let _ = self.send_frame(frame.from, FrameKind::Pong, encoded, false);
        }
    }

    fn absorb_pong(&mut self, frame: NetworkFrame) {
        let Ok(pong) = bincode::deserialize::<PongPayload>(&frame.payload) else {
            self.parse_failures += 1;
            return;
        };
        let now = chrono::Utc::now().timestamp_millis();
        let latency = now.saturating_sub(pong.echoed_at_ms).max(0) as u64;
        if let Some(record) = self.peers.get_mut(&frame.from) {
            record.latency_ms = Some(latency);
            record.last_seen_ms = now;
        }
        if let Some(probe) = self.pending_probes.remove(&pong.nonce) {
            let _ = probe.resp.send(true);
        }
    }

    fn note_frame_rate(&mut self, from: NodeId) {
        let now = Instant::now();
        let window = self.frame_rates.entry(from).or_insert(FrameRateWindow {
            window_start: now,
            count: 0,
            last_rate: 0.0,
        });
        let elapsed = now.duration_since(window.window_start);
        if elapsed >= Duration::from_secs(1) {
            window.last_rate = window.count as f64 / elapsed.as_secs_f64();
            window.window_start = now;
            window.count = 0;
        }
        window.count += 1;
    }

    fn upsert_peer(&mut self, peer: NodeId, update: PeerUpdate) {
        if peer == self.identity.node_id() {
            return;
        }
        let record = self.peers.entry(peer).or_insert_with(|| PeerRecord::new(peer));
        if let Some(public_key) = update.public_key {
            record.public_key = Some(public_key);
        }
        if let Some(capabilities) = update.capabilities {
            record.capabilities = Some(capabilities);
        }
        if let Some(reputation) = update.reputation {
            record.reputation = reputation.clamp(0.0, 1.0);
        }
        record.last_seen_ms = chrono::Utc::now().timestamp_millis();
    }
}

impl FrameRateWindow {
    fn rate_at(&self, now: Instant) -> f64 {
        let elapsed = now.duration_since(self.window_start).as_secs_f64();
        if elapsed >= 1.0 {
            self.count as f64 / elapsed
        } else {
            // Mid-window: report the larger of the finished window and the live count,
            // so a burst is visible before the window rolls over.
            self.last_rate.max(self.count as f64)
        }
    }
}
