// ===================================================================================================
// Peer Discovery - Bootstrap, Neighbor Exchange, Relays, and Multi-Hop Paths
// ===================================================================================================
//
// Discovery keeps the overlay populated. It runs every enabled method in priority order until
// the catalog reaches max-peers or the methods are exhausted, refreshes the node's own signed
// advertisement once per period, and maintains scored multi-hop routing paths for destinations
// that cannot be reached directly.
//
// Method priority (high to low): DHT lookup, neighbor exchange, bootstrap, relay, mDNS.
// Per-method attempt/success/failure counters feed a health indicator; an unhealthy method is
// reported but never disabled.
//
// ===================================================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::{DiscoveryConfig, NetworkConfig};
use crate::error::{MeshError, MeshResult};
use crate::events::{EventBus, MeshEvent};
use crate::identity::{NodeId, NodeIdentity};
use crate::messages::{
    DiscoveryPayload, FrameKind, PeerAdvertisement, PeerInfo,
};
use crate::peer_manager::{PeerManagerHandle, PeerUpdate};
use crate::routing::{DhtNode, RoutingService};

/// Minimum advertised bandwidth for a peer to serve as a relay, in Mbps.
const RELAY_MIN_BANDWIDTH_MBPS: f64 = 50.0;
/// Relay candidates tried per failed direct connection.
const RELAY_ATTEMPTS: usize = 3;
/// Seed reliability for a freshly discovered multi-hop path.
const DISCOVERED_PATH_RELIABILITY: f64 = 0.7;
/// Seed reliability for a direct path to a connected peer.
const DIRECT_PATH_RELIABILITY: f64 = 0.9;
/// EWMA weight for path reliability learning.
const RELIABILITY_EWMA_ALPHA: f64 = 0.3;

/// Mechanisms for learning about peers, in descending priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMethod {
    Dht,
    PeerExchange,
    Bootstrap,
    Relay,
    Mdns,
}

/// Attempt/success/failure counters per discovery method.
#[derive(Debug, Clone, Default)]
pub struct MethodStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
}

impl MethodStats {
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 1.0;
        }
        self.successes as f64 / self.attempts as f64
    }
}

/// A known route to a destination, scored for selection.
#[derive(Debug, Clone)]
pub struct RoutingPath {
    pub destination: NodeId,
    /// Ordered hops, destination included as the final element.
    pub hops: Vec<NodeId>,
    pub latency_ms: u64,
    pub reliability: f64,
    pub last_used_ms: i64,
    pub use_count: u64,
}

impl RoutingPath {
    /// Composite score: 0.4 latency + 0.4 reliability + 0.1 freshness + 0.1 usage.
    pub fn score(&self, now_ms: i64) -> f64 {
        let latency_score = ((100.0 - self.latency_ms as f64) / 100.0).max(0.0);
        let age_ms = now_ms.saturating_sub(self.last_used_ms) as f64;
        let freshness = (1.0 - age_ms / (24.0 * 3_600_000.0)).max(0.0);
        let usage_bonus = (self.use_count as f64 * 0.01).min(0.2);
        0.4 * latency_score + 0.4 * self.reliability + 0.1 * freshness + 0.1 * usage_bonus
    }

    fn record_use(&mut self, success: bool, now_ms: i64) {
        self.last_used_ms = now_ms;
        self.use_count += 1;
        let observation = if success { 1.0 } else { 0.0 };
        self.reliability = RELIABILITY_EWMA_ALPHA * observation
            + (1.0 - RELIABILITY_EWMA_ALPHA) * self.reliability;
    }
}

/// Snapshot of the discovery layer for diagnostics.
#[derive(Debug, Clone)]
pub struct DiscoveryStats {
    pub known_advertisements: usize,
    pub cached_paths: usize,
    pub methods: HashMap<DiscoveryMethod, MethodStats>,
}

/// The discovery subsystem.
pub struct PeerDiscovery {
    local: NodeId,
    identity: Arc<NodeIdentity>,
    peers: PeerManagerHandle,
    routing: Arc<RoutingService>,
    events: EventBus,
    config: DiscoveryConfig,
    max_peers: usize,
    bootstrap_nodes: Vec<NodeId>,
    advertisements: Arc<RwLock<HashMap<NodeId, PeerAdvertisement>>>,
    paths: Arc<RwLock<HashMap<NodeId, Vec<RoutingPath>>>>,
    method_stats: Arc<RwLock<HashMap<DiscoveryMethod, MethodStats>>>,
    pending_peer_lists: Arc<Mutex<HashMap<Uuid, oneshot::Sender<Vec<PeerInfo>>>>>,
    pending_paths: Arc<Mutex<HashMap<Uuid, oneshot::Sender<bool>>>>,
}

impl PeerDiscovery {
    pub fn new(
        identity: Arc<NodeIdentity>,
        peers: PeerManagerHandle,
        routing: Arc<RoutingService>,
        events: EventBus,
        config: DiscoveryConfig,
        network: &NetworkConfig,
    ) -> MeshResult<Arc<Self>> {
        let bootstrap_nodes = network
            .bootstrap_nodes
            .iter()
            .map(|id| NodeId::from_hex(id))
            .collect::<MeshResult<Vec<_>>>()?;
        Ok(Arc::new(PeerDiscovery {
            local: identity.node_id(),
            identity,
            peers,
            routing,
            events,
            config,
            max_peers: network.max_peers,
            bootstrap_nodes,
            advertisements: Arc::new(RwLock::new(HashMap::new())),
            paths: Arc::new(RwLock::new(HashMap::new())),
            method_stats: Arc::new(RwLock::new(HashMap::new())),
            pending_peer_lists: Arc::new(Mutex::new(HashMap::new())),
            pending_paths: Arc::new(Mutex::new(HashMap::new())),
        }))
    }

    /// Run each enabled method in priority order until max-peers known or all exhausted.
    /// Returns peers that were new to this node.
    pub async fn discover(&self) -> Vec<NodeId> {
        let mut learned: Vec<NodeId> = Vec::new();
        for method in self.config.methods.clone() {
            if self.known_peer_count().await >= self.max_peers {
                break;
            }
            let found = match method {
                DiscoveryMethod::Dht => self.discover_via_dht().await,
                DiscoveryMethod::PeerExchange => self.discover_via_neighbor_exchange().await,
                DiscoveryMethod::Bootstrap => self.discover_via_bootstrap().await,
                DiscoveryMethod::Relay => self.discover_via_relays().await,
                DiscoveryMethod::Mdns => self.discover_via_mdns().await,
            };
            match found {
                Ok(peers) => {
                    self.note_method(method, true).await;
                    for info in peers {
                        if let Some(peer) = self.absorb_peer_info(&info).await {
                            learned.push(peer);
                        }
                    }
                }
                Err(e) => {
                    self.note_method(method, false).await;
                    debug!("discovery method {:?} failed: {}", method, e);
                }
            }
        }

        if !learned.is_empty() {
            info!("discovered {} new peers", learned.len());
            self.events.publish(MeshEvent::PeersDiscovered {
                peers: learned.clone(),
            });
        }
        learned
    }

    /// Broadcast this node's signed advertisement to every connected peer.
    pub async fn advertise_self(&self) -> MeshResult<usize> {
        let capabilities = self.peers.local_capabilities()?;
        let mut ad = PeerAdvertisement {
            peer: self.local,
            public_key: self.identity.public_key_bytes(),
            capabilities,
            endpoints: vec![],
            methods: self.config.methods.clone(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            ttl_ms: self.config.advertisement_ttl_ms as i64,
            signature: None,
        };
        ad.sign(&self.identity)?;
        let payload = DiscoveryPayload::Advertisement(ad).encode()?;
        self.peers
            .broadcast(FrameKind::PeerDiscovery, payload, false)
            .await
    }

    /// Connect to a peer directly, falling back to relays when the direct dial fails.
    pub async fn connect(&self, peer: NodeId) -> MeshResult<()> {
        match self.peers.connect(peer).await {
            Ok(()) => {
                self.routing
                    .add_or_update(DhtNode::new(&self.local, peer))
                    .await;
                return Ok(());
            }
            Err(direct_err) => {
                let relays = self.relay_candidates().await;
                for relay in relays.into_iter().take(RELAY_ATTEMPTS) {
                    if self.probe_path_via(relay, peer).await.unwrap_or(false) {
                        debug!("reaching {} via relay {}", peer, relay);
                        self.routing
                            .add_or_update(DhtNode::new(&self.local, peer))
                            .await;
                        self.store_path(self.relay_path(relay, peer).await).await;
                        return Ok(());
                    }
                }
                Err(direct_err)
            }
        }
    }

    /// Best known path to the destination; probes connected intermediates when the
    /// cache is empty.
    pub async fn find_optimal_path(&self, destination: NodeId) -> Option<RoutingPath> {
        let now = chrono::Utc::now().timestamp_millis();
        if let Some(best) = self.best_cached_path(destination, now).await {
            return Some(best);
        }

        self.probe_paths(destination).await;
        self.best_cached_path(destination, now).await
    }

    /// Feed a send outcome back into the reliability estimate for the used path.
    pub async fn record_path_result(&self, destination: NodeId, success: bool) {
        let now = chrono::Utc::now().timestamp_millis();
        let mut paths = self.paths.write().await;
        if let Some(list) = paths.get_mut(&destination) {
            if let Some(path) = list.first_mut() {
                path.record_use(success, now);
            }
        }
    }

    /// Ask a bridge peer for its catalog during partition healing.
    pub async fn partition_probe(
        &self,
        bridge: NodeId,
        affected: Vec<NodeId>,
    ) -> MeshResult<Vec<PeerInfo>> {
        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending_peer_lists.lock().await.insert(request_id, tx);

        let payload = DiscoveryPayload::PartitionHealing {
            affected_peers: affected,
            request_id,
        }
        .encode()?;
        if let Err(e) = self
            .peers
            .send_frame(bridge, FrameKind::PeerDiscovery, payload, false)
            .await
        {
            self.pending_peer_lists.lock().await.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(Duration::from_millis(self.config.path_probe_timeout_ms), rx)
            .await
        {
            Ok(Ok(peers)) => Ok(peers),
            _ => {
                self.pending_peer_lists.lock().await.remove(&request_id);
                Err(MeshError::QueryTimeout)
            }
        }
    }

    /// Record advertised knowledge about a peer and return its id when previously unknown.
    async fn absorb_peer_info(&self, info: &PeerInfo) -> Option<NodeId> {
        if info.node_id == self.local {
            return None;
        }
        let known = self.peers.peer_info(info.node_id).await.is_some();
        self.peers.upsert_peer(
            info.node_id,
            PeerUpdate {
                public_key: Some(info.public_key.clone()).filter(|k| !k.is_empty()),
                capabilities: info.capabilities.clone(),
                reputation: Some(info.reputation),
            },
        );
        let mut node = DhtNode::new(&self.local, info.node_id);
        node.capabilities = info.capabilities.clone();
        node.reputation = info.reputation;
        self.routing.add_or_update(node).await;
        (!known).then_some(info.node_id)
    }

    async fn known_peer_count(&self) -> usize {
        self.peers.all_peers().await.len()
    }

    async fn note_method(&self, method: DiscoveryMethod, success: bool) {
        let mut stats = self.method_stats.write().await;
        let entry = stats.entry(method).or_default();
        entry.attempts += 1;
        if success {
            entry.successes += 1;
        } else {
            entry.failures += 1;
        }
    }

    async fn discover_via_dht(&self) -> MeshResult<Vec<PeerInfo>> {
        let found = self.routing.lookup(NodeId::random()).await;
        Ok(found
            .into_iter()
            .map(|node| PeerInfo {
                node_id: node.node_id,
                public_key: vec![],
                capabilities: node.capabilities,
                reputation: node.reputation,
                latency_ms: None,
            })
            .collect())
    }

    async fn discover_via_neighbor_exchange(&self) -> MeshResult<Vec<PeerInfo>> {
        let mut found = Vec::new();
        for peer in self.peers.connected_peers().await {
            match self
                .request_peer_list(peer, DiscoveryPayload::NeighborRequest {
                    request_id: Uuid::new_v4(),
                })
                .await
            {
                Ok(peers) => found.extend(peers),
                Err(e) => trace!("neighbor exchange with {} failed: {}", peer, e),
            }
        }
        Ok(found)
    }

    async fn discover_via_bootstrap(&self) -> MeshResult<Vec<PeerInfo>> {
        let mut found = Vec::new();
        for seed in &self.bootstrap_nodes {
            if *seed == self.local {
                continue;
            }
            match self.peers.connect(*seed).await {
                Ok(()) => {
                    found.push(PeerInfo {
                        node_id: *seed,
                        public_key: vec![],
                        capabilities: None,
                        reputation: 0.5,
                        latency_ms: None,
                    });
                }
                Err(e) => debug!("bootstrap connect to {} failed: {}", seed, e),
            }
        }
        Ok(found)
    }

    async fn discover_via_relays(&self) -> MeshResult<Vec<PeerInfo>> {
        let mut found = Vec::new();
        for relay in self.relay_candidates().await {
            match self
                .request_peer_list(relay, DiscoveryPayload::PeerListRequest {
                    request_id: Uuid::new_v4(),
                })
                .await
            {
                Ok(peers) => found.extend(peers),
                Err(e) => trace!("relay catalog from {} failed: {}", relay, e),
            }
        }
        Ok(found)
    }

    async fn discover_via_mdns(&self) -> MeshResult<Vec<PeerInfo>> {
        // Local-network discovery needs a transport-level responder, which the external
        // transport does not expose. The method stays enumerable but finds nothing here.
        trace!("mdns discovery has no transport support; skipping");
        Ok(vec![])
    }

    /// Connected peers with enough advertised bandwidth to serve as relays.
    async fn relay_candidates(&self) -> Vec<NodeId> {
        self.peers
            .all_peers()
            .await
            .into_iter()
            .filter(|record| {
                record
                    .capabilities
                    .as_ref()
                    .map(|caps| caps.bandwidth_mbps >= RELAY_MIN_BANDWIDTH_MBPS)
                    .unwrap_or(false)
            })
            .map(|record| record.node_id)
            .collect()
    }

    async fn request_peer_list(
        &self,
        peer: NodeId,
        request: DiscoveryPayload,
    ) -> MeshResult<Vec<PeerInfo>> {
        let request_id = match &request {
            DiscoveryPayload::NeighborRequest { request_id }
            | DiscoveryPayload::PeerListRequest { request_id } => *request_id,
            _ => return Err(MeshError::Internal("not a peer list request".to_string())),
        };
        let (tx, rx) = oneshot::channel();
        self.pending_peer_lists.lock().await.insert(request_id, tx);

        let payload = request.encode()?;
        if let Err(e) = self
            .peers
            .send_frame(peer, FrameKind::PeerDiscovery, payload, false)
            .await
        {
            self.pending_peer_lists.lock().await.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(Duration::from_millis(self.config.path_probe_timeout_ms), rx)
            .await
        {
            Ok(Ok(peers)) => Ok(peers),
            _ => {
                self.pending_peer_lists.lock().await.remove(&request_id);
                Err(MeshError::QueryTimeout)
            }
        }
    }

    /// Ask an intermediate whether it can reach the destination. Returns the answer and
    /// stores a scored path on success.
    async fn probe_path_via(&self, intermediate: NodeId, destination: NodeId) -> MeshResult<bool> {
        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending_paths.lock().await.insert(request_id, tx);

        let payload = DiscoveryPayload::PathQuery {
            destination,
            request_id,
        }
        .encode()?;
        if let Err(e) = self
            .peers
            .send_frame(intermediate, FrameKind::PeerDiscovery, payload, false)
            .await
        {
            self.pending_paths.lock().await.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(Duration::from_millis(self.config.path_probe_timeout_ms), rx)
            .await
        {
            Ok(Ok(has_path)) => Ok(has_path),
            _ => {
                self.pending_paths.lock().await.remove(&request_id);
                Err(MeshError::QueryTimeout)
            }
        }
    }

    async fn relay_path(&self, relay: NodeId, destination: NodeId) -> RoutingPath {
        let relay_latency = self
            .peers
            .peer_info(relay)
            .await
            .and_then(|record| record.latency_ms)
            .unwrap_or(50);
        RoutingPath {
            destination,
            hops: vec![relay, destination],
            latency_ms: relay_latency * 2,
            reliability: DISCOVERED_PATH_RELIABILITY,
            last_used_ms: chrono::Utc::now().timestamp_millis(),
            use_count: 0,
        }
    }

    async fn best_cached_path(&self, destination: NodeId, now_ms: i64) -> Option<RoutingPath> {
        let paths = self.paths.read().await;
        paths.get(&destination).and_then(|list| {
            list.iter()
                .max_by(|a, b| {
                    a.score(now_ms)
                        .partial_cmp(&b.score(now_ms))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .cloned()
        })
    }

    /// Probe every connected intermediate for a route to the destination, keep the top
    /// paths by score.
    async fn probe_paths(&self, destination: NodeId) {
        let connected = self.peers.connected_peers().await;
        let mut discovered: Vec<RoutingPath> = Vec::new();

        if connected.contains(&destination) {
            let latency = self
                .peers
                .peer_info(destination)
                .await
                .and_then(|record| record.latency_ms)
                .unwrap_or(0);
            discovered.push(RoutingPath {
                destination,
                hops: vec![destination],
                latency_ms: latency,
                reliability: DIRECT_PATH_RELIABILITY,
                last_used_ms: chrono::Utc::now().timestamp_millis(),
                use_count: 0,
            });
        }

        for intermediate in connected {
            if intermediate == destination {
                continue;
            }
            let started = Instant::now();
            match self.probe_path_via(intermediate, destination).await {
                Ok(true) => {
                    let rtt = started.elapsed().as_millis() as u64;
                    let intermediate_latency = self
                        .peers
                        .peer_info(intermediate)
                        .await
                        .and_then(|record| record.latency_ms)
                        .unwrap_or(rtt);
                    discovered.push(RoutingPath {
                        destination,
                        hops: vec![intermediate, destination],
                        latency_ms: intermediate_latency.saturating_add(rtt),
                        reliability: DISCOVERED_PATH_RELIABILITY,
                        last_used_ms: chrono::Utc::now().timestamp_millis(),
                        use_count: 0,
                    });
                }
                Ok(false) => {}
                Err(e) => trace!("path probe via {} failed: {}", intermediate, e),
            }
        }

        for path in discovered {
            self.store_path(path).await;
        }
    }

    async fn store_path(&self, path: RoutingPath) {
        let now = chrono::Utc::now().timestamp_millis();
        let max_paths = self.config.max_paths_per_destination;
        let mut paths = self.paths.write().await;
        let list = paths.entry(path.destination).or_default();
        if let Some(existing) = list.iter_mut().find(|p| p.hops == path.hops) {
            existing.latency_ms = path.latency_ms;
        } else {
            list.push(path);
        }
        list.sort_by(|a, b| {
            b.score(now)
                .partial_cmp(&a.score(now))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        list.truncate(max_paths);
    }

    /// Inbound discovery traffic routed here by the orchestrator.
    pub async fn handle_payload(&self, from: NodeId, payload: DiscoveryPayload) {
        match payload {
            DiscoveryPayload::NeighborRequest { request_id } => {
                let peers = self.collect_peer_infos(true, 10).await;
                self.answer(from, DiscoveryPayload::NeighborResponse { request_id, peers })
                    .await;
            }
            DiscoveryPayload::PeerListRequest { request_id } => {
                let peers = self.collect_peer_infos(false, 20).await;
                self.answer(from, DiscoveryPayload::PeerListResponse { request_id, peers })
                    .await;
            }
            DiscoveryPayload::NeighborResponse { request_id, peers }
            | DiscoveryPayload::PeerListResponse { request_id, peers } => {
                if let Some(tx) = self.pending_peer_lists.lock().await.remove(&request_id) {
                    let _ = tx.send(peers);
                }
            }
            DiscoveryPayload::PathQuery {
                destination,
                request_id,
            } => {
                let has_path = self.peers.connected_peers().await.contains(&destination)
                    || self.paths.read().await.contains_key(&destination);
                self.answer(from, DiscoveryPayload::PathResponse { request_id, has_path })
                    .await;
            }
            DiscoveryPayload::PathResponse { request_id, has_path } => {
                if let Some(tx) = self.pending_paths.lock().await.remove(&request_id) {
                    let _ = tx.send(has_path);
                }
            }
            DiscoveryPayload::Advertisement(ad) => {
                self.absorb_advertisement(from, ad).await;
            }
            DiscoveryPayload::SecurityAlert {
                malicious_peer,
                severity,
                timestamp_ms: _,
            } => {
                self.events.publish(MeshEvent::SecurityAlertReceived {
                    source: from,
                    malicious_peer,
                    severity,
                });
            }
            DiscoveryPayload::PartitionHealing {
                affected_peers,
                request_id,
            } => {
                let mut peers = self.collect_peer_infos(false, 20).await;
                peers.retain(|info| info.node_id != from);
                // Prioritize the peers the requester actually lost.
                peers.sort_by_key(|info| !affected_peers.contains(&info.node_id));
                self.answer(
                    from,
                    DiscoveryPayload::PartitionHealingResponse { peers, request_id },
                )
                .await;
            }
            DiscoveryPayload::PartitionHealingResponse { peers, request_id } => {
                if let Some(tx) = self.pending_peer_lists.lock().await.remove(&request_id) {
                    let _ = tx.send(peers);
                }
            }
            DiscoveryPayload::FindNode { .. } | DiscoveryPayload::FindNodeResp { .. } => {
                // Routed to the routing service by the orchestrator.
            }
        }
    }

    async fn absorb_advertisement(&self, from: NodeId, ad: PeerAdvertisement) {
        if ad.peer == self.local {
            return;
        }
        if !ad.verify() {
            warn!("dropping advertisement with bad signature from {}", from);
            return;
        }
        let now = chrono::Utc::now().timestamp_millis();
        if ad.is_expired(now) {
            return;
        }
        let info = PeerInfo {
            node_id: ad.peer,
            public_key: ad.public_key.clone(),
            capabilities: Some(ad.capabilities.clone()),
            reputation: self
                .peers
                .peer_info(ad.peer)
                .await
                .map(|record| record.reputation)
                .unwrap_or(0.5),
            latency_ms: None,
        };
        let newly_known = self.absorb_peer_info(&info).await;
        self.advertisements.write().await.insert(ad.peer, ad);
        if let Some(peer) = newly_known {
            self.events
                .publish(MeshEvent::PeersDiscovered { peers: vec![peer] });
        }
    }

    async fn answer(&self, to: NodeId, payload: DiscoveryPayload) {
        match payload.encode() {
            Ok(bytes) => {
                if let Err(e) = self
                    .peers
                    .send_frame(to, FrameKind::PeerDiscovery, bytes, false)
                    .await
                {
                    debug!("failed to answer discovery request from {}: {}", to, e);
                }
            }
            Err(e) => warn!("failed to encode discovery response: {}", e),
        }
    }

    async fn collect_peer_infos(&self, connected_only: bool, limit: usize) -> Vec<PeerInfo> {
        let connected = self.peers.connected_peers().await;
        let mut infos: Vec<PeerInfo> = self
            .peers
            .all_peers()
            .await
            .into_iter()
            .filter(|record| !connected_only || connected.contains(&record.node_id))
            .filter(|record| record.node_id != self.local)
            .take(limit)
            .map(|record| PeerInfo {
                node_id: record.node_id,
                public_key: record.public_key.unwrap_or_default(),
                capabilities: record.capabilities,
                reputation: record.reputation,
                latency_ms: record.latency_ms,
            })
            .collect();
        infos.truncate(limit);
        infos
    }

    /// Prune expired advertisements and push advertised knowledge into routing.
    async fn refresh_topology(&self) {
        let now = chrono::Utc::now().timestamp_millis();
        let expired: Vec<NodeId> = {
            let mut ads = self.advertisements.write().await;
            let expired: Vec<NodeId> = ads
                .values()
                .filter(|ad| ad.is_expired(now))
                .map(|ad| ad.peer)
                .collect();
            for peer in &expired {
                ads.remove(peer);
            }
            expired
        };
        if !expired.is_empty() {
            debug!("pruned {} expired advertisements", expired.len());
        }

        let ads: Vec<PeerAdvertisement> =
            self.advertisements.read().await.values().cloned().collect();
        for ad in ads {
            let mut node = DhtNode::new(&self.local, ad.peer);
            node.capabilities = Some(ad.capabilities.clone());
            node.reputation = self
                .peers
                .peer_info(ad.peer)
                .await
                .map(|record| record.reputation)
                .unwrap_or(0.5);
            self.routing.add_or_update(node).await;
        }
    }

    pub async fn stats(&self) -> DiscoveryStats {
        DiscoveryStats {
            known_advertisements: self.advertisements.read().await.len(),
            cached_paths: self.paths.read().await.values().map(Vec::len).sum(),
            methods: self.method_stats.read().await.clone(),
        }
    }

    /// Discovery maintenance: every period discover, advertise, prune, and recompute
    /// topology; on the slower cadence refresh paths for known destinations.
    pub fn spawn_maintenance_loops(self: &Arc<Self>, cancel: CancellationToken) {
        let discovery = Arc::clone(self);
        let loop_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(Duration::from_millis(
                discovery.config.discovery_interval_ms.max(1),
            ));
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    _ = timer.tick() => {
                        discovery.discover().await;
                        if let Err(e) = discovery.advertise_self().await {
                            debug!("advertisement skipped: {}", e);
                        }
                        discovery.refresh_topology().await;
                    }
                }
            }
        });

        let discovery = Arc::clone(self);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(Duration::from_millis(
                discovery.config.topology_interval_ms.max(1),
            ));
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = timer.tick() => {
                        let destinations: Vec<NodeId> =
                            discovery.paths.read().await.keys().copied().collect();
                        for destination in destinations {
                            discovery.probe_paths(destination).await;
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_score_prefers_fast_reliable_fresh() {
        let now = chrono::Utc::now().timestamp_millis();
        let fast = RoutingPath {
            destination: NodeId::random(),
            hops: vec![NodeId::random()],
            latency_ms: 10,
            reliability: 0.9,
            last_used_ms: now,
            use_count: 5,
        };
        let slow = RoutingPath {
            destination: fast.destination,
            hops: vec![NodeId::random()],
            latency_ms: 250,
            reliability: 0.4,
            last_used_ms: now - 12 * 3_600_000,
            use_count: 0,
        };
        assert!(fast.score(now) > slow.score(now));
    }

    #[test]
    fn latency_score_floors_at_zero() {
        let now = chrono::Utc::now().timestamp_millis();
        let path = RoutingPath {
            destination: NodeId::random(),
            hops: vec![NodeId::random()],
            latency_ms: 10_000,
            reliability: 1.0,
            last_used_ms: now,
            use_count: 0,
        };
        // 0.4 * 0 + 0.4 * 1.0 + 0.1 * 1.0 + 0.1 * 0
        assert!((path.score(now) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn usage_bonus_saturates() {
        let now = chrono::Utc::now().timestamp_millis();
        let mut path = RoutingPath {
            destination: NodeId::random(),
            hops: vec![NodeId::random()],
            latency_ms: 100,
            reliability: 0.0,
            last_used_ms: now,
            use_count: 100,
        };
        let capped = path.score(now);
        path.use_count = 1_000;
        assert!((path.score(now) - capped).abs() < 1e-9);
    }

    #[test]
    fn reliability_learning_moves_toward_outcomes() {
        let now = chrono::Utc::now().timestamp_millis();
        let mut path = RoutingPath {
            destination: NodeId::random(),
            hops: vec![NodeId::random()],
            latency_ms: 50,
            reliability: DISCOVERED_PATH_RELIABILITY,
            last_used_ms: now,
            use_count: 0,
        };
        path.record_use(true, now);
        assert!(path.reliability > DISCOVERED_PATH_RELIABILITY);
        let boosted = path.reliability;
        path.record_use(false, now);
        assert!(path.reliability < boosted);
    }

    #[test]
    fn method_stats_rate() {
        let mut stats = MethodStats::default();
        assert!((stats.success_rate() - 1.0).abs() < f64::EPSILON);
        stats.attempts = 4;
        stats.successes = 3;
        stats.failures = 1;
        assert!((stats.success_rate() - 0.75).abs() < f64::EPSILON);
    }
}
