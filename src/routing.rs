// ===================================================================================================
// Routing Layer - XOR-Metric K-Bucket Table and Iterative Lookups
// ===================================================================================================
//
// The routing table holds up to k=20 nodes per bucket across 160 buckets, indexed by
// floor(log2(xor(local, id))). Invariants maintained here:
// - a node appears in at most one bucket (its distance to the local id is fixed);
// - the local node never appears in its own table;
// - eviction is LRU-with-probe: a full bucket's least-recently-seen node is pinged, and only
//   evicted when the ping goes unanswered.
//
// Lookups are iterative Kademlia with concurrency alpha=3: each round queries up to alpha
// unseen candidates, merges the answers, and stops once k candidates are collected or no
// unseen node remains. A failed or timed-out query never fails the lookup.
//
// ===================================================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::{MeshError, MeshResult};
use crate::identity::{Distance, NodeId};
use crate::messages::{DhtNodeInfo, DiscoveryPayload, FrameKind};
use crate::peer_manager::PeerManagerHandle;
use crate::telemetry::CapabilitySnapshot;

/// Standard Kademlia bucket width.
pub const K: usize = 20;
/// Lookup concurrency bound.
pub const ALPHA: usize = 3;
/// One bucket per bit of the id space.
pub const BUCKET_COUNT: usize = 160;
/// Deadline for a single FIND_NODE query.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
/// Buckets containing a node older than this trigger a refresh lookup.
pub const BUCKET_STALE_AFTER_MS: i64 = 300_000;

/// One entry of the routing table.
#[derive(Debug, Clone)]
pub struct DhtNode {
    pub node_id: NodeId,
    /// XOR distance to the local node, fixed at insert time.
    pub distance: Distance,
    pub last_seen_ms: i64,
    pub capabilities: Option<CapabilitySnapshot>,
    pub reputation: f64,
}

impl DhtNode {
    pub fn new(local: &NodeId, node_id: NodeId) -> Self {
        DhtNode {
            node_id,
            distance: local.distance(&node_id),
            last_seen_ms: chrono::Utc::now().timestamp_millis(),
            capabilities: None,
            reputation: 0.5,
        }
    }

    pub fn to_wire(&self) -> DhtNodeInfo {
        DhtNodeInfo {
            node_id: self.node_id,
            capabilities: self.capabilities.clone(),
            reputation: self.reputation,
        }
    }
}

/// Result of a table insert attempt.
#[derive(Debug)]
pub enum AddOutcome {
    Added,
    Updated,
    /// Bucket full; the least-recently-seen occupant must answer a ping or yield its slot.
    PendingEviction { lru: NodeId },
    Rejected,
}

/// Ordered bucket: front is least recently seen, back is most recent.
#[derive(Debug, Default)]
struct KBucket {
    nodes: Vec<DhtNode>,
}

/// The k-bucket table. All access goes through one coarse lock in `RoutingService`.
pub struct RoutingTable {
    local: NodeId,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    pub fn new(local: NodeId) -> Self {
        let mut buckets = Vec::with_capacity(BUCKET_COUNT);
        buckets.resize_with(BUCKET_COUNT, KBucket::default);
        RoutingTable { local, buckets }
    }

    pub fn local_id(&self) -> NodeId {
        self.local
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.nodes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.bucket_index_of(node_id)
            .map(|index| {
                self.buckets[index]
                    .nodes
                    .iter()
                    .any(|node| node.node_id == *node_id)
            })
            .unwrap_or(false)
    }

    fn bucket_index_of(&self, node_id: &NodeId) -> Option<usize> {
        self.local.distance(node_id).bucket_index()
    }

    pub fn add_or_update(&mut self, mut node: DhtNode) -> AddOutcome {
        let Some(index) = self.bucket_index_of(&node.node_id) else {
            // Zero distance: the local node itself.
            return AddOutcome::Rejected;
        };
        node.distance = self.local.distance(&node.node_id);
        let bucket = &mut self.buckets[index];

        if let Some(pos) = bucket
            .nodes
            .iter()
            .position(|existing| existing.node_id == node.node_id)
        {
            let mut existing = bucket.nodes.remove(pos);
            existing.last_seen_ms = node.last_seen_ms;
            // Wire-sourced entries carry capabilities and a meaningful reputation;
            // bare liveness touches must not reset either.
            if node.capabilities.is_some() {
                existing.capabilities = node.capabilities;
                existing.reputation = node.reputation;
            }
            bucket.nodes.push(existing);
            return AddOutcome::Updated;
        }

        if bucket.nodes.len() < K {
            bucket.nodes.push(node);
            return AddOutcome::Added;
        }

        AddOutcome::PendingEviction {
            lru: bucket.nodes[0].node_id,
        }
    }

    /// Replace the bucket's LRU entry with the new node. Only valid after the LRU
    /// failed its ping; callers re-check the bucket under the lock.
    fn evict_and_insert(&mut self, lru: NodeId, node: DhtNode) -> bool {
        let Some(index) = self.bucket_index_of(&node.node_id) else {
            return false;
        };
        let bucket = &mut self.buckets[index];
        let Some(pos) = bucket.nodes.iter().position(|n| n.node_id == lru) else {
            return false;
        };
        bucket.nodes.remove(pos);
        if bucket.nodes.len() < K {
            bucket.nodes.push(node);
            true
        } else {
            false
        }
    }

    pub fn remove(&mut self, node_id: &NodeId) -> bool {
        let Some(index) = self.bucket_index_of(node_id) else {
            return false;
        };
        let bucket = &mut self.buckets[index];
        let before = bucket.nodes.len();
        bucket.nodes.retain(|node| node.node_id != *node_id);
        bucket.nodes.len() != before
    }

    pub fn mark_seen(&mut self, node_id: &NodeId) {
        if let Some(index) = self.bucket_index_of(node_id) {
            let bucket = &mut self.buckets[index];
            if let Some(pos) = bucket.nodes.iter().position(|n| n.node_id == *node_id) {
                let mut node = bucket.nodes.remove(pos);
                node.last_seen_ms = chrono::Utc::now().timestamp_millis();
                bucket.nodes.push(node);
            }
        }
    }

    pub fn set_reputation(&mut self, node_id: &NodeId, score: f64) {
        if let Some(index) = self.bucket_index_of(node_id) {
            if let Some(node) = self.buckets[index]
                .nodes
                .iter_mut()
                .find(|n| n.node_id == *node_id)
            {
                node.reputation = score.clamp(0.0, 1.0);
            }
        }
    }

    /// Up to `n` known nodes sorted by XOR distance to `target`.
    pub fn closest(&self, target: &NodeId, n: usize) -> Vec<DhtNode> {
        let mut all: Vec<DhtNode> = self
            .buckets
            .iter()
            .flat_map(|bucket| bucket.nodes.iter().cloned())
            .collect();
        all.sort_by_key(|node| target.distance(&node.node_id));
        all.truncate(n);
        all
    }

    /// Indices of buckets whose oldest member has not been seen within the stale window.
    fn stale_buckets(&self, now_ms: i64) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| {
                bucket
                    .nodes
                    .iter()
                    .any(|node| now_ms.saturating_sub(node.last_seen_ms) > BUCKET_STALE_AFTER_MS)
            })
            .map(|(index, _)| index)
            .collect()
    }

    /// A random id whose distance from the local node falls inside the given bucket.
    fn random_id_in_bucket(&self, index: usize) -> NodeId {
        let mut distance = [0u8; 20];
        let byte = 19 - index / 8;
        let bit = index % 8;
        distance[byte] = 1 << bit;
        // Randomize the bits below the bucket's most significant bit.
        for b in distance.iter_mut().skip(byte + 1) {
            *b = rand::random::<u8>();
        }
        distance[byte] |= rand::random::<u8>() & ((1u16 << bit) as u8).wrapping_sub(1);

        let mut id = [0u8; 20];
        for (i, out) in id.iter_mut().enumerate() {
            *out = self.local.as_bytes()[i] ^ distance[i];
        }
        NodeId::from_bytes(id)
    }
}

/// Async facade over the table: answers FIND_NODE, runs lookups, refreshes buckets.
pub struct RoutingService {
    local: NodeId,
    table: Arc<RwLock<RoutingTable>>,
    peers: PeerManagerHandle,
    pending: Arc<Mutex<HashMap<Uuid, oneshot::Sender<Vec<DhtNodeInfo>>>>>,
}

impl RoutingService {
    pub fn new(local: NodeId, peers: PeerManagerHandle) -> Arc<Self> {
        Arc::new(RoutingService {
            local,
            table: Arc::new(RwLock::new(RoutingTable::new(local))),
            peers,
            pending: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn local_id(&self) -> NodeId {
        self.local
    }

    pub async fn table_size(&self) -> usize {
        self.table.read().await.len()
    }

    pub async fn contains(&self, node_id: &NodeId) -> bool {
        self.table.read().await.contains(node_id)
    }

    /// Insert or refresh a node. When the target bucket is full, the LRU occupant is pinged;
    /// it keeps its slot on a pong and is replaced on a timeout.
    pub async fn add_or_update(&self, node: DhtNode) {
        if node.node_id == self.local {
            return;
        }
        let outcome = self.table.write().await.add_or_update(node.clone());
        match outcome {
            AddOutcome::Added | AddOutcome::Updated | AddOutcome::Rejected => {}
            AddOutcome::PendingEviction { lru } => {
                let alive = self.peers.probe(lru, QUERY_TIMEOUT).await;
                let mut table = self.table.write().await;
                if alive {
                    trace!("bucket LRU {} answered, keeping it", lru);
                    table.mark_seen(&lru);
                } else {
                    debug!("evicting unresponsive LRU {} for {}", lru, node.node_id);
                    table.evict_and_insert(lru, node);
                }
            }
        }
    }

    pub async fn remove(&self, node_id: &NodeId) {
        self.table.write().await.remove(node_id);
    }

    pub async fn mark_seen(&self, node_id: &NodeId) {
        self.table.write().await.mark_seen(node_id);
    }

    pub async fn set_reputation(&self, node_id: &NodeId, score: f64) {
        self.table.write().await.set_reputation(node_id, score);
    }

    /// Up to `n` known nodes sorted by XOR distance to `target`.
    pub async fn closest(&self, target: &NodeId, n: usize) -> Vec<DhtNode> {
        self.table.read().await.closest(target, n)
    }

    /// Iterative Kademlia lookup toward `target`.
    ///
    /// Seeds with the alpha closest known nodes, queries up to alpha unseen candidates per
    /// round, and merges the answers until k candidates are collected or no unseen node
    /// remains. Individual query failures are absorbed.
    pub async fn lookup(&self, target: NodeId) -> Vec<DhtNode> {
        let mut shortlist: HashMap<NodeId, DhtNode> = HashMap::new();
        for node in self.closest(&target, ALPHA).await {
            shortlist.insert(node.node_id, node);
        }
        let mut queried: HashSet<NodeId> = HashSet::new();

        loop {
            let mut unseen: Vec<DhtNode> = shortlist
                .values()
                .filter(|node| !queried.contains(&node.node_id))
                .cloned()
                .collect();
            unseen.sort_by_key(|node| target.distance(&node.node_id));
            unseen.truncate(ALPHA);

            if unseen.is_empty() || shortlist.len() >= K {
                break;
            }

            let round = unseen.iter().map(|node| {
                let peer = node.node_id;
                async move { (peer, self.query_find_node(peer, target).await) }
            });
            let answers = futures::future::join_all(round).await;

            for (peer, answer) in answers {
                queried.insert(peer);
                match answer {
                    Ok(nodes) => {
                        self.mark_seen(&peer).await;
                        for info in nodes {
                            if info.node_id == self.local {
                                continue;
                            }
                            let mut node = DhtNode::new(&self.local, info.node_id);
                            node.capabilities = info.capabilities;
                            node.reputation = info.reputation;
                            self.add_or_update(node.clone()).await;
                            shortlist.entry(node.node_id).or_insert(node);
                        }
                    }
                    Err(MeshError::QueryTimeout) => {
                        trace!("find_node to {} timed out", peer);
                    }
                    Err(e) => {
                        trace!("find_node to {} failed: {}", peer, e);
                    }
                }
            }
        }

        let mut result: Vec<DhtNode> = shortlist.into_values().collect();
        result.sort_by_key(|node| target.distance(&node.node_id));
        result.truncate(K);
        result
    }

    /// One FIND_NODE query against a single peer, bounded by `QUERY_TIMEOUT`.
    async fn query_find_node(&self, peer: NodeId, target: NodeId) -> MeshResult<Vec<DhtNodeInfo>> {
        // Opening the channel is a no-op when already connected.
        self.peers.connect(peer).await?;

        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);

        let payload = DiscoveryPayload::FindNode { target, request_id }.encode()?;
        if let Err(e) = self
            .peers
            .send_frame(peer, FrameKind::PeerDiscovery, payload, false)
            .await
        {
            self.pending.lock().await.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(QUERY_TIMEOUT, rx).await {
            Ok(Ok(nodes)) => Ok(nodes),
            Ok(Err(_)) => Err(MeshError::QueryTimeout),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err(MeshError::QueryTimeout)
            }
        }
    }

    /// Inbound FIND_NODE traffic, routed here by the orchestrator's fan-out.
    pub async fn handle_payload(&self, from: NodeId, payload: &DiscoveryPayload) {
        match payload {
            DiscoveryPayload::FindNode { target, request_id } => {
                let nodes: Vec<DhtNodeInfo> = self
                    .closest(target, K)
                    .await
                    .iter()
                    .map(DhtNode::to_wire)
                    .collect();
                let response = DiscoveryPayload::FindNodeResp {
                    request_id: *request_id,
                    nodes,
                };
                match response.encode() {
                    Ok(bytes) => {
                        if let Err(e) = self
                            .peers
                            .send_frame(from, FrameKind::PeerDiscovery, bytes, false)
                            .await
                        {
                            debug!("failed to answer find_node from {}: {}", from, e);
                        }
                    }
                    Err(e) => warn!("failed to encode find_node response: {}", e),
                }
                // The querier is a live node; remember it.
                self.add_or_update(DhtNode::new(&self.local, from)).await;
            }
            DiscoveryPayload::FindNodeResp { request_id, nodes } => {
                if let Some(tx) = self.pending.lock().await.remove(request_id) {
                    let _ = tx.send(nodes.clone());
                }
            }
            _ => {}
        }
    }

    /// Periodic bucket refresh: any bucket holding a node older than the stale window
    /// triggers a lookup toward a random id within that bucket's range.
    pub fn spawn_refresh_loop(self: &Arc<Self>, cancel: CancellationToken) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(Duration::from_secs(60));
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = timer.tick() => {
                        let now = chrono::Utc::now().timestamp_millis();
                        let targets: Vec<NodeId> = {
                            let table = service.table.read().await;
                            table
                                .stale_buckets(now)
                                .into_iter()
                                .map(|index| table.random_id_in_bucket(index))
                                .collect()
                        };
                        for target in targets {
                            trace!("refreshing bucket via lookup toward {}", target);
                            service.lookup(target).await;
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

    fn id_with_bit(bit: usize) -> NodeId {
        let mut bytes = [0u8; 20];
        bytes[19 - bit / 8] = 1 << (bit % 8);
        NodeId::from_bytes(bytes)
    }

    #[test]
    fn nodes_land_in_log2_buckets() {
        let local = NodeId::from_bytes([0u8; 20]);
        let mut table = RoutingTable::new(local);

        for bit in [0usize, 9, 100, 159] {
            let node = DhtNode::new(&local, id_with_bit(bit));
            assert!(matches!(table.add_or_update(node), AddOutcome::Added));
        }
        assert_eq!(table.len(), 4);

        for bit in [0usize, 9, 100, 159] {
            let id = id_with_bit(bit);
            assert_eq!(local.distance(&id).bucket_index(), Some(bit));
            assert!(table.contains(&id));
        }
    }

    #[test]
    fn local_node_is_never_inserted() {
        let local = NodeId::random();
        let mut table = RoutingTable::new(local);
        let outcome = table.add_or_update(DhtNode::new(&local, local));
        assert!(matches!(outcome, AddOutcome::Rejected));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn duplicate_insert_updates_in_place() {
        let local = NodeId::from_bytes([0u8; 20]);
        let mut table = RoutingTable::new(local);
        let id = id_with_bit(42);

        assert!(matches!(
            table.add_or_update(DhtNode::new(&local, id)),
            AddOutcome::Added
        ));
        assert!(matches!(
            table.add_or_update(DhtNode::new(&local, id)),
            AddOutcome::Updated
        ));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn full_bucket_reports_lru_for_eviction() {
        let local = NodeId::from_bytes([0u8; 20]);
        let mut table = RoutingTable::new(local);

        // Fill bucket 159 with K distinct nodes.
        let mut first = None;
        for i in 0..K {
            let mut bytes = [0u8; 20];
            bytes[0] = 0x80;
            bytes[19] = i as u8 + 1;
            let id = NodeId::from_bytes(bytes);
            if first.is_none() {
                first = Some(id);
            }
            assert!(matches!(
                table.add_or_update(DhtNode::new(&local, id)),
                AddOutcome::Added
            ));
        }

        let mut bytes = [0u8; 20];
        bytes[0] = 0x80;
        bytes[19] = 0xFF;
        let newcomer = NodeId::from_bytes(bytes);
        match table.add_or_update(DhtNode::new(&local, newcomer)) {
            AddOutcome::PendingEviction { lru } => assert_eq!(lru, first.unwrap()),
            other => panic!("expected pending eviction, got {:?}", other),
        }

        // Eviction admits the newcomer in the LRU's place.
        assert!(table.evict_and_insert(first.unwrap(), DhtNode::new(&local, newcomer)));
        assert!(table.contains(&newcomer));
        assert!(!table.contains(&first.unwrap()));
    }

    #[test]
    fn closest_sorts_by_distance_to_target() {
        let local = NodeId::from_bytes([0u8; 20]);
        let mut table = RoutingTable::new(local);
        for bit in 0..25 {
            table.add_or_update(DhtNode::new(&local, id_with_bit(bit)));
        }

        let target = id_with_bit(3);
        let closest = table.closest(&target, 5);
        assert_eq!(closest.len(), 5);
        assert_eq!(closest[0].node_id, target);
        for pair in closest.windows(2) {
            assert!(target.distance(&pair[0].node_id) <= target.distance(&pair[1].node_id));
        }
    }

    #[test]
    fn random_refresh_id_falls_in_bucket() {
        let local = NodeId::random();
        let table = RoutingTable::new(local);
        for index in [0usize, 7, 63, 159] {
            for _ in 0..8 {
                let id = table.random_id_in_bucket(index);
                assert_eq!(local.distance(&id).bucket_index(), Some(index));
            }
        }
    }

    #[test]
    fn stale_buckets_are_detected() {
        let local = NodeId::from_bytes([0u8; 20]);
        let mut table = RoutingTable::new(local);
        let mut node = DhtNode::new(&local, id_with_bit(10));
        node.last_seen_ms = chrono::Utc::now().timestamp_millis() - BUCKET_STALE_AFTER_MS - 1_000;
        table.add_or_update(node);

        let now = chrono::Utc::now().timestamp_millis();
        assert_eq!(table.stale_buckets(now), vec![10]);
    }
}
