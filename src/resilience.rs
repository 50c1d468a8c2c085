// ===================================================================================================
// Network Resilience - Health, Partitions, Quarantine, and Circuit Breakers
// ===================================================================================================
//
// Resilience watches the fabric from the outside in. A periodic composite health score blends
// connectivity, latency, throughput, verification reliability, and security posture. When the
// connected/known ratio drops strictly below the partition threshold, a partition record is
// opened and healed in up to three cycles: direct reconnects, bridge-peer catalogs, then
// forced discovery. Peers that turn malicious (by verification record, spam rate, or invalid
// signatures) are quarantined: blacklisted, disconnected, and announced to trusted peers with
// a signed alert.
//
// Circuit breakers guard the downstream service keys {network, dht, verification, discovery}
// with the classic Closed -> Open -> HalfOpen cycle; HalfOpen closes on a single success and
// reopens on any failure.
//
// ===================================================================================================

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ResilienceConfig;
use crate::discovery::PeerDiscovery;
use crate::error::{MeshError, MeshResult};
use crate::events::{EventBus, MeshEvent};
use crate::identity::{NodeId, NodeIdentity};
use crate::messages::{AlertSeverity, DiscoveryPayload, FrameKind};
use crate::peer_manager::PeerManagerHandle;
use crate::telemetry::CapabilitySnapshot;
use crate::verification::TaskVerification;

/// Health samples retained for trend inspection.
const HEALTH_HISTORY: usize = 100;
/// Window over which critical security events depress the health score.
const CRITICAL_EVENT_WINDOW_MS: i64 = 300_000;
/// Invalid signatures tolerated from one peer before quarantine.
const INVALID_SIGNATURE_QUARANTINE: u32 = 3;
/// Reputation penalty applied per invalid signature.
const INVALID_SIGNATURE_PENALTY: f64 = 0.1;
/// Fraction of affected peers that must return for a partition to count as healed.
const PARTITION_HEAL_RATIO: f64 = 0.8;
/// Healing cycles before a partition is declared permanent.
const MAX_HEALING_ATTEMPTS: u32 = 3;
/// Reconnect backoff schedule after a peer drops.
const RECOVERY_BACKOFF: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

/// Downstream services guarded by circuit breakers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKey {
    Network,
    Dht,
    Verification,
    Discovery,
}

impl std::fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceKey::Network => write!(f, "network"),
            ServiceKey::Dht => write!(f, "dht"),
            ServiceKey::Verification => write!(f, "verification"),
            ServiceKey::Discovery => write!(f, "discovery"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Failure-counting guard for one downstream service.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    threshold: u32,
    timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, timeout: Duration) -> Self {
        CircuitBreaker {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            threshold,
            timeout,
        }
    }

    /// Whether a request may pass. An open breaker flips to half-open once its
    /// timeout has elapsed.
    pub fn allow_request(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => match self.last_failure {
                Some(at) if at.elapsed() >= self.timeout => {
                    self.state = CircuitState::HalfOpen;
                    true
                }
                _ => false,
            },
            CircuitState::HalfOpen => true,
        }
    }

    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::HalfOpen | CircuitState::Open => {
                self.state = CircuitState::Closed;
                self.failure_count = 0;
            }
            CircuitState::Closed => {
                self.failure_count = 0;
            }
        }
    }

    pub fn record_failure(&mut self) {
        self.last_failure = Some(Instant::now());
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.threshold {
                    self.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
            }
            CircuitState::Open => {}
        }
    }

    /// Force the breaker open, e.g. on a detected flood.
    pub fn trip(&mut self) {
        self.state = CircuitState::Open;
        self.last_failure = Some(Instant::now());
        self.failure_count = self.threshold;
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }
}

/// One composite health observation.
#[derive(Debug, Clone)]
pub struct HealthSample {
    pub timestamp_ms: i64,
    pub connectivity: f64,
    pub latency: f64,
    pub throughput: f64,
    pub reliability: f64,
    pub security: f64,
    pub composite: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionStatus {
    Detected,
    Healing,
    Healed,
    Permanent,
}

/// A detected loss of a large fraction of the known overlay.
#[derive(Debug, Clone)]
pub struct NetworkPartition {
    pub id: Uuid,
    pub detected_at_ms: i64,
    pub affected: Vec<NodeId>,
    pub bridges: Vec<NodeId>,
    pub healing_attempts: u32,
    pub status: PartitionStatus,
}

/// The resilience subsystem.
pub struct NetworkResilience {
    local: NodeId,
    peers: PeerManagerHandle,
    discovery: Arc<PeerDiscovery>,
    verification: Arc<TaskVerification>,
    events: EventBus,
    config: ResilienceConfig,
    trusted: HashSet<NodeId>,
    health_history: RwLock<VecDeque<HealthSample>>,
    partitions: RwLock<HashMap<Uuid, NetworkPartition>>,
    breakers: RwLock<HashMap<ServiceKey, CircuitBreaker>>,
    blacklist: RwLock<HashSet<NodeId>>,
    invalid_signatures: RwLock<HashMap<NodeId, u32>>,
    critical_events: RwLock<VecDeque<i64>>,
    cancel: CancellationToken,
}

impl NetworkResilience {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: Arc<NodeIdentity>,
        peers: PeerManagerHandle,
        discovery: Arc<PeerDiscovery>,
        verification: Arc<TaskVerification>,
        events: EventBus,
        config: ResilienceConfig,
        cancel: CancellationToken,
    ) -> MeshResult<Arc<Self>> {
        let trusted = config
            .trusted_peers
            .iter()
            .map(|id| NodeId::from_hex(id))
            .collect::<MeshResult<HashSet<_>>>()?;

        let breaker = |config: &ResilienceConfig| {
            CircuitBreaker::new(
                config.breaker_failure_threshold,
                Duration::from_millis(config.breaker_timeout_ms),
            )
        };
        let mut breakers = HashMap::new();
        for service in [
            ServiceKey::Network,
            ServiceKey::Dht,
            ServiceKey::Verification,
            ServiceKey::Discovery,
        ] {
            breakers.insert(service, breaker(&config));
        }

        Ok(Arc::new(NetworkResilience {
            local: identity.node_id(),
            peers,
            discovery,
            verification,
            events,
            config,
            trusted,
            health_history: RwLock::new(VecDeque::with_capacity(HEALTH_HISTORY)),
            partitions: RwLock::new(HashMap::new()),
            breakers: RwLock::new(breakers),
            blacklist: RwLock::new(HashSet::new()),
            invalid_signatures: RwLock::new(HashMap::new()),
            critical_events: RwLock::new(VecDeque::new()),
            cancel,
        }))
    }

    // ----- circuit breakers -----

    /// Fail fast when the service's breaker is open.
    pub async fn guard(&self, service: ServiceKey) -> MeshResult<()> {
        let mut breakers = self.breakers.write().await;
        let breaker = breakers
            .get_mut(&service)
            .ok_or_else(|| MeshError::Internal(format!("unknown service {}", service)))?;
        if breaker.allow_request() {
            Ok(())
        } else {
            Err(MeshError::CircuitBreakerOpen(service.to_string()))
        }
    }

    pub async fn record_success(&self, service: ServiceKey) {
        if let Some(breaker) = self.breakers.write().await.get_mut(&service) {
            breaker.record_success();
        }
    }

    pub async fn record_failure(&self, service: ServiceKey) {
        if let Some(breaker) = self.breakers.write().await.get_mut(&service) {
            breaker.record_failure();
        }
    }

    pub async fn breaker_state(&self, service: ServiceKey) -> Option<CircuitState> {
        self.breakers
            .read()
            .await
            .get(&service)
            .map(CircuitBreaker::state)
    }

    // ----- security -----

    /// Called by the orchestrator when the peer manager drops a frame with a bad signature.
    pub async fn note_invalid_signature(self: &Arc<Self>, from: NodeId) {
        self.note_critical_event().await;
        if let Some(record) = self.peers.peer_info(from).await {
            self.peers
                .set_reputation(from, (record.reputation - INVALID_SIGNATURE_PENALTY).max(0.0));
        }
        let count = {
            let mut counts = self.invalid_signatures.write().await;
            let entry = counts.entry(from).or_insert(0);
            *entry += 1;
            *entry
        };
        if count >= INVALID_SIGNATURE_QUARANTINE {
            self.quarantine(from, AlertSeverity::High, "repeated invalid signatures")
                .await;
            self.invalid_signatures.write().await.remove(&from);
        }
    }

    pub async fn is_blacklisted(&self, peer: &NodeId) -> bool {
        self.blacklist.read().await.contains(peer)
    }

    /// Operator override: lift a quarantine.
    pub async fn clear_quarantine(&self, peer: &NodeId) {
        self.blacklist.write().await.remove(peer);
    }

    /// Blacklist, disconnect, and alert trusted peers about a misbehaving node.
    pub async fn quarantine(self: &Arc<Self>, peer: NodeId, severity: AlertSeverity, reason: &str) {
        if self.trusted.contains(&peer) {
            debug!("not quarantining trusted peer {} ({})", peer, reason);
            return;
        }
        {
            let mut blacklist = self.blacklist.write().await;
            if !blacklist.insert(peer) {
                return;
            }
        }
        warn!("quarantining {}: {}", peer, reason);
        self.note_critical_event().await;
        let _ = self.peers.disconnect(peer).await;

        // Signed alert to every trusted peer that is reachable.
        let payload = DiscoveryPayload::SecurityAlert {
            malicious_peer: peer,
            severity,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        };
        if let Ok(bytes) = payload.encode() {
            for trusted in &self.trusted {
                if self.peers.connect(*trusted).await.is_ok() {
                    let _ = self
                        .peers
                        .send_frame(*trusted, FrameKind::PeerDiscovery, bytes.clone(), true)
                        .await;
                }
            }
        }

        self.events.publish(MeshEvent::SecurityAlertReceived {
            source: self.local,
            malicious_peer: peer,
            severity,
        });
    }

    async fn note_critical_event(&self) {
        let now = chrono::Utc::now().timestamp_millis();
        let mut events = self.critical_events.write().await;
        events.push_back(now);
        while events.len() > HEALTH_HISTORY {
            events.pop_front();
        }
    }

    async fn recent_critical_events(&self) -> usize {
        let cutoff = chrono::Utc::now().timestamp_millis() - CRITICAL_EVENT_WINDOW_MS;
        self.critical_events
            .read()
            .await
            .iter()
            .filter(|at| **at >= cutoff)
            .count()
    }

    // ----- health -----

    /// One composite health observation:
    /// 0.25 connectivity + 0.2 latency + 0.2 throughput + 0.25 reliability + 0.1 security.
    pub async fn sample_health(self: &Arc<Self>) -> HealthSample {
        let records = self.peers.all_peers().await;
        let connected = self.peers.connected_peers().await;
        let known = records.len();

        let connectivity = if known == 0 {
            1.0
        } else {
            connected.len() as f64 / known as f64
        };

        let latencies: Vec<u64> = records
            .iter()
            .filter_map(|record| record.latency_ms)
            .collect();
        let latency = if latencies.is_empty() {
            1.0
        } else {
            let average = latencies.iter().sum::<u64>() as f64 / latencies.len() as f64;
            (1.0 - average / 1000.0).max(0.0)
        };

        let throughput = (connected.len() as f64 / 10.0).min(1.0);
        let reliability = self.verification.approval_rate().await;
        let security = (1.0 - 0.2 * self.recent_critical_events().await as f64).max(0.0);

        let composite = 0.25 * connectivity
            + 0.2 * latency
            + 0.2 * throughput
            + 0.25 * reliability
            + 0.1 * security;

        let sample = HealthSample {
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            connectivity,
            latency,
            throughput,
            reliability,
            security,
            composite,
        };

        let mut history = self.health_history.write().await;
        history.push_back(sample.clone());
        while history.len() > HEALTH_HISTORY {
            history.pop_front();
        }
        sample
    }

    pub async fn latest_health(&self) -> Option<HealthSample> {
        self.health_history.read().await.back().cloned()
    }

    // ----- partitions -----

    /// Partition check: strictly below the threshold on connected/known opens a
    /// partition record and starts healing. Exactly at the threshold is healthy.
    async fn check_partition(self: &Arc<Self>) {
        let records = self.peers.all_peers().await;
        let connected: HashSet<NodeId> =
            self.peers.connected_peers().await.into_iter().collect();
        let known = records.len();
        let ratio = connected.len() as f64 / known.max(1) as f64;

        if ratio >= self.config.partition_threshold {
            return;
        }
        let affected: Vec<NodeId> = records
            .iter()
            .map(|record| record.node_id)
            .filter(|peer| !connected.contains(peer))
            .collect();
        if affected.is_empty() {
            return;
        }

        {
            let partitions = self.partitions.read().await;
            let active = partitions.values().any(|partition| {
                matches!(
                    partition.status,
                    PartitionStatus::Detected | PartitionStatus::Healing
                )
            });
            if active {
                return;
            }
        }

        let partition = NetworkPartition {
            id: Uuid::new_v4(),
            detected_at_ms: chrono::Utc::now().timestamp_millis(),
            affected: affected.clone(),
            bridges: connected.iter().copied().collect(),
            healing_attempts: 0,
            status: PartitionStatus::Detected,
        };
        let partition_id = partition.id;
        warn!(
            "partition detected: {}/{} peers reachable, {} affected",
            connected.len(),
            known,
            affected.len()
        );
        self.partitions.write().await.insert(partition_id, partition);
        self.events.publish(MeshEvent::PartitionDetected {
            partition_id,
            affected,
        });

        let resilience = Arc::clone(self);
        tokio::spawn(async move {
            resilience.heal_partition(partition_id).await;
        });
    }

    /// Up to three healing cycles: direct reconnects, bridge catalogs, forced discovery.
    async fn heal_partition(self: &Arc<Self>, partition_id: Uuid) {
        let (affected, bridges) = {
            let mut partitions = self.partitions.write().await;
            let Some(partition) = partitions.get_mut(&partition_id) else {
                return;
            };
            partition.status = PartitionStatus::Healing;
            (partition.affected.clone(), partition.bridges.clone())
        };
        let needed = ((affected.len() as f64) * PARTITION_HEAL_RATIO).ceil() as usize;

        for attempt in 1..=MAX_HEALING_ATTEMPTS {
            if self.cancel.is_cancelled() {
                return;
            }
            debug!("partition {} healing attempt {}", partition_id, attempt);

            // (i) direct reconnects
            for peer in &affected {
                if self.is_blacklisted(peer).await {
                    continue;
                }
                let _ = self.discovery.connect(*peer).await;
            }

            // (ii) bridge peers share their catalogs
            for bridge in &bridges {
                match self
                    .discovery
                    .partition_probe(*bridge, affected.clone())
                    .await
                {
                    Ok(peers) => {
                        for info in peers {
                            if affected.contains(&info.node_id) {
                                let _ = self.discovery.connect(info.node_id).await;
                            }
                        }
                    }
                    Err(e) => debug!("bridge {} probe failed: {}", bridge, e),
                }
            }

            // (iii) forced discovery
            self.discovery.discover().await;

            let connected: HashSet<NodeId> =
                self.peers.connected_peers().await.into_iter().collect();
            let reconnected = affected
                .iter()
                .filter(|peer| connected.contains(peer))
                .count();

            let mut partitions = self.partitions.write().await;
            let Some(partition) = partitions.get_mut(&partition_id) else {
                return;
            };
            partition.healing_attempts = attempt;
            if reconnected >= needed {
                partition.status = PartitionStatus::Healed;
                info!(
                    "partition {} healed: {}/{} affected peers back",
                    partition_id,
                    reconnected,
                    affected.len()
                );
                drop(partitions);
                self.events
                    .publish(MeshEvent::PartitionHealed { partition_id });
                return;
            }
            drop(partitions);

            tokio::time::sleep(Duration::from_millis(self.config.recovery_interval_ms)).await;
        }

        let mut partitions = self.partitions.write().await;
        if let Some(partition) = partitions.get_mut(&partition_id) {
            partition.status = PartitionStatus::Permanent;
            warn!("partition {} is permanent after {} attempts", partition_id, MAX_HEALING_ATTEMPTS);
        }
    }

    pub async fn partition(&self, partition_id: &Uuid) -> Option<NetworkPartition> {
        self.partitions.read().await.get(partition_id).cloned()
    }

    // ----- peer recovery -----

    /// Reconnect a dropped peer with 1/2/4 s backoff; after three failures, connect a
    /// replacement with similar capabilities instead.
    async fn recover_peer(self: Arc<Self>, peer: NodeId) {
        if self.is_blacklisted(&peer).await {
            return;
        }
        let profile = self
            .peers
            .peer_info(peer)
            .await
            .and_then(|record| record.capabilities);

        for backoff in RECOVERY_BACKOFF {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            if self.peers.connect(peer).await.is_ok() {
                debug!("recovered connection to {}", peer);
                return;
            }
        }

        if let Some(profile) = profile {
            if let Some(replacement) = self.find_replacement(&peer, &profile).await {
                info!("replacing lost peer {} with {}", peer, replacement);
                let _ = self.discovery.connect(replacement).await;
            }
        }
    }

    /// A known, unconnected, non-blacklisted peer within +/-2 cores, +/-4 GB ram, and the
    /// same gpu flag as the lost peer.
    async fn find_replacement(
        &self,
        lost: &NodeId,
        profile: &CapabilitySnapshot,
    ) -> Option<NodeId> {
        let connected: HashSet<NodeId> =
            self.peers.connected_peers().await.into_iter().collect();
        for record in self.peers.all_peers().await {
            if record.node_id == *lost
                || record.node_id == self.local
                || connected.contains(&record.node_id)
                || self.is_blacklisted(&record.node_id).await
            {
                continue;
            }
            let Some(caps) = &record.capabilities else {
                continue;
            };
            let core_delta = (caps.cpu_cores as i64 - profile.cpu_cores as i64).abs();
            let ram_delta = (caps.ram_gb - profile.ram_gb).abs();
            if core_delta <= 2 && ram_delta <= 4.0 && caps.gpu_available == profile.gpu_available {
                return Some(record.node_id);
            }
        }
        None
    }

    // ----- loops -----

    /// Health sampling, security monitoring, and disconnect-driven recovery.
    pub fn spawn_monitor_loops(self: &Arc<Self>) {
        let resilience = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(Duration::from_millis(
                resilience.config.health_interval_ms.max(1),
            ));
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = timer.tick() => {
                        let sample = resilience.sample_health().await;
                        resilience.events.publish(MeshEvent::HealthUpdated {
                            score: sample.composite,
                        });
                        resilience.check_partition().await;
                    }
                }
            }
        });

        let resilience = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(Duration::from_millis(
                resilience.config.security_interval_ms.max(1),
            ));
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = timer.tick() => {
                        resilience.security_scan().await;
                    }
                }
            }
        });

        let resilience = Arc::clone(self);
        let cancel = self.cancel.clone();
        let mut subscription = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = subscription.recv() => {
                        match event {
                            Ok(MeshEvent::PeerDisconnected { peer, reason }) => {
                                if reason != "requested" {
                                    tokio::spawn(Arc::clone(&resilience).recover_peer(peer));
                                }
                            }
                            Ok(_) => {}
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        });
    }

    /// Detect malicious peers by verification record, spam rate, and signature abuse.
    async fn security_scan(self: &Arc<Self>) {
        // Reputation-based detection. Trusted peers are exempt from this path.
        for score in self.verification.reputation_snapshot().await {
            let malicious = (score.score < 0.2 && score.total >= 5)
                || (score.error_rate() > 0.5 && score.total >= 10);
            if malicious && !self.is_blacklisted(&score.peer).await {
                self.quarantine(score.peer, AlertSeverity::High, "verification record")
                    .await;
            }
        }

        // Spam / flood detection opens the network breaker alongside the quarantine.
        let budget = self.config.spam_frames_per_sec as f64;
        for (peer, rate) in self.peers.frame_rates().await {
            if rate > budget && !self.is_blacklisted(&peer).await {
                warn!("peer {} exceeds frame budget: {:.0}/s", peer, rate);
                self.quarantine(peer, AlertSeverity::Medium, "frame flood").await;
                if let Some(breaker) = self.breakers.write().await.get_mut(&ServiceKey::Network) {
                    breaker.trip();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(5, Duration::from_millis(50))
    }

    #[test]
    fn breaker_opens_exactly_at_threshold() {
        let mut b = breaker();
        for _ in 0..4 {
            b.record_failure();
            assert_eq!(b.state(), CircuitState::Closed);
        }
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(!b.allow_request());
    }

    #[test]
    fn breaker_half_opens_after_timeout_and_closes_on_success() {
        let mut b = breaker();
        for _ in 0..5 {
            b.record_failure();
        }
        assert_eq!(b.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(60));
        assert!(b.allow_request());
        assert_eq!(b.state(), CircuitState::HalfOpen);

        b.record_success();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.failure_count(), 0);
    }

    #[test]
    fn breaker_reopens_on_half_open_failure() {
        let mut b = breaker();
        for _ in 0..5 {
            b.record_failure();
        }
        std::thread::sleep(Duration::from_millis(60));
        assert!(b.allow_request());
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn breaker_success_resets_closed_count() {
        let mut b = breaker();
        b.record_failure();
        b.record_failure();
        b.record_success();
        assert_eq!(b.failure_count(), 0);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn trip_forces_open() {
        let mut b = breaker();
        b.trip();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(!b.allow_request());
    }
}
