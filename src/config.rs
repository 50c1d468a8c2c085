use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::discovery::DiscoveryMethod;
use crate::error::{MeshError, MeshResult};

/// Configuration for a ComputeMesh node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Peer manager and transport-facing settings
    pub network: NetworkConfig,
    /// Peer discovery settings
    pub discovery: DiscoveryConfig,
    /// Task dispatch settings
    pub dispatch: DispatchConfig,
    /// Result verification settings
    pub verification: VerificationConfig,
    /// Partition/security/breaker settings
    pub resilience: ResilienceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Soft upper bound on the peer catalog
    pub max_peers: usize,
    /// Seed node ids (hex-encoded 160-bit) for first connections
    pub bootstrap_nodes: Vec<String>,
    /// Liveness ping cadence
    pub ping_interval_ms: u64,
    /// Peers silent longer than this are evicted
    pub peer_stale_timeout_ms: u64,
    /// Connect retries before ConnectAttemptsExhausted
    pub connect_attempts: u32,
    /// Require signatures on verification and security frames
    pub require_signatures: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Enabled discovery methods in priority order
    pub methods: Vec<DiscoveryMethod>,
    /// Discover/advertise/prune cadence
    pub discovery_interval_ms: u64,
    /// Topology and path refresh cadence
    pub topology_interval_ms: u64,
    /// Advertisement time-to-live
    pub advertisement_ttl_ms: u64,
    /// Routing paths kept per destination
    pub max_paths_per_destination: usize,
    /// Per-query deadline for path probes
    pub path_probe_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Watchdog deadline for assigned tasks
    pub task_timeout_ms: u64,
    /// Backup assignees kept per task
    pub max_backups: usize,
    /// Minimum reputation for execution candidates
    pub min_candidate_reputation: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// When false, completions are surfaced without verification
    pub enabled: bool,
    /// Deadline for collecting attestations
    pub verification_timeout_ms: u64,
    pub min_verifiers: usize,
    pub max_verifiers: usize,
    /// Minimum reputation for verifier candidates
    pub min_verifier_reputation: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// When false, partition and security loops do not run
    pub enabled: bool,
    pub health_interval_ms: u64,
    pub security_interval_ms: u64,
    pub recovery_interval_ms: u64,
    /// Strictly-below threshold on connected/known for partition detection
    pub partition_threshold: f64,
    /// Per-peer inbound frame budget per second
    pub spam_frames_per_sec: u32,
    pub breaker_failure_threshold: u32,
    pub breaker_timeout_ms: u64,
    /// Ids exempt from reputation-based blacklisting, alerted on quarantines
    pub trusted_peers: Vec<String>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig {
                max_peers: 50,
                bootstrap_nodes: vec![],
                ping_interval_ms: 30_000,
                peer_stale_timeout_ms: 300_000,
                connect_attempts: 3,
                require_signatures: true,
            },
            discovery: DiscoveryConfig {
                methods: vec![
                    DiscoveryMethod::Dht,
                    DiscoveryMethod::PeerExchange,
                    DiscoveryMethod::Bootstrap,
                    DiscoveryMethod::Relay,
                ],
                discovery_interval_ms: 30_000,
                topology_interval_ms: 60_000,
                advertisement_ttl_ms: 300_000,
                max_paths_per_destination: 5,
                path_probe_timeout_ms: 3_000,
            },
            dispatch: DispatchConfig {
                task_timeout_ms: 300_000,
                max_backups: 3,
                min_candidate_reputation: 0.5,
            },
            verification: VerificationConfig {
                enabled: true,
                verification_timeout_ms: 60_000,
                min_verifiers: 3,
                max_verifiers: 7,
                min_verifier_reputation: 0.3,
            },
            resilience: ResilienceConfig {
                enabled: true,
                health_interval_ms: 10_000,
                security_interval_ms: 5_000,
                recovery_interval_ms: 30_000,
                partition_threshold: 0.3,
                spam_frames_per_sec: 50,
                breaker_failure_threshold: 5,
                breaker_timeout_ms: 60_000,
                trusted_peers: vec![],
            },
        }
    }
}

impl MeshConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> MeshResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: MeshConfig = toml::from_str(&contents)
            .map_err(|e| MeshError::Config(format!("invalid config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> MeshResult<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| MeshError::Config(format!("failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> MeshResult<()> {
        if self.network.max_peers == 0 {
            return Err(MeshError::Config("max_peers must be positive".to_string()));
        }
        if self.network.connect_attempts == 0 {
            return Err(MeshError::Config(
                "connect_attempts must be positive".to_string(),
            ));
        }
        if self.verification.min_verifiers > self.verification.max_verifiers {
            return Err(MeshError::Config(
                "min_verifiers cannot exceed max_verifiers".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.resilience.partition_threshold) {
            return Err(MeshError::Config(
                "partition_threshold must be within [0, 1]".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.dispatch.min_candidate_reputation) {
            return Err(MeshError::Config(
                "min_candidate_reputation must be within [0, 1]".to_string(),
            ));
        }
        for id in self
            .network
            .bootstrap_nodes
            .iter()
            .chain(self.resilience.trusted_peers.iter())
        {
            crate::identity::NodeId::from_hex(id)
                .map_err(|_| MeshError::Config(format!("invalid node id in config: {}", id)))?;
        }
        Ok(())
    }
}
