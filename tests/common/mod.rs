//! Shared helpers for the integration suites: in-memory meshes, canned runners,
//! admission policies, and event waiting.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use computemesh::computemesh_core::{AdmissionPolicy, ComputeMeshCore};
use computemesh::config::MeshConfig;
use computemesh::dispatch::{
    ResourceUsage, RunnerRegistry, TaskExecution, TaskPriority, TaskRequest, TaskRequirements,
    TaskResult, TaskRunner, TaskType,
};
use computemesh::error::MeshResult;
use computemesh::events::{EventBus, MeshEvent};
use computemesh::identity::{NodeId, NodeIdentity};
use computemesh::peer_manager::{Inbound, PeerManager, PeerManagerHandle};
use computemesh::routing::RoutingService;
use computemesh::telemetry::{
    CapabilitySnapshot, ComputeTier, StaticTelemetry, TelemetrySource, ThermalState,
};
use computemesh::transport::memory::MemoryHub;
use computemesh::messages::{DiscoveryPayload, FrameKind, NetworkFrame};
use uuid::Uuid;

/// A capability snapshot sized by the test.
pub fn snapshot(cores: u32, ram_gb: f64, gpu: bool) -> CapabilitySnapshot {
    CapabilitySnapshot {
        tier: ComputeTier::Medium,
        cpu_cores: cores,
        ram_gb,
        gpu_available: gpu,
        bandwidth_mbps: 100.0,
        battery_percent: None,
        thermal: ThermalState::Nominal,
    }
}

/// Fast maintenance intervals so scenarios settle in test time.
pub fn fast_config() -> MeshConfig {
    let mut config = MeshConfig::default();
    config.network.ping_interval_ms = 100;
    config.discovery.discovery_interval_ms = 100;
    config.discovery.topology_interval_ms = 500;
    config.discovery.path_probe_timeout_ms = 500;
    config.resilience.health_interval_ms = 150;
    config.resilience.security_interval_ms = 200;
    config.resilience.recovery_interval_ms = 100;
    // Fast maintenance produces far more frames per second than production cadence;
    // keep the flood detector out of the way.
    config.resilience.spam_frames_per_sec = 100_000;
    config
}

/// Runner that sleeps long enough to produce a plausible execution time, then echoes
/// the task payload.
pub struct SleepRunner {
    pub delay: Duration,
}

#[async_trait]
impl TaskRunner for SleepRunner {
    async fn run(
        &self,
        task: &TaskRequest,
        cancel: CancellationToken,
    ) -> MeshResult<TaskExecution> {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(self.delay) => {}
        }
        Ok(TaskExecution {
            output: task.payload.clone(),
            resource_usage: ResourceUsage {
                cpu_percent: 35.0,
                memory_percent: 20.0,
                network_kb: 4.0,
            },
        })
    }
}

pub fn runners(delay: Duration) -> RunnerRegistry {
    let runner: Arc<dyn TaskRunner> = Arc::new(SleepRunner { delay });
    let mut registry = HashMap::new();
    for task_type in [
        TaskType::Compute,
        TaskType::Storage,
        TaskType::Network,
        TaskType::AiInference,
    ] {
        registry.insert(task_type, Arc::clone(&runner));
    }
    registry
}

pub struct ApproveAll;

#[async_trait]
impl AdmissionPolicy for ApproveAll {
    async fn approve(&self, _task: &TaskRequest) -> bool {
        true
    }
}

pub struct DeclineAll;

#[async_trait]
impl AdmissionPolicy for DeclineAll {
    async fn approve(&self, _task: &TaskRequest) -> bool {
        false
    }
}

/// Spawn a full fabric node on the hub. Returns the core; its id is `core.local_id()`.
pub async fn spawn_core(
    hub: &Arc<MemoryHub>,
    config: MeshConfig,
    caps: CapabilitySnapshot,
    admission: Arc<dyn AdmissionPolicy>,
    run_delay: Duration,
) -> Arc<ComputeMeshCore> {
    let identity = Arc::new(NodeIdentity::generate());
    let transport = Arc::new(hub.join(identity.node_id()).await);
    let telemetry: Arc<dyn TelemetrySource> = Arc::new(StaticTelemetry::new(caps));
    ComputeMeshCore::start(
        config,
        identity,
        transport,
        telemetry,
        runners(run_delay),
        admission,
    )
    .await
    .expect("core start")
}

/// Open channels in both directions so advertisements and replies flow immediately.
pub async fn link(a: &Arc<ComputeMeshCore>, b: &Arc<ComputeMeshCore>) {
    a.peer_manager().connect(b.local_id()).await.expect("link a->b");
    b.peer_manager().connect(a.local_id()).await.expect("link b->a");
}

pub fn requirements(cores: u32, ram_gb: f64) -> TaskRequirements {
    TaskRequirements {
        cpu_cores: cores,
        memory_gb: ram_gb,
        gpu_required: false,
        estimated_duration_ms: 1_000,
        priority: TaskPriority::Medium,
    }
}

pub fn sample_result(task_id: Uuid, completed_by: NodeId, output: &[u8]) -> TaskResult {
    TaskResult {
        task_id,
        result: output.to_vec(),
        completed_by,
        completed_at_ms: chrono::Utc::now().timestamp_millis(),
        execution_time_ms: 5_000,
        resource_usage: ResourceUsage {
            cpu_percent: 40.0,
            memory_percent: 25.0,
            network_kb: 8.0,
        },
        signature: None,
    }
}

/// Wait for an event matching the predicate, with a hard timeout.
pub async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<MeshEvent>,
    timeout: Duration,
    mut predicate: F,
) -> Option<MeshEvent>
where
    F: FnMut(&MeshEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(event)) if predicate(&event) => return Some(event),
            Ok(Ok(_)) => continue,
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            _ => return None,
        }
    }
}

/// A bare peer-manager + routing node that answers FIND_NODE but runs no upper layers.
pub struct LightNode {
    pub identity: Arc<NodeIdentity>,
    pub peers: PeerManagerHandle,
    pub routing: Arc<RoutingService>,
    pub cancel: CancellationToken,
}

impl LightNode {
    pub fn id(&self) -> NodeId {
        self.identity.node_id()
    }

    /// Hard-stop the node: the actor exits and its transport drops, so peers see the
    /// channel close.
    pub fn kill(&self) {
        self.cancel.cancel();
    }
}

/// Spawn a light node: peer manager wired so inbound discovery frames reach the
/// routing service.
pub async fn spawn_light_node(
    hub: &Arc<MemoryHub>,
    caps: CapabilitySnapshot,
) -> LightNode {
    let identity = Arc::new(NodeIdentity::generate());
    let transport = Arc::new(hub.join(identity.node_id()).await);
    let telemetry: Arc<dyn TelemetrySource> = Arc::new(StaticTelemetry::new(caps));
    let mut config = fast_config();
    config.network.require_signatures = false;

    let cancel = CancellationToken::new();
    let (peers, mut inbound) = PeerManager::spawn(
        Arc::clone(&identity),
        transport,
        telemetry,
        EventBus::new(),
        config.network,
        cancel.clone(),
    );
    let routing = RoutingService::new(identity.node_id(), peers.clone());

    let routing_for_loop = Arc::clone(&routing);
    tokio::spawn(async move {
        while let Some(item) = inbound.recv().await {
            if let Inbound::Frame(frame) = item {
                route_light_frame(&routing_for_loop, &frame).await;
            }
        }
    });

    LightNode {
        identity,
        peers,
        routing,
        cancel,
    }
}

async fn route_light_frame(routing: &Arc<RoutingService>, frame: &NetworkFrame) {
    if frame.kind == FrameKind::PeerDiscovery {
        if let Ok(payload) = DiscoveryPayload::decode(&frame.payload) {
            routing.handle_payload(frame.from, &payload).await;
        }
    }
}
