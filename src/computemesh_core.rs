// ===================================================================================================
// ComputeMesh Core - Orchestrator and Public Facade
// ===================================================================================================
//
// The core composes the subsystems in dependency order - peer manager, routing, discovery,
// dispatch, verification, resilience - wires the inbound frame fan-out, and exposes the single
// public surface of the fabric. Inbound task assignments are gated on the external admission
// policy: only an approved offer reaches `accept`. Shutdown is cooperative and runs in reverse
// order; verifications that already hold a quorum of responses are finalized by ratio, the rest
// are rejected.
//
// ===================================================================================================

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MeshConfig;
use crate::discovery::{DiscoveryStats, PeerDiscovery};
use crate::dispatch::{NewTask, RunnerRegistry, TaskDispatch, TaskId, TaskRequest};
use crate::error::{MeshError, MeshResult};
use crate::events::{EventBus, MeshEvent};
use crate::identity::{NodeId, NodeIdentity};
use crate::messages::{DiscoveryPayload, FrameKind, NetworkFrame};
use crate::peer_manager::{Inbound, NetworkStats, PeerManager, PeerManagerHandle};
use crate::resilience::{HealthSample, NetworkResilience, ServiceKey};
use crate::routing::RoutingService;
use crate::telemetry::TelemetrySource;
use crate::transport::Transport;
use crate::verification::TaskVerification;

/// External decision helper consulted before any inbound assignment is accepted.
/// Implementations judge against local resource state; the fabric never guesses.
#[async_trait]
pub trait AdmissionPolicy: Send + Sync + 'static {
    async fn approve(&self, task: &TaskRequest) -> bool;
}

/// The assembled fabric node.
pub struct ComputeMeshCore {
    identity: Arc<NodeIdentity>,
    events: EventBus,
    peers: PeerManagerHandle,
    routing: Arc<RoutingService>,
    discovery: Arc<PeerDiscovery>,
    dispatch: Arc<TaskDispatch>,
    verification: Arc<TaskVerification>,
    resilience: Option<Arc<NetworkResilience>>,
    verification_required: bool,
    cancel: CancellationToken,
}

impl ComputeMeshCore {
    /// Boot every subsystem in dependency order and start the inbound fan-out.
    ///
    /// The identity is created by the embedder first so the transport can be bound to
    /// the node id it derives; it stays stable for the life of the process.
    pub async fn start(
        config: MeshConfig,
        identity: Arc<NodeIdentity>,
        transport: Arc<dyn Transport>,
        telemetry: Arc<dyn TelemetrySource>,
        runners: RunnerRegistry,
        admission: Arc<dyn AdmissionPolicy>,
    ) -> MeshResult<Arc<Self>> {
        config.validate()?;
        let events = EventBus::new();
        let cancel = CancellationToken::new();

        info!("starting compute mesh node {}", identity.node_id());

        let (peers, inbound) = PeerManager::spawn(
            Arc::clone(&identity),
            transport,
            telemetry,
            events.clone(),
            config.network.clone(),
            cancel.child_token(),
        );

        let routing = RoutingService::new(identity.node_id(), peers.clone());
        routing.spawn_refresh_loop(cancel.child_token());

        let discovery = PeerDiscovery::new(
            Arc::clone(&identity),
            peers.clone(),
            Arc::clone(&routing),
            events.clone(),
            config.discovery.clone(),
            &config.network,
        )?;
        discovery.spawn_maintenance_loops(cancel.child_token());

        let dispatch = TaskDispatch::new(
            Arc::clone(&identity),
            peers.clone(),
            Arc::clone(&routing),
            events.clone(),
            config.dispatch.clone(),
            runners,
            cancel.child_token(),
        );

        let verification = TaskVerification::new(
            Arc::clone(&identity),
            peers.clone(),
            Arc::clone(&routing),
            events.clone(),
            config.verification.clone(),
            config.network.require_signatures,
            cancel.child_token(),
        );

        let resilience = if config.resilience.enabled {
            let resilience = NetworkResilience::new(
                Arc::clone(&identity),
                peers.clone(),
                Arc::clone(&discovery),
                Arc::clone(&verification),
                events.clone(),
                config.resilience.clone(),
                cancel.child_token(),
            )?;
            resilience.spawn_monitor_loops();
            Some(resilience)
        } else {
            None
        };

        let core = Arc::new(ComputeMeshCore {
            identity,
            events,
            peers,
            routing,
            discovery,
            dispatch,
            verification,
            resilience,
            verification_required: config.verification.enabled,
            cancel,
        });

        core.spawn_fanout(inbound, admission);

        // Seed the overlay in the background so start() does not block on slow peers.
        let discovery = Arc::clone(&core.discovery);
        tokio::spawn(async move {
            discovery.discover().await;
            if let Err(e) = discovery.advertise_self().await {
                debug!("initial advertisement skipped: {}", e);
            }
        });

        core.events.publish(MeshEvent::Initialized {
            local: core.identity.node_id(),
        });
        Ok(core)
    }

    /// Route inbound frames to their owning subsystem by kind.
    fn spawn_fanout(
        self: &Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<Inbound>,
        admission: Arc<dyn AdmissionPolicy>,
    ) {
        let core = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    item = inbound.recv() => {
                        match item {
                            Some(Inbound::Frame(frame)) => {
                                core.route_frame(frame, &admission).await;
                            }
                            Some(Inbound::InvalidSignature { from }) => {
                                if let Some(resilience) = &core.resilience {
                                    resilience.note_invalid_signature(from).await;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        });
    }

    async fn route_frame(self: &Arc<Self>, frame: NetworkFrame, admission: &Arc<dyn AdmissionPolicy>) {
        if let Some(resilience) = &self.resilience {
            if resilience.is_blacklisted(&frame.from).await {
                debug!("dropping frame from blacklisted peer {}", frame.from);
                return;
            }
        }

        match frame.kind {
            FrameKind::PeerDiscovery => match DiscoveryPayload::decode(&frame.payload) {
                Ok(payload) => match payload {
                    DiscoveryPayload::FindNode { .. } | DiscoveryPayload::FindNodeResp { .. } => {
                        self.routing.handle_payload(frame.from, &payload).await;
                    }
                    other => self.discovery.handle_payload(frame.from, other).await,
                },
                Err(e) => debug!("undecodable discovery payload from {}: {}", frame.from, e),
            },
            FrameKind::TaskRequest => {
                if let Some(task_id) = self.dispatch.handle_assignment(&frame).await {
                    self.consider_offer(task_id, admission).await;
                }
            }
            FrameKind::TaskResponse => self.dispatch.handle_response(&frame).await,
            FrameKind::TaskResult => {
                if let Some((request, result)) = self.dispatch.handle_result(&frame).await {
                    if self.verification_required {
                        self.verify_completion(&request, &result).await;
                    }
                }
            }
            FrameKind::VerificationRequest => self.verification.handle_frame(&frame).await,
            FrameKind::Ping | FrameKind::Pong => {
                // Absorbed inside the peer manager; nothing reaches here.
            }
        }
    }

    /// Consult the external decision helper; only approval leads to `accept`.
    async fn consider_offer(self: &Arc<Self>, task_id: TaskId, admission: &Arc<dyn AdmissionPolicy>) {
        let Some(task) = self.dispatch.offered_task(task_id).await else {
            return;
        };
        if admission.approve(&task).await {
            if let Err(e) = self.dispatch.accept(task_id).await {
                warn!("accepting task {} failed: {}", task_id, e);
            }
        } else {
            debug!("admission policy declined task {}", task_id);
            let _ = self.dispatch.decline(task_id).await;
        }
    }

    async fn verify_completion(&self, request: &TaskRequest, result: &crate::dispatch::TaskResult) {
        if let Some(resilience) = &self.resilience {
            if resilience.guard(ServiceKey::Verification).await.is_err() {
                warn!("verification breaker open; completion surfaced unverified");
                return;
            }
        }
        match self.verification.request_verification(request, result).await {
            Ok(_) => {
                if let Some(resilience) = &self.resilience {
                    resilience.record_success(ServiceKey::Verification).await;
                }
            }
            Err(e) => {
                warn!("verification request for {} failed: {}", request.task_id, e);
                if let Some(resilience) = &self.resilience {
                    resilience.record_failure(ServiceKey::Verification).await;
                }
            }
        }
    }

    /// Submit a task to the fabric.
    pub async fn submit_task(&self, new_task: NewTask) -> MeshResult<TaskId> {
        if let Some(resilience) = &self.resilience {
            resilience.guard(ServiceKey::Dht).await?;
        }
        let dispatch = Arc::clone(&self.dispatch);
        let outcome = dispatch.submit(new_task).await;
        if let Some(resilience) = &self.resilience {
            match &outcome {
                Ok(_) => resilience.record_success(ServiceKey::Dht).await,
                Err(MeshError::NoSuitableCandidates) => {
                    // An empty candidate set is a local answer, not a DHT failure.
                }
                Err(_) => resilience.record_failure(ServiceKey::Dht).await,
            }
        }
        outcome
    }

    pub fn local_id(&self) -> NodeId {
        self.identity.node_id()
    }

    pub fn events(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    pub fn peer_manager(&self) -> &PeerManagerHandle {
        &self.peers
    }

    pub async fn network_stats(&self) -> MeshResult<NetworkStats> {
        self.peers.network_stats().await
    }

    pub async fn discovery_stats(&self) -> DiscoveryStats {
        self.discovery.stats().await
    }

    /// The resilience subsystem, when enabled, for breaker guards and quarantine control.
    pub fn resilience(&self) -> Option<&Arc<NetworkResilience>> {
        self.resilience.as_ref()
    }

    pub async fn health(&self) -> Option<HealthSample> {
        match &self.resilience {
            Some(resilience) => resilience.latest_health().await,
            None => None,
        }
    }

    /// Cooperative shutdown in reverse boot order. In-flight verifications holding a
    /// quorum finalize by ratio; the rest finalize Rejected.
    pub async fn shutdown(&self) {
        info!("shutting down compute mesh node {}", self.identity.node_id());
        self.verification.finalize_in_flight().await;
        self.cancel.cancel();
        self.peers.shutdown();
        self.events.publish(MeshEvent::Shutdown);
    }
}
