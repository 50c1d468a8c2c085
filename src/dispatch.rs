// ===================================================================================================
// Task Dispatch - Submission, Candidate Selection, and Replicated Assignment
// ===================================================================================================
//
// Dispatch owns the live set of submitted tasks. A submission hashes its requirements into a
// DHT target, looks up candidate executors, filters them against the requirements, ranks them
// by a capability/reputation/latency score, and assigns the best as primary with the next
// three as ordered backups. A per-task watchdog promotes the head of the backup chain when
// the primary misses the deadline; a task with no backups left fails terminally.
//
// State machine per task:
//
//   Pending -> (assign) -> Active -> (execute) -> Completed
//                                 \-> (failure, has backup) -> Active (new assignee)
//                                 \-> (failure, no backup | timeout) -> Failed
//
// Execution itself is a black box behind `TaskRunner`: the task type selects a handler, the
// handler produces result bytes and a resource-usage measurement, and it must abort promptly
// when its cancellation token fires.
//
// ===================================================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::error::{MeshError, MeshResult};
use crate::events::{EventBus, MeshEvent};
use crate::identity::{NodeId, NodeIdentity};
use crate::messages::{FrameKind, NetworkFrame};
use crate::peer_manager::PeerManagerHandle;
use crate::routing::RoutingService;
use crate::telemetry::{CapabilitySnapshot, ThermalState};

pub type TaskId = Uuid;

/// Work categories routed to type-specific runners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    Compute,
    Storage,
    Network,
    AiInference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskPriority {
    Low,
    Medium,
    High,
    Urgent,
}

/// Resources a task needs from its executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequirements {
    pub cpu_cores: u32,
    pub memory_gb: f64,
    pub gpu_required: bool,
    pub estimated_duration_ms: u64,
    pub priority: TaskPriority,
}

impl TaskRequirements {
    /// SHA-256 of the canonical requirement encoding, truncated to an id-space target.
    /// Tasks with similar requirements route toward the same region of the overlay.
    pub fn dht_target(&self) -> MeshResult<NodeId> {
        let canonical = bincode::serialize(self)?;
        let digest = Sha256::digest(&canonical);
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest[..20]);
        Ok(NodeId::from_bytes(bytes))
    }
}

/// A signed, immutable task submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub payload: Vec<u8>,
    pub requirements: TaskRequirements,
    pub reward: f64,
    pub deadline_ms: i64,
    pub submitter: NodeId,
    pub created_at_ms: i64,
    pub signature: Option<Vec<u8>>,
}

#[derive(Serialize)]
struct SignableTask<'a> {
    task_id: &'a TaskId,
    task_type: TaskType,
    payload: &'a [u8],
    requirements: &'a TaskRequirements,
    reward: f64,
    deadline_ms: i64,
    submitter: &'a NodeId,
    created_at_ms: i64,
}

impl TaskRequest {
    pub fn signable_bytes(&self) -> MeshResult<Vec<u8>> {
        Ok(bincode::serialize(&SignableTask {
            task_id: &self.task_id,
            task_type: self.task_type,
            payload: &self.payload,
            requirements: &self.requirements,
            reward: self.reward,
            deadline_ms: self.deadline_ms,
            submitter: &self.submitter,
            created_at_ms: self.created_at_ms,
        })?)
    }

    pub fn sign(&mut self, identity: &NodeIdentity) -> MeshResult<()> {
        let bytes = self.signable_bytes()?;
        self.signature = Some(identity.sign(&bytes));
        Ok(())
    }
}

/// Who is (and who may next be) executing a task.
#[derive(Debug, Clone)]
pub struct TaskAssignment {
    pub task_id: TaskId,
    pub assigned_to: NodeId,
    pub assigned_at_ms: i64,
    pub expected_completion_ms: i64,
    /// Ordered promotion chain; never contains the primary.
    pub backup_peers: Vec<NodeId>,
}

/// Executor-observed resource consumption, checked later by verifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub network_kb: f64,
}

/// Immutable result produced by an executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub result: Vec<u8>,
    pub completed_by: NodeId,
    pub completed_at_ms: i64,
    pub execution_time_ms: u64,
    pub resource_usage: ResourceUsage,
    pub signature: Option<Vec<u8>>,
}

#[derive(Serialize)]
struct SignableResult<'a> {
    task_id: &'a TaskId,
    result: &'a [u8],
    completed_by: &'a NodeId,
    completed_at_ms: i64,
    execution_time_ms: u64,
}

impl TaskResult {
    pub fn signable_bytes(&self) -> MeshResult<Vec<u8>> {
        Ok(bincode::serialize(&SignableResult {
            task_id: &self.task_id,
            result: &self.result,
            completed_by: &self.completed_by,
            completed_at_ms: self.completed_at_ms,
            execution_time_ms: self.execution_time_ms,
        })?)
    }

    pub fn sign(&mut self, identity: &NodeIdentity) -> MeshResult<()> {
        let bytes = self.signable_bytes()?;
        self.signature = Some(identity.sign(&bytes));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Active,
    Completed,
    Failed,
    Cancelled,
}

/// Why a task (or one assignee) failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskFailure {
    Timeout,
    ExecutorRejected,
    ExecutionError(String),
    NoBackupsLeft,
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskFailure::Timeout => write!(f, "timeout"),
            TaskFailure::ExecutorRejected => write!(f, "executor rejected"),
            TaskFailure::ExecutionError(e) => write!(f, "execution error: {}", e),
            TaskFailure::NoBackupsLeft => write!(f, "no backups left"),
        }
    }
}

/// Wire payload for `FrameKind::TaskRequest`: the task plus the recipient's role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignmentPayload {
    pub task: TaskRequest,
    pub is_backup: bool,
}

/// Wire payload for `FrameKind::TaskResponse`: accept/decline from an assignee.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResponsePayload {
    pub task_id: TaskId,
    pub accepted: bool,
}

/// Output of one execution run.
#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub output: Vec<u8>,
    pub resource_usage: ResourceUsage,
}

/// Execution seam. A runner must abort promptly when `cancel` fires.
#[async_trait]
pub trait TaskRunner: Send + Sync + 'static {
    async fn run(&self, task: &TaskRequest, cancel: CancellationToken)
        -> MeshResult<TaskExecution>;
}

/// Registry mapping task types to their runners.
pub type RunnerRegistry = HashMap<TaskType, Arc<dyn TaskRunner>>;

/// An execution candidate assembled from the routing table and peer records.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub node_id: NodeId,
    pub capabilities: CapabilitySnapshot,
    pub reputation: f64,
    pub latency_ms: Option<u64>,
}

/// Conservative candidate filter: any shortfall disqualifies.
pub fn candidate_qualifies(
    candidate: &Candidate,
    requirements: &TaskRequirements,
    min_reputation: f64,
) -> bool {
    let caps = &candidate.capabilities;
    caps.cpu_cores >= requirements.cpu_cores
        && caps.ram_gb >= requirements.memory_gb
        && (!requirements.gpu_required || caps.gpu_available)
        && caps.thermal != ThermalState::Critical
        && candidate.reputation >= min_reputation
}

/// Candidate ranking score; higher is better.
pub fn candidate_score(candidate: &Candidate, requirements: &TaskRequirements) -> f64 {
    let caps = &candidate.capabilities;
    let core_ratio = if requirements.cpu_cores == 0 {
        2.0
    } else {
        (caps.cpu_cores as f64 / requirements.cpu_cores as f64).min(2.0)
    };
    let ram_ratio = if requirements.memory_gb <= 0.0 {
        2.0
    } else {
        (caps.ram_gb / requirements.memory_gb).min(2.0)
    };
    let latency_score = match candidate.latency_ms {
        Some(latency) if latency < 100 => 15.0,
        Some(latency) if latency < 200 => 10.0,
        _ => 5.0,
    };
    let thermal_bonus = match caps.thermal {
        ThermalState::Nominal => 10.0,
        ThermalState::Fair => 5.0,
        ThermalState::Serious => -5.0,
        ThermalState::Critical => -20.0,
    };
    core_ratio * 30.0 + ram_ratio * 25.0 + candidate.reputation * 20.0 + latency_score
        + thermal_bonus
}

struct ActiveTask {
    request: TaskRequest,
    assignment: TaskAssignment,
    state: TaskState,
    watchdog: CancellationToken,
}

struct InboundOffer {
    task: TaskRequest,
    is_backup: bool,
}

/// Parameters for a new submission; the id, timestamps, and signature are filled in
/// by `submit`.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_type: TaskType,
    pub payload: Vec<u8>,
    pub requirements: TaskRequirements,
    pub reward: f64,
    /// Absolute deadline; defaults to now + the configured task timeout.
    pub deadline_ms: Option<i64>,
}

/// The dispatch subsystem.
pub struct TaskDispatch {
    local: NodeId,
    identity: Arc<NodeIdentity>,
    peers: PeerManagerHandle,
    routing: Arc<RoutingService>,
    events: EventBus,
    config: DispatchConfig,
    runners: RunnerRegistry,
    active: RwLock<HashMap<TaskId, ActiveTask>>,
    offers: RwLock<HashMap<TaskId, InboundOffer>>,
    executing: RwLock<HashMap<TaskId, CancellationToken>>,
    cancel: CancellationToken,
}

impl TaskDispatch {
    pub fn new(
        identity: Arc<NodeIdentity>,
        peers: PeerManagerHandle,
        routing: Arc<RoutingService>,
        events: EventBus,
        config: DispatchConfig,
        runners: RunnerRegistry,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(TaskDispatch {
            local: identity.node_id(),
            identity,
            peers,
            routing,
            events,
            config,
            runners,
            active: RwLock::new(HashMap::new()),
            offers: RwLock::new(HashMap::new()),
            executing: RwLock::new(HashMap::new()),
            cancel,
        })
    }

    pub async fn active_task_count(&self) -> usize {
        self.active.read().await.len()
    }

    /// The request behind a pending inbound offer, for the admission decision.
    pub async fn offered_task(&self, task_id: TaskId) -> Option<TaskRequest> {
        self.offers
            .read()
            .await
            .get(&task_id)
            .map(|offer| offer.task.clone())
    }

    /// Submit a task to the fabric. Fails with `NoSuitableCandidates` when the filtered
    /// candidate set is empty; in that case nothing is recorded.
    pub async fn submit(self: &Arc<Self>, new_task: NewTask) -> MeshResult<TaskId> {
        let task_id = Uuid::new_v4();
        let now = chrono::Utc::now().timestamp_millis();
        let deadline_ms = new_task
            .deadline_ms
            .unwrap_or(now + self.config.task_timeout_ms as i64);

        let mut request = TaskRequest {
            task_id,
            task_type: new_task.task_type,
            payload: new_task.payload,
            requirements: new_task.requirements,
            reward: new_task.reward,
            deadline_ms,
            submitter: self.local,
            created_at_ms: now,
            signature: None,
        };
        request.sign(&self.identity)?;

        let candidates = self.select_candidates(&request.requirements).await?;
        let primary = candidates[0].node_id;
        let backups: Vec<NodeId> = candidates
            .iter()
            .skip(1)
            .take(self.config.max_backups)
            .map(|candidate| candidate.node_id)
            .collect();

        let assignment = TaskAssignment {
            task_id,
            assigned_to: primary,
            assigned_at_ms: now,
            expected_completion_ms: now + self.config.task_timeout_ms as i64,
            backup_peers: backups,
        };
        self.broadcast_assignment(&request, &assignment).await;

        let watchdog = self.arm_watchdog(task_id);
        self.active.write().await.insert(
            task_id,
            ActiveTask {
                request,
                assignment,
                state: TaskState::Active,
                watchdog,
            },
        );

        info!("task {} submitted to primary {}", task_id, primary);
        self.events.publish(MeshEvent::TaskSubmitted { task_id });
        Ok(task_id)
    }

    /// Look up, filter, and rank executors for the requirements. Best first.
    async fn select_candidates(
        &self,
        requirements: &TaskRequirements,
    ) -> MeshResult<Vec<Candidate>> {
        let target = requirements.dht_target()?;
        let nodes = self.routing.lookup(target).await;

        let mut candidates = Vec::new();
        for node in nodes {
            if node.node_id == self.local {
                continue;
            }
            let Some(capabilities) = node.capabilities else {
                continue;
            };
            let latency_ms = self
                .peers
                .peer_info(node.node_id)
                .await
                .and_then(|record| record.latency_ms);
            let candidate = Candidate {
                node_id: node.node_id,
                capabilities,
                reputation: node.reputation,
                latency_ms,
            };
            if candidate_qualifies(&candidate, requirements, self.config.min_candidate_reputation)
            {
                candidates.push(candidate);
            }
        }

        if candidates.is_empty() {
            return Err(MeshError::NoSuitableCandidates);
        }
        candidates.sort_by(|a, b| {
            candidate_score(b, requirements)
                .partial_cmp(&candidate_score(a, requirements))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(candidates)
    }

    /// Send the assignment to the primary and every backup with their respective roles.
    async fn broadcast_assignment(&self, request: &TaskRequest, assignment: &TaskAssignment) {
        let recipients = std::iter::once((assignment.assigned_to, false)).chain(
            assignment
                .backup_peers
                .iter()
                .map(|backup| (*backup, true)),
        );
        for (peer, is_backup) in recipients {
            let payload = TaskAssignmentPayload {
                task: request.clone(),
                is_backup,
            };
            let encoded = match bincode::serialize(&payload) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("failed to encode assignment for {}: {}", task_label(request), e);
                    return;
                }
            };
            if self.peers.connect(peer).await.is_err() {
                debug!("could not reach assignee {}", peer);
                continue;
            }
            if let Err(e) = self
                .peers
                .send_frame(peer, FrameKind::TaskRequest, encoded, true)
                .await
            {
                debug!("failed to send assignment to {}: {}", peer, e);
            }
        }
    }

    fn arm_watchdog(self: &Arc<Self>, task_id: TaskId) -> CancellationToken {
        let watchdog = CancellationToken::new();
        let guard = watchdog.clone();
        let dispatch = Arc::clone(self);
        let timeout = Duration::from_millis(self.config.task_timeout_ms);
        let shutdown = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = guard.cancelled() => {}
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    warn!("task {} watchdog fired", task_id);
                    dispatch.report_failure(task_id, TaskFailure::Timeout).await;
                }
            }
        });
        watchdog
    }

    /// Inbound assignment on the executor side. Records the offer and surfaces
    /// `task_received`; the orchestrator consults the admission policy before `accept`.
    pub async fn handle_assignment(&self, frame: &NetworkFrame) -> Option<TaskId> {
        let payload: TaskAssignmentPayload = match bincode::deserialize(&frame.payload) {
            Ok(payload) => payload,
            Err(e) => {
                debug!("undecodable assignment from {}: {}", frame.from, e);
                return None;
            }
        };
        let task_id = payload.task.task_id;

        if payload.is_backup {
            // A repeated assignment demoting us means another peer is now primary.
            if let Some(token) = self.executing.read().await.get(&task_id) {
                token.cancel();
            }
            self.offers.write().await.insert(
                task_id,
                InboundOffer {
                    task: payload.task,
                    is_backup: true,
                },
            );
            return None;
        }

        let submitter = payload.task.submitter;
        self.offers.write().await.insert(
            task_id,
            InboundOffer {
                task: payload.task,
                is_backup: false,
            },
        );
        self.events.publish(MeshEvent::TaskReceived {
            task_id,
            submitter,
        });
        Some(task_id)
    }

    /// Accept an offered task after external approval: execute it and return the result
    /// to the submitter.
    pub async fn accept(self: &Arc<Self>, task_id: TaskId) -> MeshResult<()> {
        let offer = {
            let offers = self.offers.read().await;
            match offers.get(&task_id) {
                Some(offer) if !offer.is_backup => offer.task.clone(),
                Some(_) => {
                    return Err(MeshError::Internal(
                        "cannot accept a backup assignment".to_string(),
                    ))
                }
                None => return Err(MeshError::NotFound(format!("task offer {}", task_id))),
            }
        };

        self.send_response(&offer, true).await;
        self.events.publish(MeshEvent::TaskAccepted { task_id });

        let runner = self
            .runners
            .get(&offer.task_type)
            .cloned()
            .ok_or_else(|| {
                MeshError::Internal(format!("no runner for task type {:?}", offer.task_type))
            })?;

        let exec_cancel = self.cancel.child_token();
        self.executing
            .write()
            .await
            .insert(task_id, exec_cancel.clone());

        let dispatch = Arc::clone(self);
        tokio::spawn(async move {
            let started = Instant::now();
            let outcome = runner.run(&offer, exec_cancel.clone()).await;
            dispatch.executing.write().await.remove(&task_id);
            dispatch.offers.write().await.remove(&task_id);

            if exec_cancel.is_cancelled() {
                debug!("execution of {} aborted by cancellation", task_id);
                return;
            }

            match outcome {
                Ok(execution) => {
                    let mut result = TaskResult {
                        task_id,
                        result: execution.output,
                        completed_by: dispatch.local,
                        completed_at_ms: chrono::Utc::now().timestamp_millis(),
                        execution_time_ms: started.elapsed().as_millis() as u64,
                        resource_usage: execution.resource_usage,
                        signature: None,
                    };
                    if let Err(e) = result.sign(&dispatch.identity) {
                        warn!("failed to sign result for {}: {}", task_id, e);
                        return;
                    }
                    dispatch.return_result(&offer, result).await;
                }
                Err(e) => {
                    warn!("execution of {} failed: {}", task_id, e);
                    dispatch.send_response(&offer, false).await;
                }
            }
        });
        Ok(())
    }

    /// Decline an offered task (admission policy said no).
    pub async fn decline(&self, task_id: TaskId) -> MeshResult<()> {
        let offer = self
            .offers
            .write()
            .await
            .remove(&task_id)
            .ok_or_else(|| MeshError::NotFound(format!("task offer {}", task_id)))?;
        self.send_response(&offer.task, false).await;
        Ok(())
    }

    async fn send_response(&self, task: &TaskRequest, accepted: bool) {
        let payload = TaskResponsePayload {
            task_id: task.task_id,
            accepted,
        };
        let Ok(encoded) = bincode::serialize(&payload) else {
            return;
        };
        if self.peers.connect(task.submitter).await.is_ok() {
            if let Err(e) = self
                .peers
                .send_frame(task.submitter, FrameKind::TaskResponse, encoded, false)
                .await
            {
                debug!("failed to send task response: {}", e);
            }
        }
    }

    async fn return_result(&self, task: &TaskRequest, result: TaskResult) {
        let Ok(encoded) = bincode::serialize(&result) else {
            return;
        };
        if self.peers.connect(task.submitter).await.is_err() {
            warn!("submitter {} unreachable for result", task.submitter);
            return;
        }
        if let Err(e) = self
            .peers
            .send_frame(task.submitter, FrameKind::TaskResult, encoded, true)
            .await
        {
            warn!("failed to return result for {}: {}", task.task_id, e);
        }
    }

    /// Inbound accept/decline from an assignee, on the submitter side.
    pub async fn handle_response(self: &Arc<Self>, frame: &NetworkFrame) {
        let payload: TaskResponsePayload = match bincode::deserialize(&frame.payload) {
            Ok(payload) => payload,
            Err(_) => return,
        };
        if payload.accepted {
            return;
        }
        let is_current_primary = {
            let active = self.active.read().await;
            active
                .get(&payload.task_id)
                .map(|task| task.assignment.assigned_to == frame.from)
                .unwrap_or(false)
        };
        if is_current_primary {
            self.report_failure(payload.task_id, TaskFailure::ExecutorRejected)
                .await;
        }
    }

    /// Inbound result on the submitter side. Returns the request/result pair for
    /// verification when this completes an active task.
    pub async fn handle_result(&self, frame: &NetworkFrame) -> Option<(TaskRequest, TaskResult)> {
        let result: TaskResult = match bincode::deserialize(&frame.payload) {
            Ok(result) => result,
            Err(e) => {
                debug!("undecodable result from {}: {}", frame.from, e);
                return None;
            }
        };
        if result.completed_by != frame.from {
            debug!("result sender mismatch from {}", frame.from);
            return None;
        }
        self.complete_task(result).await
    }

    async fn complete_task(&self, result: TaskResult) -> Option<(TaskRequest, TaskResult)> {
        let mut active = self.active.write().await;
        let task = active.get_mut(&result.task_id)?;
        if task.state != TaskState::Active {
            return None;
        }
        if result.completed_by != task.assignment.assigned_to
            && !task.assignment.backup_peers.contains(&result.completed_by)
        {
            debug!(
                "ignoring result for {} from non-assignee {}",
                result.task_id, result.completed_by
            );
            return None;
        }

        task.state = TaskState::Completed;
        task.watchdog.cancel();
        let request = task.request.clone();
        let task_id = result.task_id;
        active.remove(&task_id);
        drop(active);

        info!("task {} completed by {}", task_id, result.completed_by);
        self.events.publish(MeshEvent::TaskCompleted { task_id });
        Some((request, result))
    }

    /// Handle a failed assignee: promote the next backup, or fail the task terminally.
    pub async fn report_failure(self: &Arc<Self>, task_id: TaskId, reason: TaskFailure) {
        let promoted = {
            let mut active = self.active.write().await;
            let Some(task) = active.get_mut(&task_id) else {
                return;
            };
            if task.state != TaskState::Active {
                return;
            }

            if task.assignment.backup_peers.is_empty() {
                task.state = TaskState::Failed;
                task.watchdog.cancel();
                active.remove(&task_id);
                None
            } else {
                let next = task.assignment.backup_peers.remove(0);
                task.assignment.assigned_to = next;
                task.assignment.assigned_at_ms = chrono::Utc::now().timestamp_millis();
                Some((task.request.clone(), task.assignment.clone()))
            }
        };

        match promoted {
            Some((request, assignment)) => {
                info!(
                    "task {} promoted backup {} after {}",
                    task_id, assignment.assigned_to, reason
                );
                // The original watchdog stays armed: the overall deadline does not reset.
                self.broadcast_assignment(&request, &assignment).await;
            }
            None => {
                warn!("task {} failed: {}", task_id, reason);
                self.events.publish(MeshEvent::TaskFailed {
                    task_id,
                    reason: reason.to_string(),
                });
            }
        }
    }

    /// Abort a local execution if its assignment is no longer ours.
    pub async fn cancel_execution(&self, task_id: TaskId) {
        if let Some(token) = self.executing.read().await.get(&task_id) {
            token.cancel();
        }
    }
}

fn task_label(request: &TaskRequest) -> String {
    format!("{} ({:?})", request.task_id, request.task_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::ComputeTier;

    fn requirements() -> TaskRequirements {
        TaskRequirements {
            cpu_cores: 2,
            memory_gb: 4.0,
            gpu_required: false,
            estimated_duration_ms: 1_000,
            priority: TaskPriority::Medium,
        }
    }

    fn candidate(cores: u32, ram: f64, reputation: f64, thermal: ThermalState) -> Candidate {
        Candidate {
            node_id: NodeId::random(),
            capabilities: CapabilitySnapshot {
                tier: ComputeTier::Medium,
                cpu_cores: cores,
                ram_gb: ram,
                gpu_available: false,
                bandwidth_mbps: 100.0,
                battery_percent: None,
                thermal,
            },
            reputation,
            latency_ms: Some(50),
        }
    }

    #[test]
    fn filter_rejects_any_shortfall() {
        let req = requirements();
        assert!(candidate_qualifies(
            &candidate(4, 8.0, 0.8, ThermalState::Nominal),
            &req,
            0.5
        ));
        assert!(!candidate_qualifies(
            &candidate(1, 8.0, 0.8, ThermalState::Nominal),
            &req,
            0.5
        ));
        assert!(!candidate_qualifies(
            &candidate(4, 2.0, 0.8, ThermalState::Nominal),
            &req,
            0.5
        ));
        assert!(!candidate_qualifies(
            &candidate(4, 8.0, 0.4, ThermalState::Nominal),
            &req,
            0.5
        ));
        assert!(!candidate_qualifies(
            &candidate(4, 8.0, 0.8, ThermalState::Critical),
            &req,
            0.5
        ));
    }

    #[test]
    fn gpu_requirement_is_enforced() {
        let mut req = requirements();
        req.gpu_required = true;
        let without_gpu = candidate(4, 8.0, 0.8, ThermalState::Nominal);
        assert!(!candidate_qualifies(&without_gpu, &req, 0.5));

        let mut with_gpu = without_gpu.clone();
        with_gpu.capabilities.gpu_available = true;
        assert!(candidate_qualifies(&with_gpu, &req, 0.5));
    }

    #[test]
    fn score_components_match_weights() {
        let req = requirements();
        // Exactly-matching resources: ratio 1.0 on both axes.
        let c = candidate(2, 4.0, 0.5, ThermalState::Nominal);
        // 1.0*30 + 1.0*25 + 0.5*20 + 15 (50ms) + 10 (nominal)
        assert!((candidate_score(&c, &req) - 90.0).abs() < 1e-9);

        // Oversized resources cap at 2x.
        let big = candidate(64, 256.0, 0.5, ThermalState::Nominal);
        assert!((candidate_score(&big, &req) - (60.0 + 50.0 + 10.0 + 15.0 + 10.0)).abs() < 1e-9);
    }

    #[test]
    fn score_prefers_better_thermal_and_latency() {
        let req = requirements();
        let cool = candidate(4, 8.0, 0.8, ThermalState::Nominal);
        let hot = candidate(4, 8.0, 0.8, ThermalState::Serious);
        assert!(candidate_score(&cool, &req) > candidate_score(&hot, &req));

        let mut slow = cool.clone();
        slow.latency_ms = Some(500);
        assert!(candidate_score(&cool, &req) > candidate_score(&slow, &req));
    }

    #[test]
    fn requirement_hash_is_stable_and_sensitive() {
        let req = requirements();
        let a = req.dht_target().unwrap();
        let b = req.dht_target().unwrap();
        assert_eq!(a, b);

        let mut different = req.clone();
        different.cpu_cores = 8;
        assert_ne!(a, different.dht_target().unwrap());
    }

    #[test]
    fn task_signature_round_trip() {
        let identity = NodeIdentity::generate();
        let mut request = TaskRequest {
            task_id: Uuid::new_v4(),
            task_type: TaskType::Compute,
            payload: b"work".to_vec(),
            requirements: requirements(),
            reward: 0.01,
            deadline_ms: 0,
            submitter: identity.node_id(),
            created_at_ms: 0,
            signature: None,
        };
        request.sign(&identity).unwrap();
        let bytes = request.signable_bytes().unwrap();
        assert!(crate::identity::verify_signature(
            &identity.public_key_bytes(),
            &bytes,
            request.signature.as_ref().unwrap()
        ));
    }
}
