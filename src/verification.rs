// ===================================================================================================
// Task Verification - Signed Attestations, Byzantine Consensus, and Reputation
// ===================================================================================================
//
// After a task completes, the submitter asks 3-7 independent verifiers to re-check the result.
// Each verifier runs the same sub-checks (result hash, execution-time plausibility, resource
// usage bounds, output sanity), derives a confidence, and returns a signed attestation. The
// outcome transitions Pending -> Approved | Rejected exactly once: at a 2/3 majority of
// received responses with at least the minimum quorum, or at the deadline by whichever ratio
// is larger (ties reject; fewer than the minimum responses rejects).
//
// Reputation accrues only at finalization. A responder whose vote matches the consensus gains
// accuracy; dissenters accumulate false positives or false negatives, and
// score = clamp(accuracy - 0.5 * error_rate, 0, 1).
//
// ===================================================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::VerificationConfig;
use crate::dispatch::{TaskId, TaskRequest, TaskResult};
use crate::error::{MeshError, MeshResult};
use crate::events::{EventBus, MeshEvent};
use crate::identity::{self, NodeId, NodeIdentity};
use crate::messages::{FrameKind, NetworkFrame};
use crate::peer_manager::PeerManagerHandle;
use crate::routing::RoutingService;
use crate::telemetry::ThermalState;

pub type VerificationId = Uuid;

/// Bounds on a plausible execution time, in milliseconds.
const MIN_EXECUTION_TIME_MS: u64 = 100;
const MAX_EXECUTION_TIME_MS: u64 = 300_000;
/// Substrings whose presence marks an output as suspect.
const SUSPECT_OUTPUT_MARKERS: [&str; 3] = ["error", "failed", "timeout"];
/// Share of responses that must agree for consensus.
const CONSENSUS_RATIO: f64 = 0.67;

/// A request for independent verification of one task result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationRequest {
    pub verification_id: VerificationId,
    pub task_id: TaskId,
    pub result: TaskResult,
    pub submitter: NodeId,
    pub created_at_ms: i64,
    pub required_verifiers: usize,
    pub deadline_ms: i64,
    pub signature: Option<Vec<u8>>,
}

#[derive(Serialize)]
struct SignableVerificationRequest<'a> {
    verification_id: &'a VerificationId,
    task_id: &'a TaskId,
    submitter: &'a NodeId,
    created_at_ms: i64,
    required_verifiers: usize,
    deadline_ms: i64,
}

impl VerificationRequest {
    fn signable_bytes(&self) -> MeshResult<Vec<u8>> {
        Ok(bincode::serialize(&SignableVerificationRequest {
            verification_id: &self.verification_id,
            task_id: &self.task_id,
            submitter: &self.submitter,
            created_at_ms: self.created_at_ms,
            required_verifiers: self.required_verifiers,
            deadline_ms: self.deadline_ms,
        })?)
    }

    fn sign(&mut self, identity: &NodeIdentity) -> MeshResult<()> {
        let bytes = self.signable_bytes()?;
        self.signature = Some(identity.sign(&bytes));
        Ok(())
    }

    fn verify(&self, public_key: &[u8]) -> bool {
        let Some(signature) = &self.signature else {
            return false;
        };
        let Ok(bytes) = self.signable_bytes() else {
            return false;
        };
        identity::verify_signature(public_key, &bytes, signature)
    }
}

/// Sub-check outcomes a verifier attests to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationChecks {
    /// SHA-256 of the canonical result payload, hex-encoded.
    pub result_hash: String,
    pub execution_time_valid: bool,
    pub resource_usage_valid: bool,
    pub output_valid: bool,
}

/// A verifier's signed attestation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResponse {
    pub verification_id: VerificationId,
    pub verifier: NodeId,
    pub task_id: TaskId,
    pub is_valid: bool,
    pub confidence: f64,
    pub checks: VerificationChecks,
    pub timestamp_ms: i64,
    pub signature: Option<Vec<u8>>,
}

#[derive(Serialize)]
struct SignableVerificationResponse<'a> {
    verification_id: &'a VerificationId,
    verifier: &'a NodeId,
    task_id: &'a TaskId,
    is_valid: bool,
    confidence: f64,
    result_hash: &'a str,
    timestamp_ms: i64,
}

impl VerificationResponse {
    fn signable_bytes(&self) -> MeshResult<Vec<u8>> {
        Ok(bincode::serialize(&SignableVerificationResponse {
            verification_id: &self.verification_id,
            verifier: &self.verifier,
            task_id: &self.task_id,
            is_valid: self.is_valid,
            confidence: self.confidence,
            result_hash: &self.checks.result_hash,
            timestamp_ms: self.timestamp_ms,
        })?)
    }

    fn sign(&mut self, identity: &NodeIdentity) -> MeshResult<()> {
        let bytes = self.signable_bytes()?;
        self.signature = Some(identity.sign(&bytes));
        Ok(())
    }

    fn verify(&self, public_key: &[u8]) -> bool {
        let Some(signature) = &self.signature else {
            return false;
        };
        let Ok(bytes) = self.signable_bytes() else {
            return false;
        };
        identity::verify_signature(public_key, &bytes, signature)
    }
}

/// Consensus state of an outcome. Transitions Pending -> Approved | Rejected exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusState {
    Pending,
    Approved,
    Rejected,
}

/// Aggregated verdict over all received attestations.
#[derive(Debug, Clone)]
pub struct VerificationOutcome {
    pub verification_id: VerificationId,
    pub task_id: TaskId,
    pub consensus: ConsensusState,
    pub verifier_count: usize,
    pub approvals: usize,
    pub rejections: usize,
    pub average_confidence: f64,
    pub finalized_at_ms: Option<i64>,
    pub responses: Vec<VerificationResponse>,
}

/// Per-peer verification track record. Scores start at the neutral 0.5.
#[derive(Debug, Clone)]
pub struct ReputationScore {
    pub peer: NodeId,
    pub score: f64,
    pub total: u64,
    pub correct: u64,
    pub false_positive: u64,
    pub false_negative: u64,
    pub last_updated_ms: i64,
}

impl ReputationScore {
    fn new(peer: NodeId) -> Self {
        ReputationScore {
            peer,
            score: 0.5,
            total: 0,
            correct: 0,
            false_positive: 0,
            false_negative: 0,
            last_updated_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn accuracy(&self) -> f64 {
        if self.total == 0 {
            return 0.5;
        }
        self.correct as f64 / self.total as f64
    }

    pub fn error_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.false_positive + self.false_negative) as f64 / self.total as f64
    }

    fn recompute(&mut self) {
        self.score = (self.accuracy() - 0.5 * self.error_rate()).clamp(0.0, 1.0);
        self.last_updated_ms = chrono::Utc::now().timestamp_millis();
    }
}

/// Payloads multiplexed over `FrameKind::VerificationRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum VerificationPayload {
    Request(VerificationRequest),
    Response(VerificationResponse),
}

struct OutcomeEntry {
    outcome: VerificationOutcome,
    executor: NodeId,
    verifiers: HashSet<NodeId>,
    deadline_guard: CancellationToken,
}

/// The verification subsystem.
pub struct TaskVerification {
    local: NodeId,
    identity: Arc<NodeIdentity>,
    peers: PeerManagerHandle,
    routing: Arc<RoutingService>,
    events: EventBus,
    config: VerificationConfig,
    require_signatures: bool,
    outcomes: RwLock<HashMap<VerificationId, OutcomeEntry>>,
    reputation: RwLock<HashMap<NodeId, ReputationScore>>,
    cancel: CancellationToken,
}

impl TaskVerification {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: Arc<NodeIdentity>,
        peers: PeerManagerHandle,
        routing: Arc<RoutingService>,
        events: EventBus,
        config: VerificationConfig,
        require_signatures: bool,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(TaskVerification {
            local: identity.node_id(),
            identity,
            peers,
            routing,
            events,
            config,
            require_signatures,
            outcomes: RwLock::new(HashMap::new()),
            reputation: RwLock::new(HashMap::new()),
            cancel,
        })
    }

    /// Begin verification of a completed task: pick verifiers, send the signed request,
    /// and arm the collection deadline.
    pub async fn request_verification(
        self: &Arc<Self>,
        task: &TaskRequest,
        result: &TaskResult,
    ) -> MeshResult<VerificationId> {
        let verification_id = Uuid::new_v4();
        let now = chrono::Utc::now().timestamp_millis();
        let deadline_ms = now + self.config.verification_timeout_ms as i64;

        let verifiers = self.select_verifiers(task, result.completed_by).await;
        let mut request = VerificationRequest {
            verification_id,
            task_id: task.task_id,
            result: result.clone(),
            submitter: self.local,
            created_at_ms: now,
            required_verifiers: self.config.min_verifiers,
            deadline_ms,
            signature: None,
        };
        request.sign(&self.identity)?;

        let deadline_guard = CancellationToken::new();
        let entry = OutcomeEntry {
            outcome: VerificationOutcome {
                verification_id,
                task_id: task.task_id,
                consensus: ConsensusState::Pending,
                verifier_count: verifiers.len(),
                approvals: 0,
                rejections: 0,
                average_confidence: 0.0,
                finalized_at_ms: None,
                responses: vec![],
            },
            executor: result.completed_by,
            verifiers: verifiers.iter().copied().collect(),
            deadline_guard: deadline_guard.clone(),
        };
        self.outcomes.write().await.insert(verification_id, entry);
        self.events.publish(MeshEvent::VerificationRequested {
            verification_id,
            task_id: task.task_id,
        });

        if verifiers.is_empty() {
            warn!(
                "no verifiers available for {}; rejecting outright",
                verification_id
            );
            self.finalize(verification_id, ConsensusState::Rejected).await;
            return Ok(verification_id);
        }

        let payload = bincode::serialize(&VerificationPayload::Request(request))
            .map_err(MeshError::from)?;
        for verifier in &verifiers {
            if self.peers.connect(*verifier).await.is_err() {
                continue;
            }
            if let Err(e) = self
                .peers
                .send_frame(*verifier, FrameKind::VerificationRequest, payload.clone(), true)
                .await
            {
                debug!("failed to send verification request to {}: {}", verifier, e);
            }
        }

        let verification = Arc::clone(self);
        let timeout = Duration::from_millis(self.config.verification_timeout_ms);
        let shutdown = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = deadline_guard.cancelled() => {}
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    verification.finalize_at_deadline(verification_id).await;
                }
            }
        });

        Ok(verification_id)
    }

    /// All connected peers except the executor, filtered for capacity and standing,
    /// ranked by reputation and latency. Top `max_verifiers` win.
    async fn select_verifiers(&self, task: &TaskRequest, executor: NodeId) -> Vec<NodeId> {
        let min_cores = ((task.requirements.cpu_cores as f64) * 0.5).ceil() as u32;
        let min_ram = (task.requirements.memory_gb * 0.5).ceil();
        let connected: HashSet<NodeId> = self.peers.connected_peers().await.into_iter().collect();

        let mut ranked: Vec<(f64, NodeId)> = Vec::new();
        for record in self.peers.all_peers().await {
            if !connected.contains(&record.node_id)
                || record.node_id == executor
                || record.node_id == self.local
            {
                continue;
            }
            let Some(caps) = &record.capabilities else {
                continue;
            };
            if caps.cpu_cores < min_cores
                || caps.ram_gb < min_ram
                || caps.thermal == ThermalState::Critical
                || record.reputation < self.config.min_verifier_reputation
            {
                continue;
            }
            let latency = record.latency_ms.unwrap_or(200) as f64;
            let latency_score = ((200.0 - latency) / 200.0).max(0.0);
            let rank = 0.7 * record.reputation + 0.3 * latency_score;
            ranked.push((rank, record.node_id));
        }

        ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        ranked
            .into_iter()
            .take(self.config.max_verifiers)
            .map(|(_, peer)| peer)
            .collect()
    }

    /// Locally re-check a result and produce a signed attestation.
    pub fn perform_verification(&self, request: &VerificationRequest) -> MeshResult<VerificationResponse> {
        let checks = run_checks(&request.result);
        let confidence = confidence_of(&checks);
        let is_valid = confidence >= 0.7 && checks.output_valid;

        let mut response = VerificationResponse {
            verification_id: request.verification_id,
            verifier: self.local,
            task_id: request.task_id,
            is_valid,
            confidence,
            checks,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            signature: None,
        };
        response.sign(&self.identity)?;
        Ok(response)
    }

    /// Inbound verification traffic routed here by the orchestrator.
    pub async fn handle_frame(self: &Arc<Self>, frame: &NetworkFrame) {
        let payload: VerificationPayload = match bincode::deserialize(&frame.payload) {
            Ok(payload) => payload,
            Err(e) => {
                debug!("undecodable verification payload from {}: {}", frame.from, e);
                return;
            }
        };
        match payload {
            VerificationPayload::Request(request) => {
                if request.submitter != frame.from {
                    debug!("verification request sender mismatch from {}", frame.from);
                    return;
                }
                if self.require_signatures {
                    let Some(key) = self
                        .peers
                        .peer_info(frame.from)
                        .await
                        .and_then(|record| record.public_key)
                    else {
                        debug!("no key known for {}; dropping verification request", frame.from);
                        return;
                    };
                    if !request.verify(&key) {
                        warn!("bad signature on verification request from {}", frame.from);
                        return;
                    }
                }
                match self.perform_verification(&request) {
                    Ok(response) => {
                        let Ok(bytes) =
                            bincode::serialize(&VerificationPayload::Response(response))
                        else {
                            return;
                        };
                        if let Err(e) = self
                            .peers
                            .send_frame(frame.from, FrameKind::VerificationRequest, bytes, true)
                            .await
                        {
                            debug!("failed to return attestation to {}: {}", frame.from, e);
                        }
                    }
                    Err(e) => warn!("verification of {} failed: {}", request.task_id, e),
                }
            }
            VerificationPayload::Response(response) => {
                if response.verifier != frame.from {
                    debug!("attestation sender mismatch from {}", frame.from);
                    return;
                }
                if let Err(e) = self.record_response(response).await {
                    debug!("attestation rejected: {}", e);
                }
            }
        }
    }

    /// Validate and fold one attestation into its outcome; finalize on consensus.
    pub async fn record_response(&self, response: VerificationResponse) -> MeshResult<()> {
        let verification_id = response.verification_id;
        let verifier_key = if self.require_signatures {
            Some(
                self.peers
                    .peer_info(response.verifier)
                    .await
                    .and_then(|record| record.public_key)
                    .ok_or(MeshError::SignatureInvalid(response.verifier))?,
            )
        } else {
            None
        };
        let consensus = {
            let mut outcomes = self.outcomes.write().await;
            let entry = outcomes
                .get_mut(&verification_id)
                .ok_or_else(|| MeshError::NotFound(format!("verification {}", verification_id)))?;

            if entry.outcome.consensus != ConsensusState::Pending {
                return Ok(());
            }
            if !entry.verifiers.contains(&response.verifier) {
                return Err(MeshError::Internal(format!(
                    "{} is not a selected verifier",
                    response.verifier
                )));
            }
            if entry
                .outcome
                .responses
                .iter()
                .any(|existing| existing.verifier == response.verifier)
            {
                return Err(MeshError::Internal(format!(
                    "duplicate attestation from {}",
                    response.verifier
                )));
            }
            if let Some(key) = &verifier_key {
                if !response.verify(key) {
                    return Err(MeshError::SignatureInvalid(response.verifier));
                }
            }

            if response.is_valid {
                entry.outcome.approvals += 1;
            } else {
                entry.outcome.rejections += 1;
            }
            entry.outcome.responses.push(response);

            let n = entry.outcome.responses.len();
            let min = self.config.min_verifiers;
            if n >= min && entry.outcome.approvals as f64 / n as f64 >= CONSENSUS_RATIO {
                Some(ConsensusState::Approved)
            } else if n >= min && entry.outcome.rejections as f64 / n as f64 >= CONSENSUS_RATIO {
                Some(ConsensusState::Rejected)
            } else {
                None
            }
        };

        if let Some(consensus) = consensus {
            self.finalize(verification_id, consensus).await;
        }
        Ok(())
    }

    async fn finalize_at_deadline(self: &Arc<Self>, verification_id: VerificationId) {
        let decision = {
            let outcomes = self.outcomes.read().await;
            let Some(entry) = outcomes.get(&verification_id) else {
                return;
            };
            if entry.outcome.consensus != ConsensusState::Pending {
                return;
            }
            let n = entry.outcome.responses.len();
            if n < self.config.min_verifiers {
                debug!(
                    "verification {} insufficient at deadline: {} responses",
                    verification_id, n
                );
                ConsensusState::Rejected
            } else if entry.outcome.approvals > entry.outcome.rejections {
                ConsensusState::Approved
            } else {
                ConsensusState::Rejected
            }
        };
        self.finalize(verification_id, decision).await;
    }

    /// Single finalization point: sets the terminal consensus, updates reputation for
    /// every responder, and announces the verdict.
    async fn finalize(&self, verification_id: VerificationId, consensus: ConsensusState) {
        let (task_id, responders) = {
            let mut outcomes = self.outcomes.write().await;
            let Some(entry) = outcomes.get_mut(&verification_id) else {
                return;
            };
            if entry.outcome.consensus != ConsensusState::Pending {
                return;
            }
            entry.outcome.consensus = consensus;
            entry.outcome.finalized_at_ms = Some(chrono::Utc::now().timestamp_millis());
            let n = entry.outcome.responses.len();
            entry.outcome.average_confidence = if n == 0 {
                0.0
            } else {
                entry
                    .outcome
                    .responses
                    .iter()
                    .map(|response| response.confidence)
                    .sum::<f64>()
                    / n as f64
            };
            entry.deadline_guard.cancel();
            let responders: Vec<(NodeId, bool)> = entry
                .outcome
                .responses
                .iter()
                .map(|response| (response.verifier, response.is_valid))
                .collect();
            (entry.outcome.task_id, responders)
        };

        self.update_reputation(consensus, &responders).await;

        info!(
            "verification {} finalized {:?} with {} responses",
            verification_id,
            consensus,
            responders.len()
        );
        self.events.publish(MeshEvent::VerificationFinalized {
            verification_id,
            task_id,
            consensus,
        });
    }

    async fn update_reputation(&self, consensus: ConsensusState, responders: &[(NodeId, bool)]) {
        let majority = consensus == ConsensusState::Approved;
        let mut scores = self.reputation.write().await;
        for (peer, voted_valid) in responders {
            let entry = scores
                .entry(*peer)
                .or_insert_with(|| ReputationScore::new(*peer));
            entry.total += 1;
            if *voted_valid == majority {
                entry.correct += 1;
            } else if *voted_valid && !majority {
                entry.false_positive += 1;
            } else {
                entry.false_negative += 1;
            }
            entry.recompute();

            self.peers.set_reputation(*peer, entry.score);
            self.routing.set_reputation(peer, entry.score).await;
        }
    }

    pub async fn outcome(&self, verification_id: &VerificationId) -> Option<VerificationOutcome> {
        self.outcomes
            .read()
            .await
            .get(verification_id)
            .map(|entry| entry.outcome.clone())
    }

    pub async fn reputation_of(&self, peer: &NodeId) -> Option<ReputationScore> {
        self.reputation.read().await.get(peer).cloned()
    }

    pub async fn reputation_snapshot(&self) -> Vec<ReputationScore> {
        self.reputation.read().await.values().cloned().collect()
    }

    /// Share of finalized outcomes that were approved; optimistic 1.0 with no history.
    pub async fn approval_rate(&self) -> f64 {
        let outcomes = self.outcomes.read().await;
        let mut approved = 0usize;
        let mut finalized = 0usize;
        for entry in outcomes.values() {
            match entry.outcome.consensus {
                ConsensusState::Approved => {
                    approved += 1;
                    finalized += 1;
                }
                ConsensusState::Rejected => finalized += 1,
                ConsensusState::Pending => {}
            }
        }
        if finalized == 0 {
            1.0
        } else {
            approved as f64 / finalized as f64
        }
    }

    /// Shutdown path: outcomes with a quorum of responses finalize by ratio, the rest reject.
    pub async fn finalize_in_flight(self: &Arc<Self>) {
        let pending: Vec<VerificationId> = {
            let outcomes = self.outcomes.read().await;
            outcomes
                .iter()
                .filter(|(_, entry)| entry.outcome.consensus == ConsensusState::Pending)
                .map(|(id, _)| *id)
                .collect()
        };
        for verification_id in pending {
            self.finalize_at_deadline(verification_id).await;
        }
    }
}

/// The verifier sub-checks, shared by local and remote verification.
pub fn run_checks(result: &TaskResult) -> VerificationChecks {
    let result_hash = match bincode::serialize(&result.result) {
        Ok(canonical) => hex::encode(Sha256::digest(&canonical)),
        Err(_) => String::new(),
    };

    let execution_time_valid = (MIN_EXECUTION_TIME_MS..=MAX_EXECUTION_TIME_MS)
        .contains(&result.execution_time_ms);

    let usage = &result.resource_usage;
    let resource_usage_valid = (0.0..=100.0).contains(&usage.cpu_percent)
        && (0.0..=100.0).contains(&usage.memory_percent)
        && usage.network_kb >= 0.0;

    let rendered = String::from_utf8_lossy(&result.result).to_lowercase();
    let output_valid = !result.result.is_empty()
        && !SUSPECT_OUTPUT_MARKERS
            .iter()
            .any(|marker| rendered.contains(marker));

    VerificationChecks {
        result_hash,
        execution_time_valid,
        resource_usage_valid,
        output_valid,
    }
}

/// Weighted confidence over the sub-checks.
pub fn confidence_of(checks: &VerificationChecks) -> f64 {
    let mut confidence = 0.0;
    if checks.output_valid {
        confidence += 0.4;
    }
    if checks.execution_time_valid {
        confidence += 0.2;
    }
    if checks.resource_usage_valid {
        confidence += 0.2;
    }
    if !checks.result_hash.is_empty() {
        confidence += 0.2;
    }
    confidence
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ResourceUsage;

    fn result_with(output: &[u8], execution_time_ms: u64) -> TaskResult {
        TaskResult {
            task_id: Uuid::new_v4(),
            result: output.to_vec(),
            completed_by: NodeId::random(),
            completed_at_ms: 0,
            execution_time_ms,
            resource_usage: ResourceUsage {
                cpu_percent: 40.0,
                memory_percent: 30.0,
                network_kb: 12.0,
            },
            signature: None,
        }
    }

    #[test]
    fn clean_result_passes_all_checks() {
        let checks = run_checks(&result_with(b"42", 5_000));
        assert!(checks.execution_time_valid);
        assert!(checks.resource_usage_valid);
        assert!(checks.output_valid);
        assert!(!checks.result_hash.is_empty());
        assert!((confidence_of(&checks) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn suspect_output_fails_validity() {
        for marker in ["ERROR: boom", "request Failed", "Timeout waiting"] {
            let checks = run_checks(&result_with(marker.as_bytes(), 5_000));
            assert!(!checks.output_valid, "{} should be suspect", marker);
        }
    }

    #[test]
    fn empty_output_is_invalid() {
        let checks = run_checks(&result_with(b"", 5_000));
        assert!(!checks.output_valid);
    }

    #[test]
    fn execution_time_bounds() {
        assert!(!run_checks(&result_with(b"x", 50)).execution_time_valid);
        assert!(run_checks(&result_with(b"x", 100)).execution_time_valid);
        assert!(run_checks(&result_with(b"x", 300_000)).execution_time_valid);
        assert!(!run_checks(&result_with(b"x", 300_001)).execution_time_valid);
    }

    #[test]
    fn resource_bounds_are_enforced() {
        let mut result = result_with(b"x", 5_000);
        result.resource_usage.cpu_percent = 120.0;
        assert!(!run_checks(&result).resource_usage_valid);

        result.resource_usage.cpu_percent = 50.0;
        result.resource_usage.network_kb = -1.0;
        assert!(!run_checks(&result).resource_usage_valid);
    }

    #[test]
    fn confidence_requires_output_for_validity() {
        // All checks pass except output: confidence 0.6, below the 0.7 bar.
        let checks = run_checks(&result_with(b"error inside", 5_000));
        let confidence = confidence_of(&checks);
        assert!((confidence - 0.6).abs() < 1e-9);
        assert!(confidence < 0.7);
    }

    #[test]
    fn reputation_score_formula() {
        let mut score = ReputationScore::new(NodeId::random());
        assert!((score.score - 0.5).abs() < f64::EPSILON);

        // Three correct, one false positive.
        score.total = 4;
        score.correct = 3;
        score.false_positive = 1;
        score.recompute();
        // accuracy 0.75, error_rate 0.25 -> 0.75 - 0.125 = 0.625
        assert!((score.score - 0.625).abs() < 1e-9);
    }

    #[test]
    fn reputation_clamps_to_unit_interval() {
        let mut score = ReputationScore::new(NodeId::random());
        score.total = 10;
        score.correct = 0;
        score.false_negative = 10;
        score.recompute();
        assert!((score.score - 0.0).abs() < f64::EPSILON);
    }
}
