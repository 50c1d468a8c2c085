//! Consensus mechanics: approval thresholds, deadline rejection, duplicate and
//! outsider attestations, and reputation accounting.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use computemesh::config::MeshConfig;
use computemesh::dispatch::{TaskRequest, TaskType};
use computemesh::events::EventBus;
use computemesh::identity::{NodeId, NodeIdentity};
use computemesh::peer_manager::{PeerManager, PeerManagerHandle, PeerUpdate};
use computemesh::routing::RoutingService;
use computemesh::telemetry::{StaticTelemetry, TelemetrySource};
use computemesh::transport::memory::MemoryHub;
use computemesh::verification::{
    ConsensusState, TaskVerification, VerificationChecks, VerificationResponse,
};

use common::*;

struct Harness {
    verification: Arc<TaskVerification>,
    peers: PeerManagerHandle,
    verifier_ids: Vec<NodeId>,
    executor: NodeId,
    submitter: Arc<NodeIdentity>,
    _verifiers: Vec<LightNode>,
}

/// Build a submitter with `verifier_count` connected verifier peers and one executor,
/// signatures off so attestations can be hand-crafted.
async fn harness(verifier_count: usize, timeout_ms: u64) -> Harness {
    let hub = MemoryHub::new();
    let submitter = Arc::new(NodeIdentity::generate());
    let transport = Arc::new(hub.join(submitter.node_id()).await);
    let telemetry: Arc<dyn TelemetrySource> =
        Arc::new(StaticTelemetry::new(snapshot(4, 8.0, false)));

    let mut config = MeshConfig::default();
    config.network.require_signatures = false;
    config.verification.verification_timeout_ms = timeout_ms;

    let (peers, _inbound) = PeerManager::spawn(
        Arc::clone(&submitter),
        transport,
        telemetry,
        EventBus::new(),
        config.network.clone(),
        CancellationToken::new(),
    );
    let routing = RoutingService::new(submitter.node_id(), peers.clone());
    let verification = TaskVerification::new(
        Arc::clone(&submitter),
        peers.clone(),
        routing,
        EventBus::new(),
        config.verification.clone(),
        false,
        CancellationToken::new(),
    );

    let mut verifier_ids = Vec::new();
    let mut verifiers = Vec::new();
    for _ in 0..verifier_count {
        let verifier = spawn_light_node(&hub, snapshot(4, 8.0, false)).await;
        peers.connect(verifier.id()).await.unwrap();
        peers.upsert_peer(
            verifier.id(),
            PeerUpdate {
                capabilities: Some(snapshot(4, 8.0, false)),
                ..Default::default()
            },
        );
        verifier_ids.push(verifier.id());
        verifiers.push(verifier);
    }
    // Give the upserts a beat to land in the actor.
    tokio::time::sleep(Duration::from_millis(50)).await;

    Harness {
        verification,
        peers,
        verifier_ids,
        executor: NodeId::random(),
        submitter,
        _verifiers: verifiers,
    }
}

fn task(submitter: NodeId) -> TaskRequest {
    TaskRequest {
        task_id: Uuid::new_v4(),
        task_type: TaskType::Compute,
        payload: b"payload".to_vec(),
        requirements: requirements(2, 4.0),
        reward: 0.01,
        deadline_ms: chrono::Utc::now().timestamp_millis() + 60_000,
        submitter,
        created_at_ms: chrono::Utc::now().timestamp_millis(),
        signature: None,
    }
}

fn attestation(
    verification_id: Uuid,
    task_id: Uuid,
    verifier: NodeId,
    is_valid: bool,
    confidence: f64,
) -> VerificationResponse {
    VerificationResponse {
        verification_id,
        verifier,
        task_id,
        is_valid,
        confidence,
        checks: VerificationChecks {
            result_hash: "ab".repeat(32),
            execution_time_valid: true,
            resource_usage_valid: true,
            output_valid: is_valid,
        },
        timestamp_ms: chrono::Utc::now().timestamp_millis(),
        signature: None,
    }
}

#[tokio::test]
async fn majority_approval_with_one_dissenter() {
    let h = harness(5, 60_000).await;
    let request = task(h.submitter.node_id());
    let result = sample_result(request.task_id, h.executor, b"fine output");

    let verification_id = h
        .verification
        .request_verification(&request, &result)
        .await
        .unwrap();

    // Dissenter first so consensus cannot close before a rejection is on the books.
    h.verification
        .record_response(attestation(
            verification_id,
            request.task_id,
            h.verifier_ids[0],
            false,
            0.9,
        ))
        .await
        .unwrap();
    for verifier in h.verifier_ids.iter().skip(1).take(3) {
        h.verification
            .record_response(attestation(
                verification_id,
                request.task_id,
                *verifier,
                true,
                0.8,
            ))
            .await
            .unwrap();
    }

    let outcome = h.verification.outcome(&verification_id).await.unwrap();
    assert_eq!(outcome.consensus, ConsensusState::Approved);
    assert_eq!(outcome.approvals, 3);
    assert_eq!(outcome.rejections, 1);
    // (0.9 + 0.8 * 3) / 4
    assert!((outcome.average_confidence - 0.825).abs() < 1e-9);

    // The dissenter voted invalid against an approved consensus: a false negative.
    let dissenter = h
        .verification
        .reputation_of(&h.verifier_ids[0])
        .await
        .unwrap();
    assert_eq!(dissenter.false_negative, 1);
    assert_eq!(dissenter.correct, 0);

    let agreeing = h
        .verification
        .reputation_of(&h.verifier_ids[1])
        .await
        .unwrap();
    assert_eq!(agreeing.correct, 1);
    assert!(agreeing.score > dissenter.score);

    // A straggler after finalization changes nothing.
    h.verification
        .record_response(attestation(
            verification_id,
            request.task_id,
            h.verifier_ids[4],
            true,
            0.8,
        ))
        .await
        .unwrap();
    let outcome = h.verification.outcome(&verification_id).await.unwrap();
    assert_eq!(outcome.approvals, 3);
}

#[tokio::test]
async fn two_responses_at_deadline_reject() {
    let h = harness(5, 300).await;
    let request = task(h.submitter.node_id());
    let result = sample_result(request.task_id, h.executor, b"fine output");

    let verification_id = h
        .verification
        .request_verification(&request, &result)
        .await
        .unwrap();

    for verifier in h.verifier_ids.iter().take(2) {
        h.verification
            .record_response(attestation(
                verification_id,
                request.task_id,
                *verifier,
                true,
                0.9,
            ))
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(600)).await;
    let outcome = h.verification.outcome(&verification_id).await.unwrap();
    assert_eq!(outcome.consensus, ConsensusState::Rejected);
    assert_eq!(outcome.approvals, 2);
}

#[tokio::test]
async fn deadline_majority_wins_and_ties_reject() {
    // Majority of approvals at the deadline, below the 0.67 bar: Approved by ratio.
    let h = harness(7, 400).await;
    let request = task(h.submitter.node_id());
    let result = sample_result(request.task_id, h.executor, b"fine output");
    let verification_id = h
        .verification
        .request_verification(&request, &result)
        .await
        .unwrap();

    // 3 approve, 2 reject, interleaved so neither side crosses 0.67 early.
    let votes = [false, true, false, true, true];
    for (verifier, vote) in h.verifier_ids.iter().zip(votes) {
        h.verification
            .record_response(attestation(
                verification_id,
                request.task_id,
                *verifier,
                vote,
                0.8,
            ))
            .await
            .unwrap();
    }
    let pending = h.verification.outcome(&verification_id).await.unwrap();
    assert_eq!(pending.consensus, ConsensusState::Pending);

    tokio::time::sleep(Duration::from_millis(700)).await;
    let outcome = h.verification.outcome(&verification_id).await.unwrap();
    assert_eq!(outcome.consensus, ConsensusState::Approved);
}

#[tokio::test]
async fn duplicate_and_outsider_attestations_are_rejected() {
    let h = harness(4, 60_000).await;
    let request = task(h.submitter.node_id());
    let result = sample_result(request.task_id, h.executor, b"fine output");
    let verification_id = h
        .verification
        .request_verification(&request, &result)
        .await
        .unwrap();

    h.verification
        .record_response(attestation(
            verification_id,
            request.task_id,
            h.verifier_ids[0],
            true,
            0.8,
        ))
        .await
        .unwrap();

    // Same verifier again: rejected, counts unchanged.
    let duplicate = h
        .verification
        .record_response(attestation(
            verification_id,
            request.task_id,
            h.verifier_ids[0],
            true,
            0.8,
        ))
        .await;
    assert!(duplicate.is_err());

    // A peer that was never selected cannot attest.
    let outsider = h
        .verification
        .record_response(attestation(
            verification_id,
            request.task_id,
            NodeId::random(),
            true,
            0.8,
        ))
        .await;
    assert!(outsider.is_err());

    let outcome = h.verification.outcome(&verification_id).await.unwrap();
    assert_eq!(outcome.approvals, 1);
    assert_eq!(outcome.responses.len(), 1);
}

#[tokio::test]
async fn verifier_selection_excludes_executor() {
    let h = harness(5, 60_000).await;
    let request = task(h.submitter.node_id());
    // Make one of the connected verifiers the executor; it must not verify itself.
    let executor = h.verifier_ids[0];
    let result = sample_result(request.task_id, executor, b"fine output");

    let verification_id = h
        .verification
        .request_verification(&request, &result)
        .await
        .unwrap();

    let from_executor = h
        .verification
        .record_response(attestation(
            verification_id,
            request.task_id,
            executor,
            true,
            0.9,
        ))
        .await;
    assert!(from_executor.is_err(), "executor cannot attest its own work");

    let outcome = h.verification.outcome(&verification_id).await.unwrap();
    assert_eq!(outcome.verifier_count, 4);
}

#[tokio::test]
async fn no_verifiers_rejects_outright() {
    let h = harness(0, 60_000).await;
    let request = task(h.submitter.node_id());
    let result = sample_result(request.task_id, h.executor, b"fine output");

    let verification_id = h
        .verification
        .request_verification(&request, &result)
        .await
        .unwrap();
    let outcome = h.verification.outcome(&verification_id).await.unwrap();
    assert_eq!(outcome.consensus, ConsensusState::Rejected);

    // Keep the handle alive to the end of the test.
    let _ = h.peers.connected_peers().await;
}

#[tokio::test]
async fn finalize_in_flight_applies_shutdown_rules() {
    let h = harness(5, 60_000).await;
    let request = task(h.submitter.node_id());
    let result = sample_result(request.task_id, h.executor, b"fine output");
    let with_quorum = h
        .verification
        .request_verification(&request, &result)
        .await
        .unwrap();

    let other_request = task(h.submitter.node_id());
    let other_result = sample_result(other_request.task_id, h.executor, b"fine output");
    let without_quorum = h
        .verification
        .request_verification(&other_request, &other_result)
        .await
        .unwrap();

    // Three approvals on the first, one on the second.
    for verifier in h.verifier_ids.iter().take(3) {
        h.verification
            .record_response(attestation(with_quorum, request.task_id, *verifier, true, 0.8))
            .await
            .unwrap();
    }
    h.verification
        .record_response(attestation(
            without_quorum,
            other_request.task_id,
            h.verifier_ids[0],
            true,
            0.8,
        ))
        .await
        .unwrap();

    h.verification.finalize_in_flight().await;

    assert_eq!(
        h.verification.outcome(&with_quorum).await.unwrap().consensus,
        ConsensusState::Approved
    );
    assert_eq!(
        h.verification
            .outcome(&without_quorum)
            .await
            .unwrap()
            .consensus,
        ConsensusState::Rejected
    );
}
