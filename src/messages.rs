// ===================================================================================================
// Wire Surface - Frames, Discovery Payloads, and Canonical Encoding
// ===================================================================================================
//
// Every byte that crosses a peer link is a bincode-encoded `NetworkFrame`. The frame header is
// shared by all subsystems; the payload is a kind-specific canonical encoding. Signatures are
// detached Ed25519 over the bincode of `(kind, from, to, timestamp, payload)` - the signable
// tuple never includes the signature field itself, so signing and verifying agree byte-exactly
// between peers.
//
// Discovery traffic multiplexes over `FrameKind::PeerDiscovery` with the `DiscoveryPayload`
// union; verification requests and attestations multiplex over `FrameKind::VerificationRequest`.
//
// ===================================================================================================

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MeshResult;
use crate::identity::{self, NodeId, NodeIdentity};
use crate::telemetry::CapabilitySnapshot;

/// Frame kinds shared by every layer above the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameKind {
    Ping,
    Pong,
    TaskRequest,
    TaskResponse,
    TaskResult,
    PeerDiscovery,
    VerificationRequest,
}

/// Envelope for every message exchanged between peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkFrame {
    /// Unique within the sender for the session.
    pub frame_id: u64,
    pub kind: FrameKind,
    pub from: NodeId,
    pub to: NodeId,
    /// Unix milliseconds at send time.
    pub timestamp_ms: i64,
    /// Kind-specific canonical encoding.
    pub payload: Vec<u8>,
    /// Detached Ed25519 signature over the signable tuple, when signed.
    pub signature: Option<Vec<u8>>,
}

/// The exact byte layout covered by a frame signature.
#[derive(Serialize)]
struct SignableFrame<'a> {
    kind: FrameKind,
    from: &'a NodeId,
    to: &'a NodeId,
    timestamp_ms: i64,
    payload: &'a [u8],
}

impl NetworkFrame {
    pub fn new(
        frame_id: u64,
        kind: FrameKind,
        from: NodeId,
        to: NodeId,
        payload: Vec<u8>,
    ) -> Self {
        NetworkFrame {
            frame_id,
            kind,
            from,
            to,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            payload,
            signature: None,
        }
    }

    /// Canonical bytes covered by the signature.
    pub fn signable_bytes(&self) -> MeshResult<Vec<u8>> {
        let signable = SignableFrame {
            kind: self.kind,
            from: &self.from,
            to: &self.to,
            timestamp_ms: self.timestamp_ms,
            payload: &self.payload,
        };
        Ok(bincode::serialize(&signable)?)
    }

    pub fn sign(&mut self, identity: &NodeIdentity) -> MeshResult<()> {
        let bytes = self.signable_bytes()?;
        self.signature = Some(identity.sign(&bytes));
        Ok(())
    }

    /// Verify the frame signature against the sender's advertised public key.
    /// Unsigned frames verify as `false`.
    pub fn verify(&self, public_key: &[u8]) -> bool {
        let Some(signature) = &self.signature else {
            return false;
        };
        let Ok(bytes) = self.signable_bytes() else {
            return false;
        };
        identity::verify_signature(public_key, &bytes, signature)
    }

    pub fn encode(&self) -> MeshResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> MeshResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Liveness probe. The nonce correlates Pong replies with outstanding probes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingPayload {
    pub nonce: u64,
    pub sent_at_ms: i64,
}

/// Liveness reply echoing the originating timestamp so the sender can measure latency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PongPayload {
    pub nonce: u64,
    pub echoed_at_ms: i64,
}

/// Wire form of a routing-table entry handed out in FIND_NODE answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhtNodeInfo {
    pub node_id: NodeId,
    pub capabilities: Option<CapabilitySnapshot>,
    pub reputation: f64,
}

/// Wire form of a peer record shared in neighbor and catalog exchanges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub node_id: NodeId,
    pub public_key: Vec<u8>,
    pub capabilities: Option<CapabilitySnapshot>,
    pub reputation: f64,
    pub latency_ms: Option<u64>,
}

/// Signed self-advertisement broadcast by every node once per discovery period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerAdvertisement {
    pub peer: NodeId,
    pub public_key: Vec<u8>,
    pub capabilities: CapabilitySnapshot,
    pub endpoints: Vec<String>,
    pub methods: Vec<crate::discovery::DiscoveryMethod>,
    pub timestamp_ms: i64,
    pub ttl_ms: i64,
    pub signature: Option<Vec<u8>>,
}

#[derive(Serialize)]
struct SignableAdvertisement<'a> {
    peer: &'a NodeId,
    public_key: &'a [u8],
    capabilities: &'a CapabilitySnapshot,
    endpoints: &'a [String],
    timestamp_ms: i64,
    ttl_ms: i64,
}

impl PeerAdvertisement {
    pub fn signable_bytes(&self) -> MeshResult<Vec<u8>> {
        let signable = SignableAdvertisement {
            peer: &self.peer,
            public_key: &self.public_key,
            capabilities: &self.capabilities,
            endpoints: &self.endpoints,
            timestamp_ms: self.timestamp_ms,
            ttl_ms: self.ttl_ms,
        };
        Ok(bincode::serialize(&signable)?)
    }

    pub fn sign(&mut self, identity: &NodeIdentity) -> MeshResult<()> {
        let bytes = self.signable_bytes()?;
        self.signature = Some(identity.sign(&bytes));
        Ok(())
    }

    pub fn verify(&self) -> bool {
        let Some(signature) = &self.signature else {
            return false;
        };
        let Ok(bytes) = self.signable_bytes() else {
            return false;
        };
        identity::verify_signature(&self.public_key, &bytes, signature)
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms.saturating_sub(self.timestamp_ms) > self.ttl_ms
    }
}

/// Severity attached to security alerts shared between trusted peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
}

/// Union of every payload recognized under `FrameKind::PeerDiscovery`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DiscoveryPayload {
    FindNode {
        target: NodeId,
        request_id: Uuid,
    },
    FindNodeResp {
        request_id: Uuid,
        nodes: Vec<DhtNodeInfo>,
    },
    NeighborRequest {
        request_id: Uuid,
    },
    NeighborResponse {
        request_id: Uuid,
        peers: Vec<PeerInfo>,
    },
    PeerListRequest {
        request_id: Uuid,
    },
    PeerListResponse {
        request_id: Uuid,
        peers: Vec<PeerInfo>,
    },
    PathQuery {
        destination: NodeId,
        request_id: Uuid,
    },
    PathResponse {
        request_id: Uuid,
        has_path: bool,
    },
    Advertisement(PeerAdvertisement),
    SecurityAlert {
        malicious_peer: NodeId,
        severity: AlertSeverity,
        timestamp_ms: i64,
    },
    PartitionHealing {
        affected_peers: Vec<NodeId>,
        request_id: Uuid,
    },
    PartitionHealingResponse {
        peers: Vec<PeerInfo>,
        request_id: Uuid,
    },
}

impl DiscoveryPayload {
    pub fn encode(&self) -> MeshResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> MeshResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{ComputeTier, ThermalState};

    fn snapshot() -> CapabilitySnapshot {
        CapabilitySnapshot {
            tier: ComputeTier::High,
            cpu_cores: 8,
            ram_gb: 16.0,
            gpu_available: true,
            bandwidth_mbps: 250.0,
            battery_percent: Some(80.0),
            thermal: ThermalState::Nominal,
        }
    }

    #[test]
    fn frame_encoding_round_trip() {
        let from = NodeId::random();
        let to = NodeId::random();
        let frame = NetworkFrame::new(7, FrameKind::Ping, from, to, vec![1, 2, 3]);
        let decoded = NetworkFrame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded.frame_id, 7);
        assert_eq!(decoded.kind, FrameKind::Ping);
        assert_eq!(decoded.from, from);
        assert_eq!(decoded.payload, vec![1, 2, 3]);
    }

    #[test]
    fn signed_frame_verifies_and_rejects_tampering() {
        let identity = NodeIdentity::generate();
        let mut frame = NetworkFrame::new(
            1,
            FrameKind::TaskRequest,
            identity.node_id(),
            NodeId::random(),
            b"payload".to_vec(),
        );
        frame.sign(&identity).unwrap();
        assert!(frame.verify(&identity.public_key_bytes()));

        let mut tampered = frame.clone();
        tampered.payload = b"other".to_vec();
        assert!(!tampered.verify(&identity.public_key_bytes()));

        let mut unsigned = frame.clone();
        unsigned.signature = None;
        assert!(!unsigned.verify(&identity.public_key_bytes()));
    }

    #[test]
    fn advertisement_signature_covers_capabilities() {
        let identity = NodeIdentity::generate();
        let mut ad = PeerAdvertisement {
            peer: identity.node_id(),
            public_key: identity.public_key_bytes(),
            capabilities: snapshot(),
            endpoints: vec!["mem://local".to_string()],
            methods: vec![],
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            ttl_ms: 300_000,
            signature: None,
        };
        ad.sign(&identity).unwrap();
        assert!(ad.verify());

        ad.capabilities.cpu_cores = 64;
        assert!(!ad.verify());
    }

    #[test]
    fn advertisement_expiry() {
        let identity = NodeIdentity::generate();
        let ad = PeerAdvertisement {
            peer: identity.node_id(),
            public_key: identity.public_key_bytes(),
            capabilities: snapshot(),
            endpoints: vec![],
            methods: vec![],
            timestamp_ms: 1_000,
            ttl_ms: 300_000,
            signature: None,
        };
        assert!(!ad.is_expired(2_000));
        assert!(ad.is_expired(302_000));
    }

    #[test]
    fn discovery_payload_round_trip() {
        let payload = DiscoveryPayload::FindNode {
            target: NodeId::random(),
            request_id: Uuid::new_v4(),
        };
        let decoded = DiscoveryPayload::decode(&payload.encode().unwrap()).unwrap();
        match decoded {
            DiscoveryPayload::FindNode { .. } => {}
            other => panic!("unexpected payload: {:?}", other),
        }
    }
}
