// ===================================================================================================
// Node Identity - 160-bit Ids, Ed25519 Keys, and Detached Signatures
// ===================================================================================================
//
// Every node derives a stable 160-bit identifier from its Ed25519 public key (SHA-256, truncated
// to 20 bytes). The id is derived once per process and never changes within a session. XOR over
// ids defines the routing metric; `Distance::bucket_index` is the position of the highest set
// bit, which places a node in exactly one k-bucket.
//
// Signing is always detached Ed25519 over a deterministic canonical encoding produced by the
// caller. Verification is performed against the peer's advertised public key; a non-empty
// signature is never trusted on its own.
//
// ===================================================================================================

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{MeshError, MeshResult};

/// Length of a node identifier in bytes (160 bits).
pub const NODE_ID_LEN: usize = 20;

/// Length of a detached Ed25519 signature in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// 160-bit opaque node identifier. XOR defines the distance metric.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    pub fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        NodeId(bytes)
    }

    /// Derive the node id from an Ed25519 public key: SHA-256 truncated to 160 bits.
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let digest = Sha256::digest(public_key);
        let mut bytes = [0u8; NODE_ID_LEN];
        bytes.copy_from_slice(&digest[..NODE_ID_LEN]);
        NodeId(bytes)
    }

    /// Random id, used for bucket-refresh targets and tests.
    pub fn random() -> Self {
        let mut bytes = [0u8; NODE_ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        NodeId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// XOR distance to another id. Symmetric; zero iff the ids are equal.
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; NODE_ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> MeshResult<Self> {
        let bytes = hex::decode(s)?;
        if bytes.len() != NODE_ID_LEN {
            return Err(MeshError::Serialization(format!(
                "node id must be {} bytes, got {}",
                NODE_ID_LEN,
                bytes.len()
            )));
        }
        let mut out = [0u8; NODE_ID_LEN];
        out.copy_from_slice(&bytes);
        Ok(NodeId(out))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps log lines readable
        write!(f, "NodeId({}..)", &self.to_hex()[..8])
    }
}

/// XOR distance between two node ids. Ordered big-endian, so `Ord` sorts by closeness.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Distance([u8; NODE_ID_LEN]);

impl Distance {
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Index of the k-bucket this distance falls into: floor(log2(distance)).
    /// `None` for the zero distance (a node is never in its own table).
    pub fn bucket_index(&self) -> Option<usize> {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                let bit = 7 - byte.leading_zeros() as usize;
                return Some((NODE_ID_LEN - 1 - i) * 8 + bit);
            }
        }
        None
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }
}

/// Process-local keypair and the node id derived from it.
pub struct NodeIdentity {
    signing_key: SigningKey,
    node_id: NodeId,
}

impl NodeIdentity {
    /// Generate a fresh identity. Stable for the lifetime of the process.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        let signing_key = SigningKey::from_bytes(&seed);
        let node_id = NodeId::from_public_key(signing_key.verifying_key().as_bytes());
        NodeIdentity {
            signing_key,
            node_id,
        }
    }

    /// Rebuild an identity from a 32-byte secret seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&seed);
        let node_id = NodeId::from_public_key(signing_key.verifying_key().as_bytes());
        NodeIdentity {
            signing_key,
            node_id,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.signing_key.verifying_key().as_bytes().to_vec()
    }

    /// Detached signature over caller-provided canonical bytes.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }
}

/// Verify a detached signature against an advertised public key.
///
/// Any malformed key or signature counts as a failed verification rather than an error;
/// callers treat the frame as unsigned-invalid either way.
pub fn verify_signature(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(key_bytes) = <[u8; 32]>::try_from(public_key) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; SIGNATURE_LEN]>::try_from(signature) else {
        return false;
    };
    let sig = Signature::from_bytes(&sig_bytes);
    key.verify(message, &sig).is_ok()
}
