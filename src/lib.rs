// ===================================================================================================
// ComputeMesh - Peer-to-Peer Compute Task Distribution and Verification Fabric
// ===================================================================================================
//
// ComputeMesh lets nodes advertise compute capabilities, discover each other over a
// Kademlia-structured overlay, dispatch work to capability-matched executors with replicated
// backups, and subject every result to multi-verifier Byzantine-style consensus before it
// counts. Reputation accumulates from verification outcomes and gates future participation.
//
// ## KEY DESIGN PRINCIPLES
//
// ### 1. Single Owner per Table
// Every entity has exactly one owning subsystem: the peer manager owns peer records and
// channels, routing owns the k-bucket table, dispatch owns active tasks, verification owns
// outcomes and reputation, resilience owns partitions and breakers. Cross-subsystem
// references travel as ids, never as shared structs.
//
// ### 2. Message Passing over Back-References
// Subsystems hold narrow command handles (the peer manager is a dedicated actor); nothing
// calls "upward". Inbound frames fan out from one place by frame kind.
//
// ### 3. External Seams for External Concerns
// The transport, the telemetry source, the admission policy, and the task runners are traits
// supplied by the embedder. The fabric coordinates; it does not measure hardware, dial
// sockets, or judge local load.
//
// ### 4. Everything Times Out
// Every remote await carries a deadline. Tasks promote backups or fail; verifications
// finalize at their deadline; partitions go permanent after bounded healing attempts. No
// operation hangs indefinitely.
//
// ===================================================================================================

// ===== IDENTITY, WIRE SURFACE, AND SEAMS =====
pub mod identity;          // 160-bit node ids, Ed25519 keys, detached signatures
pub mod messages;          // Frames, discovery payloads, canonical encoding
pub mod transport;         // External connection primitive + in-memory hub
pub mod telemetry;         // Capability snapshots and the telemetry seam

// ===== SUBSYSTEMS =====
pub mod peer_manager;      // Peer records, channels, liveness, inbound fan-out
pub mod routing;           // XOR-metric k-bucket table and iterative lookups
pub mod discovery;         // Bootstrap, neighbor exchange, relays, routing paths
pub mod dispatch;          // Task submission, candidate selection, execution
pub mod verification;      // Attestations, consensus, reputation
pub mod resilience;        // Health, partitions, quarantine, circuit breakers

// ===== COMPOSITION AND SUPPORT =====
pub mod computemesh_core;  // Orchestrator facade and public surface
pub mod config;            // TOML-backed configuration with validated defaults
pub mod error;             // MeshError / MeshResult
pub mod events;            // Typed event enumeration and broadcast hub
pub mod logging;           // Tracing subscriber setup

pub use computemesh_core::{AdmissionPolicy, ComputeMeshCore};
pub use config::MeshConfig;
pub use error::{MeshError, MeshResult};
pub use events::MeshEvent;
pub use identity::{NodeId, NodeIdentity};
