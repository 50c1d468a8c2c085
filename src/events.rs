//! Typed event surface of the fabric.
//!
//! Subsystems publish [`MeshEvent`]s onto a broadcast hub; embedders subscribe through
//! [`ComputeMeshCore::events`](crate::computemesh_core::ComputeMeshCore::events). Events are
//! a tagged enum rather than string-keyed payloads so subscribers match on variants.

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::identity::NodeId;
use crate::messages::AlertSeverity;
use crate::verification::ConsensusState;

/// Buffer depth for the broadcast channel; slow subscribers drop the oldest events.
const EVENT_CAPACITY: usize = 256;

/// Everything the fabric reports at its external boundary.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    Initialized {
        local: NodeId,
    },
    PeerConnected {
        peer: NodeId,
    },
    PeerDisconnected {
        peer: NodeId,
        reason: String,
    },
    PeersDiscovered {
        peers: Vec<NodeId>,
    },
    TaskSubmitted {
        task_id: Uuid,
    },
    TaskReceived {
        task_id: Uuid,
        submitter: NodeId,
    },
    TaskAccepted {
        task_id: Uuid,
    },
    TaskCompleted {
        task_id: Uuid,
    },
    TaskFailed {
        task_id: Uuid,
        reason: String,
    },
    VerificationRequested {
        verification_id: Uuid,
        task_id: Uuid,
    },
    VerificationFinalized {
        verification_id: Uuid,
        task_id: Uuid,
        consensus: ConsensusState,
    },
    HealthUpdated {
        score: f64,
    },
    PartitionDetected {
        partition_id: Uuid,
        affected: Vec<NodeId>,
    },
    PartitionHealed {
        partition_id: Uuid,
    },
    SecurityAlertReceived {
        source: NodeId,
        malicious_peer: NodeId,
        severity: AlertSeverity,
    },
    NetworkReset,
    Shutdown,
}

/// Cloneable broadcast hub shared by every subsystem.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MeshEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        EventBus { tx }
    }

    /// Publish an event. Absence of subscribers is not an error.
    pub fn publish(&self, event: MeshEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(MeshEvent::NetworkReset);
        match rx.recv().await.unwrap() {
            MeshEvent::NetworkReset => {}
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(MeshEvent::Shutdown);
    }
}
