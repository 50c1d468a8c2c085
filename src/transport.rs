// ===================================================================================================
// Transport Seam - External Connection Primitive
// ===================================================================================================
//
// The fabric does not implement connectivity. An embedder supplies a `Transport` that can open a
// bidirectional, ordered, message-oriented channel to a peer identified by node id; NAT
// traversal, dialing addresses, and link security live on the other side of this seam. The peer
// manager is the only subsystem that touches the transport.
//
// Guarantees required from an implementation:
// - per-peer frame ordering on each channel;
// - `PeerChannel::send` never blocks: a full or closed link fails fast;
// - inbound messages surface with the sender's node id attached.
//
// `memory::MemoryHub` provides the in-process implementation used by the integration tests to
// assemble multi-node meshes, including partition simulation by dropping hub membership.
//
// ===================================================================================================

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{MeshError, MeshResult};
use crate::identity::NodeId;

/// Per-channel buffer depth. A peer that stops draining loses frames rather than
/// backpressuring the whole fabric.
pub const CHANNEL_CAPACITY: usize = 1024;

/// An open, ordered message channel to a single remote peer.
#[derive(Debug, Clone)]
pub struct PeerChannel {
    peer: NodeId,
    tx: mpsc::Sender<Vec<u8>>,
}

impl PeerChannel {
    pub fn new(peer: NodeId, tx: mpsc::Sender<Vec<u8>>) -> Self {
        PeerChannel { peer, tx }
    }

    pub fn peer(&self) -> NodeId {
        self.peer
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Frame-level send. Never blocks; a full or closed channel is an immediate error.
    pub fn send(&self, bytes: Vec<u8>) -> MeshResult<()> {
        self.tx.try_send(bytes).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                MeshError::TransportUnavailable(format!("channel to {} is full", self.peer))
            }
            mpsc::error::TrySendError::Closed(_) => MeshError::NotConnected(self.peer),
        })
    }
}

/// The external connection primitive.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open (or re-open) a channel to the peer. Implementations may fail with
    /// `TransportUnavailable` for unreachable peers.
    async fn open(&self, peer: NodeId) -> MeshResult<PeerChannel>;

    /// Next inbound message as `(sender, bytes)`. Returns `None` once the transport
    /// has shut down.
    async fn next_inbound(&self) -> Option<(NodeId, Vec<u8>)>;
}

pub mod memory {
    //! In-process hub transport for tests and single-binary meshes.

    use std::collections::HashMap;
    use std::sync::Arc;

    use tokio::sync::{mpsc, Mutex};

    use super::{PeerChannel, Transport, CHANNEL_CAPACITY};
    use crate::error::{MeshError, MeshResult};
    use crate::identity::NodeId;

    /// Registry connecting every in-process node to every other.
    pub struct MemoryHub {
        members: Mutex<HashMap<NodeId, mpsc::Sender<(NodeId, Vec<u8>)>>>,
    }

    impl MemoryHub {
        pub fn new() -> Arc<Self> {
            Arc::new(MemoryHub {
                members: Mutex::new(HashMap::new()),
            })
        }

        /// Join the hub under the given id and obtain this node's transport.
        pub async fn join(self: &Arc<Self>, local: NodeId) -> MemoryTransport {
            let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
            self.members.lock().await.insert(local, inbound_tx);
            MemoryTransport {
                hub: Arc::clone(self),
                local,
                inbound: Mutex::new(inbound_rx),
            }
        }

        /// Drop a node from the hub: existing channels to it start failing, which is
        /// how tests simulate partitions and crashed peers.
        pub async fn drop_peer(&self, peer: NodeId) {
            self.members.lock().await.remove(&peer);
        }

        async fn sender_for(&self, peer: NodeId) -> Option<mpsc::Sender<(NodeId, Vec<u8>)>> {
            self.members.lock().await.get(&peer).cloned()
        }
    }

    /// One node's view of the hub.
    pub struct MemoryTransport {
        hub: Arc<MemoryHub>,
        local: NodeId,
        inbound: Mutex<mpsc::Receiver<(NodeId, Vec<u8>)>>,
    }

    #[async_trait::async_trait]
    impl Transport for MemoryTransport {
        async fn open(&self, peer: NodeId) -> MeshResult<PeerChannel> {
            let remote = self
                .hub
                .sender_for(peer)
                .await
                .ok_or_else(|| MeshError::TransportUnavailable(format!("peer {} not in hub", peer)))?;

            let (tx, mut rx) = mpsc::channel::<Vec<u8>>(CHANNEL_CAPACITY);
            let local = self.local;
            tokio::spawn(async move {
                while let Some(bytes) = rx.recv().await {
                    if remote.send((local, bytes)).await.is_err() {
                        break;
                    }
                }
            });
            Ok(PeerChannel::new(peer, tx))
        }

        async fn next_inbound(&self) -> Option<(NodeId, Vec<u8>)> {
            self.inbound.lock().await.recv().await
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn messages_flow_between_hub_members() {
            let hub = MemoryHub::new();
            let a = NodeId::random();
            let b = NodeId::random();
            let ta = hub.join(a).await;
            let tb = hub.join(b).await;

            let channel = ta.open(b).await.unwrap();
            channel.send(b"hello".to_vec()).unwrap();

            let (from, bytes) = tb.next_inbound().await.unwrap();
            assert_eq!(from, a);
            assert_eq!(bytes, b"hello");
        }

        #[tokio::test]
        async fn open_fails_for_unknown_peer() {
            let hub = MemoryHub::new();
            let a = NodeId::random();
            let ta = hub.join(a).await;
            let err = ta.open(NodeId::random()).await.unwrap_err();
            assert!(matches!(err, MeshError::TransportUnavailable(_)));
        }

        #[tokio::test]
        async fn dropped_peer_stops_receiving() {
            let hub = MemoryHub::new();
            let a = NodeId::random();
            let b = NodeId::random();
            let ta = hub.join(a).await;
            let _tb = hub.join(b).await;

            let channel = ta.open(b).await.unwrap();
            hub.drop_peer(b).await;

            // The forwarding task may take a beat to observe the closed end.
            channel.send(b"one".to_vec()).ok();
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            assert!(ta.open(b).await.is_err());
        }
    }
}
