//! Property tests for the XOR metric and routing-table laws.

use computemesh::identity::NodeId;
use computemesh::routing::{DhtNode, RoutingTable, K};
use proptest::prelude::*;

fn node_id_strategy() -> impl Strategy<Value = NodeId> {
    proptest::array::uniform20(any::<u8>()).prop_map(NodeId::from_bytes)
}

proptest! {
    #[test]
    fn distance_is_symmetric(a in node_id_strategy(), b in node_id_strategy()) {
        prop_assert_eq!(a.distance(&b), b.distance(&a));
    }

    #[test]
    fn distance_to_self_is_zero(a in node_id_strategy()) {
        prop_assert!(a.distance(&a).is_zero());
        prop_assert_eq!(a.distance(&a).bucket_index(), None);
    }

    #[test]
    fn bucket_index_is_in_range(a in node_id_strategy(), b in node_id_strategy()) {
        if let Some(index) = a.distance(&b).bucket_index() {
            prop_assert!(index < 160);
        } else {
            prop_assert_eq!(a, b);
        }
    }

    #[test]
    fn triangle_inequality_of_xor(a in node_id_strategy(), b in node_id_strategy(), c in node_id_strategy()) {
        // XOR satisfies d(a,c) <= d(a,b) XOR d(b,c) as equality byte-wise; the useful
        // law for routing is that distances are consistent under relabeling.
        let ab = a.distance(&b);
        let ba = b.distance(&a);
        prop_assert_eq!(ab, ba);
        let ac = a.distance(&c);
        let bc = b.distance(&c);
        // d(a,c) is recoverable from d(a,b) and d(b,c): xor of the two.
        let mut expected = [0u8; 20];
        for i in 0..20 {
            expected[i] = ab.as_bytes()[i] ^ bc.as_bytes()[i];
        }
        prop_assert_eq!(ac.as_bytes(), &expected);
    }

    #[test]
    fn hex_round_trip(a in node_id_strategy()) {
        prop_assert_eq!(NodeId::from_hex(&a.to_hex()).unwrap(), a);
    }

    #[test]
    fn table_never_holds_local_or_duplicates(ids in proptest::collection::vec(node_id_strategy(), 1..64)) {
        let local = NodeId::from_bytes([0u8; 20]);
        let mut table = RoutingTable::new(local);
        for id in &ids {
            table.add_or_update(DhtNode::new(&local, *id));
            table.add_or_update(DhtNode::new(&local, *id));
        }
        // No duplicates: the table size never exceeds the distinct non-local ids.
        let mut distinct: Vec<NodeId> = ids.iter().copied().filter(|id| *id != local).collect();
        distinct.sort();
        distinct.dedup();
        prop_assert!(table.len() <= distinct.len());
        prop_assert!(!table.contains(&local));
    }

    #[test]
    fn closest_is_sorted_and_bounded(ids in proptest::collection::vec(node_id_strategy(), 1..64), target in node_id_strategy()) {
        let local = NodeId::from_bytes([0xAAu8; 20]);
        let mut table = RoutingTable::new(local);
        for id in ids {
            table.add_or_update(DhtNode::new(&local, id));
        }
        let closest = table.closest(&target, K);
        prop_assert!(closest.len() <= K);
        for pair in closest.windows(2) {
            prop_assert!(target.distance(&pair[0].node_id) <= target.distance(&pair[1].node_id));
        }
    }
}
