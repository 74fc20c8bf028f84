use std::sync::Mutex;

use ahash::{HashMap, HashMapExt};

use crate::mailbox::NodeHandle;
use crate::msg::NodeId;

/// The set of peers a node can directly message. Mutated by the owning
/// driver (`add_neighbor`/`remove_neighbor`), by the node's own message
/// loop (`Detach` handling) and by `fail()`, so every access goes through
/// the lock.
#[derive(Default)]
pub struct Membership {
    peers: Mutex<HashMap<NodeId, NodeHandle>>,
}

impl Membership {
    pub fn new() -> Self {
        Membership {
            peers: Mutex::new(HashMap::new()),
        }
    }

    pub fn add(&self, peer: NodeHandle) {
        self.peers.lock().unwrap().insert(peer.id(), peer);
    }

    pub fn remove(&self, id: NodeId) -> Option<NodeHandle> {
        self.peers.lock().unwrap().remove(&id)
    }

    pub fn clear(&self) {
        self.peers.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.peers.lock().unwrap().contains_key(&id)
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.peers.lock().unwrap().keys().copied().collect()
    }

    /// Snapshot of the current peer handles, so broadcasts iterate without
    /// holding the lock.
    pub fn handles(&self) -> Vec<NodeHandle> {
        self.peers.lock().unwrap().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::Mailbox;

    #[test]
    fn add_remove_and_snapshot() {
        let membership = Membership::new();
        let (a, _mb_a) = Mailbox::new(1, "a");
        let (b, _mb_b) = Mailbox::new(2, "b");
        membership.add(a);
        membership.add(b.clone());
        assert_eq!(membership.len(), 2);
        assert!(membership.contains(1));

        let removed = membership.remove(1);
        assert!(removed.is_some());
        assert!(!membership.contains(1));
        assert_eq!(membership.handles(), vec![b]);
    }

    #[test]
    fn re_adding_a_peer_does_not_duplicate() {
        let membership = Membership::new();
        let (a, _mb_a) = Mailbox::new(1, "a");
        membership.add(a.clone());
        membership.add(a);
        assert_eq!(membership.len(), 1);
    }

    #[test]
    fn clear_empties_the_set() {
        let membership = Membership::new();
        let (a, _mb_a) = Mailbox::new(1, "a");
        membership.add(a);
        membership.clear();
        assert!(membership.is_empty());
        assert!(membership.ids().is_empty());
    }
}
