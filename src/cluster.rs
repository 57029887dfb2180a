use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

/// Globally unique node identifier.
pub type NodeId = Uuid;

/// Presence record for a single grid node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridNode {
    pub id: NodeId,
    /// Monotone join order, used for stable display sorting.
    pub order: u64,
}

/// Discovery events delivered to local subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    NodeLeft(NodeId),
    NodeFailed(NodeId),
    NodeMetricsUpdated(NodeId),
}

impl ClusterEvent {
    pub fn node_id(&self) -> NodeId {
        match self {
            Self::NodeLeft(id) | Self::NodeFailed(id) | Self::NodeMetricsUpdated(id) => *id,
        }
    }
}

pub trait ClusterEventListener: Send + Sync {
    fn on_event(&self, event: &ClusterEvent);
}

/// Node presence and liveness, supplied by the host's discovery layer.
pub trait Cluster: Send + Sync {
    fn local_node(&self) -> GridNode;

    fn node(&self, id: NodeId) -> Option<GridNode>;

    fn all_nodes(&self) -> Vec<GridNode>;

    fn is_alive(&self, id: NodeId) -> bool;

    /// Liveness probe that never errors; unreachable nodes report `false`.
    fn ping(&self, id: NodeId) -> bool;

    /// Subscribe to discovery events. Returns a token for unsubscription.
    fn add_event_listener(&self, listener: Arc<dyn ClusterEventListener>) -> usize;

    fn remove_event_listener(&self, token: usize);
}

/// In-process cluster with explicit membership control. Nodes are added and
/// removed by the embedding code (the binary and the test harness).
pub struct StaticCluster {
    local: GridNode,
    nodes: RwLock<HashMap<NodeId, GridNode>>,
    dead: RwLock<HashSet<NodeId>>,
    listeners: RwLock<Vec<(usize, Arc<dyn ClusterEventListener>)>>,
    next_token: std::sync::atomic::AtomicUsize,
}

impl StaticCluster {
    pub fn new(local_id: NodeId) -> Self {
        let local = GridNode {
            id: local_id,
            order: 1,
        };

        let mut nodes = HashMap::new();
        nodes.insert(local_id, local.clone());

        Self {
            local,
            nodes: RwLock::new(nodes),
            dead: RwLock::new(HashSet::new()),
            listeners: RwLock::new(Vec::new()),
            next_token: std::sync::atomic::AtomicUsize::new(1),
        }
    }

    pub fn add_node(&self, id: NodeId) {
        let order = self.nodes.read().len() as u64 + 1;
        self.nodes.write().insert(id, GridNode { id, order });
    }

    /// Remove a node and notify subscribers. `failed` distinguishes a crash
    /// from a graceful departure.
    pub fn remove_node(&self, id: NodeId, failed: bool) {
        if self.nodes.write().remove(&id).is_none() {
            return;
        }

        self.dead.write().insert(id);

        let event = if failed {
            ClusterEvent::NodeFailed(id)
        } else {
            ClusterEvent::NodeLeft(id)
        };

        self.fire(&event);
    }

    /// Broadcast a metrics-updated tick for the given node.
    pub fn fire_metrics_updated(&self, id: NodeId) {
        self.fire(&ClusterEvent::NodeMetricsUpdated(id));
    }

    fn fire(&self, event: &ClusterEvent) {
        let listeners: Vec<_> = self
            .listeners
            .read()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();

        for listener in listeners {
            listener.on_event(event);
        }
    }
}

impl Cluster for StaticCluster {
    fn local_node(&self) -> GridNode {
        self.local.clone()
    }

    fn node(&self, id: NodeId) -> Option<GridNode> {
        self.nodes.read().get(&id).cloned()
    }

    fn all_nodes(&self) -> Vec<GridNode> {
        let mut nodes: Vec<_> = self.nodes.read().values().cloned().collect();
        nodes.sort_by_key(|n| n.order);
        nodes
    }

    fn is_alive(&self, id: NodeId) -> bool {
        self.nodes.read().contains_key(&id)
    }

    fn ping(&self, id: NodeId) -> bool {
        self.is_alive(id)
    }

    fn add_event_listener(&self, listener: Arc<dyn ClusterEventListener>) -> usize {
        let token = self
            .next_token
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.listeners.write().push((token, listener));
        token
    }

    fn remove_event_listener(&self, token: usize) {
        self.listeners.write().retain(|(t, _)| *t != token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingListener(AtomicUsize);

    impl ClusterEventListener for CountingListener {
        fn on_event(&self, _event: &ClusterEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_remove_node_fires_once() {
        let cluster = StaticCluster::new(Uuid::new_v4());
        let other = Uuid::new_v4();
        cluster.add_node(other);

        let listener = Arc::new(CountingListener(AtomicUsize::new(0)));
        cluster.add_event_listener(listener.clone());

        cluster.remove_node(other, false);
        cluster.remove_node(other, false); // Already gone, no event.

        assert_eq!(listener.0.load(Ordering::SeqCst), 1);
        assert!(!cluster.is_alive(other));
    }

    #[test]
    fn test_listener_token_unsubscribes() {
        let cluster = StaticCluster::new(Uuid::new_v4());
        let listener = Arc::new(CountingListener(AtomicUsize::new(0)));
        let token = cluster.add_event_listener(listener.clone());
        cluster.remove_event_listener(token);

        cluster.fire_metrics_updated(cluster.local_node().id);
        assert_eq!(listener.0.load(Ordering::SeqCst), 0);
    }
}
