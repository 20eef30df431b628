//! Topology Store - nodes, connections and their validation rules
//!
//! Insertion order is preserved for both nodes and connections; delivery
//! polling and producer publishing iterate in that order.

use indexmap::IndexMap;
use tracing::debug;

use bsim_common::{
    generate_id, Connection, ConnectionId, ConnectionUpdate, Node, NodeId, NodeKind, NodeType,
    NodeUpdate, Position,
};

/// Why a connection request was refused
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionRejection {
    #[error("endpoint {0} does not exist")]
    MissingEndpoint(NodeId),

    #[error("{source_type} cannot bind to {target_type}")]
    InvalidEdge {
        source_type: NodeType,
        target_type: NodeType,
    },

    #[error("connection {0} already links these nodes")]
    Duplicate(ConnectionId),
}

/// Incoming and outgoing neighbours of a node
#[derive(Debug, Clone, Default)]
pub struct ConnectedNodes<'a> {
    pub incoming: Vec<&'a Node>,
    pub outgoing: Vec<&'a Node>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Topology {
    nodes: IndexMap<NodeId, Node>,
    connections: IndexMap<ConnectionId, Connection>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from already-identified nodes and connections, keeping their order
    pub fn from_parts(nodes: Vec<Node>, connections: Vec<Connection>) -> Self {
        Self {
            nodes: nodes.into_iter().map(|n| (n.id.clone(), n)).collect(),
            connections: connections.into_iter().map(|c| (c.id.clone(), c)).collect(),
        }
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    pub fn connection(&self, id: &str) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.values_mut()
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn contains_node(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn count_of(&self, node_type: NodeType) -> usize {
        self.nodes.values().filter(|n| n.node_type() == node_type).count()
    }

    /// Connections leaving `node_id`, in insertion order
    pub fn outbound<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Connection> + 'a {
        self.connections.values().filter(move |c| c.source_id == node_id)
    }

    /// Connections arriving at `node_id`, in insertion order
    pub fn inbound<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Connection> + 'a {
        self.connections.values().filter(move |c| c.target_id == node_id)
    }

    pub fn connected_nodes(&self, node_id: &str) -> ConnectedNodes<'_> {
        ConnectedNodes {
            incoming: self
                .inbound(node_id)
                .filter_map(|c| self.nodes.get(&c.source_id))
                .collect(),
            outgoing: self
                .outbound(node_id)
                .filter_map(|c| self.nodes.get(&c.target_id))
                .collect(),
        }
    }

    /// Total number of messages sitting in queues
    pub fn messages_in_queues(&self) -> u64 {
        self.nodes
            .values()
            .filter_map(Node::as_queue)
            .map(|q| q.messages.len() as u64)
            .sum()
    }

    /// Default display name for the next node of a type, e.g. "Queue 3"
    pub fn default_name(&self, node_type: NodeType) -> String {
        format!("{} {}", node_type.label(), self.count_of(node_type) + 1)
    }

    // ------------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------------

    /// Create a node with default settings for its type
    pub fn add_node(&mut self, node_type: NodeType, position: Position, name: Option<String>) -> NodeId {
        let name = name.unwrap_or_else(|| self.default_name(node_type));
        self.insert_node(Node::new(generate_id(), name, position, NodeKind::default_for(node_type)))
    }

    pub fn insert_node(&mut self, node: Node) -> NodeId {
        let id = node.id.clone();
        debug!(node_id = %id, node_type = %node.node_type(), "Node added");
        self.nodes.insert(id.clone(), node);
        id
    }

    /// Returns false when the node does not exist
    pub fn update_node(&mut self, id: &str, update: &NodeUpdate) -> bool {
        match self.nodes.get_mut(id) {
            Some(node) => {
                update.apply(node);
                true
            }
            None => false,
        }
    }

    /// Remove a node and every connection referencing it
    pub fn remove_node(&mut self, id: &str) -> Option<Node> {
        let node = self.nodes.shift_remove(id)?;
        let before = self.connections.len();
        self.connections
            .retain(|_, c| c.source_id != id && c.target_id != id);
        debug!(
            node_id = %id,
            connections_removed = before - self.connections.len(),
            "Node removed"
        );
        Some(node)
    }

    pub fn validate_connection(&self, source_id: &str, target_id: &str) -> Result<(), ConnectionRejection> {
        let source = self
            .nodes
            .get(source_id)
            .ok_or_else(|| ConnectionRejection::MissingEndpoint(source_id.to_string()))?;
        let target = self
            .nodes
            .get(target_id)
            .ok_or_else(|| ConnectionRejection::MissingEndpoint(target_id.to_string()))?;

        if !source.node_type().can_bind_to(target.node_type()) {
            return Err(ConnectionRejection::InvalidEdge {
                source_type: source.node_type(),
                target_type: target.node_type(),
            });
        }

        if let Some(existing) = self
            .connections
            .values()
            .find(|c| c.source_id == source_id && c.target_id == target_id)
        {
            return Err(ConnectionRejection::Duplicate(existing.id.clone()));
        }

        Ok(())
    }

    /// Validate and insert a connection
    pub fn add_connection(
        &mut self,
        source_id: &str,
        target_id: &str,
        routing_key: &str,
    ) -> Result<ConnectionId, ConnectionRejection> {
        self.validate_connection(source_id, target_id)?;
        let connection = Connection {
            id: generate_id(),
            source_id: source_id.to_string(),
            target_id: target_id.to_string(),
            routing_key: routing_key.to_string(),
            headers: None,
        };
        let id = connection.id.clone();
        self.connections.insert(id.clone(), connection);
        Ok(id)
    }

    /// Insert an already-built connection without validation (duplication, loading)
    pub fn insert_connection(&mut self, connection: Connection) -> ConnectionId {
        let id = connection.id.clone();
        self.connections.insert(id.clone(), connection);
        id
    }

    pub fn update_connection(&mut self, id: &str, update: &ConnectionUpdate) -> bool {
        match self.connections.get_mut(id) {
            Some(connection) => {
                update.apply(connection);
                true
            }
            None => false,
        }
    }

    pub fn remove_connection(&mut self, id: &str) -> Option<Connection> {
        self.connections.shift_remove(id)
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.connections.clear();
    }

    /// Owned copies in insertion order
    pub fn to_parts(&self) -> (Vec<Node>, Vec<Connection>) {
        (
            self.nodes.values().cloned().collect(),
            self.connections.values().cloned().collect(),
        )
    }
}
