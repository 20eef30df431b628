use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

pub type NodeId = String;
pub type ConnectionId = String;
pub type MessageId = String;

/// Header maps are ordered so snapshots and exports serialize identically.
pub type Headers = BTreeMap<String, String>;

/// Version stamped on exported diagrams
pub const DIAGRAM_VERSION: &str = "1.0";

/// Generate a fresh unique identifier for nodes, connections and messages
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ============================================================================
// Topology Types
// ============================================================================

/// Canvas position. Carried for the UI, never read by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn offset(&self, dx: f64, dy: f64) -> Self {
        Self { x: self.x + dx, y: self.y + dy }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Producer,
    Exchange,
    Queue,
    Consumer,
}

impl NodeType {
    /// Whether a binding from `self` to `target` is part of the allowed edge set
    pub fn can_bind_to(self, target: NodeType) -> bool {
        matches!(
            (self, target),
            (NodeType::Producer, NodeType::Exchange)
                | (NodeType::Exchange, NodeType::Queue)
                | (NodeType::Queue, NodeType::Consumer)
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            NodeType::Producer => "Producer",
            NodeType::Exchange => "Exchange",
            NodeType::Queue => "Queue",
            NodeType::Consumer => "Consumer",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeNode {
    #[serde(default)]
    pub exchange_type: ExchangeType,
    /// Metadata only, not enforced by the simulation
    #[serde(default = "default_true")]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
}

impl Default for ExchangeNode {
    fn default() -> Self {
        Self {
            exchange_type: ExchangeType::Direct,
            durable: true,
            auto_delete: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueNode {
    #[serde(default = "default_true")]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
    /// Declared but not enforced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u32>,
    /// Declared but not enforced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_ttl: Option<u64>,
    /// FIFO: head is the next message delivered to a consumer
    #[serde(default)]
    pub messages: VecDeque<Message>,
}

impl Default for QueueNode {
    fn default() -> Self {
        Self {
            durable: true,
            auto_delete: false,
            max_length: None,
            message_ttl: None,
            messages: VecDeque::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerNode {
    #[serde(default = "default_true")]
    pub auto_ack: bool,
    /// Tracked for display; the engine never caps deliveries by it
    #[serde(default = "default_prefetch")]
    pub prefetch_count: u32,
    /// Milliseconds spent processing each delivered message
    #[serde(default = "default_processing_time")]
    pub processing_time: u64,
    #[serde(default)]
    pub consumed_count: u64,
    #[serde(default)]
    pub is_processing: bool,
    /// Oldest unacknowledged delivery (manual-ack only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_message: Option<Message>,
    #[serde(default)]
    pub unacked_count: u32,
}

impl ConsumerNode {
    /// Reset the per-run fields while keeping the declared settings
    pub fn reset_runtime(&mut self) {
        self.is_processing = false;
        self.current_message = None;
        self.unacked_count = 0;
    }
}

impl Default for ConsumerNode {
    fn default() -> Self {
        Self {
            auto_ack: true,
            prefetch_count: default_prefetch(),
            processing_time: default_processing_time(),
            consumed_count: 0,
            is_processing: false,
            current_message: None,
            unacked_count: 0,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_prefetch() -> u32 {
    1
}

fn default_processing_time() -> u64 {
    1000
}

/// Variant-specific part of a node, tagged by `type` on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NodeKind {
    Producer,
    Exchange(ExchangeNode),
    Queue(QueueNode),
    Consumer(ConsumerNode),
}

impl NodeKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeKind::Producer => NodeType::Producer,
            NodeKind::Exchange(_) => NodeType::Exchange,
            NodeKind::Queue(_) => NodeType::Queue,
            NodeKind::Consumer(_) => NodeType::Consumer,
        }
    }

    /// Default settings for a freshly created node of the given type
    pub fn default_for(node_type: NodeType) -> Self {
        match node_type {
            NodeType::Producer => NodeKind::Producer,
            NodeType::Exchange => NodeKind::Exchange(ExchangeNode::default()),
            NodeType::Queue => NodeKind::Queue(QueueNode::default()),
            NodeType::Consumer => NodeKind::Consumer(ConsumerNode::default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    #[serde(default)]
    pub position: Position,
    #[serde(flatten)]
    pub kind: NodeKind,
}

impl Node {
    pub fn new(id: NodeId, name: impl Into<String>, position: Position, kind: NodeKind) -> Self {
        Self {
            id,
            name: name.into(),
            position,
            kind,
        }
    }

    pub fn node_type(&self) -> NodeType {
        self.kind.node_type()
    }

    pub fn as_exchange(&self) -> Option<&ExchangeNode> {
        match &self.kind {
            NodeKind::Exchange(exchange) => Some(exchange),
            _ => None,
        }
    }

    pub fn as_queue(&self) -> Option<&QueueNode> {
        match &self.kind {
            NodeKind::Queue(queue) => Some(queue),
            _ => None,
        }
    }

    pub fn as_queue_mut(&mut self) -> Option<&mut QueueNode> {
        match &mut self.kind {
            NodeKind::Queue(queue) => Some(queue),
            _ => None,
        }
    }

    pub fn as_consumer(&self) -> Option<&ConsumerNode> {
        match &self.kind {
            NodeKind::Consumer(consumer) => Some(consumer),
            _ => None,
        }
    }

    pub fn as_consumer_mut(&mut self) -> Option<&mut ConsumerNode> {
        match &mut self.kind {
            NodeKind::Consumer(consumer) => Some(consumer),
            _ => None,
        }
    }
}

/// A binding between two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: ConnectionId,
    pub source_id: NodeId,
    pub target_id: NodeId,
    /// Exact key for direct exchanges, dot-delimited pattern for topic exchanges
    #[serde(default)]
    pub routing_key: String,
    /// Only read when the source is a headers exchange
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
}

// ============================================================================
// Partial Updates
// ============================================================================

/// Partial node update. Fields that do not apply to the node's variant are ignored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeUpdate {
    pub name: Option<String>,
    pub position: Option<Position>,
    pub exchange_type: Option<ExchangeType>,
    pub durable: Option<bool>,
    pub auto_delete: Option<bool>,
    pub max_length: Option<Option<u32>>,
    pub message_ttl: Option<Option<u64>>,
    pub auto_ack: Option<bool>,
    pub prefetch_count: Option<u32>,
    pub processing_time: Option<u64>,
}

impl NodeUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_exchange_type(mut self, exchange_type: ExchangeType) -> Self {
        self.exchange_type = Some(exchange_type);
        self
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = Some(durable);
        self
    }

    pub fn with_max_length(mut self, max_length: Option<u32>) -> Self {
        self.max_length = Some(max_length);
        self
    }

    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = Some(auto_ack);
        self
    }

    pub fn with_prefetch_count(mut self, prefetch_count: u32) -> Self {
        self.prefetch_count = Some(prefetch_count);
        self
    }

    pub fn with_processing_time(mut self, processing_time: u64) -> Self {
        self.processing_time = Some(processing_time);
        self
    }

    /// Apply the update in place
    pub fn apply(&self, node: &mut Node) {
        if let Some(name) = &self.name {
            node.name = name.clone();
        }
        if let Some(position) = self.position {
            node.position = position;
        }
        match &mut node.kind {
            NodeKind::Producer => {}
            NodeKind::Exchange(exchange) => {
                if let Some(exchange_type) = self.exchange_type {
                    exchange.exchange_type = exchange_type;
                }
                if let Some(durable) = self.durable {
                    exchange.durable = durable;
                }
                if let Some(auto_delete) = self.auto_delete {
                    exchange.auto_delete = auto_delete;
                }
            }
            NodeKind::Queue(queue) => {
                if let Some(durable) = self.durable {
                    queue.durable = durable;
                }
                if let Some(auto_delete) = self.auto_delete {
                    queue.auto_delete = auto_delete;
                }
                if let Some(max_length) = self.max_length {
                    queue.max_length = max_length;
                }
                if let Some(message_ttl) = self.message_ttl {
                    queue.message_ttl = message_ttl;
                }
            }
            NodeKind::Consumer(consumer) => {
                if let Some(auto_ack) = self.auto_ack {
                    consumer.auto_ack = auto_ack;
                }
                if let Some(prefetch_count) = self.prefetch_count {
                    consumer.prefetch_count = prefetch_count;
                }
                if let Some(processing_time) = self.processing_time {
                    consumer.processing_time = processing_time;
                }
            }
        }
    }
}

/// Partial connection update
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionUpdate {
    pub routing_key: Option<String>,
    pub headers: Option<Option<Headers>>,
}

impl ConnectionUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn with_headers(mut self, headers: Option<Headers>) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn apply(&self, connection: &mut Connection) {
        if let Some(routing_key) = &self.routing_key {
            connection.routing_key = routing_key.clone();
        }
        if let Some(headers) = &self.headers {
            connection.headers = headers.clone();
        }
    }
}

// ============================================================================
// Message Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Created,
    Sent,
    Routed,
    Queued,
    Consumed,
    /// Terminal: the message never reached a queue because its exchange vanished
    Rejected,
    /// Terminal: no binding matched, or the producer had no outbound binding
    Unroutable,
}

impl MessageStatus {
    pub fn is_terminal_failure(self) -> bool {
        matches!(self, MessageStatus::Rejected | MessageStatus::Unroutable)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Created => "created",
            MessageStatus::Sent => "sent",
            MessageStatus::Routed => "routed",
            MessageStatus::Queued => "queued",
            MessageStatus::Consumed => "consumed",
            MessageStatus::Rejected => "rejected",
            MessageStatus::Unroutable => "unroutable",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message published by a producer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub content: String,
    #[serde(default)]
    pub routing_key: String,
    #[serde(default)]
    pub headers: Headers,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub status: MessageStatus,
    /// Node ids visited, append-only
    #[serde(default)]
    pub path: Vec<NodeId>,
    /// Delivered to a manual-ack consumer but not yet acknowledged
    #[serde(default, skip_serializing_if = "is_false")]
    pub in_flight: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_id: Option<NodeId>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Transit record for a message moving along one connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TravelingMessage {
    pub id: String,
    pub message: Message,
    pub from_id: NodeId,
    pub to_id: NodeId,
    pub connection_id: ConnectionId,
    /// 0..100
    pub progress: f64,
}

impl TravelingMessage {
    pub fn depart(message: Message, from_id: &str, to_id: &str, connection_id: &str) -> Self {
        Self {
            id: generate_id(),
            message,
            from_id: from_id.to_string(),
            to_id: to_id.to_string(),
            connection_id: connection_id.to_string(),
            progress: 0.0,
        }
    }
}

// ============================================================================
// Statistics & Export Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulatorStats {
    pub total_sent: u64,
    pub total_routed: u64,
    pub total_consumed: u64,
    pub total_rejected: u64,
    pub messages_in_queues: u64,
}

/// JSON envelope used by export/import
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagramExport {
    pub version: String,
    pub nodes: Vec<Node>,
    pub connections: Vec<Connection>,
    pub timestamp: i64,
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("Invalid diagram: {0}")]
    InvalidDiagram(String),

    #[error("Unknown template: {0}")]
    UnknownTemplate(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SimError>;
