//! Built-in example topologies
//!
//! Templates refer to their nodes by position in the node list. Loading one
//! assigns fresh ids so repeated loads never collide.

use tracing::warn;

use bsim_common::{
    generate_id, Connection, ConsumerNode, ExchangeNode, ExchangeType, Node, NodeKind, Position,
    QueueNode,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateConnection {
    pub source: usize,
    pub target: usize,
    pub routing_key: &'static str,
}

#[derive(Debug, Clone)]
pub struct Template {
    pub id: &'static str,
    pub title: &'static str,
    pub description: &'static str,
    /// Node ids are placeholders; only the list position matters
    pub nodes: Vec<Node>,
    pub connections: Vec<TemplateConnection>,
}

impl Template {
    /// Materialize with fresh ids. Connections with an out-of-range index are skipped.
    pub fn instantiate(&self) -> (Vec<Node>, Vec<Connection>) {
        let ids: Vec<String> = self.nodes.iter().map(|_| generate_id()).collect();

        let nodes = self
            .nodes
            .iter()
            .zip(&ids)
            .map(|(node, id)| Node {
                id: id.clone(),
                ..node.clone()
            })
            .collect();

        let connections = self
            .connections
            .iter()
            .filter_map(|c| match (ids.get(c.source), ids.get(c.target)) {
                (Some(source_id), Some(target_id)) => Some(Connection {
                    id: generate_id(),
                    source_id: source_id.clone(),
                    target_id: target_id.clone(),
                    routing_key: c.routing_key.to_string(),
                    headers: None,
                }),
                _ => {
                    warn!(
                        template = self.id,
                        source = c.source,
                        target = c.target,
                        "Template connection refers to a missing node"
                    );
                    None
                }
            })
            .collect();

        (nodes, connections)
    }
}

/// Every built-in template, in menu order
pub fn catalog() -> Vec<Template> {
    vec![simple_queue(), work_queues(), pub_sub(), routing(), topics()]
}

pub fn find(id: &str) -> Option<Template> {
    catalog().into_iter().find(|t| t.id == id)
}

// ============================================================================
// Node builders
// ============================================================================

fn node(name: &str, x: f64, y: f64, kind: NodeKind) -> Node {
    Node::new(String::new(), name, Position::new(x, y), kind)
}

fn producer(name: &str, x: f64, y: f64) -> Node {
    node(name, x, y, NodeKind::Producer)
}

fn exchange(name: &str, x: f64, y: f64, exchange_type: ExchangeType, durable: bool) -> Node {
    node(
        name,
        x,
        y,
        NodeKind::Exchange(ExchangeNode {
            exchange_type,
            durable,
            auto_delete: false,
        }),
    )
}

fn queue(name: &str, x: f64, y: f64, durable: bool, auto_delete: bool) -> Node {
    node(
        name,
        x,
        y,
        NodeKind::Queue(QueueNode {
            durable,
            auto_delete,
            ..QueueNode::default()
        }),
    )
}

fn consumer(name: &str, x: f64, y: f64, auto_ack: bool, prefetch_count: u32, processing_time: u64) -> Node {
    node(
        name,
        x,
        y,
        NodeKind::Consumer(ConsumerNode {
            auto_ack,
            prefetch_count,
            processing_time,
            ..ConsumerNode::default()
        }),
    )
}

fn link(source: usize, target: usize, routing_key: &'static str) -> TemplateConnection {
    TemplateConnection {
        source,
        target,
        routing_key,
    }
}

// ============================================================================
// Catalog
// ============================================================================

fn simple_queue() -> Template {
    Template {
        id: "simpleQueue",
        title: "Simple Queue",
        description: "One producer sends to a single queue read by one worker",
        nodes: vec![
            producer("Producer", 50.0, 150.0),
            exchange("default", 300.0, 150.0, ExchangeType::Direct, true),
            queue("task_queue", 550.0, 150.0, true, false),
            consumer("Worker", 800.0, 150.0, true, 1, 1000),
        ],
        connections: vec![link(0, 1, ""), link(1, 2, "task_queue"), link(2, 3, "")],
    }
}

fn work_queues() -> Template {
    Template {
        id: "workQueues",
        title: "Work Queues",
        description: "Two manual-ack workers share tasks from one queue",
        nodes: vec![
            producer("Task Producer", 50.0, 200.0),
            exchange("tasks", 300.0, 200.0, ExchangeType::Direct, true),
            queue("task_queue", 550.0, 200.0, true, false),
            consumer("Worker 1", 800.0, 100.0, false, 1, 2000),
            consumer("Worker 2", 800.0, 300.0, false, 1, 1500),
        ],
        connections: vec![
            link(0, 1, ""),
            link(1, 2, "task"),
            link(2, 3, ""),
            link(2, 4, ""),
        ],
    }
}

fn pub_sub() -> Template {
    Template {
        id: "pubSub",
        title: "Publish/Subscribe",
        description: "A fanout exchange copies every message to two subscriber queues",
        nodes: vec![
            producer("Publisher", 50.0, 200.0),
            exchange("logs", 300.0, 200.0, ExchangeType::Fanout, false),
            queue("queue_1", 550.0, 100.0, false, true),
            queue("queue_2", 550.0, 300.0, false, true),
            consumer("Subscriber 1", 800.0, 100.0, true, 1, 500),
            consumer("Subscriber 2", 800.0, 300.0, true, 1, 500),
        ],
        connections: vec![
            link(0, 1, ""),
            link(1, 2, ""),
            link(1, 3, ""),
            link(2, 4, ""),
            link(3, 5, ""),
        ],
    }
}

fn routing() -> Template {
    Template {
        id: "routing",
        title: "Routing",
        description: "A direct exchange splits error and info logs by routing key",
        nodes: vec![
            producer("Logger", 50.0, 200.0),
            exchange("direct_logs", 300.0, 200.0, ExchangeType::Direct, true),
            queue("error_queue", 550.0, 100.0, true, false),
            queue("info_queue", 550.0, 300.0, true, false),
            consumer("Error Handler", 800.0, 100.0, false, 1, 1000),
            consumer("Info Logger", 800.0, 300.0, true, 10, 200),
        ],
        connections: vec![
            link(0, 1, ""),
            link(1, 2, "error"),
            link(1, 3, "info"),
            link(2, 4, ""),
            link(3, 5, ""),
        ],
    }
}

fn topics() -> Template {
    Template {
        id: "topics",
        title: "Topics",
        description: "A topic exchange routes events by wildcard patterns",
        nodes: vec![
            producer("Event Emitter", 50.0, 200.0),
            exchange("topic_events", 300.0, 200.0, ExchangeType::Topic, true),
            queue("all_orders", 550.0, 50.0, true, false),
            queue("us_events", 550.0, 200.0, true, false),
            queue("critical", 550.0, 350.0, true, false),
            consumer("Order Service", 800.0, 50.0, true, 1, 500),
            consumer("US Service", 800.0, 200.0, true, 1, 500),
            consumer("Alert Service", 800.0, 350.0, false, 1, 100),
        ],
        connections: vec![
            link(0, 1, ""),
            link(1, 2, "*.order.*"),
            link(1, 3, "us.#"),
            link(1, 4, "#.critical"),
            link(2, 5, ""),
            link(3, 6, ""),
            link(4, 7, ""),
        ],
    }
}
