//! Simulator - single owner of all engine state
//!
//! Ties the pieces together:
//! - Topology edits, each recorded as one undo step
//! - Publishing, routing and arrival processing
//! - Consumer polling, processing timers and manual acknowledgements
//! - Selection and the connect gesture
//! - Diagram export/import and built-in templates
//!
//! Every operation runs to completion on `&mut self`; time only moves through
//! `advance`, `poll_consumers` and `run_for`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use bsim_common::{
    generate_id, Connection, ConnectionId, ConnectionUpdate, DiagramExport, ExchangeType, Headers,
    Message, MessageId, MessageStatus, Node, NodeId, NodeKind, NodeType, NodeUpdate, Position,
    Result, SimError, SimulatorStats, TravelingMessage, DIAGRAM_VERSION,
};
use bsim_config::SimulatorConfig;

use crate::clock::{Clock, SystemClock};
use crate::delivery::{self, InFlightTracker};
use crate::history::History;
use crate::lifecycle::MessageLog;
use crate::routing;
use crate::selection::Selection;
use crate::templates;
use crate::timers::{TimerQueue, TimerTask};
use crate::topology::{ConnectedNodes, Topology};
use crate::transit::TransitScheduler;

const DUPLICATE_OFFSET: f64 = 50.0;

pub struct Simulator {
    config: SimulatorConfig,
    clock: Arc<dyn Clock>,

    topology: Topology,
    history: History,
    selection: Selection,

    log: MessageLog,
    stats: SimulatorStats,
    transit: TransitScheduler,
    timers: TimerQueue,
    in_flight: InFlightTracker,

    /// Virtual time since the engine was created
    now: Duration,
    /// Next consumer poll for `run_for`
    next_poll_at: Duration,
}

impl Simulator {
    pub fn new(config: SimulatorConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: SimulatorConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            history: History::new(config.history_capacity),
            transit: TransitScheduler::new(config.travel_speed),
            next_poll_at: config.consumer_poll_interval(),
            topology: Topology::new(),
            selection: Selection::default(),
            log: MessageLog::new(),
            stats: SimulatorStats::default(),
            timers: TimerQueue::new(),
            in_flight: InFlightTracker::new(),
            now: Duration::ZERO,
            config,
            clock,
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.topology.node(id)
    }

    pub fn connection(&self, id: &str) -> Option<&Connection> {
        self.topology.connection(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.topology.nodes()
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.topology.connections()
    }

    pub fn connected_nodes(&self, id: &str) -> ConnectedNodes<'_> {
        self.topology.connected_nodes(id)
    }

    /// Every published message in publish order, at its furthest status
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.log.messages()
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.log.get(id)
    }

    pub fn traveling_messages(&self) -> &[TravelingMessage] {
        self.transit.in_transit()
    }

    pub fn stats(&self) -> SimulatorStats {
        self.stats
    }

    /// Statistics recomputed from scratch; always equal to `stats()`
    pub fn recomputed_stats(&self) -> SimulatorStats {
        self.log.derive_stats(self.topology.messages_in_queues())
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn unacked_count(&self, consumer_id: &str) -> usize {
        self.in_flight.pending(consumer_id)
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    /// Nothing traveling, no pending timers and every queue empty
    pub fn is_idle(&self) -> bool {
        self.transit.is_empty() && self.timers.is_empty() && self.topology.messages_in_queues() == 0
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    // ========================================================================
    // Topology edits
    // ========================================================================

    pub fn add_node(&mut self, node_type: NodeType, position: Position) -> NodeId {
        self.add_named_node(node_type, position, None)
    }

    pub fn add_named_node(&mut self, node_type: NodeType, position: Position, name: Option<String>) -> NodeId {
        self.save_to_history();
        self.topology.add_node(node_type, position, name)
    }

    pub fn add_producer(&mut self, position: Position, name: Option<String>) -> NodeId {
        self.add_named_node(NodeType::Producer, position, name)
    }

    pub fn add_exchange(&mut self, position: Position, name: Option<String>) -> NodeId {
        self.add_named_node(NodeType::Exchange, position, name)
    }

    pub fn add_queue(&mut self, position: Position, name: Option<String>) -> NodeId {
        self.add_named_node(NodeType::Queue, position, name)
    }

    pub fn add_consumer(&mut self, position: Position, name: Option<String>) -> NodeId {
        self.add_named_node(NodeType::Consumer, position, name)
    }

    /// Apply a partial update. Returns false when the node does not exist.
    pub fn update_node(&mut self, id: &str, update: &NodeUpdate) -> bool {
        if !self.topology.contains_node(id) {
            return false;
        }
        self.save_to_history();
        self.topology.update_node(id, update)
    }

    /// Delete a node and its connections. Messages held by a deleted queue are discarded.
    pub fn delete_node(&mut self, id: &str) -> bool {
        if !self.topology.contains_node(id) {
            return false;
        }
        self.save_to_history();
        self.remove_node_unrecorded(id);
        self.refresh_queue_depth();
        true
    }

    pub fn delete_selected_nodes(&mut self) -> usize {
        let selected: Vec<NodeId> = self
            .selection
            .selected_node_ids
            .iter()
            .filter(|id| self.topology.contains_node(id))
            .cloned()
            .collect();
        if selected.is_empty() {
            return 0;
        }

        self.save_to_history();
        for id in &selected {
            self.remove_node_unrecorded(id);
        }
        self.refresh_queue_depth();
        selected.len()
    }

    /// Copy a node under a new id, offset on the canvas, and select the copy
    pub fn duplicate_node(&mut self, id: &str) -> Option<NodeId> {
        let copy = duplicate_of(self.topology.node(id)?);
        self.save_to_history();
        let new_id = self.topology.insert_node(copy);
        self.selection.select_node(Some(new_id.clone()));
        Some(new_id)
    }

    /// Copy every selected node plus the connections running between them.
    /// The selection moves to the copies.
    pub fn duplicate_selected_nodes(&mut self) -> Vec<NodeId> {
        let copies: Vec<(NodeId, Node)> = self
            .selection
            .selected_node_ids
            .iter()
            .filter_map(|id| self.topology.node(id).map(|node| (id.clone(), duplicate_of(node))))
            .collect();
        if copies.is_empty() {
            return Vec::new();
        }

        let links: Vec<Connection> = {
            let id_map: HashMap<&str, &str> = copies
                .iter()
                .map(|(original, copy)| (original.as_str(), copy.id.as_str()))
                .collect();
            self.topology
                .connections()
                .filter_map(|c| {
                    Some(Connection {
                        id: generate_id(),
                        source_id: id_map.get(c.source_id.as_str())?.to_string(),
                        target_id: id_map.get(c.target_id.as_str())?.to_string(),
                        routing_key: c.routing_key.clone(),
                        headers: c.headers.clone(),
                    })
                })
                .collect()
        };

        self.save_to_history();
        let new_ids: Vec<NodeId> = copies
            .into_iter()
            .map(|(_, copy)| self.topology.insert_node(copy))
            .collect();
        for link in links {
            self.topology.insert_connection(link);
        }
        self.selection.select_multiple(new_ids.clone());
        new_ids
    }

    /// Reposition a node. Not recorded in history.
    pub fn move_node(&mut self, id: &str, position: Position) -> bool {
        match self.topology.node_mut(id) {
            Some(node) => {
                node.position = position;
                true
            }
            None => false,
        }
    }

    /// Shift every selected node. Not recorded in history.
    pub fn move_selected_nodes(&mut self, dx: f64, dy: f64) {
        for id in &self.selection.selected_node_ids {
            if let Some(node) = self.topology.node_mut(id) {
                node.position = node.position.offset(dx, dy);
            }
        }
    }

    /// Bind `source_id` to `target_id`. Invalid requests return `None` and change nothing.
    pub fn add_connection(&mut self, source_id: &str, target_id: &str, routing_key: &str) -> Option<ConnectionId> {
        if let Err(reason) = self.topology.validate_connection(source_id, target_id) {
            debug!(
                source_id = %source_id,
                target_id = %target_id,
                reason = %reason,
                "Connection rejected"
            );
            return None;
        }
        self.save_to_history();
        self.topology.add_connection(source_id, target_id, routing_key).ok()
    }

    pub fn update_connection(&mut self, id: &str, update: &ConnectionUpdate) -> bool {
        if self.topology.connection(id).is_none() {
            return false;
        }
        self.save_to_history();
        self.topology.update_connection(id, update)
    }

    pub fn delete_connection(&mut self, id: &str) -> bool {
        if self.topology.connection(id).is_none() {
            return false;
        }
        self.save_to_history();
        self.topology.remove_connection(id);
        self.selection.forget_connection(id);
        true
    }

    /// Remove everything, including messages and history
    pub fn clear_canvas(&mut self) {
        self.topology.clear();
        self.reset_runtime();
        info!("Canvas cleared");
    }

    fn remove_node_unrecorded(&mut self, id: &str) {
        self.topology.remove_node(id);
        self.selection.forget_node(id);
        if let Some(connection_id) = self.selection.selected_connection_id.clone() {
            if self.topology.connection(&connection_id).is_none() {
                self.selection.forget_connection(&connection_id);
            }
        }
    }

    // ========================================================================
    // Selection
    // ========================================================================

    pub fn select_node(&mut self, id: Option<&str>) {
        self.selection.select_node(id.map(str::to_string));
    }

    pub fn select_connection(&mut self, id: Option<&str>) {
        self.selection.select_connection(id.map(str::to_string));
    }

    pub fn select_multiple_nodes(&mut self, ids: Vec<NodeId>) {
        self.selection.select_multiple(ids);
    }

    /// Toggle a node in the multi-selection
    pub fn add_to_selection(&mut self, id: &str) {
        self.selection.toggle(id);
    }

    pub fn select_all(&mut self) {
        let ids = self.topology.nodes().map(|n| n.id.clone()).collect();
        self.selection.select_multiple(ids);
    }

    pub fn clear_selection(&mut self) {
        self.selection.clear_selection();
    }

    pub fn start_connecting(&mut self, from_id: &str) {
        self.selection.start_connecting(from_id.to_string());
    }

    /// Complete the connect gesture with an empty routing key
    pub fn finish_connecting(&mut self, to_id: &str) -> bool {
        let Some(from_id) = self.selection.take_connecting_source() else {
            return false;
        };
        if from_id == to_id {
            return false;
        }
        self.add_connection(&from_id, to_id, "").is_some()
    }

    pub fn cancel_connecting(&mut self) {
        self.selection.cancel_connecting();
    }

    // ========================================================================
    // History
    // ========================================================================

    pub fn save_to_history(&mut self) {
        self.history.save(&self.topology);
    }

    pub fn undo(&mut self) -> bool {
        match self.history.undo(&self.topology) {
            Some(snapshot) => {
                self.restore(snapshot);
                info!(depth = self.history.undo_depth(), "Undo");
                true
            }
            None => false,
        }
    }

    pub fn redo(&mut self) -> bool {
        match self.history.redo(&self.topology) {
            Some(snapshot) => {
                self.restore(snapshot);
                info!(depth = self.history.undo_depth(), "Redo");
                true
            }
            None => false,
        }
    }

    /// Swap in a snapshot. Runtime state (queued messages, consumer activity)
    /// is not undoable: nodes that survive keep their live runtime state, and
    /// revived nodes pick up whatever the engine still tracks for them.
    fn restore(&mut self, mut snapshot: Topology) {
        for node in snapshot.nodes_mut() {
            let id = node.id.clone();
            let live = self
                .topology
                .node(&id)
                .filter(|live| live.node_type() == node.node_type())
                .map(|live| &live.kind);

            match (&mut node.kind, live) {
                (NodeKind::Queue(queue), Some(NodeKind::Queue(live))) => {
                    queue.messages = live.messages.clone();
                }
                (NodeKind::Queue(queue), _) => queue.messages.clear(),
                (NodeKind::Consumer(consumer), Some(NodeKind::Consumer(live))) => {
                    consumer.is_processing = live.is_processing;
                    consumer.consumed_count = live.consumed_count;
                    consumer.current_message = live.current_message.clone();
                    consumer.unacked_count = live.unacked_count;
                }
                (NodeKind::Consumer(consumer), _) => {
                    consumer.is_processing = self.transit.in_transit().iter().any(|t| t.to_id == id)
                        || self.timers.has_finish_for(&id);
                    consumer.current_message = self.in_flight.oldest(&id).cloned();
                    consumer.unacked_count = self.in_flight.pending(&id) as u32;
                }
                _ => {}
            }
        }

        self.topology = snapshot;
        self.selection.reset();
        self.refresh_queue_depth();
    }

    // ========================================================================
    // Messaging
    // ========================================================================

    /// Publish from a producer over its first outbound binding. Returns the
    /// message id, or `None` when `producer_id` is not a producer.
    pub fn send_message(
        &mut self,
        producer_id: &str,
        content: impl Into<String>,
        routing_key: impl Into<String>,
        headers: Headers,
    ) -> Option<MessageId> {
        match self.topology.node(producer_id) {
            Some(node) if node.node_type() == NodeType::Producer => {}
            _ => {
                warn!(producer_id = %producer_id, "Cannot publish: not a producer");
                return None;
            }
        }

        let message = Message {
            id: generate_id(),
            content: content.into(),
            routing_key: routing_key.into(),
            headers,
            timestamp: self.clock.now_ms(),
            status: MessageStatus::Created,
            path: vec![producer_id.to_string()],
            in_flight: false,
            consumer_id: None,
        };
        let message_id = message.id.clone();
        let binding = self
            .topology
            .outbound(producer_id)
            .find(|c| {
                self.topology
                    .node(&c.target_id)
                    .is_some_and(|n| n.node_type() == NodeType::Exchange)
            })
            .map(|c| (c.id.clone(), c.target_id.clone()));

        self.log.record(message.clone());
        self.stats.total_sent += 1;

        match binding {
            Some((connection_id, exchange_id)) => {
                self.log.advance(&message_id, MessageStatus::Sent);
                let sent = Message {
                    status: MessageStatus::Sent,
                    ..message
                };
                debug!(
                    message_id = %message_id,
                    producer_id = %producer_id,
                    exchange_id = %exchange_id,
                    "Message published"
                );
                self.transit
                    .dispatch(TravelingMessage::depart(sent, producer_id, &exchange_id, &connection_id));
            }
            None => {
                if self.log.advance(&message_id, MessageStatus::Unroutable) {
                    self.stats.total_rejected += 1;
                }
                warn!(
                    message_id = %message_id,
                    producer_id = %producer_id,
                    "Producer has no outbound binding; message unroutable"
                );
            }
        }

        Some(message_id)
    }

    /// Acknowledge the oldest unacknowledged delivery of a manual-ack consumer
    pub fn acknowledge_message(&mut self, consumer_id: &str) -> bool {
        let Some(message) = self.in_flight.acknowledge(consumer_id) else {
            debug!(consumer_id = %consumer_id, "Nothing to acknowledge");
            return false;
        };

        if !self.in_flight.holds(&message.id) {
            self.log.set_in_flight(&message.id, None, false);
        }

        let next = self.in_flight.oldest(consumer_id).cloned();
        let pending = self.in_flight.pending(consumer_id) as u32;
        if let Some(consumer) = self.topology.node_mut(consumer_id).and_then(Node::as_consumer_mut) {
            consumer.current_message = next;
            consumer.unacked_count = pending;
        }

        info!(
            consumer_id = %consumer_id,
            message_id = %message.id,
            remaining = pending,
            "Message acknowledged"
        );
        true
    }

    // ========================================================================
    // Time
    // ========================================================================

    /// Move virtual time forward: transit progresses and timers fire in due order
    pub fn advance(&mut self, elapsed: Duration) {
        let target = self.now + elapsed;

        while let Some(due) = self.timers.next_due().filter(|due| *due <= target) {
            self.step_transit_to(due);
            self.fire_due_timers();
        }

        self.step_transit_to(target);
        self.fire_due_timers();
    }

    /// One consumer poll pass. Returns the number of deliveries started.
    pub fn poll_consumers(&mut self) -> usize {
        let deliveries = delivery::poll(&mut self.topology);
        let count = deliveries.len();

        for delivery in deliveries {
            self.log.advance(&delivery.message.id, MessageStatus::Consumed);
            self.transit.dispatch(TravelingMessage::depart(
                delivery.message,
                &delivery.queue_id,
                &delivery.consumer_id,
                &delivery.connection_id,
            ));
        }

        if count > 0 {
            self.refresh_queue_depth();
        }
        count
    }

    /// Deterministic driver: advance in `step` increments for `total`,
    /// polling consumers every configured poll interval
    pub fn run_for(&mut self, total: Duration, step: Duration) {
        let step = if step.is_zero() {
            self.config.tick_interval()
        } else {
            step
        };
        let poll_interval = self.config.consumer_poll_interval();
        let end = self.now + total;
        // time moved by `advance` or the driver does not owe missed polls
        self.next_poll_at = self.next_poll_at.max(self.now);

        while self.now < end {
            let next = (self.now + step).min(end);

            while self.next_poll_at <= next {
                let poll_at = self.next_poll_at;
                if poll_at > self.now {
                    self.advance(poll_at - self.now);
                }
                self.poll_consumers();
                self.next_poll_at += poll_interval;
            }

            if next > self.now {
                self.advance(next - self.now);
            }
        }
    }

    fn step_transit_to(&mut self, at: Duration) {
        if at <= self.now {
            return;
        }
        let elapsed = at - self.now;
        self.now = at;
        for arrival in self.transit.advance(elapsed) {
            self.process_arrival(arrival);
        }
    }

    fn fire_due_timers(&mut self) {
        while let Some(task) = self.timers.pop_due(self.now) {
            match task {
                TimerTask::FinishProcessing {
                    consumer_id,
                    message_id,
                } => self.complete_processing(&consumer_id, &message_id),
                TimerTask::AutoAcknowledge { consumer_id } => {
                    self.acknowledge_message(&consumer_id);
                }
            }
        }
    }

    // ========================================================================
    // Arrival processing
    // ========================================================================

    fn process_arrival(&mut self, traveling: TravelingMessage) {
        let target = self
            .topology
            .node(&traveling.to_id)
            .map(|node| (node.node_type(), node.as_exchange().map(|e| e.exchange_type)));

        match target {
            Some((NodeType::Exchange, Some(exchange_type))) => self.arrive_at_exchange(traveling, exchange_type),
            Some((NodeType::Queue, _)) => self.arrive_at_queue(traveling),
            Some((NodeType::Consumer, _)) => self.arrive_at_consumer(traveling),
            Some(_) => warn!(
                node_id = %traveling.to_id,
                message_id = %traveling.message.id,
                "Message arrived at a node that cannot receive it"
            ),
            None => self.arrive_at_missing(traveling),
        }
    }

    fn arrive_at_exchange(&mut self, traveling: TravelingMessage, exchange_type: ExchangeType) {
        let exchange_id = traveling.to_id.clone();
        let message_id = traveling.message.id.clone();

        let routes = {
            let topology = &self.topology;
            let bindings = topology.outbound(&exchange_id).filter(|c| {
                topology
                    .node(&c.target_id)
                    .is_some_and(|n| n.node_type() == NodeType::Queue)
            });
            routing::route(&traveling.message, exchange_type, bindings)
        };

        if routes.is_empty() {
            if self.log.advance(&message_id, MessageStatus::Unroutable) {
                self.stats.total_rejected += 1;
            }
            warn!(
                exchange_id = %exchange_id,
                message_id = %message_id,
                routing_key = %traveling.message.routing_key,
                "No binding matched; message unroutable"
            );
            return;
        }

        let copies = routes.len() as u64;
        self.log.advance(&message_id, MessageStatus::Routed);
        self.log.note_routed(&message_id, copies);
        self.stats.total_routed += copies;
        debug!(
            exchange_id = %exchange_id,
            message_id = %message_id,
            copies,
            "Message routed"
        );

        for route in routes {
            let mut copy = traveling.message.clone();
            copy.status = MessageStatus::Routed;
            copy.path.push(exchange_id.clone());
            self.transit.dispatch(TravelingMessage::depart(
                copy,
                &exchange_id,
                &route.queue_id,
                &route.connection_id,
            ));
        }
    }

    fn arrive_at_queue(&mut self, traveling: TravelingMessage) {
        let queue_id = traveling.to_id;
        let mut message = traveling.message;
        message.status = MessageStatus::Queued;
        message.path.push(queue_id.clone());
        self.log.advance(&message.id, MessageStatus::Queued);

        if let Some(queue) = self.topology.node_mut(&queue_id).and_then(Node::as_queue_mut) {
            debug!(queue_id = %queue_id, message_id = %message.id, "Message queued");
            queue.messages.push_back(message);
        }
        self.refresh_queue_depth();
    }

    fn arrive_at_consumer(&mut self, traveling: TravelingMessage) {
        let consumer_id = traveling.to_id;
        let message_id = traveling.message.id.clone();

        let Some(consumer) = self.topology.node_mut(&consumer_id).and_then(Node::as_consumer_mut) else {
            return;
        };
        let manual_ack = !consumer.auto_ack;
        let processing = delivery::begin_processing(consumer, &consumer_id, traveling.message, &mut self.in_flight);

        if manual_ack {
            self.log.set_in_flight(&message_id, Some(&consumer_id), true);
        }
        self.timers.schedule_at(
            self.now + processing,
            TimerTask::FinishProcessing {
                consumer_id,
                message_id,
            },
        );
    }

    /// The destination was deleted while the message was traveling
    fn arrive_at_missing(&mut self, traveling: TravelingMessage) {
        let message_id = traveling.message.id;
        if traveling.message.status == MessageStatus::Sent
            && self.log.advance(&message_id, MessageStatus::Rejected)
        {
            self.stats.total_rejected += 1;
            warn!(
                exchange_id = %traveling.to_id,
                message_id = %message_id,
                "Exchange removed while message in transit; message rejected"
            );
        } else {
            warn!(
                node_id = %traveling.to_id,
                message_id = %message_id,
                "Destination removed while message in transit; copy dropped"
            );
        }
    }

    fn complete_processing(&mut self, consumer_id: &str, message_id: &str) {
        let Some(consumer) = self.topology.node_mut(consumer_id).and_then(Node::as_consumer_mut) else {
            debug!(consumer_id = %consumer_id, "Consumer removed before processing finished");
            return;
        };
        delivery::finish_processing(consumer);
        self.stats.total_consumed += 1;
        self.log.note_consumed(message_id);
        debug!(consumer_id = %consumer_id, message_id = %message_id, "Processing finished");

        if let Some(delay) = self.config.manual_ack_auto_ack_delay() {
            if self.in_flight.holds(&message_id.to_string()) {
                self.timers.schedule_at(
                    self.now + delay,
                    TimerTask::AutoAcknowledge {
                        consumer_id: consumer_id.to_string(),
                    },
                );
            }
        }
    }

    fn refresh_queue_depth(&mut self) {
        self.stats.messages_in_queues = self.topology.messages_in_queues();
    }

    // ========================================================================
    // Diagrams and templates
    // ========================================================================

    /// Replace the topology and reset messages, stats, selection and history
    pub fn load_diagram(&mut self, nodes: Vec<Node>, connections: Vec<Connection>) {
        let mut topology = Topology::from_parts(nodes, connections);
        for node in topology.nodes_mut() {
            match &mut node.kind {
                NodeKind::Queue(queue) => queue.messages.clear(),
                NodeKind::Consumer(consumer) => consumer.reset_runtime(),
                _ => {}
            }
        }
        self.topology = topology;
        self.reset_runtime();
        info!(
            nodes = self.topology.node_count(),
            connections = self.topology.connection_count(),
            "Diagram loaded"
        );
    }

    pub fn load_template(&mut self, template_id: &str) -> Result<()> {
        let template =
            templates::find(template_id).ok_or_else(|| SimError::UnknownTemplate(template_id.to_string()))?;
        let (nodes, connections) = template.instantiate();
        info!(template = template.id, "Loading template");
        self.load_diagram(nodes, connections);
        Ok(())
    }

    pub fn export_diagram(&self) -> DiagramExport {
        let (nodes, connections) = self.topology.to_parts();
        DiagramExport {
            version: DIAGRAM_VERSION.to_string(),
            nodes,
            connections,
            timestamp: self.clock.now_ms(),
        }
    }

    pub fn export_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.export_diagram())?)
    }

    /// Load a diagram from JSON. On any error the engine is left untouched.
    pub fn import_json(&mut self, text: &str) -> Result<()> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        for field in ["nodes", "connections"] {
            if !value.get(field).is_some_and(serde_json::Value::is_array) {
                return Err(SimError::InvalidDiagram(format!("missing `{}` array", field)));
            }
        }

        let nodes: Vec<Node> = serde_json::from_value(value["nodes"].clone())?;
        let connections: Vec<Connection> = serde_json::from_value(value["connections"].clone())?;
        validate_diagram(&nodes, &connections)?;

        self.load_diagram(nodes, connections);
        Ok(())
    }

    fn reset_runtime(&mut self) {
        self.log.clear();
        self.stats = SimulatorStats::default();
        self.transit.clear();
        self.timers.clear();
        self.in_flight.clear();
        self.selection.reset();
        self.history.clear();
        self.refresh_queue_depth();
    }
}

fn duplicate_of(node: &Node) -> Node {
    let mut copy = Node {
        id: generate_id(),
        name: format!("{} (copy)", node.name),
        position: node.position.offset(DUPLICATE_OFFSET, DUPLICATE_OFFSET),
        kind: node.kind.clone(),
    };
    match &mut copy.kind {
        NodeKind::Queue(queue) => queue.messages.clear(),
        NodeKind::Consumer(consumer) => {
            consumer.reset_runtime();
            consumer.consumed_count = 0;
        }
        _ => {}
    }
    copy
}

fn validate_diagram(nodes: &[Node], connections: &[Connection]) -> Result<()> {
    let mut node_types = HashMap::new();
    for node in nodes {
        if node_types.insert(node.id.as_str(), node.node_type()).is_some() {
            return Err(SimError::InvalidDiagram(format!("duplicate node id {}", node.id)));
        }
    }

    let mut connection_ids = HashSet::new();
    let mut pairs = HashSet::new();
    for connection in connections {
        if !connection_ids.insert(connection.id.as_str()) {
            return Err(SimError::InvalidDiagram(format!(
                "duplicate connection id {}",
                connection.id
            )));
        }

        let endpoint_type = |endpoint: &str| {
            node_types.get(endpoint).copied().ok_or_else(|| {
                SimError::InvalidDiagram(format!(
                    "connection {} refers to missing node {}",
                    connection.id, endpoint
                ))
            })
        };
        let source = endpoint_type(&connection.source_id)?;
        let target = endpoint_type(&connection.target_id)?;

        if !source.can_bind_to(target) {
            return Err(SimError::InvalidDiagram(format!(
                "connection {} binds {} to {}",
                connection.id,
                source.label(),
                target.label()
            )));
        }
        if !pairs.insert((connection.source_id.as_str(), connection.target_id.as_str())) {
            return Err(SimError::InvalidDiagram(format!(
                "connection {} duplicates {} -> {}",
                connection.id, connection.source_id, connection.target_id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn simulator() -> Simulator {
        Simulator::with_clock(SimulatorConfig::default(), Arc::new(ManualClock::new(1_000)))
    }

    fn origin() -> Position {
        Position::default()
    }

    #[test]
    fn test_default_names_count_per_type() {
        let mut sim = simulator();
        let q1 = sim.add_queue(origin(), None);
        sim.add_exchange(origin(), None);
        let q2 = sim.add_queue(origin(), None);
        let named = sim.add_queue(origin(), Some("orders".to_string()));

        assert_eq!(sim.node(&q1).unwrap().name, "Queue 1");
        assert_eq!(sim.node(&q2).unwrap().name, "Queue 2");
        assert_eq!(sim.node(&named).unwrap().name, "orders");
    }

    #[test]
    fn test_rejected_connection_leaves_no_history() {
        let mut sim = simulator();
        let p = sim.add_producer(origin(), None);
        let q = sim.add_queue(origin(), None);
        let before = sim.history.undo_depth();

        assert!(sim.add_connection(&p, &q, "").is_none());
        assert!(sim.add_connection(&p, "missing", "").is_none());
        assert_eq!(sim.history.undo_depth(), before);
        assert_eq!(sim.topology().connection_count(), 0);
    }

    #[test]
    fn test_duplicate_connection_rejected() {
        let mut sim = simulator();
        let e = sim.add_exchange(origin(), None);
        let q = sim.add_queue(origin(), None);

        assert!(sim.add_connection(&e, &q, "a").is_some());
        assert!(sim.add_connection(&e, &q, "b").is_none());
    }

    #[test]
    fn test_undo_restores_pre_edit_state() {
        let mut sim = simulator();
        let q = sim.add_queue(origin(), None);
        sim.update_node(&q, &NodeUpdate::new().with_name("renamed"));
        assert_eq!(sim.node(&q).unwrap().name, "renamed");

        assert!(sim.undo());
        assert_eq!(sim.node(&q).unwrap().name, "Queue 1");
        assert!(sim.undo());
        assert!(sim.node(&q).is_none());
        assert!(!sim.undo());

        assert!(sim.redo());
        assert!(sim.redo());
        assert_eq!(sim.node(&q).unwrap().name, "renamed");
        assert!(!sim.can_redo());
    }

    #[test]
    fn test_move_is_not_an_undo_step() {
        let mut sim = simulator();
        let q = sim.add_queue(origin(), None);
        let depth = sim.history.undo_depth();

        assert!(sim.move_node(&q, Position::new(10.0, 20.0)));
        sim.select_node(Some(&q));
        sim.move_selected_nodes(5.0, 5.0);

        assert_eq!(sim.history.undo_depth(), depth);
        assert_eq!(sim.node(&q).unwrap().position, Position::new(15.0, 25.0));
    }

    #[test]
    fn test_delete_cascades_and_clears_selection() {
        let mut sim = simulator();
        let e = sim.add_exchange(origin(), None);
        let q = sim.add_queue(origin(), None);
        let c = sim.add_connection(&e, &q, "k").unwrap();
        sim.select_connection(Some(&c));

        assert!(sim.delete_node(&q));
        assert_eq!(sim.topology().connection_count(), 0);
        assert!(sim.selection().selected_connection_id.is_none());
        assert!(!sim.delete_node(&q));
    }

    #[test]
    fn test_duplicate_node_selects_copy() {
        let mut sim = simulator();
        let c = sim.add_consumer(Position::new(100.0, 100.0), Some("Worker".to_string()));
        let copy = sim.duplicate_node(&c).unwrap();

        let node = sim.node(&copy).unwrap();
        assert_eq!(node.name, "Worker (copy)");
        assert_eq!(node.position, Position::new(150.0, 150.0));
        assert_eq!(sim.selection().selected_node_id.as_deref(), Some(copy.as_str()));
        assert!(sim.duplicate_node("missing").is_none());
    }

    #[test]
    fn test_duplicate_selected_copies_inner_connections() {
        let mut sim = simulator();
        let p = sim.add_producer(origin(), None);
        let e = sim.add_exchange(origin(), None);
        let q = sim.add_queue(origin(), None);
        sim.add_connection(&p, &e, "").unwrap();
        sim.add_connection(&e, &q, "key").unwrap();

        sim.select_multiple_nodes(vec![e.clone(), q.clone()]);
        let copies = sim.duplicate_selected_nodes();
        assert_eq!(copies.len(), 2);
        assert_eq!(sim.topology().node_count(), 5);
        // only exchange->queue runs between selected nodes
        assert_eq!(sim.topology().connection_count(), 3);

        let copied = sim.topology().outbound(&copies[0]).next().unwrap();
        assert_eq!(copied.target_id, copies[1]);
        assert_eq!(copied.routing_key, "key");
        assert_eq!(sim.selection().selected_node_ids, copies);
    }

    #[test]
    fn test_delete_selected_nodes() {
        let mut sim = simulator();
        let a = sim.add_queue(origin(), None);
        let b = sim.add_queue(origin(), None);
        let keep = sim.add_queue(origin(), None);
        sim.add_to_selection(&a);
        sim.add_to_selection(&b);

        assert_eq!(sim.delete_selected_nodes(), 2);
        assert_eq!(sim.topology().node_count(), 1);
        assert!(sim.node(&keep).is_some());
        assert!(sim.selection().selected_node_ids.is_empty());

        assert!(sim.undo());
        assert_eq!(sim.topology().node_count(), 3);
    }

    #[test]
    fn test_connect_gesture() {
        let mut sim = simulator();
        let e = sim.add_exchange(origin(), None);
        let q = sim.add_queue(origin(), None);

        assert!(!sim.finish_connecting(&q));

        sim.start_connecting(&e);
        assert!(sim.selection().is_connecting);
        assert!(!sim.finish_connecting(&e));

        sim.start_connecting(&e);
        assert!(sim.finish_connecting(&q));
        assert!(!sim.selection().is_connecting);
        assert_eq!(sim.topology().connection_count(), 1);

        sim.start_connecting(&q);
        sim.cancel_connecting();
        assert!(sim.selection().connecting_from_id.is_none());
    }

    #[test]
    fn test_select_all_and_clear() {
        let mut sim = simulator();
        sim.add_queue(origin(), None);
        sim.add_queue(origin(), None);

        sim.select_all();
        assert_eq!(sim.selection().selected_node_ids.len(), 2);
        sim.clear_selection();
        assert!(sim.selection().selected_node_ids.is_empty());
    }

    #[test]
    fn test_send_from_non_producer() {
        let mut sim = simulator();
        let q = sim.add_queue(origin(), None);
        assert!(sim.send_message(&q, "hi", "", Headers::new()).is_none());
        assert!(sim.send_message("missing", "hi", "", Headers::new()).is_none());
        assert_eq!(sim.stats().total_sent, 0);
    }

    #[test]
    fn test_message_stamped_by_clock() {
        let mut sim = simulator();
        let p = sim.add_producer(origin(), None);
        let id = sim.send_message(&p, "hi", "", Headers::new()).unwrap();
        assert_eq!(sim.message(&id).unwrap().timestamp, 1_000);
    }

    #[test]
    fn test_clear_canvas_resets_everything() {
        let mut sim = simulator();
        let p = sim.add_producer(origin(), None);
        sim.send_message(&p, "hi", "", Headers::new());

        sim.clear_canvas();
        assert_eq!(sim.topology().node_count(), 0);
        assert_eq!(sim.messages().count(), 0);
        assert_eq!(sim.stats(), SimulatorStats::default());
        assert!(!sim.can_undo());
    }

    #[test]
    fn test_import_rejects_malformed_and_keeps_state() {
        let mut sim = simulator();
        let q = sim.add_queue(origin(), None);

        assert!(sim.import_json("not json").is_err());
        assert!(matches!(
            sim.import_json(r#"{"nodes": []}"#),
            Err(SimError::InvalidDiagram(_))
        ));
        assert!(matches!(
            sim.import_json(r#"{"nodes": [], "connections": [{"id": "c", "sourceId": "a", "targetId": "b", "routingKey": ""}]}"#),
            Err(SimError::InvalidDiagram(_))
        ));
        assert!(sim.node(&q).is_some());
        assert!(sim.can_undo());
    }

    fn diagram_json(sim: &Simulator, connections: serde_json::Value) -> String {
        let nodes = serde_json::to_value(sim.export_diagram().nodes).unwrap();
        serde_json::json!({ "nodes": nodes, "connections": connections }).to_string()
    }

    #[test]
    fn test_import_rejects_edge_outside_allowed_set() {
        let mut sim = simulator();
        let p = sim.add_producer(origin(), None);
        let q = sim.add_queue(origin(), None);

        let text = diagram_json(
            &sim,
            serde_json::json!([{ "id": "c1", "sourceId": p, "targetId": q, "routingKey": "" }]),
        );

        assert!(matches!(sim.import_json(&text), Err(SimError::InvalidDiagram(_))));
        assert_eq!(sim.topology().connection_count(), 0);
        assert!(sim.can_undo());
    }

    #[test]
    fn test_import_rejects_duplicate_pair() {
        let mut sim = simulator();
        let q = sim.add_queue(origin(), None);
        let c = sim.add_consumer(origin(), None);

        let text = diagram_json(
            &sim,
            serde_json::json!([
                { "id": "c1", "sourceId": q, "targetId": c },
                { "id": "c2", "sourceId": q, "targetId": c }
            ]),
        );
        assert!(matches!(sim.import_json(&text), Err(SimError::InvalidDiagram(_))));

        let single = diagram_json(&sim, serde_json::json!([{ "id": "c1", "sourceId": q, "targetId": c }]));
        sim.import_json(&single).unwrap();
        assert_eq!(sim.topology().connection_count(), 1);
    }

    #[test]
    fn test_run_for_after_advance_polls_once() {
        let mut sim = simulator();
        let p = sim.add_producer(origin(), None);
        let x = sim.add_exchange(origin(), None);
        let q = sim.add_queue(origin(), None);
        sim.add_connection(&p, &x, "").unwrap();
        sim.add_connection(&x, &q, "").unwrap();
        for _ in 0..3 {
            let c = sim.add_consumer(origin(), None);
            sim.add_connection(&q, &c, "").unwrap();
        }
        for _ in 0..3 {
            sim.send_message(&p, "job", "", Headers::new()).unwrap();
        }

        for _ in 0..100 {
            sim.advance(Duration::from_millis(100));
        }
        assert_eq!(sim.stats().messages_in_queues, 3);

        sim.run_for(Duration::from_millis(100), Duration::from_millis(10));
        assert_eq!(sim.stats().messages_in_queues, 2);
    }

    #[test]
    fn test_load_template() {
        let mut sim = simulator();
        sim.load_template("pubSub").unwrap();
        assert_eq!(sim.topology().node_count(), 6);
        assert_eq!(sim.topology().connection_count(), 5);
        assert!(!sim.can_undo());

        assert!(matches!(
            sim.load_template("missing"),
            Err(SimError::UnknownTemplate(_))
        ));
        assert_eq!(sim.topology().node_count(), 6);
    }
}
