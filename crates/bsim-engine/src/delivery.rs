//! Consumer Delivery Model
//!
//! A periodic poll hands the head of each non-empty queue to the first idle
//! consumer bound to it. Auto-ack consumers are done with a message once its
//! processing time elapses. Manual-ack consumers keep it in flight until
//! `acknowledge` is called; there is no timeout or redelivery.
//!
//! `prefetch_count` is reported but never caps deliveries: the poll only
//! requires the consumer to be idle.

use indexmap::IndexMap;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, warn};

use bsim_common::{ConnectionId, ConsumerNode, Message, MessageId, MessageStatus, Node, NodeId};

use crate::topology::Topology;

/// A message detached from a queue on its way to a consumer
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue_id: NodeId,
    pub consumer_id: NodeId,
    pub connection_id: ConnectionId,
    pub message: Message,
}

/// One poll pass: at most one delivery per queue, queues in topology order.
/// The chosen consumer is marked busy and the head message is detached.
pub fn poll(topology: &mut Topology) -> Vec<Delivery> {
    let ready_queues: Vec<NodeId> = topology
        .nodes()
        .filter(|n| n.as_queue().is_some_and(|q| !q.messages.is_empty()))
        .map(|n| n.id.clone())
        .collect();

    let mut deliveries = Vec::new();

    for queue_id in ready_queues {
        let idle = topology
            .outbound(&queue_id)
            .find(|c| {
                topology
                    .node(&c.target_id)
                    .and_then(Node::as_consumer)
                    .is_some_and(|consumer| !consumer.is_processing)
            })
            .map(|c| (c.target_id.clone(), c.id.clone()));

        let Some((consumer_id, connection_id)) = idle else {
            continue;
        };

        let Some(mut message) = topology
            .node_mut(&queue_id)
            .and_then(Node::as_queue_mut)
            .and_then(|q| q.messages.pop_front())
        else {
            continue;
        };

        if let Some(consumer) = topology.node_mut(&consumer_id).and_then(Node::as_consumer_mut) {
            consumer.is_processing = true;
        }

        message.status = MessageStatus::Consumed;
        debug!(
            queue_id = %queue_id,
            consumer_id = %consumer_id,
            message_id = %message.id,
            "Delivering message to consumer"
        );

        deliveries.push(Delivery {
            queue_id,
            consumer_id,
            connection_id,
            message,
        });
    }

    deliveries
}

/// Start processing a message that reached a consumer. Returns how long
/// processing takes.
pub fn begin_processing(
    consumer: &mut ConsumerNode,
    consumer_id: &str,
    mut message: Message,
    in_flight: &mut InFlightTracker,
) -> Duration {
    consumer.is_processing = true;
    message.path.push(consumer_id.to_string());

    if !consumer.auto_ack {
        message.in_flight = true;
        message.consumer_id = Some(consumer_id.to_string());
        in_flight.track(consumer_id, message);
        consumer.current_message = in_flight.oldest(consumer_id).cloned();
        consumer.unacked_count = in_flight.pending(consumer_id) as u32;

        if consumer.unacked_count > consumer.prefetch_count {
            warn!(
                consumer_id = %consumer_id,
                unacked = consumer.unacked_count,
                prefetch = consumer.prefetch_count,
                "Unacknowledged messages exceed prefetch count"
            );
        }
    }

    Duration::from_millis(consumer.processing_time)
}

/// Processing time elapsed: the consumer becomes idle again
pub fn finish_processing(consumer: &mut ConsumerNode) {
    consumer.is_processing = false;
    consumer.consumed_count += 1;
}

/// Messages delivered to manual-ack consumers and not yet acknowledged,
/// oldest first per consumer
#[derive(Debug, Clone, Default)]
pub struct InFlightTracker {
    by_consumer: IndexMap<NodeId, VecDeque<Message>>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, consumer_id: &str, message: Message) {
        self.by_consumer
            .entry(consumer_id.to_string())
            .or_default()
            .push_back(message);
    }

    /// Acknowledge the oldest unacknowledged message of a consumer
    pub fn acknowledge(&mut self, consumer_id: &str) -> Option<Message> {
        let pending = self.by_consumer.get_mut(consumer_id)?;
        let message = pending.pop_front();
        if pending.is_empty() {
            self.by_consumer.shift_remove(consumer_id);
        }
        message
    }

    pub fn pending(&self, consumer_id: &str) -> usize {
        self.by_consumer.get(consumer_id).map_or(0, VecDeque::len)
    }

    pub fn oldest(&self, consumer_id: &str) -> Option<&Message> {
        self.by_consumer.get(consumer_id).and_then(|p| p.front())
    }

    /// Whether any consumer still holds a copy of this message unacknowledged
    pub fn holds(&self, message_id: &MessageId) -> bool {
        self.by_consumer
            .values()
            .any(|pending| pending.iter().any(|m| &m.id == message_id))
    }

    pub fn clear(&mut self) {
        self.by_consumer.clear();
    }
}
