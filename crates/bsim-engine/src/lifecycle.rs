//! Message Lifecycle - status state machine and the flat message log
//!
//! ```text
//! created -> sent -> routed -> queued -> consumed
//!    |        |
//!    |        +----> unroutable | rejected
//!    +-------------> unroutable
//! ```
//!
//! The log keeps one entry per published message. Copies produced by routing
//! share the id of their log entry; the entry's status is the furthest point
//! any copy has reached and never moves backwards.

use indexmap::IndexMap;
use tracing::{debug, trace};

use bsim_common::{Message, MessageId, MessageStatus, SimulatorStats};

fn rank(status: MessageStatus) -> u8 {
    match status {
        MessageStatus::Created => 0,
        MessageStatus::Sent => 1,
        MessageStatus::Routed => 2,
        MessageStatus::Queued => 3,
        MessageStatus::Consumed => 4,
        MessageStatus::Rejected | MessageStatus::Unroutable => u8::MAX,
    }
}

/// Whether `from -> to` is a legal lifecycle step
pub fn can_transition(from: MessageStatus, to: MessageStatus) -> bool {
    if from.is_terminal_failure() {
        return false;
    }
    if to.is_terminal_failure() {
        return matches!(from, MessageStatus::Created | MessageStatus::Sent);
    }
    rank(to) == rank(from) + 1
}

#[derive(Debug, Clone)]
struct LogEntry {
    message: Message,
    routed_copies: u64,
    consumed_copies: u64,
}

/// Append-only record of every published message
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    entries: IndexMap<MessageId, LogEntry>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, message: Message) {
        self.entries.insert(
            message.id.clone(),
            LogEntry {
                message,
                routed_copies: 0,
                consumed_copies: 0,
            },
        );
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.entries.get(id).map(|e| &e.message)
    }

    /// Messages in publish order
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.entries.values().map(|e| &e.message)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Move the logged message to `status` if that is a legal step.
    /// Returns whether the status changed.
    pub fn advance(&mut self, id: &str, status: MessageStatus) -> bool {
        let Some(entry) = self.entries.get_mut(id) else {
            return false;
        };
        let current = entry.message.status;
        if can_transition(current, status) {
            debug!(message_id = %id, from = %current, to = %status, "Message status changed");
            entry.message.status = status;
            true
        } else {
            trace!(message_id = %id, from = %current, to = %status, "Status change ignored");
            false
        }
    }

    pub fn note_routed(&mut self, id: &str, copies: u64) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.routed_copies += copies;
        }
    }

    pub fn note_consumed(&mut self, id: &str) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.consumed_copies += 1;
        }
    }

    /// Mirror the in-flight attribution of a delivered copy onto the log entry
    pub fn set_in_flight(&mut self, id: &str, consumer_id: Option<&str>, in_flight: bool) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.message.in_flight = in_flight;
            if let Some(consumer_id) = consumer_id {
                entry.message.consumer_id = Some(consumer_id.to_string());
            }
        }
    }

    /// Statistics derived from scratch from the log plus the current queue depth
    pub fn derive_stats(&self, messages_in_queues: u64) -> SimulatorStats {
        SimulatorStats {
            total_sent: self.entries.len() as u64,
            total_routed: self.entries.values().map(|e| e.routed_copies).sum(),
            total_consumed: self.entries.values().map(|e| e.consumed_copies).sum(),
            total_rejected: self
                .entries
                .values()
                .filter(|e| e.message.status.is_terminal_failure())
                .count() as u64,
            messages_in_queues,
        }
    }
}
