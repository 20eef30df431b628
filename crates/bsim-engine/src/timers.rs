//! Virtual-time timers for consumer processing delays and delayed acknowledgements

use std::collections::BTreeMap;
use std::time::Duration;

use bsim_common::{MessageId, NodeId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerTask {
    /// A consumer finished processing a delivered message
    FinishProcessing {
        consumer_id: NodeId,
        message_id: MessageId,
    },
    /// Demo-mode acknowledgement for a manual-ack consumer
    AutoAcknowledge { consumer_id: NodeId },
}

/// Pending timers ordered by due time, ties broken by scheduling order
#[derive(Debug, Clone, Default)]
pub struct TimerQueue {
    pending: BTreeMap<(Duration, u64), TimerTask>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule_at(&mut self, due: Duration, task: TimerTask) {
        self.pending.insert((due, self.next_seq), task);
        self.next_seq += 1;
    }

    pub fn next_due(&self) -> Option<Duration> {
        self.pending.keys().next().map(|(due, _)| *due)
    }

    /// Remove and return the earliest timer due at or before `now`
    pub fn pop_due(&mut self, now: Duration) -> Option<TimerTask> {
        match self.next_due() {
            Some(due) if due <= now => self.pending.pop_first().map(|(_, task)| task),
            _ => None,
        }
    }

    /// Whether a processing-completion timer is pending for this consumer
    pub fn has_finish_for(&self, consumer_id: &str) -> bool {
        self.pending.values().any(|task| {
            matches!(task, TimerTask::FinishProcessing { consumer_id: id, .. } if id == consumer_id)
        })
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
