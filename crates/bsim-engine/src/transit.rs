//! Transit Scheduler - moves traveling messages along their connections
//!
//! Progress grows linearly with elapsed time at a fixed speed, so every hop
//! takes the same wall-clock time regardless of canvas geometry.

use std::time::Duration;
use tracing::trace;

use bsim_common::TravelingMessage;

pub const ARRIVAL_PROGRESS: f64 = 100.0;

#[derive(Debug, Clone)]
pub struct TransitScheduler {
    traveling: Vec<TravelingMessage>,
    /// Progress units per millisecond
    speed: f64,
}

impl TransitScheduler {
    pub fn new(speed: f64) -> Self {
        Self {
            traveling: Vec::new(),
            speed,
        }
    }

    pub fn dispatch(&mut self, traveling: TravelingMessage) {
        trace!(
            traveling_id = %traveling.id,
            from = %traveling.from_id,
            to = %traveling.to_id,
            "Message departed"
        );
        self.traveling.push(traveling);
    }

    /// Advance every traveling message. Arrivals are removed and returned in
    /// list order; the caller processes them one by one in that order.
    pub fn advance(&mut self, elapsed: Duration) -> Vec<TravelingMessage> {
        if self.traveling.is_empty() {
            return Vec::new();
        }

        let delta = elapsed.as_secs_f64() * 1000.0 * self.speed;
        let mut arrived = Vec::new();
        let mut remaining = Vec::with_capacity(self.traveling.len());

        for mut traveling in self.traveling.drain(..) {
            traveling.progress += delta;
            if traveling.progress >= ARRIVAL_PROGRESS {
                traveling.progress = ARRIVAL_PROGRESS;
                arrived.push(traveling);
            } else {
                remaining.push(traveling);
            }
        }

        self.traveling = remaining;
        arrived
    }

    pub fn in_transit(&self) -> &[TravelingMessage] {
        &self.traveling
    }

    pub fn len(&self) -> usize {
        self.traveling.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traveling.is_empty()
    }

    /// Abandon everything in flight
    pub fn clear(&mut self) {
        self.traveling.clear();
    }
}
