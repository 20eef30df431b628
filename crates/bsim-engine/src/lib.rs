//! BrokerSim Engine
//!
//! This crate provides the broker topology simulation with:
//! - Simulator: Single owner of topology, messages, stats, history and timers
//! - Topology: Nodes and bindings with edge-set validation
//! - Routing: Fanout, direct, topic and headers exchange matching
//! - MessageLog: Lifecycle state machine and derived statistics
//! - TransitScheduler: Time-driven movement of messages along bindings
//! - Delivery: Consumer polling, processing and manual acknowledgement
//! - History: Bounded undo/redo of topology snapshots
//! - Templates: Built-in example topologies
//! - SimulationDriver: Real-time tokio tasks driving a shared simulator

pub mod clock;
pub mod delivery;
pub mod driver;
pub mod history;
pub mod lifecycle;
pub mod routing;
pub mod selection;
pub mod simulator;
pub mod templates;
pub mod timers;
pub mod topology;
pub mod transit;

pub use clock::{Clock, ManualClock, SystemClock};
pub use delivery::{Delivery, InFlightTracker};
pub use driver::{DriverConfig, SimulationDriver};
pub use history::History;
pub use lifecycle::{can_transition, MessageLog};
pub use routing::{route, topic_matches, Route};
pub use selection::Selection;
pub use simulator::Simulator;
pub use templates::{Template, TemplateConnection};
pub use timers::{TimerQueue, TimerTask};
pub use topology::{ConnectedNodes, ConnectionRejection, Topology};
pub use transit::TransitScheduler;

pub use bsim_common::{Result, SimError};
