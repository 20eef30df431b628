//! Engine Scenario Tests
//!
//! End-to-end runs through the public `Simulator` API using virtual time.

use std::time::Duration;

use bsim_common::{
    ConnectionUpdate, ExchangeType, Headers, MessageStatus, Node, NodeId, NodeType, NodeUpdate,
    Position,
};
use bsim_config::SimulatorConfig;
use bsim_engine::Simulator;

const STEP: Duration = Duration::from_millis(10);

fn run(sim: &mut Simulator, millis: u64) {
    sim.run_for(Duration::from_millis(millis), STEP);
}

fn headers(pairs: &[(&str, &str)]) -> Headers {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn queue_len(sim: &Simulator, queue_id: &str) -> usize {
    sim.node(queue_id)
        .and_then(Node::as_queue)
        .map_or(0, |q| q.messages.len())
}

/// producer -> exchange, returning (producer, exchange)
fn publisher(sim: &mut Simulator, exchange_type: ExchangeType) -> (NodeId, NodeId) {
    let producer = sim.add_producer(Position::new(0.0, 0.0), None);
    let exchange = sim.add_exchange(Position::new(200.0, 0.0), Some("X".to_string()));
    sim.update_node(&exchange, &NodeUpdate::new().with_exchange_type(exchange_type));
    sim.add_connection(&producer, &exchange, "").unwrap();
    (producer, exchange)
}

mod routing_scenarios {
    use super::*;

    #[test]
    fn test_direct_exchange_routes_exact_key() {
        let mut sim = Simulator::new(SimulatorConfig::default());
        let (producer, exchange) = publisher(&mut sim, ExchangeType::Direct);
        let queue = sim.add_queue(Position::default(), Some("Q".to_string()));
        sim.add_connection(&exchange, &queue, "info").unwrap();

        let info = sim.send_message(&producer, "hello", "info", Headers::new()).unwrap();
        run(&mut sim, 3_000);

        let queued = &sim.node(&queue).and_then(Node::as_queue).unwrap().messages;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].status, MessageStatus::Queued);
        assert_eq!(queued[0].path, vec![producer.clone(), exchange.clone(), queue.clone()]);
        assert_eq!(sim.message(&info).unwrap().status, MessageStatus::Queued);

        let warn = sim.send_message(&producer, "hello", "warn", Headers::new()).unwrap();
        run(&mut sim, 3_000);

        assert_eq!(sim.message(&warn).unwrap().status, MessageStatus::Unroutable);
        assert_eq!(queue_len(&sim, &queue), 1);
        assert_eq!(sim.stats().total_rejected, 1);
    }

    #[test]
    fn test_headers_exchange_requires_all_declared_headers() {
        let mut sim = Simulator::new(SimulatorConfig::default());
        let (producer, exchange) = publisher(&mut sim, ExchangeType::Headers);
        let queue = sim.add_queue(Position::default(), None);
        let binding = sim.add_connection(&exchange, &queue, "").unwrap();
        sim.update_connection(
            &binding,
            &ConnectionUpdate::new().with_headers(Some(headers(&[("format", "pdf")]))),
        );

        let pdf = sim
            .send_message(&producer, "report", "", headers(&[("format", "pdf"), ("type", "report")]))
            .unwrap();
        let doc = sim
            .send_message(&producer, "letter", "", headers(&[("format", "doc")]))
            .unwrap();
        run(&mut sim, 3_000);

        assert_eq!(sim.message(&pdf).unwrap().status, MessageStatus::Queued);
        assert_eq!(sim.message(&doc).unwrap().status, MessageStatus::Unroutable);
        assert_eq!(queue_len(&sim, &queue), 1);
    }

    #[test]
    fn test_fanout_copies_to_every_bound_queue() {
        let mut sim = Simulator::new(SimulatorConfig::default());
        let (producer, exchange) = publisher(&mut sim, ExchangeType::Fanout);
        let queues: Vec<NodeId> = (0..3)
            .map(|_| {
                let queue = sim.add_queue(Position::default(), None);
                sim.add_connection(&exchange, &queue, "ignored").unwrap();
                queue
            })
            .collect();

        sim.send_message(&producer, "broadcast", "any.key", Headers::new()).unwrap();
        run(&mut sim, 3_000);

        let stats = sim.stats();
        assert_eq!(stats.total_sent, 1);
        assert_eq!(stats.total_routed, 3);
        assert_eq!(stats.messages_in_queues, 3);
        for queue in &queues {
            assert_eq!(queue_len(&sim, queue), 1);
        }
    }

    #[test]
    fn test_topic_template_wildcards() {
        let mut sim = Simulator::new(SimulatorConfig::default());
        sim.load_template("topics").unwrap();
        let producer = sim
            .nodes()
            .find(|n| n.node_type() == NodeType::Producer)
            .map(|n| n.id.clone())
            .unwrap();

        // *.order.*, us.# and #.critical all match
        sim.send_message(&producer, "alert", "us.order.critical", Headers::new()).unwrap();
        run(&mut sim, 2_100);
        assert_eq!(sim.stats().total_routed, 3);

        sim.send_message(&producer, "order", "eu.order.created", Headers::new()).unwrap();
        run(&mut sim, 2_100);
        assert_eq!(sim.stats().total_routed, 4);
        assert_eq!(sim.stats(), sim.recomputed_stats());
    }

    #[test]
    fn test_producer_without_binding_is_unroutable() {
        let mut sim = Simulator::new(SimulatorConfig::default());
        let producer = sim.add_producer(Position::default(), None);

        let id = sim.send_message(&producer, "lost", "k", Headers::new()).unwrap();

        assert_eq!(sim.message(&id).unwrap().status, MessageStatus::Unroutable);
        assert!(sim.traveling_messages().is_empty());
        let stats = sim.stats();
        assert_eq!(stats.total_sent, 1);
        assert_eq!(stats.total_rejected, 1);
    }

    #[test]
    fn test_exchange_deleted_in_transit_rejects_message() {
        let mut sim = Simulator::new(SimulatorConfig::default());
        let (producer, exchange) = publisher(&mut sim, ExchangeType::Fanout);

        let id = sim.send_message(&producer, "doomed", "", Headers::new()).unwrap();
        run(&mut sim, 500);
        sim.delete_node(&exchange);
        run(&mut sim, 1_000);

        assert_eq!(sim.message(&id).unwrap().status, MessageStatus::Rejected);
        assert_eq!(sim.stats().total_rejected, 1);
        assert_eq!(sim.stats(), sim.recomputed_stats());
    }
}

mod consumer_scenarios {
    use super::*;

    fn pipeline(sim: &mut Simulator, auto_ack: bool) -> (NodeId, NodeId, NodeId) {
        let (producer, exchange) = publisher(sim, ExchangeType::Direct);
        let queue = sim.add_queue(Position::default(), None);
        let consumer = sim.add_consumer(Position::default(), None);
        sim.update_node(&consumer, &NodeUpdate::new().with_auto_ack(auto_ack).with_processing_time(1_000));
        sim.add_connection(&exchange, &queue, "work").unwrap();
        sim.add_connection(&queue, &consumer, "").unwrap();
        (producer, queue, consumer)
    }

    fn consumer_state(sim: &Simulator, id: &str) -> bsim_common::ConsumerNode {
        sim.node(id).and_then(Node::as_consumer).cloned().unwrap()
    }

    #[test]
    fn test_auto_ack_consumer_consumes() {
        let mut sim = Simulator::new(SimulatorConfig::default());
        let (producer, queue, consumer) = pipeline(&mut sim, true);

        let id = sim.send_message(&producer, "job", "work", Headers::new()).unwrap();
        run(&mut sim, 5_000);

        let state = consumer_state(&sim, &consumer);
        assert!(!state.is_processing);
        assert_eq!(state.consumed_count, 1);
        assert_eq!(state.unacked_count, 0);
        assert_eq!(queue_len(&sim, &queue), 0);

        let message = sim.message(&id).unwrap();
        assert_eq!(message.status, MessageStatus::Consumed);
        assert!(!message.in_flight);
        assert_eq!(sim.stats().total_consumed, 1);
    }

    #[test]
    fn test_manual_ack_stays_in_flight_until_acknowledged() {
        let mut sim = Simulator::new(SimulatorConfig::default());
        let (producer, _, consumer) = pipeline(&mut sim, false);

        let id = sim.send_message(&producer, "job", "work", Headers::new()).unwrap();
        run(&mut sim, 3_500);
        assert!(consumer_state(&sim, &consumer).is_processing);

        run(&mut sim, 1_500);
        let state = consumer_state(&sim, &consumer);
        assert!(!state.is_processing);
        assert_eq!(state.consumed_count, 1);
        assert_eq!(state.unacked_count, 1);
        assert_eq!(state.current_message.as_ref().map(|m| m.id.as_str()), Some(id.as_str()));

        let message = sim.message(&id).unwrap();
        assert!(message.in_flight);
        assert_eq!(message.consumer_id.as_deref(), Some(consumer.as_str()));

        // stays attributed indefinitely
        run(&mut sim, 10_000);
        assert!(sim.message(&id).unwrap().in_flight);

        assert!(sim.acknowledge_message(&consumer));
        let state = consumer_state(&sim, &consumer);
        assert_eq!(state.unacked_count, 0);
        assert!(state.current_message.is_none());
        assert!(!sim.message(&id).unwrap().in_flight);
        assert!(!sim.acknowledge_message(&consumer));
    }

    #[test]
    fn test_configured_delay_acknowledges_automatically() {
        let config = SimulatorConfig {
            manual_ack_auto_ack_delay_ms: Some(200),
            ..SimulatorConfig::default()
        };
        let mut sim = Simulator::new(config);
        let (producer, _, consumer) = pipeline(&mut sim, false);

        let id = sim.send_message(&producer, "job", "work", Headers::new()).unwrap();
        run(&mut sim, 6_000);

        assert_eq!(sim.unacked_count(&consumer), 0);
        assert!(!sim.message(&id).unwrap().in_flight);
        assert!(sim.is_idle());
    }

    #[test]
    fn test_one_delivery_per_consumer_at_a_time() {
        let mut sim = Simulator::new(SimulatorConfig::default());
        let (producer, queue, consumer) = pipeline(&mut sim, true);

        for n in 0..3 {
            sim.send_message(&producer, format!("job {}", n), "work", Headers::new()).unwrap();
        }
        run(&mut sim, 2_600);
        // one detached toward the consumer, two still waiting
        assert_eq!(queue_len(&sim, &queue), 2);

        run(&mut sim, 10_000);
        assert_eq!(queue_len(&sim, &queue), 0);
        assert_eq!(consumer_state(&sim, &consumer).consumed_count, 3);
    }
}

mod history_scenarios {
    use super::*;

    #[test]
    fn test_undo_then_redo_restores_identical_topology() {
        let mut sim = Simulator::new(SimulatorConfig::default());
        let producer = sim.add_producer(Position::default(), None);
        let exchange = sim.add_exchange(Position::default(), None);
        let queue = sim.add_queue(Position::default(), None);
        let binding = sim.add_connection(&exchange, &queue, "a.b").unwrap();
        sim.add_connection(&producer, &exchange, "").unwrap();
        sim.update_node(&exchange, &NodeUpdate::new().with_exchange_type(ExchangeType::Topic));
        sim.update_connection(&binding, &ConnectionUpdate::new().with_routing_key("a.#"));
        const EDITS: usize = 7;

        let after_edits = sim.topology().to_parts();

        for _ in 0..EDITS {
            assert!(sim.undo());
        }
        assert_eq!(sim.topology().node_count(), 0);
        assert!(!sim.can_undo());

        for _ in 0..EDITS {
            assert!(sim.redo());
        }
        assert_eq!(sim.topology().to_parts(), after_edits);
        assert!(!sim.can_redo());
    }

    #[test]
    fn test_history_capacity_bounds_undo() {
        let config = SimulatorConfig {
            history_capacity: 3,
            ..SimulatorConfig::default()
        };
        let mut sim = Simulator::new(config);
        for _ in 0..5 {
            sim.add_queue(Position::default(), None);
        }

        let mut undone = 0;
        while sim.undo() {
            undone += 1;
        }
        assert_eq!(undone, 3);
        assert_eq!(sim.topology().node_count(), 2);
    }

    #[test]
    fn test_undo_keeps_messages_out_of_history() {
        let mut sim = Simulator::new(SimulatorConfig::default());
        let (producer, exchange) = publisher(&mut sim, ExchangeType::Direct);
        let queue = sim.add_queue(Position::default(), None);
        sim.add_connection(&exchange, &queue, "k").unwrap();
        sim.send_message(&producer, "m", "k", Headers::new()).unwrap();
        run(&mut sim, 3_000);

        sim.update_node(&queue, &NodeUpdate::new().with_name("renamed"));
        assert!(sim.undo());

        // the queue survives the undo with its live contents
        assert_eq!(queue_len(&sim, &queue), 1);
        assert_eq!(sim.messages().count(), 1);
        assert_eq!(sim.stats(), sim.recomputed_stats());
    }

    #[test]
    fn test_undo_clears_selection() {
        let mut sim = Simulator::new(SimulatorConfig::default());
        let queue = sim.add_queue(Position::default(), None);
        sim.select_node(Some(&queue));
        sim.add_queue(Position::default(), None);

        assert!(sim.undo());
        assert!(sim.selection().selected_node_id.is_none());
    }
}

mod diagram_scenarios {
    use super::*;

    #[test]
    fn test_export_import_round_trip() {
        let mut source = Simulator::new(SimulatorConfig::default());
        source.load_template("routing").unwrap();
        let json = source.export_json().unwrap();

        let mut target = Simulator::new(SimulatorConfig::default());
        target.add_queue(Position::default(), None);
        target.import_json(&json).unwrap();

        assert_eq!(target.topology().to_parts(), source.topology().to_parts());
        assert!(!target.can_undo());
        assert_eq!(target.stats().total_sent, 0);
    }

    #[test]
    fn test_stats_match_recomputation_throughout() {
        let mut sim = Simulator::new(SimulatorConfig::default());
        sim.load_template("pubSub").unwrap();
        let producer = sim
            .nodes()
            .find(|n| n.node_type() == NodeType::Producer)
            .map(|n| n.id.clone())
            .unwrap();

        for round in 0..5 {
            sim.send_message(&producer, format!("event {}", round), "", Headers::new()).unwrap();
            run(&mut sim, 1_100);
            assert_eq!(sim.stats(), sim.recomputed_stats());
        }

        let queue = sim
            .nodes()
            .find(|n| n.node_type() == NodeType::Queue)
            .map(|n| n.id.clone())
            .unwrap();
        sim.delete_node(&queue);
        assert_eq!(sim.stats(), sim.recomputed_stats());

        run(&mut sim, 10_000);
        let stats = sim.stats();
        assert_eq!(stats, sim.recomputed_stats());
        assert_eq!(stats.total_sent, 5);
        assert_eq!(stats.total_routed, 10);
    }
}
