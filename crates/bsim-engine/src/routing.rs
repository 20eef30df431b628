//! Routing Engine - matches a message against an exchange's bindings
//!
//! Pure functions only: no topology or statistics are touched here.
//! - fanout: every bound queue matches
//! - direct: exact, case-sensitive routing key equality
//! - topic: dot-segmented patterns with `*` (one segment) and `#` (zero or more)
//! - headers: every header declared on the binding must equal the message's value

use bsim_common::{Connection, ConnectionId, ExchangeType, Headers, Message, NodeId};

/// A matched binding: the queue the message goes to and the connection it travels on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub queue_id: NodeId,
    pub connection_id: ConnectionId,
}

/// Match `message` against `bindings` (connections from the exchange to its queues).
///
/// Routes are returned in binding order.
pub fn route<'a, I>(message: &Message, exchange_type: ExchangeType, bindings: I) -> Vec<Route>
where
    I: IntoIterator<Item = &'a Connection>,
{
    bindings
        .into_iter()
        .filter(|binding| binding_matches(exchange_type, message, binding))
        .map(|binding| Route {
            queue_id: binding.target_id.clone(),
            connection_id: binding.id.clone(),
        })
        .collect()
}

pub fn binding_matches(exchange_type: ExchangeType, message: &Message, binding: &Connection) -> bool {
    match exchange_type {
        ExchangeType::Fanout => true,
        ExchangeType::Direct => message.routing_key == binding.routing_key,
        ExchangeType::Topic => topic_matches(&message.routing_key, &binding.routing_key),
        ExchangeType::Headers => headers_match(&message.headers, binding.headers.as_ref()),
    }
}

/// Anchored topic match of `routing_key` against `pattern`.
///
/// `#` may cover any number of segments, so `#.critical` matches
/// `a.critical.b.critical` as well as `critical`. Runs in
/// O(key segments × pattern segments).
pub fn topic_matches(routing_key: &str, pattern: &str) -> bool {
    let key: Vec<&str> = routing_key.split('.').collect();
    let mut segments: Vec<&str> = Vec::new();
    for segment in pattern.split('.') {
        // `#.#` matches the same keys as `#`
        if segment == "#" && segments.last() == Some(&"#") {
            continue;
        }
        segments.push(segment);
    }
    match_segments(&key, &segments)
}

/// `next[i]` holds whether `key[i..]` matches the pattern suffix after the
/// segment being processed.
fn match_segments(key: &[&str], pattern: &[&str]) -> bool {
    let mut next = vec![false; key.len() + 1];
    next[key.len()] = true;

    for segment in pattern.iter().rev() {
        let mut current = vec![false; key.len() + 1];
        for i in (0..=key.len()).rev() {
            current[i] = match *segment {
                "#" => next[i] || (i < key.len() && current[i + 1]),
                "*" => i < key.len() && next[i + 1],
                literal => i < key.len() && key[i] == literal && next[i + 1],
            };
        }
        next = current;
    }

    next[0]
}

/// "Match all" header semantics. A binding without declared headers never matches.
pub fn headers_match(message_headers: &Headers, binding_headers: Option<&Headers>) -> bool {
    match binding_headers {
        Some(declared) if !declared.is_empty() => declared
            .iter()
            .all(|(key, value)| message_headers.get(key) == Some(value)),
        _ => false,
    }
}
