// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Routing Keys and Binding Patterns
//!
//! Direct, broadcast and type-keyed addressing all share one topic exchange.
//! The mode is carried entirely by the shape of the routing key
//! (`<target>.<type>`) and by the three patterns every agent queue binds with.

use crate::message::{AgentMessage, AgentType, BROADCAST};

/// Prefix of every per-agent queue name.
pub const AGENT_QUEUE_PREFIX: &str = "agent";

/// Computes the routing key a message is published with.
pub fn routing_key(message: &AgentMessage) -> String {
    format!("{}.{}", message.target.as_str(), message.kind.as_str())
}

/// Deterministic queue name of an agent type.
pub fn queue_name(agent: AgentType) -> String {
    format!("{}.{}", AGENT_QUEUE_PREFIX, agent.as_str().to_lowercase())
}

/// Patterns an agent queue is bound with: direct, broadcast and type-keyed.
pub fn binding_patterns(agent: AgentType) -> [String; 3] {
    [
        format!("{}.*", agent.as_str()),
        format!("{BROADCAST}.*"),
        format!("*.{}", agent.as_str()),
    ]
}

/// Matches a routing key against an AMQP topic pattern.
///
/// `*` matches exactly one word and `#` matches zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}
