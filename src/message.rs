// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Agent Message Model
//!
//! Plain data carried over the bus. `AgentMessage` is the JSON body of every
//! published message; `AgentType` identifies worker roles and doubles as the
//! queue identity of their consumers; `Target` is either one agent or the
//! whole fleet.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Literal used on the wire for broadcast targets and routing keys.
pub const BROADCAST: &str = "broadcast";

/// Closed set of worker roles taking part in the automation platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentType {
    ContentGenerator,
    VoiceAnalyzer,
    NewsMonitor,
    QualityControl,
    Publisher,
    Orchestrator,
}

impl AgentType {
    /// Every agent type, in declaration order.
    pub const ALL: [AgentType; 6] = [
        AgentType::ContentGenerator,
        AgentType::VoiceAnalyzer,
        AgentType::NewsMonitor,
        AgentType::QualityControl,
        AgentType::Publisher,
        AgentType::Orchestrator,
    ];

    /// Wire form, as used in JSON bodies and routing keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::ContentGenerator => "CONTENT_GENERATOR",
            AgentType::VoiceAnalyzer => "VOICE_ANALYZER",
            AgentType::NewsMonitor => "NEWS_MONITOR",
            AgentType::QualityControl => "QUALITY_CONTROL",
            AgentType::Publisher => "PUBLISHER",
            AgentType::Orchestrator => "ORCHESTRATOR",
        }
    }

    /// Dense index used by the handler registry.
    pub(crate) fn index(&self) -> usize {
        match self {
            AgentType::ContentGenerator => 0,
            AgentType::VoiceAnalyzer => 1,
            AgentType::NewsMonitor => 2,
            AgentType::QualityControl => 3,
            AgentType::Publisher => 4,
            AgentType::Orchestrator => 5,
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentType::ALL
            .into_iter()
            .find(|agent| agent.as_str() == s)
            .ok_or_else(|| format!("unknown agent type `{s}`"))
    }
}

/// Discriminates the semantics of a message payload.
///
/// A `Custom` kind equal to an agent type's wire form reaches that agent
/// through its type-keyed binding (`*.<AGENT>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    Generate,
    Analyze,
    Score,
    Publish,
    Schedule,
    Status,
    Result,
    Error,
    Custom(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Generate => "GENERATE",
            MessageType::Analyze => "ANALYZE",
            MessageType::Score => "SCORE",
            MessageType::Publish => "PUBLISH",
            MessageType::Schedule => "SCHEDULE",
            MessageType::Status => "STATUS",
            MessageType::Result => "RESULT",
            MessageType::Error => "ERROR",
            MessageType::Custom(kind) => kind,
        }
    }
}

impl From<String> for MessageType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "GENERATE" => MessageType::Generate,
            "ANALYZE" => MessageType::Analyze,
            "SCORE" => MessageType::Score,
            "PUBLISH" => MessageType::Publish,
            "SCHEDULE" => MessageType::Schedule,
            "STATUS" => MessageType::Status,
            "RESULT" => MessageType::Result,
            "ERROR" => MessageType::Error,
            _ => MessageType::Custom(value),
        }
    }
}

impl From<&str> for MessageType {
    fn from(value: &str) -> Self {
        MessageType::from(value.to_owned())
    }
}

impl From<AgentType> for MessageType {
    fn from(agent: AgentType) -> Self {
        MessageType::Custom(agent.as_str().to_owned())
    }
}

impl From<MessageType> for String {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::Custom(kind) => kind,
            other => other.as_str().to_owned(),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Addressing mode of a message: one agent, or every subscribed agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Target {
    Agent(AgentType),
    Broadcast,
}

impl Target {
    pub fn as_str(&self) -> &'static str {
        match self {
            Target::Agent(agent) => agent.as_str(),
            Target::Broadcast => BROADCAST,
        }
    }
}

impl TryFrom<String> for Target {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value == BROADCAST {
            return Ok(Target::Broadcast);
        }
        value.parse().map(Target::Agent)
    }
}

impl From<Target> for String {
    fn from(value: Target) -> Self {
        value.as_str().to_owned()
    }
}

impl From<AgentType> for Target {
    fn from(agent: AgentType) -> Self {
        Target::Agent(agent)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work exchanged between agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub target: Target,
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
}

impl AgentMessage {
    /// Creates a message with a fresh id and the current timestamp.
    pub fn new(kind: impl Into<MessageType>, target: impl Into<Target>) -> Self {
        AgentMessage {
            id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            target: target.into(),
            priority: 0,
            payload: serde_json::Value::Null,
            retry_count: 0,
            timestamp: Utc::now(),
        }
    }

    /// Overrides the generated id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the broker priority hint, clamped to the AMQP range 0..=9.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(9);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.target == Target::Broadcast
    }
}
