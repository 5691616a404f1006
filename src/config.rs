// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Bus Configuration
//!
//! `MessageBusConfig` carries the broker address, the exchange the agents share,
//! the per-consumer prefetch window and the reconnect delay. The remaining knobs
//! (retry policy, queue TTL, dead-letter names) default to the values the agent
//! platform runs with. Durations are milliseconds on the wire.

use crate::errors::BusError;
use serde::{Deserialize, Serialize};
use std::{env, time::Duration};

pub const ENV_URL: &str = "RABBITMQ_URL";
pub const ENV_EXCHANGE: &str = "RABBITMQ_EXCHANGE";
pub const ENV_PREFETCH: &str = "RABBITMQ_PREFETCH";
pub const ENV_RECONNECT_DELAY_MS: &str = "RABBITMQ_RECONNECT_DELAY_MS";
pub const ENV_CONNECTION_NAME: &str = "RABBITMQ_CONNECTION_NAME";

const DEFAULT_CONNECTION_NAME: &str = "agent-bus";
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_QUEUE_MESSAGE_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBusConfig {
    pub url: String,
    pub exchange_name: String,
    pub prefetch_count: u16,
    #[serde(rename = "reconnect_delay_ms", with = "millis")]
    pub reconnect_delay: Duration,
    #[serde(default = "default_connection_name")]
    pub connection_name: String,
    /// Deliveries a message gets before it is dead-lettered.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(
        rename = "retry_base_delay_ms",
        with = "millis",
        default = "default_retry_base_delay"
    )]
    pub retry_base_delay: Duration,
    #[serde(
        rename = "queue_message_ttl_ms",
        with = "millis",
        default = "default_queue_message_ttl"
    )]
    pub queue_message_ttl: Duration,
    #[serde(default)]
    dead_letter_exchange: Option<String>,
    #[serde(default)]
    dead_letter_queue: Option<String>,
}

fn default_connection_name() -> String {
    DEFAULT_CONNECTION_NAME.to_owned()
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_base_delay() -> Duration {
    DEFAULT_RETRY_BASE_DELAY
}

fn default_queue_message_ttl() -> Duration {
    DEFAULT_QUEUE_MESSAGE_TTL
}

impl MessageBusConfig {
    pub fn new(
        url: impl Into<String>,
        exchange_name: impl Into<String>,
        prefetch_count: u16,
        reconnect_delay: Duration,
    ) -> Self {
        MessageBusConfig {
            url: url.into(),
            exchange_name: exchange_name.into(),
            prefetch_count,
            reconnect_delay,
            connection_name: default_connection_name(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            queue_message_ttl: DEFAULT_QUEUE_MESSAGE_TTL,
            dead_letter_exchange: None,
            dead_letter_queue: None,
        }
    }

    /// Reads the required settings from `RABBITMQ_*` environment variables.
    pub fn from_env() -> Result<Self, BusError> {
        let url = required_env(ENV_URL)?;
        let exchange = required_env(ENV_EXCHANGE)?;
        let prefetch = required_env(ENV_PREFETCH)?
            .parse::<u16>()
            .map_err(|err| BusError::InvalidConfig(format!("{ENV_PREFETCH}: {err}")))?;
        let delay = required_env(ENV_RECONNECT_DELAY_MS)?
            .parse::<u64>()
            .map_err(|err| BusError::InvalidConfig(format!("{ENV_RECONNECT_DELAY_MS}: {err}")))?;

        let mut cfg = MessageBusConfig::new(url, exchange, prefetch, Duration::from_millis(delay));
        if let Ok(name) = env::var(ENV_CONNECTION_NAME) {
            cfg.connection_name = name;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), BusError> {
        if self.url.trim().is_empty() {
            return Err(BusError::InvalidConfig("url must not be empty".into()));
        }
        if self.exchange_name.trim().is_empty() {
            return Err(BusError::InvalidConfig("exchange name must not be empty".into()));
        }
        if self.prefetch_count == 0 {
            return Err(BusError::InvalidConfig("prefetch count must be positive".into()));
        }
        if self.max_retries == 0 {
            return Err(BusError::InvalidConfig("max retries must be positive".into()));
        }
        Ok(())
    }

    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = name.into();
        self
    }

    pub fn with_retry_policy(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_base_delay = base_delay;
        self
    }

    pub fn with_queue_message_ttl(mut self, ttl: Duration) -> Self {
        self.queue_message_ttl = ttl;
        self
    }

    pub fn with_dead_letter(
        mut self,
        exchange: impl Into<String>,
        queue: impl Into<String>,
    ) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self.dead_letter_queue = Some(queue.into());
        self
    }

    pub fn dead_letter_exchange(&self) -> String {
        self.dead_letter_exchange
            .clone()
            .unwrap_or_else(|| format!("{}.dlx", self.exchange_name))
    }

    pub fn dead_letter_queue(&self) -> String {
        self.dead_letter_queue
            .clone()
            .unwrap_or_else(|| format!("{}.dlq", self.exchange_name))
    }
}

fn required_env(key: &str) -> Result<String, BusError> {
    env::var(key).map_err(|_| BusError::InvalidConfig(format!("missing {key}")))
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
