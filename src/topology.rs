// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Bus Topology
//!
//! Declares the exchanges, queues and bindings the bus relies on:
//! - the shared durable topic exchange
//! - one durable queue per agent type, bound for direct, broadcast and
//!   type-keyed addressing, dead-lettering into the DLX
//! - the dead-letter exchange and its catch-all queue
//!
//! Declarations are idempotent, so the same topology is installed again after
//! every reconnect.

use crate::{
    broker::BrokerChannel,
    config::MessageBusConfig,
    errors::BusError,
    exchange::ExchangeDefinition,
    message::AgentType,
    queue::{QueueBinding, QueueDefinition},
    routing,
};
use std::sync::Arc;
use tracing::debug;

/// Pattern binding the dead-letter queue to every routing key.
pub const DEAD_LETTER_PATTERN: &str = "#";

/// A set of exchanges, queues and bindings installed in one go.
pub struct AmqpTopology {
    channel: Arc<dyn BrokerChannel>,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl AmqpTopology {
    pub fn new(channel: Arc<dyn BrokerChannel>) -> AmqpTopology {
        AmqpTopology {
            channel,
            exchanges: vec![],
            queues: vec![],
            queues_binding: vec![],
        }
    }

    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Creates the exchanges, then the queues, then the bindings.
    pub async fn install(&self) -> Result<(), BusError> {
        self.install_exchange().await?;
        self.install_queue().await?;
        self.binding_queues().await
    }

    async fn install_exchange(&self) -> Result<(), BusError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);
            self.channel.declare_exchange(exch).await?;
            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    async fn install_queue(&self) -> Result<(), BusError> {
        for def in &self.queues {
            debug!("creating queue: {}", def.name);
            self.channel.declare_queue(def).await?;
            debug!("queue: {} was created", def.name);
        }

        Ok(())
    }

    async fn binding_queues(&self) -> Result<(), BusError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );
            self.channel.bind_queue(binding).await?;
        }

        Ok(())
    }
}

/// The shared topic exchange agent messages are published to.
pub fn main_exchange(cfg: &MessageBusConfig) -> ExchangeDefinition {
    ExchangeDefinition::new(&cfg.exchange_name).topic().durable()
}

/// The durable queue of an agent type.
pub fn agent_queue(cfg: &MessageBusConfig, agent: AgentType) -> QueueDefinition {
    QueueDefinition::new(&routing::queue_name(agent))
        .durable()
        .dead_letter_to(&cfg.dead_letter_exchange())
        .ttl(cfg.queue_message_ttl)
}

/// The three bindings of an agent queue.
pub fn agent_bindings(cfg: &MessageBusConfig, agent: AgentType) -> Vec<QueueBinding> {
    let queue = routing::queue_name(agent);
    routing::binding_patterns(agent)
        .iter()
        .map(|pattern| {
            QueueBinding::new(&queue)
                .exchange(&cfg.exchange_name)
                .routing_key(pattern)
        })
        .collect()
}

/// Declares the shared topic exchange.
pub async fn install_main_exchange(
    channel: Arc<dyn BrokerChannel>,
    cfg: &MessageBusConfig,
) -> Result<(), BusError> {
    AmqpTopology::new(channel)
        .exchange(main_exchange(cfg))
        .install()
        .await
}

/// Declares and binds the queue of an agent type, returning its name.
pub async fn install_agent_queue(
    channel: Arc<dyn BrokerChannel>,
    cfg: &MessageBusConfig,
    agent: AgentType,
) -> Result<String, BusError> {
    let def = agent_queue(cfg, agent);
    let name = def.name.clone();

    let mut topology = AmqpTopology::new(channel).queue(def);
    for binding in agent_bindings(cfg, agent) {
        topology = topology.queue_binding(binding);
    }
    topology.install().await?;

    Ok(name)
}

/// Declares the dead-letter exchange and its catch-all queue.
pub async fn install_dead_letter(
    channel: Arc<dyn BrokerChannel>,
    cfg: &MessageBusConfig,
) -> Result<(), BusError> {
    let exchange = cfg.dead_letter_exchange();
    let queue = cfg.dead_letter_queue();

    AmqpTopology::new(channel)
        .exchange(ExchangeDefinition::new(&exchange).topic().durable())
        .queue(QueueDefinition::new(&queue).durable())
        .queue_binding(
            QueueBinding::new(&queue)
                .exchange(&exchange)
                .routing_key(DEAD_LETTER_PATTERN),
        )
        .install()
        .await
}
