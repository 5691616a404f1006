// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Agent Message Publisher
//!
//! Serializes `AgentMessage`s to JSON and publishes them persistently to the
//! shared topic exchange. The message id, type, priority and timestamp are
//! mirrored into AMQP properties so the broker and tooling can read them
//! without parsing the body.

use crate::{broker::BrokerChannel, errors::BusError, message::AgentMessage, otel, routing};
use lapin::{
    types::{AMQPValue, FieldTable, LongUInt, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Header carrying the delivery attempt a retried message is on
pub const AMQP_HEADERS_RETRY_COUNT: &str = "x-retry-count";
/// AMQP delivery mode marking a message as persistent
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Publishes agent messages on one channel.
pub struct AgentPublisher {
    channel: Arc<dyn BrokerChannel>,
    exchange: String,
}

impl AgentPublisher {
    pub fn new(channel: Arc<dyn BrokerChannel>, exchange: &str) -> AgentPublisher {
        AgentPublisher {
            channel,
            exchange: exchange.to_owned(),
        }
    }

    /// Publishes a message to the topic exchange under its computed routing key.
    pub async fn publish(&self, ctx: &Context, message: &AgentMessage) -> Result<(), BusError> {
        let key = routing::routing_key(message);
        let body = encode(message)?;

        self.channel
            .publish(&self.exchange, &key, &body, properties(ctx, message, None))
            .await?;

        debug!(
            message_id = message.id.as_str(),
            routing_key = key.as_str(),
            "message published"
        );
        Ok(())
    }

    /// Publishes a retry of `message` straight to `queue` through the default
    /// exchange, so a broadcast is not fanned out again.
    pub async fn republish(
        &self,
        ctx: &Context,
        queue: &str,
        message: &AgentMessage,
    ) -> Result<(), BusError> {
        let body = encode(message)?;

        self.channel
            .publish("", queue, &body, properties(ctx, message, Some(message.retry_count)))
            .await?;

        debug!(
            message_id = message.id.as_str(),
            queue,
            retry_count = message.retry_count,
            "message republished for retry"
        );
        Ok(())
    }
}

fn encode(message: &AgentMessage) -> Result<Vec<u8>, BusError> {
    serde_json::to_vec(message).map_err(|err| {
        error!(error = err.to_string(), "error serializing message");
        BusError::from(err)
    })
}

/// Builds the AMQP properties of a message.
pub(crate) fn properties(
    ctx: &Context,
    message: &AgentMessage,
    retry_count: Option<u32>,
) -> BasicProperties {
    let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
    otel::inject(ctx, &mut headers);

    if let Some(count) = retry_count {
        headers.insert(
            ShortString::from(AMQP_HEADERS_RETRY_COUNT),
            AMQPValue::LongUInt(LongUInt::from(count)),
        );
    }

    BasicProperties::default()
        .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
        .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
        .with_message_id(ShortString::from(message.id.clone()))
        .with_type(ShortString::from(message.kind.as_str()))
        .with_priority(message.priority)
        .with_timestamp(message.timestamp.timestamp().max(0) as u64)
        .with_headers(FieldTable::from(headers))
}
