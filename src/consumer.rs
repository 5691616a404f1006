// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Pipeline
//!
//! Settles each delivery handed to an agent:
//! 1. Decodes the JSON body and reads the attempt from `x-retry-count`
//! 2. Opens a consumer span continuing the producer's trace
//! 3. Runs the agent handler
//! 4. Acks on success
//! 5. On failure, removes the delivery and asks for a delayed republish while
//!    the retry budget lasts, otherwise rejects it into the dead-letter exchange
//!
//! Malformed bodies are rejected into the dead-letter exchange right away.

use crate::{
    broker::Delivery,
    dispatcher::AgentHandler,
    errors::BusError,
    message::{AgentMessage, AgentType},
    otel,
    publisher::AMQP_HEADERS_RETRY_COUNT,
    retry::RetryPolicy,
};
use lapin::{protocol::basic::AMQPProperties, types::AMQPValue};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
    Context,
};
use std::{borrow::Cow, time::Duration};
use tracing::{debug, error, warn};

/// How a delivery was settled.
#[derive(Debug, Clone)]
pub(crate) enum Outcome {
    Acked,
    /// Removed from the queue; `message` must be republished after `delay`
    /// under the trace of `ctx`.
    Retry {
        message: AgentMessage,
        delay: Duration,
        ctx: Context,
    },
    DeadLettered,
}

/// Runs one delivery through the agent handler and settles it.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: &Delivery,
    agent: AgentType,
    handler: &dyn AgentHandler,
    policy: &RetryPolicy,
) -> Result<Outcome, BusError> {
    let retry_count = retry_count(&delivery.properties);
    let msg_type = delivery
        .properties
        .kind()
        .as_ref()
        .map(|kind| kind.to_string())
        .unwrap_or_default();

    let (ctx, mut span) = otel::new_span(&delivery.properties, tracer, &msg_type);

    debug!(
        agent = agent.as_str(),
        routing_key = delivery.routing_key.as_str(),
        retry_count,
        "received: {}",
        msg_type
    );

    let mut message = match serde_json::from_slice::<AgentMessage>(&delivery.data) {
        Ok(message) => message,
        Err(err) => {
            let err = BusError::from(err);
            error!(
                error = err.to_string(),
                agent = agent.as_str(),
                "malformed message, sending to dlq"
            );
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("malformed payload"),
            });
            delivery.reject(false).await?;
            return Ok(Outcome::DeadLettered);
        }
    };
    message.retry_count = retry_count;

    let Err(err) = handler.handle(&ctx, message.clone()).await else {
        delivery.ack().await?;
        debug!(message_id = message.id.as_str(), "message successfully processed");
        span.set_status(Status::Ok);
        return Ok(Outcome::Acked);
    };

    span.record_error(&err);

    match policy.next_attempt(retry_count) {
        Some(next) => {
            let delay = policy.backoff(retry_count);
            warn!(
                error = err.to_string(),
                message_id = message.id.as_str(),
                retry_count = next,
                delay_ms = delay.as_millis() as u64,
                "error whiling handling msg, retrying later"
            );
            delivery.ack().await?;
            span.set_status(Status::Error {
                description: Cow::from("retry scheduled"),
            });

            message.retry_count = next;
            Ok(Outcome::Retry {
                message,
                delay,
                ctx,
            })
        }
        None => {
            error!(
                error = err.to_string(),
                message_id = message.id.as_str(),
                retry_count,
                "too many attempts, sending to dlq"
            );
            delivery.reject(false).await?;
            span.set_status(Status::Error {
                description: Cow::from("msg was sent to dlq"),
            });
            Ok(Outcome::DeadLettered)
        }
    }
}

/// Reads the attempt a delivery is on from the `x-retry-count` header.
pub(crate) fn retry_count(props: &AMQPProperties) -> u32 {
    let Some(value) = props
        .headers()
        .as_ref()
        .and_then(|headers| headers.inner().get(AMQP_HEADERS_RETRY_COUNT).cloned())
    else {
        return 0;
    };

    let count: i64 = match value {
        AMQPValue::ShortShortUInt(v) => v.into(),
        AMQPValue::ShortUInt(v) => v.into(),
        AMQPValue::LongUInt(v) => v.into(),
        AMQPValue::ShortShortInt(v) => v.into(),
        AMQPValue::ShortInt(v) => v.into(),
        AMQPValue::LongInt(v) => v.into(),
        AMQPValue::LongLongInt(v) => v,
        AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes())
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or_default(),
        _ => 0,
    };

    u32::try_from(count.max(0)).unwrap_or(u32::MAX)
}
