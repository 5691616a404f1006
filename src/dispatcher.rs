// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Agent Handler Registry and Consumer Loop
//!
//! Holds at most one handler per agent type, together with the consumer task
//! feeding it. The registry outlives broker connections: after a reconnect the
//! bus walks it to start every consumer again.
//!
//! Each delivery is handled on its own task, so up to `prefetch_count`
//! handler invocations of one agent run concurrently.

use crate::{
    broker::DeliveryStream,
    bus::BusInner,
    consumer::{consume, Outcome},
    errors::BusError,
    message::{AgentMessage, AgentType},
    otel,
    retry::RetryPolicy,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use opentelemetry::{global, Context};
use std::{
    future::Future,
    sync::{Arc, Weak},
};
use tokio::task::JoinHandle;
use tracing::{debug, error};

const AGENT_COUNT: usize = AgentType::ALL.len();

/// Business logic of an agent.
///
/// Returning an error schedules a redelivery, up to the bus retry budget.
/// Handlers may run concurrently and must tolerate redeliveries and reordering.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    async fn handle(&self, ctx: &Context, message: AgentMessage) -> Result<(), BusError>;
}

#[async_trait]
impl<F, Fut> AgentHandler for F
where
    F: Fn(AgentMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BusError>> + Send + 'static,
{
    async fn handle(&self, _ctx: &Context, message: AgentMessage) -> Result<(), BusError> {
        (self)(message).await
    }
}

/// A running consumer bound to one broker connection.
pub(crate) struct ActiveConsumer {
    pub(crate) tag: String,
    pub(crate) generation: u64,
    task: JoinHandle<()>,
}

impl ActiveConsumer {
    pub(crate) fn new(tag: String, generation: u64, task: JoinHandle<()>) -> Self {
        ActiveConsumer {
            tag,
            generation,
            task,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub(crate) fn stop(&self) {
        self.task.abort();
    }
}

struct Subscription {
    handler: Arc<dyn AgentHandler>,
    consumer: Option<ActiveConsumer>,
}

/// One slot per agent type.
pub(crate) struct HandlerRegistry {
    slots: [Option<Subscription>; AGENT_COUNT],
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        HandlerRegistry {
            slots: std::array::from_fn(|_| None),
        }
    }
}

impl HandlerRegistry {
    /// Sets the handler of `agent`, returning the consumer of the handler it
    /// replaces.
    pub(crate) fn register(
        &mut self,
        agent: AgentType,
        handler: Arc<dyn AgentHandler>,
    ) -> Option<ActiveConsumer> {
        self.slots[agent.index()]
            .replace(Subscription {
                handler,
                consumer: None,
            })
            .and_then(|previous| previous.consumer)
    }

    /// Records the consumer of `agent`. Hands the consumer back when the agent
    /// has no handler any more.
    pub(crate) fn attach(
        &mut self,
        agent: AgentType,
        consumer: ActiveConsumer,
    ) -> Option<ActiveConsumer> {
        match self.slots[agent.index()].as_mut() {
            Some(subscription) => subscription.consumer.replace(consumer),
            None => Some(consumer),
        }
    }

    /// Takes the consumer of `agent`, keeping its handler.
    pub(crate) fn detach(&mut self, agent: AgentType) -> Option<ActiveConsumer> {
        self.slots[agent.index()]
            .as_mut()
            .and_then(|subscription| subscription.consumer.take())
    }

    /// Drops the handler of `agent`, returning its consumer.
    pub(crate) fn remove(&mut self, agent: AgentType) -> Option<ActiveConsumer> {
        self.slots[agent.index()]
            .take()
            .and_then(|subscription| subscription.consumer)
    }

    pub(crate) fn handler(&self, agent: AgentType) -> Option<Arc<dyn AgentHandler>> {
        self.slots[agent.index()]
            .as_ref()
            .map(|subscription| subscription.handler.clone())
    }

    pub(crate) fn subscriptions(&self) -> Vec<(AgentType, Arc<dyn AgentHandler>)> {
        AgentType::ALL
            .into_iter()
            .filter_map(|agent| self.handler(agent).map(|handler| (agent, handler)))
            .collect()
    }

    pub(crate) fn agents(&self) -> Vec<AgentType> {
        AgentType::ALL
            .into_iter()
            .filter(|agent| self.slots[agent.index()].is_some())
            .collect()
    }

    pub(crate) fn is_consuming(&self, agent: AgentType) -> bool {
        self.slots[agent.index()]
            .as_ref()
            .and_then(|subscription| subscription.consumer.as_ref())
            .is_some_and(ActiveConsumer::is_running)
    }

    /// Drops every handler, returning their consumers.
    pub(crate) fn clear(&mut self) -> Vec<ActiveConsumer> {
        self.slots
            .iter_mut()
            .filter_map(|slot| slot.take().and_then(|subscription| subscription.consumer))
            .collect()
    }
}

/// Consumer tag of an agent queue.
pub(crate) fn consumer_tag(queue: &str) -> String {
    format!("{queue}.consumer")
}

/// Drains a consumer stream, handling every delivery on its own task.
pub(crate) fn spawn_consumer(
    mut stream: DeliveryStream,
    agent: AgentType,
    queue: String,
    handler: Arc<dyn AgentHandler>,
    bus: Weak<BusInner>,
    policy: RetryPolicy,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(result) = stream.next().await {
            match result {
                Ok(delivery) => {
                    let handler = handler.clone();
                    let bus = bus.clone();
                    let queue = queue.clone();

                    tokio::spawn(async move {
                        let tracer = global::tracer(otel::TRACER_NAME);
                        match consume(&tracer, &delivery, agent, handler.as_ref(), &policy).await {
                            Ok(Outcome::Retry {
                                message,
                                delay,
                                ctx,
                            }) => {
                                if let Some(bus) = bus.upgrade() {
                                    bus.schedule_retry(ctx, queue, message, delay);
                                }
                            }
                            Ok(_) => {}
                            Err(err) => error!(error = err.to_string(), "error consume msg"),
                        }
                    });
                }

                Err(err) => error!(error = err.to_string(), "errors consume msg"),
            }
        }

        debug!(agent = agent.as_str(), queue = queue.as_str(), "consumer stream closed");
    })
}
