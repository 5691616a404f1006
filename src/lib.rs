// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod consumer;
mod otel;
mod supervisor;

pub mod amqp;
pub mod broker;
pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod memory;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod routing;
pub mod topology;

pub use amqp::AmqpTransport;
pub use bus::MessageBus;
pub use config::MessageBusConfig;
pub use dispatcher::AgentHandler;
pub use errors::BusError;
pub use memory::MemoryBroker;
pub use message::{AgentMessage, AgentType, MessageType, Target};
