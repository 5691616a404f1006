// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Agent Message Bus
//!
//! `BusError` covers every failure the bus can observe: dialing the broker,
//! declaring topology, publishing, consuming and running agent handlers.
//! Connection failures after the initial connect never reach callers; they are
//! logged and absorbed by the reconnection supervisor.

use thiserror::Error;

/// Represents errors that can occur while operating the message bus.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Error establishing a connection to the broker
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Operation attempted before `connect` resolved or while reconnecting
    #[error("message bus is not connected")]
    NotConnected,

    /// The configuration failed validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// Error declaring or cancelling a consumer
    #[error("consumer declaration error `{0}`")]
    ConsumerDeclarationError(String),

    /// Error receiving a delivery from a consumer stream
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// An agent handler reported a failure
    #[error("handler failed: {0}")]
    HandlerError(String),
}

impl BusError {
    /// Shorthand for handlers reporting a failure.
    pub fn handler(reason: impl Into<String>) -> Self {
        BusError::HandlerError(reason.into())
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        BusError::ParsePayloadError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_errors_map_to_parse_failures() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(BusError::from(err), BusError::ParsePayloadError(_)));
    }

    #[test]
    fn binding_error_names_both_sides() {
        let err = BusError::BindingExchangeToQueueError("agents".into(), "agent.publisher".into());
        assert_eq!(
            err.to_string(),
            "failure to bind exchange `agents` to queue `agent.publisher`"
        );
    }
}
