// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for RabbitMQ Implementation
//!
//! `AmqpError` is the taxonomy every public operation reports: connection
//! failures, topology declaration failures tagged with the failing step,
//! payload serialization failures, publish failures, handler failures and
//! consumer subscription failures.
//!
//! `BrokerError` is the lower level failure returned by a transport
//! [`Session`](crate::channel::Session); the components convert it into an
//! `AmqpError` at the step where it happened.

use std::fmt;
use thiserror::Error;

/// The topology step that failed while declaring exchanges, queues and bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyStep {
    /// Declaring the exchange with the given name.
    DeclareExchange(String),
    /// Declaring the queue with the given name.
    DeclareQueue(String),
    /// Binding `queue` to `exchange` under `routing_key`.
    BindQueue {
        queue: String,
        exchange: String,
        routing_key: String,
    },
}

impl fmt::Display for TopologyStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyStep::DeclareExchange(name) => write!(f, "declare exchange `{}`", name),
            TopologyStep::DeclareQueue(name) => write!(f, "declare queue `{}`", name),
            TopologyStep::BindQueue {
                queue,
                exchange,
                routing_key,
            } => write!(
                f,
                "bind queue `{}` to exchange `{}` with key `{}`",
                queue, exchange, routing_key
            ),
        }
    }
}

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// The broker address is malformed, or the connection or its channel
    /// could not be established.
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// A topology step failed. The remaining steps were not attempted.
    #[error("failure to {step}: {reason}")]
    TopologyError { step: TopologyStep, reason: String },

    /// The payload could not be encoded. Nothing was sent.
    #[error("failure to serialize payload: {0}")]
    SerializationError(String),

    /// The broker rejected or failed to acknowledge the publish attempt.
    #[error("failure to publish: {0}")]
    PublishError(String),

    /// A registered handler failed on one message.
    #[error("handler #{handler} failed: {reason}")]
    HandlerError { handler: usize, reason: String },

    /// The consumer could not subscribe, or its delivery stream broke.
    #[error("failure to consume `{0}`")]
    ConsumerError(String),
}

impl AmqpError {
    pub(crate) fn topology(step: TopologyStep, err: impl ToString) -> Self {
        AmqpError::TopologyError {
            step,
            reason: err.to_string(),
        }
    }
}

/// Failure reported by the broker, or by the transport talking to it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct BrokerError(pub String);

impl BrokerError {
    pub fn new(msg: impl Into<String>) -> Self {
        BrokerError(msg.into())
    }
}

impl From<lapin::Error> for BrokerError {
    fn from(err: lapin::Error) -> Self {
        BrokerError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topology_error_names_the_failing_step() {
        let err = AmqpError::topology(
            TopologyStep::BindQueue {
                queue: "orders.q".to_owned(),
                exchange: "orders".to_owned(),
                routing_key: "new".to_owned(),
            },
            BrokerError::new("NOT_FOUND - no exchange 'orders'"),
        );

        assert_eq!(
            err.to_string(),
            "failure to bind queue `orders.q` to exchange `orders` with key `new`: NOT_FOUND - no exchange 'orders'"
        );
    }

    #[test]
    fn handler_error_carries_the_handler_position() {
        let err = AmqpError::HandlerError {
            handler: 1,
            reason: "boom".to_owned(),
        };

        assert_eq!(err.to_string(), "handler #1 failed: boom");
    }
}
