// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module declares exchanges, queues and the bindings between them on an
//! open [`Session`].
//!
//! Installation is a single fallible pipeline: exchanges first, then queues,
//! then bindings. The first failing step aborts the install and is reported as
//! an [`AmqpError::TopologyError`] naming that step, so nothing is ever bound
//! to a queue or exchange that failed to declare.

use crate::{
    channel::Session,
    errors::{AmqpError, TopologyStep},
    exchange::ExchangeDefinition,
    otel::{self, TraceLayer},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use opentelemetry::{
    trace::{Span, Status},
    Context,
};
use std::borrow::Cow;
use tracing::{debug, error};

/// Trait defining the interface for topology management.
#[async_trait]
pub trait Topology<'tp> {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: &'tp ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: &'tp QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: &'tp QueueBinding) -> Self;

    /// Declares every exchange, then every queue, then every binding,
    /// stopping at the first failure.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the Topology trait, bound to one session.
pub struct AmqpTopology<'tp> {
    session: &'tp dyn Session,
    pub(crate) exchanges: Vec<&'tp ExchangeDefinition>,
    pub(crate) queues: Vec<&'tp QueueDefinition>,
    pub(crate) queues_binding: Vec<&'tp QueueBinding>,
}

impl<'tp> AmqpTopology<'tp> {
    pub fn new(session: &'tp dyn Session) -> AmqpTopology<'tp> {
        AmqpTopology {
            session,
            exchanges: vec![],
            queues: vec![],
            queues_binding: vec![],
        }
    }
}

#[async_trait]
impl<'tp> Topology<'tp> for AmqpTopology<'tp> {
    fn exchange(mut self, def: &'tp ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: &'tp QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: &'tp QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    async fn install(&self) -> Result<(), AmqpError> {
        let mut span = otel::start_span(TraceLayer::Topology, "install", &Context::current());

        let result = self.install_steps().await;
        if let Err(err) = &result {
            span.record_error(err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });
        } else {
            span.set_status(Status::Ok);
        }
        span.end();

        result
    }
}

impl<'tp> AmqpTopology<'tp> {
    async fn install_steps(&self) -> Result<(), AmqpError> {
        self.install_exchange().await?;
        self.install_queue().await?;
        self.binding_queues().await
    }

    async fn install_exchange(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);

            if let Err(err) = self.session.declare_exchange(exch).await {
                error!(
                    error = err.to_string(),
                    name = %exch.name,
                    "error to declare the exchange"
                );
                return Err(AmqpError::topology(
                    TopologyStep::DeclareExchange(exch.name.clone()),
                    err,
                ));
            }

            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    async fn install_queue(&self) -> Result<(), AmqpError> {
        for def in &self.queues {
            debug!("creating queue: {}", def.name);

            if let Err(err) = self.session.declare_queue(def).await {
                error!(
                    error = err.to_string(),
                    name = %def.name,
                    "error to declare the queue"
                );
                return Err(AmqpError::topology(
                    TopologyStep::DeclareQueue(def.name.clone()),
                    err,
                ));
            }

            debug!("queue: {} was created", def.name);
        }

        Ok(())
    }

    async fn binding_queues(&self) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );

            if let Err(err) = self.session.bind_queue(binding).await {
                error!(error = err.to_string(), "error to bind queue to exchange");
                return Err(AmqpError::topology(
                    TopologyStep::BindQueue {
                        queue: binding.queue_name.clone(),
                        exchange: binding.exchange_name.clone(),
                        routing_key: binding.routing_key.clone(),
                    },
                    err,
                ));
            }
        }

        debug!("queues were bound");

        Ok(())
    }
}

/// Declares `exchange`, then `queue`, then `binding` on `session`.
pub async fn declare(
    session: &dyn Session,
    exchange: &ExchangeDefinition,
    queue: &QueueDefinition,
    binding: &QueueBinding,
) -> Result<(), AmqpError> {
    AmqpTopology::new(session)
        .exchange(exchange)
        .queue(queue)
        .queue_binding(binding)
        .install()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{channel::MockSession, errors::BrokerError};

    fn orders() -> (ExchangeDefinition, QueueDefinition, QueueBinding) {
        (
            ExchangeDefinition::new("orders").durable(),
            QueueDefinition::new("orders.q"),
            QueueBinding::new("orders.q").exchange("orders").routing_key("new"),
        )
    }

    #[tokio::test]
    async fn declares_every_step_in_order() {
        let (exchange, queue, binding) = orders();
        let mut session = MockSession::new();
        let mut seq = mockall::Sequence::new();

        session
            .expect_declare_exchange()
            .withf(|def| def.name() == "orders" && def.is_durable())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        session
            .expect_declare_queue()
            .withf(|def| def.name() == "orders.q")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        session
            .expect_bind_queue()
            .withf(|b| b.exchange_name() == "orders" && b.key() == "new")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        assert_eq!(declare(&session, &exchange, &queue, &binding).await, Ok(()));
    }

    #[tokio::test]
    async fn exchange_failure_stops_before_queue() {
        let (exchange, queue, binding) = orders();
        let mut session = MockSession::new();

        session
            .expect_declare_exchange()
            .returning(|_| Err(BrokerError::new("PRECONDITION_FAILED")));
        session.expect_declare_queue().never();
        session.expect_bind_queue().never();

        let result = declare(&session, &exchange, &queue, &binding).await;

        assert_eq!(
            result,
            Err(AmqpError::TopologyError {
                step: TopologyStep::DeclareExchange("orders".to_owned()),
                reason: "PRECONDITION_FAILED".to_owned(),
            })
        );
    }

    #[tokio::test]
    async fn queue_failure_stops_before_binding() {
        let (exchange, queue, binding) = orders();
        let mut session = MockSession::new();

        session.expect_declare_exchange().returning(|_| Ok(()));
        session
            .expect_declare_queue()
            .returning(|_| Err(BrokerError::new("RESOURCE_LOCKED")));
        session.expect_bind_queue().never();

        let result = declare(&session, &exchange, &queue, &binding).await;

        assert!(matches!(
            result,
            Err(AmqpError::TopologyError {
                step: TopologyStep::DeclareQueue(ref name),
                ..
            }) if name == "orders.q"
        ));
    }

    #[tokio::test]
    async fn binding_failure_names_the_binding() {
        let (exchange, queue, binding) = orders();
        let mut session = MockSession::new();

        session.expect_declare_exchange().returning(|_| Ok(()));
        session.expect_declare_queue().returning(|_| Ok(()));
        session
            .expect_bind_queue()
            .returning(|_| Err(BrokerError::new("NOT_FOUND")));

        let result = declare(&session, &exchange, &queue, &binding).await;

        assert_eq!(
            result,
            Err(AmqpError::TopologyError {
                step: TopologyStep::BindQueue {
                    queue: "orders.q".to_owned(),
                    exchange: "orders".to_owned(),
                    routing_key: "new".to_owned(),
                },
                reason: "NOT_FOUND".to_owned(),
            })
        );
    }
}
