// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Each publish call serializes the payload to JSON, opens its own session,
//! sends a single message and releases the session again, whatever the
//! outcome. Publishing declares nothing: the exchange, and the queues bound to
//! it, must already exist. There is no retry.

use crate::{
    channel::{BrokerAddress, Connector, OutgoingMessage, Session},
    errors::AmqpError,
    otel::{self, TraceLayer},
};
use opentelemetry::{
    trace::{Span, Status, TraceContextExt},
    Context,
};
use serde::Serialize;
use std::{borrow::Cow, collections::BTreeMap, sync::Arc};
use tracing::{debug, error};
use uuid::Uuid;

/// Content type of every published message.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Publishes JSON messages to RabbitMQ exchanges.
///
/// Every call opens its own session and releases it before returning, so a
/// publisher can be shared freely between tasks.
pub struct RabbitMQPublisher {
    connector: Arc<dyn Connector>,
    address: BrokerAddress,
}

impl RabbitMQPublisher {
    /// Creates a new publisher.
    ///
    /// # Parameters
    /// * `connector` - Opens a session for every publish
    /// * `address` - The broker to publish to
    ///
    /// # Returns
    /// A new publisher
    pub fn new(connector: Arc<dyn Connector>, address: BrokerAddress) -> RabbitMQPublisher {
        RabbitMQPublisher { connector, address }
    }

    /// Publishes `payload` to `exchange` under `routing_key`.
    ///
    /// Serialization failures are reported before any connection is opened.
    /// Messages the exchange cannot route are dropped by the broker and still
    /// count as a successful publish. Nothing is retried.
    ///
    /// # Parameters
    /// * `ctx` - Trace context propagated in the message headers
    /// * `exchange` - The exchange to publish to
    /// * `routing_key` - The routing key
    /// * `payload` - The value to encode as JSON
    ///
    /// # Returns
    /// `Ok(())` once the broker accepted the message, otherwise a
    /// `SerializationError`, `ConnectionError` or `PublishError`
    pub async fn publish<T>(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        payload: &T,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(payload).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize payload");
            AmqpError::SerializationError(err.to_string())
        })?;

        let mut span = otel::start_span(TraceLayer::Publisher, exchange, ctx);
        let span_ctx = ctx.with_remote_span_context(span.span_context().clone());

        let mut headers = BTreeMap::new();
        otel::inject_context(&span_ctx, &mut headers);

        let message = OutgoingMessage {
            body,
            content_type: JSON_CONTENT_TYPE.to_owned(),
            message_id: Uuid::new_v4().to_string(),
            headers,
        };

        let result = self.send(exchange, routing_key, &message).await;
        match &result {
            Ok(()) => {
                debug!(
                    exchange = exchange,
                    routing_key = routing_key,
                    body = %String::from_utf8_lossy(&message.body),
                    "message sent"
                );
                span.set_status(Status::Ok);
            }
            Err(err) => {
                span.record_error(err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
            }
        }
        span.end();

        result
    }

    async fn send(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutgoingMessage,
    ) -> Result<(), AmqpError> {
        let session = self.connector.open(&self.address).await?;

        let result = publish_on(session.as_ref(), exchange, routing_key, message).await;

        if let Err(err) = session.close().await {
            debug!(error = err.to_string(), "error closing publisher session");
        }

        result
    }
}

async fn publish_on(
    session: &dyn Session,
    exchange: &str,
    routing_key: &str,
    message: &OutgoingMessage,
) -> Result<(), AmqpError> {
    match session.publish(exchange, routing_key, message).await {
        Err(err) => {
            error!(error = err.to_string(), "error publishing message");
            Err(AmqpError::PublishError(err.to_string()))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{MockConnector, MockSession},
        errors::BrokerError,
    };
    use std::collections::HashMap;

    #[derive(Serialize)]
    struct Order {
        id: u32,
    }

    fn publisher(connector: MockConnector) -> RabbitMQPublisher {
        RabbitMQPublisher::new(Arc::new(connector), BrokerAddress::new("amqp://local"))
    }

    #[tokio::test]
    async fn sends_json_and_releases_the_session() {
        let mut connector = MockConnector::new();
        connector.expect_open().times(1).returning(|_| {
            let mut session = MockSession::new();
            session
                .expect_publish()
                .withf(|exchange, key, msg| {
                    exchange == "orders"
                        && key == "new"
                        && msg.body == br#"{"id":1}"#
                        && msg.content_type == JSON_CONTENT_TYPE
                })
                .times(1)
                .returning(|_, _, _| Ok(()));
            session.expect_close().times(1).returning(|| Ok(()));
            Ok(Box::new(session) as Box<dyn Session>)
        });

        let result = publisher(connector)
            .publish(&Context::new(), "orders", "new", &Order { id: 1 })
            .await;

        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn serialization_failure_never_connects() {
        let mut connector = MockConnector::new();
        connector.expect_open().never();

        let payload: HashMap<(u8, u8), u8> = HashMap::from([((1, 2), 3)]);
        let result = publisher(connector)
            .publish(&Context::new(), "orders", "new", &payload)
            .await;

        assert!(matches!(result, Err(AmqpError::SerializationError(_))));
    }

    #[tokio::test]
    async fn broker_rejection_is_a_publish_error_and_still_closes() {
        let mut connector = MockConnector::new();
        connector.expect_open().returning(|_| {
            let mut session = MockSession::new();
            session
                .expect_publish()
                .returning(|_, _, _| Err(BrokerError::new("NOT_FOUND - no exchange 'orders'")));
            session.expect_close().times(1).returning(|| Ok(()));
            Ok(Box::new(session) as Box<dyn Session>)
        });

        let result = publisher(connector)
            .publish(&Context::new(), "orders", "new", &Order { id: 1 })
            .await;

        assert_eq!(
            result,
            Err(AmqpError::PublishError(
                "NOT_FOUND - no exchange 'orders'".to_owned()
            ))
        );
    }

    #[tokio::test]
    async fn connection_failure_is_returned() {
        let mut connector = MockConnector::new();
        connector
            .expect_open()
            .returning(|_| Err(AmqpError::ConnectionError("refused".to_owned())));

        let result = publisher(connector)
            .publish(&Context::new(), "orders", "new", &Order { id: 1 })
            .await;

        assert_eq!(result, Err(AmqpError::ConnectionError("refused".to_owned())));
    }
}
