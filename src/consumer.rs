// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! Dispatch of one received message through a handler chain. The message was
//! acknowledged when the broker handed it over, so nothing here acks, nacks or
//! requeues: handler failures are reported and the chain moves on.

use crate::{
    channel::Delivery,
    errors::AmqpError,
    handler::{ConsumerMessage, HandlerChain},
    otel,
    reporter::DispatchReporter,
};
use opentelemetry::trace::{Span, Status, TraceContextExt};
use std::borrow::Cow;
use tracing::debug;

/// Runs every handler of `handlers`, in order, on `delivery`.
///
/// Returns how many handlers failed.
pub(crate) async fn consume(
    delivery: &Delivery,
    queue: &str,
    handlers: &HandlerChain,
    reporter: &dyn DispatchReporter,
) -> usize {
    let (ctx, mut span) = otel::new_consumer_span(&delivery.headers, queue);
    let ctx = ctx.with_remote_span_context(span.span_context().clone());

    debug!(
        queue = queue,
        exchange = %delivery.exchange,
        routing_key = %delivery.routing_key,
        body = %String::from_utf8_lossy(&delivery.body),
        "received message"
    );

    let msg = ConsumerMessage {
        queue,
        exchange: &delivery.exchange,
        routing_key: &delivery.routing_key,
        content_type: delivery.content_type.as_deref(),
        body: &delivery.body,
    };

    let mut failures = 0;
    for (index, handler) in handlers.iter().enumerate() {
        if let Err(err) = handler.exec(&ctx, &msg).await {
            let err = AmqpError::HandlerError {
                handler: index,
                reason: err.to_string(),
            };
            span.record_error(&err);
            reporter.report(&format!("handle message from `{}`", queue), &err);
            failures += 1;
        }
    }

    if failures == 0 {
        debug!("message successfully processed");
        span.set_status(Status::Ok);
    } else {
        span.set_status(Status::Error {
            description: Cow::from(format!("{} handler(s) failed", failures)),
        });
    }
    span.end();

    failures
}
