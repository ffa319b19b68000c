// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! A [`HandlerChain`] is the ordered list of callbacks a consumer runs for
//! every message it receives. Handlers are invoked in registration order and
//! a failing handler never prevents the next one from running.

use async_trait::async_trait;
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// Error returned by a handler. Any error type can be boxed into it.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A message as seen by handlers.
#[derive(Debug, Clone, Copy)]
pub struct ConsumerMessage<'m> {
    pub queue: &'m str,
    pub exchange: &'m str,
    pub routing_key: &'m str,
    pub content_type: Option<&'m str>,
    pub body: &'m [u8],
}

impl ConsumerMessage<'_> {
    /// Decodes the JSON body.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        Ok(serde_json::from_slice(self.body)?)
    }
}

#[async_trait]
/// A callback run for every message a consumer receives.
///
/// Returning an error never stops the consumer; it is reported and the next
/// handler runs.
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage<'_>) -> Result<(), HandlerError>;
}

/// Plain functions over the message body are handlers too.
#[async_trait]
impl<F> ConsumerHandler for F
where
    F: Fn(&[u8]) -> Result<(), HandlerError> + Send + Sync,
{
    async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage<'_>) -> Result<(), HandlerError> {
        (self)(msg.body)
    }
}

#[derive(Clone, Default)]
/// Handlers invoked in registration order.
pub struct HandlerChain {
    handlers: Vec<Arc<dyn ConsumerHandler>>,
}

impl HandlerChain {
    pub fn new() -> Self {
        HandlerChain::default()
    }

    /// Appends `handler` to the end of the chain.
    pub fn handler<H>(mut self, handler: H) -> Self
    where
        H: ConsumerHandler + 'static,
    {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Appends a function over the raw message body.
    pub fn handler_fn<F>(self, f: F) -> Self
    where
        F: Fn(&[u8]) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.handler(f)
    }

    /// Appends an already shared handler.
    pub fn push(&mut self, handler: Arc<dyn ConsumerHandler>) {
        self.handlers.push(handler);
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<dyn ConsumerHandler>> {
        self.handlers.iter()
    }
}

impl FromIterator<Arc<dyn ConsumerHandler>> for HandlerChain {
    fn from_iter<I: IntoIterator<Item = Arc<dyn ConsumerHandler>>>(iter: I) -> Self {
        HandlerChain {
            handlers: iter.into_iter().collect(),
        }
    }
}
