// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! A [`Connector`] that keeps exchanges, queues and bindings in process
//! memory and follows the broker rules the client depends on:
//!
//! - redeclaring with identical attributes is a no-op, any difference fails
//!   with `PRECONDITION_FAILED`;
//! - direct, fanout, topic (`*` and `#`) and headers exchanges route as the
//!   broker does, and the default exchange `""` routes to the queue named by
//!   the routing key;
//! - unroutable messages are dropped silently;
//! - messages wait in their queue until a consumer subscribes and are handed
//!   over, and forgotten, one consumer at a time;
//! - a channel-level failure closes the session's channel;
//! - exclusive queues belong to the declaring session, and exclusive or
//!   auto-delete queues go away with their owner or last consumer.
//!
//! It backs the crate's tests and is usable for local development.

use crate::{
    channel::{BrokerAddress, Connector, Delivery, DeliveryStream, OutgoingMessage, Session},
    errors::{AmqpError, BrokerError},
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

const DEFAULT_EXCHANGE: &str = "";

type DeliverySender = mpsc::UnboundedSender<Result<Delivery, BrokerError>>;

struct Subscriber {
    session: u64,
    tag: String,
    sender: DeliverySender,
}

struct QueueState {
    def: QueueDefinition,
    owner: u64,
    messages: VecDeque<Delivery>,
    consumers: Vec<Subscriber>,
    /// Set once a consumer subscribed; auto-delete only applies afterwards.
    consumed: bool,
}

impl QueueState {
    fn enqueue(&mut self, delivery: Delivery) {
        while !self.consumers.is_empty() {
            let subscriber = self.consumers.remove(0);
            if subscriber.sender.send(Ok(delivery.clone())).is_ok() {
                // round robin
                self.consumers.push(subscriber);
                return;
            }
        }

        self.messages.push_back(delivery);
    }
}

#[derive(Default)]
struct BrokerState {
    refuse_connections: bool,
    next_session: u64,
    connections_opened: usize,
    open_sessions: HashSet<u64>,
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<QueueBinding>,
    dropped: usize,
}

impl BrokerState {
    fn route(&self, exchange: &ExchangeDefinition, routing_key: &str) -> Vec<String> {
        let mut queues: Vec<String> = vec![];

        for binding in self
            .bindings
            .iter()
            .filter(|b| b.exchange_name == exchange.name)
        {
            let matched = match exchange.kind {
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Fanout | ExchangeKind::Headers => true,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
            };

            if matched && !queues.contains(&binding.queue_name) {
                queues.push(binding.queue_name.clone());
            }
        }

        queues
    }

    fn delete_queue(&mut self, name: &str) {
        debug!(queue = name, "deleting queue");
        self.queues.remove(name);

        let orphaned: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.queue_name == name)
            .map(|b| b.exchange_name.clone())
            .collect();
        self.bindings.retain(|b| b.queue_name != name);

        for exchange in orphaned {
            let auto_delete = self
                .exchanges
                .get(&exchange)
                .map(|e| e.delete)
                .unwrap_or(false);
            let unbound = !self.bindings.iter().any(|b| b.exchange_name == exchange);
            if auto_delete && unbound {
                debug!(exchange = %exchange, "deleting auto-delete exchange");
                self.exchanges.remove(&exchange);
            }
        }
    }

    fn release_session(&mut self, session: u64) {
        self.open_sessions.remove(&session);

        let mut doomed = vec![];
        for (name, queue) in self.queues.iter_mut() {
            queue.consumers.retain(|s| s.session != session);

            let owner_gone = queue.def.exclusive && queue.owner == session;
            let unused = queue.def.delete && queue.consumed && queue.consumers.is_empty();
            if owner_gone || unused {
                doomed.push(name.clone());
            }
        }

        for name in doomed {
            self.delete_queue(&name);
        }
    }
}

/// Matches a topic routing key against a binding pattern, where `*` stands
/// for exactly one word and `#` for zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern = words(pattern);
    let key = words(routing_key);

    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&word, rest)) => match key.split_first() {
                Some((&first, key_rest)) => (word == "*" || word == first) && matches(rest, key_rest),
                None => false,
            },
        }
    }

    matches(&pattern, &key)
}

/// An empty key has no words at all.
fn words(key: &str) -> Vec<&str> {
    if key.is_empty() {
        vec![]
    } else {
        key.split('.').collect()
    }
}

/// An in-process broker. Clones share the same state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        InMemoryBroker::default()
    }

    /// Makes every following `open` fail as if the broker was unreachable.
    pub async fn refuse_connections(&self, refuse: bool) {
        self.state.lock().await.refuse_connections = refuse;
    }

    pub async fn connections_opened(&self) -> usize {
        self.state.lock().await.connections_opened
    }

    /// Sessions opened and not yet closed.
    pub async fn open_sessions(&self) -> usize {
        self.state.lock().await.open_sessions.len()
    }

    pub async fn exchange(&self, name: &str) -> Option<ExchangeDefinition> {
        self.state.lock().await.exchanges.get(name).cloned()
    }

    pub async fn queue(&self, name: &str) -> Option<QueueDefinition> {
        self.state
            .lock()
            .await
            .queues
            .get(name)
            .map(|q| q.def.clone())
    }

    pub async fn bindings(&self) -> Vec<QueueBinding> {
        self.state.lock().await.bindings.clone()
    }

    /// Messages waiting in `queue` for a consumer.
    pub async fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or_default()
    }

    pub async fn consumers(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or_default()
    }

    /// Messages published successfully that no queue received.
    pub async fn dropped_messages(&self) -> usize {
        self.state.lock().await.dropped
    }

    /// Cancels every subscription on `queue` from the broker side.
    pub async fn disconnect_consumers(&self, queue: &str) {
        if let Some(q) = self.state.lock().await.queues.get_mut(queue) {
            for subscriber in q.consumers.drain(..) {
                debug!(tag = %subscriber.tag, "cancelling consumer");
                let _ = subscriber
                    .sender
                    .send(Err(BrokerError::new("consumer cancelled by broker")));
            }
        }
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn open(&self, address: &BrokerAddress) -> Result<Box<dyn Session>, AmqpError> {
        address.parse()?;

        let mut state = self.state.lock().await;
        if state.refuse_connections {
            return Err(AmqpError::ConnectionError(format!(
                "connection refused by {}",
                address
            )));
        }

        state.next_session += 1;
        state.connections_opened += 1;
        let id = state.next_session;
        state.open_sessions.insert(id);

        Ok(Box::new(InMemorySession {
            id,
            state: self.state.clone(),
            channel_open: AtomicBool::new(true),
            connection_open: AtomicBool::new(true),
        }) as Box<dyn Session>)
    }
}

/// A session on an [`InMemoryBroker`].
pub struct InMemorySession {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
    channel_open: AtomicBool,
    connection_open: AtomicBool,
}

impl InMemorySession {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.channel_open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::new("channel is closed"))
        }
    }

    /// A channel-level exception closes the channel, as the broker does.
    fn channel_error(&self, msg: String) -> BrokerError {
        self.channel_open.store(false, Ordering::SeqCst);
        BrokerError(msg)
    }
}

#[async_trait]
impl Session for InMemorySession {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        match state.exchanges.get(&def.name) {
            Some(existing) if existing == def => Ok(()),
            Some(existing) => Err(self.channel_error(format!(
                "PRECONDITION_FAILED - inequivalent arg for exchange '{}': declared {} durable={} auto_delete={}, received {} durable={} auto_delete={}",
                def.name,
                existing.kind,
                existing.durable,
                existing.delete,
                def.kind,
                def.durable,
                def.delete
            ))),
            None => {
                state.exchanges.insert(def.name.clone(), def.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        match state.queues.get(&def.name) {
            Some(existing) if existing.def.exclusive && existing.owner != self.id => {
                Err(self.channel_error(format!(
                    "RESOURCE_LOCKED - cannot obtain exclusive access to queue '{}'",
                    def.name
                )))
            }
            Some(existing) if existing.def == *def => Ok(()),
            Some(_) => Err(self.channel_error(format!(
                "PRECONDITION_FAILED - inequivalent arg for queue '{}'",
                def.name
            ))),
            None => {
                state.queues.insert(
                    def.name.clone(),
                    QueueState {
                        def: def.clone(),
                        owner: self.id,
                        messages: VecDeque::new(),
                        consumers: vec![],
                        consumed: false,
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        if !state.exchanges.contains_key(&binding.exchange_name) {
            return Err(self.channel_error(format!(
                "NOT_FOUND - no exchange '{}'",
                binding.exchange_name
            )));
        }
        if !state.queues.contains_key(&binding.queue_name) {
            return Err(self.channel_error(format!(
                "NOT_FOUND - no queue '{}'",
                binding.queue_name
            )));
        }

        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutgoingMessage,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let targets = if exchange == DEFAULT_EXCHANGE {
            if state.queues.contains_key(routing_key) {
                vec![routing_key.to_owned()]
            } else {
                vec![]
            }
        } else {
            match state.exchanges.get(exchange) {
                Some(def) => state.route(def, routing_key),
                None => {
                    return Err(
                        self.channel_error(format!("NOT_FOUND - no exchange '{}'", exchange))
                    )
                }
            }
        };

        if targets.is_empty() {
            debug!(exchange, routing_key, "unroutable message dropped");
            state.dropped += 1;
            return Ok(());
        }

        let delivery = Delivery {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            body: message.body.clone(),
            content_type: Some(message.content_type.clone()),
            headers: message.headers.clone(),
        };

        for name in targets {
            if let Some(queue) = state.queues.get_mut(&name) {
                queue.enqueue(delivery.clone());
            }
        }

        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        self.ensure_open()?;
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let Some(q) = state.queues.get_mut(queue) else {
            return Err(self.channel_error(format!("NOT_FOUND - no queue '{}'", queue)));
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        for delivery in q.messages.drain(..) {
            // the receiver is still in scope, sending cannot fail
            let _ = sender.send(Ok(delivery));
        }
        q.consumers.push(Subscriber {
            session: self.id,
            tag: consumer_tag.to_owned(),
            sender,
        });
        q.consumed = true;

        Ok(stream::unfold(receiver, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.connection_open.swap(false, Ordering::SeqCst) {
            return Err(BrokerError::new("connection is already closed"));
        }
        self.channel_open.store(false, Ordering::SeqCst);

        self.state.lock().await.release_session(self.id);
        Ok(())
    }
}
