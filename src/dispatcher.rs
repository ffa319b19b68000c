// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! The consumer loop. A dispatcher owns one session for its whole life and
//! walks through
//!
//! ```text
//! Disconnected -> Connected -> TopologyDeclared -> Consuming -> Stopped | Failed
//! ```
//!
//! It connects, declares its exchange, queue and binding, subscribes with
//! automatic acknowledgement and then hands every delivery, in arrival order,
//! to its handler chain. A failed connection, topology step or subscription
//! ends the loop in `Failed` without consuming anything. Handler failures are
//! reported and never stop the loop.
//!
//! The loop runs until its shutdown future completes. The message being
//! dispatched when shutdown is requested is finished before the session is
//! released.

use crate::{
    channel::{BrokerAddress, Connector, Session},
    consumer::consume,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    handler::{ConsumerHandler, HandlerChain},
    queue::{QueueBinding, QueueDefinition},
    reporter::DispatchReporter,
    topology,
};
use futures_util::{future, StreamExt};
use std::{future::Future, sync::Arc};
use tokio::{
    sync::{oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, info};
use uuid::Uuid;

/// Lifecycle of a consumer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Connected,
    TopologyDeclared,
    Consuming,
    Stopped,
    Failed,
}

impl ConsumerState {
    /// `Stopped` and `Failed` are never left.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConsumerState::Stopped | ConsumerState::Failed)
    }
}

/// When received messages are acknowledged.
///
/// `AtReceipt` is at-most-once delivery: the broker forgets a message as soon
/// as it is handed to the process, so a crash while handlers run loses it.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AckMode {
    #[default]
    AtReceipt,
}

/// What a consumer loop declares and subscribes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerDefinition {
    pub(crate) exchange: ExchangeDefinition,
    pub(crate) queue: QueueDefinition,
    pub(crate) binding: QueueBinding,
    pub(crate) consumer_tag: Option<String>,
    pub(crate) ack: AckMode,
}

impl ConsumerDefinition {
    /// Creates a consumer definition.
    ///
    /// The exchange is a durable, non auto-deleted direct exchange. The queue
    /// is non-durable and non-exclusive, bound to the exchange under
    /// `routing_key`.
    ///
    /// # Parameters
    /// * `exchange` - The name of the exchange
    /// * `queue` - The name of the queue to consume
    /// * `routing_key` - The binding key
    ///
    /// # Returns
    /// A new consumer definition with a generated consumer tag
    pub fn new(exchange: &str, queue: &str, routing_key: &str) -> Self {
        ConsumerDefinition {
            exchange: ExchangeDefinition::new(exchange).direct().durable(),
            queue: QueueDefinition::new(queue),
            binding: QueueBinding::new(queue)
                .exchange(exchange)
                .routing_key(routing_key),
            consumer_tag: None,
            ack: AckMode::default(),
        }
    }

    /// Replaces the exchange declaration. The binding follows the new name.
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.binding = self.binding.exchange(&def.name);
        self.exchange = def;
        self
    }

    /// Replaces the queue declaration. The binding follows the new name.
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.binding.queue_name = def.name.clone();
        self.queue = def;
        self
    }

    /// Sets a fixed consumer tag instead of a generated one.
    ///
    /// # Parameters
    /// * `tag` - The consumer tag
    ///
    /// # Returns
    /// Self for method chaining
    pub fn consumer_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = Some(tag.to_owned());
        self
    }

    /// When deliveries are acknowledged.
    pub fn ack_mode(&self) -> AckMode {
        self.ack
    }

    /// Name of the consumed queue.
    pub fn queue_name(&self) -> &str {
        &self.queue.name
    }
}

/// A consumer loop over one queue.
pub struct RabbitMQDispatcher {
    connector: Arc<dyn Connector>,
    address: BrokerAddress,
    def: ConsumerDefinition,
    tag_prefix: String,
    handlers: HandlerChain,
    reporter: Arc<dyn DispatchReporter>,
    state: watch::Sender<ConsumerState>,
}

impl RabbitMQDispatcher {
    /// Creates a consumer loop. Nothing happens until it is run.
    ///
    /// # Parameters
    /// * `connector` - Opens the session the loop owns
    /// * `address` - The broker to consume from
    /// * `def` - What to declare and subscribe to
    /// * `reporter` - Receives every step and handler failure
    ///
    /// # Returns
    /// A dispatcher in the `Disconnected` state with no handlers
    pub fn new(
        connector: Arc<dyn Connector>,
        address: BrokerAddress,
        def: ConsumerDefinition,
        reporter: Arc<dyn DispatchReporter>,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Disconnected);

        RabbitMQDispatcher {
            connector,
            address,
            def,
            tag_prefix: "consumer".to_owned(),
            handlers: HandlerChain::new(),
            reporter,
            state,
        }
    }

    /// Sets the prefix of the generated consumer tag, used when the definition
    /// names none.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn tag_prefix(mut self, prefix: &str) -> Self {
        self.tag_prefix = prefix.to_owned();
        self
    }

    /// Appends a handler to the chain.
    ///
    /// # Parameters
    /// * `handler` - Runs after every handler registered before it
    ///
    /// # Returns
    /// Self for method chaining
    pub fn register<H>(mut self, handler: H) -> Self
    where
        H: ConsumerHandler + 'static,
    {
        self.handlers = self.handlers.handler(handler);
        self
    }

    /// Appends every handler of `chain`, keeping their order.
    pub fn handlers(mut self, chain: HandlerChain) -> Self {
        for handler in chain.iter() {
            self.handlers.push(handler.clone());
        }
        self
    }

    /// Watches the state of the loop.
    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Runs the loop on the current task until `shutdown` completes or the
    /// loop fails.
    ///
    /// Returns `Ok(())` when stopped by `shutdown`.
    pub async fn run_until_shutdown(
        self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), AmqpError> {
        self.transition(ConsumerState::Disconnected);
        let _unwind = FailOnUnwind(&self.state);

        let session = match self.connector.open(&self.address).await {
            Ok(session) => session,
            Err(err) => {
                self.reporter.report("connect", &err);
                self.transition(ConsumerState::Failed);
                return Err(err);
            }
        };
        self.transition(ConsumerState::Connected);

        let result = self.run_session(session.as_ref(), shutdown).await;

        if let Err(err) = session.close().await {
            debug!(error = err.to_string(), "error closing consumer session");
        }

        match &result {
            Ok(()) => self.transition(ConsumerState::Stopped),
            Err(_) => self.transition(ConsumerState::Failed),
        }

        result
    }

    /// Runs the loop on its own task. The loop stops through
    /// [`ConsumerHandle::stop`]; dropping the handle leaves it running.
    pub fn spawn(self) -> ConsumerHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let state = self.state();

        let task = tokio::spawn(self.run_until_shutdown(async move {
            if shutdown_rx.await.is_err() {
                future::pending::<()>().await;
            }
        }));

        ConsumerHandle {
            shutdown: Some(shutdown_tx),
            state,
            task,
        }
    }

    /// Runs the loop on its own task and waits for it. Without a shutdown
    /// signal this only returns when the loop fails.
    pub async fn consume_blocking(self) -> Result<(), AmqpError> {
        self.spawn().join().await
    }

    async fn run_session(
        &self,
        session: &dyn Session,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), AmqpError> {
        let def = &self.def;

        if let Err(err) = topology::declare(session, &def.exchange, &def.queue, &def.binding).await
        {
            self.reporter.report("declare topology", &err);
            return Err(err);
        }
        self.transition(ConsumerState::TopologyDeclared);

        let tag = def
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.tag_prefix, Uuid::new_v4()));

        let mut deliveries = match session.consume(&def.queue.name, &tag).await {
            Ok(stream) => stream,
            Err(err) => {
                let err = AmqpError::ConsumerError(format!("{}: {}", def.queue.name, err));
                self.reporter.report("subscribe", &err);
                return Err(err);
            }
        };
        self.transition(ConsumerState::Consuming);

        info!(
            exchange = %def.exchange.name,
            queue = %def.queue.name,
            consumer_tag = %tag,
            "waiting for messages"
        );

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                // prefer shutdown over picking up another message
                biased;

                _ = &mut shutdown => {
                    info!(queue = %def.queue.name, "consumer received shutdown signal");
                    return Ok(());
                }

                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        consume(&delivery, &def.queue.name, &self.handlers, self.reporter.as_ref()).await;
                    }
                    Some(Err(err)) => {
                        let err = AmqpError::ConsumerError(format!("{}: {}", def.queue.name, err));
                        self.reporter.report("receive", &err);
                        return Err(err);
                    }
                    None => {
                        let err = AmqpError::ConsumerError(format!(
                            "{}: delivery stream closed",
                            def.queue.name
                        ));
                        self.reporter.report("receive", &err);
                        return Err(err);
                    }
                }
            }
        }
    }

    fn transition(&self, next: ConsumerState) {
        debug!(state = ?next, queue = %self.def.queue.name, "consumer state");
        self.state.send_replace(next);
    }
}

/// Leaves the state `Failed` when the loop is torn down before reaching a
/// terminal state, e.g. by a panicking handler.
struct FailOnUnwind<'a>(&'a watch::Sender<ConsumerState>);

impl Drop for FailOnUnwind<'_> {
    fn drop(&mut self) {
        self.0.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = ConsumerState::Failed;
                true
            }
        });
    }
}

/// Control over a consumer loop running on its own task.
pub struct ConsumerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    state: watch::Receiver<ConsumerState>,
    task: JoinHandle<Result<(), AmqpError>>,
}

impl ConsumerHandle {
    /// The state the loop is in now.
    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Watches the state of the loop, including after the handle is gone.
    pub fn watch_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.clone()
    }

    /// Waits until the loop is consuming or has terminated, and returns the
    /// state it reached.
    pub async fn ready(&self) -> ConsumerState {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|s| *s == ConsumerState::Consuming || s.is_terminal())
            .await
            .map(|s| *s);

        // The sender lives in the task; once it is gone the last value stands.
        reached.unwrap_or_else(|_| *state.borrow())
    }

    /// Requests shutdown and waits for the in-flight message to finish.
    ///
    /// # Returns
    /// `Ok(())` when the loop stopped on request, or the error that ended it
    /// earlier
    pub async fn stop(mut self) -> Result<(), AmqpError> {
        if let Some(shutdown) = self.shutdown.take() {
            // The loop may already have ended on its own.
            let _ = shutdown.send(());
        }

        self.join().await
    }

    /// Waits for the loop to end.
    pub async fn join(self) -> Result<(), AmqpError> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(AmqpError::ConsumerError(format!(
                "consumer task failed: {}",
                err
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{Delivery, MockConnector, MockSession},
        errors::{BrokerError, TopologyStep},
        reporter::tests::RecordingReporter,
    };
    use futures_util::stream;
    use std::{
        collections::BTreeMap,
        sync::atomic::{AtomicUsize, Ordering},
    };

    fn delivery(body: &str) -> Result<Delivery, BrokerError> {
        Ok(Delivery {
            exchange: "orders".to_owned(),
            routing_key: "new".to_owned(),
            body: body.as_bytes().to_vec(),
            content_type: Some("application/json".to_owned()),
            headers: BTreeMap::new(),
        })
    }

    fn session_with_topology() -> MockSession {
        let mut session = MockSession::new();
        session.expect_declare_exchange().returning(|_| Ok(()));
        session.expect_declare_queue().returning(|_| Ok(()));
        session.expect_bind_queue().returning(|_| Ok(()));
        session.expect_close().times(1).returning(|| Ok(()));
        session
    }

    fn dispatcher(connector: MockConnector, reporter: Arc<RecordingReporter>) -> RabbitMQDispatcher {
        RabbitMQDispatcher::new(
            Arc::new(connector),
            BrokerAddress::new("amqp://local"),
            ConsumerDefinition::new("orders", "orders.q", "new"),
            reporter,
        )
    }

    #[test]
    fn default_definition_matches_consumer_topology() {
        let def = ConsumerDefinition::new("orders", "orders.q", "new");

        assert_eq!(def.exchange.exchange_kind(), crate::exchange::ExchangeKind::Direct);
        assert!(def.exchange.is_durable());
        assert!(!def.exchange.is_auto_delete());
        assert!(!def.queue.is_durable());
        assert!(!def.queue.is_exclusive());
        assert_eq!(def.binding.key(), "new");
        assert_eq!(def.ack_mode(), AckMode::AtReceipt);
    }

    #[test]
    fn replacing_the_queue_rebinds_it() {
        let def = ConsumerDefinition::new("orders", "orders.q", "new")
            .queue(QueueDefinition::new("orders.audit").durable());

        assert_eq!(def.binding.queue_name(), "orders.audit");
        assert_eq!(def.queue_name(), "orders.audit");
    }

    #[test]
    fn teardown_before_a_terminal_state_is_a_failure() {
        let (state, watch) = watch::channel(ConsumerState::Consuming);

        drop(FailOnUnwind(&state));
        assert_eq!(*watch.borrow(), ConsumerState::Failed);

        state.send_replace(ConsumerState::Stopped);
        drop(FailOnUnwind(&state));
        assert_eq!(*watch.borrow(), ConsumerState::Stopped);
    }

    #[tokio::test]
    async fn connection_failure_ends_in_failed() {
        let mut connector = MockConnector::new();
        connector
            .expect_open()
            .returning(|_| Err(AmqpError::ConnectionError("refused".to_owned())));
        let reporter = Arc::new(RecordingReporter::default());

        let dispatcher = dispatcher(connector, reporter.clone());
        let state = dispatcher.state();
        let result = dispatcher.run_until_shutdown(future::pending::<()>()).await;

        assert_eq!(result, Err(AmqpError::ConnectionError("refused".to_owned())));
        assert_eq!(*state.borrow(), ConsumerState::Failed);
        assert_eq!(reporter.reports.lock().unwrap()[0].0, "connect");
    }

    #[tokio::test]
    async fn topology_failure_never_subscribes() {
        let mut connector = MockConnector::new();
        connector.expect_open().returning(|_| {
            let mut session = MockSession::new();
            session.expect_declare_exchange().returning(|_| Ok(()));
            session
                .expect_declare_queue()
                .returning(|_| Err(BrokerError::new("PRECONDITION_FAILED")));
            session.expect_bind_queue().never();
            session.expect_consume().never();
            session.expect_close().times(1).returning(|| Ok(()));
            Ok(Box::new(session) as Box<dyn Session>)
        });
        let reporter = Arc::new(RecordingReporter::default());

        let dispatcher = dispatcher(connector, reporter.clone());
        let state = dispatcher.state();
        let result = dispatcher.run_until_shutdown(future::pending::<()>()).await;

        assert!(matches!(
            result,
            Err(AmqpError::TopologyError {
                step: TopologyStep::DeclareQueue(_),
                ..
            })
        ));
        assert_eq!(*state.borrow(), ConsumerState::Failed);
    }

    #[tokio::test]
    async fn subscription_failure_is_a_consumer_error() {
        let mut connector = MockConnector::new();
        connector.expect_open().returning(|_| {
            let mut session = session_with_topology();
            session
                .expect_consume()
                .returning(|_, _| Err(BrokerError::new("ACCESS_REFUSED")));
            Ok(Box::new(session) as Box<dyn Session>)
        });

        let result = dispatcher(connector, Arc::new(RecordingReporter::default()))
            .run_until_shutdown(future::pending::<()>())
            .await;

        assert_eq!(
            result,
            Err(AmqpError::ConsumerError("orders.q: ACCESS_REFUSED".to_owned()))
        );
    }

    #[tokio::test]
    async fn failing_handler_does_not_stop_the_loop() {
        let mut connector = MockConnector::new();
        connector.expect_open().returning(|_| {
            let mut session = session_with_topology();
            session
                .expect_consume()
                .withf(|queue, tag| queue == "orders.q" && tag == "billing")
                .returning(|_, _| {
                    Ok(stream::iter(vec![delivery("1"), delivery("2"), delivery("3")]).boxed())
                });
            Ok(Box::new(session) as Box<dyn Session>)
        });
        let reporter = Arc::new(RecordingReporter::default());
        let succeeded = Arc::new(AtomicUsize::new(0));
        let counter = succeeded.clone();

        let result = RabbitMQDispatcher::new(
            Arc::new(connector),
            BrokerAddress::new("amqp://local"),
            ConsumerDefinition::new("orders", "orders.q", "new").consumer_tag("billing"),
            reporter.clone(),
        )
        .handlers(
            HandlerChain::new()
                .handler_fn(|_| Err("h1 always fails".into()))
                .handler_fn(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
        )
        .run_until_shutdown(future::pending::<()>())
        .await;

        // the finite stream ends like a dropped subscription
        assert!(matches!(result, Err(AmqpError::ConsumerError(_))));
        assert_eq!(succeeded.load(Ordering::SeqCst), 3);

        let reports = reporter.reports.lock().unwrap();
        let handler_failures = reports
            .iter()
            .filter(|(_, err)| matches!(err, AmqpError::HandlerError { handler: 0, .. }))
            .count();
        assert_eq!(handler_failures, 3);
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let mut connector = MockConnector::new();
        connector.expect_open().returning(|_| {
            let mut session = session_with_topology();
            session
                .expect_consume()
                .returning(|_, _| Ok(stream::pending::<Result<Delivery, BrokerError>>().boxed()));
            Ok(Box::new(session) as Box<dyn Session>)
        });

        let handle = dispatcher(connector, Arc::new(RecordingReporter::default())).spawn();

        assert_eq!(handle.ready().await, ConsumerState::Consuming);

        let state = handle.watch_state();
        assert_eq!(handle.stop().await, Ok(()));
        assert_eq!(*state.borrow(), ConsumerState::Stopped);
    }
}
