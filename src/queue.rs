// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management for RabbitMQ
//!
//! Queue definitions and the bindings that route messages from an exchange
//! into a queue.

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// By default the queue is non-durable, non-exclusive and kept when unused.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// # Parameters
    /// * `name` - The name of the queue
    ///
    /// # Returns
    /// A new queue definition with default settings
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: false,
            delete: false,
            exclusive: false,
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    ///
    /// Messages in a non-durable queue are lost when the broker restarts.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to be automatically deleted when no longer in use.
    ///
    /// The broker deletes it once it had at least one consumer and the last
    /// one went away.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the declaring connection.
    ///
    /// Other connections cannot declare or consume it, and it is deleted
    /// when that connection closes.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Name of the queue.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the queue survives a broker restart.
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Whether the queue belongs to the declaring connection only.
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Whether the queue is deleted after its last consumer leaves.
    pub fn is_auto_delete(&self) -> bool {
        self.delete
    }
}

/// Configuration for binding a queue to an exchange.
///
/// Many queues may be bound to one exchange and one queue may be bound to
/// many exchanges; each pair is routed by its own key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// The exchange name and routing key start empty. An empty key on a direct
    /// exchange only matches messages published with an empty key.
    ///
    /// # Parameters
    /// * `queue` - The name of the queue to bind
    ///
    /// # Returns
    /// A new queue binding with default settings
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    /// Sets the exchange to bind the queue to.
    ///
    /// # Parameters
    /// * `exchange` - The name of the exchange
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key for the binding.
    ///
    /// On a topic exchange the key is a pattern where `*` matches one word and
    /// `#` matches zero or more words.
    ///
    /// # Parameters
    /// * `key` - The routing key
    ///
    /// # Returns
    /// Self for method chaining
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    /// Name of the bound queue.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Name of the exchange the queue is bound to.
    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    /// The routing key, or pattern, of the binding.
    pub fn key(&self) -> &str {
        &self.routing_key
    }
}
