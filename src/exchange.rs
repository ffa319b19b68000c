// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Management for RabbitMQ
//!
//! Exchanges are the routing entities that receive published messages and
//! forward them to bound queues. This module defines the supported exchange
//! kinds and a builder for exchange definitions.

use std::{fmt, str::FromStr};

/// Represents the types of exchanges available in RabbitMQ.
///
/// - Direct: routes to queues whose binding key equals the routing key
/// - Fanout: broadcasts to every bound queue regardless of routing key
/// - Topic: matches the routing key against `*`/`#` binding patterns
/// - Headers: routes on message headers instead of routing keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeKind {
    /// Returns the name the broker uses for this kind.
    ///
    /// # Returns
    /// One of `direct`, `fanout`, `topic` or `headers`
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parses a kind name, ignoring case. Unknown names are rejected rather
/// than passed through to the broker.
impl FromStr for ExchangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            "headers" => Ok(ExchangeKind::Headers),
            other => Err(format!("unsupported exchange kind `{}`", other)),
        }
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        }
    }
}

/// Definition of a RabbitMQ exchange with its configuration parameters.
///
/// Redeclaring an exchange with the same name and identical attributes is a
/// no-op on the broker; any attribute difference is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
}

impl ExchangeDefinition {
    /// Creates a new exchange definition with the given name.
    ///
    /// By default the exchange is a non-durable direct exchange that is kept
    /// when unused.
    ///
    /// # Parameters
    /// * `name` - The name of the exchange
    ///
    /// # Returns
    /// A new exchange definition with default settings
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            durable: false,
            delete: false,
        }
    }

    /// Sets the exchange type.
    ///
    /// # Parameters
    /// * `kind` - The exchange type
    ///
    /// # Returns
    /// Self for method chaining
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the exchange type to Direct.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn direct(self) -> Self {
        self.kind(ExchangeKind::Direct)
    }

    /// Sets the exchange type to Fanout.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn fanout(self) -> Self {
        self.kind(ExchangeKind::Fanout)
    }

    /// Sets the exchange type to Topic.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn topic(self) -> Self {
        self.kind(ExchangeKind::Topic)
    }

    /// Sets the exchange to be automatically deleted when no longer in use.
    ///
    /// The broker deletes it once its last binding is removed.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Name of the exchange.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The exchange type.
    pub fn exchange_kind(&self) -> ExchangeKind {
        self.kind
    }

    /// Whether the exchange survives a broker restart.
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Whether the exchange is deleted once unused.
    pub fn is_auto_delete(&self) -> bool {
        self.delete
    }
}
