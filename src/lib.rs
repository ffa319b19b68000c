// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod consumer;
mod otel;

pub mod channel;
pub mod client;
pub mod configs;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod memory;
pub mod publisher;
pub mod queue;
pub mod reporter;
pub mod topology;

pub use otel::{start_span, TraceLayer};
