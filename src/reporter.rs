// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Dispatch Reporter
//!
//! Uniform reporting of step-level and handler-level failures. Reporting is a
//! side effect only: it never changes what the caller does next.

use crate::errors::AmqpError;
use tracing::error;

pub trait DispatchReporter: Send + Sync {
    fn report(&self, step: &str, error: &AmqpError);
}

/// Emits one structured `error` event per failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl DispatchReporter for TracingReporter {
    fn report(&self, step: &str, err: &AmqpError) {
        error!(step = step, error = err.to_string(), "dispatch failure");
    }
}
