// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for RabbitMQ
//!
//! Spans are named `"{layer}.{operation}"` and carry `layer` and `operation`
//! attributes. Trace context travels in message headers: the publisher
//! injects the caller's context and the consumer extracts it as the parent of
//! the span covering one delivery. Exporter setup is left to the application;
//! without an installed provider every span is a no-op.

use opentelemetry::{
    global::{self, BoxedSpan},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context, KeyValue,
};
use std::{collections::BTreeMap, fmt};

const TRACER_NAME: &str = "rabbitmq-client";

/// The layer a traced operation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceLayer {
    Topology,
    Publisher,
    Consumer,
}

impl TraceLayer {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceLayer::Topology => "topology",
            TraceLayer::Publisher => "publisher",
            TraceLayer::Consumer => "consumer",
        }
    }

    fn span_kind(&self) -> SpanKind {
        match self {
            TraceLayer::Topology => SpanKind::Client,
            TraceLayer::Publisher => SpanKind::Producer,
            TraceLayer::Consumer => SpanKind::Consumer,
        }
    }
}

impl fmt::Display for TraceLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Writes trace context into outgoing message headers.
pub(crate) struct HeaderInjector<'a> {
    headers: &'a mut BTreeMap<String, String>,
}

impl<'a> HeaderInjector<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<String, String>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(key.to_lowercase(), value);
    }
}

/// Reads trace context from incoming message headers.
pub(crate) struct HeaderExtractor<'a> {
    headers: &'a BTreeMap<String, String>,
}

impl<'a> HeaderExtractor<'a> {
    pub(crate) fn new(headers: &'a BTreeMap<String, String>) -> Self {
        Self { headers }
    }
}

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

pub(crate) fn inject_context(ctx: &Context, headers: &mut BTreeMap<String, String>) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderInjector::new(headers))
    });
}

/// Starts a span for `operation` within `layer`, as a child of `parent`.
pub fn start_span(layer: TraceLayer, operation: &str, parent: &Context) -> BoxedSpan {
    let tracer = global::tracer(TRACER_NAME);

    tracer
        .span_builder(format!("{}.{}", layer, operation))
        .with_kind(layer.span_kind())
        .with_attributes(vec![
            KeyValue::new("layer", layer.as_str()),
            KeyValue::new("operation", operation.to_owned()),
        ])
        .start_with_context(&tracer, parent)
}

/// Extracts the publisher's context from `headers` and starts the span
/// covering the handling of one delivery from `queue`.
pub fn new_consumer_span(headers: &BTreeMap<String, String>, queue: &str) -> (Context, BoxedSpan) {
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor::new(headers))
    });

    let span = start_span(TraceLayer::Consumer, queue, &ctx);

    (ctx, span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injector_lowercases_keys() {
        let mut headers = BTreeMap::new();
        HeaderInjector::new(&mut headers).set("TraceParent", "00-abc-def-01".to_owned());

        assert_eq!(headers.get("traceparent").map(String::as_str), Some("00-abc-def-01"));
    }

    #[test]
    fn extractor_reads_headers() {
        let headers = BTreeMap::from([("traceparent".to_owned(), "value".to_owned())]);
        let extractor = HeaderExtractor::new(&headers);

        assert_eq!(extractor.get("traceparent"), Some("value"));
        assert_eq!(extractor.keys(), vec!["traceparent"]);
        assert_eq!(extractor.get("missing"), None);
    }

    #[test]
    fn layer_names_are_stable() {
        assert_eq!(TraceLayer::Publisher.to_string(), "publisher");
        assert_eq!(TraceLayer::Consumer.as_str(), "consumer");
        assert_eq!(TraceLayer::Topology.as_str(), "topology");
    }
}
