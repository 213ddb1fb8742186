// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Trace context rides in AMQP headers. Publishing injects the caller's
//! context through the global text-map propagator; consuming extracts it and
//! parents a consumer span on it, so one trace covers producer, broker hop and
//! job.

use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, ShortString},
};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context, KeyValue,
};
use std::collections::BTreeMap;
use tracing::warn;

const MESSAGING_SYSTEM: &str = "rabbitmq";

pub(crate) struct HeaderInjector<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> HeaderInjector<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        HeaderInjector { headers }
    }
}

impl Injector for HeaderInjector<'_> {
    // Propagators look fields up in lower case.
    fn set(&mut self, key: &str, value: String) {
        self.headers
            .insert(ShortString::from(key.to_lowercase()), AMQPValue::LongString(value.into()));
    }
}

pub(crate) struct HeaderExtractor<'a> {
    headers: &'a BTreeMap<ShortString, AMQPValue>,
}

impl<'a> HeaderExtractor<'a> {
    pub(crate) fn new(headers: &'a BTreeMap<ShortString, AMQPValue>) -> Self {
        HeaderExtractor { headers }
    }
}

impl Extractor for HeaderExtractor<'_> {
    /// String-valued headers only; other AMQP types never carry propagation
    /// fields.
    fn get(&self, key: &str) -> Option<&str> {
        match self.headers.get(key)? {
            AMQPValue::LongString(value) => match std::str::from_utf8(value.as_bytes()) {
                Ok(value) => Some(value),
                Err(err) => {
                    warn!(error = err.to_string(), header = key, "non utf-8 trace header");
                    None
                }
            },
            AMQPValue::ShortString(value) => Some(value.as_str()),
            _ => None,
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(ShortString::as_str).collect()
    }
}

/// Header table carrying `ctx`.
pub(crate) fn inject(ctx: &Context) -> FieldTable {
    let mut headers = BTreeMap::new();
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderInjector::new(&mut headers))
    });
    FieldTable::from(headers)
}

/// Context propagated in `props`, or an empty one.
pub(crate) fn extract(props: &AMQPProperties) -> Context {
    let empty = BTreeMap::new();
    let headers = props.headers().as_ref().map_or(&empty, FieldTable::inner);

    global::get_text_map_propagator(|propagator| propagator.extract(&HeaderExtractor::new(headers)))
}

/// Starts the consumer span for one delivery from `queue`, parented on the
/// producer's context.
pub(crate) fn consumer_span(
    props: &AMQPProperties,
    tracer: &BoxedTracer,
    queue: &str,
    redelivered: bool,
) -> (Context, BoxedSpan) {
    let parent = extract(props);

    let span = tracer
        .span_builder(format!("{queue} process"))
        .with_kind(SpanKind::Consumer)
        .with_attributes([
            KeyValue::new("messaging.system", MESSAGING_SYSTEM),
            KeyValue::new("messaging.destination.name", queue.to_owned()),
            KeyValue::new("messaging.rabbitmq.redelivered", redelivered),
        ])
        .start_with_context(tracer, &parent);

    (parent, span)
}
