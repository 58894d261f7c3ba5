//! Trace-context propagation through job payloads.
//!
//! The carrier is a plain string map stored inside the persisted job args.
//! It is filled at enqueue time from the current `tracing` span and read back
//! by the worker to parent the handler span.

use std::collections::HashMap;
use std::sync::OnceLock;

use opentelemetry::propagation::{TextMapCompositePropagator, TextMapPropagator};
use opentelemetry::Context;
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

pub type Carrier = HashMap<String, String>;

fn propagator() -> &'static TextMapCompositePropagator {
    static PROPAGATOR: OnceLock<TextMapCompositePropagator> = OnceLock::new();
    PROPAGATOR.get_or_init(|| {
        TextMapCompositePropagator::new(vec![
            Box::new(TraceContextPropagator::new()),
            Box::new(BaggagePropagator::new()),
        ])
    })
}

/// Capture the current span's context.
pub fn inject_current_span() -> Carrier {
    inject(&Span::current().context())
}

pub fn inject(cx: &Context) -> Carrier {
    let mut carrier = Carrier::new();
    propagator().inject_context(cx, &mut carrier);
    carrier
}

pub fn extract(carrier: &Carrier) -> Context {
    propagator().extract(carrier)
}
