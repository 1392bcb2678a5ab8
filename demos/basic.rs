//! Basic example showing transaction correlation and statement parameterization.
//!
//! Run with: cargo run --example basic

use opentelemetry::trace::{SpanKind, TraceContextExt, Tracer, TracerProvider};
use opentelemetry::Context;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider, Span};
use opentelemetry_sdk::Resource;
use transaction_tracing::prelude::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn print_transaction(label: &str, span: &Span) {
    let Some(data) = span.exported_data() else {
        return;
    };
    let attributes: Vec<String> = data
        .attributes
        .iter()
        .filter(|kv| kv.key.as_str().starts_with("transaction"))
        .map(|kv| format!("{}={}", kv.key.as_str(), kv.value))
        .collect();
    println!("{label:<10} {}", attributes.join(" "));
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing subscriber
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,transaction_tracing=trace".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let resource = Resource::builder().with_service_name("checkout").build();
    let sampler = TransactionSampler::new(Sampler::AlwaysOn, &resource)?;

    let provider = SdkTracerProvider::builder()
        .with_span_processor(sampler.span_processor())
        .with_sampler(sampler.clone())
        .with_resource(resource)
        .build();
    let tracer = provider.tracer("basic");

    // The server span opens the "POST /orders" transaction
    let request = tracer
        .span_builder("POST /orders")
        .with_kind(SpanKind::Server)
        .start(&tracer);
    print_transaction("request", &request);
    let request_cx = Context::new().with_span(request);

    // Database spans inherit it and are named by query shape
    for id in [7, 8, 9] {
        let sql = format!("SELECT * FROM carts WHERE user_id = {id}");
        let name = format_span_name(Dialect::PostgreSql, "query", &sql);
        let query = tracer.start_with_context(name, &request_cx);
        print_transaction("query", &query);
    }

    // A sub-flow gets its own transaction, keeping the distributed one
    let mut payment = tracer.start_with_context("charge card", &request_cx);
    sampler.start_new_transaction(&mut payment, "payment");
    print_transaction("payment", &payment);
    let payment_cx = Context::new().with_span(payment);

    let gateway = tracer.start_with_context("gateway call", &payment_cx);
    print_transaction("gateway", &gateway);

    drop(gateway);
    payment_cx.span().end();
    request_cx.span().end();

    provider.shutdown()?;
    Ok(())
}
