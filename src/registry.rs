//! Registry of span transactions.
//!
//! The tracing SDK does not let a sampler read the attributes of a parent
//! span. [`TransactionSpanProcessor`] publishes the transaction attributes of
//! every started span here, keyed by trace and span id. Ended spans are kept
//! for a bounded while, so that a child started after its parent has ended
//! (a spawned task outliving its handler, for instance) still inherits. The
//! sampler only ever reads from it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};

use opentelemetry::trace::Span as _;
use opentelemetry::{Context, KeyValue, SpanId, TraceId};
use opentelemetry_sdk::error::OTelSdkResult;
use opentelemetry_sdk::trace::{Span, SpanData, SpanProcessor};
use opentelemetry_sdk::Resource;

use crate::config::TransactionConfig;
use crate::transaction::TransactionAttributes;

/// Number of ended spans whose transaction stays available to late children.
pub const DEFAULT_ENDED_SPAN_CAPACITY: usize = 4096;

type SpanKey = (TraceId, SpanId);

#[derive(Debug, Default)]
struct Entries {
    spans: HashMap<SpanKey, TransactionAttributes>,
    // oldest first
    ended: VecDeque<SpanKey>,
}

/// Transaction attributes of open and recently ended spans, shared between
/// the span processor and the sampler.
///
/// Open spans are never evicted. Once more than `ended_capacity` spans have
/// ended, the oldest ended span is forgotten.
#[derive(Debug, Clone)]
pub struct TransactionRegistry {
    // Poisoning is recovered from: the maps only hold plain values.
    inner: Arc<RwLock<Entries>>,
    ended_capacity: usize,
}

impl Default for TransactionRegistry {
    fn default() -> Self {
        Self::with_ended_capacity(DEFAULT_ENDED_SPAN_CAPACITY)
    }
}

impl TransactionRegistry {
    /// Create a registry keeping up to [`DEFAULT_ENDED_SPAN_CAPACITY`] ended spans.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry keeping up to `capacity` ended spans.
    pub fn with_ended_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::default(),
            ended_capacity: capacity,
        }
    }

    /// Transaction attributes published for a span.
    pub fn get(&self, trace_id: TraceId, span_id: SpanId) -> Option<TransactionAttributes> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.spans.get(&(trace_id, span_id)).cloned()
    }

    /// Publish the transaction attributes of a span, replacing any previous
    /// entry.
    pub fn publish(
        &self,
        trace_id: TraceId,
        span_id: SpanId,
        attributes: TransactionAttributes,
    ) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.spans.insert((trace_id, span_id), attributes);
    }

    /// Mark a span as ended. Its entry stays readable until enough later
    /// spans have ended to push it out.
    pub fn end(&self, trace_id: TraceId, span_id: SpanId) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let key = (trace_id, span_id);
        if !inner.spans.contains_key(&key) {
            return;
        }

        inner.ended.push_back(key);
        while inner.ended.len() > self.ended_capacity {
            if let Some(evicted) = inner.ended.pop_front() {
                inner.spans.remove(&evicted);
            }
        }
    }

    /// Forget a span immediately.
    pub fn remove(&self, trace_id: TraceId, span_id: SpanId) -> Option<TransactionAttributes> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let key = (trace_id, span_id);
        inner.ended.retain(|ended| *ended != key);
        inner.spans.remove(&key)
    }

    /// Number of spans, open or ended, with a readable entry.
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .spans
            .len()
    }

    /// Whether no span has a readable entry.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every span.
    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.spans.clear();
        inner.ended.clear();
    }

    /// Create the span processor that keeps this registry up to date.
    pub fn span_processor(
        &self,
        service: impl Into<String>,
        config: TransactionConfig,
    ) -> TransactionSpanProcessor {
        TransactionSpanProcessor {
            registry: self.clone(),
            service: service.into(),
            config,
            inner: None,
        }
    }
}

/// Publishes the transaction attributes of started spans into a
/// [`TransactionRegistry`].
///
/// Register it on the tracer provider next to the
/// [`TransactionSampler`](crate::TransactionSampler) sharing the same registry;
/// without it every span opens a new transaction boundary.
///
/// Reading the attributes of a started span goes through
/// `Span::exported_data`, which clones the span data once per started span.
///
/// An exporting processor can be wrapped with [`with_inner`](Self::with_inner).
/// Ended spans handed to it carry a single value for each transaction
/// attribute, the last one set, even after
/// [`start_new_transaction`](crate::TransactionSampler::start_new_transaction)
/// renamed the transaction of a started span.
#[derive(Debug)]
pub struct TransactionSpanProcessor {
    registry: TransactionRegistry,
    service: String,
    config: TransactionConfig,
    inner: Option<Box<dyn SpanProcessor>>,
}

impl TransactionSpanProcessor {
    /// Forward every span to `inner` after the transaction attributes of
    /// ended spans have been deduplicated.
    pub fn with_inner<P>(mut self, inner: P) -> Self
    where
        P: SpanProcessor + 'static,
    {
        self.inner = Some(Box::new(inner));
        self
    }

    /// The registry this processor publishes into.
    pub fn registry(&self) -> &TransactionRegistry {
        &self.registry
    }
}

impl SpanProcessor for TransactionSpanProcessor {
    fn on_start(&self, span: &mut Span, cx: &Context) {
        if span.is_recording() && span.span_context().is_valid() {
            let trace_id = span.span_context().trace_id();
            let span_id = span.span_context().span_id();
            let attributes = span.exported_data().and_then(|data| {
                TransactionAttributes::from_key_values(&data.attributes, &self.config)
            });
            if let Some(mut attributes) = attributes {
                attributes.service = Some(self.service.clone());
                self.registry.publish(trace_id, span_id, attributes);
            }
        }

        if let Some(inner) = &self.inner {
            inner.on_start(span, cx);
        }
    }

    fn on_end(&self, mut span: SpanData) {
        self.registry
            .end(span.span_context.trace_id(), span.span_context.span_id());

        if let Some(inner) = &self.inner {
            keep_last_transaction_values(&mut span.attributes, &self.config);
            inner.on_end(span);
        }
    }

    fn force_flush(&self) -> OTelSdkResult {
        match &self.inner {
            Some(inner) => inner.force_flush(),
            None => Ok(()),
        }
    }

    fn shutdown(&self) -> OTelSdkResult {
        self.registry.clear();
        match &self.inner {
            Some(inner) => inner.shutdown(),
            None => Ok(()),
        }
    }

    fn set_resource(&mut self, resource: &Resource) {
        if let Some(inner) = self.inner.as_mut() {
            inner.set_resource(resource);
        }
    }
}

// `set_attribute` appends, so a renamed transaction leaves the previous value
// in place.
fn keep_last_transaction_values(attributes: &mut Vec<KeyValue>, config: &TransactionConfig) {
    let keys = [
        &config.transaction_key,
        &config.distributed_key,
        &config.root_key,
    ];
    let mut seen = [false; 3];

    let mut kept = Vec::with_capacity(attributes.len());
    for kv in attributes.drain(..).rev() {
        if let Some(index) = keys.iter().position(|key| **key == kv.key) {
            if seen[index] {
                continue;
            }
            seen[index] = true;
        }
        kept.push(kv);
    }
    kept.reverse();
    *attributes = kept;
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACE: TraceId = TraceId::from_bytes([1; 16]);

    fn attributes(name: &str) -> TransactionAttributes {
        TransactionAttributes::new_boundary(name, None, "svc")
    }

    #[test]
    fn test_publish_get_remove() {
        let registry = TransactionRegistry::new();
        let span_id = SpanId::from_bytes([1; 8]);
        assert!(registry.is_empty());

        registry.publish(TRACE, span_id, attributes("checkout"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(TRACE, span_id).unwrap().transaction, "checkout");

        registry.publish(TRACE, span_id, attributes("refund"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(TRACE, span_id).unwrap().transaction, "refund");

        assert!(registry.remove(TRACE, span_id).is_some());
        assert!(registry.get(TRACE, span_id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_entries_are_scoped_by_trace() {
        let registry = TransactionRegistry::new();
        let span_id = SpanId::from_bytes([4; 8]);
        let other_trace = TraceId::from_bytes([2; 16]);

        registry.publish(TRACE, span_id, attributes("checkout"));
        registry.publish(other_trace, span_id, attributes("refund"));

        assert_eq!(registry.get(TRACE, span_id).unwrap().transaction, "checkout");
        assert_eq!(registry.get(other_trace, span_id).unwrap().transaction, "refund");
    }

    #[test]
    fn test_ended_spans_are_kept_up_to_capacity() {
        let registry = TransactionRegistry::with_ended_capacity(2);
        let spans: Vec<SpanId> = (1..=3u8).map(|i| SpanId::from_bytes([i; 8])).collect();
        for span_id in &spans {
            registry.publish(TRACE, *span_id, attributes("checkout"));
        }
        let open = SpanId::from_bytes([9; 8]);
        registry.publish(TRACE, open, attributes("checkout"));

        registry.end(TRACE, spans[0]);
        registry.end(TRACE, spans[1]);
        assert_eq!(registry.len(), 4);
        assert!(registry.get(TRACE, spans[0]).is_some());

        registry.end(TRACE, spans[2]);
        assert_eq!(registry.len(), 3);
        assert!(registry.get(TRACE, spans[0]).is_none());
        assert!(registry.get(TRACE, spans[1]).is_some());
        assert!(registry.get(TRACE, open).is_some());
    }

    #[test]
    fn test_ending_unknown_span_is_ignored() {
        let registry = TransactionRegistry::with_ended_capacity(0);
        registry.end(TRACE, SpanId::from_bytes([5; 8]));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_clones_share_entries() {
        let registry = TransactionRegistry::new();
        let clone = registry.clone();
        let span_id = SpanId::from_bytes([2; 8]);

        clone.publish(TRACE, span_id, attributes("checkout"));
        assert!(registry.get(TRACE, span_id).is_some());

        registry.clear();
        assert!(clone.is_empty());
    }

    #[test]
    fn test_processor_shutdown_clears_registry() {
        let registry = TransactionRegistry::new();
        registry.publish(TRACE, SpanId::from_bytes([3; 8]), attributes("checkout"));

        let processor = registry.span_processor("svc", TransactionConfig::default());
        assert!(processor.shutdown().is_ok());
        assert!(processor.registry().is_empty());
    }

    #[test]
    fn test_keep_last_transaction_values() {
        let config = TransactionConfig::default();
        let mut attributes = vec![
            KeyValue::new("transaction", "batch"),
            KeyValue::new("transaction.distributed", "batch"),
            KeyValue::new("http.method", "GET"),
            KeyValue::new("transaction", "flow1"),
            KeyValue::new("transaction.root", true),
        ];

        keep_last_transaction_values(&mut attributes, &config);

        assert_eq!(
            attributes,
            vec![
                KeyValue::new("transaction.distributed", "batch"),
                KeyValue::new("http.method", "GET"),
                KeyValue::new("transaction", "flow1"),
                KeyValue::new("transaction.root", true),
            ]
        );
    }
}
