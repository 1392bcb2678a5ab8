//! Transaction correlation sampler.

use opentelemetry::trace::{
    Link, SamplingDecision, SamplingResult, SpanKind, TraceContextExt, TraceId,
};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::trace::ShouldSample;
use opentelemetry_sdk::Resource;
use opentelemetry_semantic_conventions as semconv;

use crate::config::TransactionConfig;
use crate::error::ConfigError;
use crate::registry::{TransactionRegistry, TransactionSpanProcessor};
use crate::transaction::{resolve, Boundary, ParentSpan, ParentTransaction, TransactionAttributes};

/// OpenTelemetry sampler that attaches transaction correlation to every span.
///
/// Wraps an adapted sampler: the adapted sampler still decides whether a span
/// is sampled, while this sampler adds `transaction`, `transaction.distributed`
/// and, on spans opening a transaction, `transaction.root`. Spans the adapted
/// sampler drops are recorded instead so their correlation attributes remain
/// visible.
///
/// # Example
///
/// ```rust
/// use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
/// use opentelemetry_sdk::Resource;
/// use transaction_tracing::TransactionSampler;
///
/// let resource = Resource::builder().with_service_name("checkout").build();
/// let sampler = TransactionSampler::new(Sampler::AlwaysOn, &resource)?;
///
/// let provider = SdkTracerProvider::builder()
///     .with_span_processor(sampler.span_processor())
///     .with_sampler(sampler)
///     .with_resource(resource)
///     .build();
/// # Ok::<(), transaction_tracing::ConfigError>(())
/// ```
#[derive(Debug, Clone)]
pub struct TransactionSampler {
    adapted: Box<dyn ShouldSample>,
    service: String,
    config: TransactionConfig,
    registry: TransactionRegistry,
}

impl TransactionSampler {
    /// Wrap `adapted`, resolving the service name from `resource`.
    pub fn new<S>(adapted: S, resource: &Resource) -> Result<Self, ConfigError>
    where
        S: ShouldSample + 'static,
    {
        Self::builder()
            .adapted_sampler(adapted)
            .resource(resource)
            .build()
    }

    /// Start configuring a sampler.
    pub fn builder() -> TransactionSamplerBuilder {
        TransactionSamplerBuilder::default()
    }

    /// Service name stamped on the transactions this sampler opens.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Attribute keys and options in use.
    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Registry the sampler reads parent transactions from.
    pub fn registry(&self) -> &TransactionRegistry {
        &self.registry
    }

    /// Span processor publishing started spans into this sampler's registry.
    ///
    /// Wrap the exporting processor with
    /// [`TransactionSpanProcessor::with_inner`] so exported spans carry a
    /// single `transaction` value after
    /// [`start_new_transaction`](Self::start_new_transaction).
    pub fn span_processor(&self) -> TransactionSpanProcessor {
        self.registry
            .span_processor(self.service.clone(), self.config.clone())
    }

    /// Force `span` to open a new transaction named `name`.
    ///
    /// Children started afterwards inherit the new transaction. The
    /// distributed transaction of the span is left as it was. The previous
    /// `transaction` value stays on the live span; it is dropped from the
    /// exported span by a [`TransactionSpanProcessor`] wrapping the exporter.
    pub fn start_new_transaction<'a, S>(&self, span: &'a mut S, name: &str) -> &'a mut S
    where
        S: opentelemetry::trace::Span,
    {
        span.set_attribute(KeyValue::new(
            self.config.transaction_key.clone(),
            name.to_string(),
        ));
        span.set_attribute(KeyValue::new(self.config.root_key.clone(), true));

        let trace_id = span.span_context().trace_id();
        let span_id = span.span_context().span_id();
        if span.is_recording() && span.span_context().is_valid() {
            let distributed = self
                .registry
                .get(trace_id, span_id)
                .map(|attributes| attributes.distributed);
            let attributes =
                TransactionAttributes::new_boundary(name, distributed.as_deref(), &self.service);
            self.registry.publish(trace_id, span_id, attributes);
        }

        tracing::debug!(
            target: "transaction_tracing",
            transaction = name,
            span_id = ?span_id,
            "Started new transaction"
        );
        span
    }

    fn parent_span(&self, parent_context: Option<&Context>) -> Option<ParentSpan> {
        let cx = parent_context.filter(|cx| cx.has_active_span())?;
        let span = cx.span();
        let span_context = span.span_context();
        let remote = span_context.is_remote();

        let transaction = if remote {
            ParentTransaction::from_trace_state(span_context.trace_state())
        } else {
            self.registry
                .get(span_context.trace_id(), span_context.span_id())
                .map(|attributes| attributes.as_parent())
                .unwrap_or_else(|| ParentTransaction::from_trace_state(span_context.trace_state()))
        };

        Some(ParentSpan {
            remote,
            transaction,
        })
    }
}

impl ShouldSample for TransactionSampler {
    fn should_sample(
        &self,
        parent_context: Option<&Context>,
        trace_id: TraceId,
        name: &str,
        span_kind: &SpanKind,
        attributes: &[KeyValue],
        links: &[Link],
    ) -> SamplingResult {
        let adapted = self.adapted.should_sample(
            parent_context,
            trace_id,
            name,
            span_kind,
            attributes,
            links,
        );

        let parent = self.parent_span(parent_context);
        let (boundary, transaction) = resolve(parent.as_ref(), name, span_kind, &self.service);

        tracing::trace!(
            target: "transaction_tracing",
            span = name,
            transaction = %transaction.transaction,
            distributed = %transaction.distributed,
            boundary = ?boundary,
            "Resolved span transaction"
        );

        let mut merged = adapted.attributes;
        merged.extend(transaction.to_key_values(&self.config));
        merged.push(KeyValue::new(
            self.config.version_key.clone(),
            self.config.version.clone(),
        ));

        let trace_state = match boundary {
            Boundary::Opened(_) if self.config.propagate_trace_state => {
                transaction.insert_into_trace_state(&adapted.trace_state)
            }
            _ => adapted.trace_state,
        };

        let decision = match adapted.decision {
            SamplingDecision::Drop => SamplingDecision::RecordOnly,
            decision => decision,
        };

        SamplingResult {
            decision,
            attributes: merged,
            trace_state,
        }
    }
}

/// Builder for [`TransactionSampler`].
#[derive(Debug, Default)]
pub struct TransactionSamplerBuilder {
    adapted: Option<Box<dyn ShouldSample>>,
    service: Option<String>,
    config: TransactionConfig,
    registry: Option<TransactionRegistry>,
}

impl TransactionSamplerBuilder {
    /// The sampler making the sample/drop decision.
    pub fn adapted_sampler<S>(mut self, sampler: S) -> Self
    where
        S: ShouldSample + 'static,
    {
        self.adapted = Some(Box::new(sampler));
        self
    }

    /// Resolve the service name from the `service.name` resource attribute.
    pub fn resource(mut self, resource: &Resource) -> Self {
        self.service = resource
            .get(&opentelemetry::Key::from_static_str(
                semconv::resource::SERVICE_NAME,
            ))
            .map(|value| value.as_str().into_owned());
        self
    }

    /// Set the service name directly instead of reading it from a resource.
    pub fn service_name(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Replace the default attribute keys and options.
    pub fn config(mut self, config: TransactionConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an existing registry, for instance between several tracer
    /// providers in one process.
    pub fn registry(mut self, registry: TransactionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Build the sampler, failing when the adapted sampler or the service
    /// name is missing.
    pub fn build(self) -> Result<TransactionSampler, ConfigError> {
        let Some(adapted) = self.adapted else {
            tracing::warn!(
                target: "transaction_tracing",
                "Transaction sampler requires an adapted sampler"
            );
            return Err(ConfigError::MissingSampler);
        };

        let service = match self.service {
            Some(service) if !service.trim().is_empty() => service,
            _ => {
                tracing::warn!(
                    target: "transaction_tracing",
                    "Transaction sampler requires a service name"
                );
                return Err(ConfigError::MissingServiceName);
            }
        };

        Ok(TransactionSampler {
            adapted,
            service,
            config: self.config,
            registry: self.registry.unwrap_or_default(),
        })
    }
}
