//! # transaction-tracing
//!
//! Enrichment for OpenTelemetry traces along two independent axes.
//!
//! - **Statement parameterization**: database spans named after their SQL
//!   statement get one name per query shape instead of one per literal value.
//! - **Transaction correlation**: every span carries the logical transaction it
//!   belongs to, so calls of the same business operation can be grouped even
//!   across services.
//!
//! ## Quick Start
//!
//! ```rust
//! use opentelemetry::trace::{Tracer, TracerProvider};
//! use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
//! use opentelemetry_sdk::Resource;
//! use transaction_tracing::{format_span_name, Dialect, TransactionSampler};
//!
//! let resource = Resource::builder().with_service_name("checkout").build();
//! let sampler = TransactionSampler::new(Sampler::AlwaysOn, &resource)?;
//!
//! let provider = SdkTracerProvider::builder()
//!     .with_span_processor(sampler.span_processor())
//!     .with_sampler(sampler)
//!     .with_resource(resource)
//!     .build();
//!
//! let name = format_span_name(Dialect::MySql, "query", "SELECT * FROM carts WHERE id = 42");
//! assert_eq!(name, "SELECT * FROM carts WHERE id = ?");
//!
//! provider.tracer("checkout").in_span(name, |_cx| {
//!     // ...
//! });
//! # Ok::<(), transaction_tracing::ConfigError>(())
//! ```
//!
//! ## Span Attributes
//!
//! | Attribute | Description |
//! |-----------|-------------|
//! | `transaction` | Logical transaction the span belongs to |
//! | `transaction.distributed` | Outermost transaction, stable across services |
//! | `transaction.root` | `true` on the span that opened `transaction` |
//! | `transaction.sampler.version` | Version of this library |
//!
//! Keys can be changed through [`TransactionConfig`].
//!
//! To export spans, wrap the exporting processor in the transaction span
//! processor, `sampler.span_processor().with_inner(batch_processor)`, so a span
//! renamed with [`TransactionSampler::start_new_transaction`] is exported with
//! a single `transaction` value.

mod config;
#[cfg(feature = "sea-orm")]
mod connection;
mod error;
mod parser;
mod registry;
mod sampler;
mod transaction;

pub use config::{
    TransactionConfig, DISTRIBUTED_TRANSACTION_KEY, DISTRIBUTED_TRANSACTION_TRACE_STATE_KEY,
    TRANSACTION_KEY, TRANSACTION_ROOT_KEY, TRANSACTION_SERVICE_TRACE_STATE_KEY,
    TRANSACTION_TRACE_STATE_KEY, VERSION_KEY,
};
#[cfg(feature = "sea-orm")]
pub use connection::{operation_name, TracedConnection, TracingExt};
pub use error::{ConfigError, ParseError, UnknownDialect};
pub use parser::{format_span_name, normalize, Dialect, PLACEHOLDER};
pub use registry::{TransactionRegistry, TransactionSpanProcessor, DEFAULT_ENDED_SPAN_CAPACITY};
pub use sampler::{TransactionSampler, TransactionSamplerBuilder};
pub use transaction::{
    is_entry_kind, resolve, Boundary, BoundaryReason, ParentSpan, ParentTransaction,
    TransactionAttributes,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        format_span_name, normalize, Dialect, TransactionConfig, TransactionRegistry,
        TransactionSampler,
    };
    #[cfg(feature = "sea-orm")]
    pub use crate::{TracedConnection, TracingExt};
}
