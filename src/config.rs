//! Configuration for transaction correlation.

use opentelemetry::Key;

/// Attribute key carrying the current transaction name.
pub const TRANSACTION_KEY: &str = "transaction";
/// Attribute key marking the span that opened the current transaction.
pub const TRANSACTION_ROOT_KEY: &str = "transaction.root";
/// Attribute key carrying the outermost transaction name.
pub const DISTRIBUTED_TRANSACTION_KEY: &str = "transaction.distributed";
/// Attribute key carrying the library version.
pub const VERSION_KEY: &str = "transaction.sampler.version";

/// Trace state key carrying the current transaction name.
pub const TRANSACTION_TRACE_STATE_KEY: &str = "transaction";
/// Trace state key carrying the outermost transaction name.
pub const DISTRIBUTED_TRANSACTION_TRACE_STATE_KEY: &str = "transaction_distributed";
/// Trace state key carrying the service that opened the current transaction.
pub const TRANSACTION_SERVICE_TRACE_STATE_KEY: &str = "transaction_service";

/// Configuration options for the transaction sampler.
///
/// # Example
///
/// ```rust
/// use transaction_tracing::TransactionConfig;
///
/// let config = TransactionConfig::default()
///     .with_transaction_key("app.transaction")
///     .with_trace_state_propagation(true);
/// ```
#[derive(Debug, Clone)]
pub struct TransactionConfig {
    /// Attribute key for the transaction name.
    /// Default: `transaction`
    pub transaction_key: Key,

    /// Attribute key for the root marker, only emitted when `true`.
    /// Default: `transaction.root`
    pub root_key: Key,

    /// Attribute key for the distributed transaction name.
    /// Default: `transaction.distributed`
    pub distributed_key: Key,

    /// Attribute key for the version marker.
    /// Default: `transaction.sampler.version`
    pub version_key: Key,

    /// Value of the version marker.
    /// Default: the crate version
    pub version: String,

    /// Whether new transaction boundaries are also written into the trace state,
    /// so services that only see the propagation header can continue the
    /// distributed transaction.
    /// Default: `false`
    pub propagate_trace_state: bool,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            transaction_key: Key::from_static_str(TRANSACTION_KEY),
            root_key: Key::from_static_str(TRANSACTION_ROOT_KEY),
            distributed_key: Key::from_static_str(DISTRIBUTED_TRANSACTION_KEY),
            version_key: Key::from_static_str(VERSION_KEY),
            version: env!("CARGO_PKG_VERSION").to_string(),
            propagate_trace_state: false,
        }
    }
}

impl TransactionConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the attribute key for the transaction name.
    pub fn with_transaction_key(mut self, key: impl Into<Key>) -> Self {
        self.transaction_key = key.into();
        self
    }

    /// Set the attribute key for the root marker.
    pub fn with_root_key(mut self, key: impl Into<Key>) -> Self {
        self.root_key = key.into();
        self
    }

    /// Set the attribute key for the distributed transaction name.
    pub fn with_distributed_key(mut self, key: impl Into<Key>) -> Self {
        self.distributed_key = key.into();
        self
    }

    /// Set the version marker attribute.
    pub fn with_version(mut self, key: impl Into<Key>, version: impl Into<String>) -> Self {
        self.version_key = key.into();
        self.version = version.into();
        self
    }

    /// Enable or disable writing new transaction boundaries into the trace state.
    pub fn with_trace_state_propagation(mut self, enabled: bool) -> Self {
        self.propagate_trace_state = enabled;
        self
    }
}
