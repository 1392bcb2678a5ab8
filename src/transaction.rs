//! Transaction attributes and the boundary decision.

use std::fmt;

use opentelemetry::trace::{SpanKind, TraceState};
use opentelemetry::{KeyValue, Value};

use crate::config::{
    TransactionConfig, DISTRIBUTED_TRANSACTION_TRACE_STATE_KEY, TRANSACTION_SERVICE_TRACE_STATE_KEY,
    TRANSACTION_TRACE_STATE_KEY,
};

/// Transaction correlation attached to a span at creation.
///
/// A span either inherits its parent's attributes unchanged, or opens a new
/// boundary where `transaction` is the span's own name and `root` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionAttributes {
    /// Logical operation currently in progress.
    pub transaction: String,
    /// Transaction name at the outermost boundary, stable across remote hops.
    pub distributed: String,
    /// Whether this span opened `transaction`.
    pub root: bool,
    /// Service of the span that opened `transaction`, when known.
    pub service: Option<String>,
}

impl TransactionAttributes {
    /// Attributes of a span opening a new transaction boundary.
    ///
    /// `distributed` carries forward the outermost transaction when one is known.
    pub fn new_boundary(name: &str, distributed: Option<&str>, service: &str) -> Self {
        Self {
            transaction: name.to_string(),
            distributed: distributed.unwrap_or(name).to_string(),
            root: true,
            service: Some(service.to_string()),
        }
    }

    /// Attributes of a child continuing this transaction.
    pub fn inherit(&self) -> Self {
        Self {
            root: false,
            ..self.clone()
        }
    }

    /// View of these attributes as seen from a child span.
    pub fn as_parent(&self) -> ParentTransaction {
        ParentTransaction {
            transaction: Some(self.transaction.clone()),
            distributed: Some(self.distributed.clone()),
            service: self.service.clone(),
        }
    }

    /// Span attributes for this transaction. `root` is only emitted when set.
    pub fn to_key_values(&self, config: &TransactionConfig) -> Vec<KeyValue> {
        let mut attributes = vec![
            KeyValue::new(config.transaction_key.clone(), self.transaction.clone()),
            KeyValue::new(config.distributed_key.clone(), self.distributed.clone()),
        ];
        if self.root {
            attributes.push(KeyValue::new(config.root_key.clone(), true));
        }
        attributes
    }

    /// Recover transaction attributes from a span's attribute set.
    ///
    /// Returns `None` when the set carries no transaction name.
    pub fn from_key_values(attributes: &[KeyValue], config: &TransactionConfig) -> Option<Self> {
        let mut transaction = None;
        let mut distributed = None;
        let mut root = false;
        for kv in attributes {
            if kv.key == config.transaction_key {
                transaction = non_empty_string(&kv.value);
            } else if kv.key == config.distributed_key {
                distributed = non_empty_string(&kv.value);
            } else if kv.key == config.root_key {
                root = matches!(kv.value, Value::Bool(true));
            }
        }

        let transaction = transaction?;
        Some(Self {
            distributed: distributed.unwrap_or_else(|| transaction.clone()),
            transaction,
            root,
            service: None,
        })
    }

    /// Write this transaction into `trace_state`.
    ///
    /// Entries the trace state rejects (for example names containing `,` or
    /// `=`) are skipped and the remaining entries are still written.
    pub fn insert_into_trace_state(&self, trace_state: &TraceState) -> TraceState {
        let mut entries = vec![
            (TRANSACTION_TRACE_STATE_KEY, self.transaction.as_str()),
            (DISTRIBUTED_TRANSACTION_TRACE_STATE_KEY, self.distributed.as_str()),
        ];
        if let Some(service) = &self.service {
            entries.push((TRANSACTION_SERVICE_TRACE_STATE_KEY, service.as_str()));
        }

        entries
            .into_iter()
            .fold(trace_state.clone(), |state, (key, value)| {
                match state.insert(key, value) {
                    Ok(updated) => updated,
                    Err(_) => {
                        tracing::debug!(
                            target: "transaction_tracing",
                            key = key,
                            value = value,
                            "Value rejected by trace state, entry skipped"
                        );
                        state
                    }
                }
            })
    }
}

/// What a parent span exposes about its transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParentTransaction {
    pub transaction: Option<String>,
    pub distributed: Option<String>,
    pub service: Option<String>,
}

impl ParentTransaction {
    /// Read the transaction entries of a propagated trace state.
    pub fn from_trace_state(trace_state: &TraceState) -> Self {
        let get = |key: &str| {
            trace_state
                .get(key)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        Self {
            transaction: get(TRANSACTION_TRACE_STATE_KEY),
            distributed: get(DISTRIBUTED_TRANSACTION_TRACE_STATE_KEY),
            service: get(TRANSACTION_SERVICE_TRACE_STATE_KEY),
        }
    }

    /// Whether no transaction entry was found.
    pub fn is_empty(&self) -> bool {
        self.transaction.is_none() && self.distributed.is_none()
    }
}

/// The parent of a span being created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParentSpan {
    /// The parent context was extracted from another process.
    pub remote: bool,
    pub transaction: ParentTransaction,
}

/// Why a span opened a new transaction boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryReason {
    NoParent,
    RemoteParent,
    EntryKind,
    NoParentTransaction,
    OtherService,
}

impl BoundaryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BoundaryReason::NoParent => "no_parent",
            BoundaryReason::RemoteParent => "remote_parent",
            BoundaryReason::EntryKind => "entry_kind",
            BoundaryReason::NoParentTransaction => "no_parent_transaction",
            BoundaryReason::OtherService => "other_service",
        }
    }
}

impl fmt::Display for BoundaryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of the boundary decision for one span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    Inherited,
    Opened(BoundaryReason),
}

/// Spans representing entry into this service from the outside.
pub fn is_entry_kind(kind: &SpanKind) -> bool {
    matches!(kind, SpanKind::Server | SpanKind::Consumer)
}

/// Decide whether a new span continues its parent's transaction or opens a
/// new boundary, and compute its attributes.
pub fn resolve(
    parent: Option<&ParentSpan>,
    name: &str,
    kind: &SpanKind,
    service: &str,
) -> (Boundary, TransactionAttributes) {
    let Some(parent) = parent else {
        return (
            Boundary::Opened(BoundaryReason::NoParent),
            TransactionAttributes::new_boundary(name, None, service),
        );
    };

    let reason = if parent.remote {
        Some(BoundaryReason::RemoteParent)
    } else if is_entry_kind(kind) {
        Some(BoundaryReason::EntryKind)
    } else if parent.transaction.transaction.is_none() {
        Some(BoundaryReason::NoParentTransaction)
    } else if parent
        .transaction
        .service
        .as_deref()
        .is_some_and(|owner| owner != service)
    {
        Some(BoundaryReason::OtherService)
    } else {
        None
    };

    let inherited = &parent.transaction;
    match (reason, &inherited.transaction) {
        (None, Some(transaction)) => (
            Boundary::Inherited,
            TransactionAttributes {
                transaction: transaction.clone(),
                distributed: inherited
                    .distributed
                    .clone()
                    .unwrap_or_else(|| transaction.clone()),
                root: false,
                service: inherited.service.clone(),
            },
        ),
        (reason, _) => (
            Boundary::Opened(reason.unwrap_or(BoundaryReason::NoParentTransaction)),
            TransactionAttributes::new_boundary(name, inherited.distributed.as_deref(), service),
        ),
    }
}

fn non_empty_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.as_str().is_empty() => Some(s.as_str().to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVICE: &str = "checkout-service";

    fn local_parent(transaction: &str, distributed: &str) -> ParentSpan {
        ParentSpan {
            remote: false,
            transaction: ParentTransaction {
                transaction: Some(transaction.to_string()),
                distributed: Some(distributed.to_string()),
                service: Some(SERVICE.to_string()),
            },
        }
    }

    #[test]
    fn test_no_parent_opens_root() {
        let (boundary, attributes) = resolve(None, "GET /cart", &SpanKind::Server, SERVICE);
        assert_eq!(boundary, Boundary::Opened(BoundaryReason::NoParent));
        assert_eq!(attributes.transaction, "GET /cart");
        assert_eq!(attributes.distributed, "GET /cart");
        assert!(attributes.root);
        assert_eq!(attributes.service.as_deref(), Some(SERVICE));
    }

    #[test]
    fn test_local_internal_child_inherits() {
        let parent = local_parent("checkout", "checkout");
        let (boundary, attributes) =
            resolve(Some(&parent), "load cart", &SpanKind::Internal, SERVICE);
        assert_eq!(boundary, Boundary::Inherited);
        assert_eq!(attributes.transaction, "checkout");
        assert_eq!(attributes.distributed, "checkout");
        assert!(!attributes.root);
    }

    #[test]
    fn test_client_and_producer_kinds_inherit() {
        let parent = local_parent("checkout", "storefront");
        for kind in [SpanKind::Client, SpanKind::Producer, SpanKind::Internal] {
            let (boundary, attributes) = resolve(Some(&parent), "call", &kind, SERVICE);
            assert_eq!(boundary, Boundary::Inherited);
            assert_eq!(attributes.transaction, "checkout");
            assert_eq!(attributes.distributed, "storefront");
        }
    }

    #[test]
    fn test_entry_kinds_open_boundary_and_keep_distributed() {
        let parent = local_parent("checkout", "storefront");
        for kind in [SpanKind::Server, SpanKind::Consumer] {
            let (boundary, attributes) = resolve(Some(&parent), "process order", &kind, SERVICE);
            assert_eq!(boundary, Boundary::Opened(BoundaryReason::EntryKind));
            assert_eq!(attributes.transaction, "process order");
            assert_eq!(attributes.distributed, "storefront");
            assert!(attributes.root);
        }
    }

    #[test]
    fn test_remote_parent_opens_boundary() {
        let mut parent = local_parent("checkout", "storefront");
        parent.remote = true;
        let (boundary, attributes) = resolve(Some(&parent), "reserve", &SpanKind::Internal, SERVICE);
        assert_eq!(boundary, Boundary::Opened(BoundaryReason::RemoteParent));
        assert_eq!(attributes.transaction, "reserve");
        assert_eq!(attributes.distributed, "storefront");
        assert!(attributes.root);
    }

    #[test]
    fn test_remote_parent_without_transaction_starts_distributed() {
        let parent = ParentSpan {
            remote: true,
            transaction: ParentTransaction::default(),
        };
        let (_, attributes) = resolve(Some(&parent), "reserve", &SpanKind::Server, SERVICE);
        assert_eq!(attributes.distributed, "reserve");
    }

    #[test]
    fn test_parent_without_transaction_opens_boundary() {
        let parent = ParentSpan::default();
        let (boundary, attributes) = resolve(Some(&parent), "job", &SpanKind::Internal, SERVICE);
        assert_eq!(boundary, Boundary::Opened(BoundaryReason::NoParentTransaction));
        assert!(attributes.root);
        assert_eq!(attributes.transaction, "job");
    }

    #[test]
    fn test_other_service_opens_boundary() {
        let mut parent = local_parent("checkout", "checkout");
        parent.transaction.service = Some("billing".to_string());
        let (boundary, attributes) = resolve(Some(&parent), "charge", &SpanKind::Internal, SERVICE);
        assert_eq!(boundary, Boundary::Opened(BoundaryReason::OtherService));
        assert_eq!(attributes.transaction, "charge");
        assert_eq!(attributes.distributed, "checkout");
    }

    #[test]
    fn test_unknown_parent_service_inherits() {
        let mut parent = local_parent("checkout", "checkout");
        parent.transaction.service = None;
        let (boundary, _) = resolve(Some(&parent), "child", &SpanKind::Internal, SERVICE);
        assert_eq!(boundary, Boundary::Inherited);
    }

    #[test]
    fn test_key_values_round_trip_through_span_attributes() {
        let config = TransactionConfig::default();
        let attributes = TransactionAttributes::new_boundary("checkout", Some("storefront"), SERVICE);
        let key_values = attributes.to_key_values(&config);
        assert_eq!(key_values.len(), 3);

        let recovered = TransactionAttributes::from_key_values(&key_values, &config).unwrap();
        assert_eq!(recovered.transaction, "checkout");
        assert_eq!(recovered.distributed, "storefront");
        assert!(recovered.root);
        assert_eq!(recovered.service, None);
    }

    #[test]
    fn test_inherited_attributes_omit_root() {
        let config = TransactionConfig::default();
        let parent = TransactionAttributes::new_boundary("checkout", None, SERVICE);
        let key_values = parent.inherit().to_key_values(&config);
        assert_eq!(key_values.len(), 2);
        assert!(key_values.iter().all(|kv| kv.key != config.root_key));
    }

    #[test]
    fn test_from_key_values_requires_transaction() {
        let config = TransactionConfig::default();
        let key_values = [KeyValue::new("http.route", "/cart")];
        assert!(TransactionAttributes::from_key_values(&key_values, &config).is_none());
    }

    #[test]
    fn test_trace_state_round_trip() {
        let attributes = TransactionAttributes::new_boundary("checkout", Some("storefront"), SERVICE);
        let trace_state = attributes.insert_into_trace_state(&TraceState::default());

        let parent = ParentTransaction::from_trace_state(&trace_state);
        assert_eq!(parent.transaction.as_deref(), Some("checkout"));
        assert_eq!(parent.distributed.as_deref(), Some("storefront"));
        assert_eq!(parent.service.as_deref(), Some(SERVICE));
    }

    #[test]
    fn test_trace_state_skips_invalid_values() {
        let attributes = TransactionAttributes::new_boundary("a=b", Some("storefront"), SERVICE);
        let trace_state = attributes.insert_into_trace_state(&TraceState::default());

        let parent = ParentTransaction::from_trace_state(&trace_state);
        assert_eq!(parent.transaction, None);
        assert_eq!(parent.distributed.as_deref(), Some("storefront"));
    }
}
