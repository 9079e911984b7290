//! Metrics registry for vnode observability
//!
//! Provides OpenTelemetry metrics for:
//! - Reconcile queues (adds, retries, drops, handler latency)
//! - Node heartbeat (ping results, lease renewals, status updates)
//! - Pod synchronization (provider operations, status updates)
//!
//! Instruments are no-ops until a meter provider is installed by
//! [`crate::telemetry::init_telemetry`].

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("vnode"));

// ============================================================================
// Queue Metrics
// ============================================================================

/// Counter of items accepted by a queue
///
/// Labels:
/// - `queue`: queue name
pub static QUEUE_ADDS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("vnode_queue_adds_total")
        .with_description("Total number of items added to a reconcile queue")
        .with_unit("{items}")
        .build()
});

/// Counter of failed handler invocations that were requeued
///
/// Labels:
/// - `queue`: queue name
pub static QUEUE_RETRIES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("vnode_queue_retries_total")
        .with_description("Total number of handler failures requeued for retry")
        .with_unit("{items}")
        .build()
});

/// Counter of items given up on or rejected after shutdown
///
/// Labels:
/// - `queue`: queue name
/// - `reason`: exhausted, shutdown
pub static QUEUE_DROPS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("vnode_queue_drops_total")
        .with_description("Total number of items dropped by a reconcile queue")
        .with_unit("{items}")
        .build()
});

/// Histogram of handler duration
///
/// Labels:
/// - `queue`: queue name
/// - `result`: success, error
pub static QUEUE_HANDLER_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("vnode_queue_handler_duration_seconds")
        .with_description("Duration of reconcile handler invocations in seconds")
        .with_unit("s")
        .build()
});

// ============================================================================
// Node Metrics
// ============================================================================

/// Counter of provider pings
///
/// Labels:
/// - `result`: success, error
pub static NODE_PINGS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("vnode_node_pings_total")
        .with_description("Total number of provider health pings")
        .with_unit("{pings}")
        .build()
});

/// Counter of lease renewals
///
/// Labels:
/// - `result`: success, error
pub static LEASE_RENEWALS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("vnode_lease_renewals_total")
        .with_description("Total number of node lease renewals")
        .with_unit("{renewals}")
        .build()
});

/// Counter of node status patches
///
/// Labels:
/// - `result`: success, error
pub static NODE_STATUS_UPDATES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("vnode_node_status_updates_total")
        .with_description("Total number of node status updates")
        .with_unit("{updates}")
        .build()
});

// ============================================================================
// Pod Metrics
// ============================================================================

/// Counter of provider operations
///
/// Labels:
/// - `operation`: create, update, delete
/// - `result`: success, error
pub static POD_PROVIDER_OPERATIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("vnode_pod_provider_operations_total")
        .with_description("Total number of pod operations sent to the provider")
        .with_unit("{operations}")
        .build()
});

/// Counter of pod status writes to the API server
///
/// Labels:
/// - `result`: success, error
pub static POD_STATUS_UPDATES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("vnode_pod_status_updates_total")
        .with_description("Total number of pod status updates")
        .with_unit("{updates}")
        .build()
});

// ============================================================================
// Helper Types
// ============================================================================

/// Outcome label shared by most counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The operation succeeded
    Success,
    /// The operation failed
    Error,
}

impl Outcome {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    /// Outcome of a `Result`
    pub fn of<T, E>(result: &Result<T, E>) -> Self {
        if result.is_ok() {
            Self::Success
        } else {
            Self::Error
        }
    }

    /// Single-element label set `result=<outcome>`
    pub fn labels(&self) -> [KeyValue; 1] {
        [KeyValue::new("result", self.as_str())]
    }
}

/// Pod operation forwarded to the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodOperation {
    /// CreatePod
    Create,
    /// UpdatePod
    Update,
    /// DeletePod
    Delete,
}

impl PodOperation {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Times one handler invocation for a named queue
pub struct HandlerTimer {
    queue: String,
    start: std::time::Instant,
}

impl HandlerTimer {
    /// Start timing a handler invocation
    pub fn start(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            start: std::time::Instant::now(),
        }
    }

    /// Record completion with the given outcome
    pub fn finish(self, outcome: Outcome) {
        QUEUE_HANDLER_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("queue", self.queue),
                KeyValue::new("result", outcome.as_str()),
            ],
        );
    }
}

/// Record a provider operation
pub fn record_pod_operation(operation: PodOperation, outcome: Outcome) {
    POD_PROVIDER_OPERATIONS.add(
        1,
        &[
            KeyValue::new("operation", operation.as_str()),
            KeyValue::new("result", outcome.as_str()),
        ],
    );
}
