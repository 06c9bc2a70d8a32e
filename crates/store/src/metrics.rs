//! Metrics sink consumed by the store.
//!
//! The sink is an optional collaborator; the default discards everything.

use std::time::Duration;

/// Receives store-level measurements. All methods default to no-ops so sinks
/// implement only what they care about.
pub trait StoreMetrics: Send + Sync {
    fn record_append_duration(&self, _elapsed: Duration) {}

    fn record_append_events(&self, _count: usize) {}

    fn record_read_duration(&self, _elapsed: Duration) {}

    fn record_read_events(&self, _count: usize) {}

    fn record_error(&self, _op: &str, _kind: &str) {}
}

/// The default sink: discards all measurements.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl StoreMetrics for NoopMetrics {}
