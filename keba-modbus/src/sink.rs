//! Metric sink interface and register-to-gauge dispatch.

use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use crate::registers::{RegisterSpec, RegisterTable};

/// Receiver of decoded register values.
///
/// Implementations overwrite the named gauge on every `set`; nothing
/// accumulates across calls.
pub trait MetricSink: Send + Sync {
    fn set(&self, name: &str, labels: &[(&str, &str)], value: f64);

    /// Called once after every fully completed poll cycle.
    fn cycle_completed(&self, _summary: &CycleSummary) {}
}

impl<S: MetricSink + ?Sized> MetricSink for Arc<S> {
    fn set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        (**self).set(name, labels, value);
    }

    fn cycle_completed(&self, summary: &CycleSummary) {
        (**self).cycle_completed(summary);
    }
}

/// Outcome of a completed poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleSummary {
    pub registers_read: usize,
    pub duration: Duration,
}

/// A raw value read for one register during one cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegisterReading<'a> {
    pub spec: &'a RegisterSpec,
    pub raw_value: i32,
}

impl RegisterReading<'_> {
    /// The scaled value to publish.
    pub fn value(&self) -> f64 {
        self.spec.scale_value(self.raw_value)
    }
}

/// Publish one reading to `sink`.
pub fn publish<S: MetricSink + ?Sized>(sink: &S, reading: &RegisterReading<'_>) {
    let value = reading.value();
    trace!(
        address = reading.spec.address,
        metric = reading.spec.metric,
        raw = reading.raw_value,
        value,
        "Publishing register"
    );
    sink.set(reading.spec.metric, &reading.spec.labels(), value);
}

/// Publish a raw value by register address. Addresses not in `table` are ignored.
///
/// Returns whether anything was published.
pub fn publish_raw<S: MetricSink + ?Sized>(
    table: &RegisterTable,
    sink: &S,
    address: u16,
    raw_value: i32,
) -> bool {
    match table.lookup(address) {
        Some(spec) => {
            publish(sink, &RegisterReading { spec, raw_value });
            true
        }
        None => false,
    }
}
