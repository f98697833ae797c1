//! Gauge registry backing the `/metrics` endpoint.
//!
//! Every metric of the register table is registered up front, so a scrape
//! before the first poll cycle already lists all series at zero.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use chrono::{DateTime, Utc};
use keba_modbus::{CycleSummary, MetricSink, RegisterTable};
use parking_lot::RwLock;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use tracing::{debug, trace};

type F64Gauge = Gauge<f64, AtomicU64>;
type Labels = Vec<(String, String)>;

/// The gauge(s) behind one metric name.
#[derive(Debug)]
enum Series {
    Single(F64Gauge),
    Labelled(Family<Labels, F64Gauge>),
}

impl Series {
    fn set(&self, labels: &[(&str, &str)], value: f64) {
        match self {
            Series::Single(gauge) => {
                gauge.set(value);
            }
            Series::Labelled(family) => {
                family.get_or_create(&to_owned_labels(labels)).set(value);
            }
        }
    }
}

fn to_owned_labels(labels: &[(&str, &str)]) -> Labels {
    labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Exporter bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct ExporterStatus {
    /// Fully completed poll cycles.
    pub cycles_completed: u64,
    /// Gauge updates applied.
    pub values_published: u64,
    /// Updates for metric names the registry does not know.
    pub values_ignored: u64,
    /// When the last cycle completed.
    pub last_cycle_at: Option<DateTime<Utc>>,
    /// How long the last cycle took.
    pub last_cycle_duration: Option<Duration>,
}

/// Prometheus gauges for one charging station.
pub struct GaugeRegistry {
    registry: Registry,
    series: HashMap<&'static str, Series>,
    poll_cycles: Counter,
    last_poll_timestamp: F64Gauge,
    poll_duration: F64Gauge,
    status: RwLock<ExporterStatus>,
}

/// Create a shareable registry handle.
pub type SharedRegistry = Arc<GaugeRegistry>;

impl GaugeRegistry {
    /// Register a gauge for every metric in `table`, named `<prefix>_<metric>`.
    pub fn new(table: &RegisterTable, prefix: &str) -> Self {
        let mut registry = if prefix.is_empty() {
            Registry::default()
        } else {
            Registry::with_prefix(prefix)
        };

        let mut series = HashMap::new();
        for metric in table.metrics() {
            // The registry appends its own full stop to help texts.
            let help = metric.help.trim_end_matches('.');

            let entry = if metric.phases.is_empty() {
                let gauge = F64Gauge::default();
                registry.register(metric.name, help, gauge.clone());
                Series::Single(gauge)
            } else {
                let family = Family::<Labels, F64Gauge>::default();
                for phase in &metric.phases {
                    drop(family.get_or_create(&to_owned_labels(&[(
                        keba_modbus::registers::PHASE_LABEL,
                        phase.as_str(),
                    )])));
                }
                registry.register(metric.name, help, family.clone());
                Series::Labelled(family)
            };

            series.insert(metric.name, entry);
        }

        let poll_cycles = Counter::default();
        let last_poll_timestamp = F64Gauge::default();
        let poll_duration = F64Gauge::default();

        let exporter = registry.sub_registry_with_prefix("exporter");
        exporter.register(
            "poll_cycles",
            "Completed poll cycles",
            poll_cycles.clone(),
        );
        exporter.register(
            "last_poll_timestamp_seconds",
            "Unix time of the last completed poll cycle",
            last_poll_timestamp.clone(),
        );
        exporter.register(
            "poll_duration_seconds",
            "Duration of the last completed poll cycle",
            poll_duration.clone(),
        );

        debug!(metrics = series.len(), prefix, "Gauge registry initialized");

        Self {
            registry,
            series,
            poll_cycles,
            last_poll_timestamp,
            poll_duration,
            status: RwLock::new(ExporterStatus::default()),
        }
    }

    /// Number of register metrics (not counting exporter self-metrics).
    pub fn metric_count(&self) -> usize {
        self.series.len()
    }

    /// Whether at least one poll cycle has completed.
    pub fn is_ready(&self) -> bool {
        self.status.read().cycles_completed > 0
    }

    pub fn status(&self) -> ExporterStatus {
        self.status.read().clone()
    }

    /// Render all metrics in OpenMetrics text format.
    pub fn render(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

impl MetricSink for GaugeRegistry {
    fn set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        match self.series.get(name) {
            Some(series) => {
                series.set(labels, value);
                self.status.write().values_published += 1;
            }
            None => {
                trace!(metric = name, "Ignoring value for unknown metric");
                self.status.write().values_ignored += 1;
            }
        }
    }

    fn cycle_completed(&self, summary: &CycleSummary) {
        let now = Utc::now();

        self.poll_cycles.inc();
        self.last_poll_timestamp
            .set(now.timestamp_millis() as f64 / 1000.0);
        self.poll_duration.set(summary.duration.as_secs_f64());

        let mut status = self.status.write();
        status.cycles_completed += 1;
        status.last_cycle_at = Some(now);
        status.last_cycle_duration = Some(summary.duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keba_modbus::publish_raw;

    /// Find the sample for `name` carrying `labels` and parse its value.
    fn sample(output: &str, name: &str, labels: &str) -> Option<f64> {
        output
            .lines()
            .filter(|line| !line.starts_with('#'))
            .filter(|line| {
                line.strip_prefix(name)
                    .is_some_and(|rest| rest.starts_with(' ') || rest.starts_with('{'))
            })
            .find(|line| line.contains(labels))
            .and_then(|line| line.split_whitespace().last())
            .and_then(|value| value.parse().ok())
    }

    fn registry() -> GaugeRegistry {
        GaugeRegistry::new(&RegisterTable::keba(), "keba")
    }

    #[test]
    fn test_all_series_present_before_first_cycle() {
        let registry = registry();
        let output = registry.render().unwrap();

        assert_eq!(registry.metric_count(), 14);
        assert_eq!(sample(&output, "keba_charging_state", ""), Some(0.0));
        assert_eq!(sample(&output, "keba_charged_energy_Wh", ""), Some(0.0));
        for phase in ["1", "2", "3"] {
            let labels = format!("phase=\"{phase}\"");
            assert_eq!(
                sample(&output, "keba_voltage_phase_V", &labels),
                Some(0.0)
            );
            assert_eq!(
                sample(&output, "keba_charging_current_phase_mAh", &labels),
                Some(0.0)
            );
        }
        assert!(!registry.is_ready());
    }

    #[test]
    fn test_help_text_from_register_table() {
        let output = registry().render().unwrap();

        assert!(output.contains(
            "# HELP keba_charging_state The register 1000 contains the state of the charging station.\n"
        ));
        assert!(output.contains("# TYPE keba_charging_state gauge"));
        assert!(!output.contains(".."));
    }

    #[test]
    fn test_publish_scaled_values() {
        let registry = registry();
        let table = RegisterTable::keba();

        publish_raw(&table, &registry, 1000, 3);
        publish_raw(&table, &registry, 1036, 550);
        publish_raw(&table, &registry, 1502, 87);
        publish_raw(&table, &registry, 1042, 231);

        let output = registry.render().unwrap();
        assert_eq!(sample(&output, "keba_charging_state", ""), Some(3.0));
        assert_eq!(sample(&output, "keba_total_energy_counter_Wh", ""), Some(55.0));
        assert_eq!(sample(&output, "keba_charged_energy_Wh", ""), Some(8.7));
        assert_eq!(
            sample(&output, "keba_voltage_phase_V", "phase=\"2\""),
            Some(231.0)
        );
        assert_eq!(
            sample(&output, "keba_voltage_phase_V", "phase=\"1\""),
            Some(0.0)
        );
        assert_eq!(registry.status().values_published, 4);
    }

    #[test]
    fn test_set_overwrites() {
        let registry = registry();

        registry.set("active_power_mW", &[], 11_000.0);
        registry.set("active_power_mW", &[], 7_400.0);

        let output = registry.render().unwrap();
        assert_eq!(sample(&output, "keba_active_power_mW", ""), Some(7400.0));
    }

    #[test]
    fn test_unknown_metric_ignored() {
        let registry = registry();
        let before = registry.render().unwrap();

        registry.set("rfid_card", &[], 42.0);

        assert_eq!(registry.render().unwrap(), before);
        assert_eq!(registry.status().values_ignored, 1);
        assert_eq!(registry.status().values_published, 0);
    }

    #[test]
    fn test_cycle_completed_updates_self_metrics() {
        let registry = registry();
        registry.cycle_completed(&CycleSummary {
            registers_read: 18,
            duration: Duration::from_millis(1500),
        });

        let output = registry.render().unwrap();
        assert_eq!(
            sample(&output, "keba_exporter_poll_cycles_total", ""),
            Some(1.0)
        );
        assert_eq!(
            sample(&output, "keba_exporter_poll_duration_seconds", ""),
            Some(1.5)
        );
        let timestamp = sample(&output, "keba_exporter_last_poll_timestamp_seconds", "").unwrap();
        assert!(timestamp > 1_600_000_000.0);

        assert!(registry.is_ready());
        let status = registry.status();
        assert_eq!(status.cycles_completed, 1);
        assert_eq!(status.last_cycle_duration, Some(Duration::from_millis(1500)));
        assert!(status.last_cycle_at.is_some());
    }

    #[test]
    fn test_custom_prefix() {
        let registry = GaugeRegistry::new(&RegisterTable::keba(), "wallbox");
        let output = registry.render().unwrap();

        assert_eq!(sample(&output, "wallbox_cable_state", ""), Some(0.0));
        assert!(!output.contains("keba_"));
    }
}
